// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{fmt::Display, path::PathBuf};

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use sasl_gssapi::{
    ClientSession, ServerSession,
    config::{ClientConfig, ServerConfig, load_config},
    exchange::{authenticate_client, authenticate_server, receive_message, send_message},
    provider::loopback::LoopbackProvider,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt};

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "sasl-gssapi/loopback.toml";

/// Run the SASL GSSAPI mechanism against an in-process loopback realm.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the configuration file.
    ///
    /// If no path is provided, the configuration file at
    /// $CONFIGURATION_DIRECTORY/sasl-gssapi/loopback.toml is used, if it exists. If it does not
    /// exist, the configuration defaults are used.
    ///
    /// To view the configuration, run the `config` subcommand.
    #[arg(long, short, env = "SASL_GSSAPI_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(
        long,
        env = "SASL_GSSAPI_LOG",
        default_value = "WARN,sasl_gssapi=INFO"
    )]
    log_filter: String,

    /// The number of round trips context establishment takes, overriding the configuration.
    #[arg(long)]
    rounds: Option<u8>,

    /// The password for the client's authentication identity, if it has no cached credentials.
    #[arg(long, env = "SASL_GSSAPI_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Authenticate a client to a server, then send a protected message and echo it back.
    Handshake {
        /// The message the client sends once authenticated.
        #[arg(default_value = "hello")]
        message: String,
    },
    /// See the current configuration, or the defaults if no configuration file is supplied.
    Config,
}

/// A principal registered in the loopback realm.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Principal {
    /// The principal name; the realm is appended if it's missing.
    name: String,
    /// The principal's password. Principals without one have cached credentials.
    password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoopbackConfig {
    /// The name of the loopback realm.
    realm: String,
    /// The principal client sessions use when no authentication identity is configured.
    default_principal: String,
    /// The number of round trips context establishment takes.
    rounds: u8,
    /// Principals known to the realm.
    principals: Vec<Principal>,
    client: ClientConfig,
    server: ServerConfig,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            realm: "EXAMPLE.COM".to_string(),
            default_principal: "alice".to_string(),
            rounds: 1,
            principals: vec![
                Principal {
                    name: "alice".to_string(),
                    password: None,
                },
                Principal {
                    name: "bob".to_string(),
                    password: Some("hunter2".to_string()),
                },
            ],
            client: ClientConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Display for LoopbackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

impl LoopbackConfig {
    fn provider(&self) -> LoopbackProvider {
        self.principals
            .iter()
            .fold(LoopbackProvider::new(&self.realm), |provider, principal| {
                provider.with_principal(&principal.name, principal.password.as_deref())
            })
            .with_default_principal(&self.default_principal)
            .with_rounds(self.rounds)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SASL_GSSAPI_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config =
        load_config::<LoopbackConfig>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;
    if let Some(rounds) = opts.rounds {
        config.rounds = rounds;
    }

    let message = match opts.command {
        Command::Config => {
            println!(
                "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
            );
            return Ok(());
        }
        Command::Handshake { message } => message,
    };

    let provider = config.provider();
    let mut client = ClientSession::new(provider.clone(), config.client.clone())
        .context("The client configuration is invalid")?;
    if let Some(password) = opts.password {
        client = client.with_password(password);
    }
    let server = ServerSession::new(provider, config.server.clone())
        .context("The server configuration is invalid")?;

    let (mut client_stream, mut server_stream) = tokio::io::duplex(64 * 1024);
    let (client, server) = tokio::join!(
        authenticate_client(&mut client_stream, client),
        authenticate_server(&mut server_stream, server, |credential| {
            tracing::info!(
                principal = credential.principal(),
                "The client delegated its credentials"
            );
        }),
    );
    let (client_result, mut client_layer) = client.context("Client authentication failed")?;
    let (server_result, mut server_layer) = server.context("Server authentication failed")?;

    println!(
        "The server authenticated {} (acting as {}) using the {} layer with strength {}",
        server_result.authentication_id,
        server_result.authorization_id,
        server_result.layer,
        server_result.ssf
    );
    println!(
        "The client authenticated as {} and may send up to {} bytes per frame",
        client_result.authentication_id, client_result.max_output
    );

    send_message(&mut client_stream, &mut client_layer, message.as_bytes()).await?;
    let mut server_buffer = BytesMut::new();
    let received = receive_message(&mut server_stream, &mut server_layer, &mut server_buffer)
        .await?
        .context("The client closed the stream before sending its message")?;
    send_message(&mut server_stream, &mut server_layer, &received).await?;

    let mut client_buffer = BytesMut::new();
    let echoed = receive_message(&mut client_stream, &mut client_layer, &mut client_buffer)
        .await?
        .context("The server closed the stream before echoing the message")?;
    println!("Echoed: {}", String::from_utf8_lossy(&echoed));

    Ok(())
}
