// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Session configuration.
//!
//! All configuration types can be loaded from TOML; the [`Display`] implementations render the
//! configuration back to TOML, which is handy as an example configuration file.

use std::fmt::Display;
#[cfg(feature = "cli")]
use std::{env, path::PathBuf};

#[cfg(feature = "cli")]
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The strength a 56-bit DES-class cipher provides.
pub const DEFAULT_CONFIDENTIALITY_SSF: u32 = 56;

/// Security requirements for the protection layer.
///
/// Strength factors are compared against the layer strengths after subtracting
/// `external_ssf`, so a session running inside an adequately strong TLS channel can get away
/// with no protection layer at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProperties {
    /// The minimum acceptable strength of the combined channel.
    pub min_ssf: u32,
    /// The maximum strength to negotiate.
    pub max_ssf: u32,
    /// The strength already provided by an outer channel, such as TLS.
    pub external_ssf: u32,
    /// The largest protected frame this side is willing to receive.
    ///
    /// Values above 16777215 are clamped when sent to the peer. A value of 0 forbids
    /// integrity and confidentiality layers.
    pub max_buffer_size: u32,
    /// Request that the initiator's credentials be delegated to the acceptor.
    ///
    /// On the acceptor this marks delegation as expected, and its absence is logged.
    pub delegate_credentials: bool,
}

impl Default for SecurityProperties {
    fn default() -> Self {
        Self {
            min_ssf: 0,
            max_ssf: 256,
            external_ssf: 0,
            max_buffer_size: 65536,
            delegate_credentials: false,
        }
    }
}

/// How the protection layer is agreed on once the security context is established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Negotiation {
    /// The responder announces acceptable layers in an extra round trip and the initiator
    /// selects one.
    #[default]
    Explicit,
    /// The layer follows from the flags of the established context, with no extra tokens.
    Implicit,
}

/// Configuration for the initiating side of the mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The service name of the acceptor, for example "imap" or "ldap".
    pub service: String,
    /// The fully qualified hostname of the acceptor.
    pub hostname: String,
    /// The principal to authenticate as; the provider's default credential is used if unset.
    pub authentication_id: Option<String>,
    /// The identity to act as once authenticated, if different from the authenticated one.
    pub authorization_id: Option<String>,
    /// How to agree on the protection layer.
    pub negotiation: Negotiation,
    /// The strength factor the mechanism's confidentiality layer provides.
    pub confidentiality_ssf: u32,
    /// The protection layer requirements.
    pub security: SecurityProperties,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service: "host".to_string(),
            hostname: "localhost".to_string(),
            authentication_id: None,
            authorization_id: None,
            negotiation: Negotiation::default(),
            confidentiality_ssf: DEFAULT_CONFIDENTIALITY_SSF,
            security: SecurityProperties::default(),
        }
    }
}

impl Display for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

/// Configuration for the accepting side of the mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The service name this server accepts contexts for.
    pub service: String,
    /// The fully qualified hostname of this server.
    pub hostname: String,
    /// How to agree on the protection layer.
    pub negotiation: Negotiation,
    /// The strength factor the mechanism's confidentiality layer provides.
    pub confidentiality_ssf: u32,
    /// The protection layer requirements.
    pub security: SecurityProperties,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: "host".to_string(),
            hostname: "localhost".to_string(),
            negotiation: Negotiation::default(),
            confidentiality_ssf: DEFAULT_CONFIDENTIALITY_SSF,
            security: SecurityProperties::default(),
        }
    }
}

impl Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

/// The host-based service name, `service@hostname`, for the given configuration values.
pub(crate) fn service_name(service: &str, hostname: &str) -> Result<String, Error> {
    if service.is_empty() {
        return Err(Error::Config("the service name must not be empty".to_string()));
    }
    if hostname.is_empty() {
        return Err(Error::Config(
            "the fully qualified hostname must not be empty".to_string(),
        ));
    }
    Ok(format!("{service}@{hostname}"))
}

#[cfg(feature = "cli")]
fn private_load_config<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked.  If the default config doesn't exist, the [`Default`] implementation is returned.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}
