// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::sync::Arc;

use bytes::BytesMut;
use sasl_gssapi::{
    ClientSession, ErrorKind, ServerSession, State, Step,
    config::{ClientConfig, Negotiation, SecurityProperties, ServerConfig},
    error::ExchangeError,
    exchange::{authenticate_client, authenticate_server, receive_message, send_message},
    negotiation::Layer,
    provider::{
        SecurityProvider, Serialized,
        loopback::{LoopbackProvider, WRAP_OVERHEAD, minor},
        status,
    },
};
use tokio::io::duplex;

fn realm() -> LoopbackProvider {
    LoopbackProvider::new("EXAMPLE.COM")
        .with_principal("alice", None)
        .with_principal("bob", Some("hunter2"))
        .with_default_principal("alice")
}

fn client_config() -> ClientConfig {
    ClientConfig {
        service: "imap".to_string(),
        hostname: "mail.example.com".to_string(),
        ..Default::default()
    }
}

fn server_config() -> ServerConfig {
    ServerConfig {
        service: "imap".to_string(),
        hostname: "mail.example.com".to_string(),
        ..Default::default()
    }
}

// Drive both sessions to completion without any transport.
fn run<P: SecurityProvider>(
    client: &mut ClientSession<P>,
    server: &mut ServerSession<P>,
) -> Result<(), sasl_gssapi::Error> {
    let mut reply = Vec::new();
    loop {
        let token = match client.step(&reply)? {
            Step::Continue(token) => token,
            Step::Done(token) => token.unwrap_or_default(),
        };
        if client.state() == State::Authenticated && token.is_empty() {
            return Ok(());
        }
        match server.step(&token)? {
            Step::Continue(token) => reply = token.to_vec(),
            Step::Done(Some(token)) => reply = token.to_vec(),
            Step::Done(None) => return Ok(()),
        }
    }
}

#[tokio::test]
async fn handshake_and_protected_traffic() -> anyhow::Result<()> {
    let provider = Arc::new(realm().with_rounds(3));
    let (mut client_stream, mut server_stream) = duplex(4096);
    let client = ClientSession::new(provider.clone(), client_config())?;
    let server = ServerSession::new(provider, server_config())?;

    let (client, server) = tokio::join!(
        authenticate_client(&mut client_stream, client),
        authenticate_server(&mut server_stream, server, |_| {}),
    );
    let (client_result, mut client_layer) = client?;
    let (server_result, mut server_layer) = server?;
    assert_eq!(client_result.layer, Layer::Confidentiality);
    assert_eq!(server_result.layer, Layer::Confidentiality);
    assert_eq!(server_result.authentication_id, "alice");
    assert_eq!(client_result.authentication_id, "alice@EXAMPLE.COM");

    let mut server_buffer = BytesMut::new();
    for message in ["a001 SELECT INBOX", "a002 FETCH 1 BODY[]", ""] {
        send_message(&mut client_stream, &mut client_layer, message.as_bytes()).await?;
        let received =
            receive_message(&mut server_stream, &mut server_layer, &mut server_buffer).await?;
        assert_eq!(received.as_deref(), Some(message.as_bytes()));
    }

    Ok(())
}

// A message larger than the peer's buffer arrives as several frames.
#[tokio::test]
async fn large_messages_are_split() -> anyhow::Result<()> {
    let security = SecurityProperties {
        max_buffer_size: 64,
        ..Default::default()
    };
    let provider = realm();
    let (mut client_stream, mut server_stream) = duplex(4096);
    let client = ClientSession::new(
        provider.clone(),
        ClientConfig {
            security: security.clone(),
            ..client_config()
        },
    )?;
    let server = ServerSession::new(
        provider,
        ServerConfig {
            security,
            ..server_config()
        },
    )?;
    let (client, server) = tokio::join!(
        authenticate_client(&mut client_stream, client),
        authenticate_server(&mut server_stream, server, |_| {}),
    );
    let (client_result, mut client_layer) = client?;
    let (_, mut server_layer) = server?;
    assert_eq!(client_result.max_output, 64 - WRAP_OVERHEAD);

    let message = vec![b'x'; 200];
    send_message(&mut client_stream, &mut client_layer, &message).await?;
    drop(client_stream);

    let mut buffer = BytesMut::new();
    let mut frames = Vec::new();
    while let Some(frame) =
        receive_message(&mut server_stream, &mut server_layer, &mut buffer).await?
    {
        assert!(frame.len() <= client_result.max_output as usize);
        frames.push(frame);
    }
    assert_eq!(frames.len(), 4);
    assert_eq!(frames.concat(), message);

    Ok(())
}

#[test]
fn integrity_frames_carry_plaintext() -> anyhow::Result<()> {
    let provider = realm();
    let mut client = ClientSession::new(
        provider.clone(),
        ClientConfig {
            security: SecurityProperties {
                max_ssf: 1,
                ..Default::default()
            },
            ..client_config()
        },
    )?;
    let mut server = ServerSession::new(provider, server_config())?;
    run(&mut client, &mut server)?;
    assert_eq!(client.negotiated().map(|n| n.layer), Some(Layer::Integrity));
    assert_eq!(server.negotiated().map(|n| n.ssf), Some(1));

    let mut client_layer = client.into_security_layer()?;
    let mut server_layer = server.into_security_layer()?;
    let frame = client_layer.encode(b"visible")?;
    assert!(frame.ends_with(b"visible"));
    let mut tampered = frame.to_vec();
    let last = tampered.len() - 1;
    tampered[last] = b'?';
    let error = server_layer.decode(&tampered).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Provider);
    assert_eq!(
        error.provider_status().map(|(major, _)| major),
        Some(status::BAD_SIG)
    );

    Ok(())
}

// An outer channel strong enough on its own leaves the data untouched.
#[test]
fn external_strength_selects_no_layer() -> anyhow::Result<()> {
    let security = SecurityProperties {
        external_ssf: 256,
        ..Default::default()
    };
    let provider = realm();
    let mut client = ClientSession::new(
        provider.clone(),
        ClientConfig {
            security: security.clone(),
            ..client_config()
        },
    )?;
    let mut server = ServerSession::new(
        provider,
        ServerConfig {
            security,
            ..server_config()
        },
    )?;
    run(&mut client, &mut server)?;
    assert_eq!(server.negotiated().map(|n| n.layer), Some(Layer::None));

    let mut client_layer = client.into_security_layer()?;
    let mut server_layer = server.into_security_layer()?;
    let frame = client_layer.encode(b"as is")?;
    assert_eq!(&frame[..], b"as is");
    assert_eq!(server_layer.decode(&frame)?, vec![frame]);

    Ok(())
}

#[test]
fn implicit_handshake_skips_announcement() -> anyhow::Result<()> {
    let provider = realm();
    let mut client = ClientSession::new(
        provider.clone(),
        ClientConfig {
            negotiation: Negotiation::Implicit,
            ..client_config()
        },
    )?;
    let mut server = ServerSession::new(
        provider,
        ServerConfig {
            negotiation: Negotiation::Implicit,
            ..server_config()
        },
    )?;
    let Step::Continue(first) = client.step(b"")? else {
        anyhow::bail!("expected an establishment token");
    };
    let Step::Done(Some(last)) = server.step(&first)? else {
        anyhow::bail!("expected the final establishment token");
    };
    assert_eq!(client.step(&last)?, Step::Done(None));
    assert_eq!(client.state(), State::Authenticated);
    assert_eq!(server.state(), State::Authenticated);

    Ok(())
}

// Sessions on several threads share one provider through the process-wide lock.
#[test]
fn concurrent_sessions_share_serialized_provider() -> anyhow::Result<()> {
    let provider = Serialized::new(Arc::new(realm().with_rounds(2)));
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let provider = provider.clone();
                scope.spawn(move || -> anyhow::Result<String> {
                    let mut client = ClientSession::new(provider.clone(), client_config())?;
                    let mut server = ServerSession::new(provider, server_config())?;
                    run(&mut client, &mut server)?;
                    let negotiated = server
                        .negotiated()
                        .ok_or_else(|| anyhow::anyhow!("not authenticated"))?;
                    Ok(negotiated.authentication_id.clone())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("session thread panicked"))
            .collect::<Vec<_>>()
    });
    for result in results {
        assert_eq!(result?, "alice");
    }

    Ok(())
}

#[tokio::test]
async fn password_is_used_without_cached_credentials() -> anyhow::Result<()> {
    let provider = realm();
    let config = ClientConfig {
        authentication_id: Some("bob".to_string()),
        ..client_config()
    };
    let (mut client_stream, mut server_stream) = duplex(4096);
    let client = ClientSession::new(provider.clone(), config)?.with_password("hunter2");
    let server = ServerSession::new(provider, server_config())?;
    let (client, server) = tokio::join!(
        authenticate_client(&mut client_stream, client),
        authenticate_server(&mut server_stream, server, |_| {}),
    );
    assert_eq!(client?.0.authentication_id, "bob@EXAMPLE.COM");
    assert_eq!(server?.0.authentication_id, "bob");

    Ok(())
}

// The client's first token targets a service the server isn't; both sides fail.
#[tokio::test]
async fn wrong_service_fails_both_sides() -> anyhow::Result<()> {
    let provider = realm();
    let (mut client_stream, mut server_stream) = duplex(4096);
    let client = ClientSession::new(provider.clone(), client_config())?;
    let server = ServerSession::new(
        provider,
        ServerConfig {
            service: "ldap".to_string(),
            ..server_config()
        },
    )?;
    let (client, server) = tokio::join!(
        authenticate_client(&mut client_stream, client),
        authenticate_server(&mut server_stream, server, |_| {}),
    );

    let Err(ExchangeError::Mechanism(error)) = server else {
        anyhow::bail!("expected the server session to fail");
    };
    assert_eq!(
        error.provider_status(),
        Some((status::FAILURE, minor::WRONG_PRINCIPAL))
    );
    assert!(matches!(client, Err(ExchangeError::PeerFailed { .. })));

    Ok(())
}
