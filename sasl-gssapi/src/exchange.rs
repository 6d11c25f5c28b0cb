// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Run a handshake over a byte stream.
//!
//! The sessions in [`mechanism`](crate::mechanism) only transform tokens; this module moves
//! them between peers. Every token travels in a message with a 5-byte header: a status byte
//! followed by the token length as a 32-bit big-endian integer.
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 0 | The sender expects a reply. |
//! | 1 | The sender's session is done. The token may still need processing. |
//! | 2 | The sender's session failed. The token is a UTF-8 reason. |
//!
//! When one side finishes first it sends its final token with status 1 and waits for the
//! peer to answer with an empty status 1 message, so both sides agree on the outcome before
//! application data flows.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::instrument;
use uuid::Uuid;
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned, network_endian::U32,
};

use crate::{
    error::{Error, ExchangeError},
    mechanism::{ClientSession, Negotiated, ServerSession, Step},
    provider::SecurityProvider,
    security_layer::SecurityLayer,
};

/// The largest token accepted from a peer during the handshake.
pub const MAX_TOKEN_LEN: u32 = 1 << 20;

const STATUS_CONTINUE: u8 = 0;
const STATUS_DONE: u8 = 1;
const STATUS_FAILED: u8 = 2;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct MessageHeader {
    status: u8,
    length: U32,
}

/// A handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Message {
    Continue(Bytes),
    Done(Bytes),
    Failed(String),
}

impl Message {
    fn describe(&self) -> &'static str {
        match self {
            Message::Continue(_) => "continue",
            Message::Done(_) => "done",
            Message::Failed(_) => "failed",
        }
    }
}

pub(crate) async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ExchangeError> {
    let (status, body) = match message {
        Message::Continue(token) => (STATUS_CONTINUE, &token[..]),
        Message::Done(token) => (STATUS_DONE, &token[..]),
        Message::Failed(reason) => (STATUS_FAILED, reason.as_bytes()),
    };
    let length = u32::try_from(body.len())
        .ok()
        .filter(|length| *length <= MAX_TOKEN_LEN)
        .ok_or_else(|| {
            ExchangeError::UnexpectedMessage(format!(
                "token of {} bytes exceeds the {MAX_TOKEN_LEN} byte limit",
                body.len()
            ))
        })?;
    let header = MessageHeader {
        status,
        length: length.into(),
    };
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Message, ExchangeError> {
    let mut header = MessageHeader::new_zeroed();
    reader.read_exact(header.as_mut_bytes()).await?;
    let length = header.length.get();
    if length > MAX_TOKEN_LEN {
        return Err(ExchangeError::UnexpectedMessage(format!(
            "peer announced a {length} byte token, more than the {MAX_TOKEN_LEN} byte limit"
        )));
    }
    let mut body = vec![0; length as usize];
    reader.read_exact(&mut body).await?;

    match header.status {
        STATUS_CONTINUE => Ok(Message::Continue(body.into())),
        STATUS_DONE => Ok(Message::Done(body.into())),
        STATUS_FAILED => Ok(Message::Failed(String::from_utf8_lossy(&body).into_owned())),
        other => Err(ExchangeError::UnexpectedMessage(format!(
            "unknown message status {other}"
        ))),
    }
}

// Tell the peer the session is over before reporting the error locally. The peer may
// already be gone, in which case there's nobody left to tell.
async fn abort<S: AsyncWrite + Unpin>(stream: &mut S, error: ExchangeError) -> ExchangeError {
    let reason = error.to_string();
    if let Err(write_error) = write_message(stream, &Message::Failed(reason)).await {
        tracing::debug!(?write_error, "unable to notify the peer of the failure");
    }
    error
}

async fn drive<S, F>(stream: &mut S, mut step: F, initiator: bool) -> Result<(), ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&[u8]) -> Result<Step, Error>,
{
    let mut incoming = if initiator {
        Message::Continue(Bytes::new())
    } else {
        read_message(stream).await?
    };
    let mut round: u32 = 0;

    loop {
        round += 1;
        let (token, peer_done) = match incoming {
            Message::Continue(token) => (token, false),
            Message::Done(token) => (token, true),
            Message::Failed(reason) => return Err(ExchangeError::PeerFailed { reason }),
        };
        let outcome = match step(&token) {
            Ok(outcome) => outcome,
            Err(error) => return Err(abort(stream, error.into()).await),
        };
        tracing::debug!(round, received = token.len(), peer_done, "processed token");

        match (outcome, peer_done) {
            (Step::Continue(reply), false) => {
                write_message(stream, &Message::Continue(reply)).await?;
            }
            (Step::Continue(_), true) => {
                let error = ExchangeError::UnexpectedMessage(
                    "the peer finished while this side still expects tokens".to_string(),
                );
                return Err(abort(stream, error).await);
            }
            (Step::Done(reply), true) => {
                write_message(stream, &Message::Done(reply.unwrap_or_default())).await?;
                return Ok(());
            }
            (Step::Done(reply), false) => {
                write_message(stream, &Message::Done(reply.unwrap_or_default())).await?;
                return match read_message(stream).await? {
                    Message::Done(token) if token.is_empty() => Ok(()),
                    Message::Failed(reason) => Err(ExchangeError::PeerFailed { reason }),
                    other => Err(ExchangeError::UnexpectedMessage(format!(
                        "expected an empty acknowledgement, got a {} message",
                        other.describe()
                    ))),
                };
            }
        }
        incoming = read_message(stream).await?;
    }
}

fn report(role: &'static str, negotiated: &Negotiated) {
    tracing::info!(
        role,
        layer = %negotiated.layer,
        ssf = negotiated.ssf,
        max_output = negotiated.max_output,
        authentication_id = %negotiated.authentication_id,
        authorization_id = %negotiated.authorization_id,
        delegated = negotiated.delegated,
        "authentication complete"
    );
}

/// Authenticate to the peer on the other end of `stream`.
///
/// The client speaks first. On success the negotiated outcome is returned along with the
/// security layer to use for all further traffic on the stream.
#[instrument(skip_all, err, fields(session_id = tracing::field::Empty))]
pub async fn authenticate_client<S, P>(
    stream: &mut S,
    mut session: ClientSession<P>,
) -> Result<(Negotiated, SecurityLayer<P>), ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: SecurityProvider,
{
    tracing::Span::current().record("session_id", Uuid::now_v7().to_string());
    tracing::debug!(
        service = %session.config().service,
        hostname = %session.config().hostname,
        "starting authentication"
    );
    drive(stream, |token| session.step(token), true).await?;

    let negotiated = session
        .negotiated()
        .cloned()
        .ok_or(Error::NotAuthenticated)?;
    if session.config().security.delegate_credentials && !negotiated.delegated {
        tracing::warn!("credential delegation was requested, but the peer did not accept it");
    }
    report("client", &negotiated);
    Ok((negotiated, session.into_security_layer()?))
}

/// Authenticate the peer on the other end of `stream`.
///
/// Credentials the client delegated are handed to `on_delegated` before the session is
/// converted into its security layer.
#[instrument(skip_all, err, fields(session_id = tracing::field::Empty))]
pub async fn authenticate_server<S, P, F>(
    stream: &mut S,
    mut session: ServerSession<P>,
    on_delegated: F,
) -> Result<(Negotiated, SecurityLayer<P>), ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: SecurityProvider,
    F: FnOnce(P::Credential),
{
    tracing::Span::current().record("session_id", Uuid::now_v7().to_string());
    drive(stream, |token| session.step(token), false).await?;

    let negotiated = session
        .negotiated()
        .cloned()
        .ok_or(Error::NotAuthenticated)?;
    if let Some(credential) = session.take_delegated_credential() {
        tracing::debug!("the client delegated its credentials");
        on_delegated(credential);
    } else if session.config().security.delegate_credentials {
        tracing::warn!("credential delegation is expected, but the client did not delegate");
    }
    report("server", &negotiated);
    Ok((negotiated, session.into_security_layer()?))
}

/// Protect `plaintext` and write it to `stream`.
pub async fn send_message<S, P>(
    stream: &mut S,
    layer: &mut SecurityLayer<P>,
    plaintext: &[u8],
) -> Result<(), ExchangeError>
where
    S: AsyncWrite + Unpin,
    P: SecurityProvider,
{
    let frames = layer.encode(plaintext)?;
    stream.write_all(&frames).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the next protected message from `stream`.
///
/// `buffer` holds bytes read past the end of the message; pass the same buffer to every call
/// for a given stream. Returns `None` once the peer closes the stream cleanly.
///
/// With [`Layer::None`](crate::negotiation::Layer::None) there is no framing, and each call
/// returns whatever bytes have arrived.
pub async fn receive_message<S, P>(
    stream: &mut S,
    layer: &mut SecurityLayer<P>,
    buffer: &mut BytesMut,
) -> Result<Option<Bytes>, ExchangeError>
where
    S: AsyncRead + Unpin,
    P: SecurityProvider,
{
    loop {
        if let Some(plaintext) = Decoder::decode(layer, buffer)? {
            return Ok(Some(plaintext));
        }
        if stream.read_buf(buffer).await? == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
            };
        }
    }
}
