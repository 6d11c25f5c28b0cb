// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the mechanism sessions, the security layer, and the exchange driver.

use crate::negotiation::{Layer, LayerSet};

/// The token received from the peer is malformed.
///
/// Protocol errors are always fatal to the session. They indicate either a broken peer or
/// data corrupted in transit, and retrying the same exchange will not help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A layer announcement or selection token is shorter than the fixed four bytes.
    #[error("security layer token is {len} bytes long; at least 4 bytes are required")]
    TokenTooShort {
        /// The length of the token that was received.
        len: usize,
    },

    /// A layer selection token must name exactly one known layer.
    #[error("security layer selection {bits:#04x} does not name exactly one security layer")]
    InvalidSelection {
        /// The raw bitmask the peer sent.
        bits: u8,
    },

    /// The authorization identity following the layer selection is not usable.
    #[error("the requested authorization identity is not a valid UTF-8 string without NUL bytes")]
    InvalidAuthorizationId,

    /// A data frame was received with weaker protection than the negotiated layer.
    #[error("received a frame with {received} protection, but {negotiated} was negotiated")]
    InsufficientProtection {
        /// The layer that was negotiated for the session.
        negotiated: Layer,
        /// The protection the frame actually carried.
        received: Layer,
    },

    /// The wrapped message does not fit in the 32-bit frame length prefix.
    #[error("wrapped message of {len} bytes cannot be framed")]
    FrameTooLarge {
        /// The length of the wrapped message.
        len: usize,
    },
}

/// The security layer requested or offered violates local policy.
///
/// These are distinct from [`ProtocolError`]: the peer (or the local configuration) is
/// well-behaved at the wire level, but no acceptable protection can be agreed on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The configured minimum strength is larger than the configured maximum.
    #[error("minimum security strength {min} exceeds the maximum of {max}")]
    InvertedBounds {
        /// The configured minimum strength factor.
        min: u32,
        /// The configured maximum strength factor.
        max: u32,
    },

    /// No layer this mechanism provides can meet the configured minimum.
    #[error(
        "minimum security strength {min} cannot be met; the strongest layer provides {available} \
        on top of the external strength {external}"
    )]
    Unsatisfiable {
        /// The configured minimum strength factor.
        min: u32,
        /// The strength the outer channel already provides.
        external: u32,
        /// The strength of the confidentiality layer.
        available: u32,
    },

    /// A security layer is required, but a maximum buffer size of zero forbids all of them.
    #[error("a security layer is required but the maximum buffer size of 0 forbids one")]
    LayerForbidden,

    /// None of the layers the peer offered is acceptable to local policy.
    #[error("no mutually acceptable security layer; the peer offered {offered:?}")]
    NoAcceptableLayer {
        /// The layers that were available to choose from.
        offered: LayerSet,
    },

    /// The peer's maximum buffer size cannot hold a single wrapped byte of the chosen layer.
    #[error("the peer's maximum buffer size leaves no room for {layer} protected data")]
    PeerBufferTooSmall {
        /// The layer that was chosen.
        layer: Layer,
    },

    /// The peer chose a layer that local policy does not permit.
    #[error("the peer requested the {layer} security layer, which local policy does not permit")]
    LayerRejected {
        /// The layer the peer requested.
        layer: Layer,
    },
}

/// A failure reported by the underlying security provider.
///
/// The major and minor status codes are preserved exactly as the provider reported them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("major status {major:#010x}, minor status {minor:#x}{}", display_message(.message))]
pub struct ProviderError {
    /// The mechanism-independent major status code.
    pub major: u32,
    /// The mechanism-specific minor status code.
    pub minor: u32,
    /// A human-readable description of the status, if the provider offered one.
    pub message: Option<String>,
}

fn display_message(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|message| format!(": {message}"))
        .unwrap_or_default()
}

impl ProviderError {
    /// Create an error from a major and minor status pair.
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            message: None,
        }
    }

    /// Attach a description of the status.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Broad classification of an [`Error`], for callers producing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`ProtocolError`].
    Protocol,
    /// See [`PolicyError`].
    Policy,
    /// See [`ProviderError`].
    Provider,
    /// The session was used incorrectly or misconfigured.
    Usage,
    /// The underlying transport failed.
    Io,
}

/// Errors returned by mechanism sessions and the security layer codec.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer sent a malformed token; the session has been torn down.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No acceptable security layer could be agreed upon; the session has been torn down.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A call into the security provider failed; the session has been torn down.
    ///
    /// This is never retried automatically. The status codes are useful for logging, and
    /// occasionally for deciding whether to retry with fresh credentials.
    #[error("security provider operation '{operation}' failed: {source}")]
    Provider {
        /// The provider operation that failed.
        operation: &'static str,
        /// The status the provider reported.
        #[source]
        source: ProviderError,
    },

    /// The context was established but the provider did not report the peer's name.
    #[error("the security provider did not report a peer name after establishing the context")]
    MissingPeerName,

    /// The session configuration is unusable.
    #[error("invalid session configuration: {0}")]
    Config(String),

    /// The session already completed authentication and cannot be stepped again.
    ///
    /// The session is not torn down; it can still be converted into a security layer.
    #[error("authentication has already completed")]
    AlreadyAuthenticated,

    /// The operation requires a session that completed authentication.
    #[error("authentication has not completed")]
    NotAuthenticated,

    /// The session previously failed and must be discarded.
    #[error("the session failed previously and cannot be used")]
    SessionFailed,

    /// An I/O error occurred while reading or writing frames.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Policy(_) => ErrorKind::Policy,
            Error::Provider { .. } | Error::MissingPeerName => ErrorKind::Provider,
            Error::Config(_)
            | Error::AlreadyAuthenticated
            | Error::NotAuthenticated
            | Error::SessionFailed => ErrorKind::Usage,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// The provider's (major, minor) status, if this is a provider failure.
    pub fn provider_status(&self) -> Option<(u32, u32)> {
        match self {
            Error::Provider { source, .. } => Some((source.major, source.minor)),
            _ => None,
        }
    }
}

/// Attach the failing operation to a provider result.
pub(crate) trait ProviderResultExt<T> {
    fn during(self, operation: &'static str) -> Result<T, Error>;
}

impl<T> ProviderResultExt<T> for Result<T, ProviderError> {
    fn during(self, operation: &'static str) -> Result<T, Error> {
        self.map_err(|source| Error::Provider { operation, source })
    }
}

/// Errors the [`crate::exchange`] driver may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExchangeError {
    /// The local session failed.
    #[error(transparent)]
    Mechanism(#[from] Error),

    /// Reading from or writing to the stream failed.
    ///
    /// The handshake cannot be resumed on the same stream; start over on a new connection.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The peer reported that authentication failed.
    #[error("the peer aborted authentication: {reason}")]
    PeerFailed {
        /// The reason the peer gave.
        reason: String,
    },

    /// The peer sent a message that is not valid at this point of the exchange.
    #[error("unexpected exchange message: {0}")]
    UnexpectedMessage(String),
}
