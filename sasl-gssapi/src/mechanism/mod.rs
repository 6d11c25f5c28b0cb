// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The mechanism state machine.
//!
//! A session for either role is driven by repeatedly calling `step` with the token most
//! recently received from the peer (an empty slice when there is none) and sending whatever
//! [`Step`] hands back, until the session reports [`Step::Done`]. The session then holds the
//! [`Negotiated`] outcome and can be turned into a [`SecurityLayer`](crate::security_layer::SecurityLayer)
//! to protect application data.
//!
//! The states are visited in order, and never revisited:
//!
//! ```text
//! AuthNegotiation -> LayerCapabilityAnnounce -> LayerSelectionRequest -> Authenticated
//! ```
//!
//! Initiators skip [`State::LayerCapabilityAnnounce`], and with [`Negotiation::Implicit`] both
//! roles go straight from [`State::AuthNegotiation`] to [`State::Authenticated`].
//!
//! Any error other than calling `step` on a finished session is fatal: the security context,
//! names, and credentials the session holds are released immediately and the session moves to
//! [`State::Failed`].
//!
//! [`Negotiation::Implicit`]: crate::config::Negotiation::Implicit

use bytes::Bytes;

use crate::{
    error::{Error, PolicyError, ProviderResultExt},
    negotiation::{Layer, LayerSet},
    provider::{ContextFlags, SecurityProvider},
};

mod client;
mod server;

pub use client::ClientSession;
pub use server::ServerSession;

/// The phases of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// Security context establishment is in progress.
    AuthNegotiation,
    /// The responder is about to announce the layers it accepts.
    LayerCapabilityAnnounce,
    /// The initiator is expected to choose a layer, or the responder awaits that choice.
    LayerSelectionRequest,
    /// Authentication completed and a layer was chosen.
    Authenticated,
    /// The session failed and holds no resources anymore.
    Failed,
}

/// The outcome of a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Step {
    /// Send the token to the peer and call `step` again with its reply.
    Continue(Bytes),
    /// Authentication is complete; send the token to the peer, if there is one.
    Done(Option<Bytes>),
}

/// The result of a completed negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// The protection layer applied to application data.
    pub layer: Layer,
    /// The strength factor of the chosen layer.
    pub ssf: u32,
    /// The largest plaintext to pass to the security layer per frame so that the peer can
    /// receive it.
    pub max_output: u32,
    /// The largest frame the peer was told this side accepts.
    pub max_input: u32,
    /// The canonical identity that authenticated.
    pub authentication_id: String,
    /// The identity to act as.
    pub authorization_id: String,
    /// Whether the initiator's credentials were delegated.
    pub delegated: bool,
}

pub(crate) fn ensure_steppable(state: State) -> Result<(), Error> {
    match state {
        State::Authenticated => Err(Error::AlreadyAuthenticated),
        State::Failed => Err(Error::SessionFailed),
        _ => Ok(()),
    }
}

/// The largest plaintext that still fits in a frame of `peer_max` bytes once wrapped.
///
/// A protection layer that leaves no room for any plaintext cannot be used.
pub(crate) fn output_limit<P: SecurityProvider>(
    provider: &P,
    context: &P::Context,
    layer: Layer,
    peer_max: u32,
) -> Result<u32, Error> {
    if layer == Layer::None {
        return Ok(peer_max);
    }
    let max_input = provider
        .wrap_size_limit(context, layer.is_confidential(), peer_max)
        .during("wrap_size_limit")?;
    // Some providers answer with the wrapped size for `peer_max` bytes of input instead.
    let max_output = if max_input > peer_max {
        peer_max.saturating_sub(max_input - peer_max)
    } else {
        max_input
    };
    if max_output == 0 {
        return Err(PolicyError::PeerBufferTooSmall { layer }.into());
    }
    Ok(max_output)
}

/// The layers a context's flags make available when no announcement is exchanged.
pub(crate) fn implicit_layers(flags: ContextFlags) -> LayerSet {
    let mut layers = LayerSet::NONE;
    if flags.contains(ContextFlags::INTEGRITY) {
        layers |= LayerSet::INTEGRITY;
    }
    if flags.contains(ContextFlags::CONFIDENTIALITY) {
        layers |= LayerSet::CONFIDENTIALITY;
    }
    layers
}

pub(crate) fn final_token(output: Bytes) -> Option<Bytes> {
    (!output.is_empty()).then_some(output)
}
