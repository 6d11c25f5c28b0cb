// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use bytes::Bytes;

use super::{Negotiated, State, Step, ensure_steppable, final_token, output_limit};
use crate::{
    config::{Negotiation, ServerConfig, service_name},
    error::{Error, PolicyError, ProviderResultExt},
    identity::resolve_authentication_id,
    negotiation::{Layer, LayerAnnouncement, LayerPolicy, LayerSelection, MAX_BUFFER_SIZE},
    provider::{ContextFlags, CredentialUsage, NameType, SecurityProvider},
    security_layer::SecurityLayer,
};

/// The accepting side of the mechanism.
///
/// Once authenticated, the server reports the initiator's canonical identity and, if the
/// initiator delegated them, its credentials.
pub struct ServerSession<P: SecurityProvider> {
    provider: P,
    config: ServerConfig,
    policy: LayerPolicy,
    state: State,
    credential: Option<P::Credential>,
    server_name: Option<P::Name>,
    context: Option<P::Context>,
    peer: Option<P::Name>,
    flags: ContextFlags,
    delegated: Option<P::Credential>,
    authentication_id: Option<String>,
    negotiated: Option<Negotiated>,
}

impl<P: SecurityProvider> ServerSession<P> {
    /// Create a session for the given configuration.
    ///
    /// # Errors
    ///
    /// Fails without contacting the provider if the security properties can never be
    /// satisfied, or if the service or hostname is missing.
    pub fn new(provider: P, config: ServerConfig) -> Result<Self, Error> {
        let policy = LayerPolicy::new(&config.security, config.confidentiality_ssf)?;
        service_name(&config.service, &config.hostname)?;
        Ok(Self {
            provider,
            config,
            policy,
            state: State::AuthNegotiation,
            credential: None,
            server_name: None,
            context: None,
            peer: None,
            flags: ContextFlags::empty(),
            delegated: None,
            authentication_id: None,
            negotiated: None,
        })
    }

    /// The configuration the session was created with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The outcome of the negotiation, once authenticated.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// The initiator's name as reported by the provider, once the context is established.
    pub fn peer_name(&self) -> Option<&P::Name> {
        self.peer.as_ref()
    }

    /// The service name the acceptor credential was acquired for.
    pub fn server_name(&self) -> Option<&P::Name> {
        self.server_name.as_ref()
    }

    /// Credentials the initiator delegated, if any.
    pub fn delegated_credential(&self) -> Option<&P::Credential> {
        self.delegated.as_ref()
    }

    /// Take ownership of the delegated credentials, leaving none behind.
    pub fn take_delegated_credential(&mut self) -> Option<P::Credential> {
        self.delegated.take()
    }

    /// Process the initiator's latest token.
    pub fn step(&mut self, input: &[u8]) -> Result<Step, Error> {
        ensure_steppable(self.state)?;
        match self.dispatch(input) {
            Ok((next, step)) => {
                debug_assert!(next >= self.state);
                self.state = next;
                Ok(step)
            }
            Err(error) => {
                self.teardown();
                Err(error)
            }
        }
    }

    /// Convert the authenticated session into its security layer.
    pub fn into_security_layer(self) -> Result<SecurityLayer<P>, Error> {
        match (self.state, self.context, self.negotiated) {
            (State::Authenticated, Some(context), Some(negotiated)) => {
                Ok(SecurityLayer::new(self.provider, context, &negotiated))
            }
            _ => Err(Error::NotAuthenticated),
        }
    }

    fn dispatch(&mut self, input: &[u8]) -> Result<(State, Step), Error> {
        match self.state {
            State::AuthNegotiation => self.negotiate(input),
            State::LayerCapabilityAnnounce => self.announce(),
            State::LayerSelectionRequest => self.finalize(input),
            State::Authenticated | State::Failed => Err(Error::SessionFailed),
        }
    }

    fn teardown(&mut self) {
        self.context = None;
        self.peer = None;
        self.server_name = None;
        self.credential = None;
        self.delegated = None;
        self.negotiated = None;
        self.state = State::Failed;
    }

    fn negotiate(&mut self, input: &[u8]) -> Result<(State, Step), Error> {
        // Some initiators open with an empty response; ask them for a real token.
        if input.is_empty() && self.context.is_none() {
            return Ok((State::AuthNegotiation, Step::Continue(Bytes::new())));
        }
        if self.credential.is_none() {
            let service = service_name(&self.config.service, &self.config.hostname)?;
            let server_name = self
                .provider
                .import_name(&service, NameType::HostBasedService)
                .during("import_name")?;
            let credential = self
                .provider
                .acquire_credential(Some(&server_name), CredentialUsage::Accept, None)
                .during("acquire_credential")?;
            self.server_name = Some(server_name);
            self.credential = Some(credential);
        }

        let credential = self.credential.as_ref().ok_or(Error::SessionFailed)?;
        let accepted = self
            .provider
            .accept(self.context.take(), credential, input)
            .during("accept")?;
        self.context = Some(accepted.context);
        self.flags = accepted.flags;
        if !accepted.complete {
            return Ok((State::AuthNegotiation, Step::Continue(accepted.output)));
        }

        let peer = accepted.peer.ok_or(Error::MissingPeerName)?;
        let authentication_id = resolve_authentication_id(&self.provider, &peer)?;
        self.peer = Some(peer);
        self.authentication_id = Some(authentication_id);
        self.delegated = accepted.delegated;

        match self.config.negotiation {
            Negotiation::Explicit => Ok((
                State::LayerCapabilityAnnounce,
                Step::Continue(accepted.output),
            )),
            Negotiation::Implicit => {
                let layer = if self.flags.contains(ContextFlags::CONFIDENTIALITY) {
                    Layer::Confidentiality
                } else if self.flags.contains(ContextFlags::INTEGRITY) {
                    Layer::Integrity
                } else {
                    Layer::None
                };
                if !self.policy.permits(layer) {
                    return Err(PolicyError::LayerRejected { layer }.into());
                }
                self.finish(layer, MAX_BUFFER_SIZE, None)?;
                Ok((State::Authenticated, Step::Done(final_token(accepted.output))))
            }
        }
    }

    // The initiator's reply to the final establishment token carries nothing.
    fn announce(&mut self) -> Result<(State, Step), Error> {
        let announcement = LayerAnnouncement {
            layers: self.policy.offered()?,
            max_buffer: self.config.security.max_buffer_size.min(MAX_BUFFER_SIZE),
        }
        .encode();
        let context = self.context.as_mut().ok_or(Error::SessionFailed)?;
        let token = self
            .provider
            .wrap(context, false, &announcement)
            .during("wrap")?;
        Ok((State::LayerSelectionRequest, Step::Continue(token)))
    }

    fn finalize(&mut self, input: &[u8]) -> Result<(State, Step), Error> {
        let context = self.context.as_mut().ok_or(Error::SessionFailed)?;
        let unwrapped = self.provider.unwrap(context, input).during("unwrap")?;
        let selection = LayerSelection::decode(&unwrapped.plaintext)?;
        if !self.policy.offered()?.contains(selection.layer.bit()) {
            return Err(PolicyError::LayerRejected {
                layer: selection.layer,
            }
            .into());
        }
        self.finish(
            selection.layer,
            selection.max_buffer,
            selection.authorization_id,
        )?;
        Ok((State::Authenticated, Step::Done(None)))
    }

    fn finish(
        &mut self,
        layer: Layer,
        peer_max: u32,
        authorization_id: Option<String>,
    ) -> Result<(), Error> {
        let context = self.context.as_ref().ok_or(Error::SessionFailed)?;
        let max_output = output_limit(&self.provider, context, layer, peer_max)?;
        let authentication_id = self.authentication_id.clone().unwrap_or_default();
        self.negotiated = Some(Negotiated {
            layer,
            ssf: self.policy.strength(layer),
            max_output,
            max_input: self.config.security.max_buffer_size.min(MAX_BUFFER_SIZE),
            authorization_id: authorization_id.unwrap_or_else(|| authentication_id.clone()),
            authentication_id,
            delegated: self.flags.contains(ContextFlags::DELEGATE) && self.delegated.is_some(),
        });
        Ok(())
    }
}

impl<P: SecurityProvider> std::fmt::Debug for ServerSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("state", &self.state)
            .field("service", &self.config.service)
            .field("hostname", &self.config.hostname)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mechanism::tests::server_config,
        negotiation::LayerSet,
        provider::{loopback::tests::provider, status},
    };

    #[test]
    fn empty_opening_response_is_answered() -> anyhow::Result<()> {
        let mut session = ServerSession::new(provider(), server_config())?;
        assert_eq!(session.step(b"")?, Step::Continue(Bytes::new()));
        assert_eq!(session.state(), State::AuthNegotiation);

        Ok(())
    }

    #[test]
    fn defective_token_reports_provider_status() -> anyhow::Result<()> {
        let mut session = ServerSession::new(provider(), server_config())?;
        let error = session.step(b"LBI1 nonsense").unwrap_err();
        assert_eq!(
            error.provider_status().map(|(major, _)| major),
            Some(status::DEFECTIVE_TOKEN)
        );
        assert_eq!(session.state(), State::Failed);

        Ok(())
    }

    #[test]
    fn zero_buffer_forbids_required_layers() -> anyhow::Result<()> {
        let config = ServerConfig {
            confidentiality_ssf: 0,
            security: crate::config::SecurityProperties {
                min_ssf: 1,
                max_ssf: 1,
                max_buffer_size: 0,
                ..Default::default()
            },
            ..server_config()
        };
        let session = ServerSession::new(provider(), config);
        // A minimum above what any layer provides is caught up front.
        assert!(matches!(
            session,
            Err(Error::Policy(PolicyError::Unsatisfiable { .. }))
        ));

        let config = ServerConfig {
            security: crate::config::SecurityProperties {
                min_ssf: 1,
                max_buffer_size: 0,
                ..Default::default()
            },
            ..server_config()
        };
        let policy = LayerPolicy::new(&config.security, config.confidentiality_ssf)?;
        assert_eq!(policy.offered(), Err(PolicyError::LayerForbidden));
        assert_eq!(
            LayerPolicy::new(&Default::default(), 56)?.offered()?,
            LayerSet::all()
        );

        Ok(())
    }
}
