// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use super::{
    Negotiated, State, Step, ensure_steppable, final_token, implicit_layers, output_limit,
};
use crate::{
    config::{ClientConfig, Negotiation, service_name},
    error::{Error, ProviderResultExt},
    negotiation::{Layer, LayerAnnouncement, LayerPolicy, LayerSelection, MAX_BUFFER_SIZE},
    provider::{ContextFlags, CredentialUsage, NameType, SecurityProvider, status},
    security_layer::SecurityLayer,
};

/// The initiating side of the mechanism.
///
/// # Example
///
/// ```
/// use sasl_gssapi::{
///     config::{ClientConfig, ServerConfig},
///     mechanism::{ClientSession, ServerSession, Step},
///     provider::loopback::LoopbackProvider,
/// };
///
/// # fn main() -> Result<(), sasl_gssapi::error::Error> {
/// let provider = LoopbackProvider::new("EXAMPLE.COM")
///     .with_principal("alice", None)
///     .with_default_principal("alice");
/// let mut client = ClientSession::new(&provider, ClientConfig::default())?;
/// let mut server = ServerSession::new(&provider, ServerConfig::default())?;
///
/// let mut reply = Vec::new();
/// loop {
///     let token = match client.step(&reply)? {
///         Step::Continue(token) => token,
///         Step::Done(token) => token.unwrap_or_default(),
///     };
///     match server.step(&token)? {
///         Step::Continue(token) => reply = token.to_vec(),
///         Step::Done(_) => break,
///     }
/// }
/// assert_eq!(server.negotiated().unwrap().authentication_id, "alice");
/// # Ok(())
/// # }
/// ```
pub struct ClientSession<P: SecurityProvider> {
    provider: P,
    config: ClientConfig,
    password: Option<String>,
    policy: LayerPolicy,
    state: State,
    credential: Option<P::Credential>,
    target: Option<P::Name>,
    context: Option<P::Context>,
    local_name: Option<P::Name>,
    flags: ContextFlags,
    authentication_id: Option<String>,
    authorization_id: Option<String>,
    negotiated: Option<Negotiated>,
}

impl<P: SecurityProvider> ClientSession<P> {
    /// Create a session for the given configuration.
    ///
    /// # Errors
    ///
    /// Fails without contacting the provider if the security properties can never be
    /// satisfied, or if the target service or hostname is missing.
    pub fn new(provider: P, config: ClientConfig) -> Result<Self, Error> {
        let policy = LayerPolicy::new(&config.security, config.confidentiality_ssf)?;
        service_name(&config.service, &config.hostname)?;
        Ok(Self {
            provider,
            config,
            password: None,
            policy,
            state: State::AuthNegotiation,
            credential: None,
            target: None,
            context: None,
            local_name: None,
            flags: ContextFlags::empty(),
            authentication_id: None,
            authorization_id: None,
            negotiated: None,
        })
    }

    /// Use `password` to obtain credentials if none are cached for the authentication identity.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// The configuration the session was created with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The outcome of the negotiation, once authenticated.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// The initiator's own name, once the context is established.
    pub fn local_name(&self) -> Option<&P::Name> {
        self.local_name.as_ref()
    }

    /// Process the acceptor's latest token, or an empty slice if there is none.
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

    #[cfg(test)]
    pub(crate) fn context_mut(&mut self) -> Option<&mut P::Context> {
        self.context.as_mut()
    }

    fn dispatch(&mut self, input: &[u8]) -> Result<(State, Step), Error> {
        match self.state {
            State::AuthNegotiation => self.negotiate(input),
            State::LayerSelectionRequest => self.select_layer(input),
            State::LayerCapabilityAnnounce | State::Authenticated | State::Failed => {
                Err(Error::SessionFailed)
            }
        }
    }

    fn teardown(&mut self) {
        self.context = None;
        self.local_name = None;
        self.target = None;
        self.credential = None;
        self.negotiated = None;
        self.state = State::Failed;
    }

    fn requested_flags(&self) -> ContextFlags {
        let security = &self.config.security;
        let allowed = security.max_ssf.saturating_sub(security.external_ssf);
        let mut flags = ContextFlags::MUTUAL | ContextFlags::SEQUENCE;
        if allowed > 0 {
            flags |= ContextFlags::INTEGRITY;
        }
        if allowed >= self.policy.strength(Layer::Confidentiality) {
            flags |= ContextFlags::CONFIDENTIALITY;
        }
        if security.delegate_credentials {
            flags |= ContextFlags::DELEGATE;
        }
        flags
    }

    fn acquire_credential(&self) -> Result<P::Credential, Error> {
        let name = self
            .config
            .authentication_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| self.provider.import_name(id, NameType::User))
            .transpose()
            .during("import_name")?;

        match self
            .provider
            .acquire_credential(name.as_ref(), CredentialUsage::Initiate, None)
        {
            Err(error) if error.major == status::NO_CRED && self.password.is_some() => self
                .provider
                .acquire_credential(
                    name.as_ref(),
                    CredentialUsage::Initiate,
                    self.password.as_deref(),
                )
                .during("acquire_credential"),
            result => result.during("acquire_credential"),
        }
    }

    fn negotiate(&mut self, input: &[u8]) -> Result<(State, Step), Error> {
        if self.credential.is_none() {
            self.credential = Some(self.acquire_credential()?);
        }
        if self.target.is_none() {
            let target = service_name(&self.config.service, &self.config.hostname)?;
            self.target = Some(
                self.provider
                    .import_name(&target, NameType::HostBasedService)
                    .during("import_name")?,
            );
        }
        // The acceptor never saw our first token; start the context over.
        if input.is_empty() && self.context.is_some() {
            self.context = None;
        }

        let flags = self.requested_flags();
        let target = self.target.as_ref().ok_or(Error::SessionFailed)?;
        let initiated = self
            .provider
            .initiate(
                self.context.take(),
                self.credential.as_ref(),
                target,
                flags,
                (!input.is_empty()).then_some(input),
            )
            .during("initiate")?;
        self.flags = initiated.flags;
        let context = self.context.insert(initiated.context);
        if !initiated.complete {
            return Ok((State::AuthNegotiation, Step::Continue(initiated.output)));
        }

        let local_name = self.provider.local_name(context).during("local_name")?;
        let authentication_id = self
            .provider
            .display_name(&local_name)
            .during("display_name")?;
        self.authorization_id = Some(
            self.config
                .authorization_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| authentication_id.clone()),
        );
        self.authentication_id = Some(authentication_id);
        self.local_name = Some(local_name);

        match self.config.negotiation {
            Negotiation::Explicit => Ok((
                State::LayerSelectionRequest,
                Step::Continue(initiated.output),
            )),
            Negotiation::Implicit => {
                let layer = self.policy.choose(implicit_layers(self.flags))?;
                self.finish(layer, MAX_BUFFER_SIZE)?;
                Ok((State::Authenticated, Step::Done(final_token(initiated.output))))
            }
        }
    }

    fn select_layer(&mut self, input: &[u8]) -> Result<(State, Step), Error> {
        let context = self.context.as_mut().ok_or(Error::SessionFailed)?;
        let unwrapped = self.provider.unwrap(context, input).during("unwrap")?;
        let announcement = LayerAnnouncement::decode(&unwrapped.plaintext)?;
        let layer = self.policy.choose(announcement.layers)?;

        let selection = LayerSelection {
            layer,
            max_buffer: self.config.security.max_buffer_size,
            authorization_id: self
                .config
                .authorization_id
                .clone()
                .filter(|id| !id.is_empty()),
        }
        .encode();
        let token = self
            .provider
            .wrap(context, false, &selection)
            .during("wrap")?;
        self.finish(layer, announcement.max_buffer)?;

        Ok((State::Authenticated, Step::Done(Some(token))))
    }

    fn finish(&mut self, layer: Layer, peer_max: u32) -> Result<(), Error> {
        let context = self.context.as_ref().ok_or(Error::SessionFailed)?;
        let max_output = output_limit(&self.provider, context, layer, peer_max)?;
        self.negotiated = Some(Negotiated {
            layer,
            ssf: self.policy.strength(layer),
            max_output,
            max_input: self.config.security.max_buffer_size.min(MAX_BUFFER_SIZE),
            authentication_id: self.authentication_id.clone().unwrap_or_default(),
            authorization_id: self.authorization_id.clone().unwrap_or_default(),
            delegated: self.flags.contains(ContextFlags::DELEGATE),
        });
        Ok(())
    }
}

impl<P: SecurityProvider> std::fmt::Debug for ClientSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.state)
            .field("service", &self.config.service)
            .field("hostname", &self.config.hostname)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}
