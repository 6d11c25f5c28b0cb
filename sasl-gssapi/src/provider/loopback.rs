// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A deterministic, in-process security provider.
//!
//! The loopback provider simulates a Kerberos-like realm: principals are registered up front,
//! context establishment takes a configurable number of round trips, and wrapped messages are
//! sequence-numbered and checksummed so tampering, reordering, and reflection are detected.
//! It provides no actual security whatsoever.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    Accepted, ContextFlags, CredentialUsage, Initiated, NameType, SecurityProvider, Unwrapped,
    status,
};
use crate::error::ProviderError;

/// Minor status codes reported by the loopback provider.
pub mod minor {
    /// The token is not a loopback token.
    pub const MALFORMED_TOKEN: u32 = 1;
    /// The principal is not registered in the realm.
    pub const UNKNOWN_PRINCIPAL: u32 = 2;
    /// A password was required but not supplied.
    pub const PASSWORD_REQUIRED: u32 = 3;
    /// The supplied password is wrong.
    pub const WRONG_PASSWORD: u32 = 4;
    /// The initiator targeted a different service than the acceptor's credential is for.
    pub const WRONG_PRINCIPAL: u32 = 5;
    /// A token arrived for the wrong establishment round.
    pub const WRONG_ROUND: u32 = 6;
    /// A wrapped message arrived out of sequence, or originated from the wrong side.
    pub const OUT_OF_SEQUENCE: u32 = 7;
    /// The context is not fully established.
    pub const INCOMPLETE_CONTEXT: u32 = 8;
}

const INITIATOR_TOKEN: &str = "LBI1";
const ACCEPTOR_TOKEN: &str = "LBA1";
const WRAP_MAGIC: u8 = b'W';

/// The bytes [`LoopbackProvider::wrap`] adds to every message.
pub const WRAP_OVERHEAD: u32 = 8;

fn error(major: u32, minor: u32, message: &str) -> ProviderError {
    ProviderError::new(major, minor).with_message(message)
}

fn malformed(message: &str) -> ProviderError {
    error(status::DEFECTIVE_TOKEN, minor::MALFORMED_TOKEN, message)
}

/// A name in the loopback realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackName {
    name_type: NameType,
    value: String,
}

/// A credential for a loopback principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackCredential {
    principal: String,
    usage: CredentialUsage,
}

impl LoopbackCredential {
    /// The fully qualified principal the credential belongs to.
    pub fn principal(&self) -> &str {
        &self.principal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    fn tag(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Acceptor => 1,
        }
    }
}

/// A loopback security context.
#[derive(Debug)]
pub struct LoopbackContext {
    role: Role,
    initiator: String,
    acceptor: String,
    round: u8,
    complete: bool,
    flags: ContextFlags,
    send_sequence: u32,
    receive_sequence: u32,
}

impl LoopbackContext {
    fn key(&self) -> u8 {
        self.initiator
            .bytes()
            .chain(self.acceptor.bytes())
            .fold(0x5A, |key: u8, byte| key.rotate_left(3) ^ byte)
            | 1
    }

    fn established(&self) -> Result<(), ProviderError> {
        if self.complete {
            Ok(())
        } else {
            Err(error(
                status::NO_CONTEXT,
                minor::INCOMPLETE_CONTEXT,
                "context establishment has not completed",
            ))
        }
    }
}

fn checksum(key: u8, plaintext: &[u8]) -> u8 {
    plaintext
        .iter()
        .fold(key, |sum, byte| sum.wrapping_mul(31).wrapping_add(*byte))
}

/// The loopback security provider.
///
/// # Example
///
/// ```
/// use sasl_gssapi::provider::loopback::LoopbackProvider;
///
/// let provider = LoopbackProvider::new("EXAMPLE.COM")
///     .with_principal("alice", None)
///     .with_principal("bob", Some("hunter2"))
///     .with_rounds(2);
/// ```
#[derive(Debug, Clone)]
pub struct LoopbackProvider {
    realm: String,
    principals: HashMap<String, Option<String>>,
    default_principal: Option<String>,
    rounds: u8,
    supported: ContextFlags,
}

impl LoopbackProvider {
    /// Create a realm with no principals, single round trip establishment, and support for
    /// every context service.
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            principals: HashMap::new(),
            default_principal: None,
            rounds: 1,
            supported: ContextFlags::all(),
        }
    }

    /// Register a principal, optionally protected by a password.
    ///
    /// Principals without a password behave as if they have cached credentials.
    pub fn with_principal(mut self, principal: &str, password: Option<&str>) -> Self {
        let principal = self.qualify(principal);
        self.principals.insert(principal, password.map(str::to_string));
        self
    }

    /// Set the principal whose credential is used when none is named.
    pub fn with_default_principal(mut self, principal: &str) -> Self {
        self.default_principal = Some(self.qualify(principal));
        self
    }

    /// Set how many initiator tokens establishment requires.
    pub fn with_rounds(mut self, rounds: u8) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    /// Restrict the context services acceptors will grant.
    pub fn with_supported_flags(mut self, supported: ContextFlags) -> Self {
        self.supported = supported;
        self
    }

    fn qualify(&self, principal: &str) -> String {
        if principal.contains('@') {
            principal.to_string()
        } else {
            format!("{principal}@{}", self.realm)
        }
    }

    fn canonical(&self, name: &LoopbackName) -> String {
        match name.name_type {
            NameType::User => self.qualify(&name.value),
            NameType::HostBasedService => {
                let (service, host) = name.value.split_once('@').unwrap_or((&name.value, ""));
                format!("{service}/{host}@{}", self.realm)
            }
        }
    }

    fn initiator_token(round: u8, flags: ContextFlags, initiator: &str, target: &str) -> Bytes {
        Bytes::from(format!(
            "{INITIATOR_TOKEN} {round} {} {initiator} {target}",
            flags.bits()
        ))
    }

    fn acceptor_token(round: u8, flags: ContextFlags) -> Bytes {
        Bytes::from(format!("{ACCEPTOR_TOKEN} {round} {}", flags.bits()))
    }

    fn parse_token<'a>(
        input: &'a [u8],
        kind: &str,
        fields: usize,
    ) -> Result<Vec<&'a str>, ProviderError> {
        let text = std::str::from_utf8(input).map_err(|_| malformed("token is not text"))?;
        let parts: Vec<&str> = text.split(' ').collect();
        if parts.len() != fields + 1 || parts[0] != kind {
            return Err(malformed("unexpected token format"));
        }
        Ok(parts[1..].to_vec())
    }

    fn parse_round(round: &str) -> Result<u8, ProviderError> {
        round.parse().map_err(|_| malformed("bad round number"))
    }

    fn parse_flags(flags: &str) -> Result<ContextFlags, ProviderError> {
        flags
            .parse()
            .map(ContextFlags::from_bits_truncate)
            .map_err(|_| malformed("bad context flags"))
    }

    fn check_password(&self, principal: &str, password: Option<&str>) -> Result<(), ProviderError> {
        match self.principals.get(principal) {
            None => Err(error(
                status::NO_CRED,
                minor::UNKNOWN_PRINCIPAL,
                "principal is not registered",
            )),
            Some(None) => Ok(()),
            Some(Some(expected)) => match password {
                None => Err(error(
                    status::NO_CRED,
                    minor::PASSWORD_REQUIRED,
                    "no cached credentials",
                )),
                Some(password) if password == expected => Ok(()),
                Some(_) => Err(error(
                    status::DEFECTIVE_CREDENTIAL,
                    minor::WRONG_PASSWORD,
                    "password incorrect",
                )),
            },
        }
    }
}

impl SecurityProvider for LoopbackProvider {
    type Context = LoopbackContext;
    type Name = LoopbackName;
    type Credential = LoopbackCredential;

    fn import_name(&self, name: &str, name_type: NameType) -> Result<Self::Name, ProviderError> {
        let valid = match name_type {
            NameType::User => !name.is_empty() && !name.starts_with('@'),
            NameType::HostBasedService => name
                .split_once('@')
                .is_some_and(|(service, host)| !service.is_empty() && !host.is_empty()),
        };
        if !valid || name.contains(' ') {
            return Err(error(status::BAD_NAME, 0, "malformed name"));
        }
        Ok(LoopbackName {
            name_type,
            value: name.to_string(),
        })
    }

    fn display_name(&self, name: &Self::Name) -> Result<String, ProviderError> {
        Ok(name.value.clone())
    }

    fn compare_names(&self, a: &Self::Name, b: &Self::Name) -> Result<bool, ProviderError> {
        Ok(self.canonical(a) == self.canonical(b))
    }

    fn acquire_credential(
        &self,
        name: Option<&Self::Name>,
        usage: CredentialUsage,
        password: Option<&str>,
    ) -> Result<Self::Credential, ProviderError> {
        let principal = match (name, usage) {
            (Some(name), _) => self.canonical(name),
            (None, CredentialUsage::Initiate) => {
                self.default_principal.clone().ok_or_else(|| {
                    error(
                        status::NO_CRED,
                        minor::UNKNOWN_PRINCIPAL,
                        "no default credential",
                    )
                })?
            }
            (None, CredentialUsage::Accept) => {
                return Err(error(
                    status::NO_CRED,
                    minor::UNKNOWN_PRINCIPAL,
                    "acceptor credentials must be named",
                ));
            }
        };
        // Acceptors hold a keytab for every service in the realm.
        if usage == CredentialUsage::Initiate {
            self.check_password(&principal, password)?;
        }
        Ok(LoopbackCredential { principal, usage })
    }

    fn initiate(
        &self,
        context: Option<Self::Context>,
        credential: Option<&Self::Credential>,
        target: &Self::Name,
        flags: ContextFlags,
        input: Option<&[u8]>,
    ) -> Result<Initiated<Self::Context>, ProviderError> {
        match (context, input) {
            (None, None) => {
                let initiator = match credential {
                    Some(credential) if credential.usage == CredentialUsage::Initiate => {
                        credential.principal.clone()
                    }
                    Some(_) => {
                        return Err(error(
                            status::NO_CRED,
                            0,
                            "credential cannot initiate contexts",
                        ));
                    }
                    None => self
                        .acquire_credential(None, CredentialUsage::Initiate, None)?
                        .principal,
                };
                let context = LoopbackContext {
                    role: Role::Initiator,
                    initiator,
                    acceptor: self.canonical(target),
                    round: 1,
                    complete: false,
                    flags: flags & self.supported,
                    send_sequence: 0,
                    receive_sequence: 0,
                };
                let output =
                    Self::initiator_token(1, flags, &context.initiator, &context.acceptor);
                Ok(Initiated {
                    flags: context.flags,
                    context,
                    output,
                    complete: false,
                })
            }
            (Some(mut context), Some(input)) if !context.complete => {
                let fields = Self::parse_token(input, ACCEPTOR_TOKEN, 2)?;
                let round = Self::parse_round(fields[0])?;
                if round != context.round {
                    return Err(error(
                        status::DEFECTIVE_TOKEN,
                        minor::WRONG_ROUND,
                        "acceptor token is for a different round",
                    ));
                }
                if round >= self.rounds {
                    context.complete = true;
                    context.flags = Self::parse_flags(fields[1])?;
                    return Ok(Initiated {
                        flags: context.flags,
                        context,
                        output: Bytes::new(),
                        complete: true,
                    });
                }
                context.round += 1;
                let output = Self::initiator_token(
                    context.round,
                    flags,
                    &context.initiator,
                    &context.acceptor,
                );
                Ok(Initiated {
                    flags: context.flags,
                    context,
                    output,
                    complete: false,
                })
            }
            (None, Some(_)) | (Some(_), None) => Err(error(
                status::NO_CONTEXT,
                minor::WRONG_ROUND,
                "token and context do not match",
            )),
            (Some(_), Some(_)) => Err(error(
                status::FAILURE,
                minor::WRONG_ROUND,
                "context is already established",
            )),
        }
    }

    fn accept(
        &self,
        context: Option<Self::Context>,
        credential: &Self::Credential,
        input: &[u8],
    ) -> Result<Accepted<Self>, ProviderError> {
        if credential.usage != CredentialUsage::Accept {
            return Err(error(status::NO_CRED, 0, "credential cannot accept contexts"));
        }
        let fields = Self::parse_token(input, INITIATOR_TOKEN, 4)?;
        let round = Self::parse_round(fields[0])?;
        let requested = Self::parse_flags(fields[1])?;
        let (initiator, target) = (fields[2], fields[3]);
        if target != credential.principal {
            return Err(error(
                status::FAILURE,
                minor::WRONG_PRINCIPAL,
                "initiator targeted a different service",
            ));
        }

        let mut context = match context {
            None if round == 1 => LoopbackContext {
                role: Role::Acceptor,
                initiator: initiator.to_string(),
                acceptor: credential.principal.clone(),
                round,
                complete: false,
                flags: requested & self.supported,
                send_sequence: 0,
                receive_sequence: 0,
            },
            Some(context)
                if !context.complete
                    && round == context.round + 1
                    && context.initiator == initiator =>
            {
                LoopbackContext { round, ..context }
            }
            _ => {
                return Err(error(
                    status::DEFECTIVE_TOKEN,
                    minor::WRONG_ROUND,
                    "initiator token is for a different round",
                ));
            }
        };
        let output = Self::acceptor_token(round, context.flags);
        if round < self.rounds {
            return Ok(Accepted {
                flags: context.flags,
                context,
                peer: None,
                output,
                delegated: None,
                complete: false,
            });
        }

        context.complete = true;
        let delegated = context
            .flags
            .contains(ContextFlags::DELEGATE)
            .then(|| LoopbackCredential {
                principal: context.initiator.clone(),
                usage: CredentialUsage::Initiate,
            });
        Ok(Accepted {
            flags: context.flags,
            peer: Some(LoopbackName {
                name_type: NameType::User,
                value: context.initiator.clone(),
            }),
            context,
            output,
            delegated,
            complete: true,
        })
    }

    fn local_name(&self, context: &Self::Context) -> Result<Self::Name, ProviderError> {
        Ok(LoopbackName {
            name_type: NameType::User,
            value: context.initiator.clone(),
        })
    }

    fn wrap(
        &self,
        context: &mut Self::Context,
        confidential: bool,
        plaintext: &[u8],
    ) -> Result<Bytes, ProviderError> {
        context.established()?;
        let confidential =
            confidential && context.flags.contains(ContextFlags::CONFIDENTIALITY);
        let key = context.key();
        let mut token = BytesMut::with_capacity(WRAP_OVERHEAD as usize + plaintext.len());
        token.put_u8(WRAP_MAGIC);
        token.put_u8(context.role.tag());
        token.put_u8(u8::from(confidential));
        token.put_u32(context.send_sequence);
        token.put_u8(checksum(key, plaintext));
        if confidential {
            token.extend(plaintext.iter().map(|byte| byte ^ key));
        } else {
            token.put_slice(plaintext);
        }
        context.send_sequence = context.send_sequence.wrapping_add(1);
        Ok(token.freeze())
    }

    fn unwrap(
        &self,
        context: &mut Self::Context,
        token: &[u8],
    ) -> Result<Unwrapped, ProviderError> {
        context.established()?;
        let Some((header, body)) = token.split_at_checked(WRAP_OVERHEAD as usize) else {
            return Err(malformed("wrapped message is truncated"));
        };
        let [magic, origin, confidential, s0, s1, s2, s3, sum] = *header else {
            return Err(malformed("wrapped message is truncated"));
        };
        if magic != WRAP_MAGIC || confidential > 1 {
            return Err(malformed("not a wrapped message"));
        }
        let peer = match context.role {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
        };
        if origin != peer.tag() || u32::from_be_bytes([s0, s1, s2, s3]) != context.receive_sequence
        {
            return Err(error(
                status::FAILURE,
                minor::OUT_OF_SEQUENCE,
                "wrapped message is out of sequence",
            ));
        }

        let key = context.key();
        let confidential = confidential == 1;
        let plaintext: Bytes = if confidential {
            body.iter().map(|byte| byte ^ key).collect::<Vec<u8>>().into()
        } else {
            Bytes::copy_from_slice(body)
        };
        if checksum(key, &plaintext) != sum {
            return Err(error(status::BAD_SIG, 0, "message integrity check failed"));
        }
        context.receive_sequence = context.receive_sequence.wrapping_add(1);
        Ok(Unwrapped {
            plaintext,
            confidential,
        })
    }

    fn wrap_size_limit(
        &self,
        context: &Self::Context,
        _confidential: bool,
        output_size: u32,
    ) -> Result<u32, ProviderError> {
        context.established()?;
        Ok(output_size.saturating_sub(WRAP_OVERHEAD))
    }
}
