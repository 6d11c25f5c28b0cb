// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The security provider the mechanism is built on.
//!
//! The mechanism never performs cryptography itself; establishing contexts, protecting
//! messages, and comparing principal names is delegated to an implementation of
//! [`SecurityProvider`]. A binding to a system GSS-API library is the typical production
//! implementation; [`loopback::LoopbackProvider`] is a deterministic in-process implementation
//! for tests and demonstrations.
//!
//! Contexts, names, and credentials are owned values released by [`Drop`]. [`Serialized`]
//! providers hand out [`Locked`] handles, which are released while holding the provider's lock.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::error::ProviderError;

pub mod loopback;

/// Major status codes, with the values GSS-API assigns them.
pub mod status {
    /// The operation completed.
    pub const COMPLETE: u32 = 0;
    /// The name passed to the operation is malformed.
    pub const BAD_NAME: u32 = 2 << 16;
    /// A message failed its integrity check.
    pub const BAD_SIG: u32 = 6 << 16;
    /// No credentials are available.
    pub const NO_CRED: u32 = 7 << 16;
    /// No valid context was supplied.
    pub const NO_CONTEXT: u32 = 8 << 16;
    /// A token failed consistency checks.
    pub const DEFECTIVE_TOKEN: u32 = 9 << 16;
    /// The credential is defective.
    pub const DEFECTIVE_CREDENTIAL: u32 = 10 << 16;
    /// Unspecified failure; the minor status has the details.
    pub const FAILURE: u32 = 13 << 16;
    /// A message arrived out of sequence.
    pub const GAP_TOKEN: u32 = 1 << 4;
}

bitflags::bitflags! {
    /// Services requested for, or provided by, a security context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        const DELEGATE = 1;
        const MUTUAL = 2;
        const REPLAY = 4;
        const SEQUENCE = 8;
        const CONFIDENTIALITY = 16;
        const INTEGRITY = 32;
        const ANONYMOUS = 64;
    }
}

/// How a name string should be interpreted when imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameType {
    /// A `service@hostname` service name.
    HostBasedService,
    /// A user principal, with or without a realm.
    User,
}

/// What a credential will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialUsage {
    /// Initiating contexts.
    Initiate,
    /// Accepting contexts.
    Accept,
}

/// The result of a single [`SecurityProvider::initiate`] call.
#[derive(Debug)]
pub struct Initiated<C> {
    /// The context, to be passed to the next call.
    pub context: C,
    /// The token to send to the acceptor; possibly empty.
    pub output: Bytes,
    /// The services the context provides; final only once `complete` is set.
    pub flags: ContextFlags,
    /// Whether establishment is complete.
    pub complete: bool,
}

/// The result of a single [`SecurityProvider::accept`] call.
pub struct Accepted<P: SecurityProvider + ?Sized> {
    pub context: P::Context,
    /// The initiator's name, once it is known.
    pub peer: Option<P::Name>,
    pub output: Bytes,
    pub flags: ContextFlags,
    /// The initiator's credential, if it was delegated.
    pub delegated: Option<P::Credential>,
    pub complete: bool,
}

impl<P: SecurityProvider + ?Sized> std::fmt::Debug for Accepted<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("peer", &self.peer.is_some())
            .field("output", &self.output.len())
            .field("flags", &self.flags)
            .field("delegated", &self.delegated.is_some())
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

/// A message recovered with [`SecurityProvider::unwrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub plaintext: Bytes,
    /// Whether the message was encrypted, as opposed to integrity protected only.
    pub confidential: bool,
}

/// The operations the mechanism needs from a security provider.
///
/// Every operation may fail with a [`ProviderError`], which is always fatal to the session
/// that made the call.
pub trait SecurityProvider {
    /// An established or partially established security context.
    type Context;
    /// An internal representation of a principal name.
    type Name;
    /// A credential handle.
    type Credential;

    /// Convert a printable name into an internal name.
    fn import_name(&self, name: &str, name_type: NameType) -> Result<Self::Name, ProviderError>;

    /// Convert an internal name into its printable form.
    fn display_name(&self, name: &Self::Name) -> Result<String, ProviderError>;

    /// Whether the two names refer to the same principal.
    fn compare_names(&self, a: &Self::Name, b: &Self::Name) -> Result<bool, ProviderError>;

    /// Acquire a credential for `name`, or the default credential if `name` is [`None`].
    ///
    /// If a password is provided, it is used to obtain fresh credentials rather than relying
    /// on cached ones.
    fn acquire_credential(
        &self,
        name: Option<&Self::Name>,
        usage: CredentialUsage,
        password: Option<&str>,
    ) -> Result<Self::Credential, ProviderError>;

    /// Perform one initiator step of context establishment.
    ///
    /// `context` is [`None`] for the first step, and `input` is [`None`] until the acceptor
    /// replied.
    fn initiate(
        &self,
        context: Option<Self::Context>,
        credential: Option<&Self::Credential>,
        target: &Self::Name,
        flags: ContextFlags,
        input: Option<&[u8]>,
    ) -> Result<Initiated<Self::Context>, ProviderError>;

    /// Perform one acceptor step of context establishment.
    fn accept(
        &self,
        context: Option<Self::Context>,
        credential: &Self::Credential,
        input: &[u8],
    ) -> Result<Accepted<Self>, ProviderError>;

    /// The name of the initiator of the context.
    fn local_name(&self, context: &Self::Context) -> Result<Self::Name, ProviderError>;

    /// Protect a message, encrypting it if `confidential` is set.
    fn wrap(
        &self,
        context: &mut Self::Context,
        confidential: bool,
        plaintext: &[u8],
    ) -> Result<Bytes, ProviderError>;

    /// Verify and, if needed, decrypt a message protected by the peer.
    fn unwrap(
        &self,
        context: &mut Self::Context,
        token: &[u8],
    ) -> Result<Unwrapped, ProviderError>;

    /// The largest plaintext whose wrapped form fits in `output_size` bytes.
    fn wrap_size_limit(
        &self,
        context: &Self::Context,
        confidential: bool,
        output_size: u32,
    ) -> Result<u32, ProviderError>;
}

macro_rules! forward_provider {
    ($provider:ty) => {
        impl<P: SecurityProvider + ?Sized> SecurityProvider for $provider {
            type Context = P::Context;
            type Name = P::Name;
            type Credential = P::Credential;

            fn import_name(
                &self,
                name: &str,
                name_type: NameType,
            ) -> Result<Self::Name, ProviderError> {
                (**self).import_name(name, name_type)
            }

            fn display_name(&self, name: &Self::Name) -> Result<String, ProviderError> {
                (**self).display_name(name)
            }

            fn compare_names(&self, a: &Self::Name, b: &Self::Name) -> Result<bool, ProviderError> {
                (**self).compare_names(a, b)
            }

            fn acquire_credential(
                &self,
                name: Option<&Self::Name>,
                usage: CredentialUsage,
                password: Option<&str>,
            ) -> Result<Self::Credential, ProviderError> {
                (**self).acquire_credential(name, usage, password)
            }

            fn initiate(
                &self,
                context: Option<Self::Context>,
                credential: Option<&Self::Credential>,
                target: &Self::Name,
                flags: ContextFlags,
                input: Option<&[u8]>,
            ) -> Result<Initiated<Self::Context>, ProviderError> {
                (**self).initiate(context, credential, target, flags, input)
            }

            fn accept(
                &self,
                context: Option<Self::Context>,
                credential: &Self::Credential,
                input: &[u8],
            ) -> Result<Accepted<Self>, ProviderError> {
                let accepted = (**self).accept(context, credential, input)?;
                Ok(Accepted {
                    context: accepted.context,
                    peer: accepted.peer,
                    output: accepted.output,
                    flags: accepted.flags,
                    delegated: accepted.delegated,
                    complete: accepted.complete,
                })
            }

            fn local_name(&self, context: &Self::Context) -> Result<Self::Name, ProviderError> {
                (**self).local_name(context)
            }

            fn wrap(
                &self,
                context: &mut Self::Context,
                confidential: bool,
                plaintext: &[u8],
            ) -> Result<Bytes, ProviderError> {
                (**self).wrap(context, confidential, plaintext)
            }

            fn unwrap(
                &self,
                context: &mut Self::Context,
                token: &[u8],
            ) -> Result<Unwrapped, ProviderError> {
                (**self).unwrap(context, token)
            }

            fn wrap_size_limit(
                &self,
                context: &Self::Context,
                confidential: bool,
                output_size: u32,
            ) -> Result<u32, ProviderError> {
                (**self).wrap_size_limit(context, confidential, output_size)
            }
        }
    };
}

forward_provider!(Arc<P>);
forward_provider!(&P);

static GLOBAL_LOCK: LazyLock<ProviderLock> = LazyLock::new(ProviderLock::new);

/// A lock serializing calls into a provider that is not thread-safe.
///
/// Every [`Serialized`] provider sharing a lock holds it for the duration of each provider
/// call, so no two calls through it ever overlap.
#[derive(Debug, Clone, Default)]
pub struct ProviderLock(Arc<Mutex<()>>);

impl ProviderLock {
    /// Create a new, independent lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide lock.
    pub fn global() -> Self {
        GLOBAL_LOCK.clone()
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // The lock guards no data, so a panic while it was held leaves nothing inconsistent.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A context, name, or credential handed out by a [`Serialized`] provider.
///
/// Dropping the handle releases the value it wraps while holding the provider's lock.
pub struct Locked<T> {
    value: Option<T>,
    lock: ProviderLock,
}

impl<T> Locked<T> {
    /// The wrapped value, or [`None`] once it has been released.
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    fn value(&self, major: u32) -> Result<&T, ProviderError> {
        self.value
            .as_ref()
            .ok_or_else(|| ProviderError::new(major, 0))
    }

    fn value_mut(&mut self, major: u32) -> Result<&mut T, ProviderError> {
        self.value
            .as_mut()
            .ok_or_else(|| ProviderError::new(major, 0))
    }

    // Moving the value out leaves nothing for `drop` to release.
    fn into_value(mut self, major: u32) -> Result<T, ProviderError> {
        self.value
            .take()
            .ok_or_else(|| ProviderError::new(major, 0))
    }
}

impl<T> Drop for Locked<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let _guard = self.lock.acquire();
            drop(value);
        }
    }
}

impl<T> std::fmt::Debug for Locked<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locked")
            .field("released", &self.value.is_none())
            .finish_non_exhaustive()
    }
}

/// A provider whose every call is made while holding a [`ProviderLock`].
///
/// The contexts, names, and credentials it returns are [`Locked`] handles, so releasing
/// them is serialized as well.
#[derive(Debug, Clone)]
pub struct Serialized<P> {
    inner: P,
    lock: ProviderLock,
}

impl<P> Serialized<P> {
    /// Serialize calls to `inner` through the process-wide lock.
    pub fn new(inner: P) -> Self {
        Self::with_lock(inner, ProviderLock::global())
    }

    /// Serialize calls to `inner` through the given lock.
    pub fn with_lock(inner: P, lock: ProviderLock) -> Self {
        Self { inner, lock }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    fn hold<T>(&self, value: T) -> Locked<T> {
        Locked {
            value: Some(value),
            lock: self.lock.clone(),
        }
    }
}

// A `Locked` handle must never be dropped while the guard is held: only handles whose value
// was already moved out go out of scope inside these methods.
impl<P: SecurityProvider> SecurityProvider for Serialized<P> {
    type Context = Locked<P::Context>;
    type Name = Locked<P::Name>;
    type Credential = Locked<P::Credential>;

    fn import_name(&self, name: &str, name_type: NameType) -> Result<Self::Name, ProviderError> {
        let _guard = self.lock.acquire();
        let name = self.inner.import_name(name, name_type)?;
        Ok(self.hold(name))
    }

    fn display_name(&self, name: &Self::Name) -> Result<String, ProviderError> {
        let name = name.value(status::BAD_NAME)?;
        let _guard = self.lock.acquire();
        self.inner.display_name(name)
    }

    fn compare_names(&self, a: &Self::Name, b: &Self::Name) -> Result<bool, ProviderError> {
        let (a, b) = (a.value(status::BAD_NAME)?, b.value(status::BAD_NAME)?);
        let _guard = self.lock.acquire();
        self.inner.compare_names(a, b)
    }

    fn acquire_credential(
        &self,
        name: Option<&Self::Name>,
        usage: CredentialUsage,
        password: Option<&str>,
    ) -> Result<Self::Credential, ProviderError> {
        let name = name.map(|name| name.value(status::BAD_NAME)).transpose()?;
        let _guard = self.lock.acquire();
        let credential = self.inner.acquire_credential(name, usage, password)?;
        Ok(self.hold(credential))
    }

    fn initiate(
        &self,
        context: Option<Self::Context>,
        credential: Option<&Self::Credential>,
        target: &Self::Name,
        flags: ContextFlags,
        input: Option<&[u8]>,
    ) -> Result<Initiated<Self::Context>, ProviderError> {
        let _guard = self.lock.acquire();
        let context = context
            .map(|context| context.into_value(status::NO_CONTEXT))
            .transpose()?;
        let credential = credential
            .map(|credential| credential.value(status::NO_CRED))
            .transpose()?;
        let target = target.value(status::BAD_NAME)?;
        let initiated = self.inner.initiate(context, credential, target, flags, input)?;
        Ok(Initiated {
            context: self.hold(initiated.context),
            output: initiated.output,
            flags: initiated.flags,
            complete: initiated.complete,
        })
    }

    fn accept(
        &self,
        context: Option<Self::Context>,
        credential: &Self::Credential,
        input: &[u8],
    ) -> Result<Accepted<Self>, ProviderError> {
        let _guard = self.lock.acquire();
        let context = context
            .map(|context| context.into_value(status::NO_CONTEXT))
            .transpose()?;
        let credential = credential.value(status::NO_CRED)?;
        let accepted = self.inner.accept(context, credential, input)?;
        Ok(Accepted {
            context: self.hold(accepted.context),
            peer: accepted.peer.map(|peer| self.hold(peer)),
            output: accepted.output,
            flags: accepted.flags,
            delegated: accepted.delegated.map(|delegated| self.hold(delegated)),
            complete: accepted.complete,
        })
    }

    fn local_name(&self, context: &Self::Context) -> Result<Self::Name, ProviderError> {
        let context = context.value(status::NO_CONTEXT)?;
        let _guard = self.lock.acquire();
        let name = self.inner.local_name(context)?;
        Ok(self.hold(name))
    }

    fn wrap(
        &self,
        context: &mut Self::Context,
        confidential: bool,
        plaintext: &[u8],
    ) -> Result<Bytes, ProviderError> {
        let context = context.value_mut(status::NO_CONTEXT)?;
        let _guard = self.lock.acquire();
        self.inner.wrap(context, confidential, plaintext)
    }

    fn unwrap(
        &self,
        context: &mut Self::Context,
        token: &[u8],
    ) -> Result<Unwrapped, ProviderError> {
        let context = context.value_mut(status::NO_CONTEXT)?;
        let _guard = self.lock.acquire();
        self.inner.unwrap(context, token)
    }

    fn wrap_size_limit(
        &self,
        context: &Self::Context,
        confidential: bool,
        output_size: u32,
    ) -> Result<u32, ProviderError> {
        let context = context.value(status::NO_CONTEXT)?;
        let _guard = self.lock.acquire();
        self.inner.wrap_size_limit(context, confidential, output_size)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    // A provider that only tracks how many calls are in flight at once.
    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Overlap {
        fn enter(&self) {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl SecurityProvider for Overlap {
        type Context = ();
        type Name = String;
        type Credential = ();

        fn import_name(&self, name: &str, _: NameType) -> Result<String, ProviderError> {
            self.enter();
            Ok(name.to_string())
        }

        fn display_name(&self, name: &String) -> Result<String, ProviderError> {
            self.enter();
            Ok(name.clone())
        }

        fn compare_names(&self, a: &String, b: &String) -> Result<bool, ProviderError> {
            self.enter();
            Ok(a == b)
        }

        fn acquire_credential(
            &self,
            _: Option<&String>,
            _: CredentialUsage,
            _: Option<&str>,
        ) -> Result<(), ProviderError> {
            Err(ProviderError::new(status::NO_CRED, 0))
        }

        fn initiate(
            &self,
            _: Option<()>,
            _: Option<&()>,
            _: &String,
            _: ContextFlags,
            _: Option<&[u8]>,
        ) -> Result<Initiated<()>, ProviderError> {
            self.enter();
            Ok(Initiated {
                context: (),
                output: Bytes::new(),
                flags: ContextFlags::empty(),
                complete: true,
            })
        }

        fn accept(&self, _: Option<()>, _: &(), _: &[u8]) -> Result<Accepted<Self>, ProviderError> {
            Err(ProviderError::new(status::FAILURE, 0))
        }

        fn local_name(&self, _: &()) -> Result<String, ProviderError> {
            Err(ProviderError::new(status::NO_CONTEXT, 0))
        }

        fn wrap(&self, _: &mut (), _: bool, plaintext: &[u8]) -> Result<Bytes, ProviderError> {
            self.enter();
            Ok(Bytes::copy_from_slice(plaintext))
        }

        fn unwrap(&self, _: &mut (), token: &[u8]) -> Result<Unwrapped, ProviderError> {
            self.enter();
            Ok(Unwrapped {
                plaintext: Bytes::copy_from_slice(token),
                confidential: false,
            })
        }

        fn wrap_size_limit(&self, _: &(), _: bool, output_size: u32) -> Result<u32, ProviderError> {
            Ok(output_size)
        }
    }

    fn hammer<P: SecurityProvider + Sync>(provider: &P) {
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        let name = provider.import_name("alice", NameType::User).unwrap();
                        provider.display_name(&name).unwrap();
                        let mut context = provider
                            .initiate(None, None, &name, ContextFlags::empty(), None)
                            .unwrap()
                            .context;
                        provider.wrap(&mut context, true, b"data").unwrap();
                        provider.unwrap(&mut context, b"data").unwrap();
                    }
                });
            }
        });
    }

    // Records, when dropped, whether the lock it was handed out under is held.
    struct Handle {
        lock: ProviderLock,
        released: Arc<Mutex<Vec<bool>>>,
    }

    impl Drop for Handle {
        fn drop(&mut self) {
            let held = self.lock.0.try_lock().is_err();
            self.released.lock().unwrap().push(held);
        }
    }

    struct Handles {
        lock: ProviderLock,
        released: Arc<Mutex<Vec<bool>>>,
    }

    impl Handles {
        fn handle(&self) -> Handle {
            Handle {
                lock: self.lock.clone(),
                released: self.released.clone(),
            }
        }
    }

    impl SecurityProvider for Handles {
        type Context = Handle;
        type Name = Handle;
        type Credential = Handle;

        fn import_name(&self, _: &str, _: NameType) -> Result<Handle, ProviderError> {
            Ok(self.handle())
        }

        fn display_name(&self, _: &Handle) -> Result<String, ProviderError> {
            Ok("alice".to_string())
        }

        fn compare_names(&self, _: &Handle, _: &Handle) -> Result<bool, ProviderError> {
            Ok(true)
        }

        fn acquire_credential(
            &self,
            _: Option<&Handle>,
            _: CredentialUsage,
            _: Option<&str>,
        ) -> Result<Handle, ProviderError> {
            Ok(self.handle())
        }

        fn initiate(
            &self,
            context: Option<Handle>,
            _: Option<&Handle>,
            _: &Handle,
            flags: ContextFlags,
            _: Option<&[u8]>,
        ) -> Result<Initiated<Handle>, ProviderError> {
            drop(context);
            Ok(Initiated {
                context: self.handle(),
                output: Bytes::new(),
                flags,
                complete: false,
            })
        }

        fn accept(
            &self,
            _: Option<Handle>,
            _: &Handle,
            _: &[u8],
        ) -> Result<Accepted<Self>, ProviderError> {
            Ok(Accepted {
                context: self.handle(),
                peer: Some(self.handle()),
                output: Bytes::new(),
                flags: ContextFlags::DELEGATE,
                delegated: Some(self.handle()),
                complete: true,
            })
        }

        fn local_name(&self, _: &Handle) -> Result<Handle, ProviderError> {
            Ok(self.handle())
        }

        fn wrap(&self, _: &mut Handle, _: bool, plaintext: &[u8]) -> Result<Bytes, ProviderError> {
            Ok(Bytes::copy_from_slice(plaintext))
        }

        fn unwrap(&self, _: &mut Handle, token: &[u8]) -> Result<Unwrapped, ProviderError> {
            Ok(Unwrapped {
                plaintext: Bytes::copy_from_slice(token),
                confidential: false,
            })
        }

        fn wrap_size_limit(
            &self,
            _: &Handle,
            _: bool,
            output_size: u32,
        ) -> Result<u32, ProviderError> {
            Ok(output_size)
        }
    }

    #[test]
    fn handles_released_under_lock() -> anyhow::Result<()> {
        let lock = ProviderLock::new();
        let released = Arc::new(Mutex::new(Vec::new()));
        let provider = Serialized::with_lock(
            Handles {
                lock: lock.clone(),
                released: released.clone(),
            },
            lock,
        );

        let name = provider.import_name("alice", NameType::User)?;
        let credential =
            provider.acquire_credential(Some(&name), CredentialUsage::Initiate, None)?;
        let first = provider.initiate(None, Some(&credential), &name, ContextFlags::MUTUAL, None)?;
        let second = provider.initiate(
            Some(first.context),
            Some(&credential),
            &name,
            ContextFlags::MUTUAL,
            Some(b"reply"),
        )?;
        let local = provider.local_name(&second.context)?;
        let accepted = provider.accept(None, &credential, b"token")?;
        assert!(accepted.delegated.as_ref().and_then(Locked::get).is_some());
        assert_eq!(released.lock().unwrap().as_slice(), [true]);

        drop((name, credential, second, local, accepted));
        let released = released.lock().unwrap();
        // The first context went inside `initiate`; the rest when dropped above.
        assert_eq!(released.len(), 8);
        assert!(released.iter().all(|held| *held));

        Ok(())
    }

    // Calls through providers sharing a lock never overlap.
    #[test]
    fn serialized_calls_never_overlap() {
        let overlap = Arc::new(Overlap::default());
        let lock = ProviderLock::new();
        let first = Serialized::with_lock(overlap.clone(), lock.clone());
        let second = Serialized::with_lock(overlap.clone(), lock);

        std::thread::scope(|scope| {
            scope.spawn(|| hammer(&first));
            scope.spawn(|| hammer(&second));
        });

        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn global_lock_is_shared() {
        let first = ProviderLock::global();
        let second = ProviderLock::global();
        assert!(Arc::ptr_eq(&first.0, &second.0));
        assert!(!Arc::ptr_eq(&first.0, &ProviderLock::new().0));
    }

    #[test]
    fn poisoned_lock_still_serializes() {
        let lock = ProviderLock::new();
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.acquire();
            panic!("poison the lock");
        })
        .join();

        let provider = Serialized::with_lock(Overlap::default(), lock);
        assert!(provider.import_name("alice", NameType::User).is_ok());
    }
}
