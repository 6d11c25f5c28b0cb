// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# sasl-gssapi

An implementation of the SASL GSSAPI mechanism ([RFC 4752][1]). It layers a generic security
context negotiation, such as Kerberos 5, underneath the SASL challenge-response exchange, then
negotiates which protection (none, integrity, or confidentiality) applies to the application
data that follows.

The crate does not talk to a Kerberos library directly. The cryptographic work is performed by
an implementation of the [`provider::SecurityProvider`] trait that the application supplies. A
deterministic in-process provider, [`provider::loopback::LoopbackProvider`], is included for
testing and experimentation; it provides no security at all.

## Components

The mechanism itself lives in [`mechanism`]. Both [`mechanism::ClientSession`] and
[`mechanism::ServerSession`] are driven by handing them the peer's latest token; they never
perform I/O. Once authenticated, a session becomes a [`security_layer::SecurityLayer`] which
frames, protects, and reassembles application data.

The [`exchange`] module drives a session over any tokio byte stream for applications that don't
already have a SASL framework of their own.

Some security providers are not safe to call from several threads at once. Wrap such
providers in [`provider::Serialized`] to route every call through one lock.

## Crate features

By default, only the library is built.

* **cli** -
  Include the `sasl-gssapi-loopback` CLI, which runs a handshake against the loopback
  provider and prints the outcome, along with `config::load_config`. This is not enabled by
  default.

[1]: https://www.rfc-editor.org/rfc/rfc4752
*/

pub mod config;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod mechanism;
pub mod negotiation;
pub mod provider;
pub mod security_layer;

pub use error::{Error, ErrorKind};
pub use mechanism::{ClientSession, Negotiated, ServerSession, State, Step};
