// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Canonical authentication and authorization identities.
//!
//! Principals in the acceptor's own realm are reported without the realm, so `alice@EXAMPLE.COM`
//! becomes `alice` when the provider agrees the two names refer to the same principal. Principals
//! from other realms keep their fully qualified name.

use crate::{
    error::{Error, ProtocolError, ProviderResultExt},
    provider::{NameType, SecurityProvider},
};

/// Separates the principal from its realm.
pub const REALM_SEPARATOR: char = '@';

/// The principal without its realm, if the name has one.
///
/// ```
/// use sasl_gssapi::identity::strip_realm;
///
/// assert_eq!(strip_realm("alice@EXAMPLE.COM"), Some("alice"));
/// assert_eq!(strip_realm("alice"), None);
/// ```
pub fn strip_realm(name: &str) -> Option<&str> {
    name.split_once(REALM_SEPARATOR).map(|(principal, _)| principal)
}

/// Determine the canonical authentication identity of an established peer.
pub fn resolve_authentication_id<P: SecurityProvider + ?Sized>(
    provider: &P,
    peer: &P::Name,
) -> Result<String, Error> {
    let display = provider.display_name(peer).during("display_name")?;
    let Some(principal) = strip_realm(&display).filter(|principal| !principal.is_empty()) else {
        return Ok(display);
    };

    let realmless = provider
        .import_name(principal, NameType::User)
        .during("import_name")?;
    if provider
        .compare_names(peer, &realmless)
        .during("compare_names")?
    {
        Ok(principal.to_string())
    } else {
        Ok(display)
    }
}

/// Validate the authorization identity suffix of a layer selection token.
///
/// An empty suffix means no authorization identity was requested.
pub fn authorization_id_from_bytes(suffix: &[u8]) -> Result<Option<String>, ProtocolError> {
    if suffix.is_empty() {
        return Ok(None);
    }
    let authorization_id =
        std::str::from_utf8(suffix).map_err(|_| ProtocolError::InvalidAuthorizationId)?;
    if authorization_id.contains('\0') {
        return Err(ProtocolError::InvalidAuthorizationId);
    }
    Ok(Some(authorization_id.to_string()))
}
