// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The security layer negotiation token and the strength policy that drives it.
//!
//! Once the security context is established, the responder announces which protection layers
//! it accepts along with the largest frame it is willing to receive, and the initiator answers
//! with exactly one layer and its own receive limit. Both tokens share a four byte layout:
//!
//! | byte | contents |
//! |------|----------|
//! | 0    | bitmask: `0x01` no layer, `0x02` integrity, `0x04` confidentiality |
//! | 1-3  | big-endian 24-bit maximum buffer size |
//!
//! A selection token may be followed by the UTF-8 authorization identity the initiator wishes
//! to act as.

use std::fmt::Display;

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    config::SecurityProperties,
    error::{PolicyError, ProtocolError},
};

/// The largest buffer size the 24-bit wire field can carry.
pub const MAX_BUFFER_SIZE: u32 = 0x00FF_FFFF;

/// The length of the fixed portion of a layer token.
pub const TOKEN_LEN: usize = std::mem::size_of::<LayerToken>();

bitflags::bitflags! {
    /// A set of security layers, as carried in byte 0 of a layer token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayerSet: u8 {
        const NONE = 0x01;
        const INTEGRITY = 0x02;
        const CONFIDENTIALITY = 0x04;
    }
}

/// A protection layer applied to application data after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    /// Application data is sent as-is.
    None,
    /// Application data is integrity protected.
    Integrity,
    /// Application data is integrity protected and encrypted.
    Confidentiality,
}

impl Layer {
    /// All layers, strongest first.
    pub const PREFERENCE: [Layer; 3] = [Layer::Confidentiality, Layer::Integrity, Layer::None];

    /// The bit identifying this layer on the wire.
    pub fn bit(self) -> LayerSet {
        match self {
            Layer::None => LayerSet::NONE,
            Layer::Integrity => LayerSet::INTEGRITY,
            Layer::Confidentiality => LayerSet::CONFIDENTIALITY,
        }
    }

    /// Whether wrapping for this layer requests confidentiality.
    pub fn is_confidential(self) -> bool {
        self == Layer::Confidentiality
    }
}

impl From<Layer> for LayerSet {
    fn from(layer: Layer) -> Self {
        layer.bit()
    }
}

impl TryFrom<u8> for Layer {
    type Error = ProtocolError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Layer::PREFERENCE
            .into_iter()
            .find(|layer| layer.bit().bits() == bits)
            .ok_or(ProtocolError::InvalidSelection { bits })
    }
}

impl Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Layer::None => "none",
            Layer::Integrity => "integrity",
            Layer::Confidentiality => "confidentiality",
        };
        f.write_str(name)
    }
}

/// The fixed four bytes at the start of every layer token.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct LayerToken {
    layers: u8,
    max_buffer: [u8; 3],
}

impl LayerToken {
    fn new(layers: u8, max_buffer: u32) -> Self {
        let [_, high, middle, low] = max_buffer.min(MAX_BUFFER_SIZE).to_be_bytes();
        Self {
            layers,
            max_buffer: [high, middle, low],
        }
    }

    fn max_buffer(&self) -> u32 {
        let [high, middle, low] = self.max_buffer;
        u32::from_be_bytes([0, high, middle, low])
    }

    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        Self::read_from_prefix(bytes)
            .map_err(|_| ProtocolError::TokenTooShort { len: bytes.len() })
    }
}

/// The responder's announcement of the layers it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerAnnouncement {
    /// The layers the responder accepts.
    pub layers: LayerSet,
    /// The largest frame the responder is willing to receive.
    pub max_buffer: u32,
}

impl LayerAnnouncement {
    /// Encode the token; a buffer size above [`MAX_BUFFER_SIZE`] is clamped.
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(LayerToken::new(self.layers.bits(), self.max_buffer).as_bytes())
    }

    /// Decode a token.
    ///
    /// Bits for layers this implementation doesn't know are ignored, as is anything after the
    /// fourth byte.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (token, _) = LayerToken::parse(bytes)?;
        Ok(Self {
            layers: LayerSet::from_bits_truncate(token.layers),
            max_buffer: token.max_buffer(),
        })
    }
}

/// The initiator's choice of layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSelection {
    /// The single layer the initiator chose.
    pub layer: Layer,
    /// The largest frame the initiator is willing to receive.
    pub max_buffer: u32,
    /// The identity the initiator wishes to act as, if it differs from the authenticated one.
    pub authorization_id: Option<String>,
}

impl LayerSelection {
    /// Encode the token; a buffer size above [`MAX_BUFFER_SIZE`] is clamped.
    pub fn encode(&self) -> Bytes {
        let authorization_id = self.authorization_id.as_deref().unwrap_or_default();
        let mut token = BytesMut::with_capacity(TOKEN_LEN + authorization_id.len());
        token.put(LayerToken::new(self.layer.bit().bits(), self.max_buffer).as_bytes());
        token.put(authorization_id.as_bytes());
        token.freeze()
    }

    /// Decode a token, rejecting anything but exactly one known layer bit.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (token, suffix) = LayerToken::parse(bytes)?;
        Ok(Self {
            layer: Layer::try_from(token.layers)?,
            max_buffer: token.max_buffer(),
            authorization_id: crate::identity::authorization_id_from_bytes(suffix)?,
        })
    }
}

/// Strength bounds for a session, relative to the strength the outer channel already provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPolicy {
    need: u32,
    allowed: u32,
    confidentiality_ssf: u32,
    max_buffer_size: u32,
}

impl LayerPolicy {
    /// Derive the policy from the session's security properties.
    ///
    /// `confidentiality_ssf` is the strength the mechanism's encryption provides.
    ///
    /// # Errors
    ///
    /// Fails if the minimum strength exceeds the maximum, or if no layer could ever reach the
    /// minimum.
    pub fn new(
        properties: &SecurityProperties,
        confidentiality_ssf: u32,
    ) -> Result<Self, PolicyError> {
        if properties.min_ssf > properties.max_ssf {
            return Err(PolicyError::InvertedBounds {
                min: properties.min_ssf,
                max: properties.max_ssf,
            });
        }
        let need = properties.min_ssf.saturating_sub(properties.external_ssf);
        if need > confidentiality_ssf {
            return Err(PolicyError::Unsatisfiable {
                min: properties.min_ssf,
                external: properties.external_ssf,
                available: confidentiality_ssf,
            });
        }

        Ok(Self {
            need,
            allowed: properties.max_ssf.saturating_sub(properties.external_ssf),
            confidentiality_ssf,
            max_buffer_size: properties.max_buffer_size,
        })
    }

    /// The strength factor a layer contributes.
    pub fn strength(&self, layer: Layer) -> u32 {
        match layer {
            Layer::None => 0,
            Layer::Integrity => 1,
            Layer::Confidentiality => self.confidentiality_ssf,
        }
    }

    /// Whether local policy accepts the given layer.
    ///
    /// A maximum buffer size of zero rules out every layer but [`Layer::None`].
    pub fn permits(&self, layer: Layer) -> bool {
        let strength = self.strength(layer);
        self.need <= strength
            && strength <= self.allowed
            && (layer == Layer::None || self.max_buffer_size > 0)
    }

    /// The layers a responder should announce.
    pub fn offered(&self) -> Result<LayerSet, PolicyError> {
        if self.need > 0 && self.max_buffer_size == 0 {
            return Err(PolicyError::LayerForbidden);
        }
        let offered = Layer::PREFERENCE
            .into_iter()
            .filter(|layer| self.permits(*layer))
            .fold(LayerSet::empty(), |set, layer| set | layer.bit());
        if offered.is_empty() {
            Err(PolicyError::NoAcceptableLayer { offered })
        } else {
            Ok(offered)
        }
    }

    /// Choose the strongest layer both the peer and local policy accept.
    pub fn choose(&self, offered: LayerSet) -> Result<Layer, PolicyError> {
        Layer::PREFERENCE
            .into_iter()
            .find(|layer| offered.contains(layer.bit()) && self.permits(*layer))
            .ok_or(PolicyError::NoAcceptableLayer { offered })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn properties(min_ssf: u32, max_ssf: u32, external_ssf: u32) -> SecurityProperties {
        SecurityProperties {
            min_ssf,
            max_ssf,
            external_ssf,
            ..Default::default()
        }
    }

    #[test]
    fn announcement_round_trip() -> anyhow::Result<()> {
        let announcement = LayerAnnouncement {
            layers: LayerSet::from_bits_truncate(0b111),
            max_buffer: 0xABCDEF,
        };
        let encoded = announcement.encode();
        assert_eq!(&encoded[..], &[0x07, 0xAB, 0xCD, 0xEF]);
        assert_eq!(LayerAnnouncement::decode(&encoded)?, announcement);

        Ok(())
    }

    #[test]
    fn short_tokens_rejected() {
        for len in 0..TOKEN_LEN {
            let token = vec![0x01; len];
            assert_eq!(
                LayerAnnouncement::decode(&token),
                Err(ProtocolError::TokenTooShort { len })
            );
            assert_eq!(
                LayerSelection::decode(&token),
                Err(ProtocolError::TokenTooShort { len })
            );
        }
    }

    // Selection must name exactly one layer this implementation knows about.
    #[test]
    fn selection_bits_validated() {
        for bits in [0x00, 0b011, 0b101, 0b111, 0x08, 0x81] {
            assert_eq!(
                LayerSelection::decode(&[bits, 0, 0, 0]),
                Err(ProtocolError::InvalidSelection { bits })
            );
        }
        for (bits, layer) in [
            (0x01, Layer::None),
            (0x02, Layer::Integrity),
            (0x04, Layer::Confidentiality),
        ] {
            let selection = LayerSelection::decode(&[bits, 0, 1, 0]).unwrap();
            assert_eq!(selection.layer, layer);
            assert_eq!(selection.max_buffer, 256);
            assert_eq!(selection.authorization_id, None);
        }
    }

    #[test]
    fn selection_with_authorization_id() -> anyhow::Result<()> {
        let selection = LayerSelection {
            layer: Layer::Integrity,
            max_buffer: 65536,
            authorization_id: Some("admin".to_string()),
        };
        let encoded = selection.encode();
        assert_eq!(&encoded[..], b"\x02\x01\x00\x00admin");
        assert_eq!(LayerSelection::decode(&encoded)?, selection);

        Ok(())
    }

    #[test]
    fn announcement_ignores_unknown_bits() -> anyhow::Result<()> {
        let announcement = LayerAnnouncement::decode(&[0xF2, 0, 0, 4, 0xFF])?;
        assert_eq!(announcement.layers, LayerSet::INTEGRITY);
        assert_eq!(announcement.max_buffer, 4);

        Ok(())
    }

    #[test]
    fn inverted_bounds() {
        assert_eq!(
            LayerPolicy::new(&properties(2, 1, 0), 56),
            Err(PolicyError::InvertedBounds { min: 2, max: 1 })
        );
    }

    #[test]
    fn unsatisfiable_minimum() {
        assert_eq!(
            LayerPolicy::new(&properties(112, 112, 0), 56),
            Err(PolicyError::Unsatisfiable {
                min: 112,
                external: 0,
                available: 56
            })
        );
        // An outer channel can make up the difference.
        assert!(LayerPolicy::new(&properties(112, 256, 56), 56).is_ok());
    }

    #[test]
    fn strong_minimum_refuses_weak_offer() -> anyhow::Result<()> {
        let policy = LayerPolicy::new(&properties(112, 112, 0), 112)?;
        let offered = LayerSet::NONE | LayerSet::INTEGRITY;
        assert_eq!(
            policy.choose(offered),
            Err(PolicyError::NoAcceptableLayer { offered })
        );

        Ok(())
    }

    #[test]
    fn external_strength_lowers_requirement() -> anyhow::Result<()> {
        let policy = LayerPolicy::new(&properties(56, 256, 256), 56)?;
        assert_eq!(policy.offered()?, LayerSet::NONE);
        assert_eq!(policy.choose(LayerSet::all())?, Layer::None);

        Ok(())
    }

    #[test]
    fn zero_buffer_forbids_layers() -> anyhow::Result<()> {
        let mut props = properties(0, 256, 0);
        props.max_buffer_size = 0;
        let policy = LayerPolicy::new(&props, 56)?;
        assert_eq!(policy.offered()?, LayerSet::NONE);

        props.min_ssf = 1;
        let policy = LayerPolicy::new(&props, 56)?;
        assert_eq!(policy.offered(), Err(PolicyError::LayerForbidden));

        Ok(())
    }

    #[test]
    fn empty_offer_is_an_error() -> anyhow::Result<()> {
        // Integrity is too weak and confidentiality too strong.
        let policy = LayerPolicy::new(&properties(2, 40, 0), 56)?;
        assert_eq!(
            policy.offered(),
            Err(PolicyError::NoAcceptableLayer {
                offered: LayerSet::empty()
            })
        );

        Ok(())
    }

    #[test]
    fn buffer_size_clamped_when_encoding() {
        let encoded = LayerAnnouncement {
            layers: LayerSet::NONE,
            max_buffer: u32::MAX,
        }
        .encode();
        assert_eq!(&encoded[..], &[0x01, 0xFF, 0xFF, 0xFF]);
    }

    fn layer_set() -> impl Strategy<Value = LayerSet> {
        (0u8..8).prop_map(LayerSet::from_bits_truncate)
    }

    proptest! {
        #[test]
        fn strongest_acceptable_layer_chosen(
            min in 0u32..300,
            spread in 0u32..300,
            external in 0u32..300,
            confidentiality_ssf in prop::sample::select(vec![56u32, 112]),
            offered in layer_set(),
        ) {
            let props = properties(min, min + spread, external);
            if let Ok(policy) = LayerPolicy::new(&props, confidentiality_ssf) {
                let acceptable: Vec<Layer> = Layer::PREFERENCE
                    .into_iter()
                    .filter(|layer| offered.contains(layer.bit()) && policy.permits(*layer))
                    .collect();
                match policy.choose(offered) {
                    Ok(layer) => {
                        prop_assert_eq!(Some(&layer), acceptable.first());
                        prop_assert!(acceptable.iter().all(|other| *other <= layer));
                    }
                    Err(error) => {
                        prop_assert!(acceptable.is_empty());
                        prop_assert_eq!(error, PolicyError::NoAcceptableLayer { offered });
                    }
                }
            }
        }

        #[test]
        fn inverted_bounds_always_rejected(
            min in 1u32..,
            gap in 1u32..1000,
            external in any::<u32>(),
        ) {
            let props = properties(min, min.saturating_sub(gap), external);
            prop_assert!(
                matches!(
                    LayerPolicy::new(&props, 56),
                    Err(PolicyError::InvertedBounds { .. })
                ),
                "inverted bounds must be rejected"
            );
        }

        #[test]
        fn buffer_size_round_trips_within_ceiling(max_buffer in any::<u32>(), bits in 0u8..8) {
            let layers = LayerSet::from_bits_truncate(bits);
            let decoded = LayerAnnouncement::decode(
                &LayerAnnouncement { layers, max_buffer }.encode()
            ).unwrap();
            prop_assert_eq!(decoded.max_buffer, max_buffer.min(MAX_BUFFER_SIZE));
            prop_assert_eq!(decoded.layers, layers);
        }
    }
}
