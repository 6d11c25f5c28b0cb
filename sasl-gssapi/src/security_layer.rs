// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The protection layer applied to application data after authentication.
//!
//! Each frame is a message wrapped by the security provider and prefixed with its length as a
//! 32-bit big-endian integer. Frames may arrive split across any number of reads; the decoder
//! keeps the partial frame until the rest arrives.

use std::{borrow::Cow, io::IoSlice};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, network_endian::U32};

use crate::{
    error::{Error, PolicyError, ProtocolError, ProviderResultExt},
    mechanism::Negotiated,
    negotiation::Layer,
    provider::SecurityProvider,
};

/// The length prefix of every frame.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FrameHeader {
    length: U32,
}

/// The length of the frame header.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Protects outgoing and verifies incoming application data for an authenticated session.
///
/// With [`Layer::None`] negotiated, data passes through untouched and unframed.
///
/// Any failure to protect or verify a frame is fatal: every later call fails with
/// [`Error::SessionFailed`].
pub struct SecurityLayer<P: SecurityProvider> {
    provider: P,
    context: P::Context,
    layer: Layer,
    max_output: u32,
    reassembly: BytesMut,
    failed: bool,
}

impl<P: SecurityProvider> SecurityLayer<P> {
    pub(crate) fn new(provider: P, context: P::Context, negotiated: &Negotiated) -> Self {
        Self {
            provider,
            context,
            layer: negotiated.layer,
            max_output: negotiated.max_output,
            reassembly: BytesMut::new(),
            failed: false,
        }
    }

    /// The negotiated protection layer.
    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// The largest plaintext carried in a single outgoing frame.
    pub fn max_output(&self) -> u32 {
        self.max_output
    }

    /// The number of bytes of an incomplete frame waiting for more input.
    pub fn buffered(&self) -> usize {
        self.reassembly.len()
    }

    /// Protect `plaintext` for sending.
    ///
    /// Plaintext longer than [`Self::max_output`] is split across several frames; the returned
    /// bytes are the concatenation of all of them.
    pub fn encode(&mut self, plaintext: &[u8]) -> Result<Bytes, Error> {
        let mut output = BytesMut::new();
        self.encode_into(plaintext, &mut output)?;
        Ok(output.freeze())
    }

    /// Protect the concatenation of `pieces` for sending.
    pub fn encode_vectored(&mut self, pieces: &[IoSlice<'_>]) -> Result<Bytes, Error> {
        let plaintext: Cow<'_, [u8]> = match pieces {
            [piece] => Cow::Borrowed(&**piece),
            pieces => {
                let mut joined = Vec::with_capacity(pieces.iter().map(|piece| piece.len()).sum());
                for piece in pieces {
                    joined.extend_from_slice(piece);
                }
                Cow::Owned(joined)
            }
        };
        self.encode(&plaintext)
    }

    fn encode_into(&mut self, plaintext: &[u8], output: &mut BytesMut) -> Result<(), Error> {
        if self.failed {
            return Err(Error::SessionFailed);
        }
        let result = self.protect(plaintext, output);
        self.failed = result.is_err();
        result
    }

    fn protect(&mut self, plaintext: &[u8], output: &mut BytesMut) -> Result<(), Error> {
        if self.layer == Layer::None {
            output.put_slice(plaintext);
            return Ok(());
        }
        if self.max_output == 0 {
            return Err(PolicyError::PeerBufferTooSmall { layer: self.layer }.into());
        }
        if plaintext.is_empty() {
            return self.wrap_frame(plaintext, output);
        }

        let frame_size = usize::try_from(self.max_output).unwrap_or(usize::MAX);
        for chunk in plaintext.chunks(frame_size) {
            self.wrap_frame(chunk, output)?;
        }
        Ok(())
    }

    fn wrap_frame(&mut self, plaintext: &[u8], output: &mut BytesMut) -> Result<(), Error> {
        let wrapped = self
            .provider
            .wrap(&mut self.context, self.layer.is_confidential(), plaintext)
            .during("wrap")?;
        let length = u32::try_from(wrapped.len())
            .map_err(|_| ProtocolError::FrameTooLarge { len: wrapped.len() })?;
        let header = FrameHeader {
            length: U32::new(length),
        };
        output.reserve(HEADER_LEN + wrapped.len());
        output.put_slice(header.as_bytes());
        output.put(wrapped);
        Ok(())
    }

    /// Feed bytes received from the peer, returning the plaintext of every frame completed.
    ///
    /// Bytes belonging to an incomplete frame are kept for the next call. If a frame fails to
    /// verify, the plaintext of frames completed earlier in the same call is discarded along
    /// with the layer itself.
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<Bytes>, Error> {
        if self.layer == Layer::None {
            return Ok(if input.is_empty() {
                vec![]
            } else {
                vec![Bytes::copy_from_slice(input)]
            });
        }

        let mut buffer = std::mem::take(&mut self.reassembly);
        buffer.extend_from_slice(input);
        let mut messages = Vec::new();
        let result = loop {
            match self.decode_frame(&mut buffer) {
                Ok(Some(plaintext)) => messages.push(plaintext),
                Ok(None) => break Ok(messages),
                Err(error) => break Err(error),
            }
        };
        self.reassembly = buffer;
        result
    }

    fn decode_frame(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        if self.failed {
            return Err(Error::SessionFailed);
        }
        let result = self.next_frame(buffer);
        self.failed = result.is_err();
        result
    }

    fn next_frame(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        let Ok((header, _)) = FrameHeader::read_from_prefix(&buffer[..]) else {
            return Ok(None);
        };
        let frame_len = header.length.get() as usize;
        if buffer.len() < HEADER_LEN.saturating_add(frame_len) {
            return Ok(None);
        }
        self.unwrap_frame(buffer, frame_len).map(Some)
    }

    fn unwrap_frame(&mut self, buffer: &mut BytesMut, frame_len: usize) -> Result<Bytes, Error> {
        buffer.advance(HEADER_LEN);
        let frame = buffer.split_to(frame_len);
        if frame.is_empty() {
            return Ok(Bytes::new());
        }

        let unwrapped = self
            .provider
            .unwrap(&mut self.context, &frame)
            .during("unwrap")?;
        if self.layer.is_confidential() && !unwrapped.confidential {
            return Err(ProtocolError::InsufficientProtection {
                negotiated: self.layer,
                received: Layer::Integrity,
            }
            .into());
        }
        Ok(unwrapped.plaintext)
    }
}

impl<P: SecurityProvider> Decoder for SecurityLayer<P> {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.layer == Layer::None {
            return Ok((!src.is_empty()).then(|| src.split().freeze()));
        }
        self.decode_frame(src)
    }
}

impl<P: SecurityProvider> Encoder<Bytes> for SecurityLayer<P> {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_into(&item, dst)
    }
}

impl<P: SecurityProvider> std::fmt::Debug for SecurityLayer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("layer", &self.layer)
            .field("max_output", &self.max_output)
            .field("buffered", &self.reassembly.len())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}
