// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Multipart framing.
//!
//! One message is one envelope: a u32 big-endian length followed by the envelope payload, which
//! is a sequence of length-prefixed frames (`u32 len | bytes`, repeated). The envelope boundary
//! keeps the stream in sync, so a malformed envelope interior can be discarded without dropping
//! the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const LOG_TARGET: &str = "hive::message::codec";

const LEN_PREFIX: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("envelope of {size} bytes exceeds the maximum of {max}")]
    EnvelopeTooLarge { size: usize, max: usize },
    #[error("malformed envelope interior")]
    Malformed,
}

#[derive(Debug, Clone)]
pub struct MultipartCodec {
    max_envelope_size: usize,
}

impl MultipartCodec {
    pub fn new(max_envelope_size: usize) -> Self {
        Self { max_envelope_size }
    }
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024)
    }
}

impl Encoder<Vec<Bytes>> for MultipartCodec {
    type Error = CodecError;

    fn encode(&mut self, frames: Vec<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size: usize = frames.iter().map(|f| LEN_PREFIX + f.len()).sum();
        if size > self.max_envelope_size {
            return Err(CodecError::EnvelopeTooLarge {
                size,
                max: self.max_envelope_size,
            });
        }
        dst.reserve(LEN_PREFIX + size);
        dst.put_u32(size as u32);
        for frame in frames {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(&frame);
        }
        Ok(())
    }
}

impl Decoder for MultipartCodec {
    type Error = CodecError;
    type Item = Vec<Bytes>;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < LEN_PREFIX {
                return Ok(None);
            }
            let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if size > self.max_envelope_size {
                return Err(CodecError::EnvelopeTooLarge {
                    size,
                    max: self.max_envelope_size,
                });
            }
            if src.len() < LEN_PREFIX + size {
                src.reserve(LEN_PREFIX + size - src.len());
                return Ok(None);
            }
            src.advance(LEN_PREFIX);
            let envelope = src.split_to(size).freeze();
            match split_frames(envelope) {
                Ok(frames) => return Ok(Some(frames)),
                Err(_) => {
                    // Discard the bad envelope and try the next one; the stream stays in sync.
                    log::warn!(target: LOG_TARGET, "discarding malformed multipart envelope");
                    continue;
                },
            }
        }
    }
}

fn split_frames(mut envelope: Bytes) -> Result<Vec<Bytes>, CodecError> {
    let mut frames = Vec::new();
    while !envelope.is_empty() {
        if envelope.len() < LEN_PREFIX {
            return Err(CodecError::Malformed);
        }
        let len = envelope.get_u32() as usize;
        if envelope.len() < len {
            return Err(CodecError::Malformed);
        }
        frames.push(envelope.split_to(len));
    }
    Ok(frames)
}

/// Pack frames into a standalone byte vector (no outer envelope prefix). Used by the embed
/// serializer extension.
pub fn frames_to_vec(frames: &[Bytes]) -> Vec<u8> {
    let size: usize = frames.iter().map(|f| LEN_PREFIX + f.len()).sum();
    let mut buf = Vec::with_capacity(size);
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    buf
}

/// Inverse of [`frames_to_vec`].
pub fn frames_from_slice(bytes: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    split_frames(Bytes::copy_from_slice(bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    fn frames(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = MultipartCodec::default();
        let mut buf = BytesMut::new();
        let original = frames(&[b"source", b"id", b"REQ", b"echo.echo", b"{}", b"body"]);
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_envelope_waits_for_more_data() {
        let mut codec = MultipartCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frames(&[b"a", b"b"]), &mut buf).unwrap();
        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn two_envelopes_in_one_buffer() {
        let mut codec = MultipartCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frames(&[b"one"]), &mut buf).unwrap();
        codec.encode(frames(&[b"two"]), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frames(&[b"one"]));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frames(&[b"two"]));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_envelope_is_rejected() {
        let mut codec = MultipartCodec::new(16);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frames(&[&[0u8; 64]]), &mut buf),
            Err(CodecError::EnvelopeTooLarge { .. })
        ));
    }

    #[test]
    fn malformed_interior_is_skipped() {
        let mut codec = MultipartCodec::default();
        let mut buf = BytesMut::new();
        // An envelope whose interior claims a frame longer than the envelope
        buf.put_u32(6);
        buf.put_u32(100);
        buf.put_slice(b"xx");
        codec.encode(frames(&[b"good"]), &mut buf).unwrap();
        // The malformed envelope is discarded and the next one decodes
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frames(&[b"good"]));
    }

    #[test]
    fn frames_vec_roundtrip() {
        let original = frames(&[b"a", b"", b"ccc"]);
        let buf = frames_to_vec(&original);
        assert_eq!(frames_from_slice(&buf).unwrap(), original);
    }
}
