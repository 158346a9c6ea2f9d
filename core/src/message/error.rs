// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

use crate::serializer::SerializerError;

/// A message could not be packed or unpacked. Bad inbound frames are discarded with a warning;
/// the receiving connection is not dropped.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("bad message frame count: got {0}, expected 6")]
    BadFrameCount(usize),
    #[error("message {0} must be utf-8 encoded")]
    InvalidUtf8(&'static str),
    #[error("unknown message type tag: {0:?}")]
    UnknownType(Vec<u8>),
    #[error(transparent)]
    Serializer(#[from] SerializerError),
}
