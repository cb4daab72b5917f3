// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the backend API targeted by these decoders. The decoders themselves do
//! hold the decoding state (parameter sets, reference pictures, output order) so the backend only
//! has to decode the pictures it is given into the surfaces it is told to use.

pub mod h264;

use thiserror::Error;

use crate::codec::h264::nalu::NaluError;
use crate::codec::h264::parser::ParameterSetError;

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Where the decoder stands with respect to the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum DecodingState {
    /// No sequence has been started yet.
    #[default]
    AwaitingStreamInfo,
    /// Decoder is currently decoding input.
    Decoding,
    /// The reference pictures have been lost, through a flush or a broken field pair. Pictures
    /// are still decoded but flagged as bad until the next IDR picture.
    Reset,
}

/// Errors raised while decoding.
///
/// The stream-level variants (everything but [`DecodeError::BackendError`] and
/// [`DecodeError::InvalidConfig`]) are handled inside the decoder: they are logged, counted, and
/// the offending picture is flagged or dropped. Only backend failures and unusable
/// configuration records reach the caller.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A parameter set or slice header could not be parsed.
    #[error("malformed syntax: {0:#}")]
    MalformedSyntax(anyhow::Error),
    /// A slice refers to a parameter set that has not been received.
    #[error("missing parameter set: {0}")]
    MissingReference(#[from] ParameterSetError),
    /// A predicted picture has fewer usable references than it uses.
    #[error("{available} usable reference frames, {required} required")]
    ReferenceStarvation { available: usize, required: usize },
    /// A field does not complement the first field it follows.
    #[error("field with frame_num {second} does not complement first field {first}")]
    WrongField { first: u32, second: u32 },
    /// The bitstream of a picture is larger than allowed.
    #[error("picture bitstream of {size} bytes exceeds the {max} bytes limit")]
    BufferOverrun { size: usize, max: usize },
    #[error("invalid decoder configuration record: {0}")]
    InvalidConfig(#[from] NaluError),
    #[error(transparent)]
    BackendError(#[from] StatelessBackendError),
}
