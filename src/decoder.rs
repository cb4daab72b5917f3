// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder-side types shared between the pipeline and its backends.

pub mod stateless;

use crate::codec::h264::parser::Rect;
use crate::codec::h264::parser::Sps;
use crate::Resolution;

/// Default limit for the bitstream of a single picture.
pub const DEFAULT_MAX_PICTURE_SIZE: usize = 8 * 1024 * 1024;

/// Framing of the NAL units in the buffers passed to the decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Units are delimited by `00 00 01` start codes (ITU-T H.264 Annex B).
    #[default]
    AnnexB,
    /// Units are preceded by a big endian length field of `length_size`
    /// bytes, as found in MP4 containers.
    LengthPrefixed { length_size: u8 },
}

/// Stream properties known by the container, used until the stream itself
/// provides them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerHints {
    /// Frame duration in 90 kHz ticks, 0 if unknown.
    pub frame_duration: u32,
    /// Sample aspect ratio as `(width, height)`.
    pub aspect_ratio: Option<(u16, u16)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    pub wire_format: WireFormat,
    /// Pictures whose bitstream grows past this many bytes are dropped.
    pub max_picture_size: usize,
    pub hints: ContainerHints,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            wire_format: Default::default(),
            max_picture_size: DEFAULT_MAX_PICTURE_SIZE,
            hints: Default::default(),
        }
    }
}

/// Per-buffer flags given by the demuxer.
///
/// Without them, picture boundaries are inferred from the NAL units alone,
/// which means a picture is only complete once the first NAL unit of the next
/// one has been seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// The buffer starts a new picture.
    pub frame_start: bool,
    /// The buffer ends the current picture.
    pub frame_end: bool,
}

/// Decoding parameters of a sequence, as announced to the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Size of the decoded surfaces.
    pub coded_resolution: Resolution,
    /// Size of the part of the surfaces meant to be displayed.
    pub display_resolution: Resolution,
    pub visible_rect: Rect<u32>,
    /// Number of frames the DPB can hold. The backend needs at least this
    /// many surfaces, plus the one being decoded.
    pub max_dpb_frames: usize,
    pub interlaced: bool,
    /// Frame duration in 90 kHz ticks, 0 if unknown.
    pub frame_duration: u32,
    pub sample_aspect_ratio: Option<(u16, u16)>,
}

impl StreamInfo {
    /// Builds the stream information of `sps`, falling back to `hints` for
    /// what the VUI does not say.
    pub fn new(sps: &Sps, hints: &ContainerHints) -> Self {
        let visible_rect = sps.visible_rectangle();

        let frame_duration = match sps.frame_duration() {
            0 => hints.frame_duration,
            duration => duration,
        };

        let sample_aspect_ratio = if sps.vui_parameters_present_flag {
            sps.vui_parameters.sample_aspect_ratio()
        } else {
            None
        }
        .or(hints.aspect_ratio);

        Self {
            coded_resolution: Resolution::from((sps.width(), sps.height())),
            display_resolution: Resolution::from((
                visible_rect.max.x - visible_rect.min.x,
                visible_rect.max.y - visible_rect.min.y,
            )),
            visible_rect,
            max_dpb_frames: sps.max_dpb_frames(),
            interlaced: !sps.frame_mbs_only_flag,
            frame_duration,
            sample_aspect_ratio,
        }
    }
}

/// Lock shared with other users of the hardware decoder.
///
/// The decoder takes it once around every picture submission and always
/// releases it afterwards, whether the submission succeeded or not.
pub trait DecodeLock {
    fn lock(&self);
    fn unlock(&self);
}

/// Holds a [`DecodeLock`] until dropped.
pub(crate) struct DecodeLockGuard<'a>(&'a dyn DecodeLock);

impl<'a> DecodeLockGuard<'a> {
    pub(crate) fn new(lock: &'a dyn DecodeLock) -> Self {
        lock.lock();
        Self(lock)
    }
}

impl Drop for DecodeLockGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Counters of what happened to the pictures of the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Pictures (frames or fields) handed to the backend for decoding.
    pub rendered: u64,
    /// Frames, field pairs or lone fields handed to the backend for display.
    pub presented: u64,
    /// Pictures dropped without being rendered or presented.
    pub dropped: u64,
    /// Rendered pictures carrying the bad frame flag.
    pub bad: u64,
}
