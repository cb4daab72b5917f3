// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 bitstream parsing and decoded picture buffer management for
//! stateless hardware decoders.
//!
//! The [`codec::h264`] module contains the building blocks: NAL unit
//! scanning, parameter set and slice header parsing, picture order count
//! computation, the DPB and access unit boundary detection. The
//! [`decoder::stateless::h264::H264Decoder`] ties them together and drives a
//! backend implementing
//! [`decoder::stateless::h264::StatelessH264DecoderBackend`].

pub mod bitstream_utils;
pub mod codec;
pub mod decoder;

#[cfg(test)]
pub(crate) mod backend;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

#[cfg(test)]
mod tests {
    use super::Resolution;

    #[test]
    fn resolution_conversions() {
        let res = Resolution::from((1920, 1080));
        assert_eq!(res.width, 1920);
        assert_eq!(res.height, 1080);
        assert_eq!(<(u32, u32)>::from(res), (1920, 1080));

        assert!(res.can_contain(Resolution::from((1280, 720))));
        assert!(!res.can_contain(Resolution::from((1920, 1088))));
    }
}
