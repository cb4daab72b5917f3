// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation. It decodes nothing and records every
//! call it receives.

use std::rc::Rc;

use bytes::Bytes;

use crate::codec::h264::parser::Sps;
use crate::decoder::stateless::h264::PictureInfo;
use crate::decoder::stateless::h264::StatelessH264DecoderBackend;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::StreamInfo;

/// Surfaces are plain numbers, allocated in increasing order.
pub type Surface = u32;

pub struct RenderedPicture {
    pub surface: Surface,
    pub info: PictureInfo<Surface>,
    pub slices: Vec<Bytes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentedPicture {
    pub surface: Surface,
    pub timestamp: u64,
    pub top_field_first: bool,
    pub progressive: bool,
}

#[derive(Default)]
pub struct Backend {
    next_surface: Surface,
    pub sequences: Vec<StreamInfo>,
    pub rendered: Vec<RenderedPicture>,
    pub presented: Vec<PresentedPicture>,
    pub flushes: usize,
    pub discontinuities: usize,
    /// Makes `render_picture` fail.
    pub fail_render: bool,
}

impl Backend {
    pub fn new() -> Self {
        Default::default()
    }

    /// Timestamps of the presented pictures, in presentation order.
    pub fn presented_timestamps(&self) -> Vec<u64> {
        self.presented.iter().map(|p| p.timestamp).collect()
    }

    /// Picture order count the presented surfaces were rendered with, taken
    /// from the first render call of each surface.
    pub fn presented_pocs(&self) -> Vec<i32> {
        self.presented
            .iter()
            .filter_map(|p| {
                self.rendered
                    .iter()
                    .find(|r| r.surface == p.surface)
                    .map(|r| r.info.pic_order_cnt())
            })
            .collect()
    }
}

impl StatelessH264DecoderBackend for Backend {
    type Surface = Surface;

    fn new_sequence(&mut self, _: &Rc<Sps>, info: &StreamInfo) -> StatelessBackendResult<()> {
        self.sequences.push(info.clone());
        Ok(())
    }

    fn new_surface(&mut self, _: u64) -> StatelessBackendResult<Surface> {
        let surface = self.next_surface;
        self.next_surface += 1;
        Ok(surface)
    }

    fn render_picture(
        &mut self,
        surface: &Surface,
        info: &PictureInfo<Surface>,
        slices: &[Bytes],
    ) -> StatelessBackendResult<()> {
        if self.fail_render {
            return Err(StatelessBackendError::OutOfResources);
        }

        self.rendered.push(RenderedPicture {
            surface: *surface,
            info: info.clone(),
            slices: slices.to_vec(),
        });

        Ok(())
    }

    fn present_picture(
        &mut self,
        surface: Surface,
        timestamp: u64,
        top_field_first: bool,
        progressive: bool,
    ) -> StatelessBackendResult<()> {
        self.presented.push(PresentedPicture {
            surface,
            timestamp,
            top_field_first,
            progressive,
        });

        Ok(())
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }

    fn discontinuity(&mut self) {
        self.discontinuities += 1;
    }
}
