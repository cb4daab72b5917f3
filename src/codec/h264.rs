// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod boundary;
pub mod dpb;
pub mod nalu;
pub mod nalu_reader;
pub mod nalu_writer;
pub mod parser;
pub mod picture;
pub mod poc;
pub mod synthesizer;
