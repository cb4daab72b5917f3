// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for codec backends.
//!
//! A backend is a provider of hardware-accelerated decoding, driven by the decoders of this crate
//! through the traits in [`crate::decoder::stateless`]. Real backends live outside of this crate;
//! the one here only serves the tests.

pub(crate) mod dummy;
