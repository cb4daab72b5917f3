#![no_main]

use std::rc::Rc;

use bytes::Bytes;
use cros_h264::codec::h264::parser::Sps;
use cros_h264::decoder::stateless::h264::H264Decoder;
use cros_h264::decoder::stateless::h264::PictureInfo;
use cros_h264::decoder::stateless::h264::StatelessH264DecoderBackend;
use cros_h264::decoder::stateless::StatelessBackendResult;
use cros_h264::decoder::StreamInfo;
use libfuzzer_sys::fuzz_target;

/// Backend that accepts everything and decodes nothing.
#[derive(Default)]
struct NullBackend(u32);

impl StatelessH264DecoderBackend for NullBackend {
    type Surface = u32;

    fn new_sequence(&mut self, _: &Rc<Sps>, _: &StreamInfo) -> StatelessBackendResult<()> {
        Ok(())
    }

    fn new_surface(&mut self, _: u64) -> StatelessBackendResult<u32> {
        self.0 = self.0.wrapping_add(1);
        Ok(self.0)
    }

    fn render_picture(
        &mut self,
        _: &u32,
        _: &PictureInfo<u32>,
        _: &[Bytes],
    ) -> StatelessBackendResult<()> {
        Ok(())
    }

    fn present_picture(&mut self, _: u32, _: u64, _: bool, _: bool) -> StatelessBackendResult<()> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let mut decoder = H264Decoder::new(NullBackend::default(), Default::default());

    // Feed the input in uneven chunks to exercise NAL units split across buffers.
    for (i, chunk) in data.chunks(4093).enumerate() {
        let _ = decoder.decode(i as u64 + 1, chunk);
    }
    let _ = decoder.flush();
});
