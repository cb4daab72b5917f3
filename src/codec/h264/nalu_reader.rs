// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;
use thiserror::Error;

/// Removes the emulation prevention bytes (the `03` in `00 00 03`) from `data`,
/// in place. Returns the number of bytes removed.
pub fn unescape_rbsp(data: &mut Vec<u8>) -> usize {
    let mut zeros = 0;
    let mut write = 0;

    for read in 0..data.len() {
        let byte = data[read];

        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        data[write] = byte;
        write += 1;
    }

    let removed = data.len() - write;
    data.truncate(write);
    removed
}

#[derive(Debug, Error)]
pub enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error)]
pub enum ReadBitsError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

/// A bit reader for unescaped h264 RBSP data.
///
/// Reads are MSB first. Once a read goes past the end of the buffer the reader is
/// flagged as overflowed and every subsequent read fails, so a partially parsed
/// syntax structure can never be mistaken for a valid one.
pub struct NaluReader<'a> {
    data: &'a [u8],
    /// Index of the next bit to be read.
    pos: usize,
    /// Sticky flag set by the first out-of-bounds read.
    overflowed: bool,
}

impl<'a> NaluReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            overflowed: false,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        let bit = self.read_bits::<u32>(1)?;
        Ok(bit == 1)
    }

    /// Read up to 32 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        if self.overflowed || num_bits > self.num_bits_left() {
            self.overflowed = true;
            self.pos = self.data.len() * 8;
            return Err(GetByteError::OutOfBits.into());
        }

        let mut out = 0u64;
        let mut bits_left = num_bits;

        while bits_left > 0 {
            let byte = self.data[self.pos / 8];
            let avail = 8 - self.pos % 8;
            let take = std::cmp::min(avail, bits_left);
            let chunk = (byte >> (avail - take)) & (((1u16 << take) - 1) as u8);

            out = (out << take) | u64::from(chunk);
            self.pos += take;
            bits_left -= take;
        }

        let out = u32::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)?;
        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    /// Number of bits consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether a read went past the end of the data.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn byte_aligned(&self) -> bool {
        self.pos % 8 == 0
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data(): there is
    /// more data if the current position is before the rbsp_stop_one_bit, which is the
    /// last bit set in the buffer.
    pub fn has_more_rsbp_data(&self) -> bool {
        let Some(last) = self.data.iter().rposition(|b| *b != 0) else {
            return false;
        };

        let stop_bit = last * 8 + 7 - self.data[last].trailing_zeros() as usize;
        self.pos < stop_bit
    }

    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(anyhow!("Invalid stream"));
            }
        }

        let mut value = (1u64 << num_bits) - 1;
        if num_bits > 0 {
            value += u64::from(self.read_bits::<u32>(num_bits)?);
        }

        let value = u32::try_from(value).map_err(|_| anyhow!("Invalid stream"))?;
        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue()?;
        if ue > max || ue < min {
            Err(anyhow!(
                "Value out of bounds: expected {} - {}, got {}",
                min,
                max,
                ue
            ))
        } else {
            Ok(U::try_from(ue).map_err(|_| anyhow!("Conversion error"))?)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        self.read_ue_bounded(0, max)
    }

    pub fn read_se<U: TryFrom<i32>>(&mut self) -> anyhow::Result<U> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let se = if ue % 2 == 0 { -ue / 2 } else { ue / 2 + 1 };
        let se = i32::try_from(se).map_err(|_| anyhow!("Invalid stream"))?;

        U::try_from(se).map_err(|_| anyhow!("Conversion error"))
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> anyhow::Result<U> {
        let se = self.read_se()?;
        if se < min || se > max {
            Err(anyhow!(
                "Value out of bounds, expected between {}-{}, got {}",
                min,
                max,
                se
            ))
        } else {
            Ok(U::try_from(se).map_err(|_| anyhow!("Conversion error"))?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests are adapted from the chromium tests at media/video/h264_bit_reader_unitttest.cc

    #[test]
    fn read_stream_without_escape_and_trailing_zero_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.num_bits_left(), 7);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 6);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn single_byte_stream() {
        const RBSP: [u8; 1] = [0x18];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());
        assert_eq!(reader.read_bits::<u32>(4).unwrap(), 1);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn stop_bit_occupy_full_byte() {
        const RBSP: [u8; 2] = [0xab, 0x80];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.num_bits_left(), 16);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xab);
        assert_eq!(reader.num_bits_left(), 8);

        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn full_32_bit_read() {
        const RBSP: [u8; 5] = [0xde, 0xad, 0xbe, 0xef, 0x80];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(32).unwrap(), 0xdeadbeef);
        assert!(reader.byte_aligned());
        assert!(matches!(
            reader.read_bits::<u32>(33),
            Err(ReadBitsError::TooManyBitsRequested(33))
        ));
    }

    #[test]
    fn overflow_is_sticky() {
        const RBSP: [u8; 1] = [0xff];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u8>(4).unwrap(), 0xf);
        assert!(!reader.overflowed());

        assert!(reader.read_bits::<u8>(5).is_err());
        assert!(reader.overflowed());
        assert_eq!(reader.num_bits_left(), 0);

        // Everything fails from now on, even reads that would have fit before.
        assert!(reader.read_bit().is_err());
        assert!(reader.read_ue::<u32>().is_err());
    }

    #[test]
    fn exp_golomb_first_codes() {
        // 1 010 011 00100 00101 0001000 -> ue 0, 1, 2, 3, 4, 7
        const RBSP: [u8; 4] = [0b1010_0110, 0b0100_0010, 0b1000_1000, 0b1000_0000];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 2);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 3);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 4);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 7);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn signed_exp_golomb_mapping() {
        // ue 1, 2, 3, 4 -> se 1, -1, 2, -2
        const RBSP: [u8; 3] = [0b0100_1100, 0b1000_0101, 0b1000_0000];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_se::<i32>().unwrap(), 1);
        assert_eq!(reader.read_se::<i32>().unwrap(), -1);
        assert_eq!(reader.read_se::<i32>().unwrap(), 2);
        assert_eq!(reader.read_se::<i32>().unwrap(), -2);
    }

    #[test]
    fn bounded_reads() {
        // ue 7
        const RBSP: [u8; 1] = [0b0001_0001];

        let mut reader = NaluReader::new(&RBSP);
        assert!(reader.read_ue_max::<u32>(6).is_err());

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_ue_bounded::<u8>(7, 7).unwrap(), 7);
    }

    #[test]
    fn unescape_removes_emulation_prevention() {
        let mut data = vec![0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03];
        assert_eq!(unescape_rbsp(&mut data), 3);
        assert_eq!(data, vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);

        // A 03 that does not follow two zeros is payload.
        let mut data = vec![0x00, 0x03, 0x00, 0x03];
        assert_eq!(unescape_rbsp(&mut data), 0);
        assert_eq!(data, vec![0x00, 0x03, 0x00, 0x03]);
    }
}
