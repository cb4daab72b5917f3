// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL unit framing: header parsing, Annex-B start code scanning (including
//! streaming input split across several buffers), length-prefixed (AVCC)
//! splitting, and the AVCC decoder configuration record.

use std::io::Cursor;
use std::io::Read;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::ReadBytesExt;
use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use enumn::N;
use log::debug;
use log::warn;
use thiserror::Error;

use crate::codec::h264::nalu_reader::unescape_rbsp;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

#[derive(Debug, Error)]
pub enum NaluError {
    #[error("forbidden_zero_bit is set")]
    ForbiddenBit,
    #[error("empty NAL unit")]
    Empty,
    #[error("invalid NAL length field size {0}")]
    InvalidLengthSize(u8),
    #[error("NAL unit of {len} bytes exceeds the {remaining} bytes left in the buffer")]
    UnitOverrun { len: usize, remaining: usize },
    #[error("truncated decoder configuration record")]
    TruncatedConfig(#[from] std::io::Error),
    #[error("unsupported decoder configuration version {0}")]
    UnsupportedConfigVersion(u8),
}

#[derive(N, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    Reserved17 = 17,
    Reserved18 = 18,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Whether this type carries coded slice data of the primary picture.
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    pub fn parse(byte: u8) -> Result<Self, NaluError> {
        if byte & 0x80 != 0 {
            return Err(NaluError::ForbiddenBit);
        }

        let type_ = NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown);

        Ok(Self {
            ref_idc: (byte & 0x60) >> 5,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }

    /// Whether this header type indicates the end of a sequence or stream.
    pub fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    /// The length of the header.
    pub fn len(&self) -> usize {
        1
    }
}

/// A single NAL unit.
///
/// The bytes are kept in Annex-B framing (a three byte start code followed by the
/// escaped unit) regardless of the wire format they came from, since that is what
/// hardware decode APIs accept. Cloning a `Nalu` only bumps a reference count.
#[derive(Clone, Debug)]
pub struct Nalu {
    header: NaluHeader,
    framed: Bytes,
}

impl Nalu {
    /// Builds a unit from an already framed span starting with `00 00 01`.
    fn from_framed(framed: Bytes) -> Result<Self, NaluError> {
        let byte = *framed.get(START_CODE.len()).ok_or(NaluError::Empty)?;
        let header = NaluHeader::parse(byte)?;

        Ok(Self { header, framed })
    }

    /// Builds a unit from the raw unit bytes, header byte included, inserting a
    /// start code in front of them.
    pub fn from_unit(unit: &[u8]) -> Result<Self, NaluError> {
        if unit.is_empty() {
            return Err(NaluError::Empty);
        }

        let mut framed = BytesMut::with_capacity(unit.len() + START_CODE.len());
        framed.extend_from_slice(&START_CODE);
        framed.extend_from_slice(unit);

        Self::from_framed(framed.freeze())
    }

    pub fn header(&self) -> &NaluHeader {
        &self.header
    }

    /// The unit bytes, header byte included, without the start code.
    pub fn data(&self) -> &[u8] {
        &self.framed[START_CODE.len()..]
    }

    /// The escaped payload following the header byte.
    pub fn payload(&self) -> &[u8] {
        &self.framed[START_CODE.len() + self.header.len()..]
    }

    /// Size of the unit, header byte included.
    pub fn size(&self) -> usize {
        self.framed.len() - START_CODE.len()
    }

    /// The unit with its start code, ready to be handed to an Annex-B consumer.
    pub fn annex_b(&self) -> &Bytes {
        &self.framed
    }

    /// Returns the payload with the emulation prevention bytes removed.
    pub fn rbsp(&self) -> Vec<u8> {
        let mut rbsp = self.payload().to_vec();
        unescape_rbsp(&mut rbsp);
        rbsp
    }
}

fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(START_CODE.len())
        .position(|window| window == START_CODE)
        .map(|pos| pos + from)
}

/// Splits an Annex-B byte stream into NAL units.
///
/// Input may be pushed in arbitrary chunks: a unit is only emitted once the start
/// code of the following unit has been seen, so the tail of each chunk is carried
/// over to the next call. [`AnnexBScanner::finish`] returns whatever is left.
#[derive(Default)]
pub struct AnnexBScanner {
    buf: BytesMut,
    /// Offset from which to resume looking for the next start code.
    search_from: usize,
}

impl AnnexBScanner {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of bytes buffered while waiting for the next start code.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drops any buffered data.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.search_from = 0;
    }

    /// Append `chunk` and return all the units completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Nalu> {
        self.buf.extend_from_slice(chunk);

        let mut nalus = vec![];

        loop {
            // Realign the buffer on the current start code.
            let start = match find_start_code(&self.buf, 0) {
                Some(start) => start,
                None => {
                    // Keep what could be the beginning of a split start code.
                    let keep = std::cmp::min(self.buf.len(), START_CODE.len() - 1);
                    let discard = self.buf.len() - keep;
                    if discard > 0 {
                        debug!("Discarding {} bytes before the first start code", discard);
                    }
                    self.buf.advance(discard);
                    self.search_from = 0;
                    break;
                }
            };

            if start > 0 {
                self.buf.advance(start);
                self.search_from = self.search_from.saturating_sub(start);
            }

            let header_byte = match self.buf.get(START_CODE.len()) {
                Some(byte) => *byte,
                None => break,
            };

            // End of sequence/stream units carry no payload and complete at once.
            if matches!(NaluHeader::parse(header_byte), Ok(hdr) if hdr.is_end()) {
                let framed = self.buf.split_to(START_CODE.len() + 1).freeze();
                self.search_from = 0;
                if let Ok(nalu) = Nalu::from_framed(framed) {
                    nalus.push(nalu);
                }
                continue;
            }

            let from = std::cmp::max(START_CODE.len(), self.search_from);
            let next = match find_start_code(&self.buf, from) {
                Some(next) => next,
                None => {
                    // Rescan the last bytes on the next call, they may be the
                    // beginning of a start code.
                    self.search_from = self.buf.len().saturating_sub(START_CODE.len() - 1);
                    break;
                }
            };

            let framed = self.buf.split_to(next).freeze();
            self.search_from = 0;

            if let Some(nalu) = Self::make_nalu(framed) {
                nalus.push(nalu);
            }
        }

        nalus
    }

    /// Returns the last unit of the stream, if any.
    pub fn finish(&mut self) -> Option<Nalu> {
        let buf = std::mem::take(&mut self.buf);
        self.search_from = 0;

        if !buf.starts_with(&START_CODE) {
            return None;
        }

        Self::make_nalu(buf.freeze())
    }

    /// Trims the trailing_zero_8bits (and the zero_byte of a following four byte
    /// start code) and builds the unit.
    fn make_nalu(framed: Bytes) -> Option<Nalu> {
        let mut end = framed.len();
        while end > START_CODE.len() && framed[end - 1] == 0x00 {
            end -= 1;
        }

        if end == START_CODE.len() {
            return None;
        }

        match Nalu::from_framed(framed.slice(..end)) {
            Ok(nalu) => Some(nalu),
            Err(e) => {
                warn!("Dropping NAL unit: {}", e);
                None
            }
        }
    }
}

/// Splits a buffer of NAL units each preceded by a `length_size` bytes big endian
/// length, as carried by MP4/AVCC containers.
pub fn split_length_prefixed(data: &[u8], length_size: u8) -> Result<Vec<Nalu>, NaluError> {
    if !(1..=4).contains(&length_size) {
        return Err(NaluError::InvalidLengthSize(length_size));
    }

    let length_size = usize::from(length_size);
    let mut nalus = vec![];
    let mut pos = 0;

    while pos < data.len() {
        let remaining = data.len() - pos;
        if remaining < length_size {
            return Err(NaluError::UnitOverrun {
                len: length_size,
                remaining,
            });
        }

        let len = BigEndian::read_uint(&data[pos..], length_size) as usize;
        pos += length_size;

        let remaining = data.len() - pos;
        if len > remaining {
            return Err(NaluError::UnitOverrun { len, remaining });
        }

        if len > 0 {
            match Nalu::from_unit(&data[pos..pos + len]) {
                Ok(nalu) => nalus.push(nalu),
                Err(e) => warn!("Dropping NAL unit: {}", e),
            }
        }

        pos += len;
    }

    Ok(nalus)
}

/// The AVCDecoderConfigurationRecord carried out-of-band by MP4-style containers.
#[derive(Clone, Debug)]
pub struct AvcDecoderConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    /// Size in bytes of the length field preceding each NAL unit in the stream.
    pub nal_length_size: u8,
    pub sps: Vec<Nalu>,
    pub pps: Vec<Nalu>,
}

impl AvcDecoderConfig {
    pub fn parse(data: &[u8]) -> Result<Self, NaluError> {
        let mut r = Cursor::new(data);

        let version = r.read_u8()?;
        if version != 1 {
            return Err(NaluError::UnsupportedConfigVersion(version));
        }

        let profile_idc = r.read_u8()?;
        let profile_compatibility = r.read_u8()?;
        let level_idc = r.read_u8()?;
        let nal_length_size = (r.read_u8()? & 0x3) + 1;

        let num_sps = r.read_u8()? & 0x1f;
        let sps = Self::read_units(&mut r, usize::from(num_sps))?;

        let num_pps = r.read_u8()?;
        let pps = Self::read_units(&mut r, usize::from(num_pps))?;

        Ok(Self {
            profile_idc,
            profile_compatibility,
            level_idc,
            nal_length_size,
            sps,
            pps,
        })
    }

    fn read_units(r: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<Nalu>, NaluError> {
        let mut units = Vec::with_capacity(count);

        for _ in 0..count {
            let len = usize::from(r.read_u16::<BigEndian>()?);
            let mut unit = vec![0u8; len];
            r.read_exact(&mut unit)?;

            units.push(Nalu::from_unit(&unit)?);
        }

        Ok(units)
    }
}
