// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 stateless decoder.
//!
//! [`H264Decoder`] turns a stream of NAL units into pictures for a
//! [`StatelessH264DecoderBackend`]: it groups slices into frames or fields,
//! computes their picture order counts, keeps the reference pictures in the
//! DPB and tells the backend when to display what.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use log::debug;
use log::error;
use log::warn;

use crate::codec::h264::boundary::BoundaryDetector;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbOutput;
use crate::codec::h264::nalu::split_length_prefixed;
use crate::codec::h264::nalu::AnnexBScanner;
use crate::codec::h264::nalu::AvcDecoderConfig;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::ParameterSetError;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::RefPicMarkingInner;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::FieldRank;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::poc::PocState;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::DecodingState;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::BufferFlags;
use crate::decoder::DecodeLock;
use crate::decoder::DecodeLockGuard;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderStats;
use crate::decoder::StreamInfo;
use crate::decoder::WireFormat;

/// Length of the shortest Annex-B start code.
const START_CODE_LEN: usize = 3;

fn raster_from_zigzag_8x8(src: &[u8; 64]) -> [u8; 64] {
    const ZIGZAG_8X8: [usize; 64] = [
        0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
        20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51,
        58, 59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
    ];

    let mut dst = [0; 64];
    for (&coeff, &pos) in src.iter().zip(ZIGZAG_8X8.iter()) {
        dst[pos] = coeff;
    }
    dst
}

fn raster_from_zigzag_4x4(src: &[u8; 16]) -> [u8; 16] {
    const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

    let mut dst = [0; 16];
    for (&coeff, &pos) in src.iter().zip(ZIGZAG_4X4.iter()) {
        dst[pos] = coeff;
    }
    dst
}

/// Stateless backend methods specific to H.264.
pub trait StatelessH264DecoderBackend {
    /// Backend handle to a decoded picture. Both fields of a frame are decoded into the same
    /// surface.
    type Surface: Clone;

    /// Called when a new sequence starts, before any of its pictures is rendered. All the
    /// pictures of the previous sequence have been presented by then.
    fn new_sequence(&mut self, sps: &Rc<Sps>, info: &StreamInfo) -> StatelessBackendResult<()>;

    /// Called when a frame or first field starts, to obtain the surface it will be decoded into.
    fn new_surface(&mut self, timestamp: u64) -> StatelessBackendResult<Self::Surface>;

    /// Decodes a frame or field into `surface`. `slices` are the slice NAL units of the picture,
    /// start codes included.
    fn render_picture(
        &mut self,
        surface: &Self::Surface,
        info: &PictureInfo<Self::Surface>,
        slices: &[Bytes],
    ) -> StatelessBackendResult<()>;

    /// Displays `surface`. Called in output order, once per frame, field pair or lone field.
    fn present_picture(
        &mut self,
        surface: Self::Surface,
        timestamp: u64,
        top_field_first: bool,
        progressive: bool,
    ) -> StatelessBackendResult<()>;

    /// Called at the end of a flush, once every pending picture has been presented.
    fn flush(&mut self) {}

    /// Called when the timestamps of the stream stop being continuous.
    fn discontinuity(&mut self) {}
}

/// A frame the picture being rendered may predict from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceFrame<S> {
    pub surface: S,
    pub is_long_term: bool,
    pub top_is_reference: bool,
    pub bottom_is_reference: bool,
    /// `[top, bottom]`.
    pub field_order_cnt: [i32; 2],
    /// `LongTermFrameIdx` for long-term references, `frame_num` otherwise.
    pub frame_idx: u32,
}

/// Everything a stateless backend needs to know to decode a picture, besides its slices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureInfo<S> {
    /// Timestamp of the buffer the first slice of the picture came from.
    pub timestamp: u64,
    /// `[top, bottom]`. For fields only the entry of the coded parity is meaningful.
    pub field_order_cnt: [i32; 2],
    pub is_reference: bool,
    pub is_idr: bool,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    pub num_ref_frames: u8,
    pub mb_adaptive_frame_field_flag: bool,
    pub frame_mbs_only_flag: bool,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub constrained_intra_pred_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub transform_8x8_mode_flag: bool,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub pic_init_qp_minus26: i8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    /// Scaling lists in raster order.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],

    pub reference_frames: Vec<ReferenceFrame<S>>,
    pub slice_count: usize,
    /// The picture is likely to be decoded with artifacts: it follows lost data or lacks
    /// references.
    pub bad_frame: bool,
    /// First picture of a new sequence.
    pub new_sequence: bool,
}

impl<S> PictureInfo<S> {
    /// Order count of the coded picture: the lowest of both for frames, the
    /// one of its parity for fields.
    pub fn pic_order_cnt(&self) -> i32 {
        let [top, bottom] = self.field_order_cnt;

        match (self.field_pic_flag, self.bottom_field_flag) {
            (false, _) => std::cmp::min(top, bottom),
            (true, false) => top,
            (true, true) => bottom,
        }
    }
}

/// A first field waiting for its second field.
struct PendingField<S> {
    pic: Rc<RefCell<PictureData>>,
    surface: S,
    /// Whether the field has been stored in the DPB. Non-reference first
    /// fields may bypass it.
    stored: bool,
}

/// The picture whose slices are being accumulated.
struct CurrentPicState<S> {
    pic: PictureData,
    surface: S,
    /// Set if the picture is a second field.
    first_field: Option<PendingField<S>>,
    sps: Rc<Sps>,
    pps: Rc<Pps>,
    /// Header of the first slice.
    header: SliceHeader,
    slices: Vec<Bytes>,
    /// Size of the slices so far, even the discarded ones.
    size: usize,
    /// Largest `num_ref_idx_l0_active_minus1 + 1` of the inter slices.
    required_refs: usize,
    bad_frame: bool,
    /// The picture grew past the size limit and is going to be dropped.
    overrun: bool,
    new_sequence: bool,
}

/// Sorts an error from the parser into the decoding error it amounts to.
fn classify_parse_error(err: anyhow::Error) -> DecodeError {
    match err.downcast::<ParameterSetError>() {
        Ok(missing) => DecodeError::MissingReference(missing),
        Err(err) => DecodeError::MalformedSyntax(err),
    }
}

/// Logs an error the decoder recovers from.
fn log_recovered(err: &DecodeError) {
    match err {
        DecodeError::ReferenceStarvation { .. } | DecodeError::WrongField { .. } => {
            warn!("{}", err)
        }
        _ => error!("{}", err),
    }
}

pub struct H264Decoder<B: StatelessH264DecoderBackend> {
    backend: B,
    config: DecoderConfig,

    parser: Parser,
    scanner: AnnexBScanner,
    boundary: BoundaryDetector,

    dpb: Dpb<B::Surface>,
    poc: PocState,
    max_long_term_frame_idx: MaxLongTermFrameIdx,

    decoding_state: DecodingState,
    stream_info: Option<StreamInfo>,
    active_sps: Option<Rc<Sps>>,

    cur_pic: Option<CurrentPicState<B::Surface>>,
    /// The last first field, until its second field shows up.
    last_field: Option<PendingField<B::Surface>>,

    /// Timestamp waiting for the next picture to start.
    pending_timestamp: u64,
    /// The next picture starts a new sequence.
    new_sequence_pending: bool,
    /// A slice was lost since the last picture ended.
    malformed_slice_pending: bool,
    /// Slices are being dropped for lack of parameter sets.
    missing_header: bool,

    lock: Option<Rc<dyn DecodeLock>>,
    stats: DecoderStats,
}

impl<B> H264Decoder<B>
where
    B: StatelessH264DecoderBackend,
{
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        Self {
            backend,
            config,
            parser: Default::default(),
            scanner: AnnexBScanner::new(),
            boundary: BoundaryDetector::new(),
            dpb: Default::default(),
            poc: Default::default(),
            max_long_term_frame_idx: Default::default(),
            decoding_state: Default::default(),
            stream_info: None,
            active_sps: None,
            cur_pic: None,
            last_field: None,
            pending_timestamp: 0,
            new_sequence_pending: false,
            malformed_slice_pending: false,
            missing_header: false,
            lock: None,
            stats: Default::default(),
        }
    }

    /// Makes the decoder hold `lock` around every picture submitted to the
    /// backend.
    pub fn set_decode_lock(&mut self, lock: Rc<dyn DecodeLock>) {
        self.lock = Some(lock);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn dpb(&self) -> &Dpb<B::Surface> {
        &self.dpb
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Properties of the current sequence, once one has started.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    /// Loads the parameter sets of an `AVCDecoderConfigurationRecord` and
    /// expects length-prefixed NAL units from now on.
    pub fn put_config(&mut self, config: &[u8]) -> Result<(), DecodeError> {
        let record = AvcDecoderConfig::parse(config)?;

        debug!(
            "Configuration record: {} SPS, {} PPS, {} bytes NAL unit lengths",
            record.sps.len(),
            record.pps.len(),
            record.nal_length_size
        );

        for nalu in record.sps.into_iter().chain(record.pps) {
            self.handle_nalu(nalu)?;
        }

        self.config.wire_format = WireFormat::LengthPrefixed {
            length_size: record.nal_length_size,
        };

        Ok(())
    }

    /// Decodes the NAL units of `bitstream`. `timestamp` goes to the first
    /// picture starting after it, 0 meaning the buffer has none.
    ///
    /// Problems with the stream itself are recovered from, so that errors
    /// are only returned for backend failures.
    pub fn decode(&mut self, timestamp: u64, bitstream: &[u8]) -> Result<(), DecodeError> {
        self.decode_with_flags(timestamp, bitstream, Default::default())
    }

    /// Like [`H264Decoder::decode`], with picture boundaries given by the
    /// caller.
    pub fn decode_with_flags(
        &mut self,
        timestamp: u64,
        bitstream: &[u8],
        flags: BufferFlags,
    ) -> Result<(), DecodeError> {
        if flags.frame_start {
            self.close_picture()?;
        }

        match self.config.wire_format {
            WireFormat::AnnexB => self.decode_annex_b(timestamp, bitstream)?,
            WireFormat::LengthPrefixed { length_size } => {
                self.set_pending_timestamp(timestamp);

                match split_length_prefixed(bitstream, length_size) {
                    Ok(nalus) => {
                        for nalu in nalus {
                            self.handle_nalu(nalu)?;
                        }
                    }
                    Err(e) => {
                        log_recovered(&DecodeError::MalformedSyntax(
                            anyhow::Error::from(e).context("while splitting the buffer"),
                        ));
                        self.mark_bad();
                    }
                }
            }
        }

        if flags.frame_end {
            self.close_picture()?;
        }

        Ok(())
    }

    fn decode_annex_b(&mut self, timestamp: u64, bitstream: &[u8]) -> Result<(), DecodeError> {
        // A unit already started in a previous buffer belongs to the
        // timestamp of that buffer.
        let carried = self.scanner.pending() > START_CODE_LEN;
        let mut nalus = self.scanner.push(bitstream).into_iter();

        if carried {
            if let Some(nalu) = nalus.next() {
                self.handle_nalu(nalu)?;
            }
        }

        self.set_pending_timestamp(timestamp);

        for nalu in nalus {
            self.handle_nalu(nalu)?;
        }

        let pending = self.scanner.pending();
        let max = self.config.max_picture_size;
        if pending > max {
            self.scanner.clear();
            log_recovered(&DecodeError::BufferOverrun { size: pending, max });
            self.stats.dropped += 1;
            self.mark_bad();
        }

        Ok(())
    }

    /// Processes what is left in the scanner and ends the current picture.
    fn close_picture(&mut self) -> Result<(), DecodeError> {
        if let Some(nalu) = self.scanner.finish() {
            self.handle_nalu(nalu)?;
        }

        self.boundary.reset();
        self.end_picture()
    }

    /// Decodes everything that has been received and presents all the
    /// pending pictures.
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        debug!("Flushing the decoder");

        self.close_picture()?;
        self.drain_dpb()?;
        self.poc.reset();
        self.max_long_term_frame_idx = Default::default();

        if self.decoding_state != DecodingState::AwaitingStreamInfo {
            self.decoding_state = DecodingState::Reset;
        }

        self.backend.flush();

        Ok(())
    }

    /// Drops every picture and all buffered data. Nothing is presented.
    pub fn reset(&mut self) {
        debug!("Resetting the decoder");

        self.scanner.clear();
        self.boundary.reset();

        let mut dropped = self.dpb.num_needed_for_output();
        if self.cur_pic.take().is_some() {
            dropped += 1;
        }
        if let Some(field) = self.last_field.take() {
            if !field.stored {
                dropped += 1;
            }
        }
        self.stats.dropped += dropped as u64;

        self.dpb.mark_all_as_unused_for_ref();
        self.dpb.clear();
        self.poc.reset();
        self.max_long_term_frame_idx = Default::default();
        self.pending_timestamp = 0;
        self.malformed_slice_pending = false;

        if self.decoding_state != DecodingState::AwaitingStreamInfo {
            self.decoding_state = DecodingState::Reset;
        }
    }

    /// Forgets the timestamps of the pictures not presented yet, leaving the
    /// references untouched.
    pub fn discontinuity(&mut self) {
        debug!("Timestamp discontinuity");

        self.pending_timestamp = 0;

        for entry in self.dpb.entries() {
            entry.pic.borrow_mut().timestamp = 0;
        }
        if let Some(cur) = &mut self.cur_pic {
            cur.pic.timestamp = 0;
        }
        if let Some(field) = &self.last_field {
            field.pic.borrow_mut().timestamp = 0;
        }

        self.backend.discontinuity();
    }

    fn set_pending_timestamp(&mut self, timestamp: u64) {
        if timestamp != 0 {
            self.pending_timestamp = timestamp;
        }
    }

    /// Flags the picture a broken slice belongs to. A slice that cannot be
    /// placed after the start of the current picture starts the next one.
    fn mark_slice_bad(&mut self, nalu: &Nalu) {
        let rbsp = nalu.rbsp();
        let first_mb_in_slice = NaluReader::new(&rbsp).read_ue::<u32>().ok();

        match (first_mb_in_slice, &mut self.cur_pic) {
            (Some(first_mb), Some(cur)) if first_mb > 0 => cur.bad_frame = true,
            _ => self.malformed_slice_pending = true,
        }
    }

    /// Flags the current picture, or the next one, as bad.
    fn mark_bad(&mut self) {
        match &mut self.cur_pic {
            Some(cur) => cur.bad_frame = true,
            None => self.malformed_slice_pending = true,
        }
    }

    fn handle_nalu(&mut self, nalu: Nalu) -> Result<(), DecodeError> {
        let type_ = nalu.header().type_;

        if matches!(
            type_,
            NaluType::SliceDpa | NaluType::SliceDpb | NaluType::SliceDpc
        ) {
            debug!("Skipping unsupported data partition {:?}", type_);
            return Ok(());
        }

        if type_.is_vcl() {
            return self.handle_slice(nalu);
        }

        if self.boundary.non_vcl(type_) {
            self.end_picture()?;
        }

        match type_ {
            NaluType::Sps => match self.parser.parse_sps(&nalu) {
                Ok((sps, is_new)) => {
                    if is_new {
                        debug!(
                            "SPS {}: {}x{}",
                            sps.seq_parameter_set_id,
                            sps.width(),
                            sps.height()
                        );
                    }
                    self.missing_header = false;
                }
                Err(e) => log_recovered(&DecodeError::MalformedSyntax(
                    e.context("dropping SPS"),
                )),
            },
            NaluType::Pps => match self.parser.parse_pps(&nalu) {
                Ok(pps) => {
                    debug!(
                        "PPS {} refers to SPS {}",
                        pps.pic_parameter_set_id, pps.seq_parameter_set_id
                    );
                    self.missing_header = false;
                }
                Err(e) => log_recovered(&classify_parse_error(e.context("dropping PPS"))),
            },
            NaluType::SeqEnd | NaluType::StreamEnd => self.end_of_sequence()?,
            NaluType::Sei | NaluType::AuDelimiter | NaluType::FillerData => {
                debug!("Skipping {:?} NAL unit", type_)
            }
            _ => debug!("Ignoring unsupported {:?} NAL unit", type_),
        }

        Ok(())
    }

    fn end_of_sequence(&mut self) -> Result<(), DecodeError> {
        debug!("End of sequence");

        self.drain_dpb()?;
        self.poc.reset();
        self.max_long_term_frame_idx = Default::default();
        self.new_sequence_pending = true;

        Ok(())
    }

    fn handle_slice(&mut self, nalu: Nalu) -> Result<(), DecodeError> {
        let slice = match self.parser.parse_slice_header(nalu.clone()) {
            Ok(slice) => slice,
            Err(e) => {
                match classify_parse_error(e) {
                    err @ DecodeError::MissingReference(_) => {
                        if !self.missing_header {
                            log_recovered(&err);
                            self.stats.dropped += 1;
                            self.missing_header = true;
                        }
                        self.end_picture()?;
                    }
                    err => {
                        log_recovered(&err);
                        self.mark_slice_bad(&nalu);
                    }
                }

                return Ok(());
            }
        };

        let (pps, sps) = match self.parameter_sets(&slice.header) {
            Ok(sets) => sets,
            Err(e) => {
                log_recovered(&e.into());
                return Ok(());
            }
        };

        self.missing_header = false;

        if self.boundary.first_slice_of_picture(&slice, &sps) {
            self.end_picture()?;
            self.begin_picture(&slice, pps, sps)?;
        }

        let max = self.config.max_picture_size;
        let Some(cur) = self.cur_pic.as_mut() else {
            debug!("Dropping a slice of a picture that was not started");
            return Ok(());
        };

        if slice.header.slice_type.is_inter() {
            let refs = usize::from(slice.header.num_ref_idx_l0_active_minus1) + 1;
            cur.required_refs = std::cmp::max(cur.required_refs, refs);
        }

        let data = slice.nalu.annex_b().clone();
        cur.size += data.len();

        if cur.size > max {
            cur.overrun = true;
            cur.slices.clear();
        } else if !cur.overrun {
            cur.slices.push(data);
        }

        Ok(())
    }

    fn parameter_sets(&self, hdr: &SliceHeader) -> Result<(Rc<Pps>, Rc<Sps>), ParameterSetError> {
        let pps = self
            .parser
            .get_pps(hdr.pic_parameter_set_id)
            .ok_or(ParameterSetError::MissingPps(hdr.pic_parameter_set_id))?;
        let sps = self
            .parser
            .get_sps(pps.seq_parameter_set_id)
            .ok_or(ParameterSetError::MissingSps(pps.seq_parameter_set_id))?;

        Ok((Rc::clone(pps), Rc::clone(sps)))
    }

    /// Makes `sps` the active SPS, starting a new sequence if it differs from
    /// the previous one.
    fn activate_sps(&mut self, sps: &Rc<Sps>) -> Result<(), DecodeError> {
        let unchanged = self
            .active_sps
            .as_ref()
            .map_or(false, |active| Rc::ptr_eq(active, sps) || **active == **sps);

        if unchanged {
            self.active_sps = Some(Rc::clone(sps));
            return Ok(());
        }

        self.drain_dpb()?;

        let max_dpb_frames = sps.max_dpb_frames();
        let max_num_reorder_frames =
            std::cmp::min(sps.max_num_order_frames() as usize, max_dpb_frames);

        debug!(
            "New sequence: {}x{}, DPB of {} frames, {} reordered, interlaced: {}",
            sps.width(),
            sps.height(),
            max_dpb_frames,
            max_num_reorder_frames,
            !sps.frame_mbs_only_flag
        );

        self.dpb.set_limits(max_dpb_frames, max_num_reorder_frames);
        self.dpb.set_interlaced(!sps.frame_mbs_only_flag);

        let info = StreamInfo::new(sps, &self.config.hints);
        self.backend.new_sequence(sps, &info)?;

        self.stream_info = Some(info);
        self.active_sps = Some(Rc::clone(sps));
        self.new_sequence_pending = true;

        if self.decoding_state == DecodingState::AwaitingStreamInfo {
            self.decoding_state = DecodingState::Decoding;
        }

        Ok(())
    }

    /// Returns the first field `slice` completes, if any. A first field that
    /// cannot be completed is presented on its own.
    fn find_first_field(
        &mut self,
        slice: &Slice,
    ) -> Result<Option<PendingField<B::Surface>>, DecodeError> {
        let Some(pending) = self.last_field.take() else {
            return Ok(None);
        };

        let hdr = &slice.header;
        let (first_parity, first_frame_num, first_pps) = {
            let pic = pending.pic.borrow();
            (pic.field, pic.frame_num, pic.pic_parameter_set_id)
        };

        if !hdr.field_pic_flag {
            warn!(
                "Expected the {:?} field of frame_num {}, got a frame",
                first_parity.opposite(),
                first_frame_num
            );
            self.flush_unpaired_field(pending)?;
            return Ok(None);
        }

        if hdr.field() == first_parity {
            warn!(
                "Expected the {:?} field of frame_num {}, got another {:?} field",
                first_parity.opposite(),
                first_frame_num,
                first_parity
            );
            self.flush_unpaired_field(pending)?;
            return Ok(None);
        }

        let frame_num = u32::from(hdr.frame_num);
        if frame_num != first_frame_num || hdr.pic_parameter_set_id != first_pps {
            log_recovered(&DecodeError::WrongField {
                first: first_frame_num,
                second: frame_num,
            });
            self.flush_unpaired_field(pending)?;
            self.drain_dpb()?;
            self.decoding_state = DecodingState::Reset;
            return Ok(None);
        }

        Ok(Some(pending))
    }

    /// Presents a first field whose second field never came.
    fn flush_unpaired_field(&mut self, field: PendingField<B::Surface>) -> Result<(), DecodeError> {
        let output = if field.stored {
            self.dpb.bump_unpaired_field()
        } else {
            let pic = field.pic.borrow();
            debug!(
                "Presenting unpaired {:?} field frame_num {}",
                pic.field, pic.frame_num
            );
            let output = DpbOutput::new(&pic, field.surface.clone());
            Some(output)
        };

        match output {
            Some(output) => self.present(output),
            None => Ok(()),
        }
    }

    fn begin_picture(
        &mut self,
        slice: &Slice,
        pps: Rc<Pps>,
        sps: Rc<Sps>,
    ) -> Result<(), DecodeError> {
        let is_idr = slice.nalu.header().idr_pic_flag;

        self.activate_sps(&sps)?;
        let first_field = self.find_first_field(slice)?;

        // The pending timestamp is left for the next frame if this is a
        // second field.
        let timestamp = match &first_field {
            Some(first) => first.pic.borrow().timestamp,
            None => std::mem::take(&mut self.pending_timestamp),
        };

        let mut bad_frame = std::mem::take(&mut self.malformed_slice_pending);

        if first_field.is_none() {
            if is_idr {
                self.poc.prev_ref_pic_info.frame_num = 0;
            } else {
                let frame_num = u32::from(slice.header.frame_num);
                let prev = self.poc.prev_ref_pic_info.frame_num;

                if frame_num != prev && frame_num != (prev + 1) % sps.max_frame_num() {
                    self.handle_frame_num_gap(&sps, frame_num)?;
                }
            }
        }

        match self.decoding_state {
            DecodingState::Reset if is_idr => self.decoding_state = DecodingState::Decoding,
            DecodingState::Reset => bad_frame = true,
            _ => (),
        }

        let mut pic = PictureData::new_from_slice(slice, &sps, timestamp);
        if let Some(first) = &first_field {
            pic.set_first_field_to(&first.pic);
        }

        if let Err(e) = self.poc.compute(&mut pic, &sps) {
            log_recovered(&DecodeError::MalformedSyntax(
                e.context("while computing the picture order count"),
            ));
            bad_frame = true;
        }

        if is_idr && first_field.is_none() {
            if pic.ref_pic_marking.no_output_of_prior_pics_flag {
                let dropped = self.dpb.num_needed_for_output();
                debug!("Dropping {} pictures waiting for output", dropped);
                self.stats.dropped += dropped as u64;
                self.dpb.clear();
            } else {
                self.drain_dpb()?;
            }
        }

        self.dpb
            .update_pic_nums(pic.frame_num, sps.max_frame_num(), &pic);

        let surface = match &first_field {
            Some(first) => first.surface.clone(),
            None => self.backend.new_surface(timestamp)?,
        };

        debug!(
            "Decoding {:?} frame_num {} POC {} timestamp {}",
            pic.field, pic.frame_num, pic.pic_order_cnt, timestamp
        );

        self.cur_pic = Some(CurrentPicState {
            pic,
            surface,
            first_field,
            sps,
            pps,
            header: slice.header.clone(),
            slices: vec![],
            size: 0,
            required_refs: 0,
            bad_frame,
            overrun: false,
            new_sequence: std::mem::take(&mut self.new_sequence_pending),
        });

        Ok(())
    }

    /// Fills a gap in `frame_num` with non-existing frames, see 8.2.5.2.
    fn handle_frame_num_gap(&mut self, sps: &Sps, frame_num: u32) -> Result<(), DecodeError> {
        if self.dpb.is_empty() {
            return Ok(());
        }

        let prev = self.poc.prev_ref_pic_info.frame_num;

        if !sps.gaps_in_frame_num_value_allowed_flag {
            warn!(
                "frame_num jumped from {} to {}, some pictures were lost",
                prev, frame_num
            );
            return Ok(());
        }

        debug!("Filling the frame_num gap from {} to {}", prev, frame_num);

        let max_frame_num = sps.max_frame_num();
        let mut unused_short_term_frame_num = (prev + 1) % max_frame_num;

        while unused_short_term_frame_num != frame_num {
            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num, 0);

            if let Err(e) = self.poc.compute(&mut pic, sps) {
                debug!("No order count for a non-existing frame: {:#}", e);
            }

            self.dpb
                .update_pic_nums(unused_short_term_frame_num, max_frame_num, &pic);
            if let Err(e) = self.dpb.sliding_window_marking(&mut pic, sps) {
                warn!("Sliding window marking failed: {:#}", e);
            }
            self.dpb.remove_unused();

            let outputs = self.dpb.bump_as_needed(&pic);
            self.present_all(outputs)?;

            self.poc.fill_prev_info(&pic);
            self.poc.prev_ref_pic_info.frame_num = unused_short_term_frame_num;

            if let Err(e) = self.dpb.add_picture(Rc::new(RefCell::new(pic)), None) {
                warn!("Could not store a non-existing frame: {}", e);
            }

            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    fn end_picture(&mut self) -> Result<(), DecodeError> {
        match self.cur_pic.take() {
            Some(cur) => self.finish_picture(cur),
            None => Ok(()),
        }
    }

    fn finish_picture(&mut self, mut cur: CurrentPicState<B::Surface>) -> Result<(), DecodeError> {
        if cur.overrun {
            log_recovered(&DecodeError::BufferOverrun {
                size: cur.size,
                max: self.config.max_picture_size,
            });
            self.stats.dropped += 1;

            if let Some(first) = cur.first_field {
                self.flush_unpaired_field(first)?;
            }
            return Ok(());
        }

        if cur.required_refs > 0 {
            let required = if cur.header.field_pic_flag {
                (cur.required_refs + 1) / 2
            } else {
                cur.required_refs
            };
            let available = self.dpb.num_usable_refs(cur.pic.pic_order_cnt);

            if available < required {
                log_recovered(&DecodeError::ReferenceStarvation {
                    available,
                    required,
                });
                cur.bad_frame = true;
            }
        }

        let info = self.picture_info(&cur);
        self.render(&cur.surface, &info, &cur.slices)?;

        self.stats.rendered += 1;
        if cur.bad_frame {
            self.stats.bad += 1;
        }

        let CurrentPicState {
            mut pic,
            surface,
            first_field,
            sps,
            ..
        } = cur;

        if pic.is_ref() {
            if let Err(e) = self.reference_pic_marking(&mut pic, &sps) {
                warn!("Reference picture marking failed: {:#}", e);
            }
            self.poc.fill_prev_ref_info(&pic);
        }
        self.poc.fill_prev_info(&pic);

        self.dpb.remove_unused();

        if pic.has_mmco_5 {
            // Everything decoded before goes out first (C.4.4).
            let outputs = self.dpb.drain();
            self.present_all(outputs)?;
        }

        self.store_picture(pic, surface, first_field)
    }

    fn render(
        &mut self,
        surface: &B::Surface,
        info: &PictureInfo<B::Surface>,
        slices: &[Bytes],
    ) -> Result<(), DecodeError> {
        let lock = self.lock.clone();
        let _guard = lock.as_deref().map(DecodeLockGuard::new);

        self.backend.render_picture(surface, info, slices)?;

        Ok(())
    }

    fn picture_info(&self, cur: &CurrentPicState<B::Surface>) -> PictureInfo<B::Surface> {
        let sps = &cur.sps;
        let pps = &cur.pps;
        let hdr = &cur.header;

        let scaling_lists_4x4 = pps.scaling_lists.list_4x4.map(|l| raster_from_zigzag_4x4(&l));
        let scaling_lists_8x8 = pps.scaling_lists.list_8x8.map(|l| raster_from_zigzag_8x8(&l));

        PictureInfo {
            timestamp: cur.pic.timestamp,
            field_order_cnt: [cur.pic.top_field_order_cnt, cur.pic.bottom_field_order_cnt],
            is_reference: cur.pic.is_ref(),
            is_idr: matches!(cur.pic.is_idr, IsIdr::Yes { .. }),
            frame_num: hdr.frame_num,
            field_pic_flag: hdr.field_pic_flag,
            bottom_field_flag: hdr.bottom_field_flag,

            num_ref_frames: sps.max_num_ref_frames,
            mb_adaptive_frame_field_flag: sps.mb_adaptive_frame_field_flag,
            frame_mbs_only_flag: sps.frame_mbs_only_flag,
            log2_max_frame_num_minus4: sps.log2_max_frame_num_minus4,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4: sps.log2_max_pic_order_cnt_lsb_minus4,
            delta_pic_order_always_zero_flag: sps.delta_pic_order_always_zero_flag,
            direct_8x8_inference_flag: sps.direct_8x8_inference_flag,

            constrained_intra_pred_flag: pps.constrained_intra_pred_flag,
            weighted_pred_flag: pps.weighted_pred_flag,
            weighted_bipred_idc: pps.weighted_bipred_idc,
            transform_8x8_mode_flag: pps.transform_8x8_mode_flag,
            chroma_qp_index_offset: pps.chroma_qp_index_offset,
            second_chroma_qp_index_offset: pps.second_chroma_qp_index_offset,
            pic_init_qp_minus26: pps.pic_init_qp_minus26,
            num_ref_idx_l0_default_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            entropy_coding_mode_flag: pps.entropy_coding_mode_flag,
            bottom_field_pic_order_in_frame_present_flag: pps
                .bottom_field_pic_order_in_frame_present_flag,
            deblocking_filter_control_present_flag: pps.deblocking_filter_control_present_flag,
            redundant_pic_cnt_present_flag: pps.redundant_pic_cnt_present_flag,

            scaling_lists_4x4,
            scaling_lists_8x8,

            reference_frames: self.reference_frames(),
            slice_count: cur.slices.len(),
            bad_frame: cur.bad_frame,
            new_sequence: cur.new_sequence,
        }
    }

    /// Describes the reference frames of the DPB, both fields of a frame in
    /// the same record.
    fn reference_frames(&self) -> Vec<ReferenceFrame<B::Surface>> {
        let mut frames: Vec<(*const RefCell<PictureData>, ReferenceFrame<B::Surface>)> = vec![];

        for entry in self.dpb.entries() {
            // Non-existing frames have nothing to predict from.
            let Some(surface) = &entry.handle else {
                continue;
            };

            let pic = entry.pic.borrow();
            if !pic.is_ref() {
                continue;
            }

            let key = match pic.field_rank() {
                FieldRank::Second(first) => Rc::as_ptr(first),
                _ => Rc::as_ptr(&entry.pic),
            };

            let (top, bottom) = match pic.field {
                Field::Frame => (true, true),
                Field::Top => (true, false),
                Field::Bottom => (false, true),
            };

            if let Some((_, frame)) = frames.iter_mut().find(|(k, _)| *k == key) {
                frame.top_is_reference |= top;
                frame.bottom_is_reference |= bottom;
                continue;
            }

            let is_long_term = matches!(pic.reference(), Reference::LongTerm);

            frames.push((
                key,
                ReferenceFrame {
                    surface: surface.clone(),
                    is_long_term,
                    top_is_reference: top,
                    bottom_is_reference: bottom,
                    field_order_cnt: pic.field_order_cnts(),
                    frame_idx: if is_long_term {
                        pic.long_term_frame_idx
                    } else {
                        pic.frame_num
                    },
                },
            ));
        }

        frames.into_iter().map(|(_, frame)| frame).collect()
    }

    /// 8.2.5.1
    fn reference_pic_marking(&mut self, pic: &mut PictureData, sps: &Sps) -> anyhow::Result<()> {
        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            if !pic.is_second_field() {
                self.dpb.mark_all_as_unused_for_ref();
            }

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm, false);
                pic.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                pic.set_reference(Reference::ShortTerm, false);
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }

            return Ok(());
        }

        if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.handle_memory_management_ops(pic);
            Ok(())
        } else {
            self.dpb.sliding_window_marking(pic, sps)
        }
    }

    /// 8.2.5.4. A failing operation is skipped, the following ones still
    /// apply.
    fn handle_memory_management_ops(&mut self, pic: &mut PictureData) {
        let markings = pic.ref_pic_marking.inner.clone();

        for marking in &markings {
            let result = match marking.memory_management_control_operation {
                0 => break,
                1 => self.dpb.mmco_op_1(pic, marking),
                2 => self.dpb.mmco_op_2(pic, marking),
                3 => {
                    self.check_long_term_frame_idx(marking);
                    self.dpb.mmco_op_3(pic, marking)
                }
                4 => {
                    self.max_long_term_frame_idx = self.dpb.mmco_op_4(marking);
                    Ok(())
                }
                5 => {
                    self.max_long_term_frame_idx = self.dpb.mmco_op_5(pic);
                    Ok(())
                }
                6 => {
                    self.check_long_term_frame_idx(marking);
                    self.dpb.mmco_op_6(pic, marking);
                    Ok(())
                }
                other => {
                    warn!("Unknown memory management control operation {}", other);
                    Ok(())
                }
            };

            if let Err(e) = result {
                warn!(
                    "MMCO {} on frame_num {} failed: {}",
                    marking.memory_management_control_operation,
                    pic.frame_num,
                    e
                );
            }
        }
    }

    fn check_long_term_frame_idx(&self, marking: &RefPicMarkingInner) {
        if self.max_long_term_frame_idx < marking.long_term_frame_idx {
            warn!(
                "long_term_frame_idx {} exceeds MaxLongTermFrameIdx {:?}",
                marking.long_term_frame_idx, self.max_long_term_frame_idx
            );
        }
    }

    /// Stores the decoded picture in the DPB, or outputs it right away when
    /// it does not need to be kept (C.4.5).
    fn store_picture(
        &mut self,
        pic: PictureData,
        surface: B::Surface,
        first_field: Option<PendingField<B::Surface>>,
    ) -> Result<(), DecodeError> {
        match first_field {
            Some(first) if first.stored => {
                self.store_second_field(Rc::new(RefCell::new(pic)), surface)?;
            }
            Some(first) if !pic.is_ref() => {
                let pic = Rc::new(RefCell::new(pic));
                first.pic.borrow_mut().set_second_field_to(&pic);

                let output = DpbOutput::new(&first.pic.borrow(), first.surface);
                return self.present(output);
            }
            Some(first) => {
                // A reference second field: the pair is kept after all.
                let outputs = self.dpb.bump_as_needed(&pic);
                self.present_all(outputs)?;

                let pic = Rc::new(RefCell::new(pic));
                if let Err(e) = self
                    .dpb
                    .add_picture(Rc::clone(&first.pic), Some(first.surface.clone()))
                {
                    warn!("Could not store the field pair: {}", e);
                    first.pic.borrow_mut().set_second_field_to(&pic);

                    let output = DpbOutput::new(&first.pic.borrow(), first.surface);
                    return self.present(output);
                }

                self.store_second_field(pic, surface)?;
            }
            None => {
                let outputs = self.dpb.bump_as_needed(&pic);
                self.present_all(outputs)?;

                let is_field = !matches!(pic.field, Field::Frame);
                let store = pic.is_ref() || self.dpb.has_empty_frame_buffer();
                let pic = Rc::new(RefCell::new(pic));

                let stored = store
                    && match self.dpb.add_picture(Rc::clone(&pic), Some(surface.clone())) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Could not store the picture: {}", e);
                            false
                        }
                    };

                if is_field {
                    self.last_field = Some(PendingField {
                        pic,
                        surface,
                        stored,
                    });
                } else if !stored {
                    // C.4.5.2: not kept, so output immediately.
                    let output = DpbOutput::new(&pic.borrow(), surface);
                    return self.present(output);
                }
            }
        }

        let outputs = self.dpb.bump_reorder_excess();
        self.present_all(outputs)
    }

    fn store_second_field(
        &mut self,
        pic: Rc<RefCell<PictureData>>,
        surface: B::Surface,
    ) -> Result<(), DecodeError> {
        if let Err(e) = self.dpb.add_picture(pic, Some(surface)) {
            warn!("Could not store the second field: {}", e);

            if let Some(output) = self.dpb.bump_unpaired_field() {
                self.present(output)?;
            }
        }

        Ok(())
    }

    /// Presents every picture still waiting, then empties the DPB.
    fn drain_dpb(&mut self) -> Result<(), DecodeError> {
        if let Some(field) = self.last_field.take() {
            self.flush_unpaired_field(field)?;
        }

        let outputs = self.dpb.drain();
        self.present_all(outputs)
    }

    fn present_all(&mut self, outputs: Vec<DpbOutput<B::Surface>>) -> Result<(), DecodeError> {
        for output in outputs {
            self.present(output)?;
        }

        Ok(())
    }

    fn present(&mut self, output: DpbOutput<B::Surface>) -> Result<(), DecodeError> {
        debug!(
            "Presenting picture POC {} timestamp {}",
            output.pic_order_cnt, output.timestamp
        );

        self.backend.present_picture(
            output.handle,
            output.timestamp,
            output.top_field_first,
            output.progressive,
        )?;
        self.stats.presented += 1;

        Ok(())
    }
}
