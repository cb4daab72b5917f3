// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter set store and slice header interpreter.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;
use log::debug;
use thiserror::Error;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::picture::Field;

pub(super) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(super) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(super) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(super) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_PPS_COUNT: u16 = 256;
const MAX_SPS_COUNT: u8 = 32;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub(crate) const DPB_MAX_SIZE: usize = 16;

/// Frame durations outside of this range (in 90 kHz ticks) are considered bogus.
/// This allows anything between 300 and 0.1 frames per second.
const MIN_FRAME_DURATION: u64 = 300;
const MAX_FRAME_DURATION: u64 = 900_000;

/// MaxFS of the highest levels in table A-1, in macroblocks.
const MAX_FRAME_SIZE_IN_MBS: u64 = 139_264;

/// A slice, SPS or PPS referred to a parameter set that is not in the store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterSetError {
    #[error("SPS {0} has not been successfully parsed")]
    MissingSps(u8),
    #[error("PPS {0} has not been successfully parsed")]
    MissingPps(u8),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

/// Whether `profile_idc` is one of the profiles whose SPS carries the chroma
/// format, bit depth and scaling matrix fields.
pub(crate) fn has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    )
}

/// Returns `Ceil(Log2(n))`, the number of bits needed to code `n` distinct values.
fn ceil_log2(n: u32) -> usize {
    match n {
        0 | 1 => 0,
        n => (32 - (n - 1).leading_zeros()) as usize,
    }
}

fn default_4x4(i: usize) -> [u8; 16] {
    if i < 3 {
        DEFAULT_4X4_INTRA
    } else {
        DEFAULT_4X4_INTER
    }
}

fn default_8x8(i: usize) -> [u8; 64] {
    if i % 2 == 0 {
        DEFAULT_8X8_INTRA
    } else {
        DEFAULT_8X8_INTER
    }
}

/// The six 4x4 and six 8x8 scaling lists of a parameter set, in zig-zag order.
///
/// The 4x4 lists are ordered Intra Y, Intra Cb, Intra Cr, Inter Y, Inter Cb,
/// Inter Cr. The 8x8 lists are ordered Intra Y, Inter Y, Intra Cb, Inter Cb,
/// Intra Cr, Inter Cr. The default value is Flat_4x4_16/Flat_8x8_16.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub list_4x4: [[u8; 16]; 6],
    pub list_8x8: [[u8; 64]; 6],
}

impl Default for ScalingLists {
    fn default() -> Self {
        Self {
            list_4x4: [[16; 16]; 6],
            list_8x8: [[16; 64]; 6],
        }
    }
}

impl ScalingLists {
    /// The Default_4x4/Default_8x8 lists of table 7-3 and 7-4, which is what
    /// fall-back rule A falls back to.
    pub fn table_defaults() -> Self {
        Self {
            list_4x4: std::array::from_fn(default_4x4),
            list_8x8: std::array::from_fn(default_8x8),
        }
    }

    /// Parses one `scaling_list()`. Returns `true` if the list signals that the
    /// default list shall be used instead (`useDefaultScalingMatrixFlag`).
    fn parse_list(r: &mut NaluReader, list: &mut [u8]) -> anyhow::Result<bool> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;

        for j in 0..list.len() {
            if next_scale != 0 {
                let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
                next_scale = (last_scale + delta_scale + 256) % 256;
                if j == 0 && next_scale == 0 {
                    return Ok(true);
                }
            }

            if next_scale != 0 {
                list[j] = next_scale as u8;
            } else {
                list[j] = last_scale as u8;
            }

            last_scale = i32::from(list[j]);
        }

        Ok(false)
    }

    /// Parses the scaling list flags and lists of a SPS or PPS.
    ///
    /// Only the first `num_8x8` 8x8 lists can be present in the bitstream.
    /// Lists that are not present are inferred using table 7-2: lists 0 and 3
    /// (4x4) and 0 and 1 (8x8) come from `fallback`, the others repeat the
    /// previous list of the same kind.
    fn parse(r: &mut NaluReader, num_8x8: usize, fallback: &ScalingLists) -> anyhow::Result<Self> {
        let mut lists = Self::default();

        for i in 0..6 {
            let present = r.read_bit()?;
            if present && Self::parse_list(r, &mut lists.list_4x4[i])? {
                lists.list_4x4[i] = default_4x4(i);
            } else if !present {
                lists.list_4x4[i] = match i {
                    0 | 3 => fallback.list_4x4[i],
                    _ => lists.list_4x4[i - 1],
                };
            }
        }

        for i in 0..6 {
            let present = i < num_8x8 && r.read_bit()?;
            if present && Self::parse_list(r, &mut lists.list_8x8[i])? {
                lists.list_8x8[i] = default_8x8(i);
            } else if !present {
                lists.list_8x8[i] = match i {
                    0 | 1 => fallback.list_8x8[i],
                    _ => lists.list_8x8[i - 2],
                };
            }
        }

        Ok(lists)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i8; 32],

    /* if seq->ChromaArrayType != 0 */
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i8; 2]; 32],

    /* if slice->slice_type % 5 == 1 */
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i8; 32],

    /* and if seq->ChromaArrayType != 0 */
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i8; 2]; 32],
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value indicating "no long-term frame indices". This type allows easy conversion
/// between the actual and "plus1" representation, while ensuring that the special value is always
/// handled by the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// One memory management control operation, with the operands it uses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// The operation, 1 to 6 (table 7-9). 0 terminates the list and is never stored.
    pub memory_management_control_operation: u8,
    /// Operations 1 and 3: selects a short-term picture relative to `CurrPicNum`.
    pub difference_of_pic_nums_minus1: u32,
    /// Operation 2: the long-term picture to mark as unused.
    pub long_term_pic_num: u32,
    /// Operations 3 and 6: the long-term index to assign.
    pub long_term_frame_idx: u32,
    /// Operation 4: the new `MaxLongTermFrameIdx`.
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

/// `dec_ref_pic_marking()`. For IDR pictures only the first two flags are
/// meaningful, for other reference pictures only the last two.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    /// The operations, in bitstream order. They are applied once the whole
    /// picture has been decoded.
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// The slice type, with the 5-9 range folded onto 0-4.
    pub slice_type: SliceType,

    pub pic_parameter_set_id: u8,

    /// Only present when `separate_colour_plane_flag` is set.
    pub colour_plane_id: u8,

    /// `log2_max_frame_num_minus4 + 4` bits wide.
    pub frame_num: u16,

    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture. Two consecutive IDR access units use
    /// different values.
    pub idr_pic_id: u16,

    /// POC type 0: the picture order count modulo `MaxPicOrderCntLsb`.
    pub pic_order_cnt_lsb: u16,

    /// POC type 0: bottom minus top field order count of a frame.
    pub delta_pic_order_cnt_bottom: i32,

    /// POC type 1: deviations from the expected top and bottom field order
    /// counts.
    pub delta_pic_order_cnt: [i32; 2],

    pub redundant_pic_cnt: u8,

    pub direct_spatial_mv_pred_flag: bool,

    pub num_ref_idx_active_override_flag: bool,
    /// Maximum reference index for list 0, inferred from the PPS if not overridden.
    pub num_ref_idx_l0_active_minus1: u8,
    /// Maximum reference index for list 1, inferred from the PPS if not overridden.
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    pub pred_weight_table: PredWeightTable,

    pub dec_ref_pic_marking: RefPicMarking,

    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,

    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    /// Only present for slice group map types 3 to 5.
    pub slice_group_change_cycle: u32,

    /// Same as `MaxPicNum` in ITU-T H.264.
    pub max_pic_num: u32,
}

impl SliceHeader {
    /// Returns the field that is coded by this header.
    pub fn field(&self) -> Field {
        if self.field_pic_flag {
            if self.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        }
    }
}

pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        SliceHeaderBuilder(SliceHeader {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            num_ref_idx_l0_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            max_pic_num: pps.sps.max_frame_num(),
            ..Default::default()
        })
    }

    pub fn slice_type(mut self, type_: SliceType) -> Self {
        self.0.slice_type = type_;
        self
    }

    pub fn first_mb_in_slice(mut self, value: u32) -> Self {
        self.0.first_mb_in_slice = value;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        let was_field = self.0.field_pic_flag;
        self.0.field_pic_flag = !matches!(field, Field::Frame);
        self.0.bottom_field_flag = matches!(field, Field::Bottom);

        // MaxPicNum doubles for field pictures.
        match (was_field, self.0.field_pic_flag) {
            (false, true) => self.0.max_pic_num *= 2,
            (true, false) => self.0.max_pic_num /= 2,
            _ => (),
        }
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u16) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn delta_pic_order_cnt_bottom(mut self, value: i32) -> Self {
        self.0.delta_pic_order_cnt_bottom = value;
        self
    }

    pub fn delta_pic_order_cnt(mut self, value: [i32; 2]) -> Self {
        self.0.delta_pic_order_cnt = value;
        self
    }

    pub fn idr_pic_id(mut self, value: u16) -> Self {
        self.0.idr_pic_id = value;
        self
    }

    pub fn num_ref_idx_active_override_flag(mut self, value: bool) -> Self {
        self.0.num_ref_idx_active_override_flag = value;
        self
    }

    pub fn num_ref_idx_l0_active_minus1(mut self, value: u8) -> Self {
        self = self.num_ref_idx_active_override_flag(true);
        self.0.num_ref_idx_l0_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l0_active(self, value: u8) -> Self {
        self.num_ref_idx_l0_active_minus1(value - 1)
    }

    pub fn num_ref_idx_l1_active_minus1(mut self, value: u8) -> Self {
        self = self.num_ref_idx_active_override_flag(true);
        self.0.num_ref_idx_l1_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_active(self, value: u8) -> Self {
        self.num_ref_idx_l1_active_minus1(value - 1)
    }

    pub fn no_output_of_prior_pics(mut self) -> Self {
        self.0.dec_ref_pic_marking.no_output_of_prior_pics_flag = true;
        self
    }

    pub fn long_term_reference(mut self) -> Self {
        self.0.dec_ref_pic_marking.long_term_reference_flag = true;
        self
    }

    /// Appends a memory management control operation. This switches the
    /// picture to adaptive reference picture marking.
    pub fn mmco(mut self, op: RefPicMarkingInner) -> Self {
        self.0.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        self.0.dec_ref_pic_marking.inner.push(op);
        self
    }

    pub fn slice_group_change_cycle(mut self, value: u32) -> Self {
        self.0.slice_group_change_cycle = value;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

/// A H264 slice. An integer number of macroblocks or macroblock pairs ordered
/// consecutively in the raster scan within a particular slice group
#[derive(Clone, Debug)]
pub struct Slice {
    /// The slice header.
    pub header: SliceHeader,
    /// The NAL unit backing this slice.
    pub nalu: Nalu,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 in ITU-T H.264.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6 in ITU-T H.264.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6 in ITU-T H.264.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-6 in ITU-T H.264.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    /// Whether this is a SP slice. See table 7-6 in ITU-T H.264.
    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    /// Whether this is a SI slice. See table 7-6 in ITU-T H.264.
    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }

    /// Whether slices of this type predict from reference list 0.
    pub fn is_inter(&self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp | SliceType::B)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

impl Level {
    /// MaxDpbMbs from table A-1.
    fn max_dpb_mbs(&self) -> u32 {
        match self {
            Level::L1 | Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 | Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 | Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 | Level::L5_2 => 184320,
            Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
        }
    }
}

/// A H264 Sequence Parameter Set.
///
/// Two SPSes compare equal if every parsed field is identical, which is how a
/// retransmitted SPS is told apart from a new sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,

    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub level_idc: Level,

    /// Chroma sampling relative to luma, see clause 6.2. Inferred to be 1
    /// (4:2:0) for the profiles that do not code it.
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    /// Whether the scaling lists were coded. If not, `scaling_lists` are flat.
    pub seq_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,

    /// MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4)
    pub log2_max_frame_num_minus4: u8,

    /// Selects one of the three picture order count algorithms of clause 8.2.1.
    pub pic_order_cnt_type: u8,

    /// POC type 0: MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4)
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// POC type 1 parameters.
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,

    /// Maximum number of reference frames, complementary reference field pairs
    /// and non-paired reference fields. This is the size of the sliding window.
    pub max_num_ref_frames: u8,

    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,

    /// If set every coded picture is a frame, otherwise pictures may be fields.
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    // Calculated
    /// Same as ExpectedDeltaPerPicOrderCntCycle, see 7-12 in ITU-T H.264.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17 in ITU-T H.264.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17 in ITU-T H.264.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// PicSizeInMapUnits, see 7-16.
    pub fn pic_size_in_map_units(&self) -> u32 {
        let size = (u64::from(self.pic_width_in_mbs_minus1) + 1)
            * (u64::from(self.pic_height_in_map_units_minus1) + 1);
        u32::try_from(size).unwrap_or(u32::MAX)
    }

    /// FrameSizeInMbs, see 7-19 and 7-20.
    pub fn frame_size_in_mbs(&self) -> u64 {
        (u64::from(self.pic_width_in_mbs_minus1) + 1)
            * (u64::from(self.pic_height_in_map_units_minus1) + 1)
            * (2 - u64::from(self.frame_mbs_only_flag))
    }

    /// Returns `ChromaArrayType`, as computed in ITU-T H.264.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Returns `SubWidthC` and `SubHeightC`.
    ///
    /// See table 6-1 in ITU-T H.264.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // undefined.
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`.
    ///
    /// See 7-19 through 7-22 in ITU-T H.264.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }

    /// Same as MaxFrameNum. See 7-10 in ITU-T H.264.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11 in ITU-T H.264.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// The part of the coded picture that is meant to be displayed.
    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect {
                min: Point { x: 0, y: 0 },
                max: Point {
                    x: self.width(),
                    y: self.height(),
                },
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        let crop_left = crop_unit_x * self.frame_crop_left_offset;
        let crop_right = crop_unit_x * self.frame_crop_right_offset;
        let crop_top = crop_unit_y * self.frame_crop_top_offset;
        let crop_bottom = crop_unit_y * self.frame_crop_bottom_offset;

        Rect {
            min: Point {
                x: crop_left,
                y: crop_top,
            },
            max: Point {
                x: self.width() - crop_right,
                y: self.height() - crop_bottom,
            },
        }
    }

    /// Number of frame buffers the DPB needs for this sequence.
    pub fn max_dpb_frames(&self) -> usize {
        let profile = self.profile_idc;
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(level, Level::L1_1)
            && (profile == Profile::Baseline as u8 || profile == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        };

        let max_dpb_frames = std::cmp::min(
            u64::from(level.max_dpb_mbs()) / self.frame_size_in_mbs(),
            DPB_MAX_SIZE as u64,
        ) as usize;

        // Some streams ask for more reference frames than their level allows.
        let mut max_dpb_frames = std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize);

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            max_dpb_frames = std::cmp::max(1, self.vui_parameters.max_dec_frame_buffering as usize);
        }

        std::cmp::min(max_dpb_frames, DPB_MAX_SIZE)
    }

    /// Maximum number of frames that can precede a frame in decoding order and
    /// follow it in output order.
    pub fn max_num_order_frames(&self) -> u32 {
        let vui = &self.vui_parameters;
        let present = self.vui_parameters_present_flag && vui.bitstream_restriction_flag;

        if present {
            vui.max_num_reorder_frames
        } else if matches!(self.profile_idc, 44 | 86 | 100 | 110 | 122 | 244)
            && self.constraint_set3_flag
        {
            0
        } else {
            self.max_dpb_frames() as u32
        }
    }

    /// Duration of one frame in 90 kHz ticks, or 0 if the stream does not say
    /// or says something implausible.
    pub fn frame_duration(&self) -> u32 {
        if !self.vui_parameters_present_flag {
            return 0;
        }

        self.vui_parameters.frame_duration()
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Self(Sps {
            profile_idc: Profile::Main as u8,
            level_idc: Level::L4,
            chroma_format_idc: 1,
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: true,
            max_num_ref_frames: 1,
            ..Default::default()
        })
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    pub fn constraint_set3_flag(mut self, value: bool) -> Self {
        self.0.constraint_set3_flag = value;
        self
    }

    pub fn frame_crop_offsets(mut self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        self.0.frame_cropping_flag = true;
        self.0.frame_crop_top_offset = top;
        self.0.frame_crop_bottom_offset = bottom;
        self.0.frame_crop_left_offset = left;
        self.0.frame_crop_right_offset = right;
        self
    }

    /// Sets the coded size to `width`x`height` rounded up to whole macroblocks,
    /// cropping the difference away. Call after [`Self::frame_mbs_only_flag`].
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        let map_unit_height = MB_SIZE * (2 - u32::from(self.0.frame_mbs_only_flag));
        let mb_width = (width + MB_SIZE - 1) / MB_SIZE;
        let map_units_height = (height + map_unit_height - 1) / map_unit_height;

        self.0.pic_width_in_mbs_minus1 = (mb_width - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (map_units_height - 1) as u16;

        let coded_width = mb_width * MB_SIZE;
        let coded_height = map_units_height * map_unit_height;

        if coded_width != width || coded_height != height {
            let (crop_unit_x, crop_unit_y) = self.0.crop_unit_x_y();
            self = self.frame_crop_offsets(
                0,
                (coded_height - height) / crop_unit_y,
                0,
                (coded_width - width) / crop_unit_x,
            );
        }

        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    /// Sets explicit scaling lists. Lists left zeroed are coded as not present.
    pub fn scaling_lists(mut self, lists: ScalingLists) -> Self {
        self.0.seq_scaling_matrix_present_flag = true;
        self.0.scaling_lists = lists;
        self
    }

    pub fn vui_parameters_present(mut self) -> Self {
        if self.0.vui_parameters_present_flag {
            return self;
        }

        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters = Default::default();
        self
    }

    pub fn aspect_ratio(mut self, sar_width: u16, sar_height: u16) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.aspect_ratio_info_present_flag = true;
        self.0.vui_parameters.aspect_ratio_idc = EXTENDED_SAR;
        self.0.vui_parameters.sar_width = sar_width;
        self.0.vui_parameters.sar_height = sar_height;
        self
    }

    pub fn timing_info(mut self, num_units_in_tick: u32, time_scale: u32) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.timing_info_present_flag = true;
        self.0.vui_parameters.num_units_in_tick = num_units_in_tick;
        self.0.vui_parameters.time_scale = time_scale;
        self
    }

    pub fn bitstream_restriction(
        mut self,
        max_num_reorder_frames: u32,
        max_dec_frame_buffering: u32,
    ) -> Self {
        self = self.vui_parameters_present();
        let vui = &mut self.0.vui_parameters;
        vui.bitstream_restriction_flag = true;
        vui.motion_vectors_over_pic_boundaries_flag = true;
        vui.max_num_reorder_frames = max_num_reorder_frames;
        vui.max_dec_frame_buffering = max_dec_frame_buffering;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value;
        self
    }

    /// Switches to POC type 1 with the given cycle.
    pub fn pic_order_cnt_cycle(
        mut self,
        offset_for_non_ref_pic: i32,
        offset_for_top_to_bottom_field: i32,
        offset_for_ref_frame: &[i32],
    ) -> Self {
        self.0.pic_order_cnt_type = 1;
        self.0.offset_for_non_ref_pic = offset_for_non_ref_pic;
        self.0.offset_for_top_to_bottom_field = offset_for_top_to_bottom_field;
        self.0.num_ref_frames_in_pic_order_cnt_cycle = offset_for_ref_frame.len() as u8;
        self.0.offset_for_ref_frame = offset_for_ref_frame.to_vec();
        self.0.expected_delta_per_pic_order_cnt_cycle = offset_for_ref_frame.iter().sum();
        self
    }

    pub fn delta_pic_order_always_zero_flag(mut self, value: bool) -> Self {
        self.0.delta_pic_order_always_zero_flag = value;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

/// Extended Sample Aspect Ratio - H.264 Table E-1
pub(crate) const EXTENDED_SAR: u8 = 255;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Plus 1 specifies the number of alternative CPB specifications in the
    /// bitstream.
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

/// Video usability information, Annex E.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    /// Index into table E-1, or [`EXTENDED_SAR`] for an explicit ratio.
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    /// Inferred to be 5 (unspecified) when absent.
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    /// The colour description fields are inferred to be 2 (unspecified) when
    /// absent.
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    /// Time units of a `time_scale` Hz clock per clock tick. A frame lasts two
    /// ticks.
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    /// Upper bound of the number of frames that precede any frame in decoding
    /// order and follow it in output order.
    pub max_num_reorder_frames: u32,
    /// Required size of the DPB, in frame buffers.
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            fixed_frame_rate_flag: false,
            nal_hrd_parameters_present_flag: false,
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: false,
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: false,
            pic_struct_present_flag: false,
            bitstream_restriction_flag: false,
            motion_vectors_over_pic_boundaries_flag: false,
            max_bytes_per_pic_denom: 0,
            max_bits_per_mb_denom: 0,
            log2_max_mv_length_horizontal: 0,
            log2_max_mv_length_vertical: 0,
            max_num_reorder_frames: 0,
            max_dec_frame_buffering: 0,
        }
    }
}

impl VuiParams {
    /// Duration of one frame in 90 kHz ticks, derived from the timing info.
    ///
    /// Some encoders write `time_scale` a thousand times too large, which gives
    /// a frame rate in the thousands. Such values are scaled back once, and any
    /// duration that is still out of range is reported as 0 (unknown).
    pub fn frame_duration(&self) -> u32 {
        if !self.timing_info_present_flag || self.time_scale == 0 {
            return 0;
        }

        let duration = |scale: u64| {
            2 * 90_000 * scale * u64::from(self.num_units_in_tick) / u64::from(self.time_scale)
        };
        let plausible = |d: u64| (MIN_FRAME_DURATION..=MAX_FRAME_DURATION).contains(&d);

        let d = duration(1);
        if plausible(d) {
            return d as u32;
        }

        if d < MIN_FRAME_DURATION {
            let d = duration(1000);
            if plausible(d) {
                debug!("Timing info looks off by 1000, using {} ticks per frame", d);
                return d as u32;
            }
        }

        0
    }

    /// The sample aspect ratio as (width, height), if known. See table E-1.
    pub fn sample_aspect_ratio(&self) -> Option<(u16, u16)> {
        if !self.aspect_ratio_info_present_flag {
            return None;
        }

        let sar = match self.aspect_ratio_idc {
            1 => (1, 1),
            2 => (12, 11),
            3 => (10, 11),
            4 => (16, 11),
            5 => (40, 33),
            6 => (24, 11),
            7 => (20, 11),
            8 => (32, 11),
            9 => (80, 33),
            10 => (18, 11),
            11 => (15, 11),
            12 => (64, 33),
            13 => (160, 99),
            14 => (4, 3),
            15 => (3, 2),
            16 => (2, 1),
            EXTENDED_SAR if self.sar_width != 0 && self.sar_height != 0 => {
                (self.sar_width, self.sar_height)
            }
            _ => return None,
        };

        Some(sar)
    }
}

/// A H264 Picture Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    /// CABAC if set, CAVLC otherwise.
    pub entropy_coding_mode_flag: bool,

    /// Whether slice headers of frames carry the bottom field POC syntax
    /// elements.
    pub bottom_field_pic_order_in_frame_present_flag: bool,

    pub num_slice_groups_minus1: u32,
    /// How macroblocks are mapped to slice groups (0 to 6). Only meaningful
    /// with more than one slice group.
    pub slice_group_map_type: u8,
    /// Map type 0: length of each interleaved run, per slice group.
    pub run_length_minus1: Vec<u32>,
    /// Map type 2: corners of the foreground rectangles, one per slice group
    /// but the last.
    pub top_left: Vec<u32>,
    pub bottom_right: Vec<u32>,
    /// Map types 3 to 5.
    pub slice_group_change_direction_flag: bool,
    pub slice_group_change_rate_minus1: u32,
    /// Map type 6: explicit slice group of each map unit.
    pub pic_size_in_map_units_minus1: u32,
    pub slice_group_id: Vec<u32>,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    pub transform_8x8_mode_flag: bool,

    /// Whether the PPS modifies the scaling lists of the SPS. Either way
    /// `scaling_lists` holds the lists that apply to the picture.
    pub pic_scaling_matrix_present_flag: bool,
    pub scaling_lists: ScalingLists,

    /// Inferred to be `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,

    /// The SPS referenced by this PPS.
    pub sps: Rc<Sps>,
}

impl Pps {
    pub fn num_slice_groups(&self) -> u32 {
        self.num_slice_groups_minus1 + 1
    }

    /// Number of bits used by `slice_group_change_cycle` in the slice header.
    pub(crate) fn slice_group_change_cycle_bits(&self) -> usize {
        // Ceil(Log2(PicSizeInMapUnits ÷ SliceGroupChangeRate + 1))
        let pic_size = u64::from(self.sps.pic_size_in_map_units());
        let rate = u64::from(self.slice_group_change_rate_minus1) + 1;

        let mut bits = 0;
        while (rate << bits) < pic_size + rate {
            bits += 1;
        }

        bits
    }
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Rc<Sps>) -> Self {
        PpsBuilder(Pps {
            seq_parameter_set_id: sps.seq_parameter_set_id,
            scaling_lists: sps.scaling_lists.clone(),
            sps,
            ..Default::default()
        })
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn entropy_coding_mode_flag(mut self, value: bool) -> Self {
        self.0.entropy_coding_mode_flag = value;
        self
    }

    pub fn bottom_field_pic_order_in_frame_present_flag(mut self, value: bool) -> Self {
        self.0.bottom_field_pic_order_in_frame_present_flag = value;
        self
    }

    pub fn pic_init_qp_minus26(mut self, value: i8) -> Self {
        self.0.pic_init_qp_minus26 = value;
        self
    }

    pub fn pic_init_qp(self, value: u8) -> Self {
        self.pic_init_qp_minus26(value as i8 - 26)
    }

    pub fn deblocking_filter_control_present_flag(mut self, value: bool) -> Self {
        self.0.deblocking_filter_control_present_flag = value;
        self
    }

    pub fn num_ref_idx_l0_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l0_default_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l0_default_active(self, value: u8) -> Self {
        self.num_ref_idx_l0_default_active_minus1(value - 1)
    }

    pub fn num_ref_idx_l1_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l1_default_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_default_active(self, value: u8) -> Self {
        self.num_ref_idx_l1_default_active_minus1(value - 1)
    }

    pub fn transform_8x8_mode_flag(mut self, value: bool) -> Self {
        self.0.transform_8x8_mode_flag = value;
        self
    }

    /// Sets explicit scaling lists. Lists left zeroed are coded as not present.
    pub fn scaling_lists(mut self, lists: ScalingLists) -> Self {
        self.0.pic_scaling_matrix_present_flag = true;
        self.0.scaling_lists = lists;
        self
    }

    /// Uses interleaved slice groups (map type 0) with the given run lengths.
    pub fn interleaved_slice_groups(mut self, run_length_minus1: &[u32]) -> Self {
        self.0.num_slice_groups_minus1 = run_length_minus1.len() as u32 - 1;
        self.0.slice_group_map_type = 0;
        self.0.run_length_minus1 = run_length_minus1.to_vec();
        self
    }

    /// Uses foreground slice groups (map type 2). The last group is the
    /// left-over background.
    pub fn foreground_slice_groups(mut self, rectangles: &[(u32, u32)]) -> Self {
        self.0.num_slice_groups_minus1 = rectangles.len() as u32;
        self.0.slice_group_map_type = 2;
        self.0.top_left = rectangles.iter().map(|r| r.0).collect();
        self.0.bottom_right = rectangles.iter().map(|r| r.1).collect();
        self
    }

    /// Uses two evolving slice groups (map types 3 to 5).
    pub fn changing_slice_groups(
        mut self,
        map_type: u8,
        change_direction_flag: bool,
        change_rate_minus1: u32,
    ) -> Self {
        self.0.num_slice_groups_minus1 = 1;
        self.0.slice_group_map_type = map_type;
        self.0.slice_group_change_direction_flag = change_direction_flag;
        self.0.slice_group_change_rate_minus1 = change_rate_minus1;
        self
    }

    /// Uses an explicit slice group map (map type 6).
    pub fn explicit_slice_groups(mut self, num_slice_groups: u32, slice_group_id: &[u32]) -> Self {
        self.0.num_slice_groups_minus1 = num_slice_groups - 1;
        self.0.slice_group_map_type = 6;
        self.0.pic_size_in_map_units_minus1 = slice_group_id.len() as u32 - 1;
        self.0.slice_group_id = slice_group_id.to_vec();
        self
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

/// Keeps the SPSes and PPSes of the stream and uses them to interpret slice
/// headers.
#[derive(Debug, Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
}

impl Parser {
    fn parse_hrd(r: &mut NaluReader, hrd: &mut HrdParams) -> anyhow::Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui(r: &mut NaluReader, vui: &mut VuiParams) -> anyhow::Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits(32)?;
            if vui.num_units_in_tick == 0 {
                return Err(anyhow!(
                    "num_units_in_tick == 0, which is not allowed by E.2.1"
                ));
            }

            vui.time_scale = r.read_bits(32)?;
            if vui.time_scale == 0 {
                return Err(anyhow!("time_scale == 0, which is not allowed by E.2.1"));
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.max_num_reorder_frames = r.read_ue()?;
            vui.max_dec_frame_buffering = r.read_ue()?;
        }

        Ok(())
    }

    fn parse_sps_data(r: &mut NaluReader) -> anyhow::Result<Sps> {
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).with_context(|| format!("Unsupported level {}", level))?;
        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;

        if has_chroma_info(sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
                // Table 7-2: the SPS always uses fall-back rule A.
                sps.scaling_lists =
                    ScalingLists::parse(r, num_8x8, &ScalingLists::table_defaults())
                        .context("Invalid SPS scaling lists")?;
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;

            for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                let offset: i32 = r.read_se()?;
                sps.offset_for_ref_frame.push(offset);

                // (7-12) of ITU-T H.264.
                sps.expected_delta_per_pic_order_cnt_cycle = sps
                    .expected_delta_per_pic_order_cnt_cycle
                    .checked_add(offset)
                    .context("ExpectedDeltaPerPicOrderCntCycle overflow")?;
            }
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if sps.frame_size_in_mbs() > MAX_FRAME_SIZE_IN_MBS {
            return Err(anyhow!(
                "Frame of {}x{} macroblocks exceeds the largest level",
                u32::from(sps.pic_width_in_mbs_minus1) + 1,
                sps.height() / 16
            ));
        }

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // The visible rectangle must not be empty.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|r| r.checked_mul(crop_unit_x))
                .and_then(|r| sps.width().checked_sub(r))
                .filter(|w| *w > 0)
                .ok_or(anyhow!("Invalid frame crop width"))?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|r| r.checked_mul(crop_unit_y))
                .and_then(|r| sps.height().checked_sub(r))
                .filter(|h| *h > 0)
                .ok_or(anyhow!("Invalid frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(r, &mut sps.vui_parameters).context("Invalid VUI parameters")?;
        }

        Ok(sps)
    }

    /// Parse a SPS and store it.
    ///
    /// Returns the SPS now in effect for its ID, and whether it differs from
    /// the one previously stored under that ID. Re-sending an identical SPS
    /// keeps the stored instance and returns `false`. On error, the previous
    /// SPS (if any) stays in effect.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<(Rc<Sps>, bool)> {
        if !matches!(nalu.header().type_, NaluType::Sps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header().type_
            ));
        }

        let rbsp = nalu.rbsp();
        let mut r = NaluReader::new(&rbsp);
        let sps = Parser::parse_sps_data(&mut r)?;
        let key = sps.seq_parameter_set_id;

        let sps = match self.active_spses.entry(key) {
            Entry::Occupied(entry) if **entry.get() == sps => {
                return Ok((Rc::clone(entry.get()), false));
            }
            Entry::Occupied(mut entry) => {
                debug!("SPS {} changed", key);
                entry.insert(Rc::new(sps));
                Rc::clone(entry.get())
            }
            Entry::Vacant(entry) => Rc::clone(entry.insert(Rc::new(sps))),
        };

        // PPSes that refer to this ID now refer to the new SPS.
        for pps in self.active_ppses.values_mut() {
            if pps.seq_parameter_set_id == key {
                let pps = Rc::make_mut(pps);
                if !pps.pic_scaling_matrix_present_flag {
                    pps.scaling_lists = sps.scaling_lists.clone();
                }
                pps.sps = Rc::clone(&sps);
            }
        }

        Ok((sps, true))
    }

    fn parse_slice_group_map(r: &mut NaluReader, pps: &mut Pps, sps: &Sps) -> anyhow::Result<()> {
        pps.slice_group_map_type = r.read_ue_max(6)?;
        let pic_size_in_map_units = sps.pic_size_in_map_units();

        match pps.slice_group_map_type {
            0 => {
                for _ in 0..pps.num_slice_groups() {
                    let run_length_minus1 = r.read_ue_max(pic_size_in_map_units - 1)?;
                    pps.run_length_minus1.push(run_length_minus1);
                }
            }
            2 => {
                // The last slice group is the background and has no rectangle.
                for _ in 0..pps.num_slice_groups_minus1 {
                    let top_left = r.read_ue()?;
                    let bottom_right = r.read_ue()?;
                    if top_left > bottom_right || bottom_right >= pic_size_in_map_units {
                        return Err(anyhow!(
                            "Invalid slice group rectangle {}-{}",
                            top_left,
                            bottom_right
                        ));
                    }
                    pps.top_left.push(top_left);
                    pps.bottom_right.push(bottom_right);
                }
            }
            3..=5 => {
                pps.slice_group_change_direction_flag = r.read_bit()?;
                pps.slice_group_change_rate_minus1 = r.read_ue_max(pic_size_in_map_units - 1)?;
            }
            6 => {
                pps.pic_size_in_map_units_minus1 = r.read_ue_max(pic_size_in_map_units - 1)?;
                let bits = ceil_log2(pps.num_slice_groups());
                for _ in 0..=pps.pic_size_in_map_units_minus1 {
                    pps.slice_group_id.push(r.read_bits(bits)?);
                }
            }
            // Dispersed map: no parameters.
            _ => (),
        }

        Ok(())
    }

    /// Parse a PPS and store it.
    ///
    /// The referenced SPS must already be in the store. On error, the previous
    /// PPS (if any) stays in effect.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Pps>> {
        if !matches!(nalu.header().type_, NaluType::Pps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header().type_
            ));
        }

        let rbsp = nalu.rbsp();
        let mut r = NaluReader::new(&rbsp);

        let pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;
        let seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;
        let sps = Rc::clone(
            self.get_sps(seq_parameter_set_id)
                .ok_or(ParameterSetError::MissingSps(seq_parameter_set_id))?,
        );

        let mut pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            entropy_coding_mode_flag: r.read_bit()?,
            bottom_field_pic_order_in_frame_present_flag: r.read_bit()?,
            num_slice_groups_minus1: r.read_ue_max(7)?,
            ..Default::default()
        };

        if pps.num_slice_groups_minus1 > 0 {
            Parser::parse_slice_group_map(&mut r, &mut pps, &sps)
                .context("Invalid slice group map")?;
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = i32::from(6 * (sps.bit_depth_luma_minus8));
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        pps.scaling_lists = sps.scaling_lists.clone();

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                let num_8x8 = match (pps.transform_8x8_mode_flag, sps.chroma_format_idc) {
                    (false, _) => 0,
                    (true, 3) => 6,
                    (true, _) => 2,
                };

                // Table 7-2: fall-back rule B uses the lists of the SPS, but
                // only if the SPS coded its own.
                let fallback = if sps.seq_scaling_matrix_present_flag {
                    sps.scaling_lists.clone()
                } else {
                    ScalingLists::table_defaults()
                };

                pps.scaling_lists = ScalingLists::parse(&mut r, num_8x8, &fallback)
                    .context("Invalid PPS scaling lists")?;
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        pps.sps = sps;

        let key = pps.pic_parameter_set_id;
        let pps = Rc::new(pps);
        self.active_ppses.insert(key, pps);
        self.active_ppses
            .get(&key)
            .ok_or_else(|| anyhow!("PPS {} vanished from the store", key))
    }

    fn parse_ref_pic_list_modification(
        r: &mut NaluReader,
        num_ref_idx_active_minus1: u8,
        ref_list_mods: &mut Vec<RefPicListModification>,
    ) -> anyhow::Result<()> {
        loop {
            let mut pic_num_mod = RefPicListModification {
                modification_of_pic_nums_idc: r.read_ue_max(3)?,
                ..Default::default()
            };

            match pic_num_mod.modification_of_pic_nums_idc {
                0 | 1 => {
                    pic_num_mod.abs_diff_pic_num_minus1 = r.read_ue()?;
                }
                2 => {
                    pic_num_mod.long_term_pic_num = r.read_ue()?;
                }
                _ => break,
            }

            // There can be at most one modification per entry of the list.
            if ref_list_mods.len() > usize::from(num_ref_idx_active_minus1) {
                return Err(anyhow!("Broken Data: too many reference list modifications"));
            }

            ref_list_mods.push(pic_num_mod);
        }

        Ok(())
    }

    fn parse_ref_pic_list_modifications(
        r: &mut NaluReader,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l0 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    header.num_ref_idx_l0_active_minus1,
                    &mut header.ref_pic_list_modification_l0,
                )?;
            }
        }

        if header.slice_type.is_b() {
            header.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if header.ref_pic_list_modification_flag_l1 {
                Parser::parse_ref_pic_list_modification(
                    r,
                    header.num_ref_idx_l1_active_minus1,
                    &mut header.ref_pic_list_modification_l1,
                )?;
            }
        }

        Ok(())
    }

    fn parse_pred_weight_table(
        r: &mut NaluReader,
        sps: &Sps,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let pt = &mut header.pred_weight_table;
        let has_chroma = sps.chroma_array_type() != 0;
        let num_l0 = usize::from(header.num_ref_idx_l0_active_minus1) + 1;
        let num_l1 = if header.slice_type.is_b() {
            usize::from(header.num_ref_idx_l1_active_minus1) + 1
        } else {
            0
        };

        pt.luma_log2_weight_denom = r.read_ue_max(7)?;
        if has_chroma {
            pt.chroma_log2_weight_denom = r.read_ue_max(7)?;
        }

        // Entries without explicit weights use 2 ^ log2_weight_denom.
        let default_luma_weight = 1 << pt.luma_log2_weight_denom;
        let default_chroma_weight = 1 << pt.chroma_log2_weight_denom;

        for i in 0..num_l0 {
            pt.luma_weight_l0[i] = default_luma_weight;
            if r.read_bit()? {
                pt.luma_weight_l0[i] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l0[i] = r.read_se_bounded(-128, 127)?;
            }

            if has_chroma {
                pt.chroma_weight_l0[i] = [default_chroma_weight; 2];
                if r.read_bit()? {
                    for j in 0..2 {
                        pt.chroma_weight_l0[i][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l0[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        for i in 0..num_l1 {
            pt.luma_weight_l1[i] = default_luma_weight;
            if r.read_bit()? {
                pt.luma_weight_l1[i] = r.read_se_bounded(-128, 127)?;
                pt.luma_offset_l1[i] = r.read_se_bounded(-128, 127)?;
            }

            if has_chroma {
                pt.chroma_weight_l1[i] = [default_chroma_weight; 2];
                if r.read_bit()? {
                    for j in 0..2 {
                        pt.chroma_weight_l1[i][j] = r.read_se_bounded(-128, 127)?;
                        pt.chroma_offset_l1[i][j] = r.read_se_bounded(-128, 127)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking(
        r: &mut NaluReader,
        idr_pic_flag: bool,
        rpm: &mut RefPicMarking,
    ) -> anyhow::Result<()> {
        if idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
            return Ok(());
        }

        rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
        if !rpm.adaptive_ref_pic_marking_mode_flag {
            return Ok(());
        }

        loop {
            let mut marking = RefPicMarkingInner {
                memory_management_control_operation: r.read_ue_max(6)?,
                ..Default::default()
            };

            match marking.memory_management_control_operation {
                0 => break,
                1 => marking.difference_of_pic_nums_minus1 = r.read_ue()?,
                2 => marking.long_term_pic_num = r.read_ue()?,
                3 => {
                    marking.difference_of_pic_nums_minus1 = r.read_ue()?;
                    marking.long_term_frame_idx = r.read_ue()?;
                }
                4 => {
                    marking.max_long_term_frame_idx =
                        MaxLongTermFrameIdx::from_value_plus1(r.read_ue()?);
                }
                6 => marking.long_term_frame_idx = r.read_ue()?,
                // 5 has no operands.
                _ => (),
            }

            // Guard against an unterminated list in corrupt data.
            if rpm.inner.len() >= 66 {
                return Err(anyhow!("Broken Data: too many MMCO operations"));
            }

            rpm.inner.push(marking);
        }

        Ok(())
    }

    /// Parses the header of a slice NAL unit.
    ///
    /// Fails with a [`ParameterSetError`] if the slice refers to a PPS (or the
    /// PPS to a SPS) that is not in the store.
    pub fn parse_slice_header(&self, nalu: Nalu) -> anyhow::Result<Slice> {
        let hdr = *nalu.header();
        if !matches!(
            hdr.type_,
            NaluType::Slice | NaluType::SliceDpa | NaluType::SliceIdr
        ) {
            return Err(anyhow!(
                "Invalid NALU type: {:?} is not a slice NALU",
                hdr.type_
            ));
        }

        let rbsp = nalu.rbsp();
        let mut r = NaluReader::new(&rbsp);

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("Invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;

        let pps = self
            .get_pps(header.pic_parameter_set_id)
            .ok_or(ParameterSetError::MissingPps(header.pic_parameter_set_id))?;

        let sps = &pps.sps;

        if hdr.idr_pic_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            return Err(anyhow!(
                "Broken Data: IDR slice of type {:?}",
                header.slice_type
            ));
        }

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        if header.field_pic_flag {
            header.max_pic_num = 2 * sps.max_frame_num();
        } else {
            header.max_pic_num = sps.max_frame_num();
        }

        if hdr.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if header.slice_type.is_inter() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_max(31)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_max(31)?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        // Frames can use at most 16 references per list, fields 32.
        let max_ref_idx = if header.field_pic_flag { 31 } else { 15 };
        if header.num_ref_idx_l0_active_minus1 > max_ref_idx
            || header.num_ref_idx_l1_active_minus1 > max_ref_idx
        {
            return Err(anyhow!("Broken Data: too many active references"));
        }

        Parser::parse_ref_pic_list_modifications(&mut r, &mut header)?;

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            Parser::parse_pred_weight_table(&mut r, sps, &mut header)?;
        }

        if hdr.ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(
                &mut r,
                hdr.idr_pic_flag,
                &mut header.dec_ref_pic_marking,
            )?;
        }

        if pps.entropy_coding_mode_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.cabac_init_idc = r.read_ue_max(2)?;
        }

        header.slice_qp_delta = r.read_se_bounded(-87, 77)?;

        if header.slice_type.is_sp() || header.slice_type.is_si() {
            if header.slice_type.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }

            header.slice_qs_delta = r.read_se_bounded(-51, 51)?;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc = r.read_ue_max(2)?;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 = r.read_se_bounded(-6, 6)?;
                header.slice_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            header.slice_group_change_cycle = r.read_bits(pps.slice_group_change_cycle_bits())?;
        }

        Ok(Slice { header, nalu })
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&pps_id)
    }

    /// Number of SPSes in the store.
    pub fn num_sps(&self) -> usize {
        self.active_spses.len()
    }

    /// Number of PPSes in the store.
    pub fn num_pps(&self) -> usize {
        self.active_ppses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::synthesizer::pps_nalu;
    use crate::codec::h264::synthesizer::slice_nalu;
    use crate::codec::h264::synthesizer::sps_nalu;

    fn main_sps() -> SpsBuilder {
        SpsBuilder::new()
            .resolution(320, 240)
            .log2_max_frame_num_minus4(0)
            .pic_order_cnt_type(0)
            .log2_max_pic_order_cnt_lsb_minus4(0)
            .max_num_ref_frames(4)
    }

    #[test]
    fn parse_sps_fields() {
        let sps = main_sps().seq_parameter_set_id(3).build();
        let mut parser = Parser::default();

        let (parsed, is_new) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert!(is_new);
        assert_eq!(parsed.seq_parameter_set_id, 3);
        assert_eq!(parsed.width(), 320);
        assert_eq!(parsed.height(), 240);
        assert_eq!(parsed.max_frame_num(), 16);
        assert_eq!(parsed.max_pic_order_cnt_lsb(), 16);
        assert_eq!(parsed.max_num_ref_frames, 4);
        assert_eq!(parsed.chroma_format_idc, 1);
        assert_eq!(parsed.scaling_lists, ScalingLists::default());
        assert!(!parsed.frame_cropping_flag);
        assert_eq!(*parsed, *sps);
        assert!(parser.get_sps(3).is_some());
    }

    #[test]
    fn identical_sps_is_not_new() {
        let sps = main_sps().build();
        let nalu = sps_nalu(&sps).unwrap();
        let mut parser = Parser::default();

        let (first, is_new) = parser.parse_sps(&nalu).unwrap();
        assert!(is_new);

        let (second, is_new) = parser.parse_sps(&nalu).unwrap();
        assert!(!is_new);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(parser.num_sps(), 1);

        let changed = main_sps().max_num_ref_frames(2).build();
        let (third, is_new) = parser.parse_sps(&sps_nalu(&changed).unwrap()).unwrap();
        assert!(is_new);
        assert_eq!(third.max_num_ref_frames, 2);
        assert_eq!(parser.num_sps(), 1);
    }

    #[test]
    fn changed_sps_is_seen_by_existing_pps() {
        let sps = main_sps().build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();
        let mut parser = Parser::default();

        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();

        let bigger = main_sps().resolution(640, 480).build();
        parser.parse_sps(&sps_nalu(&bigger).unwrap()).unwrap();

        assert_eq!(parser.get_pps(0).unwrap().sps.width(), 640);
    }

    #[test]
    fn sps_cropping() {
        let sps = main_sps().resolution(1920, 1080).build();
        let mut parser = Parser::default();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();

        assert_eq!(sps.height(), 1088);
        assert!(sps.frame_cropping_flag);
        assert_eq!(sps.frame_crop_bottom_offset, 4);

        let visible = sps.visible_rectangle();
        assert_eq!(visible.min, Point { x: 0, y: 0 });
        assert_eq!(visible.max, Point { x: 1920, y: 1080 });
    }

    #[test]
    fn sps_frame_duration() {
        let mut parser = Parser::default();

        // 25 frames per second.
        let sps = main_sps().timing_info(1, 50).build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.frame_duration(), 3600);

        // 29.97 frames per second.
        let sps = main_sps().timing_info(1001, 60000).build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.frame_duration(), 3003);

        // time_scale a thousand times too large.
        let sps = main_sps().timing_info(1, 50000).build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.frame_duration(), 3600);

        // Way off in both interpretations.
        let sps = main_sps().timing_info(1, 0xffff_ffff).build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.frame_duration(), 0);

        let sps = main_sps().build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.frame_duration(), 0);
    }

    #[test]
    fn sps_dpb_size() {
        let mut parser = Parser::default();

        // 1080p at level 4: 32768 / (120 * 68) = 4 frames.
        let sps = main_sps().resolution(1920, 1080).level_idc(Level::L4).build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.max_dpb_frames(), 4);
        assert_eq!(sps.max_num_order_frames(), 4);

        // The VUI overrides the level limits.
        let sps = main_sps()
            .resolution(1920, 1080)
            .bitstream_restriction(1, 3)
            .build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.max_dpb_frames(), 3);
        assert_eq!(sps.max_num_order_frames(), 1);

        // Never more than 16 frames.
        let sps = main_sps().resolution(64, 64).level_idc(Level::L5_1).build();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(sps.max_dpb_frames(), DPB_MAX_SIZE);
    }

    #[test]
    fn sps_scaling_list_fallback_rule_a() {
        let mut lists = ScalingLists {
            list_4x4: [[0; 16]; 6],
            list_8x8: [[0; 64]; 6],
        };
        lists.list_4x4[0] = [7; 16];
        lists.list_4x4[4] = [9; 16];
        lists.list_8x8[1] = [11; 64];

        let sps = main_sps()
            .profile_idc(Profile::High)
            .scaling_lists(lists)
            .build();
        let mut parser = Parser::default();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();

        let parsed = &sps.scaling_lists;
        assert_eq!(parsed.list_4x4[0], [7; 16]);
        // Absent lists repeat the previous one of the same kind.
        assert_eq!(parsed.list_4x4[1], [7; 16]);
        assert_eq!(parsed.list_4x4[2], [7; 16]);
        // Except for the first inter list, which uses the default.
        assert_eq!(parsed.list_4x4[3], DEFAULT_4X4_INTER);
        assert_eq!(parsed.list_4x4[4], [9; 16]);
        assert_eq!(parsed.list_4x4[5], [9; 16]);

        assert_eq!(parsed.list_8x8[0], DEFAULT_8X8_INTRA);
        assert_eq!(parsed.list_8x8[1], [11; 64]);
    }

    #[test]
    fn pps_scaling_list_fallback_rule_b() {
        let mut sps_lists = ScalingLists {
            list_4x4: [[0; 16]; 6],
            list_8x8: [[0; 64]; 6],
        };
        sps_lists.list_4x4[0] = [5; 16];
        sps_lists.list_4x4[3] = [6; 16];
        sps_lists.list_8x8[0] = [7; 64];
        sps_lists.list_8x8[1] = [8; 64];

        let sps = main_sps()
            .profile_idc(Profile::High)
            .scaling_lists(sps_lists)
            .build();

        // Only the second 8x8 list is coded, and it asks for the default one.
        let mut pps_lists = ScalingLists {
            list_4x4: [[0; 16]; 6],
            list_8x8: [[0; 64]; 6],
        };
        pps_lists.list_8x8[1] = DEFAULT_8X8_INTER;
        let pps = PpsBuilder::new(Rc::clone(&sps))
            .transform_8x8_mode_flag(true)
            .scaling_lists(pps_lists)
            .build();

        let mut parser = Parser::default();
        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        let pps = parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();

        let parsed = &pps.scaling_lists;
        assert_eq!(parsed.list_4x4[0], [5; 16]);
        assert_eq!(parsed.list_4x4[2], [5; 16]);
        assert_eq!(parsed.list_4x4[3], [6; 16]);
        assert_eq!(parsed.list_4x4[5], [6; 16]);
        assert_eq!(parsed.list_8x8[0], [7; 64]);
        assert_eq!(parsed.list_8x8[1], DEFAULT_8X8_INTER);
    }

    #[test]
    fn pps_without_matrix_uses_sps_lists() {
        let mut sps_lists = ScalingLists::table_defaults();
        sps_lists.list_4x4[2] = [3; 16];
        let sps = main_sps()
            .profile_idc(Profile::High)
            .scaling_lists(sps_lists)
            .build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();

        let mut parser = Parser::default();
        let (sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        let pps = parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();

        assert!(!pps.pic_scaling_matrix_present_flag);
        assert_eq!(pps.scaling_lists, sps.scaling_lists);
        assert_eq!(pps.scaling_lists.list_4x4[2], [3; 16]);
    }

    #[test]
    fn pps_missing_sps() {
        let sps = main_sps().seq_parameter_set_id(1).build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();

        let mut parser = Parser::default();
        let err = parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ParameterSetError>(),
            Some(&ParameterSetError::MissingSps(1))
        );
        assert_eq!(parser.num_pps(), 0);
    }

    #[test]
    fn pps_slice_groups() {
        let sps = main_sps().build();
        let mut parser = Parser::default();
        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();

        let pps = PpsBuilder::new(Rc::clone(&sps))
            .interleaved_slice_groups(&[3, 7, 1])
            .build();
        let parsed = parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();
        assert_eq!(parsed.num_slice_groups(), 3);
        assert_eq!(parsed.run_length_minus1, vec![3, 7, 1]);

        let pps = PpsBuilder::new(Rc::clone(&sps))
            .pic_parameter_set_id(1)
            .foreground_slice_groups(&[(0, 21), (44, 66)])
            .build();
        let parsed = parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();
        assert_eq!(parsed.slice_group_map_type, 2);
        assert_eq!(parsed.top_left, vec![0, 44]);
        assert_eq!(parsed.bottom_right, vec![21, 66]);

        let pps = PpsBuilder::new(Rc::clone(&sps))
            .pic_parameter_set_id(2)
            .explicit_slice_groups(3, &[0, 1, 2, 2, 1, 0])
            .build();
        let parsed = parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();
        assert_eq!(parsed.slice_group_map_type, 6);
        assert_eq!(parsed.slice_group_id, vec![0, 1, 2, 2, 1, 0]);

        assert_eq!(parser.num_pps(), 3);
    }

    #[test]
    fn slice_group_change_cycle() {
        // 20x15 macroblocks = 300 map units, rate 7: Ceil(Log2(300 / 7 + 1)) = 6 bits.
        let sps = main_sps().build();
        let pps = PpsBuilder::new(Rc::clone(&sps))
            .changing_slice_groups(4, true, 6)
            .build();
        assert_eq!(pps.slice_group_change_cycle_bits(), 6);

        let mut parser = Parser::default();
        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        let pps = Rc::clone(parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap());
        assert!(pps.slice_group_change_direction_flag);
        assert_eq!(pps.slice_group_change_rate_minus1, 6);

        let header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::I)
            .slice_group_change_cycle(42)
            .build();
        let nalu = slice_nalu(3, NaluType::SliceIdr, &header, &pps).unwrap();
        let slice = parser.parse_slice_header(nalu).unwrap();

        assert_eq!(slice.header.slice_group_change_cycle, 42);
    }

    #[test]
    fn parse_idr_slice_header() {
        let sps = main_sps().build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();

        let mut parser = Parser::default();
        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();

        let header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::I)
            .idr_pic_id(7)
            .pic_order_cnt_lsb(0)
            .long_term_reference()
            .build();
        let nalu = slice_nalu(3, NaluType::SliceIdr, &header, &pps).unwrap();
        let slice = parser.parse_slice_header(nalu).unwrap();

        assert_eq!(slice.header.slice_type, SliceType::I);
        assert_eq!(slice.header.idr_pic_id, 7);
        assert_eq!(slice.header.frame_num, 0);
        assert_eq!(slice.header.max_pic_num, 16);
        assert_eq!(slice.header.field(), Field::Frame);
        assert!(slice.header.dec_ref_pic_marking.long_term_reference_flag);
        assert!(!slice.header.dec_ref_pic_marking.no_output_of_prior_pics_flag);
        assert!(slice.nalu.header().idr_pic_flag);
    }

    #[test]
    fn parse_slice_header_with_mmco() {
        let sps = main_sps().build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();

        let mut parser = Parser::default();
        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();

        let ops = [
            RefPicMarkingInner {
                memory_management_control_operation: 1,
                difference_of_pic_nums_minus1: 2,
                ..Default::default()
            },
            RefPicMarkingInner {
                memory_management_control_operation: 4,
                max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(1),
                ..Default::default()
            },
            RefPicMarkingInner {
                memory_management_control_operation: 3,
                difference_of_pic_nums_minus1: 0,
                long_term_frame_idx: 1,
                ..Default::default()
            },
            RefPicMarkingInner {
                memory_management_control_operation: 6,
                long_term_frame_idx: 0,
                ..Default::default()
            },
        ];

        let header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::P)
            .frame_num(5)
            .pic_order_cnt_lsb(10)
            .num_ref_idx_l0_active(2)
            .mmco(ops[0].clone())
            .mmco(ops[1].clone())
            .mmco(ops[2].clone())
            .mmco(ops[3].clone())
            .build();
        let nalu = slice_nalu(2, NaluType::Slice, &header, &pps).unwrap();
        let slice = parser.parse_slice_header(nalu).unwrap();

        assert_eq!(slice.header.frame_num, 5);
        assert_eq!(slice.header.pic_order_cnt_lsb, 10);
        assert_eq!(slice.header.num_ref_idx_l0_active_minus1, 1);
        assert!(slice.header.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag);
        assert_eq!(slice.header.dec_ref_pic_marking.inner, ops.to_vec());
        assert_eq!(slice.header, header);
    }

    #[test]
    fn slice_header_missing_pps() {
        let sps = main_sps().build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).pic_parameter_set_id(4).build();

        let mut parser = Parser::default();
        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();

        let header = SliceHeaderBuilder::new(&pps).slice_type(SliceType::I).build();
        let nalu = slice_nalu(3, NaluType::SliceIdr, &header, &pps).unwrap();
        let err = parser.parse_slice_header(nalu).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ParameterSetError>(),
            Some(&ParameterSetError::MissingPps(4))
        );
    }

    #[test]
    fn truncated_sps_is_rejected() {
        let sps = main_sps().build();
        let nalu = sps_nalu(&sps).unwrap();
        let truncated = Nalu::from_unit(&nalu.data()[..4]).unwrap();

        let mut parser = Parser::default();
        assert!(parser.parse_sps(&truncated).is_err());
        assert_eq!(parser.num_sps(), 0);
    }

    #[test]
    fn oversized_sps_is_rejected() {
        let mut sps = Sps::clone(&main_sps().frame_mbs_only_flag(false).build());
        sps.pic_width_in_mbs_minus1 = u16::MAX;
        sps.pic_height_in_map_units_minus1 = u16::MAX;

        // 65536 * 65536 * 2 macroblocks do not fit in 32 bits.
        assert_eq!(sps.frame_size_in_mbs(), 1 << 33);
        assert_eq!(sps.pic_size_in_map_units(), u32::MAX);

        let mut parser = Parser::default();
        assert!(parser.parse_sps(&sps_nalu(&sps).unwrap()).is_err());
        assert_eq!(parser.num_sps(), 0);

        // The largest level still fits.
        let mut sps = Sps::clone(&main_sps().build());
        sps.pic_width_in_mbs_minus1 = 511;
        sps.pic_height_in_map_units_minus1 = 271;
        let (parsed, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(parsed.frame_size_in_mbs(), 139_264);
        assert!(parsed.max_dpb_frames() >= 1);
    }

    #[test]
    fn field_slice_header() {
        let sps = main_sps().frame_mbs_only_flag(false).resolution(720, 576).build();
        let pps = PpsBuilder::new(Rc::clone(&sps))
            .bottom_field_pic_order_in_frame_present_flag(true)
            .build();

        let mut parser = Parser::default();
        let (parsed_sps, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        assert_eq!(parsed_sps.height(), 576);
        parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();

        let header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::I)
            .field(Field::Bottom)
            .pic_order_cnt_lsb(1)
            .build();
        let nalu = slice_nalu(3, NaluType::SliceIdr, &header, &pps).unwrap();
        let slice = parser.parse_slice_header(nalu).unwrap();

        assert_eq!(slice.header.field(), Field::Bottom);
        assert_eq!(slice.header.max_pic_num, 32);
        assert_eq!(slice.header.pic_order_cnt_lsb, 1);

        // Frames of the same sequence carry the bottom field delta.
        let header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::I)
            .delta_pic_order_cnt_bottom(-1)
            .build();
        let nalu = slice_nalu(3, NaluType::SliceIdr, &header, &pps).unwrap();
        let slice = parser.parse_slice_header(nalu).unwrap();

        assert_eq!(slice.header.field(), Field::Frame);
        assert_eq!(slice.header.delta_pic_order_cnt_bottom, -1);
    }
}
