// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes parameter sets and slice headers back into NAL units. This is the
//! inverse of [`super::parser::Parser`] and is mostly useful to build streams
//! with precise properties.

use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluError;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::parser::has_chroma_info;
use crate::codec::h264::parser::HrdParams;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::PredWeightTable;
use crate::codec::h264::parser::RefPicListModification;
use crate::codec::h264::parser::ScalingLists;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::parser::DEFAULT_4X4_INTER;
use crate::codec::h264::parser::DEFAULT_4X4_INTRA;
use crate::codec::h264::parser::DEFAULT_8X8_INTER;
use crate::codec::h264::parser::DEFAULT_8X8_INTRA;
use crate::codec::h264::parser::EXTENDED_SAR;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
    #[error(transparent)]
    Nalu(#[from] NaluError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn f<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn scaling_list(&mut self, list: &[u8], default: &[u8]) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.1.1
        if list == default {
            self.se(-8)?;
            return Ok(());
        }

        // Trailing repeated values are coded by setting nextScale to zero.
        let mut run = list.len();
        while run > 1 && list[run - 2] == list[run - 1] {
            run -= 1;
        }

        let mut last_scale = 8;
        for scale in &list[0..run] {
            let delta_scale = *scale as i32 - last_scale;
            // Deltas wrap modulo 256 and must fit in [-128, 127].
            let delta_scale = (delta_scale + 128).rem_euclid(256) - 128;
            self.se(delta_scale)?;
            last_scale = *scale as i32;
        }

        if run < list.len() {
            self.se(-last_scale)?;
        }

        Ok(())
    }

    /// Writes the present flags and lists of `lists`. A list made of zeroes is
    /// coded as not present, one equal to its default with the default flag.
    fn scaling_lists(&mut self, lists: &ScalingLists, num_8x8: usize) -> SynthesizerResult<()> {
        for (i, list) in lists.list_4x4.iter().enumerate() {
            let default = if i < 3 {
                &DEFAULT_4X4_INTRA
            } else {
                &DEFAULT_4X4_INTER
            };
            self.scaling_list_entry(list, default)?;
        }

        for (i, list) in lists.list_8x8.iter().take(num_8x8).enumerate() {
            let default = if i % 2 == 0 {
                &DEFAULT_8X8_INTRA
            } else {
                &DEFAULT_8X8_INTER
            };
            self.scaling_list_entry(list, default)?;
        }

        Ok(())
    }

    fn scaling_list_entry(&mut self, list: &[u8], default: &[u8]) -> SynthesizerResult<()> {
        if list.iter().all(|v| *v == 0) {
            self.u(1, /* scaling_list_present_flag */ false)
        } else {
            self.u(1, /* scaling_list_present_flag */ true)?;
            self.scaling_list(list, default)
        }
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.f(1, 1u32)?;

        while !self.writer.aligned() {
            self.f(1, 0u32)?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(
        ref_idc: u8,
        sps: &'n Sps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(ref_idc, NaluType::Sps as u8)?;
        s.seq_parameter_set_data()?;
        s.rbsp_trailing_bits()
    }

    fn hrd_parameters(&mut self, hrd_params: &HrdParams) -> SynthesizerResult<()> {
        self.ue(hrd_params.cpb_cnt_minus1)?;
        self.u(4, hrd_params.bit_rate_scale)?;
        self.u(4, hrd_params.cpb_size_scale)?;

        for i in 0..=(hrd_params.cpb_cnt_minus1 as usize) {
            self.ue(hrd_params.bit_rate_value_minus1[i])?;
            self.ue(hrd_params.cpb_size_value_minus1[i])?;
            self.u(1, hrd_params.cbr_flag[i])?;
        }

        self.u(5, hrd_params.initial_cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.dpb_output_delay_length_minus1)?;
        self.u(5, hrd_params.time_offset_length)?;

        Ok(())
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // H.264 E.1.1
        let vui = &self.nalu.vui_parameters;

        self.u(1, vui.aspect_ratio_info_present_flag)?;
        if vui.aspect_ratio_info_present_flag {
            self.u(8, vui.aspect_ratio_idc)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui.sar_width)?;
                self.u(16, vui.sar_height)?;
            }
        }

        self.u(1, vui.overscan_info_present_flag)?;
        if vui.overscan_info_present_flag {
            self.u(1, vui.overscan_appropriate_flag)?;
        }

        self.u(1, vui.video_signal_type_present_flag)?;
        if vui.video_signal_type_present_flag {
            self.u(3, vui.video_format)?;
            self.u(1, vui.video_full_range_flag)?;

            self.u(1, vui.colour_description_present_flag)?;
            if vui.colour_description_present_flag {
                self.u(8, vui.colour_primaries)?;
                self.u(8, vui.transfer_characteristics)?;
                self.u(8, vui.matrix_coefficients)?;
            }
        }

        self.u(1, vui.chroma_loc_info_present_flag)?;
        if vui.chroma_loc_info_present_flag {
            self.ue(vui.chroma_sample_loc_type_top_field)?;
            self.ue(vui.chroma_sample_loc_type_bottom_field)?;
        }

        self.u(1, vui.timing_info_present_flag)?;
        if vui.timing_info_present_flag {
            self.u(32, vui.num_units_in_tick)?;
            self.u(32, vui.time_scale)?;
            self.u(1, vui.fixed_frame_rate_flag)?;
        }

        self.u(1, vui.nal_hrd_parameters_present_flag)?;
        if vui.nal_hrd_parameters_present_flag {
            self.hrd_parameters(&vui.nal_hrd_parameters)?;
        }
        self.u(1, vui.vcl_hrd_parameters_present_flag)?;
        if vui.vcl_hrd_parameters_present_flag {
            self.hrd_parameters(&vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            self.u(1, vui.low_delay_hrd_flag)?;
        }

        self.u(1, vui.pic_struct_present_flag)?;

        self.u(1, vui.bitstream_restriction_flag)?;
        if vui.bitstream_restriction_flag {
            self.u(1, vui.motion_vectors_over_pic_boundaries_flag)?;
            self.ue(vui.max_bytes_per_pic_denom)?;
            self.ue(vui.max_bits_per_mb_denom)?;
            self.ue(vui.log2_max_mv_length_horizontal)?;
            self.ue(vui.log2_max_mv_length_vertical)?;
            self.ue(vui.max_num_reorder_frames)?;
            self.ue(vui.max_dec_frame_buffering)?;
        }

        Ok(())
    }

    fn seq_parameter_set_data(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.1
        let sps = self.nalu;

        self.u(8, sps.profile_idc)?;
        self.u(1, sps.constraint_set0_flag)?;
        self.u(1, sps.constraint_set1_flag)?;
        self.u(1, sps.constraint_set2_flag)?;
        self.u(1, sps.constraint_set3_flag)?;
        self.u(1, sps.constraint_set4_flag)?;
        self.u(1, sps.constraint_set5_flag)?;
        self.u(2, /* reserved_zero_2bits */ 0u32)?;
        self.u(8, sps.level_idc as u32)?;
        self.ue(sps.seq_parameter_set_id)?;

        if has_chroma_info(sps.profile_idc) {
            self.ue(sps.chroma_format_idc)?;

            if sps.chroma_format_idc == 3 {
                self.u(1, sps.separate_colour_plane_flag)?;
            }

            self.ue(sps.bit_depth_luma_minus8)?;
            self.ue(sps.bit_depth_chroma_minus8)?;
            self.u(1, sps.qpprime_y_zero_transform_bypass_flag)?;
            self.u(1, sps.seq_scaling_matrix_present_flag)?;

            if sps.seq_scaling_matrix_present_flag {
                let num_8x8 = if sps.chroma_format_idc != 3 { 2 } else { 6 };
                self.scaling_lists(&sps.scaling_lists, num_8x8)?;
            }
        } else if sps.chroma_format_idc != 1 || sps.seq_scaling_matrix_present_flag {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(sps.log2_max_frame_num_minus4)?;
        self.ue(sps.pic_order_cnt_type)?;

        if sps.pic_order_cnt_type == 0 {
            self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;
        } else if sps.pic_order_cnt_type == 1 {
            self.u(1, sps.delta_pic_order_always_zero_flag)?;
            self.se(sps.offset_for_non_ref_pic)?;
            self.se(sps.offset_for_top_to_bottom_field)?;
            self.ue(sps.num_ref_frames_in_pic_order_cnt_cycle)?;

            let count = usize::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
            if sps.offset_for_ref_frame.len() < count {
                return Err(SynthesizerError::Unsupported);
            }

            for offset_for_ref_frame in &sps.offset_for_ref_frame[..count] {
                self.se(*offset_for_ref_frame)?;
            }
        }

        self.ue(sps.max_num_ref_frames)?;
        self.u(1, sps.gaps_in_frame_num_value_allowed_flag)?;
        self.ue(sps.pic_width_in_mbs_minus1)?;
        self.ue(sps.pic_height_in_map_units_minus1)?;
        self.u(1, sps.frame_mbs_only_flag)?;
        if !sps.frame_mbs_only_flag {
            self.u(1, sps.mb_adaptive_frame_field_flag)?;
        }
        self.u(1, sps.direct_8x8_inference_flag)?;

        self.u(1, sps.frame_cropping_flag)?;
        if sps.frame_cropping_flag {
            self.ue(sps.frame_crop_left_offset)?;
            self.ue(sps.frame_crop_right_offset)?;
            self.ue(sps.frame_crop_top_offset)?;
            self.ue(sps.frame_crop_bottom_offset)?;
        }

        self.u(1, sps.vui_parameters_present_flag)?;
        if sps.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(
        ref_idc: u8,
        pps: &'n Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(ref_idc, NaluType::Pps as u8)?;
        s.pic_parameter_set_rbsp()?;
        s.rbsp_trailing_bits()
    }

    fn slice_group_map(&mut self) -> SynthesizerResult<()> {
        let pps = self.nalu;
        let num_slice_groups = pps.num_slice_groups_minus1 as usize + 1;

        self.ue(pps.slice_group_map_type)?;
        match pps.slice_group_map_type {
            0 => {
                if pps.run_length_minus1.len() != num_slice_groups {
                    return Err(SynthesizerError::Unsupported);
                }

                for run_length_minus1 in &pps.run_length_minus1 {
                    self.ue(*run_length_minus1)?;
                }
            }
            2 => {
                if pps.top_left.len() != num_slice_groups - 1
                    || pps.bottom_right.len() != num_slice_groups - 1
                {
                    return Err(SynthesizerError::Unsupported);
                }

                for (top_left, bottom_right) in pps.top_left.iter().zip(&pps.bottom_right) {
                    self.ue(*top_left)?;
                    self.ue(*bottom_right)?;
                }
            }
            3..=5 => {
                self.u(1, pps.slice_group_change_direction_flag)?;
                self.ue(pps.slice_group_change_rate_minus1)?;
            }
            6 => {
                self.ue(pps.pic_size_in_map_units_minus1)?;

                let bits = 32 - pps.num_slice_groups_minus1.leading_zeros() as usize;
                for id in &pps.slice_group_id {
                    self.u(bits, *id)?;
                }
            }
            _ => (),
        }

        Ok(())
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        let pps = self.nalu;

        self.ue(pps.pic_parameter_set_id)?;
        self.ue(pps.seq_parameter_set_id)?;
        self.u(1, pps.entropy_coding_mode_flag)?;
        self.u(1, pps.bottom_field_pic_order_in_frame_present_flag)?;

        self.ue(pps.num_slice_groups_minus1)?;
        if pps.num_slice_groups_minus1 > 0 {
            self.slice_group_map()?;
        }

        self.ue(pps.num_ref_idx_l0_default_active_minus1)?;
        self.ue(pps.num_ref_idx_l1_default_active_minus1)?;
        self.u(1, pps.weighted_pred_flag)?;
        self.u(2, pps.weighted_bipred_idc)?;
        self.se(pps.pic_init_qp_minus26)?;
        self.se(pps.pic_init_qs_minus26)?;
        self.se(pps.chroma_qp_index_offset)?;
        self.u(1, pps.deblocking_filter_control_present_flag)?;
        self.u(1, pps.constrained_intra_pred_flag)?;
        self.u(1, pps.redundant_pic_cnt_present_flag)?;

        if !(pps.transform_8x8_mode_flag
            || pps.pic_scaling_matrix_present_flag
            || pps.second_chroma_qp_index_offset != pps.chroma_qp_index_offset)
        {
            return Ok(());
        }

        self.u(1, pps.transform_8x8_mode_flag)?;
        self.u(1, pps.pic_scaling_matrix_present_flag)?;

        if pps.pic_scaling_matrix_present_flag {
            let num_8x8 = match (pps.transform_8x8_mode_flag, pps.sps.chroma_format_idc) {
                (false, _) => 0,
                (true, 3) => 6,
                (true, _) => 2,
            };
            self.scaling_lists(&pps.scaling_lists, num_8x8)?;
        }

        self.se(pps.second_chroma_qp_index_offset)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice NAL unit made of `header` followed by empty slice data.
    /// `pps` must be the parameter set the header refers to.
    pub fn synthesize(
        ref_idc: u8,
        nalu_type: NaluType,
        header: &'n SliceHeader,
        pps: &Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<()> {
        if !matches!(nalu_type, NaluType::Slice | NaluType::SliceIdr) {
            return Err(SynthesizerError::Unsupported);
        }

        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: header,
        };

        s.writer.write_header(ref_idc, nalu_type as u8)?;
        s.slice_header(ref_idc, matches!(nalu_type, NaluType::SliceIdr), pps)?;
        s.rbsp_trailing_bits()
    }

    fn ref_pic_list_modification(
        &mut self,
        flag: bool,
        mods: &[RefPicListModification],
    ) -> SynthesizerResult<()> {
        self.u(1, flag)?;
        if !flag {
            return Ok(());
        }

        for m in mods {
            self.ue(m.modification_of_pic_nums_idc)?;
            match m.modification_of_pic_nums_idc {
                0 | 1 => self.ue(m.abs_diff_pic_num_minus1)?,
                2 => self.ue(m.long_term_pic_num)?,
                _ => return Err(SynthesizerError::Unsupported),
            }
        }

        self.ue(/* end of list */ 3u32)
    }

    fn weights(
        &mut self,
        luma: (i16, i8),
        chroma: Option<([i16; 2], [i8; 2])>,
        pt: &PredWeightTable,
    ) -> SynthesizerResult<()> {
        let default_luma = 1i16 << pt.luma_log2_weight_denom;
        let default_chroma = 1i16 << pt.chroma_log2_weight_denom;

        let luma_flag = luma != (default_luma, 0);
        self.u(1, luma_flag)?;
        if luma_flag {
            self.se(luma.0)?;
            self.se(luma.1)?;
        }

        if let Some((weight, offset)) = chroma {
            let chroma_flag = weight != [default_chroma; 2] || offset != [0; 2];
            self.u(1, chroma_flag)?;
            if chroma_flag {
                for j in 0..2 {
                    self.se(weight[j])?;
                    self.se(offset[j])?;
                }
            }
        }

        Ok(())
    }

    fn pred_weight_table(&mut self, has_chroma: bool) -> SynthesizerResult<()> {
        let header = self.nalu;
        let pt = &header.pred_weight_table;

        self.ue(pt.luma_log2_weight_denom)?;
        if has_chroma {
            self.ue(pt.chroma_log2_weight_denom)?;
        }

        for i in 0..=usize::from(header.num_ref_idx_l0_active_minus1) {
            let chroma = has_chroma.then_some((pt.chroma_weight_l0[i], pt.chroma_offset_l0[i]));
            self.weights((pt.luma_weight_l0[i], pt.luma_offset_l0[i]), chroma, pt)?;
        }

        if header.slice_type.is_b() {
            for i in 0..=usize::from(header.num_ref_idx_l1_active_minus1) {
                let chroma =
                    has_chroma.then_some((pt.chroma_weight_l1[i], pt.chroma_offset_l1[i]));
                self.weights((pt.luma_weight_l1[i], pt.luma_offset_l1[i]), chroma, pt)?;
            }
        }

        Ok(())
    }

    fn dec_ref_pic_marking(&mut self, idr: bool) -> SynthesizerResult<()> {
        let rpm = &self.nalu.dec_ref_pic_marking;

        if idr {
            self.u(1, rpm.no_output_of_prior_pics_flag)?;
            self.u(1, rpm.long_term_reference_flag)?;
            return Ok(());
        }

        self.u(1, rpm.adaptive_ref_pic_marking_mode_flag)?;
        if !rpm.adaptive_ref_pic_marking_mode_flag {
            return Ok(());
        }

        for op in &rpm.inner {
            self.ue(op.memory_management_control_operation)?;
            match op.memory_management_control_operation {
                1 => self.ue(op.difference_of_pic_nums_minus1)?,
                2 => self.ue(op.long_term_pic_num)?,
                3 => {
                    self.ue(op.difference_of_pic_nums_minus1)?;
                    self.ue(op.long_term_frame_idx)?;
                }
                4 => self.ue(op.max_long_term_frame_idx.to_value_plus1())?,
                5 => (),
                6 => self.ue(op.long_term_frame_idx)?,
                _ => return Err(SynthesizerError::Unsupported),
            }
        }

        self.ue(/* end of operations */ 0u32)
    }

    fn slice_header(&mut self, ref_idc: u8, idr: bool, pps: &Pps) -> SynthesizerResult<()> {
        // H.264 7.3.3
        let header = self.nalu;
        let sps = &pps.sps;
        let slice_type = header.slice_type;

        self.ue(header.first_mb_in_slice)?;
        self.ue(slice_type as u32)?;
        self.ue(header.pic_parameter_set_id)?;

        if sps.separate_colour_plane_flag {
            self.u(2, header.colour_plane_id)?;
        }

        self.u(usize::from(sps.log2_max_frame_num_minus4) + 4, header.frame_num)?;

        if !sps.frame_mbs_only_flag {
            self.u(1, header.field_pic_flag)?;
            if header.field_pic_flag {
                self.u(1, header.bottom_field_flag)?;
            }
        } else if header.field_pic_flag {
            return Err(SynthesizerError::Unsupported);
        }

        if idr {
            self.ue(header.idr_pic_id)?;
        }

        let bottom_present =
            pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag;

        if sps.pic_order_cnt_type == 0 {
            self.u(
                usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                header.pic_order_cnt_lsb,
            )?;
            if bottom_present {
                self.se(header.delta_pic_order_cnt_bottom)?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            self.se(header.delta_pic_order_cnt[0])?;
            if bottom_present {
                self.se(header.delta_pic_order_cnt[1])?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            self.ue(header.redundant_pic_cnt)?;
        }

        if slice_type.is_b() {
            self.u(1, header.direct_spatial_mv_pred_flag)?;
        }

        if slice_type.is_inter() {
            self.u(1, header.num_ref_idx_active_override_flag)?;
            if header.num_ref_idx_active_override_flag {
                self.ue(header.num_ref_idx_l0_active_minus1)?;
                if slice_type.is_b() {
                    self.ue(header.num_ref_idx_l1_active_minus1)?;
                }
            }
        }

        if !slice_type.is_i() && !slice_type.is_si() {
            self.ref_pic_list_modification(
                header.ref_pic_list_modification_flag_l0,
                &header.ref_pic_list_modification_l0,
            )?;
        }

        if slice_type.is_b() {
            self.ref_pic_list_modification(
                header.ref_pic_list_modification_flag_l1,
                &header.ref_pic_list_modification_l1,
            )?;
        }

        if (pps.weighted_pred_flag && (slice_type.is_p() || slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && slice_type.is_b())
        {
            self.pred_weight_table(sps.chroma_array_type() != 0)?;
        }

        if ref_idc != 0 {
            self.dec_ref_pic_marking(idr)?;
        }

        if pps.entropy_coding_mode_flag && !slice_type.is_i() && !slice_type.is_si() {
            self.ue(header.cabac_init_idc)?;
        }

        self.se(header.slice_qp_delta)?;

        if slice_type.is_sp() || slice_type.is_si() {
            if slice_type.is_sp() {
                self.u(1, header.sp_for_switch_flag)?;
            }
            self.se(header.slice_qs_delta)?;
        }

        if pps.deblocking_filter_control_present_flag {
            self.ue(header.disable_deblocking_filter_idc)?;
            if header.disable_deblocking_filter_idc != 1 {
                self.se(header.slice_alpha_c0_offset_div2)?;
                self.se(header.slice_beta_offset_div2)?;
            }
        }

        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            self.u(
                pps.slice_group_change_cycle_bits(),
                header.slice_group_change_cycle,
            )?;
        }

        Ok(())
    }
}

/// Strips the start code written by [`NaluWriter::write_header`].
fn into_nalu(buf: &[u8]) -> SynthesizerResult<Nalu> {
    Ok(Nalu::from_unit(buf.get(4..).unwrap_or_default())?)
}

/// Builds a SPS NAL unit carrying `sps`.
pub fn sps_nalu(sps: &Sps) -> SynthesizerResult<Nalu> {
    let mut buf = Vec::<u8>::new();
    Synthesizer::<'_, Sps, _>::synthesize(3, sps, &mut buf, true)?;
    into_nalu(&buf)
}

/// Builds a PPS NAL unit carrying `pps`.
pub fn pps_nalu(pps: &Pps) -> SynthesizerResult<Nalu> {
    let mut buf = Vec::<u8>::new();
    Synthesizer::<'_, Pps, _>::synthesize(3, pps, &mut buf, true)?;
    into_nalu(&buf)
}

/// Builds a slice NAL unit of type `nalu_type` whose header is `header`.
pub fn slice_nalu(
    ref_idc: u8,
    nalu_type: NaluType,
    header: &SliceHeader,
    pps: &Pps,
) -> SynthesizerResult<Nalu> {
    let mut buf = Vec::<u8>::new();
    Synthesizer::<'_, SliceHeader, _>::synthesize(ref_idc, nalu_type, header, pps, &mut buf, true)?;
    into_nalu(&buf)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::codec::h264::nalu::AnnexBScanner;
    use crate::codec::h264::parser::Parser;
    use crate::codec::h264::parser::PpsBuilder;
    use crate::codec::h264::parser::Profile;
    use crate::codec::h264::parser::SliceHeaderBuilder;
    use crate::codec::h264::parser::SliceType;
    use crate::codec::h264::parser::SpsBuilder;

    #[test]
    fn synthesize_sps() {
        let raw_sps_buf = [0x00, 0x00, 0x00, 0x01, 0x07, 0x00, 0x00, 0x0a, 0xfb, 0x88];

        let mut scanner = AnnexBScanner::new();
        assert!(scanner.push(&raw_sps_buf).is_empty());
        let nalu = scanner.finish().unwrap();
        assert_eq!(nalu.header().type_, NaluType::Sps);

        let mut parser = Parser::default();
        let (sps, _) = parser.parse_sps(&nalu).unwrap();

        let mut buf = Vec::<u8>::new();
        Synthesizer::<'_, Sps, _>::synthesize(0, &sps, &mut buf, false).unwrap();

        assert_eq!(buf, raw_sps_buf);
    }

    #[test]
    fn synthesize_sps_scaling_lists() {
        let mut lists = ScalingLists {
            list_4x4: [[11, 20, 10, 20, 10, 22, 10, 20, 10, 20, 13, 20, 10, 20, 10, 24]; 6],
            list_8x8: [[0; 64]; 6],
        };
        lists.list_8x8[0] = std::array::from_fn(|i| [33, 20, 10, 21][i % 4]);
        lists.list_8x8[1] = std::array::from_fn(|i| (10 + i * 3) as u8);

        let sps = SpsBuilder::new()
            .profile_idc(Profile::High)
            .resolution(64, 64)
            .scaling_lists(lists.clone())
            .build();

        let mut parser = Parser::default();
        let (sps2, _) = parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();

        assert_eq!(sps2.scaling_lists.list_4x4, lists.list_4x4);
        assert_eq!(sps2.scaling_lists.list_8x8[0], lists.list_8x8[0]);
        assert_eq!(sps2.scaling_lists.list_8x8[1], lists.list_8x8[1]);
    }

    #[test]
    fn synthesize_pps() {
        let raw_sps_pps = [
            0x00, 0x00, 0x00, 0x01, 0x07, 0x4d, 0x40, 0x0d, 0xa9, 0x18, 0x28, 0x3e, 0x60, 0x0d,
            0x41, 0x80, 0x41, 0xad, 0xb0, 0xad, 0x7b, 0xdf, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08,
            0xde, 0x09, 0x88,
        ];

        let mut buf = Vec::<u8>::new();
        let mut parser: Parser = Default::default();

        let mut scanner = AnnexBScanner::new();
        let mut nalus = scanner.push(&raw_sps_pps);
        nalus.extend(scanner.finish());
        assert_eq!(nalus.len(), 2);

        for nalu in nalus {
            match nalu.header().type_ {
                NaluType::Sps => {
                    let (sps, _) = parser.parse_sps(&nalu).unwrap();
                    Synthesizer::<'_, Sps, _>::synthesize(0, &sps, &mut buf, false).unwrap();
                }
                NaluType::Pps => {
                    let pps = Rc::clone(parser.parse_pps(&nalu).unwrap());
                    Synthesizer::<'_, Pps, _>::synthesize(0, &pps, &mut buf, false).unwrap();
                }
                _ => panic!(),
            }
        }

        assert_eq!(buf, raw_sps_pps);
    }

    #[test]
    fn synthesize_slice_with_weights() {
        let sps = SpsBuilder::new().resolution(176, 144).max_num_ref_frames(2).build();
        let pps = Rc::new(Pps {
            weighted_pred_flag: true,
            ..(*PpsBuilder::new(Rc::clone(&sps)).build()).clone()
        });

        let mut header = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::P)
            .frame_num(1)
            .pic_order_cnt_lsb(2)
            .num_ref_idx_l0_active(2)
            .build();
        let pt = &mut header.pred_weight_table;
        pt.luma_log2_weight_denom = 5;
        pt.chroma_log2_weight_denom = 2;
        pt.luma_weight_l0[0] = 40;
        pt.luma_offset_l0[0] = -3;
        pt.luma_weight_l0[1] = 32;
        pt.chroma_weight_l0 = [[4; 2]; 32];
        pt.chroma_weight_l0[1] = [6, 2];
        pt.chroma_offset_l0[1] = [1, -1];

        let mut parser = Parser::default();
        parser.parse_sps(&sps_nalu(&sps).unwrap()).unwrap();
        parser.parse_pps(&pps_nalu(&pps).unwrap()).unwrap();

        let nalu = slice_nalu(1, NaluType::Slice, &header, &pps).unwrap();
        let slice = parser.parse_slice_header(nalu).unwrap();

        let parsed = &slice.header.pred_weight_table;
        assert_eq!(parsed.luma_weight_l0[..2], [40, 32]);
        assert_eq!(parsed.luma_offset_l0[..2], [-3, 0]);
        assert_eq!(parsed.chroma_weight_l0[..2], [[4, 4], [6, 2]]);
        assert_eq!(parsed.chroma_offset_l0[1], [1, -1]);
    }

    #[test]
    fn unsupported_settings() {
        let sps = SpsBuilder::new().chroma_format_idc(2).build();
        assert!(matches!(
            sps_nalu(&sps),
            Err(SynthesizerError::Unsupported)
        ));

        let sps = SpsBuilder::new().build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();
        let header = SliceHeaderBuilder::new(&pps).build();
        assert!(matches!(
            slice_nalu(1, NaluType::Sei, &header, &pps),
            Err(SynthesizerError::Unsupported)
        ));
    }
}
