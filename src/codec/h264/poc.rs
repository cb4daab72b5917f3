// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count derivation, clause 8.2.1.

use anyhow::anyhow;
use log::debug;

use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;

/// Variables kept from the previous reference picture in decoding order.
#[derive(Clone, Debug, Default)]
pub struct PrevReferencePicInfo {
    pub frame_num: u32,
    pub has_mmco_5: bool,
    pub top_field_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub field: Field,
}

/// Variables kept from the previous picture in decoding order.
#[derive(Clone, Debug, Default)]
pub struct PrevPicInfo {
    pub frame_num: u32,
    pub frame_num_offset: u32,
    pub has_mmco_5: bool,
}

/// Running state of the picture order count process across pictures.
#[derive(Clone, Debug, Default)]
pub struct PocState {
    pub prev_ref_pic_info: PrevReferencePicInfo,
    pub prev_pic_info: PrevPicInfo,
}

impl PocState {
    /// Forgets everything about the previous pictures.
    pub fn reset(&mut self) {
        *self = Default::default();
    }

    /// Computes `TopFieldOrderCnt`, `BottomFieldOrderCnt` and `PicOrderCnt`
    /// for `pic`, using the algorithm selected by `sps`.
    pub fn compute(&mut self, pic: &mut PictureData, sps: &Sps) -> anyhow::Result<()> {
        pic.pic_order_cnt_type = sps.pic_order_cnt_type;

        match sps.pic_order_cnt_type {
            0 => self.compute_type_0(pic, sps),
            1 => self.compute_type_1(pic, sps)?,
            2 => self.compute_type_2(pic, sps),
            other => return Err(anyhow!("Invalid pic_order_cnt_type: {}", other)),
        }

        pic.pic_order_cnt = match pic.field {
            Field::Frame => std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt),
            Field::Top => pic.top_field_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt,
        };

        debug!(
            "POC {} (top {}, bottom {}) for frame_num {} {:?}",
            pic.pic_order_cnt,
            pic.top_field_order_cnt,
            pic.bottom_field_order_cnt,
            pic.frame_num,
            pic.field
        );

        Ok(())
    }

    // 8.2.1.1
    fn compute_type_0(&self, pic: &mut PictureData, sps: &Sps) {
        let prev = &self.prev_ref_pic_info;

        let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) =
            if matches!(pic.is_idr, IsIdr::Yes { .. }) {
                (0, 0)
            } else if prev.has_mmco_5 {
                if matches!(prev.field, Field::Bottom) {
                    (0, 0)
                } else {
                    (0, prev.top_field_order_cnt)
                }
            } else {
                (prev.pic_order_cnt_msb, prev.pic_order_cnt_lsb)
            };

        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb() as i32;
        let lsb = pic.pic_order_cnt_lsb;

        pic.pic_order_cnt_msb = if lsb < prev_pic_order_cnt_lsb
            && prev_pic_order_cnt_lsb - lsb >= max_pic_order_cnt_lsb / 2
        {
            prev_pic_order_cnt_msb + max_pic_order_cnt_lsb
        } else if lsb > prev_pic_order_cnt_lsb
            && lsb - prev_pic_order_cnt_lsb > max_pic_order_cnt_lsb / 2
        {
            prev_pic_order_cnt_msb - max_pic_order_cnt_lsb
        } else {
            prev_pic_order_cnt_msb
        };

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = pic.pic_order_cnt_msb + lsb;
                pic.bottom_field_order_cnt =
                    pic.top_field_order_cnt + pic.delta_pic_order_cnt_bottom;
            }
            Field::Top => pic.top_field_order_cnt = pic.pic_order_cnt_msb + lsb,
            Field::Bottom => pic.bottom_field_order_cnt = pic.pic_order_cnt_msb + lsb,
        }
    }

    /// FrameNumOffset, common to types 1 and 2.
    fn frame_num_offset(&mut self, pic: &PictureData, sps: &Sps) -> u32 {
        if self.prev_pic_info.has_mmco_5 {
            self.prev_pic_info.frame_num_offset = 0;
        }

        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if self.prev_pic_info.frame_num > pic.frame_num {
            self.prev_pic_info.frame_num_offset + sps.max_frame_num()
        } else {
            self.prev_pic_info.frame_num_offset
        }
    }

    // 8.2.1.2
    fn compute_type_1(&mut self, pic: &mut PictureData, sps: &Sps) -> anyhow::Result<()> {
        pic.frame_num_offset = self.frame_num_offset(pic, sps);

        let num_ref_frames_in_cycle = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);

        let mut abs_frame_num = if num_ref_frames_in_cycle != 0 {
            (pic.frame_num_offset + pic.frame_num) as i32
        } else {
            0
        };

        if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected_pic_order_cnt = 0;

        if abs_frame_num > 0 {
            let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / num_ref_frames_in_cycle;
            let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % num_ref_frames_in_cycle;

            if sps.offset_for_ref_frame.len() < num_ref_frames_in_cycle as usize {
                return Err(anyhow!("Truncated offset_for_ref_frame table"));
            }

            expected_pic_order_cnt =
                pic_order_cnt_cycle_cnt * sps.expected_delta_per_pic_order_cnt_cycle;
            expected_pic_order_cnt += sps
                .offset_for_ref_frame
                .iter()
                .take(frame_num_in_pic_order_cnt_cycle as usize + 1)
                .sum::<i32>();
        }

        if pic.nal_ref_idc == 0 {
            expected_pic_order_cnt += sps.offset_for_non_ref_pic;
        }

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
                pic.bottom_field_order_cnt = pic.top_field_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt1;
            }
            Field::Top => {
                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = expected_pic_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt0;
            }
        }

        Ok(())
    }

    // 8.2.1.3
    fn compute_type_2(&mut self, pic: &mut PictureData, sps: &Sps) {
        pic.frame_num_offset = self.frame_num_offset(pic, sps);

        let temp_pic_order_cnt = if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if pic.nal_ref_idc == 0 {
            2 * (pic.frame_num_offset + pic.frame_num) as i32 - 1
        } else {
            2 * (pic.frame_num_offset + pic.frame_num) as i32
        };

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = temp_pic_order_cnt;
                pic.bottom_field_order_cnt = temp_pic_order_cnt;
            }
            Field::Top => pic.top_field_order_cnt = temp_pic_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt = temp_pic_order_cnt,
        }
    }

    /// Remembers the variables of a reference picture once its marking is
    /// done.
    pub fn fill_prev_ref_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_ref_pic_info;

        prev.has_mmco_5 = pic.has_mmco_5;
        prev.top_field_order_cnt = pic.top_field_order_cnt;
        prev.pic_order_cnt_msb = pic.pic_order_cnt_msb;
        prev.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        prev.field = pic.field;
        prev.frame_num = pic.frame_num;
    }

    /// Remembers the variables of any picture once it is done.
    pub fn fill_prev_info(&mut self, pic: &PictureData) {
        let prev = &mut self.prev_pic_info;

        prev.frame_num = pic.frame_num;
        prev.has_mmco_5 = pic.has_mmco_5;
        prev.frame_num_offset = pic.frame_num_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::SpsBuilder;
    use crate::codec::h264::picture::Reference;

    fn picture(frame_num: u32, nal_ref_idc: u8, idr: bool) -> PictureData {
        let mut pic = PictureData {
            frame_num,
            nal_ref_idc,
            is_idr: if idr {
                IsIdr::Yes { idr_pic_id: 0 }
            } else {
                IsIdr::No
            },
            ..Default::default()
        };

        if nal_ref_idc != 0 {
            pic.set_reference(Reference::ShortTerm, false);
        }

        pic
    }

    /// Runs `pic` through the POC process and records it as the previous
    /// picture, returning `(top, bottom, poc)`.
    fn decode(state: &mut PocState, sps: &Sps, mut pic: PictureData) -> (i32, i32, i32) {
        state.compute(&mut pic, sps).unwrap();

        if pic.is_ref() {
            state.fill_prev_ref_info(&pic);
        }
        state.fill_prev_info(&pic);

        (
            pic.top_field_order_cnt,
            pic.bottom_field_order_cnt,
            pic.pic_order_cnt,
        )
    }

    #[test]
    fn type_0_is_monotonic_for_reference_pictures() {
        let sps = SpsBuilder::new()
            .log2_max_frame_num_minus4(0)
            .log2_max_pic_order_cnt_lsb_minus4(0)
            .build();
        let mut state = PocState::default();

        let mut last = None;
        // Three wraps of the 16 values wide lsb.
        for i in 0..24u32 {
            let mut pic = picture(i % 16, 1, i == 0);
            pic.pic_order_cnt_lsb = ((i * 2) % 16) as i32;

            let (top, bottom, poc) = decode(&mut state, &sps, pic);
            assert_eq!(top, (i * 2) as i32);
            assert_eq!(bottom, top);
            assert_eq!(poc, top);

            if let Some(last) = last {
                assert!(top > last, "POC went from {} to {}", last, top);
            }
            last = Some(top);
        }
    }

    #[test]
    fn type_0_negative_wrap() {
        let sps = SpsBuilder::new()
            .log2_max_pic_order_cnt_lsb_minus4(0)
            .build();
        let mut state = PocState::default();

        let mut idr = picture(0, 1, true);
        idr.pic_order_cnt_lsb = 2;
        assert_eq!(decode(&mut state, &sps, idr).2, 2);

        // A B-frame displayed before the IDR: lsb 14 is closer to -2 than to 14.
        let mut b = picture(1, 0, false);
        b.pic_order_cnt_lsb = 14;
        assert_eq!(decode(&mut state, &sps, b).2, -2);
    }

    #[test]
    fn type_0_fields() {
        let sps = SpsBuilder::new().build();
        let mut state = PocState::default();

        let mut top = picture(0, 1, true);
        top.field = Field::Top;
        top.pic_order_cnt_lsb = 0;
        assert_eq!(decode(&mut state, &sps, top).2, 0);

        let mut bottom = picture(0, 1, false);
        bottom.field = Field::Bottom;
        bottom.pic_order_cnt_lsb = 1;
        let (_, bottom_cnt, poc) = decode(&mut state, &sps, bottom);
        assert_eq!(bottom_cnt, 1);
        assert_eq!(poc, 1);
    }

    #[test]
    fn type_0_after_mmco_5() {
        let sps = SpsBuilder::new()
            .log2_max_pic_order_cnt_lsb_minus4(0)
            .build();
        let mut state = PocState::default();

        let mut idr = picture(0, 1, true);
        idr.pic_order_cnt_lsb = 0;
        decode(&mut state, &sps, idr);

        let mut p = picture(1, 1, false);
        p.pic_order_cnt_lsb = 6;
        state.compute(&mut p, &sps).unwrap();
        assert_eq!(p.pic_order_cnt, 6);

        // What the DPB does when executing the operation.
        p.has_mmco_5 = true;
        p.frame_num = 0;
        p.top_field_order_cnt -= p.pic_order_cnt;
        p.bottom_field_order_cnt -= p.pic_order_cnt;
        p.pic_order_cnt = 0;
        state.fill_prev_ref_info(&p);
        state.fill_prev_info(&p);

        // The baseline is now msb = 0, lsb = 0, so an lsb of 12 wraps
        // backwards. Against the old lsb of 6 it would not.
        let mut next = picture(1, 1, false);
        next.pic_order_cnt_lsb = 12;
        state.compute(&mut next, &sps).unwrap();
        assert_eq!(next.pic_order_cnt_msb, -16);
        assert_eq!(next.pic_order_cnt, -4);

        let mut after = picture(1, 1, false);
        after.pic_order_cnt_lsb = 2;
        state.compute(&mut after, &sps).unwrap();
        assert_eq!(after.pic_order_cnt_msb, 0);
        assert_eq!(after.pic_order_cnt, 2);
    }

    #[test]
    fn type_1_cycle() {
        let sps = SpsBuilder::new()
            .log2_max_frame_num_minus4(0)
            .pic_order_cnt_cycle(-1, 1, &[1, 3])
            .build();
        let mut state = PocState::default();

        assert_eq!(decode(&mut state, &sps, picture(0, 1, true)), (0, 1, 0));
        assert_eq!(decode(&mut state, &sps, picture(1, 1, false)), (1, 2, 1));
        assert_eq!(decode(&mut state, &sps, picture(2, 1, false)), (4, 5, 4));
        assert_eq!(decode(&mut state, &sps, picture(3, 1, false)), (5, 6, 5));
        // Non-reference: one cycle entry back, plus offset_for_non_ref_pic.
        assert_eq!(decode(&mut state, &sps, picture(4, 0, false)), (4, 5, 4));
    }

    #[test]
    fn type_1_deltas() {
        let sps = SpsBuilder::new().pic_order_cnt_cycle(0, 0, &[2]).build();
        let mut state = PocState::default();

        decode(&mut state, &sps, picture(0, 1, true));

        let mut pic = picture(1, 1, false);
        pic.delta_pic_order_cnt0 = -1;
        pic.delta_pic_order_cnt1 = 3;
        assert_eq!(decode(&mut state, &sps, pic), (1, 4, 1));
    }

    #[test]
    fn type_2() {
        let sps = SpsBuilder::new()
            .log2_max_frame_num_minus4(0)
            .pic_order_cnt_type(2)
            .build();
        let mut state = PocState::default();

        assert_eq!(decode(&mut state, &sps, picture(0, 1, true)).2, 0);
        assert_eq!(decode(&mut state, &sps, picture(1, 1, false)).2, 2);
        assert_eq!(decode(&mut state, &sps, picture(2, 0, false)).2, 3);

        for frame_num in 2..16 {
            decode(&mut state, &sps, picture(frame_num, 1, false));
        }

        // frame_num wrapped, FrameNumOffset grows by MaxFrameNum.
        assert_eq!(decode(&mut state, &sps, picture(0, 1, false)).2, 32);
    }

    #[test]
    fn type_2_after_mmco_5() {
        let sps = SpsBuilder::new()
            .log2_max_frame_num_minus4(0)
            .pic_order_cnt_type(2)
            .build();
        let mut state = PocState::default();

        decode(&mut state, &sps, picture(0, 1, true));
        for frame_num in 1..16 {
            decode(&mut state, &sps, picture(frame_num, 1, false));
        }

        let mut pic = picture(0, 1, false);
        state.compute(&mut pic, &sps).unwrap();
        assert_eq!(pic.frame_num_offset, 16);

        pic.has_mmco_5 = true;
        state.fill_prev_ref_info(&pic);
        state.fill_prev_info(&pic);

        // prevFrameNumOffset is reset, so this is not 34.
        assert_eq!(decode(&mut state, &sps, picture(1, 1, false)).2, 2);
    }

    #[test]
    fn invalid_type() {
        let sps = SpsBuilder::new().pic_order_cnt_type(3).build();
        let mut pic = picture(0, 1, true);
        assert!(PocState::default().compute(&mut pic, &sps).is_err());
    }
}
