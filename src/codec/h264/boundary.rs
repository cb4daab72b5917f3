// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Detection of the first VCL NAL unit of a primary coded picture, as per
//! clause 7.4.1.2.4.

use log::debug;

use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;

/// The slice header fields that tell two pictures apart.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PictureId {
    frame_num: u16,
    pic_parameter_set_id: u8,
    field_pic_flag: bool,
    bottom_field_flag: bool,
    is_reference: bool,
    pic_order_cnt_type: u8,
    pic_order_cnt_lsb: u16,
    delta_pic_order_cnt_bottom: i32,
    delta_pic_order_cnt: [i32; 2],
    idr_pic_id: Option<u16>,
}

impl PictureId {
    fn new(slice: &Slice, sps: &Sps) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = slice.nalu.header();

        Self {
            frame_num: hdr.frame_num,
            pic_parameter_set_id: hdr.pic_parameter_set_id,
            field_pic_flag: hdr.field_pic_flag,
            bottom_field_flag: hdr.bottom_field_flag,
            is_reference: nalu_hdr.ref_idc != 0,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: hdr.delta_pic_order_cnt,
            idr_pic_id: nalu_hdr.idr_pic_flag.then_some(hdr.idr_pic_id),
        }
    }

    /// Returns the name of the first field that differs between `self` and
    /// `other`, if any.
    fn first_difference(&self, other: &Self) -> Option<&'static str> {
        if self.frame_num != other.frame_num {
            return Some("frame_num");
        }
        if self.pic_parameter_set_id != other.pic_parameter_set_id {
            return Some("pic_parameter_set_id");
        }
        if self.field_pic_flag != other.field_pic_flag {
            return Some("field_pic_flag");
        }
        if self.field_pic_flag && self.bottom_field_flag != other.bottom_field_flag {
            return Some("bottom_field_flag");
        }
        if self.is_reference != other.is_reference {
            return Some("nal_ref_idc");
        }

        if self.pic_order_cnt_type == 0 && other.pic_order_cnt_type == 0 {
            if self.pic_order_cnt_lsb != other.pic_order_cnt_lsb {
                return Some("pic_order_cnt_lsb");
            }
            if self.delta_pic_order_cnt_bottom != other.delta_pic_order_cnt_bottom {
                return Some("delta_pic_order_cnt_bottom");
            }
        }

        if self.pic_order_cnt_type == 1
            && other.pic_order_cnt_type == 1
            && self.delta_pic_order_cnt != other.delta_pic_order_cnt
        {
            return Some("delta_pic_order_cnt");
        }

        match (self.idr_pic_id, other.idr_pic_id) {
            (Some(a), Some(b)) if a != b => Some("idr_pic_id"),
            (Some(_), None) | (None, Some(_)) => Some("IdrPicFlag"),
            _ => None,
        }
    }
}

/// Splits the sequence of NAL units into pictures.
///
/// Feed it every NAL unit in decoding order: slices through
/// [`BoundaryDetector::first_slice_of_picture`] and everything else through
/// [`BoundaryDetector::non_vcl`].
#[derive(Debug, Default)]
pub struct BoundaryDetector {
    /// The last VCL NAL unit of the picture being accumulated.
    last: Option<PictureId>,
}

impl BoundaryDetector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether a picture is currently being accumulated.
    pub fn picture_open(&self) -> bool {
        self.last.is_some()
    }

    /// Whether `slice` starts a new picture. The picture accumulated so far,
    /// if any, is complete when this returns `true`.
    pub fn first_slice_of_picture(&mut self, slice: &Slice, sps: &Sps) -> bool {
        let current = PictureId::new(slice, sps);

        let first = match &self.last {
            None => true,
            Some(last) => match current.first_difference(last) {
                Some(field) => {
                    debug!("New picture: {} differs from the previous slice", field);
                    true
                }
                None => false,
            },
        };

        self.last = Some(current);

        first
    }

    /// Processes a non-VCL NAL unit of type `type_`. Returns whether it ends
    /// the picture being accumulated.
    pub fn non_vcl(&mut self, type_: NaluType) -> bool {
        let ends_picture = matches!(
            type_,
            NaluType::Sei
                | NaluType::Sps
                | NaluType::Pps
                | NaluType::AuDelimiter
                | NaluType::SeqEnd
                | NaluType::StreamEnd
                | NaluType::PrefixUnit
                | NaluType::SubsetSps
                | NaluType::DepthSps
                | NaluType::Reserved17
                | NaluType::Reserved18
        );

        if ends_picture && self.last.take().is_some() {
            debug!("New picture: {:?} follows a VCL NAL unit", type_);
            return true;
        }

        false
    }

    /// Forgets the picture being accumulated.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
