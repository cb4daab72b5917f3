// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use log::debug;
use log::warn;

use crate::codec::h264::parser::RefPicMarking;
use crate::codec::h264::parser::Slice;
use crate::codec::h264::parser::Sps;

/// The part of a frame a picture covers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity. A frame has no opposite and is
    /// returned unchanged.
    pub fn opposite(&self) -> Self {
        match *self {
            Field::Frame => Field::Frame,
            Field::Top => Field::Bottom,
            Field::Bottom => Field::Top,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// Position of a field within its frame.
///
/// The second field keeps its first field alive, while the first field only
/// observes the second one so the pair never forms a reference cycle.
#[derive(Clone, Debug, Default)]
pub enum FieldRank {
    /// A frame, or a field whose complementary field has not been seen yet.
    #[default]
    Single,
    /// First field in decoding order, pointing to the second one.
    First(Weak<RefCell<PictureData>>),
    /// Second field in decoding order, pointing to the first one.
    Second(Rc<RefCell<PictureData>>),
}

/// Data associated with an h.264 picture or field. Most fields are extracted
/// from the slice header and completed by the picture order count and
/// reference marking processes.
#[derive(Clone, Debug, Default)]
pub struct PictureData {
    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,

    pub pic_num: i32,
    pub long_term_pic_num: u32,
    pub frame_num: u32,
    pub frame_num_offset: u32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: u32,

    pub pic_parameter_set_id: u8,
    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    pub(crate) reference: Reference,
    pub field: Field,
    /// Whether the picture was coded as a frame, even if it has later been
    /// split into two fields for reference marking.
    pub coded_as_frame: bool,

    pub ref_pic_marking: RefPicMarking,

    pub(crate) field_rank: FieldRank,

    /// Inferred picture inserted for a gap in `frame_num`. Never output.
    pub nonexisting: bool,
    pub needed_for_output: bool,
    pub has_mmco_5: bool,

    /// Presentation timestamp of the buffer the first slice came from, 0 if
    /// unknown.
    pub timestamp: u64,
}

impl PictureData {
    /// Instantiates the current picture from its first slice.
    ///
    /// The picture order count is left for the POC calculator to fill in.
    pub fn new_from_slice(slice: &Slice, sps: &Sps, timestamp: u64) -> Self {
        let hdr = &slice.header;
        let nalu_hdr = slice.nalu.header();

        let is_idr = if nalu_hdr.idr_pic_flag {
            IsIdr::Yes {
                idr_pic_id: hdr.idr_pic_id,
            }
        } else {
            IsIdr::No
        };

        let field = hdr.field();
        let frame_num = u32::from(hdr.frame_num);

        let reference = if nalu_hdr.ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        // CurrPicNum, see 7.4.3.
        let pic_num = if hdr.field_pic_flag {
            2 * frame_num as i32 + 1
        } else {
            frame_num as i32
        };

        let mut pic_order_cnt_lsb = 0;
        let mut delta_pic_order_cnt_bottom = 0;
        let mut delta_pic_order_cnt0 = 0;
        let mut delta_pic_order_cnt1 = 0;

        match sps.pic_order_cnt_type {
            0 => {
                pic_order_cnt_lsb = i32::from(hdr.pic_order_cnt_lsb);
                delta_pic_order_cnt_bottom = hdr.delta_pic_order_cnt_bottom;
            }
            1 => {
                delta_pic_order_cnt0 = hdr.delta_pic_order_cnt[0];
                delta_pic_order_cnt1 = hdr.delta_pic_order_cnt[1];
            }
            _ => (),
        }

        Self {
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0,
            delta_pic_order_cnt1,
            pic_num,
            frame_num,
            pic_parameter_set_id: hdr.pic_parameter_set_id,
            nal_ref_idc: nalu_hdr.ref_idc,
            is_idr,
            reference,
            field,
            coded_as_frame: matches!(field, Field::Frame),
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            timestamp,
            ..Default::default()
        }
    }

    /// Creates a "non-existing" frame for a gap in `frame_num`, see 8.2.5.2.
    pub fn new_non_existing(frame_num: u32, timestamp: u64) -> Self {
        PictureData {
            frame_num,
            nonexisting: true,
            nal_ref_idc: 1,
            field: Field::Frame,
            coded_as_frame: true,
            pic_num: frame_num as i32,
            reference: Reference::ShortTerm,
            timestamp,
            ..Default::default()
        }
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    /// Whether the current picture is the second field of a complementary ref pair.
    pub fn is_second_field_of_complementary_ref_pair(&self) -> bool {
        self.is_ref()
            && self.is_second_field()
            && self
                .other_field()
                .map_or(false, |f| f.borrow().is_ref())
    }

    /// Returns the other field of this picture, if it exists.
    pub fn other_field(&self) -> Option<Rc<RefCell<PictureData>>> {
        match &self.field_rank {
            FieldRank::Single => None,
            FieldRank::First(second_field) => second_field.upgrade(),
            FieldRank::Second(first_field) => Some(Rc::clone(first_field)),
        }
    }

    /// Whether this picture is the second field of a pair.
    pub fn is_second_field(&self) -> bool {
        matches!(self.field_rank, FieldRank::Second(..))
    }

    pub fn field_rank(&self) -> &FieldRank {
        &self.field_rank
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Sets the reference status of this picture, and of its other field if
    /// `apply_to_other_field` is set.
    pub fn set_reference(&mut self, reference: Reference, apply_to_other_field: bool) {
        debug!(
            "Set reference of {:?} (POC {}, frame_num {}) to {:?}",
            self.field, self.pic_order_cnt, self.frame_num, reference
        );

        self.reference = reference;

        if apply_to_other_field {
            if let Some(other_field) = self.other_field() {
                match other_field.try_borrow_mut() {
                    Ok(mut other_field) => other_field.reference = reference,
                    Err(_) => warn!(
                        "Other field of {:?} (frame_num {}) is borrowed, not updating it",
                        self.field, self.frame_num
                    ),
                }
            }
        }
    }

    /// Makes this picture the second field of `first_field`.
    pub fn set_first_field_to(&mut self, first_field: &Rc<RefCell<Self>>) {
        self.field_rank = FieldRank::Second(Rc::clone(first_field));
    }

    /// Records `second_field` as the second field of this picture.
    pub fn set_second_field_to(&mut self, second_field: &Rc<RefCell<Self>>) {
        self.field_rank = FieldRank::First(Rc::downgrade(second_field));
    }

    /// Forgets about the other field.
    pub fn clear_field_rank(&mut self) {
        self.field_rank = FieldRank::Single;
    }

    /// Field order counts of the whole frame this picture belongs to, as
    /// `[top, bottom]`.
    pub fn field_order_cnts(&self) -> [i32; 2] {
        let other = match self.other_field() {
            Some(other) => other,
            None => return [self.top_field_order_cnt, self.bottom_field_order_cnt],
        };
        let other = other.borrow();

        match self.field {
            Field::Top => [self.top_field_order_cnt, other.bottom_field_order_cnt],
            Field::Bottom => [other.top_field_order_cnt, self.bottom_field_order_cnt],
            Field::Frame => [self.top_field_order_cnt, self.bottom_field_order_cnt],
        }
    }

    /// Whether the top field is displayed first, i.e. has the smaller order
    /// count. Field pairs are compared field by field, lone fields report their
    /// own parity.
    pub fn top_field_first(&self) -> bool {
        match (self.field, self.other_field().is_some()) {
            (Field::Frame, _) | (_, true) => {
                let [top, bottom] = self.field_order_cnts();
                top <= bottom
            }
            (field, false) => matches!(field, Field::Top),
        }
    }

    /// Splits a frame into two complementary fields, which makes reference
    /// marking uniform for interlaced streams. `pic` becomes the top field and
    /// the returned picture is its bottom field.
    pub fn split_frame(pic: &Rc<RefCell<Self>>) -> Rc<RefCell<Self>> {
        let mut top = pic.borrow_mut();

        let mut bottom = top.clone();
        bottom.field = Field::Bottom;
        bottom.pic_order_cnt = top.bottom_field_order_cnt;
        bottom.field_rank = FieldRank::Second(Rc::clone(pic));

        top.field = Field::Top;
        top.pic_order_cnt = top.top_field_order_cnt;

        debug!(
            "Split frame frame_num {} into fields with POC {} and {}",
            top.frame_num, top.pic_order_cnt, bottom.pic_order_cnt
        );

        let bottom = Rc::new(RefCell::new(bottom));
        top.set_second_field_to(&bottom);

        bottom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(field: Field, top: i32, bottom: i32) -> Rc<RefCell<PictureData>> {
        Rc::new(RefCell::new(PictureData {
            field,
            top_field_order_cnt: top,
            bottom_field_order_cnt: bottom,
            pic_order_cnt: if field == Field::Bottom { bottom } else { top },
            reference: Reference::ShortTerm,
            ..Default::default()
        }))
    }

    #[test]
    fn opposite_field() {
        assert_eq!(Field::Top.opposite(), Field::Bottom);
        assert_eq!(Field::Bottom.opposite(), Field::Top);
        assert_eq!(Field::Frame.opposite(), Field::Frame);
    }

    #[test]
    fn pair_fields() {
        let first = field(Field::Bottom, 0, 4);
        let second = field(Field::Top, 6, 0);

        second.borrow_mut().set_first_field_to(&first);
        first.borrow_mut().set_second_field_to(&second);

        assert!(second.borrow().is_second_field());
        assert!(!first.borrow().is_second_field());
        assert!(Rc::ptr_eq(&second.borrow().other_field().unwrap(), &first));
        assert!(Rc::ptr_eq(&first.borrow().other_field().unwrap(), &second));
        assert!(second.borrow().is_second_field_of_complementary_ref_pair());

        // The bottom field came first in output order.
        assert_eq!(first.borrow().field_order_cnts(), [6, 4]);
        assert!(!first.borrow().top_field_first());

        // Only the second field keeps the pair alive.
        drop(second);
        assert!(first.borrow().other_field().is_none());
    }

    #[test]
    fn reference_applies_to_other_field() {
        let first = field(Field::Top, 2, 0);
        let second = field(Field::Bottom, 0, 3);
        second.borrow_mut().set_first_field_to(&first);
        first.borrow_mut().set_second_field_to(&second);

        first
            .borrow_mut()
            .set_reference(Reference::LongTerm, true);
        assert_eq!(*second.borrow().reference(), Reference::LongTerm);

        second.borrow_mut().set_reference(Reference::None, false);
        assert_eq!(*first.borrow().reference(), Reference::LongTerm);
        assert!(!second.borrow().is_second_field_of_complementary_ref_pair());
    }

    #[test]
    fn borrowed_other_field_keeps_its_reference() {
        let first = field(Field::Top, 2, 0);
        let second = field(Field::Bottom, 0, 3);
        second.borrow_mut().set_first_field_to(&first);
        first.borrow_mut().set_second_field_to(&second);

        {
            let _held = second.borrow();
            first.borrow_mut().set_reference(Reference::None, true);
        }

        assert_eq!(*first.borrow().reference(), Reference::None);
        assert_eq!(*second.borrow().reference(), Reference::ShortTerm);
    }

    #[test]
    fn split_frame_into_fields() {
        let frame = field(Field::Frame, 8, 9);
        frame.borrow_mut().pic_order_cnt = 8;

        let bottom = PictureData::split_frame(&frame);

        let top = frame.borrow();
        let bottom_ref = bottom.borrow();
        assert_eq!(top.field, Field::Top);
        assert_eq!(top.pic_order_cnt, 8);
        assert_eq!(bottom_ref.field, Field::Bottom);
        assert_eq!(bottom_ref.pic_order_cnt, 9);
        assert!(bottom_ref.is_second_field());
        assert_eq!(top.coded_as_frame, bottom_ref.coded_as_frame);
        assert!(top.top_field_first());
    }

    #[test]
    fn non_existing_frame() {
        let pic = PictureData::new_non_existing(5, 0);
        assert!(pic.nonexisting);
        assert!(pic.is_ref());
        assert_eq!(pic.pic_num, 5);
        assert_eq!(pic.field, Field::Frame);
    }
}
