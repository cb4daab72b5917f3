// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use anyhow::Context;
use log::debug;
use thiserror::Error;

use crate::codec::h264::parser::MaxLongTermFrameIdx;
use crate::codec::h264::parser::RefPicMarkingInner;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

// A picture stored in the DPB.
//
// `handle` is the backend surface the picture is decoded into. It is `None`
// for non-existing frames inferred from a gap in `frame_num`, which are never
// decoded nor output.
#[derive(Clone)]
pub struct DpbEntry<T> {
    pub pic: Rc<RefCell<PictureData>>,
    pub handle: Option<T>,
}

/// A frame, complementary field pair or lone field leaving the DPB for
/// display.
#[derive(Clone, Debug)]
pub struct DpbOutput<T> {
    pub handle: T,
    pub timestamp: u64,
    pub pic_order_cnt: i32,
    pub top_field_first: bool,
    /// Whether the picture was coded as a frame.
    pub progressive: bool,
}

impl<T> DpbOutput<T> {
    /// Builds the output record of `pic`, which must be a frame or the first
    /// field of its frame.
    pub fn new(pic: &PictureData, handle: T) -> Self {
        Self {
            handle,
            timestamp: pic.timestamp,
            pic_order_cnt: output_order_cnt(pic),
            top_field_first: pic.top_field_first(),
            progressive: pic.coded_as_frame,
        }
    }
}

/// Order count of the whole frame `pic` belongs to.
fn output_order_cnt(pic: &PictureData) -> i32 {
    match (pic.field, pic.other_field().is_some()) {
        (Field::Frame, _) | (_, false) => pic.pic_order_cnt,
        (_, true) => {
            let [top, bottom] = pic.field_order_cnts();
            std::cmp::min(top, bottom)
        }
    }
}

pub struct Dpb<T> {
    /// Pictures in storage order. Fields of the same frame are stored as two
    /// entries, the first field always preceding the second one.
    entries: Vec<DpbEntry<T>>,
    /// The maximum number of frames that can be stored.
    max_num_pics: usize,
    /// Maximum number of frames that can precede any frame in decoding order
    /// and follow it in output order. Pictures beyond that are released.
    max_num_reorder_frames: usize,
    /// Whether the sequence may contain fields. Frames are split into two
    /// fields when stored so that reference marking only ever deals with
    /// fields, while both fields are output once as a single frame.
    interlaced: bool,
}

#[derive(Debug, Error)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
    #[error("picture is second field but first field doesn't exist")]
    NoFirstField,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MmcoError {
    #[error("no short-term picture with pic_num {0} in the DPB")]
    NoShortTermPic(i32),
    #[error("no long-term picture with long_term_pic_num {0} in the DPB")]
    NoLongTermPic(u32),
    #[error("difference_of_pic_nums_minus1 {0} is out of range")]
    InvalidPicNumDifference(u32),
    #[error("picture cannot be marked as nonexisting for MMCO=3")]
    ExpectedExisting,
}

impl<T: Clone> Dpb<T> {
    fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|h| h.pic.borrow())
    }

    fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, PictureData>> {
        self.entries.iter().map(|h| h.pic.borrow_mut())
    }

    /// Returns the number of entries, counting each field separately.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &Vec<DpbEntry<T>> {
        &self.entries
    }

    /// Sets the DPB's limits in frames.
    pub fn set_limits(&mut self, max_num_pics: usize, max_num_reorder_frames: usize) {
        self.max_num_pics = max_num_pics;
        self.max_num_reorder_frames = max_num_reorder_frames;
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    pub fn max_num_reorder_frames(&self) -> usize {
        self.max_num_reorder_frames
    }

    // Returns the number of reference frames, counting the first field only if
    // dealing with interlaced content.
    pub fn num_ref_frames(&self) -> usize {
        self.pictures()
            .filter(|p| p.is_ref() && !p.is_second_field())
            .count()
    }

    /// Number of reference frames that can be predicted from by a picture with
    /// order count `pic_order_cnt`, i.e. that precede or coincide with it in
    /// output order. Non-existing frames do not count.
    pub fn num_usable_refs(&self, pic_order_cnt: i32) -> usize {
        self.pictures()
            .filter(|p| {
                p.is_ref()
                    && !p.nonexisting
                    && !p.is_second_field()
                    && p.pic_order_cnt <= pic_order_cnt
            })
            .count()
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn set_interlaced(&mut self, interlaced: bool) {
        self.interlaced = interlaced;
    }

    /// Finds the short term reference picture with the lowest `frame_num_wrap`
    /// value.
    pub fn find_short_term_lowest_frame_num_wrap(&self) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|h| matches!(h.pic.borrow().reference(), Reference::ShortTerm))
            .min_by_key(|h| h.pic.borrow().frame_num_wrap)
    }

    pub fn mark_all_as_unused_for_ref(&mut self) {
        for mut picture in self.pictures_mut() {
            picture.set_reference(Reference::None, false);
        }
    }

    /// Removes the pictures that are neither references nor waiting for
    /// output.
    pub fn remove_unused(&mut self) {
        self.entries.retain(|handle| {
            let pic = handle.pic.borrow();
            let discard = !pic.is_ref() && !pic.needed_for_output;

            if discard {
                debug!(
                    "Removing unused picture frame_num {} POC {} {:?}",
                    pic.frame_num, pic.pic_order_cnt, pic.field
                );
            }

            !discard
        });
    }

    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<&DpbEntry<T>> {
        let entry = self.entries.iter().find(|h| {
            let p = h.pic.borrow();
            matches!(p.reference(), Reference::ShortTerm) && p.pic_num == pic_num
        });

        debug!(
            "find_short_term_with_pic_num: {}, found: {}",
            pic_num,
            entry.is_some()
        );

        entry
    }

    pub fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: u32,
    ) -> Option<&DpbEntry<T>> {
        let entry = self.entries.iter().find(|h| {
            let p = h.pic.borrow();
            matches!(p.reference(), Reference::LongTerm) && p.long_term_pic_num == long_term_pic_num
        });

        debug!(
            "find_long_term_with_long_term_pic_num: {}, found: {}",
            long_term_pic_num,
            entry.is_some()
        );

        entry
    }

    fn store_picture(
        &mut self,
        picture: Rc<RefCell<PictureData>>,
        handle: Option<T>,
    ) -> Result<(), StorePictureError> {
        let max_pics = if self.interlaced {
            self.max_num_pics * 2
        } else {
            self.max_num_pics
        };

        if self.entries.len() >= max_pics {
            return Err(StorePictureError::DpbIsFull);
        }

        {
            let mut pic = picture.borrow_mut();

            // C.4.2: non-existing frames are never output.
            pic.needed_for_output = !pic.nonexisting;

            if pic.is_second_field() {
                let first_field = pic.other_field().ok_or(StorePictureError::NoFirstField)?;
                first_field.borrow_mut().set_second_field_to(&picture);
            }

            debug!(
                "Stored picture POC {}, field {:?}, the DPB length is {}",
                pic.pic_order_cnt,
                pic.field,
                self.entries.len() + 1
            );
        }

        self.entries.push(DpbEntry {
            pic: picture,
            handle,
        });

        Ok(())
    }

    /// Adds `pic` and its backend `handle` to the DPB. In interlaced mode
    /// frames are stored as two complementary fields sharing `handle`.
    pub fn add_picture(
        &mut self,
        pic: Rc<RefCell<PictureData>>,
        handle: Option<T>,
    ) -> Result<(), StorePictureError> {
        let split = self.interlaced && matches!(pic.borrow().field, Field::Frame);

        if split {
            let bottom = PictureData::split_frame(&pic);
            self.store_picture(pic, handle.clone())?;
            self.store_picture(bottom, handle)
        } else {
            self.store_picture(pic, handle)
        }
    }

    /// Whether the DPB has an empty frame buffer for a new picture.
    pub fn has_empty_frame_buffer(&self) -> bool {
        if !self.interlaced {
            self.entries.len() < self.max_num_pics
        } else {
            let count = self.pictures().filter(|pic| !pic.is_second_field()).count();

            count < self.max_num_pics
        }
    }

    /// Whether a picture must be output before `to_insert` can be stored, as
    /// described by clauses 1, 4, 5 and 6 of C.4.5.3.
    pub fn needs_bumping(&self, to_insert: &PictureData) -> bool {
        if self.has_empty_frame_buffer() {
            return false;
        }

        if to_insert.nonexisting {
            return true;
        }

        let non_idr_ref = to_insert.is_ref() && matches!(to_insert.is_idr, IsIdr::No);
        if non_idr_ref {
            return true;
        }

        let lowest_poc = match self.find_lowest_poc_for_bumping() {
            Some(handle) => output_order_cnt(&handle.pic.borrow()),
            None => return false,
        };

        !to_insert.is_second_field_of_complementary_ref_pair()
            && to_insert.pic_order_cnt > lowest_poc
    }

    /// Whether `pic` is ready to leave the DPB for display. Only frames and
    /// first fields whose second field has been decoded qualify, so a field
    /// pair is output once.
    fn is_output_candidate(pic: &PictureData) -> bool {
        if !pic.needed_for_output {
            return false;
        }

        match pic.field {
            Field::Frame => true,
            Field::Top | Field::Bottom => !pic.is_second_field() && pic.other_field().is_some(),
        }
    }

    /// Number of frames and complete field pairs waiting for output.
    pub fn num_needed_for_output(&self) -> usize {
        self.pictures()
            .filter(|pic| Self::is_output_candidate(pic))
            .count()
    }

    /// Finds the next picture to output.
    ///
    /// Candidates are visited in storage order and the one with the lowest
    /// order count wins. Once a candidate is found, reaching an IDR picture
    /// ends the search, as everything stored after it belongs to a newer
    /// sequence whose order counts restart.
    fn find_lowest_poc_for_bumping(&self) -> Option<&DpbEntry<T>> {
        let mut found: Option<(&DpbEntry<T>, i32)> = None;

        for entry in &self.entries {
            let pic = entry.pic.borrow();

            if !Self::is_output_candidate(&pic) {
                continue;
            }

            if found.is_some() && matches!(pic.is_idr, IsIdr::Yes { .. }) {
                break;
            }

            let poc = output_order_cnt(&pic);
            let smaller = found.map_or(true, |(_, found_poc)| poc < found_poc);

            if smaller {
                found = Some((entry, poc));
            }
        }

        found.map(|(entry, _)| entry)
    }

    /// Bumps the DPB, returning a picture as per the bumping process described
    /// in C.4.5.3. The picture stays in the DPB while it is a reference.
    fn bump(&mut self) -> Option<DpbOutput<T>> {
        let entry = self.find_lowest_poc_for_bumping()?.clone();
        let mut pic = entry.pic.borrow_mut();

        debug!(
            "Bumping picture frame_num {} POC {} from the DPB",
            pic.frame_num,
            output_order_cnt(&pic)
        );

        pic.needed_for_output = false;
        if let Some(other_field) = pic.other_field() {
            other_field.borrow_mut().needed_for_output = false;
        }

        // Output candidates are never non-existing, so they always have a handle.
        entry.handle.map(|handle| DpbOutput::new(&pic, handle))
    }

    /// Drains the DPB by repeatedly invoking the bumping process, then empties
    /// it.
    pub fn drain(&mut self) -> Vec<DpbOutput<T>> {
        debug!("Draining the DPB.");

        let mut pics = vec![];

        while let Some(pic) = self.bump() {
            pics.push(pic);
        }

        self.clear();

        pics
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB");

        self.entries.clear();
    }

    pub fn short_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|&handle| matches!(handle.pic.borrow().reference(), Reference::ShortTerm))
    }

    pub fn long_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|&handle| matches!(handle.pic.borrow().reference(), Reference::LongTerm))
    }

    /// Derives `FrameNumWrap`, `PicNum` and `LongTermPicNum` of every reference
    /// relative to the current picture (8.2.4.1).
    pub fn update_pic_nums(
        &mut self,
        frame_num: u32,
        max_frame_num: u32,
        current_pic: &PictureData,
    ) {
        for mut pic in self.pictures_mut() {
            if !pic.is_ref() {
                continue;
            }

            if *pic.reference() == Reference::LongTerm {
                pic.long_term_pic_num = if current_pic.field == Field::Frame {
                    pic.long_term_frame_idx
                } else if current_pic.field == pic.field {
                    2 * pic.long_term_frame_idx + 1
                } else {
                    2 * pic.long_term_frame_idx
                };
            } else {
                pic.frame_num_wrap = if pic.frame_num > frame_num {
                    pic.frame_num as i32 - max_frame_num as i32
                } else {
                    pic.frame_num as i32
                };

                pic.pic_num = if current_pic.field == Field::Frame {
                    pic.frame_num_wrap
                } else if pic.field == current_pic.field {
                    2 * pic.frame_num_wrap + 1
                } else {
                    2 * pic.frame_num_wrap
                };
            }
        }
    }

    /// Outputs pictures until `current_pic` can be stored, see C.4.5.3.
    pub fn bump_as_needed(&mut self, current_pic: &PictureData) -> Vec<DpbOutput<T>> {
        let mut pics = vec![];

        while self.needs_bumping(current_pic) {
            match self.bump() {
                Some(pic) => pics.push(pic),
                None => break,
            }
            self.remove_unused();
        }

        pics
    }

    /// Outputs pictures while at least `max_num_reorder_frames` of them are
    /// waiting and no frame buffer is free.
    pub fn bump_reorder_excess(&mut self) -> Vec<DpbOutput<T>> {
        let mut pics = vec![];

        loop {
            let waiting = self.num_needed_for_output();
            if waiting == 0
                || waiting < self.max_num_reorder_frames
                || self.has_empty_frame_buffer()
            {
                break;
            }

            match self.bump() {
                Some(pic) => pics.push(pic),
                None => break,
            }
            self.remove_unused();
        }

        pics
    }

    /// Outputs the first field stored last if its second field never came.
    pub fn bump_unpaired_field(&mut self) -> Option<DpbOutput<T>> {
        let entry = self.entries.last()?.clone();
        let mut pic = entry.pic.borrow_mut();

        let unpaired = pic.needed_for_output
            && !matches!(pic.field, Field::Frame)
            && !pic.is_second_field()
            && pic.other_field().is_none();

        if !unpaired {
            return None;
        }

        debug!(
            "Bumping unpaired {:?} field frame_num {} POC {}",
            pic.field, pic.frame_num, pic.pic_order_cnt
        );

        pic.needed_for_output = false;
        let output = entry.handle.map(|handle| DpbOutput::new(&pic, handle));
        drop(pic);

        self.remove_unused();

        output
    }

    // 8.2.5.3
    pub fn sliding_window_marking(
        &mut self,
        pic: &mut PictureData,
        sps: &Sps,
    ) -> anyhow::Result<()> {
        // The second field of a complementary reference field pair whose
        // first field is short-term joins it without evicting anything.
        let first_field_is_short_term = pic.is_second_field()
            && pic
                .other_field()
                .map_or(false, |f| matches!(f.borrow().reference(), Reference::ShortTerm));

        if first_field_is_short_term {
            pic.set_reference(Reference::ShortTerm, false);
            return Ok(());
        }

        let mut num_ref_pics = self.num_ref_frames();
        let max_num_ref_frames = usize::from(std::cmp::max(1, sps.max_num_ref_frames));

        if num_ref_pics < max_num_ref_frames {
            return Ok(());
        }

        while num_ref_pics >= max_num_ref_frames {
            let to_unmark = self
                .find_short_term_lowest_frame_num_wrap()
                .context("Could not find a ShortTerm picture to unmark in the DPB")?;

            to_unmark
                .pic
                .borrow_mut()
                .set_reference(Reference::None, true);
            num_ref_pics -= 1;
        }

        self.remove_unused();

        Ok(())
    }

    /// picNumX = CurrPicNum - (difference_of_pic_nums_minus1 + 1)
    fn pic_num_x(pic: &PictureData, marking: &RefPicMarkingInner) -> Result<i32, MmcoError> {
        let difference = marking.difference_of_pic_nums_minus1;

        i32::try_from(difference)
            .ok()
            .and_then(|d| pic.pic_num.checked_sub(d))
            .and_then(|n| n.checked_sub(1))
            .ok_or(MmcoError::InvalidPicNumDifference(difference))
    }

    /// Marks a short-term picture as unused for reference.
    pub fn mmco_op_1(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = Self::pic_num_x(pic, marking)?;

        debug!("MMCO op 1 for pic_num_x {}", pic_num_x);
        log::trace!("Dpb state before MMCO=1: {:#?}", self);

        let to_mark = self
            .find_short_term_with_pic_num(pic_num_x)
            .ok_or(MmcoError::NoShortTermPic(pic_num_x))?;

        to_mark
            .pic
            .borrow_mut()
            .set_reference(Reference::None, matches!(pic.field, Field::Frame));

        Ok(())
    }

    /// Marks a long-term picture as unused for reference.
    pub fn mmco_op_2(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        debug!(
            "MMCO op 2 for long_term_pic_num {}",
            marking.long_term_pic_num
        );
        log::trace!("Dpb state before MMCO=2: {:#?}", self);

        let to_mark = self
            .find_long_term_with_long_term_pic_num(marking.long_term_pic_num)
            .ok_or(MmcoError::NoLongTermPic(marking.long_term_pic_num))?;

        to_mark
            .pic
            .borrow_mut()
            .set_reference(Reference::None, matches!(pic.field, Field::Frame));

        Ok(())
    }

    /// Unmarks whatever currently owns `long_term_frame_idx`, unless it is
    /// the other field of `keep`.
    fn release_long_term_frame_idx(
        &self,
        long_term_frame_idx: u32,
        keep: Option<&Rc<RefCell<PictureData>>>,
    ) {
        for entry in &self.entries {
            if keep.map_or(false, |keep| Rc::ptr_eq(keep, &entry.pic)) {
                continue;
            }

            let mut picture = entry.pic.borrow_mut();

            let owns_idx = matches!(picture.reference(), Reference::LongTerm)
                && picture.long_term_frame_idx == long_term_frame_idx;

            if !owns_idx {
                continue;
            }

            // A long-term frame or field pair loses both fields, a lone
            // long-term field only itself.
            let whole_frame = matches!(picture.field, Field::Frame)
                || picture.other_field().map_or(false, |f| {
                    let f = f.borrow();
                    matches!(f.reference(), Reference::LongTerm)
                        && f.long_term_frame_idx == long_term_frame_idx
                });

            picture.set_reference(Reference::None, whole_frame);
            break;
        }
    }

    /// Turns a short-term picture into a long-term one.
    pub fn mmco_op_3(
        &mut self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = Self::pic_num_x(pic, marking)?;
        let long_term_frame_idx = marking.long_term_frame_idx;

        debug!(
            "MMCO op 3 for pic_num_x {}, long_term_frame_idx {}",
            pic_num_x, long_term_frame_idx
        );
        log::trace!("Dpb state before MMCO=3: {:#?}", self);

        let target = self
            .find_short_term_with_pic_num(pic_num_x)
            .map(|entry| Rc::clone(&entry.pic))
            .ok_or(MmcoError::NoShortTermPic(pic_num_x))?;

        if target.borrow().nonexisting {
            return Err(MmcoError::ExpectedExisting);
        }

        let target_other_field = target.borrow().other_field();
        self.release_long_term_frame_idx(long_term_frame_idx, target_other_field.as_ref());

        let mut target = target.borrow_mut();
        target.set_reference(Reference::LongTerm, matches!(pic.field, Field::Frame));
        target.long_term_frame_idx = long_term_frame_idx;

        if let Some(other_field) = target.other_field() {
            let mut other_field = other_field.borrow_mut();
            if matches!(other_field.reference(), Reference::LongTerm) {
                other_field.long_term_frame_idx = long_term_frame_idx;
            }
        }

        Ok(())
    }

    /// Returns the new `max_long_term_frame_idx`.
    pub fn mmco_op_4(&mut self, marking: &RefPicMarkingInner) -> MaxLongTermFrameIdx {
        debug!(
            "MMCO op 4, max_long_term_frame_idx: {:?}",
            marking.max_long_term_frame_idx
        );
        log::trace!("Dpb state before MMCO=4: {:#?}", self);

        for mut dpb_pic in self
            .pictures_mut()
            .filter(|pic| matches!(pic.reference(), Reference::LongTerm))
            .filter(|pic| marking.max_long_term_frame_idx < pic.long_term_frame_idx)
        {
            dpb_pic.set_reference(Reference::None, false);
        }

        marking.max_long_term_frame_idx
    }

    /// Returns the new `max_long_term_frame_idx`.
    pub fn mmco_op_5(&mut self, pic: &mut PictureData) -> MaxLongTermFrameIdx {
        debug!("MMCO op 5, marking all pictures in the DPB as unused for reference");
        log::trace!("Dpb state before MMCO=5: {:#?}", self);

        self.mark_all_as_unused_for_ref();

        pic.has_mmco_5 = true;

        // The picture is inferred to have had frame_num 0 from now on, and its
        // order counts become relative to its own (8.2.1).
        pic.frame_num = 0;

        match pic.field {
            Field::Top => {
                pic.top_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Frame => {
                pic.top_field_order_cnt -= pic.pic_order_cnt;
                pic.bottom_field_order_cnt -= pic.pic_order_cnt;
                pic.pic_order_cnt =
                    std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
            }
        }

        MaxLongTermFrameIdx::NoLongTermFrameIndices
    }

    /// Marks the current picture as long-term.
    pub fn mmco_op_6(&mut self, pic: &mut PictureData, marking: &RefPicMarkingInner) {
        let long_term_frame_idx = marking.long_term_frame_idx;

        debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);
        log::trace!("Dpb state before MMCO=6: {:#?}", self);

        let first_field = pic.other_field();
        self.release_long_term_frame_idx(long_term_frame_idx, first_field.as_ref());

        let is_frame = matches!(pic.field, Field::Frame);
        let first_field_is_long_term = first_field
            .as_ref()
            .map_or(false, |f| matches!(f.borrow().reference(), Reference::LongTerm));

        pic.set_reference(Reference::LongTerm, is_frame || first_field_is_long_term);
        pic.long_term_frame_idx = long_term_frame_idx;

        if let (Some(first_field), true) = (first_field, first_field_is_long_term) {
            first_field.borrow_mut().long_term_frame_idx = long_term_frame_idx;
        }
    }
}

impl<T> Default for Dpb<T> {
    fn default() -> Self {
        // See https://github.com/rust-lang/rust/issues/26925 on why this can't
        // be derived.
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
            max_num_reorder_frames: Default::default(),
            interlaced: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|h| &h.pic)
            .enumerate()
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .field("max_num_reorder_frames", &self.max_num_reorder_frames)
            .field("interlaced", &self.interlaced)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::SpsBuilder;

    fn frame(frame_num: u32, poc: i32, reference: Reference) -> Rc<RefCell<PictureData>> {
        let mut pic = PictureData {
            frame_num,
            pic_num: frame_num as i32,
            pic_order_cnt: poc,
            top_field_order_cnt: poc,
            bottom_field_order_cnt: poc,
            nal_ref_idc: if reference == Reference::None { 0 } else { 1 },
            coded_as_frame: true,
            timestamp: 1000 + poc as u64,
            ..Default::default()
        };
        pic.set_reference(reference, false);
        Rc::new(RefCell::new(pic))
    }

    fn field(
        field: Field,
        frame_num: u32,
        poc: i32,
        reference: Reference,
    ) -> Rc<RefCell<PictureData>> {
        let pic = frame(frame_num, poc, reference);
        {
            let mut pic = pic.borrow_mut();
            pic.field = field;
            pic.coded_as_frame = false;
            pic.pic_num = 2 * frame_num as i32 + 1;
        }
        pic
    }

    fn dpb(max_num_pics: usize, max_num_reorder_frames: usize) -> Dpb<u32> {
        let mut dpb = Dpb::default();
        dpb.set_limits(max_num_pics, max_num_reorder_frames);
        dpb
    }

    fn handles(outputs: &[DpbOutput<u32>]) -> Vec<u32> {
        outputs.iter().map(|o| o.handle).collect()
    }

    /// Runs the marking and storage steps of a reference frame.
    fn decode_ref_frame(dpb: &mut Dpb<u32>, sps: &Sps, frame_num: u32, handle: u32) {
        let pic = frame(frame_num, 2 * frame_num as i32, Reference::ShortTerm);
        dpb.update_pic_nums(frame_num, sps.max_frame_num(), &pic.borrow());
        dpb.sliding_window_marking(&mut pic.borrow_mut(), sps)
            .unwrap();
        dpb.remove_unused();
        dpb.bump_as_needed(&pic.borrow());
        dpb.add_picture(pic, Some(handle)).unwrap();
    }

    #[test]
    fn sliding_window_bounds_references() {
        let sps = SpsBuilder::new().max_num_ref_frames(2).build();
        let mut dpb = dpb(4, 0);

        for frame_num in 0..8 {
            decode_ref_frame(&mut dpb, &sps, frame_num, frame_num);
            dpb.bump_reorder_excess();
            assert!(dpb.num_ref_frames() <= 2);
        }

        let refs: Vec<_> = dpb
            .short_term_refs_iter()
            .map(|e| e.pic.borrow().frame_num)
            .collect();
        assert_eq!(refs, vec![6, 7]);
    }

    #[test]
    fn sliding_window_across_frame_num_wrap() {
        let sps = SpsBuilder::new()
            .log2_max_frame_num_minus4(0)
            .max_num_ref_frames(2)
            .build();
        let mut dpb = dpb(4, 0);

        for (i, frame_num) in [14, 15, 0, 1].into_iter().enumerate() {
            decode_ref_frame(&mut dpb, &sps, frame_num, i as u32);
            dpb.bump_reorder_excess();
        }

        // 14 and 15 are older than 0 once FrameNumWrap is taken into account.
        let refs: Vec<_> = dpb
            .short_term_refs_iter()
            .map(|e| e.pic.borrow().frame_num)
            .collect();
        assert_eq!(refs, vec![0, 1]);
    }

    #[test]
    fn mmco_1_unmarks_short_term() {
        let mut dpb = dpb(4, 4);
        dpb.add_picture(frame(0, 0, Reference::ShortTerm), Some(0))
            .unwrap();
        dpb.add_picture(frame(1, 2, Reference::ShortTerm), Some(1))
            .unwrap();

        let cur = frame(2, 4, Reference::ShortTerm);
        dpb.update_pic_nums(2, 16, &cur.borrow());

        // picNumX = 2 - (1 + 1) = 0
        let marking = RefPicMarkingInner {
            memory_management_control_operation: 1,
            difference_of_pic_nums_minus1: 1,
            ..Default::default()
        };
        dpb.mmco_op_1(&cur.borrow(), &marking).unwrap();

        assert_eq!(dpb.num_ref_frames(), 1);
        assert!(!dpb.entries()[0].pic.borrow().is_ref());
        assert!(dpb.entries()[1].pic.borrow().is_ref());
    }

    #[test]
    fn mmco_1_missing_pic_num() {
        let mut dpb = dpb(4, 4);
        dpb.add_picture(frame(0, 0, Reference::ShortTerm), Some(0))
            .unwrap();

        let cur = frame(1, 2, Reference::ShortTerm);
        dpb.update_pic_nums(1, 16, &cur.borrow());

        let marking = RefPicMarkingInner {
            memory_management_control_operation: 1,
            difference_of_pic_nums_minus1: 4,
            ..Default::default()
        };
        assert_eq!(
            dpb.mmco_op_1(&cur.borrow(), &marking),
            Err(MmcoError::NoShortTermPic(-4))
        );

        // Nothing else was touched.
        assert_eq!(dpb.num_ref_frames(), 1);
    }

    #[test]
    fn mmco_1_out_of_range_difference() {
        let mut dpb = dpb(4, 4);
        let cur = frame(1, 2, Reference::ShortTerm);

        let marking = RefPicMarkingInner {
            memory_management_control_operation: 1,
            difference_of_pic_nums_minus1: u32::MAX,
            ..Default::default()
        };
        assert_eq!(
            dpb.mmco_op_1(&cur.borrow(), &marking),
            Err(MmcoError::InvalidPicNumDifference(u32::MAX))
        );
    }

    #[test]
    fn mmco_3_and_6_long_term() {
        let mut dpb = dpb(4, 4);
        dpb.add_picture(frame(0, 0, Reference::ShortTerm), Some(0))
            .unwrap();
        dpb.add_picture(frame(1, 2, Reference::ShortTerm), Some(1))
            .unwrap();

        let cur = frame(2, 4, Reference::ShortTerm);
        dpb.update_pic_nums(2, 16, &cur.borrow());

        // Frame 0 becomes long-term index 0.
        let to_long = RefPicMarkingInner {
            memory_management_control_operation: 3,
            difference_of_pic_nums_minus1: 1,
            long_term_frame_idx: 0,
            ..Default::default()
        };
        dpb.mmco_op_3(&cur.borrow(), &to_long).unwrap();

        let long_terms: Vec<_> = dpb
            .long_term_refs_iter()
            .map(|e| e.pic.borrow().frame_num)
            .collect();
        assert_eq!(long_terms, vec![0]);

        // Frame 1 takes the same index and evicts frame 0.
        let to_long = RefPicMarkingInner {
            memory_management_control_operation: 3,
            difference_of_pic_nums_minus1: 0,
            long_term_frame_idx: 0,
            ..Default::default()
        };
        dpb.mmco_op_3(&cur.borrow(), &to_long).unwrap();

        let long_terms: Vec<_> = dpb
            .long_term_refs_iter()
            .map(|e| e.pic.borrow().frame_num)
            .collect();
        assert_eq!(long_terms, vec![1]);
        assert!(!dpb.entries()[0].pic.borrow().is_ref());

        // The current picture then claims index 0 for itself.
        let current_long = RefPicMarkingInner {
            memory_management_control_operation: 6,
            long_term_frame_idx: 0,
            ..Default::default()
        };
        dpb.mmco_op_6(&mut cur.borrow_mut(), &current_long);

        assert_eq!(dpb.long_term_refs_iter().count(), 0);
        assert_eq!(*cur.borrow().reference(), Reference::LongTerm);
        assert_eq!(cur.borrow().long_term_frame_idx, 0);
    }

    #[test]
    fn mmco_2_and_4() {
        let mut dpb = dpb(4, 4);
        for (frame_num, idx) in [(0, 0), (1, 1), (2, 2)] {
            let pic = frame(frame_num, 2 * frame_num as i32, Reference::LongTerm);
            pic.borrow_mut().long_term_frame_idx = idx;
            dpb.add_picture(pic, Some(frame_num)).unwrap();
        }

        let cur = frame(3, 6, Reference::ShortTerm);
        dpb.update_pic_nums(3, 16, &cur.borrow());

        let remove = RefPicMarkingInner {
            memory_management_control_operation: 2,
            long_term_pic_num: 0,
            ..Default::default()
        };
        dpb.mmco_op_2(&cur.borrow(), &remove).unwrap();
        assert_eq!(
            dpb.mmco_op_2(&cur.borrow(), &remove),
            Err(MmcoError::NoLongTermPic(0))
        );

        let cap = RefPicMarkingInner {
            memory_management_control_operation: 4,
            max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(1),
            ..Default::default()
        };
        assert_eq!(dpb.mmco_op_4(&cap), MaxLongTermFrameIdx::Idx(1));

        let long_terms: Vec<_> = dpb
            .long_term_refs_iter()
            .map(|e| e.pic.borrow().long_term_frame_idx)
            .collect();
        assert_eq!(long_terms, vec![1]);

        let none = RefPicMarkingInner {
            memory_management_control_operation: 4,
            max_long_term_frame_idx: MaxLongTermFrameIdx::NoLongTermFrameIndices,
            ..Default::default()
        };
        dpb.mmco_op_4(&none);
        assert_eq!(dpb.num_ref_frames(), 0);
    }

    #[test]
    fn mmco_5_empties_references() {
        let mut dpb = dpb(4, 4);
        dpb.add_picture(frame(0, 0, Reference::ShortTerm), Some(0))
            .unwrap();
        let long_term = frame(1, 2, Reference::LongTerm);
        dpb.add_picture(long_term, Some(1)).unwrap();

        let cur = frame(2, 8, Reference::ShortTerm);
        {
            let mut cur = cur.borrow_mut();
            cur.top_field_order_cnt = 8;
            cur.bottom_field_order_cnt = 9;
        }

        let max_long_term_frame_idx = dpb.mmco_op_5(&mut cur.borrow_mut());

        assert_eq!(
            max_long_term_frame_idx,
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
        assert_eq!(dpb.num_ref_frames(), 0);

        let cur = cur.borrow();
        assert!(cur.has_mmco_5);
        assert_eq!(cur.frame_num, 0);
        assert_eq!(cur.top_field_order_cnt, 0);
        assert_eq!(cur.bottom_field_order_cnt, 1);
        assert_eq!(cur.pic_order_cnt, 0);

        // The pictures are still waiting for output.
        assert_eq!(dpb.num_needed_for_output(), 2);
    }

    #[test]
    fn output_in_poc_order() {
        let mut dpb = dpb(8, 8);

        dpb.add_picture(frame(0, 0, Reference::ShortTerm), Some(0))
            .unwrap();
        dpb.add_picture(frame(1, 6, Reference::ShortTerm), Some(1))
            .unwrap();
        dpb.add_picture(frame(2, 2, Reference::None), Some(2))
            .unwrap();
        dpb.add_picture(frame(2, 4, Reference::None), Some(3))
            .unwrap();

        let output = dpb.drain();
        assert_eq!(handles(&output), vec![0, 2, 3, 1]);
        assert_eq!(output[1].timestamp, 1002);
        assert!(output.iter().all(|o| o.progressive));
        assert!(dpb.is_empty());
    }

    #[test]
    fn idr_ends_output_search() {
        let mut dpb = dpb(8, 8);

        dpb.add_picture(frame(3, 8, Reference::ShortTerm), Some(0))
            .unwrap();
        let idr = frame(0, 0, Reference::ShortTerm);
        idr.borrow_mut().is_idr = IsIdr::Yes { idr_pic_id: 1 };
        dpb.add_picture(idr, Some(1)).unwrap();

        assert_eq!(handles(&dpb.drain()), vec![0, 1]);
    }

    #[test]
    fn release_reorder_excess() {
        let mut dpb = dpb(3, 1);

        dpb.add_picture(frame(0, 0, Reference::ShortTerm), Some(0))
            .unwrap();
        assert!(dpb.bump_reorder_excess().is_empty());

        dpb.add_picture(frame(1, 4, Reference::ShortTerm), Some(1))
            .unwrap();
        assert!(dpb.bump_reorder_excess().is_empty());

        dpb.add_picture(frame(1, 2, Reference::None), Some(2))
            .unwrap();
        assert_eq!(handles(&dpb.bump_reorder_excess()), vec![0, 2]);

        // The non-reference picture is gone, the references stay.
        assert_eq!(dpb.len(), 2);
        assert_eq!(dpb.num_needed_for_output(), 1);
    }

    #[test]
    fn no_reorder_waits_for_a_full_dpb() {
        let mut dpb = dpb(4, 0);

        for (handle, poc) in [(0, 4), (1, 0), (2, 2)] {
            dpb.add_picture(frame(0, poc, Reference::None), Some(handle))
                .unwrap();
            assert!(dpb.bump_reorder_excess().is_empty());
        }
        assert_eq!(dpb.len(), 3);

        dpb.add_picture(frame(0, 6, Reference::None), Some(3))
            .unwrap();
        assert_eq!(handles(&dpb.bump_reorder_excess()), vec![1]);
        assert_eq!(dpb.len(), 3);
        assert!(dpb.has_empty_frame_buffer());
    }

    #[test]
    fn bump_when_full() {
        let mut dpb = dpb(2, 2);

        dpb.add_picture(frame(0, 0, Reference::None), Some(0))
            .unwrap();
        dpb.add_picture(frame(0, 2, Reference::None), Some(1))
            .unwrap();
        assert!(!dpb.has_empty_frame_buffer());
        assert!(matches!(
            dpb.add_picture(frame(0, 4, Reference::None), Some(2)),
            Err(StorePictureError::DpbIsFull)
        ));

        let next = frame(1, 6, Reference::ShortTerm);
        let output = dpb.bump_as_needed(&next.borrow());
        assert_eq!(handles(&output), vec![0]);
        assert!(dpb.has_empty_frame_buffer());
    }

    #[test]
    fn field_pair_is_output_once() {
        let mut dpb = dpb(4, 4);
        dpb.set_interlaced(true);

        let first = field(Field::Bottom, 0, 3, Reference::ShortTerm);
        dpb.add_picture(Rc::clone(&first), Some(7)).unwrap();
        assert_eq!(dpb.num_needed_for_output(), 0);

        let second = field(Field::Top, 0, 4, Reference::ShortTerm);
        second.borrow_mut().set_first_field_to(&first);
        dpb.add_picture(second, Some(7)).unwrap();

        assert_eq!(dpb.num_ref_frames(), 1);
        assert_eq!(dpb.num_needed_for_output(), 1);

        let output = dpb.drain();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].handle, 7);
        assert_eq!(output[0].pic_order_cnt, 3);
        assert!(!output[0].top_field_first);
        assert!(!output[0].progressive);
    }

    #[test]
    fn interlaced_frames_are_split() {
        let mut dpb = dpb(4, 4);
        dpb.set_interlaced(true);

        let pic = frame(0, 0, Reference::ShortTerm);
        pic.borrow_mut().bottom_field_order_cnt = 1;
        dpb.add_picture(pic, Some(0)).unwrap();

        assert_eq!(dpb.len(), 2);
        assert_eq!(dpb.num_ref_frames(), 1);
        assert!(dpb.has_empty_frame_buffer());

        let output = dpb.drain();
        assert_eq!(output.len(), 1);
        assert!(output[0].progressive);
        assert!(output[0].top_field_first);
    }

    #[test]
    fn unpaired_field() {
        let mut dpb = dpb(4, 4);
        dpb.set_interlaced(true);

        dpb.add_picture(field(Field::Top, 0, 0, Reference::None), Some(3))
            .unwrap();

        let output = dpb.bump_unpaired_field().unwrap();
        assert_eq!(output.handle, 3);
        assert!(output.top_field_first);
        assert!(dpb.is_empty());
        assert!(dpb.bump_unpaired_field().is_none());
    }

    #[test]
    fn usable_references() {
        let mut dpb = dpb(4, 4);
        dpb.add_picture(frame(0, 0, Reference::ShortTerm), Some(0))
            .unwrap();
        dpb.add_picture(frame(1, 8, Reference::ShortTerm), Some(1))
            .unwrap();
        dpb.add_picture(frame(2, 4, Reference::None), Some(2))
            .unwrap();
        let gap = Rc::new(RefCell::new(PictureData::new_non_existing(3, 0)));
        dpb.add_picture(gap, None).unwrap();

        assert_eq!(dpb.num_usable_refs(6), 1);
        assert_eq!(dpb.num_usable_refs(8), 2);
    }
}
