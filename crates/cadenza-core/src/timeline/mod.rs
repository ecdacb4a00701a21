//! Clip timeline: an interval-tree map from content handles to timeline
//! windows.
//!
//! A clip places a content source at `[position, position + length)` on the
//! timeline, reading the content from `start_offset` at the clip's left edge.
//! Content identity (the [`SourceId`] of the [`SharedSource`]) is the clip
//! key: at most one clip per content handle. Overlap between clips is NOT
//! checked here - overlapping windows simply sum on read; timelines that need
//! exclusivity validate it themselves (see `AsyncClipTimeline` in
//! cadenza-stream).

mod interval_tree;

use crate::buffer::{SampleBuffer, SampleContainer, SampleContainerMut};
use crate::error::{Error, Result};
use crate::source::{AudioSource, ChannelMask, PositionableSource, SharedSource, SourceId};
use interval_tree::IntervalTree;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Owned snapshot of one clip. Stale once the clip is removed or its content
/// swapped; [`ClipTimeline::contains`] tells whether the content still has a
/// clip.
#[derive(Debug, Clone)]
pub struct Clip {
    pub content: SharedSource,
    pub position: u64,
    pub start_offset: u64,
    pub length: u64,
}

impl Clip {
    pub fn content_id(&self) -> SourceId {
        self.content.id()
    }

    /// One past the last timeline position covered by this clip.
    pub fn end(&self) -> u64 {
        self.position + self.length
    }
}

#[derive(Debug)]
struct ClipRecord {
    content: SharedSource,
    position: u64,
    start_offset: u64,
    length: u64,
}

impl ClipRecord {
    fn end(&self) -> u64 {
        self.position + self.length
    }

    fn snapshot(&self) -> Clip {
        Clip {
            content: self.content.clone(),
            position: self.position,
            start_offset: self.start_offset,
            length: self.length,
        }
    }
}

#[derive(Default)]
struct TimelineState {
    tree: IntervalTree,
    clips: HashMap<SourceId, ClipRecord>,
    /// End-point multiset; the greatest key is the effective length.
    end_points: BTreeMap<u64, usize>,
    open: bool,
    block_size: usize,
    sample_rate: f64,
    position: u64,
    scratch: SampleBuffer,
    query_hits: Vec<SourceId>,
}

impl TimelineState {
    fn add_end_point(&mut self, end: u64) {
        *self.end_points.entry(end).or_insert(0) += 1;
    }

    fn remove_end_point(&mut self, end: u64) {
        if let Some(count) = self.end_points.get_mut(&end) {
            *count -= 1;
            if *count == 0 {
                self.end_points.remove(&end);
            }
        }
    }

    fn effective_length(&self) -> u64 {
        self.end_points.keys().next_back().copied().unwrap_or(0)
    }
}

/// Interval-tree clip map, readable as a [`PositionableSource`].
pub struct ClipTimeline {
    id: SourceId,
    state: Mutex<TimelineState>,
}

impl Default for ClipTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipTimeline {
    pub fn new() -> Self {
        Self {
            id: SourceId::generate(),
            state: Mutex::new(TimelineState::default()),
        }
    }

    /// Type-preserving shared handle: the caller keeps the `Arc` for clip
    /// edits while the handle streams through the source seam.
    pub fn shared_handle(this: &std::sync::Arc<Self>) -> SharedSource {
        SharedSource::with_id(this.id, this.clone())
    }

    /// Map `content` onto `[position, position + length)`, reading the
    /// content from `start_offset`. Fails if the content already has a clip.
    /// Overlap with existing clips is not checked.
    pub fn insert_clip(
        &self,
        content: SharedSource,
        position: u64,
        start_offset: u64,
        length: u64,
    ) -> Result<()> {
        if length == 0 {
            return Err(Error::EmptyClip);
        }
        let mut st = self.state.lock();
        let id = content.id();
        if st.clips.contains_key(&id) {
            return Err(Error::DuplicateContent);
        }
        if st.open {
            let (block_size, sample_rate) = (st.block_size, st.sample_rate);
            content.lock().open(block_size, sample_rate)?;
        }
        st.tree.insert(position, position + length - 1, id);
        st.add_end_point(position + length);
        st.clips.insert(
            id,
            ClipRecord {
                content,
                position,
                start_offset,
                length,
            },
        );
        Ok(())
    }

    /// Change the content-local start offset. O(1); the tree key is untouched.
    pub fn set_clip_start_offset(&self, content: &SharedSource, start_offset: u64) -> Result<()> {
        let mut st = self.state.lock();
        let record = st
            .clips
            .get_mut(&content.id())
            .ok_or(Error::ClipNotFound)?;
        record.start_offset = start_offset;
        Ok(())
    }

    /// Move/resize the clip window. The position is part of the tree key, so
    /// this erases and reinserts.
    pub fn set_clip_range(&self, content: &SharedSource, position: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Err(Error::EmptyClip);
        }
        let mut st = self.state.lock();
        let id = content.id();
        let (old_pos, old_len) = {
            let record = st.clips.get(&id).ok_or(Error::ClipNotFound)?;
            (record.position, record.length)
        };
        st.tree.remove(old_pos, old_pos + old_len - 1, id);
        st.remove_end_point(old_pos + old_len);
        st.tree.insert(position, position + length - 1, id);
        st.add_end_point(position + length);
        let record = st.clips.get_mut(&id).expect("record vanished under lock");
        record.position = position;
        record.length = length;
        Ok(())
    }

    /// Swap the clip's content in place. No-op success when `new_content` is
    /// the same instance; fails when it already has its own clip. The old
    /// content's snapshots become stale.
    pub fn set_clip_content(&self, content: &SharedSource, new_content: SharedSource) -> Result<()> {
        let mut st = self.state.lock();
        let old_id = content.id();
        let new_id = new_content.id();
        if old_id == new_id {
            return if st.clips.contains_key(&old_id) {
                Ok(())
            } else {
                Err(Error::ClipNotFound)
            };
        }
        if st.clips.contains_key(&new_id) {
            return Err(Error::DuplicateContent);
        }
        if !st.clips.contains_key(&old_id) {
            return Err(Error::ClipNotFound);
        }
        if st.open {
            let (block_size, sample_rate) = (st.block_size, st.sample_rate);
            new_content.lock().open(block_size, sample_rate)?;
        }
        let old = st.clips.remove(&old_id).expect("record vanished under lock");
        st.tree.remove(old.position, old.end() - 1, old_id);
        st.tree.insert(old.position, old.end() - 1, new_id);
        st.clips.insert(
            new_id,
            ClipRecord {
                content: new_content,
                position: old.position,
                start_offset: old.start_offset,
                length: old.length,
            },
        );
        if st.open {
            old.content.lock().close();
        }
        Ok(())
    }

    pub fn find_clip(&self, content: &SharedSource) -> Option<Clip> {
        self.state
            .lock()
            .clips
            .get(&content.id())
            .map(ClipRecord::snapshot)
    }

    /// Every clip whose window covers `position`, in window order.
    pub fn clips_at(&self, position: u64) -> Vec<Clip> {
        self.clips_overlapping(position, 1)
    }

    /// Every clip overlapping `[start, start + len)`, in window order.
    pub fn clips_overlapping(&self, start: u64, len: u64) -> Vec<Clip> {
        if len == 0 {
            return Vec::new();
        }
        let mut st = self.state.lock();
        let st = &mut *st;
        st.query_hits.clear();
        st.tree.query(start, start + len - 1, &mut st.query_hits);
        st.query_hits
            .iter()
            .filter_map(|id| st.clips.get(id).map(ClipRecord::snapshot))
            .collect()
    }

    pub fn remove_clip(&self, content: &SharedSource) -> Result<()> {
        let mut st = self.state.lock();
        let id = content.id();
        let record = st.clips.remove(&id).ok_or(Error::ClipNotFound)?;
        st.tree.remove(record.position, record.end() - 1, id);
        st.remove_end_point(record.end());
        if st.open {
            record.content.lock().close();
        }
        Ok(())
    }

    pub fn remove_all_clips(&self) {
        let mut st = self.state.lock();
        if st.open {
            for record in st.clips.values() {
                record.content.lock().close();
            }
        }
        st.clips.clear();
        st.tree.clear();
        st.end_points.clear();
    }

    pub fn contains(&self, content: &SharedSource) -> bool {
        self.state.lock().clips.contains_key(&content.id())
    }

    pub fn clip_count(&self) -> usize {
        self.state.lock().clips.len()
    }

    /// Greatest clip end point, or 0 when empty.
    pub fn effective_length(&self) -> u64 {
        self.state.lock().effective_length()
    }

    fn open_inner(&self, block_size: usize, sample_rate: f64) -> Result<()> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        let mut st = self.state.lock();
        if st.open {
            for record in st.clips.values() {
                record.content.lock().close();
            }
            st.open = false;
        }
        let mut opened: Vec<SourceId> = Vec::new();
        for (id, record) in &st.clips {
            if let Err(err) = record.content.lock().open(block_size, sample_rate) {
                for prev in &opened {
                    st.clips[prev].content.lock().close();
                }
                return Err(err);
            }
            opened.push(*id);
        }
        st.open = true;
        st.block_size = block_size;
        st.sample_rate = sample_rate;
        debug!(block_size, sample_rate, clips = st.clips.len(), "timeline open");
        Ok(())
    }

    fn close_inner(&self) {
        let mut st = self.state.lock();
        if !st.open {
            return;
        }
        for record in st.clips.values() {
            record.content.lock().close();
        }
        st.open = false;
        st.block_size = 0;
        st.sample_rate = 0.0;
    }

    fn read_inner(
        &self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        debug_assert!(st.open, "read on closed timeline");
        if !st.open || len == 0 {
            return 0;
        }

        let pos = st.position;
        let total = st.effective_length();
        let produced = (len as u64).min(total.saturating_sub(pos)) as usize;
        if produced == 0 {
            st.position = pos;
            return 0;
        }

        // Positions outside any clip stay silent.
        dest.clear_range(dest_start, produced);

        if st.scratch.channel_count() != dest.channel_count()
            || st.scratch.sample_count() < produced
        {
            let shape = produced.max(st.block_size);
            st.scratch.resize(dest.channel_count(), shape);
        }

        let TimelineState {
            tree,
            clips,
            scratch,
            query_hits,
            ..
        } = &mut *st;

        query_hits.clear();
        tree.query(pos, pos + produced as u64 - 1, query_hits);

        for id in query_hits.iter() {
            let Some(record) = clips.get(id) else { continue };

            let from = pos.max(record.position);
            let to = (pos + produced as u64).min(record.end());
            if from >= to {
                continue;
            }
            let n = (to - from) as usize;
            let local = from - record.position + record.start_offset;

            let got = {
                let mut content = record.content.lock();
                content.set_next_read_position(local);
                content.read(scratch, 0, n, ChannelMask::NONE)
            };

            let offset = dest_start + (from - pos) as usize;
            for ch in 0..dest.channel_count() {
                if silent.contains(ch) {
                    continue;
                }
                // Overlapping clips sum.
                dest.add_sample_range(ch, offset, scratch, ch, 0, got, 1.0);
            }
        }

        st.position = pos + produced as u64;
        produced
    }
}

macro_rules! delegate_timeline_source {
    ($ty:ty) => {
        impl AudioSource for $ty {
            fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
                ClipTimeline::open_inner(self, block_size, sample_rate)
            }

            fn close(&mut self) {
                ClipTimeline::close_inner(self);
            }

            fn is_open(&self) -> bool {
                self.state.lock().open
            }

            fn block_size(&self) -> usize {
                self.state.lock().block_size
            }

            fn sample_rate(&self) -> f64 {
                self.state.lock().sample_rate
            }

            fn read(
                &mut self,
                dest: &mut dyn SampleContainerMut,
                dest_start: usize,
                len: usize,
                silent: ChannelMask,
            ) -> usize {
                ClipTimeline::read_inner(self, dest, dest_start, len, silent)
            }
        }

        impl PositionableSource for $ty {
            fn length(&self) -> u64 {
                ClipTimeline::effective_length(self)
            }

            fn next_read_position(&self) -> u64 {
                self.state.lock().position
            }

            fn set_next_read_position(&mut self, pos: u64) {
                self.state.lock().position = pos;
            }
        }
    };
}

delegate_timeline_source!(ClipTimeline);
delegate_timeline_source!(&ClipTimeline);
delegate_timeline_source!(std::sync::Arc<ClipTimeline>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn ramp_content(samples: usize, base: f32) -> SharedSource {
        let mut material = SampleBuffer::new(1, samples);
        for pos in 0..samples {
            material.set_sample(0, pos, base + pos as f32);
        }
        SharedSource::new(MemorySource::new(material))
    }

    #[test]
    fn test_effective_length_tracks_max_end_point() {
        let timeline = ClipTimeline::new();
        assert_eq!(timeline.effective_length(), 0);

        let a = ramp_content(100, 0.0);
        let b = ramp_content(100, 0.0);
        let c = ramp_content(100, 0.0);

        timeline.insert_clip(a.clone(), 0, 0, 100).unwrap();
        timeline.insert_clip(b.clone(), 500, 0, 100).unwrap();
        timeline.insert_clip(c.clone(), 200, 0, 50).unwrap();
        assert_eq!(timeline.effective_length(), 600);

        timeline.remove_clip(&b).unwrap();
        assert_eq!(timeline.effective_length(), 250);

        timeline.set_clip_range(&c, 300, 100).unwrap();
        assert_eq!(timeline.effective_length(), 400);

        timeline.remove_all_clips();
        assert_eq!(timeline.effective_length(), 0);
    }

    #[test]
    fn test_duplicate_content_rejected_unchanged() {
        let timeline = ClipTimeline::new();
        let a = ramp_content(64, 0.0);

        timeline.insert_clip(a.clone(), 0, 0, 64).unwrap();
        let err = timeline.insert_clip(a.clone(), 200, 0, 64).unwrap_err();
        assert!(matches!(err, Error::DuplicateContent));

        assert_eq!(timeline.clip_count(), 1);
        assert_eq!(timeline.find_clip(&a).unwrap().position, 0);
        assert_eq!(timeline.effective_length(), 64);
    }

    #[test]
    fn test_zero_length_clip_rejected() {
        let timeline = ClipTimeline::new();
        let a = ramp_content(64, 0.0);
        assert!(matches!(
            timeline.insert_clip(a, 0, 0, 0),
            Err(Error::EmptyClip)
        ));
    }

    #[test]
    fn test_read_translates_to_clip_local_range() {
        let mut timeline = ClipTimeline::new();
        // Content samples are 10, 11, 12, ... placed at timeline 100 with
        // start offset 10: timeline position 100 plays content sample 10.
        let a = ramp_content(64, 0.0);
        timeline.insert_clip(a, 100, 10, 40).unwrap();
        timeline.open(32, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(1, 32);
        timeline.set_next_read_position(96);
        let got = timeline.read(&mut dest, 0, 32, ChannelMask::NONE);
        assert_eq!(got, 32);

        // 96..100 silent, 100.. plays content from sample 10.
        for pos in 0..4 {
            assert_eq!(dest.sample_at(0, pos), 0.0);
        }
        for pos in 4..32 {
            assert_eq!(dest.sample_at(0, pos), 10.0 + (pos - 4) as f32);
        }
    }

    #[test]
    fn test_overlapping_clips_sum() {
        let mut timeline = ClipTimeline::new();
        let a = ramp_content(32, 1.0); // constant-ish ramp starting at 1
        let b = ramp_content(32, 1.0);
        timeline.insert_clip(a, 0, 0, 32).unwrap();
        timeline.insert_clip(b, 16, 0, 32).unwrap();
        timeline.open(64, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(1, 48);
        let got = timeline.read(&mut dest, 0, 48, ChannelMask::NONE);
        assert_eq!(got, 48);

        // Non-overlap region: just clip a.
        assert_eq!(dest.sample_at(0, 0), 1.0);
        // Overlap [16, 32): a at sample 16 (=17.0) + b at sample 0 (=1.0).
        assert_eq!(dest.sample_at(0, 16), 18.0);
        // Tail [32, 48): only b.
        assert_eq!(dest.sample_at(0, 40), 1.0 + 24.0);
    }

    #[test]
    fn test_positional_lookup() {
        let timeline = ClipTimeline::new();
        let a = ramp_content(64, 0.0);
        let b = ramp_content(64, 0.0);
        timeline.insert_clip(a.clone(), 0, 0, 50).unwrap();
        timeline.insert_clip(b.clone(), 40, 0, 50).unwrap();

        assert_eq!(timeline.clips_at(10).len(), 1);
        assert_eq!(timeline.clips_at(45).len(), 2);
        assert_eq!(timeline.clips_at(95).len(), 0);

        let hits = timeline.clips_at(45);
        assert_eq!(hits[0].content_id(), a.id());
        assert_eq!(hits[1].content_id(), b.id());
    }

    #[test]
    fn test_set_clip_content_swaps_atomically() {
        let timeline = ClipTimeline::new();
        let a = ramp_content(64, 0.0);
        let b = ramp_content(64, 0.0);
        let c = ramp_content(64, 0.0);
        timeline.insert_clip(a.clone(), 10, 5, 30).unwrap();
        timeline.insert_clip(c.clone(), 100, 0, 30).unwrap();

        // Same instance: no-op success.
        timeline.set_clip_content(&a, a.clone()).unwrap();

        // Content already used elsewhere: rejected.
        assert!(matches!(
            timeline.set_clip_content(&a, c.clone()),
            Err(Error::DuplicateContent)
        ));

        timeline.set_clip_content(&a, b.clone()).unwrap();
        assert!(!timeline.contains(&a));
        let clip = timeline.find_clip(&b).unwrap();
        assert_eq!(clip.position, 10);
        assert_eq!(clip.start_offset, 5);
        assert_eq!(clip.length, 30);
    }

    #[test]
    fn test_start_offset_update_is_visible() {
        let mut timeline = ClipTimeline::new();
        let a = ramp_content(64, 0.0);
        timeline.insert_clip(a.clone(), 0, 0, 32).unwrap();
        timeline.set_clip_start_offset(&a, 20).unwrap();
        timeline.open(32, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(1, 8);
        timeline.read(&mut dest, 0, 8, ChannelMask::NONE);
        assert_eq!(dest.sample_at(0, 0), 20.0);
    }

    #[test]
    fn test_short_read_at_effective_length() {
        let mut timeline = ClipTimeline::new();
        let a = ramp_content(64, 0.0);
        timeline.insert_clip(a, 0, 0, 40).unwrap();
        timeline.open(32, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(1, 32);
        assert_eq!(timeline.read(&mut dest, 0, 32, ChannelMask::NONE), 32);
        assert_eq!(timeline.read(&mut dest, 0, 32, ChannelMask::NONE), 8);
        assert_eq!(timeline.read(&mut dest, 0, 32, ChannelMask::NONE), 0);
    }

    #[test]
    fn test_open_propagates_to_clip_contents() {
        let mut timeline = ClipTimeline::new();
        let a = ramp_content(64, 0.0);
        timeline.insert_clip(a.clone(), 0, 0, 64).unwrap();

        assert!(!a.lock().is_open());
        timeline.open(128, 48000.0).unwrap();
        assert!(a.lock().is_open());
        assert_eq!(a.lock().block_size(), 128);

        // Inserting while open opens the content immediately.
        let b = ramp_content(64, 0.0);
        timeline.insert_clip(b.clone(), 100, 0, 64).unwrap();
        assert!(b.lock().is_open());

        timeline.close();
        assert!(!a.lock().is_open());
        assert!(!b.lock().is_open());
    }
}
