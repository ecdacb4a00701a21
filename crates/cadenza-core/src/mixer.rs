//! Multi-source mixing engine.
//!
//! Combines N member sources with gain/pan/mute/solo and optional
//! channel routing. Membership is published as an `ArcSwap` snapshot: a
//! mixing pass completes against the membership observed at pass start,
//! control-thread edits land for the next pass.

use crate::buffer::{SampleBuffer, SampleContainer, SampleContainerMut};
use crate::error::{Error, Result};
use crate::source::{
    AudioSource, ChannelMask, PositionableSource, SharedSource, SourceHandle, SourceId,
};
use arc_swap::ArcSwap;
use atomic_float::AtomicF32;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
struct MixerEntry {
    source: SharedSource,
    owned: bool,
    solo: bool,
}

#[derive(Debug, Default)]
struct MixerState {
    open: bool,
    block_size: usize,
    sample_rate: f64,
}

/// Mixes its members into the destination block.
///
/// Per block: destination is zeroed; each member not muted by the solo set is
/// read into a scratch buffer and accumulated - `gain_left`/`gain_right` on
/// channels 0/1, plain gain on channels >= 2, or into its own stereo slot
/// when `route_channels` is set. The reported length is the minimum of the
/// members' actual read lengths.
pub struct Mixer {
    id: SourceId,
    members: ArcSwap<Vec<MixerEntry>>,
    /// Guards membership edits and open-state propagation.
    state: Mutex<MixerState>,
    gain: AtomicF32,
    pan: AtomicF32,
    route_channels: AtomicBool,
    position: AtomicU64,
    scratch: Mutex<SampleBuffer>,
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            id: SourceId::generate(),
            members: ArcSwap::from_pointee(Vec::new()),
            state: Mutex::new(MixerState::default()),
            gain: AtomicF32::new(1.0),
            pan: AtomicF32::new(0.0),
            route_channels: AtomicBool::new(false),
            position: AtomicU64::new(0),
            scratch: Mutex::new(SampleBuffer::default()),
        }
    }

    /// Type-preserving shared handle: the caller keeps the `Arc` for control
    /// while the handle streams through the source seam. The handle carries
    /// the mixer's own identity, so inserting a mixer into itself is refused.
    pub fn shared_handle(this: &Arc<Self>) -> SharedSource {
        SharedSource::with_id(this.id, this.clone())
    }

    /// Add a member. Rejects duplicates and self-reference; when the mixer is
    /// open the new member is opened in lockstep. Returns the member's id.
    pub fn add_source(&self, handle: impl Into<SourceHandle>, solo: bool) -> Result<SourceId> {
        let (shared, owned) = handle.into().into_shared();
        if shared.id() == self.id {
            return Err(Error::SelfReference);
        }

        let st = self.state.lock();
        let members = self.members.load();
        if members.iter().any(|e| e.source.id() == shared.id()) {
            return Err(Error::DuplicateSource);
        }
        if st.open {
            shared.lock().open(st.block_size, st.sample_rate)?;
        }

        let mut next = (**members).clone();
        let id = shared.id();
        next.push(MixerEntry {
            source: shared,
            owned,
            solo,
        });
        self.members.store(Arc::new(next));
        Ok(id)
    }

    /// Remove a member. An owned member is closed; a borrowed one stays with
    /// its caller untouched.
    pub fn remove_source(&self, id: SourceId) -> Result<()> {
        let _st = self.state.lock();
        let members = self.members.load();
        let idx = members
            .iter()
            .position(|e| e.source.id() == id)
            .ok_or(Error::SourceNotFound)?;

        let mut next = (**members).clone();
        let entry = next.remove(idx);
        self.members.store(Arc::new(next));
        if entry.owned {
            entry.source.lock().close();
        }
        Ok(())
    }

    pub fn remove_all_sources(&self) {
        let _st = self.state.lock();
        let members = self.members.swap(Arc::new(Vec::new()));
        for entry in members.iter() {
            if entry.owned {
                entry.source.lock().close();
            }
        }
    }

    pub fn set_solo(&self, id: SourceId, solo: bool) -> Result<()> {
        let _st = self.state.lock();
        let members = self.members.load();
        if !members.iter().any(|e| e.source.id() == id) {
            return Err(Error::SourceNotFound);
        }
        let mut next = (**members).clone();
        for entry in &mut next {
            if entry.source.id() == id {
                entry.solo = solo;
            }
        }
        self.members.store(Arc::new(next));
        Ok(())
    }

    /// True iff the solo set is non-empty and this member is not in it.
    pub fn is_muted_by_solo(&self, id: SourceId) -> Result<bool> {
        let members = self.members.load();
        let entry = members
            .iter()
            .find(|e| e.source.id() == id)
            .ok_or(Error::SourceNotFound)?;
        Ok(members.iter().any(|e| e.solo) && !entry.solo)
    }

    pub fn member_count(&self) -> usize {
        self.members.load().len()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain, Ordering::Release);
    }

    pub fn gain(&self) -> f32 {
        self.gain.load(Ordering::Acquire)
    }

    /// Stereo balance, -1 (left) to +1 (right). The per-channel gains are
    /// `gain * min(1, 1 - pan)` and `gain * min(1, 1 + pan)`: panning only
    /// ever attenuates the far channel, never amplifies.
    pub fn set_pan(&self, pan: f32) {
        self.pan.store(pan, Ordering::Release);
    }

    pub fn pan(&self) -> f32 {
        self.pan.load(Ordering::Acquire)
    }

    /// When set, member `i` lands in destination channels `(2i, 2i+1)`
    /// instead of being summed into the common channels; members beyond the
    /// available slots are dropped.
    pub fn set_route_channels(&self, route: bool) {
        self.route_channels.store(route, Ordering::Release);
    }

    pub fn route_channels(&self) -> bool {
        self.route_channels.load(Ordering::Acquire)
    }

    fn open_inner(&self, block_size: usize, sample_rate: f64) -> Result<()> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        let mut st = self.state.lock();
        let members = self.members.load();
        if st.open {
            for entry in members.iter() {
                entry.source.lock().close();
            }
            st.open = false;
        }
        let mut opened = 0usize;
        for entry in members.iter() {
            if let Err(err) = entry.source.lock().open(block_size, sample_rate) {
                for prev in members.iter().take(opened) {
                    prev.source.lock().close();
                }
                return Err(err);
            }
            opened += 1;
        }
        st.open = true;
        st.block_size = block_size;
        st.sample_rate = sample_rate;
        debug!(block_size, sample_rate, members = members.len(), "mixer open");
        Ok(())
    }

    fn close_inner(&self) {
        let mut st = self.state.lock();
        if !st.open {
            return;
        }
        for entry in self.members.load().iter() {
            entry.source.lock().close();
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
        debug_assert!(self.state.lock().open, "read on closed mixer");

        // Snapshot: edits made during this pass land in the next one.
        let members = self.members.load_full();

        dest.clear_range(dest_start, len);

        if members.is_empty() {
            self.position.fetch_add(len as u64, Ordering::AcqRel);
            return len;
        }

        let gain = self.gain.load(Ordering::Acquire);
        let pan = self.pan.load(Ordering::Acquire);
        let gain_left = gain * (1.0 - pan).min(1.0);
        let gain_right = gain * (1.0 + pan).min(1.0);
        let route = self.route_channels.load(Ordering::Acquire);
        let solo_active = members.iter().any(|e| e.solo);

        let mut scratch = self.scratch.lock();
        if scratch.channel_count() != dest.channel_count() || scratch.sample_count() < len {
            scratch.resize(dest.channel_count(), len);
        }

        let mut min_len = len;
        for (i, entry) in members.iter().enumerate() {
            if solo_active && !entry.solo {
                continue;
            }
            if route && 2 * i >= dest.channel_count() {
                // No slot left for this member.
                continue;
            }

            scratch.clear_range(0, len);
            let got = entry.source.lock().read(&mut *scratch, 0, len, ChannelMask::NONE);
            min_len = min_len.min(got);

            if route {
                let left = 2 * i;
                let right = 2 * i + 1;
                if !silent.contains(left) {
                    dest.add_sample_range(left, dest_start, &*scratch, 0, 0, got, gain_left);
                }
                if right < dest.channel_count() && !silent.contains(right) {
                    let src_ch = 1.min(scratch.channel_count() - 1);
                    dest.add_sample_range(right, dest_start, &*scratch, src_ch, 0, got, gain_right);
                }
            } else {
                for ch in 0..dest.channel_count() {
                    if silent.contains(ch) {
                        continue;
                    }
                    let g = match ch {
                        0 => gain_left,
                        1 => gain_right,
                        _ => gain,
                    };
                    dest.add_sample_range(ch, dest_start, &*scratch, ch, 0, got, g);
                }
            }
        }

        self.position.fetch_add(min_len as u64, Ordering::AcqRel);
        min_len
    }

    /// Minimum member length; 0 when empty.
    pub fn length(&self) -> u64 {
        let members = self.members.load();
        members
            .iter()
            .map(|e| e.source.lock().length())
            .min()
            .unwrap_or(0)
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Seek the mixer and every member in lockstep.
    pub fn seek(&self, pos: u64) {
        self.position.store(pos, Ordering::Release);
        for entry in self.members.load().iter() {
            entry.source.lock().set_next_read_position(pos);
        }
    }
}

macro_rules! delegate_mixer_source {
    ($ty:ty) => {
        impl AudioSource for $ty {
            fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
                Mixer::open_inner(self, block_size, sample_rate)
            }

            fn close(&mut self) {
                Mixer::close_inner(self);
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
                Mixer::read_inner(self, dest, dest_start, len, silent)
            }
        }

        impl PositionableSource for $ty {
            fn length(&self) -> u64 {
                Mixer::length(self)
            }

            fn next_read_position(&self) -> u64 {
                Mixer::position(self)
            }

            fn set_next_read_position(&mut self, pos: u64) {
                Mixer::seek(self, pos);
            }
        }
    };
}

delegate_mixer_source!(Mixer);
delegate_mixer_source!(Arc<Mixer>);
