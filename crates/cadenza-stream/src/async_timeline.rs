//! Clip timeline over future-backed content, with transport backpressure.
//!
//! An [`AsyncClipTimeline`] is a [`ClipTimeline`] whose clip contents are
//! [`FutureSource`](crate::FutureSource)s still being produced. It keeps
//! running readiness totals, and in the default [`ReadMode::Notify`] it holds
//! a registered transport's [`BufferingGate`] while any clip overlapping the
//! read position is still loading - the transport plays silence instead of
//! half-loaded audio, and resumes where it stopped.
//!
//! Unlike the plain timeline, overlapping clip windows are rejected here:
//! readiness accounting assumes each position maps to at most one pending
//! clip.

use crate::error::{Error, Result};
use crate::future_source::{FutureShared, FutureSourceHandle, LoadStatus, LoaderEvent};
use cadenza_core::{
    AudioSource, BufferingGate, ChannelMask, Clip, ClipTimeline, PositionableSource,
    SampleContainerMut, SharedSource, SourceId,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// How a read treats clips whose future is not yet Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Signal backpressure through the registered transport gate; the stream
    /// itself keeps flowing (unready clips render silence).
    #[default]
    Notify,
    /// Silently skip not-yet-ready clips.
    Skip,
    /// Synchronously await unready clips. Off-real-time-thread only.
    Block,
}

struct FutureRecord {
    shared: Arc<FutureShared>,
    counted_progress: u64,
    counted_ready: bool,
}

struct AsyncState {
    futures: HashMap<SourceId, FutureRecord>,
    events_rx: Receiver<LoaderEvent>,
    length_available: u64,
    length_loaded: u64,
    length_of_all: u64,
}

#[derive(Default)]
struct GateState {
    gate: Option<Arc<BufferingGate>>,
    held: bool,
}

/// ClipTimeline whose contents load asynchronously.
pub struct AsyncClipTimeline {
    id: SourceId,
    timeline: ClipTimeline,
    state: Mutex<AsyncState>,
    events_tx: Sender<LoaderEvent>,
    mode: Mutex<ReadMode>,
    gate: Mutex<GateState>,
}

impl Default for AsyncClipTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncClipTimeline {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            id: SourceId::generate(),
            timeline: ClipTimeline::new(),
            state: Mutex::new(AsyncState {
                futures: HashMap::new(),
                events_rx,
                length_available: 0,
                length_loaded: 0,
                length_of_all: 0,
            }),
            events_tx,
            mode: Mutex::new(ReadMode::default()),
            gate: Mutex::new(GateState::default()),
        }
    }

    /// Type-preserving shared handle.
    pub fn shared_handle(this: &Arc<Self>) -> SharedSource {
        SharedSource::with_id(this.id, SharedAsyncTimeline(this.clone()))
    }

    pub fn set_read_mode(&self, mode: ReadMode) {
        *self.mode.lock() = mode;
    }

    pub fn read_mode(&self) -> ReadMode {
        *self.mode.lock()
    }

    /// Register the transport gate used for backpressure in `Notify` mode.
    pub fn set_transport_gate(&self, gate: Option<Arc<BufferingGate>>) {
        let release = {
            let mut gs = self.gate.lock();
            let release = gs.held.then(|| gs.gate.clone()).flatten();
            gs.gate = gate;
            gs.held = false;
            release
        };
        if let Some(gate) = release {
            gate.release();
        }
    }

    /// Insert a future-backed clip. Overlapping windows are rejected.
    pub fn insert_clip(
        &self,
        handle: &FutureSourceHandle,
        position: u64,
        start_offset: u64,
        length: u64,
    ) -> Result<()> {
        let mut st = self.state.lock();
        if length > 0 && !self.timeline.clips_overlapping(position, length).is_empty() {
            return Err(Error::OverlappingClip);
        }
        self.timeline
            .insert_clip(handle.source().clone(), position, start_offset, length)?;

        handle.shared().subscribe(Some(self.events_tx.clone()));
        let shared = handle.shared().clone();
        let declared = shared.declared_length();
        let progress = shared.progress().min(declared);
        let ready = shared.status() == LoadStatus::Ready;

        st.length_of_all += declared;
        st.length_loaded += progress;
        if ready {
            st.length_available += declared;
        }
        st.futures.insert(
            shared.id(),
            FutureRecord {
                shared,
                counted_progress: progress,
                counted_ready: ready,
            },
        );
        debug!(id = ?handle.id(), position, length, "async clip inserted");
        Ok(())
    }

    pub fn remove_clip(&self, handle: &FutureSourceHandle) -> Result<()> {
        let mut st = self.state.lock();
        process_events(&mut st);
        self.timeline.remove_clip(handle.source())?;
        if let Some(record) = st.futures.remove(&handle.id()) {
            record.shared.subscribe(None);
            let declared = record.shared.declared_length();
            st.length_of_all -= declared;
            st.length_loaded -= record.counted_progress;
            if record.counted_ready {
                st.length_available -= declared;
            }
        }
        Ok(())
    }

    pub fn remove_all_clips(&self) {
        let mut st = self.state.lock();
        self.timeline.remove_all_clips();
        for record in st.futures.values() {
            record.shared.subscribe(None);
        }
        st.futures.clear();
        st.length_available = 0;
        st.length_loaded = 0;
        st.length_of_all = 0;
    }

    /// Move/resize a clip; the new window must not overlap other clips.
    pub fn set_clip_range(
        &self,
        handle: &FutureSourceHandle,
        position: u64,
        length: u64,
    ) -> Result<()> {
        let _st = self.state.lock();
        if length > 0
            && self
                .timeline
                .clips_overlapping(position, length)
                .iter()
                .any(|clip| clip.content_id() != handle.id())
        {
            return Err(Error::OverlappingClip);
        }
        self.timeline
            .set_clip_range(handle.source(), position, length)
            .map_err(Into::into)
    }

    pub fn set_clip_start_offset(&self, handle: &FutureSourceHandle, start_offset: u64) -> Result<()> {
        self.timeline
            .set_clip_start_offset(handle.source(), start_offset)
            .map_err(Into::into)
    }

    pub fn find_clip(&self, handle: &FutureSourceHandle) -> Option<Clip> {
        self.timeline.find_clip(handle.source())
    }

    pub fn clip_count(&self) -> usize {
        self.timeline.clip_count()
    }

    pub fn effective_length(&self) -> u64 {
        self.timeline.effective_length()
    }

    /// True iff every clip overlapping `[pos, pos + len)` has a Ready future.
    pub fn can_read(&self, pos: u64, len: usize) -> bool {
        let mut st = self.state.lock();
        process_events(&mut st);
        self.timeline
            .clips_overlapping(pos, len as u64)
            .iter()
            .all(|clip| {
                st.futures
                    .get(&clip.content_id())
                    .is_none_or(|r| r.shared.status() == LoadStatus::Ready)
            })
    }

    /// Sum of declared lengths over clips whose future is Ready.
    pub fn length_available(&self) -> u64 {
        let mut st = self.state.lock();
        process_events(&mut st);
        st.length_available
    }

    /// Summed loader progress over all clips.
    pub fn length_loaded(&self) -> u64 {
        let mut st = self.state.lock();
        process_events(&mut st);
        st.length_loaded
    }

    /// Sum of declared lengths over all clips.
    pub fn length_of_all_clips(&self) -> u64 {
        let mut st = self.state.lock();
        process_events(&mut st);
        st.length_of_all
    }

    /// Re-evaluate readiness at the current position and update the gate.
    /// Call from a control tick (or after loader progress) so a stalled
    /// transport resumes once its clips become Ready.
    pub fn update_readiness(&self) {
        let pos = self.timeline.next_read_position();
        let len = self.timeline.block_size().max(1);
        let stalled = self.stalled_at(pos, len);
        self.update_gate(stalled);
    }

    /// A position stalls while some overlapping future is still unresolved.
    /// Terminal futures never stall: a cancelled clip renders silence rather
    /// than holding the transport forever.
    fn stalled_at(&self, pos: u64, len: usize) -> bool {
        let mut st = self.state.lock();
        process_events(&mut st);
        self.timeline
            .clips_overlapping(pos, len as u64)
            .iter()
            .any(|clip| {
                st.futures
                    .get(&clip.content_id())
                    .is_some_and(|r| !r.shared.status().is_terminal())
            })
    }

    /// Exactly-once acquire/release, guarded by the held flag.
    fn update_gate(&self, stalled: bool) {
        let mut gs = self.gate.lock();
        let Some(gate) = gs.gate.clone() else { return };
        if stalled && !gs.held {
            gs.held = true;
            drop(gs);
            trace!("async timeline stalled, acquiring transport gate");
            gate.acquire();
        } else if !stalled && gs.held {
            gs.held = false;
            drop(gs);
            trace!("async timeline readable, releasing transport gate");
            gate.release();
        }
    }

    fn read_inner(
        &self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize {
        let mode = self.read_mode();
        let pos = self.timeline.next_read_position();

        match mode {
            ReadMode::Notify => {
                let stalled = self.stalled_at(pos, len);
                self.update_gate(stalled);
            }
            ReadMode::Skip => {}
            ReadMode::Block => {
                let pending: Vec<Arc<FutureShared>> = {
                    let st = self.state.lock();
                    self.timeline
                        .clips_overlapping(pos, len as u64)
                        .iter()
                        .filter_map(|clip| st.futures.get(&clip.content_id()))
                        .filter(|r| !r.shared.status().is_terminal())
                        .map(|r| r.shared.clone())
                        .collect()
                };
                for shared in pending {
                    shared.wait_resolved();
                }
            }
        }

        let mut timeline = &self.timeline;
        timeline.read(dest, dest_start, len, silent)
    }

    fn seek_inner(&self, pos: u64) {
        {
            let mut timeline = &self.timeline;
            timeline.set_next_read_position(pos);
        }
        if self.read_mode() == ReadMode::Notify {
            let len = self.timeline.block_size().max(1);
            let stalled = self.stalled_at(pos, len);
            self.update_gate(stalled);
        }
    }

    fn close_inner(&self) {
        {
            let mut timeline = &self.timeline;
            timeline.close();
        }
        self.update_gate(false);
    }
}

impl Drop for AsyncClipTimeline {
    fn drop(&mut self) {
        self.update_gate(false);
    }
}

fn process_events(st: &mut AsyncState) {
    while let Ok(event) = st.events_rx.try_recv() {
        match event {
            LoaderEvent::Progress { id, loaded } => {
                if let Some(record) = st.futures.get_mut(&id) {
                    let delta = loaded.saturating_sub(record.counted_progress);
                    record.counted_progress = record.counted_progress.max(loaded);
                    st.length_loaded += delta;
                }
            }
            LoaderEvent::Status { id, status } => {
                if let Some(record) = st.futures.get_mut(&id) {
                    if status == LoadStatus::Ready && !record.counted_ready {
                        record.counted_ready = true;
                        let declared = record.shared.declared_length();
                        st.length_available += declared;
                    }
                }
            }
        }
    }
}

macro_rules! delegate_async_timeline_source {
    ($ty:ty) => {
        impl AudioSource for $ty {
            fn open(&mut self, block_size: usize, sample_rate: f64) -> cadenza_core::Result<()> {
                let this: &AsyncClipTimeline = self;
                let mut timeline = &this.timeline;
                timeline.open(block_size, sample_rate)
            }

            fn close(&mut self) {
                AsyncClipTimeline::close_inner(self);
            }

            fn is_open(&self) -> bool {
                let this: &AsyncClipTimeline = self;
                this.timeline.is_open()
            }

            fn block_size(&self) -> usize {
                let this: &AsyncClipTimeline = self;
                this.timeline.block_size()
            }

            fn sample_rate(&self) -> f64 {
                let this: &AsyncClipTimeline = self;
                this.timeline.sample_rate()
            }

            fn read(
                &mut self,
                dest: &mut dyn SampleContainerMut,
                dest_start: usize,
                len: usize,
                silent: ChannelMask,
            ) -> usize {
                AsyncClipTimeline::read_inner(self, dest, dest_start, len, silent)
            }
        }

        impl PositionableSource for $ty {
            fn length(&self) -> u64 {
                let this: &AsyncClipTimeline = self;
                this.timeline.effective_length()
            }

            fn next_read_position(&self) -> u64 {
                let this: &AsyncClipTimeline = self;
                this.timeline.next_read_position()
            }

            fn set_next_read_position(&mut self, pos: u64) {
                AsyncClipTimeline::seek_inner(self, pos);
            }
        }
    };
}

/// Streaming alias of a shared async timeline; the source traits are
/// implemented here because coherence does not let this crate implement
/// them for `Arc<AsyncClipTimeline>` directly.
struct SharedAsyncTimeline(Arc<AsyncClipTimeline>);

impl std::ops::Deref for SharedAsyncTimeline {
    type Target = AsyncClipTimeline;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

delegate_async_timeline_source!(AsyncClipTimeline);
delegate_async_timeline_source!(SharedAsyncTimeline);
