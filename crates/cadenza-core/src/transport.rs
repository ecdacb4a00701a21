//! Transport/playback state machine with a buffering gate.
//!
//! A [`TransportSource`] wraps one positionable source and adds play/pause,
//! seek and loop control. An independent buffering counter (the
//! [`BufferingGate`]) forces silent output without advancing while it is
//! held - upstream loaders use it to stall playback instead of letting
//! unready audio through.

use crate::buffer::SampleContainerMut;
use crate::error::{Error, Result};
use crate::source::{
    AudioSource, ChannelMask, PositionableSource, SharedSource, SourceHandle, SourceId,
};
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Loop window `[start, end)`. `start == end` is the degenerate range: reads
/// return nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRange {
    pub start: u64,
    pub end: u64,
}

/// Observer of transport state.
///
/// Callbacks run on whichever thread mutates the transport, including the
/// streaming thread; keep them brief and never call back into the wrapped
/// source.
pub trait TransportObserver: Send + Sync {
    /// Fired strictly before a position change becomes visible, with the
    /// position about to be set. This includes every loop wrap.
    fn position_about_to_change(&self, _new_position: u64) {}

    /// Fired with the new buffering counter value on every acquire/release.
    fn buffering_changed(&self, _count: u32) {}
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type ObserverEntries = Vec<(ObserverId, Arc<dyn TransportObserver>)>;

/// Observer registry shared between a transport and its gate. Snapshot-read
/// so notification never allocates or holds the edit lock.
#[derive(Default)]
struct ObserverSet {
    entries: ArcSwap<ObserverEntries>,
    edit: Mutex<()>,
    next_id: AtomicU64,
}

impl ObserverSet {
    fn add(&self, observer: Arc<dyn TransportObserver>) -> ObserverId {
        let _guard = self.edit.lock();
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut next = (**self.entries.load()).clone();
        next.push((id, observer));
        self.entries.store(Arc::new(next));
        id
    }

    fn remove(&self, id: ObserverId) {
        let _guard = self.edit.lock();
        let mut next = (**self.entries.load()).clone();
        next.retain(|(entry_id, _)| *entry_id != id);
        self.entries.store(Arc::new(next));
    }

    fn notify_position(&self, new_position: u64) {
        for (_, observer) in self.entries.load().iter() {
            observer.position_about_to_change(new_position);
        }
    }

    fn notify_buffering(&self, count: u32) {
        for (_, observer) in self.entries.load().iter() {
            observer.buffering_changed(count);
        }
    }
}

/// Non-negative buffering counter gating a transport's output.
///
/// While the count is above zero the owning transport emits silence without
/// advancing. Acquire/release are lock-free, so upstream components may call
/// them from the streaming path.
pub struct BufferingGate {
    count: AtomicU32,
    observers: Arc<ObserverSet>,
}

impl BufferingGate {
    fn new(observers: Arc<ObserverSet>) -> Self {
        Self {
            count: AtomicU32::new(0),
            observers,
        }
    }

    pub fn acquire(&self) {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(count, "buffering acquired");
        self.observers.notify_buffering(count);
    }

    /// Releasing an unacquired gate is a contract violation; the count never
    /// goes negative.
    pub fn release(&self) {
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => {
                trace!(count = prev - 1, "buffering released");
                self.observers.notify_buffering(prev - 1);
            }
            Err(_) => debug_assert!(false, "release without matching acquire"),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct OpenState {
    open: bool,
    block_size: usize,
    sample_rate: f64,
}

/// Play/pause/seek/loop state machine over one wrapped source.
pub struct TransportSource {
    id: SourceId,
    source: Mutex<Option<(SharedSource, bool)>>,
    state: Mutex<OpenState>,
    position: AtomicU64,
    playing: AtomicBool,
    loop_range: ArcSwapOption<LoopRange>,
    gate: Arc<BufferingGate>,
    observers: Arc<ObserverSet>,
}

impl Default for TransportSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportSource {
    pub fn new() -> Self {
        let observers = Arc::new(ObserverSet::default());
        Self {
            id: SourceId::generate(),
            source: Mutex::new(None),
            state: Mutex::new(OpenState::default()),
            position: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            loop_range: ArcSwapOption::empty(),
            gate: Arc::new(BufferingGate::new(observers.clone())),
            observers,
        }
    }

    /// Type-preserving shared handle for feeding a device player or another
    /// component while the caller keeps transport control.
    pub fn shared_handle(this: &Arc<Self>) -> SharedSource {
        SharedSource::with_id(this.id, this.clone())
    }

    /// Replace the wrapped source. A previously owned source is closed; the
    /// new one is opened and positioned when the transport is open.
    pub fn set_source(&self, handle: Option<SourceHandle>) -> Result<()> {
        let normalized = handle.map(SourceHandle::into_shared);

        if let Some((shared, _)) = &normalized {
            let st = self.state.lock();
            if st.open {
                let mut guard = shared.lock();
                guard.open(st.block_size, st.sample_rate)?;
                guard.set_next_read_position(self.position.load(Ordering::Acquire));
            }
        }

        let previous = {
            let mut slot = self.source.lock();
            std::mem::replace(&mut *slot, normalized)
        };
        if let Some((old, owned)) = previous {
            if owned {
                old.lock().close();
            }
        }
        Ok(())
    }

    pub fn play(&self) {
        self.playing.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Seek. Observers are notified before the new position is visible.
    pub fn set_position(&self, pos: u64) {
        self.observers.notify_position(pos);
        self.position.store(pos, Ordering::Release);
        let source = self.source.lock().as_ref().map(|(s, _)| s.clone());
        if let Some(source) = source {
            source.lock().set_next_read_position(pos);
        }
    }

    pub fn set_loop_range(&self, start: u64, end: u64) -> Result<()> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        self.loop_range.store(Some(Arc::new(LoopRange { start, end })));
        Ok(())
    }

    pub fn clear_loop_range(&self) {
        self.loop_range.store(None);
    }

    pub fn loop_range(&self) -> Option<LoopRange> {
        self.loop_range.load_full().map(|lr| *lr)
    }

    /// The gate used by upstream loaders for backpressure.
    pub fn buffering_gate(&self) -> Arc<BufferingGate> {
        self.gate.clone()
    }

    pub fn acquire_buffering(&self) {
        self.gate.acquire();
    }

    pub fn release_buffering(&self) {
        self.gate.release();
    }

    pub fn buffering_count(&self) -> u32 {
        self.gate.count()
    }

    pub fn add_observer(&self, observer: Arc<dyn TransportObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.observers.remove(id);
    }

    fn open_inner(&self, block_size: usize, sample_rate: f64) -> Result<()> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        let mut st = self.state.lock();
        let source = self.source.lock().as_ref().map(|(s, _)| s.clone());
        if let Some(source) = source {
            let mut guard = source.lock();
            guard.open(block_size, sample_rate)?;
            guard.set_next_read_position(self.position.load(Ordering::Acquire));
        }
        st.open = true;
        st.block_size = block_size;
        st.sample_rate = sample_rate;
        Ok(())
    }

    fn close_inner(&self) {
        let mut st = self.state.lock();
        if !st.open {
            return;
        }
        let source = self.source.lock().as_ref().map(|(s, _)| s.clone());
        if let Some(source) = source {
            source.lock().close();
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
        debug_assert!(self.state.lock().open, "read on closed transport");

        let lr = self.loop_range.load_full();
        if let Some(lr) = &lr {
            if lr.start == lr.end {
                return 0;
            }
        }

        // Gating never produces a short read: paused or buffering output is
        // full-length silence, position untouched.
        if !self.is_playing() || self.gate.count() > 0 {
            dest.clear_range(dest_start, len);
            return len;
        }

        let source = self.source.lock().as_ref().map(|(s, _)| s.clone());
        let Some(source) = source else {
            dest.clear_range(dest_start, len);
            return len;
        };

        let mut guard = source.lock();
        let mut produced = 0usize;
        let mut cursor = self.position.load(Ordering::Acquire);

        while produced < len {
            let want = len - produced;
            let until = match lr.as_deref() {
                Some(lr) if cursor < lr.end => ((lr.end - cursor) as usize).min(want),
                _ => want,
            };

            let got = guard.read(dest, dest_start + produced, until, silent);
            produced += got;
            cursor += got as u64;

            if got < until {
                // Wrapped source ran out: end of stream for this call.
                break;
            }

            if let Some(lr) = lr.as_deref() {
                if cursor >= lr.end {
                    // Wrap: observers hear about the jump before it lands.
                    self.observers.notify_position(lr.start);
                    self.position.store(lr.start, Ordering::Release);
                    cursor = lr.start;
                    guard.set_next_read_position(lr.start);
                }
            }
        }
        drop(guard);

        self.observers.notify_position(cursor);
        self.position.store(cursor, Ordering::Release);
        produced
    }

    fn length_inner(&self) -> u64 {
        self.source
            .lock()
            .as_ref()
            .map_or(0, |(s, _)| s.lock().length())
    }
}

macro_rules! delegate_transport_source {
    ($ty:ty) => {
        impl AudioSource for $ty {
            fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
                TransportSource::open_inner(self, block_size, sample_rate)
            }

            fn close(&mut self) {
                TransportSource::close_inner(self);
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
                TransportSource::read_inner(self, dest, dest_start, len, silent)
            }
        }

        impl PositionableSource for $ty {
            fn length(&self) -> u64 {
                TransportSource::length_inner(self)
            }

            fn next_read_position(&self) -> u64 {
                TransportSource::position(self)
            }

            fn set_next_read_position(&mut self, pos: u64) {
                TransportSource::set_position(self, pos);
            }
        }
    };
}

delegate_transport_source!(TransportSource);
delegate_transport_source!(Arc<TransportSource>);

/// Scoped guard capturing transport position and loop range, restoring both
/// on drop on every exit path. Lets an export pass drive the transport
/// without disturbing the live playback state.
pub struct TransportStateGuard<'a> {
    transport: &'a TransportSource,
    position: u64,
    loop_range: Option<LoopRange>,
}

impl<'a> TransportStateGuard<'a> {
    pub fn new(transport: &'a TransportSource) -> Self {
        Self {
            transport,
            position: transport.position(),
            loop_range: transport.loop_range(),
        }
    }
}

impl Drop for TransportStateGuard<'_> {
    fn drop(&mut self) {
        match self.loop_range {
            Some(lr) => {
                // Saved ranges were valid when captured.
                let _ = self.transport.set_loop_range(lr.start, lr.end);
            }
            None => self.transport.clear_loop_range(),
        }
        self.transport.set_position(self.position);
    }
}
