//! Concurrent look-ahead buffering engine.
//!
//! A [`BufferingSource`] decouples a slow or bursty source from a
//! real-time-safe read path: a dedicated prefetch worker fills a
//! position-addressed window ahead of demand, and reads that land inside the
//! window are plain copies. When the producer falls behind, the read cancels
//! the in-flight fill and fills inline - the caller blocks, but the samples
//! delivered are always exactly what the wrapped source would have produced.
//!
//! The window has one writer at a time by construction: the worker task and
//! an inline fill are mutually exclusive, the latter always cancelling and
//! awaiting the former first.

use crate::config::BufferingConfig;
use crate::ring::LookaheadRing;
use cadenza_core::{
    AudioSource, ChannelMask, Error, PositionableSource, Result, SampleBuffer, SampleContainer,
    SampleContainerMut, SharedSource, SourceHandle, SourceId,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thread_priority::ThreadPriority;
use tracing::{debug, trace, warn};

enum WorkerMsg {
    Fill,
    Shutdown,
}

/// At most one outstanding fill task: `running` flips on schedule and off on
/// completion, `done` signals waiters, `cancel` is checked between chunks.
#[derive(Default)]
struct TaskSignal {
    running: Mutex<bool>,
    done: Condvar,
    cancel: AtomicBool,
}

impl TaskSignal {
    fn try_begin(&self) -> bool {
        let mut running = self.running.lock();
        if *running {
            false
        } else {
            *running = true;
            true
        }
    }

    fn finish(&self) {
        *self.running.lock() = false;
        self.done.notify_all();
    }

    fn cancel_and_wait(&self) {
        self.cancel.store(true, Ordering::Release);
        let mut running = self.running.lock();
        while *running {
            self.done.wait(&mut running);
        }
        self.cancel.store(false, Ordering::Release);
    }

    /// True once no task is in flight; false if `deadline` passes first.
    fn wait_done_until(&self, deadline: Instant) -> bool {
        let mut running = self.running.lock();
        while *running {
            if self.done.wait_until(&mut running, deadline).timed_out() {
                return !*running;
            }
        }
        true
    }
}

struct BufferState {
    ring: LookaheadRing,
    next_pos: u64,
    read_ahead: usize,
    open: bool,
    block_size: usize,
    sample_rate: f64,
}

struct WorkerHandle {
    tx: Sender<WorkerMsg>,
    join: JoinHandle<()>,
}

/// Background-filled look-ahead wrapper around one source.
pub struct BufferingSource {
    id: SourceId,
    source: SharedSource,
    source_owned: bool,
    channels: usize,
    state: Arc<Mutex<BufferState>>,
    task: Arc<TaskSignal>,
    worker: Mutex<Option<WorkerHandle>>,
    inline_scratch: Mutex<SampleBuffer>,
}

impl BufferingSource {
    pub fn new(source: impl Into<SourceHandle>, config: BufferingConfig) -> Self {
        let (shared, owned) = source.into().into_shared();
        let capacity = config.read_ahead.max(1);
        Self {
            id: SourceId::generate(),
            source: shared,
            source_owned: owned,
            channels: config.channels.max(1),
            state: Arc::new(Mutex::new(BufferState {
                ring: LookaheadRing::new(config.channels.max(1), capacity),
                next_pos: 0,
                read_ahead: config.read_ahead,
                open: false,
                block_size: 0,
                sample_rate: 0.0,
            })),
            task: Arc::new(TaskSignal::default()),
            worker: Mutex::new(None),
            inline_scratch: Mutex::new(SampleBuffer::default()),
        }
    }

    /// Type-preserving shared handle.
    pub fn shared_handle(this: &Arc<Self>) -> SharedSource {
        SharedSource::with_id(this.id, SharedBuffering(this.clone()))
    }

    pub fn read_ahead(&self) -> usize {
        self.state.lock().read_ahead
    }

    /// Change the look-ahead window. Any in-flight fill is cancelled and the
    /// window flushed before the resize.
    pub fn set_read_ahead(&self, samples: usize) {
        self.task.cancel_and_wait();
        {
            let mut st = self.state.lock();
            st.read_ahead = samples;
            let pos = st.next_pos;
            st.ring = LookaheadRing::new(self.channels, samples.max(1));
            st.ring.reset(pos);
        }
        self.schedule_fill();
    }

    /// Block until the current background fill completes or `deadline`
    /// passes. Returns whether the fill had completed.
    pub fn wait_for_buffering(&self, deadline: Instant) -> bool {
        self.task.wait_done_until(deadline)
    }

    fn spawn_worker(&self) -> Result<()> {
        let (tx, rx) = bounded::<WorkerMsg>(4);
        let state = self.state.clone();
        let source = self.source.clone();
        let task = self.task.clone();

        let join = std::thread::Builder::new()
            .name("cadenza-prefetch".into())
            .spawn(move || {
                let _ = thread_priority::set_current_thread_priority(ThreadPriority::Max);
                worker_loop(&rx, &state, &source, &task);
            })
            .map_err(|err| Error::OpenFailed(format!("prefetch worker: {err}")))?;

        *self.worker.lock() = Some(WorkerHandle { tx, join });
        Ok(())
    }

    /// Start an asynchronous replenish unless one is already in flight.
    fn schedule_fill(&self) {
        {
            let mut st = self.state.lock();
            if !st.open || st.read_ahead <= st.block_size {
                return;
            }
            st.ring.renormalize();
            if st.ring.write_space() == 0 {
                return;
            }
        }
        if self.task.try_begin() {
            let sent = self
                .worker
                .lock()
                .as_ref()
                .map(|w| w.tx.send(WorkerMsg::Fill).is_ok())
                .unwrap_or(false);
            if !sent {
                self.task.finish();
            }
        }
    }

    fn open_inner(&self, block_size: usize, sample_rate: f64) -> Result<()> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        self.close_inner();
        self.source.lock().open(block_size, sample_rate)?;
        {
            let mut st = self.state.lock();
            let capacity = st.read_ahead.max(1);
            st.ring = LookaheadRing::new(self.channels, capacity);
            st.ring.reset(0);
            st.next_pos = 0;
            st.open = true;
            st.block_size = block_size;
            st.sample_rate = sample_rate;
        }
        self.spawn_worker()?;
        debug!(block_size, sample_rate, read_ahead = self.read_ahead(), "buffering source open");
        self.schedule_fill();
        Ok(())
    }

    fn close_inner(&self) {
        self.task.cancel_and_wait();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.tx.send(WorkerMsg::Shutdown);
            let _ = worker.join.join();
        }
        let was_open = {
            let mut st = self.state.lock();
            let was_open = st.open;
            st.open = false;
            st.block_size = 0;
            st.sample_rate = 0.0;
            st.ring.reset(0);
            st.next_pos = 0;
            was_open
        };
        if was_open {
            self.source.lock().close();
        }
    }

    fn seek_inner(&self, pos: u64) {
        self.task.cancel_and_wait();
        {
            let mut st = self.state.lock();
            st.next_pos = pos;
            st.ring.reset(pos);
        }
        self.schedule_fill();
    }

    fn read_inner(
        &self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize {
        let (open, bypass) = {
            let st = self.state.lock();
            (st.open, st.read_ahead <= st.block_size)
        };
        debug_assert!(open, "read on closed source");
        if !open || len == 0 {
            return 0;
        }

        if bypass {
            let got = self.source.lock().read(dest, dest_start, len, silent);
            self.state.lock().next_pos += got as u64;
            return got;
        }

        let total = self.source.lock().length();

        let mut st = self.state.lock();
        let start_pos = st.next_pos;
        let want = (len as u64).min(total.saturating_sub(start_pos)) as usize;
        if want == 0 {
            return 0;
        }

        let mut produced = 0usize;
        while produced < want {
            let pos = start_pos + produced as u64;
            let chunk = (want - produced).min(st.ring.capacity());

            if st.ring.contains(pos, chunk) {
                st.ring.read_into(dest, dest_start + produced, pos, chunk, silent);
                produced += chunk;
                continue;
            }

            // Graceful degradation: the producer has fallen behind (or the
            // requested range lies outside the window). Take over the fill.
            drop(st);
            warn!(pos, "look-ahead miss, filling inline");
            self.task.cancel_and_wait();
            {
                let mut st = self.state.lock();
                st.ring.reset(pos);
            }
            {
                let mut scratch = self.inline_scratch.lock();
                run_fill(&self.state, &self.source, &self.task.cancel, &mut scratch);
            }
            st = self.state.lock();
            if !st.ring.contains(pos, (want - produced).min(st.ring.capacity())) {
                // Closed or flushed concurrently.
                break;
            }
        }

        st.next_pos = start_pos + produced as u64;
        drop(st);
        self.schedule_fill();
        produced
    }
}

impl Drop for BufferingSource {
    fn drop(&mut self) {
        self.close_inner();
        if self.source_owned {
            self.source.lock().close();
        }
    }
}

macro_rules! delegate_buffering_source {
    ($ty:ty) => {
        impl AudioSource for $ty {
            fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
                BufferingSource::open_inner(self, block_size, sample_rate)
            }

            fn close(&mut self) {
                BufferingSource::close_inner(self);
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
                BufferingSource::read_inner(self, dest, dest_start, len, silent)
            }
        }

        impl PositionableSource for $ty {
            fn length(&self) -> u64 {
                self.source.lock().length()
            }

            fn next_read_position(&self) -> u64 {
                self.state.lock().next_pos
            }

            fn set_next_read_position(&mut self, pos: u64) {
                BufferingSource::seek_inner(self, pos);
            }
        }
    };
}

/// Streaming alias of a shared buffering source; the source traits are
/// implemented here because coherence does not let this crate implement
/// them for `Arc<BufferingSource>` directly.
struct SharedBuffering(Arc<BufferingSource>);

impl std::ops::Deref for SharedBuffering {
    type Target = BufferingSource;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

delegate_buffering_source!(BufferingSource);
delegate_buffering_source!(SharedBuffering);

fn worker_loop(
    rx: &Receiver<WorkerMsg>,
    state: &Mutex<BufferState>,
    source: &SharedSource,
    task: &TaskSignal,
) {
    let mut scratch = SampleBuffer::default();
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Fill => {
                run_fill(state, source, &task.cancel, &mut scratch);
                task.finish();
                trace!("background fill complete");
            }
            WorkerMsg::Shutdown => break,
        }
    }
}

/// Fill the window from the wrapped source in chunks no larger than the
/// block size, until full or end-of-stream (shortfall is zero-filled). The
/// state lock is never held across a wrapped-source read; the cancel flag is
/// checked between chunks.
fn run_fill(
    state: &Mutex<BufferState>,
    source: &SharedSource,
    cancel: &AtomicBool,
    scratch: &mut SampleBuffer,
) {
    loop {
        if cancel.load(Ordering::Acquire) {
            return;
        }

        let (target, chunk, channels) = {
            let mut st = state.lock();
            if !st.open {
                return;
            }
            st.ring.renormalize();
            let space = st.ring.write_space();
            if space == 0 {
                return;
            }
            (
                st.ring.tail_position(),
                space.min(st.block_size.max(1)),
                st.ring.channels(),
            )
        };

        if scratch.channel_count() != channels || scratch.sample_count() < chunk {
            scratch.resize(channels, chunk);
        }

        let got = {
            let mut guard = source.lock();
            if guard.next_read_position() != target {
                guard.set_next_read_position(target);
            }
            guard.read(scratch, 0, chunk, ChannelMask::NONE)
        };

        let mut st = state.lock();
        if !st.open || st.ring.tail_position() != target {
            // Flushed or re-targeted while we were reading; drop the chunk.
            return;
        }
        if got > 0 {
            st.ring.append(scratch, 0, got);
        }
        if got < chunk {
            let rest = st.ring.write_space();
            st.ring.append_silence(rest);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::MemorySource;
    use std::time::Duration;

    fn ramp_material(samples: usize) -> SampleBuffer {
        let mut material = SampleBuffer::new(2, samples);
        for ch in 0..2 {
            for pos in 0..samples {
                material.set_sample(ch, pos, pos as f32 + ch as f32 * 0.25);
            }
        }
        material
    }

    fn buffering(samples: usize, read_ahead: usize) -> BufferingSource {
        BufferingSource::new(
            SourceHandle::Owned(Box::new(MemorySource::new(ramp_material(samples)))),
            BufferingConfig {
                read_ahead,
                channels: 2,
            },
        )
    }

    #[test]
    fn test_immediate_read_matches_direct_read() {
        let mut direct = MemorySource::new(ramp_material(4096));
        direct.open(256, 44100.0).unwrap();
        let mut expected = SampleBuffer::new(2, 1024);
        assert_eq!(direct.read(&mut expected, 0, 1024, ChannelMask::NONE), 1024);

        let mut buffered = buffering(4096, 1024);
        buffered.open(256, 44100.0).unwrap();
        let mut got = SampleBuffer::new(2, 1024);
        // Before any background fill necessarily completed: only latency may
        // differ, never the samples.
        assert_eq!(buffered.read(&mut got, 0, 1024, ChannelMask::NONE), 1024);

        for ch in 0..2 {
            for pos in 0..1024 {
                assert_eq!(got.sample_at(ch, pos), expected.sample_at(ch, pos));
            }
        }
    }

    #[test]
    fn test_sequential_reads_replenish() {
        let mut buffered = buffering(8192, 512);
        buffered.open(128, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(2, 128);
        for block in 0..32 {
            assert_eq!(buffered.read(&mut dest, 0, 128, ChannelMask::NONE), 128);
            assert_eq!(dest.sample_at(0, 0), (block * 128) as f32);
            assert_eq!(dest.sample_at(0, 127), (block * 128 + 127) as f32);
        }
        assert_eq!(buffered.next_read_position(), 4096);
    }

    #[test]
    fn test_seek_flushes_and_serves_new_range() {
        let mut buffered = buffering(4096, 1024);
        buffered.open(256, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(2, 256);
        buffered.read(&mut dest, 0, 256, ChannelMask::NONE);

        buffered.set_next_read_position(3000);
        assert_eq!(buffered.next_read_position(), 3000);
        assert_eq!(buffered.read(&mut dest, 0, 256, ChannelMask::NONE), 256);
        assert_eq!(dest.sample_at(0, 0), 3000.0);
    }

    #[test]
    fn test_end_of_stream_is_clamped() {
        let mut buffered = buffering(300, 1024);
        buffered.open(128, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(2, 512);
        assert_eq!(buffered.read(&mut dest, 0, 512, ChannelMask::NONE), 300);
        assert_eq!(dest.sample_at(0, 299), 299.0);
        assert_eq!(buffered.read(&mut dest, 0, 512, ChannelMask::NONE), 0);
    }

    #[test]
    fn test_bypass_when_window_not_larger_than_block() {
        let mut buffered = buffering(1000, 64);
        buffered.open(256, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(2, 200);
        assert_eq!(buffered.read(&mut dest, 0, 200, ChannelMask::NONE), 200);
        assert_eq!(dest.sample_at(0, 0), 0.0);
        assert_eq!(dest.sample_at(0, 199), 199.0);
        assert_eq!(buffered.next_read_position(), 200);
    }

    #[test]
    fn test_wait_for_buffering_completes() {
        let mut buffered = buffering(48_000, 8192);
        buffered.open(512, 44100.0).unwrap();

        assert!(buffered.wait_for_buffering(Instant::now() + Duration::from_secs(5)));

        // With the window primed, a read is served synchronously.
        let mut dest = SampleBuffer::new(2, 512);
        assert_eq!(buffered.read(&mut dest, 0, 512, ChannelMask::NONE), 512);
        assert_eq!(dest.sample_at(1, 0), 0.25);
    }

    #[test]
    fn test_set_read_ahead_flushes_in_flight_fill() {
        let mut buffered = buffering(48_000, 2048);
        buffered.open(256, 44100.0).unwrap();

        let mut dest = SampleBuffer::new(2, 256);
        buffered.read(&mut dest, 0, 256, ChannelMask::NONE);

        buffered.set_read_ahead(4096);
        assert_eq!(buffered.read_ahead(), 4096);

        // Continues from the same position with the new window.
        buffered.read(&mut dest, 0, 256, ChannelMask::NONE);
        assert_eq!(dest.sample_at(0, 0), 256.0);
    }

    #[test]
    fn test_close_is_idempotent_and_reopenable() {
        let mut buffered = buffering(2048, 512);
        buffered.open(128, 44100.0).unwrap();
        buffered.close();
        buffered.close();
        assert!(!buffered.is_open());

        buffered.open(128, 48000.0).unwrap();
        let mut dest = SampleBuffer::new(2, 128);
        assert_eq!(buffered.read(&mut dest, 0, 128, ChannelMask::NONE), 128);
        assert_eq!(dest.sample_at(0, 0), 0.0);
    }
}
