//! Future-backed sources: content that becomes available asynchronously.
//!
//! A [`FutureSource`] is a positionable source whose actual content is
//! produced later by a [`ClipLoader`] on some worker thread. Until the loader
//! completes, reads render silence; once Ready, reads delegate to the loaded
//! source. Cancellation is terminal: a cancelled future renders silence
//! forever and must not be restarted.

use cadenza_core::{
    AudioSource, ChannelMask, PositionableSource, Result, SampleContainerMut, SharedSource,
    SourceId,
};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Loader lifecycle: `Running`/`Paused` -> `Ready`, or -> `Cancelled`
/// (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Running,
    Paused,
    Ready,
    Cancelled,
}

impl LoadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Cancelled)
    }
}

/// Readiness events drained by the subscribed timeline.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LoaderEvent {
    Progress { id: SourceId, loaded: u64 },
    Status { id: SourceId, status: LoadStatus },
}

pub(crate) struct FutureShared {
    id: SourceId,
    declared_length: u64,
    status: Mutex<LoadStatus>,
    status_cv: Condvar,
    progress: AtomicU64,
    events: Mutex<Option<Sender<LoaderEvent>>>,
}

impl FutureShared {
    pub(crate) fn id(&self) -> SourceId {
        self.id
    }

    pub(crate) fn declared_length(&self) -> u64 {
        self.declared_length
    }

    pub(crate) fn status(&self) -> LoadStatus {
        *self.status.lock()
    }

    pub(crate) fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self, tx: Option<Sender<LoaderEvent>>) {
        *self.events.lock() = tx;
    }

    /// Block until the future resolves (Ready or Cancelled).
    pub(crate) fn wait_resolved(&self) -> LoadStatus {
        let mut status = self.status.lock();
        while !status.is_terminal() {
            self.status_cv.wait(&mut status);
        }
        *status
    }

    fn send(&self, event: LoaderEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Producer side of a future source. Drives progress and resolves the future
/// from whatever thread loads the content.
pub struct ClipLoader {
    shared: Arc<FutureShared>,
    slot: Arc<Mutex<Option<Box<dyn PositionableSource>>>>,
}

impl ClipLoader {
    pub fn id(&self) -> SourceId {
        self.shared.id
    }

    pub fn status(&self) -> LoadStatus {
        self.shared.status()
    }

    /// Report absolute progress, clamped to the declared length.
    pub fn set_progress(&self, loaded: u64) {
        if self.shared.status().is_terminal() {
            return;
        }
        let loaded = loaded.min(self.shared.declared_length);
        self.shared.progress.store(loaded, Ordering::Release);
        self.shared.send(LoaderEvent::Progress {
            id: self.shared.id,
            loaded,
        });
    }

    pub fn pause(&self) {
        self.transition(LoadStatus::Paused);
    }

    pub fn resume(&self) {
        self.transition(LoadStatus::Running);
    }

    /// Resolve the future with the loaded content.
    pub fn complete(&self, source: Box<dyn PositionableSource>) {
        {
            let mut status = self.shared.status.lock();
            if status.is_terminal() {
                debug_assert!(false, "complete after resolve");
                return;
            }
            *self.slot.lock() = Some(source);
            *status = LoadStatus::Ready;
            self.shared
                .progress
                .store(self.shared.declared_length, Ordering::Release);
            self.shared.status_cv.notify_all();
        }
        debug!(id = ?self.shared.id, "future source ready");
        self.shared.send(LoaderEvent::Progress {
            id: self.shared.id,
            loaded: self.shared.declared_length,
        });
        self.shared.send(LoaderEvent::Status {
            id: self.shared.id,
            status: LoadStatus::Ready,
        });
    }

    /// Cancel the load. Terminal; never followed by a restart.
    pub fn cancel(&self) {
        {
            let mut status = self.shared.status.lock();
            if status.is_terminal() {
                debug_assert!(matches!(*status, LoadStatus::Cancelled), "cancel after ready");
                return;
            }
            *status = LoadStatus::Cancelled;
            self.shared.status_cv.notify_all();
        }
        debug!(id = ?self.shared.id, "future source cancelled");
        self.shared.send(LoaderEvent::Status {
            id: self.shared.id,
            status: LoadStatus::Cancelled,
        });
    }

    fn transition(&self, to: LoadStatus) {
        {
            let mut status = self.shared.status.lock();
            if status.is_terminal() {
                debug_assert!(false, "pause/resume after resolve");
                return;
            }
            *status = to;
        }
        self.shared.send(LoaderEvent::Status {
            id: self.shared.id,
            status: to,
        });
    }
}

/// Consumer-side handle pairing the insertable [`SharedSource`] with the
/// readiness state the async timeline accounts with.
#[derive(Clone)]
pub struct FutureSourceHandle {
    source: SharedSource,
    shared: Arc<FutureShared>,
}

impl FutureSourceHandle {
    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    pub fn id(&self) -> SourceId {
        self.shared.id
    }

    pub fn status(&self) -> LoadStatus {
        self.shared.status()
    }

    pub fn progress(&self) -> u64 {
        self.shared.progress()
    }

    pub fn declared_length(&self) -> u64 {
        self.shared.declared_length
    }

    pub(crate) fn shared(&self) -> &Arc<FutureShared> {
        &self.shared
    }
}

/// A source that streams silence until its loader resolves it.
pub struct FutureSource {
    shared: Arc<FutureShared>,
    slot: Arc<Mutex<Option<Box<dyn PositionableSource>>>>,
    open: bool,
    block_size: usize,
    sample_rate: f64,
    position: u64,
    inner_bound: bool,
}

impl FutureSource {
    /// Create a future source declaring `length` samples of eventual
    /// content. Returns the consumer handle and the producer loader.
    pub fn create(declared_length: u64) -> (FutureSourceHandle, ClipLoader) {
        let id = SourceId::generate();
        let shared = Arc::new(FutureShared {
            id,
            declared_length,
            status: Mutex::new(LoadStatus::Running),
            status_cv: Condvar::new(),
            progress: AtomicU64::new(0),
            events: Mutex::new(None),
        });
        let slot: Arc<Mutex<Option<Box<dyn PositionableSource>>>> = Arc::new(Mutex::new(None));

        let source = FutureSource {
            shared: shared.clone(),
            slot: slot.clone(),
            open: false,
            block_size: 0,
            sample_rate: 0.0,
            position: 0,
            inner_bound: false,
        };

        (
            FutureSourceHandle {
                source: SharedSource::with_id(id, source),
                shared: shared.clone(),
            },
            ClipLoader { shared, slot },
        )
    }

    /// Open the resolved content lazily, on the first read after Ready.
    fn bind_inner(&mut self) -> bool {
        let mut slot = self.slot.lock();
        let Some(inner) = slot.as_mut() else {
            return false;
        };
        if !self.inner_bound {
            if inner.open(self.block_size, self.sample_rate).is_err() {
                return false;
            }
            self.inner_bound = true;
        }
        if inner.next_read_position() != self.position {
            inner.set_next_read_position(self.position);
        }
        true
    }
}

impl AudioSource for FutureSource {
    fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
        if self.open {
            self.close();
        }
        if block_size == 0 {
            return Err(cadenza_core::Error::InvalidBlockSize(block_size));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(cadenza_core::Error::InvalidSampleRate(sample_rate));
        }
        self.open = true;
        self.block_size = block_size;
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn close(&mut self) {
        if self.inner_bound {
            if let Some(inner) = self.slot.lock().as_mut() {
                inner.close();
            }
            self.inner_bound = false;
        }
        self.open = false;
        self.block_size = 0;
        self.sample_rate = 0.0;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn read(
        &mut self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize {
        debug_assert!(self.open, "read on closed source");
        if !self.open {
            return 0;
        }

        let produced = (len as u64)
            .min(self.shared.declared_length.saturating_sub(self.position))
            as usize;
        if produced == 0 {
            return 0;
        }

        if self.shared.status() == LoadStatus::Ready && self.bind_inner() {
            let mut slot = self.slot.lock();
            let inner = slot.as_mut().expect("resolved slot emptied");
            let got = inner.read(dest, dest_start, produced, silent);
            self.position += got as u64;
            return got;
        }

        // Not ready (or cancelled): silence without ending the stream.
        trace!(id = ?self.shared.id, "unready future read, rendering silence");
        dest.clear_range(dest_start, produced);
        self.position += produced as u64;
        produced
    }
}

impl PositionableSource for FutureSource {
    fn length(&self) -> u64 {
        self.shared.declared_length
    }

    fn next_read_position(&self) -> u64 {
        self.position
    }

    fn set_next_read_position(&mut self, pos: u64) {
        self.position = pos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::{MemorySource, SampleBuffer, SampleContainer};

    fn ramp_box(samples: usize) -> Box<dyn PositionableSource> {
        let mut material = SampleBuffer::new(1, samples);
        for pos in 0..samples {
            material.set_sample(0, pos, pos as f32);
        }
        Box::new(MemorySource::new(material))
    }

    #[test]
    fn test_silent_until_ready_then_delegates() {
        let (handle, loader) = FutureSource::create(100);
        let source = handle.source().clone();

        {
            let mut guard = source.lock();
            guard.open(32, 44100.0).unwrap();
            let mut dest = SampleBuffer::new(1, 32);
            dest.set_sample(0, 0, 9.0);
            assert_eq!(guard.read(&mut dest, 0, 32, ChannelMask::NONE), 32);
            assert_eq!(dest.magnitude(0, 0, 32), 0.0);
        }

        loader.complete(ramp_box(100));
        assert_eq!(handle.status(), LoadStatus::Ready);
        assert_eq!(handle.progress(), 100);

        let mut guard = source.lock();
        let mut dest = SampleBuffer::new(1, 32);
        // Continues at position 32, now with real content.
        assert_eq!(guard.read(&mut dest, 0, 32, ChannelMask::NONE), 32);
        assert_eq!(dest.sample_at(0, 0), 32.0);
    }

    #[test]
    fn test_declared_length_bounds_reads() {
        let (handle, _loader) = FutureSource::create(48);
        let source = handle.source().clone();
        let mut guard = source.lock();
        guard.open(32, 44100.0).unwrap();
        assert_eq!(guard.length(), 48);

        let mut dest = SampleBuffer::new(1, 32);
        assert_eq!(guard.read(&mut dest, 0, 32, ChannelMask::NONE), 32);
        assert_eq!(guard.read(&mut dest, 0, 32, ChannelMask::NONE), 16);
        assert_eq!(guard.read(&mut dest, 0, 32, ChannelMask::NONE), 0);
    }

    #[test]
    fn test_progress_clamped_to_declared() {
        let (handle, loader) = FutureSource::create(100);
        loader.set_progress(40);
        assert_eq!(handle.progress(), 40);
        loader.set_progress(5000);
        assert_eq!(handle.progress(), 100);
    }

    #[test]
    fn test_cancel_is_terminal_silence() {
        let (handle, loader) = FutureSource::create(64);
        loader.cancel();
        assert_eq!(handle.status(), LoadStatus::Cancelled);

        // Progress updates after cancellation are ignored.
        loader.set_progress(10);
        assert_eq!(handle.progress(), 0);

        let source = handle.source().clone();
        let mut guard = source.lock();
        guard.open(16, 44100.0).unwrap();
        let mut dest = SampleBuffer::new(1, 16);
        assert_eq!(guard.read(&mut dest, 0, 16, ChannelMask::NONE), 16);
        assert_eq!(dest.magnitude(0, 0, 16), 0.0);
    }

    #[test]
    fn test_wait_resolved_blocks_until_complete() {
        let (handle, loader) = FutureSource::create(32);
        let shared = handle.shared().clone();

        let waiter = std::thread::spawn(move || shared.wait_resolved());
        std::thread::sleep(std::time::Duration::from_millis(20));
        loader.complete(ramp_box(32));
        assert_eq!(waiter.join().unwrap(), LoadStatus::Ready);
    }

    #[test]
    fn test_pause_resume_roundtrip() {
        let (handle, loader) = FutureSource::create(32);
        loader.pause();
        assert_eq!(handle.status(), LoadStatus::Paused);
        loader.resume();
        assert_eq!(handle.status(), LoadStatus::Running);
    }
}
