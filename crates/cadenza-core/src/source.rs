//! Pull-streaming audio source contract.
//!
//! A source is a stateful stream: `Closed -> open(block_size, sample_rate) ->
//! Open -> close() -> Closed`. `open` while already open first closes.
//! `read` delivers exactly the requested sample count except at end-of-stream
//! (finite [`PositionableSource::length`]) or failure (0 for the call), and
//! never writes beyond the requested destination range.

use crate::buffer::{SampleContainer, SampleContainerMut};
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Length sentinel for generative/live sources with no end.
pub const INFINITE_LENGTH: u64 = u64::MAX;

/// Per-channel silence flags: a set channel is forced silent by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelMask(u64);

impl ChannelMask {
    pub const NONE: Self = Self(0);

    pub fn single(channel: usize) -> Self {
        Self(1 << channel)
    }

    #[must_use]
    pub fn with(self, channel: usize) -> Self {
        Self(self.0 | (1 << channel))
    }

    pub fn contains(&self, channel: usize) -> bool {
        channel < 64 && self.0 & (1 << channel) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Streaming pull interface.
pub trait AudioSource: Send {
    /// Bind the source to a block size and sample rate. Re-opening an open
    /// source closes the previous binding first. A failed open leaves the
    /// source closed.
    fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Negotiated block size (0 while closed).
    fn block_size(&self) -> usize;

    /// Negotiated sample rate (0.0 while closed).
    fn sample_rate(&self) -> f64;

    /// Produce up to `len` samples into `dest` starting at `dest_start`,
    /// returning the count actually produced. Channels in `silent` must come
    /// out silent. Reading a closed source is a contract violation
    /// (debug-asserted) and produces 0.
    fn read(
        &mut self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize;
}

/// A source with a position and (possibly infinite) length.
///
/// Seeking is always legal, including while closed or past the end; it takes
/// effect on the next read.
pub trait PositionableSource: AudioSource {
    /// Total length in samples, or [`INFINITE_LENGTH`].
    fn length(&self) -> u64;

    fn next_read_position(&self) -> u64;

    fn set_next_read_position(&mut self, pos: u64);
}

impl AudioSource for Box<dyn PositionableSource> {
    fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
        (**self).open(block_size, sample_rate)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn sample_rate(&self) -> f64 {
        (**self).sample_rate()
    }

    fn read(
        &mut self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize {
        (**self).read(dest, dest_start, len, silent)
    }
}

impl PositionableSource for Box<dyn PositionableSource> {
    fn length(&self) -> u64 {
        (**self).length()
    }

    fn next_read_position(&self) -> u64 {
        (**self).next_read_position()
    }

    fn set_next_read_position(&mut self, pos: u64) {
        (**self).set_next_read_position(pos);
    }
}

/// Stable identity for a shared source instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared, lockable handle to a source. Clones keep the same identity;
/// identity is what timelines and mixers use to reject duplicates.
#[derive(Clone)]
pub struct SharedSource {
    id: SourceId,
    inner: Arc<Mutex<dyn PositionableSource>>,
}

impl SharedSource {
    pub fn new(source: impl PositionableSource + 'static) -> Self {
        Self {
            id: SourceId::generate(),
            inner: Arc::new(Mutex::new(source)),
        }
    }

    pub fn from_box(source: Box<dyn PositionableSource>) -> Self {
        Self {
            id: SourceId::generate(),
            inner: Arc::new(Mutex::new(source)),
        }
    }

    /// Wrap with a caller-supplied identity. Components that keep a stable
    /// [`SourceId`] of their own (mixers, timelines) use this so every handle
    /// to the same component compares equal.
    pub fn with_id(id: SourceId, source: impl PositionableSource + 'static) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(source)),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, dyn PositionableSource> {
        self.inner.lock()
    }
}

impl std::fmt::Debug for SharedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSource").field("id", &self.id).finish()
    }
}

/// Ownership at the API boundary: a component either takes the source over
/// (closing it when the membership ends) or borrows a [`SharedSource`] whose
/// lifecycle stays with the caller.
pub enum SourceHandle {
    Owned(Box<dyn PositionableSource>),
    Shared(SharedSource),
}

impl SourceHandle {
    /// Normalize into a shared handle plus the take-over flag. Components
    /// use this to store members uniformly while remembering whether they
    /// close the source when the membership ends.
    pub fn into_shared(self) -> (SharedSource, bool) {
        match self {
            Self::Owned(source) => (SharedSource::from_box(source), true),
            Self::Shared(shared) => (shared, false),
        }
    }

    pub fn shared_id(&self) -> Option<SourceId> {
        match self {
            Self::Owned(_) => None,
            Self::Shared(shared) => Some(shared.id()),
        }
    }
}

impl From<SharedSource> for SourceHandle {
    fn from(shared: SharedSource) -> Self {
        Self::Shared(shared)
    }
}

impl From<Box<dyn PositionableSource>> for SourceHandle {
    fn from(source: Box<dyn PositionableSource>) -> Self {
        Self::Owned(source)
    }
}

/// Open-state bookkeeping shared by the concrete sources below.
#[derive(Debug, Clone, Copy, Default)]
struct Binding {
    open: bool,
    block_size: usize,
    sample_rate: f64,
}

impl Binding {
    fn bind(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        self.open = true;
        self.block_size = block_size;
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn unbind(&mut self) {
        *self = Self::default();
    }
}

/// Endless silence. Useful as a placeholder while real content loads.
#[derive(Debug, Default)]
pub struct SilenceSource {
    binding: Binding,
    position: u64,
}

impl AudioSource for SilenceSource {
    fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
        self.binding.bind(block_size, sample_rate)
    }

    fn close(&mut self) {
        self.binding.unbind();
    }

    fn is_open(&self) -> bool {
        self.binding.open
    }

    fn block_size(&self) -> usize {
        self.binding.block_size
    }

    fn sample_rate(&self) -> f64 {
        self.binding.sample_rate
    }

    fn read(
        &mut self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        _silent: ChannelMask,
    ) -> usize {
        debug_assert!(self.binding.open, "read on closed source");
        if !self.binding.open {
            return 0;
        }
        dest.clear_range(dest_start, len);
        self.position += len as u64;
        len
    }
}

impl PositionableSource for SilenceSource {
    fn length(&self) -> u64 {
        INFINITE_LENGTH
    }

    fn next_read_position(&self) -> u64 {
        self.position
    }

    fn set_next_read_position(&mut self, pos: u64) {
        self.position = pos;
    }
}

/// Plays back an in-memory [`crate::SampleBuffer`]. Finite length; short
/// reads at the end of the material.
#[derive(Debug)]
pub struct MemorySource {
    material: crate::SampleBuffer,
    binding: Binding,
    position: u64,
}

impl MemorySource {
    pub fn new(material: crate::SampleBuffer) -> Self {
        Self {
            material,
            binding: Binding::default(),
            position: 0,
        }
    }
}

impl AudioSource for MemorySource {
    fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
        self.binding.bind(block_size, sample_rate)
    }

    fn close(&mut self) {
        self.binding.unbind();
    }

    fn is_open(&self) -> bool {
        self.binding.open
    }

    fn block_size(&self) -> usize {
        self.binding.block_size
    }

    fn sample_rate(&self) -> f64 {
        self.binding.sample_rate
    }

    fn read(
        &mut self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize {
        use crate::buffer::SampleContainer as _;

        debug_assert!(self.binding.open, "read on closed source");
        if !self.binding.open {
            return 0;
        }

        let total = self.material.sample_count() as u64;
        let start = self.position.min(total);
        let produced = (len as u64).min(total - start) as usize;

        for ch in 0..dest.channel_count() {
            if silent.contains(ch) {
                for i in 0..produced {
                    dest.set_sample(ch, dest_start + i, 0.0);
                }
                continue;
            }
            let src_ch = ch.min(self.material.channel_count().saturating_sub(1));
            dest.set_sample_range(
                ch,
                dest_start,
                &self.material,
                src_ch,
                start as usize,
                produced,
            );
        }
        self.position = start + produced as u64;
        produced
    }
}

impl PositionableSource for MemorySource {
    fn length(&self) -> u64 {
        self.material.sample_count() as u64
    }

    fn next_read_position(&self) -> u64 {
        self.position
    }

    fn set_next_read_position(&mut self, pos: u64) {
        self.position = pos;
    }
}

/// Sine test signal. Infinite; position only drives the phase.
#[derive(Debug)]
pub struct ToneSource {
    frequency: f64,
    amplitude: f32,
    binding: Binding,
    position: u64,
}

impl ToneSource {
    pub fn new(frequency: f64, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude,
            binding: Binding::default(),
            position: 0,
        }
    }
}

impl AudioSource for ToneSource {
    fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()> {
        self.binding.bind(block_size, sample_rate)
    }

    fn close(&mut self) {
        self.binding.unbind();
    }

    fn is_open(&self) -> bool {
        self.binding.open
    }

    fn block_size(&self) -> usize {
        self.binding.block_size
    }

    fn sample_rate(&self) -> f64 {
        self.binding.sample_rate
    }

    fn read(
        &mut self,
        dest: &mut dyn SampleContainerMut,
        dest_start: usize,
        len: usize,
        silent: ChannelMask,
    ) -> usize {
        use crate::buffer::SampleContainer as _;

        debug_assert!(self.binding.open, "read on closed source");
        if !self.binding.open {
            return 0;
        }

        let step = std::f64::consts::TAU * self.frequency / self.binding.sample_rate;
        for i in 0..len {
            let phase = (self.position + i as u64) as f64 * step;
            let value = (phase.sin() * f64::from(self.amplitude)) as f32;
            for ch in 0..dest.channel_count() {
                let v = if silent.contains(ch) { 0.0 } else { value };
                dest.set_sample(ch, dest_start + i, v);
            }
        }
        self.position += len as u64;
        len
    }
}

impl PositionableSource for ToneSource {
    fn length(&self) -> u64 {
        INFINITE_LENGTH
    }

    fn next_read_position(&self) -> u64 {
        self.position
    }

    fn set_next_read_position(&mut self, pos: u64) {
        self.position = pos;
    }
}
