//! Core streaming contracts for the cadenza audio engine.
//!
//! # Primary API
//!
//! - [`SampleContainer`] / [`SampleBuffer`]: multi-channel f32 blocks
//! - [`AudioSource`] / [`PositionableSource`]: the pull-streaming contract
//! - [`ClipTimeline`]: interval-tree clip map, readable as a source
//! - [`Mixer`]: N-source mixing with gain/pan/solo/routing
//! - [`TransportSource`]: play/pause/seek/loop over one wrapped source
//!
//! Components expose their control surface through `&self` with interior
//! locking, so a caller can keep an `Arc` to a nested component (via
//! `shared_handle`) and mutate the graph while the streaming thread pulls
//! audio through it.

pub mod error;
pub use error::{Error, Result};

mod buffer;
pub use buffer::{
    InterleavedViewMut, PlanarViewMut, SampleBuffer, SampleContainer, SampleContainerMut,
};

mod source;
pub use source::{
    AudioSource, ChannelMask, MemorySource, PositionableSource, SharedSource, SilenceSource,
    SourceHandle, SourceId, ToneSource, INFINITE_LENGTH,
};

mod timeline;
pub use timeline::{Clip, ClipTimeline};

mod mixer;
pub use mixer::Mixer;

mod transport;
pub use transport::{
    BufferingGate, LoopRange, ObserverId, TransportObserver, TransportSource, TransportStateGuard,
};
