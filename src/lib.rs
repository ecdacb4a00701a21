//! # Cadenza - real-time audio engine core
//!
//! Umbrella crate coordinating the engine's subsystems:
//! - **cadenza-core** - sample containers, the source contract, clip
//!   timeline, mixer, transport
//! - **cadenza-stream** - look-ahead buffering, asynchronously loading
//!   clips, host I/O adapter seams (device, codec, resampler)
//!
//! ## Quick start
//!
//! ```
//! use cadenza::prelude::*;
//! use std::sync::Arc;
//!
//! // Two bars of audio on a timeline, mixed and transport-controlled.
//! let timeline = Arc::new(ClipTimeline::new());
//! let content = SharedSource::new(MemorySource::new(SampleBuffer::new(2, 44100)));
//! timeline.insert_clip(content, 0, 0, 44100).unwrap();
//!
//! let mixer = Arc::new(Mixer::new());
//! mixer.add_source(ClipTimeline::shared_handle(&timeline), false).unwrap();
//!
//! let transport = Arc::new(TransportSource::new());
//! transport.set_source(Some(Mixer::shared_handle(&mixer).into())).unwrap();
//!
//! // A device backend drives a SourcePlayer holding the transport handle.
//! let mut player = SourcePlayer::new();
//! player.set_source(Some(TransportSource::shared_handle(&transport)));
//! transport.play();
//! ```

/// Re-export of cadenza-core for direct access.
pub use cadenza_core as core;

/// Re-export of cadenza-stream for direct access.
pub use cadenza_stream as stream;

// Containers and the source contract
pub use cadenza_core::{
    AudioSource, ChannelMask, InterleavedViewMut, MemorySource, PlanarViewMut,
    PositionableSource, SampleBuffer, SampleContainer, SampleContainerMut, SharedSource,
    SilenceSource, SourceHandle, SourceId, ToneSource, INFINITE_LENGTH,
};

// Timeline, mixing, transport
pub use cadenza_core::{
    BufferingGate, Clip, ClipTimeline, LoopRange, Mixer, ObserverId, TransportObserver,
    TransportSource, TransportStateGuard,
};

// Errors
pub use cadenza_core::{Error, Result};
pub use cadenza_stream::{Error as StreamError, Result as StreamResult};

// Streaming layer
pub use cadenza_stream::{
    pump_source, AsyncClipTimeline, AudioDevice, BufferingConfig, BufferingSource, ChannelFanOut,
    ClipLoader, CodecReader, CodecWriter, DeviceCallback, FutureSource, FutureSourceHandle,
    LoadStatus, ReadMode, ResampleInput, Resampler, SourcePlayer,
};

/// Common imports for building and driving an engine graph.
pub mod prelude {
    pub use crate::{
        AsyncClipTimeline, AudioSource, BufferingConfig, BufferingSource, ChannelMask, Clip,
        ClipLoader, ClipTimeline, FutureSource, FutureSourceHandle, LoadStatus, LoopRange,
        MemorySource, Mixer, PositionableSource, ReadMode, SampleBuffer, SampleContainer,
        SampleContainerMut, SharedSource, SilenceSource, SourceHandle, SourcePlayer, ToneSource,
        TransportObserver, TransportSource, TransportStateGuard, INFINITE_LENGTH,
    };
}
