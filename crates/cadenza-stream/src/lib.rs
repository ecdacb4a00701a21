//! Streaming layer for the cadenza audio engine.
//!
//! # Primary API
//!
//! - [`BufferingSource`]: background-thread look-ahead over one source
//! - [`FutureSource`] / [`ClipLoader`]: asynchronously produced content
//! - [`AsyncClipTimeline`]: clip timeline with loading backpressure
//! - [`SourcePlayer`] / [`AudioDevice`]: device backend seam
//! - [`CodecReader`] / [`CodecWriter`] / [`pump_source`]: codec seam
//! - [`Resampler`] / [`ChannelFanOut`]: resampler seam

pub mod error;
pub use error::{Error, Result};

mod config;
pub use config::BufferingConfig;

mod ring;

mod buffering;
pub use buffering::BufferingSource;

mod future_source;
pub use future_source::{ClipLoader, FutureSource, FutureSourceHandle, LoadStatus};

mod async_timeline;
pub use async_timeline::{AsyncClipTimeline, ReadMode};

mod player;
pub use player::{AudioDevice, DeviceCallback, SourcePlayer};

mod codec;
pub use codec::{pump_source, CodecReader, CodecWriter};

mod resample;
pub use resample::{ChannelFanOut, ResampleInput, Resampler};
