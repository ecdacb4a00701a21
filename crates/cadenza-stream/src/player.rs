//! Device backend contract and the source playback adapter.
//!
//! Hardware backends live outside this crate; they implement
//! [`AudioDevice`] and drive a [`DeviceCallback`] once per hardware block
//! with a pre-allocated container of the negotiated size. [`SourcePlayer`]
//! is the engine-side adapter: it clears the buffer, forwards to `read()` on
//! the wrapped source, and relays device start/stop into the source's
//! open/close.

use crate::error::Result;
use cadenza_core::{
    AudioSource as _, ChannelMask, SampleContainer as _, SampleContainerMut, SharedSource,
};
use tracing::warn;

/// Rendering callback driven by a device backend.
pub trait DeviceCallback: Send {
    /// The device is about to start streaming at the negotiated shape.
    fn device_started(&mut self, block_size: usize, sample_rate: f64);

    /// Produce one hardware block. The container is pre-allocated by the
    /// device; its full sample range must be written.
    fn render(&mut self, buffer: &mut dyn SampleContainerMut);

    /// The device stopped streaming.
    fn device_stopped(&mut self);
}

/// Contract implemented by hardware device backends (external
/// collaborators).
pub trait AudioDevice {
    fn open(&mut self, block_size: usize, sample_rate: f64) -> Result<()>;

    fn start(&mut self, callback: Box<dyn DeviceCallback>) -> Result<()>;

    fn stop(&mut self);

    /// Exclude the real-time callback until [`Self::unlock`]. Calls pair.
    fn lock(&mut self);

    fn unlock(&mut self);
}

/// Plays one source into a device callback.
pub struct SourcePlayer {
    source: Option<SharedSource>,
    gain: f32,
    started: bool,
    block_size: usize,
    sample_rate: f64,
}

impl Default for SourcePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourcePlayer {
    pub fn new() -> Self {
        Self {
            source: None,
            gain: 1.0,
            started: false,
            block_size: 0,
            sample_rate: 0.0,
        }
    }

    /// Swap the played source. When the device is already running the new
    /// source is opened to the negotiated shape immediately.
    pub fn set_source(&mut self, source: Option<SharedSource>) {
        if let (Some(new), true) = (&source, self.started) {
            if let Err(err) = new.lock().open(self.block_size, self.sample_rate) {
                warn!(%err, "player source failed to open, muting");
                self.source = None;
                return;
            }
        }
        if let Some(old) = self.source.take() {
            if self.started {
                old.lock().close();
            }
        }
        self.source = source;
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl DeviceCallback for SourcePlayer {
    fn device_started(&mut self, block_size: usize, sample_rate: f64) {
        self.started = true;
        self.block_size = block_size;
        self.sample_rate = sample_rate;
        if let Some(source) = &self.source {
            let result = source.lock().open(block_size, sample_rate);
            if let Err(err) = result {
                warn!(%err, "player source failed to open, muting");
                self.source = None;
            }
        }
    }

    fn render(&mut self, buffer: &mut dyn SampleContainerMut) {
        let frames = buffer.sample_count();
        buffer.clear_range(0, frames);

        let Some(source) = &self.source else { return };
        source.lock().read(buffer, 0, frames, ChannelMask::NONE);

        if self.gain != 1.0 {
            for ch in 0..buffer.channel_count() {
                buffer.gain_sample_range(ch, 0, frames, self.gain);
            }
        }
    }

    fn device_stopped(&mut self) {
        self.started = false;
        if let Some(source) = &self.source {
            source.lock().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::{
        AudioSource as _, InterleavedViewMut, MemorySource, SampleBuffer, SampleContainer as _,
        SharedSource,
    };

    fn ramp_shared(samples: usize) -> SharedSource {
        let mut material = SampleBuffer::new(2, samples);
        for ch in 0..2 {
            for pos in 0..samples {
                material.set_sample(ch, pos, pos as f32);
            }
        }
        SharedSource::new(MemorySource::new(material))
    }

    #[test]
    fn test_start_render_stop_relays_lifecycle() {
        let source = ramp_shared(1024);
        let mut player = SourcePlayer::new();
        player.set_source(Some(source.clone()));

        player.device_started(128, 48000.0);
        assert!(source.lock().is_open());

        // Device buffers are typically interleaved: the non-continuous path.
        let mut raw = vec![7.0f32; 2 * 128];
        let mut buffer = InterleavedViewMut::new(2, 128, &mut raw);
        player.render(&mut buffer);
        assert_eq!(buffer.sample_at(0, 0), 0.0);
        assert_eq!(buffer.sample_at(1, 127), 127.0);

        player.device_stopped();
        assert!(!source.lock().is_open());
    }

    #[test]
    fn test_render_without_source_clears_buffer() {
        let mut player = SourcePlayer::new();
        player.device_started(64, 44100.0);

        let mut buffer = SampleBuffer::new(2, 64);
        buffer.set_sample(0, 5, 3.0);
        player.render(&mut buffer);
        assert_eq!(buffer.magnitude(0, 0, 64), 0.0);
    }

    #[test]
    fn test_gain_scales_output() {
        let mut player = SourcePlayer::new();
        player.set_source(Some(ramp_shared(256)));
        player.set_gain(0.5);
        player.device_started(16, 44100.0);

        let mut buffer = SampleBuffer::new(2, 16);
        player.render(&mut buffer);
        assert_eq!(buffer.sample_at(0, 8), 4.0);
    }

    #[test]
    fn test_set_source_while_running_opens_immediately() {
        let mut player = SourcePlayer::new();
        player.device_started(32, 44100.0);

        let source = ramp_shared(64);
        player.set_source(Some(source.clone()));
        assert!(source.lock().is_open());
        assert_eq!(source.lock().block_size(), 32);
    }
}
