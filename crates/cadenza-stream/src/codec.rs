//! Codec I/O contract and the block-pumped writer utility.
//!
//! File decoding and encoding are external collaborators; they implement
//! [`CodecReader`] / [`CodecWriter`] over interleaved f32 frames.
//! [`pump_source`] streams any positionable source into a writer in
//! fixed-size blocks, e.g. for an offline export pass.

use crate::error::{Error, Result};
use cadenza_core::{
    AudioSource as _, ChannelMask, PositionableSource, SampleBuffer, SampleContainer as _,
};
use tracing::debug;

/// Decoded-audio pull interface (interleaved f32 frames).
pub trait CodecReader: Send {
    fn channel_count(&self) -> usize;

    fn sample_rate(&self) -> f64;

    /// Total length in frames.
    fn length(&self) -> u64;

    /// Fill `interleaved` (a whole number of frames); returns frames
    /// actually read, short only at end of file.
    fn read(&mut self, interleaved: &mut [f32]) -> usize;
}

/// Encoded-audio push interface (interleaved f32 frames).
pub trait CodecWriter: Send {
    fn channel_count(&self) -> usize;

    fn sample_rate(&self) -> f64;

    /// Write a whole number of frames; returns frames actually written.
    fn write(&mut self, interleaved: &[f32]) -> Result<usize>;
}

/// Open `source` at the writer's sample rate and pump it to `writer` in
/// `block_size`-frame blocks until the source ends. Returns frames written.
///
/// The source is closed afterwards. Infinite sources pump forever; bound
/// them with a clip timeline or transport loop first.
pub fn pump_source(
    source: &mut dyn PositionableSource,
    writer: &mut dyn CodecWriter,
    block_size: usize,
) -> Result<u64> {
    if block_size == 0 {
        return Err(Error::Core(cadenza_core::Error::InvalidBlockSize(0)));
    }
    let channels = writer.channel_count();
    if channels == 0 {
        return Err(Error::Codec("writer reports zero channels".into()));
    }

    source.open(block_size, writer.sample_rate())?;
    let mut planar = SampleBuffer::new(channels, block_size);
    let mut interleaved = vec![0.0f32; channels * block_size];
    let mut total = 0u64;

    loop {
        planar.clear();
        let got = source.read(&mut planar, 0, block_size, ChannelMask::NONE);
        if got == 0 {
            break;
        }
        for pos in 0..got {
            for ch in 0..channels {
                interleaved[pos * channels + ch] = planar.sample_at(ch, pos);
            }
        }
        let written = writer.write(&interleaved[..got * channels])?;
        total += written as u64;
        if written < got || got < block_size {
            break;
        }
    }

    source.close();
    debug!(frames = total, "pump complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::{AudioSource as _, MemorySource, SampleContainerMut as _};

    struct VecWriter {
        channels: usize,
        frames: Vec<f32>,
        blocks: Vec<usize>,
    }

    impl CodecWriter for VecWriter {
        fn channel_count(&self) -> usize {
            self.channels
        }

        fn sample_rate(&self) -> f64 {
            44100.0
        }

        fn write(&mut self, interleaved: &[f32]) -> Result<usize> {
            self.blocks.push(interleaved.len() / self.channels);
            self.frames.extend_from_slice(interleaved);
            Ok(interleaved.len() / self.channels)
        }
    }

    fn ramp_source(samples: usize) -> MemorySource {
        let mut material = SampleBuffer::new(2, samples);
        for ch in 0..2 {
            for pos in 0..samples {
                material.set_sample(ch, pos, pos as f32 + ch as f32 * 0.5);
            }
        }
        MemorySource::new(material)
    }

    #[test]
    fn test_pump_writes_exact_length_in_blocks() {
        let mut source = ramp_source(1000);
        let mut writer = VecWriter {
            channels: 2,
            frames: Vec::new(),
            blocks: Vec::new(),
        };

        let total = pump_source(&mut source, &mut writer, 256).unwrap();
        assert_eq!(total, 1000);
        assert_eq!(writer.blocks, vec![256, 256, 256, 232]);

        // Interleaving: frame 10 = (10.0, 10.5).
        assert_eq!(writer.frames[20], 10.0);
        assert_eq!(writer.frames[21], 10.5);
        assert!(!source.is_open());
    }

    #[test]
    fn test_pump_rejects_zero_block() {
        let mut source = ramp_source(16);
        let mut writer = VecWriter {
            channels: 2,
            frames: Vec::new(),
            blocks: Vec::new(),
        };
        assert!(pump_source(&mut source, &mut writer, 0).is_err());
    }
}
