//! End-to-end streaming: timeline -> mixer -> transport -> player, with
//! look-ahead buffering and asynchronous clip loading in the chain.

use cadenza_core::{
    AudioSource, ChannelMask, ClipTimeline, MemorySource, Mixer, PositionableSource, SampleBuffer,
    SampleContainer, SampleContainerMut, SharedSource, SourceHandle, TransportSource,
};
use cadenza_stream::{
    AsyncClipTimeline, AudioDevice, BufferingConfig, BufferingSource, DeviceCallback,
    FutureSource, SourcePlayer,
};
use std::sync::Arc;

fn ramp_material(channels: usize, samples: usize, base: f32) -> SampleBuffer {
    let mut material = SampleBuffer::new(channels, samples);
    for ch in 0..channels {
        for pos in 0..samples {
            material.set_sample(ch, pos, base + pos as f32);
        }
    }
    material
}

fn constant_shared(level: f32, samples: usize) -> SharedSource {
    let mut material = SampleBuffer::new(2, samples);
    for ch in 0..2 {
        for pos in 0..samples {
            material.set_sample(ch, pos, level);
        }
    }
    SharedSource::new(MemorySource::new(material))
}

/// Minimal in-process device: renders on demand into an interleaved buffer.
struct TestDevice {
    block_size: usize,
    sample_rate: f64,
    callback: Option<Box<dyn DeviceCallback>>,
}

impl TestDevice {
    fn new() -> Self {
        Self {
            block_size: 0,
            sample_rate: 0.0,
            callback: None,
        }
    }

    /// Drive `blocks` hardware callbacks, returning the planar output.
    fn pump(&mut self, blocks: usize) -> SampleBuffer {
        let callback = self.callback.as_mut().expect("device not started");
        let mut out = SampleBuffer::new(2, blocks * self.block_size);
        let mut block = SampleBuffer::new(2, self.block_size);
        for i in 0..blocks {
            block.clear();
            callback.render(&mut block);
            for ch in 0..2 {
                out.set_sample_range(ch, i * self.block_size, &block, ch, 0, self.block_size);
            }
        }
        out
    }
}

impl AudioDevice for TestDevice {
    fn open(&mut self, block_size: usize, sample_rate: f64) -> cadenza_stream::Result<()> {
        self.block_size = block_size;
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn start(&mut self, mut callback: Box<dyn DeviceCallback>) -> cadenza_stream::Result<()> {
        callback.device_started(self.block_size, self.sample_rate);
        self.callback = Some(callback);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(callback) = self.callback.as_mut() {
            callback.device_stopped();
        }
        self.callback = None;
    }

    fn lock(&mut self) {}

    fn unlock(&mut self) {}
}

#[test]
fn test_transport_over_mixer_reports_min_length() {
    let mixer = Arc::new(Mixer::new());
    let short_id = mixer.add_source(constant_shared(0.5, 1000), false).unwrap();
    mixer.add_source(constant_shared(0.25, 2000), false).unwrap();

    let transport = Arc::new(TransportSource::new());
    transport
        .set_source(Some(Mixer::shared_handle(&mixer).into()))
        .unwrap();

    assert_eq!(transport.length(), 1000);

    mixer.remove_source(short_id).unwrap();
    assert_eq!(transport.length(), 2000);
}

#[test]
fn test_device_player_plays_timeline_through_transport() {
    let timeline = Arc::new(ClipTimeline::new());
    let content = SharedSource::new(MemorySource::new(ramp_material(2, 512, 1.0)));
    // Clip at 128 playing content from sample 0.
    timeline.insert_clip(content, 128, 0, 512).unwrap();

    let transport = Arc::new(TransportSource::new());
    transport
        .set_source(Some(ClipTimeline::shared_handle(&timeline).into()))
        .unwrap();

    let mut player = SourcePlayer::new();
    player.set_source(Some(TransportSource::shared_handle(&transport)));

    let mut device = TestDevice::new();
    device.open(64, 44100.0).unwrap();
    device.start(Box::new(player)).unwrap();
    transport.play();

    let out = device.pump(4); // 256 samples

    // First 128 samples: before the clip, silence. After: the ramp.
    assert_eq!(out.magnitude(0, 0, 128), 0.0);
    assert_eq!(out.sample_at(0, 128), 1.0);
    assert_eq!(out.sample_at(1, 255), 128.0);
    assert_eq!(transport.position(), 256);

    device.stop();
    assert!(!transport.is_open());
}

#[test]
fn test_buffered_timeline_streams_identically_to_direct() {
    let build_timeline = || {
        let timeline = ClipTimeline::new();
        let a = SharedSource::new(MemorySource::new(ramp_material(2, 400, 1.0)));
        let b = SharedSource::new(MemorySource::new(ramp_material(2, 300, 1000.0)));
        timeline.insert_clip(a, 0, 50, 350).unwrap();
        timeline.insert_clip(b, 500, 0, 300).unwrap();
        timeline
    };

    let mut direct = build_timeline();
    direct.open(128, 44100.0).unwrap();
    let mut expected = SampleBuffer::new(2, 800);
    assert_eq!(direct.read(&mut expected, 0, 800, ChannelMask::NONE), 800);

    let mut buffered = BufferingSource::new(
        SourceHandle::Owned(Box::new(build_timeline())),
        BufferingConfig {
            read_ahead: 256,
            channels: 2,
        },
    );
    buffered.open(128, 44100.0).unwrap();
    let mut got = SampleBuffer::new(2, 800);
    assert_eq!(buffered.read(&mut got, 0, 800, ChannelMask::NONE), 800);

    for ch in 0..2 {
        for pos in 0..800 {
            assert_eq!(
                got.sample_at(ch, pos),
                expected.sample_at(ch, pos),
                "ch {ch} pos {pos}"
            );
        }
    }
}

#[test]
fn test_async_load_stalls_then_resumes_transport() {
    let timeline = Arc::new(AsyncClipTimeline::new());
    let (handle, loader) = FutureSource::create(1024);
    timeline.insert_clip(&handle, 0, 0, 1024).unwrap();

    let transport = Arc::new(TransportSource::new());
    timeline.set_transport_gate(Some(transport.buffering_gate()));
    transport
        .set_source(Some(AsyncClipTimeline::shared_handle(&timeline).into()))
        .unwrap();

    let mut player = SourcePlayer::new();
    player.set_source(Some(TransportSource::shared_handle(&transport)));

    let mut device = TestDevice::new();
    device.open(64, 44100.0).unwrap();
    device.start(Box::new(player)).unwrap();
    transport.play();

    // First block reads through to the timeline, which acquires the gate.
    let out = device.pump(1);
    assert_eq!(out.magnitude(0, 0, 64), 0.0);
    assert_eq!(transport.buffering_count(), 1);
    assert_eq!(transport.position(), 64);

    // Subsequent blocks are gated: silence, no advance.
    let out = device.pump(3);
    assert_eq!(out.magnitude(0, 0, 192), 0.0);
    assert_eq!(transport.position(), 64);

    // Loader finishes on its own thread; a control tick re-evaluates.
    let producer = std::thread::spawn(move || {
        loader.complete(Box::new(MemorySource::new(ramp_material(2, 1024, 1.0))));
    });
    producer.join().unwrap();
    timeline.update_readiness();
    assert_eq!(transport.buffering_count(), 0);

    // Playback resumes exactly where it stalled.
    let out = device.pump(1);
    assert_eq!(out.sample_at(0, 0), 65.0);
    assert_eq!(transport.position(), 128);
}
