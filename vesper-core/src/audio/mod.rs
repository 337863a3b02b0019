//! Audio I/O seams and the cpal device backends.
//!
//! # Collaborator contracts
//!
//! The conversation layer never talks to a sound card directly. It sees:
//! - [`AudioInput`]: one fixed-size 16 kHz mono frame per call,
//! - [`AudioOutput`]: synchronous playback of 16-bit little-endian PCM,
//! - [`NoiseSuppressor`]: optional in-place cleanup of captured frames.
//!
//! # Real-time constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority. They
//! **must not** allocate, block, or perform I/O. Capture therefore only
//! down-mixes into a scratch buffer sized on the first callback and pushes
//! into an SPSC ring; playback only pops from one.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on several platforms. [`AudioCapture`] and
//! [`playback::PlaybackStream`] must be created and dropped on the same
//! thread; the engine does both inside its blocking control thread.

pub mod cue;
pub mod drain;
pub mod playback;
pub mod resample;
pub mod subsystem;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[allow(unused_imports)]
use tracing::{error, info, warn};

use crate::{
    buffering::{pcm::f32_to_sample, AudioConsumer, AudioProducer, Consumer, Producer},
    error::{Result, VesperError},
};
use resample::RateConverter;

/// Source of fixed-size microphone frames.
pub trait AudioInput {
    /// Fill `frame` completely with the next captured samples.
    ///
    /// # Errors
    /// `VesperError::CaptureUnderrun` when a full frame is not yet available;
    /// the caller backs off briefly and retries.
    fn capture_frame(&mut self, frame: &mut [i16]) -> Result<()>;
}

/// Speaker driver. All calls are synchronous and may block.
pub trait AudioOutput: Send + Sync {
    /// Play a complete clip and return once it has been handed to the device.
    fn play_buffer(&self, pcm: &[u8]) -> Result<()>;

    /// Queue one chunk of a longer stream.
    fn play_stream_chunk(&self, pcm: &[u8]) -> Result<()>;

    /// End of stream: let queued audio finish, then silence the output.
    fn stop_output(&self) -> Result<()>;
}

/// Frame-synchronous noise suppression.
pub trait NoiseSuppressor: Send {
    /// Samples per frame this suppressor expects.
    fn frame_len(&self) -> usize;

    /// Write the cleaned version of `input` into `output` (same length).
    fn process(&mut self, input: &[i16], output: &mut [i16]);
}

/// Handle to an active capture stream.
///
/// **Not `Send`** — keep it on the thread that opened it.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Set to `false` to make the callback a no-op.
    running: Arc<AtomicBool>,
    /// Device sample rate (Hz).
    pub sample_rate: u32,
}

/// Down-mix interleaved frames to mono and push them into the capture ring.
#[cfg(feature = "audio-cpal")]
fn push_mono<T: Copy>(
    data: &[T],
    channels: usize,
    scratch: &mut Vec<f32>,
    producer: &mut AudioProducer,
    to_f32: fn(T) -> f32,
) {
    let frames = data.len() / channels.max(1);
    scratch.resize(frames, 0.0);
    for (f, slot) in scratch.iter_mut().enumerate() {
        let base = f * channels;
        let sum: f32 = data[base..base + channels].iter().map(|s| to_f32(*s)).sum();
        *slot = sum / channels as f32;
    }
    let written = producer.push_slice(scratch);
    if written < scratch.len() {
        warn!(dropped = scratch.len() - written, "capture ring full");
    }
}

impl AudioCapture {
    /// Open an input device by preferred name, falling back to the default
    /// input device and then the first one listed.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected = None;

        if let Some(preferred) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected = devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if selected.is_none() {
                        warn!(preferred, "preferred input device not found, falling back");
                    }
                }
                Err(e) => warn!("failed to list input devices: {e}"),
            }
        }

        let device = match selected.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| VesperError::AudioDevice(e.to_string()))?;
                warn!("no default input device, using first available input");
                devices.next().ok_or(VesperError::NoDefaultInputDevice)?
            }
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VesperError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let ch = channels as usize;
        let gate = Arc::clone(&running);
        let mut scratch: Vec<f32> = Vec::new();
        let on_error = |err| error!("capture stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if gate.load(Ordering::Relaxed) {
                        push_mono(data, ch, &mut scratch, &mut producer, |s| s);
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    if gate.load(Ordering::Relaxed) {
                        push_mono(data, ch, &mut scratch, &mut producer, |s| {
                            s as f32 / 32768.0
                        });
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                &config,
                move |data: &[u8], _info| {
                    if gate.load(Ordering::Relaxed) {
                        push_mono(data, ch, &mut scratch, &mut producer, |s| {
                            (s as f32 - 128.0) / 128.0
                        });
                    }
                },
                on_error,
                None,
            ),
            fmt => {
                return Err(VesperError::AudioStream(format!(
                    "unsupported capture sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VesperError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| VesperError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    /// Signal the callback to no-op on its next invocation.
    #[cfg(feature = "audio-cpal")]
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(VesperError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Samples popped from the capture ring per call.
const CAPTURE_DRAIN: usize = 960;

/// [`AudioInput`] over a capture ring: resamples to the conversation rate and
/// hands out exact frames.
pub struct RingInput {
    consumer: AudioConsumer,
    converter: RateConverter,
    raw: Vec<f32>,
    pending: VecDeque<i16>,
}

impl RingInput {
    pub fn new(consumer: AudioConsumer, device_rate: u32, target_rate: u32) -> Result<Self> {
        Ok(Self {
            consumer,
            converter: RateConverter::new(device_rate, target_rate, CAPTURE_DRAIN)?,
            raw: vec![0.0; CAPTURE_DRAIN],
            pending: VecDeque::new(),
        })
    }
}

impl AudioInput for RingInput {
    fn capture_frame(&mut self, frame: &mut [i16]) -> Result<()> {
        while self.pending.len() < frame.len() {
            let n = self.consumer.pop_slice(&mut self.raw);
            if n == 0 {
                return Err(VesperError::CaptureUnderrun);
            }
            let converted = self.converter.process(&self.raw[..n]);
            self.pending
                .extend(converted.into_iter().map(f32_to_sample));
        }
        let len = frame.len();
        for (slot, sample) in frame.iter_mut().zip(self.pending.drain(..len)) {
            *slot = sample;
        }
        Ok(())
    }
}

/// Owns the capture stream together with the input that reads from it, so
/// both are dropped on the same thread.
pub struct DeviceInput {
    capture: AudioCapture,
    input: RingInput,
}

impl DeviceInput {
    /// Open the microphone and prepare 16-bit frames at `target_rate`.
    pub fn open(
        preferred_device_name: Option<&str>,
        target_rate: u32,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (producer, consumer) = crate::buffering::create_audio_ring();
        let capture = AudioCapture::open_with_preference(producer, running, preferred_device_name)?;
        let input = RingInput::new(consumer, capture.sample_rate, target_rate)?;
        Ok(Self { capture, input })
    }

    pub fn device_rate(&self) -> u32 {
        self.capture.sample_rate
    }
}

impl AudioInput for DeviceInput {
    fn capture_frame(&mut self, frame: &mut [i16]) -> Result<()> {
        self.input.capture_frame(frame)
    }
}

impl Drop for DeviceInput {
    fn drop(&mut self) {
        self.capture.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::create_audio_ring;

    #[test]
    fn ring_input_underruns_until_a_full_frame_is_buffered() {
        let (mut producer, consumer) = create_audio_ring();
        let mut input = RingInput::new(consumer, 16_000, 16_000).unwrap();
        let mut frame = [0i16; 480];

        assert!(matches!(
            input.capture_frame(&mut frame),
            Err(VesperError::CaptureUnderrun)
        ));

        producer.push_slice(&[0.5f32; 300]);
        assert!(input.capture_frame(&mut frame).is_err());
        producer.push_slice(&[0.5f32; 300]);
        input.capture_frame(&mut frame).unwrap();
        assert!(frame.iter().all(|s| *s == f32_to_sample(0.5)));
    }

    #[test]
    fn ring_input_keeps_leftover_samples_for_the_next_frame() {
        let (mut producer, consumer) = create_audio_ring();
        let mut input = RingInput::new(consumer, 16_000, 16_000).unwrap();
        let ramp: Vec<f32> = (0..6).map(|i| i as f32 / 10.0).collect();
        producer.push_slice(&ramp);

        let mut frame = [0i16; 4];
        input.capture_frame(&mut frame).unwrap();
        assert_eq!(frame[0], 0);
        let mut second = [0i16; 2];
        input.capture_frame(&mut second).unwrap();
        assert_eq!(second, [f32_to_sample(0.4), f32_to_sample(0.5)]);
    }
}
