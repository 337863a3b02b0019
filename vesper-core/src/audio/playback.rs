//! Speaker output: a cpal output stream fed from an SPSC ring.
//!
//! [`SpeakerSink`] is the `Send + Sync` half handed to the drain thread and
//! the conversation; it converts 16-bit PCM to f32, resamples to the device
//! rate and pushes into the ring. [`PlaybackStream`] owns the `!Send` cpal
//! stream whose callback pops from the same ring.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{resample::RateConverter, AudioOutput};
use crate::buffering::{pcm::sample_to_f32, AudioProducer, Observer, Producer};
#[cfg(feature = "audio-cpal")]
use crate::buffering::{AudioConsumer, Consumer};
use crate::error::{Result, VesperError};

/// Samples resampled per block on the playback side (20 ms at 16 kHz).
const PLAYBACK_BLOCK: usize = 320;
const PUSH_RETRY: Duration = Duration::from_millis(5);

/// Upper bound on how long a single push or drain wait may block.
pub const DEFAULT_OUTPUT_TIMEOUT: Duration = Duration::from_secs(2);

/// Producer side of the speaker ring.
pub struct SpeakerSink {
    producer: Mutex<AudioProducer>,
    converter: Mutex<RateConverter>,
    /// Raised by `stop_output`; the callback empties the ring and lowers it.
    flush: Arc<AtomicBool>,
    source_rate: u32,
    device_rate: u32,
    timeout: Duration,
}

impl SpeakerSink {
    pub fn new(
        producer: AudioProducer,
        source_rate: u32,
        device_rate: u32,
        flush: Arc<AtomicBool>,
    ) -> Result<Self> {
        Ok(Self {
            producer: Mutex::new(producer),
            converter: Mutex::new(RateConverter::new(source_rate, device_rate, PLAYBACK_BLOCK)?),
            flush,
            source_rate,
            device_rate,
            timeout: DEFAULT_OUTPUT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Samples queued for the device but not yet consumed.
    pub fn queued(&self) -> usize {
        self.producer.lock().occupied_len()
    }

    fn push_all(&self, mut samples: &[f32]) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while !samples.is_empty() {
            let pushed = self.producer.lock().push_slice(samples);
            samples = &samples[pushed..];
            if samples.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(VesperError::Output(format!(
                    "speaker ring stalled with {} samples pending",
                    samples.len()
                )));
            }
            thread::sleep(PUSH_RETRY);
        }
        Ok(())
    }

    fn enqueue(&self, pcm: &[u8]) -> Result<()> {
        let floats: Vec<f32> = pcm
            .chunks_exact(2)
            .map(|b| sample_to_f32(i16::from_le_bytes([b[0], b[1]])))
            .collect();
        let converted = self.converter.lock().process(&floats);
        self.push_all(&converted)
    }

    fn flush_converter(&self) -> Result<()> {
        let tail = self.converter.lock().flush();
        self.push_all(&tail)
    }

    /// Play time of `bytes` of 16-bit PCM at the source rate.
    fn clip_duration(&self, bytes: usize) -> Duration {
        Duration::from_millis((bytes / 2) as u64 * 1000 / u64::from(self.source_rate.max(1)))
    }

    /// Block until the device has consumed everything queued, or the timeout
    /// elapses. Returns `true` when the ring emptied.
    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queued() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(PUSH_RETRY);
        }
    }
}

impl AudioOutput for SpeakerSink {
    fn play_buffer(&self, pcm: &[u8]) -> Result<()> {
        if pcm.len() < 2 {
            return Err(VesperError::NothingToPlay);
        }
        self.enqueue(pcm)?;
        self.flush_converter()?;
        if !self.wait_drained(self.clip_duration(pcm.len()) + self.timeout) {
            return Err(VesperError::Output("clip did not finish playing".into()));
        }
        Ok(())
    }

    fn play_stream_chunk(&self, pcm: &[u8]) -> Result<()> {
        self.enqueue(pcm)
    }

    fn stop_output(&self) -> Result<()> {
        self.flush_converter()?;
        if !self.wait_drained(self.timeout) {
            warn!(queued = self.queued(), "speaker did not drain, discarding remainder");
        }
        self.flush.store(true, Ordering::Release);
        Ok(())
    }
}

/// Fill an interleaved output buffer from the mono ring.
#[cfg(feature = "audio-cpal")]
fn fill_output<T: Copy>(
    data: &mut [T],
    channels: usize,
    consumer: &mut AudioConsumer,
    flush: &AtomicBool,
    silence: T,
    from_f32: fn(f32) -> T,
) {
    if flush.swap(false, Ordering::AcqRel) {
        consumer.clear();
    }
    for frame in data.chunks_mut(channels.max(1)) {
        let value = consumer.try_pop().map(from_f32).unwrap_or(silence);
        frame.fill(value);
    }
}

/// Handle to the running output stream.
///
/// **Not `Send`** — drop it on the thread that opened it.
pub struct PlaybackStream {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    pub sample_rate: u32,
}

impl PlaybackStream {
    /// Open the preferred (or default) output device and return the stream
    /// handle plus the sink that feeds it with `source_rate` PCM.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        preferred_device_name: Option<&str>,
        source_rate: u32,
    ) -> Result<(Self, Arc<SpeakerSink>)> {
        let host = cpal::default_host();
        let preferred = preferred_device_name.and_then(|name| {
            let found = host
                .output_devices()
                .ok()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false));
            if found.is_none() {
                warn!(preferred = name, "preferred output device not found, falling back");
            }
            found
        });
        let device = preferred
            .or_else(|| host.default_output_device())
            .ok_or(VesperError::NoDefaultOutputDevice)?;

        let supported = device
            .default_output_config()
            .map_err(|e| VesperError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let config = supported.config();
        debug!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate,
            channels,
            "opening output device"
        );

        let (producer, mut consumer) = crate::buffering::create_audio_ring();
        let flush = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&flush);
        let on_error = |err| tracing::error!("playback stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    fill_output(data, channels, &mut consumer, &gate, 0.0, |s| s)
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    fill_output(
                        data,
                        channels,
                        &mut consumer,
                        &gate,
                        0,
                        crate::buffering::pcm::f32_to_sample,
                    )
                },
                on_error,
                None,
            ),
            fmt => {
                return Err(VesperError::AudioStream(format!(
                    "unsupported playback sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VesperError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| VesperError::AudioStream(e.to_string()))?;

        let sink = SpeakerSink::new(producer, source_rate, sample_rate, flush)?;
        Ok((
            Self {
                _stream: stream,
                sample_rate,
            },
            Arc::new(sink),
        ))
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(
        _preferred_device_name: Option<&str>,
        _source_rate: u32,
    ) -> Result<(Self, Arc<SpeakerSink>)> {
        Err(VesperError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
