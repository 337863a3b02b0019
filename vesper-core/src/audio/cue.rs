//! Short local prompt clips (greeting, farewell) loaded from WAV files.

use std::io::{Read, Seek};
use std::path::Path;

use tracing::{debug, info};

use super::resample::RateConverter;
use crate::buffering::pcm::{f32_to_sample, samples_to_bytes};
use crate::error::{Result, VesperError};

/// A prompt clip as 16-bit little-endian mono PCM at the conversation rate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cue {
    pcm: Vec<u8>,
}

impl Cue {
    pub fn from_pcm(pcm: Vec<u8>) -> Self {
        Self { pcm }
    }

    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    /// Decode a WAV stream, down-mix to mono and convert to `target_rate`.
    pub fn from_reader<R: Read + Seek>(reader: R, target_rate: u32) -> Result<Self> {
        let mut reader = hound::WavReader::new(reader)
            .map_err(|e| VesperError::Config(format!("invalid cue wav: {e}")))?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>(),
            hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect(),
            hound::SampleFormat::Int => {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect()
            }
        }
        .map_err(|e| VesperError::Config(format!("cue wav decode: {e}")))?;

        let mono: Vec<f32> = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        let converted = if spec.sample_rate == target_rate {
            mono
        } else {
            let mut converter = RateConverter::new(spec.sample_rate, target_rate, 1024)?;
            let mut out = converter.process(&mono);
            out.extend(converter.flush());
            out
        };

        let samples: Vec<i16> = converted.into_iter().map(f32_to_sample).collect();
        Ok(Self::from_pcm(samples_to_bytes(&samples)))
    }

    pub fn open(path: &Path, target_rate: u32) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let cue = Self::from_reader(std::io::BufReader::new(file), target_rate)?;
        info!(path = %path.display(), bytes = cue.pcm.len(), "cue loaded");
        Ok(cue)
    }

    /// Like [`Cue::open`], but a missing or unreadable file yields `None`.
    pub fn open_optional(path: &Path, target_rate: u32) -> Option<Self> {
        match Self::open(path, target_rate) {
            Ok(cue) => Some(cue),
            Err(e) => {
                debug!(path = %path.display(), "cue skipped: {e}");
                None
            }
        }
    }
}

/// The clips the conversation plays on its own.
#[derive(Debug, Clone, Default)]
pub struct Cues {
    pub greeting: Option<Cue>,
    pub farewell: Option<Cue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav(channels: u16, rate: u32, samples: &[i16]) -> Cursor<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let spec = hound::WavSpec {
                channels,
                sample_rate: rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let cue = Cue::from_reader(wav(2, 16_000, &[16_384, 0, 16_384, 0]), 16_000).unwrap();
        assert_eq!(cue.pcm().len(), 4);
        let first = i16::from_le_bytes([cue.pcm()[0], cue.pcm()[1]]);
        assert_eq!(first, f32_to_sample(0.25));
    }

    #[test]
    fn other_rates_are_converted() {
        let cue = Cue::from_reader(wav(1, 48_000, &[0; 4800]), 16_000).unwrap();
        let samples = cue.pcm().len() / 2;
        assert!((1500..=1800).contains(&samples), "samples={samples}");
    }

    #[test]
    fn missing_file_is_optional() {
        assert!(Cue::open_optional(Path::new("/nonexistent/greeting.wav"), 16_000).is_none());
    }
}
