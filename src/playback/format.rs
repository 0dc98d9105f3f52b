use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    F32,
    I16,
}

/// Layout of interleaved PCM audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn f32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::F32,
        }
    }

    pub fn i16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::I16,
        }
    }

    /// Duration of `frames` frames at this sample rate
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz / {} ch / {:?}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}

/// Interleaved sample payload
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::F32(s) => s.len(),
            Samples::I16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode to f32 in [-1.0, 1.0]
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Samples::F32(s) => s.clone(),
            Samples::I16(s) => s.iter().map(|&v| v as f32 / 32768.0).collect(),
        }
    }
}

/// A block of audio produced by a synthesis backend
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    sample_rate: u32,
    channels: u16,
    samples: Samples,
}

impl PlaybackBuffer {
    pub fn from_f32(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            samples: Samples::F32(samples),
        }
    }

    pub fn from_i16(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            channels,
            samples: Samples::I16(samples),
        }
    }

    pub fn format(&self) -> AudioFormat {
        let sample_format = match self.samples {
            Samples::F32(_) => SampleFormat::F32,
            Samples::I16(_) => SampleFormat::I16,
        };
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format,
        }
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    /// Number of frames, ignoring a trailing partial frame
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        self.format().frames_to_duration(self.frames() as u64)
    }

    /// Take the samples as f32, decoding if needed
    pub fn into_f32(self) -> Vec<f32> {
        match self.samples {
            Samples::F32(s) => s,
            other => other.to_f32(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_follows_payload() {
        let a = PlaybackBuffer::from_f32(48000, 2, vec![0.0; 8]);
        let b = PlaybackBuffer::from_i16(22050, 1, vec![0; 8]);

        assert_eq!(a.format(), AudioFormat::f32(48000, 2));
        assert_eq!(b.format(), AudioFormat::i16(22050, 1));
        assert_eq!(a.frames(), 4);
        assert_eq!(b.frames(), 8);
    }

    #[test]
    fn test_duration() {
        let buffer = PlaybackBuffer::from_f32(48000, 2, vec![0.0; 96000]);
        assert_eq!(buffer.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_i16_decoding() {
        let buffer = PlaybackBuffer::from_i16(16000, 1, vec![i16::MIN, 0, 16384]);
        assert_eq!(buffer.into_f32(), vec![-1.0, 0.0, 0.5]);
    }
}
