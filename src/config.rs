//! Configuration for the speech stack
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes.

use crate::playback::device::ClaimMode;
use crate::playback::format::AudioFormat;
use crate::playback::output::{Pacing, OUTPUT_QUEUE_CAPACITY};
use crate::{MurmurError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the complete stack
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub engine: EngineConfig,
    pub tone: ToneConfig,
    pub service: ServiceConfig,
    pub output: OutputKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Native output sample rate
    pub sample_rate: u32,

    /// Native output channel count
    pub channels: u16,

    /// Capacity of the engine inbox shared by commands and completions
    pub inbox_capacity: usize,

    /// Frames per block handed to the spectrum publisher
    pub tap_block_frames: usize,

    /// Buffers handed to the output at once; the rest wait in the session
    /// backlog
    pub stream_window: usize,

    pub claim_mode: ClaimMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            inbox_capacity: 256,
            tap_block_frames: 1024,
            stream_window: 16,
            claim_mode: ClaimMode::Exclusive,
        }
    }
}

impl EngineConfig {
    pub fn native_format(&self) -> AudioFormat {
        AudioFormat::f32(self.sample_rate, self.channels)
    }
}

/// Tone synthesis parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    /// Rate the tones are rendered at before conversion
    pub source_sample_rate: u32,

    /// Tone length per word at rate 1.0
    pub word_ms: u32,

    /// Silence after each word at rate 1.0
    pub gap_ms: u32,

    /// Tone frequency at pitch 1.0
    pub base_frequency: f32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 22050,
            word_ms: 180,
            gap_ms: 60,
            base_frequency: 220.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Capacity of the orchestrator command queue
    pub command_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
        }
    }
}

/// Where audio goes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputKind {
    /// System output device; the default device when `name` is unset
    Device {
        #[serde(default)]
        name: Option<String>,
    },
    /// Headless output
    Virtual {
        #[serde(default)]
        pacing: Pacing,
    },
}

impl Default for OutputKind {
    fn default() -> Self {
        OutputKind::Device { name: None }
    }
}

impl SpeechConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MurmurError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SpeechConfig = toml::from_str(content)
            .map_err(|e| MurmurError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_tone(mut self, tone: ToneConfig) -> Self {
        self.tone = tone;
        self
    }

    pub fn with_output(mut self, output: OutputKind) -> Self {
        self.output = output;
        self
    }

    /// Headless output with the given pacing
    pub fn headless(self, pacing: Pacing) -> Self {
        self.with_output(OutputKind::Virtual { pacing })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.sample_rate == 0 {
            return Err(MurmurError::ConfigError(
                "engine.sample_rate must be positive".into(),
            ));
        }
        if engine.channels == 0 {
            return Err(MurmurError::ConfigError(
                "engine.channels must be positive".into(),
            ));
        }
        if engine.inbox_capacity == 0 || engine.tap_block_frames == 0 {
            return Err(MurmurError::ConfigError(
                "engine.inbox_capacity and engine.tap_block_frames must be positive".into(),
            ));
        }
        if !(1..=OUTPUT_QUEUE_CAPACITY).contains(&engine.stream_window) {
            return Err(MurmurError::ConfigError(format!(
                "engine.stream_window must be between 1 and {}",
                OUTPUT_QUEUE_CAPACITY
            )));
        }

        let tone = &self.tone;
        if tone.source_sample_rate == 0 || tone.word_ms == 0 {
            return Err(MurmurError::ConfigError(
                "tone.source_sample_rate and tone.word_ms must be positive".into(),
            ));
        }
        if !(tone.base_frequency > 0.0 && tone.base_frequency * 2.0 < tone.source_sample_rate as f32)
        {
            return Err(MurmurError::ConfigError(format!(
                "tone.base_frequency {} is outside the audible range of {} Hz audio",
                tone.base_frequency, tone.source_sample_rate
            )));
        }

        if self.service.command_capacity == 0 {
            return Err(MurmurError::ConfigError(
                "service.command_capacity must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpeechConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.native_format(), AudioFormat::f32(48000, 2));
        assert_eq!(config.tone.source_sample_rate, 22050);
        assert_eq!(config.output, OutputKind::Device { name: None });
    }

    #[test]
    fn test_partial_toml() {
        let toml_str = r#"
            [engine]
            sample_rate = 44100
            claim_mode = "shared"

            [output]
            kind = "virtual"
            pacing = "manual"
        "#;

        let config = SpeechConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.engine.sample_rate, 44100);
        assert_eq!(config.engine.channels, 2);
        assert_eq!(config.engine.claim_mode, ClaimMode::Shared);
        assert_eq!(
            config.output,
            OutputKind::Virtual {
                pacing: Pacing::Manual
            }
        );
        assert_eq!(config.tone, ToneConfig::default());
    }

    #[test]
    fn test_named_device() {
        let config = SpeechConfig::from_toml_str(
            r#"
            [output]
            kind = "device"
            name = "Speakers"
        "#,
        )
        .unwrap();
        assert_eq!(
            config.output,
            OutputKind::Device {
                name: Some("Speakers".into())
            }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SpeechConfig::from_toml_str("[engine]\nchannels = 0\n").unwrap_err();
        assert!(matches!(err, MurmurError::ConfigError(_)));

        let err = SpeechConfig::from_toml_str("[engine]\nstream_window = 0\n").unwrap_err();
        assert!(matches!(err, MurmurError::ConfigError(_)));

        let config = SpeechConfig::default().with_tone(ToneConfig {
            base_frequency: 20000.0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(SpeechConfig::from_toml_str("engine = [").is_err());
    }

    #[test]
    fn test_builder() {
        let config = SpeechConfig::default().headless(Pacing::Realtime);
        assert_eq!(
            config.output,
            OutputKind::Virtual {
                pacing: Pacing::Realtime
            }
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = SpeechConfig::load("/nonexistent/murmur.toml").unwrap_err();
        assert!(matches!(err, MurmurError::ConfigError(_)));
    }
}
