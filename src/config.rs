//! Pipeline configuration
//!
//! Defaults, then an optional JSON file, then `CHUNKED_TTS_*` environment
//! variables.

use crate::tts::{AudioFormat, SynthesisLimits};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "CHUNKED_TTS_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {value:?}")]
    InvalidOverride { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Acoustic model sequence limit, in front-end tokens.
    pub max_tokens_per_chunk: usize,
    /// Chunks synthesized at once.
    pub max_concurrency: usize,
    /// How far past the playing chunk synthesis may run.
    pub lookahead: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Samples per mel frame, per channel.
    pub hop_size: usize,
    pub mel_bins: usize,
    /// Upper bound on regulated frames per chunk.
    pub max_frames: usize,
    pub stage_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: 500,
            max_concurrency: 2,
            lookahead: 2,
            sample_rate: 22050,
            channels: 1,
            bits_per_sample: 16,
            hop_size: 256,
            mel_bins: 80,
            max_frames: 5000,
            stage_timeout_ms: None,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}

impl PipelineConfig {
    /// `~/.config/chunked-tts/config.json` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chunked-tts").join("config.json"))
    }

    /// Load from `path` (or the default path if it exists), apply the
    /// environment and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `CHUNKED_TTS_<FIELD>` pairs; other keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref();
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "MAX_TOKENS_PER_CHUNK" => self.max_tokens_per_chunk = parse(key, value)?,
                "MAX_CONCURRENCY" => self.max_concurrency = parse(key, value)?,
                "LOOKAHEAD" => self.lookahead = parse(key, value)?,
                "SAMPLE_RATE" => self.sample_rate = parse(key, value)?,
                "CHANNELS" => self.channels = parse(key, value)?,
                "BITS_PER_SAMPLE" => self.bits_per_sample = parse(key, value)?,
                "HOP_SIZE" => self.hop_size = parse(key, value)?,
                "MEL_BINS" => self.mel_bins = parse(key, value)?,
                "MAX_FRAMES" => self.max_frames = parse(key, value)?,
                "STAGE_TIMEOUT_MS" => {
                    self.stage_timeout_ms = match value.trim() {
                        "" | "none" | "off" => None,
                        ms => Some(parse(key, ms)?),
                    }
                }
                _ => log::warn!("[Config] ignoring unknown variable {}", key),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_tokens_per_chunk", self.max_tokens_per_chunk),
            ("max_concurrency", self.max_concurrency),
            ("lookahead", self.lookahead),
            ("sample_rate", self.sample_rate as usize),
            ("channels", usize::from(self.channels)),
            ("hop_size", self.hop_size),
            ("mel_bins", self.mel_bins),
            ("max_frames", self.max_frames),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 32) {
            return Err(ConfigError::Invalid(format!(
                "bits_per_sample must be 8, 16 or 32, got {}",
                self.bits_per_sample
            )));
        }
        if self.stage_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "stage_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.bits_per_sample)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }

    pub fn synthesis_limits(&self) -> SynthesisLimits {
        SynthesisLimits {
            hop_size: self.hop_size,
            mel_bins: self.mel_bins,
            max_frames: self.max_frames,
            stage_timeout: self.stage_timeout(),
        }
    }
}
