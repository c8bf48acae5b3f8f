//! Boundaries of the external collaborators: linguistic front-end,
//! acoustic model and vocoder.
//!
//! The networks behind these traits are treated as pure functions. They are
//! shared read-only across concurrent synthesis jobs, hence `Send + Sync`.

use super::segmenter::UNTOKENIZABLE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Language tag selecting the front-end rules and the model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Japanese,
    English,
}

impl Language {
    pub fn tag(&self) -> &'static str {
        match self {
            Language::Japanese => "ja",
            Language::English => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown language tag: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ja" | "jp" | "ja-jp" | "japanese" => Ok(Language::Japanese),
            "en" | "en-us" | "en-gb" | "english" => Ok(Language::English),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// One phoneme (or sub-word unit) with its prosody hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: u32,
    pub phoneme: String,
    /// Pitch-accent mark from the front-end, if the language has one.
    pub accent: Option<i8>,
    /// Duration hint in frames. Models are free to ignore it.
    pub duration_hint: Option<f32>,
}

impl Token {
    pub fn new(id: u32, phoneme: impl Into<String>) -> Self {
        Self {
            id,
            phoneme: phoneme.into(),
            accent: None,
            duration_hint: None,
        }
    }
}

/// Tokens of exactly one text chunk. Read-only once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSequence {
    chunk_index: usize,
    tokens: Vec<Token>,
}

impl TokenSequence {
    pub fn new(chunk_index: usize, tokens: Vec<Token>) -> Self {
        Self {
            chunk_index,
            tokens,
        }
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Output of the acoustic encoder and variance adaptor, one entry per token.
#[derive(Debug, Clone, PartialEq)]
pub struct AcousticPrediction {
    /// Encoder hidden state per token.
    pub encoded: Vec<Vec<f32>>,
    /// Predicted duration per token, in (fractional) frames.
    pub durations: Vec<f32>,
    pub pitch: Option<Vec<f32>>,
    pub energy: Option<Vec<f32>>,
}

impl AcousticPrediction {
    /// Build a prediction from log-domain durations, as FastSpeech2-style
    /// duration predictors emit them (`d = exp(log_d) - 1`).
    pub fn from_log_durations(
        encoded: Vec<Vec<f32>>,
        log_durations: &[f32],
        pitch: Option<Vec<f32>>,
        energy: Option<Vec<f32>>,
    ) -> Self {
        Self {
            encoded,
            durations: log_durations.iter().map(|d| d.exp() - 1.0).collect(),
            pitch,
            energy,
        }
    }
}

/// Frame-rate features produced by the length regulator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpandedFeatures {
    pub hidden: Vec<Vec<f32>>,
    pub pitch: Option<Vec<f32>>,
    pub energy: Option<Vec<f32>>,
}

impl ExpandedFeatures {
    pub fn frame_count(&self) -> usize {
        self.hidden.len()
    }
}

/// Mel-spectrogram frames, each `mel_bins` wide.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpectrogramFrames {
    pub frames: Vec<Vec<f32>>,
}

impl SpectrogramFrames {
    pub fn new(frames: Vec<Vec<f32>>) -> Self {
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Text to phoneme tokens.
pub trait LinguisticFrontEnd: Send + Sync {
    /// Tokenize a chunk of text. Empty or unsupported-but-harmless input
    /// yields an empty vector; errors are reserved for input the front-end
    /// cannot process at all.
    fn tokenize(&self, text: &str, language: Language) -> anyhow::Result<Vec<Token>>;

    /// Number of tokens `text` would produce, used to size chunks.
    /// [`UNTOKENIZABLE`] when `tokenize` would fail.
    fn token_count(&self, text: &str, language: Language) -> usize {
        self.tokenize(text, language)
            .map_or(UNTOKENIZABLE, |tokens| tokens.len())
    }

    /// Phoneme symbols only, for inspection.
    fn phonemes(&self, text: &str, language: Language) -> anyhow::Result<Vec<String>> {
        Ok(self
            .tokenize(text, language)?
            .into_iter()
            .map(|t| t.phoneme)
            .collect())
    }
}

/// Tokens to mel-spectrogram frames, split around the length regulator.
pub trait AcousticModel: Send + Sync {
    /// Encoder pass: hidden states plus per-token duration, pitch and energy.
    fn predict(&self, tokens: &TokenSequence) -> anyhow::Result<AcousticPrediction>;

    /// Decoder pass over the frame-rate features.
    fn decode(&self, features: &ExpandedFeatures) -> anyhow::Result<SpectrogramFrames>;
}

/// Mel-spectrogram frames to interleaved PCM samples in [-1, 1].
pub trait Vocoder: Send + Sync {
    fn vocode(&self, frames: &SpectrogramFrames) -> anyhow::Result<Vec<f32>>;
}
