//! Deterministic stand-ins for the neural collaborators.
//!
//! These let the whole pipeline run without model weights: one token per
//! grapheme, durations by token class, and a vocoder that renders each frame
//! as a short sine burst at the predicted pitch.

use super::model::{
    AcousticModel, AcousticPrediction, ExpandedFeatures, Language, LinguisticFrontEnd,
    SpectrogramFrames, Token, TokenSequence, Vocoder,
};
use anyhow::{anyhow, bail};
use unicode_segmentation::UnicodeSegmentation;

/// Phoneme emitted for punctuation and symbols.
pub const PAUSE: &str = "pau";
const PAUSE_ID: u32 = 0;

const PAUSE_FRAMES: f32 = 8.0;
const VOWEL_FRAMES: f32 = 6.0;
const CONSONANT_FRAMES: f32 = 4.0;

fn is_vowel(phoneme: &str) -> bool {
    matches!(
        phoneme,
        "a" | "e" | "i" | "o" | "u" | "あ" | "い" | "う" | "え" | "お" | "ア" | "イ" | "ウ" | "エ" | "オ"
    )
}

/// Front-end producing one token per non-whitespace grapheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphemeFrontEnd;

impl LinguisticFrontEnd for GraphemeFrontEnd {
    fn tokenize(&self, text: &str, language: Language) -> anyhow::Result<Vec<Token>> {
        let mut tokens = Vec::new();
        for grapheme in text.graphemes(true) {
            if grapheme.chars().all(char::is_whitespace) {
                continue;
            }
            if let Some(c) = grapheme.chars().find(|c| c.is_control()) {
                bail!("Unsupported control character U+{:04X}", c as u32);
            }

            if !grapheme.chars().any(char::is_alphanumeric) {
                tokens.push(Token::new(PAUSE_ID, PAUSE));
                continue;
            }

            let phoneme = match language {
                Language::English => grapheme.to_lowercase(),
                Language::Japanese => grapheme.to_string(),
            };
            let id = phoneme
                .chars()
                .fold(0u32, |acc, c| acc.wrapping_mul(31).wrapping_add(c as u32))
                % 997
                + 1;
            let mut token = Token::new(id, phoneme);
            if language == Language::Japanese {
                token.accent = Some(0);
            }
            tokens.push(token);
        }
        Ok(tokens)
    }
}

/// Acoustic model predicting log-domain durations from the token class.
#[derive(Debug, Clone)]
pub struct PlaceholderAcoustic {
    mel_bins: usize,
}

impl PlaceholderAcoustic {
    pub fn new(mel_bins: usize) -> Self {
        Self { mel_bins }
    }
}

impl AcousticModel for PlaceholderAcoustic {
    fn predict(&self, tokens: &TokenSequence) -> anyhow::Result<AcousticPrediction> {
        let mut encoded = Vec::with_capacity(tokens.len());
        let mut log_durations = Vec::with_capacity(tokens.len());
        let mut pitch = Vec::with_capacity(tokens.len());
        let mut energy = Vec::with_capacity(tokens.len());

        for token in tokens.tokens() {
            let frames = match token.duration_hint {
                Some(hint) => hint,
                None if token.id == PAUSE_ID => PAUSE_FRAMES,
                None if is_vowel(&token.phoneme) => VOWEL_FRAMES,
                None => CONSONANT_FRAMES,
            };
            log_durations.push((frames + 1.0).ln());
            encoded.push(vec![token.id as f32]);
            pitch.push(120.0 + (token.id % 40) as f32);
            energy.push(if token.id == PAUSE_ID { 0.0 } else { 0.5 });
        }

        Ok(AcousticPrediction::from_log_durations(
            encoded,
            &log_durations,
            Some(pitch),
            Some(energy),
        ))
    }

    /// Frame layout: bin 0 carries pitch in Hz, bin 1 the amplitude.
    fn decode(&self, features: &ExpandedFeatures) -> anyhow::Result<SpectrogramFrames> {
        let frame_count = features.frame_count();
        let pitch = features
            .pitch
            .as_ref()
            .ok_or_else(|| anyhow!("Decoder requires a pitch contour"))?;
        if pitch.len() != frame_count {
            bail!("Pitch contour has {} frames, expected {}", pitch.len(), frame_count);
        }

        let frames = (0..frame_count)
            .map(|i| {
                let mut frame = vec![0.0; self.mel_bins];
                if let Some(bin) = frame.get_mut(0) {
                    *bin = pitch[i];
                }
                if let Some(bin) = frame.get_mut(1) {
                    *bin = features.energy.as_ref().map_or(0.5, |e| e[i]);
                }
                frame
            })
            .collect();
        Ok(SpectrogramFrames::new(frames))
    }
}

/// Vocoder rendering `hop_size` samples per frame and channel.
#[derive(Debug, Clone)]
pub struct SineVocoder {
    sample_rate: u32,
    channels: u16,
    hop_size: usize,
}

impl SineVocoder {
    pub fn new(sample_rate: u32, channels: u16, hop_size: usize) -> Self {
        Self {
            sample_rate,
            channels,
            hop_size,
        }
    }
}

impl Vocoder for SineVocoder {
    fn vocode(&self, frames: &SpectrogramFrames) -> anyhow::Result<Vec<f32>> {
        let channels = self.channels as usize;
        let mut samples = Vec::with_capacity(frames.len() * self.hop_size * channels);
        // Phase carries over between frames so pitch changes do not click.
        let mut phase = 0.0f32;
        let step = 2.0 * std::f32::consts::PI / self.sample_rate as f32;

        for frame in &frames.frames {
            let frequency = frame.first().copied().unwrap_or(0.0);
            let amplitude = frame.get(1).copied().unwrap_or(0.0) * 0.6;
            for _ in 0..self.hop_size {
                let value = phase.sin() * amplitude;
                samples.extend(std::iter::repeat(value).take(channels));
                phase = (phase + frequency * step) % (2.0 * std::f32::consts::PI);
            }
        }

        Ok(samples)
    }
}
