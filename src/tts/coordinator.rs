//! Chunk synthesis coordinator
//!
//! Drives one text chunk through tokenization, acoustic inference (with the
//! length regulator between encoder and decoder) and vocoding. Every stage
//! runs on the blocking pool so the scheduler's task never stalls.

use super::audio::{AudioBuffer, AudioFormat};
use super::model::{
    AcousticModel, AcousticPrediction, ExpandedFeatures, Language, LinguisticFrontEnd,
    SpectrogramFrames, TokenSequence, Vocoder,
};
use super::segmenter::TextChunk;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Tokenize,
    Acoustic,
    Vocode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Tokenize => "tokenization",
            Stage::Acoustic => "acoustic-inference",
            Stage::Vocode => "vocoding",
        })
    }
}

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Tokenization failed: {0}")]
    Tokenization(#[source] BoxError),
    #[error("Acoustic inference failed: {0}")]
    AcousticInference(#[source] BoxError),
    #[error("Vocoder inference failed: {0}")]
    VocoderInference(#[source] BoxError),
}

impl SynthesisError {
    pub fn at(stage: Stage, source: impl Into<BoxError>) -> Self {
        match stage {
            Stage::Tokenize => SynthesisError::Tokenization(source.into()),
            Stage::Acoustic => SynthesisError::AcousticInference(source.into()),
            Stage::Vocode => SynthesisError::VocoderInference(source.into()),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            SynthesisError::Tokenization(_) => Stage::Tokenize,
            SynthesisError::AcousticInference(_) => Stage::Acoustic,
            SynthesisError::VocoderInference(_) => Stage::Vocode,
        }
    }
}

#[derive(Error, Debug)]
#[error("{stage} timed out after {after:?}")]
pub struct StageTimeout {
    pub stage: Stage,
    pub after: Duration,
}

/// Model output that does not have the shape the next stage needs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{what} has {actual} entries, expected {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Regulated length of {frames} frames exceeds the limit of {limit}")]
    TooManyFrames { frames: usize, limit: usize },
    #[error("Decoder returned {actual} frames, expected {expected}")]
    FrameCount { expected: usize, actual: usize },
    #[error("Frame {frame} has {actual} mel bins, expected {expected}")]
    MelWidth {
        frame: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Vocoder returned {actual} samples, expected {expected}")]
    SampleCount { expected: usize, actual: usize },
}

/// Frames for one token: round half up, at least one frame.
pub fn frames_for_duration(duration: f32) -> usize {
    // Float-to-int casts saturate and map NaN to 0, so garbage still lands on 1.
    ((duration + 0.5).floor() as usize).max(1)
}

fn repeat_by<T: Clone>(values: &[T], counts: &[usize], total: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(total);
    for (value, &n) in values.iter().zip(counts) {
        out.extend(std::iter::repeat(value).take(n).cloned());
    }
    out
}

/// Length regulator: repeat each token's features by its frame count.
pub fn regulate_length(
    prediction: &AcousticPrediction,
    max_frames: usize,
) -> Result<ExpandedFeatures, ShapeError> {
    let tokens = prediction.durations.len();
    let check = |what: &'static str, actual: usize| {
        if actual == tokens {
            Ok(())
        } else {
            Err(ShapeError::LengthMismatch {
                what,
                expected: tokens,
                actual,
            })
        }
    };
    check("Encoder output", prediction.encoded.len())?;
    if let Some(pitch) = &prediction.pitch {
        check("Pitch contour", pitch.len())?;
    }
    if let Some(energy) = &prediction.energy {
        check("Energy contour", energy.len())?;
    }

    let counts: Vec<usize> = prediction
        .durations
        .iter()
        .map(|&d| frames_for_duration(d))
        .collect();
    let total = counts.iter().fold(0usize, |acc, &n| acc.saturating_add(n));
    if total > max_frames {
        return Err(ShapeError::TooManyFrames {
            frames: total,
            limit: max_frames,
        });
    }

    Ok(ExpandedFeatures {
        hidden: repeat_by(&prediction.encoded, &counts, total),
        pitch: prediction.pitch.as_deref().map(|p| repeat_by(p, &counts, total)),
        energy: prediction.energy.as_deref().map(|e| repeat_by(e, &counts, total)),
    })
}

fn check_spectrogram(
    frames: &SpectrogramFrames,
    expected_frames: usize,
    mel_bins: usize,
) -> Result<(), ShapeError> {
    if frames.len() != expected_frames {
        return Err(ShapeError::FrameCount {
            expected: expected_frames,
            actual: frames.len(),
        });
    }
    match frames.frames.iter().position(|f| f.len() != mel_bins) {
        Some(frame) => Err(ShapeError::MelWidth {
            frame,
            expected: mel_bins,
            actual: frames.frames[frame].len(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Tokenizing,
    AcousticInference,
    Vocoding,
    Complete,
    Failed,
}

/// One chunk's progress through the stages.
#[derive(Debug)]
pub struct SynthesisJob {
    chunk_index: usize,
    state: JobState,
}

impl SynthesisJob {
    pub fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn advance(&mut self, next: JobState) {
        debug!(
            "[Synthesis] chunk {}: {:?} -> {:?}",
            self.chunk_index, self.state, next
        );
        self.state = next;
    }
}

/// Acoustic model and vocoder trained for one language.
#[derive(Clone)]
pub struct VoiceModels {
    pub acoustic: Arc<dyn AcousticModel>,
    pub vocoder: Arc<dyn Vocoder>,
}

/// Shape limits the coordinator enforces between stages.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisLimits {
    pub hop_size: usize,
    pub mel_bins: usize,
    pub max_frames: usize,
    pub stage_timeout: Option<Duration>,
}

/// Turns one text chunk into an audio buffer.
pub struct ChunkSynthesizer {
    front_end: Arc<dyn LinguisticFrontEnd>,
    voices: BTreeMap<Language, VoiceModels>,
    format: AudioFormat,
    limits: SynthesisLimits,
}

impl ChunkSynthesizer {
    pub fn new(
        front_end: Arc<dyn LinguisticFrontEnd>,
        format: AudioFormat,
        limits: SynthesisLimits,
    ) -> Self {
        Self {
            front_end,
            voices: BTreeMap::new(),
            format,
            limits,
        }
    }

    pub fn with_voice(mut self, language: Language, models: VoiceModels) -> Self {
        self.voices.insert(language, models);
        self
    }

    pub fn front_end(&self) -> &Arc<dyn LinguisticFrontEnd> {
        &self.front_end
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn supports(&self, language: Language) -> bool {
        self.voices.contains_key(&language)
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.voices.keys().copied()
    }

    pub async fn synthesize(
        &self,
        chunk: &TextChunk,
        language: Language,
    ) -> Result<AudioBuffer, SynthesisError> {
        let mut job = SynthesisJob::new(chunk.index());
        let result = self.run_job(&mut job, chunk, language).await;
        match &result {
            Ok(buffer) => {
                job.advance(JobState::Complete);
                debug!(
                    "[Synthesis] chunk {}: {} samples ({:.2}s)",
                    chunk.index(),
                    buffer.samples.len(),
                    buffer.duration().as_secs_f32()
                );
            }
            Err(e) => {
                job.advance(JobState::Failed);
                warn!(
                    "[Synthesis] chunk {} failed during {}: {}",
                    chunk.index(),
                    e.stage(),
                    e
                );
            }
        }
        result
    }

    async fn run_job(
        &self,
        job: &mut SynthesisJob,
        chunk: &TextChunk,
        language: Language,
    ) -> Result<AudioBuffer, SynthesisError> {
        let index = chunk.index();
        job.advance(JobState::Tokenizing);
        let models = self.voices.get(&language).cloned().ok_or_else(|| {
            SynthesisError::at(
                Stage::Tokenize,
                format!("No voice registered for language '{}'", language),
            )
        })?;

        let front_end = self.front_end.clone();
        let text = chunk.text().to_string();
        let tokens = self
            .run_stage(Stage::Tokenize, move || front_end.tokenize(&text, language))
            .await?;
        if tokens.is_empty() {
            return Ok(AudioBuffer::empty(index, self.format));
        }
        let sequence = TokenSequence::new(index, tokens);

        job.advance(JobState::AcousticInference);
        let acoustic = models.acoustic;
        let limits = self.limits;
        let frames = self
            .run_stage(Stage::Acoustic, move || {
                let prediction = acoustic.predict(&sequence)?;
                let expanded = regulate_length(&prediction, limits.max_frames)?;
                let frames = acoustic.decode(&expanded)?;
                check_spectrogram(&frames, expanded.frame_count(), limits.mel_bins)?;
                Ok(frames)
            })
            .await?;

        job.advance(JobState::Vocoding);
        let vocoder = models.vocoder;
        let channels = self.format.channels as usize;
        let samples = self
            .run_stage(Stage::Vocode, move || {
                let samples = vocoder.vocode(&frames)?;
                let expected = frames.len() * limits.hop_size * channels;
                if samples.len() != expected {
                    return Err(ShapeError::SampleCount {
                        expected,
                        actual: samples.len(),
                    }
                    .into());
                }
                Ok(samples)
            })
            .await?;

        Ok(AudioBuffer::new(index, self.format, samples))
    }

    async fn run_stage<T, F>(&self, stage: Stage, work: F) -> Result<T, SynthesisError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(work);
        let joined = match self.limits.stage_timeout {
            Some(after) => match tokio::time::timeout(after, handle).await {
                Ok(joined) => joined,
                Err(_) => return Err(SynthesisError::at(stage, StageTimeout { stage, after })),
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SynthesisError::at(stage, e)),
            Err(e) => Err(SynthesisError::at(stage, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::model::Token;
    use crate::tts::placeholder::{GraphemeFrontEnd, PlaceholderAcoustic, SineVocoder};

    fn limits() -> SynthesisLimits {
        SynthesisLimits {
            hop_size: 4,
            mel_bins: 3,
            max_frames: 100,
            stage_timeout: None,
        }
    }

    fn prediction(durations: Vec<f32>) -> AcousticPrediction {
        let n = durations.len();
        AcousticPrediction {
            encoded: (0..n).map(|i| vec![i as f32]).collect(),
            durations,
            pitch: Some((0..n).map(|i| 100.0 + i as f32).collect()),
            energy: None,
        }
    }

    #[test]
    fn test_rounding_policy() {
        let cases = [
            (2.4, 2),
            (2.5, 3),
            (0.2, 1),
            (0.0, 1),
            (-3.0, 1),
            (1.49, 1),
            (7.5, 8),
            (f32::NAN, 1),
        ];
        for (duration, frames) in cases {
            assert_eq!(frames_for_duration(duration), frames, "duration {}", duration);
        }
    }

    #[test]
    fn test_duration_expands_to_frames() {
        let expanded = regulate_length(&prediction(vec![2.4]), 100).unwrap();
        assert_eq!(expanded.frame_count(), 2);

        let expanded = regulate_length(&prediction(vec![2.5, 0.2]), 100).unwrap();
        assert_eq!(expanded.hidden, vec![vec![0.0], vec![0.0], vec![0.0], vec![1.0]]);
        assert_eq!(expanded.pitch, Some(vec![100.0, 100.0, 100.0, 101.0]));
        assert_eq!(expanded.energy, None);
    }

    #[test]
    fn test_regulator_rejects_bad_shapes() {
        let mut bad = prediction(vec![1.0, 1.0]);
        bad.encoded.pop();
        assert!(matches!(
            regulate_length(&bad, 100),
            Err(ShapeError::LengthMismatch { expected: 2, actual: 1, .. })
        ));

        assert_eq!(
            regulate_length(&prediction(vec![60.0, 60.0]), 100),
            Err(ShapeError::TooManyFrames { frames: 120, limit: 100 })
        );
        assert!(regulate_length(&prediction(vec![f32::INFINITY]), 100).is_err());
    }

    fn synthesizer() -> ChunkSynthesizer {
        let format = AudioFormat::new(8000, 1, 16);
        ChunkSynthesizer::new(Arc::new(GraphemeFrontEnd), format, limits()).with_voice(
            Language::English,
            VoiceModels {
                acoustic: Arc::new(PlaceholderAcoustic::new(3)),
                vocoder: Arc::new(SineVocoder::new(8000, 1, 4)),
            },
        )
    }

    #[tokio::test]
    async fn test_synthesize_chunk() {
        let chunk = TextChunk::new(1, 0..3, "ka.");
        let buffer = synthesizer().synthesize(&chunk, Language::English).await.unwrap();
        assert_eq!(buffer.chunk_index, 1);
        // 4 + 6 + 8 frames, 4 samples each.
        assert_eq!(buffer.samples.len(), 18 * 4);
    }

    #[tokio::test]
    async fn test_empty_tokens_give_empty_buffer() {
        let chunk = TextChunk::new(2, 0..1, "");
        let buffer = synthesizer().synthesize(&chunk, Language::English).await.unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.chunk_index, 2);
    }

    #[tokio::test]
    async fn test_unregistered_language_fails_tokenization() {
        let chunk = TextChunk::new(1, 0..2, "こん");
        let err = synthesizer()
            .synthesize(&chunk, Language::Japanese)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Tokenize);
    }

    struct WrongWidth;

    impl AcousticModel for WrongWidth {
        fn predict(&self, tokens: &TokenSequence) -> anyhow::Result<AcousticPrediction> {
            Ok(prediction(vec![1.0; tokens.len()]))
        }

        fn decode(&self, features: &ExpandedFeatures) -> anyhow::Result<SpectrogramFrames> {
            Ok(SpectrogramFrames::new(vec![vec![0.0; 2]; features.frame_count()]))
        }
    }

    struct Silent;

    impl Vocoder for Silent {
        fn vocode(&self, _frames: &SpectrogramFrames) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.0; 3])
        }
    }

    #[tokio::test]
    async fn test_shape_errors_map_to_stage() {
        let format = AudioFormat::new(8000, 1, 16);
        let synth = ChunkSynthesizer::new(Arc::new(GraphemeFrontEnd), format, limits())
            .with_voice(
                Language::English,
                VoiceModels {
                    acoustic: Arc::new(WrongWidth),
                    vocoder: Arc::new(SineVocoder::new(8000, 1, 4)),
                },
            )
            .with_voice(
                Language::Japanese,
                VoiceModels {
                    acoustic: Arc::new(PlaceholderAcoustic::new(3)),
                    vocoder: Arc::new(Silent),
                },
            );

        let chunk = TextChunk::new(1, 0..2, "ab");
        let err = synth.synthesize(&chunk, Language::English).await.unwrap_err();
        assert!(matches!(err, SynthesisError::AcousticInference(_)));

        let err = synth.synthesize(&chunk, Language::Japanese).await.unwrap_err();
        assert!(matches!(err, SynthesisError::VocoderInference(_)));
    }

    struct Slow;

    impl LinguisticFrontEnd for Slow {
        fn tokenize(&self, _text: &str, _language: Language) -> anyhow::Result<Vec<Token>> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(vec![Token::new(1, "a")])
        }
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let mut limits = limits();
        limits.stage_timeout = Some(Duration::from_millis(20));
        let synth = ChunkSynthesizer::new(Arc::new(Slow), AudioFormat::default(), limits)
            .with_voice(
                Language::English,
                VoiceModels {
                    acoustic: Arc::new(PlaceholderAcoustic::new(3)),
                    vocoder: Arc::new(SineVocoder::new(22050, 1, 4)),
                },
            );
        let err = synth
            .synthesize(&TextChunk::new(1, 0..1, "a"), Language::English)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Tokenize);
        assert!(err.to_string().contains("timed out"));
    }
}
