//! Request API over the pipeline.
//!
//! The engine owns one model bundle per language, the shared front-end and
//! the output sink. One request plays at a time; starting a new request
//! cancels the previous one.

use crate::config::{ConfigError, PipelineConfig};
use crate::tts::placeholder::{GraphemeFrontEnd, PlaceholderAcoustic, SineVocoder};
use crate::tts::{
    AudioSink, CancellationHandle, ChunkPlayed, ChunkSynthesizer, Language, LinguisticFrontEnd,
    PlaybackScheduler, RequestOutcome, SegmentationError, Segmenter, TextChunk, VoiceModels,
};
use log::info;
use std::sync::{Arc, Mutex};

pub struct EngineBuilder {
    config: PipelineConfig,
    front_end: Arc<dyn LinguisticFrontEnd>,
    voices: Vec<(Language, VoiceModels)>,
}

impl EngineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            front_end: Arc::new(GraphemeFrontEnd),
            voices: Vec::new(),
        }
    }

    pub fn front_end(mut self, front_end: Arc<dyn LinguisticFrontEnd>) -> Self {
        self.front_end = front_end;
        self
    }

    pub fn voice(mut self, language: Language, models: VoiceModels) -> Self {
        self.voices.push((language, models));
        self
    }

    /// Register the placeholder models for every language.
    pub fn placeholder_voices(mut self) -> Self {
        let format = self.config.audio_format();
        for language in [Language::Japanese, Language::English] {
            self.voices.push((
                language,
                VoiceModels {
                    acoustic: Arc::new(PlaceholderAcoustic::new(self.config.mel_bins)),
                    vocoder: Arc::new(SineVocoder::new(
                        format.sample_rate,
                        format.channels,
                        self.config.hop_size,
                    )),
                },
            ));
        }
        self
    }

    /// Front-end and segmenter only, for inspecting text without an output
    /// sink or any voice.
    pub fn inspector(self) -> Result<TextInspector, ConfigError> {
        self.config.validate()?;
        Ok(TextInspector {
            front_end: self.front_end,
            segmenter: Segmenter::new(self.config.max_tokens_per_chunk),
        })
    }

    pub fn build(self, sink: Box<dyn AudioSink>) -> Result<TtsEngine, ConfigError> {
        self.config.validate()?;
        let format = self.config.audio_format();
        if sink.format() != format {
            return Err(ConfigError::Invalid(format!(
                "sink plays {} but the pipeline renders {}",
                sink.format(),
                format
            )));
        }

        let inspector = TextInspector {
            front_end: Arc::clone(&self.front_end),
            segmenter: Segmenter::new(self.config.max_tokens_per_chunk),
        };
        let synthesizer = self.voices.into_iter().fold(
            ChunkSynthesizer::new(self.front_end, format, self.config.synthesis_limits()),
            |synth, (language, models)| synth.with_voice(language, models),
        );
        let synthesizer = Arc::new(synthesizer);
        let scheduler = PlaybackScheduler::new(Arc::clone(&synthesizer), sink, &self.config);

        Ok(TtsEngine {
            inspector,
            config: self.config,
            synthesizer,
            scheduler,
            active: Mutex::new(None),
        })
    }
}

/// Phoneme and chunk views of text, through the same front-end instance the
/// engine synthesizes with.
#[derive(Clone)]
pub struct TextInspector {
    front_end: Arc<dyn LinguisticFrontEnd>,
    segmenter: Segmenter,
}

impl TextInspector {
    /// Comma-joined phonemes.
    pub fn inspect_phonemes(&self, text: &str, language: Language) -> anyhow::Result<String> {
        Ok(self.front_end.phonemes(text, language)?.join(","))
    }

    pub fn segment(&self, text: &str, language: Language) -> Result<Vec<TextChunk>, SegmentationError> {
        self.segmenter
            .segment(text, |s| self.front_end.token_count(s, language))
    }
}

pub struct TtsEngine {
    config: PipelineConfig,
    inspector: TextInspector,
    synthesizer: Arc<ChunkSynthesizer>,
    scheduler: PlaybackScheduler,
    active: Mutex<Option<CancellationHandle>>,
}

impl TtsEngine {
    /// Engine with the placeholder models for every language.
    pub fn placeholder(config: PipelineConfig, sink: Box<dyn AudioSink>) -> Result<Self, ConfigError> {
        EngineBuilder::new(config).placeholder_voices().build(sink)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn supports(&self, language: Language) -> bool {
        self.synthesizer.supports(language)
    }

    /// Segment, synthesize and play `text`. Must be called within a Tokio
    /// runtime.
    ///
    /// Any request still running on this engine is cancelled first.
    pub fn synthesize_long_text<C, D>(
        &self,
        text: impl Into<String>,
        language: Language,
        on_chunk: C,
        on_all: D,
    ) -> CancellationHandle
    where
        C: FnMut(ChunkPlayed) + Send + 'static,
        D: FnOnce(RequestOutcome) + Send + 'static,
    {
        let text = text.into();
        info!(
            "[Engine] new request: {} chars, language {}",
            text.chars().count(),
            language
        );

        // Hold the slot across the swap so two callers cannot both keep a request.
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = active.take() {
            if previous.cancel() {
                info!("[Engine] cancelled the previous request");
            }
        }
        let handle = self
            .scheduler
            .play_text(text, self.inspector.segmenter, language, on_chunk, on_all);
        *active = Some(handle.clone());
        handle
    }

    /// Cancel the running request, if any.
    pub fn stop(&self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.take().is_some_and(|handle| handle.cancel())
    }

    pub fn inspector(&self) -> &TextInspector {
        &self.inspector
    }

    /// Comma-joined phonemes from the same front-end instance used for
    /// synthesis.
    pub fn inspect_phonemes(&self, text: &str, language: Language) -> anyhow::Result<String> {
        self.inspector.inspect_phonemes(text, language)
    }

    pub fn segment(&self, text: &str, language: Language) -> Result<Vec<TextChunk>, SegmentationError> {
        self.inspector.segment(text, language)
    }
}
