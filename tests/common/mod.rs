//! Scripted pipeline stages and an in-memory timed sink for driving the
//! scheduler deterministically.

#![allow(dead_code)]

use chunked_tts::tts::placeholder::{PlaceholderAcoustic, SineVocoder};
use chunked_tts::tts::{
    AudioBuffer, AudioError, AudioFormat, AudioSink, ChunkSynthesizer, Language,
    LinguisticFrontEnd, PlaybackCompletion, SynthesisLimits, TextChunk, Token, VoiceModels,
};
use chunked_tts::PipelineConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub const SAMPLE_RATE: u32 = 1000;
pub const HOP: usize = 100;
pub const MEL_BINS: usize = 2;

/// One frame per character, so a chunk of n characters plays for n * 100 ms.
pub fn format() -> AudioFormat {
    AudioFormat::new(SAMPLE_RATE, 1, 16)
}

pub fn config(max_concurrency: usize, lookahead: usize) -> PipelineConfig {
    PipelineConfig {
        max_concurrency,
        lookahead,
        sample_rate: SAMPLE_RATE,
        channels: 1,
        bits_per_sample: 16,
        hop_size: HOP,
        mel_bins: MEL_BINS,
        ..PipelineConfig::default()
    }
}

pub fn voice() -> VoiceModels {
    VoiceModels {
        acoustic: Arc::new(PlaceholderAcoustic::new(MEL_BINS)),
        vocoder: Arc::new(SineVocoder::new(SAMPLE_RATE, 1, HOP)),
    }
}

pub fn synthesizer(front_end: Arc<ScriptedFrontEnd>) -> ChunkSynthesizer {
    let limits = SynthesisLimits {
        hop_size: HOP,
        mel_bins: MEL_BINS,
        max_frames: 5000,
        stage_timeout: None,
    };
    ChunkSynthesizer::new(front_end, format(), limits).with_voice(Language::English, voice())
}

/// Chunks with 1-based indices and contiguous spans.
pub fn chunks(texts: &[&str]) -> Vec<TextChunk> {
    let mut start = 0;
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let span = start..start + text.len();
            start = span.end;
            TextChunk::new(i + 1, span, *text)
        })
        .collect()
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Front-end that tokenizes one character per token, with per-text delays
/// and failures. Texts containing `FAIL` fail to tokenize.
pub struct ScriptedFrontEnd {
    delays: HashMap<String, Duration>,
    tokens_per_char: usize,
    log: EventLog,
}

impl ScriptedFrontEnd {
    pub fn new(log: EventLog) -> Self {
        Self {
            delays: HashMap::new(),
            tokens_per_char: 1,
            log,
        }
    }

    pub fn delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    pub fn tokens_per_char(mut self, n: usize) -> Self {
        self.tokens_per_char = n;
        self
    }
}

impl LinguisticFrontEnd for ScriptedFrontEnd {
    fn tokenize(&self, text: &str, _language: Language) -> anyhow::Result<Vec<Token>> {
        self.log.lock().unwrap().push(format!("tokenize:{}", text));
        if let Some(delay) = self.delays.get(text) {
            std::thread::sleep(*delay);
        }
        if text.contains("FAIL") {
            anyhow::bail!("scripted failure for {:?}", text);
        }
        self.log.lock().unwrap().push(format!("tokenized:{}", text));

        Ok(text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| {
                let mut token = Token::new(c as u32, c.to_string());
                token.duration_hint = Some(1.0);
                token
            })
            .collect())
    }

    fn token_count(&self, text: &str, _language: Language) -> usize {
        text.chars().filter(|c| !c.is_whitespace()).count() * self.tokens_per_char
    }
}

/// Sink that "plays" each buffer for its real duration on the Tokio clock.
///
/// Logs `begin`, `started:<chunk>`, `played:<chunk>`, `finish` and `stop`.
pub struct TimedSink {
    log: EventLog,
    busy_until: Option<Instant>,
    /// Bumped on begin/stop so timers from an old session go quiet.
    generation: Arc<AtomicU64>,
    started: mpsc::UnboundedSender<usize>,
    fail_enqueue_at: Option<usize>,
}

impl TimedSink {
    pub fn new(log: EventLog) -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let sink = Self {
            log,
            busy_until: None,
            generation: Arc::new(AtomicU64::new(0)),
            started,
            fail_enqueue_at: None,
        };
        (sink, started_rx)
    }

    pub fn fail_enqueue_at(mut self, chunk_index: usize) -> Self {
        self.fail_enqueue_at = Some(chunk_index);
        self
    }

    fn push(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }
}

impl AudioSink for TimedSink {
    fn format(&self) -> AudioFormat {
        format()
    }

    fn begin(&mut self) -> Result<(), AudioError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.busy_until = None;
        self.push("begin".to_string());
        Ok(())
    }

    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<PlaybackCompletion, AudioError> {
        let index = buffer.chunk_index;
        if self.fail_enqueue_at == Some(index) {
            return Err(AudioError::DeviceUnavailable("scripted device loss".to_string()));
        }
        self.push(format!("enqueued:{}", index));

        let now = Instant::now();
        let start = self.busy_until.map_or(now, |busy| busy.max(now));
        let end = start + buffer.duration();
        self.busy_until = Some(end);

        let (tx, rx) = oneshot::channel();
        let generation = Arc::clone(&self.generation);
        let session = generation.load(Ordering::SeqCst);
        let started = self.started.clone();
        let log = Arc::clone(&self.log);
        tokio::spawn(async move {
            tokio::time::sleep_until(start).await;
            if generation.load(Ordering::SeqCst) != session {
                return;
            }
            log.lock().unwrap().push(format!("started:{}", index));
            let _ = started.send(index);

            tokio::time::sleep_until(end).await;
            if generation.load(Ordering::SeqCst) != session {
                return;
            }
            log.lock().unwrap().push(format!("played:{}", index));
            let _ = tx.send(Ok(()));
        });
        Ok(rx)
    }

    fn finish(&mut self) -> Result<(), AudioError> {
        self.push("finish".to_string());
        Ok(())
    }

    fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.busy_until = None;
        self.push("stop".to_string());
    }
}
