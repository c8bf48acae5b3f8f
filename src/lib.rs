//! Chunked TTS - long-text speech synthesis
//!
//! Splits text into model-sized chunks, runs each through a front-end,
//! acoustic model and vocoder, and plays the results back-to-back in order.

pub mod config;
pub mod engine;
pub mod tts;

pub use config::{ConfigError, PipelineConfig};
pub use engine::{EngineBuilder, TextInspector, TtsEngine};
pub use tts::{CancellationHandle, ChunkPlayed, Language, RequestError, RequestOutcome};
