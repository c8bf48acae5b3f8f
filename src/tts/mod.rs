//! Chunked text-to-speech pipeline
//!
//! text -> segmenter -> front-end -> acoustic model -> vocoder -> sink

mod audio;
mod coordinator;
mod model;
pub mod placeholder;
mod playback;
mod scheduler;
mod segmenter;
mod sink;

pub use audio::{
    wav_header, write_empty_wav, AudioBuffer, AudioError, AudioFormat, WavWriter, WAV_HEADER_LEN,
};
pub use coordinator::{
    frames_for_duration, regulate_length, BoxError, ChunkSynthesizer, JobState, ShapeError, Stage,
    StageTimeout, SynthesisError, SynthesisJob, SynthesisLimits, VoiceModels,
};
pub use model::{
    AcousticModel, AcousticPrediction, ExpandedFeatures, Language, LinguisticFrontEnd,
    SpectrogramFrames, Token, TokenSequence, UnknownLanguage, Vocoder,
};
pub use playback::RodioSink;
pub use scheduler::{
    CancellationHandle, ChunkPlayed, PlaybackScheduler, RequestError, RequestOutcome, SharedSink,
};
pub use segmenter::{SegmentationError, Segmenter, TextChunk, UNTOKENIZABLE};
pub use sink::{scratch_dir, AudioSink, PlaybackCompletion, WavFileSink};
