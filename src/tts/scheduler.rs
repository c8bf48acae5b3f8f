//! Playback scheduler
//!
//! Synthesizes chunks ahead of playback and hands finished buffers to the
//! sink strictly in chunk order. Synthesis results arrive in any order and
//! wait in a reorder buffer until every earlier chunk has been queued.

use super::audio::{AudioBuffer, AudioError};
use super::coordinator::{ChunkSynthesizer, Stage, SynthesisError};
use super::model::Language;
use super::segmenter::{SegmentationError, Segmenter, TextChunk};
use super::sink::{AudioSink, PlaybackCompletion};
use crate::config::PipelineConfig;
use futures_util::future::OptionFuture;
use log::{debug, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;

/// Shared handle to the request's output sink.
pub type SharedSink = Arc<Mutex<Box<dyn AudioSink>>>;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),
    #[error("Chunk {chunk} failed during {}: {source}", .source.stage())]
    Synthesis {
        chunk: usize,
        #[source]
        source: SynthesisError,
    },
    #[error("Playback device failed at chunk {chunk}: {source}")]
    PlaybackDevice {
        chunk: usize,
        #[source]
        source: AudioError,
    },
    /// Opening or closing an output session that carries no chunks.
    #[error("Audio output session failed: {0}")]
    Session(#[source] AudioError),
}

impl RequestError {
    /// 1-based index of the chunk the failure belongs to, if any.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            RequestError::Segmentation(_) | RequestError::Session(_) => None,
            RequestError::Synthesis { chunk, .. } | RequestError::PlaybackDevice { chunk, .. } => {
                Some(*chunk)
            }
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            RequestError::Synthesis { source, .. } => Some(source.stage()),
            _ => None,
        }
    }
}

/// How a request ended. `played` counts chunks that finished playing.
#[derive(Debug)]
pub enum RequestOutcome {
    Completed { played: usize },
    Failed { played: usize, error: RequestError },
    Cancelled { played: usize },
}

impl RequestOutcome {
    pub fn played(&self) -> usize {
        match self {
            RequestOutcome::Completed { played }
            | RequestOutcome::Failed { played, .. }
            | RequestOutcome::Cancelled { played } => *played,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RequestOutcome::Completed { .. })
    }

    /// The outcome once a cancel has won the race to settle the request.
    fn into_cancelled(self) -> Self {
        match self {
            RequestOutcome::Failed { played, error } => {
                warn!("[Scheduler] cancelled while failing: {}", error);
                RequestOutcome::Cancelled { played }
            }
            RequestOutcome::Completed { played } | RequestOutcome::Cancelled { played } => {
                RequestOutcome::Cancelled { played }
            }
        }
    }
}

/// Reported after each chunk finishes playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlayed {
    pub index: usize,
    pub total: usize,
}

const CANCELLED: u8 = 0b01;
const SETTLED: u8 = 0b10;

#[derive(Default)]
struct RequestSignal {
    /// `CANCELLED` and `SETTLED`; whichever is set first wins.
    state: AtomicU8,
    finished: AtomicBool,
    cancel_notify: Notify,
    finish_notify: Notify,
}

/// Single-shot cancellation for one request.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    signal: Arc<RequestSignal>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns true only if the request will report
    /// `Cancelled`; false once its outcome is settled or after an earlier
    /// cancel.
    pub fn cancel(&self) -> bool {
        let first = self
            .signal
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state == 0).then_some(CANCELLED)
            })
            .is_ok();
        if first {
            // The scheduler is the only waiter; a stored permit covers the
            // case where it is not parked yet.
            self.signal.cancel_notify.notify_one();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.state.load(Ordering::SeqCst) & CANCELLED != 0
    }

    /// True once the outcome callback has run.
    pub fn is_finished(&self) -> bool {
        self.signal.finished.load(Ordering::SeqCst)
    }

    /// Wait until the outcome callback has run.
    pub async fn finished(&self) {
        let notified = self.signal.finish_notify.notified();
        if self.is_finished() {
            return;
        }
        notified.await;
    }

    async fn cancelled(&self) {
        self.signal.cancel_notify.notified().await;
    }

    /// Freeze the outcome against later cancels. False if a cancel got in
    /// first.
    fn settle(&self) -> bool {
        self.signal
            .state
            .compare_exchange(0, SETTLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_finished(&self) {
        self.signal.finished.store(true, Ordering::SeqCst);
        self.signal.finish_notify.notify_waiters();
    }
}

enum ChunkSource {
    Ready(Vec<TextChunk>),
    Text { text: String, segmenter: Segmenter },
}

/// Plays requests through one sink, one request at a time.
pub struct PlaybackScheduler {
    synthesizer: Arc<ChunkSynthesizer>,
    sink: SharedSink,
    max_concurrency: usize,
    lookahead: usize,
}

impl PlaybackScheduler {
    pub fn new(
        synthesizer: Arc<ChunkSynthesizer>,
        sink: Box<dyn AudioSink>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            synthesizer,
            sink: Arc::new(Mutex::new(sink)),
            max_concurrency: config.max_concurrency.max(1),
            lookahead: config.lookahead.max(1),
        }
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// Play pre-segmented chunks. Must be called within a Tokio runtime.
    ///
    /// `on_chunk` runs once per chunk, in order, after its audio finished.
    /// `on_all` runs exactly once with the request's outcome.
    pub fn play<C, D>(
        &self,
        chunks: Vec<TextChunk>,
        language: Language,
        on_chunk: C,
        on_all: D,
    ) -> CancellationHandle
    where
        C: FnMut(ChunkPlayed) + Send + 'static,
        D: FnOnce(RequestOutcome) + Send + 'static,
    {
        self.spawn_request(ChunkSource::Ready(chunks), language, on_chunk, on_all)
    }

    /// Segment `text` with the synthesizer's front-end, then play it.
    pub fn play_text<C, D>(
        &self,
        text: String,
        segmenter: Segmenter,
        language: Language,
        on_chunk: C,
        on_all: D,
    ) -> CancellationHandle
    where
        C: FnMut(ChunkPlayed) + Send + 'static,
        D: FnOnce(RequestOutcome) + Send + 'static,
    {
        self.spawn_request(
            ChunkSource::Text { text, segmenter },
            language,
            on_chunk,
            on_all,
        )
    }

    fn spawn_request<C, D>(
        &self,
        source: ChunkSource,
        language: Language,
        on_chunk: C,
        on_all: D,
    ) -> CancellationHandle
    where
        C: FnMut(ChunkPlayed) + Send + 'static,
        D: FnOnce(RequestOutcome) + Send + 'static,
    {
        let handle = CancellationHandle::new();
        let request = Request {
            synthesizer: Arc::clone(&self.synthesizer),
            semaphore: Arc::new(Semaphore::new(self.max_concurrency)),
            stop_at: Arc::new(AtomicUsize::new(usize::MAX)),
            lookahead: self.lookahead,
            language,
            handle: handle.clone(),
        };
        let sink = Arc::clone(&self.sink);

        tokio::spawn(async move {
            // Held for the whole request: the scheduler is the sink's only writer.
            let mut sink: OwnedMutexGuard<Box<dyn AudioSink>> = sink.lock_owned().await;

            let outcome = if request.handle.is_cancelled() {
                RequestOutcome::Cancelled { played: 0 }
            } else {
                match request.resolve(source) {
                    Ok(chunks) => request.drive(chunks, &mut **sink, on_chunk).await,
                    Err(e) => RequestOutcome::Failed {
                        played: 0,
                        error: e.into(),
                    },
                }
            };
            let outcome = if request.handle.settle() {
                outcome
            } else {
                outcome.into_cancelled()
            };

            match &outcome {
                RequestOutcome::Completed { played } => {
                    info!("[Scheduler] request completed, {} chunks played", played)
                }
                RequestOutcome::Failed { played, error } => {
                    warn!("[Scheduler] request failed after {} chunks: {}", played, error)
                }
                RequestOutcome::Cancelled { played } => {
                    info!("[Scheduler] request cancelled after {} chunks", played)
                }
            }
            drop(sink);
            on_all(outcome);
            request.handle.mark_finished();
        });

        handle
    }
}

type JobResult = (usize, Result<AudioBuffer, SynthesisError>);

struct Request {
    synthesizer: Arc<ChunkSynthesizer>,
    semaphore: Arc<Semaphore>,
    /// Lowest failed position; jobs past it never start synthesis.
    stop_at: Arc<AtomicUsize>,
    lookahead: usize,
    language: Language,
    handle: CancellationHandle,
}

impl Request {
    fn resolve(&self, source: ChunkSource) -> Result<Vec<TextChunk>, SegmentationError> {
        match source {
            ChunkSource::Ready(chunks) => Ok(chunks),
            ChunkSource::Text { text, segmenter } => {
                let front_end = self.synthesizer.front_end();
                let language = self.language;
                segmenter.segment(&text, |s| front_end.token_count(s, language))
            }
        }
    }

    fn spawn_job(
        &self,
        pos: usize,
        chunk: TextChunk,
        tx: mpsc::UnboundedSender<JobResult>,
    ) -> JoinHandle<()> {
        let synthesizer = Arc::clone(&self.synthesizer);
        let semaphore = Arc::clone(&self.semaphore);
        let stop_at = Arc::clone(&self.stop_at);
        let language = self.language;

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            if pos > stop_at.load(Ordering::SeqCst) {
                debug!("[Scheduler] skipping chunk {} after an earlier failure", chunk.index());
                return;
            }
            let result = synthesizer.synthesize(&chunk, language).await;
            if result.is_err() {
                // Before the permit is released, so a waiting later job sees it.
                stop_at.fetch_min(pos, Ordering::SeqCst);
            }
            let _ = tx.send((pos, result));
        })
    }

    async fn drive<C>(
        &self,
        chunks: Vec<TextChunk>,
        sink: &mut dyn AudioSink,
        mut on_chunk: C,
    ) -> RequestOutcome
    where
        C: FnMut(ChunkPlayed),
    {
        let total = chunks.len();
        if total == 0 {
            // No synthesis, but the sink still opens and closes a session so
            // file output is a valid silent container.
            let session = sink.begin().and_then(|()| sink.finish());
            return match session {
                Ok(()) => RequestOutcome::Completed { played: 0 },
                Err(source) => {
                    sink.stop();
                    RequestOutcome::Failed {
                        played: 0,
                        error: RequestError::Session(source),
                    }
                }
            };
        }
        info!(
            "[Scheduler] request started: {} chunks, language {}",
            total, self.language
        );

        if let Err(source) = sink.begin() {
            return RequestOutcome::Failed {
                played: 0,
                error: RequestError::PlaybackDevice {
                    chunk: chunks[0].index(),
                    source,
                },
            };
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<JobResult>();
        let mut jobs: Vec<JoinHandle<()>> = Vec::with_capacity(total);

        // Buffers that arrived out of order, waiting for their turn
        let mut ready: BTreeMap<usize, AudioBuffer> = BTreeMap::new();
        // Queued on the sink, oldest first
        let mut playing: VecDeque<(usize, PlaybackCompletion)> = VecDeque::new();
        // Lowest failing position seen so far
        let mut failure: Option<(usize, SynthesisError)> = None;

        let mut next_issue = 0;
        let mut next_enqueue = 0;
        let mut played = 0;

        let outcome = loop {
            if self.handle.is_cancelled() {
                break RequestOutcome::Cancelled { played };
            }

            let limit = failure.as_ref().map_or(total, |(pos, _)| *pos);
            while next_issue < limit && next_issue <= played + self.lookahead {
                debug!("[Scheduler] issuing chunk {}", chunks[next_issue].index());
                jobs.push(self.spawn_job(next_issue, chunks[next_issue].clone(), tx.clone()));
                next_issue += 1;
            }

            let mut enqueue_error = None;
            while let Some(buffer) = ready.remove(&next_enqueue) {
                match sink.enqueue(buffer) {
                    Ok(done) => {
                        playing.push_back((next_enqueue, done));
                        next_enqueue += 1;
                    }
                    Err(source) => {
                        enqueue_error = Some(source);
                        break;
                    }
                }
            }
            if let Some(source) = enqueue_error {
                break RequestOutcome::Failed {
                    played,
                    error: RequestError::PlaybackDevice {
                        chunk: chunks[next_enqueue].index(),
                        source,
                    },
                };
            }

            if played == total {
                if let Err(source) = sink.finish() {
                    break RequestOutcome::Failed {
                        played,
                        error: RequestError::PlaybackDevice {
                            chunk: chunks[total - 1].index(),
                            source,
                        },
                    };
                }
                break RequestOutcome::Completed { played };
            }
            // Everything before the failing chunk has played; report it now.
            if let Some((pos, source)) = failure.take_if(|(pos, _)| *pos == played) {
                break RequestOutcome::Failed {
                    played,
                    error: RequestError::Synthesis {
                        chunk: chunks[pos].index(),
                        source,
                    },
                };
            }

            tokio::select! {
                biased;

                _ = self.handle.cancelled() => {
                    break RequestOutcome::Cancelled { played };
                }

                Some(done) = OptionFuture::from(playing.front_mut().map(|(_, rx)| rx)) => {
                    let pos = playing.pop_front().map_or(played, |(pos, _)| pos);
                    let result = done.unwrap_or_else(|_| {
                        Err(AudioError::Interrupted("completion dropped by the sink".to_string()))
                    });
                    if let Err(source) = result {
                        break RequestOutcome::Failed {
                            played,
                            error: RequestError::PlaybackDevice {
                                chunk: chunks[pos].index(),
                                source,
                            },
                        };
                    }
                    played += 1;
                    debug!("[Scheduler] chunk {} played", chunks[pos].index());
                    on_chunk(ChunkPlayed {
                        index: chunks[pos].index(),
                        total,
                    });
                }

                Some((pos, result)) = rx.recv() => {
                    let superseded = matches!(&failure, Some((failed, _)) if pos > *failed);
                    match result {
                        _ if superseded => {
                            debug!("[Scheduler] discarding chunk {} after an earlier failure", chunks[pos].index());
                        }
                        Ok(buffer) => {
                            ready.insert(pos, buffer);
                        }
                        Err(error) => {
                            self.stop_at.fetch_min(pos, Ordering::SeqCst);
                            // Jobs are pushed in position order.
                            for job in jobs.iter().skip(pos + 1) {
                                job.abort();
                            }
                            ready.retain(|&p, _| p < pos);
                            failure = Some((pos, error));
                        }
                    }
                }
            }
        };

        if !outcome.is_completed() {
            sink.stop();
        }
        for job in &jobs {
            job.abort();
        }
        outcome
    }
}
