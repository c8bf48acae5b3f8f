//! Device playback for synthesized chunks
//!
//! Runs a dedicated audio thread that owns the rodio OutputStream and one
//! persistent Sink per session. Buffers are appended to the sink so they play
//! back-to-back without gaps; a zero-length callback source queued after each
//! buffer resolves that buffer's completion.

use super::audio::{AudioBuffer, AudioError, AudioFormat};
use super::sink::{check_format, AudioSink, PlaybackCompletion};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, Sink};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

/// How long `open` waits for the audio thread to report on the device.
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

enum PlaybackCmd {
    Begin {
        reply: Sender<Result<(), AudioError>>,
    },
    Enqueue {
        buffer: AudioBuffer,
        done: oneshot::Sender<Result<(), AudioError>>,
    },
    Finish,
    Stop,
}

/// Sink backed by the default output device.
pub struct RodioSink {
    tx: Sender<PlaybackCmd>,
    format: AudioFormat,
    /// Buffers handed to the device whose completion has not fired yet.
    queued: Arc<AtomicUsize>,
}

impl RodioSink {
    /// Open the default output device on a dedicated audio thread.
    pub fn open(format: AudioFormat) -> Result<Self, AudioError> {
        let (tx, rx) = unbounded::<PlaybackCmd>();
        let (init_tx, init_rx) = bounded::<Result<(), AudioError>>(1);
        let queued = Arc::new(AtomicUsize::new(0));

        let queued_for_thread = Arc::clone(&queued);
        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || audio_thread_main(rx, init_tx, queued_for_thread))?;

        match init_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(RecvTimeoutError::Timeout) => {
                return Err(AudioError::DeviceUnavailable(
                    "timed out opening the output stream".to_string(),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AudioError::DeviceUnavailable(
                    "audio thread exited during startup".to_string(),
                ))
            }
        }

        info!("[Playback] output device ready ({})", format);
        Ok(Self { tx, format, queued })
    }

    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn send(&self, cmd: PlaybackCmd) -> Result<(), AudioError> {
        self.tx
            .send(cmd)
            .map_err(|_| AudioError::Interrupted("audio thread is gone".to_string()))
    }
}

impl AudioSink for RodioSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn begin(&mut self) -> Result<(), AudioError> {
        let (reply, response) = bounded(1);
        self.send(PlaybackCmd::Begin { reply })?;
        response
            .recv_timeout(DEVICE_OPEN_TIMEOUT)
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
    }

    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<PlaybackCompletion, AudioError> {
        check_format(self.format, &buffer)?;
        let (done, completion) = oneshot::channel();
        self.send(PlaybackCmd::Enqueue { buffer, done })?;
        Ok(completion)
    }

    fn finish(&mut self) -> Result<(), AudioError> {
        self.send(PlaybackCmd::Finish)
    }

    fn stop(&mut self) {
        let _ = self.tx.send(PlaybackCmd::Stop);
    }
}

fn audio_thread_main(
    rx: Receiver<PlaybackCmd>,
    init: Sender<Result<(), AudioError>>,
    queued: Arc<AtomicUsize>,
) {
    // The stream must stay on this thread and alive for as long as we play.
    let (_stream, stream_handle) = match OutputStream::try_default() {
        Ok(v) => v,
        Err(e) => {
            error!("[Playback] failed to create audio output stream: {}", e);
            let _ = init.send(Err(AudioError::DeviceUnavailable(e.to_string())));
            return;
        }
    };
    let _ = init.send(Ok(()));

    // Persistent sink for the current session - enables gapless playback
    let mut session_sink: Option<Sink> = None;

    // Ends once the RodioSink handle is dropped.
    for cmd in rx.iter() {
        match cmd {
            PlaybackCmd::Begin { reply } => {
                if let Some(sink) = session_sink.take() {
                    sink.stop();
                }
                queued.store(0, Ordering::SeqCst);

                let result = match Sink::try_new(&stream_handle) {
                    Ok(sink) => {
                        session_sink = Some(sink);
                        Ok(())
                    }
                    Err(e) => {
                        error!("[Playback] failed to create audio sink: {}", e);
                        Err(AudioError::DeviceUnavailable(e.to_string()))
                    }
                };
                let _ = reply.send(result);
            }

            PlaybackCmd::Enqueue { buffer, done } => {
                let Some(sink) = session_sink.as_ref() else {
                    let _ = done.send(Err(AudioError::NoSession));
                    continue;
                };

                debug!(
                    "[Playback] chunk {} queued ({:.2}s)",
                    buffer.chunk_index,
                    buffer.duration().as_secs_f32()
                );
                queued.fetch_add(1, Ordering::SeqCst);
                let format = buffer.format;
                sink.append(SamplesBuffer::new(
                    format.channels,
                    format.sample_rate,
                    buffer.samples,
                ));

                // The callback is `Fn`, the sender is single-use.
                let done = Mutex::new(Some(done));
                let queued_for_callback = Arc::clone(&queued);
                sink.append(EmptyCallback::<f32>::new(Box::new(move || {
                    if let Some(tx) = done.lock().ok().and_then(|mut slot| slot.take()) {
                        let _ = queued_for_callback
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                        let _ = tx.send(Ok(()));
                    }
                })));
            }

            PlaybackCmd::Finish => {
                debug!("[Playback] session finished");
            }

            PlaybackCmd::Stop => {
                if let Some(sink) = session_sink.take() {
                    sink.stop();
                }
                queued.store(0, Ordering::SeqCst);
                debug!("[Playback] stopped");
            }
        }
    }
}
