//! Output sinks fed by the playback scheduler.
//!
//! A sink queues buffers back-to-back and hands out one completion future per
//! buffer. Device playback lives in `playback`; this module holds the trait and
//! the WAV container sink.

use super::audio::{AudioBuffer, AudioError, AudioFormat, WavWriter};
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::sync::oneshot;

/// Resolves once the buffer has been fully played (or written).
pub type PlaybackCompletion = oneshot::Receiver<Result<(), AudioError>>;

pub trait AudioSink: Send {
    fn format(&self) -> AudioFormat;

    /// Start a fresh session, discarding anything left from the previous one.
    fn begin(&mut self) -> Result<(), AudioError>;

    /// Queue a buffer directly after the previously queued one.
    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<PlaybackCompletion, AudioError>;

    /// No more buffers follow in this session.
    fn finish(&mut self) -> Result<(), AudioError>;

    /// Drop queued audio and silence output immediately.
    fn stop(&mut self);
}

pub(crate) fn check_format(expected: AudioFormat, buffer: &AudioBuffer) -> Result<(), AudioError> {
    if buffer.format == expected {
        Ok(())
    } else {
        Err(AudioError::FormatMismatch {
            expected,
            actual: buffer.format,
        })
    }
}

/// Scratch directory for rendered audio.
pub fn scratch_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chunked-tts")
}

/// Appends every buffer of a session to one WAV container.
pub struct WavFileSink {
    path: PathBuf,
    format: AudioFormat,
    /// Set for scratch files; deleting on drop unless persisted.
    scratch: Option<TempPath>,
    persist_to: Option<PathBuf>,
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavFileSink {
    /// Sink writing to `path`, truncated at the start of each session.
    pub fn create(path: impl Into<PathBuf>, format: AudioFormat) -> Self {
        Self {
            path: path.into(),
            format,
            scratch: None,
            persist_to: None,
            writer: None,
        }
    }

    /// Sink writing to a temp file under the scratch directory.
    pub fn scratch(format: AudioFormat) -> Result<Self, AudioError> {
        let dir = scratch_dir();
        fs::create_dir_all(&dir)?;
        let temp = tempfile::Builder::new()
            .prefix("speech-")
            .suffix(".wav")
            .tempfile_in(&dir)?
            .into_temp_path();

        let mut sink = Self::create(temp.to_path_buf(), format);
        sink.scratch = Some(temp);
        Ok(sink)
    }

    /// Move the scratch file to `dest` once a session finishes cleanly.
    /// Stopped sessions leave nothing behind.
    pub fn persist_on_finish(mut self, dest: impl Into<PathBuf>) -> Self {
        self.persist_to = Some(dest.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) -> Result<bool, AudioError> {
        match self.writer.take() {
            Some(writer) => {
                let mut inner = writer.finalize()?;
                inner.flush()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&mut self) -> Result<(), AudioError> {
        let Some(dest) = self.persist_to.take() else {
            return Ok(());
        };
        let Some(temp) = self.scratch.take() else {
            return Ok(());
        };
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match temp.persist(&dest) {
            Ok(()) => {}
            // Rename fails across filesystems; fall back to a copy.
            Err(e) => {
                debug!("[WavFileSink] rename failed ({}), copying instead", e.error);
                fs::copy(&e.path, &dest)?;
            }
        }
        info!("[WavFileSink] saved {}", dest.display());
        self.path = dest;
        Ok(())
    }
}

impl AudioSink for WavFileSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn begin(&mut self) -> Result<(), AudioError> {
        self.writer = None;
        let file = File::create(&self.path)?;
        self.writer = Some(WavWriter::new(BufWriter::new(file), self.format)?);
        debug!("[WavFileSink] writing {}", self.path.display());
        Ok(())
    }

    fn enqueue(&mut self, buffer: AudioBuffer) -> Result<PlaybackCompletion, AudioError> {
        check_format(self.format, &buffer)?;
        let writer = self.writer.as_mut().ok_or(AudioError::NoSession)?;
        writer.write_samples(&buffer.samples)?;

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Ok(rx)
    }

    fn finish(&mut self) -> Result<(), AudioError> {
        self.close()?;
        self.persist()
    }

    fn stop(&mut self) {
        // Keep the container valid even when cut short.
        if let Err(e) = self.close() {
            warn!("[WavFileSink] failed to finalize {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> AudioFormat {
        AudioFormat::new(8000, 1, 16)
    }

    #[tokio::test]
    async fn test_file_sink_appends_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut sink = WavFileSink::create(&path, format());

        sink.begin().unwrap();
        let first = sink.enqueue(AudioBuffer::new(1, format(), vec![0.5; 10])).unwrap();
        let second = sink.enqueue(AudioBuffer::new(2, format(), vec![-0.5; 6])).unwrap();
        sink.finish().unwrap();

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 16 * 2);
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 32);
    }

    #[test]
    fn test_file_sink_rejects_wrong_format_and_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = WavFileSink::create(dir.path().join("x.wav"), format());
        assert!(matches!(
            sink.enqueue(AudioBuffer::empty(1, format())),
            Err(AudioError::NoSession)
        ));

        sink.begin().unwrap();
        let stereo = AudioFormat::new(8000, 2, 16);
        assert!(matches!(
            sink.enqueue(AudioBuffer::empty(1, stereo)),
            Err(AudioError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn test_scratch_sink_persists_only_on_finish() {
        let dir = tempfile::tempdir().unwrap();

        let dest = dir.path().join("kept.wav");
        let mut sink = WavFileSink::scratch(format()).unwrap().persist_on_finish(&dest);
        sink.begin().unwrap();
        sink.enqueue(AudioBuffer::new(1, format(), vec![0.1; 4])).unwrap();
        sink.finish().unwrap();
        drop(sink);
        assert_eq!(fs::read(&dest).unwrap().len(), 44 + 8);

        let dropped = dir.path().join("dropped.wav");
        let mut sink = WavFileSink::scratch(format()).unwrap().persist_on_finish(&dropped);
        let scratch_path = sink.path().to_path_buf();
        sink.begin().unwrap();
        sink.stop();
        drop(sink);
        assert!(!dropped.exists());
        assert!(!scratch_path.exists());
    }
}
