//! PCM audio buffers and the WAV container writer.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Size of the canonical RIFF/WAVE header.
pub const WAV_HEADER_LEN: usize = 44;

/// RIFF size field for an empty payload: the header minus the 8-byte RIFF preamble.
const RIFF_BASE_SIZE: u32 = (WAV_HEADER_LEN - 8) as u32;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio output device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Playback interrupted: {0}")]
    Interrupted(String),
    #[error("Buffer format {actual} does not match sink format {expected}")]
    FormatMismatch {
        expected: AudioFormat,
        actual: AudioFormat,
    },
    #[error("No playback session is active")]
    NoSession,
    #[error("WAV payload of {0} bytes exceeds the 4 GiB container limit")]
    PayloadTooLarge(u64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Sample layout fixed per pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * u32::from(self.block_align())
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(22050, 1, 16)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz/{} ch/{}-bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// Finished audio for one chunk. Samples are interleaved `f32` in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub chunk_index: usize,
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(chunk_index: usize, format: AudioFormat, samples: Vec<f32>) -> Self {
        Self {
            chunk_index,
            format,
            samples,
        }
    }

    pub fn empty(chunk_index: usize, format: AudioFormat) -> Self {
        Self::new(chunk_index, format, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.format.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.format.sample_rate))
    }

    /// Encode as an in-memory WAV file.
    pub fn to_wav(&self) -> Result<Vec<u8>, AudioError> {
        let payload = self.samples.len() * self.format.bytes_per_sample();
        let mut writer = WavWriter::new(
            Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + payload)),
            self.format,
        )?;
        writer.write_samples(&self.samples)?;
        Ok(writer.finalize()?.into_inner())
    }
}

/// Canonical 44-byte header for a PCM payload of `data_len` bytes.
pub fn wav_header(format: AudioFormat, data_len: u32) -> [u8; WAV_HEADER_LEN] {
    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&RIFF_BASE_SIZE.saturating_add(data_len).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&format.byte_rate().to_le_bytes());
    header[32..34].copy_from_slice(&format.block_align().to_le_bytes());
    header[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    header
}

/// Write a header-only container: structurally valid, zero-length, silent.
pub fn write_empty_wav(path: &Path, format: AudioFormat) -> Result<(), AudioError> {
    fs::write(path, wav_header(format, 0))?;
    Ok(())
}

fn encode_sample(sample: f32, bits_per_sample: u16, out: &mut Vec<u8>) {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    match bits_per_sample {
        8 => {
            let value = if clamped < 0.0 {
                clamped * 128.0
            } else {
                clamped * 127.0
            };
            out.push((value as i16 + 128) as u8);
        }
        32 => {
            let value = if clamped < 0.0 {
                f64::from(clamped) * 2_147_483_648.0
            } else {
                f64::from(clamped) * 2_147_483_647.0
            };
            out.extend_from_slice(&(value as i32).to_le_bytes());
        }
        _ => {
            let value = if clamped < 0.0 {
                clamped * 32768.0
            } else {
                clamped * 32767.0
            };
            out.extend_from_slice(&(value as i16).to_le_bytes());
        }
    }
}

/// Streaming WAV writer.
///
/// The header goes out first with zero sizes; [`WavWriter::finalize`] seeks
/// back and patches the RIFF and `data` size fields once the payload length
/// is known.
pub struct WavWriter<W: Write + Seek> {
    inner: W,
    format: AudioFormat,
    data_len: u64,
    scratch: Vec<u8>,
}

impl<W: Write + Seek> WavWriter<W> {
    pub fn new(mut inner: W, format: AudioFormat) -> Result<Self, AudioError> {
        inner.write_all(&wav_header(format, 0))?;
        Ok(Self {
            inner,
            format,
            data_len: 0,
            scratch: Vec::new(),
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Payload bytes written so far.
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    pub fn write_samples(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        let added = (samples.len() * self.format.bytes_per_sample()) as u64;
        let total = self.data_len + added;
        if total + u64::from(RIFF_BASE_SIZE) > u64::from(u32::MAX) {
            return Err(AudioError::PayloadTooLarge(total));
        }

        self.scratch.clear();
        self.scratch.reserve(added as usize);
        for &sample in samples {
            encode_sample(sample, self.format.bits_per_sample, &mut self.scratch);
        }
        self.inner.write_all(&self.scratch)?;
        self.data_len = total;
        Ok(())
    }

    /// Patch the size fields and hand back the underlying writer.
    pub fn finalize(mut self) -> Result<W, AudioError> {
        let data_len = self.data_len as u32;
        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(4))?;
        self.inner
            .write_all(&(RIFF_BASE_SIZE + data_len).to_le_bytes())?;
        self.inner.seek(SeekFrom::Start(40))?;
        self.inner.write_all(&data_len.to_le_bytes())?;
        self.inner.seek(SeekFrom::Start(end))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}
