//! Audio input seam.
//!
//! The decoder core never talks to capture hardware. It pulls 16-bit mono
//! samples from an [`AudioSource`], which is implemented here for WAV files,
//! in-memory buffers and a bounded channel fed by an optional producer
//! thread. Capture backends live outside the crate and plug in through the
//! same trait.

use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("end of input")]
    Eof,

    #[error("segment boundary in input")]
    SegmentBoundary,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("unsupported audio format: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A pull-style source of signed 16-bit mono samples.
///
/// `pull` fills as much of `buf` as is available right now and returns the
/// number of samples written. `Ok(0)` means no data is available yet
/// (non-blocking empty); `Err(Eof)` means the stream is finished;
/// `Err(SegmentBoundary)` means the producer marked an utterance boundary
/// and more data may follow.
pub trait AudioSource {
    fn pull(&mut self, buf: &mut [i16]) -> Result<usize, AudioError>;

    /// Sampling rate of the source in Hz.
    fn sample_rate(&self) -> u32;
}

/// Audio source backed by an in-memory sample buffer.
pub struct BufferSource {
    samples: Vec<i16>,
    pos: usize,
    rate: u32,
}

impl BufferSource {
    pub fn new(samples: Vec<i16>, rate: u32) -> Self {
        Self {
            samples,
            pos: 0,
            rate,
        }
    }
}

impl AudioSource for BufferSource {
    fn pull(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if self.pos >= self.samples.len() {
            return Err(AudioError::Eof);
        }
        let n = buf.len().min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

/// Audio source reading a 16-bit mono WAV file.
pub struct WavFileSource {
    samples: Vec<i16>,
    pos: usize,
    rate: u32,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let reader = hound::WavReader::open(path.as_ref())
            .map_err(|e| AudioError::Device(format!("failed to open WAV: {}", e)))?;
        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(AudioError::Format(format!(
                "expected mono input, got {} channels",
                spec.channels
            )));
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(AudioError::Format(format!(
                "expected 16-bit integer samples, got {}-bit {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }
        let rate = spec.sample_rate;
        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AudioError::Device(format!("failed to read WAV samples: {}", e)))?;
        log::info!(
            "WAV input: {} samples at {} Hz ({:.2}s)",
            samples.len(),
            rate,
            samples.len() as f32 / rate as f32
        );
        Ok(Self {
            samples,
            pos: 0,
            rate,
        })
    }
}

impl AudioSource for WavFileSource {
    fn pull(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if self.pos >= self.samples.len() {
            return Err(AudioError::Eof);
        }
        let n = buf.len().min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

/// A message on the capture channel.
pub enum AudioChunk {
    /// Samples captured since the last message.
    Samples(Vec<i16>),
    /// The producer detected an utterance boundary.
    SegmentBoundary,
}

/// Audio source fed by a bounded SPSC channel from a capture thread.
///
/// The decoding thread drains this without blocking; a closed sender is
/// reported as end of input.
pub struct ChannelSource {
    rx: Receiver<AudioChunk>,
    pending: Vec<i16>,
    pending_pos: usize,
    rate: u32,
    boundary_seen: bool,
}

/// Create a bounded channel pair for feeding audio from a sibling thread.
pub fn channel_source(capacity: usize, rate: u32) -> (SyncSender<AudioChunk>, ChannelSource) {
    let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
    (
        tx,
        ChannelSource {
            rx,
            pending: Vec::new(),
            pending_pos: 0,
            rate,
            boundary_seen: false,
        },
    )
}

impl AudioSource for ChannelSource {
    fn pull(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if self.boundary_seen {
            self.boundary_seen = false;
            return Err(AudioError::SegmentBoundary);
        }
        if self.pending_pos >= self.pending.len() {
            match self.rx.try_recv() {
                Ok(AudioChunk::Samples(s)) => {
                    self.pending = s;
                    self.pending_pos = 0;
                }
                Ok(AudioChunk::SegmentBoundary) => return Err(AudioError::SegmentBoundary),
                Err(TryRecvError::Empty) => return Ok(0),
                Err(TryRecvError::Disconnected) => return Err(AudioError::Eof),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pending_pos);
        buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}
