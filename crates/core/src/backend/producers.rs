//! Built-in chunk producers
//!
//! Each producer reads one named input of the request and emits its bytes
//! under one named output:
//!
//! - [`ByteChunkProducer`] slices the payload into fixed-size chunks
//! - [`FrameSequenceProducer`] groups fixed-size frames into short sequences
//! - [`SpooledProducer`] spools the payload to a temporary file first

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::producer::{ChunkProducer, ProducerFactory};
use crate::data::{DataType, InferRequest, Tensor};
use crate::{Error, Result};

/// Frames per emitted sequence unless configured otherwise
pub const DEFAULT_FRAMES_PER_SEQUENCE: usize = 5;

fn input_bytes(request: &InferRequest, input: &str) -> Result<Bytes> {
    request
        .input(input)
        .map(|t| t.data.clone())
        .ok_or_else(|| {
            Error::InvalidRequest(format!(
                "request '{}' has no input named '{}'",
                request.id, input
            ))
        })
}

fn require_nonzero(what: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::ConfigError(format!("{} must be greater than 0", what)));
    }
    Ok(())
}

/// Slices one input into fixed-size chunks; the last chunk may be short
pub struct ByteChunkProducer {
    data: Bytes,
    output: String,
    chunk_size: usize,
    offset: usize,
}

impl ByteChunkProducer {
    /// Create a producer over `data`
    pub fn new(data: Bytes, output: impl Into<String>, chunk_size: usize) -> Result<Self> {
        require_nonzero("chunk_size", chunk_size)?;
        Ok(Self {
            data,
            output: output.into(),
            chunk_size,
            offset: 0,
        })
    }
}

#[async_trait]
impl ChunkProducer for ByteChunkProducer {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Tensor>>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        Ok(Some(vec![Tensor::from_bytes(self.output.clone(), chunk)]))
    }
}

/// Factory for [`ByteChunkProducer`]
#[derive(Debug, Clone)]
pub struct ByteChunkFactory {
    input: String,
    output: String,
    chunk_size: usize,
}

impl ByteChunkFactory {
    /// Read `input`, emit `chunk_size`-byte chunks as `output`
    pub fn new(input: impl Into<String>, output: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            chunk_size,
        }
    }
}

#[async_trait]
impl ProducerFactory for ByteChunkFactory {
    async fn open(&self, request: &InferRequest) -> Result<Box<dyn ChunkProducer>> {
        let data = input_bytes(request, &self.input)?;
        Ok(Box::new(ByteChunkProducer::new(
            data,
            self.output.clone(),
            self.chunk_size,
        )?))
    }
}

/// Emits `[frames, frame_size]` UINT8 sequences of up to `frames_per_sequence` frames
///
/// The payload must hold a whole number of frames. A trailing partial frame
/// is reported as a failure once every complete frame has been emitted.
pub struct FrameSequenceProducer {
    data: Bytes,
    output: String,
    frame_size: usize,
    frames_per_sequence: usize,
    offset: usize,
    sequences: usize,
}

impl FrameSequenceProducer {
    /// Create a producer over `data`
    pub fn new(
        data: Bytes,
        output: impl Into<String>,
        frame_size: usize,
        frames_per_sequence: usize,
    ) -> Result<Self> {
        require_nonzero("frame_size", frame_size)?;
        require_nonzero("frames_per_sequence", frames_per_sequence)?;
        Ok(Self {
            data,
            output: output.into(),
            frame_size,
            frames_per_sequence,
            offset: 0,
            sequences: 0,
        })
    }
}

#[async_trait]
impl ChunkProducer for FrameSequenceProducer {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Tensor>>> {
        let remaining = self.data.len() - self.offset;
        if remaining == 0 {
            return Ok(None);
        }

        let frames = (remaining / self.frame_size).min(self.frames_per_sequence);
        if frames == 0 {
            return Err(Error::ProducerFailure(format!(
                "trailing partial frame of {} bytes after {} sequence(s) (frame size {})",
                remaining, self.sequences, self.frame_size
            )));
        }

        let end = self.offset + frames * self.frame_size;
        let sequence = self.data.slice(self.offset..end);
        self.offset = end;
        self.sequences += 1;

        let tensor = Tensor::new(
            self.output.clone(),
            DataType::Uint8,
            vec![frames, self.frame_size],
            sequence,
        )?;
        Ok(Some(vec![tensor]))
    }
}

/// Factory for [`FrameSequenceProducer`]
#[derive(Debug, Clone)]
pub struct FrameSequenceFactory {
    input: String,
    output: String,
    frame_size: usize,
    frames_per_sequence: usize,
}

impl FrameSequenceFactory {
    /// Read `input` as frames of `frame_size` bytes
    pub fn new(input: impl Into<String>, output: impl Into<String>, frame_size: usize) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            frame_size,
            frames_per_sequence: DEFAULT_FRAMES_PER_SEQUENCE,
        }
    }

    /// Override the number of frames per sequence
    pub fn with_frames_per_sequence(mut self, frames: usize) -> Self {
        self.frames_per_sequence = frames;
        self
    }
}

#[async_trait]
impl ProducerFactory for FrameSequenceFactory {
    async fn open(&self, request: &InferRequest) -> Result<Box<dyn ChunkProducer>> {
        let data = input_bytes(request, &self.input)?;
        Ok(Box::new(FrameSequenceProducer::new(
            data,
            self.output.clone(),
            self.frame_size,
            self.frames_per_sequence,
        )?))
    }
}

/// Spools the payload to a temporary file and reads it back in chunks
///
/// The file lives as long as the producer; `close` (or drop) removes it.
pub struct SpooledProducer {
    spool: Option<NamedTempFile>,
    reader: Option<tokio::fs::File>,
    output: String,
    chunk_size: usize,
}

impl SpooledProducer {
    /// Write `data` to a fresh temporary file and open it for reading
    pub async fn spool(data: &[u8], output: impl Into<String>, chunk_size: usize) -> Result<Self> {
        require_nonzero("chunk_size", chunk_size)?;

        let spool = NamedTempFile::new()?;
        tokio::fs::write(spool.path(), data).await?;
        let reader = tokio::fs::File::open(spool.path()).await?;
        debug!(
            "Spooled {} bytes to {}",
            data.len(),
            spool.path().display()
        );

        Ok(Self {
            spool: Some(spool),
            reader: Some(reader),
            output: output.into(),
            chunk_size,
        })
    }

    /// Location of the spool file while it exists
    pub fn path(&self) -> Option<&Path> {
        self.spool.as_ref().map(NamedTempFile::path)
    }
}

#[async_trait]
impl ChunkProducer for SpooledProducer {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Tensor>>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::ProducerFailure("spool already closed".into()))?;

        let mut buf = Vec::with_capacity(self.chunk_size);
        reader
            .take(self.chunk_size as u64)
            .read_to_end(&mut buf)
            .await?;

        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(vec![Tensor::from_bytes(self.output.clone(), buf)]))
    }

    async fn close(&mut self) -> Result<()> {
        self.reader.take();
        if let Some(spool) = self.spool.take() {
            let path: PathBuf = spool.path().to_path_buf();
            spool.close()?;
            debug!("Removed spool file {}", path.display());
        }
        Ok(())
    }
}

/// Factory for [`SpooledProducer`]
#[derive(Debug, Clone)]
pub struct SpooledFactory {
    input: String,
    output: String,
    chunk_size: usize,
}

impl SpooledFactory {
    /// Spool `input`, emit `chunk_size`-byte chunks as `output`
    pub fn new(input: impl Into<String>, output: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            chunk_size,
        }
    }
}

#[async_trait]
impl ProducerFactory for SpooledFactory {
    async fn open(&self, request: &InferRequest) -> Result<Box<dyn ChunkProducer>> {
        let data = input_bytes(request, &self.input)?;
        Ok(Box::new(
            SpooledProducer::spool(&data, self.output.clone(), self.chunk_size).await?,
        ))
    }
}
