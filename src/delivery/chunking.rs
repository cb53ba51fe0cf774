//! Chunked transfer for messages above the host's size limit.
//!
//! The sender splits the serialized wire message into ordered
//! `CHUNKED_MESSAGE` frames and finishes with `CHUNKED_MESSAGE_COMPLETE`. The
//! receiver buffers frames by message id and only hands out the message once
//! every index `0..total_chunks` has arrived.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use thiserror::Error;
use uuid::Uuid;

use crate::runtime::protocol::{ChunkFrame, CHUNKED_MESSAGE};

/// Split `serialized` into frames of at most `chunk_size` bytes, never cutting a
/// UTF-8 sequence.
pub fn split_into_frames(message_id: Uuid, serialized: &str, chunk_size: usize) -> Vec<ChunkFrame> {
    let chunk_size = chunk_size.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < serialized.len() {
        let mut end = (start + chunk_size).min(serialized.len());
        while !serialized.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !serialized.is_char_boundary(end) {
                end += 1;
            }
        }
        pieces.push(&serialized[start..end]);
        start = end;
    }

    let total_chunks = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(chunk_index, chunk)| ChunkFrame {
            kind: CHUNKED_MESSAGE.to_string(),
            message_id,
            chunk_index,
            total_chunks,
            chunk: chunk.to_string(),
            is_last: chunk_index + 1 == total_chunks,
        })
        .collect()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("message {message_id} announced {expected} chunks, frame says {actual}")]
    InconsistentTotal {
        message_id: Uuid,
        expected: usize,
        actual: usize,
    },

    #[error("chunk {index} out of range for message {message_id} ({total} chunks)")]
    IndexOutOfRange {
        message_id: Uuid,
        index: usize,
        total: usize,
    },

    #[error("message {message_id} incomplete: {received}/{total} chunks")]
    Incomplete {
        message_id: Uuid,
        received: usize,
        total: usize,
    },

    #[error("no chunks buffered for message {0}")]
    UnknownMessage(Uuid),

    #[error("reassembled message is not valid JSON: {0}")]
    InvalidPayload(String),
}

struct Buffer {
    chunks: Vec<Option<String>>,
    received: usize,
    last_seen: Instant,
}

/// Receiver-side reassembly buffer.
pub struct ChunkAssembler {
    buffers: HashMap<Uuid, Buffer>,
    ttl: Duration,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ChunkAssembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            ttl,
        }
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn accept(&mut self, frame: ChunkFrame) -> Result<(), AssemblyError> {
        if frame.chunk_index >= frame.total_chunks {
            return Err(AssemblyError::IndexOutOfRange {
                message_id: frame.message_id,
                index: frame.chunk_index,
                total: frame.total_chunks,
            });
        }

        let buffer = self
            .buffers
            .entry(frame.message_id)
            .or_insert_with(|| Buffer {
                chunks: vec![None; frame.total_chunks],
                received: 0,
                last_seen: Instant::now(),
            });

        if buffer.chunks.len() != frame.total_chunks {
            return Err(AssemblyError::InconsistentTotal {
                message_id: frame.message_id,
                expected: buffer.chunks.len(),
                actual: frame.total_chunks,
            });
        }

        let slot = &mut buffer.chunks[frame.chunk_index];
        if slot.is_none() {
            buffer.received += 1;
        }
        *slot = Some(frame.chunk);
        buffer.last_seen = Instant::now();
        Ok(())
    }

    /// Reassemble after the completion marker. An incomplete buffer is kept so
    /// late frames can still land.
    pub fn complete(&mut self, message_id: Uuid) -> Result<serde_json::Value, AssemblyError> {
        let buffer = self
            .buffers
            .get(&message_id)
            .ok_or(AssemblyError::UnknownMessage(message_id))?;

        if buffer.received != buffer.chunks.len() {
            return Err(AssemblyError::Incomplete {
                message_id,
                received: buffer.received,
                total: buffer.chunks.len(),
            });
        }

        let buffer = self
            .buffers
            .remove(&message_id)
            .ok_or(AssemblyError::UnknownMessage(message_id))?;
        let joined: String = buffer.chunks.into_iter().flatten().collect();
        serde_json::from_str(&joined).map_err(|err| AssemblyError::InvalidPayload(err.to_string()))
    }

    /// Drop buffers that have not seen a frame within the ttl.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.saturating_duration_since(buffer.last_seen) < ttl);
        before - self.buffers.len()
    }
}
