//! Line framing for the evaluation protocol.
//!
//! # Wire Format
//!
//! Outbound, every unit is the caller's text followed by a single `\n`:
//!
//! ```text
//! @session 3f0c…\n
//! 1+1\n
//! ```
//!
//! The text is not escaped, so a payload that itself contains newlines is
//! sent as-is; only the final newline is structural.
//!
//! Inbound, the server writes unframed chunks. [`InboundFraming::Chunk`]
//! treats each socket read as one unit, which is what existing servers
//! expect but splits any document that straddles two reads.
//! [`InboundFraming::Lines`] buffers until `\n` instead.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum bytes buffered while waiting for a newline (16MB).
///
/// A line longer than this is emitted as-is rather than growing forever.
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// How inbound bytes are split into units for decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundFraming {
    /// Every read from the socket is one unit.
    ///
    /// Reads are at most 64 KiB, and the transport may split a write at any
    /// point; servers sending larger documents need [`InboundFraming::Lines`].
    #[default]
    Chunk,
    /// Every `\n`-terminated line is one unit.
    Lines,
}

/// Build the handshake line announcing `session_id`.
pub fn handshake_line(session_id: &str) -> String {
    format!("@session {}", session_id)
}

/// Write `text` followed by a newline and flush.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_line<W>(writer: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut unit = Vec::with_capacity(text.len() + 1);
    unit.extend_from_slice(text.as_bytes());
    unit.push(b'\n');

    writer
        .write_all(&unit)
        .await
        .context("Failed to write line")?;

    writer.flush().await.context("Failed to flush line")?;

    Ok(())
}

/// Accumulates bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    /// Append `bytes` and return every line completed by them, without the
    /// trailing `\n` (a preceding `\r` is kept; decoding trims it).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }

        if self.buffer.len() > MAX_LINE_SIZE {
            let overflow = std::mem::take(&mut self.buffer);
            lines.push(String::from_utf8_lossy(&overflow).into_owned());
        }

        lines
    }

    /// Take whatever partial line remains, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Splits inbound reads into decodable units according to the framing mode.
#[derive(Debug)]
pub struct InboundSplitter {
    framing: InboundFraming,
    lines: LineAssembler,
}

impl InboundSplitter {
    pub fn new(framing: InboundFraming) -> Self {
        Self {
            framing,
            lines: LineAssembler::default(),
        }
    }

    /// Units produced by one read.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        match self.framing {
            InboundFraming::Chunk => vec![String::from_utf8_lossy(bytes).into_owned()],
            InboundFraming::Lines => self.lines.push(bytes),
        }
    }

    /// Units left over when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        match self.framing {
            InboundFraming::Chunk => None,
            InboundFraming::Lines => self.lines.finish(),
        }
    }
}
