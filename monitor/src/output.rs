//! Status output for the bar.
//!
//! Each record is written as one JSON object per line, the format Waybar
//! custom modules read from a long-running `exec` command.

use std::io::{self, Write};

use serde::Serialize;
use thiserror::Error;

/// Errors from writing a status record.
#[derive(Error, Debug)]
pub enum OutputError {
    /// The record could not be serialized.
    #[error("failed to serialize status: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The underlying writer failed.
    #[error("failed to write status: {0}")]
    Write(#[from] io::Error),
}

/// What the bar shows: a line of text and a hover tooltip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tooltip: String,
}

/// Destination for status records.
pub trait StatusSink {
    /// Writes one record.
    fn emit(&mut self, record: &StatusRecord) -> Result<(), OutputError>;
}

/// Writes records as JSON lines and flushes after each.
#[derive(Debug)]
pub struct JsonLineSink<W: Write> {
    writer: W,
}

impl JsonLineSink<io::Stdout> {
    /// A sink on the process stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> StatusSink for JsonLineSink<W> {
    fn emit(&mut self, record: &StatusRecord) -> Result<(), OutputError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}
