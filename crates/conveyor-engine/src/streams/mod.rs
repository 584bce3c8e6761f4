//! Pull/push streaming primitives
//!
//! Every stage of an ETL pipeline is either a [`Reader`] (pulled with
//! `read`) or a [`Writer`] (pushed with `write`). Stages compose by
//! ownership: a reader wrapping another reader owns it and closes it from its
//! own `close`. Data never has to fit in memory; [`pipe`] moves one chunk at
//! a time and back-pressure comes from `write` simply taking as long as the
//! sink needs.
//!
//! ```text
//! CursorReader -> CsvGenerator -> pipe -> S3Writer          (export)
//! S3Reader -> LineReader -> CsvReader -> pipe -> InsertWriter (import)
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use thiserror::Error;

use crate::storage::StorageError;

pub mod csv;
pub mod database;
pub mod gzip;
pub mod line;
pub mod s3;

pub use self::csv::{CsvGenerator, CsvOptions, CsvReader, CsvWriter, HeaderMode};
pub use self::database::{CopyWriter, CursorQuery, CursorReader, InsertWriter};
pub use self::gzip::GzipReader;
pub use self::line::LineReader;
pub use self::s3::{S3Reader, S3Writer, S3WriterOptions};

/// A batch of database rows; `None` is SQL NULL.
pub type RowBatch = Vec<Vec<Option<String>>>;

/// Errors raised by stream stages
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream does not support {0}")]
    Unsupported(&'static str),

    #[error("Stream is already closed")]
    Closed,

    #[error("Invalid UTF-8 in stream: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Malformed CSV on line {line}: {message}")]
    Csv { line: usize, message: String },

    /// `row` counts the data rows seen by the stage that raised it,
    /// starting at 1; header rows are not counted.
    #[error("Row {row} has {actual} columns, expected {expected}")]
    RowArity {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid CSV option: {0}")]
    CsvOption(String),

    #[error("CSV encoding failed: {0}")]
    CsvEncode(#[from] ::csv::Error),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Source side of a pipeline.
///
/// `read` returns `Ok(None)` once the source is exhausted. `eof` may turn
/// true before that final `None` is observed, but never after data remains.
#[async_trait]
pub trait Reader: Send {
    type Item: Send;

    async fn read(&mut self) -> StreamResult<Option<Self::Item>>;

    fn eof(&self) -> bool;

    async fn close(&mut self) -> StreamResult<()>;

    /// Restart from the first chunk. Only sources that can be re-read
    /// (object storage, in-memory buffers) implement this.
    async fn rewind(&mut self) -> StreamResult<()> {
        Err(StreamError::Unsupported("rewind"))
    }
}

/// Sink side of a pipeline.
#[async_trait]
pub trait Writer: Send {
    type Item: Send;

    async fn write(&mut self, item: Self::Item) -> StreamResult<()>;

    async fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()>;

    async fn rewind(&mut self) -> StreamResult<()> {
        Err(StreamError::Unsupported("rewind"))
    }
}

#[async_trait]
impl<R: Reader + ?Sized> Reader for Box<R> {
    type Item = R::Item;

    async fn read(&mut self) -> StreamResult<Option<Self::Item>> {
        (**self).read().await
    }

    fn eof(&self) -> bool {
        (**self).eof()
    }

    async fn close(&mut self) -> StreamResult<()> {
        (**self).close().await
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        (**self).rewind().await
    }
}

#[async_trait]
impl<W: Writer + ?Sized> Writer for Box<W> {
    type Item = W::Item;

    async fn write(&mut self, item: Self::Item) -> StreamResult<()> {
        (**self).write(item).await
    }

    async fn flush(&mut self) -> StreamResult<()> {
        (**self).flush().await
    }

    async fn close(&mut self) -> StreamResult<()> {
        (**self).close().await
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        (**self).rewind().await
    }
}

/// Drain `reader` into `writer`, returning the number of chunks moved.
///
/// Neither side is closed; the caller owns both and decides how to finish
/// them (complete vs. abort) depending on the outcome.
pub async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> StreamResult<u64>
where
    R: Reader + ?Sized,
    W: Writer<Item = R::Item> + ?Sized,
{
    pipe_with(reader, writer, Ok).await
}

/// [`pipe`] with a per-chunk transform applied between the two stages.
pub async fn pipe_with<R, W, F>(reader: &mut R, writer: &mut W, mut transform: F) -> StreamResult<u64>
where
    R: Reader + ?Sized,
    W: Writer + ?Sized,
    F: FnMut(R::Item) -> StreamResult<W::Item> + Send,
{
    let mut chunks = 0u64;
    while !reader.eof() {
        let Some(chunk) = reader.read().await? else {
            break;
        };
        writer.write(transform(chunk)?).await?;
        chunks += 1;
    }
    Ok(chunks)
}

/// In-memory reader over a fixed list of chunks. Rewindable.
#[derive(Debug, Clone)]
pub struct IterReader<T> {
    items: Vec<T>,
    pos: usize,
    closed: bool,
}

impl<T> IterReader<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
            pos: 0,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Reader for IterReader<T> {
    type Item = T;

    async fn read(&mut self) -> StreamResult<Option<T>> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        let item = self.items.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        Ok(item)
    }

    fn eof(&self) -> bool {
        self.pos >= self.items.len()
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.closed = true;
        Ok(())
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        self.pos = 0;
        self.closed = false;
        Ok(())
    }
}

/// In-memory writer collecting every chunk it receives.
#[derive(Debug, Default)]
pub struct CollectWriter<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> CollectWriter<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            closed: false,
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items.into()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl CollectWriter<bytes::Bytes> {
    /// All collected byte chunks joined together.
    pub fn concat(&self) -> Vec<u8> {
        self.items.iter().flat_map(|b| b.iter().copied()).collect()
    }
}

#[async_trait]
impl<T: Send> Writer for CollectWriter<T> {
    type Item = T;

    async fn write(&mut self, item: T) -> StreamResult<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.items.push_back(item);
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.closed = true;
        Ok(())
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        self.items.clear();
        self.closed = false;
        Ok(())
    }
}
