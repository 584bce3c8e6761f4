//! Splitting a byte stream into lines

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::{Reader, StreamResult};

/// Bytes inspected when sniffing the newline convention.
pub const SNIFF_BYTES: usize = 4096;

/// Newline candidates, in tie-break order.
pub const NEWLINE_CANDIDATES: [&str; 3] = ["\r\n", "\n", "\r"];

/// Pick the most frequent newline sequence in `sample`.
///
/// A `\r\n` pair is counted once as `\r\n` and never as a lone `\r` or `\n`.
/// Falls back to `\n` when the sample holds no line break at all.
pub fn detect_newline(sample: &[u8]) -> &'static str {
    let mut counts = [0usize; 3];
    let mut i = 0;
    while i < sample.len() {
        match sample[i] {
            b'\r' if sample.get(i + 1) == Some(&b'\n') => {
                counts[0] += 1;
                i += 1;
            },
            b'\n' => counts[1] += 1,
            b'\r' => counts[2] += 1,
            _ => {},
        }
        i += 1;
    }

    let mut best = 1;
    for (idx, count) in counts.iter().enumerate() {
        if *count > counts[best] || (*count == counts[best] && idx < best && *count > 0) {
            best = idx;
        }
    }
    NEWLINE_CANDIDATES[best]
}

/// Reads a byte stream line by line.
///
/// Lines are returned without their terminator. Undelimited trailing bytes
/// are held back until the underlying reader is exhausted and then returned
/// as the final line.
pub struct LineReader<R> {
    inner: R,
    newline: Vec<u8>,
    buffer: BytesMut,
    /// Bytes of `buffer` already searched for a newline.
    scanned: usize,
    finished: bool,
}

impl<R> LineReader<R>
where
    R: Reader<Item = Bytes>,
{
    pub fn new(inner: R, newline: impl Into<String>) -> Self {
        Self {
            inner,
            newline: newline.into().into_bytes(),
            buffer: BytesMut::new(),
            scanned: 0,
            finished: false,
        }
    }

    /// Detect the newline sequence from the first [`SNIFF_BYTES`] of `inner`,
    /// rewind it and return a reader using the detected sequence.
    pub async fn sniff(mut inner: R) -> StreamResult<Self> {
        let sample = read_sample(&mut inner, SNIFF_BYTES).await?;
        inner.rewind().await?;
        Ok(Self::new(inner, detect_newline(&sample)))
    }

    pub fn newline(&self) -> &[u8] {
        &self.newline
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    fn take_line(&mut self) -> StreamResult<Option<String>> {
        // A newline may straddle the previous scan boundary.
        let from = self.scanned.saturating_sub(self.newline.len().saturating_sub(1));
        let Some(pos) = find(&self.buffer[from..], &self.newline).map(|p| p + from) else {
            self.scanned = self.buffer.len();
            return Ok(None);
        };
        let mut line = self.buffer.split_to(pos + self.newline.len());
        line.truncate(pos);
        self.scanned = 0;
        Ok(Some(String::from_utf8(line.to_vec())?))
    }
}

/// Read at least `limit` bytes (or everything, if shorter) from `reader`.
pub async fn read_sample<R>(reader: &mut R, limit: usize) -> StreamResult<Vec<u8>>
where
    R: Reader<Item = Bytes> + ?Sized,
{
    let mut sample = Vec::with_capacity(limit);
    while sample.len() < limit && !reader.eof() {
        match reader.read().await? {
            Some(chunk) => sample.extend_from_slice(&chunk),
            None => break,
        }
    }
    Ok(sample)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[async_trait]
impl<R> Reader for LineReader<R>
where
    R: Reader<Item = Bytes>,
{
    type Item = String;

    async fn read(&mut self) -> StreamResult<Option<String>> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(Some(line));
            }
            if self.finished {
                return Ok(None);
            }
            match self.inner.read().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    self.finished = true;
                    if !self.buffer.is_empty() {
                        let rest = self.buffer.split();
                        self.scanned = 0;
                        return Ok(Some(String::from_utf8(rest.to_vec())?));
                    }
                },
            }
        }
    }

    fn eof(&self) -> bool {
        self.buffer.is_empty() && (self.finished || self.inner.eof())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.inner.close().await
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        self.inner.rewind().await?;
        self.buffer.clear();
        self.scanned = 0;
        self.finished = false;
        Ok(())
    }
}
