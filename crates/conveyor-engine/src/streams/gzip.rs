//! Gzip decompression stage

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzDecoder;
use std::io::Write;

use super::{Reader, StreamResult};

/// Inflates a gzip-compressed byte stream chunk by chunk.
///
/// Compressed chunks are pushed through a [`GzDecoder`] writing into an
/// in-memory buffer, so only one chunk's worth of output is held at a time.
pub struct GzipReader<R> {
    inner: R,
    decoder: GzDecoder<Vec<u8>>,
    finished: bool,
}

impl<R> GzipReader<R>
where
    R: Reader<Item = Bytes>,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: GzDecoder::new(Vec::new()),
            finished: false,
        }
    }

    fn take_output(&mut self) -> Option<Bytes> {
        let out = std::mem::take(self.decoder.get_mut());
        (!out.is_empty()).then(|| Bytes::from(out))
    }
}

#[async_trait]
impl<R> Reader for GzipReader<R>
where
    R: Reader<Item = Bytes>,
{
    type Item = Bytes;

    async fn read(&mut self) -> StreamResult<Option<Bytes>> {
        while !self.finished {
            match self.inner.read().await? {
                Some(chunk) => {
                    self.decoder.write_all(&chunk)?;
                    if let Some(out) = self.take_output() {
                        return Ok(Some(out));
                    }
                },
                None => {
                    self.decoder.try_finish()?;
                    self.finished = true;
                },
            }
        }
        Ok(self.take_output())
    }

    fn eof(&self) -> bool {
        self.finished && self.decoder.get_ref().is_empty()
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.inner.close().await
    }

    async fn rewind(&mut self) -> StreamResult<()> {
        self.inner.rewind().await?;
        self.decoder = GzDecoder::new(Vec::new());
        self.finished = false;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::streams::{IterReader, LineReader};
    use flate2::{write::GzEncoder, Compression};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_inflates_chunked_input() {
        let compressed = gzip(b"id,name\n1,alpha\n2,beta\n");
        let chunks: Vec<Bytes> = compressed
            .chunks(7)
            .map(Bytes::copy_from_slice)
            .collect();

        let mut reader = GzipReader::new(IterReader::new(chunks));
        let mut out = Vec::new();
        while let Some(chunk) = reader.read().await.unwrap() {
            out.extend_from_slice(&chunk);
        }

        assert!(reader.eof());
        assert_eq!(out, b"id,name\n1,alpha\n2,beta\n");
    }

    #[tokio::test]
    async fn test_composes_with_line_reader() {
        let compressed = Bytes::from(gzip(b"a\nb\n"));
        let mut lines = LineReader::new(GzipReader::new(IterReader::new(vec![compressed])), "\n");

        assert_eq!(lines.read().await.unwrap().as_deref(), Some("a"));
        assert_eq!(lines.read().await.unwrap().as_deref(), Some("b"));
        assert_eq!(lines.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_plain_input() {
        let plain = Bytes::from_static(b"plain text that is not gzip data\n");
        let mut reader = GzipReader::new(IterReader::new(vec![plain]));
        assert!(reader.read().await.is_err());
    }
}
