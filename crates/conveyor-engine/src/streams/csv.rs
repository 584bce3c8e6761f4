//! CSV codec
//!
//! [`CsvReader`] parses lines into rows, [`CsvWriter`] encodes rows into a byte
//! sink and [`CsvGenerator`] turns database row batches into CSV chunks. The
//! three share [`CsvOptions`]; any separator left unset on a reader built with
//! [`CsvReader::sniffed`] is detected from a sample of the input.
//!
//! Records are parsed with `csv_core` and written with `csv`. Separators and
//! quotes must be single ASCII characters; the row separator is `\r\n` or one
//! ASCII character.

use ::csv::{QuoteStyle, WriterBuilder};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use csv_core::ReadRecordResult;
use serde::Deserialize;

use super::line::{detect_newline, read_sample, LineReader, SNIFF_BYTES};
use super::{Reader, RowBatch, StreamError, StreamResult, Writer};

pub const DEFAULT_COL_SEP: char = ',';
pub const DEFAULT_QUOTE_CHAR: char = '"';
pub const DEFAULT_ROW_SEP: &str = "\n";

/// Column separator candidates, in tie-break order.
pub const COL_SEP_CANDIDATES: [char; 4] = [',', '|', '\t', ';'];

/// Quote candidates, in tie-break order.
pub const QUOTE_CANDIDATES: [char; 2] = ['"', '\''];

/// Where the column names of a CSV stream come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "HeaderSpec")]
pub enum HeaderMode {
    /// No header row; arity is not checked.
    #[default]
    None,
    /// The first record is the header row.
    FirstRow,
    /// Headers are supplied up front.
    Explicit(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderSpec {
    Mode(String),
    Names(Vec<String>),
}

impl TryFrom<HeaderSpec> for HeaderMode {
    type Error = String;

    fn try_from(spec: HeaderSpec) -> Result<Self, Self::Error> {
        match spec {
            HeaderSpec::Names(names) => Ok(HeaderMode::Explicit(names)),
            HeaderSpec::Mode(mode) => match mode.as_str() {
                "none" | "" => Ok(HeaderMode::None),
                "first_row" => Ok(HeaderMode::FirstRow),
                other => Err(format!("unknown header mode '{other}'")),
            },
        }
    }
}

impl HeaderMode {
    fn known(&self) -> Option<&[String]> {
        match self {
            HeaderMode::Explicit(names) => Some(names),
            _ => None,
        }
    }
}

/// Shared CSV settings.
///
/// Separators are optional so that a sniffing reader can tell which ones the
/// caller pinned down; everything else falls back to `,`, `"` and `\n`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub col_sep: Option<char>,
    pub quote_char: Option<char>,
    pub row_sep: Option<String>,
    pub headers: HeaderMode,
    /// Also emit the header row as the first row of output.
    pub return_headers: bool,
    /// Records skipped before parsing (and header detection) starts.
    pub skip_rows: usize,
    /// Quote every field, not only those that need it.
    pub force_quotes: bool,
}

impl CsvOptions {
    pub fn col_sep(&self) -> char {
        self.col_sep.unwrap_or(DEFAULT_COL_SEP)
    }

    pub fn quote_char(&self) -> char {
        self.quote_char.unwrap_or(DEFAULT_QUOTE_CHAR)
    }

    pub fn row_sep(&self) -> &str {
        self.row_sep.as_deref().unwrap_or(DEFAULT_ROW_SEP)
    }

    pub fn with_headers(mut self, headers: HeaderMode) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_return_headers(mut self, return_headers: bool) -> Self {
        self.return_headers = return_headers;
        self
    }

    pub fn with_col_sep(mut self, col_sep: char) -> Self {
        self.col_sep = Some(col_sep);
        self
    }

    pub fn with_quote_char(mut self, quote_char: char) -> Self {
        self.quote_char = Some(quote_char);
        self
    }

    pub fn with_row_sep(mut self, row_sep: impl Into<String>) -> Self {
        self.row_sep = Some(row_sep.into());
        self
    }

    /// Check that the separators can be expressed by the codec.
    pub fn validate(&self) -> StreamResult<()> {
        ascii_byte("col_sep", self.col_sep())?;
        ascii_byte("quote_char", self.quote_char())?;
        RowTerminator::parse(self.row_sep())?;
        Ok(())
    }
}

// ============================================================================
// Sniffing
// ============================================================================

/// Pick the quote character from sample lines.
///
/// Each candidate scores one point per occurrence next to a line boundary or
/// a separator candidate. A candidate with an odd number of occurrences is
/// unbalanced and discarded. Defaults to `"`.
pub fn detect_quote_char<S: AsRef<str>>(lines: &[S]) -> char {
    let mut best = (DEFAULT_QUOTE_CHAR, 0usize);
    for quote in QUOTE_CANDIDATES {
        let mut count = 0;
        let mut score = 0;
        for line in lines {
            let chars: Vec<char> = line.as_ref().chars().collect();
            for (i, c) in chars.iter().enumerate() {
                if *c != quote {
                    continue;
                }
                count += 1;
                let at_start = i == 0 || COL_SEP_CANDIDATES.contains(&chars[i - 1]);
                let at_end = i + 1 == chars.len() || COL_SEP_CANDIDATES.contains(&chars[i + 1]);
                if at_start || at_end {
                    score += 1;
                }
            }
        }
        if count % 2 == 0 && score > best.1 {
            best = (quote, score);
        }
    }
    best.0
}

/// Pick the most frequent column separator outside quoted spans.
pub fn detect_col_sep<S: AsRef<str>>(lines: &[S], quote: char) -> char {
    let mut counts = [0usize; COL_SEP_CANDIDATES.len()];
    for line in lines {
        let mut quoted = false;
        for c in line.as_ref().chars() {
            if c == quote {
                quoted = !quoted;
            } else if !quoted {
                if let Some(idx) = COL_SEP_CANDIDATES.iter().position(|s| *s == c) {
                    counts[idx] += 1;
                }
            }
        }
    }

    let mut best = 0;
    for (idx, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = idx;
        }
    }
    COL_SEP_CANDIDATES[best]
}

/// Fill every separator left unset in `options` from `sample`.
pub fn sniff_options(sample: &[u8], truncated: bool, mut options: CsvOptions) -> CsvOptions {
    let row_sep = options
        .row_sep
        .clone()
        .unwrap_or_else(|| detect_newline(sample).to_string());

    let text = String::from_utf8_lossy(sample);
    let mut lines: Vec<&str> = text.split(row_sep.as_str()).collect();
    if truncated && lines.len() > 1 {
        lines.pop();
    }

    let quote = options.quote_char.unwrap_or_else(|| detect_quote_char(&lines));
    let col_sep = options.col_sep.unwrap_or_else(|| detect_col_sep(&lines, quote));

    options.row_sep = Some(row_sep);
    options.quote_char = Some(quote);
    options.col_sep = Some(col_sep);
    options
}

// ============================================================================
// Record boundaries
// ============================================================================

/// Record terminators the codec can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowTerminator {
    /// `\r\n`; on input a lone `\r` or `\n` also ends a record.
    Crlf,
    Byte(u8),
}

impl RowTerminator {
    fn parse(row_sep: &str) -> StreamResult<Self> {
        match row_sep.as_bytes() {
            b"\r\n" => Ok(RowTerminator::Crlf),
            [byte] => Ok(RowTerminator::Byte(*byte)),
            _ => Err(StreamError::CsvOption(format!(
                "row separator {row_sep:?} must be \\r\\n or a single ASCII character"
            ))),
        }
    }

    /// The bytes appended to every physical line before parsing.
    fn bytes(self) -> Vec<u8> {
        match self {
            RowTerminator::Crlf => b"\r\n".to_vec(),
            RowTerminator::Byte(byte) => vec![byte],
        }
    }
}

impl From<RowTerminator> for csv_core::Terminator {
    fn from(term: RowTerminator) -> Self {
        match term {
            RowTerminator::Crlf => csv_core::Terminator::CRLF,
            RowTerminator::Byte(byte) => csv_core::Terminator::Any(byte),
        }
    }
}

impl From<RowTerminator> for ::csv::Terminator {
    fn from(term: RowTerminator) -> Self {
        match term {
            RowTerminator::Crlf => ::csv::Terminator::CRLF,
            RowTerminator::Byte(byte) => ::csv::Terminator::Any(byte),
        }
    }
}

fn ascii_byte(option: &str, c: char) -> StreamResult<u8> {
    u8::try_from(c)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| StreamError::CsvOption(format!("{option} {c:?} is not a single ASCII character")))
}

// ============================================================================
// Parsing
// ============================================================================

/// One record as produced by the parser: field bytes back to back plus the
/// end offset of every field.
struct RawRecord {
    bytes: Vec<u8>,
    len: usize,
    ends: Vec<usize>,
    fields: usize,
}

impl RawRecord {
    fn new() -> Self {
        Self {
            bytes: vec![0; 1024],
            len: 0,
            ends: vec![0; 32],
            fields: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
        self.fields = 0;
    }

    fn is_empty(&self) -> bool {
        self.len == 0 && self.fields == 0
    }

    fn to_fields(&self) -> StreamResult<Vec<String>> {
        let mut start = 0;
        let mut fields = Vec::with_capacity(self.fields);
        for &end in &self.ends[..self.fields] {
            fields.push(String::from_utf8(self.bytes[start..end].to_vec())?);
            start = end;
        }
        Ok(fields)
    }
}

enum Parsed {
    Record,
    NeedInput,
    Exhausted,
}

/// Parses CSV records from a line reader.
///
/// Every physical line is handed to the record parser followed by the row
/// terminator, so a quoted field that spans lines keeps its line breaks.
/// Blank lines are skipped.
pub struct CsvReader<R> {
    lines: R,
    parser: csv_core::Reader,
    terminator: Vec<u8>,
    pending: BytesMut,
    record: RawRecord,
    col_sep: char,
    quote: char,
    mode: HeaderMode,
    headers: Option<Vec<String>>,
    pending_header: Option<Vec<String>>,
    return_headers: bool,
    skip_rows: usize,
    line_no: usize,
    rows: usize,
    started: bool,
    finished: bool,
}

impl<R> CsvReader<R>
where
    R: Reader<Item = String>,
{
    pub fn new(lines: R, options: CsvOptions) -> StreamResult<Self> {
        let terminator = RowTerminator::parse(options.row_sep())?;
        let parser = csv_core::ReaderBuilder::new()
            .delimiter(ascii_byte("col_sep", options.col_sep())?)
            .quote(ascii_byte("quote_char", options.quote_char())?)
            .terminator(terminator.into())
            .build();

        let headers = options.headers.known().map(<[String]>::to_vec);
        Ok(Self {
            lines,
            parser,
            terminator: terminator.bytes(),
            pending: BytesMut::new(),
            record: RawRecord::new(),
            col_sep: options.col_sep(),
            quote: options.quote_char(),
            pending_header: headers.clone().filter(|_| options.return_headers),
            headers,
            mode: options.headers,
            return_headers: options.return_headers,
            skip_rows: options.skip_rows,
            line_no: 0,
            rows: 0,
            started: false,
            finished: false,
        })
    }

    pub fn col_sep(&self) -> char {
        self.col_sep
    }

    pub fn quote_char(&self) -> char {
        self.quote
    }

    /// Column names, reading the header row first if necessary.
    pub async fn headers(&mut self) -> StreamResult<Option<Vec<String>>> {
        self.start().await?;
        Ok(self.headers.clone())
    }

    async fn start(&mut self) -> StreamResult<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        for _ in 0..self.skip_rows {
            if self.read_record().await?.is_none() {
                break;
            }
        }

        if self.mode == HeaderMode::FirstRow {
            let header = self.read_record().await?;
            if self.return_headers {
                self.pending_header = header.clone();
            }
            self.headers = header;
        }
        Ok(())
    }

    /// Run the parser over the pending input, or signal end of input when
    /// `at_end` is set.
    fn parse(&mut self, at_end: bool) -> Parsed {
        loop {
            let input: &[u8] = if at_end { &[] } else { &self.pending[..] };
            let record = &mut self.record;
            let (result, nin, nout, nends) = self.parser.read_record(
                input,
                &mut record.bytes[record.len..],
                &mut record.ends[record.fields..],
            );
            self.pending.advance(nin);
            record.len += nout;
            record.fields += nends;

            match result {
                ReadRecordResult::InputEmpty => return Parsed::NeedInput,
                ReadRecordResult::OutputFull => {
                    let grown = record.bytes.len() * 2;
                    record.bytes.resize(grown, 0);
                },
                ReadRecordResult::OutputEndsFull => {
                    let grown = record.ends.len() * 2;
                    record.ends.resize(grown, 0);
                },
                ReadRecordResult::Record => return Parsed::Record,
                ReadRecordResult::End => return Parsed::Exhausted,
            }
        }
    }

    async fn read_record(&mut self) -> StreamResult<Option<Vec<String>>> {
        if self.finished {
            return Ok(None);
        }
        self.record.clear();
        let mut first_line = None;

        loop {
            if self.pending.is_empty() {
                let Some(line) = self.lines.read().await? else {
                    self.finished = true;
                    // Every line ends in a terminator, so only an open quote
                    // can leave a record behind.
                    return match self.parse(true) {
                        Parsed::Record => Err(StreamError::Csv {
                            line: first_line.unwrap_or(self.line_no),
                            message: "unterminated quoted field".to_string(),
                        }),
                        Parsed::NeedInput | Parsed::Exhausted => Ok(None),
                    };
                };
                self.line_no += 1;
                if first_line.is_none() {
                    first_line = Some(self.line_no);
                }
                self.pending.extend_from_slice(line.as_bytes());
                self.pending.extend_from_slice(&self.terminator);
            }

            match self.parse(false) {
                Parsed::Record => return self.record.to_fields().map(Some),
                Parsed::NeedInput if self.record.is_empty() => first_line = None,
                Parsed::NeedInput => {},
                Parsed::Exhausted => {
                    self.finished = true;
                    return Ok(None);
                },
            }
        }
    }
}

/// Build a CSV reader over a byte source, detecting every separator the
/// caller left unset from the first [`SNIFF_BYTES`] of input.
///
/// The source must support `rewind`.
pub async fn sniffed<S>(mut source: S, options: CsvOptions) -> StreamResult<CsvReader<LineReader<S>>>
where
    S: Reader<Item = Bytes>,
{
    let sample = read_sample(&mut source, SNIFF_BYTES).await?;
    let truncated = !source.eof();
    source.rewind().await?;

    let options = sniff_options(&sample, truncated, options);
    let lines = LineReader::new(source, options.row_sep());
    CsvReader::new(lines, options)
}

impl<S> CsvReader<LineReader<S>>
where
    S: Reader<Item = Bytes>,
{
    /// See [`sniffed`].
    pub async fn sniffed(source: S, options: CsvOptions) -> StreamResult<Self> {
        sniffed(source, options).await
    }
}

#[async_trait]
impl<R> Reader for CsvReader<R>
where
    R: Reader<Item = String>,
{
    type Item = Vec<String>;

    async fn read(&mut self) -> StreamResult<Option<Vec<String>>> {
        self.start().await?;
        if let Some(header) = self.pending_header.take() {
            return Ok(Some(header));
        }

        let Some(record) = self.read_record().await? else {
            return Ok(None);
        };
        self.rows += 1;
        if let Some(headers) = &self.headers {
            if record.len() != headers.len() {
                return Err(StreamError::RowArity {
                    row: self.rows,
                    expected: headers.len(),
                    actual: record.len(),
                });
            }
        }
        Ok(Some(record))
    }

    fn eof(&self) -> bool {
        self.pending_header.is_none()
            && (self.finished || (self.started && self.pending.is_empty() && self.lines.eof()))
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.lines.close().await
    }
}

// ============================================================================
// Encoding
// ============================================================================

struct CsvEncoder {
    builder: WriterBuilder,
}

impl CsvEncoder {
    fn new(options: &CsvOptions) -> StreamResult<Self> {
        let terminator = RowTerminator::parse(options.row_sep())?;
        let quote_style = if options.force_quotes {
            QuoteStyle::Always
        } else {
            QuoteStyle::Necessary
        };

        let mut builder = WriterBuilder::new();
        builder
            .has_headers(false)
            .delimiter(ascii_byte("col_sep", options.col_sep())?)
            .quote(ascii_byte("quote_char", options.quote_char())?)
            .terminator(terminator.into())
            .quote_style(quote_style)
            .flexible(false);
        Ok(Self { builder })
    }

    /// Encode `rows` into one chunk. Rows within a chunk must agree on
    /// their number of fields.
    fn encode<I, R, F>(&self, rows: I) -> StreamResult<Bytes>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let mut out = Vec::new();
        {
            let mut writer = self.builder.from_writer(&mut out);
            for row in rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        Ok(Bytes::from(out))
    }

    fn line(&self, fields: &[String]) -> StreamResult<Bytes> {
        self.encode(std::iter::once(fields))
    }
}

/// Writes rows as CSV lines into a byte sink.
///
/// With [`HeaderMode::FirstRow`] the first row written is taken as the
/// header and only echoed when `return_headers` is set.
pub struct CsvWriter<W> {
    inner: W,
    encoder: CsvEncoder,
    mode: HeaderMode,
    headers: Option<Vec<String>>,
    return_headers: bool,
    started: bool,
    rows: usize,
}

impl<W> CsvWriter<W>
where
    W: Writer<Item = Bytes>,
{
    pub fn new(inner: W, options: CsvOptions) -> StreamResult<Self> {
        Ok(Self {
            inner,
            encoder: CsvEncoder::new(&options)?,
            headers: options.headers.known().map(<[String]>::to_vec),
            mode: options.headers,
            return_headers: options.return_headers,
            started: false,
            rows: 0,
        })
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W> Writer for CsvWriter<W>
where
    W: Writer<Item = Bytes>,
{
    type Item = Vec<String>;

    async fn write(&mut self, row: Vec<String>) -> StreamResult<()> {
        if !self.started {
            self.started = true;
            if self.mode == HeaderMode::FirstRow {
                if self.return_headers {
                    let header = self.encoder.line(&row)?;
                    self.inner.write(header).await?;
                }
                self.headers = Some(row);
                return Ok(());
            }
            if let Some(headers) = self.headers.as_ref().filter(|_| self.return_headers) {
                let header = self.encoder.line(headers)?;
                self.inner.write(header).await?;
            }
        }

        self.rows += 1;
        if let Some(headers) = &self.headers {
            if row.len() != headers.len() {
                return Err(StreamError::RowArity {
                    row: self.rows,
                    expected: headers.len(),
                    actual: row.len(),
                });
            }
        }
        let line = self.encoder.line(&row)?;
        self.inner.write(line).await
    }

    async fn flush(&mut self) -> StreamResult<()> {
        self.inner.flush().await
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.inner.close().await
    }
}

/// Turns database row batches into CSV-encoded chunks, one chunk per batch.
///
/// SQL NULL and the empty string are both written as an empty field.
pub struct CsvGenerator<R> {
    inner: R,
    encoder: CsvEncoder,
    mode: HeaderMode,
    return_headers: bool,
    pending_header: Option<Bytes>,
    started: bool,
}

impl<R> CsvGenerator<R>
where
    R: Reader<Item = RowBatch>,
{
    pub fn new(inner: R, options: CsvOptions) -> StreamResult<Self> {
        let encoder = CsvEncoder::new(&options)?;
        let pending_header = match &options.headers {
            HeaderMode::Explicit(names) if options.return_headers => Some(encoder.line(names)?),
            _ => None,
        };
        Ok(Self {
            inner,
            encoder,
            mode: options.headers,
            return_headers: options.return_headers,
            pending_header,
            started: false,
        })
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    fn encode_batch(&mut self, batch: &RowBatch) -> StreamResult<Bytes> {
        let skip_header = !self.started && self.mode == HeaderMode::FirstRow && !self.return_headers;
        self.started = true;
        let rows = batch
            .iter()
            .skip(usize::from(skip_header))
            .map(|row| row.iter().map(|field| field.as_deref().unwrap_or("")));
        self.encoder.encode(rows)
    }
}

#[async_trait]
impl<R> Reader for CsvGenerator<R>
where
    R: Reader<Item = RowBatch>,
{
    type Item = Bytes;

    async fn read(&mut self) -> StreamResult<Option<Bytes>> {
        if let Some(header) = self.pending_header.take() {
            return Ok(Some(header));
        }
        loop {
            let Some(batch) = self.inner.read().await? else {
                return Ok(None);
            };
            if batch.is_empty() {
                if self.inner.eof() {
                    return Ok(None);
                }
                continue;
            }
            let chunk = self.encode_batch(&batch)?;
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
    }

    fn eof(&self) -> bool {
        self.pending_header.is_none() && self.inner.eof()
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::streams::{pipe, CollectWriter, IterReader};

    fn lines(text: &str) -> IterReader<String> {
        IterReader::new(text.split('\n').map(str::to_string).collect::<Vec<_>>())
    }

    fn bytes(text: &str) -> IterReader<Bytes> {
        IterReader::new(vec![Bytes::from(text.to_string())])
    }

    async fn rows<R: Reader<Item = Vec<String>>>(reader: &mut R) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Some(row) = reader.read().await.unwrap() {
            out.push(row);
        }
        out
    }

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn sniff(text: &str) -> CsvOptions {
        sniff_options(text.as_bytes(), false, CsvOptions::default())
    }

    #[tokio::test]
    async fn test_reader_without_headers() {
        let mut reader = CsvReader::new(lines("a,b\nc,d\ne,f"), CsvOptions::default()).unwrap();
        assert!(!reader.eof());
        assert_eq!(rows(&mut reader).await, vec![row(&["a", "b"]), row(&["c", "d"]), row(&["e", "f"])]);
        assert!(reader.eof());
    }

    #[tokio::test]
    async fn test_reader_first_row_headers() {
        let options = CsvOptions::default().with_headers(HeaderMode::FirstRow);
        let mut reader = CsvReader::new(lines("a,b\nc,d\ne,f"), options).unwrap();

        assert_eq!(reader.headers().await.unwrap(), Some(row(&["a", "b"])));
        assert_eq!(rows(&mut reader).await, vec![row(&["c", "d"]), row(&["e", "f"])]);
    }

    #[tokio::test]
    async fn test_reader_explicit_headers() {
        let options = CsvOptions::default().with_headers(HeaderMode::Explicit(row(&["x", "y"])));
        let mut reader = CsvReader::new(lines("a,b\nc,d"), options).unwrap();

        assert_eq!(reader.headers().await.unwrap(), Some(row(&["x", "y"])));
        assert_eq!(rows(&mut reader).await, vec![row(&["a", "b"]), row(&["c", "d"])]);
    }

    #[tokio::test]
    async fn test_reader_skip_rows() {
        let options = CsvOptions {
            headers: HeaderMode::Explicit(row(&["x", "y"])),
            skip_rows: 1,
            ..Default::default()
        };
        let mut reader = CsvReader::new(lines("a,b\nc,d\ne,f"), options).unwrap();
        assert_eq!(rows(&mut reader).await, vec![row(&["c", "d"]), row(&["e", "f"])]);
    }

    #[tokio::test]
    async fn test_reader_returns_explicit_headers_once() {
        let options = CsvOptions::default()
            .with_headers(HeaderMode::Explicit(row(&["x", "y"])))
            .with_return_headers(true);
        let mut reader = CsvReader::new(lines("a,b\nc,d"), options).unwrap();

        assert_eq!(reader.headers().await.unwrap(), Some(row(&["x", "y"])));
        assert_eq!(
            rows(&mut reader).await,
            vec![row(&["x", "y"]), row(&["a", "b"]), row(&["c", "d"])]
        );
    }

    #[tokio::test]
    async fn test_reader_returns_first_row_headers_once() {
        for ask_headers_first in [true, false] {
            let options = CsvOptions::default()
                .with_headers(HeaderMode::FirstRow)
                .with_return_headers(true);
            let mut reader = CsvReader::new(lines("a,b\nc,d\ne,f"), options).unwrap();
            if ask_headers_first {
                assert_eq!(reader.headers().await.unwrap(), Some(row(&["a", "b"])));
            }
            assert_eq!(
                rows(&mut reader).await,
                vec![row(&["a", "b"]), row(&["c", "d"]), row(&["e", "f"])]
            );
        }
    }

    #[tokio::test]
    async fn test_reader_quoted_fields() {
        let text = "id,note\n1,\"hello, world\"\n2,\"say \"\"hi\"\"\"\n3,\"two\nlines\"";
        let options = CsvOptions::default().with_headers(HeaderMode::FirstRow);
        let mut reader = CsvReader::new(lines(text), options).unwrap();

        assert_eq!(
            rows(&mut reader).await,
            vec![
                row(&["1", "hello, world"]),
                row(&["2", "say \"hi\""]),
                row(&["3", "two\nlines"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_reader_rejects_arity_mismatch() {
        let options = CsvOptions::default().with_headers(HeaderMode::FirstRow);
        let mut reader = CsvReader::new(lines("a,b\n1,2,3"), options).unwrap();

        match reader.read().await {
            Err(StreamError::RowArity { expected, actual, .. }) => {
                assert_eq!((expected, actual), (2, 3));
            },
            other => panic!("expected arity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reader_unterminated_quote() {
        let mut reader = CsvReader::new(lines("a,\"b"), CsvOptions::default()).unwrap();
        assert!(matches!(reader.read().await, Err(StreamError::Csv { line: 1, .. })));
    }

    #[tokio::test]
    async fn test_reader_close_closes_source() {
        let mut reader = CsvReader::new(lines("a"), CsvOptions::default()).unwrap();
        reader.close().await.unwrap();
        assert!(reader.lines.is_closed());
    }

    #[test]
    fn test_sniff_col_sep() {
        assert_eq!(sniff("a,b\nc,d\ne,f").col_sep, Some(','));
        assert_eq!(sniff("a|b\nc|d\ne|f").col_sep, Some('|'));
        assert_eq!(sniff("a;b\nc;d\ne;f").col_sep, Some(';'));
        assert_eq!(sniff("a\tb\nc\td\ne\tf").col_sep, Some('\t'));
    }

    #[test]
    fn test_sniff_col_sep_ignores_quoted_spans() {
        assert_eq!(sniff("\"a,b,c\"|d\n\"e,f\"|g|h").col_sep, Some('|'));
    }

    #[test]
    fn test_sniff_quote_char() {
        assert_eq!(sniff("a,b\nc,d\ne,f").quote_char, Some('"'));
        assert_eq!(sniff("'a',b\nc,'d'\ne,f").quote_char, Some('\''));
        assert_eq!(sniff("a,b\nc,d\ne,\"f\"").quote_char, Some('"'));
        assert_eq!(sniff("a,b\nc,'d\ne,\"f\"").quote_char, Some('"'));
        assert_eq!(sniff("a,b'\nc,d\ne,f").quote_char, Some('"'));
    }

    #[test]
    fn test_sniff_row_sep() {
        assert_eq!(sniff("a,b\nc,d\ne,f").row_sep.as_deref(), Some("\n"));
        assert_eq!(sniff("a,b\r\nc,d\r\ne,f").row_sep.as_deref(), Some("\r\n"));
        assert_eq!(sniff("a,b\rc,d\re,f").row_sep.as_deref(), Some("\r"));
    }

    #[test]
    fn test_sniff_keeps_pinned_options() {
        let options = sniff_options(b"a|b\nc|d", false, CsvOptions::default().with_col_sep(','));
        assert_eq!(options.col_sep, Some(','));
    }

    #[tokio::test]
    async fn test_sniffed_reader_reads_from_start() {
        let options = CsvOptions::default().with_headers(HeaderMode::FirstRow);
        let mut reader = CsvReader::sniffed(bytes("id;name\r\n1;x\r\n2;y\r\n"), options)
            .await
            .unwrap();

        assert_eq!(reader.col_sep(), ';');
        assert_eq!(reader.headers().await.unwrap(), Some(row(&["id", "name"])));
        assert_eq!(rows(&mut reader).await, vec![row(&["1", "x"]), row(&["2", "y"])]);
    }

    async fn written(options: CsvOptions, input: &[&[&str]]) -> (String, Option<Vec<String>>) {
        let mut writer = CsvWriter::new(CollectWriter::new(), options).unwrap();
        for fields in input {
            writer.write(row(fields)).await.unwrap();
        }
        let headers = writer.headers().map(<[String]>::to_vec);
        let out = String::from_utf8(writer.get_ref().concat()).unwrap();
        (out, headers)
    }

    #[tokio::test]
    async fn test_writer_first_row_headers() {
        let options = CsvOptions::default().with_headers(HeaderMode::FirstRow);
        let (out, headers) = written(options, &[&["a", "b"], &["c", "d"]]).await;
        assert_eq!(headers, Some(row(&["a", "b"])));
        assert_eq!(out, "c,d\n");

        let options = CsvOptions::default()
            .with_headers(HeaderMode::FirstRow)
            .with_return_headers(true);
        let (out, _) = written(options, &[&["a", "b"], &["c", "d"]]).await;
        assert_eq!(out, "a,b\nc,d\n");
    }

    #[tokio::test]
    async fn test_writer_explicit_headers() {
        let explicit = HeaderMode::Explicit(row(&["x", "y"]));
        let (out, headers) =
            written(CsvOptions::default().with_headers(explicit.clone()), &[&["a", "b"], &["c", "d"]]).await;
        assert_eq!(headers, Some(row(&["x", "y"])));
        assert_eq!(out, "a,b\nc,d\n");

        let options = CsvOptions::default().with_headers(explicit).with_return_headers(true);
        let (out, _) = written(options, &[&["a", "b"], &["c", "d"]]).await;
        assert_eq!(out, "x,y\na,b\nc,d\n");
    }

    #[tokio::test]
    async fn test_writer_separators_and_quoting() {
        let (out, _) = written(CsvOptions::default().with_col_sep('|'), &[&["a", "b"], &["c", "d"]]).await;
        assert_eq!(out, "a|b\nc|d\n");

        let (out, _) = written(CsvOptions::default().with_row_sep("\r"), &[&["a", "b"], &["c", "d"]]).await;
        assert_eq!(out, "a,b\rc,d\r");

        let forced = CsvOptions {
            force_quotes: true,
            ..Default::default()
        };
        let (out, _) = written(forced.clone(), &[&["a", "b"]]).await;
        assert_eq!(out, "\"a\",\"b\"\n");

        let (out, _) = written(forced.with_quote_char('\''), &[&["a", "b"]]).await;
        assert_eq!(out, "'a','b'\n");

        let (out, _) =
            written(CsvOptions::default().with_quote_char('\''), &[&["a", "b,"], &["c", "d"]]).await;
        assert_eq!(out, "a,'b,'\nc,d\n");
    }

    #[tokio::test]
    async fn test_writer_rejects_arity_mismatch() {
        let options = CsvOptions::default().with_headers(HeaderMode::Explicit(row(&["x", "y"])));
        let mut writer = CsvWriter::new(CollectWriter::new(), options).unwrap();
        assert!(matches!(
            writer.write(row(&["only"])).await,
            Err(StreamError::RowArity { expected: 2, actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_reader_round_trip() {
        let input = vec![
            row(&["id", "comment"]),
            row(&["1", "plain"]),
            row(&["2", "with, comma"]),
            row(&["3", "with \"quotes\""]),
            row(&["4", "multi\nline"]),
            row(&["5", ""]),
        ];
        let options = CsvOptions::default()
            .with_headers(HeaderMode::FirstRow)
            .with_return_headers(true);

        let mut writer = CsvWriter::new(CollectWriter::new(), options.clone()).unwrap();
        for r in &input {
            writer.write(r.clone()).await.unwrap();
        }
        let encoded = writer.into_inner().concat();

        let source = IterReader::new(vec![Bytes::from(encoded)]);
        let mut reader = CsvReader::new(LineReader::new(source, "\n"), options).unwrap();
        let mut sink = CollectWriter::new();
        pipe(&mut reader, &mut sink).await.unwrap();

        assert_eq!(sink.into_items(), input);
    }

    #[tokio::test]
    async fn test_generator_encodes_batches() {
        let batches: Vec<RowBatch> = vec![
            vec![
                vec![Some("1".to_string()), Some("a,b".to_string())],
                vec![Some("2".to_string()), None],
            ],
            vec![],
        ];
        let options = CsvOptions::default()
            .with_headers(HeaderMode::Explicit(row(&["id", "name"])))
            .with_return_headers(true);
        let mut generator = CsvGenerator::new(IterReader::new(batches), options).unwrap();
        let mut sink = CollectWriter::new();

        pipe(&mut generator, &mut sink).await.unwrap();

        assert_eq!(String::from_utf8(sink.concat()).unwrap(), "id,name\n1,\"a,b\"\n2,\n");
        assert!(generator.eof());
    }

    #[tokio::test]
    async fn test_reader_skips_blank_lines() {
        let mut reader = CsvReader::new(lines("a,b\n\nc,d\n\n"), CsvOptions::default()).unwrap();
        assert_eq!(rows(&mut reader).await, vec![row(&["a", "b"]), row(&["c", "d"])]);
        assert!(reader.eof());
    }

    #[tokio::test]
    async fn test_reader_crlf_field_spanning_lines() {
        let options = CsvOptions::default().with_headers(HeaderMode::FirstRow);
        let mut reader = CsvReader::sniffed(bytes("id,note\r\n1,\"a\r\nb\"\r\n2,c\r\n"), options)
            .await
            .unwrap();

        assert_eq!(reader.headers().await.unwrap(), Some(row(&["id", "note"])));
        assert_eq!(rows(&mut reader).await, vec![row(&["1", "a\r\nb"]), row(&["2", "c"])]);
    }

    #[tokio::test]
    async fn test_reader_arity_error_counts_data_rows() {
        let options = CsvOptions::default().with_headers(HeaderMode::FirstRow);
        let mut reader = CsvReader::new(lines("a,b\n1,2\n\n3"), options).unwrap();

        assert_eq!(reader.read().await.unwrap(), Some(row(&["1", "2"])));
        assert!(matches!(
            reader.read().await,
            Err(StreamError::RowArity { row: 2, expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_options_must_be_ascii() {
        let wide = CsvOptions::default().with_col_sep('§');
        assert!(matches!(
            CsvWriter::new(CollectWriter::new(), wide.clone()),
            Err(StreamError::CsvOption(_))
        ));
        assert!(matches!(
            CsvReader::new(lines("a"), wide),
            Err(StreamError::CsvOption(_))
        ));
        assert!(matches!(
            CsvReader::new(lines("a"), CsvOptions::default().with_row_sep("||")),
            Err(StreamError::CsvOption(_))
        ));
    }

    #[test]
    fn test_options_from_json() {
        let options: CsvOptions = serde_json::from_value(serde_json::json!({
            "col_sep": "|",
            "headers": "first_row",
            "return_headers": true
        }))
        .unwrap();
        assert_eq!(options.col_sep, Some('|'));
        assert_eq!(options.headers, HeaderMode::FirstRow);
        assert!(options.return_headers);

        let options: CsvOptions =
            serde_json::from_value(serde_json::json!({ "headers": ["a", "b"] })).unwrap();
        assert_eq!(options.headers, HeaderMode::Explicit(row(&["a", "b"])));

        assert!(serde_json::from_value::<CsvOptions>(serde_json::json!({ "headers": "sideways" })).is_err());
    }
}
