//! Database-backed stream stages
//!
//! [`CursorReader`] pulls a query result through a named server-side cursor
//! in fixed-size batches, so exports never hold more than one batch in
//! memory. [`InsertWriter`] and [`CopyWriter`] are the two import sinks:
//! row-by-row prepared inserts, or the server-native `COPY ... FROM STDIN`.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgCopyIn, PgPool, PgPoolCopyExt, PgRow};
use sqlx::{Column, Executor, Postgres, Row, Transaction};
use tracing::{debug, warn};

use super::{Reader, RowBatch, StreamError, StreamResult, Writer};
use crate::db::{quote_identifier, quote_literal, quote_qualified};

pub const DEFAULT_FETCH_SIZE: usize = 1000;

/// A validated cursor definition.
///
/// The three statements are built once, up front. The query may end in one
/// `;` but must not contain any other statement separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorQuery {
    name: String,
    fetch_size: usize,
    declare_sql: String,
    fetch_sql: String,
    close_sql: String,
}

impl CursorQuery {
    pub fn new(name: &str, query: &str, fetch_size: usize) -> StreamResult<Self> {
        if name.trim().is_empty() {
            return Err(StreamError::InvalidCursor("cursor name is empty".to_string()));
        }
        let query = strip_statement(query)?;
        if fetch_size == 0 {
            return Err(StreamError::InvalidCursor("fetch size must be positive".to_string()));
        }

        let quoted = quote_identifier(name);
        Ok(Self {
            name: name.to_string(),
            fetch_size,
            declare_sql: format!("BEGIN; DECLARE {quoted} NO SCROLL CURSOR FOR {query};"),
            fetch_sql: format!("FETCH FORWARD {fetch_size} FROM {quoted};"),
            close_sql: format!("CLOSE {quoted}; COMMIT;"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    pub fn declare_sql(&self) -> &str {
        &self.declare_sql
    }

    pub fn fetch_sql(&self) -> &str {
        &self.fetch_sql
    }

    pub fn close_sql(&self) -> &str {
        &self.close_sql
    }
}

/// Trim a query down to a single statement without its trailing `;`.
pub fn strip_statement(query: &str) -> StreamResult<&str> {
    let trimmed = query.trim();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    if body.is_empty() {
        return Err(StreamError::InvalidCursor("query is empty".to_string()));
    }
    if body.contains(';') {
        return Err(StreamError::InvalidCursor(
            "query must be a single statement".to_string(),
        ));
    }
    Ok(body)
}

/// Reads a query result batch by batch through a server-side cursor.
///
/// Owns a dedicated pooled connection for its whole lifetime. Values are
/// returned in their text representation; SQL NULL is `None`.
pub struct CursorReader {
    conn: Option<PoolConnection<Postgres>>,
    query: CursorQuery,
    /// The cursor transaction was opened, even if the declare then failed.
    began: bool,
    declared: bool,
    aborted: bool,
    finished: bool,
    columns: Option<Vec<String>>,
    buffered: Option<RowBatch>,
}

impl CursorReader {
    pub async fn open(pool: &PgPool, query: CursorQuery) -> StreamResult<Self> {
        let conn = pool.acquire().await?;
        Ok(Self {
            conn: Some(conn),
            query,
            began: false,
            declared: false,
            aborted: false,
            finished: false,
            columns: None,
            buffered: None,
        })
    }

    pub fn query(&self) -> &CursorQuery {
        &self.query
    }

    /// Column names of the result set.
    ///
    /// Reads one batch if the names are not known yet; that batch is kept and
    /// returned by the next `read`. An empty result has no columns.
    pub async fn columns(&mut self) -> StreamResult<Vec<String>> {
        if self.columns.is_none() && !self.finished {
            self.buffered = self.fetch().await?;
        }
        Ok(self.columns.clone().unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str) -> StreamResult<Vec<PgRow>> {
        let conn = self.conn.as_mut().ok_or(StreamError::Closed)?;
        debug!(cursor = %self.query.name, sql, "Executing cursor statement");
        match (&mut **conn).fetch_all(sqlx::raw_sql(sql)).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                if self.began {
                    self.aborted = true;
                }
                Err(e.into())
            },
        }
    }

    async fn fetch(&mut self) -> StreamResult<Option<RowBatch>> {
        if self.aborted {
            return Err(StreamError::InvalidCursor(format!(
                "cursor {} was aborted",
                self.query.name
            )));
        }
        if !self.declared {
            self.began = true;
            let declare = self.query.declare_sql.clone();
            self.execute(&declare).await?;
            self.declared = true;
        }

        let fetch = self.query.fetch_sql.clone();
        let rows = self.execute(&fetch).await?;
        if rows.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        if self.columns.is_none() {
            self.columns = Some(rows[0].columns().iter().map(|c| c.name().to_string()).collect());
        }

        let mut batch = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                values.push(row.try_get_unchecked::<Option<String>, _>(idx)?);
            }
            batch.push(values);
        }
        Ok(Some(batch))
    }
}

#[async_trait]
impl Reader for CursorReader {
    type Item = RowBatch;

    async fn read(&mut self) -> StreamResult<Option<RowBatch>> {
        if let Some(batch) = self.buffered.take() {
            return Ok(Some(batch));
        }
        if self.finished {
            return Ok(None);
        }
        self.fetch().await
    }

    fn eof(&self) -> bool {
        self.finished && self.buffered.is_none()
    }

    async fn close(&mut self) -> StreamResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if !self.began {
            return Ok(());
        }

        if self.aborted {
            // The cursor died with its transaction; only the rollback is left.
            rollback_or_detach(conn, &self.query.name).await;
            return Ok(());
        }

        if let Err(e) = (&mut *conn).execute(sqlx::raw_sql(&self.query.close_sql)).await {
            rollback_or_detach(conn, &self.query.name).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Leave the cursor transaction so the connection can go back to the pool.
/// A connection that cannot be rolled back is closed instead.
async fn rollback_or_detach(mut conn: PoolConnection<Postgres>, cursor: &str) {
    if let Err(e) = (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await {
        warn!(cursor, error = %e, "Rollback of cursor transaction failed, closing connection");
        drop(conn.detach());
    }
}

impl Drop for CursorReader {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.began {
                // Still inside the cursor transaction: never hand it back to the pool.
                drop(conn.detach());
            }
        }
    }
}

/// Inserts rows one by one with a prepared statement, inside one transaction.
///
/// Nothing is visible to other sessions until `close` commits.
pub struct InsertWriter {
    tx: Option<Transaction<'static, Postgres>>,
    sql: String,
    columns: usize,
    rows: u64,
}

impl InsertWriter {
    pub async fn begin(pool: &PgPool, table: &str, columns: &[String]) -> StreamResult<Self> {
        if columns.is_empty() {
            return Err(StreamError::InvalidCursor(format!("no columns to insert into {table}")));
        }
        let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
        let params: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_qualified(table),
            names.join(", "),
            params.join(", ")
        );

        Ok(Self {
            tx: Some(pool.begin().await?),
            sql,
            columns: columns.len(),
            rows: 0,
        })
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Roll back everything written so far.
    pub async fn abort(&mut self) -> StreamResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for InsertWriter {
    type Item = Vec<String>;

    async fn write(&mut self, row: Vec<String>) -> StreamResult<()> {
        if row.len() != self.columns {
            return Err(StreamError::RowArity {
                row: self.rows as usize + 1,
                expected: self.columns,
                actual: row.len(),
            });
        }
        let tx = self.tx.as_mut().ok_or(StreamError::Closed)?;
        let mut query = sqlx::query(&self.sql);
        for value in row {
            query = query.bind(value);
        }
        query.execute(&mut **tx).await?;
        self.rows += 1;
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}

/// Streams CSV bytes into `COPY <table> FROM STDIN`.
pub struct CopyWriter {
    copy: Option<PgCopyIn<PoolConnection<Postgres>>>,
    rows: u64,
}

impl CopyWriter {
    /// Start a CSV `COPY` into `columns` of `table`, expecting
    /// `delimiter`-separated input with `"` quoting and no header line.
    /// Empty fields load as empty strings, never as NULL.
    pub async fn begin(
        pool: &PgPool,
        table: &str,
        columns: &[String],
        delimiter: char,
    ) -> StreamResult<Self> {
        if columns.is_empty() {
            return Err(StreamError::InvalidCursor(format!("no columns to copy into {table}")));
        }
        let names = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "COPY {} ({names}) FROM STDIN WITH (FORMAT csv, DELIMITER {}, FORCE_NOT_NULL ({names}))",
            quote_qualified(table),
            quote_literal(&delimiter.to_string())
        );
        let copy = pool.copy_in_raw(&statement).await?;
        Ok(Self {
            copy: Some(copy),
            rows: 0,
        })
    }

    /// Rows reported by the server once the copy finished.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub async fn abort(&mut self, reason: &str) -> StreamResult<()> {
        if let Some(copy) = self.copy.take() {
            copy.abort(reason).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for CopyWriter {
    type Item = Bytes;

    async fn write(&mut self, data: Bytes) -> StreamResult<()> {
        let copy = self.copy.as_mut().ok_or(StreamError::Closed)?;
        copy.send(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        if let Some(copy) = self.copy.take() {
            self.rows = copy.finish().await?;
        }
        Ok(())
    }
}
