//! Header-then-data array transfers (`DRR?`, `REC? DAT`, `GWD?`, ...).
//!
//! The answer starts with `# KEY = VALUE` header lines closed by
//! `# END_HEADER`, followed by one line per sample:
//!
//! ```text
//! # VERSION = 1
//! # TYPE = 1
//! # SEPARATOR = 32
//! # DIM = 2
//! # NDATA = 3
//! # END_HEADER
//! 0.1 1.0
//! 0.2 2.0
//! 0.3 3.0
//! ```
//!
//! [`Connection::begin_bulk_read`] returns once the header is parsed. A
//! background task keeps the gateway locked and appends rows to a shared
//! [`BulkBuffer`] until the answer ends; foreground code polls
//! [`TransferState`] or drains chunks with [`BulkBuffer::next_chunk`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::time::Instant;

use crate::config::config as global_config;
use crate::connection::Connection;
use crate::decoder::{auto_convert, Value};
use crate::error::{GcsError, Result};
use crate::gateway::Gateway;

/// Parsed `# KEY = VALUE` header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkHeader {
    pub items: IndexMap<String, Value>,
}

impl BulkHeader {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    fn usize_item(&self, key: &str) -> Option<usize> {
        self.get(key)
            .and_then(Value::as_i64)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// Number of columns.
    #[must_use]
    pub fn dim(&self) -> Option<usize> {
        self.usize_item("DIM")
    }

    /// Number of rows.
    #[must_use]
    pub fn ndata(&self) -> Option<usize> {
        self.usize_item("NDATA")
    }

    /// Value separator, `SEPARATOR` as character code (default space).
    #[must_use]
    pub fn separator(&self) -> char {
        self.usize_item("SEPARATOR")
            .and_then(|c| u8::try_from(c).ok())
            .map_or(' ', char::from)
    }

    #[must_use]
    pub fn sample_time(&self) -> Option<f64> {
        self.get("SAMPLE_TIME").and_then(Value::as_f64)
    }
}

/// Parse header lines; `# END_HEADER` and non-header lines are ignored.
pub fn parse_header(text: &str) -> Result<BulkHeader> {
    let mut header = BulkHeader::default();
    for raw in text.lines() {
        let line = raw.trim();
        let Some(body) = line.strip_prefix('#') else {
            continue;
        };
        let body = body.trim();
        if body == "END_HEADER" {
            break;
        }
        if let Some((k, v)) = body.split_once('=') {
            header
                .items
                .insert(k.trim().to_string(), auto_convert(v.trim()));
        }
    }
    if header.dim().is_none() {
        return Err(GcsError::protocol("array header without DIM", text));
    }
    Ok(header)
}

/// `false` / fraction / `true` progress of a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferState {
    /// Nothing received yet.
    Idle,
    /// Fraction of the expected rows received, in `0.0..1.0`.
    InProgress(f64),
    Complete,
}

impl TransferState {
    #[must_use]
    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }
}

#[derive(Debug, Clone)]
enum TransferError {
    Timeout(String),
    Protocol { msg: String, raw: String },
    Transport(String),
}

impl From<TransferError> for GcsError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Timeout(m) => Self::Timeout(m),
            TransferError::Protocol { msg, raw } => Self::Protocol { msg, raw },
            TransferError::Transport(m) => Self::Transport(m),
        }
    }
}

impl From<GcsError> for TransferError {
    fn from(e: GcsError) -> Self {
        match e {
            GcsError::Timeout(m) => Self::Timeout(m),
            GcsError::Protocol { msg, raw } => Self::Protocol { msg, raw },
            other => Self::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct BufferInner {
    /// Column-major rows not yet drained.
    columns: Vec<Vec<f64>>,
    received: usize,
    expected: usize,
    complete: bool,
    error: Option<TransferError>,
}

impl BufferInner {
    fn buffered(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    fn drain(&mut self, n: usize) -> Vec<Vec<f64>> {
        self.columns
            .iter_mut()
            .map(|c| c.drain(..n.min(c.len())).collect())
            .collect()
    }
}

/// Rows shared between the background reader and foreground consumers.
#[derive(Debug, Default)]
pub struct BulkBuffer {
    inner: Mutex<BufferInner>,
    notify: Notify,
}

impl BulkBuffer {
    #[must_use]
    pub fn new(dim: usize, expected: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                columns: vec![Vec::new(); dim],
                expected,
                ..BufferInner::default()
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BufferInner>> {
        self.inner
            .lock()
            .map_err(|_| GcsError::Usage("bulk buffer poisoned".into()))
    }

    pub(crate) fn append_row(&self, row: &[f64]) -> Result<()> {
        {
            let mut inner = self.lock()?;
            if row.len() > inner.columns.len() {
                // devices may report fewer columns in DIM than they send
                let rows = inner.buffered();
                inner.columns.resize(row.len(), vec![f64::NAN; rows]);
            }
            let width = inner.columns.len();
            for (i, col) in inner.columns.iter_mut().enumerate().take(width) {
                col.push(row.get(i).copied().unwrap_or(f64::NAN));
            }
            inner.received += 1;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn finish(&self, error: Option<TransferError>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.complete = true;
            inner.error = error;
        }
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn state(&self) -> TransferState {
        let Ok(inner) = self.inner.lock() else {
            return TransferState::Complete;
        };
        if inner.complete {
            TransferState::Complete
        } else if inner.received == 0 {
            TransferState::Idle
        } else {
            #[allow(clippy::cast_precision_loss)]
            let frac = inner.received as f64 / inner.expected.max(1) as f64;
            TransferState::InProgress(frac.min(0.999))
        }
    }

    #[must_use]
    pub fn received(&self) -> usize {
        self.inner.lock().map(|i| i.received).unwrap_or_default()
    }

    /// All buffered rows as columns. Only valid once the transfer is complete.
    pub fn data(&self) -> Result<Vec<Vec<f64>>> {
        let inner = self.lock()?;
        if !inner.complete {
            return Err(GcsError::Usage(
                "array data requested before the transfer completed".into(),
            ));
        }
        if let Some(e) = inner.error.clone() {
            return Err(e.into());
        }
        Ok(inner.columns.clone())
    }

    /// Take up to `max_rows` rows (`0` = everything once complete).
    ///
    /// Waits until that many rows are buffered or the transfer ended.
    /// `None` once the transfer is complete and everything was drained.
    pub async fn next_chunk(&self, max_rows: usize) -> Result<Option<Vec<Vec<f64>>>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock()?;
                if let Some(e) = inner.error.clone() {
                    return Err(e.into());
                }
                let available = inner.buffered();
                let enough = max_rows > 0 && available >= max_rows;
                if enough || (inner.complete && available > 0) {
                    let n = if max_rows == 0 { available } else { max_rows.min(available) };
                    return Ok(Some(inner.drain(n)));
                }
                if inner.complete {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// [`next_chunk`](Self::next_chunk) sized by `GCS_BULK_CHUNK`.
    pub async fn next_default_chunk(&self) -> Result<Option<Vec<Vec<f64>>>> {
        self.next_chunk(global_config().bulk_chunk).await
    }
}

pub(crate) fn parse_row(line: &str, separator: char) -> Result<Vec<f64>> {
    let split: Vec<&str> = if separator == ' ' {
        line.split_whitespace().collect()
    } else {
        line.split(separator).map(str::trim).filter(|t| !t.is_empty()).collect()
    };
    split
        .into_iter()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| GcsError::protocol(format!("bad array value {t:?}"), line))
        })
        .collect()
}

fn header_end(text: &str) -> Option<usize> {
    let at = text.find("END_HEADER")?;
    text[at..].find('\n').map(|nl| at + nl + 1)
}

struct Reader {
    gateway: OwnedMutexGuard<Box<dyn Gateway>>,
    buffer: Arc<BulkBuffer>,
    pending: String,
    separator: char,
    expected: usize,
    idle_timeout: Duration,
    address_prefix: Option<String>,
}

impl Reader {
    async fn run(mut self) {
        let result = self.stream().await.err().map(TransferError::from);
        if let Some(e) = &result {
            tracing::warn!(error = ?e, "bulk transfer aborted");
        } else {
            tracing::debug!(rows = self.buffer.received(), "bulk transfer complete");
        }
        self.buffer.finish(result);
    }

    async fn stream(&mut self) -> Result<()> {
        let mut last_data = Instant::now();
        loop {
            while let Some(nl) = self.pending.find('\n') {
                let line: String = self.pending.drain(..=nl).collect();
                let last = !line.ends_with(" \n");
                let mut body = line.trim();
                if let Some(p) = &self.address_prefix {
                    body = body.strip_prefix(p.as_str()).unwrap_or(body);
                }
                if !body.is_empty() {
                    let row = parse_row(body, self.separator)?;
                    self.buffer.append_row(&row)?;
                }
                if last || (self.expected > 0 && self.buffer.received() >= self.expected) {
                    return Ok(());
                }
            }
            if last_data.elapsed() >= self.idle_timeout {
                return Err(GcsError::Timeout(format!(
                    "array data stalled after {} rows",
                    self.buffer.received()
                )));
            }
            let chunk = self.gateway.read().await?;
            if chunk.is_empty() {
                tokio::task::yield_now().await;
            } else {
                last_data = Instant::now();
                self.pending.push_str(&chunk);
            }
        }
    }
}

impl Connection {
    /// Send a bulk query and return its header. `expected_rows` is used when
    /// the header has no `NDATA`. Rows keep streaming in the background.
    pub async fn begin_bulk_read(&mut self, query: &str, expected_rows: usize) -> Result<BulkHeader> {
        self.write(query).await?;
        let head = self.read_until(header_end).await?;
        let header = parse_header(&head)?;
        let dim = header.dim().unwrap_or(1);
        let expected = header.ndata().unwrap_or(expected_rows);
        let buffer = Arc::new(BulkBuffer::new(dim, expected));
        self.bulk = Some(Arc::clone(&buffer));
        tracing::debug!(query, dim, expected, "bulk transfer started");

        // lock now so no foreground command can interleave with the rows
        let gateway = self.gateway().lock_owned().await;
        let reader = Reader {
            gateway,
            buffer,
            pending: std::mem::take(&mut self.pending),
            separator: header.separator(),
            expected,
            idle_timeout: self.session().timeout,
            address_prefix: self.session().address.map(|a| format!("0 {a} ")),
        };
        tokio::spawn(reader.run());
        Ok(header)
    }

    /// Progress of the current transfer; `Idle` when none was started.
    #[must_use]
    pub fn transfer_state(&self) -> TransferState {
        self.bulk
            .as_ref()
            .map_or(TransferState::Idle, |b| b.state())
    }

    #[must_use]
    pub fn bulk_buffer(&self) -> Option<Arc<BulkBuffer>> {
        self.bulk.clone()
    }

    /// Payload of a completed transfer as columns.
    pub async fn fetch_data(&mut self) -> Result<Vec<Vec<f64>>> {
        let buffer = self
            .bulk
            .clone()
            .ok_or_else(|| GcsError::Usage("no array transfer was started".into()))?;
        let data = buffer.data()?;
        if self.errcheck() {
            self.check_error().await?;
        }
        Ok(data)
    }

    /// Wait for the running transfer to finish, polling every `poll`.
    pub async fn wait_transfer(&self, poll: Duration) -> Result<()> {
        let buffer = self
            .bulk
            .clone()
            .ok_or_else(|| GcsError::Usage("no array transfer was started".into()))?;
        while !buffer.state().is_complete() {
            tokio::time::sleep(poll).await;
        }
        Ok(())
    }
}
