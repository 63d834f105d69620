//! Message layer: one gateway plus the per-session state shared by every
//! command set.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant;

use crate::bulk::BulkBuffer;
use crate::capabilities::Capabilities;
use crate::config::config as global_config;
use crate::dialect::Dialect;
use crate::encoder::{encode, ArgGroup, FloatFormat};
use crate::error::{GcsError, Result};
use crate::error_codes::device_error;
use crate::gateway::{Gateway, GatewayEvent};
use crate::params::ParamTypeTable;

pub type SharedGateway = Arc<TokioMutex<Box<dyn Gateway>>>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Settings and caches that survive a change of command set.
#[derive(Debug, Clone)]
pub struct Session {
    pub errcheck: bool,
    pub timeout: Duration,
    pub float_format: FloatFormat,
    /// Daisy chain address; lines go out as `<address> <command>`.
    pub address: Option<u8>,
    pub axes: Option<Vec<String>>,
    pub capabilities: Option<Capabilities>,
    pub param_types: Option<ParamTypeTable>,
    /// User command level the parameter types were read with.
    pub param_types_level: Option<String>,
    pub devname: Option<String>,
    pub idn: Option<String>,
    pub interpreter: Option<String>,
    pub user_levels: Option<Vec<String>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            errcheck: true,
            timeout: Duration::from_millis(global_config().gcs_timeout_ms),
            float_format: FloatFormat::default(),
            address: None,
            axes: None,
            capabilities: None,
            param_types: None,
            param_types_level: None,
            devname: None,
            idn: None,
            interpreter: None,
            user_levels: None,
        }
    }
}

impl Session {
    /// Forget everything learned from the device; settings stay.
    pub fn invalidate_caches(&mut self) {
        self.axes = None;
        self.capabilities = None;
        self.param_types = None;
        self.param_types_level = None;
        self.devname = None;
        self.idn = None;
        self.interpreter = None;
        self.user_levels = None;
    }
}

/// Index just past the end of the first complete answer: a line feed not
/// preceded by a space (`" \n"` continues a multi-line answer).
#[must_use]
pub fn answer_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    bytes
        .iter()
        .enumerate()
        .find(|&(i, &b)| b == b'\n' && (i == 0 || bytes[i - 1] != b' '))
        .map(|(i, _)| i + 1)
}

pub struct Connection {
    gateway: SharedGateway,
    pub(crate) dialect: Dialect,
    session: Session,
    pub(crate) pending: String,
    pub(crate) bulk: Option<Arc<BulkBuffer>>,
    events: Option<broadcast::Receiver<GatewayEvent>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dialect", &self.dialect)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(gateway: impl Gateway + 'static) -> Self {
        Self::from_boxed(Box::new(gateway))
    }

    pub fn from_boxed(mut gateway: Box<dyn Gateway>) -> Self {
        let session = Session::default();
        gateway.set_timeout(session.timeout);
        let events = gateway.subscribe();
        Self {
            gateway: Arc::new(TokioMutex::new(gateway)),
            dialect: Dialect::Undetermined,
            session,
            pending: String::new(),
            bulk: None,
            events,
        }
    }

    #[must_use]
    pub const fn with_errcheck(mut self, on: bool) -> Self {
        self.session.errcheck = on;
        self
    }

    #[must_use]
    pub const fn with_float_format(mut self, fmt: FloatFormat) -> Self {
        self.session.float_format = fmt;
        self
    }

    #[must_use]
    pub const fn with_address(mut self, address: u8) -> Self {
        self.session.address = Some(address);
        self
    }

    /// Answer timeout; also pushed to the gateway on first use.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.session.timeout = timeout;
        if let Ok(mut gw) = self.gateway.try_lock() {
            gw.set_timeout(timeout);
        }
        self
    }

    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    #[must_use]
    pub const fn errcheck(&self) -> bool {
        self.session.errcheck
    }

    /// Toggle the implicit error query; returns the previous setting.
    pub fn set_errcheck(&mut self, on: bool) -> bool {
        std::mem::replace(&mut self.session.errcheck, on)
    }

    /// Run `f` with error checking off; the previous setting is restored
    /// whatever `f` returns.
    ///
    /// ```no_run
    /// # async fn demo(conn: &mut gcs_client::Connection) -> gcs_client::Result<()> {
    /// let stv = conn
    ///     .without_errcheck(|c| Box::pin(async move { c.read("STV?").await }))
    ///     .await?;
    /// # let _ = stv;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn without_errcheck<T>(
        &mut self,
        f: impl for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>>,
    ) -> Result<T> {
        let prev = self.set_errcheck(false);
        let result = f(self).await;
        self.session.errcheck = prev;
        result
    }

    pub async fn set_timeout(&mut self, timeout: Duration) {
        self.session.timeout = timeout;
        self.gateway.lock().await.set_timeout(timeout);
    }

    pub(crate) fn gateway(&self) -> SharedGateway {
        Arc::clone(&self.gateway)
    }

    /// Encode with the session's float format.
    #[must_use]
    pub fn encode(&self, verb: &str, groups: &[ArgGroup]) -> String {
        encode(verb, groups, self.session.float_format)
    }

    pub async fn connected(&self) -> bool {
        self.gateway.lock().await.connected()
    }

    pub async fn connection_id(&self) -> u32 {
        self.gateway.lock().await.connection_id()
    }

    /// True when the gateway reported a fresh connection since the last
    /// call. Cached device knowledge is dropped in that case.
    pub fn take_reconnect(&mut self) -> bool {
        let Some(rx) = self.events.as_mut() else {
            return false;
        };
        let mut reconnected = false;
        loop {
            match rx.try_recv() {
                Ok(GatewayEvent::Connected { connection_id }) => {
                    tracing::debug!(connection_id, "gateway reconnected");
                    reconnected = true;
                }
                Ok(GatewayEvent::Disconnected { .. }) => {}
                Err(TryRecvError::Lagged(_)) => reconnected = true,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        if reconnected {
            self.session.invalidate_caches();
            self.pending.clear();
            self.dialect = Dialect::Undetermined;
        }
        reconnected
    }

    fn frame(&self, cmd: &str) -> String {
        // single control characters (#5, #7, #24, ...) go out bare
        let bare = cmd.chars().count() == 1 && cmd.chars().all(char::is_control);
        let mut line = match self.session.address {
            Some(a) => format!("{a} {cmd}"),
            None => cmd.to_string(),
        };
        if !bare {
            line.push('\n');
        }
        line
    }

    pub(crate) async fn write(&mut self, cmd: &str) -> Result<()> {
        let line = self.frame(cmd);
        if global_config().log_traffic {
            log::debug!("[GCS send] {}", line.escape_debug());
        }
        self.gateway.lock().await.send(&line).await
    }

    /// Collect text until `done` finds the end, bounded by the session timeout.
    pub(crate) async fn read_until(&mut self, done: fn(&str) -> Option<usize>) -> Result<String> {
        let deadline = Instant::now() + self.session.timeout;
        loop {
            if let Some(end) = done(&self.pending) {
                let answer: String = self.pending.drain(..end).collect();
                if global_config().log_traffic {
                    log::debug!("[GCS recv] {}", answer.escape_debug());
                }
                return Ok(self.strip_address(&answer));
            }
            if Instant::now() >= deadline {
                return Err(GcsError::Timeout(format!(
                    "no complete answer within {:?} (got {:?})",
                    self.session.timeout, self.pending
                )));
            }
            let chunk = self.gateway.lock().await.read().await?;
            if chunk.is_empty() {
                tokio::task::yield_now().await;
            }
            self.pending.push_str(&chunk);
        }
    }

    // daisy chain answers start with "0 <address> "
    fn strip_address(&self, answer: &str) -> String {
        let Some(a) = self.session.address else {
            return answer.to_string();
        };
        let prefix = format!("0 {a} ");
        answer
            .split_inclusive('\n')
            .map(|l| l.strip_prefix(&prefix).unwrap_or(l))
            .collect()
    }

    /// Send a command; with error checking on, a non-zero error code fails.
    pub async fn send(&mut self, cmd: &str) -> Result<()> {
        self.write(cmd).await?;
        if self.session.errcheck {
            self.check_error().await?;
        }
        Ok(())
    }

    /// Send a query and return its complete answer text.
    pub async fn read(&mut self, cmd: &str) -> Result<String> {
        let answer = self.read_unchecked(cmd).await?;
        if self.session.errcheck {
            self.check_error().await?;
        }
        Ok(answer)
    }

    /// Query without the implicit error check.
    pub async fn read_unchecked(&mut self, cmd: &str) -> Result<String> {
        self.write(cmd).await?;
        self.read_until(answer_end).await
    }

    /// `ERR?`; reading it also clears the error on the device.
    pub async fn query_error(&mut self) -> Result<i32> {
        let answer = self.read_unchecked("ERR?").await?;
        answer
            .trim()
            .parse()
            .map_err(|_| GcsError::protocol("error code is not an integer", answer.clone()))
    }

    pub async fn check_error(&mut self) -> Result<()> {
        match self.query_error().await? {
            0 => Ok(()),
            code => Err(device_error(self.dialect, code)),
        }
    }

    /// Discard unread input on both sides of the gateway.
    pub async fn flush(&mut self) -> Result<()> {
        self.pending.clear();
        self.gateway.lock().await.flush().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.gateway.lock().await.close().await
    }
}
