//! Dialect specific command sets.
//!
//! A command set holds no state of its own: everything learned from the
//! device lives in the [`Session`](crate::connection::Session) of the
//! connection it is called with, so swapping the set after detection keeps
//! caches and settings.

pub mod gcs2;
pub mod gcs30;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::capabilities::Capabilities;
use crate::connection::Connection;
use crate::dialect::Dialect;
use crate::encoder::Arg;
use crate::error::{GcsError, Result};
use crate::error_codes::is_masked;
use crate::params::{ParamTypeTable, ParameterAddress, SpvAnswer, TraceAddress};
use crate::status::UnitStatus;

pub use gcs2::Gcs2Commands;
pub use gcs30::Gcs30Commands;

/// Per-axis boolean answer.
pub type AxisFlags = IndexMap<String, bool>;

#[async_trait]
pub trait CommandSet: Send + Sync + std::fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Device name from `*IDN?`, cached in the session.
    async fn devname(&self, conn: &mut Connection) -> Result<String>;

    /// Ask the device which verbs it knows. Use [`capabilities`] for the
    /// cached view.
    async fn load_capabilities(&self, conn: &mut Connection) -> Result<Capabilities>;

    /// All axis identifiers, cached in the session.
    async fn axes(&self, conn: &mut Connection) -> Result<Vec<String>>;

    async fn stop_all(&self, conn: &mut Connection, noraise: bool) -> Result<()>;

    /// Halt `axes` (all when empty).
    async fn halt(&self, conn: &mut Connection, axes: &[String], noraise: bool) -> Result<()>;

    async fn is_moving(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags>;

    async fn is_controller_ready(&self, conn: &mut Connection) -> Result<bool>;

    async fn on_target(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags>;

    async fn referenced(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags>;

    async fn is_running_macro(&self, _conn: &mut Connection) -> Result<bool> {
        Err(GcsError::Unsupported(format!(
            "{} devices have no macro status",
            self.dialect()
        )))
    }

    /// Status words per container unit.
    async fn unit_status(
        &self,
        _conn: &mut Connection,
        _units: &[String],
    ) -> Result<IndexMap<String, UnitStatus>> {
        Err(GcsError::Unsupported(format!(
            "{} devices have no status words",
            self.dialect()
        )))
    }

    /// Parameter types as the device currently exposes them; cached in the
    /// session and refreshed when needed.
    async fn param_types(&self, conn: &mut Connection) -> Result<ParamTypeTable>;

    async fn read_parameters(
        &self,
        conn: &mut Connection,
        addr: &ParameterAddress,
    ) -> Result<SpvAnswer>;

    async fn write_parameters(
        &self,
        conn: &mut Connection,
        memory: &str,
        items: &[(TraceAddress, Arg)],
    ) -> Result<()>;

    /// Change the command (GCS2 `CCL`) or user (GCS30 `UCL`) level. Cached
    /// tables are dropped since they depend on the level.
    async fn set_command_level(
        &self,
        conn: &mut Connection,
        level: &str,
        password: Option<&str>,
    ) -> Result<()>;
}

/// Capabilities, loaded once per session.
pub async fn capabilities(set: &dyn CommandSet, conn: &mut Connection) -> Result<Capabilities> {
    if let Some(caps) = &conn.session().capabilities {
        return Ok(caps.clone());
    }
    let caps = set.load_capabilities(conn).await?;
    tracing::debug!(dialect = %set.dialect(), verbs = caps.len(), "capabilities loaded");
    conn.session_mut().capabilities = Some(caps.clone());
    Ok(caps)
}

/// Send `cmd`, swallowing the dialect's "stopped by command" error when
/// `noraise` is set.
pub(crate) async fn send_masked(conn: &mut Connection, cmd: &str, noraise: bool) -> Result<()> {
    match conn.send(cmd).await {
        Err(e) if is_masked(conn.dialect(), &e, noraise) => {
            tracing::debug!(cmd = %cmd.escape_debug(), error = %e, "masked stop error");
            Ok(())
        }
        other => other,
    }
}

/// `*IDN?`, cached in the session.
pub(crate) async fn identification(conn: &mut Connection) -> Result<String> {
    if let Some(idn) = &conn.session().idn {
        return Ok(idn.clone());
    }
    let idn = conn.read("*IDN?").await?.trim().to_string();
    conn.session_mut().idn = Some(idn.clone());
    Ok(idn)
}

/// Second comma separated field of `*IDN?`, upper-cased.
pub(crate) fn idn_name(idn: &str) -> Result<String> {
    idn.split(',')
        .nth(1)
        .map(|n| n.trim().to_uppercase())
        .ok_or_else(|| GcsError::protocol("identification without device name", idn))
}

/// Keep the flags of `axes` in the requested order; every axis must be known.
pub(crate) fn select_axes(all: AxisFlags, axes: &[String]) -> Result<AxisFlags> {
    if axes.is_empty() {
        return Ok(all);
    }
    axes.iter()
        .map(|a| {
            all.get(a)
                .map(|v| (a.clone(), *v))
                .ok_or_else(|| GcsError::Validation(format!("unknown axis {a:?}")))
        })
        .collect()
}
