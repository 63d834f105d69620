//! GCS 2.0 command set.

use async_trait::async_trait;
use indexmap::IndexMap;

use super::{identification, idn_name, select_axes, send_masked, AxisFlags, CommandSet};
use crate::capabilities::Capabilities;
use crate::connection::Connection;
use crate::decoder::{decode1, decode2, Entry, ValueType};
use crate::dialect::Dialect;
use crate::encoder::{Arg, ArgGroup};
use crate::error::{GcsError, Result};
use crate::params::{
    normalize_param_id, ParamTypeTable, ParameterAddress, SpvAnswer, TraceAddress, EMPTY,
};

/// `#5`: hex bit mask of moving axes.
pub const MOTION_STATUS: &str = "\x05";
/// `#7`: `0xB1` ready, `0xB0` busy.
pub const CONTROLLER_READY: &str = "\x07";
/// `#8`: non-zero while a macro runs.
pub const MACRO_RUNNING: &str = "\x08";
/// `#24`: stop all motion.
pub const STOP_ALL: &str = "\x18";

const READY: char = '\u{b1}';
const BUSY: char = '\u{b0}';

#[derive(Debug, Clone, Copy, Default)]
pub struct Gcs2Commands;

/// Memory types of the GCS 3.0 addressing mapped onto `SPA?`/`SEP?`.
fn param_query(memory: &str) -> &'static str {
    if memory.eq_ignore_ascii_case("RAM") {
        "SPA?"
    } else {
        "SEP?"
    }
}

fn axis_group(axes: &[String]) -> ArgGroup {
    ArgGroup::from(axes.to_vec())
}

fn entry_text(entry: &Entry) -> String {
    entry
        .values()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

async fn flag_query(conn: &mut Connection, verb: &str, axes: &[String]) -> Result<AxisFlags> {
    let cmd = conn.encode(verb, &[axis_group(axes)]);
    let answer = conn.read(&cmd).await?;
    let keys: Vec<&str> = axes.iter().map(String::as_str).collect();
    let keys = (!keys.is_empty()).then_some(keys.as_slice());
    decode1(&answer, keys, &[ValueType::Bool])?
        .into_iter()
        .map(|(k, v)| {
            v.as_bool()
                .map(|b| (k, b))
                .ok_or_else(|| GcsError::protocol(format!("{verb} flag is not boolean"), answer.clone()))
        })
        .collect()
}

#[async_trait]
impl CommandSet for Gcs2Commands {
    fn dialect(&self) -> Dialect {
        Dialect::Gcs2
    }

    async fn devname(&self, conn: &mut Connection) -> Result<String> {
        if let Some(name) = &conn.session().devname {
            return Ok(name.clone());
        }
        let idn = identification(conn).await?.to_uppercase();
        let name = if idn.contains("PI-E816") {
            "E-816".to_string()
        } else if idn.contains("DIGITAL PIEZO CONTROLLER") {
            "E-710".to_string()
        } else {
            idn_name(&idn)?
        };
        tracing::debug!(devname = %name, "device name");
        conn.session_mut().devname = Some(name.clone());
        Ok(name)
    }

    async fn load_capabilities(&self, conn: &mut Connection) -> Result<Capabilities> {
        let name = self.devname(conn).await?;
        if let Some(caps) = Capabilities::for_device(&name) {
            return Ok(caps);
        }
        let help = conn.read("HLP?").await?;
        Ok(Capabilities::from_hlp(&help))
    }

    async fn axes(&self, conn: &mut Connection) -> Result<Vec<String>> {
        if let Some(axes) = &conn.session().axes {
            return Ok(axes.clone());
        }
        let answer = conn.read("SAI?").await?;
        let axes: Vec<String> = answer
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        conn.session_mut().axes = Some(axes.clone());
        Ok(axes)
    }

    async fn stop_all(&self, conn: &mut Connection, noraise: bool) -> Result<()> {
        send_masked(conn, STOP_ALL, noraise).await
    }

    async fn halt(&self, conn: &mut Connection, axes: &[String], noraise: bool) -> Result<()> {
        let cmd = conn.encode("HLT", &[axis_group(axes)]);
        send_masked(conn, &cmd, noraise).await
    }

    async fn is_moving(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags> {
        let all = self.axes(conn).await?;
        let answer = conn.read(MOTION_STATUS).await?;
        let text = answer.trim();
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        let mask = u64::from_str_radix(digits, 16)
            .map_err(|_| GcsError::protocol("motion status is not a hex mask", answer.clone()))?;
        let flags = all
            .into_iter()
            .enumerate()
            .map(|(i, axis)| (axis, i < 64 && mask & (1 << i) != 0))
            .collect();
        select_axes(flags, axes)
    }

    async fn is_controller_ready(&self, conn: &mut Connection) -> Result<bool> {
        let answer = conn.read(CONTROLLER_READY).await?;
        match answer.trim().chars().next() {
            Some(READY) => Ok(true),
            Some(BUSY) => Ok(false),
            _ => Err(GcsError::protocol("unexpected ready status", answer)),
        }
    }

    async fn on_target(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags> {
        flag_query(conn, "ONT?", axes).await
    }

    async fn referenced(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags> {
        flag_query(conn, "FRF?", axes).await
    }

    async fn is_running_macro(&self, conn: &mut Connection) -> Result<bool> {
        let answer = conn.read(MACRO_RUNNING).await?;
        answer
            .trim()
            .parse::<i64>()
            .map(|v| v != 0)
            .map_err(|_| GcsError::protocol("macro status is not an integer", answer))
    }

    async fn param_types(&self, conn: &mut Connection) -> Result<ParamTypeTable> {
        if let Some(t) = &conn.session().param_types {
            return Ok(t.clone());
        }
        let hpa = conn.read("HPA?").await?;
        let table = ParamTypeTable::from_hpa(&hpa)?;
        tracing::debug!(types = table.len(), "parameter types from HPA?");
        conn.session_mut().param_types = Some(table.clone());
        Ok(table)
    }

    async fn read_parameters(
        &self,
        conn: &mut Connection,
        addr: &ParameterAddress,
    ) -> Result<SpvAnswer> {
        if addr.function.as_deref().is_some_and(|f| f != EMPTY) {
            return Err(GcsError::Validation(format!(
                "GCS2 parameters have no function unit: {addr}"
            )));
        }
        let verb = param_query(&addr.memory);
        let mut groups = Vec::new();
        if let Some(item) = &addr.container {
            groups.push(ArgGroup::from(Arg::from(item)));
        }
        if let Some(pid) = &addr.param {
            groups.push(ArgGroup::from(Arg::from(pid)));
        }
        let cmd = conn.encode(verb, &groups);
        let answer = conn.read(&cmd).await?;
        let types = self.param_types(conn).await?;

        let mut units = IndexMap::new();
        for (item, params) in decode2(&answer, None, None, &[ValueType::Str])? {
            let mut values = IndexMap::new();
            for (pid, entry) in params {
                let pid = normalize_param_id(&pid)
                    .map_err(|_| GcsError::protocol("bad parameter id", answer.clone()))?;
                let value = types.convert_id(&pid, &entry_text(&entry))?;
                values.insert(pid, value);
            }
            let mut functions = IndexMap::new();
            functions.insert(EMPTY.to_string(), values);
            units.insert(item, functions);
        }
        let mut out = SpvAnswer::new();
        out.insert(addr.memory.clone(), units);
        Ok(out)
    }

    async fn write_parameters(
        &self,
        conn: &mut Connection,
        memory: &str,
        items: &[(TraceAddress, Arg)],
    ) -> Result<()> {
        if !memory.eq_ignore_ascii_case("RAM") {
            return Err(GcsError::Validation(format!(
                "GCS2 parameters are written to RAM only, not {memory}"
            )));
        }
        if let Some((addr, _)) = items.iter().find(|(a, _)| a.function != EMPTY) {
            return Err(GcsError::Validation(format!(
                "GCS2 parameters have no function unit: {addr}"
            )));
        }
        let (units, rest): (Vec<Arg>, Vec<(Arg, Arg)>) = items
            .iter()
            .map(|(a, v)| (Arg::from(&a.container), (Arg::from(&a.param), v.clone())))
            .unzip();
        let (ids, values): (Vec<Arg>, Vec<Arg>) = rest.into_iter().unzip();
        let cmd = conn.encode(
            "SPA",
            &[ArgGroup(units), ArgGroup(ids), ArgGroup(values)],
        );
        conn.send(&cmd).await
    }

    async fn set_command_level(
        &self,
        conn: &mut Connection,
        level: &str,
        password: Option<&str>,
    ) -> Result<()> {
        let mut groups = vec![ArgGroup::from(level)];
        if let Some(pw) = password {
            groups.push(ArgGroup::from(pw));
        }
        let cmd = conn.encode("CCL", &groups);
        conn.send(&cmd).await?;
        let session = conn.session_mut();
        session.capabilities = None;
        session.param_types = None;
        session.param_types_level = None;
        tracing::debug!(level, "command level changed");
        Ok(())
    }
}
