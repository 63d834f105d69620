//! GCS 3.0 command set.

use async_trait::async_trait;
use indexmap::IndexMap;

use super::{identification, idn_name, select_axes, send_masked, AxisFlags, CommandSet};
use crate::block::{find_block, keys, names, parse_block};
use crate::capabilities::Capabilities;
use crate::connection::Connection;
use crate::decoder::{decode1, ValueType};
use crate::dialect::Dialect;
use crate::encoder::{Arg, ArgGroup};
use crate::error::{GcsError, Result};
use crate::params::{
    parse_spv_answer, spv_command, spv_query, ParamTypeTable, ParameterAddress, SpvAnswer,
    TraceAddress,
};
use crate::status::{decode_axis_status, decode_unit_status, AxisStatus, UnitStatus};

/// Marker of axis container units (`AXIS_1`, `AXIS_2`, ...).
pub const AXIS_UNIT: &str = "AXIS";

#[derive(Debug, Clone, Copy, Default)]
pub struct Gcs30Commands;

/// Raw `STV?` words of `units` (all units when empty). Read with error
/// checking off so that a faulted axis can still be inspected.
pub async fn status_words(conn: &mut Connection, units: &[String]) -> Result<IndexMap<String, u32>> {
    let cmd = conn.encode("STV?", &[ArgGroup::from(units.to_vec())]);
    let answer = conn
        .without_errcheck(|c| Box::pin(async move { c.read(&cmd).await }))
        .await?;
    let keys: Vec<&str> = units.iter().map(String::as_str).collect();
    let keys = (!keys.is_empty()).then_some(keys.as_slice());
    decode1(&answer, keys, &[ValueType::Hex])?
        .into_iter()
        .map(|(unit, entry)| {
            let word = entry
                .as_i64()
                .and_then(|w| u32::try_from(w).ok())
                .ok_or_else(|| GcsError::protocol(format!("bad status word of {unit}"), answer.clone()))?;
            Ok((unit, word))
        })
        .collect()
}

async fn axis_status(conn: &mut Connection, axes: &[String]) -> Result<IndexMap<String, AxisStatus>> {
    let words = status_words(conn, axes).await?;
    Ok(words
        .into_iter()
        .filter(|(unit, _)| !axes.is_empty() || unit.contains(AXIS_UNIT))
        .map(|(unit, w)| (unit, decode_axis_status(w)))
        .collect())
}

async fn axis_flags(
    conn: &mut Connection,
    axes: &[String],
    flag: fn(&AxisStatus) -> bool,
) -> Result<AxisFlags> {
    let status = axis_status(conn, axes).await?;
    let flags = status.iter().map(|(a, s)| (a.clone(), flag(s))).collect();
    select_axes(flags, axes)
}

impl Gcs30Commands {
    /// `IPR?`: the interpreter(s) the connection talks to, cached.
    pub async fn interpreter(conn: &mut Connection) -> Result<String> {
        if let Some(ipr) = &conn.session().interpreter {
            return Ok(ipr.clone());
        }
        let answer = conn.read("IPR?").await?;
        let ipr = answer.split_whitespace().collect::<Vec<_>>().join(" ");
        conn.session_mut().interpreter = Some(ipr.clone());
        Ok(ipr)
    }

    /// User command levels, lowest first, from `USG? PROP <interpreter>`.
    pub async fn user_levels(conn: &mut Connection) -> Result<Vec<String>> {
        if let Some(levels) = &conn.session().user_levels {
            return Ok(levels.clone());
        }
        let ipr = Self::interpreter(conn).await?;
        let answer = conn.read(&format!("USG? PROP {ipr}")).await?;
        let blocks = parse_block(&answer)?;
        let levels: Vec<String> = find_block(&blocks, names::USER_COMMAND_LEVEL)
            .ok_or_else(|| GcsError::protocol("no user command level block", answer.clone()))?
            .column(keys::COMMAND_LEVEL_NAME)
            .map(str::to_string)
            .collect();
        conn.session_mut().user_levels = Some(levels.clone());
        Ok(levels)
    }

    async fn load_param_types(conn: &mut Connection, level: String) -> Result<ParamTypeTable> {
        let answer = conn.read("USG? PAM").await?;
        let table = ParamTypeTable::from_usg_pam(&parse_block(&answer)?)?;
        tracing::debug!(types = table.len(), level = %level, "parameter types from USG? PAM");
        let session = conn.session_mut();
        session.param_types = Some(table.clone());
        session.param_types_level = Some(level);
        Ok(table)
    }
}

fn level_rank(levels: &[String], level: &str) -> Option<usize> {
    levels.iter().position(|l| l.eq_ignore_ascii_case(level))
}

#[async_trait]
impl CommandSet for Gcs30Commands {
    fn dialect(&self) -> Dialect {
        Dialect::Gcs30
    }

    async fn devname(&self, conn: &mut Connection) -> Result<String> {
        if let Some(name) = &conn.session().devname {
            return Ok(name.clone());
        }
        let name = idn_name(&identification(conn).await?)?;
        conn.session_mut().devname = Some(name.clone());
        Ok(name)
    }

    async fn load_capabilities(&self, conn: &mut Connection) -> Result<Capabilities> {
        let answer = conn.read("USG? CMD").await?;
        Ok(Capabilities::from_usg_cmd(&parse_block(&answer)?))
    }

    async fn axes(&self, conn: &mut Connection) -> Result<Vec<String>> {
        if let Some(axes) = &conn.session().axes {
            return Ok(axes.clone());
        }
        let axes: Vec<String> = status_words(conn, &[])
            .await?
            .into_keys()
            .filter(|u| u.contains(AXIS_UNIT))
            .collect();
        conn.session_mut().axes = Some(axes.clone());
        Ok(axes)
    }

    async fn stop_all(&self, conn: &mut Connection, noraise: bool) -> Result<()> {
        // STP does not leave a "stopped" error behind; nothing to mask
        if noraise {
            tracing::trace!("noraise has no effect on STP");
        }
        conn.send("STP").await
    }

    async fn halt(&self, conn: &mut Connection, axes: &[String], noraise: bool) -> Result<()> {
        let cmd = conn.encode("HLT", &[ArgGroup::from(axes.to_vec())]);
        send_masked(conn, &cmd, noraise).await
    }

    async fn is_moving(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags> {
        axis_flags(conn, axes, |s| s.in_motion).await
    }

    async fn is_controller_ready(&self, conn: &mut Connection) -> Result<bool> {
        let status = axis_status(conn, &[]).await?;
        Ok(!status.values().any(|s| s.internal_process_running))
    }

    async fn on_target(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags> {
        axis_flags(conn, axes, |s| s.on_target).await
    }

    async fn referenced(&self, conn: &mut Connection, axes: &[String]) -> Result<AxisFlags> {
        axis_flags(conn, axes, |s| s.referenced).await
    }

    async fn unit_status(
        &self,
        conn: &mut Connection,
        units: &[String],
    ) -> Result<IndexMap<String, UnitStatus>> {
        Ok(status_words(conn, units)
            .await?
            .into_iter()
            .map(|(u, w)| {
                let s = decode_unit_status(&u, w);
                (u, s)
            })
            .collect())
    }

    async fn param_types(&self, conn: &mut Connection) -> Result<ParamTypeTable> {
        let current = conn.read("UCL?").await?.trim().to_string();
        let cached = conn.session().param_types.clone();
        let built_with = conn.session().param_types_level.clone();
        match (cached, built_with) {
            (Some(table), Some(level)) => {
                let levels = Self::user_levels(conn).await?;
                let stale = match (level_rank(&levels, &level), level_rank(&levels, &current)) {
                    (Some(old), Some(new)) => old < new,
                    _ => false,
                };
                if stale {
                    tracing::debug!(from = %level, to = %current, "user level raised, reloading parameter types");
                    Self::load_param_types(conn, current).await
                } else {
                    Ok(table)
                }
            }
            _ => Self::load_param_types(conn, current).await,
        }
    }

    async fn read_parameters(
        &self,
        conn: &mut Connection,
        addr: &ParameterAddress,
    ) -> Result<SpvAnswer> {
        let cmd = spv_query(addr)?;
        let types = self.param_types(conn).await?;
        let answer = conn.read(&cmd).await?;
        parse_spv_answer(&answer, Some(&types))
    }

    async fn write_parameters(
        &self,
        conn: &mut Connection,
        memory: &str,
        items: &[(TraceAddress, Arg)],
    ) -> Result<()> {
        if memory.trim().is_empty() || items.is_empty() {
            return Err(GcsError::Validation(
                "SPV needs a memory type and at least one value".into(),
            ));
        }
        let cmd = spv_command(memory, items, conn.session().float_format);
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
        let cmd = conn.encode("UCL", &groups);
        conn.send(&cmd).await?;
        let session = conn.session_mut();
        session.capabilities = None;
        session.param_types = None;
        session.param_types_level = None;
        tracing::debug!(level, "user level changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Value;
    use crate::test_utils::ScriptedGateway;

    const STV: &str = "AXIS_1=0x00030202 \nAXIS_2=0x00040202 \nSYS_1=0x0\n";

    fn conn(gw: ScriptedGateway) -> Connection {
        let mut c = Connection::new(gw);
        c.dialect = Dialect::Gcs30;
        c
    }

    #[tokio::test]
    async fn axes_from_status_units() {
        // status is read without the error query
        let gw = ScriptedGateway::new().expect_answer("STV?", STV);
        let mut c = conn(gw);
        let axes = Gcs30Commands.axes(&mut c).await.expect("axes");
        assert_eq!(axes, ["AXIS_1", "AXIS_2"]);
        assert!(c.errcheck());
    }

    #[tokio::test]
    async fn motion_flags_from_status_words() {
        let gw = ScriptedGateway::new()
            .expect_answer("STV?", STV)
            .expect_answer("STV? AXIS_1", "AXIS_1=0x00030202\n");
        let mut c = conn(gw);
        let moving = Gcs30Commands.is_moving(&mut c, &[]).await.expect("moving");
        assert!(!moving["AXIS_1"]);
        assert!(moving["AXIS_2"]);
        assert_eq!(moving.len(), 2);

        let ont = Gcs30Commands
            .on_target(&mut c, &["AXIS_1".to_string()])
            .await
            .expect("ont");
        assert!(ont["AXIS_1"]);
    }

    #[tokio::test]
    async fn unit_status_per_layout() {
        let gw = ScriptedGateway::new().expect_answer("STV?", "AXIS_1=0x10000 \nSYS_1=0x2 \nTRK_1=0x7\n");
        let mut c = conn(gw);
        let st = Gcs30Commands.unit_status(&mut c, &[]).await.expect("status");
        assert!(st["AXIS_1"].axis().is_some_and(|a| a.closed_loop));
        assert!(matches!(st["SYS_1"], UnitStatus::System(s) if s.critical_error));
        assert_eq!(st["TRK_1"], UnitStatus::Raw(7));
    }

    #[tokio::test]
    async fn halt_masks_halt_was_commanded() {
        let gw = ScriptedGateway::new()
            .expect_send("HLT AXIS_1")
            .expect_answer("ERR?", "245836\n");
        let mut c = conn(gw);
        Gcs30Commands
            .halt(&mut c, &["AXIS_1".to_string()], true)
            .await
            .expect("masked");
    }

    const USG_PAM: &str = "#Parameter Overview:\tContainer Unit\tFunction Unit\tParameter ID\tData Type \n\
        AXIS_1\t-\t0x102\tFLOAT32 \n\
        #END\n";

    const USG_PROP: &str = "#User Command Level:\tName\tDescription \n\
        NORMAL\tDefault \n\
        ADVANCED\tService \n\
        #END\n";

    #[tokio::test]
    async fn parameter_types_reload_on_higher_level() {
        let gw = ScriptedGateway::new()
            .expect_answer("UCL?", "NORMAL\n")
            .expect_answer("ERR?", "0\n")
            .expect_answer("USG? PAM", USG_PAM)
            .expect_answer("ERR?", "0\n")
            .expect_answer("UCL?", "ADVANCED\n")
            .expect_answer("ERR?", "0\n")
            .expect_answer("IPR?", "SYS_1\n")
            .expect_answer("ERR?", "0\n")
            .expect_answer("USG? PROP SYS_1", USG_PROP)
            .expect_answer("ERR?", "0\n")
            .expect_answer("USG? PAM", USG_PAM)
            .expect_answer("ERR?", "0\n");
        let log = gw.log();
        let mut c = conn(gw);
        Gcs30Commands.param_types(&mut c).await.expect("first");
        assert_eq!(c.session().param_types_level.as_deref(), Some("NORMAL"));
        Gcs30Commands.param_types(&mut c).await.expect("reload");
        assert_eq!(c.session().param_types_level.as_deref(), Some("ADVANCED"));
        assert_eq!(log.remaining(), 0);
    }

    #[tokio::test]
    async fn spv_query_typed() {
        let gw = ScriptedGateway::new()
            .expect_answer("UCL?", "NORMAL\n")
            .expect_answer("USG? PAM", USG_PAM)
            .expect_answer("SPV? RAM AXIS_1 - 0x102", "RAM AXIS_1 - 0x102=3\n");
        let mut c = conn(gw).with_errcheck(false);
        let addr: ParameterAddress = "RAM AXIS_1 - 0x102".parse().expect("addr");
        let ans = Gcs30Commands.read_parameters(&mut c, &addr).await.expect("spv");
        assert_eq!(ans["RAM"]["AXIS_1"]["-"]["0x102"], Value::Float(3.0));
    }

    #[tokio::test]
    async fn capabilities_from_usg_cmd() {
        let gw = ScriptedGateway::new().expect_answer(
            "USG? CMD",
            "#Command Overview:\tCommand\tDescription \nREC?\tData \nREC\tConfigure \n#END\n",
        );
        let mut c = conn(gw).with_errcheck(false);
        let caps = super::super::capabilities(&Gcs30Commands, &mut c).await.expect("caps");
        assert!(caps.has("REC"));
        // second call is served from the session
        assert!(super::super::capabilities(&Gcs30Commands, &mut c).await.expect("cached").has("REC?"));
    }
}
