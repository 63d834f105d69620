//! The device handle applications work with.
//!
//! [`GcsDevice`] owns one [`Connection`] and the command set matching the
//! dialect the controller speaks. The set is chosen on first use and again
//! after the gateway reported a reconnect; settings and caches live in the
//! connection, so switching sets keeps them.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::capabilities::Capabilities;
use crate::commands::{self, AxisFlags, CommandSet, Gcs2Commands, Gcs30Commands};
use crate::connection::Connection;
use crate::dialect::{self, Dialect};
use crate::encoder::Arg;
use crate::error::{GcsError, Result};
use crate::error_codes::{device_error, is_masked};
use crate::gateway::TcpGateway;
use crate::params::{ParamTypeTable, ParameterAddress, SpvAnswer, TraceAddress};
use crate::recorder::{DataRecorder, Gcs2Recorder, Gcs30Recorder, Recorder};
use crate::status::UnitStatus;

/// Verbs a GCS 3.0 data recorder needs.
pub const GCS30_RECORDER_VERBS: &[&str] = &["USG?", "SPV?", "REC?", "REC"];
/// Verbs a GCS2 data recorder needs.
pub const GCS2_RECORDER_VERBS: &[&str] = &["DRC", "DRR?"];

fn command_set_for(d: Dialect) -> Result<Arc<dyn CommandSet>> {
    match d {
        Dialect::Gcs2 => Ok(Arc::new(Gcs2Commands)),
        Dialect::Gcs30 => Ok(Arc::new(Gcs30Commands)),
        Dialect::Undetermined => Err(GcsError::Usage("dialect is not determined".into())),
    }
}

#[derive(Debug)]
pub struct GcsDevice {
    conn: Connection,
    commands: Option<Arc<dyn CommandSet>>,
}

impl GcsDevice {
    /// Wrap a connection; the dialect is detected on first use.
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self {
            conn,
            commands: None,
        }
    }

    /// Connect over TCP and detect the dialect right away.
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let gw = TcpGateway::connect(host, port).await?;
        let mut dev = Self::new(Connection::new(gw));
        dev.detect().await?;
        Ok(dev)
    }

    /// Skip detection for a controller whose dialect is known.
    pub fn with_dialect(mut conn: Connection, d: Dialect) -> Result<Self> {
        let commands = command_set_for(d)?;
        conn.dialect = d;
        Ok(Self {
            conn,
            commands: Some(commands),
        })
    }

    /// Probe the controller and switch to the matching command set.
    pub async fn detect(&mut self) -> Result<Dialect> {
        let d = dialect::detect(&mut self.conn).await?;
        self.commands = Some(command_set_for(d)?);
        self.conn.dialect = d;
        tracing::info!(dialect = %d, "command set selected");
        Ok(d)
    }

    /// Current command set, detecting first when needed.
    pub async fn command_set(&mut self) -> Result<Arc<dyn CommandSet>> {
        if self.conn.take_reconnect() {
            tracing::info!("gateway reconnected, dialect will be detected again");
            self.commands = None;
        }
        if self.commands.is_none() {
            self.detect().await?;
        }
        self.commands
            .clone()
            .ok_or_else(|| GcsError::Usage("no command set".into()))
    }

    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    #[must_use]
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    pub async fn capabilities(&mut self) -> Result<Capabilities> {
        let set = self.command_set().await?;
        commands::capabilities(set.as_ref(), &mut self.conn).await
    }

    /// Whether the controller knows `verb` (`"MOV"`, `"REC START"`, `"#5"`).
    pub async fn has(&mut self, verb: &str) -> Result<bool> {
        Ok(self.capabilities().await?.has(verb))
    }

    pub async fn require(&mut self, verb: &str) -> Result<()> {
        self.capabilities().await?.require(verb)
    }

    pub async fn send(&mut self, cmd: &str) -> Result<()> {
        self.command_set().await?;
        self.conn.send(cmd).await
    }

    pub async fn read(&mut self, cmd: &str) -> Result<String> {
        self.command_set().await?;
        self.conn.read(cmd).await
    }

    /// `*IDN?`
    pub async fn qidn(&mut self) -> Result<String> {
        self.command_set().await?;
        commands::identification(&mut self.conn).await
    }

    pub async fn devname(&mut self) -> Result<String> {
        let set = self.command_set().await?;
        set.devname(&mut self.conn).await
    }

    pub async fn axes(&mut self) -> Result<Vec<String>> {
        let set = self.command_set().await?;
        set.axes(&mut self.conn).await
    }

    pub async fn stop_all(&mut self, noraise: bool) -> Result<()> {
        let set = self.command_set().await?;
        set.stop_all(&mut self.conn, noraise).await
    }

    pub async fn halt(&mut self, axes: &[String], noraise: bool) -> Result<()> {
        let set = self.command_set().await?;
        set.halt(&mut self.conn, axes, noraise).await
    }

    pub async fn is_moving(&mut self, axes: &[String]) -> Result<AxisFlags> {
        let set = self.command_set().await?;
        set.is_moving(&mut self.conn, axes).await
    }

    pub async fn is_controller_ready(&mut self) -> Result<bool> {
        let set = self.command_set().await?;
        set.is_controller_ready(&mut self.conn).await
    }

    pub async fn on_target(&mut self, axes: &[String]) -> Result<AxisFlags> {
        let set = self.command_set().await?;
        set.on_target(&mut self.conn, axes).await
    }

    pub async fn referenced(&mut self, axes: &[String]) -> Result<AxisFlags> {
        let set = self.command_set().await?;
        set.referenced(&mut self.conn, axes).await
    }

    pub async fn is_running_macro(&mut self) -> Result<bool> {
        let set = self.command_set().await?;
        set.is_running_macro(&mut self.conn).await
    }

    pub async fn unit_status(&mut self, units: &[String]) -> Result<IndexMap<String, UnitStatus>> {
        let set = self.command_set().await?;
        set.unit_status(&mut self.conn, units).await
    }

    pub async fn param_types(&mut self) -> Result<ParamTypeTable> {
        let set = self.command_set().await?;
        set.param_types(&mut self.conn).await
    }

    pub async fn read_parameters(&mut self, addr: &ParameterAddress) -> Result<SpvAnswer> {
        let set = self.command_set().await?;
        set.read_parameters(&mut self.conn, addr).await
    }

    pub async fn write_parameters(&mut self, memory: &str, items: &[(TraceAddress, Arg)]) -> Result<()> {
        let set = self.command_set().await?;
        set.write_parameters(&mut self.conn, memory, items).await
    }

    pub async fn set_command_level(&mut self, level: &str, password: Option<&str>) -> Result<()> {
        let set = self.command_set().await?;
        set.set_command_level(&mut self.conn, level, password).await
    }

    /// Reboot the controller.
    ///
    /// A controller that is already restarting does not answer the error
    /// query; that timeout is not an error. The stop code is masked when
    /// `noraise` is set.
    pub async fn reboot(&mut self, noraise: bool) -> Result<()> {
        let d = self.command_set().await?.dialect();
        self.conn.write("RBT").await?;
        match self.conn.query_error().await {
            Ok(0) => {}
            Ok(code) => {
                let err = device_error(d, code);
                if !is_masked(d, &err, noraise) {
                    return Err(err);
                }
                tracing::debug!(error = %err, "masked reboot error");
            }
            Err(e) if e.is_timeout() => {
                tracing::info!(error = %e, "no answer after RBT, controller is restarting");
            }
            Err(e) => return Err(e),
        }
        self.conn.session_mut().invalidate_caches();
        self.conn.flush().await
    }

    /// Open data recorder `id` (GCS 3.0, e.g. `REC_1`) or the recorder
    /// tables of a GCS2 controller (`id` is ignored).
    pub async fn recorder(&mut self, id: Option<&str>) -> Result<DataRecorder<'_>> {
        let d = self.command_set().await?.dialect();
        let (inner, verbs): (Box<dyn Recorder>, &[&str]) = match d {
            Dialect::Gcs30 => {
                let id = id.ok_or_else(|| GcsError::Validation("GCS 3.0 recorders need an id".into()))?;
                (Box::new(Gcs30Recorder::new(id)?), GCS30_RECORDER_VERBS)
            }
            _ => (Box::new(Gcs2Recorder::new()), GCS2_RECORDER_VERBS),
        };
        let caps = self.capabilities().await?;
        for verb in verbs {
            caps.require(verb)?;
        }
        DataRecorder::open(&mut self.conn, inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayEvent;
    use crate::test_utils::ScriptedGateway;

    const USG_CMD: &str = "#Command Overview:\tCommand\tDescription \n\
        REC\tRecorder \n\
        REC?\tRecorder query \n\
        SPV?\tParameter value \n\
        USG?\tUsage \n\
        #END\n";

    #[tokio::test]
    async fn detects_once_and_caches_capabilities() {
        let gw = ScriptedGateway::new()
            .expect_answer("CSV?", "3.0\n")
            .expect_answer("USG? CMD", USG_CMD);
        let log = gw.log();
        let mut dev = GcsDevice::new(Connection::new(gw).with_errcheck(false));
        assert_eq!(dev.dialect(), Dialect::Undetermined);
        assert!(dev.has("REC?").await.expect("has"));
        assert!(!dev.has("MOV").await.expect("has"));
        assert!(matches!(dev.require("MOV").await, Err(GcsError::Unsupported(_))));
        assert_eq!(dev.dialect(), Dialect::Gcs30);
        assert_eq!(log.sent(), ["CSV?\n", "USG? CMD\n"]);
    }

    #[tokio::test]
    async fn reconnect_triggers_detection_again() {
        let gw = ScriptedGateway::new()
            .expect_answer("CSV?", "2.0\n")
            .expect_answer("*IDN?", "PI, E-727, 1, 1.2.3\n")
            .expect_answer("CSV?", "3.0\n")
            .expect_answer("*IDN?", "PI, C-885, 1, 1.2.3.4\n");
        let events = gw.events();
        let mut dev = GcsDevice::new(Connection::new(gw).with_errcheck(false));
        assert_eq!(dev.qidn().await.expect("idn"), "PI, E-727, 1, 1.2.3");
        assert_eq!(dev.dialect(), Dialect::Gcs2);

        events
            .send(GatewayEvent::Connected { connection_id: 1 })
            .expect("event");
        assert_eq!(dev.qidn().await.expect("idn"), "PI, C-885, 1, 1.2.3.4");
        assert_eq!(dev.dialect(), Dialect::Gcs30);
    }

    #[tokio::test]
    async fn reboot_tolerates_silence() {
        let gw = ScriptedGateway::new()
            .expect_send("RBT")
            .responder(|cmd| (cmd == "ERR?").then(String::new));
        let log = gw.log();
        let conn = Connection::new(gw).with_timeout(std::time::Duration::from_millis(20));
        let mut dev = GcsDevice::with_dialect(conn, Dialect::Gcs2).expect("dev");
        dev.reboot(false).await.expect("restarting controller");
        assert_eq!(log.sent(), ["RBT\n", "ERR?\n"]);
    }

    #[tokio::test]
    async fn reboot_does_not_mask_link_failures() {
        // ERR? is not scripted, the gateway refuses it
        let gw = ScriptedGateway::new().expect_send("RBT");
        let mut dev = GcsDevice::with_dialect(Connection::new(gw), Dialect::Gcs2).expect("dev");
        assert!(matches!(dev.reboot(true).await, Err(GcsError::Transport(_))));
    }

    #[tokio::test]
    async fn reboot_masks_stop_code_on_request() {
        let script = || {
            ScriptedGateway::new()
                .expect_send("RBT")
                .expect_answer("ERR?", "10\n")
        };
        let mut dev = GcsDevice::with_dialect(Connection::new(script()), Dialect::Gcs2).expect("dev");
        dev.reboot(true).await.expect("masked");
        let mut dev = GcsDevice::with_dialect(Connection::new(script()), Dialect::Gcs2).expect("dev");
        let err = dev.reboot(false).await.expect_err("raised");
        assert_eq!(err.device_code(), Some(10));
    }

    #[tokio::test]
    async fn recorder_needs_prefix_and_verbs() {
        let gw = ScriptedGateway::new().expect_answer("USG? CMD", "#Command Overview:\tCommand\tDescription \nUSG?\tUsage \n#END\n");
        let conn = Connection::new(gw).with_errcheck(false);
        let mut dev = GcsDevice::with_dialect(conn, Dialect::Gcs30).expect("dev");
        assert!(matches!(dev.recorder(Some("DRC_1")).await, Err(GcsError::Validation(_))));
        assert!(matches!(dev.recorder(None).await, Err(GcsError::Validation(_))));
        assert!(matches!(dev.recorder(Some("REC_1")).await, Err(GcsError::Unsupported(_))));
    }

    #[test]
    fn undetermined_dialect_is_rejected() {
        let conn = Connection::new(ScriptedGateway::new());
        assert!(matches!(
            GcsDevice::with_dialect(conn, Dialect::Undetermined),
            Err(GcsError::Usage(_))
        ));
    }
}
