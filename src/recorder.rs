//! Data recorder: configure, arm, wait, read.
//!
//! ```text
//!        arm()                trigger fires
//! CONFIG ─────▶ WAITING ────────────────▶ RUNNING
//!    ▲                                      │
//!    └──────────── stop() ◀─────────────────┘
//! ```
//!
//! `arm()` stops a recorder that is not in CONFIG, pushes the record rate,
//! trace table and trigger that were set, then starts it. Anything left
//! unset keeps the device's own setting and is read back when needed. `read()` waits until the
//! requested number of values was captured and fetches them with a bulk
//! transfer. A deadline miss is reported, the recorder keeps running.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::block::{find_block, keys, names, parse_block};
use crate::bulk::{BulkBuffer, BulkHeader};
use crate::connection::Connection;
use crate::decoder::{decode1, decode2, decode_scalar, Entry, Value, ValueType};
use crate::encoder::CommandBuilder;
use crate::error::{GcsError, Result};
use crate::params::{parse_spv_answer, spv_query, ParameterAddress, TraceAddress, EMPTY};

/// Poll interval of the captured-sample counter.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// GCS 3.0 recorder ids look like `REC_1`.
pub const REC_PREFIX: &str = "REC_";

/// Trigger name plus two options. Missing options are sent as `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub name: String,
    pub options: [String; 2],
}

impl Trigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ["0".to_string(), "0".to_string()],
        }
    }

    /// `[name]`, `[name, opt1]` or `[name, opt1, opt2]`.
    pub fn from_parts(parts: &[&str]) -> Result<Self> {
        match parts {
            [name] => Ok(Self::new(*name)),
            [name, o1] => Ok(Self {
                name: (*name).to_string(),
                options: [(*o1).to_string(), "0".to_string()],
            }),
            [name, o1, o2] => Ok(Self {
                name: (*name).to_string(),
                options: [(*o1).to_string(), (*o2).to_string()],
            }),
            _ => Err(GcsError::Validation(format!(
                "trigger needs a name and up to 2 options, got {parts:?}"
            ))),
        }
    }
}

impl FromStr for Trigger {
    type Err = GcsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_parts(&s.split_whitespace().collect::<Vec<_>>())
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.options[0], self.options[1])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecorderState {
    Config,
    Waiting,
    Running,
}

impl RecorderState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "CFG",
            Self::Waiting => "WAIT",
            Self::Running => "RUN",
        }
    }
}

impl FromStr for RecorderState {
    type Err = GcsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CFG" => Ok(Self::Config),
            "WAIT" => Ok(Self::Waiting),
            "RUN" => Ok(Self::Running),
            other => Err(GcsError::protocol("unknown recorder state", other)),
        }
    }
}

/// Device limits, read once per recorder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecorderLimits {
    /// Servo cycle in seconds.
    pub servo_time: f64,
    pub max_traces: usize,
    pub max_values: usize,
}

/// What to record and how much to read back.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Trace id (1-based) → signal source. `None` keeps the device table.
    pub traces: Option<BTreeMap<usize, TraceAddress>>,
    /// `None` keeps the trigger configured on the device.
    pub trigger: Option<Trigger>,
    /// Servo cycles per sample. `None` keeps the device rate.
    pub record_rate: Option<u32>,
    /// `0` reads the device maximum.
    pub number_of_values: usize,
    /// First value to read, 1-based.
    pub offset: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            traces: None,
            trigger: None,
            record_rate: None,
            number_of_values: 0,
            offset: 1,
        }
    }
}

impl CaptureConfig {
    /// Traces numbered in order, starting at 1.
    pub fn with_traces<I>(mut self, traces: I) -> Self
    where
        I: IntoIterator<Item = TraceAddress>,
    {
        self.traces = Some(traces.into_iter().enumerate().map(|(i, t)| (i + 1, t)).collect());
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    #[must_use]
    pub const fn with_record_rate(mut self, rate: u32) -> Self {
        self.record_rate = Some(rate);
        self
    }

    #[must_use]
    pub const fn with_number_of_values(mut self, n: usize) -> Self {
        self.number_of_values = n;
        self
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Values to read once `number_of_values` defaults are resolved.
    #[must_use]
    pub const fn values_to_read(&self, limits: &RecorderLimits) -> usize {
        if self.number_of_values == 0 {
            limits.max_values
        } else {
            self.number_of_values
        }
    }

    /// Check against the device limits; nothing is sent to the device.
    pub fn validate(&self, limits: &RecorderLimits) -> Result<()> {
        if let Some(traces) = &self.traces {
            if traces.len() > limits.max_traces {
                return Err(GcsError::Validation(format!(
                    "{} traces configured, the recorder supports {}",
                    traces.len(),
                    limits.max_traces
                )));
            }
            if let Some(id) = traces.keys().find(|&&id| id == 0 || id > limits.max_traces) {
                return Err(GcsError::Validation(format!(
                    "trace id {id} outside 1..={}",
                    limits.max_traces
                )));
            }
        }
        if self.record_rate == Some(0) {
            return Err(GcsError::Validation("record rate must be >= 1".into()));
        }
        if self.offset == 0 || self.offset > limits.max_values {
            return Err(GcsError::Validation(format!(
                "offset {} outside 1..={}",
                self.offset, limits.max_values
            )));
        }
        if self.number_of_values > limits.max_values {
            return Err(GcsError::Validation(format!(
                "number of values {} exceeds {}",
                self.number_of_values, limits.max_values
            )));
        }
        Ok(())
    }

    /// One slot per trace id `1..=max`, `None` for unused ids. Nothing
    /// when the trace table was left unset.
    #[must_use]
    pub fn trace_slots(&self, max_traces: usize) -> Option<Vec<(usize, Option<&TraceAddress>)>> {
        let traces = self.traces.as_ref()?;
        Some((1..=max_traces).map(|id| (id, traces.get(&id))).collect())
    }
}

/// Result of [`DataRecorder::read`].
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub header: BulkHeader,
    /// One column per trace.
    pub data: Vec<Vec<f64>>,
}

/// Device side of a data recorder.
#[async_trait]
pub trait Recorder: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    async fn read_limits(&self, conn: &mut Connection) -> Result<RecorderLimits>;

    async fn state(&mut self, conn: &mut Connection) -> Result<RecorderState>;

    async fn stop(&mut self, conn: &mut Connection) -> Result<()>;

    /// Rate currently configured on the device.
    async fn record_rate(&mut self, conn: &mut Connection) -> Result<u32>;

    /// Trace table currently configured on the device, unused ids left out.
    async fn traces(&mut self, conn: &mut Connection) -> Result<BTreeMap<usize, TraceAddress>>;

    /// Push what `cfg` sets; unset items stay as they are on the device.
    /// The recorder is in CONFIG.
    async fn configure(
        &mut self,
        conn: &mut Connection,
        cfg: &CaptureConfig,
        limits: &RecorderLimits,
    ) -> Result<()>;

    async fn start(&mut self, conn: &mut Connection) -> Result<()>;

    /// Values captured so far.
    async fn captured(&mut self, conn: &mut Connection) -> Result<usize>;

    /// Start the bulk transfer of `count` values from `offset`.
    async fn begin_read(
        &mut self,
        conn: &mut Connection,
        offset: usize,
        count: usize,
    ) -> Result<BulkHeader>;

    async fn triggers(&mut self, _conn: &mut Connection) -> Result<Vec<String>> {
        Err(GcsError::Unsupported("recorder cannot list its triggers".into()))
    }

    /// Rows of the option types the triggers accept.
    async fn trigger_options(&mut self, _conn: &mut Connection) -> Result<Vec<IndexMap<String, String>>> {
        Err(GcsError::Unsupported("recorder cannot list its trigger options".into()))
    }
}

async fn spv_number(conn: &mut Connection, addr: &ParameterAddress) -> Result<f64> {
    let answer = conn.read(&spv_query(addr)?).await?;
    let parsed = parse_spv_answer(&answer, None)?;
    let (cu, fu, pid) = match (&addr.container, &addr.function, &addr.param) {
        (Some(c), Some(f), Some(p)) => (c, f, p),
        _ => return Err(GcsError::Usage(format!("incomplete address {addr}"))),
    };
    parsed
        .get(&addr.memory)
        .and_then(|m| m.get(cu))
        .and_then(|c| c.get(fu))
        .and_then(|f| f.get(pid))
        .and_then(Value::as_f64)
        .ok_or_else(|| GcsError::protocol(format!("no numeric value for {addr}"), answer))
}

fn to_rate(v: &Value, answer: &str) -> Result<u32> {
    v.as_i64()
        .and_then(|n| u32::try_from(n).ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| GcsError::protocol("record rate is not a positive count", answer))
}

fn to_count(v: f64, what: &str) -> Result<usize> {
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(v as usize)
    } else {
        Err(GcsError::protocol(format!("{what} is not a count"), v.to_string()))
    }
}

/// GCS 3.0 recorder driven with `REC`/`REC?`.
#[derive(Debug, Clone)]
pub struct Gcs30Recorder {
    id: String,
}

impl Gcs30Recorder {
    pub fn new(id: &str) -> Result<Self> {
        if !id.to_ascii_uppercase().starts_with(REC_PREFIX) {
            return Err(GcsError::Validation(format!(
                "recorder id {id:?} must start with {REC_PREFIX}"
            )));
        }
        Ok(Self { id: id.to_string() })
    }

    async fn query_value(&self, conn: &mut Connection, what: &str, ty: ValueType) -> Result<Value> {
        let answer = conn.read(&format!("REC? {what} {}", self.id)).await?;
        let keys = [self.id.as_str()];
        decode1(&answer, Some(&keys[..]), &[ty])?
            .swap_remove(self.id.as_str())
            .and_then(|e| e.first().cloned())
            .ok_or_else(|| GcsError::protocol(format!("REC? {what} without value"), answer))
    }

    async fn properties(&self, conn: &mut Connection, block: &str) -> Result<Vec<IndexMap<String, String>>> {
        let answer = conn.read(&format!("USG? PROP {}", self.id)).await?;
        let blocks = parse_block(&answer)?;
        let found = find_block(&blocks, block)
            .ok_or_else(|| GcsError::protocol(format!("no {block:?} block"), answer.clone()))?;
        Ok(found.rows.iter().map(|r| r.fields.clone()).collect())
    }
}

#[async_trait]
impl Recorder for Gcs30Recorder {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_limits(&self, conn: &mut Connection) -> Result<RecorderLimits> {
        let servo_us = spv_number(conn, &ParameterAddress::full("RAM", "SYS_1", EMPTY, "0x107")?).await?;
        let traces = spv_number(conn, &ParameterAddress::full("RAM", &self.id, EMPTY, "0x104")?).await?;
        let values = spv_number(conn, &ParameterAddress::full("RAM", &self.id, EMPTY, "0x103")?).await?;
        Ok(RecorderLimits {
            servo_time: servo_us * 1e-6,
            max_traces: to_count(traces, "maximum number of traces")?,
            max_values: to_count(values, "maximum number of values")?,
        })
    }

    async fn state(&mut self, conn: &mut Connection) -> Result<RecorderState> {
        let v = self.query_value(conn, "STATE", ValueType::Str).await?;
        v.to_string().parse()
    }

    async fn stop(&mut self, conn: &mut Connection) -> Result<()> {
        conn.send(&format!("REC STOP {}", self.id)).await
    }

    async fn record_rate(&mut self, conn: &mut Connection) -> Result<u32> {
        let v = self.query_value(conn, "RATE", ValueType::Int).await?;
        to_rate(&v, &v.to_string())
    }

    async fn traces(&mut self, conn: &mut Connection) -> Result<BTreeMap<usize, TraceAddress>> {
        let answer = conn.read(&format!("REC? TRACE {}", self.id)).await?;
        let keys = [self.id.as_str()];
        let table = decode2(&answer, Some(&keys[..]), None, &[ValueType::Str])?;
        let mut out = BTreeMap::new();
        for (id, entry) in table.values().flat_map(|m| m.iter()) {
            let source: Vec<String> = entry.values().iter().map(ToString::to_string).collect();
            if source.iter().all(|s| s == EMPTY) {
                continue;
            }
            let id = id
                .parse::<usize>()
                .map_err(|_| GcsError::protocol("trace id is not a number", answer.clone()))?;
            out.insert(id, source.join(" ").parse()?);
        }
        Ok(out)
    }

    async fn configure(
        &mut self,
        conn: &mut Connection,
        cfg: &CaptureConfig,
        limits: &RecorderLimits,
    ) -> Result<()> {
        let fmt = conn.session().float_format;
        if let Some(rate) = cfg.record_rate {
            let cmd = CommandBuilder::new("REC RATE")
                .arg(self.id.as_str())
                .arg(rate)
                .build(fmt);
            conn.send(&cmd).await?;
        }
        for (id, trace) in cfg.trace_slots(limits.max_traces).unwrap_or_default() {
            let source = trace.map_or_else(|| format!("{EMPTY} {EMPTY} {EMPTY}"), ToString::to_string);
            let cmd = CommandBuilder::new("REC TRACE")
                .arg(self.id.as_str())
                .arg(id)
                .arg(source)
                .build(fmt);
            conn.send(&cmd).await?;
        }
        if let Some(trg) = &cfg.trigger {
            conn.send(&format!("REC TRG {} {trg}", self.id)).await?;
        }
        Ok(())
    }

    async fn start(&mut self, conn: &mut Connection) -> Result<()> {
        conn.send(&format!("REC START {}", self.id)).await
    }

    async fn captured(&mut self, conn: &mut Connection) -> Result<usize> {
        let v = self.query_value(conn, "NUM", ValueType::Int).await?;
        v.as_i64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| GcsError::protocol("REC? NUM is negative", v.to_string()))
    }

    async fn begin_read(
        &mut self,
        conn: &mut Connection,
        offset: usize,
        count: usize,
    ) -> Result<BulkHeader> {
        let query = format!("REC? DAT {} ASCII {offset} {count}", self.id);
        conn.begin_bulk_read(&query, count).await
    }

    async fn triggers(&mut self, conn: &mut Connection) -> Result<Vec<String>> {
        let rows = self.properties(conn, names::RECORDER_TRIGGER).await?;
        Ok(rows.into_iter().filter_map(|mut r| r.swap_remove(keys::NAME)).collect())
    }

    async fn trigger_options(&mut self, conn: &mut Connection) -> Result<Vec<IndexMap<String, String>>> {
        self.properties(conn, names::TRIGGER_OPTION_TYPES).await
    }
}

/// Servo update time parameter (seconds) of GCS2 controllers.
pub const GCS2_SERVO_TIME_PARAM: &str = "0x0E000200";
/// Points per recorder table of GCS2 controllers.
pub const GCS2_MAX_POINTS_PARAM: &str = "0x16000200";

/// GCS2 recorder tables (`RTR`, `DRC`, `DRT`, `DRL?`, `DRR?`).
///
/// A trace is `<source> <record option> -`. GCS2 recorders have no state
/// query; the state is derived from what was sent and `DRL?`.
#[derive(Debug, Clone, Default)]
pub struct Gcs2Recorder {
    armed: bool,
    tables: Vec<usize>,
}

impl Gcs2Recorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn param_number(conn: &mut Connection, pid: &str) -> Result<f64> {
        let answer = conn.read(&format!("SPA? 1 {pid}")).await?;
        decode2(&answer, None, None, &[ValueType::Float])?
            .values()
            .flat_map(|m| m.values())
            .find_map(Entry::as_f64)
            .ok_or_else(|| GcsError::protocol(format!("no value for {pid}"), answer))
    }
}

#[async_trait]
impl Recorder for Gcs2Recorder {
    fn id(&self) -> &str {
        "DRC"
    }

    async fn read_limits(&self, conn: &mut Connection) -> Result<RecorderLimits> {
        let servo_time = Self::param_number(conn, GCS2_SERVO_TIME_PARAM).await?;
        let tables = conn.read("TNR?").await?;
        let max_traces = decode_scalar(&tables, ValueType::Int)?
            .as_i64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| GcsError::protocol("TNR? is not a count", tables.clone()))?;
        let points = Self::param_number(conn, GCS2_MAX_POINTS_PARAM).await?;
        Ok(RecorderLimits {
            servo_time,
            max_traces,
            max_values: to_count(points, "recorder points")?,
        })
    }

    async fn state(&mut self, conn: &mut Connection) -> Result<RecorderState> {
        if !self.armed {
            return Ok(RecorderState::Config);
        }
        Ok(if self.captured(conn).await? == 0 {
            RecorderState::Waiting
        } else {
            RecorderState::Running
        })
    }

    async fn stop(&mut self, _conn: &mut Connection) -> Result<()> {
        // GCS2 tables have no stop command; the next DRT re-arms them
        self.armed = false;
        Ok(())
    }

    async fn record_rate(&mut self, conn: &mut Connection) -> Result<u32> {
        let answer = conn.read("RTR?").await?;
        to_rate(&decode_scalar(&answer, ValueType::Int)?, &answer)
    }

    async fn traces(&mut self, conn: &mut Connection) -> Result<BTreeMap<usize, TraceAddress>> {
        let answer = conn.read("DRC?").await?;
        let mut out = BTreeMap::new();
        for (id, entry) in decode1(&answer, None, &[ValueType::Str])? {
            let parts: Vec<String> = entry.values().iter().map(ToString::to_string).collect();
            let [source, option, ..] = parts.as_slice() else {
                return Err(GcsError::protocol("DRC? line needs source and option", answer.clone()));
            };
            if source == "0" {
                continue;
            }
            let id = id
                .parse::<usize>()
                .map_err(|_| GcsError::protocol("table id is not a number", answer.clone()))?;
            out.insert(id, TraceAddress::new(source, option, EMPTY)?);
        }
        Ok(out)
    }

    async fn configure(
        &mut self,
        conn: &mut Connection,
        cfg: &CaptureConfig,
        limits: &RecorderLimits,
    ) -> Result<()> {
        if let Some(rate) = cfg.record_rate {
            conn.send(&format!("RTR {rate}")).await?;
        }
        self.tables.clear();
        match cfg.trace_slots(limits.max_traces) {
            Some(slots) => {
                for (id, trace) in slots {
                    let (source, option) = match trace {
                        Some(t) => {
                            self.tables.push(id);
                            (t.container.as_str(), t.function.as_str())
                        }
                        None => ("0", "0"),
                    };
                    conn.send(&format!("DRC {id} {source} {option}")).await?;
                }
            }
            None => self.tables = self.traces(conn).await?.into_keys().collect(),
        }
        if let Some(trg) = &cfg.trigger {
            conn.send(&format!("DRT 0 {} {}", trg.name, trg.options[0])).await?;
        }
        Ok(())
    }

    async fn start(&mut self, _conn: &mut Connection) -> Result<()> {
        // recording is started by the DRT trigger, nothing to send here
        self.armed = true;
        Ok(())
    }

    async fn captured(&mut self, conn: &mut Connection) -> Result<usize> {
        if self.tables.is_empty() {
            return Ok(0);
        }
        let answer = conn.read(&format!("DRL? {}", join_ids(&self.tables))).await?;
        let counts = decode1(&answer, None, &[ValueType::Int])?;
        counts
            .values()
            .map(|e| {
                e.as_i64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| GcsError::protocol("bad DRL? count", answer.clone()))
            })
            .try_fold(usize::MAX, |min, n| n.map(|n| min.min(n)))
            .map(|n| if n == usize::MAX { 0 } else { n })
    }

    async fn begin_read(
        &mut self,
        conn: &mut Connection,
        offset: usize,
        count: usize,
    ) -> Result<BulkHeader> {
        let query = format!("DRR? {offset} {count} {}", join_ids(&self.tables));
        conn.begin_bulk_read(query.trim_end(), count).await
    }
}

fn join_ids(ids: &[usize]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
}

/// A recorder bound to a connection, with its limits and configuration.
#[derive(Debug)]
pub struct DataRecorder<'a> {
    conn: &'a mut Connection,
    inner: Box<dyn Recorder>,
    limits: RecorderLimits,
    config: CaptureConfig,
    /// Rate read from the device while `config.record_rate` is unset.
    device_rate: Option<u32>,
}

impl<'a> DataRecorder<'a> {
    /// Read the device limits and wrap `inner`.
    pub async fn open(conn: &'a mut Connection, inner: Box<dyn Recorder>) -> Result<Self> {
        let limits = inner.read_limits(conn).await?;
        tracing::debug!(recorder = inner.id(), ?limits, "recorder opened");
        Ok(Self {
            conn,
            inner,
            limits,
            config: CaptureConfig::default(),
            device_rate: None,
        })
    }

    #[must_use]
    pub const fn limits(&self) -> &RecorderLimits {
        &self.limits
    }

    #[must_use]
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Replace the configuration; rejected configurations leave the
    /// current one untouched.
    pub fn set_config(&mut self, config: CaptureConfig) -> Result<()> {
        config.validate(&self.limits)?;
        self.config = config;
        Ok(())
    }

    fn update(&mut self, f: impl FnOnce(&mut CaptureConfig)) -> Result<()> {
        let mut next = self.config.clone();
        f(&mut next);
        self.set_config(next)
    }

    pub fn set_traces<I>(&mut self, traces: I) -> Result<()>
    where
        I: IntoIterator<Item = TraceAddress>,
    {
        let traces: Vec<TraceAddress> = traces.into_iter().collect();
        self.update(|c| *c = c.clone().with_traces(traces))
    }

    pub fn set_trace(&mut self, id: usize, trace: TraceAddress) -> Result<()> {
        self.update(|c| {
            c.traces.get_or_insert_with(BTreeMap::new).insert(id, trace);
        })
    }

    /// Forget the configured traces; the device table is kept on `arm()`.
    pub fn reset_traces(&mut self) {
        self.config.traces = None;
    }

    pub fn set_trigger(&mut self, trigger: Trigger) -> Result<()> {
        self.update(|c| c.trigger = Some(trigger))
    }

    pub fn set_record_rate(&mut self, rate: u32) -> Result<()> {
        self.update(|c| c.record_rate = Some(rate))
    }

    /// Forget the configured rate; the device rate is kept on `arm()`.
    pub fn reset_record_rate(&mut self) {
        self.config.record_rate = None;
        self.device_rate = None;
    }

    /// Configured rate, or the device rate when none was set.
    pub async fn record_rate(&mut self) -> Result<u32> {
        if let Some(rate) = self.config.record_rate {
            return Ok(rate);
        }
        if let Some(rate) = self.device_rate {
            return Ok(rate);
        }
        let rate = self.inner.record_rate(self.conn).await?;
        self.device_rate = Some(rate);
        Ok(rate)
    }

    /// Configured traces, or the device table when none were set.
    pub async fn traces(&mut self) -> Result<BTreeMap<usize, TraceAddress>> {
        match &self.config.traces {
            Some(traces) => Ok(traces.clone()),
            None => self.inner.traces(self.conn).await,
        }
    }

    pub fn set_number_of_values(&mut self, n: usize) -> Result<()> {
        self.update(|c| c.number_of_values = n)
    }

    pub fn set_offset(&mut self, offset: usize) -> Result<()> {
        self.update(|c| c.offset = offset)
    }

    pub async fn state(&mut self) -> Result<RecorderState> {
        self.inner.state(self.conn).await
    }

    /// Back to CONFIG.
    pub async fn stop(&mut self) -> Result<()> {
        self.inner.stop(self.conn).await?;
        tracing::debug!(recorder = self.inner.id(), "recorder stopped");
        Ok(())
    }

    /// Configure the device and start waiting for the trigger.
    pub async fn arm(&mut self) -> Result<()> {
        let state = self.inner.state(self.conn).await?;
        if state != RecorderState::Config {
            tracing::debug!(recorder = self.inner.id(), state = state.as_str(), "stopping before arm");
            self.inner.stop(self.conn).await?;
        }
        self.inner.configure(self.conn, &self.config, &self.limits).await?;
        self.inner.start(self.conn).await?;
        tracing::info!(
            recorder = self.inner.id(),
            traces = ?self.config.traces.as_ref().map(BTreeMap::len),
            rate = ?self.config.record_rate,
            "recorder armed"
        );
        Ok(())
    }

    /// Wait until the configured number of values was captured.
    pub async fn wait(&mut self, timeout: Duration) -> Result<()> {
        let wanted = self.config.values_to_read(&self.limits);
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.inner.captured(self.conn).await?;
            if n >= wanted {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GcsError::WaitTimeout(format!(
                    "recorder {} captured {n} of {wanted} values within {timeout:?}",
                    self.inner.id()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for the capture and fetch all values.
    pub async fn read(&mut self, timeout: Duration) -> Result<Capture> {
        let (header, _) = self.read_stream(timeout).await?;
        self.conn.wait_transfer(POLL_INTERVAL).await?;
        let data = self.conn.fetch_data().await?;
        Ok(Capture { header, data })
    }

    /// Wait for the capture and start the transfer; rows can be drained
    /// from the returned buffer while they arrive.
    pub async fn read_stream(&mut self, timeout: Duration) -> Result<(BulkHeader, Arc<BulkBuffer>)> {
        self.wait(timeout).await?;
        let count = self.config.values_to_read(&self.limits);
        let header = self
            .inner
            .begin_read(self.conn, self.config.offset, count)
            .await?;
        let buffer = self
            .conn
            .bulk_buffer()
            .ok_or_else(|| GcsError::Usage("transfer did not start".into()))?;
        Ok((header, buffer))
    }

    /// Sample times in seconds: `record_rate * servo_time * i`. An unset
    /// rate is read from the device.
    pub async fn timescale(&mut self) -> Result<Vec<f64>> {
        let step = f64::from(self.record_rate().await?) * self.limits.servo_time;
        Ok((0..self.config.values_to_read(&self.limits))
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let i = i as f64;
                step * i
            })
            .collect())
    }

    pub async fn triggers(&mut self) -> Result<Vec<String>> {
        self.inner.triggers(self.conn).await
    }

    pub async fn trigger_options(&mut self) -> Result<Vec<IndexMap<String, String>>> {
        self.inner.trigger_options(self.conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedGateway;

    const LIMITS: RecorderLimits = RecorderLimits {
        servo_time: 0.0001,
        max_traces: 4,
        max_values: 1000,
    };

    fn trace(s: &str) -> TraceAddress {
        s.parse().expect("trace")
    }

    #[test]
    fn trigger_forms() {
        let t: Trigger = "POS AXIS_1 0.5".parse().expect("trigger");
        assert_eq!(t.to_string(), "POS AXIS_1 0.5");
        assert_eq!(Trigger::from_parts(&["IMM"]).expect("imm").to_string(), "IMM 0 0");
        assert!("A B C D".parse::<Trigger>().is_err());
        assert!("".parse::<Trigger>().is_err());
    }

    #[test]
    fn config_validation_before_io() {
        let ok = CaptureConfig::default()
            .with_traces([trace("AXIS_1 - 0x102"), trace("AXIS_1 - 0x103")])
            .with_number_of_values(500);
        assert!(ok.validate(&LIMITS).is_ok());

        let too_many = CaptureConfig::default().with_traces((0..5).map(|_| trace("AXIS_1 - 0x102")));
        assert!(matches!(too_many.validate(&LIMITS), Err(GcsError::Validation(_))));

        let bad_offset = CaptureConfig::default().with_offset(0);
        assert!(bad_offset.validate(&LIMITS).is_err());
        let bad_offset = CaptureConfig::default().with_offset(1001);
        assert!(bad_offset.validate(&LIMITS).is_err());
        let bad_count = CaptureConfig::default().with_number_of_values(1001);
        assert!(bad_count.validate(&LIMITS).is_err());
        let bad_rate = CaptureConfig::default().with_record_rate(0);
        assert!(bad_rate.validate(&LIMITS).is_err());

        let bad_id = CaptureConfig {
            traces: Some(BTreeMap::from([(5, trace("AXIS_1 - 0x102"))])),
            ..CaptureConfig::default()
        };
        assert!(bad_id.validate(&LIMITS).is_err());

        assert!(CaptureConfig::default().validate(&LIMITS).is_ok(), "unset rate and traces");
    }

    #[test]
    fn slots_fill_unused_ids() {
        let cfg = CaptureConfig::default().with_traces([trace("AXIS_1 - 0x102")]);
        let slots = cfg.trace_slots(3).expect("traces set");
        assert_eq!(slots.len(), 3);
        assert!(slots[0].1.is_some());
        assert!(slots[1].1.is_none() && slots[2].1.is_none());
        assert!(CaptureConfig::default().trace_slots(3).is_none());
    }

    #[test]
    fn recorder_id_prefix() {
        assert!(Gcs30Recorder::new("REC_1").is_ok());
        assert!(matches!(Gcs30Recorder::new("DRC_1"), Err(GcsError::Validation(_))));
    }

    fn limits_script(gw: ScriptedGateway) -> ScriptedGateway {
        gw.expect_answer("SPV? RAM SYS_1 - 0x107", "RAM SYS_1 - 0x107=100\n")
            .expect_answer("SPV? RAM REC_1 - 0x104", "RAM REC_1 - 0x104=8\n")
            .expect_answer("SPV? RAM REC_1 - 0x103", "RAM REC_1 - 0x103=4096\n")
    }

    #[tokio::test]
    async fn arm_stops_then_configures() {
        let gw = limits_script(ScriptedGateway::new())
            .expect_answer("REC? STATE REC_1", "REC_1=RUN\n")
            .expect_send("REC STOP REC_1")
            .expect_send("REC RATE REC_1 2")
            .expect_send("REC TRACE REC_1 1 AXIS_1 - 0x102")
            .expect_send("REC TRACE REC_1 2 AXIS_1 - 0x103")
            .responder(|cmd| cmd.starts_with("REC TRACE REC_1 ").then(String::new))
            .expect_send("REC TRG REC_1 IMM 0 0")
            .expect_send("REC START REC_1");
        let log = gw.log();
        let mut conn = Connection::new(gw).with_errcheck(false);
        let rec = Box::new(Gcs30Recorder::new("REC_1").expect("id"));
        let mut dr = DataRecorder::open(&mut conn, rec).await.expect("open");
        assert_eq!(dr.limits().max_traces, 8);
        assert!((dr.limits().servo_time - 1e-4).abs() < 1e-12);

        dr.set_traces([trace("AXIS_1 - 0x102"), trace("AXIS_1 - 0x103")]).expect("traces");
        dr.set_record_rate(2).expect("rate");
        dr.set_trigger(Trigger::new("IMM")).expect("trigger");
        dr.set_number_of_values(10).expect("count");
        dr.arm().await.expect("arm");

        let sent = log.sent();
        assert_eq!(
            sent.iter().filter(|s| s.starts_with("REC TRACE")).count(),
            8,
            "every trace slot is written"
        );
        assert!(sent.contains(&"REC TRACE REC_1 8 - - -\n".to_string()));
        assert_eq!(sent.last().map(String::as_str), Some("REC START REC_1\n"));

        let ts = dr.timescale().await.expect("timescale");
        assert_eq!(ts.len(), 10);
        assert!((ts[3] - 3.0 * 2.0 * 1e-4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn arm_keeps_device_rate_and_traces_when_unset() {
        let gw = limits_script(ScriptedGateway::new())
            .expect_answer("REC? STATE REC_1", "REC_1=CFG\n")
            .expect_send("REC TRG REC_1 IMM 0 0")
            .expect_send("REC START REC_1")
            .expect_answer("REC? RATE REC_1", "REC_1=5\n")
            .expect_answer(
                "REC? TRACE REC_1",
                "REC_1 1=AXIS_1 - 0x102 \nREC_1 2=- - - \nREC_1 3=AXIS_2 - 0x103\n",
            );
        let log = gw.log();
        let mut conn = Connection::new(gw).with_errcheck(false);
        let rec = Box::new(Gcs30Recorder::new("REC_1").expect("id"));
        let mut dr = DataRecorder::open(&mut conn, rec).await.expect("open");
        dr.set_trigger(Trigger::new("IMM")).expect("trigger");
        dr.set_number_of_values(4).expect("count");
        dr.arm().await.expect("arm");

        let sent = log.sent();
        assert!(!sent.iter().any(|s| s.starts_with("REC RATE")), "{sent:?}");
        assert!(!sent.iter().any(|s| s.starts_with("REC TRACE")), "{sent:?}");

        let ts = dr.timescale().await.expect("timescale");
        assert!((ts[1] - 5.0 * 1e-4).abs() < 1e-12);
        // cached, no second REC? RATE
        assert_eq!(dr.record_rate().await.expect("rate"), 5);

        let traces = dr.traces().await.expect("traces");
        assert_eq!(traces.keys().copied().collect::<Vec<_>>(), [1, 3]);
        assert_eq!(traces[&3], trace("AXIS_2 - 0x103"));
    }

    #[tokio::test]
    async fn configured_rate_wins_over_device() {
        let gw = limits_script(ScriptedGateway::new()).expect_answer("REC? RATE REC_1", "REC_1=5\n");
        let mut conn = Connection::new(gw).with_errcheck(false);
        let rec = Box::new(Gcs30Recorder::new("REC_1").expect("id"));
        let mut dr = DataRecorder::open(&mut conn, rec).await.expect("open");
        dr.set_record_rate(3).expect("rate");
        assert_eq!(dr.record_rate().await.expect("rate"), 3);
        dr.reset_record_rate();
        assert_eq!(dr.record_rate().await.expect("rate"), 5);
        assert_eq!(dr.config().record_rate, None);
    }

    #[tokio::test]
    async fn read_times_out_without_enough_values() {
        let gw = limits_script(ScriptedGateway::new())
            .responder(|cmd| (cmd == "REC? NUM REC_1").then(|| "REC_1=12\n".to_string()));
        let mut conn = Connection::new(gw).with_errcheck(false);
        let rec = Box::new(Gcs30Recorder::new("REC_1").expect("id"));
        let mut dr = DataRecorder::open(&mut conn, rec).await.expect("open");
        dr.set_number_of_values(1024).expect("count");
        let err = dr.read(Duration::from_millis(30)).await.expect_err("timeout");
        assert!(matches!(err, GcsError::WaitTimeout(_)));
    }

    #[tokio::test]
    async fn read_fetches_bulk_data() {
        let gw = limits_script(ScriptedGateway::new())
            .expect_answer("REC? NUM REC_1", "REC_1=1\n")
            .expect_answer("REC? NUM REC_1", "REC_1=3\n")
            .expect_chunks(
                "REC? DAT REC_1 ASCII 1 3",
                &["# REC_ID = REC_1 \n# DIM = 1 \n# NDATA = 3 \n# END_HEADER \n", "1.5 \n2.5 \n", "3.5\n"],
            );
        let mut conn = Connection::new(gw).with_errcheck(false);
        let rec = Box::new(Gcs30Recorder::new("REC_1").expect("id"));
        let mut dr = DataRecorder::open(&mut conn, rec).await.expect("open");
        dr.set_number_of_values(3).expect("count");
        let cap = dr.read(Duration::from_secs(1)).await.expect("read");
        assert_eq!(cap.data, vec![vec![1.5, 2.5, 3.5]]);
        assert_eq!(cap.header.get("REC_ID").and_then(Value::as_str), Some("REC_1"));
    }

    #[tokio::test]
    async fn trigger_names_from_properties() {
        let gw = limits_script(ScriptedGateway::new()).expect_answer(
            "USG? PROP REC_1",
            "#Recorder Trigger:\tName\tDescription \n\
             IMM\tImmediately \n\
             POS\tPosition threshold \n\
             #END\n",
        );
        let mut conn = Connection::new(gw).with_errcheck(false);
        let rec = Box::new(Gcs30Recorder::new("REC_1").expect("id"));
        let mut dr = DataRecorder::open(&mut conn, rec).await.expect("open");
        assert_eq!(dr.triggers().await.expect("triggers"), ["IMM", "POS"]);
    }

    #[tokio::test]
    async fn trigger_options_from_nested_properties() {
        let gw = limits_script(ScriptedGateway::new()).expect_answer(
            "USG? PROP REC_1",
            "#Unit Properties:\tName \n\
             REC_1 \n\
             #Recorder Trigger:\tName\tTriggerOption1\tTriggerOption2 \n\
             POS\tAXIS\tTHRESHOLD \n\
             #END \n\
             #Trigger Option Types:\tName\tDescription \n\
             AXIS\tAxis identifier \n\
             THRESHOLD\tPosition value \n\
             #END \n\
             #END\n",
        );
        let mut conn = Connection::new(gw).with_errcheck(false);
        let rec = Box::new(Gcs30Recorder::new("REC_1").expect("id"));
        let mut dr = DataRecorder::open(&mut conn, rec).await.expect("open");
        let options = dr.trigger_options().await.expect("options");
        assert_eq!(options.len(), 2);
        assert_eq!(options[1].get("Name").map(String::as_str), Some("THRESHOLD"));
        assert_eq!(options[0].get("Description").map(String::as_str), Some("Axis identifier"));
    }

    #[tokio::test]
    async fn gcs2_has_no_trigger_options() {
        let gw = ScriptedGateway::new()
            .expect_answer("SPA? 1 0x0E000200", "1 0xE000200=5e-05\n")
            .expect_answer("TNR?", "2\n")
            .expect_answer("SPA? 1 0x16000200", "1 0x16000200=8192\n");
        let mut conn = Connection::new(gw).with_errcheck(false);
        let mut dr = DataRecorder::open(&mut conn, Box::new(Gcs2Recorder::new()))
            .await
            .expect("open");
        assert!(matches!(dr.trigger_options().await, Err(GcsError::Unsupported(_))));
    }

    #[tokio::test]
    async fn gcs2_reads_tables_from_device_when_unset() {
        let gw = ScriptedGateway::new()
            .expect_answer("SPA? 1 0x0E000200", "1 0xE000200=5e-05\n")
            .expect_answer("TNR?", "2\n")
            .expect_answer("SPA? 1 0x16000200", "1 0x16000200=8192\n")
            .expect_answer("DRC?", "1=0 0 \n2=3 1\n")
            .expect_send("DRT 0 1 0")
            .expect_answer("DRL? 2", "2=0\n")
            .expect_answer("RTR?", "4\n");
        let log = gw.log();
        let mut conn = Connection::new(gw).with_errcheck(false);
        let mut dr = DataRecorder::open(&mut conn, Box::new(Gcs2Recorder::new()))
            .await
            .expect("open");
        dr.set_trigger(Trigger::new("1")).expect("trigger");
        dr.set_number_of_values(10).expect("count");
        dr.arm().await.expect("arm");
        assert!(!log.sent().iter().any(|s| s.starts_with("RTR ") || s.starts_with("DRC ")));
        assert_eq!(dr.state().await.expect("state"), RecorderState::Waiting);
        let ts = dr.timescale().await.expect("timescale");
        assert!((ts[2] - 2.0 * 4.0 * 5e-5).abs() < 1e-12);

        let before = log.sent().len();
        dr.stop().await.expect("stop");
        assert_eq!(log.sent().len(), before, "GCS2 stop is local");
        assert_eq!(dr.state().await.expect("state"), RecorderState::Config);
    }

    #[tokio::test]
    async fn gcs2_tables() {
        let gw = ScriptedGateway::new()
            .expect_answer("SPA? 1 0x0E000200", "1 0xE000200=5e-05\n")
            .expect_answer("TNR?", "2\n")
            .expect_answer("SPA? 1 0x16000200", "1 0x16000200=8192\n")
            .expect_send("RTR 10")
            .expect_send("DRC 1 1 2")
            .expect_send("DRC 2 0 0")
            .expect_send("DRT 0 1 0")
            .expect_answer("DRL? 1", "1=0\n")
            .expect_answer("DRL? 1", "1=4\n")
            .expect_chunks("DRR? 1 4 1", &["# DIM = 1 \n# END_HEADER \n", "1 \n2 \n3 \n4\n"]);
        let mut conn = Connection::new(gw).with_errcheck(false);
        let mut dr = DataRecorder::open(&mut conn, Box::new(Gcs2Recorder::new()))
            .await
            .expect("open");
        assert_eq!(dr.limits().max_traces, 2);
        dr.set_config(
            CaptureConfig::default()
                .with_traces([trace("1 2 -")])
                .with_trigger(Trigger::new("1"))
                .with_record_rate(10)
                .with_number_of_values(4),
        )
        .expect("config");
        assert_eq!(dr.state().await.expect("state"), RecorderState::Config);
        dr.arm().await.expect("arm");
        assert_eq!(dr.state().await.expect("state"), RecorderState::Waiting);
        let cap = dr.read(Duration::from_secs(1)).await.expect("read");
        assert_eq!(cap.data, vec![vec![1.0, 2.0, 3.0, 4.0]]);
    }
}
