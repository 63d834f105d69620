//! A simulated GCS controller served over TCP.
//!
//! The mock speaks either dialect and answers the commands the client core
//! needs: identification, syntax version, error query, status, capability
//! and parameter queries, the data recorder, stop and halt. Motion is
//! instantaneous unless a test pins an axis with [`MockController::set_on_target`].
//!
//! Every connection shares one controller state, so a test can reconnect
//! and observe what an earlier connection changed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// GCS2 `PI_CNTR_UNKNOWN_COMMAND`.
pub const GCS2_UNKNOWN_COMMAND: i32 = 2;
/// GCS2 `PI_CNTR_STOP`.
pub const GCS2_STOPPED: i32 = 10;
/// GCS 3.0 command class (3), `UNKNOWN_COMMAND` (3).
pub const GCS30_UNKNOWN_COMMAND: i32 = (3 << 14) | 3;
/// GCS 3.0 halt was commanded.
pub const GCS30_HALTED: i32 = 245_836;

const READY: char = '\u{b1}';
const BUSY: char = '\u{b0}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MockDialect {
    Gcs2,
    Gcs30,
}

/// What the simulated controller looks like. Loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub dialect: MockDialect,
    pub idn: String,
    /// `None` makes `CSV?` an unknown command.
    pub syntax_version: Option<String>,
    pub axes: Vec<String>,
    pub max_traces: usize,
    pub max_values: usize,
    pub servo_time_us: f64,
    /// Samples the recorder gains per progress query once armed.
    pub samples_per_poll: usize,
    /// Upper bound of captured samples; below `max_values` simulates a
    /// trigger that never completes the capture.
    pub capture_limit: Option<usize>,
}

impl Default for Profile {
    fn default() -> Self {
        Self::gcs30()
    }
}

impl Profile {
    #[must_use]
    pub fn gcs2() -> Self {
        Self {
            dialect: MockDialect::Gcs2,
            idn: "(c)2024 Physik Instrumente (PI) GmbH & Co. KG, E-727, 0000000001, 01.02.03"
                .to_string(),
            syntax_version: Some("2.0".to_string()),
            axes: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            max_traces: 8,
            max_values: 262_144,
            servo_time_us: 20.0,
            samples_per_poll: 64,
            capture_limit: None,
        }
    }

    #[must_use]
    pub fn gcs30() -> Self {
        Self {
            dialect: MockDialect::Gcs30,
            idn: "(c)2024 Physik Instrumente (PI) GmbH & Co. KG, C-4000.M1, 0000000002, 01.001.002.003"
                .to_string(),
            syntax_version: Some("3.0".to_string()),
            axes: vec!["AXIS_1".to_string(), "AXIS_2".to_string()],
            max_traces: 8,
            max_values: 32_768,
            servo_time_us: 50.0,
            samples_per_poll: 64,
            capture_limit: None,
        }
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("parse mock profile")
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read mock profile {}", path.display()))?;
        Self::from_toml_str(&s)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
struct AxisState {
    position: f64,
    on_target: bool,
    referenced: bool,
    moving: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RecorderSim {
    state: String,
    rate: u32,
    traces: BTreeMap<usize, String>,
    trigger: String,
    captured: usize,
}

impl Default for RecorderSim {
    fn default() -> Self {
        Self {
            state: "CFG".to_string(),
            rate: 1,
            traces: BTreeMap::new(),
            trigger: "IMM 0 0".to_string(),
            captured: 0,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct State {
    error: i32,
    level: String,
    axes: HashMap<String, AxisState>,
    params: BTreeMap<String, String>,
    recorders: BTreeMap<String, RecorderSim>,
    commands: usize,
}

/// Shared simulated controller; clones share the state.
#[derive(Clone)]
pub struct MockController {
    profile: Arc<Profile>,
    state: Arc<Mutex<State>>,
    resets: broadcast::Sender<()>,
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return "\n".to_string();
    }
    let mut out = lines.join(" \n");
    out.push('\n');
    out
}

fn hex_id(id: &str) -> String {
    let digits = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);
    u32::from_str_radix(digits, 16)
        .or_else(|_| id.parse::<u32>())
        .map_or_else(|_| id.to_string(), |v| format!("0x{v:x}"))
}

fn latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

impl MockController {
    #[must_use]
    pub fn new(profile: Profile) -> Self {
        let (resets, _) = broadcast::channel(4);
        let ctl = Self {
            profile: Arc::new(profile),
            state: Arc::new(Mutex::new(State::default())),
            resets,
        };
        ctl.reset_state();
        ctl
    }

    #[must_use]
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn reset_state(&self) {
        let p = &self.profile;
        let mut st = self.lock();
        st.error = 0;
        st.level = "NORMAL".to_string();
        st.axes = p
            .axes
            .iter()
            .map(|a| {
                (
                    a.clone(),
                    AxisState {
                        on_target: true,
                        ..AxisState::default()
                    },
                )
            })
            .collect();
        st.recorders.clear();
        st.params.clear();
        match p.dialect {
            MockDialect::Gcs2 => {
                st.params.insert("1 0xe000200".into(), format!("{}", p.servo_time_us * 1e-6));
                st.params.insert("1 0x16000200".into(), p.max_values.to_string());
                for a in &p.axes {
                    st.params.insert(format!("{a} 0x1"), "0.5".into());
                    st.params.insert(format!("{a} 0x7000000"), "VEL".into());
                }
            }
            MockDialect::Gcs30 => {
                st.params.insert("SYS_1 - 0x107".into(), p.servo_time_us.to_string());
                for i in 1..=2 {
                    st.params.insert(format!("REC_{i} - 0x103"), p.max_values.to_string());
                    st.params.insert(format!("REC_{i} - 0x104"), p.max_traces.to_string());
                }
                for a in &p.axes {
                    st.params.insert(format!("{a} - 0x102"), "0".into());
                    st.params.insert(format!("{a} CTRL 0x200"), "1.5".into());
                }
            }
        }
    }

    /// Controller state as JSON, for diagnostics and assertions.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&*self.lock()).unwrap_or(serde_json::Value::Null)
    }

    /// Pin an axis on or off target; `false` also leaves it moving.
    pub fn set_on_target(&self, axis: &str, on_target: bool) {
        if let Some(a) = self.lock().axes.get_mut(axis) {
            a.on_target = on_target;
            a.moving = !on_target;
        }
    }

    pub fn set_error(&self, code: i32) {
        self.lock().error = code;
    }

    /// Commands handled so far.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.lock().commands
    }

    /// Abort every open connection with a TCP reset.
    pub fn reset_connections(&self) {
        let _ = self.resets.send(());
    }

    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        self.run_listener_on(listener).await
    }

    pub async fn run_listener_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), dialect = ?self.profile.dialect, "mock controller listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "client connected");
            let ctl = self.clone();
            tokio::spawn(async move {
                if let Err(e) = ctl.serve(stream).await {
                    tracing::debug!(%peer, error = %e, "client closed");
                }
            });
        }
    }

    async fn serve(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut resets = self.resets.subscribe();
        let mut buf = [0u8; 4096];
        let mut line = String::new();
        loop {
            let read = tokio::select! {
                r = stream.read(&mut buf) => Some(r?),
                _ = resets.recv() => None,
            };
            let Some(n) = read else {
                // linger 0 turns the close into a reset
                socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
                tracing::debug!("connection reset on request");
                return Ok(());
            };
            if n == 0 {
                return Ok(());
            }
            for &b in &buf[..n] {
                let c = char::from(b);
                let reply = match c {
                    '\n' => Some(self.respond(&std::mem::take(&mut line))),
                    '\x05' | '\x07' | '\x08' | '\x18' if line.is_empty() => {
                        Some(self.respond(&c.to_string()))
                    }
                    _ => {
                        line.push(c);
                        None
                    }
                };
                if let Some(Some(answer)) = reply {
                    stream.write_all(&latin1(&answer)).await?;
                }
            }
        }
    }

    fn unknown(&self, st: &mut State) -> Option<String> {
        st.error = match self.profile.dialect {
            MockDialect::Gcs2 => GCS2_UNKNOWN_COMMAND,
            MockDialect::Gcs30 => GCS30_UNKNOWN_COMMAND,
        };
        None
    }

    /// Handle one command line; `None` when the command has no answer.
    pub fn respond(&self, line: &str) -> Option<String> {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let mut st = self.lock();
        st.commands += 1;
        let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();
        match verb {
            "*IDN?" => return Some(format!("{}\n", self.profile.idn)),
            "ERR?" => {
                let code = std::mem::take(&mut st.error);
                return Some(format!("{code}\n"));
            }
            "CSV?" => {
                return match &self.profile.syntax_version {
                    Some(v) => Some(format!("{v}\n")),
                    None => self.unknown(&mut st),
                }
            }
            "RBT" => {
                drop(st);
                self.reset_state();
                return None;
            }
            _ => {}
        }
        match self.profile.dialect {
            MockDialect::Gcs2 => self.gcs2(&mut st, verb, &args),
            MockDialect::Gcs30 => self.gcs30(&mut st, verb, &args),
        }
    }

    fn selected<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        if args.is_empty() {
            self.profile.axes.iter().map(String::as_str).collect()
        } else {
            args.to_vec()
        }
    }

    fn axis_flags(&self, st: &State, args: &[&str], flag: fn(&AxisState) -> bool) -> Option<String> {
        let lines: Option<Vec<String>> = self
            .selected(args)
            .into_iter()
            .map(|a| st.axes.get(a).map(|s| format!("{a}={}", u8::from(flag(s)))))
            .collect();
        lines.map(|l| join_lines(&l))
    }

    fn move_axes(st: &mut State, args: &[&str]) -> bool {
        for pair in args.chunks(2) {
            let [axis, value] = pair else { return false };
            let (Some(a), Ok(v)) = (st.axes.get_mut(*axis), value.parse::<f64>()) else {
                return false;
            };
            a.position = v;
            a.on_target = true;
            a.moving = false;
        }
        true
    }

    fn bulk_answer(header: &[(&str, String)], rows: &[Vec<f64>]) -> String {
        let mut lines: Vec<String> = header.iter().map(|(k, v)| format!("# {k} = {v}")).collect();
        lines.push("# END_HEADER".to_string());
        lines.extend(rows.iter().map(|r| {
            r.iter()
                .map(|v| format!("{v:.6}"))
                .collect::<Vec<_>>()
                .join(" ")
        }));
        join_lines(&lines)
    }

    fn advance(&self, rec: &mut RecorderSim) {
        if rec.state == "CFG" {
            return;
        }
        rec.state = "RUN".to_string();
        let limit = self
            .profile
            .capture_limit
            .unwrap_or(self.profile.max_values)
            .min(self.profile.max_values);
        rec.captured = (rec.captured + self.profile.samples_per_poll).min(limit);
    }

    fn recorder_rows(offset: usize, count: usize, traces: usize) -> Vec<Vec<f64>> {
        (0..count)
            .map(|i| {
                (0..traces.max(1))
                    .map(|t| {
                        #[allow(clippy::cast_precision_loss)]
                        let v = ((offset + i) * (t + 1)) as f64;
                        v
                    })
                    .collect()
            })
            .collect()
    }

    fn gcs2(&self, st: &mut State, verb: &str, args: &[&str]) -> Option<String> {
        match verb {
            "SAI?" => Some(join_lines(&self.profile.axes)),
            "HLP?" => {
                let mut lines = vec!["The following commands are valid:".to_string()];
                lines.extend(
                    [
                        "#5", "#7", "#8", "#24", "*IDN?", "CCL", "CSV?", "DRC", "DRC?", "DRL?",
                        "DRR?", "DRT", "ERR?", "FRF", "FRF?", "HLP?", "HLT", "HPA?", "MOV", "ONT?",
                        "POS?", "RBT", "RTR", "RTR?", "SAI?", "SEP?", "SPA", "SPA?", "TNR?",
                    ]
                    .iter()
                    .map(|v| format!("{v} - help")),
                );
                Some(join_lines(&lines))
            }
            "\x05" => {
                let mask = self
                    .profile
                    .axes
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| st.axes.get(*a).is_some_and(|s| s.moving))
                    .fold(0u64, |m, (i, _)| m | (1 << i));
                Some(format!("{mask:x}\n"))
            }
            "\x07" => {
                let busy = st.axes.values().any(|a| a.moving);
                Some(format!("{}\n", if busy { BUSY } else { READY }))
            }
            "\x08" => Some("0\n".to_string()),
            "\x18" | "HLT" => {
                let sel = if verb == "HLT" { self.selected(args) } else { self.selected(&[]) };
                for a in sel {
                    if let Some(s) = st.axes.get_mut(a) {
                        s.moving = false;
                    }
                }
                st.error = GCS2_STOPPED;
                None
            }
            "MOV" => {
                if !Self::move_axes(st, args) {
                    st.error = 15;
                }
                None
            }
            "POS?" => {
                let lines: Option<Vec<String>> = self
                    .selected(args)
                    .into_iter()
                    .map(|a| st.axes.get(a).map(|s| format!("{a}={}", s.position)))
                    .collect();
                lines.map(|l| join_lines(&l))
            }
            "ONT?" => self.axis_flags(st, args, |s| s.on_target),
            "FRF?" => self.axis_flags(st, args, |s| s.referenced),
            "FRF" => {
                for a in self.selected(args) {
                    if let Some(s) = st.axes.get_mut(a) {
                        s.referenced = true;
                    }
                }
                None
            }
            "HPA?" => Some(join_lines(&[
                "0x1=\t0\t1\tFLOAT\tservo\tP term".to_string(),
                "0x7000000=\t0\t1\tCHAR\tgeneral\tAxis name".to_string(),
                "0xE000200=\t0\t1\tFLOAT\tgeneral\tServo update time".to_string(),
                "0x16000200=\t0\t1\tINT\trecorder\tPoints per table".to_string(),
            ])),
            "SPA?" | "SEP?" => {
                let item = args.first().copied();
                let pid = args.get(1).map(|p| hex_id(p));
                let lines: Vec<String> = st
                    .params
                    .iter()
                    .filter_map(|(k, v)| {
                        let (i, p) = k.split_once(' ')?;
                        let keep = item.is_none_or(|x| x == i) && pid.as_deref().is_none_or(|x| x == p);
                        keep.then(|| format!("{i} {p}={v}"))
                    })
                    .collect();
                if lines.is_empty() {
                    st.error = 56;
                    return None;
                }
                Some(join_lines(&lines))
            }
            "SPA" => {
                for t in args.chunks(3) {
                    if let [item, pid, value] = t {
                        st.params.insert(format!("{item} {}", hex_id(pid)), (*value).to_string());
                    } else {
                        st.error = 15;
                    }
                }
                None
            }
            "CCL" => {
                if let Some(l) = args.first() {
                    st.level = (*l).to_string();
                }
                None
            }
            "TNR?" => Some(format!("{}\n", self.profile.max_traces)),
            "RTR?" => Some(format!("{}\n", st.recorders.get("DRC").map_or(1, |r| r.rate))),
            "DRC?" => {
                let rec = st.recorders.get("DRC").cloned().unwrap_or_default();
                let lines: Vec<String> = (1..=self.profile.max_traces)
                    .map(|i| format!("{i}={}", rec.traces.get(&i).map_or("0 0", String::as_str)))
                    .collect();
                Some(join_lines(&lines))
            }
            "RTR" => {
                let rec = st.recorders.entry("DRC".into()).or_default();
                rec.rate = args.first().and_then(|r| r.parse().ok()).unwrap_or(1);
                None
            }
            "DRC" => {
                let rec = st.recorders.entry("DRC".into()).or_default();
                match args {
                    [id, "0", ..] => {
                        if let Ok(i) = id.parse() {
                            rec.traces.remove(&i);
                        }
                    }
                    [id, src, opt] => {
                        if let Ok(i) = id.parse() {
                            rec.traces.insert(i, format!("{src} {opt}"));
                        }
                    }
                    _ => st.error = 15,
                }
                None
            }
            "DRT" => {
                let rec = st.recorders.entry("DRC".into()).or_default();
                rec.trigger = args.get(1..).map(|a| a.join(" ")).unwrap_or_default();
                rec.state = "WAIT".into();
                rec.captured = 0;
                None
            }
            "DRL?" => {
                let mut rec = st.recorders.remove("DRC").unwrap_or_default();
                self.advance(&mut rec);
                let lines: Vec<String> = args.iter().map(|id| format!("{id}={}", rec.captured)).collect();
                st.recorders.insert("DRC".into(), rec);
                Some(join_lines(&lines))
            }
            "DRR?" => {
                let offset: usize = args.first().and_then(|a| a.parse().ok()).unwrap_or(1);
                let count: usize = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(0);
                let tables = args.len().saturating_sub(2);
                let rate = st.recorders.get("DRC").map_or(1, |r| r.rate);
                let header = [
                    ("VERSION", "1".to_string()),
                    ("TYPE", "1".to_string()),
                    ("SEPARATOR", "32".to_string()),
                    ("DIM", tables.max(1).to_string()),
                    ("SAMPLE_TIME", format!("{}", f64::from(rate) * self.profile.servo_time_us * 1e-6)),
                    ("NDATA", count.to_string()),
                ];
                Some(Self::bulk_answer(&header, &Self::recorder_rows(offset, count, tables)))
            }
            _ => self.unknown(st),
        }
    }

    fn block_lines(name: &str, columns: &[&str], rows: &[Vec<String>]) -> Vec<String> {
        let mut lines = vec![format!("#{name}:\t{}", columns.join("\t"))];
        lines.extend(rows.iter().map(|r| r.join("\t")));
        lines.push("#END".to_string());
        lines
    }

    fn block(name: &str, columns: &[&str], rows: &[Vec<String>]) -> String {
        join_lines(&Self::block_lines(name, columns, rows))
    }

    fn string_rows(rows: &[[&str; 2]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|s| (*s).to_string()).collect())
            .collect()
    }

    fn status_word(s: &AxisState) -> u32 {
        // operation enabled, closed loop
        let mut w: u32 = 0x0004 | (1 << 16);
        if s.on_target {
            w |= 1 << 17;
        }
        if s.moving {
            w |= 1 << 18;
        }
        if s.referenced {
            w |= 1 << 19;
        }
        w
    }

    fn gcs30_usg(&self, args: &[&str]) -> Option<String> {
        match args {
            ["CMD"] => {
                let verbs = [
                    "*IDN?", "CSV?", "ERR?", "FRF", "HLT", "IPR?", "MOV", "POS?", "RBT", "REC",
                    "REC START", "REC STOP", "REC RATE", "REC TRACE", "REC TRG", "REC?", "SPV",
                    "SPV?", "STP", "STV?", "UCL", "UCL?", "USG?",
                ];
                let rows: Vec<Vec<String>> = verbs
                    .iter()
                    .map(|v| vec![(*v).to_string(), "-".to_string()])
                    .collect();
                Some(Self::block("Command Overview", &["Command", "Description"], &rows))
            }
            ["PAM"] => {
                let mut rows = vec![
                    vec!["SYS_1", "-", "0x107", "FLOAT32"],
                    vec!["REC_1", "-", "0x103", "UINT32"],
                    vec!["REC_1", "-", "0x104", "UINT32"],
                ];
                for a in &self.profile.axes {
                    rows.push(vec![a.as_str(), "-", "0x102", "INT32"]);
                    rows.push(vec![a.as_str(), "CTRL", "0x200", "FLOAT64"]);
                }
                let rows: Vec<Vec<String>> = rows
                    .into_iter()
                    .map(|r| r.into_iter().map(str::to_string).collect())
                    .collect();
                Some(Self::block(
                    "Parameter Overview",
                    &["Container Unit", "Function Unit", "Parameter ID", "Data Type"],
                    &rows,
                ))
            }
            ["PROP", unit] if unit.starts_with("REC_") => {
                let triggers = Self::string_rows(&[["IMM", "Immediately"], ["POS", "Position threshold"]]);
                let options = Self::string_rows(&[["AXIS", "Axis identifier"], ["THRESHOLD", "Position value"]]);
                let mut lines = Self::block_lines("Recorder Trigger", &["Name", "Description"], &triggers);
                lines.extend(Self::block_lines("Trigger Option Types", &["Name", "Description"], &options));
                Some(join_lines(&lines))
            }
            ["PROP", _] => {
                let rows = Self::string_rows(&[["NORMAL", "Default"], ["ADVANCED", "Service"]]);
                Some(Self::block("User Command Level", &["Name", "Description"], &rows))
            }
            _ => None,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn gcs30(&self, st: &mut State, verb: &str, args: &[&str]) -> Option<String> {
        match verb {
            "USG?" => self.gcs30_usg(args).or_else(|| self.unknown(st)),
            "IPR?" => Some("SYS_1\n".to_string()),
            "UCL?" => Some(format!("{}\n", st.level)),
            "UCL" => {
                if let Some(l) = args.first() {
                    st.level = (*l).to_string();
                }
                None
            }
            "STV?" => {
                let units: Vec<String> = if args.is_empty() {
                    let mut u = self.profile.axes.clone();
                    u.push("SYS_1".to_string());
                    u
                } else {
                    args.iter().map(|a| (*a).to_string()).collect()
                };
                let lines: Vec<String> = units
                    .iter()
                    .map(|u| {
                        let w = st.axes.get(u).map_or(0, Self::status_word);
                        format!("{u}=0x{w:08x}")
                    })
                    .collect();
                Some(join_lines(&lines))
            }
            "STP" => {
                for a in st.axes.values_mut() {
                    a.moving = false;
                }
                None
            }
            "HLT" => {
                for a in self.selected(args) {
                    if let Some(s) = st.axes.get_mut(a) {
                        s.moving = false;
                    }
                }
                st.error = GCS30_HALTED;
                None
            }
            "MOV" => {
                if !Self::move_axes(st, args) {
                    st.error = GCS30_UNKNOWN_COMMAND;
                }
                None
            }
            "POS?" => {
                let lines: Option<Vec<String>> = self
                    .selected(args)
                    .into_iter()
                    .map(|a| st.axes.get(a).map(|s| format!("{a}={}", s.position)))
                    .collect();
                lines.map(|l| join_lines(&l))
            }
            "FRF" => {
                for a in self.selected(args) {
                    if let Some(s) = st.axes.get_mut(a) {
                        s.referenced = true;
                    }
                }
                None
            }
            "SPV?" => {
                let mem = args.first().copied().unwrap_or("RAM");
                let want: Vec<String> = args
                    .iter()
                    .skip(1)
                    .enumerate()
                    .map(|(i, a)| if i == 2 { hex_id(a) } else { (*a).to_string() })
                    .collect();
                let lines: Vec<String> = st
                    .params
                    .iter()
                    .filter(|(k, _)| {
                        k.split_whitespace()
                            .zip(want.iter())
                            .all(|(have, want)| have == want)
                    })
                    .map(|(k, v)| format!("{mem} {k}={v}"))
                    .collect();
                if lines.is_empty() {
                    st.error = GCS30_UNKNOWN_COMMAND;
                    return None;
                }
                Some(join_lines(&lines))
            }
            "SPV" => {
                for t in args.get(1..).unwrap_or_default().chunks(4) {
                    if let [cu, fu, pid, value] = t {
                        st.params.insert(format!("{cu} {fu} {}", hex_id(pid)), (*value).to_string());
                    }
                }
                None
            }
            "REC?" => {
                let (what, id) = match args {
                    [what, id, ..] => (*what, *id),
                    _ => return self.unknown(st),
                };
                let mut rec = st.recorders.remove(id).unwrap_or_default();
                let answer = match what {
                    "STATE" => Some(format!("{id}={}\n", rec.state)),
                    "RATE" => Some(format!("{id}={}\n", rec.rate)),
                    "TRACE" => {
                        let lines: Vec<String> = (1..=self.profile.max_traces)
                            .map(|i| format!("{id} {i}={}", rec.traces.get(&i).map_or("- - -", String::as_str)))
                            .collect();
                        Some(join_lines(&lines))
                    }
                    "NUM" => {
                        self.advance(&mut rec);
                        Some(format!("{id}={}\n", rec.captured))
                    }
                    "DAT" => {
                        let offset: usize = args.get(3).and_then(|a| a.parse().ok()).unwrap_or(1);
                        let count: usize = args.get(4).and_then(|a| a.parse().ok()).unwrap_or(rec.captured);
                        let header = [
                            ("VERSION", "1".to_string()),
                            ("TYPE", "1".to_string()),
                            ("SEPARATOR", "32".to_string()),
                            ("DIM", rec.traces.len().max(1).to_string()),
                            ("NDATA", count.to_string()),
                            ("REC_ID", id.to_string()),
                        ];
                        Some(Self::bulk_answer(
                            &header,
                            &Self::recorder_rows(offset, count, rec.traces.len()),
                        ))
                    }
                    "TRG" => Some(format!("{id}={}\n", rec.trigger)),
                    _ => None,
                };
                st.recorders.insert(id.to_string(), rec);
                answer.or_else(|| self.unknown(st))
            }
            "REC" => {
                let (what, id) = match args {
                    [what, id, ..] => (*what, *id),
                    _ => return self.unknown(st),
                };
                let rec = st.recorders.entry(id.to_string()).or_default();
                match (what, &args[2..]) {
                    ("STOP", []) => rec.state = "CFG".into(),
                    ("START", []) => {
                        rec.state = "WAIT".into();
                        rec.captured = 0;
                    }
                    ("RATE", [r]) => rec.rate = r.parse().unwrap_or(1),
                    ("TRACE", [i, "-", "-", "-"]) => {
                        if let Ok(i) = i.parse() {
                            rec.traces.remove(&i);
                        }
                    }
                    ("TRACE", [i, cu, fu, pid]) => {
                        if let Ok(i) = i.parse() {
                            rec.traces.insert(i, format!("{cu} {fu} {pid}"));
                        }
                    }
                    ("TRG", trg) if !trg.is_empty() => rec.trigger = trg.join(" "),
                    _ => return self.unknown(st),
                }
                None
            }
            _ => self.unknown(st),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_query_clears() {
        let m = MockController::new(Profile::gcs2());
        assert_eq!(m.respond("FOO"), None);
        assert_eq!(m.respond("ERR?").as_deref(), Some("2\n"));
        assert_eq!(m.respond("ERR?").as_deref(), Some("0\n"));
    }

    #[test]
    fn multi_line_answers_continue_with_space() {
        let m = MockController::new(Profile::gcs2());
        assert_eq!(m.respond("ONT?").as_deref(), Some("1=1 \n2=1 \n3=1\n"));
        m.set_on_target("2", false);
        assert_eq!(m.respond("\x05").as_deref(), Some("2\n"));
        assert_eq!(m.respond("\x07").as_deref(), Some("\u{b0}\n"));
    }

    #[test]
    fn gcs30_status_words() {
        let m = MockController::new(Profile::gcs30());
        m.respond("FRF AXIS_1");
        let stv = m.respond("STV? AXIS_1").expect("stv");
        assert_eq!(stv, "AXIS_1=0x000b0004\n");
        assert_eq!(m.respond("HLT AXIS_1"), None);
        assert_eq!(m.respond("ERR?").as_deref(), Some("245836\n"));
    }

    #[test]
    fn recorder_progress() {
        let m = MockController::new(Profile {
            samples_per_poll: 10,
            capture_limit: Some(15),
            ..Profile::gcs30()
        });
        m.respond("REC TRACE REC_1 1 AXIS_1 - 0x102");
        m.respond("REC START REC_1");
        assert_eq!(m.respond("REC? NUM REC_1").as_deref(), Some("REC_1=10\n"));
        assert_eq!(m.respond("REC? NUM REC_1").as_deref(), Some("REC_1=15\n"));
        assert_eq!(m.respond("REC? STATE REC_1").as_deref(), Some("REC_1=RUN\n"));
        let snap = m.snapshot();
        assert_eq!(snap["recorders"]["REC_1"]["captured"], 15);
    }

    #[test]
    fn profile_from_toml() {
        let p = Profile::from_toml_str("dialect = \"gcs2\"\naxes = [\"X\", \"Y\"]\n").expect("toml");
        assert_eq!(p.dialect, MockDialect::Gcs2);
        assert_eq!(p.axes, ["X", "Y"]);
        assert_eq!(p.max_traces, Profile::gcs30().max_traces);
    }
}
