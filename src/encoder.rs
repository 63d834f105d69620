//! Command string builder.
//!
//! A command is a verb followed by argument groups. Groups are interleaved
//! column-wise: `MOV` with `["X","Y"]` and `[1.5, 2.25]` becomes
//! `MOV X 1.5 Y 2.25`. Shorter groups stop contributing once exhausted.

use std::fmt;

use crate::config::config as global_config;

/// One scalar command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Arg {
    #[must_use]
    pub fn render(&self, fmt: FloatFormat) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => fmt.render(*f),
            Self::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        }
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&String> for Arg {
    fn from(v: &String) -> Self {
        Self::Str(v.clone())
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

macro_rules! int_arg {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}
int_arg!(i8, i16, i32, i64, u8, u16, u32);

impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        i64::try_from(v).map_or_else(|_| Self::Str(v.to_string()), Self::Int)
    }
}

/// How floats are rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatFormat {
    /// `%.<digits>g`: significant digits, trailing zeros removed, exponent
    /// form for very small or very large values.
    General { digits: usize },
    /// `%.<decimals>f`
    Fixed { decimals: usize },
}

impl Default for FloatFormat {
    fn default() -> Self {
        Self::General {
            digits: global_config().float_digits,
        }
    }
}

impl FloatFormat {
    #[must_use]
    pub fn render(self, v: f64) -> String {
        match self {
            Self::General { digits } => format_general(v, digits.max(1)),
            Self::Fixed { decimals } => format!("{v:.decimals$}"),
        }
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn format_general(v: f64, digits: usize) -> String {
    if v.is_nan() {
        return "nan".into();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.into();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.into();
    }
    // Rust's exponent form rounds first, so the exponent already accounts
    // for carries like 9.9999 -> 1.0e1.
    let sci = format!("{:.*e}", digits - 1, v);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let digits_i = i32::try_from(digits).unwrap_or(i32::MAX);
    if exp < -4 || exp >= digits_i {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.unsigned_abs())
    } else {
        let decimals = usize::try_from(digits_i - 1 - exp).unwrap_or(0);
        trim_fraction(&format!("{v:.decimals$}")).to_string()
    }
}

/// An ordered sequence of scalars; a scalar is a group of one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgGroup(pub Vec<Arg>);

impl ArgGroup {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split a key→value mapping into a key group and a value group.
    pub fn pairs<K, V, I>(items: I) -> (Self, Self)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Arg>,
        V: Into<Arg>,
    {
        let (keys, values): (Vec<Arg>, Vec<Arg>) =
            items.into_iter().map(|(k, v)| (k.into(), v.into())).unzip();
        (Self(keys), Self(values))
    }
}

impl<T: Into<Arg>> From<Vec<T>> for ArgGroup {
    fn from(v: Vec<T>) -> Self {
        Self(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Arg> + Clone> From<&[T]> for ArgGroup {
    fn from(v: &[T]) -> Self {
        Self(v.iter().cloned().map(Into::into).collect())
    }
}

impl From<Arg> for ArgGroup {
    fn from(v: Arg) -> Self {
        Self(vec![v])
    }
}

impl From<&str> for ArgGroup {
    fn from(v: &str) -> Self {
        Self(vec![Arg::from(v)])
    }
}

/// Encode `verb` and `groups` into one command line (without line feed).
#[must_use]
pub fn encode(verb: &str, groups: &[ArgGroup], fmt: FloatFormat) -> String {
    let longest = groups.iter().map(ArgGroup::len).max().unwrap_or(0);
    let mut parts: Vec<String> = Vec::with_capacity(1 + longest * groups.len());
    parts.push(verb.to_string());
    for i in 0..longest {
        for g in groups {
            if let Some(a) = g.0.get(i) {
                parts.push(a.render(fmt));
            }
        }
    }
    parts.join(" ").trim_end().to_string()
}

/// Builds commands that mix interleaved groups with optional clauses.
///
/// ```
/// use gcs_client::encoder::{CommandBuilder, FloatFormat};
/// let cmd = CommandBuilder::new("REC? DAT")
///     .arg("REC_1")
///     .arg("ASCII")
///     .opt(None::<&str>)
///     .arg(1)
///     .arg(1024)
///     .build(FloatFormat::General { digits: 12 });
/// assert_eq!(cmd, "REC? DAT REC_1 ASCII 1 1024");
/// ```
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    verb: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone)]
enum Part {
    Groups(Vec<ArgGroup>),
    Labeled(String, Arg),
}

impl CommandBuilder {
    #[must_use]
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            parts: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(self, a: impl Into<Arg>) -> Self {
        self.groups(vec![ArgGroup::from(a.into())])
    }

    /// Append interleaved groups.
    #[must_use]
    pub fn groups(mut self, groups: Vec<ArgGroup>) -> Self {
        self.parts.push(Part::Groups(groups));
        self
    }

    /// Append `key value` pairs of a mapping.
    #[must_use]
    pub fn pairs<K, V, I>(self, items: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Arg>,
        V: Into<Arg>,
    {
        let (k, v) = ArgGroup::pairs(items);
        self.groups(vec![k, v])
    }

    /// Optional positional value, dropped entirely when `None`.
    #[must_use]
    pub fn opt<T: Into<Arg>>(mut self, value: Option<T>) -> Self {
        if let Some(v) = value {
            self.parts.push(Part::Groups(vec![ArgGroup::from(v.into())]));
        }
        self
    }

    /// Optional labeled clause such as `FORMAT ASCII`, dropped when `None`.
    #[must_use]
    pub fn clause<T: Into<Arg>>(mut self, label: &str, value: Option<T>) -> Self {
        if let Some(v) = value {
            self.parts.push(Part::Labeled(label.to_string(), v.into()));
        }
        self
    }

    #[must_use]
    pub fn build(&self, fmt: FloatFormat) -> String {
        let mut out = self.verb.clone();
        for p in &self.parts {
            let piece = match p {
                Part::Groups(g) => encode("", g, fmt),
                Part::Labeled(label, v) => format!("{label} {}", v.render(fmt)),
            };
            let piece = piece.trim();
            if !piece.is_empty() {
                out.push(' ');
                out.push_str(piece);
            }
        }
        out.trim_end().to_string()
    }
}

impl fmt::Display for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build(FloatFormat::default()))
    }
}
