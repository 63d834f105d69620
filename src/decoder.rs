//! Typed decoding of `key=value` answers.
//!
//! The caller states the key arity (one, two or three key tokens left of
//! the `=`) and the value conversions. Value types cycle when a line holds
//! more values than declared types.

use indexmap::IndexMap;

use crate::error::{GcsError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    /// Numeric view; ints widen, bools are 0/1.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Str(_) => None,
        }
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{}", u8::from(*b)),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Requested conversion for one value position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Float,
    Bool,
    Str,
    /// Hexadecimal integer with or without `0x` prefix.
    Hex,
    /// [`auto_convert`]
    Auto,
}

/// Value(s) found right of the `=`.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    One(Value),
    Many(Vec<Value>),
}

impl Entry {
    #[must_use]
    pub fn values(&self) -> &[Value] {
        match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(v) => v,
        }
    }

    #[must_use]
    pub fn first(&self) -> Option<&Value> {
        self.values().first()
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.first().and_then(Value::as_f64)
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.first().and_then(Value::as_i64)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.first().and_then(Value::as_bool)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.first().and_then(Value::as_str)
    }
}

pub type Flat = IndexMap<String, Entry>;
pub type TwoKey = IndexMap<String, Flat>;
pub type ThreeKey = IndexMap<String, TwoKey>;

pub(crate) fn parse_int(s: &str) -> Option<i64> {
    let (neg, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let magnitude = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        i64::from_str_radix(hex, 16).ok()?
    } else {
        if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        body.parse::<i64>().ok()?
    };
    Some(if neg { -magnitude } else { magnitude })
}

/// Heuristic conversion: integer, then float, then string.
///
/// - decimal integers may carry a sign and leading zeros (`007` is 7);
/// - `0x`/`0X` prefixed tokens are hexadecimal integers;
/// - a float needs at least one ASCII digit, so `nan`/`inf` stay strings;
/// - integers beyond `i64` fall through to float.
#[must_use]
pub fn auto_convert(token: &str) -> Value {
    let t = token.trim();
    if let Some(i) = parse_int(t) {
        return Value::Int(i);
    }
    if t.bytes().any(|b| b.is_ascii_digit()) {
        if let Ok(f) = t.parse::<f64>() {
            return Value::Float(f);
        }
    }
    Value::Str(t.to_string())
}

/// Convert one token, failing with a protocol error on malformed numbers.
pub fn convert(token: &str, ty: ValueType) -> Result<Value> {
    let t = token.trim();
    let bad = |what: &str| GcsError::protocol(format!("cannot convert {t:?} to {what}"), t);
    match ty {
        ValueType::Auto => Ok(auto_convert(t)),
        ValueType::Str => Ok(Value::Str(t.to_string())),
        ValueType::Int => parse_int(t).map(Value::Int).ok_or_else(|| bad("int")),
        ValueType::Hex => {
            let body = t
                .strip_prefix("0x")
                .or_else(|| t.strip_prefix("0X"))
                .unwrap_or(t);
            i64::from_str_radix(body, 16)
                .map(Value::Int)
                .map_err(|_| bad("hex"))
        }
        ValueType::Float => t.parse::<f64>().map(Value::Float).map_err(|_| bad("float")),
        ValueType::Bool => match t.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => parse_int(other)
                .map(|i| Value::Bool(i != 0))
                .ok_or_else(|| bad("bool")),
        },
    }
}

fn to_entry(values: &[&str], types: &[ValueType]) -> Result<Entry> {
    let mut out = Vec::with_capacity(values.len().max(1));
    if values.is_empty() {
        out.push(convert("", *types.first().unwrap_or(&ValueType::Auto))?);
    }
    for (i, v) in values.iter().enumerate() {
        let ty = if types.is_empty() {
            ValueType::Auto
        } else {
            types[i % types.len()]
        };
        out.push(convert(v, ty)?);
    }
    if out.len() == 1 {
        Ok(Entry::One(out.remove(0)))
    } else {
        Ok(Entry::Many(out))
    }
}

struct Line<'a> {
    keys: Vec<&'a str>,
    values: Vec<&'a str>,
}

fn split_lines(text: &str, arity: usize) -> Result<Vec<Line<'_>>> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (left, right) = line
            .split_once('=')
            .ok_or_else(|| GcsError::protocol("answer line without '='", raw))?;
        let keys: Vec<&str> = left.split_whitespace().collect();
        if keys.len() != arity {
            return Err(GcsError::protocol(
                format!("expected {arity} key(s) left of '=', found {}", keys.len()),
                raw,
            ));
        }
        out.push(Line {
            keys,
            values: right.split_whitespace().collect(),
        });
    }
    Ok(out)
}

/// Keep only `keys` (in that order) when given; every requested key must exist.
fn select<V: Clone>(
    map: IndexMap<String, V>,
    keys: Option<&[&str]>,
    raw: &str,
) -> Result<IndexMap<String, V>> {
    let Some(keys) = keys else {
        return Ok(map);
    };
    let mut out = IndexMap::with_capacity(keys.len());
    for k in keys {
        let v = map
            .get(*k)
            .ok_or_else(|| GcsError::protocol(format!("item {k:?} missing in answer"), raw))?;
        out.insert((*k).to_string(), v.clone());
    }
    Ok(out)
}

/// Decode `key=v1 v2 ...` lines.
pub fn decode1(text: &str, keys: Option<&[&str]>, types: &[ValueType]) -> Result<Flat> {
    let mut map = Flat::new();
    for line in split_lines(text, 1)? {
        map.insert(line.keys[0].to_string(), to_entry(&line.values, types)?);
    }
    select(map, keys, text)
}

/// Decode `key1 key2=v1 ...` lines into outer → inner maps.
pub fn decode2(
    text: &str,
    keys1: Option<&[&str]>,
    keys2: Option<&[&str]>,
    types: &[ValueType],
) -> Result<TwoKey> {
    let mut map = TwoKey::new();
    for line in split_lines(text, 2)? {
        map.entry(line.keys[0].to_string())
            .or_default()
            .insert(line.keys[1].to_string(), to_entry(&line.values, types)?);
    }
    let outer = select(map, keys1, text)?;
    outer
        .into_iter()
        .map(|(k, inner)| Ok((k, select(inner, keys2, text)?)))
        .collect()
}

/// Decode `key1 key2 key3=v1 ...` lines.
pub fn decode3(
    text: &str,
    keys1: Option<&[&str]>,
    keys2: Option<&[&str]>,
    keys3: Option<&[&str]>,
    types: &[ValueType],
) -> Result<ThreeKey> {
    let mut map = ThreeKey::new();
    for line in split_lines(text, 3)? {
        map.entry(line.keys[0].to_string())
            .or_default()
            .entry(line.keys[1].to_string())
            .or_default()
            .insert(line.keys[2].to_string(), to_entry(&line.values, types)?);
    }
    let outer = select(map, keys1, text)?;
    outer
        .into_iter()
        .map(|(k, mid)| {
            let mid = select(mid, keys2, text)?
                .into_iter()
                .map(|(k2, inner)| Ok((k2, select(inner, keys3, text)?)))
                .collect::<Result<TwoKey>>()?;
            Ok((k, mid))
        })
        .collect()
}

/// Decode a bare single-value answer.
pub fn decode_scalar(text: &str, ty: ValueType) -> Result<Value> {
    let t = text.trim();
    if t.is_empty() {
        return Err(GcsError::protocol("empty answer", text));
    }
    convert(t, ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{encode, ArgGroup, FloatFormat};

    #[test]
    fn flat_floats_in_answer_order() {
        let m = decode1("1=1.23\n2=2.00\n3=3.45\n", None, &[ValueType::Float]).expect("decode");
        let keys: Vec<&str> = m.keys().map(String::as_str).collect();
        assert_eq!(keys, ["1", "2", "3"]);
        assert_eq!(m["1"], Entry::One(Value::Float(1.23)));
        assert_eq!(m["2"], Entry::One(Value::Float(2.0)));
        assert_eq!(m["3"], Entry::One(Value::Float(3.45)));
    }

    #[test]
    fn requested_keys_filter_and_order() {
        let m = decode1("1=1\n2=0\n3=1\n", Some(&["3", "1"]), &[ValueType::Bool]).expect("decode");
        let keys: Vec<&str> = m.keys().map(String::as_str).collect();
        assert_eq!(keys, ["3", "1"]);
        assert_eq!(m["3"].as_bool(), Some(true));
    }

    #[test]
    fn missing_requested_key_is_protocol_error() {
        let e = decode1("1=1\n", Some(&["1", "2"]), &[]).expect_err("must fail");
        assert!(matches!(e, GcsError::Protocol { .. }));
    }

    #[test]
    fn arity_mismatch_is_protocol_error() {
        let e = decode1("1 0x1=5\n", None, &[]).expect_err("must fail");
        match e {
            GcsError::Protocol { raw, .. } => assert_eq!(raw, "1 0x1=5"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(decode2("1=5\n", None, None, &[]).is_err());
    }

    #[test]
    fn types_cycle_over_values() {
        let m = decode1(
            "1=0 1.5 2 2.5\n",
            None,
            &[ValueType::Int, ValueType::Float],
        )
        .expect("decode");
        assert_eq!(
            m["1"],
            Entry::Many(vec![
                Value::Int(0),
                Value::Float(1.5),
                Value::Int(2),
                Value::Float(2.5)
            ])
        );
    }

    #[test]
    fn two_key_nested() {
        let text = "1 0x1=100\n1 0x2=2.5\n2 0x1=200 \n2 0x2=3.5\n";
        let m = decode2(text, Some(&["2"]), Some(&["0x2", "0x1"]), &[ValueType::Auto]).expect("decode");
        assert_eq!(m.len(), 1);
        let inner = &m["2"];
        let keys: Vec<&str> = inner.keys().map(String::as_str).collect();
        assert_eq!(keys, ["0x2", "0x1"]);
        assert_eq!(inner["0x1"], Entry::One(Value::Int(200)));
        assert_eq!(inner["0x2"], Entry::One(Value::Float(3.5)));
    }

    #[test]
    fn three_key_nested() {
        let text = "RAM AXIS_1 -=1\nRAM AXIS_2 -=2\nFLASH AXIS_1 -=3\n";
        let m = decode3(text, None, Some(&["AXIS_1"]), None, &[ValueType::Int]).expect("decode");
        assert_eq!(m["RAM"]["AXIS_1"]["-"].as_i64(), Some(1));
        assert_eq!(m["FLASH"]["AXIS_1"]["-"].as_i64(), Some(3));
        assert!(!m["RAM"].contains_key("AXIS_2"));
    }

    #[test]
    fn auto_conversion_contract() {
        assert_eq!(auto_convert("007"), Value::Int(7));
        assert_eq!(auto_convert("-12"), Value::Int(-12));
        assert_eq!(auto_convert("0x1F"), Value::Int(31));
        assert_eq!(auto_convert("1.5e3"), Value::Float(1500.0));
        assert_eq!(auto_convert("nan"), Value::Str("nan".into()));
        assert_eq!(auto_convert("L-511.20SD00"), Value::Str("L-511.20SD00".into()));
        assert_eq!(auto_convert("99999999999999999999"), Value::Float(1e20));
    }

    #[test]
    fn unparseable_number_is_protocol_error() {
        assert!(convert("abc", ValueType::Float).is_err());
        assert!(convert("1.5", ValueType::Int).is_err());
        assert_eq!(convert("ff", ValueType::Hex).expect("hex"), Value::Int(255));
        assert_eq!(convert("0", ValueType::Bool).expect("bool"), Value::Bool(false));
    }

    #[test]
    fn encoded_pairs_decode_back() {
        let axes = ArgGroup::from(vec!["X", "Y", "Z"]);
        let values = ArgGroup::from(vec![1.5, -2.25, 1e-3]);
        let fmt = FloatFormat::General { digits: 12 };
        let cmd = encode("MOV", &[axes, values], fmt);
        // answer of the matching query, one pair per line
        let toks: Vec<&str> = cmd.split_whitespace().skip(1).collect();
        let answer: String = toks
            .chunks(2)
            .map(|kv| format!("{}={}\n", kv[0], kv[1]))
            .collect();
        let m = decode1(&answer, Some(&["X", "Y", "Z"]), &[ValueType::Float]).expect("decode");
        assert_eq!(m["X"].as_f64(), Some(1.5));
        assert_eq!(m["Y"].as_f64(), Some(-2.25));
        assert_eq!(m["Z"].as_f64(), Some(0.001));
    }

    #[test]
    fn scalar_answers() {
        assert_eq!(decode_scalar("2.0\n", ValueType::Float).expect("scalar"), Value::Float(2.0));
        assert!(decode_scalar(" \n", ValueType::Auto).is_err());
    }
}
