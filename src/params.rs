//! Parameter addressing, `SPV` argument building and value typing.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::block::{keys, names, BlockNode};
use crate::decoder::{auto_convert, parse_int, Value};
use crate::encoder::{Arg, CommandBuilder, FloatFormat};
use crate::error::{GcsError, Result};

/// Placeholder for an unused address element.
pub const EMPTY: &str = "-";

/// `<memory> [<container> [<function> [<parameter id>]]]`; omitted trailing
/// elements mean "all".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterAddress {
    pub memory: String,
    pub container: Option<String>,
    pub function: Option<String>,
    pub param: Option<String>,
}

impl ParameterAddress {
    pub fn new(memory: impl Into<String>) -> Self {
        Self {
            memory: memory.into(),
            container: None,
            function: None,
            param: None,
        }
    }

    pub fn full(
        memory: impl Into<String>,
        container: impl Into<String>,
        function: impl Into<String>,
        param: &str,
    ) -> Result<Self> {
        Ok(Self {
            memory: memory.into(),
            container: Some(container.into()),
            function: Some(function.into()),
            param: Some(normalize_param_id(param)?),
        })
    }

    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    #[must_use]
    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_param(mut self, param: &str) -> Result<Self> {
        self.param = Some(normalize_param_id(param)?);
        Ok(self)
    }

    /// Elements present, memory first.
    #[must_use]
    pub fn tokens(&self) -> Vec<&str> {
        std::iter::once(self.memory.as_str())
            .chain(self.container.as_deref())
            .chain(self.function.as_deref())
            .chain(self.param.as_deref())
            .collect()
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.param.is_some()
    }

    fn validate(&self) -> Result<()> {
        let gap = (self.container.is_none() && (self.function.is_some() || self.param.is_some()))
            || (self.function.is_none() && self.param.is_some());
        if self.memory.trim().is_empty() || gap {
            return Err(GcsError::Validation(format!(
                "parameter address {self} has a wildcard before a concrete element"
            )));
        }
        Ok(())
    }
}

impl FromStr for ParameterAddress {
    type Err = GcsError;

    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.is_empty() || tokens.len() > 4 {
            return Err(GcsError::Validation(format!(
                "parameter address {s:?} needs 1 to 4 elements"
            )));
        }
        let addr = Self {
            memory: tokens[0].to_string(),
            container: tokens.get(1).map(|t| (*t).to_string()),
            function: tokens.get(2).map(|t| (*t).to_string()),
            param: tokens.get(3).map(|t| normalize_param_id(t)).transpose()?,
        };
        addr.validate()?;
        Ok(addr)
    }
}

impl fmt::Display for ParameterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens().join(" "))
    }
}

/// The three-element address of a recorder trace source
/// (`<container> <function> <parameter id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceAddress {
    pub container: String,
    pub function: String,
    pub param: String,
}

impl TraceAddress {
    pub fn new(container: &str, function: &str, param: &str) -> Result<Self> {
        format!("{container} {function} {param}").parse()
    }
}

impl FromStr for TraceAddress {
    type Err = GcsError;

    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let [container, function, param] = tokens.as_slice() else {
            return Err(GcsError::Validation(format!(
                "trace address {s:?} must have exactly 3 elements"
            )));
        };
        Ok(Self {
            container: (*container).to_string(),
            function: (*function).to_string(),
            param: normalize_param_id(param)?,
        })
    }
}

impl fmt::Display for TraceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.container, self.function, self.param)
    }
}

/// Canonical `0x..` spelling of a parameter id; a `,<index>` suffix is kept.
///
/// ```
/// use gcs_client::params::normalize_param_id;
/// assert_eq!(normalize_param_id("0X10A").unwrap(), "0x10a");
/// assert_eq!(normalize_param_id("258,2").unwrap(), "0x102,2");
/// ```
pub fn normalize_param_id(id: &str) -> Result<String> {
    let id = id.trim();
    if id == EMPTY {
        return Ok(id.to_string());
    }
    let (body, index) = match id.split_once(',') {
        Some((b, i)) => (b, Some(i)),
        None => (id, None),
    };
    let v = param_id_value(body)?;
    Ok(match index {
        Some(i) => format!("0x{v:x},{}", i.trim()),
        None => format!("0x{v:x}"),
    })
}

/// Numeric value of a parameter id, decimal or `0x` hex.
pub fn param_id_value(id: &str) -> Result<u32> {
    parse_int(id.trim())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| GcsError::Validation(format!("invalid parameter id {id:?}")))
}

/// `SPV <memory> {<container> <function> <id> <value>}`.
#[must_use]
pub fn spv_command(memory: &str, items: &[(TraceAddress, Arg)], fmt: FloatFormat) -> String {
    items
        .iter()
        .fold(CommandBuilder::new("SPV").arg(memory), |b, (addr, value)| {
            b.arg(addr.container.as_str())
                .arg(addr.function.as_str())
                .arg(addr.param.as_str())
                .arg(value.clone())
        })
        .build(fmt)
}

/// `SPV? [<address>]` for a (possibly wildcarded) address.
pub fn spv_query(addr: &ParameterAddress) -> Result<String> {
    addr.validate()?;
    Ok(format!("SPV? {addr}"))
}

/// memory → container → function → parameter id → value
pub type SpvAnswer = IndexMap<String, IndexMap<String, IndexMap<String, IndexMap<String, Value>>>>;

/// Parse `mem cu fu pid=value` lines. Values are typed with `types` when
/// given, with [`auto_convert`] otherwise; `-` is kept as text.
pub fn parse_spv_answer(text: &str, types: Option<&ParamTypeTable>) -> Result<SpvAnswer> {
    let mut out = SpvAnswer::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (left, value) = line
            .split_once('=')
            .ok_or_else(|| GcsError::protocol("parameter line without '='", line))?;
        let addr: Vec<&str> = left.split_whitespace().collect();
        let [mem, cu, fu, pid] = addr.as_slice() else {
            return Err(GcsError::protocol(
                format!("expected 4 address elements, got {}", addr.len()),
                line,
            ));
        };
        let pid = normalize_param_id(pid).map_err(|_| GcsError::protocol("bad parameter id", line))?;
        let value = match types {
            Some(t) => t.convert_unit(cu, fu, &pid, value)?,
            None => convert_untyped(value),
        };
        out.entry((*mem).to_string())
            .or_default()
            .entry((*cu).to_string())
            .or_default()
            .entry((*fu).to_string())
            .or_default()
            .insert(pid, value);
    }
    Ok(out)
}

fn convert_untyped(raw: &str) -> Value {
    let raw = raw.trim();
    if raw == EMPTY {
        Value::Str(raw.to_string())
    } else {
        auto_convert(raw)
    }
}

/// Value kind of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Text,
}

impl ParamType {
    /// Type column of `HPA?`.
    pub fn from_hpa(name: &str) -> Result<Self> {
        match name.to_uppercase().as_str() {
            "INT" => Ok(Self::Int),
            "FLOAT" => Ok(Self::Float),
            "CHAR" | "STRING" => Ok(Self::Text),
            _ => Err(GcsError::protocol(format!("unknown parameter type {name:?}"), name)),
        }
    }

    /// `Data Type` column of the parameter overview block.
    pub fn from_data_type(name: &str) -> Result<Self> {
        match name.to_uppercase().as_str() {
            "INT8" | "UINT8" | "INT16" | "UINT16" | "INT32" | "UINT32" | "INT64" | "UINT64" => {
                Ok(Self::Int)
            }
            "FLOAT32" | "FLOAT64" => Ok(Self::Float),
            "STRING32" | "VOID" | "ENUM" => Ok(Self::Text),
            _ => Err(GcsError::protocol(format!("unknown parameter type {name:?}"), name)),
        }
    }

    pub fn convert(self, raw: &str) -> Result<Value> {
        let raw = raw.trim();
        if raw == EMPTY {
            return Ok(Value::Str(raw.to_string()));
        }
        match self {
            Self::Int => parse_int(raw)
                .map(Value::Int)
                .ok_or_else(|| GcsError::protocol("parameter value is not an integer", raw)),
            Self::Float => raw
                .parse()
                .map(Value::Float)
                .map_err(|_| GcsError::protocol("parameter value is not a float", raw)),
            Self::Text => Ok(Value::Str(raw.to_string())),
        }
    }
}

/// Parameter types learned from the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamTypeTable {
    by_id: HashMap<u32, ParamType>,
    by_unit: HashMap<(String, String, String), ParamType>,
}

impl ParamTypeTable {
    /// `HPA?` lines: `0x<id>=<tab separated fields>`, type in the 4th token.
    pub fn from_hpa(answer: &str) -> Result<Self> {
        let mut table = Self::default();
        for line in answer.lines().filter(|l| l.contains('=')) {
            let (id, _) = line.split_once('=').unwrap_or((line, ""));
            let id = param_id_value(id).map_err(|_| GcsError::protocol("bad HPA? id", line))?;
            let ty = line
                .split_whitespace()
                .nth(3)
                .ok_or_else(|| GcsError::protocol("HPA? line without type", line))?;
            table.by_id.insert(id, ParamType::from_hpa(ty)?);
        }
        Ok(table)
    }

    /// Rows of the `Parameter Overview` block of `USG? PAM`.
    pub fn from_usg_pam(blocks: &[BlockNode]) -> Result<Self> {
        let mut table = Self::default();
        for block in blocks.iter().filter(|b| b.name == names::PARAM_OVERVIEW) {
            for row in &block.rows {
                let field = |k: &str| {
                    row.get(k).ok_or_else(|| {
                        GcsError::protocol(format!("parameter overview without {k}"), block.name.clone())
                    })
                };
                let pid = normalize_param_id(field(keys::PARAM_ID)?)
                    .map_err(|e| GcsError::protocol(e.to_string(), block.name.clone()))?;
                table.by_unit.insert(
                    (
                        field(keys::CONTAINER_UNIT)?.to_string(),
                        field(keys::FUNCTION_UNIT)?.to_string(),
                        pid,
                    ),
                    ParamType::from_data_type(field(keys::DATA_TYPE)?)?,
                );
            }
        }
        Ok(table)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len() + self.by_unit.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn type_of_id(&self, id: u32) -> Option<ParamType> {
        self.by_id.get(&id).copied()
    }

    /// Type of `cu fu pid`; an index suffix on `pid` is ignored.
    #[must_use]
    pub fn type_of_unit(&self, cu: &str, fu: &str, pid: &str) -> Option<ParamType> {
        let pid = pid.split(',').next().unwrap_or(pid);
        let pid = normalize_param_id(pid).ok()?;
        self.by_unit
            .get(&(cu.to_string(), fu.to_string(), pid))
            .copied()
    }

    /// Convert a `SPA?`-style value; unknown ids fall back to auto typing.
    pub fn convert_id(&self, pid: &str, raw: &str) -> Result<Value> {
        match param_id_value(pid).ok().and_then(|id| self.type_of_id(id)) {
            Some(t) => t.convert(raw),
            None => Ok(convert_untyped(raw)),
        }
    }

    pub fn convert_unit(&self, cu: &str, fu: &str, pid: &str, raw: &str) -> Result<Value> {
        match self.type_of_unit(cu, fu, pid) {
            Some(t) => t.convert(raw),
            None => Ok(convert_untyped(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::parse_block;

    #[test]
    fn address_wildcards_trail() {
        let a: ParameterAddress = "RAM AXIS_1".parse().expect("addr");
        assert_eq!(a.container.as_deref(), Some("AXIS_1"));
        assert!(a.function.is_none());
        assert!(!a.is_complete());
        assert_eq!(a.to_string(), "RAM AXIS_1");

        let full: ParameterAddress = "RAM AXIS_1 - 258".parse().expect("addr");
        assert_eq!(full.to_string(), "RAM AXIS_1 - 0x102");
        assert!("".parse::<ParameterAddress>().is_err());
        assert!("RAM A B 0x1 extra".parse::<ParameterAddress>().is_err());

        let gap = ParameterAddress::new("RAM").with_function("CTRL_1");
        assert!(matches!(spv_query(&gap), Err(GcsError::Validation(_))));
    }

    #[test]
    fn trace_address_needs_three_elements() {
        let t: TraceAddress = "AXIS_1 - 0x102".parse().expect("trace");
        assert_eq!(t.to_string(), "AXIS_1 - 0x102");
        assert!(matches!("AXIS_1 0x102".parse::<TraceAddress>(), Err(GcsError::Validation(_))));
        assert!(TraceAddress::new("AXIS_1", "-", "zz").is_err());
    }

    #[test]
    fn spv_command_with_hex_ids() {
        let items = vec![
            (TraceAddress::new("AXIS_1", "-", "0x102").expect("t"), Arg::from(1.5)),
            (TraceAddress::new("AXIS_2", "CTRL_1", "0X10A").expect("t"), Arg::from(3)),
        ];
        let cmd = spv_command("RAM", &items, FloatFormat::default());
        assert_eq!(cmd, "SPV RAM AXIS_1 - 0x102 1.5 AXIS_2 CTRL_1 0x10a 3");
    }

    #[test]
    fn spv_answer_nested_and_typed() {
        let pam = "#Parameter Overview:\tContainer Unit\tFunction Unit\tParameter ID\tData Type\n\
                   AXIS_1\t-\t0x102\tFLOAT32\n\
                   AXIS_1\t-\t0x103\tUINT32\n\
                   AXIS_1\t-\t0x104\tSTRING32\n\
                   #END\n";
        let table = ParamTypeTable::from_usg_pam(&parse_block(pam).expect("block")).expect("table");
        assert_eq!(table.type_of_unit("AXIS_1", "-", "0x103,1"), Some(ParamType::Int));

        let text = "RAM AXIS_1 - 0x102=5 \nRAM AXIS_1 - 0x103=-\nRAM AXIS_1 - 0x104=007\n";
        let ans = parse_spv_answer(text, Some(&table)).expect("answer");
        let unit = &ans["RAM"]["AXIS_1"]["-"];
        assert_eq!(unit["0x102"], Value::Float(5.0));
        assert_eq!(unit["0x103"], Value::Str("-".into()));
        assert_eq!(unit["0x104"], Value::Str("007".into()));

        let untyped = parse_spv_answer(text, None).expect("answer");
        assert_eq!(untyped["RAM"]["AXIS_1"]["-"]["0x104"], Value::Int(7));
        assert!(parse_spv_answer("RAM AXIS_1 0x102=1\n", None).is_err());
    }

    #[test]
    fn hpa_types() {
        let hpa = "0x1=\t0\t1\tINT\tmotorcontroller\tP term 1 \n\
                   0x0E=\t0\t1\tFLOAT\tmotorcontroller\tUnit numerator \n\
                   0x3C=\t0\t1\tCHAR\tsystem\tStage name\n";
        let table = ParamTypeTable::from_hpa(hpa).expect("table");
        assert_eq!(table.type_of_id(0x0E), Some(ParamType::Float));
        assert_eq!(table.convert_id("0x1", "12").expect("int"), Value::Int(12));
        assert_eq!(table.convert_id("60", "M-111").expect("text"), Value::Str("M-111".into()));
        assert!(table.convert_id("0x1", "1.5").is_err());

        let bad = "0x1=\t0\t1\tBLOB\tx\ty\n";
        assert!(matches!(ParamTypeTable::from_hpa(bad), Err(GcsError::Protocol { .. })));
        assert!(ParamType::from_data_type("BITFIELD").is_err());
    }
}
