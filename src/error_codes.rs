//! Controller error code tables and translation.
//!
//! GCS2 codes are flat integers; GCS 3.0 codes are a `(class, id)` bit
//! field. Both tables load from embedded TOML and can be extended at run
//! time with `Gcs2ErrorTable::from_str(...).register_or_merge()` and friends.
//! `translate` never fails: unregistered codes get a generic "unknown error".

use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use crate::dialect::Dialect;
use crate::error::GcsError;

/// GCS2: "Controller was stopped by command".
pub const GCS2_STOPPED_BY_COMMAND: i32 = 10;
/// GCS 3.0: "Halt was commanded" (class 15, id 76).
pub const GCS30_HALT_WAS_COMMANDED: i32 = 245_836;

// integer or "0x...." string; negative codes are allowed
fn parse_hex_or_int<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;
    impl serde::de::Visitor<'_> for V {
        type Value = i32;
        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "hex string like 0xNNNN or integer")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            i32::try_from(v).map_err(|_| E::custom(format!("value out of range: {v}")))
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            i32::try_from(v).map_err(|_| E::custom(format!("value out of range: {v}")))
        }
        fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let s = s.trim();
            s.strip_prefix("0x").map_or_else(
                || s.parse::<i32>().map_err(|e| E::custom(format!("parse int: {e}"))),
                |h| i32::from_str_radix(h, 16).map_err(|e| E::custom(format!("parse hex: {e}"))),
            )
        }
    }
    deserializer.deserialize_any(V)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gcs2Entry {
    #[serde(deserialize_with = "parse_hex_or_int")]
    pub code: i32,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Gcs2Toml {
    #[serde(default)]
    codes: Vec<Gcs2Entry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gcs30Class {
    pub id: u32,
    pub alias: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gcs30Entry {
    pub id: u32,
    pub name: Option<String>,
    pub description: String,
    /// Classes this id may be reported under.
    #[serde(default)]
    pub classes: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct Gcs30Toml {
    #[serde(default)]
    classes: Vec<Gcs30Class>,
    #[serde(default)]
    errors: Vec<Gcs30Entry>,
}

#[derive(Debug, Default)]
struct Gcs30Maps {
    classes: HashMap<u32, Gcs30Class>,
    errors: HashMap<u32, Gcs30Entry>,
}

static GCS2_REGISTRY: OnceCell<RwLock<HashMap<i32, Gcs2Entry>>> = OnceCell::new();
static GCS30_REGISTRY: OnceCell<RwLock<Gcs30Maps>> = OnceCell::new();

fn toml_error(what: &str, e: &toml::de::Error) -> GcsError {
    GcsError::protocol(format!("{what} parse error: {e}"), "")
}

fn poisoned() -> GcsError {
    GcsError::Usage("error registry poisoned".into())
}

/// Parsed GCS2 table, not yet registered.
pub struct Gcs2ErrorTable {
    codes: Vec<Gcs2Entry>,
}

impl Gcs2ErrorTable {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, GcsError> {
        let parsed: Gcs2Toml = toml::from_str(s).map_err(|e| toml_error("gcs2 error table", &e))?;
        Ok(Self {
            codes: parsed.codes,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, GcsError> {
        let s = fs::read_to_string(path)?;
        Self::from_str(&s)
    }

    /// Insert into the global table; existing codes are overwritten.
    pub fn register_or_merge(&self) -> Result<(), GcsError> {
        self.merge(true)
    }

    fn merge(&self, overwrite: bool) -> Result<(), GcsError> {
        let cell = GCS2_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()));
        let mut w = cell.write().map_err(|_| poisoned())?;
        for e in &self.codes {
            if overwrite || !w.contains_key(&e.code) {
                w.insert(e.code, e.clone());
            }
        }
        Ok(())
    }
}

/// Parsed GCS 3.0 tables, not yet registered.
pub struct Gcs30ErrorTable {
    classes: Vec<Gcs30Class>,
    errors: Vec<Gcs30Entry>,
}

impl Gcs30ErrorTable {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, GcsError> {
        let parsed: Gcs30Toml =
            toml::from_str(s).map_err(|e| toml_error("gcs30 error table", &e))?;
        Ok(Self {
            classes: parsed.classes,
            errors: parsed.errors,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, GcsError> {
        let s = fs::read_to_string(path)?;
        Self::from_str(&s)
    }

    pub fn register_or_merge(&self) -> Result<(), GcsError> {
        self.merge(true)
    }

    fn merge(&self, overwrite: bool) -> Result<(), GcsError> {
        let cell = GCS30_REGISTRY.get_or_init(|| RwLock::new(Gcs30Maps::default()));
        let mut w = cell.write().map_err(|_| poisoned())?;
        for c in &self.classes {
            if overwrite || !w.classes.contains_key(&c.id) {
                w.classes.insert(c.id, c.clone());
            }
        }
        for e in &self.errors {
            if overwrite || !w.errors.contains_key(&e.id) {
                w.errors.insert(e.id, e.clone());
            }
        }
        Ok(())
    }
}

static DEFAULTS: OnceCell<()> = OnceCell::new();

/// Load the embedded tables once. Entries registered earlier by the
/// application take precedence over the defaults.
pub fn ensure_defaults() -> Result<(), GcsError> {
    DEFAULTS
        .get_or_try_init(|| {
            Gcs2ErrorTable::from_str(include_str!("gcs2_errors.toml"))?.merge(false)?;
            Gcs30ErrorTable::from_str(include_str!("gcs30_errors.toml"))?.merge(false)
        })
        .map(|_| ())
}

/// Split a GCS 3.0 error code into `(class, id)`.
#[must_use]
pub const fn parse_gcs30_code(code: i32) -> (u32, u32) {
    let c = code as u32;
    ((c & 0x003F_C000) >> 14, c & 0x3FFF)
}

/// Inverse of [`parse_gcs30_code`]; out-of-range parts are masked.
#[must_use]
pub const fn compose_gcs30_code(class: u32, id: u32) -> i32 {
    (((class << 14) & 0x003F_C000) | (id & 0x3FFF)) as i32
}

fn gcs2_lookup(code: i32) -> Option<Gcs2Entry> {
    let _ = ensure_defaults();
    GCS2_REGISTRY
        .get()
        .and_then(|c| c.read().ok())
        .and_then(|m| m.get(&code).cloned())
}

fn gcs30_lookup(code: i32) -> Option<(Gcs30Entry, Gcs30Class)> {
    let _ = ensure_defaults();
    let (class, id) = parse_gcs30_code(code);
    let maps = GCS30_REGISTRY.get()?.read().ok()?;
    let entry = maps.errors.get(&id)?;
    if !entry.classes.is_empty() && !entry.classes.contains(&class) {
        return None;
    }
    let class = maps.classes.get(&class)?;
    Some((entry.clone(), class.clone()))
}

/// Human readable message for a controller error code. Never fails.
#[must_use]
pub fn translate(dialect: Dialect, code: i32) -> String {
    match dialect {
        Dialect::Gcs30 => match gcs30_lookup(code) {
            Some((e, c)) => format!(
                "ERROR: {code}\n{} ({})\n{} ({})\n",
                e.description, e.id, c.description, c.id
            ),
            None => {
                let (class, id) = parse_gcs30_code(code);
                format!("ERROR: {code}\nUnknown error: class: {class}, error: {id}\n")
            }
        },
        Dialect::Gcs2 | Dialect::Undetermined => gcs2_lookup(code)
            .and_then(|e| e.description)
            .unwrap_or_else(|| format!("Unknown error ({code})")),
    }
}

/// Symbolic name such as `PI_CNTR_STOP` or `HALT_WAS_COMMANDED`.
#[must_use]
pub fn error_name(dialect: Dialect, code: i32) -> Option<String> {
    match dialect {
        Dialect::Gcs30 => gcs30_lookup(code).and_then(|(e, _)| e.name),
        Dialect::Gcs2 | Dialect::Undetermined => gcs2_lookup(code).and_then(|e| e.name),
    }
}

/// The "stopped by command" code a halt/stop/reboot may mask.
#[must_use]
pub const fn stop_code(dialect: Dialect) -> Option<i32> {
    match dialect {
        Dialect::Gcs2 => Some(GCS2_STOPPED_BY_COMMAND),
        Dialect::Gcs30 => Some(GCS30_HALT_WAS_COMMANDED),
        Dialect::Undetermined => None,
    }
}

/// True when `err` is the dialect's stop code and the caller opted in.
#[must_use]
pub fn is_masked(dialect: Dialect, err: &GcsError, noraise: bool) -> bool {
    noraise && err.device_code().is_some() && err.device_code() == stop_code(dialect)
}

/// Build the typed device error for `code`.
#[must_use]
pub fn device_error(dialect: Dialect, code: i32) -> GcsError {
    let message = translate(dialect, code)
        .lines()
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" / ");
    GcsError::Device {
        dialect,
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcs2_known_and_unknown() {
        assert_eq!(translate(Dialect::Gcs2, 10), "Controller was stopped by command");
        assert_eq!(translate(Dialect::Gcs2, 2), "Unknown command");
        assert_eq!(translate(Dialect::Gcs2, 4711), "Unknown error (4711)");
        assert_eq!(error_name(Dialect::Gcs2, 7).as_deref(), Some("PI_CNTR_POS_OUT_OF_LIMITS"));
    }

    #[test]
    fn gcs30_code_split_and_compose() {
        assert_eq!(parse_gcs30_code(49184), (3, 32));
        assert_eq!(parse_gcs30_code(GCS30_HALT_WAS_COMMANDED), (15, 76));
        assert_eq!(compose_gcs30_code(5, 8), 81928);
        for code in [49154, 65578, 81947, 245_836, 16459] {
            let (c, i) = parse_gcs30_code(code);
            assert_eq!(compose_gcs30_code(c, i), code);
        }
    }

    #[test]
    fn gcs30_translation_format() {
        assert_eq!(
            translate(Dialect::Gcs30, 49184),
            "ERROR: 49184\nNot in configuration mode (32)\nCommand error (3)\n"
        );
        // id 18 exists under class 3 and class 5
        assert!(translate(Dialect::Gcs30, 81938).contains("Axis error (5)"));
        assert_eq!(error_name(Dialect::Gcs30, 81947).as_deref(), Some("STOP"));
    }

    #[test]
    fn gcs30_unknown_keeps_class_and_id() {
        let code = compose_gcs30_code(7, 999);
        assert_eq!(
            translate(Dialect::Gcs30, code),
            format!("ERROR: {code}\nUnknown error: class: 7, error: 999\n")
        );
        // known id under a class it is not defined for
        let code = compose_gcs30_code(1, 32);
        assert!(translate(Dialect::Gcs30, code).contains("Unknown error"));
    }

    #[test]
    fn stop_code_mask_only_when_opted_in() {
        let stop = device_error(Dialect::Gcs2, GCS2_STOPPED_BY_COMMAND);
        assert!(is_masked(Dialect::Gcs2, &stop, true));
        assert!(!is_masked(Dialect::Gcs2, &stop, false));
        let other = device_error(Dialect::Gcs2, 5);
        assert!(!is_masked(Dialect::Gcs2, &other, true));
        let halt = device_error(Dialect::Gcs30, GCS30_HALT_WAS_COMMANDED);
        assert!(is_masked(Dialect::Gcs30, &halt, true));
        assert!(!is_masked(Dialect::Gcs2, &halt, true));
        assert!(!is_masked(Dialect::Gcs2, &GcsError::Timeout("x".into()), true));
    }

    #[test]
    fn device_error_message_is_single_line() {
        let e = device_error(Dialect::Gcs30, 49184);
        assert_eq!(
            e.to_string(),
            "GCS30 device error 49184: ERROR: 49184 / Not in configuration mode (32) / Command error (3)"
        );
    }
}
