//! Protocol generation detection.
//!
//! `CSV?` (syntax version) is asked first; a version above 2.0 means GCS 3.0.
//! Controllers that cannot answer it are classified from `*IDN?`: known
//! legacy device names, then the number of firmware version segments (GCS
//! 3.0 firmware always reports four).

use std::fmt;

use serde::Serialize;

use crate::connection::Connection;
use crate::error::{GcsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum Dialect {
    #[default]
    Undetermined,
    Gcs2,
    Gcs30,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undetermined => "undetermined",
            Self::Gcs2 => "GCS2",
            Self::Gcs30 => "GCS30",
        })
    }
}

/// Highest `CSV?` value still spoken by legacy controllers.
pub const LEGACY_SYNTAX_MAX: f64 = 2.0;

/// Controllers of the first generation (matched against the full name).
pub const GCS1_DEVICES: &[&str] = &[
    "C-843", "C-702.00", "C-880", "C-848", "E-621", "E-625", "E-665", "E-816", "E-516",
    "C-663.10", "C-863.10", "MERCURY", "HEXAPOD", "TRIPOD", "E-710", "F-206", "E-761",
];

/// GCS2 controller families (matched against the name up to the first `.`).
pub const GCS2_DEVICES: &[&str] = &[
    "C-413", "C-663", "C-863", "C-867", "C-877", "C-884", "C-885", "C-887", "C-891", "E-517",
    "E-518", "E-709", "E-712", "E-723", "E-725", "E-727", "E-753", "E-754", "E-755", "E-861",
    "E-870", "E-871", "E-873", "HYDRAPOLLUX", "PI-E816",
];

#[must_use]
pub fn classify_syntax_version(version: f64) -> Dialect {
    if version <= LEGACY_SYNTAX_MAX {
        Dialect::Gcs2
    } else {
        Dialect::Gcs30
    }
}

/// Classify from a `*IDN?` answer like `(c)2020 Physik Instrumente (PI) GmbH & Co. KG, C-885.M1, 0, 01.002.000.001`.
pub fn classify_idn(idn: &str) -> Result<Dialect> {
    let parts: Vec<&str> = idn.trim().split(',').collect();
    if parts.len() < 2 {
        return Err(GcsError::protocol("identification without device name", idn));
    }
    let name = parts[1].trim().to_ascii_uppercase();
    if GCS1_DEVICES.contains(&name.as_str()) {
        return Ok(Dialect::Gcs2);
    }
    let family = name.split('.').next().unwrap_or_default().trim();
    if GCS2_DEVICES.contains(&family) {
        return Ok(Dialect::Gcs2);
    }
    if parts.len() < 4 {
        return Err(GcsError::protocol("identification without firmware version", idn));
    }
    Ok(classify_firmware(parts[3]))
}

/// Four dot separated segments mean GCS 3.0.
#[must_use]
pub fn classify_firmware(version: &str) -> Dialect {
    if version.trim().split('.').count() < 4 {
        Dialect::Gcs2
    } else {
        Dialect::Gcs30
    }
}

// failures of one probe let the next one run; link failures do not
const fn is_probe_failure(e: &GcsError) -> bool {
    matches!(
        e,
        GcsError::Device { .. } | GcsError::Protocol { .. } | GcsError::Timeout(_)
    )
}

/// Probe the connected controller. Falls back to GCS2 when neither probe
/// gives an answer, since legacy controllers are the ones missing `CSV?`.
pub async fn detect(conn: &mut Connection) -> Result<Dialect> {
    match probe_syntax_version(conn).await {
        Ok(d) => {
            tracing::debug!(dialect = %d, "dialect from CSV?");
            return Ok(d);
        }
        Err(e) if is_probe_failure(&e) => {
            tracing::debug!(error = %e, "CSV? probe failed, trying *IDN?");
            if e.is_timeout() {
                // an unanswered query still leaves its error code behind
                match conn.query_error().await {
                    Ok(code) => tracing::debug!(code, "error left by CSV?"),
                    Err(e) if e.is_timeout() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Err(e) => return Err(e),
    }
    match conn.read("*IDN?").await.and_then(|idn| classify_idn(&idn)) {
        Ok(d) => {
            tracing::debug!(dialect = %d, "dialect from *IDN?");
            Ok(d)
        }
        Err(e) if is_probe_failure(&e) => {
            tracing::warn!(error = %e, "dialect probes failed, assuming GCS2");
            Ok(Dialect::Gcs2)
        }
        Err(e) => Err(e),
    }
}

async fn probe_syntax_version(conn: &mut Connection) -> Result<Dialect> {
    let answer = conn.read("CSV?").await?;
    let version: f64 = answer
        .trim()
        .parse()
        .map_err(|_| GcsError::protocol("syntax version is not a number", answer.clone()))?;
    Ok(classify_syntax_version(version))
}
