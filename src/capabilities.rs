//! Which command verbs the connected device understands.
//!
//! Verbs are stored in wire spelling (`POS?`, `MOV`, `MAC BEG`, `*IDN?`);
//! the single character commands use their `#n` name (`#5`, `#24`).

use std::collections::HashSet;

use crate::block::{keys, BlockNode};
use crate::error::{GcsError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    verbs: HashSet<String>,
}

impl Capabilities {
    pub fn from_verbs<I, S>(verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            verbs: verbs
                .into_iter()
                .map(|v| normalize(v.as_ref()))
                .filter(|v| !v.is_empty())
                .collect(),
        }
    }

    /// `HLP?` answer: one verb per line, followed by its description.
    #[must_use]
    pub fn from_hlp(answer: &str) -> Self {
        Self::from_verbs(answer.lines().filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.contains(" in GCS ") || line.ends_with(':') {
                return None;
            }
            line.split_whitespace().next()
        }))
    }

    /// `Command` column of every block in the `USG? CMD` answer.
    #[must_use]
    pub fn from_usg_cmd(blocks: &[BlockNode]) -> Self {
        Self::from_verbs(
            blocks
                .iter()
                .flat_map(|b| b.rows.iter())
                .filter_map(|row| row.get(keys::COMMAND)),
        )
    }

    /// Static table for devices that cannot report their command set.
    #[must_use]
    pub fn for_device(devname: &str) -> Option<Self> {
        gcs2_table(devname).map(|verbs| Self::from_verbs(verbs.iter()))
    }

    /// Exact match, or a multi-word verb starting with `verb` (`MAC` is
    /// supported when `MAC BEG` is).
    #[must_use]
    pub fn has(&self, verb: &str) -> bool {
        let verb = normalize(verb);
        if self.verbs.contains(&verb) {
            return true;
        }
        let prefix = format!("{verb} ");
        self.verbs.iter().any(|v| v.starts_with(&prefix))
    }

    pub fn require(&self, verb: &str) -> Result<()> {
        if self.has(verb) {
            Ok(())
        } else {
            Err(GcsError::Unsupported(format!(
                "command {} is not supported by the device",
                normalize(verb)
            )))
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }

    /// Sorted verb list.
    #[must_use]
    pub fn verbs(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.verbs.iter().map(String::as_str).collect();
        v.sort_unstable();
        v
    }
}

/// Upper-case and name control characters `#n`.
#[must_use]
pub fn normalize(verb: &str) -> String {
    let verb = verb.trim();
    let mut chars = verb.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_control() {
            return format!("#{}", c as u32);
        }
    }
    verb.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

const E816: &[&str] = &[
    "ERR?", "I2C?", "*IDN?", "#24", "BDR", "BDR?", "AVG", "AVG?", "SCH", "SCH?", "SAI?", "MAC BEG",
    "MAC START", "MAC NSTART", "MAC DEL", "MAC DEF", "MAC END", "MAC DEF?", "MAC FREE?", "MAC?",
    "#8", "DEL", "WPA", "RST", "HLP?", "DCO", "DCO?", "MOV", "MVR", "MOV?", "SVA", "SVR", "SVA?",
    "MVT", "MVT?", "DIP?", "POS?", "VOL?", "OVF?", "ONT?", "SVO", "SVO?", "SWT", "SWT?", "WTO",
    "SPA", "SPA?",
];

const PARALLEL_KINEMATICS: &[&str] = &[
    "*IDN?", "AAP", "CST?", "ECO?", "ERR?", "FAA", "FAM", "FAS", "DMOV", "DRV", "FIO", "FSA", "FSC",
    "FSM", "FSN", "#5", "#6", "MAC BEG", "MAC DEL", "MAC END", "MAC ERR?", "MAC START", "MOV", "MWG",
    "NAV", "NLM", "PLM", "DRR?", "FSN?", "HLP?", "MAC?", "NAV?", "NLM?", "PLM?", "POS?", "SAI?",
    "SAI? ALL", "SCT?", "SGA?", "SPA?", "SPI?", "SSL?", "SST?", "SVO?", "TAV?", "VEL?", "VER?",
    "SCT", "SGA", "SPI", "SSL", "SST", "STP", "SVO", "TAV", "VEL", "VMO",
];

const C702: &[&str] = &[
    "#5", "#6", "#7", "#8", "#24", "*IDN?", "ACC", "ACC?", "CCL", "CCL?", "CLR", "CLS", "CST",
    "CST?", "CSV?", "CTO", "CTO?", "DEL", "DFF", "DFF?", "DFH", "DFH?", "DIO", "DIO?", "DRC", "DRC?",
    "DRR?", "DRT", "DRT?", "DSP", "DSP?", "ECO?", "ERR?", "GOH", "HDR?", "HID", "HID?", "HLP?",
    "HLT", "IFC", "IFC?", "IFS", "IFS?", "INI", "ITD", "LIM?", "MAC", "MAC?", "MNL", "MOV", "MOV?",
    "MPL", "MSG", "MVR", "MVS", "MVS?", "NLM", "NLM?", "ONT?", "PLM", "PLM?", "POS", "POS?", "RBT",
    "REF", "REF?", "RON", "RON?", "RST", "RTR", "RTR?", "SAI", "SAI?", "SAV", "SCA", "SCA?", "SMO",
    "SMO?", "SPA", "SPA?", "SSL", "SSL?", "SSN?", "SSP", "SST", "SST?", "STA?", "STP", "SVO",
    "SVO?", "TAC?", "TCV?", "TIM?", "TIO?", "TMN?", "TMX?", "TNR?", "TRO", "TRO?", "TSP?", "TVI?",
    "VEL", "VEL?", "VER?", "VMO", "VST?", "WAA", "WAI", "WAV", "WAV?", "WGO", "WGO?", "WPA", "WSL",
    "WSL?",
];

fn gcs2_table(devname: &str) -> Option<&'static [&'static str]> {
    match devname.to_uppercase().as_str() {
        "E-816" => Some(E816),
        "HEXAPOD" | "TRIPOD" => Some(PARALLEL_KINEMATICS),
        "C-702.00" => Some(C702),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::parse_block;

    #[test]
    fn hlp_first_tokens() {
        let answer = "The following commands are valid: \n\
                      #5 Request Motion Status \n\
                      *IDN? Get Device Identification \n\
                      mov {<AxisID> <Position>} Set Target Position \n\
                      POS? [{<AxisID>}] Get Real Position \n\
                      end of help\n";
        let caps = Capabilities::from_hlp(answer);
        assert!(caps.has("MOV"));
        assert!(caps.has("pos?"));
        assert!(caps.has("*IDN?"));
        assert!(caps.has("\x05"));
        assert!(!caps.has("HLT"));
    }

    #[test]
    fn usg_cmd_command_column() {
        let text = "#Commands: Command\tDescription\n\
                    REC\tData recorder\n\
                    REC?\tRecorder query\n\
                    SPV?\tParameter value\n\
                    #END\n";
        let blocks = parse_block(text).expect("blocks");
        let caps = Capabilities::from_usg_cmd(&blocks);
        assert_eq!(caps.verbs(), ["REC", "REC?", "SPV?"]);
        assert!(caps.require("REC?").is_ok());
        assert!(matches!(caps.require("MOV"), Err(GcsError::Unsupported(_))));
    }

    #[test]
    fn multi_word_prefix() {
        let caps = Capabilities::for_device("e-816").expect("table");
        assert!(caps.has("MAC"));
        assert!(caps.has("MAC  BEG"));
        assert!(caps.has("\x18"));
        assert!(!caps.has("MA"));
        assert!(Capabilities::for_device("C-884").is_none());
    }
}
