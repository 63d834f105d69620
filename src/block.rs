//! Parser for GCS 3.0 block answers.
//!
//! ```text
//! #Command Overview:	Command	Arguments
//! SPV?	<MemType> <ContUnit>
//! #Sub Block:	Key	Value
//! A	1
//! #END
//! #END
//! ```
//!
//! A header line opens a block, tab separated rows follow, `#END` (or
//! `#end`) closes it. A header seen inside a block opens a sub-block which
//! belongs to the row read just before it.

use indexmap::IndexMap;

use crate::error::{GcsError, Result};

/// Block names used by the structural queries.
pub mod names {
    pub const PARAM_OVERVIEW: &str = "Parameter Overview";
    pub const COMMAND_OVERVIEW: &str = "Command Overview";
    pub const USER_COMMAND_LEVEL: &str = "User Command Level";
    pub const RECORDER_TRIGGER: &str = "Recorder Trigger";
    pub const TRIGGER_OPTION_TYPES: &str = "Trigger Option Types";
    pub const UNIT_PROPERTIES: &str = "Unit Properties";
}

/// Column names used by the structural queries.
pub mod keys {
    pub const CONTAINER_UNIT: &str = "Container Unit";
    pub const FUNCTION_UNIT: &str = "Function Unit";
    pub const PARAM_ID: &str = "Parameter ID";
    pub const DATA_TYPE: &str = "Data Type";
    pub const COMMAND: &str = "Command";
    pub const COMMAND_LEVEL_NAME: &str = "Name";
    pub const NAME: &str = "Name";
    pub const ALIAS: &str = "Alias";
    pub const OPTION1: &str = "Option1";
    pub const OPTION2: &str = "Option2";
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockRow {
    pub fields: IndexMap<String, String>,
    /// Sub-blocks in the order they were closed (`SUB_1`, `SUB_2`, ...).
    pub sub_blocks: Vec<Vec<BlockNode>>,
}

impl BlockRow {
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// `SUB_<n>` sub-block, 1-based.
    #[must_use]
    pub fn sub_block(&self, n: usize) -> Option<&[BlockNode]> {
        n.checked_sub(1)
            .and_then(|i| self.sub_blocks.get(i))
            .map(Vec::as_slice)
    }

    /// First sub-block whose header carries `name`.
    #[must_use]
    pub fn find_sub_block(&self, name: &str) -> Option<&BlockNode> {
        self.sub_blocks
            .iter()
            .flat_map(|s| s.iter())
            .find(|b| b.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<BlockRow>,
}

impl BlockNode {
    /// Values of one column over all rows.
    pub fn column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.rows.iter().filter_map(move |r| r.get(column))
    }
}

/// Role of a line, derived from the nesting depth and the `#` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    NoStatus,
    NewMainBlock,
    InMainBlock,
    InSubBlock,
    EndSubBlock,
    EndMainBlock,
}

fn is_end_marker(line: &str) -> bool {
    line.starts_with("#END") || line.starts_with("#end")
}

/// Classify every line. Lines must already be trimmed.
#[must_use]
pub fn line_states<'a>(lines: &[&'a str]) -> Vec<(&'a str, LineStatus)> {
    let mut depth = 0usize;
    let mut status = LineStatus::NoStatus;
    let mut out = Vec::with_capacity(lines.len());
    for &line in lines {
        if is_end_marker(line) {
            depth = depth.saturating_sub(1);
            status = match depth {
                0 => LineStatus::EndMainBlock,
                1 => LineStatus::EndSubBlock,
                _ => LineStatus::InSubBlock,
            };
        } else if line.starts_with('#') {
            match depth {
                0 => status = LineStatus::NewMainBlock,
                1 => status = LineStatus::InSubBlock,
                // deeper headers belong to the sub-block being collected
                _ => {}
            }
            depth += 1;
        } else {
            match depth {
                0 => status = LineStatus::NoStatus,
                1 => status = LineStatus::InMainBlock,
                _ => {}
            }
        }
        out.push((line, status));
    }
    out
}

fn parse_header(line: &str) -> Result<(String, Vec<String>)> {
    let (name, cols) = line
        .split_once(':')
        .ok_or_else(|| GcsError::protocol("block header without ':'", line))?;
    let name = name.replace('#', "").trim().to_string();
    let columns = cols
        .split('\t')
        .map(|c| c.trim().replace(['<', '>'], ""))
        .filter(|c| !c.is_empty())
        .collect();
    Ok((name, columns))
}

/// Parse a complete block answer into its top level blocks.
pub fn parse_block(text: &str) -> Result<Vec<BlockNode>> {
    let lines: Vec<&str> = text
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    parse_lines(&lines)
}

fn parse_lines(lines: &[&str]) -> Result<Vec<BlockNode>> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;
    let mut rows: Vec<BlockRow> = Vec::new();
    let mut sub_lines: Vec<&str> = Vec::new();

    for (line, status) in line_states(lines) {
        match status {
            LineStatus::NoStatus => {}
            LineStatus::NewMainBlock => {
                current = Some(parse_header(line)?);
                rows.clear();
            }
            LineStatus::InMainBlock => {
                let columns = current
                    .as_ref()
                    .map(|(_, c)| c.as_slice())
                    .ok_or_else(|| GcsError::protocol("block row before any header", line))?;
                let values: Vec<&str> = line.split('\t').map(str::trim).collect();
                if values.len() != columns.len() {
                    return Err(GcsError::protocol(
                        format!(
                            "block row has {} columns, header declares {} ({})",
                            values.len(),
                            columns.len(),
                            columns.join(", ")
                        ),
                        line,
                    ));
                }
                let fields = columns
                    .iter()
                    .cloned()
                    .zip(values.into_iter().map(str::to_string))
                    .collect();
                rows.push(BlockRow {
                    fields,
                    sub_blocks: Vec::new(),
                });
            }
            LineStatus::InSubBlock => sub_lines.push(line),
            LineStatus::EndSubBlock => {
                sub_lines.push(line);
                let parsed = parse_lines(&sub_lines)?;
                sub_lines.clear();
                let parent = rows
                    .last_mut()
                    .ok_or_else(|| GcsError::protocol("sub-block without a parent row", line))?;
                parent.sub_blocks.push(parsed);
            }
            LineStatus::EndMainBlock => {
                let (name, columns) = current
                    .take()
                    .ok_or_else(|| GcsError::protocol("end marker without open block", line))?;
                blocks.push(BlockNode {
                    name,
                    columns,
                    rows: std::mem::take(&mut rows),
                });
            }
        }
    }
    Ok(blocks)
}

/// Depth-first search for the first block called `name`, sub-blocks included.
#[must_use]
pub fn find_block<'a>(blocks: &'a [BlockNode], name: &str) -> Option<&'a BlockNode> {
    for b in blocks {
        if b.name == name {
            return Some(b);
        }
    }
    blocks
        .iter()
        .flat_map(|b| b.rows.iter())
        .flat_map(|r| r.sub_blocks.iter())
        .find_map(|sub| find_block(sub, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const USG_CMD: &str = "#Command Overview:\t<Command>\t<Arguments>\t<Description>\n\
        SPV?\t[<MemType> [<ContUnit> [<FuncUnit> [<ParamID>]]]]\tGet parameter value\n\
        REC START\t<RecID>\tStart recording\n\
        #END\n";

    #[test]
    fn single_block_rows_and_columns() {
        let blocks = parse_block(USG_CMD).expect("parse");
        assert_eq!(blocks.len(), 1);
        let b = &blocks[0];
        assert_eq!(b.name, "Command Overview");
        assert_eq!(b.columns, ["Command", "Arguments", "Description"]);
        assert_eq!(b.rows.len(), 2);
        assert_eq!(b.rows[1].get("Command"), Some("REC START"));
        let cmds: Vec<&str> = b.column(keys::COMMAND).collect();
        assert_eq!(cmds, ["SPV?", "REC START"]);
    }

    #[test]
    fn every_row_has_header_width() {
        let text = "#Parameter Overview:\tContainer Unit\tFunction Unit\tParameter ID\tData Type\n\
            AXIS_1\t-\t0x102\tFLOAT32\n\
            AXIS_1\tCTRL_1\t0x103\tUINT32\n\
            #end\n\
            #Unit Properties:\tName\tValue\n\
            Max Traces\t8\n\
            #END\n";
        let blocks = parse_block(text).expect("parse");
        assert_eq!(blocks.len(), 2);
        for b in &blocks {
            for r in &b.rows {
                assert_eq!(r.fields.len(), b.columns.len());
            }
        }
        assert_eq!(blocks[1].rows[0].get("Value"), Some("8"));
    }

    #[test]
    fn column_mismatch_is_protocol_error() {
        let text = "#Unit Properties:\tName\tValue\nA\t1\nB\t2\t3\nC\t4\n#END\n";
        match parse_block(text) {
            Err(GcsError::Protocol { raw, .. }) => assert_eq!(raw, "B\t2\t3"),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn sub_blocks_attach_to_previous_row() {
        let text = "#Recorder Trigger:\tName\tDescription\n\
            IMM\tImmediately\n\
            POS\tPosition trigger\n\
            #Trigger Option Types:\tAlias\tOption1\tOption2\n\
            POS\tAXIS_1\t0.5\n\
            #END\n\
            #Notes:\tText\n\
            first\n\
            #END\n\
            #END\n";
        let blocks = parse_block(text).expect("parse");
        let trig = find_block(&blocks, names::RECORDER_TRIGGER).expect("trigger block");
        assert_eq!(trig.rows.len(), 2);
        assert!(trig.rows[0].sub_blocks.is_empty());

        let pos = &trig.rows[1];
        assert_eq!(pos.sub_blocks.len(), 2);
        let opts = &pos.sub_block(1).expect("SUB_1")[0];
        assert_eq!(opts.name, "Trigger Option Types");
        assert_eq!(opts.rows[0].get(keys::OPTION2), Some("0.5"));
        assert_eq!(pos.sub_block(2).expect("SUB_2")[0].rows[0].get("Text"), Some("first"));
        assert!(pos.sub_block(0).is_none());

        // nested blocks are reachable by name from the top
        let found = find_block(&blocks, names::TRIGGER_OPTION_TYPES).expect("nested");
        assert_eq!(found.columns, ["Alias", "Option1", "Option2"]);
        assert!(pos.find_sub_block("Notes").is_some());
    }

    #[test]
    fn doubly_nested_sub_block() {
        let text = "#Outer:\tA\n\
            a1\n\
            #Mid:\tB\n\
            b1\n\
            #Inner:\tC\n\
            c1\n\
            #END\n\
            #END\n\
            #END\n";
        let blocks = parse_block(text).expect("parse");
        let mid = &blocks[0].rows[0].sub_blocks[0][0];
        assert_eq!(mid.name, "Mid");
        let inner = &mid.rows[0].sub_blocks[0][0];
        assert_eq!(inner.rows[0].get("C"), Some("c1"));
    }

    #[test]
    fn line_state_table() {
        let lines = ["#A:\tx", "1", "#S:\ty", "2", "#END", "#END", "stray"];
        let states: Vec<LineStatus> = line_states(&lines).into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            [
                LineStatus::NewMainBlock,
                LineStatus::InMainBlock,
                LineStatus::InSubBlock,
                LineStatus::InSubBlock,
                LineStatus::EndSubBlock,
                LineStatus::EndMainBlock,
                LineStatus::NoStatus,
            ]
        );
    }

    #[test]
    fn sub_block_before_any_row_fails() {
        let text = "#A:\tx\n#S:\ty\n2\n#END\n#END\n";
        assert!(parse_block(text).is_err());
    }
}
