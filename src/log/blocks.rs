// src/log/blocks.rs

//! Read-side grouping of log lines into blocks.
//!
//! Blocks are not stored: a block is the `BlockStart` line plus every line
//! after it up to the next `BlockStart`. Lines before the first block start
//! form an anonymous leading block.

use serde::{Deserialize, Serialize};

use crate::log::{LogKind, LogLine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBlock {
    /// `None` for the leading anonymous block.
    pub name: Option<String>,
    pub header: Option<LogLine>,
    pub lines: Vec<LogLine>,
}

/// Group `lines` (in `seq_no` order) into blocks.
pub fn group_blocks(lines: &[LogLine]) -> Vec<LogBlock> {
    let mut blocks: Vec<LogBlock> = Vec::new();

    for line in lines {
        match &line.kind {
            LogKind::BlockStart { name } => blocks.push(LogBlock {
                name: Some(name.clone()),
                header: Some(line.clone()),
                lines: Vec::new(),
            }),
            _ => match blocks.last_mut() {
                Some(block) => block.lines.push(line.clone()),
                None => blocks.push(LogBlock {
                    name: None,
                    header: None,
                    lines: vec![line.clone()],
                }),
            },
        }
    }

    blocks
}
