//! Barrier coordination wire protocol
//!
//! One JSON object per line over a TCP stream:
//!
//! ```text
//! participant                         coordinator
//!   {"type":"join",...}        ───►
//!                              ◄───   {"type":"joined",...}
//!   {"type":"arrive","step":k} ───►
//!        (blocks)                     (waits for `expected` arrivals)
//!                              ◄───   {"type":"released","step":k}
//!   {"type":"leave",...}       ───►
//! ```
//!
//! If a joined member sends `abort` or drops its connection without `leave`,
//! every remaining member of the path receives `aborted` and the path refuses
//! further steps.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Messages sent by a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        path: String,
        participant: String,
        expected: usize,
    },
    Arrive {
        path: String,
        step: u64,
    },
    Leave {
        path: String,
    },
    /// Give up on `path` after a local failure
    ///
    /// Accepted from connections that never joined `path`, so a participant
    /// failing before its first arrival still stops the others.
    Abort {
        path: String,
        participant: String,
        reason: String,
    },
}

/// Messages sent by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        path: String,
        members: usize,
    },
    Released {
        path: String,
        step: u64,
    },
    Aborted {
        path: String,
        participant: String,
        reason: String,
    },
    Error {
        message: String,
    },
}

/// Encode a message as a single newline-terminated JSON line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line (trailing whitespace is ignored)
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}
