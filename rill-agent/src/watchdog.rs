//! Log rotation detection from periodic inode readings.
//!
//! The remote watchdog command prints a timestamp line followed by the inode of the
//! tailed path, once per second. Two consecutive readings that are both present and
//! differ mean the file was replaced under the tail session.

use crate::metrics::ROTATIONS_TOTAL;
use crate::parsers::{line_preview, LINE_PREVIEW_LIMIT};
use chrono::NaiveDateTime;
use tracing::{debug, info};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    pub previous_inode: String,
    pub current_inode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogLine {
    Timestamp,
    Inode(String),
    Malformed,
}

pub fn classify(line: &str) -> WatchdogLine {
    let line = line.trim();
    if !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()) {
        return WatchdogLine::Inode(line.to_string());
    }
    if NaiveDateTime::parse_from_str(line, TIMESTAMP_FORMAT).is_ok() {
        return WatchdogLine::Timestamp;
    }
    WatchdogLine::Malformed
}

#[derive(Debug, Default)]
pub struct RotationWatchdog {
    last_known_inode: Option<String>,
}

impl RotationWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_known_inode(&self) -> Option<&str> {
        self.last_known_inode.as_deref()
    }

    /// Forget the baseline, e.g. when the watchdog process is restarted.
    pub fn reset(&mut self) {
        self.last_known_inode = None;
    }

    /// Feed one line of watchdog output. Malformed lines never count as a reading.
    pub fn observe_line(&mut self, line: &str) -> Option<RotationEvent> {
        match classify(line) {
            WatchdogLine::Timestamp => None,
            WatchdogLine::Malformed => {
                debug!(line = %line_preview(line, LINE_PREVIEW_LIMIT), "ignoring malformed watchdog output");
                None
            }
            WatchdogLine::Inode(current) => {
                let previous = self.last_known_inode.replace(current.clone());
                match previous {
                    Some(previous) if previous != current => {
                        ROTATIONS_TOTAL.inc();
                        info!(previous_inode = %previous, current_inode = %current, "log rotation detected");
                        Some(RotationEvent {
                            previous_inode: previous,
                            current_inode: current,
                        })
                    }
                    _ => None,
                }
            }
        }
    }
}
