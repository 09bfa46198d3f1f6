//! Single-line syslog style formats.
//!
//! Every variant starts with `Mon DD HH:MM:SS host` and carries no year, so the year
//! is taken from the parser's reference date.

use super::tokenize::keywords;
use super::{month_from_name, reference_date, ParseOutcome, Parser};
use crate::record::{DateParts, ParsedRecord};
use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

const MONTH: &str = r"(Jan(?:uary)?|Feb(?:ruary)?|Mar(?:ch)?|Apr(?:il)?|May|June?|July?|Aug(?:ust)?|Sept?(?:ember)?|Oct(?:ober)?|Nov(?:ember)?|Dec(?:ember)?)";
const STAMP: &str = r"\s+(\d{1,2})\s+(\d{1,2}):(\d{2}):(\d{2})\s+(\S+)";

lazy_static! {
    static ref MESSAGES_LINE: Regex =
        Regex::new(&format!(r"(?i)^\s*{MONTH}{STAMP}\s+(.*)$")).unwrap();
    // host, EP, time, log id, severity, logger id with stars, component id, rest
    static ref EP_LINE: Regex = Regex::new(&format!(
        r"(?i)^\s*{MONTH}{STAMP}\s+\S+\s+\S+\s+(\S+)\s+\S+\s+(\S+)\s+(\S+)\s+(.*)$"
    ))
    .unwrap();
    static ref SHM_LINE: Regex = Regex::new(&format!(
        r"(?i)^\s*{MONTH}{STAMP}\s+([a-z][a-z.\d-]*\.[a-z-]+)\s+(.*)$"
    ))
    .unwrap();
    static ref BRACKETED: Regex = Regex::new(r"\[(.*?)\]").unwrap();
}

const FAILED_MARKER: &str = "failed: ";
const UNHANDLED_MARKER: &str = "Unhandled exception. ";
const TOTAL_MARKER: &str = ".  Total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyslogVariant {
    /// Plain `/var/log/messages`.
    Messages,
    /// Embedded platform log with severity stars and source locations.
    Ep,
    /// Management server messages that report failures.
    MsMessages,
    /// Shelf manager messages with a dotted facility after the host.
    ShmMessages,
}

impl SyslogVariant {
    fn name(self) -> &'static str {
        match self {
            SyslogVariant::Messages => "messages",
            SyslogVariant::Ep => "ep",
            SyslogVariant::MsMessages => "ms_messages",
            SyslogVariant::ShmMessages => "shm_messages",
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            SyslogVariant::Messages | SyslogVariant::MsMessages => &MESSAGES_LINE,
            SyslogVariant::Ep => &EP_LINE,
            SyslogVariant::ShmMessages => &SHM_LINE,
        }
    }
}

pub struct SyslogParser {
    variant: SyslogVariant,
    pinned_date: Option<NaiveDate>,
}

impl SyslogParser {
    pub fn new(variant: SyslogVariant) -> Self {
        Self {
            variant,
            pinned_date: None,
        }
    }

    /// Use a fixed date for year inference instead of the wall clock.
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.pinned_date = Some(date);
        self
    }

    fn date_parts(&self, caps: &Captures<'_>) -> Option<DateParts> {
        let year = reference_date(self.pinned_date).year();
        let month = month_from_name(&caps[1])?;
        let day: u32 = caps[2].parse().ok()?;
        let hour: u32 = caps[3].parse().ok()?;
        let minute: u32 = caps[4].parse().ok()?;
        let second: u32 = caps[5].parse().ok()?;
        let datetime = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
        Some(DateParts::from_datetime(datetime, None))
    }
}

impl Parser for SyslogParser {
    fn name(&self) -> &'static str {
        self.variant.name()
    }

    fn indexed_fields(&self) -> &'static [&'static str] {
        match self.variant {
            SyslogVariant::Ep => &["error_level", "error_id"],
            SyslogVariant::MsMessages => &["failure_type", "failure_id"],
            SyslogVariant::Messages | SyslogVariant::ShmMessages => &[],
        }
    }

    fn parse_line(&mut self, line: &str) -> ParseOutcome {
        let Some(caps) = self.variant.pattern().captures(line) else {
            return ParseOutcome::Invalid(format!("line does not match {} layout", self.name()));
        };
        let Some(date) = self.date_parts(&caps) else {
            return ParseOutcome::Invalid("timestamp is not a valid date".to_string());
        };

        let record = match self.variant {
            SyslogVariant::Messages => ParsedRecord::new(line.to_string(), date, keywords(&caps[7])),
            SyslogVariant::MsMessages => {
                let record = ParsedRecord::new(line.to_string(), date, keywords(&caps[7]));
                match ms_failure(line) {
                    Some((failure_type, failure_id)) => record
                        .with_field("failure_type", failure_type)
                        .with_field("failure_id", failure_id),
                    None => record,
                }
            }
            SyslogVariant::ShmMessages => {
                ParsedRecord::new(line.to_string(), date, keywords(&caps[8]))
                    .with_field("facility", &caps[7])
            }
            SyslogVariant::Ep => {
                let rest = &caps[10];
                let record = ParsedRecord::new(line.to_string(), date, keywords(rest))
                    .with_field("log_id", &caps[7])
                    .with_field("component_id", &caps[9]);
                match ep_error(&caps[8], rest) {
                    Some((level, error_id)) => record
                        .with_field("error_level", level)
                        .with_field("error_id", error_id),
                    None => record,
                }
            }
        };

        ParseOutcome::Record(record)
    }
}

/// `**` marks an error and `*` a warning; only source locations count as error ids.
fn ep_error(logger_id: &str, rest: &str) -> Option<(&'static str, String)> {
    let level = if logger_id.starts_with("**") {
        "error"
    } else if logger_id.starts_with('*') {
        "warning"
    } else {
        return None;
    };
    let error_id = BRACKETED.captures(rest)?.get(1)?.as_str();
    error_id
        .contains(".cpp:")
        .then(|| (level, error_id.to_string()))
}

fn ms_failure(contents: &str) -> Option<(String, String)> {
    if let Some((before, after)) = contents.split_once(FAILED_MARKER) {
        let failure_type = before
            .trim()
            .rsplit(']')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let mut failure_id = after.trim();
        if let Some((id, _)) = failure_id.split_once(TOTAL_MARKER) {
            failure_id = id;
        }
        return Some((failure_type, failure_id.to_string()));
    }

    if contents.contains(UNHANDLED_MARKER) {
        let tail = contents.rsplit(']').next().unwrap_or_default().trim();
        let failure_id = tail.rsplit(UNHANDLED_MARKER).next().unwrap_or_default().trim();
        return Some(("Unhandled exception".to_string(), failure_id.to_string()));
    }

    None
}
