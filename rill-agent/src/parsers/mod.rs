use crate::record::ParsedRecord;
use anyhow::{anyhow, Result};
use chrono::{NaiveDate, Utc};

pub mod block;
pub mod hpilist;
pub mod stdout;
pub mod syslog;
pub mod tokenize;

pub use block::{BlockFormat, BlockParser};
pub use hpilist::HpilistFormat;
pub use stdout::StdoutFormat;
pub use syslog::{SyslogParser, SyslogVariant};

pub const LINE_PREVIEW_LIMIT: usize = 256;

/// Result of feeding one reassembled line to a parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A complete record. Block parsers emit the previous block when a new one starts.
    Record(ParsedRecord),
    /// The line was absorbed into a block that is still open.
    Incomplete,
    /// The line can never become a record and has been discarded.
    Invalid(String),
}

/// State machine that converts reassembled lines into `ParsedRecord`s.
///
/// Single-line formats answer every line with `Record` or `Invalid`. Block formats keep
/// the lines of the open block as excess until the next block start or `finish`.
///
/// # Examples
///
/// ```
/// use rill_agent::parsers::{route_parser, ParseOutcome};
///
/// let mut parser = route_parser("messages").unwrap();
/// let outcome = parser.parse_line("Feb 28 23:30:51 jabbah getpstack.sh: pstack complete");
/// assert!(matches!(outcome, ParseOutcome::Record(_)));
/// ```
pub trait Parser: Send {
    /// Format name as used on the command line and in configuration.
    fn name(&self) -> &'static str;

    /// Document fields worth a `(field, datetime)` index in the store.
    fn indexed_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn parse_line(&mut self, line: &str) -> ParseOutcome;

    /// Close whatever is still buffered because the input ended.
    fn finish(&mut self) -> Option<ParseOutcome> {
        None
    }

    /// Number of lines held back waiting for more input.
    fn excess_len(&self) -> usize {
        0
    }

    fn consume(&mut self, lines: &[String]) -> Vec<ParseOutcome> {
        lines.iter().map(|line| self.parse_line(line)).collect()
    }
}

pub const FORMATS: &[&str] = &[
    "messages",
    "ep",
    "ms_messages",
    "shm_messages",
    "stdout",
    "hpilist",
];

pub fn route_parser(format: &str) -> Result<Box<dyn Parser>> {
    match format {
        "messages" => Ok(Box::new(SyslogParser::new(SyslogVariant::Messages))),
        "ep" => Ok(Box::new(SyslogParser::new(SyslogVariant::Ep))),
        "ms_messages" => Ok(Box::new(SyslogParser::new(SyslogVariant::MsMessages))),
        "shm_messages" => Ok(Box::new(SyslogParser::new(SyslogVariant::ShmMessages))),
        "stdout" => Ok(Box::new(BlockParser::new(StdoutFormat))),
        "hpilist" => Ok(Box::new(BlockParser::new(HpilistFormat))),
        other => Err(anyhow!(
            "no parser registered for format {other}; expected one of {}",
            FORMATS.join(", ")
        )),
    }
}

/// Index fields for `format`, or none when the format is unknown.
pub fn indexed_fields_for(format: &str) -> Vec<String> {
    route_parser(format)
        .map(|parser| {
            parser
                .indexed_fields()
                .iter()
                .map(|field| field.to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn month_from_name(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_ascii_lowercase();
    let month = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Today's date for formats that omit the year or the whole date.
///
/// Lines written just before midnight on December 31st and read after it get the new
/// year, and a February 29th line is rejected outside leap years.
pub(crate) fn reference_date(pinned: Option<NaiveDate>) -> NaiveDate {
    pinned.unwrap_or_else(|| Utc::now().date_naive())
}

/// Creates a preview string truncated at `limit` characters with an ellipsis.
/// Used for logging raw line content without overwhelming the logs.
pub fn line_preview(line: &str, limit: usize) -> String {
    let mut preview = String::new();
    for (idx, ch) in line.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_format_routes() {
        for format in FORMATS {
            let parser = route_parser(format).expect("format should route");
            assert_eq!(parser.name(), *format);
        }
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = route_parser("nginx").err().expect("should fail");
        assert!(err.to_string().contains("nginx"));
    }

    #[test]
    fn month_names_accept_long_and_short_forms() {
        assert_eq!(month_from_name("Sept"), Some(9));
        assert_eq!(month_from_name("december"), Some(12));
        assert_eq!(month_from_name("Foo"), None);
    }

    #[test]
    fn preview_truncates_long_lines() {
        let line = "x".repeat(10);
        assert_eq!(line_preview(&line, 4), "xxxx…");
        assert_eq!(line_preview("short", 10), "short");
    }

    #[test]
    fn indexed_fields_follow_the_format() {
        assert_eq!(indexed_fields_for("ep"), vec!["error_level", "error_id"]);
        assert!(indexed_fields_for("messages").is_empty());
        assert!(indexed_fields_for("unknown").is_empty());
    }
}
