//! Shelf manager hardware event listings.
//!
//! A block opens with `HH:MM:SS.mmm ... Source : N`. The date is not printed, so
//! blocks are stamped with the reference date.

use super::block::BlockFormat;
use crate::record::DateParts;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

lazy_static! {
    static ref BLOCK_START: Regex =
        Regex::new(r"(?i)^(\d{2}):(\d{2}):(\d{2})\.(\d{3}).*Source\s*:").unwrap();
    static ref SOURCE: Regex = Regex::new(r"(?i)Source\s*:\s*(\d+)").unwrap();
    static ref EVENT_TYPE: Regex = Regex::new(r"(?i)EventType\s*:\s*(.*)").unwrap();
    static ref COMPONENT_PATH: Regex = Regex::new(r"(\{.*\})").unwrap();
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HpilistFormat;

impl BlockFormat for HpilistFormat {
    fn name(&self) -> &'static str {
        "hpilist"
    }

    fn indexed_fields(&self) -> &'static [&'static str] {
        &["source", "event_type", "component_path"]
    }

    fn is_block_start(&self, line: &str) -> bool {
        BLOCK_START.is_match(line)
    }

    fn header_date(&self, header: &str, today: NaiveDate) -> Option<DateParts> {
        let caps = BLOCK_START.captures(header)?;
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        let second: u32 = caps[3].parse().ok()?;
        let millisecond: u32 = caps[4].parse().ok()?;
        let datetime = today.and_hms_milli_opt(hour, minute, second, millisecond)?;
        Some(DateParts::from_datetime(datetime, Some(millisecond)))
    }

    // One field per line; a later line overrides an earlier one.
    fn extract_fields(&self, lines: &[String], fields: &mut BTreeMap<String, String>) {
        for line in lines {
            if let Some(caps) = SOURCE.captures(line) {
                fields.insert("source".to_string(), caps[1].to_string());
            } else if let Some(caps) = EVENT_TYPE.captures(line) {
                fields.insert("event_type".to_string(), caps[1].trim().to_string());
            } else if let Some(caps) = COMPONENT_PATH.captures(line) {
                fields.insert("component_path".to_string(), caps[1].to_string());
            }
        }
    }
}
