//! Process stdout captures: `17-Apr-2012, 10:32:37.037 UTC` opens a block.

use super::block::BlockFormat;
use super::month_from_name;
use crate::record::DateParts;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref BLOCK_START: Regex = Regex::new(
        r"(?i)^\s*(\d{1,2})[-/.]([a-z]{3,9})[-/.](\d{4}),\s+(\d{1,2}):(\d{2}):(\d{2})(?:\.(\d{3}))?"
    )
    .unwrap();
}

const SKIPPED_PREFIXES: &[&str] = &["===", "Ctrl portion of IPS with cxs_corr"];

#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutFormat;

impl BlockFormat for StdoutFormat {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn is_block_start(&self, line: &str) -> bool {
        BLOCK_START.is_match(line)
    }

    fn is_skipped(&self, line: &str) -> bool {
        SKIPPED_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
    }

    fn header_date(&self, header: &str, _today: NaiveDate) -> Option<DateParts> {
        let caps = BLOCK_START.captures(header)?;
        let day: u32 = caps[1].parse().ok()?;
        let month = month_from_name(&caps[2])?;
        let year: i32 = caps[3].parse().ok()?;
        let hour: u32 = caps[4].parse().ok()?;
        let minute: u32 = caps[5].parse().ok()?;
        let second: u32 = caps[6].parse().ok()?;
        let millisecond = match caps.get(7) {
            Some(ms) => Some(ms.as_str().parse().ok()?),
            None => None,
        };
        let datetime = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_milli_opt(
            hour,
            minute,
            second,
            millisecond.unwrap_or(0),
        )?;
        Some(DateParts::from_datetime(datetime, millisecond))
    }
}
