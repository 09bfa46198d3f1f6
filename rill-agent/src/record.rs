use crate::fingerprint::fingerprint;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::collections::{BTreeMap, BTreeSet};

/// Calendar parts of a record timestamp as they appeared in the source log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub millisecond: Option<u32>,
}

impl DateParts {
    pub fn from_datetime(datetime: NaiveDateTime, millisecond: Option<u32>) -> Self {
        Self {
            year: datetime.year(),
            month: datetime.month(),
            day: datetime.day(),
            hour: datetime.hour(),
            minute: datetime.minute(),
            second: datetime.second(),
            millisecond,
        }
    }

    /// Assemble the parts into a timestamp, `None` when they do not name a real instant.
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)?.and_hms_milli_opt(
            self.hour,
            self.minute,
            self.second,
            self.millisecond.unwrap_or(0),
        )
    }
}

/// One log record extracted by a format parser. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub contents: String,
    pub fingerprint: String,
    pub date: DateParts,
    pub keywords: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ParsedRecord {
    pub fn new(contents: String, date: DateParts, keywords: BTreeSet<String>) -> Self {
        Self {
            fingerprint: fingerprint(&contents),
            contents,
            date,
            keywords,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn datetime(&self) -> Option<NaiveDateTime> {
        self.date.to_datetime()
    }
}
