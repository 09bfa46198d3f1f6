//! JSON messages exchanged between pipeline stages.
//!
//! The tap publishes [`StreamChunk`]s, the parser publishes [`Envelope`]s and the
//! delivery side turns envelopes back into [`ParsedRecord`]s after validating them.

use crate::fingerprint::fingerprint;
use crate::record::{DateParts, ParsedRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Raw output of a remote command, relayed unparsed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    #[serde(default)]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end_of_stream: bool,
    /// Identifies one run of the tap; a new value means the previous run ended,
    /// possibly without an end-of-stream marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl StreamChunk {
    pub fn data(contents: impl Into<String>) -> Self {
        Self {
            contents: Some(contents.into()),
            ..Self::default()
        }
    }

    pub fn end() -> Self {
        Self {
            contents: Some(String::new()),
            end_of_stream: true,
            session: None,
        }
    }

    pub fn in_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// A chunk without `contents` is rejected; the parser must not guess.
    pub fn decode(payload: &str) -> Result<Self, InvalidEnvelope> {
        let chunk: Self = serde_json::from_str(payload)
            .map_err(|err| InvalidEnvelope::Undecodable(err.to_string()))?;
        if chunk.contents.is_none() {
            return Err(InvalidEnvelope::MissingField("contents"));
        }
        Ok(chunk)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn contents(&self) -> &str {
        self.contents.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub millisecond: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    /// Format-specific fields such as `error_level` or `component_path`.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidEnvelope {
    #[error("undecodable envelope: {0}")]
    Undecodable(String),
    #[error("envelope is missing required field {0}")]
    MissingField(&'static str),
    #[error("field {field} is not a number: {value}")]
    NotANumber { field: &'static str, value: String },
    #[error("date parts do not form a valid timestamp")]
    InvalidDate,
}

impl Envelope {
    pub fn from_record(record: &ParsedRecord) -> Self {
        let date = record.date;
        Self {
            contents: Some(record.contents.clone()),
            year: Some(date.year.to_string()),
            month: Some(date.month.to_string()),
            day: Some(date.day.to_string()),
            hour: Some(date.hour.to_string()),
            minute: Some(date.minute.to_string()),
            second: Some(date.second.to_string()),
            millisecond: date.millisecond.map(|ms| ms.to_string()),
            contents_hash: Some(record.fingerprint.clone()),
            keywords: Some(record.keywords.iter().cloned().collect()),
            fields: record
                .metadata
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect(),
        }
    }

    pub fn decode(payload: &str) -> Result<Self, InvalidEnvelope> {
        serde_json::from_str(payload).map_err(|err| InvalidEnvelope::Undecodable(err.to_string()))
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Validate the required fields and rebuild the record.
    ///
    /// A missing `contents_hash` is recomputed so every stored document carries one.
    pub fn into_record(self) -> Result<ParsedRecord, InvalidEnvelope> {
        let contents = self
            .contents
            .ok_or(InvalidEnvelope::MissingField("contents"))?;
        let date = DateParts {
            year: required_number("year", self.year)?,
            month: required_number("month", self.month)?,
            day: required_number("day", self.day)?,
            hour: required_number("hour", self.hour)?,
            minute: required_number("minute", self.minute)?,
            second: required_number("second", self.second)?,
            millisecond: self
                .millisecond
                .map(|ms| parse_number("millisecond", &ms))
                .transpose()?,
        };
        if date.to_datetime().is_none() {
            return Err(InvalidEnvelope::InvalidDate);
        }

        let fingerprint = self
            .contents_hash
            .filter(|hash| !hash.is_empty())
            .unwrap_or_else(|| fingerprint(&contents));
        let keywords: BTreeSet<String> = self.keywords.unwrap_or_default().into_iter().collect();
        let metadata = self
            .fields
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| match value {
                Value::String(text) => (key, text),
                other => (key, other.to_string()),
            })
            .collect();

        Ok(ParsedRecord {
            contents,
            fingerprint,
            date,
            keywords,
            metadata,
        })
    }
}

fn required_number<T: std::str::FromStr>(
    field: &'static str,
    value: Option<String>,
) -> Result<T, InvalidEnvelope> {
    let value = value.ok_or(InvalidEnvelope::MissingField(field))?;
    parse_number(field, &value)
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, InvalidEnvelope> {
    value
        .trim()
        .parse()
        .map_err(|_| InvalidEnvelope::NotANumber {
            field,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ParsedRecord {
        let date = DateParts {
            year: 2012,
            month: 3,
            day: 1,
            hour: 11,
            minute: 37,
            second: 20,
            millisecond: Some(272),
        };
        let keywords = ["socket".to_string()].into_iter().collect();
        ParsedRecord::new("socket refused".to_string(), date, keywords)
            .with_field("error_level", "error")
    }

    #[test]
    fn stream_chunks_require_contents() {
        let chunk = StreamChunk::decode(r#"{"contents": "Mar  1 11:37:20 jabbah2 up\n"}"#)
            .expect("valid chunk");
        assert_eq!(chunk.contents(), "Mar  1 11:37:20 jabbah2 up\n");
        assert!(!chunk.end_of_stream);

        let end = StreamChunk::decode(&StreamChunk::end().encode().expect("encode")).expect("valid end");
        assert!(end.end_of_stream);

        assert_eq!(
            StreamChunk::decode(r#"{"data": "x"}"#),
            Err(InvalidEnvelope::MissingField("contents"))
        );
        assert!(matches!(
            StreamChunk::decode("not json"),
            Err(InvalidEnvelope::Undecodable(_))
        ));
    }

    #[test]
    fn record_survives_the_wire() {
        let record = sample_record();
        let payload = Envelope::from_record(&record).encode().expect("should encode");
        let decoded = Envelope::decode(&payload)
            .and_then(Envelope::into_record)
            .expect("should decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn date_parts_travel_as_strings() {
        let payload = Envelope::from_record(&sample_record()).encode().expect("should encode");
        let value: Value = serde_json::from_str(&payload).expect("valid json");
        assert_eq!(value["year"], "2012");
        assert_eq!(value["error_level"], "error");
    }

    #[test]
    fn missing_date_field_is_rejected() {
        let payload = r#"{"contents":"x","year":"2012","month":"3","day":"1","hour":"1","minute":"2"}"#;
        let err = Envelope::decode(payload)
            .and_then(Envelope::into_record)
            .expect_err("should reject");
        assert_eq!(err, InvalidEnvelope::MissingField("second"));
    }

    #[test]
    fn missing_contents_is_rejected() {
        let payload = r#"{"year":"2012","month":"3","day":"1","hour":"1","minute":"2","second":"3"}"#;
        let err = Envelope::decode(payload)
            .and_then(Envelope::into_record)
            .expect_err("should reject");
        assert_eq!(err, InvalidEnvelope::MissingField("contents"));
    }

    #[test]
    fn impossible_date_is_rejected() {
        let payload = r#"{"contents":"x","year":"2012","month":"13","day":"1","hour":"1","minute":"2","second":"3"}"#;
        let err = Envelope::decode(payload)
            .and_then(Envelope::into_record)
            .expect_err("should reject");
        assert_eq!(err, InvalidEnvelope::InvalidDate);
    }

    #[test]
    fn missing_hash_is_recomputed() {
        let payload = r#"{"contents":"x","year":"2012","month":"3","day":"1","hour":"1","minute":"2","second":"3"}"#;
        let record = Envelope::decode(payload)
            .and_then(Envelope::into_record)
            .expect("should decode");
        assert_eq!(record.fingerprint, fingerprint("x"));
    }

    #[test]
    fn garbage_is_undecodable() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(InvalidEnvelope::Undecodable(_))
        ));
    }

    #[test]
    fn end_of_stream_marker_round_trips() {
        let json = serde_json::to_string(&StreamChunk::end()).expect("should encode");
        let chunk: StreamChunk = serde_json::from_str(&json).expect("should decode");
        assert!(chunk.end_of_stream);

        let chunk: StreamChunk = serde_json::from_str(r#"{"contents":"a\n"}"#).expect("should decode");
        assert!(!chunk.end_of_stream);
    }
}
