//! Multi-line block parsing.
//!
//! Only the first line of a block carries a timestamp. Every following line belongs to
//! the same block until the next timestamp line, so a block is emitted one block late.

use super::tokenize::keywords;
use super::{reference_date, ParseOutcome, Parser};
use crate::record::{DateParts, ParsedRecord};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Line layout of a block-oriented log.
pub trait BlockFormat: Send {
    fn name(&self) -> &'static str;

    fn indexed_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether `line` opens a new block.
    fn is_block_start(&self, line: &str) -> bool;

    /// Decorative lines that are never part of a record.
    fn is_skipped(&self, _line: &str) -> bool {
        false
    }

    /// Timestamp of the block whose first line is `header`.
    fn header_date(&self, header: &str, today: NaiveDate) -> Option<DateParts>;

    /// Pull format-specific fields out of the block lines.
    fn extract_fields(&self, _lines: &[String], _fields: &mut BTreeMap<String, String>) {}
}

pub struct BlockParser<F: BlockFormat> {
    format: F,
    current_block: Vec<String>,
    in_block: bool,
    pinned_date: Option<NaiveDate>,
}

impl<F: BlockFormat> BlockParser<F> {
    pub fn new(format: F) -> Self {
        Self {
            format,
            current_block: Vec::new(),
            in_block: false,
            pinned_date: None,
        }
    }

    /// Use a fixed date for year and day inference instead of the wall clock.
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.pinned_date = Some(date);
        self
    }

    fn close(&self, lines: Vec<String>) -> ParseOutcome {
        let Some(header) = lines.first() else {
            return ParseOutcome::Invalid("empty block".to_string());
        };
        let Some(date) = self
            .format
            .header_date(header, reference_date(self.pinned_date))
        else {
            return ParseOutcome::Invalid("block header timestamp is not a valid date".to_string());
        };

        let contents = lines.join("\n");
        let tokens = keywords(&contents);
        let mut record = ParsedRecord::new(contents, date, tokens);
        self.format.extract_fields(&lines, &mut record.metadata);
        ParseOutcome::Record(record)
    }
}

impl<F: BlockFormat> Parser for BlockParser<F> {
    fn name(&self) -> &'static str {
        self.format.name()
    }

    fn indexed_fields(&self) -> &'static [&'static str] {
        self.format.indexed_fields()
    }

    fn parse_line(&mut self, line: &str) -> ParseOutcome {
        if self.format.is_skipped(line) {
            return ParseOutcome::Invalid("decorative line".to_string());
        }

        if self.format.is_block_start(line) {
            let finished = std::mem::replace(&mut self.current_block, vec![line.to_string()]);
            if self.in_block {
                return self.close(finished);
            }
            self.in_block = true;
            return ParseOutcome::Incomplete;
        }

        if self.in_block {
            self.current_block.push(line.to_string());
            ParseOutcome::Incomplete
        } else {
            ParseOutcome::Invalid("line precedes the first block".to_string())
        }
    }

    fn finish(&mut self) -> Option<ParseOutcome> {
        if !self.in_block {
            return None;
        }
        self.in_block = false;
        let finished = std::mem::take(&mut self.current_block);
        Some(self.close(finished))
    }

    fn excess_len(&self) -> usize {
        self.current_block.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    struct HashHeader;

    impl BlockFormat for HashHeader {
        fn name(&self) -> &'static str {
            "hash_header"
        }

        fn is_block_start(&self, line: &str) -> bool {
            line.starts_with('#')
        }

        fn is_skipped(&self, line: &str) -> bool {
            line.starts_with("---")
        }

        fn header_date(&self, header: &str, today: NaiveDate) -> Option<DateParts> {
            if header.contains("bad") {
                return None;
            }
            Some(DateParts::from_datetime(today.and_hms_opt(1, 2, 3)?, None))
        }

        fn extract_fields(&self, lines: &[String], fields: &mut BTreeMap<String, String>) {
            fields.insert("line_count".to_string(), lines.len().to_string());
        }
    }

    fn parser() -> BlockParser<HashHeader> {
        BlockParser::new(HashHeader)
            .with_reference_date(NaiveDate::from_ymd_opt(2012, 4, 17).expect("valid date"))
    }

    #[test]
    fn noise_before_first_block_is_discarded() {
        let mut parser = parser();
        assert!(matches!(parser.parse_line("noise"), ParseOutcome::Invalid(_)));
        assert_eq!(parser.excess_len(), 0);
    }

    #[test]
    fn next_header_emits_previous_block() {
        let mut parser = parser();
        assert_eq!(parser.parse_line("# first"), ParseOutcome::Incomplete);
        assert_eq!(parser.parse_line("body one"), ParseOutcome::Incomplete);
        assert_eq!(parser.parse_line("body two"), ParseOutcome::Incomplete);

        let ParseOutcome::Record(record) = parser.parse_line("# second") else {
            panic!("second header should close the first block");
        };
        assert_eq!(record.contents, "# first\nbody one\nbody two");
        assert_eq!(record.metadata["line_count"], "3");
        assert_eq!(record.date.year, 2012);
        assert_eq!(parser.excess_len(), 1);
    }

    #[test]
    fn finish_closes_the_open_block() {
        let mut parser = parser();
        parser.parse_line("# only");
        parser.parse_line("tail");
        let Some(ParseOutcome::Record(record)) = parser.finish() else {
            panic!("finish should emit the open block");
        };
        assert_eq!(record.contents, "# only\ntail");
        assert_eq!(record.datetime().map(|d| d.day()), Some(17));
        assert!(parser.finish().is_none());
    }

    #[test]
    fn decorative_lines_are_not_part_of_the_block() {
        let mut parser = parser();
        parser.parse_line("# first");
        assert!(matches!(parser.parse_line("--- banner"), ParseOutcome::Invalid(_)));
        let Some(ParseOutcome::Record(record)) = parser.finish() else {
            panic!("finish should emit the open block");
        };
        assert_eq!(record.contents, "# first");
    }

    #[test]
    fn bad_header_invalidates_only_its_block() {
        let mut parser = parser();
        parser.parse_line("# bad header");
        assert!(matches!(parser.parse_line("# good"), ParseOutcome::Invalid(_)));
        assert!(matches!(parser.finish(), Some(ParseOutcome::Record(_))));
    }
}
