//! Format parser executable: tap chunks in, envelopes out.

use crate::bus::{BusSettings, Message, Publisher, Subscriber};
use crate::envelope::{Envelope, StreamChunk};
use crate::metrics::{LINES_INVALID_TOTAL, RECORDS_PARSED_TOTAL};
use crate::parsers::{line_preview, route_parser, ParseOutcome, Parser, LINE_PREVIEW_LIMIT};
use super::TapStream;
use crate::record::ParsedRecord;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const INPUT_CHANNEL_CAPACITY: usize = 1_024;
const LINGER: Duration = Duration::from_secs(5);

/// Reassembly and parsing of one tap stream.
pub struct ParseStage {
    stream: TapStream,
    parser: Box<dyn Parser>,
}

impl ParseStage {
    pub fn new(format: &str) -> Result<Self> {
        Ok(Self {
            stream: TapStream::new(),
            parser: route_parser(format)?,
        })
    }

    pub fn format(&self) -> &'static str {
        self.parser.name()
    }

    /// Decode one bus payload and return the records it completed.
    pub fn process(&mut self, payload: &str) -> Vec<ParsedRecord> {
        let chunk = match StreamChunk::decode(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(
                    error = %err,
                    payload = %line_preview(payload, LINE_PREVIEW_LIMIT),
                    "dropping invalid stream chunk"
                );
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        if self.stream.switch_session(&chunk) {
            // The previous run died without an end marker; its open block is complete
            // as far as it will ever get.
            outcomes.extend(self.parser.finish());
            debug!(format = self.format(), "tap session changed");
        }

        let lines = self.stream.lines(&chunk);
        outcomes.extend(self.parser.consume(&lines));
        if chunk.end_of_stream {
            outcomes.extend(self.parser.finish());
            debug!(format = self.format(), "end of stream");
        }

        let format = self.format();
        outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                ParseOutcome::Record(record) => {
                    RECORDS_PARSED_TOTAL.with_label_values(&[format]).inc();
                    Some(record)
                }
                ParseOutcome::Incomplete => None,
                ParseOutcome::Invalid(reason) => {
                    LINES_INVALID_TOTAL.with_label_values(&[format]).inc();
                    debug!(format, reason = %reason, "discarding unparseable input");
                    None
                }
            })
            .collect()
    }
}

pub async fn run(
    format: &str,
    input: &str,
    output: &str,
    settings: BusSettings,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut stage = ParseStage::new(format)?;
    let publisher = Publisher::bind(output, settings, &cancel_token).await?;
    let mut subscriber = Subscriber::connect(input, Vec::new(), INPUT_CHANNEL_CAPACITY, &cancel_token)?;
    info!(format = stage.format(), input, output, "parser started");

    let mut published: u64 = 0;
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            message = subscriber.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        for record in stage.process(message.payload()) {
            let payload = Envelope::from_record(&record)
                .encode()
                .context("failed to encode envelope")?;
            publisher.publish(&Message::single(payload)).await?;
            published += 1;
        }
    }

    info!(format = stage.format(), published, "parser stopping");
    publisher.drain(LINGER).await;
    Ok(())
}
