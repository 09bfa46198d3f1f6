//! Arrival-ordered batching between parsing and storage.
//!
//! Records are queued by arrival time and leave in batches of at most `chunk_size`,
//! either as soon as more than `chunk_size` are waiting or once the oldest one has
//! waited `insert_interval`. A batch is never dropped: when the store refuses it the
//! entries go back in with their original arrival time.

use crate::config::AccumulatorConfig;
use crate::record::ParsedRecord;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// Records dated outside `[now - max_age, now + max_future]` are never queued.
#[derive(Debug, Clone, Copy)]
pub struct AcceptanceWindow {
    pub max_age: ChronoDuration,
    pub max_future: ChronoDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    TooOld,
    TooNew,
    /// The date parts do not assemble into a real timestamp.
    InvalidDate,
}

impl Admission {
    pub fn as_str(self) -> &'static str {
        match self {
            Admission::Queued => "queued",
            Admission::TooOld => "too_old",
            Admission::TooNew => "too_new",
            Admission::InvalidDate => "invalid_date",
        }
    }
}

impl AcceptanceWindow {
    pub fn from_days(max_age_days: i64, max_future_days: i64) -> Self {
        Self {
            max_age: ChronoDuration::days(max_age_days),
            max_future: ChronoDuration::days(max_future_days),
        }
    }

    pub fn bounds(&self, now: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        (now - self.max_age, now + self.max_future)
    }

    pub fn admit(&self, timestamp: NaiveDateTime, now: NaiveDateTime) -> Admission {
        let (oldest, newest) = self.bounds(now);
        if timestamp < oldest {
            Admission::TooOld
        } else if timestamp > newest {
            Admission::TooNew
        } else {
            Admission::Queued
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Age,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Age => "age",
        }
    }
}

#[derive(Debug)]
pub struct AccumulatorEntry {
    pub arrival: Instant,
    seq: u64,
    pub record: ParsedRecord,
}

impl PartialEq for AccumulatorEntry {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival && self.seq == other.seq
    }
}

impl Eq for AccumulatorEntry {}

impl PartialOrd for AccumulatorEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AccumulatorEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.arrival
            .cmp(&other.arrival)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
pub struct Batch {
    pub trigger: FlushTrigger,
    pub entries: Vec<AccumulatorEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ParsedRecord> {
        self.entries.iter().map(|entry| &entry.record)
    }
}

#[derive(Debug)]
pub struct Accumulator {
    heap: BinaryHeap<Reverse<AccumulatorEntry>>,
    next_seq: u64,
    chunk_size: usize,
    insert_interval: Duration,
    window: AcceptanceWindow,
    paused_until: Option<Instant>,
}

impl Accumulator {
    pub fn new(chunk_size: usize, insert_interval: Duration, window: AcceptanceWindow) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            chunk_size: chunk_size.max(1),
            insert_interval,
            window,
            paused_until: None,
        }
    }

    pub fn from_config(config: &AccumulatorConfig, chunk_size: usize, insert_interval: Duration) -> Self {
        Self::new(
            chunk_size,
            insert_interval,
            AcceptanceWindow::from_days(config.max_age_days, config.max_future_days),
        )
    }

    pub fn window(&self) -> AcceptanceWindow {
        self.window
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queue `record` if its timestamp falls inside the acceptance window.
    pub fn ingest(&mut self, record: ParsedRecord, now: Instant, wall_now: NaiveDateTime) -> Admission {
        let Some(timestamp) = record.datetime() else {
            return Admission::InvalidDate;
        };
        let admission = self.window.admit(timestamp, wall_now);
        if admission == Admission::Queued {
            self.push(now, record);
        }
        admission
    }

    fn push(&mut self, arrival: Instant, record: ParsedRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(AccumulatorEntry {
            arrival,
            seq,
            record,
        }));
    }

    pub fn due(&self, now: Instant) -> Option<FlushTrigger> {
        if self.paused_until.is_some_and(|until| now < until) {
            return None;
        }
        if self.heap.len() > self.chunk_size {
            return Some(FlushTrigger::Size);
        }
        let Reverse(oldest) = self.heap.peek()?;
        (now.saturating_duration_since(oldest.arrival) >= self.insert_interval)
            .then_some(FlushTrigger::Age)
    }

    /// Remove the oldest entries, at most `chunk_size`, when a trigger fired.
    pub fn take_due(&mut self, now: Instant) -> Option<Batch> {
        let trigger = self.due(now)?;
        self.paused_until = None;
        let count = self.heap.len().min(self.chunk_size);
        let mut entries = Vec::with_capacity(count);
        while entries.len() < count {
            match self.heap.pop() {
                Some(Reverse(entry)) => entries.push(entry),
                None => break,
            }
        }
        Some(Batch { trigger, entries })
    }

    /// Put back a batch the store refused and hold further flushes for one interval.
    pub fn requeue(&mut self, batch: Batch, now: Instant) {
        for entry in batch.entries {
            self.heap.push(Reverse(entry));
        }
        self.paused_until = Some(now + self.insert_interval);
    }

    /// Give back heap capacity left over from a large backlog.
    pub fn release_memory(&mut self) {
        if self.heap.capacity() > self.chunk_size.saturating_mul(2).max(self.heap.len() * 2) {
            self.heap.shrink_to_fit();
        }
    }

    /// Drop everything still queued, returning how many records were lost.
    pub fn abandon(&mut self) -> usize {
        let lost = self.heap.len();
        self.heap = BinaryHeap::new();
        lost
    }
}
