use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Where a pushed frame ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    Memory,
    Spilled,
    /// Both the memory queue and the spill file are at capacity; the frame is handed back.
    Full(Bytes),
}

/// FIFO of frames that overflows from memory to a bounded file on disk.
///
/// Once anything has been spilled, new frames also go to disk until the file has
/// been read back completely, so ordering is preserved across both tiers.
#[derive(Debug)]
pub struct SpillQueue {
    memory: VecDeque<Bytes>,
    high_water_mark: usize,
    dir: PathBuf,
    max_spill_bytes: u64,
    spill: Option<SpillFile>,
}

#[derive(Debug)]
struct SpillFile {
    path: PathBuf,
    writer: File,
    reader: BufReader<File>,
    written: u64,
    pending: usize,
}

impl SpillFile {
    fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.spill", Uuid::new_v4()));
        let writer = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        let reader = BufReader::new(File::open(&path)?);
        debug!(path = %path.display(), "opened bus spill file");
        Ok(Self {
            path,
            writer,
            reader,
            written: 0,
            pending: 0,
        })
    }

    fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        let len = u32::try_from(frame.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large to spill"))?;
        let mut record = Vec::with_capacity(frame.len() + 4);
        record.extend_from_slice(&len.to_be_bytes());
        record.extend_from_slice(frame);
        self.writer.write_all(&record)?;
        self.written += record.len() as u64;
        self.pending += 1;
        Ok(())
    }

    fn read_next(&mut self) -> io::Result<Bytes> {
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        self.reader.read_exact(&mut frame)?;
        self.pending -= 1;
        Ok(Bytes::from(frame))
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %err, "failed to remove spill file");
        }
    }
}

impl SpillQueue {
    pub fn new(high_water_mark: usize, dir: PathBuf, max_spill_bytes: u64) -> Self {
        Self {
            memory: VecDeque::new(),
            high_water_mark: high_water_mark.max(1),
            dir,
            max_spill_bytes,
            spill: None,
        }
    }

    pub fn push(&mut self, frame: Bytes) -> io::Result<Push> {
        if self.spill.is_none() && self.memory.len() < self.high_water_mark {
            self.memory.push_back(frame);
            return Ok(Push::Memory);
        }

        let spill = match self.spill.as_mut() {
            Some(spill) => spill,
            None => self.spill.insert(SpillFile::create(&self.dir)?),
        };
        if spill.written + frame.len() as u64 + 4 > self.max_spill_bytes {
            return Ok(Push::Full(frame));
        }
        spill.append(&frame)?;
        Ok(Push::Spilled)
    }

    pub fn pop(&mut self) -> io::Result<Option<Bytes>> {
        if self.memory.is_empty() {
            self.refill()?;
        }
        Ok(self.memory.pop_front())
    }

    fn refill(&mut self) -> io::Result<()> {
        let Some(spill) = self.spill.as_mut() else {
            return Ok(());
        };
        while self.memory.len() < self.high_water_mark && spill.pending > 0 {
            self.memory.push_back(spill.read_next()?);
        }
        if spill.pending == 0 {
            self.spill = None;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.spilled()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames currently waiting on disk.
    pub fn spilled(&self) -> usize {
        self.spill.as_ref().map(|spill| spill.pending).unwrap_or(0)
    }
}
