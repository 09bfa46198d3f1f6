//! Turns an arbitrarily chunked text stream into complete lines.

/// Splits incoming chunks on `\n` and `\r\n`, holding back the trailing fragment.
///
/// The fragment after the last line break is kept as `pending_excess` and prefixed to
/// the next chunk, so the emitted lines do not depend on where the chunk boundaries
/// fell. Empty lines are dropped. A lone `\r` that ends a chunk stays in the excess
/// until the next chunk shows whether it starts a `\r\n` pair.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending_excess: String,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending_excess.push_str(chunk);

        let Some(last_break) = self.pending_excess.rfind('\n') else {
            return Vec::new();
        };

        let excess = self.pending_excess.split_off(last_break + 1);
        let complete = std::mem::replace(&mut self.pending_excess, excess);

        complete
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// The trailing fragment not yet terminated by a line break.
    pub fn pending_excess(&self) -> &str {
        &self.pending_excess
    }

    /// Flush the trailing fragment as a final line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let excess = std::mem::take(&mut self.pending_excess);
        let line = excess.strip_suffix('\r').unwrap_or(&excess);
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}
