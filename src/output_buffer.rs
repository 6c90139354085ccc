//! Line buffer for captured console output.
//!
//! Output arrives in arbitrarily sized chunks. The buffer keeps every
//! finalized line (a newline was seen) plus one open line that is still
//! receiving bytes. Lines are carriage-collapsed when they are finalized so
//! progress bars resolve to their last redraw.

use std::ops::Range;

/// Resolves carriage returns the way a terminal row would end up looking:
/// only the text written after the last `\r` survives. Trailing `\r`s do not
/// move anything on screen, so `"done\r"` (a CRLF line ending) stays `"done"`.
pub fn clear_carriage(raw: &str) -> &str {
    let trimmed = raw.trim_end_matches('\r');
    match trimmed.rfind('\r') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

#[derive(Debug, Default)]
pub struct OutputBuffer {
    lines: Vec<String>,
    open: String,
    // Incomplete UTF-8 sequence carried over from the previous chunk.
    pending: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw chunk and returns the index range of the lines it
    /// finalized (possibly empty).
    pub fn append(&mut self, chunk: &[u8]) -> Range<usize> {
        let start = self.lines.len();
        let text = self.decode(chunk);
        let mut segments = text.split('\n');
        if let Some(first) = segments.next() {
            self.open.push_str(first);
        }
        for segment in segments {
            self.finalize_open();
            self.open.push_str(segment);
        }
        start..self.lines.len()
    }

    /// Finalizes whatever is left in the open line. Used once the stream is
    /// over so the last unterminated line is not lost.
    pub fn finish(&mut self) -> Range<usize> {
        let start = self.lines.len();
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.open.push_str(&String::from_utf8_lossy(&rest));
        }
        if !self.open.is_empty() {
            self.finalize_open();
        }
        start..self.lines.len()
    }

    pub fn finalized_len(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Finalized lines at or after `cursor`.
    pub fn lines_from(&self, cursor: usize) -> &[String] {
        &self.lines[cursor.min(self.lines.len())..]
    }

    /// Display form of the open line.
    pub fn tail(&self) -> &str {
        clear_carriage(&self.open)
    }

    /// Raw (uncollapsed) open line.
    pub fn open_raw(&self) -> &str {
        &self.open
    }

    fn finalize_open(&mut self) {
        let line = clear_carriage(&self.open).to_string();
        self.lines.push(line);
        self.open.clear();
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }
}
