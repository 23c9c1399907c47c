use crate::error::FrameError;
use crate::protocol::init_session_id;
use serde_json::Value;

pub const DEFAULT_MAX_RECORD_BYTES: usize = 8 * 1024 * 1024;

/// One newline-delimited record from an agent's stdout. The raw text is
/// always forwarded as-is; `value` is only present when the line happened to
/// be JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    raw: String,
    value: Option<Value>,
}

impl Record {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(bytes).into_owned();
        let value = serde_json::from_str::<Value>(&raw).ok();
        Self { raw, value }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_structured(&self) -> bool {
        self.value.is_some()
    }

    /// Empty or whitespace-only line. Still a record; consumers decide
    /// whether it is worth relaying.
    pub fn is_blank(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// Session id carried by a `system`/`init` record, if this is one.
    pub fn session_id(&self) -> Option<&str> {
        self.value.as_ref().and_then(init_session_id)
    }

    pub fn into_raw(self) -> String {
        self.raw
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedReport {
    pub records: Vec<Record>,
    pub errors: Vec<FrameError>,
}

impl FeedReport {
    fn push_record(&mut self, record: Record) {
        if !record.is_structured() && !record.is_blank() {
            self.errors.push(FrameError::Desync(truncate_for_log(record.raw())));
        }
        self.records.push(record);
    }
}

/// Splits an arbitrary byte stream into newline-terminated records, keeping
/// the incomplete tail between calls.
#[derive(Debug)]
pub struct LineReassembler {
    max_record_bytes: usize,
    pending: Vec<u8>,
}

impl LineReassembler {
    pub fn new(max_record_bytes: usize) -> Self {
        Self {
            max_record_bytes,
            pending: Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> FeedReport {
        let mut report = FeedReport::default();
        if chunk.is_empty() {
            return report;
        }

        // Only the new bytes can contain a delimiter we have not seen yet.
        let mut search_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        while let Some(offset) = self.pending[search_from..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let newline_idx = search_from + offset;
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            search_from = 0;
            report.push_record(Record::from_bytes(&line));
        }

        // A runaway line without a delimiter is forwarded rather than dropped.
        if self.pending.len() > self.max_record_bytes {
            report.errors.push(FrameError::OversizedRecord {
                size: self.pending.len(),
                max: self.max_record_bytes,
            });
            let line = std::mem::take(&mut self.pending);
            report.push_record(Record::from_bytes(&line));
        }

        report
    }

    /// Drains whatever is left once the source has closed, even without a
    /// trailing delimiter.
    pub fn flush(&mut self) -> Option<Record> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(Record::from_bytes(&line))
    }
}

impl Default for LineReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_BYTES)
    }
}

/// Decodes a byte stream as UTF-8 without splitting multi-byte characters
/// that straddle chunk boundaries.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // valid_up_to guarantees this prefix decodes.
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

fn truncate_for_log(raw: &str) -> String {
    const LIMIT: usize = 120;
    if raw.len() <= LIMIT {
        return raw.to_string();
    }
    let mut end = LIMIT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}
