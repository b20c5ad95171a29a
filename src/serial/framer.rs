//! Incremental line framing for the device's text protocol.
//!
//! Bytes arrive from the port in arbitrary chunks. `LineFramer` keeps the
//! unterminated tail between pushes and yields every complete line in arrival
//! order. Lines end at `\n`; a `\r` directly before it is stripped. A lone
//! `\r` is ordinary data.

/// Persistent decode buffer plus the splitting logic over it.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    decode_errors: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(1024), decode_errors: 0 }
    }

    /// Append `chunk` and return all lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        if chunk.is_empty() {
            return lines;
        }

        // Bytes already buffered were scanned on a previous push.
        let mut scan_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        let mut errors = 0;
        while let Some(pos) = self.buffer[scan_from..].iter().position(|&b| b == b'\n') {
            let end = scan_from + pos;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let (text, lossy) = decode_line(line);
            if lossy {
                errors += 1;
            }
            lines.push(text);
            start = end + 1;
            scan_from = start;
        }

        self.buffer.drain(..start);
        self.decode_errors += errors;
        lines
    }

    /// The retained, not yet terminated bytes.
    pub fn tail(&self) -> &[u8] {
        &self.buffer
    }

    pub fn tail_text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Lines that were not valid UTF-8 and had to be decoded lossily.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn decode_line(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_owned(), false),
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), true),
    }
}
