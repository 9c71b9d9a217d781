//! Reassembles raw output chunks into lines.
//!
//! A chunk may end in the middle of a line (or of a UTF-8 sequence); the unterminated
//! tail is kept as raw bytes until its terminator arrives or the buffer is taken.

#[derive(Debug, Default)]
pub struct LineBuffer {
    lines: Vec<String>,
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Lines end at `\n`; a `\r` right before it is dropped.
    pub fn push(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            let line = decode_line(&self.partial);
            self.partial.clear();
            self.lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    /// Complete lines followed by the current partial line, which is empty right
    /// after a terminator. Completion tests run against this view.
    pub fn view(&self) -> Vec<String> {
        let mut view = self.lines.clone();
        view.push(decode_line(&self.partial));
        view
    }

    /// Return the view and reset, dropping the partial line with it.
    pub fn take(&mut self) -> Vec<String> {
        let view = self.view();
        self.lines.clear();
        self.partial.clear();
        view
    }

    /// Drop the oldest complete lines so at most `max` remain.
    pub fn keep_last(&mut self, max: usize) {
        if self.lines.len() > max {
            let excess = self.lines.len() - max;
            self.lines.drain(..excess);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
