/// Turns raw pipe reads into complete lines.
///
/// Reads can split a UTF-8 sequence or a `\r\n` pair; both are carried over to the
/// next push instead of being decoded early. The pending partial line is capped at
/// `max_partial_bytes`, dropping its oldest bytes first.
#[derive(Debug)]
pub struct StreamDecoder {
    pending_utf8: Vec<u8>,
    partial: String,
    max_partial_bytes: usize,
    trimmed_bytes: usize,
}

impl StreamDecoder {
    pub fn new(max_partial_bytes: usize) -> Self {
        Self {
            pending_utf8: Vec::new(),
            partial: String::new(),
            max_partial_bytes,
            trimmed_bytes: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = self.decode(bytes);
        self.partial.push_str(&text);
        let lines = self.drain_lines();
        self.enforce_cap();
        lines
    }

    /// Bytes dropped from the partial line since the last call.
    pub fn take_trimmed_bytes(&mut self) -> usize {
        std::mem::take(&mut self.trimmed_bytes)
    }

    /// Whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.pending_utf8);
        if !tail.is_empty() {
            self.partial.push_str(&String::from_utf8_lossy(&tail));
        }
        let mut rest = std::mem::take(&mut self.partial);
        if rest.ends_with('\r') {
            rest.pop();
        }
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buffer = std::mem::take(&mut self.pending_utf8);
        buffer.extend_from_slice(bytes);

        let mut out = String::with_capacity(buffer.len());
        let mut rest: &[u8] = &buffer;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match error.error_len() {
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid_len..];
                        }
                        None => {
                            // Incomplete sequence at the end of this read.
                            self.pending_utf8 = after.to_vec();
                            rest = &[];
                        }
                    }
                }
            }
        }
        out
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(idx) = self.partial.find(|c: char| c == '\n' || c == '\r') {
            let bytes = self.partial.as_bytes();
            let advance = if bytes[idx] == b'\r' {
                match bytes.get(idx + 1) {
                    Some(b'\n') => 2,
                    Some(_) => 1,
                    None => break,
                }
            } else {
                1
            };
            lines.push(self.partial[..idx].to_string());
            self.partial.drain(..idx + advance);
        }
        lines
    }

    fn enforce_cap(&mut self) {
        if self.partial.len() <= self.max_partial_bytes {
            return;
        }
        let mut cut = self.partial.len() - self.max_partial_bytes;
        while !self.partial.is_char_boundary(cut) {
            cut += 1;
        }
        self.partial.drain(..cut);
        self.trimmed_bytes = self.trimmed_bytes.saturating_add(cut);
    }
}
