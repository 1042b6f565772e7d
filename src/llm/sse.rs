//! Incremental server-sent-events decoder
//!
//! Feed raw response bytes, get back the `data:` payloads of every
//! complete frame. Partial frames stay buffered until the terminating
//! blank line arrives.

/// Terminal payload conventionally sent by chat-completions streams
pub const DONE_PAYLOAD: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes; returns the data payloads of frames that
    /// became complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        loop {
            let Some((frame_end, sep_len)) = find_frame_boundary(&self.buffer) else {
                break;
            };
            let frame: String = self.buffer.drain(..frame_end + sep_len).collect();
            let frame = &frame[..frame_end];

            let mut data_lines = Vec::new();
            for line in frame.lines() {
                let line = line.strip_suffix('\r').unwrap_or(line);
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            if !data_lines.is_empty() {
                payloads.push(data_lines.join("\n"));
            }
        }
        payloads
    }
}

/// Find the first blank-line frame separator, tolerating `\r\n` endings
fn find_frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some((a, la)), Some((b, lb))) => {
            if a < b {
                Some((a, la))
            } else {
                Some((b, lb))
            }
        }
        (a, b) => a.or(b),
    }
}
