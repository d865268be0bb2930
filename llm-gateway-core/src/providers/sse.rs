//! Minimal SSE line framing shared by the streaming decoders. Adapters feed
//! raw body bytes in and pull complete lines out; interpreting the `data:`
//! payloads stays provider-specific.

/// Accumulates body bytes and yields complete lines.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Pop the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.find('\n')?;
        let line = self.buffer[..end].trim_end_matches('\r').to_string();
        self.buffer.drain(..=end);
        Some(line)
    }
}

/// Strip an SSE `data:` prefix. Accepts both `data: {...}` and the
/// space-less `data:{...}` variant some providers emit.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.trim_start())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut buffer = SseLineBuffer::new();
        buffer.push(b"data: {\"a\"");
        assert_eq!(buffer.next_line(), None);
        buffer.push(b": 1}\n\ndata: [DONE]\n");
        assert_eq!(buffer.next_line(), Some("data: {\"a\": 1}".to_string()));
        assert_eq!(buffer.next_line(), Some(String::new()));
        assert_eq!(buffer.next_line(), Some("data: [DONE]".to_string()));
        assert_eq!(buffer.next_line(), None);
    }

    #[test]
    fn data_prefix_with_and_without_space() {
        assert_eq!(data_payload("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("data:{\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("event: message"), None);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buffer = SseLineBuffer::new();
        buffer.push(b"data: [DONE]\r\n");
        assert_eq!(buffer.next_line(), Some("data: [DONE]".to_string()));
    }
}
