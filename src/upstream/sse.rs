//! Server-sent events decoding for provider streams.
//!
//! Bytes are buffered until a full line is available, so both a line split
//! across network chunks and a UTF-8 sequence split across chunks decode
//! correctly.

use memchr::memchr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the prefix stripped.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        while let Some(pos) = memchr(b'\n', &self.buffer[start..]) {
            let end = start + pos;
            if let Some(event) = parse_line(&self.buffer[start..end]) {
                events.push(event);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        events
    }

    /// Decode whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');
    // Blank lines separate events; `:` lines are comments; `event:` and
    // `id:` lines carry nothing the text stream needs.
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_data_lines_and_skips_the_rest() {
        let mut dec = SseDecoder::new();
        let events = dec.feed(b"event: message_start\ndata: {\"a\":1}\n\n: keep-alive\ndata:{\"b\":2}\r\n\r\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".into()),
                SseEvent::Data("{\"b\":2}".into())
            ]
        );
    }

    #[test]
    fn buffers_partial_lines() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"data: {\"te").is_empty());
        assert_eq!(
            dec.feed(b"xt\":\"hi\"}\n"),
            vec![SseEvent::Data("{\"text\":\"hi\"}".into())]
        );
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let line = "data: {\"t\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut dec = SseDecoder::new();
        assert!(dec.feed(&line[..split]).is_empty());
        assert_eq!(
            dec.feed(&line[split..]),
            vec![SseEvent::Data("{\"t\":\"héllo\"}".into())]
        );
    }

    #[test]
    fn done_sentinel_and_trailing_flush() {
        let mut dec = SseDecoder::new();
        assert_eq!(dec.feed(b"data: [DONE]\n"), vec![SseEvent::Done]);
        dec.feed(b"data: {\"last\":true}");
        assert_eq!(dec.flush(), Some(SseEvent::Data("{\"last\":true}".into())));
        assert_eq!(dec.flush(), None);
    }
}
