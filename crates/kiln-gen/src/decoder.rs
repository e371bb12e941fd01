//! Stream decoding: raw response bytes to ordered text deltas.
//!
//! The backend answers with a server-sent-event stream. Each event's data
//! is a JSON chunk carrying an incremental text delta at
//! `choices[0].delta.content`; a `data: [DONE]` line ends the stream.

use crate::error::{GenerationError, Result};
use serde_json::Value;

/// Sentinel payload that terminates the stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental UTF-8 decoder that tolerates code points split across chunks.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, holding back an incomplete trailing sequence.
    ///
    /// Invalid sequences become U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush any held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text.
    Delta(String),
    /// The sentinel was seen.
    Done,
}

/// Server-sent-event decoder for chat-completion streams.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    utf8: Utf8StreamDecoder,
    line: String,
    data: Vec<String>,
    done: bool,
}

impl StreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the sentinel has been decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes, returning events completed by this chunk, in order.
    ///
    /// Fails if the backend reports an error inside the stream.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>> {
        let text = self.utf8.decode(chunk);
        self.line.push_str(&text);

        let mut events = Vec::new();
        while let Some(pos) = self.line.find('\n') {
            let raw: String = self.line.drain(..=pos).collect();
            let line = raw.trim_end_matches(['\n', '\r']);
            self.process_line(line, &mut events)?;
        }
        Ok(events)
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        let tail = self.utf8.finish();
        self.line.push_str(&tail);
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.process_line(line.trim_end_matches('\r'), &mut events)?;
        }
        self.dispatch(&mut events)?;
        Ok(events)
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) -> Result<()> {
        if line.is_empty() {
            return self.dispatch(events);
        }
        if line.starts_with(':') {
            return Ok(());
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if value.trim() == DONE_SENTINEL {
                // The sentinel is its own event even without a blank line.
                self.dispatch(events)?;
                self.done = true;
                events.push(StreamEvent::Done);
                return Ok(());
            }
            self.data.push(value.to_string());
        }
        Ok(())
    }

    fn dispatch(&mut self, events: &mut Vec<StreamEvent>) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }
        let payload = self.data.join("\n");
        self.data.clear();

        let chunk: Value = match serde_json::from_str(&payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, len = payload.len(), "Skipping malformed stream chunk");
                return Ok(());
            }
        };

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown streaming error")
                .to_string();
            return Err(GenerationError::Stream(message));
        }

        if let Some(text) = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            tracing::trace!(len = text.len(), "Stream delta");
            events.push(StreamEvent::Delta(text.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    #[test]
    fn test_utf8_split_code_point() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_utf8_invalid_byte_replaced() {
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_deltas_in_order() {
        let mut decoder = StreamDecoder::new();
        let body = format!("{}{}data: [DONE]\n\n", chunk("{\"co"), chunk("de\":1}"));
        let events = decoder.push(body.as_bytes()).unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("{\"co".into()),
                StreamEvent::Delta("de\":1}".into()),
                StreamEvent::Done,
            ]
        );
        assert!(decoder.is_done());
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = StreamDecoder::new();
        let body = chunk("hello");
        let (a, b) = body.split_at(17);
        assert!(decoder.push(a.as_bytes()).unwrap().is_empty());
        assert_eq!(
            decoder.push(b.as_bytes()).unwrap(),
            vec![StreamEvent::Delta("hello".into())]
        );
    }

    #[test]
    fn test_crlf_comments_and_role_chunks() {
        let mut decoder = StreamDecoder::new();
        let body = ": keep-alive\r\n\r\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n\r\n";
        assert_eq!(
            decoder.push(body.as_bytes()).unwrap(),
            vec![StreamEvent::Delta("x".into())]
        );
    }

    #[test]
    fn test_error_chunk_fails() {
        let mut decoder = StreamDecoder::new();
        let err = decoder
            .push(b"data: {\"error\":{\"message\":\"rate limited\"}}\n\n")
            .unwrap_err();
        assert!(matches!(err, GenerationError::Stream(m) if m == "rate limited"));
    }

    #[test]
    fn test_malformed_chunk_skipped() {
        let mut decoder = StreamDecoder::new();
        let body = format!("data: {{not json\n\n{}", chunk("ok"));
        assert_eq!(
            decoder.push(body.as_bytes()).unwrap(),
            vec![StreamEvent::Delta("ok".into())]
        );
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = StreamDecoder::new();
        let body = chunk("tail");
        let trimmed = body.trim_end();
        assert!(decoder.push(trimmed.as_bytes()).unwrap().is_empty());
        assert_eq!(
            decoder.finish().unwrap(),
            vec![StreamEvent::Delta("tail".into())]
        );
    }
}
