//! Line-framing of a chunked HTTP body (§4.2).
//!
//! Generalized SSE-style framing: bytes are split on `\n`, trimmed of a
//! trailing `\r`, and each non-empty line is classified against the task's
//! configured prefixes. The parser buffers partial lines across chunk
//! boundaries and is driven by the consumer (`Requester`) calling
//! `next_frame()` — it never pushes frames on its own, so the consumer fully
//! controls pacing.

use std::collections::VecDeque;

use serde_json::Value;

use crate::descriptor::FieldMap;
use crate::field_extractor;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(String),
    End,
    Ignored,
}

pub struct StreamParser {
    buffer: Vec<u8>,
    pending_lines: VecDeque<String>,
    line_prefix: String,
    end_line_prefix: Option<String>,
    end_field_path: Option<String>,
    stop_token: String,
}

impl StreamParser {
    pub fn new(field_map: &FieldMap) -> Self {
        Self {
            buffer: Vec::new(),
            pending_lines: VecDeque::new(),
            line_prefix: field_map.line_prefix.clone(),
            end_line_prefix: field_map.end_line_prefix.clone(),
            end_field_path: field_map.end_field_path.clone(),
            stop_token: field_map.stop_token.clone(),
        }
    }

    /// Appends raw bytes read from the socket. Splits complete lines out of
    /// the accumulator; an incomplete trailing line stays buffered.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        for i in 0..self.buffer.len() {
            if self.buffer[i] == b'\n' {
                let line_bytes = &self.buffer[start..i];
                let line = strip_trailing_cr(line_bytes);
                self.pending_lines.push_back(line);
                start = i + 1;
            }
        }
        self.buffer.drain(0..start);
    }

    /// Pops and classifies the next complete, non-empty line. Returns `None`
    /// when no complete line is currently buffered — the caller should read
    /// more bytes and `feed()` them before calling again.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while let Some(line) = self.pending_lines.pop_front() {
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.classify(&line));
        }
        None
    }

    /// Called on stream EOF: flushes a trailing line that never received its
    /// terminating `\n`, if non-empty. Returns `None` if nothing is buffered.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = strip_trailing_cr(&std::mem::take(&mut self.buffer));
        if line.trim().is_empty() {
            None
        } else {
            Some(self.classify(&line))
        }
    }

    fn classify(&self, line: &str) -> Frame {
        if let Some(end_prefix) = &self.end_line_prefix {
            if let Some(remainder) = line.strip_prefix(end_prefix.as_str()) {
                let remainder = remainder.trim();
                let matched_stop_token =
                    !self.stop_token.is_empty() && remainder == self.stop_token;
                let matched_end_field = self.end_field_matches(remainder);
                if matched_stop_token || matched_end_field {
                    return Frame::End;
                }
            }
        }

        if let Some(remainder) = line.strip_prefix(self.line_prefix.as_str()) {
            return Frame::Data(remainder.trim().to_string());
        }

        Frame::Ignored
    }

    fn end_field_matches(&self, remainder: &str) -> bool {
        let path = match &self.end_field_path {
            Some(p) if !p.is_empty() => p,
            _ => return false,
        };
        let parsed: Value = match serde_json::from_str(remainder) {
            Ok(v) => v,
            Err(_) => return false,
        };
        match field_extractor::extract(&parsed, path) {
            Ok(Some(extracted)) => extracted.as_non_empty_str() == Some(self.stop_token.as_str()),
            _ => false,
        }
    }
}

fn strip_trailing_cr(bytes: &[u8]) -> String {
    let mut bytes = bytes;
    if bytes.last() == Some(&b'\r') {
        bytes = &bytes[..bytes.len() - 1];
    }
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DataFormat;

    fn openai_field_map() -> FieldMap {
        FieldMap {
            prompt_path: "messages.-1.content".to_string(),
            image_path: None,
            line_prefix: "data:".to_string(),
            data_format: DataFormat::Json,
            content_path: "choices.0.delta.content".to_string(),
            reasoning_content_path: None,
            prompt_tokens_path: None,
            completion_tokens_path: None,
            total_tokens_path: None,
            end_line_prefix: None,
            end_field_path: None,
            stop_token: "[DONE]".to_string(),
        }
    }

    fn claude_field_map() -> FieldMap {
        FieldMap {
            end_line_prefix: Some("data:".to_string()),
            end_field_path: Some("type".to_string()),
            stop_token: "message_stop".to_string(),
            ..openai_field_map()
        }
    }

    #[test]
    fn frames_data_lines_and_stop_token() {
        let mut parser = StreamParser::new(&openai_field_map());
        parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n");

        assert_eq!(
            parser.next_frame(),
            Some(Frame::Data(
                "{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}".to_string()
            ))
        );
        assert_eq!(parser.next_frame(), Some(Frame::End));
        assert_eq!(parser.next_frame(), None);
    }

    #[test]
    fn buffers_partial_lines_across_feeds() {
        let mut parser = StreamParser::new(&openai_field_map());
        parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi");
        assert_eq!(parser.next_frame(), None);

        parser.feed(b"\"}}]}\n");
        assert_eq!(
            parser.next_frame(),
            Some(Frame::Data(
                "{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}".to_string()
            ))
        );
    }

    #[test]
    fn ignores_comment_lines() {
        let mut parser = StreamParser::new(&openai_field_map());
        parser.feed(b": keepalive\n");
        assert_eq!(parser.next_frame(), Some(Frame::Ignored));
    }

    #[test]
    fn claude_end_field_path_terminates_stream() {
        let mut parser = StreamParser::new(&claude_field_map());
        parser.feed(b"data: {\"type\":\"message_stop\"}\n");
        assert_eq!(parser.next_frame(), Some(Frame::End));
    }

    #[test]
    fn claude_non_terminal_event_is_data() {
        let mut parser = StreamParser::new(&claude_field_map());
        parser.feed(b"data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n");
        assert_eq!(
            parser.next_frame(),
            Some(Frame::Data(
                "{\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}".to_string()
            ))
        );
    }

    #[test]
    fn finish_flushes_unterminated_trailing_line() {
        let mut parser = StreamParser::new(&openai_field_map());
        parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}");
        assert_eq!(parser.next_frame(), None);
        assert_eq!(
            parser.finish(),
            Some(Frame::Data(
                "{\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}".to_string()
            ))
        );
    }

    #[test]
    fn blank_lines_produce_no_frame() {
        let mut parser = StreamParser::new(&openai_field_map());
        parser.feed(b"\n\n\n");
        assert_eq!(parser.next_frame(), None);
    }
}
