//! SSE line parsing for OpenAI-compatible streaming responses.

use serde_json::Value;
use tracing::trace;

/// One parsed server-sent event from a streaming completion.
#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    /// A text delta chunk.
    Delta(String),
    /// The `[DONE]` sentinel: generation finished.
    Done,
    /// An event we don't care about (role announcements, empty deltas).
    Ignore,
}

/// Parse a single SSE line. Lines that are not `data:` frames are ignored.
pub(crate) fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return SseEvent::Ignore;
    };

    if data == "[DONE]" {
        return SseEvent::Done;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(parsed) => {
            match parsed["choices"][0]["delta"]["content"].as_str() {
                Some(text) if !text.is_empty() => SseEvent::Delta(text.to_string()),
                _ => SseEvent::Ignore,
            }
        }
        Err(_) => {
            trace!(line = %data, "ignoring unparseable SSE frame");
            SseEvent::Ignore
        }
    }
}

/// Split buffered bytes into complete lines, returning the unfinished tail.
pub(crate) fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        lines.push(line.trim_end_matches(['\r', '\n']).to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line), SseEvent::Delta("Hel".into()));
    }

    #[test]
    fn done_sentinel() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
    }

    #[test]
    fn role_frame_ignored() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line), SseEvent::Ignore);
    }

    #[test]
    fn non_data_lines_ignored() {
        assert_eq!(parse_sse_line(": keep-alive"), SseEvent::Ignore);
        assert_eq!(parse_sse_line(""), SseEvent::Ignore);
    }

    #[test]
    fn drain_handles_partial_tail() {
        let mut buffer = "data: a\ndata: b\ndata: c".to_string();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["data: a", "data: b"]);
        assert_eq!(buffer, "data: c");
    }

    #[test]
    fn drain_strips_crlf() {
        let mut buffer = "data: x\r\n".to_string();
        assert_eq!(drain_lines(&mut buffer), vec!["data: x"]);
    }
}
