//! Chat↔Responses adapter (spec §4.I, §9 Open Question 1).
//!
//! `/v1/chat/completions` is lifted into a `/responses`-shaped request
//! before it enters the pipeline, and the streamed `response.*` events are
//! re-wrapped as `chat.completion.chunk` deltas on the way out. This is
//! deliberately not a full-fidelity translation — it only round-trips the
//! fields the pipeline itself touches (`model`, `stream`); the adapter
//! carries no selection or routing knowledge of its own.

use bytes::Bytes;
use serde_json::{json, Value};

/// Rewrites a Chat Completions request body into a Responses request body.
/// `messages` collapses into a single `input` field; every other top-level
/// field (`model`, `stream`, `temperature`, ...) passes through unchanged.
pub fn chat_request_to_responses(mut body: Value) -> Value {
    let Some(obj) = body.as_object_mut() else { return body };

    let messages = obj.remove("messages").unwrap_or(Value::Array(vec![]));
    let input = messages
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .map(|m| {
                    json!({
                        "role": m.get("role").cloned().unwrap_or(Value::String("user".to_string())),
                        "content": m.get("content").cloned().unwrap_or(Value::String(String::new())),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    obj.insert("input".to_string(), Value::Array(input));
    body
}

/// Rewrites one upstream Responses SSE data payload into a Chat Completions
/// streaming chunk. Returns `None` for event types the Chat Completions wire
/// format has no equivalent for (e.g. `response.created`), which the caller
/// should drop rather than forward.
pub fn responses_event_to_chat_chunk(model: &str, event: &Value) -> Option<Value> {
    let event_type = event.get("type").and_then(Value::as_str)?;

    let delta_text = match event_type {
        "response.output_text.delta" => event.get("delta").and_then(Value::as_str),
        _ => None,
    };

    if let Some(text) = delta_text {
        return Some(json!({
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "content": text },
                "finish_reason": Value::Null,
            }],
        }));
    }

    if event_type == "response.completed" || event_type == "response.incomplete" {
        let finish_reason = if event_type == "response.completed" { "stop" } else { "length" };
        return Some(json!({
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": finish_reason,
            }],
        }));
    }

    None
}

/// Scans a raw SSE byte buffer for complete (blank-line terminated) events
/// and parses each `data:` payload as JSON. Returns the parsed events and
/// how many leading bytes they consumed — the caller keeps the remainder
/// buffered since the next read may complete a partial trailing event.
pub fn parse_sse_events(buf: &[u8]) -> (Vec<Value>, usize) {
    let mut events = Vec::new();
    let mut consumed = 0;

    while let Some(rel_end) = find_subslice(&buf[consumed..], b"\n\n") {
        let event_block = &buf[consumed..consumed + rel_end];
        consumed += rel_end + 2;
        if let Some(data) = extract_data_payload(event_block) {
            if let Ok(value) = serde_json::from_str::<Value>(&data) {
                events.push(value);
            }
        }
    }

    (events, consumed)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn extract_data_payload(event_block: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(event_block).ok()?;
    let lines: Vec<&str> = text.lines().filter_map(|l| l.strip_prefix("data:")).map(str::trim_start).collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Renders already-translated chat chunks back onto the wire as SSE `data:`
/// frames.
pub fn chat_chunks_to_sse(chunks: &[Value]) -> Bytes {
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(chunk.to_string().as_bytes());
        out.extend_from_slice(b"\n\n");
    }
    Bytes::from(out)
}

/// Aggregates a non-streaming Responses body into a Chat Completions
/// response body, used by clients that call `/v1/chat/completions` without
/// `stream: true`.
pub fn responses_body_to_chat_completion(model: &str, response: &Value) -> Value {
    let text = response
        .get("output")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("content"))
                .filter_map(Value::as_array)
                .flatten()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    json!({
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop",
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifts_messages_into_input() {
        let body = json!({
            "model": "gpt-5-codex",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let responses_body = chat_request_to_responses(body);
        assert_eq!(responses_body["model"], "gpt-5-codex");
        assert_eq!(responses_body["stream"], true);
        assert!(responses_body.get("messages").is_none());
        assert_eq!(responses_body["input"][0]["role"], "user");
        assert_eq!(responses_body["input"][0]["content"], "hi");
    }

    #[test]
    fn delta_event_becomes_chat_chunk() {
        let event = json!({"type": "response.output_text.delta", "delta": "hel"});
        let chunk = responses_event_to_chat_chunk("gpt-5-codex", &event).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hel");
    }

    #[test]
    fn terminal_event_carries_finish_reason() {
        let event = json!({"type": "response.completed"});
        let chunk = responses_event_to_chat_chunk("gpt-5-codex", &event).unwrap();
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn unrecognized_event_type_is_dropped() {
        let event = json!({"type": "response.created"});
        assert!(responses_event_to_chat_chunk("gpt-5-codex", &event).is_none());
    }

    #[test]
    fn parse_sse_events_splits_on_blank_line_and_leaves_partial_event_buffered() {
        let buf = b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"a\"}\n\ndata: {\"type\":\"resp";
        let (events, consumed) = parse_sse_events(buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["delta"], "a");
        assert_eq!(&buf[consumed..], b"data: {\"type\":\"resp");
    }

    #[test]
    fn chat_chunks_to_sse_renders_data_frames() {
        let chunk = json!({"object": "chat.completion.chunk"});
        let bytes = chat_chunks_to_sse(&[chunk]);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn aggregates_non_streaming_output_text() {
        let response = json!({
            "output": [{"content": [{"text": "hello"}, {"text": " world"}]}],
        });
        let chat = responses_body_to_chat_completion("gpt-5-codex", &response);
        assert_eq!(chat["choices"][0]["message"]["content"], "hello world");
    }
}
