// ABOUTME: Stdout/stderr framing, clipping, and envelope parsing for sandbox runs
// ABOUTME: Shared by both the container and forked-process executor backends

use serde_json::Value;

/// The unique marker the runner harness prints before its JSON envelope.
pub const RESULT_MARKER: &str = "\u{1}DYNMCP_RESULT\u{1}";

#[derive(Debug, Clone)]
pub enum ParsedOutput {
    /// `{ok:true, result}` envelope found after the marker.
    Success { result: Value, raw: String },
    /// `{ok:false, error}` envelope found after the marker.
    Failure { error: String, raw: String },
    /// No marker found; the clipped raw output is returned as information,
    /// not an error (spec section 4.3 "Output parsing").
    NoMarker { raw: String },
}

/// Clips `bytes` to at most `max_bytes`, preferring a UTF-8 char boundary and
/// appending a `...<truncated>` marker when clipping occurred.
#[must_use]
pub fn clip_output(raw: &str, max_bytes: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.len() <= max_bytes {
        return trimmed.to_owned();
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !trimmed.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let mut clipped = trimmed[..boundary].to_owned();
    clipped.push_str("...<truncated>");
    clipped
}

/// Parses clipped combined stdout+stderr into a structured outcome.
#[must_use]
pub fn parse_output(combined: &str, max_output_bytes: usize) -> ParsedOutput {
    let clipped = clip_output(combined, max_output_bytes);
    let Some(marker_pos) = clipped.rfind(RESULT_MARKER) else {
        return ParsedOutput::NoMarker { raw: clipped };
    };
    let payload = &clipped[marker_pos + RESULT_MARKER.len()..];
    let Ok(envelope) = serde_json::from_str::<Value>(payload.trim()) else {
        return ParsedOutput::NoMarker { raw: clipped };
    };
    let ok = envelope.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if ok {
        ParsedOutput::Success {
            result: envelope.get("result").cloned().unwrap_or(Value::Null),
            raw: clipped,
        }
    } else {
        let error = envelope
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| "unknown sandbox error".to_owned());
        ParsedOutput::Failure { error, raw: clipped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clips_at_char_boundary_and_appends_marker() {
        let s = "a".repeat(100);
        let clipped = clip_output(&s, 10);
        assert!(clipped.ends_with("...<truncated>"));
        assert!(clipped.starts_with(&"a".repeat(10)));
    }

    #[test]
    fn parses_success_envelope_after_marker() {
        let combined = format!("noise\n{RESULT_MARKER}{{\"ok\":true,\"result\":{{\"x\":1}}}}");
        match parse_output(&combined, 65_536) {
            ParsedOutput::Success { result, .. } => assert_eq!(result["x"], 1),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn missing_marker_is_informational_not_error() {
        match parse_output("just some raw output", 65_536) {
            ParsedOutput::NoMarker { raw } => assert_eq!(raw, "just some raw output"),
            other => panic!("expected no-marker, got {other:?}"),
        }
    }

    #[test]
    fn uses_last_marker_occurrence() {
        let combined = format!(
            "{RESULT_MARKER}{{\"ok\":false,\"error\":\"stale\"}}\n{RESULT_MARKER}{{\"ok\":true,\"result\":1}}"
        );
        match parse_output(&combined, 65_536) {
            ParsedOutput::Success { result, .. } => assert_eq!(result, 1),
            other => panic!("expected success, got {other:?}"),
        }
    }
}
