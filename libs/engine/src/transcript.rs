//! Rendering of captured agent output into an HTML transcript, plus the
//! question and error probes the scheduler runs over the same lines.

use crate::question::{ASK_USER_QUESTION_TOOL, QuestionRequest};
use crate::stream::{ContentBlock, StreamEvent, parse_lines};
use serde_json::value::RawValue;
use std::fmt::Write as _;

const TEXT_STYLE: &str = "margin:8px 0;padding:8px 12px;border-left:3px solid #22d3ee;background:#0f172a;border-radius:4px;color:#e2e8f0;font-size:13px;line-height:1.5";
const DETAILS_STYLE: &str = "margin:8px 0;border:1px solid #374151;border-radius:6px;overflow:hidden";
const TOOL_SUMMARY_STYLE: &str = "cursor:pointer;padding:6px 10px;background:#1e293b;color:#60a5fa;font-size:13px;font-weight:600";
const RESULT_SUMMARY_STYLE: &str = "cursor:pointer;padding:6px 10px;background:#1e293b;color:#a78bfa;font-size:13px;font-weight:600";
const PRE_STYLE: &str = "margin:0;padding:8px 10px;background:#0f172a;color:#94a3b8;font-size:12px;overflow-x:auto";
const QUESTION_STYLE: &str = "margin:8px 0;padding:12px 16px;border:1px solid #f59e0b;border-radius:6px;background:#1c1917;color:#e2e8f0;font-size:13px;line-height:1.5";
const QUESTION_HEADER_STYLE: &str = "color:#f59e0b;font-weight:700;font-size:11px;text-transform:uppercase;letter-spacing:0.05em;margin-bottom:6px";
const OPTION_STYLE: &str = "margin:4px 0;padding:6px 10px;border:1px solid #374151;border-radius:4px;background:#0f172a";
const SUMMARY_STYLE: &str = "margin:8px 0;padding:10px 12px;border-left:3px solid #34d399;background:#0f172a;border-radius:4px;color:#e2e8f0;font-size:13px;line-height:1.5";

/// Escape text for inclusion in HTML element content.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Pretty-print a tool input, falling back to the raw text when it is not JSON.
fn pretty_input(input: &RawValue) -> String {
    serde_json::from_str::<serde_json::Value>(input.get())
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| input.get().to_string())
}

#[derive(Default)]
struct TranscriptBuilder {
    buf: String,
}

impl TranscriptBuilder {
    fn text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let _ = write!(
            self.buf,
            "<div style=\"{TEXT_STYLE}\">{}</div>\n\n",
            escape_html(text)
        );
    }

    fn tool_use(&mut self, name: &str, input: Option<&RawValue>) {
        if name == ASK_USER_QUESTION_TOOL
            && let Some(request) = input.and_then(QuestionRequest::from_tool_input)
        {
            self.question(&request);
            return;
        }

        let _ = write!(
            self.buf,
            "<details style=\"{DETAILS_STYLE}\"><summary style=\"{TOOL_SUMMARY_STYLE}\">Tool: {}</summary>",
            escape_html(name)
        );
        if let Some(input) = input {
            let _ = write!(
                self.buf,
                "<pre style=\"{PRE_STYLE}\">{}</pre>",
                escape_html(&pretty_input(input))
            );
        }
        self.buf.push_str("</details>\n\n");
    }

    fn question(&mut self, request: &QuestionRequest) {
        for item in &request.questions {
            let header = if item.header.is_empty() {
                "Question"
            } else {
                item.header.as_str()
            };
            let _ = write!(
                self.buf,
                "<div style=\"{QUESTION_STYLE}\"><div style=\"{QUESTION_HEADER_STYLE}\">{}</div><div style=\"margin-bottom:10px;font-size:14px\">{}</div>",
                escape_html(header),
                escape_html(&item.question)
            );
            for option in &item.options {
                let _ = write!(
                    self.buf,
                    "<div style=\"{OPTION_STYLE}\"><span style=\"color:#fbbf24;font-weight:600\">{}</span>",
                    escape_html(&option.label)
                );
                if !option.description.is_empty() {
                    let _ = write!(
                        self.buf,
                        " <span style=\"color:#94a3b8;font-size:12px\">- {}</span>",
                        escape_html(&option.description)
                    );
                }
                self.buf.push_str("</div>");
            }
            self.buf.push_str("</div>\n\n");
        }
    }

    fn tool_result(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let _ = write!(
            self.buf,
            "<details style=\"{DETAILS_STYLE}\"><summary style=\"{RESULT_SUMMARY_STYLE}\">Result</summary><pre style=\"{PRE_STYLE};white-space:pre-wrap\">{}</pre></details>\n\n",
            escape_html(text)
        );
    }

    fn summary(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let _ = write!(
            self.buf,
            "<hr style=\"border-color:#374151;margin:16px 0\"><div style=\"{SUMMARY_STYLE}\"><strong style=\"color:#34d399\">Summary</strong><br>{}</div>\n",
            escape_html(text)
        );
    }

    fn assistant(&mut self, blocks: &[ContentBlock]) {
        for block in blocks {
            match block {
                ContentBlock::Text(text) => self.text(text),
                ContentBlock::ToolUse { name, input, .. } => self.tool_use(name, input.as_deref()),
                ContentBlock::ToolResult(text) => self.tool_result(text),
                ContentBlock::Other(_) => {}
            }
        }
    }

    fn rendered(&self) -> &str {
        self.buf.trim()
    }
}

/// Render captured stream lines as an HTML transcript.
///
/// Assistant blocks render in order. The last `result` event is appended as
/// a trailing summary unless its text already appears in the transcript.
pub fn build_transcript<S: AsRef<str>>(lines: &[S]) -> String {
    let mut builder = TranscriptBuilder::default();
    let mut last_result: Option<String> = None;

    for event in parse_lines(lines) {
        match event {
            StreamEvent::Assistant(blocks) => builder.assistant(&blocks),
            StreamEvent::Result { result, .. } => last_result = Some(result),
            StreamEvent::System { .. } | StreamEvent::Other(_) => {}
        }
    }

    if let Some(result) = last_result {
        let needle = escape_html(result.trim());
        if !needle.is_empty() && !builder.rendered().contains(&needle) {
            builder.summary(&result);
        }
    }

    builder.rendered().to_string()
}

/// Raw input of the last `AskUserQuestion` call that carries questions.
pub fn detect_question<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    let mut last = None;
    for event in parse_lines(lines) {
        let StreamEvent::Assistant(blocks) = event else {
            continue;
        };
        for block in blocks {
            if let ContentBlock::ToolUse {
                name,
                input: Some(input),
                ..
            } = block
                && name == ASK_USER_QUESTION_TOOL
                && QuestionRequest::from_tool_input(&input).is_some()
            {
                last = Some(input.get().to_string());
            }
        }
    }
    last
}

/// Best human-readable failure message in the stream.
///
/// An error `result` wins outright; otherwise the first assistant text.
pub fn extract_error<S: AsRef<str>>(lines: &[S]) -> String {
    let mut fallback: Option<String> = None;
    for event in parse_lines(lines) {
        match event {
            StreamEvent::Result {
                result,
                is_error: true,
            } if !result.is_empty() => return result,
            StreamEvent::Assistant(blocks) if fallback.is_none() => {
                fallback = blocks.into_iter().find_map(|block| match block {
                    ContentBlock::Text(text) if !text.is_empty() => Some(text),
                    _ => None,
                });
            }
            _ => {}
        }
    }
    fallback.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant(blocks: serde_json::Value) -> String {
        json!({"type": "assistant", "message": {"role": "assistant", "content": blocks}}).to_string()
    }

    fn text(text: &str) -> String {
        assistant(json!([{"type": "text", "text": text}]))
    }

    fn result(text: &str) -> String {
        json!({"type": "result", "result": text}).to_string()
    }

    fn error_result(text: &str) -> String {
        json!({"type": "result", "result": text, "is_error": true}).to_string()
    }

    fn system() -> String {
        json!({"type": "system", "subtype": "init"}).to_string()
    }

    fn question_input() -> serde_json::Value {
        json!({"questions": [{
            "question": "Which environment?",
            "header": "Deploy",
            "options": [
                {"label": "staging", "description": "safe"},
                {"label": "production"}
            ],
            "multiSelect": false
        }]})
    }

    fn ask(input: serde_json::Value) -> String {
        assistant(json!([{"type": "tool_use", "id": "q1", "name": "AskUserQuestion", "input": input}]))
    }

    #[test]
    fn echoed_result_is_not_repeated() {
        let lines = vec![system(), text("Hello world"), result("Hello world")];
        let transcript = build_transcript(&lines);
        assert_eq!(transcript.matches("Hello world").count(), 1);
        assert!(!transcript.contains("Summary"));
    }

    #[test]
    fn tool_use_renders_collapsible_block() {
        let lines = vec![
            system(),
            assistant(json!([{"type": "tool_use", "id": "tool-1", "name": "Bash", "input": {"command": "ls"}}])),
            text("Here are the files."),
            result("Here are the files."),
        ];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("Tool: Bash"));
        assert!(transcript.contains("<details"));
        assert!(transcript.contains("\"command\": \"ls\""));
        assert!(transcript.contains("Here are the files."));
        assert!(!transcript.contains("Summary"));
    }

    #[test]
    fn blocks_render_in_order() {
        let lines = vec![
            assistant(json!([
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "name": "Read", "input": {"file": "main.rs"}}
            ])),
            text("Here is the file."),
        ];
        let transcript = build_transcript(&lines);
        let check = transcript.find("Let me check.").unwrap();
        let tool = transcript.find("Tool: Read").unwrap();
        let done = transcript.find("Here is the file.").unwrap();
        assert!(check < tool && tool < done);
    }

    #[test]
    fn independent_events_keep_input_order() {
        let reading = assistant(json!([{"type": "tool_use", "name": "Read", "input": {"file": "a.rs"}}]));
        let note = text("Looking around.");

        let forward = build_transcript(&[reading.clone(), note.clone()]);
        assert!(forward.find("Tool: Read").unwrap() < forward.find("Looking around.").unwrap());

        let reversed = build_transcript(&[note, reading]);
        assert!(reversed.find("Looking around.").unwrap() < reversed.find("Tool: Read").unwrap());
    }

    #[test]
    fn tool_without_input_has_no_pre_block() {
        let lines = vec![assistant(json!([{"type": "tool_use", "name": "WebSearch"}]))];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("Tool: WebSearch"));
        assert!(!transcript.contains("<pre"));
    }

    #[test]
    fn tool_result_renders_result_block() {
        let lines = vec![assistant(json!([{"type": "tool_result", "text": "a.txt\nb.txt"}]))];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains(">Result</summary>"));
        assert!(transcript.contains("a.txt\nb.txt"));
    }

    #[test]
    fn distinct_result_becomes_summary() {
        let lines = vec![text("Let me look into that."), result("The answer is 42.")];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("Let me look into that."));
        assert!(transcript.contains(">Summary</"));
        assert!(transcript.contains("The answer is 42."));
    }

    #[test]
    fn only_last_result_is_summarized() {
        let lines = vec![result("first"), result("second")];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("second"));
        assert!(!transcript.contains("first"));
    }

    #[test]
    fn empty_and_malformed_input() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(build_transcript(&empty), "");

        let lines = vec![
            "not json at all".to_string(),
            String::new(),
            r#"{"type":"unknown"}"#.to_string(),
            text("valid text"),
            result("valid text"),
        ];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("valid text"));
        assert!(!transcript.contains("Summary"));
    }

    #[test]
    fn system_events_are_ignored() {
        let lines = vec![system(), text("hello"), result("hello")];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("hello"));
        assert!(!transcript.contains("system"));
        assert!(!transcript.contains("init"));
    }

    #[test]
    fn text_is_html_escaped() {
        let lines = vec![text("<script>alert(1)</script> & more"), result("<b>done</b>")];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("&lt;script&gt;alert(1)&lt;/script&gt; &amp; more"));
        assert!(transcript.contains("&lt;b&gt;done&lt;/b&gt;"));
        assert!(!transcript.contains("<script>"));
    }

    #[test]
    fn escaped_result_is_still_deduplicated() {
        let lines = vec![text("a < b"), result("a < b")];
        let transcript = build_transcript(&lines);
        assert!(!transcript.contains("Summary"));
    }

    #[test]
    fn question_renders_as_card() {
        let lines = vec![ask(question_input())];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("Deploy"));
        assert!(transcript.contains("Which environment?"));
        assert!(transcript.contains("staging"));
        assert!(transcript.contains("- safe"));
        assert!(transcript.contains("production"));
        assert!(!transcript.contains("Tool: AskUserQuestion"));
    }

    #[test]
    fn question_with_null_fields_is_still_a_question() {
        let input = json!({"questions": [{
            "question": "Which region?",
            "header": null,
            "options": [{"label": "eu", "description": null}, {"label": "us"}]
        }]});
        let lines = vec![ask(input.clone())];

        assert_eq!(detect_question(&lines), Some(input.to_string()));
        let transcript = build_transcript(&lines);
        assert!(transcript.contains("Which region?"));
        assert!(transcript.contains(">Question</div>"));
        assert!(!transcript.contains("Tool: AskUserQuestion"));
    }

    #[test]
    fn question_without_header_uses_default_label() {
        let lines = vec![ask(json!({"questions": [{"question": "Continue?"}]}))];
        let transcript = build_transcript(&lines);
        assert!(transcript.contains(">Question</div>"));
    }

    #[test]
    fn empty_question_list_renders_as_plain_tool() {
        let lines = vec![ask(json!({"questions": []}))];
        assert!(build_transcript(&lines).contains("Tool: AskUserQuestion"));
        assert_eq!(detect_question(&lines), None);
    }

    #[test]
    fn detect_question_returns_last_payload_verbatim() {
        let first = json!({"questions": [{"question": "First?"}]});
        let second = json!({"questions": [{"question": "Second?", "header": "Pick"}]});
        let lines = vec![
            ask(first),
            text("thinking"),
            ask(second.clone()),
            result("waiting"),
        ];
        let detected = detect_question(&lines).unwrap();
        assert_eq!(detected, second.to_string());
    }

    #[test]
    fn detect_question_ignores_other_tools() {
        let lines = vec![
            assistant(json!([{"type": "tool_use", "name": "Bash", "input": {"questions": [{"question": "x"}]}}])),
            "garbage".to_string(),
        ];
        assert_eq!(detect_question(&lines), None);
    }

    #[test]
    fn extract_error_prefers_error_result() {
        let lines = vec![
            text("verbose error details"),
            error_result("Token expired. Please run /login"),
        ];
        assert_eq!(extract_error(&lines), "Token expired. Please run /login");
    }

    #[test]
    fn extract_error_falls_back_to_first_assistant_text() {
        let lines = vec![system(), text("Something went wrong"), text("later text")];
        assert_eq!(extract_error(&lines), "Something went wrong");
    }

    #[test]
    fn extract_error_ignores_successful_results() {
        let lines = vec![result("all good")];
        assert_eq!(extract_error(&lines), "");

        let empty: Vec<String> = Vec::new();
        assert_eq!(extract_error(&empty), "");
    }
}
