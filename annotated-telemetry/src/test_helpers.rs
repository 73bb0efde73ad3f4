use core::fmt::Write;

use crate::backend::{RecordedSpan, SpanStatus};
use crate::id::SpanId;

/// Renders spans recorded by [`InMemoryBackend`][crate::backend::InMemoryBackend] as an indented
/// tree, one span per line: `name [tag=value, ...] status`.
///
/// Children follow their parent in start order, indented by four spaces per level.
pub fn format_span_tree(spans: Vec<RecordedSpan>) -> String {
    let mut result = String::new();
    build_tree_string(&spans, None, 0, &mut result);
    result
}

fn build_tree_string(
    spans: &[RecordedSpan],
    parent: Option<SpanId>,
    depth: usize,
    result: &mut String,
) {
    for span in spans.iter().filter(|span| span.parent == parent) {
        for _ in 0..depth {
            result.push_str("    ");
        }

        result.push_str(&span.name);

        result.push_str(" [");
        for (i, (key, value)) in span.tags.iter().enumerate() {
            if i > 0 {
                result.push_str(", ");
            }
            write!(result, "{key}={value}").unwrap();
        }
        result.push_str("] ");

        match &span.status {
            None => result.push_str("unfinished"),
            Some(SpanStatus::Ok) => result.push_str("ok"),
            Some(SpanStatus::Error { message }) => write!(result, "error: {message}").unwrap(),
        }
        result.push('\n');

        build_tree_string(spans, Some(span.id), depth + 1, result);
    }
}
