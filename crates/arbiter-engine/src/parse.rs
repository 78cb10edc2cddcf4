//! Layered JSON extraction from oracle completions.
//!
//! Strategies, in order: the whole text, each fenced code block, then every
//! brace-balanced `{...}` span. The first JSON object found wins. `None`
//! tells the caller to re-prompt or fall back to its safe default.

use serde_json::Value;

/// Which layer produced the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Direct,
    FencedBlock,
    BraceBalanced,
}

/// Extract the first JSON object from `text`.
pub fn parse_object(text: &str) -> Option<(Value, ParseStrategy)> {
    let trimmed = text.trim();
    if let Some(v) = as_object(trimmed) {
        return Some((v, ParseStrategy::Direct));
    }
    for block in fenced_blocks(trimmed) {
        if let Some(v) = as_object(block.trim()) {
            return Some((v, ParseStrategy::FencedBlock));
        }
    }
    brace_balanced(trimmed).map(|v| (v, ParseStrategy::BraceBalanced))
}

fn as_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Contents of every ``` fenced block, info string dropped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        // Skip the info string ("json", "JSON", "") up to the newline.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    blocks
}

/// Try every `{` as a start; scan to its matching `}` honoring strings and
/// escapes, and return the first span that parses as an object.
fn brace_balanced(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    for (start, _) in text.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let end = start + offset + 1;
                        if let Some(v) = as_object(&text[start..end]) {
                            return Some(v);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_object() {
        let (v, s) = parse_object(r#"  {"confidence_delta": 0.1}  "#).unwrap();
        assert_eq!(s, ParseStrategy::Direct);
        assert_eq!(v["confidence_delta"], 0.1);
    }

    #[test]
    fn fenced_block_inside_prose() {
        let text = "Sure! Here is my analysis.\n\n```json\n{\"summary\": \"index edited\", \"confidence_delta\": 0.15}\n```\nLet me know.";
        let (v, s) = parse_object(text).unwrap();
        assert_eq!(s, ParseStrategy::FencedBlock);
        assert_eq!(v["summary"], "index edited");
    }

    #[test]
    fn untagged_fence_after_non_json_fence() {
        let text = "```\nnot json\n```\nand\n```\n{\"a\": 1}\n```";
        let (v, s) = parse_object(text).unwrap();
        assert_eq!(s, ParseStrategy::FencedBlock);
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn brace_balanced_with_braces_in_strings() {
        let text = r#"I think {this} is it: {"reason": "uses {curly} and \"quotes\"", "n": {"x": 2}} trailing"#;
        let (v, s) = parse_object(text).unwrap();
        assert_eq!(s, ParseStrategy::BraceBalanced);
        assert_eq!(v["reason"], "uses {curly} and \"quotes\"");
        assert_eq!(v["n"]["x"], 2);
    }

    #[test]
    fn arrays_and_prose_are_rejected() {
        assert!(parse_object("[1, 2, 3]").is_none());
        assert!(parse_object("I cannot decide.").is_none());
        assert!(parse_object("{unterminated").is_none());
    }
}
