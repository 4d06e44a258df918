//! Markdown-lite → Telegram text + entities.
//!
//! Progress bodies use two markdown features: `` `inline code` `` and
//! fenced ``` blocks. Telegram wants clean text plus entity records with
//! UTF-16 offsets; everything else is passed through literally.

use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: &'static str,
    pub offset: usize,
    pub length: usize,
}

fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Strip backtick markup, collecting `code` / `pre` entities.
pub fn prepare_telegram(text: &str) -> (String, Vec<Entity>) {
    let mut out = String::new();
    let mut out_utf16 = 0usize;
    let mut entities = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("```") {
            // Fenced block: skip an optional language tag on the fence line.
            if let Some(close) = stripped.find("```") {
                let mut body = &stripped[..close];
                if let Some(newline) = body.find('\n') {
                    let fence_line = &body[..newline];
                    if !fence_line.trim().is_empty() && !fence_line.contains(' ') {
                        body = &body[newline + 1..];
                    } else if fence_line.trim().is_empty() {
                        body = &body[newline + 1..];
                    }
                }
                let body = body.strip_suffix('\n').unwrap_or(body);
                let length = utf16_len(body);
                if length > 0 {
                    entities.push(Entity {
                        kind: "pre",
                        offset: out_utf16,
                        length,
                    });
                }
                out.push_str(body);
                out_utf16 += length;
                rest = &stripped[close + 3..];
                continue;
            }
        }
        if let Some(stripped) = rest.strip_prefix('`') {
            // Inline span: must close before the next newline.
            if let Some(close) = stripped.find('`') {
                let body = &stripped[..close];
                if !body.contains('\n') {
                    let length = utf16_len(body);
                    if length > 0 {
                        entities.push(Entity {
                            kind: "code",
                            offset: out_utf16,
                            length,
                        });
                    }
                    out.push_str(body);
                    out_utf16 += length;
                    rest = &stripped[close + 1..];
                    continue;
                }
            }
            // Unpaired backtick: keep it literal.
            out.push('`');
            out_utf16 += 1;
            rest = stripped;
            continue;
        }
        let next = rest.find('`').unwrap_or(rest.len());
        let chunk = &rest[..next];
        out.push_str(chunk);
        out_utf16 += utf16_len(chunk);
        rest = &rest[next..];
    }

    (out, entities)
}

pub fn entities_json(entities: &[Entity]) -> Value {
    Value::Array(
        entities
            .iter()
            .map(|e| json!({"type": e.kind, "offset": e.offset, "length": e.length}))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_untouched() {
        let (text, entities) = prepare_telegram("hello world");
        assert_eq!(text, "hello world");
        assert!(entities.is_empty());
    }

    #[test]
    fn inline_code_entity() {
        let (text, entities) = prepare_telegram("run `cargo test` now");
        assert_eq!(text, "run cargo test now");
        assert_eq!(
            entities,
            vec![Entity {
                kind: "code",
                offset: 4,
                length: 10
            }]
        );
    }

    #[test]
    fn multiple_spans() {
        let (text, entities) = prepare_telegram("`a` and `bc`");
        assert_eq!(text, "a and bc");
        assert_eq!(entities.len(), 2);
        assert_eq!((entities[1].offset, entities[1].length), (6, 2));
    }

    #[test]
    fn utf16_offsets_for_non_bmp() {
        // The emoji is 2 UTF-16 units.
        let (text, entities) = prepare_telegram("🤖 `ok`");
        assert_eq!(text, "🤖 ok");
        assert_eq!((entities[0].offset, entities[0].length), (3, 2));
    }

    #[test]
    fn fenced_block_with_language() {
        let (text, entities) = prepare_telegram("before\n```rust\nfn main() {}\n```\nafter");
        assert_eq!(text, "before\nfn main() {}\nafter");
        assert_eq!(entities[0].kind, "pre");
        assert_eq!(entities[0].length, utf16_len("fn main() {}"));
    }

    #[test]
    fn unpaired_backtick_is_literal() {
        let (text, entities) = prepare_telegram("a ` b");
        assert_eq!(text, "a ` b");
        assert!(entities.is_empty());
    }

    #[test]
    fn status_line_round_trip() {
        let body = "`proj @feat`\nworking · 3s · step 1\n\n▸ `cargo test`";
        let (text, entities) = prepare_telegram(body);
        assert!(text.starts_with("proj @feat\nworking"));
        assert_eq!(entities.len(), 2);
    }
}
