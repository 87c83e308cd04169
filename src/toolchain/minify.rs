use async_trait::async_trait;

use super::{
    Minifier, ToolchainError,
    scan::{SegmentKind, segments},
};

/// Drops comments and collapses whitespace outside literals.
#[derive(Debug, Clone, Copy, Default)]
pub struct RhaiMinifier;

#[async_trait]
impl Minifier for RhaiMinifier {
    async fn minify(&self, source: &str) -> Result<String, ToolchainError> {
        minify_source(source)
    }
}

// punctuation that never needs a separating space
fn is_tight(c: char) -> bool {
    matches!(c, '{' | '}' | '(' | ')' | '[' | ']' | ';' | ',' | ':')
}

struct Output {
    text: String,
    pending_space: bool,
}

impl Output {
    fn push(&mut self, c: char) {
        if self.pending_space {
            if let Some(last) = self.text.chars().next_back() {
                if !is_tight(last) && !is_tight(c) {
                    self.text.push(' ');
                }
            }
            self.pending_space = false;
        }
        self.text.push(c);
    }
}

pub fn minify_source(source: &str) -> Result<String, ToolchainError> {
    let mut out = Output {
        text: String::with_capacity(source.len()),
        pending_space: false,
    };

    for segment in segments(source)? {
        match segment.kind {
            SegmentKind::Comment => out.pending_space = true,
            SegmentKind::Literal => {
                let mut chars = segment.text.chars();
                if let Some(first) = chars.next() {
                    out.push(first);
                    out.text.push_str(chars.as_str());
                }
            }
            SegmentKind::Code => {
                for c in segment.text.chars() {
                    if c.is_whitespace() {
                        out.pending_space = true;
                    } else {
                        out.push(c);
                    }
                }
            }
        }
    }
    Ok(out.text)
}
