use async_trait::async_trait;

use super::{
    Formatter, ToolchainError,
    scan::{SegmentKind, segments},
};

/// Tidies readable artifacts: trailing whitespace is trimmed, runs of blank
/// lines collapse to one and the text ends with a single newline. Literals are
/// never touched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RhaiFormatter;

#[async_trait]
impl Formatter for RhaiFormatter {
    async fn format(&self, source: &str) -> Result<String, ToolchainError> {
        format_source(source)
    }
}

pub fn format_source(source: &str) -> Result<String, ToolchainError> {
    let source = source.replace("\r\n", "\n");
    let mut out = String::with_capacity(source.len());

    for segment in segments(&source)? {
        match segment.kind {
            SegmentKind::Code => {
                for (index, line) in segment.text.split('\n').enumerate() {
                    if index > 0 {
                        let trimmed = out.trim_end_matches([' ', '\t']).len();
                        out.truncate(trimmed);
                        if !out.ends_with("\n\n") {
                            out.push('\n');
                        }
                    }
                    out.push_str(line);
                }
            }
            SegmentKind::Comment | SegmentKind::Literal => out.push_str(segment.text),
        }
    }

    let body = out.trim_matches(|c: char| c == '\n' || c == ' ' || c == '\t');
    Ok(format!("{body}\n"))
}
