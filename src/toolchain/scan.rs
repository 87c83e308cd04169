//! Splits Rhai source into code, comment and literal segments so textual
//! transforms never touch the inside of strings.

use super::ToolchainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Comment,
    Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub kind: SegmentKind,
    pub text: &'a str,
}

pub fn segments(source: &str) -> Result<Vec<Segment<'_>>, ToolchainError> {
    let bytes = source.as_bytes();
    let mut out = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let special = match (bytes[i], bytes.get(i + 1)) {
            (b'/', Some(b'/')) => Some((SegmentKind::Comment, line_end(bytes, i))),
            (b'/', Some(b'*')) => Some((SegmentKind::Comment, block_end(bytes, i)?)),
            (b'"', _) => Some((SegmentKind::Literal, quoted_end(bytes, i, b'"', "string")?)),
            (b'\'', _) => Some((SegmentKind::Literal, quoted_end(bytes, i, b'\'', "character")?)),
            (b'`', _) => Some((SegmentKind::Literal, backtick_end(bytes, i)?)),
            _ => None,
        };

        match special {
            Some((kind, end)) => {
                if code_start < i {
                    out.push(Segment {
                        kind: SegmentKind::Code,
                        text: &source[code_start..i],
                    });
                }
                out.push(Segment {
                    kind,
                    text: &source[i..end],
                });
                i = end;
                code_start = end;
            }
            None => i += 1,
        }
    }

    if code_start < bytes.len() {
        out.push(Segment {
            kind: SegmentKind::Code,
            text: &source[code_start..],
        });
    }
    Ok(out)
}

/// Applies `transform` to code segments and copies everything else verbatim.
pub fn map_code(source: &str, mut transform: impl FnMut(&str) -> String) -> Result<String, ToolchainError> {
    let mut out = String::with_capacity(source.len());
    for segment in segments(source)? {
        match segment.kind {
            SegmentKind::Code => out.push_str(&transform(segment.text)),
            SegmentKind::Comment | SegmentKind::Literal => out.push_str(segment.text),
        }
    }
    Ok(out)
}

// the newline itself stays with the following code
fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |offset| from + offset)
}

// block comments nest
fn block_end(bytes: &[u8], from: usize) -> Result<usize, ToolchainError> {
    let mut depth = 0usize;
    let mut i = from;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => i += 1,
        }
    }
    Err(ToolchainError::Unterminated {
        what: "block comment",
        offset: from,
    })
}

fn quoted_end(bytes: &[u8], from: usize, quote: u8, what: &'static str) -> Result<usize, ToolchainError> {
    let mut i = from + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(ToolchainError::Unterminated { what, offset: from })
}

fn backtick_end(bytes: &[u8], from: usize) -> Result<usize, ToolchainError> {
    bytes[from + 1..]
        .iter()
        .position(|b| *b == b'`')
        .map(|offset| from + 1 + offset + 1)
        .ok_or(ToolchainError::Unterminated {
            what: "backtick string",
            offset: from,
        })
}
