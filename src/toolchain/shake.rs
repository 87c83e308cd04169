//! Reduces a bundled source to what one node actually reaches.
//!
//! A bundle carries the whole command source: the definition, every node's
//! handler and every helper. A node artifact keeps only the functions
//! reachable from its handler, plus the top-level constants those functions
//! read through `global::`.

use std::collections::{HashSet, VecDeque};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    ToolchainError,
    scan::{self, SegmentKind},
};

static FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:private[ \t]+)?fn[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*\(").expect("function pattern")
});
static CONSTANT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*const[ \t]+([A-Za-z_][A-Za-z0-9_]*)\b").expect("constant pattern"));
static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("call pattern"));
static FN_POINTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bFn\s*\(\s*"([A-Za-z_][A-Za-z0-9_]*)"\s*\)"#).expect("function pointer pattern"));
static GLOBAL_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bglobal\s*::\s*([A-Za-z_][A-Za-z0-9_]*)").expect("global reference pattern"));

/// A top-level function or constant and the byte range it spans.
#[derive(Debug)]
struct Item {
    name: String,
    start: usize,
    end: usize,
}

/// Keeps the functions reachable from `roots` and the constants they read.
///
/// Calls are found textually, so a name that merely looks like a call keeps
/// the function alive. Functions referenced through `Fn("name")` count as
/// called.
pub fn retain_reachable(source: &str, roots: &[&str]) -> Result<String, ToolchainError> {
    let masked = mask(source)?;
    let depths = depths(&masked);
    let functions = functions(source, &masked, &depths)?;
    let constants = constants(&masked, &depths)?;

    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = roots.iter().copied().collect();
    let mut globals: HashSet<String> = HashSet::new();
    while let Some(name) = queue.pop_front() {
        if !reachable.insert(name) {
            continue;
        }
        for function in functions.iter().filter(|function| function.name == name) {
            let code = &masked[function.start..function.end];
            let text = &source[function.start..function.end];
            let called = CALL
                .captures_iter(code)
                .chain(FN_POINTER.captures_iter(text))
                .filter_map(|captures| captures.get(1))
                .map(|found| found.as_str());
            for callee in called {
                if let Some(known) = functions.iter().find(|candidate| candidate.name == callee) {
                    queue.push_back(known.name.as_str());
                }
            }
            globals.extend(GLOBAL_REF.captures_iter(code).map(|captures| captures[1].to_string()));
        }
    }

    let kept_constants = constants.iter().filter(|constant| globals.contains(&constant.name));
    let kept_functions = functions
        .iter()
        .filter(|function| reachable.contains(function.name.as_str()));
    let pieces: Vec<&str> = kept_constants
        .chain(kept_functions)
        .map(|item| source[item.start..item.end].trim_end())
        .collect();
    tracing::debug!(
        functions = functions.len(),
        kept = reachable.len(),
        "dropped unreachable functions"
    );
    Ok(format!("{}\n", pieces.join("\n\n")))
}

/// `source` with comments and literals blanked out, byte offsets preserved.
fn mask(source: &str) -> Result<String, ToolchainError> {
    let mut out = String::with_capacity(source.len());
    for segment in scan::segments(source)? {
        match segment.kind {
            SegmentKind::Code => out.push_str(segment.text),
            SegmentKind::Comment | SegmentKind::Literal => {
                for c in segment.text.chars() {
                    if c == '\n' {
                        out.push('\n');
                    } else {
                        out.extend(std::iter::repeat_n(' ', c.len_utf8()));
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Brace depth in front of every byte.
fn depths(masked: &str) -> Vec<usize> {
    let mut depth = 0usize;
    let mut out = Vec::with_capacity(masked.len() + 1);
    for byte in masked.bytes() {
        out.push(depth);
        match byte {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    out.push(depth);
    out
}

fn functions(source: &str, masked: &str, depths: &[usize]) -> Result<Vec<Item>, ToolchainError> {
    let mut out = Vec::new();
    for captures in FUNCTION.captures_iter(masked) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if depths[whole.start()] != 0 {
            continue;
        }
        let unterminated = || ToolchainError::Unterminated {
            what: "function body",
            offset: whole.start(),
        };
        let open = masked[whole.end()..]
            .find('{')
            .map(|offset| whole.end() + offset)
            .ok_or_else(unterminated)?;
        let close = (open + 1..masked.len())
            .find(|&i| masked.as_bytes()[i] == b'}' && depths[i] == depths[open] + 1)
            .ok_or_else(unterminated)?;

        out.push(Item {
            name: name.as_str().to_string(),
            start: with_leading_comments(source, whole.start()),
            end: close + 1,
        });
    }
    Ok(out)
}

fn constants(masked: &str, depths: &[usize]) -> Result<Vec<Item>, ToolchainError> {
    let mut out = Vec::new();
    for captures in CONSTANT.captures_iter(masked) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if depths[whole.start()] != 0 {
            continue;
        }
        let end = (whole.end()..masked.len())
            .find(|&i| masked.as_bytes()[i] == b';' && depths[i] == 0)
            .ok_or(ToolchainError::Unterminated {
                what: "constant declaration",
                offset: whole.start(),
            })?;
        out.push(Item {
            name: name.as_str().to_string(),
            start: whole.start(),
            end: end + 1,
        });
    }
    Ok(out)
}

// `start` is always a line start
fn with_leading_comments(source: &str, mut start: usize) -> usize {
    while start > 0 {
        let before = &source[..start - 1];
        let line_start = before.rfind('\n').map_or(0, |newline| newline + 1);
        if before[line_start..].trim_start().starts_with("//") {
            start = line_start;
        } else {
            break;
        }
    }
    start
}
