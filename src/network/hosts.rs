//! Hosts file block rendering and splicing.
//!
//! The agent owns exactly one block of the hosts file, delimited by
//! [`START_MARKER`] and [`END_MARKER`]. Everything outside the block is
//! preserved byte-for-byte.

use std::collections::{BTreeSet, HashSet};

use tracing::warn;

use super::expand_subdomains;

/// First line of the managed block.
pub const START_MARKER: &str = "# === ENDPOINT GUARD - DO NOT EDIT ===";

/// Last line of the managed block.
pub const END_MARKER: &str = "# === END ENDPOINT GUARD ===";

/// Render the managed block for `domains`, or `None` when there is nothing to block.
///
/// Each domain maps to `127.0.0.1` and `::1`, followed by the same for its
/// common subdomains. Lines end with `newline`.
pub fn render_block(domains: &BTreeSet<String>, newline: &str) -> Option<String> {
    if domains.is_empty() {
        return None;
    }

    let mut seen = HashSet::new();
    let mut block = String::new();
    block.push_str(START_MARKER);
    block.push_str(newline);

    for domain in domains {
        for name in expand_subdomains(domain) {
            if !seen.insert(name.clone()) {
                continue;
            }
            block.push_str(&format!("127.0.0.1 {}{}", name, newline));
            block.push_str(&format!("::1 {}{}", name, newline));
        }
    }

    block.push_str(END_MARKER);
    block.push_str(newline);
    Some(block)
}

/// Line ending used by `contents`; CRLF if any line uses it.
pub fn detect_newline(contents: &str) -> &'static str {
    if contents.contains("\r\n") { "\r\n" } else { "\n" }
}

/// Byte range of the managed block in `contents`, end-exclusive and
/// including the end marker's line terminator.
fn find_block(contents: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut start = None;

    for line in contents.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']).trim();
        match start {
            None if trimmed == START_MARKER => start = Some(offset),
            Some(s) if trimmed == END_MARKER => return Some((s, offset + line.len())),
            _ => {}
        }
        offset += line.len();
    }

    // An unterminated block runs to the end of the file.
    start.map(|s| {
        warn!("Hosts file has a start marker without an end marker; replacing to end of file");
        (s, contents.len())
    })
}

/// Replace the managed block in `contents` with `block`.
///
/// `None` removes the block. A missing block is appended at the end.
pub fn splice(contents: &str, block: Option<&str>) -> String {
    match (find_block(contents), block) {
        (Some((start, end)), block) => {
            let mut out = String::with_capacity(contents.len());
            out.push_str(&contents[..start]);
            if let Some(block) = block {
                out.push_str(block);
            }
            out.push_str(&contents[end..]);
            out
        }
        (None, Some(block)) => {
            let mut out = contents.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push_str(detect_newline(contents));
            }
            out.push_str(block);
            out
        }
        (None, None) => contents.to_string(),
    }
}

/// Extract the managed block from `contents`, if present.
pub fn current_block(contents: &str) -> Option<&str> {
    find_block(contents).map(|(start, end)| &contents[start..end])
}
