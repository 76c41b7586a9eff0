//! Line segmentation.
//!
//! Scheme text and captured process output are both handled as sequences of
//! lines where every element keeps exactly one trailing `\n`. Multi-line
//! blocks are rebuilt by plain concatenation, so a file body or an expected
//! stdout comes out the same whether or not the source ended with a newline.
//!
//! Lines are raw bytes. Nothing here assumes UTF-8.

use thiserror::Error;

/// Longest line accepted, in bytes (excluding the line break).
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Error returned when text cannot be split into lines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("line {line} is {len} bytes long, the limit is {MAX_LINE_LEN}")]
    TooLong { line: usize, len: usize },
}

/// Split `text` into `\n`-terminated lines.
///
/// A `\r` directly before a line break is dropped. Empty input yields no
/// lines; a final line without a terminator still gets one.
pub fn split(text: &[u8]) -> Result<Vec<Vec<u8>>, LineError> {
    let mut lines = Vec::new();
    for (idx, raw) in text.split_inclusive(|&b| b == b'\n').enumerate() {
        let content = raw.strip_suffix(b"\n").unwrap_or(raw);
        let content = content.strip_suffix(b"\r").unwrap_or(content);
        if content.len() > MAX_LINE_LEN {
            return Err(LineError::TooLong {
                line: idx + 1,
                len: content.len(),
            });
        }
        let mut line = Vec::with_capacity(content.len() + 1);
        line.extend_from_slice(content);
        line.push(b'\n');
        lines.push(line);
    }
    Ok(lines)
}
