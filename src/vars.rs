//! Placeholder substitution for scheme values.

use std::path::Path;

/// Placeholder replaced with the fixture root directory.
pub const DIR_PLACEHOLDER: &str = "{dir}";

/// Replace every `{dir}` in `text` with `root`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// let out = exectest::vars::substitute("cd {dir} && ls {dir}/a", Path::new("/tmp/x"));
/// assert_eq!(out, "cd /tmp/x && ls /tmp/x/a");
/// ```
pub fn substitute(text: &str, root: &Path) -> String {
    Vars::new(root).apply(text)
}

/// Substitution values for one invocation.
///
/// The root path is rendered once and reused for every line.
#[derive(Debug, Clone)]
pub struct Vars {
    dir: String,
}

impl Vars {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.display().to_string(),
        }
    }

    pub fn apply(&self, text: &str) -> String {
        if text.contains(DIR_PLACEHOLDER) {
            text.replace(DIR_PLACEHOLDER, &self.dir)
        } else {
            text.to_string()
        }
    }

    /// Like [`Vars::apply`], for payload that need not be UTF-8.
    pub fn apply_bytes(&self, text: &[u8]) -> Vec<u8> {
        let needle = DIR_PLACEHOLDER.as_bytes();
        let mut out = Vec::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.windows(needle.len()).position(|w| w == needle) {
            out.extend_from_slice(&rest[..pos]);
            out.extend_from_slice(self.dir.as_bytes());
            rest = &rest[pos + needle.len()..];
        }
        out.extend_from_slice(rest);
        out
    }
}
