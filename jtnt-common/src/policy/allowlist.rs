//! Path and binary allowlist matching.
//!
//! Glob semantics: literal equality, shell-style `*` within a single path
//! segment, and a trailing `/*` that matches any immediate or deeper
//! descendant of the directory (`/etc/jtnt/*` matches both `/etc/jtnt/x`
//! and `/etc/jtnt/a/b`).

use crate::policy::enforcer::PolicyViolation;

/// A set of allowlist patterns matched against cleaned paths.
#[derive(Debug, Clone)]
pub struct Allowlist {
    patterns: Vec<String>,
}

impl Allowlist {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.to_vec(),
        }
    }

    /// Whether any pattern matches `path`. An empty allowlist denies all.
    pub fn allows(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let cleaned = clean_path(path);
        self.patterns
            .iter()
            .any(|pattern| match_pattern(&clean_path(pattern), &cleaned))
    }
}

/// Whether a glob pattern matches a path.
pub fn match_pattern(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }

    if glob_match(pattern, path) {
        return true;
    }

    // Trailing /* (or \*) matches the directory itself and any descendant.
    for sep in ['/', '\\'] {
        let suffix = format!("{sep}*");
        if let Some(dir) = pattern.strip_suffix(&suffix) {
            if path == dir {
                return true;
            }
            if path.starts_with(dir) && path[dir.len()..].starts_with(sep) {
                return true;
            }
        }
    }

    false
}

/// Single-segment shell-style `*` matcher: a `*` never crosses a path
/// separator.
fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = path.chars().collect();
    glob_match_at(&pat, &txt)
}

fn glob_match_at(pat: &[char], txt: &[char]) -> bool {
    match pat.split_first() {
        None => txt.is_empty(),
        Some(('*', rest)) => {
            // Try every extension of the star within the current segment.
            for skip in 0..=txt.len() {
                if skip > 0 && (txt[skip - 1] == '/' || txt[skip - 1] == '\\') {
                    break;
                }
                if glob_match_at(rest, &txt[skip..]) {
                    return true;
                }
            }
            false
        }
        Some((c, rest)) => match txt.split_first() {
            Some((t, txt_rest)) if t == c => glob_match_at(rest, txt_rest),
            _ => false,
        },
    }
}

/// Normalize a path: collapse repeated separators and drop `.` segments.
/// `..` segments are kept so traversal validation can see them.
fn clean_path(path: &str) -> String {
    let sep = if path.contains('\\') { '\\' } else { '/' };
    let absolute = path.starts_with(sep);
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(sep) {
        if part.is_empty() || part == "." {
            continue;
        }
        parts.push(part);
    }
    let joined = parts.join(&sep.to_string());
    if absolute {
        format!("{sep}{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Whether `binary` matches an allowed-binary entry by basename,
/// case-insensitively, with Windows launcher extensions stripped.
pub fn allows_binary(allowed: &[String], binary: &str) -> bool {
    let name = normalize_binary_name(binary);
    allowed
        .iter()
        .any(|entry| normalize_binary_name(entry) == name)
}

fn normalize_binary_name(binary: &str) -> String {
    let base = binary
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(binary)
        .to_ascii_lowercase();
    for ext in [".exe", ".cmd", ".bat"] {
        if let Some(stripped) = base.strip_suffix(ext) {
            return stripped.to_string();
        }
    }
    base
}

/// Reject paths that could escape their allowlisted directory.
pub fn validate_path(path: &str) -> Result<(), PolicyViolation> {
    let cleaned = clean_path(path);
    if cleaned.split(['/', '\\']).any(|part| part == "..") {
        return Err(PolicyViolation::PathTraversal(path.to_string()));
    }

    // Literal patterns caught even where cleaning would have folded them.
    for suspicious in ["/../", "\\..\\", "/./", "\\.\\"] {
        if path.contains(suspicious) {
            return Err(PolicyViolation::PathTraversal(path.to_string()));
        }
    }

    Ok(())
}
