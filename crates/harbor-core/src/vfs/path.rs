//! Virtual path normalization
//!
//! Virtual paths are always `/`-separated, regardless of the host OS.

use crate::{Error, Result};

/// Normalize a virtual path.
///
/// Removes `.` and empty segments, applies `..`, and forces a single
/// leading `/`. A `..` that would climb above `/` is an escape attempt and
/// yields `Error::PathOutsideRoot` rather than being clamped.
///
/// # Errors
///
/// `InvalidPath` for NUL bytes, `PathOutsideRoot` for escapes.
pub fn normalize(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(Error::InvalidPath("path contains invalid characters".into()));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::PathOutsideRoot(path.to_string()));
                }
            }
            name => segments.push(name),
        }
    }

    Ok(format!("/{}", segments.join("/")))
}

/// Join a base path with a relative one and normalize the result.
///
/// An absolute `relative` replaces the base.
///
/// # Errors
///
/// Same as [`normalize`].
pub fn join(base: &str, relative: &str) -> Result<String> {
    if relative.starts_with('/') {
        normalize(relative)
    } else {
        normalize(&format!("{}/{}", base, relative))
    }
}

/// Check whether `path` is `prefix` or lives below it.
///
/// Both arguments must already be normalized.
pub fn is_within(prefix: &str, path: &str) -> bool {
    prefix == "/"
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Express `target` relative to `base`.
///
/// Identical paths give an empty string. A descendant gives its bare
/// suffix, anything else climbs with `../` segments until a common ancestor
/// is found. Trailing separators are not significant. When either side is
/// not absolute there is no common root to climb to and `target` is
/// returned unchanged.
pub fn relativize(base: &str, target: &str) -> String {
    let base = trim_trailing_separator(if base.is_empty() { "/" } else { base });
    let target_trimmed = trim_trailing_separator(target);

    if base == target_trimmed {
        return String::new();
    }
    if !base.starts_with('/') || !target_trimmed.starts_with('/') {
        return target.to_string();
    }

    let mut climbed = String::new();
    let mut current = base.to_string();
    loop {
        let dir_prefix = if current == "/" {
            "/".to_string()
        } else {
            format!("{}/", current)
        };
        if let Some(rest) = target_trimmed.strip_prefix(dir_prefix.as_str()) {
            climbed.push_str(rest);
            return climbed;
        }
        if current == target_trimmed {
            return climbed;
        }

        climbed.push_str("../");
        current = parent(&current);
    }
}

fn trim_trailing_separator(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}
