//! Node path helpers
//!
//! Paths are absolute and `/`-separated. The root is `/`.

use crate::common::Result;

pub const ROOT: &str = "/";

/// Append segments to a base path
pub fn join(base: &str, segment: &str) -> String {
    if base == ROOT {
        format!("/{}", segment)
    } else {
        format!("{}/{}", base, segment)
    }
}

/// Parent of a path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Prefix shared by every descendant of `path`
pub fn descendant_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{}/", path)
    }
}

pub fn validate(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && (path == ROOT || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(crate::Error::InvalidPath(path.to_string()))
    }
}
