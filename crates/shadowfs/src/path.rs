//! Slash-separated path helpers for logical and physical namespaces.

use crate::codec::{self, EncodeError};

/// Normalize a path: backslashes become slashes, empty and `.` components are
/// dropped, `..` pops. The result is always absolute.
pub fn clean(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// True when `path` names the namespace root.
pub fn is_root(path: &str) -> bool {
    clean(path) == "/"
}

/// Split a path into its cleaned parent directory and leaf name.
pub fn split_target(path: &str) -> (String, String) {
    let cleaned = clean(path);
    match cleaned.rfind('/') {
        Some(0) => ("/".to_string(), cleaned[1..].to_string()),
        Some(idx) => (cleaned[..idx].to_string(), cleaned[idx + 1..].to_string()),
        None => ("/".to_string(), cleaned),
    }
}

/// Join a directory and a name with exactly one separator.
pub fn join(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        return format!("/{}", name);
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Leaf name of a path.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Parent directory of a path (`/` for top-level entries).
pub fn parent(path: &str) -> String {
    split_target(path).0
}

/// Map a logical path onto physical names, component by component.
///
/// Each component is addressed by its first (authoritative) segment, with
/// clash index 0. Leading and trailing slashes are preserved.
pub fn encode_path(path: &str, max_len: usize) -> Result<String, EncodeError> {
    let normalized = path.replace('\\', "/");
    let mut encoded = Vec::new();
    for comp in normalized.split('/').filter(|c| !c.is_empty()) {
        let mut names = codec::encode(comp, max_len, 0)?;
        encoded.push(names.swap_remove(0));
    }
    let mut out = encoded.join("/");
    if normalized.starts_with('/') {
        out.insert(0, '/');
    }
    if normalized.ends_with('/') && !out.ends_with('/') {
        out.push('/');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("/a//b/./c/"), "/a/b/c");
        assert_eq!(clean("a\\b\\..\\c"), "/a/c");
        assert_eq!(clean(""), "/");
        assert_eq!(clean("/.."), "/");
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("/a/b/c"), ("/a/b".to_string(), "c".to_string()));
        assert_eq!(split_target("/c/"), ("/".to_string(), "c".to_string()));
        assert_eq!(split_target("a\\b"), ("/a".to_string(), "b".to_string()));
    }

    #[test]
    fn test_join_and_base_name() {
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("/", "b"), "/b");
        assert_eq!(join("/a/", "/b"), "/a/b");
        assert_eq!(base_name("/a/b"), "b");
        assert_eq!(base_name("/a/b/"), "b");
        assert_eq!(base_name("b"), "b");
        assert_eq!(parent("/a/b"), "/a");
    }

    #[test]
    fn test_encode_path_uses_first_segment() {
        let long = "x".repeat(200);
        let path = format!("/sddf//{}/sdf/", long);
        let encoded = encode_path(&path, 64).unwrap();
        assert!(encoded.starts_with('/'));
        assert!(encoded.ends_with('/'));

        let comps: Vec<&str> = encoded.trim_matches('/').split('/').collect();
        assert_eq!(comps.len(), 3);
        assert_eq!(comps[0], codec::encode("sddf", 64, 0).unwrap()[0]);
        assert_eq!(comps[1], codec::encode(&long, 64, 0).unwrap()[0]);
        assert!(codec::is_split_name(comps[1]));
        assert!(comps.iter().all(|c| c.len() <= 64));
    }

    #[test]
    fn test_encode_root() {
        assert_eq!(encode_path("/", 64).unwrap(), "/");
        assert_eq!(encode_path("", 64).unwrap(), "");
    }
}
