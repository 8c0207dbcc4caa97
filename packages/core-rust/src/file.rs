//! File content value type and request-path normalization shared by all
//! file providers.

use bytes::Bytes;

/// Content returned by a [`FileProvider`](crate::FileProvider) lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// Normalized path the content was found under.
    pub path: String,
    /// Raw file bytes.
    pub data: Bytes,
}

impl FileContent {
    #[must_use]
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }

    /// Returns the content as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Normalize a request path into a relative, `/`-separated path.
///
/// Leading separators, empty segments and `.` segments are dropped, and
/// backslashes are treated as separators. Returns `None` when the path
/// names no file (empty after normalization) or tries to climb out of the
/// root with `..`.
#[must_use]
pub fn normalize_path(path: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn strips_leading_slash_and_dots() {
        assert_eq!(normalize_path("/Info.txt").as_deref(), Some("Info.txt"));
        assert_eq!(normalize_path("./a//b/./c.css").as_deref(), Some("a/b/c.css"));
        assert_eq!(normalize_path("a\\b.txt").as_deref(), Some("a/b.txt"));
    }

    #[test]
    fn rejects_parent_segments() {
        assert!(normalize_path("../secret").is_none());
        assert!(normalize_path("/a/../../b").is_none());
    }

    #[test]
    fn empty_path_names_no_file() {
        assert!(normalize_path("").is_none());
        assert!(normalize_path("/").is_none());
        assert!(normalize_path("/./").is_none());
    }

    #[test]
    fn content_exposes_utf8_text() {
        let content = FileContent::new("Info.txt", "hello");
        assert_eq!(content.as_str(), Some("hello"));
        assert_eq!(content.len(), 5);
        assert!(!content.is_empty());
    }

    proptest! {
        #[test]
        fn normalized_paths_never_escape(path in "[a-z./\\\\]{0,24}") {
            if let Some(normalized) = normalize_path(&path) {
                prop_assert!(!normalized.starts_with('/'));
                prop_assert!(normalized.split('/').all(|s| !s.is_empty() && s != "." && s != ".."));
            }
        }
    }
}
