//! Path rules shared by every index operation

use vlt_core::{VltError, VltResult};

/// What a delete request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    /// A single file
    Exact(String),
    /// Every file under a folder; holds the folder path with its trailing `/`
    Prefix(String),
}

/// Check a path for a file that is about to be added.
pub fn validate_file_path(path: &str) -> VltResult<()> {
    if !path.starts_with('/') {
        return Err(VltError::user("path must start with /"));
    }
    if path.len() < 2 {
        return Err(VltError::user("path must name a file"));
    }
    if path.ends_with('/') {
        return Err(VltError::user("path cannot end with /"));
    }
    for component in path[1..].split('/') {
        match component {
            "" => return Err(VltError::user("path cannot contain empty components")),
            "." | ".." => {
                return Err(VltError::user("path cannot contain . or .. components"))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Normalize a lookup path: must be absolute, a trailing `/` is dropped.
pub fn normalize_lookup(path: &str) -> VltResult<&str> {
    if !path.starts_with('/') {
        return Err(VltError::user("path must start with /"));
    }
    if path.len() > 1 {
        Ok(path.strip_suffix('/').unwrap_or(path))
    } else {
        Ok(path)
    }
}

/// Parse a delete request: `/a/b` removes one file, `/a/*` everything under `/a`.
pub fn parse_delete_target(path: &str) -> VltResult<DeleteTarget> {
    if !path.starts_with('/') {
        return Err(VltError::user("path must start with /"));
    }
    if let Some(folder) = path.strip_suffix('*') {
        if !folder.ends_with('/') {
            return Err(VltError::user(
                "path cannot end with *: removing globs is supported only for folders using /* as suffix",
            ));
        }
        return Ok(DeleteTarget::Prefix(folder.to_string()));
    }
    if path.ends_with('/') {
        return Err(VltError::user(
            "path cannot end with /; to remove a folder, end with /*",
        ));
    }
    Ok(DeleteTarget::Exact(path.to_string()))
}

/// Non-empty components of an absolute path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Join a folder path and a child name.
pub fn join(folder: &str, name: &str) -> String {
    if folder.ends_with('/') {
        format!("{folder}{name}")
    } else {
        format!("{folder}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_path() {
        for ok in ["/a", "/a/b.txt", "/photos/2024/img 1.jpg", "/.hidden"] {
            validate_file_path(ok).unwrap_or_else(|e| panic!("{ok}: {e}"));
        }
        for bad in ["", "/", "a/b", "/a/", "/a//b", "/a/./b", "/a/../b", "/.."] {
            let err = validate_file_path(bad).unwrap_err();
            assert!(err.is_user_error(), "{bad}");
        }
    }

    #[test]
    fn test_normalize_lookup() {
        assert_eq!(normalize_lookup("/").unwrap(), "/");
        assert_eq!(normalize_lookup("/a/").unwrap(), "/a");
        assert_eq!(normalize_lookup("/a/b").unwrap(), "/a/b");
        assert!(normalize_lookup("a").is_err());
    }

    #[test]
    fn test_parse_delete_target() {
        assert_eq!(
            parse_delete_target("/a/b").unwrap(),
            DeleteTarget::Exact("/a/b".into())
        );
        assert_eq!(
            parse_delete_target("/a/*").unwrap(),
            DeleteTarget::Prefix("/a/".into())
        );
        assert_eq!(
            parse_delete_target("/*").unwrap(),
            DeleteTarget::Prefix("/".into())
        );
        assert!(parse_delete_target("/a/").is_err());
        assert!(parse_delete_target("/a*").is_err());
        assert!(parse_delete_target("a/b").is_err());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }
}
