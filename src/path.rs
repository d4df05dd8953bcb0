use std::fmt;

use crate::error::{Error, Result};

/// Canonical relative path inside the mounted tree.
///
/// The root is exactly `.`; every other path is `./a/b/c`. This is the form
/// the storage service expects in its `relPath` query parameter, so the
/// string inside is sent over the wire verbatim. Comparison is byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelPath(String);

impl RelPath {
    pub fn root() -> Self {
        RelPath(".".to_string())
    }

    /// Normalize an incoming path string into canonical form.
    ///
    /// Accepts `.`, `./a/b`, `a/b` and `/a/b` spellings; collapses redundant
    /// `./` prefixes and duplicate slashes. Rejects `..`, empty components
    /// after normalization, NUL bytes, and non-UTF-8 input is unrepresentable
    /// here by construction (`&str`).
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.contains('\0') {
            return Err(Error::InvalidArgument(format!(
                "path contains NUL byte: {:?}",
                raw
            )));
        }

        let mut components = Vec::new();
        for comp in raw.split('/') {
            match comp {
                "" | "." => continue,
                ".." => {
                    return Err(Error::InvalidArgument(format!(
                        "path traversal rejected: {:?}",
                        raw
                    )));
                }
                c => components.push(c),
            }
        }

        if components.is_empty() {
            return Ok(RelPath::root());
        }
        Ok(RelPath(format!("./{}", components.join("/"))))
    }

    /// Append a single child component.
    pub fn join(&self, name: &str) -> Result<RelPath> {
        validate_component(name)?;
        if self.is_root() {
            Ok(RelPath(format!("./{}", name)))
        } else {
            Ok(RelPath(format!("{}/{}", self.0, name)))
        }
    }

    pub fn parent(&self) -> Option<RelPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(1) => Some(RelPath::root()),
            Some(idx) => Some(RelPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    pub fn is_root(&self) -> bool {
        self.0 == "."
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `self` equals `prefix` or lives underneath it.
    pub fn starts_with(&self, prefix: &RelPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Rebase a path under `old` onto `new`. Returns `None` when `self` is
    /// not inside the `old` subtree.
    pub fn rebase(&self, old: &RelPath, new: &RelPath) -> Option<RelPath> {
        if self.0 == old.0 {
            return Some(new.clone());
        }
        if !self.starts_with(old) {
            return None;
        }
        let suffix = &self.0[old.0.len() + 1..];
        if new.is_root() {
            Some(RelPath(format!("./{}", suffix)))
        } else {
            Some(RelPath(format!("{}/{}", new.0, suffix)))
        }
    }
}

fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty path component".to_string()));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!(
            "reserved path component: {:?}",
            name
        )));
    }
    if name.contains('/') {
        return Err(Error::InvalidArgument(format!(
            "path component contains '/': {:?}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidArgument(format!(
            "path component contains NUL byte: {:?}",
            name
        )));
    }
    Ok(())
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_forms() {
        assert_eq!(RelPath::parse("").unwrap(), RelPath::root());
        assert_eq!(RelPath::parse(".").unwrap(), RelPath::root());
        assert_eq!(RelPath::parse("./").unwrap(), RelPath::root());
        assert_eq!(RelPath::parse("/").unwrap(), RelPath::root());
        assert!(RelPath::root().is_root());
    }

    #[test]
    fn test_normalization() {
        assert_eq!(RelPath::parse("a/b").unwrap().as_str(), "./a/b");
        assert_eq!(RelPath::parse("/a/b").unwrap().as_str(), "./a/b");
        assert_eq!(RelPath::parse("./a/b").unwrap().as_str(), "./a/b");
        assert_eq!(RelPath::parse(".///a//b/").unwrap().as_str(), "./a/b");
        assert_eq!(RelPath::parse("././a").unwrap().as_str(), "./a");
    }

    #[test]
    fn test_rejections() {
        assert!(RelPath::parse("../etc").is_err());
        assert!(RelPath::parse("a/../b").is_err());
        assert!(RelPath::parse("a/\0b").is_err());
        assert!(RelPath::root().join("").is_err());
        assert!(RelPath::root().join(".").is_err());
        assert!(RelPath::root().join("..").is_err());
        assert!(RelPath::root().join("a/b").is_err());
        assert!(RelPath::root().join("a\0").is_err());
    }

    #[test]
    fn test_join_and_parent() {
        let a = RelPath::root().join("a").unwrap();
        let ab = a.join("b").unwrap();
        assert_eq!(a.as_str(), "./a");
        assert_eq!(ab.as_str(), "./a/b");
        assert_eq!(ab.parent().unwrap(), a);
        assert_eq!(a.parent().unwrap(), RelPath::root());
        assert!(RelPath::root().parent().is_none());
        assert_eq!(ab.file_name(), Some("b"));
        assert!(RelPath::root().file_name().is_none());
    }

    #[test]
    fn test_starts_with() {
        let a = RelPath::parse("./a").unwrap();
        let ab = RelPath::parse("./a/b").unwrap();
        let abc = RelPath::parse("./a/bc").unwrap();
        assert!(ab.starts_with(&a));
        assert!(a.starts_with(&a));
        assert!(ab.starts_with(&RelPath::root()));
        assert!(!abc.starts_with(&ab));
        assert!(!a.starts_with(&ab));
    }

    #[test]
    fn test_rebase() {
        let old = RelPath::parse("./a").unwrap();
        let new = RelPath::parse("./x/y").unwrap();
        let child = RelPath::parse("./a/b/c").unwrap();
        assert_eq!(child.rebase(&old, &new).unwrap().as_str(), "./x/y/b/c");
        assert_eq!(old.rebase(&old, &new).unwrap(), new);
        let outside = RelPath::parse("./other").unwrap();
        assert!(outside.rebase(&old, &new).is_none());
    }

    #[test]
    fn test_unicode_names() {
        let name = "re\u{0301}sume\u{0301}.txt";
        let p = RelPath::root().join(name).unwrap();
        assert_eq!(p.file_name(), Some(name));
        assert_eq!(RelPath::parse(p.as_str()).unwrap(), p);
    }
}
