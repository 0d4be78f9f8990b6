//! Common types used throughout graphdrive.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Absolute location of an item in the signed-in user's drive.
///
/// Stored normalized as `/`-joined segments with one leading slash
/// (`/` for the drive root). The client crate turns it into the
/// `root:/a/b:` addressing Graph uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DrivePath(String);

impl DrivePath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalize user input.
    ///
    /// Backslashes count as separators and surrounding separators are
    /// dropped, so `Test/`, `/Test` and `Test` name the same folder.
    ///
    /// # Errors
    /// - `InvalidInput` for empty segments (`a//b`) and `.` or `..`
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let unified = raw.replace('\\', "/");
        let inner = unified.trim_matches('/');
        if inner.is_empty() {
            return Ok(Self::root());
        }

        for segment in inner.split('/') {
            check_segment(segment, raw)?;
        }
        Ok(Self(format!("/{}", inner)))
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Containing folder; `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
        }
    }

    /// Last segment; `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Path of the child `name` inside this folder.
    pub fn join(&self, name: &str) -> crate::Result<Self> {
        if name.contains(['/', '\\']) {
            return Err(crate::Error::InvalidInput(format!(
                "Item name cannot contain a separator: {}",
                name
            )));
        }
        check_segment(name, name)?;

        if self.is_root() {
            Ok(Self(format!("/{}", name)))
        } else {
            Ok(Self(format!("{}/{}", self.0, name)))
        }
    }

    /// Segments from the root down, empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_segment(segment: &str, whole: &str) -> crate::Result<()> {
    match segment {
        "" => Err(crate::Error::InvalidInput(format!(
            "Empty segment in path: {}",
            whole
        ))),
        "." | ".." => Err(crate::Error::InvalidInput(format!(
            "Relative segments are not supported: {}",
            whole
        ))),
        _ => Ok(()),
    }
}

impl std::str::FromStr for DrivePath {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DrivePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<DrivePath> for String {
    fn from(path: DrivePath) -> Self {
        path.0
    }
}

impl fmt::Display for DrivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential string that zeroizes on drop and never prints its value.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "SecretString(<empty>)")
        } else {
            write!(f, "SecretString([REDACTED])")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_root_forms() {
        for raw in ["", "/", "//", "\\\\"] {
            let path = DrivePath::parse(raw).unwrap();
            assert!(path.is_root(), "{raw:?}");
            assert_eq!(path.as_str(), "/");
            assert_eq!(path.segments().count(), 0);
        }
        assert!(DrivePath::root().name().is_none());
    }

    #[test]
    fn test_surrounding_separators_are_dropped() {
        let a = DrivePath::parse("Test/download_test/").unwrap();
        let b = DrivePath::parse("/Test/download_test").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.segments().collect::<Vec<_>>(), ["Test", "download_test"]);
    }

    #[test]
    fn test_windows_separators() {
        let path = DrivePath::parse("upload_test\\notes.txt").unwrap();
        assert_eq!(path.to_string(), "/upload_test/notes.txt");
    }

    #[test]
    fn test_invalid_segments() {
        assert!(DrivePath::parse("a//b").is_err());
        assert!(DrivePath::parse("a/../b").is_err());
        assert!(DrivePath::parse("./a").is_err());
        assert!(DrivePath::root().join("x/y").is_err());
        assert!(DrivePath::root().join("x\\y").is_err());
        assert!(DrivePath::root().join("..").is_err());
        assert!(DrivePath::root().join("").is_err());
    }

    #[test]
    fn test_navigation() {
        let docs = DrivePath::root().join("Documents").unwrap();
        let report = docs.join("Q3 report.xlsx").unwrap();

        assert_eq!(report.as_str(), "/Documents/Q3 report.xlsx");
        assert_eq!(report.name(), Some("Q3 report.xlsx"));
        assert_eq!(report.parent(), Some(docs.clone()));
        assert_eq!(docs.parent(), Some(DrivePath::root()));
        assert!(DrivePath::root().parent().is_none());
    }

    #[test]
    fn test_serde_goes_through_parse() {
        let path: DrivePath = serde_json::from_str("\"docs/a.txt\"").unwrap();
        assert_eq!(path.as_str(), "/docs/a.txt");
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"/docs/a.txt\"");
        assert!(serde_json::from_str::<DrivePath>("\"a/../b\"").is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretString::new("eyJ0eXAi");
        assert_eq!(format!("{:?}", secret), "SecretString([REDACTED])");
        assert_eq!(secret.expose(), "eyJ0eXAi");
    }

    #[test]
    fn test_secret_serializes_transparently() {
        let secret = SecretString::new("token");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"token\"");
    }

    proptest! {
        #[test]
        fn prop_normalization_is_idempotent(
            parts in proptest::collection::vec("[A-Za-z0-9_ #%-]{1,12}", 1..5),
            lead in "[/\\\\]{0,3}",
            trail in "[/\\\\]{0,3}",
        ) {
            let raw = format!("{}{}{}", lead, parts.join("/"), trail);
            let path = DrivePath::parse(&raw).unwrap();

            prop_assert_eq!(path.segments().count(), parts.len());
            prop_assert_eq!(path.as_str(), format!("/{}", parts.join("/")));
            prop_assert_eq!(DrivePath::parse(path.as_str()).unwrap(), path);
        }
    }
}
