//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID value
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    DomainError::InvalidId(format!("Invalid {}: {e}", stringify!($name)))
                })
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Identifier for a detected conflict
    ConflictId
);

uuid_id!(
    /// Identifier for an admitted transfer (bandwidth slot)
    TransferId
);

uuid_id!(
    /// Identifier for a sync cycle; `cancel(session_id)` targets one transfer session
    SessionId
);

/// Identifier for queued offline modifications (database row ID)
///
/// Strictly increasing across process restarts; queue order is id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModificationId(i64);

impl ModificationId {
    /// Create a ModificationId from an i64 value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for ModificationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ModificationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Path type
// ============================================================================

/// A path relative to the sync scope, shared by the local and remote replicas
///
/// Format: starts with `/`, no empty, `.` or `..` components, no trailing
/// slash (except the root itself). `/Documents/report.docx` names the same
/// item on disk (under the sync root) and in the cloud.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncPath(String);

impl SyncPath {
    /// Create a new SyncPath
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is malformed
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Path must start with '/': {path}"
            )));
        }

        if path == "/" {
            return Ok(Self(path));
        }

        if path.ends_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Path must not end with '/': {path}"
            )));
        }

        for component in path[1..].split('/') {
            if component.is_empty() {
                return Err(DomainError::InvalidPath(format!(
                    "Path contains invalid double slashes: {path}"
                )));
            }
            if component == "." || component == ".." {
                return Err(DomainError::InvalidPath(format!(
                    "Path contains invalid traversal: {path}"
                )));
            }
        }

        Ok(Self(path))
    }

    /// Create the scope root "/"
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the scope root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Join a single path component
    ///
    /// # Errors
    /// Returns error if component is empty or contains separators/traversal
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty()
            || component.contains('/')
            || component == "."
            || component == ".."
        {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {component}"
            )));
        }

        let new_path = if self.is_root() {
            format!("/{component}")
        } else {
            format!("{}/{component}", self.0)
        };

        Self::new(new_path)
    }

    /// Get the parent path
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Get the last component
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }

        self.0.rsplit('/').next()
    }

    /// Replace the last component, keeping the parent
    ///
    /// # Errors
    /// Returns error for the root or an invalid name
    pub fn with_file_name(&self, name: &str) -> Result<Self, DomainError> {
        let parent = self
            .parent()
            .ok_or_else(|| DomainError::InvalidPath("Root has no file name".to_string()))?;
        parent.join(name)
    }

    /// Returns true if `self` equals `other` or lies beneath it
    #[must_use]
    pub fn is_within(&self, other: &SyncPath) -> bool {
        if other.is_root() || self.0 == other.0 {
            return true;
        }
        self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/')
    }

    /// Iterates over the ancestors of this path, nearest first, ending at the root
    pub fn ancestors(&self) -> impl Iterator<Item = SyncPath> {
        let mut current = self.parent();
        std::iter::from_fn(move || {
            let next = current.take()?;
            current = next.parent();
            Some(next)
        })
    }

    /// Components of the path, without the leading root
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SyncPath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for SyncPath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<SyncPath> for String {
    fn from(path: SyncPath) -> Self {
        path.0
    }
}

// ============================================================================
// Content and version types
// ============================================================================

/// Content hash of a file body (hex or provider-specific encoding)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Create a new ContentHash
    ///
    /// # Errors
    /// Returns error if the hash is empty or contains whitespace
    pub fn new(hash: String) -> Result<Self, DomainError> {
        if hash.is_empty() {
            return Err(DomainError::InvalidHash("Hash cannot be empty".to_string()));
        }
        if hash.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidHash(format!(
                "Hash contains whitespace: {hash}"
            )));
        }
        Ok(Self(hash))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Opaque remote version tag (ETag-like), changes on every remote write
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionTag(String);

impl VersionTag {
    /// Create a new VersionTag
    ///
    /// # Errors
    /// Returns error if the tag is empty
    pub fn new(tag: String) -> Result<Self, DomainError> {
        if tag.is_empty() {
            return Err(DomainError::InvalidVersionTag(
                "Version tag cannot be empty".to_string(),
            ));
        }
        Ok(Self(tag))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VersionTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VersionTag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for VersionTag {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<VersionTag> for String {
    fn from(tag: VersionTag) -> Self {
        tag.0
    }
}

/// Opaque change-feed position marker
///
/// `None` where a cursor is expected means "from scratch".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor(String);

impl Cursor {
    /// Create a new Cursor
    ///
    /// # Errors
    /// Returns error if the cursor is empty
    pub fn new(cursor: String) -> Result<Self, DomainError> {
        if cursor.is_empty() {
            return Err(DomainError::InvalidCursor(
                "Cursor cannot be empty".to_string(),
            ));
        }
        Ok(Self(cursor))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Cursor {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod sync_path_tests {
        use super::*;

        #[test]
        fn test_valid_paths() {
            assert!(SyncPath::new("/".to_string()).is_ok());
            assert!(SyncPath::new("/Documents".to_string()).is_ok());
            assert!(SyncPath::new("/Documents/report.docx".to_string()).is_ok());
            assert!(SyncPath::new("/notes..txt".to_string()).is_ok());
        }

        #[test]
        fn test_invalid_paths() {
            assert!(SyncPath::new("Documents".to_string()).is_err());
            assert!(SyncPath::new("/Documents//a".to_string()).is_err());
            assert!(SyncPath::new("/Documents/../etc".to_string()).is_err());
            assert!(SyncPath::new("/Documents/".to_string()).is_err());
            assert!(SyncPath::new("/./a".to_string()).is_err());
        }

        #[test]
        fn test_join_and_parent() {
            let root = SyncPath::root();
            let docs = root.join("Documents").unwrap();
            assert_eq!(docs.as_str(), "/Documents");
            let file = docs.join("report.docx").unwrap();
            assert_eq!(file.as_str(), "/Documents/report.docx");
            assert_eq!(file.parent(), Some(docs.clone()));
            assert_eq!(docs.parent(), Some(root.clone()));
            assert_eq!(root.parent(), None);
            assert!(docs.join("a/b").is_err());
            assert!(docs.join("..").is_err());
        }

        #[test]
        fn test_file_name() {
            let file: SyncPath = "/a/b/c.txt".parse().unwrap();
            assert_eq!(file.file_name(), Some("c.txt"));
            assert_eq!(SyncPath::root().file_name(), None);
        }

        #[test]
        fn test_with_file_name() {
            let file: SyncPath = "/a/old.txt".parse().unwrap();
            let renamed = file.with_file_name("new.txt").unwrap();
            assert_eq!(renamed.as_str(), "/a/new.txt");
            assert!(SyncPath::root().with_file_name("x").is_err());
        }

        #[test]
        fn test_is_within() {
            let docs: SyncPath = "/Documents".parse().unwrap();
            let file: SyncPath = "/Documents/a.txt".parse().unwrap();
            let sibling: SyncPath = "/DocumentsOld/a.txt".parse().unwrap();

            assert!(file.is_within(&docs));
            assert!(docs.is_within(&docs));
            assert!(file.is_within(&SyncPath::root()));
            assert!(!sibling.is_within(&docs));
            assert!(!docs.is_within(&file));
        }

        #[test]
        fn test_ancestors() {
            let file: SyncPath = "/a/b/c.txt".parse().unwrap();
            let ancestors: Vec<String> = file.ancestors().map(String::from).collect();
            assert_eq!(ancestors, vec!["/a/b", "/a", "/"]);
        }

        #[test]
        fn test_serde_roundtrip_validates() {
            let json = serde_json::to_string(&SyncPath::new("/a".to_string()).unwrap()).unwrap();
            assert_eq!(json, "\"/a\"");
            let bad: Result<SyncPath, _> = serde_json::from_str("\"a//b\"");
            assert!(bad.is_err());
        }
    }

    mod value_tests {
        use super::*;

        #[test]
        fn test_content_hash_validation() {
            assert!(ContentHash::new("abc123".to_string()).is_ok());
            assert!(ContentHash::new(String::new()).is_err());
            assert!(ContentHash::new("ab c".to_string()).is_err());
        }

        #[test]
        fn test_version_tag_and_cursor_reject_empty() {
            assert!(VersionTag::new(String::new()).is_err());
            assert!(Cursor::new(String::new()).is_err());
            assert_eq!(Cursor::new("c1".to_string()).unwrap().as_str(), "c1");
        }

        #[test]
        fn test_uuid_ids_parse() {
            let id = ConflictId::new();
            let parsed: ConflictId = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
            assert!("not-a-uuid".parse::<TransferId>().is_err());
        }

        #[test]
        fn test_modification_id_ordering() {
            assert!(ModificationId::new(1) < ModificationId::new(2));
            assert_eq!(ModificationId::from(7).as_i64(), 7);
        }
    }
}
