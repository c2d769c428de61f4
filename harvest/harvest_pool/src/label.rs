//! Labels identifying the logical sub-resource a handle targets.

use std::fmt;
use std::sync::Arc;

/// Tag naming the sub-resource a pooled handle belongs to, such as a named
/// graph IRI or an application database name.
///
/// Handles are looked up by label equality; several handles may carry the
/// same label. The empty label means "unlabeled".
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(Arc<str>);

impl Label {
    /// Create a label from any string
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    /// The label used when a backend has no sub-resources
    pub fn unlabeled() -> Self {
        Self::default()
    }

    /// Get the label text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the unlabeled default
    pub fn is_unlabeled(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({:?})", &*self.0)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlabeled() {
            f.write_str("<unlabeled>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Label {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&String> for Label {
    fn from(value: &String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
