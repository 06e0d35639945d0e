//! Hierarchical namespaces and their flattened, escape-safe key form.
//!
//! A namespace such as `["user", "checklists", "tasks"]` flattens to
//! `user.checklists.tasks`. Each segment is percent-encoded before joining, and
//! the separator itself is encoded as `%2E`, so any segment survives the
//! round trip through [`Namespace::flatten`] and [`Namespace::explode`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator placed between flattened segments.
pub const SEPARATOR: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamespaceError {
    #[error("namespace must contain at least one segment")]
    Empty,
    #[error("namespace segment {index} is empty")]
    EmptySegment { index: usize },
    #[error("segment '{segment}' does not decode to UTF-8")]
    Malformed { segment: String },
}

/// Ordered sequence of non-empty segments identifying one entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Namespace(Vec<String>);

impl Namespace {
    pub fn new<I, S>(segments: I) -> Result<Self, NamespaceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(NamespaceError::Empty);
        }
        if let Some(index) = segments.iter().position(String::is_empty) {
            return Err(NamespaceError::EmptySegment { index });
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn last(&self) -> &str {
        // Non-empty by construction.
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// A new namespace one level below this one.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self, NamespaceError> {
        let segment = segment.into();
        if segment.is_empty() {
            return Err(NamespaceError::EmptySegment {
                index: self.0.len(),
            });
        }
        let mut segments = self.0.clone();
        segments.push(segment);
        Ok(Self(segments))
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Every prefix of this namespace, shortest first, ending with the namespace itself.
    ///
    /// This is the walk the registry performs to reach (or prune) a node: one
    /// routing hop per prefix.
    pub fn prefixes(&self) -> impl Iterator<Item = &[String]> + '_ {
        (1..=self.0.len()).map(move |end| &self.0[..end])
    }

    /// Canonical flattened key: percent-encoded segments joined by [`SEPARATOR`].
    pub fn flatten(&self) -> String {
        self.0
            .iter()
            .map(|segment| urlencoding::encode(segment).replace(SEPARATOR, "%2E"))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Inverse of [`Namespace::flatten`].
    pub fn explode(name: &str) -> Result<Self, NamespaceError> {
        let segments = name
            .split(SEPARATOR)
            .map(|segment| {
                urlencoding::decode(segment)
                    .map(|decoded| decoded.into_owned())
                    .map_err(|_| NamespaceError::Malformed {
                        segment: segment.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(segments)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten())
    }
}

impl FromStr for Namespace {
    type Err = NamespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::explode(s)
    }
}

impl TryFrom<Vec<String>> for Namespace {
    type Error = NamespaceError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Namespace> for Vec<String> {
    fn from(value: Namespace) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(segments: &[&str]) -> Namespace {
        Namespace::new(segments.iter().copied()).unwrap()
    }

    #[test]
    fn flattens_plain_segments_with_dots() {
        assert_eq!(ns(&["single", "user", "1"]).flatten(), "single.user.1");
    }

    #[test]
    fn separator_inside_a_segment_is_escaped() {
        let namespace = ns(&["list", "example.com", "a%b"]);
        let flat = namespace.flatten();
        assert_eq!(flat, "list.example%2Ecom.a%25b");
        assert_eq!(Namespace::explode(&flat).unwrap(), namespace);
    }

    #[test]
    fn round_trips_awkward_segments() {
        let cases: Vec<Vec<&str>> = vec![
            vec!["a"],
            vec!["...", "."],
            vec!["spaces and/slashes", "ünïcödé", "%2E"],
            vec!["tab\tnew\nline", "?&=#"],
        ];
        for segments in cases {
            let namespace = ns(&segments);
            let exploded = Namespace::explode(&namespace.flatten()).unwrap();
            assert_eq!(exploded, namespace, "round trip failed for {segments:?}");
        }
    }

    #[test]
    fn rejects_empty_namespaces_and_segments() {
        assert_eq!(
            Namespace::new(Vec::<String>::new()).unwrap_err(),
            NamespaceError::Empty
        );
        assert_eq!(
            Namespace::new(["a", ""]).unwrap_err(),
            NamespaceError::EmptySegment { index: 1 }
        );
        assert!(Namespace::explode("a..b").is_err());
        assert!(ns(&["a"]).child("").is_err());
    }

    #[test]
    fn prefixes_walk_down_the_tree() {
        let namespace = ns(&["user", "checklists", "tasks"]);
        let prefixes: Vec<Vec<String>> = namespace.prefixes().map(<[String]>::to_vec).collect();
        assert_eq!(
            prefixes,
            vec![
                vec!["user".to_string()],
                vec!["user".to_string(), "checklists".to_string()],
                vec![
                    "user".to_string(),
                    "checklists".to_string(),
                    "tasks".to_string()
                ],
            ]
        );
        assert_eq!(namespace.parent().unwrap(), ns(&["user", "checklists"]));
        assert!(ns(&["user"]).parent().is_none());
        assert_eq!(namespace.last(), "tasks");
    }

    #[test]
    fn serde_uses_segment_arrays() {
        let namespace = ns(&["form", "signup"]);
        let json = serde_json::to_string(&namespace).unwrap();
        assert_eq!(json, r#"["form","signup"]"#);
        let back: Namespace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, namespace);
        assert!(serde_json::from_str::<Namespace>("[]").is_err());
    }
}
