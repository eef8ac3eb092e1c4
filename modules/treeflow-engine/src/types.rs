//! Identifiers, paths and reasons shared by every part of the engine.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use serde_json::Value;

/// Identifier of a component or of a property.
pub type Key = Arc<str>;

pub fn key(s: &str) -> Key {
    Arc::from(s)
}

// ---------------------------------------------------------------------------
// Indices
// ---------------------------------------------------------------------------

/// Arena slot of a component. Recycled after the component is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentUid(pub usize);

impl ComponentUid {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ComponentUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Arena slot of a property node, also the index into the flat values array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Path
// ---------------------------------------------------------------------------

/// Absolute path from the root: `[root, panel, button]`.
///
/// Node paths carry the property id as their last element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<Key>);

impl Path {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn root(id: impl Into<Key>) -> Self {
        Self(vec![id.into()])
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(segments.into_iter().map(|s| key(s.as_ref())).collect())
    }

    /// Parse a `/`-separated path such as `root/panel/button`.
    pub fn parse(s: &str) -> Self {
        Self::from_segments(s.split('/').filter(|seg| !seg.is_empty()))
    }

    pub fn child(&self, id: impl Into<Key>) -> Path {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.extend(self.0.iter().cloned());
        segments.push(id.into());
        Path(segments)
    }

    /// The path with its last element dropped; `None` for an empty path.
    pub fn parent(&self) -> Option<Path> {
        if self.0.is_empty() {
            return None;
        }
        Some(Path(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn last(&self) -> Option<&Key> {
        self.0.last()
    }

    pub fn push(&mut self, id: impl Into<Key>) {
        self.0.push(id.into());
    }

    pub fn as_slice(&self) -> &[Key] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Key> {
        self.0
    }
}

impl Deref for Path {
    type Target = [Key];

    fn deref(&self) -> &[Key] {
        &self.0
    }
}

impl Borrow<[Key]> for Path {
    fn borrow(&self) -> &[Key] {
        &self.0
    }
}

impl From<Vec<Key>> for Path {
    fn from(segments: Vec<Key>) -> Self {
        Self(segments)
    }
}

impl FromIterator<Key> for Path {
    fn from_iter<T: IntoIterator<Item = Key>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relative paths
// ---------------------------------------------------------------------------

/// One element of a declared dependency path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    /// Resolve from the owning component itself.
    This,
    /// Climb one level above the owning component's parent.
    Up,
    /// Any current child at this level.
    Wildcard,
    Key(Key),
}

impl Segment {
    pub fn named(id: &str) -> Self {
        Segment::Key(key(id))
    }

    pub fn as_key(&self) -> Option<&Key> {
        match self {
            Segment::Key(k) => Some(k),
            _ => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::This => f.write_str("this"),
            Segment::Up => f.write_str("_"),
            Segment::Wildcard => f.write_str("*"),
            Segment::Key(k) => f.write_str(k),
        }
    }
}

/// Marker anchoring a declared path at the owning component.
pub const THIS_MARKER: &str = "this";
/// Marker climbing one level.
pub const UP_MARKER: &str = "_";
/// Marker matching every child at its level.
pub const WILDCARD_MARKER: &str = "*";

impl Segment {
    /// Read one textual segment, recognising the standard markers.
    pub fn parse(s: &str) -> Self {
        match s {
            THIS_MARKER => Segment::This,
            UP_MARKER => Segment::Up,
            WILDCARD_MARKER => Segment::Wildcard,
            other => Segment::named(other),
        }
    }
}

/// A dependency path as declared by an evolver, relative to the owning component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativePath(Vec<Segment>);

impl RelativePath {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// `RelativePath::parse(&["this", "*", "x"])`
    pub fn parse(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| Segment::parse(s)).collect())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if any segment is a wildcard.
    pub fn is_ambiguous(&self) -> bool {
        self.0.iter().any(|s| matches!(s, Segment::Wildcard))
    }

    /// The path with the trailing property segment removed. Reasons name the
    /// referenced component, never the property.
    pub fn without_last(&self) -> RelativePath {
        let end = self.0.len().saturating_sub(1);
        RelativePath(self.0[..end].to_vec())
    }
}

impl FromIterator<Segment> for RelativePath {
    fn from_iter<T: IntoIterator<Item = Segment>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{segment}")?;
        }
        f.write_str("]")
    }
}

// ---------------------------------------------------------------------------
// Reasons
// ---------------------------------------------------------------------------

/// An external event delivered by a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Reason kind used for interest tests (`mouse`, `keyboard`, `timer`, ...).
    pub channel: Key,
    pub payload: Value,
}

/// Why a node is being recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reason {
    /// The external event itself, for directly interested nodes.
    Input(Arc<InputEvent>),
    /// Which dependency fired, as seen from the dependent.
    Dependency(RelativePath),
}

impl Reason {
    pub fn input(channel: &str, payload: Value) -> Self {
        Reason::Input(Arc::new(InputEvent {
            channel: key(channel),
            payload,
        }))
    }

    pub fn channel(&self) -> Option<&Key> {
        match self {
            Reason::Input(event) => Some(&event.channel),
            Reason::Dependency(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Reason::Input(event) => Some(&event.payload),
            Reason::Dependency(_) => None,
        }
    }

    pub fn cause(&self) -> Option<&RelativePath> {
        match self {
            Reason::Dependency(path) => Some(path),
            Reason::Input(_) => None,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Input(event) => write!(f, "input:{}", event.channel),
            Reason::Dependency(path) => write!(f, "dependency:{path}"),
        }
    }
}

/// Log-friendly rendering of an optional reason.
pub(crate) fn reason_label(reason: Option<&Reason>) -> String {
    match reason {
        Some(reason) => reason.to_string(),
        None => "<init>".to_string(),
    }
}

/// Truncated rendering of a value for trace output.
pub(crate) fn preview(value: Option<&Value>, max_len: usize) -> String {
    let Some(value) = value else {
        return "<none>".to_string();
    };
    let s = value.to_string();
    if s.chars().count() > max_len {
        let cut: String = s.chars().take(max_len).collect();
        format!("{cut}...")
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parse_and_display() {
        let path = Path::parse("root/panel/button");
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "root/panel/button");
        assert_eq!(path.parent().unwrap().to_string(), "root/panel");
        assert_eq!(path.child("x").to_string(), "root/panel/button/x");
    }

    #[test]
    fn empty_path_has_no_parent() {
        assert!(Path::new().parent().is_none());
    }

    #[test]
    fn relative_path_strips_property() {
        let rel = RelativePath::new(vec![Segment::This, Segment::named("btn"), Segment::named("x")]);
        assert_eq!(rel.without_last().to_string(), "[this btn]");
        assert!(!rel.is_ambiguous());
        assert!(RelativePath::parse(&["_", "*", "x"]).is_ambiguous());
        assert_eq!(RelativePath::parse(&["_", "_", "x"]).segments()[1], Segment::Up);
    }

    #[test]
    fn preview_truncates_long_values() {
        let long = Value::String("a".repeat(300));
        let out = preview(Some(&long), 10);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), 13);
        assert_eq!(preview(None, 10), "<none>");
    }
}
