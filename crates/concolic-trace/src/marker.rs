use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a marker records entry into or exit from a program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Enter,
    Exit,
}

impl MarkerKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "enter" => Some(MarkerKind::Enter),
            "exit" => Some(MarkerKind::Exit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerKind::Enter => "enter",
            MarkerKind::Exit => "exit",
        }
    }
}

/// A stable identifier for one instrumented program point.
///
/// Instrumented targets print `[<context>] enter|exit <label> <ordinal>`
/// on stderr; the context is usually the source file name and the label
/// the enclosing function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerId {
    /// Bracketed context (source file), when the instrumentation emits one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub kind: MarkerKind,
    pub label: String,
    pub ordinal: u32,
}

impl MarkerId {
    pub fn new(context: Option<&str>, kind: MarkerKind, label: &str, ordinal: u32) -> Self {
        Self {
            context: context.map(str::to_string),
            kind,
            label: label.to_string(),
            ordinal,
        }
    }

    /// Shorthand for an `enter` marker with a context.
    pub fn enter(context: &str, label: &str, ordinal: u32) -> Self {
        Self::new(Some(context), MarkerKind::Enter, label, ordinal)
    }

    /// Shorthand for an `exit` marker with a context.
    pub fn exit(context: &str, label: &str, ordinal: u32) -> Self {
        Self::new(Some(context), MarkerKind::Exit, label, ordinal)
    }

    pub fn is_enter(&self) -> bool {
        self.kind == MarkerKind::Enter
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "[{context}] ")?;
        }
        write!(f, "{} {} {}", self.kind.as_str(), self.label, self.ordinal)
    }
}

/// The set of distinct markers observed in one execution.
///
/// Ordered (BTreeSet) so signatures serialize and compare deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(BTreeSet<MarkerId>);

impl Signature {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, marker: MarkerId) -> bool {
        self.0.insert(marker)
    }

    pub fn contains(&self, marker: &MarkerId) -> bool {
        self.0.contains(marker)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerId> {
        self.0.iter()
    }

    /// Markers in `self` that are absent from `seen`.
    pub fn difference_from(&self, seen: &BTreeSet<MarkerId>) -> BTreeSet<MarkerId> {
        self.0.difference(seen).cloned().collect()
    }

    pub fn is_subset_of(&self, seen: &BTreeSet<MarkerId>) -> bool {
        self.0.is_subset(seen)
    }

    pub fn as_set(&self) -> &BTreeSet<MarkerId> {
        &self.0
    }
}

impl FromIterator<MarkerId> for Signature {
    fn from_iter<I: IntoIterator<Item = MarkerId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Signature {
    type Item = MarkerId;
    type IntoIter = std::collections::btree_set::IntoIter<MarkerId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_context() {
        let m = MarkerId::enter("count.c", "main", 14);
        assert_eq!(m.to_string(), "[count.c] enter main 14");
    }

    #[test]
    fn test_display_without_context() {
        let m = MarkerId::new(None, MarkerKind::Exit, "parse", 2);
        assert_eq!(m.to_string(), "exit parse 2");
    }

    #[test]
    fn test_enter_and_exit_are_distinct() {
        let mut sig = Signature::new();
        assert!(sig.insert(MarkerId::enter("a.c", "f", 1)));
        assert!(sig.insert(MarkerId::exit("a.c", "f", 1)));
        assert!(!sig.insert(MarkerId::enter("a.c", "f", 1)));
        assert_eq!(sig.len(), 2);
    }

    #[test]
    fn test_difference_and_subset() {
        let seen: BTreeSet<MarkerId> = [MarkerId::enter("a.c", "f", 1)].into_iter().collect();
        let sig: Signature = [MarkerId::enter("a.c", "f", 1), MarkerId::enter("a.c", "f", 2)]
            .into_iter()
            .collect();

        let new = sig.difference_from(&seen);
        assert_eq!(new.len(), 1);
        assert!(new.contains(&MarkerId::enter("a.c", "f", 2)));
        assert!(!sig.is_subset_of(&seen));
    }

    #[test]
    fn test_signature_serializes_as_list() {
        let sig: Signature = [MarkerId::enter("a.c", "f", 1)].into_iter().collect();
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.starts_with('['));
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }
}
