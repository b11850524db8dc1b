use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::policy::path;

/// A grant authored in the graph editor: role node `from` may reach page `to`.
///
/// Both ends are optional on the wire so a half-drawn connection deserializes
/// and can be skipped by the compiler instead of failing the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Literal(String),
    /// `[name]`: matches exactly one non-empty path segment
    Param(String),
}

impl Segment {
    /// Parse one normalized segment, accepting `[id]`, `:id` and `{id}` for
    /// parameters.
    fn parse(raw: &str) -> Self {
        let param = raw
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .or_else(|| raw.strip_prefix(':'))
            .or_else(|| raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')));
        match param {
            Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
            _ => Segment::Literal(raw.to_string()),
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Param(name) => write!(f, "[{name}]"),
        }
    }
}

/// Normalized route template. Its canonical text uses `[name]` for every
/// parameter, so two spellings of the same template compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutePattern {
    canonical: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Self {
        let normalized = path::normalize(raw);
        // The directory namespace spells the root as "."
        let normalized = if normalized == path::ROOT_DIRECTORY_KEY {
            String::new()
        } else {
            normalized
        };
        let segments: Vec<Segment> = path::segments(&normalized).map(Segment::parse).collect();
        let canonical = segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            canonical,
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_dynamic(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Param(_)))
    }
}

impl std::fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Compiled role → allowed route patterns. Immutable once built by the
/// compiler or the codec; a new policy is a new table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessTable {
    roles: BTreeMap<String, BTreeSet<RoutePattern>>,
}

impl AccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the grant was already present.
    pub(crate) fn insert(&mut self, role: &str, pattern: RoutePattern) -> bool {
        self.roles.entry(role.to_string()).or_default().insert(pattern)
    }

    /// Make `role` known without granting it anything.
    pub(crate) fn declare_role(&mut self, role: &str) {
        self.roles.entry(role.to_string()).or_default();
    }

    pub fn routes_for(&self, role: &str) -> Option<&BTreeSet<RoutePattern>> {
        self.roles.get(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, &BTreeSet<RoutePattern>)> {
        self.roles.iter().map(|(role, routes)| (role.as_str(), routes))
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    pub fn grant_count(&self) -> usize {
        self.roles.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Flatten back into edges, sorted by role then route.
    pub fn edges(&self) -> Vec<Edge> {
        self.roles
            .iter()
            .flat_map(|(role, routes)| routes.iter().map(move |r| Edge::new(role, r.as_str())))
            .collect()
    }
}
