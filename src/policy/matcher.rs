use std::collections::BTreeSet;

use crate::policy::path;
use crate::policy::types::{RoutePattern, Segment};

/// Whether a normalized request path is granted by any of `patterns`.
///
/// Matching is strict: segment counts must agree, literals compare exactly
/// and a `[param]` segment stands for one non-empty segment. A grant on
/// `reports` says nothing about `reports/2024`.
pub fn is_allowed(path: &str, patterns: &BTreeSet<RoutePattern>) -> bool {
    let segments: Vec<&str> = path::segments(path).collect();
    patterns.iter().any(|p| matches(p, &segments))
}

pub fn matches(pattern: &RoutePattern, path_segments: &[&str]) -> bool {
    let pattern_segments = pattern.segments();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(path_segments)
        .all(|(expected, actual)| match expected {
            Segment::Literal(literal) => literal == actual,
            Segment::Param(_) => !actual.is_empty(),
        })
}
