//! Canonical forms for route strings.
//!
//! Graph-authored routes, directory names and live request paths all pass
//! through [`normalize`] so they compare equal segment by segment. Request
//! paths and directory keys live in separate namespaces: the root request path
//! is `""` while the root directory is `"."`.

/// Key used for the root directory in the directory namespace.
pub const ROOT_DIRECTORY_KEY: &str = ".";

/// Normalize a route or request path.
///
/// Strips any `scheme://authority` origin, the query string and fragment,
/// converts `\` separators to `/`, trims each segment and drops the empty
/// ones, so leading, trailing and repeated slashes disappear. The root maps
/// to `""`.
pub fn normalize(raw: &str) -> String {
    let without_origin = strip_origin(raw.trim());
    let without_query = without_origin
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    without_query
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize a directory path relative to the pages root; the root itself
/// becomes [`ROOT_DIRECTORY_KEY`].
pub fn directory_key(raw: &str) -> String {
    let normalized = normalize(raw);
    if normalized.is_empty() || normalized == ROOT_DIRECTORY_KEY {
        ROOT_DIRECTORY_KEY.to_string()
    } else {
        normalized
    }
}

/// Split a normalized path into its segments. The root has zero segments.
pub fn segments(normalized: &str) -> impl Iterator<Item = &str> {
    normalized.split('/').filter(|s| !s.is_empty())
}

fn strip_origin(raw: &str) -> &str {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw;
    };
    // Only treat it as an origin when the prefix looks like a URL scheme.
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return raw;
    }
    match rest.find(['/', '?', '#']) {
        Some(idx) => &rest[idx..],
        None => "",
    }
}
