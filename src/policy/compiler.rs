use crate::policy::types::{AccessTable, Edge, RoutePattern};

/// Result of compiling an edge list.
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub table: AccessTable,
    /// Edges rejected for a missing or blank endpoint
    pub skipped: usize,
    /// Edges already present in the table
    pub duplicates: usize,
}

/// Compile authored edges into an [`AccessTable`].
///
/// Each edge's route is normalized and its dynamic segments rewritten to the
/// `[name]` form before insertion into the role's set, so repeated or
/// differently spelled grants collapse. A malformed edge is skipped and
/// counted; it never aborts the compilation.
pub fn compile<'a, I>(edges: I) -> CompileReport
where
    I: IntoIterator<Item = &'a Edge>,
{
    let mut report = CompileReport::default();

    for (index, edge) in edges.into_iter().enumerate() {
        let role = edge.from.as_deref().map(str::trim).unwrap_or_default();
        let Some(route) = edge.to.as_deref().filter(|r| !r.trim().is_empty()) else {
            tracing::warn!(index, role, "skipping edge without a target route");
            report.skipped += 1;
            continue;
        };
        if role.is_empty() {
            tracing::warn!(index, route, "skipping edge without a source role");
            report.skipped += 1;
            continue;
        }

        if !report.table.insert(role, RoutePattern::parse(route)) {
            report.duplicates += 1;
        }
    }

    tracing::debug!(
        roles = report.table.role_count(),
        grants = report.table.grant_count(),
        skipped = report.skipped,
        duplicates = report.duplicates,
        "Compiled access table"
    );

    report
}
