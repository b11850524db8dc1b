use std::collections::HashSet;
use std::path::Path;

use crate::errors::GateError;
use crate::policy::path;
use crate::settings::Discovery;

/// List the route keys of every directory under `discovery.pages_dir` that
/// holds a page file. These are the page nodes offered to the graph editor.
/// The pages root itself is reported as `"."`.
pub fn discover_pages(discovery: &Discovery) -> Result<Vec<String>, GateError> {
    let root = discovery.pages_dir.as_path();
    if !root.is_dir() {
        return Err(GateError::Misconfigured(format!(
            "pages directory `{}` does not exist or is not a directory",
            root.display()
        )));
    }

    let excluded: HashSet<String> = discovery
        .excluded
        .iter()
        .map(|e| path::directory_key(e))
        .collect();

    let mut pages = Vec::new();
    walk(root, root, &discovery.page_file, &excluded, &mut pages)?;
    pages.sort();

    tracing::debug!(root = %root.display(), pages = pages.len(), "Discovered pages");
    Ok(pages)
}

fn walk(
    root: &Path,
    dir: &Path,
    page_file: &str,
    excluded: &HashSet<String>,
    pages: &mut Vec<String>,
) -> Result<(), GateError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.path());

    let has_page = entries
        .iter()
        .any(|e| e.file_name() == page_file && e.path().is_file());
    if has_page {
        let relative = dir.strip_prefix(root).unwrap_or(dir);
        let key = path::directory_key(&relative.to_string_lossy());
        if !excluded.contains(&key) {
            pages.push(key);
        }
    }

    for entry in entries {
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &entry.path(), page_file, excluded, pages)?;
        }
    }
    Ok(())
}
