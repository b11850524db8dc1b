use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use kdl::{KdlDocument, KdlEntry, KdlNode};
use miette::Diagnostic;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::policy::types::{AccessTable, RoutePattern};

#[derive(Debug, Error, Diagnostic)]
pub enum CodecError {
    #[error("Failed to access policy artifact `{path}`")]
    #[diagnostic(
        code(rolegate::codec::io),
        help("Check that the artifact exists and is readable, or recompile it from the edge list")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(rolegate::codec::kdl_parse),
        help("The artifact must be valid KDL (https://kdl.dev)")
    )]
    KdlParse(String),

    #[error("JSON parse error: {0}")]
    #[diagnostic(
        code(rolegate::codec::json),
        help("A JSON artifact is an object mapping role names to arrays of routes")
    )]
    Json(#[from] serde_json::Error),

    #[error("Invalid policy artifact: {0}")]
    #[diagnostic(
        code(rolegate::codec::invalid),
        help("Artifact syntax: role \"name\" {{ routes {{ - \"path/[param]\" }} }}")
    )]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Kdl,
    Json,
}

impl ArtifactFormat {
    /// `.json` files are JSON, everything else is KDL.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ArtifactFormat::Json,
            _ => ArtifactFormat::Kdl,
        }
    }
}

pub fn encode(table: &AccessTable, format: ArtifactFormat) -> Result<String, CodecError> {
    match format {
        ArtifactFormat::Kdl => Ok(encode_kdl(table)),
        ArtifactFormat::Json => {
            let map: BTreeMap<&str, Vec<&str>> = table
                .roles()
                .map(|(role, routes)| (role, routes.iter().map(|r| r.as_str()).collect()))
                .collect();
            Ok(serde_json::to_string_pretty(&map)?)
        }
    }
}

pub fn decode(source: &str, format: ArtifactFormat) -> Result<AccessTable, CodecError> {
    match format {
        ArtifactFormat::Kdl => decode_kdl(source),
        ArtifactFormat::Json => {
            let map: BTreeMap<String, Vec<String>> = serde_json::from_str(source)?;
            let mut table = AccessTable::new();
            for (role, routes) in map {
                let role = role.trim();
                if role.is_empty() {
                    return Err(CodecError::Invalid("role names must not be empty".into()));
                }
                insert_role(&mut table, role, &routes);
            }
            Ok(table)
        }
    }
}

/// Read and decode an artifact, failing on any problem.
pub fn read(path: &Path) -> Result<AccessTable, CodecError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CodecError::Io {
        path: path.display().to_string(),
        source,
    })?;
    decode(&contents, ArtifactFormat::from_path(path))
}

/// Read an artifact if one is usable. Missing or corrupt artifacts come back
/// as `None` so the caller decides whether that is fatal.
pub fn load(path: &Path) -> Option<AccessTable> {
    match read(path) {
        Ok(table) => {
            tracing::info!(
                path = %path.display(),
                roles = table.role_count(),
                grants = table.grant_count(),
                "Loaded policy artifact"
            );
            Some(table)
        }
        Err(CodecError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "No policy artifact found");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable policy artifact");
            None
        }
    }
}

/// Encode and write the artifact, replacing any previous one atomically.
///
/// The contents go to a uniquely named temporary file in the artifact's
/// directory which is then renamed over the target, so concurrent writers
/// never share a scratch file. Blocking; call from `spawn_blocking` in async
/// contexts.
pub fn save(path: &Path, table: &AccessTable) -> Result<(), CodecError> {
    let io_err = |source: std::io::Error| CodecError::Io {
        path: path.display().to_string(),
        source,
    };
    let contents = encode(table, ArtifactFormat::from_path(path))?;

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(contents.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    tracing::info!(
        path = %path.display(),
        roles = table.role_count(),
        grants = table.grant_count(),
        "Saved policy artifact"
    );
    Ok(())
}

fn encode_kdl(table: &AccessTable) -> String {
    let mut doc = KdlDocument::new();
    for (role, routes) in table.roles() {
        let mut list = KdlDocument::new();
        for route in routes {
            let mut item = KdlNode::new("-");
            item.entries_mut().push(KdlEntry::new(route.as_str()));
            list.nodes_mut().push(item);
        }
        let mut routes_node = KdlNode::new("routes");
        routes_node.set_children(list);

        let mut body = KdlDocument::new();
        body.nodes_mut().push(routes_node);

        let mut role_node = KdlNode::new("role");
        role_node.entries_mut().push(KdlEntry::new(role));
        role_node.set_children(body);
        doc.nodes_mut().push(role_node);
    }
    doc.autoformat();
    doc.to_string()
}

fn decode_kdl(source: &str) -> Result<AccessTable, CodecError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| CodecError::KdlParse(e.to_string()))?;

    let mut table = AccessTable::new();
    for node in doc.nodes() {
        match node.name().value() {
            "role" => {
                let name = first_string_arg(node)
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        CodecError::Invalid(
                            "role node requires a string argument (e.g. role \"admin\")".into(),
                        )
                    })?;

                let mut routes = Vec::new();
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "routes" => routes.extend(dash_list(child)),
                            other => {
                                return Err(CodecError::Invalid(format!(
                                    "unexpected child `{other}` in role `{name}` (expected `routes`)"
                                )));
                            }
                        }
                    }
                }
                insert_role(&mut table, &name, &routes);
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }
    Ok(table)
}

// A role listed with no routes is kept: it is known but grants nothing.
fn insert_role(table: &mut AccessTable, role: &str, routes: &[String]) {
    table.declare_role(role);
    for route in routes {
        table.insert(role, RoutePattern::parse(route));
    }
}

fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn dash_list(node: &KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compiler::compile;
    use crate::policy::types::Edge;

    fn sample_table() -> AccessTable {
        compile(&[
            Edge::new("admin", "dashboard/admin"),
            Edge::new("admin", "dashboard/[id]"),
            Edge::new("admin", "/"),
            Edge::new("student", "courses/:course"),
        ])
        .table
    }

    #[test]
    fn test_kdl_roundtrip() {
        let table = sample_table();
        let text = encode(&table, ArtifactFormat::Kdl).unwrap();
        assert!(text.contains("role"));
        assert!(text.contains("dashboard/[id]"));
        assert_eq!(decode(&text, ArtifactFormat::Kdl).unwrap(), table);
    }

    #[test]
    fn test_json_roundtrip() {
        let table = sample_table();
        let text = encode(&table, ArtifactFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["student"][0], "courses/[course]");
        assert_eq!(decode(&text, ArtifactFormat::Json).unwrap(), table);
    }

    #[test]
    fn test_empty_table_roundtrip() {
        let table = AccessTable::new();
        for format in [ArtifactFormat::Kdl, ArtifactFormat::Json] {
            let text = encode(&table, format).unwrap();
            assert!(decode(&text, format).unwrap().is_empty());
        }
    }

    #[test]
    fn test_decode_renormalizes_hand_edited_artifacts() {
        let json = r#"{ "admin": ["/dashboard/admin/", "dashboard\\admin", "users/:id"] }"#;
        let table = decode(json, ArtifactFormat::Json).unwrap();
        let routes: Vec<_> = table
            .routes_for("admin")
            .unwrap()
            .iter()
            .map(|r| r.as_str())
            .collect();
        assert_eq!(routes, vec!["dashboard/admin", "users/[id]"]);
    }

    #[test]
    fn test_decode_kdl_role_without_routes() {
        let table = decode("role \"auditor\"", ArtifactFormat::Kdl).unwrap();
        assert!(table.routes_for("auditor").unwrap().is_empty());
    }

    #[test]
    fn test_decode_kdl_errors() {
        assert!(matches!(
            decode("role {", ArtifactFormat::Kdl).unwrap_err(),
            CodecError::KdlParse(_)
        ));
        assert!(matches!(
            decode("role { routes { - \"x\" } }", ArtifactFormat::Kdl).unwrap_err(),
            CodecError::Invalid(_)
        ));
        assert!(matches!(
            decode("role \"a\" { grants { - \"x\" } }", ArtifactFormat::Kdl).unwrap_err(),
            CodecError::Invalid(_)
        ));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ArtifactFormat::from_path(Path::new("p.json")), ArtifactFormat::Json);
        assert_eq!(ArtifactFormat::from_path(Path::new("p.JSON")), ArtifactFormat::Json);
        assert_eq!(ArtifactFormat::from_path(Path::new("p.kdl")), ArtifactFormat::Kdl);
        assert_eq!(ArtifactFormat::from_path(Path::new("policy")), ArtifactFormat::Kdl);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample_table();

        for name in ["nested/policy.kdl", "policy.json"] {
            let path = dir.path().join(name);
            save(&path, &table).unwrap();
            assert_eq!(load(&path), Some(table.clone()));
            assert_eq!(read(&path).unwrap(), table);
        }
    }

    #[test]
    fn test_blank_segment_routes_roundtrip() {
        let table = compile(&[
            Edge::new("admin", "/ /a"),
            Edge::new("admin", "a/ /b"),
        ])
        .table;
        for format in [ArtifactFormat::Kdl, ArtifactFormat::Json] {
            let text = encode(&table, format).unwrap();
            assert_eq!(decode(&text, format).unwrap(), table);
        }
    }

    #[test]
    fn test_save_leaves_no_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.kdl");
        save(&path, &sample_table()).unwrap();
        save(&path, &AccessTable::new()).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("policy.kdl")]);
        assert!(read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_or_corrupt_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load(&dir.path().join("missing.kdl")), None);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(load(&corrupt), None);
        assert!(matches!(read(&corrupt).unwrap_err(), CodecError::Json(_)));
    }
}
