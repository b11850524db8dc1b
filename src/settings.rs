use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: Server,
    pub keys: Keys,
    pub policy: Policy,
    pub routes: Routes,
    pub audit: Audit,
    pub discovery: Discovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    /// Port of the forward-auth listener
    pub port: u16,
    /// Interface of the unauthenticated admin policy API; loopback unless
    /// deliberately exposed
    pub admin_host: String,
    /// Admin policy API port (defaults to port + 1)
    pub admin_port: Option<u16>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Keys {
    /// Shared HS256 secret used to verify bearer credentials
    pub jwt_secret: Option<String>,
    /// Cookie consulted when no Authorization header is present
    pub cookie_name: String,
    /// Clock skew tolerated when checking `exp`
    pub leeway_secs: u64,
}

// Keeps the secret out of `tracing::info!(?settings)`.
impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("cookie_name", &self.cookie_name)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Compiled access table; `.kdl` or `.json`
    pub artifact: Option<PathBuf>,
    /// Refuse to start when the artifact is missing or unreadable
    pub require_artifact: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Routes {
    /// Path prefixes or suffixes that bypass the gate entirely
    pub ignored: Vec<String>,
    /// Exact paths reachable without a credential
    pub public: Vec<String>,
    /// Login/signup style paths, only reachable while anonymous
    pub auth: Vec<String>,
    pub login: String,
    pub home: String,
    pub verification: String,
    pub dashboard_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Audit {
    /// Audit sink URL; events are only logged when unset
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Discovery {
    pub pages_dir: PathBuf,
    pub page_file: String,
    pub excluded: Vec<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            admin_host: "127.0.0.1".to_string(),
            admin_port: None,
        }
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            cookie_name: "token".to_string(),
            leeway_secs: 30,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            artifact: Some(PathBuf::from("data/policy.kdl")),
            require_artifact: false,
        }
    }
}

impl Default for Routes {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            ignored: strings(&[
                "_next",
                "api",
                "favicon.ico",
                ".well-known",
                "chrome-extension:",
                ".glb",
                ".png",
                ".jpg",
                ".jpeg",
                ".gif",
                ".svg",
                ".webp",
                "public",
            ]),
            public: strings(&["", "RBAC", "RBAC/audit"]),
            auth: strings(&["login", "signup"]),
            login: "login".to_string(),
            home: "".to_string(),
            verification: "verification".to_string(),
            dashboard_prefix: "dashboard".to_string(),
        }
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 2000,
        }
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            pages_dir: PathBuf::from("app"),
            page_file: "page.js".to_string(),
            excluded: ["login", "signup", "verification", "RBAC", "RBAC/audit"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: ROLEGATE__SERVER__PORT=9090, ROLEGATE__ROUTES__PUBLIC="a,b"
        builder = builder.add_source(
            config::Environment::with_prefix("ROLEGATE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("routes.ignored")
                .with_list_parse_key("routes.public")
                .with_list_parse_key("routes.auth")
                .with_list_parse_key("discovery.excluded"),
        );

        let cfg = builder.build().into_diagnostic()?;
        let mut s: Settings = cfg.try_deserialize().into_diagnostic()?;

        if let Some(artifact) = &s.policy.artifact {
            if artifact.is_relative() {
                s.policy.artifact = Some(std::env::current_dir().into_diagnostic()?.join(artifact));
            }
        }

        Ok(s)
    }

    pub fn admin_port(&self) -> u16 {
        self.server
            .admin_port
            .unwrap_or_else(|| self.server.port.saturating_add(1))
    }
}
