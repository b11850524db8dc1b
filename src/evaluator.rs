//! Per-request gate.
//!
//! Stages run in a fixed order: ignored and public paths short-circuit before
//! any credential work, auth routes stay reachable for anonymous users, then
//! the authentication gate, the verification gate, the audit side effect and
//! finally role authorization against the current access table.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::{HeaderMap, Uri};

use crate::audit::{AuditEmitter, AuditEvent};
use crate::credential::{token_from_headers, CredentialVerifier, Identity};
use crate::policy::{matcher, path, PolicyHandle};
use crate::settings::Routes;

const DEFAULT_SOURCE_IP: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Ignored,
    Public,
    AuthOnly,
    Protected,
}

/// Why a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Ignored,
    Public,
    AnonymousAuthRoute,
    PendingVerification,
    Authorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectReason {
    AlreadyAuthenticated,
    Unauthenticated,
    AlreadyVerified,
    Unverified,
    UnknownRole,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Continue(PassReason),
    Redirect {
        location: String,
        reason: RedirectReason,
    },
}

impl Decision {
    pub fn is_continue(&self) -> bool {
        matches!(self, Decision::Continue(_))
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            Decision::Redirect { location, .. } => Some(location),
            Decision::Continue(_) => None,
        }
    }
}

/// The parts of an inbound request the gate looks at.
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    /// Raw request path or URL; normalized by the evaluator
    pub path: String,
    pub token: Option<String>,
    pub source_ip: String,
    pub user_agent: Option<String>,
}

impl GateRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: None,
            source_ip: DEFAULT_SOURCE_IP.to_string(),
            user_agent: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn from_parts(uri: &Uri, headers: &HeaderMap, cookie_name: &str) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let source_ip = header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .or_else(|| header("x-real-ip"))
            .unwrap_or(DEFAULT_SOURCE_IP)
            .to_string();

        Self {
            path: uri.path().to_string(),
            token: token_from_headers(headers, cookie_name),
            source_ip,
            user_agent: header("user-agent").map(str::to_string),
        }
    }
}

/// Classifies normalized paths from the static route lists.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    ignored: Vec<String>,
    public: HashSet<String>,
    auth: HashSet<String>,
}

impl RouteClassifier {
    pub fn new(routes: &Routes) -> Self {
        Self {
            ignored: routes
                .ignored
                .iter()
                .map(|e| e.trim().trim_start_matches('/').to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            public: routes.public.iter().map(|r| path::normalize(r)).collect(),
            auth: routes.auth.iter().map(|r| path::normalize(r)).collect(),
        }
    }

    pub fn classify(&self, normalized: &str) -> RouteClass {
        if self.ignored.iter().any(|e| is_ignored(normalized, e)) {
            RouteClass::Ignored
        } else if self.public.contains(normalized) {
            RouteClass::Public
        } else if self.auth.contains(normalized) {
            RouteClass::AuthOnly
        } else {
            RouteClass::Protected
        }
    }
}

// `.png` style entries match as suffixes; every entry also matches the
// leading segments of the path (`_next/static/…`, `favicon.ico`).
fn is_ignored(normalized: &str, entry: &str) -> bool {
    if entry.starts_with('.') && normalized.ends_with(entry) {
        return true;
    }
    match normalized.strip_prefix(entry) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || entry.ends_with(':'),
        None => false,
    }
}

#[derive(Debug, Clone)]
struct Targets {
    login: String,
    home: String,
    verification: String,
    dashboard_prefix: String,
}

impl Targets {
    fn new(routes: &Routes) -> Self {
        Self {
            login: path::normalize(&routes.login),
            home: path::normalize(&routes.home),
            verification: path::normalize(&routes.verification),
            dashboard_prefix: path::normalize(&routes.dashboard_prefix),
        }
    }

    fn location(route: &str) -> String {
        format!("/{route}")
    }

    // Role stays a single percent-encoded segment on this origin.
    fn dashboard(&self, role: &str) -> String {
        let role = urlencoding::encode(&role.to_lowercase()).into_owned();
        if self.dashboard_prefix.is_empty() {
            Self::location(&role)
        } else {
            format!("/{}/{}", self.dashboard_prefix, role)
        }
    }

    fn verification_for(&self, identity: &Identity) -> String {
        match identity.email.as_deref() {
            Some(email) => format!(
                "/{}?email={}",
                self.verification,
                urlencoding::encode(email)
            ),
            None => Self::location(&self.verification),
        }
    }
}

pub struct PolicyEvaluator {
    policy: PolicyHandle,
    verifier: Arc<dyn CredentialVerifier>,
    audit: AuditEmitter,
    classifier: RouteClassifier,
    targets: Targets,
}

impl PolicyEvaluator {
    pub fn new(
        routes: &Routes,
        policy: PolicyHandle,
        verifier: Arc<dyn CredentialVerifier>,
        audit: AuditEmitter,
    ) -> Self {
        Self {
            policy,
            verifier,
            audit,
            classifier: RouteClassifier::new(routes),
            targets: Targets::new(routes),
        }
    }

    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    pub fn classify(&self, raw_path: &str) -> RouteClass {
        self.classifier.classify(&path::normalize(raw_path))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(path = %request.path))]
    pub async fn evaluate(&self, request: &GateRequest) -> Decision {
        let path = path::normalize(&request.path);

        let class = self.classifier.classify(&path);
        match class {
            RouteClass::Ignored => return Decision::Continue(PassReason::Ignored),
            RouteClass::Public => return Decision::Continue(PassReason::Public),
            RouteClass::AuthOnly | RouteClass::Protected => {}
        }

        let identity = match self.verifier.verify(request.token.as_deref()).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::debug!(reason = %e, "request is unauthenticated");
                None
            }
        };

        if class == RouteClass::AuthOnly {
            return match identity {
                Some(_) => self.redirect(
                    Targets::location(&self.targets.home),
                    RedirectReason::AlreadyAuthenticated,
                ),
                None => Decision::Continue(PassReason::AnonymousAuthRoute),
            };
        }

        let Some(identity) = identity else {
            return self.redirect(
                Targets::location(&self.targets.login),
                RedirectReason::Unauthenticated,
            );
        };

        if path == self.targets.verification {
            return if identity.verified {
                self.redirect(
                    self.targets.dashboard(&identity.role),
                    RedirectReason::AlreadyVerified,
                )
            } else {
                Decision::Continue(PassReason::PendingVerification)
            };
        }

        if !identity.verified {
            return self.redirect(
                self.targets.verification_for(&identity),
                RedirectReason::Unverified,
            );
        }

        self.audit.record(AuditEvent::for_access(
            &identity,
            &path,
            &request.source_ip,
            request.user_agent.as_deref(),
        ));

        let table = self.policy.snapshot();
        let Some(allowed) = table.routes_for(&identity.role) else {
            tracing::warn!(
                role = %identity.role,
                user_id = %identity.subject_id,
                "identity carries a role unknown to the access table"
            );
            return self.redirect(
                Targets::location(&self.targets.login),
                RedirectReason::UnknownRole,
            );
        };

        if matcher::is_allowed(&path, allowed) {
            tracing::debug!(role = %identity.role, "authorized");
            Decision::Continue(PassReason::Authorized)
        } else {
            self.redirect(
                self.targets.dashboard(&identity.role),
                RedirectReason::Forbidden,
            )
        }
    }

    fn redirect(&self, location: String, reason: RedirectReason) -> Decision {
        tracing::debug!(%location, ?reason, "redirecting");
        Decision::Redirect { location, reason }
    }
}
