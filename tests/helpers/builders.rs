use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rolegate::audit::{AuditEmitter, AuditSink, MemoryAuditSink};
use rolegate::credential::{CredentialVerifier, Hs256Verifier, Identity, VerificationError};
use rolegate::evaluator::PolicyEvaluator;
use rolegate::policy::{compiler, Edge, PolicyHandle};
use rolegate::settings::{Routes, Settings};

pub const SECRET: &str = "integration-secret-0123456789abcdef";

/// Builder for test identities and the credentials that carry them
pub struct IdentityBuilder {
    identity: Identity,
}

impl IdentityBuilder {
    pub fn new(subject_id: &str, role: &str) -> Self {
        Self {
            identity: Identity {
                subject_id: subject_id.to_string(),
                role: role.to_string(),
                display_name: None,
                email: None,
                verified: true,
            },
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.identity.display_name = Some(name.to_string());
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.identity.email = Some(email.to_string());
        self
    }

    pub fn unverified(mut self) -> Self {
        self.identity.verified = false;
        self
    }

    pub fn build(self) -> Identity {
        self.identity
    }

    /// Sign a credential for this identity with [`SECRET`]
    pub fn token(self) -> String {
        issuer()
            .issue(&self.identity, Duration::from_secs(600))
            .expect("Failed to sign test credential")
    }
}

pub fn issuer() -> Hs256Verifier {
    Hs256Verifier::new(SECRET.as_bytes(), Duration::ZERO).expect("Failed to build verifier")
}

/// Wraps the real verifier and counts how often it is consulted
pub struct CountingVerifier {
    inner: Hs256Verifier,
    calls: AtomicUsize,
}

impl CountingVerifier {
    pub fn new() -> Self {
        Self {
            inner: issuer(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialVerifier for CountingVerifier {
    async fn verify(&self, token: Option<&str>) -> Result<Identity, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.verify(token).await
    }
}

/// Evaluator wired to in-memory collaborators
pub struct TestGate {
    pub evaluator: PolicyEvaluator,
    pub policy: PolicyHandle,
    pub verifier: Arc<CountingVerifier>,
    pub audit: Arc<MemoryAuditSink>,
}

pub struct GateBuilder {
    edges: Vec<Edge>,
    routes: Routes,
    sink: Option<Arc<dyn AuditSink>>,
}

impl GateBuilder {
    pub fn new() -> Self {
        Self {
            edges: Vec::new(),
            routes: Routes::default(),
            sink: None,
        }
    }

    pub fn grant(mut self, role: &str, route: &str) -> Self {
        self.edges.push(Edge::new(role, route));
        self
    }

    pub fn with_routes(mut self, routes: Routes) -> Self {
        self.routes = routes;
        self
    }

    /// Replace the memory sink the evaluator reports to
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> TestGate {
        let policy = PolicyHandle::new(compiler::compile(&self.edges).table);
        let verifier = Arc::new(CountingVerifier::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let sink: Arc<dyn AuditSink> = self
            .sink
            .unwrap_or_else(|| audit.clone() as Arc<dyn AuditSink>);
        let evaluator = PolicyEvaluator::new(
            &self.routes,
            policy.clone(),
            verifier.clone(),
            AuditEmitter::new(sink, Duration::from_millis(200)),
        );
        TestGate {
            evaluator,
            policy,
            verifier,
            audit,
        }
    }
}

/// Settings matching the builders above
pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.keys.jwt_secret = Some(SECRET.to_string());
    settings.policy.artifact = None;
    settings
}
