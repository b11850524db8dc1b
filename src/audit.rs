use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::credential::Identity;
use crate::settings::Audit;

/// An authenticated, verified access. Field names follow the audit store's
/// wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "userId")]
    pub subject_id: String,
    pub role: String,
    #[serde(rename = "name")]
    pub display_name: Option<String>,
    pub path: String,
    #[serde(rename = "ip")]
    pub source_ip: String,
    #[serde(rename = "userAgent")]
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn for_access(
        identity: &Identity,
        path: &str,
        source_ip: &str,
        user_agent: Option<&str>,
    ) -> Self {
        Self {
            subject_id: identity.subject_id.clone(),
            role: identity.role.clone(),
            display_name: identity.display_name.clone(),
            path: path.to_string(),
            source_ip: source_ip.to_string(),
            user_agent: user_agent.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("audit sink rejected event with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("audit delivery abandoned after {0:?}")]
    TimedOut(Duration),
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn accept(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Posts events as JSON to the external audit store.
pub struct HttpAuditSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAuditSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AuditError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn accept(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let response = self.client.post(&self.endpoint).json(event).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AuditError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Writes events to the log only. Used when no audit endpoint is configured.
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn accept(&self, event: &AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "rolegate::audit",
            user_id = %event.subject_id,
            role = %event.role,
            path = %event.path,
            ip = %event.source_ip,
            user_agent = event.user_agent.as_deref().unwrap_or("-"),
            "access"
        );
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    notify: Notify,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` events have arrived.
    pub async fn wait_for(&self, count: usize) {
        while self.len() < count {
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn accept(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .map_err(|_| AuditError::Unavailable("event buffer poisoned".into()))?
            .push(event.clone());
        self.notify.notify_one();
        Ok(())
    }
}

/// Fire-and-forget front of an [`AuditSink`].
///
/// `record` hands the event to a background task and returns at once; the
/// task gives the sink one attempt bounded by `timeout`. Failures are logged
/// and dropped, they never reach the request path.
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    pub fn from_settings(audit: &Audit) -> Result<Self, AuditError> {
        let timeout = Duration::from_millis(audit.timeout_ms);
        let sink: Arc<dyn AuditSink> = match audit.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => {
                tracing::info!(endpoint, "Audit events will be posted to sink");
                Arc::new(HttpAuditSink::new(endpoint, timeout)?)
            }
            _ => {
                tracing::info!("No audit endpoint configured; audit events are logged only");
                Arc::new(LogAuditSink)
            }
        };
        Ok(Self::new(sink, timeout))
    }

    pub fn record(&self, event: AuditEvent) {
        let sink = Arc::clone(&self.sink);
        let timeout = self.timeout;
        tokio::spawn(async move {
            if let Err(e) = deliver(sink.as_ref(), &event, timeout).await {
                tracing::warn!(
                    error = %e,
                    user_id = %event.subject_id,
                    path = %event.path,
                    "Audit event dropped"
                );
            }
        });
    }
}

async fn deliver(
    sink: &dyn AuditSink,
    event: &AuditEvent,
    timeout: Duration,
) -> Result<(), AuditError> {
    tokio::time::timeout(timeout, sink.accept(event))
        .await
        .map_err(|_| AuditError::TimedOut(timeout))?
}
