//! HTTP adapters for the external collaborators.
//!
//! Each collaborator is a single JSON endpoint: the request body is the
//! core's request type and the response body is the core's result type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vigil_monitor::{
    ClassifiedIntent, CollectRequest, CollectedContext, Collaborators, DeepCollector,
    IntentClassifier, Judge, JudgeRequest, Judgment, MonitorError, MonitorResult, Notifier,
    StreamSource,
};
use vigil_types::{Notification, SampleValue, TopicKey, UserId};

use crate::config::CollaboratorEndpoints;
use crate::error::{DaemonError, DaemonResult};

/// JSON-over-HTTP endpoint for one collaborator.
#[derive(Clone)]
struct Endpoint {
    client: reqwest::Client,
    url: String,
    name: &'static str,
}

impl Endpoint {
    async fn send<Req>(&self, body: &Req) -> Result<reqwest::Response, String>
    where
        Req: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("{} returned {}", self.url, status));
        }
        Ok(response)
    }

    async fn call<Req, Resp>(&self, body: &Req) -> Result<Resp, String>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send(body)
            .await?
            .json::<Resp>()
            .await
            .map_err(|e| e.to_string())
    }

    fn failed(&self, reason: String) -> MonitorError {
        debug!(collaborator = self.name, reason = %reason, "Collaborator call failed");
        MonitorError::CollaboratorFailed {
            collaborator: self.name,
            reason,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClassifyBody<'a> {
    user: &'a UserId,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct FetchBody<'a> {
    topic: &'a TopicKey,
}

/// Acknowledgement body returned by the notify endpoint. An empty body
/// counts as accepted.
#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default = "accepted")]
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

fn accepted() -> bool {
    true
}

pub struct HttpClassifier(Endpoint);

#[async_trait]
impl IntentClassifier for HttpClassifier {
    async fn classify(&self, user: &UserId, message: &str) -> MonitorResult<ClassifiedIntent> {
        self.0
            .call(&ClassifyBody { user, message })
            .await
            .map_err(|e| self.0.failed(e))
    }
}

pub struct HttpCollector(Endpoint);

#[async_trait]
impl DeepCollector for HttpCollector {
    async fn collect(&self, request: &CollectRequest) -> MonitorResult<CollectedContext> {
        self.0.call(request).await.map_err(|e| self.0.failed(e))
    }
}

pub struct HttpJudge(Endpoint);

#[async_trait]
impl Judge for HttpJudge {
    async fn judge(&self, request: &JudgeRequest) -> MonitorResult<Judgment> {
        self.0.call(request).await.map_err(|e| self.0.failed(e))
    }
}

pub struct HttpNotifier(Endpoint);

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> MonitorResult<()> {
        let body = self
            .0
            .send(notification)
            .await
            .map_err(|e| self.0.failed(e))?
            .bytes()
            .await
            .map_err(|e| self.0.failed(e.to_string()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        let ack: Ack = serde_json::from_slice(&body).map_err(|e| self.0.failed(e.to_string()))?;
        if ack.accepted {
            Ok(())
        } else {
            Err(self.0.failed(
                ack.reason
                    .unwrap_or_else(|| "delivery rejected".to_string()),
            ))
        }
    }
}

pub struct HttpSource(Endpoint);

#[async_trait]
impl StreamSource for HttpSource {
    async fn fetch(&self, topic: &TopicKey) -> MonitorResult<SampleValue> {
        self.0
            .call(&FetchBody { topic })
            .await
            .map_err(|reason| MonitorError::SourceUnavailable {
                topic: topic.clone(),
                reason,
            })
    }
}

/// Build the collaborator set from configured endpoints. Unset endpoints
/// keep the offline defaults.
pub fn collaborators(endpoints: &CollaboratorEndpoints) -> DaemonResult<Collaborators> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(endpoints.http_timeout_secs.max(1)))
        .build()
        .map_err(|e| DaemonError::Config(format!("HTTP client: {}", e)))?;

    let endpoint = |url: &Option<String>, name: &'static str| {
        url.as_ref().map(|url| {
            info!(collaborator = name, url = %url, "Using HTTP collaborator");
            Endpoint {
                client: client.clone(),
                url: url.clone(),
                name,
            }
        })
    };

    let mut collaborators = Collaborators::default();
    if let Some(e) = endpoint(&endpoints.classify_url, "classifier") {
        collaborators.classifier = Arc::new(HttpClassifier(e));
    }
    if let Some(e) = endpoint(&endpoints.collect_url, "deep_collect") {
        collaborators.collector = Arc::new(HttpCollector(e));
    }
    if let Some(e) = endpoint(&endpoints.judge_url, "judge") {
        collaborators.judge = Arc::new(HttpJudge(e));
    }
    if let Some(e) = endpoint(&endpoints.notify_url, "notifier") {
        collaborators.notifier = Arc::new(HttpNotifier(e));
    }
    if let Some(e) = endpoint(&endpoints.source_url, "source") {
        collaborators.source = Arc::new(HttpSource(e));
    }
    Ok(collaborators)
}
