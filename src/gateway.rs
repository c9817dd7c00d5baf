//! Fire-and-forget dispatch of stage requests to worker topics.
//!
//! The engine never waits on a worker. A [`StageGateway`] only enqueues; the
//! worker's answer arrives later as an independent [`CompletionEvent`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::topic::StageTopic;

/// Message sent to a stage worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub job_id: String,
    #[serde(default)]
    pub body: Value,
}

/// Message a stage worker sends back once it is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub body: Value,
}

impl CompletionEvent {
    pub fn new(job_id: impl Into<String>, status_code: u16, body: Value) -> Self {
        Self {
            job_id: job_id.into(),
            status_code,
            body,
        }
    }

    pub fn success(job_id: impl Into<String>) -> Self {
        Self::new(job_id, 200, Value::Null)
    }
}

/// A request tagged with the topic it was published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEnvelope {
    pub topic: StageTopic,
    pub request: StageRequest,
}

#[async_trait]
pub trait StageGateway: Send + Sync {
    /// Enqueue `request` on `topic`. Returns once the broker accepted it.
    async fn dispatch(&self, topic: StageTopic, request: StageRequest) -> Result<(), GatewayError>;
}

/// In-process broker: every dispatch lands on an unbounded tokio channel that
/// simulated workers (or tests) drain.
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    tx: mpsc::UnboundedSender<StageEnvelope>,
}

impl ChannelGateway {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StageEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StageGateway for ChannelGateway {
    async fn dispatch(&self, topic: StageTopic, request: StageRequest) -> Result<(), GatewayError> {
        tracing::debug!(topic = %topic, job_id = %request.job_id, "enqueue stage request");
        self.tx
            .send(StageEnvelope { topic, request })
            .map_err(|_| GatewayError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_gateway_delivers_envelopes_in_order() {
        let (gateway, mut rx) = ChannelGateway::new();
        for n in 0..3 {
            gateway
                .dispatch(
                    StageTopic::BatchQueued,
                    StageRequest {
                        job_id: format!("job-{n}"),
                        body: json!({"n": n}),
                    },
                )
                .await
                .unwrap();
        }
        for n in 0..3 {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.topic, StageTopic::BatchQueued);
            assert_eq!(envelope.request.job_id, format!("job-{n}"));
        }
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (gateway, rx) = ChannelGateway::new();
        drop(rx);
        let err = gateway
            .dispatch(
                StageTopic::OutputJson,
                StageRequest {
                    job_id: "j".into(),
                    body: Value::Null,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Closed));
    }

    #[test]
    fn completion_event_deserializes_without_body() {
        let event: CompletionEvent =
            serde_json::from_str(r#"{"job_id": "job:batch_queued:B1:0", "status_code": 200}"#).unwrap();
        assert_eq!(event.status_code, 200);
        assert!(event.body.is_null());
    }
}
