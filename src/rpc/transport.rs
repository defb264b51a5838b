use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::api::BoxError;
use crate::state::State;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to subscribe to {subject}: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BoxError,
    },
    #[error("publish to {subject} failed: {source}")]
    Publish {
        subject: String,
        #[source]
        source: BoxError,
    },
    #[error("flush failed: {0}")]
    Flush(#[source] BoxError),
}

/// One message delivered on the agent's subject.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Bytes,
    pub reply: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Publishes with a reply subject. The controller uses the reply subject
    /// as the name of the unsolicited result (`getwinupdates`,
    /// `winupdateresult`, ...).
    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    async fn flush(&self) -> Result<(), TransportError>;
}

pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Connects with the agent id and token as credentials. Connection state
    /// changes are mirrored into `state`.
    pub async fn connect(
        url: &str,
        agent_id: &str,
        token: &str,
        state: Arc<RwLock<State>>,
    ) -> Result<Self, TransportError> {
        let client = async_nats::ConnectOptions::with_user_and_password(
            agent_id.to_string(),
            token.to_string(),
        )
        .name(format!("rmmagent-{agent_id}"))
        .retry_on_initial_connect()
        .event_callback(move |event| {
            let state = state.clone();
            async move {
                match event {
                    async_nats::Event::Connected => {
                        info!("rpc transport connected");
                        state.write().await.set_rpc_connected(true);
                    }
                    async_nats::Event::Disconnected => {
                        warn!("rpc transport disconnected");
                        state.write().await.set_rpc_connected(false);
                    }
                    other => warn!(event = %other, "rpc transport event"),
                }
            }
        })
        .connect(url)
        .await
        .map_err(|err| TransportError::Connect {
            url: url.to_string(),
            source: Box::new(err),
        })?;
        Ok(Self { client })
    }

    pub async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Inbound>, TransportError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|err| TransportError::Subscribe {
                subject: subject.to_string(),
                source: Box::new(err),
            })?;
        Ok(subscriber
            .map(|msg| Inbound {
                payload: msg.payload,
                reply: msg.reply.map(|reply| reply.to_string()),
            })
            .boxed())
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), Bytes::from(payload))
            .await
            .map_err(|err| TransportError::Publish {
                subject: subject.to_string(),
                source: Box::new(err),
            })
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), Bytes::from(payload))
            .await
            .map_err(|err| TransportError::Publish {
                subject: subject.to_string(),
                source: Box::new(err),
            })
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.client
            .flush()
            .await
            .map_err(|err| TransportError::Flush(Box::new(err)))
    }
}
