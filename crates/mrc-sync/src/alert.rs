use std::sync::Arc;

use async_trait::async_trait;
use mrc_core::AlertSignal;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PushoverConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub title: String,
    pub body: String,
    pub priority: i8,
}

impl AlertMessage {
    pub fn for_signal(signal: &AlertSignal, config: &PushoverConfig) -> Self {
        Self {
            title: config.title.clone(),
            body: signal.message.clone(),
            priority: config.priority,
        }
    }
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("alert endpoint rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError>;
}

#[derive(Debug, Default)]
pub struct NoopAlertTransport;

#[async_trait]
impl AlertTransport for NoopAlertTransport {
    async fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError> {
        debug!(title = %message.title, "alerts disabled; dropping message");
        Ok(())
    }
}

pub struct PushoverTransport {
    client: reqwest::Client,
    config: PushoverConfig,
}

impl PushoverTransport {
    pub fn new(client: reqwest::Client, config: PushoverConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl AlertTransport for PushoverTransport {
    async fn deliver(&self, message: &AlertMessage) -> Result<(), AlertError> {
        let priority = message.priority.to_string();
        let form = [
            ("token", self.config.app_token.as_str()),
            ("user", self.config.user_key.as_str()),
            ("message", message.body.as_str()),
            ("priority", priority.as_str()),
            ("title", message.title.as_str()),
        ];
        let resp = self
            .client
            .post(&self.config.endpoint)
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(AlertError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(title = %message.title, "alert delivered");
        Ok(())
    }
}

pub fn alert_transport_for(config: &PushoverConfig, client: reqwest::Client) -> Arc<dyn AlertTransport> {
    if config.enabled {
        Arc::new(PushoverTransport::new(client, config.clone()))
    } else {
        Arc::new(NoopAlertTransport)
    }
}
