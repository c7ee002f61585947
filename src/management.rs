// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Management API Client
//!
//! The scaler needs the backlog depth of every bound queue, which the AMQP
//! protocol does not expose. This module queries the RabbitMQ management
//! plugin over HTTP instead, behind a narrow trait so the pool can be tested
//! without a broker.

use crate::{config::BrokerConfig, errors::AmqpError};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::error;

/// Read-only view of the broker's queue metrics.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Number of messages currently pending in the given queue.
    async fn queue_depth(&self, queue: &str) -> Result<u64, AmqpError>;
}

/// Queue object returned by the management plugin; only the pending-message
/// counter is of interest.
#[derive(Debug, Deserialize)]
pub(crate) struct QueueInfo {
    #[serde(default)]
    pub(crate) messages: u64,
}

/// HTTP implementation over the RabbitMQ management plugin.
pub struct HttpManagementApi {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    vhost: String,
}

impl HttpManagementApi {
    /// Creates a management client for the given broker.
    pub fn new(broker: &BrokerConfig) -> HttpManagementApi {
        HttpManagementApi {
            client: reqwest::Client::new(),
            base_url: broker.management_url(),
            user: broker.user.clone(),
            password: broker.password.clone(),
            vhost: broker.vhost.replace('/', "%2f"),
        }
    }
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    /// Queries `GET /api/queues/{vhost}/{queue}` and returns the `messages`
    /// counter of the queue object.
    async fn queue_depth(&self, queue: &str) -> Result<u64, AmqpError> {
        let url = format!("{}/api/queues/{}/{}", self.base_url, self.vhost, queue);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "management api unreachable");
                AmqpError::ManagementApiError(err.to_string())
            })?;

        if !response.status().is_success() {
            error!(status = response.status().as_u16(), queue, "management api error");
            return Err(AmqpError::ManagementApiError(format!(
                "status {} for queue `{}`",
                response.status(),
                queue
            )));
        }

        let info = response.json::<QueueInfo>().await.map_err(|err| {
            error!(error = err.to_string(), queue, "management api bad payload");
            AmqpError::ManagementApiError(err.to_string())
        })?;

        Ok(info.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_info_parses_messages_field() {
        let info: QueueInfo =
            serde_json::from_str(r#"{"name":"orders","messages":300,"consumers":2}"#).unwrap();
        assert_eq!(info.messages, 300);
    }

    #[test]
    fn queue_info_defaults_missing_messages_to_zero() {
        let info: QueueInfo = serde_json::from_str(r#"{"name":"orders"}"#).unwrap();
        assert_eq!(info.messages, 0);
    }

    #[test]
    fn vhost_is_percent_encoded() {
        let api = HttpManagementApi::new(&BrokerConfig::default());
        assert_eq!(api.vhost, "%2f");
    }
}
