// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Groups
//!
//! This module manages one AMQP connection and the channels multiplexed over
//! it. A connection group enforces the channels-per-connection cap; when every
//! slot is taken the pool manager opens a new group. Connection attempts use
//! an exponential backoff schedule bounded by a retry budget.

use crate::{config::PoolConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Delay before the given reconnect attempt, doubling from `base` up to `max`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(max)
}

/// One broker connection and its channel slots.
///
/// The slot count is touched only by the group's own `create_channel` and
/// `release_channel` operations; the pool manager serializes those per group.
pub struct ConnectionGroup {
    id: Uuid,
    connection: Connection,
    capacity: u16,
    open_channels: AtomicU16,
}

impl ConnectionGroup {
    /// Opens a new connection group.
    ///
    /// Connection attempts are retried with exponential backoff up to the
    /// configured budget. When the budget exhausts the caller receives
    /// `ConnectionError` and decides whether to keep retrying in the
    /// background.
    pub async fn open(cfg: &PoolConfig) -> Result<ConnectionGroup, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.broker.app_name.clone()));
        let uri = cfg.broker.amqp_uri();

        let mut attempt = 0u32;
        loop {
            debug!(attempt, "creating amqp connection...");
            match Connection::connect(&uri, options.clone()).await {
                Ok(connection) => {
                    let group = ConnectionGroup {
                        id: Uuid::new_v4(),
                        connection,
                        capacity: cfg.channels_per_connection,
                        open_channels: AtomicU16::new(0),
                    };
                    debug!(group = group.id.to_string(), "amqp connected");
                    return Ok(group);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= cfg.connect_retry_budget {
                        error!(
                            error = err.to_string(),
                            attempts = attempt,
                            "failure to connect, retry budget exhausted"
                        );
                        return Err(AmqpError::ConnectionError);
                    }

                    let delay = backoff_delay(
                        attempt - 1,
                        cfg.connect_backoff_base,
                        cfg.connect_backoff_max,
                    );
                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "failure to connect, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Identifier of this group.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the group has a free channel slot.
    pub fn has_capacity(&self) -> bool {
        self.open_channels.load(Ordering::SeqCst) < self.capacity
    }

    /// Number of channels currently drawn from this connection.
    pub fn open_channels(&self) -> u16 {
        self.open_channels.load(Ordering::SeqCst)
    }

    /// Whether the underlying connection is still alive.
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Creates a channel on this connection.
    ///
    /// # Returns
    /// A new channel, `ChannelCapacityError` when every slot is taken, or
    /// `ChannelError` when the broker refuses the channel.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        let reserved = self
            .open_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                if count < self.capacity {
                    Some(count + 1)
                } else {
                    None
                }
            });

        if reserved.is_err() {
            return Err(AmqpError::ChannelCapacityError);
        }

        debug!(group = self.id.to_string(), "creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(channel) => {
                debug!(group = self.id.to_string(), "channel created");
                Ok(channel)
            }
            Err(err) => {
                self.open_channels.fetch_sub(1, Ordering::SeqCst);
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Returns a channel slot after its channel is closed.
    pub fn release_channel(&self) {
        let released = self
            .open_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });

        if released.is_err() {
            warn!(
                group = self.id.to_string(),
                "release_channel called with no open channels"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(32));
        assert_eq!(backoff_delay(6, base, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(30, base, max), Duration::from_secs(60));
    }
}
