//! Channel fan-out for notifications.
//!
//! The dispatcher attempts every channel declared on a notification
//! independently. Channel sinks are pluggable; the defaults log the delivery
//! event, a production deployment would register provider-backed sinks. A
//! failing channel is logged and skipped: the persisted notification record,
//! not the sinks, is the durable source of truth that delivery was attempted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::db::DbPool;
use crate::directory;
use crate::error::{Error, Result};
use crate::models::{Channel, Notification, User};

#[async_trait]
pub trait ChannelSink: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(&self, recipient: &User, notification: &Notification) -> Result<()>;
}

/// Default sink: emits the delivery as a log event.
pub struct LogSink {
    channel: Channel,
}

impl LogSink {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSink for LogSink {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(&self, recipient: &User, notification: &Notification) -> Result<()> {
        match self.channel {
            Channel::Email => {
                info!(
                    channel = "email",
                    to = %recipient.email,
                    title = %notification.title,
                    "delivering notification"
                );
            }
            Channel::Sms => {
                let phone = recipient.phone.as_deref().ok_or_else(|| {
                    Error::validation(format!("user {} has no phone number", recipient.id))
                })?;
                info!(
                    channel = "sms",
                    to = %phone,
                    title = %notification.title,
                    "delivering notification"
                );
            }
            Channel::InApp | Channel::Push => {
                info!(
                    channel = %self.channel,
                    recipient = %recipient.id,
                    title = %notification.title,
                    "delivering notification"
                );
            }
        }
        Ok(())
    }
}

pub struct Dispatcher {
    pool: DbPool,
    sinks: HashMap<Channel, Arc<dyn ChannelSink>>,
}

impl Dispatcher {
    /// Dispatcher with log-backed sinks for all four channels.
    pub fn new(pool: DbPool) -> Self {
        let mut dispatcher = Self {
            pool,
            sinks: HashMap::new(),
        };
        for channel in [Channel::InApp, Channel::Email, Channel::Sms, Channel::Push] {
            dispatcher.register(Arc::new(LogSink::new(channel)));
        }
        dispatcher
    }

    /// Replace the sink for the channel it reports.
    pub fn register(&mut self, sink: Arc<dyn ChannelSink>) {
        self.sinks.insert(sink.channel(), sink);
    }

    /// Fan the notification out across its declared channels, best effort.
    /// Never fails: per-channel errors are logged and the remaining channels
    /// are still attempted.
    pub async fn deliver(&self, notification: &Notification) {
        let recipient = match directory::user_by_id(&self.pool, notification.recipient_id).await {
            Ok(user) => user,
            Err(e) => {
                warn!(
                    notification = %notification.id,
                    recipient = %notification.recipient_id,
                    error = %e,
                    "cannot resolve recipient, skipping delivery"
                );
                return;
            }
        };

        for channel in &notification.channels {
            let Some(sink) = self.sinks.get(channel) else {
                warn!(channel = %channel, "no sink registered, skipping channel");
                continue;
            };
            if let Err(e) = sink.deliver(&recipient, notification).await {
                warn!(
                    notification = %notification.id,
                    channel = %channel,
                    error = %e,
                    "channel delivery failed, skipping channel"
                );
            }
        }
    }
}
