//! Notification of accepted sessions
//!
//! The recorder hands accepted sessions to a [`NotifyQueue`]; a
//! [`SessionNotifier`] task drains the queue and posts each session to every
//! unmuted subscriber (Slack, Discord or a generic JSON webhook).

use crate::config::AlertConfig;
use crate::models::{AuthStatus, Session};
use crate::persistence::{PersistenceError, Subscriber, SubscriberCache};
use crate::persistence::subscribers::SubscriberKind;
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur during notification dispatch
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Subscriber lookup failed: {0}")]
    Subscribers(#[from] PersistenceError),
}

/// Async notification dispatcher
pub struct SessionNotifier {
    server: String,
    subscribers: Arc<SubscriberCache>,
    client: Client,
}

impl SessionNotifier {
    pub fn new(server: impl Into<String>, config: &AlertConfig, subscribers: Arc<SubscriberCache>) -> Self {
        SessionNotifier {
            server: server.into(),
            subscribers,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Create the channel between the recorder and the notifier
    pub fn create_channel(size: usize) -> (NotifyQueue, mpsc::Receiver<Session>) {
        let (tx, rx) = mpsc::channel(size.max(1));
        (NotifyQueue::new(tx), rx)
    }

    /// Run the dispatch loop until every sender is dropped
    pub async fn run(self, mut rx: mpsc::Receiver<Session>) {
        log::info!("Session notifier started");

        while let Some(session) = rx.recv().await {
            if session.status != Some(AuthStatus::Accepted) {
                continue;
            }

            if let Err(e) = self.dispatch(&session).await {
                log::error!("Failed to notify about {}@{}: {}", session.username, session.remote_origin, e);
            }
        }

        log::info!("Session notifier stopped");
    }

    /// Send one session to every unmuted subscriber
    async fn dispatch(&self, session: &Session) -> Result<(), AlertError> {
        let subscribers = self.subscribers.unmuted()?;
        let mut errors = Vec::new();

        for subscriber in &subscribers {
            log::debug!("Notifying {} about {}@{}", subscriber.name, session.username, session.remote_origin);
            if let Err(e) = self.send(subscriber, session).await {
                log::error!("Webhook {} failed: {}", subscriber.name, e);
                errors.push(e);
            }
        }

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send(&self, subscriber: &Subscriber, session: &Session) -> Result<(), AlertError> {
        let payload = payload(subscriber.kind, &self.server, session);
        let response = self.client.post(&subscriber.url).json(&payload).send().await?;

        if !response.status().is_success() {
            log::warn!(
                "Webhook {} returned non-success status: {}",
                subscriber.name,
                response.status()
            );
        }

        Ok(())
    }
}

/// Human readable one-line summary of an accepted session
pub fn summary(server: &str, session: &Session) -> String {
    let methods = session
        .auth_methods
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "New login on {}: {} from {} ({} open, {} total{})",
        server,
        session.username,
        if session.remote_origin.is_empty() { "unknown origin" } else { &session.remote_origin },
        session.active_count,
        session.total_count,
        if methods.is_empty() { String::new() } else { format!(", via {}", methods) }
    )
}

/// Request body for one subscriber kind
pub fn payload(kind: SubscriberKind, server: &str, session: &Session) -> serde_json::Value {
    let text = summary(server, session);
    let login_time = session.last_login.map(|t| t.to_rfc3339()).unwrap_or_default();

    match kind {
        SubscriberKind::Slack => serde_json::json!({
            "username": "loginwatch",
            "icon_emoji": ":key:",
            "attachments": [{
                "color": "warning",
                "title": format!(":key: {}", text),
                "fields": [
                    { "title": "User", "value": &session.username, "short": true },
                    { "title": "Origin", "value": &session.remote_origin, "short": true },
                    { "title": "Open connections", "value": session.active_count.to_string(), "short": true },
                    { "title": "Failed attempts", "value": session.fail_count.to_string(), "short": true },
                ],
                "ts": session.last_login.map(|t| t.timestamp()).unwrap_or_default(),
            }]
        }),
        SubscriberKind::Discord => serde_json::json!({
            "username": "loginwatch",
            "embeds": [{
                "title": ":key: New login",
                "description": text,
                "color": 0xFFCC00,
                "fields": [
                    { "name": "User", "value": &session.username, "inline": true },
                    { "name": "Origin", "value": &session.remote_origin, "inline": true },
                    { "name": "Open connections", "value": session.active_count.to_string(), "inline": true },
                ],
                "timestamp": login_time,
                "footer": { "text": server }
            }]
        }),
        SubscriberKind::Generic => serde_json::json!({
            "server": server,
            "text": text,
            "session": session,
        }),
    }
}

/// Sync-friendly handle for queueing sessions
#[derive(Clone)]
pub struct NotifyQueue {
    tx: mpsc::Sender<Session>,
}

impl NotifyQueue {
    pub fn new(tx: mpsc::Sender<Session>) -> Self {
        NotifyQueue { tx }
    }

    /// Queue a session without blocking
    ///
    /// When the queue is full the session is dropped with a warning; the
    /// recorder never waits on notification delivery.
    pub fn queue_session(&self, session: Session) {
        if let Err(e) = self.tx.try_send(session) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    log::warn!("Notification queue full, dropping session");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::warn!("Notification queue closed");
                }
            }
        }
    }
}
