#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use siot_server::errors::Result;
use siot_server::model::{format_timestamp, Reading};
use siot_server::notify::{Dispatcher, EmailMessage, Notification, WebhookRequest};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Dispatcher that hands every notification back to the test.
pub struct RecordingDispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl RecordingDispatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn send_email(&self, message: &EmailMessage) -> Result<()> {
        let _ = self.tx.send(Notification::Email(message.clone()));
        Ok(())
    }

    async fn send_webhook(&self, request: &WebhookRequest) -> Result<()> {
        let _ = self.tx.send(Notification::Webhook(request.clone()));
        Ok(())
    }
}

pub async fn next_notification(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("notification should arrive")
        .expect("dispatcher should stay open")
}

/// A timestamp `seconds_ago` in the past, in wire format.
pub fn ts(seconds_ago: i64) -> String {
    format_timestamp(Utc::now() - Duration::seconds(seconds_ago))
}

pub fn reading(value: Value) -> Reading {
    value.as_object().expect("reading should be an object").clone()
}

pub fn single(field: &str, value: Value, seconds_ago: i64) -> Reading {
    reading(json!({ field: value, "collected_at": ts(seconds_ago) }))
}
