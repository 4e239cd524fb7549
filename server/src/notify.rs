//! Rendering and delivery of rule notifications.
//!
//! Templates use four placeholders: `$value`, `$collected_at`, `$device_id`
//! and `$sensor`. Webhook headers and payloads are JSON objects that are
//! rendered as text and parsed back, so a substituted value can make the
//! payload invalid; that surfaces as [`Error::Notification`].

use crate::errors::{Error, Result};
use crate::metrics::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL};
use crate::model::{value_to_plain_string, Reading, COLLECTED_AT};
use crate::rule::Rule;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Email(EmailMessage),
    Webhook(WebhookRequest),
}

impl Notification {
    pub fn channel(&self) -> &'static str {
        match self {
            Notification::Email(_) => "email",
            Notification::Webhook(_) => "webhook",
        }
    }
}

/// Transport seam for outgoing notifications.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> Result<()>;

    async fn send_webhook(&self, request: &WebhookRequest) -> Result<()>;
}

struct Placeholders {
    value: String,
    collected_at: String,
    device_id: String,
    sensor: String,
}

impl Placeholders {
    fn new(rule: &Rule, reading: &Reading) -> Self {
        let plain = |key: &str| {
            reading
                .get(key)
                .map(value_to_plain_string)
                .unwrap_or_default()
        };
        Self {
            value: plain(&rule.sensor),
            collected_at: plain(COLLECTED_AT),
            device_id: rule.device_id.to_string(),
            sensor: rule.sensor.clone(),
        }
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("$value", &self.value)
            .replace("$collected_at", &self.collected_at)
            .replace("$device_id", &self.device_id)
            .replace("$sensor", &self.sensor)
    }

    fn render_object(&self, object: &Map<String, Value>, what: &str) -> Result<Map<String, Value>> {
        let text = serde_json::to_string(object)?;
        let rendered = self.render(&text);
        match serde_json::from_str::<Value>(&rendered) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(Error::Notification(format!("{what} is not a JSON object"))),
            Err(e) => Err(Error::Notification(format!(
                "{what} is not valid JSON after substitution: {e}"
            ))),
        }
    }
}

pub fn render_email(rule: &Rule, reading: &Reading) -> EmailMessage {
    let placeholders = Placeholders::new(rule, reading);
    EmailMessage {
        to: rule.email.clone(),
        subject: placeholders.render(&rule.email_subject),
        body: placeholders.render(&rule.email_body),
    }
}

pub fn render_webhook(rule: &Rule, reading: &Reading) -> Result<WebhookRequest> {
    let placeholders = Placeholders::new(rule, reading);
    let headers = placeholders
        .render_object(&rule.endpoint_header, "endpoint_header")?
        .into_iter()
        .map(|(name, value)| (name, value_to_plain_string(&value)))
        .collect();
    let payload = placeholders.render_object(&rule.endpoint_payload, "endpoint_payload")?;

    Ok(WebhookRequest {
        url: rule.endpoint_url.clone(),
        headers,
        payload: Value::Object(payload),
    })
}

/// Every notification a firing rule produces: email when an address is set,
/// webhook when a URL is set.
pub fn notifications_for(rule: &Rule, reading: &Reading) -> Vec<Result<Notification>> {
    let mut out = Vec::new();
    if !rule.email.is_empty() {
        out.push(Ok(Notification::Email(render_email(rule, reading))));
    }
    if !rule.endpoint_url.is_empty() {
        out.push(render_webhook(rule, reading).map(Notification::Webhook));
    }
    out
}

/// Renders and delivers a rule's notifications on background tasks.
///
/// Channels are independent; a failure on one is logged and counted.
pub fn spawn_notifications(dispatcher: Arc<dyn Dispatcher>, rule: &Rule, reading: &Reading) {
    for rendered in notifications_for(rule, reading) {
        let rule_id = rule.id;
        let notification = match rendered {
            Ok(n) => n,
            Err(e) => {
                NOTIFICATIONS_FAILED_TOTAL.inc();
                warn!(%rule_id, "Failed to render notification: {}", e);
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let channel = notification.channel();
            let outcome = match &notification {
                Notification::Email(message) => dispatcher.send_email(message).await,
                Notification::Webhook(request) => dispatcher.send_webhook(request).await,
            };
            match outcome {
                Ok(()) => {
                    NOTIFICATIONS_SENT_TOTAL.inc();
                    debug!(%rule_id, channel, "Notification delivered");
                }
                Err(e) => {
                    NOTIFICATIONS_FAILED_TOTAL.inc();
                    error!(%rule_id, channel, "Notification failed: {}", e);
                }
            }
        });
    }
}

/// SMTP settings; email is disabled when `host` is empty.
#[derive(Debug, Clone, Default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

/// Production dispatcher: SMTP through `lettre`, webhooks through `reqwest`.
pub struct SmtpWebhookDispatcher {
    mailer: Option<(AsyncSmtpTransport<Tokio1Executor>, Mailbox)>,
    http: reqwest::Client,
}

impl SmtpWebhookDispatcher {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let mailer = if settings.host.is_empty() {
            warn!("SMTP_HOST not set, email notifications are disabled");
            None
        } else {
            let from: Mailbox = settings
                .from
                .parse()
                .map_err(|e| Error::Notification(format!("invalid sender address: {e}")))?;
            let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| Error::Notification(e.to_string()))?
                .port(settings.port);
            if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
                builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
            }
            info!("SMTP relay: {}:{}", settings.host, settings.port);
            Some((builder.build(), from))
        };

        Ok(Self {
            mailer,
            http: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Dispatcher for SmtpWebhookDispatcher {
    async fn send_email(&self, message: &EmailMessage) -> Result<()> {
        let (transport, from) = self
            .mailer
            .as_ref()
            .ok_or_else(|| Error::Notification("email is not configured".to_string()))?;

        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| Error::Notification(format!("invalid recipient: {e}")))?;
        let email = Message::builder()
            .from(from.clone())
            .to(to)
            .subject(&message.subject)
            .header(ContentType::TEXT_HTML)
            .body(message.body.clone())
            .map_err(|e| Error::Notification(e.to_string()))?;

        transport
            .send(email)
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;
        Ok(())
    }

    async fn send_webhook(&self, request: &WebhookRequest) -> Result<()> {
        let mut builder = self.http.post(&request.url).json(&request.payload);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Notification(format!(
                "webhook {} answered {}",
                request.url,
                response.status()
            )));
        }
        Ok(())
    }
}
