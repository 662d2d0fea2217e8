use std::sync::Arc;

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    WhatsApp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Contact details for a notification target, usually a unit owner.
#[derive(Debug, Clone, Default)]
pub struct Recipient {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Fire-and-forget dispatch. Messages go onto a bounded queue drained by one
/// background worker, so callers never wait on an email or WhatsApp provider.
#[derive(Clone)]
pub struct Notifier {
    sender: mpsc::Sender<OutboundMessage>,
}

impl Notifier {
    pub fn spawn(config: Arc<AppConfig>, http_client: Client) -> Self {
        let (notifier, receiver) = Self::channel(config.notification_queue_capacity);
        tokio::spawn(run_worker(receiver, config, http_client));
        notifier
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue an email and a WhatsApp message for whichever contacts the
    /// recipient has. Returns how many messages were queued.
    pub fn notify(&self, recipient: &Recipient, subject: &str, body: &str) -> usize {
        let mut queued = 0;
        if let Some(email) = non_empty(recipient.email.as_deref()) {
            queued += usize::from(self.enqueue(Channel::Email, email, subject, body));
        }
        if let Some(phone) = non_empty(recipient.phone.as_deref()) {
            queued += usize::from(self.enqueue(Channel::WhatsApp, phone, subject, body));
        }
        queued
    }

    fn enqueue(&self, channel: Channel, recipient: &str, subject: &str, body: &str) -> bool {
        let message = OutboundMessage {
            channel,
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(
                    channel = ?message.channel,
                    "Notification queue full; dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Notification worker stopped; dropping message");
                false
            }
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<OutboundMessage>,
    config: Arc<AppConfig>,
    http_client: Client,
) {
    tracing::info!("Notification worker started");
    while let Some(message) = receiver.recv().await {
        let result = match message.channel {
            Channel::Email => send_email(&http_client, &config, &message).await,
            Channel::WhatsApp => send_whatsapp(&config, &message),
        };
        if let Err(error) = result {
            tracing::warn!(
                channel = ?message.channel,
                error = %error,
                "Notification delivery failed"
            );
        }
    }
    tracing::info!("Notification worker stopped");
}

async fn send_email(
    http_client: &Client,
    config: &AppConfig,
    message: &OutboundMessage,
) -> Result<(), String> {
    let Some(api_key) = config.resend_api_key.as_deref() else {
        tracing::info!(
            recipient = %message.recipient,
            subject = %message.subject,
            "RESEND_API_KEY not configured; email logged only"
        );
        return Ok(());
    };

    let payload = json!({
        "from": config.email_from_address,
        "to": [message.recipient],
        "subject": message.subject,
        "html": format!(
            "<div style=\"font-family: sans-serif; max-width: 600px; margin: 0 auto;\">{}</div>",
            message.body.replace('\n', "<br>")
        ),
    });

    let response = http_client
        .post("https://api.resend.com/emails")
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&payload)
        .send()
        .await
        .map_err(|error| format!("Resend API request failed: {error}"))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body: Value = response
        .json()
        .await
        .unwrap_or_else(|_| json!({"message": "failed to parse response"}));
    let detail = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown Resend API error");
    Err(format!("Resend API error ({status}): {detail}"))
}

fn send_whatsapp(config: &AppConfig, message: &OutboundMessage) -> Result<(), String> {
    if config.whatsapp_enabled {
        tracing::info!(
            recipient = %message.recipient,
            subject = %message.subject,
            "WhatsApp stub: message accepted"
        );
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
