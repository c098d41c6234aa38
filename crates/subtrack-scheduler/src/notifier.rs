use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtrack_core::config::WebhookNotifierConfig;
use subtrack_subscriptions::Subscription;
use subtrack_users::UserContact;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::Checkpoint;

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = concat!("subtrack/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Connection, timeout or other failure before a response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("receiver rejected the reminder ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("no reminder template for {0} days before renewal")]
    NoTemplate(u32),

    #[error("notifier misconfigured: {0}")]
    Config(String),
}

impl NotifyError {
    /// Transport failures and 5xx responses may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            NotifyError::Transport(_) => true,
            NotifyError::Rejected { status, .. } => *status >= 500 || *status == 429,
            NotifyError::NoTemplate(_) | NotifyError::Config(_) => false,
        }
    }
}

/// Delivers one reminder for one checkpoint.
///
/// Delivery is best-effort at-most-once: the executor guards every call with
/// a journal marker, and a call that may have reached the receiver before a
/// crash is never repeated.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        to: &UserContact,
        checkpoint: &Checkpoint,
        subscription: &Subscription,
    ) -> Result<(), NotifyError>;
}

/// Fields a reminder body is rendered from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderFields {
    pub user_name: String,
    pub subscription_name: String,
    /// e.g. `Mar 1, 2025`.
    pub renewal_date: String,
    pub plan_name: String,
    /// e.g. `USD 15.99 (monthly)`.
    pub price: String,
    pub payment_method: String,
    pub days_left: u32,
}

/// A rendered reminder, ready for any transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// `<subscription>:<offset>:<renewal date>`; stable across retries and replays.
    pub idempotency_key: String,
    pub fields: ReminderFields,
}

fn subject(offset_days: u32, name: &str) -> Option<String> {
    let s = match offset_days {
        7 => format!("📅 Reminder: Your {name} Subscription Renews in 7 Days!"),
        5 => format!("⏳ {name} Renews in 5 Days – Stay Subscribed!"),
        2 => format!("🚀 2 Days Left!  {name} Subscription Renewal"),
        1 => format!("⚡ Final Reminder: {name} Renews Tomorrow!"),
        _ => return None,
    };
    Some(s)
}

/// Render the reminder for `checkpoint`. Only the 7/5/2/1-day offsets have
/// templates; the renewal checkpoint itself sends nothing.
pub fn render(
    to: &UserContact,
    checkpoint: &Checkpoint,
    subscription: &Subscription,
) -> Result<ReminderMessage, NotifyError> {
    let days = checkpoint.offset_days;
    let subject = subject(days, &subscription.name).ok_or(NotifyError::NoTemplate(days))?;
    let renewal = subscription
        .renewal_date
        .ok_or_else(|| NotifyError::Config(format!("subscription {} has no renewal date", subscription.id)))?;

    let fields = ReminderFields {
        user_name: to.name.clone(),
        subscription_name: subscription.name.clone(),
        renewal_date: renewal.format("%b %-d, %Y").to_string(),
        plan_name: subscription.name.clone(),
        price: format!(
            "{} {} ({})",
            subscription.currency.code(),
            subscription.price,
            subscription.frequency
        ),
        payment_method: subscription.payment_method.clone(),
        days_left: days,
    };

    let when = if days == 1 {
        "tomorrow".to_string()
    } else {
        format!("in {days} days")
    };
    let body = format!(
        "Hello {user},\n\n\
         Your {plan} subscription renews on {date} ({when}).\n\n\
         Plan: {plan}\n\
         Price: {price}\n\
         Payment method: {payment}\n\n\
         If you no longer want it, cancel before the renewal date.\n",
        user = fields.user_name,
        plan = fields.plan_name,
        date = fields.renewal_date,
        price = fields.price,
        payment = fields.payment_method,
    );

    Ok(ReminderMessage {
        to: to.email.clone(),
        subject,
        body,
        idempotency_key: format!("{}:{}:{}", subscription.id, days, renewal),
        fields,
    })
}

/// Renders reminders and writes them to the log. The default dispatcher.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationDispatcher for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        to: &UserContact,
        checkpoint: &Checkpoint,
        subscription: &Subscription,
    ) -> Result<(), NotifyError> {
        let msg = render(to, checkpoint, subscription)?;
        info!(
            to = %msg.to,
            subscription_id = %subscription.id,
            days_left = msg.fields.days_left,
            key = %msg.idempotency_key,
            subject = %msg.subject,
            "reminder"
        );
        debug!(body = %msg.body, "reminder body");
        Ok(())
    }
}

/// POSTs each rendered reminder as JSON to a configured URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookNotifierConfig) -> Result<Self, NotifyError> {
        if config.url.trim().is_empty() {
            return Err(NotifyError::Config("notifier.webhook.url is empty".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotifyError::Config(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
        })
    }
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| NotifyError::Config("invalid HMAC key length".into()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl NotificationDispatcher for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(
        &self,
        to: &UserContact,
        checkpoint: &Checkpoint,
        subscription: &Subscription,
    ) -> Result<(), NotifyError> {
        let msg = render(to, checkpoint, subscription)?;
        let body = serde_json::to_vec(&msg).map_err(|e| NotifyError::Config(e.to_string()))?;

        let mut req = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header("idempotency-key", &msg.idempotency_key);
        if let Some(secret) = &self.secret {
            req = req.header("x-subtrack-signature", sign(secret, &body)?);
        }

        let resp = req
            .body(body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(
            to = %msg.to,
            subscription_id = %subscription.id,
            days_left = msg.fields.days_left,
            status = status.as_u16(),
            "reminder delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use subtrack_core::types::{
        Category, Currency, Frequency, SubscriptionId, SubscriptionStatus, UserId,
    };

    fn contact() -> UserContact {
        UserContact {
            id: UserId::from("user-1"),
            name: "Ada".into(),
            email: "ada@example.com".into(),
        }
    }

    fn subscription() -> Subscription {
        Subscription {
            id: SubscriptionId::from("sub-1"),
            name: "Netflix".into(),
            price: 15.99,
            currency: Currency::Usd,
            frequency: Frequency::Monthly,
            category: Category::Entertainment,
            payment_method: "Visa 4242".into(),
            status: SubscriptionStatus::Active,
            start_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            renewal_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            owner: UserId::from("user-1"),
            workflow_handle: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn checkpoint(offset_days: u32) -> Checkpoint {
        Checkpoint {
            offset_days,
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap() - chrono::Days::new(offset_days as u64),
        }
    }

    #[test]
    fn renders_reminder_fields() {
        let msg = render(&contact(), &checkpoint(7), &subscription()).unwrap();
        assert_eq!(msg.to, "ada@example.com");
        assert_eq!(msg.subject, "📅 Reminder: Your Netflix Subscription Renews in 7 Days!");
        assert_eq!(msg.fields.renewal_date, "Mar 1, 2025");
        assert_eq!(msg.fields.price, "USD 15.99 (monthly)");
        assert_eq!(msg.fields.days_left, 7);
        assert_eq!(msg.idempotency_key, "sub-1:7:2025-03-01");
        assert!(msg.body.contains("Hello Ada"));
        assert!(msg.body.contains("in 7 days"));

        let last = render(&contact(), &checkpoint(1), &subscription()).unwrap();
        assert_eq!(last.subject, "⚡ Final Reminder: Netflix Renews Tomorrow!");
        assert!(last.body.contains("tomorrow"));
    }

    #[test]
    fn renewal_checkpoint_has_no_template() {
        let err = render(&contact(), &checkpoint(0), &subscription()).unwrap_err();
        assert!(matches!(err, NotifyError::NoTemplate(0)));
        assert!(!err.is_transient());
    }

    #[test]
    fn signature_is_hex_hmac() {
        let sig = sign("secret", b"{}").unwrap();
        let hex_part = sig.strip_prefix("sha256=").unwrap();
        assert_eq!(hex_part.len(), 64);

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"{}");
        assert!(mac.verify_slice(&hex::decode(hex_part).unwrap()).is_ok());
        assert_ne!(sign("other", b"{}").unwrap(), sig);
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(NotifyError::Rejected { status: 503, body: String::new() }.is_transient());
        assert!(!NotifyError::Rejected { status: 404, body: String::new() }.is_transient());
    }

    #[test]
    fn webhook_requires_url() {
        let config = WebhookNotifierConfig {
            url: " ".into(),
            secret: None,
            timeout_ms: 1000,
        };
        assert!(matches!(WebhookNotifier::new(&config), Err(NotifyError::Config(_))));
    }
}
