//! Operator alerts
//!
//! The federator reports through a [`Notifier`]. With Telegram credentials
//! configured alerts are posted to the group; otherwise they are only logged.

use crate::config::TelegramConfig;
use crate::error::{FederatorError, FederatorResult};
use crate::events::TransactionId;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::H256;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

/// Something the operator should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    Started {
        directions: Vec<String>,
    },
    CycleAborted {
        direction: String,
        kind: &'static str,
        message: String,
    },
    InvalidEvent {
        direction: String,
        detail: String,
    },
    Reverted {
        direction: String,
        id: TransactionId,
        source_tx: H256,
        reason: String,
    },
    IdentityMismatch {
        direction: String,
        local: String,
        remote: String,
    },
    Relayed {
        direction: String,
        id: TransactionId,
        source_tx: H256,
        destination_tx: H256,
    },
    Proposed {
        direction: String,
        id: TransactionId,
        source_tx: H256,
        destination_tx: H256,
    },
}

impl Alert {
    /// Informational alerts report progress, the rest need attention
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            Alert::Started { .. } | Alert::Relayed { .. } | Alert::Proposed { .. }
        )
    }

    /// HTML message body prefixed with the federator instance
    pub fn render(&self, instance_id: &str) -> String {
        let icon = if self.is_informational() { "ℹ️" } else { "🚨" };
        let body = match self {
            Alert::Started { directions } => {
                format!("🚀 <b>Federator started</b>\n{}", escape(&directions.join(", ")))
            }
            Alert::CycleAborted {
                direction,
                kind,
                message,
            } => format!(
                "<b>Cycle aborted</b> ({})\n<b>Kind:</b> {}\n{}",
                escape(direction),
                kind,
                escape(message)
            ),
            Alert::InvalidEvent { direction, detail } => format!(
                "<b>Invalid event skipped</b> ({})\n{}",
                escape(direction),
                escape(detail)
            ),
            Alert::Reverted {
                direction,
                id,
                source_tx,
                reason,
            } => format!(
                "<b>Transfer rejected by destination</b> ({})\n\
                 <b>Id:</b> <code>{}</code>\n<b>Source tx:</b> <code>{:?}</code>\n{}\n\
                 Manual remediation required.",
                escape(direction),
                id,
                source_tx,
                escape(reason)
            ),
            Alert::IdentityMismatch {
                direction,
                local,
                remote,
            } => format!(
                "<b>Transaction id mismatch</b> ({})\n<b>Local:</b> <code>{}</code>\n\
                 <b>Destination:</b> <code>{}</code>",
                escape(direction),
                escape(local),
                escape(remote)
            ),
            Alert::Relayed {
                direction,
                id,
                source_tx,
                destination_tx,
            } => format!(
                "✅ <b>Transfer relayed</b> ({})\n<b>Id:</b> <code>{}</code>\n\
                 <b>Source tx:</b> <code>{:?}</code>\n<b>Destination tx:</b> <code>{:?}</code>",
                escape(direction),
                id,
                source_tx,
                destination_tx
            ),
            Alert::Proposed {
                direction,
                id,
                source_tx,
                destination_tx,
            } => format!(
                "📝 <b>Transfer proposed to multisig</b> ({})\n<b>Id:</b> <code>{}</code>\n\
                 <b>Source tx:</b> <code>{:?}</code>\n<b>Proposal tx:</b> <code>{:?}</code>",
                escape(direction),
                id,
                source_tx,
                destination_tx
            ),
        };

        format!("<b>[{}]</b> {}\n{}", escape(instance_id), icon, body)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Alert sink; delivery failures are logged and never propagate
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Posts alerts to a Telegram group
pub struct TelegramNotifier {
    instance_id: String,
    sender: Arc<TelegramSender>,
}

/// Connection to the bot API, shared with background deliveries
struct TelegramSender {
    group_id: i64,
    client: Client,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig, group_id: i64, instance_id: &str) -> FederatorResult<Self> {
        Self::with_api(TELEGRAM_API, config, group_id, instance_id)
    }

    fn with_api(
        api: &str,
        config: &TelegramConfig,
        group_id: i64,
        instance_id: &str,
    ) -> FederatorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| FederatorError::Config(format!("Telegram client: {}", e)))?;

        Ok(Self {
            instance_id: instance_id.to_string(),
            sender: Arc::new(TelegramSender {
                group_id,
                client,
                api_base: format!("{}/bot{}", api, config.token),
            }),
        })
    }
}

impl TelegramSender {
    async fn send_message(&self, text: &str, attempts: u32) {
        for attempt in 0..attempts {
            match self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&json!({
                    "chat_id": self.group_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(
                        "Telegram send attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        resp.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "Telegram send attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        e.without_url()
                    );
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1)))
                    .await;
            }
        }

        warn!("Failed to send Telegram message after {} attempts", attempts);
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    /// Informational alerts go out in the background with a single attempt;
    /// the rest are retried before the cycle continues.
    async fn notify(&self, alert: &Alert) {
        let text = format!(
            "{}\n<i>{}</i>",
            alert.render(&self.instance_id),
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        if alert.is_informational() {
            let sender = self.sender.clone();
            tokio::spawn(async move { sender.send_message(&text, 1).await });
        } else {
            self.sender.send_message(&text, MAX_RETRIES).await;
        }
    }
}

/// Logs alerts without delivering them anywhere
pub struct NullNotifier {
    instance_id: String,
}

impl NullNotifier {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, alert: &Alert) {
        info!("Alert (not delivered): {}", alert.render(&self.instance_id));
    }
}

/// Pick the notifier variant from configuration
pub fn from_config(
    telegram: Option<&TelegramConfig>,
    instance_id: &str,
) -> FederatorResult<Arc<dyn Notifier>> {
    match telegram {
        Some(config) if config.is_configured() => {
            let group_id = config.group_id.unwrap_or_default();
            info!("Telegram alerts enabled for group {}", group_id);
            Ok(Arc::new(TelegramNotifier::new(config, group_id, instance_id)?))
        }
        _ => {
            info!("Telegram not configured, alerts are only logged");
            Ok(Arc::new(NullNotifier::new(instance_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prefixes_instance() {
        let alert = Alert::CycleAborted {
            direction: "rsk-to-eth".to_string(),
            kind: "rpc_timeout",
            message: "Timeout on chain 4 waiting for eth_call".to_string(),
        };
        let text = alert.render("fed-1");
        assert!(text.starts_with("<b>[fed-1]</b> 🚨"));
        assert!(text.contains("rpc_timeout"));
        assert!(text.contains("rsk-to-eth"));
    }

    #[test]
    fn test_render_escapes_html() {
        let alert = Alert::InvalidEvent {
            direction: "eth-to-rsk".to_string(),
            detail: "data <truncated> & odd".to_string(),
        };
        let text = alert.render("fed");
        assert!(text.contains("data &lt;truncated&gt; &amp; odd"));
    }

    #[test]
    fn test_relayed_is_informational() {
        let alert = Alert::Relayed {
            direction: "rsk-to-eth".to_string(),
            id: TransactionId([1; 32]),
            source_tx: H256::repeat_byte(2),
            destination_tx: H256::repeat_byte(3),
        };
        assert!(alert.is_informational());
        let text = alert.render("fed");
        assert!(text.contains(&TransactionId([1; 32]).to_string()));
        assert!(text.contains(&format!("{:?}", H256::repeat_byte(3))));
    }

    #[test]
    fn test_notifier_selection() {
        let missing_group = TelegramConfig {
            token: "123:abc".to_string(),
            group_id: None,
        };
        assert!(!missing_group.is_configured());
        assert!(from_config(Some(&missing_group), "fed").is_ok());
        assert!(from_config(None, "fed").is_ok());

        let configured = TelegramConfig {
            token: "123:abc".to_string(),
            group_id: Some(-100),
        };
        assert!(configured.is_configured());
        assert!(from_config(Some(&configured), "fed").is_ok());
    }

    #[tokio::test]
    async fn test_informational_alert_does_not_wait_for_delivery() {
        // nothing listens on the discard port
        let config = TelegramConfig {
            token: "123:abc".to_string(),
            group_id: Some(-100),
        };
        let notifier = TelegramNotifier::with_api("http://127.0.0.1:9", &config, -100, "fed").unwrap();

        let alert = Alert::Relayed {
            direction: "rsk-to-eth".to_string(),
            id: TransactionId([1; 32]),
            source_tx: H256::repeat_byte(2),
            destination_tx: H256::repeat_byte(3),
        };
        tokio::time::timeout(Duration::from_millis(100), notifier.notify(&alert))
            .await
            .expect("informational alerts are delivered in the background");
    }

    #[tokio::test]
    async fn test_null_notifier_never_fails() {
        let notifier = NullNotifier::new("fed");
        notifier
            .notify(&Alert::Started {
                directions: vec!["rsk-to-eth".to_string()],
            })
            .await;
    }
}
