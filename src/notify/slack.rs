//! Slack Incoming Webhook delivery with Block Kit payloads.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, warn};

/// Slack rejects sections with more than ten fields.
const MAX_SECTION_FIELDS: usize = 10;

/// One notification: a header, label/value pairs and a footer line.
#[derive(Debug, Clone)]
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

#[derive(Debug, Serialize)]
struct Payload {
    /// Fallback for clients that do not render blocks.
    text: String,
    blocks: Vec<Block>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Header { text: Text },
    Section { fields: Vec<Text> },
    Divider,
    Context { elements: Vec<Text> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Text {
    PlainText { text: String, emoji: bool },
    Mrkdwn { text: String },
}

impl From<&SlackMessage> for Payload {
    fn from(message: &SlackMessage) -> Self {
        let mut blocks = vec![Block::Header {
            text: Text::PlainText {
                text: message.header.clone(),
                emoji: true,
            },
        }];
        for chunk in message.fields.chunks(MAX_SECTION_FIELDS) {
            blocks.push(Block::Section {
                fields: chunk
                    .iter()
                    .map(|(label, value)| Text::Mrkdwn {
                        text: format!("*{label}*\n{value}"),
                    })
                    .collect(),
            });
        }
        blocks.push(Block::Divider);
        blocks.push(Block::Context {
            elements: vec![Text::Mrkdwn {
                text: message.context.clone(),
            }],
        });
        Self {
            text: format!("{}\n{}", message.header, message.context),
            blocks,
        }
    }
}

pub struct SlackNotifier {
    webhook_url: SecretString,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: &SecretString) -> Self {
        Self {
            webhook_url: SecretString::from(webhook_url.expose_secret()),
            client: reqwest::Client::new(),
        }
    }

    /// Deliver `message`. Delivery failures are logged and otherwise ignored.
    pub async fn send(&self, cluster: &str, message: &SlackMessage) {
        let result = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&Payload::from(message))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => info!(cluster = %cluster, header = %message.header, "Slack notification sent"),
            // The URL is the secret; keep it out of the log.
            Err(e) => warn!(
                cluster = %cluster,
                status = ?e.status(),
                error = %e.without_url(),
                "Slack notification failed"
            ),
        }
    }
}
