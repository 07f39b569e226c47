//! Generic webhook provider.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::notification::provider::ChannelProvider;
use crate::notification::retry::{is_retryable_error, is_retryable_status};
use crate::notification::types::{NotificationContext, NotificationResult, RecipientDistribution};
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Webhook provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Target URL.
    pub url: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Honour proxy settings from the environment.
    #[serde(default = "default_true")]
    pub use_system_proxy: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_method(),
            headers: HashMap::new(),
            auth: None,
            timeout_secs: default_timeout(),
            use_system_proxy: true,
        }
    }
}

/// Webhook authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

impl WebhookSettings {
    /// Every problem with these settings.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.url.trim().is_empty() {
            problems.push("url must not be empty".to_string());
        } else {
            match url::Url::parse(&self.url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => problems.push(format!(
                    "url scheme must be http or https, got '{}'",
                    parsed.scheme()
                )),
                Err(e) => problems.push(format!("url is invalid: {e}")),
            }
        }

        if !matches!(self.method.to_uppercase().as_str(), "POST" | "PUT") {
            problems.push(format!("method must be POST or PUT, got '{}'", self.method));
        }

        if self.timeout_secs == 0 {
            problems.push("timeout_secs must be greater than 0".to_string());
        }

        problems
    }
}

/// Delivers each distribution as one JSON request.
pub struct WebhookProvider {
    channel: String,
    settings: WebhookSettings,
    client: Client,
}

impl WebhookProvider {
    pub fn new(channel: impl Into<String>, settings: WebhookSettings) -> Result<Self> {
        let problems = settings.problems();
        if !problems.is_empty() {
            return Err(Error::config(format!(
                "invalid webhook settings: {}",
                problems.join("; ")
            )));
        }

        let client = build_client(
            Duration::from_secs(settings.timeout_secs),
            settings.use_system_proxy,
        )?;
        Ok(Self {
            channel: channel.into(),
            settings,
            client,
        })
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.settings.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        match &self.settings.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, value);
                }
            }
            // Applied on the request builder.
            Some(WebhookAuth::Basic { .. }) | None => {}
        }

        headers
    }

    fn build_body(
        &self,
        distribution: &RecipientDistribution,
        payload: &Value,
        context: &NotificationContext,
    ) -> Value {
        json!({
            "event_id": context.event_id,
            "correlation_id": context.correlation_id,
            "event_type": context.event_type,
            "attempt": context.attempt,
            "channel": self.channel,
            "distribution": distribution,
            "payload": payload,
        })
    }
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(
        &self,
        distribution: &RecipientDistribution,
        payload: &Value,
        context: &NotificationContext,
    ) -> Result<Vec<NotificationResult>> {
        let mut request = match self.settings.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&self.settings.url),
            _ => self.client.post(&self.settings.url),
        };
        request = request
            .headers(self.build_headers())
            .json(&self.build_body(distribution, payload, context));

        if let Some(WebhookAuth::Basic { username, password }) = &self.settings.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = Error::from(e);
                let retryable = is_retryable_error(&err);
                warn!(
                    channel = %self.channel,
                    event_id = %context.event_id,
                    error = %err,
                    "Webhook request failed"
                );
                return Ok(vec![
                    NotificationResult::failed(&self.channel, self.name(), err.to_string())
                        .with_metadata("retryable", json!(retryable)),
                ]);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                channel = %self.channel,
                event_id = %context.event_id,
                status = status.as_u16(),
                "Webhook rejected delivery"
            );
            return Ok(vec![
                NotificationResult::failed(
                    &self.channel,
                    self.name(),
                    format!("webhook returned {status}: {body}"),
                )
                .with_metadata("http_status", json!(status.as_u16()))
                .with_metadata("retryable", json!(is_retryable_status(status.as_u16()))),
            ]);
        }

        debug!(
            channel = %self.channel,
            event_id = %context.event_id,
            status = status.as_u16(),
            "Webhook notification sent"
        );
        Ok(vec![
            NotificationResult::sent(&self.channel, self.name())
                .with_metadata("http_status", json!(status.as_u16())),
        ])
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        let settings: WebhookSettings = serde_json::from_value(config.clone())
            .map_err(|e| vec![format!("settings are malformed: {e}")])?;
        let problems = settings.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    async fn health_check(&self) -> bool {
        url::Url::parse(&self.settings.url).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::types::{NotificationStatus, Recipient};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn provider(url: &str) -> WebhookProvider {
        WebhookProvider::new(
            "webhook",
            WebhookSettings {
                url: url.to_string(),
                use_system_proxy: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// Answer a single request with `status_line` and return the raw request.
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/hook"), handle)
    }

    #[test]
    fn test_settings_problems() {
        let settings = WebhookSettings {
            url: "ftp://example.com".to_string(),
            method: "DELETE".to_string(),
            ..Default::default()
        };
        let problems = settings.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("scheme"));
        assert!(problems[1].contains("method"));

        assert_eq!(WebhookSettings::default().problems(), vec!["url must not be empty"]);
    }

    #[test]
    fn test_validate_config_reports_every_problem() {
        let provider = provider("https://example.com/hook");
        assert!(
            provider
                .validate_config(&json!({ "url": "https://example.com/x", "method": "put" }))
                .is_ok()
        );

        let problems = provider
            .validate_config(&json!({ "url": "not a url", "method": "GET" }))
            .unwrap_err();
        assert_eq!(problems.len(), 2);

        let problems = provider.validate_config(&json!({ "method": 5 })).unwrap_err();
        assert!(problems[0].contains("malformed"));
    }

    #[test]
    fn test_build_headers_with_bearer() {
        let provider = WebhookProvider::new(
            "webhook",
            WebhookSettings {
                url: "https://example.com/hook".to_string(),
                headers: HashMap::from([("X-Source".to_string(), "notifyd".to_string())]),
                auth: Some(WebhookAuth::Bearer {
                    token: "secret".to_string(),
                }),
                ..Default::default()
            },
        )
        .unwrap();

        let headers = provider.build_headers();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer secret");
        assert_eq!(headers.get("x-source").unwrap(), "notifyd");
    }

    #[test]
    fn test_build_body() {
        let provider = provider("https://example.com/hook");
        let ctx = NotificationContext::new("user.created").with_event_id("evt-1");
        let distribution = RecipientDistribution::main(vec![Recipient::new("u1")]);

        let body = provider.build_body(&distribution, &json!({ "name": "Ada" }), &ctx);
        assert_eq!(body["event_id"], "evt-1");
        assert_eq!(body["event_type"], "user.created");
        assert_eq!(body["payload"]["name"], "Ada");
        assert_eq!(body["distribution"]["main"][0]["id"], "u1");
    }

    #[tokio::test]
    async fn test_send_success() {
        let (url, server) = one_shot_server("HTTP/1.1 204 No Content").await;
        let provider = provider(&url);
        let ctx = NotificationContext::new("user.created");

        let results = provider
            .send(&RecipientDistribution::default(), &json!({ "k": 1 }), &ctx)
            .await
            .unwrap();

        assert_eq!(results[0].status, NotificationStatus::Sent);
        assert_eq!(results[0].metadata["http_status"], json!(204));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains(&ctx.event_id));
    }

    #[tokio::test]
    async fn test_send_server_error_is_failed_and_retryable() {
        let (url, server) = one_shot_server("HTTP/1.1 503 Service Unavailable").await;
        let provider = provider(&url);

        let results = provider
            .send(
                &RecipientDistribution::default(),
                &json!({}),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(results[0].status, NotificationStatus::Failed);
        assert_eq!(results[0].metadata["http_status"], json!(503));
        assert_eq!(results[0].metadata["retryable"], json!(true));
    }

    #[tokio::test]
    async fn test_send_client_error_is_not_retryable() {
        let (url, server) = one_shot_server("HTTP/1.1 400 Bad Request").await;
        let provider = provider(&url);

        let results = provider
            .send(
                &RecipientDistribution::default(),
                &json!({}),
                &NotificationContext::new("user.created"),
            )
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(results[0].status, NotificationStatus::Failed);
        assert_eq!(results[0].metadata["retryable"], json!(false));
    }
}
