// src/alerts.rs
use chrono::Utc;
use log::{error, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Fire-and-forget notification. Implementations must not block the caller
/// and must swallow their own delivery failures.
pub trait AlertSink: Send + Sync {
    fn notify(&self, severity: Severity, message: &str);
}

pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!("ALERT: {}", message),
            Severity::Warning => warn!("ALERT: {}", message),
            Severity::Critical => error!("CRITICAL ALERT: {}", message),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    severity: Severity,
    message: &'a str,
    source: &'static str,
    sent_at: String,
}

/// Posts alerts as JSON to an HTTP endpoint from a spawned task.
pub struct WebhookAlertSink {
    client: Arc<Client>,
    url: String,
    timeout: Duration,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Arc::new(Client::new()),
            url: url.into(),
            timeout,
        }
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        let body = match serde_json::to_value(WebhookPayload {
            severity,
            message,
            source: "prediction_pipeline",
            sent_at: Utc::now().to_rfc3339(),
        }) {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not serialize alert payload: {}", e);
                return;
            }
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available; webhook alert dropped: {}", message);
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        handle.spawn(async move {
            match client.post(&url).timeout(timeout).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!("Alert webhook {} answered {}", url, resp.status()),
                Err(e) => warn!("Alert webhook {} failed: {}", url, e),
            }
        });
    }
}

/// Keeps every alert; used by tests and embedded callers that poll.
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<(Severity, String)>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<(Severity, String)> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.alerts()
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }
}

impl AlertSink for MemoryAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push((severity, message.to_string()));
        }
    }
}

/// Fans each alert out to every inner sink.
pub struct CompositeAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl CompositeAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

impl AlertSink for CompositeAlertSink {
    fn notify(&self, severity: Severity, message: &str) {
        for sink in &self.sinks {
            sink.notify(severity, message);
        }
    }
}

/// Log sink, plus a webhook when a URL is configured.
pub fn build_alert_sink(webhook_url: Option<&str>, timeout: Duration) -> Arc<dyn AlertSink> {
    match webhook_url {
        Some(url) => {
            info!("Critical alerts will also be posted to {}", url);
            let sinks: Vec<Arc<dyn AlertSink>> = vec![
                Arc::new(LogAlertSink),
                Arc::new(WebhookAlertSink::new(url, timeout)),
            ];
            Arc::new(CompositeAlertSink::new(sinks))
        }
        None => Arc::new(LogAlertSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(MemoryAlertSink::new());
        let b = Arc::new(MemoryAlertSink::new());
        let sinks: Vec<Arc<dyn AlertSink>> = vec![a.clone(), b.clone(), Arc::new(LogAlertSink)];
        let composite = CompositeAlertSink::new(sinks);

        composite.notify(Severity::Critical, "duplicates in predictions:2024-01-15");
        composite.notify(Severity::Warning, "degraded trigger");

        assert_eq!(a.alerts().len(), 2);
        assert_eq!(b.count(Severity::Critical), 1);
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_reach_caller() {
        // Nothing listens on port 9; delivery fails inside the spawned task.
        let sink = WebhookAlertSink::new("http://127.0.0.1:9/alerts", Duration::from_millis(100));
        sink.notify(Severity::Critical, "lock timeout");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[test]
    fn test_webhook_without_runtime_is_dropped() {
        let sink = WebhookAlertSink::new("http://127.0.0.1:9/alerts", Duration::from_millis(100));
        sink.notify(Severity::Info, "no runtime here");
    }
}
