//! Notifications about backup and restore outcomes

use async_trait::async_trait;
use tracing::{info, warn};

use crate::backup::Result;

/// Notification channel for operators
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, message: &str) -> Result<()>;
}

/// Writes alerts to the log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_alert(&self, message: &str) -> Result<()> {
        info!(target: "backup_alerts", "{}", message);
        Ok(())
    }
}

/// Send an alert, logging instead of failing when the sink errors
pub async fn notify(sink: &dyn AlertSink, message: &str) {
    if let Err(e) = sink.send_alert(message).await {
        warn!("Failed to send alert: {}", e);
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}
