//! Operator notifications
//!
//! Events that need a human: vote ties, files missing everywhere,
//! unidentical duplicates and security events on replica servers.

use std::sync::Mutex;
use serde::{Deserialize, Serialize};

/// Severity of an operator notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Warning,
    Error,
    Security,
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationLevel::Warning => write!(f, "WARNING"),
            NotificationLevel::Error => write!(f, "ERROR"),
            NotificationLevel::Security => write!(f, "SECURITY"),
        }
    }
}

/// A recorded notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

/// Sink for operator notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotificationLevel, message: &str);
}

/// Notifier that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Warning => tracing::warn!(target: "bitarchive::notify", "{}", message),
            NotificationLevel::Error => tracing::error!(target: "bitarchive::notify", "{}", message),
            NotificationLevel::Security => {
                tracing::warn!(target: "bitarchive::security", "Security event: {}", message)
            }
        }
    }
}

/// Notifier that logs and keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications so far
    pub fn events(&self) -> Vec<Notification> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether any notification contains `text`
    pub fn contains(&self, text: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(text))
    }

    /// Number of notifications at a level
    pub fn count(&self, level: NotificationLevel) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        TracingNotifier.notify(level, message);
        let event = Notification {
            level,
            message: message.to_string(),
        };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify(NotificationLevel::Warning, "vote tie for a.warc");
        notifier.notify(NotificationLevel::Security, "wrong credentials");

        assert!(notifier.contains("wrong credentials"));
        assert!(!notifier.contains("checksum mismatch"));
        assert_eq!(notifier.count(NotificationLevel::Security), 1);
        assert_eq!(notifier.events().len(), 2);
    }
}
