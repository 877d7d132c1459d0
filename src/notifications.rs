//! User-facing toast notifications, delivered over a [`MessageBus`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::{MessageBus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct Notifier {
    bus: MessageBus<Toast>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(ToastLevel::Success, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(ToastLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(ToastLevel::Error, message.into());
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(Toast) + Send + 'static,
    {
        self.bus.subscribe(handler)
    }

    fn push(&self, level: ToastLevel, message: String) {
        self.bus.publish(Toast {
            level,
            message,
            at: Utc::now(),
        });
    }
}
