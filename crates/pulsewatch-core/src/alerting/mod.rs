//! Alert evaluation and notification delivery
//!
//! The evaluator decides which rules fire for a check result; providers in
//! the [`NotifierRegistry`] deliver the notifications.

mod evaluator;
mod notifier;

pub use evaluator::{consecutive_failures, AlertEvaluator, AlertSummary};
pub use notifier::{
    sign_payload, Delivery, EmailProvider, Notification, NotificationError, NotificationProvider,
    NotifierRegistry, SmsProvider, TriggerKind, WebhookProvider, EVENT_HEADER, SIGNATURE_HEADER,
};
