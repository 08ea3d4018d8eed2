//! External boundaries: mail store, delivery channel and HTTP ingress.

pub mod gmail;
pub mod slack;
pub mod webhook;

pub use gmail::{GmailClient, WatchRegistration};
pub use slack::SlackNotifier;
pub use webhook::{WebhookState, webhook_routes};
