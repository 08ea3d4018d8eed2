//! Message fetcher: bounded retries around a read-only [`MessageSource`].

use std::sync::Arc;

use tracing::debug;

use crate::error::FetchError;
use crate::pipeline::retry::{Attempted, RetryPolicy, retry};
use crate::pipeline::types::{Message, MessageSource};

pub struct MessageFetcher {
    source: Arc<dyn MessageSource>,
    policy: RetryPolicy,
}

impl MessageFetcher {
    pub fn new(source: Arc<dyn MessageSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch one message. `NotFound` is returned immediately; transient
    /// failures are retried until the policy is exhausted.
    pub async fn fetch(
        &self,
        mailbox_id: &str,
        message_id: &str,
    ) -> Attempted<Message, FetchError> {
        let out = retry(
            &self.policy,
            "fetch",
            || self.source.fetch(mailbox_id, message_id),
            FetchError::is_transient,
        )
        .await;
        debug!(
            mailbox = mailbox_id,
            message_id,
            attempts = out.attempts,
            ok = out.result.is_ok(),
            "Fetch finished"
        );
        out
    }
}
