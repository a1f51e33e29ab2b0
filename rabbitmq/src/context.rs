use std::{collections::BTreeMap, time::Duration};

use tokio::{select, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{HEADER_TENANT_ID, HEADER_TRACE_ID, RabbitMQError};

/// Call context travelling with every broker-facing operation
///
/// Carries the propagation metadata (tenant and trace ids) that ends up in message headers,
/// plus the caller's cancellation token and optional deadline. Empty ids mean "not set".
///
/// Cloning is cheap and clones share the same cancellation token.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    tenant_id: String,
    trace_id: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl MessageContext {
    /// Creates a context with no ids, no deadline and a fresh cancellation token
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for background work that is not tied to any caller
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Ties the context to an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token observed by operations running under this context
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels every operation running under this context (and its clones)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Copy of the context that keeps the ids but not the cancellation or deadline
    pub fn detached(&self) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            trace_id: self.trace_id.clone(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Returns the interruption error if the context is already cancelled or past its deadline
    pub fn check(&self) -> Result<(), RabbitMQError> {
        if self.cancel.is_cancelled() {
            return Err(RabbitMQError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(RabbitMQError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline elapses, yielding the matching error
    ///
    /// Never resolves for a context without deadline that nobody cancels.
    pub async fn interrupted(&self) -> RabbitMQError {
        match self.deadline {
            Some(deadline) => select! {
                _ = self.cancel.cancelled() => RabbitMQError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => RabbitMQError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                RabbitMQError::Cancelled
            }
        }
    }

    /// Writes the non-empty propagation ids into a header map
    pub fn inject_headers(&self, headers: &mut BTreeMap<String, String>) {
        if !self.tenant_id.is_empty() {
            headers.insert(HEADER_TENANT_ID.to_owned(), self.tenant_id.clone());
        }
        if !self.trace_id.is_empty() {
            headers.insert(HEADER_TRACE_ID.to_owned(), self.trace_id.clone());
        }
    }

    /// Like [`inject_headers`](Self::inject_headers) but keeps ids already present
    pub fn fill_headers(&self, headers: &mut BTreeMap<String, String>) {
        if !self.tenant_id.is_empty() {
            headers
                .entry(HEADER_TENANT_ID.to_owned())
                .or_insert_with(|| self.tenant_id.clone());
        }
        if !self.trace_id.is_empty() {
            headers
                .entry(HEADER_TRACE_ID.to_owned())
                .or_insert_with(|| self.trace_id.clone());
        }
    }

    /// Rebuilds a context from message headers; missing headers become empty ids
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Self {
        Self {
            tenant_id: headers.get(HEADER_TENANT_ID).cloned().unwrap_or_default(),
            trace_id: headers.get(HEADER_TRACE_ID).cloned().unwrap_or_default(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ids_are_not_injected() {
        let mut headers = BTreeMap::new();
        MessageContext::new().with_trace("t-1").inject_headers(&mut headers);

        assert_eq!(headers.get(HEADER_TRACE_ID).map(String::as_str), Some("t-1"));
        assert!(!headers.contains_key(HEADER_TENANT_ID));
    }

    #[test]
    fn fill_keeps_existing_ids() {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_TENANT_ID.to_owned(), "from-event".to_owned());
        MessageContext::new()
            .with_tenant("acme")
            .with_trace("t-1")
            .fill_headers(&mut headers);

        assert_eq!(headers.get(HEADER_TENANT_ID).map(String::as_str), Some("from-event"));
        assert_eq!(headers.get(HEADER_TRACE_ID).map(String::as_str), Some("t-1"));
    }

    #[test]
    fn headers_restore_ids() {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_TENANT_ID.to_owned(), "acme".to_owned());

        let ctx = MessageContext::from_headers(&headers);
        assert_eq!(ctx.tenant_id(), "acme");
        assert_eq!(ctx.trace_id(), "");
    }

    #[test]
    fn detached_context_ignores_parent_cancellation() {
        let ctx = MessageContext::new().with_tenant("acme");
        let detached = ctx.detached();
        ctx.cancel();

        assert!(matches!(ctx.check(), Err(RabbitMQError::Cancelled)));
        assert!(detached.check().is_ok());
        assert_eq!(detached.tenant_id(), "acme");
    }

    #[tokio::test]
    async fn deadline_reports_deadline_exceeded() {
        let ctx = MessageContext::new().with_timeout(Duration::from_millis(10));
        let err = ctx.interrupted().await;
        assert!(matches!(err, RabbitMQError::DeadlineExceeded));
    }
}
