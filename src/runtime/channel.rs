use std::{sync::Arc, time::Duration};

use serde_json::Value;

use crate::error::TransportError;

use super::{
    protocol::{PingReply, PingRequest, Reply},
    RuntimeHost,
};

/// The one request/response wrapper around the host's messaging API.
///
/// Every call is bounded by a timeout. A reply that arrives after the timeout
/// is dropped together with the abandoned host future.
#[derive(Clone)]
pub struct MessageChannel {
    host: Arc<dyn RuntimeHost>,
}

impl MessageChannel {
    pub fn new(host: Arc<dyn RuntimeHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<dyn RuntimeHost> {
        &self.host
    }

    /// Raw round-trip: returns whatever the peer replied.
    pub async fn send(&self, message: Value, timeout: Duration) -> Result<Value, TransportError> {
        match tokio::time::timeout(timeout, self.host.post(message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Round-trip that unwraps a standard [`Reply`]. A `success: false` reply
    /// becomes a transport error; `retryable: false` marks it as a rejection.
    /// Replies without a `success` field are returned unchanged.
    pub async fn request(&self, message: Value, timeout: Duration) -> Result<Value, TransportError> {
        let raw = self.send(message, timeout).await?;
        if raw.get("success").is_none() {
            return Ok(raw);
        }

        let reply: Reply = serde_json::from_value(raw)
            .map_err(|err| TransportError::Failed(format!("malformed reply: {err}")))?;
        if reply.success {
            return Ok(reply.data);
        }

        let error = reply
            .error
            .unwrap_or_else(|| "receiver reported failure".to_string());
        if reply.retryable {
            Err(TransportError::Failed(error))
        } else {
            Err(TransportError::Rejected(error))
        }
    }

    /// One liveness round-trip. A missing reply counts as failure.
    pub async fn ping(&self, timeout: Duration) -> bool {
        let request = match serde_json::to_value(PingRequest::now()) {
            Ok(value) => value,
            Err(_) => return false,
        };

        match self.send(request, timeout).await {
            Ok(raw) => serde_json::from_value::<PingReply>(raw)
                .map(|reply| reply.is_alive())
                .unwrap_or(false),
            Err(err) => {
                log::debug!("Liveness probe failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BoxFuture;
    use serde_json::json;

    struct ScriptedHost {
        reply: Value,
        delay: Duration,
    }

    impl RuntimeHost for ScriptedHost {
        fn messaging_available(&self) -> bool {
            true
        }

        fn process_id(&self) -> Option<String> {
            Some("worker-1".into())
        }

        fn resource_url(&self, path: &str) -> Option<String> {
            Some(format!("chrome-extension://abc/{path}"))
        }

        fn post(&self, _message: Value) -> BoxFuture<'_, Result<Value, TransportError>> {
            let reply = self.reply.clone();
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(reply)
            })
        }
    }

    fn channel(reply: Value, delay: Duration) -> MessageChannel {
        MessageChannel::new(Arc::new(ScriptedHost { reply, delay }))
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_times_out() {
        let channel = channel(json!({ "success": true }), Duration::from_secs(30));
        let err = channel
            .send(json!({ "type": "x" }), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_secs(5)));
        assert!(!channel.ping(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn request_unwraps_reply_data() {
        let channel = channel(json!({ "success": true, "data": "session-1" }), Duration::ZERO);
        let data = channel
            .request(json!({ "type": "createSession" }), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(data, json!("session-1"));
    }

    #[tokio::test]
    async fn non_retryable_reply_is_a_rejection() {
        let channel = channel(
            json!({ "success": false, "error": "userId is required", "retryable": false }),
            Duration::ZERO,
        );
        let err = channel
            .request(json!({ "type": "createSession" }), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Rejected("userId is required".into()));
    }

    #[tokio::test]
    async fn ping_respects_context_info() {
        let alive = channel(json!({ "success": true }), Duration::ZERO);
        assert!(alive.ping(Duration::from_secs(1)).await);

        let deaf = channel(
            json!({ "success": true, "contextInfo": { "canReceiveMessages": false } }),
            Duration::ZERO,
        );
        assert!(!deaf.ping(Duration::from_secs(1)).await);
    }
}
