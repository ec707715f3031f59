//! FIFO request/response pairing

use crate::state::ConnectionState;
use promptdump_core::Request;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Pairing error type
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("body of request {request_id} not attached after {waited:?}")]
    BodyTimeout { request_id: String, waited: Duration },

    #[error("request {request_id} not delivered to the observer after {waited:?}")]
    DeliveryTimeout { request_id: String, waited: Duration },
}

/// Wait until `request`'s body is attached, at most `timeout`
pub async fn await_body(request: &Request, timeout: Duration) -> Result<(), PairingError> {
    if request.wait_for_body(timeout).await {
        Ok(())
    } else {
        Err(PairingError::BodyTimeout {
            request_id: request.id.clone(),
            waited: timeout,
        })
    }
}

/// Wait until `request` has been handed to the observer, at most `timeout`
pub async fn await_delivery(request: &Request, timeout: Duration) -> Result<(), PairingError> {
    if request.wait_for_delivery(timeout).await {
        Ok(())
    } else {
        Err(PairingError::DeliveryTimeout {
            request_id: request.id.clone(),
            waited: timeout,
        })
    }
}

/// Find the request the next response on this connection answers.
///
/// Claims the request at the cursor. When the backlog is empty but the
/// request side is still being parsed, waits for it to catch up. Every
/// wait is bounded by `timeout`; on expiry the response goes unmatched or
/// is paired with whatever body state the request has. A claimed request
/// is returned only once the observer has seen it, so `on_request` always
/// precedes the matching `on_response`.
pub async fn pair_next(state: &ConnectionState, timeout: Duration) -> Option<Arc<Request>> {
    let deadline = Instant::now() + timeout;

    let request = loop {
        let changed = state.changed().notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if let Some(request) = state.claim_next_request() {
            break request;
        }
        if !state.request_side_active() || state.is_discarded() {
            debug!("No request to pair on {}", state.id());
            return None;
        }
        if tokio::time::timeout_at(deadline, changed).await.is_err() {
            debug!("No request arrived on {} within {:?}", state.id(), timeout);
            return None;
        }
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    if let Err(e) = await_body(&request, remaining).await {
        debug!("Pairing on {}: {}", state.id(), e);
        return Some(request);
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    if let Err(e) = await_delivery(&request, remaining).await {
        debug!("Pairing on {}: {}", state.id(), e);
    }
    Some(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ConnectionKey;
    use http::{HeaderMap, Method, Version};
    use promptdump_core::FlowId;

    fn flow() -> FlowId {
        FlowId::from_addrs(
            "127.0.0.1:52000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        )
    }

    fn request() -> Arc<Request> {
        Arc::new(Request::new(
            flow(),
            Method::POST,
            "/v1/chat/completions".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        ))
    }

    fn state() -> Arc<ConnectionState> {
        Arc::new(ConnectionState::new(ConnectionKey::new(&flow())))
    }

    #[tokio::test]
    async fn test_unmatched_when_no_request_side() {
        let state = state();
        let started = std::time::Instant::now();
        assert!(pair_next(&state, Duration::from_secs(5)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_pairs_with_finalized_request() {
        let state = state();
        let req = request();
        req.set_body(b"{}".to_vec());
        req.mark_delivered();
        state.append_request(req.clone());

        let paired = pair_next(&state, Duration::from_secs(1)).await.unwrap();
        assert!(Arc::ptr_eq(&paired, &req));
        assert_eq!(state.claimed(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_request_side() {
        let state = state();
        state.set_request_side_active(true);

        let writer = state.clone();
        let req = request();
        let appended = req.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append_request(appended.clone());
            tokio::time::sleep(Duration::from_millis(20)).await;
            appended.set_body(b"done".to_vec());
            appended.mark_delivered();
        });

        let paired = pair_next(&state, Duration::from_secs(5)).await.unwrap();
        assert!(Arc::ptr_eq(&paired, &req));
        assert_eq!(paired.body(), b"done");
    }

    #[tokio::test]
    async fn test_holds_response_until_request_delivered() {
        let state = state();
        let req = request();
        req.set_body(b"{}".to_vec());
        state.append_request(req.clone());

        let observer = req.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            observer.mark_delivered();
        });

        let paired = pair_next(&state, Duration::from_secs(5)).await.unwrap();
        assert!(Arc::ptr_eq(&paired, &req));
        assert!(paired.is_delivered());

        let late = request();
        late.set_body(Vec::new());
        let err = await_delivery(&late, Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, PairingError::DeliveryTimeout { .. }));
    }

    #[tokio::test]
    async fn test_request_side_exit_stops_waiting() {
        let state = state();
        state.set_request_side_active(true);

        let writer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set_request_side_active(false);
        });

        let started = std::time::Instant::now();
        assert!(pair_next(&state, Duration::from_secs(5)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_body_timeout_still_pairs() {
        let state = state();
        let req = request();
        state.append_request(req.clone());

        let paired = pair_next(&state, Duration::from_millis(30)).await.unwrap();
        assert!(Arc::ptr_eq(&paired, &req));
        assert!(!paired.is_body_finalized());

        let err = await_body(&req, Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, PairingError::BodyTimeout { .. }));
    }
}
