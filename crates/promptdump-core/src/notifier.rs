//! Observer trait for paired HTTP traffic

use crate::flow::FlowId;
use crate::message::{Request, Response};
use std::sync::Arc;

/// Receives sessions and messages as the correlation engine produces them.
///
/// Callbacks run on the half-stream task that produced the message, so
/// implementations must not block for long. Requests and responses of
/// different connections may arrive concurrently.
pub trait Notifier: Send + Sync {
    /// A new TCP connection was seen. Fired once per connection.
    fn on_new_session(&self, id: &str, flow: &FlowId);

    /// A request was parsed and its body attached
    fn on_request(&self, request: &Arc<Request>);

    /// A response was parsed and its body attached. `response.request`
    /// is `None` when no request was available to pair with.
    fn on_response(&self, response: &Response);
}
