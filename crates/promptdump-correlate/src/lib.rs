//! promptdump correlate - turns reassembled TCP byte streams into paired
//! HTTP requests and responses
//!
//! Each connection gets a shared [`ConnectionState`] in the
//! [`SessionRegistry`]. Its two half-streams classify themselves from their
//! first bytes; the request side parses requests into the connection's
//! backlog and the response side pairs each response with the oldest
//! unclaimed request. Results go to a [`Notifier`](promptdump_core::Notifier).
//!
//! [`HttpDumper`] wires capture, reassembly and correlation together.

pub mod direction;
pub mod dumper;
pub mod http;
pub mod key;
pub mod pairing;
pub mod registry;
pub mod state;
pub mod stats;
pub mod stream;

pub use direction::{classify, Direction};
pub use dumper::{DumperError, HttpDumper, StopHandle};
pub use self::http::{Body, BodyFraming, MessageError, MessageLimits, MessageReader, RequestHead, ResponseHead};
pub use key::ConnectionKey;
pub use pairing::PairingError;
pub use registry::SessionRegistry;
pub use state::{ConnectionState, Verdict};
pub use stats::DumperStats;
pub use stream::{HttpStream, HttpStreamFactory};

#[cfg(test)]
pub(crate) mod testutil {
    use parking_lot::Mutex;
    use promptdump_core::{FlowId, Notifier, Request, Response};
    use std::sync::Arc;

    /// What a test needs to know about an emitted response
    #[derive(Debug, Clone)]
    pub struct ResponseRecord {
        pub status: u16,
        pub body: Vec<u8>,
        pub request_id: Option<String>,
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        sessions: Mutex<Vec<(String, FlowId)>>,
        requests: Mutex<Vec<Arc<Request>>>,
        responses: Mutex<Vec<ResponseRecord>>,
    }

    impl RecordingNotifier {
        pub fn sessions(&self) -> Vec<(String, FlowId)> {
            self.sessions.lock().clone()
        }

        pub fn requests(&self) -> Vec<Arc<Request>> {
            self.requests.lock().clone()
        }

        pub fn responses(&self) -> Vec<ResponseRecord> {
            self.responses.lock().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn on_new_session(&self, id: &str, flow: &FlowId) {
            self.sessions.lock().push((id.to_string(), *flow));
        }

        fn on_request(&self, request: &Arc<Request>) {
            self.requests.lock().push(request.clone());
        }

        fn on_response(&self, response: &Response) {
            self.responses.lock().push(ResponseRecord {
                status: response.status.as_u16(),
                body: response.body().to_vec(),
                request_id: response.request_id().map(str::to_string),
            });
        }
    }
}
