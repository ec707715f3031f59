//! Half-stream handling
//!
//! The reassembler creates one [`HttpStream`] per directional flow. The
//! stream classifies itself from its first bytes and then feeds a handler
//! task that parses requests or responses out of the byte stream.

use crate::direction::{classify, Direction};
use crate::http::{BodyFraming, MessageError, MessageLimits, MessageReader};
use crate::pairing;
use crate::registry::SessionRegistry;
use crate::state::ConnectionState;
use crate::stats::Counters;
use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use promptdump_core::config::CorrelationSettings;
use promptdump_core::{FlowId, Notifier, Request, Response};
use promptdump_reassembly::{reader_channel, ReaderStream, Reassembly, Stream, StreamFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

struct FactoryInner {
    notifier: Arc<dyn Notifier>,
    registry: SessionRegistry,
    settings: CorrelationSettings,
    counters: Arc<Counters>,
    tasks: Mutex<JoinSet<()>>,
}

/// Creates [`HttpStream`]s and owns their handler tasks
pub struct HttpStreamFactory {
    inner: Arc<FactoryInner>,
}

impl HttpStreamFactory {
    pub(crate) fn new(
        notifier: Arc<dyn Notifier>,
        settings: CorrelationSettings,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                notifier,
                registry: SessionRegistry::new(),
                settings,
                counters,
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Handler tasks not yet reaped
    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Collect finished handler tasks. Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let mut reaped = 0;
        while let Some(result) = tasks.try_join_next() {
            log_join(result);
            reaped += 1;
        }
        reaped
    }

    /// Wait for every handler task to finish
    pub async fn wait_all(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                log_join(result);
            }
        }
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!("Half-stream handler panicked: {}", e);
        }
    }
}

impl StreamFactory for HttpStreamFactory {
    fn new_stream(&self, flow: FlowId) -> Box<dyn Stream> {
        let (state, is_new) = self.inner.registry.register(&flow);
        if is_new {
            Counters::incr(&self.inner.counters.sessions);
            self.inner.notifier.on_new_session(state.id(), &flow);
        }

        Box::new(HttpStream {
            flow,
            state,
            direction: Direction::Undetermined,
            prefix: Vec::new(),
            tx: None,
            shared: self.inner.clone(),
        })
    }
}

/// One directional flow of a connection
pub struct HttpStream {
    flow: FlowId,
    state: Arc<ConnectionState>,
    direction: Direction,
    /// Bytes seen while the direction is still undetermined
    prefix: Vec<u8>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    shared: Arc<FactoryInner>,
}

impl HttpStream {
    /// Classify once enough bytes are in. Returns `false` if the stream
    /// should stop.
    fn determine(&mut self) -> bool {
        self.direction = classify(&self.prefix);
        match self.direction {
            Direction::Undetermined => true,
            Direction::NotHttp => {
                info!("Not HTTP, discarding connection {}", self.state.id());
                if self.state.discard() {
                    Counters::incr(&self.shared.counters.discarded);
                }
                self.complete();
                false
            }
            Direction::Requests | Direction::Responses => {
                if !self.state.keep() {
                    self.complete();
                    return false;
                }
                self.spawn_handler();
                true
            }
        }
    }

    fn spawn_handler(&mut self) {
        let (tx, reader) = reader_channel(self.shared.settings.stream_buffer);
        self.tx = Some(tx);

        let handler = HalfStreamHandler {
            flow: self.flow,
            state: self.state.clone(),
            shared: self.shared.clone(),
            reader: MessageReader::new(reader, MessageLimits::from(&self.shared.settings)),
        };
        let direction = self.direction;
        if direction == Direction::Requests {
            self.state.set_request_side_active(true);
        }

        debug!("{} carries {:?}", self.flow, direction);
        self.shared.tasks.lock().spawn(async move {
            match direction {
                Direction::Requests => handler.read_requests().await,
                _ => handler.read_responses().await,
            }
        });
    }

    /// Signal end of stream to the handler, if any. Idempotent.
    fn complete(&mut self) {
        if self.tx.take().is_some() {
            trace!("Closing half-stream {}", self.flow);
        }
        self.prefix.clear();
    }
}

#[async_trait]
impl Stream for HttpStream {
    async fn reassembled(&mut self, chunks: Vec<Reassembly>) {
        for chunk in chunks {
            if self.state.is_discarded() {
                self.complete();
                return;
            }
            if chunk.bytes.is_empty() {
                continue;
            }
            if chunk.skip > 0 {
                debug!("{} lost {} bytes", self.flow, chunk.skip);
            }

            let data = match self.direction {
                Direction::NotHttp => return,
                Direction::Undetermined => {
                    self.prefix.extend_from_slice(&chunk.bytes);
                    if !self.determine() {
                        return;
                    }
                    if self.direction == Direction::Undetermined {
                        continue;
                    }
                    std::mem::take(&mut self.prefix)
                }
                Direction::Requests | Direction::Responses => chunk.bytes,
            };

            let Some(tx) = &self.tx else {
                return;
            };
            if tx.send(data).await.is_err() {
                // handler is gone; drop the rest of this direction
                self.tx = None;
                return;
            }
        }
    }

    fn reassembly_complete(&mut self) {
        self.complete();
    }
}

/// Parses messages out of one half-stream
struct HalfStreamHandler {
    flow: FlowId,
    state: Arc<ConnectionState>,
    shared: Arc<FactoryInner>,
    reader: MessageReader<ReaderStream>,
}

impl HalfStreamHandler {
    fn pairing_timeout(&self) -> Duration {
        self.shared.settings.pairing_timeout()
    }

    fn end(&self, what: &str, err: &MessageError) {
        if err.is_end_of_stream() {
            trace!("{} on {}: {}", what, self.flow, err);
        } else {
            warn!("{} read failed on {}: {}", what, self.flow, err);
        }
    }

    async fn read_requests(mut self) {
        self.request_loop().await;
        self.state.set_request_side_active(false);
        debug!("Half-stream {} finished", self.flow);
    }

    async fn request_loop(&mut self) {
        loop {
            let head = match self.reader.read_request().await {
                Ok(head) => head,
                Err(e) => return self.end("Request", &e),
            };
            let framing = match BodyFraming::for_request(&head) {
                Ok(framing) => framing,
                Err(e) => return self.end("Request", &e),
            };

            let request = Arc::new(Request::new(
                self.flow,
                head.method,
                head.uri,
                head.version,
                head.headers,
            ));
            self.state.append_request(request.clone());

            let body = match self.reader.read_body(framing).await {
                Ok(body) => body,
                Err(e) => {
                    request.set_body(Vec::new());
                    request.mark_delivered();
                    return self.end("Request body", &e);
                }
            };
            if body.incomplete {
                debug!("Request {} on {} ended early", request.id, self.flow);
            }
            request.set_body(body.bytes);

            if self.state.is_discarded() {
                request.mark_delivered();
                return;
            }
            Counters::incr(&self.shared.counters.requests);
            self.shared.notifier.on_request(&request);
            request.mark_delivered();
        }
    }

    async fn read_responses(mut self) {
        self.response_loop().await;
        debug!("Half-stream {} finished", self.flow);
    }

    async fn response_loop(&mut self) {
        loop {
            match self.reader.peek().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => return self.end("Response", &e),
            }

            let request = pairing::pair_next(&self.state, self.pairing_timeout()).await;
            let method = request.as_ref().map(|r| r.method.clone());

            let head = match self.reader.read_response(method.as_ref()).await {
                Ok(head) => head,
                Err(e) => return self.end("Response", &e),
            };
            let framing = match BodyFraming::for_response(&head, method.as_ref()) {
                Ok(framing) => framing,
                Err(e) => return self.end("Response", &e),
            };
            let switching = head.status == StatusCode::SWITCHING_PROTOCOLS;

            let response = Response::new(
                request,
                self.flow,
                head.status,
                head.reason,
                head.version,
                head.headers,
            );
            let body = match self.reader.read_body(framing).await {
                Ok(body) => body,
                Err(e) => return self.end("Response body", &e),
            };
            response.set_body(body.bytes);

            if self.state.is_discarded() {
                return;
            }
            Counters::incr(&self.shared.counters.responses);
            self.shared.notifier.on_response(&response);

            if switching {
                debug!("{} switched protocols, no longer HTTP", self.flow);
                return;
            }
        }
    }
}
