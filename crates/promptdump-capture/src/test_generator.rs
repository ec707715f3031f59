//! Synthetic traffic generator
//!
//! Produces complete TCP conversations carrying LLM API calls so that the
//! correlation pipeline and the printers can be exercised without a
//! capture device or root privileges.

use crate::PacketStream;
use promptdump_core::{FlowId, TcpFlags, TcpSegment};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

const DEFAULT_MSS: usize = 1460;

/// Builds the segments of one TCP connection, both directions
/// interleaved in the order they would appear on the wire.
pub struct Conversation {
    client: SocketAddr,
    server: SocketAddr,
    client_seq: u32,
    server_seq: u32,
    mss: usize,
    segments: Vec<TcpSegment>,
}

impl Conversation {
    pub fn new(client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            client,
            server,
            client_seq: 1_000,
            server_seq: 5_000,
            mss: DEFAULT_MSS,
            segments: Vec::new(),
        }
    }

    /// Maximum payload per segment
    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss.max(1);
        self
    }

    /// Initial sequence numbers for the client and server sides
    pub fn with_isn(mut self, client: u32, server: u32) -> Self {
        self.client_seq = client;
        self.server_seq = server;
        self
    }

    /// SYN, SYN/ACK, ACK
    pub fn handshake(mut self) -> Self {
        let client_isn = self.client_seq;
        let server_isn = self.server_seq;
        self.push_client(
            client_isn,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            Vec::new(),
        );
        self.push_server(
            server_isn,
            TcpFlags {
                syn: true,
                ack: true,
                ..Default::default()
            },
            Vec::new(),
        );
        self.client_seq = client_isn.wrapping_add(1);
        self.server_seq = server_isn.wrapping_add(1);
        self.push_client(self.client_seq, ack(), Vec::new());
        self
    }

    pub fn client_sends(mut self, data: impl AsRef<[u8]>) -> Self {
        for chunk in data.as_ref().chunks(self.mss) {
            self.push_client(self.client_seq, ack(), chunk.to_vec());
            self.client_seq = self.client_seq.wrapping_add(chunk.len() as u32);
        }
        self
    }

    pub fn server_sends(mut self, data: impl AsRef<[u8]>) -> Self {
        for chunk in data.as_ref().chunks(self.mss) {
            self.push_server(self.server_seq, ack(), chunk.to_vec());
            self.server_seq = self.server_seq.wrapping_add(chunk.len() as u32);
        }
        self
    }

    /// FIN from both sides, client first
    pub fn close(mut self) -> Self {
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        };
        self.push_client(self.client_seq, fin, Vec::new());
        self.client_seq = self.client_seq.wrapping_add(1);
        self.push_server(self.server_seq, fin, Vec::new());
        self.server_seq = self.server_seq.wrapping_add(1);
        self
    }

    /// Flow of the client to server direction
    pub fn client_flow(&self) -> FlowId {
        FlowId::from_addrs(self.client, self.server)
    }

    pub fn into_segments(self) -> Vec<TcpSegment> {
        self.segments
    }

    fn push_client(&mut self, seq: u32, flags: TcpFlags, payload: Vec<u8>) {
        let flow = FlowId::from_addrs(self.client, self.server);
        self.segments.push(TcpSegment::new(flow, seq, flags, payload));
    }

    fn push_server(&mut self, seq: u32, flags: TcpFlags, payload: Vec<u8>) {
        let flow = FlowId::from_addrs(self.server, self.client);
        self.segments.push(TcpSegment::new(flow, seq, flags, payload));
    }
}

fn ack() -> TcpFlags {
    TcpFlags {
        ack: true,
        ..Default::default()
    }
}

/// Configuration for synthetic traffic
#[derive(Debug, Clone)]
pub struct TestGeneratorConfig {
    /// Interval between conversations in milliseconds
    pub interval_ms: u64,

    /// Number of conversations to generate (0 = infinite)
    pub conversation_count: u64,

    /// Send streamed (SSE, chunked) responses instead of plain JSON
    pub streaming: bool,

    /// Interleave a non-HTTP connection every few conversations
    pub generate_noise: bool,

    /// Client address; the port is varied per conversation
    pub client: SocketAddr,

    /// Address of the simulated model server
    pub server: SocketAddr,
}

impl Default for TestGeneratorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            conversation_count: 0,
            streaming: true,
            generate_noise: true,
            client: SocketAddr::from(([127, 0, 0, 1], 52000)),
            server: SocketAddr::from(([127, 0, 0, 1], 11434)),
        }
    }
}

/// Feeds generated conversations into a [`PacketStream`]
pub struct TestGenerator {
    config: TestGeneratorConfig,
    running: Arc<AtomicBool>,
    generated: Arc<AtomicU64>,
}

impl TestGenerator {
    pub fn new() -> Self {
        Self::with_config(TestGeneratorConfig::default())
    }

    pub fn with_config(config: TestGeneratorConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            generated: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the generator task and return the stream it feeds. The stream
    /// ends after `conversation_count` conversations or after [`stop`].
    ///
    /// [`stop`]: TestGenerator::stop
    pub fn start(&self) -> PacketStream {
        let (tx, stream) = PacketStream::channel(256);
        self.running.store(true, Ordering::SeqCst);
        info!("Starting test traffic generator");

        let running = self.running.clone();
        let generated = self.generated.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut cycle = 0u64;

            'outer: while running.load(Ordering::SeqCst) {
                if config.conversation_count > 0 && cycle >= config.conversation_count {
                    break;
                }

                let mut segments = chat_conversation(&config, cycle).into_segments();
                if config.generate_noise && cycle % 3 == 2 {
                    segments.extend(noise_conversation(&config, cycle).into_segments());
                }

                for segment in segments {
                    if tx.send(Ok(segment)).await.is_err() {
                        break 'outer;
                    }
                }
                generated.fetch_add(1, Ordering::Relaxed);

                cycle += 1;
                tokio::time::sleep(tokio::time::Duration::from_millis(config.interval_ms)).await;
            }

            running.store(false, Ordering::SeqCst);
            info!(
                "Test generator stopped after {} conversations",
                generated.load(Ordering::Relaxed)
            );
        });

        stream
    }

    pub fn stop(&self) {
        info!("Stopping test generator...");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn conversations_generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }
}

impl Default for TestGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn client_addr(config: &TestGeneratorConfig, cycle: u64, offset: u16) -> SocketAddr {
    let port = config
        .client
        .port()
        .wrapping_add(((cycle % 8000) as u16).wrapping_mul(2))
        .wrapping_add(offset);
    SocketAddr::new(config.client.ip(), port)
}

/// One keep-alive connection carrying a chat completion call. Every
/// other cycle the server ISN sits just below the wrap point.
fn chat_conversation(config: &TestGeneratorConfig, cycle: u64) -> Conversation {
    let server_isn = if cycle % 2 == 1 {
        u32::MAX - 100
    } else {
        (cycle as u32).wrapping_mul(7919).wrapping_add(5_000)
    };

    let conversation = Conversation::new(client_addr(config, cycle, 0), config.server)
        .with_isn((cycle as u32).wrapping_mul(104_729).wrapping_add(1_000), server_isn)
        .handshake();

    let (request, response) = if cycle % 3 == 1 {
        (anthropic_request(config), anthropic_response(config.streaming))
    } else {
        (openai_request(config), openai_response(config.streaming))
    };

    conversation
        .client_sends(request)
        .server_sends(response)
        .close()
}

/// A TLS-looking connection that must be ignored
fn noise_conversation(config: &TestGeneratorConfig, cycle: u64) -> Conversation {
    let server = SocketAddr::new(config.server.ip(), 443);
    Conversation::new(client_addr(config, cycle, 1), server)
        .handshake()
        .client_sends(b"\x16\x03\x01\x00\x2e\x01\x00\x00\x2a\x03\x03")
        .server_sends(b"\x16\x03\x03\x00\x31\x02\x00\x00\x2d\x03\x03")
        .close()
}

fn host(config: &TestGeneratorConfig) -> String {
    format!("{}", config.server)
}

fn openai_request(config: &TestGeneratorConfig) -> String {
    let body = serde_json::json!({
        "model": "qwen2.5-coder:7b",
        "messages": [
            {"role": "system", "content": "You are a helpful coding assistant."},
            {"role": "user", "content": "Fix the bug in main.rs that causes a panic on line 42"}
        ],
        "tools": [
            {
                "type": "function",
                "function": {
                    "name": "read_file",
                    "description": "Read a file from the filesystem",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string"}
                        }
                    }
                }
            }
        ],
        "stream": config.streaming
    })
    .to_string();

    format!(
        "POST /v1/chat/completions HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: promptdump-demo\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        host(config),
        body.len(),
        body
    )
}

fn openai_response(streaming: bool) -> String {
    if !streaming {
        let body = serde_json::json!({
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "model": "qwen2.5-coder:7b",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "<think>Line 42 unwraps a None.</think>I'll read the file first."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 150, "completion_tokens": 25, "total_tokens": 175}
        })
        .to_string();
        return format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        );
    }

    let events = [
        r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","model":"qwen2.5-coder:7b","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","model":"qwen2.5-coder:7b","choices":[{"index":0,"delta":{"content":"I'll"},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","model":"qwen2.5-coder:7b","choices":[{"index":0,"delta":{"content":" read"},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","model":"qwen2.5-coder:7b","choices":[{"index":0,"delta":{"content":" the file"},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","model":"qwen2.5-coder:7b","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc123","type":"function","function":{"name":"read_file","arguments":"{\"path\":\"/src/main.rs\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        "data: [DONE]",
    ];
    let events: Vec<String> = events.iter().map(|e| format!("{}\n\n", e)).collect();

    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         {}",
        chunked(&events)
    )
}

fn anthropic_request(config: &TestGeneratorConfig) -> String {
    let body = serde_json::json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 1024,
        "system": "Answer briefly.",
        "messages": [
            {"role": "user", "content": [{"type": "text", "text": "What does SO_REUSEPORT do?"}]}
        ],
        "stream": config.streaming
    })
    .to_string();

    format!(
        "POST /v1/messages HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: application/json\r\n\
         anthropic-version: 2023-06-01\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        host(config),
        body.len(),
        body
    )
}

fn anthropic_response(streaming: bool) -> String {
    if !streaming {
        let body = serde_json::json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "It lets several sockets bind the same port."}],
            "stop_reason": "end_turn"
        })
        .to_string();
        return format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        );
    }

    let events = [
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_01\",\"role\":\"assistant\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"It lets several sockets\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" bind the same port.\"}}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    ];
    let events: Vec<String> = events.iter().map(|e| e.to_string()).collect();

    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         {}",
        chunked(&events)
    )
}

/// Encode parts as one HTTP chunk each, plus the terminating chunk
fn chunked(parts: &[String]) -> String {
    let mut out = String::new();
    for part in parts {
        out.push_str(&format!("{:x}\r\n{}\r\n", part.len(), part));
    }
    out.push_str("0\r\n\r\n");
    out
}
