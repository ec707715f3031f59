//! Terminal printers for paired traffic
//!
//! Both printers render a whole block into a string and write it under a
//! lock, so blocks from concurrently running half-streams never interleave.

use crossterm::style::Stylize;
use dashmap::DashMap;
use http::header::HOST;
use http::HeaderMap;
use parking_lot::Mutex;
use promptdump_core::{FlowId, Notifier, Request, Response};
use promptdump_decode::{parse_request, response_text, split_think, DecodeError, LlmRequest};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RULE_WIDTH: usize = 58;

/// LLM requests with no response after this long are forgotten
const STALE_REQUEST: Duration = Duration::from_secs(600);

fn emit(lock: &Mutex<()>, block: &str) {
    let _guard = lock.lock();
    let mut out = std::io::stdout().lock();
    if let Err(e) = out.write_all(block.as_bytes()).and_then(|_| out.flush()) {
        warn!("Failed to write to stdout: {}", e);
    }
}

fn push_line(out: &mut String, line: impl AsRef<str>) {
    out.push_str(line.as_ref());
    out.push('\n');
}

fn push_headers(out: &mut String, indent: &str, headers: &HeaderMap) {
    for (name, value) in headers {
        if name == HOST {
            continue;
        }
        push_line(
            out,
            format!("{}{}: {}", indent, name, String::from_utf8_lossy(value.as_bytes())),
        );
    }
}

/// Prints every request and response with headers and body
#[derive(Default)]
pub struct HttpPrinter {
    print_lock: Mutex<()>,
}

impl HttpPrinter {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn render_request(request: &Request) -> String {
    let mut out = String::new();
    push_line(&mut out, ">".repeat(RULE_WIDTH));
    push_line(
        &mut out,
        format!(
            ">>> HTTP Request (ID: {}): {} -> {}",
            request.id,
            request.flow.src(),
            request.flow.dst()
        ),
    );
    push_line(
        &mut out,
        format!("{} {} {:?}", request.method, request.uri, request.version),
    );
    if let Some(host) = request.host() {
        push_line(&mut out, format!("Host: {}", host));
    }
    push_headers(&mut out, "", &request.headers);
    if !request.body().is_empty() {
        push_line(&mut out, format!("\n{}", String::from_utf8_lossy(request.body())));
    }
    push_line(&mut out, ">".repeat(RULE_WIDTH));
    out
}

pub fn render_response(response: &Response) -> String {
    let mut out = String::new();
    push_line(&mut out, "<".repeat(RULE_WIDTH));
    push_line(
        &mut out,
        format!(
            "<<< HTTP Response (ID: {}): {} <- {}",
            response.request_id().unwrap_or_default(),
            response.flow.dst(),
            response.flow.src()
        ),
    );
    push_line(
        &mut out,
        format!(
            "    {:?} {} {}",
            response.version,
            response.status.as_u16(),
            response.reason
        ),
    );
    push_headers(&mut out, "    ", &response.headers);
    if !response.body().is_empty() {
        push_line(&mut out, format!("\n{}", String::from_utf8_lossy(response.body())));
    }
    push_line(&mut out, "<".repeat(RULE_WIDTH));
    out
}

impl Notifier for HttpPrinter {
    fn on_new_session(&self, id: &str, _flow: &FlowId) {
        emit(&self.print_lock, &format!("New TCP session: {}\n", id));
    }

    fn on_request(&self, request: &Arc<Request>) {
        emit(&self.print_lock, &render_request(request));
    }

    fn on_response(&self, response: &Response) {
        emit(&self.print_lock, &render_response(response));
    }
}

/// Prints only LLM traffic: the conversation sent in each request and the
/// text generated in its response
#[derive(Default)]
pub struct PromptPrinter {
    llm_requests: DashMap<String, Instant>,
    print_lock: Mutex<()>,
}

impl PromptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a response to `request_id` is still expected
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.llm_requests.contains_key(request_id)
    }

    fn remember(&self, request_id: &str) {
        let now = Instant::now();
        self.llm_requests
            .retain(|_, seen| now.duration_since(*seen) < STALE_REQUEST);
        self.llm_requests.insert(request_id.to_string(), now);
    }
}

pub fn render_prompt(request: &Request, llm: &LlmRequest) -> String {
    let mut out = String::new();
    push_line(&mut out, ">".repeat(RULE_WIDTH).yellow().to_string());
    push_line(&mut out, format!("New request: {}", request.uri));

    if !llm.model.is_empty() {
        push_line(&mut out, format!("Model: {}", llm.model));
        if let Some(system) = llm.system.as_ref().map(|s| s.text()) {
            if !system.is_empty() {
                push_line(&mut out, format!("System: {}", system));
            }
        }
        if let Some(prompt) = llm.prompt.as_deref().filter(|p| !p.is_empty()) {
            push_line(&mut out, format!("Prompt: {}", prompt));
        }
        for message in &llm.messages {
            let text = message.text();
            match message.role.as_str() {
                "system" => push_line(&mut out, text.red().to_string()),
                "user" => push_line(&mut out, text.blue().to_string()),
                "tool" => push_line(&mut out, format!("Tool response: {}", text)),
                "assistant" => {
                    out.push_str("Assistant: ");
                    if !text.is_empty() {
                        push_line(&mut out, text);
                    }
                    if message.has_tool_calls() {
                        push_line(&mut out, message.tool_calls_summary());
                    }
                }
                _ => push_line(&mut out, format!("Message: {}", text)),
            }
        }
    }

    push_line(&mut out, ">".repeat(RULE_WIDTH).yellow().to_string());
    out
}

/// `None` when the body cannot be decoded as a generation
pub fn render_completion(request: &Request, response: &Response) -> Option<String> {
    let mut out = String::new();
    push_line(&mut out, "<".repeat(RULE_WIDTH).green().to_string());
    push_line(&mut out, format!("New response: {}", request.uri));

    match response_text(response.content_type(), response.body()) {
        Ok(text) => {
            let (think, answer) = split_think(&text);
            if let Some(think) = think {
                push_line(&mut out, think.cyan().to_string());
            }
            push_line(&mut out, answer.blue().to_string());
        }
        Err(DecodeError::UnsupportedContentType(ct)) => {
            push_line(&mut out, format!("unknown content type: {}", ct));
        }
        Err(e) => {
            debug!("Response to {} not decoded: {}", request.id, e);
            return None;
        }
    }

    push_line(&mut out, "<".repeat(RULE_WIDTH).green().to_string());
    Some(out)
}

impl Notifier for PromptPrinter {
    fn on_new_session(&self, id: &str, _flow: &FlowId) {
        debug!("New TCP session: {}", id);
    }

    fn on_request(&self, request: &Arc<Request>) {
        let Some(llm) = parse_request(request) else {
            return;
        };
        self.remember(&request.id);
        emit(&self.print_lock, &render_prompt(request, &llm));
    }

    fn on_response(&self, response: &Response) {
        let Some(request) = &response.request else {
            return;
        };
        if self.llm_requests.remove(&request.id).is_none() {
            return;
        }
        if let Some(block) = render_completion(request, response) {
            emit(&self.print_lock, &block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use http::{HeaderValue, Method, StatusCode, Version};

    fn flow() -> FlowId {
        FlowId::from_addrs(
            "127.0.0.1:52000".parse().unwrap(),
            "127.0.0.1:11434".parse().unwrap(),
        )
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    fn chat_request(body: &str) -> Arc<Request> {
        let mut headers = json_headers();
        headers.insert(HOST, HeaderValue::from_static("localhost:11434"));
        let request = Arc::new(Request::new(
            flow(),
            Method::POST,
            "/api/chat".parse().unwrap(),
            Version::HTTP_11,
            headers,
        ));
        request.set_body(body.as_bytes().to_vec());
        request
    }

    fn response_to(request: Option<Arc<Request>>, content_type: &str, body: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        let response = Response::new(
            request,
            flow().reverse(),
            StatusCode::OK,
            "OK".to_string(),
            Version::HTTP_11,
            headers,
        );
        response.set_body(body.as_bytes().to_vec());
        response
    }

    #[test]
    fn test_render_request_block() {
        let request = chat_request(r#"{"model":"llama3"}"#);
        let block = render_request(&request);

        assert!(block.contains(&format!(
            ">>> HTTP Request (ID: {}): 127.0.0.1:52000 -> 127.0.0.1:11434",
            request.id
        )));
        assert!(block.contains("POST /api/chat HTTP/1.1\n"));
        assert!(block.contains("Host: localhost:11434\n"));
        assert!(block.contains("content-type: application/json\n"));
        assert!(block.ends_with(&format!("\n{}\n", ">".repeat(RULE_WIDTH))));
    }

    #[test]
    fn test_render_unpaired_response() {
        let response = response_to(None, "text/plain", "hello");
        let block = render_response(&response);
        assert!(block.contains("<<< HTTP Response (ID: ): 127.0.0.1:52000 <- 127.0.0.1:11434"));
        assert!(block.contains("    HTTP/1.1 200 OK\n"));
        assert!(block.contains("\nhello\n"));
    }

    #[test]
    fn test_render_prompt_roles() {
        let request = chat_request(
            r#"{"model":"llama3","messages":[
                {"role":"system","content":"Be terse."},
                {"role":"user","content":"List files"},
                {"role":"assistant","content":"","tool_calls":[{"function":{"name":"ls","arguments":{"dir":"."}}}]},
                {"role":"tool","content":"a.txt"}
            ]}"#,
        );
        let llm = parse_request(&request).unwrap();
        let block = render_prompt(&request, &llm);

        assert!(block.contains("New request: /api/chat\n"));
        assert!(block.contains("Model: llama3\n"));
        assert!(block.contains("Be terse."));
        assert!(block.contains("List files"));
        assert!(block.contains("Assistant: Tool call: ls({\"dir\":\".\"})\n"));
        assert!(block.contains("Tool response: a.txt\n"));
    }

    #[test]
    fn test_render_completion_splits_reasoning() {
        let request = chat_request(r#"{"model":"llama3"}"#);
        let response = response_to(
            Some(request.clone()),
            "application/x-ndjson",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"<think>pondering\"}}\n\
             {\"message\":{\"role\":\"assistant\",\"content\":\"</think>Done.\"}}\n",
        );
        let block = render_completion(&request, &response).unwrap();
        assert!(block.contains("<think>pondering</think>"));
        assert!(block.contains("Done."));

        let html = response_to(Some(request.clone()), "text/html", "<html>");
        let block = render_completion(&request, &html).unwrap();
        assert!(block.contains("unknown content type: text/html\n"));

        let broken = response_to(Some(request.clone()), "application/json", "{");
        assert!(render_completion(&request, &broken).is_none());
    }

    #[test]
    fn test_prompt_printer_tracks_llm_requests() {
        let printer = PromptPrinter::new();

        let llm = chat_request(r#"{"model":"llama3","messages":[]}"#);
        printer.on_request(&llm);
        assert!(printer.is_pending(&llm.id));

        let other = Arc::new(Request::new(
            flow(),
            Method::GET,
            "/api/tags".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        ));
        other.set_body(Vec::new());
        printer.on_request(&other);
        assert!(!printer.is_pending(&other.id));

        printer.on_response(&response_to(Some(llm.clone()), "application/json", "{}"));
        assert!(!printer.is_pending(&llm.id));
    }
}
