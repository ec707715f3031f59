//! Half-stream direction inference

/// What a half-stream carries, decided from its first bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Not enough bytes seen yet
    Undetermined,
    /// Client to server: HTTP requests
    Requests,
    /// Server to client: HTTP responses
    Responses,
    /// Anything else; the connection is ignored
    NotHttp,
}

const RESPONSE_PREFIX: &[u8] = b"HTTP/";

const REQUEST_PREFIXES: [&[u8]; 9] = [
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"CONNECT ",
    b"OPTIONS ",
    b"TRACE ",
    b"PATCH ",
];

/// Classify a half-stream from the bytes seen on it so far.
///
/// Returns [`Direction::Undetermined`] only for an empty input or one that
/// is a strict prefix of a known token, so the caller can wait for more.
pub fn classify(data: &[u8]) -> Direction {
    if data.is_empty() {
        return Direction::Undetermined;
    }
    if data.starts_with(RESPONSE_PREFIX) {
        return Direction::Responses;
    }
    if REQUEST_PREFIXES.iter().any(|p| data.starts_with(p)) {
        return Direction::Requests;
    }

    let could_grow = std::iter::once(RESPONSE_PREFIX)
        .chain(REQUEST_PREFIXES)
        .any(|p| data.len() < p.len() && p.starts_with(data));
    if could_grow {
        Direction::Undetermined
    } else {
        Direction::NotHttp
    }
}
