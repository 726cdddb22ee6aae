use std::collections::HashMap;
use std::sync::Arc;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::directory::{ServiceDirectory, ServiceRecord};

const HTTP_METHOD: &str = "GET";
const HTTP_VERSION: &str = "HTTP/1.1";
const BAD_REQUEST: &str = "400 Bad Request";
const NOT_FOUND: &str = "404 Not Found";
const METHOD_NOT_ALLOWED: &str = "405 Method Not Allowed";
const NOT_IMPLEMENTED: &str = "501 Not Implemented";
const WEBSOCKET_VERSION: &str = "13";
const MAGIC_HANDSHAKE_STRING: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Extension every terminal path segment must carry to name a service.
pub const SERVICE_EXTENSION: &str = ".ws";
/// Service a trailing-slash request resolves to.
pub const SERVICE_INDEX_NAME: &str = "index.ws";

/// What the listener does with a freshly read request: write `response`, then
/// either drop the socket (`close`) or admit it to the resolved service.
pub struct HandshakeOutcome {
    pub response: String,
    pub close: bool,
    pub service: Option<Arc<ServiceRecord>>,
}

fn reject(status: &str) -> HandshakeOutcome {
    HandshakeOutcome {
        response: format!("{HTTP_VERSION} {status}\r\n\r\n"),
        close: true,
        service: None,
    }
}

/// Maps a request path onto a directory location.
///
/// The path splits on `/`, a leading empty segment is dropped, a trailing empty
/// segment becomes the index service, and a terminal segment without the service
/// extension gets it appended.
pub fn service_location(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = path.split('/').map(str::to_owned).collect();
    if segments.first().is_some_and(|s| s.is_empty()) {
        segments.remove(0);
    }
    if let Some(last) = segments.last_mut() {
        if last.is_empty() {
            *last = SERVICE_INDEX_NAME.to_owned();
        } else if !last.ends_with(SERVICE_EXTENSION) {
            last.push_str(SERVICE_EXTENSION);
        }
    }
    segments
}

/// Processes an upgrade request and produces the handshake for it.
///
/// Parsing is strict: exactly `GET <path> HTTP/1.1`, header keys matched
/// case-sensitively as written on the wire, and only version 13 accepted. The
/// service lookup may lazily spawn a worker; a request rejected after that point
/// leaves the worker running but never notified.
pub fn process_request(request: &str, directory: &ServiceDirectory) -> HandshakeOutcome {
    let lines: Vec<&str> = request.split("\r\n").collect();
    let heading: Vec<&str> = lines[0].split_whitespace().collect();
    if heading.len() != 3 {
        return reject(BAD_REQUEST);
    }
    if heading[0] != HTTP_METHOD {
        return reject(METHOD_NOT_ALLOWED);
    }
    if heading[2] != HTTP_VERSION {
        return reject(BAD_REQUEST);
    }

    let location = service_location(heading[1]);
    let Some(service) = directory.lookup(&location) else {
        return reject(NOT_FOUND);
    };

    let mut headers: HashMap<&str, &str> = HashMap::new();
    for line in &lines[1..] {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim(), value.trim());
        }
    }
    let (Some(upgrade), Some(version), Some(key)) = (
        headers.get("Upgrade"),
        headers.get("Sec-WebSocket-Version"),
        headers.get("Sec-WebSocket-Key"),
    ) else {
        return reject(BAD_REQUEST);
    };
    if *upgrade != "websocket" {
        return reject(BAD_REQUEST);
    }
    if *version != WEBSOCKET_VERSION {
        return reject(NOT_IMPLEMENTED);
    }

    let accept = generate_websocket_accept_value(key);
    let response = format!(
        "{HTTP_VERSION} 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept.trim_end()
    );
    HandshakeOutcome {
        response,
        close: false,
        service: Some(service),
    }
}

fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(MAGIC_HANDSHAKE_STRING.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}
