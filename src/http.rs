//! Minimal HTTP/1.0+1.1 server for the daemon's introspection pages.
//!
//! Requests are parsed straight out of the stream session's inbound buffer;
//! site handlers are looked up by exact match, longest directory prefix, or
//! tolerant trailing slash. Every response closes the connection.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info};

use crate::acl::Acl;
use crate::build_data;
use crate::clock;
use crate::net::stream::{
    ManagedStreamSocket, Session, SessionState, StreamConfig, StreamError, StreamSocketConfig,
};
use crate::sched::Scheduler;

pub const MAX_URI_LENGTH: usize = 256;
pub const MAX_HEADERS: usize = 16;
pub const MAX_PARAMS: usize = 8;

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_INPUT: usize = 65536;
const DEFAULT_MAX_SESSIONS: usize = 3;

const CONTENT_TYPE_HTML: &str = "text/html";

/// Status codes used by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTooLarge,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::BadRequest => 400,
            HttpStatus::Unauthorized => 401,
            HttpStatus::Forbidden => 403,
            HttpStatus::NotFound => 404,
            HttpStatus::RequestTooLarge => 413,
            HttpStatus::InternalServerError => 500,
            HttpStatus::NotImplemented => 501,
            HttpStatus::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HttpStatus::Ok => "OK",
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::Unauthorized => "Unauthorized",
            HttpStatus::Forbidden => "Forbidden",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::RequestTooLarge => "Request Entity Too Large",
            HttpStatus::InternalServerError => "Internal Server Error",
            HttpStatus::NotImplemented => "Not Implemented",
            HttpStatus::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Parsed view of one request, handed to content handlers.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    /// Response content type chosen by the handler; `text/html` if unset.
    pub content_type: Option<String>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Query/form parameter lookup.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Content generator; the returned status becomes the HTTP status.
pub type ContentHandler = Rc<dyn Fn(&mut HttpRequest, &mut Vec<u8>) -> HttpStatus>;

pub enum HttpContent {
    Static(Vec<u8>),
    Generated(ContentHandler),
}

/// A site handler. `site` must start with `/`; a trailing `/` marks a
/// directory handler that also serves everything below it.
pub struct HttpHandler {
    pub site: String,
    pub acl: Option<Acl>,
    /// Accepted base64 `user:password` tokens for basic auth; empty means no
    /// authentication required.
    pub auth: Vec<String>,
    pub content: HttpContent,
    directory: bool,
}

impl HttpHandler {
    pub fn generated(site: &str, handler: ContentHandler) -> HttpHandler {
        assert!(site.starts_with('/'));
        HttpHandler {
            site: site.to_string(),
            acl: None,
            auth: Vec::new(),
            content: HttpContent::Generated(handler),
            directory: site.ends_with('/'),
        }
    }

    pub fn fixed(site: &str, content: Vec<u8>) -> HttpHandler {
        assert!(site.starts_with('/'));
        HttpHandler {
            site: site.to_string(),
            acl: None,
            auth: Vec::new(),
            content: HttpContent::Static(content),
            directory: site.ends_with('/'),
        }
    }
}

struct HttpInner {
    sites: BTreeMap<String, HttpHandler>,
    managed: Option<ManagedStreamSocket>,
}

/// Shared handle to the http subsystem.
#[derive(Clone)]
pub struct HttpServer {
    inner: Rc<RefCell<HttpInner>>,
}

impl HttpServer {
    pub fn new(sched: &Scheduler) -> HttpServer {
        let inner = Rc::new(RefCell::new(HttpInner {
            sites: BTreeMap::new(),
            managed: None,
        }));
        let server = HttpServer { inner };

        let config = StreamConfig {
            session_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_input: DEFAULT_MAX_INPUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            send_first: false,
            init: None,
            cleanup: None,
            receive: {
                let weak = Rc::downgrade(&server.inner);
                Some(Rc::new(move |session: &mut Session| {
                    match weak.upgrade() {
                        Some(inner) => HttpServer { inner }.receive_data(session),
                        None => SessionState::Cleanup,
                    }
                }))
            },
            create_error: Some(Rc::new(|session: &mut Session, error: StreamError| {
                let status = match error {
                    StreamError::Forbidden => HttpStatus::Forbidden,
                    StreamError::RequestTooLarge => HttpStatus::RequestTooLarge,
                    StreamError::ServiceUnavailable => HttpStatus::ServiceUnavailable,
                };
                send_error(session, status);
            })),
        };
        server.inner.borrow_mut().managed = Some(ManagedStreamSocket::new(sched, config));
        server
    }

    pub fn apply(&self, config: &StreamSocketConfig) -> std::io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.managed.as_mut() {
            Some(managed) => managed.apply(config),
            None => Ok(()),
        }
    }

    pub fn listener_v4(&self) -> Option<crate::net::stream::StreamListener> {
        self.inner
            .borrow()
            .managed
            .as_ref()
            .and_then(|m| m.listener_v4().cloned())
    }

    pub fn listener_v6(&self) -> Option<crate::net::stream::StreamListener> {
        self.inner
            .borrow()
            .managed
            .as_ref()
            .and_then(|m| m.listener_v6().cloned())
    }

    /// Register a site handler.
    pub fn add_handler(&self, handler: HttpHandler) -> bool {
        let key = handler.site.to_ascii_lowercase();
        let mut inner = self.inner.borrow_mut();
        if inner.sites.contains_key(&key) {
            return false;
        }
        inner.sites.insert(key, handler);
        true
    }

    pub fn remove_handler(&self, site: &str) {
        self.inner
            .borrow_mut()
            .sites
            .remove(&site.to_ascii_lowercase());
    }

    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(mut managed) = inner.managed.take() {
            drop(inner);
            managed.close();
        }
    }

    fn receive_data(&self, session: &mut Session) -> SessionState {
        let Some(header_end) = find_header_end(&session.inbuf) else {
            // Still waiting for the end of the header.
            return SessionState::Active;
        };

        let head = String::from_utf8_lossy(&session.inbuf[..header_end]).into_owned();
        let parsed = match parse_request_head(&head) {
            Ok(parsed) => parsed,
            Err(()) => {
                info!("malformed HTTP header");
                send_error(session, HttpStatus::BadRequest);
                return SessionState::SendAndQuit;
            }
        };

        if parsed.http_version != "HTTP/1.0" && parsed.http_version != "HTTP/1.1" {
            info!("unknown HTTP version '{}'", parsed.http_version);
            send_error(session, HttpStatus::BadRequest);
            return SessionState::SendAndQuit;
        }
        if parsed.uri.len() > MAX_URI_LENGTH {
            info!("too long URI in HTTP header");
            send_error(session, HttpStatus::BadRequest);
            return SessionState::SendAndQuit;
        }

        let mut request = HttpRequest {
            method: parsed.method,
            uri: String::new(),
            http_version: parsed.http_version,
            headers: parsed.headers,
            params: Vec::new(),
            content_type: None,
        };

        if request.method == "POST" {
            let Some(length) = request
                .header("Content-Length")
                .and_then(|v| v.trim().parse::<usize>().ok())
            else {
                info!("POST request without content-length");
                send_error(session, HttpStatus::BadRequest);
                return SessionState::SendAndQuit;
            };
            let body = &session.inbuf[header_end..];
            if body.len() < length {
                // Body not complete yet.
                return SessionState::Active;
            }
            let body = String::from_utf8_lossy(&body[..length]).into_owned();
            parse_query_string(&body, &mut request.params);
        }

        // Strip the fragment, decode, split off the query string.
        let mut uri = parsed.uri;
        if let Some(pos) = uri.find('#') {
            uri.truncate(pos);
        }
        let mut uri = decode_uri(&uri);
        if request.method == "GET" {
            if let Some((path, query)) = uri.split_once('?') {
                parse_query_string(query, &mut request.params);
                uri = path.to_string();
            }
        } else if request.method != "POST" {
            info!("HTTP method not implemented: '{}'", request.method);
            send_error(session, HttpStatus::NotImplemented);
            return SessionState::SendAndQuit;
        }
        request.uri = uri;

        debug!(
            "incoming HTTP request: {} {} {}",
            request.method, request.uri, request.http_version
        );

        enum Action {
            Fixed(Vec<u8>),
            Generated(ContentHandler),
            Refuse(HttpStatus),
        }

        let action = {
            let inner = self.inner.borrow();
            match lookup_site(&inner.sites, &request.uri) {
                None => {
                    debug!("no HTTP handler for site: {}", request.uri);
                    Action::Refuse(HttpStatus::NotFound)
                }
                Some(key) => {
                    let handler = &inner.sites[&key];
                    let acl_ok = handler
                        .acl
                        .as_ref()
                        .map_or(true, |acl| acl.check(&session.peer().ip()));
                    if !acl_ok {
                        info!(
                            "blocked HTTP request from {} because of acl",
                            session.peer()
                        );
                        Action::Refuse(HttpStatus::Forbidden)
                    } else if !handler.auth.is_empty() && !auth_okay(handler, &request) {
                        info!("unauthorized HTTP request from {}", session.peer());
                        Action::Refuse(HttpStatus::Unauthorized)
                    } else {
                        match &handler.content {
                            HttpContent::Static(content) => Action::Fixed(content.clone()),
                            HttpContent::Generated(generate) => {
                                Action::Generated(generate.clone())
                            }
                        }
                    }
                }
            }
        };

        match action {
            Action::Refuse(status) => send_error(session, status),
            Action::Fixed(content) => {
                send_response(session, HttpStatus::Ok, None, &content);
            }
            Action::Generated(generate) => {
                let mut body = Vec::new();
                let status = generate(&mut request, &mut body);
                if status != HttpStatus::Ok {
                    send_error(session, status);
                } else {
                    send_response(
                        session,
                        HttpStatus::Ok,
                        request.content_type.as_deref(),
                        &body,
                    );
                }
            }
        }
        SessionState::SendAndQuit
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("HttpServer")
            .field("sites", &inner.sites.len())
            .finish()
    }
}

/// Check a request against a handler's basic-auth token list. The configured
/// tokens are compared verbatim against the base64 part of the header.
fn auth_okay(handler: &HttpHandler, request: &HttpRequest) -> bool {
    let Some(auth) = request.header("Authorization") else {
        return false;
    };
    let Some(token) = auth.trim().strip_prefix("Basic") else {
        return false;
    };
    let token = token.trim_start();
    handler.auth.iter().any(|accepted| accepted == token)
}

/// Build the response header block and queue header + body.
fn send_response(
    session: &mut Session,
    status: HttpStatus,
    content_type: Option<&str>,
    body: &[u8],
) {
    use std::fmt::Write as _;

    let mut header = String::with_capacity(256);
    let _ = write!(
        header,
        "HTTP/1.0 {} {}\r\n",
        status.code(),
        status.reason()
    );
    let _ = write!(header, "Date: {}\r\n", clock::wallclock_http_date());
    let _ = write!(
        header,
        "Server: {} {} {}\r\n",
        build_data::PROGRAM,
        build_data::VERSION,
        build_data::BUILD_SYSTEM
    );
    header.push_str("Connection: closed\r\n");
    let _ = write!(
        header,
        "Content-type: {}\r\n",
        content_type.unwrap_or(CONTENT_TYPE_HTML)
    );
    if !body.is_empty() {
        let _ = write!(header, "Content-length: {}\r\n", body.len());
    }
    if status == HttpStatus::Unauthorized {
        let _ = write!(
            header,
            "WWW-Authenticate: Basic realm=\"{}\"\r\n",
            build_data::PROGRAM
        );
    }
    // No caching of dynamic pages.
    header.push_str("Cache-Control: no-cache\r\n\r\n");

    session.write(header.as_bytes());
    session.write(body);
}

/// Canned error page plus header.
fn send_error(session: &mut Session, status: HttpStatus) {
    let body = format!(
        "<html><head><title>{} {} http server</title></head>\
         <body><h1>HTTP error {}: {}</h1></body></html>",
        build_data::PROGRAM,
        build_data::VERSION,
        status.code(),
        status.reason()
    );
    send_response(session, status, None, body.as_bytes());
}

/// Find the end of the header block; both `\r\n\r\n` and `\n\n` terminate.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

struct ParsedHead {
    method: String,
    uri: String,
    http_version: String,
    headers: Vec<(String, String)>,
}

/// Parse the request line and up to [`MAX_HEADERS`] header fields.
/// Continuation lines are joined by spaces.
fn parse_request_head(head: &str) -> Result<ParsedHead, ()> {
    let mut lines = head.lines();

    let request_line = lines.next().ok_or(())?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().filter(|s| !s.is_empty()).ok_or(())?;
    let uri = parts.next().filter(|s| !s.is_empty()).ok_or(())?;
    let http_version = parts.next().filter(|s| !s.is_empty()).ok_or(())?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous field value.
            let Some((_, value)) = headers.last_mut() else {
                return Err(());
            };
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }
        if headers.len() >= MAX_HEADERS {
            debug!("too many HTTP header fields");
            return Err(());
        }
        let (name, value) = line.split_once(':').ok_or(())?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ParsedHead {
        method: method.to_string(),
        uri: uri.to_string(),
        http_version: http_version.to_string(),
        headers,
    })
}

/// Parse a query string into up to [`MAX_PARAMS`] name/value pairs.
fn parse_query_string(query: &str, params: &mut Vec<(String, String)>) {
    for pair in query.split('&') {
        if params.len() >= MAX_PARAMS {
            break;
        }
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((name, value)) => params.push((name.to_string(), value.to_string())),
            None => params.push((pair.to_string(), String::new())),
        }
    }
}

/// Percent-decode a URI. Invalid escapes are kept literally.
fn decode_uri(uri: &str) -> String {
    let bytes = uri.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3);
            if let Some(decoded) = hex.and_then(|h| {
                std::str::from_utf8(h)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
            }) {
                out.push(decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Site lookup: exact match, longest directory prefix, then tolerant
/// trailing-slash match. All comparisons are case-insensitive.
fn lookup_site(sites: &BTreeMap<String, HttpHandler>, uri: &str) -> Option<String> {
    let uri = uri.to_ascii_lowercase();

    if sites.contains_key(&uri) {
        return Some(uri);
    }

    let mut best: Option<&str> = None;
    for (site, handler) in sites {
        if handler.directory && uri.starts_with(site.as_str()) {
            if best.map_or(true, |b| site.len() > b.len()) {
                best = Some(site);
            }
        }
    }
    if let Some(site) = best {
        return Some(site.to_string());
    }

    let with_slash = format!("{}/", uri);
    sites.contains_key(&with_slash).then_some(with_slash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_map(sites: &[&str]) -> BTreeMap<String, HttpHandler> {
        let mut map = BTreeMap::new();
        for site in sites {
            let handler = HttpHandler::fixed(site, Vec::new());
            map.insert(site.to_ascii_lowercase(), handler);
        }
        map
    }

    #[test]
    fn header_end_variants() {
        assert_eq!(find_header_end(b"GET / HTTP/1.0\r\n\r\nrest"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.0\n\nrest"), Some(16));
        assert_eq!(find_header_end(b"GET / HTTP/1.0\r\n"), None);
    }

    #[test]
    fn parse_head_with_continuation() {
        let head = "GET /x HTTP/1.1\r\nHost: example\r\nX-Long: one\r\n two\r\n\r\n";
        let parsed = parse_request_head(head).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.uri, "/x");
        assert_eq!(parsed.http_version, "HTTP/1.1");
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(parsed.headers[1], ("X-Long".to_string(), "one two".to_string()));
    }

    #[test]
    fn parse_head_rejects_garbage() {
        assert!(parse_request_head("GET\r\n\r\n").is_err());
        assert!(parse_request_head("").is_err());
        let mut many = String::from("GET / HTTP/1.0\r\n");
        for i in 0..MAX_HEADERS + 1 {
            many.push_str(&format!("H{}: v\r\n", i));
        }
        many.push_str("\r\n");
        assert!(parse_request_head(&many).is_err());
    }

    #[test]
    fn decode_is_left_inverse_of_encoding() {
        // Every printable ASCII character, percent-encoded.
        for b in 0x20u8..0x7f {
            let encoded = format!("%{:02X}", b);
            assert_eq!(decode_uri(&encoded), (b as char).to_string());
            let encoded = format!("%{:02x}", b);
            assert_eq!(decode_uri(&encoded), (b as char).to_string());
        }
        assert_eq!(decode_uri("/a%20b/c"), "/a b/c");
        // Broken escapes stay literal.
        assert_eq!(decode_uri("/a%2"), "/a%2");
        assert_eq!(decode_uri("100%"), "100%");
    }

    #[test]
    fn query_parsing() {
        let mut params = Vec::new();
        parse_query_string("level=info&flag&x=1", &mut params);
        assert_eq!(params[0], ("level".to_string(), "info".to_string()));
        assert_eq!(params[1], ("flag".to_string(), String::new()));
        assert_eq!(params[2], ("x".to_string(), "1".to_string()));

        let mut params = Vec::new();
        let many: String = (0..12).map(|i| format!("k{}=v&", i)).collect();
        parse_query_string(&many, &mut params);
        assert_eq!(params.len(), MAX_PARAMS);
    }

    #[test]
    fn site_lookup_order() {
        let sites = site_map(&["/status", "/logs/", "/logs/archive/"]);

        // exact
        assert_eq!(lookup_site(&sites, "/status").as_deref(), Some("/status"));
        // longest directory prefix
        assert_eq!(
            lookup_site(&sites, "/logs/archive/today").as_deref(),
            Some("/logs/archive/")
        );
        assert_eq!(lookup_site(&sites, "/logs/today").as_deref(), Some("/logs/"));
        // tolerant trailing slash
        assert_eq!(lookup_site(&sites, "/logs").as_deref(), Some("/logs/"));
        // no match
        assert_eq!(lookup_site(&sites, "/nope"), None);
        // case-insensitive
        assert_eq!(lookup_site(&sites, "/STATUS").as_deref(), Some("/status"));
    }

    #[test]
    fn auth_token_must_match_verbatim() {
        let mut handler = HttpHandler::fixed("/secure", Vec::new());
        handler.auth.push("dXNlcjpwYXNz".to_string());

        let mut request = HttpRequest::default();
        request
            .headers
            .push(("Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string()));
        assert!(auth_okay(&handler, &request));

        request.headers[0].1 = "Basic bm9wZTpub3Bl".to_string();
        assert!(!auth_okay(&handler, &request));

        request.headers[0].1 = "Bearer dXNlcjpwYXNz".to_string();
        assert!(!auth_okay(&handler, &request));
    }
}
