use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use meshd::acl::Acl;
use meshd::http::{HttpHandler, HttpServer, HttpStatus};
use meshd::net::stream::StreamSocketConfig;

mod util;

fn http_server(core: &util::Core) -> (HttpServer, SocketAddr) {
    let server = HttpServer::new(&core.sched);
    server
        .apply(&StreamSocketConfig {
            bind_v4: Some("127.0.0.1".parse().unwrap()),
            bind_v6: None,
            port: 0,
            ipv4: true,
            ipv6: false,
            acl: Acl::accept_all(),
        })
        .expect("bind http");
    let addr = server.listener_v4().expect("v4 listener").local_addr();
    (server, addr)
}

#[derive(Default)]
struct Seen {
    uri: String,
    params: Vec<(String, String)>,
}

#[test]
fn get_routes_to_directory_handler() {
    let core = util::core();
    let (server, addr) = http_server(&core);

    let seen: Rc<RefCell<Option<Seen>>> = Rc::new(RefCell::new(None));

    server.add_handler(HttpHandler::generated(
        "/status",
        Rc::new(|_, body| {
            body.extend_from_slice(b"status");
            HttpStatus::Ok
        }),
    ));
    server.add_handler(HttpHandler::generated("/logs/", {
        let seen = seen.clone();
        Rc::new(move |request, body| {
            *seen.borrow_mut() = Some(Seen {
                uri: request.uri.clone(),
                params: request.params.clone(),
            });
            body.extend_from_slice(b"log content");
            HttpStatus::Ok
        })
    }));

    let handle = util::client(
        addr,
        vec![(b"GET /logs/today?level=info HTTP/1.1\r\n\r\n".to_vec(), 0)],
    );
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();

    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "got {:?}", text);
    assert!(text.contains("Connection: closed\r\n"));
    assert!(text.contains("Content-length: 11\r\n"));
    assert!(text.ends_with("log content"));

    let seen = seen.borrow_mut().take().expect("handler invoked");
    assert_eq!(seen.uri, "/logs/today");
    assert_eq!(seen.params, vec![("level".to_string(), "info".to_string())]);

    server.close();
}

#[test]
fn post_waits_for_complete_body() {
    let core = util::core();
    let (server, addr) = http_server(&core);

    let seen: Rc<RefCell<Option<Seen>>> = Rc::new(RefCell::new(None));
    server.add_handler(HttpHandler::generated("/submit", {
        let seen = seen.clone();
        Rc::new(move |request, body| {
            *seen.borrow_mut() = Some(Seen {
                uri: request.uri.clone(),
                params: request.params.clone(),
            });
            body.extend_from_slice(b"accepted");
            HttpStatus::Ok
        })
    }));

    // Body arrives in two pieces; the parser must stay ACTIVE in between.
    let handle = util::client(
        addr,
        vec![
            (
                b"POST /submit HTTP/1.0\r\nContent-Length: 12\r\n\r\nhello".to_vec(),
                0,
            ),
            (b"=world!".to_vec(), 300),
        ],
    );
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();

    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "got {:?}", text);
    assert!(text.contains("Content-length: 8\r\n"));
    assert!(text.contains("Connection: closed\r\n"));

    let seen = seen.borrow_mut().take().expect("handler invoked");
    assert_eq!(seen.uri, "/submit");
    assert_eq!(
        seen.params,
        vec![("hello".to_string(), "world!".to_string())]
    );

    server.close();
}

#[test]
fn missing_site_is_not_found() {
    let core = util::core();
    let (server, addr) = http_server(&core);

    let handle = util::client(addr, vec![(b"GET /nope HTTP/1.0\r\n\r\n".to_vec(), 0)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(text.starts_with("HTTP/1.0 404 Not Found\r\n"), "got {:?}", text);

    server.close();
}

#[test]
fn basic_auth_is_enforced() {
    let core = util::core();
    let (server, addr) = http_server(&core);

    let mut handler = HttpHandler::generated(
        "/secure",
        Rc::new(|_, body| {
            body.extend_from_slice(b"secret");
            HttpStatus::Ok
        }),
    );
    handler.auth.push("dXNlcjpwYXNz".to_string());
    server.add_handler(handler);

    let handle = util::client(addr, vec![(b"GET /secure HTTP/1.0\r\n\r\n".to_vec(), 0)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(
        text.starts_with("HTTP/1.0 401 Unauthorized\r\n"),
        "got {:?}",
        text
    );
    assert!(text.contains("WWW-Authenticate: Basic realm="), "got {:?}", text);

    let handle = util::client(
        addr,
        vec![(
            b"GET /secure HTTP/1.0\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n".to_vec(),
            0,
        )],
    );
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "got {:?}", text);
    assert!(text.ends_with("secret"));

    server.close();
}

#[test]
fn unknown_version_is_rejected() {
    let core = util::core();
    let (server, addr) = http_server(&core);

    let handle = util::client(addr, vec![(b"GET / HTTP/2.0\r\n\r\n".to_vec(), 0)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(
        text.starts_with("HTTP/1.0 400 Bad Request\r\n"),
        "got {:?}",
        text
    );

    server.close();
}

#[test]
fn unknown_method_is_not_implemented() {
    let core = util::core();
    let (server, addr) = http_server(&core);

    let handle = util::client(addr, vec![(b"BREW /pot HTTP/1.0\r\n\r\n".to_vec(), 0)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(
        text.starts_with("HTTP/1.0 501 Not Implemented\r\n"),
        "got {:?}",
        text
    );

    server.close();
}

#[test]
fn static_content_and_percent_decoding() {
    let core = util::core();
    let (server, addr) = http_server(&core);

    server.add_handler(HttpHandler::fixed("/plain text", b"fixed page".to_vec()));

    let handle = util::client(
        addr,
        vec![(b"GET /plain%20text HTTP/1.0\r\n\r\n".to_vec(), 0)],
    );
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "got {:?}", text);
    assert!(text.ends_with("fixed page"));

    server.close();
}
