use std::net::SocketAddr;

use meshd::acl::Acl;
use meshd::net::stream::StreamSocketConfig;
use meshd::telnet::TelnetServer;

mod util;

fn telnet_server(core: &util::Core) -> (TelnetServer, SocketAddr) {
    let server = TelnetServer::new(&core.sched, None);
    server
        .apply(&StreamSocketConfig {
            bind_v4: Some("127.0.0.1".parse().unwrap()),
            bind_v6: None,
            port: 0,
            ipv4: true,
            ipv6: false,
            acl: Acl::accept_all(),
        })
        .expect("bind telnet");
    let addr = server.listener_v4().expect("v4 listener").local_addr();
    (server, addr)
}

#[test]
fn multi_command_line() {
    let core = util::core();
    let (server, addr) = telnet_server(&core);

    // One line chaining two commands; quit closes the session.
    let handle = util::client(addr, vec![(b"/echo hi/quit\n".to_vec(), 0)]);
    let response = util::finish(&core, handle);

    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("hi\n"), "got {:?}", text);

    server.close();
}

#[test]
fn unknown_command_reports_error() {
    let core = util::core();
    let (server, addr) = telnet_server(&core);

    let handle = util::client(addr, vec![(b"/nosuchcommand/quit\n".to_vec(), 0)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(
        text.contains("Error, unknown command 'nosuchcommand'"),
        "got {:?}",
        text
    );

    server.close();
}

#[test]
fn help_lists_builtins_and_prompt_appears() {
    let core = util::core();
    let (server, addr) = telnet_server(&core);

    let handle = util::client(addr, vec![(b"help\n".to_vec(), 0), (b"quit\n".to_vec(), 200)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();

    assert!(text.contains("Known commands:"), "got {:?}", text);
    for builtin in ["quit", "exit", "help", "echo", "repeat", "timeout", "version"] {
        assert!(text.contains(builtin), "missing {} in {:?}", builtin, text);
    }
    // Echo is on by default, so the prompt shows after the command.
    assert!(text.contains("> "), "got {:?}", text);

    server.close();
}

#[test]
fn input_overflow_ends_session() {
    let core = util::core();
    let (server, addr) = telnet_server(&core);

    // More than the telnet input limit without a newline.
    let blob = vec![b'x'; 8192];
    let handle = util::client(addr, vec![(blob, 0)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(text.contains("Input buffer overflow"), "got {:?}", text);

    server.close();
}

#[test]
fn version_command_prints_banner() {
    let core = util::core();
    let (server, addr) = telnet_server(&core);

    let handle = util::client(addr, vec![(b"/version/quit\n".to_vec(), 0)]);
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();
    assert!(text.contains("meshd"), "got {:?}", text);

    server.close();
}

#[test]
fn cleanup_handlers_run_in_registration_order() {
    use std::cell::RefCell;
    use std::rc::Rc;

    use meshd::telnet::{TelnetCommand, TelnetResult};

    let core = util::core();
    let (server, addr) = telnet_server(&core);

    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    server.add_command(TelnetCommand::new("hook", "registers cleanup handlers", {
        let order = order.clone();
        Rc::new(move |ctx| {
            for tag in [1u32, 2] {
                let order = order.clone();
                ctx.telnet
                    .add_cleanup(Box::new(move |_| order.borrow_mut().push(tag)));
            }
            TelnetResult::Active
        })
    }));

    let handle = util::client(addr, vec![(b"/hook/quit\n".to_vec(), 0)]);
    util::finish(&core, handle);

    assert_eq!(*order.borrow(), vec![1, 2]);

    server.close();
}

#[test]
fn repeat_produces_continuous_output() {
    let core = util::core();
    let (server, addr) = telnet_server(&core);

    // Repeat every second; wait long enough for at least one timer fire,
    // then stop with quit on a second line.
    let handle = util::client(
        addr,
        vec![
            (b"repeat 1 echo tick\n".to_vec(), 0),
            (b"quit\n".to_vec(), 2500),
        ],
    );
    let text = String::from_utf8(util::finish(&core, handle)).unwrap();

    // Once immediately plus at least one asynchronous firing.
    let ticks = text.matches("tick").count();
    assert!(ticks >= 2, "expected repeated output, got {:?}", text);

    server.close();
}
