use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::thread;

use meshd::net::stream::{SessionState, StreamConfig, StreamListener};

mod util;

#[test]
fn outbound_connect_fires_send_first() {
    let core = util::core();

    // Blocking peer: accept one connection, send a greeting, echo until the
    // session closes its side.
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_addr = peer.local_addr().unwrap();
    let peer_thread = thread::spawn(move || {
        let (mut stream, _) = peer.accept().unwrap();
        // Let the connect completion event fire before any payload arrives.
        thread::sleep(std::time::Duration::from_millis(300));
        stream.write_all(b"hello").unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        buf
    });

    // Record every receive invocation with the inbound length at the time.
    let calls: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    let config = StreamConfig {
        send_first: true,
        receive: {
            let calls = calls.clone();
            Some(Rc::new(move |session| {
                calls.borrow_mut().push(session.inbuf.len());
                if !session.inbuf.is_empty() {
                    // Answer once, then end the session.
                    let input: Vec<u8> = session.inbuf.drain(..).collect();
                    session.write(b"got ");
                    session.write(&input);
                    return SessionState::SendAndQuit;
                }
                SessionState::Active
            }))
        },
        ..StreamConfig::default()
    };

    let outbound = StreamListener::outbound(&core.sched, config).unwrap();
    outbound.connect_to(peer_addr).unwrap();

    assert!(util::pump_until(&core, 5000, || peer_thread.is_finished()));
    let echoed = peer_thread.join().unwrap();
    assert_eq!(echoed, b"got hello");

    // The first invocation came from send_first with an empty buffer.
    let calls = calls.borrow();
    assert!(!calls.is_empty());
    assert_eq!(calls[0], 0);

    outbound.close();
}
