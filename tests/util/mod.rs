#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Once;
use std::thread;
use std::time::Duration;

use meshd::clock::Clock;
use meshd::sched::Scheduler;
use meshd::timer::TimerWheel;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub struct Core {
    pub clock: Clock,
    pub timers: TimerWheel,
    pub sched: Scheduler,
}

pub fn core() -> Core {
    init();
    let clock = Clock::new().expect("monotonic clock");
    let timers = TimerWheel::new(clock.clone());
    let sched = Scheduler::new(clock.clone(), timers.clone()).expect("scheduler");
    Core {
        clock,
        timers,
        sched,
    }
}

/// Drive the event loop in small slices until `done` or the timeout hits.
pub fn pump_until(core: &Core, timeout_ms: u64, mut done: impl FnMut() -> bool) -> bool {
    core.clock.update().unwrap();
    let deadline = core.clock.absolute(timeout_ms);
    loop {
        if done() {
            return true;
        }
        if core.clock.is_past(deadline) {
            return false;
        }
        core.sched.handle(core.clock.absolute(20)).unwrap();
    }
}

/// Blocking client on its own thread: connect, write the chunks with the
/// given pre-delays, then read until the server closes the connection.
pub fn client(addr: SocketAddr, chunks: Vec<(Vec<u8>, u64)>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("connect");
        for (chunk, delay_ms) in chunks {
            if delay_ms > 0 {
                thread::sleep(Duration::from_millis(delay_ms));
            }
            stream.write_all(&chunk).expect("write");
        }
        let mut response = Vec::new();
        stream.read_to_end(&mut response).expect("read");
        response
    })
}

/// Pump the loop until the client thread finished, then collect its bytes.
pub fn finish(core: &Core, handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    assert!(
        pump_until(core, 5000, || handle.is_finished()),
        "client did not finish in time"
    );
    handle.join().expect("client thread")
}
