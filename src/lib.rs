//! Event-driven core of a mesh routing daemon.
//!
//! The crate provides the substrate every protocol module and plugin of the
//! daemon is built on:
//!
//! * [`clock`]: cached monotonic millisecond time.
//! * [`timer`]: a hierarchical timer wheel with jitter and periodic
//!   rescheduling.
//! * [`sched`]: a single-threaded readiness scheduler multiplexing sockets
//!   against the timer wheel.
//! * [`net`]: UDP packet sockets with an outgoing queue and TCP stream
//!   sessions with bounded buffers, timeouts and managed v4+v6 pairs.
//! * [`telnet`]: a line-oriented command dispatcher with continuous-output
//!   commands.
//! * [`http`]: a small HTTP/1.0+1.1 parser and site router.
//! * [`plugin`]: a registry for static and dynamically loaded plugins with
//!   a four-phase lifecycle.
//! * [`interface`]: an interface-data cache with debounced change
//!   notifications.
//! * [`netlink`]: an asynchronous netlink transport plus the built-in
//!   rtnetlink receiver feeding the interface cache.
//!
//! Everything is cooperative and single-threaded: the scheduler owns the one
//! thread, callbacks must not block, and long work is chunked through timers
//! or continuous-output commands.

#[macro_use]
mod macros;

pub mod acl;
pub mod build_data;
pub mod clock;
pub mod config;
pub mod http;
pub mod interface;
pub mod net;
pub mod netlink;
pub mod plugin;
pub mod sched;
pub mod telnet;
pub mod timer;

mod sys;

pub use crate::clock::Clock;
pub use crate::http::{HttpHandler, HttpRequest, HttpServer, HttpStatus};
pub use crate::interface::{InterfaceData, InterfaceListener, Interfaces};
pub use crate::net::{ManagedPacketSocket, ManagedStreamSocket, PacketSocket, StreamListener};
pub use crate::netlink::{NetlinkHandle, RtnetlinkReceiver};
pub use crate::plugin::{Plugin, PluginRegistry};
pub use crate::sched::Scheduler;
pub use crate::telnet::{TelnetCommand, TelnetResult, TelnetServer};
pub use crate::timer::{Timer, TimerClass, TimerWheel};
