//! Line-oriented administrative console.
//!
//! A process-wide command registry keyed by case-insensitive name, dispatched
//! from a managed stream socket. A command line ends at `\n` (trailing `\r`
//! stripped); a leading `/` chains multiple commands on one line and a line
//! of just `/` is rewritten to the default command. Commands may produce
//! continuous asynchronous output by installing a [`Producer`], which is
//! stopped before the next command runs.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::acl::Acl;
use crate::build_data;
use crate::net::stream::{
    ManagedStreamSocket, Session, SessionState, StreamConfig, StreamError, StreamListener,
    StreamSocketConfig,
};
use crate::plugin::PluginRegistry;
use crate::sched::Scheduler;
use crate::timer::{Timer, TimerClass, TimerWheel};

const DEFAULT_COMMAND: &str = "/help";
const PROMPT: &str = "> ";

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_INPUT: usize = 4096;
const DEFAULT_MAX_SESSIONS: usize = 3;

/// Result of one command dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetResult {
    /// Session stays open and interactive.
    Active,
    /// The handler installed a producer; output continues asynchronously.
    Continuous,
    /// End the session once output is flushed.
    Quit,
    UnknownCommand,
    InternalError,
}

/// Source of asynchronous output installed by a continuous command. The
/// dispatcher stops it before the next command runs; session teardown stops
/// it as well.
pub trait Producer {
    fn stop(&mut self, session: &mut Session, telnet: &mut TelnetState);
}

/// Hook run at session teardown, in registration order.
pub type CleanupHandler = Box<dyn FnOnce(&mut Session)>;

/// Per-session telnet state, stored in the stream session's extension slot.
pub struct TelnetState {
    pub echo: bool,
    pub timeout_ms: u64,
    producer: Option<Box<dyn Producer>>,
    cleanups: Vec<CleanupHandler>,
}

impl Default for TelnetState {
    fn default() -> TelnetState {
        TelnetState {
            echo: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            producer: None,
            cleanups: Vec::new(),
        }
    }
}

impl TelnetState {
    pub fn has_producer(&self) -> bool {
        self.producer.is_some()
    }

    /// Install the producer of a continuous command. The handler must return
    /// [`TelnetResult::Continuous`] afterwards.
    pub fn install_producer(&mut self, producer: Box<dyn Producer>) {
        self.producer = Some(producer);
    }

    /// Register a teardown hook for this session.
    pub fn add_cleanup(&mut self, handler: CleanupHandler) {
        self.cleanups.push(handler);
    }
}

/// Context handed to command handlers.
pub struct CommandCtx<'a> {
    pub session: &'a mut Session,
    pub telnet: &'a mut TelnetState,
    pub name: &'a str,
    pub params: Option<&'a str>,
    pub server: &'a TelnetServer,
}

pub type CommandHandler = Rc<dyn Fn(&mut CommandCtx<'_>) -> TelnetResult>;

/// A registered console command.
pub struct TelnetCommand {
    pub name: &'static str,
    pub help: &'static str,
    pub acl: Option<Acl>,
    pub handler: CommandHandler,
    pub help_handler: Option<CommandHandler>,
}

impl TelnetCommand {
    pub fn new(name: &'static str, help: &'static str, handler: CommandHandler) -> TelnetCommand {
        TelnetCommand {
            name,
            help,
            acl: None,
            handler,
            help_handler: None,
        }
    }
}

struct RepeatJob {
    listener: StreamListener,
    session: usize,
    timer: Timer,
    name: String,
    params: Option<String>,
}

struct TelnetInner {
    commands: BTreeMap<String, TelnetCommand>,
    managed: Option<ManagedStreamSocket>,
    repeat_class: TimerClass,
    repeats: Vec<Option<RepeatJob>>,
    repeat_free: Vec<usize>,
    plugins: Option<PluginRegistry>,
    timers: TimerWheel,
}

/// Shared handle to the telnet subsystem.
#[derive(Clone)]
pub struct TelnetServer {
    inner: Rc<RefCell<TelnetInner>>,
}

impl TelnetServer {
    pub fn new(sched: &Scheduler, plugins: Option<PluginRegistry>) -> TelnetServer {
        let timers = sched.timers().clone();
        let inner = Rc::new(RefCell::new(TelnetInner {
            commands: BTreeMap::new(),
            managed: None,
            repeat_class: TimerClass::PLACEHOLDER,
            repeats: Vec::new(),
            repeat_free: Vec::new(),
            plugins,
            timers: timers.clone(),
        }));
        let server = TelnetServer { inner };

        let repeat_class = {
            let weak = Rc::downgrade(&server.inner);
            timers.add_class(
                "telnet repeat timer",
                true,
                Rc::new(move |_, job| {
                    if let Some(inner) = weak.upgrade() {
                        TelnetServer { inner }.repeat_fired(job);
                    }
                }),
            )
        };
        server.inner.borrow_mut().repeat_class = repeat_class;

        let config = StreamConfig {
            session_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_input: DEFAULT_MAX_INPUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            send_first: false,
            init: Some(Rc::new(|session: &mut Session| {
                session.ext = Some(Box::new(TelnetState::default()));
            })),
            cleanup: {
                let weak = Rc::downgrade(&server.inner);
                Some(Rc::new(move |session: &mut Session| {
                    if let Some(inner) = weak.upgrade() {
                        TelnetServer { inner }.session_cleanup(session);
                    }
                }))
            },
            receive: {
                let weak = Rc::downgrade(&server.inner);
                Some(Rc::new(move |session: &mut Session| {
                    match weak.upgrade() {
                        Some(inner) => TelnetServer { inner }.receive_data(session),
                        None => SessionState::Cleanup,
                    }
                }))
            },
            create_error: Some(Rc::new(|session: &mut Session, error: StreamError| {
                match error {
                    StreamError::Forbidden => {}
                    StreamError::RequestTooLarge => {
                        session.write_str("Input buffer overflow, ending connection\n");
                    }
                    StreamError::ServiceUnavailable => {
                        session.write_str("Telnet service unavailable, too many sessions\n");
                    }
                }
            })),
        };
        server.inner.borrow_mut().managed = Some(ManagedStreamSocket::new(sched, config));

        for command in builtin_commands() {
            server.add_command(command);
        }
        server
    }

    /// Apply a managed socket configuration.
    pub fn apply(&self, config: &StreamSocketConfig) -> std::io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.managed.as_mut() {
            Some(managed) => managed.apply(config),
            None => Ok(()),
        }
    }

    pub fn listener_v4(&self) -> Option<StreamListener> {
        self.inner
            .borrow()
            .managed
            .as_ref()
            .and_then(|m| m.listener_v4().cloned())
    }

    pub fn listener_v6(&self) -> Option<StreamListener> {
        self.inner
            .borrow()
            .managed
            .as_ref()
            .and_then(|m| m.listener_v6().cloned())
    }

    /// Register a command; the key is its case-insensitive name.
    pub fn add_command(&self, command: TelnetCommand) -> bool {
        let key = command.name.to_ascii_lowercase();
        let mut inner = self.inner.borrow_mut();
        if inner.commands.contains_key(&key) {
            return false;
        }
        inner.commands.insert(key, command);
        true
    }

    pub fn remove_command(&self, name: &str) {
        self.inner
            .borrow_mut()
            .commands
            .remove(&name.to_ascii_lowercase());
    }

    pub fn plugins(&self) -> Option<PluginRegistry> {
        self.inner.borrow().plugins.clone()
    }

    /// Tear down listeners and pending repeat jobs.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(mut managed) = inner.managed.take() {
            let timers = inner.timers.clone();
            for job in inner.repeats.iter_mut().filter_map(Option::take) {
                timers.destroy(job.timer);
            }
            let class = inner.repeat_class;
            drop(inner);
            managed.close();
            timers.remove_class(class);
        }
    }

    fn receive_data(&self, session: &mut Session) -> SessionState {
        let mut telnet = take_state(session);
        let mut processed = false;
        let mut quit = false;

        'lines: while let Some(eol) = session.inbuf.iter().position(|&b| b == b'\n') {
            let mut end = eol;
            if end > 0 && session.inbuf[end - 1] == b'\r' {
                end -= 1;
            }
            let line = String::from_utf8_lossy(&session.inbuf[..end]).into_owned();
            session.inbuf.drain(..=eol);

            debug!("interactive console: {}", line);
            processed = true;

            let line = if line == "/" {
                DEFAULT_COMMAND.to_string()
            } else {
                line
            };

            let tokens: Vec<String> = match line.strip_prefix('/') {
                Some(rest) => rest.split('/').map(str::to_string).collect(),
                None => vec![line],
            };

            for token in tokens {
                // Continuous output stops at the next command.
                self.stop_producer(session, &mut telnet);

                let (name, params) = split_command(&token);
                if name.is_empty() {
                    continue;
                }

                let out_len = session.out.len();
                match self.dispatch(session, &mut telnet, name, params) {
                    TelnetResult::Active | TelnetResult::Continuous => {}
                    TelnetResult::UnknownCommand => {
                        session.out.truncate(out_len);
                        session.write_str(&format!("Error, unknown command '{}'\n", name));
                    }
                    TelnetResult::InternalError => {
                        session.out.truncate(out_len);
                        session.write_str(&format!("Error in command '{}'\n", name));
                    }
                    TelnetResult::Quit => {
                        quit = true;
                        break 'lines;
                    }
                }
                // An empty line behind each command.
                if telnet.echo {
                    session.write_str("\n");
                }
            }
        }

        if quit {
            put_state(session, telnet);
            return SessionState::SendAndQuit;
        }

        session.set_timeout(telnet.timeout_ms);

        if processed && session.state == SessionState::Active && telnet.echo {
            session.write_str(PROMPT);
        }

        put_state(session, telnet);
        SessionState::Active
    }

    fn dispatch(
        &self,
        session: &mut Session,
        telnet: &mut TelnetState,
        name: &str,
        params: Option<&str>,
    ) -> TelnetResult {
        let key = name.to_ascii_lowercase();
        let found = {
            let inner = self.inner.borrow();
            inner
                .commands
                .get(&key)
                .map(|cmd| (cmd.handler.clone(), cmd.acl.clone()))
        };

        let Some((handler, acl)) = found else {
            return TelnetResult::UnknownCommand;
        };
        if let Some(acl) = acl {
            if !acl.check(&session.peer().ip()) {
                info!(
                    "blocked telnet command '{}' from {} because of acl",
                    name,
                    session.peer()
                );
                return TelnetResult::UnknownCommand;
            }
        }

        info!(
            "executing command from {}: {} {}",
            session.peer(),
            name,
            params.unwrap_or("")
        );

        let mut ctx = CommandCtx {
            session,
            telnet,
            name,
            params,
            server: self,
        };
        handler(&mut ctx)
    }

    fn stop_producer(&self, session: &mut Session, telnet: &mut TelnetState) {
        if let Some(mut producer) = telnet.producer.take() {
            producer.stop(session, telnet);
        }
    }

    fn session_cleanup(&self, session: &mut Session) {
        let mut telnet = take_state(session);
        self.stop_producer(session, &mut telnet);
        for cleanup in telnet.cleanups.drain(..) {
            cleanup(session);
        }
    }

    fn new_repeat_job(
        &self,
        listener: StreamListener,
        session: usize,
        name: String,
        params: Option<String>,
        interval_ms: u64,
    ) -> usize {
        let mut inner = self.inner.borrow_mut();
        let id = match inner.repeat_free.pop() {
            Some(id) => id,
            None => {
                inner.repeats.push(None);
                inner.repeats.len() - 1
            }
        };
        let timer = inner.timers.create(inner.repeat_class, 0, id);
        inner.repeats[id] = Some(RepeatJob {
            listener,
            session,
            timer,
            name,
            params,
        });
        inner.timers.start(timer, interval_ms);
        id
    }

    fn remove_repeat_job(&self, id: usize) {
        let mut inner = self.inner.borrow_mut();
        if let Some(job) = inner.repeats.get_mut(id).and_then(Option::take) {
            inner.timers.destroy(job.timer);
            inner.repeat_free.push(id);
        }
    }

    fn repeat_fired(&self, job_id: usize) {
        let job = {
            let inner = self.inner.borrow();
            inner.repeats.get(job_id).and_then(|slot| {
                slot.as_ref()
                    .map(|j| (j.listener.clone(), j.session, j.name.clone(), j.params.clone()))
            })
        };
        let Some((listener, session_id, name, params)) = job else {
            return;
        };

        let server = self.clone();
        listener.with_session(session_id, move |session| {
            let mut telnet = take_state(session);
            let result = server.dispatch(session, &mut telnet, &name, params.as_deref());
            if result != TelnetResult::Active && result != TelnetResult::Continuous {
                server.stop_producer(session, &mut telnet);
            }
            put_state(session, telnet);
            session.flush();
        });
    }
}

impl std::fmt::Debug for TelnetServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TelnetServer")
            .field("commands", &inner.commands.len())
            .finish()
    }
}

fn take_state(session: &mut Session) -> TelnetState {
    session
        .ext
        .take()
        .and_then(|ext| ext.downcast::<TelnetState>().ok())
        .map(|boxed| *boxed)
        .unwrap_or_default()
}

fn put_state(session: &mut Session, telnet: TelnetState) {
    session.ext = Some(Box::new(telnet));
}

/// Split a command token into name and parameter string.
fn split_command(token: &str) -> (&str, Option<&str>) {
    match token.split_once(' ') {
        Some((name, params)) => (name, Some(params)),
        None => (token, None),
    }
}

struct RepeatProducer {
    server: TelnetServer,
    job: usize,
}

impl Producer for RepeatProducer {
    fn stop(&mut self, _session: &mut Session, _telnet: &mut TelnetState) {
        self.server.remove_repeat_job(self.job);
    }
}

fn builtin_commands() -> Vec<TelnetCommand> {
    vec![
        TelnetCommand::new("quit", "Ends telnet session", Rc::new(cmd_quit)),
        TelnetCommand::new("exit", "Ends telnet session", Rc::new(cmd_quit)),
        TelnetCommand::new(
            "help",
            "help: Display the online help text and a list of commands",
            Rc::new(cmd_help),
        ),
        TelnetCommand::new("echo", "echo <string>: Prints a string", Rc::new(cmd_echo)),
        TelnetCommand::new(
            "repeat",
            "repeat <seconds> <command>: Repeats a telnet command every X seconds",
            Rc::new(cmd_repeat),
        ),
        TelnetCommand::new(
            "timeout",
            "timeout <seconds>: Sets telnet session timeout",
            Rc::new(cmd_timeout),
        ),
        TelnetCommand::new(
            "version",
            "Displays version of the program",
            Rc::new(cmd_version),
        ),
        TelnetCommand::new(
            "plugin",
            "control plugins dynamically, parameters are 'list', 'activate <plugin>', \
             'deactivate <plugin>', 'load <plugin>' and 'unload <plugin>'",
            Rc::new(cmd_plugin),
        ),
    ]
}

fn cmd_quit(_ctx: &mut CommandCtx<'_>) -> TelnetResult {
    TelnetResult::Quit
}

fn cmd_help(ctx: &mut CommandCtx<'_>) -> TelnetResult {
    if let Some(param) = ctx.params {
        let key = param.to_ascii_lowercase();
        let found = {
            let inner = ctx.server.inner.borrow();
            inner
                .commands
                .get(&key)
                .map(|cmd| (cmd.help, cmd.help_handler.clone()))
        };
        match found {
            None => {
                ctx.session
                    .write_str(&format!("No help text found for command: {}\n", param));
            }
            Some((_, Some(help_handler))) => {
                let mut sub = CommandCtx {
                    session: ctx.session,
                    telnet: ctx.telnet,
                    name: param,
                    params: None,
                    server: ctx.server,
                };
                return help_handler(&mut sub);
            }
            Some((help, None)) => {
                ctx.session.write_str(&format!("{}\n", help));
            }
        }
        return TelnetResult::Active;
    }

    ctx.session.write_str("Known commands:\n");
    let names: Vec<&'static str> = {
        let inner = ctx.server.inner.borrow();
        let peer = ctx.session.peer().ip();
        inner
            .commands
            .values()
            .filter(|cmd| cmd.acl.as_ref().map_or(true, |acl| acl.check(&peer)))
            .map(|cmd| cmd.name)
            .collect()
    };
    for name in names {
        ctx.session.write_str(&format!("  {}\n", name));
    }
    ctx.session
        .write_str("Use 'help <command>' to see a help text for one command\n");
    TelnetResult::Active
}

fn cmd_echo(ctx: &mut CommandCtx<'_>) -> TelnetResult {
    let text = ctx.params.unwrap_or("");
    ctx.session.write_str(&format!("{}\n", text));
    TelnetResult::Active
}

fn cmd_timeout(ctx: &mut CommandCtx<'_>) -> TelnetResult {
    let seconds: u64 = ctx
        .params
        .map(|p| p.trim().parse().unwrap_or(0))
        .unwrap_or(0);
    ctx.telnet.timeout_ms = seconds.saturating_mul(1000);
    ctx.session.set_timeout(ctx.telnet.timeout_ms);
    TelnetResult::Active
}

fn cmd_version(ctx: &mut CommandCtx<'_>) -> TelnetResult {
    ctx.session
        .write_str(&format!("{}\n", build_data::version_banner()));
    TelnetResult::Active
}

fn cmd_repeat(ctx: &mut CommandCtx<'_>) -> TelnetResult {
    if ctx.telnet.has_producer() {
        ctx.session
            .write_str("Error, you cannot stack continuous output commands\n");
        return TelnetResult::Active;
    }

    let Some((interval, command)) = ctx.params.and_then(|p| p.split_once(' ')) else {
        ctx.session.write_str("Missing parameters for repeat\n");
        return TelnetResult::Active;
    };
    let interval_ms = interval.parse::<u64>().unwrap_or(0).saturating_mul(1000);
    if interval_ms == 0 {
        ctx.session.write_str("Missing parameters for repeat\n");
        return TelnetResult::Active;
    }

    let Some(listener) = ctx.session.listener() else {
        return TelnetResult::InternalError;
    };

    let (name, params) = split_command(command);
    let name = name.to_string();
    let params = params.map(str::to_string);

    let job_id = ctx.server.new_repeat_job(
        listener,
        ctx.session.id(),
        name.clone(),
        params.clone(),
        interval_ms,
    );

    ctx.telnet.install_producer(Box::new(RepeatProducer {
        server: ctx.server.clone(),
        job: job_id,
    }));

    // Run the command a first time right away.
    let result = ctx
        .server
        .dispatch(ctx.session, ctx.telnet, &name, params.as_deref());
    if result != TelnetResult::Active {
        ctx.server
            .stop_producer(ctx.session, ctx.telnet);
        return TelnetResult::Active;
    }
    TelnetResult::Continuous
}

fn cmd_plugin(ctx: &mut CommandCtx<'_>) -> TelnetResult {
    let Some(registry) = ctx.server.plugins() else {
        ctx.session.write_str("Plugin system not available\n");
        return TelnetResult::Active;
    };

    let params = ctx.params.unwrap_or("list");
    let (verb, name) = split_command(params);

    if verb.eq_ignore_ascii_case("list") {
        ctx.session.write_str("Plugins:\n");
        for info in registry.list() {
            ctx.session.write_str(&format!(
                " {:<30}\t{}\t{}\n",
                info.name,
                if info.enabled { "enabled" } else { "" },
                if info.is_static { "static" } else { "" },
            ));
        }
        return TelnetResult::Active;
    }

    let Some(name) = name else {
        ctx.session.write_str("Error, missing or unknown parameter\n");
        return TelnetResult::Active;
    };

    if verb.eq_ignore_ascii_case("load") {
        if registry.get(name).is_some() {
            ctx.session
                .write_str(&format!("Plugin {} already loaded\n", name));
        } else if registry.load(name).is_ok() {
            ctx.session
                .write_str(&format!("Plugin {} successfully loaded\n", name));
        } else {
            ctx.session
                .write_str(&format!("Could not load plugin {}\n", name));
        }
        return TelnetResult::Active;
    }

    let Some(canonical) = registry.get(name) else {
        ctx.session
            .write_str(&format!("Error, could not find plugin '{}'.\n", name));
        return TelnetResult::Active;
    };

    if verb.eq_ignore_ascii_case("activate") {
        if registry.is_enabled(&canonical) {
            ctx.session
                .write_str(&format!("Plugin {} already active\n", name));
        } else if registry.enable(&canonical).is_ok() {
            ctx.session
                .write_str(&format!("Plugin {} successfully activated\n", name));
        } else {
            ctx.session
                .write_str(&format!("Could not activate plugin {}\n", name));
        }
    } else if verb.eq_ignore_ascii_case("deactivate") {
        if !registry.is_enabled(&canonical) {
            ctx.session
                .write_str(&format!("Plugin {} is not active\n", name));
        } else if registry.disable(&canonical).is_ok() {
            ctx.session
                .write_str(&format!("Plugin {} successfully deactivated\n", name));
        } else {
            ctx.session
                .write_str(&format!("Could not deactivate plugin {}\n", name));
        }
    } else if verb.eq_ignore_ascii_case("unload") {
        if registry.is_static(&canonical) {
            ctx.session.write_str(&format!(
                "Plugin {} is static and cannot be unloaded\n",
                name
            ));
        } else if registry.unload(&canonical).is_ok() {
            ctx.session
                .write_str(&format!("Plugin {} successfully unloaded\n", name));
        } else {
            ctx.session
                .write_str(&format!("Could not unload plugin {}\n", name));
        }
    } else {
        warn!("unknown plugin command '{}'", verb);
        ctx.session
            .write_str(&format!("Unknown command 'plugin {} {}'.\n", verb, name));
    }
    TelnetResult::Active
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_token() {
        assert_eq!(split_command("help"), ("help", None));
        assert_eq!(split_command("echo hi there"), ("echo", Some("hi there")));
        assert_eq!(split_command(""), ("", None));
    }

    #[test]
    fn default_state() {
        let state = TelnetState::default();
        assert!(state.echo);
        assert_eq!(state.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(!state.has_producer());
    }
}
