//! The meshd daemon binary: command line handling, signal latches,
//! subsystem bring-up and the main loop.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use log::{error, info, warn};

use meshd::clock::Clock;
use meshd::config::{self, ConfigDb, DeltaHandler};
use meshd::http::{HttpHandler, HttpServer, HttpStatus};
use meshd::interface::Interfaces;
use meshd::netlink::RtnetlinkReceiver;
use meshd::plugin::{Plugin, PluginRegistry};
use meshd::sched::{self, Scheduler};
use meshd::telnet::{TelnetCommand, TelnetResult, TelnetServer};
use meshd::timer::TimerWheel;
use meshd::{build_data, clock};

const TELNET_DEFAULT_PORT: u16 = 2006;
const HTTP_DEFAULT_PORT: u16 = 1978;

/// Main loop slice; configuration reloads are checked this often.
const LOOP_INTERVAL_MS: u64 = 50;

/// Drain interval before teardown, to flush pending output.
const SHUTDOWN_DRAIN_MS: u64 = 500;

static RELOAD_CONFIG: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = build_data::PROGRAM)]
#[command(version = build_data::VERSION)]
#[command(about = "Mesh routing daemon")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Load a plugin at startup
    #[arg(short, long, value_name = "name")]
    plugin: Vec<String>,

    /// Load a configuration file
    #[arg(short = 'l', long, value_name = "source")]
    load: Vec<PathBuf>,

    /// Save the merged configuration to a file and exit
    #[arg(short = 'S', long, value_name = "target")]
    save: Option<PathBuf>,

    /// Set a configuration entry
    #[arg(short, long, value_name = "path[=value]")]
    set: Vec<String>,

    /// Remove a configuration entry
    #[arg(short, long, value_name = "path")]
    remove: Vec<String>,

    /// Print configuration entries and exit
    #[arg(short, long, value_name = "path", num_args = 0..=1, default_missing_value = "")]
    get: Option<String>,

    /// Print the configuration in the given format and exit
    #[arg(short, long, value_name = "fmt")]
    format: Option<String>,

    /// Initialize, validate the configuration and exit
    #[arg(short, long)]
    quit: bool,

    /// Print the configuration schema and exit
    #[arg(long, value_name = "section[.key]", num_args = 0..=1, default_missing_value = "")]
    schema: Option<String>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            if code != 0 {
                eprintln!("Use '{} --help' for a list of options", build_data::PROGRAM);
            }
            return code;
        }
    };

    sched::clear_shutdown();
    setup_signal_handlers();

    let db = match build_config_db(&cli) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };

    // One-shot configuration verbs.
    if let Some(filter) = &cli.schema {
        print!("{}", config::format_schema(Some(filter)));
        return 0;
    }
    if let Some(path) = &cli.get {
        print!("{}", db.get(path));
        return 0;
    }
    if let Some(format) = &cli.format {
        if format != "cfg" {
            eprintln!("Unknown configuration format '{}'", format);
            return 1;
        }
        print!("{}", db.format());
        return 0;
    }

    if let Err(err) = config::validate(&db) {
        eprintln!("Configuration is invalid: {}", err);
        return 1;
    }

    if let Some(path) = &cli.save {
        if let Err(err) = db.save(path) {
            eprintln!("Cannot save configuration to {}: {}", path.display(), err);
            return 1;
        }
        return 0;
    }
    if cli.quit {
        return 0;
    }

    match run_daemon(&cli, db) {
        Ok(()) => 0,
        Err(err) => {
            error!("daemon failed: {}", err);
            1
        }
    }
}

/// Merge configuration files and command line overrides into one database.
fn build_config_db(cli: &Cli) -> Result<ConfigDb, String> {
    let mut db = ConfigDb::new();

    if cli.load.is_empty() {
        let default = Path::new(build_data::DEFAULT_CONFIGFILE);
        if default.exists() {
            let loaded = ConfigDb::load(default)
                .map_err(|err| format!("cannot load {}: {}", default.display(), err))?;
            db.merge(&loaded);
        }
    } else {
        for path in &cli.load {
            let loaded = ConfigDb::load(path)
                .map_err(|err| format!("cannot load {}: {}", path.display(), err))?;
            db.merge(&loaded);
        }
    }

    for plugin in &cli.plugin {
        db.add("global", "plugin", plugin);
    }
    for spec in &cli.set {
        db.set(spec)?;
    }
    for spec in &cli.remove {
        db.remove(spec)?;
    }
    Ok(db)
}

fn run_daemon(cli: &Cli, db: ConfigDb) -> io::Result<()> {
    let clock = Clock::new()?;
    let timers = TimerWheel::new(clock.clone());
    let sched = Scheduler::new(clock.clone(), timers.clone())?;

    // Plugin table is filled before any subsystem initializes.
    let plugins = PluginRegistry::new();

    let interfaces = Interfaces::new(&timers);
    // Failure to bind the rtnetlink socket is fatal.
    let rtnetlink = RtnetlinkReceiver::open(&sched, &interfaces)?;

    let telnet = TelnetServer::new(&sched, Some(plugins.clone()));
    let http = HttpServer::new(&sched);

    for register in static_plugins(&clock, &telnet, &http) {
        register(&plugins);
    }

    let applier = ConfigApplier::new(&telnet, &http, &plugins);
    if let Err(err) = applier.apply(&db, true) {
        warn!("cannot apply initial configuration: {}", err);
        return Err(err);
    }

    info!("starting {}", build_data::version_banner());

    let mut result = Ok(());
    while sched::is_running() {
        if let Err(err) = sched.handle(clock.absolute(LOOP_INTERVAL_MS)) {
            result = Err(err);
            break;
        }

        if RELOAD_CONFIG.swap(false, Ordering::AcqRel) {
            info!("reloading configuration");
            match build_config_db(cli) {
                Ok(new_db) => {
                    if let Err(err) = applier.apply(&new_db, false) {
                        // Keep running with the previous configuration.
                        warn!("configuration reload rejected: {}", err);
                    }
                }
                Err(err) => warn!("configuration reload failed: {}", err),
            }
        }
    }

    // Flush pending output and let imminent timers expire.
    let _ = sched.handle(clock.absolute(SHUTDOWN_DRAIN_MS));

    info!("ending {}", build_data::PROGRAM);

    // Reverse bring-up order.
    http.close();
    telnet.close();
    plugins.shutdown();
    rtnetlink.close();
    interfaces.close();

    result
}

/// Applies configuration databases through per-section delta handlers,
/// keeping the previous database when a new one is rejected.
struct ConfigApplier {
    current: Rc<RefCell<ConfigDb>>,
    handlers: Vec<DeltaHandler>,
}

impl ConfigApplier {
    fn new(telnet: &TelnetServer, http: &HttpServer, plugins: &PluginRegistry) -> ConfigApplier {
        let current: Rc<RefCell<ConfigDb>> = Rc::new(RefCell::new(ConfigDb::new()));
        let mut handlers = Vec::new();

        handlers.push(DeltaHandler {
            section: "telnet".to_string(),
            callback: {
                let telnet = telnet.clone();
                let current = current.clone();
                Box::new(move |_, _| {
                    let db = current.borrow();
                    let cfg = config::stream_socket_config(&db, "telnet", TELNET_DEFAULT_PORT)
                        .map_err(invalid_data)?;
                    telnet.apply(&cfg)
                })
            },
        });

        handlers.push(DeltaHandler {
            section: "http".to_string(),
            callback: {
                let http = http.clone();
                let current = current.clone();
                Box::new(move |_, _| {
                    let db = current.borrow();
                    let cfg = config::stream_socket_config(&db, "http", HTTP_DEFAULT_PORT)
                        .map_err(invalid_data)?;
                    http.apply(&cfg)
                })
            },
        });

        // Global flags steer the socket families and the plugin set.
        handlers.push(DeltaHandler {
            section: "global".to_string(),
            callback: {
                let telnet = telnet.clone();
                let http = http.clone();
                let plugins = plugins.clone();
                let current = current.clone();
                Box::new(move |_, _| {
                    let db = current.borrow();
                    let global = config::global_config(&db);
                    plugins.apply_config(&global.plugins, global.failfast)?;

                    let cfg = config::stream_socket_config(&db, "telnet", TELNET_DEFAULT_PORT)
                        .map_err(invalid_data)?;
                    telnet.apply(&cfg)?;
                    let cfg = config::stream_socket_config(&db, "http", HTTP_DEFAULT_PORT)
                        .map_err(invalid_data)?;
                    http.apply(&cfg)
                })
            },
        });

        ConfigApplier { current, handlers }
    }

    fn apply(&self, new_db: &ConfigDb, first: bool) -> io::Result<()> {
        config::validate(new_db).map_err(invalid_data)?;

        let old = mem::replace(&mut *self.current.borrow_mut(), new_db.clone());
        match config::handle_deltas(&old, new_db, &self.handlers, first) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Restore the previous database; sockets already rebuilt
                // stay as they are until the next successful apply.
                *self.current.borrow_mut() = old;
                Err(err)
            }
        }
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Built-in plugins linked into the daemon. Each entry registers one plugin
/// record before the configuration is applied.
fn static_plugins(
    clock: &Clock,
    telnet: &TelnetServer,
    http: &HttpServer,
) -> Vec<Box<dyn Fn(&PluginRegistry)>> {
    let clock = clock.clone();
    let telnet = telnet.clone();
    let http = http.clone();

    vec![Box::new(move |registry: &PluginRegistry| {
        let mut plugin = Plugin::new("sysinfo", "system information", "the meshd developers");
        plugin.can_disable = true;

        plugin.enable = {
            let clock = clock.clone();
            let telnet = telnet.clone();
            let http = http.clone();
            Some(Box::new(move || {
                let clock = clock.clone();
                telnet.add_command(TelnetCommand::new(
                    "uptime",
                    "Displays the time since daemon start",
                    Rc::new(move |ctx| {
                        let uptime = clock::to_clock_string(clock.now());
                        ctx.session.write_str(&format!("{}\n", uptime));
                        TelnetResult::Active
                    }),
                ));
                http.add_handler(HttpHandler::generated(
                    "/version",
                    Rc::new(|request, body| {
                        request.content_type = Some("text/plain".to_string());
                        body.extend_from_slice(build_data::version_banner().as_bytes());
                        body.push(b'\n');
                        HttpStatus::Ok
                    }),
                ));
                Ok(())
            }))
        };

        plugin.disable = {
            let telnet = telnet.clone();
            let http = http.clone();
            Some(Box::new(move || {
                telnet.remove_command("uptime");
                http.remove_handler("/version");
                Ok(())
            }))
        };

        registry.register_static(plugin);
    })]
}

extern "C" fn quit_signal_handler(_signal: libc::c_int) {
    sched::request_shutdown();
}

extern "C" fn hup_signal_handler(_signal: libc::c_int) {
    RELOAD_CONFIG.store(true, Ordering::Release);
}

fn setup_signal_handlers() {
    // SAFETY: the handlers only touch atomics, which is async-signal-safe.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);

        action.sa_sigaction = quit_signal_handler as usize;
        for signal in [
            libc::SIGINT,
            libc::SIGQUIT,
            libc::SIGILL,
            libc::SIGABRT,
            libc::SIGTERM,
        ] {
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }

        action.sa_sigaction = libc::SIG_IGN;
        for signal in [libc::SIGPIPE, libc::SIGUSR1, libc::SIGUSR2] {
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }

        action.sa_sigaction = hup_signal_handler as usize;
        libc::sigaction(libc::SIGHUP, &action, std::ptr::null_mut());
    }
}
