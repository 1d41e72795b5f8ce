use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;
use log::LevelFilter;

use autopinned::config::Config;
use autopinned::logging::AutopinLogger;
use autopinned::os::OsServices;
use autopinned::signals::SigchldPipe;
use autopinned::watchdog::Watchdog;

#[derive(Parser, Debug)]
#[command(name = "autopinned")]
#[command(about = "NUMA-aware thread-pinning and page-migration controller")]
#[command(version, disable_version_flag = true)]
struct Args {
    /// Run detached from the controlling terminal.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Configuration file (§6 grammar); repeatable, later files override
    /// earlier ones key-by-key.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Vec<PathBuf>,

    /// Positional config file, equivalent to another `-c`.
    #[arg(value_name = "GLOBAL_CONFIG")]
    global_config: Option<PathBuf>,

    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),
}

/// Exit codes per §6: 0 success, 1 configuration/setup failure, 2 usage error.
fn main() -> ExitCode {
    let args = Args::parse();

    let mut config_paths = args.config.clone();
    if let Some(positional) = &args.global_config {
        config_paths.push(positional.clone());
    }
    if config_paths.is_empty() {
        config_paths.push(PathBuf::from("/etc/autopinned/autopinned.conf"));
    }

    let mut config = Config::new();
    for path in &config_paths {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("autopinned: cannot read {}: {e}", path.display());
                return ExitCode::from(1);
            }
        };
        let parsed = match Config::parse(&text) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("autopinned: {e}");
                return ExitCode::from(1);
            }
        };
        config.merge(parsed);
    }

    if args.daemon {
        if let Err(e) = daemonize() {
            eprintln!("autopinned: cannot daemonize: {e}");
            return ExitCode::from(1);
        }
    }

    let global = autopinned::config::GlobalConfig::from_config(&config);
    let level = global
        .log_level
        .as_deref()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if let Err(e) = AutopinLogger::init(global.log_type, global.log_file.as_deref(), level) {
        eprintln!("autopinned: cannot initialize logging: {e}");
        return ExitCode::from(1);
    }

    if global.mqtt_hostname.is_some() {
        let hostname = global.mqtt_hostname.clone();
        let port = global.mqtt_port;
        std::thread::Builder::new()
            .name("mqtt-client".into())
            .spawn(move || run_mqtt_listener(hostname, port))
            .ok();
    }

    let sigchld = match SigchldPipe::install() {
        Ok(p) => p,
        Err(e) => {
            log::error!("cannot install SIGCHLD handler: {e}");
            return ExitCode::from(1);
        }
    };

    let os = OsServices::new();
    let mut watchdog = match Watchdog::bootstrap(&os, &config) {
        Ok(w) => w,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(1);
        }
    };

    let exit_flag = watchdog.request_exit();
    let interrupted = exit_flag.clone();
    if let Err(e) = ctrlc_handler(move || interrupted.store(true, Ordering::SeqCst)) {
        log::warn!("cannot install Ctrl-C handler: {e}");
    }

    let result = watchdog.run();
    sigchld.drain();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(1)
        }
    }
}

/// Detaches from the controlling terminal via the classic double-fork.
/// Both children `setsid`, and the intermediate process exits immediately
/// so the daemon can never reacquire a controlling terminal.
fn daemonize() -> Result<(), nix::errno::Errno> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid()?;
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    Ok(())
}

/// Runs the MQTT `AddProcess` listener on its own single-threaded runtime;
/// the controller only has one target per process, so inbound commands are
/// logged for the operator rather than dynamically re-targeted (§4.10).
fn run_mqtt_listener(hostname: Option<String>, port: Option<u16>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::warn!("Comm/connect: cannot start mqtt runtime: {e}");
            return;
        }
    };
    runtime.block_on(async move {
        let (_client, mut rx) = match autopinned::mqtt::MqttClient::connect(hostname.as_deref(), port).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("{e}");
                return;
            }
        };
        while let Some(payload) = rx.recv().await {
            log::info!("mqtt AddProcess: {payload}");
        }
    });
}

/// A minimal `SIGINT` handler installed alongside `SigchldPipe`, sharing its
/// `sigaction`-based approach rather than pulling in a dedicated crate.
fn ctrlc_handler(on_interrupt: impl Fn() + Send + Sync + 'static) -> Result<(), nix::errno::Errno> {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::OnceLock;

    static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
    let _ = HANDLER.set(Box::new(on_interrupt));

    extern "C" fn trampoline(_: libc::c_int) {
        if let Some(f) = HANDLER.get() {
            f();
        }
    }

    let action = SigAction::new(SigHandler::Handler(trampoline), SaFlags::SA_RESTART, SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}
