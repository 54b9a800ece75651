// SPDX-License-Identifier: GPL-3.0-or-later

//! The posttroll nameserver daemon.
//!
//! Aggregates publisher advertisements and answers address lookups on the
//! configured nameserver port.
//!
//! ```bash
//! # Run in the foreground
//! nameserver -v
//!
//! # OS-level lifecycle
//! nameserver -d start
//! nameserver -d status
//! nameserver -d stop
//!
//! # Environments without multicast
//! nameserver --no-multicast
//! ```
//!
//! Exit codes: 0 normal, 1 usage, 2 daemon action failed.

use clap::{Parser, ValueEnum};
use posttroll::nameserver::NameServer;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PIDFILE: &str = "/tmp/nameserver.pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DaemonAction {
    Start,
    Stop,
    Status,
    Restart,
}

/// The nameserver, binding publishers and subscribers together.
#[derive(Parser, Debug)]
#[command(name = "nameserver", version, about, long_about = None)]
struct Args {
    /// Run as a daemon
    #[arg(short, long, value_enum)]
    daemon: Option<DaemonAction>,

    /// File to log to (defaults to stdout)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Print debug messages too
    #[arg(short, long)]
    verbose: bool,

    /// Disable multicasting
    #[arg(long)]
    no_multicast: bool,

    /// Accept connections only from localhost
    #[arg(long)]
    restrict_to_localhost: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            // Usage errors exit 1; --help/--version are not errors.
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(&args);

    match args.daemon {
        None => run_foreground(&args),
        Some(DaemonAction::Start) => daemon_start(&args),
        Some(DaemonAction::Stop) => daemon_stop(),
        Some(DaemonAction::Status) => daemon_status(),
        Some(DaemonAction::Restart) => {
            // A nameserver that was not running is fine to restart.
            let _ = daemon_stop();
            daemon_start(&args)
        }
    }
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Some(path) = &args.log {
        match File::options().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("cannot open log file {}: {e}", path.display());
            }
        }
    }
    builder.init();
}

// =======================================================================
// Foreground
// =======================================================================

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: i32) {
    TERMINATED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_terminate));
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_terminate));
    }
}

fn run_foreground(args: &Args) -> ExitCode {
    install_signal_handlers();

    let nameserver = Arc::new(NameServer::new(
        None,
        !args.no_multicast,
        args.restrict_to_localhost,
    ));
    let runner = {
        let nameserver = Arc::clone(&nameserver);
        thread::spawn(move || nameserver.run())
    };

    while !TERMINATED.load(Ordering::SeqCst) && !runner.is_finished() {
        thread::sleep(Duration::from_millis(200));
    }
    nameserver.stop();

    let result = runner.join();
    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            log::error!("nameserver failed: {e}");
            ExitCode::from(2)
        }
        Err(_) => {
            log::error!("nameserver panicked");
            ExitCode::from(2)
        }
    }
}

// =======================================================================
// Daemon lifecycle
// =======================================================================

fn daemon_start(args: &Args) -> ExitCode {
    if read_pid().is_some_and(process_alive) {
        eprintln!("nameserver already running");
        return ExitCode::from(2);
    }
    match daemonize() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("could not daemonize: {e}");
            return ExitCode::from(2);
        }
    }
    if let Err(e) = std::fs::write(PIDFILE, std::process::id().to_string()) {
        log::error!("cannot write pidfile {PIDFILE}: {e}");
        return ExitCode::from(2);
    }
    let code = run_foreground(args);
    let _ = std::fs::remove_file(PIDFILE);
    code
}

fn daemon_stop() -> ExitCode {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = read_pid() else {
        eprintln!("nameserver is not running (no pidfile)");
        return ExitCode::from(2);
    };
    if kill(Pid::from_raw(pid), Signal::SIGTERM).is_err() {
        eprintln!("could not signal nameserver (pid {pid})");
        let _ = std::fs::remove_file(PIDFILE);
        return ExitCode::from(2);
    }
    // Wait for the process to go away.
    for _ in 0..50 {
        if !process_alive(pid) {
            let _ = std::fs::remove_file(PIDFILE);
            println!("nameserver stopped");
            return ExitCode::SUCCESS;
        }
        thread::sleep(Duration::from_millis(100));
    }
    eprintln!("nameserver (pid {pid}) did not stop in time");
    ExitCode::from(2)
}

fn daemon_status() -> ExitCode {
    match read_pid() {
        Some(pid) if process_alive(pid) => {
            println!("nameserver is running (pid {pid})");
            ExitCode::SUCCESS
        }
        _ => {
            println!("nameserver is not running");
            ExitCode::from(2)
        }
    }
}

fn read_pid() -> Option<i32> {
    let raw = std::fs::read_to_string(Path::new(PIDFILE)).ok()?;
    raw.trim().parse().ok()
}

fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Detach from the controlling terminal via the double-fork pattern.
///
/// Must run before any thread is spawned: fork() only duplicates the
/// calling thread.
fn daemonize() -> std::io::Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    fn io_err(errno: nix::errno::Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(errno as i32)
    }

    match unsafe { fork() }.map_err(io_err)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().map_err(io_err)?;
    match unsafe { fork() }.map_err(io_err)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    std::env::set_current_dir("/")?;
    Ok(())
}
