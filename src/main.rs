//! Mount driver: parses the CLI, builds the runtime policy, registers the
//! passthrough operation table with the kernel filesystem-in-userspace
//! interface, and runs until SIGINT/SIGTERM ask for an orderly unmount.
//!
//! CLI surface and `CommonArgs`-style flattening mirror
//! `examples/common/args.rs`; the spawn/shutdown loop mirrors
//! `tests/slow_fs.rs`'s use of `fuser::spawn_mount` plus `fuser::MountOption`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fuser::MountOption;
use log::{error, info};
use nas_emu_fuse::config::{ConfigError, LogLevel, RuntimePolicy};
use nas_emu_fuse::fault::FaultInjector;
use nas_emu_fuse::logger;
use nas_emu_fuse::passthrough::PassthroughFs;

/// Fault-injecting passthrough FUSE filesystem for NAS emulation testing.
#[derive(Parser, Debug)]
#[command(name = "nas-emu-fuse")]
struct Args {
    /// Directory where the virtual filesystem is exposed.
    mount_point: PathBuf,

    /// Backing directory that actually stores data.
    #[arg(long = "storage")]
    storage: Option<PathBuf>,

    /// Log sink path.
    #[arg(long = "log")]
    log: Option<PathBuf>,

    /// Minimum severity written to the log: 0=DEBUG .. 3=ERROR.
    #[arg(long = "loglevel")]
    loglevel: Option<u8>,

    /// Fault-rule configuration file.
    #[arg(long = "config")]
    config: PathBuf,

    /// Stay attached to the controlling terminal instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,
}

const EXIT_OK: i32 = 0;
const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_RUNTIME_FAILURE: i32 = 2;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let cli_log_level = args.loglevel.and_then(|n| match n {
        0 => Some(LogLevel::Debug),
        1 => Some(LogLevel::Info),
        2 => Some(LogLevel::Warn),
        3 => Some(LogLevel::Error),
        _ => None,
    });

    let policy = match RuntimePolicy::load(
        &args.config,
        Some(args.mount_point.clone()),
        args.storage.clone(),
        args.log.clone(),
        cli_log_level,
        args.foreground,
    ) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("nas-emu-fuse: configuration error: {e}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    if let Err(e) = logger::FileLogger::init(&policy.log_path, policy.log_level.to_filter()) {
        eprintln!("nas-emu-fuse: {e}");
        return EXIT_STARTUP_FAILURE;
    }

    if let Err(e) = validate_startup_paths(&policy) {
        error!("startup failed: {e}");
        eprintln!("nas-emu-fuse: {e}");
        return EXIT_STARTUP_FAILURE;
    }

    info!(
        "starting nas-emu-fuse: mount_point={} backing_root={} rules={}",
        policy.mount_point.display(),
        policy.backing_root.display(),
        policy.fault_rules.len()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .and_then(|_| {
            signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        })
    {
        error!("failed to register signal handlers: {e}");
        eprintln!("nas-emu-fuse: failed to register signal handlers: {e}");
        return EXIT_RUNTIME_FAILURE;
    }

    let injector = Arc::new(FaultInjector::new(policy.fault_rules.clone(), policy.global_seed));
    let fs = PassthroughFs::new(policy.backing_root.clone(), injector, Arc::clone(&shutdown));

    let options = vec![
        MountOption::FSName("nas-emu-fuse".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];

    let session = match fuser::spawn_mount(fs, &policy.mount_point, &options) {
        Ok(session) => session,
        Err(e) => {
            error!("mount failed: {e}");
            eprintln!("nas-emu-fuse: mount failed: {e}");
            return EXIT_RUNTIME_FAILURE;
        }
    };

    // Interruptible sleep: wake periodically rather than blocking on a
    // single uninterruptible duration, so a shutdown signal is noticed
    // promptly even if it arrives between checks.
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutdown signal received, unmounting");
    drop(session);
    EXIT_OK
}

fn validate_startup_paths(policy: &RuntimePolicy) -> Result<(), ConfigError> {
    if !policy.backing_root.is_dir() {
        return Err(ConfigError::Io {
            path: policy.backing_root.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "backing_root is not a directory",
            ),
        });
    }
    if !policy.mount_point.is_dir() {
        return Err(ConfigError::Io {
            path: policy.mount_point.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mount_point is not a directory",
            ),
        });
    }
    Ok(())
}
