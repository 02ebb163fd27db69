// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use getopts::Options;
use libc::c_int;
use log::info;
use log::LevelFilter;
use nix::sys::signal::sigaction;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;

use oomd::config;
use oomd::daemon::Oomd;
use oomd::engine::ConstructionContext;
use oomd::logger;

const DEFAULT_CONFIG_PATH: &str = "/etc/oomd.json";
const DEFAULT_CGROUP_FS: &str = "/sys/fs/cgroup";
const DEFAULT_INTERVAL_SECS: u64 = 5;

static TERMINATING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_terminate(_signum: c_int) {
    TERMINATING.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic, which is
    // async-signal-safe.
    unsafe {
        sigaction(Signal::SIGTERM, &action).context("Failed to install SIGTERM handler")?;
        sigaction(Signal::SIGINT, &action).context("Failed to install SIGINT handler")?;
    }
    Ok(())
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    eprint!("{}", opts.usage(&brief));
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "Show this help message and exit");
    opts.optopt(
        "C",
        "config",
        &format!("Config file (default: {})", DEFAULT_CONFIG_PATH),
        "CONFIG",
    );
    opts.optopt(
        "i",
        "interval",
        &format!("Sampling interval in seconds (default: {})", DEFAULT_INTERVAL_SECS),
        "SECS",
    );
    opts.optflag("d", "dry", "Dry run - do not actually kill anything");
    opts.optopt(
        "",
        "cgroup-fs",
        &format!("Cgroup filesystem mount point (default: {})", DEFAULT_CGROUP_FS),
        "PATH",
    );
    opts.optflag("v", "verbose", "Enable debug logging");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&program, &opts);
            bail!("Invalid arguments");
        }
    };
    if matches.opt_present("help") {
        print_usage(&program, &opts);
        return Ok(());
    }
    if !matches.free.is_empty() {
        print_usage(&program, &opts);
        bail!("Non-option arguments are not supported");
    }

    let max_level = if matches.opt_present("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logger::init(max_level).context("Failed to initialize logging")?;
    install_signal_handlers()?;

    let config_path = matches
        .opt_str("config")
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let interval = match matches.opt_str("interval") {
        Some(value) => value
            .parse()
            .context("Argument to --interval is not a number of seconds")?,
        None => DEFAULT_INTERVAL_SECS,
    };
    let construction = ConstructionContext {
        cgroup_fs: PathBuf::from(
            matches
                .opt_str("cgroup-fs")
                .unwrap_or_else(|| DEFAULT_CGROUP_FS.to_owned()),
        ),
        dry: matches.opt_present("dry"),
    };

    info!(
        "oomd starting with config={} interval={}s dry={} cgroup_fs={}",
        config_path,
        interval,
        construction.dry,
        construction.cgroup_fs.display()
    );

    let contents = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file {}", config_path))?;
    let root = config::parse(&contents)?;
    let engine = config::compile(&root, &construction)?;

    let mut oomd = Oomd::new(engine, Duration::from_secs(interval));
    oomd.run(&TERMINATING);
    Ok(())
}
