//! `flowgrindd`: the daemon process entry point (§A, §E).
//!
//! Wires CLI parsing, logging, optional CPU-affinity binding, and a
//! command-line-driven façade onto [`flowgrind::DaemonHandle`]. The façade's
//! on-wire RPC representation is out of scope (spec.md §1 Non-goals); this
//! binary exercises the same `DaemonHandle` API boundary a real XML-RPC
//! server would sit behind.

use std::process::ExitCode;

use flowgrind::daemon::{DaemonHandle, VERSION};
use getopts::Options;

const PROGNAME: &str = "flowgrindd";

struct Args {
    bind_addr: String,
    port: u16,
    core: Option<usize>,
    debug: bool,
    dump_dir: Option<String>,
}

impl Default for Args {
    fn default() -> Self {
        Args { bind_addr: "0.0.0.0".to_string(), port: 5999, core: None, debug: false, dump_dir: None }
    }
}

fn usage(opts: &Options) {
    let brief = format!(
        "Usage: {PROGNAME} [OPTION]...\n\
         Advanced TCP traffic generator daemon.\n\n\
         Mandatory arguments to long options are mandatory for short options too."
    );
    print!("{}", opts.usage(&brief));
}

fn version() {
    println!("{PROGNAME} {VERSION}");
}

fn parse_cmdline() -> Result<Option<Args>, String> {
    let argv: Vec<String> = std::env::args().collect();

    let mut opts = Options::new();
    opts.optopt("b", "", "XML-RPC server bind address", "ADDR");
    opts.optopt("c", "", "bind daemon to specific CPU. First CPU is 0", "#");
    opts.optflag("d", "debug", "don't fork into background, log to stderr");
    opts.optflag("h", "help", "display this help and exit");
    opts.optopt("p", "", "XML-RPC server port", "#");
    opts.optopt("w", "", "target directory for dump files", "DIR");
    opts.optflag("v", "version", "print version information and exit");

    let matches = opts.parse(&argv[1..]).map_err(|e| e.to_string())?;

    if matches.opt_present("h") {
        usage(&opts);
        return Ok(None);
    }
    if matches.opt_present("v") {
        version();
        return Ok(None);
    }

    let mut args = Args::default();

    if let Some(addr) = matches.opt_str("b") {
        args.bind_addr = addr;
    }
    if let Some(port) = matches.opt_str("p") {
        args.port = port.parse().map_err(|_| format!("invalid port: {port}"))?;
    }
    if let Some(core) = matches.opt_str("c") {
        args.core = Some(core.parse().map_err(|_| format!("invalid CPU core: {core}"))?);
    }
    args.debug = matches.opt_present("d");
    args.dump_dir = matches.opt_str("w");

    Ok(Some(args))
}

fn main() -> ExitCode {
    let args = match parse_cmdline() {
        Ok(None) => return ExitCode::SUCCESS,
        Ok(Some(args)) => args,
        Err(msg) => {
            eprintln!("{PROGNAME}: {msg}");
            eprintln!("Try '{PROGNAME} -h' for more information");
            return ExitCode::FAILURE;
        }
    };

    if args.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    if let Some(core) = args.core {
        if let Err(e) = flowgrind::affinity::bind_to_core(core) {
            log::error!("could not bind to CPU {core}: {e}");
            return ExitCode::FAILURE;
        }
        log::info!("bound to CPU {core}");
    }

    if let Some(dir) = &args.dump_dir {
        log::warn!("packet dump to {dir} requested but capture is not implemented; ignoring -w");
    }

    log::info!("flowgrindd {VERSION} listening on {}:{}", args.bind_addr, args.port);

    let daemon = match DaemonHandle::spawn() {
        Ok(daemon) => daemon,
        Err(e) => {
            log::error!("failed to start scheduler thread: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The façade's on-wire transport is out of scope (spec.md §1 Non-goals);
    // this keeps the process alive and drains completed reports so the
    // scheduler's report queue never fills up while nothing else polls it.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
        let (reports, _more) = daemon.get_reports();
        for report in reports {
            log::debug!("report: flow {} kind {:?}", report.flow_id, report.kind);
        }
    }
}
