use std::io;

use clap::{value_t, App, Arg};
use log::LevelFilter;
use nix::unistd::Pid;

use stacktop::errors::Result;
use stacktop::heartbeat::Heartbeat;
use stacktop::profiler::Profiler;
use stacktop::sink::{OneshotSink, ProfilingSink};

const SAMPLING_HZ: usize = 200;

fn init_logging(verbosity: u64) -> std::result::Result<(), fern::InitError> {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let colors = fern::colors::ColoredLevelConfig::new();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{:<5}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                colors.color(record.level()),
                message
            ))
        })
        .level(level)
        .chain(io::stderr())
        .apply()?;
    Ok(())
}

fn run() -> Result<()> {
    let matches = App::new("stacktop")
        .about("sampling profiler for running multi-threaded processes")
        .arg(
            Arg::with_name("pid")
                .required(true)
                .help("process id to profile"),
        )
        .arg(
            Arg::with_name("oneshot")
                .short("1")
                .help("take one stacktrace of every thread, print it and exit"),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .multiple(true)
                .help("increase log verbosity (repeatable)"),
        )
        .get_matches();
    init_logging(matches.occurrences_of("debug")).expect("logger setup");
    let pid = value_t!(matches, "pid", libc::pid_t).unwrap_or_else(|e| e.exit());

    let mut profiler = Profiler::new(Pid::from_raw(pid))?;
    if matches.is_present("oneshot") {
        let stdout = io::stdout();
        let mut sink = OneshotSink::new(stdout.lock());
        profiler.event_loop(&mut sink, None)?;
    } else {
        let mut sink = ProfilingSink::new(SAMPLING_HZ)?;
        let mut heartbeat = Heartbeat::new(SAMPLING_HZ as u64);
        profiler.event_loop(&mut sink, Some(&mut heartbeat))?;
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Exception: {}", err);
        std::process::exit(1);
    }
}
