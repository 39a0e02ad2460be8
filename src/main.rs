use std::path::Path;

use clap::{App, Arg};
use colored::Colorize;
use log::{error, info};
use nix::unistd::Pid;

use binpatch::errors::Result;
use binpatch::patch;
use binpatch::process;

fn run_app(pid: Pid, patchfile: &str) -> Result<()> {
    let info = patch::load_patch_info(Path::new(patchfile))?;
    patch::verify_image(&info)?;
    info!(
        "patching process {}: {} -> {}",
        pid, info.old_path, info.path
    );
    process::patch_process(pid, info)
}

fn main() {
    let matches = App::new("binpatch - apply a live code patch to a running process")
        .version("0.1.0")
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .value_name("DEBUG_LEVEL")
                .help("Set debug level [0..5]")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("with-log")
                .long("with-log")
                .value_name("OUTPUT")
                .help("with-log=[filename|stdout|stderr], default is stderr")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("patch")
                .long("patch")
                .value_name("FILE")
                .required(true)
                .help("patch description file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("pid")
                .value_name("PID")
                .required(true)
                .help("pid of the process to patch")
                .takes_value(true),
        )
        .get_matches();

    let log_level = matches
        .value_of("debug")
        .and_then(|x| x.parse::<i32>().ok())
        .unwrap_or(3);
    let log_output = matches.value_of("with-log");
    setup_logger(log_level, log_output).expect("set log level");

    let pid = match matches
        .value_of("pid")
        .and_then(|x| x.parse::<libc::pid_t>().ok())
    {
        Some(raw) if raw > 0 => Pid::from_raw(raw),
        _ => {
            eprintln!("PID must be a positive integer");
            std::process::exit(2);
        }
    };
    let patchfile = matches.value_of("patch").unwrap_or("");

    match run_app(pid, patchfile) {
        Ok(()) => (),
        Err(err) => {
            error!("failed to patch process {}: {}", pid, err);
            std::process::exit(1);
        }
    }
}

fn level_tag(level: log::Level) -> colored::ColoredString {
    match level {
        log::Level::Error => "ERROR".red(),
        log::Level::Warn => "WARN".yellow(),
        log::Level::Info => "INFO".green(),
        log::Level::Debug => "DEBUG".cyan(),
        log::Level::Trace => "TRACE".normal(),
    }
}

fn fern_with_output(output: Option<&str>) -> std::io::Result<fern::Dispatch> {
    match output {
        None | Some("stderr") => Ok(fern::Dispatch::new().chain(std::io::stderr())),
        Some("stdout") => Ok(fern::Dispatch::new().chain(std::io::stdout())),
        Some(output) => {
            let f = std::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .create(true)
                .open(output)?;
            Ok(fern::Dispatch::new().chain(f))
        }
    }
}

fn setup_logger(level: i32, output: Option<&str>) -> std::io::Result<()> {
    let log_level = match level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    fern_with_output(output)?
        .level(log_level)
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                level_tag(record.level()),
                message
            ))
        })
        .apply()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}
