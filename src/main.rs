use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use breathalyzer_station::config::{self, ConfigStore};
use breathalyzer_station::devices::{BreathalyzerPort, DeviceEvent};
use breathalyzer_station::directory::SubjectDirectory;
use breathalyzer_station::ledger::CsvLedger;
use breathalyzer_station::{SessionController, SessionEvent};
use clap::{Arg, ArgMatches, Command};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = setup_logging();
    info!("Starting breathalyzer station");

    let matches = parse_args();
    let resources = matches
        .get_one::<PathBuf>("resources")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("resources"));
    let settings = ConfigStore::new(resources.join("config.json"));

    match matches.subcommand() {
        Some(("ports", _)) => {
            for port in config::list_ports()? {
                println!("{}\t{}", port.name, port.description);
            }
        }
        Some(("set-port", args)) => {
            if let Some(name) = args.get_one::<String>("name") {
                settings.save_port(name)?;
                println!("Serial port set to {}", name);
            }
        }
        Some(("detect-port", _)) => match config::discover_port()? {
            Some(name) => {
                settings.save_port(&name)?;
                println!("Breathalyzer found on {}", name);
            }
            None => println!("No breathalyzer adapter found"),
        },
        Some(("manual", args)) => {
            let subject_id = args.get_one::<u32>("subject").copied().unwrap_or_default();
            let directory = SubjectDirectory::load(&resources.join("registrations.csv"))?;
            let Some(subject) = directory.lookup(subject_id).cloned() else {
                error!("Subject {} is not registered", subject_id);
                return Err(format!("Subject {} is not registered", subject_id).into());
            };
            run_session(&resources, settings, |session| session.start_manual(subject))?;
        }
        Some(("automatic", _)) => {
            run_session(&resources, settings, |session| session.start_automatic())?;
        }
        _ => unreachable!("clap requires a subcommand"),
    }

    info!("Application shutting down");
    Ok(())
}

type Session = SessionController<BreathalyzerPort<ConfigStore>>;

/// Starts a run and prints its events until it ends. Ctrl-C stops the run.
fn run_session(
    resources: &Path,
    settings: ConfigStore,
    start: impl FnOnce(&Session) -> breathalyzer_station::Result<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = CsvLedger::open(resources.join("results.csv"))?;
    let (tx, rx) = flume::unbounded();
    let session = Arc::new(SessionController::new(
        BreathalyzerPort::new(settings),
        Arc::new(ledger),
        Arc::new(tx),
    ));

    let interrupted = Arc::clone(&session);
    ctrlc::set_handler(move || interrupted.stop())?;

    start(session.as_ref())?;
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => report(event),
            Err(flume::RecvTimeoutError::Timeout) if !session.is_active() => break,
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    session.wait();
    for event in rx.try_iter() {
        report(event);
    }
    Ok(())
}

fn report(event: SessionEvent) {
    match event {
        SessionEvent::Progress(DeviceEvent::Ack(command)) => println!("Device acknowledged {}", command),
        SessionEvent::Progress(_) => {}
        SessionEvent::Outcome(outcome) => println!(
            "Test {}: {} {} -> {:.3} mg/L ({:?})",
            outcome.test_id,
            outcome.subject.name,
            outcome.timestamp.format("%d/%m/%Y %H:%M:%S"),
            outcome.quantity,
            outcome.status
        ),
        SessionEvent::SafetyStop => {
            println!("SAFETY WARNING: alcohol detected, automatic testing stopped.");
            println!("Wait 5 minutes before resuming tests.");
        }
        SessionEvent::Failure(e) => eprintln!("Test failed ({:?}): {}", e.kind(), e),
    }
}

fn parse_args() -> ArgMatches {
    Command::new("breathalyzer-station")
        .about("Runs breath-alcohol tests on a serial breathalyzer")
        .subcommand_required(true)
        .arg(
            Arg::new("resources")
                .long("resources")
                .short('r')
                .help("Directory holding config.json, results.csv and registrations.csv")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .subcommand(Command::new("ports").about("List serial ports"))
        .subcommand(
            Command::new("set-port")
                .about("Store the breathalyzer's serial port")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(Command::new("detect-port").about("Find and store the breathalyzer's port"))
        .subcommand(
            Command::new("manual")
                .about("Run one test for a registered subject")
                .arg(
                    Arg::new("subject")
                        .required(true)
                        .value_parser(clap::value_parser!(u32)),
                ),
        )
        .subcommand(Command::new("automatic").about("Test repeatedly until stopped or alcohol is detected"))
        .get_matches()
}

fn setup_logging() -> WorkerGuard {
    // Set up file-based logging with rotation
    let file_appender = rolling::daily("logs", "station.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_writer(non_blocking)
        .with_ansi(false) // Disable ANSI colors in log files
        .with_level(true)
        .init();
    guard
}
