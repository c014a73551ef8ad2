pub mod data;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::devices::link::{READ_TIMEOUT, SerialLink};
use crate::devices::protocol::{self, Command, DeviceEvent, ReadingStatus};
use crate::error::{Result, StationError};
use crate::ledger::ResultLedger;
use crate::session::{EventSink, SessionEvent};
use data::{TestMode, TestOutcome, TestRequest};

/// Timing and tolerance settings for a test run
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub read_timeout: Duration,     // Per-read wait for a device line
    pub max_empty_reads: u32,       // Consecutive empty reads before giving up on the device
    pub cycle_pause: Duration,      // Pause between automatic cycles
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            max_empty_reads: 10,
            cycle_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Starting,
    Awaiting,
    Stopping,
    Error,
}

enum CycleEnd {
    Measured { status: ReadingStatus, persisted: bool },
    Cancelled,
}

/// Drives the breathalyzer through manual or automatic test cycles.
///
/// Runs on the caller's thread and borrows the link for the whole run. The
/// device is sent `RESET` on every path out of a run.
pub struct TestOrchestrator<'a, L: SerialLink + ?Sized> {
    link: &'a mut L,
    ledger: &'a dyn ResultLedger,
    sink: &'a dyn EventSink,
    keep_running: &'a AtomicBool,
    config: OrchestratorConfig,
    state: OrchestratorState,
    deferred: Vec<SessionEvent>,
}

impl<'a, L: SerialLink + ?Sized> TestOrchestrator<'a, L> {
    pub fn new(
        link: &'a mut L,
        ledger: &'a dyn ResultLedger,
        sink: &'a dyn EventSink,
        keep_running: &'a AtomicBool,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            link,
            ledger,
            sink,
            keep_running,
            config,
            state: OrchestratorState::Idle,
            deferred: Vec::new(),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Runs the request to completion: one cycle for a manual test, repeated
    /// cycles for automatic testing until a `HIGH` reading, a failure, or a
    /// cleared run flag.
    pub fn run(&mut self, request: &TestRequest) {
        let automatic = request.mode.is_automatic();
        let label = if automatic { "automatic" } else { "manual" };
        info!("Starting {} test run (requested {})", label, request.created_at.format("%H:%M:%S"));

        if !self.link.is_open() {
            if let Err(e) = self.link.open() {
                error!("Could not open breathalyzer link: {}", e);
                self.state = OrchestratorState::Error;
                self.sink.notify(SessionEvent::Failure(e));
                self.state = OrchestratorState::Idle;
                return;
            }
        }

        while self.should_continue() {
            match self.run_cycle(&request.mode) {
                Ok(CycleEnd::Measured { status, persisted }) => {
                    if automatic && status == ReadingStatus::High {
                        warn!("HIGH reading during automatic testing, stopping for safety");
                        self.deferred.push(SessionEvent::SafetyStop);
                        break;
                    }
                    if !automatic || !persisted {
                        break;
                    }
                    debug!("Automatic cycle complete, pausing {:?}", self.config.cycle_pause);
                    thread::sleep(self.config.cycle_pause);
                }
                Ok(CycleEnd::Cancelled) => {
                    info!("Stop requested, ending {} test run", label);
                    break;
                }
                Err(e) => {
                    error!("{} test failed: {}", label, e);
                    self.state = OrchestratorState::Error;
                    self.deferred.push(SessionEvent::Failure(e));
                    break;
                }
            }
        }

        self.shut_down();
        info!("{} test run finished", label);
    }

    fn run_cycle(&mut self, mode: &TestMode) -> Result<CycleEnd> {
        self.state = OrchestratorState::Starting;
        let test_id = self.ledger.next_test_id()?;
        info!("Test {} starting", test_id);
        self.send(Command::Start)?;

        let mut empty_reads = 0;
        loop {
            if !self.should_continue() {
                return Ok(CycleEnd::Cancelled);
            }

            let event = match self.link.read_line(self.config.read_timeout)? {
                Some(line) => protocol::decode(&line),
                None => DeviceEvent::Empty,
            };

            match event {
                DeviceEvent::Empty => {
                    empty_reads += 1;
                    debug!("Empty read {}/{}", empty_reads, self.config.max_empty_reads);
                    if empty_reads >= self.config.max_empty_reads {
                        return Err(StationError::DeviceUnresponsive { empty_reads });
                    }
                }
                DeviceEvent::Unrecognized(ref raw) => {
                    empty_reads = 0;
                    warn!("Ignoring unrecognized device line: {}", raw);
                }
                DeviceEvent::Ack(Command::Start) => {
                    empty_reads = 0;
                    debug!("Device acknowledged {}", Command::Start);
                    self.state = OrchestratorState::Awaiting;
                    self.sink.notify(SessionEvent::Progress(event));
                }
                DeviceEvent::Ack(Command::Reset) => {
                    empty_reads = 0;
                    debug!("Ignoring stale {} echo", Command::Reset);
                }
                DeviceEvent::Result { quantity, status } => {
                    self.state = OrchestratorState::Awaiting;
                    self.sink.notify(SessionEvent::Progress(event));

                    let outcome = TestOutcome {
                        test_id,
                        subject: mode.subject(),
                        timestamp: Local::now(),
                        quantity,
                        status: status.into(),
                    };
                    info!("Test {} result: {:.3} ({:?})", test_id, quantity, outcome.status);
                    let persisted = self.persist(outcome);
                    return Ok(CycleEnd::Measured { status, persisted });
                }
            }
        }
    }

    /// Saves and announces the outcome. A ledger failure is queued for the
    /// caller but does not stop the run from resetting the device.
    fn persist(&mut self, outcome: TestOutcome) -> bool {
        match self.ledger.append(&outcome) {
            Ok(()) => {
                self.sink.notify(SessionEvent::Outcome(outcome));
                true
            }
            Err(e) => {
                error!("Failed to save test {}: {}", outcome.test_id, e);
                self.sink.notify(SessionEvent::Outcome(outcome));
                self.deferred.push(SessionEvent::Failure(e));
                false
            }
        }
    }

    fn shut_down(&mut self) {
        if self.state != OrchestratorState::Error {
            self.state = OrchestratorState::Stopping;
        }
        if let Err(e) = self.send(Command::Reset) {
            warn!("Failed to reset breathalyzer: {}", e);
            // A run that already failed reports that failure, not the reset
            let failed = self.deferred.iter().any(|event| matches!(event, SessionEvent::Failure(_)));
            if !failed {
                self.state = OrchestratorState::Error;
                self.deferred.insert(0, SessionEvent::Failure(e));
            }
        }
        self.link.close();

        for event in self.deferred.drain(..) {
            self.sink.notify(event);
        }
        self.state = OrchestratorState::Idle;
    }

    fn send(&mut self, command: Command) -> Result<()> {
        debug!("Sending {}", command);
        self.link.write_line(&protocol::encode(command))
    }

    fn should_continue(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::ScriptedLink;
    use crate::error::FailureKind;
    use crate::ledger::CsvLedger;
    use super::data::{Subject, TestStatus};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl EventSink for RecordingSink {
        fn notify(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl RecordingSink {
        fn take(&self) -> Vec<SessionEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    struct BrokenLedger;

    impl ResultLedger for BrokenLedger {
        fn next_test_id(&self) -> Result<u64> {
            Ok(1)
        }

        fn append(&self, _outcome: &TestOutcome) -> Result<()> {
            Err(StationError::LedgerUnavailable("disk full".into()))
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            read_timeout: Duration::from_millis(1),
            max_empty_reads: 10,
            cycle_pause: Duration::ZERO,
        }
    }

    fn ana() -> Subject {
        Subject { id: 7, name: "Ana".into(), badge: "123".into(), department: "QA".into() }
    }

    fn run(link: &ScriptedLink, ledger: &dyn ResultLedger, request: TestRequest) -> Vec<SessionEvent> {
        let sink = RecordingSink::default();
        let keep_running = AtomicBool::new(true);
        let mut device = link.clone();
        let mut orchestrator =
            TestOrchestrator::new(&mut device, ledger, &sink, &keep_running, fast_config());
        orchestrator.run(&request);
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        sink.take()
    }

    fn outcomes(events: &[SessionEvent]) -> Vec<&TestOutcome> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Outcome(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn manual_test_records_one_outcome_and_resets() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$START").push_line("$RESULT,0.000-OK");

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        let saved = outcomes(&events);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].test_id, 1);
        assert_eq!(saved[0].subject, ana());
        assert_eq!(saved[0].status, TestStatus::Approved);
        assert_eq!(saved[0].quantity, 0.0);
        assert_eq!(link.written(), vec!["$START", "$RESET"]);
        assert!(!link.is_open());
        assert_eq!(ledger.next_test_id().unwrap(), 2);
    }

    #[test]
    fn manual_high_reading_still_runs_a_single_cycle() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$RESULT,1.125-HIGH").push_line("$RESULT,0.000-OK");

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        let saved = outcomes(&events);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, TestStatus::Rejected);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::SafetyStop)));
        assert_eq!(link.written(), vec!["$START", "$RESET"]);
        assert_eq!(link.remaining_replies(), 1);
    }

    #[test]
    fn noise_is_ignored_until_a_result_arrives() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$START")
            .push_silence(9)
            .push_line("warming up")
            .push_line("$RESULT,0.5-MAYBE")
            .push_silence(9)
            .push_line("$RESULT,0.020-OK");

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        assert_eq!(outcomes(&events).len(), 1);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Failure(_))));
    }

    #[test]
    fn blank_lines_escalate_to_an_io_failure() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$START");
        for _ in 0..10 {
            link.push_line("  ");
        }

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        assert!(matches!(
            events.last(),
            Some(SessionEvent::Failure(e @ StationError::DeviceUnresponsive { empty_reads: 10 }))
                if e.kind() == FailureKind::IoFailure
        ));
        assert!(outcomes(&events).is_empty());
    }

    #[test]
    fn automatic_run_stops_on_high_reading() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$START")
            .push_line("$RESULT,0.000-OK")
            .push_line("$START")
            .push_line("$RESULT,1.125-HIGH")
            .push_line("$RESULT,0.000-OK");

        let events = run(&link, &ledger, TestRequest::automatic());

        let saved = outcomes(&events);
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].status, TestStatus::Approved);
        assert_eq!(saved[1].status, TestStatus::Rejected);
        assert_eq!(saved[1].subject, Subject::automatic());
        assert!(saved[0].test_id < saved[1].test_id);
        assert!(matches!(events.last(), Some(SessionEvent::SafetyStop)));
        assert_eq!(link.written(), vec!["$START", "$START", "$RESET"]);
    }

    #[test]
    fn unresponsive_device_fails_after_ten_empty_reads() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_silence(10);

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Failure(e) => assert_eq!(e.kind(), FailureKind::IoFailure),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(link.written(), vec!["$START", "$RESET"]);
        assert!(outcomes(&events).is_empty());
    }

    #[test]
    fn read_fault_aborts_and_resets() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$START").push_fault();

        let events = run(&link, &ledger, TestRequest::automatic());

        let failures: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Failure(_)))
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(link.written(), vec!["$START", "$RESET"]);
    }

    #[test]
    fn port_unavailable_is_reported_once() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.refuse_open();

        let events = run(&link, &ledger, TestRequest::automatic());

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SessionEvent::Failure(e) if e.kind() == FailureKind::PortUnavailable
        ));
        assert!(link.written().is_empty());
    }

    #[test]
    fn persistence_failure_still_resets_and_halts() {
        let link = ScriptedLink::new();
        link.push_line("$RESULT,0.000-OK").push_line("$RESULT,0.000-OK");

        let events = run(&link, &BrokenLedger, TestRequest::automatic());

        assert_eq!(outcomes(&events).len(), 1);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Failure(e)) if e.kind() == FailureKind::PersistenceFailure
        ));
        assert_eq!(link.written(), vec!["$START", "$RESET"]);
    }

    #[test]
    fn persistence_failure_on_high_reading_keeps_the_safety_stop() {
        let link = ScriptedLink::new();
        link.push_line("$RESULT,1.125-HIGH");

        let events = run(&link, &BrokenLedger, TestRequest::automatic());

        assert!(matches!(events.last(), Some(SessionEvent::SafetyStop)));
        assert_eq!(
            events.iter().filter(|e| matches!(e, SessionEvent::Failure(_))).count(),
            1
        );
    }

    #[test]
    fn rejected_reset_is_reported_as_a_failure() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$RESULT,0.000-OK");
        link.reject_line("$RESET");

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        assert_eq!(outcomes(&events).len(), 1);
        let failures: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Failure(e) => Some(e.kind()),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![FailureKind::IoFailure]);
        assert!(matches!(events.last(), Some(SessionEvent::Failure(_))));
        assert!(!link.is_open());
    }

    #[test]
    fn rejected_reset_after_a_failure_reports_only_the_first() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_silence(10);
        link.reject_line("$RESET");

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SessionEvent::Failure(StationError::DeviceUnresponsive { .. })
        ));
    }

    #[test]
    fn reset_echo_is_not_progress() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let link = ScriptedLink::new();
        link.push_line("$RESET").push_line("$START").push_line("$RESULT,0.000-OK");

        let events = run(&link, &ledger, TestRequest::manual(ana()));

        let acks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Progress(DeviceEvent::Ack(command)) => Some(*command),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![Command::Start]);
        assert_eq!(outcomes(&events).len(), 1);
    }

    #[test]
    fn cleared_flag_ends_the_run_with_a_reset() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let sink = RecordingSink::default();
        let keep_running = AtomicBool::new(false);
        let link = ScriptedLink::new();
        link.push_line("$RESULT,0.000-OK");
        let mut device = link.clone();

        TestOrchestrator::new(&mut device, &ledger, &sink, &keep_running, fast_config())
            .run(&TestRequest::automatic());

        assert!(sink.take().is_empty());
        assert_eq!(link.written(), vec!["$RESET"]);
    }
}
