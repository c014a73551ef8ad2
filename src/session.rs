//! Entry point for the presentation layer: start/stop test runs and receive
//! their notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::devices::link::SerialLink;
use crate::devices::protocol::DeviceEvent;
use crate::error::{Result, StationError};
use crate::ledger::ResultLedger;
use crate::screening::data::{Subject, TestOutcome, TestRequest};
use crate::screening::{OrchestratorConfig, TestOrchestrator};

#[derive(Debug)]
pub enum SessionEvent {
    Progress(DeviceEvent),
    Outcome(TestOutcome),
    /// Automatic testing halted on a positive reading
    SafetyStop,
    Failure(StationError),
}

/// Receives notifications on the worker thread, in the order they happen.
/// Implementations hand them over to whatever thread the UI runs on.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: SessionEvent);
}

impl EventSink for flume::Sender<SessionEvent> {
    fn notify(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            debug!("Session event receiver dropped, notification discarded");
        }
    }
}

struct ActiveRun {
    keep_running: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

pub struct SessionController<L: SerialLink + 'static> {
    link: Arc<Mutex<L>>,
    ledger: Arc<dyn ResultLedger>,
    sink: Arc<dyn EventSink>,
    config: OrchestratorConfig,
    active: Mutex<Option<ActiveRun>>,
}

impl<L: SerialLink + 'static> SessionController<L> {
    pub fn new(link: L, ledger: Arc<dyn ResultLedger>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_config(link, ledger, sink, OrchestratorConfig::default())
    }

    pub fn with_config(
        link: L,
        ledger: Arc<dyn ResultLedger>,
        sink: Arc<dyn EventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            link: Arc::new(Mutex::new(link)),
            ledger,
            sink,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn start_manual(&self, subject: Subject) -> Result<()> {
        info!("Manual test requested for subject {} ({})", subject.id, subject.name);
        self.spawn(TestRequest::manual(subject))
    }

    pub fn start_automatic(&self) -> Result<()> {
        info!("Automatic testing requested");
        self.spawn(TestRequest::automatic())
    }

    /// Asks the active run to finish. The run resets the device before it
    /// ends. Does nothing when idle.
    pub fn stop(&self) {
        if let Some(run) = self.active().as_ref() {
            if !run.worker.is_finished() && run.keep_running.swap(false, Ordering::SeqCst) {
                info!("Stop requested for the active test run");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active().as_ref().is_some_and(|run| !run.worker.is_finished())
    }

    /// Blocks until the active run, if any, has finished
    pub fn wait(&self) {
        let run = self.active().take();
        if let Some(run) = run {
            if run.worker.join().is_err() {
                error!("Test worker panicked");
            }
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn(&self, request: TestRequest) -> Result<()> {
        let mut active = self.active();
        if let Some(run) = active.take() {
            if !run.worker.is_finished() {
                warn!("Rejecting test request, another test is running");
                *active = Some(run);
                return Err(StationError::ConcurrentTestRejected);
            }
            if run.worker.join().is_err() {
                error!("Previous test worker panicked");
            }
        }

        let keep_running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&keep_running);
        let link = Arc::clone(&self.link);
        let ledger = Arc::clone(&self.ledger);
        let sink = Arc::clone(&self.sink);
        let config = self.config.clone();

        let worker = thread::Builder::new()
            .name("breathalyzer-test".into())
            .spawn(move || {
                let mut link = match link.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                TestOrchestrator::new(&mut *link, ledger.as_ref(), sink.as_ref(), &flag, config)
                    .run(&request);
            })?;

        *active = Some(ActiveRun { keep_running, worker });
        Ok(())
    }
}

impl<L: SerialLink + 'static> Drop for SessionController<L> {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}
