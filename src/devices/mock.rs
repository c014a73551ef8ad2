//! Scripted stand-in for the breathalyzer, for driving the orchestrator
//! without hardware.
//!
//! Part of the public API so integration tests and front ends can run full
//! sessions with no instrument attached. Nothing in the station's own run
//! path constructs one.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::link::SerialLink;
use crate::error::{Result, StationError};

#[derive(Debug, Clone)]
pub enum Reply {
    Line(String),
    /// Nothing arrives before the read timeout
    Silence,
    /// The read fails with an I/O error
    Fault,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    written: Vec<String>,
    open: bool,
    opens: usize,
    refuse_open: bool,
    fail_writes: bool,
    rejected_line: Option<String>,
    silence_delay: Duration,
}

/// Cloning shares the script, so a test can keep a handle for inspection
/// after handing the link to a session.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLink {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push_line(&self, line: &str) -> &Self {
        self.script().replies.push_back(Reply::Line(line.to_string()));
        self
    }

    pub fn push_silence(&self, count: usize) -> &Self {
        let mut script = self.script();
        for _ in 0..count {
            script.replies.push_back(Reply::Silence);
        }
        drop(script);
        self
    }

    pub fn push_fault(&self) -> &Self {
        self.script().replies.push_back(Reply::Fault);
        self
    }

    /// How long a silent read blocks before returning
    pub fn set_silence_delay(&self, delay: Duration) {
        self.script().silence_delay = delay;
    }

    pub fn refuse_open(&self) {
        self.script().refuse_open = true;
    }

    pub fn fail_writes(&self) {
        self.script().fail_writes = true;
    }

    /// Fails writes of this one line and accepts everything else
    pub fn reject_line(&self, line: &str) {
        self.script().rejected_line = Some(line.to_string());
    }

    /// Lines written so far, without their terminators
    pub fn written(&self) -> Vec<String> {
        self.script().written.clone()
    }

    pub fn open_count(&self) -> usize {
        self.script().opens
    }

    pub fn remaining_replies(&self) -> usize {
        self.script().replies.len()
    }
}

impl SerialLink for ScriptedLink {
    fn open(&mut self) -> Result<()> {
        let mut script = self.script();
        if script.open {
            return Err(StationError::LinkAlreadyOpen);
        }
        if script.refuse_open {
            return Err(StationError::PortUnavailable {
                port: "scripted".into(),
                attempts: 1,
                reason: "refused by script".into(),
            });
        }
        script.open = true;
        script.opens += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.script().open
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let mut script = self.script();
        if !script.open {
            return Err(StationError::LinkNotOpen);
        }
        let line = String::from_utf8_lossy(line).trim_end().to_string();
        if script.fail_writes || script.rejected_line.as_deref() == Some(line.as_str()) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure").into());
        }
        script.written.push(line);
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>> {
        let mut script = self.script();
        if !script.open {
            return Err(StationError::LinkNotOpen);
        }
        match script.replies.pop_front() {
            Some(Reply::Line(line)) => Ok(Some(line)),
            Some(Reply::Fault) => {
                Err(io::Error::new(io::ErrorKind::Other, "scripted read failure").into())
            }
            Some(Reply::Silence) | None => {
                let delay = script.silence_delay;
                drop(script);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.script().open = false;
    }
}
