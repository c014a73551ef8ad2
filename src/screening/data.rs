use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::devices::protocol::ReadingStatus;

pub const AUTOMATIC_SUBJECT_ID: u32 = 0;
pub const AUTOMATIC_LABEL: &str = "Automatic";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Registered person being tested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: u32,
    pub name: String,
    pub badge: String,
    pub department: String,
}

impl Subject {
    /// Placeholder recorded for unattended runs
    pub fn automatic() -> Self {
        Self {
            id: AUTOMATIC_SUBJECT_ID,
            name: AUTOMATIC_LABEL.to_string(),
            badge: AUTOMATIC_LABEL.to_string(),
            department: AUTOMATIC_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMode {
    Manual(Subject),
    Automatic,
}

impl TestMode {
    pub fn is_automatic(&self) -> bool {
        matches!(self, TestMode::Automatic)
    }

    pub fn subject(&self) -> Subject {
        match self {
            TestMode::Manual(subject) => subject.clone(),
            TestMode::Automatic => Subject::automatic(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub mode: TestMode,
    pub created_at: DateTime<Local>,
}

impl TestRequest {
    pub fn manual(subject: Subject) -> Self {
        Self { mode: TestMode::Manual(subject), created_at: Local::now() }
    }

    pub fn automatic() -> Self {
        Self { mode: TestMode::Automatic, created_at: Local::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Approved,
    Rejected,
}

impl From<ReadingStatus> for TestStatus {
    fn from(status: ReadingStatus) -> Self {
        match status {
            ReadingStatus::Ok => TestStatus::Approved,
            ReadingStatus::High => TestStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub test_id: u64,
    pub subject: Subject,
    pub timestamp: DateTime<Local>,
    pub quantity: f64,
    pub status: TestStatus,
}

/// One row of the results file
#[derive(Debug, Serialize)]
pub struct OutcomeRecord {
    pub test_id: u64,
    pub subject_id: u32,
    pub name: String,
    pub badge: String,
    pub department: String,
    pub timestamp: String, // local time, TIMESTAMP_FORMAT
    #[serde(rename = "quantity_mg_l")]
    pub quantity: f64,
    pub status: TestStatus,
}

impl From<&TestOutcome> for OutcomeRecord {
    fn from(outcome: &TestOutcome) -> Self {
        Self {
            test_id: outcome.test_id,
            subject_id: outcome.subject.id,
            name: outcome.subject.name.clone(),
            badge: outcome.subject.badge.clone(),
            department: outcome.subject.department.clone(),
            timestamp: outcome.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            quantity: outcome.quantity,
            status: outcome.status,
        }
    }
}
