//! Persistent store of test outcomes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use csv::{ReaderBuilder, WriterBuilder};
use tracing::{debug, info};

use crate::error::{Result, StationError};
use crate::screening::data::{OutcomeRecord, TestOutcome};

const HEADERS: [&str; 8] = [
    "test_id",
    "subject_id",
    "name",
    "badge",
    "department",
    "timestamp",
    "quantity_mg_l",
    "status",
];

pub trait ResultLedger: Send + Sync {
    /// Allocates the next test id. Ids handed out are never handed out again
    /// by the same ledger, even when no outcome is appended for them.
    fn next_test_id(&self) -> Result<u64>;

    fn append(&self, outcome: &TestOutcome) -> Result<()>;
}

struct LedgerState {
    highest_allocated: u64,
}

/// Results file in CSV form, one row per outcome
pub struct CsvLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl CsvLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_file(&path)?;
        info!("Result ledger at {}", path.display());
        Ok(Self { path, state: Mutex::new(LedgerState { highest_allocated: 0 }) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| StationError::LedgerUnavailable("ledger lock poisoned".into()))
    }

    /// Highest numeric test id already stored; rows without one are skipped
    fn stored_max_id(&self) -> Result<u64> {
        ensure_file(&self.path)?;
        let mut reader = ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        let mut max_id = 0;
        for row in reader.records() {
            let row = row?;
            if let Some(id) = row.get(0).and_then(|field| field.trim().parse::<u64>().ok()) {
                max_id = max_id.max(id);
            }
        }
        Ok(max_id)
    }
}

impl ResultLedger for CsvLedger {
    fn next_test_id(&self) -> Result<u64> {
        let mut state = self.lock()?;
        let next = self.stored_max_id()?.max(state.highest_allocated) + 1;
        state.highest_allocated = next;
        debug!("Allocated test id {}", next);
        Ok(next)
    }

    fn append(&self, outcome: &TestOutcome) -> Result<()> {
        let mut state = self.lock()?;
        ensure_file(&self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer.serialize(OutcomeRecord::from(outcome))?;
        writer.flush()?;
        state.highest_allocated = state.highest_allocated.max(outcome.test_id);

        info!(
            "Test {} saved: {:.3} {:?}",
            outcome.test_id, outcome.quantity, outcome.status
        );
        Ok(())
    }
}

/// Creates the results file with its header row when missing or empty
fn ensure_file(path: &Path) -> Result<()> {
    if path.exists() && fs::metadata(path)?.len() > 0 {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new().from_writer(File::create(path)?);
    writer.write_record(HEADERS)?;
    writer.flush()?;
    info!("Created results file {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::data::{Subject, TestStatus};
    use chrono::Local;
    use tempfile::TempDir;

    fn outcome(test_id: u64, status: TestStatus) -> TestOutcome {
        TestOutcome {
            test_id,
            subject: Subject {
                id: 7,
                name: "Ana".into(),
                badge: "123".into(),
                department: "QA".into(),
            },
            timestamp: Local::now(),
            quantity: 0.0,
            status,
        }
    }

    #[test]
    fn empty_ledger_starts_at_one() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        assert_eq!(ledger.next_test_id().unwrap(), 1);
    }

    #[test]
    fn ids_strictly_increase_without_appends() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let ids: Vec<u64> = (0..5).map(|_| ledger.next_test_id().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn next_id_follows_the_last_appended() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("results.csv")).unwrap();
        let id = ledger.next_test_id().unwrap();
        ledger.append(&outcome(id, TestStatus::Approved)).unwrap();
        assert_eq!(ledger.next_test_id().unwrap(), id + 1);
    }

    #[test]
    fn zero_byte_file_gets_a_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        File::create(&path).unwrap();
        {
            let ledger = CsvLedger::open(&path).unwrap();
            let id = ledger.next_test_id().unwrap();
            assert_eq!(id, 1);
            ledger.append(&outcome(id, TestStatus::Approved)).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&HEADERS.join(",")));
        let reopened = CsvLedger::open(&path).unwrap();
        assert_eq!(reopened.next_test_id().unwrap(), 2);
    }

    #[test]
    fn stored_maximum_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        {
            let ledger = CsvLedger::open(&path).unwrap();
            ledger.append(&outcome(41, TestStatus::Rejected)).unwrap();
        }
        let reopened = CsvLedger::open(&path).unwrap();
        assert_eq!(reopened.next_test_id().unwrap(), 42);
    }

    #[test]
    fn rows_without_numeric_ids_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(
            &path,
            "test_id,subject_id,name\nabc,1,x\n3,1,y\n\n  9 ,2,z\n",
        )
        .unwrap();
        let ledger = CsvLedger::open(&path).unwrap();
        assert_eq!(ledger.next_test_id().unwrap(), 10);
    }

    #[test]
    fn rows_are_written_under_the_header() {
        let dir = TempDir::new().unwrap();
        let ledger = CsvLedger::open(dir.path().join("data").join("results.csv")).unwrap();
        ledger.append(&outcome(1, TestStatus::Approved)).unwrap();

        let contents = fs::read_to_string(ledger.path()).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next(),
            Some("test_id,subject_id,name,badge,department,timestamp,quantity_mg_l,status")
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("1,7,Ana,123,QA,"));
        assert!(row.ends_with(",0.0,Approved"));
        assert_eq!(lines.next(), None);
    }
}
