//! Read-only registry of people who can be tested.

use std::path::Path;

use csv::ReaderBuilder;
use tracing::{info, warn};

use crate::error::Result;
use crate::screening::data::Subject;

#[derive(Debug, Default)]
pub struct SubjectDirectory {
    subjects: Vec<Subject>,
}

impl SubjectDirectory {
    /// Loads `id,name,badge,department` rows. A missing file is an empty directory.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Registration file {} not found, directory is empty", path.display());
            return Ok(Self::default());
        }

        let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
        let mut subjects = Vec::new();
        for row in reader.deserialize::<Subject>() {
            match row {
                Ok(subject) => subjects.push(subject),
                Err(e) => warn!("Skipping malformed registration row: {}", e),
            }
        }
        info!("Loaded {} registered subjects from {}", subjects.len(), path.display());
        Ok(Self { subjects })
    }

    pub fn lookup(&self, id: u32) -> Option<&Subject> {
        self.subjects.iter().find(|subject| subject.id == id)
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }
}
