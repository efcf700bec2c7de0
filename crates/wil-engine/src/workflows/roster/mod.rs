//! Placement roster import. Seeds placements from the operations team's CSV
//! export (`Placement ID, Program, Capacity, Status`); rejected rows are
//! reported with their line numbers instead of aborting the batch.

mod parser;

use std::io::Read;
use std::path::Path;

use tracing::info;

use crate::workflows::placements::{
    EnrollmentCoordinator, EventSink, PlacementAdminError, PlacementId, PlacementStore,
};

/// One rejected roster row and why it was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterDefect {
    pub line: u64,
    pub reason: String,
}

/// Outcome of a roster import run.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub created: Vec<PlacementId>,
    pub skipped: Vec<RosterDefect>,
}

pub struct PlacementRosterImporter;

impl PlacementRosterImporter {
    pub async fn from_path<S, E, P>(
        coordinator: &EnrollmentCoordinator<S, E>,
        path: P,
    ) -> Result<ImportReport, RosterImportError>
    where
        S: PlacementStore,
        E: EventSink,
        P: AsRef<Path>,
    {
        let file = std::fs::File::open(path)?;
        Self::from_reader(coordinator, file).await
    }

    pub async fn from_reader<S, E, R>(
        coordinator: &EnrollmentCoordinator<S, E>,
        reader: R,
    ) -> Result<ImportReport, RosterImportError>
    where
        S: PlacementStore,
        E: EventSink,
        R: Read,
    {
        let (entries, mut skipped) = parser::parse_roster(reader)?;

        let mut created = Vec::new();
        for entry in entries {
            let outcome = coordinator
                .create_placement(
                    entry.placement_id.clone(),
                    entry.program_id,
                    entry.capacity,
                    entry.status,
                )
                .await;
            match outcome {
                Ok(placement) => created.push(placement.id),
                Err(
                    error @ (PlacementAdminError::DuplicatePlacement(_)
                    | PlacementAdminError::InvalidCapacity { .. }),
                ) => {
                    skipped.push(RosterDefect {
                        line: entry.line,
                        reason: error.to_string(),
                    });
                }
                Err(other) => return Err(RosterImportError::Admin(other)),
            }
        }
        skipped.sort_by_key(|defect| defect.line);

        info!(
            created = created.len(),
            skipped = skipped.len(),
            "placement roster imported"
        );
        Ok(ImportReport { created, skipped })
    }
}

#[derive(Debug)]
pub enum RosterImportError {
    Io(std::io::Error),
    Csv(csv::Error),
    Admin(PlacementAdminError),
}

impl std::fmt::Display for RosterImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RosterImportError::Io(err) => write!(f, "failed to read roster export: {}", err),
            RosterImportError::Csv(err) => write!(f, "invalid roster CSV data: {}", err),
            RosterImportError::Admin(err) => {
                write!(f, "could not register roster placement: {}", err)
            }
        }
    }
}

impl std::error::Error for RosterImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RosterImportError::Io(err) => Some(err),
            RosterImportError::Csv(err) => Some(err),
            RosterImportError::Admin(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for RosterImportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<csv::Error> for RosterImportError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err)
    }
}

impl From<PlacementAdminError> for RosterImportError {
    fn from(err: PlacementAdminError) -> Self {
        Self::Admin(err)
    }
}
