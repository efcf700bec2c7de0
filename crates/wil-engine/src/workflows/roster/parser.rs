use serde::{Deserialize, Deserializer};
use std::io::Read;

use super::RosterDefect;
use crate::workflows::placements::{AdminPlacementStatus, PlacementId, ProgramId};

#[derive(Debug, Clone)]
pub(crate) struct RosterEntry {
    pub(crate) line: u64,
    pub(crate) placement_id: PlacementId,
    pub(crate) program_id: ProgramId,
    pub(crate) capacity: u32,
    pub(crate) status: AdminPlacementStatus,
}

/// Reads the roster export, keeping well-formed rows and recording one
/// defect per rejected row. The header row occupies line 1.
pub(crate) fn parse_roster<R: Read>(
    reader: R,
) -> Result<(Vec<RosterEntry>, Vec<RosterDefect>), csv::Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut entries = Vec::new();
    let mut defects = Vec::new();

    for (index, record) in csv_reader.deserialize::<RosterRow>().enumerate() {
        let line = index as u64 + 2;
        let row = match record {
            Ok(row) => row,
            Err(error) => {
                defects.push(RosterDefect {
                    line,
                    reason: format!("unreadable row: {error}"),
                });
                continue;
            }
        };

        match row.into_entry(line) {
            Ok(entry) => entries.push(entry),
            Err(reason) => defects.push(RosterDefect { line, reason }),
        }
    }

    Ok((entries, defects))
}

#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(rename = "Placement ID")]
    placement_id: String,
    #[serde(rename = "Program")]
    program: String,
    #[serde(rename = "Capacity")]
    capacity: String,
    #[serde(rename = "Status", default, deserialize_with = "empty_string_as_none")]
    status: Option<String>,
}

impl RosterRow {
    fn into_entry(self, line: u64) -> Result<RosterEntry, String> {
        if self.placement_id.is_empty() {
            return Err("placement id is empty".to_string());
        }
        if self.program.is_empty() {
            return Err("program is empty".to_string());
        }

        let capacity = self
            .capacity
            .parse::<u32>()
            .map_err(|_| format!("capacity '{}' is not a whole number", self.capacity))?;
        if capacity == 0 {
            return Err("capacity must be at least one seat".to_string());
        }

        let status = match self.status.as_deref() {
            None => AdminPlacementStatus::Active,
            Some(raw) => parse_status(raw)?,
        };

        Ok(RosterEntry {
            line,
            placement_id: PlacementId(self.placement_id),
            program_id: ProgramId(self.program),
            capacity,
            status,
        })
    }
}

fn parse_status(raw: &str) -> Result<AdminPlacementStatus, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "active" => Ok(AdminPlacementStatus::Active),
        "inactive" => Ok(AdminPlacementStatus::Inactive),
        "suspended" => Ok(AdminPlacementStatus::Suspended),
        "full" => Err("status 'full' is derived from the seat counter".to_string()),
        other => Err(format!("unknown status '{other}'")),
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    Ok(opt.filter(|value| !value.trim().is_empty()))
}
