//! Units, chunks, and the executable sum type.
//!
//! A unit id is `SuiteName#test_name`. A chunk id is `{Suite}:chunk_{i}`;
//! an id is classified as a chunk iff it contains `:chunk_`. That
//! classification lives here and nowhere else.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Substring that marks an id as a chunk.
pub const CHUNK_MARKER: &str = ":chunk_";

/// Returns true when the id names a chunk rather than a single unit.
pub fn is_chunk_id(id: &str) -> bool {
    id.contains(CHUNK_MARKER)
}

/// Extracts the suite name from a unit id: everything before the first
/// `#`, further truncated before the first `::` when present.
pub fn suite_of(unit_id: &str) -> &str {
    let head = unit_id.split('#').next().unwrap_or(unit_id);
    head.split("::").next().unwrap_or(head)
}

/// One test, the atomic execution target. Created by the caller; immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
}

impl Unit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_location: None,
        }
    }

    pub fn with_location(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_location: Some(location.into()),
        }
    }

    pub fn suite(&self) -> &str {
        suite_of(&self.id)
    }
}

/// A named group of units from one suite, reserved and acknowledged as a
/// single id. Stored at `chunk:{id}` as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub suite_name: String,
    /// Estimated total duration of the members, in milliseconds.
    pub estimated_duration: f64,
    pub test_ids: Vec<String>,
    pub test_count: usize,
}

impl Chunk {
    pub fn new(
        suite_name: impl Into<String>,
        test_ids: Vec<String>,
        estimated_duration: f64,
    ) -> Self {
        let test_count = test_ids.len();
        Self {
            suite_name: suite_name.into(),
            estimated_duration,
            test_ids,
            test_count,
        }
    }

    /// Chunk ids are `{Suite}:chunk_{index}`.
    pub fn id_for(suite_name: &str, index: usize) -> String {
        format!("{suite_name}{CHUNK_MARKER}{index}")
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Either a single unit or a chunk of units, as resolved by a worker
/// after reserving an id.
#[derive(Debug, Clone)]
pub enum Executable {
    Test(Unit),
    Chunk {
        id: String,
        chunk: Chunk,
        /// Members hydrated from the worker's unit index, in chunk order.
        tests: Vec<Unit>,
    },
}

impl Executable {
    pub fn id(&self) -> &str {
        match self {
            Executable::Test(unit) => &unit.id,
            Executable::Chunk { id, .. } => id,
        }
    }

    pub fn unit_count(&self) -> usize {
        match self {
            Executable::Test(_) => 1,
            Executable::Chunk { tests, .. } => tests.len(),
        }
    }
}

/// Read-only index from unit id to unit, built once from the caller's
/// input list before the worker loop starts.
#[derive(Debug, Default)]
pub struct UnitIndex {
    by_id: HashMap<String, Unit>,
}

impl UnitIndex {
    pub fn new(units: &[Unit]) -> Self {
        let by_id = units
            .iter()
            .map(|unit| (unit.id.clone(), unit.clone()))
            .collect();
        Self { by_id }
    }

    pub fn get(&self, id: &str) -> Option<&Unit> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Hydrates a chunk record into an executable, skipping member ids the
    /// index does not know (they are logged by the caller).
    pub fn hydrate_chunk(&self, id: &str, chunk: Chunk) -> Executable {
        let tests = chunk
            .test_ids
            .iter()
            .filter_map(|test_id| self.by_id.get(test_id).cloned())
            .collect();
        Executable::Chunk {
            id: id.to_string(),
            chunk,
            tests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_classification_is_substring_based() {
        assert!(is_chunk_id("SuiteA:chunk_0"));
        assert!(is_chunk_id("Nested::SuiteB:chunk_12"));
        assert!(!is_chunk_id("SuiteA#test_one"));
        assert!(!is_chunk_id("SuiteA#chunk"));
    }

    #[test]
    fn suite_extraction_strips_test_and_nesting() {
        assert_eq!(suite_of("SuiteA#test_one"), "SuiteA");
        assert_eq!(suite_of("Outer::Inner#test_two"), "Outer");
        assert_eq!(suite_of("NoSeparator"), "NoSeparator");
    }

    #[test]
    fn chunk_record_round_trips_as_json() {
        let chunk = Chunk::new(
            "SuiteY",
            vec!["SuiteY#a".to_string(), "SuiteY#b".to_string()],
            80_000.0,
        );
        let raw = chunk.to_json().unwrap();
        let back = Chunk::from_json(&raw).unwrap();
        assert_eq!(back, chunk);
        assert_eq!(back.test_count, 2);
    }

    #[test]
    fn chunk_id_format() {
        assert_eq!(Chunk::id_for("SuiteY", 3), "SuiteY:chunk_3");
        assert!(is_chunk_id(&Chunk::id_for("SuiteY", 3)));
    }

    #[test]
    fn index_hydrates_known_members_only() {
        let units = vec![Unit::new("S#a"), Unit::new("S#b")];
        let index = UnitIndex::new(&units);
        let chunk = Chunk::new(
            "S",
            vec!["S#a".to_string(), "S#missing".to_string(), "S#b".to_string()],
            0.0,
        );
        let exe = index.hydrate_chunk("S:chunk_0", chunk);
        match exe {
            Executable::Chunk { tests, .. } => {
                let ids: Vec<_> = tests.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(ids, vec!["S#a", "S#b"]);
            }
            Executable::Test(_) => panic!("expected chunk"),
        }
    }
}
