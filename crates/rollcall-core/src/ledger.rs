//! Attendance ledger: exactly one record per person per run (or per day).
//!
//! Records are appended to a comma-separated text file without header:
//!
//! ```text
//! alice,08:59:12,2025-03-02
//! ```

use crate::clock::{Clock, SystemClock};
use crate::gallery::is_valid_person_id;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

const TIME_FORMAT: &str = "%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum LedgerError {
    /// The durable write failed. The person is still marked in memory and
    /// will not be retried for the rest of the run.
    #[error("attendance for {person_id} recorded in memory but not persisted: {source}")]
    Persistence {
        person_id: String,
        source: std::io::Error,
    },
    /// The id cannot be written as a single CSV field.
    #[error("person id {0:?} cannot be recorded")]
    InvalidPersonId(String),
    #[error("failed to read attendance log {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One persisted attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub person_id: String,
    pub time: NaiveTime,
    pub date: NaiveDate,
}

impl AttendanceRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{}",
            self.person_id,
            self.time.format(TIME_FORMAT),
            self.date.format(DATE_FORMAT)
        )
    }

    /// Parse one row. Anything other than three well-formed fields is rejected.
    pub fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
        let [person_id, time, date] = fields.as_slice() else {
            return None;
        };
        if person_id.is_empty() {
            return None;
        }
        Some(Self {
            person_id: person_id.to_string(),
            time: NaiveTime::parse_from_str(time, TIME_FORMAT).ok()?,
            date: NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?,
        })
    }
}

/// Durable, append-only destination for attendance records.
pub trait RecordSink {
    fn append(&mut self, record: &AttendanceRecord) -> std::io::Result<()>;
}

/// Appends one line per record to a text file, creating it on first write.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, record: &AttendanceRecord) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // Single write per line so a crash leaves at most one truncated row.
        file.write_all(format!("{}\n", record.to_line()).as_bytes())
    }
}

/// When the de-duplication set is cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    /// Only at engine start: a person is recorded once per process lifetime.
    #[default]
    PerRun,
    /// Also whenever the local date changes.
    Daily,
}

impl FromStr for ResetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-run" | "per_run" | "run" => Ok(ResetPolicy::PerRun),
            "daily" | "day" => Ok(ResetPolicy::Daily),
            other => Err(format!("unknown reset policy: {other}")),
        }
    }
}

/// In-memory de-duplication set plus durable sink.
///
/// Created empty; owned by the engine for the lifetime of a run.
pub struct AttendanceLedger<S: RecordSink = CsvSink> {
    marked: HashSet<String>,
    day: NaiveDate,
    policy: ResetPolicy,
    sink: S,
    clock: Arc<dyn Clock>,
}

impl AttendanceLedger<CsvSink> {
    /// Ledger writing to a CSV file, timestamped by the system clock.
    pub fn open(path: impl Into<PathBuf>, policy: ResetPolicy) -> Self {
        Self::with_clock(CsvSink::new(path), policy, Arc::new(SystemClock))
    }
}

impl<S: RecordSink> AttendanceLedger<S> {
    pub fn with_clock(sink: S, policy: ResetPolicy, clock: Arc<dyn Clock>) -> Self {
        let day = clock.local_now().date();
        Self {
            marked: HashSet::new(),
            day,
            policy,
            sink,
            clock,
        }
    }

    /// Record `person_id` as present.
    ///
    /// Returns `Ok(true)` if newly recorded and `Ok(false)` if already marked.
    /// Memory is updated before the durable write is attempted: on
    /// [`LedgerError::Persistence`] the person counts as marked and later
    /// calls return `Ok(false)`.
    pub fn mark(&mut self, person_id: &str) -> Result<bool, LedgerError> {
        if !is_valid_person_id(person_id) {
            return Err(LedgerError::InvalidPersonId(person_id.to_string()));
        }
        let now = self.clock.local_now();
        if self.policy == ResetPolicy::Daily && now.date() != self.day {
            tracing::info!(
                previous = %self.day,
                today = %now.date(),
                cleared = self.marked.len(),
                "date changed; attendance de-duplication reset"
            );
            self.marked.clear();
            self.day = now.date();
        }

        if !self.marked.insert(person_id.to_string()) {
            return Ok(false);
        }

        let record = AttendanceRecord {
            person_id: person_id.to_string(),
            time: now.time(),
            date: now.date(),
        };
        self.sink
            .append(&record)
            .map_err(|source| LedgerError::Persistence {
                person_id: person_id.to_string(),
                source,
            })?;

        tracing::info!(
            person = person_id,
            time = %record.time.format(TIME_FORMAT),
            "attendance marked"
        );
        Ok(true)
    }

    pub fn is_marked(&self, person_id: &str) -> bool {
        self.marked.contains(person_id)
    }

    /// Persons marked so far, sorted.
    pub fn marked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.marked.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn policy(&self) -> ResetPolicy {
        self.policy
    }
}

/// Read-side of the attendance file, used for reports.
pub struct AttendanceLog;

impl AttendanceLog {
    /// Read all well-formed records; malformed or truncated rows are skipped.
    /// A missing file is an empty report.
    pub fn read(path: &Path) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            match AttendanceRecord::parse_line(line) {
                Some(record) => records.push(record),
                None if line.trim().is_empty() => {}
                None => tracing::debug!(line = lineno + 1, "skipping malformed attendance row"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use std::time::Duration;

    struct FailingSink;

    impl RecordSink for FailingSink {
        fn append(&mut self, _record: &AttendanceRecord) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }
    }

    fn ledger_at(path: &Path, policy: ResetPolicy, clock: Arc<ManualClock>) -> AttendanceLedger {
        AttendanceLedger::with_clock(CsvSink::new(path), policy, clock)
    }

    #[test]
    fn test_mark_is_idempotent_within_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let clock = Arc::new(ManualClock::at("2025-03-02 08:59:12"));
        let mut ledger = ledger_at(&path, ResetPolicy::PerRun, clock);

        assert!(ledger.mark("alice").unwrap());
        assert!(!ledger.mark("alice").unwrap());
        assert!(!ledger.mark("alice").unwrap());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "alice,08:59:12,2025-03-02\n");
    }

    #[test]
    fn test_mark_distinct_persons_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let clock = Arc::new(ManualClock::at("2025-03-02 09:00:00"));
        let mut ledger = ledger_at(&path, ResetPolicy::PerRun, clock.clone());

        ledger.mark("bob").unwrap();
        clock.advance(Duration::from_secs(5));
        ledger.mark("alice").unwrap();

        let records = AttendanceLog::read(&path).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.person_id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "alice"]);
        assert_eq!(records[1].time.to_string(), "09:00:05");
        assert_eq!(ledger.marked(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_per_run_policy_ignores_date_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let clock = Arc::new(ManualClock::at("2025-03-02 23:59:00"));
        let mut ledger = ledger_at(&path, ResetPolicy::PerRun, clock.clone());

        assert!(ledger.mark("alice").unwrap());
        clock.advance(Duration::from_secs(120));
        assert!(!ledger.mark("alice").unwrap());
    }

    #[test]
    fn test_daily_policy_resets_on_new_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let clock = Arc::new(ManualClock::at("2025-03-02 23:59:00"));
        let mut ledger = ledger_at(&path, ResetPolicy::Daily, clock.clone());

        assert!(ledger.mark("alice").unwrap());
        clock.advance(Duration::from_secs(120));
        assert!(ledger.mark("alice").unwrap());

        let records = AttendanceLog::read(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].date.to_string(), "2025-03-03");
    }

    #[test]
    fn test_persistence_failure_still_marks_in_memory() {
        let clock = Arc::new(ManualClock::at("2025-03-02 10:00:00"));
        let mut ledger = AttendanceLedger::with_clock(FailingSink, ResetPolicy::PerRun, clock);

        let err = ledger.mark("alice").unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Persistence { ref person_id, .. } if person_id == "alice"
        ));
        assert!(ledger.is_marked("alice"));
        assert!(!ledger.mark("alice").unwrap());
    }

    #[test]
    fn test_mark_refuses_ids_that_would_break_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        let clock = Arc::new(ManualClock::at("2025-03-02 10:00:00"));
        let mut ledger = ledger_at(&path, ResetPolicy::PerRun, clock);

        for bad in ["Smith, John", "eve\nmallory,00:00:00,2025-01-01", ""] {
            assert!(matches!(ledger.mark(bad), Err(LedgerError::InvalidPersonId(_))));
            assert!(!ledger.is_marked(bad));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_read_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        std::fs::write(
            &path,
            "alice,08:00:00,2025-03-02\n\
             bob,08:01:00\n\
             \n\
             carol,08:02:00,2025-03-02,extra\n\
             dave,not-a-time,2025-03-02\n\
             erin,08:03:00,2025-03-02\r\n\
             frank,08:0",
        )
        .unwrap();

        let records = AttendanceLog::read(&path).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.person_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "erin"]);
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AttendanceLog::read(&dir.path().join("none.csv")).unwrap().is_empty());
    }

    #[test]
    fn test_reset_policy_from_str() {
        assert_eq!("daily".parse::<ResetPolicy>().unwrap(), ResetPolicy::Daily);
        assert_eq!("per-run".parse::<ResetPolicy>().unwrap(), ResetPolicy::PerRun);
        assert!("weekly".parse::<ResetPolicy>().is_err());
    }
}
