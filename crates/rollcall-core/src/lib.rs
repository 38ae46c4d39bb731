//! rollcall-core: Face matching and verification session engine.
//!
//! Holds the enrolled embedding gallery, classifies live probes by exact
//! nearest-neighbour search, records attendance once per person, and runs
//! the timed admin verification challenge. Face detection and encoding are
//! delegated to an external [`FaceExtractor`].

pub mod capture;
pub mod clock;
pub mod extractor;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod roster;
pub mod session;
pub mod types;

pub use capture::{
    run_attendance, AttendanceSummary, CancelToken, ExtractingSource, FrameSource, ProbeSource,
    SourceError, SourceGuard,
};
pub use clock::{Clock, SystemClock};
pub use extractor::{CommandExtractor, ExtractorError, FaceExtractor};
pub use gallery::{EnrollReport, Enrollment, Gallery, GalleryError, GallerySnapshot};
pub use ledger::{
    AttendanceLedger, AttendanceLog, AttendanceRecord, CsvSink, LedgerError, RecordSink,
    ResetPolicy,
};
pub use matcher::{classify, EuclideanMatcher, Matcher};
pub use roster::{RosterError, RosterStore};
pub use session::{
    start_verification_session, SessionError, SessionState, VerificationOutcome,
    VerificationSession,
};
pub use types::{BoundingBox, Embedding, GalleryEntry, MatchResult, Probe};

/// Default maximum Euclidean distance for a positive identification.
pub const DEFAULT_TOLERANCE: f32 = 0.5;
