//! Enrolled embedding gallery.
//!
//! The gallery is an immutable, versioned snapshot shared behind an `Arc`.
//! Enroll and revoke build a new snapshot; scans that already hold the old one
//! are unaffected.

use crate::extractor::{ExtractorError, FaceExtractor};
use crate::matcher::classify;
use crate::types::{Embedding, GalleryEntry, MatchResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("embedding for {person_id} has dimension {actual}, gallery dimension is {expected}")]
    DimensionMismatch {
        person_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("extractor returned an empty embedding for {0}")]
    EmptyEmbedding(String),
    #[error("invalid person id: {0:?}")]
    InvalidPersonId(String),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
}

/// One person's enrollment images (one dataset directory).
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub person_id: String,
    pub images: Vec<PathBuf>,
}

impl Enrollment {
    /// Read one person's directory. Hidden files and subdirectories are ignored.
    pub fn from_dir(person_id: &str, dir: &Path) -> Result<Self, GalleryError> {
        validate_person_id(person_id)?;
        let images = list_sorted(dir)?
            .into_iter()
            .filter(|p| p.is_file())
            .collect();
        Ok(Self {
            person_id: person_id.to_string(),
            images,
        })
    }

    /// Scan a dataset root: one subdirectory per person, directory name = person id.
    pub fn scan(dataset_dir: &Path) -> Result<Vec<Self>, GalleryError> {
        let mut enrollments = Vec::new();
        for path in list_sorted(dataset_dir)? {
            if !path.is_dir() {
                continue;
            }
            let Some(person_id) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping non-UTF-8 dataset directory");
                continue;
            };
            if !is_valid_person_id(person_id) {
                tracing::warn!(
                    path = %path.display(),
                    "skipping dataset directory with an unusable person id"
                );
                continue;
            }
            enrollments.push(Self::from_dir(person_id, &path)?);
        }
        Ok(enrollments)
    }
}

/// Outcome of extracting one person's enrollment.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EnrollReport {
    pub person_id: String,
    pub images: usize,
    pub embeddings: usize,
}

impl EnrollReport {
    /// Registered, but can never be matched.
    pub fn is_unmatchable(&self) -> bool {
        self.embeddings == 0
    }
}

#[derive(Debug, Default)]
struct GalleryData {
    version: u64,
    dimension: Option<usize>,
    entries: Vec<GalleryEntry>,
    persons: Vec<String>,
}

/// Read-only view of the gallery taken at one point in time.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot(Arc<GalleryData>);

impl GallerySnapshot {
    pub fn version(&self) -> u64 {
        self.0.version
    }

    pub fn dimension(&self) -> Option<usize> {
        self.0.dimension
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.0.entries
    }

    pub fn size(&self) -> usize {
        self.0.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.entries.is_empty()
    }

    /// Enrolled person ids, including persons with no usable embedding.
    pub fn persons(&self) -> &[String] {
        &self.0.persons
    }

    pub fn is_enrolled(&self, person_id: &str) -> bool {
        self.0.persons.iter().any(|p| p == person_id)
    }

    /// Classify a probe against this snapshot.
    ///
    /// A probe whose dimension differs from the gallery's is never identified.
    pub fn classify(&self, probe: &Embedding, tolerance: f32) -> MatchResult {
        if let Some(dim) = self.0.dimension {
            if probe.dimension() != dim {
                tracing::debug!(
                    expected = dim,
                    actual = probe.dimension(),
                    "probe dimension mismatch"
                );
                return MatchResult::Unknown { best_distance: None };
            }
        }
        classify(probe, &self.0.entries, tolerance)
    }

    /// Subset of this snapshot containing only the given persons, in original order.
    pub fn restricted_to(&self, person_ids: &[String]) -> GallerySnapshot {
        let wanted: HashSet<&str> = person_ids.iter().map(String::as_str).collect();
        GallerySnapshot(Arc::new(GalleryData {
            version: self.0.version,
            dimension: self.0.dimension,
            entries: self
                .0
                .entries
                .iter()
                .filter(|e| wanted.contains(e.person_id.as_str()))
                .cloned()
                .collect(),
            persons: self
                .0
                .persons
                .iter()
                .filter(|p| wanted.contains(p.as_str()))
                .cloned()
                .collect(),
        }))
    }
}

/// Process-wide gallery owned by the engine.
#[derive(Debug, Default)]
pub struct Gallery {
    current: GallerySnapshot,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a gallery from already-extracted pairs.
    pub fn from_entries(
        entries: impl IntoIterator<Item = GalleryEntry>,
    ) -> Result<Self, GalleryError> {
        let mut data = GalleryData::default();
        for entry in entries {
            if !data.persons.contains(&entry.person_id) {
                data.persons.push(entry.person_id.clone());
            }
            push_entry(&mut data, entry)?;
        }
        Ok(Self {
            current: GallerySnapshot(Arc::new(data)),
        })
    }

    /// Extract every enrollment image and take the first embedding of each.
    ///
    /// Images yielding no face contribute nothing. Persons left with zero
    /// embeddings stay enrolled and are reported with a warning.
    pub fn load(
        enrollments: &[Enrollment],
        extractor: &mut dyn FaceExtractor,
    ) -> Result<Self, GalleryError> {
        let mut data = GalleryData::default();
        for enrollment in enrollments {
            let embeddings = extract_enrollment(enrollment, extractor)?;
            report_enrollment(&enrollment.person_id, enrollment.images.len(), embeddings.len());
            data.persons.push(enrollment.person_id.clone());
            for embedding in embeddings {
                push_entry(
                    &mut data,
                    GalleryEntry {
                        person_id: enrollment.person_id.clone(),
                        embedding,
                    },
                )?;
            }
        }

        tracing::info!(
            persons = data.persons.len(),
            embeddings = data.entries.len(),
            dimension = ?data.dimension,
            "gallery loaded"
        );
        Ok(Self {
            current: GallerySnapshot(Arc::new(data)),
        })
    }

    /// Scan `dataset_dir` and load it.
    pub fn load_dir(
        dataset_dir: &Path,
        extractor: &mut dyn FaceExtractor,
    ) -> Result<Self, GalleryError> {
        let enrollments = Enrollment::scan(dataset_dir)?;
        Self::load(&enrollments, extractor)
    }

    /// (Re-)enroll one person, replacing any entries they already had.
    pub fn enroll(
        &mut self,
        enrollment: &Enrollment,
        extractor: &mut dyn FaceExtractor,
    ) -> Result<EnrollReport, GalleryError> {
        validate_person_id(&enrollment.person_id)?;
        let embeddings = extract_enrollment(enrollment, extractor)?;

        let old = &self.current.0;
        let mut data = GalleryData {
            version: old.version + 1,
            dimension: None,
            entries: Vec::with_capacity(old.entries.len() + embeddings.len()),
            persons: old.persons.clone(),
        };
        let retained = old
            .entries
            .iter()
            .filter(|e| e.person_id != enrollment.person_id)
            .cloned();
        for entry in retained {
            push_entry(&mut data, entry)?;
        }
        let added = embeddings.len();
        for embedding in embeddings {
            push_entry(
                &mut data,
                GalleryEntry {
                    person_id: enrollment.person_id.clone(),
                    embedding,
                },
            )?;
        }
        if !data.persons.contains(&enrollment.person_id) {
            data.persons.push(enrollment.person_id.clone());
        }

        self.current = GallerySnapshot(Arc::new(data));
        report_enrollment(&enrollment.person_id, enrollment.images.len(), added);
        Ok(EnrollReport {
            person_id: enrollment.person_id.clone(),
            images: enrollment.images.len(),
            embeddings: added,
        })
    }

    /// Drop a person and all their embeddings. Returns the number of entries removed.
    pub fn revoke(&mut self, person_id: &str) -> usize {
        let old = &self.current.0;
        if !old.persons.iter().any(|p| p == person_id) {
            return 0;
        }
        let entries: Vec<GalleryEntry> = old
            .entries
            .iter()
            .filter(|e| e.person_id != person_id)
            .cloned()
            .collect();
        let removed = old.entries.len() - entries.len();
        let data = GalleryData {
            version: old.version + 1,
            dimension: if entries.is_empty() { None } else { old.dimension },
            entries,
            persons: old.persons.iter().filter(|p| *p != person_id).cloned().collect(),
        };
        self.current = GallerySnapshot(Arc::new(data));
        tracing::info!(person = person_id, removed, "person revoked from gallery");
        removed
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        self.current.clone()
    }

    pub fn size(&self) -> usize {
        self.current.size()
    }
}

fn push_entry(data: &mut GalleryData, entry: GalleryEntry) -> Result<(), GalleryError> {
    let actual = entry.embedding.dimension();
    if actual == 0 {
        return Err(GalleryError::EmptyEmbedding(entry.person_id));
    }
    match data.dimension {
        Some(expected) if expected != actual => {
            return Err(GalleryError::DimensionMismatch {
                person_id: entry.person_id,
                expected,
                actual,
            })
        }
        Some(_) => {}
        None => data.dimension = Some(actual),
    }
    data.entries.push(entry);
    Ok(())
}

fn extract_enrollment(
    enrollment: &Enrollment,
    extractor: &mut dyn FaceExtractor,
) -> Result<Vec<Embedding>, GalleryError> {
    let mut embeddings = Vec::new();
    for path in &enrollment.images {
        let image = match image::open(path) {
            Ok(img) => img.to_luma8(),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "skipping unreadable enrollment image"
                );
                continue;
            }
        };
        let probes = extractor.detect(&image)?;
        match probes.into_iter().next() {
            Some(probe) => embeddings.push(probe.embedding),
            None => {
                tracing::debug!(
                    person = %enrollment.person_id,
                    path = %path.display(),
                    "no face in enrollment image"
                )
            }
        }
    }
    Ok(embeddings)
}

fn report_enrollment(person_id: &str, images: usize, embeddings: usize) {
    if embeddings == 0 {
        tracing::warn!(
            person = person_id,
            images,
            "person enrolled with zero usable embeddings; they can never be matched"
        );
    } else {
        tracing::debug!(person = person_id, images, embeddings, "person enrolled");
    }
}

/// Ids become dataset directory names and CSV fields, so path separators,
/// commas, newlines and leading dots are refused.
pub(crate) fn is_valid_person_id(person_id: &str) -> bool {
    !(person_id.trim().is_empty()
        || person_id.contains(['/', '\\', '\n', ','])
        || person_id.starts_with('.'))
}

fn validate_person_id(person_id: &str) -> Result<(), GalleryError> {
    if !is_valid_person_id(person_id) {
        return Err(GalleryError::InvalidPersonId(person_id.to_string()));
    }
    Ok(())
}

/// Non-hidden directory entries, sorted by name for a deterministic gallery order.
fn list_sorted(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Probe;
    use image::GrayImage;

    /// Returns the image's mean brightness as a 2-d embedding; all-black images have no face.
    struct BrightnessExtractor;

    impl FaceExtractor for BrightnessExtractor {
        fn detect(&mut self, image: &GrayImage) -> Result<Vec<Probe>, ExtractorError> {
            let mean = image.pixels().map(|p| p.0[0] as f32).sum::<f32>() / image.len() as f32;
            if mean == 0.0 {
                return Ok(Vec::new());
            }
            Ok(vec![
                Probe::new(Embedding::new(vec![mean / 255.0, 1.0])),
                Probe::new(Embedding::new(vec![0.0, 0.0])),
            ])
        }
    }

    fn write_image(path: &Path, value: u8) {
        GrayImage::from_pixel(4, 4, image::Luma([value])).save(path).unwrap();
    }

    fn dataset() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let alice = dir.path().join("alice");
        let bob = dir.path().join("bob");
        let carol = dir.path().join("carol");
        for d in [&alice, &bob, &carol] {
            std::fs::create_dir(d).unwrap();
        }
        write_image(&alice.join("1_normal.png"), 255);
        write_image(&alice.join("2_smile.png"), 0);
        write_image(&bob.join("1_normal.png"), 51);
        write_image(&bob.join("2_left.png"), 102);
        write_image(&carol.join("1_normal.png"), 0);
        std::fs::write(bob.join("notes.txt"), "not an image").unwrap();
        std::fs::write(dir.path().join("attendance.csv"), "").unwrap();
        std::fs::create_dir(dir.path().join(".cache")).unwrap();
        dir
    }

    fn entry(person_id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            person_id: person_id.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_scan_lists_person_directories_only() {
        let dir = dataset();
        let enrollments = Enrollment::scan(dir.path()).unwrap();
        let ids: Vec<_> = enrollments.iter().map(|e| e.person_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
        assert_eq!(enrollments[1].images.len(), 3);
    }

    #[test]
    fn test_unusable_directory_name_is_skipped_not_fatal() {
        let dir = dataset();
        let odd = dir.path().join("Smith, John");
        std::fs::create_dir(&odd).unwrap();
        write_image(&odd.join("1_normal.png"), 200);

        let gallery = Gallery::load_dir(dir.path(), &mut BrightnessExtractor).unwrap();
        let snap = gallery.snapshot();
        assert_eq!(snap.persons(), ["alice", "bob", "carol"]);
        assert!(!snap.is_enrolled("Smith, John"));
    }

    #[test]
    fn test_load_takes_first_embedding_and_skips_faceless_images() {
        let dir = dataset();
        let gallery = Gallery::load_dir(dir.path(), &mut BrightnessExtractor).unwrap();
        let snap = gallery.snapshot();
        // alice: one usable image, bob: two, carol: none
        assert_eq!(snap.size(), 3);
        assert_eq!(snap.dimension(), Some(2));
        assert!(snap.entries().iter().all(|e| e.embedding.values[1] == 1.0));
        assert_eq!(snap.persons(), &["alice", "bob", "carol"]);
        assert!(snap.is_enrolled("carol"));
        assert!(!snap.entries().iter().any(|e| e.person_id == "carol"));
    }

    #[test]
    fn test_load_empty_dataset_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::load_dir(dir.path(), &mut BrightnessExtractor).unwrap();
        assert_eq!(gallery.size(), 0);
        let probe = Embedding::new(vec![0.5, 1.0]);
        assert_eq!(
            gallery.snapshot().classify(&probe, 0.5),
            MatchResult::Unknown { best_distance: None }
        );
    }

    #[test]
    fn test_load_missing_dataset_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Gallery::load_dir(&dir.path().join("missing"), &mut BrightnessExtractor);
        assert!(matches!(result, Err(GalleryError::Io { .. })));
    }

    #[test]
    fn test_enroll_replaces_person_and_bumps_version() {
        let dir = dataset();
        let mut gallery = Gallery::load_dir(dir.path(), &mut BrightnessExtractor).unwrap();
        let before = gallery.snapshot();

        std::fs::remove_file(dir.path().join("bob/2_left.png")).unwrap();
        let bob = Enrollment::from_dir("bob", &dir.path().join("bob")).unwrap();
        let report = gallery.enroll(&bob, &mut BrightnessExtractor).unwrap();

        assert_eq!(report.embeddings, 1);
        assert!(!report.is_unmatchable());
        assert_eq!(gallery.size(), 2);
        assert_eq!(gallery.snapshot().version(), before.version() + 1);
        // the old snapshot is untouched
        assert_eq!(before.size(), 3);
    }

    #[test]
    fn test_enroll_without_usable_images_is_reported() {
        let dir = dataset();
        let mut gallery = Gallery::new();
        let carol = Enrollment::from_dir("carol", &dir.path().join("carol")).unwrap();
        let report = gallery.enroll(&carol, &mut BrightnessExtractor).unwrap();
        assert!(report.is_unmatchable());
        assert!(gallery.snapshot().is_enrolled("carol"));
    }

    #[test]
    fn test_revoke_removes_entries_and_enrollment() {
        let mut gallery = Gallery::from_entries(vec![
            entry("a", vec![0.0, 1.0]),
            entry("b", vec![1.0, 0.0]),
            entry("a", vec![0.0, 0.9]),
        ])
        .unwrap();
        assert_eq!(gallery.revoke("a"), 2);
        assert_eq!(gallery.size(), 1);
        assert!(!gallery.snapshot().is_enrolled("a"));
        assert_eq!(gallery.revoke("nobody"), 0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let result = Gallery::from_entries(vec![entry("a", vec![0.0, 1.0]), entry("b", vec![1.0])]);
        assert!(matches!(
            result,
            Err(GalleryError::DimensionMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_probe_of_wrong_dimension_never_identified() {
        let gallery = Gallery::from_entries(vec![entry("a", vec![0.0, 0.0])]).unwrap();
        let probe = Embedding::new(vec![0.0]);
        assert!(!gallery.snapshot().classify(&probe, 10.0).is_identified());
    }

    #[test]
    fn test_restricted_to_keeps_order_and_members_only() {
        let gallery = Gallery::from_entries(vec![
            entry("admin1", vec![0.0, 1.0]),
            entry("staff", vec![1.0, 0.0]),
            entry("admin2", vec![1.0, 1.0]),
        ])
        .unwrap();
        let admins = gallery
            .snapshot()
            .restricted_to(&["admin2".to_string(), "admin1".to_string(), "ghost".to_string()]);
        let ids: Vec<_> = admins.entries().iter().map(|e| e.person_id.as_str()).collect();
        assert_eq!(ids, vec!["admin1", "admin2"]);
    }

    #[test]
    fn test_invalid_person_ids() {
        for bad in ["", "  ", "../etc", "a/b", "x,y", ".hidden"] {
            assert!(validate_person_id(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_person_id("Hedi Kamaran").is_ok());
    }
}
