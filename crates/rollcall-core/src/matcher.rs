//! Nearest-neighbour classification of a probe against a gallery.

use crate::types::{Embedding, GalleryEntry, MatchResult};

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn classify(&self, probe: &Embedding, gallery: &[GalleryEntry], tolerance: f32) -> MatchResult;
}

/// Exact linear-scan matcher on Euclidean distance.
///
/// Every gallery entry is visited. The nearest entry decides acceptance, so a
/// person enrolled with several poses is matched by the closest pose only.
/// On equal distances the earlier entry wins. `best_distance: None` is
/// reserved for an empty gallery; if every distance is NaN (a probe or entry
/// holding NaN), the result is `Unknown` with a NaN best distance.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn classify(&self, probe: &Embedding, gallery: &[GalleryEntry], tolerance: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let distance = probe.euclidean_distance(&entry.embedding);
            // Strict comparison keeps the first index on ties; NaN never wins.
            let closer = match best {
                None => !distance.is_nan(),
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance <= tolerance => MatchResult::Identified {
                person_id: gallery[idx].person_id.clone(),
                distance,
            },
            Some((_, distance)) => MatchResult::Unknown {
                best_distance: Some(distance),
            },
            None if gallery.is_empty() => MatchResult::Unknown {
                best_distance: None,
            },
            None => MatchResult::Unknown {
                best_distance: Some(f32::NAN),
            },
        }
    }
}

/// Classify `probe` with the default [`EuclideanMatcher`].
pub fn classify(probe: &Embedding, gallery: &[GalleryEntry], tolerance: f32) -> MatchResult {
    EuclideanMatcher.classify(probe, gallery, tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry(person_id: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            person_id: person_id.into(),
            embedding: Embedding::new(values),
        }
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.5)]
    #[case(10.0)]
    fn test_empty_gallery_is_unknown_without_distance(#[case] tolerance: f32) {
        let probe = Embedding::new(vec![0.3, 0.4]);
        assert_eq!(
            classify(&probe, &[], tolerance),
            MatchResult::Unknown { best_distance: None }
        );
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.5)]
    #[case(1.0)]
    fn test_exact_probe_identified_at_zero_distance(#[case] tolerance: f32) {
        let gallery = vec![entry("B", vec![1.0, 1.0]), entry("A", vec![0.2, 0.7])];
        let probe = Embedding::new(vec![0.2, 0.7]);
        assert_eq!(
            classify(&probe, &gallery, tolerance),
            MatchResult::Identified { person_id: "A".into(), distance: 0.0 }
        );
    }

    #[test]
    fn test_nearest_beyond_tolerance_reports_distance() {
        let gallery = vec![entry("A", vec![0.0, 0.0]), entry("B", vec![3.0, 4.0])];
        let probe = Embedding::new(vec![0.0, 1.0]);
        match classify(&probe, &gallery, 0.5) {
            MatchResult::Unknown { best_distance: Some(d) } => assert!((d - 1.0).abs() < 1e-6),
            other => panic!("expected Unknown with distance, got {other:?}"),
        }
    }

    #[test]
    fn test_closer_person_wins() {
        // probe is 0.6 from A and 0.3 from B
        let gallery = vec![entry("A", vec![0.6, 0.0]), entry("B", vec![0.0, 0.3])];
        let probe = Embedding::new(vec![0.0, 0.0]);
        match classify(&probe, &gallery, 0.5) {
            MatchResult::Identified { person_id, distance } => {
                assert_eq!(person_id, "B");
                assert!((distance - 0.3).abs() < 1e-6);
            }
            other => panic!("expected B, got {other:?}"),
        }
    }

    #[test]
    fn test_tie_keeps_first_inserted() {
        let gallery = vec![entry("first", vec![1.0, 0.0]), entry("second", vec![-1.0, 0.0])];
        let probe = Embedding::new(vec![0.0, 0.0]);
        assert_eq!(classify(&probe, &gallery, 2.0).person_id(), Some("first"));
    }

    #[test]
    fn test_multi_pose_nearest_pose_decides() {
        // A has two poses; one far, one near. B sits in between. Nearest entry is A's
        // second pose even though B is closer than A's first pose.
        let gallery = vec![
            entry("A", vec![5.0, 0.0]),
            entry("B", vec![0.4, 0.0]),
            entry("A", vec![0.1, 0.0]),
        ];
        let probe = Embedding::new(vec![0.0, 0.0]);
        assert_eq!(classify(&probe, &gallery, 0.5).person_id(), Some("A"));
    }

    #[test]
    fn test_distance_equal_to_tolerance_accepted() {
        let gallery = vec![entry("A", vec![0.5])];
        let probe = Embedding::new(vec![0.0]);
        assert!(classify(&probe, &gallery, 0.5).is_identified());
    }

    #[test]
    fn test_nan_distance_ignored() {
        let gallery = vec![entry("broken", vec![f32::NAN]), entry("ok", vec![0.1])];
        let probe = Embedding::new(vec![0.0]);
        assert_eq!(classify(&probe, &gallery, 0.5).person_id(), Some("ok"));
    }

    #[test]
    fn test_all_nan_gallery_is_not_reported_as_empty() {
        let gallery = vec![entry("broken", vec![f32::NAN])];
        let probe = Embedding::new(vec![0.0]);
        match classify(&probe, &gallery, 0.5) {
            MatchResult::Unknown { best_distance: Some(d) } => assert!(d.is_nan()),
            other => panic!("expected unknown with NaN distance, got {other:?}"),
        }
    }
}
