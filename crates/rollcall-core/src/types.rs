use serde::{Deserialize, Serialize};

/// Bounding box of a detected face, in pixels of the frame it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector (128-dimensional for the dlib encoder, but any fixed D works).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers are expected to compare embeddings of equal dimension; extra
    /// trailing components of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in a live frame. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub embedding: Embedding,
    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub region: Option<BoundingBox>,
}

impl Probe {
    pub fn new(embedding: Embedding) -> Self {
        Self {
            embedding,
            region: None,
        }
    }
}

/// One (person, embedding) pair of the flattened gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person_id: String,
    pub embedding: Embedding,
}

/// Result of classifying a probe against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchResult {
    /// Nearest gallery embedding is within tolerance.
    Identified { person_id: String, distance: f32 },
    /// Nothing within tolerance. `best_distance` is `None` when the gallery was empty.
    Unknown { best_distance: Option<f32> },
}

impl MatchResult {
    pub fn is_identified(&self) -> bool {
        matches!(self, MatchResult::Identified { .. })
    }

    pub fn person_id(&self) -> Option<&str> {
        match self {
            MatchResult::Identified { person_id, .. } => Some(person_id),
            MatchResult::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_identical() {
        let a = Embedding::new(vec![0.1, 0.2, 0.3]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_known_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_symmetric() {
        let a = Embedding::new(vec![1.0, -2.0, 0.5]);
        let b = Embedding::new(vec![-0.5, 1.0, 2.0]);
        assert_eq!(a.euclidean_distance(&b), b.euclidean_distance(&a));
    }

    #[test]
    fn test_probe_deserializes_helper_output() {
        let json = r#"{"embedding":[0.5,0.25],"box":{"x":1,"y":2,"width":30,"height":40}}"#;
        let probe: Probe = serde_json::from_str(json).unwrap();
        assert_eq!(probe.embedding.values, vec![0.5, 0.25]);
        assert_eq!(probe.region.unwrap().width, 30.0);
    }

    #[test]
    fn test_probe_without_box() {
        let probe: Probe = serde_json::from_str(r#"{"embedding":[1.0]}"#).unwrap();
        assert!(probe.region.is_none());
    }
}
