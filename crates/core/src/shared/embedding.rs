use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An L2-normalized appearance vector.
///
/// Construction always normalizes, so every stored value is unit length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Normalize `values` to unit length. `None` for empty, zero or non-finite input.
    pub fn normalized(mut values: Vec<f32>) -> Option<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        l2_normalize(&mut values);
        if (squared_norm(&values) - 1.0).abs() > UNIT_NORM_TOLERANCE {
            return None;
        }
        Some(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Cosine similarity in [-1, 1]; zero when dimensions disagree.
    pub fn cosine(&self, other: &Embedding) -> f64 {
        if self.0.len() != other.0.len() {
            return 0.0;
        }
        cosine_similarity(&self.0, &other.0).clamp(-1.0, 1.0)
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = String;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Embedding::normalized(values).ok_or_else(|| "embedding must be a non-zero finite vector".into())
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Self {
        e.0
    }
}

/// Scale `v` to unit length in place. Zero and non-finite input is left as is.
///
/// The norm is taken in `f64` after scaling by the largest magnitude, so
/// neither very small nor very large components underflow or overflow.
pub fn l2_normalize(v: &mut [f32]) {
    let max = v.iter().fold(0.0_f64, |m, x| m.max((*x as f64).abs()));
    if max == 0.0 || !max.is_finite() {
        return;
    }
    let norm = max * v.iter().map(|x| (*x as f64 / max).powi(2)).sum::<f64>().sqrt();
    for x in v.iter_mut() {
        *x = (*x as f64 / norm) as f32;
    }
}

const UNIT_NORM_TOLERANCE: f64 = 1e-3;

fn squared_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64).powi(2)).sum()
}

/// Dot product of L2-normalized vectors equals cosine similarity.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum()
}

/// One extractor's vector, tagged with the extractor version that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedEmbedding {
    pub version: String,
    pub vector: Embedding,
}

/// Named embedding slots, one per extractor. Slots are independently optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingSet(BTreeMap<String, TaggedEmbedding>);

impl EmbeddingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, extractor: &str, version: &str, vector: Embedding) {
        self.0.insert(
            extractor.to_string(),
            TaggedEmbedding {
                version: version.to_string(),
                vector,
            },
        );
    }

    pub fn get(&self, extractor: &str) -> Option<&TaggedEmbedding> {
        self.0.get(extractor)
    }

    /// The vector for `extractor`, only if it was built by `version`.
    pub fn current(&self, extractor: &str, version: &str) -> Option<&Embedding> {
        self.0
            .get(extractor)
            .filter(|t| t.version == version)
            .map(|t| &t.vector)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaggedEmbedding)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy slots from `other` that are missing here or held at a different version.
    ///
    /// Returns the number of slots written.
    pub fn fill_from(&mut self, other: &EmbeddingSet) -> usize {
        let mut written = 0;
        for (name, tagged) in &other.0 {
            let stale = self
                .0
                .get(name)
                .map_or(true, |existing| existing.version != tagged.version);
            if stale {
                self.0.insert(name.clone(), tagged.clone());
                written += 1;
            }
        }
        written
    }

    /// Copy slots from `other` only where this set has none.
    pub fn fill_missing(&mut self, other: &EmbeddingSet) -> usize {
        let mut written = 0;
        for (name, tagged) in &other.0 {
            if !self.0.contains_key(name) {
                self.0.insert(name.clone(), tagged.clone());
                written += 1;
            }
        }
        written
    }

    /// `name@version` pairs joined with `+`, e.g. `megadescriptor@1+dinov2@2`.
    pub fn extractor_tag(&self) -> String {
        self.0
            .iter()
            .map(|(name, t)| format!("{name}@{}", t.version))
            .collect::<Vec<_>>()
            .join("+")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::normalized(values.to_vec()).unwrap()
    }

    #[test]
    fn test_l2_normalize_unit_vector() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[rstest]
    #[case::tiny(1e-30)]
    #[case::subnormal(1e-40)]
    #[case::huge(1e20)]
    #[case::near_max(f32::MAX)]
    fn test_extreme_magnitudes_normalize_to_unit_length(#[case] value: f32) {
        let e = Embedding::normalized(vec![value, value]).unwrap();
        for x in e.as_slice() {
            assert_relative_eq!(*x, std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-6);
        }
        assert_relative_eq!(e.cosine(&e), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_normalized_is_unit_length() {
        let e = emb(&[1.0, 2.0, 2.0]);
        let norm: f32 = e.as_slice().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_rejects_degenerate_input() {
        assert!(Embedding::normalized(vec![]).is_none());
        assert!(Embedding::normalized(vec![0.0, 0.0]).is_none());
        assert!(Embedding::normalized(vec![f32::NAN, 1.0]).is_none());
    }

    #[test]
    fn test_cosine_identical() {
        let a = emb(&[0.6, 0.8]);
        assert_relative_eq!(a.cosine(&a), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert_relative_eq!(emb(&[1.0, 0.0]).cosine(&emb(&[0.0, 1.0])), 0.0);
    }

    #[test]
    fn test_cosine_opposite() {
        assert_relative_eq!(emb(&[1.0, 0.0]).cosine(&emb(&[-1.0, 0.0])), -1.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch_is_zero() {
        assert_relative_eq!(emb(&[1.0, 0.0]).cosine(&emb(&[1.0, 0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_deserialize_normalizes() {
        let e: Embedding = serde_json::from_str("[3.0, 4.0]").unwrap();
        assert!((e.as_slice()[0] - 0.6).abs() < 1e-6);
        assert!(serde_json::from_str::<Embedding>("[0.0]").is_err());
    }

    #[test]
    fn test_current_respects_version() {
        let mut set = EmbeddingSet::new();
        set.insert("reid", "2", emb(&[1.0, 0.0]));
        assert!(set.current("reid", "2").is_some());
        assert!(set.current("reid", "1").is_none());
        assert!(set.current("dino", "2").is_none());
    }

    #[test]
    fn test_fill_from_adds_missing_and_stale_slots_only() {
        let mut stored = EmbeddingSet::new();
        stored.insert("reid", "2", emb(&[1.0, 0.0]));
        stored.insert("dino", "1", emb(&[1.0, 0.0]));

        let mut fresh = EmbeddingSet::new();
        fresh.insert("reid", "2", emb(&[0.0, 1.0]));
        fresh.insert("dino", "2", emb(&[0.0, 1.0]));
        fresh.insert("clip", "1", emb(&[0.0, 1.0]));

        assert_eq!(stored.fill_from(&fresh), 2);
        // current-version slot untouched
        assert_relative_eq!(stored.get("reid").unwrap().vector.as_slice()[0], 1.0);
        assert_eq!(stored.get("dino").unwrap().version, "2");
        assert!(stored.get("clip").is_some());
    }

    #[test]
    fn test_fill_missing_never_replaces_existing_slots() {
        let mut stored = EmbeddingSet::new();
        stored.insert("reid", "2", emb(&[1.0, 0.0]));

        let mut other = EmbeddingSet::new();
        other.insert("reid", "1", emb(&[0.0, 1.0]));
        other.insert("dino", "1", emb(&[0.0, 1.0]));

        assert_eq!(stored.fill_missing(&other), 1);
        assert_eq!(stored.get("reid").unwrap().version, "2");
        assert_eq!(stored.get("dino").unwrap().version, "1");
    }

    #[test]
    fn test_extractor_tag_is_sorted_by_name() {
        let mut set = EmbeddingSet::new();
        set.insert("reid", "2", emb(&[1.0]));
        set.insert("dino", "1", emb(&[1.0]));
        assert_eq!(set.extractor_tag(), "dino@1+reid@2");
    }
}
