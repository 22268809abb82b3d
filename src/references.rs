//! In-memory index of discovered image references.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::reference::ImageReference;

/// Where a reference token appears in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReferenceOccurrence {
    pub manifest_path: PathBuf,
    pub byte_offset: usize,
    pub byte_length: usize,
    /// Image name exactly as written, without tag or digest
    pub written_name: String,
}

/// Deduplicated references and every place each one was seen.
///
/// Built once after scanning and only read afterwards. Ordering is always by
/// first occurrence (manifest path, then byte offset), independent of the
/// order occurrences were registered in.
#[derive(Debug, Default)]
pub struct ReferenceRegistry {
    occurrences: HashMap<ImageReference, Vec<ReferenceOccurrence>>,
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, occurrence: ReferenceOccurrence, reference: ImageReference) {
        let list = self.occurrences.entry(reference).or_default();
        if let Err(pos) = list.binary_search(&occurrence) {
            list.insert(pos, occurrence);
        }
    }

    /// Unique references in first-seen order.
    pub fn all_references(&self) -> Vec<&ImageReference> {
        let mut refs: Vec<(&ReferenceOccurrence, &ImageReference)> = self
            .occurrences
            .iter()
            .filter_map(|(reference, list)| list.first().map(|first| (first, reference)))
            .collect();
        refs.sort();
        refs.into_iter().map(|(_, reference)| reference).collect()
    }

    /// Occurrences of `reference`, sorted by path then offset.
    pub fn occurrences_of(&self, reference: &ImageReference) -> &[ReferenceOccurrence] {
        self.occurrences
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every occurrence grouped by manifest, each group in ascending offset order.
    pub fn by_manifest(&self) -> BTreeMap<&Path, Vec<(&ReferenceOccurrence, &ImageReference)>> {
        let mut grouped: BTreeMap<&Path, Vec<(&ReferenceOccurrence, &ImageReference)>> =
            BTreeMap::new();
        for (reference, list) in &self.occurrences {
            for occurrence in list {
                grouped
                    .entry(occurrence.manifest_path.as_path())
                    .or_default()
                    .push((occurrence, reference));
            }
        }
        for group in grouped.values_mut() {
            group.sort_by_key(|(occurrence, _)| occurrence.byte_offset);
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occ(path: &str, offset: usize) -> ReferenceOccurrence {
        ReferenceOccurrence {
            manifest_path: PathBuf::from(path),
            byte_offset: offset,
            byte_length: 5,
            written_name: "nginx".to_string(),
        }
    }

    fn r(token: &str) -> ImageReference {
        ImageReference::parse(token).unwrap()
    }

    #[test]
    fn test_equivalent_tokens_deduplicate() {
        let mut registry = ReferenceRegistry::new();
        registry.register(occ("b.yaml", 10), r("nginx"));
        registry.register(occ("a.yaml", 40), r("docker.io/library/nginx:latest"));
        assert_eq!(registry.len(), 1);
        let occurrences = registry.occurrences_of(&r("nginx:latest"));
        assert_eq!(occurrences, &[occ("a.yaml", 40), occ("b.yaml", 10)]);
    }

    #[test]
    fn test_order_is_by_first_seen_path_then_offset() {
        let mut registry = ReferenceRegistry::new();
        registry.register(occ("b.yaml", 0), r("redis"));
        registry.register(occ("a.yaml", 90), r("postgres"));
        registry.register(occ("a.yaml", 12), r("nginx"));
        registry.register(occ("c.yaml", 0), r("nginx"));

        let order: Vec<String> = registry
            .all_references()
            .into_iter()
            .map(|reference| reference.repository.clone())
            .collect();
        assert_eq!(order, vec!["library/nginx", "library/postgres", "library/redis"]);
    }

    #[test]
    fn test_registering_same_occurrence_twice_is_a_no_op() {
        let mut registry = ReferenceRegistry::new();
        registry.register(occ("a.yaml", 1), r("nginx"));
        registry.register(occ("a.yaml", 1), r("nginx"));
        assert_eq!(registry.occurrences_of(&r("nginx")).len(), 1);
    }

    #[test]
    fn test_by_manifest_groups_in_offset_order() {
        let mut registry = ReferenceRegistry::new();
        registry.register(occ("a.yaml", 50), r("redis"));
        registry.register(occ("a.yaml", 5), r("nginx"));
        registry.register(occ("b.yaml", 0), r("nginx"));

        let grouped = registry.by_manifest();
        let a = &grouped[Path::new("a.yaml")];
        assert_eq!(a[0].0.byte_offset, 5);
        assert_eq!(a[1].0.byte_offset, 50);
        assert_eq!(grouped[Path::new("b.yaml")].len(), 1);
    }

    #[test]
    fn test_unknown_reference_has_no_occurrences() {
        let registry = ReferenceRegistry::new();
        assert!(registry.occurrences_of(&r("nginx")).is_empty());
        assert!(registry.is_empty());
    }
}
