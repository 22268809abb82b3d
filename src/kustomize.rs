//! Kustomization overlay generation.
//!
//! Instead of rewriting manifests, an overlay lets `kustomize` substitute
//! image names at deploy time via its `images:` transformer.

use serde::{Deserialize, Serialize};

use crate::pipeline::{Outcome, RehomingResults};
use crate::reference::ImageReference;
use crate::references::ReferenceRegistry;

const API_VERSION: &str = "kustomize.config.k8s.io/v1beta1";
const KIND: &str = "Kustomization";

/// An original image and where it now lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayPair {
    pub original: ImageReference,
    pub target: ImageReference,
    /// Distinct names the manifests use for `original`, in first-seen order
    pub written_names: Vec<String>,
}

/// Ordered image substitutions, in the registry's first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KustomizationOverlay {
    pub pairs: Vec<OverlayPair>,
}

/// On-disk `kustomization.yaml` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    pub api_version: String,
    pub kind: String,
    pub images: Vec<ImageOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    pub name: String,
    pub new_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Overlay for the references that were pushed.
///
/// With `include_pulled`, references that were only pulled (or pulled and
/// tagged) are included too, for dry runs that want to preview the overlay.
pub fn generate(
    registry: &ReferenceRegistry,
    results: &RehomingResults,
    include_pulled: bool,
) -> KustomizationOverlay {
    let pairs = registry
        .all_references()
        .into_iter()
        .filter_map(|reference| results.get(reference))
        .filter(|result| match result.outcome {
            Outcome::Pushed => true,
            Outcome::Pulled | Outcome::Tagged => include_pulled,
            Outcome::Failed => false,
        })
        .map(|result| OverlayPair {
            original: result.source.clone(),
            target: result.target.clone(),
            written_names: written_names(registry, &result.source),
        })
        .collect();
    KustomizationOverlay { pairs }
}

/// Overlay mapping every discovered reference onto `target_registry`,
/// without contacting any registry.
pub fn plan(registry: &ReferenceRegistry, target_registry: &str) -> KustomizationOverlay {
    let pairs = registry
        .all_references()
        .into_iter()
        .filter(|reference| reference.registry != target_registry)
        .map(|reference| OverlayPair {
            original: reference.clone(),
            target: reference.with_registry(target_registry),
            written_names: written_names(registry, reference),
        })
        .collect();
    KustomizationOverlay { pairs }
}

fn written_names(registry: &ReferenceRegistry, reference: &ImageReference) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for occurrence in registry.occurrences_of(reference) {
        if !names.contains(&occurrence.written_name) {
            names.push(occurrence.written_name.clone());
        }
    }
    if names.is_empty() {
        names.push(reference.name());
    }
    names
}

impl KustomizationOverlay {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// One `images` entry per name as written in the manifests.
    ///
    /// The transformer matches `name` literally, so `nginx` and
    /// `docker.io/library/nginx` need separate entries. A name shared by
    /// several references (`nginx:1.21` and `nginx:1.25`) only gets
    /// `newName`, leaving each tag as written.
    pub fn to_kustomization(&self) -> Kustomization {
        let mut images: Vec<ImageOverride> = Vec::new();
        for pair in &self.pairs {
            for name in &pair.written_names {
                match images.iter_mut().find(|image| &image.name == name) {
                    Some(shared) => {
                        shared.new_tag = None;
                        shared.digest = None;
                    }
                    None => images.push(ImageOverride {
                        name: name.clone(),
                        new_name: pair.target.name(),
                        new_tag: pair.target.tag.clone(),
                        digest: pair.target.digest.clone(),
                    }),
                }
            }
        }

        Kustomization {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            images,
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.to_kustomization())
    }
}
