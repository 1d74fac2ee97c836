//! Image catalog boundary.
//!
//! The job layer never touches image or detection tables itself. Task
//! adapters go through [`ImageCatalog`] for every read and persistence side
//! effect of a finished unit.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

pub type ImageId = i64;
pub type DetectionId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: ImageId,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<PathBuf>,
    pub classified: bool,
}

/// One box from the detection pipeline's per-image result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub label: Option<String>,
    #[serde(default)]
    pub pred_conf: f32,
    #[serde(default)]
    pub detection_conf: f32,
    #[serde(default)]
    pub bbox: Vec<f32>,
    #[serde(default)]
    pub source: Option<String>,
}

impl DetectionBox {
    /// The pipeline writes a label-less, empty box for images without
    /// animals.
    pub fn is_empty(&self) -> bool {
        self.label.is_none() || self.bbox.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub detection_id: DetectionId,
    pub image_id: ImageId,
    pub label: String,
    pub confidence: f32,
    pub bbox: Vec<f32>,
}

/// A re-identified animal and the detections attributed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Individual {
    pub name: String,
    pub detection_ids: Vec<DetectionId>,
}

pub trait ImageCatalog: Send + Sync {
    /// Records for the known IDs among `ids`, in request order. Unknown IDs
    /// are left out.
    fn images(&self, ids: &[ImageId]) -> Result<Vec<ImageRecord>, CatalogError>;

    fn register_import(&self, path: &Path, group: Option<&str>) -> Result<ImageId, CatalogError>;

    fn set_thumbnail(&self, id: ImageId, thumbnail: &Path) -> Result<(), CatalogError>;

    /// Replaces the detections of `id` and marks it classified.
    fn record_detections(
        &self,
        id: ImageId,
        boxes: &[DetectionBox],
    ) -> Result<Vec<DetectionRecord>, CatalogError>;

    /// Detections on `ids` labelled `species` (case-insensitive).
    fn detections_for(
        &self,
        ids: &[ImageId],
        species: &str,
    ) -> Result<Vec<DetectionRecord>, CatalogError>;

    fn record_individuals(
        &self,
        species: &str,
        individuals: &[Individual],
    ) -> Result<(), CatalogError>;
}

#[derive(Default)]
struct CatalogState {
    next_image_id: ImageId,
    next_detection_id: DetectionId,
    images: BTreeMap<ImageId, ImageRecord>,
    detections: BTreeMap<ImageId, Vec<DetectionRecord>>,
    individuals: HashMap<String, Vec<Individual>>,
}

/// Process-local catalog, used when no database is attached and in tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Catalog lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Catalog lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn image(&self, id: ImageId) -> Option<ImageRecord> {
        self.read().images.get(&id).cloned()
    }

    pub fn all_images(&self) -> Vec<ImageRecord> {
        self.read().images.values().cloned().collect()
    }

    pub fn individuals(&self, species: &str) -> Vec<Individual> {
        self.read()
            .individuals
            .get(&species.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

impl ImageCatalog for InMemoryCatalog {
    fn images(&self, ids: &[ImageId]) -> Result<Vec<ImageRecord>, CatalogError> {
        let state = self.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.images.get(id).cloned())
            .collect())
    }

    fn register_import(&self, path: &Path, group: Option<&str>) -> Result<ImageId, CatalogError> {
        let mut state = self.write();
        state.next_image_id += 1;
        let id = state.next_image_id;
        state.images.insert(
            id,
            ImageRecord {
                id,
                path: path.to_path_buf(),
                group: group.map(str::to_string),
                thumbnail: None,
                classified: false,
            },
        );
        Ok(id)
    }

    fn set_thumbnail(&self, id: ImageId, thumbnail: &Path) -> Result<(), CatalogError> {
        let mut state = self.write();
        let image = state
            .images
            .get_mut(&id)
            .ok_or(CatalogError::UnknownImage(id))?;
        image.thumbnail = Some(thumbnail.to_path_buf());
        Ok(())
    }

    fn record_detections(
        &self,
        id: ImageId,
        boxes: &[DetectionBox],
    ) -> Result<Vec<DetectionRecord>, CatalogError> {
        let mut state = self.write();
        if !state.images.contains_key(&id) {
            return Err(CatalogError::UnknownImage(id));
        }

        let mut records = Vec::new();
        for detection in boxes.iter().filter(|b| !b.is_empty()) {
            state.next_detection_id += 1;
            records.push(DetectionRecord {
                detection_id: state.next_detection_id,
                image_id: id,
                label: detection.label.clone().unwrap_or_default(),
                confidence: detection.pred_conf,
                bbox: detection.bbox.clone(),
            });
        }
        state.detections.insert(id, records.clone());
        if let Some(image) = state.images.get_mut(&id) {
            image.classified = true;
        }
        Ok(records)
    }

    fn detections_for(
        &self,
        ids: &[ImageId],
        species: &str,
    ) -> Result<Vec<DetectionRecord>, CatalogError> {
        let state = self.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.detections.get(id))
            .flatten()
            .filter(|d| d.label.eq_ignore_ascii_case(species))
            .cloned()
            .collect())
    }

    fn record_individuals(
        &self,
        species: &str,
        individuals: &[Individual],
    ) -> Result<(), CatalogError> {
        self.write()
            .individuals
            .entry(species.to_lowercase())
            .or_default()
            .extend(individuals.iter().cloned());
        Ok(())
    }
}
