//! Canonical feature catalog: feature names, the raw item ids that feed them,
//! and the unit scale applied per item.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CREATININE: &str = "creatinine";

const CM_PER_INCH: f64 = 2.54;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    LabEvents,
    ChartEvents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDef {
    pub name: String,
    pub source: EventSource,
    pub item_ids: Vec<i64>,
    /// Subset of `item_ids` recorded in inches; converted to centimetres.
    pub inch_item_ids: Vec<i64>,
}

impl FeatureDef {
    pub fn new(name: &str, source: EventSource, item_ids: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            source,
            item_ids: item_ids.to_vec(),
            inch_item_ids: Vec::new(),
        }
    }

    pub fn with_inch_items(mut self, inch_item_ids: &[i64]) -> Self {
        self.inch_item_ids = inch_item_ids.to_vec();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemMapping {
    pub feature_index: usize,
    pub scale: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("feature catalog is empty")]
    Empty,
    #[error("feature {0} is defined more than once")]
    DuplicateFeature(String),
    #[error("item id {item_id} is mapped to both {first} and {second}")]
    DuplicateItemId {
        item_id: i64,
        first: String,
        second: String,
    },
    #[error("inch item id {item_id} is not listed among the item ids of {feature}")]
    StrayInchItemId { item_id: i64, feature: String },
    #[error("feature catalog has no creatinine feature")]
    MissingCreatinine,
}

#[derive(Debug, Clone)]
pub struct FeatureCatalog {
    features: Vec<FeatureDef>,
    by_item: HashMap<i64, ItemMapping>,
    creatinine_index: usize,
}

impl FeatureCatalog {
    pub fn new(features: Vec<FeatureDef>) -> Result<Self, CatalogError> {
        if features.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut names = HashSet::new();
        let mut by_item = HashMap::new();
        for (feature_index, def) in features.iter().enumerate() {
            if !names.insert(def.name.as_str()) {
                return Err(CatalogError::DuplicateFeature(def.name.clone()));
            }
            for inch_item in &def.inch_item_ids {
                if !def.item_ids.contains(inch_item) {
                    return Err(CatalogError::StrayInchItemId {
                        item_id: *inch_item,
                        feature: def.name.clone(),
                    });
                }
            }
            for item_id in &def.item_ids {
                let scale = if def.inch_item_ids.contains(item_id) {
                    CM_PER_INCH
                } else {
                    1.0
                };
                let mapping = ItemMapping {
                    feature_index,
                    scale,
                };
                if let Some(existing) = by_item.insert(*item_id, mapping) {
                    return Err(CatalogError::DuplicateItemId {
                        item_id: *item_id,
                        first: features[existing.feature_index].name.clone(),
                        second: def.name.clone(),
                    });
                }
            }
        }

        let creatinine_index = features
            .iter()
            .position(|def| def.name == CREATININE)
            .ok_or(CatalogError::MissingCreatinine)?;

        Ok(Self {
            features,
            by_item,
            creatinine_index,
        })
    }

    /// Lab and chart items used for the MIMIC-IV next-day AKI dataset.
    pub fn mimic_iv() -> Self {
        use EventSource::{ChartEvents, LabEvents};

        let features = vec![
            FeatureDef::new("bicarbonate", LabEvents, &[50882]),
            FeatureDef::new("chloride", LabEvents, &[50902]),
            FeatureDef::new(CREATININE, LabEvents, &[50912]),
            FeatureDef::new("glucose", LabEvents, &[50931]),
            FeatureDef::new("magnesium", LabEvents, &[50960]),
            FeatureDef::new("potassium", LabEvents, &[50822, 50971]),
            FeatureDef::new("sodium", LabEvents, &[50824, 50983]),
            FeatureDef::new("bun", LabEvents, &[51006]),
            FeatureDef::new("hemoglobin", LabEvents, &[51222]),
            FeatureDef::new("platelets", LabEvents, &[51265]),
            FeatureDef::new("wbcs", LabEvents, &[51300, 51301]),
            FeatureDef::new("height", ChartEvents, &[226707, 226730, 1394])
                .with_inch_items(&[226707, 1394]),
            FeatureDef::new("weight", ChartEvents, &[763, 224639]),
        ];

        Self::new(features).expect("built-in feature catalog is valid")
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[FeatureDef] {
        &self.features
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|def| def.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.features.iter().position(|def| def.name == name)
    }

    pub fn creatinine_index(&self) -> usize {
        self.creatinine_index
    }

    pub fn lookup(&self, item_id: i64) -> Option<ItemMapping> {
        self.by_item.get(&item_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mimic_iv_catalog_maps_every_item_once() {
        let catalog = FeatureCatalog::mimic_iv();
        assert_eq!(catalog.len(), 13);
        assert_eq!(catalog.feature_names()[catalog.creatinine_index()], "creatinine");

        let potassium = catalog.index_of("potassium").expect("potassium present");
        assert_eq!(catalog.lookup(50822).map(|m| m.feature_index), Some(potassium));
        assert_eq!(catalog.lookup(50971).map(|m| m.feature_index), Some(potassium));
        assert_eq!(catalog.lookup(99999), None);
    }

    #[test]
    fn only_inch_height_items_are_scaled() {
        let catalog = FeatureCatalog::mimic_iv();
        assert_eq!(catalog.lookup(1394).map(|m| m.scale), Some(2.54));
        assert_eq!(catalog.lookup(226707).map(|m| m.scale), Some(2.54));
        assert_eq!(catalog.lookup(226730).map(|m| m.scale), Some(1.0));
        assert_eq!(catalog.lookup(763).map(|m| m.scale), Some(1.0));
    }

    #[test]
    fn rejects_item_mapped_to_two_features() {
        let err = FeatureCatalog::new(vec![
            FeatureDef::new(CREATININE, EventSource::LabEvents, &[1]),
            FeatureDef::new("glucose", EventSource::LabEvents, &[1]),
        ])
        .expect_err("duplicate item must be rejected");

        assert_eq!(
            err,
            CatalogError::DuplicateItemId {
                item_id: 1,
                first: CREATININE.to_string(),
                second: "glucose".to_string(),
            }
        );
    }

    #[test]
    fn requires_creatinine_feature() {
        let err = FeatureCatalog::new(vec![FeatureDef::new(
            "glucose",
            EventSource::LabEvents,
            &[1],
        )])
        .expect_err("creatinine is mandatory");
        assert_eq!(err, CatalogError::MissingCreatinine);
    }
}
