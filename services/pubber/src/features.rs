use std::collections::BTreeMap;

use udmi_schema::{FeatureEnumeration, FeatureStage};

const FEATURES: &[(&str, FeatureStage)] = &[
    ("enumeration", FeatureStage::Stable),
    ("enumeration.points", FeatureStage::Stable),
    ("enumeration.features", FeatureStage::Beta),
    ("enumeration.families", FeatureStage::Beta),
    ("discovery.scan", FeatureStage::Beta),
    ("blobset.endpoint", FeatureStage::Beta),
    ("system.mode.restart", FeatureStage::Stable),
    ("system.mode.shutdown", FeatureStage::Preview),
];

/// Capabilities reported by feature enumeration.
pub fn supported_features() -> BTreeMap<String, FeatureEnumeration> {
    FEATURES
        .iter()
        .map(|(name, stage)| ((*name).to_owned(), FeatureEnumeration { stage: *stage }))
        .collect()
}
