//! Layer aggregation.
//!
//! Folds per-commune partial results into one feature collection per layer.
//! Every known layer is present in the output, features keep arrival order,
//! and malformed values or geometries are dropped rather than reported as
//! errors.

use crate::config::{LayerSpec, LayersConfig};
use crate::models::{Feature, FeatureCollection, LayerStyle, LayerValue, PartialResult};
use serde::ser::SerializeMap;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// One named layer of the merged state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer {
    /// Key in the result payloads (or `"<parent> – <sub>"` for composite sub-layers).
    pub key: String,
    /// Display label.
    pub label: String,
    /// Rendering hint.
    pub style: LayerStyle,
    /// Accumulated features.
    pub collection: FeatureCollection,
}

impl Layer {
    /// Whether a renderer should draw this layer at all.
    pub fn is_drawable(&self) -> bool {
        !self.collection.is_empty()
    }
}

/// Merged layers, keyed by layer key in order of first encounter.
///
/// Serializes as a JSON object mapping each key to its feature collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerState {
    layers: Vec<Layer>,
    index: HashMap<String, usize>,
}

impl LayerState {
    /// Feature collection of a layer.
    #[allow(dead_code)] // Lookup accessor for map renderers
    pub fn get(&self, key: &str) -> Option<&FeatureCollection> {
        self.layer(key).map(|l| &l.collection)
    }

    /// Full layer entry, including label and style.
    #[allow(dead_code)] // Lookup accessor for map renderers
    pub fn layer(&self, key: &str) -> Option<&Layer> {
        self.index.get(key).map(|&i| &self.layers[i])
    }

    /// All layers, empty ones included.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    /// Layers with at least one feature.
    pub fn drawable(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter(|l| l.is_drawable())
    }

    /// Layer keys in order.
    #[allow(dead_code)] // Utility accessor (serialization walks the layers directly)
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[allow(dead_code)] // Pairs with len()
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Total features across layers.
    pub fn feature_count(&self) -> usize {
        self.layers.iter().map(|l| l.collection.len()).sum()
    }

    /// Rendering hints keyed like the layers themselves.
    pub fn styles(&self) -> Vec<(&str, &LayerStyle)> {
        self.layers
            .iter()
            .map(|l| (l.key.as_str(), &l.style))
            .collect()
    }

    fn entry_or_insert_with(&mut self, key: &str, make: impl FnOnce() -> Layer) -> &mut Layer {
        let i = match self.index.get(key) {
            Some(&i) => i,
            None => {
                self.layers.push(make());
                let i = self.layers.len() - 1;
                self.index.insert(key.to_string(), i);
                i
            }
        };
        &mut self.layers[i]
    }
}

impl Serialize for LayerState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.layers.len()))?;
        for layer in &self.layers {
            map.serialize_entry(&layer.key, &layer.collection)?;
        }
        map.end()
    }
}

/// Normalize a decoded layer value into a feature collection.
///
/// Returns `None` when the value contributes nothing: empty values, empty
/// collections, and shapes that are not features. Never fails.
pub fn normalize(value: &LayerValue) -> Option<FeatureCollection> {
    feature_slice(value).map(|features| FeatureCollection::new(features.to_vec()))
}

fn feature_slice(value: &LayerValue) -> Option<&[Feature]> {
    match value {
        LayerValue::Collection(fc) if !fc.is_empty() => Some(&fc.features),
        LayerValue::Feature(feature) => Some(std::slice::from_ref(feature)),
        LayerValue::Features(features) if !features.is_empty() => Some(features),
        LayerValue::Unrecognized(shape) => {
            debug!("Ignoring unrecognized layer value: {}", shape);
            None
        }
        LayerValue::Nested(_) => {
            debug!("Ignoring nested layer value outside the composite key");
            None
        }
        LayerValue::Empty | LayerValue::Collection(_) | LayerValue::Features(_) => None,
    }
}

/// Append the renderable features of `incoming` to `collection`.
fn append_valid(collection: &mut FeatureCollection, incoming: FeatureCollection, key: &str) {
    let received = incoming.len();
    let before = collection.len();
    collection
        .features
        .extend(incoming.features.into_iter().filter(Feature::is_valid));

    let dropped = received - (collection.len() - before);
    if dropped > 0 {
        debug!(
            "Dropped {} feature(s) with incomplete geometry from layer {}",
            dropped, key
        );
    }
}

/// Merges partial results into a [`LayerState`].
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    catalog: Vec<LayerSpec>,
    by_key: HashMap<String, usize>,
    composite_key: String,
    composite_label: String,
    composite_color: String,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(&LayersConfig::default())
    }
}

impl ResultAggregator {
    /// Build an aggregator for a layer vocabulary.
    pub fn new(config: &LayersConfig) -> Self {
        let by_key = config
            .catalog
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.key.clone(), i))
            .collect();

        Self {
            catalog: config.catalog.clone(),
            by_key,
            composite_key: config.composite_key.clone(),
            composite_label: config.composite_label.clone(),
            composite_color: config.composite_color.clone(),
        }
    }

    /// A state holding an empty collection for every known layer.
    pub fn empty_state(&self) -> LayerState {
        let mut state = LayerState::default();
        for spec in &self.catalog {
            state.entry_or_insert_with(&spec.key, || self.new_layer(&spec.key));
        }
        state
    }

    /// Rendering hint for a top-level layer key.
    pub fn style_for(&self, key: &str) -> LayerStyle {
        match self.spec(key) {
            Some(spec) if spec.point => LayerStyle::Point {
                color: spec.color.clone(),
                glyph: spec.glyph.clone(),
            },
            Some(spec) => LayerStyle::Polygon {
                color: spec.color.clone(),
            },
            None => LayerStyle::Polygon { color: None },
        }
    }

    /// Display label for a top-level layer key; unknown keys use the key.
    pub fn label_for(&self, key: &str) -> String {
        self.spec(key)
            .map(|spec| spec.label.clone())
            .unwrap_or_else(|| key.to_string())
    }

    fn spec(&self, key: &str) -> Option<&LayerSpec> {
        self.by_key.get(key).map(|&i| &self.catalog[i])
    }

    fn new_layer(&self, key: &str) -> Layer {
        Layer {
            key: key.to_string(),
            label: self.label_for(key),
            style: self.style_for(key),
            collection: FeatureCollection::default(),
        }
    }

    /// Fold one result into an existing state, in place.
    ///
    /// Folding results one by one yields exactly what [`merge`](Self::merge)
    /// returns for the same sequence.
    pub fn fold(&self, state: &mut LayerState, result: &PartialResult) {
        for (key, value) in result.layers() {
            if key == self.composite_key {
                match value {
                    LayerValue::Nested(children) => {
                        self.fold_composite(state, key, children);
                        continue;
                    }
                    LayerValue::Empty => continue,
                    _ => {}
                }
            }

            let layer = state.entry_or_insert_with(key, || self.new_layer(key));
            if let Some(incoming) = normalize(value) {
                append_valid(&mut layer.collection, incoming, key);
            }
        }
    }

    fn fold_composite(&self, state: &mut LayerState, parent: &str, children: &[(String, LayerValue)]) {
        for (sub, value) in children {
            let Some(incoming) = normalize(value) else {
                continue;
            };
            if !incoming.features.iter().any(Feature::is_valid) {
                debug!("Skipping empty sub-layer {} of {}", sub, parent);
                continue;
            }

            let key = format!("{} – {}", parent, sub);
            let layer = state.entry_or_insert_with(&key, || Layer {
                key: key.clone(),
                label: format!("{} – {}", self.composite_label, sub.replace('-', " ")),
                style: LayerStyle::Polygon {
                    color: Some(self.composite_color.clone()),
                },
                collection: FeatureCollection::default(),
            });
            append_valid(&mut layer.collection, incoming, &key);
        }
    }

    /// Merge a whole sequence of results, in arrival order.
    pub fn merge(&self, results: &[PartialResult]) -> LayerState {
        let mut state = self.empty_state();
        for result in results {
            self.fold(&mut state, result);
        }
        state
    }
}
