//! Data models for the layer aggregator.
//!
//! This module contains the GeoJSON shapes exchanged with the API, the
//! decoded form of a per-commune partial result, and the report structures
//! built from a search session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Errors raised while decoding a partial result at ingestion.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not valid JSON.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object keyed by layer name.
    #[error("expected a JSON object keyed by layer, got {0}")]
    NotAnObject(&'static str),
}

/// A GeoJSON geometry object.
///
/// Fields are optional so that incomplete geometries survive decoding and can
/// be filtered out explicitly with [`Geometry::is_valid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Geometry type (`Point`, `Polygon`, `MultiPolygon`, ...).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Coordinate array, opaque to this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Value>,
    /// Any other member (`geometries`, `bbox`, `crs`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Geometry {
    /// A geometry can be drawn when it names its type and carries coordinates.
    ///
    /// `GeometryCollection` has no coordinates of its own and is accepted when
    /// it carries a `geometries` array instead.
    pub fn is_valid(&self) -> bool {
        match self.kind.as_deref() {
            None | Some("") => false,
            Some("GeometryCollection") => {
                self.coordinates.is_some()
                    || self.extra.get("geometries").is_some_and(Value::is_array)
            }
            Some(_) => self.coordinates.is_some(),
        }
    }
}

/// A GeoJSON feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Member `type`; `"Feature"` for well-formed input.
    #[serde(rename = "type")]
    pub kind: String,
    /// Geometry, `None` when absent or `null`.
    #[serde(default)]
    pub geometry: Option<Geometry>,
    /// Feature attributes shown in popups and reports. Kept as received:
    /// a non-object value does not make the feature undrawable.
    #[serde(default)]
    pub properties: Option<Value>,
    /// Any other member (`id`, `bbox`, ...), kept as received.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Feature {
    /// Decode one feature-like JSON value. Returns `None` for anything that
    /// isn't an object with a string `type`.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// True when this feature can be handed to a renderer.
    pub fn is_valid(&self) -> bool {
        self.kind == "Feature" && self.geometry.as_ref().is_some_and(Geometry::is_valid)
    }

    /// Look up a property value.
    #[allow(dead_code)] // Accessor for renderers and popups
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.as_ref().and_then(|p| p.as_object()?.get(name))
    }
}

/// Tag serialized as the `type` member of a feature collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    #[default]
    FeatureCollection,
}

/// A GeoJSON feature collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: CollectionKind,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    /// Wrap a list of features.
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: CollectionKind::FeatureCollection,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// The decoded shape of one value found under a layer key.
///
/// Raw JSON is sniffed exactly once, here, so the aggregator and report code
/// match on variants instead of re-checking `type` members.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerValue {
    /// `null`, `false`, `""`, `[]` or `{}`.
    Empty,
    /// `{"type": "FeatureCollection", "features": [...]}`.
    Collection(FeatureCollection),
    /// `{"type": "Feature", "geometry": {...}}`.
    Feature(Feature),
    /// A sequence whose first element is a feature with a geometry.
    Features(Vec<Feature>),
    /// A type-less object of named sub-values (urbanism zoning layers).
    Nested(Vec<(String, LayerValue)>),
    /// Any other shape; the string describes it for diagnostics.
    Unrecognized(String),
}

impl LayerValue {
    /// Decode a raw JSON value. Never fails.
    pub fn decode(value: &Value) -> Self {
        match value {
            Value::Null | Value::Bool(false) => LayerValue::Empty,
            Value::String(s) if s.is_empty() => LayerValue::Empty,
            Value::Array(items) if items.is_empty() => LayerValue::Empty,
            Value::Object(map) if map.is_empty() => LayerValue::Empty,
            Value::Array(items) => {
                if items.first().is_some_and(looks_like_feature) {
                    LayerValue::Features(decode_features(items))
                } else {
                    LayerValue::Unrecognized("array without a leading feature".to_string())
                }
            }
            Value::Object(map) => match map.get("type") {
                Some(Value::String(kind)) if kind == "FeatureCollection" => {
                    match map.get("features") {
                        Some(Value::Array(items)) => {
                            LayerValue::Collection(FeatureCollection::new(decode_features(items)))
                        }
                        _ => LayerValue::Unrecognized(
                            "FeatureCollection without a features array".to_string(),
                        ),
                    }
                }
                Some(Value::String(kind)) if kind == "Feature" => {
                    if !looks_like_feature(value) {
                        return LayerValue::Unrecognized("Feature without geometry".to_string());
                    }
                    match Feature::from_value(value) {
                        Some(feature) => LayerValue::Feature(feature),
                        None => LayerValue::Unrecognized("undecodable Feature".to_string()),
                    }
                }
                Some(other) => LayerValue::Unrecognized(format!("object of type {}", other)),
                None => LayerValue::Nested(
                    map.iter()
                        .map(|(k, v)| (k.clone(), LayerValue::decode(v)))
                        .collect(),
                ),
            },
            other => LayerValue::Unrecognized(json_type_name(other).to_string()),
        }
    }

    /// Number of features carried, before geometry validation.
    pub fn feature_count(&self) -> usize {
        match self {
            LayerValue::Collection(fc) => fc.len(),
            LayerValue::Feature(_) => 1,
            LayerValue::Features(features) => features.len(),
            LayerValue::Nested(children) => children.iter().map(|(_, v)| v.feature_count()).sum(),
            LayerValue::Empty | LayerValue::Unrecognized(_) => 0,
        }
    }
}

fn looks_like_feature(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("Feature")
        && value.get("geometry").is_some_and(|g| !g.is_null())
}

fn decode_features(items: &[Value]) -> Vec<Feature> {
    items
        .iter()
        .filter_map(|item| {
            let feature = Feature::from_value(item);
            if feature.is_none() {
                debug!("Skipping undecodable {} in feature list", json_type_name(item));
            }
            feature
        })
        .collect()
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One commune's worth of search output, as received from the API.
///
/// The raw object is kept untouched for report export; the decoded layers are
/// what the aggregator works on.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    raw: Map<String, Value>,
    layers: Vec<(String, LayerValue)>,
}

impl PartialResult {
    /// Decode a parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Object(raw) => {
                let layers = raw
                    .iter()
                    .map(|(key, value)| (key.clone(), LayerValue::decode(value)))
                    .collect();
                Ok(Self { raw, layers })
            }
            other => Err(DecodeError::NotAnObject(json_type_name(&other))),
        }
    }

    /// Decode a JSON-encoded result payload.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// The result exactly as received.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// Decoded layer values in key order of the payload.
    pub fn layers(&self) -> impl Iterator<Item = (&str, &LayerValue)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Decoded value of one layer key.
    pub fn layer(&self, key: &str) -> Option<&LayerValue> {
        self.layers.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Commune name, when the payload carries one.
    pub fn commune(&self) -> Option<&str> {
        self.raw
            .get("commune")
            .or_else(|| self.raw.get("nom"))
            .and_then(Value::as_str)
    }

    /// Error message of an API error object (`{"error": "..."}`).
    pub fn error(&self) -> Option<&str> {
        self.raw.get("error").and_then(Value::as_str)
    }
}

impl Serialize for PartialResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw().serialize(serializer)
    }
}

/// Rendering hint attached to each layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LayerStyle {
    /// Default style: stroked and filled shapes.
    Polygon {
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    /// Marker style for point layers (substations).
    Point {
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        glyph: Option<String>,
    },
}

impl LayerStyle {
    #[allow(dead_code)] // Renderer hint, reports use Display
    pub fn is_point(&self) -> bool {
        matches!(self, LayerStyle::Point { .. })
    }
}

impl fmt::Display for LayerStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerStyle::Polygon { .. } => write!(f, "Polygon"),
            LayerStyle::Point { .. } => write!(f, "Point"),
        }
    }
}

/// Counters shown in the info panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Number of partial results received.
    pub communes: usize,
    /// Features across all layers.
    pub objects: usize,
    /// Features under the `eleveurs` layer.
    pub eleveurs: usize,
}

/// One row of the per-commune results table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommuneRow {
    pub commune: String,
    pub rpg: usize,
    pub eleveurs: usize,
    pub objects: usize,
}

/// Per-layer line of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub key: String,
    pub label: String,
    pub style: LayerStyle,
    pub features: usize,
}

/// Metadata about a search report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Human readable description of the search ("Department 23").
    pub search: String,
    /// API base URL, or the replayed transcript path.
    pub source: String,
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
    /// Final status message sent by the stream, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Duration of the search in seconds.
    pub duration_seconds: f64,
}

/// Complete search report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: SessionSummary,
    pub communes: Vec<CommuneRow>,
    pub layers: Vec<LayerSummary>,
    /// The raw session, unmodified.
    pub data: Vec<PartialResult>,
}
