//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.agrimap.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".agrimap.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// API endpoint settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Default search parameters.
    #[serde(default)]
    pub search: SearchConfig,

    /// Layer vocabulary and special cases.
    #[serde(default)]
    pub layers: LayersConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "agrimap_report.md".to_string()
}

/// AgriWeb API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the AgriWeb server.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for single-shot queries, in seconds. Streams have none.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Connection timeout, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

/// Search parameter defaults, sent as query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// RPG culture code filter (empty for all).
    #[serde(default)]
    pub culture: String,

    /// Minimum parcel area in hectares.
    #[serde(default)]
    pub min_area_ha: f64,

    /// Maximum parcel area in hectares.
    #[serde(default = "default_max_area")]
    pub max_area_ha: f64,

    /// Maximum distance to an HTA substation.
    #[serde(default = "default_network_distance")]
    pub ht_max_distance: f64,

    /// Maximum distance to a BT substation.
    #[serde(default = "default_network_distance")]
    pub bt_max_distance: f64,

    /// Radius for business (Sirene) lookups.
    #[serde(default = "default_sirene_radius")]
    pub sirene_radius: f64,

    /// Ask the server for livestock farmers.
    #[serde(default = "default_true")]
    pub want_eleveurs: bool,

    /// Network types to search (`HTA`, `BT`).
    #[serde(default = "default_reseau_types")]
    pub reseau_types: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            culture: String::new(),
            min_area_ha: 0.0,
            max_area_ha: default_max_area(),
            ht_max_distance: default_network_distance(),
            bt_max_distance: default_network_distance(),
            sirene_radius: default_sirene_radius(),
            want_eleveurs: true,
            reseau_types: default_reseau_types(),
        }
    }
}

fn default_max_area() -> f64 {
    99999.0
}

fn default_network_distance() -> f64 {
    10.0
}

fn default_sirene_radius() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_reseau_types() -> Vec<String> {
    vec!["HTA".to_string(), "BT".to_string()]
}

/// One entry of the known layer vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Key used in result payloads.
    pub key: String,
    /// Display label.
    pub label: String,
    /// Stroke/marker color.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Render as markers instead of shapes.
    #[serde(default)]
    pub point: bool,
    /// Marker glyph for point layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glyph: Option<String>,
}

impl LayerSpec {
    fn polygon(key: &str, label: &str, color: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            color: Some(color.to_string()),
            point: false,
            glyph: None,
        }
    }

    fn point(key: &str, label: &str, color: &str, glyph: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            color: Some(color.to_string()),
            point: true,
            glyph: Some(glyph.to_string()),
        }
    }
}

/// Layer vocabulary and special-case keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayersConfig {
    /// Key whose value holds independent named sub-collections.
    #[serde(default = "default_composite_key")]
    pub composite_key: String,

    /// Label prefix for sub-layers of the composite key.
    #[serde(default = "default_composite_label")]
    pub composite_label: String,

    /// Color of composite sub-layers.
    #[serde(default = "default_composite_color")]
    pub composite_color: String,

    /// Known layers, always present in the merged state.
    #[serde(default = "default_catalog")]
    pub catalog: Vec<LayerSpec>,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            composite_key: default_composite_key(),
            composite_label: default_composite_label(),
            composite_color: default_composite_color(),
            catalog: default_catalog(),
        }
    }
}

fn default_composite_key() -> String {
    "api_urbanisme".to_string()
}

fn default_composite_label() -> String {
    "Urbanisme".to_string()
}

fn default_composite_color() -> String {
    "#2040C0".to_string()
}

fn default_catalog() -> Vec<LayerSpec> {
    vec![
        LayerSpec::polygon("rpg", "RPG Parcelles", "green"),
        LayerSpec::point("postes_bt", "Postes BT", "#FFD700", "⚡"),
        LayerSpec::point("postes_hta", "Postes HTA", "orange", "⚡⚡"),
        LayerSpec::polygon("capacites_reseau", "Capacités Réseau", "purple"),
        LayerSpec::polygon("eleveurs", "Éleveurs", "purple"),
        LayerSpec::polygon("parcelles", "Parcelles", "blue"),
        LayerSpec::polygon("api_cadastre", "Cadastre (API IGN)", "#FF6600"),
        LayerSpec::polygon("api_nature", "Nature (API IGN)", "#22AA22"),
        LayerSpec::polygon("plu", "PLU", "#880000"),
        LayerSpec::polygon("parkings", "Parkings", "darkgreen"),
        LayerSpec::polygon("friches", "Friches", "brown"),
        LayerSpec::polygon("solaire", "Potentiel Solaire", "gold"),
        LayerSpec::polygon("zaer", "ZAER", "cyan"),
        LayerSpec::polygon("sirene", "Entreprises Sirene", "darkred"),
    ]
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        Self::load_from_dir(Path::new("."))
    }

    /// Try to load `.agrimap.toml` from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            Ok(Some(Self::load(&config_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings; only values
    /// given explicitly on the command line override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref url) = args.api_url {
            self.api.base_url = url.clone();
        }
        if let Some(timeout) = args.timeout {
            self.api.timeout_seconds = timeout;
        }

        if let Some(ref culture) = args.culture {
            self.search.culture = culture.clone();
        }
        if let Some(min) = args.min_area {
            self.search.min_area_ha = min;
        }
        if let Some(max) = args.max_area {
            self.search.max_area_ha = max;
        }
        if let Some(ht) = args.ht_max_distance {
            self.search.ht_max_distance = ht;
        }
        if let Some(bt) = args.bt_max_distance {
            self.search.bt_max_distance = bt;
        }
        if let Some(radius) = args.sirene_radius {
            self.search.sirene_radius = radius;
        }
        if let Some(ref types) = args.reseau_types {
            self.search.reseau_types = types.iter().map(|t| t.trim().to_uppercase()).collect();
        }
        if args.no_eleveurs {
            self.search.want_eleveurs = false;
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api.base_url, "http://127.0.0.1:5000");
        assert_eq!(config.layers.composite_key, "api_urbanisme");
        assert_eq!(config.layers.catalog.len(), 14);
        assert_eq!(config.search.reseau_types, vec!["HTA", "BT"]);

        let points: Vec<_> = config
            .layers
            .catalog
            .iter()
            .filter(|l| l.point)
            .map(|l| l.key.as_str())
            .collect();
        assert_eq!(points, vec!["postes_bt", "postes_hta"]);
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output = "creuse.md"

[api]
base_url = "https://agriweb.example.org"

[search]
culture = "PPH"
min_area_ha = 10.0

[layers]
composite_key = "zonage"

[[layers.catalog]]
key = "rpg"
label = "Parcelles RPG"

[[layers.catalog]]
key = "postes_bt"
label = "BT"
point = true
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output, "creuse.md");
        assert_eq!(config.api.base_url, "https://agriweb.example.org");
        assert_eq!(config.api.timeout_seconds, 120);
        assert_eq!(config.search.culture, "PPH");
        assert_eq!(config.search.min_area_ha, 10.0);
        assert_eq!(config.search.max_area_ha, 99999.0);
        assert_eq!(config.layers.composite_key, "zonage");
        assert_eq!(config.layers.composite_label, "Urbanisme");
        assert_eq!(config.layers.catalog.len(), 2);
        assert!(config.layers.catalog[1].point);
        assert_eq!(config.layers.catalog[0].color, None);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[api]"));
        assert!(toml_str.contains("[search]"));
        assert!(toml_str.contains("postes_hta"));

        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.layers, LayersConfig::default());
        assert_eq!(reparsed.search, SearchConfig::default());
    }

    #[test]
    fn test_merge_with_args() {
        use clap::Parser;

        let args = crate::cli::Args::try_parse_from([
            "agrimap",
            "--department",
            "23",
            "--culture",
            "BTH",
            "--max-area",
            "50",
            "--no-eleveurs",
            "--reseau-types",
            "hta",
        ])
        .unwrap();

        let mut config = Config::default();
        config.search.min_area_ha = 3.0;
        config.merge_with_args(&args);

        assert_eq!(config.search.culture, "BTH");
        assert_eq!(config.search.max_area_ha, 50.0);
        assert_eq!(config.search.min_area_ha, 3.0);
        assert!(!config.search.want_eleveurs);
        assert_eq!(config.search.reseau_types, vec!["HTA"]);
        assert_eq!(config.api.timeout_seconds, 120);
    }

    #[test]
    fn test_load_from_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Config::load_from_dir(temp_dir.path()).unwrap().is_none());

        std::fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            "[api]\nbase_url = \"http://localhost:8080\"\n",
        )
        .unwrap();
        let config = Config::load_from_dir(temp_dir.path()).unwrap().unwrap();
        assert_eq!(config.api.base_url, "http://localhost:8080");

        std::fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "[api\n").unwrap();
        assert!(Config::load_from_dir(temp_dir.path()).is_err());
    }
}
