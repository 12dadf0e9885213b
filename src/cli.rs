//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::{ArgGroup, Parser};
use std::path::PathBuf;

/// AgriMap - multi-layer geospatial lookups against the AgriWeb API
///
/// Streams a department search commune by commune, merges the partial
/// results into map layers, and writes a report.
///
/// Examples:
///   agrimap --department 23
///   agrimap --department 23 --culture PPH --min-area 10 --geojson layers.json
///   agrimap --commune Guéret --format json
///   agrimap --replay creuse.sse
///   agrimap --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(group(ArgGroup::new("source").args(["department", "commune", "replay"]).multiple(false)))]
pub struct Args {
    /// Department code to stream (e.g. 23, 2A, 974)
    #[arg(short, long, value_name = "CODE")]
    pub department: Option<String>,

    /// Commune name for a single-shot search
    #[arg(long, value_name = "NAME")]
    pub commune: Option<String>,

    /// Replay a recorded event-stream transcript instead of calling the API
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// AgriWeb server base URL
    #[arg(long, value_name = "URL", env = "AGRIMAP_API_URL")]
    pub api_url: Option<String>,

    /// Output file path for the report
    ///
    /// Defaults to the `general.output` config value.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Also write the merged map layers (GeoJSON per layer, plus styles)
    #[arg(long, value_name = "FILE")]
    pub geojson: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .agrimap.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Timeout for commune queries, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// RPG culture code filter
    #[arg(long, value_name = "CODE")]
    pub culture: Option<String>,

    /// Minimum parcel area (ha)
    #[arg(long, value_name = "HA")]
    pub min_area: Option<f64>,

    /// Maximum parcel area (ha)
    #[arg(long, value_name = "HA")]
    pub max_area: Option<f64>,

    /// Maximum distance to an HTA substation
    #[arg(long, value_name = "DIST")]
    pub ht_max_distance: Option<f64>,

    /// Maximum distance to a BT substation
    #[arg(long, value_name = "DIST")]
    pub bt_max_distance: Option<f64>,

    /// Radius for business (Sirene) lookups
    #[arg(long, value_name = "DIST")]
    pub sirene_radius: Option<f64>,

    /// Don't ask for livestock farmers
    #[arg(long)]
    pub no_eleveurs: bool,

    /// Network types to search (comma-separated)
    ///
    /// Example: --reseau-types HTA,BT
    #[arg(long, value_name = "TYPES", value_delimiter = ',')]
    pub reseau_types: Option<Vec<String>>,

    /// Generate a default .agrimap.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Where results come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchSource {
    Department(String),
    Commune(String),
    Replay(PathBuf),
}

impl SearchSource {
    /// Short description used in reports.
    pub fn describe(&self) -> String {
        match self {
            SearchSource::Department(code) => format!("Department {}", code),
            SearchSource::Commune(name) => format!("Commune {}", name),
            SearchSource::Replay(path) => format!("Replay of {}", path.display()),
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The selected result source. `None` only with --init-config.
    pub fn source(&self) -> Option<SearchSource> {
        if let Some(ref code) = self.department {
            Some(SearchSource::Department(code.trim().to_uppercase()))
        } else if let Some(ref name) = self.commune {
            Some(SearchSource::Commune(name.trim().to_string()))
        } else {
            self.replay.clone().map(SearchSource::Replay)
        }
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        match self.source() {
            None => {
                return Err("One of --department, --commune or --replay is required".to_string())
            }
            Some(SearchSource::Department(code)) => {
                if code.is_empty() || code.len() > 3 || !code.chars().all(|c| c.is_ascii_alphanumeric())
                {
                    return Err(format!("Invalid department code: '{}'", code));
                }
            }
            Some(SearchSource::Commune(name)) => {
                if name.is_empty() {
                    return Err("Commune name must not be empty".to_string());
                }
            }
            Some(SearchSource::Replay(path)) => {
                if !path.is_file() {
                    return Err(format!("Replay file does not exist: {}", path.display()));
                }
            }
        }

        if let Some(ref url) = self.api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("API URL must start with 'http://' or 'https://'".to_string());
            }
        }

        for (name, value) in [
            ("--min-area", self.min_area),
            ("--max-area", self.max_area),
            ("--ht-max-distance", self.ht_max_distance),
            ("--bt-max-distance", self.bt_max_distance),
            ("--sirene-radius", self.sirene_radius),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{} must be a non-negative number", name));
                }
            }
        }

        if let (Some(min), Some(max)) = (self.min_area, self.max_area) {
            if min > max {
                return Err("--min-area must not exceed --max-area".to_string());
            }
        }

        if let Some(ref types) = self.reseau_types {
            if types.iter().any(|t| t.trim().is_empty()) {
                return Err("--reseau-types must not contain empty entries".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `config_verbose` is the `general.verbose` value of the config file;
    /// `--quiet` wins over it.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            department: Some("23".to_string()),
            commune: None,
            replay: None,
            api_url: None,
            output: None,
            format: OutputFormat::Markdown,
            geojson: None,
            config: None,
            verbose: false,
            quiet: false,
            timeout: None,
            culture: None,
            min_area: None,
            max_area: None,
            ht_max_distance: None,
            bt_max_distance: None,
            sirene_radius: None,
            no_eleveurs: false,
            reseau_types: None,
            init_config: false,
        }
    }

    #[test]
    fn test_valid_department() {
        let mut args = make_args();
        assert!(args.validate().is_ok());

        args.department = Some("2a".to_string());
        assert_eq!(args.source(), Some(SearchSource::Department("2A".to_string())));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_department() {
        let mut args = make_args();
        args.department = Some("Creuse".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_requires_source() {
        let mut args = make_args();
        args.department = None;
        assert!(args.validate().is_err());

        args.init_config = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_missing_replay_file() {
        let mut args = make_args();
        args.department = None;
        args.replay = Some(PathBuf::from("/nonexistent/stream.sse"));
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_area_range() {
        let mut args = make_args();
        args.min_area = Some(20.0);
        args.max_area = Some(5.0);
        assert!(args.validate().is_err());

        args.max_area = Some(50.0);
        assert!(args.validate().is_ok());

        args.min_area = Some(-1.0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut args = make_args();
        args.api_url = Some("localhost:5000".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_parse_rejects_two_sources() {
        let parsed = Args::try_parse_from(["agrimap", "--department", "23", "--commune", "Guéret"]);
        assert!(parsed.is_err());

        let parsed = Args::try_parse_from(["agrimap", "--commune", "Guéret", "--reseau-types", "HTA,BT"]).unwrap();
        assert_eq!(parsed.reseau_types, Some(vec!["HTA".to_string(), "BT".to_string()]));
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(false), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(false), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(false), tracing::Level::ERROR);
    }

    #[test]
    fn test_log_level_from_config() {
        let mut args = make_args();
        assert_eq!(args.log_level(true), tracing::Level::DEBUG);

        args.quiet = true;
        assert_eq!(args.log_level(true), tracing::Level::ERROR);
    }
}
