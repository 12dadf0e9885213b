//! Search report generation.
//!
//! Builds the info-panel counters and per-commune table from the raw session,
//! and renders Markdown, JSON and GeoJSON layer exports.

use crate::layers::{LayerState, SearchSession};
use crate::models::{
    CommuneRow, LayerSummary, PartialResult, Report, ReportMetadata, SessionSummary,
};
use anyhow::Result;
use serde_json::{Map, Value};

/// Counters for the info panel.
pub fn summarize_session(results: &[PartialResult]) -> SessionSummary {
    let mut summary = SessionSummary {
        communes: results.len(),
        ..SessionSummary::default()
    };

    for result in results {
        for (key, value) in result.layers() {
            let count = value.feature_count();
            summary.objects += count;
            if key == "eleveurs" {
                summary.eleveurs += count;
            }
        }
    }

    summary
}

/// One table row per received result, in arrival order.
pub fn commune_rows(results: &[PartialResult]) -> Vec<CommuneRow> {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let count = |key: &str| result.layer(key).map_or(0, |v| v.feature_count());
            CommuneRow {
                commune: result
                    .commune()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{}", i + 1)),
                rpg: count("rpg"),
                eleveurs: count("eleveurs"),
                objects: result.layers().map(|(_, v)| v.feature_count()).sum(),
            }
        })
        .collect()
}

/// Communes with the most objects, highest first.
pub fn top_communes(rows: &[CommuneRow], n: usize) -> Vec<&CommuneRow> {
    let mut sorted: Vec<_> = rows.iter().filter(|r| r.objects > 0).collect();
    sorted.sort_by_key(|r| std::cmp::Reverse(r.objects));
    sorted.truncate(n);
    sorted
}

/// Per-layer feature counts of the merged state.
pub fn layer_summaries(state: &LayerState) -> Vec<LayerSummary> {
    state
        .iter()
        .map(|layer| LayerSummary {
            key: layer.key.clone(),
            label: layer.label.clone(),
            style: layer.style.clone(),
            features: layer.collection.len(),
        })
        .collect()
}

/// Assemble a report from a finished (or interrupted) session.
pub fn build_report(metadata: ReportMetadata, session: &SearchSession) -> Report {
    let results = session.results();
    Report {
        metadata,
        summary: summarize_session(results),
        communes: commune_rows(results),
        layers: layer_summaries(session.layers()),
        data: results.to_vec(),
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# AgriMap Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.summary, &report.communes));
    output.push_str(&generate_communes_section(&report.communes));
    output.push_str(&generate_layers_section(&report.layers));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Search:** {}\n", metadata.search));
    section.push_str(&format!("- **Source:** {}\n", metadata.source));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(ref status) = metadata.status {
        section.push_str(&format!("- **Status:** {}\n", status));
    }
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_summary_section(summary: &SessionSummary, rows: &[CommuneRow]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| Communes | Objects | Éleveurs |\n");
    section.push_str("|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} |\n\n",
        summary.communes, summary.objects, summary.eleveurs
    ));

    let top = top_communes(rows, 5);
    if !top.is_empty() {
        section.push_str("### Communes with the Most Results\n\n");
        section.push_str("| Commune | Objects |\n");
        section.push_str("|:---|:---:|\n");
        for row in top {
            section.push_str(&format!("| {} | {} |\n", escape_cell(&row.commune), row.objects));
        }
        section.push('\n');
    }

    section
}

fn generate_communes_section(rows: &[CommuneRow]) -> String {
    let mut section = String::new();

    section.push_str("## Results by Commune\n\n");
    if rows.is_empty() {
        section.push_str("No commune results were received.\n\n");
        return section;
    }

    section.push_str("| Commune | RPG | Éleveurs | Objects |\n");
    section.push_str("|:---|:---:|:---:|:---:|\n");
    for row in rows {
        section.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            escape_cell(&row.commune),
            row.rpg,
            row.eleveurs,
            row.objects
        ));
    }
    section.push('\n');

    section
}

fn generate_layers_section(layers: &[LayerSummary]) -> String {
    let mut section = String::new();

    section.push_str("## Map Layers\n\n");
    let drawn: Vec<_> = layers.iter().filter(|l| l.features > 0).collect();
    if drawn.is_empty() {
        section.push_str("No layer has any feature to draw.\n\n");
        return section;
    }

    section.push_str("| Layer | Key | Style | Features |\n");
    section.push_str("|:---|:---|:---:|:---:|\n");
    for layer in &drawn {
        section.push_str(&format!(
            "| {} | `{}` | {} | {} |\n",
            escape_cell(&layer.label),
            escape_cell(&layer.key),
            layer.style,
            layer.features
        ));
    }

    let empty = layers.len() - drawn.len();
    if empty > 0 {
        section.push_str(&format!("\n*{} empty layer(s) not shown.*\n", empty));
    }
    section.push('\n');

    section
}

/// Keep a value from splitting a Markdown table cell.
fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn generate_footer() -> String {
    "---\n\n*Report generated by AgriMap*\n".to_string()
}

/// Generate a JSON report. The raw session is included under `data`.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Export merged layers and their rendering hints for a map renderer.
///
/// `layers` maps every key to a FeatureCollection; `styles` carries the
/// point/polygon hint of each key.
pub fn generate_layer_export(state: &LayerState) -> Result<String> {
    let mut styles = Map::new();
    for (key, style) in state.styles() {
        styles.insert(key.to_string(), serde_json::to_value(style)?);
    }

    let mut export = Map::new();
    export.insert("layers".to_string(), serde_json::to_value(state)?);
    export.insert("styles".to_string(), Value::Object(styles));

    serde_json::to_string_pretty(&Value::Object(export)).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::ResultAggregator;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn feature() -> Value {
        json!({"type": "Feature", "geometry": {"type": "Point", "coordinates": [1.87, 46.17]}})
    }

    fn session() -> SearchSession {
        let mut session = SearchSession::new(Arc::new(ResultAggregator::default()));
        session.push(
            PartialResult::from_value(json!({
                "commune": "Ajain",
                "rpg": [feature(), feature()],
                "eleveurs": {"type": "FeatureCollection", "features": [feature()]},
                "postes_bt": [feature()]
            }))
            .unwrap(),
        );
        session.push(
            PartialResult::from_value(json!({
                "commune": "Anzême",
                "rpg": [],
                "eleveurs": [feature(), feature(), feature()]
            }))
            .unwrap(),
        );
        session.push(PartialResult::from_value(json!({"lat": 46.2})).unwrap());
        session
    }

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            search: "Department 23".to_string(),
            source: "http://127.0.0.1:5000".to_string(),
            generated_at: Utc::now(),
            status: Some("Terminé".to_string()),
            duration_seconds: 12.5,
        }
    }

    #[test]
    fn test_summarize_session() {
        let session = session();
        let summary = summarize_session(session.results());

        assert_eq!(summary.communes, 3);
        assert_eq!(summary.objects, 7);
        assert_eq!(summary.eleveurs, 4);
    }

    #[test]
    fn test_commune_rows() {
        let session = session();
        let rows = commune_rows(session.results());

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].commune, "Ajain");
        assert_eq!(rows[0].rpg, 2);
        assert_eq!(rows[0].eleveurs, 1);
        assert_eq!(rows[0].objects, 4);
        assert_eq!(rows[1].commune, "Anzême");
        assert_eq!(rows[2].commune, "#3");

        let top = top_communes(&rows, 5);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].commune, "Ajain");
    }

    #[test]
    fn test_generate_markdown_report() {
        let session = session();
        let report = build_report(metadata(), &session);
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# AgriMap Report"));
        assert!(markdown.contains("Department 23"));
        assert!(markdown.contains("## Results by Commune"));
        assert!(markdown.contains("| Anzême | 0 | 3 | 3 |"));
        assert!(markdown.contains("| Postes BT | `postes_bt` | Point | 1 |"));
        assert!(markdown.contains("empty layer(s) not shown"));
    }

    #[test]
    fn test_generate_json_report_includes_raw_session() {
        let session = session();
        let report = build_report(metadata(), &session);
        let json: Value = serde_json::from_str(&generate_json_report(&report).unwrap()).unwrap();

        assert_eq!(json["summary"]["communes"], 3);
        assert_eq!(json["data"].as_array().unwrap().len(), 3);
        assert_eq!(json["data"][1]["commune"], "Anzême");
        assert_eq!(json["data"][2], json!({"lat": 46.2}));
    }

    #[test]
    fn test_generate_layer_export() {
        let session = session();
        let export: Value =
            serde_json::from_str(&generate_layer_export(session.layers()).unwrap()).unwrap();

        assert_eq!(export["layers"]["rpg"]["type"], "FeatureCollection");
        assert_eq!(export["layers"]["rpg"]["features"].as_array().unwrap().len(), 2);
        assert_eq!(export["layers"]["zaer"]["features"], json!([]));
        assert_eq!(export["styles"]["postes_hta"]["kind"], "point");
        assert_eq!(export["styles"]["rpg"]["kind"], "polygon");
    }

    #[test]
    fn test_markdown_cells_are_escaped() {
        let mut session = SearchSession::new(Arc::new(ResultAggregator::default()));
        session.push(
            PartialResult::from_value(json!({
                "commune": "Saint-Pierre | Est",
                "zones|bis": [feature()]
            }))
            .unwrap(),
        );
        let markdown = generate_markdown_report(&build_report(metadata(), &session));

        assert!(markdown.contains("| Saint-Pierre \\| Est | 0 | 0 | 1 |"));
        assert!(markdown.contains("| zones\\|bis | `zones\\|bis` | Polygon | 1 |"));
        assert_eq!(escape_cell("a|b\nc"), "a\\|b c");
    }

    #[test]
    fn test_empty_session_report() {
        let session = SearchSession::new(Arc::new(ResultAggregator::default()));
        let report = build_report(metadata(), &session);
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("No commune results were received."));
        assert!(markdown.contains("No layer has any feature to draw."));
    }
}
