//! The frozen render input captured at enqueue time.
//!
//! A snapshot is denormalized by the enqueuer from current source state and
//! is immutable afterwards; workers render only from it and never re-fetch
//! source records. Unknown extra keys are tolerated so the enqueuer can
//! evolve the payload without breaking older workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("job metadata has no render_snapshot")]
    Missing,
    #[error("invalid render_snapshot: {0}")]
    Invalid(String),
}

/// Paper size for PDF exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperFormat {
    A4,
    Letter,
}

impl PaperFormat {
    /// Page dimensions in inches, portrait.
    pub fn dimensions_inches(&self) -> (f64, f64) {
        match self {
            PaperFormat::A4 => (8.27, 11.69),
            PaperFormat::Letter => (8.5, 11.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSnapshot {
    pub template_id: String,
    pub template_version: String,
    pub template_name: String,
    pub menu_data: MenuPayload,
    pub export_options: ExportOptions,
    pub snapshot_created_at: DateTime<Utc>,
    pub snapshot_version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuPayload {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub currency: Option<String>,
    pub items: Vec<MenuItem>,
    #[serde(default)]
    pub categories: Vec<MenuCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuCategory {
    pub name: String,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuItem {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<MenuModifier>,
    #[serde(default)]
    pub variants: Vec<MenuVariant>,
    /// Dietary indicators (vegetarian, gluten-free, spice level, ...).
    #[serde(default)]
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuModifier {
    pub name: String,
    #[serde(default)]
    pub price_delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuVariant {
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    pub format: PaperFormat,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default = "default_true")]
    pub include_images: bool,
    #[serde(default = "default_true")]
    pub include_prices: bool,
    /// Opaque template configuration bag, passed through untouched.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Extract the frozen render input from a job's metadata bag.
pub fn resolve_snapshot(metadata: &serde_json::Value) -> Result<RenderSnapshot, SnapshotError> {
    let raw = metadata.get("render_snapshot").ok_or(SnapshotError::Missing)?;
    serde_json::from_value(raw.clone()).map_err(|e| SnapshotError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_snapshot_json() -> serde_json::Value {
        json!({
            "template_id": "classic",
            "template_version": "3",
            "template_name": "Classic",
            "menu_data": {
                "id": "7b7c6f2e-97a5-4df0-9b6a-1f8f6f0f2a11",
                "name": "Trattoria Lucia",
                "currency": "EUR",
                "items": [
                    {
                        "name": "Margherita",
                        "description": "Tomato, mozzarella, basil",
                        "price": 9.5,
                        "category": "Pizza",
                        "indicators": ["vegetarian"]
                    },
                    {
                        "name": "House Red",
                        "price": 4.0,
                        "category": "Drinks",
                        "variants": [
                            {"name": "Glass", "price": 4.0},
                            {"name": "Bottle", "price": 18.0}
                        ]
                    }
                ],
                "categories": [
                    {"name": "Pizza", "sort_order": 0},
                    {"name": "Drinks", "sort_order": 1}
                ]
            },
            "export_options": {"format": "A4"},
            "snapshot_created_at": "2026-05-01T10:00:00Z",
            "snapshot_version": 1
        })
    }

    #[test]
    fn resolves_a_complete_snapshot() {
        let metadata = json!({"render_snapshot": sample_snapshot_json()});
        let snapshot = resolve_snapshot(&metadata).unwrap();

        assert_eq!(snapshot.template_id, "classic");
        assert_eq!(snapshot.menu_data.items.len(), 2);
        assert_eq!(snapshot.export_options.format, PaperFormat::A4);
        assert_eq!(snapshot.export_options.orientation, Orientation::Portrait);
        assert!(snapshot.export_options.include_prices);
    }

    #[test]
    fn missing_snapshot_key_is_reported() {
        let metadata = json!({"display_name": "My Menu"});
        assert!(matches!(
            resolve_snapshot(&metadata),
            Err(SnapshotError::Missing)
        ));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let mut raw = sample_snapshot_json();
        raw.as_object_mut().unwrap().remove("template_id");
        let metadata = json!({"render_snapshot": raw});

        let err = resolve_snapshot(&metadata).unwrap_err();
        assert!(err.to_string().contains("template_id"));
    }

    #[test]
    fn menu_without_items_array_is_invalid() {
        let mut raw = sample_snapshot_json();
        raw["menu_data"].as_object_mut().unwrap().remove("items");
        let metadata = json!({"render_snapshot": raw});

        assert!(matches!(
            resolve_snapshot(&metadata),
            Err(SnapshotError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_extra_keys_are_tolerated() {
        let mut raw = sample_snapshot_json();
        raw.as_object_mut()
            .unwrap()
            .insert("future_field".into(), json!({"nested": true}));
        let metadata = json!({"render_snapshot": raw});

        assert!(resolve_snapshot(&metadata).is_ok());
    }

    #[test]
    fn letter_format_parses() {
        let mut raw = sample_snapshot_json();
        raw["export_options"]["format"] = json!("Letter");
        raw["export_options"]["orientation"] = json!("landscape");
        let metadata = json!({"render_snapshot": raw});

        let snapshot = resolve_snapshot(&metadata).unwrap();
        assert_eq!(snapshot.export_options.format, PaperFormat::Letter);
        assert_eq!(snapshot.export_options.orientation, Orientation::Landscape);
    }
}
