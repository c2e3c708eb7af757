use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// One marketplace order as fetched for a run. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub order_id: u64,
    pub product_id: u64,
    pub quantity: u32,
    pub raw_offer_name: Option<String>,
    pub raw_vendor_code: Option<String>,
    pub raw_color_code: Option<String>,
}

impl Order {
    /// Display name the order itself carries, used when the catalog cannot help.
    pub fn fallback_name(&self) -> Option<&str> {
        [&self.raw_offer_name, &self.raw_vendor_code]
            .into_iter()
            .filter_map(|value| value.as_deref())
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    pub fn raw_color(&self) -> Option<&str> {
        self.raw_color_code
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Remote,
    OrderFallback,
    Synthetic,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Cache => "cache",
            ResolutionSource::Remote => "remote",
            ResolutionSource::OrderFallback => "order_fallback",
            ResolutionSource::Synthetic => "synthetic",
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            ResolutionSource::OrderFallback | ResolutionSource::Synthetic
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedProduct {
    pub product_id: u64,
    pub title: String,
    pub color: String,
    pub source: ResolutionSource,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub scope_id: String,
    pub product_id: u64,
    pub title: String,
    pub color: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub scope_id: String,
    pub day_key: String,
    pub supply_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub order_count: usize,
    pub report_text: Option<String>,
    pub status: RunStatus,
    pub error: Option<String>,
}

/// Candidate returned by a catalog text search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogCard {
    pub id: u64,
    pub title: String,
    pub attributes: Vec<CardAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardAttribute {
    pub name: String,
    pub values: Vec<String>,
}

impl CatalogCard {
    /// First listed value of the color characteristic, if any.
    pub fn color(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| is_color_attribute(&attr.name))
            .and_then(|attr| attr.values.first())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

fn is_color_attribute(name: &str) -> bool {
    matches!(name.trim().to_lowercase().as_str(), "цвет" | "color" | "colour")
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    AlreadyRan,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order {
            order_id: 1,
            product_id: 10,
            quantity: 1,
            raw_offer_name: Some("  ".into()),
            raw_vendor_code: Some("Redmi 12 Blue".into()),
            raw_color_code: Some(" ".into()),
        }
    }

    #[test]
    fn fallback_name_skips_blank_fields() {
        let order = order();
        assert_eq!(order.fallback_name(), Some("Redmi 12 Blue"));
        assert_eq!(order.raw_color(), None);
    }

    #[test]
    fn card_color_reads_first_value_of_color_characteristic() {
        let card = CatalogCard {
            id: 1,
            title: "Redmi 12".into(),
            attributes: vec![
                CardAttribute {
                    name: "Память".into(),
                    values: vec!["256".into()],
                },
                CardAttribute {
                    name: " Цвет ".into(),
                    values: vec!["белый".into(), "синий".into()],
                },
            ],
        };
        assert_eq!(card.color(), Some("белый"));
    }

    #[test]
    fn run_record_omits_empty_optionals() {
        let record = RunRecord {
            scope_id: "main".into(),
            day_key: "2026-10-16".into(),
            supply_id: None,
            created_at: Utc::now(),
            order_count: 0,
            report_text: None,
            status: RunStatus::Ok,
            error: None,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert!(json.get("supply_id").is_none());
        assert_eq!(json["status"], "ok");
    }
}
