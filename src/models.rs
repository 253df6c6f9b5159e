// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the stock subsystem: the product stock record the
// backend owns, the movement history rows, the derived views (variants,
// low-stock, KPIs) and the API envelopes.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// PRODUCT STOCK RECORD
// =============================================================================
// Owned by the backend. Only the stock procedures write these counters; this
// service reads them and caches what it read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ProductStockRecord {
    pub id: Uuid,

    pub name: String,

    /// Sealed packages on hand
    pub stock_packages: i32,

    /// Loose units from opened packages
    pub stock_units_loose: i32,

    /// Legacy aggregate total, maintained by the procedure
    pub stock_quantity: i32,

    /// Low-stock threshold; `None` falls back to the shared default
    pub minimum_stock: Option<i32>,

    /// Stored as text: fast / medium / slow
    pub turnover_rate: Option<String>,
}

impl ProductStockRecord {
    /// Total current stock used for status decisions.
    pub fn current_stock(&self) -> i32 {
        self.stock_quantity
    }

    pub fn turnover(&self) -> Option<TurnoverRate> {
        self.turnover_rate.as_deref().and_then(TurnoverRate::parse)
    }
}

// -----------------------------------------------------------------------------
// TURNOVER RATE
// -----------------------------------------------------------------------------
/// Informational sales-velocity class. Never recomputed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnoverRate {
    Fast,
    Medium,
    Slow,
}

impl TurnoverRate {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "medium" => Some(Self::Medium),
            "slow" => Some(Self::Slow),
            _ => None,
        }
    }
}

// =============================================================================
// ADJUSTMENT VOCABULARY
// =============================================================================

/// Which counter family an adjustment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantType {
    Unit,
    Package,
}

impl VariantType {
    /// Portuguese noun used in user-facing notices.
    pub fn noun(&self, amount: i64) -> &'static str {
        match (self, amount.abs() == 1) {
            (VariantType::Unit, true) => "unidade",
            (VariantType::Unit, false) => "unidades",
            (VariantType::Package, true) => "pacote",
            (VariantType::Package, false) => "pacotes",
        }
    }
}

/// Entrada adds, saída subtracts, ajuste sets an absolute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentType {
    Entrada,
    #[serde(alias = "saída")]
    Saida,
    Ajuste,
}

impl AdjustmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentType::Entrada => "entrada",
            AdjustmentType::Saida => "saida",
            AdjustmentType::Ajuste => "ajuste",
        }
    }
}

/// What the procedure reports back after applying an adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentResult {
    pub product_id: Uuid,

    /// Signed delta actually applied (positive = increase)
    pub quantity_change: i32,
}

// =============================================================================
// DERIVED VIEWS
// =============================================================================

/// Stock status shared by every view that shows one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    OutOfStock,
    LowStock,
    Adequate,
}

/// Unit/package breakdown of one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVariants {
    pub product_id: Uuid,
    pub packages: i32,
    pub units_loose: i32,
    pub total: i32,
    pub can_sell_units: bool,
    pub can_sell_packages: bool,
    pub status: StockStatus,
}

/// A product at or below its minimum threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockProduct {
    pub id: Uuid,
    pub name: String,
    pub current_stock: i32,

    /// Threshold actually applied (after the default fallback)
    pub minimum_stock: i32,

    /// `minimum_stock - current_stock`, never negative for a member
    pub deficit: i32,

    pub stock_packages: i32,
    pub stock_units_loose: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowStockResponse {
    pub severity: AlertSeverity,
    pub products: Vec<LowStockProduct>,
}

/// Dashboard inventory KPIs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryKpis {
    pub total_products: i64,
    pub total_units: i64,
    pub low_stock_count: i64,
    pub out_of_stock_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnoverBucket {
    pub products: i64,
    pub total_units: i64,
    pub low_stock: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnoverReport {
    pub fast: TurnoverBucket,
    pub medium: TurnoverBucket,
    pub slow: TurnoverBucket,
    pub unclassified: TurnoverBucket,
}

// =============================================================================
// MOVEMENT HISTORY
// =============================================================================

/// One row of `inventory_movements`, as the history view needs it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InventoryMovement {
    pub id: Uuid,
    pub product_id: Uuid,
    pub quantity_change: i32,
    pub new_stock_quantity: Option<i32>,
    pub movement_type: String,
    pub reason: Option<String>,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MovementFilter {
    pub product_id: Option<Uuid>,

    /// `None` or `"all"` means every type
    #[serde(rename = "type")]
    pub movement_type: Option<String>,

    pub limit: Option<i64>,
}

impl MovementFilter {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 500;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn type_filter(&self) -> Option<&str> {
        self.movement_type
            .as_deref()
            .filter(|t| !t.is_empty() && *t != "all")
    }

    /// Stable cache-key fragment for this filter.
    pub fn cache_fragment(&self) -> String {
        format!(
            "{}:{}:{}",
            self.product_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "any".to_string()),
            self.type_filter().unwrap_or("all"),
            self.effective_limit()
        )
    }
}

// =============================================================================
// API ENVELOPES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductListResponse {
    pub items: Vec<ProductStockRecord>,
    pub total: i64,
    pub page: i32,
    pub per_page: i32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub cache: bool,
}

/// API error body. `message` is what the UI shows in its error notice.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            title: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            title: None,
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turnover_rate_parses_stored_text() {
        assert_eq!(TurnoverRate::parse("fast"), Some(TurnoverRate::Fast));
        assert_eq!(TurnoverRate::parse(" Medium "), Some(TurnoverRate::Medium));
        assert_eq!(TurnoverRate::parse("slow"), Some(TurnoverRate::Slow));
        assert_eq!(TurnoverRate::parse("seasonal"), None);
    }

    #[test]
    fn adjustment_type_accepts_accented_saida() {
        let parsed: AdjustmentType = serde_json::from_str("\"saída\"").unwrap();
        assert_eq!(parsed, AdjustmentType::Saida);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"saida\"");
    }

    #[test]
    fn movement_filter_limits_and_fragment() {
        let filter = MovementFilter {
            product_id: None,
            movement_type: Some("all".into()),
            limit: Some(10_000),
        };
        assert_eq!(filter.effective_limit(), MovementFilter::MAX_LIMIT);
        assert_eq!(filter.type_filter(), None);
        assert_eq!(filter.cache_fragment(), "any:all:500");

        let default = MovementFilter::default();
        assert_eq!(default.effective_limit(), 100);
    }

    #[test]
    fn variant_nouns_follow_amount() {
        assert_eq!(VariantType::Unit.noun(1), "unidade");
        assert_eq!(VariantType::Unit.noun(-10), "unidades");
        assert_eq!(VariantType::Package.noun(2), "pacotes");
    }
}
