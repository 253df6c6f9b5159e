// =============================================================================
// LOW-STOCK NOTIFIER
// =============================================================================
// Pure functions over an already-fetched stock snapshot. Nothing here talks to
// the database or the cache; callers decide where the snapshot comes from.
//
// The threshold rule is `current <= minimum`, and a missing minimum falls back
// to DEFAULT_MINIMUM_STOCK. Every place that shows a stock status goes through
// `stock_status` so the rule cannot drift between views.
// =============================================================================

use crate::models::{
    AlertSeverity, InventoryKpis, LowStockProduct, ProductStockRecord, ProductVariants,
    StockStatus, TurnoverBucket, TurnoverRate, TurnoverReport,
};

/// Threshold applied when a product has no `minimum_stock` configured.
pub const DEFAULT_MINIMUM_STOCK: i32 = 5;

pub fn effective_minimum(minimum_stock: Option<i32>) -> i32 {
    minimum_stock.unwrap_or(DEFAULT_MINIMUM_STOCK)
}

pub fn is_low_stock(record: &ProductStockRecord) -> bool {
    record.current_stock() <= effective_minimum(record.minimum_stock)
}

pub fn stock_status(record: &ProductStockRecord) -> StockStatus {
    if record.current_stock() <= 0 {
        StockStatus::OutOfStock
    } else if is_low_stock(record) {
        StockStatus::LowStock
    } else {
        StockStatus::Adequate
    }
}

/// Products at or below their threshold.
///
/// Output keeps the snapshot's order; no ordering is promised. Use
/// [`sort_by_severity`] for display.
pub fn compute_low_stock(records: &[ProductStockRecord]) -> Vec<LowStockProduct> {
    records
        .iter()
        .filter(|record| is_low_stock(record))
        .map(|record| {
            let minimum = effective_minimum(record.minimum_stock);
            LowStockProduct {
                id: record.id,
                name: record.name.clone(),
                current_stock: record.current_stock(),
                minimum_stock: minimum,
                deficit: minimum - record.current_stock(),
                stock_packages: record.stock_packages,
                stock_units_loose: record.stock_units_loose,
            }
        })
        .collect()
}

/// Largest deficit first; ties broken by name so the display is stable.
pub fn sort_by_severity(products: &mut [LowStockProduct]) {
    products.sort_by(|a, b| b.deficit.cmp(&a.deficit).then_with(|| a.name.cmp(&b.name)));
}

pub fn alert_severity(products: &[LowStockProduct]) -> AlertSeverity {
    if products.is_empty() {
        AlertSeverity::Ok
    } else if products.iter().any(|p| p.current_stock <= 0) {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    }
}

pub fn variants_of(record: &ProductStockRecord) -> ProductVariants {
    ProductVariants {
        product_id: record.id,
        packages: record.stock_packages,
        units_loose: record.stock_units_loose,
        total: record.current_stock(),
        can_sell_units: record.stock_units_loose > 0,
        can_sell_packages: record.stock_packages > 0,
        status: stock_status(record),
    }
}

pub fn inventory_kpis(records: &[ProductStockRecord]) -> InventoryKpis {
    records.iter().fold(InventoryKpis::default(), |mut kpis, record| {
        kpis.total_products += 1;
        kpis.total_units += i64::from(record.current_stock());
        match stock_status(record) {
            StockStatus::OutOfStock => {
                kpis.out_of_stock_count += 1;
                kpis.low_stock_count += 1;
            }
            StockStatus::LowStock => kpis.low_stock_count += 1,
            StockStatus::Adequate => {}
        }
        kpis
    })
}

pub fn turnover_report(records: &[ProductStockRecord]) -> TurnoverReport {
    let mut report = TurnoverReport::default();
    for record in records {
        let bucket: &mut TurnoverBucket = match record.turnover() {
            Some(TurnoverRate::Fast) => &mut report.fast,
            Some(TurnoverRate::Medium) => &mut report.medium,
            Some(TurnoverRate::Slow) => &mut report.slow,
            None => &mut report.unclassified,
        };
        bucket.products += 1;
        bucket.total_units += i64::from(record.current_stock());
        if is_low_stock(record) {
            bucket.low_stock += 1;
        }
    }
    report
}
