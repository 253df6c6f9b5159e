// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP handlers. Reads go through the read-through cache; writes go through
// the stock adjuster and, on success, the invalidation coordinator.
//
// WRITE PATH (POST /api/v1/inventory/adjust):
//   intent --build--> request --submit--> result --invalidate--> notice
// The response is sent after invalidation, so the caller's next read cannot
// be served a pre-adjustment entry from this service's cache.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::adjustment::{
    build, build_correction, build_transfer, AdjustmentIntent, StockAdjuster, StockCorrectionIntent,
    StockTransferIntent,
};
use crate::auth::Session;
use crate::cache::{read_through, InvalidationCoordinator, QueryKey, Resource};
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::feedback::{self, Notice};
use crate::low_stock;
use crate::metrics;
use crate::models::*;
use crate::AppState;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "adega-stock-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /ready
///
/// 503 unless both the database and the cache answer.
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;
    let cache_healthy = state.cache.ping().await;

    let all_healthy = db_healthy && cache_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            cache: cache_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// PRODUCT READS
// =============================================================================

/// GET /api/v1/products?page=2&per_page=50
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// 1-indexed, default 1
    #[serde(default = "default_page")]
    pub page: i32,

    /// Default 20, max 100
    #[serde(default = "default_per_page")]
    pub per_page: i32,
}

fn default_page() -> i32 {
    1
}
fn default_per_page() -> i32 {
    20
}

pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<ProductListResponse>> {
    let start = Instant::now();
    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let db = &state.db;
    let key = QueryKey::entity(Resource::ProductList, format!("{page}:{per_page}"));
    let response = read_through(&state.cache, &key, || async move {
        let (items, total) = db.list_products(page, per_page).await?;
        Ok(ProductListResponse {
            items,
            total,
            page,
            per_page,
        })
    })
    .await?;

    metrics::record_http_request("GET", "/api/v1/products", 200, start.elapsed().as_secs_f64());
    Ok(Json(response))
}

/// GET /api/v1/products/:id
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<Uuid>,
) -> AppResult<Json<ProductStockRecord>> {
    let start = Instant::now();

    let db = &state.db;
    let key = QueryKey::product_detail(product_id);
    let product = read_through(&state.cache, &key, || load_product_or_404(db, product_id)).await?;

    metrics::record_http_request("GET", "/api/v1/products/:id", 200, start.elapsed().as_secs_f64());
    Ok(Json(product))
}

/// GET /api/v1/products/:id/variants
pub async fn get_product_variants(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<Uuid>,
) -> AppResult<Json<ProductVariants>> {
    let start = Instant::now();

    let key = QueryKey::product_variants(product_id);
    let db = &state.db;
    let variants = read_through(&state.cache, &key, || async move {
        let product = load_product_or_404(db, product_id).await?;
        Ok(low_stock::variants_of(&product))
    })
    .await?;

    metrics::record_http_request(
        "GET",
        "/api/v1/products/:id/variants",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(variants))
}

async fn load_product_or_404(db: &Database, product_id: Uuid) -> AppResult<ProductStockRecord> {
    db.get_product(product_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Product not found: {}", product_id)))
}

// =============================================================================
// STOCK WRITES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct AdjustmentResponse {
    pub result: AdjustmentResult,
    pub notice: Notice,
}

#[derive(Debug, Serialize)]
pub struct CorrectionResponse {
    pub product_id: Uuid,
    pub notice: Notice,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub product_id: Uuid,
    pub notice: Notice,
}

/// Validate, submit once, and invalidate on success.
///
/// Nothing is invalidated when the adjustment fails.
pub async fn apply_adjustment(
    adjuster: &StockAdjuster,
    coordinator: &InvalidationCoordinator,
    session: Option<&Session>,
    intent: AdjustmentIntent,
) -> AppResult<AdjustmentResponse> {
    let request = build(intent)?;
    let result = adjuster.submit(session, &request).await?;

    coordinator.on_adjustment_success(&result).await;

    let notice = feedback::adjustment_applied(&result, request.variant_type());
    notice.log();
    Ok(AdjustmentResponse { result, notice })
}

pub async fn apply_correction(
    adjuster: &StockAdjuster,
    coordinator: &InvalidationCoordinator,
    session: Option<&Session>,
    intent: StockCorrectionIntent,
) -> AppResult<CorrectionResponse> {
    let correction = build_correction(intent)?;
    adjuster.submit_correction(session, &correction).await?;

    coordinator.on_product_changed(correction.product_id).await;

    let notice = feedback::correction_applied(&correction);
    notice.log();
    Ok(CorrectionResponse {
        product_id: correction.product_id,
        notice,
    })
}

/// Transfers change active stock, so every view of the product is
/// invalidated, not just the product list.
pub async fn apply_transfer(
    adjuster: &StockAdjuster,
    coordinator: &InvalidationCoordinator,
    session: Option<&Session>,
    intent: StockTransferIntent,
) -> AppResult<TransferResponse> {
    let transfer = build_transfer(intent).map_err(|err| AppError::Transfer(err.into()))?;
    adjuster
        .submit_transfer(session, &transfer)
        .await
        .map_err(AppError::Transfer)?;

    coordinator.on_product_changed(transfer.product_id).await;

    let notice = feedback::transfer_applied(&transfer);
    notice.log();
    Ok(TransferResponse {
        product_id: transfer.product_id,
        notice,
    })
}

/// POST /api/v1/inventory/adjust
///
/// ```json
/// {
///   "variantId": "6f1c2a58-...",
///   "variantType": "unit",
///   "adjustmentType": "saida",
///   "quantity": 3,
///   "reason": "Quebra no estoque"
/// }
/// ```
/// `ajuste` carries `newStock` instead of `quantity`.
pub async fn adjust_stock(
    State(state): State<Arc<AppState>>,
    session: Option<Session>,
    Json(intent): Json<AdjustmentIntent>,
) -> AppResult<Json<AdjustmentResponse>> {
    let start = Instant::now();

    let outcome =
        apply_adjustment(&state.adjuster, &state.coordinator, session.as_ref(), intent).await;
    record_write("/api/v1/inventory/adjust", &outcome, start);

    Ok(Json(outcome?))
}

/// POST /api/v1/inventory/absolute
///
/// ```json
/// { "productId": "6f1c2a58-...", "newPackages": 2, "newUnitsLoose": 5, "reason": "inventory" }
/// ```
pub async fn set_stock_absolute(
    State(state): State<Arc<AppState>>,
    session: Option<Session>,
    Json(intent): Json<StockCorrectionIntent>,
) -> AppResult<Json<CorrectionResponse>> {
    let start = Instant::now();

    let outcome =
        apply_correction(&state.adjuster, &state.coordinator, session.as_ref(), intent).await;
    record_write("/api/v1/inventory/absolute", &outcome, start);

    Ok(Json(outcome?))
}

/// POST /api/v1/inventory/transfer
///
/// ```json
/// { "productId": "6f1c2a58-...", "packages": 1, "unitsLoose": 0, "notes": "Depósito" }
/// ```
pub async fn transfer_stock(
    State(state): State<Arc<AppState>>,
    session: Option<Session>,
    Json(intent): Json<StockTransferIntent>,
) -> AppResult<Json<TransferResponse>> {
    let start = Instant::now();

    let outcome =
        apply_transfer(&state.adjuster, &state.coordinator, session.as_ref(), intent).await;
    record_write("/api/v1/inventory/transfer", &outcome, start);

    Ok(Json(outcome?))
}

fn record_write<T>(endpoint: &str, outcome: &AppResult<T>, start: Instant) {
    let status = match outcome {
        Ok(_) => 200,
        Err(err) => err.status().as_u16(),
    };
    metrics::record_http_request("POST", endpoint, status, start.elapsed().as_secs_f64());
}

// =============================================================================
// INVENTORY READS
// =============================================================================

/// GET /api/v1/inventory/movements?product_id=...&type=saida&limit=50
pub async fn list_movements(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MovementFilter>,
) -> AppResult<Json<Vec<InventoryMovement>>> {
    let start = Instant::now();

    let key = QueryKey::entity(Resource::Movements, filter.cache_fragment());
    let (db, filter) = (&state.db, &filter);
    let movements = read_through(&state.cache, &key, || async move {
        db.list_movements(filter).await
    })
    .await?;

    metrics::record_http_request(
        "GET",
        "/api/v1/inventory/movements",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(movements))
}

/// GET /api/v1/inventory/alerts
///
/// Products at or below their minimum, largest deficit first.
pub async fn low_stock_alerts(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<LowStockResponse>> {
    let start = Instant::now();

    let db = &state.db;
    let key = QueryKey::resource(Resource::LowStock);
    let response = read_through(&state.cache, &key, || async move {
        let snapshot = db.list_all_products().await?;
        let mut products = low_stock::compute_low_stock(&snapshot);
        low_stock::sort_by_severity(&mut products);
        Ok(LowStockResponse {
            severity: low_stock::alert_severity(&products),
            products,
        })
    })
    .await?;

    metrics::set_low_stock_count(response.products.len());
    metrics::record_http_request(
        "GET",
        "/api/v1/inventory/alerts",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(response))
}

/// GET /api/v1/dashboard/inventory
pub async fn inventory_dashboard(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<InventoryKpis>> {
    let start = Instant::now();

    let db = &state.db;
    let key = QueryKey::entity(Resource::Dashboard, "inventory");
    let kpis = read_through(&state.cache, &key, || async move {
        let snapshot = db.list_all_products().await?;
        Ok(low_stock::inventory_kpis(&snapshot))
    })
    .await?;

    metrics::record_http_request(
        "GET",
        "/api/v1/dashboard/inventory",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(kpis))
}

/// GET /api/v1/reports/turnover
pub async fn turnover_report(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<TurnoverReport>> {
    let start = Instant::now();

    let db = &state.db;
    let key = QueryKey::entity(Resource::Reports, "turnover");
    let report = read_through(&state.cache, &key, || async move {
        let snapshot = db.list_all_products().await?;
        Ok(low_stock::turnover_report(&snapshot))
    })
    .await?;

    metrics::record_http_request(
        "GET",
        "/api/v1/reports/turnover",
        200,
        start.elapsed().as_secs_f64(),
    );
    Ok(Json(report))
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjustment::{AdjustmentError, CorrectionReason};
    use crate::cache::{CacheHandle, CacheOp, MemoryQueryCache, QueryCache};
    use crate::fake_ledger::FakeLedger;
    use crate::feedback::NoticeKind;
    use std::time::Duration;

    struct Harness {
        ledger: Arc<FakeLedger>,
        cache: Arc<MemoryQueryCache>,
        adjuster: StockAdjuster,
        coordinator: InvalidationCoordinator,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(FakeLedger::new());
        let cache = Arc::new(MemoryQueryCache::new());
        Harness {
            adjuster: StockAdjuster::new(ledger.clone()),
            coordinator: InvalidationCoordinator::new(
                CacheHandle::new(cache.clone(), Duration::from_secs(300)),
                ledger.clone(),
            ),
            ledger,
            cache,
        }
    }

    fn session() -> Session {
        Session {
            user_id: Uuid::new_v4(),
        }
    }

    fn intent(variant: Uuid, adjustment_type: AdjustmentType) -> AdjustmentIntent {
        AdjustmentIntent {
            variant_id: variant.to_string(),
            variant_type: Some(VariantType::Unit),
            adjustment_type: Some(adjustment_type),
            quantity: None,
            new_stock: None,
            reason: "conferência".into(),
        }
    }

    fn invalidations(cache: &MemoryQueryCache) -> usize {
        cache
            .operations()
            .iter()
            .filter(|op| matches!(op, CacheOp::Invalidate(_)))
            .count()
    }

    #[tokio::test]
    async fn entrada_returns_success_notice() {
        let h = harness();
        let variant = h.ledger.insert_product("Skol 350ml", 20, None);

        let response = apply_adjustment(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            AdjustmentIntent {
                quantity: Some(10.0),
                ..intent(variant, AdjustmentType::Entrada)
            },
        )
        .await
        .unwrap();

        assert_eq!(response.result.quantity_change, 10);
        assert_eq!(response.notice.kind, NoticeKind::Success);
        assert_eq!(response.notice.description, "Entrada de 10 unidades registrada");
        assert_eq!(h.ledger.stock_of(variant), Some(30));
        assert_eq!(invalidations(&h.cache), 7);
    }

    #[tokio::test]
    async fn rejected_saida_keeps_cache_and_stock() {
        let h = harness();
        let variant = h.ledger.insert_product("Vinho Tinto", 10, None);
        let detail = QueryKey::product_detail(variant);
        h.cache.put(&detail, "{}".into(), Duration::from_secs(300)).await.unwrap();

        let err = apply_adjustment(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            AdjustmentIntent {
                quantity: Some(50.0),
                ..intent(variant, AdjustmentType::Saida)
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            AppError::Adjustment(AdjustmentError::Procedure(ref msg))
                if msg.starts_with("Estoque insuficiente")
        ));
        assert_eq!(h.ledger.stock_of(variant), Some(10));
        assert_eq!(invalidations(&h.cache), 0);
        assert!(h.cache.contains(&detail));
    }

    #[tokio::test]
    async fn ajuste_to_zero_reports_removed_amount() {
        let h = harness();
        let variant = h.ledger.insert_product("Cachaça 51", 37, None);

        let response = apply_adjustment(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            AdjustmentIntent {
                new_stock: Some(0.0),
                ..intent(variant, AdjustmentType::Ajuste)
            },
        )
        .await
        .unwrap();

        assert_eq!(response.result.quantity_change, -37);
        assert_eq!(response.notice.description, "Saída de 37 unidades registrada");
        assert_eq!(h.ledger.stock_of(variant), Some(0));
    }

    #[tokio::test]
    async fn invalid_intent_never_reaches_the_ledger() {
        let h = harness();
        let variant = h.ledger.insert_product("Skol 350ml", 20, None);

        let err = apply_adjustment(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            AdjustmentIntent {
                quantity: Some(2.5),
                ..intent(variant, AdjustmentType::Entrada)
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.ledger.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_session_is_unauthorized() {
        let h = harness();
        let variant = h.ledger.insert_product("Skol 350ml", 20, None);

        let err = apply_adjustment(
            &h.adjuster,
            &h.coordinator,
            None,
            AdjustmentIntent {
                quantity: Some(1.0),
                ..intent(variant, AdjustmentType::Entrada)
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.ledger.stock_of(variant), Some(20));
    }

    #[tokio::test]
    async fn correction_sets_both_counters_and_invalidates() {
        let h = harness();
        let product = h.ledger.insert_product("Heineken 350ml", 14, None);

        let response = apply_correction(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            StockCorrectionIntent {
                product_id: product,
                new_packages: Some(2.0),
                new_units_loose: Some(3.0),
                reason: Some(CorrectionReason::Inventory),
            },
        )
        .await
        .unwrap();

        assert_eq!(response.product_id, product);
        assert_eq!(response.notice.description, "Novo estoque: 2 pacotes e 3 unidades");
        assert_eq!(invalidations(&h.cache), 7);
    }

    #[tokio::test]
    async fn transfer_invalidates_and_reports_moved_amounts() {
        let h = harness();
        let product = h.ledger.insert_product("Brahma Duplo Malte", 24, None);

        let response = apply_transfer(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            StockTransferIntent {
                product_id: product,
                packages: None,
                units_loose: Some(4.0),
                notes: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            response.notice.description,
            "0 pacote(s) e 4 unidade(s) transferidos para Loja 2 (Depósito)"
        );
        assert_eq!(h.ledger.stock_of(product), Some(20));
        assert_eq!(invalidations(&h.cache), 7);
    }

    #[tokio::test]
    async fn failed_transfer_invalidates_nothing() {
        let h = harness();

        let err = apply_transfer(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            StockTransferIntent {
                product_id: Uuid::new_v4(),
                packages: Some(1.0),
                units_loose: None,
                notes: None,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::Transfer(AdjustmentError::Procedure(_))));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(invalidations(&h.cache), 0);

        let err = apply_transfer(
            &h.adjuster,
            &h.coordinator,
            Some(&session()),
            StockTransferIntent {
                product_id: Uuid::new_v4(),
                packages: Some(0.0),
                units_loose: Some(0.0),
                notes: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
