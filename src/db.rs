// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL access for the stock service.
//
// The stock counters are owned by the backend: the only writes this module
// issues are calls to the stock procedures. Everything else is a read.
//
//   adjust_variant_stock        entrada / saída / ajuste on one variant
//   set_product_stock_absolute  packages + loose units of one product
//   transfer_to_store2_holding  active stock -> store 2 holding area
//
// The procedures return JSON. A Postgres error raised inside a procedure
// (RAISE EXCEPTION) is a business rejection and its message goes to the user
// untouched; anything else is a transport failure.
// =============================================================================

use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::adjustment::{
    AdjustVariantStockParams, AdjustmentError, AdjustmentProcedure, SetProductStockAbsoluteParams,
    TransferToHoldingParams,
};
use crate::cache::ProductSource;
use crate::error::AppResult;
use crate::metrics;
use crate::models::{AdjustmentResult, InventoryMovement, MovementFilter, ProductStockRecord};

const PRODUCT_COLUMNS: &str = "id, name, stock_packages, stock_units_loose, stock_quantity, \
                               minimum_stock, turnover_rate";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // READ OPERATIONS
    // -------------------------------------------------------------------------

    /// One page of active products, ordered by name. `page` is 1-indexed.
    pub async fn list_products(
        &self,
        page: i32,
        per_page: i32,
    ) -> AppResult<(Vec<ProductStockRecord>, i64)> {
        let start = Instant::now();
        let offset = i64::from(page - 1) * i64::from(per_page);

        let items = sqlx::query_as::<_, ProductStockRecord>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE deleted_at IS NULL \
             ORDER BY name ASC \
             LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(per_page))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM products WHERE deleted_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        metrics::record_db_query("list_products", start.elapsed().as_secs_f64());
        Ok((items, total.0))
    }

    /// Every active product; the snapshot the low-stock and aggregate views
    /// are computed from.
    pub async fn list_all_products(&self) -> AppResult<Vec<ProductStockRecord>> {
        let start = Instant::now();
        let items = sqlx::query_as::<_, ProductStockRecord>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE deleted_at IS NULL ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        metrics::record_db_query("list_all_products", start.elapsed().as_secs_f64());
        Ok(items)
    }

    pub async fn get_product(&self, product_id: Uuid) -> AppResult<Option<ProductStockRecord>> {
        let start = Instant::now();
        let item = sqlx::query_as::<_, ProductStockRecord>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        metrics::record_db_query("get_product", start.elapsed().as_secs_f64());
        Ok(item)
    }

    /// Movement history, newest first.
    pub async fn list_movements(
        &self,
        filter: &MovementFilter,
    ) -> AppResult<Vec<InventoryMovement>> {
        let start = Instant::now();
        let movements = sqlx::query_as::<_, InventoryMovement>(
            r#"
            SELECT id, product_id, quantity_change, new_stock_quantity,
                   COALESCE(type_enum::text, 'unknown') AS movement_type,
                   reason, user_id, date AS created_at
            FROM inventory_movements
            WHERE ($1::uuid IS NULL OR product_id = $1)
              AND ($2::text IS NULL OR type_enum::text = $2)
            ORDER BY date DESC
            LIMIT $3
            "#,
        )
        .bind(filter.product_id)
        .bind(filter.type_filter())
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        metrics::record_db_query("list_movements", start.elapsed().as_secs_f64());
        Ok(movements)
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// =============================================================================
// PROCEDURE CALLS
// =============================================================================

/// Raw answer of `set_product_stock_absolute`.
#[derive(Debug, Deserialize)]
struct ProcedureAck {
    success: bool,
    error: Option<String>,
}

/// Raw answer of `transfer_to_store2_holding`. Only a failure is inspected;
/// an empty answer means the transfer went through.
#[derive(Debug, Deserialize)]
struct TransferAnswer {
    #[serde(default = "default_success")]
    success: bool,
    error: Option<String>,
}

/// Raw answer of `adjust_variant_stock`. Older deployments answer with an
/// explicit `success` flag as well.
#[derive(Debug, Deserialize)]
struct AdjustAnswer {
    #[serde(default = "default_success")]
    success: bool,
    error: Option<String>,
    product_id: Option<Uuid>,
    quantity_change: Option<i32>,
}

fn default_success() -> bool {
    true
}

/// Split a sqlx failure into the adjustment taxonomy: errors raised by the
/// database itself are procedure rejections, the rest never reached it.
fn classify(err: sqlx::Error) -> AdjustmentError {
    match err {
        sqlx::Error::Database(db_err) => AdjustmentError::Procedure(db_err.message().to_string()),
        other => AdjustmentError::Transport(other.to_string()),
    }
}

fn rejection(error: Option<String>) -> AdjustmentError {
    AdjustmentError::Procedure(error.unwrap_or_else(|| "Erro desconhecido".to_string()))
}

impl Database {
    async fn call_procedure(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<serde_json::Value, AdjustmentError> {
        let start = Instant::now();
        let row = query.fetch_one(&self.pool).await.map_err(classify)?;
        metrics::record_db_query(operation, start.elapsed().as_secs_f64());

        row.try_get::<serde_json::Value, _>("result")
            .map_err(|err| AdjustmentError::Transport(err.to_string()))
    }
}

#[async_trait]
impl AdjustmentProcedure for Database {
    async fn adjust_variant_stock(
        &self,
        params: &AdjustVariantStockParams,
    ) -> Result<AdjustmentResult, AdjustmentError> {
        // The amount argument is named after the adjustment kind; the other
        // one is omitted so the procedure sees exactly one.
        let sql = match (params.p_quantity, params.p_new_stock) {
            (Some(_), None) => {
                "SELECT to_jsonb(adjust_variant_stock(\
                     p_variant_id => $1::uuid, p_adjustment_type => $2, p_reason => $3, \
                     p_user_id => $4, p_quantity => $5)) AS result"
            }
            (None, Some(_)) => {
                "SELECT to_jsonb(adjust_variant_stock(\
                     p_variant_id => $1::uuid, p_adjustment_type => $2, p_reason => $3, \
                     p_user_id => $4, p_new_stock => $5)) AS result"
            }
            _ => {
                return Err(AdjustmentError::Transport(
                    "adjustment parameters carry no amount".to_string(),
                ))
            }
        };
        let amount = params.p_quantity.or(params.p_new_stock);

        let value = self
            .call_procedure(
                "adjust_variant_stock",
                sqlx::query(sql)
                    .bind(&params.p_variant_id)
                    .bind(params.p_adjustment_type.as_str())
                    .bind(&params.p_reason)
                    .bind(params.p_user_id)
                    .bind(amount),
            )
            .await?;

        let answer: AdjustAnswer = serde_json::from_value(value)
            .map_err(|err| AdjustmentError::Transport(format!("unreadable answer: {err}")))?;
        if !answer.success {
            return Err(rejection(answer.error));
        }

        match (answer.product_id, answer.quantity_change) {
            (Some(product_id), Some(quantity_change)) => Ok(AdjustmentResult {
                product_id,
                quantity_change,
            }),
            _ => Err(AdjustmentError::Transport(
                "answer is missing product_id or quantity_change".to_string(),
            )),
        }
    }

    async fn set_product_stock_absolute(
        &self,
        params: &SetProductStockAbsoluteParams,
    ) -> Result<(), AdjustmentError> {
        let value = self
            .call_procedure(
                "set_product_stock_absolute",
                sqlx::query(
                    "SELECT to_jsonb(set_product_stock_absolute(\
                         p_product_id => $1, p_new_packages => $2, p_new_units_loose => $3, \
                         p_reason => $4, p_user_id => $5)) AS result",
                )
                .bind(params.p_product_id)
                .bind(params.p_new_packages)
                .bind(params.p_new_units_loose)
                .bind(&params.p_reason)
                .bind(params.p_user_id),
            )
            .await?;

        let ack: ProcedureAck = serde_json::from_value(value)
            .map_err(|err| AdjustmentError::Transport(format!("unreadable answer: {err}")))?;
        if ack.success {
            Ok(())
        } else {
            Err(rejection(ack.error))
        }
    }

    async fn transfer_to_holding(
        &self,
        params: &TransferToHoldingParams,
    ) -> Result<(), AdjustmentError> {
        let value = self
            .call_procedure(
                "transfer_to_store2_holding",
                sqlx::query(
                    "SELECT to_jsonb(transfer_to_store2_holding(\
                         p_product_id => $1, p_quantity_packages => $2, p_quantity_units => $3, \
                         p_user_id => $4, p_notes => $5)) AS result",
                )
                .bind(params.p_product_id)
                .bind(params.p_quantity_packages)
                .bind(params.p_quantity_units)
                .bind(params.p_user_id)
                .bind(&params.p_notes),
            )
            .await?;

        transfer_outcome(value)
    }
}

fn transfer_outcome(value: serde_json::Value) -> Result<(), AdjustmentError> {
    if value.is_null() {
        return Ok(());
    }
    let answer: TransferAnswer = serde_json::from_value(value)
        .map_err(|err| AdjustmentError::Transport(format!("unreadable answer: {err}")))?;
    if answer.success {
        Ok(())
    } else {
        Err(rejection(answer.error))
    }
}

#[async_trait]
impl ProductSource for Database {
    async fn load_product(&self, product_id: Uuid) -> AppResult<Option<ProductStockRecord>> {
        self.get_product(product_id).await
    }
}
