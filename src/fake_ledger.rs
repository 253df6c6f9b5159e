// =============================================================================
// FAKE LEDGER (tests only)
// =============================================================================
// In-memory stand-in for the stock procedures and the product read side.
// Applies adjustments the way the backend does: one product per variant id,
// saída and transfers refused when they would go below zero, every call
// counted.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::adjustment::{
    AdjustVariantStockParams, AdjustmentError, AdjustmentProcedure, SetProductStockAbsoluteParams,
    TransferToHoldingParams,
};
use crate::cache::ProductSource;
use crate::error::AppResult;
use crate::models::{AdjustmentResult, AdjustmentType, ProductStockRecord};

#[derive(Debug, Default)]
pub struct FakeLedger {
    products: Mutex<HashMap<Uuid, ProductStockRecord>>,
    /// (packages, loose units) moved to store 2
    holding: Mutex<HashMap<Uuid, (i32, i32)>>,
    pub calls: AtomicUsize,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a product whose only variant shares its id. Stock is all loose units.
    pub fn insert_product(&self, name: &str, stock: i32, minimum_stock: Option<i32>) -> Uuid {
        let id = Uuid::new_v4();
        self.products.lock().unwrap().insert(
            id,
            ProductStockRecord {
                id,
                name: name.to_string(),
                stock_packages: 0,
                stock_units_loose: stock,
                stock_quantity: stock,
                minimum_stock,
                turnover_rate: None,
            },
        );
        id
    }

    pub fn stock_of(&self, id: Uuid) -> Option<i32> {
        self.products
            .lock()
            .unwrap()
            .get(&id)
            .map(|record| record.stock_quantity)
    }

    pub fn holding_of(&self, id: Uuid) -> (i32, i32) {
        self.holding.lock().unwrap().get(&id).copied().unwrap_or((0, 0))
    }
}

fn not_found() -> AdjustmentError {
    AdjustmentError::Procedure("Produto não encontrado".into())
}

#[async_trait]
impl AdjustmentProcedure for FakeLedger {
    async fn adjust_variant_stock(
        &self,
        params: &AdjustVariantStockParams,
    ) -> Result<AdjustmentResult, AdjustmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let id = Uuid::parse_str(&params.p_variant_id).map_err(|_| not_found())?;
        let mut products = self.products.lock().unwrap();
        let record = products.get_mut(&id).ok_or_else(not_found)?;
        let current = record.stock_quantity;

        let next = match params.p_adjustment_type {
            AdjustmentType::Entrada => current + params.p_quantity.unwrap_or(0),
            AdjustmentType::Saida => {
                let requested = params.p_quantity.unwrap_or(0);
                if requested > current {
                    return Err(AdjustmentError::Procedure(format!(
                        "Estoque insuficiente: disponível {}, solicitado {}",
                        current, requested
                    )));
                }
                current - requested
            }
            AdjustmentType::Ajuste => params.p_new_stock.unwrap_or(current),
        };

        record.stock_quantity = next;
        record.stock_units_loose = next - record.stock_packages;

        Ok(AdjustmentResult {
            product_id: id,
            quantity_change: next - current,
        })
    }

    async fn set_product_stock_absolute(
        &self,
        params: &SetProductStockAbsoluteParams,
    ) -> Result<(), AdjustmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut products = self.products.lock().unwrap();
        let record = products.get_mut(&params.p_product_id).ok_or_else(not_found)?;
        record.stock_packages = params.p_new_packages;
        record.stock_units_loose = params.p_new_units_loose;
        record.stock_quantity = params.p_new_packages + params.p_new_units_loose;
        Ok(())
    }

    async fn transfer_to_holding(
        &self,
        params: &TransferToHoldingParams,
    ) -> Result<(), AdjustmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut products = self.products.lock().unwrap();
        let record = products.get_mut(&params.p_product_id).ok_or_else(not_found)?;
        if params.p_quantity_packages > record.stock_packages
            || params.p_quantity_units > record.stock_units_loose
        {
            return Err(AdjustmentError::Procedure(format!(
                "Estoque insuficiente na Loja 1: disponível {} pacotes e {} unidades",
                record.stock_packages, record.stock_units_loose
            )));
        }

        record.stock_packages -= params.p_quantity_packages;
        record.stock_units_loose -= params.p_quantity_units;
        record.stock_quantity = record.stock_packages + record.stock_units_loose;

        let mut holding = self.holding.lock().unwrap();
        let moved = holding.entry(params.p_product_id).or_insert((0, 0));
        moved.0 += params.p_quantity_packages;
        moved.1 += params.p_quantity_units;
        Ok(())
    }
}

#[async_trait]
impl ProductSource for FakeLedger {
    async fn load_product(&self, product_id: Uuid) -> AppResult<Option<ProductStockRecord>> {
        Ok(self.products.lock().unwrap().get(&product_id).cloned())
    }
}
