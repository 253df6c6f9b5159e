// =============================================================================
// ADJUSTMENT MODULE
// =============================================================================
// Turns a user's stock intent into the exact parameter contract of the
// backend's `adjust_variant_stock` procedure, and submits it once.
//
// FLOW:
//   AdjustmentIntent --build()--> AdjustmentRequest --submit()--> AdjustmentResult
//
// Two other backend writes share the submitter and its in-flight guard: the
// dual-counter correction (`set_product_stock_absolute`) and the transfer of
// active stock to the store 2 holding area (`transfer_to_store2_holding`).
//
// `build` is local and synchronous: a malformed intent never reaches the
// network. `submit` makes exactly one procedure call and never retries.
// =============================================================================

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::Session;
use crate::metrics;
use crate::models::{AdjustmentResult, AdjustmentType, VariantType};

// =============================================================================
// USER INTENT (loosely typed, straight from the UI)
// =============================================================================
/// What the UI sends. Numbers arrive as JSON numbers and may be fractional or
/// negative; `build` decides whether they are acceptable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentIntent {
    #[serde(default)]
    pub variant_id: String,
    pub variant_type: Option<VariantType>,
    pub adjustment_type: Option<AdjustmentType>,
    pub quantity: Option<f64>,
    pub new_stock: Option<f64>,
    #[serde(default)]
    pub reason: String,
}

// =============================================================================
// VALIDATION ERRORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    Required,
    Empty,
    NotInteger,
    NotPositive,
    Negative,
    OutOfRange,
    NotAllowed,
    NothingToTransfer,
}

impl ValidationReason {
    fn describe(&self) -> &'static str {
        match self {
            ValidationReason::Required => "é obrigatório",
            ValidationReason::Empty => "não pode ser vazio",
            ValidationReason::NotInteger => "deve ser um número inteiro",
            ValidationReason::NotPositive => "deve ser maior que zero",
            ValidationReason::Negative => "não pode ser negativo",
            ValidationReason::OutOfRange => "está fora do intervalo permitido",
            ValidationReason::NotAllowed => "não é permitido para este tipo de ajuste",
            ValidationReason::NothingToTransfer => "exige pelo menos um pacote ou uma unidade",
        }
    }
}

/// Field-level rejection of an intent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Campo '{field}' {}", .reason.describe())]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: ValidationReason) -> Self {
        Self { field, reason }
    }
}

// =============================================================================
// ADJUSTMENT REQUEST (well-formed, only constructible through `build`)
// =============================================================================

/// The amount carried by a request. Entrada/saída carry a positive quantity,
/// ajuste carries a non-negative target; no variant carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentKind {
    Entrada { quantity: i32 },
    Saida { quantity: i32 },
    Ajuste { new_stock: i32 },
}

impl AdjustmentKind {
    pub fn adjustment_type(&self) -> AdjustmentType {
        match self {
            AdjustmentKind::Entrada { .. } => AdjustmentType::Entrada,
            AdjustmentKind::Saida { .. } => AdjustmentType::Saida,
            AdjustmentKind::Ajuste { .. } => AdjustmentType::Ajuste,
        }
    }

    pub fn quantity(&self) -> Option<i32> {
        match *self {
            AdjustmentKind::Entrada { quantity } | AdjustmentKind::Saida { quantity } => {
                Some(quantity)
            }
            AdjustmentKind::Ajuste { .. } => None,
        }
    }

    pub fn new_stock(&self) -> Option<i32> {
        match *self {
            AdjustmentKind::Ajuste { new_stock } => Some(new_stock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentRequest {
    request_id: Uuid,
    variant_id: String,
    variant_type: VariantType,
    kind: AdjustmentKind,
    reason: String,
}

impl AdjustmentRequest {
    /// Fresh per `build` call. Logged for correlation, not transmitted.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    pub fn variant_type(&self) -> VariantType {
        self.variant_type
    }

    pub fn kind(&self) -> AdjustmentKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Wire parameters for `adjust_variant_stock`, stamped with the acting user.
    pub fn to_params(&self, user_id: Uuid) -> AdjustVariantStockParams {
        AdjustVariantStockParams {
            p_variant_id: self.variant_id.clone(),
            p_adjustment_type: self.kind.adjustment_type(),
            p_reason: self.reason.clone(),
            p_user_id: user_id,
            p_quantity: self.kind.quantity(),
            p_new_stock: self.kind.new_stock(),
        }
    }
}

/// Parameter shape of the `adjust_variant_stock` procedure. Absent amounts are
/// omitted, never sent as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdjustVariantStockParams {
    pub p_variant_id: String,
    pub p_adjustment_type: AdjustmentType,
    pub p_reason: String,
    pub p_user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_quantity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_new_stock: Option<i32>,
}

// -----------------------------------------------------------------------------
// BUILD
// -----------------------------------------------------------------------------

fn whole_number(field: &'static str, value: f64) -> Result<i64, ValidationError> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(ValidationError::new(field, ValidationReason::NotInteger));
    }
    if value > f64::from(i32::MAX) || value < f64::from(i32::MIN) {
        return Err(ValidationError::new(field, ValidationReason::OutOfRange));
    }
    Ok(value as i64)
}

fn positive_quantity(value: Option<f64>) -> Result<i32, ValidationError> {
    let raw = value.ok_or(ValidationError::new("quantity", ValidationReason::Required))?;
    let whole = whole_number("quantity", raw)?;
    if whole <= 0 {
        return Err(ValidationError::new("quantity", ValidationReason::NotPositive));
    }
    i32::try_from(whole).map_err(|_| ValidationError::new("quantity", ValidationReason::OutOfRange))
}

fn non_negative_stock(value: Option<f64>) -> Result<i32, ValidationError> {
    let raw = value.ok_or(ValidationError::new("newStock", ValidationReason::Required))?;
    let whole = whole_number("newStock", raw)?;
    if whole < 0 {
        return Err(ValidationError::new("newStock", ValidationReason::Negative));
    }
    i32::try_from(whole).map_err(|_| ValidationError::new("newStock", ValidationReason::OutOfRange))
}

/// UUIDs in canonical lowercase form, so one variant always maps to one
/// in-flight slot. Anything else is passed through for the procedure to judge.
fn canonical_variant_id(raw: &str) -> String {
    match Uuid::parse_str(raw) {
        Ok(id) => id.to_string(),
        Err(_) => raw.to_string(),
    }
}

/// Validate an intent and produce a request ready for transmission.
pub fn build(intent: AdjustmentIntent) -> Result<AdjustmentRequest, ValidationError> {
    let variant_id = intent.variant_id.trim();
    if variant_id.is_empty() {
        return Err(ValidationError::new("variantId", ValidationReason::Empty));
    }
    let variant_id = canonical_variant_id(variant_id);

    let variant_type = intent
        .variant_type
        .ok_or(ValidationError::new("variantType", ValidationReason::Required))?;

    let adjustment_type = intent
        .adjustment_type
        .ok_or(ValidationError::new("adjustmentType", ValidationReason::Required))?;

    let kind = match adjustment_type {
        AdjustmentType::Entrada | AdjustmentType::Saida => {
            if intent.new_stock.is_some() {
                return Err(ValidationError::new("newStock", ValidationReason::NotAllowed));
            }
            let quantity = positive_quantity(intent.quantity)?;
            if adjustment_type == AdjustmentType::Entrada {
                AdjustmentKind::Entrada { quantity }
            } else {
                AdjustmentKind::Saida { quantity }
            }
        }
        AdjustmentType::Ajuste => {
            if intent.quantity.is_some() {
                return Err(ValidationError::new("quantity", ValidationReason::NotAllowed));
            }
            AdjustmentKind::Ajuste {
                new_stock: non_negative_stock(intent.new_stock)?,
            }
        }
    };

    let reason = intent.reason.trim();
    if reason.is_empty() {
        return Err(ValidationError::new("reason", ValidationReason::Empty));
    }

    Ok(AdjustmentRequest {
        request_id: Uuid::new_v4(),
        variant_id,
        variant_type,
        kind,
        reason: reason.to_string(),
    })
}

// =============================================================================
// DUAL-COUNTER ABSOLUTE CORRECTION
// =============================================================================
// Sets packages and loose units of a product in one call to
// `set_product_stock_absolute`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionReason {
    Inventory,
    Loss,
    Consumption,
    Purchase,
}

impl CorrectionReason {
    /// Audit text stored by the procedure.
    pub fn label(&self) -> &'static str {
        match self {
            CorrectionReason::Inventory => "Inventário/Correção",
            CorrectionReason::Loss => "Perda/Quebra",
            CorrectionReason::Consumption => "Consumo Próprio",
            CorrectionReason::Purchase => "Chegada de Mercadoria",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockCorrectionIntent {
    pub product_id: Uuid,
    pub new_packages: Option<f64>,
    pub new_units_loose: Option<f64>,
    pub reason: Option<CorrectionReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockCorrection {
    pub product_id: Uuid,
    pub new_packages: i32,
    pub new_units_loose: i32,
    pub reason: CorrectionReason,
}

fn non_negative_count(field: &'static str, value: Option<f64>) -> Result<i32, ValidationError> {
    let raw = value.ok_or(ValidationError::new(field, ValidationReason::Required))?;
    let whole = whole_number(field, raw)?;
    if whole < 0 {
        return Err(ValidationError::new(field, ValidationReason::Negative));
    }
    i32::try_from(whole).map_err(|_| ValidationError::new(field, ValidationReason::OutOfRange))
}

pub fn build_correction(intent: StockCorrectionIntent) -> Result<StockCorrection, ValidationError> {
    Ok(StockCorrection {
        product_id: intent.product_id,
        new_packages: non_negative_count("newPackages", intent.new_packages)?,
        new_units_loose: non_negative_count("newUnitsLoose", intent.new_units_loose)?,
        reason: intent
            .reason
            .ok_or(ValidationError::new("reason", ValidationReason::Required))?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetProductStockAbsoluteParams {
    pub p_product_id: Uuid,
    pub p_new_packages: i32,
    pub p_new_units_loose: i32,
    pub p_reason: String,
    pub p_user_id: Uuid,
}

impl StockCorrection {
    pub fn to_params(&self, user_id: Uuid) -> SetProductStockAbsoluteParams {
        SetProductStockAbsoluteParams {
            p_product_id: self.product_id,
            p_new_packages: self.new_packages,
            p_new_units_loose: self.new_units_loose,
            p_reason: self.reason.label().to_string(),
            p_user_id: user_id,
        }
    }
}

// =============================================================================
// TRANSFER TO HOLDING
// =============================================================================
// Moves packages and loose units out of the active stock into the store 2
// holding area through `transfer_to_store2_holding`.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockTransferIntent {
    pub product_id: Uuid,
    pub packages: Option<f64>,
    pub units_loose: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockTransfer {
    pub product_id: Uuid,
    pub packages: i32,
    pub units_loose: i32,
    pub notes: Option<String>,
}

/// Absent counts mean zero; at least one of them must be positive.
pub fn build_transfer(intent: StockTransferIntent) -> Result<StockTransfer, ValidationError> {
    let packages = non_negative_count("packages", Some(intent.packages.unwrap_or(0.0)))?;
    let units_loose = non_negative_count("unitsLoose", Some(intent.units_loose.unwrap_or(0.0)))?;
    if packages == 0 && units_loose == 0 {
        return Err(ValidationError::new("packages", ValidationReason::NothingToTransfer));
    }

    let notes = intent
        .notes
        .map(|notes| notes.trim().to_string())
        .filter(|notes| !notes.is_empty());

    Ok(StockTransfer {
        product_id: intent.product_id,
        packages,
        units_loose,
        notes,
    })
}

/// Parameter shape of `transfer_to_store2_holding`. Blank notes go as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferToHoldingParams {
    pub p_product_id: Uuid,
    pub p_quantity_packages: i32,
    pub p_quantity_units: i32,
    pub p_user_id: Uuid,
    pub p_notes: Option<String>,
}

impl StockTransfer {
    pub fn to_params(&self, user_id: Uuid) -> TransferToHoldingParams {
        TransferToHoldingParams {
            p_product_id: self.product_id,
            p_quantity_packages: self.packages,
            p_quantity_units: self.units_loose,
            p_user_id: user_id,
            p_notes: self.notes.clone(),
        }
    }
}

// =============================================================================
// ADJUSTMENT ERRORS
// =============================================================================
/// Every way an adjustment attempt can end without being applied.
/// All of them are terminal for the attempt; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdjustmentError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Sessão expirada ou inexistente. Faça login novamente.")]
    Unauthenticated,

    #[error("Já existe um ajuste em andamento para este item.")]
    InFlight,

    /// Backend rejected the call; message carried verbatim
    #[error("{0}")]
    Procedure(String),

    /// Network failure, timeout or unreadable answer
    #[error("Falha de comunicação com o servidor: {0}")]
    Transport(String),
}

impl AdjustmentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AdjustmentError::Validation(_) => "validation",
            AdjustmentError::Unauthenticated => "unauthenticated",
            AdjustmentError::InFlight => "in_flight",
            AdjustmentError::Procedure(_) => "procedure",
            AdjustmentError::Transport(_) => "transport",
        }
    }
}

// =============================================================================
// PROCEDURE SEAM
// =============================================================================
/// The backend procedures that are the sole writers of stock counters.
#[async_trait]
pub trait AdjustmentProcedure: Send + Sync {
    async fn adjust_variant_stock(
        &self,
        params: &AdjustVariantStockParams,
    ) -> Result<AdjustmentResult, AdjustmentError>;

    async fn set_product_stock_absolute(
        &self,
        params: &SetProductStockAbsoluteParams,
    ) -> Result<(), AdjustmentError>;

    async fn transfer_to_holding(
        &self,
        params: &TransferToHoldingParams,
    ) -> Result<(), AdjustmentError>;
}

// =============================================================================
// IN-FLIGHT GUARD
// =============================================================================
// One adjustment per (user, target) at a time. A duplicate submission that
// arrives while the first is still running is refused instead of applied.

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    slots: Mutex<HashSet<(Uuid, String)>>,
}

impl InFlightRegistry {
    pub fn claim(
        self: &Arc<Self>,
        user_id: Uuid,
        target: &str,
    ) -> Result<InFlightSlot, AdjustmentError> {
        let key = (user_id, target.to_string());
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !slots.insert(key.clone()) {
            return Err(AdjustmentError::InFlight);
        }
        Ok(InFlightSlot {
            registry: Arc::clone(self),
            key,
        })
    }

    #[cfg(test)]
    pub fn is_busy(&self, user_id: Uuid, target: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&(user_id, target.to_string()))
    }
}

/// Released on drop, whatever the outcome of the call.
#[derive(Debug)]
pub struct InFlightSlot {
    registry: Arc<InFlightRegistry>,
    key: (Uuid, String),
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.registry
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

// =============================================================================
// STOCK ADJUSTER
// =============================================================================

#[derive(Clone)]
pub struct StockAdjuster {
    procedure: Arc<dyn AdjustmentProcedure>,
    in_flight: Arc<InFlightRegistry>,
}

impl StockAdjuster {
    pub fn new(procedure: Arc<dyn AdjustmentProcedure>) -> Self {
        Self {
            procedure,
            in_flight: Arc::new(InFlightRegistry::default()),
        }
    }

    /// Send one request to `adjust_variant_stock` on behalf of the session user.
    ///
    /// Fails with `Unauthenticated` before anything is transmitted when there
    /// is no session.
    pub async fn submit(
        &self,
        session: Option<&Session>,
        request: &AdjustmentRequest,
    ) -> Result<AdjustmentResult, AdjustmentError> {
        let session = session.ok_or(AdjustmentError::Unauthenticated)?;
        let _slot = self.in_flight.claim(session.user_id, request.variant_id())?;

        let params = request.to_params(session.user_id);
        let adjustment_type = params.p_adjustment_type.as_str();

        tracing::info!(
            request_id = %request.request_id(),
            variant_id = %request.variant_id(),
            adjustment_type,
            user_id = %session.user_id,
            kind = ?request.kind(),
            reason = request.reason(),
            "Submitting stock adjustment"
        );

        let outcome = self.procedure.adjust_variant_stock(&params).await;

        match &outcome {
            Ok(result) => {
                metrics::record_adjustment(adjustment_type, "applied");
                tracing::info!(
                    request_id = %request.request_id(),
                    product_id = %result.product_id,
                    quantity_change = result.quantity_change,
                    "Stock adjustment applied"
                );
            }
            Err(err) => {
                metrics::record_adjustment(adjustment_type, err.kind());
                tracing::warn!(
                    request_id = %request.request_id(),
                    error_kind = err.kind(),
                    error = %err,
                    "Stock adjustment rejected"
                );
            }
        }

        outcome
    }

    /// Send one dual-counter correction to `set_product_stock_absolute`.
    pub async fn submit_correction(
        &self,
        session: Option<&Session>,
        correction: &StockCorrection,
    ) -> Result<(), AdjustmentError> {
        let session = session.ok_or(AdjustmentError::Unauthenticated)?;
        let target = correction.product_id.to_string();
        let _slot = self.in_flight.claim(session.user_id, &target)?;

        tracing::info!(
            product_id = %correction.product_id,
            new_packages = correction.new_packages,
            new_units_loose = correction.new_units_loose,
            reason = correction.reason.label(),
            user_id = %session.user_id,
            "Submitting absolute stock correction"
        );

        let outcome = self
            .procedure
            .set_product_stock_absolute(&correction.to_params(session.user_id))
            .await;

        match &outcome {
            Ok(()) => metrics::record_adjustment("absolute", "applied"),
            Err(err) => {
                metrics::record_adjustment("absolute", err.kind());
                tracing::warn!(error = %err, "Absolute stock correction rejected");
            }
        }

        outcome
    }

    /// Send one transfer to `transfer_to_store2_holding`. Shares the
    /// product's in-flight slot with corrections.
    pub async fn submit_transfer(
        &self,
        session: Option<&Session>,
        transfer: &StockTransfer,
    ) -> Result<(), AdjustmentError> {
        let session = session.ok_or(AdjustmentError::Unauthenticated)?;
        let target = transfer.product_id.to_string();
        let _slot = self.in_flight.claim(session.user_id, &target)?;

        tracing::info!(
            product_id = %transfer.product_id,
            packages = transfer.packages,
            units_loose = transfer.units_loose,
            user_id = %session.user_id,
            "Submitting transfer to holding"
        );

        let outcome = self
            .procedure
            .transfer_to_holding(&transfer.to_params(session.user_id))
            .await;

        match &outcome {
            Ok(()) => metrics::record_adjustment("transfer", "applied"),
            Err(err) => {
                metrics::record_adjustment("transfer", err.kind());
                tracing::warn!(error = %err, "Transfer to holding rejected");
            }
        }

        outcome
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_ledger::FakeLedger;
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;

    fn intent(adjustment_type: AdjustmentType) -> AdjustmentIntent {
        AdjustmentIntent {
            variant_id: "4b1f3c7e-0000-4000-8000-000000000001".into(),
            variant_type: Some(VariantType::Unit),
            adjustment_type: Some(adjustment_type),
            quantity: None,
            new_stock: None,
            reason: "restock".into(),
        }
    }

    fn session() -> Session {
        Session {
            user_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn entrada_and_saida_carry_quantity_only() {
        for adjustment_type in [AdjustmentType::Entrada, AdjustmentType::Saida] {
            let request = build(AdjustmentIntent {
                quantity: Some(10.0),
                ..intent(adjustment_type)
            })
            .unwrap();

            let params = request.to_params(Uuid::new_v4());
            assert_eq!(params.p_quantity, Some(10));
            assert_eq!(params.p_new_stock, None);
            assert_eq!(params.p_adjustment_type, adjustment_type);
        }
    }

    #[test]
    fn ajuste_carries_new_stock_only() {
        let request = build(AdjustmentIntent {
            new_stock: Some(0.0),
            reason: "inventory count correction".into(),
            ..intent(AdjustmentType::Ajuste)
        })
        .unwrap();

        assert_eq!(request.kind(), AdjustmentKind::Ajuste { new_stock: 0 });
        let params = request.to_params(Uuid::new_v4());
        assert_eq!(params.p_quantity, None);
        assert_eq!(params.p_new_stock, Some(0));
    }

    #[test]
    fn wire_params_omit_the_absent_amount() {
        let user_id = Uuid::new_v4();
        let request = build(AdjustmentIntent {
            quantity: Some(3.0),
            ..intent(AdjustmentType::Saida)
        })
        .unwrap();

        let json = serde_json::to_value(request.to_params(user_id)).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object["p_adjustment_type"], "saida");
        assert_eq!(object["p_quantity"], 3);
        assert_eq!(object["p_user_id"], user_id.to_string());
        assert!(!object.contains_key("p_new_stock"));
    }

    #[test]
    fn malformed_quantities_are_rejected() {
        let cases = [
            (Some(0.0), ValidationReason::NotPositive),
            (Some(-3.0), ValidationReason::NotPositive),
            (Some(2.5), ValidationReason::NotInteger),
            (Some(f64::NAN), ValidationReason::NotInteger),
            (Some(1e12), ValidationReason::OutOfRange),
            (None, ValidationReason::Required),
        ];
        for adjustment_type in [AdjustmentType::Entrada, AdjustmentType::Saida] {
            for (quantity, reason) in cases {
                let err = build(AdjustmentIntent {
                    quantity,
                    ..intent(adjustment_type)
                })
                .unwrap_err();
                assert_eq!(err, ValidationError::new("quantity", reason), "{quantity:?}");
            }
        }
    }

    #[test]
    fn negative_or_missing_target_is_rejected() {
        let err = build(AdjustmentIntent {
            new_stock: Some(-1.0),
            ..intent(AdjustmentType::Ajuste)
        })
        .unwrap_err();
        assert_eq!(err, ValidationError::new("newStock", ValidationReason::Negative));

        let err = build(intent(AdjustmentType::Ajuste)).unwrap_err();
        assert_eq!(err, ValidationError::new("newStock", ValidationReason::Required));
    }

    #[test]
    fn mixing_quantity_and_new_stock_is_rejected() {
        let err = build(AdjustmentIntent {
            quantity: Some(1.0),
            new_stock: Some(4.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap_err();
        assert_eq!(err.field, "newStock");

        let err = build(AdjustmentIntent {
            quantity: Some(1.0),
            new_stock: Some(4.0),
            ..intent(AdjustmentType::Ajuste)
        })
        .unwrap_err();
        assert_eq!(err.field, "quantity");
    }

    #[test]
    fn blank_variant_or_reason_is_rejected() {
        let err = build(AdjustmentIntent {
            variant_id: "   ".into(),
            quantity: Some(1.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap_err();
        assert_eq!(err, ValidationError::new("variantId", ValidationReason::Empty));

        let err = build(AdjustmentIntent {
            reason: "".into(),
            quantity: Some(1.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap_err();
        assert_eq!(err, ValidationError::new("reason", ValidationReason::Empty));
    }

    #[test]
    fn every_build_gets_its_own_request_id() {
        let entrada = || AdjustmentIntent {
            quantity: Some(1.0),
            ..intent(AdjustmentType::Entrada)
        };
        let a = build(entrada()).unwrap();
        let b = build(entrada()).unwrap();
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn uuid_variant_ids_are_canonicalized() {
        let request = build(AdjustmentIntent {
            variant_id: " 4B1F3C7E-0000-4000-8000-000000000001 ".into(),
            quantity: Some(1.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap();
        assert_eq!(request.variant_id(), "4b1f3c7e-0000-4000-8000-000000000001");

        let request = build(AdjustmentIntent {
            variant_id: "legacy-42".into(),
            quantity: Some(1.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap();
        assert_eq!(request.variant_id(), "legacy-42");
    }

    #[test]
    fn correction_validates_both_counters() {
        let ok = build_correction(StockCorrectionIntent {
            product_id: Uuid::new_v4(),
            new_packages: Some(2.0),
            new_units_loose: Some(0.0),
            reason: Some(CorrectionReason::Loss),
        })
        .unwrap();
        assert_eq!(ok.to_params(Uuid::new_v4()).p_reason, "Perda/Quebra");

        let err = build_correction(StockCorrectionIntent {
            product_id: Uuid::new_v4(),
            new_packages: Some(2.0),
            new_units_loose: Some(-1.0),
            reason: Some(CorrectionReason::Inventory),
        })
        .unwrap_err();
        assert_eq!(err, ValidationError::new("newUnitsLoose", ValidationReason::Negative));
    }

    #[tokio::test]
    async fn submit_without_session_never_reaches_the_procedure() {
        let ledger = Arc::new(FakeLedger::new());
        let variant = ledger.insert_product("Skol 350ml", 20, None);
        let adjuster = StockAdjuster::new(ledger.clone());

        let request = build(AdjustmentIntent {
            variant_id: variant.to_string(),
            quantity: Some(10.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap();

        let err = adjuster.submit(None, &request).await.unwrap_err();
        assert_eq!(err, AdjustmentError::Unauthenticated);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.stock_of(variant), Some(20));
    }

    #[tokio::test]
    async fn entrada_applies_positive_change() {
        let ledger = Arc::new(FakeLedger::new());
        let variant = ledger.insert_product("Skol 350ml", 20, None);
        let adjuster = StockAdjuster::new(ledger.clone());

        let request = build(AdjustmentIntent {
            variant_id: variant.to_string(),
            quantity: Some(10.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap();

        let result = adjuster.submit(Some(&session()), &request).await.unwrap();
        assert_eq!(result.quantity_change, 10);
        assert_eq!(result.product_id, variant);
        assert_eq!(ledger.stock_of(variant), Some(30));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn saida_over_limit_is_rejected_and_stock_is_untouched() {
        let ledger = Arc::new(FakeLedger::new());
        let variant = ledger.insert_product("Vinho Tinto", 10, None);
        let adjuster = StockAdjuster::new(ledger.clone());

        let request = build(AdjustmentIntent {
            variant_id: variant.to_string(),
            quantity: Some(50.0),
            ..intent(AdjustmentType::Saida)
        })
        .unwrap();

        let err = adjuster.submit(Some(&session()), &request).await.unwrap_err();
        assert!(matches!(
            err,
            AdjustmentError::Procedure(ref msg) if msg.contains("Estoque insuficiente")
        ));
        assert_eq!(ledger.stock_of(variant), Some(10));
    }

    #[tokio::test]
    async fn procedure_errors_are_not_retried() {
        let ledger = Arc::new(FakeLedger::new());
        let adjuster = StockAdjuster::new(ledger.clone());

        let request = build(AdjustmentIntent {
            variant_id: Uuid::new_v4().to_string(),
            quantity: Some(1.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap();

        let err = adjuster.submit(Some(&session()), &request).await.unwrap_err();
        assert!(matches!(err, AdjustmentError::Procedure(_)));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_flight_slot_blocks_duplicates_until_dropped() {
        let registry = Arc::new(InFlightRegistry::default());
        let user = Uuid::new_v4();

        let slot = registry.claim(user, "variant-1").unwrap();
        assert!(registry.is_busy(user, "variant-1"));
        assert_eq!(registry.claim(user, "variant-1").unwrap_err(), AdjustmentError::InFlight);

        // other users and other variants are independent
        assert!(registry.claim(Uuid::new_v4(), "variant-1").is_ok());
        assert!(registry.claim(user, "variant-2").is_ok());

        drop(slot);
        assert!(!registry.is_busy(user, "variant-1"));
        assert!(registry.claim(user, "variant-1").is_ok());
    }

    /// Holds `adjust_variant_stock` open until released, so a second
    /// submission can arrive while the first is still in flight.
    struct HeldProcedure {
        ledger: Arc<FakeLedger>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl AdjustmentProcedure for HeldProcedure {
        async fn adjust_variant_stock(
            &self,
            params: &AdjustVariantStockParams,
        ) -> Result<AdjustmentResult, AdjustmentError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.ledger.adjust_variant_stock(params).await
        }

        async fn set_product_stock_absolute(
            &self,
            params: &SetProductStockAbsoluteParams,
        ) -> Result<(), AdjustmentError> {
            self.ledger.set_product_stock_absolute(params).await
        }

        async fn transfer_to_holding(
            &self,
            params: &TransferToHoldingParams,
        ) -> Result<(), AdjustmentError> {
            self.ledger.transfer_to_holding(params).await
        }
    }

    #[tokio::test]
    async fn overlapping_submits_for_one_variant_reach_the_ledger_once() {
        let ledger = Arc::new(FakeLedger::new());
        let variant = ledger.insert_product("Skol 350ml", 20, None);
        let procedure = Arc::new(HeldProcedure {
            ledger: ledger.clone(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let adjuster = StockAdjuster::new(procedure.clone());
        let user = session();

        let first_request = build(AdjustmentIntent {
            variant_id: variant.to_string(),
            quantity: Some(10.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap();
        let first = {
            let adjuster = adjuster.clone();
            tokio::spawn(async move { adjuster.submit(Some(&user), &first_request).await })
        };
        procedure.entered.notified().await;

        // same variant, spelled in upper case
        let duplicate = build(AdjustmentIntent {
            variant_id: variant.to_string().to_uppercase(),
            quantity: Some(10.0),
            ..intent(AdjustmentType::Entrada)
        })
        .unwrap();
        let err = adjuster.submit(Some(&user), &duplicate).await.unwrap_err();
        assert_eq!(err, AdjustmentError::InFlight);

        procedure.release.notify_one();
        let result = first.await.unwrap().unwrap();
        assert_eq!(result.quantity_change, 10);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.stock_of(variant), Some(30));
    }

    #[test]
    fn transfer_needs_something_to_move() {
        let product_id = Uuid::new_v4();
        let err = build_transfer(StockTransferIntent {
            product_id,
            packages: None,
            units_loose: Some(0.0),
            notes: None,
        })
        .unwrap_err();
        assert_eq!(err, ValidationError::new("packages", ValidationReason::NothingToTransfer));

        let err = build_transfer(StockTransferIntent {
            product_id,
            packages: Some(1.5),
            units_loose: None,
            notes: None,
        })
        .unwrap_err();
        assert_eq!(err, ValidationError::new("packages", ValidationReason::NotInteger));

        let transfer = build_transfer(StockTransferIntent {
            product_id,
            packages: None,
            units_loose: Some(6.0),
            notes: Some("   ".into()),
        })
        .unwrap();
        assert_eq!(transfer.packages, 0);
        assert_eq!(transfer.units_loose, 6);

        let json = serde_json::to_value(transfer.to_params(Uuid::new_v4())).unwrap();
        assert!(json["p_notes"].is_null());
        assert_eq!(json["p_quantity_units"], 6);
    }

    #[tokio::test]
    async fn transfer_moves_active_stock_to_holding() {
        let ledger = Arc::new(FakeLedger::new());
        let product_id = ledger.insert_product("Original 600ml", 12, None);
        let adjuster = StockAdjuster::new(ledger.clone());

        let transfer = build_transfer(StockTransferIntent {
            product_id,
            packages: None,
            units_loose: Some(5.0),
            notes: Some("reposição loja 2".into()),
        })
        .unwrap();
        adjuster.submit_transfer(Some(&session()), &transfer).await.unwrap();
        assert_eq!(ledger.stock_of(product_id), Some(7));
        assert_eq!(ledger.holding_of(product_id), (0, 5));

        let too_many = StockTransfer {
            units_loose: 50,
            ..transfer
        };
        let err = adjuster
            .submit_transfer(Some(&session()), &too_many)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdjustmentError::Procedure(ref msg) if msg.starts_with("Estoque insuficiente")
        ));
        assert_eq!(ledger.stock_of(product_id), Some(7));
    }
}
