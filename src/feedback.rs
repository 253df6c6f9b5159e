// =============================================================================
// FEEDBACK MODULE
// =============================================================================
// User-facing notices for adjustment outcomes. Text is Portuguese, as shown
// in the store UI. Errors keep the backend's message untouched.
// =============================================================================

use serde::Serialize;

use crate::adjustment::{AdjustmentError, StockCorrection, StockTransfer};
use crate::models::{AdjustmentResult, VariantType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub description: String,
}

impl Notice {
    fn success(title: &str, description: String) -> Self {
        Self {
            kind: NoticeKind::Success,
            title: title.to_string(),
            description,
        }
    }

    fn error(title: &str, description: String) -> Self {
        Self {
            kind: NoticeKind::Error,
            title: title.to_string(),
            description,
        }
    }

    pub fn log(&self) {
        match self.kind {
            NoticeKind::Success => {
                tracing::info!(title = %self.title, description = %self.description, "Notice")
            }
            NoticeKind::Error => {
                tracing::warn!(title = %self.title, description = %self.description, "Notice")
            }
        }
    }
}

/// Success notice for an applied adjustment, worded from the signed change.
pub fn adjustment_applied(result: &AdjustmentResult, variant_type: VariantType) -> Notice {
    let change = i64::from(result.quantity_change);
    let noun = variant_type.noun(change);

    let description = if change > 0 {
        format!("Entrada de {} {} registrada", change, noun)
    } else if change < 0 {
        format!("Saída de {} {} registrada", change.abs(), noun)
    } else {
        "Estoque inalterado".to_string()
    };

    Notice::success("Estoque ajustado!", description)
}

pub fn correction_applied(correction: &StockCorrection) -> Notice {
    Notice::success(
        "Estoque ajustado!",
        format!(
            "Novo estoque: {} {} e {} {}",
            correction.new_packages,
            VariantType::Package.noun(i64::from(correction.new_packages)),
            correction.new_units_loose,
            VariantType::Unit.noun(i64::from(correction.new_units_loose)),
        ),
    )
}

pub fn transfer_applied(transfer: &StockTransfer) -> Notice {
    Notice::success(
        "Transferência realizada",
        format!(
            "{} pacote(s) e {} unidade(s) transferidos para Loja 2 (Depósito)",
            transfer.packages, transfer.units_loose
        ),
    )
}

/// Error notice; the description is the error's own message.
pub fn adjustment_failed(err: &AdjustmentError) -> Notice {
    Notice::error("Erro ao ajustar estoque", err.to_string())
}

/// Like `adjustment_failed`, except a missing product is reported as deleted.
pub fn transfer_failed(err: &AdjustmentError) -> Notice {
    let description = match err {
        AdjustmentError::Procedure(msg) if msg.contains("Produto não encontrado") => {
            "Produto não encontrado ou foi deletado.".to_string()
        }
        other => other.to_string(),
    };
    Notice::error("Erro na transferência", description)
}
