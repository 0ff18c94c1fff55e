use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 決済代行への課金リクエスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// 顧客参照
    pub customer_ref: String,
    /// 支払い手段参照（既定のカード）
    pub instrument_ref: String,
    /// 課金額（最小通貨単位）
    pub amount_minor: i64,
    /// 冪等キー（同じエントリ集合への二重課金を防ぐ）
    pub idempotency_key: String,
    /// 明細表示用の説明
    pub description: String,
}

/// 決済代行が返す課金状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Succeeded,
    Processing,
    RequiresAction,
    Canceled,
    Failed,
}

impl ChargeStatus {
    /// 決済代行の状態文字列を解析する
    ///
    /// 未知の状態は確定していないものとして`Processing`扱いにする。
    pub fn parse(value: &str) -> Self {
        match value {
            "succeeded" => ChargeStatus::Succeeded,
            "requires_payment_method" | "requires_confirmation" | "requires_action" => {
                ChargeStatus::RequiresAction
            }
            "canceled" => ChargeStatus::Canceled,
            "failed" => ChargeStatus::Failed,
            _ => ChargeStatus::Processing,
        }
    }
}

/// 決済代行からの応答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub status: ChargeStatus,
    /// 決済代行が割り当てた支払い参照
    pub reference: String,
    /// 失敗コード（例: "card_declined"）
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

/// 決済代行呼び出しのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// カード会社・決済代行による拒否（確定的な失敗）
    #[error("課金が拒否されました: {code} ({message})")]
    Declined { code: String, message: String },

    /// 通信エラー（一時的な失敗）
    #[error("決済代行との通信エラー: {0}")]
    Network(String),

    /// タイムアウト（一時的な失敗）
    #[error("決済代行の呼び出しがタイムアウトしました")]
    Timeout,
}

impl ProcessorError {
    /// キューの再試行で回復しうる失敗かどうか
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessorError::Network(_) | ProcessorError::Timeout)
    }
}

/// 決済代行との契約
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// 既定の支払い手段に対して1回課金する
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeResponse, ProcessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_charge_status() {
        assert_eq!(ChargeStatus::parse("succeeded"), ChargeStatus::Succeeded);
        assert_eq!(
            ChargeStatus::parse("requires_action"),
            ChargeStatus::RequiresAction
        );
        assert_eq!(
            ChargeStatus::parse("requires_payment_method"),
            ChargeStatus::RequiresAction
        );
        assert_eq!(ChargeStatus::parse("canceled"), ChargeStatus::Canceled);
        assert_eq!(ChargeStatus::parse("failed"), ChargeStatus::Failed);
        assert_eq!(ChargeStatus::parse("something_new"), ChargeStatus::Processing);
    }

    #[test]
    fn test_processor_error_is_transient() {
        assert!(ProcessorError::Timeout.is_transient());
        assert!(ProcessorError::Network("reset".to_string()).is_transient());
        assert!(!ProcessorError::Declined {
            code: "card_declined".to_string(),
            message: "declined".to_string(),
        }
        .is_transient());
    }
}
