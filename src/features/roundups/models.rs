use super::period::Frequency;
use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// ラウンドアップエントリの状態
///
/// PENDING → {INVESTED, FAILED, INSUFFICIENT_FUNDS, CARD_DECLINED, RETRY_PENDING}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundUpStatus {
    Pending,
    Invested,
    Failed,
    InsufficientFunds,
    CardDeclined,
    RetryPending,
}

impl RoundUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundUpStatus::Pending => "PENDING",
            RoundUpStatus::Invested => "INVESTED",
            RoundUpStatus::Failed => "FAILED",
            RoundUpStatus::InsufficientFunds => "INSUFFICIENT_FUNDS",
            RoundUpStatus::CardDeclined => "CARD_DECLINED",
            RoundUpStatus::RetryPending => "RETRY_PENDING",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "PENDING" => Ok(RoundUpStatus::Pending),
            "INVESTED" => Ok(RoundUpStatus::Invested),
            "FAILED" => Ok(RoundUpStatus::Failed),
            "INSUFFICIENT_FUNDS" => Ok(RoundUpStatus::InsufficientFunds),
            "CARD_DECLINED" => Ok(RoundUpStatus::CardDeclined),
            "RETRY_PENDING" => Ok(RoundUpStatus::RetryPending),
            other => Err(AppError::validation(format!(
                "不明なラウンドアップ状態です: {other}"
            ))),
        }
    }

    /// 次回の集計対象になる状態かどうか
    pub fn is_open(&self) -> bool {
        matches!(self, RoundUpStatus::Pending | RoundUpStatus::RetryPending)
    }

    /// 自動では遷移しない失敗状態かどうか
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            RoundUpStatus::Failed | RoundUpStatus::InsufficientFunds | RoundUpStatus::CardDeclined
        )
    }

    /// 決済代行の拒否コードから最終失敗状態を決める
    pub fn terminal_for_code(code: &str) -> Self {
        match code {
            "insufficient_funds" => RoundUpStatus::InsufficientFunds,
            "card_declined" => RoundUpStatus::CardDeclined,
            _ => RoundUpStatus::Failed,
        }
    }
}

/// 決済記録の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementStatus {
    Success,
    Pending,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Success => "SUCCESS",
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "SUCCESS" => Ok(SettlementStatus::Success),
            "PENDING" => Ok(SettlementStatus::Pending),
            "FAILED" => Ok(SettlementStatus::Failed),
            other => Err(AppError::validation(format!(
                "不明な決済状態です: {other}"
            ))),
        }
    }
}

/// 銀行連携（アクセストークンは暗号化済み）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConnection {
    pub id: i64,
    pub user_id: String,
    pub institution: String,
    #[serde(skip_serializing)]
    pub encrypted_access_token: String,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: String,
    pub updated_at: String,
}

/// 連携済み口座
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: i64,
    pub connection_id: i64,
    pub user_id: String,
    pub account_ref: String,
    pub name: String,
    pub created_at: String,
}

/// 銀行フィードから取り込んだ取引
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: i64,
    pub external_id: String,
    pub account_id: i64,
    pub user_id: String,
    pub amount: i64,
    pub posted_date: NaiveDate,
    pub name: String,
    pub category: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// 1件の取引から算出したラウンドアップ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundUpEntry {
    pub id: i64,
    pub user_id: String,
    pub source_transaction_id: i64,
    pub external_id: String,
    pub posted_date: NaiveDate,
    pub round_up_amount: i64,
    pub detected_amount: i64,
    pub status: RoundUpStatus,
    pub settlement_id: Option<i64>,
    /// 決済成功時に実際に積み立てられた金額（上限により一部のみの場合あり）
    pub invested_amount: Option<i64>,
    pub failure_reason: Option<String>,
    pub decline_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// ユーザーごとのラウンドアップ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundUpSetting {
    pub id: i64,
    pub user_id: String,
    pub enabled: bool,
    pub frequency: Frequency,
    /// 期間ごとの上限額（None は無制限）
    pub period_limit: Option<i64>,
    pub destination: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: String,
    pub updated_at: String,
}

/// 1回の課金試行の記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub status: SettlementStatus,
    pub processor_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub customer_ref: String,
    pub instrument_ref: String,
    pub idempotency_key: String,
    pub job_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// 決済記録に含まれるエントリと許可額
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementItem {
    pub settlement_id: i64,
    pub entry_id: i64,
    pub allowed_amount: i64,
}

/// 課金に使う顧客・既定の支払い手段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProfile {
    pub user_id: String,
    pub customer_ref: String,
    pub default_instrument_ref: Option<String>,
}

/// ラウンドアップ設定の作成・更新用DTO
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureRoundUpDto {
    pub enabled: bool,
    pub frequency: String,
    pub period_limit: Option<i64>,
    pub destination: Option<String>,
}

/// 決済履歴の検索条件
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementQuery {
    /// ページ番号（1始まり）
    pub page: u32,
    pub limit: u32,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl Default for SettlementQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 10,
            from: None,
            to: None,
        }
    }
}

/// ページング情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

/// ページング付きの一覧
#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// 現在の期間に積み立て待ちの金額
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodSavings {
    pub frequency: Frequency,
    pub window_start: DateTime<Utc>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_status_roundtrip() {
        let all = [
            RoundUpStatus::Pending,
            RoundUpStatus::Invested,
            RoundUpStatus::Failed,
            RoundUpStatus::InsufficientFunds,
            RoundUpStatus::CardDeclined,
            RoundUpStatus::RetryPending,
        ];
        for status in all {
            assert_eq!(RoundUpStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RoundUpStatus::parse("SUCCEEDED").is_err());
    }

    #[test]
    fn test_round_up_status_classes() {
        assert!(RoundUpStatus::Pending.is_open());
        assert!(RoundUpStatus::RetryPending.is_open());
        assert!(!RoundUpStatus::Invested.is_open());
        assert!(RoundUpStatus::CardDeclined.is_terminal_failure());
        assert!(!RoundUpStatus::Invested.is_terminal_failure());
    }

    #[test]
    fn test_terminal_for_code() {
        assert_eq!(
            RoundUpStatus::terminal_for_code("card_declined"),
            RoundUpStatus::CardDeclined
        );
        assert_eq!(
            RoundUpStatus::terminal_for_code("insufficient_funds"),
            RoundUpStatus::InsufficientFunds
        );
        assert_eq!(
            RoundUpStatus::terminal_for_code("expired_card"),
            RoundUpStatus::Failed
        );
    }

    #[test]
    fn test_status_serialization_matches_storage() {
        let json = serde_json::to_string(&RoundUpStatus::RetryPending).unwrap();
        assert_eq!(json, "\"RETRY_PENDING\"");
        let json = serde_json::to_string(&SettlementStatus::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }
}
