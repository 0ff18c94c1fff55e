use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 銀行フィードから取得した1件の取引
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedTransaction {
    /// プロバイダが割り当てた取引ID（重複排除キー）
    pub external_id: String,
    /// 口座参照
    pub account_ref: String,
    /// 符号付き金額（最小通貨単位、正の値が出金）
    pub amount_minor: i64,
    /// 計上日
    pub posted_date: NaiveDate,
    /// 取引名
    pub name: String,
    /// カテゴリ（自由文字列）
    pub category: Option<String>,
}

/// 銀行フィード呼び出しのエラー
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    /// プロバイダに到達できない
    #[error("銀行フィードに接続できません: {0}")]
    Unavailable(String),

    /// 認証情報が無効または期限切れ
    #[error("銀行フィードの認証情報が無効です: {0}")]
    InvalidCredential(String),

    /// 応答の形式が不正
    #[error("銀行フィードの応答が不正です: {0}")]
    Malformed(String),
}

/// 銀行フィードプロバイダとの契約
///
/// プロトコルの詳細は実装側が持つ。呼び出し側はタイムアウトを付けて呼ぶ。
#[async_trait]
pub trait BankFeed: Send + Sync {
    /// 期間内の取引一覧を取得する
    ///
    /// # 引数
    /// * `access_token` - 復号済みのアクセストークン
    /// * `start_date` - 取得開始日（含む）
    /// * `end_date` - 取得終了日（含む）
    async fn list_transactions(
        &self,
        access_token: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<FeedTransaction>, FeedError>;
}
