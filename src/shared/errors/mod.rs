use rusqlite::ErrorCode;
use thiserror::Error;

/// エンジン全体で使用するエラー型
///
/// 外部連携のエラー（`FeedError`・`ProcessorError`・`EncryptionError`）は
/// 境界でこの型に変換する。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("データベースエラー: {0}")]
    Database(String),

    /// SQLiteのロック競合（時間をおけば成功しうる）
    #[error("データベースがビジー状態です: {0}")]
    DatabaseBusy(String),

    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("リソースが見つかりません: {0}")]
    NotFound(String),

    /// 銀行フィード・決済代行との連携エラー
    #[error("外部サービスエラー: {0}")]
    ExternalService(String),

    /// 認証情報の暗号化・復号エラー
    #[error("セキュリティエラー: {0}")]
    Security(String),

    #[error("設定エラー: {0}")]
    Configuration(String),

    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON解析エラー: {0}")]
    Json(#[from] serde_json::Error),

    /// ロック・キュー・タスクのエラー
    #[error("並行処理エラー: {0}")]
    Concurrency(String),
}

/// エラーの重要度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// 重要度に対応するログレベル
    pub fn log_level(&self) -> log::Level {
        match self {
            ErrorSeverity::Low => log::Level::Info,
            ErrorSeverity::Medium => log::Level::Warn,
            ErrorSeverity::High | ErrorSeverity::Critical => log::Level::Error,
        }
    }
}

impl AppError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        AppError::Validation(message.into())
    }

    /// リソース未発見エラー（「{resource}が見つかりません」）
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        AppError::NotFound(format!("{}が見つかりません", resource.into()))
    }

    /// 外部サービスエラー
    ///
    /// # 引数
    /// * `service` - 連携先（`bank_feed`・`payment` など）
    /// * `message` - エラー内容
    pub fn external_service<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        AppError::ExternalService(format!("{}: {}", service.into(), message.into()))
    }

    pub fn security<S: Into<String>>(message: S) -> Self {
        AppError::Security(message.into())
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        AppError::Configuration(message.into())
    }

    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        AppError::Concurrency(message.into())
    }

    /// キューで再試行すべきエラーかどうか
    ///
    /// 入力・設定の誤りは再実行しても結果が変わらないため対象外。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ExternalService(_) | AppError::Concurrency(_) | AppError::DatabaseBusy(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AppError::Validation(_) | AppError::NotFound(_) => ErrorSeverity::Low,
            AppError::ExternalService(_) | AppError::DatabaseBusy(_) | AppError::Json(_) => {
                ErrorSeverity::Medium
            }
            AppError::Database(_)
            | AppError::Configuration(_)
            | AppError::Io(_)
            | AppError::Concurrency(_) => ErrorSeverity::High,
            AppError::Security(_) => ErrorSeverity::Critical,
        }
    }

    /// 利用者向けのメッセージ
    ///
    /// 入力起因のエラーは内容をそのまま返し、それ以外は内部情報を含めない。
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) | AppError::NotFound(msg) => msg.clone(),
            AppError::ExternalService(_) => {
                "外部サービスと通信できませんでした。しばらくしてから再度お試しください".to_string()
            }
            AppError::Security(_) => "銀行連携の認証情報を読み取れませんでした".to_string(),
            AppError::Database(_) | AppError::DatabaseBusy(_) => {
                "積み立て台帳の操作でエラーが発生しました".to_string()
            }
            _ => "内部エラーが発生しました".to_string(),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(error: rusqlite::Error) -> Self {
        match &error {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                AppError::DatabaseBusy(error.to_string())
            }
            _ => AppError::Database(error.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::external_service("payment", "timeout").is_retryable());
        assert!(AppError::concurrency("queue closed").is_retryable());
        assert!(AppError::DatabaseBusy("database is locked".to_string()).is_retryable());

        assert!(!AppError::Database("no such table".to_string()).is_retryable());
        assert!(!AppError::validation("limit").is_retryable());
        assert!(!AppError::security("decrypt").is_retryable());
    }

    #[test]
    fn test_sqlite_busy_maps_to_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(AppError::from(busy), AppError::DatabaseBusy(_)));

        let missing: AppError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(missing, AppError::Database(_)));
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_severity_and_log_level() {
        assert_eq!(AppError::validation("x").severity(), ErrorSeverity::Low);
        assert_eq!(
            AppError::external_service("bank_feed", "503").severity().log_level(),
            log::Level::Warn
        );
        assert_eq!(AppError::security("x").severity(), ErrorSeverity::Critical);
        assert!(ErrorSeverity::Critical > ErrorSeverity::Medium);
    }

    #[test]
    fn test_user_message_hides_internal_details() {
        assert_eq!(
            AppError::not_found("ラウンドアップ設定").user_message(),
            "ラウンドアップ設定が見つかりません"
        );

        let message = AppError::Database("UNIQUE constraint failed".to_string()).user_message();
        assert!(!message.contains("UNIQUE"));
    }
}
