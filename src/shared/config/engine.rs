use super::environment::{get_database_filename, get_environment, Environment};
use crate::shared::errors::{AppError, AppResult};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 開発環境でのみ使用するフォールバック暗号化キー
const DEVELOPMENT_ENCRYPTION_KEY: &str = "development_roundup_key_32_bytes";

/// ラウンドアップエンジンの設定を管理する構造体
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLiteデータベースファイルのパス
    pub database_path: PathBuf,
    /// スケジューラのティック間隔
    pub tick_interval: Duration,
    /// 銀行フィード呼び出しのタイムアウト
    pub feed_timeout: Duration,
    /// 決済代行呼び出しのタイムアウト
    pub processor_timeout: Duration,
    /// ユーザー単位処理の最大並列数
    pub max_concurrency: usize,
    /// 課金ジョブの最大試行回数
    pub job_max_attempts: u32,
    /// 課金ジョブの初回リトライ遅延
    pub job_initial_delay: Duration,
    /// 課金ジョブのバックオフ倍率
    pub job_backoff_multiplier: f64,
    /// 課金ジョブの最大リトライ遅延
    pub job_max_delay: Duration,
    /// エントリごとの拒否リトライ上限
    pub max_decline_retries: u32,
    /// PENDINGの決済記録を失敗扱いにするまでの時間（分）
    pub stale_settlement_minutes: i64,
    /// フィード取得時に前回同期から遡る日数
    pub feed_overlap_days: i64,
    /// 期間境界の計算に使うタイムゾーン
    pub timezone: Tz,
    /// 銀行フィード認証情報の暗号化キー
    pub encryption_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(get_database_filename(Environment::Development)),
            tick_interval: Duration::from_secs(6 * 60 * 60),
            feed_timeout: Duration::from_secs(30),
            processor_timeout: Duration::from_secs(30),
            max_concurrency: 5,
            job_max_attempts: 5,
            job_initial_delay: Duration::from_millis(1000),
            job_backoff_multiplier: 2.0,
            job_max_delay: Duration::from_millis(60_000),
            max_decline_retries: 3,
            stale_settlement_minutes: 60,
            feed_overlap_days: 3,
            timezone: Tz::UTC,
            encryption_key: DEVELOPMENT_ENCRYPTION_KEY.to_string(),
        }
    }
}

impl EngineConfig {
    /// 環境変数からエンジン設定を読み込む
    ///
    /// # 戻り値
    /// エンジン設定、または必須設定が欠けている場合はエラー
    pub fn from_env() -> AppResult<Self> {
        log::debug!("EngineConfig::from_env() - 環境変数の読み込みを開始");
        let defaults = Self::default();
        let environment = get_environment();

        let database_path = match crate::get_env_var_optional!("ROUNDUP_DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_database_path(environment)?,
        };

        let tick_interval = Duration::from_secs(parse_or_default(
            "ROUNDUP_TICK_INTERVAL_SECONDS",
            crate::get_env_var_or_default!("ROUNDUP_TICK_INTERVAL_SECONDS", "21600"),
            defaults.tick_interval.as_secs(),
        ));
        let feed_timeout = Duration::from_secs(parse_or_default(
            "ROUNDUP_FEED_TIMEOUT_SECONDS",
            crate::get_env_var_or_default!("ROUNDUP_FEED_TIMEOUT_SECONDS", "30"),
            defaults.feed_timeout.as_secs(),
        ));
        let processor_timeout = Duration::from_secs(parse_or_default(
            "ROUNDUP_PROCESSOR_TIMEOUT_SECONDS",
            crate::get_env_var_or_default!("ROUNDUP_PROCESSOR_TIMEOUT_SECONDS", "30"),
            defaults.processor_timeout.as_secs(),
        ));
        let max_concurrency = parse_or_default(
            "ROUNDUP_MAX_CONCURRENCY",
            crate::get_env_var_or_default!("ROUNDUP_MAX_CONCURRENCY", "5"),
            defaults.max_concurrency,
        );
        let job_max_attempts = parse_or_default(
            "ROUNDUP_JOB_MAX_ATTEMPTS",
            crate::get_env_var_or_default!("ROUNDUP_JOB_MAX_ATTEMPTS", "5"),
            defaults.job_max_attempts,
        );
        let job_initial_delay = Duration::from_millis(parse_or_default(
            "ROUNDUP_JOB_INITIAL_DELAY_MS",
            crate::get_env_var_or_default!("ROUNDUP_JOB_INITIAL_DELAY_MS", "1000"),
            1000,
        ));
        let job_backoff_multiplier = parse_or_default(
            "ROUNDUP_JOB_BACKOFF_MULTIPLIER",
            crate::get_env_var_or_default!("ROUNDUP_JOB_BACKOFF_MULTIPLIER", "2.0"),
            defaults.job_backoff_multiplier,
        );
        let job_max_delay = Duration::from_millis(parse_or_default(
            "ROUNDUP_JOB_MAX_DELAY_MS",
            crate::get_env_var_or_default!("ROUNDUP_JOB_MAX_DELAY_MS", "60000"),
            60_000,
        ));
        let max_decline_retries = parse_or_default(
            "ROUNDUP_MAX_DECLINE_RETRIES",
            crate::get_env_var_or_default!("ROUNDUP_MAX_DECLINE_RETRIES", "3"),
            defaults.max_decline_retries,
        );
        let stale_settlement_minutes = parse_or_default(
            "ROUNDUP_STALE_SETTLEMENT_MINUTES",
            crate::get_env_var_or_default!("ROUNDUP_STALE_SETTLEMENT_MINUTES", "60"),
            defaults.stale_settlement_minutes,
        );
        let feed_overlap_days = parse_or_default(
            "ROUNDUP_FEED_OVERLAP_DAYS",
            crate::get_env_var_or_default!("ROUNDUP_FEED_OVERLAP_DAYS", "3"),
            defaults.feed_overlap_days,
        );

        let timezone_name = crate::get_env_var_or_default!("ROUNDUP_TIMEZONE", "UTC");
        let timezone = Tz::from_str(&timezone_name).map_err(|e| {
            AppError::configuration(format!("タイムゾーンの解析に失敗しました: {timezone_name} ({e})"))
        })?;

        let encryption_key = match crate::get_env_var_optional!("ROUNDUP_ENCRYPTION_KEY") {
            Some(key) => key,
            None if environment == Environment::Production => {
                return Err(AppError::configuration(
                    "ROUNDUP_ENCRYPTION_KEY が設定されていません",
                ));
            }
            None => {
                log::warn!("ROUNDUP_ENCRYPTION_KEY が設定されていないため、開発用の既定値を使用（本番環境では必ず設定してください）");
                DEVELOPMENT_ENCRYPTION_KEY.to_string()
            }
        };

        let config = Self {
            database_path,
            tick_interval,
            feed_timeout,
            processor_timeout,
            max_concurrency,
            job_max_attempts,
            job_initial_delay,
            job_backoff_multiplier,
            job_max_delay,
            max_decline_retries,
            stale_settlement_minutes,
            feed_overlap_days,
            timezone,
            encryption_key,
        };

        config.validate().map_err(AppError::configuration)?;

        log::debug!("EngineConfig::from_env() - 設定の読み込みが完了しました");
        log::info!("エンジン設定: {:?}", config.get_debug_info());

        Ok(config)
    }

    /// 設定を検証する
    ///
    /// # 戻り値
    /// 設定が有効な場合はOk(())、無効な場合はErr
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval.is_zero() {
            return Err("ティック間隔は0より大きい値である必要があります".to_string());
        }
        if self.feed_timeout.is_zero() || self.processor_timeout.is_zero() {
            return Err("外部呼び出しのタイムアウトは0より大きい値である必要があります".to_string());
        }
        if self.max_concurrency == 0 {
            return Err("最大並列数は1以上である必要があります".to_string());
        }
        if self.job_max_attempts == 0 {
            return Err("課金ジョブの最大試行回数は1以上である必要があります".to_string());
        }
        if self.job_backoff_multiplier < 1.0 {
            return Err("バックオフ倍率は1.0以上である必要があります".to_string());
        }
        if self.max_decline_retries == 0 {
            return Err("拒否リトライ上限は1以上である必要があります".to_string());
        }
        if self.stale_settlement_minutes <= 0 {
            return Err("PENDING判定時間は0より大きい値である必要があります".to_string());
        }
        if self.feed_overlap_days < 0 {
            return Err("フィードの遡り日数は0以上である必要があります".to_string());
        }
        // 暗号化キーの長さをチェック（最低16バイト）
        if self.encryption_key.len() < 16 {
            return Err("暗号化キーは最低16文字以上である必要があります".to_string());
        }
        Ok(())
    }

    /// デバッグ情報を取得（秘匿情報は含めない）
    pub fn get_debug_info(&self) -> HashMap<String, String> {
        let mut info = HashMap::new();
        info.insert(
            "database_path".to_string(),
            self.database_path.display().to_string(),
        );
        info.insert(
            "tick_interval_seconds".to_string(),
            self.tick_interval.as_secs().to_string(),
        );
        info.insert(
            "feed_timeout_seconds".to_string(),
            self.feed_timeout.as_secs().to_string(),
        );
        info.insert(
            "processor_timeout_seconds".to_string(),
            self.processor_timeout.as_secs().to_string(),
        );
        info.insert(
            "max_concurrency".to_string(),
            self.max_concurrency.to_string(),
        );
        info.insert(
            "job_max_attempts".to_string(),
            self.job_max_attempts.to_string(),
        );
        info.insert(
            "max_decline_retries".to_string(),
            self.max_decline_retries.to_string(),
        );
        info.insert("timezone".to_string(), self.timezone.name().to_string());
        info.insert(
            "encryption_key_length".to_string(),
            self.encryption_key.len().to_string(),
        );
        info
    }
}

/// アプリデータディレクトリ内のデータベースファイルパスを取得する
fn default_database_path(environment: Environment) -> AppResult<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| AppError::configuration("アプリデータディレクトリの取得に失敗しました"))?
        .join("roundup-engine");

    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            AppError::configuration(format!("アプリデータディレクトリの作成に失敗: {e}"))
        })?;
        log::info!("アプリケーションデータディレクトリを作成: {:?}", data_dir);
    }

    Ok(data_dir.join(get_database_filename(environment)))
}

/// 文字列を解析し、失敗時は警告を出してデフォルト値を返す
fn parse_or_default<T>(name: &str, raw: String, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    raw.trim().parse().unwrap_or_else(|_| {
        log::warn!("{name}のパースに失敗しました（値: {raw}）。デフォルト値{default}を使用します");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval, Duration::from_secs(21600));
        assert_eq!(config.timezone, Tz::UTC);
    }

    #[test]
    fn test_validate_rejects_short_key() {
        let config = EngineConfig {
            encryption_key: "short".to_string(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_or_default() {
        assert_eq!(parse_or_default("X", "42".to_string(), 7u64), 42);
        assert_eq!(parse_or_default("X", "abc".to_string(), 7u64), 7);
        assert_eq!(parse_or_default("X", " 2.5 ".to_string(), 1.0f64), 2.5);
    }

    #[test]
    fn test_debug_info_hides_key() {
        let config = EngineConfig::default();
        let info = config.get_debug_info();
        assert!(!info.values().any(|v| v.contains(&config.encryption_key)));
        assert_eq!(info.get("timezone"), Some(&"UTC".to_string()));
    }
}
