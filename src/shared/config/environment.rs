use std::str::FromStr;
use thiserror::Error;

/// 実行環境
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// 環境名から実行環境を決める（"production" 以外はすべて開発環境）
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

/// 環境変数の解決エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvVarError {
    #[error("環境変数 {0} が設定されていません（起動時・ビルド時のいずれにもありません）")]
    Missing(String),
}

/// 起動時の値を優先し、なければビルド時に埋め込まれた値を使う
///
/// マクロから呼び出すための関数。`compiled` には `option_env!` の結果を渡す。
#[doc(hidden)]
pub fn resolve_env_var(
    var_name: &str,
    compiled: Option<&'static str>,
) -> Result<String, EnvVarError> {
    match (std::env::var(var_name), compiled) {
        (Ok(value), _) => {
            log::trace!("{var_name}: 起動時の値を使用");
            Ok(value)
        }
        (Err(_), Some(value)) => {
            log::trace!("{var_name}: ビルド時の値を使用");
            Ok(value.to_string())
        }
        (Err(_), None) => Err(EnvVarError::Missing(var_name.to_string())),
    }
}

/// 環境変数を取得する
///
/// 起動時の環境変数、ビルド時に埋め込まれた値の順に探す。
/// `option_env!` を展開するため、変数名はリテラルで渡すこと。
#[macro_export]
macro_rules! get_env_var {
    ($var_name:literal) => {
        $crate::shared::config::environment::resolve_env_var($var_name, option_env!($var_name))
    };
}

/// 環境変数を `Option` で取得する
#[macro_export]
macro_rules! get_env_var_optional {
    ($var_name:literal) => {
        $crate::get_env_var!($var_name).ok()
    };
}

/// 環境変数を取得し、なければ既定値を文字列で返す
#[macro_export]
macro_rules! get_env_var_or_default {
    ($var_name:literal, $default_value:expr) => {
        match $crate::get_env_var!($var_name) {
            Ok(value) => value,
            Err(_) => {
                let fallback = $default_value.to_string();
                log::debug!("{} は未設定のため既定値 {} を使用します", $var_name, fallback);
                fallback
            }
        }
    };
}

/// 実行環境とログ出力の設定
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub environment: Environment,
    /// `LOG_LEVEL` の解釈結果（未設定・不正値は環境ごとの既定値）
    pub log_level: log::LevelFilter,
}

impl EnvironmentConfig {
    pub fn from_env() -> Self {
        let environment = get_environment();
        let fallback = match environment {
            Environment::Development => log::LevelFilter::Debug,
            Environment::Production => log::LevelFilter::Info,
        };
        let log_level = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|level| log::LevelFilter::from_str(level.trim()).ok())
            .unwrap_or(fallback);

        Self {
            environment,
            log_level,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

/// 現在の実行環境を判定する
///
/// # 判定順序
/// 1. ビルド時に埋め込まれた `EMBEDDED_ENVIRONMENT`
/// 2. 起動時の `ENVIRONMENT`
/// 3. どちらもなければビルドプロファイル（debug なら開発環境）
pub fn get_environment() -> Environment {
    if let Some(embedded) = option_env!("EMBEDDED_ENVIRONMENT") {
        return Environment::from_name(embedded);
    }

    match std::env::var("ENVIRONMENT") {
        Ok(name) => Environment::from_name(&name),
        Err(_) if cfg!(debug_assertions) => Environment::Development,
        Err(_) => Environment::Production,
    }
}

/// 実行環境ごとのデータベースファイル名
pub fn get_database_filename(env: Environment) -> &'static str {
    match env {
        Environment::Development => "dev_roundups.db",
        Environment::Production => "roundups.db",
    }
}

/// .envファイルを読み込む
///
/// 本番では `.env.production` を先に試し、見つからなければ `.env` を読む。
/// ビルド時に環境が埋め込まれている場合は何もしない。
pub fn load_environment_variables() {
    if option_env!("EMBEDDED_ENVIRONMENT").is_some() {
        return;
    }

    let environment =
        Environment::from_name(&std::env::var("ENVIRONMENT").unwrap_or_default());
    let candidates: &[&str] = match environment {
        Environment::Production => &[".env.production", ".env"],
        Environment::Development => &[".env"],
    };

    let loaded = candidates
        .iter()
        .find(|file| dotenv::from_filename(file).is_ok());
    match loaded {
        Some(file) => log::info!("{file} を読み込みました（環境: {}）", environment.as_str()),
        None => log::warn!(".envファイルがありません。設定済みの環境変数のみを使用します"),
    }
}

/// env_loggerを初期化する（すでに初期化済みなら何もしない）
pub fn initialize_logging_system() {
    let config = EnvironmentConfig::from_env();

    let initialized = env_logger::Builder::from_default_env()
        .filter_level(config.log_level)
        .format_timestamp_secs()
        .format_target(false)
        .try_init()
        .is_ok();

    if initialized {
        log::info!(
            "ログ出力を開始しました: level={}, environment={}",
            config.log_level,
            config.environment.as_str()
        );
    }
}
