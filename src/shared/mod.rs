/// 共有エラー型とエラーハンドリング
pub mod errors;

/// 共有データベース接続管理
pub mod database;

/// 共有設定管理
pub mod config;

/// 認証情報の暗号化
pub mod security;

/// 共有ユーティリティ関数
pub mod utils;

// 便利な再エクスポート
pub use config::{
    get_environment, initialize_logging_system, load_environment_variables, EngineConfig,
    Environment, EnvironmentConfig,
};
pub use database::{create_in_memory_connection, create_tables, initialize_database};
pub use errors::{AppError, AppResult, ErrorSeverity};
pub use utils::{Clock, FixedClock, SystemClock};
