/// 実行環境・ログ・.env読み込み
pub mod environment;

/// ラウンドアップエンジン設定
pub mod engine;

pub use engine::EngineConfig;
pub use environment::{
    get_database_filename, get_environment, initialize_logging_system,
    load_environment_variables, Environment, EnvironmentConfig,
};
