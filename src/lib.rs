pub mod features;
pub mod shared;

use features::integrations::{BankFeed, InProcessJobQueue, JobQueue, PaymentProcessor};
use features::roundups::{
    DriverSettings, ExecutorSettings, LedgerStore, RoundUpService, ScheduleDriver,
    SettingsStore, SettlementExecutor, SettlementWorker, UserLocks,
};
use log::{error, info};
use rusqlite::Connection;
use shared::config::{initialize_logging_system, load_environment_variables, EngineConfig};
use shared::database::initialize_database;
use shared::errors::{AppError, AppResult};
use shared::security::CredentialEncryption;
use shared::utils::{Clock, SystemClock};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 起動中のエンジン（スケジューラとワーカー）への参照
pub struct EngineHandle {
    service: RoundUpService,
    cancellation_token: CancellationToken,
    scheduler: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl EngineHandle {
    /// ユーザー操作用のサービス
    pub fn service(&self) -> &RoundUpService {
        &self.service
    }

    /// スケジューラを止め、投入済みのジョブを処理し終えてからワーカーを止める
    pub async fn shutdown(self) -> AppResult<()> {
        info!("エンジンを停止しています...");
        self.cancellation_token.cancel();

        self.scheduler
            .await
            .map_err(|e| AppError::concurrency(format!("スケジューラの停止に失敗しました: {e}")))?;
        self.worker
            .await
            .map_err(|e| AppError::concurrency(format!("ワーカーの停止に失敗しました: {e}")))?;

        info!("エンジンを停止しました");
        Ok(())
    }
}

/// .env・ログ・エンジン設定を読み込む
pub fn load_engine_config() -> AppResult<EngineConfig> {
    load_environment_variables();
    initialize_logging_system();

    let config = EngineConfig::from_env()?;
    info!("エンジン設定: {:?}", config.get_debug_info());
    Ok(config)
}

/// エンジンを起動する（tokioランタイム内で呼び出すこと）
///
/// # 引数
/// * `config` - エンジン設定
/// * `feed` - 銀行フィードの実装
/// * `processor` - 決済代行の実装
///
/// # 戻り値
/// 停止に使うハンドル
pub fn start_engine(
    config: EngineConfig,
    feed: Arc<dyn BankFeed>,
    processor: Arc<dyn PaymentProcessor>,
) -> AppResult<EngineHandle> {
    start_engine_with_clock(config, feed, processor, Arc::new(SystemClock))
}

/// 時刻の取得元を指定してエンジンを起動する
///
/// # 処理内容
/// 1. 設定の検証とデータベースの初期化
/// 2. 台帳・設定・決済・スケジューラ・ワーカーの組み立て
/// 3. スケジューラとワーカーをタスクとして起動
pub fn start_engine_with_clock(
    config: EngineConfig,
    feed: Arc<dyn BankFeed>,
    processor: Arc<dyn PaymentProcessor>,
    clock: Arc<dyn Clock>,
) -> AppResult<EngineHandle> {
    info!("エンジンの初期化を開始します...");

    // 設定の検証
    config.validate().map_err(|e| {
        error!("エンジン設定の検証に失敗しました: {e}");
        AppError::configuration(e)
    })?;

    // データベースを初期化
    let db = Arc::new(Mutex::new(open_database(&config)?));
    let ledger = LedgerStore::new(Arc::clone(&db));
    let settings = SettingsStore::new(db);

    let encryption = Arc::new(CredentialEncryption::new(&config.encryption_key));
    let locks = UserLocks::new();
    let (queue, receiver) = InProcessJobQueue::new();
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    let executor = SettlementExecutor::new(
        ledger.clone(),
        settings.clone(),
        processor,
        Arc::clone(&clock),
        ExecutorSettings::from_config(&config),
    );
    let driver = ScheduleDriver::new(
        ledger.clone(),
        settings.clone(),
        executor.clone(),
        feed,
        Arc::clone(&queue),
        locks.clone(),
        Arc::clone(&clock),
        Arc::clone(&encryption),
        DriverSettings::from_config(&config),
    );
    let worker = SettlementWorker::new(executor.clone(), queue, locks, config.max_concurrency);
    let service = RoundUpService::new(
        ledger,
        settings,
        driver.clone(),
        executor,
        encryption,
        clock,
        config.timezone,
    );

    let cancellation_token = CancellationToken::new();
    let scheduler = {
        let token = cancellation_token.clone();
        let interval = config.tick_interval;
        tokio::spawn(async move { driver.run(interval, token).await })
    };
    let worker = {
        let token = cancellation_token.clone();
        tokio::spawn(async move { worker.run(receiver, token).await })
    };

    info!("エンジンの初期化が完了しました");
    Ok(EngineHandle {
        service,
        cancellation_token,
        scheduler,
        worker,
    })
}

fn open_database(config: &EngineConfig) -> AppResult<Connection> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    initialize_database(&config.database_path).map_err(|e| {
        error!("データベースの初期化に失敗しました: {e}");
        e
    })
}
