use super::aggregator::{aggregate, remaining_limit};
use super::ledger::{IngestReport, LedgerStore};
use super::locks::UserLocks;
use super::models::{BankConnection, RoundUpSetting};
use super::period::{window_start, Frequency};
use super::settings::SettingsStore;
use super::settlement::SettlementExecutor;
use crate::features::integrations::{BankFeed, ChargeJob, JobQueue, RetryPolicy};
use crate::shared::config::EngineConfig;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::security::CredentialEncryption;
use crate::shared::utils::Clock;
use chrono::{DateTime, Days, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// スケジューラの設定
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub feed_timeout: Duration,
    pub max_concurrency: usize,
    pub feed_overlap_days: u64,
    pub timezone: Tz,
    pub retry_policy: RetryPolicy,
}

impl DriverSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            feed_timeout: config.feed_timeout,
            max_concurrency: config.max_concurrency.max(1),
            feed_overlap_days: config.feed_overlap_days.max(0) as u64,
            timezone: config.timezone,
            retry_policy: RetryPolicy::from_config(config),
        }
    }
}

/// 1ユーザー分の取引同期結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub connections_synced: usize,
    pub connections_skipped: usize,
    pub ingest: IngestReport,
}

impl SyncReport {
    fn absorb(&mut self, report: &IngestReport) {
        self.ingest.absorb(report);
    }
}

/// 1回のティックの結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub users_processed: usize,
    pub users_failed: usize,
    pub connections_synced: usize,
    pub connections_skipped: usize,
    pub entries_created: usize,
    pub jobs_enqueued: usize,
    pub stale_recovered: usize,
}

/// 定期的に全ユーザーの取引を取り込み、課金ジョブを投入する
#[derive(Clone)]
pub struct ScheduleDriver {
    ledger: LedgerStore,
    settings: SettingsStore,
    executor: SettlementExecutor,
    feed: Arc<dyn BankFeed>,
    queue: Arc<dyn JobQueue>,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
    encryption: Arc<CredentialEncryption>,
    config: DriverSettings,
}

impl ScheduleDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: LedgerStore,
        settings: SettingsStore,
        executor: SettlementExecutor,
        feed: Arc<dyn BankFeed>,
        queue: Arc<dyn JobQueue>,
        locks: UserLocks,
        clock: Arc<dyn Clock>,
        encryption: Arc<CredentialEncryption>,
        config: DriverSettings,
    ) -> Self {
        Self {
            ledger,
            settings,
            executor,
            feed,
            queue,
            locks,
            clock,
            encryption,
            config,
        }
    }

    /// キャンセルされるまで一定間隔でティックを実行する
    pub async fn run(&self, interval: Duration, cancellation_token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        log::info!("スケジューラを開始します: interval={interval:?}");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    log::info!("スケジューラを停止します");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_tick().await;
                    log::info!("ティック完了: {report:?}");
                }
            }
        }
    }

    /// 1回分のスケジュール処理
    ///
    /// # 処理内容
    /// 1. 長時間PENDINGの決済記録を失敗扱いにする
    /// 2. 有効な設定のユーザーごとに（並行数を制限して）取引を取り込む
    /// 3. 実行時刻を過ぎたユーザーは集計して課金ジョブを投入する
    ///
    /// ユーザー単位の失敗はログに残して次のユーザーへ進む。
    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.executor.recover_stale() {
            Ok(recovered) => report.stale_recovered = recovered,
            Err(e) => log::error!("保留中の決済記録の回復に失敗しました: {e}"),
        }

        let settings = match self.settings.enabled_settings() {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("ラウンドアップ設定の取得に失敗しました: {e}");
                return report;
            }
        };

        let results: Vec<(String, AppResult<(SyncReport, bool)>)> = stream::iter(settings)
            .map(|setting| async move {
                let user_id = setting.user_id.clone();
                (user_id, self.process_user(&setting).await)
            })
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;

        for (user_id, result) in results {
            match result {
                Ok((sync, enqueued)) => {
                    report.users_processed += 1;
                    report.connections_synced += sync.connections_synced;
                    report.connections_skipped += sync.connections_skipped;
                    report.entries_created += sync.ingest.created_entries;
                    if enqueued {
                        report.jobs_enqueued += 1;
                    }
                }
                Err(e) => {
                    report.users_failed += 1;
                    log::log!(
                        e.severity().log_level(),
                        "ユーザーの処理に失敗しました: user_id={user_id}, error={e}"
                    );
                }
            }
        }

        report
    }

    async fn process_user(&self, setting: &RoundUpSetting) -> AppResult<(SyncReport, bool)> {
        let sync = self.sync_user(&setting.user_id, setting.frequency).await?;
        let enqueued = self.enqueue_if_due(setting).await?;
        Ok((sync, enqueued))
    }

    /// ユーザーの全銀行連携から新しい取引を取り込む
    ///
    /// 連携ごとの失敗（復号・取得・タイムアウト）はその連携だけをスキップする。
    ///
    /// # 引数
    /// * `user_id` - 対象ユーザー
    /// * `frequency` - 初回同期の開始日を決める頻度
    pub async fn sync_user(&self, user_id: &str, frequency: Frequency) -> AppResult<SyncReport> {
        let mut report = SyncReport::default();

        for connection in self.ledger.active_connections(user_id)? {
            match self.sync_connection(&connection, frequency).await {
                Ok(ingested) => {
                    report.connections_synced += 1;
                    report.absorb(&ingested);
                }
                Err(e) => {
                    report.connections_skipped += 1;
                    log::warn!(
                        "銀行連携をスキップします: user_id={}, connection_id={}, error={}",
                        user_id,
                        connection.id,
                        e
                    );
                }
            }
        }

        Ok(report)
    }

    async fn sync_connection(&self, connection: &BankConnection, frequency: Frequency) -> AppResult<IngestReport> {
        let access_token = self
            .encryption
            .decrypt_credential(&connection.encrypted_access_token)?;

        let now = self.clock.now();
        let tz = &self.config.timezone;
        let end_date = now.with_timezone(tz).date_naive();
        let start_date = match connection.last_synced_at {
            Some(last_synced_at) => last_synced_at
                .with_timezone(tz)
                .date_naive()
                .checked_sub_days(Days::new(self.config.feed_overlap_days))
                .unwrap_or(end_date),
            None => window_start(frequency, now, tz).with_timezone(tz).date_naive(),
        };

        let transactions = tokio::time::timeout(
            self.config.feed_timeout,
            self.feed.list_transactions(&access_token, start_date, end_date),
        )
        .await
        .map_err(|_| AppError::external_service("bank_feed", "取引一覧の取得がタイムアウトしました"))?
        .map_err(|e| AppError::external_service("bank_feed", e.to_string()))?;

        log::debug!(
            "取引を取得しました: connection_id={}, count={}, range={}..={}",
            connection.id,
            transactions.len(),
            start_date,
            end_date
        );

        let report = self.ledger.ingest(connection, &transactions, now)?;
        self.ledger.mark_connection_synced(connection.id, now)?;
        Ok(report)
    }

    /// 実行時刻を過ぎていれば集計して課金ジョブを投入する
    ///
    /// # 戻り値
    /// ジョブを投入した場合true
    async fn enqueue_if_due(&self, setting: &RoundUpSetting) -> AppResult<bool> {
        if self.clock.now() < setting.next_run_at {
            return Ok(false);
        }
        self.enqueue_charge(setting).await
    }

    /// 実行時刻に関係なく、集計して課金ジョブを投入する
    ///
    /// 既にジョブが投入済みのユーザーや、課金額が0の場合は投入しない。
    ///
    /// # 戻り値
    /// ジョブを投入した場合true
    pub async fn enqueue_charge(&self, setting: &RoundUpSetting) -> AppResult<bool> {
        let now = self.clock.now();
        let user_id = setting.user_id.as_str();
        if !self.locks.try_mark_queued(user_id) {
            log::debug!("課金ジョブが処理中のため集計をスキップします: user_id={user_id}");
            return Ok(false);
        }

        let release = self.locks.release_queued_on_drop(user_id);

        let result = self.build_job(setting, now).await;
        let enqueued = match result {
            Ok(Some(job)) => self.queue.enqueue(job).await.map(|_| true),
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };

        // 投入したジョブが記録を引き継ぎ、ワーカーが外す
        if matches!(enqueued, Ok(true)) {
            release.keep();
        }
        enqueued
    }

    async fn build_job(&self, setting: &RoundUpSetting, now: DateTime<Utc>) -> AppResult<Option<ChargeJob>> {
        let user_id = setting.user_id.as_str();

        let has_instrument = self
            .settings
            .get_payment_profile(user_id)?
            .is_some_and(|profile| profile.default_instrument_ref.is_some());
        if !has_instrument {
            log::info!("既定の支払い手段がないため課金しません: user_id={user_id}");
            return Ok(None);
        }

        let period_start = window_start(setting.frequency, now, &self.config.timezone);
        let committed = self.ledger.committed_since(user_id, period_start)?;
        let remaining = remaining_limit(setting.period_limit, committed);
        let candidates = self.ledger.eligible_entries(user_id)?;
        let aggregation = aggregate(&candidates, remaining);

        if aggregation.is_empty() {
            log::info!(
                "課金対象の金額がありません: user_id={}, candidates={}, remaining_limit={:?}",
                user_id,
                candidates.len(),
                remaining
            );
            return Ok(None);
        }

        log::info!(
            "課金ジョブを作成します: user_id={}, entries={}, total={}",
            user_id,
            aggregation.admitted.len(),
            aggregation.total_admitted
        );
        Ok(Some(ChargeJob::new(
            user_id,
            aggregation.admitted,
            self.config.retry_policy.clone(),
            now,
        )))
    }
}
