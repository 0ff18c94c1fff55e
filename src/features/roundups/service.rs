use super::ledger::LedgerStore;
use super::models::{
    BankAccount, BankConnection, ConfigureRoundUpDto, Paginated, PaymentProfile, PeriodSavings,
    RoundUpEntry, RoundUpSetting, RoundUpStatus, SettlementQuery, SettlementRecord,
};
use super::period::{next_run, window_start, Frequency};
use super::scheduler::{ScheduleDriver, SyncReport};
use super::settings::{SettingValues, SettingsStore};
use super::settlement::SettlementExecutor;
use crate::features::integrations::ChargeStatus;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::security::CredentialEncryption;
use crate::shared::utils::Clock;
use chrono_tz::Tz;
use std::sync::Arc;

/// 認証済みユーザーからの操作をまとめたサービス
///
/// ユーザーIDは呼び出し側（認証コンテキスト）から渡される。
#[derive(Clone)]
pub struct RoundUpService {
    ledger: LedgerStore,
    settings: SettingsStore,
    driver: ScheduleDriver,
    executor: SettlementExecutor,
    encryption: Arc<CredentialEncryption>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
}

impl RoundUpService {
    pub fn new(
        ledger: LedgerStore,
        settings: SettingsStore,
        driver: ScheduleDriver,
        executor: SettlementExecutor,
        encryption: Arc<CredentialEncryption>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
    ) -> Self {
        Self {
            ledger,
            settings,
            driver,
            executor,
            encryption,
            clock,
            timezone,
        }
    }

    /// ラウンドアップ設定を作成または更新する
    ///
    /// # 引数
    /// * `user_id` - 認証済みユーザーID
    /// * `dto` - 設定内容
    ///
    /// # 戻り値
    /// 保存後の設定
    ///
    /// # 処理内容
    /// 新規作成時と頻度変更時は次回実行時刻を再計算し、それ以外は維持する
    pub fn configure(&self, user_id: &str, dto: ConfigureRoundUpDto) -> AppResult<RoundUpSetting> {
        // バリデーション
        validate_configure_dto(&dto)?;

        let now = self.clock.now();
        let frequency = Frequency::parse(&dto.frequency);
        let next_run_at = match self.settings.get_setting(user_id)? {
            Some(existing) if existing.frequency == frequency => existing.next_run_at,
            _ => next_run(frequency, now, &self.timezone),
        };

        let values = SettingValues {
            enabled: dto.enabled,
            frequency,
            period_limit: dto.period_limit,
            destination: dto.destination.filter(|d| !d.trim().is_empty()),
        };
        self.settings.upsert_setting(user_id, &values, next_run_at, now)?;

        log::info!(
            "ラウンドアップ設定を保存しました: user_id={}, enabled={}, frequency={}",
            user_id,
            values.enabled,
            frequency
        );
        self.settings
            .get_setting(user_id)?
            .ok_or_else(|| AppError::not_found("ラウンドアップ設定"))
    }

    pub fn get_setting(&self, user_id: &str) -> AppResult<Option<RoundUpSetting>> {
        self.settings.get_setting(user_id)
    }

    /// 取引を今すぐ同期し、未決済のエントリを返す
    pub async fn sync_now(&self, user_id: &str) -> AppResult<(SyncReport, Vec<RoundUpEntry>)> {
        let frequency = self
            .settings
            .get_setting(user_id)?
            .map(|s| s.frequency)
            .unwrap_or(Frequency::Daily);

        let report = self.driver.sync_user(user_id, frequency).await?;
        let open_entries = self
            .ledger
            .list_entries(user_id, None)?
            .into_iter()
            .filter(|entry| entry.status.is_open())
            .collect();
        Ok((report, open_entries))
    }

    /// 積み立て済みの合計額
    pub fn total_savings(&self, user_id: &str) -> AppResult<i64> {
        self.ledger.total_invested(user_id)
    }

    /// 現在の期間に発生した未決済のラウンドアップ合計
    ///
    /// 期間は設定の頻度の境界（当日・当週・当月の開始）で区切る。
    pub fn current_period_savings(&self, user_id: &str) -> AppResult<PeriodSavings> {
        let frequency = self
            .settings
            .get_setting(user_id)?
            .map(|s| s.frequency)
            .unwrap_or(Frequency::Daily);
        let start = window_start(frequency, self.clock.now(), &self.timezone);

        Ok(PeriodSavings {
            frequency,
            window_start: start,
            total: self.ledger.open_total_since(user_id, start)?,
        })
    }

    pub fn list_entries(&self, user_id: &str, status: Option<&str>) -> AppResult<Vec<RoundUpEntry>> {
        let status = status.map(RoundUpStatus::parse).transpose()?;
        self.ledger.list_entries(user_id, status)
    }

    pub fn list_settlements(
        &self,
        user_id: &str,
        query: &SettlementQuery,
    ) -> AppResult<Paginated<SettlementRecord>> {
        self.ledger.list_settlements(user_id, query)
    }

    /// 最終失敗のエントリを再試行する
    ///
    /// # 戻り値
    /// RETRY_PENDINGに戻したエントリのID
    ///
    /// # 処理内容
    /// 1. 最終失敗のエントリをRETRY_PENDINGに戻し、拒否回数をリセット
    /// 2. 設定があれば次回実行時刻を待たずに課金ジョブを投入
    pub async fn retry_failed(&self, user_id: &str) -> AppResult<Vec<i64>> {
        let reopened = self.ledger.reopen_failed(user_id, self.clock.now())?;
        if reopened.is_empty() {
            return Ok(reopened);
        }

        match self.settings.get_setting(user_id)? {
            Some(setting) if setting.enabled => {
                let enqueued = self.driver.enqueue_charge(&setting).await?;
                log::info!(
                    "失敗したエントリを再試行します: user_id={}, entries={}, enqueued={}",
                    user_id,
                    reopened.len(),
                    enqueued
                );
            }
            _ => log::info!("ラウンドアップが無効のため次回の有効化まで待機します: user_id={user_id}"),
        }
        Ok(reopened)
    }

    /// 銀行連携を登録する（アクセストークンは暗号化して保存）
    pub fn register_connection(
        &self,
        user_id: &str,
        institution: &str,
        access_token: &str,
    ) -> AppResult<BankConnection> {
        if access_token.trim().is_empty() {
            return Err(AppError::validation("アクセストークンは必須です"));
        }
        let sealed = self.encryption.encrypt_credential(access_token)?;
        self.ledger
            .register_connection(user_id, institution, &sealed, self.clock.now())
    }

    pub fn register_account(
        &self,
        connection_id: i64,
        account_ref: &str,
        name: &str,
    ) -> AppResult<BankAccount> {
        self.ledger
            .register_account(connection_id, account_ref, name, self.clock.now())
    }

    pub fn upsert_payment_profile(&self, profile: &PaymentProfile) -> AppResult<PaymentProfile> {
        self.settings.upsert_payment_profile(profile, self.clock.now())
    }

    /// 決済代行からの通知で保留中の決済を確定する
    pub async fn resolve_pending(
        &self,
        reference: &str,
        status: &str,
        failure_code: Option<&str>,
    ) -> AppResult<SettlementRecord> {
        self.executor
            .resolve_pending(reference, ChargeStatus::parse(status), failure_code)
            .await
    }
}

/// 設定DTOのバリデーション
fn validate_configure_dto(dto: &ConfigureRoundUpDto) -> AppResult<()> {
    if let Some(limit) = dto.period_limit {
        if limit < 0 {
            return Err(AppError::validation("期間上限は0以上である必要があります"));
        }
    }
    if dto.frequency.trim().is_empty() {
        return Err(AppError::validation("頻度は必須です"));
    }
    Ok(())
}
