use super::ledger::{LedgerStore, NewSettlement, SettlementOutcome};
use super::models::{PaymentProfile, RoundUpEntry, SettlementRecord, SettlementStatus};
use super::period::next_run;
use super::settings::SettingsStore;
use crate::features::integrations::{
    AdmittedEntry, ChargeJob, ChargeRequest, ChargeStatus, PaymentProcessor, ProcessorError,
};
use crate::shared::config::EngineConfig;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::Clock;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 上限到達でジョブを破棄したときのエントリの失敗理由
pub const RETRY_EXHAUSTED_REASON: &str = "retry_exhausted";

/// 決済実行の設定
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub processor_timeout: Duration,
    pub max_decline_retries: u32,
    pub stale_after: chrono::Duration,
    pub timezone: Tz,
}

impl ExecutorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            processor_timeout: config.processor_timeout,
            max_decline_retries: config.max_decline_retries,
            stale_after: chrono::Duration::minutes(config.stale_settlement_minutes),
            timezone: config.timezone,
        }
    }
}

/// 1回の課金試行の結果
#[derive(Debug, Clone)]
pub struct SettlementAttempt {
    pub record: SettlementRecord,
    /// タイムアウト・通信エラーでキューの再試行対象かどうか
    pub transient: bool,
}

/// ジョブ実行の結果
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// 課金対象が残っていないため何もしなかった
    Skipped,
    /// 決済記録が確定または保留になった
    Completed(SettlementRecord),
    /// 一時的な失敗（キューで再試行する）
    Retry(SettlementRecord),
}

/// 集計済みの金額を1回課金し、結果を台帳に反映する
#[derive(Clone)]
pub struct SettlementExecutor {
    ledger: LedgerStore,
    settings: SettingsStore,
    processor: Arc<dyn PaymentProcessor>,
    clock: Arc<dyn Clock>,
    config: ExecutorSettings,
}

impl SettlementExecutor {
    pub fn new(
        ledger: LedgerStore,
        settings: SettingsStore,
        processor: Arc<dyn PaymentProcessor>,
        clock: Arc<dyn Clock>,
        config: ExecutorSettings,
    ) -> Self {
        Self {
            ledger,
            settings,
            processor,
            clock,
            config,
        }
    }

    /// 課金ジョブを実行する
    ///
    /// 再配信に備え、課金前にエントリの状態を再確認する。
    /// 既に積み立て済み・処理中のエントリは課金対象から外す。
    ///
    /// # 引数
    /// * `job` - キューから受け取った課金ジョブ
    ///
    /// # 戻り値
    /// 実行結果
    pub async fn execute_job(&self, job: &ChargeJob) -> AppResult<JobOutcome> {
        let chargeable = self
            .ledger
            .chargeable_entries(&job.user_id, &job.entry_ids())?;
        let admitted = restrict_to_chargeable(&job.entries, &chargeable);

        if admitted.is_empty() {
            log::info!(
                "課金対象のエントリが残っていないためスキップします: job_id={}, user_id={}",
                job.job_id,
                job.user_id
            );
            return Ok(JobOutcome::Skipped);
        }

        let profile = self
            .settings
            .get_payment_profile(&job.user_id)?
            .filter(|p| p.default_instrument_ref.is_some());
        let Some(profile) = profile else {
            log::info!(
                "支払い手段が登録されていないためスキップします: user_id={}",
                job.user_id
            );
            return Ok(JobOutcome::Skipped);
        };

        let total: i64 = admitted.iter().map(|e| e.allowed_amount).sum();
        let job_id = job.job_id.to_string();
        let attempt = self
            .settle(&job.user_id, &admitted, total, &profile, Some(&job_id))
            .await?;

        if attempt.transient {
            Ok(JobOutcome::Retry(attempt.record))
        } else {
            Ok(JobOutcome::Completed(attempt.record))
        }
    }

    /// 集計額を決済代行に1回課金する
    ///
    /// # 引数
    /// * `user_id` - 対象ユーザー
    /// * `admitted` - 課金対象エントリと許可額
    /// * `total_amount` - 課金額（許可額の合計と一致すること）
    /// * `profile` - 顧客参照と既定の支払い手段
    /// * `job_id` - 由来するジョブ
    ///
    /// # 戻り値
    /// 作成・更新された決済記録
    ///
    /// # 処理内容
    /// 1. PENDINGの決済記録と明細を作成
    /// 2. タイムアウト付きで決済代行を1回呼び出す
    /// 3. 応答を決済記録とエントリに1トランザクションで反映
    /// 4. 一時的な失敗以外はスケジュールを進める（最終実行時刻は成功時のみ）
    pub async fn settle(
        &self,
        user_id: &str,
        admitted: &[AdmittedEntry],
        total_amount: i64,
        profile: &PaymentProfile,
        job_id: Option<&str>,
    ) -> AppResult<SettlementAttempt> {
        let sum: i64 = admitted.iter().map(|e| e.allowed_amount).sum();
        if total_amount <= 0 || sum != total_amount {
            return Err(AppError::validation(format!(
                "課金額が不正です: total={total_amount}, sum={sum}"
            )));
        }
        let Some(instrument_ref) = profile.default_instrument_ref.as_deref() else {
            return Err(AppError::validation("既定の支払い手段が登録されていません"));
        };

        let entry_ids: Vec<i64> = admitted.iter().map(|e| e.entry_id).collect();
        let entries = self.ledger.chargeable_entries(user_id, &entry_ids)?;
        if entries.len() != admitted.len() {
            return Err(AppError::validation("課金できないエントリが含まれています"));
        }
        let idempotency_key = idempotency_key(user_id, &entries);

        let record = self.ledger.begin_settlement(
            &NewSettlement {
                user_id,
                customer_ref: &profile.customer_ref,
                instrument_ref,
                idempotency_key: &idempotency_key,
                job_id,
                entries: admitted,
            },
            self.clock.now(),
        )?;

        let request = ChargeRequest {
            customer_ref: profile.customer_ref.clone(),
            instrument_ref: instrument_ref.to_string(),
            amount_minor: total_amount,
            idempotency_key,
            description: format!("Round-up savings ({} transactions)", admitted.len()),
        };

        let result = tokio::time::timeout(self.config.processor_timeout, self.processor.charge(request))
            .await
            .unwrap_or(Err(ProcessorError::Timeout));
        let outcome = outcome_from_processor(result);
        let transient = matches!(outcome, SettlementOutcome::Transient { .. });

        let now = self.clock.now();
        let record = self.ledger.complete_settlement(
            record.id,
            &outcome,
            self.config.max_decline_retries,
            now,
        )?;

        if !transient {
            self.advance_schedule(user_id, now, record.status == SettlementStatus::Success)?;
        }

        Ok(SettlementAttempt { record, transient })
    }

    /// 保留中だった決済を決済代行からの通知で確定する
    ///
    /// # 引数
    /// * `reference` - 決済代行の支払い参照
    /// * `status` - 通知された状態
    /// * `failure_code` - 失敗時のコード
    ///
    /// # 戻り値
    /// 更新後の決済記録（まだ確定していない状態なら変更なし）
    pub async fn resolve_pending(
        &self,
        reference: &str,
        status: ChargeStatus,
        failure_code: Option<&str>,
    ) -> AppResult<SettlementRecord> {
        let record = self
            .ledger
            .find_settlement_by_reference(reference)?
            .ok_or_else(|| AppError::not_found(format!("支払い参照 {reference} の決済記録")))?;

        let outcome = match status {
            ChargeStatus::Succeeded => SettlementOutcome::Succeeded {
                reference: reference.to_string(),
            },
            ChargeStatus::Canceled | ChargeStatus::Failed => SettlementOutcome::Declined {
                reference: Some(reference.to_string()),
                code: failure_code
                    .map(str::to_string)
                    .unwrap_or_else(|| charge_status_code(status).to_string()),
            },
            ChargeStatus::Processing | ChargeStatus::RequiresAction => {
                log::debug!("決済はまだ確定していません: reference={reference}");
                return Ok(record);
            }
        };

        let now = self.clock.now();
        let updated = self.ledger.complete_settlement(
            record.id,
            &outcome,
            self.config.max_decline_retries,
            now,
        )?;

        if record.status == SettlementStatus::Pending && updated.status == SettlementStatus::Success {
            if let Some(setting) = self.settings.get_setting(&updated.user_id)? {
                self.settings
                    .record_run(&updated.user_id, now, true, setting.next_run_at)?;
            }
        }

        Ok(updated)
    }

    /// 再試行上限に達したジョブのエントリを最終失敗にする
    ///
    /// 拒否と同じく次回実行時刻を進め、同じ期間内での再課金を防ぐ。
    pub fn abandon(&self, job: &ChargeJob) -> AppResult<usize> {
        let now = self.clock.now();
        let abandoned = self.ledger.abandon_entries(
            &job.user_id,
            &job.entry_ids(),
            RETRY_EXHAUSTED_REASON,
            now,
        )?;
        self.advance_schedule(&job.user_id, now, false)?;
        log::error!(
            "再試行上限に達したためジョブを破棄しました（手動対応が必要）: job_id={}, user_id={}, entries={}",
            job.job_id,
            job.user_id,
            abandoned
        );
        Ok(abandoned)
    }

    /// 一定時間PENDINGのままの決済記録を失敗扱いにする
    pub fn recover_stale(&self) -> AppResult<usize> {
        let now = self.clock.now();
        self.ledger.recover_stale(now - self.config.stale_after, now)
    }

    fn advance_schedule(&self, user_id: &str, attempted_at: DateTime<Utc>, succeeded: bool) -> AppResult<()> {
        let Some(setting) = self.settings.get_setting(user_id)? else {
            log::warn!("ラウンドアップ設定がないためスケジュールを更新しません: user_id={user_id}");
            return Ok(());
        };
        let next = next_run(setting.frequency, attempted_at, &self.config.timezone);
        self.settings.record_run(user_id, attempted_at, succeeded, next)
    }
}

/// ジョブの許可額を、現在も課金可能なエントリだけに絞り込む
fn restrict_to_chargeable(requested: &[AdmittedEntry], chargeable: &[RoundUpEntry]) -> Vec<AdmittedEntry> {
    let amounts: HashMap<i64, i64> = chargeable
        .iter()
        .map(|e| (e.id, e.round_up_amount))
        .collect();

    requested
        .iter()
        .filter_map(|entry| {
            let round_up_amount = amounts.get(&entry.entry_id)?;
            let allowed = entry.allowed_amount.min(*round_up_amount);
            (allowed > 0).then_some(AdmittedEntry {
                entry_id: entry.entry_id,
                allowed_amount: allowed,
            })
        })
        .collect()
}

/// 決済代行の応答を台帳の結果に変換する
fn outcome_from_processor(
    result: Result<crate::features::integrations::ChargeResponse, ProcessorError>,
) -> SettlementOutcome {
    match result {
        Ok(response) => match response.status {
            ChargeStatus::Succeeded => SettlementOutcome::Succeeded {
                reference: response.reference,
            },
            ChargeStatus::Processing | ChargeStatus::RequiresAction => SettlementOutcome::Pending {
                reference: response.reference,
            },
            ChargeStatus::Canceled | ChargeStatus::Failed => SettlementOutcome::Declined {
                code: response
                    .failure_code
                    .unwrap_or_else(|| charge_status_code(response.status).to_string()),
                reference: Some(response.reference),
            },
        },
        Err(ProcessorError::Declined { code, .. }) => SettlementOutcome::Declined {
            reference: None,
            code,
        },
        Err(error) => SettlementOutcome::Transient {
            message: error.to_string(),
        },
    }
}

fn charge_status_code(status: ChargeStatus) -> &'static str {
    match status {
        ChargeStatus::Succeeded => "succeeded",
        ChargeStatus::Processing => "processing",
        ChargeStatus::RequiresAction => "requires_action",
        ChargeStatus::Canceled => "canceled",
        ChargeStatus::Failed => "failed",
    }
}

/// 決済代行に渡す冪等キーを作成する
///
/// ユーザーIDとソート済みエントリID、拒否回数から計算する。
/// 同じエントリ集合の再配信・一時的失敗後の再試行では同じキーになり、
/// 拒否後の次回試行では別のキーになる。
pub fn idempotency_key(user_id: &str, entries: &[RoundUpEntry]) -> String {
    let mut keyed: Vec<(i64, u32)> = entries.iter().map(|e| (e.id, e.decline_count)).collect();
    keyed.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    for (entry_id, decline_count) in keyed {
        hasher.update(b"|");
        hasher.update(entry_id.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(decline_count.to_string().as_bytes());
    }

    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
