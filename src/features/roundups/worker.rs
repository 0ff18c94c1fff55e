use super::locks::UserLocks;
use super::settlement::{JobOutcome, SettlementExecutor};
use crate::features::integrations::{ChargeJob, JobQueue, JobReceiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// 1件のジョブ処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    Skipped,
    RetryScheduled,
    Abandoned,
    Failed,
}

/// キューから課金ジョブを受け取り、ユーザー単位で直列に実行する
#[derive(Clone)]
pub struct SettlementWorker {
    executor: SettlementExecutor,
    queue: Arc<dyn JobQueue>,
    locks: UserLocks,
    semaphore: Arc<Semaphore>,
}

impl SettlementWorker {
    pub fn new(
        executor: SettlementExecutor,
        queue: Arc<dyn JobQueue>,
        locks: UserLocks,
        max_concurrency: usize,
    ) -> Self {
        Self {
            executor,
            queue,
            locks,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// キャンセルされるまでジョブを処理する
    ///
    /// キャンセル後も、受信済み・再投入待ちのジョブはすべて処理してから終了する。
    pub async fn run(&self, mut receiver: JobReceiver, cancellation_token: CancellationToken) {
        let mut tasks = JoinSet::new();
        log::info!("決済ワーカーを開始します");

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                job = receiver.recv() => match job {
                    Some(job) => self.spawn_job(&mut tasks, job),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join_result(joined),
            }
        }

        log::info!("決済ワーカーを停止します（残りのジョブを処理します）");
        loop {
            while let Some(job) = receiver.try_recv() {
                self.spawn_job(&mut tasks, job);
            }

            if tasks.is_empty() {
                if receiver.pending_retries() == 0 {
                    match receiver.try_recv() {
                        Some(job) => self.spawn_job(&mut tasks, job),
                        None => break,
                    }
                } else {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                continue;
            }

            if let Some(joined) = tasks.join_next().await {
                log_join_result(joined);
            }
        }
        log::info!("決済ワーカーを停止しました");
    }

    fn spawn_job(&self, tasks: &mut JoinSet<JobDisposition>, job: ChargeJob) {
        let worker = self.clone();
        tasks.spawn(async move {
            let Ok(_permit) = Arc::clone(&worker.semaphore).acquire_owned().await else {
                return JobDisposition::Failed;
            };
            worker.handle_job(job).await
        });
    }

    /// ジョブを1件処理する
    ///
    /// # 処理内容
    /// 1. ユーザーのロックを取得（同一ユーザーの決済を直列化）
    /// 2. 決済を実行
    /// 3. 一時的な失敗は再試行ポリシーに従って遅延再投入し、上限到達時は破棄する
    pub async fn handle_job(&self, job: ChargeJob) -> JobDisposition {
        let release = self.locks.release_queued_on_drop(&job.user_id);
        let disposition = {
            let _guard = self.locks.lock_user(&job.user_id).await;
            log::debug!(
                "ジョブを処理します: job_id={}, user_id={}, attempt={}",
                job.job_id,
                job.user_id,
                job.attempt
            );

            match self.executor.execute_job(&job).await {
                Ok(JobOutcome::Completed(_)) => JobDisposition::Completed,
                Ok(JobOutcome::Skipped) => JobDisposition::Skipped,
                Ok(JobOutcome::Retry(record)) => {
                    log::warn!(
                        "決済が一時的に失敗しました: job_id={}, settlement_id={}",
                        job.job_id,
                        record.id
                    );
                    self.retry_or_abandon(&job).await
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("ジョブの実行に失敗しました（再試行対象）: job_id={}, error={}", job.job_id, e);
                    self.retry_or_abandon(&job).await
                }
                Err(e) => {
                    log::error!("ジョブの実行に失敗しました: job_id={}, error={}", job.job_id, e);
                    JobDisposition::Failed
                }
            }
        };

        // 再投入したジョブが投入済みの記録を引き継ぐ
        if disposition == JobDisposition::RetryScheduled {
            release.keep();
        }
        disposition
    }

    async fn retry_or_abandon(&self, job: &ChargeJob) -> JobDisposition {
        let policy = &job.retry_policy;
        if policy.can_retry(job.attempt) {
            let delay = policy.calculate_delay(job.attempt.saturating_sub(1));
            match self.queue.schedule_retry(job.next_attempt(), delay).await {
                Ok(()) => return JobDisposition::RetryScheduled,
                Err(e) => log::error!("ジョブの再投入に失敗しました: job_id={}, error={}", job.job_id, e),
            }
        }

        match self.executor.abandon(job) {
            Ok(_) => JobDisposition::Abandoned,
            Err(e) => {
                log::error!("ジョブの破棄に失敗しました: job_id={}, error={}", job.job_id, e);
                JobDisposition::Failed
            }
        }
    }
}

fn log_join_result(joined: Result<JobDisposition, tokio::task::JoinError>) {
    match joined {
        Ok(disposition) => log::debug!("ジョブ処理完了: {disposition:?}"),
        Err(e) => log::error!("ジョブのタスクが異常終了しました: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::integrations::{
        AdmittedEntry, InProcessJobQueue, ProcessorError, RetryPolicy,
    };
    use crate::features::roundups::ledger::LedgerStore;
    use crate::features::roundups::models::{PaymentProfile, RoundUpStatus};
    use crate::features::roundups::period::Frequency;
    use crate::features::roundups::settings::{SettingValues, SettingsStore};
    use crate::features::roundups::settlement::{ExecutorSettings, RETRY_EXHAUSTED_REASON};
    use crate::features::roundups::test_support::{
        feed_tx, seed_connection, setup_ledger, t0, MockPaymentProcessor,
    };
    use crate::shared::utils::FixedClock;
    use chrono_tz::Tz;

    struct Fixture {
        ledger: LedgerStore,
        processor: Arc<MockPaymentProcessor>,
        locks: UserLocks,
        receiver: JobReceiver,
        worker: SettlementWorker,
    }

    fn fixture() -> Fixture {
        let (db, ledger) = setup_ledger();
        let settings = SettingsStore::new(Arc::clone(&db));
        settings
            .upsert_setting(
                "user-1",
                &SettingValues {
                    enabled: true,
                    frequency: Frequency::Daily,
                    period_limit: None,
                    destination: None,
                },
                t0(),
                t0(),
            )
            .unwrap();
        settings
            .upsert_payment_profile(
                &PaymentProfile {
                    user_id: "user-1".to_string(),
                    customer_ref: "cus_1".to_string(),
                    default_instrument_ref: Some("card_1".to_string()),
                },
                t0(),
            )
            .unwrap();
        let connection = seed_connection(&ledger, "user-1");
        ledger
            .ingest(&connection, &[feed_tx("tx-1", 425, 1), feed_tx("tx-2", 1050, 2)], t0())
            .unwrap();

        let processor = Arc::new(MockPaymentProcessor::new());
        let executor = SettlementExecutor::new(
            ledger.clone(),
            settings,
            processor.clone(),
            Arc::new(FixedClock::new(t0())),
            ExecutorSettings {
                processor_timeout: Duration::from_secs(1),
                max_decline_retries: 3,
                stale_after: chrono::Duration::minutes(60),
                timezone: Tz::UTC,
            },
        );
        let (queue, receiver) = InProcessJobQueue::new();
        let locks = UserLocks::new();
        let worker = SettlementWorker::new(executor, Arc::new(queue), locks.clone(), 2);

        Fixture {
            ledger,
            processor,
            locks,
            receiver,
            worker,
        }
    }

    fn job(f: &Fixture, policy: RetryPolicy) -> ChargeJob {
        let entries = f
            .ledger
            .eligible_entries("user-1")
            .unwrap()
            .iter()
            .map(|e| AdmittedEntry {
                entry_id: e.id,
                allowed_amount: e.round_up_amount,
            })
            .collect();
        ChargeJob::new("user-1", entries, policy, t0())
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_completed_job_clears_queued_marker() {
        let f = fixture();
        f.locks.try_mark_queued("user-1");

        let disposition = f.worker.handle_job(job(&f, fast_policy(3))).await;
        assert_eq!(disposition, JobDisposition::Completed);
        assert!(!f.locks.is_queued("user-1"));
        assert_eq!(f.ledger.total_invested("user-1").unwrap(), 125);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_abandoned() {
        let mut f = fixture();
        f.processor.push_response(Err(ProcessorError::Timeout));
        f.processor
            .push_response(Err(ProcessorError::Network("reset".to_string())));
        f.locks.try_mark_queued("user-1");

        let first = f.worker.handle_job(job(&f, fast_policy(2))).await;
        assert_eq!(first, JobDisposition::RetryScheduled);
        assert!(f.locks.is_queued("user-1"));

        let retried = tokio::time::timeout(Duration::from_secs(1), f.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempt, 2);

        let second = f.worker.handle_job(retried).await;
        assert_eq!(second, JobDisposition::Abandoned);
        assert!(!f.locks.is_queued("user-1"));

        let entries = f.ledger.list_entries("user-1", None).unwrap();
        assert!(entries.iter().all(|e| e.status == RoundUpStatus::Failed
            && e.failure_reason.as_deref() == Some(RETRY_EXHAUSTED_REASON)));
        assert_eq!(f.processor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_without_double_charge() {
        let mut f = fixture();
        f.processor.push_response(Err(ProcessorError::Timeout));

        let first = f.worker.handle_job(job(&f, fast_policy(3))).await;
        assert_eq!(first, JobDisposition::RetryScheduled);

        let retried = tokio::time::timeout(Duration::from_secs(1), f.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.worker.handle_job(retried.clone()).await, JobDisposition::Completed);

        // 再配信は何もしない
        assert_eq!(f.worker.handle_job(retried).await, JobDisposition::Skipped);
        assert_eq!(f.processor.call_count(), 2);
        assert_eq!(f.ledger.total_invested("user-1").unwrap(), 125);
    }

    #[tokio::test]
    async fn test_run_drains_enqueued_jobs_on_cancel() {
        let f = fixture();
        let (queue, receiver) = InProcessJobQueue::new();
        queue.enqueue(job(&f, fast_policy(3))).await.unwrap();

        // キャンセル済みでも投入済みのジョブは処理される
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), f.worker.run(receiver, token))
            .await
            .unwrap();

        assert_eq!(f.processor.call_count(), 1);
        assert_eq!(f.ledger.total_invested("user-1").unwrap(), 125);
    }

    #[tokio::test]
    async fn test_run_processes_jobs_until_cancelled() {
        let f = fixture();
        let job = job(&f, fast_policy(3));
        let (queue, receiver) = InProcessJobQueue::new();
        let worker = f.worker.clone();
        let token = CancellationToken::new();

        let handle = {
            let token = token.clone();
            tokio::spawn(async move { worker.run(receiver, token).await })
        };

        queue.enqueue(job).await.unwrap();
        for _ in 0..100 {
            if f.ledger.total_invested("user-1").unwrap() == 125 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.ledger.total_invested("user-1").unwrap(), 125);
        assert_eq!(f.processor.call_count(), 1);
    }
}
