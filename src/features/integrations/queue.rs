use crate::shared::config::EngineConfig;
use crate::shared::errors::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 決済ジョブの種別名
pub const SETTLEMENT_JOB_TYPE: &str = "round_up_settlement";

/// ジョブの再試行ポリシー（指数バックオフ、試行回数上限あり）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大試行回数（初回を含む）
    pub max_attempts: u32,
    /// 初期遅延時間
    pub initial_delay: Duration,
    /// バックオフ倍率
    pub backoff_multiplier: f64,
    /// 最大遅延時間
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// エンジン設定からポリシーを作成する
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.job_max_attempts,
            initial_delay: config.job_initial_delay,
            backoff_multiplier: config.job_backoff_multiplier,
            max_delay: config.job_max_delay,
        }
    }

    /// 指定された再試行回数（0始まり）に対する遅延時間を計算
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return self.initial_delay;
        }

        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(retry as i32);

        let delay = Duration::from_millis(delay_ms as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }

    /// `attempt`回目の試行が失敗した後に再試行できるかどうか
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// 上限適用後に課金対象となったエントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmittedEntry {
    pub entry_id: i64,
    /// 上限内で許可された金額（最小通貨単位）
    pub allowed_amount: i64,
}

/// ユーザー単位の課金ジョブ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeJob {
    pub job_id: Uuid,
    pub job_type: String,
    pub user_id: String,
    pub entries: Vec<AdmittedEntry>,
    pub total_amount: i64,
    /// 現在の試行回数（1始まり）
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub enqueued_at: DateTime<Utc>,
}

impl ChargeJob {
    /// 新しい課金ジョブを作成する
    ///
    /// # 引数
    /// * `user_id` - 対象ユーザー
    /// * `entries` - 課金対象エントリと許可額
    /// * `retry_policy` - キューの再試行ポリシー
    /// * `now` - 投入時刻
    pub fn new(
        user_id: &str,
        entries: Vec<AdmittedEntry>,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let total_amount = entries.iter().map(|e| e.allowed_amount).sum();
        Self {
            job_id: Uuid::new_v4(),
            job_type: SETTLEMENT_JOB_TYPE.to_string(),
            user_id: user_id.to_string(),
            entries,
            total_amount,
            attempt: 1,
            retry_policy,
            enqueued_at: now,
        }
    }

    /// 次の試行用のジョブを作成する
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn entry_ids(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.entry_id).collect()
    }
}

/// ジョブキューとの契約（少なくとも1回の配信）
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// ジョブを即時投入する
    async fn enqueue(&self, job: ChargeJob) -> AppResult<()>;

    /// 遅延後にジョブを再投入する
    async fn schedule_retry(&self, job: ChargeJob, delay: Duration) -> AppResult<()>;
}

/// tokioのmpscチャネルによるプロセス内ジョブキュー
#[derive(Debug, Clone)]
pub struct InProcessJobQueue {
    sender: mpsc::UnboundedSender<ChargeJob>,
    pending_retries: Arc<AtomicUsize>,
}

/// プロセス内ジョブキューの受信側
#[derive(Debug)]
pub struct JobReceiver {
    receiver: mpsc::UnboundedReceiver<ChargeJob>,
    pending_retries: Arc<AtomicUsize>,
}

impl InProcessJobQueue {
    /// キューと受信側のペアを作成する
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending_retries = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sender,
                pending_retries: Arc::clone(&pending_retries),
            },
            JobReceiver {
                receiver,
                pending_retries,
            },
        )
    }

    fn send(&self, job: ChargeJob) -> AppResult<()> {
        self.sender
            .send(job)
            .map_err(|e| AppError::concurrency(format!("ジョブキューが閉じています: {}", e.0.job_id)))
    }
}

#[async_trait]
impl JobQueue for InProcessJobQueue {
    async fn enqueue(&self, job: ChargeJob) -> AppResult<()> {
        log::debug!(
            "ジョブを投入: type={}, job_id={}, user_id={}, amount={}",
            job.job_type,
            job.job_id,
            job.user_id,
            job.total_amount
        );
        self.send(job)
    }

    async fn schedule_retry(&self, job: ChargeJob, delay: Duration) -> AppResult<()> {
        if self.sender.is_closed() {
            return Err(AppError::concurrency("ジョブキューが閉じています"));
        }

        log::info!(
            "ジョブを再投入予定: job_id={}, attempt={}, delay={:?}",
            job.job_id,
            job.attempt,
            delay
        );

        self.pending_retries.fetch_add(1, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.send(job) {
                log::error!("ジョブの再投入に失敗しました: {e}");
            }
            queue.pending_retries.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(())
    }
}

impl JobReceiver {
    /// 次のジョブを待機して受信する
    pub async fn recv(&mut self) -> Option<ChargeJob> {
        self.receiver.recv().await
    }

    /// 待機せずに受信する
    pub fn try_recv(&mut self) -> Option<ChargeJob> {
        self.receiver.try_recv().ok()
    }

    /// 遅延再投入待ちのジョブ数
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> ChargeJob {
        ChargeJob::new(
            "user-1",
            vec![
                AdmittedEntry {
                    entry_id: 1,
                    allowed_amount: 75,
                },
                AdmittedEntry {
                    entry_id: 2,
                    allowed_amount: 125,
                },
            ],
            RetryPolicy::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_calculate_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(500));
        assert_eq!(policy.calculate_delay(10), Duration::from_millis(500));
    }

    #[test]
    fn test_can_retry_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.can_retry(1));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
    }

    #[test]
    fn test_charge_job_totals() {
        let job = sample_job();
        assert_eq!(job.total_amount, 200);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.job_type, SETTLEMENT_JOB_TYPE);
        assert_eq!(job.entry_ids(), vec![1, 2]);

        let next = job.next_attempt();
        assert_eq!(next.attempt, 2);
        assert_eq!(next.job_id, job.job_id);
    }

    #[test]
    fn test_charge_job_serializes() {
        let job = sample_job();
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("round_up_settlement"));
        assert!(json.contains("user-1"));
    }

    #[tokio::test]
    async fn test_enqueue_and_receive() {
        let (queue, mut receiver) = InProcessJobQueue::new();
        let job = sample_job();

        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(receiver.recv().await, Some(job));
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_schedule_retry_delivers_later() {
        let (queue, mut receiver) = InProcessJobQueue::new();
        let job = sample_job().next_attempt();

        queue
            .schedule_retry(job.clone(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(receiver.pending_retries(), 1);

        let delivered = receiver.recv().await.unwrap();
        assert_eq!(delivered.attempt, 2);

        // 送信後にカウンタが減るまで待つ
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(receiver.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_receiver_dropped_fails() {
        let (queue, receiver) = InProcessJobQueue::new();
        drop(receiver);
        let result = queue.enqueue(sample_job()).await;
        assert!(matches!(result, Err(AppError::Concurrency(_))));
    }
}
