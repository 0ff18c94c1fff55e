/// 銀行フィードプロバイダ
pub mod bank_feed;

/// 決済代行
pub mod payment;

/// ジョブキュー
pub mod queue;

pub use bank_feed::{BankFeed, FeedError, FeedTransaction};
pub use payment::{ChargeRequest, ChargeResponse, ChargeStatus, PaymentProcessor, ProcessorError};
pub use queue::{AdmittedEntry, ChargeJob, InProcessJobQueue, JobQueue, JobReceiver, RetryPolicy};
