/// ラウンドアップ積み立て機能モジュール
///
/// このモジュールは、ラウンドアップの積み立てと決済に関連するすべての機能を提供します：
/// - 取引の取り込みとラウンドアップ額の計算
/// - 期間上限を適用した集計
/// - 決済代行への課金と台帳への反映
/// - 定期実行のスケジューラと決済ワーカー
pub mod aggregator;
pub mod calculator;
pub mod ledger;
pub mod locks;
pub mod models;
pub mod period;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod settlement;
pub mod worker;

#[cfg(test)]
pub mod test_support;


// 公開インターフェース
pub use aggregator::{aggregate, remaining_limit, Aggregation};
pub use calculator::{detected_amount, parse_minor_units, round_up};
pub use ledger::{IngestReport, LedgerStore, SettlementOutcome};
pub use locks::UserLocks;
pub use models::{
    BankAccount, BankConnection, BankTransaction, ConfigureRoundUpDto, Paginated, Pagination,
    PaymentProfile, PeriodSavings, RoundUpEntry, RoundUpSetting, RoundUpStatus, SettlementItem,
    SettlementQuery, SettlementRecord, SettlementStatus,
};
pub use period::{next_run, window_start, Frequency};
pub use scheduler::{DriverSettings, ScheduleDriver, SyncReport, TickReport};
pub use service::RoundUpService;
pub use settings::{SettingValues, SettingsStore};
pub use settlement::{ExecutorSettings, JobOutcome, SettlementAttempt, SettlementExecutor};
pub use worker::{JobDisposition, SettlementWorker};
