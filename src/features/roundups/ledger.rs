use super::calculator::{detected_amount, round_up};
use super::models::{
    BankAccount, BankConnection, Paginated, Pagination, RoundUpEntry, RoundUpStatus,
    SettlementItem, SettlementQuery, SettlementRecord, SettlementStatus,
};
use crate::features::integrations::{AdmittedEntry, FeedTransaction};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::{format_date, format_timestamp, parse_date, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};

/// 保留中の決済記録を失敗扱いにしたときの理由
pub const STALE_PENDING_REASON: &str = "stale_pending_timeout";

const ENTRY_SELECT: &str = "SELECT e.id, e.user_id, e.source_transaction_id, t.external_id, t.posted_date,
        e.round_up_amount, e.detected_amount, e.status, e.settlement_id, e.invested_amount,
        e.failure_reason, e.decline_count, e.created_at, e.updated_at
     FROM round_up_entries e
     JOIN bank_transactions t ON t.id = e.source_transaction_id";

const SETTLEMENT_SELECT: &str = "SELECT id, user_id, amount, status, processor_reference, failure_reason,
        customer_ref, instrument_ref, idempotency_key, job_id, created_at, updated_at
     FROM settlement_records";

/// エントリがPENDINGの決済記録に含まれていないことを表す条件
const NOT_IN_PENDING_SETTLEMENT: &str = "NOT EXISTS (
        SELECT 1 FROM settlement_items si
        JOIN settlement_records sr ON sr.id = si.settlement_id
        WHERE si.entry_id = e.id AND sr.status = 'PENDING'
     )";

/// 1回の取り込み結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// 新規に保存した取引数
    pub inserted_transactions: usize,
    /// 既存取引を更新した数
    pub updated_transactions: usize,
    /// 新規に作成したPENDINGエントリ数
    pub created_entries: usize,
    /// 既に積み立て済みのためスキップした数
    pub skipped_invested: usize,
    /// 入金または端数なしのためエントリを作らなかった数
    pub skipped_without_round_up: usize,
    /// 口座が特定できず、または保存に失敗して破棄した数
    pub dropped: usize,
    /// 金額の変更に合わせて再計算した未決済エントリ数
    pub recomputed_entries: usize,
}

impl IngestReport {
    /// 別の取り込み結果を合算する
    pub fn absorb(&mut self, other: &IngestReport) {
        self.inserted_transactions += other.inserted_transactions;
        self.updated_transactions += other.updated_transactions;
        self.created_entries += other.created_entries;
        self.skipped_invested += other.skipped_invested;
        self.skipped_without_round_up += other.skipped_without_round_up;
        self.dropped += other.dropped;
        self.recomputed_entries += other.recomputed_entries;
    }
}

/// 決済記録の作成内容
#[derive(Debug, Clone)]
pub struct NewSettlement<'a> {
    pub user_id: &'a str,
    pub customer_ref: &'a str,
    pub instrument_ref: &'a str,
    pub idempotency_key: &'a str,
    pub job_id: Option<&'a str>,
    pub entries: &'a [AdmittedEntry],
}

/// 決済代行の応答を台帳に反映するための結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// 課金成功
    Succeeded { reference: String },
    /// 決済代行側で処理中・追加操作待ち
    Pending { reference: String },
    /// 拒否などの確定的な失敗
    Declined {
        reference: Option<String>,
        code: String,
    },
    /// タイムアウト・通信エラー
    Transient { message: String },
}

/// 取り込んだ取引・ラウンドアップエントリ・決済記録の台帳
///
/// 1回の決済試行に関する状態変更はすべて1つのSQLiteトランザクションで行う。
#[derive(Clone)]
pub struct LedgerStore {
    db_connection: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    pub fn new(db_connection: Arc<Mutex<Connection>>) -> Self {
        Self { db_connection }
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.db_connection
            .lock()
            .map_err(|e| AppError::concurrency(format!("データベースロック取得失敗: {e}")))
    }

    // ---- 銀行連携・口座 ----

    /// 銀行連携を登録する
    ///
    /// # 引数
    /// * `user_id` - 所有ユーザー
    /// * `institution` - 金融機関名
    /// * `encrypted_access_token` - 暗号化済みアクセストークン
    /// * `now` - 登録時刻
    pub fn register_connection(
        &self,
        user_id: &str,
        institution: &str,
        encrypted_access_token: &str,
        now: DateTime<Utc>,
    ) -> AppResult<BankConnection> {
        let conn = self.connection()?;
        let timestamp = format_timestamp(now);
        conn.execute(
            "INSERT INTO bank_connections
                (user_id, institution, encrypted_access_token, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)",
            params![user_id, institution, encrypted_access_token, timestamp],
        )?;
        let id = conn.last_insert_rowid();
        get_connection(&conn, id)
    }

    /// 連携に口座を登録する（同じ口座参照は再登録しない）
    pub fn register_account(
        &self,
        connection_id: i64,
        account_ref: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> AppResult<BankAccount> {
        let conn = self.connection()?;
        let connection = get_connection(&conn, connection_id)?;

        if let Some(existing) = find_account(&conn, account_ref)? {
            if existing.connection_id != connection_id {
                return Err(AppError::validation(format!(
                    "口座 {account_ref} は別の連携に登録済みです"
                )));
            }
            return Ok(existing);
        }

        conn.execute(
            "INSERT INTO bank_accounts (connection_id, user_id, account_ref, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                connection_id,
                connection.user_id,
                account_ref,
                name,
                format_timestamp(now)
            ],
        )?;

        find_account(&conn, account_ref)?.ok_or_else(|| AppError::not_found("口座"))
    }

    /// ユーザーの有効な銀行連携を取得する
    pub fn active_connections(&self, user_id: &str) -> AppResult<Vec<BankConnection>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, institution, encrypted_access_token, is_active, last_synced_at,
                    created_at, updated_at
             FROM bank_connections WHERE user_id = ?1 AND is_active = 1 ORDER BY id",
        )?;
        let connections = stmt
            .query_map(params![user_id], map_connection)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(connections)
    }

    /// 連携の最終同期時刻を更新する
    pub fn mark_connection_synced(&self, connection_id: i64, synced_at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.connection()?;
        let timestamp = format_timestamp(synced_at);
        let updated = conn.execute(
            "UPDATE bank_connections SET last_synced_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![timestamp, connection_id],
        )?;
        if updated == 0 {
            return Err(AppError::not_found("銀行連携"));
        }
        Ok(())
    }

    // ---- 取り込み ----

    /// フィードの取引を取り込み、ラウンドアップエントリを作成する
    ///
    /// # 引数
    /// * `connection` - 取引を取得した銀行連携
    /// * `transactions` - フィードから取得した取引
    /// * `now` - 取り込み時刻
    ///
    /// # 戻り値
    /// 取り込み結果の集計
    ///
    /// # 処理内容
    /// 1. 外部IDで取引をupsert（口座が特定できない取引は破棄）
    /// 2. 入金・端数なしの取引はエントリを作らない
    /// 3. 既にINVESTEDのエントリがある取引はスキップ
    /// 4. それ以外は未作成ならPENDINGエントリを作成し、
    ///    金額が変わった未決済エントリは再計算する
    ///
    /// 取引ごとにセーブポイントを切り、失敗した取引の書き込みは残さない。
    pub fn ingest(
        &self,
        connection: &BankConnection,
        transactions: &[FeedTransaction],
        now: DateTime<Utc>,
    ) -> AppResult<IngestReport> {
        let mut conn = self.connection()?;
        let mut tx = conn.transaction()?;
        let timestamp = format_timestamp(now);
        let mut report = IngestReport::default();

        for feed_tx in transactions {
            let savepoint = tx.savepoint()?;
            let mut item = IngestReport::default();

            // 1件の失敗でバッチ全体を止めない
            match ingest_one(&savepoint, connection, feed_tx, &timestamp, &mut item) {
                Ok(()) => {
                    savepoint.commit()?;
                    report.absorb(&item);
                }
                Err(e) => {
                    // ドロップ時にセーブポイントまで巻き戻る
                    drop(savepoint);
                    log::warn!(
                        "取引の取り込みに失敗したため破棄します: external_id={}, error={}",
                        feed_tx.external_id,
                        e
                    );
                    report.dropped += 1;
                }
            }
        }

        tx.commit()?;

        log::info!(
            "取引を取り込みました: user_id={}, connection_id={}, {:?}",
            connection.user_id,
            connection.id,
            report
        );

        Ok(report)
    }

    // ---- 集計・決済 ----

    /// 集計対象のエントリを計上日・ID順で取得する
    ///
    /// PENDING/RETRY_PENDINGのうち、PENDINGの決済記録に含まれていないもの。
    pub fn eligible_entries(&self, user_id: &str) -> AppResult<Vec<RoundUpEntry>> {
        let conn = self.connection()?;
        let sql = format!(
            "{ENTRY_SELECT}
             WHERE e.user_id = ?1 AND e.status IN ('PENDING', 'RETRY_PENDING')
               AND {NOT_IN_PENDING_SETTLEMENT}
             ORDER BY t.posted_date ASC, e.id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![user_id], map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// 指定エントリのうち、現在も課金可能なものを取得する
    pub fn chargeable_entries(&self, user_id: &str, entry_ids: &[i64]) -> AppResult<Vec<RoundUpEntry>> {
        if entry_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.connection()?;
        let placeholders = vec!["?"; entry_ids.len()].join(", ");
        let sql = format!(
            "{ENTRY_SELECT}
             WHERE e.user_id = ? AND e.id IN ({placeholders})
               AND e.status IN ('PENDING', 'RETRY_PENDING')
               AND {NOT_IN_PENDING_SETTLEMENT}
             ORDER BY t.posted_date ASC, e.id ASC"
        );

        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(entry_ids.len() + 1);
        values.push(user_id.to_string().into());
        values.extend(entry_ids.iter().map(|id| (*id).into()));

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(values), map_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// 期間開始以降に確定・保留中の決済額合計を取得する
    pub fn committed_since(&self, user_id: &str, window_start: DateTime<Utc>) -> AppResult<i64> {
        let conn = self.connection()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM settlement_records
             WHERE user_id = ?1 AND status IN ('SUCCESS', 'PENDING') AND created_at >= ?2",
            params![user_id, format_timestamp(window_start)],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// 課金直前にPENDINGの決済記録と明細を作成する
    ///
    /// # 引数
    /// * `settlement` - 作成内容
    /// * `now` - 作成時刻
    ///
    /// # 戻り値
    /// 作成された決済記録
    pub fn begin_settlement(
        &self,
        settlement: &NewSettlement<'_>,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementRecord> {
        let amount: i64 = settlement.entries.iter().map(|e| e.allowed_amount).sum();
        if amount <= 0 {
            return Err(AppError::validation("課金額が0のため決済記録を作成できません"));
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let timestamp = format_timestamp(now);

        tx.execute(
            "INSERT INTO settlement_records
                (user_id, amount, status, customer_ref, instrument_ref, idempotency_key, job_id,
                 created_at, updated_at)
             VALUES (?1, ?2, 'PENDING', ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                settlement.user_id,
                amount,
                settlement.customer_ref,
                settlement.instrument_ref,
                settlement.idempotency_key,
                settlement.job_id,
                timestamp
            ],
        )?;
        let settlement_id = tx.last_insert_rowid();

        for entry in settlement.entries {
            tx.execute(
                "INSERT INTO settlement_items (settlement_id, entry_id, allowed_amount)
                 VALUES (?1, ?2, ?3)",
                params![settlement_id, entry.entry_id, entry.allowed_amount],
            )?;
        }

        let record = get_settlement(&tx, settlement_id)?;
        tx.commit()?;

        log::info!(
            "決済記録を作成しました: settlement_id={}, user_id={}, amount={}, entries={}",
            settlement_id,
            settlement.user_id,
            amount,
            settlement.entries.len()
        );

        Ok(record)
    }

    /// 決済代行の応答を決済記録とエントリに反映する
    ///
    /// # 引数
    /// * `settlement_id` - 対象の決済記録
    /// * `outcome` - 決済代行の応答
    /// * `max_decline_retries` - エントリが最終失敗になるまでの拒否回数
    /// * `now` - 反映時刻
    ///
    /// # 戻り値
    /// 更新後の決済記録。既に確定済みの記録は変更せずに返す
    pub fn complete_settlement(
        &self,
        settlement_id: i64,
        outcome: &SettlementOutcome,
        max_decline_retries: u32,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementRecord> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let timestamp = format_timestamp(now);

        let current = get_settlement(&tx, settlement_id)?;
        if current.status != SettlementStatus::Pending {
            log::warn!(
                "確定済みの決済記録は変更しません: settlement_id={}, status={}",
                settlement_id,
                current.status.as_str()
            );
            return Ok(current);
        }

        match outcome {
            SettlementOutcome::Succeeded { reference } => {
                tx.execute(
                    "UPDATE settlement_records
                     SET status = 'SUCCESS', processor_reference = ?1, failure_reason = NULL,
                         updated_at = ?2
                     WHERE id = ?3",
                    params![reference, timestamp, settlement_id],
                )?;
                let invested = tx.execute(
                    "UPDATE round_up_entries
                     SET status = 'INVESTED', settlement_id = ?1, failure_reason = NULL,
                         invested_amount = (
                             SELECT allowed_amount FROM settlement_items
                             WHERE settlement_id = ?1 AND entry_id = round_up_entries.id
                         ),
                         updated_at = ?2
                     WHERE id IN (SELECT entry_id FROM settlement_items WHERE settlement_id = ?1)
                       AND status IN ('PENDING', 'RETRY_PENDING')",
                    params![settlement_id, timestamp],
                )?;
                log::info!(
                    "決済が成功しました: settlement_id={settlement_id}, reference={reference}, invested_entries={invested}"
                );
            }
            SettlementOutcome::Pending { reference } => {
                tx.execute(
                    "UPDATE settlement_records SET processor_reference = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![reference, timestamp, settlement_id],
                )?;
                log::info!(
                    "決済が保留中です: settlement_id={settlement_id}, reference={reference}"
                );
            }
            SettlementOutcome::Declined { reference, code } => {
                tx.execute(
                    "UPDATE settlement_records
                     SET status = 'FAILED', processor_reference = COALESCE(?1, processor_reference),
                         failure_reason = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![reference, code, timestamp, settlement_id],
                )?;
                let terminal = RoundUpStatus::terminal_for_code(code);
                tx.execute(
                    "UPDATE round_up_entries
                     SET decline_count = decline_count + 1,
                         status = CASE WHEN decline_count + 1 >= ?1 THEN ?2 ELSE 'RETRY_PENDING' END,
                         settlement_id = ?3, failure_reason = ?4, updated_at = ?5
                     WHERE id IN (SELECT entry_id FROM settlement_items WHERE settlement_id = ?3)
                       AND status IN ('PENDING', 'RETRY_PENDING')",
                    params![
                        max_decline_retries,
                        terminal.as_str(),
                        settlement_id,
                        code,
                        timestamp
                    ],
                )?;
                log::warn!("決済が拒否されました: settlement_id={settlement_id}, code={code}");
            }
            SettlementOutcome::Transient { message } => {
                tx.execute(
                    "UPDATE settlement_records SET status = 'FAILED', failure_reason = ?1,
                         updated_at = ?2
                     WHERE id = ?3",
                    params![message, timestamp, settlement_id],
                )?;
                log::warn!(
                    "決済代行の呼び出しに失敗しました: settlement_id={settlement_id}, error={message}"
                );
            }
        }

        let record = get_settlement(&tx, settlement_id)?;
        tx.commit()?;
        Ok(record)
    }

    /// 一定時間以上PENDINGのままの決済記録を失敗扱いにする
    ///
    /// 含まれていたエントリはRETRY_PENDINGに戻し、次回の集計で再度対象になる。
    ///
    /// # 戻り値
    /// 失敗扱いにした決済記録の数
    pub fn recover_stale(&self, created_before: DateTime<Utc>, now: DateTime<Utc>) -> AppResult<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let timestamp = format_timestamp(now);

        let stale_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM settlement_records WHERE status = 'PENDING' AND created_at < ?1",
            )?;
            let ids = stmt
                .query_map(params![format_timestamp(created_before)], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        for settlement_id in &stale_ids {
            tx.execute(
                "UPDATE settlement_records SET status = 'FAILED', failure_reason = ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                params![STALE_PENDING_REASON, timestamp, settlement_id],
            )?;
            tx.execute(
                "UPDATE round_up_entries
                 SET status = 'RETRY_PENDING', settlement_id = ?1, failure_reason = ?2,
                     updated_at = ?3
                 WHERE id IN (SELECT entry_id FROM settlement_items WHERE settlement_id = ?1)
                   AND status IN ('PENDING', 'RETRY_PENDING')",
                params![settlement_id, STALE_PENDING_REASON, timestamp],
            )?;
            log::warn!("保留中の決済記録を失敗扱いにしました: settlement_id={settlement_id}");
        }

        tx.commit()?;
        Ok(stale_ids.len())
    }

    /// 再試行上限に達したジョブのエントリを最終失敗にする
    ///
    /// # 戻り値
    /// FAILEDにしたエントリ数
    pub fn abandon_entries(
        &self,
        user_id: &str,
        entry_ids: &[i64],
        reason: &str,
        now: DateTime<Utc>,
    ) -> AppResult<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let timestamp = format_timestamp(now);
        let mut abandoned = 0;

        for entry_id in entry_ids {
            abandoned += tx.execute(
                "UPDATE round_up_entries SET status = 'FAILED', failure_reason = ?1, updated_at = ?2
                 WHERE id = ?3 AND user_id = ?4 AND status IN ('PENDING', 'RETRY_PENDING')",
                params![reason, timestamp, entry_id, user_id],
            )?;
        }

        tx.commit()?;
        Ok(abandoned)
    }

    /// 最終失敗のエントリをRETRY_PENDINGに戻す（手動再試行）
    ///
    /// # 戻り値
    /// 戻したエントリのID
    pub fn reopen_failed(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<Vec<i64>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM round_up_entries
                 WHERE user_id = ?1 AND status IN ('FAILED', 'INSUFFICIENT_FUNDS', 'CARD_DECLINED')
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        tx.execute(
            "UPDATE round_up_entries
             SET status = 'RETRY_PENDING', decline_count = 0, failure_reason = NULL, updated_at = ?1
             WHERE user_id = ?2 AND status IN ('FAILED', 'INSUFFICIENT_FUNDS', 'CARD_DECLINED')",
            params![format_timestamp(now), user_id],
        )?;

        tx.commit()?;
        Ok(ids)
    }

    // ---- 照会 ----

    /// IDで決済記録を取得する
    pub fn get_settlement(&self, settlement_id: i64) -> AppResult<SettlementRecord> {
        let conn = self.connection()?;
        get_settlement(&conn, settlement_id)
    }

    /// 決済代行の参照で決済記録を取得する
    pub fn find_settlement_by_reference(&self, reference: &str) -> AppResult<Option<SettlementRecord>> {
        let conn = self.connection()?;
        let sql = format!("{SETTLEMENT_SELECT} WHERE processor_reference = ?1 ORDER BY id DESC LIMIT 1");
        let record = conn
            .query_row(&sql, params![reference], map_settlement)
            .optional()?;
        Ok(record)
    }

    /// 決済記録の明細を取得する
    pub fn settlement_items(&self, settlement_id: i64) -> AppResult<Vec<SettlementItem>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT settlement_id, entry_id, allowed_amount FROM settlement_items
             WHERE settlement_id = ?1 ORDER BY entry_id",
        )?;
        let items = stmt
            .query_map(params![settlement_id], |row| {
                Ok(SettlementItem {
                    settlement_id: row.get(0)?,
                    entry_id: row.get(1)?,
                    allowed_amount: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// 積み立て済みの合計額を取得する
    pub fn total_invested(&self, user_id: &str) -> AppResult<i64> {
        let conn = self.connection()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(COALESCE(invested_amount, round_up_amount)), 0)
             FROM round_up_entries WHERE user_id = ?1 AND status = 'INVESTED'",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// 指定時刻以降に作成された未決済エントリの合計額を取得する
    pub fn open_total_since(&self, user_id: &str, since: DateTime<Utc>) -> AppResult<i64> {
        let conn = self.connection()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(round_up_amount), 0) FROM round_up_entries
             WHERE user_id = ?1 AND status IN ('PENDING', 'RETRY_PENDING') AND created_at >= ?2",
            params![user_id, format_timestamp(since)],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// エントリ一覧を取得する（状態で絞り込み可）
    pub fn list_entries(
        &self,
        user_id: &str,
        status: Option<RoundUpStatus>,
    ) -> AppResult<Vec<RoundUpEntry>> {
        let conn = self.connection()?;
        let entries = match status {
            Some(status) => {
                let sql = format!(
                    "{ENTRY_SELECT} WHERE e.user_id = ?1 AND e.status = ?2
                     ORDER BY t.posted_date DESC, e.id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![user_id, status.as_str()], map_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "{ENTRY_SELECT} WHERE e.user_id = ?1 ORDER BY t.posted_date DESC, e.id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![user_id], map_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(entries)
    }

    /// 決済履歴を新しい順にページングして取得する
    pub fn list_settlements(
        &self,
        user_id: &str,
        query: &SettlementQuery,
    ) -> AppResult<Paginated<SettlementRecord>> {
        if query.page == 0 {
            return Err(AppError::validation("ページ番号は1以上である必要があります"));
        }
        if query.limit == 0 || query.limit > 100 {
            return Err(AppError::validation(
                "1ページあたりの件数は1から100の間で指定してください",
            ));
        }

        let mut conditions = vec!["user_id = ?".to_string()];
        let mut values: Vec<rusqlite::types::Value> = vec![user_id.to_string().into()];
        if let Some(from) = query.from {
            conditions.push("created_at >= ?".to_string());
            values.push(format_timestamp(from).into());
        }
        if let Some(to) = query.to {
            conditions.push("created_at <= ?".to_string());
            values.push(format_timestamp(to).into());
        }
        let where_clause = conditions.join(" AND ");

        let conn = self.connection()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM settlement_records WHERE {where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let offset = i64::from(query.page - 1) * i64::from(query.limit);
        let sql = format!(
            "{SETTLEMENT_SELECT} WHERE {where_clause}
             ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            query.limit, offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let data = stmt
            .query_map(params_from_iter(values.iter()), map_settlement)?
            .collect::<Result<Vec<_>, _>>()?;

        let total = total.max(0) as u64;
        let limit = u64::from(query.limit);
        Ok(Paginated {
            data,
            pagination: Pagination {
                total,
                page: query.page,
                limit: query.limit,
                total_pages: total.div_ceil(limit),
            },
        })
    }
}

/// 1件の取引を取り込む
fn ingest_one(
    tx: &Connection,
    connection: &BankConnection,
    feed_tx: &FeedTransaction,
    timestamp: &str,
    report: &mut IngestReport,
) -> AppResult<()> {
    if feed_tx.external_id.trim().is_empty() {
        return Err(AppError::validation("取引IDが空です"));
    }

    let account_id: Option<i64> = tx
        .query_row(
            "SELECT id FROM bank_accounts WHERE account_ref = ?1 AND connection_id = ?2",
            params![feed_tx.account_ref, connection.id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(account_id) = account_id else {
        log::warn!(
            "口座が特定できない取引を破棄します: external_id={}, account_ref={}",
            feed_tx.external_id,
            feed_tx.account_ref
        );
        report.dropped += 1;
        return Ok(());
    };

    let existing: Option<(i64, i64)> = tx
        .query_row(
            "SELECT id, amount FROM bank_transactions WHERE external_id = ?1",
            params![feed_tx.external_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let amount_changed = existing.is_some_and(|(_, amount)| amount != feed_tx.amount_minor);

    let transaction_id = match existing.map(|(id, _)| id) {
        Some(id) => {
            tx.execute(
                "UPDATE bank_transactions
                 SET amount = ?1, posted_date = ?2, name = ?3, category = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    feed_tx.amount_minor,
                    format_date(feed_tx.posted_date),
                    feed_tx.name,
                    feed_tx.category,
                    timestamp,
                    id
                ],
            )?;
            report.updated_transactions += 1;
            id
        }
        None => {
            tx.execute(
                "INSERT INTO bank_transactions
                    (external_id, account_id, user_id, amount, posted_date, name, category,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    feed_tx.external_id,
                    account_id,
                    connection.user_id,
                    feed_tx.amount_minor,
                    format_date(feed_tx.posted_date),
                    feed_tx.name,
                    feed_tx.category,
                    timestamp
                ],
            )?;
            report.inserted_transactions += 1;
            tx.last_insert_rowid()
        }
    };

    let round_up_amount = round_up(feed_tx.amount_minor);
    if round_up_amount == 0 {
        report.skipped_without_round_up += 1;
        return Ok(());
    }

    let existing_status: Option<String> = tx
        .query_row(
            "SELECT status FROM round_up_entries WHERE source_transaction_id = ?1",
            params![transaction_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing_status.as_deref().map(RoundUpStatus::parse).transpose()? {
        Some(RoundUpStatus::Invested) => {
            log::debug!(
                "積み立て済みの取引を再検出したためスキップします: external_id={}",
                feed_tx.external_id
            );
            report.skipped_invested += 1;
        }
        Some(status) if status.is_open() && amount_changed => {
            // PENDINGの決済記録に含まれるエントリは課金額が確定しているため変えない
            let updated = tx.execute(
                "UPDATE round_up_entries
                 SET round_up_amount = ?1, detected_amount = ?2, updated_at = ?3
                 WHERE source_transaction_id = ?4
                   AND NOT EXISTS (
                       SELECT 1 FROM settlement_items si
                       JOIN settlement_records sr ON sr.id = si.settlement_id
                       WHERE si.entry_id = round_up_entries.id AND sr.status = 'PENDING'
                   )",
                params![
                    round_up_amount,
                    detected_amount(feed_tx.amount_minor),
                    timestamp,
                    transaction_id
                ],
            )?;
            report.recomputed_entries += updated;
        }
        Some(_) => {}
        None => {
            tx.execute(
                "INSERT INTO round_up_entries
                    (user_id, source_transaction_id, round_up_amount, detected_amount, status,
                     decline_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5, ?5)",
                params![
                    connection.user_id,
                    transaction_id,
                    round_up_amount,
                    detected_amount(feed_tx.amount_minor),
                    timestamp
                ],
            )?;
            report.created_entries += 1;
        }
    }

    Ok(())
}

fn get_connection(conn: &Connection, id: i64) -> AppResult<BankConnection> {
    conn.query_row(
        "SELECT id, user_id, institution, encrypted_access_token, is_active, last_synced_at,
                created_at, updated_at
         FROM bank_connections WHERE id = ?1",
        params![id],
        map_connection,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::not_found("銀行連携"),
        other => other.into(),
    })
}

fn find_account(conn: &Connection, account_ref: &str) -> AppResult<Option<BankAccount>> {
    let account = conn
        .query_row(
            "SELECT id, connection_id, user_id, account_ref, name, created_at
             FROM bank_accounts WHERE account_ref = ?1",
            params![account_ref],
            |row| {
                Ok(BankAccount {
                    id: row.get(0)?,
                    connection_id: row.get(1)?,
                    user_id: row.get(2)?,
                    account_ref: row.get(3)?,
                    name: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(account)
}

fn get_settlement(conn: &Connection, id: i64) -> AppResult<SettlementRecord> {
    let sql = format!("{SETTLEMENT_SELECT} WHERE id = ?1");
    conn.query_row(&sql, params![id], map_settlement)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => AppError::not_found("決済記録"),
            other => other.into(),
        })
}

/// 変換エラーをrusqliteのエラーに包む
pub(super) fn conversion_error(index: usize, error: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
}

pub(super) fn read_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(index)?;
    parse_timestamp(&value).map_err(|e| conversion_error(index, e))
}

pub(super) fn read_optional_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(index)?;
    value
        .map(|v| parse_timestamp(&v).map_err(|e| conversion_error(index, e)))
        .transpose()
}

fn map_connection(row: &Row<'_>) -> rusqlite::Result<BankConnection> {
    Ok(BankConnection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        institution: row.get(2)?,
        encrypted_access_token: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        last_synced_at: read_optional_timestamp(row, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_entry(row: &Row<'_>) -> rusqlite::Result<RoundUpEntry> {
    let posted_date: String = row.get(4)?;
    let status: String = row.get(7)?;
    Ok(RoundUpEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        source_transaction_id: row.get(2)?,
        external_id: row.get(3)?,
        posted_date: parse_date(&posted_date).map_err(|e| conversion_error(4, e))?,
        round_up_amount: row.get(5)?,
        detected_amount: row.get(6)?,
        status: RoundUpStatus::parse(&status).map_err(|e| conversion_error(7, e))?,
        settlement_id: row.get(8)?,
        invested_amount: row.get(9)?,
        failure_reason: row.get(10)?,
        decline_count: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_settlement(row: &Row<'_>) -> rusqlite::Result<SettlementRecord> {
    let status: String = row.get(3)?;
    Ok(SettlementRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        status: SettlementStatus::parse(&status).map_err(|e| conversion_error(3, e))?,
        processor_reference: row.get(4)?,
        failure_reason: row.get(5)?,
        customer_ref: row.get(6)?,
        instrument_ref: row.get(7)?,
        idempotency_key: row.get(8)?,
        job_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}
