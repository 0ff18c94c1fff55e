use super::ledger::{conversion_error, read_optional_timestamp, read_timestamp};
use super::models::{PaymentProfile, RoundUpSetting};
use super::period::Frequency;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::utils::format_timestamp;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};

const SETTING_SELECT: &str = "SELECT id, user_id, enabled, frequency, period_limit, destination,
        last_run_at, next_run_at, created_at, updated_at
     FROM round_up_settings";

/// 設定の保存内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingValues {
    pub enabled: bool,
    pub frequency: Frequency,
    pub period_limit: Option<i64>,
    pub destination: Option<String>,
}

/// ラウンドアップ設定と決済プロファイルのリポジトリ
#[derive(Clone)]
pub struct SettingsStore {
    db_connection: Arc<Mutex<Connection>>,
}

impl SettingsStore {
    pub fn new(db_connection: Arc<Mutex<Connection>>) -> Self {
        Self { db_connection }
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.db_connection
            .lock()
            .map_err(|e| AppError::concurrency(format!("データベースロック取得失敗: {e}")))
    }

    /// ユーザーの設定を取得する
    pub fn get_setting(&self, user_id: &str) -> AppResult<Option<RoundUpSetting>> {
        let conn = self.connection()?;
        let sql = format!("{SETTING_SELECT} WHERE user_id = ?1");
        let setting = conn
            .query_row(&sql, params![user_id], map_setting)
            .optional()?;
        Ok(setting)
    }

    /// 設定を作成または更新する
    ///
    /// # 引数
    /// * `user_id` - 対象ユーザー
    /// * `values` - 保存する設定値
    /// * `next_run_at` - 次回実行時刻
    /// * `now` - 更新時刻
    ///
    /// # 戻り値
    /// 保存後の設定
    pub fn upsert_setting(
        &self,
        user_id: &str,
        values: &SettingValues,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<RoundUpSetting> {
        if let Some(limit) = values.period_limit {
            if limit < 0 {
                return Err(AppError::validation("期間上限額は0以上である必要があります"));
            }
        }

        let conn = self.connection()?;
        let timestamp = format_timestamp(now);
        conn.execute(
            "INSERT INTO round_up_settings
                (user_id, enabled, frequency, period_limit, destination, next_run_at,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                enabled = excluded.enabled,
                frequency = excluded.frequency,
                period_limit = excluded.period_limit,
                destination = excluded.destination,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at",
            params![
                user_id,
                values.enabled,
                values.frequency.as_str(),
                values.period_limit,
                values.destination,
                format_timestamp(next_run_at),
                timestamp
            ],
        )?;

        let sql = format!("{SETTING_SELECT} WHERE user_id = ?1");
        conn.query_row(&sql, params![user_id], map_setting)
            .map_err(AppError::from)
    }

    /// 有効な設定をすべて取得する
    pub fn enabled_settings(&self) -> AppResult<Vec<RoundUpSetting>> {
        let conn = self.connection()?;
        let sql = format!("{SETTING_SELECT} WHERE enabled = 1 ORDER BY user_id");
        let mut stmt = conn.prepare(&sql)?;
        let settings = stmt
            .query_map([], map_setting)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(settings)
    }

    /// 決済試行の結果をスケジュールに反映する
    ///
    /// 最終実行時刻は成功時のみ更新し、次回実行時刻は常に更新する。
    pub fn record_run(
        &self,
        user_id: &str,
        attempted_at: DateTime<Utc>,
        succeeded: bool,
        next_run_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = self.connection()?;
        let attempted = format_timestamp(attempted_at);
        let updated = if succeeded {
            conn.execute(
                "UPDATE round_up_settings SET last_run_at = ?1, next_run_at = ?2, updated_at = ?1
                 WHERE user_id = ?3",
                params![attempted, format_timestamp(next_run_at), user_id],
            )?
        } else {
            conn.execute(
                "UPDATE round_up_settings SET next_run_at = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![format_timestamp(next_run_at), attempted, user_id],
            )?
        };

        if updated == 0 {
            return Err(AppError::not_found("ラウンドアップ設定"));
        }
        Ok(())
    }

    /// 決済プロファイルを作成または更新する
    pub fn upsert_payment_profile(
        &self,
        profile: &PaymentProfile,
        now: DateTime<Utc>,
    ) -> AppResult<PaymentProfile> {
        if profile.customer_ref.trim().is_empty() {
            return Err(AppError::validation("顧客参照は必須です"));
        }

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO payment_profiles
                (user_id, customer_ref, default_instrument_ref, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                customer_ref = excluded.customer_ref,
                default_instrument_ref = excluded.default_instrument_ref,
                updated_at = excluded.updated_at",
            params![
                profile.user_id,
                profile.customer_ref,
                profile.default_instrument_ref,
                format_timestamp(now)
            ],
        )?;
        Ok(profile.clone())
    }

    /// ユーザーの決済プロファイルを取得する
    pub fn get_payment_profile(&self, user_id: &str) -> AppResult<Option<PaymentProfile>> {
        let conn = self.connection()?;
        let profile = conn
            .query_row(
                "SELECT user_id, customer_ref, default_instrument_ref
                 FROM payment_profiles WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(PaymentProfile {
                        user_id: row.get(0)?,
                        customer_ref: row.get(1)?,
                        default_instrument_ref: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }
}

fn map_setting(row: &Row<'_>) -> rusqlite::Result<RoundUpSetting> {
    let frequency: String = row.get(3)?;
    let period_limit: Option<i64> = row.get(4)?;
    if matches!(period_limit, Some(limit) if limit < 0) {
        return Err(conversion_error(
            4,
            AppError::validation("期間上限額が負の値です"),
        ));
    }

    Ok(RoundUpSetting {
        id: row.get(0)?,
        user_id: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        frequency: Frequency::parse(&frequency),
        period_limit,
        destination: row.get(5)?,
        last_run_at: read_optional_timestamp(row, 6)?,
        next_run_at: read_timestamp(row, 7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
