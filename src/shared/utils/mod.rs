use crate::shared::errors::{AppError, AppResult};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use std::sync::Mutex;

/// 現在時刻の取得を抽象化する
///
/// スケジューラ・決済処理はこのトレイト経由で時刻を取得するため、
/// テストでは固定時刻を注入できる。
pub trait Clock: Send + Sync {
    /// 現在のUTC時刻を返す
    fn now(&self) -> DateTime<Utc>;

    /// 現在のUTC日付を返す
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// システム時刻を返すClock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 任意の時刻に固定・前進できるClock
#[derive(Debug)]
pub struct FixedClock {
    current: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(now),
        }
    }

    /// 時刻を設定する
    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut current) = self.current.lock() {
            *current = now;
        }
    }

    /// 時刻を進める
    pub fn advance(&self, duration: Duration) {
        if let Ok(mut current) = self.current.lock() {
            *current += duration;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.current.lock() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// タイムスタンプを保存用のRFC3339文字列（ミリ秒精度、UTC）に変換する
///
/// 桁数を固定しているため、文字列の辞書順が時系列順と一致する。
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 保存されたRFC3339文字列をタイムスタンプに変換する
///
/// # 引数
/// * `value` - RFC3339形式の文字列
///
/// # 戻り値
/// UTCタイムスタンプ、または形式が不正な場合はエラー
pub fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Database(format!("タイムスタンプの解析に失敗しました: {value} ({e})")))
}

/// 日付をYYYY-MM-DD形式に変換する
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// YYYY-MM-DD形式の文字列を日付に変換する
pub fn parse_date(value: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| AppError::validation(format!("無効な日付です: {value}")))
}
