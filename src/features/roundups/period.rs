use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 積み立て期間の頻度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
        }
    }

    /// 頻度文字列を解析する（未知の値はDAILY扱い）
    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "DAILY" => Frequency::Daily,
            "WEEKLY" => Frequency::Weekly,
            "MONTHLY" => Frequency::Monthly,
            other => {
                log::warn!("未知の頻度 {other} をDAILYとして扱います");
                Frequency::Daily
            }
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 現在時刻が属する期間の開始時刻を求める
///
/// # 引数
/// * `frequency` - 期間の頻度
/// * `now` - 基準時刻
/// * `tz` - 日付境界を判定するタイムゾーン
///
/// # 戻り値
/// DAILY: 当日0時、WEEKLY: 直近の日曜0時、MONTHLY: 当月1日0時
pub fn window_start<Tz: TimeZone>(frequency: Frequency, now: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    local_midnight(window_start_date(frequency, local_date(now, tz)), tz)
}

/// 次回実行時刻を求める
///
/// # 引数
/// * `frequency` - 期間の頻度
/// * `from` - 起点時刻（前回実行時刻または作成時刻）
/// * `tz` - 日付境界を判定するタイムゾーン
///
/// # 戻り値
/// DAILY: 翌日0時、WEEKLY: 期間開始の日曜から7日後の0時、
/// MONTHLY: 翌月の同日0時（月末を超える場合は月末日）
pub fn next_run<Tz: TimeZone>(frequency: Frequency, from: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let date = local_date(from, tz);

    let next_date = match frequency {
        Frequency::Daily => date + Duration::days(1),
        Frequency::Weekly => window_start_date(Frequency::Weekly, date) + Duration::days(7),
        Frequency::Monthly => date
            .checked_add_months(Months::new(1))
            .unwrap_or_else(|| date + Duration::days(31)),
    };

    local_midnight(next_date, tz)
}

fn window_start_date(frequency: Frequency, date: NaiveDate) -> NaiveDate {
    match frequency {
        Frequency::Daily => date,
        Frequency::Weekly => {
            date - Duration::days(i64::from(date.weekday().num_days_from_sunday()))
        }
        Frequency::Monthly => date.with_day(1).unwrap_or(date),
    }
}

fn local_date<Tz: TimeZone>(instant: DateTime<Utc>, tz: &Tz) -> NaiveDate {
    instant.with_timezone(tz).date_naive()
}

/// 指定日のローカル0時をUTCで返す
fn local_midnight<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    if let Some(instant) = tz.from_local_datetime(&midnight).earliest() {
        return instant.with_timezone(&Utc);
    }

    // 夏時間の切り替えで0時が存在しない日はその日の最初の有効な時刻
    (1..=3)
        .filter_map(|hour| {
            let time = NaiveTime::from_hms_opt(hour, 0, 0)?;
            tz.from_local_datetime(&date.and_time(time)).earliest()
        })
        .next()
        .map(|instant| instant.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use chrono_tz::Tz;
    use quickcheck_macros::quickcheck;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn arbitrary_instant(seconds: u32) -> DateTime<Utc> {
        // 2020-01-01から約136年の範囲
        utc(2020, 1, 1, 0, 0) + Duration::seconds(i64::from(seconds))
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!(Frequency::parse("DAILY"), Frequency::Daily);
        assert_eq!(Frequency::parse("weekly"), Frequency::Weekly);
        assert_eq!(Frequency::parse("Monthly"), Frequency::Monthly);
        assert_eq!(Frequency::parse("FORTNIGHTLY"), Frequency::Daily);
        assert_eq!(Frequency::Monthly.to_string(), "MONTHLY");
    }

    #[test]
    fn test_daily_window() {
        let now = utc(2024, 3, 13, 15, 42);
        assert_eq!(window_start(Frequency::Daily, now, &Utc), utc(2024, 3, 13, 0, 0));
        assert_eq!(next_run(Frequency::Daily, now, &Utc), utc(2024, 3, 14, 0, 0));
    }

    #[test]
    fn test_weekly_window() {
        // 2024-03-13は水曜日
        let now = utc(2024, 3, 13, 15, 42);
        assert_eq!(window_start(Frequency::Weekly, now, &Utc), utc(2024, 3, 10, 0, 0));
        assert_eq!(next_run(Frequency::Weekly, now, &Utc), utc(2024, 3, 17, 0, 0));

        // 日曜日はその日が期間開始
        let sunday = utc(2024, 3, 17, 0, 0);
        assert_eq!(window_start(Frequency::Weekly, sunday, &Utc), sunday);
        assert_eq!(next_run(Frequency::Weekly, sunday, &Utc), utc(2024, 3, 24, 0, 0));
    }

    #[test]
    fn test_monthly_window() {
        let now = utc(2024, 3, 13, 15, 42);
        assert_eq!(window_start(Frequency::Monthly, now, &Utc), utc(2024, 3, 1, 0, 0));
        assert_eq!(next_run(Frequency::Monthly, now, &Utc), utc(2024, 4, 13, 0, 0));
    }

    #[test]
    fn test_monthly_clamps_at_month_end() {
        assert_eq!(
            next_run(Frequency::Monthly, utc(2024, 1, 31, 9, 0), &Utc),
            utc(2024, 2, 29, 0, 0)
        );
        assert_eq!(
            next_run(Frequency::Monthly, utc(2023, 1, 31, 9, 0), &Utc),
            utc(2023, 2, 28, 0, 0)
        );
        assert_eq!(
            next_run(Frequency::Monthly, utc(2024, 12, 15, 9, 0), &Utc),
            utc(2025, 1, 15, 0, 0)
        );
    }

    #[test]
    fn test_timezone_boundaries() {
        let tokyo: Tz = "Asia/Tokyo".parse().unwrap();
        // UTC 2024-03-13 16:00 は東京の3/14 01:00
        let now = utc(2024, 3, 13, 16, 0);
        assert_eq!(window_start(Frequency::Daily, now, &tokyo), utc(2024, 3, 13, 15, 0));
        assert_eq!(next_run(Frequency::Daily, now, &tokyo), utc(2024, 3, 14, 15, 0));
    }

    #[test]
    fn test_dst_gap_midnight() {
        // サンパウロは2018-11-04に0時が存在しない
        let sao_paulo: Tz = "America/Sao_Paulo".parse().unwrap();
        let from = utc(2018, 11, 3, 12, 0);
        let next = next_run(Frequency::Daily, from, &sao_paulo);
        let local = next.with_timezone(&sao_paulo);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2018, 11, 4).unwrap());
        assert!(next > from);
    }

    #[quickcheck]
    fn prop_daily_next_run_is_next_midnight(seconds: u32) -> bool {
        let t = arbitrary_instant(seconds);
        let start = window_start(Frequency::Daily, t, &Utc);
        let next = next_run(Frequency::Daily, t, &Utc);
        next == start + Duration::hours(24) && next.time() == NaiveTime::MIN && start <= t
    }

    #[quickcheck]
    fn prop_weekly_next_run_is_sunday_after_window(seconds: u32) -> bool {
        let t = arbitrary_instant(seconds);
        let start = window_start(Frequency::Weekly, t, &Utc);
        let next = next_run(Frequency::Weekly, t, &Utc);
        next.weekday() == Weekday::Sun
            && start.weekday() == Weekday::Sun
            && next == start + Duration::days(7)
            && next.time() == NaiveTime::MIN
            && start <= t
            && t < next
    }

    #[quickcheck]
    fn prop_monthly_preserves_day_or_clamps(seconds: u32) -> bool {
        let t = arbitrary_instant(seconds);
        let next = next_run(Frequency::Monthly, t, &Utc);
        let expected_month = if t.month() == 12 { 1 } else { t.month() + 1 };
        let last_day_of_month = NaiveDate::from_ymd_opt(
            if expected_month == 12 { next.year() + 1 } else { next.year() },
            if expected_month == 12 { 1 } else { expected_month + 1 },
            1,
        )
        .and_then(|d| d.pred_opt())
        .map(|d| d.day());

        next.month() == expected_month
            && next.time() == NaiveTime::MIN
            && Some(next.day()) == last_day_of_month.map(|last| t.day().min(last))
    }

    #[quickcheck]
    fn prop_window_start_is_first_of_month(seconds: u32) -> bool {
        let t = arbitrary_instant(seconds);
        let start = window_start(Frequency::Monthly, t, &Utc);
        start.day() == 1 && start.month() == t.month() && start <= t
    }
}
