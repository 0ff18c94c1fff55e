use crate::shared::errors::{AppError, AppResult};

/// 1通貨単位あたりの最小単位数（セント）
pub const MINOR_UNITS_PER_UNIT: i64 = 100;

/// 取引額から端数切り上げ額を計算する
///
/// # 引数
/// * `amount_minor` - 取引額（最小通貨単位、正の値が出金）
///
/// # 戻り値
/// 次の整数単位までの差額。入金・0以下・端数のない金額は0
pub fn round_up(amount_minor: i64) -> i64 {
    if amount_minor <= 0 {
        return 0;
    }

    let remainder = amount_minor % MINOR_UNITS_PER_UNIT;
    if remainder == 0 {
        0
    } else {
        MINOR_UNITS_PER_UNIT - remainder
    }
}

/// 検出額（取引額 + 切り上げ額）を計算する
pub fn detected_amount(amount_minor: i64) -> i64 {
    amount_minor + round_up(amount_minor)
}

/// 小数表記の金額文字列を最小通貨単位に変換する
///
/// 浮動小数点を使わずに整数演算のみで変換する。
///
/// # 引数
/// * `value` - "4.25"、"-12.5"、"7" などの金額文字列
///
/// # 戻り値
/// 最小通貨単位の金額、または形式が不正な場合はバリデーションエラー
pub fn parse_minor_units(value: &str) -> AppResult<i64> {
    let trimmed = value.trim();
    let invalid = || AppError::validation(format!("金額の形式が正しくありません: {value}"));

    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    if fraction.len() > 2 {
        return Err(AppError::validation(format!(
            "金額の小数点以下は2桁までです: {value}"
        )));
    }

    let whole_units: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let fraction_units: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => fraction.parse().map_err(|_| invalid())?,
    };

    let magnitude = whole_units
        .checked_mul(MINOR_UNITS_PER_UNIT)
        .and_then(|units| units.checked_add(fraction_units))
        .ok_or_else(invalid)?;

    Ok(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_round_up_scenario() {
        assert_eq!(round_up(425), 75);
        assert_eq!(detected_amount(425), 500);
    }

    #[test]
    fn test_round_up_edges() {
        assert_eq!(round_up(1), 99);
        assert_eq!(round_up(99), 1);
        assert_eq!(round_up(101), 99);
        assert_eq!(round_up(100), 0);
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(-425), 0);
        assert_eq!(detected_amount(300), 300);
    }

    #[quickcheck]
    fn prop_round_up_matches_ceiling(amount: u32) -> bool {
        let a = i64::from(amount);
        if a == 0 || a % 100 == 0 {
            return round_up(a) == 0;
        }
        let ceiling = (a + 99) / 100 * 100;
        let r = round_up(a);
        r == ceiling - a && r > 0 && r < 100
    }

    #[quickcheck]
    fn prop_round_up_zero_for_credits_and_whole_units(amount: i32, units: u16) -> bool {
        let credit = -(i64::from(amount).abs());
        let whole = i64::from(units) * 100;
        round_up(credit) == 0 && round_up(whole) == 0
    }

    #[test]
    fn test_parse_minor_units() {
        assert_eq!(parse_minor_units("4.25").unwrap(), 425);
        assert_eq!(parse_minor_units("4.2").unwrap(), 420);
        assert_eq!(parse_minor_units("7").unwrap(), 700);
        assert_eq!(parse_minor_units(".99").unwrap(), 99);
        assert_eq!(parse_minor_units("-12.50").unwrap(), -1250);
        assert_eq!(parse_minor_units(" 0.01 ").unwrap(), 1);
    }

    #[test]
    fn test_parse_minor_units_rejects_invalid() {
        assert!(parse_minor_units("").is_err());
        assert!(parse_minor_units(".").is_err());
        assert!(parse_minor_units("4.255").is_err());
        assert!(parse_minor_units("abc").is_err());
        assert!(parse_minor_units("1,000.00").is_err());
        assert!(parse_minor_units("--1").is_err());
    }
}
