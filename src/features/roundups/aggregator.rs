use super::models::RoundUpEntry;
use crate::features::integrations::AdmittedEntry;

/// 上限適用後の集計結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregation {
    /// 許可額が0より大きいエントリ（入力順）
    pub admitted: Vec<AdmittedEntry>,
    pub total_admitted: i64,
}

impl Aggregation {
    /// 課金すべき金額がないかどうか
    pub fn is_empty(&self) -> bool {
        self.total_admitted == 0
    }
}

/// 期間上限から確定・保留中の決済額を差し引いた残り上限を求める
///
/// # 引数
/// * `period_limit` - 期間上限（None は無制限）
/// * `committed` - 期間開始以降の決済額
pub fn remaining_limit(period_limit: Option<i64>, committed: i64) -> Option<i64> {
    period_limit.map(|limit| (limit - committed).max(0))
}

/// 候補エントリに期間上限を適用して課金額を決める
///
/// 候補は渡された順に処理し、金額による並べ替えはしない。
///
/// # 引数
/// * `candidates` - 集計対象のエントリ（計上日順）
/// * `period_limit` - 残り上限（None は無制限）
///
/// # 戻り値
/// 許可されたエントリと合計額
pub fn aggregate(candidates: &[RoundUpEntry], period_limit: Option<i64>) -> Aggregation {
    let amounts: Vec<(i64, i64)> = candidates
        .iter()
        .map(|entry| (entry.id, entry.round_up_amount))
        .collect();
    aggregate_amounts(&amounts, period_limit)
}

fn aggregate_amounts(candidates: &[(i64, i64)], period_limit: Option<i64>) -> Aggregation {
    let mut remaining = period_limit;
    let mut aggregation = Aggregation::default();

    for &(entry_id, round_up_amount) in candidates {
        let allowed = match remaining {
            Some(left) if left <= 0 => break,
            Some(left) => round_up_amount.min(left),
            None => round_up_amount,
        };
        if allowed <= 0 {
            continue;
        }

        aggregation.admitted.push(AdmittedEntry {
            entry_id,
            allowed_amount: allowed,
        });
        aggregation.total_admitted += allowed;
        remaining = remaining.map(|left| left - allowed);
    }

    aggregation
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_limit_scenario() {
        let result = aggregate_amounts(&[(1, 75), (2, 150), (3, 40)], Some(200));

        assert_eq!(
            result.admitted,
            vec![
                AdmittedEntry {
                    entry_id: 1,
                    allowed_amount: 75
                },
                AdmittedEntry {
                    entry_id: 2,
                    allowed_amount: 125
                },
            ]
        );
        assert_eq!(result.total_admitted, 200);
    }

    #[test]
    fn test_unbounded_admits_everything() {
        let result = aggregate_amounts(&[(1, 75), (2, 150), (3, 40)], None);
        assert_eq!(result.total_admitted, 265);
        assert_eq!(result.admitted.len(), 3);
    }

    #[test]
    fn test_zero_limit_admits_nothing() {
        let result = aggregate_amounts(&[(1, 75)], Some(0));
        assert!(result.is_empty());
        assert!(result.admitted.is_empty());
    }

    #[test]
    fn test_order_is_preserved() {
        // 金額の大小で並べ替えない
        let result = aggregate_amounts(&[(7, 90), (3, 10)], Some(95));
        assert_eq!(result.admitted[0].entry_id, 7);
        assert_eq!(result.admitted[0].allowed_amount, 90);
        assert_eq!(result.admitted[1].allowed_amount, 5);
    }

    #[test]
    fn test_remaining_limit() {
        assert_eq!(remaining_limit(None, 500), None);
        assert_eq!(remaining_limit(Some(200), 75), Some(125));
        assert_eq!(remaining_limit(Some(200), 300), Some(0));
    }

    fn to_candidates(amounts: &[u8]) -> Vec<(i64, i64)> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, a)| (i as i64, i64::from(*a % 99) + 1))
            .collect()
    }

    #[quickcheck]
    fn prop_finite_limit_is_conserved(amounts: Vec<u8>, limit: u16) -> bool {
        let candidates = to_candidates(&amounts);
        let limit = i64::from(limit);
        let result = aggregate_amounts(&candidates, Some(limit));
        let sum: i64 = result.admitted.iter().map(|e| e.allowed_amount).sum();
        sum == result.total_admitted
            && sum <= limit
            && sum == limit.min(candidates.iter().map(|c| c.1).sum())
    }

    #[quickcheck]
    fn prop_unbounded_admits_full_amounts(amounts: Vec<u8>) -> bool {
        let candidates = to_candidates(&amounts);
        let result = aggregate_amounts(&candidates, None);
        result.total_admitted == candidates.iter().map(|c| c.1).sum::<i64>()
            && result.admitted.len() == candidates.len()
    }

    #[quickcheck]
    fn prop_allowed_never_exceeds_round_up(amounts: Vec<u8>, limit: u16) -> bool {
        let candidates = to_candidates(&amounts);
        let result = aggregate_amounts(&candidates, Some(i64::from(limit)));
        result
            .admitted
            .iter()
            .all(|e| e.allowed_amount > 0 && e.allowed_amount <= candidates[e.entry_id as usize].1)
    }
}
