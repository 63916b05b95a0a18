//! Dice evaluator.
//!
//! Parses `NdX[+M][-M]` roll expressions and resolves them against a
//! pre-rolled entropy entry. A d100 die pops from the entry's d100 pool;
//! every other size pops from the d20 pool and maps via
//! `1 + ((n - 1) mod X)`. One raw value is consumed per die, all from the
//! single entry reserved for the expression.

use serde::{Deserialize, Serialize};

use super::entropy::{map_raw, EntropyEntry};
use super::error::{EngineError, EngineResult};

/// Upper bound on dice per expression; the d20 pool holds 10 raw values.
const MAX_DICE: u32 = 10;
const MAX_SIDES: u32 = 1000;

/// A parsed roll expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceExpression {
    pub count: u32,
    pub sides: u32,
    pub modifier: i64,
    /// Original text, kept for breakdowns and audit records.
    pub text: String,
}

impl DiceExpression {
    /// Parse `NdX[+M][-M]...`; a bare `dX` reads as `1dX`.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let text = raw.trim();
        let invalid = || EngineError::ExpressionInvalid(raw.to_string());
        let lower = text.to_ascii_lowercase();

        let d_pos = lower.find('d').ok_or_else(invalid)?;
        let (head, tail) = lower.split_at(d_pos);
        let tail = &tail[1..];

        let count: u32 = if head.is_empty() {
            1
        } else {
            head.parse().map_err(|_| invalid())?
        };

        // Split the tail into the die size and a chain of +/- modifiers.
        let mod_pos = tail.find(['+', '-']);
        let (sides_str, mods_str) = match mod_pos {
            Some(pos) => tail.split_at(pos),
            None => (tail, ""),
        };
        let sides: u32 = sides_str.parse().map_err(|_| invalid())?;

        let mut modifier = 0i64;
        let mut rest = mods_str;
        while !rest.is_empty() {
            let sign = match rest.as_bytes()[0] {
                b'+' => 1i64,
                b'-' => -1i64,
                _ => return Err(invalid()),
            };
            rest = &rest[1..];
            let end = rest.find(['+', '-']).unwrap_or(rest.len());
            let (num, remainder) = rest.split_at(end);
            let value: i64 = num.parse().map_err(|_| invalid())?;
            modifier += sign * value;
            rest = remainder;
        }

        if count == 0 || count > MAX_DICE || sides < 2 || sides > MAX_SIDES {
            return Err(invalid());
        }

        Ok(Self {
            count,
            sides,
            modifier,
            text: text.to_string(),
        })
    }
}

/// Result of resolving one expression against one entropy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedRoll {
    pub expression: String,
    /// Mapped per-die values in draw order.
    pub rolls: Vec<u32>,
    pub modifier: i64,
    pub total: i64,
    /// Human-readable listing of die values and modifier application.
    pub breakdown: String,
    /// Entropy entries consumed (a single entry per expression).
    pub consumed_indices: Vec<u64>,
}

/// Resolve `expr` against `entry`, consuming `count` raw values from the
/// matching pool.
pub fn resolve_expression(expr: &DiceExpression, entry: &EntropyEntry) -> EngineResult<ResolvedRoll> {
    let raw_values = draw_pool(entry, expr.sides, expr.count as usize)?;
    let rolls: Vec<u32> = if expr.sides == 100 {
        raw_values
    } else {
        raw_values.iter().map(|&n| map_raw(n, expr.sides)).collect()
    };

    let sum: i64 = rolls.iter().map(|&v| v as i64).sum();
    let total = sum + expr.modifier;

    let dice_list = rolls
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let breakdown = if expr.modifier != 0 {
        format!("{}: [{}] {:+} = {}", expr.text, dice_list, expr.modifier, total)
    } else {
        format!("{}: [{}] = {}", expr.text, dice_list, total)
    };

    Ok(ResolvedRoll {
        expression: expr.text.clone(),
        rolls,
        modifier: expr.modifier,
        total,
        breakdown,
        consumed_indices: vec![entry.i],
    })
}

/// Advantage state for a d20 check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Advantage {
    #[default]
    Normal,
    Advantage,
    Disadvantage,
}

impl Advantage {
    pub fn draws(self) -> usize {
        match self {
            Self::Normal => 1,
            Self::Advantage | Self::Disadvantage => 2,
        }
    }
}

/// Draw the raw d20 values for a check and pick the effective one:
/// max under advantage, min under disadvantage.
pub fn check_d20(entry: &EntropyEntry, advantage: Advantage) -> EngineResult<(Vec<u32>, u32)> {
    let used = draw_pool(entry, 20, advantage.draws())?;
    let base = match advantage {
        Advantage::Normal => used[0],
        Advantage::Advantage => *used.iter().max().expect("non-empty draw"),
        Advantage::Disadvantage => *used.iter().min().expect("non-empty draw"),
    };
    Ok((used, base))
}

fn draw_pool(entry: &EntropyEntry, sides: u32, needed: usize) -> EngineResult<Vec<u32>> {
    let pool = if sides == 100 { &entry.d100 } else { &entry.d20 };
    if pool.len() < needed {
        // The pool at this index is spent; the stream must be extended.
        return Err(EngineError::EntropyExhausted {
            needed: entry.i,
            have: entry.i.saturating_sub(1),
        });
    }
    Ok(pool[..needed].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> EntropyEntry {
        EntropyEntry {
            i: 7,
            d20: vec![17, 4, 20, 1, 9, 12, 3, 18, 6, 11],
            d100: vec![55, 3, 97, 41, 72],
            bytes: "00c0ffee".to_string(),
        }
    }

    #[test]
    fn test_parse_basic() {
        let expr = DiceExpression::parse("2d6+3").expect("parse");
        assert_eq!(expr.count, 2);
        assert_eq!(expr.sides, 6);
        assert_eq!(expr.modifier, 3);

        let expr = DiceExpression::parse("d20").expect("parse");
        assert_eq!(expr.count, 1);
        assert_eq!(expr.sides, 20);
        assert_eq!(expr.modifier, 0);
    }

    #[test]
    fn test_parse_modifier_chain() {
        let expr = DiceExpression::parse("1d8+5-2").expect("parse");
        assert_eq!(expr.modifier, 3);

        let expr = DiceExpression::parse("1d8-1").expect("parse");
        assert_eq!(expr.modifier, -1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "d", "2d", "x20", "2d6+", "0d6", "2d1", "99d6", "2d6++1"] {
            assert!(
                DiceExpression::parse(bad).is_err(),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_resolve_d20_identity() {
        let expr = DiceExpression::parse("1d20").expect("parse");
        let roll = resolve_expression(&expr, &entry()).expect("resolve");
        assert_eq!(roll.rolls, vec![17]);
        assert_eq!(roll.total, 17);
        assert_eq!(roll.consumed_indices, vec![7]);
        assert_eq!(roll.breakdown, "1d20: [17] = 17");
    }

    #[test]
    fn test_resolve_maps_to_die_size() {
        // 17 -> 1+((17-1)%6)=5, 4 -> 4
        let expr = DiceExpression::parse("2d6+3").expect("parse");
        let roll = resolve_expression(&expr, &entry()).expect("resolve");
        assert_eq!(roll.rolls, vec![5, 4]);
        assert_eq!(roll.total, 12);
        assert_eq!(roll.breakdown, "2d6+3: [5, 4] +3 = 12");
    }

    #[test]
    fn test_resolve_d100_uses_own_pool() {
        let expr = DiceExpression::parse("1d100").expect("parse");
        let roll = resolve_expression(&expr, &entry()).expect("resolve");
        assert_eq!(roll.rolls, vec![55]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut thin = entry();
        thin.d100 = vec![55];
        let expr = DiceExpression::parse("2d100").expect("parse");
        let err = resolve_expression(&expr, &thin).unwrap_err();
        assert_eq!(err.kind(), "EntropyExhausted");
    }

    #[test]
    fn test_check_advantage_picks_max() {
        let (used, base) = check_d20(&entry(), Advantage::Advantage).expect("check");
        assert_eq!(used, vec![17, 4]);
        assert_eq!(base, 17);

        let (_, base) = check_d20(&entry(), Advantage::Disadvantage).expect("check");
        assert_eq!(base, 4);

        let (used, base) = check_d20(&entry(), Advantage::Normal).expect("check");
        assert_eq!(used, vec![17]);
        assert_eq!(base, 17);
    }
}
