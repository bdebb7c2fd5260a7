//! Row-count safety check: destinations only ever grow or stay the same.

use serde::{Deserialize, Serialize};
use sodp_destination::RowCount;

/// How an indeterminate row count is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountCheckMode {
    Strict,
    #[default]
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CountVerdict {
    Grew { net_new: u64 },
    Unchanged,
    Decreased { lost: u64 },
    Indeterminate,
}

pub fn compare_counts(before: RowCount, after: RowCount) -> CountVerdict {
    match (before.known(), after.known()) {
        (Some(b), Some(a)) if a > b => CountVerdict::Grew { net_new: a - b },
        (Some(b), Some(a)) if a < b => CountVerdict::Decreased { lost: b - a },
        (Some(_), Some(_)) => CountVerdict::Unchanged,
        _ => CountVerdict::Indeterminate,
    }
}

impl CountVerdict {
    pub fn passes(self, mode: CountCheckMode) -> bool {
        match self {
            CountVerdict::Grew { .. } | CountVerdict::Unchanged => true,
            CountVerdict::Decreased { .. } => false,
            CountVerdict::Indeterminate => mode == CountCheckMode::Lenient,
        }
    }

    pub fn is_decrease(self) -> bool {
        matches!(self, CountVerdict::Decreased { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_and_equality_pass_in_both_modes() {
        let grew = compare_counts(RowCount::Known(100), RowCount::Known(150));
        assert_eq!(grew, CountVerdict::Grew { net_new: 50 });
        let same = compare_counts(RowCount::Known(100), RowCount::Known(100));
        assert_eq!(same, CountVerdict::Unchanged);
        for mode in [CountCheckMode::Strict, CountCheckMode::Lenient] {
            assert!(grew.passes(mode));
            assert!(same.passes(mode));
        }
    }

    #[test]
    fn decrease_always_fails() {
        let verdict = compare_counts(RowCount::Known(3573), RowCount::Known(3570));
        assert_eq!(verdict, CountVerdict::Decreased { lost: 3 });
        assert!(verdict.is_decrease());
        assert!(!verdict.passes(CountCheckMode::Lenient));
        assert!(!verdict.passes(CountCheckMode::Strict));
    }

    #[test]
    fn unknown_is_never_treated_as_zero() {
        let verdict = compare_counts(RowCount::Unknown, RowCount::Known(10));
        assert_eq!(verdict, CountVerdict::Indeterminate);
        assert_eq!(
            compare_counts(RowCount::Known(10), RowCount::Unknown),
            CountVerdict::Indeterminate
        );
        assert!(verdict.passes(CountCheckMode::Lenient));
        assert!(!verdict.passes(CountCheckMode::Strict));
    }
}
