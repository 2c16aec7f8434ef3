//! Type-aware value comparison

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::facts::{normalize_text, FactValue};

/// How far two values may differ before they conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToleranceConfig {
    /// Relative tolerance for money and numbers, as a fraction of the larger magnitude
    #[serde(default = "default_relative")]
    pub relative: f64,

    #[serde(default = "default_absolute")]
    pub absolute: f64,

    /// Percentage points
    #[serde(default = "default_percent_points")]
    pub percent_points: f64,

    /// Days two dates may be apart; at most `MAX_DATE_DAYS`
    #[serde(default)]
    pub date_days: i64,
}

/// Upper bound on `date_days`, ten years
pub const MAX_DATE_DAYS: i64 = 3_660;

fn default_relative() -> f64 {
    0.005
}

fn default_absolute() -> f64 {
    1e-6
}

fn default_percent_points() -> f64 {
    0.1
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            relative: default_relative(),
            absolute: default_absolute(),
            percent_points: default_percent_points(),
            date_days: 0,
        }
    }
}

impl ToleranceConfig {
    fn numbers_agree(&self, a: f64, b: f64) -> bool {
        let allowed = self.absolute.max(self.relative * a.abs().max(b.abs()));
        (a - b).abs() <= allowed
    }

    fn days_apart(a: NaiveDate, b: NaiveDate) -> i64 {
        (a - b).num_days().abs()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.relative < 0.0 || self.absolute < 0.0 || self.percent_points < 0.0 {
            return Err("tolerances must be non-negative".to_string());
        }
        if !(0..=MAX_DATE_DAYS).contains(&self.date_days) {
            return Err(format!(
                "date_days must be within 0..={}, got {}",
                MAX_DATE_DAYS, self.date_days
            ));
        }
        Ok(())
    }

    fn slack(&self) -> chrono::Duration {
        chrono::Duration::days(self.date_days.clamp(0, MAX_DATE_DAYS))
    }

    /// `start - slack ..= end + slack`, saturating at the calendar bounds
    fn widened(&self, start: NaiveDate, end: NaiveDate) -> (NaiveDate, NaiveDate) {
        let slack = self.slack();
        (
            start.checked_sub_signed(slack).unwrap_or(NaiveDate::MIN),
            end.checked_add_signed(slack).unwrap_or(NaiveDate::MAX),
        )
    }

    fn date_in_range(&self, d: NaiveDate, start: NaiveDate, end: NaiveDate) -> bool {
        let (start, end) = self.widened(start, end);
        d >= start && d <= end
    }

    /// `Some(reason)` when the two values conflict
    pub fn conflict(&self, a: &FactValue, b: &FactValue) -> Option<String> {
        use FactValue::*;
        match (a, b) {
            (
                Money { amount: x, currency: cx },
                Money { amount: y, currency: cy },
            ) => {
                if cx != cy {
                    Some(format!("currency mismatch: {} vs {}", cx, cy))
                } else if !self.numbers_agree(*x, *y) {
                    Some(format!("amounts differ: {} vs {}", a, b))
                } else {
                    None
                }
            }
            (Percent { value: x }, Percent { value: y }) => {
                if (x - y).abs() > self.percent_points {
                    Some(format!("percentages differ: {} vs {}", a, b))
                } else {
                    None
                }
            }
            (Number { value: x, unit: ux }, Number { value: y, unit: uy }) => {
                match (ux, uy) {
                    (Some(ux), Some(uy)) if ux != uy => {
                        return Some(format!("unit mismatch: {} vs {}", ux, uy))
                    }
                    _ => {}
                }
                if self.numbers_agree(*x, *y) {
                    None
                } else {
                    Some(format!("numbers differ: {} vs {}", a, b))
                }
            }
            (Date { date: x }, Date { date: y }) => {
                if Self::days_apart(*x, *y) > self.date_days {
                    Some(format!("dates differ: {} vs {}", x, y))
                } else {
                    None
                }
            }
            (DateRange { start: s1, end: e1 }, DateRange { start: s2, end: e2 }) => {
                let (_, e1) = self.widened(*s1, *e1);
                let (_, e2) = self.widened(*s2, *e2);
                if *s1 <= e2 && *s2 <= e1 {
                    None
                } else {
                    Some(format!("date ranges do not overlap: {} vs {}", a, b))
                }
            }
            (Date { date }, DateRange { start, end }) | (DateRange { start, end }, Date { date }) => {
                if self.date_in_range(*date, *start, *end) {
                    None
                } else {
                    Some(format!("date {} outside {} to {}", date, start, end))
                }
            }
            (Text { text: x }, Text { text: y }) => {
                if normalize_text(x) == normalize_text(y) {
                    None
                } else {
                    Some(format!("text differs: '{}' vs '{}'", x, y))
                }
            }
            _ => Some(format!("value kinds differ: {} vs {}", a.kind(), b.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(amount: f64) -> FactValue {
        FactValue::Money {
            amount,
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn test_money_tolerance() {
        let t = ToleranceConfig::default();
        assert!(t.conflict(&usd(10_000_000.0), &usd(12_000_000.0)).is_some());
        assert!(t.conflict(&usd(10_000_000.0), &usd(10_010_000.0)).is_none());
        let eur = FactValue::Money {
            amount: 10_000_000.0,
            currency: "EUR".to_string(),
        };
        assert!(t.conflict(&usd(10_000_000.0), &eur).unwrap().contains("currency"));
    }

    #[test]
    fn test_text_normalization() {
        let t = ToleranceConfig::default();
        assert!(t
            .conflict(&FactValue::text("Jane Doe."), &FactValue::text("  jane   doe"))
            .is_none());
        assert!(t
            .conflict(&FactValue::text("Jane Doe"), &FactValue::text("John Roe"))
            .is_some());
    }

    #[test]
    fn test_dates_and_ranges() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        let t = ToleranceConfig::default();
        let q3 = FactValue::DateRange {
            start: d(2024, 7, 1),
            end: d(2024, 9, 30),
        };
        assert!(t.conflict(&q3, &FactValue::Date { date: d(2024, 8, 15) }).is_none());
        assert!(t.conflict(&q3, &FactValue::Date { date: d(2024, 10, 2) }).is_some());

        let lenient = ToleranceConfig {
            date_days: 3,
            ..Default::default()
        };
        assert!(lenient
            .conflict(&FactValue::Date { date: d(2024, 1, 1) }, &FactValue::Date { date: d(2024, 1, 3) })
            .is_none());
    }

    #[test]
    fn test_date_slack_is_bounded() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        let huge = ToleranceConfig {
            date_days: i64::MAX,
            ..Default::default()
        };
        assert!(huge.validate().is_err());
        let range = FactValue::DateRange {
            start: d(2024, 7, 1),
            end: d(2024, 9, 30),
        };
        // clamped to ten years instead of overflowing
        assert!(huge.conflict(&range, &FactValue::Date { date: d(2030, 1, 1) }).is_none());
        assert!(huge.conflict(&range, &FactValue::Date { date: d(2040, 1, 1) }).is_some());

        let negative = ToleranceConfig {
            date_days: -1,
            ..Default::default()
        };
        assert!(negative.validate().unwrap_err().contains("date_days"));
        assert!(ToleranceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_kind_mismatch_conflicts() {
        let t = ToleranceConfig::default();
        assert!(t
            .conflict(&FactValue::Percent { value: 5.0 }, &usd(5.0))
            .is_some());
    }
}
