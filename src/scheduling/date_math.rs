//! Relative-timeframe arithmetic ("6 months", "σε 3 μήνες").
//!
//! Month and year steps are calendar-correct: when the target month is
//! shorter, the day of month is clamped to its last day
//! (Jan 31 + 1 month = Feb 29 in a leap year).

use std::str::FromStr;

use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use super::SchedulingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = SchedulingError;

    /// English and Greek unit words, singular or plural, any case or accent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = fold_greek(&s.trim().to_lowercase());
        let unit = match word.trim_end_matches('.') {
            "d" | "day" | "days" | "ημερα" | "ημερες" | "ημερων" | "μερα" | "μερες" | "μερων" => {
                Self::Day
            }
            "w" | "wk" | "wks" | "week" | "weeks" | "εβδομαδα" | "εβδομαδες" | "εβδομαδων" => {
                Self::Week
            }
            "mo" | "mos" | "month" | "months" | "μηνα" | "μηνας" | "μηνες" | "μηνων" => {
                Self::Month
            }
            "y" | "yr" | "yrs" | "year" | "years" | "χρονο" | "χρονος" | "χρονια" | "χρονων"
            | "ετος" | "ετη" | "ετων" => Self::Year,
            _ => {
                return Err(SchedulingError::InvalidTimeframe(format!(
                    "unrecognized unit '{}'",
                    s.trim()
                )))
            }
        };
        Ok(unit)
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strip Greek tonos/dialytika so "μήνες" and "ΜΗΝΕΣ" compare equal after lowercasing.
fn fold_greek(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'ά' => 'α',
            'έ' => 'ε',
            'ή' => 'η',
            'ί' | 'ϊ' | 'ΐ' => 'ι',
            'ό' => 'ο',
            'ύ' | 'ϋ' | 'ΰ' => 'υ',
            'ώ' => 'ω',
            other => other,
        })
        .collect()
}

/// A relative timeframe such as "6 months".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub amount: i64,
    pub unit: TimeUnit,
}

impl Timeframe {
    pub fn new(amount: i64, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    /// Parse from separate amount and unit strings, as emitted by the interpreter.
    pub fn from_parts(amount: &str, unit: &str) -> Result<Self, SchedulingError> {
        let amount = amount.trim().parse::<i64>().map_err(|_| {
            SchedulingError::InvalidTimeframe(format!("amount '{}' is not an integer", amount.trim()))
        })?;
        Ok(Self {
            amount,
            unit: unit.parse()?,
        })
    }

    /// Target date `amount` units after `reference` (before it, for negative amounts).
    pub fn apply(&self, reference: NaiveDate) -> Result<NaiveDate, SchedulingError> {
        let overflow = || {
            SchedulingError::InvalidTimeframe(format!(
                "{} {}(s) from {reference} is outside the supported calendar",
                self.amount, self.unit
            ))
        };
        let magnitude = self.amount.unsigned_abs();
        let forward = self.amount >= 0;

        match self.unit {
            TimeUnit::Day | TimeUnit::Week => {
                let days = if self.unit == TimeUnit::Week {
                    magnitude.checked_mul(7).ok_or_else(overflow)?
                } else {
                    magnitude
                };
                let days = Days::new(days);
                let target = if forward {
                    reference.checked_add_days(days)
                } else {
                    reference.checked_sub_days(days)
                };
                target.ok_or_else(overflow)
            }
            TimeUnit::Month | TimeUnit::Year => {
                let months = if self.unit == TimeUnit::Year {
                    magnitude.checked_mul(12).ok_or_else(overflow)?
                } else {
                    magnitude
                };
                let months = Months::new(u32::try_from(months).map_err(|_| overflow())?);
                let target = if forward {
                    reference.checked_add_months(months)
                } else {
                    reference.checked_sub_months(months)
                };
                target.ok_or_else(overflow)
            }
        }
    }
}

impl FromStr for Timeframe {
    type Err = SchedulingError;

    /// Accepts "6 months", "in 6 months", "σε 6 μήνες", "after 2 weeks".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s
            .split_whitespace()
            .filter(|t| {
                !matches!(
                    fold_greek(&t.to_lowercase()).as_str(),
                    "in" | "after" | "σε" | "μετα"
                )
            })
            .collect();

        match tokens.as_slice() {
            [amount, unit] => Self::from_parts(amount, unit),
            _ => Err(SchedulingError::InvalidTimeframe(format!(
                "expected '<amount> <unit>', got '{}'",
                s.trim()
            ))),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plural = if self.amount.abs() == 1 { "" } else { "s" };
        write!(f, "{} {}{}", self.amount, self.unit, plural)
    }
}

/// Compute `reference_date` + `amount` `unit`s.
///
/// Fails with `InvalidTimeframe` when the unit is unrecognized or the
/// amount is not an integer.
pub fn add_timeframe(
    reference_date: NaiveDate,
    amount: &str,
    unit: &str,
) -> Result<NaiveDate, SchedulingError> {
    Timeframe::from_parts(amount, unit)?.apply(reference_date)
}
