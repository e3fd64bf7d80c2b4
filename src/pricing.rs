//! Membership upgrade pricing.
//!
//! [`upgrade_price`] is a pure function of the current membership, the
//! target plan and an explicit `now`. The unused part of the current period
//! is refunded pro rata and the rest is charged:
//!
//! ```text
//! used_days      = ceil((now - started_at) / 1 day)      (0 if now < started_at)
//! total_days     = 30 (monthly) | 365 (yearly)
//! remaining_days = max(total_days - used_days, 0)
//! refund         = current.price * remaining_days / total_days
//! price          = max(0, round_half_up_to_cents(target.price - refund))
//! ```
//!
//! Amounts are whole cents and the refund is computed as an exact fraction,
//! so rounding happens once at the end.

use crate::error::UpgradeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECS_PER_DAY: u64 = 86_400;

/// A non-negative amount in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: u64) -> Self {
        Money(cents)
    }

    pub const fn cents(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Parses `"40"`, `"40.5"` and `"40.00"`. More than two decimals or a sign
/// is rejected.
impl FromStr for Money {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UpgradeError::InvalidPrice(s.to_string());
        let s = s.trim();
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if whole.is_empty()
            || frac.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: u64 = whole.parse().map_err(|_| invalid())?;
        let frac: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .map(Money)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Money {
    type Error = UpgradeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Money> for String {
    fn from(m: Money) -> Self {
        m.to_string()
    }
}

/// Billing period of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Monthly,
    Yearly,
}

impl PeriodType {
    /// Days a period is prorated over.
    pub fn total_days(self) -> u64 {
        match self {
            PeriodType::Monthly => 30,
            PeriodType::Yearly => 365,
        }
    }
}

/// A plan a member can move to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub period: PeriodType,
    pub price: Money,
    /// Ordinal tier; higher is better.
    pub level: u32,
}

/// The member's current subscription. Read-only input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipState {
    pub plan_id: String,
    pub period_type: PeriodType,
    pub price: Money,
    pub level: u32,
    pub started_at: DateTime<Utc>,
}

/// Whether `current` may move to `target`.
///
/// Yearly to monthly is never allowed; within one period the level must
/// rise; monthly to yearly is always allowed.
pub fn check_eligibility(current: &MembershipState, target: &Plan) -> Result<(), UpgradeError> {
    match (current.period_type, target.period) {
        (PeriodType::Yearly, PeriodType::Monthly) => Err(UpgradeError::YearlyToMonthly),
        (PeriodType::Monthly, PeriodType::Yearly) => Ok(()),
        _ if target.level > current.level => Ok(()),
        _ => Err(UpgradeError::LevelNotHigher {
            current: current.level,
            target: target.level,
        }),
    }
}

/// Whole days of the current period already used, rounded up.
///
/// Any fraction of a day counts, down to the nanosecond.
pub fn used_days(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let elapsed = now - started_at;
    let Ok(secs) = u64::try_from(elapsed.num_seconds()) else {
        return 0;
    };
    let partial = secs % SECS_PER_DAY > 0 || elapsed.subsec_nanos() > 0;
    secs / SECS_PER_DAY + u64::from(partial)
}

/// Price to charge for moving to `target` at `now`.
///
/// With no current membership this is the target's list price. Otherwise
/// eligibility is checked first and an ineligible move returns its error
/// instead of a price.
pub fn upgrade_price(
    current: Option<&MembershipState>,
    target: &Plan,
    now: DateTime<Utc>,
) -> Result<Money, UpgradeError> {
    let Some(current) = current else {
        return Ok(target.price);
    };
    check_eligibility(current, target)?;

    let total = current.period_type.total_days();
    let remaining = total.saturating_sub(used_days(current.started_at, now));

    // price * total = target * total - current * remaining, in cents
    let total = i128::from(total);
    let numerator = i128::from(target.price.cents()) * total
        - i128::from(current.price.cents()) * i128::from(remaining);
    if numerator <= 0 {
        return Ok(Money::ZERO);
    }
    let cents = (numerator * 2 + total) / (2 * total);
    u64::try_from(cents)
        .map(Money)
        .map_err(|_| UpgradeError::InvalidPrice(format!("{cents} cents")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn plan(period: PeriodType, price: &str, level: u32) -> Plan {
        Plan {
            id: format!("{period:?}-{level}"),
            name: format!("Level {level}"),
            period,
            price: money(price),
            level,
        }
    }

    fn member(period: PeriodType, price: &str, level: u32, days_ago: i64) -> MembershipState {
        MembershipState {
            plan_id: "current".into(),
            period_type: period,
            price: money(price),
            level,
            started_at: now() - Duration::days(days_ago),
        }
    }

    #[test]
    fn money_parses_and_displays() {
        assert_eq!(money("40").to_string(), "40.00");
        assert_eq!(money("40.5").cents(), 4050);
        assert_eq!(money("0.07").to_string(), "0.07");
        for bad in ["", "-1", "1.234", "abc", ".5", "1e3"] {
            assert!(bad.parse::<Money>().is_err(), "{bad}");
        }
    }

    #[test]
    fn money_serialises_as_string() {
        let json = serde_json::to_string(&money("12.30")).unwrap();
        assert_eq!(json, "\"12.30\"");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, money("12.30"));
    }

    #[test]
    fn new_subscription_pays_list_price() {
        let target = plan(PeriodType::Yearly, "299.99", 2);
        for t in [now(), now() - Duration::days(400), now() + Duration::days(1)] {
            assert_eq!(upgrade_price(None, &target, t).unwrap(), target.price);
        }
    }

    #[test]
    fn yearly_to_monthly_is_disallowed() {
        let current = member(PeriodType::Yearly, "300", 2, 0);
        let target = plan(PeriodType::Monthly, "50", 3);
        assert_eq!(
            check_eligibility(&current, &target),
            Err(UpgradeError::YearlyToMonthly)
        );
        assert_eq!(
            upgrade_price(Some(&current), &target, now()),
            Err(UpgradeError::YearlyToMonthly)
        );
    }

    #[test]
    fn same_period_needs_higher_level() {
        let current = member(PeriodType::Monthly, "30", 2, 3);
        assert_eq!(
            check_eligibility(&current, &plan(PeriodType::Monthly, "60", 2)),
            Err(UpgradeError::LevelNotHigher {
                current: 2,
                target: 2
            })
        );
        assert!(check_eligibility(&current, &plan(PeriodType::Monthly, "60", 3)).is_ok());
        // Monthly to yearly is allowed even at a lower level.
        assert!(check_eligibility(&current, &plan(PeriodType::Yearly, "200", 1)).is_ok());
    }

    #[test]
    fn monthly_proration_example() {
        let current = member(PeriodType::Monthly, "30", 1, 10);
        let target = plan(PeriodType::Monthly, "60", 2);
        assert_eq!(used_days(current.started_at, now()), 10);
        assert_eq!(
            upgrade_price(Some(&current), &target, now()).unwrap(),
            money("40.00")
        );
    }

    #[test]
    fn partial_day_counts_as_used() {
        let started = now() - Duration::days(10) - Duration::minutes(1);
        assert_eq!(used_days(started, now()), 11);
        assert_eq!(used_days(now() + Duration::hours(1), now()), 0);
        let started = now() - Duration::days(10) - Duration::microseconds(500);
        assert_eq!(used_days(started, now()), 11);
        let started = now() - Duration::days(10) - Duration::nanoseconds(1);
        assert_eq!(used_days(started, now()), 11);
        assert_eq!(used_days(now() - Duration::days(10), now()), 10);
        assert_eq!(used_days(now(), now()), 0);
    }

    #[test]
    fn rounds_half_up_to_cents() {
        // refund = 10.00 * 29 / 30 = 9.6666.., price = 0.3333.. -> 0.33
        let current = member(PeriodType::Monthly, "10", 1, 1);
        let target = plan(PeriodType::Monthly, "10", 2);
        assert_eq!(
            upgrade_price(Some(&current), &target, now()).unwrap(),
            money("0.33")
        );
        // refund = 0.45 * 29 / 30 = 0.435, price = 0.015 -> 0.02
        let current = member(PeriodType::Monthly, "0.45", 1, 1);
        let target = plan(PeriodType::Monthly, "0.45", 2);
        assert_eq!(
            upgrade_price(Some(&current), &target, now()).unwrap(),
            money("0.02")
        );
    }

    #[test]
    fn never_negative() {
        let current = member(PeriodType::Yearly, "365", 1, 0);
        let target = plan(PeriodType::Yearly, "100", 2);
        assert_eq!(
            upgrade_price(Some(&current), &target, now()).unwrap(),
            Money::ZERO
        );
    }

    #[test]
    fn expired_period_refunds_nothing() {
        let current = member(PeriodType::Monthly, "30", 1, 45);
        let target = plan(PeriodType::Yearly, "300", 1);
        assert_eq!(
            upgrade_price(Some(&current), &target, now()).unwrap(),
            money("300")
        );
    }
}
