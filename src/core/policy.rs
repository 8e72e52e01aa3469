use chrono::NaiveDate;

use super::types::{
    AllocationConfig, DAYS_PER_YEAR, InflationTiming, PeriodRecord, Portfolio, SpendingConfig,
    TAXABLE_ACCOUNT, WithdrawalOrder,
};

pub fn cohort_age_years(start: NaiveDate, current: NaiveDate) -> f64 {
    (current - start).num_days() as f64 / DAYS_PER_YEAR
}

/// Target equity fraction at a given cohort age. With a tent, the ratio
/// moves linearly from the tent's start ratio to the steady-state ratio and
/// stays there once the tent has run its course.
pub fn equity_ratio(cohort_age_years: f64, config: &AllocationConfig) -> f64 {
    match config.tent {
        Some(tent) if cohort_age_years < tent.years => {
            let progress = (cohort_age_years / tent.years).max(0.0);
            progress * (config.steady_state_equity_ratio - tent.start_equity_ratio)
                + tent.start_equity_ratio
        }
        _ => config.steady_state_equity_ratio,
    }
}

/// Price-level ratio between the period being charged and the cohort start.
/// `None` when the chosen CPI is not available for this record.
pub fn inflation_factor(record: &PeriodRecord, start_cpi: f64, timing: InflationTiming) -> Option<f64> {
    let cpi = match timing {
        InflationTiming::NextPeriod => record.forward?.next_cpi,
        InflationTiming::CurrentPeriod => record.cpi,
    };
    Some(cpi / start_cpi)
}

/// Spending for one period. `spending` must already be per period.
pub fn spending_amount(spending: &SpendingConfig, inflation: f64, cohort_age_years: f64) -> f64 {
    let mut amount = spending.base_spending * inflation;
    if let Some(extra) = spending.extra {
        if cohort_age_years < extra.years {
            amount += if extra.index_to_inflation {
                extra.amount * inflation
            } else {
                extra.amount
            };
        }
    }
    amount
}

/// How much to draw from each account. Pro-rata falls back to the taxable
/// account when nothing is left to split by.
pub fn withdrawal_shares(
    order: WithdrawalOrder,
    portfolio: &Portfolio,
    amount: f64,
) -> Vec<(String, f64)> {
    let taxable_only = || vec![(TAXABLE_ACCOUNT.to_string(), amount)];
    match order {
        WithdrawalOrder::TaxableOnly => taxable_only(),
        WithdrawalOrder::ProRata => {
            let total: f64 = portfolio
                .accounts
                .values()
                .map(|account| account.balance.max(0.0))
                .sum();
            if total <= 0.0 {
                if portfolio.get(TAXABLE_ACCOUNT).is_some() {
                    return taxable_only();
                }
                return portfolio
                    .accounts
                    .keys()
                    .next()
                    .map(|name| vec![(name.clone(), amount)])
                    .unwrap_or_default();
            }
            portfolio
                .accounts
                .iter()
                .map(|(name, account)| (name.clone(), amount * account.balance.max(0.0) / total))
                .collect()
        }
    }
}
