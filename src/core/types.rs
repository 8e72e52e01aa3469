use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use super::error::ConfigError;

/// Balances down to `-EPSILON` still count as solvent.
pub const EPSILON: f64 = 1e-6;

/// Cohort age is elapsed calendar days over this, not 365.25.
pub const DAYS_PER_YEAR: f64 = 365.0;

pub const TAXABLE_ACCOUNT: &str = "taxable";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStep {
    Yearly,
    Monthly,
}

impl PeriodStep {
    pub fn months(self) -> u32 {
        match self {
            PeriodStep::Yearly => 12,
            PeriodStep::Monthly => 1,
        }
    }

    /// Length of one period in years.
    pub fn fraction(self) -> f64 {
        match self {
            PeriodStep::Yearly => 1.0,
            PeriodStep::Monthly => 1.0 / 12.0,
        }
    }

    /// Converts an annual rate to the equivalent per-period rate by
    /// compounding, never by proration.
    pub fn compound_annual_rate(self, annual_rate: f64) -> f64 {
        (1.0 + annual_rate).powf(self.fraction()) - 1.0
    }
}

/// Fields that look one period ahead. Present only on records whose
/// successor exists and whose own yields are known.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Forward {
    pub next_date: NaiveDate,
    pub index_growth: f64,
    pub next_cpi: f64,
    pub next_bond_yield: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PeriodRecord {
    pub date: NaiveDate,
    pub index_level: f64,
    /// Per-period rate; `None` when the source row had no figure.
    pub dividend_yield: Option<f64>,
    /// Per-period rate; `None` when the source row had no figure.
    pub bond_yield: Option<f64>,
    pub cpi: f64,
    pub forward: Option<Forward>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tent {
    pub start_equity_ratio: f64,
    pub years: f64,
}

impl Tent {
    pub fn new(start_equity_ratio: f64, years: f64) -> Result<Self, ConfigError> {
        check_ratio("tent start equity ratio", start_equity_ratio)?;
        check_positive("tent years", years)?;
        Ok(Self {
            start_equity_ratio,
            years,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AllocationConfig {
    pub steady_state_equity_ratio: f64,
    pub tent: Option<Tent>,
}

impl AllocationConfig {
    pub fn new(steady_state_equity_ratio: f64, tent: Option<Tent>) -> Result<Self, ConfigError> {
        check_ratio("equity ratio", steady_state_equity_ratio)?;
        if let Some(tent) = tent {
            Tent::new(tent.start_equity_ratio, tent.years)?;
        }
        Ok(Self {
            steady_state_equity_ratio,
            tent,
        })
    }

    pub fn constant(steady_state_equity_ratio: f64) -> Result<Self, ConfigError> {
        Self::new(steady_state_equity_ratio, None)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExtraSpending {
    pub amount: f64,
    pub years: f64,
    pub index_to_inflation: bool,
}

/// Spending amounts, either annual (as configured) or per period (as the
/// engine consumes them, see [`SpendingConfig::per_period`]).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpendingConfig {
    pub base_spending: f64,
    pub extra: Option<ExtraSpending>,
}

impl SpendingConfig {
    pub fn new(base_spending: f64, extra: Option<ExtraSpending>) -> Result<Self, ConfigError> {
        check_non_negative("spending", base_spending)?;
        if let Some(extra) = extra {
            check_finite("extra spending amount", extra.amount)?;
            check_positive("extra spending years", extra.years)?;
        }
        Ok(Self {
            base_spending,
            extra,
        })
    }

    pub fn per_period(&self, step: PeriodStep) -> Self {
        let fraction = step.fraction();
        Self {
            base_spending: self.base_spending * fraction,
            extra: self.extra.map(|extra| ExtraSpending {
                amount: extra.amount * fraction,
                ..extra
            }),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PortfolioAccount {
    pub balance: f64,
    pub cost_basis: f64,
}

impl PortfolioAccount {
    /// A freshly funded account whose whole balance is principal.
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            cost_basis: balance,
        }
    }
}

/// Named sub-accounts. Iteration order is by name so every run visits
/// accounts identically.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Portfolio {
    pub accounts: BTreeMap<String, PortfolioAccount>,
}

impl Portfolio {
    pub fn single_taxable(balance: f64) -> Self {
        let mut portfolio = Self::default();
        portfolio.insert(TAXABLE_ACCOUNT, PortfolioAccount::new(balance));
        portfolio
    }

    pub fn insert(&mut self, name: &str, account: PortfolioAccount) {
        self.accounts.insert(name.to_string(), account);
    }

    pub fn get(&self, name: &str) -> Option<&PortfolioAccount> {
        self.accounts.get(name)
    }

    pub fn total_balance(&self) -> f64 {
        self.accounts.values().map(|account| account.balance).sum()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawalOrder {
    TaxableOnly,
    ProRata,
}

/// Which CPI indexes the spending charged at the start of a period.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InflationTiming {
    /// CPI of the period about to be entered.
    NextPeriod,
    CurrentPeriod,
}

/// Which bond yield earns income over a period.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BondYieldTiming {
    CurrentPeriod,
    NextPeriod,
}

/// Everything one backtest needs besides the market data. Money amounts
/// and the expense ratio are annual; the engine normalizes them to the
/// period length.
#[derive(Clone, Debug)]
pub struct Inputs {
    pub period: PeriodStep,
    pub goal_years: f64,
    pub spending: SpendingConfig,
    pub portfolio: Portfolio,
    pub allocation: AllocationConfig,
    pub expense_ratio: f64,
    pub data_start_year: i32,
    pub data_end_year: i32,
    pub withdrawal_order: WithdrawalOrder,
    pub inflation_timing: InflationTiming,
    pub bond_yield_timing: BondYieldTiming,
}

impl Inputs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("goal years", self.goal_years)?;
        SpendingConfig::new(self.spending.base_spending, self.spending.extra)?;
        AllocationConfig::new(
            self.allocation.steady_state_equity_ratio,
            self.allocation.tent,
        )?;
        check_non_negative("expense ratio", self.expense_ratio)?;
        if self.data_start_year >= self.data_end_year {
            return Err(ConfigError::EmptyWindow {
                start: self.data_start_year,
                end: self.data_end_year,
            });
        }
        self.window_start()?;
        self.window_end()?;
        for account in self.portfolio.accounts.values() {
            check_finite("account balance", account.balance)?;
            check_finite("account cost basis", account.cost_basis)?;
        }
        if self.withdrawal_order == WithdrawalOrder::TaxableOnly
            && self.portfolio.get(TAXABLE_ACCOUNT).is_none()
        {
            return Err(ConfigError::MissingAccount {
                name: TAXABLE_ACCOUNT.to_string(),
            });
        }
        Ok(())
    }

    pub fn window_start(&self) -> Result<NaiveDate, ConfigError> {
        year_start(self.data_start_year)
    }

    pub fn window_end(&self) -> Result<NaiveDate, ConfigError> {
        year_start(self.data_end_year)
    }
}

/// Run-level switches. These never change the numbers a run produces.
#[derive(Copy, Clone, Debug, Default)]
pub struct RunOptions {
    /// Keep the per-cohort verdicts in the report.
    pub verbose: bool,
    /// Evaluate cohorts on the rayon pool.
    pub parallel: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Success,
    Failure,
    Incomplete,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimulationOutcome {
    pub verdict: Verdict,
    /// Final balance in the cohort's starting purchasing power; `None` for
    /// incomplete runs.
    pub ending_balance_real: Option<f64>,
}

impl SimulationOutcome {
    pub fn incomplete() -> Self {
        Self {
            verdict: Verdict::Incomplete,
            ending_balance_real: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortResult {
    pub start_date: NaiveDate,
    pub verdict: Verdict,
    pub ending_balance: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub period: PeriodStep,
    pub equity_percent: f64,
    pub bond_percent: f64,
    pub tent: Option<Tent>,
    pub goal_years: f64,
    pub success_count: u32,
    pub total_count: u32,
    pub success_rate: f64,
    pub mean_ending_balance: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cohorts: Vec<CohortResult>,
}

/// Every intermediate quantity of one period of one cohort.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodTrace {
    pub date: NaiveDate,
    pub balance: f64,
    pub spending: f64,
    pub capital_gains_tax: f64,
    pub equities: f64,
    pub bonds: f64,
    pub equity_return: f64,
    pub equity_dividends: f64,
    pub bond_income: f64,
    pub net_expense: f64,
    pub new_balance: f64,
    pub cost_basis: f64,
}

/// January 1st of `year`, the date every yearly record and cohort uses.
pub fn year_start(year: i32) -> Result<NaiveDate, ConfigError> {
    NaiveDate::from_ymd_opt(year, 1, 1).ok_or(ConfigError::YearOutOfRange { year })
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotFinite { field })
    }
}

fn check_ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_finite(field, value)?;
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::RatioOutOfRange { field, value })
    }
}

fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_finite(field, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_finite(field, value)?;
    if value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compounding_monthly_rate_recovers_annual_rate() {
        let monthly = PeriodStep::Monthly.compound_annual_rate(0.05);
        assert!(((1.0 + monthly).powi(12) - 1.05).abs() < 1e-12);
        assert!(monthly < 0.05 / 12.0);
        assert!((PeriodStep::Yearly.compound_annual_rate(0.05) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn spending_per_period_scales_amounts_but_not_windows() {
        let spending = SpendingConfig::new(
            48.0,
            Some(ExtraSpending {
                amount: 12.0,
                years: 5.0,
                index_to_inflation: true,
            }),
        )
        .expect("valid spending");
        let monthly = spending.per_period(PeriodStep::Monthly);
        assert!((monthly.base_spending - 4.0).abs() < 1e-12);
        let extra = monthly.extra.expect("extra kept");
        assert!((extra.amount - 1.0).abs() < 1e-12);
        assert_eq!(extra.years, 5.0);
        assert!(extra.index_to_inflation);
    }

    #[test]
    fn allocation_rejects_ratios_outside_unit_interval() {
        assert_eq!(
            AllocationConfig::constant(1.2),
            Err(ConfigError::RatioOutOfRange {
                field: "equity ratio",
                value: 1.2
            })
        );
        assert!(Tent::new(0.3, 0.0).is_err());
        assert!(Tent::new(-0.1, 10.0).is_err());
    }

    #[test]
    fn taxable_only_order_requires_taxable_account() {
        let mut portfolio = Portfolio::default();
        portfolio.insert("roth", PortfolioAccount::new(100.0));
        let inputs = Inputs {
            period: PeriodStep::Yearly,
            goal_years: 30.0,
            spending: SpendingConfig::new(4.0, None).expect("valid spending"),
            portfolio,
            allocation: AllocationConfig::constant(1.0).expect("valid allocation"),
            expense_ratio: 0.001,
            data_start_year: 1871,
            data_end_year: 2016,
            withdrawal_order: WithdrawalOrder::TaxableOnly,
            inflation_timing: InflationTiming::NextPeriod,
            bond_yield_timing: BondYieldTiming::CurrentPeriod,
        };
        assert_eq!(
            inputs.validate(),
            Err(ConfigError::MissingAccount {
                name: "taxable".to_string()
            })
        );

        let mut pro_rata = inputs.clone();
        pro_rata.withdrawal_order = WithdrawalOrder::ProRata;
        assert_eq!(pro_rata.validate(), Ok(()));

        let mut far_future = pro_rata;
        far_future.data_end_year = 300_000;
        assert_eq!(
            far_future.validate(),
            Err(ConfigError::YearOutOfRange { year: 300_000 })
        );
    }

    #[test]
    fn year_start_reports_years_chrono_cannot_represent() {
        assert_eq!(
            year_start(1929),
            Ok(NaiveDate::from_ymd_opt(1929, 1, 1).expect("valid date"))
        );
        assert_eq!(
            year_start(i32::MAX),
            Err(ConfigError::YearOutOfRange { year: i32::MAX })
        );
    }
}
