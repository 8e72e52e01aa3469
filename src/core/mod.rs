mod engine;
mod error;
mod policy;
mod portfolio;
mod series;
mod solver;
mod types;

pub use engine::{CohortState, CohortStatus, PeriodTerms, run_backtest, run_debug_cohort, simulate_cohort};
pub use error::{BacktestError, ConfigError, LoadError};
pub use policy::{cohort_age_years, equity_ratio, inflation_factor, spending_amount, withdrawal_shares};
pub use portfolio::{PeriodMarket, PeriodReturn, capital_gains_tax};
pub use series::{LoadOptions, TimeSeries};
pub use solver::{SpendingSolveConfig, SpendingSolveIteration, SpendingSolveResult, solve_max_spending};
pub use types::{
    AllocationConfig, BacktestReport, BondYieldTiming, CohortResult, DAYS_PER_YEAR, EPSILON,
    ExtraSpending, Forward, InflationTiming, Inputs, PeriodRecord, PeriodStep, PeriodTrace,
    Portfolio, PortfolioAccount, RunOptions, SimulationOutcome, SpendingConfig, TAXABLE_ACCOUNT,
    Tent, Verdict, WithdrawalOrder, year_start,
};
