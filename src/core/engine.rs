use chrono::NaiveDate;
use log::{debug, info};
use rayon::prelude::*;

use super::error::BacktestError;
use super::policy::{cohort_age_years, equity_ratio, inflation_factor, spending_amount};
use super::portfolio::PeriodMarket;
use super::series::TimeSeries;
use super::types::{
    BacktestReport, BondYieldTiming, CohortResult, EPSILON, Inputs, PeriodRecord, PeriodTrace,
    Portfolio, RunOptions, SimulationOutcome, SpendingConfig, Verdict,
};

/// Inputs scaled to one simulation period.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PeriodTerms {
    pub spending: SpendingConfig,
    pub expense_ratio: f64,
}

impl PeriodTerms {
    pub fn from_inputs(inputs: &Inputs) -> Self {
        Self {
            spending: inputs.spending.per_period(inputs.period),
            expense_ratio: inputs.period.compound_annual_rate(inputs.expense_ratio),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CohortStatus {
    Running,
    Success,
    Failure,
    Incomplete,
}

/// One retiree starting at `start_date`. Owns its own copy of the
/// portfolio; the series and inputs are shared read-only.
#[derive(Debug)]
pub struct CohortState<'a> {
    series: &'a TimeSeries,
    inputs: &'a Inputs,
    terms: PeriodTerms,
    start_date: NaiveDate,
    current_date: NaiveDate,
    end_date: NaiveDate,
    start_cpi: f64,
    portfolio: Portfolio,
    status: CohortStatus,
}

impl<'a> CohortState<'a> {
    pub fn new(
        series: &'a TimeSeries,
        inputs: &'a Inputs,
        terms: PeriodTerms,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Self, BacktestError> {
        let start_cpi = series
            .get(start_date)
            .map(|record| record.cpi)
            .ok_or(BacktestError::MissingStart(start_date))?;
        Ok(Self {
            series,
            inputs,
            terms,
            start_date,
            current_date: start_date,
            end_date,
            start_cpi,
            portfolio: inputs.portfolio.clone(),
            status: CohortStatus::Running,
        })
    }

    pub fn status(&self) -> CohortStatus {
        self.status
    }

    pub fn current_date(&self) -> NaiveDate {
        self.current_date
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn age_years(&self) -> f64 {
        cohort_age_years(self.start_date, self.current_date)
    }

    /// Spending due at the start of the current period, or `None` when the
    /// record needed to index it is unavailable.
    pub fn spending_amount(&self, record: &PeriodRecord) -> Option<f64> {
        let inflation = inflation_factor(record, self.start_cpi, self.inputs.inflation_timing)?;
        Some(spending_amount(
            &self.terms.spending,
            inflation,
            self.age_years(),
        ))
    }

    /// Runs one period: withdraw, grow, step the date, check solvency.
    /// Reaching a record without forward data ends the run as incomplete.
    pub fn advance_period(
        &mut self,
        trace: Option<&mut Vec<PeriodTrace>>,
    ) -> Result<CohortStatus, BacktestError> {
        if self.status != CohortStatus::Running {
            return Ok(self.status);
        }

        let series = self.series;
        let Some(record) = series.get(self.current_date) else {
            self.status = CohortStatus::Incomplete;
            return Ok(self.status);
        };
        let (Some(forward), Some(market), Some(spending)) = (
            record.forward,
            period_market(record, self.inputs.bond_yield_timing),
            self.spending_amount(record),
        ) else {
            self.status = CohortStatus::Incomplete;
            return Ok(self.status);
        };

        let balance = self.portfolio.total_balance();
        let capital_gains_tax = self
            .portfolio
            .withdraw(self.inputs.withdrawal_order, spending)?;

        let ratio = equity_ratio(self.age_years(), &self.inputs.allocation);
        let breakdown = self
            .portfolio
            .apply_period_return(market, ratio, self.terms.expense_ratio);

        if let Some(rows) = trace {
            rows.push(PeriodTrace {
                date: self.current_date,
                balance,
                spending,
                capital_gains_tax,
                equities: breakdown.equities,
                bonds: breakdown.bonds,
                equity_return: breakdown.equity_return,
                equity_dividends: breakdown.equity_dividends,
                bond_income: breakdown.bond_income,
                net_expense: breakdown.net_expense,
                new_balance: self.portfolio.total_balance(),
                cost_basis: self.portfolio.total_cost_basis(),
            });
        }

        self.current_date = forward.next_date;

        if self.portfolio.total_balance() < -EPSILON {
            self.status = CohortStatus::Failure;
        }
        Ok(self.status)
    }

    /// Drives the cohort to a terminal state. The horizon is checked before
    /// the end of data, so a cohort that reaches its goal on the last usable
    /// date still succeeds.
    pub fn run(
        mut self,
        mut trace: Option<&mut Vec<PeriodTrace>>,
    ) -> Result<SimulationOutcome, BacktestError> {
        while self.status == CohortStatus::Running {
            if self.age_years() >= self.inputs.goal_years {
                self.status = CohortStatus::Success;
            } else if self.current_date >= self.end_date {
                self.status = CohortStatus::Incomplete;
            } else {
                self.advance_period(trace.as_deref_mut())?;
            }
        }
        Ok(self.outcome())
    }

    fn outcome(&self) -> SimulationOutcome {
        let verdict = match self.status {
            CohortStatus::Success => Verdict::Success,
            CohortStatus::Failure => Verdict::Failure,
            CohortStatus::Running | CohortStatus::Incomplete => {
                return SimulationOutcome::incomplete();
            }
        };
        let Some(current) = self.series.get(self.current_date) else {
            return SimulationOutcome::incomplete();
        };
        SimulationOutcome {
            verdict,
            ending_balance_real: Some(
                self.portfolio.total_balance() / current.cpi * self.start_cpi,
            ),
        }
    }
}

fn period_market(record: &PeriodRecord, timing: BondYieldTiming) -> Option<PeriodMarket> {
    let forward = record.forward?;
    let bond_yield = match timing {
        BondYieldTiming::CurrentPeriod => record.bond_yield?,
        BondYieldTiming::NextPeriod => forward.next_bond_yield?,
    };
    Some(PeriodMarket {
        index_growth: forward.index_growth,
        dividend_yield: record.dividend_yield?,
        bond_yield,
    })
}

/// Validates the run and returns the per-period terms plus the exclusive
/// end for every cohort: the data window's end or the end of usable data,
/// whichever comes first.
fn prepare(
    series: &TimeSeries,
    inputs: &Inputs,
) -> Result<(PeriodTerms, NaiveDate), BacktestError> {
    inputs.validate()?;
    if series.step() != inputs.period {
        return Err(BacktestError::StepMismatch {
            series: series.step(),
            inputs: inputs.period,
        });
    }
    let end = inputs.window_end()?.min(series.usable_end());
    Ok((PeriodTerms::from_inputs(inputs), end))
}

pub fn simulate_cohort(
    series: &TimeSeries,
    inputs: &Inputs,
    start_date: NaiveDate,
) -> Result<SimulationOutcome, BacktestError> {
    let (terms, end) = prepare(series, inputs)?;
    CohortState::new(series, inputs, terms, start_date, end)?.run(None)
}

/// Runs a single cohort and records every period, for checking the engine
/// against hand calculations.
pub fn run_debug_cohort(
    series: &TimeSeries,
    inputs: &Inputs,
    start_date: NaiveDate,
) -> Result<(SimulationOutcome, Vec<PeriodTrace>), BacktestError> {
    let (terms, end) = prepare(series, inputs)?;
    let mut trace = Vec::new();
    let outcome =
        CohortState::new(series, inputs, terms, start_date, end)?.run(Some(&mut trace))?;
    Ok((outcome, trace))
}

#[derive(Debug, Default)]
struct Tally {
    success_count: u32,
    total_count: u32,
    total_balance: f64,
    cohorts: Vec<CohortResult>,
}

impl Tally {
    fn record(&mut self, start_date: NaiveDate, outcome: SimulationOutcome, keep_cohort: bool) {
        if keep_cohort {
            self.cohorts.push(CohortResult {
                start_date,
                verdict: outcome.verdict,
                ending_balance: outcome.ending_balance_real,
            });
        }
        let Some(balance) = outcome.ending_balance_real else {
            return;
        };
        self.total_count += 1;
        if outcome.verdict == Verdict::Success {
            self.success_count += 1;
        }
        self.total_balance += balance;
    }
}

/// Every historical start date in the data window, each cohort on a fresh
/// copy of the template portfolio. Cohorts that run out of data are left
/// out of the statistics.
pub fn run_backtest(
    series: &TimeSeries,
    inputs: &Inputs,
    options: RunOptions,
) -> Result<BacktestReport, BacktestError> {
    let (terms, end) = prepare(series, inputs)?;
    let window_start = inputs.window_start()?;
    let first = series.first_on_or_after(window_start);

    let tally = if options.parallel {
        run_parallel(series, inputs, terms, first, end, options.verbose)?
    } else {
        run_sequential(series, inputs, terms, first, end, options.verbose)?
    };

    if tally.total_count == 0 {
        return Err(BacktestError::NoCompletedCohorts {
            start: window_start,
            end,
        });
    }

    let success_rate = tally.success_count as f64 / tally.total_count as f64;
    info!(
        "{} of {} cohorts succeeded ({:.1}%)",
        tally.success_count,
        tally.total_count,
        success_rate * 100.0
    );

    let equity = inputs.allocation.steady_state_equity_ratio;
    Ok(BacktestReport {
        period: inputs.period,
        equity_percent: equity * 100.0,
        bond_percent: (1.0 - equity) * 100.0,
        tent: inputs.allocation.tent,
        goal_years: inputs.goal_years,
        success_count: tally.success_count,
        total_count: tally.total_count,
        success_rate,
        mean_ending_balance: tally.total_balance / tally.total_count as f64,
        cohorts: tally.cohorts,
    })
}

/// Walks start dates in order and stops at the first incomplete cohort;
/// every later start would run out of data as well.
fn run_sequential(
    series: &TimeSeries,
    inputs: &Inputs,
    terms: PeriodTerms,
    first: Option<NaiveDate>,
    end: NaiveDate,
    verbose: bool,
) -> Result<Tally, BacktestError> {
    let mut tally = Tally::default();
    let mut next = first;
    while let Some(start) = next {
        if start >= end {
            break;
        }
        let outcome = CohortState::new(series, inputs, terms, start, end)?.run(None)?;
        if outcome.verdict == Verdict::Incomplete {
            debug!("cohort {start} ran out of data, stopping");
            break;
        }
        tally.record(start, outcome, verbose);
        next = series.next_date(start);
    }
    Ok(tally)
}

/// Evaluates every candidate start on the rayon pool, then folds the
/// outcomes in start-date order with the same stop at the first incomplete
/// cohort as the sequential walk. A later start can fail before reaching
/// the end of data, so it must not be counted past that point.
fn run_parallel(
    series: &TimeSeries,
    inputs: &Inputs,
    terms: PeriodTerms,
    first: Option<NaiveDate>,
    end: NaiveDate,
    verbose: bool,
) -> Result<Tally, BacktestError> {
    let starts: Vec<NaiveDate> =
        std::iter::successors(first, |date| series.next_date(*date))
            .take_while(|date| *date < end)
            .collect();
    debug!("evaluating {} cohorts in parallel", starts.len());

    let outcomes = starts
        .par_iter()
        .map(|start| CohortState::new(series, inputs, terms, *start, end)?.run(None))
        .collect::<Result<Vec<_>, _>>()?;

    let mut tally = Tally::default();
    for (start, outcome) in starts.into_iter().zip(outcomes) {
        if outcome.verdict == Verdict::Incomplete {
            debug!("cohort {start} ran out of data, stopping");
            break;
        }
        tally.record(start, outcome, verbose);
    }
    Ok(tally)
}
