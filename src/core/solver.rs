use log::debug;

use super::engine::run_backtest;
use super::error::{BacktestError, ConfigError};
use super::series::TimeSeries;
use super::types::{Inputs, RunOptions};

#[derive(Debug, Clone, Copy)]
pub struct SpendingSolveConfig {
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SpendingSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_spending: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct SpendingSolveResult {
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub solved_spending: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub iterations: Vec<SpendingSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Largest starting annual spending whose cohort success rate still meets
/// the target. Bisection is valid because raising spending never raises
/// the success rate.
pub fn solve_max_spending(
    series: &TimeSeries,
    inputs: &Inputs,
    config: SpendingSolveConfig,
) -> Result<SpendingSolveResult, BacktestError> {
    validate_config(config)?;

    let meets_target = |rate: f64| rate + 1e-12 >= config.target_success_rate;
    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_rate = evaluate_candidate(series, inputs, config.search_min)?;
    let high_rate = evaluate_candidate(series, inputs, config.search_max)?;

    let mut solved_spending = None;
    let mut converged = false;
    let feasible;
    let message;

    if !meets_target(low_rate) {
        feasible = false;
        message = "No feasible spending found within the search bounds.".to_string();
    } else if meets_target(high_rate) {
        solved_spending = Some(config.search_max);
        converged = true;
        feasible = true;
        message = "Upper spending bound is still feasible; increase search max for a higher answer."
            .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let rate = evaluate_candidate(series, inputs, mid)?;
            debug!("solver iteration {it}: spending {mid:.4} -> success {rate:.4}");
            iterations.push(SpendingSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_spending: mid,
                success_rate: rate,
            });

            if meets_target(rate) {
                lo = mid;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved_spending = Some(lo);
        feasible = true;
        message = if converged {
            "Solved maximum sustainable spending.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let achieved_success_rate = match solved_spending {
        Some(spending) => Some(evaluate_candidate(series, inputs, spending)?),
        None => None,
    };

    Ok(SpendingSolveResult {
        target_success_rate: config.target_success_rate,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        solved_spending,
        achieved_success_rate,
        iterations,
        converged,
        feasible,
        message,
    })
}

fn evaluate_candidate(
    series: &TimeSeries,
    base_inputs: &Inputs,
    spending: f64,
) -> Result<f64, BacktestError> {
    let mut inputs = base_inputs.clone();
    inputs.spending.base_spending = spending.max(0.0);
    let report = run_backtest(series, &inputs, RunOptions::default())?;
    Ok(report.success_rate)
}

fn validate_config(config: SpendingSolveConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&config.target_success_rate) {
        return Err(ConfigError::RatioOutOfRange {
            field: "target success rate",
            value: config.target_success_rate,
        });
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return Err(ConfigError::NotFinite {
            field: "search bounds",
        });
    }
    if config.search_min < 0.0 {
        return Err(ConfigError::Negative {
            field: "search min",
            value: config.search_min,
        });
    }
    if config.search_max <= config.search_min {
        return Err(ConfigError::NotPositive {
            field: "search max - search min",
            value: config.search_max - config.search_min,
        });
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err(ConfigError::NotPositive {
            field: "tolerance",
            value: config.tolerance,
        });
    }
    if config.max_iterations == 0 {
        return Err(ConfigError::NotPositive {
            field: "max iterations",
            value: 0.0,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        AllocationConfig, BondYieldTiming, InflationTiming, PeriodRecord, PeriodStep, Portfolio,
        SpendingConfig, WithdrawalOrder, year_start,
    };

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    /// Flat market: a cohort survives `goal` years iff spending * goal <= balance.
    fn flat_series(years: usize) -> TimeSeries {
        let records = (0..years)
            .map(|offset| PeriodRecord {
                date: year_start(1900 + offset as i32).expect("valid year"),
                index_level: 100.0,
                dividend_yield: Some(0.0),
                bond_yield: Some(0.0),
                cpi: 10.0,
                forward: None,
            })
            .collect();
        TimeSeries::from_records(PeriodStep::Yearly, records).expect("valid series")
    }

    fn deterministic_inputs() -> Inputs {
        Inputs {
            period: PeriodStep::Yearly,
            goal_years: 10.0,
            spending: SpendingConfig::new(0.0, None).expect("valid spending"),
            portfolio: Portfolio::single_taxable(500.0),
            allocation: AllocationConfig::constant(1.0).expect("valid allocation"),
            expense_ratio: 0.0,
            data_start_year: 1900,
            data_end_year: 2000,
            withdrawal_order: WithdrawalOrder::TaxableOnly,
            inflation_timing: InflationTiming::NextPeriod,
            bond_yield_timing: BondYieldTiming::CurrentPeriod,
        }
    }

    fn config(search_max: f64) -> SpendingSolveConfig {
        SpendingSolveConfig {
            target_success_rate: 1.0,
            search_min: 0.0,
            search_max,
            tolerance: 0.01,
            max_iterations: 40,
        }
    }

    #[test]
    fn max_spending_solver_finds_deterministic_solution() {
        let series = flat_series(20);
        let result =
            solve_max_spending(&series, &deterministic_inputs(), config(200.0)).expect("solves");
        assert!(result.feasible);
        assert!(result.converged);
        let solved = result.solved_spending.expect("value expected");
        assert_close(solved, 50.0, 0.02);
        assert!(solved <= 50.0 + 1e-5);
        assert_close(result.achieved_success_rate.expect("rate"), 1.0, 1e-12);
        assert!(!result.iterations.is_empty());
    }

    #[test]
    fn feasible_upper_bound_is_returned_directly() {
        let series = flat_series(20);
        let result =
            solve_max_spending(&series, &deterministic_inputs(), config(40.0)).expect("solves");
        assert_eq!(result.solved_spending, Some(40.0));
        assert!(result.iterations.is_empty());
    }

    #[test]
    fn infeasible_lower_bound_reports_no_solution() {
        let series = flat_series(20);
        let mut cfg = config(200.0);
        cfg.search_min = 60.0;
        let result = solve_max_spending(&series, &deterministic_inputs(), cfg).expect("runs");
        assert!(!result.feasible);
        assert!(result.solved_spending.is_none());
        assert!(result.achieved_success_rate.is_none());
    }

    #[test]
    fn invalid_search_bounds_are_rejected() {
        let series = flat_series(20);
        let mut cfg = config(10.0);
        cfg.search_min = 10.0;
        let err = solve_max_spending(&series, &deterministic_inputs(), cfg).expect_err("bad bounds");
        assert!(matches!(err, BacktestError::Config(_)));
    }
}
