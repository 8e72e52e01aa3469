use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::core::{
    AllocationConfig, BacktestReport, BondYieldTiming, CohortResult, ExtraSpending,
    InflationTiming, Inputs, LoadError, LoadOptions, PeriodStep, PeriodTrace, Portfolio,
    PortfolioAccount, RunOptions, SpendingConfig, SpendingSolveConfig, SpendingSolveResult,
    TAXABLE_ACCOUNT, Tent, TimeSeries, Verdict, WithdrawalOrder, run_backtest, run_debug_cohort,
    solve_max_spending, year_start,
};

const MIN_DATA_START: i32 = 1871;
const MAX_DATA_END: i32 = 2021;
const DEFAULT_DATA_END: i32 = 2016;
const DEFAULT_DATA_PATH: &str = "shiller.csv";
const DATA_PATH_ENV: &str = "BACKTEST_DATA";

const TRACE_HEADER: &str = "date / balance / spending capitalGainsTax / equities bonds / equityReturn equityDividends bondDividends netExpense / newBalance costBasis";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliWithdrawalOrder {
    TaxableOnly,
    ProRata,
}

impl From<CliWithdrawalOrder> for WithdrawalOrder {
    fn from(value: CliWithdrawalOrder) -> Self {
        match value {
            CliWithdrawalOrder::TaxableOnly => WithdrawalOrder::TaxableOnly,
            CliWithdrawalOrder::ProRata => WithdrawalOrder::ProRata,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliInflationTiming {
    Next,
    Current,
}

impl From<CliInflationTiming> for InflationTiming {
    fn from(value: CliInflationTiming) -> Self {
        match value {
            CliInflationTiming::Next => InflationTiming::NextPeriod,
            CliInflationTiming::Current => InflationTiming::CurrentPeriod,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliBondYieldTiming {
    Current,
    Next,
}

impl From<CliBondYieldTiming> for BondYieldTiming {
    fn from(value: CliBondYieldTiming) -> Self {
        match value {
            CliBondYieldTiming::Current => BondYieldTiming::CurrentPeriod,
            CliBondYieldTiming::Next => BondYieldTiming::NextPeriod,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiWithdrawalOrder {
    #[serde(alias = "taxableOnly", alias = "taxable_only", alias = "taxable")]
    TaxableOnly,
    #[serde(alias = "proRata", alias = "pro_rata")]
    ProRata,
}

impl From<ApiWithdrawalOrder> for CliWithdrawalOrder {
    fn from(value: ApiWithdrawalOrder) -> Self {
        match value {
            ApiWithdrawalOrder::TaxableOnly => CliWithdrawalOrder::TaxableOnly,
            ApiWithdrawalOrder::ProRata => CliWithdrawalOrder::ProRata,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiTiming {
    #[serde(alias = "nextPeriod", alias = "next-period", alias = "next_period")]
    Next,
    #[serde(alias = "currentPeriod", alias = "current-period", alias = "current_period")]
    Current,
}

impl From<ApiTiming> for CliInflationTiming {
    fn from(value: ApiTiming) -> Self {
        match value {
            ApiTiming::Next => CliInflationTiming::Next,
            ApiTiming::Current => CliInflationTiming::Current,
        }
    }
}

impl From<ApiTiming> for CliBondYieldTiming {
    fn from(value: ApiTiming) -> Self {
        match value {
            ApiTiming::Next => CliBondYieldTiming::Next,
            ApiTiming::Current => CliBondYieldTiming::Current,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct TentArg {
    start_percent: f64,
    years: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct ExtraSpendingArg {
    amount: f64,
    years: f64,
    real: bool,
}

#[derive(Clone, Debug, PartialEq)]
struct AccountArg {
    name: String,
    balance: f64,
}

fn parse_tent(arg: &str) -> Result<TentArg, String> {
    let (start, years) = arg
        .split_once(',')
        .ok_or_else(|| "expected PERCENT_START,YEARS".to_string())?;
    Ok(TentArg {
        start_percent: parse_number(start, "tent start percent")?,
        years: parse_number(years, "tent years")?,
    })
}

fn parse_extra_spending(arg: &str) -> Result<ExtraSpendingArg, String> {
    let parts: Vec<&str> = arg.split(',').map(str::trim).collect();
    let real = match parts.as_slice() {
        [_, _] => false,
        [_, _, "real"] => true,
        [_, _, "nominal"] => false,
        _ => return Err("expected DOLLARS,YEARS[,real|nominal]".to_string()),
    };
    Ok(ExtraSpendingArg {
        amount: parse_number(parts[0], "extra spending amount")?,
        years: parse_number(parts[1], "extra spending years")?,
        real,
    })
}

fn parse_account(arg: &str) -> Result<AccountArg, String> {
    let (name, balance) = arg
        .split_once('=')
        .ok_or_else(|| "expected NAME=BALANCE".to_string())?;
    let name = name.trim();
    if name.is_empty() {
        return Err("account name cannot be empty".to_string());
    }
    Ok(AccountArg {
        name: name.to_string(),
        balance: parse_number(balance, "account balance")?,
    })
}

fn parse_number(value: &str, what: &str) -> Result<f64, String> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("invalid {what}: '{value}'"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BacktestPayload {
    monthly: Option<bool>,
    equity_percent: Option<f64>,
    tent_start_percent: Option<f64>,
    tent_years: Option<f64>,
    extra_spending_amount: Option<f64>,
    extra_spending_years: Option<f64>,
    extra_spending_real: Option<bool>,
    expense_ratio: Option<f64>,
    skip_dividends: Option<bool>,
    data_start: Option<i32>,
    data_end: Option<i32>,
    goal_years: Option<f64>,
    start_annual_spending: Option<f64>,
    portfolio_size: Option<f64>,
    withdrawal_order: Option<ApiWithdrawalOrder>,
    inflation_timing: Option<ApiTiming>,
    bond_yield_timing: Option<ApiTiming>,
    verbose: Option<bool>,
    parallel: Option<bool>,
    debug_year: Option<i32>,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cohort-backtest",
    about = "Retirement plan backtester: replays every historical start date against a withdrawal plan"
)]
struct Cli {
    #[arg(
        long,
        short = 'v',
        help = "Print the outcome of each cohort tested"
    )]
    verbose: bool,
    #[arg(long, value_name = "YEAR", help = "Trace a single cohort starting in YEAR")]
    debug: Option<i32>,
    #[arg(long, help = "Use months as the unit of time instead of years")]
    monthly: bool,
    #[arg(long, default_value_t = 100.0, help = "Equity percentage")]
    equity_percent: f64,
    #[arg(
        long,
        value_parser = parse_tent,
        help = "Linear equity glide path. Format: PERCENT_START,YEARS"
    )]
    tent: Option<TentArg>,
    #[arg(
        long,
        value_parser = parse_extra_spending,
        help = "Temporary extra spending. Format: DOLLARS,YEARS[,real] (thousands of dollars)"
    )]
    extra_spending: Option<ExtraSpendingArg>,
    #[arg(
        long,
        default_value_t = 0.1,
        help = "Expense ratio in percent per year"
    )]
    expense_ratio: f64,
    #[arg(
        long,
        default_value_t = MIN_DATA_START,
        help = "Simulations start on or after this year"
    )]
    data_start: i32,
    #[arg(
        long,
        default_value_t = DEFAULT_DATA_END,
        help = "Simulations end before this year"
    )]
    data_end: i32,
    #[arg(long, help = "Assume dividends are always zero")]
    skip_dividends: bool,
    #[arg(
        long,
        default_value = DEFAULT_DATA_PATH,
        help = "Market data CSV: date,index,dividend,earnings,cpi,bond_yield_percent"
    )]
    data: String,
    #[arg(long, value_enum, default_value_t = CliWithdrawalOrder::TaxableOnly)]
    withdrawal_order: CliWithdrawalOrder,
    #[arg(
        long = "account",
        value_parser = parse_account,
        help = "Additional account funded at start. Format: NAME=BALANCE (repeatable)"
    )]
    accounts: Vec<AccountArg>,
    #[arg(
        long,
        value_enum,
        default_value_t = CliInflationTiming::Next,
        help = "CPI used to index spending: the period being entered or the current one"
    )]
    inflation_timing: CliInflationTiming,
    #[arg(
        long,
        value_enum,
        default_value_t = CliBondYieldTiming::Current,
        help = "Bond yield earned over a period: the current period's or the next one's"
    )]
    bond_yield_timing: CliBondYieldTiming,
    #[arg(long, help = "Evaluate cohorts on all cores")]
    parallel: bool,
    #[arg(
        long,
        value_name = "PERCENT",
        help = "Instead of a report, find the largest starting spending with this success rate"
    )]
    solve_success_rate: Option<f64>,
    #[arg(help = "Number of years the portfolio must last")]
    goal_years: f64,
    #[arg(help = "Spending per year, adjusted for inflation (thousands of dollars)")]
    start_annual_spending: f64,
    #[arg(help = "Starting size of the taxable portfolio (thousands of dollars)")]
    portfolio_size: f64,
}

#[derive(Copy, Clone, Debug)]
struct ApiOptions {
    run: RunOptions,
    skip_dividends: bool,
    debug_year: Option<i32>,
}

#[derive(Debug)]
struct ApiRequest {
    inputs: Inputs,
    options: ApiOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DebugResponse {
    start_date: chrono::NaiveDate,
    verdict: Verdict,
    ending_balance: Option<f64>,
    periods: Vec<PeriodTrace>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BacktestResponse {
    Report(BacktestReport),
    Debug(DebugResponse),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// The market data under every loading variant a request can ask for.
#[derive(Debug)]
struct SeriesSet {
    yearly: TimeSeries,
    yearly_without_dividends: TimeSeries,
    monthly: TimeSeries,
    monthly_without_dividends: TimeSeries,
}

impl SeriesSet {
    fn load(path: &str) -> Result<Self, LoadError> {
        Self::build(|options| TimeSeries::load_csv(path, options))
    }

    fn build(
        mut load: impl FnMut(LoadOptions) -> Result<TimeSeries, LoadError>,
    ) -> Result<Self, LoadError> {
        let options = |step, skip_dividends| LoadOptions {
            step,
            skip_dividends,
        };
        Ok(Self {
            yearly: load(options(PeriodStep::Yearly, false))?,
            yearly_without_dividends: load(options(PeriodStep::Yearly, true))?,
            monthly: load(options(PeriodStep::Monthly, false))?,
            monthly_without_dividends: load(options(PeriodStep::Monthly, true))?,
        })
    }

    fn select(&self, step: PeriodStep, skip_dividends: bool) -> &TimeSeries {
        match (step, skip_dividends) {
            (PeriodStep::Yearly, false) => &self.yearly,
            (PeriodStep::Yearly, true) => &self.yearly_without_dividends,
            (PeriodStep::Monthly, false) => &self.monthly,
            (PeriodStep::Monthly, true) => &self.monthly_without_dividends,
        }
    }
}

fn build_inputs(cli: &Cli) -> Result<Inputs, String> {
    if cli.data_start < MIN_DATA_START {
        return Err(format!(
            "--data-start {} is before the start year of {MIN_DATA_START}",
            cli.data_start
        ));
    }
    if cli.data_end > MAX_DATA_END {
        return Err(format!(
            "--data-end {} is after the end year of {MAX_DATA_END}",
            cli.data_end
        ));
    }
    if cli.data_end <= cli.data_start {
        return Err("--data-end must be after --data-start".to_string());
    }
    if !(0.0..=100.0).contains(&cli.equity_percent) {
        return Err("--equity-percent must be between 0 and 100".to_string());
    }
    if !cli.expense_ratio.is_finite() || !(0.0..100.0).contains(&cli.expense_ratio) {
        return Err("--expense-ratio must be >= 0 and < 100".to_string());
    }
    if !cli.goal_years.is_finite() || cli.goal_years <= 0.0 {
        return Err("goal years must be > 0".to_string());
    }
    if !cli.start_annual_spending.is_finite() || cli.start_annual_spending < 0.0 {
        return Err("starting annual spending must be >= 0".to_string());
    }
    if !cli.portfolio_size.is_finite() || cli.portfolio_size < 0.0 {
        return Err("portfolio size must be >= 0".to_string());
    }

    let tent = match cli.tent {
        Some(tent) => {
            if !(0.0..=100.0).contains(&tent.start_percent) {
                return Err("--tent start percent must be between 0 and 100".to_string());
            }
            if !tent.years.is_finite() || tent.years <= 0.0 {
                return Err("--tent years must be > 0".to_string());
            }
            Some(Tent::new(tent.start_percent / 100.0, tent.years).map_err(|e| e.to_string())?)
        }
        None => None,
    };

    let extra = match cli.extra_spending {
        Some(extra) => {
            if !extra.years.is_finite() || extra.years <= 0.0 {
                return Err("--extra-spending years must be > 0".to_string());
            }
            Some(ExtraSpending {
                amount: extra.amount,
                years: extra.years,
                index_to_inflation: extra.real,
            })
        }
        None => None,
    };

    let mut portfolio = Portfolio::single_taxable(cli.portfolio_size);
    for account in &cli.accounts {
        if account.name == TAXABLE_ACCOUNT {
            return Err(format!(
                "--account cannot redefine '{TAXABLE_ACCOUNT}'; use the portfolio size argument"
            ));
        }
        if portfolio.get(&account.name).is_some() {
            return Err(format!("--account '{}' given more than once", account.name));
        }
        if !account.balance.is_finite() || account.balance < 0.0 {
            return Err(format!("--account '{}' balance must be >= 0", account.name));
        }
        portfolio.insert(&account.name, PortfolioAccount::new(account.balance));
    }

    let inputs = Inputs {
        period: if cli.monthly {
            PeriodStep::Monthly
        } else {
            PeriodStep::Yearly
        },
        goal_years: cli.goal_years,
        spending: SpendingConfig::new(cli.start_annual_spending, extra)
            .map_err(|e| e.to_string())?,
        portfolio,
        allocation: AllocationConfig::new(cli.equity_percent / 100.0, tent)
            .map_err(|e| e.to_string())?,
        expense_ratio: cli.expense_ratio / 100.0,
        data_start_year: cli.data_start,
        data_end_year: cli.data_end,
        withdrawal_order: cli.withdrawal_order.into(),
        inflation_timing: cli.inflation_timing.into(),
        bond_yield_timing: cli.bond_yield_timing.into(),
    };
    inputs.validate().map_err(|e| e.to_string())?;
    Ok(inputs)
}

/// One-shot command line run. Prints the report (or trace, or solver
/// result) to stdout.
pub fn run_cli(args: Vec<String>) -> Result<(), String> {
    let cli = Cli::parse_from(args);
    let inputs = build_inputs(&cli)?;
    let series = TimeSeries::load_csv(
        &cli.data,
        LoadOptions {
            step: inputs.period,
            skip_dividends: cli.skip_dividends,
        },
    )
    .map_err(|e| e.to_string())?;

    if let Some(year) = cli.debug {
        let start_date = year_start(year).map_err(|e| format!("--debug: {e}"))?;
        let (outcome, trace) =
            run_debug_cohort(&series, &inputs, start_date).map_err(|e| e.to_string())?;
        println!("{TRACE_HEADER}");
        for row in &trace {
            println!("{}", format_trace_row(row));
        }
        println!(
            "{}",
            format_cohort_line(&CohortResult {
                start_date,
                verdict: outcome.verdict,
                ending_balance: outcome.ending_balance_real,
            })
        );
        return Ok(());
    }

    if let Some(percent) = cli.solve_success_rate {
        if !(0.0..=100.0).contains(&percent) {
            return Err("--solve-success-rate must be between 0 and 100".to_string());
        }
        let config = SpendingSolveConfig {
            target_success_rate: percent / 100.0,
            search_min: 0.0,
            search_max: cli.portfolio_size.max(cli.start_annual_spending).max(1.0),
            tolerance: 0.01,
            max_iterations: 40,
        };
        let result =
            solve_max_spending(&series, &inputs, config).map_err(|e| e.to_string())?;
        println!("{}", format_solve_result(&result));
        return Ok(());
    }

    let report = run_backtest(
        &series,
        &inputs,
        RunOptions {
            verbose: cli.verbose,
            parallel: cli.parallel,
        },
    )
    .map_err(|e| e.to_string())?;
    for cohort in &report.cohorts {
        println!("{}", format_cohort_line(cohort));
    }
    println!("{}", format_summary(&report));
    Ok(())
}

pub fn format_summary(report: &BacktestReport) -> String {
    let tent = report
        .tent
        .map(|tent| {
            format!(
                "tent {},{}, ",
                (tent.start_equity_ratio * 100.0).round() as i64,
                tent.years as i64
            )
        })
        .unwrap_or_default();
    format!(
        "equity {:<3}%, bond {:<3}%, {}{:.0} years: success {:.1}% of the simulations (average ending balance {:.3})",
        report.equity_percent.round() as i64,
        report.bond_percent.round() as i64,
        tent,
        report.goal_years,
        report.success_rate * 100.0,
        report.mean_ending_balance
    )
}

pub fn format_trace_row(row: &PeriodTrace) -> String {
    format!(
        "{} / {:.3} / {:.3} {:.3} / {:.3} {:.3} / {:.4} {:.4} {:.4} {:.4} / {:.3} {:.3}",
        row.date,
        row.balance,
        0.0 - row.spending,
        0.0 - row.capital_gains_tax,
        row.equities,
        row.bonds,
        row.equity_return,
        row.equity_dividends,
        row.bond_income,
        row.net_expense,
        row.new_balance,
        row.cost_basis
    )
}

fn format_cohort_line(cohort: &CohortResult) -> String {
    let verdict = match cohort.verdict {
        Verdict::Success => "good",
        Verdict::Failure => "bad",
        Verdict::Incomplete => "incomplete",
    };
    match cohort.ending_balance {
        Some(balance) => format!("{} {verdict} {balance:.3}", cohort.start_date),
        None => format!("{} {verdict}", cohort.start_date),
    }
}

fn format_solve_result(result: &SpendingSolveResult) -> String {
    match (result.solved_spending, result.achieved_success_rate) {
        (Some(spending), Some(rate)) => format!(
            "max starting spending for {:.1}% success: {spending:.3} (achieved {:.1}%). {}",
            result.target_success_rate * 100.0,
            rate * 100.0,
            result.message
        ),
        _ => result.message.clone(),
    }
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let data_path = std::env::var(DATA_PATH_ENV).unwrap_or_else(|_| DEFAULT_DATA_PATH.to_string());
    let series = SeriesSet::load(&data_path).map_err(|e| std::io::Error::other(e.to_string()))?;
    log::info!("loaded market data from {data_path}");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route(
            "/api/backtest",
            get(backtest_get_handler).post(backtest_post_handler),
        )
        .fallback(not_found_handler)
        .with_state(Arc::new(series));

    let listener = TcpListener::bind(addr).await?;
    println!("Backtest HTTP API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/api/backtest");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn backtest_get_handler(
    State(series): State<Arc<SeriesSet>>,
    Query(payload): Query<BacktestPayload>,
) -> Response {
    backtest_handler_impl(&series, payload)
}

async fn backtest_post_handler(
    State(series): State<Arc<SeriesSet>>,
    Json(payload): Json<BacktestPayload>,
) -> Response {
    backtest_handler_impl(&series, payload)
}

fn backtest_handler_impl(series: &SeriesSet, payload: BacktestPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    match execute_request(series, &request) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &msg),
    }
}

fn execute_request(series: &SeriesSet, request: &ApiRequest) -> Result<BacktestResponse, String> {
    let inputs = &request.inputs;
    let data = series.select(inputs.period, request.options.skip_dividends);

    if let Some(year) = request.options.debug_year {
        let start_date = year_start(year).map_err(|e| format!("debugYear: {e}"))?;
        let (outcome, periods) =
            run_debug_cohort(data, inputs, start_date).map_err(|e| e.to_string())?;
        return Ok(BacktestResponse::Debug(DebugResponse {
            start_date,
            verdict: outcome.verdict,
            ending_balance: outcome.ending_balance_real,
            periods,
        }));
    }

    run_backtest(data, inputs, request.options.run)
        .map(BacktestResponse::Report)
        .map_err(|e| e.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<BacktestPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: BacktestPayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();
    let mut options = ApiOptions {
        run: RunOptions::default(),
        skip_dividends: false,
        debug_year: None,
    };

    if let Some(v) = payload.monthly {
        cli.monthly = v;
    }
    if let Some(v) = payload.equity_percent {
        cli.equity_percent = v;
    }
    match (payload.tent_start_percent, payload.tent_years) {
        (Some(start_percent), Some(years)) => {
            cli.tent = Some(TentArg {
                start_percent,
                years,
            });
        }
        (None, None) => {}
        _ => return Err("tentStartPercent and tentYears must be given together".to_string()),
    }
    match (payload.extra_spending_amount, payload.extra_spending_years) {
        (Some(amount), Some(years)) => {
            cli.extra_spending = Some(ExtraSpendingArg {
                amount,
                years,
                real: payload.extra_spending_real.unwrap_or(false),
            });
        }
        (None, None) => {}
        _ => {
            return Err(
                "extraSpendingAmount and extraSpendingYears must be given together".to_string(),
            );
        }
    }
    if let Some(v) = payload.expense_ratio {
        cli.expense_ratio = v;
    }
    if let Some(v) = payload.skip_dividends {
        cli.skip_dividends = v;
        options.skip_dividends = v;
    }
    if let Some(v) = payload.data_start {
        cli.data_start = v;
    }
    if let Some(v) = payload.data_end {
        cli.data_end = v;
    }
    if let Some(v) = payload.goal_years {
        cli.goal_years = v;
    }
    if let Some(v) = payload.start_annual_spending {
        cli.start_annual_spending = v;
    }
    if let Some(v) = payload.portfolio_size {
        cli.portfolio_size = v;
    }
    if let Some(v) = payload.withdrawal_order {
        cli.withdrawal_order = v.into();
    }
    if let Some(v) = payload.inflation_timing {
        cli.inflation_timing = v.into();
    }
    if let Some(v) = payload.bond_yield_timing {
        cli.bond_yield_timing = v.into();
    }
    if let Some(v) = payload.verbose {
        options.run.verbose = v;
    }
    if let Some(v) = payload.parallel {
        options.run.parallel = v;
    }
    options.debug_year = payload.debug_year;

    let inputs = build_inputs(&cli)?;
    Ok(ApiRequest { inputs, options })
}

fn default_cli_for_api() -> Cli {
    Cli {
        verbose: false,
        debug: None,
        monthly: false,
        equity_percent: 100.0,
        tent: None,
        extra_spending: None,
        expense_ratio: 0.1,
        data_start: MIN_DATA_START,
        data_end: DEFAULT_DATA_END,
        skip_dividends: false,
        data: DEFAULT_DATA_PATH.to_string(),
        withdrawal_order: CliWithdrawalOrder::TaxableOnly,
        accounts: Vec::new(),
        inflation_timing: CliInflationTiming::Next,
        bond_yield_timing: CliBondYieldTiming::Current,
        parallel: false,
        solve_success_rate: None,
        goal_years: 30.0,
        start_annual_spending: 40.0,
        portfolio_size: 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn jan1(year: i32) -> chrono::NaiveDate {
        year_start(year).expect("valid year")
    }

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_cli() -> Cli {
        default_cli_for_api()
    }

    /// Yearly rows 1871..1900 with steady growth and mild inflation.
    fn sample_csv() -> String {
        let mut csv = String::from("Date,SP500,Dividend,Earnings,CPI,Long Interest Rate\n");
        let mut index = 100.0;
        let mut cpi = 10.0;
        for year in 1871..1901 {
            csv.push_str(&format!("{year}-01,{index:.4},3,6,{cpi:.4},4\n"));
            index *= if year % 4 == 0 { 0.85 } else { 1.07 };
            cpi *= 1.02;
        }
        csv
    }

    fn sample_series_set() -> SeriesSet {
        let csv = sample_csv();
        SeriesSet::build(|options| TimeSeries::from_reader(csv.as_bytes(), options))
            .expect("valid csv")
    }

    #[test]
    fn cli_parses_every_option() {
        let cli = Cli::try_parse_from([
            "cohort-backtest",
            "--monthly",
            "--equity-percent",
            "60",
            "--tent",
            "30,10",
            "--extra-spending",
            "20,5,real",
            "--expense-ratio",
            "0.05",
            "--data-start",
            "1900",
            "--data-end",
            "2000",
            "--skip-dividends",
            "--account",
            "roth=150",
            "--withdrawal-order",
            "pro-rata",
            "-v",
            "30",
            "40",
            "1000",
        ])
        .expect("valid command line");

        assert!(cli.monthly && cli.skip_dividends && cli.verbose);
        assert_eq!(
            cli.tent,
            Some(TentArg {
                start_percent: 30.0,
                years: 10.0
            })
        );
        assert_eq!(
            cli.extra_spending,
            Some(ExtraSpendingArg {
                amount: 20.0,
                years: 5.0,
                real: true
            })
        );
        assert_eq!(cli.accounts.len(), 1);

        let inputs = build_inputs(&cli).expect("valid inputs");
        assert_eq!(inputs.period, PeriodStep::Monthly);
        assert_approx(inputs.allocation.steady_state_equity_ratio, 0.6);
        let tent = inputs.allocation.tent.expect("tent");
        assert_approx(tent.start_equity_ratio, 0.3);
        assert_approx(tent.years, 10.0);
        assert_approx(inputs.expense_ratio, 0.0005);
        assert_approx(inputs.portfolio.total_balance(), 1150.0);
        assert_eq!(inputs.withdrawal_order, WithdrawalOrder::ProRata);
        assert!(inputs.spending.extra.expect("extra").index_to_inflation);
    }

    #[test]
    fn defaults_fill_optional_flags() {
        let cli = Cli::try_parse_from(["cohort-backtest", "30", "40", "1000"]).expect("valid");
        assert_approx(cli.equity_percent, 100.0);
        assert_approx(cli.expense_ratio, 0.1);
        assert_eq!(cli.data_start, 1871);
        assert_eq!(cli.data_end, 2016);
        assert_eq!(cli.data, "shiller.csv");
        let inputs = build_inputs(&cli).expect("valid inputs");
        assert_eq!(inputs.inflation_timing, InflationTiming::NextPeriod);
        assert_eq!(inputs.bond_yield_timing, BondYieldTiming::CurrentPeriod);
        assert_eq!(inputs.withdrawal_order, WithdrawalOrder::TaxableOnly);
    }

    #[test]
    fn extra_spending_defaults_to_nominal() {
        let extra = parse_extra_spending("10,3").expect("valid");
        assert!(!extra.real);
        assert!(parse_extra_spending("10").is_err());
        assert!(parse_extra_spending("10,3,sometimes").is_err());
        assert!(parse_tent("30").is_err());
        assert!(parse_account("=10").is_err());
        assert!(parse_account("roth=lots").is_err());
    }

    #[test]
    fn build_inputs_rejects_data_window_outside_bounds() {
        let mut cli = sample_cli();
        cli.data_start = 1850;
        let err = build_inputs(&cli).expect_err("too early");
        assert!(err.contains("--data-start"));

        let mut cli = sample_cli();
        cli.data_end = 2030;
        let err = build_inputs(&cli).expect_err("too late");
        assert!(err.contains("--data-end"));

        let mut cli = sample_cli();
        cli.data_start = 1950;
        cli.data_end = 1950;
        assert!(build_inputs(&cli).is_err());
    }

    #[test]
    fn build_inputs_rejects_bad_percentages() {
        let mut cli = sample_cli();
        cli.equity_percent = 120.0;
        let err = build_inputs(&cli).expect_err("bad equity");
        assert!(err.contains("--equity-percent"));

        let mut cli = sample_cli();
        cli.tent = Some(TentArg {
            start_percent: 30.0,
            years: 0.0,
        });
        let err = build_inputs(&cli).expect_err("bad tent");
        assert!(err.contains("--tent"));
    }

    #[test]
    fn build_inputs_rejects_duplicate_or_taxable_accounts() {
        let mut cli = sample_cli();
        cli.accounts = vec![AccountArg {
            name: "taxable".to_string(),
            balance: 1.0,
        }];
        assert!(build_inputs(&cli).is_err());

        let roth = AccountArg {
            name: "roth".to_string(),
            balance: 1.0,
        };
        cli.accounts = vec![roth.clone(), roth];
        let err = build_inputs(&cli).expect_err("duplicate");
        assert!(err.contains("more than once"));
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let json = r#"{
          "monthly": true,
          "equityPercent": 75,
          "tentStartPercent": 40,
          "tentYears": 8,
          "extraSpendingAmount": 12,
          "extraSpendingYears": 4,
          "extraSpendingReal": true,
          "expenseRatio": 0.2,
          "skipDividends": true,
          "dataStart": 1900,
          "dataEnd": 1990,
          "goalYears": 25,
          "startAnnualSpending": 35,
          "portfolioSize": 900,
          "withdrawalOrder": "pro-rata",
          "inflationTiming": "current",
          "bondYieldTiming": "nextPeriod",
          "parallel": true,
          "debugYear": 1929
        }"#;
        let request = api_request_from_json(json).expect("json should parse");
        let inputs = request.inputs;

        assert_eq!(inputs.period, PeriodStep::Monthly);
        assert_approx(inputs.allocation.steady_state_equity_ratio, 0.75);
        assert_approx(inputs.allocation.tent.expect("tent").start_equity_ratio, 0.4);
        assert_approx(inputs.expense_ratio, 0.002);
        assert_eq!(inputs.data_start_year, 1900);
        assert_eq!(inputs.data_end_year, 1990);
        assert_approx(inputs.goal_years, 25.0);
        assert_approx(inputs.spending.base_spending, 35.0);
        assert_approx(inputs.portfolio.total_balance(), 900.0);
        assert_eq!(inputs.withdrawal_order, WithdrawalOrder::ProRata);
        assert_eq!(inputs.inflation_timing, InflationTiming::CurrentPeriod);
        assert_eq!(inputs.bond_yield_timing, BondYieldTiming::NextPeriod);
        assert!(request.options.skip_dividends);
        assert!(request.options.run.parallel);
        assert!(!request.options.run.verbose);
        assert_eq!(request.options.debug_year, Some(1929));
    }

    #[test]
    fn api_request_requires_paired_tent_fields() {
        let err = api_request_from_json(r#"{ "tentYears": 10 }"#).expect_err("half a tent");
        assert!(err.contains("tentStartPercent"));
    }

    #[test]
    fn summary_line_format() {
        let report = BacktestReport {
            period: PeriodStep::Yearly,
            equity_percent: 100.0,
            bond_percent: 0.0,
            tent: Some(Tent {
                start_equity_ratio: 0.3,
                years: 10.0,
            }),
            goal_years: 30.0,
            success_count: 19,
            total_count: 20,
            success_rate: 0.95,
            mean_ending_balance: 1234.5678,
            cohorts: Vec::new(),
        };
        assert_eq!(
            format_summary(&report),
            "equity 100%, bond 0  %, tent 30,10, 30 years: success 95.0% of the simulations (average ending balance 1234.568)"
        );
    }

    #[test]
    fn trace_row_shows_outflows_as_negative() {
        let row = PeriodTrace {
            date: jan1(1929),
            balance: 1000.0,
            spending: 40.0,
            capital_gains_tax: 0.0,
            equities: 960.0,
            bonds: 0.0,
            equity_return: -96.0,
            equity_dividends: 19.2,
            bond_income: 0.0,
            net_expense: -0.864,
            new_balance: 882.336,
            cost_basis: 980.064,
        };
        assert_eq!(
            format_trace_row(&row),
            "1929-01-01 / 1000.000 / -40.000 0.000 / 960.000 0.000 / -96.0000 19.2000 0.0000 -0.8640 / 882.336 980.064"
        );
    }

    #[test]
    fn cohort_lines_use_good_and_bad() {
        let good = CohortResult {
            start_date: jan1(1871),
            verdict: Verdict::Success,
            ending_balance: Some(12.0),
        };
        assert_eq!(format_cohort_line(&good), "1871-01-01 good 12.000");
        let bad = CohortResult {
            verdict: Verdict::Failure,
            ..good
        };
        assert_eq!(format_cohort_line(&bad), "1871-01-01 bad 12.000");
    }

    #[test]
    fn execute_request_runs_backtest_on_loaded_data() {
        let series = sample_series_set();
        let json = r#"{
          "goalYears": 10,
          "startAnnualSpending": 40,
          "portfolioSize": 1000,
          "dataEnd": 1950,
          "verbose": true
        }"#;
        let request = api_request_from_json(json).expect("valid request");
        let response = execute_request(&series, &request).expect("runs");

        let BacktestResponse::Report(report) = &response else {
            panic!("expected a report");
        };
        // 1871..1890 each finish ten years before 1900
        assert_eq!(report.total_count, 20);
        assert_eq!(report.cohorts.len(), 20);
        assert!(report.success_rate > 0.0);

        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"successRate\""));
        assert!(json.contains("\"meanEndingBalance\""));
        assert!(json.contains("\"cohorts\""));
        assert!(json.contains("\"startDate\":\"1871-01-01\""));
    }

    #[test]
    fn execute_request_traces_debug_year() {
        let series = sample_series_set();
        let request = api_request_from_json(
            r#"{ "goalYears": 3, "startAnnualSpending": 40, "debugYear": 1880, "dataEnd": 1950 }"#,
        )
        .expect("valid request");
        let response = execute_request(&series, &request).expect("runs");

        let BacktestResponse::Debug(debug) = &response else {
            panic!("expected a trace");
        };
        assert_eq!(debug.start_date, jan1(1880));
        assert_eq!(debug.periods.len(), 3);
        assert_eq!(debug.verdict, Verdict::Success);
        assert_approx(debug.periods[0].balance, 1000.0);

        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"periods\""));
        assert!(json.contains("\"netExpense\""));
    }

    #[test]
    fn execute_request_reports_missing_debug_start() {
        let series = sample_series_set();
        let request = api_request_from_json(r#"{ "debugYear": 1960, "dataEnd": 1990 }"#)
            .expect("valid request");
        let err = execute_request(&series, &request).expect_err("no such year");
        assert!(err.contains("1960"));
    }

    #[test]
    fn execute_request_names_unrepresentable_debug_year() {
        let series = sample_series_set();
        let request = api_request_from_json(r#"{ "debugYear": 2000000000, "dataEnd": 1990 }"#)
            .expect("valid request");
        let err = execute_request(&series, &request).expect_err("year out of range");
        assert!(err.contains("debugYear"));
        assert!(err.contains("2000000000"));
    }
}
