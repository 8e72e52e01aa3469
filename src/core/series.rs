//! Historical market data, keyed by period start date.
//!
//! Rows are read once into an immutable [`TimeSeries`]. A forward pass then
//! links every record to its successor one step later; the first record that
//! cannot be linked ends the usable part of the series.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{Months, NaiveDate};
use log::debug;

use super::error::LoadError;
use super::types::{Forward, PeriodRecord, PeriodStep};

const COLUMN_COUNT: usize = 6;

#[derive(Copy, Clone, Debug)]
pub struct LoadOptions {
    pub step: PeriodStep,
    /// Treat every dividend as zero.
    pub skip_dividends: bool,
}

#[derive(Clone, Debug)]
pub struct TimeSeries {
    step: PeriodStep,
    records: BTreeMap<NaiveDate, PeriodRecord>,
    usable_end: NaiveDate,
}

impl TimeSeries {
    pub fn load_csv(path: impl AsRef<Path>, options: LoadOptions) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(file, options)
    }

    /// Reads `date, index, dividend, earnings, cpi, bond_yield_percent` rows
    /// after a header line. Dividends are annual per-share amounts and bond
    /// yields annual percentages; both become per-period rates here.
    pub fn from_reader<R: Read>(reader: R, options: LoadOptions) -> Result<Self, LoadError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut records = Vec::new();
        let mut previous: Option<NaiveDate> = None;
        let mut skipped = 0_usize;

        for row in csv_reader.records() {
            let row = row?;
            let line = row.position().map(|p| p.line() as usize).unwrap_or(0);
            if row.iter().all(str::is_empty) {
                continue;
            }
            if row.len() < COLUMN_COUNT {
                return Err(LoadError::MissingColumns {
                    line,
                    expected: COLUMN_COUNT,
                    found: row.len(),
                });
            }

            let date = parse_date(&row[0], line)?;
            if let Some(prev) = previous {
                if date <= prev {
                    return Err(LoadError::OutOfOrder {
                        line,
                        date,
                        previous: prev,
                    });
                }
            }
            previous = Some(date);

            let index_level = parse_optional("index level", &row[1], line)?;
            let dividend = parse_optional("dividend", &row[2], line)?;
            parse_optional("earnings", &row[3], line)?;
            let cpi = parse_optional("cpi", &row[4], line)?;
            let bond_yield_percent = parse_optional("bond yield", &row[5], line)?;

            let (Some(index_level), Some(cpi)) = (index_level, cpi) else {
                debug!("line {line}: no index level or CPI for {date}, row skipped");
                skipped += 1;
                continue;
            };
            ensure_positive("index level", index_level, line)?;
            ensure_positive("cpi", cpi, line)?;

            let dividend_yield = if options.skip_dividends {
                Some(0.0)
            } else {
                dividend.map(|amount| options.step.compound_annual_rate(amount / index_level))
            };
            let bond_yield =
                bond_yield_percent.map(|pct| options.step.compound_annual_rate(pct / 100.0));

            records.push(PeriodRecord {
                date,
                index_level,
                dividend_yield,
                bond_yield,
                cpi,
                forward: None,
            });
        }

        debug!(
            "read {} market rows ({} skipped without index level or CPI)",
            records.len(),
            skipped
        );
        Self::from_records(options.step, records)
    }

    /// Builds a series from records whose yields are already per-period
    /// rates. Any `forward` field on the input is recomputed.
    pub fn from_records(step: PeriodStep, records: Vec<PeriodRecord>) -> Result<Self, LoadError> {
        let mut by_date = BTreeMap::new();
        let mut previous: Option<NaiveDate> = None;
        for (position, mut record) in records.into_iter().enumerate() {
            if let Some(prev) = previous {
                if record.date <= prev {
                    return Err(LoadError::OutOfOrder {
                        line: position + 1,
                        date: record.date,
                        previous: prev,
                    });
                }
            }
            previous = Some(record.date);
            ensure_positive("index level", record.index_level, position + 1)?;
            ensure_positive("cpi", record.cpi, position + 1)?;
            record.forward = None;
            by_date.insert(record.date, record);
        }

        let usable_end = link_forward(step, &mut by_date).ok_or(LoadError::Empty)?;
        debug!(
            "{} records, usable through {} ({:?} steps)",
            by_date.len(),
            usable_end,
            step
        );

        Ok(Self {
            step,
            records: by_date,
            usable_end,
        })
    }

    pub fn step(&self) -> PeriodStep {
        self.step
    }

    pub fn get(&self, date: NaiveDate) -> Option<&PeriodRecord> {
        self.records.get(&date)
    }

    /// The first record without forward data. No simulation can step out of
    /// this date or anything after it.
    pub fn usable_end(&self) -> NaiveDate {
        self.usable_end
    }

    pub fn first_on_or_after(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.records.range(date..).next().map(|(key, _)| *key)
    }

    pub fn next_date(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.get(date)
            .and_then(|record| record.forward)
            .map(|forward| forward.next_date)
    }
}

/// Fills `forward` for every record up to the first one that cannot be
/// linked and returns that record's date. Records after it stay unlinked
/// even when they have successors.
fn link_forward(
    step: PeriodStep,
    records: &mut BTreeMap<NaiveDate, PeriodRecord>,
) -> Option<NaiveDate> {
    let dates: Vec<NaiveDate> = records.keys().copied().collect();
    for date in dates {
        let forward = records
            .get(&date)
            .and_then(|record| forward_fields(step, record, records));
        match (forward, records.get_mut(&date)) {
            (Some(forward), Some(record)) => record.forward = Some(forward),
            _ => return Some(date),
        }
    }
    None
}

fn forward_fields(
    step: PeriodStep,
    record: &PeriodRecord,
    records: &BTreeMap<NaiveDate, PeriodRecord>,
) -> Option<Forward> {
    record.dividend_yield?;
    record.bond_yield?;
    let next_date = record.date.checked_add_months(Months::new(step.months()))?;
    let next = records.get(&next_date)?;
    Some(Forward {
        next_date,
        index_growth: next.index_level / record.index_level - 1.0,
        next_cpi: next.cpi,
        next_bond_yield: next.bond_yield,
    })
}

fn parse_date(value: &str, line: usize) -> Result<NaiveDate, LoadError> {
    let invalid = || LoadError::InvalidDate {
        line,
        value: value.to_string(),
    };
    if value.len() == 4 {
        let year = value.parse::<i32>().map_err(|_| invalid())?;
        return NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid);
    }
    NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d").map_err(|_| invalid())
}

fn parse_optional(field: &'static str, value: &str, line: usize) -> Result<Option<f64>, LoadError> {
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(Some(parsed)),
        _ => Err(LoadError::InvalidNumber {
            line,
            field,
            value: value.to_string(),
        }),
    }
}

fn ensure_positive(field: &'static str, value: f64, line: usize) -> Result<(), LoadError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(LoadError::NonPositive { line, field, value })
    }
}
