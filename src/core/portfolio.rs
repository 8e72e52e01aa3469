use std::ops::AddAssign;

use super::error::ConfigError;
use super::policy::withdrawal_shares;
use super::types::{Portfolio, PortfolioAccount, WithdrawalOrder};

/// Market rates that apply to one period, already resolved for the
/// configured bond-yield timing.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PeriodMarket {
    pub index_growth: f64,
    pub dividend_yield: f64,
    pub bond_yield: f64,
}

/// Breakdown of one period's return. Summed across accounts for tracing.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PeriodReturn {
    pub equities: f64,
    pub bonds: f64,
    pub equity_return: f64,
    pub equity_dividends: f64,
    pub bond_income: f64,
    pub net_expense: f64,
}

impl AddAssign for PeriodReturn {
    fn add_assign(&mut self, other: Self) {
        self.equities += other.equities;
        self.bonds += other.bonds;
        self.equity_return += other.equity_return;
        self.equity_dividends += other.equity_dividends;
        self.bond_income += other.bond_income;
        self.net_expense += other.net_expense;
    }
}

/// Tax owed on realizing `amount` from `account`. Always zero for now;
/// callers already add whatever this returns to the amount withdrawn.
pub fn capital_gains_tax(_account: &PortfolioAccount, _amount: f64) -> f64 {
    0.0
}

impl PortfolioAccount {
    /// Draws `amount` plus any capital-gains tax and returns the tax.
    ///
    /// Cost basis shrinks by the same fraction of the balance that leaves
    /// the account (average-cost method). An account that is already
    /// empty keeps its basis untouched.
    pub fn withdraw(&mut self, amount: f64) -> f64 {
        let tax = capital_gains_tax(self, amount);
        let gross = amount + tax;
        if self.balance > 0.0 {
            // goes negative only when the withdrawal overdraws the account
            self.cost_basis -= self.cost_basis * gross / self.balance;
        }
        self.balance -= gross;
        tax
    }

    /// Grows the account by one period. The expense ratio is charged on
    /// balance, price return and bond income, but not on dividends.
    /// Reinvested income net of expenses is added to the cost basis.
    pub fn apply_period_return(
        &mut self,
        market: PeriodMarket,
        equity_ratio: f64,
        expense_ratio: f64,
    ) -> PeriodReturn {
        let balance = self.balance;
        let equities = equity_ratio * balance;
        let bonds = balance - equities;

        let equity_return = equities * market.index_growth;
        let equity_dividends = equities * market.dividend_yield;
        let bond_income = bonds * market.bond_yield;
        let net_expense = -(balance + equity_return + bond_income) * expense_ratio;

        self.balance = balance + equity_return + equity_dividends + bond_income + net_expense;
        self.cost_basis += equity_dividends + bond_income - net_expense;

        PeriodReturn {
            equities,
            bonds,
            equity_return,
            equity_dividends,
            bond_income,
            net_expense,
        }
    }
}

impl Portfolio {
    /// Splits `amount` across accounts per `order` and withdraws it.
    /// Returns the total capital-gains tax charged.
    pub fn withdraw(&mut self, order: WithdrawalOrder, amount: f64) -> Result<f64, ConfigError> {
        let mut tax = 0.0;
        for (name, share) in withdrawal_shares(order, self, amount) {
            let account = self
                .accounts
                .get_mut(&name)
                .ok_or(ConfigError::MissingAccount { name })?;
            tax += account.withdraw(share);
        }
        Ok(tax)
    }

    pub fn apply_period_return(
        &mut self,
        market: PeriodMarket,
        equity_ratio: f64,
        expense_ratio: f64,
    ) -> PeriodReturn {
        let mut total = PeriodReturn::default();
        for account in self.accounts.values_mut() {
            total += account.apply_period_return(market, equity_ratio, expense_ratio);
        }
        total
    }

    pub fn total_cost_basis(&self) -> f64 {
        self.accounts.values().map(|account| account.cost_basis).sum()
    }
}
