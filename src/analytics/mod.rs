use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::PredictionRecord;

/// Hourly bars per year, used to annualize the Sharpe ratio
pub const PERIODS_PER_YEAR: f64 = 365.0 * 24.0;

/// Result of trading every prediction for one bar: long when the model
/// expects the next close above the current one, short when below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingMetrics {
    pub starting_value: f64,
    pub final_value: f64,
    pub net_pnl: f64,
    pub net_pnl_pct: f64,
    pub total_trades: usize,
    pub profitable_trades: usize,
    pub win_rate: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    /// Trades per evaluated bar, in percent
    pub trading_frequency: f64,
}

/// Bar-by-bar evaluation of backtest predictions
pub struct TradingEvaluator {
    starting_cash: f64,
    /// Percent of traded value, charged on entry and exit
    commission_rate: f64,
}

impl TradingEvaluator {
    pub fn new(starting_cash: f64, commission_rate: f64) -> Self {
        Self {
            starting_cash,
            commission_rate,
        }
    }

    /// `closes[i]` and `next_closes[i]` belong to dataset row `i`. Records
    /// pointing outside those slices are ignored.
    pub fn evaluate(
        &self,
        records: &[PredictionRecord],
        closes: &[f64],
        next_closes: &[f64],
    ) -> TradingMetrics {
        let round_trip_cost = 2.0 * self.commission_rate / 100.0;
        let mut equity = self.starting_cash;
        let mut peak = self.starting_cash;
        let mut max_drawdown_pct: f64 = 0.0;
        let mut returns = Vec::with_capacity(records.len());
        let mut total_trades = 0;
        let mut profitable_trades = 0;

        for record in records {
            let index = record.timestamp_index;
            let (Some(&close), Some(&next)) = (closes.get(index), next_closes.get(index)) else {
                continue;
            };
            if !(close > 0.0) || !next.is_finite() || !record.prediction.is_finite() {
                continue;
            }

            let direction = signum(record.prediction - close);
            let bar_return = if direction == 0.0 {
                0.0
            } else {
                total_trades += 1;
                let gross = direction * (next - close) / close;
                let net = gross - round_trip_cost;
                if net > 0.0 {
                    profitable_trades += 1;
                }
                net
            };

            equity *= 1.0 + bar_return;
            returns.push(bar_return);

            if equity > peak {
                peak = equity;
            } else if peak > 0.0 {
                max_drawdown_pct = max_drawdown_pct.max((peak - equity) / peak * 100.0);
            }
        }

        let net_pnl = equity - self.starting_cash;
        TradingMetrics {
            starting_value: self.starting_cash,
            final_value: equity,
            net_pnl,
            net_pnl_pct: percent(net_pnl, self.starting_cash),
            total_trades,
            profitable_trades,
            win_rate: percent(profitable_trades as f64, total_trades as f64),
            max_drawdown_pct,
            sharpe_ratio: sharpe_ratio(&returns),
            trading_frequency: percent(total_trades as f64, returns.len() as f64),
        }
    }
}

impl TradingMetrics {
    pub fn log_summary(&self) {
        info!("━━━ Trading summary ━━━");
        info!("  Starting value:    {:.2}", self.starting_value);
        info!("  Final value:       {:.2}", self.final_value);
        info!("  Net P&L:           {:.2} ({:.2}%)", self.net_pnl, self.net_pnl_pct);
        info!("  Trades:            {}", self.total_trades);
        info!("  Profitable trades: {}", self.profitable_trades);
        info!("  Win rate:          {:.2}%", self.win_rate);
        info!("  Max drawdown:      {:.2}%", self.max_drawdown_pct);
        info!("  Sharpe ratio:      {:.3}", self.sharpe_ratio);
        info!("  Trading frequency: {:.2}%", self.trading_frequency);
    }
}

/// Annualized mean-over-deviation of per-bar returns, using the population
/// deviation. Zero when there are fewer than two returns or no measurable
/// variation.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if !(std_dev > 1e-12) {
        return 0.0;
    }
    mean / std_dev * PERIODS_PER_YEAR.sqrt()
}

fn signum(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}
