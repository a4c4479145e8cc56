// =============================================================================
// Black-Scholes pricing, greeks, and implied volatility
// =============================================================================
//
// European options on an index. Time to expiry uses an actual/365 day count
// throughout. Vega is reported per 1 percentage point of volatility and rho
// per 1 percentage point of rate; theta is per calendar day.
// =============================================================================

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

use crate::types::{Greeks, OptionType};

/// Solver outcome for one option.
#[derive(Debug, Clone, Copy)]
pub struct IvSolution {
    pub iv: f64,
    pub iterations: u32,
}

/// Why a solve produced no IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvFailure {
    /// Inputs outside the model's domain (non-positive price, strike, or
    /// time to expiry).
    BadInputs,
    /// The iteration left [iv_min, iv_max] or vega vanished.
    OutOfBounds,
    /// No convergence within the iteration budget.
    MaxIterations,
}

fn d1_d2(spot: f64, strike: f64, t_years: f64, rate: f64, vol: f64) -> (f64, f64) {
    let denom = vol * t_years.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * vol * vol) * t_years) / denom;
    (d1, d1 - denom)
}

/// Theoretical price of a European option. Degenerate inputs (t or vol at or
/// below zero) collapse to discounted intrinsic value.
pub fn bs_price(
    option_type: OptionType,
    spot: f64,
    strike: f64,
    t_years: f64,
    rate: f64,
    vol: f64,
) -> f64 {
    if spot <= 0.0 || strike <= 0.0 {
        return 0.0;
    }
    if t_years <= 0.0 || vol <= 0.0 {
        return match option_type {
            OptionType::Call => (spot - strike).max(0.0),
            OptionType::Put => (strike - spot).max(0.0),
        };
    }

    let n = Normal::new(0.0, 1.0).expect("standard normal");
    let (d1, d2) = d1_d2(spot, strike, t_years, rate, vol);
    let df = (-rate * t_years).exp();

    match option_type {
        OptionType::Call => spot * n.cdf(d1) - strike * df * n.cdf(d2),
        OptionType::Put => strike * df * n.cdf(-d2) - spot * n.cdf(-d1),
    }
}

/// Full greeks vector. Returns None when inputs leave the model's domain or
/// any output is non-finite.
pub fn bs_greeks(
    option_type: OptionType,
    spot: f64,
    strike: f64,
    t_years: f64,
    rate: f64,
    vol: f64,
) -> Option<Greeks> {
    if spot <= 0.0 || strike <= 0.0 || t_years <= 0.0 || vol <= 0.0 {
        return None;
    }

    let n = Normal::new(0.0, 1.0).ok()?;
    let (d1, d2) = d1_d2(spot, strike, t_years, rate, vol);
    let df = (-rate * t_years).exp();
    let pdf_d1 = n.pdf(d1);
    let sqrt_t = t_years.sqrt();

    let delta = match option_type {
        OptionType::Call => n.cdf(d1),
        OptionType::Put => n.cdf(d1) - 1.0,
    };
    let gamma = pdf_d1 / (spot * vol * sqrt_t);

    // Annualised theta, then per calendar day.
    let theta_common = -(spot * pdf_d1 * vol) / (2.0 * sqrt_t);
    let theta_annual = match option_type {
        OptionType::Call => theta_common - rate * strike * df * n.cdf(d2),
        OptionType::Put => theta_common + rate * strike * df * n.cdf(-d2),
    };
    let theta = theta_annual / 365.0;

    // Vega per 1 percentage point of vol, rho per 1 percentage point of rate.
    let vega = spot * pdf_d1 * sqrt_t / 100.0;
    let rho_raw = match option_type {
        OptionType::Call => strike * t_years * df * n.cdf(d2),
        OptionType::Put => -strike * t_years * df * n.cdf(-d2),
    };
    let rho = rho_raw / 100.0;

    let greeks = Greeks {
        delta,
        gamma,
        theta,
        vega,
        rho,
    };
    let finite = [delta, gamma, theta, vega, rho].iter().all(|v| v.is_finite());
    finite.then_some(greeks)
}

/// Newton-Raphson implied volatility.
///
/// Starts from the Brenner-Subrahmanyam approximation and iterates until the
/// model price is within `precision` of `target_price`, the budget runs out,
/// or the iterate escapes [iv_min, iv_max].
pub fn implied_vol(
    option_type: OptionType,
    spot: f64,
    strike: f64,
    t_years: f64,
    rate: f64,
    target_price: f64,
    iv_min: f64,
    iv_max: f64,
    max_iterations: u32,
    precision: f64,
) -> Result<IvSolution, IvFailure> {
    if spot <= 0.0 || strike <= 0.0 || t_years <= 0.0 || target_price <= 0.0 {
        return Err(IvFailure::BadInputs);
    }

    // Intrinsic floor: a quote below intrinsic value has no implied vol.
    let df = (-rate * t_years).exp();
    let intrinsic = match option_type {
        OptionType::Call => (spot - strike * df).max(0.0),
        OptionType::Put => (strike * df - spot).max(0.0),
    };
    if target_price < intrinsic {
        return Err(IvFailure::BadInputs);
    }

    let mut sigma = ((2.0 * std::f64::consts::PI / t_years).sqrt() * target_price / spot)
        .clamp(iv_min.max(1e-4), iv_max);

    for iteration in 1..=max_iterations {
        let price = bs_price(option_type, spot, strike, t_years, rate, sigma);
        let diff = price - target_price;
        if diff.abs() < precision {
            return Ok(IvSolution {
                iv: sigma,
                iterations: iteration,
            });
        }

        // Raw vega (per unit vol) as the Newton derivative.
        let n = Normal::new(0.0, 1.0).expect("standard normal");
        let (d1, _) = d1_d2(spot, strike, t_years, rate, sigma);
        let vega_raw = spot * n.pdf(d1) * t_years.sqrt();
        if vega_raw < 1e-10 {
            return Err(IvFailure::OutOfBounds);
        }

        sigma -= diff / vega_raw;
        if sigma < iv_min || sigma > iv_max || !sigma.is_finite() {
            return Err(IvFailure::OutOfBounds);
        }
    }
    Err(IvFailure::MaxIterations)
}
