pub mod black_scholes;

pub use black_scholes::{bs_greeks, bs_price, implied_vol, IvFailure, IvSolution};
