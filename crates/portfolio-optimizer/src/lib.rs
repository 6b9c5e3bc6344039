//! Constrained portfolio construction.
//!
//! Expected returns and covariance come from assumptions or history, may be
//! blended with investor views (Black-Litterman), and feed a dense
//! active-set QP with box, budget, sector, target-return and CVaR
//! constraints. Resampled (Michaud) optimisation and the efficient frontier
//! run their independent solves in parallel with rayon.

pub mod black_litterman;
pub mod covariance;
pub mod cvar;
pub mod diagnostics;
pub mod frontier;
pub mod mean_variance;
pub mod models;
pub mod optimizer;
pub mod qp;
pub mod resampling;

pub use frontier::DEFAULT_POINTS as DEFAULT_FRONTIER_POINTS;
pub use models::*;
pub use optimizer::PortfolioOptimizer;
