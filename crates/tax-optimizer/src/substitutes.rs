//! Substitute Security Finder
//!
//! Finds replacement securities for tax-loss harvesting that keep similar
//! market exposure without being substantially identical to the one sold.
//! Candidates come from the caller's universe, measured on their return
//! series, and from a reference table of well-known fund pairs.

use std::collections::{HashMap, HashSet};

use planner_core::validation::{ensure_non_negative, ensure_positive, ensure_probability};
use planner_core::{AssetClass, PlannerError, PlannerResult};
use serde::{Deserialize, Serialize};
use stats_kernel::{correlation, tracking_error};

/// Type of substitute security
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstituteType {
    /// Fund tracking a different index over the same market
    IndexFund,
    /// Sector fund overlapping the original's holdings
    SectorEtf,
    /// Bond fund with matching duration and credit profile
    FixedIncome,
    /// Found in the caller's universe by return similarity
    Measured,
}

impl std::fmt::Display for SubstituteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubstituteType::IndexFund => write!(f, "Index Fund"),
            SubstituteType::SectorEtf => write!(f, "Sector ETF"),
            SubstituteType::FixedIncome => write!(f, "Fixed Income"),
            SubstituteType::Measured => write!(f, "Measured"),
        }
    }
}

/// A security the caller can trade, with its periodic return history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub asset_class: AssetClass,
    /// Index the fund tracks; two funds on the same index are substantially identical
    #[serde(default)]
    pub tracked_index: Option<String>,
    /// Periodic returns, oldest first
    #[serde(default)]
    pub returns: Vec<f64>,
}

impl Security {
    pub fn new(symbol: impl Into<String>, returns: Vec<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
            asset_class: AssetClass::default(),
            tracked_index: None,
            returns,
        }
    }

    pub fn tracking(mut self, index: impl Into<String>) -> Self {
        self.tracked_index = Some(index.into());
        self
    }
}

/// A potential substitute security
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstituteSecurity {
    /// Symbol
    pub symbol: String,
    /// Type of substitute
    pub substitute_type: SubstituteType,
    /// Pearson correlation with the original
    pub correlation: f64,
    /// Annualised tracking error against the original
    pub tracking_error: f64,
    /// Reason for recommendation
    pub reason: String,
}

/// Configuration for substitute finding
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstituteConfig {
    /// Minimum correlation to consider
    pub min_correlation: f64,
    /// Maximum annualised tracking error to consider
    pub max_tracking_error: f64,
    /// Number of substitutes to return
    pub max_substitutes: usize,
    /// Periods per year of the universe's return series
    pub periods_per_year: f64,
}

impl Default for SubstituteConfig {
    fn default() -> Self {
        Self {
            min_correlation: 0.95,
            max_tracking_error: 0.05,
            max_substitutes: 3,
            periods_per_year: 12.0,
        }
    }
}

impl SubstituteConfig {
    pub fn validate(&self) -> PlannerResult<()> {
        ensure_probability(self.min_correlation, "config.substitutes.min_correlation")?;
        ensure_non_negative(self.max_tracking_error, "config.substitutes.max_tracking_error")?;
        ensure_positive(self.periods_per_year, "config.substitutes.periods_per_year")?;
        if self.max_substitutes == 0 {
            return Err(PlannerError::validation(
                "config.substitutes.max_substitutes",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

/// Engine for finding substitute securities
#[derive(Debug, Clone, Default)]
pub struct SubstituteFinder {
    config: SubstituteConfig,
    /// Pre-defined substitutes database
    substitutes_db: SubstitutesDatabase,
}

impl SubstituteFinder {
    pub fn new(config: SubstituteConfig) -> Self {
        Self {
            config,
            substitutes_db: SubstitutesDatabase::default(),
        }
    }

    pub fn config(&self) -> &SubstituteConfig {
        &self.config
    }

    /// Ranked substitutes for `symbol`: correlation descending, then
    /// tracking error ascending. Never returns a substantially identical
    /// security.
    pub fn find_substitutes(&self, symbol: &str, universe: &[Security]) -> Vec<SubstituteSecurity> {
        let original = universe.iter().find(|s| s.symbol == symbol);
        let mut seen: HashSet<&str> = HashSet::new();
        let mut substitutes = Vec::new();

        for candidate in universe {
            if self.is_substantially_identical(symbol, &candidate.symbol, universe)
                || !seen.insert(candidate.symbol.as_str())
            {
                continue;
            }
            let measured = original.and_then(|o| self.measure(&o.returns, &candidate.returns));
            let found = match measured {
                Some((correlation, tracking_error)) => Some(SubstituteSecurity {
                    symbol: candidate.symbol.clone(),
                    substitute_type: SubstituteType::Measured,
                    correlation,
                    tracking_error,
                    reason: format!(
                        "{:.2} correlation with {symbol} over the supplied history",
                        correlation
                    ),
                }),
                None => self.reference_entry(symbol, &candidate.symbol),
            };
            substitutes.extend(found);
        }

        for sibling in self.substitutes_db.siblings(symbol) {
            for pair in self.substitutes_db.pairs_for(&sibling) {
                let other = pair.other(&sibling);
                if self.is_substantially_identical(symbol, other, universe) || !seen.insert(other) {
                    continue;
                }
                substitutes.push(pair.to_substitute(other));
            }
        }

        substitutes.retain(|s| {
            s.correlation >= self.config.min_correlation
                && s.tracking_error <= self.config.max_tracking_error
        });

        substitutes.sort_by(|a, b| {
            b.correlation
                .partial_cmp(&a.correlation)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.tracking_error
                        .partial_cmp(&b.tracking_error)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        substitutes.truncate(self.config.max_substitutes);
        substitutes
    }

    /// Check if two symbols are substantially identical (would trigger wash sale)
    pub fn is_substantially_identical(&self, symbol1: &str, symbol2: &str, universe: &[Security]) -> bool {
        if symbol1 == symbol2 || self.substitutes_db.are_identical(symbol1, symbol2) {
            return true;
        }
        match (
            self.tracked_index(symbol1, universe),
            self.tracked_index(symbol2, universe),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn tracked_index<'a>(&'a self, symbol: &str, universe: &'a [Security]) -> Option<&'a str> {
        universe
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(|s| s.tracked_index.as_deref())
            .or_else(|| self.substitutes_db.tracked_index(symbol))
    }

    /// Correlation and tracking error on the most recent overlapping periods
    fn measure(&self, original: &[f64], candidate: &[f64]) -> Option<(f64, f64)> {
        let n = original.len().min(candidate.len());
        let a = &original[original.len() - n..];
        let b = &candidate[candidate.len() - n..];
        let rho = correlation(a, b).ok()?;
        let te = tracking_error(a, b, self.config.periods_per_year).ok()?;
        Some((rho, te))
    }

    fn reference_entry(&self, symbol: &str, candidate: &str) -> Option<SubstituteSecurity> {
        self.substitutes_db
            .siblings(symbol)
            .iter()
            .find_map(|sibling| self.substitutes_db.pair(sibling, candidate))
            .map(|pair| pair.to_substitute(candidate))
    }
}

/// A well-known fund pair with typical monthly-return statistics
#[derive(Debug, Clone, Copy)]
struct ReferencePair {
    a: &'static str,
    b: &'static str,
    correlation: f64,
    tracking_error: f64,
    substitute_type: SubstituteType,
}

impl ReferencePair {
    fn other<'s>(&self, symbol: &'s str) -> &'static str {
        if self.a == symbol {
            self.b
        } else {
            self.a
        }
    }

    fn to_substitute(&self, symbol: &str) -> SubstituteSecurity {
        SubstituteSecurity {
            symbol: symbol.to_string(),
            substitute_type: self.substitute_type,
            correlation: self.correlation,
            tracking_error: self.tracking_error,
            reason: format!("{} on a different index", self.substitute_type),
        }
    }
}

const REFERENCE_PAIRS: &[ReferencePair] = &[
    // US large cap and total market
    ReferencePair { a: "SPY", b: "SCHX", correlation: 0.995, tracking_error: 0.008, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "SPY", b: "VTI", correlation: 0.99, tracking_error: 0.020, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "SPY", b: "ITOT", correlation: 0.99, tracking_error: 0.021, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "VTI", b: "ITOT", correlation: 0.998, tracking_error: 0.004, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "VTI", b: "SCHB", correlation: 0.998, tracking_error: 0.005, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "ITOT", b: "SCHB", correlation: 0.998, tracking_error: 0.004, substitute_type: SubstituteType::IndexFund },
    // US growth / technology
    ReferencePair { a: "QQQ", b: "ONEQ", correlation: 0.97, tracking_error: 0.035, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "QQQ", b: "VGT", correlation: 0.95, tracking_error: 0.045, substitute_type: SubstituteType::SectorEtf },
    ReferencePair { a: "VGT", b: "XLK", correlation: 0.98, tracking_error: 0.030, substitute_type: SubstituteType::SectorEtf },
    // Developed and emerging markets
    ReferencePair { a: "EFA", b: "IEFA", correlation: 0.99, tracking_error: 0.010, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "EFA", b: "VEA", correlation: 0.98, tracking_error: 0.020, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "IEFA", b: "VEA", correlation: 0.99, tracking_error: 0.012, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "VWO", b: "IEMG", correlation: 0.98, tracking_error: 0.022, substitute_type: SubstituteType::IndexFund },
    // Bonds
    ReferencePair { a: "AGG", b: "BND", correlation: 0.99, tracking_error: 0.006, substitute_type: SubstituteType::FixedIncome },
    ReferencePair { a: "AGG", b: "IUSB", correlation: 0.97, tracking_error: 0.012, substitute_type: SubstituteType::FixedIncome },
    ReferencePair { a: "BND", b: "SCHZ", correlation: 0.99, tracking_error: 0.006, substitute_type: SubstituteType::FixedIncome },
    ReferencePair { a: "TLT", b: "VGLT", correlation: 0.99, tracking_error: 0.012, substitute_type: SubstituteType::FixedIncome },
    // Real estate
    ReferencePair { a: "VNQ", b: "SCHH", correlation: 0.98, tracking_error: 0.025, substitute_type: SubstituteType::IndexFund },
    ReferencePair { a: "VNQ", b: "USRT", correlation: 0.98, tracking_error: 0.022, substitute_type: SubstituteType::IndexFund },
];

const TRACKED_INDEXES: &[(&str, &str)] = &[
    ("SPY", "S&P 500"),
    ("VOO", "S&P 500"),
    ("IVV", "S&P 500"),
    ("SCHX", "Dow Jones US Large-Cap Total Stock Market"),
    ("VTI", "CRSP US Total Market"),
    ("ITOT", "S&P Total Market"),
    ("SCHB", "Dow Jones US Broad Stock Market"),
    ("QQQ", "NASDAQ-100"),
    ("QQQM", "NASDAQ-100"),
    ("ONEQ", "NASDAQ Composite"),
    ("VGT", "MSCI US IMI Information Technology 25/50"),
    ("XLK", "Technology Select Sector"),
    ("EFA", "MSCI EAFE"),
    ("IEFA", "MSCI EAFE IMI"),
    ("VEA", "FTSE Developed All Cap ex US"),
    ("VWO", "FTSE Emerging Markets All Cap China A Inclusion"),
    ("IEMG", "MSCI Emerging Markets IMI"),
    ("AGG", "Bloomberg US Aggregate"),
    ("SCHZ", "Bloomberg US Aggregate"),
    ("BND", "Bloomberg US Aggregate Float Adjusted"),
    ("IUSB", "Bloomberg US Universal"),
    ("TLT", "ICE US Treasury 20+ Year"),
    ("VGLT", "Bloomberg US Long Treasury"),
    ("VNQ", "MSCI US IMI Real Estate 25/50"),
    ("SCHH", "Dow Jones Equity All REIT Capped"),
    ("USRT", "FTSE Nareit All Equity REITs"),
    ("GLD", "LBMA Gold Price"),
    ("IAU", "LBMA Gold Price"),
];

/// Share classes of the same company or fund
const IDENTICAL_PAIRS: &[(&str, &str)] = &[
    ("GOOGL", "GOOG"),
    ("BRK.A", "BRK.B"),
    ("VTI", "VTSAX"),
    ("VOO", "VFIAX"),
];

/// Database of known substitutes and index mappings
#[derive(Debug, Clone)]
struct SubstitutesDatabase {
    pairs: Vec<ReferencePair>,
    tracked_indexes: HashMap<&'static str, &'static str>,
    identical_pairs: Vec<(&'static str, &'static str)>,
}

impl Default for SubstitutesDatabase {
    fn default() -> Self {
        Self {
            pairs: REFERENCE_PAIRS.to_vec(),
            tracked_indexes: TRACKED_INDEXES.iter().copied().collect(),
            identical_pairs: IDENTICAL_PAIRS.to_vec(),
        }
    }
}

impl SubstitutesDatabase {
    fn pairs_for<'s>(&'s self, symbol: &'s str) -> impl Iterator<Item = &'s ReferencePair> + 's {
        self.pairs.iter().filter(move |p| p.a == symbol || p.b == symbol)
    }

    fn pair(&self, symbol1: &str, symbol2: &str) -> Option<&ReferencePair> {
        self.pairs
            .iter()
            .find(|p| (p.a == symbol1 && p.b == symbol2) || (p.a == symbol2 && p.b == symbol1))
    }

    fn tracked_index(&self, symbol: &str) -> Option<&'static str> {
        self.tracked_indexes.get(symbol).copied()
    }

    fn are_identical(&self, symbol1: &str, symbol2: &str) -> bool {
        self.identical_pairs
            .iter()
            .any(|(a, b)| (*a == symbol1 && *b == symbol2) || (*a == symbol2 && *b == symbol1))
    }

    /// `symbol` and every listed security substantially identical to it,
    /// `symbol` first then alphabetical
    fn siblings(&self, symbol: &str) -> Vec<String> {
        let mut others: Vec<&str> = Vec::new();
        if let Some(index) = self.tracked_index(symbol) {
            others.extend(
                self.tracked_indexes
                    .iter()
                    .filter(|(s, i)| **i == index && **s != symbol)
                    .map(|(s, _)| *s),
            );
        }
        for (a, b) in &self.identical_pairs {
            if *a == symbol {
                others.push(*b);
            } else if *b == symbol {
                others.push(*a);
            }
        }
        others.sort_unstable();
        others.dedup();

        let mut siblings = vec![symbol.to_string()];
        siblings.extend(others.into_iter().map(str::to_string));
        siblings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finder() -> SubstituteFinder {
        SubstituteFinder::default()
    }

    #[test]
    fn test_reference_substitutes_for_bond_fund() {
        let subs = finder().find_substitutes("AGG", &[]);
        assert!(!subs.is_empty());
        assert_eq!(subs[0].symbol, "BND");
        assert!(subs.iter().all(|s| s.correlation >= 0.95));
        // SCHZ tracks the same index as AGG
        assert!(subs.iter().all(|s| s.symbol != "SCHZ"));
    }

    #[test]
    fn test_substantially_identical() {
        let finder = finder();
        assert!(finder.is_substantially_identical("SPY", "SPY", &[]));
        assert!(finder.is_substantially_identical("SPY", "VOO", &[]));
        assert!(finder.is_substantially_identical("GOOGL", "GOOG", &[]));
        assert!(!finder.is_substantially_identical("SPY", "VTI", &[]));

        let universe = vec![
            Security::new("FUNDA", vec![]).tracking("Custom 100"),
            Security::new("FUNDB", vec![]).tracking("Custom 100"),
        ];
        assert!(finder.is_substantially_identical("FUNDA", "FUNDB", &universe));
    }

    #[test]
    fn test_identical_funds_share_reference_pairs() {
        let subs = finder().find_substitutes("VOO", &[]);
        let symbols: Vec<&str> = subs.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["SCHX", "VTI", "ITOT"]);
        assert!(!symbols.contains(&"SPY"));
        assert!(!symbols.contains(&"IVV"));
    }

    #[test]
    fn test_universe_candidates_are_measured() {
        let base: Vec<f64> = (0..24).map(|i| ((i * 7) % 11) as f64 / 100.0 - 0.05).collect();
        let close: Vec<f64> = base
            .iter()
            .enumerate()
            .map(|(i, r)| r + if i % 2 == 0 { 0.001 } else { -0.001 })
            .collect();
        let unrelated: Vec<f64> = base.iter().rev().copied().collect();

        let universe = vec![
            Security::new("MYFUND", base.clone()),
            Security::new("CLOSE", close),
            Security::new("OTHER", unrelated),
        ];
        let subs = finder().find_substitutes("MYFUND", &universe);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].symbol, "CLOSE");
        assert_eq!(subs[0].substitute_type, SubstituteType::Measured);
        assert!(subs[0].correlation > 0.99);
    }

    #[test]
    fn test_at_most_configured_count() {
        let finder = SubstituteFinder::new(SubstituteConfig {
            max_substitutes: 1,
            ..SubstituteConfig::default()
        });
        assert_eq!(finder.find_substitutes("SPY", &[]).len(), 1);
        assert!(finder.find_substitutes("UNKNOWN", &[]).is_empty());
    }
}
