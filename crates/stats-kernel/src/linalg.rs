//! Covariance and correlation matrix utilities.
//!
//! Every matrix that reaches a Cholesky factorisation or a solver passes
//! through [`validate_symmetric`] first. Indefinite input is repaired once
//! with [`nearest_psd`] before [`cholesky_with_fallback`] gives up.

use nalgebra::{DMatrix, DVector};
use planner_core::{PlannerError, PlannerResult};
use tracing::{debug, warn};

/// Relative tolerance for `|a_ij - a_ji|`.
pub const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// Eigenvalues below this are clipped up to it by [`nearest_psd`].
pub const EIGENVALUE_FLOOR: f64 = 1e-8;

/// Reject non-square, non-finite or asymmetric matrices.
pub fn validate_symmetric(m: &DMatrix<f64>, name: &str) -> PlannerResult<()> {
    if m.nrows() != m.ncols() {
        return Err(PlannerError::validation(
            name,
            format!("matrix must be square, got {}x{}", m.nrows(), m.ncols()),
        ));
    }
    if m.nrows() == 0 {
        return Err(PlannerError::InsufficientData(format!("{name} is empty")));
    }
    let n = m.nrows();
    for i in 0..n {
        for j in 0..n {
            let v = m[(i, j)];
            if !v.is_finite() {
                return Err(PlannerError::validation(
                    format!("{name}[{i}][{j}]"),
                    format!("must be finite, got {v}"),
                ));
            }
            if j > i {
                let scale = 1.0_f64.max(v.abs()).max(m[(j, i)].abs());
                if (v - m[(j, i)]).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(PlannerError::validation(
                        format!("{name}[{i}][{j}]"),
                        format!("matrix is not symmetric ({v} vs {})", m[(j, i)]),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Symmetric, unit diagonal, entries in [-1, 1].
pub fn validate_correlation(m: &DMatrix<f64>, name: &str) -> PlannerResult<()> {
    validate_symmetric(m, name)?;
    for i in 0..m.nrows() {
        if (m[(i, i)] - 1.0).abs() > 1e-8 {
            return Err(PlannerError::validation(
                format!("{name}[{i}][{i}]"),
                format!("diagonal must be 1, got {}", m[(i, i)]),
            ));
        }
        for j in 0..m.ncols() {
            if m[(i, j)].abs() > 1.0 + 1e-12 {
                return Err(PlannerError::validation(
                    format!("{name}[{i}][{j}]"),
                    format!("correlation must lie in [-1, 1], got {}", m[(i, j)]),
                ));
            }
        }
    }
    Ok(())
}

/// Build a matrix from nested rows, checking that it is square.
pub fn from_rows(rows: &[Vec<f64>], name: &str) -> PlannerResult<DMatrix<f64>> {
    let n = rows.len();
    if n == 0 {
        return Err(PlannerError::InsufficientData(format!("{name} is empty")));
    }
    for (i, row) in rows.iter().enumerate() {
        if row.len() != n {
            return Err(PlannerError::validation(
                format!("{name}[{i}]"),
                format!("expected {n} columns, got {}", row.len()),
            ));
        }
    }
    Ok(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
}

pub fn to_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    (0..m.nrows())
        .map(|i| (0..m.ncols()).map(|j| m[(i, j)]).collect())
        .collect()
}

/// Σ = diag(σ) · ρ · diag(σ)
pub fn covariance_from_correlation(vols: &[f64], corr: &DMatrix<f64>) -> PlannerResult<DMatrix<f64>> {
    if vols.len() != corr.nrows() {
        return Err(PlannerError::validation(
            "correlation",
            format!("expected {n}x{n} matrix for {n} assets", n = vols.len()),
        ));
    }
    let n = vols.len();
    Ok(DMatrix::from_fn(n, n, |i, j| vols[i] * vols[j] * corr[(i, j)]))
}

/// Inverse of [`covariance_from_correlation`]. Zero-variance assets get a
/// unit diagonal and zero off-diagonal correlation.
pub fn correlation_from_covariance(cov: &DMatrix<f64>) -> DMatrix<f64> {
    let n = cov.nrows();
    let sd: Vec<f64> = (0..n).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            1.0
        } else if sd[i] > 0.0 && sd[j] > 0.0 {
            (cov[(i, j)] / (sd[i] * sd[j])).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    })
}

/// Sample covariance (N-1 denominator) of aligned series, one per asset.
pub fn sample_covariance(series: &[Vec<f64>]) -> PlannerResult<DMatrix<f64>> {
    let n = series.len();
    if n == 0 {
        return Err(PlannerError::InsufficientData("no return series".to_string()));
    }
    let t = series[0].len();
    if let Some((i, s)) = series.iter().enumerate().find(|(_, s)| s.len() != t) {
        return Err(PlannerError::InsufficientData(format!(
            "series {i} has {} observations, expected {t}",
            s.len()
        )));
    }
    if t < 2 {
        return Err(PlannerError::InsufficientData(format!(
            "covariance needs at least two observations, got {t}"
        )));
    }
    let means: Vec<f64> = series.iter().map(|s| s.iter().sum::<f64>() / t as f64).collect();
    let mut cov = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let c = series[i]
                .iter()
                .zip(&series[j])
                .map(|(a, b)| (a - means[i]) * (b - means[j]))
                .sum::<f64>()
                / (t as f64 - 1.0);
            cov[(i, j)] = c;
            cov[(j, i)] = c;
        }
    }
    Ok(cov)
}

/// Sample covariance of the columns of an observation matrix (rows = periods).
pub fn sample_covariance_of_rows(obs: &DMatrix<f64>) -> PlannerResult<(DVector<f64>, DMatrix<f64>)> {
    let t = obs.nrows();
    if t < 2 {
        return Err(PlannerError::InsufficientData(format!(
            "covariance needs at least two observations, got {t}"
        )));
    }
    let means = DVector::from_iterator(obs.ncols(), obs.column_iter().map(|c| c.mean()));
    let mut centered = obs.clone();
    for (j, mut col) in centered.column_iter_mut().enumerate() {
        col.add_scalar_mut(-means[j]);
    }
    let cov = centered.transpose() * &centered / (t as f64 - 1.0);
    Ok((means, cov))
}

/// Shrink towards the diagonal: (1-λ)Σ + λ·diag(Σ).
pub fn shrink_to_diagonal(cov: &DMatrix<f64>, lambda: f64) -> DMatrix<f64> {
    let n = cov.nrows();
    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            cov[(i, j)]
        } else {
            (1.0 - lambda) * cov[(i, j)]
        }
    })
}

pub fn min_eigenvalue(m: &DMatrix<f64>) -> f64 {
    m.clone()
        .symmetric_eigen()
        .eigenvalues
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min)
}

/// Nearest positive-definite matrix by eigenvalue clipping.
///
/// Eigenvalues are raised to `EIGENVALUE_FLOOR` scaled by the matrix
/// magnitude, then the matrix is recomposed and re-symmetrised.
pub fn nearest_psd(m: &DMatrix<f64>) -> DMatrix<f64> {
    let scale = m.diagonal().iter().map(|d| d.abs()).fold(0.0, f64::max).max(1e-12);
    let floor = EIGENVALUE_FLOOR * scale;
    let mut eig = m.clone().symmetric_eigen();
    let clipped = eig.eigenvalues.iter().filter(|&&l| l < floor).count();
    eig.eigenvalues.iter_mut().for_each(|l| *l = l.max(floor));
    debug!(clipped, floor, "nearest-psd eigenvalue clipping");
    let repaired = eig.recompose();
    (&repaired + repaired.transpose()) * 0.5
}

/// [`nearest_psd`] followed by rescaling back to a unit diagonal.
pub fn nearest_correlation(m: &DMatrix<f64>) -> DMatrix<f64> {
    let psd = nearest_psd(m);
    correlation_from_covariance(&psd)
}

/// Lower-triangular factor `L` with `L·Lᵀ = Σ`.
#[derive(Debug, Clone)]
pub struct CholeskyFactor {
    pub lower: DMatrix<f64>,
    /// The input was indefinite and was replaced by its nearest PSD matrix
    pub corrected: bool,
}

/// Cholesky factorisation with one nearest-PSD retry.
///
/// Correlation input (unit diagonal) is repaired with
/// [`nearest_correlation`] so that the corrected matrix stays a correlation
/// matrix. Fails with `NonPositiveDefinite` if the retry also fails.
pub fn cholesky_with_fallback(m: &DMatrix<f64>, name: &str) -> PlannerResult<CholeskyFactor> {
    validate_symmetric(m, name)?;
    if let Some(chol) = m.clone().cholesky() {
        return Ok(CholeskyFactor {
            lower: chol.l(),
            corrected: false,
        });
    }

    let unit_diagonal = m.diagonal().iter().all(|d| (d - 1.0).abs() < 1e-8);
    warn!(
        matrix = name,
        min_eigenvalue = min_eigenvalue(m),
        "matrix not positive definite, substituting nearest PSD matrix"
    );
    let repaired = if unit_diagonal {
        nearest_correlation(m)
    } else {
        nearest_psd(m)
    };
    match repaired.cholesky() {
        Some(chol) => Ok(CholeskyFactor {
            lower: chol.l(),
            corrected: true,
        }),
        None => Err(PlannerError::NonPositiveDefinite(format!(
            "{name} could not be factorised after nearest-PSD correction"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn indefinite_correlation() -> DMatrix<f64> {
        // pairwise plausible, jointly impossible
        DMatrix::from_row_slice(3, 3, &[1.0, 0.9, -0.9, 0.9, 1.0, 0.9, -0.9, 0.9, 1.0])
    }

    #[test]
    fn test_validate_rejects_asymmetric_and_nan() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.4, 1.0]);
        assert!(matches!(
            validate_symmetric(&m, "corr"),
            Err(PlannerError::Validation { .. })
        ));
        let m = DMatrix::from_row_slice(2, 2, &[1.0, f64::NAN, f64::NAN, 1.0]);
        assert!(validate_symmetric(&m, "corr").is_err());
    }

    #[test]
    fn test_covariance_round_trips_through_correlation() {
        let corr = DMatrix::from_row_slice(2, 2, &[1.0, -0.1, -0.1, 1.0]);
        let cov = covariance_from_correlation(&[0.18, 0.06], &corr).unwrap();
        assert_relative_eq!(cov[(0, 0)], 0.0324, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 1)], -0.00108, epsilon = 1e-12);
        let back = correlation_from_covariance(&cov);
        assert_relative_eq!(back[(0, 1)], -0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_nearest_psd_has_non_negative_spectrum() {
        let m = indefinite_correlation();
        assert!(min_eigenvalue(&m) < 0.0);
        let fixed = nearest_psd(&m);
        assert!(min_eigenvalue(&fixed) >= -1e-9);
        assert!(validate_symmetric(&fixed, "fixed").is_ok());
    }

    #[test]
    fn test_cholesky_falls_back_once() {
        let ok = DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 1.0]);
        let f = cholesky_with_fallback(&ok, "corr").unwrap();
        assert!(!f.corrected);
        let product = &f.lower * f.lower.transpose();
        assert_relative_eq!(product[(0, 1)], 0.3, epsilon = 1e-12);

        let f = cholesky_with_fallback(&indefinite_correlation(), "corr").unwrap();
        assert!(f.corrected);
        let product = &f.lower * f.lower.transpose();
        for i in 0..3 {
            assert_relative_eq!(product[(i, i)], 1.0, epsilon = 1e-8);
        }
        assert!(min_eigenvalue(&product) >= -1e-9);
    }

    #[test]
    fn test_sample_covariance() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![2.0, 4.0, 6.0, 8.0];
        let cov = sample_covariance(&[a.clone(), b.clone()]).unwrap();
        assert_relative_eq!(cov[(0, 0)], 5.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 1)], 10.0 / 3.0, epsilon = 1e-12);

        let obs = DMatrix::from_fn(4, 2, |i, j| if j == 0 { a[i] } else { b[i] });
        let (means, cov2) = sample_covariance_of_rows(&obs).unwrap();
        assert_relative_eq!(means[1], 5.0, epsilon = 1e-12);
        assert_relative_eq!(cov2[(1, 1)], cov[(1, 1)], epsilon = 1e-12);

        assert!(sample_covariance(&[vec![1.0, 2.0], vec![1.0]]).is_err());
    }

    #[test]
    fn test_shrinkage_keeps_variances() {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.01, 0.09]);
        let s = shrink_to_diagonal(&cov, 0.5);
        assert_relative_eq!(s[(0, 0)], 0.04);
        assert_relative_eq!(s[(0, 1)], 0.005);
    }
}
