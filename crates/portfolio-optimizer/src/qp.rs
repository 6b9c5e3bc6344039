//! Dense convex quadratic programming.
//!
//! Solves
//!
//! ```text
//! minimise   ½ xᵀGx + aᵀx
//! subject to cᵢᵀx  = bᵢ   (equalities)
//!            cᵢᵀx >= bᵢ   (inequalities)
//! ```
//!
//! with the Goldfarb-Idnani dual active-set method. The method starts from
//! the unconstrained minimum and adds violated constraints one at a time,
//! keeping the iterate dual feasible. A constraint that cannot be added,
//! because it is linearly dependent on the active set and no active
//! multiplier can be released, proves the problem infeasible; that
//! constraint's name is reported.

use nalgebra::{DMatrix, DVector};
use planner_core::{PlannerError, PlannerResult};
use tracing::debug;

const FEASIBILITY_TOLERANCE: f64 = 1e-10;
const DEPENDENCE_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Equality,
    Inequality,
}

#[derive(Debug, Clone)]
pub struct LinearConstraint {
    pub normal: DVector<f64>,
    pub bound: f64,
    pub kind: ConstraintKind,
    /// Reported when the constraint makes the problem infeasible
    pub name: String,
}

impl LinearConstraint {
    pub fn equality(normal: DVector<f64>, bound: f64, name: impl Into<String>) -> Self {
        Self {
            normal,
            bound,
            kind: ConstraintKind::Equality,
            name: name.into(),
        }
    }

    /// `normalᵀx >= bound`
    pub fn at_least(normal: DVector<f64>, bound: f64, name: impl Into<String>) -> Self {
        Self {
            normal,
            bound,
            kind: ConstraintKind::Inequality,
            name: name.into(),
        }
    }

    /// `normalᵀx <= bound`
    pub fn at_most(normal: DVector<f64>, bound: f64, name: impl Into<String>) -> Self {
        Self::at_least(-normal, -bound, name)
    }

    fn slack(&self, x: &DVector<f64>) -> f64 {
        self.normal.dot(x) - self.bound
    }
}

#[derive(Debug, Clone)]
pub struct QuadraticProgram {
    pub hessian: DMatrix<f64>,
    pub linear: DVector<f64>,
    pub constraints: Vec<LinearConstraint>,
}

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub objective: f64,
    pub iterations: usize,
    /// Indices of the constraints active at the solution
    pub active: Vec<usize>,
}

/// An active constraint, possibly with its normal flipped so that the
/// equality was approached from the violated side.
struct Active {
    index: usize,
    sign: f64,
    multiplier: f64,
}

pub fn solve(qp: &QuadraticProgram, max_iterations: usize) -> PlannerResult<QpSolution> {
    let n = qp.linear.len();
    if qp.hessian.nrows() != n || qp.hessian.ncols() != n {
        return Err(PlannerError::validation(
            "hessian",
            format!("expected {n}x{n}, got {}x{}", qp.hessian.nrows(), qp.hessian.ncols()),
        ));
    }

    // small ridge keeps semidefinite covariance matrices factorisable
    let scale = (qp.hessian.trace() / n as f64).abs().max(1e-8);
    let g = &qp.hessian + DMatrix::identity(n, n) * (1e-8 * scale);
    let g_inv = g
        .cholesky()
        .ok_or_else(|| {
            PlannerError::NonPositiveDefinite("quadratic term is not positive definite".to_string())
        })?
        .inverse();
    let g_inv_norm = g_inv.norm().max(1.0);

    let mut x = -(&g_inv * &qp.linear);
    let mut active: Vec<Active> = Vec::new();
    let mut skipped = vec![false; qp.constraints.len()];
    let mut iterations = 0;

    loop {
        let Some((p, sign)) = next_violated(qp, &x, &active, &skipped) else {
            break;
        };
        iterations += 1;
        if iterations > max_iterations {
            return Err(PlannerError::Convergence(format!(
                "active-set solver exceeded {max_iterations} iterations"
            )));
        }

        let constraint = &qp.constraints[p];
        let np = &constraint.normal * sign;
        let bp = constraint.bound * sign;
        let mut added_multiplier = 0.0;
        let z_tolerance = DEPENDENCE_TOLERANCE * g_inv_norm * np.norm().max(1e-12);

        loop {
            let slack = np.dot(&x) - bp;
            let (z, r) = step_directions(&g_inv, qp, &active, &np)?;
            if constraint.kind == ConstraintKind::Equality
                && z.norm() <= z_tolerance
                && slack.abs() <= FEASIBILITY_TOLERANCE * (1.0 + bp.abs())
            {
                // implied by the active equalities
                skipped[p] = true;
                break;
            }

            // dual step: largest move before an active inequality multiplier hits zero
            let mut t1 = f64::INFINITY;
            let mut drop = None;
            for (k, a) in active.iter().enumerate() {
                if qp.constraints[a.index].kind == ConstraintKind::Inequality
                    && r[k] > DEPENDENCE_TOLERANCE
                {
                    let ratio = a.multiplier / r[k];
                    if ratio < t1 {
                        t1 = ratio;
                        drop = Some(k);
                    }
                }
            }

            let curvature = z.dot(&np);
            let t2 = if z.norm() > z_tolerance && curvature > z_tolerance * np.norm() {
                -slack / curvature
            } else {
                f64::INFINITY
            };

            let t = t1.min(t2);
            if !t.is_finite() {
                return Err(PlannerError::infeasible(
                    constraint.name.clone(),
                    "cannot be satisfied together with the other active constraints",
                ));
            }

            for (k, a) in active.iter_mut().enumerate() {
                a.multiplier -= t * r[k];
            }
            added_multiplier += t;

            if t2.is_finite() {
                x += &z * t;
            }

            if t == t2 {
                active.push(Active {
                    index: p,
                    sign,
                    multiplier: added_multiplier,
                });
                debug!(constraint = %constraint.name, active = active.len(), "constraint added");
                break;
            }

            if let Some(k) = drop {
                let removed = active.remove(k);
                debug!(constraint = %qp.constraints[removed.index].name, "constraint released");
            }
        }
    }

    let objective = 0.5 * x.dot(&(&qp.hessian * &x)) + qp.linear.dot(&x);
    Ok(QpSolution {
        active: active.iter().map(|a| a.index).collect(),
        x,
        objective,
        iterations,
    })
}

/// Pending equalities first, then the most violated inequality.
fn next_violated(
    qp: &QuadraticProgram,
    x: &DVector<f64>,
    active: &[Active],
    skipped: &[bool],
) -> Option<(usize, f64)> {
    let is_active = |i: usize| active.iter().any(|a| a.index == i);

    for (i, c) in qp.constraints.iter().enumerate() {
        if c.kind == ConstraintKind::Equality && !is_active(i) && !skipped[i] {
            let slack = c.slack(x);
            return Some((i, if slack > 0.0 { -1.0 } else { 1.0 }));
        }
    }

    let mut worst = None;
    let mut worst_slack = -FEASIBILITY_TOLERANCE;
    for (i, c) in qp.constraints.iter().enumerate() {
        if c.kind == ConstraintKind::Inequality && !is_active(i) {
            let scale = 1.0 + c.bound.abs();
            let slack = c.slack(x) / scale;
            if slack < worst_slack {
                worst_slack = slack;
                worst = Some(i);
            }
        }
    }
    worst.map(|i| (i, 1.0))
}

/// Primal direction `z` and dual direction `r` for adding normal `np`.
fn step_directions(
    g_inv: &DMatrix<f64>,
    qp: &QuadraticProgram,
    active: &[Active],
    np: &DVector<f64>,
) -> PlannerResult<(DVector<f64>, DVector<f64>)> {
    let n = np.len();
    let q = active.len();
    if q == 0 {
        return Ok((g_inv * np, DVector::zeros(0)));
    }
    let normals = DMatrix::from_fn(n, q, |i, k| {
        qp.constraints[active[k].index].normal[i] * active[k].sign
    });
    let jn = g_inv * &normals;
    let b = normals.transpose() * &jn;
    let rhs = jn.transpose() * np;
    let r = b.lu().solve(&rhs).ok_or_else(|| {
        PlannerError::Convergence("active constraint normals became linearly dependent".to_string())
    })?;
    let z = g_inv * (np - &normals * &r);
    Ok((z, r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ones(n: usize) -> DVector<f64> {
        DVector::from_element(n, 1.0)
    }

    fn unit(n: usize, i: usize) -> DVector<f64> {
        DVector::from_fn(n, |j, _| if i == j { 1.0 } else { 0.0 })
    }

    #[test]
    fn test_unconstrained_minimum() {
        let qp = QuadraticProgram {
            hessian: DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]),
            linear: DVector::from_vec(vec![-2.0, -8.0]),
            constraints: vec![],
        };
        let sol = solve(&qp, 10).unwrap();
        assert_relative_eq!(sol.x[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(sol.x[1], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_budget_and_bounds() {
        // min x0² + x1² + x2², sum = 1, x0 >= 0.5
        let mut constraints = vec![LinearConstraint::equality(ones(3), 1.0, "budget")];
        constraints.push(LinearConstraint::at_least(unit(3, 0), 0.5, "min_weight[a]"));
        for i in 0..3 {
            constraints.push(LinearConstraint::at_least(unit(3, i), 0.0, format!("nonneg[{i}]")));
        }
        let qp = QuadraticProgram {
            hessian: DMatrix::identity(3, 3) * 2.0,
            linear: DVector::zeros(3),
            constraints,
        };
        let sol = solve(&qp, 50).unwrap();
        assert_relative_eq!(sol.x[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(sol.x[1], 0.25, epsilon = 1e-6);
        assert_relative_eq!(sol.x[2], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_inactive_bound_is_released() {
        // linear term pushes x0 up; cap at 0.3 binds, floor does not
        let constraints = vec![
            LinearConstraint::equality(ones(2), 1.0, "budget"),
            LinearConstraint::at_most(unit(2, 0), 0.3, "max_weight[a]"),
            LinearConstraint::at_least(unit(2, 0), 0.0, "min_weight[a]"),
            LinearConstraint::at_least(unit(2, 1), 0.0, "min_weight[b]"),
        ];
        let qp = QuadraticProgram {
            hessian: DMatrix::identity(2, 2) * 0.1,
            linear: DVector::from_vec(vec![-1.0, 0.0]),
            constraints,
        };
        let sol = solve(&qp, 50).unwrap();
        assert_relative_eq!(sol.x[0], 0.3, epsilon = 1e-6);
        assert_relative_eq!(sol.x[1], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn test_infeasible_bound_is_named() {
        let constraints = vec![
            LinearConstraint::equality(ones(2), 1.0, "budget"),
            LinearConstraint::at_most(unit(2, 0), 0.3, "max_weight[a]"),
            LinearConstraint::at_most(unit(2, 1), 0.3, "max_weight[b]"),
        ];
        let qp = QuadraticProgram {
            hessian: DMatrix::identity(2, 2),
            linear: DVector::zeros(2),
            constraints,
        };
        match solve(&qp, 50) {
            Err(PlannerError::InfeasibleConstraint { constraint, .. }) => {
                assert!(constraint.starts_with("max_weight"), "{constraint}");
            }
            other => panic!("expected infeasible, got {other:?}"),
        }
    }

    #[test]
    fn test_conflicting_equalities_are_infeasible() {
        let constraints = vec![
            LinearConstraint::equality(ones(2), 1.0, "budget"),
            LinearConstraint::equality(ones(2) * 2.0, 3.0, "target_return"),
        ];
        let qp = QuadraticProgram {
            hessian: DMatrix::identity(2, 2),
            linear: DVector::zeros(2),
            constraints,
        };
        assert!(matches!(
            solve(&qp, 50),
            Err(PlannerError::InfeasibleConstraint { ref constraint, .. }) if constraint == "target_return"
        ));
    }

    #[test]
    fn test_redundant_equality_is_ignored() {
        let constraints = vec![
            LinearConstraint::equality(ones(2), 1.0, "budget"),
            LinearConstraint::equality(ones(2) * 2.0, 2.0, "budget_again"),
        ];
        let qp = QuadraticProgram {
            hessian: DMatrix::identity(2, 2),
            linear: DVector::zeros(2),
            constraints,
        };
        let sol = solve(&qp, 50).unwrap();
        assert_relative_eq!(sol.x[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_iteration_budget() {
        let mut constraints = vec![LinearConstraint::equality(ones(4), 1.0, "budget")];
        for i in 0..4 {
            constraints.push(LinearConstraint::at_least(unit(4, i), 0.1, format!("min[{i}]")));
        }
        let qp = QuadraticProgram {
            hessian: DMatrix::identity(4, 4),
            linear: DVector::from_vec(vec![-1.0, 0.0, 0.0, 0.0]),
            constraints,
        };
        assert!(matches!(solve(&qp, 1), Err(PlannerError::Convergence(_))));
    }
}
