//! Minimum-cost assignment (Hungarian algorithm with potentials).

use planner_core::{PlannerError, PlannerResult};

/// Assign every row of an `n × m` cost matrix (`n <= m`) to a distinct
/// column minimising the total cost. Returns the column chosen for each
/// row. Runs in O(n²·m).
pub fn solve(cost: &[Vec<f64>]) -> PlannerResult<Vec<usize>> {
    let n = cost.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let m = cost[0].len();
    if cost.iter().any(|row| row.len() != m) {
        return Err(PlannerError::validation("cost", "rows must have equal length"));
    }
    if n > m {
        return Err(PlannerError::validation(
            "cost",
            format!("{n} rows cannot be assigned to {m} columns"),
        ));
    }
    if cost.iter().flatten().any(|c| !c.is_finite()) {
        return Err(PlannerError::validation("cost", "entries must be finite"));
    }

    // 1-based: row/column 0 is the virtual start of each augmenting path
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for row in 1..=n {
        owner[0] = row;
        let mut j0 = 0;
        let mut min_slack = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if reduced < min_slack[j] {
                    min_slack[j] = reduced;
                    way[j] = j0;
                }
                if min_slack[j] < delta {
                    delta = min_slack[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_slack[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![0; n];
    for j in 1..=m {
        if owner[j] != 0 {
            assignment[owner[j] - 1] = j - 1;
        }
    }
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &[Vec<f64>], assignment: &[usize]) -> f64 {
        assignment.iter().enumerate().map(|(i, &j)| cost[i][j]).sum()
    }

    #[test]
    fn test_square_assignment() {
        let cost = vec![
            vec![4.0, 1.0, 3.0],
            vec![2.0, 0.0, 5.0],
            vec![3.0, 2.0, 2.0],
        ];
        let assignment = solve(&cost).unwrap();
        assert_eq!(assignment, vec![1, 0, 2]);
        assert_eq!(total(&cost, &assignment), 5.0);
    }

    #[test]
    fn test_rectangular_assignment_uses_distinct_columns() {
        let cost = vec![vec![9.0, 2.0, 7.0, 8.0], vec![6.0, 4.0, 3.0, 7.0]];
        let assignment = solve(&cost).unwrap();
        assert_eq!(assignment, vec![1, 2]);
        assert_ne!(assignment[0], assignment[1]);
    }

    #[test]
    fn test_rejects_more_rows_than_columns() {
        let cost = vec![vec![1.0], vec![2.0]];
        assert!(solve(&cost).is_err());
        assert!(solve(&[]).unwrap().is_empty());
    }
}
