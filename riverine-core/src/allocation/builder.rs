//! Sparse linear-program storage for the allocation optimizer.
//!
//! The LP is built once per subnetwork and then mutated between solves:
//! column bounds, row bounds, selected coefficients and the objective vector
//! change; rows and columns are never added after the build. Rows are divided
//! into fixed rows (structural constraints that never change) and variable
//! rows (refreshed before every solve).

use microlp::{ComparisonOp, OptimizationDirection, Problem, Variable};
use std::collections::BTreeMap;
use std::fmt::Debug;

#[derive(Debug, Copy, Clone)]
pub enum Bounds {
    Free,
    Lower(f64),
    Double(f64, f64),
    Fixed(f64),
}

/// Sparse form of the linear program, CSR over rows.
#[derive(Debug, Clone)]
pub struct Lp<I> {
    f64_max: f64,
    col_lower: Vec<f64>,
    col_upper: Vec<f64>,
    col_obj_coef: Vec<f64>,
    row_lower: Vec<f64>,
    row_upper: Vec<f64>,
    /// 1 for variable rows whose bounds reset before each refresh.
    row_mask: Vec<I>,
    row_starts: Vec<I>,
    columns: Vec<I>,
    elements: Vec<f64>,
}

impl<I> Lp<I>
where
    I: num::PrimInt,
{
    pub fn num_cols(&self) -> usize {
        self.col_lower.len()
    }

    pub fn num_rows(&self) -> usize {
        self.row_lower.len()
    }

    /// Zero all objective coefficients.
    pub fn zero_obj_coefficients(&mut self) {
        self.col_obj_coef.fill(0.0);
    }

    /// Increment the given column's objective coefficient.
    pub fn add_obj_coefficient(&mut self, col: usize, obj_coef: f64) {
        self.col_obj_coef[col] += obj_coef;
    }

    pub fn set_col_bounds(&mut self, col: usize, bounds: Bounds) {
        let (lb, ub) = self.resolve(bounds);
        self.col_lower[col] = lb;
        self.col_upper[col] = ub;
    }

    fn resolve(&self, bounds: Bounds) -> (f64, f64) {
        match bounds {
            Bounds::Free => (-self.f64_max, self.f64_max),
            Bounds::Lower(lb) => (lb, self.f64_max),
            Bounds::Double(lb, ub) => (lb, ub),
            Bounds::Fixed(value) => (value, value),
        }
    }

    /// Reset every variable row to unbounded before a refresh pass.
    pub fn reset_variable_row_bounds(&mut self) {
        for ((mask, lb), ub) in self
            .row_mask
            .iter()
            .zip(self.row_lower.iter_mut())
            .zip(self.row_upper.iter_mut())
        {
            if mask == &I::one() {
                *lb = -self.f64_max;
                *ub = self.f64_max;
            }
        }
    }

    /// Tighten a row's bounds; looser bounds than the current ones are
    /// ignored so independent refreshers compose.
    pub fn apply_row_bounds(&mut self, row: usize, lb: f64, ub: f64) {
        self.row_lower[row] = self.row_lower[row].max(lb);
        self.row_upper[row] = self.row_upper[row].min(ub);
    }

    /// Overwrite one coefficient of an existing row. The entry must be part
    /// of the build-time sparsity pattern.
    pub fn set_coefficient(&mut self, row: usize, col: usize, value: f64) {
        let start = self.row_starts[row].to_usize().unwrap();
        let end = self.row_starts[row + 1].to_usize().unwrap();
        let position = self.columns[start..end]
            .iter()
            .position(|c| c.to_usize().unwrap() == col)
            .unwrap_or_else(|| panic!("coefficient ({row}, {col}) is not in the sparsity pattern"));
        self.elements[start + position] = value;
    }

    pub fn col_bounds(&self, col: usize) -> (f64, f64) {
        (self.col_lower[col], self.col_upper[col])
    }

    /// Derive a fresh backend problem from the sparse arrays. `pins` are
    /// extra single-use rows (achieved goal-programming objectives).
    pub fn to_problem(&self, pins: &[(Vec<(usize, f64)>, f64)]) -> (Problem, Vec<Variable>) {
        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let variables: Vec<Variable> = (0..self.num_cols())
            .map(|col| problem.add_var(self.col_obj_coef[col], (self.col_lower[col], self.col_upper[col])))
            .collect();

        for row in 0..self.num_rows() {
            let row_lower = self.row_lower[row];
            let row_upper = self.row_upper[row];
            let start = self.row_starts[row].to_usize().unwrap();
            let end = self.row_starts[row + 1].to_usize().unwrap();
            let expr = self.columns[start..end]
                .iter()
                .zip(&self.elements[start..end])
                .map(|(col, &value)| (variables[col.to_usize().unwrap()], value));

            if row_lower == row_upper {
                problem.add_constraint(expr, ComparisonOp::Eq, row_lower);
            } else {
                if row_lower > -self.f64_max {
                    problem.add_constraint(expr.clone(), ComparisonOp::Ge, row_lower);
                }
                if row_upper < self.f64_max {
                    problem.add_constraint(expr, ComparisonOp::Le, row_upper);
                }
            }
        }

        for (terms, upper) in pins {
            let expr = terms.iter().map(|(col, value)| (variables[*col], *value));
            problem.add_constraint(expr, ComparisonOp::Le, *upper);
        }

        (problem, variables)
    }
}

#[derive(Debug, PartialEq, Default)]
pub struct RowBuilder<I> {
    lower: f64,
    upper: Option<f64>,
    columns: BTreeMap<I, f64>,
}

impl<I> RowBuilder<I>
where
    I: num::PrimInt,
{
    pub fn set_upper(&mut self, upper: f64) {
        self.upper = Some(upper);
    }

    pub fn set_lower(&mut self, lower: f64) {
        self.lower = lower;
    }

    pub fn set_equal(&mut self, value: f64) {
        self.lower = value;
        self.upper = Some(value);
    }

    /// Add an element to the row.
    ///
    /// If the column already exists `value` is added to the coefficient.
    pub fn add_element(&mut self, column: I, value: f64) {
        if !value.is_finite() {
            panic!("row coefficient is non-finite");
        }
        *self.columns.entry(column).or_insert(0.0) += value;
    }
}

/// Row-at-a-time builder producing the final [`Lp`].
pub struct LpBuilder<I> {
    f64_max: f64,
    col_lower: Vec<f64>,
    col_upper: Vec<f64>,
    rows: Vec<RowBuilder<I>>,
    fixed_rows: Vec<RowBuilder<I>>,
}

impl<I> Default for LpBuilder<I>
where
    I: num::PrimInt,
{
    fn default() -> Self {
        Self {
            f64_max: 1e30,
            col_lower: Vec::new(),
            col_upper: Vec::new(),
            rows: Vec::new(),
            fixed_rows: Vec::new(),
        }
    }
}

impl<I> LpBuilder<I>
where
    I: num::PrimInt + Debug,
{
    pub fn add_column(&mut self, bounds: Bounds) -> I {
        let (lb, ub) = match bounds {
            Bounds::Free => (-self.f64_max, self.f64_max),
            Bounds::Lower(lb) => (lb, self.f64_max),
            Bounds::Double(lb, ub) => (lb, ub),
            Bounds::Fixed(value) => (value, value),
        };
        self.col_lower.push(lb);
        self.col_upper.push(ub);
        I::from(self.col_lower.len() - 1).unwrap()
    }

    /// Add a structural row that never changes after the build.
    pub fn add_fixed_row(&mut self, row: RowBuilder<I>) {
        self.fixed_rows.push(row);
    }

    /// Add a refreshable row and return its index among variable rows.
    pub fn add_variable_row(&mut self, row: RowBuilder<I>) -> usize {
        self.rows.push(row);
        self.rows.len() - 1
    }

    pub fn num_cols(&self) -> usize {
        self.col_lower.len()
    }

    /// Build the final sparse form; variable rows first so their indices
    /// from [`LpBuilder::add_variable_row`] stay valid.
    pub fn build(self) -> Lp<I> {
        let ncols = self.col_lower.len();
        let nrows = self.rows.len() + self.fixed_rows.len();
        let mut row_lower = Vec::with_capacity(nrows);
        let mut row_upper = Vec::with_capacity(nrows);
        let mut row_mask = Vec::with_capacity(nrows);
        let mut row_starts = vec![I::zero()];
        let mut columns = Vec::with_capacity(nrows);
        let mut elements = Vec::with_capacity(nrows);

        for (rows, mask) in [(self.rows, I::one()), (self.fixed_rows, I::zero())] {
            for row in rows {
                row_lower.push(row.lower);
                row_upper.push(row.upper.unwrap_or(self.f64_max));
                row_mask.push(mask);
                let prev_start = *row_starts.last().unwrap();
                row_starts.push(prev_start + I::from(row.columns.len()).unwrap());
                for (column, value) in row.columns {
                    columns.push(column);
                    elements.push(value);
                }
            }
        }

        Lp {
            f64_max: self.f64_max,
            col_lower: self.col_lower,
            col_upper: self.col_upper,
            col_obj_coef: vec![0.0; ncols],
            row_lower,
            row_upper,
            row_mask,
            row_starts,
            columns,
            elements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_preserves_variable_row_order() {
        let mut builder: LpBuilder<usize> = LpBuilder::default();
        let x = builder.add_column(Bounds::Lower(0.0));
        let y = builder.add_column(Bounds::Double(0.0, 2.0));

        let mut fixed = RowBuilder::default();
        fixed.add_element(x, 1.0);
        fixed.add_element(y, -1.0);
        fixed.set_equal(0.0);
        builder.add_fixed_row(fixed);

        let mut variable = RowBuilder::default();
        variable.add_element(x, 1.0);
        variable.set_upper(5.0);
        let row = builder.add_variable_row(variable);
        assert_eq!(row, 0);

        let lp = builder.build();
        assert_eq!(lp.num_rows(), 2);
        // Variable rows come first.
        assert_eq!(lp.row_upper[0], 5.0);
        assert_eq!(lp.row_lower[1], 0.0);
        assert_eq!(lp.row_upper[1], 0.0);
    }

    #[test]
    fn refresh_cycle_resets_and_tightens() {
        let mut builder: LpBuilder<usize> = LpBuilder::default();
        let x = builder.add_column(Bounds::Lower(0.0));
        let mut row = RowBuilder::default();
        row.add_element(x, 2.0);
        let id = builder.add_variable_row(row);
        let mut lp = builder.build();

        lp.reset_variable_row_bounds();
        lp.apply_row_bounds(id, 0.0, 10.0);
        lp.apply_row_bounds(id, 1.0, 20.0); // tighter lower, looser upper
        assert_eq!(lp.row_lower[id], 1.0);
        assert_eq!(lp.row_upper[id], 10.0);

        lp.reset_variable_row_bounds();
        assert!(lp.row_upper[id] > 1e29);
    }

    #[test]
    fn coefficient_updates_respect_pattern() {
        let mut builder: LpBuilder<usize> = LpBuilder::default();
        let x = builder.add_column(Bounds::Lower(0.0));
        let y = builder.add_column(Bounds::Lower(0.0));
        let mut row = RowBuilder::default();
        row.add_element(x, 1.0);
        row.add_element(y, 0.0);
        let id = builder.add_variable_row(row);
        let mut lp = builder.build();

        lp.set_coefficient(id, y, 3.5);
        lp.apply_row_bounds(id, 7.0, 7.0);

        // x + 3.5 y = 7, minimize x → x = 0, y = 2.
        lp.zero_obj_coefficients();
        lp.add_obj_coefficient(x, 1.0);
        let (problem, variables) = lp.to_problem(&[]);
        let solution = problem.solve().unwrap();
        assert!((solution.var_value(variables[x]) - 0.0).abs() < 1e-9);
        assert!((solution.var_value(variables[y]) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pinned_rows_constrain_later_stages() {
        let mut builder: LpBuilder<usize> = LpBuilder::default();
        let x = builder.add_column(Bounds::Double(0.0, 4.0));
        let y = builder.add_column(Bounds::Double(0.0, 4.0));
        let mut row = RowBuilder::default();
        row.add_element(x, 1.0);
        row.add_element(y, 1.0);
        row.set_lower(4.0);
        builder.add_fixed_row(row);
        let mut lp = builder.build();

        // Stage 1: minimize x → x = 0, y = 4.
        lp.zero_obj_coefficients();
        lp.add_obj_coefficient(x, 1.0);
        let (problem, variables) = lp.to_problem(&[]);
        let solution = problem.solve().unwrap();
        let achieved = *solution.var_value(variables[x]);
        assert!(achieved.abs() < 1e-9);

        // Stage 2: minimize y subject to x staying at its achieved value.
        lp.zero_obj_coefficients();
        lp.add_obj_coefficient(y, 1.0);
        let pins = vec![(vec![(x, 1.0)], achieved + 1e-9)];
        let (problem, variables) = lp.to_problem(&pins);
        let solution = problem.solve().unwrap();
        assert!((solution.var_value(variables[y]) - 4.0).abs() < 1e-6);
    }
}
