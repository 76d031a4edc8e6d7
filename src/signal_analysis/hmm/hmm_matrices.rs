use std::ops::{Index, IndexMut};

use thiserror::Error;

use super::state::*;

// Allowed deviation of a probability row sum from 1
const SUM_MARGIN: f64 = 1e-4;

pub trait ProbabilityMatrix {
    fn validate(&self) -> Result<(), MatrixValidationError>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatrixValidationError {
    #[error("transition matrix is not square")]
    IncorrectShape,
    #[error("start probabilities do not sum to 1: {values:?}")]
    VectorIncorrectValues { values: Vec<f64> },
    #[error("rows {rows:?} do not sum to 1")]
    RowsIncorrectValues { rows: Vec<usize> },
    #[error("matrix is empty")]
    MatrixEmpty,
    #[error("rows {rows:?} are all zero")]
    RowsEmpty { rows: Vec<usize> },
    #[error("probability outside [0, 1]")]
    InvalidValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartMatrix {
    pub matrix: Vec<f64>,
}

impl StartMatrix {
    pub fn new(matrix: Vec<f64>) -> Self {
        Self { matrix }
    }

    pub fn new_balanced(num_states: usize) -> Self {
        Self { matrix: vec![1.0 / num_states as f64; num_states] }
    }

    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }
}

impl ProbabilityMatrix for StartMatrix {
    fn validate(&self) -> Result<(), MatrixValidationError> {
        if self.matrix.is_empty() {
            return Err(MatrixValidationError::MatrixEmpty);
        }
        if self.matrix.iter().any(|v| !(0.0..=1.0 + SUM_MARGIN).contains(v)) {
            return Err(MatrixValidationError::InvalidValue);
        }

        let sum: f64 = self.matrix.iter().sum();
        if (sum - 1.0).abs() > SUM_MARGIN {
            return Err(MatrixValidationError::VectorIncorrectValues { values: self.matrix.clone() });
        }

        Ok(())
    }
}

impl<T: IDTarget> Index<T> for StartMatrix {
    type Output = f64;

    fn index(&self, index: T) -> &Self::Output {
        &self.matrix[index.get_id()]
    }
}

impl<T: IDTarget> IndexMut<T> for StartMatrix {
    fn index_mut(&mut self, index: T) -> &mut Self::Output {
        &mut self.matrix[index.get_id()]
    }
}

/// Row-stochastic matrix, `matrix[from][to]`
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    pub matrix: Vec<Vec<f64>>,
}

impl TransitionMatrix {
    pub fn new(matrix: Vec<Vec<f64>>) -> Self {
        Self { matrix }
    }

    pub fn new_balanced(num_states: usize) -> Self {
        Self { matrix: vec![vec![1.0 / num_states as f64; num_states]; num_states] }
    }

    pub fn empty(num_states: usize) -> Self {
        Self { matrix: vec![vec![0.0; num_states]; num_states] }
    }

    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }
}

impl ProbabilityMatrix for TransitionMatrix {
    fn validate(&self) -> Result<(), MatrixValidationError> {
        if self.matrix.is_empty() {
            return Err(MatrixValidationError::MatrixEmpty);
        }
        if self.matrix.iter().any(|row| row.len() != self.matrix.len()) {
            return Err(MatrixValidationError::IncorrectShape);
        }

        let mut empty_rows = Vec::new();
        let mut incorrect_rows = Vec::new();

        for (i, row) in self.matrix.iter().enumerate() {
            if row.iter().any(|v| !(0.0..=1.0 + SUM_MARGIN).contains(v)) {
                return Err(MatrixValidationError::InvalidValue);
            }

            if row.iter().all(|v| *v == 0.0) {
                empty_rows.push(i);
            } else if (row.iter().sum::<f64>() - 1.0).abs() > SUM_MARGIN {
                incorrect_rows.push(i);
            }
        }

        if empty_rows.len() == self.matrix.len() {
            return Err(MatrixValidationError::MatrixEmpty);
        }
        if !empty_rows.is_empty() {
            return Err(MatrixValidationError::RowsEmpty { rows: empty_rows });
        }
        if !incorrect_rows.is_empty() {
            return Err(MatrixValidationError::RowsIncorrectValues { rows: incorrect_rows });
        }

        Ok(())
    }
}

impl<T: IDTarget> Index<(T, T)> for TransitionMatrix {
    type Output = f64;

    fn index(&self, index: (T, T)) -> &Self::Output {
        &self.matrix[index.0.get_id()][index.1.get_id()]
    }
}

impl<T: IDTarget> IndexMut<(T, T)> for TransitionMatrix {
    fn index_mut(&mut self, index: (T, T)) -> &mut Self::Output {
        &mut self.matrix[index.0.get_id()][index.1.get_id()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_matrices_are_valid() {
        assert!(StartMatrix::new_balanced(3).validate().is_ok());
        assert!(TransitionMatrix::new_balanced(3).validate().is_ok());
    }

    // Test the failure modes of transition matrix validation
    #[test]
    fn test_transition_matrix_validation() {
        let not_square = TransitionMatrix::new(vec![vec![0.5, 0.5], vec![1.0]]);
        assert_eq!(not_square.validate(), Err(MatrixValidationError::IncorrectShape));

        let empty_row = TransitionMatrix::new(vec![vec![0.5, 0.5], vec![0.0, 0.0]]);
        assert_eq!(empty_row.validate(), Err(MatrixValidationError::RowsEmpty { rows: vec![1] }));

        let bad_sum = TransitionMatrix::new(vec![vec![0.5, 0.4], vec![0.3, 0.7]]);
        assert_eq!(bad_sum.validate(), Err(MatrixValidationError::RowsIncorrectValues { rows: vec![0] }));

        let negative = TransitionMatrix::new(vec![vec![1.5, -0.5], vec![0.3, 0.7]]);
        assert_eq!(negative.validate(), Err(MatrixValidationError::InvalidValue));
    }

    // Test indexing by id and by state
    #[test]
    fn test_indexing() {
        let mut transition_matrix = TransitionMatrix::empty(2);
        transition_matrix[(0_usize, 1_usize)] = 0.25;
        assert_eq!(transition_matrix.matrix[0][1], 0.25);

        let state = State::new_1d(1, 0.0, 1.0).unwrap();
        let start_matrix = StartMatrix::new(vec![0.3, 0.7]);
        assert_eq!(start_matrix[&state], 0.7);
    }
}
