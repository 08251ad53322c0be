//! Dense user-course interaction matrix with stable index orderings.

use std::collections::BTreeSet;

use crate::scoring::BehaviorAggregate;

/// `|U| x |C|` matrix of summed action values, rows = users, columns =
/// courses. User and course indices follow ascending id order so repeated
/// builds over the same log produce identical layouts.
pub struct UserItemMatrix {
    pub user_ids: Vec<i64>,
    pub course_ids: Vec<i64>,
    values: Vec<f64>,
}

impl UserItemMatrix {
    /// Aggregate `(user, course) -> Σ action_value` rows into a dense matrix.
    pub fn build(rows: &[BehaviorAggregate]) -> Self {
        let user_ids: Vec<i64> = rows
            .iter()
            .map(|r| r.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let course_ids: Vec<i64> = rows
            .iter()
            .map(|r| r.course_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut values = vec![0.0; user_ids.len() * course_ids.len()];
        for row in rows {
            // Binary search is safe: the id lists are sorted and complete.
            let u = user_ids.binary_search(&row.user_id).unwrap();
            let c = course_ids.binary_search(&row.course_id).unwrap();
            values[u * course_ids.len() + c] += row.total_weight;
        }

        Self {
            user_ids,
            course_ids,
            values,
        }
    }

    pub fn user_count(&self) -> usize {
        self.user_ids.len()
    }

    pub fn course_count(&self) -> usize {
        self.course_ids.len()
    }

    pub fn get(&self, user_idx: usize, course_idx: usize) -> f64 {
        self.values[user_idx * self.course_ids.len() + course_idx]
    }

    /// Cosine similarity between two course columns.
    pub fn column_cosine(&self, a: usize, b: usize) -> f64 {
        let mut dot = 0.0;
        let mut norm_a = 0.0;
        let mut norm_b = 0.0;
        for u in 0..self.user_count() {
            let va = self.get(u, a);
            let vb = self.get(u, b);
            dot += va * vb;
            norm_a += va * va;
            norm_b += vb * vb;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }

    /// Full `|C| x |C|` course-course cosine similarity matrix.
    pub fn course_cosine_matrix(&self) -> Vec<Vec<f64>> {
        let n = self.course_count();
        let mut sim = vec![vec![0.0; n]; n];
        for i in 0..n {
            sim[i][i] = 1.0;
            for j in (i + 1)..n {
                let s = self.column_cosine(i, j);
                sim[i][j] = s;
                sim[j][i] = s;
            }
        }
        sim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(user_id: i64, course_id: i64, total_weight: f64) -> BehaviorAggregate {
        BehaviorAggregate {
            user_id,
            course_id,
            total_weight,
        }
    }

    #[test]
    fn build_sums_duplicate_pairs() {
        let rows = vec![agg(1, 10, 1.0), agg(1, 10, 3.0), agg(2, 11, 5.0)];
        let m = UserItemMatrix::build(&rows);
        assert_eq!(m.user_ids, vec![1, 2]);
        assert_eq!(m.course_ids, vec![10, 11]);
        assert_eq!(m.get(0, 0), 4.0);
        assert_eq!(m.get(1, 1), 5.0);
        assert_eq!(m.get(0, 1), 0.0);
    }

    #[test]
    fn index_order_is_stable_across_input_order() {
        let a = UserItemMatrix::build(&[agg(2, 20, 1.0), agg(1, 10, 1.0)]);
        let b = UserItemMatrix::build(&[agg(1, 10, 1.0), agg(2, 20, 1.0)]);
        assert_eq!(a.user_ids, b.user_ids);
        assert_eq!(a.course_ids, b.course_ids);
    }

    #[test]
    fn identical_columns_have_cosine_one() {
        let rows = vec![
            agg(1, 10, 2.0),
            agg(1, 11, 2.0),
            agg(2, 10, 3.0),
            agg(2, 11, 3.0),
        ];
        let m = UserItemMatrix::build(&rows);
        let sim = m.column_cosine(0, 1);
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn orthogonal_columns_have_cosine_zero() {
        let rows = vec![agg(1, 10, 2.0), agg(2, 11, 3.0)];
        let m = UserItemMatrix::build(&rows);
        assert_eq!(m.column_cosine(0, 1), 0.0);
    }

    #[test]
    fn zero_column_yields_zero_not_nan() {
        let rows = vec![agg(1, 10, 0.0), agg(1, 11, 2.0)];
        let m = UserItemMatrix::build(&rows);
        let sim = m.column_cosine(0, 1);
        assert_eq!(sim, 0.0);
        assert!(!sim.is_nan());
    }

    #[test]
    fn cosine_matrix_is_symmetric_with_unit_diagonal() {
        let rows = vec![
            agg(1, 10, 1.0),
            agg(1, 11, 2.0),
            agg(2, 11, 1.0),
            agg(2, 12, 4.0),
        ];
        let m = UserItemMatrix::build(&rows);
        let sim = m.course_cosine_matrix();
        for i in 0..3 {
            assert_eq!(sim[i][i], 1.0);
            for j in 0..3 {
                assert!((sim[i][j] - sim[j][i]).abs() < 1e-12);
            }
        }
    }
}
