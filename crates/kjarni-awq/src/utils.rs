//! Small numeric helpers shared by the search passes and tests.

use ndarray::{Array1, ArrayBase, ArrayView2, Axis, Data, Dimension};

/// Mean of `|x|` over rows, one value per column.
pub fn mean_abs_columns(x: &ArrayView2<f32>) -> Array1<f32> {
    let rows = x.nrows().max(1) as f32;
    x.mapv(f32::abs).sum_axis(Axis(0)) / rows
}

/// Mean squared difference, accumulated in f64.
pub fn mse<S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> f64
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    sum / a.len() as f64
}

/// Cosine similarity of two tensors viewed as flat vectors.
pub fn cosine_similarity<S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> f64
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_helpers() {
        let a = arr2(&[[1.0f32, -2.0], [3.0, 0.0]]);
        let b = arr2(&[[1.0f32, -2.0], [1.0, 0.0]]);
        assert_eq!(mean_abs_columns(&a.view()).to_vec(), vec![2.0, 1.0]);
        assert_abs_diff_eq!(mse(&a, &b), 1.0);
        assert_abs_diff_eq!(cosine_similarity(&a, &a), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cosine_similarity(&a, &a.mapv(|v| -v)), -1.0, epsilon = 1e-12);
    }
}
