//! Helpers over gradient lists returned by [`GradientTape::gradient`](super::GradientTape::gradient).

use ndarray::{Array1, ArrayD};

/// Gradient per weight; `None` when the weight did not reach the loss.
pub type Gradients = Vec<Option<ArrayD<f32>>>;

/// L2 norm over every present gradient taken together. Accumulated in `f64`
/// so that finite gradients never produce an infinite norm.
pub fn global_norm(grads: &[Option<ArrayD<f32>>]) -> f32 {
    global_norm_f64(grads) as f32
}

fn global_norm_f64(grads: &[Option<ArrayD<f32>>]) -> f64 {
    grads
        .iter()
        .flatten()
        .flat_map(|grad| grad.iter())
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt()
}

/// Rescales all gradients together so their global norm is at most
/// `max_norm`. Returns the norm before clipping, which saturates at
/// `f32::MAX`.
pub fn clip_by_global_norm(grads: &mut [Option<ArrayD<f32>>], max_norm: f32) -> f32 {
    let norm = global_norm_f64(grads);
    if norm > f64::from(max_norm) && norm > 0.0 {
        let factor = f64::from(max_norm) / norm;
        for grad in grads.iter_mut().flatten() {
            grad.mapv_inplace(|v| (f64::from(v) * factor) as f32);
        }
    }
    norm.min(f64::from(f32::MAX)) as f32
}

pub fn has_non_finite(grads: &[Option<ArrayD<f32>>]) -> bool {
    grads
        .iter()
        .flatten()
        .any(|grad| grad.iter().any(|v| !v.is_finite()))
}

/// Element-wise mean of equally sized vectors. `None` for an empty slice.
pub fn mean_of(vectors: &[Array1<f32>]) -> Option<Array1<f32>> {
    let (first, rest) = vectors.split_first()?;
    let mut total = first.clone();
    for vector in rest {
        total += vector;
    }
    Some(total / vectors.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_clip_survives_squared_overflow() {
        let mut grads = vec![Some(array![3.0e30f32, 4.0e30].into_dyn())];
        let norm = clip_by_global_norm(&mut grads, 1.0);
        assert!(norm.is_finite());
        assert!((norm / 5.0e30 - 1.0).abs() < 1e-5);
        let clipped = grads[0].as_ref().unwrap();
        assert!((clipped[[0]] - 0.6).abs() < 1e-5);
        assert!((clipped[[1]] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_clip_preserves_direction() {
        let mut grads = vec![Some(array![3.0f32].into_dyn()), None, Some(array![4.0f32].into_dyn())];
        let norm = clip_by_global_norm(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((global_norm(&grads) - 1.0).abs() < 1e-6);
        let a = grads[0].as_ref().unwrap()[[0]];
        let b = grads[2].as_ref().unwrap()[[0]];
        assert!((a / b - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_small_gradients_untouched() {
        let mut grads = vec![Some(array![0.1f32, 0.2].into_dyn())];
        clip_by_global_norm(&mut grads, 1.0);
        assert_eq!(grads[0].as_ref().unwrap(), &array![0.1f32, 0.2].into_dyn());
    }

    #[test]
    fn test_non_finite_detection() {
        assert!(has_non_finite(&[Some(array![f32::NAN].into_dyn())]));
        assert!(!has_non_finite(&[None, Some(array![1.0f32].into_dyn())]));
    }

    #[test]
    fn test_mean_of_vectors() {
        let mean = mean_of(&[array![1.0f32, 2.0], array![3.0, 4.0]]).unwrap();
        assert_eq!(mean, array![2.0f32, 3.0]);
        assert!(mean_of(&[]).is_none());
    }
}
