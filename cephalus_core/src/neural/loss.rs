//! Loss functions over [`Var`]s.

use crate::error::KernelResult;
use crate::tensor::Var;

/// Mean squared error. Gradient flows into both arguments; detach `target`
/// to train only the prediction.
pub fn mse_loss(predicted: &Var, target: &Var) -> KernelResult<Var> {
    Ok(predicted.sub(target)?.square().mean())
}

/// Squared error summed over elements.
pub fn sum_squared_error(predicted: &Var, target: &Var) -> KernelResult<Var> {
    Ok(predicted.sub(target)?.square().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mse_loss() {
        let predicted = Var::vector(array![1.0, 2.0, 3.0]);
        let target = Var::vector(array![1.0, 0.0, 0.0]);
        let loss = mse_loss(&predicted, &target).unwrap().scalar().unwrap();
        assert!((loss - 13.0 / 3.0).abs() < 1e-6);
        let sse = sum_squared_error(&predicted, &target).unwrap();
        assert_eq!(sse.scalar().unwrap(), 13.0);
    }

    #[test]
    fn test_mse_shape_mismatch() {
        let predicted = Var::vector(array![1.0, 2.0]);
        let target = Var::vector(array![1.0]);
        assert!(mse_loss(&predicted, &target).is_err());
    }
}
