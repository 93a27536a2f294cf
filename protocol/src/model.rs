use std::sync::Arc;
use tokio::sync::RwLock;

use crate::ranges::RangeSet;
use crate::types::Tensor;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("parameter layout mismatch: expected {expected:?}, got {found:?}")]
    Shape { expected: Vec<usize>, found: Vec<usize> },
    #[error("compute failed: {0}")]
    Compute(String),
}

/// The compute collaborator. Parameters are opaque flat tensors to the
/// coordination layer; it only ever averages them.
pub trait Model: Send + Sync {
    /// One output per dataset row in `inputs`, in index order.
    fn forward(&self, inputs: &RangeSet) -> Result<Vec<f32>, ModelError>;

    fn parameters(&self) -> Vec<Tensor>;

    /// Replace the parameters, e.g. after an averaging round.
    fn load_parameters(&mut self, parameters: &[Tensor]) -> Result<(), ModelError>;

    /// Mean loss over the rows in `inputs` and its gradient, laid out like
    /// [`Model::parameters`]. Models that only serve inference keep the
    /// default.
    fn loss_and_gradients(&self, inputs: &RangeSet) -> Result<(f64, Vec<Tensor>), ModelError> {
        let _ = inputs;
        Err(ModelError::Compute("model does not train".into()))
    }

    fn optimizer_step(&mut self, gradients: &[Tensor], learning_rate: f64) -> Result<(), ModelError>;
}

/// One local training step on `inputs`. Returns the loss before the step.
pub fn train_step(model: &mut dyn Model, inputs: &RangeSet, learning_rate: f64) -> Result<f64, ModelError> {
    let (loss, gradients) = model.loss_and_gradients(inputs)?;
    if !loss.is_finite() || gradients.iter().flatten().any(|g| !g.is_finite()) {
        return Err(ModelError::Compute("non-finite loss or gradient".into()));
    }
    model.optimizer_step(&gradients, learning_rate)?;
    Ok(loss)
}

/// One model instance, read by the evaluation loop and the peer-facing
/// server, written by averaging.
pub type SharedModel = Arc<RwLock<Box<dyn Model>>>;

pub fn shared_model(model: impl Model + 'static) -> SharedModel {
    Arc::new(RwLock::new(Box::new(model)))
}

/// Layout check shared by implementations of [`Model::load_parameters`].
pub fn check_shape(expected: &[Tensor], found: &[Tensor]) -> Result<(), ModelError> {
    let expected: Vec<usize> = expected.iter().map(Vec::len).collect();
    let found: Vec<usize> = found.iter().map(Vec::len).collect();
    if expected != found {
        return Err(ModelError::Shape { expected, found });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `y = w` for every row, trained towards `target`.
    struct Constant {
        w: f32,
        target: f32,
    }

    impl Model for Constant {
        fn forward(&self, inputs: &RangeSet) -> Result<Vec<f32>, ModelError> {
            Ok(vec![self.w; inputs.len() as usize])
        }

        fn parameters(&self) -> Vec<Tensor> {
            vec![vec![self.w]]
        }

        fn load_parameters(&mut self, parameters: &[Tensor]) -> Result<(), ModelError> {
            check_shape(&self.parameters(), parameters)?;
            self.w = parameters[0][0];
            Ok(())
        }

        fn loss_and_gradients(&self, _inputs: &RangeSet) -> Result<(f64, Vec<Tensor>), ModelError> {
            let err = self.w - self.target;
            Ok((f64::from(err * err), vec![vec![2.0 * err]]))
        }

        fn optimizer_step(&mut self, gradients: &[Tensor], learning_rate: f64) -> Result<(), ModelError> {
            self.w -= learning_rate as f32 * gradients[0][0];
            Ok(())
        }
    }

    struct InferenceOnly;

    impl Model for InferenceOnly {
        fn forward(&self, inputs: &RangeSet) -> Result<Vec<f32>, ModelError> {
            Ok(vec![0.0; inputs.len() as usize])
        }

        fn parameters(&self) -> Vec<Tensor> {
            Vec::new()
        }

        fn load_parameters(&mut self, _parameters: &[Tensor]) -> Result<(), ModelError> {
            Ok(())
        }

        fn optimizer_step(&mut self, _gradients: &[Tensor], _learning_rate: f64) -> Result<(), ModelError> {
            Ok(())
        }
    }

    #[test]
    fn train_step_reports_loss_before_the_update() {
        let mut model = Constant { w: 3.0, target: 1.0 };
        let rows = RangeSet::full(4);
        assert_eq!(train_step(&mut model, &rows, 0.25).unwrap(), 4.0);
        assert_eq!(model.w, 2.0);
        assert_eq!(train_step(&mut model, &rows, 0.25).unwrap(), 1.0);
    }

    #[test]
    fn non_finite_updates_are_refused() {
        let mut model = Constant { w: f32::INFINITY, target: 0.0 };
        let err = train_step(&mut model, &RangeSet::full(1), 0.1).unwrap_err();
        assert!(matches!(err, ModelError::Compute(_)));
        assert_eq!(model.w, f32::INFINITY);

        let err = train_step(&mut InferenceOnly, &RangeSet::full(1), 0.1).unwrap_err();
        assert!(matches!(err, ModelError::Compute(_)));
    }
}
