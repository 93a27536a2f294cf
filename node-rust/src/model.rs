//! Reference compute collaborator: a small tanh network over synthetic rows.
//!
//! Row `i` of the dataset is a deterministic pseudo-random feature vector
//! derived from `(seed, i)`, so every node with the same model file agrees
//! on the data without shipping it. Parameters are stored per layer as
//! `[weights, biases, ...]`, weights laid out `fan_in × fan_out`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use tessera_protocol::{check_shape, Model, ModelError, RangeSet, Tensor};

/// On-disk description of a [`ProjectionModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub input_dim: usize,
    pub hidden: Vec<usize>,
    pub seed: u64,
    /// Trained parameters; initialized from `seed` when absent.
    #[serde(default)]
    pub parameters: Option<Vec<Tensor>>,
}

/// Simple PRNG for reproducible rows and initial weights.
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Rng { state: seed.wrapping_add(1) }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform in [-1, 1).
    fn symmetric(&mut self) -> f32 {
        let u = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        (2.0 * u - 1.0) as f32
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionModel {
    seed: u64,
    input_dim: usize,
    /// (fan_in, fan_out) per layer; the last layer has one output.
    layer_dims: Vec<(usize, usize)>,
    parameters: Vec<Tensor>,
}

impl ProjectionModel {
    pub fn new(input_dim: usize, hidden: &[usize], seed: u64) -> Self {
        let mut dims = Vec::new();
        let mut prev = input_dim;
        for &h in hidden {
            dims.push((prev, h));
            prev = h;
        }
        dims.push((prev, 1));

        let mut rng = Rng::new(seed ^ 0x5eed);
        let parameters = dims
            .iter()
            .flat_map(|&(fan_in, fan_out)| {
                let scale = 1.0 / (fan_in as f32).sqrt();
                let weights: Tensor = (0..fan_in * fan_out).map(|_| rng.symmetric() * scale).collect();
                [weights, vec![0.0; fan_out]]
            })
            .collect();

        Self {
            seed,
            input_dim,
            layer_dims: dims,
            parameters,
        }
    }

    pub fn from_file(file: ModelFile) -> Result<Self, ModelError> {
        if file.input_dim == 0 || file.hidden.contains(&0) {
            return Err(ModelError::Load("layer sizes must be non-zero".into()));
        }
        let mut model = Self::new(file.input_dim, &file.hidden, file.seed);
        if let Some(parameters) = file.parameters {
            model.load_parameters(&parameters)?;
        }
        Ok(model)
    }

    /// Read a model description from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, ModelError> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;
        let file: ModelFile =
            serde_json::from_str(&data).map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;
        Self::from_file(file)
    }

    /// Features of one dataset row.
    pub fn row(&self, index: u64) -> Vec<f32> {
        let mut rng = Rng::new(self.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ index);
        (0..self.input_dim).map(|_| rng.symmetric()).collect()
    }

    /// Training label of one dataset row: a fixed tanh projection of its
    /// features, so the network has something learnable to fit.
    pub fn target(&self, index: u64) -> f32 {
        let mut rng = Rng::new(self.seed ^ 0x7a26_e7a2);
        self.row(index)
            .iter()
            .map(|x| x * rng.symmetric())
            .sum::<f32>()
            .tanh()
    }

    /// Input features followed by each layer's output.
    fn activations(&self, features: Vec<f32>) -> Vec<Vec<f32>> {
        let mut layers = vec![features];
        for (layer, &(fan_in, fan_out)) in self.layer_dims.iter().enumerate() {
            let weights = &self.parameters[2 * layer];
            let biases = &self.parameters[2 * layer + 1];
            let x = &layers[layer];
            let mut out = biases.clone();
            for (j, o) in out.iter_mut().enumerate() {
                for (i, xi) in x.iter().enumerate().take(fan_in) {
                    *o += xi * weights[i * fan_out + j];
                }
            }
            if layer + 1 < self.layer_dims.len() {
                for v in &mut out {
                    *v = v.tanh();
                }
            }
            layers.push(out);
        }
        layers
    }

    fn predict(&self, features: Vec<f32>) -> f32 {
        self.activations(features)
            .last()
            .and_then(|out| out.first().copied())
            .unwrap_or(0.0)
    }
}

impl Model for ProjectionModel {
    fn forward(&self, inputs: &RangeSet) -> Result<Vec<f32>, ModelError> {
        Ok(inputs.indices().map(|i| self.predict(self.row(i))).collect())
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.parameters.clone()
    }

    fn load_parameters(&mut self, parameters: &[Tensor]) -> Result<(), ModelError> {
        check_shape(&self.parameters, parameters)?;
        if parameters.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ModelError::Load("non-finite parameter".into()));
        }
        self.parameters = parameters.to_vec();
        Ok(())
    }

    /// Mean squared error against [`ProjectionModel::target`], by backprop.
    fn loss_and_gradients(&self, inputs: &RangeSet) -> Result<(f64, Vec<Tensor>), ModelError> {
        if inputs.is_empty() {
            return Err(ModelError::Compute("no rows to train on".into()));
        }
        let n = inputs.len() as f32;
        let mut gradients: Vec<Tensor> = self.parameters.iter().map(|t| vec![0.0; t.len()]).collect();
        let mut loss = 0.0f64;

        for index in inputs.indices() {
            let layers = self.activations(self.row(index));
            let output = layers.last().and_then(|out| out.first().copied()).unwrap_or(0.0);
            let err = output - self.target(index);
            loss += f64::from(err * err);

            let mut delta = vec![2.0 * err / n];
            for (layer, &(fan_in, fan_out)) in self.layer_dims.iter().enumerate().rev() {
                let input = &layers[layer];
                for (j, d) in delta.iter().enumerate() {
                    gradients[2 * layer + 1][j] += d;
                    for (i, x) in input.iter().enumerate().take(fan_in) {
                        gradients[2 * layer][i * fan_out + j] += x * d;
                    }
                }
                if layer > 0 {
                    // inputs of hidden layers are tanh outputs
                    let weights = &self.parameters[2 * layer];
                    delta = input
                        .iter()
                        .enumerate()
                        .map(|(i, a)| {
                            let back: f32 = delta.iter().enumerate().map(|(j, d)| weights[i * fan_out + j] * d).sum();
                            back * (1.0 - a * a)
                        })
                        .collect();
                }
            }
        }
        Ok((loss / inputs.len() as f64, gradients))
    }

    /// Plain SGD.
    fn optimizer_step(&mut self, gradients: &[Tensor], learning_rate: f64) -> Result<(), ModelError> {
        check_shape(&self.parameters, gradients)?;
        let lr = learning_rate as f32;
        for (p, g) in self.parameters.iter_mut().zip(gradients) {
            for (p, g) in p.iter_mut().zip(g) {
                *p -= lr * g;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::train_step;

    #[test]
    fn same_seed_same_outputs() {
        let a = ProjectionModel::new(8, &[16], 42);
        let b = ProjectionModel::new(8, &[16], 42);
        let rows = RangeSet::from_indices([0, 5, 6, 7, 900]);
        let out = a.forward(&rows).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out, b.forward(&rows).unwrap());
        assert!(out.iter().all(|v| v.is_finite()));

        let other = ProjectionModel::new(8, &[16], 43);
        assert_ne!(out, other.forward(&rows).unwrap());
    }

    #[test]
    fn parameter_layout_is_enforced() {
        let mut model = ProjectionModel::new(4, &[3], 1);
        let shape: Vec<usize> = model.parameters().iter().map(Vec::len).collect();
        assert_eq!(shape, vec![12, 3, 3, 1]);

        assert!(matches!(model.load_parameters(&[vec![0.0; 12]]), Err(ModelError::Shape { .. })));
        let zeros: Vec<Tensor> = shape.iter().map(|n| vec![0.0; *n]).collect();
        model.load_parameters(&zeros).unwrap();
        assert_eq!(model.forward(&RangeSet::full(3)).unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn sgd_moves_against_the_gradient() {
        let mut model = ProjectionModel::new(2, &[], 7);
        let before = model.parameters();
        let grads: Vec<Tensor> = before.iter().map(|t| vec![1.0; t.len()]).collect();
        model.optimizer_step(&grads, 0.5).unwrap();
        for (b, a) in before.iter().flatten().zip(model.parameters().iter().flatten()) {
            assert!((b - 0.5 - a).abs() < 1e-6);
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        let model = ProjectionModel::new(3, &[4], 11);
        let rows = RangeSet::full(6);
        let (_, grads) = model.loss_and_gradients(&rows).unwrap();

        let eps = 1e-2f32;
        for (t, k) in [(0, 0), (0, 7), (1, 2), (2, 3), (3, 0)] {
            let loss_at = |delta: f32| {
                let mut params = model.parameters();
                params[t][k] += delta;
                let mut shifted = model.clone();
                shifted.load_parameters(&params).unwrap();
                shifted.loss_and_gradients(&rows).unwrap().0
            };
            let numeric = (loss_at(eps) - loss_at(-eps)) / (2.0 * f64::from(eps));
            let analytic = f64::from(grads[t][k]);
            assert!((numeric - analytic).abs() < 1e-3 + 1e-2 * analytic.abs(), "param {t}/{k}: {numeric} vs {analytic}");
        }
    }

    #[test]
    fn training_fits_the_targets() {
        let mut model = ProjectionModel::new(4, &[8], 5);
        let rows = RangeSet::full(32);
        let first = train_step(&mut model, &rows, 0.2).unwrap();
        let mut last = first;
        for _ in 0..400 {
            last = train_step(&mut model, &rows, 0.2).unwrap();
        }
        assert!(last < first * 0.5, "loss went from {first} to {last}");
        assert!(model.loss_and_gradients(&RangeSet::new()).is_err());
    }

    #[tokio::test]
    async fn missing_file_is_a_load_error() {
        let err = ProjectionModel::load(Path::new("/nonexistent/model.json")).await.unwrap_err();
        assert!(matches!(err, ModelError::Load(_)));
    }
}
