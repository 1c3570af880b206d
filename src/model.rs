use burn::{
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
};
use jetstream::record::{Batch, GroupShape};
use jetstream::schema::{FeatureGroup, FeatureSchema};

/// SELU constants (Klambauer et al. 2017).
const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;

/// `scale * (max(0, x) + min(0, alpha * (exp(x) - 1)))`
pub fn selu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let positive = x.clone().clamp_min(0.0);
    let negative = x.clamp_max(0.0).exp().sub_scalar(1.0).mul_scalar(SELU_ALPHA);
    (positive + negative).mul_scalar(SELU_SCALE)
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// Number of truth classes (output width).
    pub num_classes: usize,
    /// Number of global jet variables.
    pub num_globals: usize,
    /// `[len, features]` of the charged candidate group.
    pub cpf: [usize; 2],
    /// `[len, features]` of the neutral candidate group.
    pub npf: [usize; 2],
    /// `[len, features]` of the secondary vertex group.
    pub sv: [usize; 2],

    #[config(default = "vec![32, 32, 8]")]
    pub cpf_widths: Vec<usize>,
    #[config(default = "vec![16, 16, 4]")]
    pub npf_widths: Vec<usize>,
    #[config(default = "vec![32, 32, 8]")]
    pub sv_widths: Vec<usize>,
    #[config(default = "vec![200, 100, 100]")]
    pub dense_widths: Vec<usize>,

    #[config(default = 0.1)]
    pub dropout: f64,
}

impl ClassifierConfig {
    /// Take every input width from a batch's shapes.
    pub fn for_batch(batch: &Batch) -> Self {
        let shape = |g: GroupShape| [g.len, g.features];
        Self::new(
            batch.num_classes,
            batch.num_globals,
            shape(batch.cpf_shape),
            shape(batch.npf_shape),
            shape(batch.sv_shape),
        )
    }

    pub fn for_schema(schema: &FeatureSchema) -> Self {
        let shape = |g: &FeatureGroup| [g.max, g.branches.len()];
        Self::new(
            schema.num_classes(),
            schema.globalvars.len(),
            shape(&schema.cpf),
            shape(&schema.npf),
            shape(&schema.sv),
        )
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> JetClassifier<B> {
        // Empty groups get no stack and contribute nothing to the dense input.
        let active = |[len, features]: [usize; 2], widths: &[usize]| {
            len > 0 && features > 0 && !widths.is_empty()
        };
        let mut width = self.num_globals;
        let mut group = |shape: [usize; 2], widths: &[usize]| {
            active(shape, widths).then(|| {
                width += shape[0] * widths[widths.len() - 1];
                PointwiseStack::new(device, shape[1], widths, self.dropout)
            })
        };
        let cpf = group(self.cpf, &self.cpf_widths);
        let npf = group(self.npf, &self.npf_widths);
        let sv = group(self.sv, &self.sv_widths);

        let mut dense = Vec::with_capacity(self.dense_widths.len());
        for &w in &self.dense_widths {
            dense.push(LinearConfig::new(width, w).init(device));
            width = w;
        }

        JetClassifier {
            cpf,
            npf,
            sv,
            dense,
            output: LinearConfig::new(width, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

/// Position-wise dense layers over a `[B, len, features]` group, i.e. a stack
/// of kernel-size-1 convolutions.
#[derive(Module, Debug)]
pub struct PointwiseStack<B: Backend> {
    layers: Vec<Linear<B>>,
    dropout: Dropout,
}

impl<B: Backend> PointwiseStack<B> {
    pub fn new(device: &B::Device, in_features: usize, widths: &[usize], dropout: f64) -> Self {
        let mut layers = Vec::with_capacity(widths.len());
        let mut d_in = in_features;
        for &w in widths {
            layers.push(LinearConfig::new(d_in, w).init(device));
            d_in = w;
        }
        Self {
            layers,
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    // x: [B, len, features] -> [B, len * out_features]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let mut x = x;
        for layer in &self.layers {
            x = self.dropout.forward(selu(layer.forward(x)));
        }
        x.flatten(1, 2)
    }
}

/// Input tensors for one batch.
#[derive(Debug, Clone)]
pub struct ClassifierInput<B: Backend> {
    pub globals: Tensor<B, 2>,
    pub cpf: Tensor<B, 3>,
    pub npf: Tensor<B, 3>,
    pub sv: Tensor<B, 3>,
}

impl<B: Backend> ClassifierInput<B> {
    pub fn from_batch(batch: &Batch, device: &B::Device) -> Self {
        let b = batch.batch_size;
        let group = |data: &[f32], shape: GroupShape| {
            Tensor::from_data(
                TensorData::new(data.to_vec(), [b, shape.len, shape.features]),
                device,
            )
        };
        Self {
            globals: Tensor::from_data(
                TensorData::new(batch.globalvars.clone(), [b, batch.num_globals]),
                device,
            ),
            cpf: group(&batch.cpf, batch.cpf_shape),
            npf: group(&batch.npf, batch.npf_shape),
            sv: group(&batch.sv, batch.sv_shape),
        }
    }
}

/// Jet flavour classifier: per-group point-wise stacks, flattened and joined
/// with the global variables, then a SELU MLP.
#[derive(Module, Debug)]
pub struct JetClassifier<B: Backend> {
    cpf: Option<PointwiseStack<B>>,
    npf: Option<PointwiseStack<B>>,
    sv: Option<PointwiseStack<B>>,
    dense: Vec<Linear<B>>,
    output: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> JetClassifier<B> {
    /// Output: unnormalised class logits `[B, K]`.
    pub fn forward(&self, input: ClassifierInput<B>) -> Tensor<B, 2> {
        let mut parts = vec![input.globals];
        for (stack, x) in [(&self.cpf, input.cpf), (&self.npf, input.npf), (&self.sv, input.sv)] {
            if let Some(stack) = stack {
                parts.push(stack.forward(x));
            }
        }
        let mut x = Tensor::cat(parts, 1);
        for layer in &self.dense {
            x = self.dropout.forward(selu(layer.forward(x)));
        }
        self.output.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_selu_matches_reference() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-1.0, 0.0, 2.0], &device);
        let y: Vec<f32> = selu(x).into_data().to_vec().unwrap();
        let expected = [SELU_SCALE * SELU_ALPHA * ((-1.0f32).exp() - 1.0), 0.0, SELU_SCALE * 2.0];
        for (a, b) in y.iter().zip(expected) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let config = ClassifierConfig::new(4, 3, [5, 2], [0, 0], [2, 3]);
        let model = config.init::<TestBackend>(&device);
        let b = 6;
        let input = ClassifierInput {
            globals: Tensor::zeros([b, 3], &device),
            cpf: Tensor::ones([b, 5, 2], &device),
            npf: Tensor::zeros([b, 0, 0], &device),
            sv: Tensor::ones([b, 2, 3], &device),
        };
        assert_eq!(model.forward(input).dims(), [b, 4]);
    }

    #[test]
    fn test_config_from_schema() {
        let config = ClassifierConfig::for_schema(&FeatureSchema::default());
        assert_eq!(config.num_classes, 4);
        assert_eq!(config.cpf[1], FeatureSchema::default().cpf.branches.len());
        assert_eq!(config.dense_widths, vec![200, 100, 100]);
    }
}
