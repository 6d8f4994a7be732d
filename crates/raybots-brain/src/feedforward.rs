//! Fully connected feedforward controller.
//!
//! Hidden transitions apply one activation uniformly across the layer; the
//! final transition applies one activation per motor unit, which is how the
//! three motor channels get their mixed sigmoid/sigmoid/tanh ranges.

use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use raybots_core::{ActivationKind, BrainRunner, ControllerSettings, MOTOR_OUTPUTS, MotorCommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating a controller topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedforwardError {
    /// A network needs at least an input and an output layer.
    #[error("a controller needs at least input and output layers, got {actual}")]
    TooFewLayers { actual: usize },
    /// Every layer must hold at least one unit.
    #[error("layer {index} has zero width")]
    ZeroWidthLayer { index: usize },
    /// The output layer width is fixed by the motor command arity.
    #[error("the output layer must have {expected} motor units, got {actual}")]
    MotorArity { expected: usize, actual: usize },
    /// One activation per hidden layer.
    #[error("expected {expected} hidden activations, got {actual}")]
    HiddenActivationCount { expected: usize, actual: usize },
    /// One activation per motor unit.
    #[error("expected {expected} output activations, got {actual}")]
    OutputActivationCount { expected: usize, actual: usize },
    /// Weight storage must cover the full `fan_in x fan_out` matrix.
    #[error("layer weight count {actual} does not match {fan_in}x{fan_out}")]
    WeightCount {
        fan_in: usize,
        fan_out: usize,
        actual: usize,
    },
    /// One bias per output unit of the layer.
    #[error("layer bias count {actual} does not match fan-out {fan_out}")]
    BiasCount { fan_out: usize, actual: usize },
    /// Consecutive layers must agree on their shared width.
    #[error("layer {index} expects {actual} inputs but the previous layer produces {expected}")]
    LayerChain {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Validated topology for a feedforward controller.
///
/// Holding a spec proves the layer chain is well formed, so building networks
/// from it never fails.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedforwardSpec {
    layer_sizes: Vec<usize>,
    hidden_activations: Vec<ActivationKind>,
    output_activations: Vec<ActivationKind>,
}

impl FeedforwardSpec {
    /// Validates a full layer chain, input through motor output.
    pub fn new(
        layer_sizes: Vec<usize>,
        hidden_activations: Vec<ActivationKind>,
        output_activations: Vec<ActivationKind>,
    ) -> Result<Self, FeedforwardError> {
        if layer_sizes.len() < 2 {
            return Err(FeedforwardError::TooFewLayers {
                actual: layer_sizes.len(),
            });
        }
        if let Some(index) = layer_sizes.iter().position(|&width| width == 0) {
            return Err(FeedforwardError::ZeroWidthLayer { index });
        }
        let output = layer_sizes[layer_sizes.len() - 1];
        if output != MOTOR_OUTPUTS {
            return Err(FeedforwardError::MotorArity {
                expected: MOTOR_OUTPUTS,
                actual: output,
            });
        }
        let hidden = layer_sizes.len() - 2;
        if hidden_activations.len() != hidden {
            return Err(FeedforwardError::HiddenActivationCount {
                expected: hidden,
                actual: hidden_activations.len(),
            });
        }
        if output_activations.len() != output {
            return Err(FeedforwardError::OutputActivationCount {
                expected: output,
                actual: output_activations.len(),
            });
        }
        Ok(Self {
            layer_sizes,
            hidden_activations,
            output_activations,
        })
    }

    /// Builds the chain `input -> hidden layers -> motor output` from
    /// configuration settings.
    pub fn from_settings(
        input_size: usize,
        settings: &ControllerSettings,
    ) -> Result<Self, FeedforwardError> {
        let mut layer_sizes = Vec::with_capacity(settings.hidden_layers.len() + 2);
        layer_sizes.push(input_size);
        layer_sizes.extend_from_slice(&settings.hidden_layers);
        layer_sizes.push(MOTOR_OUTPUTS);
        Self::new(
            layer_sizes,
            settings.hidden_activations.clone(),
            settings.output_activations.clone(),
        )
    }

    /// Width of the input layer.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.layer_sizes[0]
    }

    /// Full layer chain.
    #[must_use]
    pub fn layer_sizes(&self) -> &[usize] {
        &self.layer_sizes
    }
}

/// One fully connected layer with row-major `[fan_in, fan_out]` weights.
///
/// Deserialization re-checks the weight and bias storage against the declared
/// widths, so a decoded layer is as well formed as a constructed one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "DenseLayerWire")]
pub struct DenseLayer {
    fan_in: usize,
    fan_out: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

/// Unvalidated mirror of [`DenseLayer`] used while decoding.
#[derive(Deserialize)]
struct DenseLayerWire {
    fan_in: usize,
    fan_out: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl TryFrom<DenseLayerWire> for DenseLayer {
    type Error = FeedforwardError;

    fn try_from(wire: DenseLayerWire) -> Result<Self, Self::Error> {
        if wire.weights.len() != wire.fan_in * wire.fan_out {
            return Err(FeedforwardError::WeightCount {
                fan_in: wire.fan_in,
                fan_out: wire.fan_out,
                actual: wire.weights.len(),
            });
        }
        if wire.biases.len() != wire.fan_out {
            return Err(FeedforwardError::BiasCount {
                fan_out: wire.fan_out,
                actual: wire.biases.len(),
            });
        }
        Ok(Self {
            fan_in: wire.fan_in,
            fan_out: wire.fan_out,
            weights: wire.weights,
            biases: wire.biases,
        })
    }
}

impl DenseLayer {
    /// He-scaled random weights (`sqrt(2 / fan_in)`) with unit-normal biases.
    #[must_use]
    pub fn random(fan_in: usize, fan_out: usize, rng: &mut dyn RngCore) -> Self {
        let scale = (2.0 / fan_in as f32).sqrt();
        let weights = (0..fan_in * fan_out)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
            .collect();
        let biases = (0..fan_out)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self {
            fan_in,
            fan_out,
            weights,
            biases,
        }
    }

    /// Input width.
    #[must_use]
    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    /// Output width.
    #[must_use]
    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Pre-activation affine map. Callers guarantee `input.len() == fan_in`.
    #[must_use]
    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        debug_assert_eq!(input.len(), self.fan_in);
        let mut out = self.biases.clone();
        for (i, &x) in input.iter().enumerate() {
            let row = &self.weights[i * self.fan_out..(i + 1) * self.fan_out];
            for (acc, &w) in out.iter_mut().zip(row) {
                *acc += x * w;
            }
        }
        out
    }
}

/// Baseline controller: a dense feedforward stack evaluated once per tick.
///
/// Deserialization re-runs the topology validation, so `decide` can index the
/// three motor outputs on any decoded controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "FeedforwardBrainWire")]
pub struct FeedforwardBrain {
    layers: Vec<DenseLayer>,
    hidden_activations: Vec<ActivationKind>,
    output_activations: Vec<ActivationKind>,
}

/// Unvalidated mirror of [`FeedforwardBrain`] used while decoding.
#[derive(Deserialize)]
struct FeedforwardBrainWire {
    layers: Vec<DenseLayer>,
    hidden_activations: Vec<ActivationKind>,
    output_activations: Vec<ActivationKind>,
}

impl TryFrom<FeedforwardBrainWire> for FeedforwardBrain {
    type Error = FeedforwardError;

    fn try_from(wire: FeedforwardBrainWire) -> Result<Self, Self::Error> {
        let mut layer_sizes = Vec::with_capacity(wire.layers.len() + 1);
        if let Some(first) = wire.layers.first() {
            layer_sizes.push(first.fan_in());
        }
        for (index, layer) in wire.layers.iter().enumerate() {
            if layer.fan_in() != layer_sizes[index] {
                return Err(FeedforwardError::LayerChain {
                    index,
                    expected: layer_sizes[index],
                    actual: layer.fan_in(),
                });
            }
            layer_sizes.push(layer.fan_out());
        }
        FeedforwardSpec::new(
            layer_sizes,
            wire.hidden_activations.clone(),
            wire.output_activations.clone(),
        )?;
        Ok(Self {
            layers: wire.layers,
            hidden_activations: wire.hidden_activations,
            output_activations: wire.output_activations,
        })
    }
}

impl FeedforwardBrain {
    /// Randomly initialized network for a validated topology.
    #[must_use]
    pub fn random(spec: &FeedforwardSpec, rng: &mut dyn RngCore) -> Self {
        let layers = spec
            .layer_sizes
            .windows(2)
            .map(|pair| DenseLayer::random(pair[0], pair[1], rng))
            .collect();
        Self {
            layers,
            hidden_activations: spec.hidden_activations.clone(),
            output_activations: spec.output_activations.clone(),
        }
    }

    /// Validates settings and builds a random network in one step.
    pub fn from_settings(
        input_size: usize,
        settings: &ControllerSettings,
        rng: &mut dyn RngCore,
    ) -> Result<Self, FeedforwardError> {
        let spec = FeedforwardSpec::from_settings(input_size, settings)?;
        Ok(Self::random(&spec, rng))
    }

    /// Width of the expected sensor vector.
    #[must_use]
    pub fn input_width(&self) -> usize {
        self.layers.first().map_or(0, DenseLayer::fan_in)
    }

    /// Full forward pass returning the activated motor layer.
    #[must_use]
    pub fn forward(&self, inputs: &[f32]) -> Vec<f32> {
        let last = self.layers.len().saturating_sub(1);
        let mut current = inputs.to_vec();
        for (index, layer) in self.layers.iter().enumerate() {
            let mut next = layer.forward(&current);
            if index < last {
                let activation = self.hidden_activations[index];
                for value in &mut next {
                    *value = activation.apply(*value);
                }
            } else {
                for (value, activation) in next.iter_mut().zip(&self.output_activations) {
                    *value = activation.apply(*value);
                }
            }
            current = next;
        }
        current
    }
}

impl BrainRunner for FeedforwardBrain {
    fn kind(&self) -> &'static str {
        "feedforward.dense"
    }

    fn input_size(&self) -> usize {
        self.input_width()
    }

    fn decide(&self, sensors: &[f32]) -> MotorCommand {
        let outputs = self.forward(sensors);
        MotorCommand {
            thrust: outputs[0],
            brake: outputs[1],
            turn: outputs[2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn default_spec() -> FeedforwardSpec {
        FeedforwardSpec::from_settings(12, &ControllerSettings::default()).expect("spec")
    }

    #[test]
    fn default_settings_produce_the_reference_chain() {
        let spec = default_spec();
        assert_eq!(spec.layer_sizes(), &[12, 8, 6, 3]);
        assert_eq!(spec.input_size(), 12);
    }

    #[test]
    fn validation_rejects_malformed_topologies() {
        assert_eq!(
            FeedforwardSpec::new(vec![5], vec![], vec![]).unwrap_err(),
            FeedforwardError::TooFewLayers { actual: 1 }
        );
        assert_eq!(
            FeedforwardSpec::new(vec![5, 0, 3], vec![ActivationKind::Relu], vec![]).unwrap_err(),
            FeedforwardError::ZeroWidthLayer { index: 1 }
        );
        assert_eq!(
            FeedforwardSpec::new(vec![5, 4], vec![], vec![]).unwrap_err(),
            FeedforwardError::MotorArity {
                expected: 3,
                actual: 4
            }
        );
        assert_eq!(
            FeedforwardSpec::new(vec![5, 4, 3], vec![], vec![]).unwrap_err(),
            FeedforwardError::HiddenActivationCount {
                expected: 1,
                actual: 0
            }
        );
        assert_eq!(
            FeedforwardSpec::new(
                vec![5, 4, 3],
                vec![ActivationKind::Relu],
                vec![ActivationKind::Tanh]
            )
            .unwrap_err(),
            FeedforwardError::OutputActivationCount {
                expected: 3,
                actual: 1
            }
        );
    }

    #[test]
    fn settings_with_wrong_activation_counts_fail() {
        let settings = ControllerSettings {
            hidden_activations: vec![ActivationKind::Relu],
            ..ControllerSettings::default()
        };
        assert!(FeedforwardSpec::from_settings(12, &settings).is_err());
    }

    #[test]
    fn dense_layer_computes_the_affine_map() {
        let layer = DenseLayer {
            fan_in: 2,
            fan_out: 3,
            // Rows are per-input: input 0 -> [1, 2, 3], input 1 -> [4, 5, 6].
            weights: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            biases: vec![0.5, -0.5, 0.0],
        };
        let out = layer.forward(&[1.0, 2.0]);
        assert_eq!(out, vec![1.0 + 8.0 + 0.5, 2.0 + 10.0 - 0.5, 3.0 + 12.0]);
    }

    #[test]
    fn output_activations_apply_per_unit() {
        // Identity weights into the motor layer, biases pick the values.
        let brain = FeedforwardBrain {
            layers: vec![DenseLayer {
                fan_in: 1,
                fan_out: 3,
                weights: vec![0.0, 0.0, 0.0],
                biases: vec![0.0, 100.0, -100.0],
            }],
            hidden_activations: vec![],
            output_activations: vec![
                ActivationKind::Sigmoid,
                ActivationKind::Sigmoid,
                ActivationKind::Tanh,
            ],
        };
        let out = brain.forward(&[0.0]);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!(out[1] > 0.999);
        assert!(out[2] < -0.999);

        let command = brain.decide(&[0.0]);
        assert!((command.thrust - 0.5).abs() < 1e-6);
        assert!(command.brake > 0.999);
        assert!(command.turn < -0.999);
    }

    #[test]
    fn hidden_relu_zeroes_negative_preactivations() {
        let brain = FeedforwardBrain {
            layers: vec![
                DenseLayer {
                    fan_in: 1,
                    fan_out: 2,
                    weights: vec![1.0, -1.0],
                    biases: vec![0.0, 0.0],
                },
                DenseLayer {
                    fan_in: 2,
                    fan_out: 3,
                    weights: vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
                    biases: vec![0.0, 0.0, 0.0],
                },
            ],
            hidden_activations: vec![ActivationKind::Relu],
            output_activations: vec![
                ActivationKind::Sigmoid,
                ActivationKind::Sigmoid,
                ActivationKind::Tanh,
            ],
        };
        // Input 2.0 -> hidden [2, -2] -> relu [2, 0] -> sums are all 2.
        let out = brain.forward(&[2.0]);
        assert!((out[0] - ActivationKind::Sigmoid.apply(2.0)).abs() < 1e-6);
        assert!((out[2] - ActivationKind::Tanh.apply(2.0)).abs() < 1e-6);
    }

    #[test]
    fn seeded_initialization_is_reproducible() {
        let spec = default_spec();
        let mut a = SmallRng::seed_from_u64(42);
        let mut b = SmallRng::seed_from_u64(42);
        let mut c = SmallRng::seed_from_u64(43);
        let one = FeedforwardBrain::random(&spec, &mut a);
        let two = FeedforwardBrain::random(&spec, &mut b);
        let other = FeedforwardBrain::random(&spec, &mut c);
        assert_eq!(one, two);
        assert_ne!(one, other);
    }

    #[test]
    fn motor_outputs_stay_in_range_for_extreme_inputs() {
        let spec = default_spec();
        let mut rng = SmallRng::seed_from_u64(9);
        let brain = FeedforwardBrain::random(&spec, &mut rng);
        for inputs in [
            vec![0.0; 12],
            vec![600.0; 12],
            vec![-600.0; 12],
            vec![1e6; 12],
        ] {
            let command = brain.decide(&inputs);
            assert!((0.0..=1.0).contains(&command.thrust));
            assert!((0.0..=1.0).contains(&command.brake));
            assert!((-1.0..=1.0).contains(&command.turn));
        }
    }

    #[test]
    fn serialized_controllers_survive_a_round_trip() {
        let spec = default_spec();
        let mut rng = SmallRng::seed_from_u64(5);
        let brain = FeedforwardBrain::random(&spec, &mut rng);
        let json = serde_json::to_string(&brain).expect("serialize");
        let restored: FeedforwardBrain = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(brain, restored);
        let sensors = vec![1.0; 12];
        assert_eq!(brain.forward(&sensors), restored.forward(&sensors));
    }

    #[test]
    fn deserialization_rejects_truncated_motor_layers() {
        // Serialization does not validate, so an ill-formed value makes a
        // payload that only the decoder can refuse.
        let brain = FeedforwardBrain {
            layers: vec![DenseLayer {
                fan_in: 1,
                fan_out: 2,
                weights: vec![0.0, 0.0],
                biases: vec![0.0, 0.0],
            }],
            hidden_activations: vec![],
            output_activations: vec![ActivationKind::Sigmoid, ActivationKind::Sigmoid],
        };
        let json = serde_json::to_string(&brain).expect("serialize");
        let err = serde_json::from_str::<FeedforwardBrain>(&json).unwrap_err();
        assert!(err.to_string().contains("motor units"));
    }

    #[test]
    fn deserialization_rejects_mismatched_layer_storage() {
        let short_weights = serde_json::json!({
            "fan_in": 2,
            "fan_out": 3,
            "weights": [0.0, 0.0, 0.0, 0.0, 0.0],
            "biases": [0.0, 0.0, 0.0]
        });
        let err = serde_json::from_value::<DenseLayer>(short_weights).unwrap_err();
        assert!(err.to_string().contains("weight count"));

        let short_biases = serde_json::json!({
            "fan_in": 1,
            "fan_out": 3,
            "weights": [0.0, 0.0, 0.0],
            "biases": [0.0]
        });
        let err = serde_json::from_value::<DenseLayer>(short_biases).unwrap_err();
        assert!(err.to_string().contains("bias count"));
    }

    #[test]
    fn deserialization_rejects_broken_layer_chains() {
        let brain = FeedforwardBrain {
            layers: vec![
                DenseLayer {
                    fan_in: 1,
                    fan_out: 2,
                    weights: vec![0.0, 0.0],
                    biases: vec![0.0, 0.0],
                },
                DenseLayer {
                    fan_in: 4,
                    fan_out: 3,
                    weights: vec![0.0; 12],
                    biases: vec![0.0, 0.0, 0.0],
                },
            ],
            hidden_activations: vec![ActivationKind::Relu],
            output_activations: vec![
                ActivationKind::Sigmoid,
                ActivationKind::Sigmoid,
                ActivationKind::Tanh,
            ],
        };
        let json = serde_json::to_string(&brain).expect("serialize");
        let err = serde_json::from_str::<FeedforwardBrain>(&json).unwrap_err();
        assert!(err.to_string().contains("previous layer"));
    }
}
