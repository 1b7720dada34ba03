use anyhow::{bail, Context, Result};
use std::path::Path;
use tch::{
    nn::{self, ModuleT, OptimizerConfig},
    Device, Kind, Reduction, Tensor,
};
use tracing::info;

use crate::config::TrainingConfig;
use crate::trainer::{Classifier, StepOutput};

/// Width of the ImageNet head that sits between the backbone and our classes.
const IMAGENET_CLASSES: i64 = 1000;

#[derive(Debug, Clone, Copy)]
enum Layer {
    Stem,
    Relu,
    MaxPool,
    Fire { c_in: i64, squeeze: i64, expand: i64 },
}

/// SqueezeNet 1.1 `features`, indexed like the torchvision module so
/// pretrained weights line up by name.
const SQUEEZENET1_1: [Layer; 13] = [
    Layer::Stem,
    Layer::Relu,
    Layer::MaxPool,
    Layer::Fire { c_in: 64, squeeze: 16, expand: 64 },
    Layer::Fire { c_in: 128, squeeze: 16, expand: 64 },
    Layer::MaxPool,
    Layer::Fire { c_in: 128, squeeze: 32, expand: 128 },
    Layer::Fire { c_in: 256, squeeze: 32, expand: 128 },
    Layer::MaxPool,
    Layer::Fire { c_in: 256, squeeze: 48, expand: 192 },
    Layer::Fire { c_in: 384, squeeze: 48, expand: 192 },
    Layer::Fire { c_in: 384, squeeze: 64, expand: 256 },
    Layer::Fire { c_in: 512, squeeze: 64, expand: 256 },
];

/// How many `features` layers to keep and how many channels they emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneDepth {
    pub layers: usize,
    pub filters: i64,
}

impl BackboneDepth {
    pub const FULL: BackboneDepth = BackboneDepth { layers: 13, filters: 512 };

    /// Non-positive values keep the full backbone.
    pub fn from_reduced(reduced: i64) -> Result<Self> {
        let filters = match reduced {
            r if r <= 0 => return Ok(Self::FULL),
            10 => 384,
            7..=9 => 256,
            other => bail!("unsupported backbone depth {other}, expected one of 7, 8, 9, 10"),
        };
        Ok(Self {
            layers: reduced as usize,
            filters,
        })
    }
}

fn fire(p: &nn::Path, c_in: i64, squeeze: i64, expand: i64) -> impl ModuleT {
    let padded = nn::ConvConfig {
        padding: 1,
        ..Default::default()
    };
    let squeeze1x1 = nn::conv2d(p / "squeeze", c_in, squeeze, 1, Default::default());
    let expand1x1 = nn::conv2d(p / "expand1x1", squeeze, expand, 1, Default::default());
    let expand3x3 = nn::conv2d(p / "expand3x3", squeeze, expand, 3, padded);
    nn::func_t(move |xs, _train| {
        let xs = xs.apply(&squeeze1x1).relu();
        Tensor::cat(&[xs.apply(&expand1x1).relu(), xs.apply(&expand3x3).relu()], 1)
    })
}

fn max_pool(xs: &Tensor) -> Tensor {
    xs.max_pool2d([3, 3], [2, 2], [0, 0], [1, 1], true)
}

fn features(p: &nn::Path, depth: BackboneDepth) -> nn::SequentialT {
    let stem = nn::ConvConfig {
        stride: 2,
        ..Default::default()
    };
    SQUEEZENET1_1
        .iter()
        .take(depth.layers)
        .enumerate()
        .fold(nn::seq_t(), |seq, (i, layer)| {
            let lp = p / i;
            match *layer {
                Layer::Stem => seq.add(nn::conv2d(&lp, 3, 64, 3, stem)),
                Layer::Relu => seq.add_fn(|xs| xs.relu()),
                Layer::MaxPool => seq.add_fn(max_pool),
                Layer::Fire {
                    c_in,
                    squeeze,
                    expand,
                } => seq.add(fire(&lp, c_in, squeeze, expand)),
            }
        })
}

/// SqueezeNet 1.1 backbone with its ImageNet head and a linear layer on top
/// mapping the 1000 ImageNet scores to `n_output` classes.
pub fn squeezenet(p: &nn::Path, depth: BackboneDepth, n_output: i64) -> nn::SequentialT {
    let c = p / "classifier";
    features(&(p / "features"), depth)
        .add_fn_t(|xs, train| xs.dropout(0.5, train))
        .add(nn::conv2d(&c / 1, depth.filters, IMAGENET_CLASSES, 1, Default::default()))
        .add_fn(|xs| xs.relu().adaptive_avg_pool2d([1, 1]).flat_view())
        .add(nn::linear(&c / 5, IMAGENET_CLASSES, n_output, Default::default()))
}

/// Copies every tensor of `path` whose name and shape match a variable of
/// `vs`. Returns the number of copied tensors.
pub fn load_pretrained(vs: &nn::VarStore, path: &Path) -> Result<usize> {
    let source = Tensor::load_multi(path)
        .with_context(|| format!("failed to read pretrained weights {}", path.display()))?;
    let mut targets = vs.variables();
    let mut copied = 0;
    tch::no_grad(|| {
        for (name, tensor) in &source {
            if let Some(target) = targets.get_mut(name) {
                if target.size() == tensor.size() {
                    target.copy_(tensor);
                    copied += 1;
                }
            }
        }
    });
    if copied == 0 {
        bail!("no tensors copied from {}", path.display());
    }
    Ok(copied)
}

/// SqueezeNet trained with Adam on (optionally class-weighted) cross entropy.
pub struct SqueezeNetClassifier {
    vs: nn::VarStore,
    net: nn::SequentialT,
    optimizer: nn::Optimizer,
    class_weights: Option<Tensor>,
}

impl SqueezeNetClassifier {
    pub fn new(config: &TrainingConfig, class_weights: Option<Vec<f64>>) -> Result<Self> {
        let device = config.device();
        let depth = BackboneDepth::from_reduced(config.reduced)?;
        let vs = nn::VarStore::new(device);
        let net = squeezenet(&vs.root(), depth, config.n_output);

        if !config.vanilla {
            let copied = load_pretrained(&vs, &config.pretrained_weights)?;
            info!(
                copied,
                path = %config.pretrained_weights.display(),
                "loaded pretrained backbone"
            );
        }
        info!(?depth, n_output = config.n_output, "built squeezenet 1.1");

        let optimizer = nn::Adam::default().build(&vs, config.lr)?;
        let class_weights = class_weights.map(|w| {
            Tensor::from_slice(&w)
                .to_kind(Kind::Float)
                .to_device(device)
        });

        Ok(Self {
            vs,
            net,
            optimizer,
            class_weights,
        })
    }

    fn loss(&self, logits: &Tensor, labels: &Tensor) -> Tensor {
        logits.cross_entropy_loss(
            labels,
            self.class_weights.as_ref(),
            Reduction::Mean,
            -100,
            0.0,
        )
    }
}

fn predictions(logits: &Tensor) -> Result<Vec<i64>> {
    let argmax = logits.argmax(1, false).to_device(Device::Cpu);
    Ok(Vec::<i64>::try_from(&argmax)?)
}

impl Classifier for SqueezeNetClassifier {
    fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<StepOutput> {
        let logits = self.net.forward_t(images, true);
        let loss = self.loss(&logits, labels);

        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.step();

        Ok(StepOutput {
            loss: loss.double_value(&[]),
            predictions: predictions(&logits.detach())?,
        })
    }

    fn eval_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<StepOutput> {
        let (logits, loss) = tch::no_grad(|| {
            let logits = self.net.forward_t(images, false);
            let loss = self.loss(&logits, labels);
            (logits, loss)
        });
        Ok(StepOutput {
            loss: loss.double_value(&[]),
            predictions: predictions(&logits)?,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.vs
            .save(path)
            .with_context(|| format!("failed to save parameters to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_table() {
        assert_eq!(BackboneDepth::from_reduced(-1).unwrap(), BackboneDepth::FULL);
        assert_eq!(BackboneDepth::from_reduced(10).unwrap().filters, 384);
        for r in 7..=9 {
            let depth = BackboneDepth::from_reduced(r).unwrap();
            assert_eq!(depth.filters, 256);
            assert_eq!(depth.layers, r as usize);
        }
        assert!(BackboneDepth::from_reduced(6).is_err());
        assert!(BackboneDepth::from_reduced(11).is_err());
    }

    #[test]
    fn forward_shapes_for_every_depth() {
        for reduced in [-1, 7, 8, 9, 10] {
            let vs = nn::VarStore::new(Device::Cpu);
            let depth = BackboneDepth::from_reduced(reduced).unwrap();
            let net = squeezenet(&vs.root(), depth, 5);
            let xs = Tensor::randn([2, 3, 64, 64], (Kind::Float, Device::Cpu));
            let out = net.forward_t(&xs, false);
            assert_eq!(out.size(), vec![2, 5], "depth {reduced}");
        }
    }

    #[test]
    fn variables_use_torchvision_names() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = squeezenet(&vs.root(), BackboneDepth::FULL, 3);
        let vars = vs.variables();
        for name in [
            "features.0.weight",
            "features.3.squeeze.weight",
            "features.12.expand3x3.bias",
            "classifier.1.weight",
            "classifier.5.weight",
        ] {
            assert!(vars.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn pretrained_copy_skips_mismatched_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.ot");

        let source = nn::VarStore::new(Device::Cpu);
        let _full = squeezenet(&source.root(), BackboneDepth::FULL, 5);
        source.save(&path).unwrap();

        let target = nn::VarStore::new(Device::Cpu);
        let _reduced = squeezenet(&target.root(), BackboneDepth::from_reduced(10).unwrap(), 5);
        let copied = load_pretrained(&target, &path).unwrap();

        // classifier.1.weight differs in input channels, its bias still matches
        let expected = target.variables().len() - 1;
        assert_eq!(copied, expected);
    }
}
