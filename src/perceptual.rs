//! Discriminator built on a frozen, pretrained VGG16 feature extractor.
//!
//! The thirteen VGG16 convolutions are loaded once from a weights file and
//! kept outside of any `VarStore`, so no optimizer ever sees them. Only the
//! final 3x3 scoring convolution is trainable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tch::{nn, Device, Kind, Tensor};
use tracing::info;

use crate::error::{Error, Result};
use crate::layers::{concat_channels, valid_conv2d};

pub const VGG16_BLOCKS: [&[&str]; 5] = [
    &["conv1_1", "conv1_2"],
    &["conv2_1", "conv2_2"],
    &["conv3_1", "conv3_2", "conv3_3"],
    &["conv4_1", "conv4_2", "conv4_3"],
    &["conv5_1", "conv5_2", "conv5_3"],
];

/// Per-channel means of the VGG training set, in BGR order.
pub const VGG_MEAN_BGR: [f64; 3] = [103.939, 116.779, 123.68];

/// Named tensors read from a `.npz`, `.safetensors` or `.ot` file.
///
/// Entries are expected as `<layer>.weight` with shape `[out, in, 3, 3]` and
/// `<layer>.bias` with shape `[out]`.
pub struct PretrainedWeights {
    source: PathBuf,
    tensors: HashMap<String, Tensor>,
}

impl PretrainedWeights {
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<PretrainedWeights> {
        let path = path.as_ref();
        if !path.is_file() {
            let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "pretrained weights file not found");
            return Err(Error::resource(path, missing));
        }
        let named = match path.extension().and_then(|e| e.to_str()) {
            Some("npz") => Tensor::read_npz(path),
            Some("safetensors") => Tensor::read_safetensors(path),
            _ => Tensor::load_multi(path),
        }
        .map_err(|e| Error::resource(path, e))?;

        let tensors = named
            .into_iter()
            .map(|(name, t)| (name, t.to_kind(Kind::Float).to_device(device).set_requires_grad(false)))
            .collect::<HashMap<_, _>>();
        info!("Loaded {} pretrained tensors from {}", tensors.len(), path.display());
        Ok(PretrainedWeights { source: path.to_path_buf(), tensors })
    }

    fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors.get(name).ok_or_else(|| {
            let missing = std::io::Error::new(std::io::ErrorKind::InvalidData, format!("no tensor named `{name}`"));
            Error::resource(&self.source, missing)
        })
    }
}

#[derive(Debug)]
struct FrozenConv {
    weight: Tensor,
    bias: Tensor,
}

impl FrozenConv {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.conv2d(&self.weight, Some(&self.bias), [1, 1], [1, 1], [1, 1], 1).relu()
    }
}

#[derive(Debug)]
pub struct PerceptualDiscriminator {
    blocks: Vec<Vec<FrozenConv>>,
    logits: nn::Conv2D,
}

impl PerceptualDiscriminator {
    pub fn new(path: nn::Path, weights: &PretrainedWeights) -> Result<PerceptualDiscriminator> {
        let mut blocks = Vec::with_capacity(VGG16_BLOCKS.len());
        let mut channels = 3;
        let mut first = true;
        for names in VGG16_BLOCKS {
            let mut block = Vec::with_capacity(names.len());
            for &name in names {
                let weight = weights.get(&format!("{name}.weight"))?;
                let bias = weights.get(&format!("{name}.bias"))?;
                let (ws, bs) = (weight.size(), bias.size());
                if ws.len() != 4 || ws[1] != channels || ws[2..] != [3, 3] || bs != [ws[0]] {
                    return Err(Error::shape(
                        format!("pretrained layer {name}"),
                        format!("weight {ws:?} / bias {bs:?} after {channels} channels"),
                    ));
                }
                // The pair of images arrives as six channels: reuse the RGB filters for both.
                let weight = if first { Tensor::cat(&[weight, weight], 1) } else { weight.shallow_clone() };
                first = false;
                channels = ws[0];
                block.push(FrozenConv { weight, bias: bias.shallow_clone() });
            }
            blocks.push(block);
        }
        let logits = valid_conv2d(&path / "logits", channels, 1, 3, 1, true);
        Ok(PerceptualDiscriminator { blocks, logits })
    }

    /// Handles on the pretrained filters and biases, sharing their storage.
    #[cfg(test)]
    pub(crate) fn frozen_parameters(&self) -> Vec<Tensor> {
        self.blocks
            .iter()
            .flatten()
            .flat_map(|conv| [conv.weight.shallow_clone(), conv.bias.shallow_clone()])
            .collect()
    }

    fn to_bgr(xs: &Tensor) -> Tensor {
        let rgb = (xs + 1.0) * 127.5;
        let [b, g, r] = VGG_MEAN_BGR;
        Tensor::cat(&[rgb.narrow(1, 2, 1) - b, rgb.narrow(1, 1, 1) - g, rgb.narrow(1, 0, 1) - r], 1)
    }

    pub fn score(&self, inputs: &Tensor, targets: &Tensor, _train: bool) -> Result<Tensor> {
        for (what, xs) in [("input", inputs), ("target", targets)] {
            let size = xs.size();
            if size.len() != 4 || size[1] != 3 {
                return Err(Error::shape("perceptual discriminator", format!("{what} must be RGB NCHW, got {size:?}")));
            }
        }
        let mut xs = concat_channels("perceptual discriminator", &[&Self::to_bgr(inputs), &Self::to_bgr(targets)])?;
        for block in &self.blocks {
            for conv in block {
                xs = conv.forward(&xs);
            }
            xs = xs.max_pool2d([2, 2], [2, 2], [0, 0], [1, 1], true);
        }
        Ok(xs.apply(&self.logits))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writes a VGG16-shaped weights file with `width` channels per layer.
    pub(crate) fn write_weights(path: &Path, width: i64) {
        let mut named = Vec::new();
        let mut c_in = 3;
        for names in VGG16_BLOCKS {
            for &name in names {
                let opts = (Kind::Float, Device::Cpu);
                named.push((format!("{name}.weight"), Tensor::randn([width, c_in, 3, 3], opts) * 0.1));
                named.push((format!("{name}.bias"), Tensor::zeros([width], opts)));
                c_in = width;
            }
        }
        Tensor::write_npz(&named, path).unwrap();
    }

    #[test]
    fn only_scoring_layer_is_trainable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("vgg16.npz");
        write_weights(&file, 2);

        let weights = PretrainedWeights::load(&file, Device::Cpu).unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = PerceptualDiscriminator::new(vs.root(), &weights).unwrap();
        assert_eq!(vs.trainable_variables().len(), 2);

        let xs = Tensor::rand([2, 3, 96, 96], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;
        let scores = discriminator.score(&xs, &xs, true).unwrap();
        assert_eq!(scores.size(), [2, 1, 1, 1]);
    }

    #[test]
    fn missing_file_is_a_resource_error() {
        let err = PretrainedWeights::load("/nonexistent/vgg16.npz", Device::Cpu).err().unwrap();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[test]
    fn broken_channel_chain_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("vgg16.npz");
        let opts = (Kind::Float, Device::Cpu);
        let named = vec![
            ("conv1_1.weight".to_string(), Tensor::zeros([4, 3, 3, 3], opts)),
            ("conv1_1.bias".to_string(), Tensor::zeros([4], opts)),
            ("conv1_2.weight".to_string(), Tensor::zeros([4, 5, 3, 3], opts)),
            ("conv1_2.bias".to_string(), Tensor::zeros([4], opts)),
        ];
        Tensor::write_npz(&named, &file).unwrap();

        let weights = PretrainedWeights::load(&file, Device::Cpu).unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let err = PerceptualDiscriminator::new(vs.root(), &weights).err().unwrap();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
