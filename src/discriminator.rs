use tch::{nn, Tensor};

use crate::error::{Error, Result};
use crate::layers::{concat_channels, dense, leaky_relu, valid_conv2d, SameConv2D, LEAKY_ALPHA};

/// Two dense layers ending in a sigmoid: the output is a probability, not a logit.
#[derive(Debug)]
pub struct MlpDiscriminator {
    net: nn::SequentialT
}

impl MlpDiscriminator {
    pub fn new(path: nn::Path, dim_in: i64, dim_hidden: i64) -> MlpDiscriminator {
        let net = nn::seq_t()
            .add_fn(|x| x.flatten(1, -1))
            .add(dense(&path / "dense_1", dim_in, dim_hidden))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(dense(&path / "dense_2", dim_hidden, 1))
            .add_fn(|x| x.sigmoid());
        MlpDiscriminator { net }
    }
}

impl nn::ModuleT for MlpDiscriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcDiscriminatorConfig {
    pub channels: i64,
    pub image_size: i64,
    /// Number of condition features tiled over the image, 0 for none.
    pub dim_condition: i64,
    pub filters: i64,
}

impl Default for DcDiscriminatorConfig {
    fn default() -> Self {
        DcDiscriminatorConfig { channels: 1, image_size: 28, dim_condition: 0, filters: 64 }
    }
}

/// Three strided convolutions (28 -> 14 -> 7 -> 4), flatten, one logit.
#[derive(Debug)]
pub struct DcDiscriminator {
    config: DcDiscriminatorConfig,
    features: nn::SequentialT,
    logits: nn::Linear,
}

impl DcDiscriminator {
    pub fn new(path: nn::Path, config: DcDiscriminatorConfig) -> DcDiscriminator {
        let f = config.filters;
        let c_in = config.channels + config.dim_condition;
        let features = nn::seq_t()
            .add(SameConv2D::new(&path / "conv_1", c_in, f, 4, 2, true))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(SameConv2D::new(&path / "conv_2", f, f * 2, 4, 2, true))
            .add(nn::batch_norm2d(&path / "batch_norm_2", f * 2, Default::default()))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(SameConv2D::new(&path / "conv_3", f * 2, f * 4, 4, 2, true))
            .add(nn::batch_norm2d(&path / "batch_norm_3", f * 4, Default::default()))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add_fn(|x| x.flatten(1, -1));
        let side = (0..3).fold(config.image_size, |s, _| (s + 1) / 2);
        let logits = dense(&path / "logits", side * side * f * 4, 1);
        DcDiscriminator { config, features, logits }
    }

    pub fn config(&self) -> &DcDiscriminatorConfig {
        &self.config
    }

    /// Returns the logits together with the flattened pre-logit features.
    pub fn forward_with_features(&self, xs: &Tensor, condition: Option<&Tensor>, train: bool) -> Result<(Tensor, Tensor)> {
        let inputs = match (self.config.dim_condition, condition) {
            (0, None) => xs.shallow_clone(),
            (0, Some(_)) => return Err(Error::shape("discriminator", "condition given to an unconditional discriminator")),
            (_, None) => return Err(Error::shape("discriminator", "conditional discriminator needs a condition vector")),
            (dim, Some(y)) => {
                let size = xs.size();
                if size.len() != 4 || y.size() != [size[0], dim] {
                    return Err(Error::shape("discriminator", format!("sample {size:?} with condition {:?}", y.size())));
                }
                let tiled = y.view([size[0], dim, 1, 1]).expand([size[0], dim, size[2], size[3]], false);
                concat_channels("discriminator condition", &[xs, &tiled])?
            }
        };
        let features = inputs.apply_t(&self.features, train);
        let logits = features.apply(&self.logits);
        Ok((logits, features))
    }

    pub fn score(&self, xs: &Tensor, condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        Ok(self.forward_with_features(xs, condition, train)?.0)
    }
}

/// Scores each local patch of an (input, target) image pair.
///
/// Three stride-2 stages are followed by two unpadded convolutions, so a
/// 512x512 pair yields a 58x58 grid of logits.
#[derive(Debug)]
pub struct PatchDiscriminator {
    net: nn::SequentialT,
}

impl PatchDiscriminator {
    pub fn new(path: nn::Path, channels: i64, filters: i64) -> PatchDiscriminator {
        let f = filters;
        let net = nn::seq_t()
            .add(SameConv2D::new(&path / "conv_1", channels * 2, f, 4, 2, false))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(SameConv2D::new(&path / "conv_2", f, f * 2, 4, 2, false))
            .add(nn::batch_norm2d(&path / "batch_norm_2", f * 2, Default::default()))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(SameConv2D::new(&path / "conv_3", f * 2, f * 4, 4, 2, false))
            .add(nn::batch_norm2d(&path / "batch_norm_3", f * 4, Default::default()))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(valid_conv2d(&path / "conv_4", f * 4, f * 8, 4, 1, false))
            .add(valid_conv2d(&path / "conv_5", f * 8, 1, 4, 1, false));
        PatchDiscriminator { net }
    }

    pub fn score(&self, inputs: &Tensor, targets: &Tensor, train: bool) -> Result<Tensor> {
        let pair = concat_channels("patch discriminator", &[inputs, targets])?;
        Ok(pair.apply_t(&self.net, train))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn dc_discriminator_exposes_features() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = DcDiscriminatorConfig { filters: 4, ..Default::default() };
        let discriminator = DcDiscriminator::new(vs.root(), config);
        let xs = Tensor::zeros([3, 1, 28, 28], (Kind::Float, Device::Cpu));
        let (logits, features) = discriminator.forward_with_features(&xs, None, false).unwrap();
        assert_eq!(logits.size(), [3, 1]);
        assert_eq!(features.size(), [3, 4 * 4 * 16]);
    }

    #[test]
    fn shared_parameters_across_calls() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = DcDiscriminator::new(vs.root(), DcDiscriminatorConfig { filters: 4, ..Default::default() });
        let before: Vec<Tensor> = vs.trainable_variables().iter().map(|t| t.copy()).collect();

        let real = Tensor::rand([2, 1, 28, 28], (Kind::Float, Device::Cpu));
        let fake = Tensor::rand([2, 1, 28, 28], (Kind::Float, Device::Cpu));
        let a = discriminator.score(&real, None, false).unwrap();
        let b = discriminator.score(&fake, None, false).unwrap();
        let again = discriminator.score(&real, None, false).unwrap();

        let after = vs.trainable_variables();
        assert_eq!(before.len(), after.len());
        for (x, y) in before.iter().zip(after.iter()) {
            assert!(x.equal(y));
        }
        assert_eq!(a.size(), b.size());
        assert!(a.allclose(&again, 1e-6, 1e-6, false));
    }

    #[test]
    fn conditional_discriminator_tiles_labels() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = DcDiscriminatorConfig { dim_condition: 10, filters: 4, ..Default::default() };
        let discriminator = DcDiscriminator::new(vs.root(), config);
        let xs = Tensor::zeros([2, 1, 28, 28], (Kind::Float, Device::Cpu));
        let ys = Tensor::zeros([2, 10], (Kind::Float, Device::Cpu));
        assert_eq!(discriminator.score(&xs, Some(&ys), true).unwrap().size(), [2, 1]);
        let short = Tensor::zeros([1, 10], (Kind::Float, Device::Cpu));
        assert!(discriminator.score(&xs, Some(&short), true).is_err());
    }

    #[test]
    fn patch_discriminator_emits_grid() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = PatchDiscriminator::new(vs.root(), 3, 2);
        let xs = Tensor::zeros([1, 3, 64, 64], (Kind::Float, Device::Cpu));
        // 64 -> 32 -> 16 -> 8 -> 5 -> 2
        assert_eq!(discriminator.score(&xs, &xs, false).unwrap().size(), [1, 1, 2, 2]);
    }

    #[test]
    fn mlp_discriminator_outputs_probabilities() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = MlpDiscriminator::new(vs.root(), 28 * 28, 16);
        let xs = Tensor::randn([5, 1, 28, 28], (Kind::Float, Device::Cpu));
        let ps = xs.apply_t(&discriminator, false);
        assert_eq!(ps.size(), [5, 1]);
        assert!(ps.min().double_value(&[]) >= 0.0);
        assert!(ps.max().double_value(&[]) <= 1.0);
    }
}
