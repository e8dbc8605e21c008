use tch::{nn, Tensor};

use crate::error::{Error, Result};
use crate::layers::{dense, leaky_relu, valid_conv_transpose2d, SameConvTranspose2D, LEAKY_ALPHA};

/// Two dense layers mapping a latent vector straight to image pixels.
#[derive(Debug)]
pub struct MlpGenerator {
    net: nn::SequentialT,
    shape: [i64; 3],
}

impl MlpGenerator {
    pub fn new(path: nn::Path, dim_latent: i64, dim_hidden: i64, shape: [i64; 3]) -> MlpGenerator {
        let dim_out = shape.iter().product();
        let net = nn::seq_t()
            .add(dense(&path / "dense_1", dim_latent, dim_hidden))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(dense(&path / "dense_2", dim_hidden, dim_out))
            .add_fn(|x| x.tanh());
        MlpGenerator { net, shape }
    }
}

impl nn::ModuleT for MlpGenerator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let [c, h, w] = self.shape;
        self.net.forward_t(xs, train).view([-1, c, h, w])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcGeneratorConfig {
    pub dim_latent: i64,
    /// Width of the one-hot condition appended to the latent vector, 0 for none.
    pub dim_condition: i64,
    pub filters: i64,
    pub channels: i64,
}

impl Default for DcGeneratorConfig {
    fn default() -> Self {
        DcGeneratorConfig { dim_latent: 100, dim_condition: 0, filters: 512, channels: 1 }
    }
}

/// Dense projection to a 3x3 feature map followed by transposed convolutions
/// up to 28x28 (3 -> 7 -> 14 -> 28).
#[derive(Debug)]
pub struct DcGenerator {
    config: DcGeneratorConfig,
    project: nn::Linear,
    net: nn::SequentialT,
}

impl DcGenerator {
    pub fn new(path: nn::Path, config: DcGeneratorConfig) -> DcGenerator {
        let f = config.filters;
        let dim_in = config.dim_latent + config.dim_condition;
        let project = dense(&path / "dense_1", dim_in, 3 * 3 * f);
        let net = nn::seq_t()
            .add_fn(move |x| leaky_relu(&x.view([-1, f, 3, 3]), LEAKY_ALPHA))
            .add(valid_conv_transpose2d(&path / "conv_transpose_2", f, f / 2, 3, 2))
            .add(nn::batch_norm2d(&path / "batch_norm_2", f / 2, Default::default()))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(SameConvTranspose2D::new(&path / "conv_transpose_3", f / 2, f / 4, 4, 2))
            .add(nn::batch_norm2d(&path / "batch_norm_3", f / 4, Default::default()))
            .add_fn(|x| leaky_relu(x, LEAKY_ALPHA))
            .add(SameConvTranspose2D::new(&path / "conv_transpose_4", f / 4, config.channels, 4, 2))
            .add_fn(|x| x.tanh());
        DcGenerator { config, project, net }
    }

    pub fn config(&self) -> &DcGeneratorConfig {
        &self.config
    }

    pub fn generate(&self, latent: &Tensor, condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let inputs = match (self.config.dim_condition, condition) {
            (0, None) => latent.shallow_clone(),
            (0, Some(_)) => return Err(Error::shape("generator", "condition given to an unconditional generator")),
            (_, None) => return Err(Error::shape("generator", "conditional generator needs a condition vector")),
            (dim, Some(y)) => {
                let (zs, ys) = (latent.size(), y.size());
                if ys.len() != 2 || ys[1] != dim || ys[0] != zs[0] {
                    return Err(Error::shape("generator", format!("latent {zs:?} with condition {ys:?}")));
                }
                Tensor::cat(&[latent, y], 1)
            }
        };
        Ok(inputs.apply(&self.project).apply_t(&self.net, train))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn mlp_generator_emits_images() {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = MlpGenerator::new(vs.root(), 16, 32, [1, 28, 28]);
        let zs = Tensor::rand([3, 16], (Kind::Float, Device::Cpu));
        assert_eq!(zs.apply_t(&generator, false).size(), [3, 1, 28, 28]);
    }

    #[test]
    fn dc_generator_upsamples_to_28() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = DcGeneratorConfig { dim_latent: 8, filters: 16, ..Default::default() };
        let generator = DcGenerator::new(vs.root(), config);
        let zs = Tensor::rand([2, 8], (Kind::Float, Device::Cpu));
        let out = generator.generate(&zs, None, true).unwrap();
        assert_eq!(out.size(), [2, 1, 28, 28]);
    }

    #[test]
    fn conditional_generator_checks_condition() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = DcGeneratorConfig { dim_latent: 8, dim_condition: 10, filters: 16, channels: 1 };
        let generator = DcGenerator::new(vs.root(), config);
        let zs = Tensor::rand([2, 8], (Kind::Float, Device::Cpu));
        let ys = Tensor::zeros([2, 10], (Kind::Float, Device::Cpu));
        assert!(generator.generate(&zs, Some(&ys), false).is_ok());
        assert!(generator.generate(&zs, None, false).is_err());

        let wrong = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        assert!(matches!(generator.generate(&zs, Some(&wrong), false), Err(Error::ShapeMismatch { .. })));
    }
}
