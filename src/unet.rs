//! Encoder/decoder generator for paired image translation.
//!
//! Nine stride-2 encoder stages take a 512x512 input down to a 1x1
//! bottleneck, nine decoder stages bring it back up. Every decoder stage but
//! the first reads its predecessor's output concatenated with the encoder
//! output of the same resolution.

use tch::{nn, nn::Module, Tensor};

use crate::error::{Error, Result};
use crate::layers::{concat_channels, SameConv2D, SameConvTranspose2D};

pub const STAGES: usize = 9;
const KERNEL: i64 = 4;

/// `(filter multiplier, stride-1 repeats)` per encoder stage.
const ENCODER_PLAN: [(i64, usize); STAGES] = [(1, 1), (2, 1), (4, 1), (8, 2), (8, 2), (8, 2), (8, 2), (8, 2), (8, 2)];

/// `(filter multiplier, dropout rate, stride-1 repeats)` per decoder stage;
/// the last stage emits the output channels instead.
const DECODER_PLAN: [(i64, f64, usize); STAGES] = [
    (8, 0.5, 2),
    (8, 0.5, 2),
    (8, 0.5, 2),
    (8, 0.5, 2),
    (8, 0.5, 2),
    (4, 0.0, 2),
    (2, 0.0, 1),
    (1, 0.0, 1),
    (0, 0.0, 1),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UNetConfig {
    pub input_channels: i64,
    pub condition_channels: i64,
    pub output_channels: i64,
    pub filters: i64,
    pub resolution: i64,
}

impl Default for UNetConfig {
    fn default() -> Self {
        UNetConfig { input_channels: 3, condition_channels: 3, output_channels: 3, filters: 64, resolution: 512 }
    }
}

#[derive(Debug)]
struct Encoder {
    convs: Vec<(SameConv2D, Option<nn::BatchNorm>)>,
    down: SameConv2D,
    norm: nn::BatchNorm,
}

impl Encoder {
    fn new(path: nn::Path, c_in: i64, c_out: i64, repeat: usize, first: bool) -> Encoder {
        let mut convs = Vec::with_capacity(repeat);
        let mut c = c_in;
        for i in 0..repeat {
            let conv = SameConv2D::new(&path / format!("conv_{i}"), c, c_out, KERNEL, 1, true);
            let norm = if first && i == 0 {
                None
            } else {
                Some(nn::batch_norm2d(&path / format!("batch_norm_{i}"), c_out, Default::default()))
            };
            convs.push((conv, norm));
            c = c_out;
        }
        let down = SameConv2D::new(&path / "down", c_out, c_out, KERNEL, 2, true);
        let norm = nn::batch_norm2d(&path / "down_norm", c_out, Default::default());
        Encoder { convs, down, norm }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut xs = xs.shallow_clone();
        for (conv, norm) in &self.convs {
            xs = conv.forward(&xs);
            if let Some(norm) = norm {
                xs = xs.apply_t(norm, train);
            }
            xs = xs.relu();
        }
        self.down.forward(&xs).apply_t(&self.norm, train).relu()
    }
}

#[derive(Debug)]
struct Decoder {
    convs: Vec<(SameConvTranspose2D, nn::BatchNorm)>,
    up: SameConvTranspose2D,
    norm: Option<nn::BatchNorm>,
    dropout: f64,
}

impl Decoder {
    fn new(path: nn::Path, c_in: i64, c_out: i64, repeat: usize, dropout: f64, last: bool) -> Decoder {
        let mut convs = Vec::with_capacity(repeat);
        let mut c = c_in;
        for i in 0..repeat {
            let conv = SameConvTranspose2D::new(&path / format!("conv_transpose_{i}"), c, c_out, KERNEL, 1);
            let norm = nn::batch_norm2d(&path / format!("batch_norm_{i}"), c_out, Default::default());
            convs.push((conv, norm));
            c = c_out;
        }
        let up = SameConvTranspose2D::new(&path / "up", c_out, c_out, KERNEL, 2);
        let norm = (!last).then(|| nn::batch_norm2d(&path / "up_norm", c_out, Default::default()));
        Decoder { convs, up, norm, dropout }
    }

    fn drop(&self, xs: Tensor, train: bool) -> Tensor {
        if self.dropout > 0.0 {
            xs.dropout(self.dropout, train)
        } else {
            xs
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut xs = xs.shallow_clone();
        for (conv, norm) in &self.convs {
            xs = self.drop(conv.forward(&xs), train).apply_t(norm, train).relu();
        }
        let xs = self.up.forward(&xs);
        match &self.norm {
            Some(norm) => self.drop(xs.apply_t(norm, train), train).relu(),
            None => xs.tanh(),
        }
    }
}

#[derive(Debug)]
pub struct UNetGenerator {
    config: UNetConfig,
    encoders: Vec<Encoder>,
    decoders: Vec<Decoder>,
}

impl UNetGenerator {
    pub fn new(path: nn::Path, config: UNetConfig) -> Result<UNetGenerator> {
        let expected = 1i64 << STAGES;
        if config.resolution != expected {
            return Err(Error::shape(
                "encoder-decoder generator",
                format!("input resolution must be {expected}x{expected}, got {}", config.resolution),
            ));
        }

        let f = config.filters;
        let mut encoders = Vec::with_capacity(STAGES);
        let mut enc_channels = Vec::with_capacity(STAGES);
        let mut c = config.input_channels + config.condition_channels;
        for (i, &(mult, repeat)) in ENCODER_PLAN.iter().enumerate() {
            let c_out = f * mult;
            encoders.push(Encoder::new(&path / format!("encoder_{}", i + 1), c, c_out, repeat, i == 0));
            enc_channels.push(c_out);
            c = c_out;
        }

        let mut decoders = Vec::with_capacity(STAGES);
        for (i, &(mult, dropout, repeat)) in DECODER_PLAN.iter().enumerate() {
            let last = i == STAGES - 1;
            let c_in = if i == 0 { c } else { c + enc_channels[STAGES - 1 - i] };
            let c_out = if last { config.output_channels } else { f * mult };
            decoders.push(Decoder::new(&path / format!("decoder_{i}"), c_in, c_out, repeat, dropout, last));
            c = c_out;
        }

        Ok(UNetGenerator { config, encoders, decoders })
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn generate(&self, inputs: &Tensor, condition: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let xs = match condition {
            Some(cond) => concat_channels("generator input", &[inputs, cond])?,
            None => inputs.shallow_clone(),
        };
        let size = xs.size();
        let channels = self.config.input_channels + self.config.condition_channels;
        let res = self.config.resolution;
        if size.len() != 4 || size[1] != channels || size[2] != res || size[3] != res {
            return Err(Error::shape("generator input", format!("expected [_, {channels}, {res}, {res}], got {size:?}")));
        }

        let mut skips = Vec::with_capacity(STAGES);
        let mut xs = xs;
        for encoder in &self.encoders {
            xs = encoder.forward_t(&xs, train);
            skips.push(xs.shallow_clone());
        }

        for (i, decoder) in self.decoders.iter().enumerate() {
            if i > 0 {
                let skip = &skips[STAGES - 1 - i];
                xs = concat_channels(&format!("skip connection {i}"), &[&xs, skip])?;
            }
            xs = decoder.forward_t(&xs, train);
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn rejects_other_resolutions() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = UNetConfig { resolution: 256, filters: 1, ..Default::default() };
        assert!(matches!(UNetGenerator::new(vs.root(), config), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn translates_at_full_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = UNetConfig { filters: 1, ..Default::default() };
        let generator = UNetGenerator::new(vs.root(), config).unwrap();
        let source = Tensor::rand([1, 3, 512, 512], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;
        let out = tch::no_grad(|| generator.generate(&source, Some(&source), false)).unwrap();
        assert_eq!(out.size(), [1, 3, 512, 512]);
        assert!(out.abs().max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn rejects_missing_condition() {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = UNetGenerator::new(vs.root(), UNetConfig { filters: 1, ..Default::default() }).unwrap();
        let source = Tensor::zeros([1, 3, 512, 512], (Kind::Float, Device::Cpu));
        assert!(generator.generate(&source, None, false).is_err());
    }
}
