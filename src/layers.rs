//! Layer primitives shared by the generator and discriminator networks.
//!
//! libtorch only pads convolutions symmetrically, while the network shapes
//! used here follow the "same"/"valid" convention where the output size is
//! `ceil(n / stride)` and odd padding goes to the bottom/right edge. The
//! wrappers below pad (or crop, for transposed convolutions) explicitly.

use tch::{nn, Tensor};

use crate::error::{Error, Result};

pub const LEAKY_ALPHA: f64 = 0.2;

/// Xavier-uniform initialisation for a layer with the given fan sizes.
pub fn xavier(fan_in: i64, fan_out: i64) -> nn::Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    nn::Init::Uniform { lo: -bound, up: bound }
}

pub fn leaky_relu(xs: &Tensor, alpha: f64) -> Tensor {
    xs.maximum(&(xs * alpha))
}

/// Padding `(before, after)` for one spatial axis under "same" semantics.
pub fn same_padding(size: i64, ksize: i64, stride: i64) -> (i64, i64) {
    let out = (size + stride - 1) / stride;
    let total = ((out - 1) * stride + ksize - size).max(0);
    (total / 2, total - total / 2)
}

pub fn dense(path: nn::Path, dim_in: i64, dim_out: i64) -> nn::Linear {
    nn::linear(path, dim_in, dim_out, nn::LinearConfig {
        ws_init: xavier(dim_in, dim_out),
        bs_init: Some(nn::Init::Const(0.)),
        bias: true,
    })
}

fn conv_config(c_in: i64, c_out: i64, ksize: i64, stride: i64, bias: bool) -> nn::ConvConfig {
    nn::ConvConfig {
        stride,
        padding: 0,
        bias,
        ws_init: xavier(c_in * ksize * ksize, c_out * ksize * ksize),
        bs_init: nn::Init::Const(0.),
        ..Default::default()
    }
}

/// Convolution with zero padding: every output sees a full kernel window.
pub fn valid_conv2d(path: nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64, bias: bool) -> nn::Conv2D {
    nn::conv2d(path, c_in, c_out, ksize, conv_config(c_in, c_out, ksize, stride, bias))
}

#[derive(Debug)]
pub struct SameConv2D {
    conv: nn::Conv2D,
    ksize: i64,
    stride: i64,
}

impl SameConv2D {
    pub fn new(path: nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64, bias: bool) -> SameConv2D {
        let conv = valid_conv2d(path, c_in, c_out, ksize, stride, bias);
        SameConv2D { conv, ksize, stride }
    }
}

impl nn::Module for SameConv2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (top, bottom) = same_padding(size[2], self.ksize, self.stride);
        let (left, right) = same_padding(size[3], self.ksize, self.stride);
        xs.constant_pad_nd(&[left, right, top, bottom]).apply(&self.conv)
    }
}

/// Transposed convolution without padding, output `(n - 1) * stride + ksize`.
pub fn valid_conv_transpose2d(path: nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64) -> nn::ConvTranspose2D {
    nn::conv_transpose2d(path, c_in, c_out, ksize, nn::ConvTransposeConfig {
        stride,
        padding: 0,
        dilation: 1,
        ws_init: xavier(c_in * ksize * ksize, c_out * ksize * ksize),
        bs_init: nn::Init::Const(0.),
        ..Default::default()
    })
}

/// Transposed convolution producing exactly `n * stride` outputs per axis.
#[derive(Debug)]
pub struct SameConvTranspose2D {
    conv: nn::ConvTranspose2D,
    ksize: i64,
    stride: i64,
}

impl SameConvTranspose2D {
    pub fn new(path: nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64) -> SameConvTranspose2D {
        debug_assert!(ksize >= stride);
        let conv = valid_conv_transpose2d(path, c_in, c_out, ksize, stride);
        SameConvTranspose2D { conv, ksize, stride }
    }
}

impl nn::Module for SameConvTranspose2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let before = (self.ksize - self.stride) / 2;
        xs.apply(&self.conv)
            .narrow(2, before, size[2] * self.stride)
            .narrow(3, before, size[3] * self.stride)
    }
}

/// Channel-wise concatenation of NCHW tensors that must agree on batch and
/// spatial extent.
pub fn concat_channels(context: &str, xs: &[&Tensor]) -> Result<Tensor> {
    let Some(first) = xs.first() else {
        return Err(Error::shape(context, "nothing to concatenate"));
    };
    let reference = first.size();
    for x in xs.iter().skip(1) {
        let size = x.size();
        let agree = size.len() == reference.len()
            && size.len() == 4
            && size[0] == reference[0]
            && size[2..] == reference[2..];
        if !agree {
            return Err(Error::shape(context, format!("cannot concatenate {reference:?} with {size:?}")));
        }
    }
    Ok(Tensor::cat(xs, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::Module, Device, Kind};

    #[test]
    fn same_padding_matches_expected_splits() {
        assert_eq!(same_padding(28, 4, 2), (1, 1));
        assert_eq!(same_padding(7, 4, 2), (1, 2));
        assert_eq!(same_padding(16, 4, 1), (1, 2));
        assert_eq!(same_padding(8, 1, 1), (0, 0));
    }

    #[test]
    fn same_convolutions_halve_and_double() {
        let vs = nn::VarStore::new(Device::Cpu);
        let down = SameConv2D::new(vs.root() / "down", 1, 4, 4, 2, true);
        let up = SameConvTranspose2D::new(vs.root() / "up", 4, 2, 4, 2);
        let flat = SameConv2D::new(vs.root() / "flat", 4, 4, 4, 1, false);

        let xs = Tensor::zeros([2, 1, 7, 7], (Kind::Float, Device::Cpu));
        let ys = down.forward(&xs);
        assert_eq!(ys.size(), [2, 4, 4, 4]);
        assert_eq!(flat.forward(&ys).size(), [2, 4, 4, 4]);
        assert_eq!(up.forward(&ys).size(), [2, 2, 8, 8]);
    }

    #[test]
    fn valid_transpose_grows_by_kernel() {
        let vs = nn::VarStore::new(Device::Cpu);
        let up = valid_conv_transpose2d(vs.root() / "up", 8, 4, 3, 2);
        let xs = Tensor::zeros([1, 8, 3, 3], (Kind::Float, Device::Cpu));
        assert_eq!(up.forward(&xs).size(), [1, 4, 7, 7]);
    }

    #[test]
    fn concat_rejects_spatial_mismatch() {
        let a = Tensor::zeros([1, 2, 4, 4], (Kind::Float, Device::Cpu));
        let b = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let c = Tensor::zeros([1, 3, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(concat_channels("test", &[&a, &b]).unwrap().size(), [1, 5, 4, 4]);
        assert!(matches!(concat_channels("test", &[&a, &c]), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn leaky_relu_scales_negatives() {
        let xs = Tensor::from_slice(&[-1.0f32, 2.0]);
        let ys = leaky_relu(&xs, LEAKY_ALPHA);
        assert!((ys.double_value(&[0]) + 0.2).abs() < 1e-6);
        assert!((ys.double_value(&[1]) - 2.0).abs() < 1e-6);
    }
}
