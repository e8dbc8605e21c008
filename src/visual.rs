//! Image grids, loss curves and animations.

use std::fs::File;
use std::path::Path;

use gif::{Encoder, Frame, Repeat};
use tch::{Kind, Tensor};

use crate::error::{Error, Result};

/// Lays out the first `block * block` samples (values in [-1, 1]) as one
/// `[3, block * H, block * W]` u8 image. Missing cells stay black.
pub fn image_grid(samples: &Tensor, block: i64) -> Result<Tensor> {
    let size = samples.size();
    if size.len() != 4 || !(size[1] == 1 || size[1] == 3) {
        return Err(Error::shape("image grid", format!("expected [N, 1|3, H, W], got {size:?}")));
    }
    let (n, h, w) = (size[0], size[2], size[3]);
    let cells = block * block;
    let pixels = ((samples.to_kind(Kind::Float) + 1.0) * 127.5).clamp(0.0, 255.0).to_kind(Kind::Uint8);
    let pixels = if size[1] == 1 { pixels.repeat([1, 3, 1, 1]) } else { pixels };
    let pixels = if n >= cells {
        pixels.narrow(0, 0, cells)
    } else {
        let pad = Tensor::zeros([cells - n, 3, h, w], (Kind::Uint8, pixels.device()));
        Tensor::cat(&[pixels, pad], 0)
    };
    Ok(pixels
        .view([block, block, 3, h, w])
        .permute([2, 0, 3, 1, 4])
        .reshape([3, block * h, block * w]))
}

pub fn save_grid(samples: &Tensor, block: i64, path: impl AsRef<Path>) -> Result<Tensor> {
    let grid = image_grid(samples, block)?;
    tch::vision::image::save(&grid, path.as_ref())?;
    Ok(grid)
}

/// Writes `[3, H, W]` u8 frames as a looping GIF; `delay` is in 1/100 s.
pub fn write_gif(frames: &[Tensor], delay: u16, path: impl AsRef<Path>) -> Result<()> {
    let Some(first) = frames.first() else {
        return Ok(());
    };
    let size = first.size();
    let (height, width) = (size[1], size[2]);
    let (w, h) = match (u16::try_from(width), u16::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(Error::shape("gif", format!("frame {width}x{height} is too large"))),
    };

    let path = path.as_ref();
    let mut file = File::create(path).map_err(|e| Error::resource(path, e))?;
    let mut encoder = Encoder::new(&mut file, w, h, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    let len = (3 * width * height) as usize;
    let mut data = vec![0u8; len];
    for frame in frames {
        if frame.size() != size {
            return Err(Error::shape("gif", format!("frame {:?} differs from {size:?}", frame.size())));
        }
        let hwc = frame.permute([1, 2, 0]).contiguous().to_kind(Kind::Uint8);
        hwc.copy_data(&mut data, len);
        let mut frame = Frame::from_rgb(w, h, &data);
        frame.delay = delay;
        encoder.write_frame(&frame)?;
    }
    Ok(())
}

/// `steps` evenly spaced points on the segment from `start` to `end`.
pub fn interpolate(start: &Tensor, end: &Tensor, steps: usize) -> Vec<Tensor> {
    let last = steps.saturating_sub(1).max(1) as f64;
    (0..steps)
        .map(|i| {
            let l = i as f64 / last;
            (1.0 - l) * start + l * end
        })
        .collect()
}

const CANVAS_W: usize = 640;
const CANVAS_H: usize = 480;
const MARGIN: usize = 40;
const DISCRIMINATOR_COLOR: [u8; 3] = [31, 119, 180];
const GENERATOR_COLOR: [u8; 3] = [255, 127, 14];

struct Canvas {
    pixels: Vec<u8>,
}

impl Canvas {
    fn new() -> Canvas {
        Canvas { pixels: vec![255; CANVAS_W * CANVAS_H * 3] }
    }

    fn put(&mut self, x: i64, y: i64, color: [u8; 3]) {
        if x < 0 || y < 0 || x >= CANVAS_W as i64 || y >= CANVAS_H as i64 {
            return;
        }
        let at = (y as usize * CANVAS_W + x as usize) * 3;
        self.pixels[at..at + 3].copy_from_slice(&color);
    }

    fn line(&mut self, (x0, y0): (i64, i64), (x1, y1): (i64, i64), color: [u8; 3]) {
        let (dx, dy) = ((x1 - x0).abs(), -(y1 - y0).abs());
        let (sx, sy) = (if x0 < x1 { 1 } else { -1 }, if y0 < y1 { 1 } else { -1 });
        let (mut x, mut y, mut err) = (x0, y0, dx + dy);
        loop {
            self.put(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn into_tensor(self) -> Tensor {
        Tensor::from_slice(&self.pixels)
            .view([CANVAS_H as i64, CANVAS_W as i64, 3])
            .permute([2, 0, 1])
    }
}

/// Plots both loss series on shared axes and saves the figure as an image.
pub fn save_loss_curve(discriminator: &[f64], generator: &[f64], path: impl AsRef<Path>) -> Result<()> {
    let mut canvas = Canvas::new();
    let (left, right) = (MARGIN as i64, (CANVAS_W - MARGIN) as i64);
    let (top, bottom) = (MARGIN as i64, (CANVAS_H - MARGIN) as i64);
    canvas.line((left, top), (left, bottom), [0, 0, 0]);
    canvas.line((left, bottom), (right, bottom), [0, 0, 0]);

    let finite = discriminator.iter().chain(generator).copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if lo.is_finite() {
        let span = if hi > lo { hi - lo } else { 1.0 };
        let len = discriminator.len().max(generator.len()).max(2) - 1;
        let to_point = |i: usize, v: f64| {
            let x = left + ((right - left) as f64 * i as f64 / len as f64) as i64;
            let y = bottom - ((bottom - top) as f64 * (v - lo) / span) as i64;
            (x, y)
        };
        for (series, color) in [(discriminator, DISCRIMINATOR_COLOR), (generator, GENERATOR_COLOR)] {
            let points: Vec<_> = series
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_finite())
                .map(|(i, &v)| to_point(i, v))
                .collect();
            for pair in points.windows(2) {
                canvas.line(pair[0], pair[1], color);
            }
            if let [only] = points.as_slice() {
                canvas.put(only.0, only.1, color);
            }
        }
    }
    tch::vision::image::save(&canvas.into_tensor(), path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn grid_tiles_samples_row_major() {
        let samples = Tensor::cat(
            &[
                Tensor::full([1, 1, 2, 2], -1.0, (Kind::Float, Device::Cpu)),
                Tensor::full([1, 1, 2, 2], 1.0, (Kind::Float, Device::Cpu)),
            ],
            0,
        );
        let grid = image_grid(&samples, 2).unwrap();
        assert_eq!(grid.size(), [3, 4, 4]);
        assert_eq!(grid.int64_value(&[0, 0, 0]), 0);
        assert_eq!(grid.int64_value(&[0, 0, 2]), 255);
        // Third and fourth cells are padding.
        assert_eq!(grid.int64_value(&[1, 3, 3]), 0);
    }

    #[test]
    fn writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let samples = Tensor::rand([4, 1, 28, 28], (Kind::Float, Device::Cpu)) * 2.0 - 1.0;
        let grid = save_grid(&samples, 2, dir.path().join("grid.png")).unwrap();
        write_gif(&[grid.shallow_clone(), grid], 30, dir.path().join("grid.gif")).unwrap();
        save_loss_curve(&[1.0, 0.5, 0.7], &[0.2, 0.9, f64::NAN], dir.path().join("losses.png")).unwrap();
        save_loss_curve(&[], &[], dir.path().join("empty.png")).unwrap();

        for name in ["grid.png", "grid.gif", "losses.png", "empty.png"] {
            assert!(dir.path().join(name).metadata().unwrap().len() > 0, "{name}");
        }
    }

    #[test]
    fn interpolation_hits_both_ends() {
        let a = Tensor::zeros([1, 4], (Kind::Float, Device::Cpu));
        let b = Tensor::ones([1, 4], (Kind::Float, Device::Cpu));
        let path = interpolate(&a, &b, 5);
        assert_eq!(path.len(), 5);
        assert!(path[0].equal(&a));
        assert!(path[4].allclose(&b, 1e-6, 1e-6, false));
        assert!((path[2].double_value(&[0, 0]) - 0.5).abs() < 1e-6);
    }
}
