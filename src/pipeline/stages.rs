//! Built-in stages.
//!
//! All of them work on 8-bit frames of any supported format and never touch
//! anything outside the frame and the stage context.

use anyhow::{anyhow, Result};

use super::params::{ParamSpec, StageParams};
use super::stage::{Stage, StageContext};
use crate::detect::DetectionResult;
use crate::frame::{Frame, PixelFormat};

/// ITU-R BT.601 luma, integer form.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114 + 500) / 1000) as u8
}

/// Per-pixel brightness regardless of format.
fn luma_plane(frame: &Frame) -> Vec<u8> {
    let px = frame.pixels();
    match frame.format() {
        PixelFormat::Gray8 => px.to_vec(),
        PixelFormat::Rgb8 => px.chunks_exact(3).map(|p| luma(p[0], p[1], p[2])).collect(),
        PixelFormat::Bgr8 => px.chunks_exact(3).map(|p| luma(p[2], p[1], p[0])).collect(),
    }
}

fn param_int(params: &StageParams, name: &str) -> Result<i64> {
    params
        .int(name)
        .ok_or_else(|| anyhow!("parameter '{}' missing", name))
}

// ----------------------------------------------------------------------------
// Gray
// ----------------------------------------------------------------------------

/// Converts color frames to Gray8.
#[derive(Default)]
pub struct GrayStage;

impl Stage for GrayStage {
    fn type_name(&self) -> &'static str {
        "Gray"
    }

    fn execute(&mut self, frame: &mut Frame, _: &StageParams, _: &mut StageContext<'_>) -> Result<()> {
        if frame.format() == PixelFormat::Gray8 {
            return Ok(());
        }
        let gray = luma_plane(frame);
        frame.replace_image(frame.width(), frame.height(), PixelFormat::Gray8, gray)
    }
}

// ----------------------------------------------------------------------------
// Threshold
// ----------------------------------------------------------------------------

/// Sets channels inside [min, max] to 255 and everything else to 0.
#[derive(Default)]
pub struct ThresholdStage;

impl Stage for ThresholdStage {
    fn type_name(&self) -> &'static str {
        "Threshold"
    }

    fn schema(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::int("min", 0, 0, 255),
            ParamSpec::int("max", 255, 0, 255),
        ]
    }

    fn execute(
        &mut self,
        frame: &mut Frame,
        params: &StageParams,
        _: &mut StageContext<'_>,
    ) -> Result<()> {
        let min = param_int(params, "min")?;
        let max = param_int(params, "max")?;
        if min > max {
            return Err(anyhow!("empty band: min {} > max {}", min, max));
        }
        let (min, max) = (min as u8, max as u8);
        for v in frame.pixels_mut() {
            *v = if (min..=max).contains(v) { 255 } else { 0 };
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Invert
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct InvertStage;

impl Stage for InvertStage {
    fn type_name(&self) -> &'static str {
        "Invert"
    }

    fn execute(&mut self, frame: &mut Frame, _: &StageParams, _: &mut StageContext<'_>) -> Result<()> {
        for v in frame.pixels_mut() {
            *v = 255 - *v;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Blur
// ----------------------------------------------------------------------------

/// Separable box blur. Edges are clamped.
#[derive(Default)]
pub struct BlurStage;

impl BlurStage {
    /// Blur one line of `len` samples spaced `stride` apart.
    fn pass(src: &[u8], out: &mut [u8], len: usize, stride: usize, radius: usize) {
        for i in 0..len {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius).min(len - 1);
            let sum: u32 = (lo..=hi).map(|j| src[j * stride] as u32).sum();
            out[i * stride] = (sum / (hi - lo + 1) as u32) as u8;
        }
    }
}

impl Stage for BlurStage {
    fn type_name(&self) -> &'static str {
        "Blur"
    }

    fn schema(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::int("radius", 1, 0, 15)]
    }

    fn execute(
        &mut self,
        frame: &mut Frame,
        params: &StageParams,
        _: &mut StageContext<'_>,
    ) -> Result<()> {
        let radius = param_int(params, "radius")? as usize;
        if radius == 0 || frame.is_sentinel() {
            return Ok(());
        }
        let (w, h, ch) = (frame.width() as usize, frame.height() as usize, frame.channels());
        let src = frame.pixels().to_vec();
        let mut tmp = vec![0u8; src.len()];
        let mut out = vec![0u8; src.len()];
        for c in 0..ch {
            for y in 0..h {
                let offset = y * w * ch + c;
                Self::pass(&src[offset..], &mut tmp[offset..], w, ch, radius);
            }
            for x in 0..w {
                let offset = x * ch + c;
                Self::pass(&tmp[offset..], &mut out[offset..], h, w * ch, radius);
            }
        }
        frame.pixels_mut().copy_from_slice(&out);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// OriginalImage
// ----------------------------------------------------------------------------

/// Restores the frame the pipeline started from. Useful after analysis stages
/// when the published image should be the camera's.
#[derive(Default)]
pub struct OriginalImageStage;

impl Stage for OriginalImageStage {
    fn type_name(&self) -> &'static str {
        "OriginalImage"
    }

    fn execute(
        &mut self,
        frame: &mut Frame,
        _: &StageParams,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        *frame = ctx.original().clone();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Centroid
// ----------------------------------------------------------------------------

/// Reports the bounding box and center of mass of bright pixels.
///
/// The frame is left untouched.
#[derive(Default)]
pub struct CentroidStage;

impl Stage for CentroidStage {
    fn type_name(&self) -> &'static str {
        "Centroid"
    }

    fn schema(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::int("min_intensity", 128, 0, 255),
            ParamSpec::int("min_pixels", 1, 1, 1_000_000),
            ParamSpec::string("target", "blob"),
        ]
    }

    fn execute(
        &mut self,
        frame: &mut Frame,
        params: &StageParams,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        let min_intensity = param_int(params, "min_intensity")? as u8;
        let min_pixels = param_int(params, "min_pixels")? as u64;
        let target = params.str("target").unwrap_or("blob");

        let width = frame.width() as usize;
        let plane = luma_plane(frame);
        let (mut count, mut sum_x, mut sum_y) = (0u64, 0u64, 0u64);
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        for (idx, v) in plane.iter().enumerate() {
            if *v < min_intensity {
                continue;
            }
            let (x, y) = (idx % width, idx / width);
            count += 1;
            sum_x += x as u64;
            sum_y += y as u64;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        if count < min_pixels {
            return Ok(());
        }
        ctx.report(
            DetectionResult::new(
                target,
                sum_x as f32 / count as f32,
                sum_y as f32 / count as f32,
                (max_x - min_x + 1) as f32,
                (max_y - min_y + 1) as f32,
            )
            .with_annotation(format!("pixels={}", count)),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stage: &mut dyn Stage, frame: &mut Frame) -> Result<Vec<DetectionResult>> {
        let params = StageParams::from_schema(&stage.schema());
        let original = frame.clone();
        let mut ctx = StageContext::new(&original);
        stage.execute(frame, &params, &mut ctx)?;
        Ok(ctx.take_detections())
    }

    #[test]
    fn gray_converts_bgr_and_rgb_alike() -> Result<()> {
        let mut rgb = Frame::new(1, 1, PixelFormat::Rgb8, vec![255, 0, 0])?;
        let mut bgr = Frame::new(1, 1, PixelFormat::Bgr8, vec![0, 0, 255])?;
        run(&mut GrayStage, &mut rgb)?;
        run(&mut GrayStage, &mut bgr)?;
        assert_eq!(rgb.format(), PixelFormat::Gray8);
        assert_eq!(rgb.pixels(), &[76]);
        assert!(rgb.same_image(&bgr));
        Ok(())
    }

    #[test]
    fn threshold_rejects_inverted_band() -> Result<()> {
        let mut stage = ThresholdStage;
        let mut params = StageParams::from_schema(&stage.schema());
        params.replace("min", 200i64.into());
        params.replace("max", 100i64.into());
        let mut frame = Frame::filled(2, 2, PixelFormat::Gray8, 150);
        let original = frame.clone();
        let mut ctx = StageContext::new(&original);
        assert!(stage.execute(&mut frame, &params, &mut ctx).is_err());
        Ok(())
    }

    #[test]
    fn blur_smooths_a_single_spike() -> Result<()> {
        let mut data = vec![0u8; 9];
        data[4] = 90;
        let mut frame = Frame::new(3, 3, PixelFormat::Gray8, data)?;
        run(&mut BlurStage, &mut frame)?;
        assert_eq!(frame.pixel(1, 1, 0), Some(10));
        assert_eq!(frame.pixel(1, 0, 0), Some(15));
        assert_eq!(frame.pixel(0, 0, 0), Some(22));
        Ok(())
    }

    #[test]
    fn original_image_restores_input() -> Result<()> {
        let input = Frame::filled(2, 2, PixelFormat::Rgb8, 40);
        let mut frame = input.clone();
        run(&mut InvertStage, &mut frame)?;
        let mut ctx = StageContext::new(&input);
        OriginalImageStage.execute(&mut frame, &StageParams::default(), &mut ctx)?;
        assert!(frame.same_image(&input));
        Ok(())
    }

    #[test]
    fn centroid_reports_bright_box() -> Result<()> {
        let mut data = vec![0u8; 16];
        data[5] = 200; // (1, 1)
        data[10] = 200; // (2, 2)
        let mut frame = Frame::new(4, 4, PixelFormat::Gray8, data)?;
        let found = run(&mut CentroidStage, &mut frame)?;
        assert_eq!(
            found,
            vec![DetectionResult::new("blob", 1.5, 1.5, 2.0, 2.0).with_annotation("pixels=2")]
        );

        let mut dark = Frame::filled(4, 4, PixelFormat::Gray8, 0);
        assert!(run(&mut CentroidStage, &mut dark)?.is_empty());
        Ok(())
    }
}
