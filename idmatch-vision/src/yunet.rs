//! YuNet detector post-processing.
//!
//! YuNet is anchor-free: every cell of the stride-8/16/32 feature grids predicts
//! one candidate face. The network emits twelve tensors, four per stride, in the
//! order `cls_8, cls_16, cls_32, obj_8, obj_16, obj_32, bbox_8, .., kps_32`.
//! Each is shaped `[1, cells, k]` with k = 1, 1, 4 and 10 respectively.
//!
//! Per cell at grid position (row, col):
//!   score = sqrt(clamp(cls) * clamp(obj))
//!   cx = (col + dx) * stride,  cy = (row + dy) * stride
//!   w  = exp(dw) * stride,     h  = exp(dh) * stride
//!   landmark k = ((col + kx) * stride, (row + ky) * stride)
//! Coordinates are returned normalized to the square input canvas.

use anyhow::Result;
use ndarray::Array2;

pub const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h (normalized [0,1])
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,..,x5,y5 (normalized [0,1])
}

/// Predictions of one stride, one row per grid cell.
#[derive(Debug, Clone)]
pub struct StrideOutputs {
    pub stride: usize,
    pub cls: Array2<f32>,
    pub obj: Array2<f32>,
    pub bbox: Array2<f32>,
    pub kps: Array2<f32>,
}

/// The coarsest stride is 32, so the square input must divide evenly by it.
pub fn check_input_size(input_size: usize) -> Result<()> {
    if input_size == 0 || input_size % 32 != 0 {
        anyhow::bail!("YuNet input size must be a positive multiple of 32, got {}", input_size);
    }
    Ok(())
}

/// Group the flat output list by stride and check every shape against the input size.
pub fn parse_outputs(outputs: &[(&[i64], &[f32])], input_size: usize) -> Result<Vec<StrideOutputs>> {
    check_input_size(input_size)?;
    if outputs.len() < 12 {
        anyhow::bail!("YuNet produced {} outputs, expected 12", outputs.len());
    }

    STRIDES
        .iter()
        .enumerate()
        .map(|(i, &stride)| {
            let side = input_size / stride;
            let cells = side * side;
            Ok(StrideOutputs {
                stride,
                cls: tensor(outputs, i, cells, 1, "cls")?,
                obj: tensor(outputs, i + 3, cells, 1, "obj")?,
                bbox: tensor(outputs, i + 6, cells, 4, "bbox")?,
                kps: tensor(outputs, i + 9, cells, 10, "kps")?,
            })
        })
        .collect()
}

fn tensor(
    outputs: &[(&[i64], &[f32])],
    index: usize,
    cells: usize,
    width: usize,
    label: &str,
) -> Result<Array2<f32>> {
    let (shape, data) = outputs[index];
    let expected = [1, cells as i64, width as i64];
    if shape != &expected[..] {
        anyhow::bail!(
            "unexpected {} shape at output {}: {:?}, expected {:?}",
            label,
            index,
            shape,
            expected
        );
    }
    Ok(Array2::from_shape_vec((cells, width), data.to_vec())?)
}

/// Decode every cell scoring at least `score_threshold`.
pub fn decode(strides: &[StrideOutputs], score_threshold: f32, input_size: usize) -> Vec<RawDetection> {
    let norm = input_size as f32;
    let mut detections = Vec::new();

    for out in strides {
        let side = input_size / out.stride;
        let stride = out.stride as f32;

        for row in 0..side {
            for col in 0..side {
                let idx = row * side + col;
                let score = face_score(out.cls[[idx, 0]], out.obj[[idx, 0]]);
                if score < score_threshold {
                    continue;
                }

                let cx = (col as f32 + out.bbox[[idx, 0]]) * stride;
                let cy = (row as f32 + out.bbox[[idx, 1]]) * stride;
                let w = out.bbox[[idx, 2]].exp() * stride;
                let h = out.bbox[[idx, 3]].exp() * stride;

                let mut landmarks = [0.0f32; 10];
                for k in 0..5 {
                    landmarks[k * 2] = (col as f32 + out.kps[[idx, k * 2]]) * stride / norm;
                    landmarks[k * 2 + 1] = (row as f32 + out.kps[[idx, k * 2 + 1]]) * stride / norm;
                }

                detections.push(RawDetection {
                    bbox: [(cx - w / 2.0) / norm, (cy - h / 2.0) / norm, w / norm, h / norm],
                    score,
                    landmarks,
                });
            }
        }
    }

    detections
}

/// Geometric mean of the clamped class and objectness probabilities.
pub fn face_score(cls: f32, obj: f32) -> f32 {
    (cls.clamp(0.0, 1.0) * obj.clamp(0.0, 1.0)).sqrt()
}
