use anyhow::Result;
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Value};

use crate::error::{VisionError, VisionResult};
use crate::yunet;

/// SFace input side, also the reference frame of the ArcFace landmark template.
pub const ALIGNED_SIZE: u32 = 112;

/// Detection result from YuNet, in source image pixels
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // right eye, left eye, nose, mouth corners as x,y pairs
}

/// Face descriptor tagged with the provider that produced it.
///
/// Descriptors are only comparable when both the provider tag and the
/// dimensionality agree; [`Descriptor::distance`] refuses anything else.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    provider: &'static str,
    vector: Array1<f32>,
}

impl Descriptor {
    pub fn new(provider: &'static str, values: Vec<f32>) -> Self {
        Self {
            provider,
            vector: Array1::from_vec(values),
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }

    /// Euclidean distance to another descriptor of the same provider and length.
    pub fn distance(&self, other: &Descriptor) -> VisionResult<f32> {
        if self.provider != other.provider || self.dim() != other.dim() {
            return Err(VisionError::IncompatibleDescriptors {
                left: self.provider,
                left_dim: self.dim(),
                right: other.provider,
                right_dim: other.dim(),
            });
        }
        let diff = &self.vector - &other.vector;
        Ok(diff.dot(&diff).sqrt())
    }
}

/// Square canvas placement of a source image, used to undo the letterboxing.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    side: u32,
    scale: f32,
    offset_x: u32,
    offset_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, side: u32) -> Self {
        let scale = side as f32 / width.max(height) as f32;
        let fitted_w = ((width as f32 * scale) as u32).clamp(1, side);
        let fitted_h = ((height as f32 * scale) as u32).clamp(1, side);
        Self {
            side,
            scale,
            offset_x: (side - fitted_w) / 2,
            offset_y: (side - fitted_h) / 2,
        }
    }

    fn fitted_size(&self, width: u32, height: u32) -> (u32, u32) {
        (
            ((width as f32 * self.scale) as u32).clamp(1, self.side),
            ((height as f32 * self.scale) as u32).clamp(1, self.side),
        )
    }

    /// Canvas-normalized point back to source pixels.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let side = self.side as f32;
        (
            (x * side - self.offset_x as f32) / self.scale,
            (y * side - self.offset_y as f32) / self.scale,
        )
    }
}

/// Planar BGR float tensor data in [0, 255], the layout both YuNet and SFace take.
fn bgr_planes(img: &RgbImage) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, px) in img.pixels().enumerate() {
        data[i] = px[2] as f32;
        data[plane + i] = px[1] as f32;
        data[2 * plane + i] = px[0] as f32;
    }
    data
}

/// Detect faces with YuNet on a letterboxed square canvas of `input_size` pixels.
pub fn detect_faces(
    session: &mut Session,
    img: &RgbImage,
    input_size: u32,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    yunet::check_input_size(input_size as usize)?;
    let letterbox = Letterbox::fit(img.width(), img.height(), input_size);
    let (fitted_w, fitted_h) = letterbox.fitted_size(img.width(), img.height());
    let resized = image::imageops::resize(img, fitted_w, fitted_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(input_size, input_size);
    image::imageops::overlay(
        &mut canvas,
        &resized,
        letterbox.offset_x as i64,
        letterbox.offset_y as i64,
    );

    let side = input_size as usize;
    let input_array = Array4::from_shape_vec((1, 3, side, side), bgr_planes(&canvas))?;
    let input_tensor = Value::from_array(input_array)?;
    let outputs = session.run(ort::inputs![input_tensor])?;

    let mut output_data: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        output_data.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let output_refs: Vec<(&[i64], &[f32])> = output_data
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let strides = yunet::parse_outputs(&output_refs, side)?;
    let detections: Vec<Detection> = yunet::decode(&strides, score_threshold, side)
        .into_iter()
        .map(|raw| {
            let (x, y) = letterbox.to_source(raw.bbox[0], raw.bbox[1]);
            let (x2, y2) = letterbox.to_source(raw.bbox[0] + raw.bbox[2], raw.bbox[1] + raw.bbox[3]);
            let mut landmarks = [0.0f32; 10];
            for k in 0..5 {
                let (lx, ly) = letterbox.to_source(raw.landmarks[k * 2], raw.landmarks[k * 2 + 1]);
                landmarks[k * 2] = lx;
                landmarks[k * 2 + 1] = ly;
            }
            Detection {
                bbox: [x, y, x2 - x, y2 - y],
                score: raw.score,
                landmarks,
            }
        })
        .collect();

    log::debug!(
        "yunet: {} candidate(s) above {:.2} at input {}",
        detections.len(),
        score_threshold,
        input_size
    );

    Ok(if nms_threshold < 1.0 {
        nms(&detections, nms_threshold)
    } else {
        detections
    })
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for det in sorted {
        if keep.iter().all(|k| compute_iou(&k.bbox, &det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Rotation + uniform scale + translation taking the eye line onto the template.
#[derive(Debug, Clone, Copy)]
struct EyeTransform {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl EyeTransform {
    // ArcFace template eye positions in the 112x112 frame
    const LEFT_EYE: (f32, f32) = (38.2946, 51.6963);
    const RIGHT_EYE: (f32, f32) = (73.5318, 51.5014);

    fn from_eyes(left: (f32, f32), right: (f32, f32), size: u32) -> Self {
        let unit = size as f32 / ALIGNED_SIZE as f32;
        let (dst_l, dst_r) = (
            (Self::LEFT_EYE.0 * unit, Self::LEFT_EYE.1 * unit),
            (Self::RIGHT_EYE.0 * unit, Self::RIGHT_EYE.1 * unit),
        );

        let (sx, sy) = (right.0 - left.0, right.1 - left.1);
        let (dx, dy) = (dst_r.0 - dst_l.0, dst_r.1 - dst_l.1);
        let src_len2 = (sx * sx + sy * sy).max(f32::EPSILON);

        // Complex division (dst / src) gives scale*cos and scale*sin directly.
        let a = (dx * sx + dy * sy) / src_len2;
        let b = (dy * sx - dx * sy) / src_len2;

        let src_mid = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);
        let dst_mid = ((dst_l.0 + dst_r.0) / 2.0, (dst_l.1 + dst_r.1) / 2.0);
        Self {
            a,
            b,
            tx: dst_mid.0 - (a * src_mid.0 - b * src_mid.1),
            ty: dst_mid.1 - (b * src_mid.0 + a * src_mid.1),
        }
    }

    /// Output pixel back to source coordinates.
    fn invert(&self, x: f32, y: f32) -> (f32, f32) {
        let det = (self.a * self.a + self.b * self.b).max(f32::EPSILON);
        let (px, py) = (x - self.tx, y - self.ty);
        ((self.a * px + self.b * py) / det, (-self.b * px + self.a * py) / det)
    }
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Option<Rgb<u8>> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x >= w as f32 || y >= h as f32 {
        return None;
    }

    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let weights = [
        (x0, y0, (1.0 - fx) * (1.0 - fy)),
        (x1, y0, fx * (1.0 - fy)),
        (x0, y1, (1.0 - fx) * fy),
        (x1, y1, fx * fy),
    ];

    let mut acc = [0.0f32; 3];
    for (px, py, wgt) in weights {
        let p = img.get_pixel(px, py);
        for c in 0..3 {
            acc[c] += p[c] as f32 * wgt;
        }
    }
    Some(Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8)))
}

/// Warp the detected face onto a `size`x`size` crop with the eyes on the template.
/// YuNet reports the subject's right eye first.
pub fn align_face(img: &RgbImage, detection: &Detection, size: u32) -> RgbImage {
    let right_eye = (detection.landmarks[0], detection.landmarks[1]);
    let left_eye = (detection.landmarks[2], detection.landmarks[3]);
    // Template "left" is the eye on the left of the picture.
    let (img_left, img_right) = if right_eye.0 <= left_eye.0 {
        (right_eye, left_eye)
    } else {
        (left_eye, right_eye)
    };
    let transform = EyeTransform::from_eyes(img_left, img_right, size);

    RgbImage::from_fn(size, size, |x, y| {
        let (sx, sy) = transform.invert(x as f32, y as f32);
        sample_bilinear(img, sx, sy).unwrap_or(Rgb([0, 0, 0]))
    })
}

/// Run SFace on an aligned crop and return the L2-normalized embedding values.
pub fn encode_face(session: &mut Session, aligned: &RgbImage) -> Result<Vec<f32>> {
    let size = ALIGNED_SIZE;
    let face = if aligned.dimensions() == (size, size) {
        aligned.clone()
    } else {
        image::imageops::resize(aligned, size, size, FilterType::Triangle)
    };

    let input_array = Array4::from_shape_vec((1, 3, size as usize, size as usize), bgr_planes(&face))?;
    let input_tensor = Value::from_array(input_array)?;
    let outputs = session.run(ort::inputs![input_tensor])?;
    let (_shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    Ok(l2_normalize(data.to_vec()))
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
