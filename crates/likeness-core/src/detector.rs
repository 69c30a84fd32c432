//! YOLO face detector via ONNX Runtime.
//!
//! Runs a single-class YOLO face model on a letterboxed RGB image. Both the
//! raw `[1, 4 + C, N]` head (followed by NMS here) and the end-to-end
//! `[1, N, 6]` head (already suppressed by the model) are supported.

use crate::types::{BoundingBox, DetectedFace, Detector};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const YOLO_INPUT_SIZE: u32 = 640;
/// Letterbox fill value, the grey YOLO was trained with.
const YOLO_PAD_VALUE: u8 = 114;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const YOLO_NMS_THRESHOLD: f32 = 0.45;
/// Values per row of the end-to-end head: x1, y1, x2, y2, score, class.
const END_TO_END_ROW: usize = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — place the face detection model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// YOLO-based face detector.
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
}

impl FaceDetector {
    /// Load the YOLO ONNX model from the given path.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            confidence_threshold,
            "loaded YOLO face model"
        );

        Ok(Self {
            session,
            confidence_threshold,
        })
    }

    /// Detect faces in an RGB image, returning bounding boxes sorted by confidence.
    pub fn detect_boxes(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;
        let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        let boxes = decode_output(&shape, data, &letterbox, self.confidence_threshold)?;
        let mut boxes: Vec<BoundingBox> = boxes
            .into_iter()
            .filter_map(|b| clamp_to_image(b, width, height))
            .collect();
        sort_by_confidence(&mut boxes);

        tracing::debug!(faces = boxes.len(), width, height, "detection complete");
        Ok(boxes)
    }
}

impl Detector for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let boxes = self.detect_boxes(image)?;
        Ok(boxes.into_iter().map(|bbox| crop_face(image, bbox)).collect())
    }
}

/// Cut the box region out of the source image.
pub fn crop_face(image: &RgbImage, bbox: BoundingBox) -> DetectedFace {
    let x = bbox.x1 as u32;
    let y = bbox.y1 as u32;
    let w = (bbox.width() as u32).max(1);
    let h = (bbox.height() as u32).max(1);
    let region = imageops::crop_imm(image, x, y, w, h).to_image();
    DetectedFace { bbox, region }
}

/// Letterbox an RGB image into a 640×640 NCHW tensor scaled to [0, 1].
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let size = YOLO_INPUT_SIZE as f32;
    let scale = (size / width as f32).min(size / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, YOLO_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, YOLO_INPUT_SIZE);
    let pad_x = (YOLO_INPUT_SIZE - new_w) as f32 / 2.0;
    let pad_y = (YOLO_INPUT_SIZE - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let side = YOLO_INPUT_SIZE as usize;
    let pad = YOLO_PAD_VALUE as f32 / 255.0;
    let mut tensor = Array4::<f32>::from_elem((1, 3, side, side), pad);

    let x0 = pad_x.floor() as usize;
    let y0 = pad_y.floor() as usize;
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x0 + x as usize, y0 + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x: x0 as f32, pad_y: y0 as f32 })
}

/// Decode a detection tensor of the given shape into boxes in source-image space.
fn decode_output(
    shape: &[usize],
    data: &[f32],
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Result<Vec<BoundingBox>, DetectorError> {
    let [_, rows, cols] = shape else {
        return Err(DetectorError::InferenceFailed(format!(
            "expected a rank-3 detection tensor, got shape {shape:?}"
        )));
    };
    let (rows, cols) = (*rows, *cols);
    if data.len() < rows * cols {
        return Err(DetectorError::InferenceFailed(format!(
            "detection tensor has {} values, shape {shape:?} needs {}",
            data.len(),
            rows * cols
        )));
    }

    if cols == END_TO_END_ROW && rows > cols {
        Ok(decode_end_to_end(data, rows, letterbox, threshold))
    } else if rows >= 5 {
        let raw = decode_raw_head(data, rows, cols, letterbox, threshold);
        Ok(nms(raw, YOLO_NMS_THRESHOLD))
    } else {
        Err(DetectorError::InferenceFailed(format!(
            "unrecognized detection tensor shape {shape:?}"
        )))
    }
}

/// `[N, 6]` rows of x1, y1, x2, y2, score, class in letterboxed space.
fn decode_end_to_end(
    data: &[f32],
    rows: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    data.chunks_exact(END_TO_END_ROW)
        .take(rows)
        .filter(|row| row[4] > threshold)
        .map(|row| {
            let (x1, y1) = letterbox.unmap(row[0], row[1]);
            let (x2, y2) = letterbox.unmap(row[2], row[3]);
            BoundingBox { x1, y1, x2, y2, confidence: row[4] }
        })
        .collect()
}

/// Channels-first `[4 + C, N]` head: cx, cy, w, h, then one score per class.
fn decode_raw_head(
    data: &[f32],
    channels: usize,
    anchors: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let at = |c: usize, i: usize| data[c * anchors + i];
    let mut detections = Vec::new();

    for i in 0..anchors {
        let score = (4..channels).map(|c| at(c, i)).fold(f32::MIN, f32::max);
        if score <= threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
        detections.push(BoundingBox { x1, y1, x2, y2, confidence: score });
    }

    detections
}

/// Clamp a box to the image and snap it to whole pixels. Drops empty boxes.
fn clamp_to_image(b: BoundingBox, width: u32, height: u32) -> Option<BoundingBox> {
    let (w, h) = (width as f32, height as f32);
    let clamped = BoundingBox {
        x1: b.x1.clamp(0.0, w).floor(),
        y1: b.y1.clamp(0.0, h).floor(),
        x2: b.x2.clamp(0.0, w).ceil(),
        y2: b.y2.clamp(0.0, h).ceil(),
        confidence: b.confidence,
    };
    (clamped.width() >= 1.0 && clamped.height() >= 1.0).then_some(clamped)
}

fn sort_by_confidence(boxes: &mut [BoundingBox]) {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    sort_by_confidence(&mut detections);

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter_area = inter_w * inter_h;
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x1: x, y1: y, x2: x + w, y2: y + h, confidence: conf }
    }

    const IDENTITY: LetterboxInfo = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, YOLO_NMS_THRESHOLD);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], YOLO_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_decode_raw_head() {
        // 5 channels (cx, cy, w, h, score) x 3 anchors, channels-first
        let data = vec![
            50.0, 300.0, 52.0, // cx
            50.0, 300.0, 50.0, // cy
            20.0, 40.0, 20.0, // w
            20.0, 40.0, 20.0, // h
            0.9, 0.3, 0.8, // score
        ];
        let boxes = decode_output(&[1, 5, 3], &data, &IDENTITY, DEFAULT_CONFIDENCE_THRESHOLD).unwrap();
        // anchor 1 is below threshold, anchor 2 overlaps anchor 0 and is suppressed
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0], make_bbox(40.0, 40.0, 20.0, 20.0, 0.9));
    }

    #[test]
    fn test_decode_end_to_end_head() {
        let mut data = vec![0.0f32; 7 * END_TO_END_ROW];
        data[..6].copy_from_slice(&[10.0, 20.0, 30.0, 60.0, 0.95, 0.0]);
        data[6..12].copy_from_slice(&[100.0, 100.0, 150.0, 160.0, 0.4, 0.0]);
        let boxes = decode_output(&[1, 7, 6], &data, &IDENTITY, DEFAULT_CONFIDENCE_THRESHOLD).unwrap();
        assert_eq!(boxes, vec![BoundingBox { x1: 10.0, y1: 20.0, x2: 30.0, y2: 60.0, confidence: 0.95 }]);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        assert!(decode_output(&[1, 3], &[0.0; 3], &IDENTITY, 0.5).is_err());
        assert!(decode_output(&[1, 5, 4], &[0.0; 3], &IDENTITY, 0.5).is_err());
    }

    #[test]
    fn test_letterbox_unmap() {
        let image = RgbImage::new(320, 240);
        let (tensor, letterbox) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(letterbox.scale, 2.0);
        assert_eq!(letterbox.pad_x, 0.0);
        assert_eq!(letterbox.pad_y, 80.0);

        let (x, y) = letterbox.unmap(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
        // padding rows keep the fill value
        assert!((tensor[[0, 0, 0, 0]] - YOLO_PAD_VALUE as f32 / 255.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 320, 320]], 0.0);
    }

    #[test]
    fn test_clamp_to_image() {
        let b = BoundingBox { x1: -5.0, y1: 10.2, x2: 700.0, y2: 50.7, confidence: 0.9 };
        let c = clamp_to_image(b, 640, 480).unwrap();
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (0.0, 10.0, 640.0, 51.0));

        let outside = BoundingBox { x1: 700.0, y1: 10.0, x2: 800.0, y2: 50.0, confidence: 0.9 };
        assert!(clamp_to_image(outside, 640, 480).is_none());
    }

    #[test]
    fn test_crop_face_region_size() {
        let image = RgbImage::from_pixel(100, 80, image::Rgb([10, 20, 30]));
        let face = crop_face(&image, make_bbox(10.0, 20.0, 30.0, 40.0, 0.9));
        assert_eq!(face.region.dimensions(), (30, 40));
        assert_eq!(face.region.get_pixel(0, 0), &image::Rgb([10, 20, 30]));
    }
}
