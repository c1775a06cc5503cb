//! InSwapper face swap model via ONNX Runtime.
//!
//! The model takes a 128×128 aligned target crop and a 512-d identity latent
//! derived from the source face, and returns the crop with the source identity.
//! The latent is the source embedding projected through the model's embedding
//! map (`emap`) and re-normalized. Paste-back warps the crop into the target
//! frame under a feathered mask.

use crate::alignment::{self, Affine};
use crate::pipeline::FaceSwapper;
use crate::recognizer::ARCFACE_EMBEDDING_DIM;
use crate::types::{DetectedFace, Embedding};
use image::{GrayImage, Luma, RgbImage};
use imageproc::morphology::{grayscale_erode, Mask};
use ndarray::{Array1, Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const INSWAPPER_INPUT_SIZE: usize = 128;
/// Default swap model file inside the model directory.
pub const SWAPPER_MODEL_FILE: &str = "inswapper_128.onnx";
/// Warped mask values above this count as fully inside the face region.
const MASK_THRESHOLD: f32 = 20.0;

#[derive(Error, Debug)]
pub enum SwapperError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("embedding map not found: {0} — export the model's final 512×512 initializer as little-endian f32")]
    EmapNotFound(String),
    #[error("embedding map {path}: expected {expected} bytes, got {actual}")]
    EmapSize {
        path: String,
        expected: usize,
        actual: usize,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("target face has no landmarks")]
    NoLandmarks,
    #[error("source face has no identity embedding")]
    MissingEmbedding,
    #[error("source embedding has {0} dimensions, expected 512")]
    EmbeddingDim(usize),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Sidecar path holding the embedding map for a swap model: `<model>.emap`.
pub fn emap_path_for(model_path: &Path) -> PathBuf {
    model_path.with_extension("emap")
}

/// Read a 512×512 embedding map stored as row-major little-endian f32.
pub fn load_emap(path: &Path) -> Result<Array2<f32>, SwapperError> {
    if !path.exists() {
        return Err(SwapperError::EmapNotFound(path.display().to_string()));
    }
    let bytes = std::fs::read(path)?;
    let expected = ARCFACE_EMBEDDING_DIM * ARCFACE_EMBEDDING_DIM * 4;
    if bytes.len() != expected {
        return Err(SwapperError::EmapSize {
            path: path.display().to_string(),
            expected,
            actual: bytes.len(),
        });
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((ARCFACE_EMBEDDING_DIM, ARCFACE_EMBEDDING_DIM), values)
        .map_err(|e| SwapperError::InferenceFailed(format!("emap shape: {e}")))
}

/// Project a source embedding through the embedding map and L2-normalize.
pub fn project_latent(
    embedding: &Embedding,
    emap: &Array2<f32>,
) -> Result<Array1<f32>, SwapperError> {
    if embedding.values.len() != emap.nrows() {
        return Err(SwapperError::EmbeddingDim(embedding.values.len()));
    }
    let source = Array1::from_vec(embedding.normalized().values);
    let latent = source.dot(emap);
    let norm = latent.dot(&latent).sqrt();
    Ok(if norm > 0.0 { latent / norm } else { latent })
}

/// InSwapper-128 face swap model.
pub struct InSwapper {
    session: Session,
    emap: Array2<f32>,
    target_input: String,
    source_input: String,
}

impl InSwapper {
    /// Load the swap model and its embedding map.
    pub fn load(
        model_path: &Path,
        emap_path: &Path,
        intra_threads: usize,
    ) -> Result<Self, SwapperError> {
        if !model_path.exists() {
            return Err(SwapperError::ModelNotFound(model_path.display().to_string()));
        }
        let emap = load_emap(emap_path)?;

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let input_names: Vec<String> =
            session.inputs().iter().map(|i| i.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            emap = %emap_path.display(),
            inputs = ?input_names,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded InSwapper model"
        );

        let (target_input, source_input) = discover_input_names(&input_names)?;

        Ok(Self {
            session,
            emap,
            target_input,
            source_input,
        })
    }

    fn run(&mut self, crop: &RgbImage, latent: Array1<f32>) -> Result<RgbImage, SwapperError> {
        let blob = target_blob(crop);
        let latent = latent.insert_axis(ndarray::Axis(0));

        let outputs = self.session.run(ort::inputs![
            self.target_input.as_str() => TensorRef::from_array_view(blob.view())?,
            self.source_input.as_str() => TensorRef::from_array_view(latent.view())?
        ])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapperError::InferenceFailed(format!("swap output: {e}")))?;

        tensor_to_rgb(data, INSWAPPER_INPUT_SIZE)
    }
}

impl FaceSwapper for InSwapper {
    type Error = SwapperError;

    fn swap(
        &mut self,
        image: &RgbImage,
        target_face: &DetectedFace,
        source_face: &DetectedFace,
        paste_back: bool,
    ) -> Result<RgbImage, SwapperError> {
        let landmarks = target_face.landmarks().ok_or(SwapperError::NoLandmarks)?;
        let embedding = source_face
            .embedding
            .as_ref()
            .ok_or(SwapperError::MissingEmbedding)?;

        let latent = project_latent(embedding, &self.emap)?;
        let (crop, matrix) = alignment::align_face(image, landmarks, INSWAPPER_INPUT_SIZE);
        let fake = self.run(&crop, latent)?;

        if !paste_back {
            return Ok(fake);
        }
        Ok(paste_back_into(image, &fake, &matrix))
    }
}

/// Pick the target-crop and source-latent input names.
///
/// Exports name them "target" and "source"; otherwise the first input is the
/// crop and the second the latent.
fn discover_input_names(names: &[String]) -> Result<(String, String), SwapperError> {
    if names.len() < 2 {
        return Err(SwapperError::InferenceFailed(format!(
            "swap model requires 2 inputs (target, source), got {}",
            names.len()
        )));
    }
    let has = |n: &str| names.iter().any(|name| name == n);
    if has("target") && has("source") {
        Ok(("target".to_string(), "source".to_string()))
    } else {
        Ok((names[0].clone(), names[1].clone()))
    }
}

/// RGB crop → NCHW tensor scaled to [0, 1].
fn target_blob(crop: &RgbImage) -> Array4<f32> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// NCHW tensor in [0, 1] → RGB image.
fn tensor_to_rgb(data: &[f32], size: usize) -> Result<RgbImage, SwapperError> {
    let plane = size * size;
    if data.len() != 3 * plane {
        return Err(SwapperError::InferenceFailed(format!(
            "expected {} output values, got {}",
            3 * plane,
            data.len()
        )));
    }
    let mut raw = Vec::with_capacity(3 * plane);
    for i in 0..plane {
        for c in 0..3 {
            raw.push((data[c * plane + i] * 255.0).clamp(0.0, 255.0) as u8);
        }
    }
    RgbImage::from_raw(size as u32, size as u32, raw)
        .ok_or_else(|| SwapperError::InferenceFailed("output buffer size mismatch".into()))
}

/// Axis-aligned pixel rectangle `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
}

impl Region {
    /// Bounding box of pixels equal to `value`, or `None` if there are none.
    fn of_value(plane: &[f32], width: usize, value: f32) -> Option<Self> {
        let mut region: Option<Region> = None;
        for (i, &v) in plane.iter().enumerate() {
            if v != value {
                continue;
            }
            let (x, y) = (i % width, i / width);
            region = Some(match region {
                None => Region {
                    x0: x,
                    y0: y,
                    x1: x + 1,
                    y1: y + 1,
                },
                Some(r) => Region {
                    x0: r.x0.min(x),
                    y0: r.y0.min(y),
                    x1: r.x1.max(x + 1),
                    y1: r.y1.max(y + 1),
                },
            });
        }
        region
    }

    fn width(&self) -> usize {
        self.x1 - self.x0
    }

    fn height(&self) -> usize {
        self.y1 - self.y0
    }

    fn expand(&self, margin: usize, width: usize, height: usize) -> Self {
        Region {
            x0: self.x0.saturating_sub(margin),
            y0: self.y0.saturating_sub(margin),
            x1: (self.x1 + margin).min(width),
            y1: (self.y1 + margin).min(height),
        }
    }

    fn crop(&self, plane: &[f32], width: usize) -> Vec<f32> {
        (self.y0..self.y1)
            .flat_map(|y| plane[y * width + self.x0..y * width + self.x1].iter().copied())
            .collect()
    }
}

/// Composite a swapped crop back into `target`.
///
/// `matrix` is the target→crop transform used for alignment. The mask is the
/// warped crop footprint, eroded and blurred in proportion to the face size so
/// the seam fades out inside the face. Output has the target's dimensions.
pub fn paste_back_into(target: &RgbImage, fake: &RgbImage, matrix: &Affine) -> RgbImage {
    let (width, height) = (target.width() as usize, target.height() as usize);
    let inverse = alignment::invert_affine(matrix);

    let white = vec![255.0f32; (fake.width() * fake.height()) as usize];
    let mut mask = alignment::warp_plane(
        &white,
        fake.width() as usize,
        fake.height() as usize,
        &inverse,
        width,
        height,
    );
    for v in mask.iter_mut() {
        if *v > MASK_THRESHOLD {
            *v = 255.0;
        }
    }

    let Some(face) = Region::of_value(&mask, width, 255.0) else {
        tracing::debug!("swapped crop falls outside the target frame; nothing pasted");
        return target.clone();
    };

    let mask_size = ((face.width() * face.height()) as f32).sqrt() as usize;
    let erode_kernel = (mask_size / 10).max(10);
    let blur_kernel = 2 * (mask_size / 20).max(5) + 1;
    tracing::debug!(mask_size, erode_kernel, blur_kernel, "paste-back mask");

    let roi = face.expand(erode_kernel + blur_kernel, width, height);
    let plane = roi.crop(&mask, width);
    let gray = GrayImage::from_fn(roi.width() as u32, roi.height() as u32, |x, y| {
        Luma([plane[y as usize * roi.width() + x as usize].round() as u8])
    });
    let plane: Vec<f32> = erode(&gray, erode_kernel as u32)
        .pixels()
        .map(|p| p[0] as f32)
        .collect();
    let plane = gaussian_blur(&plane, roi.width(), roi.height(), blur_kernel);

    let warped = alignment::warp_rgb(fake, &inverse, target.width(), target.height());
    let mut out = target.clone();

    for ry in 0..roi.height() {
        for rx in 0..roi.width() {
            let alpha = (plane[ry * roi.width() + rx] / 255.0).clamp(0.0, 1.0);
            if alpha <= 0.0 {
                continue;
            }
            let (x, y) = ((roi.x0 + rx) as u32, (roi.y0 + ry) as u32);
            let f = *warped.get_pixel(x, y);
            let t = out.get_pixel_mut(x, y);
            for c in 0..3 {
                let merged = alpha * f[c] as f32 + (1.0 - alpha) * t[c] as f32;
                t[c] = merged.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Grayscale erosion with a `k`×`k` square anchored at `k / 2`.
/// Samples outside the image are ignored.
fn erode(mask: &GrayImage, k: u32) -> GrayImage {
    // Mask anchors are u8, so the kernel side is capped at 511.
    let k = k.clamp(1, 511);
    let anchor = (k / 2) as u8;
    let square = GrayImage::from_pixel(k, k, Luma([255]));
    grayscale_erode(mask, &Mask::from_image(&square, anchor, anchor))
}

/// Separable Gaussian blur with an odd kernel size; sigma derived from the
/// kernel size the way OpenCV does when sigma is 0. Edges are replicated.
/// Support is exactly `ksize`, the margin `paste_back_into` reserves for it.
fn gaussian_blur(plane: &[f32], width: usize, height: usize, ksize: usize) -> Vec<f32> {
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let radius = (ksize / 2) as isize;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);

    let convolve = |src: &[f32], len: usize, stride: usize, offset: usize, out: &mut [f32]| {
        for i in 0..len as isize {
            let mut acc = 0.0;
            for (ki, w) in kernel.iter().enumerate() {
                let j = (i + ki as isize - radius).clamp(0, len as isize - 1) as usize;
                acc += w * src[offset + j * stride];
            }
            out[offset + i as usize * stride] = acc;
        }
    };

    let mut rows = vec![0.0f32; plane.len()];
    for y in 0..height {
        convolve(plane, width, 1, y * width, &mut rows);
    }
    let mut out = vec![0.0f32; plane.len()];
    for x in 0..width {
        convolve(&rows, height, width, x, &mut out);
    }
    out
}
