//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical square crop using the five
//! InsightFace reference landmarks and least-squares estimation, and warps
//! crops back into the original frame for paste-back.

use crate::types::Landmarks;
use image::RgbImage;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// A 2×3 affine matrix `[a, b, tx, c, d, ty]` mapping source to destination:
/// ```text
/// | a  b  tx |
/// | c  d  ty |
/// ```
pub type Affine = [f32; 6];

/// Reference landmarks for a square crop of `size` pixels.
///
/// Multiples of 112 scale the template directly. Multiples of 128 scale by
/// `size / 128` and shift right by 8 template pixels, matching how the swap
/// model's training crops were produced.
pub fn reference_landmarks(size: usize) -> Landmarks {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * ratio + diff_x, y * ratio))
}

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns `[a, -b, tx, b, a, ty]`.
pub fn estimate_similarity_transform(src: &Landmarks, dst: &Landmarks) -> Affine {
    // Build overdetermined system A * [a, b, tx, ty]^T = B
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16]; // 4x4, row-major
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // degenerate landmarks: identity
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Invert a 2×3 affine transform. A singular matrix inverts to all zeros.
pub fn invert_affine(m: &Affine) -> Affine {
    let [a, b, tx, c, d, ty] = *m;
    let det = a * d - b * c;
    if det.abs() < 1e-12 {
        return [0.0; 6];
    }
    let inv_det = 1.0 / det;
    let ia = d * inv_det;
    let ib = -b * inv_det;
    let ic = -c * inv_det;
    let id = a * inv_det;
    [ia, ib, -(ia * tx + ib * ty), ic, id, -(ic * tx + id * ty)]
}

/// Apply `m` to a single point.
pub fn transform_point(m: &Affine, (x, y): (f32, f32)) -> (f32, f32) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Warp an interleaved float image with `channels` samples per pixel.
///
/// `m` maps source coordinates to output coordinates; each output pixel is
/// pulled from the source through the inverse with bilinear interpolation.
/// Out-of-bounds samples read as 0.
fn warp_interleaved(
    src: &[f32],
    src_width: usize,
    src_height: usize,
    channels: usize,
    m: &Affine,
    out_width: usize,
    out_height: usize,
) -> Vec<f32> {
    let mut output = vec![0.0f32; out_width * out_height * channels];
    let inv = invert_affine(m);
    if inv == [0.0; 6] {
        return output;
    }

    let sample = |x: i32, y: i32, ch: usize| -> f32 {
        if x >= 0 && x < src_width as i32 && y >= 0 && y < src_height as i32 {
            src[(y as usize * src_width + x as usize) * channels + ch]
        } else {
            0.0
        }
    };

    for oy in 0..out_height {
        for ox in 0..out_width {
            let (sx, sy) = transform_point(&inv, (ox as f32, oy as f32));

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let out = &mut output[(oy * out_width + ox) * channels..][..channels];
            for (ch, value) in out.iter_mut().enumerate() {
                *value = sample(x0, y0, ch) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, ch) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, ch) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, ch) * fx * fy;
            }
        }
    }

    output
}

/// Warp an RGB image with bilinear interpolation. Out-of-bounds pixels are black.
pub fn warp_rgb(image: &RgbImage, m: &Affine, out_width: u32, out_height: u32) -> RgbImage {
    let src: Vec<f32> = image.as_raw().iter().map(|&p| p as f32).collect();
    let warped = warp_interleaved(
        &src,
        image.width() as usize,
        image.height() as usize,
        3,
        m,
        out_width as usize,
        out_height as usize,
    );
    let raw = warped
        .iter()
        .map(|v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    RgbImage::from_raw(out_width, out_height, raw)
        .unwrap_or_else(|| RgbImage::new(out_width, out_height))
}

/// Warp a single-channel float plane. Out-of-bounds values are 0.
pub fn warp_plane(
    plane: &[f32],
    width: usize,
    height: usize,
    m: &Affine,
    out_width: usize,
    out_height: usize,
) -> Vec<f32> {
    warp_interleaved(plane, width, height, 1, m, out_width, out_height)
}

/// Align a detected face to a canonical `size`×`size` crop.
///
/// Returns the crop together with the source→crop transform, which callers
/// invert to paste results back into the original frame.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks, size: usize) -> (RgbImage, Affine) {
    let matrix = estimate_similarity_transform(landmarks, &reference_landmarks(size));
    let crop = warp_rgb(image, &matrix, size as u32, size as u32);
    (crop, matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let src: Landmarks = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_reference_landmarks_112_unchanged() {
        assert_eq!(reference_landmarks(112), REFERENCE_LANDMARKS_112);
    }

    #[test]
    fn test_reference_landmarks_128_shifted() {
        let lms = reference_landmarks(128);
        for (scaled, base) in lms.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            assert!((scaled.0 - (base.0 + 8.0)).abs() < 1e-4);
            assert!((scaled.1 - base.1).abs() < 1e-4);
        }
    }

    #[test]
    fn test_invert_affine_roundtrip() {
        let m: Affine = [0.8, -0.3, 12.0, 0.3, 0.8, -5.0];
        let inv = invert_affine(&m);
        let p = (37.0, 91.0);
        let q = transform_point(&inv, transform_point(&m, p));
        assert!((q.0 - p.0).abs() < 1e-3 && (q.1 - p.1).abs() < 1e-3, "{q:?}");
    }

    #[test]
    fn test_invert_singular_is_zero() {
        assert_eq!(invert_affine(&[0.0; 6]), [0.0; 6]);
    }

    #[test]
    fn test_warp_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let m = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let out = warp_rgb(&image, &m, 128, 128);
        assert_eq!(out.dimensions(), (128, 128));
        assert_eq!(out.get_pixel(10, 10), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_warp_translation_fills_black() {
        let image = RgbImage::from_pixel(20, 20, Rgb([200, 100, 50]));
        // Shift right by 10: the left 10 columns come from outside the source.
        let m = [1.0, 0.0, 10.0, 0.0, 1.0, 0.0];
        let out = warp_rgb(&image, &m, 20, 20);
        assert_eq!(out.get_pixel(2, 5), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(15, 5), &Rgb([200, 100, 50]));
    }

    #[test]
    fn test_warp_plane_identity() {
        let plane: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let out = warp_plane(&plane, 4, 4, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], 4, 4);
        assert_eq!(out, plane);
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let (aligned, _) = align_face(&image, &REFERENCE_LANDMARKS_112, 112);
        assert_eq!(aligned.dimensions(), (112, 112));
        let (aligned, _) = align_face(&image, &REFERENCE_LANDMARKS_112, 128);
        assert_eq!(aligned.dimensions(), (128, 128));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // Paint a bright patch at the left eye; it should land near the
        // reference left eye after alignment.
        let mut image = RgbImage::new(200, 200);
        let src_landmarks: Landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        let (lx, ly) = (src_landmarks[0].0 as u32, src_landmarks[0].1 as u32);
        for dy in 0..5 {
            for dx in 0..5 {
                image.put_pixel(lx - 2 + dx, ly - 2 + dy, Rgb([255, 255, 255]));
            }
        }

        let (aligned, _) = align_face(&image, &src_landmarks, 112);

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as u32;
        let mut max_val = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                max_val = max_val.max(aligned.get_pixel(x, y)[0]);
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }
}
