//! Value types for the region of interest and the perspective transform that
//! rectifies it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use video_ingest::{Frame, FrameFormat};

/// Rejected region-of-interest or output geometry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("invalid geometry: expected exactly 4 points, got {0}")]
    WrongPointCount(usize),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("invalid size {width}x{height}: dimensions must be positive")]
    InvalidSize { width: u32, height: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Positive width and height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Size {
    width: u32,
    height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Result<Self, GeometryError> {
        if width == 0 || height == 0 {
            return Err(GeometryError::InvalidSize { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn of_frame(frame: &Frame) -> Result<Self, GeometryError> {
        Self::new(frame.width, frame.height)
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned rectangle anchored at its top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

impl Rect {
    pub const fn new(origin: Point, size: Size) -> Self {
        Self { origin, size }
    }

    /// Corners clockwise from the top-left.
    pub fn vertices(&self) -> [Point; 4] {
        let Point { x, y } = self.origin;
        let w = self.size.width as i32;
        let h = self.size.height as i32;
        [
            Point::new(x, y),
            Point::new(x + w, y),
            Point::new(x + w, y + h),
            Point::new(x, y + h),
        ]
    }
}

/// Four-point region of interest, ordered top-left, top-right, bottom-right,
/// bottom-left. Construction rejects degenerate polygons, so every value of
/// this type can be rectified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuadrilateralRepr", into = "QuadrilateralRepr")]
pub struct Quadrilateral {
    points: [Point; 4],
}

#[derive(Serialize, Deserialize)]
struct QuadrilateralRepr {
    points: Vec<Point>,
}

impl TryFrom<QuadrilateralRepr> for Quadrilateral {
    type Error = GeometryError;

    fn try_from(repr: QuadrilateralRepr) -> Result<Self, Self::Error> {
        Quadrilateral::try_from(repr.points.as_slice())
    }
}

impl From<Quadrilateral> for QuadrilateralRepr {
    fn from(quad: Quadrilateral) -> Self {
        Self {
            points: quad.points.to_vec(),
        }
    }
}

impl TryFrom<&[Point]> for Quadrilateral {
    type Error = GeometryError;

    fn try_from(points: &[Point]) -> Result<Self, Self::Error> {
        let points: [Point; 4] = points
            .try_into()
            .map_err(|_| GeometryError::WrongPointCount(points.len()))?;
        Quadrilateral::new(points)
    }
}

impl Quadrilateral {
    pub fn new(points: [Point; 4]) -> Result<Self, GeometryError> {
        let corners = points.map(|p| [p.x as f64, p.y as f64]);
        if has_collinear_triple(&corners) {
            return Err(GeometryError::InvalidGeometry(
                "three or more region-of-interest points are collinear",
            ));
        }
        Ok(Self { points })
    }

    /// Region covering a whole `size` frame, corner pixel to corner pixel.
    pub fn full_frame(size: Size) -> Result<Self, GeometryError> {
        Self::new(pixel_corners(size).map(|[x, y]| Point::new(x as i32, y as i32)))
    }

    pub fn points(&self) -> &[Point; 4] {
        &self.points
    }

    fn corners(&self) -> [[f64; 2]; 4] {
        self.points.map(|p| [p.x as f64, p.y as f64])
    }
}

impl TryFrom<Rect> for Quadrilateral {
    type Error = GeometryError;

    fn try_from(rect: Rect) -> Result<Self, Self::Error> {
        Quadrilateral::new(rect.vertices())
    }
}

/// Pixel-centre corners of a `size` raster, clockwise from the top-left.
fn pixel_corners(size: Size) -> [[f64; 2]; 4] {
    let right = (size.width - 1) as f64;
    let bottom = (size.height - 1) as f64;
    [[0.0, 0.0], [right, 0.0], [right, bottom], [0.0, bottom]]
}

fn has_collinear_triple(corners: &[[f64; 2]; 4]) -> bool {
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    TRIPLES.iter().any(|&[a, b, c]| {
        let (ab_x, ab_y) = (corners[b][0] - corners[a][0], corners[b][1] - corners[a][1]);
        let (ac_x, ac_y) = (corners[c][0] - corners[a][0], corners[c][1] - corners[a][1]);
        let cross = ab_x * ac_y - ab_y * ac_x;
        let scale = ab_x.hypot(ab_y) * ac_x.hypot(ac_y);
        cross.abs() <= scale * 1e-9
    })
}

/// 3x3 projective transform, normalised so the bottom-right entry is 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography([[f64; 3]; 3]);

impl Homography {
    /// Solve the transform mapping each `src[i]` onto `dst[i]` (direct linear
    /// transform with Gauss-Jordan elimination).
    pub fn from_correspondences(
        src: [[f64; 2]; 4],
        dst: [[f64; 2]; 4],
    ) -> Result<Self, GeometryError> {
        if has_collinear_triple(&src) || has_collinear_triple(&dst) {
            return Err(GeometryError::InvalidGeometry(
                "three or more corresponding points are collinear",
            ));
        }

        let mut m = [[0.0f64; 9]; 8];
        for i in 0..4 {
            let (x, y) = (src[i][0], src[i][1]);
            let (xp, yp) = (dst[i][0], dst[i][1]);
            m[i * 2] = [-x, -y, -1.0, 0.0, 0.0, 0.0, x * xp, y * xp, xp];
            m[i * 2 + 1] = [0.0, 0.0, 0.0, -x, -y, -1.0, x * yp, y * yp, yp];
        }

        #[allow(clippy::needless_range_loop)]
        for col in 0..8 {
            let mut max_row = col;
            let mut max_val = m[col][col].abs();
            for row in (col + 1)..8 {
                if m[row][col].abs() > max_val {
                    max_val = m[row][col].abs();
                    max_row = row;
                }
            }
            if max_val < 1e-10 {
                return Err(GeometryError::InvalidGeometry("perspective system is singular"));
            }
            m.swap(col, max_row);
            let pivot = m[col][col];
            for j in col..9 {
                m[col][j] /= pivot;
            }
            for row in 0..8 {
                if row != col {
                    let factor = m[row][col];
                    if factor != 0.0 {
                        for j in col..9 {
                            m[row][j] -= factor * m[col][j];
                        }
                    }
                }
            }
        }

        let h: [f64; 8] = std::array::from_fn(|i| -m[i][8]);
        Ok(Self([
            [h[0], h[1], h[2]],
            [h[3], h[4], h[5]],
            [h[6], h[7], 1.0],
        ]))
    }

    /// Transform mapping `quad`'s corners onto the corners of a `size` raster.
    pub fn quad_to_rect(quad: &Quadrilateral, size: Size) -> Result<Self, GeometryError> {
        Self::from_correspondences(quad.corners(), pixel_corners(size))
    }

    pub fn matrix(&self) -> &[[f64; 3]; 3] {
        &self.0
    }

    /// Map `(x, y)`; `None` when the point lands on the line at infinity.
    pub fn apply(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let h = &self.0;
        let w = h[2][0] * x + h[2][1] * y + h[2][2];
        if w.abs() < 1e-12 {
            return None;
        }
        Some((
            (h[0][0] * x + h[0][1] * y + h[0][2]) / w,
            (h[1][0] * x + h[1][1] * y + h[1][2]) / w,
        ))
    }

    pub fn inverse(&self) -> Result<Self, GeometryError> {
        let [[a, b, c], [d, e, f], [g, h, i]] = self.0;
        let co = [
            [e * i - f * h, c * h - b * i, b * f - c * e],
            [f * g - d * i, a * i - c * g, c * d - a * f],
            [d * h - e * g, b * g - a * h, a * e - b * d],
        ];
        let det = a * co[0][0] + b * co[1][0] + c * co[2][0];
        if det.abs() < 1e-12 {
            return Err(GeometryError::InvalidGeometry("perspective transform is not invertible"));
        }
        let mut inv = co.map(|row| row.map(|v| v / det));
        let scale = inv[2][2];
        if scale.abs() > 1e-12 {
            inv = inv.map(|row| row.map(|v| v / scale));
        }
        Ok(Self(inv))
    }
}

/// Rectify `quad` from `frame` into a new frame of exactly `size`.
///
/// Each output pixel is mapped back into the source with the inverse
/// transform and sampled bilinearly; samples falling outside the source are
/// black.
pub fn warp_perspective(
    frame: &Frame,
    quad: &Quadrilateral,
    size: Size,
) -> Result<Frame, GeometryError> {
    let forward = Homography::quad_to_rect(quad, size)?;
    let inverse = forward.inverse()?;

    let channels = FrameFormat::Bgr8.channels();
    let (out_w, out_h) = (size.width as usize, size.height as usize);
    let mut data = vec![0u8; out_w * out_h * channels];
    if frame.is_empty() {
        return Ok(output_frame(frame, size, data));
    }

    let max_x = (frame.width - 1) as f64;
    let max_y = (frame.height - 1) as f64;
    const EDGE: f64 = 1e-3;

    for v in 0..out_h {
        let row = &mut data[v * out_w * channels..(v + 1) * out_w * channels];
        for u in 0..out_w {
            let Some((sx, sy)) = inverse.apply(u as f64, v as f64) else {
                continue;
            };
            if sx < -EDGE || sy < -EDGE || sx > max_x + EDGE || sy > max_y + EDGE {
                continue;
            }
            let pixel = sample_bilinear(frame, sx.clamp(0.0, max_x), sy.clamp(0.0, max_y));
            row[u * channels..u * channels + channels].copy_from_slice(&pixel);
        }
    }

    Ok(output_frame(frame, size, data))
}

fn output_frame(source: &Frame, size: Size, data: Vec<u8>) -> Frame {
    Frame {
        data,
        width: size.width,
        height: size.height,
        timestamp_ms: source.timestamp_ms,
        format: source.format,
    }
}

fn sample_bilinear(frame: &Frame, x: f64, y: f64) -> [u8; 3] {
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(frame.width - 1);
    let y1 = (y0 + 1).min(frame.height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = frame.pixel(x0, y0);
    let p10 = frame.pixel(x1, y0);
    let p01 = frame.pixel(x0, y1);
    let p11 = frame.pixel(x1, y1);

    std::array::from_fn(|c| {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    })
}
