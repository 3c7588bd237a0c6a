// View geometry and triangle fan generation
//
// Austin Shafer - 2021
use cgmath::{Matrix3, SquareMatrix, Vector3};

use crate::gpu::Vertex;
use crate::surface::SurfaceId;
use utils::region::{Rect, Region};

/// Maps surface local coordinates to global (desktop) coordinates
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ViewTransform {
    vt_matrix: Matrix3<f32>,
}

impl ViewTransform {
    pub fn identity() -> Self {
        Self {
            vt_matrix: Matrix3::identity(),
        }
    }

    pub fn translation(x: f32, y: f32) -> Self {
        Self {
            vt_matrix: Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, x, y, 1.0),
        }
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            vt_matrix: Matrix3::new(sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0),
        }
    }

    /// Rotation clockwise on screen around the origin
    pub fn rotation(degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        Self {
            vt_matrix: Matrix3::new(cos, sin, 0.0, -sin, cos, 0.0, 0.0, 0.0, 1.0),
        }
    }

    /// Apply `self` first, then `next`
    pub fn then(&self, next: &ViewTransform) -> Self {
        Self {
            vt_matrix: next.vt_matrix * self.vt_matrix,
        }
    }

    pub fn map(&self, x: f32, y: f32) -> (f32, f32) {
        let v = self.vt_matrix * Vector3::new(x, y, 1.0);
        (v.x, v.y)
    }

    pub fn inverse(&self) -> Option<ViewTransform> {
        self.vt_matrix
            .invert()
            .map(|m| ViewTransform { vt_matrix: m })
    }

    /// Is this only a translation and positive scale. These views can
    /// be clipped with plain rectangle math.
    pub fn is_axis_aligned(&self) -> bool {
        let m = &self.vt_matrix;
        m.x.y == 0.0 && m.y.x == 0.0 && m.x.x > 0.0 && m.y.y > 0.0
    }
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// One surface placed on the desktop
///
/// Views are handed to the repaint in front to back order.
#[derive(Debug, Clone)]
pub struct View {
    pub surface: SurfaceId,
    /// Surface size in surface local coordinates
    pub width: i32,
    pub height: i32,
    pub transform: ViewTransform,
    pub alpha: f32,
    /// Surface local region the client promised is opaque
    pub opaque: Region,
    /// Surface local scissor
    pub clip: Option<Rect<i32>>,
}

impl View {
    pub fn new(surface: SurfaceId, width: i32, height: i32) -> Self {
        Self {
            surface: surface,
            width: width,
            height: height,
            transform: ViewTransform::identity(),
            alpha: 1.0,
            opaque: Region::new(),
            clip: None,
        }
    }

    /// Place the view at this global position
    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.transform = self
            .transform
            .then(&ViewTransform::translation(x as f32, y as f32));
        self
    }

    pub fn with_transform(mut self, transform: ViewTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_opaque(mut self, opaque: Region) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_clip(mut self, clip: Rect<i32>) -> Self {
        self.clip = Some(clip);
        self
    }

    /// The surface rect in local coordinates, scissored
    pub fn surface_rect(&self) -> Rect<i32> {
        let full = Rect::new(0, 0, self.width, self.height);
        match self.clip.as_ref() {
            Some(clip) => full.intersection(clip).unwrap_or(Rect::new(0, 0, 0, 0)),
            None => full,
        }
    }

    fn corners(&self, rect: &Rect<i32>) -> [(f32, f32); 4] {
        let (x1, y1) = (rect.r_pos.0 as f32, rect.r_pos.1 as f32);
        let (x2, y2) = (rect.x2() as f32, rect.y2() as f32);
        [
            self.transform.map(x1, y1),
            self.transform.map(x2, y1),
            self.transform.map(x2, y2),
            self.transform.map(x1, y2),
        ]
    }

    /// Global bounding box of the scissored surface
    pub fn bounding_box(&self) -> Rect<i32> {
        let rect = self.surface_rect();
        if rect.is_empty() {
            return Rect::new(0, 0, 0, 0);
        }
        let c = self.corners(&rect);

        let min_x = c.iter().map(|p| p.0).fold(f32::MAX, f32::min).floor();
        let min_y = c.iter().map(|p| p.1).fold(f32::MAX, f32::min).floor();
        let max_x = c.iter().map(|p| p.0).fold(f32::MIN, f32::max).ceil();
        let max_y = c.iter().map(|p| p.1).fold(f32::MIN, f32::max).ceil();

        Rect::from_corners(min_x as i32, min_y as i32, max_x as i32, max_y as i32)
    }

    /// The opaque surface area that can be drawn without blending,
    /// in surface local coordinates
    pub fn opaque_local(&self) -> Region {
        if self.alpha < 1.0 {
            return Region::new();
        }
        let mut ret = self.opaque.clone();
        ret.intersect_rect(&self.surface_rect());
        ret
    }

    /// The area this view covers completely, in global coordinates
    ///
    /// Only axis aligned views can occlude anything.
    pub fn opaque_global(&self) -> Region {
        if !self.transform.is_axis_aligned() {
            return Region::new();
        }

        let mut ret = Region::new();
        for r in self.opaque_local().rects() {
            let c = self.corners(r);
            // Shrink to whole pixels so partial coverage never occludes
            ret.add_rect(&Rect::from_corners(
                c[0].0.ceil() as i32,
                c[0].1.ceil() as i32,
                c[2].0.floor() as i32,
                c[2].1.floor() as i32,
            ));
        }
        ret
    }
}

/// Triangle fans waiting to be drawn
///
/// This is scratch space shared by every draw. It is filled by
/// `texture_region` and consumed and cleared right after.
#[derive(Debug, Default)]
pub struct FanBuffer {
    pub fb_vertices: Vec<Vertex>,
    pub fb_fans: Vec<u32>,
}

impl FanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fb_fans.is_empty()
    }

    pub fn clear(&mut self) {
        self.fb_vertices.clear();
        self.fb_fans.clear();
    }

    /// Outline every fan as a closed line loop
    pub fn outline(&self) -> Vec<Vertex> {
        let mut ret = Vec::new();
        let mut start = 0;
        for len in self.fb_fans.iter() {
            let fan = &self.fb_vertices[start..start + *len as usize];
            for i in 0..fan.len() {
                ret.push(fan[i]);
                ret.push(fan[(i + 1) % fan.len()]);
            }
            start += *len as usize;
        }
        ret
    }
}

#[derive(Debug, Copy, Clone)]
enum ClipEdge {
    Left(f32),
    Right(f32),
    Top(f32),
    Bottom(f32),
}

impl ClipEdge {
    fn inside(&self, p: &(f32, f32)) -> bool {
        match *self {
            ClipEdge::Left(x) => p.0 >= x,
            ClipEdge::Right(x) => p.0 <= x,
            ClipEdge::Top(y) => p.1 >= y,
            ClipEdge::Bottom(y) => p.1 <= y,
        }
    }

    /// Where the segment a->b crosses this edge
    fn intersect(&self, a: &(f32, f32), b: &(f32, f32)) -> (f32, f32) {
        match *self {
            ClipEdge::Left(x) | ClipEdge::Right(x) => {
                let t = (x - a.0) / (b.0 - a.0);
                (x, a.1 + t * (b.1 - a.1))
            }
            ClipEdge::Top(y) | ClipEdge::Bottom(y) => {
                let t = (y - a.1) / (b.1 - a.1);
                (a.0 + t * (b.0 - a.0), y)
            }
        }
    }
}

/// Clip a polygon to a rectangle with Sutherland-Hodgman
fn clip_polygon(poly: &[(f32, f32)], clip: &Rect<i32>) -> Vec<(f32, f32)> {
    let edges = [
        ClipEdge::Left(clip.r_pos.0 as f32),
        ClipEdge::Right(clip.x2() as f32),
        ClipEdge::Top(clip.r_pos.1 as f32),
        ClipEdge::Bottom(clip.y2() as f32),
    ];

    let mut out: Vec<(f32, f32)> = poly.to_vec();
    for edge in edges.iter() {
        if out.is_empty() {
            break;
        }
        let input = std::mem::take(&mut out);
        let mut prev = input[input.len() - 1];

        for cur in input.iter() {
            match (edge.inside(cur), edge.inside(&prev)) {
                (true, true) => out.push(*cur),
                (true, false) => {
                    out.push(edge.intersect(&prev, cur));
                    out.push(*cur);
                }
                (false, true) => out.push(edge.intersect(&prev, cur)),
                (false, false) => {}
            }
            prev = *cur;
        }
    }

    out
}

/// Build the fans for drawing `surf_region` of the view, limited to
/// `repaint`.
///
/// `surf_region` is in surface local coordinates, `repaint` is global.
/// `offset` moves global coordinates into framebuffer pixels. One fan
/// is generated per (repaint rect, surface rect) pair which overlap.
pub fn texture_region(
    view: &View,
    repaint: &Region,
    surf_region: &Region,
    offset: (i32, i32),
    out: &mut FanBuffer,
) {
    let inverse = match view.transform.inverse() {
        Some(i) => i,
        None => return,
    };
    let (w, h) = (view.width.max(1) as f32, view.height.max(1) as f32);
    let axis_aligned = view.transform.is_axis_aligned();

    for damage in repaint.rects() {
        for surf in surf_region.rects() {
            let poly: Vec<(f32, f32)> = match axis_aligned {
                true => {
                    let c = view.corners(surf);
                    let rect = Rect::from_corners(
                        c[0].0.floor() as i32,
                        c[0].1.floor() as i32,
                        c[2].0.ceil() as i32,
                        c[2].1.ceil() as i32,
                    );
                    match rect.intersection(damage) {
                        Some(r) => vec![
                            (r.r_pos.0 as f32, r.r_pos.1 as f32),
                            (r.x2() as f32, r.r_pos.1 as f32),
                            (r.x2() as f32, r.y2() as f32),
                            (r.r_pos.0 as f32, r.y2() as f32),
                        ],
                        None => continue,
                    }
                }
                false => clip_polygon(&view.corners(surf), damage),
            };

            if poly.len() < 3 {
                continue;
            }

            for (x, y) in poly.iter() {
                let (sx, sy) = inverse.map(*x, *y);
                out.fb_vertices.push(Vertex::new(
                    x + offset.0 as f32,
                    y + offset.1 as f32,
                    sx / w,
                    sy / h,
                ));
            }
            out.fb_fans.push(poly.len() as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn axis_aligned_fan_is_clipped_rect() {
        let view = View::new(SurfaceId(1), 100, 100).at(10, 20);
        let repaint = Region::from_rect(Rect::new(50, 50, 200, 200));
        let surf = Region::from_rect(view.surface_rect());
        let mut fans = FanBuffer::new();

        texture_region(&view, &repaint, &surf, (0, 0), &mut fans);
        assert_eq!(fans.fb_fans, vec![4]);
        assert_eq!(fans.fb_vertices[0], Vertex::new(50.0, 50.0, 0.4, 0.3));
        assert_eq!(fans.fb_vertices[2], Vertex::new(110.0, 120.0, 1.0, 1.0));
    }

    #[test]
    fn one_fan_per_rect_pair() {
        let view = View::new(SurfaceId(1), 100, 100);
        let repaint = Region::from_rects(&[Rect::new(0, 0, 100, 10), Rect::new(0, 90, 100, 10)]);
        let surf = Region::from_rects(&[Rect::new(0, 0, 50, 100), Rect::new(50, 0, 50, 100)]);
        let mut fans = FanBuffer::new();

        texture_region(&view, &repaint, &surf, (5, 5), &mut fans);
        assert_eq!(fans.fb_fans.len(), 4);
        assert_eq!(fans.fb_vertices.len(), 16);
        assert_eq!(fans.fb_vertices[0].pos, [5.0, 5.0]);

        fans.clear();
        assert!(fans.is_empty());
        assert!(fans.fb_vertices.is_empty());
    }

    #[test]
    fn disjoint_damage_makes_no_fans() {
        let view = View::new(SurfaceId(1), 10, 10);
        let repaint = Region::from_rect(Rect::new(20, 20, 10, 10));
        let surf = Region::from_rect(view.surface_rect());
        let mut fans = FanBuffer::new();

        texture_region(&view, &repaint, &surf, (0, 0), &mut fans);
        assert!(fans.is_empty());
    }

    #[test]
    fn rotated_view_is_polygon_clipped() {
        // A 10x10 square rotated 45 degrees around its center, placed at 50,50
        let t = ViewTransform::translation(-5.0, -5.0)
            .then(&ViewTransform::rotation(45.0))
            .then(&ViewTransform::translation(50.0, 50.0));
        let view = View::new(SurfaceId(1), 10, 10).with_transform(t);
        assert!(!view.transform.is_axis_aligned());

        let bbox = view.bounding_box();
        assert_eq!(bbox, Rect::from_corners(42, 42, 58, 58));

        // Cut the diamond in half vertically
        let repaint = Region::from_rect(Rect::from_corners(0, 0, 50, 100));
        let surf = Region::from_rect(view.surface_rect());
        let mut fans = FanBuffer::new();
        texture_region(&view, &repaint, &surf, (0, 0), &mut fans);

        assert_eq!(fans.fb_fans.len(), 1);
        assert!(fans.fb_fans[0] >= 3);
        assert!(fans.fb_vertices.iter().all(|v| v.pos[0] <= 50.0 + 1e-3));
        // Texture coordinates stay inside the surface
        assert!(fans
            .fb_vertices
            .iter()
            .all(|v| v.tex[0] > -1e-3 && v.tex[0] < 1.0 + 1e-3));
    }

    #[test]
    fn transform_inverse_round_trips() {
        let t = ViewTransform::scale(2.0, 3.0).then(&ViewTransform::translation(7.0, -4.0));
        assert!(t.is_axis_aligned());
        let (x, y) = t.map(1.0, 1.0);
        assert!(approx(x, 9.0) && approx(y, -1.0));

        let (sx, sy) = t.inverse().unwrap().map(x, y);
        assert!(approx(sx, 1.0) && approx(sy, 1.0));
    }

    #[test]
    fn translucent_views_have_no_opaque_area() {
        let view = View::new(SurfaceId(1), 10, 10)
            .at(5, 5)
            .with_opaque(Region::from_rect(Rect::new(0, 0, 10, 10)));
        assert_eq!(
            view.opaque_global(),
            Region::from_rect(Rect::new(5, 5, 10, 10))
        );

        let view = view.with_alpha(0.5);
        assert!(view.opaque_global().is_empty());
        assert!(view.opaque_local().is_empty());
    }

    #[test]
    fn outline_closes_fans() {
        let mut fans = FanBuffer::new();
        fans.fb_vertices = vec![
            Vertex::new(0.0, 0.0, 0.0, 0.0),
            Vertex::new(1.0, 0.0, 0.0, 0.0),
            Vertex::new(1.0, 1.0, 0.0, 0.0),
        ];
        fans.fb_fans = vec![3];
        let lines = fans.outline();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[5], fans.fb_vertices[0]);
    }
}
