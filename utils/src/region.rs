// Region tracking helpers
//
// Austin Shafer - 2020

use serde::{Deserialize, Serialize};

use std::cmp::PartialOrd;
use std::ops::Add;

/// A rectangular region
///
/// Used for damage boxes, output areas and scissors. It is
/// determined by the corners of a rectangle:
///   r_start: the upper left corner's position on the desktop
///   r_size:  the distance from the left to the lower right
#[derive(Debug, PartialEq, Copy, Clone, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct Rect<T: PartialOrd + Copy + Add + Add<Output = T>> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T: PartialOrd + Copy + Add + Add<Output = T>> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }
}

impl Rect<i32> {
    /// Build a rect from its two corners. x2/y2 are exclusive.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn x2(&self) -> i32 {
        self.r_pos.0 + self.r_size.0
    }

    pub fn y2(&self) -> i32 {
        self.r_pos.1 + self.r_size.1
    }

    pub fn is_empty(&self) -> bool {
        self.r_size.0 <= 0 || self.r_size.1 <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        self.r_size.0 as i64 * self.r_size.1 as i64
    }

    /// The overlapping area of two rectangles, if there is one
    pub fn intersection(&self, other: &Rect<i32>) -> Option<Rect<i32>> {
        let x1 = self.r_pos.0.max(other.r_pos.0);
        let y1 = self.r_pos.1.max(other.r_pos.1);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x1 >= x2 || y1 >= y2 {
            return None;
        }
        Some(Rect::from_corners(x1, y1, x2, y2))
    }

    /// Is `other` completely inside of this rect
    pub fn contains_rect(&self, other: &Rect<i32>) -> bool {
        other.is_empty()
            || (other.r_pos.0 >= self.r_pos.0
                && other.r_pos.1 >= self.r_pos.1
                && other.x2() <= self.x2()
                && other.y2() <= self.y2())
    }

    /// The smallest rectangle covering both
    pub fn union_extents(&self, other: &Rect<i32>) -> Rect<i32> {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_corners(
            self.r_pos.0.min(other.r_pos.0),
            self.r_pos.1.min(other.r_pos.1),
            self.x2().max(other.x2()),
            self.y2().max(other.y2()),
        )
    }

    /// Cut `other` out of this rect.
    ///
    /// Returns up to four non-overlapping pieces: a full-width band
    /// above and below `other`, and the left and right slivers beside it.
    pub fn subtract(&self, other: &Rect<i32>) -> Vec<Rect<i32>> {
        let hole = match self.intersection(other) {
            Some(h) => h,
            None => return vec![*self],
        };
        let mut ret = Vec::with_capacity(4);

        if hole.r_pos.1 > self.r_pos.1 {
            ret.push(Rect::from_corners(
                self.r_pos.0,
                self.r_pos.1,
                self.x2(),
                hole.r_pos.1,
            ));
        }
        if hole.y2() < self.y2() {
            ret.push(Rect::from_corners(
                self.r_pos.0,
                hole.y2(),
                self.x2(),
                self.y2(),
            ));
        }
        if hole.r_pos.0 > self.r_pos.0 {
            ret.push(Rect::from_corners(
                self.r_pos.0,
                hole.r_pos.1,
                hole.r_pos.0,
                hole.y2(),
            ));
        }
        if hole.x2() < self.x2() {
            ret.push(Rect::from_corners(
                hole.x2(),
                hole.r_pos.1,
                self.x2(),
                hole.y2(),
            ));
        }

        ret
    }
}

/// A set of pixels described by non-overlapping rectangles
///
/// This is what damage and opaque/clip areas are tracked with. The
/// rectangles kept internally never overlap and are never empty, so
/// the area of a region is the sum of its rectangles. Two regions
/// compare equal when they cover the same pixels, regardless of how
/// those pixels happen to be split up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Region {
    r_rects: Vec<Rect<i32>>,
}

impl Region {
    pub fn new() -> Self {
        Self {
            r_rects: Vec::new(),
        }
    }

    pub fn from_rect(rect: Rect<i32>) -> Self {
        let mut ret = Self::new();
        ret.add_rect(&rect);
        ret
    }

    pub fn from_rects<'a, I: IntoIterator<Item = &'a Rect<i32>>>(rects: I) -> Self {
        let mut ret = Self::new();
        for r in rects {
            ret.add_rect(r);
        }
        ret
    }

    pub fn is_empty(&self) -> bool {
        self.r_rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect<i32>] {
        self.r_rects.as_slice()
    }

    pub fn clear(&mut self) {
        self.r_rects.clear();
    }

    pub fn area(&self) -> i64 {
        self.r_rects.iter().map(|r| r.area()).sum()
    }

    /// Bounding box of the region. Empty regions return an empty rect.
    pub fn extents(&self) -> Rect<i32> {
        self.r_rects
            .iter()
            .fold(Rect::new(0, 0, 0, 0), |acc, r| acc.union_extents(r))
    }

    /// Union a rectangle into this region
    pub fn add_rect(&mut self, rect: &Rect<i32>) {
        if rect.is_empty() {
            return;
        }

        // Only add the parts of `rect` that we don't cover yet
        let mut pieces = vec![*rect];
        for existing in self.r_rects.iter() {
            if pieces.is_empty() {
                return;
            }
            pieces = pieces
                .iter()
                .flat_map(|p| p.subtract(existing))
                .collect();
        }

        self.r_rects.extend(pieces);
    }

    pub fn union(&mut self, other: &Region) {
        for r in other.r_rects.iter() {
            self.add_rect(r);
        }
    }

    pub fn subtract_rect(&mut self, rect: &Rect<i32>) {
        if rect.is_empty() {
            return;
        }
        self.r_rects = self
            .r_rects
            .iter()
            .flat_map(|r| r.subtract(rect))
            .collect();
    }

    pub fn subtract(&mut self, other: &Region) {
        for r in other.r_rects.iter() {
            if self.is_empty() {
                return;
            }
            self.subtract_rect(r);
        }
    }

    pub fn intersect_rect(&mut self, rect: &Rect<i32>) {
        self.r_rects = self
            .r_rects
            .iter()
            .filter_map(|r| r.intersection(rect))
            .collect();
    }

    pub fn intersect(&mut self, other: &Region) {
        let mut rects = Vec::new();
        for a in self.r_rects.iter() {
            for b in other.r_rects.iter() {
                if let Some(i) = a.intersection(b) {
                    rects.push(i);
                }
            }
        }
        self.r_rects = rects;
    }

    /// Non-mutating version of `intersect`
    pub fn intersected(&self, other: &Region) -> Region {
        let mut ret = self.clone();
        ret.intersect(other);
        ret
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in self.r_rects.iter_mut() {
            r.r_pos.0 += dx;
            r.r_pos.1 += dy;
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.r_rects
            .iter()
            .any(|r| x >= r.r_pos.0 && y >= r.r_pos.1 && x < r.x2() && y < r.y2())
    }

    /// Does this region cover every pixel of `other`
    pub fn covers(&self, other: &Region) -> bool {
        let mut rest = other.clone();
        rest.subtract(self);
        rest.is_empty()
    }
}

impl From<Rect<i32>> for Region {
    fn from(rect: Rect<i32>) -> Self {
        Region::from_rect(rect)
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area() && self.covers(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_punches_hole() {
        let outer = Rect::new(0, 0, 10, 10);
        let pieces = outer.subtract(&Rect::new(3, 3, 4, 4));
        assert_eq!(pieces.len(), 4);
        let total: i64 = pieces.iter().map(|r| r.area()).sum();
        assert_eq!(total, 100 - 16);
    }

    #[test]
    fn union_does_not_double_count() {
        let mut reg = Region::from_rect(Rect::new(0, 0, 10, 10));
        reg.add_rect(&Rect::new(5, 5, 10, 10));
        assert_eq!(reg.area(), 100 + 100 - 25);
        assert_eq!(reg.extents(), Rect::new(0, 0, 15, 15));
    }

    #[test]
    fn union_is_order_independent() {
        let rects = [
            Rect::new(0, 0, 20, 4),
            Rect::new(2, 2, 3, 30),
            Rect::new(10, 1, 8, 8),
            Rect::new(-5, 7, 12, 2),
        ];
        let forward = Region::from_rects(rects.iter());
        let backward = Region::from_rects(rects.iter().rev());
        assert_eq!(forward, backward);
        assert_eq!(forward.area(), backward.area());
    }

    #[test]
    fn intersect_and_subtract() {
        let mut a = Region::from_rect(Rect::new(0, 0, 100, 100));
        let b = Region::from_rect(Rect::new(50, 50, 100, 100));
        let inter = a.intersected(&b);
        assert_eq!(inter, Region::from_rect(Rect::new(50, 50, 50, 50)));

        a.subtract(&b);
        assert_eq!(a.area(), 10000 - 2500);
        assert!(!a.contains_point(75, 75));
        assert!(a.contains_point(10, 75));
    }

    #[test]
    fn empty_rects_are_ignored() {
        let mut reg = Region::new();
        reg.add_rect(&Rect::new(4, 4, 0, 10));
        reg.add_rect(&Rect::new(4, 4, -3, 10));
        assert!(reg.is_empty());
        assert_eq!(reg.extents(), Rect::new(0, 0, 0, 0));
    }
}
