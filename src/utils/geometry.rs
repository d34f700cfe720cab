// SPDX-License-Identifier: GPL-3.0-only

use smallvec::SmallVec;
use smithay::utils::{Physical, Point, Rectangle, Size};

pub type Rect = Rectangle<i32, Physical>;

type Rects = SmallVec<[Rect; 4]>;

pub fn rect(x: i32, y: i32, w: i32, h: i32) -> Rect {
    Rectangle::new((x, y).into(), (w, h).into())
}

pub fn bounds(size: Size<i32, Physical>) -> Rect {
    Rectangle::from_size(size)
}

/// A set of pixels, stored as disjoint rectangles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Rects,
}

impl Region {
    pub fn new() -> Region {
        Region::default()
    }

    pub fn from_rect(r: Rect) -> Region {
        let mut region = Region::new();
        region.add_rect(r);
        region
    }

    pub fn from_rects(rects: impl IntoIterator<Item = Rect>) -> Region {
        let mut region = Region::new();
        for r in rects {
            region.add_rect(r);
        }
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Number of disjoint rectangles making up the region.
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn add_rect(&mut self, r: Rect) {
        if r.is_empty() {
            return;
        }
        if self.rects.iter().any(|existing| existing.contains_rect(r)) {
            return;
        }
        let pieces = Rectangle::subtract_rects_many([r], self.rects.iter().copied());
        self.rects.extend(pieces);
    }

    pub fn union(&mut self, other: &Region) {
        for r in &other.rects {
            self.add_rect(*r);
        }
    }

    pub fn subtract_rect(&mut self, r: &Rect) {
        self.subtract_rects([*r]);
    }

    pub fn subtract(&mut self, other: &Region) {
        self.subtract_rects(other.rects.iter().copied());
    }

    fn subtract_rects(&mut self, others: impl IntoIterator<Item = Rect>) {
        let rects = std::mem::take(&mut self.rects).into_vec();
        self.rects = Rectangle::subtract_rects_many_in_place(rects, others).into();
    }

    pub fn intersect_rect(&self, bounds: &Rect) -> Region {
        Region {
            rects: self
                .rects
                .iter()
                .filter_map(|r| r.intersection(*bounds))
                .collect(),
        }
    }

    /// Smallest rectangle containing the whole region.
    pub fn extents(&self) -> Option<Rect> {
        self.rects.iter().copied().reduce(Rectangle::merge)
    }

    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| r.size.w as i64 * r.size.h as i64)
            .sum()
    }

    pub fn contains_point(&self, point: Point<i32, Physical>) -> bool {
        self.rects.iter().any(|r| r.contains(point))
    }

    /// Whether every pixel of `r` is part of the region.
    pub fn covers(&self, r: &Rect) -> bool {
        Rectangle::subtract_rects_many([*r], self.rects.iter().copied())
            .iter()
            .all(Rectangle::is_empty)
    }
}

impl From<Rect> for Region {
    fn from(r: Rect) -> Region {
        Region::from_rect(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_rects_stay_disjoint() {
        let region = Region::from_rects([rect(0, 0, 10, 10), rect(5, 5, 10, 10)]);
        assert_eq!(region.area(), 100 + 100 - 25);
        for (i, a) in region.rects().iter().enumerate() {
            for b in &region.rects()[i + 1..] {
                assert!(!a.overlaps(*b));
            }
        }
        assert!(region.covers(&rect(0, 0, 10, 10)));
        assert!(region.covers(&rect(5, 5, 10, 10)));
        assert!(!region.covers(&rect(0, 0, 15, 15)));
        assert!(!region.contains_point((14, 0).into()));
    }

    #[test]
    fn contained_rect_is_ignored() {
        let mut region = Region::from_rect(rect(0, 0, 100, 100));
        region.add_rect(rect(10, 10, 5, 5));
        assert_eq!(region.len(), 1);
    }

    #[test]
    fn empty_rects_are_dropped() {
        let region = Region::from_rects([rect(0, 0, 0, 10), rect(3, 3, 5, 0)]);
        assert!(region.is_empty());
        assert_eq!(region.extents(), None);
    }

    #[test]
    fn intersect_clips_to_bounds() {
        let region = Region::from_rects([rect(-10, -10, 20, 20), rect(90, 90, 20, 20)]);
        let clipped = region.intersect_rect(&rect(0, 0, 100, 100));
        assert_eq!(clipped.area(), 200);
        assert_eq!(clipped.extents(), Some(rect(0, 0, 100, 100)));
    }

    #[test]
    fn subtract_punches_hole() {
        let mut region = Region::from_rect(rect(0, 0, 30, 30));
        region.subtract_rect(&rect(10, 10, 10, 10));
        assert_eq!(region.area(), 900 - 100);
        assert!(!region.contains_point((15, 15).into()));
        assert!(region.contains_point((5, 15).into()));
        assert_eq!(region.extents(), Some(rect(0, 0, 30, 30)));
    }
}
