//! Region: a set of non-overlapping rectangles with boolean set algebra.
//!
//! Regions are stored in normalised y-band form: rectangles are grouped into
//! horizontal bands, sorted by y then x, with no overlap anywhere and
//! vertically adjacent bands merged when their x spans are identical. This
//! makes equality, area and rectangle enumeration cheap, which matters for
//! the damage tracking done by the update scheduler (lossy regions, pending
//! refresh regions, claimed decode regions).

use crate::Rect;

/// A possibly-disjoint screen region.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Region {
    /// Normalised rectangles: banded, disjoint, sorted by (y, x).
    rects: Vec<Rect>,
}

/// 1-D half-open interval used by the band sweep.
type Span = (i32, i32);

fn spans_in_band(rects: &[Rect], y1: i32, y2: i32) -> Vec<Span> {
    let mut spans: Vec<Span> = rects
        .iter()
        .filter(|r| r.y < y2 && r.bottom() > y1)
        .map(|r| (r.x, r.right()))
        .collect();
    spans.sort_unstable();
    // Merge touching/overlapping spans.
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for (x1, x2) in spans {
        match merged.last_mut() {
            Some(last) if x1 <= last.1 => last.1 = last.1.max(x2),
            _ => merged.push((x1, x2)),
        }
    }
    merged
}

fn union_spans(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut all: Vec<Span> = a.iter().chain(b.iter()).copied().collect();
    all.sort_unstable();
    let mut merged: Vec<Span> = Vec::with_capacity(all.len());
    for (x1, x2) in all {
        match merged.last_mut() {
            Some(last) if x1 <= last.1 => last.1 = last.1.max(x2),
            _ => merged.push((x1, x2)),
        }
    }
    merged
}

fn intersect_spans(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let lo = a[i].0.max(b[j].0);
        let hi = a[i].1.min(b[j].1);
        if lo < hi {
            out.push((lo, hi));
        }
        if a[i].1 < b[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

fn subtract_spans(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut out = Vec::new();
    for &(ax1, ax2) in a {
        let mut cur = ax1;
        for &(bx1, bx2) in b {
            if bx2 <= cur {
                continue;
            }
            if bx1 >= ax2 {
                break;
            }
            if bx1 > cur {
                out.push((cur, bx1.min(ax2)));
            }
            cur = cur.max(bx2);
            if cur >= ax2 {
                break;
            }
        }
        if cur < ax2 {
            out.push((cur, ax2));
        }
    }
    out
}

impl Region {
    /// The empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// A region covering a single rectangle.
    pub fn from_rect(rect: Rect) -> Self {
        if rect.is_empty() {
            return Self::new();
        }
        Self { rects: vec![rect] }
    }

    /// True when the region covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Number of rectangles in the normalised decomposition.
    pub fn num_rects(&self) -> usize {
        self.rects.len()
    }

    /// The normalised rectangles, banded and sorted by (y, x).
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Total covered area in pixels.
    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Smallest rectangle covering the whole region; empty if the region is.
    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::default(), |acc, r| acc.union_boundary(r))
    }

    /// True if the point lies inside the region.
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }

    /// True if any part of `rect` lies inside the region.
    pub fn overlaps_rect(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.overlaps(rect))
    }

    /// Set union.
    pub fn union(&self, other: &Region) -> Region {
        self.combine(other, union_spans)
    }

    /// Set intersection.
    pub fn intersect(&self, other: &Region) -> Region {
        self.combine(other, intersect_spans)
    }

    /// Set difference (`self` minus `other`).
    pub fn subtract(&self, other: &Region) -> Region {
        self.combine(other, subtract_spans)
    }

    /// In-place union with a single rectangle.
    pub fn assign_union_rect(&mut self, rect: Rect) {
        *self = self.union(&Region::from_rect(rect));
    }

    /// In-place union.
    pub fn assign_union(&mut self, other: &Region) {
        *self = self.union(other);
    }

    /// In-place subtraction of a single rectangle.
    pub fn assign_subtract_rect(&mut self, rect: Rect) {
        *self = self.subtract(&Region::from_rect(rect));
    }

    /// In-place subtraction.
    pub fn assign_subtract(&mut self, other: &Region) {
        *self = self.subtract(other);
    }

    /// Restrict the region to `rect`.
    pub fn intersect_rect(&self, rect: &Rect) -> Region {
        self.intersect(&Region::from_rect(*rect))
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.rects.clear();
    }

    fn combine(&self, other: &Region, op: fn(&[Span], &[Span]) -> Vec<Span>) -> Region {
        // Band sweep over the union of both regions' y edges.
        let mut edges: Vec<i32> = self
            .rects
            .iter()
            .chain(other.rects.iter())
            .flat_map(|r| [r.y, r.bottom()])
            .collect();
        edges.sort_unstable();
        edges.dedup();

        // (y1, y2, spans) per band, merging adjacent bands with equal spans.
        let mut bands: Vec<(i32, i32, Vec<Span>)> = Vec::new();
        for win in edges.windows(2) {
            let (y1, y2) = (win[0], win[1]);
            let spans = op(
                &spans_in_band(&self.rects, y1, y2),
                &spans_in_band(&other.rects, y1, y2),
            );
            if spans.is_empty() {
                continue;
            }
            match bands.last_mut() {
                Some((_, prev_y2, prev_spans)) if *prev_y2 == y1 && *prev_spans == spans => {
                    *prev_y2 = y2;
                }
                _ => bands.push((y1, y2, spans)),
            }
        }

        let mut rects = Vec::new();
        for (y1, y2, spans) in bands {
            for (x1, x2) in spans {
                rects.push(Rect::from_corners(x1, y1, x2, y2));
            }
        }
        Region { rects }
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_region() {
        let r = Region::new();
        assert!(r.is_empty());
        assert_eq!(r.area(), 0);
        assert!(r.bounding_rect().is_empty());
    }

    #[test]
    fn single_rect() {
        let r = Region::from_rect(Rect::new(10, 10, 20, 20));
        assert_eq!(r.num_rects(), 1);
        assert_eq!(r.area(), 400);
        assert_eq!(r.bounding_rect(), Rect::new(10, 10, 20, 20));
    }

    #[test]
    fn union_disjoint() {
        let a = Region::from_rect(Rect::new(0, 0, 10, 10));
        let b = Region::from_rect(Rect::new(20, 20, 10, 10));
        let u = a.union(&b);
        assert_eq!(u.num_rects(), 2);
        assert_eq!(u.area(), 200);
        assert_eq!(u.bounding_rect(), Rect::new(0, 0, 30, 30));
    }

    #[test]
    fn union_overlapping_counts_once() {
        let a = Region::from_rect(Rect::new(0, 0, 10, 10));
        let b = Region::from_rect(Rect::new(5, 0, 10, 10));
        let u = a.union(&b);
        assert_eq!(u.area(), 150);
        assert_eq!(u.num_rects(), 1);
        assert_eq!(u.bounding_rect(), Rect::new(0, 0, 15, 10));
    }

    #[test]
    fn union_adjacent_bands_merge() {
        let a = Region::from_rect(Rect::new(0, 0, 10, 10));
        let b = Region::from_rect(Rect::new(0, 10, 10, 10));
        let u = a.union(&b);
        assert_eq!(u.num_rects(), 1);
        assert_eq!(u.rects()[0], Rect::new(0, 0, 10, 20));
    }

    #[test]
    fn subtract_hole() {
        let outer = Region::from_rect(Rect::new(0, 0, 30, 30));
        let hole = Region::from_rect(Rect::new(10, 10, 10, 10));
        let d = outer.subtract(&hole);
        assert_eq!(d.area(), 900 - 100);
        assert!(!d.contains_point(15, 15));
        assert!(d.contains_point(5, 15));
        assert!(d.contains_point(15, 5));
        assert!(d.contains_point(25, 25));
    }

    #[test]
    fn subtract_everything() {
        let a = Region::from_rect(Rect::new(0, 0, 10, 10));
        let d = a.subtract(&a);
        assert!(d.is_empty());
    }

    #[test]
    fn intersect_partial() {
        let a = Region::from_rect(Rect::new(0, 0, 20, 20));
        let b = Region::from_rect(Rect::new(10, 10, 20, 20));
        let i = a.intersect(&b);
        assert_eq!(i.num_rects(), 1);
        assert_eq!(i.rects()[0], Rect::new(10, 10, 10, 10));
    }

    #[test]
    fn intersect_disjoint_is_empty() {
        let a = Region::from_rect(Rect::new(0, 0, 10, 10));
        let b = Region::from_rect(Rect::new(100, 100, 10, 10));
        assert!(a.intersect(&b).is_empty());
    }

    #[test]
    fn rects_are_disjoint_after_union() {
        let mut region = Region::new();
        region.assign_union_rect(Rect::new(0, 0, 50, 50));
        region.assign_union_rect(Rect::new(25, 25, 50, 50));
        region.assign_union_rect(Rect::new(10, 60, 10, 10));

        let rects = region.rects().to_vec();
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
        // Area equals the hand-computed union area.
        assert_eq!(region.area(), 2500 + 2500 - 625 + 100);
    }

    #[test]
    fn assign_subtract_rect_trims_damage() {
        let mut lossy = Region::from_rect(Rect::new(0, 0, 100, 100));
        lossy.assign_subtract_rect(Rect::new(0, 0, 100, 50));
        assert_eq!(lossy.rects(), &[Rect::new(0, 50, 100, 50)]);
    }

    #[test]
    fn overlaps_rect() {
        let region = Region::from_rect(Rect::new(10, 10, 10, 10));
        assert!(region.overlaps_rect(&Rect::new(15, 15, 20, 20)));
        assert!(!region.overlaps_rect(&Rect::new(30, 30, 5, 5)));
    }
}
