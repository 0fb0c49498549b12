//! Axis-aligned pixel rectangles.

use std::cmp;
use std::fmt;

/// A rectangle in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Area in pixels.
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge.
    pub const fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub const fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// Smallest rectangle containing both. A span wider than `u32::MAX`
    /// saturates, so the result may stop short of the farther edge.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = cmp::min(self.x, other.x);
        let y = cmp::min(self.y, other.y);
        let right = cmp::max(self.right(), other.right());
        let bottom = cmp::max(self.bottom(), other.bottom());
        Rect::new(x, y, span(x, right), span(y, bottom))
    }

    /// Overlapping part of both, or `None` when they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x = cmp::max(self.x, other.x);
        let y = cmp::max(self.y, other.y);
        let right = cmp::min(self.right(), other.right());
        let bottom = cmp::min(self.bottom(), other.bottom());
        if right <= x as u64 || bottom <= y as u64 {
            return None;
        }
        Some(Rect::new(x, y, (right - x as u64) as u32, (bottom - y as u64) as u32))
    }

    /// Clip to a `width × height` window. Empty if nothing remains.
    pub fn clip_to(&self, width: u32, height: u32) -> Rect {
        self.intersect(&Rect::new(0, 0, width, height))
            .unwrap_or_default()
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

fn span(start: u32, end: u64) -> u32 {
    u32::try_from(end - start as u64).unwrap_or(u32::MAX)
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_of_adjacent_squares() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(100, 0, 100, 100);
        assert_eq!(a.union(&b), Rect::new(0, 0, 200, 100));
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn intersection() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 100, 100);
        assert_eq!(a.intersect(&b), Some(Rect::new(50, 50, 50, 50)));
    }

    #[test]
    fn clipping() {
        let r = Rect::new(700, 500, 200, 200);
        assert_eq!(r.clip_to(800, 600), Rect::new(700, 500, 100, 100));
        assert!(Rect::new(900, 0, 10, 10).clip_to(800, 600).is_empty());
    }

    #[test]
    fn union_of_far_apart_rects_saturates() {
        let near = Rect::new(0, 0, 10, 10);
        let far = Rect::new(u32::MAX - 10, 5, u32::MAX, 10);
        let u = near.union(&far);
        assert_eq!(u, Rect::new(0, 0, u32::MAX, 15));
        assert!(u.contains(&near));
        assert!(u.width >= near.width && u.width >= far.width);
    }

    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(10, 10, 5, 5);
        assert_eq!(a.union(&Rect::default()), a);
        assert_eq!(Rect::default().union(&a), a);
    }
}
