//! Plane geometry over the engine.
//!
//! Points carry bit-identical coordinate equality so they satisfy the
//! `Data` bound; the hull and distance computations are memoized per
//! sub-problem under structural identity.

use std::fmt;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

use crate::engine::force;
use crate::memo::{mk_mfn, Mfn};
use crate::name::Name;

#[derive(Clone, Copy)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

pub fn pt(x: f64, y: f64) -> Point {
    Point { x, y }
}

// Identity is bitwise, so points can key memo tables.
impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        self.x.to_bits() == other.x.to_bits() && self.y.to_bits() == other.y.to_bits()
    }
}
impl Eq for Point {}

impl Hash for Point {
    fn hash<H: Hasher>(&self, h: &mut H) {
        self.x.to_bits().hash(h);
        self.y.to_bits().hash(h);
    }
}

impl Debug for Point {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// A directed line through two points.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Line {
    pub a: Point,
    pub b: Point,
}

/// Positive when `p` lies strictly to the left of the directed line.
fn line_side(l: &Line, p: &Point) -> f64 {
    (l.b.x - l.a.x) * (p.y - l.a.y) - (l.b.y - l.a.y) * (p.x - l.a.x)
}

pub fn dist_sq(p: &Point, q: &Point) -> f64 {
    let dx = p.x - q.x;
    let dy = p.y - q.y;
    dx * dx + dy * dy
}

fn below_left(p: &Point, q: &Point) -> bool {
    p.x < q.x || (p.x == q.x && p.y < q.y)
}

/// The memoized hull worker: points strictly left of the line, in
/// traversal order, endpoints excluded.
pub fn quickhull_mfn(nm: Name) -> Mfn<(Line, Vec<Point>), Vec<Point>> {
    mk_mfn(nm, |mfn, (l, pts): (Line, Vec<Point>)| {
        let above: Vec<Point> = pts.into_iter().filter(|p| line_side(&l, p) > 0.0).collect();
        if above.is_empty() {
            return Vec::new();
        }
        let mut pivot = above[0];
        let mut best = line_side(&l, &pivot);
        for p in above.iter().skip(1) {
            let d = line_side(&l, p);
            if d > best {
                best = d;
                pivot = *p;
            }
        }
        let left = force(&mfn.art((Line { a: l.a, b: pivot }, above.clone())));
        let right = force(&mfn.art((Line { a: pivot, b: l.b }, above)));
        let mut out = left;
        out.push(pivot);
        out.extend(right);
        out
    })
}

/// Convex hull of a point cloud, in traversal order starting from the
/// leftmost point.
pub fn quickhull(mfn: &Mfn<(Line, Vec<Point>), Vec<Point>>, pts: &[Point]) -> Vec<Point> {
    if pts.is_empty() {
        return Vec::new();
    }
    let mut min = pts[0];
    let mut max = pts[0];
    for p in pts.iter() {
        if below_left(p, &min) {
            min = *p;
        }
        if below_left(&max, p) {
            max = *p;
        }
    }
    if min == max {
        return vec![min];
    }
    let upper = force(&mfn.art((Line { a: min, b: max }, pts.to_vec())));
    let lower = force(&mfn.art((Line { a: max, b: min }, pts.to_vec())));
    let mut out = vec![min];
    out.extend(upper);
    out.push(max);
    out.extend(lower);
    out
}

/// Squared distance, wrapped so results satisfy the `Data` bound.
#[derive(Clone, Copy)]
pub struct DistSq(pub f64);

impl PartialEq for DistSq {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}
impl Eq for DistSq {}
impl Hash for DistSq {
    fn hash<H: Hasher>(&self, h: &mut H) {
        self.0.to_bits().hash(h);
    }
}
impl Debug for DistSq {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}²", self.0)
    }
}

/// The memoized per-point worker: greatest squared distance from one
/// point into a cloud.
pub fn max_dist_mfn(nm: Name) -> Mfn<(Point, Vec<Point>), DistSq> {
    mk_mfn(nm, |_mfn, (p, cloud): (Point, Vec<Point>)| {
        let mut best = 0.0f64;
        for q in cloud.iter() {
            let d = dist_sq(&p, q);
            if d > best {
                best = d;
            }
        }
        DistSq(best)
    })
}

/// Greatest squared distance between two clouds.
pub fn cloud_max_dist(mfn: &Mfn<(Point, Vec<Point>), DistSq>, a: &[Point], b: &[Point]) -> f64 {
    let mut best = 0.0f64;
    for p in a.iter() {
        let DistSq(d) = force(&mfn.art((*p, b.to_vec())));
        if d > best {
            best = d;
        }
    }
    best
}
