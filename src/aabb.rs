use super::*;

/// Axis-aligned bounding box. `min[i] <= max[i]` is assumed on every axis for
/// boxes handed to a tree; the crate does not guard against inverted boxes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb<R: Real, const D: usize> {
    pub min: Point<R, D>,
    pub max: Point<R, D>,
}

impl<R: Real, const D: usize> Aabb<R, D> {
    #[inline]
    pub fn new(min: Point<R, D>, max: Point<R, D>) -> Self {
        Self { min, max }
    }

    /// Inverted box that acts as the identity for `merge`.
    #[inline]
    pub fn empty() -> Self {
        Self {
            min: Point::from(Vector::repeat(num::Float::max_value())),
            max: Point::from(Vector::repeat(-<R as num::Float>::max_value())),
        }
    }

    #[inline]
    pub fn from_point(point: &Point<R, D>) -> Self {
        Self {
            min: *point,
            max: *point,
        }
    }

    pub fn from_points<'a, Iter>(points: Iter) -> Self
    where
        Iter: IntoIterator<Item = &'a Point<R, D>>,
    {
        let mut aabb = Self::empty();
        for point in points {
            aabb.extend(point);
        }
        aabb
    }

    #[inline]
    pub fn center(&self) -> Point<R, D> {
        na::center(&self.min, &self.max)
    }

    #[inline]
    pub fn diagonal(&self) -> Vector<R, D> {
        self.max - self.min
    }

    pub fn extend(&mut self, point: &Point<R, D>) {
        self.min = self.min.coords.inf(&point.coords).into();
        self.max = self.max.coords.sup(&point.coords).into();
    }

    pub fn merge(&mut self, other: &Self) {
        self.min = self.min.coords.inf(&other.min.coords).into();
        self.max = self.max.coords.sup(&other.max.coords).into();
    }

    pub fn merged(&self, other: &Self) -> Self {
        Self {
            min: self.min.coords.inf(&other.min.coords).into(),
            max: self.max.coords.sup(&other.max.coords).into(),
        }
    }

    pub fn intersects(&self, other: &Self) -> bool {
        for i in 0..D {
            if self.max[i] < other.min[i] || other.max[i] < self.min[i] {
                return false;
            }
        }
        true
    }

    /// Intersection with a symmetric tolerance on every axis.
    pub fn intersects_eps(&self, other: &Self, epsilon: R) -> bool {
        for i in 0..D {
            if self.max[i] + epsilon < other.min[i] || other.max[i] + epsilon < self.min[i] {
                return false;
            }
        }
        true
    }

    pub fn contains_point(&self, point: &Point<R, D>) -> bool {
        for i in 0..D {
            if point[i] < self.min[i] || point[i] > self.max[i] {
                return false;
            }
        }
        true
    }

    pub fn contains_point_eps(&self, point: &Point<R, D>, epsilon: R) -> bool {
        for i in 0..D {
            if point[i] + epsilon < self.min[i] || point[i] - epsilon > self.max[i] {
                return false;
            }
        }
        true
    }

    /// Squared distance between two boxes, zero when they overlap.
    pub fn distance2(&self, other: &Self) -> R {
        let mut sum = R::zero();
        for i in 0..D {
            if self.max[i] < other.min[i] {
                let d = other.min[i] - self.max[i];
                sum += d * d;
            } else if other.max[i] < self.min[i] {
                let d = self.min[i] - other.max[i];
                sum += d * d;
            }
        }
        sum
    }

    /// Squared distance from a box to a point, zero when inside.
    pub fn distance2_to_point(&self, point: &Point<R, D>) -> R {
        let mut sum = R::zero();
        for i in 0..D {
            let below = rmax(self.min[i] - point[i], R::zero());
            let above = rmax(point[i] - self.max[i], R::zero());
            sum += below * below + above * above;
        }
        sum
    }

    /// Upper bound on the squared distance of the closest primitive pair
    /// under two boxes: some pair is no farther apart than the corresponding
    /// corners of the boxes.
    pub fn min_max_distance2(&self, other: &Self) -> R {
        rmax(
            (self.min - other.min).norm_squared(),
            (self.max - other.max).norm_squared(),
        )
    }
}
