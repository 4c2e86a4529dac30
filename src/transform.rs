use super::*;

use std::sync::RwLock;

/// Affine map of `D`-space: a `D x D` linear block plus a translation column,
/// i.e. the usual `D x (D+1)` matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transformation<R: Real, const D: usize> {
    pub linear: na::SMatrix<R, D, D>,
    pub translation: Vector<R, D>,
}

impl<R: Real, const D: usize> Transformation<R, D> {
    #[inline]
    pub fn identity() -> Self {
        Self {
            linear: na::SMatrix::identity(),
            translation: Vector::zeros(),
        }
    }

    #[inline]
    pub fn new(linear: na::SMatrix<R, D, D>, translation: Vector<R, D>) -> Self {
        Self {
            linear,
            translation,
        }
    }

    #[inline]
    pub fn from_translation(translation: Vector<R, D>) -> Self {
        Self {
            linear: na::SMatrix::identity(),
            translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, point: &Point<R, D>) -> Point<R, D> {
        Point::from(self.linear * point.coords + self.translation)
    }

    #[inline]
    pub fn transform_vector(&self, vector: &Vector<R, D>) -> Vector<R, D> {
        self.linear * vector
    }

    /// Composition `outer . self`: applying the result equals applying `self`
    /// first and `outer` second.
    pub fn then(&self, outer: &Self) -> Self {
        Self {
            linear: outer.linear * self.linear,
            translation: outer.linear * self.translation + outer.translation,
        }
    }

    pub fn try_inverse(&self) -> Option<Self> {
        let linear = self.linear.try_inverse()?;
        Some(Self {
            translation: -(linear * self.translation),
            linear,
        })
    }

    /// Transformed box that bounds the image of `aabb`: each output axis
    /// accumulates the smaller and larger of the two slab products, which is
    /// exact for the eight (in 3D) transformed corners without enumerating
    /// them.
    pub fn transform_aabb(&self, aabb: &Aabb<R, D>) -> Aabb<R, D> {
        let mut min = self.translation;
        let mut max = self.translation;
        for i in 0..D {
            for j in 0..D {
                let a = self.linear[(i, j)] * aabb.min[j];
                let b = self.linear[(i, j)] * aabb.max[j];
                min[i] += rmin(a, b);
                max[i] += rmax(a, b);
            }
        }
        Aabb::new(Point::from(min), Point::from(max))
    }
}

/// A transformation paired with its lazily recomputed inverse. Writing the
/// forward map invalidates the cache; the inverse is rebuilt on the next read.
#[derive(Debug)]
pub struct Frame<R: Real, const D: usize> {
    transformation: Transformation<R, D>,
    inverse: RwLock<Option<Transformation<R, D>>>,
}

impl<R: Real, const D: usize> Frame<R, D> {
    pub fn identity() -> Self {
        Self {
            transformation: Transformation::identity(),
            inverse: RwLock::new(Some(Transformation::identity())),
        }
    }

    pub fn new(transformation: Transformation<R, D>) -> Self {
        Self {
            transformation,
            inverse: RwLock::new(None),
        }
    }

    pub fn set(&mut self, transformation: Transformation<R, D>) {
        self.transformation = transformation;
        *self.inverse.get_mut().unwrap() = None;
    }

    #[inline]
    pub fn transformation(&self) -> &Transformation<R, D> {
        &self.transformation
    }

    /// The cached inverse, recomputed exactly when the forward map has
    /// changed since the last read.
    pub fn inverse_transformation(&self) -> Transformation<R, D> {
        if let Some(inverse) = *self.inverse.read().unwrap() {
            return inverse;
        }
        let inverse = self
            .transformation
            .try_inverse()
            .expect("frame transformation is not invertible");
        *self.inverse.write().unwrap() = Some(inverse);
        inverse
    }
}

impl<R: Real, const D: usize> Default for Frame<R, D> {
    fn default() -> Self {
        Self::identity()
    }
}

impl<R: Real, const D: usize> From<Transformation<R, D>> for Frame<R, D> {
    fn from(transformation: Transformation<R, D>) -> Self {
        Self::new(transformation)
    }
}
