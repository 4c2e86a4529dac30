use super::*;

/// Ray in `D`-space. The direction does not have to be normalized; hit
/// parameters are reported in units of its length.
#[derive(Clone, Copy, Debug)]
pub struct Ray<R: Real, const D: usize> {
    pub origin: Point<R, D>,
    pub direction: Vector<R, D>,
}

impl<R: Real, const D: usize> Ray<R, D> {
    #[inline]
    pub fn new(origin: Point<R, D>, direction: Vector<R, D>) -> Self {
        Self { origin, direction }
    }

    #[inline]
    pub fn between_points(origin: Point<R, D>, end: Point<R, D>) -> Self {
        Self {
            origin,
            direction: end - origin,
        }
    }

    #[inline]
    pub fn at(&self, t: R) -> Point<R, D> {
        self.origin + self.direction * t
    }
}

/// Parametric bounds on accepted ray hits, both inclusive.
#[derive(Clone, Copy, Debug)]
pub struct RayConfig<R: Real> {
    pub min_t: R,
    pub max_t: R,
}

impl<R: Real> RayConfig<R> {
    #[inline]
    pub fn new(min_t: R, max_t: R) -> Self {
        Self { min_t, max_t }
    }
}

impl<R: Real> Default for RayConfig<R> {
    fn default() -> Self {
        Self {
            min_t: R::zero(),
            max_t: num::Float::max_value(),
        }
    }
}

/// Hyperplane `dot(normal, x) + d == 0` with a unit normal.
#[derive(Clone, Copy, Debug)]
pub struct Plane<R: Real, const D: usize> {
    pub normal: na::Unit<Vector<R, D>>,
    pub d: R,
}

impl<R: Real, const D: usize> Plane<R, D> {
    #[inline]
    pub fn new(normal: na::Unit<Vector<R, D>>, d: R) -> Self {
        Self { normal, d }
    }

    #[inline]
    pub fn from_point_normal(point: &Point<R, D>, normal: na::Unit<Vector<R, D>>) -> Self {
        Self {
            d: -normal.dot(&point.coords),
            normal,
        }
    }

    #[inline]
    pub fn signed_distance(&self, point: &Point<R, D>) -> R {
        self.normal.dot(&point.coords) + self.d
    }
}

/// Outcome of casting a ray against a plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RayPlaneCast<R: Real> {
    /// Intersection at `t` within the configured bounds.
    Hit { t: R },
    /// Intersection exists but falls outside `[min_t, max_t]`.
    Miss { t: R },
    /// Ray direction lies in the plane.
    Parallel,
    /// Ray origin lies on the plane and the direction lies in it as well.
    Coplanar,
}

impl<R: Real> RayPlaneCast<R> {
    #[inline]
    pub fn t_hit(&self) -> Option<R> {
        match *self {
            Self::Hit { t } => Some(t),
            _ => None,
        }
    }
}

/// Intersection parameter of a ray and a plane, filtered by `config`.
pub fn ray_cast_plane<R: Real, const D: usize>(
    ray: &Ray<R, D>,
    plane: &Plane<R, D>,
    config: &RayConfig<R>,
) -> RayPlaneCast<R> {
    let vd = plane.normal.dot(&ray.direction);
    let v0 = plane.signed_distance(&ray.origin);
    if num::Float::abs(vd) < <R as num::Float>::epsilon() {
        if num::Float::abs(v0) < <R as num::Float>::epsilon() {
            return RayPlaneCast::Coplanar;
        }
        return RayPlaneCast::Parallel;
    }
    let t = -v0 / vd;
    if t >= config.min_t && t <= config.max_t {
        RayPlaneCast::Hit { t }
    } else {
        RayPlaneCast::Miss { t }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_ulps_eq;

    fn zplane(z: f32) -> Plane<f32, 3> {
        Plane::from_point_normal(
            &Point::from([0.0, 0.0, z]),
            na::Unit::new_normalize(Vector::from([0.0, 0.0, 1.0])),
        )
    }

    #[test]
    fn test_hit_and_miss() {
        let ray =
            Ray::between_points(Point::from([0.0, 0.0, 0.0]), Point::from([0.0, 0.0, 2.0]));
        match ray_cast_plane(&ray, &zplane(3.0), &RayConfig::default()) {
            RayPlaneCast::Hit { t } => {
                assert_ulps_eq!(t, 1.5);
                assert_ulps_eq!(ray.at(t).coords, Vector::from([0.0, 0.0, 3.0]));
            }
            other => panic!("expected hit, got {other:?}"),
        }
        let bounded = RayConfig::new(0.0, 1.0);
        assert_eq!(
            ray_cast_plane(&ray, &zplane(3.0), &bounded),
            RayPlaneCast::Miss { t: 1.5 }
        );
        assert_eq!(
            ray_cast_plane(&ray, &zplane(-1.0), &RayConfig::default()),
            RayPlaneCast::Miss { t: -0.5 }
        );
    }

    #[test]
    fn test_parallel_and_coplanar() {
        let ray = Ray::new(Point::from([0.0, 0.0, 1.0]), Vector::from([1.0, 0.0, 0.0]));
        assert_eq!(
            ray_cast_plane(&ray, &zplane(0.0), &RayConfig::default()),
            RayPlaneCast::Parallel
        );
        let on_plane = Ray::new(Point::from([0.0, 0.0, 0.0]), Vector::from([1.0, 0.0, 0.0]));
        assert_eq!(
            ray_cast_plane(&on_plane, &zplane(0.0), &RayConfig::default()),
            RayPlaneCast::Coplanar
        );
    }
}
