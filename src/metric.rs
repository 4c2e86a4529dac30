use super::*;

/// Squared-distance-shaped value attached to nearness candidates.
pub trait HasMetric<R: Real>: Copy {
    fn metric(&self) -> R;
}

/// A candidate closest point and its metric.
#[derive(Clone, Copy, Debug)]
pub struct MetricPoint<R: Real, const D: usize> {
    pub metric: R,
    pub point: Point<R, D>,
}

impl<R: Real, const D: usize> MetricPoint<R, D> {
    #[inline]
    pub fn new(metric: R, point: Point<R, D>) -> Self {
        Self { metric, point }
    }
}

impl<R: Real, const D: usize> HasMetric<R> for MetricPoint<R, D> {
    #[inline]
    fn metric(&self) -> R {
        self.metric
    }
}

/// A candidate closest point pair and its metric.
#[derive(Clone, Copy, Debug)]
pub struct MetricPointPair<R: Real, const D: usize> {
    pub metric: R,
    pub point0: Point<R, D>,
    pub point1: Point<R, D>,
}

impl<R: Real, const D: usize> MetricPointPair<R, D> {
    #[inline]
    pub fn new(metric: R, point0: Point<R, D>, point1: Point<R, D>) -> Self {
        Self {
            metric,
            point0,
            point1,
        }
    }
}

impl<R: Real, const D: usize> HasMetric<R> for MetricPointPair<R, D> {
    #[inline]
    fn metric(&self) -> R {
        self.metric
    }
}

/// Node-pair bounds used by dual-tree nearness: `min_d2` is the least
/// possible squared distance between contents of the two boxes, `min_max_d2`
/// an upper bound on the squared distance of the best pair below them.
#[derive(Clone, Copy, Debug)]
pub struct AabbMetrics<R: Real> {
    pub min_d2: R,
    pub min_max_d2: R,
}

impl<R: Real> AabbMetrics<R> {
    #[inline]
    pub fn between<const D: usize>(aabb0: &Aabb<R, D>, aabb1: &Aabb<R, D>) -> Self {
        Self {
            min_d2: aabb0.distance2(aabb1),
            min_max_d2: aabb0.min_max_distance2(aabb1),
        }
    }
}

/// Nearness result against one tree.
#[derive(Clone, Copy, Debug)]
pub struct TreeMetricPoint<I, R: Real, const D: usize> {
    pub id: I,
    pub info: MetricPoint<R, D>,
}

/// Nearness result between two trees.
#[derive(Clone, Copy, Debug)]
pub struct TreeMetricPointPair<I, R: Real, const D: usize> {
    pub ids: (I, I),
    pub info: MetricPointPair<R, D>,
}

/// Consumes candidates during a nearness traversal. `metric` is the running
/// pruning bound; `update` reports `true` when the traversal may stop early
/// because no candidate can improve the result.
pub trait MetricSink<E, P, R: Real> {
    fn metric(&self) -> R;

    fn update(&mut self, element: E, info: P) -> bool;
}

/// Best-only sink, optionally bounded by an initial search radius.
pub struct BestMetric<E, P, R: Real> {
    bound: R,
    best: Option<(E, P)>,
}

impl<E, P, R: Real> BestMetric<E, P, R> {
    pub fn new() -> Self {
        Self {
            bound: num::Float::max_value(),
            best: None,
        }
    }

    pub fn with_radius(radius: R) -> Self {
        Self {
            bound: radius * radius,
            best: None,
        }
    }

    pub fn into_best(self) -> Option<(E, P)> {
        self.best
    }
}

impl<E, P, R: Real> Default for BestMetric<E, P, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Copy, P: HasMetric<R>, R: Real> MetricSink<E, P, R> for BestMetric<E, P, R> {
    #[inline]
    fn metric(&self) -> R {
        self.bound
    }

    fn update(&mut self, element: E, info: P) -> bool {
        if info.metric() < self.bound {
            self.bound = info.metric();
            self.best = Some((element, info));
        }
        self.bound < <R as num::Float>::epsilon()
    }
}

/// The k best candidates seen so far, kept sorted ascending by metric. The
/// pruning bound stays at the (optional) radius until the buffer fills, then
/// tracks the current k-th smallest metric.
pub struct NearestNeighbors<E, P, R: Real> {
    entries: Vec<(E, P)>,
    k: usize,
    limit: R,
}

impl<E, P: HasMetric<R>, R: Real> NearestNeighbors<E, P, R> {
    pub fn new(k: usize) -> Self {
        Self {
            entries: Vec::with_capacity(k),
            k,
            limit: num::Float::max_value(),
        }
    }

    /// A zero radius degenerates to machine epsilon so coincident hits are
    /// still reported.
    pub fn with_radius(k: usize, radius: R) -> Self {
        Self {
            entries: Vec::with_capacity(k),
            k,
            limit: rmax(radius * radius, <R as num::Float>::epsilon()),
        }
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending metric order.
    #[inline]
    pub fn items(&self) -> &[(E, P)] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &(E, P)> {
        self.entries.iter()
    }

    pub fn into_vec(self) -> Vec<(E, P)> {
        self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<E: Copy, P: HasMetric<R>, R: Real> MetricSink<E, P, R> for NearestNeighbors<E, P, R> {
    #[inline]
    fn metric(&self) -> R {
        if self.entries.len() < self.k {
            self.limit
        } else {
            self.entries[self.k - 1].1.metric()
        }
    }

    fn update(&mut self, element: E, info: P) -> bool {
        let metric = info.metric();
        if metric < MetricSink::<E, P, R>::metric(self) {
            let at = self
                .entries
                .partition_point(|entry| entry.1.metric() <= metric);
            self.entries.insert(at, (element, info));
            self.entries.truncate(self.k);
        }
        self.entries.len() == self.k
            && self.entries[self.k - 1].1.metric() < <R as num::Float>::epsilon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(metric: f32) -> MetricPoint<f32, 3> {
        MetricPoint::new(metric, Point::from([0.0, 0.0, 0.0]))
    }

    #[test]
    fn test_best_metric() {
        let mut best = BestMetric::<u32, _, f32>::new();
        assert!(!best.update(1, mp(4.0)));
        assert!(!best.update(2, mp(9.0)));
        assert!(!best.update(3, mp(1.0)));
        assert_eq!(best.metric(), 1.0);
        let (id, info) = best.into_best().unwrap();
        assert_eq!(id, 3);
        assert_eq!(info.metric, 1.0);

        let mut bounded = BestMetric::<u32, MetricPoint<f32, 3>, f32>::with_radius(1.0);
        assert!(!bounded.update(1, mp(4.0)));
        assert!(bounded.into_best().is_none());
    }

    #[test]
    fn test_nearest_neighbors_ordering() {
        let mut knn = NearestNeighbors::<u32, _, f32>::new(3);
        for (id, metric) in [(0, 5.0), (1, 1.0), (2, 3.0), (3, 0.5), (4, 4.0)] {
            knn.update(id, mp(metric));
        }
        let metrics = knn.iter().map(|(_, p)| p.metric).collect::<Vec<_>>();
        assert_eq!(metrics, vec![0.5, 1.0, 3.0]);
        assert_eq!(knn.metric(), 3.0);
    }

    #[test]
    fn test_nearest_neighbors_bound_until_full() {
        // The bound must stay at the radius while the buffer is not full, so
        // farther candidates are still admitted.
        let mut knn = NearestNeighbors::<u32, _, f32>::with_radius(2, 10.0);
        knn.update(0, mp(1.0));
        assert_eq!(knn.metric(), 100.0);
        knn.update(1, mp(50.0));
        assert_eq!(knn.metric(), 50.0);
        knn.update(2, mp(200.0));
        assert_eq!(knn.len(), 2);
        assert_eq!(knn.metric(), 50.0);
    }
}
