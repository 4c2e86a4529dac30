use super::*;

use std::collections::BinaryHeap;

use smallvec::SmallVec;

/// Best-first expansion order used by nearness traversals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NearnessStrategy {
    /// Stack that sorts only the freshly pushed children at each expansion;
    /// comparable to the heap on work done, better cache behavior on
    /// shallow trees.
    #[default]
    SortByLevel,
    /// Global priority queue keyed by the node metric.
    PriorityQueue,
}

const DEFAULT_PARALLEL_DEPTH: usize = 6;

//
// Single-tree nearness
//

/// Nearest primitive of a set under a caller-defined metric. `aabb_metric`
/// must lower-bound `leaf_metric` over everything inside the box (squared
/// distances in practice); `leaf_metric` reports the exact candidate for one
/// primitive. Returns `None` for an empty set.
pub fn nearness_search<S, I, R, const D: usize, FM, FL>(
    set: &S,
    aabb_metric: FM,
    leaf_metric: FL,
) -> Option<TreeMetricPoint<I, R, D>>
where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>) -> R,
    FL: FnMut(I) -> MetricPoint<R, D>,
{
    nearness_search_with(NearnessStrategy::default(), set, aabb_metric, leaf_metric)
}

pub fn nearness_search_with<S, I, R, const D: usize, FM, FL>(
    strategy: NearnessStrategy,
    set: &S,
    aabb_metric: FM,
    mut leaf_metric: FL,
) -> Option<TreeMetricPoint<I, R, D>>
where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>) -> R,
    FL: FnMut(I) -> MetricPoint<R, D>,
{
    let mut best = BestMetric::new();
    run_single(strategy, set, &aabb_metric, &mut leaf_metric, &mut best);
    best.into_best().map(|(id, info)| TreeMetricPoint { id, info })
}

/// `nearness_search` bounded by a search radius; candidates with metric at or
/// beyond `radius * radius` are never reported.
pub fn nearness_search_within<S, I, R, const D: usize, FM, FL>(
    set: &S,
    aabb_metric: FM,
    mut leaf_metric: FL,
    radius: R,
) -> Option<TreeMetricPoint<I, R, D>>
where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>) -> R,
    FL: FnMut(I) -> MetricPoint<R, D>,
{
    let mut best = BestMetric::with_radius(radius);
    run_single(
        NearnessStrategy::default(),
        set,
        &aabb_metric,
        &mut leaf_metric,
        &mut best,
    );
    best.into_best().map(|(id, info)| TreeMetricPoint { id, info })
}

/// k-nearest variant; results accumulate into `knn` in ascending metric
/// order. The caller owns the accumulator and may carry it across calls.
pub fn nearness_search_knn<S, I, R, const D: usize, FM, FL>(
    set: &S,
    aabb_metric: FM,
    mut leaf_metric: FL,
    knn: &mut NearestNeighbors<I, MetricPoint<R, D>, R>,
) where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>) -> R,
    FL: FnMut(I) -> MetricPoint<R, D>,
{
    run_single(
        NearnessStrategy::default(),
        set,
        &aabb_metric,
        &mut leaf_metric,
        knn,
    );
}

fn run_single<S, I, R, const D: usize, FM, FL, Sink>(
    strategy: NearnessStrategy,
    set: &S,
    aabb_metric: &FM,
    leaf_metric: &mut FL,
    sink: &mut Sink,
) where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>) -> R,
    FL: FnMut(I) -> MetricPoint<R, D>,
    Sink: MetricSink<I, MetricPoint<R, D>, R>,
{
    set.for_each_part(&mut |part| match strategy {
        NearnessStrategy::SortByLevel => single_sorted(part, aabb_metric, leaf_metric, sink),
        NearnessStrategy::PriorityQueue => single_heap(part, aabb_metric, leaf_metric, sink),
    });
}

struct NodeEntry<R: Real> {
    metric: R,
    id: usize,
}

fn single_sorted<I, R, const D: usize, FM, FL, Sink>(
    part: Form<'_, I, R, D>,
    aabb_metric: &FM,
    leaf_metric: &mut FL,
    sink: &mut Sink,
) -> bool
where
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>) -> R,
    FL: FnMut(I) -> MetricPoint<R, D>,
    Sink: MetricSink<I, MetricPoint<R, D>, R>,
{
    let tree = part.tree();
    if tree.is_empty() {
        return false;
    }
    let transformation = part.transformation();
    let metric = |aabb: &Aabb<R, D>| match &transformation {
        Some(t) => aabb_metric(&t.transform_aabb(aabb)),
        None => aabb_metric(aabb),
    };
    let nodes = tree.nodes();
    let ids = tree.ids();

    let mut stack: SmallVec<[NodeEntry<R>; 64]> = SmallVec::new();
    stack.push(NodeEntry {
        metric: metric(&nodes[0].aabb),
        id: 0,
    });
    while let Some(current) = stack.pop() {
        if current.metric > sink.metric() {
            continue;
        }
        let node = &nodes[current.id];
        if let Some((offset, count)) = node.leaf_range() {
            for &id in &ids[offset..offset + count] {
                if sink.update(id, leaf_metric(id)) {
                    return true;
                }
            }
        } else if let Some((first_child, count)) = node.children_range() {
            let pushed_at = stack.len();
            for child in first_child..first_child + count {
                let child_metric = metric(&nodes[child].aabb);
                if child_metric <= sink.metric() {
                    stack.push(NodeEntry {
                        metric: child_metric,
                        id: child,
                    });
                }
            }
            // Order only the new entries, nearest last so it pops first.
            stack[pushed_at..].sort_unstable_by(|a, b| {
                b.metric
                    .partial_cmp(&a.metric)
                    .expect("Unable to compare metrics")
            });
        }
    }
    false
}

fn single_heap<I, R, const D: usize, FM, FL, Sink>(
    part: Form<'_, I, R, D>,
    aabb_metric: &FM,
    leaf_metric: &mut FL,
    sink: &mut Sink,
) -> bool
where
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>) -> R,
    FL: FnMut(I) -> MetricPoint<R, D>,
    Sink: MetricSink<I, MetricPoint<R, D>, R>,
{
    let tree = part.tree();
    if tree.is_empty() {
        return false;
    }
    let transformation = part.transformation();
    let metric = |aabb: &Aabb<R, D>| match &transformation {
        Some(t) => aabb_metric(&t.transform_aabb(aabb)),
        None => aabb_metric(aabb),
    };
    let nodes = tree.nodes();
    let ids = tree.ids();

    let mut heap = BinaryHeap::new();
    heap.push(MinOrdered(NodeEntry {
        metric: metric(&nodes[0].aabb),
        id: 0,
    }));
    while let Some(MinOrdered(current)) = heap.pop() {
        if current.metric > sink.metric() {
            continue;
        }
        let node = &nodes[current.id];
        if let Some((offset, count)) = node.leaf_range() {
            for &id in &ids[offset..offset + count] {
                if sink.update(id, leaf_metric(id)) {
                    return true;
                }
            }
        } else if let Some((first_child, count)) = node.children_range() {
            for child in first_child..first_child + count {
                let child_metric = metric(&nodes[child].aabb);
                if child_metric <= sink.metric() {
                    heap.push(MinOrdered(NodeEntry {
                        metric: child_metric,
                        id: child,
                    }));
                }
            }
        }
    }
    false
}

/// Reverses the comparison so std's max-heap pops the smallest entry.
struct MinOrdered<T>(T);

trait HeapKey {
    type Key: PartialOrd;
    fn key(&self) -> Self::Key;
}

impl<R: Real> HeapKey for NodeEntry<R> {
    type Key = R;
    fn key(&self) -> R {
        self.metric
    }
}

impl<T: HeapKey> PartialEq for MinOrdered<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.key() == other.0.key()
    }
}

impl<T: HeapKey> Eq for MinOrdered<T> {}

impl<T: HeapKey> PartialOrd for MinOrdered<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: HeapKey> Ord for MinOrdered<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .0
            .key()
            .partial_cmp(&self.0.key())
            .expect("Unable to compare metrics")
    }
}

//
// Dual-tree nearness
//

/// Nearest primitive pair between two sets. `aabb_metrics` lower-bounds pairs
/// of boxes (see [`AabbMetrics`]); `leaf_metric` reports the exact candidate
/// for one primitive pair.
pub fn nearness_search_pair<S0, S1, I, R, const D: usize, FM, FL>(
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    leaf_metric: FL,
) -> Option<TreeMetricPointPair<I, R, D>>
where
    S0: FormSet<I, R, D>,
    S1: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R>,
    FL: FnMut(I, I) -> MetricPointPair<R, D>,
{
    nearness_search_pair_with(
        NearnessStrategy::default(),
        set0,
        set1,
        aabb_metrics,
        leaf_metric,
    )
}

pub fn nearness_search_pair_with<S0, S1, I, R, const D: usize, FM, FL>(
    strategy: NearnessStrategy,
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    mut leaf_metric: FL,
) -> Option<TreeMetricPointPair<I, R, D>>
where
    S0: FormSet<I, R, D>,
    S1: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R>,
    FL: FnMut(I, I) -> MetricPointPair<R, D>,
{
    let mut best = BestMetric::new();
    run_pair(strategy, set0, set1, &aabb_metrics, &mut leaf_metric, &mut best);
    best.into_best().map(|(ids, info)| TreeMetricPointPair { ids, info })
}

pub fn nearness_search_pair_within<S0, S1, I, R, const D: usize, FM, FL>(
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    mut leaf_metric: FL,
    radius: R,
) -> Option<TreeMetricPointPair<I, R, D>>
where
    S0: FormSet<I, R, D>,
    S1: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R>,
    FL: FnMut(I, I) -> MetricPointPair<R, D>,
{
    let mut best = BestMetric::with_radius(radius);
    run_pair(
        NearnessStrategy::default(),
        set0,
        set1,
        &aabb_metrics,
        &mut leaf_metric,
        &mut best,
    );
    best.into_best().map(|(ids, info)| TreeMetricPointPair { ids, info })
}

pub fn nearness_search_pair_knn<S0, S1, I, R, const D: usize, FM, FL>(
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    mut leaf_metric: FL,
    knn: &mut NearestNeighbors<(I, I), MetricPointPair<R, D>, R>,
) where
    S0: FormSet<I, R, D>,
    S1: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R>,
    FL: FnMut(I, I) -> MetricPointPair<R, D>,
{
    run_pair(
        NearnessStrategy::default(),
        set0,
        set1,
        &aabb_metrics,
        &mut leaf_metric,
        knn,
    );
}

fn run_pair<S0, S1, I, R, const D: usize, FM, FL, Sink>(
    strategy: NearnessStrategy,
    set0: &S0,
    set1: &S1,
    aabb_metrics: &FM,
    leaf_metric: &mut FL,
    sink: &mut Sink,
) where
    S0: FormSet<I, R, D>,
    S1: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R>,
    FL: FnMut(I, I) -> MetricPointPair<R, D>,
    Sink: MetricSink<(I, I), MetricPointPair<R, D>, R>,
{
    set0.for_each_part(&mut |part0| {
        set1.for_each_part(&mut |part1| {
            pair_traverse(strategy, part0, part1, aabb_metrics, leaf_metric, sink)
        })
    });
}

struct PairEntry<R: Real> {
    min2: R,
    min_max2: R,
    id0: usize,
    id1: usize,
}

impl<R: Real> HeapKey for PairEntry<R> {
    type Key = (R, R);
    fn key(&self) -> (R, R) {
        (self.min2, self.min_max2)
    }
}

/// Composes the part transformations with the caller's pair metric.
struct PairMetric<'a, R: Real, const D: usize, FM> {
    t0: Option<Transformation<R, D>>,
    t1: Option<Transformation<R, D>>,
    aabb_metrics: &'a FM,
}

impl<'a, R: Real, const D: usize, FM> PairMetric<'a, R, D, FM>
where
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R>,
{
    #[inline]
    fn eval(&self, aabb0: &Aabb<R, D>, aabb1: &Aabb<R, D>) -> AabbMetrics<R> {
        let aabb0 = match &self.t0 {
            Some(t) => t.transform_aabb(aabb0),
            None => *aabb0,
        };
        let aabb1 = match &self.t1 {
            Some(t) => t.transform_aabb(aabb1),
            None => *aabb1,
        };
        (self.aabb_metrics)(&aabb0, &aabb1)
    }
}

fn pair_traverse<I, R, const D: usize, FM, FL, Sink>(
    strategy: NearnessStrategy,
    part0: Form<'_, I, R, D>,
    part1: Form<'_, I, R, D>,
    aabb_metrics: &FM,
    leaf_metric: &mut FL,
    sink: &mut Sink,
) -> bool
where
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R>,
    FL: FnMut(I, I) -> MetricPointPair<R, D>,
    Sink: MetricSink<(I, I), MetricPointPair<R, D>, R>,
{
    let tree0 = part0.tree();
    let tree1 = part1.tree();
    if tree0.is_empty() || tree1.is_empty() {
        return false;
    }
    let metric = PairMetric {
        t0: part0.transformation(),
        t1: part1.transformation(),
        aabb_metrics,
    };
    let nodes0 = tree0.nodes();
    let nodes1 = tree1.nodes();
    let ids0 = tree0.ids();
    let ids1 = tree1.ids();

    // Running bounds: aabb_max is the least upper bound seen on the best
    // pair, so any pair whose lower bound exceeds it is prunable even before
    // the sink tightens.
    let mut aabb_max = sink.metric();

    match strategy {
        NearnessStrategy::SortByLevel => {
            let mut stack: SmallVec<[PairEntry<R>; 64]> = SmallVec::new();
            {
                let ds2 = metric.eval(&nodes0[0].aabb, &nodes1[0].aabb);
                if ds2.min_d2 > sink.metric() {
                    return false;
                }
                aabb_max = rmin(aabb_max, ds2.min_max_d2);
                stack.push(PairEntry {
                    min2: ds2.min_d2,
                    min_max2: ds2.min_max_d2,
                    id0: 0,
                    id1: 0,
                });
            }
            while let Some(current) = stack.pop() {
                if current.min2 > sink.metric() || current.min2 > aabb_max {
                    continue;
                }
                let node0 = &nodes0[current.id0];
                let node1 = &nodes1[current.id1];
                if let (Some((offset0, count0)), Some((offset1, count1))) =
                    (node0.leaf_range(), node1.leaf_range())
                {
                    for &id0 in &ids0[offset0..offset0 + count0] {
                        for &id1 in &ids1[offset1..offset1 + count1] {
                            if sink.update((id0, id1), leaf_metric(id0, id1)) {
                                return true;
                            }
                        }
                    }
                    continue;
                }
                let pushed_at = stack.len();
                let bound = sink.metric();
                let mut push = |id0: usize, id1: usize, stack: &mut SmallVec<[PairEntry<R>; 64]>, aabb_max: &mut R| {
                    let ds2 = metric.eval(&nodes0[id0].aabb, &nodes1[id1].aabb);
                    if ds2.min_d2 > bound || ds2.min_d2 > *aabb_max {
                        return;
                    }
                    *aabb_max = rmin(*aabb_max, ds2.min_max_d2);
                    stack.push(PairEntry {
                        min2: ds2.min_d2,
                        min_max2: ds2.min_max_d2,
                        id0,
                        id1,
                    });
                };
                match (node0.children_range(), node1.children_range()) {
                    (Some((first0, count0)), Some((first1, count1))) => {
                        for a in first0..first0 + count0 {
                            for b in first1..first1 + count1 {
                                push(a, b, &mut stack, &mut aabb_max);
                            }
                        }
                    }
                    (Some((first0, count0)), None) => {
                        for a in first0..first0 + count0 {
                            push(a, current.id1, &mut stack, &mut aabb_max);
                        }
                    }
                    (None, Some((first1, count1))) => {
                        for b in first1..first1 + count1 {
                            push(current.id0, b, &mut stack, &mut aabb_max);
                        }
                    }
                    (None, None) => unreachable!("leaf pair handled above"),
                }
                stack[pushed_at..].sort_unstable_by(|a, b| {
                    b.key()
                        .partial_cmp(&a.key())
                        .expect("Unable to compare metrics")
                });
            }
        }
        NearnessStrategy::PriorityQueue => {
            let mut heap = BinaryHeap::new();
            {
                let ds2 = metric.eval(&nodes0[0].aabb, &nodes1[0].aabb);
                if ds2.min_d2 > sink.metric() {
                    return false;
                }
                aabb_max = rmin(aabb_max, ds2.min_max_d2);
                heap.push(MinOrdered(PairEntry {
                    min2: ds2.min_d2,
                    min_max2: ds2.min_max_d2,
                    id0: 0,
                    id1: 0,
                }));
            }
            while let Some(MinOrdered(current)) = heap.pop() {
                if current.min2 > sink.metric() || current.min2 > aabb_max {
                    continue;
                }
                let node0 = &nodes0[current.id0];
                let node1 = &nodes1[current.id1];
                if let (Some((offset0, count0)), Some((offset1, count1))) =
                    (node0.leaf_range(), node1.leaf_range())
                {
                    for &id0 in &ids0[offset0..offset0 + count0] {
                        for &id1 in &ids1[offset1..offset1 + count1] {
                            if sink.update((id0, id1), leaf_metric(id0, id1)) {
                                return true;
                            }
                        }
                    }
                    continue;
                }
                let bound = sink.metric();
                let mut push = |id0: usize, id1: usize, heap: &mut BinaryHeap<MinOrdered<PairEntry<R>>>, aabb_max: &mut R| {
                    let ds2 = metric.eval(&nodes0[id0].aabb, &nodes1[id1].aabb);
                    if ds2.min_d2 > bound || ds2.min_d2 > *aabb_max {
                        return;
                    }
                    *aabb_max = rmin(*aabb_max, ds2.min_max_d2);
                    heap.push(MinOrdered(PairEntry {
                        min2: ds2.min_d2,
                        min_max2: ds2.min_max_d2,
                        id0,
                        id1,
                    }));
                };
                match (node0.children_range(), node1.children_range()) {
                    (Some((first0, count0)), Some((first1, count1))) => {
                        for a in first0..first0 + count0 {
                            for b in first1..first1 + count1 {
                                push(a, b, &mut heap, &mut aabb_max);
                            }
                        }
                    }
                    (Some((first0, count0)), None) => {
                        for a in first0..first0 + count0 {
                            push(a, current.id1, &mut heap, &mut aabb_max);
                        }
                    }
                    (None, Some((first1, count1))) => {
                        for b in first1..first1 + count1 {
                            push(current.id0, b, &mut heap, &mut aabb_max);
                        }
                    }
                    (None, None) => unreachable!("leaf pair handled above"),
                }
            }
        }
    }
    false
}

//
// Parallel dual-tree nearness
//

/// Parallel [`nearness_search_pair`]: tasks share the running bounds through
/// relaxed-load/release-CAS atomics and keep per-worker best pairs that are
/// reduced at the end. `aabb_metrics` and `leaf_metric` must be thread-safe.
/// Spawns tasks down to `TreeConfig::default()`'s cutoff depth; use
/// [`par_nearness_search_pair_with_depth`] to override.
pub fn par_nearness_search_pair<S0, S1, I, R, const D: usize, FM, FL>(
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    leaf_metric: FL,
    executor: &Executor,
) -> Option<TreeMetricPointPair<I, R, D>>
where
    S0: FormSet<I, R, D> + Sync,
    S1: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R> + Sync,
    FL: Fn(I, I) -> MetricPointPair<R, D> + Sync,
{
    par_nearness_search_pair_with_depth(
        set0,
        set1,
        aabb_metrics,
        leaf_metric,
        DEFAULT_PARALLEL_DEPTH,
        executor,
    )
}

pub fn par_nearness_search_pair_with_depth<S0, S1, I, R, const D: usize, FM, FL>(
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    leaf_metric: FL,
    parallel_cutoff_depth: usize,
    executor: &Executor,
) -> Option<TreeMetricPointPair<I, R, D>>
where
    S0: FormSet<I, R, D> + Sync,
    S1: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R> + Sync,
    FL: Fn(I, I) -> MetricPointPair<R, D> + Sync,
{
    par_nearness_search_pair_within_with_depth(
        set0,
        set1,
        aabb_metrics,
        leaf_metric,
        num::Float::max_value(),
        parallel_cutoff_depth,
        executor,
    )
}

pub fn par_nearness_search_pair_within<S0, S1, I, R, const D: usize, FM, FL>(
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    leaf_metric: FL,
    radius: R,
    executor: &Executor,
) -> Option<TreeMetricPointPair<I, R, D>>
where
    S0: FormSet<I, R, D> + Sync,
    S1: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R> + Sync,
    FL: Fn(I, I) -> MetricPointPair<R, D> + Sync,
{
    par_nearness_search_pair_within_with_depth(
        set0,
        set1,
        aabb_metrics,
        leaf_metric,
        radius,
        DEFAULT_PARALLEL_DEPTH,
        executor,
    )
}

pub fn par_nearness_search_pair_within_with_depth<S0, S1, I, R, const D: usize, FM, FL>(
    set0: &S0,
    set1: &S1,
    aabb_metrics: FM,
    leaf_metric: FL,
    radius: R,
    parallel_cutoff_depth: usize,
    executor: &Executor,
) -> Option<TreeMetricPointPair<I, R, D>>
where
    S0: FormSet<I, R, D> + Sync,
    S1: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R> + Sync,
    FL: Fn(I, I) -> MetricPointPair<R, D> + Sync,
{
    let bound = metric_f64(radius) * metric_f64(radius);
    let state = ParallelPairState {
        local: LocalValue::new(executor, None),
        best: AtomicMetric::new(bound),
        aabb_min: AtomicMetric::new(bound),
        aabb_max: AtomicMetric::new(bound),
    };
    executor.install(|| {
        set0.for_each_part(&mut |part0| {
            set1.for_each_part(&mut |part1| {
                par_pair_traverse(
                    part0,
                    part1,
                    &aabb_metrics,
                    &leaf_metric,
                    parallel_cutoff_depth,
                    &state,
                );
                false
            })
        })
    });
    state
        .local
        .reduce(|a, b| match (a, b) {
            (Some(x), Some(y)) => {
                if x.1.metric() <= y.1.metric() {
                    Some(x)
                } else {
                    Some(y)
                }
            }
            (x, None) => x,
            (None, y) => y,
        })
        .map(|(ids, info)| TreeMetricPointPair { ids, info })
}

struct ParallelPairState<'e, I, R: Real, const D: usize> {
    local: LocalValue<'e, Option<((I, I), MetricPointPair<R, D>)>>,
    best: AtomicMetric,
    aabb_min: AtomicMetric,
    aabb_max: AtomicMetric,
}

impl<'e, I: TreeIndex, R: Real, const D: usize> ParallelPairState<'e, I, R, D> {
    #[inline]
    fn reject(&self, min_d2: R) -> bool {
        let min_d2 = metric_f64(min_d2);
        min_d2 > self.best.load()
            || min_d2 > self.aabb_max.load()
            || self.aabb_min.load() > self.best.load()
    }

    #[inline]
    fn observe_bounds(&self, ds2: &AabbMetrics<R>) {
        self.aabb_min.update_min(metric_f64(ds2.min_d2));
        self.aabb_max.update_min(metric_f64(ds2.min_max_d2));
    }

    /// Update-if-strictly-better on the shared best, then on the worker's
    /// local pair. Reports `true` on a coincident hit.
    fn update(&self, ids: (I, I), info: MetricPointPair<R, D>) -> bool {
        if self.best.update_min(metric_f64(info.metric())) {
            self.local.update(|slot| *slot = Some((ids, info)));
            return info.metric() < <R as num::Float>::epsilon();
        }
        false
    }
}

fn par_pair_traverse<I, R, const D: usize, FM, FL>(
    part0: Form<'_, I, R, D>,
    part1: Form<'_, I, R, D>,
    aabb_metrics: &FM,
    leaf_metric: &FL,
    parallel_cutoff_depth: usize,
    state: &ParallelPairState<'_, I, R, D>,
) where
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R> + Sync,
    FL: Fn(I, I) -> MetricPointPair<R, D> + Sync,
{
    let tree0 = part0.tree();
    let tree1 = part1.tree();
    if tree0.is_empty() || tree1.is_empty() {
        return;
    }
    let ctx = ParPairContext {
        nodes0: tree0.nodes(),
        ids0: tree0.ids(),
        nodes1: tree1.nodes(),
        ids1: tree1.ids(),
        metric: PairMetric {
            t0: part0.transformation(),
            t1: part1.transformation(),
            aabb_metrics,
        },
        leaf_metric,
        cutoff: parallel_cutoff_depth,
        state,
    };
    ctx.recurse(0, 0, 0);
}

struct ParPairContext<'a, I, R: Real, const D: usize, FM, FL> {
    nodes0: &'a [Node<I, R, D>],
    ids0: &'a [I],
    nodes1: &'a [Node<I, R, D>],
    ids1: &'a [I],
    metric: PairMetric<'a, R, D, FM>,
    leaf_metric: &'a FL,
    cutoff: usize,
    state: &'a ParallelPairState<'a, I, R, D>,
}

impl<'a, I, R, const D: usize, FM, FL> ParPairContext<'a, I, R, D, FM, FL>
where
    I: TreeIndex,
    R: Real,
    FM: Fn(&Aabb<R, D>, &Aabb<R, D>) -> AabbMetrics<R> + Sync,
    FL: Fn(I, I) -> MetricPointPair<R, D> + Sync,
{
    fn recurse(&self, id0: usize, id1: usize, depth: usize) {
        let node0 = &self.nodes0[id0];
        let node1 = &self.nodes1[id1];
        let ds2 = self.metric.eval(&node0.aabb, &node1.aabb);
        if self.state.reject(ds2.min_d2) {
            return;
        }
        self.state.observe_bounds(&ds2);

        if depth >= self.cutoff {
            self.sequential(id0, id1);
            return;
        }
        match (node0.children_range(), node1.children_range()) {
            (Some((first0, count0)), Some((first1, count1))) => {
                rayon::scope(|scope| {
                    for a in first0..first0 + count0 {
                        for b in first1..first1 + count1 {
                            scope.spawn(move |_| self.recurse(a, b, depth + 1));
                        }
                    }
                });
            }
            (Some((first0, count0)), None) => {
                rayon::scope(|scope| {
                    for a in first0..first0 + count0 {
                        scope.spawn(move |_| self.recurse(a, id1, depth + 1));
                    }
                });
            }
            (None, Some((first1, count1))) => {
                rayon::scope(|scope| {
                    for b in first1..first1 + count1 {
                        scope.spawn(move |_| self.recurse(id0, b, depth + 1));
                    }
                });
            }
            (None, None) => {
                self.leaves(node0, node1);
            }
        }
    }

    /// Below the task cutoff: best-first stack bounded by the shared state.
    fn sequential(&self, id0: usize, id1: usize) {
        let mut stack: SmallVec<[PairEntry<R>; 64]> = SmallVec::new();
        let ds2 = self
            .metric
            .eval(&self.nodes0[id0].aabb, &self.nodes1[id1].aabb);
        stack.push(PairEntry {
            min2: ds2.min_d2,
            min_max2: ds2.min_max_d2,
            id0,
            id1,
        });
        while let Some(current) = stack.pop() {
            if self.state.reject(current.min2) {
                continue;
            }
            let node0 = &self.nodes0[current.id0];
            let node1 = &self.nodes1[current.id1];
            if node0.is_leaf() && node1.is_leaf() {
                if self.leaves(node0, node1) {
                    return;
                }
                continue;
            }
            let pushed_at = stack.len();
            let mut push = |a: usize, b: usize, stack: &mut SmallVec<[PairEntry<R>; 64]>| {
                let ds2 = self.metric.eval(&self.nodes0[a].aabb, &self.nodes1[b].aabb);
                if self.state.reject(ds2.min_d2) {
                    return;
                }
                self.state.observe_bounds(&ds2);
                stack.push(PairEntry {
                    min2: ds2.min_d2,
                    min_max2: ds2.min_max_d2,
                    id0: a,
                    id1: b,
                });
            };
            match (node0.children_range(), node1.children_range()) {
                (Some((first0, count0)), Some((first1, count1))) => {
                    for a in first0..first0 + count0 {
                        for b in first1..first1 + count1 {
                            push(a, b, &mut stack);
                        }
                    }
                }
                (Some((first0, count0)), None) => {
                    for a in first0..first0 + count0 {
                        push(a, current.id1, &mut stack);
                    }
                }
                (None, Some((first1, count1))) => {
                    for b in first1..first1 + count1 {
                        push(current.id0, b, &mut stack);
                    }
                }
                (None, None) => unreachable!("leaf pair handled above"),
            }
            stack[pushed_at..].sort_unstable_by(|a, b| {
                b.key()
                    .partial_cmp(&a.key())
                    .expect("Unable to compare metrics")
            });
        }
    }

    fn leaves(&self, node0: &Node<I, R, D>, node1: &Node<I, R, D>) -> bool {
        let (offset0, count0) = node0.leaf_range().expect("leaf pair");
        let (offset1, count1) = node1.leaf_range().expect("leaf pair");
        for &id0 in &self.ids0[offset0..offset0 + count0] {
            for &id1 in &self.ids1[offset1..offset1 + count1] {
                if self.state.update((id0, id1), (self.leaf_metric)(id0, id1)) {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::test_support::{cloud, point_tree};
    use approx::assert_ulps_eq;
    use rand::{Rng, SeedableRng};

    fn query_metrics<'a>(
        points: &'a [Point<f32, 3>],
        query: Point<f32, 3>,
    ) -> (
        impl Fn(&Aabb<f32, 3>) -> f32,
        impl FnMut(i32) -> MetricPoint<f32, 3> + 'a,
    ) {
        (
            move |aabb: &Aabb<f32, 3>| aabb.distance2_to_point(&query),
            move |id: i32| {
                let p = points[id as usize];
                MetricPoint::new((p - query).norm_squared(), p)
            },
        )
    }

    fn brute_force_metrics(points: &[Point<f32, 3>], query: &Point<f32, 3>) -> Vec<(i32, f32)> {
        let mut all = points
            .iter()
            .enumerate()
            .map(|(id, p)| (id as i32, (p - query).norm_squared()))
            .collect::<Vec<_>>();
        all.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        all
    }

    #[test]
    fn test_best_matches_brute_force() {
        let points = cloud(1000, 41);
        let tree = point_tree(&points, &TreeConfig::new(4, 4));
        for (qx, qy, qz) in [(0.0, 0.0, 0.0), (9.5, -9.5, 3.0), (25.0, 25.0, 25.0)] {
            let query = Point::from([qx, qy, qz]);
            let expected = brute_force_metrics(&points, &query)[0];
            for strategy in [NearnessStrategy::SortByLevel, NearnessStrategy::PriorityQueue] {
                let (am, lm) = query_metrics(&points, query);
                let hit = nearness_search_with(strategy, &tree, am, lm).unwrap();
                assert_ulps_eq!(hit.info.metric, expected.1);
                assert_eq!(hit.id, expected.0);
            }
        }
    }

    #[test]
    fn test_empty_and_single() {
        let empty = Tree::<i32, f32, 3>::new();
        let query = Point::from([0.0, 0.0, 0.0]);
        let (am, lm) = query_metrics(&[], query);
        assert!(nearness_search(&empty, am, lm).is_none());

        let one = vec![Point::from([1.0_f32, 2.0, 3.0])];
        let tree = point_tree(&one, &TreeConfig::default());
        let (am, lm) = query_metrics(&one, query);
        let hit = nearness_search(&tree, am, lm).unwrap();
        assert_eq!(hit.id, 0);
        assert_ulps_eq!(hit.info.metric, 14.0);
    }

    #[test]
    fn test_radius_bounds_search() {
        let points = cloud(500, 42);
        let tree = point_tree(&points, &TreeConfig::new(4, 4));
        let query = Point::from([50.0, 0.0, 0.0]);
        let nearest = brute_force_metrics(&points, &query)[0];

        let (am, lm) = query_metrics(&points, query);
        assert!(nearness_search_within(&tree, am, lm, 1.0).is_none());

        let (am, lm) = query_metrics(&points, query);
        let radius = nearest.1.sqrt() + 1.0;
        let hit = nearness_search_within(&tree, am, lm, radius).unwrap();
        assert_eq!(hit.id, nearest.0);
    }

    #[test]
    fn test_knn_matches_sorted_brute_force() {
        let points = cloud(2000, 43);
        let tree = point_tree(&points, &TreeConfig::new(4, 4));
        let query = Point::from([1.0, -2.0, 3.0]);
        let expected = brute_force_metrics(&points, &query);

        let mut knn = NearestNeighbors::new(10);
        let (am, lm) = query_metrics(&points, query);
        nearness_search_knn(&tree, am, lm, &mut knn);
        assert_eq!(knn.len(), 10);
        let metrics = knn.iter().map(|(_, p)| p.metric).collect::<Vec<_>>();
        assert!(metrics.windows(2).all(|w| w[0] <= w[1]), "ascending order");
        for (got, want) in metrics.iter().zip(expected.iter().map(|e| e.1)) {
            assert_ulps_eq!(*got, want);
        }
    }

    #[test]
    fn test_knn_edge_ks() {
        let points = cloud(300, 44);
        let tree = point_tree(&points, &TreeConfig::new(4, 4));
        let query = Point::from([2.0, 2.0, 2.0]);
        let expected = brute_force_metrics(&points, &query);

        // k = 1 equals best-only.
        let mut knn = NearestNeighbors::new(1);
        let (am, lm) = query_metrics(&points, query);
        nearness_search_knn(&tree, am, lm, &mut knn);
        let (am, lm) = query_metrics(&points, query);
        let best = nearness_search(&tree, am, lm).unwrap();
        assert_eq!(knn.items()[0].0, best.id);

        // k = len returns everything, sorted.
        let mut knn = NearestNeighbors::new(points.len());
        let (am, lm) = query_metrics(&points, query);
        nearness_search_knn(&tree, am, lm, &mut knn);
        assert_eq!(knn.len(), points.len());
        for (got, want) in knn.iter().zip(expected.iter()) {
            assert_ulps_eq!(got.1.metric, want.1);
        }
    }

    #[test]
    fn test_knn_radius_zero_keeps_only_coincident() {
        let mut points = cloud(100, 45);
        points.push(points[17]);
        let tree = point_tree(&points, &TreeConfig::new(4, 4));
        let query = points[17];
        let mut knn = NearestNeighbors::with_radius(5, 0.0);
        let (am, lm) = query_metrics(&points, query);
        nearness_search_knn(&tree, am, lm, &mut knn);
        assert_eq!(knn.len(), 2, "the point and its duplicate");
        assert!(knn.iter().all(|(_, p)| p.metric < f32::EPSILON));
    }

    fn pair_metrics<'a>(
        points0: &'a [Point<f32, 3>],
        points1: &'a [Point<f32, 3>],
    ) -> impl FnMut(i32, i32) -> MetricPointPair<f32, 3> + 'a {
        move |id0: i32, id1: i32| {
            let p0 = points0[id0 as usize];
            let p1 = points1[id1 as usize];
            MetricPointPair::new((p0 - p1).norm_squared(), p0, p1)
        }
    }

    #[test]
    fn test_pair_matches_brute_force() {
        let points0 = cloud(300, 46);
        let points1 = cloud(300, 47)
            .into_iter()
            .map(|p| p + Vector::from([15.0, 0.0, 0.0]))
            .collect::<Vec<_>>();
        let tree0 = point_tree(&points0, &TreeConfig::new(4, 4));
        let tree1 = point_tree(&points1, &TreeConfig::new(2, 8));

        let mut expected = (0_i32, 0_i32, f32::MAX);
        for (i, p) in points0.iter().enumerate() {
            for (j, q) in points1.iter().enumerate() {
                let d2 = (p - q).norm_squared();
                if d2 < expected.2 {
                    expected = (i as i32, j as i32, d2);
                }
            }
        }

        for strategy in [NearnessStrategy::SortByLevel, NearnessStrategy::PriorityQueue] {
            let hit = nearness_search_pair_with(
                strategy,
                &tree0,
                &tree1,
                |a, b| AabbMetrics::between(a, b),
                pair_metrics(&points0, &points1),
            )
            .unwrap();
            assert_ulps_eq!(hit.info.metric, expected.2);
            assert_eq!(hit.ids, (expected.0, expected.1));
        }

        let par = par_nearness_search_pair(
            &tree0,
            &tree1,
            |a, b| AabbMetrics::between(a, b),
            {
                let points0 = &points0;
                let points1 = &points1;
                move |id0: i32, id1: i32| {
                    let p0 = points0[id0 as usize];
                    let p1 = points1[id1 as usize];
                    MetricPointPair::new((p0 - p1).norm_squared(), p0, p1)
                }
            },
            &Executor::default(),
        )
        .unwrap();
        assert_ulps_eq!(par.info.metric, expected.2);

        // Depth zero never spawns; the whole search runs on the best-first
        // fallback stack.
        let sequential = par_nearness_search_pair_with_depth(
            &tree0,
            &tree1,
            |a, b| AabbMetrics::between(a, b),
            {
                let points0 = &points0;
                let points1 = &points1;
                move |id0: i32, id1: i32| {
                    let p0 = points0[id0 as usize];
                    let p1 = points1[id1 as usize];
                    MetricPointPair::new((p0 - p1).norm_squared(), p0, p1)
                }
            },
            0,
            &Executor::default(),
        )
        .unwrap();
        assert_ulps_eq!(sequential.info.metric, expected.2);
    }

    #[test]
    fn test_pair_knn_matches_brute_force() {
        let points0 = cloud(80, 48);
        let points1 = cloud(80, 49);
        let tree0 = point_tree(&points0, &TreeConfig::new(4, 4));
        let tree1 = point_tree(&points1, &TreeConfig::new(4, 4));

        let mut all = Vec::new();
        for (i, p) in points0.iter().enumerate() {
            for (j, q) in points1.iter().enumerate() {
                all.push(((i as i32, j as i32), (p - q).norm_squared()));
            }
        }
        all.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

        let mut knn = NearestNeighbors::new(5);
        nearness_search_pair_knn(
            &tree0,
            &tree1,
            |a, b| AabbMetrics::between(a, b),
            pair_metrics(&points0, &points1),
            &mut knn,
        );
        assert_eq!(knn.len(), 5);
        for (got, want) in knn.iter().zip(all.iter()) {
            assert_ulps_eq!(got.1.metric, want.1);
        }
    }

    fn cloud64(count: usize, seed: u64) -> Vec<Point<f64, 3>> {
        let mut rng = rand_pcg::Pcg64Mcg::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                Point::from([
                    rng.gen_range(-10.0_f64..10.0),
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                ])
            })
            .collect()
    }

    #[test]
    fn test_pair_between_shifted_copies() {
        // Two trees over the same cloud; the second wears a frame that maps
        // point 7 to within 1e-7 of point 3, which must come back as the
        // nearest pair.
        let points = cloud64(100, 50);
        let mut tree = Tree::<i32, f64, 3>::new();
        tree.build(
            &points,
            Aabb::from_point,
            &TreeConfig::new(4, 4),
            PartitionStrategy::default(),
            &Executor::default(),
        );
        let delta = Vector::from([1.0_f64, 2.0, -1.0]).normalize() * 1e-7;
        let shift = (points[3] + delta) - points[7];
        let frame = Frame::new(Transformation::from_translation(shift));
        let form = Form::new(&tree, &frame);

        let leaf_metric = |id0: i32, id1: i32| {
            let p0 = points[id0 as usize];
            let p1 = points[id1 as usize] + shift;
            MetricPointPair::new((p0 - p1).norm_squared(), p0, p1)
        };
        let hit =
            nearness_search_pair(&tree, &form, |a, b| AabbMetrics::between(a, b), leaf_metric)
                .unwrap();
        assert_eq!(hit.ids, (3, 7));
        assert!(hit.info.metric <= 1.01e-7 * 1.01e-7);

        let par = par_nearness_search_pair(
            &tree,
            &form,
            |a, b| AabbMetrics::between(a, b),
            leaf_metric,
            &Executor::default(),
        )
        .unwrap();
        assert_eq!(par.ids, (3, 7));
        assert!(par.info.metric <= 1.01e-7 * 1.01e-7);
    }

    #[test]
    fn test_pair_radius_bounds_search() {
        let points0 = cloud(100, 51);
        let points1 = cloud(100, 52)
            .into_iter()
            .map(|p| p + Vector::from([100.0, 0.0, 0.0]))
            .collect::<Vec<_>>();
        let tree0 = point_tree(&points0, &TreeConfig::new(4, 4));
        let tree1 = point_tree(&points1, &TreeConfig::new(4, 4));
        let hit = nearness_search_pair_within(
            &tree0,
            &tree1,
            |a, b| AabbMetrics::between(a, b),
            pair_metrics(&points0, &points1),
            10.0,
        );
        assert!(hit.is_none(), "clouds are at least 80 apart");
    }

    #[test]
    fn test_mod_tree_nearness_covers_both_parts() {
        let executor = Executor::default();
        let config = TreeConfig::new(4, 4);
        let mut points = cloud(400, 53);
        let mut tree = ModTree::<i32, f32, 3>::new();
        tree.build(
            &points,
            Aabb::from_point,
            &config,
            PartitionStrategy::default(),
            &executor,
        );
        points.extend(cloud(100, 54));
        let new_ids = (400_i32..500).collect::<Vec<_>>();
        let keep = |id: i32| id % 5 != 0;
        tree.update(
            &points,
            Aabb::from_point,
            &new_ids,
            keep,
            &config,
            PartitionStrategy::default(),
            &executor,
        );

        let query = Point::from([0.5, 0.5, 0.5]);
        let expected = brute_force_metrics(&points, &query)
            .into_iter()
            .find(|&(id, _)| keep(id) || id >= 400)
            .unwrap();
        let (am, lm) = query_metrics(&points, query);
        let hit = nearness_search(&tree, am, lm).unwrap();
        assert_eq!(hit.id, expected.0);
        assert_ulps_eq!(hit.info.metric, expected.1);
    }
}
