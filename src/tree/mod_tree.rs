use super::*;

use std::time::Instant;

use rayon::prelude::*;

/// Tree that absorbs element churn without full rebuilds: a `main` tree built
/// once over the initial set, plus a small `delta` tree rebuilt on every
/// `update` over removed-then-readded and newly inserted primitives. Queries
/// run against both parts.
///
/// Main-tree node AABBs are never refreshed by `update`; they stay supersets
/// of the live contents, which inflates traversal cost but never invalidates
/// results. `main_live_count` and `delta_len` let callers decide when churn
/// warrants a fresh `build`.
pub struct ModTree<I, R: Real, const D: usize> {
    main: Tree<I, R, D>,
    delta: Tree<I, R, D>,
    delta_ids: Vec<I>,
}

impl<I: TreeIndex, R: Real, const D: usize> ModTree<I, R, D> {
    pub fn new() -> Self {
        Self {
            main: Tree::new(),
            delta: Tree::new(),
            delta_ids: Vec::new(),
        }
    }

    /// Builds the main tree and discards any delta state.
    pub fn build<P, A>(
        &mut self,
        objects: &[P],
        aabb_of: A,
        config: &TreeConfig,
        strategy: PartitionStrategy,
        executor: &Executor,
    ) where
        P: Sync,
        A: Fn(&P) -> Aabb<R, D> + Sync,
    {
        self.delta.clear();
        self.delta_ids.clear();
        self.main.build(objects, aabb_of, config, strategy, executor);
    }

    /// Applies one round of churn: primitives failing `keep_if` disappear
    /// from queries, `new_ids` (indices into `objects`) are inserted. The
    /// main tree is compacted in place; the delta tree is rebuilt over the
    /// surviving old delta ids plus `new_ids`.
    pub fn update<P, A, F>(
        &mut self,
        objects: &[P],
        aabb_of: A,
        new_ids: &[I],
        keep_if: F,
        config: &TreeConfig,
        strategy: PartitionStrategy,
        executor: &Executor,
    ) where
        P: Sync,
        A: Fn(&P) -> Aabb<R, D> + Sync,
        F: Fn(I) -> bool + Sync,
    {
        let timer = Instant::now();
        self.compact_main(None, &keep_if, executor);
        self.rebuild_delta(objects, &aabb_of, None, new_ids, &keep_if, config, strategy, executor);
        debug!(
            "Updated tree: {} live in main, {} in delta, {:.03} ms",
            self.main_live_count(),
            self.delta_len(),
            timer.elapsed().as_secs_f64() * 1e3
        );
    }

    /// `update` for callers that renumber surviving primitives: every stored
    /// id is first rewritten through `mapping` (old id to new id,
    /// `I::invalid()` for dropped ones), then filtered with `keep_if`, which
    /// receives mapped ids. See [`mask_to_mapping`].
    pub fn update_mapped<P, A, F>(
        &mut self,
        objects: &[P],
        aabb_of: A,
        mapping: &[I],
        new_ids: &[I],
        keep_if: F,
        config: &TreeConfig,
        strategy: PartitionStrategy,
        executor: &Executor,
    ) where
        P: Sync,
        A: Fn(&P) -> Aabb<R, D> + Sync,
        F: Fn(I) -> bool + Sync,
    {
        self.compact_main(Some(mapping), &keep_if, executor);
        self.rebuild_delta(
            objects,
            &aabb_of,
            Some(mapping),
            new_ids,
            &keep_if,
            config,
            strategy,
            executor,
        );
    }

    #[inline]
    pub fn main_tree(&self) -> &Tree<I, R, D> {
        &self.main
    }

    #[inline]
    pub fn delta_tree(&self) -> &Tree<I, R, D> {
        &self.delta
    }

    /// Number of live primitives still served by the main tree.
    pub fn main_live_count(&self) -> usize {
        self.main
            .nodes
            .iter()
            .filter_map(Node::leaf_range)
            .map(|(_, count)| count)
            .sum()
    }

    /// Number of primitives served by the delta tree.
    #[inline]
    pub fn delta_len(&self) -> usize {
        self.delta_ids.len()
    }

    pub fn clear(&mut self) {
        self.main.clear();
        self.delta.clear();
        self.delta_ids.clear();
    }

    /// Partitions every main-tree leaf slice so live ids precede dead ones
    /// and shrinks the leaf count to the live prefix. Storage is not
    /// compacted and node AABBs are left alone.
    fn compact_main<F>(&mut self, mapping: Option<&[I]>, keep_if: &F, executor: &Executor)
    where
        F: Fn(I) -> bool + Sync,
    {
        let nodes = &mut self.main.nodes;
        let ids = &mut self.main.ids;

        // Leaf slices partition the id storage; rebind them in offset order
        // so each parallel job owns its leaf node and its id slice.
        let mut leaves: Vec<&mut Node<I, R, D>> =
            nodes.iter_mut().filter(|node| node.is_leaf()).collect();
        leaves.sort_by_key(|node| node.leaf_range().map(|(offset, _)| offset));
        let mut jobs: Vec<(&mut Node<I, R, D>, &mut [I])> = Vec::with_capacity(leaves.len());
        let mut rest: &mut [I] = ids;
        let mut cursor = 0;
        for node in leaves {
            let Some((offset, count)) = node.leaf_range() else {
                continue;
            };
            let tail = std::mem::take(&mut rest).split_at_mut(offset - cursor).1;
            let (slice, tail) = tail.split_at_mut(count);
            cursor = offset + count;
            rest = tail;
            jobs.push((node, slice));
        }

        executor.install(|| {
            jobs.into_par_iter().for_each(|(node, slice)| {
                if let Some(mapping) = mapping {
                    for id in slice.iter_mut() {
                        *id = mapping[id.as_usize()];
                    }
                }
                let live = itertools::partition(&mut *slice, |id| keep_if(*id));
                let Some((offset, _)) = node.leaf_range() else {
                    return;
                };
                node.kind = NodeKind::Leaf {
                    offset: I::from_usize(offset),
                    count: I::from_usize(live),
                };
            });
        });
    }

    fn rebuild_delta<P, A, F>(
        &mut self,
        objects: &[P],
        aabb_of: &A,
        mapping: Option<&[I]>,
        new_ids: &[I],
        keep_if: &F,
        config: &TreeConfig,
        strategy: PartitionStrategy,
        executor: &Executor,
    ) where
        P: Sync,
        A: Fn(&P) -> Aabb<R, D> + Sync,
        F: Fn(I) -> bool + Sync,
    {
        // Surviving old delta ids, then the newcomers.
        let mut next = Vec::with_capacity(self.delta_ids.len() + new_ids.len());
        match mapping {
            Some(mapping) => next.extend(
                self.delta_ids
                    .iter()
                    .map(|id| mapping[id.as_usize()])
                    .filter(|&id| keep_if(id)),
            ),
            None => next.extend(self.delta_ids.iter().copied().filter(|&id| keep_if(id))),
        }
        next.extend_from_slice(new_ids);
        self.delta_ids = next;

        let indirect = Indirect::new(objects, &self.delta_ids);
        self.delta.build_indexed(
            indirect.len(),
            |i| aabb_of(indirect.get(i)),
            config,
            strategy,
            executor,
        );

        // The freshly built tree permutes 0..delta_ids.len(); remap in place
        // so queries read caller-space primitive ids.
        let delta_ids: &[I] = &self.delta_ids;
        executor.parallel_apply(&mut self.delta.ids, |id| *id = delta_ids[id.as_usize()]);
    }
}

impl<I: TreeIndex, R: Real, const D: usize> Default for ModTree<I, R, D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::test_support::cloud;
    use std::collections::BTreeSet;

    fn keep(id: i32) -> bool {
        id % 7 != 0
    }

    fn build_updated(
        points: &mut Vec<Point<f32, 3>>,
        config: &TreeConfig,
    ) -> (ModTree<i32, f32, 3>, Vec<i32>) {
        let executor = Executor::default();
        let mut tree = ModTree::new();
        tree.build(
            points,
            Aabb::from_point,
            config,
            PartitionStrategy::default(),
            &executor,
        );
        let old_len = points.len();
        points.extend(cloud(100, 99));
        let new_ids = (old_len as i32..points.len() as i32).collect::<Vec<_>>();
        tree.update(
            points,
            Aabb::from_point,
            &new_ids,
            keep,
            config,
            PartitionStrategy::default(),
            &executor,
        );
        let live = (0..points.len() as i32)
            .filter(|&id| keep(id) || id >= old_len as i32)
            .collect::<Vec<_>>();
        (tree, live)
    }

    #[test]
    fn test_main_leaves_are_partitioned() {
        let mut points = cloud(1000, 5);
        let config = TreeConfig::new(4, 4);
        let (tree, _) = build_updated(&mut points, &config);
        let main = tree.main_tree();
        for node in main.nodes() {
            let Some((offset, count)) = node.leaf_range() else {
                continue;
            };
            for &id in &main.ids()[offset..offset + count] {
                assert!(keep(id), "dead id {id} in live prefix");
            }
        }
        assert_eq!(
            tree.main_live_count(),
            (0..1000).filter(|&id| keep(id)).count()
        );
    }

    #[test]
    fn test_delta_holds_exactly_the_newcomers() {
        let mut points = cloud(1000, 6);
        let config = TreeConfig::new(4, 4);
        let (tree, _) = build_updated(&mut points, &config);
        assert_eq!(tree.delta_len(), 100);
        let delta_ids = tree.delta_tree().ids().iter().copied().collect::<BTreeSet<_>>();
        let expected = (1000..1100).collect::<BTreeSet<_>>();
        assert_eq!(delta_ids, expected, "delta ids must be caller-space");
    }

    #[test]
    fn test_second_round_filters_old_delta() {
        let executor = Executor::default();
        let config = TreeConfig::new(4, 4);
        let mut points = cloud(200, 7);
        let mut tree = ModTree::<i32, f32, 3>::new();
        tree.build(
            &points,
            Aabb::from_point,
            &config,
            PartitionStrategy::default(),
            &executor,
        );
        points.extend(cloud(50, 70));
        let first_wave = (200_i32..250).collect::<Vec<_>>();
        tree.update(
            &points,
            Aabb::from_point,
            &first_wave,
            |_| true,
            &config,
            PartitionStrategy::default(),
            &executor,
        );
        // Second round drops the odd half of the first wave and adds nothing.
        tree.update(
            &points,
            Aabb::from_point,
            &[],
            |id| id < 200 || id % 2 == 0,
            &config,
            PartitionStrategy::default(),
            &executor,
        );
        let delta_ids = tree.delta_tree().ids().iter().copied().collect::<BTreeSet<_>>();
        let expected = (200..250).filter(|id| id % 2 == 0).collect::<BTreeSet<_>>();
        assert_eq!(delta_ids, expected);
    }

    #[test]
    fn test_update_matches_fresh_build() {
        let mut points = cloud(1000, 8);
        let config = TreeConfig::new(4, 4);
        let (tree, live) = build_updated(&mut points, &config);

        let region = Aabb::new(Point::from([-4.0, -4.0, -4.0]), Point::from([4.0, 4.0, 4.0]));
        let mut updated_hits = Vec::new();
        search_all(
            &tree,
            |aabb: &Aabb<f32, 3>| aabb.intersects(&region),
            |id| updated_hits.push(id),
        );
        updated_hits.sort_unstable();

        let mut expected = live
            .iter()
            .copied()
            .filter(|&id| region.contains_point(&points[id as usize]))
            .collect::<Vec<_>>();
        expected.sort_unstable();
        assert_eq!(updated_hits, expected);
    }

    #[test]
    fn test_update_mapped_renumbers_survivors() {
        let executor = Executor::default();
        let config = TreeConfig::new(4, 4);
        let points = cloud(300, 9);
        let mut tree = ModTree::<i32, f32, 3>::new();
        tree.build(
            &points,
            Aabb::from_point,
            &config,
            PartitionStrategy::default(),
            &executor,
        );

        // Drop the last third and renumber the survivors compactly.
        let mask = (0..300).map(|id| id < 200).collect::<Vec<_>>();
        let mapping = mask_to_mapping::<i32>(&mask);
        let survivors = points[..200].to_vec();
        tree.update_mapped(
            &survivors,
            Aabb::from_point,
            &mapping,
            &[],
            |id| id != i32::invalid(),
            &config,
            PartitionStrategy::default(),
            &executor,
        );

        let mut hits = Vec::new();
        search_all(&tree, |_: &Aabb<f32, 3>| true, |id| hits.push(id));
        hits.sort_unstable();
        assert_eq!(hits, (0..200).collect::<Vec<_>>());
    }
}
