use super::*;

use std::time::Instant;

mod build;
mod mod_tree;

pub use mod_tree::ModTree;

/// Tree build configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeConfig {
    /// Fanout of inner nodes; larger means shallower, wider trees.
    pub inner_size: usize,
    /// Maximum primitives in a leaf before subdivision stops.
    pub leaf_size: usize,
    /// Recursion depth below which the parallel-internal operations stop
    /// spawning tasks. `build` reads it from this config directly; the
    /// parallel traversals take the same value explicitly — pass it to
    /// [`search_pair_with_depth`], [`search_self_with_depth`] and
    /// [`par_nearness_search_pair_with_depth`]. Their plain variants use the
    /// same depth as `TreeConfig::default()`.
    ///
    /// [`search_pair_with_depth`]: crate::search_pair_with_depth
    /// [`search_self_with_depth`]: crate::search_self_with_depth
    /// [`par_nearness_search_pair_with_depth`]: crate::par_nearness_search_pair_with_depth
    pub parallel_cutoff_depth: usize,
}

impl TreeConfig {
    pub fn new(inner_size: usize, leaf_size: usize) -> Self {
        Self {
            inner_size,
            leaf_size,
            parallel_cutoff_depth: 6,
        }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind<I> {
    /// Unused slot in the implicit heap.
    Empty,
    /// Owns `ids[offset..offset + count]`.
    Leaf { offset: I, count: I },
    /// `count` children at consecutive heap slots starting at `first_child`;
    /// `axis` is the split axis chosen at build time.
    Inner { axis: u8, first_child: I, count: I },
}

/// Node of the implicit n-ary heap: the root is node 0 and the children of
/// node `k` start at heap index `inner_size * k + 1`.
#[derive(Clone, Copy, Debug)]
pub struct Node<I, R: Real, const D: usize> {
    pub aabb: Aabb<R, D>,
    pub kind: NodeKind<I>,
}

impl<I: TreeIndex, R: Real, const D: usize> Node<I, R, D> {
    pub(crate) fn empty() -> Self {
        Self {
            aabb: Aabb::empty(),
            kind: NodeKind::Empty,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, NodeKind::Empty)
    }

    /// `(offset, count)` of the owned id slice, for leaves.
    #[inline]
    pub fn leaf_range(&self) -> Option<(usize, usize)> {
        match self.kind {
            NodeKind::Leaf { offset, count } => Some((offset.as_usize(), count.as_usize())),
            _ => None,
        }
    }

    /// `(first_child, count)` in heap indices, for inner nodes.
    #[inline]
    pub fn children_range(&self) -> Option<(usize, usize)> {
        match self.kind {
            NodeKind::Inner {
                first_child, count, ..
            } => Some((first_child.as_usize(), count.as_usize())),
            _ => None,
        }
    }
}

/// Bounding volume hierarchy over the AABBs of an opaque primitive set. The
/// tree owns three arrays: per-primitive AABBs indexed by primitive id, the
/// node heap, and a permutation of primitive ids of which every leaf owns a
/// contiguous slice. Between builds all three are immutable, so any number of
/// queries may run concurrently.
pub struct Tree<I, R: Real, const D: usize> {
    aabbs: Vec<Aabb<R, D>>,
    nodes: Vec<Node<I, R, D>>,
    ids: Vec<I>,
}

impl<I: TreeIndex, R: Real, const D: usize> Tree<I, R, D> {
    pub fn new() -> Self {
        Self {
            aabbs: Vec::new(),
            nodes: Vec::new(),
            ids: Vec::new(),
        }
    }

    /// Builds the tree over `objects`. `aabb_of` must be pure and thread-safe;
    /// it is invoked once per object, in parallel.
    pub fn build<P, F>(
        &mut self,
        objects: &[P],
        aabb_of: F,
        config: &TreeConfig,
        strategy: PartitionStrategy,
        executor: &Executor,
    ) where
        P: Sync,
        F: Fn(&P) -> Aabb<R, D> + Sync,
    {
        self.build_indexed(
            objects.len(),
            |i| aabb_of(&objects[i]),
            config,
            strategy,
            executor,
        );
    }

    /// Storage-agnostic build entry point: primitives are the indices
    /// `0..len` and `aabb_of` maps an index to its box.
    pub fn build_indexed<F>(
        &mut self,
        len: usize,
        aabb_of: F,
        config: &TreeConfig,
        strategy: PartitionStrategy,
        executor: &Executor,
    ) where
        F: Fn(usize) -> Aabb<R, D> + Sync,
    {
        let timer = Instant::now();
        self.aabbs.clear();
        self.aabbs.resize(len, Aabb::empty());
        executor.parallel_apply_indexed(&mut self.aabbs, |i, aabb| *aabb = aabb_of(i));
        build::build_nodes(
            &mut self.nodes,
            &mut self.ids,
            &self.aabbs,
            config,
            strategy,
            executor,
        );
        debug!(
            "Built tree: {} primitives, {} nodes, {:.03} ms",
            len,
            self.nodes.len(),
            timer.elapsed().as_secs_f64() * 1e3
        );
    }

    #[inline]
    pub fn nodes(&self) -> &[Node<I, R, D>] {
        &self.nodes
    }

    #[inline]
    pub fn ids(&self) -> &[I] {
        &self.ids
    }

    #[inline]
    pub fn primitive_aabbs(&self) -> &[Aabb<R, D>] {
        &self.aabbs
    }

    #[inline]
    pub fn primitive_count(&self) -> usize {
        self.aabbs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.aabbs.clear();
        self.nodes.clear();
        self.ids.clear();
    }
}

impl<I: TreeIndex, R: Real, const D: usize> Default for Tree<I, R, D> {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_empty_build() {
        let tree = point_tree(&[], &TreeConfig::default());
        assert!(tree.is_empty());
        assert!(tree.nodes().is_empty());
        assert!(tree.ids().is_empty());
    }

    #[test]
    fn test_single_primitive() {
        let tree = point_tree(&cloud(1, 1), &TreeConfig::default());
        assert_eq!(tree.nodes().len(), 1);
        assert_eq!(tree.nodes()[0].leaf_range(), Some((0, 1)));
        assert_eq!(tree.ids(), &[0]);
    }

    #[test]
    fn test_clear_resets_to_empty() {
        let mut tree = point_tree(&cloud(64, 13), &TreeConfig::default());
        assert!(!tree.is_empty());
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.primitive_count(), 0);
        assert!(tree.ids().is_empty());
    }

    #[test]
    fn test_invariants_across_configs() {
        let points = cloud(500, 2);
        for config in [
            TreeConfig::new(2, 1),
            TreeConfig::new(2, 8),
            TreeConfig::new(4, 4),
            TreeConfig::new(8, 2),
        ] {
            let tree = point_tree(&points, &config);
            check_tree_invariants(&tree, &config);
        }
    }

    #[test]
    fn test_invariants_across_strategies() {
        let points = cloud(300, 3);
        let config = TreeConfig::new(4, 4);
        for strategy in [
            PartitionStrategy::NthElement,
            PartitionStrategy::FloydRivest,
            PartitionStrategy::Pdq,
            PartitionStrategy::MedianOfMedians,
            PartitionStrategy::MedianOfNinthers,
            PartitionStrategy::MedianOf3Random,
            PartitionStrategy::HeapSelect,
        ] {
            let mut tree = Tree::<i32, f32, 3>::new();
            tree.build(
                &points,
                |p| Aabb::from_point(p),
                &config,
                strategy,
                &Executor::default(),
            );
            check_tree_invariants(&tree, &config);
        }
    }

    #[test]
    fn test_coincident_points_make_oversized_leaf() {
        let points = vec![Point::from([1.0_f32, 2.0, 3.0]); 32];
        let config = TreeConfig::new(2, 4);
        let tree = point_tree(&points, &config);
        check_tree_invariants(&tree, &config);
        assert_eq!(tree.nodes()[0].leaf_range(), Some((0, 32)));
    }

    #[test]
    fn test_sequential_and_parallel_builds_agree_on_shape() {
        let points = cloud(400, 4);
        let mut config = TreeConfig::new(4, 4);
        let parallel = point_tree(&points, &config);
        config.parallel_cutoff_depth = 0;
        let sequential = point_tree(&points, &config);
        assert_eq!(parallel.nodes().len(), sequential.nodes().len());
        for (a, b) in parallel.nodes().iter().zip(sequential.nodes()) {
            assert_eq!(a.is_leaf(), b.is_leaf());
            assert_eq!(a.is_empty(), b.is_empty());
        }
    }
}
