use super::*;

use smallvec::SmallVec;

/// Closed-form cap on the heap size of a tree over `n` primitives: the sum of
/// `inner_size` powers up to the level that can hold every leaf.
pub(super) fn max_node_count(n: usize, inner_size: usize, leaf_size: usize) -> usize {
    let leaves = (n + leaf_size - 1) / leaf_size;
    let mut sum = 1;
    let mut level = 1;
    while level < leaves {
        level *= inner_size;
        sum += level;
    }
    sum
}

/// Shared view of the preallocated node heap. Build tasks write disjoint
/// slots: every task owns exactly the subtree rooted at its `node_id`, and
/// sibling subtrees occupy disjoint heap index sets.
struct RawNodes<I, R: Real, const D: usize> {
    ptr: *mut Node<I, R, D>,
    len: usize,
}

// SAFETY: see the comment on the type; a slot is written by exactly one task
// and nothing reads it until the whole build has joined.
unsafe impl<I: Send, R: Real, const D: usize> Send for RawNodes<I, R, D> {}
unsafe impl<I: Sync, R: Real, const D: usize> Sync for RawNodes<I, R, D> {}

impl<I, R: Real, const D: usize> RawNodes<I, R, D> {
    /// SAFETY: the caller must own heap slot `index` per the scheme above.
    #[inline]
    unsafe fn write(&self, index: usize, node: Node<I, R, D>) {
        debug_assert!(index < self.len);
        *self.ptr.add(index) = node;
    }
}

pub(super) fn build_nodes<I, R, const D: usize>(
    nodes: &mut Vec<Node<I, R, D>>,
    ids: &mut Vec<I>,
    aabbs: &[Aabb<R, D>],
    config: &TreeConfig,
    strategy: PartitionStrategy,
    executor: &Executor,
) where
    I: TreeIndex,
    R: Real,
{
    nodes.clear();
    if aabbs.is_empty() {
        ids.clear();
        return;
    }
    assert!(config.inner_size >= 2, "inner_size must be at least 2");
    assert!(config.leaf_size >= 1, "leaf_size must be at least 1");
    nodes.resize(
        max_node_count(aabbs.len(), config.inner_size, config.leaf_size),
        Node::empty(),
    );
    ids.resize(aabbs.len(), I::from_usize(0));
    executor.parallel_iota(ids, 0);
    let raw = RawNodes {
        ptr: nodes.as_mut_ptr(),
        len: nodes.len(),
    };
    executor.install(|| build_recursive(&raw, aabbs, ids, 0, 0, config, strategy, 0));
}

fn build_recursive<I, R, const D: usize>(
    nodes: &RawNodes<I, R, D>,
    aabbs: &[Aabb<R, D>],
    ids: &mut [I],
    node_id: usize,
    offset: usize,
    config: &TreeConfig,
    strategy: PartitionStrategy,
    depth: usize,
) where
    I: TreeIndex,
    R: Real,
{
    let mut aabb = aabbs[ids[0].as_usize()];
    for id in &ids[1..] {
        aabb.merge(&aabbs[id.as_usize()]);
    }

    let len = ids.len();
    let make_leaf = |aabb: Aabb<R, D>| Node {
        aabb,
        kind: NodeKind::Leaf {
            offset: I::from_usize(offset),
            count: I::from_usize(len),
        },
    };
    if len <= config.leaf_size {
        // SAFETY: this task owns heap slot node_id.
        unsafe { nodes.write(node_id, make_leaf(aabb)) };
        return;
    }

    let diagonal = aabb.diagonal();
    let axis = diagonal.argmax().0;
    // Zero extent on the widest axis means every midpoint coincides; there is
    // no usable split, so terminate as an oversized leaf.
    if approx::ulps_eq!(diagonal[axis], R::zero(), max_ulps = 0) {
        // SAFETY: this task owns heap slot node_id.
        unsafe { nodes.write(node_id, make_leaf(aabb)) };
        return;
    }

    let compare = |a: &I, b: &I| {
        let key_a = aabbs[a.as_usize()].min[axis] + aabbs[a.as_usize()].max[axis];
        let key_b = aabbs[b.as_usize()].min[axis] + aabbs[b.as_usize()].max[axis];
        key_a
            .partial_cmp(&key_b)
            .expect("Unable to compare midpoints")
    };

    // Split ids into inner_size contiguous groups of roughly equal length;
    // each interior boundary is an nth-element selection over what remains.
    let partition_size = (len + config.inner_size - 1) / config.inner_size;
    let first_child = config.inner_size * node_id + 1;
    let mut groups: SmallVec<[(usize, usize, &mut [I]); 8]> = SmallVec::new();
    {
        let mut rest = ids;
        let mut consumed = 0;
        while !rest.is_empty() {
            let take = partition_size.min(rest.len());
            if take < rest.len() {
                strategy.partition(rest, take, compare);
            }
            let (group, tail) = std::mem::take(&mut rest).split_at_mut(take);
            groups.push((first_child + groups.len(), offset + consumed, group));
            consumed += take;
            rest = tail;
        }
    }

    let n_children = groups.len();
    if depth < config.parallel_cutoff_depth {
        rayon::scope(|scope| {
            for (child_id, child_offset, group) in groups {
                scope.spawn(move |_| {
                    build_recursive(
                        nodes,
                        aabbs,
                        group,
                        child_id,
                        child_offset,
                        config,
                        strategy,
                        depth + 1,
                    );
                });
            }
        });
    } else {
        for (child_id, child_offset, group) in groups {
            build_recursive(
                nodes,
                aabbs,
                group,
                child_id,
                child_offset,
                config,
                strategy,
                depth + 1,
            );
        }
    }

    // SAFETY: this task owns heap slot node_id; children have joined.
    unsafe {
        nodes.write(
            node_id,
            Node {
                aabb,
                kind: NodeKind::Inner {
                    axis: axis as u8,
                    first_child: I::from_usize(first_child),
                    count: I::from_usize(n_children),
                },
            },
        );
    }
}
