use super::*;

use std::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;

const DEFAULT_PARALLEL_DEPTH: usize = 6;

//
// Single-tree search
//

/// Overlap/containment search with early exit. `aabb_test` decides whether a
/// node (or primitive) box can satisfy the query; `primitive_test` runs over
/// surviving primitives and returns `true` to abort. The returned flag
/// reports whether any invocation aborted.
///
/// Traversal is single-threaded; callers parallelize by running many
/// searches concurrently over the shared tree.
pub fn search<S, I, R, const D: usize, FA, FP>(
    set: &S,
    aabb_test: FA,
    mut primitive_test: FP,
) -> bool
where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>) -> bool,
    FP: FnMut(I) -> bool,
{
    set.for_each_part(&mut |part| search_part(part, &aabb_test, &mut primitive_test))
}

/// `search` with a visit-all callback.
pub fn search_all<S, I, R, const D: usize, FA, FP>(set: &S, aabb_test: FA, mut visit: FP)
where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>) -> bool,
    FP: FnMut(I),
{
    search(set, aabb_test, |id| {
        visit(id);
        false
    });
}

/// Broad phase: collects the ids of every primitive whose own box passes
/// `aabb_test`.
pub fn search_broad<S, I, R, const D: usize, FA>(set: &S, aabb_test: FA) -> Vec<I>
where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>) -> bool,
{
    let mut out = Vec::new();
    search_all(set, aabb_test, |id| out.push(id));
    out
}

fn search_part<I, R, const D: usize, FA, FP>(
    part: Form<'_, I, R, D>,
    aabb_test: &FA,
    primitive_test: &mut FP,
) -> bool
where
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>) -> bool,
    FP: FnMut(I) -> bool,
{
    let tree = part.tree();
    if tree.is_empty() {
        return false;
    }
    let transformation = part.transformation();
    let test = |aabb: &Aabb<R, D>| match &transformation {
        Some(t) => aabb_test(&t.transform_aabb(aabb)),
        None => aabb_test(aabb),
    };

    let nodes = tree.nodes();
    let ids = tree.ids();
    let aabbs = tree.primitive_aabbs();
    let mut stack: SmallVec<[usize; 64]> = SmallVec::new();
    stack.push(0);
    while let Some(node_id) = stack.pop() {
        let node = &nodes[node_id];
        if let Some((offset, count)) = node.leaf_range() {
            // Re-check each primitive's own box before handing it out.
            for &id in &ids[offset..offset + count] {
                if test(&aabbs[id.as_usize()]) && primitive_test(id) {
                    return true;
                }
            }
        } else if let Some((first_child, count)) = node.children_range() {
            for child in first_child..first_child + count {
                if test(&nodes[child].aabb) {
                    stack.push(child);
                }
            }
        }
    }
    false
}

//
// Dual-tree search
//

/// Parallel search over node pairs of two sets. `aabb_pair_test` prunes node
/// and primitive box pairs; `primitive_pair_test` must be thread-safe and
/// returns `true` to abort the whole search through a shared flag that
/// sibling tasks observe on their next check. Mod-tree sides expand into the
/// product of their parts. Spawns tasks down to `TreeConfig::default()`'s
/// cutoff depth; use [`search_pair_with_depth`] to override.
pub fn search_pair<S0, S1, I, R, const D: usize, FA, FP>(
    set0: &S0,
    set1: &S1,
    aabb_pair_test: FA,
    primitive_pair_test: FP,
    executor: &Executor,
) -> bool
where
    S0: FormSet<I, R, D> + Sync,
    S1: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) -> bool + Sync,
{
    search_pair_with_depth(
        set0,
        set1,
        aabb_pair_test,
        primitive_pair_test,
        DEFAULT_PARALLEL_DEPTH,
        executor,
    )
}

pub fn search_pair_with_depth<S0, S1, I, R, const D: usize, FA, FP>(
    set0: &S0,
    set1: &S1,
    aabb_pair_test: FA,
    primitive_pair_test: FP,
    parallel_cutoff_depth: usize,
    executor: &Executor,
) -> bool
where
    S0: FormSet<I, R, D> + Sync,
    S1: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) -> bool + Sync,
{
    let abort = AtomicBool::new(false);
    executor.install(|| {
        set0.for_each_part(&mut |part0| {
            set1.for_each_part(&mut |part1| {
                let ctx = DualContext::new(
                    part0,
                    part1,
                    &aabb_pair_test,
                    &primitive_pair_test,
                    &abort,
                    parallel_cutoff_depth,
                );
                ctx.run(false);
                abort.load(Ordering::Relaxed)
            })
        })
    });
    abort.into_inner()
}

/// `search_pair` with a visit-all callback (still thread-safe; accumulate
/// through a [`LocalVector`] or atomics).
pub fn search_pair_all<S0, S1, I, R, const D: usize, FA, FP>(
    set0: &S0,
    set1: &S1,
    aabb_pair_test: FA,
    visit: FP,
    executor: &Executor,
) where
    S0: FormSet<I, R, D> + Sync,
    S1: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) + Sync,
{
    search_pair(
        set0,
        set1,
        aabb_pair_test,
        |id0, id1| {
            visit(id0, id1);
            false
        },
        executor,
    );
}

//
// Self search
//

/// Collision search within one set: visits each unordered primitive pair at
/// most once (never a primitive against itself). Otherwise behaves like
/// [`search_pair`], including the task-spawn cutoff: tasks spawn down to
/// `TreeConfig::default()`'s cutoff depth; use [`search_self_with_depth`] to
/// override.
pub fn search_self<S, I, R, const D: usize, FA, FP>(
    set: &S,
    aabb_pair_test: FA,
    primitive_pair_test: FP,
    executor: &Executor,
) -> bool
where
    S: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) -> bool + Sync,
{
    search_self_with_depth(
        set,
        aabb_pair_test,
        primitive_pair_test,
        DEFAULT_PARALLEL_DEPTH,
        executor,
    )
}

pub fn search_self_with_depth<S, I, R, const D: usize, FA, FP>(
    set: &S,
    aabb_pair_test: FA,
    primitive_pair_test: FP,
    parallel_cutoff_depth: usize,
    executor: &Executor,
) -> bool
where
    S: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) -> bool + Sync,
{
    let abort = AtomicBool::new(false);
    executor.install(|| {
        // Self-pairs of every part, plus the cross product of distinct parts.
        let mut index0 = 0;
        set.for_each_part(&mut |part0| {
            let mut index1 = 0;
            let aborted = set.for_each_part(&mut |part1| {
                let run = match index1.cmp(&index0) {
                    std::cmp::Ordering::Equal => Some(true),
                    std::cmp::Ordering::Greater => Some(false),
                    std::cmp::Ordering::Less => None,
                };
                index1 += 1;
                if let Some(is_self) = run {
                    let ctx = DualContext::new(
                        part0,
                        part1,
                        &aabb_pair_test,
                        &primitive_pair_test,
                        &abort,
                        parallel_cutoff_depth,
                    );
                    ctx.run(is_self);
                }
                abort.load(Ordering::Relaxed)
            });
            index0 += 1;
            aborted
        })
    });
    abort.into_inner()
}

/// `search_self` with a visit-all callback.
pub fn search_self_all<S, I, R, const D: usize, FA, FP>(
    set: &S,
    aabb_pair_test: FA,
    visit: FP,
    executor: &Executor,
) where
    S: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) + Sync,
{
    search_self_all_with_depth(set, aabb_pair_test, visit, DEFAULT_PARALLEL_DEPTH, executor);
}

pub fn search_self_all_with_depth<S, I, R, const D: usize, FA, FP>(
    set: &S,
    aabb_pair_test: FA,
    visit: FP,
    parallel_cutoff_depth: usize,
    executor: &Executor,
) where
    S: FormSet<I, R, D> + Sync,
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) + Sync,
{
    search_self_with_depth(
        set,
        &aabb_pair_test,
        |id0, id1| {
            visit(id0, id1);
            false
        },
        parallel_cutoff_depth,
        executor,
    );
}

struct DualContext<'a, I, R: Real, const D: usize, FA, FP> {
    nodes0: &'a [Node<I, R, D>],
    ids0: &'a [I],
    aabbs0: &'a [Aabb<R, D>],
    t0: Option<Transformation<R, D>>,
    nodes1: &'a [Node<I, R, D>],
    ids1: &'a [I],
    aabbs1: &'a [Aabb<R, D>],
    t1: Option<Transformation<R, D>>,
    aabb_test: &'a FA,
    primitive_test: &'a FP,
    abort: &'a AtomicBool,
    cutoff: usize,
}

impl<'a, I, R, const D: usize, FA, FP> DualContext<'a, I, R, D, FA, FP>
where
    I: TreeIndex,
    R: Real,
    FA: Fn(&Aabb<R, D>, &Aabb<R, D>) -> bool + Sync,
    FP: Fn(I, I) -> bool + Sync,
{
    fn new(
        part0: Form<'a, I, R, D>,
        part1: Form<'a, I, R, D>,
        aabb_test: &'a FA,
        primitive_test: &'a FP,
        abort: &'a AtomicBool,
        cutoff: usize,
    ) -> Self {
        Self {
            nodes0: part0.tree().nodes(),
            ids0: part0.tree().ids(),
            aabbs0: part0.tree().primitive_aabbs(),
            t0: part0.transformation(),
            nodes1: part1.tree().nodes(),
            ids1: part1.tree().ids(),
            aabbs1: part1.tree().primitive_aabbs(),
            t1: part1.transformation(),
            aabb_test,
            primitive_test,
            abort,
            cutoff,
        }
    }

    #[inline]
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    #[inline]
    fn test(&self, aabb0: &Aabb<R, D>, aabb1: &Aabb<R, D>) -> bool {
        let aabb0 = match &self.t0 {
            Some(t) => t.transform_aabb(aabb0),
            None => *aabb0,
        };
        let aabb1 = match &self.t1 {
            Some(t) => t.transform_aabb(aabb1),
            None => *aabb1,
        };
        (self.aabb_test)(&aabb0, &aabb1)
    }

    fn run(&self, is_self: bool) {
        if self.nodes0.is_empty() || self.nodes1.is_empty() {
            return;
        }
        if !is_self && !self.test(&self.nodes0[0].aabb, &self.nodes1[0].aabb) {
            return;
        }
        self.recurse(0, 0, is_self, 0);
    }

    fn leaves(&self, range0: (usize, usize), range1: (usize, usize), is_self: bool) {
        let ids0 = &self.ids0[range0.0..range0.0 + range0.1];
        let ids1 = &self.ids1[range1.0..range1.0 + range1.1];
        for (i0, &id0) in ids0.iter().enumerate() {
            // Within one leaf paired with itself, enumerate the upper
            // triangle so each pair is reported once.
            let start = if is_self { i0 + 1 } else { 0 };
            for &id1 in &ids1[start..] {
                if self.test(&self.aabbs0[id0.as_usize()], &self.aabbs1[id1.as_usize()])
                    && (self.primitive_test)(id0, id1)
                {
                    self.abort.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    fn recurse(&self, id0: usize, id1: usize, is_self: bool, depth: usize) {
        if self.aborted() {
            return;
        }
        let node0 = &self.nodes0[id0];
        let node1 = &self.nodes1[id1];
        if let (Some(range0), Some(range1)) = (node0.leaf_range(), node1.leaf_range()) {
            self.leaves(range0, range1, is_self && id0 == id1);
        } else {
            // At least one side is inner; expand into candidate pairs.
            let mut pairs: SmallVec<[(usize, usize); 16]> = SmallVec::new();
            match (node0.children_range(), node1.children_range()) {
                (Some((first0, count0)), Some((first1, count1))) => {
                    if is_self && id0 == id1 {
                        // Child pairs of a self-pair: unordered, including
                        // each child with itself.
                        for a in first0..first0 + count0 {
                            for b in a..first1 + count1 {
                                if a == b || self.test(&self.nodes0[a].aabb, &self.nodes1[b].aabb) {
                                    pairs.push((a, b));
                                }
                            }
                        }
                    } else {
                        for a in first0..first0 + count0 {
                            for b in first1..first1 + count1 {
                                if self.test(&self.nodes0[a].aabb, &self.nodes1[b].aabb) {
                                    pairs.push((a, b));
                                }
                            }
                        }
                    }
                }
                (None, Some((first1, count1))) => {
                    for b in first1..first1 + count1 {
                        if self.test(&node0.aabb, &self.nodes1[b].aabb) {
                            pairs.push((id0, b));
                        }
                    }
                }
                (Some((first0, count0)), None) => {
                    for a in first0..first0 + count0 {
                        if self.test(&self.nodes0[a].aabb, &node1.aabb) {
                            pairs.push((a, id1));
                        }
                    }
                }
                (None, None) => unreachable!("leaf pair handled above"),
            }

            if depth < self.cutoff {
                rayon::scope(|scope| {
                    for (a, b) in pairs {
                        if self.aborted() {
                            break;
                        }
                        scope.spawn(move |_| self.recurse(a, b, is_self, depth + 1));
                    }
                });
            } else {
                for (a, b) in pairs {
                    if self.aborted() {
                        break;
                    }
                    self.recurse(a, b, is_self, depth + 1);
                }
            }
        }
    }
}
