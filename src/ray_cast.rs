use super::*;

use smallvec::SmallVec;

/// Best hit of a tree ray cast.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TreeRayHit<I, R: Real> {
    pub id: I,
    pub t: R,
}

/// Casts a ray through the tree and returns the hit with the smallest `t`
/// inside `[config.min_t, config.max_t]`, or `None`. `hit_fn` performs the
/// exact ray/primitive intersection and reports the hit parameter.
///
/// The traversal carries a shrinking upper bound equal to the best hit so
/// far: node boxes are slab-tested against `[min_t, best_t]`, and children
/// are visited near side first along the node's split axis so the bound
/// tightens as early as possible. Single-threaded by design.
pub fn ray_cast<I, R, const D: usize, F>(
    tree: &Tree<I, R, D>,
    ray: &Ray<R, D>,
    config: &RayConfig<R>,
    mut hit_fn: F,
) -> Option<TreeRayHit<I, R>>
where
    I: TreeIndex,
    R: Real,
    F: FnMut(&Ray<R, D>, I) -> Option<R>,
{
    if tree.is_empty() {
        return None;
    }
    let nodes = tree.nodes();
    let ids = tree.ids();

    let mut inv_dir = Vector::<R, D>::zeros();
    let mut dir_negative = [false; D];
    for i in 0..D {
        dir_negative[i] = ray.direction[i] < R::zero();
        inv_dir[i] = epsilon_inverse(ray.direction[i]);
    }

    let mut best = None;
    let mut max_t = config.max_t;
    let mut stack: SmallVec<[usize; 64]> = SmallVec::new();
    stack.push(0);
    while let Some(node_id) = stack.pop() {
        let node = &nodes[node_id];
        if !ray_aabb_hit(ray, &inv_dir, &node.aabb, config.min_t, max_t) {
            continue;
        }
        match node.kind {
            NodeKind::Leaf { .. } => {
                let (offset, count) = node.leaf_range().expect("leaf kind");
                for &id in &ids[offset..offset + count] {
                    if let Some(t) = hit_fn(ray, id) {
                        if t >= config.min_t && t <= max_t {
                            max_t = t;
                            best = Some(TreeRayHit { id, t });
                        }
                    }
                }
            }
            NodeKind::Inner { axis, .. } => {
                let (first_child, count) = node.children_range().expect("inner kind");
                // Children sit in ascending order along the split axis; push
                // the near side last so it pops first.
                if dir_negative[axis as usize] {
                    for child in first_child..first_child + count {
                        stack.push(child);
                    }
                } else {
                    for child in (first_child..first_child + count).rev() {
                        stack.push(child);
                    }
                }
            }
            NodeKind::Empty => {}
        }
    }
    best
}

/// [`ray_cast`] against a form or mod-tree. The ray is given in query space;
/// each part maps it through its frame's inverse (affine, so the `t`
/// parameterization is preserved) and `hit_fn` receives the tree-space ray
/// to intersect against untransformed primitives.
pub fn ray_cast_form<S, I, R, const D: usize, F>(
    set: &S,
    ray: &Ray<R, D>,
    config: &RayConfig<R>,
    mut hit_fn: F,
) -> Option<TreeRayHit<I, R>>
where
    S: FormSet<I, R, D>,
    I: TreeIndex,
    R: Real,
    F: FnMut(&Ray<R, D>, I) -> Option<R>,
{
    let mut best: Option<TreeRayHit<I, R>> = None;
    let mut max_t = config.max_t;
    set.for_each_part(&mut |part| {
        let local_ray = match part.inverse_transformation() {
            Some(inverse) => Ray::new(
                inverse.transform_point(&ray.origin),
                inverse.transform_vector(&ray.direction),
            ),
            None => *ray,
        };
        let bounded = RayConfig::new(config.min_t, max_t);
        if let Some(hit) = ray_cast(part.tree(), &local_ray, &bounded, |r, id| hit_fn(r, id)) {
            max_t = hit.t;
            best = Some(hit);
        }
        false
    });
    best
}

/// Slab test against `[t_min, t_max]`. `inv_dir` comes from
/// `epsilon_inverse`, so axes with a zero direction component degenerate to
/// an origin-inside-slab test.
fn ray_aabb_hit<R: Real, const D: usize>(
    ray: &Ray<R, D>,
    inv_dir: &Vector<R, D>,
    aabb: &Aabb<R, D>,
    mut t_min: R,
    mut t_max: R,
) -> bool {
    let two = R::one() + R::one();
    for i in 0..D {
        let mut near = aabb.min[i];
        let mut far = aabb.max[i];
        if inv_dir[i] < R::zero() {
            std::mem::swap(&mut near, &mut far);
        }
        let t0 = (near - ray.origin[i]) * inv_dir[i];
        let t1 = (far - ray.origin[i])
            * inv_dir[i]
            * (R::one() + two * <R as num::Float>::epsilon());
        t_min = rmax(t0, t_min);
        t_max = rmin(t1, t_max);
    }
    t_min <= t_max
}
