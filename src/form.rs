use super::*;

/// A tree bound to a frame so queries run in a moving reference frame without
/// copying geometry. Non-owning; the identity case is modeled by the absence
/// of a frame, which costs no matrix work during traversal. Turning a
/// primitive id back into a geometric object stays with the caller: query
/// callbacks receive ids and close over their own storage.
#[derive(Clone, Copy)]
pub struct Form<'a, I, R: Real, const D: usize> {
    tree: &'a Tree<I, R, D>,
    frame: Option<&'a Frame<R, D>>,
}

impl<'a, I: TreeIndex, R: Real, const D: usize> Form<'a, I, R, D> {
    pub fn new(tree: &'a Tree<I, R, D>, frame: &'a Frame<R, D>) -> Self {
        Self {
            tree,
            frame: Some(frame),
        }
    }

    pub fn untransformed(tree: &'a Tree<I, R, D>) -> Self {
        Self { tree, frame: None }
    }

    #[inline]
    pub fn tree(&self) -> &'a Tree<I, R, D> {
        self.tree
    }

    #[inline]
    pub fn frame(&self) -> Option<&'a Frame<R, D>> {
        self.frame
    }

    /// Snapshot of the forward map, `None` for the identity.
    #[inline]
    pub fn transformation(&self) -> Option<Transformation<R, D>> {
        self.frame.map(|frame| *frame.transformation())
    }

    /// Snapshot of the inverse map, `None` for the identity.
    #[inline]
    pub fn inverse_transformation(&self) -> Option<Transformation<R, D>> {
        self.frame.map(Frame::inverse_transformation)
    }
}

/// A mod-tree bound to a frame. Decomposes into a main and a delta [`Form`]
/// sharing the frame.
#[derive(Clone, Copy)]
pub struct ModForm<'a, I, R: Real, const D: usize> {
    tree: &'a ModTree<I, R, D>,
    frame: Option<&'a Frame<R, D>>,
}

impl<'a, I: TreeIndex, R: Real, const D: usize> ModForm<'a, I, R, D> {
    pub fn new(tree: &'a ModTree<I, R, D>, frame: &'a Frame<R, D>) -> Self {
        Self {
            tree,
            frame: Some(frame),
        }
    }

    pub fn untransformed(tree: &'a ModTree<I, R, D>) -> Self {
        Self { tree, frame: None }
    }

    #[inline]
    pub fn tree(&self) -> &'a ModTree<I, R, D> {
        self.tree
    }

    #[inline]
    pub fn main_form(&self) -> Form<'a, I, R, D> {
        Form {
            tree: self.tree.main_tree(),
            frame: self.frame,
        }
    }

    #[inline]
    pub fn delta_form(&self) -> Form<'a, I, R, D> {
        Form {
            tree: self.tree.delta_tree(),
            frame: self.frame,
        }
    }
}

/// Uniform decomposition of plain and mod trees (with or without frames)
/// into the forms a traversal actually visits. Searches against a mod tree
/// become searches against its main and delta parts; dual searches take the
/// product of the parts of both sides.
pub trait FormSet<I: TreeIndex, R: Real, const D: usize> {
    /// Calls `f` for every part until one returns `true`; reports whether
    /// any did.
    fn for_each_part(&self, f: &mut dyn FnMut(Form<'_, I, R, D>) -> bool) -> bool;
}

impl<I: TreeIndex, R: Real, const D: usize> FormSet<I, R, D> for Form<'_, I, R, D> {
    fn for_each_part(&self, f: &mut dyn FnMut(Form<'_, I, R, D>) -> bool) -> bool {
        f(*self)
    }
}

impl<I: TreeIndex, R: Real, const D: usize> FormSet<I, R, D> for ModForm<'_, I, R, D> {
    fn for_each_part(&self, f: &mut dyn FnMut(Form<'_, I, R, D>) -> bool) -> bool {
        f(self.main_form()) || f(self.delta_form())
    }
}

impl<I: TreeIndex, R: Real, const D: usize> FormSet<I, R, D> for Tree<I, R, D> {
    fn for_each_part(&self, f: &mut dyn FnMut(Form<'_, I, R, D>) -> bool) -> bool {
        f(Form::untransformed(self))
    }
}

impl<I: TreeIndex, R: Real, const D: usize> FormSet<I, R, D> for ModTree<I, R, D> {
    fn for_each_part(&self, f: &mut dyn FnMut(Form<'_, I, R, D>) -> bool) -> bool {
        f(Form::untransformed(self.main_tree())) || f(Form::untransformed(self.delta_tree()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::test_support::{cloud, point_tree};

    #[test]
    fn test_parts() {
        let points = cloud(50, 11);
        let tree = point_tree(&points, &TreeConfig::default());
        let frame = Frame::new(Transformation::from_translation(Vector::from([
            1.0, 0.0, 0.0,
        ])));

        let form = Form::new(&tree, &frame);
        let mut count = 0;
        form.for_each_part(&mut |part| {
            assert!(part.transformation().is_some());
            count += 1;
            false
        });
        assert_eq!(count, 1);

        let mut mod_tree = ModTree::<i32, f32, 3>::new();
        mod_tree.build(
            &points,
            Aabb::from_point,
            &TreeConfig::default(),
            PartitionStrategy::default(),
            &Executor::default(),
        );
        let mod_form = ModForm::new(&mod_tree, &frame);
        let mut count = 0;
        mod_form.for_each_part(&mut |_| {
            count += 1;
            false
        });
        assert_eq!(count, 2);
        assert!(std::ptr::eq(
            mod_form.main_form().tree(),
            mod_tree.main_tree()
        ));
    }

    #[test]
    fn test_untransformed_form_has_no_frame() {
        let tree = point_tree(&cloud(10, 12), &TreeConfig::default());
        let form = Form::untransformed(&tree);
        assert!(form.transformation().is_none());
        assert!(form.inverse_transformation().is_none());
    }
}
