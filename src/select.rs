use super::*;

use std::cmp::Ordering;

use rand::Rng;

/// Selection algorithm used to split primitive ids during tree build. Every
/// strategy obeys the nth-element contract: after
/// `strategy.partition(items, nth, compare)`, no element of `items[..nth]`
/// compares greater than any element of `items[nth..]`, and `items[nth]` is
/// the element that would land there under a full sort. Tie-breaking and the
/// order within the two sides are unspecified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// Classical nth-element (`slice::select_nth_unstable_by`); the default.
    #[default]
    NthElement,
    /// Floyd-Rivest selection with sample-based window narrowing.
    FloydRivest,
    /// Pattern-defeating quickselect: median-of-3 pivots with a
    /// worst-case-linear fallback once progress degrades.
    Pdq,
    /// Worst-case linear median-of-medians (groups of five).
    MedianOfMedians,
    /// Quickselect steered by the ninther (median of three medians-of-3).
    MedianOfNinthers,
    /// Quickselect with a randomized median-of-3 pivot.
    MedianOf3Random,
    /// Partial heap-based selection.
    HeapSelect,
}

impl PartitionStrategy {
    /// Panics when `nth >= items.len()`, matching the std contract.
    pub fn partition<T, F>(self, items: &mut [T], nth: usize, mut compare: F)
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        assert!(nth < items.len(), "partition index out of bounds");
        if items.len() < 2 {
            return;
        }
        if let Self::NthElement = self {
            items.select_nth_unstable_by(nth, compare);
            return;
        }
        let mut is_less = |a: &T, b: &T| compare(a, b) == Ordering::Less;
        match self {
            Self::NthElement => unreachable!(),
            Self::FloydRivest => {
                let end = items.len() - 1;
                floyd_rivest(items, 0, end, nth, &mut is_less);
            }
            Self::Pdq => pdq_select(items, nth, &mut is_less),
            Self::MedianOfMedians => median_of_medians(items, nth, &mut is_less),
            Self::MedianOfNinthers => median_of_ninthers(items, nth, &mut is_less),
            Self::MedianOf3Random => median_of_3_random(items, nth, &mut is_less),
            Self::HeapSelect => heap_select(items, nth, &mut is_less),
        }
    }
}

fn insertion_sort<T, F>(v: &mut [T], is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    for i in 1..v.len() {
        let mut j = i;
        while j > 0 && is_less(&v[j], &v[j - 1]) {
            v.swap(j, j - 1);
            j -= 1;
        }
    }
}

/// Index of the median of `v[a]`, `v[b]`, `v[c]`.
fn median3_index<T, F>(v: &[T], a: usize, b: usize, c: usize, is_less: &mut F) -> usize
where
    F: FnMut(&T, &T) -> bool,
{
    if is_less(&v[a], &v[b]) {
        if is_less(&v[b], &v[c]) {
            b
        } else if is_less(&v[a], &v[c]) {
            c
        } else {
            a
        }
    } else if is_less(&v[a], &v[c]) {
        a
    } else if is_less(&v[b], &v[c]) {
        c
    } else {
        b
    }
}

/// Three-way partition around the element at `pivot`. Returns `(lt, gt)` with
/// `v[..lt]` less than the pivot, `v[lt..gt]` equal, `v[gt..]` greater. The
/// equal band keeps duplicate-heavy inputs from degrading to quadratic.
fn partition3<T, F>(v: &mut [T], pivot: usize, is_less: &mut F) -> (usize, usize)
where
    F: FnMut(&T, &T) -> bool,
{
    v.swap(0, pivot);
    let mut lt = 0;
    let mut i = 1;
    let mut gt = v.len();
    while i < gt {
        if is_less(&v[i], &v[lt]) {
            v.swap(i, lt);
            lt += 1;
            i += 1;
        } else if is_less(&v[lt], &v[i]) {
            gt -= 1;
            v.swap(i, gt);
        } else {
            i += 1;
        }
    }
    (lt, gt)
}

/// Floyd-Rivest over the inclusive window `[begin, end]`.
fn floyd_rivest<T, F>(v: &mut [T], mut begin: usize, mut end: usize, nth: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    while begin < end {
        if end - begin > 600 {
            // Narrow to a sampled window that contains the nth element with
            // high probability, then pivot on it.
            let n = (end - begin + 1) as f64;
            let i = (nth - begin + 1) as f64;
            let z = n.ln();
            let s = 0.5 * (2.0 * z / 3.0).exp();
            let sd = 0.5 * (z * s * (n - s) / n).sqrt() * (i - n / 2.0).signum();
            let new_begin = ((nth as f64 - i * s / n + sd).max(begin as f64)) as usize;
            let new_end = ((nth as f64 + (n - i) * s / n + sd).min(end as f64)) as usize;
            floyd_rivest(v, new_begin, new_end, nth, is_less);
        }
        let (lt, gt) = partition3(&mut v[begin..=end], nth - begin, is_less);
        let (lt, gt) = (begin + lt, begin + gt);
        if nth < lt {
            end = lt - 1;
        } else if nth >= gt {
            begin = gt;
        } else {
            return;
        }
    }
}

fn pdq_select<T, F>(v: &mut [T], nth: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    let mut begin = 0;
    let mut end = v.len();
    let mut limit = usize::BITS - v.len().leading_zeros();
    loop {
        let len = end - begin;
        if len <= 24 {
            insertion_sort(&mut v[begin..end], is_less);
            return;
        }
        if limit == 0 {
            // Adversarial pattern; switch to the worst-case-linear select.
            median_of_medians(&mut v[begin..end], nth - begin, is_less);
            return;
        }
        let pivot = median3_index(v, begin, begin + len / 2, end - 1, is_less);
        let (lt, gt) = partition3(&mut v[begin..end], pivot - begin, is_less);
        let (lt, gt) = (begin + lt, begin + gt);
        if lt - begin > len * 3 / 4 || end - gt > len * 3 / 4 {
            limit -= 1;
        }
        if nth < lt {
            end = lt;
        } else if nth >= gt {
            begin = gt;
        } else {
            return;
        }
    }
}

fn median_of_medians<T, F>(v: &mut [T], nth: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    let mut begin = 0;
    let mut end = v.len();
    loop {
        let len = end - begin;
        if len <= 16 {
            insertion_sort(&mut v[begin..end], is_less);
            return;
        }
        // Sort groups of five and gather their medians at the window front.
        let groups = len / 5;
        for g in 0..groups {
            let gb = begin + g * 5;
            insertion_sort(&mut v[gb..gb + 5], is_less);
            v.swap(begin + g, gb + 2);
        }
        median_of_medians(&mut v[begin..begin + groups], groups / 2, is_less);
        let (lt, gt) = partition3(&mut v[begin..end], groups / 2, is_less);
        let (lt, gt) = (begin + lt, begin + gt);
        if nth < lt {
            end = lt;
        } else if nth >= gt {
            begin = gt;
        } else {
            return;
        }
    }
}

fn median_of_ninthers<T, F>(v: &mut [T], nth: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    let mut begin = 0;
    let mut end = v.len();
    loop {
        let len = end - begin;
        if len <= 16 {
            insertion_sort(&mut v[begin..end], is_less);
            return;
        }
        // Ninther of nine evenly spaced samples.
        let at = |k: usize| begin + k * (len - 1) / 8;
        let a = median3_index(v, at(0), at(1), at(2), is_less);
        let b = median3_index(v, at(3), at(4), at(5), is_less);
        let c = median3_index(v, at(6), at(7), at(8), is_less);
        let pivot = median3_index(v, a, b, c, is_less);
        let (lt, gt) = partition3(&mut v[begin..end], pivot - begin, is_less);
        let (lt, gt) = (begin + lt, begin + gt);
        if nth < lt {
            end = lt;
        } else if nth >= gt {
            begin = gt;
        } else {
            return;
        }
    }
}

fn median_of_3_random<T, F>(v: &mut [T], nth: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    let mut rng = rand::thread_rng();
    let mut begin = 0;
    let mut end = v.len();
    loop {
        let len = end - begin;
        if len <= 16 {
            insertion_sort(&mut v[begin..end], is_less);
            return;
        }
        let a = begin + rng.gen_range(0..len);
        let b = begin + rng.gen_range(0..len);
        let c = begin + rng.gen_range(0..len);
        let pivot = median3_index(v, a, b, c, is_less);
        let (lt, gt) = partition3(&mut v[begin..end], pivot - begin, is_less);
        let (lt, gt) = (begin + lt, begin + gt);
        if nth < lt {
            end = lt;
        } else if nth >= gt {
            begin = gt;
        } else {
            return;
        }
    }
}

fn heap_select<T, F>(v: &mut [T], nth: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    // Max-heap over v[..=nth] holding the nth+1 smallest seen so far.
    let heap_len = nth + 1;
    for i in (0..heap_len / 2).rev() {
        sift_down(&mut v[..heap_len], i, is_less);
    }
    for j in heap_len..v.len() {
        if is_less(&v[j], &v[0]) {
            v.swap(j, 0);
            sift_down(&mut v[..heap_len], 0, is_less);
        }
    }
    // Heap top is the nth smallest; everything below it stays in front.
    v.swap(0, nth);
}

fn sift_down<T, F>(heap: &mut [T], mut i: usize, is_less: &mut F)
where
    F: FnMut(&T, &T) -> bool,
{
    loop {
        let left = 2 * i + 1;
        let right = 2 * i + 2;
        let mut largest = i;
        if left < heap.len() && is_less(&heap[largest], &heap[left]) {
            largest = left;
        }
        if right < heap.len() && is_less(&heap[largest], &heap[right]) {
            largest = right;
        }
        if largest == i {
            return;
        }
        heap.swap(i, largest);
        i = largest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    const STRATEGIES: [PartitionStrategy; 7] = [
        PartitionStrategy::NthElement,
        PartitionStrategy::FloydRivest,
        PartitionStrategy::Pdq,
        PartitionStrategy::MedianOfMedians,
        PartitionStrategy::MedianOfNinthers,
        PartitionStrategy::MedianOf3Random,
        PartitionStrategy::HeapSelect,
    ];

    fn check_contract(strategy: PartitionStrategy, mut values: Vec<u32>, nth: usize) {
        let mut sorted = values.clone();
        sorted.sort_unstable();
        strategy.partition(&mut values, nth, u32::cmp);
        assert_eq!(values[nth], sorted[nth], "{strategy:?} misplaced the nth");
        let (left, right) = values.split_at(nth);
        let left_max = left.iter().max().copied().unwrap_or(0);
        let right_min = right.iter().min().copied().unwrap();
        assert!(left_max <= right_min, "{strategy:?} violated the contract");
        values.sort_unstable();
        assert_eq!(values, sorted, "{strategy:?} lost elements");
    }

    #[test]
    fn test_partition_contract() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        for strategy in STRATEGIES {
            for len in [1_usize, 2, 5, 17, 100, 1000, 5000] {
                let values = (0..len)
                    .map(|_| rng.gen_range(0..100_u32))
                    .collect::<Vec<_>>();
                for nth in [0, len / 3, len / 2, len - 1] {
                    check_contract(strategy, values.clone(), nth);
                }
            }
        }
    }

    #[test]
    fn test_partition_patterns() {
        for strategy in STRATEGIES {
            let ascending = (0..2000_u32).collect::<Vec<_>>();
            check_contract(strategy, ascending.clone(), 700);
            let descending = ascending.iter().rev().copied().collect::<Vec<_>>();
            check_contract(strategy, descending, 700);
            let equal = vec![42_u32; 2000];
            check_contract(strategy, equal, 700);
        }
    }
}
