//! Sorted set difference over id lists.

use std::cmp::Ordering;

/// Three-way split of two id sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDiff<T> {
    /// Present only on the left side.
    pub left: Vec<T>,
    /// Present on both sides.
    pub both: Vec<T>,
    /// Present only on the right side.
    pub right: Vec<T>,
}

/// Walk two ascending slices in lockstep and split them into left-only,
/// shared and right-only items. Each output keeps ascending order.
///
/// Both inputs must already be sorted; use [`diff_unsorted`] otherwise.
pub fn diff_sorted<T: Ord + Clone>(left: &[T], right: &[T]) -> SetDiff<T> {
    let mut out = SetDiff {
        left: Vec::new(),
        both: Vec::new(),
        right: Vec::new(),
    };
    let (mut li, mut ri) = (0, 0);

    while li < left.len() || ri < right.len() {
        if ri >= right.len() {
            out.left.push(left[li].clone());
            li += 1;
        } else if li >= left.len() {
            out.right.push(right[ri].clone());
            ri += 1;
        } else {
            match left[li].cmp(&right[ri]) {
                Ordering::Less => {
                    out.left.push(left[li].clone());
                    li += 1;
                }
                Ordering::Greater => {
                    out.right.push(right[ri].clone());
                    ri += 1;
                }
                Ordering::Equal => {
                    out.both.push(left[li].clone());
                    li += 1;
                    ri += 1;
                }
            }
        }
    }
    out
}

/// Sort copies of both inputs, then [`diff_sorted`].
pub fn diff_unsorted<T: Ord + Clone>(left: &[T], right: &[T]) -> SetDiff<T> {
    let mut left = left.to_vec();
    let mut right = right.to_vec();
    left.sort();
    right.sort();
    diff_sorted(&left, &right)
}
