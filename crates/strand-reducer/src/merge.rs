//! Folding one reducer map into another at a sync.
//!
//! When two strands join, the map of the serially later strand (`right`) is
//! combined with the map of the earlier one (`left`). Reducers present in
//! only one map migrate without any callback. Reducers present in both are
//! reduced exactly once, always as `reduce(left_view, right_view)`, whichever
//! map survives. Reduce callbacks run user code that may migrate the strand
//! to another worker, so the merge hands back the worker it finished on.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::error::ReducerBug;
use crate::fatal::{fatal, rt_assert};
use crate::hyperobject::HyperobjectBase;
use crate::map::{Elem, ViewStorage};
use crate::worker::{current_worker, Worker};

/// How views colliding on the same reducer are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// The maps must be disjoint; a collision is a race.
    Unordered,
    /// `this` is the left map.
    IntoLeft,
    /// `this` is the right map.
    IntoRight,
}

/// Folds `other` into `this` and destroys `other`.
///
/// Returns the worker the caller is running on once every reduce callback
/// has returned. Views consumed by a reduce are still owned by `other` and
/// are released with it.
pub fn merge<S: ViewStorage>(this: &mut S, mut w: Arc<Worker>, mut other: Box<S>, kind: MergeKind) -> Arc<Worker> {
    this.set_merging(true);
    other.set_merging(true);
    rt_assert!(Some(&*w), !other.is_leftmost(), ReducerBug::LeftmostMerge);
    log::debug!(
        "worker {}: merging {} views into {} ({:?})",
        w.id(),
        other.len(),
        this.len(),
        kind
    );

    let this_leftmost = this.is_leftmost();
    other.for_each_mut(&mut |other_el: &mut Elem| {
        let (Some(key), Some(hb_ptr), Some(other_view)) = (other_el.key, other_el.hb, other_el.view) else {
            return;
        };
        // SAFETY: descriptors outlive every element that refers to them.
        let hb: &HyperobjectBase = unsafe { hb_ptr.as_ref() };

        let mut found = this.find(key, hb);
        if found.is_none() && this_leftmost {
            // The leftmost map always holds the reducer's own view; put it
            // back so the incoming view is folded into it.
            let leftmost = key.leftmost_view();
            if leftmost != other_view {
                found = Some(this.insert(Some(&*w), Elem::new(key, hb_ptr, leftmost)));
            }
        }

        let Some(slot) = found else {
            this.insert(Some(&*w), *other_el);
            other_el.view = None;
            return;
        };

        let this_el = this.elem_mut(slot);
        let Some(this_view) = this_el.view else {
            fatal(Some(&*w), ReducerBug::MapCorrupted("element without a view"));
        };
        let (left, right, exchange): (NonNull<u8>, NonNull<u8>, bool) = match kind {
            MergeKind::Unordered => fatal(Some(&*w), ReducerBug::ReducerRace),
            MergeKind::IntoLeft => (this_view, other_view, false),
            // The leftmost view never leaves its element: reduce into the
            // left view, then trade contents with the leftmost view.
            MergeKind::IntoRight if this_el.is_leftmost() => (other_view, this_view, true),
            MergeKind::IntoRight => {
                this_el.view = Some(other_view);
                other_el.view = Some(this_view);
                (other_view, this_view, false)
            }
        };

        // SAFETY: both views are live and belong to this merge.
        unsafe { hb.reduce(left, right) };
        if exchange {
            // SAFETY: distinct live views of `view_size` bytes; swapping moves
            // each value without dropping either.
            unsafe { ptr::swap_nonoverlapping(left.as_ptr(), right.as_ptr(), hb.view_size()) };
        }
        w = current_worker().unwrap_or_else(|| Arc::clone(&w));
    });

    this.set_leftmost(this_leftmost || other.is_leftmost());
    this.set_merging(false);
    other.set_merging(false);
    other.destroy(Some(&*w));
    w
}

/// Combines the maps of two joining strands, `left` being serially earlier.
///
/// A missing side yields the other unchanged. Otherwise the leftmost map
/// survives if there is one, else the larger map, and the result is returned.
/// `w` is updated to the worker the merge finished on.
pub fn merge_two_maps<S: ViewStorage>(
    w: &mut Arc<Worker>,
    left: Option<Box<S>>,
    right: Option<Box<S>>,
) -> Option<Box<S>> {
    let (mut left, mut right) = match (left, right) {
        (None, right) => return right,
        (left, None) => return left,
        (Some(left), Some(right)) => (left, right),
    };

    let into_left = if left.is_leftmost() {
        true
    } else if right.is_leftmost() {
        false
    } else {
        left.len() > right.len()
    };

    if into_left {
        *w = merge(&mut *left, Arc::clone(w), right, MergeKind::IntoLeft);
        Some(left)
    } else {
        *w = merge(&mut *right, Arc::clone(w), left, MergeKind::IntoRight);
        Some(right)
    }
}
