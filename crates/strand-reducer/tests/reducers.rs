use std::sync::Arc;

use strand_alloc::MemTag;
use strand_reducer::{
    hyper_lookup, install_new_reducer_map, merge_two_maps, set_leftmost_reducer_map, Monoid, Options,
    Reducer, ReducerMap, Runtime, ViewStorage,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn runtime(nworkers: usize) -> Runtime {
    init_logging();
    Runtime::new(Options {
        nworkers,
        force_reduce: false,
    })
    .unwrap()
}

struct Add;

impl Monoid for Add {
    type View = u64;

    fn identity(&self) -> u64 {
        0
    }

    fn reduce(&self, left: &mut u64, right: &mut u64) {
        *left += *right;
    }
}

struct Append;

impl Monoid for Append {
    type View = Vec<&'static str>;

    fn identity(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn reduce(&self, left: &mut Vec<&'static str>, right: &mut Vec<&'static str>) {
        left.append(right);
    }
}

#[test]
fn test_outside_a_parallel_region_views_are_leftmost() {
    let total = Reducer::new(Add, 1);
    total.update(|v| *v += 1);
    assert_eq!(hyper_lookup(total.base()), total.base().key().leftmost_view());
    assert_eq!(total.into_value(), 2);
}

#[test]
fn test_strands_on_two_workers_sum_up() {
    let rt = runtime(2);
    let mut total = Reducer::new(Add, 0);

    let parent = {
        let mut guard = rt.enter(0).unwrap();
        total.register_in(&guard);
        total.update_in(&guard, |v| *v += 1);
        guard.take_reducer_map()
    };

    let children: Vec<Option<Box<ReducerMap>>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|id| {
                let rt = &rt;
                let total = &total;
                s.spawn(move || {
                    let mut guard = rt.enter(id).unwrap();
                    for i in 1..=100 {
                        total.update_in(&guard, |v| *v += i);
                    }
                    guard.take_reducer_map()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut guard = rt.enter(0).unwrap();
    let mut w = Arc::clone(guard.worker());
    let merged = children
        .into_iter()
        .fold(parent, |acc, child| merge_two_maps(&mut w, acc, child));
    guard.set_reducer_map(merged);
    total.unregister_in(&guard);
    drop(guard);

    assert_eq!(*total.as_mut().leftmost_mut(), 1 + 2 * 5050);
    assert_eq!(rt.outstanding(MemTag::ReducerView), 0);
}

/// Runs one strand per word, each in a fresh map, and returns the maps.
fn strands(rt: &Runtime, list: &Reducer<Append>, words: &[&'static str]) -> Vec<Option<Box<ReducerMap>>> {
    let mut guard = rt.enter(0).unwrap();
    words
        .iter()
        .map(|&word| {
            list.update_in(&guard, |v| v.push(word));
            guard.take_reducer_map()
        })
        .collect()
}

#[test]
fn test_merge_order_does_not_depend_on_tree_shape() {
    let words = ["a", "b", "c", "d", "e"];
    let mut results = Vec::new();

    for shape in 0..2 {
        let rt = runtime(1);
        let mut list = Reducer::new(Append, Vec::new());
        // The registration map goes first: it holds the leftmost view.
        let registered = {
            let mut guard = rt.enter(0).unwrap();
            list.register_in(&guard);
            guard.take_reducer_map()
        };
        let mut maps = strands(&rt, &list, &words).into_iter();
        let mut guard = rt.enter(0).unwrap();
        let mut w = Arc::clone(guard.worker());
        let mut next = || maps.next().flatten();

        let merged = if shape == 0 {
            // ((((r a) b) c) d) e
            let mut acc = registered;
            for _ in 0..words.len() {
                let map = next();
                acc = merge_two_maps(&mut w, acc, map);
            }
            acc
        } else {
            // (r a) ((b c) (d e))
            let ra = {
                let a = next();
                merge_two_maps(&mut w, registered, a)
            };
            let bc = {
                let (b, c) = (next(), next());
                merge_two_maps(&mut w, b, c)
            };
            let de = {
                let (d, e) = (next(), next());
                merge_two_maps(&mut w, d, e)
            };
            let bcde = merge_two_maps(&mut w, bc, de);
            merge_two_maps(&mut w, ra, bcde)
        };

        guard.set_reducer_map(merged);
        list.unregister_in(&guard);
        drop(guard);
        assert_eq!(rt.outstanding(MemTag::ReducerView), 0);
        results.push(std::mem::take(list.as_mut().leftmost_mut()));
    }

    assert_eq!(results[0], words);
    assert_eq!(results[1], words);
}

#[test]
fn test_many_reducers_fold_into_the_leftmost_map() {
    let rt = runtime(1);
    let mut counters: Vec<_> = (0..50).map(|i| Reducer::new(Add, i)).collect();

    let mut guard = rt.enter(0).unwrap();
    let leftmost = install_new_reducer_map(&mut guard);
    set_leftmost_reducer_map(leftmost, true);
    for c in &counters {
        c.register_in(&guard);
    }
    let leftmost = guard.take_reducer_map();

    // A child strand touches every reducer once.
    for c in &counters {
        c.update_in(&guard, |v| *v += 1000);
    }
    let child = guard.take_reducer_map();
    assert_eq!(child.as_ref().map(|m| m.len()), Some(50));
    assert!(rt.outstanding(MemTag::ReducerView) > 0);

    let mut w = Arc::clone(guard.worker());
    let merged = merge_two_maps(&mut w, leftmost, child);
    assert!(merged.as_ref().is_some_and(|m| m.is_leftmost() && m.len() == 50));
    guard.set_reducer_map(merged);

    for c in &counters {
        c.unregister_in(&guard);
    }
    assert!(guard.reducer_map().is_some_and(|m| m.is_empty()));
    drop(guard);

    for (i, c) in counters.iter_mut().enumerate() {
        assert_eq!(*c.as_mut().leftmost_mut(), i as u64 + 1000);
    }
    assert_eq!(rt.outstanding(MemTag::ReducerView), 0);
}
