//! Criterion benches for the hot deque operations.
//!
//! Run with: `cargo bench -p basalt-deque`

use basalt_deque::{DequePool, PopResult, StealResult, bytes_for_pool};
use basalt_mmap::Segment;
use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;

fn fresh_pool(capacity: u32) -> DequePool {
    let seg = Arc::new(Segment::anon(bytes_for_pool(1, capacity)).unwrap());
    DequePool::create(seg, 1, capacity).unwrap()
}

fn bench_push_pop(c: &mut Criterion) {
    let pool = fresh_pool(1024);
    let mut owner = pool.owner(0).unwrap();

    c.bench_function("owner_push_pop_pair", |b| {
        b.iter(|| {
            owner.push(std::hint::black_box(42));
            match owner.pop() {
                PopResult::Task(id) => std::hint::black_box(id),
                PopResult::Empty => unreachable!("just pushed"),
            }
        })
    });
}

fn bench_steal_uncontended(c: &mut Criterion) {
    let pool = fresh_pool(1024);
    let mut owner = pool.owner(0).unwrap();
    let thief = pool.thief(0).unwrap();

    c.bench_function("thief_steal_uncontended", |b| {
        b.iter(|| {
            owner.push(7);
            match thief.steal() {
                StealResult::Task(id) => std::hint::black_box(id),
                _ => unreachable!("just pushed"),
            }
        })
    });
}

criterion_group!(benches, bench_push_pop, bench_steal_uncontended);
criterion_main!(benches);
