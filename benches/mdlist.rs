//! Benchmarks for [`MdList`] using Divan.
//!
//! Run with: `cargo bench --bench mdlist`


use divan::{black_box, Bencher};
use mdlist::MdList;

fn main() {
    divan::main();
}

const DIM: u32 = 8;
const KEY_SPACE: u64 = 1 << 32;
const N: u64 = 10_000;

fn setup_list(keys: &[u64]) -> MdList<u64> {
    let list = MdList::new(DIM, KEY_SPACE);
    let guard = list.guard();
    for &key in keys {
        list.insert_with_guard(key, key, &guard);
    }
    drop(guard);
    list
}

// =============================================================================
// Construction
// =============================================================================

#[divan::bench_group]
mod construction {
    use super::MdList;

    #[divan::bench]
    fn new_d3_n64() -> MdList<u64> {
        MdList::new(3, 64)
    }

    #[divan::bench]
    fn new_d8_n2pow32() -> MdList<u64> {
        MdList::new(8, 1 << 32)
    }
}

// =============================================================================
// Insert
// =============================================================================

#[divan::bench_group]
mod insert {
    use super::{bench_utils, Bencher, MdList, DIM, KEY_SPACE, N};

    #[divan::bench]
    fn sequential(bencher: Bencher) {
        bencher
            .with_inputs(|| (0..N).collect::<Vec<u64>>())
            .bench_local_values(|keys| {
                let list = MdList::new(DIM, KEY_SPACE);
                let guard = list.guard();
                for key in keys {
                    list.insert_with_guard(key, key, &guard);
                }
                drop(guard);
                list
            });
    }

    #[divan::bench]
    fn shuffled(bencher: Bencher) {
        bencher
            .with_inputs(|| bench_utils::shuffled_range(N, 7))
            .bench_local_values(|keys| {
                let list = MdList::new(DIM, KEY_SPACE);
                let guard = list.guard();
                for key in keys {
                    list.insert_with_guard(key, key, &guard);
                }
                drop(guard);
                list
            });
    }

    #[divan::bench]
    fn overwrite_existing(bencher: Bencher) {
        let keys = bench_utils::shuffled_range(N, 7);
        let list = super::setup_list(&keys);
        bencher.bench_local(|| {
            let guard = list.guard();
            for key in &keys {
                list.insert_with_guard(*key, key.wrapping_add(1), &guard);
            }
        });
    }
}

// =============================================================================
// Find
// =============================================================================

#[divan::bench_group]
mod find {
    use super::{bench_utils, black_box, Bencher, N};

    #[divan::bench]
    fn hit(bencher: Bencher) {
        let keys = bench_utils::shuffled_range(N, 11);
        let list = super::setup_list(&keys);
        bencher.bench_local(|| {
            let guard = list.guard();
            for key in &keys {
                black_box(list.find_with_guard(black_box(*key), &guard));
            }
        });
    }

    #[divan::bench]
    fn miss(bencher: Bencher) {
        let keys = bench_utils::shuffled_range(N, 11);
        let list = super::setup_list(&keys);
        bencher.bench_local(|| {
            let guard = list.guard();
            for key in &keys {
                black_box(list.find_with_guard(black_box(*key + N), &guard));
            }
        });
    }
}

// =============================================================================
// Remove
// =============================================================================

#[divan::bench_group]
mod remove {
    use super::{bench_utils, Bencher, N};

    #[divan::bench]
    fn drain_shuffled(bencher: Bencher) {
        let keys = bench_utils::shuffled_range(N, 13);
        bencher
            .with_inputs(|| super::setup_list(&keys))
            .bench_local_values(|list| {
                let guard = list.guard();
                for key in &keys {
                    let _ = list.remove_with_guard(*key, &guard);
                }
                drop(guard);
                list
            });
    }
}

// =============================================================================
// Concurrent
// =============================================================================

#[divan::bench_group(sample_count = 10)]
mod concurrent {
    use std::sync::Arc;
    use std::thread;

    use super::{bench_utils, Bencher, MdList, DIM, KEY_SPACE, N};

    const THREADS: usize = 4;

    #[divan::bench]
    fn insert_4_threads(bencher: Bencher) {
        let keys = bench_utils::shuffled_range(N, 17);
        let chunks: Vec<Vec<u64>> = keys
            .chunks(keys.len() / THREADS)
            .map(<[u64]>::to_vec)
            .collect();

        bencher.bench_local(|| {
            let list = Arc::new(MdList::<u64>::new(DIM, KEY_SPACE));
            let handles: Vec<_> = chunks
                .iter()
                .cloned()
                .map(|chunk| {
                    let list = Arc::clone(&list);
                    thread::spawn(move || {
                        let guard = list.guard();
                        for key in chunk {
                            list.insert_with_guard(key, key, &guard);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            list
        });
    }
}
