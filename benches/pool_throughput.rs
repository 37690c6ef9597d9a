use chunkpool::{Allocator, PoolAllocator, SystemAllocator};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;
const ARENA_BYTES: usize = 256 * 1024;

/// Allocate/release pairs on one allocator.
fn alloc_release(alloc: &mut dyn Allocator, size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = alloc.allocate(size);
      black_box(ptr);
      alloc.release(ptr);
    }
  }
}

/// Fills the arena with small blocks, frees every other one, then asks for
/// blocks only the coalescing pass can satisfy.
fn fragment_and_recover(pool: &mut PoolAllocator<'_>) {
  pool.reset();
  let mut held = Vec::new();
  while let Some(ptr) = pool.allocate(12) {
    held.push(ptr);
  }
  for ptr in held.iter().skip(1).step_by(2) {
    unsafe { pool.release(Some(*ptr)) };
  }
  for ptr in held.iter().step_by(4) {
    unsafe { pool.release(Some(*ptr)) };
  }
  while let Some(ptr) = pool.allocate(36) {
    black_box(ptr);
  }
}

fn benchmark_pool_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("pool_throughput");
  let mut buffer = vec![0u8; ARENA_BYTES];

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("pool", size), &size, |b, &size| {
      let mut pool = PoolAllocator::new(&mut buffer).unwrap();
      b.iter(|| alloc_release(&mut pool, size))
    });

    group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
      b.iter(|| alloc_release(&mut SystemAllocator, size))
    });
  }

  group.finish();
}

fn benchmark_coalescing(c: &mut Criterion) {
  let mut group = c.benchmark_group("pool_coalescing");
  let mut buffer = vec![0u8; ARENA_BYTES];
  let mut pool = PoolAllocator::new(&mut buffer).unwrap();

  group.bench_function("fragment_and_recover", |b| {
    b.iter(|| fragment_and_recover(&mut pool))
  });

  group.finish();
}

criterion_group!(benches, benchmark_pool_throughput, benchmark_coalescing);
criterion_main!(benches);
