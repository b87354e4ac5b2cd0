use buddymalloc::{Heap, HeapConfig};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// buddymalloc allocate/release throughput.
fn buddy_allocate_release(heap: &mut Heap, size: usize) {
  for _ in 0..OPS {
    let ptr = heap.allocate(size);
    black_box(ptr);
    unsafe { heap.release(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");
  let mut heap = Heap::new(HeapConfig::DEFAULT);

  // The last size bypasses the pool.
  for size in [16, 64, 256, 1024, 4096, 200_000] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("buddymalloc", size), &size, |b, &size| {
      b.iter(|| buddy_allocate_release(&mut heap, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Grow a small allocation while its buddies are free, so every step merges in place.
fn benchmark_resize_in_place(c: &mut Criterion) {
  let mut group = c.benchmark_group("resize_in_place");
  let mut heap = Heap::new(HeapConfig::DEFAULT);

  group.throughput(Throughput::Elements(OPS));
  group.bench_function("16_to_64k", |b| {
    b.iter(|| {
      for _ in 0..OPS {
        unsafe {
          let mut ptr = heap.allocate(16);
          for size in [200, 1_000, 8_000, 64_000] {
            ptr = heap.resize(ptr, size);
          }
          black_box(ptr);
          heap.release(ptr);
        }
      }
    })
  });

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_resize_in_place);
criterion_main!(benches);
