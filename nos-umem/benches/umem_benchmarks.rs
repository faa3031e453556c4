use core::hint::black_box;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::sync::Arc;

use nos_umem::sim::SimVm;
use nos_umem::{Access, AddressSpace, PAGE_SIZE, PhysAddr, PinCounter, UmemConfig, UmemContext, VirtAddr, pgsz, sg};

fn contiguous(npages: usize) -> Vec<PhysAddr> {
    (0..npages).map(|i| PhysAddr::new(0x4000_0000 + i * PAGE_SIZE)).collect()
}

fn fragmented(npages: usize) -> Vec<PhysAddr> {
    // Pairs of pages scattered in reverse order.
    (0..npages)
        .map(|i| PhysAddr::new(0x8000_0000 - (i / 2) * 4 * PAGE_SIZE + (i % 2) * PAGE_SIZE))
        .collect()
}

fn bench_sg_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("sg_build");
    for npages in [64usize, 1024, 16384] {
        let linear = contiguous(npages);
        let scattered = fragmented(npages);
        group.bench_with_input(BenchmarkId::new("contiguous", npages), &linear, |b, pages| {
            b.iter(|| sg::build(black_box(pages), 12, 1 << 31));
        });
        group.bench_with_input(BenchmarkId::new("fragmented", npages), &scattered, |b, pages| {
            b.iter(|| sg::build(black_box(pages), 12, 1 << 31));
        });
    }
    group.finish();
}

fn bench_pgsz_negotiate(c: &mut Criterion) {
    let bitmap = (1u64 << 12) | (1 << 16) | (1 << 21) | (1 << 30);
    let pages = contiguous(4096);
    c.bench_function("pgsz_negotiate_2m", |b| {
        b.iter(|| pgsz::negotiate(black_box(&pages), VirtAddr::new(0x4000_0000), 0x4000_0000, bitmap));
    });
    let scattered = fragmented(4096);
    c.bench_function("pgsz_negotiate_fallback", |b| {
        b.iter(|| pgsz::negotiate(black_box(&scattered), VirtAddr::new(0x4000_0000), 0x4000_0000, bitmap));
    });
}

fn bench_acquire_release(c: &mut Criterion) {
    let vm = SimVm::new();
    vm.map_anonymous(1, VirtAddr::new(0x100_0000), 256, true).unwrap();
    let space = Arc::new(AddressSpace::new(1, vm.clone(), Arc::new(PinCounter::unlimited())));
    let ctx = UmemContext::new(UmemConfig::default()).unwrap();
    c.bench_function("acquire_release_1m", |b| {
        b.iter(|| {
            let region = ctx.acquire_region(&space, VirtAddr::new(0x100_0000), 256 * PAGE_SIZE, Access::READ);
            black_box(region.is_ok());
        });
    });
}

criterion_group!(benches, bench_sg_build, bench_pgsz_negotiate, bench_acquire_release);
criterion_main!(benches);
