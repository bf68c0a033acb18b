//! Criterion benchmarks for the filter chain.
//!
//! Every proxied packet runs the full chain, so its cost sits on the latency
//! path of each control and bulk transfer.
//!
//! Run with:
//! ```bash
//! cargo bench --package usbproxy-core --bench filter_chain_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use usbproxy_core::filter::descriptor::descriptor_type;
use usbproxy_core::filter::{DescriptorOverrideFilter, RequestMatcher, SuppressControlOutFilter};
use usbproxy_core::{Filter, FilterChain, Request};

struct Passthrough;

impl Filter for Passthrough {}

fn chain_of(len: usize) -> FilterChain {
    let mut chain = FilterChain::new();
    for _ in 0..len {
        chain.add(Passthrough, false);
    }
    chain
}

fn bench_data_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_data_out");
    for len in [0usize, 1, 4, 16] {
        let mut chain = chain_of(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| chain.apply_data_out(black_box(2), black_box(vec![0u8; 512])))
        });
    }
    group.finish();
}

fn bench_control_in_with_override(c: &mut Criterion) {
    let mut chain = chain_of(3);
    chain.add(
        DescriptorOverrideFilter::new(descriptor_type::DEVICE, 0, vec![0x12; 18]),
        false,
    );
    chain.add(SuppressControlOutFilter::new(RequestMatcher::default()), false);

    c.bench_function("apply_control_in_descriptor_override", |b| {
        b.iter(|| {
            chain.apply_control_in(
                black_box(Request::control_in(0x80, 0x06, 0x0100, 0, 18)),
                black_box(vec![0u8; 18]),
            )
        })
    });
}

criterion_group!(benches, bench_data_out, bench_control_in_with_override);
criterion_main!(benches);
