// SPDX-License-Identifier: GPL-2.0
//
// scx_cortex: Event handler benchmarks
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use scx_cortex::allowlist::KnownProcesses;
use scx_cortex::probes::{Probes, ProbesConfig};
use scx_cortex::trace_event::{parse_line, TraceLine};

const SWITCH_LINE: &str = "          <idle>-0       (-------) [003] d..2. 5012.345678: sched_switch: prev_comm=swapper/3 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=ollama next_pid=4242 next_prio=120";

fn bench_sched_switch(c: &mut Criterion) {
    let probes = Probes::new(ProbesConfig::default(), KnownProcesses::with_defaults());
    let mut now = 1u64;
    c.bench_function("on_sched_switch", |b| {
        b.iter(|| {
            now += 1_000;
            let prev = (now / 1_000 % 4096) as u32 + 1;
            probes.on_sched_switch(black_box(prev), black_box(prev + 1), now);
        })
    });
}

fn bench_parse_and_dispatch(c: &mut Criterion) {
    let probes = Probes::new(ProbesConfig::default(), KnownProcesses::with_defaults());
    c.bench_function("parse_dispatch_switch", |b| {
        b.iter(|| {
            if let Ok(TraceLine::Record(rec)) = parse_line(black_box(SWITCH_LINE)) {
                probes.dispatch(&rec);
            }
        })
    });
}

criterion_group!(benches, bench_sched_switch, bench_parse_and_dispatch);
criterion_main!(benches);
