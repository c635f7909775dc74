use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

use ferry::{
    CloseReason, ConnId, Core, CoreOptions, EntryState, ExitState, Processor, Role, RoleKind,
    Runtime,
};

const TOTAL: usize = 4 * 1024 * 1024;
const WRITE_SIZES: [usize; 3] = [514, 4096, 65536];

/// Drops everything it reads.
struct Sink;

impl Processor for Sink {
    fn process_inbound(&mut self, core: &mut Core, id: ConnId, _: bool) -> Result<(), CloseReason> {
        if let Some(inbuf) = core.inbuf_mut(id) {
            inbuf.clear();
        }
        Ok(())
    }
}

fn linked_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("linked_throughput");
    group.throughput(Throughput::Bytes(TOTAL as u64));

    for size in WRITE_SIZES {
        let mut rng = rand::thread_rng();
        let piece: Vec<u8> = (0..size).map(|_| rng.gen()).collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &piece, |b, piece| {
            let mut rt = Runtime::new(CoreOptions::default())
                .unwrap()
                .with_processor(RoleKind::Exit, Sink);
            let (entry, exit) = rt
                .core_mut()
                .create_linked_pair(Role::Entry(EntryState::Open), Role::Exit(ExitState::Open));

            b.iter(|| {
                let writes = TOTAL / piece.len();
                let target = rt.core().connection(exit).unwrap().bytes_read() +
                    (writes * piece.len()) as u64;
                for _ in 0..writes {
                    rt.core_mut().append_bytes(entry, piece).unwrap();
                }
                rt.run_until(Duration::from_secs(10), |core| {
                    core.connection(exit).map_or(true, |c| c.bytes_read() >= target)
                })
                .unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, linked_throughput);
criterion_main!(benches);
