/// Benchmarks for the outbound journal: durable appends while offline and batched replay
/// onto a fresh connection.
use std::path::PathBuf;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tether_ws::Message;
use tether_ws::journal::{DrainProgress, MessageJournal};
use tether_ws::transport::Connection;

/// Connection that accepts and discards every frame.
struct Sink(usize);

impl Connection for Sink {
    fn send(&mut self, message: &Message) -> tether_ws::Result<()> {
        self.0 += std::hint::black_box(message).len();
        Ok(())
    }

    fn close(&mut self) {}
}

fn journal_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("tether-ws-bench-{}", uuid::Uuid::now_v7()))
        .join(format!("{name}.log"))
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal/append");

    let text = Message::from(r#"{"type":"order","side":"buy","price":"0.55","size":"100"}"#);
    let binary = Message::from(vec![0xA5_u8; 256]);

    for (name, message) in [("text", &text), ("binary_256", &binary)] {
        let path = journal_path(name);
        let mut journal = MessageJournal::open(&path).expect("journal should open");

        group.throughput(Throughput::Bytes(message.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                journal
                    .append(std::hint::black_box(message))
                    .expect("append should succeed");
            });
        });

        drop(journal);
        if let Some(dir) = path.parent() {
            _ = std::fs::remove_dir_all(dir);
        }
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal/replay");

    for entries in [100_usize, 1_000] {
        let path = journal_path(&format!("replay_{entries}"));
        let message = Message::from(r#"{"type":"heartbeat","seq":1}"#);

        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &entries, |b, &n| {
            b.iter_batched(
                || {
                    let mut journal = MessageJournal::open(&path).expect("journal should open");
                    for _ in 0..n {
                        journal.append(&message).expect("append should succeed");
                    }
                    journal
                },
                |mut journal| {
                    let mut sink = Sink(0);
                    loop {
                        let progress = journal.drain_to(&mut sink, 64).expect("drain should succeed");
                        if let DrainProgress::Complete { replayed } = progress {
                            assert_eq!(replayed, n, "every entry should be replayed");
                            break;
                        }
                    }
                },
                BatchSize::PerIteration,
            );
        });

        if let Some(dir) = path.parent() {
            _ = std::fs::remove_dir_all(dir);
        }
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_replay);
criterion_main!(benches);
