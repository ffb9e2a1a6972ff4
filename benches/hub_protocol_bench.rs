use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use vet_notify::hub::protocol::{HubMessage, RecordBuffer};
use vet_notify::Notification;

fn notification_record(i: usize) -> String {
    let invocation = json!({
        "type": 1,
        "target": "ReceiveNotification",
        "arguments": [{
            "id": i,
            "type": "appointment",
            "title": "Upcoming appointment",
            "message": format!("Patient #{} checks in at 10:{:02}", i, i % 60),
            "isRead": false,
            "createdAt": "2024-03-01T09:30:00Z",
            "clinicId": 7
        }]
    });
    format!("{}\u{1e}", invocation)
}

/// Split a stream of records into transport-sized chunks
fn chunked(records: usize, chunk_size: usize) -> Vec<Vec<u8>> {
    let stream: String = (0..records).map(notification_record).collect();
    stream
        .as_bytes()
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn bench_record_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_framing");

    for chunk_size in [64, 1024, 16 * 1024].iter() {
        let chunks = chunked(500, *chunk_size);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        group.throughput(Throughput::Bytes(total as u64));

        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunks,
            |b, chunks| {
                b.iter(|| {
                    let mut buffer = RecordBuffer::new();
                    let mut count = 0;
                    for chunk in chunks {
                        buffer.extend(black_box(chunk));
                        while let Some(record) = buffer.next_record().unwrap() {
                            black_box(record);
                            count += 1;
                        }
                    }
                    count
                });
            },
        );
    }
    group.finish();
}

fn bench_decode_notification(c: &mut Criterion) {
    let record = notification_record(42);
    let record = record.trim_end_matches('\u{1e}').to_string();

    c.bench_function("decode_notification", |b| {
        b.iter(|| match HubMessage::decode(black_box(&record)).unwrap() {
            HubMessage::Invocation { mut arguments, .. } => {
                Notification::from_value(arguments.remove(0)).unwrap()
            }
            other => panic!("unexpected message {:?}", other),
        });
    });
}

criterion_group!(benches, bench_record_framing, bench_decode_notification);
criterion_main!(benches);
