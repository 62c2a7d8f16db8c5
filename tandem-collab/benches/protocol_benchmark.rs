use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tandem_collab::presence::{CursorPosition, PresenceStatus, PresenceUser};
use tandem_collab::protocol::{decode_op_batch, encode_op_batch, CollaborationMessage};
use tandem_crdt::{BlockId, ClientId, CrdtDocument, Operation};

fn sample_ops(count: usize) -> Vec<Operation> {
    let mut doc = CrdtDocument::new(ClientId::new("bench"));
    let block = BlockId::new("b1");
    (0..count)
        .map(|i| doc.insert(&block, i, "x").unwrap())
        .collect()
}

fn bench_crdt_message_encode(c: &mut Criterion) {
    let ops = sample_ops(16);

    c.bench_function("crdt_message_encode_16ops", |b| {
        b.iter(|| {
            let msg = CollaborationMessage::crdt("bench-user", black_box(&ops), 16).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_crdt_message_decode(c: &mut Criterion) {
    let ops = sample_ops(16);
    let frame = CollaborationMessage::crdt("bench-user", &ops, 16)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("crdt_message_decode_16ops", |b| {
        b.iter(|| {
            let msg = CollaborationMessage::decode(black_box(&frame)).unwrap();
            if let CollaborationMessage::Crdt { payload, .. } = msg {
                black_box(decode_op_batch(&payload).unwrap());
            }
        })
    });
}

fn bench_op_batch_roundtrip(c: &mut Criterion) {
    let ops = sample_ops(64);

    c.bench_function("op_batch_roundtrip_64ops", |b| {
        b.iter(|| {
            let payload = encode_op_batch(black_box(&ops)).unwrap();
            black_box(decode_op_batch(&payload).unwrap());
        })
    });
}

fn bench_presence_encode(c: &mut Criterion) {
    let msg = CollaborationMessage::presence(PresenceUser {
        user_id: "u1".into(),
        display_name: "Bench User".into(),
        avatar_url: None,
        status: PresenceStatus::Heartbeat,
        at: 1_000_000,
    });

    c.bench_function("presence_encode", |b| {
        b.iter(|| {
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let msg = CollaborationMessage::cursor(
        "u1",
        CursorPosition {
            block_id: BlockId::new("b1"),
            offset: 42,
        },
        1_000_000,
    );

    c.bench_function("cursor_encode", |b| {
        b.iter(|| {
            black_box(msg.encode().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_crdt_message_encode,
    bench_crdt_message_decode,
    bench_op_batch_roundtrip,
    bench_presence_encode,
    bench_cursor_encode
);
criterion_main!(benches);
