use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use deltastream::broadcast::BroadcastGroup;
use deltastream::protocol::{Client, DocumentMessage, SequencedMessage, ServerFrame};
use deltastream::sequencer::{Sequencer, SequencerConfig};
use deltastream::summary::SummaryTree;
use uuid::Uuid;

fn bench_frame_encode(c: &mut Criterion) {
    let op = SequencedMessage::from_client(
        DocumentMessage::operation(1, 0, vec![0u8; 64]),
        Uuid::new_v4(),
        1,
        0,
    );
    let frame = ServerFrame::Op(vec![op]);

    c.bench_function("op_frame_encode_64B", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let op = SequencedMessage::from_client(
        DocumentMessage::operation(1, 0, vec![0u8; 64]),
        Uuid::new_v4(),
        1,
        0,
    );
    let encoded = ServerFrame::Op(vec![op]).encode().unwrap();

    c.bench_function("op_frame_decode_64B", |b| {
        b.iter(|| black_box(ServerFrame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_sequence_submit(c: &mut Criterion) {
    let sequencer = Sequencer::new(
        Uuid::new_v4(),
        SequencerConfig {
            history_limit: Some(1024),
            ..SequencerConfig::default()
        },
    );
    let mut handle = sequencer.join(Client::new("bench")).unwrap();
    let client_id = handle.details.client_id;
    let mut csn = 0u64;

    c.bench_function("sequence_single_op", |b| {
        b.iter(|| {
            csn += 1;
            let outcome = sequencer
                .submit(
                    handle.session,
                    client_id,
                    vec![DocumentMessage::operation(csn, -1, vec![0u8; 64])],
                )
                .unwrap();
            while handle.frames.try_recv().is_ok() {}
            black_box(outcome)
        })
    });
}

fn bench_fan_out_100_members(c: &mut Criterion) {
    let mut group = BroadcastGroup::new();
    let mut receivers: Vec<_> = (0..100).map(|session| group.add_member(session)).collect();
    let batch: Vec<_> = (1..=10)
        .map(|seq| {
            SequencedMessage::from_client(
                DocumentMessage::operation(seq, -1, vec![0u8; 64]),
                Uuid::new_v4(),
                seq,
                0,
            )
        })
        .collect();

    c.bench_function("broadcast_10_ops_x_100_members", |b| {
        b.iter(|| {
            black_box(group.broadcast(black_box(&batch)));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_summarize_and_load(c: &mut Criterion) {
    let doc_id = Uuid::new_v4();
    let sequencer = Sequencer::with_defaults(doc_id);
    let _handles: Vec<_> = (0..20)
        .map(|i| sequencer.join(Client::new(format!("user-{i}"))).unwrap())
        .collect();

    c.bench_function("summarize_20_members", |b| {
        b.iter(|| black_box(sequencer.summarize().unwrap()))
    });

    let json = sequencer.summarize().unwrap().to_json().unwrap();
    c.bench_function("load_summary_20_members", |b| {
        b.iter(|| {
            let tree = SummaryTree::from_json(black_box(&json)).unwrap();
            black_box(Sequencer::from_summary(doc_id, SequencerConfig::default(), &tree).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_sequence_submit,
    bench_fan_out_100_members,
    bench_summarize_and_load,
);
criterion_main!(benches);
