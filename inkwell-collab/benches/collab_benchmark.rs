use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use inkwell_collab::broadcast::{BroadcastGroup, Frame};
use inkwell_collab::caret::CaretReport;
use inkwell_collab::operation::{DocumentSurface, Edit, Operation, TextBuffer};
use inkwell_collab::protocol::{ClientMessage, ParticipantId, ServerMessage};
use inkwell_collab::replication::ReplicationEngine;
use inkwell_collab::room::{Audience, RoomState, DEFAULT_ROOM};

fn bench_edit_encode(c: &mut Criterion) {
    let edit = Edit::new(42, Operation::Insert { position: 1200, ch: 'x' });

    c.bench_function("edit_encode", |b| {
        b.iter(|| black_box(black_box(&edit).to_json().unwrap()))
    });
}

fn bench_edit_decode(c: &mut Criterion) {
    let payload = Edit::new(42, Operation::DeleteRange { start: 10, end: 20 })
        .to_json()
        .unwrap();

    c.bench_function("edit_decode", |b| {
        b.iter(|| black_box(Edit::from_json(black_box(&payload)).unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = ServerMessage::TextUpdated {
        from: ParticipantId::new(),
        op: Edit::new(7, Operation::Insert { position: 3, ch: 'q' }),
    }
    .encode()
    .unwrap();

    c.bench_function("server_frame_decode", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_caret_board_encode(c: &mut Criterion) {
    let carets: BTreeMap<ParticipantId, CaretReport> = (0..100)
        .map(|i| {
            (
                ParticipantId::new(),
                CaretReport { position: i * 7, updated_at: i as u64 },
            )
        })
        .collect();
    let msg = ServerMessage::CaretPositions { carets };

    c.bench_function("caret_board_encode_100", |b| {
        b.iter(|| black_box(msg.encode().unwrap()))
    });
}

fn bench_apply_insert_10k(c: &mut Criterion) {
    let base = "lorem ipsum dolor sit amet ".repeat(400);

    c.bench_function("apply_insert_middle_10k", |b| {
        b.iter_batched(
            || TextBuffer::new(base.clone()),
            |mut doc| {
                doc.apply(&Operation::Insert { position: 5000, ch: 'x' });
                black_box(doc)
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_replicate_1k_remote_edits(c: &mut Criterion) {
    let sender = ParticipantId::new();
    let edits: Vec<Edit> = (1..=1000)
        .map(|id| Edit::new(id, Operation::Insert { position: id as usize, ch: 'a' }))
        .collect();

    c.bench_function("replicate_1k_remote_edits", |b| {
        b.iter(|| {
            let mut engine = ReplicationEngine::new(ParticipantId::new(), 256);
            let mut doc = TextBuffer::default();
            for edit in &edits {
                engine.apply_remote(sender, edit, &mut doc);
            }
            black_box(doc.len_chars())
        })
    });
}

fn bench_room_caret_fanout(c: &mut Criterion) {
    let mut room = RoomState::new(DEFAULT_ROOM, 200, true);
    let ids: Vec<ParticipantId> = (0..100).map(|_| ParticipantId::new()).collect();
    for (i, id) in ids.iter().enumerate() {
        room.join(*id, &format!("user-{i}")).unwrap();
    }
    let mut clock = 0;

    c.bench_function("room_caret_update_100_members", |b| {
        b.iter(|| {
            clock += 1;
            black_box(room.handle(ids[0], ClientMessage::Caret { position: 5 }, clock))
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);

    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..100 {
            receivers.push(group.add_peer(ParticipantId::new(), &format!("peer-{i}")).await);
        }
    });

    let frame = Arc::new(Frame {
        audience: Audience::All,
        text: ServerMessage::RosterUpdated { peers: vec![ParticipantId::new()] }
            .encode()
            .unwrap(),
    });

    c.bench_function("broadcast_1k_frames_100_peers", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                group.publish_raw(frame.clone());
            }
            // Drain so receivers don't lag
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_edit_encode,
    bench_edit_decode,
    bench_frame_decode,
    bench_caret_board_encode,
    bench_apply_insert_10k,
    bench_replicate_1k_remote_edits,
    bench_room_caret_fanout,
    bench_broadcast_fanout,
);
criterion_main!(benches);
