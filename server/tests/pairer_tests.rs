use std::sync::Arc;

use broker::bus::MessageBus;
use broker::topology::MLFLOW_EXCHANGE;
use codec::InputsFormat;
use codec::wire::PairedBatch;
use server::pairer::{BatchPairer, PairerStatus};
use session::store::ScoresStore;
use uq::UtraceCalculator;
use uq::calculator::StageLimits;
use uuid::Uuid;

mod support;
use support::{InMemoryBus, InMemoryScoresStore, inputs_frame, outputs_frame};

const LIMITS: StageLimits = StageLimits { calibration_limit: 2, uncertainty_limit: 4 };

async fn build_pairer(
    bus: &InMemoryBus,
    store: &Arc<InMemoryScoresStore>,
    session_id: Uuid,
) -> BatchPairer {
    let store: Arc<dyn ScoresStore> = store.clone();
    let calculator = UtraceCalculator::restore(store.clone(), session_id, LIMITS)
        .await
        .unwrap();
    let publisher = bus.channel(1).await.unwrap();

    BatchPairer::new(
        session_id,
        "user-1".to_string(),
        "(2,)".parse::<InputsFormat>().unwrap(),
        store,
        calculator,
        publisher,
    )
}

async fn paired_envelopes(bus: &InMemoryBus) -> Vec<PairedBatch> {
    bus.published_to(MLFLOW_EXCHANGE)
        .await
        .iter()
        .map(|p| codec::decode_frame::<PairedBatch>(&p.body).unwrap())
        .collect()
}

#[tokio::test]
async fn pairing_is_order_independent() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();
    let mut pairer = build_pairer(&bus, &store, session_id).await;

    // All predictions first; nothing completes.
    for i in 0..3 {
        let status = pairer.handle_outputs(&outputs_frame(i, false)).await.unwrap();
        assert_eq!(status, PairerStatus::Pending);
    }
    assert_eq!(pairer.calculator().batch_counter(), 0);

    // Inputs catch up; batches complete in inputs-arrival order.
    for i in 0..3 {
        pairer.handle_inputs(&inputs_frame(i, false)).await.unwrap();
    }

    assert_eq!(pairer.calculator().batch_counter(), 3);
    let order: Vec<i32> = paired_envelopes(&bus).await.iter().map(|e| e.batch_index).collect();
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test]
async fn paired_envelope_carries_the_full_triple() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();
    let mut pairer = build_pairer(&bus, &store, session_id).await;

    pairer.handle_inputs(&inputs_frame(0, false)).await.unwrap();
    pairer.handle_outputs(&outputs_frame(0, false)).await.unwrap();

    let envelopes = paired_envelopes(&bus).await;
    assert_eq!(envelopes.len(), 1);
    let e = &envelopes[0];
    assert_eq!(e.batch_index, 0);
    assert_eq!(e.user_id, "user-1");
    assert_eq!(e.session_id, session_id.to_string());
    assert_eq!(e.labels, vec![0, 1, 0, 1]);
    assert_eq!(e.pred.len(), 4);
    // 4 one-hot samples of 2 little-endian f32s each.
    assert_eq!(e.data.len(), 4 * 2 * 4);
}

#[tokio::test]
async fn duplicate_slot_is_dropped() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();
    let mut pairer = build_pairer(&bus, &store, session_id).await;

    pairer.handle_inputs(&inputs_frame(3, false)).await.unwrap();
    pairer.handle_outputs(&outputs_frame(3, false)).await.unwrap();

    let status = pairer.handle_outputs(&outputs_frame(3, false)).await.unwrap();
    assert_eq!(status, PairerStatus::Duplicate);

    // The pair advanced the counter exactly once and produced one envelope.
    assert_eq!(pairer.calculator().batch_counter(), 1);
    assert_eq!(paired_envelopes(&bus).await.len(), 1);
}

#[tokio::test]
async fn eof_waits_for_both_terminal_markers() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();
    let mut pairer = build_pairer(&bus, &store, session_id).await;

    let status = pairer.handle_inputs(&inputs_frame(0, true)).await.unwrap();
    assert_eq!(status, PairerStatus::Pending);

    let status = pairer.handle_outputs(&outputs_frame(0, true)).await.unwrap();
    assert_eq!(status, PairerStatus::SessionComplete);
}

#[tokio::test]
async fn eof_is_deferred_until_every_batch_is_paired() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();
    let mut pairer = build_pairer(&bus, &store, session_id).await;

    pairer.handle_inputs(&inputs_frame(0, false)).await.unwrap();
    pairer.handle_inputs(&inputs_frame(1, true)).await.unwrap();

    // Both markers present, but batch 0 is still half-paired.
    let status = pairer.handle_outputs(&outputs_frame(1, true)).await.unwrap();
    assert_eq!(status, PairerStatus::Pending);

    let status = pairer.handle_outputs(&outputs_frame(0, false)).await.unwrap();
    assert_eq!(status, PairerStatus::SessionComplete);
}

#[tokio::test]
async fn malformed_frame_surfaces_a_codec_error() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();
    let mut pairer = build_pairer(&bus, &store, session_id).await;

    let err = pairer.handle_inputs(b"\xff\xff\xff\xff").await.unwrap_err();
    assert!(err.downcast_ref::<codec::CodecError>().is_some());
}

#[tokio::test]
async fn restore_replays_without_recounting_checkpointed_batches() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();

    {
        let mut pairer = build_pairer(&bus, &store, session_id).await;
        for i in 0..2 {
            pairer.handle_inputs(&inputs_frame(i, false)).await.unwrap();
            pairer.handle_outputs(&outputs_frame(i, false)).await.unwrap();
        }
        assert_eq!(pairer.calculator().batch_counter(), 2);
        // Dropped: crash before the session ends.
    }

    let mut pairer = build_pairer(&bus, &store, session_id).await;
    let status = pairer.restore_state().await.unwrap();
    assert_eq!(status, PairerStatus::Pending);

    // Both persisted batches re-paired in memory, neither re-counted.
    assert_eq!(pairer.calculator().batch_counter(), 2);

    pairer.handle_inputs(&inputs_frame(2, false)).await.unwrap();
    pairer.handle_outputs(&outputs_frame(2, false)).await.unwrap();
    assert_eq!(pairer.calculator().batch_counter(), 3);

    // Three calibration batches of four samples, f64-encoded.
    let record = store.record(session_id).await.unwrap();
    assert_eq!(record.batch_counter, 3);
    assert_eq!(record.scores.as_ref().unwrap().len(), 12 * 8);
}

#[tokio::test]
async fn restore_rebuilds_terminal_markers() {
    let bus = InMemoryBus::new();
    let store = Arc::new(InMemoryScoresStore::default());
    let session_id = Uuid::new_v4();

    {
        let mut pairer = build_pairer(&bus, &store, session_id).await;
        pairer.handle_inputs(&inputs_frame(0, true)).await.unwrap();
        let status = pairer.handle_outputs(&outputs_frame(0, true)).await.unwrap();
        assert_eq!(status, PairerStatus::SessionComplete);
    }

    // A worker restarted right after EOF sees the session complete again.
    let mut pairer = build_pairer(&bus, &store, session_id).await;
    let status = pairer.restore_state().await.unwrap();
    assert_eq!(status, PairerStatus::SessionComplete);
}
