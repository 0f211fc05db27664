//! End-to-end saga orchestration: an order-fulfilment workflow driven
//! through the consumer shell, the outbox relay and the in-memory broker,
//! with the test playing the participant services.

use serde_json::json;

use sagabox_core::consumer::{MessageHandler, Outcome};
use sagabox_core::envelope::Envelope;
use sagabox_core::error::Error;
use sagabox_core::port::{StoreError, StoreTransaction, TransactionalStore};
use sagabox_core::saga::{CommandSpec, SagaEngine, Transition, WorkflowDefinition};
use sagabox_testing::{reply, SagaHarness};

/// Three-step order saga: payment, inventory, shipping. Payment and
/// inventory declare compensations; shipping is the last step and none is
/// needed for it.
fn order_workflow() -> WorkflowDefinition {
    WorkflowDefinition::builder("order-fulfilment")
        .trigger(
            "OrderSubmitted",
            Transition::to("AwaitingPayment")
                .capture(&["orderId", "amount"])
                .emit(
                    CommandSpec::new("payments", "ProcessPayment")
                        .with_fields(&["orderId", "amount"]),
                ),
        )
        .on(
            "AwaitingPayment",
            "PaymentProcessed",
            Transition::to("AwaitingInventory")
                .capture(&["paymentId"])
                .record_step(
                    "payment",
                    CommandSpec::new("payments", "CancelPayment")
                        .with_fields(&["orderId", "paymentId"]),
                    "PaymentCancelled",
                )
                .emit(CommandSpec::new("inventory", "ReserveInventory").with_fields(&["orderId"])),
        )
        .on(
            "AwaitingInventory",
            "InventoryReserved",
            Transition::to("AwaitingShipment")
                .capture(&["reservationId"])
                .record_step(
                    "inventory",
                    CommandSpec::new("inventory", "ReleaseInventory")
                        .with_fields(&["orderId", "reservationId"]),
                    "InventoryReleased",
                )
                .emit(CommandSpec::new("shipping", "ShipOrder").with_fields(&["orderId"])),
        )
        .on(
            "AwaitingShipment",
            "OrderShipped",
            Transition::to("Completed"),
        )
        .build()
        .unwrap()
}

fn harness() -> SagaHarness {
    sagabox_testing::init_test_logging();
    let mut engine = SagaEngine::new();
    engine.register(order_workflow()).unwrap();
    SagaHarness::new(engine)
}

fn order_submitted() -> Envelope {
    Envelope::from_json("OrderSubmitted", &json!({"orderId": "42", "amount": 100}))
        .unwrap()
        .with_correlation_key("42")
}

/// Drive the saga up to `AwaitingInventory` and return the pending
/// ReserveInventory command.
async fn drive_to_awaiting_inventory(harness: &SagaHarness) -> Envelope {
    harness.submit(&order_submitted()).await.unwrap();
    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope.message_type, "ProcessPayment");

    let payment_ok = reply(
        &delivered[0].envelope,
        "PaymentProcessed",
        &json!({"paymentId": "PAY-7"}),
    );
    harness.submit(&payment_ok).await.unwrap();

    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope.message_type, "ReserveInventory");
    delivered[0].envelope.clone()
}

#[tokio::test]
async fn happy_path_runs_to_completion() {
    let harness = harness();
    let reserve = drive_to_awaiting_inventory(&harness).await;

    let reserved = reply(
        &reserve,
        "InventoryReserved",
        &json!({"reservationId": "RES-3"}),
    );
    harness.submit(&reserved).await.unwrap();

    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    let ship = &delivered[0];
    assert_eq!(ship.destination, "shipping");
    assert_eq!(ship.envelope.message_type, "ShipOrder");
    assert_eq!(ship.envelope.payload_json().unwrap()["orderId"], json!("42"));

    let shipped = reply(&ship.envelope, "OrderShipped", &json!({}));
    harness.submit(&shipped).await.unwrap();
    assert!(harness.pump().await.unwrap().is_empty());

    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "Completed");
    assert_eq!(saga.version, 4);
    assert_eq!(saga.get_data("paymentId"), Some(&json!("PAY-7")));
    assert_eq!(saga.get_data("reservationId"), Some(&json!("RES-3")));
    assert_eq!(saga.completed_steps.len(), 2);
    assert!(harness.dead_letters.is_empty());
}

#[tokio::test]
async fn inventory_failure_cancels_payment_and_never_ships() {
    let harness = harness();
    let reserve = drive_to_awaiting_inventory(&harness).await;

    let failed = reply(&reserve, "InventoryReserved", &json!({"success": false}));
    harness.submit(&failed).await.unwrap();

    // The only reaction is the payment compensation.
    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    let cancel = &delivered[0];
    assert_eq!(cancel.destination, "payments");
    assert_eq!(cancel.envelope.message_type, "CancelPayment");
    let payload = cancel.envelope.payload_json().unwrap();
    assert_eq!(payload["orderId"], json!("42"));
    assert_eq!(payload["paymentId"], json!("PAY-7"));

    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "Compensating");
    assert_eq!(saga.get_data("failedEvent"), Some(&json!("InventoryReserved")));

    let cancelled = reply(&cancel.envelope, "PaymentCancelled", &json!({}));
    harness.submit(&cancelled).await.unwrap();
    assert!(harness.pump().await.unwrap().is_empty());

    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "Failed");
    assert!(saga.pending_compensations.is_empty());

    // Full command history: exactly these three, one each, no ShipOrder.
    let published = harness.broker.published_types();
    assert_eq!(published.len(), 3);
    assert_eq!(published["ProcessPayment"], 1);
    assert_eq!(published["ReserveInventory"], 1);
    assert_eq!(published["CancelPayment"], 1);
}

#[tokio::test]
async fn failure_of_first_step_fails_without_compensation() {
    let harness = harness();
    harness.submit(&order_submitted()).await.unwrap();
    let delivered = harness.pump().await.unwrap();

    let failed = reply(
        &delivered[0].envelope,
        "PaymentProcessed",
        &json!({"success": false}),
    );
    harness.submit(&failed).await.unwrap();

    // Nothing completed yet, so nothing to undo.
    assert!(harness.pump().await.unwrap().is_empty());
    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "Failed");
    assert!(saga.completed_steps.is_empty());
}

#[tokio::test]
async fn shipment_failure_compensates_in_reverse_order() {
    let harness = harness();
    let reserve = drive_to_awaiting_inventory(&harness).await;
    let reserved = reply(
        &reserve,
        "InventoryReserved",
        &json!({"reservationId": "RES-3"}),
    );
    harness.submit(&reserved).await.unwrap();
    let delivered = harness.pump().await.unwrap();

    let failed = reply(&delivered[0].envelope, "OrderShipped", &json!({"success": false}));
    harness.submit(&failed).await.unwrap();

    // Inventory completed last, so it is undone first.
    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope.message_type, "ReleaseInventory");
    let payload = delivered[0].envelope.payload_json().unwrap();
    assert_eq!(payload["reservationId"], json!("RES-3"));

    let released = reply(&delivered[0].envelope, "InventoryReleased", &json!({}));
    harness.submit(&released).await.unwrap();

    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope.message_type, "CancelPayment");

    let cancelled = reply(&delivered[0].envelope, "PaymentCancelled", &json!({}));
    harness.submit(&cancelled).await.unwrap();
    assert!(harness.pump().await.unwrap().is_empty());
    assert_eq!(harness.store.saga("42").unwrap().current_state, "Failed");
}

#[tokio::test]
async fn ack_of_the_wrong_compensation_is_rejected() {
    let harness = harness();
    let reserve = drive_to_awaiting_inventory(&harness).await;
    let reserved = reply(
        &reserve,
        "InventoryReserved",
        &json!({"reservationId": "RES-3"}),
    );
    harness.submit(&reserved).await.unwrap();
    let delivered = harness.pump().await.unwrap();

    let failed = reply(&delivered[0].envelope, "OrderShipped", &json!({"success": false}));
    harness.submit(&failed).await.unwrap();
    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered[0].envelope.message_type, "ReleaseInventory");

    // ReleaseInventory is outstanding; a payment ack must not stand in for
    // it. CancelPayment was never even emitted.
    let stray = reply(&delivered[0].envelope, "PaymentCancelled", &json!({}));
    let outcome = harness.submit(&stray).await.unwrap();
    assert_eq!(outcome, Outcome::DeadLettered);
    assert_eq!(harness.dead_letters.len(), 1);

    // The queue is untouched and nothing new was emitted.
    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "Compensating");
    assert_eq!(saga.pending_compensations.len(), 2);
    assert!(harness.pump().await.unwrap().is_empty());

    // The declared ack still drives the queue forward.
    let released = reply(&delivered[0].envelope, "InventoryReleased", &json!({}));
    harness.submit(&released).await.unwrap();
    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope.message_type, "CancelPayment");
}

#[tokio::test]
async fn failed_compensation_halts_the_saga_and_escalates() {
    let harness = harness();
    let reserve = drive_to_awaiting_inventory(&harness).await;
    let failed = reply(&reserve, "InventoryReserved", &json!({"success": false}));
    harness.submit(&failed).await.unwrap();
    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered[0].envelope.message_type, "CancelPayment");

    let cancel_failed = reply(
        &delivered[0].envelope,
        "PaymentCancelled",
        &json!({"success": false}),
    );
    let outcome = harness.submit(&cancel_failed).await.unwrap();
    assert_eq!(outcome, Outcome::Escalated);

    // Halt committed, event dead-lettered, nothing further emitted.
    let saga = harness.store.saga("42").unwrap();
    assert!(saga.halted);
    assert_eq!(saga.current_state, "Compensating");
    assert_eq!(harness.dead_letters.len(), 1);
    assert!(harness.pump().await.unwrap().is_empty());

    // Later events for the halted instance are discarded, not reprocessed.
    let retry = reply(&delivered[0].envelope, "PaymentCancelled", &json!({}));
    let outcome = harness.submit(&retry).await.unwrap();
    assert_eq!(outcome, Outcome::Processed);
    let saga = harness.store.saga("42").unwrap();
    assert!(saga.halted);
    assert_eq!(saga.version, 4);
    assert_eq!(harness.dead_letters.len(), 1);
}

#[tokio::test]
async fn duplicate_delivery_advances_the_saga_once() {
    let harness = harness();
    let trigger = order_submitted();

    assert_eq!(harness.submit(&trigger).await.unwrap(), Outcome::Processed);
    assert_eq!(harness.submit(&trigger).await.unwrap(), Outcome::Duplicate);

    let delivered = harness.pump().await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(harness.store.saga("42").unwrap().version, 1);
}

#[tokio::test]
async fn out_of_protocol_event_is_dead_lettered_without_touching_the_saga() {
    let harness = harness();
    harness.submit(&order_submitted()).await.unwrap();
    harness.pump().await.unwrap();

    // Valid event type, but not expected in AwaitingPayment.
    let premature = Envelope::from_json("OrderShipped", &json!({}))
        .unwrap()
        .with_correlation_key("42");
    let outcome = harness.submit(&premature).await.unwrap();

    assert_eq!(outcome, Outcome::DeadLettered);
    assert_eq!(harness.dead_letters.len(), 1);
    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "AwaitingPayment");
    assert_eq!(saga.version, 1);
}

#[tokio::test]
async fn event_without_instance_or_trigger_is_dead_lettered() {
    let harness = harness();

    let orphan = Envelope::from_json("PaymentProcessed", &json!({"paymentId": "PAY-9"}))
        .unwrap()
        .with_correlation_key("99");
    let outcome = harness.submit(&orphan).await.unwrap();

    assert_eq!(outcome, Outcome::DeadLettered);
    assert!(harness.store.saga("99").is_none());
}

#[tokio::test]
async fn event_without_correlation_key_is_dead_lettered() {
    let harness = harness();

    let keyless = Envelope::from_json("OrderSubmitted", &json!({"orderId": "42"})).unwrap();
    let outcome = harness.submit(&keyless).await.unwrap();

    assert_eq!(outcome, Outcome::DeadLettered);
    assert_eq!(harness.dead_letters.len(), 1);
}

#[tokio::test]
async fn events_after_a_terminal_state_are_discarded() {
    let harness = harness();
    let reserve = drive_to_awaiting_inventory(&harness).await;
    let failed = reply(&reserve, "InventoryReserved", &json!({"success": false}));
    harness.submit(&failed).await.unwrap();
    let delivered = harness.pump().await.unwrap();
    let cancelled = reply(&delivered[0].envelope, "PaymentCancelled", &json!({}));
    harness.submit(&cancelled).await.unwrap();
    assert_eq!(harness.store.saga("42").unwrap().current_state, "Failed");
    let version = harness.store.saga("42").unwrap().version;

    // A redelivered compensation ack with a fresh id is a no-op.
    let late = reply(&delivered[0].envelope, "PaymentCancelled", &json!({}));
    let outcome = harness.submit(&late).await.unwrap();
    assert_eq!(outcome, Outcome::Processed);
    assert_eq!(harness.store.saga("42").unwrap().version, version);
    assert!(harness.pump().await.unwrap().is_empty());
    assert!(harness.dead_letters.is_empty());
}

#[tokio::test]
async fn commit_conflict_is_retried_in_process() {
    let harness = harness();
    harness.store.inject_commit_conflicts(1);

    let outcome = harness.submit(&order_submitted()).await.unwrap();
    assert_eq!(outcome, Outcome::Processed);

    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "AwaitingPayment");
    assert_eq!(saga.version, 1);
    // Only the winning attempt's commands were committed.
    assert_eq!(harness.pump().await.unwrap().len(), 1);
}

#[tokio::test]
async fn conflict_loser_decides_against_the_winners_state() {
    let harness = harness();
    harness.submit(&order_submitted()).await.unwrap();
    let delivered = harness.pump().await.unwrap();
    let command = delivered[0].envelope.clone();

    // Two workers race conflicting payment outcomes for one saga.
    let success = reply(&command, "PaymentProcessed", &json!({"paymentId": "PAY-7"}));
    let failure = reply(&command, "PaymentProcessed", &json!({"success": false}));

    // The losing worker reads the saga at AwaitingPayment, stages its
    // decision (fail the saga) and stalls before committing.
    let mut engine = SagaEngine::new();
    engine.register(order_workflow()).unwrap();
    let mut tx = harness.store.begin().await.unwrap();
    engine.handle(&mut tx, &failure).await.unwrap();

    // The winner commits first and advances the saga.
    assert_eq!(harness.submit(&success).await.unwrap(), Outcome::Processed);
    harness.pump().await.unwrap();

    // The stalled commit loses on the version check; the stale Failed
    // state is never written.
    assert!(matches!(
        tx.commit().await,
        Err(StoreError::VersionConflict { expected: 1, found: 2, .. })
    ));

    // On redelivery the event is decided against the now-current state:
    // PaymentProcessed is not expected in AwaitingInventory.
    let outcome = harness.submit(&failure).await.unwrap();
    assert_eq!(outcome, Outcome::DeadLettered);

    let saga = harness.store.saga("42").unwrap();
    assert_eq!(saga.current_state, "AwaitingInventory");
    assert_eq!(saga.version, 2);
    assert_eq!(saga.get_data("paymentId"), Some(&json!("PAY-7")));
}

#[tokio::test]
async fn exhausted_conflict_retries_yield_to_redelivery() {
    let harness = harness();
    // More conflicts than the shell's retry budget (5 retries, 6 attempts).
    harness.store.inject_commit_conflicts(10);

    let trigger = order_submitted();
    let err = harness.submit(&trigger).await.unwrap_err();
    assert!(err.is_version_conflict());
    assert!(harness.store.saga("42").is_none());

    // The broker redelivers; the remaining injected conflicts are absorbed
    // by the retry budget and the saga starts.
    let outcome = harness.submit(&trigger).await.unwrap();
    assert_eq!(outcome, Outcome::Processed);
    assert!(harness.store.saga("42").is_some());
}

#[tokio::test]
async fn conflicting_trigger_registration_is_rejected() {
    let mut engine = SagaEngine::new();
    engine.register(order_workflow()).unwrap();

    let other = WorkflowDefinition::builder("order-archival")
        .trigger("OrderSubmitted", Transition::to("Archiving"))
        .build()
        .unwrap();
    assert!(matches!(
        engine.register(other),
        Err(Error::Configuration(_))
    ));
}
