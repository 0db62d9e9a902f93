use nervous_devkit::{wait_until, TestHarness, WAIT};
use serde_json::json;

#[tokio::test]
async fn danger_signal_triggers_the_kill_switch() {
    let harness = TestHarness::start().await.unwrap();
    let payload = json!({"reason": "drawdown", "level": 9});

    harness.inject_json("danger_signal", &payload).unwrap();

    let sent = harness.wait_for_messages("kernel_action", 1, WAIT).await.unwrap();
    assert_eq!(sent.len(), 1);
    harness.assert_field_equals("kernel_action", "action", &json!("ACTIVATE_KILL_SWITCH")).unwrap();
    harness.assert_field_equals("kernel_action", "source", &json!("danger_signal")).unwrap();
    harness.assert_field_equals("kernel_action", "payload.reason", &json!("drawdown")).unwrap();

    let snap = harness.snapshot();
    assert_eq!(snap.counters.danger_signals, 1);
    assert_eq!(snap.counters.total_messages_routed, 1);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn non_json_danger_payload_is_embedded_as_text() {
    let harness = TestHarness::start().await.unwrap();

    harness.inject("eva.sentinel.alert", b"intrusion detected".to_vec()).unwrap();

    harness.wait_for_messages("kernel_action", 1, WAIT).await.unwrap();
    harness.assert_field_equals("kernel_action", "payload", &json!("intrusion detected")).unwrap();
    harness.assert_field_equals("kernel_action", "source", &json!("eva.sentinel.alert")).unwrap();
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn trade_opportunity_reaches_validation_and_orders_unmodified() {
    let harness = TestHarness::start().await.unwrap();
    let payload = br#"{"symbol":"EURUSD","size":0.5}"#.to_vec();

    harness.inject("trade_opportunity", payload.clone()).unwrap();

    let validation = harness.wait_for_messages("eva.banker.requests.critical", 1, WAIT).await.unwrap();
    let orders = harness.wait_for_messages("banker_orders", 1, WAIT).await.unwrap();
    assert_eq!(validation[0].payload, payload);
    assert_eq!(orders[0].payload, payload);
    assert_eq!(harness.broker.published().len(), 2);
    assert_eq!(harness.snapshot().counters.trade_signals, 1);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn swarm_event_is_broadcast_to_every_destination() {
    let harness = TestHarness::start().await.unwrap();

    harness.inject("eva.swarm.broadcast", b"regroup".to_vec()).unwrap();

    for destination in ["eva.core.swarm_event", "eva.banker.swarm_event"] {
        let sent = harness.wait_for_messages(destination, 1, WAIT).await.unwrap();
        assert_eq!(sent[0].payload, b"regroup");
    }
    assert_eq!(harness.snapshot().counters.swarm_events, 1);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn tiers_never_cross_deliver() {
    let harness = TestHarness::start().await.unwrap();

    harness.inject("eva.swarm.events", b"s".to_vec()).unwrap();
    harness.wait_for_messages("eva.core.swarm_event", 1, WAIT).await.unwrap();
    harness.wait_for_messages("eva.banker.swarm_event", 1, WAIT).await.unwrap();

    assert!(harness.broker.published_to("kernel_action").is_empty());
    assert!(harness.broker.published_to("banker_orders").is_empty());
    let c = harness.snapshot().counters;
    assert_eq!((c.danger_signals, c.trade_signals, c.swarm_events), (0, 0, 1));
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_forward_is_counted_and_dropped() {
    let harness = TestHarness::start().await.unwrap();
    harness.broker.fail_publishes_to("banker_orders");

    harness.inject("eva.core.trade_request", b"buy".to_vec()).unwrap();
    harness.wait_for_messages("eva.banker.requests.critical", 1, WAIT).await.unwrap();
    let hive = harness.hive();
    assert!(wait_until(WAIT, || hive.metrics().counters().errors_total == 1).await);

    // la route reste utilisable une fois le topic rétabli, sans rejouer l'ancien message
    harness.broker.restore_publishes_to("banker_orders");
    harness.inject("eva.core.trade_request", b"sell".to_vec()).unwrap();
    let orders = harness.wait_for_messages("banker_orders", 1, WAIT).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].payload, b"sell");
    assert_eq!(harness.snapshot().counters.trade_signals, 2);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn metrics_carry_channel_and_destination_labels() {
    let harness = TestHarness::start().await.unwrap();

    harness.inject("eva.kernel.emergency", b"{}".to_vec()).unwrap();
    harness.wait_for_messages("kernel_action", 1, WAIT).await.unwrap();
    let hive = harness.hive();
    assert!(
        wait_until(WAIT, || hive
            .metrics()
            .export()
            .map(|text| text.contains("nervous_messages_routed_total{channel=\"eva.kernel.emergency\",priority=\"P0\"} 1"))
            .unwrap_or(false))
        .await
    );

    let text = harness.hive().metrics().export().unwrap();
    assert!(text.contains("nervous_messages_forwarded_total{destination=\"kernel_action\",priority=\"P0\"} 1"));
    assert!(text.contains("nervous_routing_latency_seconds_count{channel=\"eva.kernel.emergency\"} 1"));
    harness.shutdown().await.unwrap();
}
