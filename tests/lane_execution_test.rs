//! Lane execution against a simulated bus: retry budget, selection caching,
//! variable substitution, looping and cancellation.

mod common;

use common::{bench, bus, controller, controller_config, engine, eventually, DMM1_ADDRESS, DMM2_ADDRESS};
use gpib_daq::adapters::{MemoryConnector, SimulatedBus};
use gpib_daq::messages::ErrorSink;
use gpib_daq::scripting::{Lane, LaneOutcome};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_lane(name: &str, commands: &[&str]) -> Lane {
    let mut lane = Lane::new(name, commands.iter().map(|c| c.to_string()).collect());
    lane.default_command_interval_ms = 0;
    lane.start_delay_ms = 0;
    lane
}

#[tokio::test]
async fn test_send_retried_until_it_goes_through() {
    let bus = bus();
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    connector.fail_next_writes(2);
    let lane = fast_lane("main", &["gpib0.ver", "gpib0.clr"]);
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Completed);
    assert!(eventually(Duration::from_millis(300), || bus.received().len() == 2).await);
    assert_eq!(bus.received(), vec!["++ver", "++clr"]);
}

#[tokio::test]
async fn test_first_success_ends_retry_loop() {
    let bus = bus();
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    let mut lane = fast_lane("main", &["gpib0.clr", "gpib0.ver"]);
    lane.timeout_retry = 5;
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Completed);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(bus.received(), vec!["++clr", "++ver"]);
}

#[tokio::test]
async fn test_exhausted_budget_aborts_lane() {
    let bus = bus();
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    connector.fail_next_writes(3);
    let lane = fast_lane("main", &["gpib0.ver", "gpib0.clr"]);
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Aborted);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(bus.received().is_empty());
}

#[tokio::test]
async fn test_closed_controller_aborts_lane() {
    let connector = MemoryConnector::new();
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    let bench = bench(ctrl, ErrorSink::discard());

    let lane = fast_lane("main", &["gpib0.ver", "gpib0.clr"]);
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;
    assert_eq!(outcome, LaneOutcome::Aborted);
}

#[tokio::test]
async fn test_exhausted_final_entry_only_ends_iteration() {
    let bus = bus();
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    // every attempt of the first iteration fails, the second goes through
    connector.fail_next_writes(3);
    let mut lane = fast_lane("main", &["gpib0.clr"]);
    lane.loop_count = 2;
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Completed);
    assert!(eventually(Duration::from_millis(300), || bus.received().len() == 1).await);
    assert_eq!(bus.received(), vec!["++clr"]);
}

#[tokio::test]
async fn test_instrument_selected_once_per_address_change() {
    let bus = bus();
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    let lane = fast_lane(
        "main",
        &["gpib0.dmm1.read", "gpib0.dmm1.read", "gpib0.dmm2.read"],
    );
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Completed);
    assert_eq!(
        bus.received(),
        vec![
            format!("++addr {DMM1_ADDRESS}"),
            "READ?".to_string(),
            "READ?".to_string(),
            format!("++addr {DMM2_ADDRESS}"),
            "READ?".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_variables_substituted_into_arguments() {
    let bus = bus();
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    let lane = fast_lane(
        "sweep",
        &["var:x=2+3", "gpib0.dmm1.volt(${x})", "var:x=x*2.5", "gpib0.dmm1.volt(${x})"],
    );
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Completed);
    assert!(eventually(Duration::from_millis(300), || bus.received().len() == 3).await);
    assert_eq!(
        bus.received(),
        vec![
            format!("++addr {DMM1_ADDRESS}"),
            "VOLT 5.000".to_string(),
            "VOLT 12.50".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_malformed_expression_fails_lane_and_reports() {
    let connector = MemoryConnector::with_bus(bus());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let (errors, mut reports) = ErrorSink::channel();
    let bench = bench(ctrl, errors);

    let lane = fast_lane("calc", &["var:x=2+*"]);
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Failed);
    let report = reports.recv().await.unwrap();
    assert_eq!(report.source, "lane calc");
    assert_eq!(report.context.as_deref(), Some("var:x=2+*"));
}

#[tokio::test]
async fn test_unknown_instrument_fails_lane() {
    let connector = MemoryConnector::with_bus(bus());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let (errors, mut reports) = ErrorSink::channel();
    let bench = bench(ctrl, errors);

    let lane = fast_lane("main", &["gpib0.scope.read"]);
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Failed);
    let report = reports.recv().await.unwrap();
    assert!(report.error.contains("scope"), "{}", report.error);
}

#[tokio::test]
async fn test_loop_index_applies_to_first_iteration() {
    let bus = bus();
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    let mut lane = fast_lane("main", &["gpib0.clr", "gpib0.ver"]);
    lane.loop_index = 1;
    lane.loop_count = 2;
    let outcome = lane.run(bench, &engine(), &CancellationToken::new()).await;

    assert_eq!(outcome, LaneOutcome::Completed);
    assert!(eventually(Duration::from_millis(300), || bus.received().len() == 3).await);
    assert_eq!(bus.received(), vec!["++ver", "++clr", "++ver"]);
}

#[tokio::test]
async fn test_infinite_lane_stops_on_cancellation() {
    let bus = SimulatedBus::new().controller_reply("++ver", "GPIB-USB 6.0");
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl.clone(), ErrorSink::discard());

    let mut lane = fast_lane("poll", &["gpib0.ver", "delay=5"]);
    lane.loop_count = -1;
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { lane.run(bench, &engine(), &cancel).await })
    };

    assert!(eventually(Duration::from_secs(1), || bus.received().len() >= 3).await);
    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("lane did not stop")
        .unwrap();
    assert_eq!(outcome, LaneOutcome::Cancelled);
    ctrl.wait(&CancellationToken::new()).await;
    assert!(!ctrl.is_busy().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lanes_share_controller_through_busy_check() {
    let bus = bus().with_reply_delay(Duration::from_millis(5));
    let connector = MemoryConnector::with_bus(bus.clone());
    let (ctrl, _events, _errors) = controller(controller_config(), &connector);
    ctrl.connect().await.unwrap();
    let bench = bench(ctrl, ErrorSink::discard());

    let mut first = fast_lane("a", &["gpib0.ver"]);
    let mut second = fast_lane("b", &["gpib0.ver"]);
    first.loop_count = 5;
    second.loop_count = 5;
    first.timeout_retry = 50;
    second.timeout_retry = 50;

    let cancel = CancellationToken::new();
    let engine = engine();
    let (a, b) = tokio::join!(
        first.run(bench.clone(), &engine, &cancel),
        second.run(bench.clone(), &engine, &cancel)
    );
    assert_eq!(a, LaneOutcome::Completed);
    assert_eq!(b, LaneOutcome::Completed);
    assert!(eventually(Duration::from_millis(300), || bus.received().len() == 10).await);
}
