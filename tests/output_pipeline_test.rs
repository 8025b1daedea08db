//! Output pipeline: per-key destination files, terminal logs, the broadcast
//! side channel and bounded retry on write failure.

use chrono::Local;
use gpib_daq::catalog::{CommandTemplate, Instrument};
use gpib_daq::config::{OutputSeparation, OutputSettings};
use gpib_daq::data::{Mirror, OutputPipeline};
use gpib_daq::messages::{ControllerEvent, Direction, ErrorSink, ResponseEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn settings(dir: &Path) -> OutputSettings {
    OutputSettings {
        path: format!("{}/{{label}}data.csv", dir.display()),
        line_format: "{controller};{instrument};{command};{response}".to_string(),
        separation: OutputSeparation::InstrumentName,
        retries: 2,
        retry_delay: Duration::from_millis(5),
        terminal_log_path: Some(format!("{}/terminal_{{controller}}.log", dir.display())),
        broadcast: true,
        ..OutputSettings::default()
    }
}

fn reading(instrument: &str, address: u32, response: &str) -> ControllerEvent {
    ControllerEvent::Response(ResponseEvent {
        controller: "gpib0".to_string(),
        instrument: Some(Arc::new(Instrument::new(instrument, address, "DMM", "hp34401"))),
        command: Arc::new(CommandTemplate::new("read", "READ?").with_response(200).with_output()),
        response: response.to_string(),
        timestamp: Local::now(),
    })
}

fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_records_split_by_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = OutputPipeline::new(settings(dir.path()), ErrorSink::discard());

    pipeline.handle(reading("dmm1", 22, "1.0"));
    pipeline.handle(reading("dmm2", 23, "2.0"));
    pipeline.handle(reading("dmm1", 22, "1.5"));
    assert_eq!(
        pipeline.destinations(),
        vec![dir.path().join("dmm1_data.csv"), dir.path().join("dmm2_data.csv")]
    );
    pipeline.close().await;

    assert_eq!(
        lines(&dir.path().join("dmm1_data.csv")),
        vec!["gpib0;dmm1;READ?;1.0", "gpib0;dmm1;READ?;1.5"]
    );
    assert_eq!(
        lines(&dir.path().join("dmm2_data.csv")),
        vec!["gpib0;dmm2;READ?;2.0"]
    );
}

#[tokio::test]
async fn test_single_destination_without_separation() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = OutputPipeline::new(
        OutputSettings {
            separation: OutputSeparation::None,
            ..settings(dir.path())
        },
        ErrorSink::discard(),
    );

    pipeline.handle(reading("dmm1", 22, "1.0"));
    pipeline.handle(reading("dmm2", 23, "2.0"));
    pipeline.close().await;

    assert_eq!(
        lines(&dir.path().join("data.csv")),
        vec!["gpib0;dmm1;READ?;1.0", "gpib0;dmm2;READ?;2.0"]
    );
}

#[tokio::test]
async fn test_terminal_traffic_logged_per_controller() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = OutputPipeline::new(settings(dir.path()), ErrorSink::discard());

    pipeline.handle(ControllerEvent::Terminal {
        controller: "gpib0".to_string(),
        direction: Direction::Sent,
        text: "READ?".to_string(),
    });
    pipeline.handle(ControllerEvent::Terminal {
        controller: "gpib0".to_string(),
        direction: Direction::Received,
        text: "+1.000E+00\r\n".to_string(),
    });
    pipeline.close().await;

    let log = lines(&dir.path().join("terminal_gpib0.log"));
    assert_eq!(log.len(), 2);
    assert!(log[0].ends_with(">> READ?"), "{}", log[0]);
    assert!(log[1].ends_with("<< +1.000E+00"), "{}", log[1]);
}

#[tokio::test]
async fn test_side_channel_carries_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = OutputPipeline::new(settings(dir.path()), ErrorSink::discard());
    let mut packets = pipeline.subscribe().unwrap();

    pipeline.handle(reading("dmm1", 22, "1.0"));
    pipeline.handle(reading("dmm2", 23, "2.0"));

    let first = packets.recv().await.unwrap();
    let second = packets.recv().await.unwrap();
    assert_eq!((first.instrument.as_str(), first.response.as_str()), ("dmm1", "1.0"));
    assert_eq!((second.instrument.as_str(), second.response.as_str()), ("dmm2", "2.0"));
    assert!(first.to_json().unwrap().contains("\"command\":\"READ?\""));
    pipeline.close().await;
}

#[tokio::test]
async fn test_failed_destination_reported_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("dmm1_data.csv")).unwrap();
    let (errors, mut reports) = ErrorSink::channel();
    let mut pipeline = OutputPipeline::new(settings(dir.path()), errors);

    pipeline.handle(reading("dmm1", 22, "1.0"));
    pipeline.handle(reading("dmm2", 23, "2.0"));
    pipeline.close().await;

    let report = reports.recv().await.unwrap();
    assert!(report.error.contains("after 2 attempts"), "{}", report.error);
    assert_eq!(report.context.as_deref(), Some("gpib0;dmm1;READ?;1.0"));
    assert!(reports.try_recv().is_err());
    assert_eq!(
        lines(&dir.path().join("dmm2_data.csv")),
        vec!["gpib0;dmm2;READ?;2.0"]
    );
}

#[tokio::test]
async fn test_mirror_receives_written_lines() {
    let dir = tempfile::tempdir().unwrap();
    let (mirror_tx, mut mirror_rx) = mpsc::unbounded_channel();
    let mut pipeline = OutputPipeline::new(
        OutputSettings {
            terminal_log_path: None,
            ..settings(dir.path())
        },
        ErrorSink::discard(),
    )
    .with_mirror(Mirror::Channel(mirror_tx));

    pipeline.handle(reading("dmm1", 22, "1.0"));
    pipeline.close().await;

    assert_eq!(mirror_rx.recv().await.unwrap(), "gpib0;dmm1;READ?;1.0");
}

#[tokio::test]
async fn test_timeouts_and_unflagged_replies_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = OutputPipeline::new(settings(dir.path()), ErrorSink::discard());

    let quiet = ResponseEvent {
        controller: "gpib0".to_string(),
        instrument: None,
        command: Arc::new(CommandTemplate::new("ver", "++ver").with_response(200)),
        response: "GPIB-USB 6.0".to_string(),
        timestamp: Local::now(),
    };
    pipeline.handle(ControllerEvent::Response(quiet.clone()));
    pipeline.handle(ControllerEvent::Timeout(gpib_daq::messages::TimeoutEvent {
        controller: quiet.controller.clone(),
        instrument: None,
        command: quiet.command.clone(),
    }));

    assert!(pipeline.destinations().is_empty());
    pipeline.shutdown().await;
}
