//! Shared fixtures for the integration tests: a simulated bench with one
//! controller and two multimeters behind it.

#![allow(dead_code)]

use gpib_daq::adapters::{MemoryConnector, PortConfig, SimulatedBus};
use gpib_daq::catalog::{CommandCatalog, CommandTemplate, Instrument, InstrumentDirectory};
use gpib_daq::config::EngineSettings;
use gpib_daq::instrument::{Controller, ControllerConfig};
use gpib_daq::messages::{ControllerEvent, ErrorSink, EventSink};
use gpib_daq::scripting::Bench;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DMM1_ADDRESS: u32 = 22;
pub const DMM2_ADDRESS: u32 = 23;

/// Engine settings with a fast busy poll.
pub fn engine() -> EngineSettings {
    EngineSettings {
        poll_interval: Duration::from_millis(2),
        ..EngineSettings::default()
    }
}

/// Controller `gpib0` with `select`, `ver` and `clr` commands and two multimeters.
pub fn controller_config() -> ControllerConfig {
    let mut config = ControllerConfig::new("gpib0", PortConfig::new("mem0"));
    config.commands = CommandCatalog::try_from(vec![
        CommandTemplate::new("select", "++addr {0}"),
        CommandTemplate::new("ver", "++ver").with_response(200),
        CommandTemplate::new("clr", "++clr"),
    ])
    .unwrap();
    config.instruments = InstrumentDirectory::try_from(vec![
        Instrument::new("dmm1", DMM1_ADDRESS, "DMM", "hp34401"),
        Instrument::new("dmm2", DMM2_ADDRESS, "DMM", "hp34401"),
    ])
    .unwrap();
    config
}

/// Command set shared by both multimeters.
pub fn dmm_catalog() -> CommandCatalog {
    CommandCatalog::try_from(vec![
        CommandTemplate::new("read", "READ?").with_response(200).with_output(),
        CommandTemplate::new("volt", "VOLT {0}"),
        CommandTemplate::new("idn", "*IDN?").with_response(200),
    ])
    .unwrap()
}

/// Bus answering `++ver` and a distinct reading per multimeter.
pub fn bus() -> SimulatedBus {
    SimulatedBus::new()
        .controller_reply("++ver", "GPIB-USB 6.0")
        .instrument_reply(DMM1_ADDRESS, "READ?", "+1.000E+00")
        .instrument_reply(DMM2_ADDRESS, "READ?", "+2.000E+00")
        .instrument_reply(DMM1_ADDRESS, "*IDN?", "HP34401A")
}

/// Disconnected controller wired to fresh event and error channels.
pub fn controller(
    config: ControllerConfig,
    connector: &MemoryConnector,
) -> (
    Controller,
    mpsc::UnboundedReceiver<ControllerEvent>,
    mpsc::UnboundedReceiver<gpib_daq::messages::ErrorReport>,
) {
    let (events, events_rx) = EventSink::channel();
    let (errors, errors_rx) = ErrorSink::channel();
    let controller = Controller::new(
        config,
        &engine(),
        Arc::new(connector.clone()),
        events,
        errors,
    );
    (controller, events_rx, errors_rx)
}

/// Bench holding `controller` and the multimeter command set.
pub fn bench(controller: Controller, errors: ErrorSink) -> Arc<Bench> {
    let mut bench = Bench::new(errors);
    bench.add_catalog("hp34401", dmm_catalog());
    bench.add_controller(controller);
    Arc::new(bench)
}

/// Next non-terminal event, or `None` after `within`.
pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    within: Duration,
) -> Option<ControllerEvent> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(ControllerEvent::Terminal { .. })) => continue,
            Ok(event) => return event,
            Err(_) => return None,
        }
    }
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually<F: FnMut() -> bool>(within: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
