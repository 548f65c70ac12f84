//! SCPI command layer and sink power polling against the SCPI simulator

use std::time::Duration;

use bench_protocols::simulator::{unused_endpoint, ScpiSimulator};
use benchsrv::{BenchConfig, BenchController, BenchError, GroupMode};

const HOST: &str = "127.0.0.1";

fn controller_for(scpi_port: u16, response_ms: u64) -> BenchController {
    let mut config = BenchConfig::default();
    config.devices.scpi_port = scpi_port;
    config.timeouts.scpi_connect_ms = 500;
    config.timeouts.scpi_response_ms = response_ms;
    BenchController::new(config)
}

#[tokio::test]
async fn test_voltage_mode_sends_ordered_sequence_on_one_connection() {
    let sim = ScpiSimulator::start().await.unwrap();
    let controller = controller_for(sim.endpoint().port(), 50);

    controller
        .set_voltage_priority_mode(HOST, 400.0, 32.0)
        .await
        .unwrap();

    assert_eq!(
        sim.received(),
        vec![
            "*IDN?",
            "SOUR:FUNC VOLT",
            "SOUR:CURR:LIM:POS:IMM:AMPL 32",
            "SOUR:CURR:LIM:NEG:IMM:AMPL -32",
            "SOUR:VOLT:LEV:IMM:AMPL 400",
        ]
    );
    assert_eq!(sim.accepted_connections(), 1);
    assert!(sim.wait_for_idle(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_current_mode_and_group_mode() {
    let sim = ScpiSimulator::start().await.unwrap();
    let controller = controller_for(sim.endpoint().port(), 50);

    controller
        .set_current_priority_mode(HOST, 16.0, 400.0)
        .await
        .unwrap();
    controller
        .set_group_mode(HOST, GroupMode::Master)
        .await
        .unwrap();

    assert_eq!(
        sim.received(),
        vec![
            "*IDN?",
            "SOUR:FUNC CURR",
            "SOUR:CURR 16",
            "SOUR:VOLT:LIM:POS:IMM:AMPL 400",
            "*IDN?",
            "INST:GRO:FUNC MAST",
        ]
    );
    // One connection per logical operation
    assert_eq!(sim.accepted_connections(), 2);
    assert!(sim.wait_for_idle(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_sink_power_value() {
    let sim = ScpiSimulator::start().await.unwrap();
    sim.respond_to("MEAS:POW?", "4.998E+03");
    let controller = controller_for(sim.endpoint().port(), 200);

    let reading = controller.get_sink_power_value(HOST).await.unwrap();
    assert!(reading.succeeded);
    assert_eq!(reading.message, "4.998E+03");
    assert_eq!(reading.watts, Some(4998.0));
    // A one-shot read does not touch the cache
    assert!(controller.last_sink_power_value().is_none());
}

#[tokio::test]
async fn test_sink_power_silence_is_success() {
    let sim = ScpiSimulator::start().await.unwrap();
    // Default 1000 ms response timeout; MEAS:POW? stays unanswered
    let controller = controller_for(sim.endpoint().port(), 1000);

    let reading = controller.get_sink_power_value(HOST).await.unwrap();
    assert!(reading.succeeded);
    assert_eq!(reading.message, "no data received");
    assert_eq!(reading.watts, None);
}

#[tokio::test]
async fn test_refused_connection_is_connection_error() {
    let controller = controller_for(unused_endpoint().port(), 100);

    let err = controller.set_output(HOST, false).await.unwrap_err();
    assert!(matches!(err, BenchError::Connection(_)));
    assert!(err.is_device_unreachable());
    assert_eq!(err.error_code(), "CONNECTION_ERROR");
}

#[tokio::test]
async fn test_invalid_values_never_reach_the_device() {
    let sim = ScpiSimulator::start().await.unwrap();
    let controller = controller_for(sim.endpoint().port(), 50);

    let err = controller
        .set_voltage_priority_mode(HOST, f64::NAN, 32.0)
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::InvalidParameter(_)));
    assert_eq!(sim.accepted_connections(), 0);
}

#[tokio::test]
async fn test_sink_polling_updates_cache_and_keeps_stale_value() {
    let sim = ScpiSimulator::start().await.unwrap();
    sim.respond_to("MEAS:POW?", "5000");
    let controller = controller_for(sim.endpoint().port(), 200);

    assert!(controller
        .start_sink_power_polling(HOST, 50, 200)
        .await
        .unwrap());
    assert!(!controller
        .start_sink_power_polling(HOST, 50, 200)
        .await
        .unwrap());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while controller.last_sink_power_value().is_none() && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let first = controller.last_sink_power_value().unwrap();
    assert_eq!(first.watts, Some(5000.0));

    // Device goes away: reads fail, the last good reading stays
    drop(sim);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = controller.sink_status().await;
    assert!(status.active);
    assert!(status.failures >= 1);
    assert_eq!(
        controller.last_sink_power_value().and_then(|r| r.watts),
        Some(5000.0)
    );

    assert!(controller.stop_sink_power_polling().await);
    assert!(!controller.stop_sink_power_polling().await);
    assert!(!controller.sink_status().await.active);
}

#[tokio::test]
async fn test_zero_sink_interval_rejected() {
    let controller = controller_for(unused_endpoint().port(), 100);
    let err = controller
        .start_sink_power_polling(HOST, 0, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::InvalidParameter(_)));
    assert!(!controller.sink_status().await.active);
}
