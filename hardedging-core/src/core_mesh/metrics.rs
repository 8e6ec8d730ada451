/*
    Metrics - operational counters for relay and mesh

    Separate from the Ledger: the Ledger is what a peer shows its user, these
    are what an operator scrapes. Everything goes through the `metrics` facade;
    with no recorder installed the calls are no-ops.
*/

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use super::admission::AdmissionDecision;
use super::errors::{MeshError, MeshResult};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    // Rendezvous
    describe_gauge!("hardedging_rendezvous_connections", "Peers currently connected to the relay");
    describe_gauge!("hardedging_rendezvous_rooms", "Rooms with at least one member");
    describe_counter!(
        "hardedging_rendezvous_signals_total",
        "Signaling envelopes seen by the relay, labeled by result (relayed, dropped)"
    );
    describe_counter!(
        "hardedging_rendezvous_rejected_connections_total",
        "Connections closed because max_connections was reached"
    );

    // Admission
    describe_counter!(
        "hardedging_admission_decisions_total",
        "Admission decisions, labeled by decision (granted, queued, busy)"
    );
    describe_histogram!(
        "hardedging_admission_queue_wait_seconds",
        "Time a queued transfer waited before being granted"
    );

    // Sessions and transfers
    describe_gauge!("hardedging_open_sessions", "Peer sessions with an open channel");
    describe_counter!(
        "hardedging_sessions_closed_total",
        "Peer sessions that reached Closed, labeled by whether the channel ever opened"
    );
    describe_counter!("hardedging_transfers_served_total", "Assets sent to peers");
    describe_counter!(
        "hardedging_requests_resolved_total",
        "Local asset requests, labeled by outcome (peer, declined, timeout)"
    );
    describe_counter!("hardedging_bytes_total", "Asset bytes, labeled by direction (sent, received, origin)");
    describe_counter!(
        "hardedging_protocol_noise_total",
        "Malformed messages dropped, labeled by channel (signal, data)"
    );
}

/// Install the Prometheus exporter on `addr` and describe all metrics
pub fn install_prometheus_exporter(addr: SocketAddr) -> MeshResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MeshError::Metrics(e.to_string()))?;
    init_metrics();
    Ok(())
}

pub fn relay_connections(count: usize) {
    gauge!("hardedging_rendezvous_connections").set(count as f64);
}

pub fn relay_rooms(count: usize) {
    gauge!("hardedging_rendezvous_rooms").set(count as f64);
}

pub fn signal_relayed() {
    counter!("hardedging_rendezvous_signals_total", "result" => "relayed").increment(1);
}

pub fn signal_dropped() {
    counter!("hardedging_rendezvous_signals_total", "result" => "dropped").increment(1);
}

pub fn relay_connection_rejected() {
    counter!("hardedging_rendezvous_rejected_connections_total").increment(1);
}

pub fn admission_decision(decision: AdmissionDecision) {
    counter!("hardedging_admission_decisions_total", "decision" => decision.as_str()).increment(1);
}

pub fn admission_queue_wait(waited: Duration) {
    histogram!("hardedging_admission_queue_wait_seconds").record(waited.as_secs_f64());
}

pub fn open_sessions(count: usize) {
    gauge!("hardedging_open_sessions").set(count as f64);
}

pub fn session_closed(was_open: bool) {
    let opened = if was_open { "true" } else { "false" };
    counter!("hardedging_sessions_closed_total", "opened" => opened).increment(1);
}

pub fn transfer_served(bytes: usize) {
    counter!("hardedging_transfers_served_total").increment(1);
    counter!("hardedging_bytes_total", "direction" => "sent").increment(bytes as u64);
}

pub fn asset_received(bytes: usize) {
    counter!("hardedging_requests_resolved_total", "outcome" => "peer").increment(1);
    counter!("hardedging_bytes_total", "direction" => "received").increment(bytes as u64);
}

pub fn request_declined() {
    counter!("hardedging_requests_resolved_total", "outcome" => "declined").increment(1);
}

pub fn request_timed_out() {
    counter!("hardedging_requests_resolved_total", "outcome" => "timeout").increment(1);
}

pub fn origin_bytes(bytes: u64) {
    counter!("hardedging_bytes_total", "direction" => "origin").increment(bytes);
}

pub fn signal_noise() {
    counter!("hardedging_protocol_noise_total", "channel" => "signal").increment(1);
}

pub fn data_noise() {
    counter!("hardedging_protocol_noise_total", "channel" => "data").increment(1);
}
