use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

pub(crate) const TARGET: &str = "telemetry::session";
pub(crate) const EVENT_PLAYBACK_STARTED: &str = "playback_started";
pub(crate) const EVENT_PLAYBACK_STOPPED: &str = "playback_stopped";
pub(crate) const EVENT_PLAYBACK_CANCEL_TIMEOUT: &str = "playback_cancel_timeout";
pub(crate) const EVENT_EXCHANGE_FAILED: &str = "exchange_failed";

#[derive(Debug, Serialize)]
pub struct PlaybackStartedEvent {
    pub track: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PlaybackStoppedEvent {
    pub reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PlaybackCancelTimeoutEvent {
    pub track: Option<u32>,
    pub grace_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ExchangeFailedEvent {
    pub command: &'static str,
    pub error: String,
}

pub fn record_playback_started(track: Option<u32>) {
    let event = PlaybackStartedEvent { track };
    emit(EVENT_PLAYBACK_STARTED, &event);
}

pub fn record_playback_stopped(reason: &'static str) {
    let event = PlaybackStoppedEvent { reason };
    emit(EVENT_PLAYBACK_STOPPED, &event);
}

pub fn record_playback_cancel_timeout(track: Option<u32>, grace: Duration) {
    let event = PlaybackCancelTimeoutEvent {
        track,
        grace_ms: duration_to_ms(grace),
    };
    emit(EVENT_PLAYBACK_CANCEL_TIMEOUT, &event);
}

pub fn record_exchange_failed(command: &'static str, error: impl ToString) {
    let event = ExchangeFailedEvent {
        command,
        error: error.to_string(),
    };
    emit(EVENT_EXCHANGE_FAILED, &event);
}

fn emit<E: Serialize + std::fmt::Debug>(name: &'static str, event: &E) {
    match serde_json::to_string(event) {
        Ok(payload) => info!(
            target: TARGET,
            event = name,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = name,
            %err,
            "failed to encode session event"
        ),
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
