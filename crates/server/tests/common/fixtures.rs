//! Test fixtures for generating test data.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use spool_core::UploadId;
use spool_server::{EventHub, EventKind, FnListener, UploadEvent};
use std::sync::{Arc, Mutex};

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// `Upload-Checksum` value for data using SHA-256.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn sha256_checksum(data: &[u8]) -> String {
    format!("sha256 {}", STANDARD.encode(Sha256::digest(data)))
}

/// Base64 encoding for `Upload-Metadata` values.
#[allow(dead_code)]
pub fn b64(value: &str) -> String {
    STANDARD.encode(value)
}

/// Events seen by a recording listener.
#[allow(dead_code)]
pub type EventLog = Arc<Mutex<Vec<(EventKind, UploadId)>>>;

/// Subscribe a listener that records every event kind and upload id.
#[allow(dead_code)]
pub fn record_events(hub: &EventHub) -> EventLog {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    hub.subscribe(Arc::new(FnListener::new(
        "recorder",
        move |event: &UploadEvent| {
            sink.lock().unwrap().push((event.kind, event.record.id));
            Ok(())
        },
    )));
    log
}

/// Event kinds recorded for one upload, in order.
#[allow(dead_code)]
pub fn kinds_for(log: &EventLog, id: &UploadId) -> Vec<EventKind> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(_, event_id)| event_id == id)
        .map(|(kind, _)| *kind)
        .collect()
}
