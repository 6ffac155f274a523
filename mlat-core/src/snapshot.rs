//! Periodic state snapshots: `sync.json`, `locations.json`,
//! `aircraft.json`. Written atomically (temp file + rename) so a reader
//! never observes a half-written file, mirroring the checkpoint pattern
//! `adsb-server`'s SQLite path uses for its own periodic writes.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Serialize)]
pub struct PeerSyncState {
    pub sync_count: u32,
    pub error_us: f64,
    pub drift_ppm: f64,
}

#[derive(Debug, Serialize, Default)]
pub struct SyncSnapshotEntry {
    pub peers: HashMap<String, PeerSyncState>,
}

pub type SyncSnapshot = HashMap<String, SyncSnapshotEntry>;

#[derive(Debug, Serialize)]
pub struct LocationsSnapshotEntry {
    pub user: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub privacy: bool,
}

pub type LocationsSnapshot = HashMap<String, LocationsSnapshotEntry>;

#[derive(Debug, Serialize, Default)]
pub struct AircraftSnapshotEntry {
    pub interesting: bool,
    pub allow_mlat: bool,
    pub tracking: usize,
    pub sync_interest: usize,
    pub mlat_interest: usize,
    pub mlat_message_count: u64,
    pub mlat_result_count: u64,
    pub mlat_kalman_count: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

pub type AircraftSnapshot = HashMap<String, AircraftSnapshotEntry>;

/// Serialize `value` to pretty JSON and write it to `path` atomically: a
/// sibling `.tmp` file is written first and renamed over the target, so
/// a reader never sees a partial write.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aircraft.json");

        let mut snapshot: AircraftSnapshot = HashMap::new();
        snapshot.insert(
            "4840D6".to_string(),
            AircraftSnapshotEntry {
                interesting: true,
                allow_mlat: true,
                tracking: 3,
                sync_interest: 1,
                mlat_interest: 2,
                mlat_message_count: 10,
                mlat_result_count: 2,
                mlat_kalman_count: 2,
                last_result: Some(1.5),
                lat: Some(52.0),
                lon: Some(4.0),
                alt: Some(10000.0),
                heading: Some(90.0),
                speed: Some(200.0),
            },
        );

        write_atomic(&path, &snapshot).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: HashMap<String, serde_json::Value> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["4840D6"]["tracking"], 3);
    }

    #[test]
    fn aircraft_entry_omits_absent_position_fields() {
        let entry = AircraftSnapshotEntry {
            interesting: false,
            allow_mlat: true,
            tracking: 1,
            sync_interest: 0,
            mlat_interest: 0,
            mlat_message_count: 0,
            mlat_result_count: 0,
            mlat_kalman_count: 0,
            last_result: None,
            lat: None,
            lon: None,
            alt: None,
            heading: None,
            speed: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("\"lat\""));
    }
}
