//! Matches up DF17 position message pairs seen by multiple receivers and
//! feeds them to the pairwise clock models.
//!
//! A "sync point" is a specific pair of even/odd position messages
//! (identified by their raw bytes) together with every receiver that
//! reported seeing both of them. When a second (or third, ...) receiver
//! reports the same pair, every new-vs-existing receiver combination
//! gets a clock sync update. Sync points are kept around for
//! [`SYNCPOINT_LIFETIME`] seconds to catch stragglers, then discarded.

use std::collections::HashMap;

use adsb_core::types::PositionMsg;
use adsb_core::{cpr, Icao};

use crate::clockpair::ClockPair;
use crate::constants::{CAIR, MAX_INTERMESSAGE_RANGE, MAX_RANGE, MIN_NUC};
use crate::geodesy::{ecef_distance, llh2ecef, Ecef};
use crate::receiver::{Receiver, ReceiverId};

/// How long a sync point stays open for more receivers to join, seconds.
pub const SYNCPOINT_LIFETIME: f64 = 2.0;
/// How often stale clock pairings are pruned, seconds.
pub const PAIR_CLEANUP_INTERVAL: f64 = 30.0;
/// Maximum arrival-time spread (in receiver clock ticks / clock.freq) for
/// the two halves of a sync candidate to still be considered a pair.
const MAX_PAIR_SPREAD_S: f64 = 5.0;
/// Tolerance for matching a new observation's interval against an
/// existing sync point's, seconds.
const INTERVAL_MATCH_TOLERANCE: f64 = 1e-3;

type SyncKey = (Vec<u8>, Vec<u8>);

struct SyncPoint {
    pos_a: Ecef,
    pos_b: Ecef,
    interval: f64,
    ready_at: f64,
    /// `(receiver, t_a, t_b, synced_with_anyone)`.
    receivers: Vec<(ReceiverId, f64, f64, bool)>,
}

/// One receiver's half of a candidate sync message pair, already
/// decoded and quality-checked by the caller.
pub struct SyncCandidate<'a> {
    pub raw: &'a [u8],
    pub position: &'a PositionMsg,
    pub time: f64,
}

pub struct ClockTracker {
    sync_points: HashMap<SyncKey, Vec<SyncPoint>>,
    clock_pairs: HashMap<(ReceiverId, ReceiverId), ClockPair>,
}

impl Default for ClockTracker {
    fn default() -> ClockTracker {
        ClockTracker::new()
    }
}

impl ClockTracker {
    pub fn new() -> ClockTracker {
        ClockTracker {
            sync_points: HashMap::new(),
            clock_pairs: HashMap::new(),
        }
    }

    /// Drop all clock pairings involving `receiver_id`, immediately. Used
    /// both on disconnect and on an explicit clock reset (e.g. the input
    /// reconnected and its clock epoch is no longer comparable). Pending
    /// sync points mentioning the receiver are left alone; the `dead`
    /// flag on the receiver itself is what keeps them from being used.
    pub fn receiver_gone(&mut self, receiver_id: ReceiverId) {
        self.clock_pairs
            .retain(|&(a, b), _| a != receiver_id && b != receiver_id);
    }

    /// Feed a candidate even/odd message pair from `receiver_id`. Returns
    /// `true` if the pair was usable (matched an existing sync point or
    /// passed validation and started a new one).
    pub fn receiver_sync(
        &mut self,
        receiver_id: ReceiverId,
        receivers: &HashMap<ReceiverId, Receiver>,
        even: &SyncCandidate,
        odd: &SyncCandidate,
        now: f64,
    ) -> bool {
        let Some(receiver) = receivers.get(&receiver_id) else {
            return false;
        };
        if receiver.dead {
            return false;
        }

        if (even.time - odd.time).abs() / receiver.clock.freq > MAX_PAIR_SPREAD_S {
            return false;
        }

        let (t_a, t_b, key): (f64, f64, SyncKey) = if even.time < odd.time {
            (even.time, odd.time, (even.raw.to_vec(), odd.raw.to_vec()))
        } else {
            (odd.time, even.time, (odd.raw.to_vec(), even.raw.to_vec()))
        };
        let interval = (t_b - t_a) / receiver.clock.freq;

        if let Some(candidates) = self.sync_points.get_mut(&key) {
            if let Some(point) = candidates
                .iter_mut()
                .find(|p| (p.interval - interval).abs() < INTERVAL_MATCH_TOLERANCE)
            {
                add_to_syncpoint(
                    point,
                    receiver_id,
                    t_a,
                    t_b,
                    receivers,
                    &mut self.clock_pairs,
                    now,
                );
                return true;
            }
        }

        // No existing match: validate and maybe open a new sync point.
        if even.position.icao != odd.position.icao {
            return false;
        }
        if even.position.nuc < MIN_NUC || odd.position.nuc < MIN_NUC {
            return false;
        }
        let (Some(alt_even_ft), Some(alt_odd_ft)) =
            (even.position.altitude_ft, odd.position.altitude_ft)
        else {
            return false;
        };
        if (alt_even_ft - alt_odd_ft).unsigned_abs() > 5000 {
            return false;
        }

        // `global_decode` returns whichever of the two frames is fresher
        // (by its t_even/t_odd ordering), so to recover both positions we
        // call it twice, forcing each frame to be the "fresher" one in
        // turn while preserving the real arrival-time gap for its
        // pair-age check.
        let gap = (even.time - odd.time).abs();
        let Some((lat_even, lon_even)) = cpr::global_decode(
            even.position.cpr_lat,
            even.position.cpr_lon,
            odd.position.cpr_lat,
            odd.position.cpr_lon,
            gap,
            0.0,
        ) else {
            return false;
        };
        let Some((lat_odd, lon_odd)) = cpr::global_decode(
            even.position.cpr_lat,
            even.position.cpr_lon,
            odd.position.cpr_lat,
            odd.position.cpr_lon,
            0.0,
            gap,
        ) else {
            return false;
        };

        let even_ecef = llh2ecef((
            lat_even,
            lon_even,
            alt_even_ft as f64 * crate::constants::FTOM,
        ));
        if ecef_distance(even_ecef, receiver.position_ecef) > MAX_RANGE {
            return false;
        }

        let odd_ecef = llh2ecef((
            lat_odd,
            lon_odd,
            alt_odd_ft as f64 * crate::constants::FTOM,
        ));
        if ecef_distance(odd_ecef, receiver.position_ecef) > MAX_RANGE {
            return false;
        }

        if ecef_distance(even_ecef, odd_ecef) > MAX_INTERMESSAGE_RANGE {
            return false;
        }

        let (pos_a, pos_b) = if even.time < odd.time {
            (even_ecef, odd_ecef)
        } else {
            (odd_ecef, even_ecef)
        };

        let point = SyncPoint {
            pos_a,
            pos_b,
            interval,
            ready_at: now + SYNCPOINT_LIFETIME,
            receivers: vec![(receiver_id, t_a, t_b, false)],
        };
        self.sync_points.entry(key).or_default().push(point);
        true
    }

    /// Remove sync points whose lifetime has elapsed, returning the
    /// receiver ids that should have `sync_count` incremented (those that
    /// successfully synced with at least one other receiver via the
    /// point).
    pub fn expire_syncpoints(&mut self, now: f64) -> Vec<ReceiverId> {
        let mut synced = Vec::new();
        self.sync_points.retain(|_, points| {
            points.retain(|p| {
                if p.ready_at > now {
                    return true;
                }
                for &(rid, _, _, was_synced) in &p.receivers {
                    if was_synced {
                        synced.push(rid);
                    }
                }
                false
            });
            !points.is_empty()
        });
        synced
    }

    /// Drop clock pairings that haven't seen an accepted update within
    /// their staleness window. Call roughly every
    /// [`PAIR_CLEANUP_INTERVAL`] seconds.
    pub fn expire_pairs(&mut self, now: f64) {
        self.clock_pairs.retain(|_, pair| !pair.is_expired(now));

        // ClockPair accumulates its error estimate over a rolling ~60s
        // window made of two 30s buckets; rotate them in step with our
        // own cleanup cadence.
        for pair in self.clock_pairs.values_mut() {
            pair.periodic_update();
        }
    }

    pub fn clock_pair(&self, a: ReceiverId, b: ReceiverId) -> Option<&ClockPair> {
        self.clock_pairs.get(&pair_key(a, b))
    }

    /// The full clock-pair map, for feeding [`crate::clocknorm::normalize`].
    pub fn clock_pairs(&self) -> &HashMap<(ReceiverId, ReceiverId), ClockPair> {
        &self.clock_pairs
    }

    /// Per-peer clock state for `receiver_id`, for status/debug dumps:
    /// `peer -> (sync_count, error_us, drift_ppm)`.
    pub fn dump_receiver_state(&self, receiver_id: ReceiverId) -> HashMap<ReceiverId, (u32, f64, f64)> {
        let mut out = HashMap::new();
        for (&(a, b), pair) in &self.clock_pairs {
            if pair.sync_count() < 2 {
                continue;
            }
            let peer = if a == receiver_id {
                Some(b)
            } else if b == receiver_id {
                Some(a)
            } else {
                None
            };
            if let Some(peer) = peer {
                let drift = if a == receiver_id { pair.drift() } else { pair.i_drift() };
                out.insert(peer, (pair.sync_count(), pair.error() * 1e6, drift * 1e6));
            }
        }
        out
    }
}

fn pair_key(a: ReceiverId, b: ReceiverId) -> (ReceiverId, ReceiverId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

#[allow(clippy::too_many_arguments)]
fn add_to_syncpoint(
    point: &mut SyncPoint,
    r0: ReceiverId,
    t0a: f64,
    t0b: f64,
    receivers: &HashMap<ReceiverId, Receiver>,
    clock_pairs: &mut HashMap<(ReceiverId, ReceiverId), ClockPair>,
    now: f64,
) {
    let mut r0_synced = false;
    let mut newly_synced = Vec::new();

    for &mut (r1, t1a, t1b, ref mut r1_synced) in point.receivers.iter_mut() {
        if r0 == r1 {
            continue;
        }
        let Some(peer) = receivers.get(&r1) else {
            continue;
        };
        if peer.dead {
            continue;
        }

        let ((base, base_a, base_b), (peer_r, peer_a, peer_b)) = if r0 < r1 {
            ((r0, t0a, t0b), (r1, t1a, t1b))
        } else {
            ((r1, t1a, t1b), (r0, t0a, t0b))
        };

        if do_sync(
            clock_pairs,
            point.pos_a,
            point.pos_b,
            base,
            base_a,
            base_b,
            peer_r,
            peer_a,
            peer_b,
            receivers,
            now,
        ) {
            r0_synced = true;
            *r1_synced = true;
            newly_synced.push(r1);
        }
    }

    let _ = newly_synced;
    point.receivers.push((r0, t0a, t0b, r0_synced));
}

#[allow(clippy::too_many_arguments)]
fn do_sync(
    clock_pairs: &mut HashMap<(ReceiverId, ReceiverId), ClockPair>,
    pos_a: Ecef,
    pos_b: Ecef,
    r0: ReceiverId,
    t0a: f64,
    t0b: f64,
    r1: ReceiverId,
    t1a: f64,
    t1b: f64,
    receivers: &HashMap<ReceiverId, Receiver>,
    now: f64,
) -> bool {
    let (Some(recv0), Some(recv1)) = (receivers.get(&r0), receivers.get(&r1)) else {
        return false;
    };

    let delay0a = ecef_distance(pos_a, recv0.position_ecef) * recv0.clock.freq / CAIR;
    let delay0b = ecef_distance(pos_b, recv0.position_ecef) * recv0.clock.freq / CAIR;
    let delay1a = ecef_distance(pos_a, recv1.position_ecef) * recv1.clock.freq / CAIR;
    let delay1b = ecef_distance(pos_b, recv1.position_ecef) * recv1.clock.freq / CAIR;

    let i0 = (t0b - delay0b) - (t0a - delay0a);
    let i1 = (t1b - delay1b) - (t1a - delay1a);

    let base_ts = t0b - delay0b;
    let peer_ts = t1b - delay1b;

    let pair = clock_pairs
        .entry(pair_key(r0, r1))
        .or_insert_with(|| ClockPair::new(&recv0.clock, &recv1.clock));

    if !pair.is_new(base_ts) {
        return true;
    }

    pair.update(base_ts, peer_ts, i0, i1, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use uuid::Uuid;

    fn recv(n: u8, lat: f64, lon: f64) -> (ReceiverId, Receiver) {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        let id = ReceiverId(Uuid::from_bytes(bytes));
        (
            id,
            Receiver::new(
                id,
                format!("r{n}"),
                (lat, lon, 0.0),
                Clock::from_type("radarcape_gps").unwrap(),
                false,
            ),
        )
    }

    fn position(icao: Icao, cpr_lat: u32, cpr_lon: u32, odd: bool, t: f64) -> PositionMsg {
        PositionMsg {
            icao,
            altitude_ft: Some(35000),
            cpr_lat,
            cpr_lon,
            cpr_odd: odd,
            surveillance_status: 0,
            timestamp: t,
            is_surface: false,
            nuc: 7,
        }
    }

    #[test]
    fn mismatched_icao_is_rejected() {
        let mut ct = ClockTracker::new();
        let mut receivers = HashMap::new();
        let (id, r) = recv(1, 52.0, 4.0);
        receivers.insert(id, r);

        let even_pos = position([1, 2, 3], 93000, 51372, false, 1.0);
        let odd_pos = position([9, 9, 9], 74158, 50194, true, 0.0);
        let even = SyncCandidate {
            raw: b"even",
            position: &even_pos,
            time: 1.0,
        };
        let odd = SyncCandidate {
            raw: b"odd",
            position: &odd_pos,
            time: 0.0,
        };
        assert!(!ct.receiver_sync(id, &receivers, &even, &odd, 0.0));
    }

    #[test]
    fn low_nuc_is_rejected() {
        let mut ct = ClockTracker::new();
        let mut receivers = HashMap::new();
        let (id, r) = recv(1, 52.0, 4.0);
        receivers.insert(id, r);

        let mut even_pos = position([1, 2, 3], 93000, 51372, false, 1.0);
        even_pos.nuc = 2;
        let odd_pos = position([1, 2, 3], 74158, 50194, true, 0.0);
        let even = SyncCandidate {
            raw: b"even",
            position: &even_pos,
            time: 1.0,
        };
        let odd = SyncCandidate {
            raw: b"odd",
            position: &odd_pos,
            time: 0.0,
        };
        assert!(!ct.receiver_sync(id, &receivers, &even, &odd, 0.0));
    }

    #[test]
    fn receiver_gone_drops_its_pairings() {
        let mut ct = ClockTracker::new();
        let (id_a, ra) = recv(1, 52.0, 4.0);
        let (id_b, rb) = recv(2, 52.01, 4.0);
        ct.clock_pairs
            .insert(pair_key(id_a, id_b), ClockPair::new(&ra.clock, &rb.clock));
        assert!(ct.clock_pair(id_a, id_b).is_some());
        ct.receiver_gone(id_a);
        assert!(ct.clock_pair(id_a, id_b).is_none());
    }

    #[test]
    fn expire_pairs_removes_stale_entries() {
        let mut ct = ClockTracker::new();
        let (id_a, ra) = recv(1, 52.0, 4.0);
        let (id_b, rb) = recv(2, 52.01, 4.0);
        let mut pair = ClockPair::new(&ra.clock, &rb.clock);
        pair.update(0.0, 0.0, 1.0, 1.0, 0.0);
        ct.clock_pairs.insert(pair_key(id_a, id_b), pair);

        ct.expire_pairs(10.0);
        assert!(ct.clock_pair(id_a, id_b).is_some());
        ct.expire_pairs(200.0);
        assert!(ct.clock_pair(id_a, id_b).is_none());
    }
}
