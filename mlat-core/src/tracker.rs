//! Per-aircraft visibility graph and per-receiver interest arbitration.
//!
//! Tracks which receivers can see which aircraft and works out which
//! aircraft each receiver should actually be asked to forward, to cap
//! bandwidth. Bad inputs (aircraft/receiver ids with no matching entry)
//! are silently ignored — there is no recoverable failure mode here.

use std::collections::{HashMap, HashSet};

use adsb_core::{icao_to_u32, Icao};

use crate::geodesy::Ecef;
use crate::kalman::Kalman;
use crate::receiver::{Receiver, ReceiverId};

/// A single tracked aircraft.
pub struct TrackedAircraft {
    pub icao: Icao,
    /// Allowed to be multilaterated: true iff this ICAO hashes into the
    /// local partition.
    pub allow_mlat: bool,

    pub tracking: HashSet<ReceiverId>,
    pub sync_interest: HashSet<ReceiverId>,
    pub mlat_interest: HashSet<ReceiverId>,
    pub successful_mlat: HashSet<ReceiverId>,

    pub mlat_message_count: u64,
    pub mlat_result_count: u64,
    pub mlat_kalman_count: u64,

    pub altitude_m: Option<f64>,
    pub last_altitude_time: Option<f64>,

    pub last_result_time: Option<f64>,
    pub last_result_position: Option<Ecef>,
    pub last_result_var: Option<f64>,
    pub last_result_distinct: Option<u32>,
    pub last_result_dof: Option<i32>,

    pub kalman: Kalman,

    pub callsign: Option<String>,
    pub squawk: Option<String>,
}

impl TrackedAircraft {
    fn new(icao: Icao, allow_mlat: bool) -> TrackedAircraft {
        TrackedAircraft {
            icao,
            allow_mlat,
            tracking: HashSet::new(),
            sync_interest: HashSet::new(),
            mlat_interest: HashSet::new(),
            successful_mlat: HashSet::new(),
            mlat_message_count: 0,
            mlat_result_count: 0,
            mlat_kalman_count: 0,
            altitude_m: None,
            last_altitude_time: None,
            last_result_time: None,
            last_result_position: None,
            last_result_var: None,
            last_result_distinct: None,
            last_result_dof: None,
            kalman: Kalman::new_ca(),
            callsign: None,
            squawk: None,
        }
    }

    /// Should we ask receivers to forward traffic for this aircraft?
    pub fn interesting(&self) -> bool {
        !self.sync_interest.is_empty() || (self.allow_mlat && self.mlat_interest.len() >= 3)
    }
}

/// Mixes a 24-bit ICAO address into a partition index. Two rounds of the
/// well-known `(h^(h>>16))*0x45d9f3b` mixer then a final xor-shift. Must
/// match exactly across servers for deterministic sharding.
fn mix_icao(icao: Icao) -> u32 {
    let mut h = icao_to_u32(&icao) as u64;
    h = ((h >> 16) ^ h).wrapping_mul(0x45d9f3b) & 0xFFFF_FFFF;
    h = ((h >> 16) ^ h).wrapping_mul(0x45d9f3b) & 0xFFFF_FFFF;
    h = (h >> 16) ^ h;
    h as u32
}

pub struct Tracker {
    pub aircraft: HashMap<Icao, TrackedAircraft>,
    partition_id: u32,
    partition_count: u32,
}

impl Tracker {
    /// `partition` is 1-indexed `(index, count)`, matching the `I/N` CLI
    /// convention (`1 <= index <= count`).
    pub fn new(partition_index: u32, partition_count: u32) -> Tracker {
        Tracker {
            aircraft: HashMap::new(),
            partition_id: partition_index.saturating_sub(1),
            partition_count,
        }
    }

    pub fn in_local_partition(&self, icao: Icao) -> bool {
        if self.partition_count <= 1 {
            return true;
        }
        (mix_icao(icao) % self.partition_count) == self.partition_id
    }

    /// Register `receiver` as tracking every ICAO in `icaos`, creating
    /// aircraft entries on demand.
    pub fn add(&mut self, receiver: &mut Receiver, icaos: &HashSet<Icao>) {
        for &icao in icaos {
            let allow_mlat = self.in_local_partition(icao);
            let ac = self
                .aircraft
                .entry(icao)
                .or_insert_with(|| TrackedAircraft::new(icao, allow_mlat));
            ac.tracking.insert(receiver.id);
            receiver.tracking.insert(icao);
        }
    }

    /// Remove `receiver` from the given aircraft's tracking sets;
    /// garbage-collects any aircraft left with no tracking receivers.
    pub fn remove(&mut self, receiver: &mut Receiver, icaos: &HashSet<Icao>) {
        for &icao in icaos {
            let Some(ac) = self.aircraft.get_mut(&icao) else {
                continue;
            };
            ac.tracking.remove(&receiver.id);
            ac.successful_mlat.remove(&receiver.id);
            receiver.tracking.remove(&icao);
            if ac.tracking.is_empty() {
                self.aircraft.remove(&icao);
            }
        }
    }

    /// Drop `receiver` entirely — used on disconnect.
    pub fn remove_all(&mut self, receiver: &mut Receiver) {
        for icao in receiver.tracking.iter().copied().collect::<Vec<_>>() {
            if let Some(ac) = self.aircraft.get_mut(&icao) {
                ac.tracking.remove(&receiver.id);
                ac.successful_mlat.remove(&receiver.id);
                ac.sync_interest.remove(&receiver.id);
                ac.mlat_interest.remove(&receiver.id);
                if ac.tracking.is_empty() {
                    self.aircraft.remove(&icao);
                }
            }
        }
        receiver.tracking.clear();
        receiver.sync_interest.clear();
        receiver.mlat_interest.clear();
    }

    /// Recompute `(sync_interest, mlat_interest)` for `receiver`. Pure
    /// function of current state; does not mutate anything. The caller
    /// applies the result via [`Tracker::apply_interest_sets`].
    pub fn compute_interest(
        &self,
        receiver: &Receiver,
        receivers: &HashMap<ReceiverId, Receiver>,
    ) -> (HashSet<Icao>, HashSet<Icao>) {
        let Some(rate_report) = &receiver.last_rate_report else {
            // Legacy client, no rate report: take a guess.
            let new_sync = receiver
                .tracking
                .iter()
                .filter(|icao| {
                    self.aircraft
                        .get(icao)
                        .map(|ac| ac.tracking.len() > 1)
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            let new_mlat = receiver
                .tracking
                .iter()
                .filter(|icao| self.aircraft.get(icao).map(|ac| ac.allow_mlat).unwrap_or(false))
                .copied()
                .collect();
            return (new_sync, new_mlat);
        };

        // Build rate-product tuples (rp, peer_id, icao) for aircraft this
        // receiver actually sees transmitting ADS-B at a usable rate.
        let mut ac_to_ratepairs: HashMap<Icao, Vec<(f64, ReceiverId)>> = HashMap::new();
        let mut ratepair_list: Vec<(f64, ReceiverId, Icao)> = Vec::new();

        for (&icao, &rate) in rate_report {
            if rate < 0.20 {
                continue;
            }
            let Some(ac) = self.aircraft.get(&icao) else {
                continue;
            };

            let entry = ac_to_ratepairs.entry(icao).or_default();
            for &peer_id in &ac.tracking {
                if peer_id == receiver.id {
                    continue;
                }
                let Some(peer) = receivers.get(&peer_id) else {
                    continue;
                };
                let rate1 = match &peer.last_rate_report {
                    None => 1.0,
                    Some(peer_rates) => peer_rates.get(&icao).copied().unwrap_or(0.0),
                };
                let rp = rate * rate1 / 4.0;
                if rp < 0.10 {
                    continue;
                }
                entry.push((rp, peer_id));
                ratepair_list.push((rp, peer_id, icao));
            }
        }

        ratepair_list.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let mut ntotal: HashMap<ReceiverId, f64> = HashMap::new();
        let mut new_sync = HashSet::new();
        for (_, r1, icao) in &ratepair_list {
            if new_sync.contains(icao) {
                continue;
            }
            if *ntotal.get(r1).unwrap_or(&0.0) < 1.0 {
                new_sync.insert(*icao);
                for &(rp2, r2) in &ac_to_ratepairs[icao] {
                    *ntotal.entry(r2).or_insert(0.0) += rp2;
                }
            }
        }

        // Mlat interest: tracked, not transmitting positions itself,
        // and within our partition.
        let new_mlat = receiver
            .tracking
            .iter()
            .filter(|icao| {
                !rate_report.contains_key(icao)
                    && self.aircraft.get(icao).map(|ac| ac.allow_mlat).unwrap_or(false)
            })
            .copied()
            .collect();

        (new_sync, new_mlat)
    }

    /// Atomically apply a new `(sync_interest, mlat_interest)` pair for
    /// `receiver_id`, maintaining the mirror-set invariant on both sides.
    pub fn apply_interest_sets(
        &mut self,
        receivers: &mut HashMap<ReceiverId, Receiver>,
        receiver_id: ReceiverId,
        new_sync: HashSet<Icao>,
        new_mlat: HashSet<Icao>,
    ) {
        let Some(receiver) = receivers.get_mut(&receiver_id) else {
            return;
        };

        for icao in receiver.sync_interest.difference(&new_sync).copied().collect::<Vec<_>>() {
            if let Some(ac) = self.aircraft.get_mut(&icao) {
                ac.sync_interest.remove(&receiver_id);
            }
        }
        for &icao in &new_sync {
            if let Some(ac) = self.aircraft.get_mut(&icao) {
                ac.sync_interest.insert(receiver_id);
            }
        }

        for icao in receiver.mlat_interest.difference(&new_mlat).copied().collect::<Vec<_>>() {
            if let Some(ac) = self.aircraft.get_mut(&icao) {
                ac.mlat_interest.remove(&receiver_id);
            }
        }
        for &icao in &new_mlat {
            if let Some(ac) = self.aircraft.get_mut(&icao) {
                ac.mlat_interest.insert(receiver_id);
            }
        }

        receiver.sync_interest = new_sync;
        receiver.mlat_interest = new_mlat;
    }
}
