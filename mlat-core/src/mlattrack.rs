//! The multilateration tracker: pairs up copies of the same message seen
//! by more than one receiver, clusters them by time, and passes them on
//! to the solver to derive positions.

use std::collections::HashMap;

use adsb_core::Icao;
use nalgebra::Matrix3;

use crate::blacklist::Blacklist;
use crate::clocknorm::{self, TimestampSample};
use crate::clockpair::ClockPair;
use crate::constants::{CAIR, FTOM, MLAT_DELAY};
use crate::geodesy::Ecef;
use crate::kalman::KalmanObservation;
use crate::pseudorange::PseudorangeLog;
use crate::receiver::{Receiver, ReceiverId};
use crate::solver::{self, Measurement};
use crate::tracker::Tracker;

/// Per-message-pending-resolve state, keyed by the raw message bytes so
/// that duplicate copies from different receivers land in one group.
struct MessageGroup {
    decoded: DecodedMlatMessage,
    first_seen: f64,
    ready_at: f64,
    copies: Vec<(ReceiverId, f64, f64)>,
}

/// The parts of a DF17 mlat-candidate message the tracker needs, decoded
/// by the caller (frame decoding lives in `adsb-core`, out of scope
/// here).
#[derive(Debug, Clone)]
pub struct DecodedMlatMessage {
    pub icao: Icao,
    pub altitude_ft: Option<i32>,
    pub squawk: Option<String>,
    pub callsign: Option<String>,
}

pub struct ResolveOutcome {
    pub icao: Icao,
    pub time: f64,
    pub ecef: Ecef,
    pub ecef_cov: Option<Matrix3<f64>>,
    pub receivers: Vec<ReceiverId>,
    pub distinct: u32,
    pub dof: i32,
    pub kalman_updated: bool,
}

pub struct MlatTracker {
    pending: HashMap<Vec<u8>, MessageGroup>,
    blacklist: Blacklist,
    pseudorange_log: Option<PseudorangeLog>,
}

impl MlatTracker {
    pub fn new(blacklist: Blacklist, pseudorange_log: Option<PseudorangeLog>) -> MlatTracker {
        MlatTracker {
            pending: HashMap::new(),
            blacklist,
            pseudorange_log,
        }
    }

    pub fn set_blacklist(&mut self, blacklist: Blacklist) {
        self.blacklist = blacklist;
    }

    pub fn set_pseudorange_log(&mut self, pseudorange_log: PseudorangeLog) {
        self.pseudorange_log = Some(pseudorange_log);
    }

    /// Record one receiver's copy of a candidate mlat message. The first
    /// copy opens a group due for resolve `MLAT_DELAY` seconds later;
    /// call [`MlatTracker::take_due`] periodically to pop groups once
    /// their delay has elapsed.
    pub fn receiver_mlat(
        &mut self,
        receiver_id: ReceiverId,
        timestamp: f64,
        raw: &[u8],
        decoded: DecodedMlatMessage,
        utc: f64,
        now: f64,
    ) {
        let group = self.pending.entry(raw.to_vec()).or_insert_with(|| MessageGroup {
            decoded,
            first_seen: utc,
            ready_at: now + MLAT_DELAY,
            copies: Vec::new(),
        });
        group.copies.push((receiver_id, timestamp, utc));
        group.first_seen = group.first_seen.min(utc);
    }

    /// Pop every group whose resolve delay has elapsed.
    fn take_due(&mut self, now: f64) -> Vec<MessageGroup> {
        let due_keys: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, g)| g.ready_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        due_keys
            .into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect()
    }

    /// Resolve every group that's come due, updating `tracker`'s aircraft
    /// state (Kalman filter, last-result bookkeeping) and returning one
    /// [`ResolveOutcome`] per successful solve.
    pub fn resolve_due(
        &mut self,
        tracker: &mut Tracker,
        clock_pairs: &HashMap<(ReceiverId, ReceiverId), ClockPair>,
        receivers: &HashMap<ReceiverId, Receiver>,
        now: f64,
    ) -> Vec<ResolveOutcome> {
        let due = self.take_due(now);
        let mut outcomes = Vec::new();
        for group in due {
            if let Some(outcome) = self.resolve_one(group, tracker, clock_pairs, receivers) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    fn resolve_one(
        &mut self,
        group: MessageGroup,
        tracker: &mut Tracker,
        clock_pairs: &HashMap<(ReceiverId, ReceiverId), ClockPair>,
        receivers: &HashMap<ReceiverId, Receiver>,
    ) -> Option<ResolveOutcome> {
        if group.copies.len() < 3 {
            return None;
        }

        let icao = group.decoded.icao;
        let ac = tracker.aircraft.get_mut(&icao)?;
        ac.mlat_message_count += 1;
        if !ac.allow_mlat {
            return None;
        }

        if let Some(alt_ft) = group.decoded.altitude_ft {
            ac.altitude_m = Some(alt_ft as f64 * FTOM);
            ac.last_altitude_time = Some(group.first_seen);
        }
        if let Some(squawk) = &group.decoded.squawk {
            ac.squawk = Some(squawk.clone());
        }
        if let Some(callsign) = &group.decoded.callsign {
            ac.callsign = Some(callsign.clone());
        }

        let (last_position, last_var, last_dof, last_time) =
            match (ac.last_result_position, ac.last_result_time) {
                (Some(pos), Some(t)) if group.first_seen - t <= 120.0 => (
                    Some(pos),
                    ac.last_result_var.unwrap_or(1e9),
                    ac.last_result_dof.unwrap_or(-1),
                    t,
                ),
                _ => (None, 1e9, -1, group.first_seen - 120.0),
            };

        let altitude = ac.altitude_m;
        let altitude_dof = if altitude.is_some() { 1 } else { 0 };

        let mut timestamp_map: HashMap<ReceiverId, Vec<TimestampSample>> = HashMap::new();
        for &(receiver_id, timestamp, utc) in &group.copies {
            let Some(receiver) = receivers.get(&receiver_id) else {
                continue;
            };
            if self.blacklist.contains(&receiver.user) {
                continue;
            }
            timestamp_map
                .entry(receiver_id)
                .or_default()
                .push(TimestampSample { timestamp, utc });
        }

        let dof = timestamp_map.len() as i32 + altitude_dof - 4;
        if dof < 0 {
            return None;
        }

        let elapsed_since_last = group.first_seen - last_time;
        if elapsed_since_last < 2.0 && dof == last_dof {
            return None;
        }
        if dof < last_dof && elapsed_since_last < 15.0 {
            return None;
        }

        let components = clocknorm::normalize(receivers, clock_pairs, &timestamp_map);

        let min_component_size = (4 - altitude_dof) as usize;
        let mut clusters = Vec::new();
        for component in &components {
            if component.len() >= min_component_size {
                clusters.extend(cluster_timestamps(component, receivers, min_component_size));
            }
        }
        if clusters.is_empty() {
            return None;
        }

        clusters.sort_by(|a, b| {
            a.distinct
                .cmp(&b.distinct)
                .then(a.first_seen.partial_cmp(&b.first_seen).unwrap())
        });

        let mut accepted: Option<(Cluster, Ecef, Option<Matrix3<f64>>, f64, i32)> = None;
        while let Some(cluster) = clusters.pop() {
            let elapsed = cluster.first_seen - last_time;
            let cluster_dof = cluster.distinct as i32 + altitude_dof - 4;

            if elapsed < 10.0 && cluster_dof < last_dof {
                break;
            }
            if elapsed < (MLAT_DELAY - 0.5) && cluster_dof == last_dof {
                break;
            }

            let altitude_error = if group.decoded.altitude_ft.is_some() {
                Some(250.0 * FTOM)
            } else if let (Some(_), Some(last_alt_time)) = (altitude, ac.last_altitude_time) {
                Some((250.0 + (cluster.first_seen - last_alt_time) * 70.0) * FTOM)
            } else {
                None
            };

            let mut entries: Vec<(Ecef, f64, f64)> = cluster
                .entries
                .iter()
                .map(|e| (e.position, e.timestamp, e.variance))
                .collect();
            entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            let measurements: Vec<Measurement> = solver::build_measurements(&entries);

            let initial_guess = last_position.unwrap_or(cluster.entries[0].position);
            let Some(result) = solver::solve(
                &measurements,
                altitude,
                altitude_error.unwrap_or(1000.0),
                initial_guess,
            ) else {
                continue;
            };

            let var_est = result
                .covariance
                .map(|c| c.trace())
                .unwrap_or(100e6);
            if var_est > 100e6 {
                continue;
            }
            if elapsed < 2.0 && var_est > last_var * 1.1 {
                continue;
            }

            accepted = Some((cluster, result.position, result.covariance, var_est, cluster_dof));
            break;
        }

        let (cluster, ecef, ecef_cov, var_est, dof) = accepted?;

        ac.last_result_position = Some(ecef);
        ac.last_result_var = Some(var_est);
        ac.last_result_dof = Some(dof);
        ac.last_result_distinct = Some(cluster.distinct);
        ac.last_result_time = Some(cluster.first_seen);
        ac.mlat_result_count += 1;

        let receiver_positions: Vec<Ecef> = cluster.entries.iter().map(|e| e.position).collect();
        let pseudoranges: Vec<f64> = cluster
            .entries
            .iter()
            .map(|e| e.timestamp * CAIR)
            .collect();
        let observation = KalmanObservation {
            receiver_positions: &receiver_positions,
            pseudoranges: &pseudoranges,
            variance: cluster.entries.first().map(|e| e.variance).unwrap_or(1e-12),
            altitude_m: altitude,
            altitude_error_m: 250.0 * FTOM,
            now: cluster.first_seen,
        };
        let kalman_updated = ac.kalman.update(dof, &observation);
        if kalman_updated {
            ac.mlat_kalman_count += 1;
        }

        let contributing: Vec<ReceiverId> = cluster.entries.iter().map(|e| e.receiver_id).collect();

        if let Some(log) = &mut self.pseudorange_log {
            let entries: Vec<(Ecef, f64, f64)> = cluster
                .entries
                .iter()
                .map(|e| (e.position, e.timestamp, e.variance))
                .collect();
            let _ = log.record(
                icao,
                cluster.first_seen,
                ecef,
                ecef_cov,
                cluster.distinct,
                dof,
                &entries,
                altitude,
                Some(250.0 * FTOM),
            );
        }

        Some(ResolveOutcome {
            icao,
            time: cluster.first_seen,
            ecef,
            ecef_cov,
            receivers: contributing,
            distinct: cluster.distinct,
            dof,
            kalman_updated,
        })
    }
}

struct ClusterEntry {
    receiver_id: ReceiverId,
    position: Ecef,
    timestamp: f64,
    variance: f64,
    utc: f64,
}

struct Cluster {
    distinct: u32,
    first_seen: f64,
    entries: Vec<ClusterEntry>,
}

/// Break one clock-normalized component into clusters of timestamps that
/// are plausibly copies of the same transmission, per receiver-to-
/// receiver range-implied delay bounds.
fn cluster_timestamps(
    component: &HashMap<ReceiverId, (f64, Vec<TimestampSample>)>,
    receivers: &HashMap<ReceiverId, Receiver>,
    min_receivers: usize,
) -> Vec<Cluster> {
    let mut flat: Vec<ClusterEntry> = Vec::new();
    for (&receiver_id, (variance, samples)) in component {
        let Some(receiver) = receivers.get(&receiver_id) else {
            continue;
        };
        for sample in samples {
            flat.push(ClusterEntry {
                receiver_id,
                position: receiver.position_ecef,
                timestamp: sample.timestamp,
                variance: *variance,
                utc: sample.utc,
            });
        }
    }
    flat.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap());
    if flat.is_empty() {
        return Vec::new();
    }

    // Rough split into groups with <2ms inter-item spacing, to bound the
    // O(n^2) fine clustering pass below.
    let mut groups: Vec<Vec<ClusterEntry>> = Vec::new();
    let mut current: Vec<ClusterEntry> = Vec::new();
    for entry in flat {
        if let Some(last) = current.last() {
            if entry.timestamp - last.timestamp > 2e-3 {
                groups.push(std::mem::take(&mut current));
            }
        }
        current.push(entry);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let mut clusters = Vec::new();
    for mut group in groups {
        while group.len() >= min_receivers {
            let Some(head) = group.pop() else { break };
            let last_timestamp = head.timestamp;
            let mut first_seen = head.utc;
            let mut distinct = 1u32;
            let mut cluster_entries = vec![head];

            let mut i = group.len();
            while i > 0 {
                i -= 1;
                let candidate = &group[i];
                if last_timestamp - candidate.timestamp > 2e-3 {
                    break;
                }

                let mut can_cluster = true;
                let mut is_distinct = true;
                for existing in &cluster_entries {
                    if existing.receiver_id == candidate.receiver_id {
                        can_cluster = false;
                        break;
                    }
                    let d = receivers
                        .get(&existing.receiver_id)
                        .and_then(|r| r.distance.get(&candidate.receiver_id))
                        .copied()
                        .unwrap_or(f64::MAX);
                    let max_delta = (d * 1.05 + 1e3) / CAIR;
                    if (existing.timestamp - candidate.timestamp).abs() > max_delta {
                        can_cluster = false;
                        break;
                    }
                    if d < 1e3 {
                        is_distinct = false;
                    }
                }

                if can_cluster {
                    let candidate = group.remove(i);
                    first_seen = first_seen.min(candidate.utc);
                    if is_distinct {
                        distinct += 1;
                    }
                    cluster_entries.push(candidate);
                }
            }

            if distinct as usize >= min_receivers {
                cluster_entries.reverse();
                clusters.push(Cluster {
                    distinct,
                    first_seen,
                    entries: cluster_entries,
                });
            }
        }
    }
    clusters
}
