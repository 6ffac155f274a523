//! Top-level wiring: the receiver registry, the dispatch surface every
//! connection handler calls into, and the periodic housekeeping (sync
//! point expiry, resolve polling, interest refresh, state snapshots)
//! that would otherwise be an asyncio event loop's collection of
//! `call_later`s. Callers drive time explicitly via [`Coordinator::tick`]
//! instead.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use adsb_core::Icao;
use nalgebra::Matrix3;

use crate::blacklist::Blacklist;
use crate::clock::Clock;
use crate::clocktrack::{ClockTracker, SyncCandidate};
use crate::connection::{Connection, OutputHandler};
use crate::error::{MlatError, Result};
use crate::geodesy::{ecef_distance, Ecef, Llh};
use crate::kalman::DerivedState;
use crate::mlattrack::{DecodedMlatMessage, MlatTracker, ResolveOutcome};
use crate::pseudorange::PseudorangeLog;
use crate::receiver::{Receiver, ReceiverId};
use crate::snapshot::{
    self, AircraftSnapshot, AircraftSnapshotEntry, LocationsSnapshot, LocationsSnapshotEntry,
    PeerSyncState, SyncSnapshot, SyncSnapshotEntry,
};
use crate::tracker::Tracker;

/// Debounce delay between an interest-set change and the traffic request
/// that announces it, seconds. Matches the reference server's
/// `call_later(15.0, ...)`.
const INTEREST_REFRESH_DELAY: f64 = 15.0;
/// How often state snapshot files are rewritten, seconds.
const STATE_WRITE_INTERVAL: f64 = 30.0;
/// How often stale clock pairings are pruned, seconds.
const PAIR_CLEANUP_INTERVAL: f64 = 30.0;

/// Everything needed to register a newly connected receiver.
pub struct NewReceiver {
    pub id: ReceiverId,
    pub user: String,
    pub position_llh: Llh,
    pub clock_type: String,
    pub privacy: bool,
}

/// Owns the receiver registry and fans inbound events from connection
/// handlers out to the clock/tracker/mlat subsystems, then fans results
/// and traffic requests back out through [`Connection`]/[`OutputHandler`].
pub struct Coordinator {
    work_dir: PathBuf,
    partition_index: u32,
    partition_count: u32,

    receivers: HashMap<ReceiverId, Receiver>,
    connections: HashMap<ReceiverId, Box<dyn Connection>>,

    tracker: Tracker,
    clock_tracker: ClockTracker,
    mlat_tracker: MlatTracker,
    output_handlers: Vec<Box<dyn OutputHandler>>,

    refresh_due: HashMap<ReceiverId, f64>,
    next_state_write: f64,
    next_pair_cleanup: f64,
}

impl Coordinator {
    pub fn new(work_dir: impl Into<PathBuf>, partition_index: u32, partition_count: u32) -> Coordinator {
        Coordinator {
            work_dir: work_dir.into(),
            partition_index,
            partition_count,
            receivers: HashMap::new(),
            connections: HashMap::new(),
            tracker: Tracker::new(partition_index, partition_count),
            clock_tracker: ClockTracker::new(),
            mlat_tracker: MlatTracker::new(Blacklist::empty(), None),
            output_handlers: Vec::new(),
            refresh_due: HashMap::new(),
            next_state_write: STATE_WRITE_INTERVAL,
            next_pair_cleanup: PAIR_CLEANUP_INTERVAL,
        }
    }

    pub fn add_output_handler(&mut self, handler: Box<dyn OutputHandler>) {
        self.output_handlers.push(handler);
    }

    pub fn enable_pseudorange_log(&mut self, log: PseudorangeLog) {
        self.mlat_tracker.set_pseudorange_log(log);
    }

    pub fn reload_blacklist(&mut self, path: &Path) -> Result<()> {
        self.mlat_tracker.set_blacklist(Blacklist::load(path)?);
        Ok(())
    }

    pub fn receivers(&self) -> &HashMap<ReceiverId, Receiver> {
        &self.receivers
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Register a newly connected receiver. Fails if `id` is already
    /// registered (reconnect races should disconnect the old session
    /// first) or the clock type is unrecognized.
    pub fn new_receiver(&mut self, spec: NewReceiver, connection: Box<dyn Connection>) -> Result<()> {
        if self.receivers.contains_key(&spec.id) {
            return Err(MlatError::DuplicateUser(spec.user));
        }
        let clock = Clock::from_type(&spec.clock_type)?;
        let mut receiver = Receiver::new(spec.id, spec.user, spec.position_llh, clock, spec.privacy);
        self.compute_interstation_distances(&mut receiver);
        self.receivers.insert(spec.id, receiver);
        self.connections.insert(spec.id, connection);
        Ok(())
    }

    fn compute_interstation_distances(&mut self, receiver: &mut Receiver) {
        for other in self.receivers.values_mut() {
            let d = ecef_distance(receiver.position_ecef, other.position_ecef);
            receiver.distance.insert(other.id, d);
            other.distance.insert(receiver.id, d);
        }
    }

    /// Note that a receiver has moved; recomputes every pairwise distance
    /// touching it.
    pub fn receiver_location_update(&mut self, id: ReceiverId, position_llh: Llh) {
        let Some(mut receiver) = self.receivers.remove(&id) else {
            return;
        };
        receiver.position_llh = position_llh;
        receiver.position_ecef = crate::geodesy::llh2ecef(position_llh);
        for other in self.receivers.values_mut() {
            other.distance.remove(&id);
        }
        self.compute_interstation_distances(&mut receiver);
        self.receivers.insert(id, receiver);
    }

    pub fn receiver_disconnect(&mut self, id: ReceiverId) {
        let Some(mut receiver) = self.receivers.remove(&id) else {
            return;
        };
        receiver.dead = true;
        self.tracker.remove_all(&mut receiver);
        self.clock_tracker.receiver_gone(id);
        self.connections.remove(&id);
        self.refresh_due.remove(&id);
        for other in self.receivers.values_mut() {
            other.distance.remove(&id);
        }
    }

    pub fn receiver_tracking_add(&mut self, id: ReceiverId, icaos: &HashSet<Icao>, now: f64) {
        let Some(mut receiver) = self.receivers.remove(&id) else {
            return;
        };
        self.tracker.add(&mut receiver, icaos);
        let legacy = receiver.last_rate_report.is_none();
        self.receivers.insert(id, receiver);
        if legacy {
            self.update_interest(id, now);
        }
    }

    pub fn receiver_tracking_remove(&mut self, id: ReceiverId, icaos: &HashSet<Icao>, now: f64) {
        let Some(mut receiver) = self.receivers.remove(&id) else {
            return;
        };
        self.tracker.remove(&mut receiver, icaos);
        let legacy = receiver.last_rate_report.is_none();
        self.receivers.insert(id, receiver);
        if legacy {
            self.update_interest(id, now);
        }
    }

    pub fn receiver_clock_reset(&mut self, id: ReceiverId) {
        self.clock_tracker.receiver_gone(id);
    }

    pub fn receiver_rate_report(&mut self, id: ReceiverId, report: HashMap<Icao, f64>, now: f64) {
        if let Some(receiver) = self.receivers.get_mut(&id) {
            receiver.last_rate_report = Some(report);
        }
        self.update_interest(id, now);
    }

    fn update_interest(&mut self, id: ReceiverId, now: f64) {
        let Some(receiver) = self.receivers.get(&id) else {
            return;
        };
        let (new_sync, new_mlat) = self.tracker.compute_interest(receiver, &self.receivers);
        self.tracker.apply_interest_sets(&mut self.receivers, id, new_sync, new_mlat);
        self.refresh_due.insert(id, now + INTEREST_REFRESH_DELAY);
    }

    fn refresh_traffic_requests(&mut self, id: ReceiverId) {
        let Some(receiver) = self.receivers.get(&id) else {
            return;
        };
        let requested: HashSet<Icao> = receiver
            .tracking
            .iter()
            .copied()
            .filter(|icao| self.tracker.aircraft.get(icao).map(|ac| ac.interesting()).unwrap_or(false))
            .collect();
        if let Some(r) = self.receivers.get_mut(&id) {
            r.requested = requested.clone();
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.request_traffic(id, &requested);
        }
    }

    /// Feed one half of a candidate even/odd DF17 position pair.
    pub fn receiver_sync(
        &mut self,
        id: ReceiverId,
        even: &SyncCandidate,
        odd: &SyncCandidate,
        now: f64,
    ) -> bool {
        let synced = self.clock_tracker.receiver_sync(id, &self.receivers, even, odd, now);
        if synced {
            if let Some(r) = self.receivers.get_mut(&id) {
                r.sync_count += 1;
            }
        }
        synced
    }

    /// Feed one receiver's copy of a candidate mlat message.
    #[allow(clippy::too_many_arguments)]
    pub fn receiver_mlat(
        &mut self,
        id: ReceiverId,
        timestamp: f64,
        raw: &[u8],
        decoded: DecodedMlatMessage,
        utc: f64,
        now: f64,
    ) {
        self.mlat_tracker.receiver_mlat(id, timestamp, raw, decoded, utc, now);
    }

    /// Drive every poll-based subsystem forward to `now`: expires sync
    /// points and stale clock pairs, resolves due mlat message groups and
    /// forwards their results, fires debounced traffic-request refreshes,
    /// and periodically rewrites the state snapshot files.
    pub fn tick(&mut self, now: f64) {
        let synced = self.clock_tracker.expire_syncpoints(now);
        let _ = synced;

        if now >= self.next_pair_cleanup {
            self.clock_tracker.expire_pairs(now);
            self.next_pair_cleanup = now + PAIR_CLEANUP_INTERVAL;
        }

        let outcomes = self
            .mlat_tracker
            .resolve_due(&mut self.tracker, self.clock_tracker.clock_pairs(), &self.receivers, now);
        for outcome in outcomes {
            self.forward_result(outcome);
        }

        let due: Vec<ReceiverId> = self
            .refresh_due
            .iter()
            .filter(|&(_, &t)| t <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            self.refresh_due.remove(&id);
            self.refresh_traffic_requests(id);
        }

        if now >= self.next_state_write {
            if let Err(e) = self.write_state(now) {
                tracing::warn!(error = %e, "failed to write state snapshot");
            }
            self.next_state_write = now + STATE_WRITE_INTERVAL;
        }
    }

    /// Broadcast one resolved position to every receiver that has ever
    /// contributed a successful mlat result for this aircraft, plus every
    /// registered output handler.
    fn forward_result(&mut self, outcome: ResolveOutcome) {
        let ResolveOutcome {
            icao,
            time,
            ecef,
            ecef_cov,
            receivers: contributing,
            distinct,
            dof,
            kalman_updated,
        } = outcome;

        if let Some(ac) = self.tracker.aircraft.get_mut(&icao) {
            for &rid in &contributing {
                ac.successful_mlat.insert(rid);
            }
        }

        let broadcast: Vec<ReceiverId> = self
            .tracker
            .aircraft
            .get(&icao)
            .map(|ac| ac.successful_mlat.iter().copied().collect())
            .unwrap_or_else(|| contributing.clone());

        let derived: Option<DerivedState> = if kalman_updated {
            self.tracker.aircraft.get(&icao).map(|ac| ac.kalman.derived())
        } else {
            None
        };

        for &rid in &broadcast {
            if let Some(conn) = self.connections.get_mut(&rid) {
                conn.report_mlat_position(
                    rid,
                    time,
                    icao,
                    ecef,
                    ecef_cov,
                    &contributing,
                    distinct,
                    dof,
                    derived.as_ref(),
                );
            }
        }
        for handler in self.output_handlers.iter_mut() {
            handler.handle_result(time, icao, ecef, ecef_cov, &contributing, distinct, dof, derived.as_ref());
        }
    }

    fn write_state(&self, now: f64) -> Result<()> {
        let mut aircraft_state: AircraftSnapshot = HashMap::new();
        for ac in self.tracker.aircraft.values() {
            let mut entry = AircraftSnapshotEntry {
                interesting: ac.interesting(),
                allow_mlat: ac.allow_mlat,
                tracking: ac.tracking.len(),
                sync_interest: ac.sync_interest.len(),
                mlat_interest: ac.mlat_interest.len(),
                mlat_message_count: ac.mlat_message_count,
                mlat_result_count: ac.mlat_result_count,
                mlat_kalman_count: ac.mlat_kalman_count,
                ..Default::default()
            };
            if let Some(t) = ac.last_result_time {
                if ac.kalman.valid() {
                    let derived = ac.kalman.derived();
                    entry.last_result = Some(now - t);
                    entry.lat = Some(derived.position_llh.0);
                    entry.lon = Some(derived.position_llh.1);
                    entry.alt = Some(derived.position_llh.2 * crate::constants::MTOF);
                    entry.heading = Some(derived.heading_deg);
                    entry.speed = Some(derived.ground_speed_ms * crate::constants::MS_TO_KTS);
                }
            }
            aircraft_state.insert(adsb_core::icao_to_string(&ac.icao), entry);
        }

        let mut sync: SyncSnapshot = HashMap::new();
        let mut locations: LocationsSnapshot = HashMap::new();
        for r in self.receivers.values() {
            let peers: HashMap<String, PeerSyncState> = self
                .clock_tracker
                .dump_receiver_state(r.id)
                .into_iter()
                .map(|(peer, (count, error_us, drift_ppm))| {
                    (peer.0.to_string(), PeerSyncState { sync_count: count, error_us, drift_ppm })
                })
                .collect();
            sync.insert(r.id.0.to_string(), SyncSnapshotEntry { peers });
            locations.insert(
                r.id.0.to_string(),
                LocationsSnapshotEntry {
                    user: r.user.clone(),
                    lat: r.position_llh.0,
                    lon: r.position_llh.1,
                    alt: r.position_llh.2,
                    privacy: r.privacy,
                },
            );
        }

        snapshot::write_atomic(&self.work_dir.join("sync.json"), &sync)?;
        snapshot::write_atomic(&self.work_dir.join("locations.json"), &locations)?;
        snapshot::write_atomic(&self.work_dir.join("aircraft.json"), &aircraft_state)?;
        Ok(())
    }
}

#[cfg(test)]
mod scenarios {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use adsb_core::types::PositionMsg;
    use adsb_core::cpr;
    use uuid::Uuid;

    use crate::constants::CAIR;
    use crate::geodesy::{ecef_distance, llh2ecef};

    fn rid(n: u8) -> ReceiverId {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        ReceiverId(Uuid::from_bytes(bytes))
    }

    #[derive(Default)]
    struct Recorder {
        traffic_requests: Vec<(ReceiverId, HashSet<Icao>)>,
        reports: Vec<(ReceiverId, Icao, u32, i32)>,
        output_calls: Vec<(Icao, Ecef, u32, i32)>,
    }

    struct TestConnection {
        id: ReceiverId,
        log: Rc<RefCell<Recorder>>,
    }

    impl Connection for TestConnection {
        fn request_traffic(&mut self, receiver_id: ReceiverId, icaos: &HashSet<Icao>) {
            self.log.borrow_mut().traffic_requests.push((receiver_id, icaos.clone()));
        }

        fn report_mlat_position(
            &mut self,
            receiver_id: ReceiverId,
            _receive_timestamp: f64,
            address: Icao,
            _ecef: Ecef,
            _ecef_cov: Option<Matrix3<f64>>,
            _receivers: &[ReceiverId],
            distinct: u32,
            dof: i32,
            _kalman: Option<&DerivedState>,
        ) {
            self.log.borrow_mut().reports.push((receiver_id, address, distinct, dof));
        }
        // Suppress the "unused field" concern: `id` is read by the test
        // that constructs each connection to label its recorded calls.
    }

    impl TestConnection {
        fn new(id: ReceiverId, log: Rc<RefCell<Recorder>>) -> TestConnection {
            TestConnection { id, log }
        }
    }

    struct TestOutputHandler {
        log: Rc<RefCell<Recorder>>,
    }

    impl OutputHandler for TestOutputHandler {
        fn handle_result(
            &mut self,
            _receive_timestamp: f64,
            address: Icao,
            ecef: Ecef,
            _ecef_cov: Option<Matrix3<f64>>,
            _receivers: &[ReceiverId],
            distinct: u32,
            dof: i32,
            _kalman: Option<&DerivedState>,
        ) {
            self.log.borrow_mut().output_calls.push((address, ecef, distinct, dof));
        }
    }

    fn add_receiver(
        coordinator: &mut Coordinator,
        log: &Rc<RefCell<Recorder>>,
        n: u8,
        llh: Llh,
        clock_type: &str,
    ) -> ReceiverId {
        let id = rid(n);
        coordinator
            .new_receiver(
                NewReceiver {
                    id,
                    user: format!("r{n}"),
                    position_llh: llh,
                    clock_type: clock_type.to_string(),
                    privacy: false,
                },
                Box::new(TestConnection::new(id, log.clone())),
            )
            .unwrap();
        id
    }

    /// Minimal CPR encoder, the inverse of `adsb_core::cpr::global_decode`,
    /// used only to build test fixtures with a known, chosen position
    /// rather than depending on literature test vectors we can't steer.
    fn encode_cpr(lat: f64, lon: f64, odd: bool) -> (u32, u32) {
        const CPR_MAX: f64 = 131072.0;
        let dlat = if odd { 360.0 / 59.0 } else { 360.0 / 60.0 };
        let lat_mod = lat.rem_euclid(dlat);
        let yz = ((CPR_MAX * lat_mod / dlat) + 0.5).floor() as i64 % 131072;

        let nl_val = cpr::nl(lat).max(1);
        let ni = (nl_val - if odd { 1 } else { 0 }).max(1);
        let dlon = 360.0 / ni as f64;
        let lon_mod = lon.rem_euclid(dlon);
        let xz = ((CPR_MAX * lon_mod / dlon) + 0.5).floor() as i64 % 131072;

        (yz.rem_euclid(131072) as u32, xz.rem_euclid(131072) as u32)
    }

    fn position_msg(icao: Icao, lat: f64, lon: f64, alt_ft: i32, odd: bool, t: f64) -> PositionMsg {
        let (cpr_lat, cpr_lon) = encode_cpr(lat, lon, odd);
        PositionMsg {
            icao,
            altitude_ft: Some(alt_ft),
            cpr_lat,
            cpr_lon,
            cpr_odd: odd,
            surveillance_status: 0,
            timestamp: t,
            is_surface: false,
            nuc: 7,
        }
    }

    /// Ticks a receiver with `clock_freq` would observe for a broadcast at
    /// `broadcast_time` (seconds, common reference) from `target`, given
    /// perfect propagation and zero receiver clock offset.
    fn ticks_for(target: Ecef, receiver_pos: Ecef, broadcast_time: f64, clock_freq: f64) -> f64 {
        broadcast_time * clock_freq + ecef_distance(target, receiver_pos) * clock_freq / CAIR
    }

    #[test]
    fn sync_point_formation_builds_a_valid_clock_pair() {
        let log = Rc::new(RefCell::new(Recorder::default()));
        let mut coordinator = Coordinator::new("/tmp/mlat-scenario-1", 1, 1);
        let r1 = add_receiver(&mut coordinator, &log, 1, (52.0, 4.0, 0.0), "radarcape_gps");
        let r2 = add_receiver(&mut coordinator, &log, 2, (52.45, 4.0, 0.0), "radarcape_gps");

        let icao = [0x48, 0x40, 0xD6];
        let lat = 52.2;
        let lon = 4.05;
        let alt_ft = 35000;
        let target = llh2ecef((lat, lon, alt_ft as f64 * crate::constants::FTOM));
        let r1_pos = llh2ecef((52.0, 4.0, 0.0));
        let r2_pos = llh2ecef((52.45, 4.0, 0.0));
        let freq = 1e9;

        assert!(coordinator.clock_tracker.clock_pair(r1, r2).is_none());

        for round in 0..3u32 {
            let t_even = 1000.0 + round as f64 * 10.0;
            let t_odd = t_even + 0.3;

            let even_msg = position_msg(icao, lat, lon, alt_ft, false, t_even);
            let odd_msg = position_msg(icao, lat, lon, alt_ft, true, t_odd);

            let r1_even = ticks_for(target, r1_pos, t_even, freq);
            let r1_odd = ticks_for(target, r1_pos, t_odd, freq);
            let r2_even = ticks_for(target, r2_pos, t_even, freq);
            let r2_odd = ticks_for(target, r2_pos, t_odd, freq);

            let raw_even = format!("even{round}").into_bytes();
            let raw_odd = format!("odd{round}").into_bytes();

            let even1 = SyncCandidate { raw: &raw_even, position: &even_msg, time: r1_even };
            let odd1 = SyncCandidate { raw: &raw_odd, position: &odd_msg, time: r1_odd };
            assert!(coordinator.receiver_sync(r1, &even1, &odd1, round as f64));

            let even2 = SyncCandidate { raw: &raw_even, position: &even_msg, time: r2_even };
            let odd2 = SyncCandidate { raw: &raw_odd, position: &odd_msg, time: r2_odd };
            assert!(coordinator.receiver_sync(r2, &even2, &odd2, round as f64));

            assert!(coordinator.clock_tracker.clock_pair(r1, r2).is_some());
        }

        let pair = coordinator.clock_tracker.clock_pair(r1, r2).unwrap();
        assert!(pair.valid(), "clock pair should be valid after several consistent sync pairs");
    }

    #[test]
    fn interest_promotion_schedules_a_traffic_refresh() {
        let log = Rc::new(RefCell::new(Recorder::default()));
        let mut coordinator = Coordinator::new("/tmp/mlat-scenario-2", 1, 1);
        let r1 = add_receiver(&mut coordinator, &log, 1, (52.0, 4.0, 0.0), "beast");
        let icao = [0x40, 0x62, 0x1D];

        coordinator.receiver_tracking_add(r1, &HashSet::from([icao]), 0.0);
        assert!(log.borrow().traffic_requests.is_empty(), "no refresh yet, still debounced");

        let r2 = add_receiver(&mut coordinator, &log, 2, (52.01, 4.0, 0.0), "beast");
        coordinator.receiver_tracking_add(r2, &HashSet::from([icao]), 0.0);

        assert!(coordinator.tracker().aircraft[&icao].sync_interest.contains(&r2));

        coordinator.tick(15.0);
        let recorded = log.borrow();
        assert!(
            recorded.traffic_requests.iter().any(|(id, icaos)| *id == r2 && icaos.contains(&icao)),
            "R2's debounced traffic request should have fired by +15s"
        );
    }

    fn square_receivers(coordinator: &mut Coordinator, log: &Rc<RefCell<Recorder>>) -> (Vec<ReceiverId>, Vec<Ecef>) {
        let half_lat = 50.0 / 111.32;
        let half_lon = 50.0 / (111.32 * 52.0f64.to_radians().cos());
        let positions = [
            (52.0 + half_lat, 4.0 - half_lon, 0.0),
            (52.0 + half_lat, 4.0 + half_lon, 0.0),
            (52.0 - half_lat, 4.0 + half_lon, 0.0),
            (52.0 - half_lat, 4.0 - half_lon, 0.0),
        ];
        let mut ids = Vec::new();
        let mut ecefs = Vec::new();
        for (i, &llh) in positions.iter().enumerate() {
            let id = add_receiver(coordinator, log, i as u8 + 1, llh, "radarcape_gps");
            ids.push(id);
            ecefs.push(llh2ecef(llh));
        }
        (ids, ecefs)
    }

    fn inject_copies(
        coordinator: &mut Coordinator,
        ids: &[ReceiverId],
        ecefs: &[Ecef],
        target: Ecef,
        icao: Icao,
        alt_ft: i32,
        raw: &[u8],
        jitter_ticks: f64,
        now: f64,
    ) {
        let freq = 1e9;
        for (i, (&id, &pos)) in ids.iter().zip(ecefs.iter()).enumerate() {
            let mut timestamp = ticks_for(target, pos, now, freq);
            if i == ids.len() - 1 {
                timestamp += jitter_ticks;
            }
            let decoded = DecodedMlatMessage {
                icao,
                altitude_ft: Some(alt_ft),
                squawk: None,
                callsign: None,
            };
            coordinator.receiver_mlat(id, timestamp, raw, decoded, now, now);
        }
    }

    #[test]
    fn mlat_happy_path_resolves_once_then_ratelimits_a_restale_repeat() {
        let log = Rc::new(RefCell::new(Recorder::default()));
        let mut coordinator = Coordinator::new("/tmp/mlat-scenario-3", 1, 1);
        coordinator.add_output_handler(Box::new(TestOutputHandler { log: log.clone() }));
        let (ids, ecefs) = square_receivers(&mut coordinator, &log);

        let icao = [0x48, 0x40, 0xD6];
        for &id in &ids {
            coordinator.receiver_tracking_add(id, &HashSet::from([icao]), 0.0);
        }

        let alt_ft = (10_000.0 / crate::constants::FTOM).round() as i32;
        let target = llh2ecef((52.0, 4.0, 10_000.0));

        inject_copies(&mut coordinator, &ids, &ecefs, target, icao, alt_ft, b"msg-a", 0.0, 0.0);
        coordinator.tick(2.5);

        {
            let recorded = log.borrow();
            assert_eq!(recorded.output_calls.len(), 1, "exactly one forward_results call");
            let (result_icao, ecef, distinct, dof) = recorded.output_calls[0];
            assert_eq!(result_icao, icao);
            assert_eq!(distinct, 4);
            assert!(dof >= 1);
            assert!(ecef_distance(ecef, target) < 200.0, "solved position should be within 200m of truth");
        }

        // A near-identical repeat one second later, jittered just enough on
        // one receiver to count as a fresh message but not enough to change
        // cluster membership: same dof, elapsed < 2s, so the dof ratelimit
        // (not the variance one) must suppress it.
        inject_copies(&mut coordinator, &ids, &ecefs, target, icao, alt_ft, b"msg-b", 20.0, 1.0);
        coordinator.tick(3.5);

        let recorded = log.borrow();
        assert_eq!(recorded.output_calls.len(), 1, "stale near-duplicate must not produce a second result");
    }

    #[test]
    fn disconnect_before_resolve_excludes_the_departed_receiver() {
        let log = Rc::new(RefCell::new(Recorder::default()));
        let mut coordinator = Coordinator::new("/tmp/mlat-scenario-5", 1, 1);
        coordinator.add_output_handler(Box::new(TestOutputHandler { log: log.clone() }));
        let (ids, ecefs) = square_receivers(&mut coordinator, &log);

        let icao = [0x48, 0x40, 0xD6];
        for &id in &ids {
            coordinator.receiver_tracking_add(id, &HashSet::from([icao]), 0.0);
        }

        let alt_ft = (10_000.0 / crate::constants::FTOM).round() as i32;
        let target = llh2ecef((52.0, 4.0, 10_000.0));
        inject_copies(&mut coordinator, &ids, &ecefs, target, icao, alt_ft, b"msg-c", 0.0, 0.0);

        let departed = ids[3];
        coordinator.receiver_disconnect(departed);
        assert!(!coordinator.receivers().contains_key(&departed));

        coordinator.tick(2.5);

        let recorded = log.borrow();
        assert_eq!(recorded.output_calls.len(), 1);
        let (_, _, distinct, _) = recorded.output_calls[0];
        assert_eq!(distinct, 3, "resolve should use only the three remaining receivers");
    }
}
