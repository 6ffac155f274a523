//! Receiver registry entries.
//!
//! Receivers and aircraft live in owning arenas keyed by a stable id;
//! membership sets hold ids rather than pointers, sidestepping the cyclic
//! reference graph the original's object model has (receiver <-> aircraft).

use std::collections::{HashMap, HashSet};

use adsb_core::Icao;
use uuid::Uuid;

use crate::clock::Clock;
use crate::geodesy::{Ecef, Llh};

/// Stable identifier for a connected receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(pub Uuid);

/// A connected receiver station.
#[derive(Debug, Clone)]
pub struct Receiver {
    pub id: ReceiverId,
    pub user: String,
    pub position_llh: Llh,
    pub position_ecef: Ecef,
    pub clock: Clock,
    pub privacy: bool,

    /// Set `true` on disconnect; sync-point contributor lists are not
    /// eagerly cleaned up, so readers must check this before using a
    /// cached receiver reference.
    pub dead: bool,

    /// Aircraft this receiver currently reports seeing.
    pub tracking: HashSet<Icao>,
    /// Aircraft this receiver is wanted for, for clock sync.
    pub sync_interest: HashSet<Icao>,
    /// Aircraft this receiver is wanted for, for multilateration.
    pub mlat_interest: HashSet<Icao>,
    /// Aircraft for which traffic is currently requested from this
    /// receiver (the last set pushed via `Connection::request_traffic`).
    pub requested: HashSet<Icao>,

    pub sync_count: u64,
    /// Latest message-rate report, ICAO -> messages/sec. `None` for a
    /// legacy receiver that never sends one.
    pub last_rate_report: Option<HashMap<Icao, f64>>,

    /// Precomputed distance to every other registered receiver, metres.
    pub distance: HashMap<ReceiverId, f64>,
}

impl Receiver {
    pub fn new(
        id: ReceiverId,
        user: String,
        position_llh: Llh,
        clock: Clock,
        privacy: bool,
    ) -> Receiver {
        let position_ecef = crate::geodesy::llh2ecef(position_llh);
        Receiver {
            id,
            user,
            position_llh,
            position_ecef,
            clock,
            privacy,
            dead: false,
            tracking: HashSet::new(),
            sync_interest: HashSet::new(),
            mlat_interest: HashSet::new(),
            requested: HashSet::new(),
            sync_count: 0,
            last_rate_report: None,
            distance: HashMap::new(),
        }
    }
}
