//! Core multilateration engine: clock synchronization, TDOA solving, and
//! the aircraft/receiver bookkeeping that ties them together. No network
//! I/O lives here; `mlat-server` drives this crate from its own
//! connection handling and owns the event loop.

pub mod blacklist;
pub mod clock;
pub mod clocknorm;
pub mod clockpair;
pub mod clocktrack;
pub mod connection;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod geodesy;
pub mod kalman;
pub mod mlattrack;
pub mod pseudorange;
pub mod receiver;
pub mod snapshot;
pub mod solver;
pub mod tracker;

pub use blacklist::Blacklist;
pub use clock::{Clock, Epoch};
pub use clockpair::ClockPair;
pub use clocktrack::{ClockTracker, SyncCandidate};
pub use connection::{Connection, OutputHandler};
pub use coordinator::{Coordinator, NewReceiver};
pub use error::{MlatError, Result};
pub use geodesy::{Ecef, Llh};
pub use kalman::{DerivedState, Kalman, KalmanObservation};
pub use mlattrack::{DecodedMlatMessage, MlatTracker, ResolveOutcome};
pub use pseudorange::PseudorangeLog;
pub use receiver::{Receiver, ReceiverId};
pub use tracker::{Tracker, TrackedAircraft};
