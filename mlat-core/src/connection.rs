//! Reverse-call interfaces between the Coordinator and the outside world.
//!
//! `Connection` is the Coordinator's view of one receiver session: it
//! never knows or cares whether that session is JSON-over-TCP,
//! binary-over-UDP, or a test double. `OutputHandler` is the same idea
//! for multilateration results: a sink the Coordinator fans results out
//! to, in registration order, without caring what it does with them.

use std::collections::HashSet;

use adsb_core::Icao;
use nalgebra::Matrix3;

use crate::geodesy::Ecef;
use crate::kalman::DerivedState;
use crate::receiver::ReceiverId;

/// The Coordinator's outward-facing handle to a connected receiver.
/// Implementations own the actual transport; nothing in `mlat-core`
/// assumes a particular wire format.
pub trait Connection {
    /// Declare the complete set of ICAO addresses this receiver should
    /// forward traffic for. Always the whole wanted set, never a delta.
    fn request_traffic(&mut self, receiver_id: ReceiverId, icaos: &HashSet<Icao>);

    /// Deliver one multilateration result for `receiver_id` to report
    /// onward (e.g. to a connected client). `kalman` is `None` when the
    /// aircraft's filter hasn't produced a valid estimate yet.
    fn report_mlat_position(
        &mut self,
        receiver_id: ReceiverId,
        receive_timestamp: f64,
        address: Icao,
        ecef: Ecef,
        ecef_cov: Option<Matrix3<f64>>,
        receivers: &[ReceiverId],
        distinct: u32,
        dof: i32,
        kalman: Option<&DerivedState>,
    );
}

/// A sink for multilateration results, invoked once per resolve for
/// every receiver that has ever contributed to this aircraft. Errors are
/// the implementation's own problem to log; a panic here would be a bug
/// in the handler, not in the engine, so handlers are expected to catch
/// their own failures internally.
pub trait OutputHandler {
    fn handle_result(
        &mut self,
        receive_timestamp: f64,
        address: Icao,
        ecef: Ecef,
        ecef_cov: Option<Matrix3<f64>>,
        receivers: &[ReceiverId],
        distinct: u32,
        dof: i32,
        kalman: Option<&DerivedState>,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingHandler {
        calls: Rc<RefCell<Vec<u32>>>,
    }

    impl OutputHandler for RecordingHandler {
        fn handle_result(
            &mut self,
            _receive_timestamp: f64,
            _address: Icao,
            _ecef: Ecef,
            _ecef_cov: Option<Matrix3<f64>>,
            _receivers: &[ReceiverId],
            distinct: u32,
            _dof: i32,
            _kalman: Option<&DerivedState>,
        ) {
            self.calls.borrow_mut().push(distinct);
        }
    }

    #[test]
    fn output_handler_trait_object_dispatches() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut handler: Box<dyn OutputHandler> = Box::new(RecordingHandler { calls: calls.clone() });
        handler.handle_result(0.0, [0, 0, 0], (0.0, 0.0, 0.0), None, &[], 4, 1, None);

        assert_eq!(*calls.borrow(), vec![4]);
    }
}
