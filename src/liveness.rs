//! The liveness sweep: the cursor-driven ping/reap pass described in §4.5.
//!
//! Unlike the multiplexer's event-driven dispatch, this is cadence-driven —
//! the caller decides how often `tick` runs (see `can_serial_gatewayd`).

use std::sync::{Arc, Mutex};

use mio::unix::SourceFd;

use crate::gateway::GatewayState;
use crate::protocol;
use crate::vport;

/// Touches at most one port per call, per §4.5:
///
/// - on the first call of a sweep (`ping_cursor == 0`) it broadcasts an
///   untargeted discovery solicit, unconditionally (this is how discovery of
///   the very first node bootstraps, before any port exists), and advances
///   the cursor;
/// - once the cursor runs past the last real slot, it resets to 0 and
///   returns without touching a port — the next call starts a fresh sweep
///   with another broadcast;
/// - otherwise the port at the cursor is pinged if `ping_credit < 2` and
///   decremented, or reaped outright at `ping_credit == 0` (without
///   advancing the cursor, since the reap-shift moves the next port into
///   this slot).
pub fn tick(state: &Arc<Mutex<GatewayState>>) {
    let mut st = state.lock().unwrap();

    if st.ping_cursor == 0 {
        broadcast_solicit(&st);
        st.ping_cursor = 1;
        return;
    }

    if st.ping_cursor > st.table.port_count() {
        st.ping_cursor = 0;
        return;
    }

    let idx = st.ping_cursor;
    let credit = st
        .table
        .get(idx)
        .expect("cursor bounds checked above")
        .ping_credit;

    if credit == 0 {
        let entry = st.table.reap(idx);
        let _ = st.registry.deregister(&mut SourceFd(&entry.master_fd));
        vport::close_vport(&st.watcher, entry);
        return;
    }

    if credit < 2 {
        let can_id = st.table.get(idx).expect("index just looked up").can_id;
        send_targeted_solicit(&st, can_id);
    }

    st.table
        .get_mut(idx)
        .expect("index just looked up")
        .ping_credit -= 1;
    st.ping_cursor += 1;
}

fn broadcast_solicit(st: &GatewayState) {
    let payload: [u8; 0] = [];
    match crate::frame::CanFrame::new(protocol::UUID, &payload) {
        Ok(frame) => {
            if let Err(e) = st.bus.send(&frame) {
                log::warn!("failed to send broadcast discovery solicit: {e}");
            }
        }
        Err(e) => log::warn!("failed to build broadcast solicit frame: {e}"),
    }
}

fn send_targeted_solicit(st: &GatewayState, target_ctl_id: u32) {
    let payload = protocol::encode_uuid_solicit(target_ctl_id);
    match crate::frame::CanFrame::new(protocol::UUID, &payload) {
        Ok(frame) => {
            if let Err(e) = st.bus.send(&frame) {
                log::warn!("failed to send targeted discovery solicit: {e}");
            }
        }
        Err(e) => log::warn!("failed to build targeted solicit frame: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Config;
    use crate::socket::CanBus;
    use crate::table::PortTable;
    use crate::watch::Watcher;
    use std::os::unix::io::AsRawFd;

    // Constructing a `GatewayState` without real bus hardware needs a stand-in
    // fd for the bus: `/dev/null` accepts every write, which is all the
    // cursor/credit bookkeeping under test here ever asks of it.
    fn state_with_ports(n: u16) -> GatewayState {
        use std::os::unix::io::IntoRawFd;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        // leak the tempdir so symlink_dir stays valid for the state's lifetime.
        let dir_path = dir.into_path();

        let watcher = Watcher::new().unwrap();
        let null = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .unwrap();
        let bus = CanBus::for_test(null.into_raw_fd());
        let mut table = PortTable::new(bus.as_raw_fd());
        for i in 0..n {
            let uuid = [i as u8, 0, 0, 0, 0, 0];
            let port_number = i;
            let can_id = protocol::ctl_id(port_number);
            vport::open_vport(
                &mut table,
                &watcher,
                &dir_path,
                "ttyCAN0_",
                port_number,
                can_id,
                uuid,
                crate::table::PINGS_BEFORE_DISCONNECT,
            )
            .unwrap();
        }

        let poll = mio::Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        std::mem::forget(poll);

        GatewayState {
            bus,
            table,
            watcher,
            ping_cursor: 0,
            registry,
            config: Config {
                symlink_dir: dir_path,
                ..Config::default()
            },
        }
    }

    #[test]
    fn cursor_advances_and_decrements_credit() {
        let state = Arc::new(Mutex::new(state_with_ports(2)));
        tick(&state); // first tick: broadcast, cursor -> 1
        assert_eq!(state.lock().unwrap().ping_cursor, 1);

        let credit_before = state.lock().unwrap().table.get(1).unwrap().ping_credit;
        tick(&state);
        let credit_after = state.lock().unwrap().table.get(1).unwrap().ping_credit;
        assert_eq!(credit_after, credit_before - 1);
        assert_eq!(state.lock().unwrap().ping_cursor, 2);
    }

    #[test]
    fn cursor_stays_bounded_and_cycles_with_a_single_port() {
        let state = Arc::new(Mutex::new(state_with_ports(1)));
        // with one real port the cursor cycles 0 (idle, next call
        // broadcasts) -> 1 (visits the port) -> 2 (past the table) -> 0 ...
        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            tick(&state);
            let cursor = state.lock().unwrap().ping_cursor;
            assert!(cursor <= 2);
            seen.insert(cursor);
        }
        assert_eq!(seen, [0, 1, 2].into_iter().collect());
    }

    #[test]
    fn zero_credit_reaps_the_port() {
        let state = Arc::new(Mutex::new(state_with_ports(1)));
        tick(&state); // broadcast
        {
            let mut st = state.lock().unwrap();
            st.table.get_mut(1).unwrap().ping_credit = 0;
        }
        tick(&state);
        assert_eq!(state.lock().unwrap().table.port_count(), 0);
    }
}
