//! The multiplexer: the single worker thread that turns bus frames, PTY
//! bytes and filesystem-watch events into port-table transitions (§4.4).
//!
//! The mutex is released for the one suspension point (`Poll::poll`) and
//! held for everything else, per §5 — there is no finer-grained locking.

use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mio::unix::SourceFd;
use mio::{Events, Interest, Token};

use crate::gateway::GatewayState;
use crate::protocol;
use crate::retry::ShouldRetry;
use crate::vport;
use crate::watch::WatchEventKind;

pub(crate) const BUS_TOKEN: Token = Token(usize::MAX);
pub(crate) const WATCH_TOKEN: Token = Token(usize::MAX - 1);

fn pty_token(master_fd: RawFd) -> Token {
    Token(master_fd as usize)
}

pub(crate) fn run(state: Arc<Mutex<GatewayState>>, shutdown: Arc<AtomicBool>, mut poll: mio::Poll) {
    let mut events = Events::with_capacity(64);

    while !shutdown.load(Ordering::Relaxed) {
        let timeout = {
            let st = state.lock().unwrap();
            st.config.poll_timeout
        };

        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("poll failed: {e}");
                continue;
            }
        }

        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let mut bus_ready = false;
        let mut watch_ready = false;
        let mut pty_ready: Vec<RawFd> = Vec::new();
        for event in events.iter() {
            match event.token() {
                BUS_TOKEN => bus_ready = true,
                WATCH_TOKEN => watch_ready = true,
                Token(raw) => pty_ready.push(raw as RawFd),
            }
        }

        let mut st = state.lock().unwrap();
        if bus_ready {
            dispatch_bus_frame(&mut st);
        }
        for fd in pty_ready {
            dispatch_pty_readable(&mut st, fd);
        }
        if watch_ready {
            dispatch_watch_events(&mut st);
        }
    }

    let mut st = state.lock().unwrap();
    while st.table.port_count() > 0 {
        let entry = st.table.reap(1);
        let _ = st
            .registry
            .deregister(&mut SourceFd(&entry.master_fd));
        vport::close_vport(&st.watcher, entry);
    }
}

/// Reads and dispatches exactly one frame off the bus (§4.4 step 4).
fn dispatch_bus_frame(st: &mut GatewayState) {
    let frame = match st.bus.recv() {
        Ok(frame) => frame,
        Err(e) if e.should_retry() => return,
        Err(e) => {
            log::warn!("bus read failed: {e}");
            return;
        }
    };

    if frame.id() == protocol::UUID_RESP {
        handle_uuid_resp(st, frame.data());
        return;
    }

    match st.table.find_by_can_id(frame.id() + 1) {
        Some(idx) => {
            let pings_before_disconnect = st.config.pings_before_disconnect;
            let entry = st.table.get_mut(idx).expect("index just looked up");
            entry.ping_credit = pings_before_disconnect;
            if !frame.is_empty() && entry.attached {
                write_to_master(entry.master_fd, frame.data());
            }
        }
        None => {
            // Lost handshake: re-solicit the node whose ctl_id this tx_id
            // corresponds to, so it re-announces its UUID.
            let target_ctl_id = frame.id() + 1;
            send_uuid_solicit(st, target_ctl_id);
        }
    }
}

fn handle_uuid_resp(st: &mut GatewayState, payload: &[u8]) {
    let uuid = match protocol::decode_uuid_resp(payload) {
        Some(uuid) => uuid,
        None => return,
    };

    let port_number = protocol::derive_port_number(&uuid, st.config.max_ports);
    let can_id = protocol::ctl_id(port_number);

    let already_known = st.table.find_by_port_number(port_number).is_some();

    let idx = match vport::open_vport(
        &mut st.table,
        &st.watcher,
        &st.config.symlink_dir,
        &st.config.symlink_prefix,
        port_number,
        can_id,
        uuid,
        st.config.pings_before_disconnect,
    ) {
        Ok(idx) => idx,
        Err(e) => {
            log::warn!("failed to open virtual port for {}: {e}", protocol::uuid_hex(&uuid));
            return;
        }
    };

    if !already_known {
        let master_fd = st.table.get(idx).expect("just pushed").master_fd;
        if let Err(e) = st
            .registry
            .register(&mut SourceFd(&master_fd), pty_token(master_fd), Interest::READABLE)
        {
            log::warn!("failed to register pty master fd with the poller: {e}");
        }
    }

    let payload = protocol::encode_set(can_id, &uuid);
    match crate::frame::CanFrame::new(protocol::SET, &payload) {
        Ok(frame) => {
            if let Err(e) = st.bus.send(&frame) {
                log::warn!("failed to send SET reply: {e}");
            }
        }
        Err(e) => log::warn!("failed to build SET frame: {e}"),
    }
}

fn send_uuid_solicit(st: &GatewayState, target_ctl_id: u32) {
    let payload = protocol::encode_uuid_solicit(target_ctl_id);
    match crate::frame::CanFrame::new(protocol::UUID, &payload) {
        Ok(frame) => {
            if let Err(e) = st.bus.send(&frame) {
                log::warn!("failed to send UUID solicit: {e}");
            }
        }
        Err(e) => log::warn!("failed to build UUID solicit frame: {e}"),
    }
}

/// Reads up to one CAN-data-sized chunk from a PTY master and forwards it as
/// a single frame (§4.4 step 5). `0x7E` anywhere in the chunk marks the node
/// as attached (the serial framing delimiter the host-side driver emits on
/// open).
fn dispatch_pty_readable(st: &mut GatewayState, master_fd: RawFd) {
    let idx = match st.table.find_by_master_fd(master_fd) {
        Some(idx) => idx,
        None => return,
    };

    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(master_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n <= 0 {
        return;
    }
    let n = n as usize;

    let can_id = {
        let entry = st.table.get_mut(idx).expect("index just looked up");
        if buf[..n].contains(&0x7E) {
            entry.attached = true;
        }
        entry.can_id
    };

    match crate::frame::CanFrame::new(can_id, &buf[..n]) {
        Ok(frame) => {
            if let Err(e) = st.bus.send(&frame) {
                log::warn!("failed to forward pty bytes to the bus: {e}");
            }
        }
        Err(e) => log::warn!("failed to build forwarding frame: {e}"),
    }
}

fn write_to_master(master_fd: RawFd, data: &[u8]) {
    let result = unsafe { libc::write(master_fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if result < 0 {
        let e = std::io::Error::last_os_error();
        if !e.should_retry() {
            log::warn!("write to pty master failed: {e}");
        }
    }
}

/// Drains every pending filesystem-watch event (§4.4 step 6), not just one —
/// a burst of opens/closes on the same watch must not be dropped between
/// poll wakeups.
fn dispatch_watch_events(st: &mut GatewayState) {
    for (handle, kind) in st.watcher.drain() {
        let idx = match st.table.find_by_watch_handle(handle) {
            Some(idx) => idx,
            None => continue,
        };

        let can_id = {
            let entry = st.table.get_mut(idx).expect("index just looked up");
            match kind {
                WatchEventKind::Open => entry.attached = true,
                WatchEventKind::Close => entry.attached = false,
            }
            entry.can_id
        };

        if kind == WatchEventKind::Open {
            send_uuid_solicit(st, can_id);
        }
    }
}
