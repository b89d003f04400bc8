//! The virtual-port factory: allocates a PTY pair, publishes the deterministic
//! symlink, registers the filesystem watch, and reverses all of that cleanly
//! on any failure partway through (§4.3).

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, unlockpt};

use crate::error::VportError;
use crate::protocol::{uuid_hex, Uuid};
use crate::table::{PortEntry, PortTable};
use crate::util;
use crate::watch::Watcher;

/// Computes the deterministic `/<dir>/<prefix><12 hex uuid digits>` path for
/// a node's published symlink.
pub fn symlink_path(dir: &Path, prefix: &str, uuid: &Uuid) -> PathBuf {
    dir.join(format!("{}{}", prefix, uuid_hex(uuid)))
}

/// Unwinds a partially-constructed virtual port on any failure after the PTY
/// pair has been allocated. Grounded on the teacher's `Drop for CANSocket`
/// pattern of tying OS resource release to a destructor instead of manual
/// bookkeeping at every fallible step.
struct VportGuard<'a> {
    watcher: &'a Watcher,
    master_fd: Option<RawFd>,
    symlink_path: Option<PathBuf>,
    watch_handle: Option<crate::watch::WatchHandle>,
}

impl<'a> VportGuard<'a> {
    fn new(watcher: &'a Watcher) -> Self {
        Self {
            watcher,
            master_fd: None,
            symlink_path: None,
            watch_handle: None,
        }
    }

    fn disarm(mut self) -> (RawFd, PathBuf, crate::watch::WatchHandle) {
        let master_fd = self.master_fd.take().expect("master fd set before disarm");
        let symlink_path = self.symlink_path.take().expect("symlink set before disarm");
        let watch_handle = self.watch_handle.take().expect("watch set before disarm");
        (master_fd, symlink_path, watch_handle)
    }
}

impl<'a> Drop for VportGuard<'a> {
    fn drop(&mut self) {
        if let Some(handle) = self.watch_handle.take() {
            let _ = self.watcher.unwatch(handle);
        }
        if let Some(path) = self.symlink_path.take() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(fd) = self.master_fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Allocates a virtual port for `uuid`/`port_number`, or — if a slot for this
/// `port_number` already exists — returns it unchanged (idempotent reset,
/// invariant 2).
pub fn open_vport(
    table: &mut PortTable,
    watcher: &Watcher,
    symlink_dir: &Path,
    symlink_prefix: &str,
    port_number: u16,
    can_id: u32,
    uuid: Uuid,
    pings_before_disconnect: u8,
) -> Result<usize, VportError> {
    if let Some(existing) = table.find_by_port_number(port_number) {
        return Ok(existing);
    }

    let mut guard = VportGuard::new(watcher);

    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(|e| {
        VportError::Pty(std::io::Error::from_raw_os_error(e as i32))
    })?;
    grantpt(&master).map_err(|e| VportError::Pty(std::io::Error::from_raw_os_error(e as i32)))?;
    unlockpt(&master).map_err(|e| VportError::Pty(std::io::Error::from_raw_os_error(e as i32)))?;

    let slave_path = nix::pty::ptsname_r(&master)
        .map_err(|e| VportError::Pty(std::io::Error::from_raw_os_error(e as i32)))?;
    let slave_path = PathBuf::from(slave_path);

    let master_fd = master.into_raw_fd();
    guard.master_fd = Some(master_fd);

    util::set_nonblocking(master_fd).map_err(VportError::Pty)?;
    util::set_close_on_exec(master_fd).map_err(VportError::Pty)?;

    std::fs::set_permissions(&slave_path, Permissions::from_mode(0o666)).map_err(|e| {
        VportError::Symlink {
            path: slave_path.clone(),
            source: e,
        }
    })?;

    let link_path = symlink_path(symlink_dir, symlink_prefix, &uuid);
    let _ = std::fs::remove_file(&link_path);
    std::os::unix::fs::symlink(&slave_path, &link_path).map_err(|e| VportError::Symlink {
        path: link_path.clone(),
        source: e,
    })?;
    guard.symlink_path = Some(link_path.clone());

    let watch_handle = watcher.watch(&link_path).map_err(VportError::Watch)?;
    guard.watch_handle = Some(watch_handle);

    let (master_fd, symlink_path, watch_handle) = guard.disarm();

    let entry = PortEntry {
        port_number,
        can_id,
        uuid,
        master_fd,
        symlink_path,
        watch_handle,
        attached: false,
        ping_credit: pings_before_disconnect,
    };

    Ok(table.push(entry))
}

/// Tears down a port's resources: watch, symlink, then both PTY ends (only
/// the master is owned here; the slave device node is closed by unlinking
/// the symlink and, transitively, by whichever host process has it open
/// releasing its own reference).
pub fn close_vport(watcher: &Watcher, entry: PortEntry) {
    let _ = watcher.unwatch(entry.watch_handle);
    let _ = std::fs::remove_file(&entry.symlink_path);
    unsafe {
        libc::close(entry.master_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::PINGS_BEFORE_DISCONNECT;
    use tempfile::tempdir;

    #[test]
    fn open_vport_publishes_symlink_and_registers_watch() {
        let dir = tempdir().unwrap();
        let watcher = Watcher::new().unwrap();
        let mut table = PortTable::new(-1);

        let uuid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let port_number = crate::protocol::derive_port_number(&uuid, crate::protocol::MAX_PORTS);
        let can_id = crate::protocol::ctl_id(port_number);
        let idx = open_vport(
            &mut table,
            &watcher,
            dir.path(),
            "ttyCAN0_",
            port_number,
            can_id,
            uuid,
            PINGS_BEFORE_DISCONNECT,
        )
        .unwrap();

        let entry = table.get(idx).unwrap();
        assert_eq!(entry.port_number, 7);
        assert_eq!(entry.can_id, 0x10e);
        assert!(entry.symlink_path.exists());
        assert_eq!(
            entry.symlink_path,
            dir.path().join("ttyCAN0_010203040506")
        );

        let entry = table.reap(idx);
        let path = entry.symlink_path.clone();
        close_vport(&watcher, entry);
        assert!(!path.exists());
    }

    #[test]
    fn rediscovery_of_same_port_number_is_idempotent() {
        let dir = tempdir().unwrap();
        let watcher = Watcher::new().unwrap();
        let mut table = PortTable::new(-1);

        let uuid_a = [1, 2, 3, 4, 5, 6];
        let port_number = crate::protocol::derive_port_number(&uuid_a, crate::protocol::MAX_PORTS);
        let can_id = crate::protocol::ctl_id(port_number);
        let idx_a = open_vport(
            &mut table,
            &watcher,
            dir.path(),
            "ttyCAN0_",
            port_number,
            can_id,
            uuid_a,
            PINGS_BEFORE_DISCONNECT,
        )
        .unwrap();

        // a different UUID that happens to derive the same port number —
        // re-discovery of the same logical slot, not a fresh one.
        let uuid_b = [9, 9, 9, 9, 9, 9];
        let idx_b = open_vport(
            &mut table,
            &watcher,
            dir.path(),
            "ttyCAN0_",
            port_number,
            can_id,
            uuid_b,
            PINGS_BEFORE_DISCONNECT,
        )
        .unwrap();

        assert_eq!(idx_a, idx_b);
        assert_eq!(table.port_count(), 1);
        // the original UUID (and thus symlink) is retained, not replaced.
        assert_eq!(table.get(idx_a).unwrap().uuid, uuid_a);
    }
}
