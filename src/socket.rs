use std::mem::size_of;
use std::os::unix::prelude::*;
use std::time::Duration;

use crate::constants::{CAN_RAW, CAN_RAW_ERR_FILTER, CAN_RAW_FILTER, ERR_MASK, PF_CAN, SOL_CAN_RAW};
use crate::error::OpenError;
use crate::frame::{CanAddr, CanFilter, CanFrame};
use crate::util;

/// A bound, configured raw CAN socket.
///
/// Grounded on the teacher crate's `CANSocket`: open → resolve interface →
/// bind → configure, with the bind error path closing the raw fd before
/// propagating so no fd leaks on a failed `new()`.
pub struct CanBus {
    fd: RawFd,
}

impl CanBus {
    pub fn open(interface_name: &str) -> Result<Self, OpenError> {
        let interface_index =
            nix::net::if_::if_nametoindex(interface_name).map_err(OpenError::Lookup)?;

        let sock_fd = unsafe { libc::socket(PF_CAN, libc::SOCK_RAW, CAN_RAW) };
        if sock_fd == -1 {
            return Err(OpenError::Io(std::io::Error::last_os_error()));
        }

        let bind_result = unsafe {
            let addr = CanAddr::new(interface_index);
            let sockaddr_ptr = &addr as *const CanAddr;
            libc::bind(
                sock_fd,
                sockaddr_ptr as *const libc::sockaddr,
                size_of::<CanAddr>() as u32,
            )
        };

        if bind_result == -1 {
            let e = std::io::Error::last_os_error();
            unsafe {
                libc::close(sock_fd);
            }
            return Err(OpenError::Io(e));
        }

        Ok(Self { fd: sock_fd })
    }

    pub fn set_nonblocking(&self) -> std::io::Result<()> {
        util::set_nonblocking(self.fd)
    }

    /// Reads one frame. Blocks up to the configured receive timeout.
    pub fn recv(&self) -> std::io::Result<CanFrame> {
        let mut frame = CanFrame::default();
        let read_result = unsafe {
            let frame_ptr = &mut frame as *mut CanFrame;
            libc::read(self.fd, frame_ptr as *mut libc::c_void, size_of::<CanFrame>())
        };

        if read_result as usize != size_of::<CanFrame>() {
            return Err(std::io::Error::last_os_error());
        }

        Ok(frame)
    }

    /// Writes one frame. Frames are indivisible: a short write is an error,
    /// not a resumption point.
    pub fn send(&self, frame: &CanFrame) -> std::io::Result<()> {
        let write_result = unsafe {
            let frame_ptr = frame as *const CanFrame;
            libc::write(
                self.fd,
                frame_ptr as *const libc::c_void,
                size_of::<CanFrame>(),
            )
        };

        if write_result as usize != size_of::<CanFrame>() {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }

    /// Wraps an already-open fd as a `CanBus` for tests that need a
    /// `GatewayState` but not real bus traffic (the liveness sweep's cursor
    /// and credit bookkeeping, for instance). Takes ownership of `fd`.
    #[cfg(test)]
    pub(crate) fn for_test(fd: RawFd) -> Self {
        Self { fd }
    }

    fn close(&mut self) -> std::io::Result<()> {
        let result = unsafe { libc::close(self.fd) };

        if result == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn setup_filters(&self, filters: &[CanFilter]) -> std::io::Result<()> {
        let return_value = if filters.is_empty() {
            unsafe {
                libc::setsockopt(
                    self.fd,
                    SOL_CAN_RAW,
                    CAN_RAW_FILTER as libc::c_int,
                    std::ptr::null(),
                    0,
                )
            }
        } else {
            unsafe {
                let filters_ptr = &filters[0] as *const CanFilter;
                libc::setsockopt(
                    self.fd,
                    SOL_CAN_RAW,
                    CAN_RAW_FILTER as libc::c_int,
                    filters_ptr as *const libc::c_void,
                    (size_of::<CanFilter>() * filters.len()) as u32,
                )
            }
        };

        if return_value != 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn set_error_filter(&self, mask: u32) -> std::io::Result<()> {
        let result = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_CAN_RAW,
                CAN_RAW_ERR_FILTER as libc::c_int,
                (&mask as *const u32) as *const libc::c_void,
                size_of::<u32>() as u32,
            )
        };

        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn error_filter_drop_all(&self) -> std::io::Result<()> {
        self.set_error_filter(0)
    }

    pub fn error_filter_accept_all(&self) -> std::io::Result<()> {
        self.set_error_filter(ERR_MASK)
    }

    /// Sets the read timeout on the socket.
    pub fn set_read_timeout(&self, duration: Duration) -> std::io::Result<()> {
        util::set_socket_option(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &util::c_timeval_new(duration),
        )
    }

    /// Sets the write timeout on the socket.
    pub fn set_write_timeout(&self, duration: Duration) -> std::io::Result<()> {
        util::set_socket_option(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            &util::c_timeval_new(duration),
        )
    }

    /// Sets the kernel send buffer size. Setting this to zero forces writes
    /// to block (rather than silently drop frames) once any queue fills.
    pub fn set_send_buffer_size(&self, bytes: i32) -> std::io::Result<()> {
        util::set_socket_option(self.fd, libc::SOL_SOCKET, libc::SO_SNDBUF, &bytes)
    }

    /// Sets the kernel receive buffer size.
    pub fn set_recv_buffer_size(&self, bytes: i32) -> std::io::Result<()> {
        util::set_socket_option(self.fd, libc::SOL_SOCKET, libc::SO_RCVBUF, &bytes)
    }
}

impl Drop for CanBus {
    fn drop(&mut self) {
        self.close().ok();
    }
}

impl AsRawFd for CanBus {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const CAN: &str = "vcan0";

    #[test]
    #[serial]
    #[cfg_attr(not(feature = "vcan_tests"), ignore)]
    fn open_nonexistent_interface_fails() {
        assert!(CanBus::open("does-not-exist-0").is_err());
    }

    #[test]
    #[serial]
    #[cfg_attr(not(feature = "vcan_tests"), ignore)]
    fn open_and_round_trip() {
        let read_bus = CanBus::open(CAN).unwrap();
        read_bus.set_read_timeout(Duration::from_millis(200)).unwrap();
        let write_bus = CanBus::open(CAN).unwrap();

        let frame = CanFrame::new(0x123, &[1, 2, 3]).unwrap();
        write_bus.send(&frame).unwrap();

        let received = read_bus.recv().unwrap();
        assert_eq!(received.id(), 0x123);
        assert_eq!(received.data(), &[1, 2, 3]);
    }
}
