//! AF_PACKET driver: raw Ethernet frames through a packet socket.
//!
//! Opens `AF_PACKET / SOCK_RAW / ETH_P_ALL` bound to one interface, so the
//! socket both transmits caller-built frames verbatim and sees every frame
//! the interface receives. Requires `CAP_NET_RAW`. Interrupted syscalls
//! are retried transparently; the capture poll window is one millisecond
//! so stop requests are observed promptly.

use std::net::Ipv4Addr;

use super::{Netdev, NetdevError};

/// Capture poll window in milliseconds.
const POLL_WINDOW_MS: i32 = 1;

pub struct RawSockNetdev {
    fd: i32,
    ifname: String,
}

// SAFETY: the only state is an owned file descriptor; send/recv syscalls
// on one fd are safe from concurrent threads.
unsafe impl Send for RawSockNetdev {}
unsafe impl Sync for RawSockNetdev {}

impl RawSockNetdev {
    /// Bind a packet socket to `ifname`.
    pub fn open(ifname: &str) -> Result<Self, NetdevError> {
        let proto = (libc::ETH_P_ALL as u16).to_be() as i32;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
        if fd < 0 {
            return Err(NetdevError::OpenFailed(
                ifname.to_string(),
                format!(
                    "socket(AF_PACKET) failed (requires CAP_NET_RAW): {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }

        let ifindex = {
            let c_name = match std::ffi::CString::new(ifname) {
                Ok(n) => n,
                Err(_) => {
                    unsafe { libc::close(fd) };
                    return Err(NetdevError::OpenFailed(
                        ifname.to_string(),
                        "interface name contains NUL".into(),
                    ));
                }
            };
            let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
            if idx == 0 {
                unsafe { libc::close(fd) };
                return Err(NetdevError::OpenFailed(
                    ifname.to_string(),
                    format!("no such interface: {}", std::io::Error::last_os_error()),
                ));
            }
            idx as i32
        };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = proto as u16;
        addr.sll_ifindex = ifindex;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetdevError::OpenFailed(
                ifname.to_string(),
                format!("bind failed: {err}"),
            ));
        }

        tracing::debug!(interface = %ifname, ifindex, "packet socket bound");
        Ok(Self {
            fd,
            ifname: ifname.to_string(),
        })
    }
}

impl Drop for RawSockNetdev {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

impl Netdev for RawSockNetdev {
    fn inject(&self, frame: &[u8]) -> Result<(), NetdevError> {
        loop {
            let rc = unsafe {
                libc::send(
                    self.fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                )
            };
            if rc >= 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(NetdevError::InjectFailed(err.to_string()));
        }
    }

    fn capture(&self, buf: &mut [u8]) -> Result<Option<usize>, NetdevError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_WINDOW_MS) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(NetdevError::CaptureFailed(err.to_string()));
        }
        if rc == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(None);
        }

        loop {
            let rc = unsafe {
                libc::recv(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if rc >= 0 {
                return Ok(Some(rc as usize));
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(None),
                _ => return Err(NetdevError::CaptureFailed(err.to_string())),
            }
        }
    }

    fn name(&self) -> &str {
        &self.ifname
    }
}

/// Detect the IPv4 address routing would use to reach `target` without
/// sending a packet: connect a UDP socket and read its local address back.
pub fn detect_source_ip(target: Ipv4Addr) -> Result<Ipv4Addr, NetdevError> {
    let err = |e: std::io::Error| NetdevError::OpenFailed("source-ip".into(), e.to_string());
    let sock = std::net::UdpSocket::bind("0.0.0.0:0").map_err(err)?;
    sock.connect((target, 53)).map_err(err)?;
    match sock.local_addr().map_err(err)?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        _ => Err(NetdevError::OpenFailed(
            "source-ip".into(),
            "expected an IPv4 local address".into(),
        )),
    }
}
