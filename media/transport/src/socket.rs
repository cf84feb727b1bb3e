use rand::Rng;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

/// Lowest port an unprivileged process is allowed to bind
const MIN_UNPRIVILEGED_PORT: u16 = 1025;

#[derive(Debug, thiserror::Error)]
pub enum SocketAllocError {
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
    #[error("no free port pair in range {min}-{max}")]
    Exhausted { min: u16, max: u16 },
}

/// Bound, not yet connected RTP & RTCP sockets on adjacent ports
#[derive(Debug)]
pub struct SocketPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
}

impl SocketPair {
    pub fn rtp_port(&self) -> io::Result<u16> {
        Ok(self.rtp.local_addr()?.port())
    }

    pub fn rtcp_port(&self) -> io::Result<u16> {
        Ok(self.rtcp.local_addr()?.port())
    }
}

/// Binds UDP socket pairs with an even RTP port and the RTCP port directly above it
#[derive(Debug, Clone, Copy)]
pub struct SocketPairAllocator {
    bind_ip: IpAddr,
}

impl Default for SocketPairAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl SocketPairAllocator {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    /// Allocate a socket pair inside `min_port..=max_port`
    ///
    /// The search starts at a random port and walks the range in steps of two, wrapping around
    /// once, until both ports of a pair could be bound.
    pub fn allocate(&self, min_port: u16, max_port: u16) -> Result<SocketPair, SocketAllocError> {
        let min = min_port.max(MIN_UNPRIVILEGED_PORT);
        let max = if max_port == 0 { u16::MAX } else { max_port };

        if u32::from(min) + 1 > u32::from(max) {
            return Err(SocketAllocError::InvalidRange { min, max });
        }

        // Every candidate pair is identified by its even (RTP) port
        let first_even = min + (min & 1);
        let last_even = if max & 1 == 1 { max - 1 } else { max - 2 };

        if first_even > last_even {
            return Err(SocketAllocError::Exhausted { min, max });
        }

        let num_pairs = usize::from((last_even - first_even) / 2) + 1;

        let start = rand::rng().random_range(min..=max);
        let start_index = usize::from(start.saturating_sub(first_even) / 2).min(num_pairs - 1);

        for i in 0..num_pairs {
            let index = (start_index + i) % num_pairs;
            let rtp_port = first_even + (index as u16) * 2;

            if let Some(pair) = self.try_bind_pair(rtp_port) {
                log::trace!("Allocated socket pair {}/{}", rtp_port, rtp_port + 1);
                return Ok(pair);
            }
        }

        Err(SocketAllocError::Exhausted { min, max })
    }

    fn try_bind_pair(&self, rtp_port: u16) -> Option<SocketPair> {
        let rtp = UdpSocket::bind(SocketAddr::new(self.bind_ip, rtp_port)).ok()?;
        let rtcp = UdpSocket::bind(SocketAddr::new(self.bind_ip, rtp_port + 1)).ok()?;

        Some(SocketPair { rtp, rtcp })
    }
}
