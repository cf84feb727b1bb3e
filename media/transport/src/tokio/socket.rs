use quinn_udp::{RecvMeta, Transmit, UdpSockRef, UdpSocketState};
use std::{
    collections::VecDeque,
    io::{self, IoSliceMut},
    net::{IpAddr, SocketAddr},
    task::{Context, Poll, ready},
};
use tokio::{io::Interest, net::UdpSocket};

const MAX_QUEUED_DATAGRAMS: usize = 200;

struct Outbound {
    data: Vec<u8>,
    source: Option<IpAddr>,
    target: SocketAddr,
}

/// A socket handed out by the session, served by the tokio reactor
pub(super) struct DriverSocket {
    state: UdpSocketState,
    socket: UdpSocket,
    local_addr: SocketAddr,
    outbound: VecDeque<Outbound>,
}

impl DriverSocket {
    /// Take over a socket bound by the session
    pub(super) fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            state: UdpSocketState::new((&socket).into())?,
            socket,
            local_addr,
            outbound: VecDeque::new(),
        })
    }

    pub(super) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(super) fn is_congested(&self) -> bool {
        self.outbound.len() >= MAX_QUEUED_DATAGRAMS
    }

    pub(super) fn enqueue(&mut self, data: Vec<u8>, source: Option<IpAddr>, target: SocketAddr) {
        self.outbound.push_back(Outbound {
            data,
            source,
            target,
        });
    }

    /// Send queued datagrams until the socket would block
    pub(super) fn flush(&mut self, cx: &mut Context<'_>) {
        while let Some(outbound) = self.outbound.front() {
            if self.socket.poll_send_ready(cx).is_pending() {
                return;
            }

            let result = self.socket.try_io(Interest::WRITABLE, || {
                self.state.try_send(
                    UdpSockRef::from(&self.socket),
                    &Transmit {
                        destination: outbound.target,
                        ecn: None,
                        contents: &outbound.data,
                        segment_size: None,
                        src_ip: outbound.source,
                    },
                )
            });

            match result {
                Ok(()) => {
                    self.outbound.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // readiness was cleared by try_io, poll_send_ready registers the waker again
                }
                Err(e) => {
                    log::warn!(
                        "Dropping datagram from {} to {}, {e}",
                        self.local_addr,
                        outbound.target
                    );
                    self.outbound.pop_front();
                }
            }
        }
    }

    pub(super) fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        loop {
            ready!(self.socket.poll_recv_ready(cx))?;

            let result = self.socket.try_io(Interest::READABLE, || {
                self.state.recv(UdpSockRef::from(&self.socket), bufs, meta)
            });

            match result {
                Ok(num_msgs) => return Poll::Ready(Ok(num_msgs)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }

    /// Destination of a received datagram, the socket's address unless bound to an unspecified one
    pub(super) fn destination(&self, meta: &RecvMeta) -> SocketAddr {
        meta.dst_ip
            .map_or(self.local_addr, |ip| SocketAddr::new(ip, self.local_addr.port()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        future::poll_fn,
        net::{Ipv4Addr, Ipv6Addr},
        time::Duration,
    };

    fn bind_localhost() -> std::net::UdpSocket {
        std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    async fn flush(socket: &mut DriverSocket) {
        poll_fn(|cx| {
            socket.flush(cx);

            if socket.outbound.is_empty() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    #[tokio::test]
    async fn failed_send_is_dropped() {
        let _ = env_logger::builder().is_test(true).try_init();

        let receiver = bind_localhost();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut socket = DriverSocket::from_std(bind_localhost()).unwrap();

        // An IPv4 socket cannot reach an IPv6 destination
        socket.enqueue(
            vec![1],
            None,
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), receiver.local_addr().unwrap().port()),
        );
        socket.enqueue(vec![2], None, receiver.local_addr().unwrap());

        tokio::time::timeout(Duration::from_secs(5), flush(&mut socket))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, source) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[2]);
        assert_eq!(source, socket.local_addr());
    }
}
