use crate::session::{ReceivedPacket, Session, SessionEvent, TransportChange};
use quinn_udp::{BATCH_SIZE, RecvMeta};
use socket::DriverSocket;
use std::{
    collections::HashMap,
    future::poll_fn,
    io::{self, IoSliceMut},
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::time::{Sleep, sleep_until};

mod socket;

const RECV_BUFFER_SIZE: usize = 2500;

/// IO implementation to be used alongside [`Session`]
///
/// Serves every socket the session hands out, feeds received datagrams into it, sends its
/// [`SessionEvent::SendData`] and drives its timers.
pub struct TokioIo {
    ips: Vec<IpAddr>,
    sockets: HashMap<SocketAddr, DriverSocket>,
    sleep: Option<Pin<Box<Sleep>>>,

    bufs: Box<[[u8; RECV_BUFFER_SIZE]; BATCH_SIZE]>,
    meta: Box<[RecvMeta; BATCH_SIZE]>,
}

impl TokioIo {
    /// Create a new driver with the local IP addresses announced for sockets bound to an unspecified address
    pub fn new(ips: Vec<IpAddr>) -> Self {
        Self {
            ips,
            sockets: HashMap::new(),
            sleep: Some(Box::pin(sleep_until(Instant::now().into()))),
            bufs: Box::new([[0u8; RECV_BUFFER_SIZE]; BATCH_SIZE]),
            meta: Box::new([RecvMeta::default(); BATCH_SIZE]),
        }
    }

    /// Create a new driver and discover the local IP addresses
    pub fn new_with_local_ips() -> Result<Self, local_ip_address::Error> {
        let ips = local_ip_address::list_afinet_netifas()?
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();

        Ok(Self::new(ips))
    }

    /// Announce the driver's IP addresses in the session's ICE candidates
    pub fn register_host_addresses(&self, session: &mut Session) {
        session.set_host_addresses(self.ips.clone());
    }

    /// Local addresses of the sockets currently served
    pub fn local_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.sockets.keys().copied()
    }

    /// Take over sockets created by the session and drop those it released
    ///
    /// Called by [`poll`](Self::poll), but should also be called after negotiating so that
    /// sockets are served before the first event is polled.
    pub fn handle_transport_changes(&mut self, session: &mut Session) -> io::Result<()> {
        while let Some(change) = session.pop_transport_change() {
            match change {
                TransportChange::Bind(socket) => {
                    let socket = DriverSocket::from_std(socket)?;
                    log::trace!("Serving socket {}", socket.local_addr());
                    self.sockets.insert(socket.local_addr(), socket);
                }
                TransportChange::Close(addr) => {
                    if self.sockets.remove(&addr).is_some() {
                        log::trace!("Released socket {addr}");
                    }
                }
            }
        }

        Ok(())
    }

    /// Queue a datagram on the socket bound to `socket`
    pub fn send(
        &mut self,
        socket: SocketAddr,
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    ) {
        if let Some(socket) = self.sockets.get_mut(&socket) {
            socket.enqueue(data, source, target);
        } else {
            log::error!("Tried to send packet using a non existent socket {socket}");
        }
    }

    /// Poll the session until an event other than [`SessionEvent::SendData`] is available.
    ///
    /// This function is cancel safe.
    pub async fn poll_session(&mut self, session: &mut Session) -> io::Result<SessionEvent> {
        poll_fn(|cx| self.poll(cx, session)).await
    }

    /// Poll the sockets and the session.
    ///
    /// Outbound data is sent by the driver and never returned.
    pub fn poll(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut Session,
    ) -> Poll<io::Result<SessionEvent>> {
        self.handle_transport_changes(session)?;

        if let Some(event) = self.next_event(session) {
            return Poll::Ready(Ok(event));
        }

        let now = Instant::now();
        let received = self.receive(cx, session, now);

        if !received {
            session.poll(now);
            self.update_sleep(session, now);
        }

        // Poll sleep until it returns pending, to register the sleep with the context
        while let Some(sleep) = &mut self.sleep
            && sleep.as_mut().poll(cx).is_ready()
        {
            let now = Instant::now();
            session.poll(now);
            self.update_sleep(session, now);
        }

        self.handle_transport_changes(session)?;

        let event = self.next_event(session);

        for socket in self.sockets.values_mut() {
            socket.flush(cx);
        }

        match event {
            Some(event) => Poll::Ready(Ok(event)),
            None => Poll::Pending,
        }
    }

    fn receive(&mut self, cx: &mut Context<'_>, session: &mut Session, now: Instant) -> bool {
        let mut received = false;

        for socket in self.sockets.values_mut() {
            socket.flush(cx);

            // Leave datagrams in the kernel while the socket cannot keep up sending
            if socket.is_congested() {
                continue;
            }

            loop {
                let mut slices = self.bufs.each_mut().map(|buf| IoSliceMut::new(buf));

                let num_msgs = match socket.poll_recv(cx, &mut slices, &mut *self.meta) {
                    Poll::Ready(Ok(num_msgs)) => num_msgs,
                    Poll::Ready(Err(e)) => {
                        log::warn!("Failed to receive on {}, {e}", socket.local_addr());
                        break;
                    }
                    Poll::Pending => break,
                };

                for (buf, meta) in self.bufs.iter().zip(self.meta.iter()).take(num_msgs) {
                    session.receive(
                        now,
                        ReceivedPacket {
                            socket: socket.local_addr(),
                            source: meta.addr,
                            destination: socket.destination(meta),
                            data: buf[..meta.len].to_vec(),
                        },
                    );
                }

                received = true;
            }
        }

        received
    }

    fn next_event(&mut self, session: &mut Session) -> Option<SessionEvent> {
        while let Some(event) = session.pop_event() {
            match event {
                SessionEvent::SendData {
                    socket,
                    data,
                    source,
                    target,
                } => self.send(socket, data, source, target),
                event => return Some(event),
            }
        }

        None
    }

    fn update_sleep(&mut self, session: &Session, now: Instant) {
        match session.timeout(now) {
            Some(duration) => {
                // a zero timeout would keep the sleep ready forever
                let deadline = now + duration.max(Duration::from_millis(1));

                if let Some(sleep) = &mut self.sleep {
                    sleep.as_mut().reset(deadline.into());
                } else {
                    self.sleep = Some(Box::pin(sleep_until(deadline.into())));
                }
            }
            None => self.sleep = None,
        }
    }
}
