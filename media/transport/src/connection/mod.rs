//! Transport resources of a single negotiated media or of a bundle
//!
//! A [`Connection`] owns the sockets of its components until they are handed over to the IO
//! driver, the elements it inserted into the media pipeline and, for WebRTC, one DTLS transport per
//! component. It is shared between the session's registry and everything that wants to observe
//! it, so all of its state is behind atomics or a mutex.

use crate::{
    dtls::{DtlsError, DtlsRole, DtlsSrtpKeys, DtlsState, DtlsTransport},
    pipeline::{Element, Pad, Pipeline, PipelineError, PropertyValue},
    sdes::SdesKey,
    socket::{SocketAllocError, SocketPair},
};
use ice::{Component, StreamId};
use openssl::ssl::SslContext;
use parking_lot::Mutex;
use sdp_types::Fingerprint;
use std::{
    io, mem,
    net::{IpAddr, SocketAddr, UdpSocket},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::{Duration, Instant},
};

mod sctp;

/// DTLS records kept per component until its transport exists, about one handshake flight
const MAX_EARLY_DTLS_RECORDS: usize = 8;

pub use sctp::{SctpLink, datachannel_port};

/// Called for every media packet received on a connection
pub type LatencyCallback = Box<dyn Fn(Component, Instant) + Send + Sync>;

type ConnectedHandler = Box<dyn FnOnce() + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    SocketAlloc(#[from] SocketAllocError),
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WebRTC connection {0} requires an ICE agent")]
    MissingIceAgent(String),
    #[error("WebRTC connection {0} has no certificate")]
    MissingCertificate(String),
    #[error("connection {0} has not been added to the pipeline")]
    NotAdded(String),
    #[error("SCTP elements of connection {0} are not wired")]
    SctpNotWired(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Dtls(#[from] DtlsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Plain RTP over a UDP socket pair
    Rtp,
    /// SRTP keyed by SDES over a UDP socket pair
    Srtp,
    /// ICE + DTLS-SRTP with separate RTP and RTCP components
    WebRtc,
    /// ICE + DTLS-SRTP shared by all bundled media, including data channels
    WebRtcBundle,
    /// ICE + DTLS-SRTP with RTCP multiplexed on the RTP component
    WebRtcRtcpMux,
    /// ICE + DTLS carrying SCTP data channels
    WebRtcData,
}

impl ConnectionKind {
    pub fn is_webrtc(self) -> bool {
        !matches!(self, ConnectionKind::Rtp | ConnectionKind::Srtp)
    }

    /// RTP, RTCP and data all use the RTP component
    pub fn is_muxed(self) -> bool {
        matches!(
            self,
            ConnectionKind::WebRtcBundle | ConnectionKind::WebRtcRtcpMux | ConnectionKind::WebRtcData
        )
    }

    /// Connection can carry SCTP data channels
    pub fn carries_data(self) -> bool {
        matches!(self, ConnectionKind::WebRtcBundle | ConnectionKind::WebRtcData)
    }

    pub fn components(self) -> &'static [Component] {
        if self.is_muxed() {
            &[Component::Rtp]
        } else {
            &[Component::Rtp, Component::Rtcp]
        }
    }

    /// Factories of the elements sending to and receiving from the network
    fn element_factories(self) -> (&'static str, &'static str) {
        match self {
            ConnectionKind::Rtp => ("appsink", "appsrc"),
            ConnectionKind::Srtp => ("srtpenc", "srtpdec"),
            ConnectionKind::WebRtc
            | ConnectionKind::WebRtcBundle
            | ConnectionKind::WebRtcRtcpMux
            | ConnectionKind::WebRtcData => ("dtlssrtpenc", "dtlssrtpdec"),
        }
    }
}

/// One-shot `connected` notification of a connection
#[derive(Default)]
pub struct ConnectedSignal {
    connected: AtomicBool,
    handlers: Mutex<Vec<ConnectedHandler>>,
}

impl ConnectedSignal {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Run `handler` once the connection is connected, immediately if it already is
    pub fn connect(&self, handler: impl FnOnce() + Send + 'static) {
        let mut handlers = self.handlers.lock();

        if self.is_connected() {
            drop(handlers);
            handler();
        } else {
            handlers.push(Box::new(handler));
        }
    }

    /// Mark as connected and run all handlers, returns false if this already happened
    pub(crate) fn emit(&self) -> bool {
        let handlers = {
            let mut handlers = self.handlers.lock();

            if self
                .connected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }

            mem::take(&mut *handlers)
        };

        for handler in handlers {
            handler();
        }

        true
    }
}

/// Datagram a connection wants to send
#[derive(Debug)]
pub(crate) struct Transmit {
    /// Local address of the socket to send from
    pub(crate) socket: SocketAddr,
    pub(crate) source: Option<IpAddr>,
    pub(crate) target: SocketAddr,
    pub(crate) data: Vec<u8>,
}

struct ComponentTransport {
    component: Component,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    /// Local IP of the selected ICE pair
    source: Option<IpAddr>,
    sender: Option<Element>,
    receiver: Option<Element>,
    dtls: Option<DtlsTransport>,
    /// DTLS records received before the transport existed
    early_records: Vec<Vec<u8>>,
}

struct ConnectionState {
    components: Vec<ComponentTransport>,
    /// Sockets not yet handed to the IO driver
    sockets: Vec<UdpSocket>,
    ssl_context: Option<SslContext>,
    remote_fingerprints: Vec<Fingerprint>,
    gathered: bool,
    local_key: Option<SdesKey>,
    remote_key: Option<SdesKey>,
}

impl ConnectionState {
    fn component(&mut self, component: Component) -> Option<&mut ComponentTransport> {
        self.components
            .iter_mut()
            .find(|c| c.component == component)
    }
}

pub struct Connection {
    name: String,
    kind: ConnectionKind,
    stream: Option<StreamId>,

    added: AtomicBool,
    removed: AtomicBool,
    connected: ConnectedSignal,
    sctp: Option<SctpLink>,

    rtp_sink_pads: AtomicU32,
    rtcp_sink_pads: AtomicU32,

    latency_callback: Mutex<Option<LatencyCallback>>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(
        name: String,
        kind: ConnectionKind,
        stream: Option<StreamId>,
        sockets: SocketPair,
        ssl_context: Option<SslContext>,
    ) -> Result<Self, ConnectionError> {
        if kind.is_webrtc() && stream.is_none() {
            return Err(ConnectionError::MissingIceAgent(name));
        }

        let SocketPair { rtp, rtcp } = sockets;

        let mut components = vec![ComponentTransport::new(Component::Rtp, rtp.local_addr()?)];
        let mut sockets = vec![rtp];

        if kind.is_muxed() {
            drop(rtcp);
        } else {
            components.push(ComponentTransport::new(Component::Rtcp, rtcp.local_addr()?));
            sockets.push(rtcp);
        }

        log::debug!(
            "Created {kind:?} connection {name} on {}",
            components
                .iter()
                .map(|c| c.local_addr.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            name,
            kind,
            stream,
            added: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            connected: ConnectedSignal::default(),
            sctp: kind.carries_data().then(SctpLink::new),
            rtp_sink_pads: AtomicU32::new(0),
            rtcp_sink_pads: AtomicU32::new(0),
            latency_callback: Mutex::new(None),
            state: Mutex::new(ConnectionState {
                components,
                sockets,
                ssl_context,
                remote_fingerprints: vec![],
                gathered: false,
                local_key: None,
                remote_key: None,
            }),
        })
    }

    /// Media id or bundle name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// ICE stream of WebRTC connections
    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream
    }

    pub fn is_added(&self) -> bool {
        self.added.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_connected()
    }

    pub fn connected_signal(&self) -> &ConnectedSignal {
        &self.connected
    }

    /// Run `handler` once the connection's security handshake completed
    pub fn connect_connected(&self, handler: impl FnOnce() + Send + 'static) {
        self.connected.connect(handler);
    }

    pub fn sctp(&self) -> Option<&SctpLink> {
        self.sctp.as_ref()
    }

    /// Local address of the component's socket, RTCP of muxed connections maps to RTP
    pub fn local_addr(&self, component: Component) -> Option<SocketAddr> {
        let component = self.effective_component(component);

        self.state
            .lock()
            .component(component)
            .map(|c| c.local_addr)
    }

    pub fn local_addrs(&self) -> Vec<(Component, SocketAddr)> {
        self.state
            .lock()
            .components
            .iter()
            .map(|c| (c.component, c.local_addr))
            .collect()
    }

    pub fn remote_addr(&self, component: Component) -> Option<SocketAddr> {
        let component = self.effective_component(component);

        self.state.lock().component(component)?.remote_addr
    }

    pub fn is_gathered(&self) -> bool {
        self.state.lock().gathered
    }

    pub fn set_latency_callback(&self, callback: impl Fn(Component, Instant) + Send + Sync + 'static) {
        *self.latency_callback.lock() = Some(Box::new(callback));
    }

    pub fn clear_latency_callback(&self) {
        *self.latency_callback.lock() = None;
    }

    /// Pad emitting the received RTP packets
    pub fn rtp_src_pad(&self) -> Result<Pad, ConnectionError> {
        Ok(self.receiver(Component::Rtp)?.pad("rtp_src"))
    }

    /// Pad emitting the received RTCP packets
    pub fn rtcp_src_pad(&self) -> Result<Pad, ConnectionError> {
        Ok(self.receiver(Component::Rtcp)?.pad("rtcp_src"))
    }

    /// Pad emitting received SCTP packets
    pub fn data_src_pad(&self) -> Result<Pad, ConnectionError> {
        Ok(self.receiver(Component::Rtp)?.pad("data_src"))
    }

    /// Pad accepting SCTP packets to send
    pub fn data_sink_pad(&self) -> Result<Pad, ConnectionError> {
        Ok(self.sender(Component::Rtp)?.pad("data_sink"))
    }

    /// Request a new pad accepting RTP packets to send, named `rtp_sink_%d`
    pub fn request_rtp_sink_pad(&self, pipeline: &mut dyn Pipeline) -> Result<Pad, ConnectionError> {
        let sender = self.sender(Component::Rtp)?;
        let index = self.rtp_sink_pads.fetch_add(1, Ordering::Relaxed);

        Ok(pipeline.request_pad(&sender, &format!("rtp_sink_{index}"), None)?)
    }

    /// Request a new pad accepting RTCP packets to send, named `rtcp_sink_%d`
    pub fn request_rtcp_sink_pad(
        &self,
        pipeline: &mut dyn Pipeline,
    ) -> Result<Pad, ConnectionError> {
        let sender = self.sender(Component::Rtcp)?;
        let index = self.rtcp_sink_pads.fetch_add(1, Ordering::Relaxed);

        Ok(pipeline.request_pad(&sender, &format!("rtcp_sink_{index}"), None)?)
    }

    /// Insert the connection's elements into the pipeline
    ///
    /// `active` selects the DTLS client role. Returns false if the connection was already added.
    pub(crate) fn add(
        &self,
        pipeline: &mut dyn Pipeline,
        active: bool,
    ) -> Result<bool, ConnectionError> {
        if self
            .added
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let mut state = self.state.lock();

        if let Err(e) = self.build_elements(pipeline, &mut state, active) {
            log::warn!("Failed to add connection {}, {e}", self.name);

            for transport in &mut state.components {
                transport.release(pipeline);
            }

            self.added.store(false, Ordering::Release);
            return Err(e);
        }

        for transport in &mut state.components {
            transport.early_records.clear();
        }

        log::debug!("Added connection {} (active={active})", self.name);

        Ok(true)
    }

    fn build_elements(
        &self,
        pipeline: &mut dyn Pipeline,
        state: &mut ConnectionState,
        active: bool,
    ) -> Result<(), ConnectionError> {
        let (sender_factory, receiver_factory) = self.kind.element_factories();

        for transport in &mut state.components {
            let prefix = format!("{}-{}", self.name, component_name(transport.component));

            let sender = pipeline.make_element(sender_factory, &format!("{prefix}-sender"))?;
            transport.sender = Some(sender.clone());

            let receiver = pipeline.make_element(receiver_factory, &format!("{prefix}-receiver"))?;
            transport.receiver = Some(receiver.clone());

            if self.kind.is_webrtc() {
                let ctx = state
                    .ssl_context
                    .as_ref()
                    .ok_or_else(|| ConnectionError::MissingCertificate(self.name.clone()))?;

                let mut dtls = DtlsTransport::new(
                    ctx,
                    DtlsRole::from_active(active),
                    state.remote_fingerprints.clone(),
                )?;

                // Kept until the connection was added, a failed attempt can replay them
                for record in &transport.early_records {
                    dtls.receive(record.clone())?;
                }

                for element in [&sender, &receiver] {
                    pipeline.set_property(element, "connection-id", PropertyValue::Str(self.name.clone()));
                    pipeline.set_property(element, "is-client", PropertyValue::Bool(active));
                }

                transport.dtls = Some(dtls);
            }
        }

        if self.kind == ConnectionKind::Srtp {
            for (key, local) in [(&state.local_key, true), (&state.remote_key, false)] {
                if let Some(key) = key {
                    apply_sdes_key(pipeline, &state.components, key, local);
                }
            }
        }

        for transport in &state.components {
            for element in transport.sender.iter().chain(&transport.receiver) {
                pipeline.sync_state_with_parent(element)?;
            }
        }

        Ok(())
    }

    /// Remove the connection's elements from the pipeline, returns false if already removed
    pub(crate) fn remove(&self, pipeline: &mut dyn Pipeline) -> bool {
        if self
            .removed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(sctp) = &self.sctp {
            sctp.remove(pipeline);
        }

        let mut state = self.state.lock();

        for transport in &mut state.components {
            transport.release(pipeline);
        }

        state.sockets.clear();

        log::debug!("Removed connection {}", self.name);

        true
    }

    /// Sockets to hand over to the IO driver, only returned once
    pub(crate) fn take_sockets(&self) -> Vec<UdpSocket> {
        mem::take(&mut self.state.lock().sockets)
    }

    pub(crate) fn set_gathered(&self, gathered: bool) {
        self.state.lock().gathered = gathered;
    }

    pub(crate) fn set_remote_fingerprints(&self, fingerprints: Vec<Fingerprint>) {
        self.state.lock().remote_fingerprints = fingerprints;
    }

    /// Use a new certificate, applies to every DTLS transport that has not started its handshake
    pub(crate) fn set_certificate(&self, ctx: &SslContext) {
        let mut state = self.state.lock();
        state.ssl_context = Some(ctx.clone());

        for transport in &mut state.components {
            let Some(dtls) = &mut transport.dtls else {
                continue;
            };

            match dtls.set_context(ctx) {
                Ok(true) => {}
                Ok(false) => log::debug!(
                    "Certificate of {} {:?} not replaced, handshake already started",
                    self.name,
                    transport.component
                ),
                Err(e) => log::warn!("Failed to replace certificate of {}, {e}", self.name),
            }
        }
    }

    /// Store a SDES key and install it on the SRTP elements if they exist
    pub(crate) fn set_srtp_key(&self, pipeline: &mut dyn Pipeline, key: &SdesKey, local: bool) -> bool {
        let mut state = self.state.lock();

        if local {
            state.local_key = Some(key.clone());
        } else {
            state.remote_key = Some(key.clone());
        }

        if !self.is_added() {
            return false;
        }

        apply_sdes_key(pipeline, &state.components, key, local)
    }

    pub(crate) fn set_remote_addr(&self, component: Component, addr: SocketAddr) {
        let component = self.effective_component(component);

        if let Some(transport) = self.state.lock().component(component) {
            transport.remote_addr = Some(addr);
        }
    }

    pub(crate) fn set_selected_pair(&self, component: Component, local: SocketAddr, remote: SocketAddr) {
        if let Some(transport) = self.state.lock().component(component) {
            transport.remote_addr = Some(remote);
            transport.source = (!local.ip().is_unspecified()).then_some(local.ip());
        }
    }

    /// ICE connected the component, start its DTLS handshake
    ///
    /// Returns true when this completed the security handshake of the whole connection.
    pub(crate) fn unlock_dtls(&self, pipeline: &mut dyn Pipeline, component: Component) -> bool {
        self.drive_dtls(pipeline, component, |dtls| dtls.unlock())
    }

    pub(crate) fn receive_dtls(
        &self,
        pipeline: &mut dyn Pipeline,
        component: Component,
        record: Vec<u8>,
    ) -> bool {
        {
            let mut state = self.state.lock();

            let Some(transport) = state.component(component) else {
                return false;
            };

            if transport.dtls.is_none() {
                if transport.early_records.len() >= MAX_EARLY_DTLS_RECORDS {
                    log::debug!(
                        "Dropping DTLS record on {} {:?}, transport not started",
                        self.name,
                        component
                    );
                } else {
                    transport.early_records.push(record);
                }

                return false;
            }
        }

        self.drive_dtls(pipeline, component, move |dtls| dtls.receive(record))
    }

    /// Drive handshake retransmissions
    pub(crate) fn poll_dtls(&self, pipeline: &mut dyn Pipeline) -> bool {
        let mut connected = false;

        for &component in self.kind.components() {
            connected |= self.drive_dtls(pipeline, component, DtlsTransport::poll);
        }

        connected
    }

    pub(crate) fn dtls_timeout(&self) -> Option<Duration> {
        self.state
            .lock()
            .components
            .iter()
            .filter_map(|c| c.dtls.as_ref()?.timeout())
            .min()
    }

    pub(crate) fn dtls_state(&self, component: Component) -> Option<DtlsState> {
        let component = self.effective_component(component);

        Some(self.state.lock().component(component)?.dtls.as_ref()?.state())
    }

    pub(crate) fn dtls_keys(&self, component: Component) -> Option<DtlsSrtpKeys> {
        let component = self.effective_component(component);

        self.state
            .lock()
            .component(component)?
            .dtls
            .as_ref()?
            .keys()
            .cloned()
    }

    /// Next DTLS record to send, records wait until the component has a remote address
    pub(crate) fn pop_transmit(&self) -> Option<Transmit> {
        let mut state = self.state.lock();

        state.components.iter_mut().find_map(|transport| {
            let target = transport.remote_addr?;
            let data = transport.dtls.as_mut()?.pop_to_send()?;

            Some(Transmit {
                socket: transport.local_addr,
                source: transport.source,
                target,
                data,
            })
        })
    }

    /// Next SCTP packet received over DTLS
    pub(crate) fn pop_app_data(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .component(Component::Rtp)?
            .dtls
            .as_mut()?
            .pop_app_data()
    }

    pub(crate) fn send_app_data(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();

        let dtls = state
            .component(Component::Rtp)
            .and_then(|transport| transport.dtls.as_mut())
            .ok_or_else(|| ConnectionError::NotAdded(self.name.clone()))?;

        dtls.send_app_data(data)?;

        Ok(())
    }

    /// Addressing of a media packet sent on the component
    pub(crate) fn media_transmit(&self, component: Component, data: Vec<u8>) -> Option<Transmit> {
        let component = self.effective_component(component);

        let mut state = self.state.lock();
        let transport = state.component(component)?;

        Some(Transmit {
            socket: transport.local_addr,
            source: transport.source,
            target: transport.remote_addr?,
            data,
        })
    }

    pub(crate) fn media_received(&self, component: Component, now: Instant) {
        if let Some(callback) = &*self.latency_callback.lock() {
            callback(component, now);
        }
    }

    fn drive_dtls(
        &self,
        pipeline: &mut dyn Pipeline,
        component: Component,
        f: impl FnOnce(&mut DtlsTransport) -> Result<Option<DtlsSrtpKeys>, DtlsError>,
    ) -> bool {
        let mut state = self.state.lock();

        let Some(transport) = state.component(component) else {
            return false;
        };

        let Some(dtls) = &mut transport.dtls else {
            return false;
        };

        let keys = match f(dtls) {
            Ok(Some(keys)) => keys,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("DTLS of {} {:?} failed, {e}", self.name, component);
                return false;
            }
        };

        log::debug!("DTLS keys of {} {:?} are set", self.name, component);

        if self.kind != ConnectionKind::WebRtcData {
            let profile = PropertyValue::Str(keys.profile.name().into());

            for (element, key) in [(&transport.sender, &keys.local), (&transport.receiver, &keys.remote)] {
                if let Some(element) = element {
                    pipeline.set_property(element, "srtp-profile", profile.clone());
                    pipeline.set_property(element, "key", PropertyValue::Bytes(key.clone()));
                }
            }
        }

        state
            .components
            .iter()
            .all(|c| c.dtls.as_ref().is_some_and(|d| d.state() == DtlsState::Connected))
    }

    fn effective_component(&self, component: Component) -> Component {
        if self.kind.is_muxed() {
            Component::Rtp
        } else {
            component
        }
    }

    fn sender(&self, component: Component) -> Result<Element, ConnectionError> {
        let component = self.effective_component(component);

        self.state
            .lock()
            .component(component)
            .and_then(|c| c.sender.clone())
            .ok_or_else(|| ConnectionError::NotAdded(self.name.clone()))
    }

    fn receiver(&self, component: Component) -> Result<Element, ConnectionError> {
        let component = self.effective_component(component);

        self.state
            .lock()
            .component(component)
            .and_then(|c| c.receiver.clone())
            .ok_or_else(|| ConnectionError::NotAdded(self.name.clone()))
    }
}

impl ComponentTransport {
    fn new(component: Component, local_addr: SocketAddr) -> Self {
        Self {
            component,
            local_addr,
            remote_addr: None,
            source: None,
            sender: None,
            receiver: None,
            dtls: None,
            early_records: vec![],
        }
    }

    /// Remove the elements from the pipeline and drop the DTLS transport
    fn release(&mut self, pipeline: &mut dyn Pipeline) {
        for element in self.sender.take().into_iter().chain(self.receiver.take()) {
            pipeline.remove_element(&element);
        }

        self.dtls = None;
    }
}

fn component_name(component: Component) -> &'static str {
    match component {
        Component::Rtp => "rtp",
        Component::Rtcp => "rtcp",
    }
}

/// Local keys protect outgoing packets on the senders, remote keys go to the receivers
fn apply_sdes_key(
    pipeline: &mut dyn Pipeline,
    components: &[ComponentTransport],
    key: &SdesKey,
    local: bool,
) -> bool {
    let (Some((cipher, auth)), Some(bytes)) = (key.cipher_and_auth(), key.key_bytes()) else {
        log::warn!("Cannot install SDES key with tag {}, invalid key", key.tag);
        return false;
    };

    for transport in components {
        let element = if local {
            &transport.sender
        } else {
            &transport.receiver
        };

        let Some(element) = element else {
            continue;
        };

        pipeline.set_property(element, "key", PropertyValue::Bytes(bytes.clone()));

        for prefix in ["rtp", "rtcp"] {
            pipeline.set_property(element, &format!("{prefix}-cipher"), PropertyValue::Str(cipher.into()));
            pipeline.set_property(element, &format!("{prefix}-auth"), PropertyValue::Str(auth.into()));
        }
    }

    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{pipeline::RecordingPipeline, socket::SocketPairAllocator};
    use std::{
        net::Ipv4Addr,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    fn rtp_connection() -> Connection {
        let sockets = SocketPairAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .allocate(0, 0)
            .unwrap();

        Connection::new("audio0".into(), ConnectionKind::Rtp, None, sockets, None).unwrap()
    }

    #[test]
    fn failed_add_is_undone() {
        let _ = env_logger::builder().is_test(true).try_init();

        let connection = rtp_connection();
        let mut pipeline = RecordingPipeline {
            fail_factory: Some("appsrc".into()),
            ..RecordingPipeline::default()
        };

        assert!(matches!(
            connection.add(&mut pipeline, false),
            Err(ConnectionError::Pipeline(_))
        ));
        assert!(!connection.is_added());

        // The sender made before the receiver failed is gone again
        assert_eq!(pipeline.removed, vec![Element::new("appsink", "audio0-rtp-sender")]);

        assert!(connection.add(&mut pipeline, false).unwrap());
        assert!(connection.is_added());
        assert_eq!(pipeline.count("appsink"), 3);
        assert_eq!(pipeline.count("appsrc"), 2);

        assert!(!connection.add(&mut pipeline, false).unwrap());
        assert_eq!(pipeline.count("appsrc"), 2);
    }

    #[test]
    fn early_dtls_records_are_bounded() {
        let connection = rtp_connection();
        let mut pipeline = RecordingPipeline::default();

        for _ in 0..MAX_EARLY_DTLS_RECORDS * 4 {
            assert!(!connection.receive_dtls(&mut pipeline, Component::Rtp, vec![22, 254, 253]));
        }

        let state = connection.state.lock();
        assert_eq!(state.components[0].early_records.len(), MAX_EARLY_DTLS_RECORDS);
        assert!(state.components[1].early_records.is_empty());
    }

    #[test]
    fn connected_signal_fires_once() {
        let signal = ConnectedSignal::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        signal.connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!signal.is_connected());
        assert!(signal.emit());
        assert!(!signal.emit());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Late subscribers run immediately
        let c = calls.clone();
        signal.connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn connected_signal_concurrent_emit() {
        let signal = Arc::new(ConnectedSignal::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        signal.connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let signal = signal.clone();
                std::thread::spawn(move || signal.emit())
            })
            .collect();

        let emitted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|emitted| *emitted)
            .count();

        assert_eq!(emitted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kind_components() {
        assert_eq!(ConnectionKind::WebRtc.components(), &[Component::Rtp, Component::Rtcp]);
        assert_eq!(ConnectionKind::WebRtcBundle.components(), &[Component::Rtp]);
        assert_eq!(ConnectionKind::Srtp.components().len(), 2);
        assert!(ConnectionKind::WebRtcData.carries_data());
        assert!(!ConnectionKind::WebRtcRtcpMux.carries_data());
        assert!(!ConnectionKind::Rtp.is_webrtc());
    }
}
