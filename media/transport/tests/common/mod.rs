#![allow(dead_code, unreachable_pub)]

use ezk_transport::{
    Caps, Element, LocalMedia, Pad, Pipeline, PipelineError, PropertyValue, ReceivedPacket,
    Session, SessionEvent, TransportConfig,
};
use parking_lot::Mutex;
use sdp_types::MediaType;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::{Duration, Instant},
};

/// What a session did to its pipeline
#[derive(Default)]
pub struct Recorded {
    pub elements: Vec<Element>,
    pub removed: Vec<Element>,
    pub properties: Vec<(String, String, PropertyValue)>,
    pub links: Vec<(Pad, Pad)>,
    /// Factory whose next `make_element` fails
    pub fail_factory: Option<String>,
}

impl Recorded {
    pub fn count(&self, factory: &str) -> usize {
        self.elements.iter().filter(|e| e.factory == factory).count()
    }

    /// Last value of the property set on the element
    pub fn property(&self, element: &str, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .rev()
            .find(|(e, n, _)| e == element && n == name)
            .map(|(_, _, value)| value)
    }
}

/// Pipeline accepting everything, shared with the test to inspect it
#[derive(Clone, Default)]
pub struct FakePipeline(pub Arc<Mutex<Recorded>>);

impl Pipeline for FakePipeline {
    fn make_element(&mut self, factory: &str, name: &str) -> Result<Element, PipelineError> {
        let mut recorded = self.0.lock();

        if recorded.fail_factory.as_deref() == Some(factory) {
            recorded.fail_factory = None;
            return Err(PipelineError::MissingFactory(factory.into()));
        }

        let element = Element::new(factory, name);
        recorded.elements.push(element.clone());
        Ok(element)
    }

    fn remove_element(&mut self, element: &Element) {
        self.0.lock().removed.push(element.clone());
    }

    fn set_property(&mut self, element: &Element, name: &str, value: PropertyValue) {
        self.0
            .lock()
            .properties
            .push((element.name.clone(), name.into(), value));
    }

    fn request_pad(
        &mut self,
        element: &Element,
        name: &str,
        _caps: Option<&Caps>,
    ) -> Result<Pad, PipelineError> {
        Ok(element.pad(name))
    }

    fn link_pads(&mut self, src: &Pad, sink: &Pad) -> Result<(), PipelineError> {
        self.0.lock().links.push((src.clone(), sink.clone()));
        Ok(())
    }

    fn sync_state_with_parent(&mut self, _element: &Element) -> Result<(), PipelineError> {
        Ok(())
    }
}

pub fn localhost(config: TransportConfig) -> TransportConfig {
    TransportConfig {
        local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ..config
    }
}

pub fn make_session(config: TransportConfig) -> (Session, FakePipeline) {
    let pipeline = FakePipeline::default();
    let session = Session::new(localhost(config), Box::new(pipeline.clone())).unwrap();

    (session, pipeline)
}

/// Session with a single audio media accepting PCMU
pub fn audio_session(config: TransportConfig) -> (Session, FakePipeline) {
    let (mut session, pipeline) = make_session(config);

    session
        .add_local_media(
            LocalMedia::new(MediaType::Audio, ["0"]).with_attribute("rtpmap", Some("0 PCMU/8000")),
        )
        .unwrap();

    (session, pipeline)
}

/// Run a complete offer/answer exchange
pub fn negotiate(offerer: &mut Session, answerer: &mut Session) {
    let offer = offerer.create_offer().unwrap();
    let answer = answerer.process_offer(&offer.to_string()).unwrap();
    offerer.process_answer(&answer.to_string()).unwrap();
}

/// Trickle the candidates found in `from`'s events to `to`, returns the remaining events
pub fn trickle(from: &mut Session, to: &mut Session) -> Vec<SessionEvent> {
    let mut rest = vec![];

    while let Some(event) = from.pop_event() {
        match event {
            SessionEvent::IceCandidate {
                candidate,
                mid,
                mline_index,
            } => {
                to.add_ice_candidate(candidate, Some(mid.as_str()), mline_index);
            }
            event => rest.push(event),
        }
    }

    rest
}

/// Deliver datagrams between two sessions bound to localhost until `done` returns true
///
/// Every event other than [`SessionEvent::SendData`] is passed to `done` with the index of the
/// session that emitted it. Returns false if the exchange did not finish in time.
pub fn exchange(
    a: &mut Session,
    b: &mut Session,
    mut done: impl FnMut(usize, &SessionEvent) -> bool,
) -> bool {
    let mut now = Instant::now();

    for _ in 0..1000 {
        a.poll(now);
        b.poll(now);

        if deliver(now, 0, a, b, &mut done) || deliver(now, 1, b, a, &mut done) {
            return true;
        }

        now += Duration::from_millis(10);
    }

    false
}

fn deliver(
    now: Instant,
    index: usize,
    from: &mut Session,
    to: &mut Session,
    done: &mut impl FnMut(usize, &SessionEvent) -> bool,
) -> bool {
    while let Some(event) = from.pop_event() {
        match event {
            SessionEvent::SendData {
                socket,
                data,
                target,
                ..
            } => to.receive(
                now,
                ReceivedPacket {
                    socket: target,
                    source: socket,
                    destination: target,
                    data,
                },
            ),
            event => {
                if done(index, &event) {
                    return true;
                }
            }
        }
    }

    false
}
