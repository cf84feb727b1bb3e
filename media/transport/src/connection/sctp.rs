use crate::pipeline::{Caps, Element, Pad, Pipeline, PipelineError, PropertyValue};
use parking_lot::Mutex;
use sdp_types::MediaDescription;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Application protocol of WebRTC data channels in `a=sctpmap`
const DATACHANNEL_APP: &str = "webrtc-datachannel";

/// Payload protocol identifier of binary data channel messages (WebRTC Binary)
const DATACHANNEL_PPID: u64 = 51;

static NEXT_ASSOCIATION_ID: AtomicU32 = AtomicU32::new(0);

/// SCTP port of the media's first format mapped to a WebRTC data channel
pub fn datachannel_port(media: &MediaDescription) -> Option<u16> {
    media.media.fmts.iter().find_map(|fmt| {
        let port: u16 = fmt.parse().ok()?;

        media
            .sctpmap
            .iter()
            .any(|map| map.port == port && map.app == DATACHANNEL_APP)
            .then_some(port)
    })
}

struct SctpElements {
    dec: Element,
    enc: Element,
}

/// SCTP encoder & decoder linked to a connection's data pads once DTLS is up
pub struct SctpLink {
    association_id: u32,
    wired: AtomicBool,
    elements: Mutex<Option<SctpElements>>,
}

impl SctpLink {
    pub(crate) fn new() -> Self {
        Self {
            association_id: NEXT_ASSOCIATION_ID.fetch_add(1, Ordering::Relaxed),
            wired: AtomicBool::new(false),
            elements: Mutex::new(None),
        }
    }

    /// Process unique id shared by both SCTP elements
    pub fn association_id(&self) -> u32 {
        self.association_id
    }

    pub fn is_wired(&self) -> bool {
        self.wired.load(Ordering::Acquire)
    }

    /// Create the SCTP elements and link them to the connection's data pads
    ///
    /// Returns true only for the call that actually wired them.
    pub(crate) fn wire(
        &self,
        pipeline: &mut dyn Pipeline,
        name: &str,
        (data_src, data_sink): (Pad, Pad),
        local_port: u16,
        remote_port: u16,
    ) -> bool {
        if self
            .wired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match self.create_elements(pipeline, name, data_src, data_sink, local_port, remote_port) {
            Ok(elements) => {
                log::debug!(
                    "Wired SCTP association {} of {name}, ports {local_port}/{remote_port}",
                    self.association_id
                );

                *self.elements.lock() = Some(elements);
                true
            }
            Err(e) => {
                log::error!("Failed to wire SCTP elements of {name}, {e}");
                false
            }
        }
    }

    /// Request an encoder pad for the data channel stream `stream_id`
    pub fn add_data_stream(
        &self,
        pipeline: &mut dyn Pipeline,
        stream_id: u16,
    ) -> Result<Option<Pad>, PipelineError> {
        let Some(enc) = self.elements.lock().as_ref().map(|e| e.enc.clone()) else {
            return Ok(None);
        };

        let caps = Caps::new("application/data")
            .with("ordered", PropertyValue::Bool(true))
            .with("ppid", PropertyValue::Uint(DATACHANNEL_PPID))
            .with("partially-reliability", PropertyValue::Str("none".into()));

        pipeline
            .request_pad(&enc, &format!("sink_{stream_id}"), Some(&caps))
            .map(Some)
    }

    pub(crate) fn remove(&self, pipeline: &mut dyn Pipeline) {
        if let Some(SctpElements { dec, enc }) = self.elements.lock().take() {
            pipeline.remove_element(&dec);
            pipeline.remove_element(&enc);
        }
    }

    fn create_elements(
        &self,
        pipeline: &mut dyn Pipeline,
        name: &str,
        data_src: Pad,
        data_sink: Pad,
        local_port: u16,
        remote_port: u16,
    ) -> Result<SctpElements, PipelineError> {
        let dec = pipeline.make_element("sctpdec", &format!("{name}-sctpdec"))?;
        let enc = pipeline.make_element("sctpenc", &format!("{name}-sctpenc"))?;

        let association_id = PropertyValue::Uint(self.association_id.into());
        pipeline.set_property(&dec, "sctp-association-id", association_id.clone());
        pipeline.set_property(&enc, "sctp-association-id", association_id);

        pipeline.set_property(&enc, "use-sock-stream", PropertyValue::Bool(true));
        pipeline.set_property(&dec, "local-sctp-port", PropertyValue::Uint(local_port.into()));
        pipeline.set_property(&enc, "remote-sctp-port", PropertyValue::Uint(remote_port.into()));

        pipeline.link_pads(&data_src, &dec.pad("sink"))?;
        pipeline.link_pads(&enc.pad("src"), &data_sink)?;

        pipeline.sync_state_with_parent(&dec)?;
        pipeline.sync_state_with_parent(&enc)?;

        Ok(SctpElements { dec, enc })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sdp_types::{MediaType, Sctpmap, TransportProtocol};

    fn app_media(fmts: &[&str], maps: Vec<Sctpmap>) -> MediaDescription {
        let mut media = MediaDescription::new(
            MediaType::App,
            9,
            TransportProtocol::DtlsSctp,
            fmts.iter().map(|f| f.to_string()).collect(),
        );
        media.sctpmap = maps;
        media
    }

    fn map(port: u16, app: &str) -> Sctpmap {
        Sctpmap {
            port,
            app: app.into(),
            streams: Some(1024),
        }
    }

    #[test]
    fn port_of_mapped_format() {
        let media = app_media(&["5000"], vec![map(5000, DATACHANNEL_APP)]);
        assert_eq!(datachannel_port(&media), Some(5000));
    }

    #[test]
    fn port_scans_all_formats() {
        let media = app_media(
            &["4000", "5000"],
            vec![map(4000, "bfcp"), map(5000, DATACHANNEL_APP)],
        );
        assert_eq!(datachannel_port(&media), Some(5000));
    }

    #[test]
    fn no_datachannel_format() {
        let media = app_media(&["5000"], vec![map(5000, "bfcp")]);
        assert_eq!(datachannel_port(&media), None);

        let media = app_media(&["webrtc-datachannel"], vec![]);
        assert_eq!(datachannel_port(&media), None);
    }

    #[test]
    fn association_ids_are_unique() {
        let a = SctpLink::new();
        let b = SctpLink::new();
        assert_ne!(a.association_id(), b.association_id());
    }
}
