//! Narrow interface to the media pipeline the connections insert their elements into
//!
//! The transport core never processes media itself. Connections create their SRTP/DTLS elements
//! through [`Pipeline`], link them by pad name and hand over keys as element properties.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no element factory named {0}")]
    MissingFactory(String),
    #[error("element {element} has no pad {pad}")]
    MissingPad { element: String, pad: String },
    #[error("failed to link {src} to {sink}")]
    Link { src: Pad, sink: Pad },
    #[error("failed to sync state of {0}")]
    SyncState(String),
}

/// Handle to an element created by a [`Pipeline`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element {
    pub factory: String,
    pub name: String,
}

impl Element {
    pub fn new(factory: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            name: name.into(),
        }
    }

    /// Static or already requested pad of this element
    pub fn pad(&self, name: impl Into<String>) -> Pad {
        Pad {
            element: self.name.clone(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pad {
    pub element: String,
    pub name: String,
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.element, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Uint(u64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Media type and fields a requested pad is restricted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    pub media_type: String,
    pub fields: Vec<(String, PropertyValue)>,
}

impl Caps {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: vec![],
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn field(&self, name: &str) -> Option<&PropertyValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

pub trait Pipeline: Send {
    fn make_element(&mut self, factory: &str, name: &str) -> Result<Element, PipelineError>;

    fn remove_element(&mut self, element: &Element);

    fn set_property(&mut self, element: &Element, name: &str, value: PropertyValue);

    /// Request a dynamic pad from the element's pad template
    fn request_pad(
        &mut self,
        element: &Element,
        name: &str,
        caps: Option<&Caps>,
    ) -> Result<Pad, PipelineError>;

    fn link_pads(&mut self, src: &Pad, sink: &Pad) -> Result<(), PipelineError>;

    fn sync_state_with_parent(&mut self, element: &Element) -> Result<(), PipelineError>;
}

/// Pipeline accepting everything and recording what was done to it
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingPipeline {
    pub(crate) elements: Vec<Element>,
    pub(crate) removed: Vec<Element>,
    pub(crate) properties: Vec<(String, String, PropertyValue)>,
    pub(crate) links: Vec<(Pad, Pad)>,
    /// Factory whose next `make_element` fails
    pub(crate) fail_factory: Option<String>,
}

#[cfg(test)]
impl RecordingPipeline {
    pub(crate) fn count(&self, factory: &str) -> usize {
        self.elements.iter().filter(|e| e.factory == factory).count()
    }
}

#[cfg(test)]
impl Pipeline for RecordingPipeline {
    fn make_element(&mut self, factory: &str, name: &str) -> Result<Element, PipelineError> {
        if self.fail_factory.as_deref() == Some(factory) {
            self.fail_factory = None;
            return Err(PipelineError::MissingFactory(factory.into()));
        }

        let element = Element::new(factory, name);
        self.elements.push(element.clone());
        Ok(element)
    }

    fn remove_element(&mut self, element: &Element) {
        self.removed.push(element.clone());
    }

    fn set_property(&mut self, element: &Element, name: &str, value: PropertyValue) {
        self.properties
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
        self.links.push((src.clone(), sink.clone()));
        Ok(())
    }

    fn sync_state_with_parent(&mut self, _element: &Element) -> Result<(), PipelineError> {
        Ok(())
    }
}
