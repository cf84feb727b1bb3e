use crate::{
    Connection, Direction, Fingerprint, Group, IceCandidate, Media, MediaDescription, Origin,
    Rtcp, Sctpmap, SessionDescription, Setup, SrtpCrypto, Time, UnknownAttribute,
};
use nom::Finish;
use nom::error::VerboseError;

#[derive(Debug, thiserror::Error)]
pub enum ParseSessionDescriptionError {
    #[error("{0}")]
    ParseError(VerboseError<String>),
    #[error("message ended unexpectedly")]
    Incomplete,
    #[error("message is missing the origin field (o=)")]
    MissingOrigin,
    #[error("message is missing the name (s=) field")]
    MissingName,
    #[error("message is missing the time (t=) field")]
    MissingTime,
}

impl From<VerboseError<&str>> for ParseSessionDescriptionError {
    fn from(value: VerboseError<&str>) -> Self {
        Self::ParseError(VerboseError {
            errors: value
                .errors
                .into_iter()
                .map(|(input, kind)| (input.to_string(), kind))
                .collect(),
        })
    }
}

#[derive(Default)]
pub(crate) struct Parser {
    origin: Option<Origin>,
    name: Option<String>,
    connection: Option<Connection>,
    time: Option<Time>,
    direction: Direction,
    group: Vec<Group>,
    ice_lite: bool,
    ice_ufrag: Option<String>,
    ice_pwd: Option<String>,
    fingerprint: Vec<Fingerprint>,
    setup: Option<Setup>,
    attributes: Vec<UnknownAttribute>,
    media_descriptions: Vec<MediaDescription>,
}

impl Parser {
    pub(crate) fn parse_line(&mut self, complete_line: &str) -> Result<(), ParseSessionDescriptionError> {
        let line = complete_line
            .get(2..)
            .ok_or(ParseSessionDescriptionError::Incomplete)?;

        match complete_line.as_bytes() {
            [b'v', b'=', ..] => {
                // only version 0 exists
            }
            [b's', b'=', ..] => {
                self.name = Some(line.into());
            }
            [b'o', b'=', ..] => {
                let (_, o) = Origin::parse(line).finish()?;
                self.origin = Some(o);
            }
            [b't', b'=', ..] => {
                let (_, t) = Time::parse(line).finish()?;
                self.time = Some(t);
            }
            [b'c', b'=', ..] => {
                let (_, c) = Connection::parse(line).finish()?;

                if let Some(media_description) = self.media_descriptions.last_mut() {
                    media_description.connection = Some(c);
                } else {
                    self.connection = Some(c);
                }
            }
            [b'm', b'=', ..] => {
                let (_, media) = Media::parse(line).finish()?;

                let mut media_description = MediaDescription::new(
                    media.media_type,
                    media.port,
                    media.proto,
                    media.fmts,
                );
                media_description.media.ports_num = media.ports_num;
                // inherit session direction
                media_description.direction = self.direction;

                self.media_descriptions.push(media_description);
            }
            [b'a', b'=', ..] => self.parse_attribute(line)?,
            _ => {}
        }

        Ok(())
    }

    fn parse_attribute(&mut self, line: &str) -> Result<(), ParseSessionDescriptionError> {
        if let Some((name, value)) = line.split_once(':') {
            self.parse_attribute_with_value(name, value)
        } else {
            self.parse_attribute_without_value(line);
            Ok(())
        }
    }

    fn parse_attribute_with_value(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<(), ParseSessionDescriptionError> {
        let media_description = self.media_descriptions.last_mut();

        match (name, media_description) {
            ("group", _) => {
                let (_, group) = Group::parse(value).finish()?;
                self.group.push(group);
            }
            ("rtcp", Some(media_description)) => {
                let (_, rtcp) = Rtcp::parse(value).finish()?;
                media_description.rtcp = Some(rtcp);
            }
            ("mid", Some(media_description)) => {
                media_description.mid = Some(value.trim().into());
            }
            ("ice-ufrag", Some(media_description)) => {
                media_description.ice_ufrag = Some(value.trim().into());
            }
            ("ice-ufrag", None) => {
                self.ice_ufrag = Some(value.trim().into());
            }
            ("ice-pwd", Some(media_description)) => {
                media_description.ice_pwd = Some(value.trim().into());
            }
            ("ice-pwd", None) => {
                self.ice_pwd = Some(value.trim().into());
            }
            ("candidate", Some(media_description)) => {
                // candidate parser expects the attribute name as prefix
                let line = format!("candidate:{value}");
                let (_, candidate) = IceCandidate::parse(&line).finish()?;
                media_description.ice_candidates.push(candidate);
            }
            ("fingerprint", Some(media_description)) => {
                let (_, fingerprint) = Fingerprint::parse(value).finish()?;
                media_description.fingerprint.push(fingerprint);
            }
            ("fingerprint", None) => {
                let (_, fingerprint) = Fingerprint::parse(value).finish()?;
                self.fingerprint.push(fingerprint);
            }
            ("setup", media_description) => {
                let setup = Setup::parse(value);

                match media_description {
                    Some(media_description) => media_description.setup = setup,
                    None => self.setup = setup,
                }
            }
            ("crypto", Some(media_description)) => {
                let (_, crypto) = SrtpCrypto::parse(value).finish()?;
                media_description.crypto.push(crypto);
            }
            ("sctpmap", Some(media_description)) => {
                let (_, sctpmap) = Sctpmap::parse(value).finish()?;
                media_description.sctpmap.push(sctpmap);
            }
            (_, media_description) => {
                let attr = UnknownAttribute {
                    name: name.into(),
                    value: Some(value.into()),
                };

                match media_description {
                    Some(media_description) => media_description.attributes.push(attr),
                    None => self.attributes.push(attr),
                }
            }
        }

        Ok(())
    }

    fn parse_attribute_without_value(&mut self, line: &str) {
        let media_description = self.media_descriptions.last_mut();

        if let Some(direction) = Direction::parse(line) {
            match media_description {
                Some(media_description) => media_description.direction = direction,
                None => self.direction = direction,
            }

            return;
        }

        match (line, media_description) {
            ("ice-lite", None) => self.ice_lite = true,
            ("rtcp-mux", Some(media_description)) => media_description.rtcp_mux = true,
            ("end-of-candidates", Some(media_description)) => {
                media_description.ice_end_of_candidates = true
            }
            (_, media_description) => {
                let attr = UnknownAttribute {
                    name: line.into(),
                    value: None,
                };

                match media_description {
                    Some(media_description) => media_description.attributes.push(attr),
                    None => self.attributes.push(attr),
                }
            }
        }
    }

    pub(crate) fn finish(self) -> Result<SessionDescription, ParseSessionDescriptionError> {
        Ok(SessionDescription {
            origin: self
                .origin
                .ok_or(ParseSessionDescriptionError::MissingOrigin)?,
            name: self.name.ok_or(ParseSessionDescriptionError::MissingName)?,
            connection: self.connection,
            time: self.time.ok_or(ParseSessionDescriptionError::MissingTime)?,
            group: self.group,
            ice_lite: self.ice_lite,
            ice_ufrag: self.ice_ufrag,
            ice_pwd: self.ice_pwd,
            fingerprint: self.fingerprint,
            setup: self.setup,
            attributes: self.attributes,
            media_descriptions: self.media_descriptions,
        })
    }
}
