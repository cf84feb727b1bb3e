use std::fmt;

/// Kind of media a recorder input carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        })
    }
}

/// Container and media the recording is encapsulated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingProfile {
    Webm,
    Mp4,
    WebmAudioOnly,
    WebmVideoOnly,
    Mp4AudioOnly,
    Mp4VideoOnly,
    JpegVideoOnly,
    /// Raw session recording, audio and video
    Ksr,
}

impl RecordingProfile {
    pub fn supports(self, kind: MediaKind) -> bool {
        use RecordingProfile::*;

        match kind {
            MediaKind::Audio => matches!(self, Webm | Mp4 | WebmAudioOnly | Mp4AudioOnly | Ksr),
            MediaKind::Video => matches!(
                self,
                Webm | Mp4 | WebmVideoOnly | Mp4VideoOnly | JpegVideoOnly | Ksr
            ),
        }
    }

    /// Media kinds recorded with this profile
    pub fn media_kinds(self) -> impl Iterator<Item = MediaKind> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter(move |kind| self.supports(*kind))
    }
}

impl fmt::Display for RecordingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordingProfile::Webm => "WEBM",
            RecordingProfile::Mp4 => "MP4",
            RecordingProfile::WebmAudioOnly => "WEBM_AUDIO_ONLY",
            RecordingProfile::WebmVideoOnly => "WEBM_VIDEO_ONLY",
            RecordingProfile::Mp4AudioOnly => "MP4_AUDIO_ONLY",
            RecordingProfile::Mp4VideoOnly => "MP4_VIDEO_ONLY",
            RecordingProfile::JpegVideoOnly => "JPEG_VIDEO_ONLY",
            RecordingProfile::Ksr => "KSR",
        })
    }
}
