use crate::utils::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_G722, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU,
    MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

const TELEPHONE_EVENT: &str = "audio/telephone-event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Pcmu,
    Pcma,
    G722,
    Opus,
    H264,
    Vp8,
    Vp9,
}

impl CodecKind {
    pub const ALL: [CodecKind; 7] = [
        CodecKind::Pcmu,
        CodecKind::Pcma,
        CodecKind::G722,
        CodecKind::Opus,
        CodecKind::H264,
        CodecKind::Vp8,
        CodecKind::Vp9,
    ];

    /// Unrecognised names fall back to PCMU.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pcma" => CodecKind::Pcma,
            "g722" | "g.722" => CodecKind::G722,
            "opus" => CodecKind::Opus,
            "h264" | "h.264" => CodecKind::H264,
            "vp8" => CodecKind::Vp8,
            "vp9" => CodecKind::Vp9,
            _ => CodecKind::Pcmu,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Pcmu => "pcmu",
            CodecKind::Pcma => "pcma",
            CodecKind::G722 => "g722",
            CodecKind::Opus => "opus",
            CodecKind::H264 => "h264",
            CodecKind::Vp8 => "vp8",
            CodecKind::Vp9 => "vp9",
        }
    }

    pub fn kind(&self) -> RTPCodecType {
        match self {
            CodecKind::H264 | CodecKind::Vp8 | CodecKind::Vp9 => RTPCodecType::Video,
            _ => RTPCodecType::Audio,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind() == RTPCodecType::Video
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            CodecKind::Pcmu => 0,
            CodecKind::Pcma => 8,
            CodecKind::G722 => 9,
            CodecKind::Opus => 111,
            CodecKind::H264 => 96,
            CodecKind::Vp8 => 97,
            CodecKind::Vp9 => 98,
        }
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        let (mime_type, clock_rate, channels, sdp_fmtp_line) = match self {
            CodecKind::Pcmu => (MIME_TYPE_PCMU, 8000, 0, ""),
            CodecKind::Pcma => (MIME_TYPE_PCMA, 8000, 0, ""),
            CodecKind::G722 => (MIME_TYPE_G722, 8000, 0, ""),
            CodecKind::Opus => (MIME_TYPE_OPUS, 48000, 2, "minptime=10;useinbandfec=1"),
            CodecKind::H264 => (
                MIME_TYPE_H264,
                90000,
                0,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
            ),
            CodecKind::Vp8 => (MIME_TYPE_VP8, 90000, 0, ""),
            CodecKind::Vp9 => (MIME_TYPE_VP9, 90000, 0, "profile-id=0"),
        };
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            sdp_fmtp_line: sdp_fmtp_line.to_string(),
            rtcp_feedback: vec![],
        }
    }

    pub fn parameters(&self) -> RTCRtpCodecParameters {
        RTCRtpCodecParameters {
            capability: self.capability(),
            payload_type: self.payload_type(),
            ..Default::default()
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Descriptor handed to the media pipeline alongside raw payload bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    #[serde(with = "frame_millis")]
    pub frame_duration: Duration,
}

impl CodecConfig {
    /// Bytes carried by one millisecond of audio in this format.
    pub fn bytes_per_ms(&self) -> usize {
        let channels = self.channels.max(1) as usize;
        (self.sample_rate as usize * self.bit_depth as usize * channels) / 1000 / 8
    }

    pub fn same_format(&self, other: &CodecConfig) -> bool {
        self.codec == other.codec
            && self.sample_rate == other.sample_rate
            && self.channels == other.channels
    }
}

mod frame_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone)]
pub struct CodecSelector {
    codec: CodecKind,
    config: CodecConfig,
}

impl CodecSelector {
    pub fn new(codec_name: &str) -> Self {
        let codec = CodecKind::from_name(codec_name);
        let config = CodecConfig {
            codec: codec.name().to_string(),
            sample_rate: 8000,
            channels: 1,
            bit_depth: 8,
            frame_duration: Duration::from_millis(20),
        };
        Self { codec, config }
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn config(&self) -> CodecConfig {
        self.config.clone()
    }

    pub fn parameters(&self) -> RTCRtpCodecParameters {
        self.codec.parameters()
    }

    /// A fresh engine with every supported codec registered. Built per connection.
    pub fn media_engine(&self) -> Result<MediaEngine> {
        let mut engine = MediaEngine::default();
        for codec in CodecKind::ALL {
            engine.register_codec(codec.parameters(), codec.kind())?;
        }
        engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: TELEPHONE_EVENT.to_string(),
                    clock_rate: 8000,
                    ..Default::default()
                },
                payload_type: 101,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        Ok(engine)
    }
}

/// Reads the first audio format of `sdp` back out of its `a=rtpmap` line.
pub fn preferred_audio_codec(sdp: &str) -> Result<CodecConfig> {
    let mut in_audio = false;
    let mut first_format: Option<String> = None;

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            if first_format.is_some() {
                break;
            }
            let mut fields = media.split_whitespace();
            in_audio = fields.next() == Some("audio");
            if in_audio {
                // m=audio <port> <proto> <fmt> ...
                first_format = fields.nth(2).map(str::to_string);
            }
            continue;
        }
        if !in_audio {
            continue;
        }
        let (Some(fmt), Some(rtpmap)) = (first_format.as_deref(), line.strip_prefix("a=rtpmap:"))
        else {
            continue;
        };
        let mut parts = rtpmap.splitn(2, ' ');
        if parts.next() != Some(fmt) {
            continue;
        }
        let encoding = parts
            .next()
            .ok_or_else(|| Error::Codec(format!("malformed rtpmap: {}", rtpmap)))?;
        let mut enc = encoding.split('/');
        let name = enc.next().unwrap_or_default().to_ascii_lowercase();
        let sample_rate = enc
            .next()
            .and_then(|r| r.parse().ok())
            .ok_or_else(|| Error::Codec(format!("missing clock rate in rtpmap: {}", rtpmap)))?;
        return Ok(CodecConfig {
            codec: name,
            sample_rate,
            channels: 1,
            bit_depth: 8,
            frame_duration: Duration::from_millis(20),
        });
    }

    Err(Error::Codec("did not find audio codec in SDP".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codec_names_fall_back_to_pcmu() {
        assert_eq!(CodecKind::from_name("speex"), CodecKind::Pcmu);
        assert_eq!(CodecKind::from_name(""), CodecKind::Pcmu);
        assert_eq!(CodecKind::from_name("OPUS"), CodecKind::Opus);
        assert_eq!(CodecKind::from_name("G.722"), CodecKind::G722);
    }

    #[test]
    fn payload_types_and_clock_rates() {
        assert_eq!(CodecKind::Pcma.payload_type(), 8);
        assert_eq!(CodecKind::Opus.capability().clock_rate, 48000);
        assert_eq!(CodecKind::Vp8.capability().mime_type, MIME_TYPE_VP8);
        assert!(CodecKind::H264.is_video());
        assert!(!CodecKind::G722.is_video());
    }

    #[test]
    fn media_engine_registers_all_codecs() {
        let selector = CodecSelector::new("opus");
        assert!(selector.media_engine().is_ok());
        assert_eq!(selector.codec(), CodecKind::Opus);
        assert_eq!(selector.config().codec, "opus");
    }

    #[test]
    fn bytes_per_ms_for_g711() {
        let config = CodecSelector::new("pcmu").config();
        assert_eq!(config.bytes_per_ms(), 8);
    }

    #[test]
    fn preferred_codec_reads_first_audio_format() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                   m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 H264/90000\r\n\
                   m=audio 9 UDP/TLS/RTP/SAVPF 8 0\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n";
        let config = preferred_audio_codec(sdp).unwrap();
        assert_eq!(config.codec, "pcma");
        assert_eq!(config.sample_rate, 8000);
    }

    #[test]
    fn preferred_codec_requires_audio_section() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n";
        assert!(matches!(preferred_audio_codec(sdp), Err(Error::Codec(_))));
    }
}
