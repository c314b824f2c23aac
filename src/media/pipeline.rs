use crate::rtc::codec::CodecConfig;
use crate::utils::{Error, Result};
use bytes::Bytes;

/// Boundary to whatever decodes, resamples and re-encodes media between two formats.
pub trait MediaPipeline: Send + Sync {
    /// Converts `payload` from `source` to `target`, yielding zero or more frames.
    fn transcode(&self, payload: Bytes, source: &CodecConfig, target: &CodecConfig)
        -> Result<Vec<Bytes>>;
}

/// Relays payloads untouched when both sides already agree on the format,
/// splitting them into frames of the target's frame duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPipeline;

impl MediaPipeline for PassthroughPipeline {
    fn transcode(
        &self,
        payload: Bytes,
        source: &CodecConfig,
        target: &CodecConfig,
    ) -> Result<Vec<Bytes>> {
        if !source.same_format(target) {
            return Err(Error::Codec(format!(
                "no transcoder from {}/{} to {}/{}",
                source.codec, source.sample_rate, target.codec, target.sample_rate
            )));
        }
        if payload.is_empty() {
            return Ok(Vec::new());
        }

        let frame_len = target.bytes_per_ms() * target.frame_duration.as_millis() as usize;
        if frame_len == 0 || payload.len() <= frame_len {
            return Ok(vec![payload]);
        }

        let mut frames = Vec::with_capacity(payload.len() / frame_len + 1);
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + frame_len).min(payload.len());
            frames.push(payload.slice(offset..end));
            offset = end;
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::codec::CodecSelector;

    #[test]
    fn passthrough_reframes_to_target_duration() {
        let pcmu = CodecSelector::new("pcmu").config();
        // 20ms of 8kHz 8-bit mono is 160 bytes
        let frames = PassthroughPipeline
            .transcode(Bytes::from(vec![1u8; 400]), &pcmu, &pcmu)
            .unwrap();
        let sizes: Vec<usize> = frames.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![160, 160, 80]);
    }

    #[test]
    fn empty_payload_yields_nothing() {
        let pcmu = CodecSelector::new("pcmu").config();
        assert!(PassthroughPipeline
            .transcode(Bytes::new(), &pcmu, &pcmu)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn format_mismatch_is_a_codec_error() {
        let pcmu = CodecSelector::new("pcmu").config();
        let opus = CodecSelector::new("opus").config();
        assert!(matches!(
            PassthroughPipeline.transcode(Bytes::from_static(b"x"), &pcmu, &opus),
            Err(Error::Codec(_))
        ));
    }
}
