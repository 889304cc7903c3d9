//! TTS pipeline (spec §4.7, §6 "TTS artifact filesystem layout").
//!
//! Two modes: `full-chunk` (accumulate all of a response's audio, wrap with
//! a format header, write one artifact, enqueue one playback) and `stream`
//! (write a per-chunk artifact immediately, also append into a rolling
//! full-response buffer archived at stream end).
//!
//! No teacher analogue writes audio to disk (Discord playback stays
//! in-memory); the RIFF/WAVE header writer is enrichment from the rest of
//! the pack — `SinergaOptima-Dictum` depends on `hound` for exactly this
//! purpose (see DESIGN.md).

use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::ids::{CallId, ResponseId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsPlaybackMode {
    FullChunk,
    Stream,
}

impl TtsPlaybackMode {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "stream" | "streaming" => TtsPlaybackMode::Stream,
            _ => TtsPlaybackMode::FullChunk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    LinearPcm16,
    MuLaw,
    Mp3,
    Opus,
    Other,
}

impl AudioCodec {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pcm16" | "pcm" | "linear16" | "l16" => AudioCodec::LinearPcm16,
            "ulaw" | "mulaw" | "g711u" => AudioCodec::MuLaw,
            "mp3" => AudioCodec::Mp3,
            "opus" => AudioCodec::Opus,
            _ => AudioCodec::Other,
        }
    }

    /// File extension for this codec (spec §6).
    pub fn extension(self) -> &'static str {
        match self {
            AudioCodec::LinearPcm16 => "wav",
            AudioCodec::MuLaw => "ulaw",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Opus => "opus",
            AudioCodec::Other => "raw",
        }
    }
}

/// Builds an artifact filename: `<call-id>_<unix-millis>.<ext>`.
pub fn artifact_filename(call_id: &CallId, unix_millis: u128, codec: AudioCodec) -> String {
    format!("{}_{}.{}", call_id.as_str(), unix_millis, codec.extension())
}

pub fn artifact_dir(sounds_root: &str, mode: TtsPlaybackMode, archival: bool) -> PathBuf {
    let sub = if archival {
        "openai_stream_backup"
    } else {
        match mode {
            TtsPlaybackMode::FullChunk => "openai",
            TtsPlaybackMode::Stream => "openai_stream_chunks",
        }
    };
    Path::new(sounds_root).join(sub)
}

/// Wraps raw linear-PCM samples in a RIFF/WAVE header using `hound`,
/// returning the complete file bytes. Non-PCM codecs pass through
/// unchanged (spec §4.7: "pass-through for compressed codecs").
pub fn wrap_with_format_header(
    raw_audio: &[u8],
    codec: AudioCodec,
    sample_rate: u32,
) -> std::io::Result<Vec<u8>> {
    if codec != AudioCodec::LinearPcm16 {
        return Ok(raw_audio.to_vec());
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        for chunk in raw_audio.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        }
        writer
            .finalize()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    }
    Ok(cursor.into_inner())
}

/// Accumulates a response's chunks in `full-chunk` mode until
/// `audio-stream-end`, then produces the complete concatenated artifact.
pub struct FullChunkAccumulator {
    response_id: ResponseId,
    chunks: Vec<Vec<u8>>,
}

impl FullChunkAccumulator {
    pub fn new(response_id: ResponseId) -> Self {
        Self {
            response_id,
            chunks: Vec::new(),
        }
    }

    pub fn response_id(&self) -> &ResponseId {
        &self.response_id
    }

    pub fn push(&mut self, bytes: Vec<u8>) {
        self.chunks.push(bytes);
    }

    /// Concatenates chunks in arrival order and wraps with a format header.
    pub fn finish(self, codec: AudioCodec, sample_rate: u32) -> std::io::Result<Vec<u8>> {
        let concatenated: Vec<u8> = self.chunks.into_iter().flatten().collect();
        wrap_with_format_header(&concatenated, codec, sample_rate)
    }
}

/// Rolling full-response buffer kept alongside per-chunk artifacts in
/// `stream` mode, for archival at stream end.
pub struct StreamArchiveBuffer {
    response_id: ResponseId,
    bytes: Vec<u8>,
}

impl StreamArchiveBuffer {
    pub fn new(response_id: ResponseId) -> Self {
        Self {
            response_id,
            bytes: Vec::new(),
        }
    }

    pub fn response_id(&self) -> &ResponseId {
        &self.response_id
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Tracks every artifact file path created for a call, so cleanup can
/// delete them all even if the call ends mid-stream (spec §4.7, §8: "every
/// artifact file created by the TTS pipeline is deleted by cleanup").
#[derive(Default)]
pub struct ArtifactTracker {
    paths: Vec<PathBuf>,
}

impl ArtifactTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Deletes every tracked artifact, tolerating files that are already
    /// gone (spec §7: absorbed "not found" errors during cleanup).
    pub async fn delete_all(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(?path, %err, "failed to delete tts artifact");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_extension_matches_spec_table() {
        assert_eq!(AudioCodec::LinearPcm16.extension(), "wav");
        assert_eq!(AudioCodec::MuLaw.extension(), "ulaw");
        assert_eq!(AudioCodec::Mp3.extension(), "mp3");
        assert_eq!(AudioCodec::Opus.extension(), "opus");
        assert_eq!(AudioCodec::Other.extension(), "raw");
    }

    #[test]
    fn pcm_audio_gets_a_riff_wave_header() {
        let samples: Vec<u8> = vec![0, 0, 1, 0, 2, 0];
        let wrapped = wrap_with_format_header(&samples, AudioCodec::LinearPcm16, 8000).unwrap();
        assert!(wrapped.starts_with(b"RIFF"));
        assert!(wrapped.len() > samples.len());
    }

    #[test]
    fn compressed_codec_passes_through_unchanged() {
        let raw = vec![1, 2, 3, 4];
        let wrapped = wrap_with_format_header(&raw, AudioCodec::MuLaw, 8000).unwrap();
        assert_eq!(wrapped, raw);
    }

    #[test]
    fn full_chunk_accumulator_concatenates_in_arrival_order() {
        let mut acc = FullChunkAccumulator::new(ResponseId::new());
        acc.push(vec![1, 2]);
        acc.push(vec![3, 4]);
        let finished = acc.finish(AudioCodec::Other, 8000).unwrap();
        assert_eq!(finished, vec![1, 2, 3, 4]);
    }

    #[test]
    fn stream_archive_buffer_appends_in_order() {
        let mut buf = StreamArchiveBuffer::new(ResponseId::new());
        buf.append(&[1, 2]);
        buf.append(&[3]);
        assert_eq!(buf.into_bytes(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn artifact_tracker_deletes_files_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.wav");
        tokio::fs::write(&path, b"data").await.unwrap();

        let mut tracker = ArtifactTracker::new();
        tracker.track(path.clone());
        tracker.track(dir.path().join("already-gone.wav"));
        tracker.delete_all().await;

        assert!(!path.exists());
        assert!(tracker.paths().is_empty());
    }

    #[test]
    fn artifact_filename_includes_call_id_and_timestamp() {
        let name = artifact_filename(&CallId::from("C1"), 1_700_000_000_000, AudioCodec::LinearPcm16);
        assert_eq!(name, "C1_1700000000000.wav");
    }
}
