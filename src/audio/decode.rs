//! Decoding and encoding of audio blobs
//!
//! Decoding goes through symphonia's probe so anything it has a demuxer
//! and codec for (wav, mp3, flac, ogg/vorbis) can be a music asset.
//! Captured microphone audio is packed into a 16-bit WAV blob with hound
//! and then decoded through the same path as every other asset.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use super::buffer::AudioBuffer;
use crate::error::DecodeFailure;

/// Decode an in-memory audio file
///
/// # Arguments
/// * `bytes` - The complete encoded file
/// * `extension` - Optional file extension used as a probe hint
pub fn decode(bytes: Vec<u8>, extension: Option<&str>) -> Result<AudioBuffer, DecodeFailure> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeFailure::Format(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeFailure::NoTrack)?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeFailure::Codec(e.to_string()))?;

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // End of stream
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeFailure::Codec(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count();

                // Reallocate only when a packet outgrows the scratch buffer
                let too_small = sample_buf
                    .as_ref()
                    .map_or(true, |buf| buf.capacity() < decoded.capacity() * channels);
                if too_small {
                    sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                // A corrupt packet is skipped, the rest may still be fine
                log::warn!("Skipping undecodable packet: {}", e);
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(DecodeFailure::Codec(e.to_string())),
        }
    }

    if samples.is_empty() || channels == 0 || sample_rate == 0 {
        return Err(DecodeFailure::NoFrames);
    }

    Ok(AudioBuffer::new(samples, sample_rate, channels as u16))
}

/// Pack interleaved f32 samples into a 16-bit PCM WAV file in memory
pub fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: channels.max(1),
        sample_rate: sample_rate.max(1),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
            writer.write_sample((s * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
