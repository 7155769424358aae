//! WAV export for finished takes

use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};

use crate::types::SampleBuffer;

/// Write a buffer as 16-bit stereo PCM
pub fn write_wav(buffer: &SampleBuffer, path: &Path) -> Result<()> {
    let spec = WavSpec {
        channels: 2,
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {:?}", path))?;

    for &sample in buffer.as_interleaved() {
        let clamped = sample.clamp(-1.0, 1.0);
        writer
            .write_sample((clamped * i16::MAX as f32) as i16)
            .context("failed to write sample")?;
    }

    writer.finalize().context("failed to finalize WAV")?;
    log::info!("Wrote {:?} ({} frames)", path, buffer.len());
    Ok(())
}

/// Default filename for a take, stamped with the local time
pub fn take_filename(track_name: &str) -> String {
    let stamp = chrono::Local::now().format("%Y-%m-%d %H-%M-%S");
    format!("{} {}.wav", track_name, stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoFrame;

    #[test]
    fn test_roundtrip_through_hound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");

        let mut buffer = SampleBuffer::new(48000);
        for i in 0..100 {
            buffer.push(StereoFrame::new(i as f32 / 200.0, -(i as f32) / 200.0));
        }
        write_wav(&buffer, &path).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48000);

        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 200);
        // Frame 50 left = 0.25
        let expected = (0.25 * i16::MAX as f32) as i16;
        assert_eq!(samples[100], expected);
    }

    #[test]
    fn test_out_of_range_samples_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hot.wav");

        let mut buffer = SampleBuffer::new(44100);
        buffer.push(StereoFrame::new(2.0, -3.0));
        write_wav(&buffer, &path).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![i16::MAX, -i16::MAX]);
    }

    #[test]
    fn test_take_filename_shape() {
        let name = take_filename("Vocals");
        assert!(name.starts_with("Vocals "));
        assert!(name.ends_with(".wav"));
    }
}
