//! WAV output for replayed capture audio.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use tracing::info;

/// Writes 16-bit little-endian mono `pcm` as a WAV file.
///
/// # Errors
///
/// Returns error if the file cannot be created or written.
pub fn write_wav<P: AsRef<Path>>(path: P, pcm: &[u8], sample_rate: u32) -> Result<()> {
    // ---
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create WAV file: {}", path.display()))?;
    for sample in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .context("failed to write WAV sample")?;
    }
    writer.finalize().context("failed to finalize WAV file")?;

    info!(
        "Wrote {} samples at {}Hz to {}",
        pcm.len() / 2,
        sample_rate,
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use hound::WavReader;

    #[test]
    fn written_samples_read_back() {
        // ---
        let path = std::env::temp_dir().join(format!("sco-inspect-{}.wav", std::process::id()));
        let samples: [i16; 4] = [0, 1000, -1000, i16::MAX];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        write_wav(&path, &pcm, 16000).unwrap();

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
        std::fs::remove_file(&path).unwrap();
    }
}
