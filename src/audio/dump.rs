use super::codec::DecodedAudio;
use super::segment::SpeechSegment;
use crate::error::Result;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Writes decoded speech segments to disk for inspection.
///
/// Each segment becomes `<index>-<segment_id>-<sentence>.wav` (32-bit float)
/// plus a `.txt` file with its metadata.
#[derive(Debug)]
pub struct SegmentDumper {
    output_dir: PathBuf,
    next_index: AtomicUsize,
}

impl SegmentDumper {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        info!("Dumping speech segments to {}", output_dir.display());

        Ok(Self {
            output_dir,
            next_index: AtomicUsize::new(0),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write one segment; returns the WAV path
    pub fn write(&self, segment: &SpeechSegment, audio: &DecodedAudio) -> Result<PathBuf> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let stem = format!(
            "{:04}-{}-{}",
            index,
            sanitize(&segment.segment_id),
            segment.sentence_number
        );
        let wav_path = self.output_dir.join(format!("{}.wav", stem));

        let spec = hound::WavSpec {
            channels: audio.channels.max(1),
            sample_rate: audio.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&wav_path, spec)?;
        for sample in &audio.samples {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;

        let meta_path = self.output_dir.join(format!("{}.txt", stem));
        let mut meta = BufWriter::new(File::create(&meta_path)?);
        writeln!(meta, "segment_id: {}", segment.segment_id)?;
        writeln!(meta, "sentence_number: {}", segment.sentence_number)?;
        writeln!(meta, "format: {}", segment.format)?;
        writeln!(meta, "sample_rate: {}", audio.sample_rate)?;
        writeln!(meta, "channels: {}", audio.channels)?;
        writeln!(meta, "samples: {}", audio.samples.len())?;
        writeln!(meta, "duration_seconds: {:.3}", segment.duration_seconds)?;
        writeln!(meta, "text: {}", segment.text)?;
        meta.flush()?;

        debug!("Dumped segment {} to {}", segment.key(), wav_path.display());
        Ok(wav_path)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_wav_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = SegmentDumper::new(dir.path().join("dump")).unwrap();

        let segment = SpeechSegment {
            segment_id: "resp/1".to_string(),
            sentence_number: 2,
            audio_data: String::new(),
            sample_rate: 24000,
            text: "Hello there".to_string(),
            format: "pcm_f32le".to_string(),
            duration_seconds: 0.5,
        };
        let audio = DecodedAudio {
            samples: vec![0.1, -0.2, 0.3],
            sample_rate: 24000,
            channels: 1,
        };

        let path = dumper.write(&segment, &audio).unwrap();
        assert!(path.ends_with("0000-resp_1-2.wav"));

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24000);
        assert_eq!(reader.len(), 3);

        let meta = fs::read_to_string(path.with_extension("txt")).unwrap();
        assert!(meta.contains("text: Hello there"));
    }
}
