//! Debug recording of the raw capture and clean streams.
//!
//! `mic.wav` holds the capture slots exactly as delivered (interleaved mic
//! channels); `clean.wav` holds the beam outputs re-interleaved so standard
//! tools can open them.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::info;

use crate::buffering::chunk::AudioBlock;
use crate::error::Result;
use crate::selection::ArrayConfig;

pub const MIC_FILE: &str = "mic.wav";
pub const CLEAN_FILE: &str = "clean.wav";

type Writer = WavWriter<BufWriter<File>>;

pub struct AudioDump {
    dir: PathBuf,
    mic: Writer,
    clean: Writer,
}

impl AudioDump {
    /// Create `dir` if needed and open both recordings, truncating old ones.
    pub fn create(dir: &Path, array: &ArrayConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let spec = |channels: usize| WavSpec {
            channels: channels as u16,
            sample_rate: array.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mic = WavWriter::create(dir.join(MIC_FILE), spec(array.mic_channels))?;
        let clean = WavWriter::create(dir.join(CLEAN_FILE), spec(array.beam_channels))?;
        info!(dir = %dir.display(), "audio dump enabled");
        Ok(Self {
            dir: dir.to_path_buf(),
            mic,
            clean,
        })
    }

    pub fn write_mic(&mut self, raw: &[i16]) -> Result<()> {
        let mut w = self.mic.get_i16_writer(raw.len() as u32);
        for s in raw {
            w.write_sample(*s);
        }
        w.flush()?;
        Ok(())
    }

    pub fn write_clean(&mut self, block: &AudioBlock) -> Result<()> {
        let mut w = self.clean.get_i16_writer(block.as_slice().len() as u32);
        for s in block.interleaved() {
            w.write_sample(s);
        }
        w.flush()?;
        Ok(())
    }

    /// Patch the WAV headers and close both files.
    pub fn finalize(self) -> Result<()> {
        self.mic.finalize()?;
        self.clean.finalize()?;
        info!(dir = %self.dir.display(), "audio dump finalized");
        Ok(())
    }
}

impl std::fmt::Debug for AudioDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDump")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
