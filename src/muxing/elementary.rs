// Elementary stream writer
//
// Writes the codec configuration followed by every sample payload, in order,
// with no container around them. For H.264/H.265 Annex-B output this is a
// playable stream; it also gives tests a real file to inspect.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{Muxer, MuxerError, MuxerFactory, Result, TrackId};
use crate::encoding::{FrameFlags, TrackFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Opened,
    TrackAdded,
    Started,
    Stopped,
}

pub struct ElementaryMuxer {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    config: Vec<Vec<u8>>,
    state: State,
    bytes_written: u64,
}

impl ElementaryMuxer {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            config: Vec::new(),
            state: State::Opened,
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn expect_state(&self, expected: State, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(MuxerError::InvalidState(format!(
                "{} called in state {:?} on {}",
                op,
                self.state,
                self.path.display()
            )));
        }
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| MuxerError::InvalidState("muxer already released".into()))
    }
}

impl Muxer for ElementaryMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackId> {
        self.expect_state(State::Opened, "add_track")?;
        self.config = format.codec_config.clone();
        self.state = State::TrackAdded;
        Ok(TrackId(0))
    }

    fn start(&mut self) -> Result<()> {
        self.expect_state(State::TrackAdded, "start")?;
        let config = std::mem::take(&mut self.config);
        let mut written = 0u64;
        {
            let writer = self.writer()?;
            for chunk in &config {
                writer.write_all(chunk)?;
                written += chunk.len() as u64;
            }
        }
        self.bytes_written += written;
        self.state = State::Started;
        Ok(())
    }

    fn write_sample(
        &mut self,
        track: TrackId,
        data: &[u8],
        flags: FrameFlags,
        _timestamp_us: i64,
    ) -> Result<()> {
        self.expect_state(State::Started, "write_sample")?;
        if track != TrackId(0) {
            return Err(MuxerError::InvalidState(format!("unknown track {:?}", track)));
        }
        // config is already written from the track format
        if flags.is_codec_config() {
            return Ok(());
        }
        self.writer()?.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.expect_state(State::Started, "stop")?;
        self.state = State::Stopped;
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn release(&mut self) {
        self.writer = None;
    }
}

/// Opens an `ElementaryMuxer` per output file
#[derive(Debug, Default, Clone)]
pub struct ElementaryMuxerFactory;

impl MuxerFactory for ElementaryMuxerFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>> {
        Ok(Box::new(ElementaryMuxer::create(path)?))
    }
}
