// Container muxer built on GStreamer
//
// Pipeline: appsrc -> parser -> muxer -> filesink
// The codec config captured from the encoder is pushed in front of the first
// sample, so the parser sees parameter sets in-band.

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use super::{Muxer, MuxerError, MuxerFactory, Result, TrackId};
use crate::encoding::{ContainerFormat, FrameFlags, TrackFormat, VideoCodec};

/// Convert a float frame rate to a GStreamer fraction (29.97 -> 30000/1001)
fn fps_to_gst_fraction(fps: f64) -> gst::Fraction {
    if (fps - fps.round()).abs() < 0.001 {
        gst::Fraction::new(fps.round() as i32, 1)
    } else {
        gst::Fraction::new((fps * 1001.0).round() as i32, 1001)
    }
}

fn pipeline_err(what: &str, e: impl std::fmt::Display) -> MuxerError {
    MuxerError::Pipeline(format!("{}: {}", what, e))
}

pub struct GstMuxer {
    path: PathBuf,
    container: ContainerFormat,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    pending_config: Vec<u8>,
    first_pts_us: Option<i64>,
    started: bool,
}

impl GstMuxer {
    fn new(path: &Path, container: ContainerFormat) -> Self {
        Self {
            path: path.to_path_buf(),
            container,
            pipeline: None,
            appsrc: None,
            pending_config: Vec::new(),
            first_pts_us: None,
            started: false,
        }
    }

    fn build_pipeline(&self, format: &TrackFormat) -> Result<(gst::Pipeline, gst_app::AppSrc)> {
        let container = match self.container {
            ContainerFormat::Elementary => format.codec.container(),
            other => other,
        };
        let muxer_name = container
            .gst_muxer()
            .ok_or_else(|| MuxerError::Pipeline("no muxer element for container".into()))?;

        let pipeline = gst::Pipeline::new();

        let mut caps = gst::Caps::builder(format.codec.gst_caps_name())
            .field("width", format.width as i32)
            .field("height", format.height as i32)
            .field("framerate", fps_to_gst_fraction(format.frame_rate));
        if matches!(format.codec, VideoCodec::H264 | VideoCodec::H265) {
            caps = caps
                .field("stream-format", "byte-stream")
                .field("alignment", "au");
        }

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps.build())
            .format(gst::Format::Time)
            .build();

        let parser = gst::ElementFactory::make(format.codec.gst_parser())
            .build()
            .map_err(|e| pipeline_err(&format!("Failed to create {}", format.codec.gst_parser()), e))?;

        let muxer = gst::ElementFactory::make(muxer_name)
            .build()
            .map_err(|e| pipeline_err(&format!("Failed to create {}", muxer_name), e))?;

        let filesink = gst::ElementFactory::make("filesink")
            .property("location", self.path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|e| pipeline_err("Failed to create filesink", e))?;

        pipeline
            .add_many([appsrc.upcast_ref(), &parser, &muxer, &filesink])
            .map_err(|e| pipeline_err("Failed to add elements", e))?;
        gst::Element::link_many([appsrc.upcast_ref(), &parser, &muxer, &filesink])
            .map_err(|e| pipeline_err("Failed to link elements", e))?;

        Ok((pipeline, appsrc))
    }
}

impl Muxer for GstMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackId> {
        if self.pipeline.is_some() {
            return Err(MuxerError::InvalidState("track already added".into()));
        }
        let (pipeline, appsrc) = self.build_pipeline(format)?;
        self.pending_config = format.codec_config.concat();
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        Ok(TrackId(0))
    }

    fn start(&mut self) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| MuxerError::InvalidState("start before add_track".into()))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| pipeline_err("Failed to start pipeline", e))?;
        self.started = true;
        Ok(())
    }

    fn write_sample(
        &mut self,
        _track: TrackId,
        data: &[u8],
        flags: FrameFlags,
        timestamp_us: i64,
    ) -> Result<()> {
        if !self.started {
            return Err(MuxerError::InvalidState("write_sample before start".into()));
        }
        if flags.is_codec_config() {
            return Ok(());
        }

        let base = *self.first_pts_us.get_or_insert(timestamp_us);
        let pts_us = timestamp_us.saturating_sub(base).max(0) as u64;

        let mut payload = std::mem::take(&mut self.pending_config);
        payload.extend_from_slice(data);

        let mut buffer = gst::Buffer::from_mut_slice(payload);
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| MuxerError::Pipeline("new buffer is shared".into()))?;
            buffer_ref.set_pts(gst::ClockTime::from_useconds(pts_us));
            if !flags.is_keyframe() {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        let appsrc = self
            .appsrc
            .as_ref()
            .ok_or_else(|| MuxerError::InvalidState("muxer released".into()))?;
        appsrc
            .push_buffer(buffer)
            .map_err(|e| MuxerError::Pipeline(format!("Failed to push buffer: {:?}", e)))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(MuxerError::InvalidState("stop before start".into()));
        }
        self.started = false;

        let (Some(pipeline), Some(appsrc)) = (self.pipeline.as_ref(), self.appsrc.as_ref()) else {
            return Err(MuxerError::InvalidState("muxer released".into()));
        };

        if let Err(e) = appsrc.end_of_stream() {
            log::warn!("Failed to send EOS to {}: {:?}", self.path.display(), e);
        }

        let mut pipeline_error: Option<String> = None;
        if let Some(bus) = pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        pipeline_error = Some(format!(
                            "Pipeline error: {} ({:?})",
                            err.error(),
                            err.debug()
                        ));
                        break;
                    }
                    _ => {}
                }
            }
        }

        let _ = pipeline.set_state(gst::State::Null);

        match pipeline_error {
            Some(err) => Err(MuxerError::Pipeline(err)),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        self.appsrc = None;
    }
}

impl Drop for GstMuxer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens a GStreamer muxer per output file
#[derive(Debug, Clone)]
pub struct GstMuxerFactory {
    container: ContainerFormat,
}

impl GstMuxerFactory {
    /// Initialize GStreamer and create a factory for `container`
    /// (`Elementary` picks the codec's natural container)
    pub fn new(container: ContainerFormat) -> Result<Self> {
        gst::init().map_err(|e| pipeline_err("Failed to initialize GStreamer", e))?;
        Ok(Self { container })
    }
}

impl MuxerFactory for GstMuxerFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>> {
        Ok(Box::new(GstMuxer::new(path, self.container)))
    }
}
