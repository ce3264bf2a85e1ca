//! Rewind Ring Benchmark
//!
//! Measures the two hot paths of the capture buffer using the library's own
//! types: pushing encoded frames into the ring (with eviction once it is full)
//! and saving a snapshot clip through the persistence worker.
//!
//! Usage:
//!   cargo run -p rewind-tools --bin ring_benchmark [-- [OPTIONS]]
//!
//! Options:
//!   --bitrate <bps>     Stream bitrate the ring is sized for (default: 6 Mbit/s)
//!   --fps <fps>         Frame rate (default: 30)
//!   --seconds <secs>    Buffered span (default: 7)
//!   --frames <n>        Frames pushed in the ring benchmark (default: 100000)
//!   --verbose           Extra debug output
//!   --help              Show this help message

use std::sync::Arc;
use std::time::{Duration, Instant};

use rewind_lib::encoding::FrameFlags;
use rewind_lib::muxing::ElementaryMuxerFactory;
use rewind_lib::session::{CaptureSession, SessionCallbacks};
use rewind_lib::test_utils::{h264_format, save_events, ScriptedEncoder};
use rewind_lib::{Config, ContainerFormat, FrameRing};

const DEFAULT_BITRATE: u32 = 6 * 1024 * 1024;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_SECONDS: f64 = 7.0;
const DEFAULT_FRAMES: usize = 100_000;
const GOP: usize = 60;

fn print_help() {
    println!(
        "\n\
Rewind Ring Benchmark

Measures frame ring push throughput and snapshot save latency.

USAGE:
    cargo run -p rewind-tools --bin ring_benchmark [-- [OPTIONS]]

OPTIONS:
    --bitrate <bps>     Stream bitrate the ring is sized for (default: {DEFAULT_BITRATE})
    --fps <fps>         Frame rate (default: {DEFAULT_FPS})
    --seconds <secs>    Buffered span (default: {DEFAULT_SECONDS})
    --frames <n>        Frames pushed in the ring benchmark (default: {DEFAULT_FRAMES})
    --verbose           Extra debug output
    --help              Show this help message
"
    );
}

fn parse_arg_value<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<T>().ok())
}

/// Encoded frame sizes for a stream at `bitrate`: keyframes are eight times
/// the size of the frames between them, averaging out to the bitrate.
fn frame_sizes(bitrate: u32, fps: f64) -> (usize, usize) {
    let per_gop = bitrate as f64 / 8.0 * GOP as f64 / fps;
    let delta = per_gop / (GOP as f64 - 1.0 + 8.0);
    ((delta * 8.0) as usize, (delta as usize).max(1))
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        std::process::exit(0);
    }

    let verbose = args.iter().any(|a| a == "--verbose");
    let bitrate = parse_arg_value::<u32>(&args, "--bitrate").unwrap_or(DEFAULT_BITRATE);
    let fps = parse_arg_value::<f64>(&args, "--fps").unwrap_or(DEFAULT_FPS);
    let seconds = parse_arg_value::<f64>(&args, "--seconds").unwrap_or(DEFAULT_SECONDS);
    let frames = parse_arg_value::<usize>(&args, "--frames").unwrap_or(DEFAULT_FRAMES);

    let log_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    println!("\n=== Rewind Ring Benchmark ===\n");
    println!("  Stream:  {:.1} Mbit/s @ {:.0} fps", bitrate as f64 / 1_000_000.0, fps);
    println!("  Span:    {:.1}s", seconds);
    println!();

    bench_push(bitrate, fps, seconds, frames);

    if let Err(e) = bench_snapshot(bitrate, fps, seconds) {
        eprintln!("  Snapshot benchmark failed: {}", e);
        std::process::exit(1);
    }
}

fn bench_push(bitrate: u32, fps: f64, seconds: f64, frames: usize) {
    let (key_size, delta_size) = frame_sizes(bitrate, fps);
    let key = vec![0xAAu8; key_size];
    let delta = vec![0x55u8; delta_size];
    let frame_us = (1_000_000.0 / fps) as i64;

    let mut ring = FrameRing::new(bitrate as f64, fps, seconds);
    println!(
        "  Ring:    {} bytes, {} slots, keyframe {} B, delta {} B",
        ring.data_capacity(),
        ring.capacity(),
        key_size,
        delta_size
    );

    let start = Instant::now();
    let mut bytes = 0usize;
    for i in 0..frames {
        let (payload, flags) = if i % GOP == 0 {
            (&key, FrameFlags::KEYFRAME)
        } else {
            (&delta, FrameFlags::NONE)
        };
        if let Err(e) = ring.push_back(payload, flags, i as i64 * frame_us) {
            eprintln!("  Push failed at frame {}: {}", i, e);
            return;
        }
        bytes += payload.len();
    }
    let elapsed = start.elapsed();

    println!("\n  push_back");
    println!("    frames:      {}", frames);
    println!("    time:        {:.1} ms", elapsed.as_secs_f64() * 1000.0);
    println!("    per frame:   {:.0} ns", elapsed.as_nanos() as f64 / frames.max(1) as f64);
    println!("    throughput:  {:.0} MB/s", bytes as f64 / 1_000_000.0 / elapsed.as_secs_f64());
    println!(
        "    retained:    {} frames, {:.2}s",
        ring.len(),
        ring.buffered_duration_us() as f64 / 1_000_000.0
    );
}

fn bench_snapshot(bitrate: u32, fps: f64, seconds: f64) -> Result<(), String> {
    let dir = tempfile::tempdir().map_err(|e| format!("temp dir: {}", e))?;

    let mut config = Config::default();
    config.storage_path = dir.path().to_path_buf();
    config.container = ContainerFormat::Elementary;
    config.buffer.bitrate_bps = bitrate;
    config.buffer.frame_rate = fps;
    config.buffer.span_secs = seconds;
    config.snapshot.settle_delay_secs = 0.0;

    let (encoder, feed) = ScriptedEncoder::with_feed();
    let (on_save, saves) = save_events();
    let callbacks = SessionCallbacks {
        on_save: Some(on_save),
        on_buffer_status: None,
    };
    let session = CaptureSession::start(config, encoder, Arc::new(ElementaryMuxerFactory), callbacks)
        .map_err(|e| e.to_string())?;

    // Fill the ring with a full span of video
    let (key_size, delta_size) = frame_sizes(bitrate, fps);
    let frame_us = (1_000_000.0 / fps) as i64;
    let count = (fps * seconds).ceil() as usize;
    feed.push_format(h264_format());
    for i in 0..count {
        let (size, flags) = if i % GOP == 0 {
            (key_size, FrameFlags::KEYFRAME)
        } else {
            (delta_size, FrameFlags::NONE)
        };
        feed.push_frame(vec![(i % 251) as u8; size], flags, i as i64 * frame_us);
    }
    session.frame_available_soon().map_err(|e| e.to_string())?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while session.drain_stats().frames < count as u64 {
        if Instant::now() > deadline {
            return Err("drain worker did not keep up".into());
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let start = Instant::now();
    session.save_snapshot().map_err(|e| e.to_string())?;
    let (path, success) = saves
        .recv_timeout(Duration::from_secs(10))
        .map_err(|e| format!("no save result: {}", e))?;
    let elapsed = start.elapsed();
    if !success {
        return Err(format!("snapshot to {} failed", path.display()));
    }
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    println!("\n  snapshot");
    println!("    file size:   {:.2} MB", size as f64 / 1_000_000.0);
    println!("    time:        {:.1} ms", elapsed.as_secs_f64() * 1000.0);

    session.shutdown().map_err(|e| e.to_string())?;
    Ok(())
}
