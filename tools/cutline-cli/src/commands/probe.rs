//! Show stream information for a source.

use std::path::PathBuf;

use cutline_media::ffmpeg::FfmpegBackend;
use cutline_media::MediaBackend;

pub fn run(path: PathBuf, json: bool) -> anyhow::Result<()> {
    let media = FfmpegBackend::new();
    let source = media
        .open_source(&path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
    let info = source.stream_info();

    if json {
        println!("{}", serde_json::to_string_pretty(info)?);
        return Ok(());
    }

    println!("Source: {}", path.display());
    println!("  Codec: {}", info.codec_name);
    println!("  Resolution: {}x{}", info.width, info.height);
    if let Some(format) = info.format {
        println!("  Pixel format: {format}");
    }
    println!("  Frame rate: {} ({:.3} fps)", info.frame_rate, info.frame_rate.as_f64());
    println!("  Time base: {}", info.time_base);
    println!("  Frames: {}", info.total_frames());
    println!(
        "  Colour: {:?} / {:?} / {:?}",
        info.color.range, info.color.space, info.color.transfer
    );
    if info.codec.is_none() {
        println!("  Note: this codec can be decoded but not chosen as an output codec");
    }

    Ok(())
}
