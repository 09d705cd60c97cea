//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing the stream config closest to the media's sample rate

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Pick the best supported output config for the device.
///
/// With a `target_rate`, prefer the highest supported rate that is <= the target; if none
/// are, choose the lowest supported rate above it. Without one, choose the highest rate.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges = device
        .supported_output_configs()
        .context("Failed to query output configs")?;

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.map(|t| rate <= t).unwrap_or(true);
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a fixed buffer size if the device advertises a range.
///
/// Returns `None` when the device only supports its default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 4096;
            let chosen = (*max).min(MAX_FRAMES).max(*min);
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

/// Names of the output devices on this host, in host order.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.to_string());
    }
    Ok(names)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
