//! Desktop bridge: real screen capture via `screenshots`, JPEG via `image`.

use crate::bridge::{HostBridge, TrackingContext};
use crate::error::BridgeError;
use crate::models::ActivityCounters;
use crate::monitor::ActivityMonitor;
use image::imageops::{resize, FilterType};
use image::{DynamicImage, ImageBuffer, Rgb, Rgba};
use std::sync::Arc;
use tracing::{debug, info, warn};

// Target: max 1280x720 to keep file size under 1MB (for nginx limit)
const MAX_WIDTH: u32 = 1280;
const MAX_HEIGHT: u32 = 720;

pub struct DesktopBridge {
    monitor: Arc<ActivityMonitor>,
    device_id: Option<String>,
}

impl DesktopBridge {
    pub fn new(monitor: Arc<ActivityMonitor>, device_id: Option<String>) -> Self {
        Self { monitor, device_id }
    }
}

/// Снять первый экран, уменьшить до 1280x720 и закодировать в JPEG
pub fn capture_primary_screen_jpeg() -> Result<Vec<u8>, BridgeError> {
    let screens = screenshots::Screen::all().map_err(|e| {
        BridgeError::Capture(format!(
            "Failed to get screens: {:?}. Check screen recording permission.",
            e
        ))
    })?;
    let screen = screens
        .first()
        .ok_or_else(|| BridgeError::Capture("No screens available".to_string()))?;

    let image = screen
        .capture()
        .map_err(|e| BridgeError::Capture(format!("Failed to capture screenshot: {:?}", e)))?;

    let width = image.width();
    let height = image.height();
    if width == 0 || height == 0 {
        return Err(BridgeError::Capture(format!(
            "Invalid screenshot dimensions: {}x{}",
            width, height
        )));
    }

    let img_buffer: ImageBuffer<Rgba<u8>, Vec<u8>> =
        ImageBuffer::from_raw(width, height, image.rgba().to_vec()).ok_or_else(|| {
            BridgeError::Encode("Failed to create ImageBuffer from RGBA data".to_string())
        })?;

    let final_buffer = if width > MAX_WIDTH || height > MAX_HEIGHT {
        let (new_width, new_height) = fit_within(width, height, MAX_WIDTH, MAX_HEIGHT);
        debug!(
            "[CAPTURE] Resizing {}x{} to {}x{}",
            width, height, new_width, new_height
        );
        resize(&img_buffer, new_width, new_height, FilterType::Lanczos3)
    } else {
        img_buffer
    };

    // JPEG doesn't support alpha channel
    let rgb_buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(final_buffer.width(), final_buffer.height(), |x, y| {
            let pixel = final_buffer.get_pixel(x, y);
            Rgb([pixel[0], pixel[1], pixel[2]])
        });

    let mut jpeg_bytes = Vec::new();
    DynamicImage::ImageRgb8(rgb_buffer)
        .write_to(
            &mut std::io::Cursor::new(&mut jpeg_bytes),
            image::ImageFormat::Jpeg,
        )
        .map_err(|e| BridgeError::Encode(format!("Failed to encode JPEG: {:?}", e)))?;

    if jpeg_bytes.is_empty() {
        return Err(BridgeError::Encode(
            "Screenshot encoding produced empty result".to_string(),
        ));
    }
    debug!("[CAPTURE] Final JPEG size: {} bytes", jpeg_bytes.len());
    Ok(jpeg_bytes)
}

/// Keep aspect ratio while fitting inside `max_w` x `max_h`.
fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let scale = (max_w as f32 / width as f32).min(max_h as f32 / height as f32);
    (
        ((width as f32 * scale) as u32).max(1),
        ((height as f32 * scale) as u32).max(1),
    )
}

impl HostBridge for DesktopBridge {
    fn capture_frame(&self) -> Result<Vec<u8>, BridgeError> {
        capture_primary_screen_jpeg().map_err(|e| {
            warn!("[CAPTURE] {}", e);
            e
        })
    }

    fn activity_counters(&self) -> ActivityCounters {
        self.monitor.counters()
    }

    fn reset_activity_counters(&self) {
        self.monitor.reset();
    }

    fn stable_device_id(&self) -> Option<String> {
        self.device_id.clone()
    }

    fn notify_tracking_started(&self, context: &TrackingContext) {
        self.monitor.start();
        info!(
            "[HOST] Tracking started: {} / {}",
            context.task_title, context.sub_task_title
        );
    }

    fn notify_tracking_stopped(&self) {
        self.monitor.stop();
        info!("[HOST] Tracking stopped");
    }

    fn notify_tick(&self, total_seconds: u64) {
        debug!("[HOST] Total tracked: {}s", total_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_within_landscape() {
        assert_eq!(fit_within(2560, 1440, 1280, 720), (1280, 720));
    }

    #[test]
    fn test_fit_within_portrait() {
        let (w, h) = fit_within(1000, 2000, 1280, 720);
        assert_eq!(h, 720);
        assert_eq!(w, 360);
    }
}
