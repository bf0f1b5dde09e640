use crate::error::{CaptureError, Result};

use rusb::{DeviceHandle, Direction, GlobalContext, Recipient, RequestType};
use std::time::Duration;

/// Visual "capture active" signal. Fire-and-forget: implementations log
/// failures instead of returning them.
pub trait Indicator: Send {
    fn set_active(&mut self);
    fn set_inactive(&mut self);
}

/// Used when no LED ring is attached or it was disabled on the command line.
pub struct NoIndicator;

impl Indicator for NoIndicator {
    fn set_active(&mut self) {}
    fn set_inactive(&mut self) {}
}

// --- ReSpeaker USB Pixel Ring ---

// USB Control Transfer Parameters
const VID: u16 = 0x2886; // Vendor ID
const PID: u16 = 0x0018; // Product ID
const TIMEOUT: Duration = Duration::from_millis(8000);

const USB_REQ_TYPE_WRITE: u8 = rusb::request_type(
    Direction::Out,
    RequestType::Vendor,
    Recipient::Device,
);
const USB_REQUEST: u8 = 0;
const USB_WINDEX_WRITE: u16 = 0x1C;

// Pixel ring commands (wValue)
const CMD_MONO: u16 = 0x01;
const CMD_BRIGHTNESS: u16 = 0x20;
const CMD_VAD_LED: u16 = 0x22;

const RING_BRIGHTNESS: u8 = 0x10;

pub fn mono_payload(color: u32) -> [u8; 4] {
    [
        ((color >> 16) & 0xFF) as u8,
        ((color >> 8) & 0xFF) as u8,
        (color & 0xFF) as u8,
        0,
    ]
}

pub struct PixelRing {
    handle: DeviceHandle<GlobalContext>,
    active_color: u32,
}

impl PixelRing {
    /// Opens the ring, leaving it dark with the VAD LED off.
    pub fn open(active_color: u32) -> Result<Self> {
        let handle = rusb::open_device_with_vid_pid(VID, PID)
            .ok_or(CaptureError::IndicatorNotFound { vid: VID, pid: PID })?;
        tracing::debug!("Opened pixel ring {:04x}:{:04x}", VID, PID);

        let ring = Self {
            handle,
            active_color,
        };
        ring.write(CMD_BRIGHTNESS, &[RING_BRIGHTNESS])?;
        ring.write(CMD_VAD_LED, &[0])?;
        ring.mono(0)?;
        Ok(ring)
    }

    fn write(&self, command: u16, data: &[u8]) -> Result<()> {
        self.handle.write_control(
            USB_REQ_TYPE_WRITE,
            USB_REQUEST,
            command,
            USB_WINDEX_WRITE,
            data,
            TIMEOUT,
        )?;
        Ok(())
    }

    pub fn mono(&self, color: u32) -> Result<()> {
        self.write(CMD_MONO, &mono_payload(color))
    }
}

impl Indicator for PixelRing {
    fn set_active(&mut self) {
        if let Err(e) = self.mono(self.active_color) {
            tracing::warn!("Failed to light pixel ring: {}", e);
        }
    }

    fn set_inactive(&mut self) {
        if let Err(e) = self.mono(0) {
            tracing::warn!("Failed to turn off pixel ring: {}", e);
        }
    }
}
