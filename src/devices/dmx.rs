//! DMX-512 adapter driver: a flat 24-channel array dispatched as one frame
//! per flush, using the same task/command/`FuturesUnordered` shape as
//! [`super::fc::FcDevice`].
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::warn;
use tokio::sync::mpsc;

use crate::usb::{DeviceHandle, TransferOutcome};

use super::{DeviceDescriptor, DeviceDriver, DeviceKind, DMX_PRODUCT_ID, DMX_VENDOR_ID};

pub const CHANNEL_COUNT: usize = 24;

const OUT_ENDPOINT: u8 = 0x02;

const FRAME_START: u8 = 0x7E;
const FRAME_LABEL_SEND_DMX: u8 = 0x06;
const DMX_START_CODE: u8 = 0x00;
const FRAME_END: u8 = 0xE7;

enum DmxCommand {
    WriteChannel { channel: u8, value: u8 },
    SetColorCorrection { scale: [f64; 3] },
    Flush,
    Shutdown,
}

pub struct DmxDevice {
    cmd_tx: mpsc::Sender<DmxCommand>,
    descriptor: DeviceDescriptor,
}

impl DmxDevice {
    /// `wanted`, when present, is matched as a prefix of the device's serial
    /// string descriptor rather than requiring exact equality, so a
    /// configured identifier like `"EN1234"` binds whichever unit reports a
    /// serial such as `"EN1234-00AB"`.
    pub fn matches(vendor_id: u16, product_id: u16, serial: Option<&str>, wanted: Option<&str>) -> bool {
        if vendor_id != DMX_VENDOR_ID || product_id != DMX_PRODUCT_ID {
            return false;
        }
        match wanted {
            None => true,
            Some(w) => serial.map(|s| s.starts_with(w)).unwrap_or(false),
        }
    }

    pub fn spawn(
        handle: DeviceHandle,
        bus: u8,
        address: u8,
        serial: Option<String>,
        initial_color: ([f64; 3], f64),
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let descriptor = DeviceDescriptor {
            kind: DeviceKind::Dmx,
            serial,
            bus,
            address,
        };

        let task_descriptor = descriptor.clone();
        tokio::spawn(async move {
            let mut task = DmxDeviceTask::new(handle, initial_color, task_descriptor);
            task.run(cmd_rx).await;
        });

        Arc::new(DmxDevice { cmd_tx, descriptor })
    }

    fn send(&self, cmd: DmxCommand) {
        let _ = self.cmd_tx.try_send(cmd);
    }
}

#[async_trait]
impl DeviceDriver for DmxDevice {
    async fn write_pixel(&self, _offset: u16, _rgb: [u8; 3]) {
        // DMX adapters are addressed by raw channel, never by pixel offset.
    }

    async fn write_channel(&self, channel: u8, value: u8) {
        self.send(DmxCommand::WriteChannel { channel, value });
    }

    async fn set_global_color_correction(&self, scale: [f64; 3], _gamma: f64) {
        // DMX has no on-device gamma stage; correction is scale-only, so
        // gamma is accepted for trait-signature parity and then ignored.
        self.send(DmxCommand::SetColorCorrection { scale });
    }

    async fn set_firmware_config(&self, _dithering: bool, _interpolation: bool, _led_enable: bool) {
        // No on-device gamma/dithering stage for DMX.
    }

    async fn flush(&self) {
        self.send(DmxCommand::Flush);
    }

    async fn shutdown(&self) {
        self.send(DmxCommand::Shutdown);
    }

    fn describe(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn pixel_capacity(&self) -> u16 {
        (CHANNEL_COUNT / 3) as u16
    }
}

type PendingTransfer = FuturesUnordered<std::pin::Pin<Box<dyn std::future::Future<Output = TransferOutcome> + Send>>>;

struct DmxDeviceTask {
    handle: DeviceHandle,
    descriptor: DeviceDescriptor,
    channels: [u8; CHANNEL_COUNT],
    scale: [f64; 3],
    dirty: bool,
    pending: PendingTransfer,
}

impl DmxDeviceTask {
    fn new(handle: DeviceHandle, initial_color: ([f64; 3], f64), descriptor: DeviceDescriptor) -> Self {
        let (scale, _gamma) = initial_color;
        DmxDeviceTask {
            handle,
            descriptor,
            channels: [0u8; CHANNEL_COUNT],
            scale,
            dirty: true,
            pending: FuturesUnordered::new(),
        }
    }

    async fn run(&mut self, mut cmd_rx: mpsc::Receiver<DmxCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(DmxCommand::Shutdown) => break,
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                Some(outcome) = self.pending.next() => {
                    self.handle_completion(outcome);
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: DmxCommand) {
        match cmd {
            DmxCommand::WriteChannel { channel, value } => {
                if let Some(slot) = self.channels.get_mut(channel as usize) {
                    *slot = apply_correction(value, self.component_scale(channel));
                    self.dirty = true;
                }
            }
            DmxCommand::SetColorCorrection { scale } => {
                self.scale = scale;
            }
            DmxCommand::Flush => self.try_submit(),
            DmxCommand::Shutdown => {}
        }
    }

    fn component_scale(&self, channel: u8) -> f64 {
        self.scale[channel as usize % 3]
    }

    fn try_submit(&mut self) {
        if !self.dirty || !self.pending.is_empty() {
            return;
        }
        self.dirty = false;
        let frame = encode_frame(&self.channels);
        let handle = self.handle.clone();
        self.pending
            .push(Box::pin(
                async move { handle.submit_bulk_out(OUT_ENDPOINT, frame.to_vec()).await },
            ));
    }

    fn handle_completion(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Ok { .. } => self.try_submit(),
            TransferOutcome::Stall => {
                warn!(
                    "dmx adapter at {}:{} stalled, clearing halt",
                    self.descriptor.bus, self.descriptor.address
                );
                if let Err(e) = self.handle.clear_halt(OUT_ENDPOINT) {
                    warn!("clear_halt failed: {e}");
                }
            }
            TransferOutcome::Cancelled => {}
            TransferOutcome::IoError(e) => {
                warn!(
                    "dmx adapter at {}:{} transfer error: {e}",
                    self.descriptor.bus, self.descriptor.address
                );
            }
        }
    }
}

/// `value = clamp(raw * scale * 255)` collapsed to 8 bits; DMX has no
/// on-device gamma stage, so host-side correction is scale-only, applied
/// at write time rather than through a LUT upload.
fn apply_correction(raw: u8, scale: f64) -> u8 {
    let x = raw as f64 / 255.0;
    let corrected = x * scale * 255.0;
    corrected.round().clamp(0.0, 255.0) as u8
}

fn encode_frame(channels: &[u8; CHANNEL_COUNT]) -> [u8; 6 + CHANNEL_COUNT + 1] {
    let mut frame = [0u8; 6 + CHANNEL_COUNT + 1];
    let len = (CHANNEL_COUNT + 1) as u16; // + DMX start code
    frame[0] = FRAME_START;
    frame[1] = FRAME_LABEL_SEND_DMX;
    frame[2] = (len & 0xFF) as u8;
    frame[3] = (len >> 8) as u8;
    frame[4] = DMX_START_CODE;
    frame[5] = 0x00;
    frame[6..6 + CHANNEL_COUNT].copy_from_slice(channels);
    frame[6 + CHANNEL_COUNT] = FRAME_END;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_vendor_product_and_optional_serial() {
        assert!(DmxDevice::matches(DMX_VENDOR_ID, DMX_PRODUCT_ID, None, None));
        assert!(DmxDevice::matches(
            DMX_VENDOR_ID,
            DMX_PRODUCT_ID,
            Some("ABC123"),
            Some("ABC123")
        ));
        assert!(!DmxDevice::matches(
            DMX_VENDOR_ID,
            DMX_PRODUCT_ID,
            Some("ABC123"),
            Some("XYZ999")
        ));
        assert!(!DmxDevice::matches(0x1d50, 0x607a, None, None));
    }

    #[test]
    fn matches_serial_by_prefix_not_exact_equality() {
        assert!(DmxDevice::matches(
            DMX_VENDOR_ID,
            DMX_PRODUCT_ID,
            Some("EN1234-00AB"),
            Some("EN1234")
        ));
        assert!(!DmxDevice::matches(
            DMX_VENDOR_ID,
            DMX_PRODUCT_ID,
            Some("EN9999-00AB"),
            Some("EN1234")
        ));
    }

    #[test]
    fn frame_has_fixed_header_and_trailer() {
        let channels = [0u8; CHANNEL_COUNT];
        let frame = encode_frame(&channels);
        assert_eq!(frame.len(), 31);
        assert_eq!(frame[0], FRAME_START);
        assert_eq!(frame[1], FRAME_LABEL_SEND_DMX);
        assert_eq!(*frame.last().unwrap(), FRAME_END);
    }

    #[test]
    fn identity_correction_is_passthrough() {
        assert_eq!(apply_correction(128, 1.0), 128);
        assert_eq!(apply_correction(255, 1.0), 255);
        assert_eq!(apply_correction(0, 1.0), 0);
    }

    #[test]
    fn correction_scales_down_with_dim_whitepoint() {
        assert_eq!(apply_correction(255, 0.5), 128);
    }
}
