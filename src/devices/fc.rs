//! Fadecandy-style device driver: double-buffered pixel strip with a
//! per-channel gamma LUT, driven by a dedicated task built around an mpsc
//! command channel plus a `FuturesUnordered` holding at most one in-flight
//! transfer, polled together with `tokio::select!`.
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::usb::{DeviceHandle, TransferOutcome};

use super::{DeviceDescriptor, DeviceDriver, DeviceKind, FC_PRODUCT_ID, FC_VENDOR_ID};

/// Bulk OUT endpoint used for both pixel and LUT/config packets, matching
/// the real Fadecandy firmware's single-endpoint design.
const OUT_ENDPOINT: u8 = 0x01;

const PACKET_SIZE: usize = 64;

/// 16-bit pixel components do not fit 21 triplets in a 64-byte packet (that
/// figure holds only for 8-bit-per-channel wire formats); at 6 bytes/pixel,
/// 10 pixels (60 bytes) plus a 1-byte header leaves 3 bytes of trailing
/// padding per packet. See DESIGN.md for the full arithmetic.
const PIXELS_PER_PACKET: usize = 10;

const LUT_ENTRIES_PER_CHANNEL: usize = 257;
const LUT_TOTAL_ENTRIES: usize = LUT_ENTRIES_PER_CHANNEL * 3;
const LUT_VALUES_PER_PACKET: usize = 31;

const LAST_PACKET_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AttachedUnconfigured,
    UploadingLut,
    Ready,
    FrameInFlight,
    Terminated,
}

enum FcCommand {
    WritePixel { offset: u16, rgb: [u8; 3] },
    SetColorCorrection { scale: [f64; 3], gamma: f64 },
    SetFirmwareConfig {
        dithering: bool,
        interpolation: bool,
        led_enable: bool,
    },
    Flush,
    Shutdown,
}

/// Handle returned to Server Core / the mapping engine. Forwards every call
/// into the device's dedicated task as a best-effort, non-blocking send —
/// if the task's queue is full the write is dropped, matching the
/// writePixels "best-effort, non-blocking" contract.
pub struct FcDevice {
    cmd_tx: mpsc::Sender<FcCommand>,
    descriptor: DeviceDescriptor,
    pixel_capacity: u16,
}

impl FcDevice {
    pub fn matches(vendor_id: u16, product_id: u16) -> bool {
        vendor_id == FC_VENDOR_ID && product_id == FC_PRODUCT_ID
    }

    /// Spawn the device's task and return the handle the server core keeps
    /// in its `DeviceTable`. `pixel_capacity` is fixed for the device's
    /// lifetime.
    pub fn spawn(
        handle: DeviceHandle,
        bus: u8,
        address: u8,
        serial: Option<String>,
        pixel_capacity: u16,
        initial_color: ([f64; 3], f64),
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let descriptor = DeviceDescriptor {
            kind: DeviceKind::Fadecandy,
            serial,
            bus,
            address,
        };

        let task_descriptor = descriptor.clone();
        tokio::spawn(async move {
            let mut task = FcDeviceTask::new(handle, pixel_capacity, initial_color, task_descriptor);
            task.run(cmd_rx).await;
        });

        Arc::new(FcDevice {
            cmd_tx,
            descriptor,
            pixel_capacity,
        })
    }

    fn send(&self, cmd: FcCommand) {
        if self.cmd_tx.try_send(cmd).is_err() {
            debug!(
                "dropped command for fadecandy device at {}:{} (queue full or shut down)",
                self.descriptor.bus, self.descriptor.address
            );
        }
    }
}

#[async_trait]
impl DeviceDriver for FcDevice {
    async fn write_pixel(&self, offset: u16, rgb: [u8; 3]) {
        self.send(FcCommand::WritePixel { offset, rgb });
    }

    async fn write_channel(&self, _channel: u8, _value: u8) {
        // Fadecandy devices are addressed as pixel strips, not raw channels.
    }

    async fn set_global_color_correction(&self, scale: [f64; 3], gamma: f64) {
        self.send(FcCommand::SetColorCorrection { scale, gamma });
    }

    async fn set_firmware_config(&self, dithering: bool, interpolation: bool, led_enable: bool) {
        self.send(FcCommand::SetFirmwareConfig {
            dithering,
            interpolation,
            led_enable,
        });
    }

    async fn flush(&self) {
        self.send(FcCommand::Flush);
    }

    async fn shutdown(&self) {
        self.send(FcCommand::Shutdown);
    }

    fn describe(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn pixel_capacity(&self) -> u16 {
        self.pixel_capacity
    }
}

type PendingTransfer = FuturesUnordered<std::pin::Pin<Box<dyn std::future::Future<Output = TransferOutcome> + Send>>>;

/// Owns the actual buffers and USB handle; lives entirely inside the
/// spawned task, never shared across tasks.
struct FcDeviceTask {
    handle: DeviceHandle,
    descriptor: DeviceDescriptor,
    front: Vec<[u16; 3]>,
    back: Vec<[u16; 3]>,
    back_dirty: bool,
    scale: [f64; 3],
    gamma: f64,
    lut: Vec<[u16; 3]>,
    lut_dirty: bool,
    dithering: bool,
    interpolation: bool,
    led_enable: bool,
    state: State,
    pending: PendingTransfer,
}

impl FcDeviceTask {
    fn new(
        handle: DeviceHandle,
        pixel_capacity: u16,
        initial_color: ([f64; 3], f64),
        descriptor: DeviceDescriptor,
    ) -> Self {
        let (scale, gamma) = initial_color;
        let n = pixel_capacity as usize;
        let mut task = FcDeviceTask {
            handle,
            descriptor,
            front: vec![[0u16; 3]; n],
            back: vec![[0u16; 3]; n],
            back_dirty: false,
            scale,
            gamma,
            lut: Vec::new(),
            lut_dirty: true,
            dithering: true,
            interpolation: true,
            led_enable: true,
            state: State::AttachedUnconfigured,
            pending: FuturesUnordered::new(),
        };
        task.lut = build_lut(task.scale, task.gamma);
        task
    }

    async fn run(&mut self, mut cmd_rx: mpsc::Receiver<FcCommand>) {
        self.state = State::UploadingLut;
        self.submit_lut();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                Some(outcome) = self.pending.next() => {
                    self.handle_completion(outcome);
                }
            }
            if self.state == State::Terminated {
                break;
            }
        }
    }

    fn handle_command(&mut self, cmd: FcCommand) {
        match cmd {
            FcCommand::WritePixel { offset, rgb } => {
                if let Some(slot) = self.back.get_mut(offset as usize) {
                    *slot = [
                        expand_8_to_16(rgb[0]),
                        expand_8_to_16(rgb[1]),
                        expand_8_to_16(rgb[2]),
                    ];
                    self.back_dirty = true;
                }
            }
            FcCommand::SetColorCorrection { scale, gamma } => {
                self.scale = scale;
                self.gamma = gamma;
                self.lut = build_lut(scale, gamma);
                self.lut_dirty = true;
            }
            FcCommand::SetFirmwareConfig {
                dithering,
                interpolation,
                led_enable,
            } => {
                self.dithering = dithering;
                self.interpolation = interpolation;
                self.led_enable = led_enable;
            }
            FcCommand::Flush => self.try_submit_next(),
            FcCommand::Shutdown => {
                self.state = State::Terminated;
            }
        }
    }

    fn try_submit_next(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        if self.lut_dirty {
            self.submit_lut();
            return;
        }
        if self.back_dirty && matches!(self.state, State::Ready | State::AttachedUnconfigured) {
            self.swap_and_submit_frame();
        }
    }

    fn submit_lut(&mut self) {
        self.state = State::UploadingLut;
        self.lut_dirty = false;
        let packets = encode_lut_packets(&self.lut);
        self.submit_packets(packets);
    }

    fn swap_and_submit_frame(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
        self.back_dirty = false;
        self.state = State::FrameInFlight;
        let packets = encode_frame_packets(&self.front);
        self.submit_packets(packets);
    }

    fn submit_packets(&mut self, packets: Vec<[u8; PACKET_SIZE]>) {
        let handle = self.handle.clone();
        let fut = Box::pin(async move {
            let mut last = TransferOutcome::Ok { bytes: 0 };
            for packet in packets {
                last = handle.submit_bulk_out(OUT_ENDPOINT, packet.to_vec()).await;
                if !last.is_ok() {
                    break;
                }
            }
            last
        });
        self.pending.push(fut);
    }

    fn handle_completion(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Ok { .. } => {
                self.state = State::Ready;
                self.try_submit_next();
            }
            TransferOutcome::Stall => {
                warn!(
                    "fadecandy device at {}:{} stalled, clearing halt",
                    self.descriptor.bus, self.descriptor.address
                );
                if let Err(e) = self.handle.clear_halt(OUT_ENDPOINT) {
                    warn!("clear_halt failed: {e}");
                }
                self.state = State::Ready;
            }
            TransferOutcome::Cancelled => {
                self.state = State::Terminated;
            }
            TransferOutcome::IoError(e) => {
                warn!(
                    "fadecandy device at {}:{} transfer error: {e}",
                    self.descriptor.bus, self.descriptor.address
                );
                self.state = State::Terminated;
            }
        }
    }
}

fn expand_8_to_16(v: u8) -> u16 {
    (v as u16) << 8 | v as u16
}

/// `value = clamp((i/256)^gamma * scale * 0xFFFF)` for each of the 257
/// entries per channel.
fn build_lut(scale: [f64; 3], gamma: f64) -> Vec<[u16; 3]> {
    (0..LUT_ENTRIES_PER_CHANNEL)
        .map(|i| {
            let x = i as f64 / 256.0;
            let base = x.powf(gamma);
            [0, 1, 2].map(|c| {
                let v = (base * scale[c] * 0xFFFF as f64).round();
                v.clamp(0.0, 0xFFFF as f64) as u16
            })
        })
        .collect()
}

fn encode_lut_packets(lut: &[[u16; 3]]) -> Vec<[u8; PACKET_SIZE]> {
    let flat: Vec<u16> = lut.iter().flat_map(|e| e.iter().copied()).collect();
    debug_assert_eq!(flat.len(), LUT_TOTAL_ENTRIES);
    let mut packets = Vec::new();
    let chunks: Vec<&[u16]> = flat.chunks(LUT_VALUES_PER_PACKET).collect();
    let total = chunks.len();
    for (idx, chunk) in chunks.into_iter().enumerate() {
        let mut packet = [0u8; PACKET_SIZE];
        let mut header = (idx as u8) & !LAST_PACKET_FLAG;
        if idx + 1 == total {
            header |= LAST_PACKET_FLAG;
        }
        packet[0] = header;
        for (i, value) in chunk.iter().enumerate() {
            let bytes = value.to_be_bytes();
            packet[1 + i * 2] = bytes[0];
            packet[2 + i * 2] = bytes[1];
        }
        packets.push(packet);
    }
    packets
}

fn encode_frame_packets(pixels: &[[u16; 3]]) -> Vec<[u8; PACKET_SIZE]> {
    if pixels.is_empty() {
        return vec![{
            let mut p = [0u8; PACKET_SIZE];
            p[0] = LAST_PACKET_FLAG;
            p
        }];
    }
    let chunks: Vec<&[[u16; 3]]> = pixels.chunks(PIXELS_PER_PACKET).collect();
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(idx, chunk)| {
            let mut packet = [0u8; PACKET_SIZE];
            let mut header = (idx as u8) & !LAST_PACKET_FLAG;
            if idx + 1 == total {
                header |= LAST_PACKET_FLAG;
            }
            packet[0] = header;
            for (i, pixel) in chunk.iter().enumerate() {
                for (c, component) in pixel.iter().enumerate() {
                    let bytes = component.to_be_bytes();
                    let offset = 1 + i * 6 + c * 2;
                    packet[offset] = bytes[0];
                    packet[offset + 1] = bytes[1];
                }
            }
            packet
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_real_fadecandy_ids() {
        assert!(FcDevice::matches(FC_VENDOR_ID, FC_PRODUCT_ID));
        assert!(!FcDevice::matches(0x0403, 0x6001));
    }

    #[test]
    fn lut_identity_is_near_linear_ramp() {
        let lut = build_lut([1.0, 1.0, 1.0], 1.0);
        assert_eq!(lut.len(), LUT_ENTRIES_PER_CHANNEL);
        assert_eq!(lut[0], [0, 0, 0]);
        assert_eq!(lut[256][0], 0xFFFF);
    }

    #[test]
    fn lut_packet_count_and_last_flag() {
        let lut = build_lut([1.0, 1.0, 1.0], 2.2);
        let packets = encode_lut_packets(&lut);
        let expected = (LUT_TOTAL_ENTRIES + LUT_VALUES_PER_PACKET - 1) / LUT_VALUES_PER_PACKET;
        assert_eq!(packets.len(), expected);
        assert_eq!(packets.last().unwrap()[0] & LAST_PACKET_FLAG, LAST_PACKET_FLAG);
        assert_eq!(packets[0][0] & LAST_PACKET_FLAG, 0);
    }

    #[test]
    fn frame_packet_count_matches_pixel_math() {
        let pixels = vec![[0xFFFFu16, 0x8080, 0x0000]; 25];
        let packets = encode_frame_packets(&pixels);
        assert_eq!(packets.len(), 3); // ceil(25 / 10)
        assert_eq!(packets.last().unwrap()[0] & LAST_PACKET_FLAG, LAST_PACKET_FLAG);
    }

    #[test]
    fn frame_packet_encodes_first_pixel_big_endian() {
        let pixels = vec![[0xFFFFu16, 0x8080, 0x0000]];
        let packets = encode_frame_packets(&pixels);
        assert_eq!(&packets[0][1..7], &[0xFF, 0xFF, 0x80, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn expand_8_to_16_replicates_byte() {
        assert_eq!(expand_8_to_16(0xFF), 0xFFFF);
        assert_eq!(expand_8_to_16(0x80), 0x8080);
        assert_eq!(expand_8_to_16(0x00), 0x0000);
    }

    #[test]
    fn writes_past_capacity_are_ignored_not_written() {
        // Mirrors the mapping engine's own bounds check: a device built with
        // a fixed pixel capacity silently drops writes beyond it rather than
        // growing the buffer or erroring.
        let mut back = vec![[0u16; 3]; 4];
        let offset: usize = 10;
        if let Some(slot) = back.get_mut(offset) {
            *slot = [1, 1, 1];
        }
        assert!(back.iter().all(|p| *p == [0, 0, 0]));
    }

    #[tokio::test]
    async fn command_send_on_a_shut_down_device_is_dropped_not_fatal() {
        // Once the device task's receiver is gone, forwarding a command must
        // not panic or block — it's the best-effort, non-blocking contract
        // the write/flush methods promise callers.
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        drop(cmd_rx);
        let device = FcDevice {
            cmd_tx,
            descriptor: DeviceDescriptor {
                kind: DeviceKind::Fadecandy,
                serial: None,
                bus: 1,
                address: 1,
            },
            pixel_capacity: 64,
        };
        device.write_pixel(0, [1, 2, 3]).await;
        device.flush().await;
    }
}
