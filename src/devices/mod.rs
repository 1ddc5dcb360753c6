//! Device driver layer: the capability set the server core uses to talk to
//! attached devices, and the two concrete implementations. A shared
//! `async_trait` interface implemented by heterogeneous concrete drivers,
//! each owning a dedicated background task that serializes its own USB
//! access.
pub mod dmx;
pub mod fc;
pub mod table;

use async_trait::async_trait;

use crate::config::ColorSpec;

pub use table::DeviceTable;

/// Fadecandy's real USB vendor/product IDs.
pub const FC_VENDOR_ID: u16 = 0x1d50;
pub const FC_PRODUCT_ID: u16 = 0x607a;

/// An FTDI-family chipset ID, matching a real Enttec DMX USB Pro.
pub const DMX_VENDOR_ID: u16 = 0x0403;
pub const DMX_PRODUCT_ID: u16 = 0x6001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Fadecandy,
    Dmx,
}

/// Identification surfaced for logging and mapping.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub serial: Option<String>,
    pub bus: u8,
    pub address: u8,
}

/// The capability set every attached device exposes. Every call is
/// best-effort and non-blocking from the caller's perspective: it forwards
/// a command into the device's own dedicated task over a bounded channel
/// and returns immediately.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Write one pixel into the device's back buffer at `offset`. Used by
    /// Fadecandy-style devices addressed as a contiguous pixel strip.
    async fn write_pixel(&self, offset: u16, rgb: [u8; 3]);

    /// Write one raw channel value. Used by DMX-style devices addressed by
    /// channel number rather than pixel offset.
    async fn write_channel(&self, channel: u8, value: u8);

    /// Latch a new color-correction tuple. For Fadecandy this queues a LUT
    /// re-upload; for DMX this is applied host-side at dispatch time, so
    /// this call is what updates the scale DMX dispatch reads.
    async fn set_global_color_correction(&self, scale: [f64; 3], gamma: f64);

    /// Latch new firmware configuration flags (Fadecandy only; DMX has no
    /// on-device configuration to latch and ignores this call).
    async fn set_firmware_config(&self, dithering: bool, interpolation: bool, led_enable: bool);

    /// Request pending changes be submitted before control returns to the
    /// event loop.
    async fn flush(&self);

    /// Cancel all in-flight transfers and tear down the device's task. Must
    /// be idempotent; called once per device on hotplug leave.
    async fn shutdown(&self);

    fn describe(&self) -> DeviceDescriptor;

    /// Nominal maximum pixel count, fixed at attach time. Used by the
    /// mapping engine to silently drop out-of-range writes.
    fn pixel_capacity(&self) -> u16;

    fn bus_address(&self) -> (u8, u8) {
        let d = self.describe();
        (d.bus, d.address)
    }
}

pub(crate) fn color_to_scale_gamma(color: ColorSpec) -> ([f64; 3], f64) {
    (color.whitepoint, color.gamma)
}
