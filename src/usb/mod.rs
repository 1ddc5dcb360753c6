//! USB transport layer: enumeration, hotplug (via periodic scan), and
//! non-blocking OUT transfer submission over raw `libusb1-sys` bindings.
pub mod context;
pub mod transfer;

pub use context::{DeviceHandle, UsbContext, UsbDeviceInfo};
pub use transfer::TransferOutcome;
