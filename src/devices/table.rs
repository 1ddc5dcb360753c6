//! The live set of attached devices, keyed by `(bus, address)`. Enforces
//! the same "no two entries at the same (bus, address)" invariant a
//! `HashMap` would give for free — kept as a `Vec` instead since the server
//! core routinely needs ordered iteration for dispatch.
use std::io;
use std::sync::Arc;

use log::info;

use super::DeviceDriver;

pub struct DeviceTable {
    devices: Vec<Arc<dyn DeviceDriver>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        DeviceTable {
            devices: Vec::new(),
        }
    }

    /// Register a newly attached device. Fails if a device already occupies
    /// that `(bus, address)`, per the DeviceTable uniqueness invariant.
    pub fn attach(&mut self, driver: Arc<dyn DeviceDriver>) -> io::Result<()> {
        let (bus, address) = driver.bus_address();
        if self.find(bus, address).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("device already attached at bus {bus} address {address}"),
            ));
        }
        info!("attached device at bus {bus} address {address}");
        self.devices.push(driver);
        Ok(())
    }

    /// Remove a device from the table, returning it so the caller can
    /// `.shutdown().await` it outside of any lock scope.
    pub fn detach(&mut self, bus: u8, address: u8) -> Option<Arc<dyn DeviceDriver>> {
        let idx = self
            .devices
            .iter()
            .position(|d| d.bus_address() == (bus, address))?;
        info!("detached device at bus {bus} address {address}");
        Some(self.devices.remove(idx))
    }

    pub fn find(&self, bus: u8, address: u8) -> Option<&Arc<dyn DeviceDriver>> {
        self.devices.iter().find(|d| d.bus_address() == (bus, address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DeviceDriver>> {
        self.devices.iter()
    }

    pub fn addresses(&self) -> Vec<(u8, u8)> {
        self.devices.iter().map(|d| d.bus_address()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceDescriptor, DeviceKind};
    use async_trait::async_trait;

    struct FakeDriver {
        bus: u8,
        address: u8,
    }

    #[async_trait]
    impl DeviceDriver for FakeDriver {
        async fn write_pixel(&self, _offset: u16, _rgb: [u8; 3]) {}
        async fn write_channel(&self, _channel: u8, _value: u8) {}
        async fn set_global_color_correction(&self, _scale: [f64; 3], _gamma: f64) {}
        async fn set_firmware_config(&self, _d: bool, _i: bool, _l: bool) {}
        async fn flush(&self) {}
        async fn shutdown(&self) {}
        fn describe(&self) -> DeviceDescriptor {
            DeviceDescriptor {
                kind: DeviceKind::Fadecandy,
                serial: None,
                bus: self.bus,
                address: self.address,
            }
        }
        fn pixel_capacity(&self) -> u16 {
            64
        }
    }

    #[test]
    fn rejects_duplicate_bus_address() {
        let mut table = DeviceTable::new();
        table
            .attach(Arc::new(FakeDriver { bus: 1, address: 2 }))
            .unwrap();
        let err = table
            .attach(Arc::new(FakeDriver { bus: 1, address: 2 }))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn detach_removes_and_returns_device() {
        let mut table = DeviceTable::new();
        table
            .attach(Arc::new(FakeDriver { bus: 1, address: 2 }))
            .unwrap();
        assert!(table.detach(1, 2).is_some());
        assert!(table.is_empty());
        assert!(table.detach(1, 2).is_none());
    }
}
