//! Mapping engine: compiles the configuration document's per-device map
//! entries into routing tables keyed by OPC channel, and dispatches decoded
//! OPC commands against them. Recompiled and atomically swapped in whenever
//! the attached device set changes — state is always rebuilt fresh under a
//! lock rather than mutated in place.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{Component, ColorSpec, DeviceSpec, DmxMapEntry, FcMapEntry};
use crate::devices::DeviceDriver;
use crate::opc::OpcCommand;

struct FcRoute {
    device: Arc<dyn DeviceDriver>,
    entry: FcMapEntry,
}

struct DmxRoute {
    device: Arc<dyn DeviceDriver>,
    entry: DmxMapEntry,
}

/// One immutable routing snapshot. Channel 0 is an ordinary channel number
/// here, not a broadcast group: an entry with `opc_channel: 0` fires only
/// for messages addressed to channel 0, never for any other channel.
#[derive(Default)]
pub struct CompiledMapping {
    fc_routes: Vec<FcRoute>,
    dmx_routes: Vec<DmxRoute>,
}

impl CompiledMapping {
    pub fn build(bindings: &[(Arc<dyn DeviceDriver>, DeviceSpec)]) -> Self {
        let mut fc_routes = Vec::new();
        let mut dmx_routes = Vec::new();
        for (device, spec) in bindings {
            match spec {
                DeviceSpec::Fadecandy { map, .. } => {
                    for entry in map {
                        fc_routes.push(FcRoute {
                            device: device.clone(),
                            entry: entry.clone(),
                        });
                    }
                }
                DeviceSpec::Enttec { map, .. } => {
                    for entry in map {
                        dmx_routes.push(DmxRoute {
                            device: device.clone(),
                            entry: *entry,
                        });
                    }
                }
            }
        }
        CompiledMapping {
            fc_routes,
            dmx_routes,
        }
    }

    /// Apply a decoded command arriving on `channel`. Pixel writes and
    /// channel writes are forwarded to the owning device's back buffer;
    /// devices touched by this message are flushed exactly once, in the
    /// order their routes appear (route order is the last-write-wins order
    /// for overlapping destinations within one message).
    pub async fn dispatch(&self, channel: u8, command: &OpcCommand) {
        match command {
            OpcCommand::SetPixelColors(pixels) => self.dispatch_pixels(channel, pixels).await,
            OpcCommand::SetColorCorrection { gamma, whitepoint } => {
                self.dispatch_color_correction(channel, *gamma, *whitepoint).await;
            }
            OpcCommand::SetFirmwareConfig {
                dithering,
                interpolation,
                led_enable,
            } => {
                self.dispatch_firmware_config(channel, *dithering, *interpolation, *led_enable)
                    .await;
            }
            OpcCommand::Ignored => {}
        }
    }

    async fn dispatch_pixels(&self, channel: u8, pixels: &[[u8; 3]]) {
        let mut touched: Vec<*const ()> = Vec::new();

        for route in self.fc_routes.iter().filter(|r| r.entry.opc_channel == channel) {
            let entry = &route.entry;
            let capacity = route.device.pixel_capacity();
            for i in 0..entry.pixel_count {
                let dst = entry.first_device_pixel.wrapping_add(i);
                if dst >= capacity {
                    continue;
                }
                let rgb = match entry.constant_color {
                    Some((r, g, b)) => [r, g, b],
                    None => {
                        let src = entry.first_opc_pixel as usize + i as usize;
                        match pixels.get(src) {
                            Some(rgb) => *rgb,
                            None => continue,
                        }
                    }
                };
                route.device.write_pixel(dst, rgb).await;
            }
            mark_touched(&mut touched, &route.device);
        }

        for route in self.dmx_routes.iter().filter(|r| r.entry.opc_channel == channel) {
            let entry = route.entry;
            let Some(rgb) = pixels.get(entry.opc_pixel as usize) else {
                continue;
            };
            let value = match entry.component {
                Component::R => rgb[0],
                Component::G => rgb[1],
                Component::B => rgb[2],
            };
            route.device.write_channel(entry.dmx_channel, value).await;
            mark_touched(&mut touched, &route.device);
        }

        self.flush_touched(&touched).await;
    }

    async fn dispatch_color_correction(&self, channel: u8, gamma: f64, whitepoint: [f64; 3]) {
        let mut seen: Vec<*const ()> = Vec::new();
        for route in self.fc_routes.iter().filter(|r| r.entry.opc_channel == channel) {
            if mark_touched(&mut seen, &route.device) {
                route
                    .device
                    .set_global_color_correction(whitepoint, gamma)
                    .await;
            }
        }
        for route in self.dmx_routes.iter().filter(|r| r.entry.opc_channel == channel) {
            if mark_touched(&mut seen, &route.device) {
                route
                    .device
                    .set_global_color_correction(whitepoint, gamma)
                    .await;
            }
        }
    }

    async fn dispatch_firmware_config(
        &self,
        channel: u8,
        dithering: bool,
        interpolation: bool,
        led_enable: bool,
    ) {
        let mut seen: Vec<*const ()> = Vec::new();
        for route in self.fc_routes.iter().filter(|r| r.entry.opc_channel == channel) {
            if mark_touched(&mut seen, &route.device) {
                route
                    .device
                    .set_firmware_config(dithering, interpolation, led_enable)
                    .await;
            }
        }
    }

    async fn flush_touched(&self, touched: &[*const ()]) {
        let mut flushed: Vec<*const ()> = Vec::new();
        for route in &self.fc_routes {
            let ptr = Arc::as_ptr(&route.device) as *const ();
            if touched.contains(&ptr) && mark_touched(&mut flushed, &route.device) {
                route.device.flush().await;
            }
        }
        for route in &self.dmx_routes {
            let ptr = Arc::as_ptr(&route.device) as *const ();
            if touched.contains(&ptr) && mark_touched(&mut flushed, &route.device) {
                route.device.flush().await;
            }
        }
    }
}

fn mark_touched(seen: &mut Vec<*const ()>, device: &Arc<dyn DeviceDriver>) -> bool {
    let ptr = Arc::as_ptr(device) as *const ();
    if seen.contains(&ptr) {
        false
    } else {
        seen.push(ptr);
        true
    }
}

/// Effective color correction resolution, reused by CORE when a device
/// attaches (its initial LUT) and left here rather than in `config` since
/// it is routing policy, not document shape.
pub fn resolve_color(spec: &DeviceSpec, global: Option<ColorSpec>) -> ColorSpec {
    spec.effective_color(global)
}

/// Holds the current [`CompiledMapping`] behind a mutex, giving CORE an
/// atomic whole-table replacement whenever devices attach or detach,
/// instead of mutating routes in place while dispatch might be reading
/// them.
pub struct Mapping {
    current: Mutex<Arc<CompiledMapping>>,
}

impl Mapping {
    pub fn new() -> Self {
        Mapping {
            current: Mutex::new(Arc::new(CompiledMapping::default())),
        }
    }

    pub fn replace(&self, compiled: CompiledMapping) {
        *self.current.lock().unwrap() = Arc::new(compiled);
    }

    pub fn current(&self) -> Arc<CompiledMapping> {
        self.current.lock().unwrap().clone()
    }
}

impl Default for Mapping {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceDescriptor;
    use crate::devices::DeviceKind;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingDevice {
        capacity: u16,
        written: StdMutex<Vec<(u16, [u8; 3])>>,
        channels: StdMutex<Vec<(u8, u8)>>,
        flushes: StdMutex<u32>,
    }

    impl RecordingDevice {
        fn new(capacity: u16) -> Self {
            RecordingDevice {
                capacity,
                written: StdMutex::new(Vec::new()),
                channels: StdMutex::new(Vec::new()),
                flushes: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceDriver for RecordingDevice {
        async fn write_pixel(&self, offset: u16, rgb: [u8; 3]) {
            self.written.lock().unwrap().push((offset, rgb));
        }
        async fn write_channel(&self, channel: u8, value: u8) {
            self.channels.lock().unwrap().push((channel, value));
        }
        async fn set_global_color_correction(&self, _scale: [f64; 3], _gamma: f64) {}
        async fn set_firmware_config(&self, _d: bool, _i: bool, _l: bool) {}
        async fn flush(&self) {
            *self.flushes.lock().unwrap() += 1;
        }
        async fn shutdown(&self) {}
        fn describe(&self) -> DeviceDescriptor {
            DeviceDescriptor {
                kind: DeviceKind::Fadecandy,
                serial: None,
                bus: 1,
                address: 1,
            }
        }
        fn pixel_capacity(&self) -> u16 {
            self.capacity
        }
    }

    fn fc_spec(entry: FcMapEntry) -> DeviceSpec {
        DeviceSpec::Fadecandy {
            serial: None,
            color: None,
            map: vec![entry],
        }
    }

    #[tokio::test]
    async fn routes_pixel_to_configured_offset() {
        let recording = Arc::new(RecordingDevice::new(64));
        let device: Arc<dyn DeviceDriver> = recording.clone();
        let spec = fc_spec(FcMapEntry {
            opc_channel: 0,
            first_opc_pixel: 0,
            first_device_pixel: 10,
            pixel_count: 1,
            constant_color: None,
        });
        let mapping = CompiledMapping::build(&[(device, spec)]);
        let command = OpcCommand::SetPixelColors(vec![[1, 2, 3]]);
        mapping.dispatch(0, &command).await;

        assert_eq!(recording.written.lock().unwrap().as_slice(), &[(10, [1, 2, 3])]);
        assert_eq!(*recording.flushes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn channel_zero_does_not_broadcast_to_other_channel_entries() {
        let recording = Arc::new(RecordingDevice::new(64));
        let device: Arc<dyn DeviceDriver> = recording.clone();
        let spec = fc_spec(FcMapEntry {
            opc_channel: 5,
            first_opc_pixel: 0,
            first_device_pixel: 0,
            pixel_count: 1,
            constant_color: None,
        });
        let mapping = CompiledMapping::build(&[(device, spec)]);
        let command = OpcCommand::SetPixelColors(vec![[9, 9, 9]]);
        mapping.dispatch(0, &command).await;

        assert!(recording.written.lock().unwrap().is_empty());
        assert_eq!(*recording.flushes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn constant_color_ignores_payload() {
        let recording = Arc::new(RecordingDevice::new(64));
        let device: Arc<dyn DeviceDriver> = recording.clone();
        let spec = fc_spec(FcMapEntry {
            opc_channel: 0,
            first_opc_pixel: 0,
            first_device_pixel: 0,
            pixel_count: 2,
            constant_color: Some((255, 0, 0)),
        });
        let mapping = CompiledMapping::build(&[(device, spec)]);
        let command = OpcCommand::SetPixelColors(vec![]);
        mapping.dispatch(0, &command).await;

        assert_eq!(
            recording.written.lock().unwrap().as_slice(),
            &[(0, [255, 0, 0]), (1, [255, 0, 0])]
        );
    }

    #[tokio::test]
    async fn out_of_capacity_writes_are_dropped() {
        let recording = Arc::new(RecordingDevice::new(1));
        let device: Arc<dyn DeviceDriver> = recording.clone();
        let spec = fc_spec(FcMapEntry {
            opc_channel: 0,
            first_opc_pixel: 0,
            first_device_pixel: 0,
            pixel_count: 3,
            constant_color: Some((1, 1, 1)),
        });
        let mapping = CompiledMapping::build(&[(device, spec)]);
        mapping
            .dispatch(0, &OpcCommand::SetPixelColors(vec![]))
            .await;

        assert_eq!(recording.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dmx_route_picks_single_component() {
        let recording = Arc::new(RecordingDevice::new(0));
        let device: Arc<dyn DeviceDriver> = recording.clone();
        let spec = DeviceSpec::Enttec {
            serial: None,
            color: None,
            map: vec![DmxMapEntry {
                opc_channel: 0,
                opc_pixel: 0,
                component: Component::G,
                dmx_channel: 7,
            }],
        };
        let mapping = CompiledMapping::build(&[(device, spec)]);
        mapping
            .dispatch(0, &OpcCommand::SetPixelColors(vec![[1, 2, 3]]))
            .await;

        assert_eq!(recording.channels.lock().unwrap().as_slice(), &[(7, 2)]);
    }
}
