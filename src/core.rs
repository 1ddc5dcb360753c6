//! Server core: owns the USB context, the device table, the compiled
//! mapping, and the event sources (the OPC listener, the hotplug scanner,
//! and the config-reload signal), tied together with a `tokio::select!`
//! loop and an orderly abort-then-drain shutdown.
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::{load_config, ColorSpec, Config, DeviceSpec};
use crate::devices::dmx::DmxDevice;
use crate::devices::fc::FcDevice;
use crate::devices::{color_to_scale_gamma, DeviceDriver, DeviceKind, DeviceTable};
use crate::mapping::{resolve_color, CompiledMapping, Mapping};
use crate::opc::{decode_command, Connection, Listener, OpcMessage};
use crate::usb::{UsbContext, UsbDeviceInfo};

/// Both drivers currently claim interface 0; neither protocol in scope here
/// exposes an alternate-setting interface worth selecting between.
const USB_INTERFACE: u8 = 0;

const HOTPLUG_SCAN_INTERVAL: Duration = Duration::from_millis(500);

pub struct ServerCore {
    context: Arc<UsbContext>,
    table: Mutex<DeviceTable>,
    mapping: Arc<Mapping>,
    specs: Mutex<Vec<DeviceSpec>>,
    global_color: Mutex<Option<ColorSpec>>,
    config_path: PathBuf,
}

impl ServerCore {
    pub fn new(config: Config, config_path: PathBuf) -> std::io::Result<Arc<Self>> {
        let context = UsbContext::new()?;
        Ok(Arc::new(ServerCore {
            context,
            table: Mutex::new(DeviceTable::new()),
            mapping: Arc::new(Mapping::new()),
            specs: Mutex::new(config.devices),
            global_color: Mutex::new(config.color),
            config_path,
        }))
    }

    /// Run until interrupted. Binds the OPC listener, spawns the hotplug
    /// scanner, then multiplexes accepted connections in a single task via
    /// a resubmitted `FuturesUnordered` of per-connection reads instead of
    /// spawning one task per connection. Also listens for `SIGHUP` to
    /// reload the configuration document in place.
    pub async fn run(self: &Arc<Self>, listen: (String, u16)) -> std::io::Result<()> {
        self.initial_scan().await;

        let scanner = self.clone();
        let hotplug_task = tokio::spawn(async move { scanner.hotplug_loop().await });

        let mut current_listen = listen.clone();
        let mut listener = Listener::bind(&current_listen).await?;
        let mut next_conn_id: usize = 0;
        let mut pending: PendingReads = futures::stream::FuturesUnordered::new();
        let mut reload_signal = reload_signal_stream()?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(conn) => {
                            let idx = next_conn_id;
                            next_conn_id += 1;
                            pending.push(read_future(idx, conn));
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                Some((idx, result)) = futures::stream::StreamExt::next(&mut pending) => {
                    match result {
                        ReadResult::Messages(conn, msgs) => {
                            for msg in msgs {
                                self.handle_message(msg).await;
                            }
                            pending.push(read_future(idx, conn));
                        }
                        ReadResult::Closed(peer) => {
                            debug!("connection {peer} closed");
                        }
                        ReadResult::Error(peer, e) => {
                            warn!("connection {peer} read error: {e}");
                        }
                    }
                }
                _ = reload_signal.recv() => {
                    match self.reload_config().await {
                        Ok(new_listen) if new_listen != current_listen => {
                            info!("configuration reloaded, rebinding listener to {}:{}", new_listen.0, new_listen.1);
                            match Listener::bind(&new_listen).await {
                                Ok(new_listener) => {
                                    listener = new_listener;
                                    current_listen = new_listen;
                                }
                                Err(e) => warn!("failed to rebind listener to {}:{}: {e}", new_listen.0, new_listen.1),
                            }
                        }
                        Ok(_) => info!("configuration reloaded"),
                        Err(e) => warn!("configuration reload failed: {e}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        hotplug_task.abort();
        let devices: Vec<Arc<dyn DeviceDriver>> = {
            let table = self.table.lock().unwrap();
            table.iter().cloned().collect()
        };
        for device in devices {
            device.shutdown().await;
        }
        Ok(())
    }

    async fn handle_message(&self, msg: OpcMessage) {
        let command = decode_command(&msg);
        self.mapping.current().dispatch(msg.channel, &command).await;
    }

    /// Reparse the configuration document from disk and atomically replace
    /// the routing mapping against the currently attached device set.
    /// Returns the reloaded document's listen address so the caller can
    /// decide whether to rebind.
    async fn reload_config(self: &Arc<Self>) -> std::io::Result<(String, u16)> {
        let config = load_config(&self.config_path)?;
        *self.specs.lock().unwrap() = config.devices;
        *self.global_color.lock().unwrap() = config.color;
        self.recompile_mapping();
        Ok(config.listen)
    }

    async fn initial_scan(self: &Arc<Self>) {
        let infos = match self.context.scan() {
            Ok(infos) => infos,
            Err(e) => {
                warn!("initial USB scan failed: {e}");
                return;
            }
        };
        for info in infos {
            self.try_attach(info).await;
        }
        self.recompile_mapping();
    }

    async fn hotplug_loop(self: Arc<Self>) {
        let mut known: HashSet<(u8, u8)> = {
            let table = self.table.lock().unwrap();
            table.addresses().into_iter().collect()
        };
        loop {
            tokio::time::sleep(HOTPLUG_SCAN_INTERVAL).await;
            let infos = match self.context.scan() {
                Ok(infos) => infos,
                Err(e) => {
                    warn!("hotplug scan failed: {e}");
                    continue;
                }
            };
            let present: HashSet<(u8, u8)> = infos.iter().map(|i| (i.bus, i.address)).collect();

            let removed: Vec<(u8, u8)> = known.difference(&present).copied().collect();
            let mut changed = false;
            for (bus, address) in removed {
                if let Some(device) = self.table.lock().unwrap().detach(bus, address) {
                    device.shutdown().await;
                    changed = true;
                }
            }

            for info in infos.iter().filter(|i| !known.contains(&(i.bus, i.address))) {
                if self.try_attach(*info).await {
                    changed = true;
                }
            }

            known = present;
            if changed {
                self.recompile_mapping();
            }
        }
    }

    async fn try_attach(self: &Arc<Self>, info: UsbDeviceInfo) -> bool {
        let kind = if FcDevice::matches(info.vendor_id, info.product_id) {
            DeviceKind::Fadecandy
        } else if DmxDevice::matches(info.vendor_id, info.product_id, None, None) {
            DeviceKind::Dmx
        } else {
            return false;
        };

        let (handle, serial) = match self.context.open(info.bus, info.address, USB_INTERFACE) {
            Ok(result) => result,
            Err(e) => {
                debug!("failed to open device at {}:{}: {e}", info.bus, info.address);
                return false;
            }
        };

        let specs = self.specs.lock().unwrap().clone();

        let bound: HashSet<usize> = {
            let table = self.table.lock().unwrap();
            table
                .iter()
                .filter_map(|d| spec_index_for(&specs, d.describe().kind, d.describe().serial.as_deref()))
                .collect()
        };

        let Some(spec_idx) = specs.iter().enumerate().find(|(idx, spec)| {
            !bound.contains(idx) && kind_matches(spec, kind) && serial_matches(spec, kind, serial.as_deref())
        }).map(|(idx, _)| idx) else {
            debug!(
                "device at {}:{} (vid {:04x} pid {:04x}) matched no unbound configuration entry",
                info.bus, info.address, info.vendor_id, info.product_id
            );
            return false;
        };

        let spec = &specs[spec_idx];
        let global_color = *self.global_color.lock().unwrap();
        let color = resolve_color(spec, global_color);
        let scale_gamma = color_to_scale_gamma(color);

        let driver: Arc<dyn DeviceDriver> = match kind {
            DeviceKind::Fadecandy => {
                let capacity = fc_pixel_capacity(spec);
                FcDevice::spawn(handle, info.bus, info.address, serial, capacity, scale_gamma)
            }
            DeviceKind::Dmx => DmxDevice::spawn(handle, info.bus, info.address, serial, scale_gamma),
        };

        match self.table.lock().unwrap().attach(driver) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to register device at {}:{}: {e}", info.bus, info.address);
                false
            }
        }
    }

    fn recompile_mapping(&self) {
        let table = self.table.lock().unwrap();
        let specs = self.specs.lock().unwrap();
        let bindings: Vec<(Arc<dyn DeviceDriver>, DeviceSpec)> = table
            .iter()
            .filter_map(|device| {
                let descriptor = device.describe();
                let idx = spec_index_for(&specs, descriptor.kind, descriptor.serial.as_deref())?;
                Some((device.clone(), specs[idx].clone()))
            })
            .collect();
        self.mapping.replace(CompiledMapping::build(&bindings));
    }
}

fn spec_index_for(specs: &[DeviceSpec], kind: DeviceKind, serial: Option<&str>) -> Option<usize> {
    specs
        .iter()
        .position(|spec| kind_matches(spec, kind) && serial_matches(spec, kind, serial))
}

fn kind_matches(spec: &DeviceSpec, kind: DeviceKind) -> bool {
    matches!(
        (spec, kind),
        (DeviceSpec::Fadecandy { .. }, DeviceKind::Fadecandy) | (DeviceSpec::Enttec { .. }, DeviceKind::Dmx)
    )
}

/// A spec with no configured serial matches any device. Enttec adapters
/// match by serial *prefix* (an adapter reporting `"EN1234-00AB"` binds a
/// configured identifier of `"EN1234"`); Fadecandy units match by exact
/// serial equality.
fn serial_matches(spec: &DeviceSpec, kind: DeviceKind, serial: Option<&str>) -> bool {
    let Some(want) = spec.serial() else {
        return true;
    };
    match kind {
        DeviceKind::Dmx => serial.map(|s| s.starts_with(want)).unwrap_or(false),
        DeviceKind::Fadecandy => serial == Some(want),
    }
}

/// Derived from the device's own map entries rather than a separate config
/// field: the highest destination pixel any entry addresses, plus one.
fn fc_pixel_capacity(spec: &DeviceSpec) -> u16 {
    match spec {
        DeviceSpec::Fadecandy { map, .. } => map
            .iter()
            .map(|e| e.first_device_pixel.saturating_add(e.pixel_count))
            .max()
            .unwrap_or(0),
        DeviceSpec::Enttec { .. } => 0,
    }
}

enum ReadResult {
    Messages(Connection, Vec<OpcMessage>),
    Closed(std::net::SocketAddr),
    Error(std::net::SocketAddr, std::io::Error),
}

type PendingReads = futures::stream::FuturesUnordered<
    Pin<Box<dyn Future<Output = (usize, ReadResult)> + Send>>,
>;

fn read_future(idx: usize, mut conn: Connection) -> Pin<Box<dyn Future<Output = (usize, ReadResult)> + Send>> {
    Box::pin(async move {
        let peer = conn.peer();
        match conn.read_messages().await {
            Ok(Some(msgs)) => (idx, ReadResult::Messages(conn, msgs)),
            Ok(None) => (idx, ReadResult::Closed(peer)),
            Err(e) => (idx, ReadResult::Error(peer, e)),
        }
    })
}

/// The external trigger for a config reload: `SIGHUP` on Unix, and a
/// signal that never fires on platforms without it.
enum ReloadSignal {
    #[cfg(unix)]
    Hangup(tokio::signal::unix::Signal),
    #[cfg(not(unix))]
    Never,
}

impl ReloadSignal {
    async fn recv(&mut self) -> Option<()> {
        match self {
            #[cfg(unix)]
            ReloadSignal::Hangup(signal) => signal.recv().await,
            #[cfg(not(unix))]
            ReloadSignal::Never => std::future::pending().await,
        }
    }
}

fn reload_signal_stream() -> std::io::Result<ReloadSignal> {
    #[cfg(unix)]
    {
        let signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        return Ok(ReloadSignal::Hangup(signal));
    }
    #[cfg(not(unix))]
    {
        Ok(ReloadSignal::Never)
    }
}
