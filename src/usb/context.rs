//! Raw `libusb1-sys` context and device-handle wrapper: an RAII context
//! with a background event-polling thread, and a claimed-interface handle
//! that submits OUT transfers asynchronously via the
//! alloc-transfer/callback/oneshot pattern.
use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_NOT_SUPPORTED,
    LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_ERROR, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
    LIBUSB_TRANSFER_TYPE_BULK,
};
use log::{debug, warn};
use tokio::sync::oneshot;

use super::transfer::TransferOutcome;

pub const USB_TIMEOUT: Duration = Duration::from_millis(100);

fn duration_to_timeout(timeout: Duration) -> c_uint {
    timeout.as_millis().min(u32::MAX as u128) as c_uint
}

#[derive(Copy, Clone)]
struct LibusbCtxPtr(*mut libusb::libusb_context);

unsafe impl Send for LibusbCtxPtr {}
unsafe impl Sync for LibusbCtxPtr {}

/// RAII wrapper owning a libusb context and its background event thread.
/// `scan()` below enumerates attached devices, and
/// [`DeviceHandle::submit_bulk_out`] submits OUT transfers without blocking
/// the caller.
pub struct UsbContext {
    ptr: LibusbCtxPtr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UsbContext {
    pub fn new() -> io::Result<Arc<Self>> {
        let mut ctx = ptr::null_mut();
        let rc = unsafe { libusb::libusb_init(&mut ctx) };
        if rc < 0 {
            return Err(io::Error::other(format!("libusb init failed: {rc}")));
        }

        let ctx_ptr = LibusbCtxPtr(ctx);
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();

        let handle = std::thread::Builder::new()
            .name("usb-events".into())
            .spawn(move || {
                let mut timeval = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 10_000,
                };
                while running_thread.load(Ordering::SeqCst) {
                    let rc = unsafe {
                        libusb::libusb_handle_events_timeout_completed(
                            ctx_ptr.0,
                            &mut timeval,
                            ptr::null_mut(),
                        )
                    };
                    if rc == libusb::constants::LIBUSB_ERROR_INTERRUPTED {
                        continue;
                    }
                    if rc < 0 && running_thread.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                }
            })
            .map_err(|e| io::Error::other(format!("failed to spawn libusb event thread: {e}")))?;

        Ok(Arc::new(UsbContext {
            ptr: ctx_ptr,
            running,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Enumerate every attached USB device. Cheap: descriptor fields are
    /// already cached by libusb during `libusb_get_device_list` and require
    /// no open handle. Called on a timer tick and diffed against the
    /// attached device table to synthesize hotplug events.
    pub fn scan(self: &Arc<Self>) -> io::Result<Vec<UsbDeviceInfo>> {
        let mut list = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(self.ptr.0, &mut list) };
        if count < 0 {
            return Err(map_libusb_error(count as i32));
        }
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let device = unsafe { *list.add(i as usize) };
            if let Ok(desc) = get_device_descriptor(device) {
                out.push(UsbDeviceInfo {
                    bus: unsafe { libusb::libusb_get_bus_number(device) },
                    address: unsafe { libusb::libusb_get_device_address(device) },
                    vendor_id: desc.idVendor,
                    product_id: desc.idProduct,
                });
            }
        }
        unsafe { libusb::libusb_free_device_list(list, 1) };
        Ok(out)
    }

    /// Open the device currently at `(bus, address)`, claim `interface`, and
    /// read its serial string (if any). Returns `NotFound` if the device
    /// left the bus between the scan that discovered it and this call.
    pub fn open(
        self: &Arc<Self>,
        bus: u8,
        address: u8,
        interface: u8,
    ) -> io::Result<(DeviceHandle, Option<String>)> {
        let mut list = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(self.ptr.0, &mut list) };
        if count < 0 {
            return Err(map_libusb_error(count as i32));
        }

        let mut found = None;
        for i in 0..count {
            let device = unsafe { *list.add(i as usize) };
            let this_bus = unsafe { libusb::libusb_get_bus_number(device) };
            let this_addr = unsafe { libusb::libusb_get_device_address(device) };
            if this_bus == bus && this_addr == address {
                found = Some(device);
                break;
            }
        }

        let result = match found {
            Some(device) => {
                let handle = DeviceHandle::open(self.clone(), device)?;
                handle.set_auto_detach_kernel_driver(true).ok();
                handle.claim_interface(interface)?;
                let desc = get_device_descriptor(device)?;
                let serial = read_string_descriptor(&handle, desc.iSerialNumber);
                Ok((handle, serial))
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no USB device at bus {bus} address {address}"),
            )),
        };

        unsafe { libusb::libusb_free_device_list(list, 1) };
        result
    }
}

impl Drop for UsbContext {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        unsafe {
            let mut zero = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let _ =
                libusb::libusb_handle_events_timeout_completed(self.ptr.0, &mut zero, ptr::null_mut());
        }
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        unsafe { libusb::libusb_exit(self.ptr.0) };
    }
}

/// A device observed during a scan, identified by (bus, address), matching
/// the attached device table's uniqueness key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

struct LibusbHandlePtr(*mut libusb::libusb_device_handle);

unsafe impl Send for LibusbHandlePtr {}
unsafe impl Sync for LibusbHandlePtr {}

impl Drop for LibusbHandlePtr {
    fn drop(&mut self) {
        unsafe { libusb::libusb_close(self.0) };
    }
}

/// Wrapper around a claimed `libusb_device_handle`. Cloning shares the
/// underlying handle (it's reference counted).
#[derive(Clone)]
pub struct DeviceHandle {
    context: Arc<UsbContext>,
    handle: Arc<LibusbHandlePtr>,
}

impl DeviceHandle {
    fn open(context: Arc<UsbContext>, device: *mut libusb::libusb_device) -> io::Result<Self> {
        let mut handle = ptr::null_mut();
        let rc = unsafe { libusb::libusb_open(device, &mut handle) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(DeviceHandle {
            context,
            handle: Arc::new(LibusbHandlePtr(handle)),
        })
    }

    fn raw(&self) -> *mut libusb::libusb_device_handle {
        self.handle.0
    }

    pub fn set_auto_detach_kernel_driver(&self, enable: bool) -> io::Result<()> {
        let flag = if enable { 1 } else { 0 };
        let rc = unsafe { libusb::libusb_set_auto_detach_kernel_driver(self.handle.0, flag) };
        if rc < 0 && rc != LIBUSB_ERROR_NOT_SUPPORTED {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub fn claim_interface(&self, interface: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_claim_interface(self.handle.0, interface as i32) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub fn clear_halt(&self, endpoint: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_clear_halt(self.handle.0, endpoint) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    /// Submit a bulk OUT transfer. Returns immediately (the syscall behind
    /// `libusb_submit_transfer` does not wait for completion); the returned
    /// future resolves once the background event thread's poll loop
    /// invokes the completion callback. `buffer` is not copied again after
    /// this call — it is handed to libusb and must stay valid until the
    /// future resolves.
    pub async fn submit_bulk_out(&self, endpoint: u8, buffer: Vec<u8>) -> TransferOutcome {
        let (tx, rx) = oneshot::channel();
        let state = Box::new(BulkWriteState {
            sender: Some(tx),
            buffer: Some(buffer),
        });
        let state_ptr = Box::into_raw(state);

        let transfer = unsafe { libusb::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            unsafe {
                let _ = Box::from_raw(state_ptr);
            }
            return TransferOutcome::IoError(io::Error::other("libusb_alloc_transfer failed"));
        }

        unsafe {
            (*transfer).dev_handle = self.raw();
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            (*transfer).timeout = duration_to_timeout(USB_TIMEOUT);
            (*transfer).callback = bulk_write_callback;
            (*transfer).user_data = state_ptr as *mut c_void;
            if let Some(buf) = (&mut *state_ptr).buffer.as_mut() {
                (*transfer).buffer = buf.as_mut_ptr();
                (*transfer).length = buf.len() as c_int;
            }
        }

        let submit = unsafe { libusb::libusb_submit_transfer(transfer) };
        if submit < 0 {
            unsafe {
                let _ = Box::from_raw(state_ptr);
                libusb::libusb_free_transfer(transfer);
            }
            return TransferOutcome::from_submit_error(map_libusb_error(submit));
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => TransferOutcome::IoError(io::Error::other("transfer channel closed")),
        }
    }
}

struct BulkWriteState {
    sender: Option<oneshot::Sender<TransferOutcome>>,
    buffer: Option<Vec<u8>>,
}

extern "system" fn bulk_write_callback(transfer: *mut libusb::libusb_transfer) {
    unsafe {
        let state_ptr = (*transfer).user_data as *mut BulkWriteState;
        let mut state = Box::from_raw(state_ptr);
        let status = (*transfer).status;
        let outcome = if status == LIBUSB_TRANSFER_COMPLETED {
            TransferOutcome::Ok {
                bytes: (*transfer).actual_length as usize,
            }
        } else {
            TransferOutcome::from_status(status)
        };
        state.buffer.take();
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(outcome);
        }
        libusb::libusb_free_transfer(transfer);
    }
}

fn libusb_error_string(code: i32) -> String {
    unsafe {
        let ptr = libusb::libusb_error_name(code);
        if ptr.is_null() {
            format!("libusb error {code}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

pub fn map_libusb_error(code: i32) -> io::Error {
    let kind = match code {
        LIBUSB_ERROR_TIMEOUT => io::ErrorKind::WouldBlock,
        LIBUSB_ERROR_PIPE => io::ErrorKind::BrokenPipe,
        LIBUSB_ERROR_NO_DEVICE => io::ErrorKind::NotConnected,
        LIBUSB_ERROR_NOT_FOUND => io::ErrorKind::NotFound,
        LIBUSB_ERROR_INTERRUPTED => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, libusb_error_string(code))
}

fn map_transfer_status(status: i32) -> io::Error {
    let (kind, description) = match status {
        s if s == LIBUSB_TRANSFER_TIMED_OUT => (io::ErrorKind::WouldBlock, "libusb transfer timed out"),
        s if s == LIBUSB_TRANSFER_STALL => (io::ErrorKind::BrokenPipe, "libusb transfer stalled"),
        s if s == LIBUSB_TRANSFER_NO_DEVICE => {
            (io::ErrorKind::NotConnected, "libusb device disconnected")
        }
        s if s == LIBUSB_TRANSFER_CANCELLED => (io::ErrorKind::Interrupted, "libusb transfer cancelled"),
        s if s == LIBUSB_TRANSFER_ERROR => (io::ErrorKind::Other, "libusb transfer error"),
        s if s == LIBUSB_TRANSFER_OVERFLOW => (io::ErrorKind::Other, "libusb transfer overflow"),
        _ => (io::ErrorKind::Other, "libusb transfer failed"),
    };
    io::Error::new(kind, description)
}

fn get_device_descriptor(
    device: *mut libusb::libusb_device,
) -> io::Result<libusb::libusb_device_descriptor> {
    let mut desc = MaybeUninit::<libusb::libusb_device_descriptor>::uninit();
    let rc = unsafe { libusb::libusb_get_device_descriptor(device, desc.as_mut_ptr()) };
    if rc < 0 {
        return Err(map_libusb_error(rc));
    }
    Ok(unsafe { desc.assume_init() })
}

fn read_string_descriptor(handle: &DeviceHandle, index: u8) -> Option<String> {
    if index == 0 {
        return None;
    }
    let mut buf = vec![0u8; 255];
    let len = unsafe {
        libusb::libusb_get_string_descriptor_ascii(
            handle.raw(),
            index,
            buf.as_mut_ptr(),
            buf.len() as c_int,
        )
    };
    if len < 0 {
        warn!("failed to read string descriptor {index}: {}", map_libusb_error(len));
        return None;
    }
    buf.truncate(len as usize);
    String::from_utf8(buf).ok()
}

impl TransferOutcome {
    fn from_status(status: i32) -> Self {
        if status == LIBUSB_TRANSFER_CANCELLED {
            TransferOutcome::Cancelled
        } else if status == LIBUSB_TRANSFER_STALL {
            TransferOutcome::Stall
        } else {
            TransferOutcome::IoError(map_transfer_status(status))
        }
    }

    fn from_submit_error(err: io::Error) -> Self {
        debug!("bulk submit failed: {err}");
        TransferOutcome::IoError(err)
    }
}
