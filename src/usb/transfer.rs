//! Transfer completion outcomes delivered by the USB transport layer.
use std::io;

/// The result delivered to a device's completion callback once a
/// previously submitted OUT transfer finishes.
#[derive(Debug)]
pub enum TransferOutcome {
    Ok { bytes: usize },
    Stall,
    Cancelled,
    IoError(io::Error),
}

impl TransferOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TransferOutcome::Ok { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferOutcome::Cancelled)
    }
}
