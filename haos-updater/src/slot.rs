//! Single-slot mailbox for the most recently observed available version
//!
//! Backed by a `watch` channel: each write replaces the previous value and a
//! read always sees the latest completed write. Nothing is queued.

use crate::version::Version;
use tokio::sync::watch;

/// Writing half, owned by the resolver
#[derive(Debug)]
pub struct SlotWriter {
    tx: watch::Sender<Option<Version>>,
}

/// Reading half, handed to the command listener
#[derive(Debug, Clone)]
pub struct SlotReader {
    rx: watch::Receiver<Option<Version>>,
}

pub fn pending_install_slot() -> (SlotWriter, SlotReader) {
    let (tx, rx) = watch::channel(None);
    (SlotWriter { tx }, SlotReader { rx })
}

impl SlotWriter {
    pub fn put(&self, version: Version) {
        // send_replace never fails, even with no live receiver
        self.tx.send_replace(Some(version));
    }
}

impl SlotReader {
    pub fn latest(&self) -> Option<Version> {
        self.rx.borrow().clone()
    }
}
