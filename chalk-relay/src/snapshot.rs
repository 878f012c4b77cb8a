//! Source of the current board state.
//!
//! The relay treats the board as an opaque encoded blob. Encoding and
//! decoding the image is the renderer's business.

use parking_lot::RwLock;

/// Supplies the current board snapshot on demand.
///
/// Called while the registry lock is held. Implementations must not call
/// back into the registry.
pub trait SnapshotProvider: Send + Sync {
    /// `None` means the board is blank.
    fn board_data(&self) -> Option<String>;
}

/// In-memory snapshot guarded by its own lock.
#[derive(Debug, Default)]
pub struct SharedBoard {
    data: RwLock<Option<String>>,
}

impl SharedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: impl Into<String>) -> Self {
        Self {
            data: RwLock::new(Some(data.into())),
        }
    }

    /// Replace the stored snapshot, returning the previous one.
    pub fn replace(&self, data: Option<String>) -> Option<String> {
        std::mem::replace(&mut *self.data.write(), data)
    }

    pub fn clear(&self) {
        self.data.write().take();
    }

    pub fn is_blank(&self) -> bool {
        self.data.read().is_none()
    }
}

impl SnapshotProvider for SharedBoard {
    fn board_data(&self) -> Option<String> {
        self.data.read().clone()
    }
}
