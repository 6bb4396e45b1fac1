//! The storage engine: append path, backward walker, garbage collector
//! and mount-time recovery over one block-erasable device.

mod gc;
mod log;
mod recovery;
#[allow(clippy::module_inception)]
mod store;

pub use store::Store;

use crate::addr::Addr;
use crate::cache::LookupCache;
use crate::config::StoreConfig;
use crate::entry::WireFormat;
use crate::flash::Flash;

/// Mutable engine state: geometry, the two write cursors and the optional
/// lookup cache. Owned exclusively by [`Store`] behind its mutex; every
/// field is re-derivable from log content alone.
pub(crate) struct Core<F: Flash> {
    pub(crate) flash: F,
    pub(crate) config: StoreConfig,
    pub(crate) fmt: WireFormat,
    /// Entry record size on media: wire size padded to the program
    /// granularity.
    pub(crate) ate_size: u32,
    pub(crate) write_alignment: u32,
    pub(crate) erase_value: u8,
    /// Next free entry slot; moves downward from a sector's high end.
    pub(crate) ate_wra: Addr,
    /// Next free value byte; moves upward from a sector's low end.
    pub(crate) data_wra: Addr,
    pub(crate) cache: Option<LookupCache>,
    pub(crate) ready: bool,
}
