pub mod addr;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod entry;
pub mod error;
pub mod flash;
pub mod store;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use flash::{FileFlash, Flash, MemFlash};
pub use store::Store;
