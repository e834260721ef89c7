//! The file transfer protocol, layered on the serial protocol engine.
//!
//! **Example** - pushing a local blob to the device with verification:
//! ```ignore
//! let opts = TransferOptions {
//!     verify: true,
//!     ..Default::default()
//! };
//! let stats = RemoteFs::new(&mut engine, &mut session)
//!     .upload(&bytes, "/patch/blob.bin", &opts)?;
//! info!("{}", stats.report());
//! ```

mod files;
mod progress;

pub use files::{DirEntry, FileStat, OpenMode, RemoteFs};
pub use progress::{CancelToken, ProgressEvent, TransferOptions, TransferStats};
