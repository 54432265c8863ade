//! The filesystem-facing surface: the kernel transport
//! vocabulary, per-handle state, and the request dispatcher built on top
//! of [`crate::tree`] and [`crate::inode`].

pub mod handle;
pub mod server;
pub mod transport;

pub use handle::{Handle, HandleTable};
pub use server::FsServer;
pub use transport::Transport;
