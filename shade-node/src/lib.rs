//! Shade daemon: wires a `Config` document, the backend it builds, the
//! path index, and the filesystem request dispatcher together into one
//! running process.
//!
//! The actual kernel-level FUSE transport is the excluded external
//! collaborator (see `shade_storage::fs::transport::Transport`); this
//! crate owns everything below that boundary — config loading, backend
//! construction, periodic tree refresh, and the `FsServer` itself — so a
//! real transport binding only has to translate kernel callbacks into
//! `Transport` calls against [`daemon::Daemon::server`].

pub mod daemon;
