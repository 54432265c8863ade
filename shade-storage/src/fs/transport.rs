//! The kernel-facing request/response vocabulary. This
//! models the surface a FUSE (or any other POSIX-ish) transport would
//! drive: plain Rust structs, no `libc`/`fuse-sys` types. The actual
//! kernel binding is the excluded external collaborator;
//! [`super::server::FsServer`] implements this trait, and a real
//! transport would translate kernel callbacks into calls against it. A
//! loopback test harness drives the same trait methods directly.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
}

/// Attribute assembly: synthetic nodes get directory mode
/// and `nlink = children + 2`; file nodes get regular mode, block count
/// `ceil(size / 4096)`, and all four timestamps set to `ModifiedTime`.
#[derive(Debug, Clone)]
pub struct Attr {
    pub inode: u64,
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct InitRequest;

#[derive(Debug, Clone)]
pub struct InitResponse {
    pub max_write: u32,
}

#[derive(Debug, Clone)]
pub struct StatfsRequest {
    pub inode: u64,
}

#[derive(Debug, Clone)]
pub struct StatfsResponse {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[derive(Debug, Clone)]
pub struct GetattrRequest {
    pub inode: u64,
}

#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub parent: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ForgetRequest {
    pub inode: u64,
    pub nlookup: u64,
}

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub inode: u64,
}

#[derive(Debug, Clone)]
pub struct OpenResponse {
    pub handle: u64,
}

#[derive(Debug, Clone)]
pub struct SetattrRequest {
    pub inode: u64,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub parent: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub inode: u64,
    pub handle: u64,
    pub attr: Attr,
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub handle: u64,
    pub offset: i64,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReaddirRequest {
    pub inode: u64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub kind: FileKind,
}

#[derive(Debug, Clone)]
pub struct ReaddirResponse {
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Clone)]
pub struct MkdirRequest {
    pub parent: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RemoveRequest {
    pub parent: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RenameRequest {
    pub parent: u64,
    pub name: String,
    pub new_parent: u64,
    pub new_name: String,
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub handle: u64,
    pub offset: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub written: u32,
}

#[derive(Debug, Clone)]
pub struct FlushRequest {
    pub handle: u64,
}

#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub handle: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyRequest;

/// One method per POSIX-like request kind. Errors surface through
/// `Result`; `forget`/`destroy` have no failure mode worth reporting to
/// a kernel transport and return unit directly.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn init(&self, req: InitRequest) -> Result<InitResponse>;
    async fn statfs(&self, req: StatfsRequest) -> Result<StatfsResponse>;
    async fn getattr(&self, req: GetattrRequest) -> Result<Attr>;
    async fn lookup(&self, req: LookupRequest) -> Result<Attr>;
    async fn forget(&self, req: ForgetRequest);
    async fn open(&self, req: OpenRequest) -> Result<OpenResponse>;
    async fn setattr(&self, req: SetattrRequest) -> Result<Attr>;
    async fn create(&self, req: CreateRequest) -> Result<CreateResponse>;
    async fn read(&self, req: ReadRequest) -> Result<ReadResponse>;
    async fn readdir(&self, req: ReaddirRequest) -> Result<ReaddirResponse>;
    async fn mkdir(&self, req: MkdirRequest) -> Result<Attr>;
    async fn remove(&self, req: RemoveRequest) -> Result<()>;
    async fn rename(&self, req: RenameRequest) -> Result<()>;
    async fn write(&self, req: WriteRequest) -> Result<WriteResponse>;
    async fn flush(&self, req: FlushRequest) -> Result<()>;
    async fn release(&self, req: ReleaseRequest) -> Result<()>;
    async fn destroy(&self, req: DestroyRequest);
}
