//! Single-file encrypted container.
//!
//! A container is one seekable blob laid out as
//! `HEADER-START | header | HEADER-PAD | padding | HEADER-END | payloads | LOG-START | footer | LOG-END`.
//! The header is the registry of every stored file, directory and note; the
//! payload region holds their bytes back to back.
//!
//! # Modules
//! - [`layout`]: section markers and header/footer regions
//! - [`registry`]: typed header records and their mutations
//! - [`schema`]: key/type validation at the deserialization boundary
//! - [`allocator`]: dense identifier allocation
//! - [`shifter`]: offset rebasing after physical inserts and deletes
//! - [`writer`]: header sizing and the resize protocol
//! - [`container`]: the open container and its operations
//! - [`batch`]: best-effort bulk import and extract

pub mod allocator;
pub mod batch;
pub mod config;
pub mod container;
pub mod footer;
pub mod layout;
pub mod registry;
pub mod schema;
pub mod shifter;
pub mod store;
pub mod writer;

pub use batch::{BatchReport, ItemOutcome, ItemStatus};
pub use config::ContainerConfig;
pub use container::{Container, NewFile};
pub use footer::{Footer, SessionLog};
pub use layout::{HeaderLayout, Marker};
pub use registry::{
    DirectoryRecord, FileMetadata, FileQuery, FileRecord, FolderRemoval, Header, NoteRecord,
    VaultMap, VaultStats, NONE, ROOT_DIR,
};
pub use schema::{validate_footer, validate_header};
pub use shifter::shift_offsets;
pub use store::{ContainerStore, MemoryStore};
