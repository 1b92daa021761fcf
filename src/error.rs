//! The fatal error taxonomy and the recoverable diagnostic taxonomy, per §7.
//!
//! Grounded on `oonxt-rust-ole/src/common.rs`'s `OleError` (a `thiserror`-derived
//! enum); expanded to the full fatal/recoverable split the spec names instead of
//! the teacher's small ad-hoc set.

use thiserror::Error;

/// A structural impossibility: the container cannot safely continue the current
/// operation.
#[derive(Debug, Error)]
pub enum CfbError {
    #[error("malformed header")]
    Header,
    #[error("invalid magic signature")]
    InvalidMagic,
    #[error("invalid byte-order mark")]
    InvalidBom,
    #[error("master FAT (DIFAT) is structurally invalid")]
    MasterFat,
    #[error("FAT is structurally invalid")]
    NormalFat,
    #[error("MiniFAT is structurally invalid")]
    MiniFat,
    #[error("FAT chain entry names a sector outside the file")]
    LargeNormalFat,
    #[error("MiniFAT chain entry names a mini sector outside the mini stream")]
    LargeMiniFat,
    #[error("stream requires a MiniFAT that is not present")]
    NoMiniFat,
    #[error("DIFAT chain contains a loop")]
    MasterLoop,
    #[error("FAT or MiniFAT chain contains a loop")]
    NormalLoop,
    #[error("directory child tree contains a loop or is not a valid BST")]
    DirLoop,
    #[error("directory entry is malformed: {0}")]
    DirEntry(String),
    #[error("entry not found")]
    NotFound,
    #[error("entry is not a stream")]
    NotStream,
    #[error("entry is not a storage")]
    NotStorage,
    #[error("name collides with an existing sibling")]
    NameCollision,
    #[error("cannot rename or delete the root entry")]
    RootImmutable,
    #[error("diagnostic escalated to fatal by sink policy: {0:?}")]
    Escalated(crate::diagnostics::DiagnosticKind),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Binrw(#[from] binrw::Error),
}

pub type CfbResult<T> = Result<T, CfbError>;
