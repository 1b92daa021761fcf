pub mod alloc;
pub mod chain;
pub mod common;
pub mod container;
pub mod device;
pub mod diagnostics;
pub mod difat;
pub mod directory;
pub mod error;
pub mod fat;
pub mod header;
pub mod mini_fat;
pub mod sector;

pub use container::{Container, Entry, Parent, Stream};
pub use device::{Device, FileDevice, MemDevice};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink, EscalatingSink, LogSink};
pub use error::{CfbError, CfbResult};
pub use header::CreateOptions;
