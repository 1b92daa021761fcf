//! Recoverable-diagnostic taxonomy and the sink abstraction that routes them.
//!
//! Grounded on the spec's §7 warning taxonomy and its instruction to model
//! diagnostics as "a tagged variant pushed to an injected sink" rather than global
//! mutable state. The default sink forwards to the `log` facade, following the
//! `log`-based idiom in `marirs-ole-rs/oleid` and `marirs-ole-rs/oleobj`.

use std::cell::RefCell;
use std::collections::HashSet;

use crate::error::CfbError;

/// A non-fatal, substitutable anomaly encountered while decoding or validating a
/// container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    HeaderWarning,
    SectorSizeWarning,
    VersionWarning,
    MasterSectorWarning,
    NormalSectorWarning,
    DirNameWarning,
    DirTypeWarning,
    DirIndexWarning,
    DirTimeWarning,
    DirSectorWarning,
    DirSizeWarning,
    TruncatedWarning,
    EmulationWarning,
}

/// One emitted diagnostic: a kind plus a human-readable detail.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, detail: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            detail: detail.into(),
        }
    }
}

/// The injection point for recoverable diagnostics. Implementations decide whether
/// a diagnostic merely gets surfaced (the default) or is escalated to a fatal
/// `CfbError`.
pub trait DiagnosticSink {
    fn report(&self, diagnostic: Diagnostic) -> Result<(), CfbError>;
}

/// Forwards every diagnostic to the `log` facade: warnings at `Warn`, repaint-style
/// informational diagnostics at `Debug`. This is the default sink for every
/// `Reader`/`Writer`/`Editor` unless a caller installs a different one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, diagnostic: Diagnostic) -> Result<(), CfbError> {
        match diagnostic.kind {
            DiagnosticKind::DirIndexWarning | DiagnosticKind::EmulationWarning => {
                log::debug!("{:?}: {}", diagnostic.kind, diagnostic.detail);
            }
            _ => {
                log::warn!("{:?}: {}", diagnostic.kind, diagnostic.detail);
            }
        }
        Ok(())
    }
}

/// Collects diagnostics into a `Vec` instead of logging them, for tests and for
/// callers that want to inspect what was non-conforming about a container after
/// the fact.
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: RefCell<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        self.diagnostics.borrow_mut().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.diagnostics.borrow().clone()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) -> Result<(), CfbError> {
        self.diagnostics.borrow_mut().push(diagnostic);
        Ok(())
    }
}

/// Wraps another sink, turning selected `DiagnosticKind`s into a fatal
/// `CfbError::Escalated` instead of letting them pass through. Lets a caller adopt
/// a stricter-than-default policy without forking the core.
pub struct EscalatingSink<S> {
    inner: S,
    escalate: HashSet<DiagnosticKind>,
}

impl<S: DiagnosticSink> EscalatingSink<S> {
    pub fn new(inner: S, escalate: impl IntoIterator<Item = DiagnosticKind>) -> Self {
        EscalatingSink {
            inner,
            escalate: escalate.into_iter().collect(),
        }
    }
}

impl<S: DiagnosticSink> DiagnosticSink for EscalatingSink<S> {
    fn report(&self, diagnostic: Diagnostic) -> Result<(), CfbError> {
        if self.escalate.contains(&diagnostic.kind) {
            return Err(CfbError::Escalated(diagnostic.kind));
        }
        self.inner.report(diagnostic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_accumulates() {
        let sink = CollectingSink::new();
        sink.report(Diagnostic::new(DiagnosticKind::TruncatedWarning, "eof"))
            .unwrap();
        sink.report(Diagnostic::new(DiagnosticKind::HeaderWarning, "cutoff"))
            .unwrap();
        let all = sink.take();
        assert_eq!(all.len(), 2);
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn escalating_sink_turns_selected_kinds_fatal() {
        let sink = EscalatingSink::new(
            LogSink,
            [DiagnosticKind::TruncatedWarning],
        );
        let ok = sink.report(Diagnostic::new(DiagnosticKind::HeaderWarning, "x"));
        assert!(ok.is_ok());
        let err = sink.report(Diagnostic::new(DiagnosticKind::TruncatedWarning, "x"));
        assert!(matches!(err, Err(CfbError::Escalated(DiagnosticKind::TruncatedWarning))));
    }
}
