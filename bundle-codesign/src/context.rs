// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Contexts threaded through signing and verification.

A context is an immutable value. Descending into a nested component
produces a new context through [Context::push] (deeper diagnostic indent)
and [SignContext::for_app] (component identifier), leaving the parent as it
was. The identity, skip policy, abort flag and recorded warnings are shared
by every context derived from one root.
*/

use {
    crate::{allocate::AllocatorSettings, error::CodeSignError, identity::SigningIdentity},
    log::info,
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

const INDENT: &str = "|   ";

/// Receives diagnostic lines, already indented.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, line: &str);
}

/// Forwards diagnostics to the `log` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&self, line: &str) {
        info!("{}", line);
    }
}

/// Collects diagnostics in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.to_string());
    }
}

/// What to do with errors classified as skippable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipPolicy {
    /// Treat them like any other error.
    Escalate,
    /// Record a warning and carry on with the next component.
    Record,
}

impl Default for SkipPolicy {
    fn default() -> Self {
        Self::Escalate
    }
}

/// Cooperative cancellation flag, checked before each component.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A skippable failure that was recorded instead of raised.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SkippedComponent {
    /// Identifier of the component being processed, when known.
    pub identifier: Option<String>,
    pub message: String,
}

/// Result of a successful sign or verify run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignOutcome {
    pub warnings: Vec<SkippedComponent>,
}

/// State shared by signing and verification contexts.
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    indent: String,
    identifier: Option<String>,
    skip_policy: SkipPolicy,
    abort: AbortHandle,
    warnings: Arc<Mutex<Vec<SkippedComponent>>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            sink: Arc::new(LogSink),
            indent: String::new(),
            identifier: None,
            skip_policy: SkipPolicy::default(),
            abort: AbortHandle::default(),
            warnings: Arc::new(Mutex::new(vec![])),
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("indent", &self.indent)
            .field("identifier", &self.identifier)
            .field("skip_policy", &self.skip_policy)
            .field("aborted", &self.abort.is_aborted())
            .finish()
    }
}

impl Diagnostics {
    fn print(&self, text: &str, indent: &str) {
        for line in text.split('\n') {
            self.sink.emit(&format!("{}{}", indent, line));
        }
    }

    fn pushed(&self) -> Self {
        Self {
            indent: format!("{}{}", INDENT, self.indent),
            ..self.clone()
        }
    }
}

/// Behavior common to signing and verification contexts.
pub trait Context: Sized {
    fn diagnostics(&self) -> &Diagnostics;

    /// A context for a nested step, one indent level deeper.
    fn push(&self) -> Self;

    fn indent(&self) -> &str {
        &self.diagnostics().indent
    }

    /// Identifier of the component this context is scoped to.
    fn identifier(&self) -> Option<&str> {
        self.diagnostics().identifier.as_deref()
    }

    fn skip_policy(&self) -> SkipPolicy {
        self.diagnostics().skip_policy
    }

    fn abort_handle(&self) -> &AbortHandle {
        &self.diagnostics().abort
    }

    fn debug(&self, message: &str) {
        let diag = self.diagnostics();
        diag.print(message, &diag.indent);
    }

    fn info(&self, message: &str) {
        self.debug(message)
    }

    fn error(&self, message: &str) {
        self.debug(message)
    }

    /// Fail with [CodeSignError::Aborted] once abort was requested.
    fn check_abort(&self) -> Result<(), CodeSignError> {
        if self.abort_handle().is_aborted() {
            Err(CodeSignError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Route an error through the skip policy.
    ///
    /// Skippable errors are recorded as warnings when the policy allows.
    /// Everything else comes back as `Err`.
    fn on_error(&self, err: CodeSignError) -> Result<(), CodeSignError> {
        let diag = self.diagnostics();

        if err.is_skippable() && diag.skip_policy == SkipPolicy::Record {
            diag.print(&format!("FAILURE: {}", err), "");
            diag.print("", "");

            diag.warnings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(SkippedComponent {
                    identifier: diag.identifier.clone(),
                    message: err.to_string(),
                });

            Ok(())
        } else {
            Err(err)
        }
    }

    /// Warnings recorded so far by this context tree.
    fn outcome(&self) -> SignOutcome {
        SignOutcome {
            warnings: self
                .diagnostics()
                .warnings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

/// Context for signing.
#[derive(Clone, Debug)]
pub struct SignContext {
    diag: Diagnostics,
    identity: Arc<SigningIdentity>,
    allocator: AllocatorSettings,
    entitlements: Option<Arc<String>>,
}

impl SignContext {
    pub fn new(
        identity: Arc<SigningIdentity>,
        entitlements: Option<String>,
        allocator: AllocatorSettings,
    ) -> Self {
        Self {
            diag: Diagnostics::default(),
            identity,
            allocator,
            entitlements: entitlements.map(Arc::new),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diag.sink = sink;
        self
    }

    #[must_use]
    pub fn with_skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.diag.skip_policy = policy;
        self
    }

    #[must_use]
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.diag.abort = abort;
        self
    }

    /// A context scoped to the component `identifier`, at the same indent.
    #[must_use]
    pub fn for_app(&self, identifier: &str) -> Self {
        let mut res = self.clone();
        res.diag.identifier = Some(identifier.to_string());
        res
    }

    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    pub fn allocator(&self) -> &AllocatorSettings {
        &self.allocator
    }

    pub fn entitlements(&self) -> Option<&str> {
        self.entitlements.as_deref().map(|s| s.as_str())
    }
}

impl Context for SignContext {
    fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    fn push(&self) -> Self {
        Self {
            diag: self.diag.pushed(),
            ..self.clone()
        }
    }
}

/// Context for verification.
#[derive(Clone, Debug, Default)]
pub struct VerifyContext {
    diag: Diagnostics,
}

impl VerifyContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diag.sink = sink;
        self
    }

    #[must_use]
    pub fn with_skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.diag.skip_policy = policy;
        self
    }

    #[must_use]
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.diag.abort = abort;
        self
    }

    #[must_use]
    pub fn for_app(&self, identifier: &str) -> Self {
        let mut res = self.clone();
        res.diag.identifier = Some(identifier.to_string());
        res
    }
}

impl Context for VerifyContext {
    fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    fn push(&self) -> Self {
        Self {
            diag: self.diag.pushed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::CodeSignSkippableError, identity::tests::test_identity},
        std::path::PathBuf,
    };

    fn context(sink: Arc<MemorySink>) -> SignContext {
        SignContext::new(
            Arc::new(test_identity()),
            Some("<plist/>".into()),
            AllocatorSettings::default(),
        )
        .with_sink(sink)
    }

    #[test]
    fn push_indents_without_mutating_parent() {
        let sink = Arc::new(MemorySink::default());
        let root = context(sink.clone());
        let child = root.push();
        let grandchild = child.push().for_app("com.example.foo");

        root.debug("root");
        child.debug("child\nsecond line");
        grandchild.info("grandchild");

        assert_eq!(root.indent(), "");
        assert_eq!(root.identifier(), None);
        assert_eq!(grandchild.identifier(), Some("com.example.foo"));
        assert_eq!(grandchild.indent(), child.push().indent());
        assert_eq!(
            sink.lines(),
            vec![
                "root",
                "|   child",
                "|   second line",
                "|   |   grandchild"
            ]
        );
    }

    #[test]
    fn skippable_recorded_under_policy() {
        let sink = Arc::new(MemorySink::default());
        let ctx = context(sink.clone())
            .with_skip_policy(SkipPolicy::Record)
            .push()
            .for_app("com.example.foo");

        let err = CodeSignSkippableError::MissingExecutable(PathBuf::from("Foo")).into();
        ctx.on_error(err).unwrap();

        assert_eq!(
            sink.lines(),
            vec![
                "FAILURE: bundle does not contain its main executable: Foo",
                ""
            ]
        );

        let outcome = ctx.outcome();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(
            outcome.warnings[0].identifier.as_deref(),
            Some("com.example.foo")
        );

        assert!(ctx
            .on_error(CodeSignError::Toolchain("missing".into()))
            .is_err());
    }

    #[test]
    fn skippable_escalated_by_default() {
        let ctx = context(Arc::new(MemorySink::default()));
        let err = CodeSignSkippableError::SpecialSlotMismatch("Info".into()).into();

        assert!(ctx.on_error(err).is_err());
        assert!(ctx.outcome().warnings.is_empty());
    }

    #[test]
    fn abort_shared_with_children() {
        let abort = AbortHandle::default();
        let ctx = context(Arc::new(MemorySink::default())).with_abort_handle(abort.clone());
        let child = ctx.push();

        assert!(child.check_abort().is_ok());
        abort.abort();
        assert!(matches!(child.check_abort(), Err(CodeSignError::Aborted)));
    }

    #[test]
    fn entitlements_inherited_by_nested() {
        let ctx = context(Arc::new(MemorySink::default()));
        let child = ctx.push().for_app("com.example.child");

        assert_eq!(child.entitlements(), Some("<plist/>"));
        assert_eq!(child.push().entitlements(), Some("<plist/>"));
    }
}
