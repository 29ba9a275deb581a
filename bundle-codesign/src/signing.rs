// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High level signing entry point.

use {
    crate::{
        allocate::AllocatorSettings,
        bundle::Bundle,
        context::{
            AbortHandle, DiagnosticSink, LogSink, SignContext, SignOutcome, SkipPolicy,
        },
        error::CodeSignError,
        identity::SigningIdentity,
    },
    log::warn,
    std::{path::Path, sync::Arc, time::Duration},
};

/// Knobs controlling a signing run.
#[derive(Clone)]
pub struct SignOptions {
    pub skip_policy: SkipPolicy,
    pub allocator: AllocatorSettings,
    pub abort: AbortHandle,
    pub sink: Arc<dyn DiagnosticSink>,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            skip_policy: SkipPolicy::default(),
            allocator: AllocatorSettings::default(),
            abort: AbortHandle::default(),
            sink: Arc::new(LogSink),
        }
    }
}

impl std::fmt::Debug for SignOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignOptions")
            .field("skip_policy", &self.skip_policy)
            .field("allocator", &self.allocator)
            .field("abort", &self.abort)
            .finish_non_exhaustive()
    }
}

impl SignOptions {
    #[must_use]
    pub fn skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.skip_policy = policy;
        self
    }

    /// Use this `codesign_allocate` instead of searching for one.
    #[must_use]
    pub fn codesign_allocate(mut self, exe: impl AsRef<Path>) -> Self {
        self.allocator.exe = Some(exe.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn allocate_timeout(mut self, timeout: Duration) -> Self {
        self.allocator.timeout = timeout;
        self
    }

    #[must_use]
    pub fn abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// Sign a bundle, dylib or executable and everything nested in it.
///
/// `entitlements` is an XML plist applied to the root component only.
/// Skippable failures are returned as warnings when `options` says to
/// record them.
pub fn sign(
    target: &Path,
    identity: Arc<SigningIdentity>,
    entitlements: Option<String>,
    options: SignOptions,
) -> Result<SignOutcome, CodeSignError> {
    let bundle = Bundle::resolve(target)?;

    let ctx = SignContext::new(identity, entitlements, options.allocator)
        .with_sink(options.sink)
        .with_skip_policy(options.skip_policy)
        .with_abort_handle(options.abort);

    let outcome = bundle.sign(&ctx)?;

    for warning in &outcome.warnings {
        warn!(
            "skipped {}: {}",
            warning.identifier.as_deref().unwrap_or("(unknown)"),
            warning.message
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            context::MemorySink, identity::tests::test_identity, macho::tests::synthetic_macho,
            macho_signing::SignedMachOInfo,
        },
        goblin::mach::cputype::CPU_TYPE_ARM64,
    };

    #[test]
    fn sign_plain_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, synthetic_macho(CPU_TYPE_ARM64, 5000, 16384)).unwrap();

        let sink = Arc::new(MemorySink::default());
        let outcome = sign(
            &path,
            Arc::new(test_identity()),
            None,
            SignOptions::default().sink(sink.clone()),
        )
        .unwrap();

        assert!(outcome.warnings.is_empty());
        assert_eq!(sink.lines()[0], format!("Signing {} (tool)", path.display()));

        let info = SignedMachOInfo::parse_file(&path).unwrap();
        assert_eq!(info.code_directory().unwrap().ident, "tool");
    }

    #[test]
    fn aborted_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("MyApp.app");
        std::fs::create_dir_all(app.join("Frameworks/Foo.framework")).unwrap();
        std::fs::write(
            app.join("Info.plist"),
            br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>CFBundleIdentifier</key><string>com.example.app</string></dict></plist>"#,
        )
        .unwrap();
        std::fs::write(
            app.join("Frameworks/Foo.framework/Info.plist"),
            br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>CFBundleIdentifier</key><string>com.example.foo</string></dict></plist>"#,
        )
        .unwrap();
        std::fs::write(app.join("MyApp"), synthetic_macho(CPU_TYPE_ARM64, 100, 16384)).unwrap();

        let abort = AbortHandle::default();
        abort.abort();

        let res = sign(
            &app,
            Arc::new(test_identity()),
            None,
            SignOptions::default()
                .skip_policy(SkipPolicy::Record)
                .abort_handle(abort),
        );

        assert!(matches!(res, Err(CodeSignError::Aborted)));
        assert!(!app.join("_CodeSignature").exists());
    }
}
