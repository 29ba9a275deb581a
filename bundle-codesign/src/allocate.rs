// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Invocation of the external `codesign_allocate` tool.
//!
//! The tool rewrites Mach-O load commands so every slice carries an
//! `LC_CODE_SIGNATURE` pointing at a zero filled region of the requested
//! size at the end of the slice. We don't rewrite load commands ourselves.

use {
    crate::error::CodeSignError,
    log::{debug, warn},
    std::{
        path::{Path, PathBuf},
        time::{Duration, Instant},
    },
};

/// Environment variable naming the allocator executable.
pub const CODESIGN_ALLOCATE_ENV: &str = "CODESIGN_ALLOCATE";

/// How long an allocator run may take before it is killed.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Locate the allocator.
///
/// An explicit path wins, then `CODESIGN_ALLOCATE`, then `codesign_allocate`
/// on `PATH`.
pub fn find_codesign_allocate(explicit: Option<&Path>) -> Result<PathBuf, CodeSignError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(CODESIGN_ALLOCATE_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    which::which("codesign_allocate").map_err(|e| {
        CodeSignError::Toolchain(format!("unable to locate codesign_allocate: {}", e))
    })
}

/// How to find and run the allocator.
///
/// Resolution is deferred until space actually needs reserving, so signing
/// binaries that already carry a large enough region works without one.
#[derive(Clone, Debug)]
pub struct AllocatorSettings {
    pub exe: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            exe: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl AllocatorSettings {
    pub fn resolve(&self) -> Result<CodesignAllocate, CodeSignError> {
        let exe = find_codesign_allocate(self.exe.as_deref())?;

        Ok(CodesignAllocate::new(exe, self.timeout))
    }
}

/// A configured `codesign_allocate` invocation.
#[derive(Clone, Debug)]
pub struct CodesignAllocate {
    exe: PathBuf,
    timeout: Duration,
}

impl CodesignAllocate {
    pub fn new(exe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            exe: exe.into(),
            timeout,
        }
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// Build the argument list for an invocation.
    pub fn arguments(input: &Path, output: &Path, sizes: &[(&str, usize)]) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];

        for (arch, size) in sizes {
            args.push("-a".to_string());
            args.push(arch.to_string());
            args.push(size.to_string());
        }

        args
    }

    /// Reserve signature space in `path`.
    ///
    /// The tool writes to a temporary file next to `path` which replaces it
    /// only on success, keeping the original permissions. A missing tool,
    /// non-zero exit or timeout is a [CodeSignError::Toolchain].
    pub fn allocate(&self, path: &Path, sizes: &[(&str, usize)]) -> Result<(), CodeSignError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let output = tempfile::Builder::new()
            .prefix(".codesign_allocate")
            .tempfile_in(parent)?
            .into_temp_path();

        let args = Self::arguments(path, &output, sizes);
        debug!("running {} {}", self.exe.display(), args.join(" "));

        let handle = duct::cmd(&self.exe, &args)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .start()
            .map_err(|e| {
                CodeSignError::Toolchain(format!("error running {}: {}", self.exe.display(), e))
            })?;

        let started = Instant::now();

        let result = loop {
            if let Some(result) = handle.try_wait()? {
                break result;
            }

            if started.elapsed() >= self.timeout {
                if let Err(e) = handle.kill() {
                    warn!("unable to kill {}: {}", self.exe.display(), e);
                }

                return Err(CodeSignError::Toolchain(format!(
                    "{} timed out after {:?}",
                    self.exe.display(),
                    self.timeout
                )));
            }

            std::thread::sleep(POLL_INTERVAL);
        };

        let output_text = String::from_utf8_lossy(&result.stdout);
        for line in output_text.lines() {
            debug!("codesign_allocate: {}", line);
        }

        if !result.status.success() {
            return Err(CodeSignError::Toolchain(format!(
                "{} exited with {}: {}",
                self.exe.display(),
                result.status,
                output_text.trim()
            )));
        }

        let permissions = std::fs::metadata(path)?.permissions();
        std::fs::set_permissions(&output, permissions)?;
        output
            .persist(path)
            .map_err(|e| CodeSignError::Io(e.error))?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn argument_order() {
        let args = CodesignAllocate::arguments(
            Path::new("/tmp/in"),
            Path::new("/tmp/out"),
            &[("armv7", 1024), ("arm64", 2048)],
        );

        assert_eq!(
            args,
            vec!["-i", "/tmp/in", "-o", "/tmp/out", "-a", "armv7", "1024", "-a", "arm64", "2048"]
        );
    }

    #[test]
    fn explicit_path_wins() {
        assert_eq!(
            find_codesign_allocate(Some(Path::new("/opt/bin/codesign_allocate"))).unwrap(),
            PathBuf::from("/opt/bin/codesign_allocate")
        );
    }

    #[test]
    fn settings_resolve_explicit() {
        let settings = AllocatorSettings {
            exe: Some(PathBuf::from("/opt/bin/codesign_allocate")),
            timeout: Duration::from_secs(5),
        };

        let allocate = settings.resolve().unwrap();
        assert_eq!(allocate.exe(), Path::new("/opt/bin/codesign_allocate"));
    }

    #[cfg(unix)]
    pub(crate) fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("allocate.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        path
    }

    #[cfg(unix)]
    #[test]
    fn failure_is_toolchain_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("exe");
        std::fs::write(&target, b"original").unwrap();

        let script = write_script(dir.path(), "echo nope; exit 3");
        let res = CodesignAllocate::new(script, DEFAULT_TIMEOUT).allocate(&target, &[("arm64", 16)]);

        assert!(matches!(res, Err(CodeSignError::Toolchain(ref m)) if m.contains("nope")));
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("exe");
        std::fs::write(&target, b"original").unwrap();

        let script = write_script(dir.path(), "exec sleep 30");
        let res = CodesignAllocate::new(script, Duration::from_millis(200))
            .allocate(&target, &[("arm64", 16)]);

        assert!(matches!(res, Err(CodeSignError::Toolchain(ref m)) if m.contains("timed out")));
    }

    #[cfg(unix)]
    #[test]
    fn success_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("exe");
        std::fs::write(&target, b"original").unwrap();

        let script = write_script(
            dir.path(),
            r#"while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2;;
    *) shift;;
  esac
done
printf rewritten > "$out""#,
        );

        CodesignAllocate::new(script, DEFAULT_TIMEOUT)
            .allocate(&target, &[("arm64", 16)])
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"rewritten");
    }
}
