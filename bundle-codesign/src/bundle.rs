// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signable components and their nesting.

A component is either a shallow bundle directory (`.app`, `.framework`,
`.appex`) holding an `Info.plist` and a main executable, or a lone Mach-O
file (a `.dylib` or a plain executable). Bundles embed other components in
well known directories and those are signed first, so the parent's resource
envelope can seal them by their code directory hash.
*/

use {
    crate::{
        code_resources::{
            CodeResourcesBuilder, CODE_RESOURCES_LINK, CODE_SIGNATURE_DIR,
        },
        context::{Context, SignContext, SignOutcome},
        error::{CodeSignError, CodeSignSkippableError},
        macho::is_macho_file,
        macho_signing::{sign_macho_file, SignatureSettings, SignedMachOInfo},
        provisioning::{ProvisioningProfile, EMBEDDED_PROFILE},
    },
    log::warn,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Directories of a bundle that may hold nested components.
const NESTED_DIRS: &[&str] = &["Frameworks", "PlugIns"];

/// Additional directories of an app that may hold nested components.
const APP_NESTED_DIRS: &[&str] = &["Watch", "AppClips"];

/// The kind of a signable component.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BundleKind {
    App,
    Framework,
    AppExtension,
    Dylib,
    PlainExecutable,
}

impl BundleKind {
    /// Whether components of this kind are directories with an `Info.plist`.
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::App | Self::Framework | Self::AppExtension)
    }

    /// Whether components of this kind may claim entitlements from an
    /// embedded provisioning profile.
    pub fn uses_provisioning_profile(&self) -> bool {
        matches!(self, Self::App | Self::AppExtension)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// A resolved signable component.
#[derive(Clone, Debug)]
pub struct Bundle {
    path: PathBuf,
    kind: BundleKind,
    info_plist: Option<plist::Dictionary>,
    info_plist_data: Option<Vec<u8>>,
}

impl Bundle {
    /// Classify a filesystem path as a signable component.
    pub fn resolve(path: &Path) -> Result<Self, CodeSignError> {
        let extension = extension_of(path);

        if path.is_dir() {
            let kind = match extension.as_deref() {
                Some("app") => BundleKind::App,
                Some("framework") => BundleKind::Framework,
                Some("appex") => BundleKind::AppExtension,
                _ => {
                    return Err(CodeSignError::InvalidBundle(format!(
                        "{} is not an .app, .framework or .appex directory",
                        path.display()
                    )));
                }
            };

            let info_plist_path = path.join("Info.plist");
            if !info_plist_path.is_file() {
                return Err(CodeSignError::InvalidBundle(format!(
                    "no Info.plist found in {}; probably not a bundle",
                    path.display()
                )));
            }

            let data = std::fs::read(&info_plist_path)?;
            let info_plist = plist::Value::from_reader(std::io::Cursor::new(&data))?
                .into_dictionary()
                .ok_or_else(|| {
                    CodeSignError::InvalidBundle(format!(
                        "{} is not a dictionary",
                        info_plist_path.display()
                    ))
                })?;

            Ok(Self {
                path: path.to_path_buf(),
                kind,
                info_plist: Some(info_plist),
                info_plist_data: Some(data),
            })
        } else if path.is_file() {
            if !is_macho_file(path)? {
                return Err(CodeSignError::InvalidBundle(format!(
                    "{} is not a Mach-O binary",
                    path.display()
                )));
            }

            let kind = if extension.as_deref() == Some("dylib") {
                BundleKind::Dylib
            } else {
                BundleKind::PlainExecutable
            };

            Ok(Self {
                path: path.to_path_buf(),
                kind,
                info_plist: None,
                info_plist_data: None,
            })
        } else {
            Err(CodeSignError::InvalidBundle(format!(
                "{} does not exist",
                path.display()
            )))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> BundleKind {
        self.kind
    }

    /// The parsed `Info.plist`, for bundle directories.
    pub fn info_plist(&self) -> Option<&plist::Dictionary> {
        self.info_plist.as_ref()
    }

    /// Raw `Info.plist` bytes as read from disk.
    pub fn info_plist_data(&self) -> Option<&[u8]> {
        self.info_plist_data.as_deref()
    }

    /// Obtain an `Info.plist` key as a string.
    pub fn info_plist_key_string(&self, key: &str) -> Result<Option<&str>, CodeSignError> {
        match self.info_plist.as_ref().and_then(|plist| plist.get(key)) {
            Some(value) => Ok(Some(value.as_string().ok_or_else(|| {
                CodeSignError::InvalidBundle(format!(
                    "Info.plist key {} in {} is not a string",
                    key,
                    self.path.display()
                ))
            })?)),
            None => Ok(None),
        }
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Identifier recorded in this component's code directories.
    ///
    /// Bundles must define `CFBundleIdentifier`. A dylib is identified by
    /// its file name without `.dylib` and a plain executable by its file name.
    pub fn identifier(&self) -> Result<String, CodeSignError> {
        match self.kind {
            BundleKind::Dylib => Ok(self.file_stem()),
            BundleKind::PlainExecutable => Ok(self.file_name()),
            _ => self
                .info_plist_key_string("CFBundleIdentifier")?
                .map(|s| s.to_string())
                .ok_or_else(|| CodeSignError::BundleNoIdentifier(self.path.clone())),
        }
    }

    /// Name of the main executable.
    ///
    /// `CFBundleExecutable` when defined, else the bundle name without its
    /// extension.
    pub fn executable_name(&self) -> Result<String, CodeSignError> {
        if !self.kind.is_directory() {
            return Ok(self.file_name());
        }

        Ok(match self.info_plist_key_string("CFBundleExecutable")? {
            Some(name) => name.to_string(),
            None => self.file_stem(),
        })
    }

    /// Path of the main executable.
    pub fn executable_path(&self) -> Result<PathBuf, CodeSignError> {
        if self.kind.is_directory() {
            Ok(self.path.join(self.executable_name()?))
        } else {
            Ok(self.path.clone())
        }
    }

    /// Nested components, ordered by path.
    ///
    /// Only this bundle's own nesting directories are scanned. A child
    /// discovers its own children.
    pub fn children(&self) -> Result<Vec<Bundle>, CodeSignError> {
        if !self.kind.is_directory() {
            return Ok(vec![]);
        }

        let mut dirs = NESTED_DIRS.to_vec();
        if self.kind == BundleKind::App {
            dirs.extend_from_slice(APP_NESTED_DIRS);
        }

        let mut paths = vec![];

        for dir in dirs {
            let dir = self.path.join(dir);
            if !dir.is_dir() {
                continue;
            }

            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();

                let nested = match extension_of(&path).as_deref() {
                    Some("framework") | Some("appex") | Some("app") => path.is_dir(),
                    Some("dylib") => path.is_file(),
                    _ => false,
                };

                if nested {
                    paths.push(path);
                }
            }
        }

        paths.sort();

        paths.iter().map(|path| Self::resolve(path)).collect()
    }

    /// Path of `child` relative to this bundle, with `/` separators.
    pub fn relative_path(&self, child: &Path) -> Result<String, CodeSignError> {
        Ok(child
            .strip_prefix(&self.path)
            .map_err(|_| {
                CodeSignError::InvalidBundle(format!(
                    "{} is not inside {}",
                    child.display(),
                    self.path.display()
                ))
            })?
            .to_string_lossy()
            .replace('\\', "/"))
    }

    /// Delete `_CodeSignature/` and the legacy `CodeResources` link.
    pub fn remove_signature(&self) -> Result<(), CodeSignError> {
        let link = self.path.join(CODE_RESOURCES_LINK);
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)?;
        }

        let dir = self.path.join(CODE_SIGNATURE_DIR);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        Ok(())
    }

    /// Entitlements to embed in this component's signature.
    ///
    /// Explicit entitlements win and are shared by every nested component.
    /// Otherwise apps and app extensions take the ones granted by their
    /// embedded provisioning profile.
    fn entitlements(&self, ctx: &SignContext) -> Result<Option<String>, CodeSignError> {
        if let Some(entitlements) = ctx.entitlements() {
            return Ok(Some(entitlements.to_string()));
        }

        if !self.kind.uses_provisioning_profile() {
            return Ok(None);
        }

        let profile_path = self.path.join(EMBEDDED_PROFILE);
        if !profile_path.is_file() {
            return Ok(None);
        }

        let res = ProvisioningProfile::from_file(&profile_path).and_then(|profile| {
            if profile.is_expired_at(chrono::Utc::now()) {
                warn!(
                    "provisioning profile {} expired at {:?}",
                    profile_path.display(),
                    profile.expiration_date()
                );
                ctx.info(&format!(
                    "Provisioning profile {} has expired",
                    profile.name().unwrap_or("(unnamed)")
                ));
            }

            profile.entitlements_xml()
        });

        match res {
            Ok(entitlements) => {
                ctx.debug("Using entitlements from embedded.mobileprovision");
                Ok(entitlements)
            }
            Err(e) => {
                ctx.on_error(
                    CodeSignSkippableError::ProvisioningProfile(profile_path, e.to_string())
                        .into(),
                )?;
                Ok(None)
            }
        }
    }

    /// Sign this component and everything nested in it.
    ///
    /// Fatal errors name the chain of component identifiers that led to
    /// the failure.
    pub fn sign(&self, ctx: &SignContext) -> Result<SignOutcome, CodeSignError> {
        let identifier = self.identifier()?;
        let app_ctx = ctx.for_app(&identifier);

        match self.sign_component(&app_ctx) {
            Ok(()) => {}
            Err(e) => app_ctx.on_error(e.in_component(&identifier))?,
        }

        Ok(app_ctx.outcome())
    }

    /// Sign under a context already scoped to this component.
    fn sign_component(&self, ctx: &SignContext) -> Result<(), CodeSignError> {
        let identifier = self.identifier()?;
        ctx.info(&format!("Signing {} ({})", self.path.display(), identifier));

        let executable = self.executable_path()?;
        ctx.debug(&format!("Main executable: {}", executable.display()));
        if !executable.is_file() {
            return Err(CodeSignSkippableError::MissingExecutable(executable).into());
        }

        let mut nested = BTreeMap::new();

        for child in self.children()? {
            ctx.check_abort()?;

            let child_id = child
                .identifier()
                .map_err(|e| e.in_component(&identifier))?;
            let child_ctx = ctx.push().for_app(&child_id);

            match child.sign_component(&child_ctx) {
                Ok(()) => {
                    let info = SignedMachOInfo::parse_file(&child.executable_path()?)?;
                    nested.insert(self.relative_path(&child.path)?, info);
                }
                Err(e) => child_ctx.on_error(e.in_component(&child_id))?,
            }
        }

        ctx.check_abort()?;

        let entitlements = self.entitlements(ctx)?;

        let code_resources = if self.kind.is_directory() {
            self.remove_signature()?;

            ctx.debug("Sealing resources");
            let relative_executable = self.relative_path(&executable)?;
            let resources = CodeResourcesBuilder::for_bundle(&self.path, Some(&relative_executable))?
                .build(&self.path, &nested)?;

            Some(resources.write_to_bundle(&self.path)?)
        } else {
            None
        };

        let settings = SignatureSettings {
            identifier: &identifier,
            identity: ctx.identity(),
            entitlements: entitlements.as_deref(),
            info_plist: self.info_plist_data(),
            code_resources: code_resources.as_deref(),
        };

        sign_macho_file(&executable, &settings, ctx.allocator())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::macho::tests::synthetic_macho, goblin::mach::cputype::CPU_TYPE_ARM64};

    fn info_plist(identifier: &str, executable: Option<&str>) -> String {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "CFBundleIdentifier".to_string(),
            plist::Value::String(identifier.to_string()),
        );
        if let Some(exe) = executable {
            dict.insert(
                "CFBundleExecutable".to_string(),
                plist::Value::String(exe.to_string()),
            );
        }

        let mut xml = vec![];
        plist::Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();
        String::from_utf8(xml).unwrap()
    }

    fn make_bundle(path: &Path, identifier: &str, executable: Option<&str>) {
        std::fs::create_dir_all(path).unwrap();
        std::fs::write(path.join("Info.plist"), info_plist(identifier, executable)).unwrap();
    }

    #[test]
    fn classify() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        make_bundle(&root.join("MyApp.app"), "com.example.app", Some("MyApp"));
        make_bundle(&root.join("Foo.framework"), "com.example.foo", None);
        make_bundle(&root.join("Share.appex"), "com.example.share", None);
        std::fs::write(root.join("libbar.dylib"), synthetic_macho(CPU_TYPE_ARM64, 10, 0)).unwrap();
        std::fs::write(root.join("tool"), synthetic_macho(CPU_TYPE_ARM64, 10, 0)).unwrap();
        std::fs::write(root.join("script.sh"), b"#!/bin/sh\n").unwrap();
        std::fs::create_dir_all(root.join("Empty.app")).unwrap();
        std::fs::create_dir_all(root.join("Other")).unwrap();

        let app = Bundle::resolve(&root.join("MyApp.app")).unwrap();
        assert_eq!(app.kind(), BundleKind::App);
        assert_eq!(app.identifier().unwrap(), "com.example.app");
        assert_eq!(app.executable_path().unwrap(), root.join("MyApp.app/MyApp"));

        let framework = Bundle::resolve(&root.join("Foo.framework")).unwrap();
        assert_eq!(framework.kind(), BundleKind::Framework);
        assert_eq!(framework.executable_name().unwrap(), "Foo");

        assert_eq!(
            Bundle::resolve(&root.join("Share.appex")).unwrap().kind(),
            BundleKind::AppExtension
        );

        let dylib = Bundle::resolve(&root.join("libbar.dylib")).unwrap();
        assert_eq!(dylib.kind(), BundleKind::Dylib);
        assert_eq!(dylib.identifier().unwrap(), "libbar");
        assert_eq!(dylib.executable_path().unwrap(), root.join("libbar.dylib"));

        let tool = Bundle::resolve(&root.join("tool")).unwrap();
        assert_eq!(tool.kind(), BundleKind::PlainExecutable);
        assert_eq!(tool.identifier().unwrap(), "tool");

        for invalid in ["script.sh", "Empty.app", "Other", "missing"] {
            assert!(
                matches!(
                    Bundle::resolve(&root.join(invalid)),
                    Err(CodeSignError::InvalidBundle(_))
                ),
                "{}",
                invalid
            );
        }
    }

    #[test]
    fn missing_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NoId.framework");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join("Info.plist"),
            info_plist("x", None).replace("CFBundleIdentifier", "CFBundleName"),
        )
        .unwrap();

        let bundle = Bundle::resolve(&path).unwrap();
        assert!(matches!(
            bundle.identifier(),
            Err(CodeSignError::BundleNoIdentifier(_))
        ));
    }

    #[test]
    fn children_sorted_and_shallow() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("MyApp.app");

        make_bundle(&app, "com.example.app", None);
        make_bundle(&app.join("PlugIns/Share.appex"), "com.example.share", None);
        make_bundle(&app.join("Frameworks/Foo.framework"), "com.example.foo", None);
        make_bundle(&app.join("Frameworks/Bar.framework"), "com.example.bar", None);
        make_bundle(
            &app.join("Frameworks/Foo.framework/Frameworks/Inner.framework"),
            "com.example.inner",
            None,
        );
        std::fs::write(
            app.join("Frameworks/libz.dylib"),
            synthetic_macho(CPU_TYPE_ARM64, 10, 0),
        )
        .unwrap();
        std::fs::write(app.join("Frameworks/README"), b"text").unwrap();

        let bundle = Bundle::resolve(&app).unwrap();
        let children = bundle
            .children()
            .unwrap()
            .into_iter()
            .map(|c| bundle.relative_path(c.path()).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(
            children,
            vec![
                "Frameworks/Bar.framework",
                "Frameworks/Foo.framework",
                "Frameworks/libz.dylib",
                "PlugIns/Share.appex"
            ]
        );

        let foo = Bundle::resolve(&app.join("Frameworks/Foo.framework")).unwrap();
        assert_eq!(foo.children().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn remove_old_signature() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("MyApp.app");
        make_bundle(&app, "com.example.app", None);

        std::fs::create_dir_all(app.join("_CodeSignature")).unwrap();
        std::fs::write(app.join("_CodeSignature/CodeResources"), b"old").unwrap();
        std::os::unix::fs::symlink("_CodeSignature/CodeResources", app.join("CodeResources"))
            .unwrap();

        Bundle::resolve(&app).unwrap().remove_signature().unwrap();

        assert!(!app.join("_CodeSignature").exists());
        assert!(app.join("CodeResources").symlink_metadata().is_err());
        assert!(app.join("Info.plist").exists());
    }
}
