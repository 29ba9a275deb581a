// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    bundle_codesign::{
        code_resources::code_resources_path, embedded_signature::CodeSigningSlot, sign, verify,
        CodeResources, CodeSignError, MemorySink, SignOptions, SignedMachOInfo, SigningIdentity, SkipPolicy, VerifyContext,
    },
    indoc::formatdoc,
    scroll::IOwrite,
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
};

const CERT_PEM: &[u8] = include_bytes!("../src/testdata/signing-cert.pem");
const KEY_PEM: &[u8] = include_bytes!("../src/testdata/signing-key.pem");

const CPU_TYPE_ARM64: u32 = 0x0100_000c;

fn identity() -> Arc<SigningIdentity> {
    Arc::new(SigningIdentity::from_pem(CERT_PEM, KEY_PEM).unwrap())
}

/// A thin arm64 Mach-O whose `LC_CODE_SIGNATURE` reserves `reserved` bytes.
fn macho(code_len: usize, reserved: u32) -> Vec<u8> {
    let mut data = Vec::new();
    let dataoff = (48 + code_len) as u32;

    for value in [0xfeedfacfu32, CPU_TYPE_ARM64, 0, 2, 1, 16, 0, 0] {
        data.iowrite_with(value, scroll::LE).unwrap();
    }
    for value in [0x1du32, 16, dataoff, reserved] {
        data.iowrite_with(value, scroll::LE).unwrap();
    }

    data.extend((0..code_len).map(|i| (i * 7 % 251) as u8));
    data.resize(dataoff as usize + reserved as usize, 0);

    data
}

fn write_bundle(path: &Path, identifier: &str, executable: &str, reserved: u32) {
    std::fs::create_dir_all(path).unwrap();

    std::fs::write(
        path.join("Info.plist"),
        formatdoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <dict>
                <key>CFBundleExecutable</key>
                <string>{exe}</string>
                <key>CFBundleIdentifier</key>
                <string>{id}</string>
            </dict>
            </plist>
        "#, exe = executable, id = identifier},
    )
    .unwrap();

    std::fs::write(path.join(executable), macho(6000, reserved)).unwrap();
}

/// `MyApp.app` embedding `Foo.framework`.
fn my_app(root: &Path) -> PathBuf {
    let app = root.join("MyApp.app");

    write_bundle(&app, "com.example.app", "MyApp", 16384);
    std::fs::write(app.join("Assets.car"), b"assets").unwrap();
    std::fs::write(app.join("PkgInfo"), b"APPL????").unwrap();
    std::fs::create_dir_all(app.join("en.lproj")).unwrap();
    std::fs::write(app.join("en.lproj/Main.strings"), b"\"hello\" = \"hello\";").unwrap();

    write_bundle(
        &app.join("Frameworks/Foo.framework"),
        "com.example.foo",
        "Foo",
        16384,
    );

    app
}

#[test]
fn sign_app_with_framework() {
    let dir = tempfile::tempdir().unwrap();
    let app = my_app(dir.path());
    let framework = app.join("Frameworks/Foo.framework");

    let sink = Arc::new(MemorySink::default());
    let outcome = sign(
        &app,
        identity(),
        None,
        SignOptions::default().sink(sink.clone()),
    )
    .unwrap();
    assert!(outcome.warnings.is_empty());

    let lines = sink.lines();
    assert_eq!(
        lines[0],
        format!("Signing {} (com.example.app)", app.display())
    );
    let framework_line = format!("|   Signing {} (com.example.foo)", framework.display());
    let framework_pos = lines.iter().position(|l| *l == framework_line);
    // The app's own seal step is logged at the root indent, after its
    // children are signed.
    let app_seal_pos = lines.iter().position(|l| l == "Sealing resources");
    assert!(
        matches!((framework_pos, app_seal_pos), (Some(f), Some(a)) if f < a),
        "{:#?}",
        lines
    );

    let app_info = SignedMachOInfo::parse_file(&app.join("MyApp")).unwrap();
    assert_eq!(app_info.code_directory().unwrap().ident, "com.example.app");

    let foo_info = SignedMachOInfo::parse_file(&framework.join("Foo")).unwrap();
    assert_eq!(foo_info.code_directory().unwrap().ident, "com.example.foo");
    assert!(code_resources_path(&framework).is_file());

    let sealed = CodeResources::from_bundle(&app).unwrap();

    let framework_entries = sealed
        .files2_paths()
        .filter(|path| path.starts_with("Frameworks/"))
        .collect::<Vec<_>>();
    assert_eq!(framework_entries, vec!["Frameworks/Foo.framework"]);
    assert_eq!(
        sealed.nested_cdhash("Frameworks/Foo.framework"),
        Some(foo_info.cdhash().unwrap().as_slice())
    );
    assert!(sealed.files_paths().all(|path| !path.starts_with("Frameworks/")));
    assert!(sealed.files2_paths().all(|path| path != "MyApp"));

    let outcome = verify(&app, &VerifyContext::new()).unwrap();
    assert!(outcome.warnings.is_empty());
}

#[test]
fn entitlements_apply_to_nested_code() {
    let dir = tempfile::tempdir().unwrap();
    let app = my_app(dir.path());

    let entitlements = formatdoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <plist version="1.0">
        <dict>
            <key>com.apple.security.app-sandbox</key>
            <true/>
        </dict>
        </plist>
    "#};

    sign(&app, identity(), Some(entitlements), SignOptions::default()).unwrap();

    for exe in ["MyApp", "Frameworks/Foo.framework/Foo"] {
        let info = SignedMachOInfo::parse_file(&app.join(exe)).unwrap();
        let cd = info.code_directory().unwrap();

        assert!(
            matches!(cd.special_hashes.get(&CodeSigningSlot::Entitlements), Some(d) if !d.is_null()),
            "{} lacks an entitlements digest",
            exe
        );
    }

    verify(&app, &VerifyContext::new()).unwrap();
}

#[test]
fn resign_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let app = my_app(dir.path());

    sign(&app, identity(), None, SignOptions::default()).unwrap();
    let first = std::fs::read(code_resources_path(&app)).unwrap();
    let first_cd = SignedMachOInfo::parse_file(&app.join("MyApp"))
        .unwrap()
        .code_directory_blob;

    sign(&app, identity(), None, SignOptions::default()).unwrap();
    let second = std::fs::read(code_resources_path(&app)).unwrap();
    let second_cd = SignedMachOInfo::parse_file(&app.join("MyApp"))
        .unwrap()
        .code_directory_blob;

    assert_eq!(first, second);
    assert_eq!(first_cd, second_cd);
}

#[test]
fn verify_detects_tampered_resource() {
    let dir = tempfile::tempdir().unwrap();
    let app = my_app(dir.path());

    sign(&app, identity(), None, SignOptions::default()).unwrap();
    std::fs::write(app.join("en.lproj/Main.strings"), b"changed").unwrap();

    let err = verify(&app, &VerifyContext::new()).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        CodeSignError::VerificationFailed(_)
    ));
}

#[test]
fn verify_detects_resigned_framework() {
    let dir = tempfile::tempdir().unwrap();
    let app = my_app(dir.path());

    sign(&app, identity(), None, SignOptions::default()).unwrap();

    // Signing the framework alone with different entitlements changes its
    // cdhash, which the app's seal no longer matches.
    sign(
        &app.join("Frameworks/Foo.framework"),
        identity(),
        Some("<plist version=\"1.0\"><dict/></plist>".to_string()),
        SignOptions::default(),
    )
    .unwrap();

    let err = verify(&app, &VerifyContext::new()).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        CodeSignError::VerificationFailed(_)
    ));
}

#[test]
fn skip_policy_records_one_warning() {
    let dir = tempfile::tempdir().unwrap();
    let app = my_app(dir.path());

    write_bundle(
        &app.join("Frameworks/Bar.framework"),
        "com.example.bar",
        "Bar",
        16384,
    );
    let broken = app.join("Frameworks/Broken.framework");
    write_bundle(&broken, "com.example.broken", "Broken", 16384);
    std::fs::remove_file(broken.join("Broken")).unwrap();

    let outcome = sign(
        &app,
        identity(),
        None,
        SignOptions::default().skip_policy(SkipPolicy::Record),
    )
    .unwrap();

    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(
        outcome.warnings[0].identifier.as_deref(),
        Some("com.example.broken")
    );
    assert!(outcome.warnings[0].message.contains("main executable"));

    for exe in [
        "MyApp",
        "Frameworks/Bar.framework/Bar",
        "Frameworks/Foo.framework/Foo",
    ] {
        SignedMachOInfo::parse_file(&app.join(exe)).unwrap();
    }

    let sealed = CodeResources::from_bundle(&app).unwrap();
    let framework_entries = sealed
        .files2_paths()
        .filter(|path| path.starts_with("Frameworks/"))
        .collect::<Vec<_>>();
    assert_eq!(
        framework_entries,
        vec!["Frameworks/Bar.framework", "Frameworks/Foo.framework"]
    );
}

#[test]
fn skippable_error_escalates_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let app = my_app(dir.path());
    std::fs::remove_file(app.join("Frameworks/Foo.framework/Foo")).unwrap();

    let err = sign(&app, identity(), None, SignOptions::default()).unwrap_err();

    assert!(err.is_skippable());
    assert!(err
        .to_string()
        .starts_with("in com.example.app > com.example.foo: "));
    assert!(!code_resources_path(&app).exists());
}

#[test]
fn invalid_target() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();

    let err = sign(
        &dir.path().join("notes.txt"),
        identity(),
        None,
        SignOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CodeSignError::InvalidBundle(_)));
}

#[cfg(unix)]
mod allocator {
    use {super::*, std::os::unix::fs::PermissionsExt};

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("codesign_allocate");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        path
    }

    #[test]
    fn overflow_leaves_binary_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        let original = macho(6000, 512);
        std::fs::write(&path, &original).unwrap();

        // An allocator that copies its input without growing the region.
        let allocate = script(dir.path(), "cp \"$2\" \"$4\"");

        let err = sign(
            &path,
            identity(),
            None,
            SignOptions::default().codesign_allocate(&allocate),
        )
        .unwrap_err();

        assert!(matches!(
            err.root_cause(),
            CodeSignError::SignatureOverflow { reserved: 512, .. }
        ));
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn allocator_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let app = my_app(dir.path());
        let original = macho(6000, 64);
        std::fs::write(app.join("MyApp"), &original).unwrap();

        let allocate = script(dir.path(), "echo 'unsupported binary'; exit 1");

        let err = sign(
            &app,
            identity(),
            None,
            SignOptions::default()
                .skip_policy(SkipPolicy::Record)
                .codesign_allocate(&allocate),
        )
        .unwrap_err();

        assert!(!err.is_skippable());
        assert!(
            matches!(err.root_cause(), CodeSignError::Toolchain(m) if m.contains("unsupported binary"))
        );
        assert_eq!(std::fs::read(app.join("MyApp")).unwrap(), original);
    }
}
