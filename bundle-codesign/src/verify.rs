// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Verification of signed bundles.

Verification walks the same component graph as signing, children first.
For each slice of each main executable, the embedded signature is parsed
and checked against the file: special slots against `Info.plist` and the
sealed resources, page hashes against the code, and the CMS signature
against the primary code directory. A bundle's resource envelope is then
rebuilt from disk using the sealed rules and compared with the sealed copy.

Certificate trust is not evaluated. The CMS signature only has to be
produced by the certificate embedded with it.
*/

use {
    crate::{
        bundle::Bundle,
        cms::verify_code_directory_signature,
        code_directory::CodeDirectoryBlob,
        code_hash::first_mismatched_page,
        code_resources::{code_resources_path, CodeResources, CodeResourcesBuilder},
        context::{Context, SignOutcome, VerifyContext},
        embedded_signature::CodeSigningSlot,
        error::{CodeSignError, CodeSignSkippableError},
        macho::parse_slices,
        macho_signing::SignedMachOInfo,
    },
    log::{debug, warn},
    std::{collections::BTreeMap, path::Path},
};

/// Verify a signed bundle, dylib or executable.
pub fn verify(path: &Path, ctx: &VerifyContext) -> Result<SignOutcome, CodeSignError> {
    let bundle = Bundle::resolve(path)?;
    let identifier = bundle.identifier()?;
    let app_ctx = ctx.for_app(&identifier);

    if let Err(e) = verify_component(&bundle, &app_ctx) {
        app_ctx.on_error(e.in_component(&identifier))?;
    }

    Ok(app_ctx.outcome())
}

fn verify_component(bundle: &Bundle, ctx: &VerifyContext) -> Result<(), CodeSignError> {
    ctx.info(&format!("Verifying {}", bundle.path().display()));

    let executable = bundle.executable_path()?;
    if !executable.is_file() {
        return Err(CodeSignSkippableError::MissingExecutable(executable).into());
    }

    let mut nested = BTreeMap::new();

    for child in bundle.children()? {
        ctx.check_abort()?;

        let child_id = child.identifier()?;
        let child_ctx = ctx.push().for_app(&child_id);

        if let Err(e) = verify_component(&child, &child_ctx) {
            child_ctx.on_error(e.in_component(&child_id))?;
        }

        match SignedMachOInfo::parse_file(&child.executable_path()?) {
            Ok(info) => {
                nested.insert(bundle.relative_path(child.path())?, info);
            }
            Err(e) => {
                debug!("{} has no usable signature: {}", child.path().display(), e);
            }
        }
    }

    let code_resources = if bundle.kind().is_directory() {
        let path = code_resources_path(bundle.path());
        if !path.is_file() {
            return Err(CodeSignError::VerificationFailed(format!(
                "{} does not exist",
                path.display()
            )));
        }

        Some(std::fs::read(&path)?)
    } else {
        None
    };

    verify_macho_file(
        &executable,
        bundle.info_plist_data(),
        code_resources.as_deref(),
        ctx,
    )?;

    if let Some(data) = code_resources {
        ctx.debug("Checking sealed resources");

        let sealed = CodeResources::from_xml(&data)?;
        let relative_executable = bundle.relative_path(&executable)?;

        let actual = CodeResourcesBuilder::from_sealed(&sealed, Some(&relative_executable))?
            .build(bundle.path(), &nested)?;

        sealed.compare(&actual)?;
    }

    Ok(())
}

/// Verify the embedded signature of every slice of a Mach-O file.
///
/// `info_plist` and `code_resources` are the bytes the special slots of
/// the code directories should match.
pub fn verify_macho_file(
    path: &Path,
    info_plist: Option<&[u8]>,
    code_resources: Option<&[u8]>,
    ctx: &VerifyContext,
) -> Result<(), CodeSignError> {
    let data = std::fs::read(path)?;

    for slice in parse_slices(&data)? {
        ctx.debug(&format!("Checking {} slice", slice.arch_name()?));

        let signature = slice
            .code_signature(&data)?
            .ok_or(CodeSignError::BinaryNoCodeSignature)?;
        let code = slice.data(&data)?;

        let primary = signature
            .code_directory()?
            .ok_or(CodeSignError::BinaryNoCodeSignature)?;

        let mut directories = vec![primary];
        directories.extend(
            signature
                .alternate_code_directories()?
                .into_iter()
                .map(|(_, cd)| cd),
        );

        for cd in &directories {
            verify_special_slots(cd, info_plist, code_resources, ctx)?;
            verify_code_hashes(cd, code)?;
        }

        let cd_blob = signature
            .find_slot(CodeSigningSlot::CodeDirectory)
            .ok_or(CodeSignError::BinaryNoCodeSignature)?;

        match signature.signature_data()? {
            Some(cms) if !cms.is_empty() => {
                if let Err(e) = verify_code_directory_signature(cms, cd_blob.data) {
                    ctx.on_error(e)?;
                }
            }
            _ => {
                ctx.on_error(
                    CodeSignSkippableError::SignatureNotTrusted("ad-hoc signature".into()).into(),
                )?;
            }
        }
    }

    Ok(())
}

fn verify_special_slots(
    cd: &CodeDirectoryBlob,
    info_plist: Option<&[u8]>,
    code_resources: Option<&[u8]>,
    ctx: &VerifyContext,
) -> Result<(), CodeSignError> {
    for (slot, content) in [
        (CodeSigningSlot::Info, info_plist),
        (CodeSigningSlot::ResourceDir, code_resources),
    ] {
        let expected = match cd.special_hashes.get(&slot) {
            Some(digest) if !digest.is_null() => digest,
            _ => {
                if content.is_some() {
                    warn!("{} code directory does not seal {}", cd.hash_type, slot);
                }
                continue;
            }
        };

        let matches = match content {
            Some(content) => cd.hash_type.digest_data(content)? == &*expected.data,
            None => false,
        };

        if !matches {
            debug!("sealed {} {} digest is {}", cd.hash_type, slot, expected.as_hex());
            ctx.on_error(
                CodeSignSkippableError::SpecialSlotMismatch(format!("{} {}", cd.hash_type, slot))
                    .into(),
            )?;
        }
    }

    Ok(())
}

fn verify_code_hashes(cd: &CodeDirectoryBlob, code: &[u8]) -> Result<(), CodeSignError> {
    let code = code.get(..cd.code_limit as usize).ok_or_else(|| {
        CodeSignError::VerificationFailed(format!(
            "code limit {} exceeds slice size {}",
            cd.code_limit,
            code.len()
        ))
    })?;

    if cd.code_hashes.len() != cd.expected_code_slots() {
        return Err(CodeSignError::VerificationFailed(format!(
            "{} code slots cover a code limit needing {}",
            cd.code_hashes.len(),
            cd.expected_code_slots()
        )));
    }

    let expected = cd
        .code_hashes
        .iter()
        .map(|digest| &*digest.data)
        .collect::<Vec<_>>();

    if let Some(page) = first_mismatched_page(code, cd.hash_type, cd.page_size as usize, &expected)?
    {
        return Err(CodeSignError::VerificationFailed(format!(
            "code slot hash mismatch at page {}",
            page
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            allocate::AllocatorSettings,
            context::SkipPolicy,
            identity::tests::test_identity,
            macho::tests::synthetic_macho,
            macho_signing::{sign_macho_file, SignatureSettings},
        },
        goblin::mach::cputype::CPU_TYPE_ARM64,
    };

    fn signed_tool(dir: &Path) -> std::path::PathBuf {
        let identity = test_identity();
        let path = dir.join("tool");
        std::fs::write(&path, synthetic_macho(CPU_TYPE_ARM64, 9000, 16384)).unwrap();

        let settings = SignatureSettings {
            identifier: "tool",
            identity: &identity,
            entitlements: None,
            info_plist: None,
            code_resources: None,
        };
        sign_macho_file(&path, &settings, &AllocatorSettings::default()).unwrap();

        path
    }

    #[test]
    fn verify_signed_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_tool(dir.path());

        let outcome = verify(&path, &VerifyContext::new()).unwrap();
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn tampered_page_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_tool(dir.path());

        let mut data = std::fs::read(&path).unwrap();
        data[4096 + 10] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let err = verify(&path, &VerifyContext::new().with_skip_policy(SkipPolicy::Record))
            .unwrap_err();
        assert_eq!(
            err.root_cause().to_string(),
            "verification failed: code slot hash mismatch at page 1"
        );
    }

    #[test]
    fn special_slot_mismatch_is_skippable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, synthetic_macho(CPU_TYPE_ARM64, 3000, 16384)).unwrap();

        let identity = test_identity();
        let settings = SignatureSettings {
            identifier: "tool",
            identity: &identity,
            entitlements: None,
            info_plist: Some(b"original"),
            code_resources: None,
        };
        sign_macho_file(&path, &settings, &AllocatorSettings::default()).unwrap();

        let ctx = VerifyContext::new().with_skip_policy(SkipPolicy::Record);
        verify_macho_file(&path, Some(b"changed"), None, &ctx).unwrap();

        let outcome = ctx.outcome();
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.warnings[0].message.contains("hash mismatch"));

        assert!(verify_macho_file(&path, Some(b"changed"), None, &VerifyContext::new()).is_err());
        verify_macho_file(&path, Some(b"original"), None, &VerifyContext::new()).unwrap();
    }

    /// Offset of the primary code directory in a signed file.
    fn code_directory_offset(data: &[u8]) -> usize {
        data.windows(4)
            .position(|w| w == [0xfa, 0xde, 0x0c, 0x02])
            .unwrap()
    }

    #[test]
    fn corrupt_page_exponent_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_tool(dir.path());

        let mut data = std::fs::read(&path).unwrap();
        let cd = code_directory_offset(&data);
        data[cd + 39] = 40;
        std::fs::write(&path, &data).unwrap();

        let err = verify(&path, &VerifyContext::new().with_skip_policy(SkipPolicy::Record))
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            CodeSignError::InvalidPageSize(_)
        ));
    }

    #[test]
    fn code_slot_count_must_match_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_tool(dir.path());

        // Shrink codeLimit to one page while three hashes remain.
        let mut data = std::fs::read(&path).unwrap();
        let cd = code_directory_offset(&data);
        data[cd + 32..cd + 36].copy_from_slice(&4096u32.to_be_bytes());
        std::fs::write(&path, &data).unwrap();

        let err = verify_macho_file(&path, None, None, &VerifyContext::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "verification failed: 3 code slots cover a code limit needing 1"
        );
    }
}
