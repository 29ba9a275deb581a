// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of Mach-O binaries.

Each slice receives its own superblob holding a designated requirement,
optional entitlements, a SHA-1 code directory, a SHA-256 alternate code
directory and a CMS signature. The superblob is written into the region
reserved by `LC_CODE_SIGNATURE`. When a slice has no such region, or one
too small for the estimated signature, `codesign_allocate` is run first.
*/

use {
    crate::{
        allocate::AllocatorSettings,
        code_directory::{CodeDirectoryBlob, PAGE_SIZE},
        code_hash::{null_digests, paged_digests},
        code_requirement::{designated_requirement_set, RequirementType},
        embedded_signature::{
            Blob, BlobData, CodeSigningSlot, DigestType, EntitlementsBlob,
        },
        embedded_signature_builder::{
            code_directory_cdhash, EmbeddedSignatureBuilder, CMS_SIZE_ESTIMATE,
        },
        error::CodeSignError,
        identity::SigningIdentity,
        macho::{parse_slices, MachOSlice},
    },
    log::{info, warn},
    std::{
        io::{Seek, SeekFrom, Write},
        path::Path,
    },
};

/// Code directory digests emitted for every slice, primary first.
pub const CODE_DIRECTORY_DIGESTS: [DigestType; 2] = [DigestType::Sha1, DigestType::Sha256];

/// What goes into the signature of one binary.
#[derive(Clone, Copy, Debug)]
pub struct SignatureSettings<'a> {
    /// Identifier recorded in code directories and the designated requirement.
    pub identifier: &'a str,
    pub identity: &'a SigningIdentity,
    /// Entitlements XML plist.
    pub entitlements: Option<&'a str>,
    /// Raw `Info.plist` bytes, digested into the Info special slot.
    pub info_plist: Option<&'a [u8]>,
    /// Raw `CodeResources` bytes, digested into the resource special slot.
    pub code_resources: Option<&'a [u8]>,
}

fn align16(size: usize) -> usize {
    (size + 15) & !15
}

/// Populate a builder with everything but the CMS signature.
fn signature_builder(
    settings: &SignatureSettings,
    code_limit: usize,
    mut code_digests: impl FnMut(DigestType) -> Result<Vec<Vec<u8>>, CodeSignError>,
) -> Result<EmbeddedSignatureBuilder<'static>, CodeSignError> {
    let code_limit_u32 = u32::try_from(code_limit)
        .map_err(|_| CodeSignError::MachO(format!("code limit {} exceeds 4 GiB", code_limit)))?;

    let mut builder = EmbeddedSignatureBuilder::default();

    builder.add_blob(
        CodeSigningSlot::RequirementSet,
        designated_requirement_set(settings.identifier, settings.identity.name())?.into(),
    )?;

    if let Some(entitlements) = settings.entitlements {
        builder.add_blob(
            CodeSigningSlot::Entitlements,
            EntitlementsBlob::from_string(entitlements).into(),
        )?;
    }

    for (index, hash) in CODE_DIRECTORY_DIGESTS.iter().enumerate() {
        let mut cd = CodeDirectoryBlob::new(
            settings.identifier.to_string(),
            settings.identity.team_id().map(|s| s.to_string()),
            *hash,
            code_limit_u32,
        )?;

        cd.code_hashes = code_digests(*hash)?
            .into_iter()
            .map(|digest| digest.into())
            .collect();

        if let Some(info) = settings.info_plist {
            cd.special_hashes
                .insert(CodeSigningSlot::Info, hash.digest_data(info)?.into());
        }
        if let Some(resources) = settings.code_resources {
            cd.special_hashes.insert(
                CodeSigningSlot::ResourceDir,
                hash.digest_data(resources)?.into(),
            );
        }

        if index == 0 {
            builder.add_code_directory(cd)?;
        } else {
            builder.add_alternative_code_directory(cd)?;
        }
    }

    Ok(builder)
}

/// Create the complete signature superblob for the code of one slice.
///
/// `code` is the slice data up to its code limit.
pub fn create_superblob(
    settings: &SignatureSettings,
    code: &[u8],
) -> Result<Vec<u8>, CodeSignError> {
    let mut builder = signature_builder(settings, code.len(), |hash| {
        paged_digests(code, hash, PAGE_SIZE)
    })?;

    builder.create_cms_signature(settings.identity)?;

    builder.create_superblob()
}

/// Estimate the bytes to reserve for the signature of `code_limit` bytes of code.
///
/// Page digests are zeroed and the CMS blob is a placeholder sized for the
/// leaf certificate plus the embedded chain. The result is rounded up to a
/// multiple of 16.
pub fn estimate_superblob_size(
    settings: &SignatureSettings,
    code_limit: usize,
) -> Result<usize, CodeSignError> {
    let mut builder = signature_builder(settings, code_limit, |hash| {
        null_digests(code_limit, hash, PAGE_SIZE)
    })?;

    let chain_size = settings
        .identity
        .chain()
        .iter()
        .map(|cert| cert.constructed_data().len())
        .sum::<usize>();

    builder.add_cms_signature(vec![0u8; CMS_SIZE_ESTIMATE + chain_size])?;

    Ok(align16(builder.create_superblob()?.len()))
}

/// Write superblobs into the reserved regions of their slices.
///
/// Every signature is checked against its region before anything is
/// written, so an overflow leaves the file untouched. Each region is
/// written whole, zero padded, with a single write.
pub fn write_signatures(
    path: &Path,
    signatures: &[(MachOSlice, Vec<u8>)],
) -> Result<(), CodeSignError> {
    let mut writes = Vec::with_capacity(signatures.len());

    for (slice, signature) in signatures {
        let region = slice.signature.ok_or_else(|| {
            CodeSignError::MachO(format!(
                "slice {} has no LC_CODE_SIGNATURE load command",
                slice.index
            ))
        })?;

        if signature.len() > region.size as usize {
            return Err(CodeSignError::SignatureOverflow {
                size: signature.len(),
                reserved: region.size as usize,
            });
        }

        let mut padded = signature.clone();
        padded.resize(region.size as usize, 0);

        writes.push(((slice.offset + region.offset as usize) as u64, padded));
    }

    let mut fh = std::fs::OpenOptions::new().write(true).open(path)?;

    for (offset, data) in writes {
        fh.seek(SeekFrom::Start(offset))?;
        fh.write_all(&data)?;
    }

    fh.flush()?;

    Ok(())
}

/// Sign a Mach-O file in place.
///
/// Signature space is reserved through the allocator when a slice lacks
/// it, which is the only case the allocator is resolved at all.
pub fn sign_macho_file(
    path: &Path,
    settings: &SignatureSettings,
    allocator: &AllocatorSettings,
) -> Result<(), CodeSignError> {
    let mut data = std::fs::read(path)?;
    let mut slices = parse_slices(&data)?;

    let mut needs_allocation = false;
    let mut sizes = Vec::with_capacity(slices.len());

    for slice in &slices {
        let code_limit = match slice.signature {
            Some(region) => region.offset as usize,
            None => align16(slice.size),
        };

        let estimate = estimate_superblob_size(settings, code_limit)?;

        match slice.signature {
            Some(region) if region.size as usize >= estimate => {}
            Some(region) => {
                info!(
                    "{} slice {}: reserved signature space of {} bytes is below estimate of {}",
                    path.display(),
                    slice.index,
                    region.size,
                    estimate
                );
                needs_allocation = true;
            }
            None => {
                needs_allocation = true;
            }
        }

        sizes.push((slice.arch_name()?, estimate));
    }

    if needs_allocation {
        info!("reserving signature space in {}", path.display());
        allocator.resolve()?.allocate(path, &sizes)?;

        data = std::fs::read(path)?;
        slices = parse_slices(&data)?;
    }

    let mut signatures = Vec::with_capacity(slices.len());

    for slice in slices {
        let code = slice.data(&data)?.get(..slice.code_limit()).ok_or_else(|| {
            CodeSignError::MachO(format!("slice {} code limit out of bounds", slice.index))
        })?;

        if slice.signature.is_none() {
            warn!(
                "{} slice {} still lacks LC_CODE_SIGNATURE after allocation",
                path.display(),
                slice.index
            );
        }

        let signature = create_superblob(settings, code)?;
        signatures.push((slice, signature));
    }

    write_signatures(path, &signatures)?;

    info!(
        "signed {} ({} slice(s)) as {}",
        path.display(),
        signatures.len(),
        settings.identifier
    );

    Ok(())
}

/// Signature metadata of signed code, as needed to seal it in a parent.
#[derive(Clone, Debug)]
pub struct SignedMachOInfo {
    /// Raw data constituting the code directory blob.
    ///
    /// Is digested to construct a cdhash.
    pub code_directory_blob: Vec<u8>,

    /// Designated code requirement rendered as text.
    pub designated_code_requirement: Option<String>,
}

impl SignedMachOInfo {
    /// Parse Mach-O data. The first slice's signature is used.
    pub fn parse_data(data: &[u8]) -> Result<Self, CodeSignError> {
        let slice = parse_slices(data)?
            .into_iter()
            .next()
            .ok_or(CodeSignError::BinaryNoCodeSignature)?;

        let signature = slice
            .code_signature(data)?
            .ok_or(CodeSignError::BinaryNoCodeSignature)?;

        let cd = signature
            .find_slot(CodeSigningSlot::CodeDirectory)
            .ok_or(CodeSignError::BinaryNoCodeSignature)?;

        let code_directory_blob = cd.data.to_vec();

        let designated_code_requirement = match signature.code_requirements()? {
            Some(requirements) => match requirements.requirements.get(&RequirementType::Designated)
            {
                Some(designated) => Some(designated.parse_expression()?.to_string()),
                None => None,
            },
            None => None,
        };

        Ok(Self {
            code_directory_blob,
            designated_code_requirement,
        })
    }

    pub fn parse_file(path: &Path) -> Result<Self, CodeSignError> {
        Self::parse_data(&std::fs::read(path)?)
    }

    /// The parsed primary code directory.
    pub fn code_directory(&self) -> Result<Box<CodeDirectoryBlob<'_>>, CodeSignError> {
        match BlobData::from_blob_bytes(&self.code_directory_blob)? {
            BlobData::CodeDirectory(cd) => Ok(cd),
            _ => Err(CodeSignError::BinaryNoCodeSignature),
        }
    }

    /// Hash of the primary code directory, as recorded by a sealing parent.
    pub fn cdhash(&self) -> Result<Vec<u8>, CodeSignError> {
        code_directory_cdhash(&self.code_directory_blob)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{
            embedded_signature::EmbeddedSignature, identity::tests::test_identity,
            macho::tests::synthetic_macho,
        },
        goblin::mach::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64},
        scroll::IOwrite,
    };

    /// Combine thin Mach-O images into a universal binary.
    pub(crate) fn synthetic_fat(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.iowrite_with(0xcafebabeu32, scroll::BE).unwrap();
        data.iowrite_with(slices.len() as u32, scroll::BE).unwrap();

        let mut offset = 4096usize;
        let mut placements = vec![];
        for (cputype, slice) in slices {
            data.iowrite_with(*cputype, scroll::BE).unwrap();
            data.iowrite_with(3u32, scroll::BE).unwrap();
            data.iowrite_with(offset as u32, scroll::BE).unwrap();
            data.iowrite_with(slice.len() as u32, scroll::BE).unwrap();
            data.iowrite_with(12u32, scroll::BE).unwrap();

            placements.push((offset, slice));
            offset = (offset + slice.len() + 4095) & !4095;
        }

        for (offset, slice) in placements {
            data.resize(offset, 0);
            data.extend_from_slice(slice);
        }

        data
    }

    fn settings(identity: &SigningIdentity) -> SignatureSettings<'_> {
        SignatureSettings {
            identifier: "com.example.tool",
            identity,
            entitlements: None,
            info_plist: None,
            code_resources: None,
        }
    }

    #[test]
    fn superblob_contents() {
        let identity = test_identity();
        let settings = SignatureSettings {
            entitlements: Some("<plist/>"),
            info_plist: Some(b"info"),
            code_resources: Some(b"resources"),
            ..settings(&identity)
        };

        let code = vec![7u8; 10000];
        let data = create_superblob(&settings, &code).unwrap();
        let sig = EmbeddedSignature::from_bytes(&data).unwrap();

        let slots = sig.blobs.iter().map(|b| b.slot).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::CodeDirectory,
                CodeSigningSlot::RequirementSet,
                CodeSigningSlot::Entitlements,
                CodeSigningSlot::AlternateCodeDirectory0,
                CodeSigningSlot::Signature,
            ]
        );

        let cd = sig.code_directory().unwrap().unwrap();
        assert_eq!(cd.ident, "com.example.tool");
        assert_eq!(cd.team_name.as_deref(), Some("TEAM123456"));
        assert_eq!(cd.code_limit, 10000);
        assert_eq!(cd.code_hashes.len(), 3);
        assert_eq!(
            cd.special_hashes[&CodeSigningSlot::Info].to_vec(),
            DigestType::Sha1.digest_data(b"info").unwrap()
        );
        assert_eq!(
            cd.special_hashes[&CodeSigningSlot::ResourceDir].to_vec(),
            DigestType::Sha1.digest_data(b"resources").unwrap()
        );

        let (_, alt) = sig.alternate_code_directories().unwrap().remove(0);
        assert_eq!(alt.hash_type, DigestType::Sha256);
        assert_eq!(
            alt.code_hashes[2].to_vec(),
            DigestType::Sha256.digest_data(&code[8192..]).unwrap()
        );
    }

    #[test]
    fn deterministic_code_directory() {
        let identity = test_identity();
        let code = vec![1u8; 5000];

        let a = create_superblob(&settings(&identity), &code).unwrap();
        let b = create_superblob(&settings(&identity), &code).unwrap();

        let a = EmbeddedSignature::from_bytes(&a).unwrap();
        let b = EmbeddedSignature::from_bytes(&b).unwrap();

        assert_eq!(
            a.find_slot(CodeSigningSlot::CodeDirectory).unwrap().data,
            b.find_slot(CodeSigningSlot::CodeDirectory).unwrap().data
        );
    }

    #[test]
    fn estimate_covers_signature() {
        let identity = test_identity();
        let code = vec![3u8; 20000];

        let estimate = estimate_superblob_size(&settings(&identity), code.len()).unwrap();
        let actual = create_superblob(&settings(&identity), &code).unwrap();

        assert_eq!(estimate % 16, 0);
        assert!(estimate >= actual.len());
    }

    #[test]
    fn sign_in_place_without_allocator() {
        let identity = test_identity();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");

        std::fs::write(&path, synthetic_macho(CPU_TYPE_ARM64, 9000, 16384)).unwrap();

        // An unresolvable allocator proves it is never needed here.
        let allocator = AllocatorSettings {
            exe: Some(dir.path().join("missing")),
            ..Default::default()
        };

        sign_macho_file(&path, &settings(&identity), &allocator).unwrap();

        let data = std::fs::read(&path).unwrap();
        let info = SignedMachOInfo::parse_data(&data).unwrap();
        let cd = info.code_directory().unwrap();
        assert_eq!(cd.code_limit, 9048);
        assert_eq!(
            info.designated_code_requirement.as_deref(),
            Some(
                "identifier \"com.example.tool\" and anchor apple generic and \
                 certificate leaf[subject.CN] = \"Apple Development: Unit Tester (TEAM123456)\" \
                 and certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */"
            )
        );
        assert_eq!(info.cdhash().unwrap().len(), 20);
    }

    #[test]
    fn sign_fat_binary() {
        let identity = test_identity();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("universal");

        let fat = synthetic_fat(&[
            (CPU_TYPE_X86_64, synthetic_macho(CPU_TYPE_X86_64, 6000, 16384)),
            (CPU_TYPE_ARM64, synthetic_macho(CPU_TYPE_ARM64, 7000, 16384)),
        ]);
        std::fs::write(&path, &fat).unwrap();

        sign_macho_file(&path, &settings(&identity), &AllocatorSettings::default()).unwrap();

        let data = std::fs::read(&path).unwrap();
        let slices = parse_slices(&data).unwrap();
        assert_eq!(slices.len(), 2);

        for slice in &slices {
            let sig = slice.code_signature(&data).unwrap().unwrap();
            let cd = sig.code_directory().unwrap().unwrap();
            assert_eq!(cd.code_limit as usize, slice.code_limit());
        }

        assert_eq!(data.len(), fat.len());
    }

    #[test]
    fn overflow_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");

        let original = synthetic_macho(CPU_TYPE_ARM64, 3000, 512);
        std::fs::write(&path, &original).unwrap();

        let slices = parse_slices(&original).unwrap();

        let fits = write_signatures(&path, &[(slices[0].clone(), vec![1u8; 512])]);
        assert!(fits.is_ok());
        std::fs::write(&path, &original).unwrap();

        let res = write_signatures(&path, &[(slices[0].clone(), vec![1u8; 513])]);
        assert!(matches!(
            res,
            Err(CodeSignError::SignatureOverflow {
                size: 513,
                reserved: 512
            })
        ));
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn missing_allocator_is_toolchain_error() {
        let identity = test_identity();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");

        let original = synthetic_macho(CPU_TYPE_ARM64, 3000, 64);
        std::fs::write(&path, &original).unwrap();

        let allocator = AllocatorSettings {
            exe: Some(dir.path().join("does-not-exist")),
            ..Default::default()
        };

        assert!(matches!(
            sign_macho_file(&path, &settings(&identity), &allocator),
            Err(CodeSignError::Toolchain(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn unsigned_binary_has_no_info() {
        let data = synthetic_macho(CPU_TYPE_ARM64, 100, 64);

        assert!(matches!(
            SignedMachOInfo::parse_data(&data),
            Err(CodeSignError::BinaryNoCodeSignature)
        ));
    }
}
