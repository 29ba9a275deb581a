// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental construction of embedded signature superblobs.

use {
    crate::{
        cms,
        code_directory::CodeDirectoryBlob,
        embedded_signature::{
            create_superblob, Blob, BlobData, BlobWrapperBlob, CodeSigningMagic, CodeSigningSlot,
            DigestType,
        },
        error::CodeSignError,
        identity::SigningIdentity,
    },
    std::collections::BTreeMap,
};

/// Size of the CMS placeholder used when estimating a signature's size.
pub const CMS_SIZE_ESTIMATE: usize = 9 * 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
enum BlobsState {
    Empty,
    SpecialAdded,
    CodeDirectoryAdded,
    SignatureAdded,
}

impl Default for BlobsState {
    fn default() -> Self {
        Self::Empty
    }
}

/// Builds an [crate::embedded_signature::EmbeddedSignature] one blob at a time.
///
/// Special blobs go in first, then code directories, then the CMS
/// signature. Blobs are emitted in slot order, which yields the layout
/// CodeDirectory, Requirements, Entitlements, alternates, Signature.
#[derive(Debug, Default)]
pub struct EmbeddedSignatureBuilder<'a> {
    state: BlobsState,
    blobs: BTreeMap<CodeSigningSlot, BlobData<'a>>,
}

impl<'a> EmbeddedSignatureBuilder<'a> {
    fn code_directory_in_slot(&self, slot: CodeSigningSlot) -> Option<&CodeDirectoryBlob<'a>> {
        match self.blobs.get(&slot) {
            Some(BlobData::CodeDirectory(cd)) => Some(cd),
            _ => None,
        }
    }

    /// The primary code directory, once registered.
    pub fn code_directory(&self) -> Option<&CodeDirectoryBlob<'a>> {
        self.code_directory_in_slot(CodeSigningSlot::CodeDirectory)
    }

    /// Register a special blob into a slot.
    ///
    /// Last write wins. Blobs can't be added once a code directory exists
    /// since its special digests would go stale.
    pub fn add_blob(
        &mut self,
        slot: CodeSigningSlot,
        blob: BlobData<'a>,
    ) -> Result<(), CodeSignError> {
        if !matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(CodeSignError::MachO(
                "cannot add blobs after code directory or signature is registered".into(),
            ));
        }

        if matches!(blob, BlobData::CodeDirectory(_)) || !slot.is_special_slot() {
            return Err(CodeSignError::MachO(format!(
                "cannot register blob in slot {:?} via add_blob()",
                slot
            )));
        }

        self.blobs.insert(slot, blob);
        self.state = BlobsState::SpecialAdded;

        Ok(())
    }

    fn insert_code_directory(
        &mut self,
        slot: CodeSigningSlot,
        mut cd: CodeDirectoryBlob<'a>,
    ) -> Result<(), CodeSignError> {
        if matches!(self.state, BlobsState::SignatureAdded) {
            return Err(CodeSignError::MachO(
                "cannot add code directory after signature data added".into(),
            ));
        }

        // Digests of external content (Info.plist, CodeResources) are
        // already set by the caller. Fill in the ones backed by blobs.
        for (special_slot, blob) in &self.blobs {
            if special_slot.is_special_slot() {
                cd.special_hashes
                    .insert(*special_slot, blob.digest_with(cd.hash_type)?.into());
            }
        }

        self.blobs.insert(slot, cd.into());
        self.state = BlobsState::CodeDirectoryAdded;

        Ok(())
    }

    /// Register the primary code directory.
    ///
    /// Digests of previously registered special blobs are written into it.
    pub fn add_code_directory(&mut self, cd: CodeDirectoryBlob<'a>) -> Result<(), CodeSignError> {
        self.insert_code_directory(CodeSigningSlot::CodeDirectory, cd)
    }

    /// Register a code directory in the next free alternate slot.
    pub fn add_alternative_code_directory(
        &mut self,
        cd: CodeDirectoryBlob<'a>,
    ) -> Result<CodeSigningSlot, CodeSignError> {
        let slot = (0x1000..0x1005)
            .map(CodeSigningSlot::from)
            .find(|slot| !self.blobs.contains_key(slot))
            .ok_or_else(|| CodeSignError::MachO("no free alternate code directory slot".into()))?;

        self.insert_code_directory(slot, cd)?;

        Ok(slot)
    }

    /// The hash agility plist binding every code directory to the signature.
    ///
    /// One `cdhashes` entry per code directory in slot order, each the
    /// directory's digest truncated to 20 bytes.
    pub fn code_directory_hashes_plist(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut cdhashes = vec![];

        for (slot, blob) in &self.blobs {
            if let BlobData::CodeDirectory(cd) = blob {
                if *slot == CodeSigningSlot::CodeDirectory || slot.is_alternative_code_directory()
                {
                    let mut digest = cd.digest_with(cd.hash_type)?;
                    digest.truncate(20);
                    cdhashes.push(plist::Value::Data(digest));
                }
            }
        }

        let mut dict = plist::Dictionary::new();
        dict.insert("cdhashes".to_string(), plist::Value::Array(cdhashes));

        let mut xml = vec![];
        plist::Value::Dictionary(dict).to_writer_xml(&mut xml)?;

        Ok(xml)
    }

    /// Produce a CMS signature over the primary code directory and register it.
    ///
    /// The signed content is detached. The identity's certificates are
    /// embedded in the SignedData.
    pub fn create_cms_signature(&mut self, identity: &SigningIdentity) -> Result<(), CodeSignError> {
        let main_cd = self
            .code_directory()
            .ok_or_else(|| {
                CodeSignError::MachO("cannot create CMS signature without code directory".into())
            })?
            .to_blob_bytes()?;

        let plist_xml = self.code_directory_hashes_plist()?;
        let der = cms::sign_code_directory(identity, main_cd, &plist_xml)?;

        self.add_cms_signature(der)
    }

    /// Register already encoded CMS data.
    ///
    /// Also used with a zeroed placeholder when only the size matters.
    pub fn add_cms_signature(&mut self, der_data: Vec<u8>) -> Result<(), CodeSignError> {
        if self.code_directory().is_none() {
            return Err(CodeSignError::MachO(
                "cannot add signature before code directory".into(),
            ));
        }

        self.blobs.insert(
            CodeSigningSlot::Signature,
            BlobWrapperBlob::from_data_owned(der_data).into(),
        );
        self.state = BlobsState::SignatureAdded;

        Ok(())
    }

    /// Serialize the superblob.
    pub fn create_superblob(&self) -> Result<Vec<u8>, CodeSignError> {
        if matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(CodeSignError::MachO(
                "code directory required in order to materialize superblob".into(),
            ));
        }

        let blobs = self
            .blobs
            .iter()
            .map(|(slot, blob)| Ok((*slot, blob.to_blob_bytes()?)))
            .collect::<Result<Vec<_>, CodeSignError>>()?;

        create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())
    }
}

/// Digest the primary code directory the way nested code is sealed.
pub fn code_directory_cdhash(cd_blob: &[u8]) -> Result<Vec<u8>, CodeSignError> {
    DigestType::Sha256Truncated.digest_data(cd_blob)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::embedded_signature::{EmbeddedSignature, EntitlementsBlob},
    };

    fn cd(hash: DigestType) -> CodeDirectoryBlob<'static> {
        let mut cd = CodeDirectoryBlob::new("com.example.app", None, hash, 10).unwrap();
        cd.code_hashes = vec![hash.digest_data(b"0123456789").unwrap().into()];
        cd
    }

    #[test]
    fn slot_order_and_special_digests() {
        let mut builder = EmbeddedSignatureBuilder::default();

        builder
            .add_blob(
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("<plist/>").into(),
            )
            .unwrap();
        builder.add_code_directory(cd(DigestType::Sha1)).unwrap();
        assert_eq!(
            builder
                .add_alternative_code_directory(cd(DigestType::Sha256))
                .unwrap(),
            CodeSigningSlot::AlternateCodeDirectory0
        );
        builder.add_cms_signature(vec![]).unwrap();

        let data = builder.create_superblob().unwrap();
        let sig = EmbeddedSignature::from_bytes(&data).unwrap();

        let slots = sig.blobs.iter().map(|b| b.slot).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::CodeDirectory,
                CodeSigningSlot::Entitlements,
                CodeSigningSlot::AlternateCodeDirectory0,
                CodeSigningSlot::Signature
            ]
        );

        let ent_digest = EntitlementsBlob::from_string("<plist/>")
            .digest_with(DigestType::Sha256)
            .unwrap();
        let (_, alt) = sig.alternate_code_directories().unwrap().remove(0);
        assert_eq!(
            alt.special_hashes[&CodeSigningSlot::Entitlements].to_vec(),
            ent_digest
        );
    }

    #[test]
    fn state_enforced() {
        let mut builder = EmbeddedSignatureBuilder::default();

        assert!(builder.create_superblob().is_err());
        assert!(builder.add_cms_signature(vec![]).is_err());

        builder.add_code_directory(cd(DigestType::Sha1)).unwrap();
        assert!(builder
            .add_blob(
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("").into()
            )
            .is_err());
    }

    #[test]
    fn cdhashes_plist() {
        let mut builder = EmbeddedSignatureBuilder::default();
        builder.add_code_directory(cd(DigestType::Sha1)).unwrap();
        builder
            .add_alternative_code_directory(cd(DigestType::Sha256))
            .unwrap();

        let xml = builder.code_directory_hashes_plist().unwrap();
        let value = plist::Value::from_reader_xml(xml.as_slice()).unwrap();
        let hashes = value
            .as_dictionary()
            .unwrap()
            .get("cdhashes")
            .unwrap()
            .as_array()
            .unwrap();

        assert_eq!(hashes.len(), 2);
        assert!(hashes
            .iter()
            .all(|h| h.as_data().map(|d| d.len()) == Some(20)));
        assert_eq!(
            hashes[0].as_data().unwrap(),
            DigestType::Sha1
                .digest_data(&cd(DigestType::Sha1).to_blob_bytes().unwrap())
                .unwrap()
                .as_slice()
        );
    }
}
