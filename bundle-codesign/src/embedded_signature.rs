// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures (superblobs, blobs, slots, digests).
//!
//! Signature data lives at the end of a Mach-O slice, at the offset its
//! `LC_CODE_SIGNATURE` load command points to. It is a *SuperBlob*:
//!
//! * A header holding a magic, the total length, and the number of blobs.
//! * An index of `(slot, offset)` pairs, one per blob.
//! * The blobs themselves. Every blob starts with a big endian `u32` magic
//!   and a `u32` length that includes the 8 byte header.
//!
//! Layouts follow Apple's `cs_blobs.h` header from xnu.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        code_requirement::{CodeRequirement, RequirementType},
        error::CodeSignError,
    },
    cryptographic_message_syntax::SignedData,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        collections::BTreeMap,
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Header magic of the payloads we read and write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// A single code requirement.
    Requirement,
    /// A set of code requirements keyed by requirement type.
    RequirementSet,
    /// CodeDirectory.
    CodeDirectory,
    /// The SuperBlob embedded in a Mach-O slice.
    EmbeddedSignature,
    /// XML plist entitlements.
    Entitlements,
    /// DER entitlements.
    EntitlementsDer,
    /// Generic wrapper. Holds the CMS signature.
    BlobWrapper,
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within a SuperBlob index.
///
/// Slots 1 through 7 double as *special slots* in a code directory, whose
/// digests are stored before the code page digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    Signature,
    Unknown(u32),
}

impl CodeSigningSlot {
    /// Human readable name of the slot.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CodeDirectory => "CodeDirectory",
            Self::Info => "Info",
            Self::RequirementSet => "RequirementSet",
            Self::ResourceDir => "Resources",
            Self::Application => "Application",
            Self::Entitlements => "Entitlements",
            Self::RepSpecific => "Rep Specific",
            Self::EntitlementsDer => "DER Entitlements",
            Self::AlternateCodeDirectory0 => "CodeDirectory Alternate #0",
            Self::AlternateCodeDirectory1 => "CodeDirectory Alternate #1",
            Self::AlternateCodeDirectory2 => "CodeDirectory Alternate #2",
            Self::AlternateCodeDirectory3 => "CodeDirectory Alternate #3",
            Self::AlternateCodeDirectory4 => "CodeDirectory Alternate #4",
            Self::Signature => "CMS Signature",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl std::fmt::Debug for CodeSigningSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{} ({})", self.name(), u32::from(*self)))
    }
}

impl Display for CodeSigningSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// Whether the slot can appear in the special digests of a code directory.
    pub fn is_special_slot(&self) -> bool {
        matches!(u32::from(*self), 1..=7)
    }

    /// Whether this is one of the alternate code directory slots.
    pub fn is_alternative_code_directory(&self) -> bool {
        matches!(
            self,
            Self::AlternateCodeDirectory0
                | Self::AlternateCodeDirectory1
                | Self::AlternateCodeDirectory2
                | Self::AlternateCodeDirectory3
                | Self::AlternateCodeDirectory4
        )
    }
}

#[repr(C)]
#[derive(Clone, Pread)]
struct BlobIndex {
    /// A [CodeSigningSlot] value.
    typ: u32,
    offset: u32,
}

/// Hash algorithm recorded in code directories.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestType::None => f.write_str("none"),
            DigestType::Sha1 => f.write_str("sha1"),
            DigestType::Sha256 => f.write_str("sha256"),
            DigestType::Sha256Truncated => f.write_str("sha256-truncated"),
            DigestType::Sha384 => f.write_str("sha384"),
            DigestType::Sha512 => f.write_str("sha512"),
            DigestType::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl TryFrom<&str> for DigestType {
    type Error = CodeSignError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha256-truncated" => Ok(Self::Sha256Truncated),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(CodeSignError::DigestUnknownAlgorithm),
        }
    }
}

impl DigestType {
    /// Size in bytes of digests produced by this type.
    pub fn hash_len(&self) -> Result<usize, CodeSignError> {
        Ok(match self {
            Self::Sha1 | Self::Sha256Truncated => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
            Self::None | Self::Unknown(_) => return Err(CodeSignError::DigestUnknownAlgorithm),
        })
    }

    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, CodeSignError> {
        match self {
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::None | Self::Unknown(_) => Err(CodeSignError::DigestUnknownAlgorithm),
        }
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, CodeSignError> {
        let mut hasher = self.as_hasher()?;

        hasher.update(data);
        let mut hash = hasher.finish().as_ref().to_vec();

        if matches!(self, Self::Sha256Truncated) {
            hash.truncate(20);
        }

        Ok(hash)
    }
}

/// A digest stored in a code directory.
#[derive(Clone, Eq, PartialEq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether every byte is 0, as for unfilled special slots.
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Read the `(magic, length, payload)` of a blob.
fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), scroll::Error> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize, &data[8..]))
}

pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], CodeSignError> {
    let (magic, _, data) = read_blob_header(data)?;

    if magic != expected_magic {
        Err(CodeSignError::BadMagic(what))
    } else {
        Ok(data)
    }
}

/// Serialize a SuperBlob from already serialized blobs.
///
/// Blobs are written in iteration order. Offsets in the index are relative
/// to the start of the SuperBlob.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, CodeSignError> {
    let blobs = blobs.collect::<Vec<_>>();

    // magic + total length + blob count + one index entry per blob.
    let header_length = 12 + 8 * blobs.len() as u32;

    let mut indices = Vec::with_capacity(blobs.len());
    let mut total_length = header_length;

    for (slot, blob) in &blobs {
        indices.push(BlobIndex {
            typ: u32::from(*slot),
            offset: total_length,
        });

        total_length += blob.len() as u32;
    }

    let mut cursor = std::io::Cursor::new(Vec::<u8>::with_capacity(total_length as usize));

    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length, scroll::BE)?;
    cursor.iowrite_with(indices.len() as u32, scroll::BE)?;
    for index in indices {
        cursor.iowrite_with(index.typ, scroll::BE)?;
        cursor.iowrite_with(index.offset, scroll::BE)?;
    }
    for (_, data) in blobs {
        cursor.write_all(data)?;
    }

    Ok(cursor.into_inner())
}

/// A single blob as referenced by a SuperBlob index entry.
///
/// The payload is unparsed. Use [BlobEntry::into_parsed_blob] to interpret it.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Position within the SuperBlob index.
    pub index: usize,

    pub slot: CodeSigningSlot,

    /// Start offset of the blob header within the SuperBlob.
    pub offset: usize,

    pub magic: CodeSigningMagic,

    /// Self-reported blob length, header included.
    pub length: usize,

    /// Raw blob data, header included.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("magic", &self.magic)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    pub fn into_parsed_blob(self) -> Result<ParsedBlob<'a>, CodeSignError> {
        self.try_into()
    }

    /// The blob data without its header.
    pub fn payload(&self) -> Result<&'a [u8], CodeSignError> {
        Ok(read_blob_header(self.data)?.2)
    }

    /// Digest of the full blob, header included.
    pub fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, CodeSignError> {
        hash.digest_data(self.data)
    }
}

/// Common behavior of typed blobs.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic that identifies this format.
    fn magic() -> u32;

    /// Parse an instance from data beginning with the 8 byte blob header.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError>;

    /// Serialize the payload, excluding the blob header.
    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError>;

    /// Serialize the blob with its magic and length header.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        let payload = self.serialize_payload()?;

        let mut res = Vec::with_capacity(payload.len() + 8);
        res.iowrite_with(Self::magic(), scroll::BE)?;
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }

    /// Digest of the serialized blob.
    ///
    /// This is the value code directories record in special slots.
    fn digest_with(&self, hash_type: DigestType) -> Result<Vec<u8>, CodeSignError> {
        hash_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// A single code requirement in binary form.
pub struct RequirementBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Requirement)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for RequirementBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("RequirementBlob({})", hex::encode(&self.data)))
    }
}

impl<'a> RequirementBlob<'a> {
    pub fn to_owned(&self) -> RequirementBlob<'static> {
        RequirementBlob {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    /// Parse the binary payload into a requirement expression.
    pub fn parse_expression(&self) -> Result<CodeRequirement<'_>, CodeSignError> {
        Ok(CodeRequirement::parse_binary(&self.data)?.0)
    }
}

/// A set of requirement blobs keyed by [RequirementType].
///
/// Entries are kept ordered by type so serialization is deterministic.
#[derive(Debug, Default)]
pub struct RequirementSetBlob<'a> {
    pub requirements: BTreeMap<RequirementType, RequirementBlob<'a>>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;

        // A u32 count then (type, offset) pairs, offsets relative to the blob start.
        let offset = &mut 8;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let mut indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            indices.push((
                data.gread_with::<u32>(offset, scroll::BE)?,
                data.gread_with::<u32>(offset, scroll::BE)?,
            ));
        }

        let mut requirements = BTreeMap::new();

        for (i, (flavor, start)) in indices.iter().enumerate() {
            let end = indices
                .get(i + 1)
                .map(|(_, next)| *next as usize)
                .unwrap_or_else(|| data.len());

            let requirement_data = data
                .get(*start as usize..end)
                .ok_or(CodeSignError::RequirementMalformed("requirement set index"))?;

            requirements.insert(
                RequirementType::from(*flavor),
                RequirementBlob::from_blob_bytes(requirement_data)?,
            );
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut res = Vec::new();

        // Offsets are relative to the blob header, which precedes this payload.
        let data_start_offset = 8 + 4 + (8 * self.requirements.len() as u32);
        let serialized = self
            .requirements
            .iter()
            .map(|(typ, blob)| Ok((*typ, blob.to_blob_bytes()?)))
            .collect::<Result<Vec<_>, CodeSignError>>()?;

        res.iowrite_with(serialized.len() as u32, scroll::BE)?;

        let mut written = 0;
        for (typ, data) in &serialized {
            res.iowrite_with(u32::from(*typ), scroll::BE)?;
            res.iowrite_with(data_start_offset + written, scroll::BE)?;
            written += data.len() as u32;
        }

        for (_, data) in serialized {
            res.write_all(&data)?;
        }

        Ok(res)
    }
}

impl<'a> RequirementSetBlob<'a> {
    pub fn to_owned(&self) -> RequirementSetBlob<'static> {
        RequirementSetBlob {
            requirements: self
                .requirements
                .iter()
                .map(|(flavor, blob)| (*flavor, blob.to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Set the requirement for a given [RequirementType].
    pub fn set_requirements(&mut self, slot: RequirementType, blob: RequirementBlob<'a>) {
        self.requirements.insert(slot, blob);
    }
}

/// An entitlements blob holding an XML plist.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(CodeSignError::EntitlementsBadUtf8)?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Construct an instance using any string as the payload.
    pub fn from_string(s: &(impl ToString + ?Sized)) -> Self {
        Self {
            plist: s.to_string().into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

impl<'a> Display for EntitlementsBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.plist)
    }
}

/// Generic blob wrapper. The CMS signature lives in one of these.
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("BlobWrapper({} bytes)", self.data.len()))
    }
}

impl BlobWrapperBlob<'static> {
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        Self { data: data.into() }
    }
}

/// A blob with a magic we don't interpret.
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: &'a [u8],
}

impl<'a> Blob<'a> for OtherBlob<'a> {
    fn magic() -> u32 {
        // Placeholder: the real magic is per instance.
        u32::MAX
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let (magic, _, data) = read_blob_header(data)?;

        Ok(Self { magic, data })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        Ok(self.data.to_vec())
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut res = Vec::with_capacity(self.data.len() + 8);
        res.iowrite_with(self.magic, scroll::BE)?;
        res.iowrite_with(self.data.len() as u32 + 8, scroll::BE)?;
        res.write_all(self.data)?;

        Ok(res)
    }
}

impl<'a> std::fmt::Debug for OtherBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("OtherBlob({:#x})", self.magic))
    }
}

/// A parsed blob of any supported type.
#[derive(Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> Blob<'a> for BlobData<'a> {
    fn magic() -> u32 {
        u32::MAX
    }

    /// Dispatch to the parser matching the blob's magic.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let (magic, length, _) = read_blob_header(data)?;

        let data = data.get(0..length).ok_or(CodeSignError::SuperblobMalformed)?;

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        match self {
            Self::Requirement(b) => b.serialize_payload(),
            Self::RequirementSet(b) => b.serialize_payload(),
            Self::CodeDirectory(b) => b.serialize_payload(),
            Self::Entitlements(b) => b.serialize_payload(),
            Self::BlobWrapper(b) => b.serialize_payload(),
            Self::Other(b) => b.serialize_payload(),
        }
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::RequirementSet(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }
}

impl<'a> From<RequirementSetBlob<'a>> for BlobData<'a> {
    fn from(b: RequirementSetBlob<'a>) -> Self {
        Self::RequirementSet(Box::new(b))
    }
}

impl<'a> From<CodeDirectoryBlob<'a>> for BlobData<'a> {
    fn from(b: CodeDirectoryBlob<'a>) -> Self {
        Self::CodeDirectory(Box::new(b))
    }
}

impl<'a> From<EntitlementsBlob<'a>> for BlobData<'a> {
    fn from(b: EntitlementsBlob<'a>) -> Self {
        Self::Entitlements(Box::new(b))
    }
}

impl<'a> From<BlobWrapperBlob<'a>> for BlobData<'a> {
    fn from(b: BlobWrapperBlob<'a>) -> Self {
        Self::BlobWrapper(Box::new(b))
    }
}

/// A blob entry together with its parsed content.
#[derive(Debug)]
pub struct ParsedBlob<'a> {
    pub blob_entry: BlobEntry<'a>,
    pub blob: BlobData<'a>,
}

impl<'a> TryFrom<BlobEntry<'a>> for ParsedBlob<'a> {
    type Error = CodeSignError;

    fn try_from(blob_entry: BlobEntry<'a>) -> Result<Self, Self::Error> {
        let blob = BlobData::from_blob_bytes(blob_entry.data)?;

        Ok(Self { blob_entry, blob })
    }
}

/// A lightly parsed embedded signature SuperBlob.
pub struct EmbeddedSignature<'a> {
    pub magic: CodeSigningMagic,
    pub length: u32,
    pub count: u32,

    /// Raw data backing this super blob.
    pub data: &'a [u8],

    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("SuperBlob")
            .field("magic", &self.magic)
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Parse a SuperBlob from the region `LC_CODE_SIGNATURE` points at.
    ///
    /// Trailing zero padding after the SuperBlob is tolerated.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        let offset = &mut 0;

        let magic = data.gread_with::<u32>(offset, scroll::BE)?.into();

        if magic != CodeSigningMagic::EmbeddedSignature {
            return Err(CodeSignError::BadMagic("embedded signature super blob"));
        }

        let length = data.gread_with::<u32>(offset, scroll::BE)?;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let data = data
            .get(0..length as usize)
            .ok_or(CodeSignError::SuperblobMalformed)?;

        let mut blob_indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            blob_indices.push(data.gread_with::<BlobIndex>(offset, scroll::BE)?);
        }

        let mut blobs = Vec::with_capacity(blob_indices.len());

        for (i, index) in blob_indices.iter().enumerate() {
            // Bound each blob by the next index entry so a bad self-reported
            // length is caught instead of reading into a sibling.
            let end_offset = blob_indices
                .get(i + 1)
                .map(|next| next.offset as usize)
                .unwrap_or_else(|| data.len());

            let full_slice = data
                .get(index.offset as usize..end_offset)
                .ok_or(CodeSignError::SuperblobMalformed)?;
            let (magic, blob_length, _) = read_blob_header(full_slice)?;

            if blob_length > full_slice.len() {
                return Err(CodeSignError::SuperblobMalformed);
            }

            blobs.push(BlobEntry {
                index: i,
                slot: index.typ.into(),
                offset: index.offset as usize,
                magic: magic.into(),
                length: blob_length,
                data: &full_slice[0..blob_length],
            });
        }

        Ok(Self {
            magic,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Find the first occurrence of the specified slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    pub fn find_slot_parsed(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<ParsedBlob<'a>>, CodeSignError> {
        self.find_slot(slot)
            .map(|entry| entry.clone().into_parsed_blob())
            .transpose()
    }

    fn code_directory_in_slot(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, CodeSignError> {
        match self.find_slot_parsed(slot)? {
            Some(ParsedBlob {
                blob: BlobData::CodeDirectory(cd),
                ..
            }) => Ok(Some(cd)),
            Some(_) => Err(CodeSignError::BadMagic("code directory blob")),
            None => Ok(None),
        }
    }

    /// The primary code directory.
    pub fn code_directory(&self) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, CodeSignError> {
        self.code_directory_in_slot(CodeSigningSlot::CodeDirectory)
    }

    /// All alternate code directories, in slot order.
    pub fn alternate_code_directories(
        &self,
    ) -> Result<Vec<(CodeSigningSlot, Box<CodeDirectoryBlob<'a>>)>, CodeSignError> {
        let mut res = vec![];

        for entry in &self.blobs {
            if entry.slot.is_alternative_code_directory() {
                if let Some(cd) = self.code_directory_in_slot(entry.slot)? {
                    res.push((entry.slot, cd));
                }
            }
        }

        Ok(res)
    }

    /// The entitlements blob, if present.
    pub fn entitlements(&self) -> Result<Option<Box<EntitlementsBlob<'a>>>, CodeSignError> {
        match self.find_slot_parsed(CodeSigningSlot::Entitlements)? {
            Some(ParsedBlob {
                blob: BlobData::Entitlements(entitlements),
                ..
            }) => Ok(Some(entitlements)),
            Some(_) => Err(CodeSignError::BadMagic("entitlements blob")),
            None => Ok(None),
        }
    }

    /// The requirement set blob, if present.
    pub fn code_requirements(
        &self,
    ) -> Result<Option<Box<RequirementSetBlob<'a>>>, CodeSignError> {
        match self.find_slot_parsed(CodeSigningSlot::RequirementSet)? {
            Some(ParsedBlob {
                blob: BlobData::RequirementSet(reqs),
                ..
            }) => Ok(Some(reqs)),
            Some(_) => Err(CodeSignError::BadMagic("requirements blob")),
            None => Ok(None),
        }
    }

    /// Raw CMS signature data (DER `SignedData`).
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, CodeSignError> {
        if let Some(entry) = self.find_slot(CodeSigningSlot::Signature) {
            BlobWrapperBlob::from_blob_bytes(entry.data)?;

            Ok(Some(entry.payload()?))
        } else {
            Ok(None)
        }
    }

    /// The parsed CMS [SignedData], if any.
    pub fn signed_data(&self) -> Result<Option<SignedData>, CodeSignError> {
        match self.signature_data()? {
            Some(data) if !data.is_empty() => Ok(Some(SignedData::parse_ber(data)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_names() {
        assert_eq!(CodeSigningSlot::Info.to_string(), "Info");
        assert_eq!(CodeSigningSlot::ResourceDir.to_string(), "Resources");
        assert_eq!(
            format!("{:?}", CodeSigningSlot::AlternateCodeDirectory0),
            "CodeDirectory Alternate #0 (4096)"
        );
    }

    #[test]
    fn superblob_layout() {
        let blobs = vec![
            (
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("<plist/>")
                    .to_blob_bytes()
                    .unwrap(),
            ),
            (
                CodeSigningSlot::Signature,
                BlobWrapperBlob::from_data_owned(vec![])
                    .to_blob_bytes()
                    .unwrap(),
            ),
        ];

        let data = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap();

        assert_eq!(&data[0..4], &[0xfa, 0xde, 0x0c, 0xc0]);
        // 12 byte header, 2 index entries, 16 + 8 bytes of blobs.
        assert_eq!(data.len(), 12 + 16 + 16 + 8);
        assert_eq!(data.pread_with::<u32>(4, scroll::BE).unwrap() as usize, data.len());
        assert_eq!(data.pread_with::<u32>(8, scroll::BE).unwrap(), 2);
        assert_eq!(data.pread_with::<u32>(12, scroll::BE).unwrap(), 5);
        assert_eq!(data.pread_with::<u32>(16, scroll::BE).unwrap(), 28);
        assert_eq!(data.pread_with::<u32>(20, scroll::BE).unwrap(), 0x10000);
        assert_eq!(data.pread_with::<u32>(24, scroll::BE).unwrap(), 44);

        let mut padded = data.clone();
        padded.resize(data.len() + 64, 0);

        let sig = EmbeddedSignature::from_bytes(&padded).unwrap();
        assert_eq!(sig.count, 2);
        assert_eq!(sig.data.len(), data.len());
        assert_eq!(sig.entitlements().unwrap().unwrap().as_str(), "<plist/>");
        assert!(sig.code_directory().unwrap().is_none());
        assert_eq!(sig.signature_data().unwrap(), Some(&[][..]));
        assert!(sig.signed_data().unwrap().is_none());
    }

    #[test]
    fn bad_superblob_magic() {
        let data = [0xfa, 0xde, 0x0c, 0x02, 0, 0, 0, 12, 0, 0, 0, 0];

        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(CodeSignError::BadMagic(_))
        ));
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(DigestType::Sha1.digest_data(b"").unwrap().len(), 20);
        assert_eq!(DigestType::Sha256.digest_data(b"").unwrap().len(), 32);
        assert_eq!(
            DigestType::Sha256Truncated.digest_data(b"").unwrap(),
            DigestType::Sha256.digest_data(b"").unwrap()[0..20].to_vec()
        );
        assert_eq!(DigestType::Sha256Truncated.hash_len().unwrap(), 20);
        assert!(DigestType::None.digest_data(b"").is_err());
    }

    #[test]
    fn slot_ordering() {
        let mut slots = vec![
            CodeSigningSlot::Signature,
            CodeSigningSlot::AlternateCodeDirectory0,
            CodeSigningSlot::Entitlements,
            CodeSigningSlot::CodeDirectory,
            CodeSigningSlot::RequirementSet,
        ];
        slots.sort();

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
        assert!(CodeSigningSlot::ResourceDir.is_special_slot());
        assert!(!CodeSigningSlot::AlternateCodeDirectory0.is_special_slot());
    }
}
