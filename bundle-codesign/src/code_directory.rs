// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType,
        },
        error::CodeSignError,
    },
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, collections::BTreeMap, io::Write},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
}

/// Page size exponent written into code directories we produce.
pub const PAGE_SIZE_SHIFT: u8 = 12;

/// Page size corresponding to [PAGE_SIZE_SHIFT].
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_SHIFT;

/// Largest page size exponent accepted when parsing.
const MAX_PAGE_SIZE_LOG2: u8 = 16;

fn get_hashes(
    data: &[u8],
    offset: usize,
    count: usize,
    hash_size: usize,
) -> Result<Vec<Digest<'_>>, CodeSignError> {
    let hashes = data
        .get(offset..offset + (count * hash_size))
        .ok_or(CodeSignError::BadMagic("code directory hash table"))?;

    Ok(hashes
        .chunks(hash_size)
        .map(|data| Digest { data: data.into() })
        .collect())
}

fn read_c_string(data: &[u8], offset: u32) -> Option<Result<&str, std::str::Utf8Error>> {
    data.get(offset as usize..)?
        .split(|&b| b == 0)
        .map(std::str::from_utf8)
        .next()
}

/// A code directory blob.
///
/// Parsing accepts any version since the hash and identifier offsets are
/// explicit. Fields introduced after `0x20200` (64-bit code limit,
/// executable segment, runtime, linkage) are not retained and
/// serialization only emits versions up to [CodeDirectoryVersion::SupportsTeamId].
#[derive(Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// File offset, relative to the slice start, at which code digests stop.
    ///
    /// This is where the embedded signature begins.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes (stored as a log2 u8).
    pub page_size: u32,
    /// Unused (must be 0).
    pub spare2: u32,
    /// Offset of optional scatter vector.
    pub scatter_offset: Option<u32>,

    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_hashes: Vec<Digest<'a>>,
    pub special_hashes: BTreeMap<CodeSigningSlot, Digest<'a>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodeSignError> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;

        let offset = &mut 8;

        let version = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(flags);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let hash_type = data.gread_with::<u8>(offset, scroll::BE)?.into();
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(offset, scroll::BE)?;
        if page_size > MAX_PAGE_SIZE_LOG2 {
            return Err(CodeSignError::InvalidPageSize(format!(
                "2^{} exceeds 2^{}",
                page_size, MAX_PAGE_SIZE_LOG2
            )));
        }
        let page_size = 1u32 << page_size;
        let spare2 = data.gread_with(offset, scroll::BE)?;

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };

        let ident = match read_c_string(data, ident_offset) {
            Some(Ok(s)) => Cow::from(s),
            _ => return Err(CodeSignError::CodeDirectoryMalformedIdentifier),
        };

        let team_name = match team_offset.map(|offset| read_c_string(data, offset)) {
            None => None,
            Some(Some(Ok(s))) => Some(Cow::from(s)),
            Some(_) => return Err(CodeSignError::CodeDirectoryMalformedTeam),
        };

        let code_hashes = get_hashes(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            hash_size as usize,
        )?;

        let special_start = (hash_offset as usize)
            .checked_sub(hash_size as usize * n_special_slots as usize)
            .ok_or(CodeSignError::BadMagic("code directory special slots"))?;

        // Special hashes are stored highest slot first and end right
        // before the code hashes.
        let special_hashes = get_hashes(
            data,
            special_start,
            n_special_slots as usize,
            hash_size as usize,
        )?
        .into_iter()
        .enumerate()
        .map(|(i, h)| (CodeSigningSlot::from(n_special_slots - i as u32), h))
        .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            ident,
            team_name,
            code_hashes,
            special_hashes,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodeSignError> {
        if self.version > CodeDirectoryVersion::SupportsTeamId as u32 {
            return Err(CodeSignError::CodeDirectoryUnsupportedVersion(self.version));
        }

        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // Offsets aren't known until the variable length data is written.
        // Write placeholders and patch them at the end.
        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits, scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;

        // Special digests sit at negative indices from the code digests, at
        // the index of their slot number. Missing slots below the highest
        // present one are written as zeroes.
        let highest_slot = self
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(self.code_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let mut team_offset_cursor_position = None;

        if self.version >= CodeDirectoryVersion::SupportsScatter as u32 {
            if self.scatter_offset.is_some() {
                return Err(CodeSignError::MachO(
                    "scatter vectors are not supported".to_string(),
                ));
            }
            cursor.iowrite_with(0u32, scroll::BE)?;

            if self.version >= CodeDirectoryVersion::SupportsTeamId as u32 {
                team_offset_cursor_position = Some(cursor.position());
                cursor.iowrite_with(0u32, scroll::BE)?;
            }
        }

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        if team_offset_cursor_position.is_some() {
            if let Some(team_name) = &self.team_name {
                cursor.write_all(team_name.as_bytes())?;
                cursor.write_all(b"\0")?;
            }
        }

        for slot_index in (1..highest_slot + 1).rev() {
            let slot = CodeSigningSlot::from(slot_index);

            if !slot.is_special_slot() {
                return Err(CodeSignError::BadMagic("code directory special slot"));
            }

            match self.special_hashes.get(&slot) {
                Some(hash) => cursor.write_all(&hash.data)?,
                None => cursor.write_all(&b"\0".repeat(self.hash_size as usize))?,
            }
        }

        let code_hashes_start_offset = cursor.position();

        for hash in &self.code_hashes {
            cursor.write_all(&hash.data)?;
        }

        // Add 8 to every offset for the blob header, which isn't in this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(code_hashes_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if let Some(offset) = team_offset_cursor_position {
            if self.team_name.is_some() {
                cursor.set_position(offset);
                cursor.iowrite_with(team_offset as u32 + 8, scroll::BE)?;
            }
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Construct an empty code directory for the given identifier and digest.
    ///
    /// The version is the lowest that can express a team identifier.
    pub fn new(
        ident: impl Into<Cow<'a, str>>,
        team_name: Option<String>,
        hash_type: DigestType,
        code_limit: u32,
    ) -> Result<Self, CodeSignError> {
        Ok(Self {
            version: CodeDirectoryVersion::SupportsTeamId as u32,
            flags: CodeSignatureFlags::empty(),
            code_limit,
            hash_size: hash_type.hash_len()? as u8,
            hash_type,
            platform: 0,
            page_size: PAGE_SIZE as u32,
            spare2: 0,
            scatter_offset: None,
            ident: ident.into(),
            team_name: team_name.map(Cow::from),
            code_hashes: vec![],
            special_hashes: BTreeMap::new(),
        })
    }

    /// Number of code pages needed to cover `code_limit`.
    pub fn expected_code_slots(&self) -> usize {
        let page_size = self.page_size as usize;

        (self.code_limit as usize + page_size - 1) / page_size
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            hash_size: self.hash_size,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_hashes: self.code_hashes.iter().map(|h| h.to_owned()).collect(),
            special_hashes: self
                .special_hashes
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect(),
        }
    }
}
