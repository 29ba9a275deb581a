// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O primitives related to code signing

Code signing data is embedded at the end of each Mach-O slice. An
`LC_CODE_SIGNATURE` load command in the slice header records where it
starts (`dataoff`, relative to the slice) and how many bytes are reserved
(`datasize`). Digested "code" is everything in the slice before `dataoff`.

Universal (fat) binaries hold several slices, each with its own load
commands and its own signature region.
*/

use {
    crate::{embedded_signature::EmbeddedSignature, error::CodeSignError},
    goblin::mach::{
        cputype::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64},
        load_command::CommandVariant,
        Mach, MachO,
    },
};

/// `LC_CODE_SIGNATURE` location within a slice.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignatureRegion {
    /// Offset of the signature data relative to the slice start.
    pub offset: u32,
    /// Bytes reserved for the signature data.
    pub size: u32,
}

/// A single architecture slice of a Mach-O file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachOSlice {
    /// Position within a fat binary, or 0 for a thin one.
    pub index: usize,
    /// Offset of the slice within the file.
    pub offset: usize,
    /// Length of the slice.
    pub size: usize,
    pub cputype: u32,
    pub signature: Option<SignatureRegion>,
}

impl MachOSlice {
    /// The slice's bytes within the full file data.
    pub fn data<'a>(&self, file_data: &'a [u8]) -> Result<&'a [u8], CodeSignError> {
        file_data
            .get(self.offset..self.offset + self.size)
            .ok_or_else(|| CodeSignError::MachO("slice extends past end of file".into()))
    }

    /// Name of the architecture as `codesign_allocate -a` expects it.
    pub fn arch_name(&self) -> Result<&'static str, CodeSignError> {
        arch_name(self.cputype)
    }

    /// Bytes covered by code page digests.
    ///
    /// This is everything before the signature region, or the whole slice
    /// when none is reserved.
    pub fn code_limit(&self) -> usize {
        match self.signature {
            Some(region) => region.offset as usize,
            None => self.size,
        }
    }

    /// Parse the embedded signature of this slice, if any.
    pub fn code_signature<'a>(
        &self,
        file_data: &'a [u8],
    ) -> Result<Option<EmbeddedSignature<'a>>, CodeSignError> {
        let region = match self.signature {
            Some(region) => region,
            None => return Ok(None),
        };

        let start = region.offset as usize;
        let end = start + region.size as usize;

        let data = self
            .data(file_data)?
            .get(start..end)
            .ok_or_else(|| CodeSignError::MachO("signature region out of bounds".into()))?;

        if data.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        Ok(Some(EmbeddedSignature::from_bytes(data)?))
    }
}

/// Resolve a cputype to the architecture name used by Apple tooling.
pub fn arch_name(cputype: u32) -> Result<&'static str, CodeSignError> {
    match cputype {
        CPU_TYPE_X86 => Ok("i386"),
        CPU_TYPE_X86_64 => Ok("x86_64"),
        CPU_TYPE_ARM => Ok("armv7"),
        CPU_TYPE_ARM64 => Ok("arm64"),
        _ => Err(CodeSignError::UnsupportedCpuType(cputype)),
    }
}

/// Whether data begins with a thin or fat Mach-O magic.
pub fn is_macho_data(data: &[u8]) -> bool {
    matches!(
        data.get(0..4),
        Some([0xfe, 0xed, 0xfa, 0xce])
            | Some([0xce, 0xfa, 0xed, 0xfe])
            | Some([0xfe, 0xed, 0xfa, 0xcf])
            | Some([0xcf, 0xfa, 0xed, 0xfe])
            | Some([0xca, 0xfe, 0xba, 0xbe])
    )
}

/// Whether the file at `path` starts with a Mach-O magic.
pub fn is_macho_file(path: &std::path::Path) -> Result<bool, CodeSignError> {
    use std::io::Read;

    let mut header = [0u8; 4];
    let mut fh = std::fs::File::open(path)?;

    match fh.read_exact(&mut header) {
        Ok(()) => Ok(is_macho_data(&header)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn find_signature_region(macho: &MachO) -> Option<SignatureRegion> {
    macho
        .load_commands
        .iter()
        .find_map(|lc| match &lc.command {
            CommandVariant::CodeSignature(command) => Some(SignatureRegion {
                offset: command.dataoff,
                size: command.datasize,
            }),
            _ => None,
        })
}

/// Enumerate the architecture slices of Mach-O data.
pub fn parse_slices(data: &[u8]) -> Result<Vec<MachOSlice>, CodeSignError> {
    match Mach::parse(data)? {
        Mach::Binary(macho) => Ok(vec![MachOSlice {
            index: 0,
            offset: 0,
            size: data.len(),
            cputype: macho.header.cputype,
            signature: find_signature_region(&macho),
        }]),
        Mach::Fat(multi) => {
            let mut slices = vec![];

            for (index, arch) in multi.iter_arches().enumerate() {
                let arch = arch?;

                let slice_data = data
                    .get(arch.offset as usize..arch.offset as usize + arch.size as usize)
                    .ok_or_else(|| {
                        CodeSignError::MachO(format!("fat arch {} out of bounds", index))
                    })?;
                let macho = MachO::parse(slice_data, 0)?;

                slices.push(MachOSlice {
                    index,
                    offset: arch.offset as usize,
                    size: arch.size as usize,
                    cputype: arch.cputype,
                    signature: find_signature_region(&macho),
                });
            }

            if slices.is_empty() {
                return Err(CodeSignError::MachO("fat binary has no slices".into()));
            }

            Ok(slices)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {super::*, scroll::IOwrite};

    /// Build a minimal 64-bit little endian Mach-O with one `LC_CODE_SIGNATURE`.
    ///
    /// `code_len` bytes of filler follow the header, then `reserved` zero
    /// bytes of signature space.
    pub(crate) fn synthetic_macho(cputype: u32, code_len: usize, reserved: u32) -> Vec<u8> {
        let mut data = Vec::new();

        let header_len = 32 + 16;
        let dataoff = (header_len + code_len) as u32;

        data.iowrite_with(0xfeedfacfu32, scroll::LE).unwrap();
        data.iowrite_with(cputype, scroll::LE).unwrap();
        data.iowrite_with(3u32, scroll::LE).unwrap();
        // MH_EXECUTE
        data.iowrite_with(2u32, scroll::LE).unwrap();
        data.iowrite_with(1u32, scroll::LE).unwrap();
        data.iowrite_with(16u32, scroll::LE).unwrap();
        data.iowrite_with(0u32, scroll::LE).unwrap();
        data.iowrite_with(0u32, scroll::LE).unwrap();

        data.iowrite_with(0x1du32, scroll::LE).unwrap();
        data.iowrite_with(16u32, scroll::LE).unwrap();
        data.iowrite_with(dataoff, scroll::LE).unwrap();
        data.iowrite_with(reserved, scroll::LE).unwrap();

        data.extend((0..code_len).map(|i| (i % 253) as u8));
        data.resize(dataoff as usize + reserved as usize, 0);

        data
    }

    #[test]
    fn thin_slice() {
        let data = synthetic_macho(CPU_TYPE_ARM64, 5000, 1024);
        assert!(is_macho_data(&data));

        let slices = parse_slices(&data).unwrap();
        assert_eq!(slices.len(), 1);

        let slice = &slices[0];
        assert_eq!(slice.offset, 0);
        assert_eq!(slice.size, data.len());
        assert_eq!(slice.arch_name().unwrap(), "arm64");
        assert_eq!(
            slice.signature,
            Some(SignatureRegion {
                offset: 5048,
                size: 1024
            })
        );
        assert_eq!(slice.code_limit(), 5048);
        assert!(slice.code_signature(&data).unwrap().is_none());
    }

    #[test]
    fn arch_names() {
        assert_eq!(arch_name(7).unwrap(), "i386");
        assert_eq!(arch_name(0x0100_0007).unwrap(), "x86_64");
        assert_eq!(arch_name(12).unwrap(), "armv7");
        assert_eq!(arch_name(0x0100_000c).unwrap(), "arm64");
        assert!(matches!(
            arch_name(18),
            Err(CodeSignError::UnsupportedCpuType(18))
        ));
    }

    #[test]
    fn not_macho() {
        assert!(!is_macho_data(b"#!/bin/sh\n"));
        assert!(!is_macho_data(b"\xfe"));
    }
}
