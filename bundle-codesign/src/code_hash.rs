// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Hashing of code pages.

The code directory holds one digest per page of the signed region of a
Mach-O slice. When a page is mapped, the kernel hashes it and compares
against the recorded digest.

The final page of the region is usually partial. Its digest covers only
the bytes that remain, not a zero padded page.
*/

use {
    crate::{embedded_signature::DigestType, error::CodeSignError},
    rayon::prelude::*,
};

/// Compute paged hashes.
///
/// `data` is split into `page_size` chunks and each is digested with
/// `hash`. Pages are hashed in parallel. The result is ordered by page
/// offset regardless of scheduling.
pub fn paged_digests(
    data: &[u8],
    hash: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, CodeSignError> {
    if page_size == 0 {
        return Err(CodeSignError::InvalidPageSize("0".into()));
    }

    data.par_chunks(page_size)
        .map(|chunk| hash.digest_data(chunk))
        .collect::<Result<Vec<_>, CodeSignError>>()
}

/// Compute placeholder digests for `data` without hashing it.
///
/// Used when estimating the size of a signature before its content is known.
pub fn null_digests(
    data_len: usize,
    hash: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, CodeSignError> {
    if page_size == 0 {
        return Err(CodeSignError::InvalidPageSize("0".into()));
    }

    let count = (data_len + page_size - 1) / page_size;

    Ok(vec![vec![0u8; hash.hash_len()?]; count])
}

/// Find the first page whose digest doesn't match.
///
/// Returns `None` when every expected digest matches.
pub fn first_mismatched_page(
    data: &[u8],
    hash: DigestType,
    page_size: usize,
    expected: &[&[u8]],
) -> Result<Option<usize>, CodeSignError> {
    let actual = paged_digests(data, hash, page_size)?;

    if actual.len() != expected.len() {
        return Ok(Some(actual.len().min(expected.len())));
    }

    Ok(actual
        .iter()
        .zip(expected.iter())
        .position(|(a, b)| a.as_slice() != *b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_and_tail() {
        let data = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        let digests = paged_digests(&data, DigestType::Sha256, 4096).unwrap();

        // ceil(10000 / 4096)
        assert_eq!(digests.len(), 3);
        assert_eq!(
            digests[2],
            DigestType::Sha256.digest_data(&data[8192..]).unwrap()
        );
        assert_ne!(
            digests[2],
            DigestType::Sha256
                .digest_data(&[&data[8192..], &[0u8; 4096 - 1808][..]].concat())
                .unwrap()
        );
    }

    #[test]
    fn deterministic() {
        let data = vec![42u8; 4096 * 17 + 3];

        let a = paged_digests(&data, DigestType::Sha1, 4096).unwrap();
        let b = paged_digests(&data, DigestType::Sha1, 4096).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 18);
    }

    #[test]
    fn exact_multiple() {
        let data = vec![0u8; 8192];

        assert_eq!(paged_digests(&data, DigestType::Sha1, 4096).unwrap().len(), 2);
        assert_eq!(null_digests(8192, DigestType::Sha1, 4096).unwrap().len(), 2);
        assert_eq!(null_digests(8193, DigestType::Sha256, 4096).unwrap()[2].len(), 32);
    }

    #[test]
    fn mismatch_detection() {
        let mut data = vec![7u8; 4096 * 3];
        let digests = paged_digests(&data, DigestType::Sha1, 4096).unwrap();
        let expected = digests.iter().map(|d| d.as_slice()).collect::<Vec<_>>();

        assert_eq!(
            first_mismatched_page(&data, DigestType::Sha1, 4096, &expected).unwrap(),
            None
        );

        data[4096 * 2 + 10] = 0;
        assert_eq!(
            first_mismatched_page(&data, DigestType::Sha1, 4096, &expected).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn zero_page_size_rejected() {
        assert!(matches!(
            paged_digests(&[1, 2, 3], DigestType::Sha256, 0),
            Err(CodeSignError::InvalidPageSize(_))
        ));
        assert!(matches!(
            null_digests(3, DigestType::Sha256, 0),
            Err(CodeSignError::InvalidPageSize(_))
        ));
    }
}
