// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! CMS signatures over code directories.

The signature blob of an embedded signature is a DER `SignedData` whose
content is detached: the signed message digest is computed over the primary
code directory blob. Apple adds a signed attribute holding a plist of the
hashes of every code directory so alternate directories are bound to the
same signature.
*/

use {
    crate::{
        error::{CodeSignError, CodeSignSkippableError},
        identity::SigningIdentity,
    },
    cryptographic_message_syntax::{Bytes, Oid, SignedData, SignedDataBuilder, SignerBuilder},
    log::debug,
};

/// OID of the signed attribute holding the hash agility plist.
///
/// 1.2.840.113635.100.9.1
pub const CD_DIGESTS_PLIST_OID: &[u8] = &[42, 134, 72, 134, 247, 99, 100, 9, 1];

/// Produce a DER `SignedData` over a primary code directory.
///
/// The identity's leaf and intermediate certificates are embedded.
pub fn sign_code_directory(
    identity: &SigningIdentity,
    code_directory: Vec<u8>,
    cdhashes_plist: &[u8],
) -> Result<Vec<u8>, CodeSignError> {
    let signing_cert = identity.certificate();

    debug!(
        "signing {} byte code directory with {}",
        code_directory.len(),
        identity.name()
    );

    let signer = SignerBuilder::new(identity.signing_key(), signing_cert.clone())
        .message_id_content(code_directory)
        .signed_attribute_octet_string(
            Oid(Bytes::copy_from_slice(CD_DIGESTS_PLIST_OID)),
            cdhashes_plist,
        );

    let mut builder = SignedDataBuilder::default()
        .certificate(signing_cert.clone())
        .signer(signer);

    for cert in identity.chain() {
        builder = builder.certificate(cert.clone());
    }

    Ok(builder.build_der()?)
}

/// Verify a `SignedData` against the code directory it should sign.
///
/// A bad signature or digest is a [CodeSignError::VerificationFailed]. Data
/// without any signer, or whose signer certificate isn't embedded, can't be
/// evaluated and is reported as not trusted.
pub fn verify_code_directory_signature(
    der: &[u8],
    code_directory: &[u8],
) -> Result<(), CodeSignError> {
    let signed_data = SignedData::parse_ber(der)?;

    let mut signers = 0;

    for signer in signed_data.signers() {
        signers += 1;

        signer
            .verify_signature_with_signed_data(&signed_data)
            .map_err(|e| match e {
                cryptographic_message_syntax::CmsError::CertificateNotFound => {
                    CodeSignSkippableError::SignatureNotTrusted(
                        "signer certificate not embedded".into(),
                    )
                    .into()
                }
                e => CodeSignError::VerificationFailed(format!("CMS signature invalid: {}", e)),
            })?;

        signer
            .verify_message_digest_with_content(code_directory)
            .map_err(|e| {
                CodeSignError::VerificationFailed(format!(
                    "CMS message digest does not match code directory: {}",
                    e
                ))
            })?;
    }

    if signers == 0 {
        return Err(CodeSignSkippableError::SignatureNotTrusted("no CMS signers".into()).into());
    }

    debug!("verified {} CMS signer(s)", signers);

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::identity::tests::test_identity};

    #[test]
    fn sign_then_verify() {
        let identity = test_identity();
        let cd = b"\xfa\xde\x0c\x02 code directory".to_vec();

        let der = sign_code_directory(&identity, cd.clone(), b"<plist/>").unwrap();

        let signed_data = SignedData::parse_ber(&der).unwrap();
        assert!(signed_data.signed_content().is_none());
        assert_eq!(signed_data.certificates().count(), 1);

        verify_code_directory_signature(&der, &cd).unwrap();
    }

    #[test]
    fn digest_mismatch() {
        let identity = test_identity();
        let der = sign_code_directory(&identity, b"one".to_vec(), b"<plist/>").unwrap();

        assert!(matches!(
            verify_code_directory_signature(&der, b"two"),
            Err(CodeSignError::VerificationFailed(_))
        ));
    }
}
