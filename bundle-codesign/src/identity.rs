// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing identities.

An identity is a private key, the leaf certificate holding its public key
and any intermediate certificates needed to chain the leaf to a trusted
root. Identities are commonly exported from Keychain Access as PKCS#12
(`.p12`) files.
*/

use {
    crate::{apple_certificates::is_apple_authority, error::CodeSignError},
    bcder::{
        decode::{Constructed, IntoSource},
        BitString, ConstOid, Mode, Oid,
    },
    log::{debug, warn},
    x509_certificate::{
        rfc5280, CapturedX509Certificate, InMemorySigningKeyPair, Sign, X509Certificate,
    },
};

/// Key Usage extension.
///
/// 2.5.29.15
const OID_KEY_USAGE: ConstOid = Oid(&[85, 29, 15]);

/// Encode a password as the BMPString PKCS#12 key derivation expects.
fn bmp_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    bytes
}

/// Extract every certificate and the private key from PFX data.
fn parse_pfx_data(
    data: &[u8],
    password: &str,
) -> Result<(Vec<CapturedX509Certificate>, InMemorySigningKeyPair), CodeSignError> {
    let pfx = p12::PFX::parse(data).map_err(|e| {
        CodeSignError::PfxParseError(format!("data does not appear to be PFX: {:?}", e))
    })?;

    if !pfx.verify_mac(password) {
        return Err(CodeSignError::PfxBadPassword);
    }

    let data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(CodeSignError::PfxParseError(
                "unexpected PFX content info".to_string(),
            ));
        }
    };

    let content_infos = yasna::parse_der(&data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| {
        CodeSignError::PfxParseError(format!("failed parsing inner ContentInfo: {:?}", e))
    })?;

    let bmp_password = bmp_string(password);

    let mut certificates = vec![];
    let mut signing_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => {
                encrypted.data(&bmp_password).ok_or_else(|| {
                    CodeSignError::PfxParseError("failed decrypting inner EncryptedData".into())
                })?
            }
            p12::ContentInfo::OtherContext(_) => {
                return Err(CodeSignError::PfxParseError(
                    "unexpected OtherContent content in inner PFX data".into(),
                ));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| {
            CodeSignError::PfxParseError(format!(
                "failed parsing SafeBag within inner Data: {:?}",
                e
            ))
        })?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(p12::CertBag::X509(cert_data)) => {
                    certificates.push(CapturedX509Certificate::from_der(cert_data)?);
                }
                p12::SafeBagKind::CertBag(p12::CertBag::SDSI(_)) => {
                    return Err(CodeSignError::PfxParseError(
                        "unexpected SDSI certificate data".into(),
                    ));
                }
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                        CodeSignError::PfxParseError(
                            "error decrypting PKCS8 shrouded key bag".into(),
                        )
                    })?;

                    signing_key = Some(
                        InMemorySigningKeyPair::from_pkcs8_der(&decrypted)
                            .map_err(|e| CodeSignError::SigningKey(e.to_string()))?,
                    );
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    debug!("ignoring unknown bag type in PFX data");
                }
            }
        }
    }

    let signing_key = signing_key
        .ok_or_else(|| CodeSignError::PfxParseError("failed to find signing key".into()))?;

    Ok((certificates, signing_key))
}

/// Common name of a certificate's subject.
fn subject_common_name(cert: &CapturedX509Certificate) -> Result<Option<String>, CodeSignError> {
    cert.subject_name()
        .iter_common_name()
        .next()
        .map(|atv| {
            atv.to_string()
                .map_err(|e| CodeSignError::CertificateChain(format!("{:?}", e)))
        })
        .transpose()
}

/// First organizational unit of a certificate's subject.
fn subject_organizational_unit(
    cert: &CapturedX509Certificate,
) -> Result<Option<String>, CodeSignError> {
    cert.subject_name()
        .iter_organizational_unit()
        .next()
        .map(|atv| {
            atv.to_string()
                .map_err(|e| CodeSignError::CertificateChain(format!("{:?}", e)))
        })
        .transpose()
}

fn describe(cert: &CapturedX509Certificate) -> String {
    cert.subject_name()
        .user_friendly_str()
        .unwrap_or_else(|_| "<unprintable subject>".to_string())
}

/// Whether the key usage extension allows `digitalSignature`.
///
/// A certificate without the extension is unrestricted.
fn permits_digital_signature(cert: &CapturedX509Certificate) -> Result<bool, CodeSignError> {
    let x509: &X509Certificate = cert.as_ref();
    let asn: &rfc5280::Certificate = x509.as_ref();

    let extension = match asn
        .iter_extensions()
        .find(|extension| extension.id.as_ref() == OID_KEY_USAGE.as_ref())
    {
        Some(extension) => extension,
        None => return Ok(true),
    };

    let bits = Constructed::decode(extension.value.clone().into_source(), Mode::Der, |cons| {
        BitString::take_from(cons)
    })
    .map_err(|_| {
        CodeSignError::CertificateChain(format!(
            "malformed key usage extension in {}",
            describe(cert)
        ))
    })?;

    // digitalSignature is bit 0.
    Ok(bits.bit(0))
}

/// Walk issuers from `leaf` until a trusted anchor is reached.
///
/// Anchors are self-signed certificates among `others` (or the leaf
/// itself) and known Apple authorities, which only need to appear as an
/// issuer name.
fn verify_chain(
    leaf: &CapturedX509Certificate,
    others: &[CapturedX509Certificate],
) -> Result<(), CodeSignError> {
    let mut current = leaf;

    for _ in 0..=others.len() {
        if current.subject_is_issuer() && current.verify_signed_by_certificate(current).is_ok() {
            debug!("chain anchored at self-signed {}", describe(current));
            return Ok(());
        }

        if is_apple_authority(current.issuer_name()) {
            debug!("chain anchored at Apple authority issuing {}", describe(current));
            return Ok(());
        }

        current = others
            .iter()
            .find(|issuer| {
                issuer.subject_name() == current.issuer_name()
                    && current.verify_signed_by_certificate(*issuer).is_ok()
            })
            .ok_or_else(|| {
                CodeSignError::CertificateChain(format!(
                    "issuer of {} is neither supplied nor a known Apple authority",
                    describe(current)
                ))
            })?;
    }

    Err(CodeSignError::CertificateChain(
        "certificate chain does not reach a trusted anchor".into(),
    ))
}

/// A private key with its certificate chain.
pub struct SigningIdentity {
    key: InMemorySigningKeyPair,
    certificate: CapturedX509Certificate,
    chain: Vec<CapturedX509Certificate>,
    name: String,
    team_id: Option<String>,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("name", &self.name)
            .field("team_id", &self.team_id)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl SigningIdentity {
    /// Assemble an identity from a key and an unordered set of certificates.
    ///
    /// The leaf is the certificate whose public key matches `key`. It must
    /// permit digital signatures and chain through the other certificates
    /// to a self-signed or known Apple authority. Other certificates become
    /// the chain, minus self-signed anchors.
    pub fn from_parts(
        key: InMemorySigningKeyPair,
        certificates: Vec<CapturedX509Certificate>,
    ) -> Result<Self, CodeSignError> {
        let key_data = key.public_key_data();

        let (leaves, others): (Vec<_>, Vec<_>) = certificates
            .into_iter()
            .partition(|cert| cert.public_key_data().as_ref() == key_data.as_ref());

        let certificate = leaves.into_iter().next().ok_or_else(|| {
            CodeSignError::CertificateChain(
                "no certificate matches the signing key's public key".into(),
            )
        })?;

        if let (Some(cert_alg), Some(key_alg)) = (certificate.key_algorithm(), key.key_algorithm())
        {
            if cert_alg != key_alg {
                return Err(CodeSignError::SigningKey(format!(
                    "key algorithm {:?} does not match certificate algorithm {:?}",
                    key_alg, cert_alg
                )));
            }
        }

        if !permits_digital_signature(&certificate)? {
            return Err(CodeSignError::CertificateChain(format!(
                "key usage of {} does not permit digital signatures",
                describe(&certificate)
            )));
        }

        verify_chain(&certificate, &others)?;

        let chain = others
            .into_iter()
            .filter(|cert| !cert.subject_is_issuer())
            .collect::<Vec<_>>();

        let name = subject_common_name(&certificate)?.ok_or_else(|| {
            CodeSignError::CertificateChain("signing certificate has no subject CN".into())
        })?;
        let team_id = subject_organizational_unit(&certificate)?;

        debug!(
            "using signing identity {} with {} intermediate certificates",
            name,
            chain.len()
        );

        Ok(Self {
            key,
            certificate,
            chain,
            name,
            team_id,
        })
    }

    /// Load an identity from PKCS#12 data.
    pub fn from_pkcs12(data: &[u8], password: &str) -> Result<Self, CodeSignError> {
        let (certificates, key) = parse_pfx_data(data, password)?;

        Self::from_parts(key, certificates)
    }

    /// Load an identity from PEM encoded certificates and a PKCS#8 key.
    ///
    /// `certificates` may hold several `CERTIFICATE` blocks.
    pub fn from_pem(certificates: &[u8], key: &[u8]) -> Result<Self, CodeSignError> {
        Self::from_pem_sources([certificates, key])
    }

    /// Load an identity from any number of PEM documents.
    ///
    /// Blocks are routed by tag, so certificates and the key may be spread
    /// over the sources in any order. Exactly one `PRIVATE KEY` is required.
    pub fn from_pem_sources<'a>(
        sources: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Self, CodeSignError> {
        let mut certificates = vec![];
        let mut keys = vec![];

        for source in sources {
            for pem in pem::parse_many(source).map_err(CodeSignError::CertificatePem)? {
                match pem.tag.as_str() {
                    "CERTIFICATE" => {
                        certificates.push(CapturedX509Certificate::from_der(pem.contents)?);
                    }
                    "PRIVATE KEY" => keys.push(
                        InMemorySigningKeyPair::from_pkcs8_der(&pem.contents)
                            .map_err(|e| CodeSignError::SigningKey(e.to_string()))?,
                    ),
                    tag @ ("RSA PRIVATE KEY" | "EC PRIVATE KEY") => {
                        return Err(CodeSignError::SigningKey(format!(
                            "{} blocks are not supported; convert the key to PKCS#8",
                            tag
                        )));
                    }
                    tag => warn!("(unhandled PEM tag {}; ignoring)", tag),
                }
            }
        }

        let key = match keys.len() {
            0 => {
                return Err(CodeSignError::SigningKey(
                    "no PRIVATE KEY found in PEM data".into(),
                ))
            }
            1 => keys.remove(0),
            n => {
                return Err(CodeSignError::SigningKey(format!(
                    "expected one PRIVATE KEY in PEM data; found {}",
                    n
                )))
            }
        };

        Self::from_parts(key, certificates)
    }

    pub fn signing_key(&self) -> &InMemorySigningKeyPair {
        &self.key
    }

    /// The leaf certificate.
    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    /// Intermediate certificates embedded alongside the leaf.
    pub fn chain(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }

    /// Subject common name of the leaf.
    ///
    /// Designated requirements pin this value.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Team identifier from the leaf's organizational unit.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }
}
