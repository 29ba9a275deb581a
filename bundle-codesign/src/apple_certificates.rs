// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Well-known Apple certificate authorities.
//!
//! Identities exported from Keychain Access usually carry only the leaf.
//! Its issuer is one of the authorities below, advertised at
//! <https://www.apple.com/certificateauthority/>, and is accepted as a
//! chain anchor by subject name.

use x509_certificate::rfc3280::Name;

/// `(organization, common name)` of each known Apple authority.
const KNOWN_AUTHORITIES: &[(&str, &str)] = &[
    ("Apple Computer, Inc.", "Apple Root Certificate Authority"),
    ("Apple Inc.", "Apple Root CA"),
    ("Apple Inc.", "Apple Root CA - G2"),
    ("Apple Inc.", "Apple Root CA - G3"),
    ("Apple Inc.", "Apple IST CA 2 - G1"),
    ("Apple Inc.", "Apple IST CA 8 - G1"),
    (
        "Apple Inc.",
        "Apple Application Integration Certification Authority",
    ),
    (
        "Apple Inc.",
        "Apple Application Integration 2 Certification Authority",
    ),
    ("Apple Inc.", "Apple Application Integration CA - G3"),
    ("Apple Inc.", "Apple Application Integration CA 5 - G1"),
    ("Apple Inc.", "Developer Authentication Certification Authority"),
    ("Apple Inc.", "Developer ID Certification Authority"),
    ("Apple Inc.", "Apple Software Update Certification Authority"),
    ("Apple Inc.", "Apple Timestamp Certification Authority"),
    (
        "Apple Inc.",
        "Apple Worldwide Developer Relations Certification Authority",
    ),
    ("Apple Inc.", "Apple Worldwide Developer Relations CA - G2"),
];

fn first_string<'a>(
    mut values: impl Iterator<Item = &'a x509_certificate::rfc3280::AttributeTypeAndValue>,
) -> Option<String> {
    values.next().and_then(|atv| atv.to_string().ok())
}

/// Whether `name` identifies a known Apple certificate authority.
pub fn is_apple_authority(name: &Name) -> bool {
    let (organization, common_name) = match (
        first_string(name.iter_organization()),
        first_string(name.iter_common_name()),
    ) {
        (Some(o), Some(cn)) => (o, cn),
        _ => return false,
    };

    KNOWN_AUTHORITIES
        .iter()
        .any(|(o, cn)| *o == organization && *cn == common_name)
}
