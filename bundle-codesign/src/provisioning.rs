// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning profiles embedded in app bundles.
//!
//! `embedded.mobileprovision` is a CMS `SignedData` whose encapsulated
//! content is an XML plist. Its `Entitlements` dictionary is what an app
//! signed for that profile may claim.

use {
    crate::error::CodeSignError,
    chrono::{DateTime, Utc},
    cryptographic_message_syntax::SignedData,
    log::debug,
    std::{path::Path, time::SystemTime},
};

/// File name of the profile inside an app bundle.
pub const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";

fn malformed(message: impl ToString) -> CodeSignError {
    CodeSignError::ProvisioningProfileMalformed(message.to_string())
}

/// Locate the XML plist inside profile data without decoding the CMS.
fn find_xml_plist(data: &[u8]) -> Option<&[u8]> {
    let start = data.windows(5).position(|w| w == b"<?xml")?;
    let end = data[start..]
        .windows(8)
        .position(|w| w == b"</plist>")
        .map(|p| start + p + 8)?;

    Some(&data[start..end])
}

/// A parsed provisioning profile.
#[derive(Clone, Debug)]
pub struct ProvisioningProfile {
    plist: plist::Dictionary,
}

impl ProvisioningProfile {
    /// Parse profile data.
    ///
    /// The plist is taken from the CMS content. Data that doesn't decode as
    /// CMS is scanned for an embedded XML plist instead.
    pub fn from_data(data: &[u8]) -> Result<Self, CodeSignError> {
        let content = match SignedData::parse_ber(data) {
            Ok(signed_data) => signed_data
                .signed_content()
                .map(|c| c.to_vec())
                .ok_or_else(|| malformed("CMS data has no content"))?,
            Err(e) => {
                debug!("profile is not CMS ({}); scanning for plist", e);
                find_xml_plist(data)
                    .ok_or_else(|| malformed("no plist found in profile"))?
                    .to_vec()
            }
        };

        let plist = plist::Value::from_reader(std::io::Cursor::new(content))?
            .into_dictionary()
            .ok_or_else(|| malformed("profile plist is not a dictionary"))?;

        Ok(Self { plist })
    }

    pub fn from_file(path: &Path) -> Result<Self, CodeSignError> {
        Self::from_data(&std::fs::read(path)?)
    }

    /// The profile's `Name`.
    pub fn name(&self) -> Option<&str> {
        self.plist.get("Name").and_then(|v| v.as_string())
    }

    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        self.plist
            .get("ExpirationDate")
            .and_then(|v| v.as_date())
            .map(|date| DateTime::<Utc>::from(SystemTime::from(date)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration_date(), Some(expires) if expires < now)
    }

    /// The `Entitlements` dictionary serialized as an XML plist.
    pub fn entitlements_xml(&self) -> Result<Option<String>, CodeSignError> {
        let entitlements = match self.plist.get("Entitlements") {
            Some(value) => value,
            None => return Ok(None),
        };

        if entitlements.as_dictionary().is_none() {
            return Err(malformed("Entitlements is not a dictionary"));
        }

        let mut xml = vec![];
        entitlements.to_writer_xml(&mut xml)?;

        Ok(Some(String::from_utf8(xml).map_err(malformed)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::identity::tests::test_identity,
        cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder},
        indoc::indoc,
    };

    pub(crate) const PROFILE_PLIST: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
            <key>Name</key>
            <string>MyApp Development</string>
            <key>ExpirationDate</key>
            <date>2020-01-01T00:00:00Z</date>
            <key>Entitlements</key>
            <dict>
                <key>application-identifier</key>
                <string>TEAM123456.com.example.app</string>
                <key>get-task-allow</key>
                <true/>
            </dict>
        </dict>
        </plist>
    "#};

    /// A profile wrapped in CMS like the ones Apple issues.
    pub(crate) fn signed_profile() -> Vec<u8> {
        let identity = test_identity();

        SignedDataBuilder::default()
            .content_inline(PROFILE_PLIST.as_bytes().to_vec())
            .certificate(identity.certificate().clone())
            .signer(SignerBuilder::new(
                identity.signing_key(),
                identity.certificate().clone(),
            ))
            .build_der()
            .unwrap()
    }

    #[test]
    fn parse_cms_profile() {
        let profile = ProvisioningProfile::from_data(&signed_profile()).unwrap();

        assert_eq!(profile.name(), Some("MyApp Development"));
        assert!(profile.is_expired_at(Utc::now()));

        let entitlements = profile.entitlements_xml().unwrap().unwrap();
        assert!(entitlements.contains("TEAM123456.com.example.app"));
        assert!(entitlements.contains("get-task-allow"));
    }

    #[test]
    fn parse_bare_plist() {
        let mut data = b"\x30\x82junk".to_vec();
        data.extend_from_slice(PROFILE_PLIST.as_bytes());

        let profile = ProvisioningProfile::from_data(&data).unwrap();
        assert!(profile.entitlements_xml().unwrap().is_some());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            ProvisioningProfile::from_data(b"not a profile"),
            Err(CodeSignError::ProvisioningProfileMalformed(_))
        ));
    }
}
