// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, std::path::PathBuf, thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Errors that a context may absorb when its skip policy allows.
///
/// These denote a component that can be left behind while the rest of
/// the bundle graph is still signed or verified.
#[derive(Debug, Error)]
pub enum CodeSignSkippableError {
    #[error("bundle does not contain its main executable: {0}")]
    MissingExecutable(PathBuf),

    #[error("unable to use provisioning profile {0}: {1}")]
    ProvisioningProfile(PathBuf, String),

    #[error("{0} hash mismatch")]
    SpecialSlotMismatch(String),

    #[error("signature not trusted: {0}")]
    SignatureNotTrusted(String),
}

/// Unified error type for bundle code signing.
#[derive(Debug, Error)]
pub enum CodeSignError {
    #[error("{0}")]
    CliGeneralError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("error walking directory: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("not a signable bundle or Mach-O binary: {0}")]
    InvalidBundle(String),

    #[error("bundle Info.plist does not define CFBundleIdentifier: {0}")]
    BundleNoIdentifier(PathBuf),

    #[error("toolchain error: {0}")]
    Toolchain(String),

    #[error("signature of {size} bytes does not fit in reserved space of {reserved} bytes")]
    SignatureOverflow { size: usize, reserved: usize },

    #[error("invalid Mach-O binary: {0}")]
    MachO(String),

    #[error("unsupported CPU type in Mach-O binary: {0:#x}")]
    UnsupportedCpuType(u32),

    #[error("signing key error: {0}")]
    SigningKey(String),

    #[error("PEM error: {0}")]
    CertificatePem(pem::PemError),

    #[error("certificate chain error: {0}")]
    CertificateChain(String),

    #[error("incorrect password given when decrypting PFX data")]
    PfxBadPassword,

    #[error("error parsing PFX data: {0}")]
    PfxParseError(String),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("unsupported code directory version: {0:#x}")]
    CodeDirectoryUnsupportedVersion(u32),

    #[error("invalid code page size: {0}")]
    InvalidPageSize(String),

    #[error("entitlements data not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("unknown code requirement opcode: {0}")]
    RequirementUnknownOpcode(u32),

    #[error("unknown code requirement match expression: {0}")]
    RequirementUnknownMatchExpression(u32),

    #[error("code requirement data malformed: {0}")]
    RequirementMalformed(&'static str),

    #[error("malformed provisioning profile: {0}")]
    ProvisioningProfileMalformed(String),

    #[error("plist parse error in code resources: {0}")]
    ResourcesPlistParse(String),

    #[error("bad regular expression in code resources: {0}; {1}")]
    ResourcesBadRegex(String, regex::Error),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("binary does not have code signature data")]
    BinaryNoCodeSignature,

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("operation aborted")]
    Aborted,

    #[error("in {identifier}: {source}")]
    Component {
        identifier: String,
        source: Box<CodeSignError>,
    },

    #[error(transparent)]
    Skippable(#[from] CodeSignSkippableError),
}

impl CodeSignError {
    /// Whether this error may be recorded as a warning instead of aborting.
    ///
    /// Classification is a property of the error kind. Whether a context
    /// actually absorbs it depends on its skip policy.
    pub fn is_skippable(&self) -> bool {
        match self {
            Self::Skippable(_) => true,
            Self::Component { source, .. } => source.is_skippable(),
            _ => false,
        }
    }

    /// Attach a component identifier to this error.
    ///
    /// Nested identifiers are joined so the message names the full chain
    /// from the outermost component to the failing one.
    pub fn in_component(self, identifier: &str) -> Self {
        match self {
            Self::Component {
                identifier: inner,
                source,
            } => Self::Component {
                identifier: format!("{} > {}", identifier, inner),
                source,
            },
            Self::Aborted => Self::Aborted,
            err => Self::Component {
                identifier: identifier.to_string(),
                source: Box::new(err),
            },
        }
    }

    /// Strip component annotations to obtain the underlying error.
    pub fn root_cause(&self) -> &CodeSignError {
        match self {
            Self::Component { source, .. } => source.root_cause(),
            err => err,
        }
    }
}
