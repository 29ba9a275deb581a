// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing for Apple application bundles.
//!
//! This crate signs `.app` bundles and the code nested in them (frameworks,
//! app extensions, dylibs) without Apple's `codesign` tool. Nested components
//! are signed first so the enclosing bundle can seal them by hash in its
//! `_CodeSignature/CodeResources` resource envelope. Every Mach-O slice then
//! receives an embedded signature: SHA-1 and SHA-256 code directories, a
//! designated requirement, optional entitlements and a CMS signature made
//! with the supplied [SigningIdentity].
//!
//! Space for the signature has to exist in the binary. When it is missing
//! or too small, `codesign_allocate` from an Xcode toolchain is invoked to
//! rewrite load commands. Binaries that already carry a large enough
//! `LC_CODE_SIGNATURE` region are signed without it.
//!
//! # Getting started
//!
//! [signing::sign] is the main entry point:
//!
//! ```no_run
//! use {
//!     bundle_codesign::{sign, SignOptions, SigningIdentity},
//!     std::{path::Path, sync::Arc},
//! };
//!
//! let identity = SigningIdentity::from_pkcs12(
//!     &std::fs::read("identity.p12").unwrap(),
//!     "password",
//! ).unwrap();
//!
//! let outcome = sign(
//!     Path::new("MyApp.app"),
//!     Arc::new(identity),
//!     None,
//!     SignOptions::default(),
//! ).unwrap();
//!
//! for warning in outcome.warnings {
//!     println!("{:?}: {}", warning.identifier, warning.message);
//! }
//! ```
//!
//! [verify::verify] checks a signed bundle the same way, component by
//! component.

pub mod allocate;
pub mod apple_certificates;
pub mod bundle;
pub mod cms;
pub mod code_directory;
pub mod code_hash;
pub mod code_requirement;
pub mod code_resources;
pub mod context;
pub mod embedded_signature;
pub mod embedded_signature_builder;
mod error;
pub use error::*;
pub mod identity;
pub mod macho;
pub mod macho_signing;
pub mod provisioning;
pub mod signing;
pub mod verify;

pub use {
    allocate::AllocatorSettings,
    bundle::{Bundle, BundleKind},
    code_resources::{CodeResources, CodeResourcesBuilder, CodeResourcesRule},
    context::{
        AbortHandle, Context, DiagnosticSink, LogSink, MemorySink, SignContext, SignOutcome,
        SkipPolicy, SkippedComponent, VerifyContext,
    },
    identity::SigningIdentity,
    macho_signing::SignedMachOInfo,
    signing::{sign, SignOptions},
    verify::verify,
};
