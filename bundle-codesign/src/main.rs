// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    bundle_codesign::{
        code_hash::paged_digests, embedded_signature::DigestType, macho::parse_slices, sign,
        verify, CodeSignError, SignOptions, SigningIdentity, SkipPolicy, VerifyContext,
    },
    clap::{Arg, ArgMatches, Command},
    log::{error, warn, LevelFilter},
    std::{path::Path, str::FromStr, sync::Arc, time::Duration},
};

const SUPPORTED_HASHES: &[&str; 5] = &["sha1", "sha256", "sha256-truncated", "sha384", "sha512"];

const SIGN_ABOUT: &str = "\
Sign an app bundle, framework, app extension, dylib or Mach-O executable.

Nested frameworks, app extensions, apps and dylibs are signed before the
component containing them, whose _CodeSignature/CodeResources then seals
them by code directory hash.

A signing certificate and private key are required. Either give a PKCS#12
file via --p12-file (with --p12-password or --p12-password-file) or PEM
files holding the certificate chain and a PKCS#8 private key via
--pem-source.

Binaries lacking room for a signature need codesign_allocate from an
Xcode toolchain. It is taken from --codesign-allocate, the
CODESIGN_ALLOCATE environment variable or PATH, in that order.
";

fn bad_argument(message: impl ToString) -> CodeSignError {
    CodeSignError::CliGeneralError(message.to_string())
}

fn skip_policy(args: &ArgMatches) -> SkipPolicy {
    if args.is_present("skip_errors") {
        SkipPolicy::Record
    } else {
        SkipPolicy::Escalate
    }
}

fn load_identity(args: &ArgMatches) -> Result<SigningIdentity, CodeSignError> {
    if let Some(p12_path) = args.value_of("p12_file") {
        let p12_data = std::fs::read(p12_path)?;

        let password = if let Some(password) = args.value_of("p12_password") {
            password.to_string()
        } else if let Some(path) = args.value_of("p12_password_file") {
            std::fs::read_to_string(path)?
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        } else {
            return Err(bad_argument(
                "--p12-password or --p12-password-file is required with --p12-file",
            ));
        };

        return SigningIdentity::from_pkcs12(&p12_data, &password);
    }

    if let Some(sources) = args.values_of("pem_source") {
        let mut pem_data = vec![];
        for source in sources {
            warn!("reading PEM data from {}", source);
            pem_data.push(std::fs::read(source)?);
        }

        return SigningIdentity::from_pem_sources(pem_data.iter().map(|data| data.as_slice()));
    }

    Err(bad_argument(
        "a signing certificate is required; specify --p12-file or --pem-source",
    ))
}

fn command_sign(args: &ArgMatches) -> Result<(), CodeSignError> {
    let path = args
        .value_of("path")
        .ok_or_else(|| bad_argument("path is required"))?;

    let identity = load_identity(args)?;
    log::info!(
        "signing as {} (team {})",
        identity.name(),
        identity.team_id().unwrap_or("unknown")
    );

    let entitlements = match args.value_of("entitlements_xml_path") {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };

    let mut options = SignOptions::default().skip_policy(skip_policy(args));

    if let Some(exe) = args.value_of("codesign_allocate") {
        options = options.codesign_allocate(exe);
    }

    if let Some(timeout) = args.value_of("allocate_timeout") {
        let seconds = u64::from_str(timeout)
            .map_err(|_| bad_argument(format!("invalid --allocate-timeout: {}", timeout)))?;
        options = options.allocate_timeout(Duration::from_secs(seconds));
    }

    let outcome = sign(Path::new(path), Arc::new(identity), entitlements, options)?;

    if outcome.warnings.is_empty() {
        log::info!("signed {}", path);
    } else {
        warn!(
            "signed {} with {} component(s) skipped",
            path,
            outcome.warnings.len()
        );
    }

    Ok(())
}

fn command_verify(args: &ArgMatches) -> Result<(), CodeSignError> {
    let path = args
        .value_of("path")
        .ok_or_else(|| bad_argument("path is required"))?;

    let ctx = VerifyContext::new().with_skip_policy(skip_policy(args));
    let outcome = verify(Path::new(path), &ctx)?;

    for warning in &outcome.warnings {
        error!(
            "{}: {}",
            warning.identifier.as_deref().unwrap_or(path),
            warning.message
        );
    }

    if outcome.warnings.is_empty() {
        eprintln!("{} verifies", path);
        Ok(())
    } else {
        Err(CodeSignError::VerificationFailed(format!(
            "{} problem(s) found",
            outcome.warnings.len()
        )))
    }
}

fn command_compute_code_hashes(args: &ArgMatches) -> Result<(), CodeSignError> {
    let path = args
        .value_of("path")
        .ok_or_else(|| bad_argument("path is required"))?;
    let index = args.value_of("universal_index").unwrap_or("0");
    let index = usize::from_str(index)
        .map_err(|_| bad_argument(format!("invalid --universal-index: {}", index)))?;
    let hash_type = DigestType::try_from(args.value_of("hash").unwrap_or("sha256"))?;
    let page_size = args.value_of("page_size").unwrap_or("4096");
    let page_size = usize::from_str(page_size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| bad_argument(format!("invalid --page-size: {}", page_size)))?;

    let data = std::fs::read(path)?;
    let slice = parse_slices(&data)?
        .into_iter()
        .nth(index)
        .ok_or_else(|| bad_argument(format!("no Mach-O binary at index {}", index)))?;

    let code = slice
        .data(&data)?
        .get(..slice.code_limit())
        .ok_or_else(|| CodeSignError::MachO("code limit out of bounds".into()))?;

    for hash in paged_digests(code, hash_type, page_size)? {
        println!("{}", hex::encode(hash));
    }

    Ok(())
}

fn main_impl() -> Result<(), CodeSignError> {
    let app = Command::new("Apple bundle code signing")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign and verify Apple app bundles and their nested code")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign a bundle or Mach-O binary in place")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the bundle or binary to sign"),
            )
            .arg(
                Arg::new("p12_file")
                    .long("p12-file")
                    .alias("pfx-file")
                    .takes_value(true)
                    .conflicts_with("pem_source")
                    .help("Path to a PKCS#12 file containing the signing certificate and key"),
            )
            .arg(
                Arg::new("p12_password")
                    .long("p12-password")
                    .alias("pfx-password")
                    .takes_value(true)
                    .requires("p12_file")
                    .help("The password to use to open the --p12-file file"),
            )
            .arg(
                Arg::new("p12_password_file")
                    .long("p12-password-file")
                    .alias("pfx-password-file")
                    .takes_value(true)
                    .conflicts_with("p12_password")
                    .requires("p12_file")
                    .help("Path to file containing password for opening --p12-file file"),
            )
            .arg(
                Arg::new("pem_source")
                    .long("pem-source")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Path to a file with PEM encoded certificates and a private key"),
            )
            .arg(
                Arg::new("entitlements_xml_path")
                    .long("entitlements-xml-path")
                    .takes_value(true)
                    .help("Path to a plist file containing entitlements for every signed component"),
            )
            .arg(
                Arg::new("codesign_allocate")
                    .long("codesign-allocate")
                    .takes_value(true)
                    .help("Path to the codesign_allocate executable"),
            )
            .arg(
                Arg::new("allocate_timeout")
                    .long("allocate-timeout")
                    .takes_value(true)
                    .default_value("60")
                    .help("Seconds to wait for codesign_allocate before giving up"),
            )
            .arg(
                Arg::new("skip_errors")
                    .long("skip-errors")
                    .help("Record recoverable per-component failures and keep going"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Verify the signature of a bundle or Mach-O binary")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the bundle or binary to verify"),
            )
            .arg(
                Arg::new("skip_errors")
                    .long("skip-errors")
                    .help("Report recoverable problems instead of stopping at the first one"),
            ),
    );

    let app = app.subcommand(
        Command::new("compute-code-hashes")
            .about("Compute code hashes for a binary")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("path to Mach-O binary to examine"),
            )
            .arg(
                Arg::new("hash")
                    .long("hash")
                    .takes_value(true)
                    .possible_values(SUPPORTED_HASHES)
                    .default_value("sha256")
                    .help("Hashing algorithm to use"),
            )
            .arg(
                Arg::new("page_size")
                    .long("page-size")
                    .takes_value(true)
                    .default_value("4096")
                    .help("Chunk size to digest over"),
            )
            .arg(
                Arg::new("universal_index")
                    .long("universal-index")
                    .takes_value(true)
                    .default_value("0")
                    .help("Index of Mach-O binary to operate on within a universal/fat binary"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("compute-code-hashes", args)) => command_compute_code_hashes(args),
        Some(("sign", args)) => command_sign(args),
        Some(("verify", args)) => command_verify(args),
        _ => Err(bad_argument("unknown command")),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
