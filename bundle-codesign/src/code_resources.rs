// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The resource envelope of a bundle.
//!
//! Bundles carry a `_CodeSignature/CodeResources` XML plist recording the
//! digest of every sealed file outside the main executable. The executable's
//! code directory records the digest of this file in its resource special
//! slot, so resource integrity is verified transitively.
//!
//! The plist has two generations of content. `files` and `rules` are the
//! original format holding SHA-1 digests. `files2` and `rules2` add SHA-256
//! digests, symlinks and nested code. Nested code (frameworks, plugins,
//! dylibs) is sealed by its code directory hash and designated requirement
//! instead of by its file content.
//!
//! We coerce [plist::Value] instances by hand since entry values are
//! heterogeneous (`<data>` or `<dict>`, `<true/>` or `<dict>`).

use {
    crate::{
        embedded_signature::DigestType, error::CodeSignError, macho_signing::SignedMachOInfo,
    },
    log::{debug, info},
    plist::{Dictionary, Value},
    rayon::prelude::*,
    std::{
        cmp::Ordering,
        collections::BTreeMap,
        io::Write,
        path::{Path, PathBuf},
    },
    walkdir::WalkDir,
};

/// Directory holding signature artifacts inside a bundle.
pub const CODE_SIGNATURE_DIR: &str = "_CodeSignature";

/// Name of the resource envelope inside [CODE_SIGNATURE_DIR].
pub const CODE_RESOURCES_FILE: &str = "CodeResources";

/// Legacy link at the bundle root pointing at the resource envelope.
pub const CODE_RESOURCES_LINK: &str = "CodeResources";

/// Path of the resource envelope for a bundle rooted at `bundle`.
pub fn code_resources_path(bundle: &Path) -> PathBuf {
    bundle.join(CODE_SIGNATURE_DIR).join(CODE_RESOURCES_FILE)
}

fn parse_error(message: String) -> CodeSignError {
    CodeSignError::ResourcesPlistParse(message)
}

fn expect_bool(value: &Value, what: &str) -> Result<bool, CodeSignError> {
    value
        .as_boolean()
        .ok_or_else(|| parse_error(format!("expected bool for {}, got {:?}", what, value)))
}

fn expect_data(value: &Value, what: &str) -> Result<Vec<u8>, CodeSignError> {
    value
        .as_data()
        .map(|d| d.to_vec())
        .ok_or_else(|| parse_error(format!("expected <data> for {}, got {:?}", what, value)))
}

fn expect_dict<'a>(value: &'a Value, what: &str) -> Result<&'a Dictionary, CodeSignError> {
    value
        .as_dictionary()
        .ok_or_else(|| parse_error(format!("expected <dict> for {}, got {:?}", what, value)))
}

/// A `files` entry: a bare SHA-1 digest or a dict marking it optional.
#[derive(Clone, PartialEq)]
enum FilesValue {
    Required(Vec<u8>),
    Optional(Vec<u8>),
}

impl std::fmt::Debug for FilesValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Required(digest) => write!(f, "{} (required)", hex::encode(digest)),
            Self::Optional(digest) => write!(f, "{} (optional)", hex::encode(digest)),
        }
    }
}

impl TryFrom<&Value> for FilesValue {
    type Error = CodeSignError;

    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        match v {
            Value::Data(digest) => Ok(Self::Required(digest.to_vec())),
            Value::Dictionary(dict) => {
                let mut digest = None;
                let mut optional = false;

                for (key, value) in dict.iter() {
                    match key.as_str() {
                        "hash" => digest = Some(expect_data(value, "files hash")?),
                        "optional" => optional = expect_bool(value, "files optional")?,
                        key => {
                            return Err(parse_error(format!(
                                "unexpected key in files dict: {}",
                                key
                            )));
                        }
                    }
                }

                let digest = digest.ok_or_else(|| parse_error("files dict missing hash".into()))?;

                Ok(if optional {
                    Self::Optional(digest)
                } else {
                    Self::Required(digest)
                })
            }
            _ => Err(parse_error(format!(
                "bad value in files <dict>; expected <data> or <dict>, got {:?}",
                v
            ))),
        }
    }
}

impl From<&FilesValue> for Value {
    fn from(v: &FilesValue) -> Self {
        match v {
            FilesValue::Required(digest) => Self::Data(digest.to_vec()),
            FilesValue::Optional(digest) => {
                let mut dict = Dictionary::new();
                dict.insert("hash".to_string(), Value::Data(digest.to_vec()));
                dict.insert("optional".to_string(), Value::Boolean(true));

                Self::Dictionary(dict)
            }
        }
    }
}

/// A `files2` entry.
#[derive(Clone, Default, PartialEq)]
struct Files2Value {
    cdhash: Option<Vec<u8>>,
    hash: Option<Vec<u8>>,
    hash2: Option<Vec<u8>>,
    optional: Option<bool>,
    requirement: Option<String>,
    symlink: Option<String>,
}

impl std::fmt::Debug for Files2Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Files2Value")
            .field("cdhash", &self.cdhash.as_ref().map(hex::encode))
            .field("hash", &self.hash.as_ref().map(hex::encode))
            .field("hash2", &self.hash2.as_ref().map(hex::encode))
            .field("optional", &self.optional)
            .field("requirement", &self.requirement)
            .field("symlink", &self.symlink)
            .finish()
    }
}

impl TryFrom<&Value> for Files2Value {
    type Error = CodeSignError;

    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        let dict = expect_dict(v, "files2 entry")?;

        let mut res = Self::default();

        for (key, value) in dict.iter() {
            match key.as_str() {
                "cdhash" => res.cdhash = Some(expect_data(value, "files2 cdhash")?),
                "hash" => res.hash = Some(expect_data(value, "files2 hash")?),
                "hash2" => res.hash2 = Some(expect_data(value, "files2 hash2")?),
                "optional" => res.optional = Some(expect_bool(value, "files2 optional")?),
                "requirement" => {
                    res.requirement = Some(
                        value
                            .as_string()
                            .ok_or_else(|| {
                                parse_error(format!(
                                    "expected string for requirement key, got {:?}",
                                    value
                                ))
                            })?
                            .to_string(),
                    );
                }
                "symlink" => {
                    res.symlink = Some(
                        value
                            .as_string()
                            .ok_or_else(|| {
                                parse_error(format!(
                                    "expected string for symlink key, got {:?}",
                                    value
                                ))
                            })?
                            .to_string(),
                    );
                }
                key => {
                    return Err(parse_error(format!(
                        "unexpected key in files2 dict entry: {}",
                        key
                    )));
                }
            }
        }

        Ok(res)
    }
}

impl From<&Files2Value> for Value {
    fn from(v: &Files2Value) -> Self {
        let mut dict = Dictionary::new();

        if let Some(cdhash) = &v.cdhash {
            dict.insert("cdhash".to_string(), Value::Data(cdhash.to_vec()));
        }
        if let Some(hash) = &v.hash {
            dict.insert("hash".to_string(), Value::Data(hash.to_vec()));
        }
        if let Some(hash2) = &v.hash2 {
            dict.insert("hash2".to_string(), Value::Data(hash2.to_vec()));
        }
        if let Some(optional) = &v.optional {
            dict.insert("optional".to_string(), Value::Boolean(*optional));
        }
        if let Some(requirement) = &v.requirement {
            dict.insert(
                "requirement".to_string(),
                Value::String(requirement.to_string()),
            );
        }
        if let Some(symlink) = &v.symlink {
            dict.insert("symlink".to_string(), Value::String(symlink.to_string()));
        }

        Value::Dictionary(dict)
    }
}

/// A `rules` entry. `<true/>` means required, `<false/>` omitted.
#[derive(Clone, Debug, PartialEq)]
struct RulesValue {
    omit: bool,
    required: bool,
    weight: Option<f64>,
}

impl TryFrom<&Value> for RulesValue {
    type Error = CodeSignError;

    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        match v {
            Value::Boolean(required) => Ok(Self {
                omit: !required,
                required: *required,
                weight: None,
            }),
            Value::Dictionary(dict) => {
                let mut omit = false;
                let mut optional = false;
                let mut weight = None;

                for (key, value) in dict {
                    match key.as_str() {
                        "omit" => omit = expect_bool(value, "rules omit")?,
                        "optional" => optional = expect_bool(value, "rules optional")?,
                        "weight" => {
                            weight = Some(value.as_real().ok_or_else(|| {
                                parse_error(format!(
                                    "rules weight key value not a real, got {:?}",
                                    value
                                ))
                            })?);
                        }
                        key => {
                            return Err(parse_error(format!("extra key in rules dict: {}", key)));
                        }
                    }
                }

                Ok(Self {
                    omit,
                    required: !optional,
                    weight,
                })
            }
            _ => Err(parse_error("invalid value for rules entry".to_string())),
        }
    }
}

impl From<&RulesValue> for Value {
    fn from(v: &RulesValue) -> Self {
        if v.required && !v.omit && v.weight.is_none() {
            Value::Boolean(true)
        } else {
            let mut dict = Dictionary::new();

            if v.omit {
                dict.insert("omit".to_string(), Value::Boolean(true));
            }
            if !v.required {
                dict.insert("optional".to_string(), Value::Boolean(true));
            }
            if let Some(weight) = v.weight {
                dict.insert("weight".to_string(), Value::Real(weight));
            }

            Value::Dictionary(dict)
        }
    }
}

/// A `rules2` entry.
#[derive(Clone, Debug, Default, PartialEq)]
struct Rules2Value {
    nested: bool,
    omit: bool,
    optional: bool,
    weight: Option<f64>,
}

impl TryFrom<&Value> for Rules2Value {
    type Error = CodeSignError;

    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        if let Value::Boolean(true) = v {
            return Ok(Self::default());
        }

        let dict = expect_dict(v, "rules2 entry")?;
        let mut res = Self::default();

        for (key, value) in dict.iter() {
            match key.as_str() {
                "nested" => res.nested = expect_bool(value, "rules2 nested")?,
                "omit" => res.omit = expect_bool(value, "rules2 omit")?,
                "optional" => res.optional = expect_bool(value, "rules2 optional")?,
                "weight" => {
                    res.weight = Some(value.as_real().ok_or_else(|| {
                        parse_error(format!(
                            "expected real for rules2 weight key, got {:?}",
                            value
                        ))
                    })?);
                }
                key => {
                    return Err(parse_error(format!(
                        "unexpected key in rules2 dict entry: {}",
                        key
                    )));
                }
            }
        }

        Ok(res)
    }
}

impl From<&Rules2Value> for Value {
    fn from(v: &Rules2Value) -> Self {
        let mut dict = Dictionary::new();

        if v.nested {
            dict.insert("nested".to_string(), Value::Boolean(true));
        }
        if v.omit {
            dict.insert("omit".to_string(), Value::Boolean(true));
        }
        if v.optional {
            dict.insert("optional".to_string(), Value::Boolean(true));
        }
        if let Some(weight) = v.weight {
            dict.insert("weight".to_string(), Value::Real(weight));
        }

        if dict.is_empty() {
            Value::Boolean(true)
        } else {
            Value::Dictionary(dict)
        }
    }
}

/// A rule deciding how a path in the bundle is sealed.
///
/// Represents both `<rules>` and `<rules2>` entries. Patterns match
/// case-insensitively against the bundle relative path, since the file
/// systems bundles live on usually are.
#[derive(Clone, Debug)]
pub struct CodeResourcesRule {
    /// The `<key>` in the `<rules>` or `<rules2>` dict.
    pub pattern: String,

    /// Exclusion rules are internal to the builder and never serialized.
    pub exclude: bool,

    pub nested: bool,

    pub omit: bool,

    pub optional: bool,

    pub weight: Option<u32>,

    re: regex::Regex,
}

impl PartialEq for CodeResourcesRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.exclude == other.exclude
            && self.nested == other.nested
            && self.omit == other.omit
            && self.optional == other.optional
            && self.weight == other.weight
    }
}

impl Eq for CodeResourcesRule {}

impl PartialOrd for CodeResourcesRule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeResourcesRule {
    /// Exclusions sort first, then heavier rules.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .exclude
            .cmp(&self.exclude)
            .then_with(|| other.weight.unwrap_or(1).cmp(&self.weight.unwrap_or(1)))
    }
}

impl CodeResourcesRule {
    pub fn new(pattern: impl ToString) -> Result<Self, CodeSignError> {
        let pattern = pattern.to_string();

        let re = regex::RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| CodeSignError::ResourcesBadRegex(pattern.clone(), e))?;

        Ok(Self {
            pattern,
            exclude: false,
            nested: false,
            omit: false,
            optional: false,
            weight: None,
            re,
        })
    }

    #[must_use]
    pub fn exclude(mut self) -> Self {
        self.exclude = true;
        self
    }

    #[must_use]
    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    #[must_use]
    pub fn omit(mut self) -> Self {
        self.omit = true;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn weight(mut self, v: u32) -> Self {
        self.weight = Some(v);
        self
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.re.is_match(path)
    }

    fn from_rules_value(pattern: &str, v: &RulesValue) -> Result<Self, CodeSignError> {
        let mut rule = Self::new(pattern)?;
        rule.omit = v.omit;
        rule.optional = !v.required;
        rule.weight = v.weight.map(|w| w as u32);

        Ok(rule)
    }

    fn from_rules2_value(pattern: &str, v: &Rules2Value) -> Result<Self, CodeSignError> {
        let mut rule = Self::new(pattern)?;
        rule.nested = v.nested;
        rule.omit = v.omit;
        rule.optional = v.optional;
        rule.weight = v.weight.map(|w| w as u32);

        Ok(rule)
    }
}

/// Find the highest priority rule matching a path.
fn find_rule<'r>(rules: &'r [CodeResourcesRule], path: &str) -> Option<&'r CodeResourcesRule> {
    rules.iter().find(|rule| rule.is_match(path))
}

/// A parsed or generated `_CodeSignature/CodeResources` plist.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodeResources {
    files: BTreeMap<String, FilesValue>,
    files2: BTreeMap<String, Files2Value>,
    rules: BTreeMap<String, RulesValue>,
    rules2: BTreeMap<String, Rules2Value>,
}

impl CodeResources {
    /// Construct an instance by parsing an XML plist.
    pub fn from_xml(xml: &[u8]) -> Result<Self, CodeSignError> {
        let plist = Value::from_reader_xml(xml)?;

        let dict = plist
            .into_dictionary()
            .ok_or_else(|| parse_error("plist root element should be a <dict>".into()))?;

        let mut res = Self::default();

        for (key, value) in dict.iter() {
            let entries = expect_dict(value, key)?;

            match key.as_ref() {
                "files" => {
                    for (key, value) in entries {
                        res.files.insert(key.to_string(), FilesValue::try_from(value)?);
                    }
                }
                "files2" => {
                    for (key, value) in entries {
                        res.files2
                            .insert(key.to_string(), Files2Value::try_from(value)?);
                    }
                }
                "rules" => {
                    for (key, value) in entries {
                        res.rules.insert(key.to_string(), RulesValue::try_from(value)?);
                    }
                }
                "rules2" => {
                    for (key, value) in entries {
                        res.rules2
                            .insert(key.to_string(), Rules2Value::try_from(value)?);
                    }
                }
                key => {
                    return Err(parse_error(format!("unexpected key in root dict: {}", key)));
                }
            }
        }

        Ok(res)
    }

    /// Read the resource envelope of a bundle.
    pub fn from_bundle(bundle: &Path) -> Result<Self, CodeSignError> {
        Self::from_xml(&std::fs::read(code_resources_path(bundle))?)
    }

    /// Serialize to XML in the formatting Apple's tools emit.
    pub fn to_writer_xml(&self, mut writer: impl Write) -> Result<(), CodeSignError> {
        let value = Value::from(self);

        // Apple writes `<true/>` and `<dict/>` without a space and ends the
        // document with a newline.
        let mut data = Vec::<u8>::new();
        value.to_writer_xml(&mut data)?;

        let data = String::from_utf8_lossy(&data)
            .replace("<dict />", "<dict/>")
            .replace("<true />", "<true/>");

        writer.write_all(data.as_bytes())?;
        writer.write_all(b"\n")?;

        Ok(())
    }

    pub fn to_xml_bytes(&self) -> Result<Vec<u8>, CodeSignError> {
        let mut data = vec![];
        self.to_writer_xml(&mut data)?;

        Ok(data)
    }

    /// Write to `_CodeSignature/CodeResources` under `bundle`.
    ///
    /// Returns the bytes written, whose digest goes into the resource slot.
    pub fn write_to_bundle(&self, bundle: &Path) -> Result<Vec<u8>, CodeSignError> {
        let data = self.to_xml_bytes()?;
        let path = code_resources_path(bundle);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &data)?;

        Ok(data)
    }

    pub fn add_rule(&mut self, rule: &CodeResourcesRule) {
        self.rules.insert(
            rule.pattern.clone(),
            RulesValue {
                omit: rule.omit,
                required: !rule.optional,
                weight: rule.weight.map(|x| x as f64),
            },
        );
    }

    pub fn add_rule2(&mut self, rule: &CodeResourcesRule) {
        self.rules2.insert(
            rule.pattern.clone(),
            Rules2Value {
                nested: rule.nested,
                omit: rule.omit,
                optional: rule.optional,
                weight: rule.weight.map(|x| x as f64),
            },
        );
    }

    /// Sealing rules of the original generation.
    pub fn rules(&self) -> Result<Vec<CodeResourcesRule>, CodeSignError> {
        self.rules
            .iter()
            .map(|(pattern, v)| CodeResourcesRule::from_rules_value(pattern, v))
            .collect()
    }

    /// Sealing rules of the second generation.
    pub fn rules2(&self) -> Result<Vec<CodeResourcesRule>, CodeSignError> {
        self.rules2
            .iter()
            .map(|(pattern, v)| CodeResourcesRule::from_rules2_value(pattern, v))
            .collect()
    }

    /// Paths sealed in `files2`.
    pub fn files2_paths(&self) -> impl Iterator<Item = &str> {
        self.files2.keys().map(|k| k.as_str())
    }

    /// Paths sealed in `files`.
    pub fn files_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|k| k.as_str())
    }

    /// The `cdhash` recorded for nested code at `path`.
    pub fn nested_cdhash(&self, path: &str) -> Option<&[u8]> {
        self.files2.get(path).and_then(|v| v.cdhash.as_deref())
    }

    fn seal_file_v1(&mut self, path: &str, sha1: Vec<u8>, optional: bool) {
        self.files.insert(
            path.to_string(),
            if optional {
                FilesValue::Optional(sha1)
            } else {
                FilesValue::Required(sha1)
            },
        );
    }

    fn seal_file_v2(&mut self, path: &str, sha1: Vec<u8>, sha256: Vec<u8>, optional: bool) {
        self.files2.insert(
            path.to_string(),
            Files2Value {
                hash: Some(sha1),
                hash2: Some(sha256),
                optional: if optional { Some(true) } else { None },
                ..Default::default()
            },
        );
    }

    /// Seal a symlink by its target. The target is never followed.
    pub fn seal_symlink(&mut self, path: impl ToString, target: impl ToString) {
        self.files2.insert(
            path.to_string(),
            Files2Value {
                symlink: Some(target.to_string()),
                ..Default::default()
            },
        );
    }

    /// Seal already signed nested code by its code directory hash.
    pub fn seal_nested(
        &mut self,
        path: impl ToString,
        info: &SignedMachOInfo,
    ) -> Result<(), CodeSignError> {
        self.files2.insert(
            path.to_string(),
            Files2Value {
                cdhash: Some(info.cdhash()?),
                requirement: info.designated_code_requirement.clone(),
                ..Default::default()
            },
        );

        Ok(())
    }

    /// Compare a sealed envelope (`self`) with one rebuilt from disk.
    ///
    /// Every rebuilt entry must be sealed with identical content and every
    /// sealed entry must still exist.
    pub fn compare(&self, actual: &CodeResources) -> Result<(), CodeSignError> {
        fn compare_maps<V: PartialEq + std::fmt::Debug>(
            what: &str,
            sealed: &BTreeMap<String, V>,
            actual: &BTreeMap<String, V>,
        ) -> Result<(), CodeSignError> {
            for (path, value) in actual {
                match sealed.get(path) {
                    None => {
                        return Err(CodeSignError::VerificationFailed(format!(
                            "{}: file not present in seal: {}",
                            what, path
                        )));
                    }
                    Some(expected) if expected != value => {
                        return Err(CodeSignError::VerificationFailed(format!(
                            "{}: file signature mismatch for {}: computed {:?}, expected {:?}",
                            what, path, value, expected
                        )));
                    }
                    Some(_) => {}
                }
            }

            let missing = sealed
                .keys()
                .filter(|path| !actual.contains_key(*path))
                .cloned()
                .collect::<Vec<_>>();

            if !missing.is_empty() {
                return Err(CodeSignError::VerificationFailed(format!(
                    "{}: sealed files missing from bundle: {}",
                    what,
                    missing.join(",")
                )));
            }

            Ok(())
        }

        compare_maps("files", &self.files, &actual.files)?;
        compare_maps("files2", &self.files2, &actual.files2)
    }
}

impl From<&CodeResources> for Value {
    fn from(cr: &CodeResources) -> Self {
        fn to_dict<V>(map: &BTreeMap<String, V>) -> Value
        where
            for<'v> &'v V: Into<Value>,
        {
            Value::Dictionary(
                map.iter()
                    .map(|(key, value)| (key.to_string(), value.into()))
                    .collect::<Dictionary>(),
            )
        }

        let mut dict = Dictionary::new();

        dict.insert("files".to_string(), to_dict(&cr.files));
        dict.insert("files2".to_string(), to_dict(&cr.files2));

        if !cr.rules.is_empty() {
            dict.insert("rules".to_string(), to_dict(&cr.rules));
        }
        if !cr.rules2.is_empty() {
            dict.insert("rules2".to_string(), to_dict(&cr.rules2));
        }

        Value::Dictionary(dict)
    }
}

/// Work item discovered while walking a bundle.
enum PendingSeal<'n> {
    File {
        relative: String,
        path: PathBuf,
        optional: bool,
    },
    Symlink {
        relative: String,
        target: String,
    },
    Nested {
        relative: String,
        info: &'n SignedMachOInfo,
    },
}

/// Builds a [CodeResources] by walking a bundle on disk.
#[derive(Clone, Debug, Default)]
pub struct CodeResourcesBuilder {
    rules: Vec<CodeResourcesRule>,
    rules2: Vec<CodeResourcesRule>,
    resources: CodeResources,
}

impl CodeResourcesBuilder {
    /// Default rules for a bundle with a `Resources/` directory.
    pub fn default_resources_rules() -> Result<Self, CodeSignError> {
        let mut slf = Self::default();

        slf.add_rule(CodeResourcesRule::new("^version.plist$")?);
        slf.add_rule(CodeResourcesRule::new("^Resources/")?);
        slf.add_rule(
            CodeResourcesRule::new("^Resources/.*\\.lproj/")?
                .optional()
                .weight(1000),
        );
        slf.add_rule(CodeResourcesRule::new("^Resources/Base\\.lproj/")?.weight(1010));
        slf.add_rule(
            CodeResourcesRule::new("^Resources/.*\\.lproj/locversion.plist$")?
                .omit()
                .weight(1100),
        );

        slf.add_rule2(CodeResourcesRule::new("^.*")?);
        slf.add_rule2(CodeResourcesRule::new("^[^/]+$")?.nested().weight(10));
        slf.add_rule2(
            CodeResourcesRule::new(
                "^(Frameworks|SharedFrameworks|PlugIns|Plug-ins|XPCServices|Helpers|MacOS|Library/(Automator|Spotlight|LoginItems))/",
            )?
            .nested()
            .weight(10),
        );
        slf.add_rule2(CodeResourcesRule::new(".*\\.dSYM($|/)")?.weight(11));
        slf.add_rule2(
            CodeResourcesRule::new("^(.*/)?\\.DS_Store$")?
                .omit()
                .weight(2000),
        );
        slf.add_rule2(CodeResourcesRule::new("^Info\\.plist$")?.omit().weight(20));
        slf.add_rule2(CodeResourcesRule::new("^version\\.plist$")?.weight(20));
        slf.add_rule2(CodeResourcesRule::new("^embedded\\.provisionprofile$")?.weight(20));
        slf.add_rule2(CodeResourcesRule::new("^PkgInfo$")?.omit().weight(20));
        slf.add_rule2(CodeResourcesRule::new("^Resources/")?.weight(20));
        slf.add_rule2(
            CodeResourcesRule::new("^Resources/.*\\.lproj/")?
                .optional()
                .weight(1000),
        );
        slf.add_rule2(CodeResourcesRule::new("^Resources/Base\\.lproj/")?.weight(1010));
        slf.add_rule2(
            CodeResourcesRule::new("^Resources/.*\\.lproj/locversion.plist$")?
                .omit()
                .weight(1100),
        );

        Ok(slf)
    }

    /// Default rules for a flat bundle, as iOS apps and frameworks are.
    pub fn default_no_resources_rules() -> Result<Self, CodeSignError> {
        let mut slf = Self::default();

        slf.add_rule(CodeResourcesRule::new("^.*")?);
        slf.add_rule(
            CodeResourcesRule::new("^.*\\.lproj/")?
                .optional()
                .weight(1000),
        );
        slf.add_rule(CodeResourcesRule::new("^Base\\.lproj/")?.weight(1010));
        slf.add_rule(
            CodeResourcesRule::new("^.*\\.lproj/locversion.plist$")?
                .omit()
                .weight(1100),
        );
        slf.add_rule(CodeResourcesRule::new("^version.plist$")?);

        slf.add_rule2(CodeResourcesRule::new("^.*")?);
        slf.add_rule2(CodeResourcesRule::new(".*\\.dSYM($|/)")?.weight(11));
        slf.add_rule2(
            CodeResourcesRule::new("^(.*/)?\\.DS_Store$")?
                .omit()
                .weight(2000),
        );
        slf.add_rule2(
            CodeResourcesRule::new("^(Frameworks|SharedFrameworks|PlugIns|Plug-ins|XPCServices|Helpers|MacOS|Library/(Automator|Spotlight|LoginItems))/")?
                .nested()
                .weight(10),
        );
        slf.add_rule2(CodeResourcesRule::new("^Info\\.plist$")?.omit().weight(20));
        slf.add_rule2(CodeResourcesRule::new("^version\\.plist$")?.weight(20));
        slf.add_rule2(CodeResourcesRule::new("^embedded\\.provisionprofile$")?.weight(20));
        slf.add_rule2(CodeResourcesRule::new("^PkgInfo$")?.omit().weight(20));
        slf.add_rule2(
            CodeResourcesRule::new("^.*\\.lproj/")?
                .optional()
                .weight(1000),
        );
        slf.add_rule2(CodeResourcesRule::new("^Base\\.lproj/")?.weight(1010));
        slf.add_rule2(
            CodeResourcesRule::new("^.*\\.lproj/locversion.plist$")?
                .omit()
                .weight(1100),
        );

        Ok(slf)
    }

    /// Rules for sealing the bundle rooted at `root`.
    ///
    /// Picks the default rule set by layout and excludes signature artifacts
    /// and the main executable.
    pub fn for_bundle(root: &Path, main_executable: Option<&str>) -> Result<Self, CodeSignError> {
        let mut slf = if root.join("Resources").is_dir() {
            Self::default_resources_rules()?
        } else {
            Self::default_no_resources_rules()?
        };

        slf.add_signature_exclusions(main_executable)?;

        Ok(slf)
    }

    /// Rules taken from an existing seal, for rebuilding it during verification.
    pub fn from_sealed(
        sealed: &CodeResources,
        main_executable: Option<&str>,
    ) -> Result<Self, CodeSignError> {
        let mut slf = Self::default();

        for rule in sealed.rules()? {
            slf.add_rule(rule);
        }
        for rule in sealed.rules2()? {
            slf.add_rule2(rule);
        }

        slf.add_signature_exclusions(main_executable)?;

        Ok(slf)
    }

    fn add_signature_exclusions(&mut self, main_executable: Option<&str>) -> Result<(), CodeSignError> {
        self.add_exclusion_rule(CodeResourcesRule::new(format!("^{}/", CODE_SIGNATURE_DIR))?.exclude());
        self.add_exclusion_rule(
            CodeResourcesRule::new(format!("^{}$", CODE_RESOURCES_LINK))?.exclude(),
        );

        if let Some(exe) = main_executable {
            self.add_exclusion_rule(
                CodeResourcesRule::new(format!("^{}$", regex::escape(exe)))?.exclude(),
            );
        }

        Ok(())
    }

    /// Add a rule to the `<rules>` section.
    pub fn add_rule(&mut self, rule: CodeResourcesRule) {
        self.resources.add_rule(&rule);
        self.rules.push(rule);
        self.rules.sort();
    }

    /// Add a rule to the `<rules2>` section.
    pub fn add_rule2(&mut self, rule: CodeResourcesRule) {
        self.resources.add_rule2(&rule);
        self.rules2.push(rule);
        self.rules2.sort();
    }

    /// Add an exclusion rule to both generations.
    ///
    /// Exclusions only steer the walk and are not written out.
    pub fn add_exclusion_rule(&mut self, rule: CodeResourcesRule) {
        self.rules.push(rule.clone());
        self.rules.sort();
        self.rules2.push(rule);
        self.rules2.sort();
    }

    /// Walk `root` and collect what one generation seals.
    ///
    /// `nested` maps bundle relative paths of already signed nested code to
    /// their signature metadata. Their trees are never descended into.
    fn collect<'n>(
        root: &Path,
        rules: &[CodeResourcesRule],
        version2: bool,
        nested: &'n BTreeMap<String, SignedMachOInfo>,
    ) -> Result<Vec<PendingSeal<'n>>, CodeSignError> {
        let mut pending = vec![];

        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry?;
            let file_type = entry.file_type();

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| CodeSignError::InvalidBundle(entry.path().display().to_string()))?
                .to_string_lossy()
                .replace('\\', "/");

            if let Some(info) = nested.get(&relative) {
                if version2 {
                    pending.push(PendingSeal::Nested { relative, info });
                }
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            if file_type.is_dir() {
                let dir_path = format!("{}/", relative);

                if let Some(rule) = find_rule(rules, &dir_path) {
                    let bundle_like = relative
                        .rsplit('/')
                        .next()
                        .map(|name| name.contains('.'))
                        .unwrap_or(false);

                    if rule.exclude || (rule.nested && bundle_like) {
                        debug!("not descending into {} ({})", relative, rule.pattern);
                        walker.skip_current_dir();
                    }
                }

                continue;
            }

            let rule = match find_rule(rules, &relative) {
                Some(rule) if !rule.exclude && !rule.omit => rule,
                _ => continue,
            };

            if file_type.is_symlink() {
                if version2 {
                    let target = std::fs::read_link(entry.path())?
                        .to_string_lossy()
                        .replace('\\', "/");
                    pending.push(PendingSeal::Symlink { relative, target });
                }
            } else {
                pending.push(PendingSeal::File {
                    relative,
                    path: entry.path().to_path_buf(),
                    optional: rule.optional,
                });
            }
        }

        Ok(pending)
    }

    /// Walk the bundle and produce its resource envelope.
    pub fn build(
        mut self,
        root: &Path,
        nested: &BTreeMap<String, SignedMachOInfo>,
    ) -> Result<CodeResources, CodeSignError> {
        for version2 in [false, true] {
            let rules = if version2 { &self.rules2 } else { &self.rules };
            let pending = Self::collect(root, rules, version2, nested)?;

            let digests = pending
                .par_iter()
                .map(|item| match item {
                    PendingSeal::File { path, .. } => {
                        let data = std::fs::read(path)?;

                        Ok(Some((
                            DigestType::Sha1.digest_data(&data)?,
                            DigestType::Sha256.digest_data(&data)?,
                        )))
                    }
                    _ => Ok(None),
                })
                .collect::<Result<Vec<_>, CodeSignError>>()?;

            for (item, digests) in pending.into_iter().zip(digests) {
                match (item, digests) {
                    (
                        PendingSeal::File {
                            relative, optional, ..
                        },
                        Some((sha1, sha256)),
                    ) => {
                        if version2 {
                            self.resources
                                .seal_file_v2(&relative, sha1, sha256, optional);
                        } else {
                            self.resources.seal_file_v1(&relative, sha1, optional);
                        }
                    }
                    (PendingSeal::Symlink { relative, target }, _) => {
                        self.resources.seal_symlink(relative, target);
                    }
                    (PendingSeal::Nested { relative, info }, _) => {
                        info!("sealing nested code {}", relative);
                        self.resources.seal_nested(relative, info)?;
                    }
                    (PendingSeal::File { relative, .. }, None) => {
                        return Err(CodeSignError::ResourcesPlistParse(format!(
                            "missing digest for {}",
                            relative
                        )));
                    }
                }
            }
        }

        Ok(self.resources)
    }
}
