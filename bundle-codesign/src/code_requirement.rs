// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code requirement expressions.

Signatures carry a *designated requirement*: a binary encoded expression
tree describing what must hold for other code to be considered "the same"
as the signed code. Resource envelopes also embed the text form of the
requirement of each nested signed component.

# Binary Encoding

A requirement blob payload starts with a u32 *kind*. We only deal with
the expression form (kind 1), which is followed by a single expression.

An expression is a u32 opcode followed by an opcode specific payload.
The high byte of the opcode holds flags. Variable length data is a u32
length followed by the bytes, NUL padded to the next 4 byte boundary.
*/

use {
    crate::{
        embedded_signature::{RequirementBlob, RequirementSetBlob},
        error::CodeSignError,
    },
    cryptographic_message_syntax::Oid,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        fmt::{Display, Formatter},
        io::Write,
    },
};

const OPCODE_VALUE_MASK: u32 = 0x00ffffff;

/// Requirement blob kind for expression trees.
const REQUIREMENT_KIND_EXPRESSION: u32 = 1;

/// OID of the extension marking the Apple Worldwide Developer Relations
/// intermediate CA (1.2.840.113635.100.6.2.1).
pub const OID_APPLE_WWDR_INTERMEDIATE: &[u8] =
    &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01];

fn read_data(data: &[u8]) -> Result<(&[u8], &[u8]), CodeSignError> {
    let length = data.pread_with::<u32>(0, scroll::BE)? as usize;
    let value = data
        .get(4..4 + length)
        .ok_or(CodeSignError::RequirementMalformed("data length"))?;

    let offset = match (4 + length) % 4 {
        0 => 4 + length,
        extra => 4 + length + 4 - extra,
    };

    let remaining = data.get(offset..).unwrap_or(&[]);

    Ok((value, remaining))
}

fn write_data(dest: &mut impl Write, data: &[u8]) -> Result<(), CodeSignError> {
    dest.iowrite_with(data.len() as u32, scroll::BE)?;
    dest.write_all(data)?;

    if data.len() % 4 != 0 {
        dest.write_all(&[0u8; 3][0..4 - data.len() % 4])?;
    }

    Ok(())
}

fn read_str<'a>(data: &'a [u8], what: &'static str) -> Result<(&'a str, &'a [u8]), CodeSignError> {
    let (value, data) = read_data(data)?;

    Ok((
        std::str::from_utf8(value).map_err(|_| CodeSignError::RequirementMalformed(what))?,
        data,
    ))
}

fn read_slot(data: &[u8]) -> Result<(i32, &[u8]), CodeSignError> {
    Ok((
        data.pread_with::<i32>(0, scroll::BE)?,
        data.get(4..).unwrap_or(&[]),
    ))
}

/// Render a certificate position the way `csreq` does.
fn format_certificate_slot(slot: i32) -> String {
    match slot {
        -1 => "root".to_string(),
        0 => "leaf".to_string(),
        _ => format!("{}", slot),
    }
}

/// Type of a requirement within a requirement set.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> Self {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
enum RequirementOpCode {
    False = 0,
    True = 1,
    Identifier = 2,
    AnchorApple = 3,
    And = 6,
    Or = 7,
    CodeDirectoryHash = 8,
    Not = 9,
    CertificateField = 11,
    CertificateTrusted = 12,
    AnchorTrusted = 13,
    CertificateGeneric = 14,
    AnchorAppleGeneric = 15,
}

impl TryFrom<u32> for RequirementOpCode {
    type Error = CodeSignError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::False),
            1 => Ok(Self::True),
            2 => Ok(Self::Identifier),
            3 => Ok(Self::AnchorApple),
            6 => Ok(Self::And),
            7 => Ok(Self::Or),
            8 => Ok(Self::CodeDirectoryHash),
            9 => Ok(Self::Not),
            11 => Ok(Self::CertificateField),
            12 => Ok(Self::CertificateTrusted),
            13 => Ok(Self::AnchorTrusted),
            14 => Ok(Self::CertificateGeneric),
            15 => Ok(Self::AnchorAppleGeneric),
            _ => Err(CodeSignError::RequirementUnknownOpcode(v)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
enum MatchType {
    Exists = 0,
    Equal = 1,
    Contains = 2,
    BeginsWith = 3,
    EndsWith = 4,
    Absent = 14,
}

impl TryFrom<u32> for MatchType {
    type Error = CodeSignError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Exists),
            1 => Ok(Self::Equal),
            2 => Ok(Self::Contains),
            3 => Ok(Self::BeginsWith),
            4 => Ok(Self::EndsWith),
            14 => Ok(Self::Absent),
            _ => Err(CodeSignError::RequirementUnknownMatchExpression(v)),
        }
    }
}

/// A match expression applied to a certificate field.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementMatchExpression<'a> {
    /// `/* exists */`
    Exists,
    /// `= "<value>"`
    Equal(Cow<'a, str>),
    /// `~ "<value>"`
    Contains(Cow<'a, str>),
    /// `= "<value>*"`
    BeginsWith(Cow<'a, str>),
    /// `= "*<value>"`
    EndsWith(Cow<'a, str>),
    Absent,
}

impl<'a> Display for CodeRequirementMatchExpression<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => f.write_str("/* exists */"),
            Self::Equal(value) => f.write_fmt(format_args!("= \"{}\"", value)),
            Self::Contains(value) => f.write_fmt(format_args!("~ \"{}\"", value)),
            Self::BeginsWith(value) => f.write_fmt(format_args!("= \"{}*\"", value)),
            Self::EndsWith(value) => f.write_fmt(format_args!("= \"*{}\"", value)),
            Self::Absent => f.write_str("absent"),
        }
    }
}

impl<'a> CodeRequirementMatchExpression<'a> {
    fn match_type(&self) -> MatchType {
        match self {
            Self::Exists => MatchType::Exists,
            Self::Equal(_) => MatchType::Equal,
            Self::Contains(_) => MatchType::Contains,
            Self::BeginsWith(_) => MatchType::BeginsWith,
            Self::EndsWith(_) => MatchType::EndsWith,
            Self::Absent => MatchType::Absent,
        }
    }

    /// Parse a match expression. The slice begins with the match type.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), CodeSignError> {
        let typ = MatchType::try_from(data.pread_with::<u32>(0, scroll::BE)?)?;
        let data = data.get(4..).unwrap_or(&[]);

        Ok(match typ {
            MatchType::Exists => (Self::Exists, data),
            MatchType::Absent => (Self::Absent, data),
            typ => {
                let (value, data) = read_str(data, "match value is not UTF-8")?;
                let value = Cow::from(value);

                let expr = match typ {
                    MatchType::Equal => Self::Equal(value),
                    MatchType::Contains => Self::Contains(value),
                    MatchType::BeginsWith => Self::BeginsWith(value),
                    _ => Self::EndsWith(value),
                };

                (expr, data)
            }
        })
    }

    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), CodeSignError> {
        dest.iowrite_with(self.match_type() as u32, scroll::BE)?;

        match self {
            Self::Exists | Self::Absent => {}
            Self::Equal(value)
            | Self::Contains(value)
            | Self::BeginsWith(value)
            | Self::EndsWith(value) => write_data(dest, value.as_bytes())?,
        }

        Ok(())
    }
}

/// A node in a code requirement expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementExpression<'a> {
    False,
    True,
    /// `identifier "<value>"`
    Identifier(Cow<'a, str>),
    /// `anchor apple`
    AnchorApple,
    And(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),
    Or(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),
    /// `cdhash H"<digest>"`
    CodeDirectoryHash(Cow<'a, [u8]>),
    Not(Box<CodeRequirementExpression<'a>>),
    /// `certificate <slot>[<field>] <match>`
    CertificateField(i32, Cow<'a, str>, CodeRequirementMatchExpression<'a>),
    /// `certificate <slot> trusted`
    CertificateTrusted(i32),
    /// `anchor trusted`
    AnchorTrusted,
    /// `certificate <slot>[field.<oid>] <match>`
    CertificateGeneric(i32, Oid<&'a [u8]>, CodeRequirementMatchExpression<'a>),
    /// `anchor apple generic`
    AnchorAppleGeneric,
}

impl<'a> Display for CodeRequirementExpression<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::False => f.write_str("never"),
            Self::True => f.write_str("always"),
            Self::Identifier(value) => f.write_fmt(format_args!("identifier \"{}\"", value)),
            Self::AnchorApple => f.write_str("anchor apple"),
            Self::And(a, b) => {
                a.fmt_operand(f)?;
                f.write_str(" and ")?;
                b.fmt_operand(f)
            }
            Self::Or(a, b) => f.write_fmt(format_args!("({}) or ({})", a, b)),
            Self::CodeDirectoryHash(digest) => {
                f.write_fmt(format_args!("cdhash H\"{}\"", hex::encode(digest)))
            }
            Self::Not(expr) => f.write_fmt(format_args!("!({})", expr)),
            Self::CertificateField(slot, field, expr) => f.write_fmt(format_args!(
                "certificate {}[{}] {}",
                format_certificate_slot(*slot),
                field,
                expr
            )),
            Self::CertificateTrusted(slot) => f.write_fmt(format_args!(
                "certificate {} trusted",
                format_certificate_slot(*slot)
            )),
            Self::AnchorTrusted => f.write_str("anchor trusted"),
            Self::CertificateGeneric(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[field.{}] {}",
                format_certificate_slot(*slot),
                oid,
                expr
            )),
            Self::AnchorAppleGeneric => f.write_str("anchor apple generic"),
        }
    }
}

impl<'a> CodeRequirementExpression<'a> {
    fn opcode(&self) -> RequirementOpCode {
        match self {
            Self::False => RequirementOpCode::False,
            Self::True => RequirementOpCode::True,
            Self::Identifier(_) => RequirementOpCode::Identifier,
            Self::AnchorApple => RequirementOpCode::AnchorApple,
            Self::And(_, _) => RequirementOpCode::And,
            Self::Or(_, _) => RequirementOpCode::Or,
            Self::CodeDirectoryHash(_) => RequirementOpCode::CodeDirectoryHash,
            Self::Not(_) => RequirementOpCode::Not,
            Self::CertificateField(_, _, _) => RequirementOpCode::CertificateField,
            Self::CertificateTrusted(_) => RequirementOpCode::CertificateTrusted,
            Self::AnchorTrusted => RequirementOpCode::AnchorTrusted,
            Self::CertificateGeneric(_, _, _) => RequirementOpCode::CertificateGeneric,
            Self::AnchorAppleGeneric => RequirementOpCode::AnchorAppleGeneric,
        }
    }

    /// `and` binds tighter than `or`, so only `or` operands need parentheses.
    fn fmt_operand(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Or(_, _) => f.write_fmt(format_args!("({})", self)),
            _ => self.fmt(f),
        }
    }

    /// Parse an expression, returning it and the data that follows it.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), CodeSignError> {
        let opcode = data.pread_with::<u32>(0, scroll::BE)? & OPCODE_VALUE_MASK;
        let opcode = RequirementOpCode::try_from(opcode)?;
        let data = data.get(4..).unwrap_or(&[]);

        Ok(match opcode {
            RequirementOpCode::False => (Self::False, data),
            RequirementOpCode::True => (Self::True, data),
            RequirementOpCode::Identifier => {
                let (value, data) = read_str(data, "identifier value not a UTF-8 string")?;

                (Self::Identifier(value.into()), data)
            }
            RequirementOpCode::AnchorApple => (Self::AnchorApple, data),
            RequirementOpCode::And | RequirementOpCode::Or => {
                let (a, data) = Self::from_bytes(data)?;
                let (b, data) = Self::from_bytes(data)?;

                if opcode == RequirementOpCode::And {
                    (Self::And(Box::new(a), Box::new(b)), data)
                } else {
                    (Self::Or(Box::new(a), Box::new(b)), data)
                }
            }
            RequirementOpCode::CodeDirectoryHash => {
                let (value, data) = read_data(data)?;

                (Self::CodeDirectoryHash(value.into()), data)
            }
            RequirementOpCode::Not => {
                let (expr, data) = Self::from_bytes(data)?;

                (Self::Not(Box::new(expr)), data)
            }
            RequirementOpCode::CertificateField => {
                let (slot, data) = read_slot(data)?;
                let (field, data) = read_str(data, "certificate field is not valid UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                (Self::CertificateField(slot, field.into(), expr), data)
            }
            RequirementOpCode::CertificateTrusted => {
                let (slot, data) = read_slot(data)?;

                (Self::CertificateTrusted(slot), data)
            }
            RequirementOpCode::AnchorTrusted => (Self::AnchorTrusted, data),
            RequirementOpCode::CertificateGeneric => {
                let (slot, data) = read_slot(data)?;
                let (oid, data) = read_data(data)?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                (Self::CertificateGeneric(slot, Oid(oid), expr), data)
            }
            RequirementOpCode::AnchorAppleGeneric => (Self::AnchorAppleGeneric, data),
        })
    }

    /// Write the binary representation of this expression.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), CodeSignError> {
        dest.iowrite_with(self.opcode() as u32, scroll::BE)?;

        match self {
            Self::False
            | Self::True
            | Self::AnchorApple
            | Self::AnchorTrusted
            | Self::AnchorAppleGeneric => {}
            Self::Identifier(s) => write_data(dest, s.as_bytes())?,
            Self::And(a, b) | Self::Or(a, b) => {
                a.write_to(dest)?;
                b.write_to(dest)?;
            }
            Self::CodeDirectoryHash(hash) => write_data(dest, hash)?,
            Self::Not(expr) => expr.write_to(dest)?,
            Self::CertificateField(slot, field, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, field.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateTrusted(slot) => dest.iowrite_with(*slot, scroll::BE)?,
            Self::CertificateGeneric(slot, oid, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, oid.as_ref())?;
                m.write_to(dest)?;
            }
        }

        Ok(())
    }

    /// The designated requirement for code signed by an Apple issued identity.
    ///
    /// `identifier "<identifier>" and anchor apple generic and
    /// certificate leaf[subject.CN] = "<certificate name>" and
    /// certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */`
    pub fn designated(identifier: &str, certificate_name: &str) -> CodeRequirementExpression<'static> {
        use CodeRequirementExpression as E;

        E::And(
            Box::new(E::Identifier(Cow::Owned(identifier.to_string()))),
            Box::new(E::And(
                Box::new(E::AnchorAppleGeneric),
                Box::new(E::And(
                    Box::new(E::CertificateField(
                        0,
                        Cow::Borrowed("subject.CN"),
                        CodeRequirementMatchExpression::Equal(Cow::Owned(
                            certificate_name.to_string(),
                        )),
                    )),
                    Box::new(E::CertificateGeneric(
                        1,
                        Oid(OID_APPLE_WWDR_INTERMEDIATE),
                        CodeRequirementMatchExpression::Exists,
                    )),
                )),
            )),
        )
    }
}

/// A single requirement: a kind and an expression.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeRequirement<'a> {
    pub expression: CodeRequirementExpression<'a>,
}

impl<'a> Display for CodeRequirement<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.expression.fmt(f)
    }
}

impl<'a> CodeRequirement<'a> {
    /// Parse a requirement blob payload (without the blob header).
    pub fn parse_binary(data: &'a [u8]) -> Result<(Self, &'a [u8]), CodeSignError> {
        let kind = data.pread_with::<u32>(0, scroll::BE)?;

        if kind != REQUIREMENT_KIND_EXPRESSION {
            return Err(CodeSignError::RequirementMalformed(
                "only expression requirements are supported",
            ));
        }

        let (expression, data) =
            CodeRequirementExpression::from_bytes(data.get(4..).unwrap_or(&[]))?;

        Ok((Self { expression }, data))
    }

    /// Write the requirement blob payload.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), CodeSignError> {
        dest.iowrite_with(REQUIREMENT_KIND_EXPRESSION, scroll::BE)?;
        self.expression.write_to(dest)
    }

    /// Store this requirement in a set under the given type.
    pub fn add_to_requirement_set(
        &self,
        requirements_set: &mut RequirementSetBlob,
        slot: RequirementType,
    ) -> Result<(), CodeSignError> {
        requirements_set.set_requirements(slot, RequirementBlob::try_from(self)?);

        Ok(())
    }
}

impl<'a> From<CodeRequirementExpression<'a>> for CodeRequirement<'a> {
    fn from(expression: CodeRequirementExpression<'a>) -> Self {
        Self { expression }
    }
}

impl<'a> TryFrom<&CodeRequirement<'a>> for RequirementBlob<'static> {
    type Error = CodeSignError;

    fn try_from(requirement: &CodeRequirement<'a>) -> Result<Self, Self::Error> {
        let mut data = Vec::<u8>::new();
        requirement.write_to(&mut data)?;

        Ok(Self {
            data: Cow::Owned(data),
        })
    }
}

/// Build the requirement set holding the designated requirement.
pub fn designated_requirement_set(
    identifier: &str,
    certificate_name: &str,
) -> Result<RequirementSetBlob<'static>, CodeSignError> {
    let mut set = RequirementSetBlob::default();

    CodeRequirement::from(CodeRequirementExpression::designated(
        identifier,
        certificate_name,
    ))
    .add_to_requirement_set(&mut set, RequirementType::Designated)?;

    Ok(set)
}
