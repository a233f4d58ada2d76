//! Field types module: the value-type contract the rest of the engine consumes.
//!
//! This module provides the FieldType and FValue enums. Every operation the
//! checker, generator and VM need (parse, compare, slice, stringify) goes
//! through here, so adding a new kind of value touches no other module.

use crate::drange::DRange;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FieldType {
    Protocol,
    Boolean,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Double,
    Ipv4,
    Ipv6,
    Ether,
    Bytes,
    String,
    Pcre,
}

bitflags! {
    /// Relations and conversions a field type supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const EQ = 1;
        const ORDER = 1 << 1;
        const BITWISE_AND = 1 << 2;
        const CONTAINS = 1 << 3;
        const MATCHES = 1 << 4;
        const SLICE = 1 << 5;
    }
}

/// Types in the same family can be compared with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Protocol,
    Boolean,
    Unsigned,
    Signed,
    Double,
    Ipv4,
    Ipv6,
    ByteLike,
    String,
    Pattern,
}

impl FieldType {
    pub fn capabilities(self) -> Capabilities {
        use FieldType::*;
        match self {
            Protocol => {
                Capabilities::EQ
                    | Capabilities::ORDER
                    | Capabilities::CONTAINS
                    | Capabilities::MATCHES
                    | Capabilities::SLICE
            }
            Boolean => Capabilities::EQ | Capabilities::BITWISE_AND,
            UInt8 | UInt16 | UInt32 | UInt64 | Int8 | Int16 | Int32 | Int64 => {
                Capabilities::EQ | Capabilities::ORDER | Capabilities::BITWISE_AND
            }
            Double => Capabilities::EQ | Capabilities::ORDER,
            Ipv4 | Ipv6 => Capabilities::EQ | Capabilities::ORDER | Capabilities::SLICE,
            Ether => {
                Capabilities::EQ
                    | Capabilities::ORDER
                    | Capabilities::BITWISE_AND
                    | Capabilities::CONTAINS
                    | Capabilities::SLICE
            }
            Bytes => Capabilities::all(),
            String => {
                Capabilities::EQ
                    | Capabilities::ORDER
                    | Capabilities::CONTAINS
                    | Capabilities::MATCHES
                    | Capabilities::SLICE
            }
            Pcre => Capabilities::empty(),
        }
    }

    pub fn can_eq(self) -> bool {
        self.capabilities().contains(Capabilities::EQ)
    }

    pub fn can_order(self) -> bool {
        self.capabilities().contains(Capabilities::ORDER)
    }

    pub fn can_bitwise_and(self) -> bool {
        self.capabilities().contains(Capabilities::BITWISE_AND)
    }

    pub fn can_contains(self) -> bool {
        self.capabilities().contains(Capabilities::CONTAINS)
    }

    pub fn can_matches(self) -> bool {
        self.capabilities().contains(Capabilities::MATCHES)
    }

    pub fn can_slice(self) -> bool {
        self.capabilities().contains(Capabilities::SLICE)
    }

    fn family(self) -> Family {
        use FieldType::*;
        match self {
            Protocol => Family::Protocol,
            Boolean => Family::Boolean,
            UInt8 | UInt16 | UInt32 | UInt64 => Family::Unsigned,
            Int8 | Int16 | Int32 | Int64 => Family::Signed,
            Double => Family::Double,
            Ipv4 => Family::Ipv4,
            Ipv6 => Family::Ipv6,
            Ether | Bytes => Family::ByteLike,
            String => Family::String,
            Pcre => Family::Pattern,
        }
    }

    /// Whether values of the two types can be compared with each other.
    pub fn is_compatible(self, other: FieldType) -> bool {
        self.family() == other.family()
    }

    /// Byte-like values compare as byte sequences without conversion.
    pub fn is_bytes_like(self) -> bool {
        self.family() == Family::ByteLike
    }

    pub fn is_unsigned(self) -> bool {
        self.family() == Family::Unsigned
    }

    pub fn is_signed(self) -> bool {
        self.family() == Family::Signed
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self.family(),
            Family::Unsigned | Family::Signed | Family::Double
        )
    }

    pub fn is_string(self) -> bool {
        self == FieldType::String
    }

    /// Short identifier used in instruction listings.
    pub fn ident(self) -> &'static str {
        use FieldType::*;
        match self {
            Protocol => "FT_PROTOCOL",
            Boolean => "FT_BOOLEAN",
            UInt8 => "FT_UINT8",
            UInt16 => "FT_UINT16",
            UInt32 => "FT_UINT32",
            UInt64 => "FT_UINT64",
            Int8 => "FT_INT8",
            Int16 => "FT_INT16",
            Int32 => "FT_INT32",
            Int64 => "FT_INT64",
            Double => "FT_DOUBLE",
            Ipv4 => "FT_IPv4",
            Ipv6 => "FT_IPv6",
            Ether => "FT_ETHER",
            Bytes => "FT_BYTES",
            String => "FT_STRING",
            Pcre => "FT_PCRE",
        }
    }

    fn unsigned_max(self) -> u64 {
        match self {
            FieldType::UInt8 => u8::MAX as u64,
            FieldType::UInt16 => u16::MAX as u64,
            FieldType::UInt32 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }

    fn signed_bounds(self) -> (i64, i64) {
        match self {
            FieldType::Int8 => (i8::MIN as i64, i8::MAX as i64),
            FieldType::Int16 => (i16::MIN as i64, i16::MAX as i64),
            FieldType::Int32 => (i32::MIN as i64, i32::MAX as i64),
            _ => (i64::MIN, i64::MAX),
        }
    }

    fn width(self) -> usize {
        match self {
            FieldType::UInt8 | FieldType::Int8 => 1,
            FieldType::UInt16 | FieldType::Int16 => 2,
            FieldType::UInt32 | FieldType::Int32 => 4,
            _ => 8,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FieldType::*;
        let name = match self {
            Protocol => "Protocol",
            Boolean => "Boolean",
            UInt8 => "Unsigned integer, 1 byte",
            UInt16 => "Unsigned integer, 2 bytes",
            UInt32 => "Unsigned integer, 4 bytes",
            UInt64 => "Unsigned integer, 8 bytes",
            Int8 => "Signed integer, 1 byte",
            Int16 => "Signed integer, 2 bytes",
            Int32 => "Signed integer, 4 bytes",
            Int64 => "Signed integer, 8 bytes",
            Double => "Floating point (double-precision)",
            Ipv4 => "IPv4 address",
            Ipv6 => "IPv6 address",
            Ether => "Ethernet or other MAC address",
            Bytes => "Sequence of bytes",
            String => "Character string",
            Pcre => "Compiled Perl-Compatible Regular Expression",
        };
        f.write_str(name)
    }
}

/// A compiled regular expression used as the right side of `matches`.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: regex::bytes::Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        let regex = regex::bytes::Regex::new(source)?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.regex.is_match(haystack)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum FValue {
    Protocol(Vec<u8>),
    Boolean(bool),
    Unsigned(FieldType, u64),
    Signed(FieldType, i64),
    Double(f64),
    Ipv4 { addr: Ipv4Addr, prefix: u8 },
    Ipv6 { addr: Ipv6Addr, prefix: u8 },
    Ether([u8; 6]),
    Bytes(Vec<u8>),
    String(String),
    Pcre(Pattern),
}

/// Which flavour of text a value should be rendered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringRepr {
    /// Human readable, as shown in a packet details pane.
    Display,
    /// Valid filter syntax that parses back to the same value.
    Filter,
}

impl FValue {
    pub fn ipv4(addr: Ipv4Addr) -> Self {
        FValue::Ipv4 { addr, prefix: 32 }
    }

    pub fn ipv6(addr: Ipv6Addr) -> Self {
        FValue::Ipv6 { addr, prefix: 128 }
    }

    pub fn ftype(&self) -> FieldType {
        match self {
            FValue::Protocol(_) => FieldType::Protocol,
            FValue::Boolean(_) => FieldType::Boolean,
            FValue::Unsigned(ft, _) | FValue::Signed(ft, _) => *ft,
            FValue::Double(_) => FieldType::Double,
            FValue::Ipv4 { .. } => FieldType::Ipv4,
            FValue::Ipv6 { .. } => FieldType::Ipv6,
            FValue::Ether(_) => FieldType::Ether,
            FValue::Bytes(_) => FieldType::Bytes,
            FValue::String(_) => FieldType::String,
            FValue::Pcre(_) => FieldType::Pcre,
        }
    }

    /// Parses a bare filter token as a value of `ftype`.
    ///
    /// With `allow_partial`, byte-like types accept fewer bytes than their
    /// fixed width (used by `contains`).
    pub fn from_unparsed(ftype: FieldType, s: &str, allow_partial: bool) -> Result<Self, String> {
        use FieldType::*;
        match ftype {
            Protocol => Ok(FValue::Protocol(
                parse_byte_string(s).unwrap_or_else(|| s.as_bytes().to_vec()),
            )),
            Boolean => parse_boolean(s).map(FValue::Boolean),
            UInt8 | UInt16 | UInt32 | UInt64 => parse_unsigned(ftype, s),
            Int8 | Int16 | Int32 | Int64 => parse_signed(ftype, s),
            Double => f64::from_str(s)
                .map(FValue::Double)
                .map_err(|_| format!("\"{}\" is not a valid floating-point number.", s)),
            Ipv4 => parse_ipv4(s),
            Ipv6 => parse_ipv6(s),
            Ether => {
                let bytes = parse_byte_string(s)
                    .ok_or_else(|| format!("\"{}\" is not a valid hardware address.", s))?;
                match <[u8; 6]>::try_from(bytes.as_slice()) {
                    Ok(mac) => Ok(FValue::Ether(mac)),
                    Err(_) if allow_partial => Ok(FValue::Bytes(bytes)),
                    Err(_) => Err(format!("\"{}\" is not a valid hardware address.", s)),
                }
            }
            Bytes => parse_byte_string(s)
                .map(FValue::Bytes)
                .ok_or_else(|| format!("\"{}\" is not a valid byte string.", s)),
            String => Ok(FValue::String(s.to_string())),
            Pcre => Pattern::new(s)
                .map(FValue::Pcre)
                .map_err(|e| format!("\"{}\" is not a valid regular expression: {}", s, e)),
        }
    }

    /// Converts a quoted string literal into a value of `ftype`.
    pub fn from_string(ftype: FieldType, s: &[u8]) -> Result<Self, String> {
        match ftype {
            FieldType::Protocol => Ok(FValue::Protocol(s.to_vec())),
            FieldType::Bytes => Ok(FValue::Bytes(s.to_vec())),
            FieldType::String => Ok(FValue::String(String::from_utf8_lossy(s).into_owned())),
            _ => FValue::from_unparsed(ftype, &String::from_utf8_lossy(s), false),
        }
    }

    /// Ordering between two values of compatible types.
    pub fn compare(&self, other: &FValue) -> Option<Ordering> {
        use FValue::*;
        match (self, other) {
            (Unsigned(_, a), Unsigned(_, b)) => Some(a.cmp(b)),
            (Signed(_, a), Signed(_, b)) => Some(a.cmp(b)),
            (Unsigned(_, a), Signed(_, b)) => Some((*a as i128).cmp(&(*b as i128))),
            (Signed(_, a), Unsigned(_, b)) => Some((*a as i128).cmp(&(*b as i128))),
            (Double(a), Double(b)) => a.partial_cmp(b),
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (Ipv4 { addr: a, prefix: pa }, Ipv4 { addr: b, prefix: pb }) => {
                let mask = ipv4_mask((*pa).min(*pb));
                Some((u32::from(*a) & mask).cmp(&(u32::from(*b) & mask)))
            }
            (Ipv6 { addr: a, prefix: pa }, Ipv6 { addr: b, prefix: pb }) => {
                let mask = ipv6_mask((*pa).min(*pb));
                Some((u128::from(*a) & mask).cmp(&(u128::from(*b) & mask)))
            }
            (String(a), String(b)) => Some(a.cmp(b)),
            (Pcre(a), Pcre(b)) => Some(a.as_str().cmp(b.as_str())),
            _ => match (self.byte_view(), other.byte_view()) {
                (Some(a), Some(b)) if !self.is_textual() && !other.is_textual() => Some(a.cmp(b)),
                _ => None,
            },
        }
    }

    pub fn equals(&self, other: &FValue) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// True iff the bitwise AND of the two values is non-zero.
    pub fn bitwise_and(&self, other: &FValue) -> bool {
        use FValue::*;
        match (self, other) {
            (Unsigned(_, a), Unsigned(_, b)) => a & b != 0,
            (Signed(_, a), Signed(_, b)) => a & b != 0,
            (Unsigned(_, a), Signed(_, b)) | (Signed(_, b), Unsigned(_, a)) => a & (*b as u64) != 0,
            (Boolean(a), Boolean(b)) => *a && *b,
            _ => match (self.byte_view(), other.byte_view()) {
                (Some(a), Some(b)) if b.len() <= a.len() => {
                    a.iter().zip(b.iter()).any(|(x, y)| x & y != 0)
                }
                _ => false,
            },
        }
    }

    pub fn contains(&self, needle: &FValue) -> bool {
        match (self.byte_view(), needle.byte_view()) {
            (Some(haystack), Some(needle)) => {
                needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
            }
            _ => false,
        }
    }

    pub fn matches(&self, pattern: &FValue) -> bool {
        match (self.byte_view(), pattern) {
            (Some(haystack), FValue::Pcre(re)) => re.is_match(haystack),
            _ => false,
        }
    }

    /// Slices the byte representation of this value.
    ///
    /// Returns `None` when the range does not fit the value.
    pub fn slice(&self, range: &DRange) -> Option<FValue> {
        if !self.ftype().can_slice() {
            return None;
        }
        range.apply(&self.to_bytes()).map(FValue::Bytes)
    }

    pub fn byte_length(&self) -> usize {
        match self.byte_view() {
            Some(bytes) => bytes.len(),
            None => self.to_bytes().len(),
        }
    }

    /// Raw byte representation, big-endian for numbers.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            FValue::Protocol(b) | FValue::Bytes(b) => b.clone(),
            FValue::Ether(mac) => mac.to_vec(),
            FValue::String(s) => s.as_bytes().to_vec(),
            FValue::Boolean(b) => vec![*b as u8],
            FValue::Unsigned(ft, v) => v.to_be_bytes()[8 - ft.width()..].to_vec(),
            FValue::Signed(ft, v) => v.to_be_bytes()[8 - ft.width()..].to_vec(),
            FValue::Double(d) => d.to_be_bytes().to_vec(),
            FValue::Ipv4 { addr, .. } => addr.octets().to_vec(),
            FValue::Ipv6 { addr, .. } => addr.octets().to_vec(),
            FValue::Pcre(p) => p.as_str().as_bytes().to_vec(),
        }
    }

    fn byte_view(&self) -> Option<&[u8]> {
        match self {
            FValue::Protocol(b) | FValue::Bytes(b) => Some(b),
            FValue::Ether(mac) => Some(mac),
            FValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    fn is_textual(&self) -> bool {
        matches!(self, FValue::String(_))
    }

    /// Renders the value as text; `None` if it has no representation in the
    /// requested flavour.
    pub fn to_string_repr(&self, repr: StringRepr) -> Option<String> {
        match (self, repr) {
            (FValue::String(s), StringRepr::Filter) => Some(quote_filter_string(s)),
            (FValue::Pcre(p), StringRepr::Filter) => Some(quote_filter_string(p.as_str())),
            (FValue::Protocol(b) | FValue::Bytes(b), StringRepr::Filter) if b.is_empty() => None,
            _ => Some(self.to_string()),
        }
    }
}

impl fmt::Display for FValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FValue::Protocol(b) | FValue::Bytes(b) => f.write_str(&hex_bytes(b)),
            FValue::Ether(mac) => f.write_str(&hex_bytes(mac)),
            FValue::Boolean(b) => write!(f, "{}", b),
            FValue::Unsigned(_, v) => write!(f, "{}", v),
            FValue::Signed(_, v) => write!(f, "{}", v),
            FValue::Double(d) => write!(f, "{}", d),
            FValue::Ipv4 { addr, prefix } if *prefix < 32 => write!(f, "{}/{}", addr, prefix),
            FValue::Ipv4 { addr, .. } => write!(f, "{}", addr),
            FValue::Ipv6 { addr, prefix } if *prefix < 128 => write!(f, "{}/{}", addr, prefix),
            FValue::Ipv6 { addr, .. } => write!(f, "{}", addr),
            FValue::String(s) => f.write_str(s),
            FValue::Pcre(p) => f.write_str(p.as_str()),
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn quote_filter_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn ipv4_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - p as u32),
    }
}

fn ipv6_mask(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - p as u32),
    }
}

/// C-style integer literal: `0x` hex, leading `0` octal, otherwise decimal.
pub(crate) fn parse_c_integer(s: &str) -> Option<u64> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn parse_unsigned(ftype: FieldType, s: &str) -> Result<FValue, String> {
    let value = parse_c_integer(s).ok_or_else(|| format!("\"{}\" is not a valid number.", s))?;
    let max = ftype.unsigned_max();
    if value > max {
        return Err(format!(
            "\"{}\" too big for this field, maximum {}.",
            s, max
        ));
    }
    Ok(FValue::Unsigned(ftype, value))
}

fn parse_signed(ftype: FieldType, s: &str) -> Result<FValue, String> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude =
        parse_c_integer(digits).ok_or_else(|| format!("\"{}\" is not a valid number.", s))? as i128;
    let value = if negative { -magnitude } else { magnitude };
    let (min, max) = ftype.signed_bounds();
    if value > max as i128 {
        return Err(format!("\"{}\" too big for this field, maximum {}.", s, max));
    }
    if value < min as i128 {
        return Err(format!("\"{}\" too small for this field, minimum {}.", s, min));
    }
    Ok(FValue::Signed(ftype, value as i64))
}

fn parse_boolean(s: &str) -> Result<bool, String> {
    if s.eq_ignore_ascii_case("true") {
        return Ok(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return Ok(false);
    }
    parse_c_integer(s)
        .map(|v| v != 0)
        .ok_or_else(|| format!("\"{}\" is not a valid Boolean.", s))
}

fn split_prefix(s: &str) -> (&str, Option<&str>) {
    match s.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (s, None),
    }
}

fn parse_prefix(s: &str, prefix: Option<&str>, max: u8) -> Result<u8, String> {
    match prefix {
        None => Ok(max),
        Some(p) => match p.parse::<u8>() {
            Ok(p) if p <= max => Ok(p),
            _ => Err(format!(
                "\"{}\" is not a valid prefix length, must be between 0 and {}.",
                s, max
            )),
        },
    }
}

fn parse_ipv4(s: &str) -> Result<FValue, String> {
    let (addr, prefix) = split_prefix(s);
    let addr = Ipv4Addr::from_str(addr)
        .map_err(|_| format!("\"{}\" is not a valid IPv4 address.", s))?;
    let prefix = parse_prefix(s, prefix, 32)?;
    Ok(FValue::Ipv4 { addr, prefix })
}

fn parse_ipv6(s: &str) -> Result<FValue, String> {
    let (addr, prefix) = split_prefix(s);
    let addr = Ipv6Addr::from_str(addr)
        .map_err(|_| format!("\"{}\" is not a valid IPv6 address.", s))?;
    let prefix = parse_prefix(s, prefix, 128)?;
    Ok(FValue::Ipv6 { addr, prefix })
}

/// Hex byte string: `aa:bb:cc`, `aa-bb`, `aa.bb`, or unseparated `aabbcc`.
pub(crate) fn parse_byte_string(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() {
        return None;
    }
    let separator = s.chars().find(|c| matches!(c, ':' | '-' | '.'));
    match separator {
        Some(sep) => s
            .split(sep)
            .map(|group| {
                if group.is_empty()
                    || group.len() > 2
                    || !group.chars().all(|c| c.is_ascii_hexdigit())
                {
                    None
                } else {
                    u8::from_str_radix(group, 16).ok()
                }
            })
            .collect(),
        None => {
            if !s.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            if s.len() == 1 {
                return u8::from_str_radix(s, 16).ok().map(|b| vec![b]);
            }
            if s.len() % 2 != 0 {
                return None;
            }
            (0..s.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
                .collect()
        }
    }
}
