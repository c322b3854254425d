//! GS1 identifier codec.
//!
//! Converts EPC URNs (`urn:epc:id:sgln:...`) and GS1 digital links
//! (`https://id.gs1.org/414/...`) into canonical, check-digited numeric codes:
//! GLN-13 for locations, GTIN-14 for trade items and SSCC-18 for logistic units.
//!
//! Every function in this module is pure. Input that cannot be parsed produces an
//! empty string rather than an error: callers decide whether an unknown identifier
//! matters, and usually fall back to displaying the raw value.
use std::fmt;

const SGLN_PREFIX: &str = "urn:epc:id:sgln:";
const SGTIN_PREFIX: &str = "urn:epc:id:sgtin:";
const SGTIN_PATTERN_PREFIX: &str = "urn:epc:idpat:sgtin:";
const SSCC_PREFIX: &str = "urn:epc:id:sscc:";

/// Digital link application identifiers.
const AI_SSCC: &str = "00";
const AI_GTIN: &str = "01";
const AI_LOCATION_GLN: &str = "414";
const AI_PARTY_GLN: &str = "417";

pub const GLN_LENGTH: usize = 13;
pub const GTIN_LENGTH: usize = 14;
pub const SSCC_LENGTH: usize = 18;

/// Compute the GS1 Modulo-10 check digit for `base`.
///
/// Starting from the rightmost character, digits at an even distance from the right
/// are weighted 3 and digits at an odd distance are weighted 1. Non-digit characters
/// keep their position but do not contribute to the sum.
pub fn check_digit(base: &str) -> String {
    if base.is_empty() {
        return String::new();
    }

    let sum: u32 = base
        .chars()
        .rev()
        .enumerate()
        .filter_map(|(distance, c)| {
            let digit = c.to_digit(10)?;
            Some(if distance % 2 == 0 { digit * 3 } else { digit })
        })
        .sum();

    ((10 - sum % 10) % 10).to_string()
}

/// Right-align `s` in a field of exactly `n` characters.
/// Shorter input is left-padded with zeros, longer input keeps its last `n` characters.
pub fn normalize_length(s: &str, n: usize) -> String {
    let len = s.chars().count();
    if len < n {
        format!("{}{}", "0".repeat(n - len), s)
    } else {
        s.chars().skip(len - n).collect()
    }
}

/// Whether the last digit of `code` is the check digit of everything before it.
pub fn has_valid_check_digit(code: &str) -> bool {
    if code.len() < 2 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let (base, digit) = code.split_at(code.len() - 1);
    check_digit(base) == digit
}

/// Parse a location into its 13-digit GLN.
///
/// Accepts `urn:epc:id:sgln:CompanyPrefix.LocationRef.Extension` (the extension is
/// ignored and the location reference may be empty) or a digital link carrying AI
/// 414 or 417 followed by an already check-digited GLN.
pub fn parse_location(input: &str) -> String {
    if let Some((company_prefix, location_ref)) = urn_segments(input, &[SGLN_PREFIX]) {
        let base = normalize_length(&format!("{company_prefix}{location_ref}"), GLN_LENGTH - 1);
        return with_check_digit(base);
    }

    [AI_LOCATION_GLN, AI_PARTY_GLN]
        .iter()
        .filter_map(|ai| digital_link_code(input, ai))
        .find(|code| code.len() == GLN_LENGTH && is_numeric(code))
        .map(str::to_owned)
        .unwrap_or_default()
}

/// Parse a trade item into its 14-digit GTIN.
///
/// Accepts `urn:epc:id:sgtin:CompanyPrefix.IndicatorAndItemRef.Serial`, the
/// `urn:epc:idpat:sgtin:` pattern form, or a digital link with AI 01. The first
/// character of the second URN segment is the indicator digit, which leads the GTIN.
/// The serial never influences the result.
pub fn parse_trade_item(input: &str) -> String {
    if let Some((company_prefix, indicator_and_item)) =
        urn_segments(input, &[SGTIN_PREFIX, SGTIN_PATTERN_PREFIX])
    {
        let mut chars = indicator_and_item.chars();
        let indicator = chars.next().unwrap_or('0');
        let item_ref = chars.as_str();

        let base = normalize_length(
            &format!("{indicator}{company_prefix}{item_ref}"),
            GTIN_LENGTH - 1,
        );
        return with_check_digit(base);
    }

    digital_link_code(input, AI_GTIN)
        .and_then(|code| leading_digits(code, GTIN_LENGTH))
        .map(str::to_owned)
        .unwrap_or_default()
}

/// Parse a logistic unit into its SSCC.
///
/// With `include_check_digit` the result is the full 18-digit SSCC. Without it the
/// 17-digit base is returned, which is the form inbound container extraction stores.
/// Accepts `urn:epc:id:sscc:CompanyPrefix.SerialRef` or a digital link with AI 00.
pub fn parse_logistic_unit(input: &str, include_check_digit: bool) -> String {
    if let Some((company_prefix, serial_ref)) = urn_segments(input, &[SSCC_PREFIX]) {
        let base = normalize_length(&format!("{company_prefix}{serial_ref}"), SSCC_LENGTH - 1);
        return if include_check_digit {
            with_check_digit(base)
        } else {
            base
        };
    }

    match digital_link_code(input, AI_SSCC).and_then(|code| leading_digits(code, SSCC_LENGTH)) {
        Some(sscc) if include_check_digit => sscc.to_owned(),
        Some(sscc) => sscc[..SSCC_LENGTH - 1].to_owned(),
        None => String::new(),
    }
}

/// Drop the serial from an SGTIN URN, keeping company prefix and item reference.
/// Serialized units of the same product map to the same base URN.
pub fn strip_serial(sgtin: &str) -> String {
    match urn_segments(sgtin, &[SGTIN_PREFIX]) {
        Some((company_prefix, item_ref)) => format!("{SGTIN_PREFIX}{company_prefix}.{item_ref}"),
        None => String::new(),
    }
}

/// Business steps the pipelines care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BizStep {
    Shipping,
    Receiving,
    Other,
}

impl BizStep {
    pub fn is_shipping(&self) -> bool {
        matches!(self, BizStep::Shipping)
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self, BizStep::Receiving)
    }
}

/// Classify a bizStep value given as a bare word (`shipping`), a CBV URN
/// (`urn:epcglobal:cbv:bizstep:shipping`) or a web vocabulary link
/// (`https://ref.gs1.org/cbv/BizStep-shipping`). Matching ignores case.
pub fn classify_biz_step(value: &str) -> BizStep {
    let value = value.to_ascii_lowercase();

    if matches_step(&value, "shipping") {
        BizStep::Shipping
    } else if matches_step(&value, "receiving") {
        BizStep::Receiving
    } else {
        BizStep::Other
    }
}

fn matches_step(value: &str, step: &str) -> bool {
    match value.strip_suffix(step) {
        Some("") => true,
        Some(head) => head.ends_with(':') || head.ends_with("bizstep-"),
        None => false,
    }
}

/// The three identifier kinds we reconstruct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    Location,
    TradeItem,
    LogisticUnit,
}

impl IdentifierKind {
    /// Width of the canonical, check-digited code.
    pub fn code_length(&self) -> usize {
        match self {
            IdentifierKind::Location => GLN_LENGTH,
            IdentifierKind::TradeItem => GTIN_LENGTH,
            IdentifierKind::LogisticUnit => SSCC_LENGTH,
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IdentifierKind::Location => write!(f, "GLN"),
            IdentifierKind::TradeItem => write!(f, "GTIN"),
            IdentifierKind::LogisticUnit => write!(f, "SSCC"),
        }
    }
}

/// A canonical GS1 code. The source encoding is not kept once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    kind: IdentifierKind,
    code: String,
}

impl Identifier {
    /// Parse `input` as an identifier of `kind`, returning `None` when it is not recognized.
    pub fn parse(kind: IdentifierKind, input: &str) -> Option<Self> {
        let code = match kind {
            IdentifierKind::Location => parse_location(input),
            IdentifierKind::TradeItem => parse_trade_item(input),
            IdentifierKind::LogisticUnit => parse_logistic_unit(input, true),
        };

        if code.is_empty() {
            None
        } else {
            Some(Self { kind, code })
        }
    }

    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.code
    }

    /// Digital links are taken as-is, so their check digit is only verified here.
    pub fn is_valid(&self) -> bool {
        self.code.len() == self.kind.code_length() && has_valid_check_digit(&self.code)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.code)
    }
}

fn with_check_digit(base: String) -> String {
    let digit = check_digit(&base);
    base + &digit
}

/// Split the body of a structured URN into its first two dot-separated segments.
fn urn_segments<'a>(input: &'a str, prefixes: &[&str]) -> Option<(&'a str, &'a str)> {
    let body = prefixes
        .iter()
        .find_map(|prefix| input.strip_prefix(prefix))?;

    let mut segments = body.split('.');
    let first = segments.next()?;
    let second = segments.next()?;
    Some((first, second))
}

/// The path element directly following `/{ai}/` in a digital link.
fn digital_link_code<'a>(input: &'a str, ai: &str) -> Option<&'a str> {
    let (_, rest) = input.split_once(&format!("/{ai}/"))?;
    let code = match rest.find('/') {
        Some(end) => &rest[..end],
        None => rest,
    };
    Some(code)
}

fn leading_digits(code: &str, n: usize) -> Option<&str> {
    let head = code.get(..n)?;
    is_numeric(head).then_some(head)
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
