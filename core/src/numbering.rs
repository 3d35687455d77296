//! Child waybill numbering.
//!
//! A [`NumberFormat`] is chosen by configuration. Each format owns a scope
//! (per year, per prefix, or global) inside which sequences increase by one
//! from the highest number already issued. Numbering is pure: the caller reads
//! the last issued sequence for [`NumberFormat::scope`] from the store and
//! hands it to [`next_number`].
//!
//! | Format | Shape | Scope |
//! |---|---|---|
//! | `YearSequence` | `AAAANNNN` | year |
//! | `PrefixSequence` | `<prefix>NNNN` | prefix |
//! | `PlainSequence` | `NNNNNNNN` | global |
//! | `Custom` | template with `AAAA`/`NNNN` | year if `AAAA` present, else template |

use crate::types::NumberFormatKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Year placeholder in custom templates.
pub const YEAR_PLACEHOLDER: &str = "AAAA";

/// Sequence placeholder in custom templates.
pub const SEQUENCE_PLACEHOLDER: &str = "NNNN";

/// Largest sequence a 4-digit field holds.
pub const MAX_SHORT_SEQUENCE: u32 = 9_999;

/// Largest sequence an 8-digit field holds.
pub const MAX_LONG_SEQUENCE: u32 = 99_999_999;

/// Earliest year accepted as a year prefix when parsing legacy numbers.
pub const MIN_PARSED_YEAR: i32 = 2000;

/// Numbering failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NumberingError {
    /// The scope has no room for another sequence.
    #[error("numbering scope {scope} is exhausted at {max}")]
    Exhausted {
        /// Scope description.
        scope: String,
        /// Largest sequence the format holds.
        max: u32,
    },

    /// A custom template is malformed.
    #[error("invalid numbering template '{template}': {reason}")]
    InvalidTemplate {
        /// The rejected template.
        template: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A prefix format was configured without a usable prefix.
    #[error("numbering prefix must be non-empty and contain no whitespace")]
    InvalidPrefix,

    /// Unknown format name in configuration.
    #[error("unknown numbering format '{0}'")]
    UnknownFormat(String),

    /// The year cannot be rendered in four digits.
    #[error("year {0} cannot be rendered as AAAA")]
    YearOutOfRange(i32),
}

/// Configured child waybill number format.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumberFormat {
    /// `AAAANNNN`, restarting every year.
    #[default]
    YearSequence,
    /// `<prefix>NNNN`, one sequence per prefix.
    PrefixSequence {
        /// Literal prefix.
        prefix: String,
    },
    /// Eight-digit global sequence.
    PlainSequence,
    /// Template with one `NNNN` and optional `AAAA` placeholders.
    Custom {
        /// The template.
        template: String,
    },
}

impl NumberFormat {
    /// Build a prefix format.
    ///
    /// # Errors
    ///
    /// Returns [`NumberingError::InvalidPrefix`] for an empty or whitespace prefix.
    pub fn prefix(prefix: impl Into<String>) -> Result<Self, NumberingError> {
        let format = Self::PrefixSequence {
            prefix: prefix.into(),
        };
        format.validate()?;
        Ok(format)
    }

    /// Build a custom template format.
    ///
    /// # Errors
    ///
    /// Returns [`NumberingError::InvalidTemplate`] unless the template holds
    /// exactly one `NNNN`.
    pub fn custom(template: impl Into<String>) -> Result<Self, NumberingError> {
        let format = Self::Custom {
            template: template.into(),
        };
        format.validate()?;
        Ok(format)
    }

    /// Build a format from configuration values.
    ///
    /// `name` is one of `year_sequence`, `prefix_sequence`, `plain_sequence`
    /// or `custom`; the prefix and template are only read by the formats that
    /// need them.
    ///
    /// # Errors
    ///
    /// Returns [`NumberingError::UnknownFormat`] for an unknown name, or the
    /// validation error of the selected format.
    pub fn from_config(
        name: &str,
        prefix: Option<&str>,
        template: Option<&str>,
    ) -> Result<Self, NumberingError> {
        match NumberFormatKind::parse(name.trim()) {
            Some(NumberFormatKind::YearSequence) => Ok(Self::YearSequence),
            Some(NumberFormatKind::PlainSequence) => Ok(Self::PlainSequence),
            Some(NumberFormatKind::PrefixSequence) => Self::prefix(prefix.unwrap_or_default()),
            Some(NumberFormatKind::Custom) => Self::custom(template.unwrap_or_default()),
            None => Err(NumberingError::UnknownFormat(name.to_string())),
        }
    }

    /// Check the format's parameters.
    ///
    /// # Errors
    ///
    /// See [`NumberFormat::prefix`] and [`NumberFormat::custom`].
    pub fn validate(&self) -> Result<(), NumberingError> {
        match self {
            Self::YearSequence | Self::PlainSequence => Ok(()),
            Self::PrefixSequence { prefix } => {
                if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
                    Err(NumberingError::InvalidPrefix)
                } else {
                    Ok(())
                }
            },
            Self::Custom { template } => match template.matches(SEQUENCE_PLACEHOLDER).count() {
                1 => Ok(()),
                0 => Err(NumberingError::InvalidTemplate {
                    template: template.clone(),
                    reason: "missing NNNN placeholder",
                }),
                _ => Err(NumberingError::InvalidTemplate {
                    template: template.clone(),
                    reason: "more than one NNNN placeholder",
                }),
            },
        }
    }

    /// Stored format tag.
    #[must_use]
    pub const fn kind(&self) -> NumberFormatKind {
        match self {
            Self::YearSequence => NumberFormatKind::YearSequence,
            Self::PrefixSequence { .. } => NumberFormatKind::PrefixSequence,
            Self::PlainSequence => NumberFormatKind::PlainSequence,
            Self::Custom { .. } => NumberFormatKind::Custom,
        }
    }

    /// Largest sequence the format can render.
    #[must_use]
    pub const fn max_sequence(&self) -> u32 {
        match self {
            Self::PlainSequence => MAX_LONG_SEQUENCE,
            _ => MAX_SHORT_SEQUENCE,
        }
    }

    /// The sequence scope for numbers issued in `year`.
    #[must_use]
    pub fn scope(&self, year: i32) -> NumberingScope {
        match self {
            Self::YearSequence => NumberingScope::Year(year),
            Self::PrefixSequence { prefix } => NumberingScope::Prefix(prefix.clone()),
            Self::PlainSequence => NumberingScope::Global,
            Self::Custom { template } => NumberingScope::Template {
                template: template.clone(),
                year: template.contains(YEAR_PLACEHOLDER).then_some(year),
            },
        }
    }

    /// Render `sequence` for `year`.
    ///
    /// # Errors
    ///
    /// - [`NumberingError::Exhausted`] if `sequence` exceeds the format width
    /// - [`NumberingError::YearOutOfRange`] if the year is not four digits
    pub fn render(&self, year: i32, sequence: u32) -> Result<String, NumberingError> {
        self.validate()?;
        if sequence > self.max_sequence() {
            return Err(NumberingError::Exhausted {
                scope: self.scope(year).to_string(),
                max: self.max_sequence(),
            });
        }
        let year_text = || {
            if (0..=9999).contains(&year) {
                Ok(format!("{year:04}"))
            } else {
                Err(NumberingError::YearOutOfRange(year))
            }
        };

        Ok(match self {
            Self::YearSequence => format!("{}{sequence:04}", year_text()?),
            Self::PrefixSequence { prefix } => format!("{prefix}{sequence:04}"),
            Self::PlainSequence => format!("{sequence:08}"),
            Self::Custom { template } => {
                let with_year = if template.contains(YEAR_PLACEHOLDER) {
                    template.replace(YEAR_PLACEHOLDER, &year_text()?)
                } else {
                    template.clone()
                };
                with_year.replacen(SEQUENCE_PLACEHOLDER, &format!("{sequence:04}"), 1)
            },
        })
    }
}

/// The set of numbers one sequence counter runs over.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumberingScope {
    /// `YearSequence` numbers of one year.
    Year(i32),
    /// `PrefixSequence` numbers of one prefix.
    Prefix(String),
    /// All `PlainSequence` numbers.
    Global,
    /// `Custom` numbers of one template, per year when it carries `AAAA`.
    Template {
        /// The template.
        template: String,
        /// Year, when the template is year-scoped.
        year: Option<i32>,
    },
}

impl NumberingScope {
    /// Stored format tag of numbers in this scope.
    #[must_use]
    pub const fn format_kind(&self) -> NumberFormatKind {
        match self {
            Self::Year(_) => NumberFormatKind::YearSequence,
            Self::Prefix(_) => NumberFormatKind::PrefixSequence,
            Self::Global => NumberFormatKind::PlainSequence,
            Self::Template { .. } => NumberFormatKind::Custom,
        }
    }

    /// Year filter of the scope, if any.
    #[must_use]
    pub const fn year(&self) -> Option<i32> {
        match self {
            Self::Year(year) => Some(*year),
            Self::Template { year, .. } => *year,
            Self::Prefix(_) | Self::Global => None,
        }
    }

    /// Whether a stored number belongs to this scope.
    #[must_use]
    pub fn contains(&self, kind: NumberFormatKind, year: i32, number: &str) -> bool {
        if kind != self.format_kind() || self.year().is_some_and(|y| y != year) {
            return false;
        }
        match self {
            Self::Year(_) | Self::Global => true,
            Self::Prefix(prefix) => number
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.len() == 4 && is_digits(rest)),
            Self::Template { template, year } => {
                let pattern = match year {
                    Some(y) => template.replace(YEAR_PLACEHOLDER, &format!("{y:04}")),
                    None => template.clone(),
                };
                matches_pattern(&pattern, number)
            },
        }
    }
}

impl fmt::Display for NumberingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Year(year) => write!(f, "year:{year}"),
            Self::Prefix(prefix) => write!(f, "prefix:{prefix}"),
            Self::Global => f.write_str("global"),
            Self::Template {
                template,
                year: Some(year),
            } => write!(f, "template:{template}:{year}"),
            Self::Template {
                template,
                year: None,
            } => write!(f, "template:{template}"),
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn matches_pattern(pattern: &str, number: &str) -> bool {
    let Some(at) = pattern.find(SEQUENCE_PLACEHOLDER) else {
        return false;
    };
    let end = at + SEQUENCE_PLACEHOLDER.len();
    number.len() == pattern.len()
        && number.get(..at) == pattern.get(..at)
        && number.get(end..) == pattern.get(end..)
        && number.get(at..end).is_some_and(is_digits)
}

/// A freshly issued number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedNumber {
    /// Rendered number.
    pub number: String,
    /// Stored format tag.
    pub format: NumberFormatKind,
    /// Issuing year.
    pub year: i32,
    /// Sequence within the scope.
    pub sequence: u32,
}

/// Issue the number following `last_issued` in `format`'s scope for `year`.
///
/// # Errors
///
/// Returns [`NumberingError::Exhausted`] when the scope is full; numbers are
/// never reused.
pub fn next_number(
    format: &NumberFormat,
    year: i32,
    last_issued: Option<u32>,
) -> Result<IssuedNumber, NumberingError> {
    let exhausted = || NumberingError::Exhausted {
        scope: format.scope(year).to_string(),
        max: format.max_sequence(),
    };
    let sequence = last_issued
        .unwrap_or(0)
        .checked_add(1)
        .filter(|s| *s <= format.max_sequence())
        .ok_or_else(exhausted)?;

    Ok(IssuedNumber {
        number: format.render(year, sequence)?,
        format: format.kind(),
        year,
        sequence,
    })
}

/// Structure recovered from a stored number of unknown format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParsedNumber {
    /// `AAAANNNN` with a plausible year.
    YearSequence {
        /// Year part.
        year: i32,
        /// Sequence part.
        sequence: u32,
    },
    /// Eight digits without a plausible year.
    PlainSequence {
        /// The whole value.
        sequence: u32,
    },
    /// Letters, optional `-`, digits.
    PrefixSequence {
        /// Letter part, including the separator when present.
        prefix: String,
        /// Digit part.
        sequence: u64,
    },
    /// Anything else, kept opaque.
    Custom(String),
}

impl ParsedNumber {
    /// Stored format tag this value maps to.
    #[must_use]
    pub const fn kind(&self) -> NumberFormatKind {
        match self {
            Self::YearSequence { .. } => NumberFormatKind::YearSequence,
            Self::PlainSequence { .. } => NumberFormatKind::PlainSequence,
            Self::PrefixSequence { .. } => NumberFormatKind::PrefixSequence,
            Self::Custom(_) => NumberFormatKind::Custom,
        }
    }
}

/// Recover the format of a legacy number.
///
/// Eight digits whose first four form a year in `2000..=current_year + 1` are
/// read as `YearSequence`; note that a plain sequence like `20250001` is
/// indistinguishable from a year-scoped one. New numbers store their format
/// and never go through this heuristic.
#[must_use]
pub fn parse(value: &str, current_year: i32) -> ParsedNumber {
    if value.len() == 8 && is_digits(value) {
        let year = value[..4].parse::<i32>().unwrap_or_default();
        if (MIN_PARSED_YEAR..=current_year + 1).contains(&year) {
            if let Ok(sequence) = value[4..].parse() {
                return ParsedNumber::YearSequence { year, sequence };
            }
        }
        if let Ok(sequence) = value.parse() {
            return ParsedNumber::PlainSequence { sequence };
        }
    }

    let letters = value
        .bytes()
        .take_while(u8::is_ascii_alphabetic)
        .count();
    if letters > 0 {
        let rest = &value[letters..];
        let (separator, digits) = match rest.strip_prefix('-') {
            Some(digits) => (1, digits),
            None => (0, rest),
        };
        if is_digits(digits) {
            if let Ok(sequence) = digits.parse() {
                return ParsedNumber::PrefixSequence {
                    prefix: value[..letters + separator].to_string(),
                    sequence,
                };
            }
        }
    }

    ParsedNumber::Custom(value.to_string())
}

impl FromStr for NumberFormat {
    type Err = NumberingError;

    /// Parse `year_sequence`, `plain_sequence`, `prefix_sequence:<prefix>` or
    /// `custom:<template>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("prefix_sequence", prefix)) => Self::prefix(prefix),
            Some(("custom", template)) => Self::custom(template),
            _ => Self::from_config(s, None, None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn year_sequence_starts_at_one_per_year() {
        let issued = next_number(&NumberFormat::YearSequence, 2026, None).unwrap();
        assert_eq!(issued.number, "20260001");
        assert_eq!(issued.sequence, 1);
        assert_eq!(issued.format, NumberFormatKind::YearSequence);

        let next = next_number(&NumberFormat::YearSequence, 2026, Some(41)).unwrap();
        assert_eq!(next.number, "20260042");
    }

    #[test]
    fn prefix_and_plain_formats() {
        let prefix = NumberFormat::prefix("GH-").unwrap();
        assert_eq!(next_number(&prefix, 2026, Some(9)).unwrap().number, "GH-0010");

        let plain = NumberFormat::PlainSequence;
        assert_eq!(next_number(&plain, 2026, Some(122)).unwrap().number, "00000123");
    }

    #[test]
    fn custom_template() {
        let format = NumberFormat::custom("EXP-AAAA/NNNN").unwrap();
        assert_eq!(
            next_number(&format, 2026, Some(6)).unwrap().number,
            "EXP-2026/0007"
        );
        assert_eq!(
            format.scope(2026),
            NumberingScope::Template {
                template: "EXP-AAAA/NNNN".into(),
                year: Some(2026)
            }
        );

        let global = NumberFormat::custom("X-NNNN").unwrap();
        assert_eq!(global.scope(2026).year(), None);
    }

    #[test]
    fn template_without_sequence_is_rejected() {
        assert!(matches!(
            NumberFormat::custom("EXP-AAAA"),
            Err(NumberingError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            NumberFormat::custom("NNNN-NNNN"),
            Err(NumberingError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn exhausted_scopes_fail() {
        assert!(matches!(
            next_number(&NumberFormat::YearSequence, 2026, Some(MAX_SHORT_SEQUENCE)),
            Err(NumberingError::Exhausted { max: 9_999, .. })
        ));
        assert!(matches!(
            next_number(&NumberFormat::PlainSequence, 2026, Some(MAX_LONG_SEQUENCE)),
            Err(NumberingError::Exhausted { max: 99_999_999, .. })
        ));
        assert!(next_number(&NumberFormat::PlainSequence, 2026, Some(9_999)).is_ok());
    }

    #[test]
    fn parses_legacy_numbers() {
        assert_eq!(
            parse("20260015", 2026),
            ParsedNumber::YearSequence {
                year: 2026,
                sequence: 15
            }
        );
        assert_eq!(
            parse("20280015", 2026),
            ParsedNumber::PlainSequence { sequence: 20_280_015 }
        );
        assert_eq!(
            parse("00000123", 2026),
            ParsedNumber::PlainSequence { sequence: 123 }
        );
        assert_eq!(
            parse("GH-0012", 2026),
            ParsedNumber::PrefixSequence {
                prefix: "GH-".into(),
                sequence: 12
            }
        );
        assert_eq!(
            parse("AB12", 2026),
            ParsedNumber::PrefixSequence {
                prefix: "AB".into(),
                sequence: 12
            }
        );
        assert_eq!(parse("GH-", 2026), ParsedNumber::Custom("GH-".into()));
        assert_eq!(parse("2026-01", 2026), ParsedNumber::Custom("2026-01".into()));
    }

    #[test]
    fn scopes_match_their_own_numbers() {
        let prefix = NumberingScope::Prefix("GH".into());
        assert!(prefix.contains(NumberFormatKind::PrefixSequence, 2026, "GH0001"));
        assert!(!prefix.contains(NumberFormatKind::PrefixSequence, 2026, "GHX0001"));
        assert!(!prefix.contains(NumberFormatKind::YearSequence, 2026, "GH0001"));

        let year = NumberingScope::Year(2026);
        assert!(year.contains(NumberFormatKind::YearSequence, 2026, "20260001"));
        assert!(!year.contains(NumberFormatKind::YearSequence, 2025, "20250001"));

        let template = NumberFormat::custom("EXP-AAAA/NNNN").unwrap().scope(2026);
        assert!(template.contains(NumberFormatKind::Custom, 2026, "EXP-2026/0003"));
        assert!(!template.contains(NumberFormatKind::Custom, 2026, "EXP-2025/0003"));
    }

    #[test]
    fn format_from_str() {
        assert_eq!("year_sequence".parse::<NumberFormat>().unwrap(), NumberFormat::YearSequence);
        assert_eq!(
            "prefix_sequence:GH".parse::<NumberFormat>().unwrap(),
            NumberFormat::PrefixSequence { prefix: "GH".into() }
        );
        assert!("prefix_sequence".parse::<NumberFormat>().is_err());
        assert!("roman".parse::<NumberFormat>().is_err());
    }

    proptest! {
        #[test]
        fn issued_numbers_parse_back_into_their_scope(year in 2000i32..=2099, last in 0u32..9_998) {
            let issued = next_number(&NumberFormat::YearSequence, year, Some(last)).unwrap();
            prop_assert_eq!(issued.sequence, last + 1);
            prop_assert_eq!(
                parse(&issued.number, year),
                ParsedNumber::YearSequence { year, sequence: last + 1 }
            );
            prop_assert!(NumberingScope::Year(year).contains(issued.format, year, &issued.number));
        }

        #[test]
        fn next_number_is_strictly_increasing(last in 0u32..9_998) {
            let format = NumberFormat::prefix("FL").unwrap();
            let a = next_number(&format, 2026, Some(last)).unwrap();
            let b = next_number(&format, 2026, Some(a.sequence)).unwrap();
            prop_assert!(b.sequence > a.sequence);
            prop_assert!(b.number > a.number);
        }
    }
}
