//! Platform version compatibility expressions
//!
//! Bundles declare which platform versions they support through a free-form
//! label (`com.redhat.openshift.versions`). This module evaluates that label
//! against the single platform version an index image targets.
//!
//! ```text
//! =v4.9            exact
//! v4.6             exact (plain)
//! v4.5-v4.7        inclusive range
//! v4.5,v4.6        any of the listed versions
//! >=v4.10          lower bound
//! =v4.9|>=v4.12    alternatives
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use tracing::trace;

use crate::error::IibError;

/// Label carrying a bundle's compatibility expression
pub const OCP_VERSIONS_LABEL: &str = "com.redhat.openshift.versions";

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v?(\d+)\.(\d+)$").expect("version pattern is valid"));

/// A `vMAJOR.MINOR` platform version, ordered numerically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlatformVersion {
    pub major: u32,
    pub minor: u32,
}

impl PlatformVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    fn parse_token(token: &str) -> Option<Self> {
        let captures = VERSION_RE.captures(token.trim())?;
        let major = captures[1].parse().ok()?;
        let minor = captures[2].parse().ok()?;
        Some(Self { major, minor })
    }
}

impl FromStr for PlatformVersion {
    type Err = IibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_token(s).ok_or_else(|| IibError::InvalidPlatformVersion(s.to_string()))
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// One `|`-separated piece of an expression
#[derive(Debug, Clone, PartialEq, Eq)]
enum Alternative {
    Exact(PlatformVersion),
    AtLeast(PlatformVersion),
    Range(PlatformVersion, PlatformVersion),
    Plain(PlatformVersion),
    List(Vec<PlatformVersion>),
    Malformed,
}

impl Alternative {
    fn parse(raw: &str) -> Self {
        let token = raw.trim();

        if let Some(rest) = token.strip_prefix(">=") {
            return PlatformVersion::parse_token(rest).map_or(Self::Malformed, Self::AtLeast);
        }
        if let Some(rest) = token.strip_prefix('=') {
            return PlatformVersion::parse_token(rest).map_or(Self::Malformed, Self::Exact);
        }
        if let Some((low, high)) = token.split_once('-') {
            return match (
                PlatformVersion::parse_token(low),
                PlatformVersion::parse_token(high),
            ) {
                (Some(low), Some(high)) => Self::Range(low, high),
                _ => Self::Malformed,
            };
        }
        if token.contains(',') {
            let versions: Option<Vec<_>> =
                token.split(',').map(PlatformVersion::parse_token).collect();
            return versions.map_or(Self::Malformed, Self::List);
        }

        PlatformVersion::parse_token(token).map_or(Self::Malformed, Self::Plain)
    }

    fn is_operator(&self) -> bool {
        matches!(self, Self::Exact(_) | Self::AtLeast(_))
    }

    /// `inclusive_bound` controls whether `>=` accepts its own boundary
    fn accepts(&self, target: PlatformVersion, inclusive_bound: bool) -> bool {
        match self {
            Self::Exact(version) | Self::Plain(version) => *version == target,
            Self::AtLeast(bound) if inclusive_bound => target >= *bound,
            Self::AtLeast(bound) => target > *bound,
            Self::Range(low, high) => *low <= target && target <= *high,
            // A list names its versions exactly; it is not a lower bound
            Self::List(versions) => versions.contains(&target),
            Self::Malformed => false,
        }
    }
}

/// Evaluate a bundle's compatibility `expression` against `target`
///
/// Fails only when `target` is not a single `vMAJOR.MINOR` token; a bad
/// expression simply does not match.
///
/// Two behaviours of the reference tool are reproduced on purpose: a lone
/// `>=vA.B` does not accept `vA.B` itself, while a `>=` alternative inside a
/// `|` expression does; and a `|` expression mixing an unprefixed version
/// with `=`/`>=` alternatives matches nothing.
pub fn is_compatible(expression: &str, target: &str, allow_empty: bool) -> Result<bool, IibError> {
    let target: PlatformVersion = target.parse()?;
    let expression = expression.trim();

    if expression.is_empty() {
        return Ok(allow_empty);
    }

    let alternatives: Vec<Alternative> = expression.split('|').map(Alternative::parse).collect();
    trace!(expression, %target, ?alternatives, "Evaluating compatibility expression");

    if let [single] = alternatives.as_slice() {
        return Ok(single.accepts(target, false));
    }

    let has_plain = alternatives
        .iter()
        .any(|alternative| matches!(alternative, Alternative::Plain(_)));
    let has_operator = alternatives.iter().any(Alternative::is_operator);
    if has_plain && has_operator {
        return Ok(false);
    }

    Ok(alternatives
        .iter()
        .any(|alternative| alternative.accepts(target, true)))
}
