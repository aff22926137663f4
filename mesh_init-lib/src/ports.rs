//! Parsing and validation of TCP port and port-range tokens.
//!
//! Port lists arrive as raw strings (`"22"`, `"8000-8999"`); they are parsed
//! lazily right before rule construction so that a single bad token can be
//! skipped without aborting the whole batch.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("\"{0}\" is not a valid TCP port")]
    InvalidPort(String),
    #[error("\"{0}\" is not a valid lower-bound")]
    InvalidLowerBound(String),
    #[error("\"{0}\" is not a valid upper-bound")]
    InvalidUpperBound(String),
    #[error("\"{0}\": upper-bound must be greater than or equal to lower-bound")]
    UpperBelowLower(String),
    #[error("\"{0}\": ranges expected as <lower>-<upper>")]
    MalformedRange(String),
}

/// Inclusive range of TCP ports. A single port is a range with equal bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lower: u16,
    pub upper: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { lower: port, upper: port }
    }

    pub fn is_single(&self) -> bool {
        self.lower == self.upper
    }

    /// Number of port references the multiport match charges for this range:
    /// one for a single port, two for a genuine range regardless of its width.
    pub fn port_refs(&self) -> usize {
        if self.is_single() { 1 } else { 2 }
    }
}

/// Renders the range in multiport destination syntax: `22` or `25:27`.
impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.lower)
        } else {
            write!(f, "{}:{}", self.lower, self.upper)
        }
    }
}

/// Reports whether the candidate lies in the valid TCP port domain [0, 65535].
pub fn is_valid(port: i64) -> bool {
    (0..=65535).contains(&port)
}

/// Parses and validates a single port token.
pub fn parse_port(port: &str) -> Result<u16, Error> {
    port.parse::<u16>().map_err(|_| Error::InvalidPort(port.to_string()))
}

/// Parses a port or port-range token into a validated [`PortRange`].
///
/// A bare integer yields a range with equal bounds; `<lower>-<upper>` yields
/// a genuine range. Any other shape is rejected.
pub fn parse_port_range(token: &str) -> Result<PortRange, Error> {
    let bounds: Vec<&str> = token.split('-').collect();
    match bounds.as_slice() {
        [port] => Ok(PortRange::single(parse_port(port)?)),
        [lower, upper] => {
            let lower = lower
                .parse::<u16>()
                .map_err(|_| Error::InvalidLowerBound(lower.to_string()))?;
            let upper = upper
                .parse::<u16>()
                .map_err(|_| Error::InvalidUpperBound(upper.to_string()))?;
            if upper < lower {
                return Err(Error::UpperBelowLower(token.to_string()));
            }
            Ok(PortRange { lower, upper })
        }
        _ => Err(Error::MalformedRange(token.to_string())),
    }
}
