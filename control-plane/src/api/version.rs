//! `Infra-Version` parsing and ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use service_core::error::AppError;

pub const HEADER: &str = "infra-version";

/// `major.minor.patch[-pre]`. A prerelease sorts before the release of the
/// same triple; two prereleases compare lexically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let (core, pre) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(format!("invalid version {:?}", s)),
            None => (s, None),
        };
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("invalid version {:?}", s));
        }
        let number = |p: &str| p.parse::<u64>().map_err(|_| format!("invalid version {:?}", s));
        Ok(Version {
            major: number(parts[0])?,
            minor: number(parts[1])?,
            patch: number(parts[2])?,
            pre,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

/// The version a client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientVersion {
    Latest,
    Exact(Version),
}

impl ClientVersion {
    /// Parses the header value. `None` means the header was absent.
    pub fn from_header(value: Option<&str>, required: bool) -> Result<Self, AppError> {
        match value.map(str::trim) {
            None | Some("") if required => Err(AppError::bad_request("Infra-Version header is required")),
            None | Some("") | Some("latest") => Ok(ClientVersion::Latest),
            Some(raw) => raw
                .parse()
                .map(ClientVersion::Exact)
                .map_err(|_| AppError::bad_request(format!("invalid Infra-Version header {:?}", raw))),
        }
    }

    /// True when a client at this version still speaks the shape that
    /// changed after `breakpoint`.
    pub fn at_or_before(&self, breakpoint: &Version) -> bool {
        match self {
            ClientVersion::Latest => false,
            ClientVersion::Exact(v) => v <= breakpoint,
        }
    }
}
