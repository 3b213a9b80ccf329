use std::{cmp::Ordering, fmt};

use anyhow::{anyhow, bail, Result};
use nix::sys::utsname::uname;
use regex::Regex;

/// Represents a kernel version, eg. 6.2.14-300.fc38.x86_64
#[derive(Debug)]
pub struct KernelVersion {
    /// Major number, eg. 6.
    major: u32,
    /// Minor number, eg. 2.
    minor: u32,
    /// Patch number, eg. 14.
    patch: u32,
    /// Build number, eg. 300.
    build: Option<u32>,
    /// Full kernel release version, same as `$(uname -r)`, eg.
    /// 6.2.14-300.fc38.x86_64.
    pub full: String,
}

impl KernelVersion {
    /// Version of the running kernel.
    pub fn current() -> Result<Self> {
        Self::parse(
            uname()
                .map_err(|e| anyhow!("Failed to get kernel version information: {e}"))?
                .release()
                .to_str()
                .ok_or_else(|| anyhow!("Could not convert kernel version to str"))?,
        )
    }

    /// Parse a version string of the `$(uname -r)` form into a KernelVersion.
    pub fn parse(version: &str) -> Result<Self> {
        let mut parts = version.split('.');

        let major: u32 = parts
            .next()
            .ok_or_else(|| anyhow!("Could not get kernel major version from {version}"))?
            .parse()?;
        let minor: u32 = parts
            .next()
            .ok_or_else(|| anyhow!("Could not get kernel minor version from {version}"))?
            .parse()?;
        let mut tmp = parts
            .next()
            .ok_or_else(|| anyhow!("Could not get kernel patch-build version from {version}"))?
            .split('-');
        let patch: u32 = tmp
            .next()
            .ok_or_else(|| anyhow!("Could not get kernel patch version from {version}"))?
            .trim_end_matches('+')
            .parse()?;

        // Build can be in any position of the remaining string, e.g:
        // 6.2.0-20-generic or 6.4.12-arch1-1.
        let build = tmp.find_map(|s| s.parse::<u32>().ok());

        Ok(KernelVersion {
            major,
            minor,
            patch,
            build,
            full: version.to_string(),
        })
    }

    /// Version in the `LINUX_VERSION_CODE` format, as expected by the kernel
    /// when loading kprobe programs on old releases.
    pub fn code(&self) -> u32 {
        (self.major << 16) + (self.minor << 8) + self.patch.min(255)
    }

    /// Does this version match the requirement? See `KernelVersionReq::parse`
    /// for the format.
    pub fn matches(&self, req: &str) -> Result<bool> {
        Ok(KernelVersionReq::parse(req)?.matches(self))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full)
    }
}

/// Represents requirements for testing kernel versions. Can hold up to two
/// comparators to express things like "> 6.2, <= 6.5"
#[derive(Debug)]
pub struct KernelVersionReq(Vec<KernelVersionCmp>);

impl KernelVersionReq {
    /// Parse a requirement str into a kernel version requirement obj.
    ///
    /// The requirement str is defined as follows:
    /// - Supported operators are: =, >, <, >=, <= and !=.
    /// - Kernel versions are expressed in the "major.minor.patch-build" form,
    ///   only the major number is mandatory.
    /// - One requirement must follow: "<op><version>" with optional spaces
    ///   after the operation identifier.
    /// - Two requirements can be combined using a comma (,) as follows:
    ///   "<req1>,<req2>" with optional spaces around the requirements.
    ///
    /// Examples:
    /// ```
    /// use uplink::core::inspect::KernelVersionReq;
    ///
    /// assert!(KernelVersionReq::parse(">= 4.17").is_ok());
    /// assert!(KernelVersionReq::parse("> 4, < 5.0").is_ok());
    /// ```
    pub fn parse(req: &str) -> Result<Self> {
        let cmps = match req.split_once(',') {
            Some((a, b)) => vec![
                KernelVersionCmp::parse(a.trim())?,
                KernelVersionCmp::parse(b.trim())?,
            ],
            None => vec![KernelVersionCmp::parse(req)?],
        };

        Ok(KernelVersionReq(cmps))
    }

    /// Matches a kernel version against version requirements, return true if
    /// the kernel version matches the requirements.
    pub fn matches(&self, version: &KernelVersion) -> bool {
        self.0.iter().all(|cmp| cmp.compare(version))
    }
}

/// Represents a kernel version comparator. See documentation of
/// `KernelVersion` for a description of the members.
#[derive(Debug)]
struct KernelVersionCmp {
    op: Operator,
    major: u32,
    minor: Option<u32>,
    patch: Option<u32>,
    build: Option<u32>,
}

impl KernelVersionCmp {
    /// Parse one requirement expression and convert it to a kernel comparison
    /// operator. See `KernelVersionReq::parse` for more information on the
    /// requirement str format.
    fn parse(req: &str) -> Result<Self> {
        // Two-char operators first, so ">=" isn't read as ">".
        let re = Regex::new(r"^(>=|<=|!=|=|>|<)\s*(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-(\d+))?")?;
        let matches = re
            .captures(req.trim())
            .ok_or_else(|| anyhow!("Couldn't capture version members in {req}"))?;

        let op = match matches.get(1).map(|op| op.as_str()) {
            Some("=") => Operator::Eq,
            Some("!=") => Operator::Ne,
            Some(">") => Operator::Gt,
            Some("<") => Operator::Lt,
            Some(">=") => Operator::Ge,
            Some("<=") => Operator::Le,
            Some(x) => bail!("Invalid operator {x}"),
            None => bail!("No operator found in version comparator"),
        };

        let convert = |from: Option<regex::Match>| -> Result<Option<u32>> {
            Ok(match from {
                Some(x) => Some(x.as_str().parse()?),
                None => None,
            })
        };

        let major = match matches.get(2) {
            Some(major) => major.as_str().parse()?,
            None => bail!("Invalid version comparator, no major version found"),
        };

        Ok(KernelVersionCmp {
            op,
            major,
            minor: convert(matches.get(3))?,
            patch: convert(matches.get(4))?,
            build: convert(matches.get(5))?,
        })
    }

    /// Compare a kernel version againt the comparator. Returns true if the
    /// kernel version matches the requirements.
    fn compare(&self, version: &KernelVersion) -> bool {
        self.op.matches_order(self.order(version))
    }

    fn order(&self, version: &KernelVersion) -> Ordering {
        if version.major != self.major {
            return version.major.cmp(&self.major);
        }

        match self.minor {
            Some(minor) if version.minor != minor => return version.minor.cmp(&minor),
            Some(_) => (),
            None => return Ordering::Equal,
        }

        match self.patch {
            Some(patch) if version.patch != patch => return version.patch.cmp(&patch),
            Some(_) => (),
            None => return Ordering::Equal,
        }

        match (self.build, version.build) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Operator {
    /// Checks of the current operator matches its Ordering counterpart.
    fn matches_order(&self, ord: Ordering) -> bool {
        match self {
            Operator::Eq => ord == Ordering::Equal,
            Operator::Ne => ord != Ordering::Equal,
            Operator::Gt => ord == Ordering::Greater,
            Operator::Lt => ord == Ordering::Less,
            Operator::Ge => ord != Ordering::Less,
            Operator::Le => ord != Ordering::Greater,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version() {
        assert!(KernelVersion::current().is_ok());

        let version = KernelVersion::parse("6.2.14-300.fc38.x86_64").unwrap();
        assert_eq!(version.major, 6);
        assert_eq!(version.minor, 2);
        assert_eq!(version.patch, 14);
        assert_eq!(version.build, Some(300));
        assert_eq!(format!("{version}"), "6.2.14-300.fc38.x86_64");

        let version = KernelVersion::parse("4.19.0+").unwrap();
        assert_eq!(version.patch, 0);
        assert_eq!(version.build, None);

        let version = KernelVersion::parse("6.4.12-arch1-1").unwrap();
        assert_eq!(version.build, Some(1));

        assert!(KernelVersion::parse("6.2").is_err());
        assert!(KernelVersion::parse("six.2.1").is_err());
    }

    #[test]
    fn version_code() {
        assert_eq!(KernelVersion::parse("4.17.0").unwrap().code(), 0x041100);
        assert_eq!(KernelVersion::parse("5.4.300-1").unwrap().code(), 0x0504ff);
    }

    #[test]
    fn kernel_version_match() {
        let version = KernelVersion::parse("5.0.21-300.fc30.x86_64").unwrap();

        let check = |req: &str| version.matches(req).unwrap();

        assert!(check("= 5.0.21-300"));
        assert!(check("= 5.0"));
        assert!(!check("= 5.0.22"));

        assert!(check(">= 4.17"));
        assert!(check(">= 5.0"));
        assert!(check(">= 5"));
        assert!(!check(">= 5.1"));

        assert!(check("> 4.20"));
        assert!(!check("> 5.0"));
        assert!(check("< 5.1"));
        assert!(!check("< 4.17"));
        assert!(check("<= 5.0.21"));

        assert!(check("!= 4"));
        assert!(!check("!= 5.0.21"));

        assert!(check("> 4, < 5.1"));
        assert!(!check("> 4, < 5.0"));

        assert!(version.matches("~ 5").is_err());
        assert!(version.matches("5.0").is_err());
    }
}
