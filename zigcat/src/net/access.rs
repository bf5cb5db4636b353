use std::cmp::min;
use std::fmt;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Component, Path};
use std::time::Duration;

/// Hard cap on rule file size.
pub const MAX_RULE_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug)]
pub enum AccessError {
    Parse { line: usize, reason: String },
    BadRule { rule: String, reason: String },
    PathTraversal(String),
    FileTooLarge(u64),
    Io(io::Error),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Parse { line, reason } => {
                write!(f, "rule file line {}: {}", line, reason)
            }
            AccessError::BadRule { rule, reason } => write!(f, "rule '{}': {}", rule, reason),
            AccessError::PathTraversal(path) => {
                write!(f, "rule file path '{}' contains a parent traversal", path)
            }
            AccessError::FileTooLarge(size) => {
                write!(f, "rule file is {} bytes, cap is {}", size, MAX_RULE_FILE_BYTES)
            }
            AccessError::Io(err) => write!(f, "rule file i/o error: {}", err),
        }
    }
}

impl From<io::Error> for AccessError {
    fn from(err: io::Error) -> Self {
        AccessError::Io(err)
    }
}

/// One access rule: a literal address or an address/prefix block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Rule {
    Addr(IpAddr),
    Cidr { base: IpAddr, prefix: u8 },
}

impl Rule {
    pub fn parse(text: &str) -> Result<Rule, String> {
        match text.find('/') {
            None => text
                .parse::<IpAddr>()
                .map(Rule::Addr)
                .map_err(|_| format!("'{}' is not an IP address", text)),
            Some(slash) => {
                let (addr_part, prefix_part) = text.split_at(slash);
                let base = addr_part
                    .parse::<IpAddr>()
                    .map_err(|_| format!("'{}' is not an IP address", addr_part))?;
                let prefix = prefix_part[1..]
                    .parse::<u8>()
                    .map_err(|_| format!("'{}' is not a prefix length", &prefix_part[1..]))?;

                let max_prefix = match base {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if prefix > max_prefix {
                    return Err(format!(
                        "prefix /{} exceeds maximum /{} for this family",
                        prefix, max_prefix
                    ));
                }

                Ok(Rule::Cidr { base, prefix })
            }
        }
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match *self {
            Rule::Addr(addr) => addr == ip,
            Rule::Cidr { base, prefix } => match (base, ip) {
                (IpAddr::V4(net), IpAddr::V4(host)) => {
                    if prefix == 0 {
                        return true;
                    }
                    let shift = 32 - u32::from(prefix);
                    u32::from(net) >> shift == u32::from(host) >> shift
                }
                (IpAddr::V6(net), IpAddr::V6(host)) => {
                    if prefix == 0 {
                        return true;
                    }
                    let shift = 128 - u32::from(prefix);
                    u128::from(net) >> shift == u128::from(host) >> shift
                }
                _ => false,
            },
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    Allowed,
    Denied,
}

/// Ordered allow/deny rule sets. Deny rules are consulted first; when an
/// allow list is present, addresses matching neither list are denied,
/// otherwise the default is open.
#[derive(Default, Debug)]
pub struct AccessList {
    allow: Vec<Rule>,
    deny: Vec<Rule>,
}

impl AccessList {
    pub fn new() -> AccessList {
        AccessList::default()
    }

    pub fn push_allow(&mut self, rule: Rule) {
        self.allow.push(rule);
    }

    pub fn push_deny(&mut self, rule: Rule) {
        self.deny.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    pub fn evaluate(&self, ip: IpAddr) -> Verdict {
        if self.deny.iter().any(|rule| rule.matches(ip)) {
            return Verdict::Denied;
        }
        if self.allow.iter().any(|rule| rule.matches(ip)) {
            return Verdict::Allowed;
        }
        if self.allow.is_empty() {
            Verdict::Allowed
        } else {
            Verdict::Denied
        }
    }
}

/// Loads one-rule-per-line text: `#` comment lines and blank lines are
/// skipped, surrounding whitespace is trimmed. The path is refused if it
/// climbs out of its directory, the file if it exceeds the size cap.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>, AccessError> {
    load_rules_capped(path, MAX_RULE_FILE_BYTES)
}

fn load_rules_capped(path: &Path, cap: u64) -> Result<Vec<Rule>, AccessError> {
    if path
        .components()
        .any(|component| component == Component::ParentDir)
    {
        return Err(AccessError::PathTraversal(path.display().to_string()));
    }

    let size = fs::metadata(path)?.len();
    if size > cap {
        return Err(AccessError::FileTooLarge(size));
    }

    let text = fs::read_to_string(path)?;
    let mut rules = Vec::new();

    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let rule = Rule::parse(line).map_err(|reason| AccessError::Parse {
            line: index + 1,
            reason,
        })?;
        rules.push(rule);
    }

    Ok(rules)
}

/// Escalating sleep after repeated denials on one accept loop. Below the
/// threshold a denial is a silent close; past it each further denial doubles
/// the pre-accept sleep up to the cap. Any allowed accept resets the run.
#[derive(Debug)]
pub struct DenialBackoff {
    consecutive: u32,
    threshold: u32,
    initial: Duration,
    cap: Duration,
}

/// Bound on the doubling exponent so the shift cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 10;

impl DenialBackoff {
    pub fn new(threshold: u32, initial: Duration, cap: Duration) -> DenialBackoff {
        DenialBackoff {
            consecutive: 0,
            threshold,
            initial,
            cap,
        }
    }

    pub fn default_policy() -> DenialBackoff {
        DenialBackoff::new(5, Duration::from_millis(10), Duration::from_millis(1000))
    }

    /// Records one denial. Returns the sleep to apply before the next accept,
    /// or `None` while the run is still within the threshold: the first
    /// `threshold` denials are silent closes, the one after them sleeps the
    /// initial duration, and each further denial doubles it up to the cap.
    pub fn on_denied(&mut self) -> Option<Duration> {
        self.consecutive = self.consecutive.saturating_add(1);

        if self.consecutive <= self.threshold {
            return None;
        }

        let shift = min(self.consecutive - self.threshold - 1, MAX_BACKOFF_SHIFT);
        let millis = self.initial.as_millis() as u64;
        let slept = Duration::from_millis(millis.saturating_mul(1u64 << shift));
        Some(min(slept, self.cap))
    }

    pub fn on_allowed(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
