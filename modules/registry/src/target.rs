//! Target grammars. Arguments reach tools as argv elements, so these checks
//! are about rejecting option injection and garbage, not shell quoting.

use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use url::Url;

use crate::spec::TargetKind;

pub const MAX_TARGET_LEN: usize = 2048;

pub fn validate(kind: TargetKind, pattern: Option<&Regex>, target: &str) -> Result<(), String> {
    if target.is_empty() {
        return Err("target must not be empty".into());
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(format!("target longer than {MAX_TARGET_LEN} bytes"));
    }
    if target.starts_with('-') {
        return Err("target must not start with '-'".into());
    }
    if target.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("target contains whitespace or control characters".into());
    }
    let ok = match kind {
        TargetKind::Hostname => is_hostname(target),
        TargetKind::Host => is_host(target),
        TargetKind::HostOrCidr => is_host(target) || target.parse::<IpNet>().is_ok(),
        TargetKind::Url => is_web_url(target),
        TargetKind::Package => package_re().is_match(target),
        TargetKind::Pattern => pattern.map(|re| full_match(re, target)).unwrap_or(false),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("target {target:?} is not a valid {}", describe(kind)))
    }
}

fn describe(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Hostname => "hostname",
        TargetKind::Host => "hostname or IP address",
        TargetKind::HostOrCidr => "hostname, IP address or CIDR block",
        TargetKind::Url => "http(s) URL",
        TargetKind::Package => "package name",
        TargetKind::Pattern => "target for this capability",
    }
}

/// RFC 1123 labels; underscores tolerated for service records like `_dmarc`.
pub fn is_hostname(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    // an all-numeric top label reads as a malformed address, not a name
    if s.rsplit('.').next().is_some_and(|tld| tld.bytes().all(|b| b.is_ascii_digit())) {
        return false;
    }
    s.split('.').all(|label| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= 63
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
            && bytes[0] != b'-'
            && bytes[bytes.len() - 1] != b'-'
    })
}

pub fn is_host(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok() || is_hostname(s)
}

fn is_web_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().map(|h| !h.is_empty()).unwrap_or(false),
        Err(_) => false,
    }
}

fn full_match(re: &Regex, s: &str) -> bool {
    re.find(s).map(|m| m.start() == 0 && m.end() == s.len()).unwrap_or(false)
}

fn package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(@[a-z0-9~][a-z0-9._~-]*/)?[a-z0-9~][a-z0-9._~-]*(@[A-Za-z0-9._^~<>=*-]+)?$")
            .expect("package name regex")
    })
}
