//! Capability registry: maps a capability name to the tool that implements it.
//!
//! Built once at startup from the bundled table plus configuration and
//! read-only afterwards; there is no API that adds a tool to a live registry.

mod spec;
pub mod target;

pub use spec::*;

use engine_core::EngineError;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const BUILTIN: &str = include_str!("builtin.yaml");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to parse tool table: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("capability {capability}: invalid {what} regex: {source}")]
    Pattern {
        capability: String,
        what: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("capability {capability}: {reason}")]
    Invalid { capability: String, reason: String },
    #[error("capability {0} defined twice")]
    Duplicate(String),
}

struct Entry {
    spec: Arc<ToolSpec>,
    target_re: Option<Regex>,
}

/// A validated request ready for the process runner.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub spec: Arc<ToolSpec>,
    pub target: String,
    pub args: Vec<String>,
}

pub struct Registry {
    tools: BTreeMap<String, Entry>,
}

impl Registry {
    /// The bundled tool table.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_specs(builtin_specs()?)
    }

    pub fn from_specs(specs: Vec<ToolSpec>) -> Result<Self, RegistryError> {
        let mut tools = BTreeMap::new();
        for spec in specs {
            let name = spec.capability.clone();
            let entry = build_entry(spec)?;
            if tools.insert(name.clone(), entry).is_some() {
                return Err(RegistryError::Duplicate(name));
            }
        }
        Ok(Registry { tools })
    }

    /// Consumes the registry, replacing or adding `tools` and dropping `disable`.
    pub fn with_overrides(mut self, tools: Vec<ToolSpec>, disable: &[String]) -> Result<Self, RegistryError> {
        for spec in tools {
            debug!(capability = %spec.capability, executable = %spec.executable, "tool override");
            let name = spec.capability.clone();
            self.tools.insert(name, build_entry(spec)?);
        }
        for name in disable {
            self.tools.remove(name);
        }
        Ok(self)
    }

    pub fn lookup(&self, capability: &str) -> Result<Arc<ToolSpec>, EngineError> {
        self.tools
            .get(capability)
            .map(|e| e.spec.clone())
            .ok_or_else(|| EngineError::CapabilityNotFound(capability.to_string()))
    }

    /// Validates `target` for `capability` and builds the argument vector.
    pub fn prepare(&self, capability: &str, target: &str) -> Result<Invocation, EngineError> {
        let entry = self
            .tools
            .get(capability)
            .ok_or_else(|| EngineError::CapabilityNotFound(capability.to_string()))?;
        target::validate(entry.spec.target, entry.target_re.as_ref(), target)
            .map_err(|reason| EngineError::Validation(format!("{capability}: {reason}")))?;
        Ok(Invocation { spec: entry.spec.clone(), target: target.to_string(), args: entry.spec.build_args(target) })
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values().map(|e| e.spec.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

pub fn builtin_specs() -> Result<Vec<ToolSpec>, RegistryError> {
    Ok(serde_yaml::from_str(BUILTIN)?)
}

fn build_entry(spec: ToolSpec) -> Result<Entry, RegistryError> {
    let invalid = |reason: &str| RegistryError::Invalid { capability: spec.capability.clone(), reason: reason.to_string() };
    if spec.capability.trim().is_empty() {
        return Err(invalid("empty capability name"));
    }
    if spec.executable.trim().is_empty() {
        return Err(invalid("empty executable"));
    }
    if !spec.args.iter().any(|a| a.contains(TARGET_PLACEHOLDER)) {
        return Err(invalid("no argument references {target}"));
    }
    if spec.max_output_bytes == 0 || spec.timeout_secs == 0 {
        return Err(invalid("timeout and output cap must be positive"));
    }
    if let Some(p) = &spec.extract.line_pattern {
        Regex::new(p).map_err(|source| RegistryError::Pattern {
            capability: spec.capability.clone(),
            what: "line_pattern",
            source,
        })?;
    }
    let target_re = match (&spec.target, &spec.target_pattern) {
        (TargetKind::Pattern, Some(p)) => Some(Regex::new(p).map_err(|source| RegistryError::Pattern {
            capability: spec.capability.clone(),
            what: "target_pattern",
            source,
        })?),
        (TargetKind::Pattern, None) => return Err(invalid("target kind `pattern` needs target_pattern")),
        _ => None,
    };
    Ok(Entry { spec: Arc::new(spec), target_re })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ToolSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn builtin_table_loads() {
        let reg = Registry::builtin().unwrap();
        for cap in [
            "dns-lookup",
            "subdomain-enum",
            "port-scan",
            "whois",
            "sql-injection",
            "tech-stack",
            "npm-package",
            "npm-audit",
            "npm-outdated",
            "email-security",
        ] {
            assert!(reg.lookup(cap).is_ok(), "{cap} missing");
        }
        assert_eq!(reg.lookup("port-scan").unwrap().output_format, OutputFormat::Xml);
    }

    #[test]
    fn unknown_capability() {
        let reg = Registry::builtin().unwrap();
        assert_eq!(reg.lookup("exploit").unwrap_err(), EngineError::CapabilityNotFound("exploit".into()));
        assert!(matches!(reg.prepare("exploit", "x"), Err(EngineError::CapabilityNotFound(_))));
    }

    #[test]
    fn prepare_validates_before_building_args() {
        let reg = Registry::builtin().unwrap();
        assert!(matches!(reg.prepare("port-scan", ""), Err(EngineError::Validation(_))));
        assert!(matches!(reg.prepare("port-scan", "--script=evil"), Err(EngineError::Validation(_))));
        let inv = reg.prepare("port-scan", "192.168.1.0/24").unwrap();
        assert_eq!(inv.args.last().map(String::as_str), Some("192.168.1.0/24"));
        assert_eq!(inv.spec.executable, "nmap");
    }

    #[test]
    fn project_and_mail_capabilities() {
        let reg = Registry::builtin().unwrap();
        let inv = reg.prepare("npm-audit", "/srv/app").unwrap();
        assert_eq!(inv.args, vec!["audit", "--json", "--prefix", "/srv/app"]);
        assert_eq!(reg.lookup("npm-audit").unwrap().success_exit_codes, vec![0, 1]);
        assert!(matches!(reg.prepare("npm-audit", "relative/dir"), Err(EngineError::Validation(_))));
        assert!(matches!(reg.prepare("npm-outdated", "/srv/app;rm"), Err(EngineError::Validation(_))));

        let inv = reg.prepare("email-security", "example.com").unwrap();
        assert!(inv.args.contains(&"_dmarc.example.com".to_string()));
        assert_eq!(inv.args.iter().filter(|a| a.as_str() == "example.com").count(), 2);
    }

    #[test]
    fn overrides_replace_and_disable() {
        let mock = spec(
            r#"
capability: dns-lookup
executable: /bin/echo
args: ["{target}"]
output_format: lines
"#,
        );
        let reg = Registry::builtin().unwrap().with_overrides(vec![mock], &["whois".to_string()]).unwrap();
        assert_eq!(reg.lookup("dns-lookup").unwrap().executable, "/bin/echo");
        assert!(reg.lookup("whois").is_err());
    }

    #[test]
    fn rejects_bad_definitions() {
        let no_placeholder = spec("capability: x\nexecutable: echo\nargs: [hi]\noutput_format: lines\n");
        assert!(matches!(Registry::from_specs(vec![no_placeholder]), Err(RegistryError::Invalid { .. })));

        let bad_re = spec(
            "capability: x\nexecutable: echo\nargs: ['{target}']\noutput_format: lines\nextract:\n  line_pattern: '(unclosed'\n",
        );
        assert!(matches!(Registry::from_specs(vec![bad_re]), Err(RegistryError::Pattern { .. })));

        let a = spec("capability: x\nexecutable: echo\nargs: ['{target}']\noutput_format: lines\n");
        assert!(matches!(Registry::from_specs(vec![a.clone(), a]), Err(RegistryError::Duplicate(_))));
    }

    #[test]
    fn pattern_targets() {
        let s = spec(
            "capability: hash\nexecutable: echo\nargs: ['{target}']\noutput_format: lines\ntarget: pattern\ntarget_pattern: '[a-f0-9]{32}'\n",
        );
        let reg = Registry::from_specs(vec![s]).unwrap();
        assert!(reg.prepare("hash", "5d41402abc4b2a76b9719d911017c592").is_ok());
        assert!(reg.prepare("hash", "5d41402abc4b2a76b9719d911017c592x").is_err());
    }
}
