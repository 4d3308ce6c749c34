use anyhow::{Context, Result};
use scan_scheduler::EngineConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tool_registry::{Registry, ToolSpec};

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub engine: EngineConfig,
    /// Added to the built-ins; a matching capability replaces the built-in entry.
    pub tools: Vec<ToolSpec>,
    pub disable: Vec<String>,
    pub archive: ArchiveConfig,
}

impl Config {
    pub fn registry(&self) -> Result<Registry> {
        let reg = Registry::builtin()
            .context("loading built-in tools")?
            .with_overrides(self.tools.clone(), &self.disable)
            .context("applying tools from config")?;
        Ok(reg)
    }
}

/// Explicit `--config` must exist; otherwise ./scantool.yaml is read when present.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("scantool.yaml");
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let cfg = parse(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(cfg))
}

fn parse(s: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(s)?;
    cfg.engine.validate().map_err(anyhow::Error::msg)?;
    Ok(cfg)
}

/// Logs go to stderr so stdout carries only results.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let _ = if json { builder.json().try_init() } else { builder.try_init() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tool_registry::OutputFormat;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse("{}").unwrap();
        assert_eq!(cfg.engine, EngineConfig::default());
        assert!(cfg.tools.is_empty());
        assert!(cfg.archive.path.is_none());
    }

    #[test]
    fn sections_are_read() {
        let yaml = r#"
engine:
  global_max_concurrent: 8
  per_owner_max_concurrent: 1
  overflow: kill
tools:
  - capability: dns-lookup
    executable: /usr/bin/host
    args: ["{target}"]
    target: hostname
    output_format: lines
disable: [whois]
archive:
  path: /var/lib/scantool/archive.db
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.engine.global_max_concurrent, 8);
        assert_eq!(cfg.engine.per_owner_max_concurrent, 1);
        assert_eq!(cfg.engine.max_queued, 256);
        assert_eq!(cfg.tools[0].output_format, OutputFormat::Lines);
        assert_eq!(cfg.archive.path.as_deref(), Some(Path::new("/var/lib/scantool/archive.db")));

        let reg = cfg.registry().unwrap();
        assert_eq!(reg.lookup("dns-lookup").unwrap().executable, "/usr/bin/host");
        assert!(reg.lookup("whois").is_err());
        assert!(reg.lookup("port-scan").is_ok());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse("engine:\n  global_max_concurrent: 0\n").is_err());
        assert!(parse("engine:\n  workers: 3\n").is_err());
        assert!(parse("scan:\n  ports: 1-1024\n").is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/scantool.yaml"))).is_err());
    }
}
