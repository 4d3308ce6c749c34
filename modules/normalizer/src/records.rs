//! Format parsers. Each turns raw stdout into flat records: field name to
//! string value, nested names joined with '.'.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use tool_registry::ExtractRule;

pub type Record = BTreeMap<String, String>;

/// One record per non-blank line. With a pattern, only matching lines count
/// and named captures become fields; `line` always holds the whole line.
pub fn from_lines(text: &str, pattern: Option<&Regex>) -> Vec<Record> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let mut rec = Record::new();
        if let Some(re) = pattern {
            let Some(caps) = re.captures(line) else { continue };
            for name in re.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    rec.insert(name.to_string(), m.as_str().trim().to_string());
                }
            }
        }
        rec.insert("line".to_string(), line.trim().to_string());
        out.push(rec);
    }
    out
}

pub fn from_json(raw: &[u8], rule: &ExtractRule) -> Result<Vec<Record>, String> {
    let doc: Value = serde_json::from_slice(raw).map_err(|e| format!("invalid JSON: {e}"))?;
    let at = doc
        .pointer(&rule.pointer)
        .ok_or_else(|| format!("JSON pointer {:?} not found", rule.pointer))?;
    let mut out = Vec::new();
    match at {
        Value::Array(items) => {
            for item in items {
                out.push(record_of(item));
            }
        }
        Value::Object(map) if rule.entries => {
            for (key, v) in map {
                let mut rec = record_of(v);
                rec.insert("key".to_string(), key.clone());
                out.push(rec);
            }
        }
        Value::Null => {}
        other => out.push(record_of(other)),
    }
    Ok(out)
}

fn record_of(v: &Value) -> Record {
    let mut rec = Record::new();
    match v {
        Value::Object(_) | Value::Array(_) => flatten("", v, &mut rec),
        Value::Null => {}
        scalar => {
            rec.insert("value".to_string(), scalar_text(scalar));
        }
    }
    rec
}

fn flatten(prefix: &str, v: &Value, rec: &mut Record) {
    let join = |k: &str| if prefix.is_empty() { k.to_string() } else { format!("{prefix}.{k}") };
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                flatten(&join(k), child, rec);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten(&join(&i.to_string()), child, rec);
            }
        }
        Value::Null => {}
        scalar => {
            rec.insert(prefix.to_string(), scalar_text(scalar));
        }
    }
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
