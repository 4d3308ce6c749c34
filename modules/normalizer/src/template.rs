use engine_core::{Finding, Severity};
use tool_registry::{FindingTemplate, SeverityTable};

use crate::records::Record;

/// Replaces `{field}` with the record's value. Unknown fields render empty
/// and runs of whitespace collapse, so missing optional fields leave no gaps.
pub fn render(template: &str, rec: &Record) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_field_name(&after[..end]) => {
                if let Some(v) = rec.get(&after[..end]) {
                    out.push_str(v);
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_field_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub fn classify(table: &SeverityTable, rec: &Record, text: &str) -> Severity {
    if let Some(sev) = table.field.as_ref().and_then(|f| rec.get(f)).and_then(|v| Severity::parse_loose(v)) {
        return sev;
    }
    let haystack = text.to_lowercase();
    table
        .keywords
        .iter()
        .find(|rule| haystack.contains(&rule.keyword.to_lowercase()))
        .map(|rule| rule.severity)
        .unwrap_or(table.default)
}

pub fn finding(template: &FindingTemplate, table: &SeverityTable, rec: &Record, fallback_title: &str) -> Finding {
    let mut title = render(&template.title, rec);
    if title.is_empty() {
        title = fallback_title.to_string();
    }
    let description = render(&template.description, rec);
    let evidence = render(&template.evidence, rec);
    let severity = classify(table, rec, &format!("{title}\n{description}\n{evidence}"));
    Finding::new(title, severity).with_description(description).with_evidence(evidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tool_registry::SeverityRule;

    fn rec(pairs: &[(&str, &str)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_fields() {
        let r = rec(&[("portid", "22"), ("protocol", "tcp"), ("service.name", "ssh")]);
        assert_eq!(render("Open port {portid}/{protocol}", &r), "Open port 22/tcp");
        assert_eq!(render("{service.name} {service.product} {service.version}", &r), "ssh");
        assert_eq!(render("{missing}", &r), "");
    }

    #[test]
    fn non_placeholders_stay_literal() {
        let r = rec(&[("a", "1")]);
        assert_eq!(render("{a} {not a field} {", &r), "1 {not a field} {");
        assert_eq!(render("json: {\"k\": {a}}", &r), "json: {\"k\": 1}");
    }

    #[test]
    fn severity_order_of_precedence() {
        let table = SeverityTable {
            field: Some("severity".into()),
            keywords: vec![
                SeverityRule { keyword: "AGPL".into(), severity: Severity::High },
                SeverityRule { keyword: "LGPL".into(), severity: Severity::Medium },
            ],
            default: Severity::Low,
        };
        assert_eq!(classify(&table, &rec(&[("severity", "moderate")]), "AGPL"), Severity::Medium);
        assert_eq!(classify(&table, &rec(&[("severity", "bogus")]), "license lgpl-2.1"), Severity::Medium);
        assert_eq!(classify(&table, &rec(&[]), "license MIT"), Severity::Low);
    }

    #[test]
    fn empty_title_falls_back() {
        let t = FindingTemplate { title: "{nothing}".into(), ..FindingTemplate::default() };
        let f = finding(&t, &SeverityTable::default(), &rec(&[("line", "x")]), "whois");
        assert_eq!(f.title, "whois");
        assert_eq!(f.evidence, "x");
        assert_eq!(f.severity, Severity::Info);
    }
}
