use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::records::Record;

struct Open {
    depth: usize,
    rec: Record,
}

/// One record per `element`: its own attributes by name, descendant
/// attributes as `child.attr`, text as the element path (`text` for the
/// element itself). The first occurrence of a field wins.
pub fn from_xml(text: &str, element: &str) -> Result<Vec<Record>, String> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut open: Option<Open> = None;
    let mut out = Vec::new();
    let mut saw_element = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("invalid XML at byte {}: {e}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => {
                saw_element = true;
                let name = local_name(&e);
                stack.push(name);
                enter(&e, element, &stack, &mut open)?;
            }
            Event::Empty(e) => {
                saw_element = true;
                stack.push(local_name(&e));
                enter(&e, element, &stack, &mut open)?;
                leave(&stack, &mut open, &mut out);
                stack.pop();
            }
            Event::End(_) => {
                leave(&stack, &mut open, &mut out);
                stack.pop();
            }
            Event::Text(t) => {
                let s = t.unescape().map_err(|e| format!("invalid XML text: {e}"))?;
                add_text(&stack, &mut open, &s);
            }
            Event::CData(c) => {
                let s = String::from_utf8_lossy(&c).into_owned();
                add_text(&stack, &mut open, s.trim());
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if let Some(unclosed) = stack.last() {
        return Err(format!("XML ends inside <{unclosed}>"));
    }
    if !saw_element {
        return Err("no XML element found".to_string());
    }
    Ok(out)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn enter(e: &BytesStart<'_>, element: &str, stack: &[String], open: &mut Option<Open>) -> Result<(), String> {
    if open.is_none() {
        if stack.last().map(String::as_str) != Some(element) {
            return Ok(());
        }
        *open = Some(Open { depth: stack.len(), rec: Record::new() });
    }
    let Some(o) = open.as_mut() else { return Ok(()) };
    let prefix = stack[o.depth..].join(".");
    for attr in e.attributes() {
        let attr = attr.map_err(|e| format!("invalid XML attribute: {e}"))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| format!("invalid XML attribute value: {e}"))?;
        let field = if prefix.is_empty() { key } else { format!("{prefix}.{key}") };
        o.rec.entry(field).or_insert_with(|| value.into_owned());
    }
    Ok(())
}

fn leave(stack: &[String], open: &mut Option<Open>, out: &mut Vec<Record>) {
    if open.as_ref().map(|o| o.depth) == Some(stack.len()) {
        if let Some(o) = open.take() {
            out.push(o.rec);
        }
    }
}

fn add_text(stack: &[String], open: &mut Option<Open>, text: &str) {
    let Some(o) = open.as_mut() else { return };
    if text.is_empty() {
        return;
    }
    let field = if stack.len() == o.depth { "text".to_string() } else { stack[o.depth..].join(".") };
    o.rec.entry(field).or_insert_with(|| text.to_string());
}
