use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

const VOID_TAGS: [&str; 8] = ["input", "img", "br", "hr", "meta", "link", "source", "wbr"];

fn tag_pattern() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| {
        Regex::new(r#"<(/?)([A-Za-z][A-Za-z0-9-]*)((?:[^>"']|"[^"]*"|'[^']*')*?)(/?)>"#)
            .expect("tag pattern is valid")
    })
}

fn attr_pattern() -> &'static Regex {
    static ATTR: OnceLock<Regex> = OnceLock::new();
    ATTR.get_or_init(|| {
        Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+))"#)
            .expect("attribute pattern is valid")
    })
}

fn markup_pattern() -> &'static Regex {
    static MARKUP: OnceLock<Regex> = OnceLock::new();
    MARKUP.get_or_init(|| Regex::new(r"<[^>]*>").expect("markup pattern is valid"))
}

/// Opaque HTML payload delivered by an `insert` message or a transport.
///
/// Cloning is cheap; the markup is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fragment {
    html: Arc<str>,
}

impl Fragment {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: Arc::from(html.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.html
    }

    pub fn is_empty(&self) -> bool {
        self.html.trim().is_empty()
    }

    /// Value of the first `<input name="...">` with the given name.
    pub fn hidden_field(&self, name: &str) -> Option<String> {
        self.scan()
            .fields
            .into_iter()
            .find(|field| field.name == name)
            .map(|field| field.value)
    }

    /// Elements carrying BEM element classes, in document order.
    pub fn elements(&self) -> Vec<FragmentElement> {
        self.scan().elements
    }

    pub(crate) fn scan(&self) -> FragmentScan {
        scan_markup(&self.html)
    }
}

impl From<&str> for Fragment {
    fn from(html: &str) -> Self {
        Fragment::new(html)
    }
}

impl From<String> for Fragment {
    fn from(html: String) -> Self {
        Fragment::new(html)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenField {
    pub name: String,
    pub value: String,
}

impl HiddenField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// BEM information extracted from a `class` attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BemClasses {
    /// `block__element` names, deduplicated, in class order.
    pub marks: Vec<String>,
    /// Set by any `block__element_hide` class.
    pub hidden: bool,
    /// `block__element_key_value` pairs; boolean modifiers carry an empty value.
    pub modifiers: Vec<(String, String)>,
}

/// Split a class list into element marks and modifiers.
pub fn parse_class_list(classes: &str) -> BemClasses {
    let mut out = BemClasses::default();
    for token in classes.split_whitespace() {
        let Some((block, rest)) = token.split_once("__") else {
            continue;
        };
        if block.is_empty() || rest.is_empty() {
            continue;
        }
        let mut parts = rest.split('_');
        let Some(element) = parts.next().filter(|e| !e.is_empty()) else {
            continue;
        };
        let mark = format!("{block}__{element}");
        if !out.marks.contains(&mark) {
            out.marks.push(mark);
        }
        let modifier: Vec<&str> = parts.collect();
        match modifier.as_slice() {
            [] => {}
            ["hide"] => out.hidden = true,
            [flag] => out.modifiers.push((flag.to_string(), String::new())),
            [key, value @ ..] => out.modifiers.push((key.to_string(), value.join("_"))),
        }
    }
    out
}

/// Marked element discovered inside a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentElement {
    pub classes: BemClasses,
    pub fields: Vec<HiddenField>,
    /// Index of the closest enclosing marked element.
    pub parent: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct FragmentScan {
    pub elements: Vec<FragmentElement>,
    pub fields: Vec<HiddenField>,
    /// Fields not enclosed by any marked element.
    pub loose_fields: Vec<HiddenField>,
}

fn scan_markup(html: &str) -> FragmentScan {
    let mut scan = FragmentScan::default();
    let mut stack: Vec<(String, Option<usize>)> = Vec::new();

    for cap in tag_pattern().captures_iter(html) {
        let closing = &cap[1] == "/";
        let name = cap[2].to_ascii_lowercase();
        if closing {
            while let Some((open, _)) = stack.pop() {
                if open == name {
                    break;
                }
            }
            continue;
        }

        let attrs = parse_attributes(cap.get(3).map_or("", |m| m.as_str()));
        let enclosing = stack.iter().rev().find_map(|(_, idx)| *idx);
        let self_closing = &cap[4] == "/" || VOID_TAGS.contains(&name.as_str());

        if name == "input" {
            if let Some(field_name) = attrs.get("name") {
                let field = HiddenField::new(
                    field_name.clone(),
                    attrs.get("value").cloned().unwrap_or_default(),
                );
                match enclosing {
                    Some(idx) => scan.elements[idx].fields.push(field.clone()),
                    None => scan.loose_fields.push(field.clone()),
                }
                scan.fields.push(field);
            }
        }

        let classes = attrs
            .get("class")
            .map(|c| parse_class_list(c))
            .unwrap_or_default();
        let idx = if classes.marks.is_empty() {
            None
        } else {
            scan.elements.push(FragmentElement {
                classes,
                fields: Vec::new(),
                parent: enclosing,
            });
            Some(scan.elements.len() - 1)
        };

        if !self_closing {
            stack.push((name, idx));
        }
    }
    scan
}

fn parse_attributes(raw: &str) -> HashMap<String, String> {
    attr_pattern()
        .captures_iter(raw)
        .map(|cap| {
            let value = cap
                .get(2)
                .or_else(|| cap.get(3))
                .or_else(|| cap.get(4))
                .map_or("", |m| m.as_str());
            (cap[1].to_ascii_lowercase(), value.to_string())
        })
        .collect()
}

/// Text content of a markup string, tags removed.
pub fn strip_markup(html: &str) -> String {
    markup_pattern().replace_all(html, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<article>one</article>
        <div class="paste__delete paste__delete_hide paginator__page">
            <input type="hidden" name="page" value="2">
        </div>"#;

    #[test]
    fn reads_hidden_field_values() {
        let fragment = Fragment::new(PAGE);
        assert_eq!(fragment.hidden_field("page").as_deref(), Some("2"));
        assert_eq!(fragment.hidden_field("cursor"), None);
        assert_eq!(
            Fragment::new("<input value='7' name='page'/>").hidden_field("page").as_deref(),
            Some("7")
        );
    }

    #[test]
    fn marked_elements_capture_their_fields() {
        let elements = Fragment::new(PAGE).elements();
        assert_eq!(elements.len(), 1);
        let slot = &elements[0];
        assert_eq!(slot.classes.marks, vec!["paste__delete", "paginator__page"]);
        assert!(slot.classes.hidden);
        assert_eq!(slot.fields, vec![HiddenField::new("page", "2")]);
        assert_eq!(slot.parent, None);
    }

    #[test]
    fn nested_marks_point_at_their_parent() {
        let html = r#"<div class="feed__item"><span class="feed__badge feed__badge_tone_warm">!</span></div>"#;
        let elements = Fragment::new(html).elements();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].parent, Some(0));
        assert_eq!(
            elements[1].classes.modifiers,
            vec![("tone".to_string(), "warm".to_string())]
        );
    }

    #[test]
    fn class_list_parsing_handles_modifiers() {
        let bem = parse_class_list(
            "paste-1 paste-1__other paste-1__other_event_click paste-1__other_hide",
        );
        assert_eq!(bem.marks, vec!["paste-1__other"]);
        assert!(bem.hidden);
        assert_eq!(bem.modifiers, vec![("event".to_string(), "click".to_string())]);
    }

    #[test]
    fn comments_are_not_tags() {
        let fragment = Fragment::new("hi <!--e12--> there");
        assert!(fragment.elements().is_empty());
        assert_eq!(strip_markup("<b>hi</b> there"), "hi there");
    }
}
