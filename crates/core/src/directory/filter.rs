//! Search filter construction.
//!
//! All user-provided values go through [`escape_value`] before they are
//! embedded in a filter (RFC 4515).

/// Escape special characters in a filter assertion value.
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\5c"),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// `(attr=value)` with the value escaped.
pub fn equality(attribute: &str, value: &str) -> String {
    format!("({}={})", attribute, escape_value(value))
}

fn split_list(list: &str) -> Vec<&str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// OR of `(objectClass=...)` for each entry of a comma-separated list.
///
/// Returns `None` when the list is empty or contains `*`, meaning no object
/// class restriction applies.
pub fn object_classes_filter(classes: &str) -> Option<String> {
    let classes = split_list(classes);
    if classes.is_empty() || classes.contains(&"*") {
        return None;
    }
    let mut out = String::from("(|");
    for class in classes {
        out.push_str(&equality("objectClass", class));
    }
    out.push(')');
    Some(out)
}

/// Filter matching `input` against each of the comma-separated `fields`.
///
/// With `contains` each field is matched as `*input*`; otherwise as a prefix
/// `input*`. An empty input matches any entry carrying the field.
pub fn search_filter(fields: &str, input: &str, contains: bool, classes: &str) -> String {
    let value = escape_value(input.trim());
    let pattern = if value.is_empty() {
        "*".to_string()
    } else if contains {
        format!("*{value}*")
    } else {
        format!("{value}*")
    };

    let fields = split_list(fields);
    let mut fields_part = String::new();
    match fields.as_slice() {
        [] => fields_part.push_str("(objectClass=*)"),
        [single] => fields_part.push_str(&format!("({single}={pattern})")),
        many => {
            fields_part.push_str("(|");
            for field in many {
                fields_part.push_str(&format!("({field}={pattern})"));
            }
            fields_part.push(')');
        }
    }

    match object_classes_filter(classes) {
        Some(classes) => format!("(&{fields_part}{classes})"),
        None => fields_part,
    }
}
