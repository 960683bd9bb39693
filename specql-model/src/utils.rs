//! Utility functions

/// Convert PascalCase or camelCase to snake_case.
///
/// Runs of capitals are kept together, so `HTTPRequest` becomes `http_request`.
pub fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut result = String::with_capacity(s.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if !result.is_empty() && !result.ends_with('_') && (prev_lower || (prev_upper && next_lower))
            {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }

    result
}

/// Convert snake_case to PascalCase
pub fn to_pascal_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(f) => f.to_uppercase().collect::<String>() + chars.as_str(),
            }
        })
        .collect()
}

/// Convert snake_case to camelCase
pub fn to_camel_case(s: &str) -> String {
    let pascal = to_pascal_case(s);
    let mut chars = pascal.chars();
    match chars.next() {
        None => String::new(),
        Some(f) => f.to_lowercase().collect::<String>() + chars.as_str(),
    }
}

/// Lowercase `s` and collapse every run of non-alphanumerics into one `-`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_conversion() {
        assert_eq!(to_snake_case("ContactNote"), "contact_note");
        assert_eq!(to_snake_case("Contact"), "contact");
        assert_eq!(to_snake_case("create_contact"), "create_contact");
        assert_eq!(to_snake_case("HTTPRequest"), "http_request");

        assert_eq!(to_pascal_case("create_contact"), "CreateContact");
        assert_eq!(to_pascal_case("qualify_lead"), "QualifyLead");
        assert_eq!(to_camel_case("create_contact"), "createContact");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Acme Corp."), "acme-corp");
        assert_eq!(slugify("  a@x.com "), "a-x-com");
        assert_eq!(slugify("already-a-slug"), "already-a-slug");
        assert_eq!(slugify("!!!"), "");
    }
}
