//! `$name$` variable substitution for migration scripts.
//!
//! Only tokens whose inner text is an identifier are substituted, and every such token must
//! have a value. Seed scripts skip this step entirely because PostgreSQL dollar-quoted
//! strings (`$body$ ... $body$`) look exactly like variable tokens.

use super::MigrationError;
use std::borrow::Cow;
use std::collections::BTreeMap;

pub fn substitute<'a>(
    text: &'a str,
    variables: &BTreeMap<String, String>,
) -> Result<Cow<'a, str>, MigrationError> {
    if !text.contains('$') {
        return Ok(Cow::Borrowed(text));
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        let is_token = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && after[name_len..].starts_with('$');

        if is_token {
            let value = variables
                .get(name)
                .ok_or_else(|| MigrationError::UndefinedVariable(name.to_string()))?;
            out.push_str(value);
            rest = &after[name_len + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("owner".to_string(), "catalog_owner".to_string()),
            ("environment".to_string(), "staging".to_string()),
        ])
    }

    #[test]
    fn test_replaces_known_tokens() {
        let sql = "ALTER TABLE products OWNER TO $owner$; -- $environment$";
        assert_eq!(
            substitute(sql, &vars()).unwrap(),
            "ALTER TABLE products OWNER TO catalog_owner; -- staging"
        );
    }

    #[test]
    fn test_leaves_plain_text_borrowed() {
        assert!(matches!(substitute("SELECT 1;", &vars()).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_leaves_non_tokens_intact() {
        let sql = "SELECT $1, $$ literal $$, price * 2 $ FROM products WHERE id = $2";
        assert_eq!(substitute(sql, &vars()).unwrap(), sql);
    }

    #[test]
    fn test_undefined_variable_fails() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$ SELECT 1 $body$ LANGUAGE sql;";
        assert!(matches!(
            substitute(sql, &vars()),
            Err(MigrationError::UndefinedVariable(name)) if name == "body"
        ));
    }
}
