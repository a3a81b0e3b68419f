//! SQL text helpers.
//!
//! Exasol DDL does not accept bind parameters for object names, so identifiers and literals
//! are quoted here before being spliced into statements.

/// Upper-case an object name the way the database folds unquoted identifiers.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Quote an identifier with double quotes, upper-casing it first.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", normalize_name(name).replace('"', "\"\""))
}

/// Quote a schema-qualified object name.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Quote a string literal with single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Passwords in `IDENTIFIED BY` are written as case-sensitive quoted identifiers.
pub fn quote_password(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Substitute `?` placeholders with quoted literals.
///
/// Placeholders inside single-quoted literals, double-quoted identifiers and comments are
/// left alone. Surplus placeholders are kept as-is; surplus arguments are ignored.
pub fn bind_literals(sql: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(sql.len() + args.iter().map(String::len).sum::<usize>());
    let mut args = args.iter();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push(c);
                // Doubled quotes are an escaped quote and keep the literal open
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == c {
                        if chars.peek() == Some(&c) {
                            out.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '?' => match args.next() {
                Some(arg) => out.push_str(&quote_literal(arg)),
                None => out.push('?'),
            },
            _ => out.push(c),
        }
    }

    out
}
