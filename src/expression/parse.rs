use super::Expression;
use crate::error::ParseError;
use serde_json::Value;

/// Parses a statement into an expression tree.
///
/// Literals are tried first, then the `Name(arg, ...)` call form, whose
/// arguments are parsed recursively. Anything else is a bare field path.
pub fn parse(statement: &str) -> Result<Expression, ParseError> {
    let statement = statement.trim();
    if statement.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some(value) = parse_literal(statement) {
        return Ok(Expression::Literal(value));
    }

    match split_call(statement)? {
        Some((name, args)) => {
            let args = args
                .into_iter()
                .map(parse)
                .collect::<Result<Vec<_>, _>>()?;
            Expression::build(name, args)
        }
        None => parse_field_path(statement),
    }
}

/// Parses an integer, a float, or a double-quoted string with JSON escapes.
pub fn parse_literal(literal: &str) -> Option<Value> {
    let first = literal.chars().next()?;

    if first == '"' {
        if literal.len() < 2 || !literal.ends_with('"') {
            return None;
        }
        return serde_json::from_str::<String>(literal).ok().map(Value::String);
    }

    // Keeps words like "inf" or "nan" available as field names.
    if !(first.is_ascii_digit() || matches!(first, '-' | '+' | '.')) {
        return None;
    }
    if let Ok(i) = literal.parse::<i64>() {
        return Some(Value::from(i));
    }
    match literal.parse::<f64>() {
        Ok(f) if f.is_finite() => Some(super::number(f)),
        _ => None,
    }
}

/// Splits `Name(a, Foo(b, c), "d,e")` into its name and top-level argument
/// strings.
///
/// Returns `Ok(None)` when the statement does not have the call shape at all.
/// Commas and parentheses nested in calls or inside double quotes do not
/// split arguments.
pub fn split_call(statement: &str) -> Result<Option<(&str, Vec<&str>)>, ParseError> {
    let open = match statement.find('(') {
        Some(open) => open,
        None => return Ok(None),
    };
    let name = &statement[..open];
    let is_identifier =
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !is_identifier || !statement.ends_with(')') {
        return Ok(None);
    }

    let inner = &statement[open + 1..statement.len() - 1];
    let mut args = Vec::new();
    let mut depth: i32 = 0;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in inner.char_indices() {
        if quoted {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => quoted = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ParseError::UnbalancedParens(statement.to_string()));
                }
            }
            ',' if depth == 0 => {
                args.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }

    if quoted {
        return Err(ParseError::UnbalancedQuotes(statement.to_string()));
    }
    if depth != 0 {
        return Err(ParseError::UnbalancedParens(statement.to_string()));
    }

    let last = inner[start..].trim();
    if args.is_empty() && last.is_empty() {
        return Ok(Some((name, args)));
    }
    args.push(last);
    if args.iter().any(|arg| arg.is_empty()) {
        return Err(ParseError::EmptyArgument(statement.to_string()));
    }
    Ok(Some((name, args)))
}

fn parse_field_path(statement: &str) -> Result<Expression, ParseError> {
    let valid = statement
        .chars()
        .all(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '"' | ','));
    if !valid {
        return Err(ParseError::InvalidPath(statement.to_string()));
    }
    Ok(Expression::Field(statement.to_string()))
}
