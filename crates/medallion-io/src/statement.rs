//! Tokenizer for the one supported insertion shape:
//!
//! ```text
//! INSERT INTO <table> VALUES (<literal>, <literal>, ...); [-- comment]
//! ```
//!
//! Literals are single-quoted strings (`''` escapes a quote, commas inside
//! quotes belong to the value), bare tokens such as numbers, or `NULL`.
//! Anything else on a line that starts with `INSERT` is an error; lines that
//! do not start with `INSERT` are not statements at all.

use regex::Regex;
use std::sync::LazyLock;

static INSERT_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*INSERT\s+INTO\s+([A-Za-z_][\w.]*)\s+VALUES\s*\(")
        .expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub table: String,
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatementError {
    #[error("expected `INSERT INTO <table> VALUES (`")]
    UnsupportedShape,
    #[error("unterminated quoted literal starting at byte {0}")]
    UnterminatedLiteral(usize),
    #[error("empty literal at byte {0}")]
    EmptyLiteral(usize),
    #[error("expected `,` or `)` at byte {at}, found {found:?}")]
    ExpectedSeparator { at: usize, found: char },
    #[error("value list is not closed")]
    UnclosedValues,
    #[error("expected `;` after the value list")]
    MissingTerminator,
    #[error("unexpected input after `;`: {0:?}")]
    TrailingInput(String),
}

/// Parse one line of the statements file
///
/// Returns `Ok(None)` for lines that are not insertions (comments, DDL, blank).
pub fn parse_line(line: &str) -> Result<Option<InsertStatement>, StatementError> {
    let is_insert = line
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"));
    if !is_insert {
        return Ok(None);
    }

    let caps = INSERT_HEAD
        .captures(line)
        .ok_or(StatementError::UnsupportedShape)?;
    let head = caps.get(0).ok_or(StatementError::UnsupportedShape)?;
    let table = caps
        .get(1)
        .map(|m| m.as_str().to_string())
        .ok_or(StatementError::UnsupportedShape)?;

    let mut cursor = Cursor {
        src: line,
        pos: head.end(),
    };
    let values = cursor.values()?;

    cursor.skip_ws();
    if cursor.bump() != Some(';') {
        return Err(StatementError::MissingTerminator);
    }
    let tail = cursor.rest().trim();
    if !tail.is_empty() && !tail.starts_with("--") {
        return Err(StatementError::TrailingInput(tail.to_string()));
    }

    Ok(Some(InsertStatement { table, values }))
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    /// Literal list after the opening parenthesis, consuming the closing one
    fn values(&mut self) -> Result<Vec<Option<String>>, StatementError> {
        let mut values = Vec::new();
        loop {
            self.skip_ws();
            let value = match self.peek() {
                None => return Err(StatementError::UnclosedValues),
                Some('\'') => Some(self.quoted()?),
                Some(_) => self.bare()?,
            };
            values.push(value);

            self.skip_ws();
            let at = self.pos;
            match self.bump() {
                Some(',') => continue,
                Some(')') => return Ok(values),
                Some(found) => return Err(StatementError::ExpectedSeparator { at, found }),
                None => return Err(StatementError::UnclosedValues),
            }
        }
    }

    fn quoted(&mut self) -> Result<String, StatementError> {
        let start = self.pos;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(StatementError::UnterminatedLiteral(start)),
                Some('\'') if self.peek() == Some('\'') => {
                    self.bump();
                    value.push('\'');
                }
                Some('\'') => return Ok(value),
                Some(c) => value.push(c),
            }
        }
    }

    fn bare(&mut self) -> Result<Option<String>, StatementError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c != ',' && c != ')') {
            self.bump();
        }
        let token = self.src[start..self.pos].trim();
        if token.is_empty() {
            Err(StatementError::EmptyLiteral(start))
        } else if token.eq_ignore_ascii_case("NULL") {
            Ok(None)
        } else {
            Ok(Some(token.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(line: &str) -> Vec<Option<String>> {
        parse_line(line).unwrap().unwrap().values
    }

    #[test]
    fn parses_reference_statement() {
        let line = "INSERT INTO clientes VALUES (1, 'Ana', 'Soto', 'Ñuñoa', '11.111.111-1', '1990-05-01', 'catolico');";
        let stmt = parse_line(line).unwrap().unwrap();
        assert_eq!(stmt.table, "clientes");
        let expected: Vec<Option<String>> = [
            "1",
            "Ana",
            "Soto",
            "Ñuñoa",
            "11.111.111-1",
            "1990-05-01",
            "catolico",
        ]
        .iter()
        .map(|s| Some(s.to_string()))
        .collect();
        assert_eq!(stmt.values, expected);
    }

    #[test]
    fn ignores_non_statements() {
        for line in [
            "",
            "   ",
            "-- clientes",
            "CREATE TABLE clientes (codigo INT);",
            "SELECT * FROM clientes;",
        ] {
            assert_eq!(parse_line(line), Ok(None), "{line:?}");
        }
    }

    #[test]
    fn quoted_commas_and_escaped_quotes_stay_in_the_value() {
        let v = values("insert into clientes values (2, 'O''Higgins, Bernardo', '  x  ', NULL);");
        assert_eq!(v[1].as_deref(), Some("O'Higgins, Bernardo"));
        assert_eq!(v[2].as_deref(), Some("  x  "));
        assert_eq!(v[3], None);
    }

    #[test]
    fn accepts_trailing_comment() {
        let v = values("  INSERT INTO public.clientes VALUES (3,'a') ; -- seed");
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn rejects_malformed_inserts() {
        assert_eq!(
            parse_line("INSERT INTO clientes (codigo) VALUES (1);"),
            Err(StatementError::UnsupportedShape)
        );
        assert_eq!(
            parse_line("INSERT INTO clientes VALUES (1, 'Ana);"),
            Err(StatementError::UnterminatedLiteral(32))
        );
        assert_eq!(
            parse_line("INSERT INTO clientes VALUES (1, 'Ana')"),
            Err(StatementError::MissingTerminator)
        );
        assert_eq!(
            parse_line("INSERT INTO clientes VALUES (1, , 2);"),
            Err(StatementError::EmptyLiteral(32))
        );
        assert!(matches!(
            parse_line("INSERT INTO clientes VALUES (1, 'a' 'b');"),
            Err(StatementError::ExpectedSeparator { found: '\'', .. })
        ));
        assert!(matches!(
            parse_line("INSERT INTO clientes VALUES (1); DROP TABLE x;"),
            Err(StatementError::TrailingInput(_))
        ));
    }
}
