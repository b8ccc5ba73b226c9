//! Lexer and recursive-descent parser for policy modules and queries.

use thiserror::Error;

use crate::policy::ast::{Expr, ExprKind, Module, Query, Rule};
use crate::term::{Location, Ref, Term};

/// A syntax error with the position it was detected at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{location}: parse error: {message}")]
pub struct ParseError {
    /// What was expected or found.
    pub message: String,
    /// Where the error was detected.
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    Comma,
    Colon,
    Semi,
    LBrack,
    RBrack,
    LBrace,
    RBrace,
    Assign,
    Eq,
    Neq,
    Newline,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("identifier {s:?}"),
            Self::Str(s) => format!("string {s:?}"),
            Self::Num(n) => format!("number {n}"),
            Self::Newline => "newline".to_string(),
            Self::Eof => "end of input".to_string(),
            other => format!("{other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    row: usize,
    col: usize,
}

fn lex(file: &str, src: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let (mut i, mut row, mut col) = (0usize, 1usize, 1usize);

    let err = |message: String, row: usize, col: usize| ParseError {
        message,
        location: Location::new(file, row, col),
    };

    while i < chars.len() {
        let c = chars[i];
        let (start_row, start_col) = (row, col);
        let push = |out: &mut Vec<Token>, tok: Tok| {
            out.push(Token {
                tok,
                row: start_row,
                col: start_col,
            });
        };

        match c {
            '\n' => {
                push(&mut out, Tok::Newline);
                i += 1;
                row += 1;
                col = 1;
                continue;
            }
            ' ' | '\t' | '\r' => {}
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '.' => push(&mut out, Tok::Dot),
            ',' => push(&mut out, Tok::Comma),
            ':' => push(&mut out, Tok::Colon),
            ';' => push(&mut out, Tok::Semi),
            '[' => push(&mut out, Tok::LBrack),
            ']' => push(&mut out, Tok::RBrack),
            '{' => push(&mut out, Tok::LBrace),
            '}' => push(&mut out, Tok::RBrace),
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(&mut out, Tok::Eq);
                    i += 2;
                    col += 2;
                    continue;
                }
                push(&mut out, Tok::Assign);
            }
            '!' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(err("unexpected '!'".to_string(), row, col));
                }
                push(&mut out, Tok::Neq);
                i += 2;
                col += 2;
                continue;
            }
            '"' => {
                let mut s = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None | Some('\n') => {
                            return Err(err("unterminated string".to_string(), row, col));
                        }
                        Some('"') => break,
                        Some('\\') => {
                            let esc = chars.get(j + 1).copied();
                            s.push(match esc {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('"') => '"',
                                Some('\\') => '\\',
                                _ => {
                                    return Err(err(
                                        "invalid escape sequence".to_string(),
                                        row,
                                        col + (j - i),
                                    ))
                                }
                            });
                            j += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            j += 1;
                        }
                    }
                }
                push(&mut out, Tok::Str(s));
                col += j + 1 - i;
                i = j + 1;
                continue;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].is_ascii_digit()
                        || chars[j] == '.'
                        || chars[j] == 'e'
                        || chars[j] == 'E')
                {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number {text:?}"), row, col))?;
                push(&mut out, Tok::Num(n));
                col += j - i;
                i = j;
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                push(&mut out, Tok::Ident(chars[i..j].iter().collect()));
                col += j - i;
                i = j;
                continue;
            }
            other => return Err(err(format!("unexpected character {other:?}"), row, col)),
        }
        i += 1;
        col += 1;
    }

    out.push(Token {
        tok: Tok::Eof,
        row,
        col,
    });
    Ok(out)
}

struct Parser<'a> {
    file: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(file: &'a str, src: &str) -> Result<Self, ParseError> {
        Ok(Self {
            file,
            tokens: lex(file, src)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn location(&self) -> Location {
        let t = &self.tokens[self.pos];
        Location::new(self.file, t.row, t.col)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if tok != Tok::Eof {
            self.pos += 1;
        }
        tok
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError {
            message: message.into(),
            location: self.location(),
        })
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Tok::Newline {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Tok::Newline | Tok::Semi) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: &Tok) -> Result<(), ParseError> {
        if self.peek() == want {
            self.bump();
            Ok(())
        } else {
            self.error(format!(
                "expected {}, found {}",
                want.describe(),
                self.peek().describe()
            ))
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Tok::Ident(s) => {
                self.bump();
                Ok(s)
            }
            other => self.error(format!("expected identifier, found {}", other.describe())),
        }
    }

    fn module(&mut self, id: &str, src: &str) -> Result<Module, ParseError> {
        self.skip_newlines();
        if !matches!(self.peek(), Tok::Ident(kw) if kw == "package") {
            return self.error("module must begin with a package declaration");
        }
        self.bump();
        let mut package = vec![self.ident()?];
        while *self.peek() == Tok::Dot {
            self.bump();
            package.push(self.ident()?);
        }

        let mut rules = Vec::new();
        loop {
            self.skip_separators();
            if *self.peek() == Tok::Eof {
                break;
            }
            rules.push(self.rule()?);
        }

        Ok(Module {
            id: id.to_string(),
            package,
            rules,
            source: src.to_string(),
        })
    }

    fn rule(&mut self) -> Result<Rule, ParseError> {
        let location = self.location();
        let mut default = false;
        let mut name = self.ident()?;
        if name == "default" && matches!(self.peek(), Tok::Ident(_)) {
            default = true;
            name = self.ident()?;
        }
        if matches!(name.as_str(), "data" | "input" | "package") {
            return Err(ParseError {
                message: format!("rule name {name:?} is reserved"),
                location,
            });
        }

        let value = if *self.peek() == Tok::Assign {
            self.bump();
            self.term()?
        } else if default {
            return self.error("default rule requires a value");
        } else {
            Term::boolean(true).with_location(location.clone())
        };

        let mut body = Vec::new();
        if *self.peek() == Tok::LBrace {
            if default {
                return self.error("default rule must not have a body");
            }
            self.bump();
            body = self.body(&Tok::RBrace)?;
            self.expect(&Tok::RBrace)?;
            if body.is_empty() {
                return Err(ParseError {
                    message: "rule body must not be empty".to_string(),
                    location,
                });
            }
        }

        match self.peek() {
            Tok::Newline | Tok::Semi | Tok::Eof => {}
            other => {
                let found = other.describe();
                return self.error(format!("unexpected {found} after rule"));
            }
        }

        Ok(Rule {
            name,
            default,
            value,
            body,
            location,
        })
    }

    /// Expressions separated by `;` or newlines, up to `end` (not consumed).
    fn body(&mut self, end: &Tok) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = Vec::new();
        loop {
            self.skip_separators();
            if self.peek() == end {
                return Ok(exprs);
            }
            exprs.push(self.expr()?);
            match self.peek() {
                Tok::Newline | Tok::Semi => {}
                t if t == end => {}
                other => {
                    let found = other.describe();
                    return self.error(format!("unexpected {found} in body"));
                }
            }
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let location = self.location();
        let left = self.term()?;
        let kind = match self.peek() {
            Tok::Assign => {
                self.bump();
                ExprKind::Unify {
                    left,
                    right: self.term()?,
                }
            }
            Tok::Eq => {
                self.bump();
                ExprKind::Equal {
                    left,
                    right: self.term()?,
                }
            }
            Tok::Neq => {
                self.bump();
                ExprKind::NotEqual {
                    left,
                    right: self.term()?,
                }
            }
            _ => ExprKind::Term { term: left },
        };
        Ok(Expr { kind, location })
    }

    fn term(&mut self) -> Result<Term, ParseError> {
        let location = self.location();
        let term = match self.bump() {
            Tok::Num(n) => Term::number(n),
            Tok::Str(s) => Term::string(s),
            Tok::Ident(name) => match name.as_str() {
                "null" => Term::null(),
                "true" => Term::boolean(true),
                "false" => Term::boolean(false),
                _ => self.reference(name)?,
            },
            Tok::LBrack => {
                let mut items = Vec::new();
                loop {
                    self.skip_newlines();
                    if *self.peek() == Tok::RBrack {
                        self.bump();
                        break;
                    }
                    items.push(self.term()?);
                    self.skip_newlines();
                    match self.bump() {
                        Tok::Comma => {}
                        Tok::RBrack => break,
                        other => {
                            return self.error(format!(
                                "expected ',' or ']', found {}",
                                other.describe()
                            ))
                        }
                    }
                }
                Term::array(items)
            }
            Tok::LBrace => {
                let mut pairs = Vec::new();
                loop {
                    self.skip_newlines();
                    if *self.peek() == Tok::RBrace {
                        self.bump();
                        break;
                    }
                    let key = self.term()?;
                    self.skip_newlines();
                    self.expect(&Tok::Colon)?;
                    self.skip_newlines();
                    let value = self.term()?;
                    pairs.push((key, value));
                    self.skip_newlines();
                    match self.bump() {
                        Tok::Comma => {}
                        Tok::RBrace => break,
                        other => {
                            return self.error(format!(
                                "expected ',' or '}}', found {}",
                                other.describe()
                            ))
                        }
                    }
                }
                Term::object(pairs)
            }
            other => {
                self.pos = self.pos.saturating_sub(usize::from(other != Tok::Eof));
                return self.error(format!("expected term, found {}", other.describe()));
            }
        };
        Ok(term.with_location(location))
    }

    /// `name`, `name.a.b` or `name["a"].b`.
    fn reference(&mut self, root: String) -> Result<Term, ParseError> {
        let mut path = Vec::new();
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.bump();
                    path.push(self.ident()?);
                }
                Tok::LBrack => {
                    self.bump();
                    match self.bump() {
                        Tok::Str(s) => path.push(s),
                        other => {
                            return self.error(format!(
                                "expected string key, found {}",
                                other.describe()
                            ))
                        }
                    }
                    self.expect(&Tok::RBrack)?;
                }
                _ => break,
            }
        }
        if path.is_empty() && root != "data" && root != "input" {
            return Ok(Term::var(root));
        }
        Ok(Term::reference(Ref::new(root, path)))
    }
}

/// Parse one policy module. `id` names the module in diagnostics.
pub fn parse_module(id: &str, src: &str) -> Result<Module, ParseError> {
    Parser::new(id, src)?.module(id, src)
}

/// Parse a query such as `x = data.a.b; x != 1`.
pub fn parse_query(src: &str) -> Result<Query, ParseError> {
    let mut p = Parser::new("", src)?;
    let exprs = p.body(&Tok::Eof)?;
    if exprs.is_empty() {
        return p.error("empty query");
    }
    Ok(Query { exprs })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::term::TermValue;

    #[test]
    fn parses_module_with_default_and_body() {
        let src = r#"
package system.diagnostics

# diagnostics for admins only
default config = {"mode": "off"}
config = {"mode": "all"} { input.params.debug == ["true"] }
"#;
        let m = parse_module("diag.policy", src).unwrap();
        assert_eq!(m.package, vec!["system", "diagnostics"]);
        assert_eq!(m.rules.len(), 2);
        assert!(m.rules[0].default);
        assert_eq!(m.rules[1].body.len(), 1);
        assert_eq!(m.rule_path("config"), vec!["system", "diagnostics", "config"]);
    }

    #[test]
    fn rule_without_value_defaults_to_true() {
        let m = parse_module("a", "package a\nallow { input.user == \"admin\" }").unwrap();
        assert_eq!(m.rules[0].value, Term::boolean(true));
    }

    #[test]
    fn parses_query_expressions() {
        let q = parse_query("x = 1; y = data.a[\"b-c\"].d\nx != y").unwrap();
        assert_eq!(q.exprs.len(), 3);
        assert_eq!(q.to_string(), "x = 1; y = data.a.b-c.d; x != y");
        assert_eq!(q.vars().into_iter().collect::<Vec<_>>(), vec!["x", "y"]);
        match &q.exprs[1].kind {
            ExprKind::Unify { right, .. } => {
                assert!(matches!(&right.value, TermValue::Ref(r) if r.path == ["a", "b-c", "d"]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_errors_carry_location() {
        let err = parse_module("bad.policy", "package a\nallow = {\"k\" 1}").unwrap_err();
        assert_eq!(err.location.file, "bad.policy");
        assert_eq!(err.location.row, 2);
        assert!(err.to_string().contains("expected"));

        assert!(parse_module("x", "allow = true").is_err());
        assert!(parse_query("").is_err());
        assert!(parse_query("x = ").is_err());
    }

    #[test]
    fn default_rule_must_have_value_and_no_body() {
        assert!(parse_module("a", "package a\ndefault allow").is_err());
        assert!(parse_module("a", "package a\ndefault allow = false { true }").is_err());
    }
}
