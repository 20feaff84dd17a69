//! Token-level rewrites: define substitution and constant folding
//!
//! Folding only understands `if` statements whose branches are blocks and whose
//! condition is a literal, a negated literal or a comparison of two literals.
//! That covers `process.env.NODE_ENV` checks once the define pass has replaced
//! the member path with a string literal.

use indexmap::IndexMap;
use log::trace;

use super::{
    is_member_access, last_significant,
    lexer::{Token, TokenKind, is_ident_part, is_ident_start, tokenize},
    next_significant,
};

/// Compile-time replacements for dotted identifier paths
#[derive(Debug, Clone, Default)]
pub struct Defines {
    entries: Vec<(Vec<String>, Vec<Token<'static>>)>,
}

impl Defines {
    /// Build from `path -> replacement expression` pairs
    pub fn new(map: &IndexMap<String, String>) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(map.len());
        for (key, value) in map {
            let path: Vec<String> = key.split('.').map(str::to_owned).collect();
            if path.iter().any(|part| !is_identifier(part)) {
                return Err(format!("define key '{key}' is not a dotted identifier path"));
            }
            let replacement: Vec<Token<'static>> = tokenize(value)
                .map_err(|e| format!("define value for '{key}' does not lex: {e}"))?
                .into_iter()
                .filter(|t| !t.is_trivia())
                .map(Token::into_owned)
                .collect();
            if replacement.is_empty() {
                return Err(format!("define value for '{key}' is empty"));
            }
            entries.push((path, replacement));
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars.next().is_some_and(is_ident_start) && chars.all(is_ident_part)
}

/// Replace every occurrence of a defined path with its replacement tokens
///
/// A path only matches where it starts an expression, so `a.process.env` is
/// left alone.
pub fn substitute_defines<'a>(tokens: Vec<Token<'a>>, defines: &Defines) -> Vec<Token<'a>> {
    if defines.is_empty() {
        return tokens;
    }

    let limit = tokens.len();
    let mut out: Vec<Token<'a>> = Vec::with_capacity(limit);
    let mut i = 0;
    while i < limit {
        let token = &tokens[i];
        if token.kind == TokenKind::Ident && !is_member_access(last_significant(&out)) {
            if let Some((end, replacement)) = match_define(&tokens, i, defines) {
                trace!("Substituting define at token {i}");
                out.extend(replacement.iter().cloned());
                i = end;
                continue;
            }
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    out
}

/// Try every define at `start`; returns the index after the match and its replacement
fn match_define<'d>(
    tokens: &[Token<'_>],
    start: usize,
    defines: &'d Defines,
) -> Option<(usize, &'d [Token<'static>])> {
    'defines: for (path, replacement) in &defines.entries {
        if tokens[start].text != path[0] {
            continue;
        }
        let mut cursor = start;
        for part in &path[1..] {
            let Some(dot) = next_significant(tokens, cursor + 1, tokens.len()) else {
                continue 'defines;
            };
            if !tokens[dot].is_punct(".") {
                continue 'defines;
            }
            let Some(name) = next_significant(tokens, dot + 1, tokens.len()) else {
                continue 'defines;
            };
            if !tokens[name].is_ident(part) {
                continue 'defines;
            }
            cursor = name;
        }
        return Some((cursor + 1, replacement.as_slice()));
    }
    None
}

#[derive(Debug, Clone, Copy)]
enum Alternate {
    Block { open: usize, close: usize },
    If { start: usize, end: usize },
}

#[derive(Debug, Clone, Copy)]
struct IfStatement {
    condition: (usize, usize),
    consequent: (usize, usize),
    alternate: Option<Alternate>,
    /// Index one past the statement's last token
    end: usize,
}

fn matching_close(tokens: &[Token<'_>], open: usize, limit: usize, pair: (&str, &str)) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().take(limit).skip(open) {
        if token.is_punct(pair.0) {
            depth += 1;
        } else if token.is_punct(pair.1) {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Parse `if (...) { ... } [else { ... } | else if ...]` starting at the `if` token
fn parse_if(tokens: &[Token<'_>], start: usize, limit: usize) -> Option<IfStatement> {
    let open_paren = next_significant(tokens, start + 1, limit)?;
    if !tokens[open_paren].is_punct("(") {
        return None;
    }
    let close_paren = matching_close(tokens, open_paren, limit, ("(", ")"))?;

    let open_brace = next_significant(tokens, close_paren + 1, limit)?;
    if !tokens[open_brace].is_punct("{") {
        return None;
    }
    let close_brace = matching_close(tokens, open_brace, limit, ("{", "}"))?;

    let mut statement = IfStatement {
        condition: (open_paren, close_paren),
        consequent: (open_brace, close_brace),
        alternate: None,
        end: close_brace + 1,
    };

    let Some(else_index) = next_significant(tokens, close_brace + 1, limit) else {
        return Some(statement);
    };
    if !tokens[else_index].is_ident("else") {
        return Some(statement);
    }

    let branch = next_significant(tokens, else_index + 1, limit)?;
    if tokens[branch].is_punct("{") {
        let close = matching_close(tokens, branch, limit, ("{", "}"))?;
        statement.alternate = Some(Alternate::Block {
            open: branch,
            close,
        });
        statement.end = close + 1;
    } else if tokens[branch].is_ident("if") {
        let nested = parse_if(tokens, branch, limit)?;
        statement.alternate = Some(Alternate::If {
            start: branch,
            end: nested.end,
        });
        statement.end = nested.end;
    } else {
        // `else return x;` and friends: statement boundaries are unknown
        return None;
    }
    Some(statement)
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl Literal {
    fn from_token(token: &Token<'_>) -> Option<Self> {
        match token.kind {
            // Escaped strings would need decoding to compare reliably
            TokenKind::String => super::string_value(token).map(|s| Self::Str(s.to_owned())),
            TokenKind::Number => parse_number(&token.text).map(Self::Num),
            TokenKind::Ident => match token.text.as_ref() {
                "true" => Some(Self::Bool(true)),
                "false" => Some(Self::Bool(false)),
                "null" => Some(Self::Null),
                _ => None,
            },
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Num(n) => *n != 0.0 && !n.is_nan(),
            Self::Bool(b) => *b,
            Self::Null => false,
        }
    }

    fn same_type(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    if let Some(hex) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    cleaned.parse().ok()
}

/// Evaluate the condition between the parentheses at `range`, if it is constant
fn evaluate_condition(tokens: &[Token<'_>], range: (usize, usize)) -> Option<bool> {
    let parts: Vec<&Token<'_>> = tokens[range.0 + 1..range.1]
        .iter()
        .filter(|t| !t.is_trivia())
        .collect();

    match parts.as_slice() {
        [value] => Literal::from_token(value).map(|l| l.truthy()),
        [not, value] if not.is_punct("!") => Literal::from_token(value).map(|l| !l.truthy()),
        [left, op, right] if op.kind == TokenKind::Punct => {
            let left = Literal::from_token(left)?;
            let right = Literal::from_token(right)?;
            let strict = matches!(op.text.as_ref(), "===" | "!==");
            let negated = matches!(op.text.as_ref(), "!==" | "!=");
            if !matches!(op.text.as_ref(), "===" | "!==" | "==" | "!=") {
                return None;
            }
            let equal = if left.same_type(&right) {
                left == right
            } else if strict {
                false
            } else {
                // Loose equality across types needs coercion rules
                return None;
            };
            Some(equal != negated)
        }
        _ => None,
    }
}

/// Remove the dead branch of every constant `if` statement
pub fn fold_constants<'a>(tokens: Vec<Token<'a>>) -> Vec<Token<'a>> {
    let mut out = Vec::with_capacity(tokens.len());
    fold_range(&tokens, 0, tokens.len(), &mut out);
    out
}

fn fold_range<'a>(tokens: &[Token<'a>], start: usize, end: usize, out: &mut Vec<Token<'a>>) {
    let mut i = start;
    while i < end {
        let token = &tokens[i];
        if token.is_ident("if") && !is_member_access(last_significant(out)) {
            if let Some(statement) = parse_if(tokens, i, end) {
                if let Some(taken) = evaluate_condition(tokens, statement.condition) {
                    trace!("Folding constant if at token {i} (condition is {taken})");
                    emit_taken_branch(tokens, &statement, taken, out);
                    i = statement.end;
                    continue;
                }
            }
        }
        out.push(token.clone());
        i += 1;
    }
}

fn emit_block<'a>(tokens: &[Token<'a>], open: usize, close: usize, out: &mut Vec<Token<'a>>) {
    out.push(tokens[open].clone());
    fold_range(tokens, open + 1, close, out);
    out.push(tokens[close].clone());
}

fn emit_taken_branch<'a>(
    tokens: &[Token<'a>],
    statement: &IfStatement,
    taken: bool,
    out: &mut Vec<Token<'a>>,
) {
    if taken {
        let (open, close) = statement.consequent;
        emit_block(tokens, open, close, out);
        return;
    }
    match statement.alternate {
        Some(Alternate::Block { open, close }) => emit_block(tokens, open, close, out),
        Some(Alternate::If { start, end }) => fold_range(tokens, start, end, out),
        // An empty statement keeps `for (...) if (false) {}` well formed
        None => out.push(Token::new(TokenKind::Punct, ";")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn render(tokens: &[Token<'_>]) -> String {
        tokens.iter().map(|t| t.text.as_ref()).collect()
    }

    fn node_env_production() -> Defines {
        let mut map = IndexMap::new();
        map.insert(
            "process.env.NODE_ENV".to_owned(),
            "\"production\"".to_owned(),
        );
        Defines::new(&map).expect("defines should build")
    }

    fn run(source: &str) -> String {
        let tokens = tokenize(source).expect("tokenize should succeed");
        let tokens = substitute_defines(tokens, &node_env_production());
        render(&fold_constants(tokens))
    }

    #[test]
    fn test_define_substitution() {
        let tokens = tokenize("x = process.env.NODE_ENV; y = a.process.env.NODE_ENV;")
            .expect("tokenize should succeed");
        let out = render(&substitute_defines(tokens, &node_env_production()));
        assert_eq!(out, "x = \"production\"; y = a.process.env.NODE_ENV;");
    }

    #[test]
    fn test_define_rejects_bad_key() {
        let mut map = IndexMap::new();
        map.insert("process..env".to_owned(), "1".to_owned());
        assert!(Defines::new(&map).is_err());
    }

    #[test]
    fn test_dead_branch_removed() {
        let out = run("if (process.env.NODE_ENV !== \"production\") { warn(); }\nrun();");
        assert_eq!(out, ";\nrun();");
    }

    #[test]
    fn test_live_branch_kept_and_else_dropped() {
        let out = run("if (process.env.NODE_ENV === 'production') { a(); } else { b(); }");
        assert_eq!(out, "{ a(); }");
    }

    #[test]
    fn test_nested_checks_inside_always_true_block() {
        let source = "if (true) {\n  setup();\n  if (process.env.NODE_ENV !== \"production\") {\n    \
                      devOnly();\n  }\n  exports.x = 1;\n}";
        let out = run(source);
        assert_eq!(out, "{\n  setup();\n  ;\n  exports.x = 1;\n}");
    }

    #[test]
    fn test_else_if_chain() {
        let out = run("if (false) { a(); } else if (1 == 1) { b(); } else { c(); }");
        assert_eq!(out, "{ b(); }");
    }

    #[test]
    fn test_non_constant_condition_untouched() {
        let source = "if (x !== \"production\") { a(); } else { b(); }";
        assert_eq!(run(source), source);
    }

    #[test]
    fn test_single_statement_else_not_folded() {
        let source = "if (false) { a(); } else return b;";
        assert_eq!(run(source), source);
    }

    #[test]
    fn test_property_named_if_untouched() {
        let source = "obj.if (false) { a(); }";
        assert_eq!(run(source), source);
    }

    #[test]
    fn test_negated_literal_and_mixed_types() {
        assert_eq!(run("if (!0) { a(); }"), "{ a(); }");
        assert_eq!(run("if (1 === '1') { a(); }"), ";");
        let loose = "if (1 == '1') { a(); }";
        assert_eq!(run(loose), loose);
    }
}
