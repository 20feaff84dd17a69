//! JavaScript handling: tokenizer, define substitution, constant folding and printing

pub mod lexer;
pub mod minify;
pub mod transform;

use std::path::Path;

pub use lexer::{Token, TokenKind, tokenize};
pub use minify::print;
pub use transform::{Defines, fold_constants, substitute_defines};

use crate::error::{BundleError, Result};

/// Tokenize `source` and run the define and folding passes over it
pub fn prepare(source: &str, file: &Path, defines: &Defines) -> Result<Vec<Token<'static>>> {
    let tokens: Vec<Token<'static>> = tokenize(source)
        .map_err(|e| BundleError::parse(file, e.to_string()))?
        .into_iter()
        .map(Token::into_owned)
        .collect();
    let tokens = substitute_defines(tokens, defines);
    Ok(fold_constants(tokens))
}

/// Decode a string literal token without escapes
///
/// Returns `None` for literals containing escapes; those are never treated as
/// static module specifiers.
pub fn string_value<'t>(token: &'t Token<'_>) -> Option<&'t str> {
    if token.kind != TokenKind::String {
        return None;
    }
    let text = token.text.as_ref();
    let inner = &text[1..text.len() - 1];
    (!inner.contains('\\')).then_some(inner)
}

/// Index of the first non-trivia token in `from..limit`
pub(crate) fn next_significant(tokens: &[Token<'_>], from: usize, limit: usize) -> Option<usize> {
    (from..limit).find(|&i| !tokens[i].is_trivia())
}

pub(crate) fn last_significant<'b, 'a>(tokens: &'b [Token<'a>]) -> Option<&'b Token<'a>> {
    tokens.iter().rev().find(|t| !t.is_trivia())
}

/// Whether the previous token makes the next identifier a property name
pub(crate) fn is_member_access(previous: Option<&Token<'_>>) -> bool {
    previous.is_some_and(|t| t.is_punct(".") || t.is_punct("?."))
}
