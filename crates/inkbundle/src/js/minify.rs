//! Token printer; minified output keeps one line break per source line break

use super::lexer::{Token, TokenKind, is_ident_part};

/// Print `tokens` back to source text
pub fn print(tokens: &[Token<'_>], minify: bool) -> String {
    if !minify {
        return tokens.iter().map(|t| t.text.as_ref()).collect();
    }

    let mut out = String::with_capacity(tokens.iter().map(|t| t.text.len()).sum::<usize>() / 2);
    let mut pending_break = false;
    let mut previous: Option<&Token<'_>> = None;

    for token in tokens {
        if token.is_trivia() {
            pending_break |= token.has_line_break();
            continue;
        }
        if let Some(prev) = previous {
            if pending_break {
                out.push('\n');
            } else if needs_space(prev, token) {
                out.push(' ');
            }
        }
        pending_break = false;
        out.push_str(&token.text);
        previous = Some(token);
    }

    out
}

/// Whether printing `prev` directly before `next` would change how they lex
fn needs_space(prev: &Token<'_>, next: &Token<'_>) -> bool {
    let (Some(last), Some(first)) = (prev.text.chars().last(), next.text.chars().next()) else {
        return false;
    };

    if is_ident_part(last) && is_ident_part(first) {
        return true;
    }
    // `/re/ in x` would otherwise read `in` as flags
    if prev.kind == TokenKind::Regex && is_ident_part(first) {
        return true;
    }
    // `1 .toString()` must not become a decimal point
    if prev.kind == TokenKind::Number && first == '.' {
        return true;
    }
    matches!(
        (last, first),
        ('+', '+') | ('-', '-') | ('/', '/' | '*') | ('<', '!')
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::js::lexer::tokenize;

    fn minify(source: &str) -> String {
        print(&tokenize(source).expect("tokenize should succeed"), true)
    }

    #[test]
    fn test_unminified_is_verbatim() {
        let source = "var a = 1; // keep\n";
        let tokens = tokenize(source).expect("tokenize should succeed");
        assert_eq!(print(&tokens, false), source);
    }

    #[test]
    fn test_collapses_whitespace_and_comments() {
        let out = minify("function add ( a , b ) {\n    // sum\n    return a + b ;\n}\n");
        insta::assert_snapshot!(out, @r"
        function add(a,b){
        return a+b;
        }
        ");
    }

    #[test]
    fn test_keeps_line_break_for_asi() {
        assert_eq!(minify("let a = b\n/* c */ (d)"), "let a=b\n(d)");
        assert_eq!(minify("return /* \n */ x"), "return\nx");
    }

    #[test]
    fn test_separates_fusing_tokens() {
        assert_eq!(minify("a + +b"), "a+ +b");
        assert_eq!(minify("a - --b"), "a- --b");
        assert_eq!(minify("x = /a/ / 2"), "x=/a/ /2");
        assert_eq!(minify("/a/ instanceof RegExp"), "/a/ instanceof RegExp");
        assert_eq!(minify("1 .toString()"), "1 .toString()");
        assert_eq!(minify("typeof x === 'string'"), "typeof x==='string'");
    }

    #[test]
    fn test_template_text_untouched() {
        assert_eq!(minify("f(`a  ${ b }\n  c`)"), "f(`a  ${b}\n  c`)");
    }
}
