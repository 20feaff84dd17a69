//! Lossless JavaScript tokenizer: concatenated token text reproduces the input

use std::{borrow::Cow, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Whitespace,
    LineComment,
    BlockComment,
    Ident,
    Number,
    String,
    /// A template literal chunk: from a backtick or `}` up to `${` or the closing backtick
    Template,
    Regex,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: Cow<'a, str>,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind, text: impl Into<Cow<'a, str>>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }

    /// Whether this trivia token contains a line terminator
    pub fn has_line_break(&self) -> bool {
        self.is_trivia() && self.text.chars().any(is_line_terminator)
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == punct
    }

    pub fn is_ident(&self, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == name
    }

    /// Convert borrowed text into owned text, detaching the token from its source
    pub fn into_owned(self) -> Token<'static> {
        Token {
            kind: self.kind,
            text: Cow::Owned(self.text.into_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for LexError {}

/// Keywords after which a `/` starts a regular expression rather than a division
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return",
    "typeof",
    "instanceof",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "throw",
    "case",
    "do",
    "else",
    "yield",
    "await",
];

/// Punctuators, longest first within each leading character
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "%=", "&=", "|=",
    "^=", "<<", ">>", "**", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*",
    "%", "&", "|", "^", "!", "~", "?", ":", "=", ".", "@", "#",
];

fn is_line_terminator(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}')
}

fn is_js_whitespace(c: char) -> bool {
    c.is_whitespace() || c == '\u{feff}'
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$' || c == '\\' || (!c.is_ascii() && !is_js_whitespace(c))
}

pub(crate) fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

/// Tokenize `source`
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>, LexError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    tokens: Vec<Token<'a>>,
    /// Index in `tokens` of the last non-trivia token
    last_significant: Option<usize>,
    /// Open `{` count, including template substitutions
    brace_depth: usize,
    /// Brace depths at which a template substitution was opened
    template_stack: Vec<usize>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            pos: 0,
            tokens: Vec::new(),
            last_significant: None,
            brace_depth: 0,
            template_stack: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token<'a>>, LexError> {
        if self.source.starts_with("#!") {
            let end = self.find_line_end(self.pos);
            self.push(TokenKind::LineComment, end);
        }

        while let Some(c) = self.peek() {
            let start = self.pos;
            if is_js_whitespace(c) {
                let mut end = start;
                for ch in self.source[start..].chars() {
                    if !is_js_whitespace(ch) {
                        break;
                    }
                    end += ch.len_utf8();
                }
                self.push(TokenKind::Whitespace, end);
            } else if self.rest().starts_with("//") {
                let end = self.find_line_end(start);
                self.push(TokenKind::LineComment, end);
            } else if self.rest().starts_with("/*") {
                let end = self.rest()[2..]
                    .find("*/")
                    .map(|offset| start + 2 + offset + 2)
                    .ok_or_else(|| self.error(start, "unterminated block comment"))?;
                self.push(TokenKind::BlockComment, end);
            } else if c == '"' || c == '\'' {
                let end = self.scan_string(start, c)?;
                self.push(TokenKind::String, end);
            } else if c == '`' {
                let end = self.scan_template_chunk(start + 1)?;
                self.push(TokenKind::Template, end);
            } else if c == '}' && self.template_stack.last() == Some(&self.brace_depth) {
                self.template_stack.pop();
                self.brace_depth -= 1;
                let end = self.scan_template_chunk(start + 1)?;
                self.push(TokenKind::Template, end);
            } else if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) {
                let end = self.scan_number(start);
                self.push(TokenKind::Number, end);
            } else if is_ident_start(c) {
                let mut end = start;
                for ch in self.source[start..].chars() {
                    if !is_ident_part(ch) {
                        break;
                    }
                    end += ch.len_utf8();
                }
                self.push(TokenKind::Ident, end);
            } else if c == '/' && self.regex_allowed() {
                let end = self.scan_regex(start)?;
                self.push(TokenKind::Regex, end);
            } else {
                let end = self.scan_punct(start)?;
                match &self.source[start..end] {
                    "{" => self.brace_depth += 1,
                    "}" => self.brace_depth = self.brace_depth.saturating_sub(1),
                    _ => {}
                }
                self.push(TokenKind::Punct, end);
            }
        }

        if !self.template_stack.is_empty() {
            return Err(self.error(self.pos, "unterminated template literal"));
        }
        Ok(self.tokens)
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn push(&mut self, kind: TokenKind, end: usize) {
        let token = Token::new(kind, &self.source[self.pos..end]);
        if !token.is_trivia() {
            self.last_significant = Some(self.tokens.len());
        }
        self.tokens.push(token);
        self.pos = end;
    }

    fn find_line_end(&self, from: usize) -> usize {
        self.source[from..]
            .char_indices()
            .find(|(_, c)| is_line_terminator(*c))
            .map_or(self.source.len(), |(i, _)| from + i)
    }

    fn error(&self, offset: usize, message: &str) -> LexError {
        let before = &self.source[..offset];
        let line = before.matches('\n').count() + 1;
        let column = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;
        LexError {
            line,
            column,
            message: message.to_owned(),
        }
    }

    fn regex_allowed(&self) -> bool {
        let Some(index) = self.last_significant else {
            return true;
        };
        let token = &self.tokens[index];
        match token.kind {
            TokenKind::Punct => !matches!(token.text.as_ref(), ")" | "]" | "++" | "--"),
            TokenKind::Ident => REGEX_PRECEDING_KEYWORDS.contains(&token.text.as_ref()),
            _ => false,
        }
    }

    fn scan_string(&self, start: usize, quote: char) -> Result<usize, LexError> {
        let mut chars = self.source[start + 1..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    // Escapes, including line continuations
                    if let Some((_, '\r')) = chars.next() {
                        let mut lookahead = chars.clone();
                        if let Some((_, '\n')) = lookahead.next() {
                            chars = lookahead;
                        }
                    }
                }
                c if c == quote => return Ok(start + 1 + i + c.len_utf8()),
                '\n' | '\r' => return Err(self.error(start, "unterminated string literal")),
                _ => {}
            }
        }
        Err(self.error(start, "unterminated string literal"))
    }

    /// Scan a template chunk starting after its opening backtick or `}`
    fn scan_template_chunk(&mut self, from: usize) -> Result<usize, LexError> {
        let mut chars = self.source[from..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    chars.next();
                }
                '`' => return Ok(from + i + 1),
                '$' if self.source[from + i..].starts_with("${") => {
                    self.brace_depth += 1;
                    self.template_stack.push(self.brace_depth);
                    return Ok(from + i + 2);
                }
                _ => {}
            }
        }
        Err(self.error(from - 1, "unterminated template literal"))
    }

    fn scan_number(&self, start: usize) -> usize {
        let text = &self.source[start..];
        let is_radix = text.len() > 1
            && text.starts_with('0')
            && matches!(text.as_bytes()[1], b'x' | b'X' | b'o' | b'O' | b'b' | b'B');
        let mut seen_dot = false;
        let mut prev = '\0';
        let mut end = start;
        for c in text.chars() {
            let accept = if c == '.' {
                !seen_dot && !is_radix && !matches!(prev, 'e' | 'E')
            } else if c == '+' || c == '-' {
                !is_radix && matches!(prev, 'e' | 'E')
            } else {
                c.is_ascii_alphanumeric() || c == '_'
            };
            if !accept {
                break;
            }
            if c == '.' {
                seen_dot = true;
            }
            prev = c;
            end += 1;
        }
        end
    }

    fn scan_regex(&self, start: usize) -> Result<usize, LexError> {
        let mut in_class = false;
        let mut chars = self.source[start + 1..].char_indices();
        let mut body_end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if chars.next().is_some_and(|(_, n)| is_line_terminator(n)) {
                        return Err(self.error(start, "unterminated regular expression"));
                    }
                }
                '[' => in_class = true,
                ']' => in_class = false,
                '/' if !in_class => {
                    body_end = Some(start + 1 + i + 1);
                    break;
                }
                c if is_line_terminator(c) => {
                    return Err(self.error(start, "unterminated regular expression"));
                }
                _ => {}
            }
        }
        let Some(mut end) = body_end else {
            return Err(self.error(start, "unterminated regular expression"));
        };
        for c in self.source[end..].chars() {
            if !is_ident_part(c) {
                break;
            }
            end += c.len_utf8();
        }
        Ok(end)
    }

    fn scan_punct(&self, start: usize) -> Result<usize, LexError> {
        let rest = self.rest();
        // `/` and `/=` only reach this point as division operators
        if rest.starts_with("/=") {
            return Ok(start + 2);
        }
        if rest.starts_with('/') {
            return Ok(start + 1);
        }
        for punct in PUNCTUATORS {
            if rest.starts_with(punct) {
                // `a?.5:b` is a conditional, not optional chaining
                if *punct == "?." && rest[2..].starts_with(|c: char| c.is_ascii_digit()) {
                    continue;
                }
                return Ok(start + punct.len());
            }
        }
        let c = self.peek().unwrap_or_default();
        Err(self.error(start, &format!("unexpected character '{c}'")))
    }
}
