//! Script Tokenizer
//!
//! Turns script source into a flat token stream. Template literals are
//! split into text and raw expression source here; the parser re-parses
//! each embedded expression with its original position.

use super::error::SyntaxError;

/// Longest punctuators first so that prefix matching picks the right one
const PUNCTUATORS: &[&str] = &[
    "...", "===", "!==", "**=", "??=", "||=", "&&=", "=>", "==", "!=", "<=", ">=", "&&", "||",
    "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "**", "{", "}", "(", ")", "[", "]", ";",
    ",", "<", ">", "+", "-", "*", "/", "%", "!", "?", ":", "=", ".",
];

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "export", "extends", "false", "finally", "for", "function", "if",
    "import", "in", "instanceof", "let", "new", "null", "return", "super", "switch", "this",
    "throw", "true", "try", "typeof", "undefined", "var", "void", "while", "with", "yield",
];

/// Whether `word` cannot be used as a binding name
pub fn is_reserved_word(word: &str) -> bool {
    RESERVED_WORDS.contains(&word)
}

/// Whether `name` is usable as a variable name inside scripts
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if is_ident_start(first) => {}
        _ => return false,
    }
    chars.all(is_ident_part) && !is_reserved_word(name)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    String(String),
    Template(Vec<TemplatePart>),
    /// Identifiers and keywords alike; the parser decides by context
    Ident(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr {
        source: String,
        line: usize,
        column: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
    /// A line terminator separates this token from the previous one
    pub newline_before: bool,
}

impl Token {
    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(self.kind, TokenKind::Punct(p) if p == punct)
    }

    pub fn is_word(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(w) if w == word)
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::String(_) => "string".to_string(),
            TokenKind::Template(_) => "template literal".to_string(),
            TokenKind::Ident(word) => format!("'{}'", word),
            TokenKind::Punct(p) => format!("'{}'", p),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self::with_position(source, 1, 1)
    }

    /// Tokenize a fragment that starts at `line`/`column` of a larger script
    pub fn with_position(source: &str, line: usize, column: usize) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line,
            column,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            let newline_before = self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                    newline_before,
                });
                return Ok(tokens);
            };

            let kind = if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
            {
                self.number()?
            } else if c == '"' || c == '\'' {
                self.advance();
                TokenKind::String(self.string(c)?)
            } else if c == '`' {
                self.advance();
                TokenKind::Template(self.template()?)
            } else if is_ident_start(c) {
                TokenKind::Ident(self.identifier())
            } else {
                self.punctuator()?
            };

            tokens.push(Token {
                kind,
                line,
                column,
                newline_before,
            });
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line, self.column)
    }

    /// Skip whitespace and comments, reporting whether a newline was crossed
    fn skip_trivia(&mut self) -> Result<bool, SyntaxError> {
        let mut newline = false;
        while let Some(c) = self.peek() {
            if c == '\n' {
                newline = true;
                self.advance();
            } else if c.is_whitespace() {
                self.advance();
            } else if c == '/' && self.peek_at(1) == Some('/') {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if c == '/' && self.peek_at(1) == Some('*') {
                let (line, column) = (self.line, self.column);
                self.advance();
                self.advance();
                loop {
                    match self.advance() {
                        Some('*') if self.peek() == Some('/') => {
                            self.advance();
                            break;
                        }
                        Some('\n') => newline = true,
                        Some(_) => {}
                        None => {
                            return Err(SyntaxError::new("Unterminated comment", line, column))
                        }
                    }
                }
            } else {
                break;
            }
        }
        Ok(newline)
    }

    fn number(&mut self) -> Result<TokenKind, SyntaxError> {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    digits.push(c);
                } else if c != '_' {
                    break;
                }
                self.advance();
            }
            let value = u64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("Invalid hexadecimal literal"))?;
            return self.finish_number(value as f64);
        }

        let mut text = String::new();
        self.digits(&mut text);
        if self.peek() == Some('.') {
            text.push('.');
            self.advance();
            self.digits(&mut text);
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = self.peek_at(1);
            let has_digits = match sign {
                Some('+') | Some('-') => self.peek_at(2).is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if has_digits {
                text.push('e');
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek() {
                    text.push(sign);
                    self.advance();
                }
                self.digits(&mut text);
            }
        }
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(format!("Invalid number literal '{}'", text)))?;
        self.finish_number(value)
    }

    fn digits(&mut self, out: &mut String) {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                out.push(c);
            } else if c != '_' {
                break;
            }
            self.advance();
        }
    }

    fn finish_number(&mut self, value: f64) -> Result<TokenKind, SyntaxError> {
        if self.peek().is_some_and(is_ident_start) {
            return Err(self.error("Invalid or unexpected token after number"));
        }
        Ok(TokenKind::Number(value))
    }

    /// Read a quoted string; the opening quote is already consumed
    fn string(&mut self, quote: char) -> Result<String, SyntaxError> {
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(self.error("Unterminated string literal")),
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(value);
                }
                Some('\\') => {
                    self.advance();
                    if let Some(c) = self.escape()? {
                        value.push(c);
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    /// Decode an escape sequence after the backslash; `None` for line continuations
    fn escape(&mut self) -> Result<Option<char>, SyntaxError> {
        let Some(c) = self.advance() else {
            return Err(self.error("Unterminated escape sequence"));
        };
        let decoded = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '0' => '\0',
            '\n' => return Ok(None),
            'x' => {
                let code = self.hex_digits(2)?;
                char::from_u32(code).ok_or_else(|| self.error("Invalid escape sequence"))?
            }
            'u' => {
                let code = if self.peek() == Some('{') {
                    self.advance();
                    let mut digits = String::new();
                    while let Some(c) = self.advance() {
                        if c == '}' {
                            break;
                        }
                        digits.push(c);
                    }
                    u32::from_str_radix(&digits, 16)
                        .map_err(|_| self.error("Invalid Unicode escape sequence"))?
                } else {
                    self.hex_digits(4)?
                };
                char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
            }
            other => other,
        };
        Ok(Some(decoded))
    }

    fn hex_digits(&mut self, count: usize) -> Result<u32, SyntaxError> {
        let mut digits = String::with_capacity(count);
        for _ in 0..count {
            match self.advance() {
                Some(c) if c.is_ascii_hexdigit() => digits.push(c),
                _ => return Err(self.error("Invalid hexadecimal escape sequence")),
            }
        }
        u32::from_str_radix(&digits, 16).map_err(|_| self.error("Invalid escape sequence"))
    }

    /// Read a template literal; the opening backtick is already consumed
    fn template(&mut self) -> Result<Vec<TemplatePart>, SyntaxError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.advance() {
                None => return Err(self.error("Unterminated template literal")),
                Some('`') => break,
                Some('\\') => {
                    if let Some(c) = self.escape()? {
                        text.push(c);
                    }
                }
                Some('$') if self.peek() == Some('{') => {
                    self.advance();
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    let (line, column) = (self.line, self.column);
                    let mut source = String::new();
                    self.raw_expression(&mut source)?;
                    parts.push(TemplatePart::Expr {
                        source,
                        line,
                        column,
                    });
                }
                Some(c) => text.push(c),
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        Ok(parts)
    }

    /// Copy raw source up to the `}` closing a `${`, which is consumed but not copied
    fn raw_expression(&mut self, out: &mut String) -> Result<(), SyntaxError> {
        let mut depth = 0usize;
        loop {
            let Some(c) = self.advance() else {
                return Err(self.error("Unterminated template expression"));
            };
            match c {
                '}' if depth == 0 => return Ok(()),
                '}' => depth -= 1,
                '{' => depth += 1,
                '"' | '\'' => {
                    out.push(c);
                    self.raw_string(c, out)?;
                    continue;
                }
                '`' => {
                    out.push(c);
                    self.raw_template(out)?;
                    continue;
                }
                _ => {}
            }
            out.push(c);
        }
    }

    fn raw_string(&mut self, quote: char, out: &mut String) -> Result<(), SyntaxError> {
        loop {
            let Some(c) = self.advance() else {
                return Err(self.error("Unterminated string literal"));
            };
            out.push(c);
            if c == '\\' {
                if let Some(next) = self.advance() {
                    out.push(next);
                }
            } else if c == quote {
                return Ok(());
            }
        }
    }

    fn raw_template(&mut self, out: &mut String) -> Result<(), SyntaxError> {
        loop {
            let Some(c) = self.advance() else {
                return Err(self.error("Unterminated template literal"));
            };
            out.push(c);
            match c {
                '\\' => {
                    if let Some(next) = self.advance() {
                        out.push(next);
                    }
                }
                '`' => return Ok(()),
                '$' if self.peek() == Some('{') => {
                    self.advance();
                    out.push('{');
                    self.raw_expression(out)?;
                    out.push('}');
                }
                _ => {}
            }
        }
    }

    fn identifier(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if !is_ident_part(c) {
                break;
            }
            word.push(c);
            self.advance();
        }
        word
    }

    fn punctuator(&mut self) -> Result<TokenKind, SyntaxError> {
        for punct in PUNCTUATORS {
            if !self.matches_at(punct) {
                continue;
            }
            // `a?.5:1` is a conditional, not optional chaining
            if *punct == "?." && self.peek_at(2).is_some_and(|c| c.is_ascii_digit()) {
                continue;
            }
            for _ in 0..punct.len() {
                self.advance();
            }
            return Ok(TokenKind::Punct(punct));
        }
        let c = self.peek().unwrap_or(' ');
        Err(self.error(format!("Invalid or unexpected token '{}'", c)))
    }

    fn matches_at(&self, punct: &str) -> bool {
        punct
            .chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }
}
