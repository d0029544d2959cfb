//! Script Parser
//!
//! Recursive descent parser producing [`Program`] from source text.
//! Automatic semicolon insertion follows the usual line-break rule.

use std::sync::Arc;

use super::ast::*;
use super::error::SyntaxError;
use super::lexer::{is_reserved_word, Lexer, TemplatePart, Token, TokenKind};

/// Nesting budget shared by statements, expressions and operator chains
const MAX_DEPTH: usize = 192;

/// Parse a complete script
pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens, 0);
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.parse_statement()?);
    }
    Ok(Program { body })
}

type PResult<T> = Result<T, SyntaxError>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
        }
    }

    // =========================================================================
    // Token helpers
    // =========================================================================

    fn token_at(&self, index: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[index.min(last)]
    }

    fn peek(&self) -> &Token {
        self.token_at(self.pos)
    }

    fn peek_ahead(&self, offset: usize) -> &Token {
        self.token_at(self.pos + offset)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.peek().is_punct(punct) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.peek().is_word(word) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> PResult<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_word(&mut self, word: &str) -> PResult<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> SyntaxError {
        let token = self.peek();
        let message = match token.kind {
            TokenKind::Eof => "Unexpected end of input".to_string(),
            _ => format!("Unexpected token {}", token.describe()),
        };
        SyntaxError::new(message, token.line, token.column)
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(message, token.line, token.column)
    }

    /// A binding name: an identifier that is not a reserved word
    fn binding_name(&mut self) -> PResult<Arc<str>> {
        match &self.peek().kind {
            TokenKind::Ident(word) if !is_reserved_word(word) => {
                let name: Arc<str> = Arc::from(word.as_str());
                self.bump();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Any identifier, reserved words included, as used after `.`
    fn property_name(&mut self) -> PResult<Arc<str>> {
        match &self.peek().kind {
            TokenKind::Ident(word) => {
                let name: Arc<str> = Arc::from(word.as_str());
                self.bump();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error_here("Maximum nesting depth exceeded"));
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn consume_semicolon(&mut self) -> PResult<()> {
        if self.eat_punct(";") {
            return Ok(());
        }
        let token = self.peek();
        if token.is_punct("}") || token.newline_before || matches!(token.kind, TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn parse_statement(&mut self) -> PResult<Stmt> {
        self.enter()?;
        let stmt = self.parse_statement_inner();
        self.leave(1);
        stmt
    }

    fn parse_statement_inner(&mut self) -> PResult<Stmt> {
        let token = self.peek().clone();
        if token.is_punct("{") {
            return Ok(Stmt::Block(self.parse_block()?));
        }
        if token.is_punct(";") {
            self.bump();
            return Ok(Stmt::Empty);
        }
        let TokenKind::Ident(word) = &token.kind else {
            return self.parse_expression_statement();
        };
        match word.as_str() {
            "let" | "const" | "var" => {
                self.bump();
                let kind = match word.as_str() {
                    "let" => DeclKind::Let,
                    "const" => DeclKind::Const,
                    _ => DeclKind::Var,
                };
                let decls = self.parse_declarators(kind, None)?;
                self.consume_semicolon()?;
                Ok(Stmt::Declare { kind, decls })
            }
            "function" => {
                self.bump();
                Ok(Stmt::Function(self.parse_function(false, true)?))
            }
            "async"
                if self.peek_ahead(1).is_word("function") && !self.peek_ahead(1).newline_before =>
            {
                self.bump();
                self.bump();
                Ok(Stmt::Function(self.parse_function(true, true)?))
            }
            "if" => {
                self.bump();
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                let consequent = Box::new(self.parse_statement()?);
                let alternate = if self.eat_word("else") {
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    test,
                    consequent,
                    alternate,
                })
            }
            "while" => {
                self.bump();
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While { test, body })
            }
            "do" => {
                self.bump();
                let body = Box::new(self.parse_statement()?);
                self.expect_word("while")?;
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                self.eat_punct(";");
                Ok(Stmt::DoWhile { body, test })
            }
            "for" => {
                self.bump();
                self.parse_for()
            }
            "return" => {
                self.bump();
                let next = self.peek();
                let argument = if next.newline_before
                    || next.is_punct(";")
                    || next.is_punct("}")
                    || matches!(next.kind, TokenKind::Eof)
                {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.consume_semicolon()?;
                Ok(Stmt::Return(argument))
            }
            "break" => {
                self.bump();
                self.consume_semicolon()?;
                Ok(Stmt::Break)
            }
            "continue" => {
                self.bump();
                self.consume_semicolon()?;
                Ok(Stmt::Continue)
            }
            "throw" => {
                self.bump();
                if self.peek().newline_before {
                    return Err(self.error_here("Illegal newline after throw"));
                }
                let argument = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Throw(argument))
            }
            "try" => {
                self.bump();
                self.parse_try()
            }
            "class" | "switch" | "import" | "export" | "with" | "yield" => Err(self.error_here(
                format!("Unsupported syntax '{}'", word),
            )),
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_expression_statement(&mut self) -> PResult<Stmt> {
        let expr = self.parse_expression()?;
        self.consume_semicolon()?;
        Ok(Stmt::Expr(expr))
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.peek().is_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            body.push(self.parse_statement()?);
        }
        self.bump();
        Ok(body)
    }

    /// Declarators after the keyword; `first` is a pattern already consumed by `for (`
    fn parse_declarators(
        &mut self,
        kind: DeclKind,
        first: Option<Pattern>,
    ) -> PResult<Vec<(Pattern, Option<Expr>)>> {
        let mut decls = Vec::new();
        let mut pending = first;
        loop {
            let pattern = match pending.take() {
                Some(pattern) => pattern,
                None => self.parse_binding_pattern()?,
            };
            let init = if self.eat_punct("=") {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            if init.is_none() {
                if kind == DeclKind::Const {
                    return Err(self.error_here("Missing initializer in const declaration"));
                }
                if !matches!(pattern, Pattern::Ident(_)) {
                    return Err(self.error_here("Missing initializer in destructuring declaration"));
                }
            }
            decls.push((pattern, init));
            if !self.eat_punct(",") {
                return Ok(decls);
            }
        }
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        self.expect_punct("(")?;
        let kind = if self.eat_word("let") {
            Some(DeclKind::Let)
        } else if self.eat_word("const") {
            Some(DeclKind::Const)
        } else if self.eat_word("var") {
            Some(DeclKind::Var)
        } else {
            None
        };

        let init = match kind {
            Some(kind) => {
                let pattern = self.parse_binding_pattern()?;
                if self.eat_word("of") {
                    let iterable = self.parse_assignment()?;
                    self.expect_punct(")")?;
                    let body = Box::new(self.parse_statement()?);
                    return Ok(Stmt::ForOf {
                        kind,
                        pattern,
                        iterable,
                        body,
                    });
                }
                if self.eat_word("in") {
                    let object = self.parse_expression()?;
                    self.expect_punct(")")?;
                    let body = Box::new(self.parse_statement()?);
                    return Ok(Stmt::ForIn {
                        kind,
                        pattern,
                        object,
                        body,
                    });
                }
                let decls = self.parse_declarators(kind, Some(pattern))?;
                Some(Box::new(Stmt::Declare { kind, decls }))
            }
            None if self.peek().is_punct(";") => None,
            None => Some(Box::new(Stmt::Expr(self.parse_expression()?))),
        };
        self.expect_punct(";")?;
        let test = if self.peek().is_punct(";") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.peek().is_punct(")") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let block = self.parse_block()?;
        let mut param = None;
        let mut handler = None;
        if self.eat_word("catch") {
            if self.eat_punct("(") {
                param = Some(self.parse_binding_pattern()?);
                self.expect_punct(")")?;
            }
            handler = Some(self.parse_block()?);
        }
        let finalizer = if self.eat_word("finally") {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error_here("Missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    // =========================================================================
    // Functions and patterns
    // =========================================================================

    /// Parse after the `function` keyword
    fn parse_function(&mut self, is_async: bool, require_name: bool) -> PResult<Arc<FunctionDef>> {
        let name = if matches!(self.peek().kind, TokenKind::Ident(_)) {
            Some(self.binding_name()?)
        } else if require_name {
            return Err(self.unexpected());
        } else {
            None
        };
        let (params, rest) = self.parse_params()?;
        let body = FunctionBody::Block(self.parse_block()?);
        Ok(Arc::new(FunctionDef {
            name,
            params,
            rest,
            body,
            is_async,
            is_arrow: false,
        }))
    }

    fn parse_params(&mut self) -> PResult<(Vec<PatternElem>, Option<Pattern>)> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut rest = None;
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                rest = Some(self.parse_binding_pattern()?);
                self.eat_punct(",");
                self.expect_punct(")")?;
                break;
            }
            params.push(self.parse_pattern_elem()?);
            if !self.peek().is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok((params, rest))
    }

    fn parse_pattern_elem(&mut self) -> PResult<PatternElem> {
        let target = self.parse_binding_pattern()?;
        let default = if self.eat_punct("=") {
            Some(self.parse_assignment()?)
        } else {
            None
        };
        Ok(PatternElem { target, default })
    }

    fn parse_binding_pattern(&mut self) -> PResult<Pattern> {
        self.enter()?;
        let pattern = self.parse_binding_pattern_inner();
        self.leave(1);
        pattern
    }

    fn parse_binding_pattern_inner(&mut self) -> PResult<Pattern> {
        if self.eat_punct("[") {
            let mut elems = Vec::new();
            let mut rest = None;
            while !self.eat_punct("]") {
                if self.eat_punct(",") {
                    elems.push(None);
                    continue;
                }
                if self.eat_punct("...") {
                    rest = Some(Box::new(self.parse_binding_pattern()?));
                    self.expect_punct("]")?;
                    break;
                }
                elems.push(Some(self.parse_pattern_elem()?));
                if !self.peek().is_punct("]") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Array { elems, rest });
        }

        if self.eat_punct("{") {
            let mut props = Vec::new();
            let mut rest = None;
            while !self.eat_punct("}") {
                if self.eat_punct("...") {
                    rest = Some(self.binding_name()?);
                    self.eat_punct(",");
                    self.expect_punct("}")?;
                    break;
                }
                let (key, shorthand) = self.parse_property_key()?;
                let elem = if self.eat_punct(":") {
                    self.parse_pattern_elem()?
                } else {
                    let Some(name) = shorthand.filter(|name| !is_reserved_word(name)) else {
                        return Err(self.unexpected());
                    };
                    let default = if self.eat_punct("=") {
                        Some(self.parse_assignment()?)
                    } else {
                        None
                    };
                    PatternElem {
                        target: Pattern::Ident(name),
                        default,
                    }
                };
                props.push((key, elem));
                if !self.peek().is_punct("}") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Object { props, rest });
        }

        Ok(Pattern::Ident(self.binding_name()?))
    }

    /// Object key; also returns the bare identifier when shorthand is possible
    fn parse_property_key(&mut self) -> PResult<(PropKey, Option<Arc<str>>)> {
        if self.at_eof() {
            return Err(self.unexpected());
        }
        let token = self.bump();
        match token.kind {
            TokenKind::Ident(word) => {
                let name: Arc<str> = Arc::from(word.as_str());
                Ok((PropKey::Static(name.clone()), Some(name)))
            }
            TokenKind::String(text) => Ok((PropKey::Static(Arc::from(text.as_str())), None)),
            TokenKind::Number(n) => Ok((PropKey::Static(Arc::from(number_key(n).as_str())), None)),
            TokenKind::Punct("[") => {
                let expr = self.parse_assignment()?;
                self.expect_punct("]")?;
                Ok((PropKey::Computed(Box::new(expr)), None))
            }
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn parse_expression(&mut self) -> PResult<Expr> {
        let first = self.parse_assignment()?;
        if !self.peek().is_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            items.push(self.parse_assignment()?);
        }
        Ok(Expr::Sequence(items))
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.parse_assignment_inner();
        self.leave(1);
        expr
    }

    fn parse_assignment_inner(&mut self) -> PResult<Expr> {
        if let Some(arrow) = self.try_parse_arrow()? {
            return Ok(arrow);
        }

        let left = self.parse_conditional()?;
        let op = match &self.peek().kind {
            TokenKind::Punct(p) => match *p {
                "=" => AssignOp::Assign,
                "+=" => AssignOp::Add,
                "-=" => AssignOp::Sub,
                "*=" => AssignOp::Mul,
                "/=" => AssignOp::Div,
                "%=" => AssignOp::Rem,
                "**=" => AssignOp::Exp,
                "??=" => AssignOp::Nullish,
                "||=" => AssignOp::Or,
                "&&=" => AssignOp::And,
                _ => return Ok(left),
            },
            _ => return Ok(left),
        };

        let target = match left {
            Expr::Ident(name) => AssignTarget::Ident(name),
            Expr::Member {
                object,
                property,
                optional: false,
            } => AssignTarget::Member {
                object: *object,
                property,
            },
            expr @ (Expr::Array(_) | Expr::Object(_)) if op == AssignOp::Assign => {
                AssignTarget::Pattern(self.expr_to_pattern(expr)?)
            }
            _ => return Err(self.error_here("Invalid left-hand side in assignment")),
        };
        self.bump();
        let value = self.parse_assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    /// Whether the tokens at `index` start an arrow function's parameter list
    fn arrow_at(&self, index: usize) -> bool {
        let token = self.token_at(index);
        match &token.kind {
            TokenKind::Ident(word) if !is_reserved_word(word) => {
                self.token_at(index + 1).is_punct("=>")
            }
            TokenKind::Punct("(") => {
                let mut depth = 0usize;
                let mut i = index;
                loop {
                    match self.token_at(i).kind {
                        TokenKind::Punct("(" | "[" | "{") => depth += 1,
                        TokenKind::Punct(")" | "]" | "}") => {
                            depth -= 1;
                            if depth == 0 {
                                let next = self.token_at(i + 1);
                                return next.is_punct("=>") && !next.newline_before;
                            }
                        }
                        TokenKind::Eof => return false,
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ => false,
        }
    }

    fn try_parse_arrow(&mut self) -> PResult<Option<Expr>> {
        let is_async = self.peek().is_word("async")
            && !self.peek_ahead(1).newline_before
            && self.arrow_at(self.pos + 1);
        if !is_async && !self.arrow_at(self.pos) {
            return Ok(None);
        }
        if is_async {
            self.bump();
        }

        let (params, rest) = if self.peek().is_punct("(") {
            self.parse_params()?
        } else {
            (vec![PatternElem::new(Pattern::Ident(self.binding_name()?))], None)
        };
        self.expect_punct("=>")?;
        let body = if self.peek().is_punct("{") {
            FunctionBody::Block(self.parse_block()?)
        } else {
            FunctionBody::Expr(Box::new(self.parse_assignment()?))
        };
        Ok(Some(Expr::Function(Arc::new(FunctionDef {
            name: None,
            params,
            rest,
            body,
            is_async,
            is_arrow: true,
        }))))
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        let test = self.parse_binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.parse_assignment()?;
        self.expect_punct(":")?;
        let alternate = self.parse_assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn binary_operator(&self) -> Option<(Operator, u8)> {
        let token = self.peek();
        if token.is_word("in") {
            return Some((Operator::Binary(BinaryOp::In), 5));
        }
        if token.is_word("instanceof") {
            return Some((Operator::Binary(BinaryOp::InstanceOf), 5));
        }
        let TokenKind::Punct(p) = token.kind else {
            return None;
        };
        let op = match p {
            "??" => (Operator::Logical(LogicalOp::Nullish), 1),
            "||" => (Operator::Logical(LogicalOp::Or), 2),
            "&&" => (Operator::Logical(LogicalOp::And), 3),
            "==" => (Operator::Binary(BinaryOp::Eq), 4),
            "!=" => (Operator::Binary(BinaryOp::NotEq), 4),
            "===" => (Operator::Binary(BinaryOp::StrictEq), 4),
            "!==" => (Operator::Binary(BinaryOp::StrictNotEq), 4),
            "<" => (Operator::Binary(BinaryOp::Lt), 5),
            "<=" => (Operator::Binary(BinaryOp::LtEq), 5),
            ">" => (Operator::Binary(BinaryOp::Gt), 5),
            ">=" => (Operator::Binary(BinaryOp::GtEq), 5),
            "+" => (Operator::Binary(BinaryOp::Add), 6),
            "-" => (Operator::Binary(BinaryOp::Sub), 6),
            "*" => (Operator::Binary(BinaryOp::Mul), 7),
            "/" => (Operator::Binary(BinaryOp::Div), 7),
            "%" => (Operator::Binary(BinaryOp::Rem), 7),
            _ => return None,
        };
        Some(op)
    }

    /// Precedence climbing over the left-associative binary operators
    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut left = self.parse_unary()?;
        let mut links = 0;
        let result = loop {
            let Some((op, prec)) = self.binary_operator() else {
                break Ok(left);
            };
            if prec < min_prec {
                break Ok(left);
            }
            if let Err(err) = self.enter() {
                break Err(err);
            }
            links += 1;
            self.bump();
            let right = match self.parse_binary(prec + 1) {
                Ok(right) => right,
                Err(err) => break Err(err),
            };
            left = match op {
                Operator::Binary(op) => Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                Operator::Logical(op) => Expr::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        };
        self.leave(links);
        result
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.parse_unary_inner();
        self.leave(1);
        expr
    }

    fn parse_unary_inner(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let op = match &token.kind {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Neg),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Ident(w) if w == "typeof" => Some(UnaryOp::Typeof),
            TokenKind::Ident(w) if w == "void" => Some(UnaryOp::Void),
            TokenKind::Ident(w) if w == "delete" => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let arg = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                arg: Box::new(arg),
            });
        }
        if token.is_word("await") {
            self.bump();
            let arg = self.parse_unary()?;
            return Ok(Expr::Await(Box::new(arg)));
        }
        if token.is_punct("++") || token.is_punct("--") {
            self.bump();
            let target = self.parse_unary()?;
            return self.update(token.is_punct("++"), true, target);
        }

        let base = self.parse_postfix()?;
        if self.eat_punct("**") {
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Exp,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn update(&self, increment: bool, prefix: bool, target: Expr) -> PResult<Expr> {
        if !matches!(
            target,
            Expr::Ident(_) | Expr::Member { optional: false, .. }
        ) {
            return Err(self.error_here("Invalid left-hand side expression in update operation"));
        }
        let op = if increment {
            UpdateOp::Increment
        } else {
            UpdateOp::Decrement
        };
        Ok(Expr::Update {
            op,
            prefix,
            target: Box::new(target),
        })
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let expr = self.parse_call_member()?;
        let token = self.peek();
        if (token.is_punct("++") || token.is_punct("--")) && !token.newline_before {
            let increment = token.is_punct("++");
            self.bump();
            return self.update(increment, false, expr);
        }
        Ok(expr)
    }

    fn parse_call_member(&mut self) -> PResult<Expr> {
        let mut expr = if self.peek().is_word("new") {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        let mut chained = false;
        let mut links = 0;
        let result = loop {
            let next = self.peek();
            if !(next.is_punct(".") || next.is_punct("?.") || next.is_punct("[") || next.is_punct("(")) {
                break Ok(expr);
            }
            if let Err(err) = self.enter() {
                break Err(err);
            }
            links += 1;
            let step = if self.eat_punct(".") {
                self.property_name().map(|name| Expr::Member {
                    object: Box::new(expr),
                    property: MemberProp::Static(name),
                    optional: false,
                })
            } else if self.eat_punct("?.") {
                chained = true;
                if self.peek().is_punct("(") {
                    self.parse_arguments().map(|args| Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                    })
                } else if self.eat_punct("[") {
                    self.parse_computed().map(|property| Expr::Member {
                        object: Box::new(expr),
                        property,
                        optional: true,
                    })
                } else {
                    self.property_name().map(|name| Expr::Member {
                        object: Box::new(expr),
                        property: MemberProp::Static(name),
                        optional: true,
                    })
                }
            } else if self.eat_punct("[") {
                self.parse_computed().map(|property| Expr::Member {
                    object: Box::new(expr),
                    property,
                    optional: false,
                })
            } else {
                self.parse_arguments().map(|args| Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                })
            };
            match step {
                Ok(next) => expr = next,
                Err(err) => break Err(err),
            }
        };
        self.leave(links);
        let expr = result?;
        Ok(if chained {
            Expr::OptionalChain(Box::new(expr))
        } else {
            expr
        })
    }

    fn parse_computed(&mut self) -> PResult<MemberProp> {
        let expr = self.parse_expression()?;
        self.expect_punct("]")?;
        Ok(MemberProp::Computed(Box::new(expr)))
    }

    fn parse_new(&mut self) -> PResult<Expr> {
        self.enter()?;
        let expr = self.parse_new_inner();
        self.leave(1);
        expr
    }

    fn parse_new_inner(&mut self) -> PResult<Expr> {
        self.expect_word("new")?;
        let mut callee = if self.peek().is_word("new") {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        loop {
            if self.eat_punct(".") {
                callee = Expr::Member {
                    object: Box::new(callee),
                    property: MemberProp::Static(self.property_name()?),
                    optional: false,
                };
            } else if self.eat_punct("[") {
                callee = Expr::Member {
                    object: Box::new(callee),
                    property: self.parse_computed()?,
                    optional: false,
                };
            } else {
                break;
            }
        }
        let args = if self.peek().is_punct("(") {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
        })
    }

    fn parse_arguments(&mut self) -> PResult<Vec<ArrayElement>> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                args.push(ArrayElement::Spread(self.parse_assignment()?));
            } else {
                args.push(ArrayElement::Item(self.parse_assignment()?));
            }
            if !self.peek().is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let token = self.bump();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::String(text) => Ok(Expr::String(Arc::from(text.as_str()))),
            TokenKind::Template(parts) => self.parse_template(parts),
            TokenKind::Punct("(") => {
                let expr = self.parse_expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            TokenKind::Punct("[") => self.parse_array_literal(),
            TokenKind::Punct("{") => self.parse_object_literal(),
            TokenKind::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "undefined" => Ok(Expr::Undefined),
                "function" => Ok(Expr::Function(self.parse_function(false, false)?)),
                "async" if self.peek().is_word("function") && !self.peek().newline_before => {
                    self.bump();
                    Ok(Expr::Function(self.parse_function(true, false)?))
                }
                _ if is_reserved_word(&word) => {
                    self.pos -= 1;
                    Err(self.unexpected())
                }
                _ => Ok(Expr::Ident(Arc::from(word.as_str()))),
            },
            _ => {
                if !matches!(token.kind, TokenKind::Eof) {
                    self.pos -= 1;
                }
                Err(self.unexpected())
            }
        }
    }

    fn parse_template(&mut self, parts: Vec<TemplatePart>) -> PResult<Expr> {
        let mut quasis = Vec::new();
        let mut exprs = Vec::new();
        let mut text = String::new();
        for part in parts {
            match part {
                TemplatePart::Text(chunk) => text.push_str(&chunk),
                TemplatePart::Expr {
                    source,
                    line,
                    column,
                } => {
                    quasis.push(std::mem::take(&mut text));
                    let tokens = Lexer::with_position(&source, line, column).tokenize()?;
                    let mut inner = Parser::new(tokens, self.depth);
                    let expr = inner.parse_expression()?;
                    if !inner.at_eof() {
                        return Err(inner.unexpected());
                    }
                    exprs.push(expr);
                }
            }
        }
        quasis.push(text);
        Ok(Expr::Template { quasis, exprs })
    }

    fn parse_array_literal(&mut self) -> PResult<Expr> {
        let mut elements = Vec::new();
        while !self.eat_punct("]") {
            if self.eat_punct(",") {
                elements.push(ArrayElement::Hole);
                continue;
            }
            if self.eat_punct("...") {
                elements.push(ArrayElement::Spread(self.parse_assignment()?));
            } else {
                elements.push(ArrayElement::Item(self.parse_assignment()?));
            }
            if !self.peek().is_punct("]") {
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Array(elements))
    }

    fn parse_object_literal(&mut self) -> PResult<Expr> {
        let mut props = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                props.push(Property::Spread(self.parse_assignment()?));
            } else {
                let is_async = self.peek().is_word("async")
                    && !matches!(
                        self.peek_ahead(1).kind,
                        TokenKind::Punct(":" | "(" | "," | "}")
                    );
                if is_async {
                    self.bump();
                }
                let (key, shorthand) = self.parse_property_key()?;
                let value = if self.peek().is_punct("(") {
                    let (params, rest) = self.parse_params()?;
                    let body = FunctionBody::Block(self.parse_block()?);
                    let name = match &key {
                        PropKey::Static(name) => Some(name.clone()),
                        PropKey::Computed(_) => None,
                    };
                    Expr::Function(Arc::new(FunctionDef {
                        name,
                        params,
                        rest,
                        body,
                        is_async,
                        is_arrow: false,
                    }))
                } else if is_async {
                    return Err(self.unexpected());
                } else if self.eat_punct(":") {
                    self.parse_assignment()?
                } else {
                    match shorthand {
                        Some(name) if !is_reserved_word(&name) => Expr::Ident(name),
                        _ => return Err(self.unexpected()),
                    }
                };
                props.push(Property::KeyValue(key, value));
            }
            if !self.peek().is_punct("}") {
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Object(props))
    }

    /// Reinterpret an array or object literal as a destructuring assignment target
    fn expr_to_pattern(&self, expr: Expr) -> PResult<Pattern> {
        match expr {
            Expr::Ident(name) => Ok(Pattern::Ident(name)),
            member @ Expr::Member {
                optional: false, ..
            } => Ok(Pattern::Expr(Box::new(member))),
            Expr::Array(elements) => {
                let count = elements.len();
                let mut elems = Vec::new();
                let mut rest = None;
                for (index, element) in elements.into_iter().enumerate() {
                    match element {
                        ArrayElement::Hole => elems.push(None),
                        ArrayElement::Item(item) => elems.push(Some(self.expr_to_elem(item)?)),
                        ArrayElement::Spread(target) if index + 1 == count => {
                            rest = Some(Box::new(self.expr_to_pattern(target)?));
                        }
                        ArrayElement::Spread(_) => {
                            return Err(self.error_here("Rest element must be last element"))
                        }
                    }
                }
                Ok(Pattern::Array { elems, rest })
            }
            Expr::Object(properties) => {
                let mut props = Vec::new();
                let mut rest = None;
                for property in properties {
                    match property {
                        Property::KeyValue(key, value) => {
                            props.push((key, self.expr_to_elem(value)?))
                        }
                        Property::Spread(Expr::Ident(name)) => rest = Some(name),
                        Property::Spread(_) => {
                            return Err(self.error_here("Invalid rest element in object pattern"))
                        }
                    }
                }
                Ok(Pattern::Object { props, rest })
            }
            _ => Err(self.error_here("Invalid destructuring assignment target")),
        }
    }

    fn expr_to_elem(&self, expr: Expr) -> PResult<PatternElem> {
        match expr {
            Expr::Assign {
                op: AssignOp::Assign,
                target,
                value,
            } => {
                let target = match *target {
                    AssignTarget::Ident(name) => Pattern::Ident(name),
                    AssignTarget::Member { object, property } => {
                        Pattern::Expr(Box::new(Expr::Member {
                            object: Box::new(object),
                            property,
                            optional: false,
                        }))
                    }
                    AssignTarget::Pattern(pattern) => pattern,
                };
                Ok(PatternElem {
                    target,
                    default: Some(*value),
                })
            }
            other => Ok(PatternElem::new(self.expr_to_pattern(other)?)),
        }
    }
}

enum Operator {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

/// Canonical property key for a numeric literal key
fn number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(source: &str) -> Expr {
        let program = parse(source).unwrap();
        match program.body.into_iter().next() {
            Some(Stmt::Expr(expr)) => expr,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let parsed = expr("1 + 2 * 3");
        let Expr::Binary { op, right, .. } = parsed else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_exponent_is_right_associative() {
        let Expr::Binary { op, left, right } = expr("2 ** 3 ** 2") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Exp);
        assert_eq!(*left, Expr::Number(2.0));
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Exp, .. }));
    }

    #[test]
    fn test_nullish_binds_looser_than_or() {
        let parsed = expr("a ?? b || c");
        assert!(matches!(
            parsed,
            Expr::Logical {
                op: LogicalOp::Nullish,
                ..
            }
        ));
    }

    #[test]
    fn test_arrow_functions() {
        assert!(matches!(expr("x => x * 2"), Expr::Function(def) if def.is_arrow && def.params.len() == 1));
        assert!(matches!(expr("(a, b) => { return a + b }"), Expr::Function(def) if def.params.len() == 2));
        assert!(matches!(expr("async () => 1"), Expr::Function(def) if def.is_async));
        assert!(matches!(expr("({ a, b = 2 }, ...rest) => a"), Expr::Function(def) if def.rest.is_some()));
    }

    #[test]
    fn test_parenthesised_expression_is_not_arrow() {
        assert!(matches!(expr("(a + b) * c"), Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_optional_chain_wraps_whole_chain() {
        let Expr::OptionalChain(inner) = expr("a?.b.c()") else {
            panic!("expected optional chain");
        };
        assert!(matches!(*inner, Expr::Call { optional: false, .. }));
    }

    #[test]
    fn test_asi_on_newlines() {
        let program = parse("let a = 1\nlet b = a + 1\nb").unwrap();
        assert_eq!(program.body.len(), 3);
    }

    #[test]
    fn test_return_followed_by_newline_has_no_argument() {
        let program = parse("function f() {\n  return\n  42\n}").unwrap();
        let Stmt::Function(def) = &program.body[0] else {
            panic!("expected function");
        };
        let FunctionBody::Block(body) = &def.body else {
            panic!("expected block body");
        };
        assert_eq!(body[0], Stmt::Return(None));
    }

    #[test]
    fn test_destructuring_declaration() {
        let program = parse("const { a, b: [c, , d = 4], ...rest } = obj").unwrap();
        let Stmt::Declare { kind, decls } = &program.body[0] else {
            panic!("expected declaration");
        };
        assert_eq!(*kind, DeclKind::Const);
        let Pattern::Object { props, rest } = &decls[0].0 else {
            panic!("expected object pattern");
        };
        assert_eq!(props.len(), 2);
        assert_eq!(rest.as_deref(), Some("rest"));
    }

    #[test]
    fn test_destructuring_assignment() {
        let parsed = expr("[a, b] = [b, a]");
        assert!(matches!(
            parsed,
            Expr::Assign { target, .. } if matches!(*target, AssignTarget::Pattern(Pattern::Array { .. }))
        ));
    }

    #[test]
    fn test_for_of_and_for_in() {
        let program = parse("for (const x of xs) {}\nfor (let k in obj) {}").unwrap();
        assert!(matches!(program.body[0], Stmt::ForOf { .. }));
        assert!(matches!(program.body[1], Stmt::ForIn { .. }));
    }

    #[test]
    fn test_classic_for_with_sequence_update() {
        let program = parse("for (let i = 0, j = 10; i < j; i++, j--) {}").unwrap();
        let Stmt::For { update, .. } = &program.body[0] else {
            panic!("expected for");
        };
        assert!(matches!(update, Some(Expr::Sequence(items)) if items.len() == 2));
    }

    #[test]
    fn test_object_literal_forms() {
        let Expr::Object(props) = expr("({ a, 'b c': 1, [k]: 2, ...o, m() { return 1 }, 3: 'x' })") else {
            panic!("expected object literal");
        };
        assert_eq!(props.len(), 6);
        assert!(matches!(&props[5], Property::KeyValue(PropKey::Static(k), _) if &**k == "3"));
    }

    #[test]
    fn test_template_literal() {
        let Expr::Template { quasis, exprs } = expr("`a${1 + 2}b${x}`") else {
            panic!("expected template");
        };
        assert_eq!(quasis, vec!["a".to_string(), "b".to_string(), String::new()]);
        assert_eq!(exprs.len(), 2);
    }

    #[test]
    fn test_try_catch_finally() {
        let program = parse("try { f() } catch { g() } finally { h() }").unwrap();
        assert!(matches!(
            &program.body[0],
            Stmt::Try { param: None, handler: Some(_), finalizer: Some(_), .. }
        ));
        assert!(parse("try { f() }").is_err());
    }

    #[test]
    fn test_syntax_error_position() {
        let err = parse("let x = 1;\nlet y = ;").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 9);
        assert!(err.message.contains("';'"));
    }

    #[test]
    fn test_unexpected_end_of_input() {
        let err = parse("function f() {").unwrap_err();
        assert_eq!(err.message, "Unexpected end of input");
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse("1 = 2").unwrap_err();
        assert!(err.message.contains("Invalid left-hand side"));
    }

    #[test]
    fn test_const_requires_initializer() {
        assert!(parse("const x;").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let source = format!("{}1", "!".repeat(1000));
        let err = parse(&source).unwrap_err();
        assert_eq!(err.message, "Maximum nesting depth exceeded");
    }

    #[test]
    fn test_long_operator_chain_is_rejected() {
        let source = vec!["1"; 1000].join(" + ");
        assert!(parse(&source).is_err());
        let source = vec!["1"; 50].join(" + ");
        assert!(parse(&source).is_ok());
    }

    #[test]
    fn test_new_expression() {
        assert!(matches!(expr("new Error('boom')"), Expr::New { args, .. } if args.len() == 1));
    }
}
