// Tokenizer and Pratt parser producing the raw AST
// Dotted paths, predicates, grouping and ordering come out as raw nodes for the optimizer

use std::sync::Arc;

use regex::Regex;

use crate::ast::{AstNode, BinaryOp, RegexLiteral, SortTerm};
use crate::error::{Error, Result};
use crate::signature::Signature;

/// Operator tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Dot,
    Range,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    Comma,
    At,
    Hash,
    Semicolon,
    Colon,
    Question,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Pipe,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Caret,
    Ampersand,
    Bang,
    Tilde,
    ColonEqual,
    ChainPipe,
    Default,
    Coalesce,
}

impl Op {
    fn single(ch: char) -> Option<Op> {
        Some(match ch {
            '.' => Op::Dot,
            '[' => Op::LeftBracket,
            ']' => Op::RightBracket,
            '{' => Op::LeftBrace,
            '}' => Op::RightBrace,
            '(' => Op::LeftParen,
            ')' => Op::RightParen,
            ',' => Op::Comma,
            '@' => Op::At,
            '#' => Op::Hash,
            ';' => Op::Semicolon,
            ':' => Op::Colon,
            '?' => Op::Question,
            '+' => Op::Plus,
            '-' => Op::Minus,
            '*' => Op::Star,
            '/' => Op::Slash,
            '%' => Op::Percent,
            '|' => Op::Pipe,
            '=' => Op::Equal,
            '<' => Op::LessThan,
            '>' => Op::GreaterThan,
            '^' => Op::Caret,
            '&' => Op::Ampersand,
            '!' => Op::Bang,
            '~' => Op::Tilde,
            _ => return None,
        })
    }

    fn double(first: char, second: char) -> Option<Op> {
        Some(match (first, second) {
            ('.', '.') => Op::Range,
            (':', '=') => Op::ColonEqual,
            ('!', '=') => Op::NotEqual,
            ('>', '=') => Op::GreaterThanOrEqual,
            ('<', '=') => Op::LessThanOrEqual,
            ('*', '*') => Op::StarStar,
            ('~', '>') => Op::ChainPipe,
            ('?', ':') => Op::Default,
            ('?', '?') => Op::Coalesce,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Dot => ".",
            Op::Range => "..",
            Op::LeftBracket => "[",
            Op::RightBracket => "]",
            Op::LeftBrace => "{",
            Op::RightBrace => "}",
            Op::LeftParen => "(",
            Op::RightParen => ")",
            Op::Comma => ",",
            Op::At => "@",
            Op::Hash => "#",
            Op::Semicolon => ";",
            Op::Colon => ":",
            Op::Question => "?",
            Op::Plus => "+",
            Op::Minus => "-",
            Op::Star => "*",
            Op::StarStar => "**",
            Op::Slash => "/",
            Op::Percent => "%",
            Op::Pipe => "|",
            Op::Equal => "=",
            Op::NotEqual => "!=",
            Op::LessThan => "<",
            Op::LessThanOrEqual => "<=",
            Op::GreaterThan => ">",
            Op::GreaterThanOrEqual => ">=",
            Op::Caret => "^",
            Op::Ampersand => "&",
            Op::Bang => "!",
            Op::Tilde => "~",
            Op::ColonEqual => ":=",
            Op::ChainPipe => "~>",
            Op::Default => "?:",
            Op::Coalesce => "??",
        }
    }

    /// Left binding power; zero for terminators and prefix-only symbols
    fn binding_power(self) -> u8 {
        match self {
            Op::Dot => 75,
            Op::LeftBracket | Op::LeftParen | Op::At | Op::Hash => 80,
            Op::LeftBrace => 70,
            Op::Star | Op::Slash | Op::Percent => 60,
            Op::Plus | Op::Minus | Op::Ampersand => 50,
            Op::Equal
            | Op::NotEqual
            | Op::LessThan
            | Op::LessThanOrEqual
            | Op::GreaterThan
            | Op::GreaterThanOrEqual
            | Op::Caret
            | Op::ChainPipe
            | Op::Default
            | Op::Coalesce => 40,
            Op::Question | Op::Range => 20,
            Op::ColonEqual => 10,
            _ => 0,
        }
    }

    fn binary(self) -> Option<BinaryOp> {
        Some(match self {
            Op::Plus => BinaryOp::Add,
            Op::Minus => BinaryOp::Subtract,
            Op::Star => BinaryOp::Multiply,
            Op::Slash => BinaryOp::Divide,
            Op::Percent => BinaryOp::Modulo,
            Op::Equal => BinaryOp::Equal,
            Op::NotEqual => BinaryOp::NotEqual,
            Op::LessThan => BinaryOp::LessThan,
            Op::LessThanOrEqual => BinaryOp::LessThanOrEqual,
            Op::GreaterThan => BinaryOp::GreaterThan,
            Op::GreaterThanOrEqual => BinaryOp::GreaterThanOrEqual,
            Op::Ampersand => BinaryOp::Concatenate,
            Op::Range => BinaryOp::Range,
            Op::Default => BinaryOp::Default,
            Op::Coalesce => BinaryOp::Coalesce,
            _ => return None,
        })
    }
}

/// `true`, `false` and `null`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    True,
    False,
    Null,
}

/// Token types for the lexer
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Variable(String),
    Operator(Op),
    String(String),
    Number(f64),
    Value(Literal),
    Regex(RegexLiteral),
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Character offset just past the token
    pub position: usize,
}

impl Token {
    /// Source-like text for error messages
    pub fn text(&self) -> String {
        match &self.kind {
            TokenKind::Name(s) | TokenKind::String(s) => s.clone(),
            TokenKind::Variable(s) => format!("${}", s),
            TokenKind::Operator(op) => op.as_str().to_string(),
            TokenKind::Number(n) => crate::value::format_number(*n),
            TokenKind::Value(Literal::True) => "true".to_string(),
            TokenKind::Value(Literal::False) => "false".to_string(),
            TokenKind::Value(Literal::Null) => "null".to_string(),
            TokenKind::Regex(re) => format!("/{}/{}", re.pattern, re.flags),
            TokenKind::End => "(end)".to_string(),
        }
    }

    /// Does the token close an operand, so that a following `/` is division
    fn ends_operand(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Name(_)
                | TokenKind::Variable(_)
                | TokenKind::String(_)
                | TokenKind::Number(_)
                | TokenKind::Value(_)
                | TokenKind::Regex(_)
                | TokenKind::Operator(Op::RightParen)
                | TokenKind::Operator(Op::RightBracket)
                | TokenKind::Operator(Op::RightBrace)
        )
    }
}

/// Lexer for tokenizing expressions
pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        if self.position < self.input.len() {
            self.position += 1;
        }
    }

    /// Skip everything that is left, used when abandoning a token stream
    fn finish(&mut self) {
        self.position = self.input.len();
    }

    fn token(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            position: self.position,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_comment(&mut self) -> Result<()> {
        let start = self.position;
        self.advance(); // skip '/'
        self.advance(); // skip '*'
        loop {
            match self.current() {
                None => {
                    return Err(Error::syntax("S0106", "Comment has no closing tag", start, None))
                }
                Some('*') if self.peek(1) == Some('/') => {
                    self.advance();
                    self.advance();
                    return Ok(());
                }
                Some(_) => self.advance(),
            }
        }
    }

    fn read_string(&mut self, quote_char: char) -> Result<String> {
        let start = self.position;
        let mut result = String::new();
        self.advance(); // skip opening quote

        loop {
            match self.current() {
                None => {
                    return Err(Error::syntax(
                        "S0101",
                        "String literal must be terminated by a matching quote",
                        start,
                        None,
                    ))
                }
                Some(ch) if ch == quote_char => {
                    self.advance();
                    return Ok(result);
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('"') => result.push('"'),
                        Some('\'') => result.push('\''),
                        Some('\\') => result.push('\\'),
                        Some('/') => result.push('/'),
                        Some('b') => result.push('\u{0008}'),
                        Some('f') => result.push('\u{000C}'),
                        Some('n') => result.push('\n'),
                        Some('r') => result.push('\r'),
                        Some('t') => result.push('\t'),
                        Some('u') => {
                            self.advance();
                            result.push(self.read_unicode_escape()?);
                            continue;
                        }
                        Some(ch) => {
                            return Err(Error::syntax(
                                "S0103",
                                format!("Unsupported escape sequence: \\{}", ch),
                                self.position,
                                Some(ch.to_string()),
                            ))
                        }
                        None => {
                            return Err(Error::syntax(
                                "S0101",
                                "String literal must be terminated by a matching quote",
                                start,
                                None,
                            ))
                        }
                    }
                    self.advance();
                }
                Some(ch) => {
                    result.push(ch);
                    self.advance();
                }
            }
        }
    }

    fn read_hex4(&mut self) -> Result<u32> {
        let mut code = 0u32;
        for _ in 0..4 {
            match self.current().and_then(|h| h.to_digit(16)) {
                Some(digit) => {
                    code = code * 16 + digit;
                    self.advance();
                }
                None => {
                    return Err(Error::syntax(
                        "S0104",
                        "The escape sequence \\u must be followed by 4 hex digits",
                        self.position,
                        None,
                    ))
                }
            }
        }
        Ok(code)
    }

    /// `\uXXXX`, combining a surrogate pair written as two escapes
    fn read_unicode_escape(&mut self) -> Result<char> {
        let high = self.read_hex4()?;
        if (0xD800..0xDC00).contains(&high)
            && self.current() == Some('\\')
            && self.peek(1) == Some('u')
        {
            self.advance();
            self.advance();
            let low = self.read_hex4()?;
            let combined = 0x10000 + ((high - 0xD800) << 10) + (low.wrapping_sub(0xDC00) & 0x3FF);
            if let Some(ch) = char::from_u32(combined) {
                return Ok(ch);
            }
        } else if let Some(ch) = char::from_u32(high) {
            return Ok(ch);
        }
        Err(Error::syntax(
            "S0104",
            "The escape sequence \\u must be followed by 4 hex digits",
            self.position,
            None,
        ))
    }

    fn read_number(&mut self) -> Result<f64> {
        let start = self.position;
        let digits = |lexer: &mut Lexer| {
            while lexer.current().is_some_and(|c| c.is_ascii_digit()) {
                lexer.advance();
            }
        };

        // Integer part: `0` or a non-zero digit run
        if self.current() == Some('0') {
            self.advance();
        } else {
            digits(self);
        }

        // Fractional part only when a digit follows the point, so `1..5` stays a range
        if self.current() == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            digits(self);
        }

        // Exponent part
        if matches!(self.current(), Some('e') | Some('E')) {
            let sign = usize::from(matches!(self.peek(1), Some('+') | Some('-')));
            if self.peek(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
                if sign == 1 {
                    self.advance();
                }
                digits(self);
            }
        }

        let text: String = self.input[start..self.position].iter().collect();
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(n),
            _ => Err(Error::syntax(
                "S0102",
                format!("Number out of range: {}", text),
                self.position,
                Some(text),
            )),
        }
    }

    fn read_name(&mut self) -> String {
        let start = self.position;
        while let Some(ch) = self.current() {
            if ch.is_whitespace() || Op::single(ch).is_some() {
                break;
            }
            self.advance();
        }
        self.input[start..self.position].iter().collect()
    }

    fn read_backtick_name(&mut self) -> Result<String> {
        let start = self.position;
        self.advance(); // skip opening backtick
        let name_start = self.position;

        while let Some(ch) = self.current() {
            if ch == '`' {
                let name: String = self.input[name_start..self.position].iter().collect();
                self.advance();
                return Ok(name);
            }
            self.advance();
        }

        Err(Error::syntax(
            "S0105",
            "Quoted property name must be terminated with a backquote (`)",
            start,
            None,
        ))
    }

    fn backslashes_before(&self, position: usize) -> usize {
        self.input[..position]
            .iter()
            .rev()
            .take_while(|c| **c == '\\')
            .count()
    }

    /// Scan `pattern/flags` after the opening slash
    fn read_regex(&mut self) -> Result<RegexLiteral> {
        let start = self.position;
        let mut depth = 0i32;

        while let Some(ch) = self.current() {
            if ch == '/' && depth == 0 && self.backslashes_before(self.position) % 2 == 0 {
                let pattern: String = self.input[start..self.position].iter().collect();
                if pattern.is_empty() {
                    return Err(Error::syntax(
                        "S0301",
                        "Empty regular expressions are not allowed",
                        self.position,
                        None,
                    ));
                }
                self.advance();
                let flags_start = self.position;
                while matches!(self.current(), Some('i') | Some('m')) {
                    self.advance();
                }
                let flags: String = self.input[flags_start..self.position].iter().collect();

                let mut source = String::new();
                if flags.contains('i') {
                    source.push_str("(?i)");
                }
                if flags.contains('m') {
                    source.push_str("(?m)");
                }
                source.push_str(&pattern);
                let compiled = Regex::new(&source).map_err(|e| {
                    Error::syntax(
                        "S0303",
                        format!("Invalid regular expression: {}", e),
                        self.position,
                        Some(pattern.clone()),
                    )
                })?;
                return Ok(RegexLiteral {
                    pattern,
                    flags,
                    compiled: Arc::new(compiled),
                });
            }
            let escaped = self.position > 0 && self.input[self.position - 1] == '\\';
            if !escaped {
                match ch {
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' | '}' => depth -= 1,
                    _ => {}
                }
            }
            self.advance();
        }

        Err(Error::syntax(
            "S0302",
            "No terminating / in regular expression",
            self.position,
            None,
        ))
    }

    /// Raw `<...>` signature text; the opening `<` has already been consumed
    pub fn scan_signature(&mut self) -> Result<String> {
        let mut depth = 1;
        let mut text = String::from("<");
        while let Some(ch) = self.current() {
            self.advance();
            text.push(ch);
            match ch {
                '<' => depth += 1,
                '>' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(text);
                    }
                }
                _ => {}
            }
        }
        Err(Error::syntax(
            "S0203",
            "Expected \">\" before end of expression",
            self.position,
            None,
        ))
    }

    /// Next token. With `prefer_regex` a `/` opens a regex literal instead of dividing.
    pub fn next_token(&mut self, prefer_regex: bool) -> Result<Token> {
        loop {
            self.skip_whitespace();
            if self.current() == Some('/') && self.peek(1) == Some('*') {
                self.skip_comment()?;
                continue;
            }
            break;
        }

        let Some(ch) = self.current() else {
            return Ok(self.token(TokenKind::End));
        };

        if ch == '/' && prefer_regex {
            self.advance();
            let regex = self.read_regex()?;
            return Ok(self.token(TokenKind::Regex(regex)));
        }

        if let Some(op) = self.peek(1).and_then(|next| Op::double(ch, next)) {
            self.advance();
            self.advance();
            return Ok(self.token(TokenKind::Operator(op)));
        }

        if let Some(op) = Op::single(ch) {
            self.advance();
            return Ok(self.token(TokenKind::Operator(op)));
        }

        let kind = match ch {
            '"' | '\'' => TokenKind::String(self.read_string(ch)?),
            '`' => TokenKind::Name(self.read_backtick_name()?),
            c if c.is_ascii_digit() => TokenKind::Number(self.read_number()?),
            '$' => {
                self.advance();
                TokenKind::Variable(self.read_name())
            }
            _ => {
                let name = self.read_name();
                match name.as_str() {
                    "true" => TokenKind::Value(Literal::True),
                    "false" => TokenKind::Value(Literal::False),
                    "null" => TokenKind::Value(Literal::Null),
                    _ => TokenKind::Name(name),
                }
            }
        };
        Ok(self.token(kind))
    }
}

/// Pratt parser over the token stream
pub struct Parser {
    lexer: Lexer,
    current: Token,
    recover: bool,
    errors: Vec<Error>,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token(true)?;
        Ok(Parser {
            lexer,
            current,
            recover: false,
            errors: Vec::new(),
        })
    }

    /// Collect errors into `AstNode::Error` nodes instead of failing
    pub fn recovering(mut self) -> Self {
        self.recover = true;
        self
    }

    /// Consume the current token and return it
    fn advance(&mut self) -> Result<Token> {
        let prefer_regex = !self.current.ends_operand();
        let next = self.lexer.next_token(prefer_regex)?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn at(&self, op: Op) -> bool {
        self.current.kind == TokenKind::Operator(op)
    }

    fn expect(&mut self, op: Op) -> Result<()> {
        if self.at(op) {
            self.advance()?;
            return Ok(());
        }
        let position = self.current.position;
        if self.current.kind == TokenKind::End {
            return Err(Error::syntax(
                "S0203",
                format!("Expected \"{}\" before end of expression", op.as_str()),
                position,
                None,
            ));
        }
        let found = self.current.text();
        Err(Error::syntax(
            "S0202",
            format!("Expected \"{}\", got \"{}\"", op.as_str(), found),
            position,
            Some(found),
        ))
    }

    fn left_binding_power(&self) -> u8 {
        match &self.current.kind {
            TokenKind::Operator(op) => op.binding_power(),
            TokenKind::Name(name) => match name.as_str() {
                "and" => 30,
                "or" => 25,
                "in" => 40,
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Record an error, drain the rest of the input and stand in an error node
    fn recover_from(&mut self, error: Error) -> AstNode {
        let mut remaining = Vec::new();
        while self.current.kind != TokenKind::End {
            remaining.push(self.current.text());
            match self.lexer.next_token(false) {
                Ok(token) => self.current = token,
                Err(_) => {
                    self.lexer.finish();
                    self.current = self.lexer.token(TokenKind::End);
                }
            }
        }
        let node = AstNode::Error {
            code: error.code,
            message: error.message.clone(),
            position: error.position.unwrap_or(0),
            token: error.token.clone(),
            remaining,
        };
        self.errors.push(error);
        node
    }

    fn guarded(&mut self, result: Result<AstNode>) -> Result<AstNode> {
        match result {
            Err(error) if self.recover => Ok(self.recover_from(error)),
            other => other,
        }
    }

    pub fn expression(&mut self, rbp: u8) -> Result<AstNode> {
        let token = match self.advance() {
            Ok(token) => token,
            Err(error) => return self.guarded(Err(error)),
        };
        let nud = self.nud(token);
        let mut left = self.guarded(nud)?;

        while rbp < self.left_binding_power() {
            let token = match self.advance() {
                Ok(token) => token,
                Err(error) => return self.guarded(Err(error)),
            };
            let led = self.led(token, left);
            left = self.guarded(led)?;
        }
        Ok(left)
    }

    /// Null denotation: the token starts an expression
    fn nud(&mut self, token: Token) -> Result<AstNode> {
        let position = token.position;
        match token.kind {
            TokenKind::String(s) => Ok(AstNode::String(s)),
            TokenKind::Number(n) => Ok(AstNode::Number(n)),
            TokenKind::Value(Literal::True) => Ok(AstNode::Boolean(true)),
            TokenKind::Value(Literal::False) => Ok(AstNode::Boolean(false)),
            TokenKind::Value(Literal::Null) => Ok(AstNode::Null),
            TokenKind::Regex(regex) => Ok(AstNode::Regex(regex)),
            TokenKind::Name(name) => Ok(AstNode::Name(name)),
            TokenKind::Variable(name) => Ok(AstNode::Variable(name)),
            TokenKind::End => Err(Error::syntax(
                "S0207",
                "Unexpected end of expression",
                position,
                None,
            )),
            TokenKind::Operator(op) => match op {
                Op::Star => Ok(AstNode::Wildcard),
                Op::StarStar => Ok(AstNode::Descendant),
                Op::Minus => {
                    let operand = self.expression(70)?;
                    Ok(AstNode::Negate {
                        operand: Box::new(operand),
                        position,
                    })
                }
                Op::LeftParen => self.block(),
                Op::LeftBracket => self.array(),
                Op::LeftBrace => Ok(AstNode::Object {
                    pairs: self.object_pairs()?,
                    position,
                }),
                Op::Pipe => self.transform(position),
                other => Err(Error::syntax(
                    "S0211",
                    format!("The symbol {} cannot be used as a unary operator", other.as_str()),
                    position,
                    Some(other.as_str().to_string()),
                )),
            },
        }
    }

    /// Left denotation: the token continues `left`
    fn led(&mut self, token: Token, left: AstNode) -> Result<AstNode> {
        let position = token.position;
        let op = match &token.kind {
            TokenKind::Operator(op) => *op,
            TokenKind::Name(name) => {
                let (op, bp) = match name.as_str() {
                    "and" => (BinaryOp::And, 30),
                    "or" => (BinaryOp::Or, 25),
                    _ => (BinaryOp::In, 40),
                };
                return self.binary(op, bp, left, position);
            }
            _ => {
                return Err(Error::syntax(
                    "S0201",
                    format!("Syntax error: \"{}\"", token.text()),
                    position,
                    Some(token.text()),
                ))
            }
        };

        if let Some(binary) = op.binary() {
            return self.binary(binary, op.binding_power(), left, position);
        }

        match op {
            Op::Dot => {
                let rhs = self.expression(op.binding_power())?;
                Ok(AstNode::Dot {
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                    position,
                })
            }
            Op::ColonEqual => {
                let rhs = self.expression(op.binding_power() - 1)?;
                Ok(AstNode::Assign {
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                    position,
                })
            }
            Op::ChainPipe => {
                let rhs = self.expression(op.binding_power())?;
                Ok(AstNode::Pipe {
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                    position,
                })
            }
            Op::Question => {
                let then = self.expression(0)?;
                let otherwise = if self.at(Op::Colon) {
                    self.advance()?;
                    Some(Box::new(self.expression(0)?))
                } else {
                    None
                };
                Ok(AstNode::Condition {
                    test: Box::new(left),
                    then: Box::new(then),
                    otherwise,
                })
            }
            Op::LeftParen => self.call(left, position),
            Op::LeftBracket => {
                if self.at(Op::RightBracket) {
                    self.advance()?;
                    return Ok(AstNode::Filter {
                        lhs: Box::new(left),
                        condition: None,
                        position,
                    });
                }
                let condition = self.expression(0)?;
                self.expect(Op::RightBracket)?;
                Ok(AstNode::Filter {
                    lhs: Box::new(left),
                    condition: Some(Box::new(condition)),
                    position,
                })
            }
            Op::LeftBrace => Ok(AstNode::GroupBy {
                lhs: Box::new(left),
                pairs: self.object_pairs()?,
                position,
            }),
            Op::Caret => self.order_by(left, position),
            Op::At | Op::Hash => Err(Error::syntax(
                "S0204",
                format!("Unknown operator: \"{}\"", op.as_str()),
                position,
                Some(op.as_str().to_string()),
            )),
            other => Err(Error::syntax(
                "S0201",
                format!("Syntax error: \"{}\"", other.as_str()),
                position,
                Some(other.as_str().to_string()),
            )),
        }
    }

    fn binary(&mut self, op: BinaryOp, bp: u8, left: AstNode, position: usize) -> Result<AstNode> {
        let rhs = self.expression(bp)?;
        Ok(AstNode::Binary {
            op,
            lhs: Box::new(left),
            rhs: Box::new(rhs),
            position,
        })
    }

    fn block(&mut self) -> Result<AstNode> {
        let mut expressions = Vec::new();
        while !self.at(Op::RightParen) {
            expressions.push(self.expression(0)?);
            if !self.at(Op::Semicolon) {
                break;
            }
            self.advance()?;
        }
        self.expect(Op::RightParen)?;
        Ok(AstNode::Block(expressions))
    }

    fn array(&mut self) -> Result<AstNode> {
        let mut items = Vec::new();
        if !self.at(Op::RightBracket) {
            loop {
                items.push(self.expression(0)?);
                if !self.at(Op::Comma) {
                    break;
                }
                self.advance()?;
            }
        }
        self.expect(Op::RightBracket)?;
        Ok(AstNode::Array(items))
    }

    fn object_pairs(&mut self) -> Result<Vec<(AstNode, AstNode)>> {
        let mut pairs = Vec::new();
        if !self.at(Op::RightBrace) {
            loop {
                let key = self.expression(0)?;
                self.expect(Op::Colon)?;
                let value = self.expression(0)?;
                pairs.push((key, value));
                if !self.at(Op::Comma) {
                    break;
                }
                self.advance()?;
            }
        }
        self.expect(Op::RightBrace)?;
        Ok(pairs)
    }

    fn transform(&mut self, position: usize) -> Result<AstNode> {
        let pattern = self.expression(0)?;
        self.expect(Op::Pipe)?;
        let update = self.expression(0)?;
        let delete = if self.at(Op::Comma) {
            self.advance()?;
            Some(Arc::new(self.expression(0)?))
        } else {
            None
        };
        self.expect(Op::Pipe)?;
        Ok(AstNode::Transform {
            pattern: Arc::new(pattern),
            update: Arc::new(update),
            delete,
            position,
        })
    }

    fn order_by(&mut self, left: AstNode, position: usize) -> Result<AstNode> {
        self.expect(Op::LeftParen)?;
        let mut terms = Vec::new();
        loop {
            let mut descending = false;
            if self.at(Op::LessThan) {
                self.advance()?;
            } else if self.at(Op::GreaterThan) {
                descending = true;
                self.advance()?;
            }
            let expression = self.expression(0)?;
            terms.push(SortTerm {
                expression,
                descending,
            });
            if !self.at(Op::Comma) {
                break;
            }
            self.advance()?;
        }
        self.expect(Op::RightParen)?;
        Ok(AstNode::OrderBy {
            lhs: Box::new(left),
            terms,
            position,
        })
    }

    /// `(args)` after an expression: invocation, partial application or lambda definition
    fn call(&mut self, procedure: AstNode, position: usize) -> Result<AstNode> {
        let mut args = Vec::new();
        let mut partial = false;
        if !self.at(Op::RightParen) {
            loop {
                if self.at(Op::Question) {
                    self.advance()?;
                    partial = true;
                    args.push(AstNode::Placeholder);
                } else {
                    args.push(self.expression(0)?);
                }
                if !self.at(Op::Comma) {
                    break;
                }
                self.advance()?;
            }
        }
        self.expect(Op::RightParen)?;

        if matches!(&procedure, AstNode::Name(name) if name == "function" || name == "λ") {
            return self.lambda(args, position);
        }

        let procedure = Box::new(procedure);
        if partial {
            Ok(AstNode::Partial {
                procedure,
                args,
                position,
            })
        } else {
            Ok(AstNode::Function {
                procedure,
                args,
                position,
            })
        }
    }

    fn lambda(&mut self, args: Vec<AstNode>, position: usize) -> Result<AstNode> {
        let mut params = Vec::with_capacity(args.len());
        for (index, arg) in args.into_iter().enumerate() {
            match arg {
                AstNode::Variable(name) => params.push(name),
                other => {
                    return Err(Error::syntax(
                        "S0208",
                        format!(
                            "Parameter {} of function definition must be a variable name (start with $)",
                            index + 1
                        ),
                        position,
                        Some(other.kind().to_string()),
                    ))
                }
            }
        }

        let signature = if self.at(Op::LessThan) {
            let start = self.current.position;
            let text = self.lexer.scan_signature()?;
            self.current = self.lexer.next_token(false)?;
            let signature = Signature::parse(&text).map_err(|e| {
                let err = Error::from(e);
                let offset = err.position.unwrap_or(0);
                err.at(start + offset)
            })?;
            Some(Arc::new(signature))
        } else {
            None
        };

        self.expect(Op::LeftBrace)?;
        let body = self.expression(0)?;
        self.expect(Op::RightBrace)?;
        Ok(AstNode::Lambda {
            params,
            body: Arc::new(body),
            signature,
            thunk: false,
        })
    }

    pub fn parse(&mut self) -> Result<AstNode> {
        let ast = self.expression(0)?;
        if self.current.kind != TokenKind::End {
            let found = self.current.text();
            let error = Error::syntax(
                "S0201",
                format!("Syntax error: \"{}\"", found),
                self.current.position,
                Some(found),
            );
            if self.recover {
                let error_node = self.recover_from(error);
                return Ok(AstNode::Block(vec![ast, error_node]));
            }
            return Err(error);
        }
        Ok(ast)
    }
}

/// Parse an expression string into the raw AST
pub fn parse(expression: &str) -> Result<AstNode> {
    let mut parser = Parser::new(expression)?;
    parser.parse()
}

/// Parse without stopping at the first error.
///
/// Every syntax error is returned alongside a best-effort tree in which the
/// failing construct is replaced by an `AstNode::Error` holding the tokens
/// that were not consumed.
pub fn parse_with_recovery(expression: &str) -> (AstNode, Vec<Error>) {
    let mut parser = match Parser::new(expression) {
        Ok(parser) => parser.recovering(),
        Err(error) => {
            let node = AstNode::Error {
                code: error.code,
                message: error.message.clone(),
                position: error.position.unwrap_or(0),
                token: error.token.clone(),
                remaining: vec![expression.to_string()],
            };
            return (node, vec![error]);
        }
    };
    let ast = match parser.parse() {
        Ok(ast) => ast,
        Err(error) => parser.recover_from(error),
    };
    if !parser.errors.is_empty() {
        log::debug!("recovering parse collected {} error(s)", parser.errors.len());
    }
    (ast, parser.errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        let mut prefer_regex = true;
        loop {
            let token = lexer.next_token(prefer_regex).unwrap();
            if token.kind == TokenKind::End {
                return out;
            }
            prefer_regex = !token.ends_operand();
            out.push(token.kind);
        }
    }

    fn name(s: &str) -> Box<AstNode> {
        Box::new(AstNode::Name(s.to_string()))
    }

    // Lexer tests
    #[test]
    fn test_lexer_numbers() {
        assert_eq!(
            tokens("42 3.14 2.5e10 1E-5"),
            vec![
                TokenKind::Number(42.0),
                TokenKind::Number(3.14),
                TokenKind::Number(2.5e10),
                TokenKind::Number(1e-5),
            ]
        );
    }

    #[test]
    fn test_lexer_range_is_not_a_fraction() {
        assert_eq!(
            tokens("1..5"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Operator(Op::Range),
                TokenKind::Number(5.0),
            ]
        );
    }

    #[test]
    fn test_lexer_number_out_of_range() {
        let err = Lexer::new("1e999").next_token(true).unwrap_err();
        assert_eq!(err.code, "S0102");
    }

    #[test]
    fn test_lexer_strings() {
        assert_eq!(
            tokens(r#""hello" 'world' "a\"b\n" "é""#),
            vec![
                TokenKind::String("hello".into()),
                TokenKind::String("world".into()),
                TokenKind::String("a\"b\n".into()),
                TokenKind::String("é".into()),
            ]
        );
    }

    #[test]
    fn test_lexer_string_errors() {
        assert_eq!(Lexer::new("\"abc").next_token(true).unwrap_err().code, "S0101");
        assert_eq!(Lexer::new(r#""\q""#).next_token(true).unwrap_err().code, "S0103");
        assert_eq!(Lexer::new(r#""\u12""#).next_token(true).unwrap_err().code, "S0104");
    }

    #[test]
    fn test_lexer_names_and_variables() {
        assert_eq!(
            tokens("foo `bar baz` $x $ $$ true null and"),
            vec![
                TokenKind::Name("foo".into()),
                TokenKind::Name("bar baz".into()),
                TokenKind::Variable("x".into()),
                TokenKind::Variable("".into()),
                TokenKind::Variable("$".into()),
                TokenKind::Value(Literal::True),
                TokenKind::Value(Literal::Null),
                TokenKind::Name("and".into()),
            ]
        );
        assert_eq!(Lexer::new("`abc").next_token(true).unwrap_err().code, "S0105");
    }

    #[test]
    fn test_lexer_operators() {
        assert_eq!(
            tokens("a := b ~> c ?: d ?? e != f ** g"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Operator(Op::ColonEqual),
                TokenKind::Name("b".into()),
                TokenKind::Operator(Op::ChainPipe),
                TokenKind::Name("c".into()),
                TokenKind::Operator(Op::Default),
                TokenKind::Name("d".into()),
                TokenKind::Operator(Op::Coalesce),
                TokenKind::Name("e".into()),
                TokenKind::Operator(Op::NotEqual),
                TokenKind::Name("f".into()),
                TokenKind::Operator(Op::StarStar),
                TokenKind::Name("g".into()),
            ]
        );
    }

    #[test]
    fn test_lexer_comments() {
        assert_eq!(
            tokens("a /* comment */ + b"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Operator(Op::Plus),
                TokenKind::Name("b".into()),
            ]
        );
        assert_eq!(Lexer::new("/* open").next_token(true).unwrap_err().code, "S0106");
    }

    #[test]
    fn test_lexer_regex_versus_division() {
        let kinds = tokens("a / 2");
        assert_eq!(kinds[1], TokenKind::Operator(Op::Slash));

        let kinds = tokens("$match(s, /ab+c/i)");
        match &kinds[4] {
            TokenKind::Regex(re) => {
                assert_eq!(re.pattern, "ab+c");
                assert_eq!(re.flags, "i");
                assert!(re.compiled.is_match("xABBC"));
            }
            other => panic!("expected regex, got {:?}", other),
        }
    }

    #[test]
    fn test_lexer_regex_errors() {
        assert_eq!(Lexer::new("//").next_token(true).unwrap_err().code, "S0301");
        assert_eq!(Lexer::new("/abc").next_token(true).unwrap_err().code, "S0302");
    }

    // Parser tests
    #[test]
    fn test_parse_precedence() {
        let ast = parse("1 + 2 * 3").unwrap();
        match ast {
            AstNode::Binary { op: BinaryOp::Add, rhs, .. } => {
                assert!(matches!(*rhs, AstNode::Binary { op: BinaryOp::Multiply, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_logical_keywords() {
        let ast = parse("a and b or c").unwrap();
        match ast {
            AstNode::Binary { op: BinaryOp::Or, lhs, .. } => {
                assert!(matches!(*lhs, AstNode::Binary { op: BinaryOp::And, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_dotted_path_is_raw() {
        let ast = parse("a.b").unwrap();
        assert_eq!(
            ast,
            AstNode::Dot {
                lhs: name("a"),
                rhs: name("b"),
                position: 2,
            }
        );
    }

    #[test]
    fn test_parse_filter_binds_tighter_than_dot() {
        let ast = parse("a.b[0]").unwrap();
        match ast {
            AstNode::Dot { rhs, .. } => {
                assert!(matches!(*rhs, AstNode::Filter { condition: Some(_), .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse("a[]").unwrap(),
            AstNode::Filter { condition: None, .. }
        ));
    }

    #[test]
    fn test_parse_lambda_with_signature() {
        let ast = parse("function($x, $y)<nn:n>{ $x + $y }").unwrap();
        match ast {
            AstNode::Lambda { params, signature, thunk, .. } => {
                assert_eq!(params, vec!["x".to_string(), "y".to_string()]);
                assert_eq!(signature.unwrap().definition(), "<nn:n>");
                assert!(!thunk);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_lambda_parameter_must_be_variable() {
        let err = parse("function($x, y){ $x }").unwrap_err();
        assert_eq!(err.code, "S0208");
    }

    #[test]
    fn test_parse_partial_application() {
        let ast = parse("$substring(?, 0, 2)").unwrap();
        match ast {
            AstNode::Partial { args, .. } => {
                assert_eq!(args.len(), 3);
                assert_eq!(args[0], AstNode::Placeholder);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_order_by() {
        let ast = parse("a^(>b, c)").unwrap();
        match ast {
            AstNode::OrderBy { terms, .. } => {
                assert_eq!(terms.len(), 2);
                assert!(terms[0].descending);
                assert!(!terms[1].descending);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_object_prefix_and_infix() {
        assert!(matches!(parse("{\"a\": 1}").unwrap(), AstNode::Object { .. }));
        assert!(matches!(parse("a{k: v}").unwrap(), AstNode::GroupBy { .. }));
    }

    #[test]
    fn test_parse_transform() {
        let ast = parse("| a | {\"x\": 1}, [\"y\"] |").unwrap();
        match ast {
            AstNode::Transform { delete, .. } => assert!(delete.is_some()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_block_and_condition() {
        let ast = parse("($x := 1; $x > 0 ? \"pos\" : \"neg\")").unwrap();
        match ast {
            AstNode::Block(exprs) => {
                assert_eq!(exprs.len(), 2);
                assert!(matches!(exprs[0], AstNode::Assign { .. }));
                assert!(matches!(exprs[1], AstNode::Condition { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("(1 + 2").unwrap_err().code, "S0203");
        assert_eq!(parse("[1, 2)").unwrap_err().code, "S0202");
        assert_eq!(parse("1 +").unwrap_err().code, "S0207");
        assert_eq!(parse("a b").unwrap_err().code, "S0201");
        assert_eq!(parse("!a").unwrap_err().code, "S0211");
        assert_eq!(parse("a@$x").unwrap_err().code, "S0204");
        assert_eq!(parse("function($x)<n<n>:n>{$x}").unwrap_err().code, "S0401");
    }

    #[test]
    fn test_parse_with_recovery_collects_errors() {
        let (ast, errors) = parse_with_recovery("a + ) b");
        assert!(!errors.is_empty());
        assert_eq!(errors[0].code, "S0211");
        match ast {
            AstNode::Binary { rhs, .. } => match *rhs {
                AstNode::Error { remaining, .. } => assert_eq!(remaining, vec!["b".to_string()]),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        let (_, errors) = parse_with_recovery("a.b");
        assert!(errors.is_empty());
    }
}
