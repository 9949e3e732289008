use std::sync::Arc;

use super::ScriptError;
use super::ast::{BinaryOp, Expr, FuncDef, Lit, Program, Stmt, TypeTag, UnaryOp};
use super::lexer::{Token, tokenize};

pub fn parse(source: &str) -> Result<Program, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let stmts = parser.parse_stmts(None)?;
    Ok(Program { stmts })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ScriptError> {
        match self.advance() {
            Some(found) if &found == expected => Ok(()),
            found => Err(ScriptError::Compile(format!(
                "expected {expected:?}, found {found:?}"
            ))),
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_separators(&mut self) {
        while self.eat(&Token::Separator) {}
    }

    /// Parses statements until `terminator` (or end of input when `None`).
    fn parse_stmts(&mut self, terminator: Option<&Token>) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            match (self.peek(), terminator) {
                (None, None) => break,
                (None, Some(t)) => {
                    return Err(ScriptError::Compile(format!(
                        "expected {t:?} before end of script"
                    )));
                }
                (Some(found), Some(t)) if found == t => break,
                _ => {}
            }
            stmts.push(self.parse_stmt()?);
            // Statements are separated by newlines/semicolons or end at the
            // block terminator.
            if let Some(next) = self.peek() {
                if Some(next) != terminator && next != &Token::Separator {
                    return Err(ScriptError::Compile(format!(
                        "expected end of statement, found {next:?}"
                    )));
                }
            }
        }
        Ok(stmts)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(&Token::LBrace)?;
        let stmts = self.parse_stmts(Some(&Token::RBrace))?;
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Some(Token::Def) => self.parse_def(),
            Some(Token::If) => self.parse_if(),
            Some(Token::While) => self.parse_while(),
            Some(Token::Ident(word)) => {
                // Typed declaration: `int x = ...`
                if let Some(ty) = TypeTag::from_keyword(word) {
                    if matches!(self.peek_at(1), Some(Token::Ident(_)))
                        && self.peek_at(2) == Some(&Token::Assign)
                    {
                        self.advance();
                        let name = self.expect_ident()?;
                        self.expect(&Token::Assign)?;
                        let init = self.parse_expr()?;
                        return Ok(Stmt::Declare { name, ty, init });
                    }
                }
                Ok(Stmt::Expr(self.parse_expr()?))
            }
            Some(_) => Ok(Stmt::Expr(self.parse_expr()?)),
            None => Err(ScriptError::Compile("unexpected end of script".to_string())),
        }
    }

    fn parse_def(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&Token::Def)?;
        let name = self.expect_ident()?;
        if self.eat(&Token::LParen) {
            let mut params = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    params.push(self.expect_ident()?);
                    if self.eat(&Token::RParen) {
                        break;
                    }
                    self.expect(&Token::Comma)?;
                }
            }
            let body = self.parse_block()?;
            Ok(Stmt::FuncDef(Arc::new(FuncDef {
                name: Some(name),
                params,
                body,
            })))
        } else {
            self.expect(&Token::Assign)?;
            let init = self.parse_expr()?;
            Ok(Stmt::Declare {
                name,
                ty: TypeTag::Any,
                init,
            })
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&Token::If)?;
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let then_body = self.parse_block()?;
        let else_body = if self.eat(&Token::Else) {
            if self.peek() == Some(&Token::If) {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&Token::While)?;
        self.expect(&Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body })
    }

    fn expect_ident(&mut self) -> Result<String, ScriptError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            found => Err(ScriptError::Compile(format!(
                "expected identifier, found {found:?}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        // Assignment needs two-token lookahead to distinguish `x = ...` from
        // a bare reference.
        if let (Some(Token::Ident(_)), Some(Token::Assign)) = (self.peek(), self.peek_at(1)) {
            let name = self.expect_ident()?;
            self.expect(&Token::Assign)?;
            let value = self.parse_expr()?;
            return Ok(Expr::Assign {
                name,
                value: Box::new(value),
            });
        }
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_equality()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        if self.eat(&Token::Bang) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.expect_ident()?;
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    expr = Expr::MethodCall {
                        recv: Box::new(expr),
                        name,
                        args,
                    };
                } else {
                    expr = Expr::Property {
                        recv: Box::new(expr),
                        name,
                    };
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    recv: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Parses comma-separated arguments up to and including the closing paren.
    fn parse_args(&mut self) -> Result<Vec<Expr>, ScriptError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Expr::Literal(Lit::Int(v))),
            Some(Token::Double(v)) => Ok(Expr::Literal(Lit::Double(v))),
            Some(Token::Str(v)) => Ok(Expr::Literal(Lit::Str(v))),
            Some(Token::True) => Ok(Expr::Literal(Lit::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Lit::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Lit::Null)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                if self.eat(&Token::DotDot) {
                    let end = self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    Ok(range(inner, end, true))
                } else if self.eat(&Token::DotDotLt) {
                    let end = self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    Ok(range(inner, end, false))
                } else {
                    self.expect(&Token::RParen)?;
                    Ok(inner)
                }
            }
            Some(Token::LBracket) => self.parse_bracket(),
            Some(Token::LBrace) => self.parse_closure(),
            found => Err(ScriptError::Compile(format!(
                "expected expression, found {found:?}"
            ))),
        }
    }

    /// After `[`: an empty list, a list literal, a range, or a map literal.
    fn parse_bracket(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::RBracket) {
            return Ok(Expr::List(Vec::new()));
        }
        if self.peek() == Some(&Token::Colon) {
            // `[:]` is the empty map.
            self.advance();
            self.expect(&Token::RBracket)?;
            return Ok(Expr::MapLit(Vec::new()));
        }
        let first = self.parse_expr()?;
        if self.eat(&Token::DotDot) {
            let end = self.parse_expr()?;
            self.expect(&Token::RBracket)?;
            return Ok(range(first, end, true));
        }
        if self.eat(&Token::DotDotLt) {
            let end = self.parse_expr()?;
            self.expect(&Token::RBracket)?;
            return Ok(range(first, end, false));
        }
        if self.eat(&Token::Colon) {
            let mut entries = vec![(map_key(first)?, self.parse_expr()?)];
            while self.eat(&Token::Comma) {
                let key = self.parse_expr()?;
                self.expect(&Token::Colon)?;
                entries.push((map_key(key)?, self.parse_expr()?));
            }
            self.expect(&Token::RBracket)?;
            return Ok(Expr::MapLit(entries));
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            // Trailing comma is tolerated, matching list syntax in the wild.
            if self.peek() == Some(&Token::RBracket) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(&Token::RBracket)?;
        Ok(Expr::List(items))
    }

    /// After `{`: a closure literal, with or without a parameter list.
    fn parse_closure(&mut self) -> Result<Expr, ScriptError> {
        let mut params = Vec::new();
        // Probe for `ident (, ident)* ->`.
        let start = self.pos;
        let mut matched_params = false;
        if let Some(Token::Ident(_)) = self.peek() {
            let mut probe = Vec::new();
            loop {
                match self.advance() {
                    Some(Token::Ident(name)) => probe.push(name),
                    _ => break,
                }
                match self.peek() {
                    Some(Token::Comma) => {
                        self.advance();
                    }
                    Some(Token::Arrow) => {
                        self.advance();
                        params = probe;
                        matched_params = true;
                        break;
                    }
                    _ => break,
                }
            }
        }
        if !matched_params {
            self.pos = start;
        }
        let body = self.parse_stmts(Some(&Token::RBrace))?;
        self.expect(&Token::RBrace)?;
        Ok(Expr::Closure(Arc::new(FuncDef {
            name: None,
            params,
            body,
        })))
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn range(start: Expr, end: Expr, inclusive: bool) -> Expr {
    Expr::Range {
        start: Box::new(start),
        end: Box::new(end),
        inclusive,
    }
}

fn map_key(expr: Expr) -> Result<String, ScriptError> {
    match expr {
        Expr::Ident(name) => Ok(name),
        Expr::Literal(Lit::Str(name)) => Ok(name),
        other => Err(ScriptError::Compile(format!(
            "map keys must be identifiers or strings, found {other:?}"
        ))),
    }
}
