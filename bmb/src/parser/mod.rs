//! Recursive-descent parser with precedence climbing
//!
//! The grammar follows the expression-body function form
//! `fn f(...) -> T = expr;` with `{ ... }` as a block expression. Every
//! block-producing site goes through the same statement-flavored block
//! production, so let-sequences always desugar to right-nested `Let`
//! chains. Recovery is not attempted beyond the enclosing item.

#[cfg(test)]
mod tests;

use crate::ast::*;
use crate::error::{CompileError, Result};
use crate::lexer::Token;

// Red zone / growth parameters for deeply nested expressions.
const STACK_RED_ZONE: usize = 64 * 1024;
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Parse tokens into AST
pub fn parse(_filename: &str, source: &str, tokens: Vec<(Token, Span)>) -> Result<Program> {
    let mut parser = Parser::new(tokens, source.len());
    parser.parse_program()
}

/// Expressions that close with a brace and may stand as statements
/// without a trailing semicolon.
fn is_block_formed(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::While { .. }
            | Expr::For { .. }
            | Expr::Loop { .. }
            | Expr::If { .. }
            | Expr::Match { .. }
            | Expr::Spawn { .. }
    )
}

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    /// Length of the source, for the EOF span
    source_len: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, Span)>, source_len: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            source_len,
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or(Span::new(self.source_len, self.source_len))
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|(_, s)| *s)
            .unwrap_or(Span::new(0, 0))
    }

    fn advance(&mut self) -> Option<(Token, Span)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<Span> {
        if self.check(&token) {
            let span = self.current_span();
            self.pos += 1;
            Ok(span)
        } else {
            Err(self.unexpected(&[token.to_string()]))
        }
    }

    /// Expect a closing `>`, splitting a `>>` into two halves so nested
    /// generic arguments like `Vec<Vec<i64>>` parse.
    fn expect_gt(&mut self) -> Result<Span> {
        match self.peek() {
            Some(Token::Gt) => self.expect(Token::Gt),
            Some(Token::GtGt) => {
                let span = self.current_span();
                self.tokens[self.pos] = (Token::Gt, Span::new(span.start + 1, span.end));
                Ok(Span::new(span.start, span.start + 1))
            }
            _ => Err(self.unexpected(&[">".to_string()])),
        }
    }

    fn expect_ident(&mut self) -> Result<Spanned<String>> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                let span = self.current_span();
                self.pos += 1;
                Ok(Spanned::new(name, span))
            }
            _ => Err(self.unexpected(&["identifier".to_string()])),
        }
    }

    fn unexpected(&self, expected: &[String]) -> CompileError {
        let found = self
            .peek()
            .map(|t| format!("`{t}`"))
            .unwrap_or_else(|| "end of input".to_string());
        CompileError::parser_expected(
            format!("unexpected {found}"),
            expected.to_vec(),
            self.current_span(),
        )
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    fn parse_program(&mut self) -> Result<Program> {
        let mut items = Vec::new();
        while self.peek().is_some() {
            items.push(self.parse_item()?);
        }
        Ok(Program { items })
    }

    fn parse_item(&mut self) -> Result<Item> {
        let attributes = self.parse_attributes()?;

        let visibility = if self.eat(&Token::Pub) {
            Visibility::Public
        } else {
            Visibility::Private
        };

        match self.peek() {
            Some(Token::Fn) => Ok(Item::FnDef(self.parse_fn(attributes, visibility)?)),
            Some(Token::Struct) => {
                self.reject_attributes(&attributes)?;
                Ok(Item::StructDef(self.parse_struct(visibility)?))
            }
            Some(Token::Enum) => {
                self.reject_attributes(&attributes)?;
                Ok(Item::EnumDef(self.parse_enum(visibility)?))
            }
            Some(Token::Trait) => {
                self.reject_attributes(&attributes)?;
                Ok(Item::TraitDef(self.parse_trait(visibility)?))
            }
            Some(Token::Impl) => {
                self.reject_attributes(&attributes)?;
                Ok(Item::ImplBlock(self.parse_impl()?))
            }
            Some(Token::Use) => {
                self.reject_attributes(&attributes)?;
                Ok(Item::Use(self.parse_use()?))
            }
            _ => Err(self.unexpected(&[
                "fn".into(),
                "struct".into(),
                "enum".into(),
                "trait".into(),
                "impl".into(),
                "use".into(),
            ])),
        }
    }

    fn reject_attributes(&self, attributes: &[Attribute]) -> Result<()> {
        if attributes.is_empty() {
            Ok(())
        } else {
            Err(CompileError::parser(
                "attributes are only allowed on functions",
                self.current_span(),
            ))
        }
    }

    /// `@pure`, `@inline`, `@trust`, `@trust("reason")`, `@decreases(expr)`
    fn parse_attributes(&mut self) -> Result<Vec<Attribute>> {
        let mut attrs = Vec::new();
        while self.eat(&Token::At) {
            let name = self.expect_ident()?;
            let attr = match name.node.as_str() {
                "pure" => Attribute::Pure,
                "inline" => Attribute::Inline,
                "trust" => {
                    let reason = if self.eat(&Token::LParen) {
                        let r = match self.advance() {
                            Some((Token::StringLit(s), _)) => s,
                            _ => {
                                return Err(CompileError::parser(
                                    "expected string reason in @trust(..)",
                                    self.prev_span(),
                                ));
                            }
                        };
                        self.expect(Token::RParen)?;
                        Some(r)
                    } else {
                        None
                    };
                    Attribute::Trust { reason }
                }
                "decreases" => {
                    self.expect(Token::LParen)?;
                    let expr = self.parse_expr()?;
                    self.expect(Token::RParen)?;
                    Attribute::Decreases(expr)
                }
                other => {
                    return Err(CompileError::parser(
                        format!("unknown attribute `@{other}`"),
                        name.span,
                    ));
                }
            };
            attrs.push(attr);
        }
        Ok(attrs)
    }

    fn parse_type_params(&mut self) -> Result<Vec<TypeParam>> {
        let mut params = Vec::new();
        if self.eat(&Token::Lt) {
            loop {
                let name = self.expect_ident()?;
                params.push(TypeParam { name });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect_gt()?;
        }
        Ok(params)
    }

    fn parse_fn(&mut self, attributes: Vec<Attribute>, visibility: Visibility) -> Result<FnDef> {
        let start = self.expect(Token::Fn)?;
        let name = self.expect_ident()?;
        let type_params = self.parse_type_params()?;

        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            let pname = self.expect_ident()?;
            self.expect(Token::Colon)?;
            let ty = self.parse_type()?;
            params.push(Param { name: pname, ty });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;

        let ret_ty = if self.eat(&Token::Arrow) {
            self.parse_type()?
        } else {
            Spanned::new(Type::Unit, self.prev_span())
        };

        // Contract clauses follow the return type, before `=`.
        let mut pre = Vec::new();
        let mut post = Vec::new();
        let mut contracts = Vec::new();
        loop {
            if self.eat(&Token::Pre) {
                pre.push(self.parse_expr()?);
            } else if self.eat(&Token::Post) {
                post.push(self.parse_expr()?);
            } else if self.eat(&Token::Where) {
                self.expect(Token::LBrace)?;
                while !self.check(&Token::RBrace) {
                    // `name: expr` or a bare condition
                    let named = matches!(self.peek(), Some(Token::Ident(_)))
                        && self.peek_at(1) == Some(&Token::Colon);
                    let name = if named {
                        let n = self.expect_ident()?;
                        self.expect(Token::Colon)?;
                        Some(n)
                    } else {
                        None
                    };
                    let condition = self.parse_expr()?;
                    contracts.push(NamedContract { name, condition });
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RBrace)?;
            } else {
                break;
            }
        }

        self.expect(Token::Eq)?;
        let body = self.parse_expr()?;
        let end = self.expect(Token::Semi)?;

        Ok(FnDef {
            name,
            type_params,
            params,
            ret_ty,
            pre,
            post,
            contracts,
            attributes,
            visibility,
            body,
            span: start.merge(end),
        })
    }

    fn parse_struct(&mut self, visibility: Visibility) -> Result<StructDef> {
        let start = self.expect(Token::Struct)?;
        let name = self.expect_ident()?;
        let type_params = self.parse_type_params()?;
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let fname = self.expect_ident()?;
            self.expect(Token::Colon)?;
            let ty = self.parse_type()?;
            fields.push(StructField { name: fname, ty });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let end = self.expect(Token::RBrace)?;
        Ok(StructDef {
            name,
            type_params,
            fields,
            visibility,
            span: start.merge(end),
        })
    }

    fn parse_enum(&mut self, visibility: Visibility) -> Result<EnumDef> {
        let start = self.expect(Token::Enum)?;
        let name = self.expect_ident()?;
        let type_params = self.parse_type_params()?;
        self.expect(Token::LBrace)?;
        let mut variants = Vec::new();
        while !self.check(&Token::RBrace) {
            let vname = self.expect_ident()?;
            let mut fields = Vec::new();
            if self.eat(&Token::LParen) {
                while !self.check(&Token::RParen) {
                    fields.push(self.parse_type()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
            }
            variants.push(EnumVariantDef {
                name: vname,
                fields,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let end = self.expect(Token::RBrace)?;
        Ok(EnumDef {
            name,
            type_params,
            variants,
            visibility,
            span: start.merge(end),
        })
    }

    fn parse_trait(&mut self, visibility: Visibility) -> Result<TraitDef> {
        let start = self.expect(Token::Trait)?;
        let name = self.expect_ident()?;
        self.expect(Token::LBrace)?;
        let mut methods = Vec::new();
        while !self.check(&Token::RBrace) {
            self.expect(Token::Fn)?;
            let mname = self.expect_ident()?;
            self.expect(Token::LParen)?;
            let mut params = Vec::new();
            while !self.check(&Token::RParen) {
                let pname = self.expect_ident()?;
                self.expect(Token::Colon)?;
                let ty = self.parse_type()?;
                params.push(Param { name: pname, ty });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen)?;
            let ret_ty = if self.eat(&Token::Arrow) {
                self.parse_type()?
            } else {
                Spanned::new(Type::Unit, self.prev_span())
            };
            self.expect(Token::Semi)?;
            methods.push(TraitMethod {
                name: mname,
                params,
                ret_ty,
            });
        }
        let end = self.expect(Token::RBrace)?;
        Ok(TraitDef {
            name,
            methods,
            visibility,
            span: start.merge(end),
        })
    }

    fn parse_impl(&mut self) -> Result<ImplBlock> {
        let start = self.expect(Token::Impl)?;
        let trait_name = self.expect_ident()?;
        // `for` is lexed as the loop keyword
        self.expect(Token::For)?;
        // Atom only: the `{` that follows opens the method block, not a
        // refinement.
        let target = self.parse_type_atom()?;
        self.expect(Token::LBrace)?;
        let mut methods = Vec::new();
        while !self.check(&Token::RBrace) {
            let attributes = self.parse_attributes()?;
            methods.push(self.parse_fn(attributes, Visibility::Private)?);
        }
        let end = self.expect(Token::RBrace)?;
        Ok(ImplBlock {
            trait_name,
            target,
            methods,
            span: start.merge(end),
        })
    }

    fn parse_use(&mut self) -> Result<UseDecl> {
        let start = self.expect(Token::Use)?;
        let mut path = self.expect_ident()?;
        while self.eat(&Token::ColonColon) {
            let seg = self.expect_ident()?;
            path = Spanned::new(
                format!("{}::{}", path.node, seg.node),
                path.span.merge(seg.span),
            );
        }
        let end = self.expect(Token::Semi)?;
        Ok(UseDecl {
            path,
            span: start.merge(end),
        })
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn parse_type(&mut self) -> Result<Spanned<Type>> {
        let mut ty = self.parse_type_atom()?;

        // Postfix: refinement braces, then nullability marker.
        loop {
            if self.check(&Token::LBrace) {
                self.expect(Token::LBrace)?;
                let mut constraints = Vec::new();
                while !self.check(&Token::RBrace) {
                    constraints.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                let end = self.expect(Token::RBrace)?;
                let span = ty.span.merge(end);
                ty = Spanned::new(
                    Type::Refined {
                        base: Box::new(ty.node),
                        constraints,
                    },
                    span,
                );
            } else if self.check(&Token::Question) {
                let end = self.expect(Token::Question)?;
                let span = ty.span.merge(end);
                ty = Spanned::new(Type::Nullable(Box::new(ty.node)), span);
            } else {
                break;
            }
        }

        Ok(ty)
    }

    fn parse_type_atom(&mut self) -> Result<Spanned<Type>> {
        let span = self.current_span();
        let ty = match self.peek().cloned() {
            Some(Token::TyI8) => {
                self.pos += 1;
                Type::I8
            }
            Some(Token::TyI16) => {
                self.pos += 1;
                Type::I16
            }
            Some(Token::TyI32) => {
                self.pos += 1;
                Type::I32
            }
            Some(Token::TyI64) => {
                self.pos += 1;
                Type::I64
            }
            Some(Token::TyF32) => {
                self.pos += 1;
                Type::F32
            }
            Some(Token::TyF64) => {
                self.pos += 1;
                Type::F64
            }
            Some(Token::TyBool) => {
                self.pos += 1;
                Type::Bool
            }
            Some(Token::TyString) => {
                self.pos += 1;
                Type::String
            }
            Some(Token::Bang) => {
                self.pos += 1;
                Type::Never
            }
            Some(Token::Dyn) => {
                self.pos += 1;
                let name = self.expect_ident()?;
                Type::TraitObject(name.node)
            }
            Some(Token::Star) => {
                self.pos += 1;
                let inner = self.parse_type_atom()?;
                Type::Ptr(Box::new(inner.node))
            }
            Some(Token::Ampersand) => {
                self.pos += 1;
                if self.eat(&Token::Mut) {
                    let inner = self.parse_type_atom()?;
                    Type::RefMut(Box::new(inner.node))
                } else if self.check(&Token::LBracket) {
                    // &[T] slice or &[T; N] reference-to-array
                    self.expect(Token::LBracket)?;
                    let elem = self.parse_type()?;
                    if self.eat(&Token::Semi) {
                        let n = self.parse_array_len()?;
                        self.expect(Token::RBracket)?;
                        Type::Ref(Box::new(Type::Array(Box::new(elem.node), n)))
                    } else {
                        self.expect(Token::RBracket)?;
                        Type::Slice(Box::new(elem.node))
                    }
                } else {
                    let inner = self.parse_type_atom()?;
                    Type::Ref(Box::new(inner.node))
                }
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                let elem = self.parse_type()?;
                self.expect(Token::Semi)?;
                let n = self.parse_array_len()?;
                self.expect(Token::RBracket)?;
                Type::Array(Box::new(elem.node), n)
            }
            Some(Token::LParen) => {
                self.pos += 1;
                if self.eat(&Token::RParen) {
                    Type::Unit
                } else {
                    let first = self.parse_type()?;
                    if self.eat(&Token::Comma) {
                        let mut elems = vec![first.node];
                        while !self.check(&Token::RParen) {
                            elems.push(self.parse_type()?.node);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                        self.expect(Token::RParen)?;
                        Type::Tuple(elems)
                    } else {
                        self.expect(Token::RParen)?;
                        first.node
                    }
                }
            }
            Some(Token::Fn) => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                let mut params = Vec::new();
                while !self.check(&Token::RParen) {
                    params.push(self.parse_type()?.node);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                self.expect(Token::Arrow)?;
                let ret = self.parse_type()?;
                Type::Fn {
                    params,
                    ret: Box::new(ret.node),
                }
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if self.check(&Token::Lt) {
                    self.expect(Token::Lt)?;
                    let mut args = Vec::new();
                    loop {
                        args.push(self.parse_type()?.node);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect_gt()?;
                    Type::Generic { name, args }
                } else {
                    Type::Named(name)
                }
            }
            _ => return Err(self.unexpected(&["type".to_string()])),
        };
        Ok(Spanned::new(ty, span.merge(self.prev_span())))
    }

    fn parse_array_len(&mut self) -> Result<usize> {
        match self.advance() {
            Some((Token::IntLit(n), span)) => {
                if n < 0 {
                    Err(CompileError::parser("array length must be non-negative", span))
                } else {
                    Ok(n as usize)
                }
            }
            _ => Err(CompileError::parser(
                "expected array length",
                self.prev_span(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Spanned<Expr>> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.parse_range_expr())
    }

    fn parse_range_expr(&mut self) -> Result<Spanned<Expr>> {
        let lhs = self.parse_binary(0)?;
        let kind = match self.peek() {
            Some(Token::DotDot) => RangeKind::Exclusive,
            Some(Token::DotDotEq) => RangeKind::Inclusive,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_binary(0)?;
        let span = lhs.span.merge(rhs.span);
        Ok(Spanned::new(
            Expr::Range {
                start: Box::new(lhs),
                end: Box::new(rhs),
                kind,
            },
            span,
        ))
    }

    /// Binding power table for binary operators.
    fn peek_binop(&self) -> Option<(BinOp, u8)> {
        let op = match self.peek()? {
            Token::Or | Token::PipePipe => (BinOp::Or, 1),
            Token::And | Token::AmpAmp => (BinOp::And, 2),
            Token::EqEq => (BinOp::Eq, 3),
            Token::NotEq => (BinOp::Ne, 3),
            Token::Lt => (BinOp::Lt, 3),
            Token::Gt => (BinOp::Gt, 3),
            Token::LtEq => (BinOp::Le, 3),
            Token::GtEq => (BinOp::Ge, 3),
            Token::Bor => (BinOp::Bor, 4),
            Token::Bxor => (BinOp::Bxor, 4),
            Token::Band => (BinOp::Band, 5),
            Token::LtLt => (BinOp::Shl, 6),
            Token::GtGt => (BinOp::Shr, 6),
            Token::Plus => (BinOp::Add, 7),
            Token::Minus => (BinOp::Sub, 7),
            Token::Star => (BinOp::Mul, 8),
            Token::Slash => (BinOp::Div, 8),
            Token::Percent => (BinOp::Mod, 8),
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Spanned<Expr>> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, prec)) = self.peek_binop() {
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_binary(prec + 1)?;
            let span = lhs.span.merge(rhs.span);
            lhs = Spanned::new(
                Expr::Binary {
                    left: Box::new(lhs),
                    op,
                    right: Box::new(rhs),
                },
                span,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Spanned<Expr>> {
        let span = self.current_span();
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                let expr = self.parse_unary()?;
                let span = span.merge(expr.span);
                Ok(Spanned::new(
                    Expr::Unary {
                        op: UnOp::Neg,
                        expr: Box::new(expr),
                    },
                    span,
                ))
            }
            Some(Token::Not) | Some(Token::Bang) => {
                self.pos += 1;
                let expr = self.parse_unary()?;
                let span = span.merge(expr.span);
                Ok(Spanned::new(
                    Expr::Unary {
                        op: UnOp::Not,
                        expr: Box::new(expr),
                    },
                    span,
                ))
            }
            Some(Token::Bnot) => {
                self.pos += 1;
                let expr = self.parse_unary()?;
                let span = span.merge(expr.span);
                Ok(Spanned::new(
                    Expr::Unary {
                        op: UnOp::Bnot,
                        expr: Box::new(expr),
                    },
                    span,
                ))
            }
            Some(Token::Ampersand) => {
                self.pos += 1;
                let mutable = self.eat(&Token::Mut);
                let expr = self.parse_unary()?;
                let span = span.merge(expr.span);
                let node = if mutable {
                    Expr::RefMut(Box::new(expr))
                } else {
                    Expr::Ref(Box::new(expr))
                };
                Ok(Spanned::new(node, span))
            }
            Some(Token::Star) => {
                self.pos += 1;
                let expr = self.parse_unary()?;
                let span = span.merge(expr.span);
                Ok(Spanned::new(Expr::Deref(Box::new(expr)), span))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Spanned<Expr>> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.peek().cloned() {
                        Some(Token::IntLit(n)) => {
                            let end = self.current_span();
                            self.pos += 1;
                            let span = expr.span.merge(end);
                            expr = Spanned::new(
                                Expr::TupleField {
                                    expr: Box::new(expr),
                                    index: n as usize,
                                },
                                span,
                            );
                        }
                        Some(Token::Ident(name)) => {
                            let name_span = self.current_span();
                            self.pos += 1;
                            if self.check(&Token::LParen) {
                                let args = self.parse_call_args()?;
                                let span = expr.span.merge(self.prev_span());
                                expr = Spanned::new(
                                    Expr::MethodCall {
                                        receiver: Box::new(expr),
                                        method: name,
                                        args,
                                    },
                                    span,
                                );
                            } else {
                                let span = expr.span.merge(name_span);
                                expr = Spanned::new(
                                    Expr::FieldAccess {
                                        expr: Box::new(expr),
                                        field: Spanned::new(name, name_span),
                                    },
                                    span,
                                );
                            }
                        }
                        _ => {
                            return Err(self.unexpected(&[
                                "field name".into(),
                                "method name".into(),
                                "tuple index".into(),
                            ]));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_expr()?;
                    let end = self.expect(Token::RBracket)?;
                    let span = expr.span.merge(end);
                    expr = Spanned::new(
                        Expr::Index {
                            expr: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                Some(Token::As) => {
                    self.pos += 1;
                    let ty = self.parse_type()?;
                    let span = expr.span.merge(ty.span);
                    expr = Spanned::new(
                        Expr::Cast {
                            expr: Box::new(expr),
                            ty,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Spanned<Expr>>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        while !self.check(&Token::RParen) {
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Spanned<Expr>> {
        let span = self.current_span();
        match self.peek().cloned() {
            Some(Token::IntLit(n)) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::IntLit(n), span))
            }
            Some(Token::FloatLit(x)) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::FloatLit(x), span))
            }
            Some(Token::True) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::BoolLit(true), span))
            }
            Some(Token::False) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::BoolLit(false), span))
            }
            Some(Token::StringLit(s)) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::StringLit(s), span))
            }
            Some(Token::CharLit(c)) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::CharLit(c), span))
            }
            Some(Token::Null) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::Null, span))
            }
            Some(Token::Ret) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::Ret, span))
            }
            Some(Token::It) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::It, span))
            }
            Some(Token::Old) => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                let inner = self.parse_expr()?;
                let end = self.expect(Token::RParen)?;
                Ok(Spanned::new(
                    Expr::Old(Box::new(inner)),
                    span.merge(end),
                ))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if self.check(&Token::ColonColon) {
                    // Enum variant: Name::Variant or Name::Variant(args)
                    self.pos += 1;
                    let variant = self.expect_ident()?;
                    let args = if self.check(&Token::LParen) {
                        self.parse_call_args()?
                    } else {
                        Vec::new()
                    };
                    let span = span.merge(self.prev_span());
                    Ok(Spanned::new(
                        Expr::EnumVariant {
                            enum_name: name,
                            variant: variant.node,
                            args,
                        },
                        span,
                    ))
                } else if self.check(&Token::LParen) {
                    let args = self.parse_call_args()?;
                    let span = span.merge(self.prev_span());
                    Ok(Spanned::new(Expr::Call { func: name, args }, span))
                } else {
                    Ok(Spanned::new(Expr::Var(name), span))
                }
            }
            Some(Token::New) => {
                self.pos += 1;
                let name = self.expect_ident()?;
                self.expect(Token::LBrace)?;
                let mut fields = Vec::new();
                while !self.check(&Token::RBrace) {
                    let fname = self.expect_ident()?;
                    self.expect(Token::Colon)?;
                    let value = self.parse_expr()?;
                    fields.push((fname, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                let end = self.expect(Token::RBrace)?;
                Ok(Spanned::new(
                    Expr::StructInit {
                        name: name.node,
                        fields,
                    },
                    span.merge(end),
                ))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                if self.eat(&Token::RParen) {
                    return Ok(Spanned::new(Expr::Unit, span.merge(self.prev_span())));
                }
                let first = self.parse_expr()?;
                if self.eat(&Token::Comma) {
                    let mut elems = vec![first];
                    while !self.check(&Token::RParen) {
                        elems.push(self.parse_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    let end = self.expect(Token::RParen)?;
                    Ok(Spanned::new(Expr::Tuple(elems), span.merge(end)))
                } else {
                    self.expect(Token::RParen)?;
                    Ok(first)
                }
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                let mut elems = Vec::new();
                while !self.check(&Token::RBracket) {
                    elems.push(self.parse_expr()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                let end = self.expect(Token::RBracket)?;
                Ok(Spanned::new(Expr::ArrayLit(elems), span.merge(end)))
            }
            Some(Token::LBrace) => self.parse_block(),
            Some(Token::If) => self.parse_if(),
            Some(Token::Match) => self.parse_match(),
            Some(Token::While) => self.parse_while(),
            Some(Token::For) => self.parse_for(),
            Some(Token::Loop) => {
                self.pos += 1;
                let body = self.parse_block()?;
                let span = span.merge(body.span);
                Ok(Spanned::new(
                    Expr::Loop {
                        body: Box::new(body),
                    },
                    span,
                ))
            }
            Some(Token::Break) => {
                self.pos += 1;
                let value = if self.check(&Token::Semi) || self.check(&Token::RBrace) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                let span = span.merge(self.prev_span());
                Ok(Spanned::new(Expr::Break { value }, span))
            }
            Some(Token::Continue) => {
                self.pos += 1;
                Ok(Spanned::new(Expr::Continue, span))
            }
            Some(Token::Return) => {
                self.pos += 1;
                let value = if self.check(&Token::Semi) || self.check(&Token::RBrace) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                let span = span.merge(self.prev_span());
                Ok(Spanned::new(Expr::Return { value }, span))
            }
            Some(Token::Spawn) => {
                self.pos += 1;
                let body = self.parse_block()?;
                let span = span.merge(body.span);
                Ok(Spanned::new(
                    Expr::Spawn {
                        body: Box::new(body),
                    },
                    span,
                ))
            }
            Some(Token::Pipe) | Some(Token::PipePipe) => self.parse_closure(),
            _ => Err(self.unexpected(&["expression".to_string()])),
        }
    }

    fn parse_closure(&mut self) -> Result<Spanned<Expr>> {
        let span = self.current_span();
        let mut params = Vec::new();
        if self.eat(&Token::PipePipe) {
            // zero-parameter closure
        } else {
            self.expect(Token::Pipe)?;
            while !self.check(&Token::Pipe) {
                let name = self.expect_ident()?;
                let ty = if self.eat(&Token::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                params.push(ClosureParam { name, ty });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::Pipe)?;
        }
        let ret_ty = if self.eat(&Token::Arrow) {
            Some(Box::new(self.parse_type()?))
        } else {
            None
        };
        let body = self.parse_expr()?;
        let span = span.merge(body.span);
        Ok(Spanned::new(
            Expr::Closure {
                params,
                ret_ty,
                body: Box::new(body),
            },
            span,
        ))
    }

    fn parse_if(&mut self) -> Result<Spanned<Expr>> {
        let start = self.expect(Token::If)?;
        let cond = self.parse_expr()?;

        // Both `if c then a else b` and `if c { a } else { b }` parse.
        let (then_branch, else_branch) = if self.eat(&Token::Then) {
            let then_branch = self.parse_expr()?;
            self.expect(Token::Else)?;
            let else_branch = self.parse_expr()?;
            (then_branch, else_branch)
        } else {
            let then_branch = self.parse_block()?;
            self.expect(Token::Else)?;
            let else_branch = if self.check(&Token::If) {
                self.parse_if()?
            } else {
                self.parse_block()?
            };
            (then_branch, else_branch)
        };

        let span = start.merge(else_branch.span);
        Ok(Spanned::new(
            Expr::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            span,
        ))
    }

    fn parse_while(&mut self) -> Result<Spanned<Expr>> {
        let start = self.expect(Token::While)?;
        let cond = self.parse_expr()?;
        let invariant = if self.eat(&Token::Invariant) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        let body = self.parse_block()?;
        let span = start.merge(body.span);
        Ok(Spanned::new(
            Expr::While {
                cond: Box::new(cond),
                invariant,
                body: Box::new(body),
            },
            span,
        ))
    }

    fn parse_for(&mut self) -> Result<Spanned<Expr>> {
        let start = self.expect(Token::For)?;
        let var = self.expect_ident()?;
        self.expect(Token::In)?;
        let iter = self.parse_expr()?;
        let body = self.parse_block()?;
        let span = start.merge(body.span);
        Ok(Spanned::new(
            Expr::For {
                var: var.node,
                iter: Box::new(iter),
                body: Box::new(body),
            },
            span,
        ))
    }

    fn parse_match(&mut self) -> Result<Spanned<Expr>> {
        let start = self.expect(Token::Match)?;
        let scrutinee = self.parse_expr()?;
        self.expect(Token::LBrace)?;
        let mut arms = Vec::new();
        while !self.check(&Token::RBrace) {
            let pattern = self.parse_pattern()?;
            let guard = if self.eat(&Token::If) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(Token::FatArrow)?;
            let body = self.parse_expr()?;
            arms.push(MatchArm {
                pattern,
                guard,
                body,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let end = self.expect(Token::RBrace)?;
        Ok(Spanned::new(
            Expr::Match {
                expr: Box::new(scrutinee),
                arms,
            },
            start.merge(end),
        ))
    }

    fn parse_pattern(&mut self) -> Result<Spanned<Pattern>> {
        let span = self.current_span();
        match self.peek().cloned() {
            Some(Token::Underscore) => {
                self.pos += 1;
                Ok(Spanned::new(Pattern::Wildcard, span))
            }
            Some(Token::IntLit(n)) => {
                self.pos += 1;
                Ok(Spanned::new(Pattern::Literal(LiteralPattern::Int(n)), span))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                match self.advance() {
                    Some((Token::IntLit(n), end)) => Ok(Spanned::new(
                        Pattern::Literal(LiteralPattern::Int(-n)),
                        span.merge(end),
                    )),
                    Some((Token::FloatLit(x), end)) => Ok(Spanned::new(
                        Pattern::Literal(LiteralPattern::Float(-x)),
                        span.merge(end),
                    )),
                    _ => Err(CompileError::parser(
                        "expected numeric literal after `-` in pattern",
                        span,
                    )),
                }
            }
            Some(Token::FloatLit(x)) => {
                self.pos += 1;
                Ok(Spanned::new(
                    Pattern::Literal(LiteralPattern::Float(x)),
                    span,
                ))
            }
            Some(Token::True) => {
                self.pos += 1;
                Ok(Spanned::new(
                    Pattern::Literal(LiteralPattern::Bool(true)),
                    span,
                ))
            }
            Some(Token::False) => {
                self.pos += 1;
                Ok(Spanned::new(
                    Pattern::Literal(LiteralPattern::Bool(false)),
                    span,
                ))
            }
            Some(Token::StringLit(s)) => {
                self.pos += 1;
                Ok(Spanned::new(
                    Pattern::Literal(LiteralPattern::String(s)),
                    span,
                ))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let mut pats = Vec::new();
                while !self.check(&Token::RParen) {
                    pats.push(self.parse_pattern()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                let end = self.expect(Token::RParen)?;
                Ok(Spanned::new(Pattern::Tuple(pats), span.merge(end)))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if self.check(&Token::ColonColon) {
                    self.pos += 1;
                    let variant = self.expect_ident()?;
                    let mut bindings = Vec::new();
                    if self.eat(&Token::LParen) {
                        while !self.check(&Token::RParen) {
                            bindings.push(self.parse_pattern()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                        self.expect(Token::RParen)?;
                    }
                    let span = span.merge(self.prev_span());
                    Ok(Spanned::new(
                        Pattern::EnumVariant {
                            enum_name: name,
                            variant: variant.node,
                            bindings,
                        },
                        span,
                    ))
                } else {
                    Ok(Spanned::new(Pattern::Var(name), span))
                }
            }
            _ => Err(self.unexpected(&["pattern".to_string()])),
        }
    }

    // ------------------------------------------------------------------
    // Statement-flavored block
    // ------------------------------------------------------------------

    /// `{ stmt* tail }` where statements are let/var bindings, `set`
    /// stores, assignments and expression statements. Desugars to a
    /// right-nested `Let` chain via [`nest_block`].
    fn parse_block(&mut self) -> Result<Spanned<Expr>> {
        let start = self.expect(Token::LBrace)?;
        let mut stmts: Vec<BlockStmt> = Vec::new();
        let mut tail: Option<Spanned<Expr>> = None;

        while !self.check(&Token::RBrace) {
            if self.check(&Token::Let) || self.check(&Token::Var) {
                let stmt_start = self.current_span();
                let mutable = match self.advance() {
                    Some((Token::Var, _)) => true,
                    Some((Token::Let, _)) => self.eat(&Token::Mut),
                    _ => unreachable!("checked above"),
                };
                let name = self.expect_ident()?;
                let ty = if self.eat(&Token::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                self.expect(Token::Eq)?;
                let value = self.parse_expr()?;
                let stmt_end = self.expect(Token::Semi)?;
                stmts.push(BlockStmt {
                    name: name.node,
                    mutable,
                    ty,
                    value,
                    span: stmt_start.merge(stmt_end),
                });
            } else if self.check(&Token::Set) {
                let store = self.parse_set_stmt()?;
                self.expect(Token::Semi)?;
                stmts.push(BlockStmt::discard(store));
            } else if matches!(self.peek(), Some(Token::Ident(_)))
                && self.peek_at(1) == Some(&Token::Eq)
            {
                // Assignment to a `var` binding
                let name = self.expect_ident()?;
                self.expect(Token::Eq)?;
                let value = self.parse_expr()?;
                let end = self.expect(Token::Semi)?;
                let span = name.span.merge(end);
                stmts.push(BlockStmt::discard(Spanned::new(
                    Expr::Assign {
                        name: name.node,
                        value: Box::new(value),
                    },
                    span,
                )));
            } else {
                let expr = self.parse_expr()?;
                if self.eat(&Token::Semi) {
                    stmts.push(BlockStmt::discard(expr));
                } else if self.check(&Token::RBrace) {
                    tail = Some(expr);
                    break;
                } else if is_block_formed(&expr.node) {
                    // Block-formed statements (while/for/loop/if/match)
                    // need no trailing semicolon.
                    stmts.push(BlockStmt::discard(expr));
                } else {
                    return Err(self.unexpected(&[";".into(), "}".into()]));
                }
            }
        }

        let end = self.expect(Token::RBrace)?;
        let tail = tail.unwrap_or_else(|| Spanned::new(Expr::Unit, end));
        let mut nested = nest_block(stmts, tail);
        nested.span = start.merge(end);
        Ok(nested)
    }

    /// `set lvalue = expr` where lvalue is a field access or an index.
    fn parse_set_stmt(&mut self) -> Result<Spanned<Expr>> {
        let start = self.expect(Token::Set)?;
        let target = self.parse_postfix()?;
        self.expect(Token::Eq)?;
        let value = self.parse_expr()?;
        let span = start.merge(value.span);
        match target.node {
            Expr::FieldAccess { expr, field } => Ok(Spanned::new(
                Expr::FieldAssign {
                    object: expr,
                    field,
                    value: Box::new(value),
                },
                span,
            )),
            Expr::Index { expr, index } => Ok(Spanned::new(
                Expr::IndexAssign {
                    array: expr,
                    index,
                    value: Box::new(value),
                },
                span,
            )),
            _ => Err(CompileError::parser(
                "`set` target must be a field access or an index expression",
                target.span,
            )),
        }
    }
}
