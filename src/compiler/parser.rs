//! Recursive-descent parser (spec §4.7 Parser).
//!
//! Grounded on `original_source`'s `compiler/parser.go`: same grammar and
//! operator-precedence table, re-expressed against our [`Lexer`]/[`Token`]
//! types and building [`super::ast`] nodes instead of Go's AST structs.

use crate::error::{ErrorKind, LuaError, LuaResult};

use super::ast::*;
use super::lexer::Lexer;
use super::token::{Token, TokenKind};

pub fn parse(source: &str, chunk_name: &str) -> LuaResult<Block> {
    let mut p = Parser::new(source.as_bytes(), chunk_name)?;
    let block = p.block()?;
    p.expect_kind(&TokenKind::Eof)?;
    Ok(block)
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    tok: Token,
    chunk_name: String,
}

/// (left, right) binding power; right < left means right-associative.
fn binop_priority(op: BinOp) -> (u8, u8) {
    use BinOp::*;
    match op {
        Or => (1, 1),
        And => (2, 2),
        Lt | Gt | Le | Ge | Ne | Eq => (3, 3),
        BOr => (4, 4),
        BXor => (5, 5),
        BAnd => (6, 6),
        Shl | Shr => (7, 7),
        Concat => (9, 8),
        Add | Sub => (10, 10),
        Mul | Mod | Div | IDiv => (11, 11),
        Pow => (14, 13),
    }
}

const UNARY_PRIORITY: u8 = 12;

fn binop_of(kind: &TokenKind) -> Option<BinOp> {
    Some(match kind {
        TokenKind::Or => BinOp::Or,
        TokenKind::And => BinOp::And,
        TokenKind::Lt => BinOp::Lt,
        TokenKind::Ge => BinOp::Ge,
        TokenKind::Gt => BinOp::Gt,
        TokenKind::Le => BinOp::Le,
        TokenKind::Ne => BinOp::Ne,
        TokenKind::Eq => BinOp::Eq,
        TokenKind::Symbol(b'|') => BinOp::BOr,
        TokenKind::Symbol(b'~') => BinOp::BXor,
        TokenKind::Symbol(b'&') => BinOp::BAnd,
        TokenKind::Shl => BinOp::Shl,
        TokenKind::Shr => BinOp::Shr,
        TokenKind::Concat => BinOp::Concat,
        TokenKind::Symbol(b'+') => BinOp::Add,
        TokenKind::Symbol(b'-') => BinOp::Sub,
        TokenKind::Symbol(b'*') => BinOp::Mul,
        TokenKind::Symbol(b'%') => BinOp::Mod,
        TokenKind::Symbol(b'/') => BinOp::Div,
        TokenKind::IDiv => BinOp::IDiv,
        TokenKind::Symbol(b'^') => BinOp::Pow,
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    fn new(src: &'a [u8], chunk_name: &str) -> LuaResult<Self> {
        let mut lexer = Lexer::new(src, chunk_name);
        let tok = lexer.next()?;
        Ok(Parser { lexer, tok, chunk_name: chunk_name.to_string() })
    }

    fn err(&self, msg: impl Into<String>) -> LuaError {
        LuaError::new(
            ErrorKind::SyntaxError,
            format!("{}:{}: {}", self.chunk_name, self.tok.line, msg.into()),
        )
    }

    fn line(&self) -> u32 {
        self.tok.line
    }

    fn bump(&mut self) -> LuaResult<Token> {
        let next = self.lexer.next()?;
        Ok(std::mem::replace(&mut self.tok, next))
    }

    fn is(&self, kind: &TokenKind) -> bool {
        &self.tok.kind == kind
    }

    fn accept(&mut self, kind: &TokenKind) -> LuaResult<bool> {
        if self.is(kind) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_kind(&mut self, kind: &TokenKind) -> LuaResult<()> {
        if self.is(kind) {
            self.bump()?;
            Ok(())
        } else {
            Err(self.err(format!("unexpected token, expected {:?}", kind)))
        }
    }

    fn expect_symbol(&mut self, c: u8) -> LuaResult<()> {
        self.expect_kind(&TokenKind::Symbol(c))
    }

    fn expect_name(&mut self) -> LuaResult<String> {
        match self.tok.kind.clone() {
            TokenKind::Name(n) => {
                self.bump()?;
                Ok(n)
            }
            _ => Err(self.err("<name> expected")),
        }
    }

    fn block_follow(&self) -> bool {
        matches!(
            self.tok.kind,
            TokenKind::Eof
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
        )
    }

    fn block(&mut self) -> LuaResult<Block> {
        let mut stats = Vec::new();
        let mut ret = None;
        while !self.block_follow() {
            if self.is(&TokenKind::Return) {
                ret = Some(self.return_stat()?);
                break;
            }
            let stat = self.statement()?;
            if !matches!(stat, Stat::Empty) {
                stats.push(stat);
            }
        }
        Ok(Block { stats, ret })
    }

    fn return_stat(&mut self) -> LuaResult<(Vec<Expr>, u32)> {
        let line = self.line();
        self.bump()?; // 'return'
        let exprs = if self.block_follow() || self.is(&TokenKind::Symbol(b';')) {
            Vec::new()
        } else {
            self.exp_list()?
        };
        self.accept(&TokenKind::Symbol(b';'))?;
        Ok((exprs, line))
    }

    fn statement(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        match self.tok.kind.clone() {
            TokenKind::Symbol(b';') => {
                self.bump()?;
                Ok(Stat::Empty)
            }
            TokenKind::If => self.if_stat(),
            TokenKind::While => self.while_stat(),
            TokenKind::Do => {
                self.bump()?;
                let b = self.block()?;
                self.expect_kind(&TokenKind::End)?;
                Ok(Stat::Do(b))
            }
            TokenKind::For => self.for_stat(),
            TokenKind::Repeat => self.repeat_stat(),
            TokenKind::Function => self.func_stat(),
            TokenKind::Local => self.local_stat(),
            TokenKind::DbColon => self.label_stat(),
            TokenKind::Break => {
                self.bump()?;
                Ok(Stat::Break(line))
            }
            TokenKind::Goto => {
                self.bump()?;
                let name = self.expect_name()?;
                Ok(Stat::Goto { name, line })
            }
            _ => self.expr_stat(),
        }
    }

    fn label_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.bump()?; // '::'
        let name = self.expect_name()?;
        self.expect_kind(&TokenKind::DbColon)?;
        Ok(Stat::Label { name, line })
    }

    fn if_stat(&mut self) -> LuaResult<Stat> {
        let mut conds = Vec::new();
        let mut blocks = Vec::new();
        self.bump()?; // 'if'
        conds.push(self.expr()?);
        self.expect_kind(&TokenKind::Then)?;
        blocks.push(self.block()?);
        while self.is(&TokenKind::Elseif) {
            self.bump()?;
            conds.push(self.expr()?);
            self.expect_kind(&TokenKind::Then)?;
            blocks.push(self.block()?);
        }
        let else_block = if self.accept(&TokenKind::Else)? {
            Some(self.block()?)
        } else {
            None
        };
        self.expect_kind(&TokenKind::End)?;
        Ok(Stat::If { conds, blocks, else_block })
    }

    fn while_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.bump()?; // 'while'
        let cond = self.expr()?;
        self.expect_kind(&TokenKind::Do)?;
        let body = self.block()?;
        self.expect_kind(&TokenKind::End)?;
        Ok(Stat::While { cond, body, line })
    }

    fn repeat_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.bump()?; // 'repeat'
        let body = self.block()?;
        self.expect_kind(&TokenKind::Until)?;
        let cond = self.expr()?;
        Ok(Stat::Repeat { body, cond, line })
    }

    fn for_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.bump()?; // 'for'
        let name = self.expect_name()?;
        if self.is(&TokenKind::Symbol(b'=')) {
            self.bump()?;
            let start = self.expr()?;
            self.expect_symbol(b',')?;
            let stop = self.expr()?;
            let step = if self.accept(&TokenKind::Symbol(b','))? {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect_kind(&TokenKind::Do)?;
            let body = self.block()?;
            self.expect_kind(&TokenKind::End)?;
            Ok(Stat::ForNum { name, start, stop, step, body, line })
        } else {
            let mut names = vec![name];
            while self.accept(&TokenKind::Symbol(b','))? {
                names.push(self.expect_name()?);
            }
            self.expect_kind(&TokenKind::In)?;
            let exprs = self.exp_list()?;
            self.expect_kind(&TokenKind::Do)?;
            let body = self.block()?;
            self.expect_kind(&TokenKind::End)?;
            Ok(Stat::ForIn { names, exprs, body, line })
        }
    }

    fn func_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.bump()?; // 'function'
        let mut target = vec![self.expect_name()?];
        let mut is_method = false;
        while self.accept(&TokenKind::Symbol(b'.'))? {
            target.push(self.expect_name()?);
        }
        if self.accept(&TokenKind::Symbol(b':'))? {
            target.push(self.expect_name()?);
            is_method = true;
        }
        let func = self.func_body(is_method, line)?;
        Ok(Stat::FuncDecl { target, is_method, func, line })
    }

    fn local_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        self.bump()?; // 'local'
        if self.accept(&TokenKind::Function)? {
            let name = self.expect_name()?;
            let func = self.func_body(false, line)?;
            return Ok(Stat::LocalFunc { name, func, line });
        }
        let mut names = Vec::new();
        loop {
            names.push(self.expect_name()?);
            if !self.accept(&TokenKind::Symbol(b','))? {
                break;
            }
        }
        let exprs = if self.accept(&TokenKind::Symbol(b'='))? {
            self.exp_list()?
        } else {
            Vec::new()
        };
        Ok(Stat::LocalDecl { names, exprs, line })
    }

    fn func_body(&mut self, is_method: bool, line: u32) -> LuaResult<FunctionBody> {
        self.expect_symbol(b'(')?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.is(&TokenKind::Symbol(b')')) {
            loop {
                if self.accept(&TokenKind::Ellipsis)? {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.accept(&TokenKind::Symbol(b','))? {
                    break;
                }
            }
        }
        self.expect_symbol(b')')?;
        let body = self.block()?;
        let last_line = self.line();
        self.expect_kind(&TokenKind::End)?;
        Ok(FunctionBody { params, is_vararg, body, line, last_line })
    }

    fn expr_stat(&mut self) -> LuaResult<Stat> {
        let line = self.line();
        let first = self.suffixed_exp()?;
        if self.is(&TokenKind::Symbol(b'=')) || self.is(&TokenKind::Symbol(b',')) {
            let mut targets = vec![first];
            while self.accept(&TokenKind::Symbol(b','))? {
                targets.push(self.suffixed_exp()?);
            }
            self.expect_symbol(b'=')?;
            let exprs = self.exp_list()?;
            for t in &targets {
                if !matches!(t, Expr::Name(..) | Expr::Index { .. }) {
                    return Err(self.err("syntax error (cannot assign to this expression)"));
                }
            }
            Ok(Stat::Assign { targets, exprs, line })
        } else {
            if !matches!(first, Expr::Call { .. }) {
                return Err(self.err("syntax error (function call expected)"));
            }
            Ok(Stat::Call(first))
        }
    }

    fn exp_list(&mut self) -> LuaResult<Vec<Expr>> {
        let mut out = vec![self.expr()?];
        while self.accept(&TokenKind::Symbol(b','))? {
            out.push(self.expr()?);
        }
        Ok(out)
    }

    fn expr(&mut self) -> LuaResult<Expr> {
        self.sub_expr(0)
    }

    fn sub_expr(&mut self, limit: u8) -> LuaResult<Expr> {
        let line = self.line();
        let mut left = if let Some(op) = unop_of(&self.tok.kind) {
            self.bump()?;
            let operand = self.sub_expr(UNARY_PRIORITY)?;
            Expr::Unop { op, operand: Box::new(operand), line }
        } else {
            self.simple_exp()?
        };

        while let Some(op) = binop_of(&self.tok.kind) {
            let (left_pri, right_pri) = binop_priority(op);
            if left_pri <= limit {
                break;
            }
            let op_line = self.line();
            self.bump()?;
            let rhs = self.sub_expr(right_pri)?;
            left = Expr::Binop { op, lhs: Box::new(left), rhs: Box::new(rhs), line: op_line };
        }
        Ok(left)
    }

    fn simple_exp(&mut self) -> LuaResult<Expr> {
        let line = self.line();
        match self.tok.kind.clone() {
            TokenKind::Int(i) => {
                self.bump()?;
                Ok(Expr::Int(i, line))
            }
            TokenKind::Float(f) => {
                self.bump()?;
                Ok(Expr::Float(f, line))
            }
            TokenKind::Str(s) => {
                self.bump()?;
                Ok(Expr::Str(s, line))
            }
            TokenKind::Nil => {
                self.bump()?;
                Ok(Expr::Nil(line))
            }
            TokenKind::True => {
                self.bump()?;
                Ok(Expr::True(line))
            }
            TokenKind::False => {
                self.bump()?;
                Ok(Expr::False(line))
            }
            TokenKind::Ellipsis => {
                self.bump()?;
                Ok(Expr::Vararg(line))
            }
            TokenKind::Function => {
                self.bump()?;
                let func = self.func_body(false, line)?;
                Ok(Expr::Function(func))
            }
            TokenKind::Symbol(b'{') => self.table_constructor(),
            _ => self.suffixed_exp(),
        }
    }

    fn primary_exp(&mut self) -> LuaResult<Expr> {
        let line = self.line();
        if self.accept(&TokenKind::Symbol(b'('))? {
            let e = self.expr()?;
            self.expect_symbol(b')')?;
            Ok(Expr::Paren(Box::new(e)))
        } else {
            let name = self.expect_name()?;
            Ok(Expr::Name(name, line))
        }
    }

    fn suffixed_exp(&mut self) -> LuaResult<Expr> {
        let mut e = self.primary_exp()?;
        loop {
            let line = self.line();
            match self.tok.kind.clone() {
                TokenKind::Symbol(b'.') => {
                    self.bump()?;
                    let name = self.expect_name()?;
                    e = Expr::Index {
                        obj: Box::new(e),
                        key: Box::new(Expr::Str(name.into_bytes(), line)),
                        line,
                    };
                }
                TokenKind::Symbol(b'[') => {
                    self.bump()?;
                    let key = self.expr()?;
                    self.expect_symbol(b']')?;
                    e = Expr::Index { obj: Box::new(e), key: Box::new(key), line };
                }
                TokenKind::Symbol(b':') => {
                    self.bump()?;
                    let method = self.expect_name()?;
                    let args = self.func_args()?;
                    let last_line = self.line();
                    e = Expr::Call {
                        func: Box::new(e),
                        method: Some(method),
                        args,
                        line,
                        last_line,
                    };
                }
                TokenKind::Symbol(b'(') | TokenKind::Symbol(b'{') | TokenKind::Str(_) => {
                    let args = self.func_args()?;
                    let last_line = self.line();
                    e = Expr::Call { func: Box::new(e), method: None, args, line, last_line };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn func_args(&mut self) -> LuaResult<Vec<Expr>> {
        let line = self.line();
        match self.tok.kind.clone() {
            TokenKind::Symbol(b'(') => {
                self.bump()?;
                let args = if self.is(&TokenKind::Symbol(b')')) {
                    Vec::new()
                } else {
                    self.exp_list()?
                };
                self.expect_symbol(b')')?;
                Ok(args)
            }
            TokenKind::Str(s) => {
                self.bump()?;
                Ok(vec![Expr::Str(s, line)])
            }
            TokenKind::Symbol(b'{') => Ok(vec![self.table_constructor()?]),
            _ => Err(self.err("function arguments expected")),
        }
    }

    fn table_constructor(&mut self) -> LuaResult<Expr> {
        let line = self.line();
        self.expect_symbol(b'{')?;
        let mut keys = Vec::new();
        let mut vals = Vec::new();
        while !self.is(&TokenKind::Symbol(b'}')) {
            if self.is(&TokenKind::Symbol(b'[')) {
                self.bump()?;
                let key = self.expr()?;
                self.expect_symbol(b']')?;
                self.expect_symbol(b'=')?;
                let val = self.expr()?;
                keys.push(Some(key));
                vals.push(val);
            } else if matches!(self.tok.kind, TokenKind::Name(_)) && self.peek_is_assign()? {
                let name = self.expect_name()?;
                self.expect_symbol(b'=')?;
                let val = self.expr()?;
                keys.push(Some(Expr::Str(name.into_bytes(), line)));
                vals.push(val);
            } else {
                keys.push(None);
                vals.push(self.expr()?);
            }
            if !self.accept(&TokenKind::Symbol(b','))? && !self.accept(&TokenKind::Symbol(b';'))? {
                break;
            }
        }
        self.expect_symbol(b'}')?;
        Ok(Expr::Table { keys, vals, line })
    }

    /// Disambiguates `{ name = expr }` from `{ name }` by peeking one token
    /// past the current `Name` without consuming it.
    fn peek_is_assign(&mut self) -> LuaResult<bool> {
        let saved_lexer_pos = self.lexer_checkpoint();
        let saved_tok = self.tok.clone();
        self.bump()?;
        let is_assign = self.is(&TokenKind::Symbol(b'='));
        self.restore_lexer(saved_lexer_pos, saved_tok);
        Ok(is_assign)
    }

    fn lexer_checkpoint(&self) -> (usize, u32) {
        self.lexer.checkpoint()
    }

    fn restore_lexer(&mut self, checkpoint: (usize, u32), tok: Token) {
        self.lexer.restore(checkpoint);
        self.tok = tok;
    }
}

fn unop_of(kind: &TokenKind) -> Option<UnOp> {
    Some(match kind {
        TokenKind::Not => UnOp::Not,
        TokenKind::Symbol(b'-') => UnOp::Neg,
        TokenKind::Symbol(b'#') => UnOp::Len,
        TokenKind::Symbol(b'~') => UnOp::BNot,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_assignment() {
        let b = parse("local x = 1 + 2", "test").unwrap();
        assert_eq!(b.stats.len(), 1);
        assert!(matches!(b.stats[0], Stat::LocalDecl { .. }));
    }

    #[test]
    fn parses_if_elseif_else() {
        let b = parse("if a then b() elseif c then d() else e() end", "test").unwrap();
        assert_eq!(b.stats.len(), 1);
        match &b.stats[0] {
            Stat::If { conds, blocks, else_block } => {
                assert_eq!(conds.len(), 2);
                assert_eq!(blocks.len(), 2);
                assert!(else_block.is_some());
            }
            _ => panic!("expected if"),
        }
    }

    #[test]
    fn parses_function_call_statement() {
        let b = parse("print(\"hi\")", "test").unwrap();
        assert!(matches!(b.stats[0], Stat::Call(_)));
    }

    #[test]
    fn table_constructor_distinguishes_array_and_keyed_entries() {
        let b = parse("local t = {1, 2, x = 3, [4] = 5}", "test").unwrap();
        match &b.stats[0] {
            Stat::LocalDecl { exprs, .. } => match &exprs[0] {
                Expr::Table { keys, vals, .. } => {
                    assert_eq!(vals.len(), 4);
                    assert!(keys[0].is_none() && keys[1].is_none());
                    assert!(keys[2].is_some() && keys[3].is_some());
                }
                _ => panic!("expected table"),
            },
            _ => panic!("expected local decl"),
        }
    }

    #[test]
    fn precedence_respects_right_associative_concat_and_pow() {
        // a .. b .. c must parse as a .. (b .. c); 2^2^3 as 2^(2^3).
        let b = parse("return a .. b .. c", "test").unwrap();
        let (exprs, _) = b.ret.unwrap();
        match &exprs[0] {
            Expr::Binop { op: BinOp::Concat, rhs, .. } => {
                assert!(matches!(**rhs, Expr::Binop { op: BinOp::Concat, .. }));
            }
            _ => panic!("expected concat"),
        }
    }
}
