//! Recursive-descent parser producing statement and expression trees

use super::EvalError;
use super::lexer::{BinOp, Token, tokenize};
use crate::value::Value;

/// Deepest nesting of expressions accepted
const MAX_DEPTH: usize = 100;
/// Deepest left-folded operator chain, summed over the folds in progress
const MAX_CHAIN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Chained comparison: `a < b <= c`
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    /// Call of a builtin or a dotted host function
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Item(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign(Target, Expr),
    AugAssign(Target, BinOp, Expr),
    Del(Vec<Target>),
    Pass,
    Expr(Expr),
}

/// Parse a sequence of statements
pub fn parse_program(source: &str) -> Result<Vec<Stmt>, EvalError> {
    let mut parser = Parser::new(source)?;
    let mut program = Vec::new();
    loop {
        while parser.eat(&Token::Separator) {}
        if parser.peek() == &Token::Eof {
            return Ok(program);
        }
        program.push(parser.statement()?);
        match parser.peek() {
            Token::Separator | Token::Eof => {}
            other => return Err(unexpected(other)),
        }
    }
}

/// Parse exactly one expression
pub fn parse_expression(source: &str) -> Result<Expr, EvalError> {
    let mut parser = Parser::new(source)?;
    while parser.eat(&Token::Separator) {}
    let expr = parser.expression()?;
    while parser.eat(&Token::Separator) {}
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(unexpected(other)),
    }
}

fn unexpected(token: &Token) -> EvalError {
    EvalError::Syntax(format!("unexpected {}", token.describe()))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    chain: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, EvalError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
            chain: 0,
        })
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Token::Name(name) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), EvalError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(EvalError::Syntax(format!(
                "expected {}, found {}",
                token.describe(),
                self.peek().describe()
            )))
        }
    }

    fn statement(&mut self) -> Result<Stmt, EvalError> {
        if self.eat_keyword("pass") {
            return Ok(Stmt::Pass);
        }
        if self.eat_keyword("del") {
            let mut targets = vec![target(self.expression()?)?];
            while self.eat(&Token::Comma) {
                targets.push(target(self.expression()?)?);
            }
            return Ok(Stmt::Del(targets));
        }

        let expr = self.expression()?;
        match self.peek().clone() {
            Token::Assign => {
                self.advance();
                let value = self.expression()?;
                Ok(Stmt::Assign(target(expr)?, value))
            }
            Token::AugAssign(op) => {
                self.advance();
                let value = self.expression()?;
                Ok(Stmt::AugAssign(target(expr)?, op, value))
            }
            _ => Ok(Stmt::Expr(expr)),
        }
    }

    fn enter(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::Syntax("expression nested too deeply".into()));
        }
        Ok(())
    }

    /// Account for one more operator in a left fold
    fn extend_chain(&mut self) -> Result<(), EvalError> {
        self.chain += 1;
        if self.chain > MAX_CHAIN {
            return Err(EvalError::Syntax("operator chain too long".into()));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, EvalError> {
        self.enter()?;
        let expr = self.or_expr();
        self.depth -= 1;
        expr
    }

    // Left folds grow the tree by one level per operator, so each one
    // counts against the chain limit until the fold is finished.

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let base = self.chain;
        let mut lhs = self.and_expr()?;
        while self.eat_keyword("or") {
            self.extend_chain()?;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.chain = base;
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let base = self.chain;
        let mut lhs = self.not_expr()?;
        while self.eat_keyword("and") {
            self.extend_chain()?;
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.chain = base;
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, EvalError> {
        if self.eat_keyword("not") {
            self.enter()?;
            let inner = self.not_expr();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Token::Eq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            Token::Lt => CmpOp::Lt,
            Token::Le => CmpOp::Le,
            Token::Gt => CmpOp::Gt,
            Token::Ge => CmpOp::Ge,
            Token::Name(name) if name == "in" => CmpOp::In,
            Token::Name(name)
                if name == "not"
                    && matches!(self.peek_at(1), Token::Name(next) if next == "in") =>
            {
                self.pos += 1;
                CmpOp::NotIn
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let first = self.arith()?;
        let mut chain = Vec::new();
        while let Some(op) = self.comparison_op() {
            chain.push((op, self.arith()?));
        }
        if chain.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), chain))
        }
    }

    fn arith(&mut self) -> Result<Expr, EvalError> {
        let base = self.chain;
        let mut lhs = self.term()?;
        while let Token::Op(op @ (BinOp::Add | BinOp::Sub)) = *self.peek() {
            self.advance();
            self.extend_chain()?;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.chain = base;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let base = self.chain;
        let mut lhs = self.unary()?;
        while let Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod)) =
            *self.peek()
        {
            self.advance();
            self.extend_chain()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.chain = base;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Token::Op(BinOp::Sub) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)))
            }
            Token::Op(BinOp::Add) => {
                self.advance();
                self.nested(Self::unary)
            }
            _ => self.power(),
        }
    }

    fn nested(
        &mut self,
        rule: fn(&mut Self) -> Result<Expr, EvalError>,
    ) -> Result<Expr, EvalError> {
        self.enter()?;
        let expr = rule(self);
        self.depth -= 1;
        expr
    }

    fn power(&mut self) -> Result<Expr, EvalError> {
        let base = self.postfix()?;
        if self.eat(&Token::Op(BinOp::Pow)) {
            // right-associative, binds tighter than a unary minus on its left
            let exponent = self.nested(Self::unary)?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let base = self.chain;
        let mut expr = self.atom()?;
        while self.eat(&Token::LBracket) {
            self.extend_chain()?;
            let index = self.expression()?;
            self.expect(&Token::RBracket)?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        self.chain = base;
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::Str(mut s) => {
                // adjacent literals concatenate
                while let Token::Str(next) = self.peek() {
                    s.push_str(next);
                    self.pos += 1;
                }
                Ok(Expr::Literal(Value::Str(s)))
            }
            Token::Name(name) => self.name(name),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let items = self.sequence(&Token::RBracket, Self::expression)?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let entries = self.sequence(&Token::RBrace, |p| {
                    let key = p.expression()?;
                    p.expect(&Token::Colon)?;
                    Ok((key, p.expression()?))
                })?;
                Ok(Expr::Dict(entries))
            }
            other => Err(unexpected(&other)),
        }
    }

    fn name(&mut self, name: String) -> Result<Expr, EvalError> {
        match name.as_str() {
            "True" => return Ok(Expr::Literal(Value::Bool(true))),
            "False" => return Ok(Expr::Literal(Value::Bool(false))),
            "None" => return Ok(Expr::Literal(Value::None)),
            "and" | "or" | "not" | "in" | "del" | "pass" => {
                return Err(EvalError::Syntax(format!("unexpected keyword '{name}'")));
            }
            _ => {}
        }

        let mut path = name;
        while self.eat(&Token::Dot) {
            match self.advance() {
                Token::Name(part) => {
                    path.push('.');
                    path.push_str(&part);
                }
                other => return Err(unexpected(&other)),
            }
        }

        if self.eat(&Token::LParen) {
            let args = self.sequence(&Token::RParen, Self::expression)?;
            return Ok(Expr::Call(path, args));
        }
        if path.contains('.') {
            return Err(EvalError::Syntax(format!(
                "attribute access '{path}' is only supported in calls"
            )));
        }
        Ok(Expr::Name(path))
    }

    /// Comma-separated items up to `close`, trailing comma allowed
    fn sequence<T>(
        &mut self,
        close: &Token,
        mut item: impl FnMut(&mut Self) -> Result<T, EvalError>,
    ) -> Result<Vec<T>, EvalError> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(item(self)?);
            if !self.eat(&Token::Comma) {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }
}

fn target(expr: Expr) -> Result<Target, EvalError> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Index(base, index) => match *base {
            Expr::Name(name) => Ok(Target::Item(name, *index)),
            _ => Err(EvalError::Syntax(
                "only single-level item assignment is supported".into(),
            )),
        },
        _ => Err(EvalError::Syntax("cannot assign to expression".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Expr {
        Expr::Literal(Value::Int(i))
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinOp::Add,
                Box::new(int(1)),
                Box::new(Expr::Binary(BinOp::Mul, Box::new(int(2)), Box::new(int(3))))
            )
        );

        // -2 ** 2 is -(2 ** 2)
        let expr = parse_expression("-2 ** 2").unwrap();
        assert!(matches!(expr, Expr::Neg(inner) if matches!(*inner, Expr::Binary(BinOp::Pow, _, _))));
    }

    #[test]
    fn test_statements() {
        let program = parse_program("x = 1; y += x\n\ndel x, y\npass").unwrap();
        assert_eq!(program.len(), 4);
        assert_eq!(program[0], Stmt::Assign(Target::Name("x".into()), int(1)));
        assert!(matches!(program[1], Stmt::AugAssign(_, BinOp::Add, _)));
        assert!(matches!(&program[2], Stmt::Del(targets) if targets.len() == 2));
        assert_eq!(program[3], Stmt::Pass);
    }

    #[test]
    fn test_dotted_call_and_not_in() {
        let expr = parse_expression("broker.read_result('abc') not in [1, 2,]").unwrap();
        match expr {
            Expr::Compare(lhs, chain) => {
                assert!(matches!(*lhs, Expr::Call(ref name, ref args) if name == "broker.read_result" && args.len() == 1));
                assert_eq!(chain[0].0, CmpOp::NotIn);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse_expression("1 +"), Err(EvalError::Syntax(_))));
        assert!(matches!(parse_expression("1 2"), Err(EvalError::Syntax(_))));
        assert!(matches!(parse_program("1 = x"), Err(EvalError::Syntax(_))));
        assert!(matches!(parse_expression("a.b"), Err(EvalError::Syntax(_))));
        let deep = format!("{}1{}", "(".repeat(500), ")".repeat(500));
        assert!(matches!(parse_expression(&deep), Err(EvalError::Syntax(_))));
    }

    #[test]
    fn test_long_flat_chains_are_bounded() {
        assert!(parse_expression(&vec!["1"; 500].join(" + ")).is_ok());

        for op in [" + ", " * ", " and ", " or "] {
            let chain = vec!["1"; 300_000].join(op);
            assert!(
                matches!(parse_expression(&chain), Err(EvalError::Syntax(_))),
                "{op}"
            );
        }
        let indexed = format!("x{}", "[0]".repeat(2000));
        assert!(matches!(parse_expression(&indexed), Err(EvalError::Syntax(_))));

        // a finished chain gives its length back
        let parts = vec![vec!["1"; 600].join(" + "); 3].join(", ");
        assert!(parse_expression(&format!("[{parts}]")).is_ok());
    }
}
