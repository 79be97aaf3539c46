use super::lexer::{tokenize, Tok, Token};

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign(String, Expr),
    Assert(Expr, Option<Expr>),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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
    Int(i64),
    Str(String),
    Bool(bool),
    None,
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Arg>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Cmp(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// `Some` for `key=value` arguments.
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl From<super::lexer::LexError> for ParseError {
    fn from(e: super::lexer::LexError) -> Self {
        ParseError {
            line: e.line,
            message: e.message,
        }
    }
}

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "assert", "true", "false", "none", "True", "False", "None",
];

pub fn parse_program(src: &str) -> Result<Vec<Stmt>, ParseError> {
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, pos: 0 };
    let mut stmts = Vec::new();
    while !p.at(&Tok::Eof) {
        stmts.push(p.statement()?);
    }
    Ok(stmts)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Ident(s) if s == kw)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), ParseError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {tok}, found {}", self.peek())))
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            line: self.line(),
            message,
        }
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let kind = if self.at_keyword("assert") {
            self.bump();
            let cond = self.expr()?;
            let msg = if self.eat(&Tok::Comma) {
                Some(self.expr()?)
            } else {
                None
            };
            StmtKind::Assert(cond, msg)
        } else if let (Tok::Ident(name), Tok::Assign) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            if KEYWORDS.contains(&name.as_str()) {
                return Err(self.error(format!("cannot assign to keyword {name:?}")));
            }
            self.bump();
            self.bump();
            StmtKind::Assign(name, self.expr()?)
        } else {
            StmtKind::Expr(self.expr()?)
        };
        if !self.eat(&Tok::Newline) && !self.at(&Tok::Eof) {
            return Err(self.error(format!("expected end of line, found {}", self.peek())));
        }
        Ok(Stmt { kind, line })
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.at_keyword("or") {
            self.bump();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.not_expr()?;
        while self.at_keyword("and") {
            self.bump();
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.at_keyword("not") {
            self.bump();
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.unary()?;
        let op = match self.peek() {
            Tok::EqEq => BinOp::Eq,
            Tok::NotEq => BinOp::Ne,
            Tok::Lt => BinOp::Lt,
            Tok::Le => BinOp::Le,
            Tok::Gt => BinOp::Gt,
            Tok::Ge => BinOp::Ge,
            Tok::Ident(s) if s == "in" => BinOp::In,
            Tok::Ident(s) if s == "not" && matches!(self.peek_at(1), Tok::Ident(t) if t == "in") => {
                BinOp::NotIn
            }
            _ => return Ok(lhs),
        };
        if op == BinOp::NotIn {
            self.bump();
        }
        self.bump();
        let rhs = self.unary()?;
        Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::Minus) {
            return Ok(match self.unary()? {
                Expr::Int(n) => Expr::Int(-n),
                other => Expr::Neg(Box::new(other)),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut e = self.atom()?;
        loop {
            if self.eat(&Tok::Dot) {
                match self.bump() {
                    Tok::Ident(name) => e = Expr::Attr(Box::new(e), name),
                    other => return Err(self.error(format!("expected attribute name, found {other}"))),
                }
            } else if self.eat(&Tok::LBracket) {
                let idx = self.expr()?;
                self.expect(&Tok::RBracket)?;
                e = Expr::Index(Box::new(e), Box::new(idx));
            } else if self.eat(&Tok::LParen) {
                let args = self.call_args()?;
                e = Expr::Call(Box::new(e), args);
            } else {
                return Ok(e);
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Arg>, ParseError> {
        let mut args: Vec<Arg> = Vec::new();
        while !self.eat(&Tok::RParen) {
            let arg = if let (Tok::Ident(name), Tok::Assign) = (self.peek(), self.peek_at(1)) {
                let name = name.clone();
                self.bump();
                self.bump();
                Arg {
                    name: Some(name),
                    value: self.expr()?,
                }
            } else {
                if args.iter().any(|a| a.name.is_some()) {
                    return Err(self.error("positional argument follows keyword argument".to_string()));
                }
                Arg {
                    name: None,
                    value: self.expr()?,
                }
            };
            args.push(arg);
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RParen)?;
                break;
            }
        }
        Ok(args)
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Tok::Int(n) => Ok(Expr::Int(n)),
            Tok::Str(mut s) => {
                // adjacent literals concatenate
                while let Tok::Str(next) = self.peek() {
                    s.push_str(next);
                    self.bump();
                }
                Ok(Expr::Str(s))
            }
            Tok::Ident(name) => match name.as_str() {
                "true" | "True" => Ok(Expr::Bool(true)),
                "false" | "False" => Ok(Expr::Bool(false)),
                "none" | "None" => Ok(Expr::None),
                kw if KEYWORDS.contains(&kw) => Err(self.error(format!("unexpected keyword {kw:?}"))),
                _ => Ok(Expr::Name(name)),
            },
            Tok::LParen => {
                let e = self.expr()?;
                self.expect(&Tok::RParen)?;
                Ok(e)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                while !self.eat(&Tok::RBracket) {
                    items.push(self.expr()?);
                    if !self.eat(&Tok::Comma) {
                        self.expect(&Tok::RBracket)?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                let mut entries = Vec::new();
                while !self.eat(&Tok::RBrace) {
                    let k = self.expr()?;
                    self.expect(&Tok::Colon)?;
                    let v = self.expr()?;
                    entries.push((k, v));
                    if !self.eat(&Tok::Comma) {
                        self.expect(&Tok::RBrace)?;
                        break;
                    }
                }
                Ok(Expr::Map(entries))
            }
            other => Err(self.error(format!("unexpected {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(src: &str) -> StmtKind {
        let mut stmts = parse_program(src).unwrap();
        assert_eq!(stmts.len(), 1, "{stmts:?}");
        stmts.remove(0).kind
    }

    fn name(s: &str) -> Box<Expr> {
        Box::new(Expr::Name(s.to_string()))
    }

    #[test]
    fn assignment_with_method_call_and_kwargs() {
        let got = one("out = c.run(args=['x'], must_fail=true)");
        let StmtKind::Assign(var, Expr::Call(func, args)) = got else {
            panic!("unexpected {got:?}");
        };
        assert_eq!(var, "out");
        assert_eq!(*func, Expr::Attr(name("c"), "run".to_string()));
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].name.as_deref(), Some("args"));
        assert_eq!(args[0].value, Expr::List(vec![Expr::Str("x".into())]));
        assert_eq!(args[1].value, Expr::Bool(true));
    }

    #[test]
    fn assert_with_message_and_precedence() {
        let got = one("assert not a in b and x.y[0] != -1, 'msg'");
        let StmtKind::Assert(cond, Some(Expr::Str(msg))) = got else {
            panic!("unexpected {got:?}");
        };
        assert_eq!(msg, "msg");
        assert_eq!(
            cond,
            Expr::And(
                Box::new(Expr::Not(Box::new(Expr::Cmp(BinOp::In, name("a"), name("b"))))),
                Box::new(Expr::Cmp(
                    BinOp::Ne,
                    Box::new(Expr::Index(
                        Box::new(Expr::Attr(name("x"), "y".into())),
                        Box::new(Expr::Int(0))
                    )),
                    Box::new(Expr::Int(-1))
                ))
            )
        );
    }

    #[test]
    fn not_in_is_one_operator() {
        let got = one("'x' not in out.stdout");
        assert!(matches!(got, StmtKind::Expr(Expr::Cmp(BinOp::NotIn, _, _))), "{got:?}");
    }

    #[test]
    fn maps_span_lines_and_allow_trailing_commas() {
        let got = one("remap = {\n  'helper': 'student_helper',\n}\n");
        let StmtKind::Assign(_, Expr::Map(entries)) = got else {
            panic!("unexpected {got:?}");
        };
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn statements_keep_their_lines() {
        let stmts = parse_program("a = 1\n\n# note\nprint(a)\n").unwrap();
        let lines: Vec<usize> = stmts.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 4]);
    }

    #[test]
    fn rejects_malformed_programs() {
        assert!(parse_program("a = ").is_err());
        assert!(parse_program("f(x=1, 2)").is_err());
        assert!(parse_program("a b").is_err());
        assert!(parse_program("in = 3").is_err());
        let err = parse_program("ok = 1\nx = [1, 2\ny = 3").unwrap_err();
        assert!(err.line >= 2, "{err}");
    }
}
