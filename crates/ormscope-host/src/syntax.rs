//! Lexer and parser for modelscript.
//!
//! Source is split into logical lines (physical lines joined while brackets
//! are open). Blocks are introduced by a trailing `:` and consist of the
//! following lines indented deeper than the header.

use std::sync::Arc;

use crate::error::ScriptError;
use crate::model::FieldType;

const TAB_WIDTH: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(&'static str),
}

const TWO_CHAR_SYMBOLS: [&str; 4] = ["==", "!=", "<=", ">="];
const ONE_CHAR_SYMBOLS: [&str; 16] = [
    "(", ")", "[", "]", ",", ":", ".", "=", "<", ">", "+", "-", "*", "/", "%", "?",
];

fn tokenize_line(text: &str, line: usize) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        if ch == '#' {
            break;
        }
        if ch == '"' || ch == '\'' {
            let (value, next) = lex_string(&chars, i, line)?;
            tokens.push(Token::Str(value));
            i = next;
            continue;
        }
        if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float =
                i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let token = if is_float {
                literal
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|err| ScriptError::at(line, format!("invalid number: {err}")))?
            } else {
                literal
                    .parse::<i64>()
                    .map(Token::Int)
                    .map_err(|err| ScriptError::at(line, format!("invalid number: {err}")))?
            };
            tokens.push(token);
            continue;
        }
        if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Name(chars[start..i].iter().collect()));
            continue;
        }

        if i + 1 < chars.len() {
            let pair: String = chars[i..i + 2].iter().collect();
            if let Some(sym) = TWO_CHAR_SYMBOLS.iter().find(|sym| **sym == pair) {
                tokens.push(Token::Sym(*sym));
                i += 2;
                continue;
            }
        }
        let single = ch.to_string();
        if let Some(sym) = ONE_CHAR_SYMBOLS.iter().find(|sym| **sym == single) {
            tokens.push(Token::Sym(*sym));
            i += 1;
            continue;
        }
        return Err(ScriptError::at(
            line,
            format!("syntax error: unexpected character '{ch}'"),
        ));
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), ScriptError> {
    let quote = chars[start];
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let ch = chars[i];
        if ch == quote {
            return Ok((value, i + 1));
        }
        if ch == '\\' && i + 1 < chars.len() {
            let escaped = chars[i + 1];
            value.push(match escaped {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            i += 2;
            continue;
        }
        value.push(ch);
        i += 1;
    }
    Err(ScriptError::at(line, "syntax error: unterminated string"))
}

#[derive(Debug, Clone)]
struct LogicalLine {
    line: usize,
    indent: usize,
    tokens: Vec<Token>,
}

fn indent_width(text: &str) -> usize {
    text.chars()
        .take_while(|ch| *ch == ' ' || *ch == '\t')
        .map(|ch| if ch == '\t' { TAB_WIDTH } else { 1 })
        .sum()
}

fn bracket_delta(tokens: &[Token]) -> isize {
    tokens
        .iter()
        .map(|token| match token {
            Token::Sym("(" | "[") => 1,
            Token::Sym(")" | "]") => -1,
            _ => 0,
        })
        .sum()
}

fn logical_lines(source: &str) -> Result<Vec<LogicalLine>, ScriptError> {
    let mut out: Vec<LogicalLine> = Vec::new();
    let mut pending: Option<(LogicalLine, isize)> = None;

    for (index, text) in source.lines().enumerate() {
        let line = index + 1;
        let tokens = tokenize_line(text, line)?;

        if let Some((mut open, depth)) = pending.take() {
            let depth = depth + bracket_delta(&tokens);
            open.tokens.extend(tokens);
            if depth > 0 {
                pending = Some((open, depth));
            } else {
                out.push(open);
            }
            continue;
        }

        if tokens.is_empty() {
            continue;
        }
        let depth = bracket_delta(&tokens);
        let logical = LogicalLine {
            line,
            indent: indent_width(text),
            tokens,
        };
        if depth > 0 {
            pending = Some((logical, depth));
        } else {
            out.push(logical);
        }
    }

    if let Some((open, _)) = pending {
        return Err(ScriptError::at(open.line, "syntax error: unclosed bracket"));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    List(Vec<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Name(String),
    Attr(Expr, String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FieldDecl {
    pub name: String,
    pub ty: FieldType,
    pub nullable: bool,
    pub default: Option<Expr>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ModelDecl {
    pub name: String,
    pub group: Option<String>,
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StmtKind {
    Expr(Expr),
    Assign(Target, Expr),
    Def(Arc<FunctionDecl>),
    Return(Option<Expr>),
    If {
        branches: Vec<(Expr, Vec<Statement>)>,
        otherwise: Vec<Statement>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Statement>,
    },
    Pass,
    Model(ModelDecl),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub line: usize,
    pub kind: StmtKind,
}

/// Parse a whole unit of source into statements.
pub(crate) fn parse_program(source: &str) -> Result<Vec<Statement>, ScriptError> {
    let lines = logical_lines(source)?;
    if lines.is_empty() {
        return Ok(Vec::new());
    }
    let base = lines[0].indent;
    let mut pos = 0;
    let statements = parse_block(&lines, &mut pos, base)?;
    if let Some(extra) = lines.get(pos) {
        return Err(ScriptError::at(extra.line, "syntax error: unindent does not match"));
    }
    Ok(statements)
}

fn parse_block(
    lines: &[LogicalLine],
    pos: &mut usize,
    indent: usize,
) -> Result<Vec<Statement>, ScriptError> {
    let mut statements = Vec::new();
    while let Some(current) = lines.get(*pos) {
        if current.indent < indent {
            break;
        }
        if current.indent > indent {
            return Err(ScriptError::at(current.line, "syntax error: unexpected indent"));
        }
        statements.push(parse_statement(lines, pos, indent)?);
    }
    Ok(statements)
}

fn parse_body(
    lines: &[LogicalLine],
    pos: &mut usize,
    header_indent: usize,
    header_line: usize,
) -> Result<Vec<Statement>, ScriptError> {
    match lines.get(*pos) {
        Some(next) if next.indent > header_indent => parse_block(lines, pos, next.indent),
        _ => Err(ScriptError::at(
            header_line,
            "syntax error: expected an indented block",
        )),
    }
}

fn parse_statement(
    lines: &[LogicalLine],
    pos: &mut usize,
    indent: usize,
) -> Result<Statement, ScriptError> {
    let current = &lines[*pos];
    let line = current.line;
    let mut tokens = TokenStream::new(&current.tokens, line);
    *pos += 1;

    let kind = match tokens.peek_name() {
        Some("def") => {
            tokens.advance();
            let name = tokens.expect_name()?;
            tokens.expect_sym("(")?;
            let mut params = Vec::new();
            if !tokens.eat_sym(")") {
                loop {
                    params.push(tokens.expect_name()?);
                    if tokens.eat_sym(")") {
                        break;
                    }
                    tokens.expect_sym(",")?;
                }
            }
            tokens.expect_sym(":")?;
            tokens.expect_end()?;
            let body = parse_body(lines, pos, indent, line)?;
            StmtKind::Def(Arc::new(FunctionDecl { name, params, body }))
        }
        Some("model") => {
            tokens.advance();
            let name = tokens.expect_name()?;
            let mut group = None;
            if tokens.eat_sym("(") {
                let key = tokens.expect_name()?;
                if key != "group" {
                    return Err(tokens.error(&format!("unknown model option '{key}'")));
                }
                tokens.expect_sym("=")?;
                group = Some(tokens.expect_str()?);
                tokens.expect_sym(")")?;
            }
            tokens.expect_sym(":")?;
            tokens.expect_end()?;
            let fields = parse_model_fields(lines, pos, indent, line)?;
            StmtKind::Model(ModelDecl {
                name,
                group,
                fields,
            })
        }
        Some("if") => {
            tokens.advance();
            let condition = tokens.parse_expr()?;
            tokens.expect_sym(":")?;
            tokens.expect_end()?;
            let mut branches = vec![(condition, parse_body(lines, pos, indent, line)?)];
            let mut otherwise = Vec::new();
            while let Some(next) = lines.get(*pos) {
                if next.indent != indent {
                    break;
                }
                let mut clause = TokenStream::new(&next.tokens, next.line);
                match clause.peek_name() {
                    Some("elif") => {
                        clause.advance();
                        let condition = clause.parse_expr()?;
                        clause.expect_sym(":")?;
                        clause.expect_end()?;
                        *pos += 1;
                        branches.push((condition, parse_body(lines, pos, indent, next.line)?));
                    }
                    Some("else") => {
                        clause.advance();
                        clause.expect_sym(":")?;
                        clause.expect_end()?;
                        *pos += 1;
                        otherwise = parse_body(lines, pos, indent, next.line)?;
                        break;
                    }
                    _ => break,
                }
            }
            StmtKind::If {
                branches,
                otherwise,
            }
        }
        Some("for") => {
            tokens.advance();
            let var = tokens.expect_name()?;
            if tokens.peek_name() != Some("in") {
                return Err(tokens.error("expected 'in'"));
            }
            tokens.advance();
            let iter = tokens.parse_expr()?;
            tokens.expect_sym(":")?;
            tokens.expect_end()?;
            let body = parse_body(lines, pos, indent, line)?;
            StmtKind::For { var, iter, body }
        }
        Some("return") => {
            tokens.advance();
            let value = if tokens.at_end() {
                None
            } else {
                Some(tokens.parse_expr()?)
            };
            tokens.expect_end()?;
            StmtKind::Return(value)
        }
        Some("pass") => {
            tokens.advance();
            tokens.expect_end()?;
            StmtKind::Pass
        }
        Some(keyword @ ("elif" | "else")) => {
            return Err(tokens.error(&format!("'{keyword}' without matching 'if'")));
        }
        _ => {
            let expr = tokens.parse_expr()?;
            if tokens.eat_sym("=") {
                let target = match expr {
                    Expr::Name(name) => Target::Name(name),
                    Expr::Attr(object, attr) => Target::Attr(*object, attr),
                    _ => return Err(tokens.error("cannot assign to expression")),
                };
                let value = tokens.parse_expr()?;
                tokens.expect_end()?;
                StmtKind::Assign(target, value)
            } else {
                tokens.expect_end()?;
                StmtKind::Expr(expr)
            }
        }
    };

    Ok(Statement { line, kind })
}

fn parse_model_fields(
    lines: &[LogicalLine],
    pos: &mut usize,
    header_indent: usize,
    header_line: usize,
) -> Result<Vec<FieldDecl>, ScriptError> {
    let body_indent = match lines.get(*pos) {
        Some(next) if next.indent > header_indent => next.indent,
        _ => {
            return Err(ScriptError::at(
                header_line,
                "syntax error: expected an indented block",
            ))
        }
    };

    let mut fields = Vec::new();
    while let Some(current) = lines.get(*pos) {
        if current.indent < body_indent {
            break;
        }
        if current.indent > body_indent {
            return Err(ScriptError::at(current.line, "syntax error: unexpected indent"));
        }
        *pos += 1;

        let mut tokens = TokenStream::new(&current.tokens, current.line);
        if tokens.peek_name() == Some("pass") {
            tokens.advance();
            tokens.expect_end()?;
            continue;
        }
        let name = tokens.expect_name()?;
        if name == "id" {
            return Err(tokens.error("'id' is reserved for the primary key"));
        }
        tokens.expect_sym(":")?;
        let type_name = tokens.expect_name()?;
        let ty = FieldType::parse(&type_name)
            .ok_or_else(|| tokens.error(&format!("unknown field type '{type_name}'")))?;
        let nullable = tokens.eat_sym("?");
        let default = if tokens.eat_sym("=") {
            Some(tokens.parse_expr()?)
        } else {
            None
        };
        tokens.expect_end()?;
        fields.push(FieldDecl {
            name,
            ty,
            nullable,
            default,
            line: current.line,
        });
    }
    Ok(fields)
}

/// Nesting bound for expressions; evaluation recurses as deep as the tree.
const MAX_EXPR_DEPTH: usize = 200;

struct TokenStream<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
    depth: usize,
}

impl<'a> TokenStream<'a> {
    fn new(tokens: &'a [Token], line: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            line,
            depth: 0,
        }
    }

    fn deeper(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > MAX_EXPR_DEPTH {
            return Err(ScriptError::at(self.line, "expression too deeply nested"));
        }
        Ok(())
    }

    fn error(&self, message: &str) -> ScriptError {
        ScriptError::at(self.line, format!("syntax error: {message}"))
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_name(&self) -> Option<&'a str> {
        match self.peek() {
            Some(Token::Name(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    fn peek_sym(&self) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Sym(sym)) => Some(*sym),
            _ => None,
        }
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if self.peek_sym() == Some(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), ScriptError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{sym}'")))
        }
    }

    fn expect_name(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn expect_str(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Some(Token::Str(value)) => {
                self.pos += 1;
                Ok(value.clone())
            }
            _ => Err(self.error("expected a string")),
        }
    }

    fn expect_end(&self) -> Result<(), ScriptError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error("unexpected trailing tokens"))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        let saved = self.depth;
        self.deeper()?;
        let expr = self.parse_or();
        self.depth = saved;
        expr
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_and()?;
        while self.peek_name() == Some("or") {
            self.advance();
            self.deeper()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_not()?;
        while self.peek_name() == Some("and") {
            self.advance();
            self.deeper()?;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ScriptError> {
        if self.peek_name() == Some("not") {
            self.advance();
            self.deeper()?;
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let lhs = self.parse_additive()?;
        let op = match self.peek_sym() {
            Some("==") => BinOp::Eq,
            Some("!=") => BinOp::Ne,
            Some("<") => BinOp::Lt,
            Some("<=") => BinOp::Le,
            Some(">") => BinOp::Gt,
            Some(">=") => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek_sym() {
                Some("+") => BinOp::Add,
                Some("-") => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            self.deeper()?;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_sym() {
                Some("*") => BinOp::Mul,
                Some("/") => BinOp::Div,
                Some("%") => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            self.deeper()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_sym("-") {
            self.deeper()?;
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_primary()?;
        loop {
            if matches!(self.peek_sym(), Some("." | "(" | "[")) {
                self.deeper()?;
            }
            if self.eat_sym(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attr(Box::new(expr), attr);
            } else if self.eat_sym("(") {
                let (args, kwargs) = self.parse_arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_sym("[") {
                let index = self.parse_expr()?;
                self.expect_sym("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        if self.eat_sym(")") {
            return Ok((args, kwargs));
        }
        loop {
            let is_keyword = matches!(self.peek(), Some(Token::Name(_)))
                && self.tokens.get(self.pos + 1) == Some(&Token::Sym("="));
            if is_keyword {
                let name = self.expect_name()?;
                self.expect_sym("=")?;
                if kwargs.iter().any(|(existing, _)| *existing == name) {
                    return Err(self.error(&format!("keyword argument '{name}' repeated")));
                }
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if self.eat_sym(")") {
                return Ok((args, kwargs));
            }
            self.expect_sym(",")?;
            if self.eat_sym(")") {
                return Ok((args, kwargs));
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        let Some(token) = self.peek() else {
            return Err(self.error("unexpected end of line"));
        };
        self.advance();
        match token {
            Token::Int(value) => Ok(Expr::Int(*value)),
            Token::Float(value) => Ok(Expr::Float(*value)),
            Token::Str(value) => Ok(Expr::Str(value.clone())),
            Token::Name(name) => Ok(match name.as_str() {
                "True" => Expr::Bool(true),
                "False" => Expr::Bool(false),
                "None" => Expr::None,
                _ => Expr::Name(name.clone()),
            }),
            Token::Sym("(") => {
                let inner = self.parse_expr()?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            Token::Sym("[") => {
                let mut items = Vec::new();
                if self.eat_sym("]") {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    if self.eat_sym("]") {
                        return Ok(Expr::List(items));
                    }
                    self.expect_sym(",")?;
                    if self.eat_sym("]") {
                        return Ok(Expr::List(items));
                    }
                }
            }
            Token::Sym(sym) => Err(self.error(&format!("unexpected '{sym}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_program, Expr, StmtKind, Target};

    #[test]
    fn parses_model_function_and_call_lines() {
        let source = "\
model Person(group=\"shop\"):
    name: text
    email: text? = None

def run():
    p = Person.objects.create(name=\"Ada\")
    print(p.name)
";
        let program = parse_program(source);
        assert!(program.is_ok());
        let program = program.unwrap_or_else(|_| unreachable!());
        assert_eq!(program.len(), 2);
        match &program[0].kind {
            StmtKind::Model(decl) => {
                assert_eq!(decl.name, "Person");
                assert_eq!(decl.group.as_deref(), Some("shop"));
                assert_eq!(decl.fields.len(), 2);
                assert!(decl.fields[1].nullable);
            }
            other => panic!("expected model, got {other:?}"),
        }
        match &program[1].kind {
            StmtKind::Def(decl) => {
                assert_eq!(program[1].line, 5);
                assert_eq!(decl.body.len(), 2);
                assert_eq!(decl.body[0].line, 6);
            }
            other => panic!("expected def, got {other:?}"),
        }
    }

    #[test]
    fn bracketed_expressions_may_span_lines() {
        let source = "rows = db.execute(\n    \"SELECT ?\",\n    [1],\n)\nx = 2\n";
        let program = parse_program(source);
        assert!(program.is_ok());
        let program = program.unwrap_or_else(|_| unreachable!());
        assert_eq!(program.len(), 2);
        assert_eq!(program[0].line, 1);
        assert_eq!(program[1].line, 5);
        assert!(matches!(
            &program[0].kind,
            StmtKind::Assign(Target::Name(name), Expr::Call { .. }) if name == "rows"
        ));
    }

    #[test]
    fn if_elif_else_chains_attach_to_the_header() {
        let source = "if x:\n    a = 1\nelif y:\n    a = 2\nelse:\n    a = 3\n";
        let program = parse_program(source);
        assert!(program.is_ok());
        let program = program.unwrap_or_else(|_| unreachable!());
        assert_eq!(program.len(), 1);
        match &program[0].kind {
            StmtKind::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(otherwise.len(), 1);
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        let result = parse_program("x = 1\ny = (2\n");
        assert!(result.is_err());
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert_eq!(err.line, Some(2));

        let result = parse_program("def f():\nx = 1\n");
        assert!(result.is_err());
        assert_eq!(
            result.err().unwrap_or_else(|| unreachable!()).line,
            Some(1)
        );
    }

    #[test]
    fn deeply_nested_expressions_are_rejected() {
        let source = format!("y = 0\nx = {}1{}\n", "(".repeat(5000), ")".repeat(5000));
        let result = parse_program(&source);
        assert!(result.is_err());
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert_eq!(err.line, Some(2));
        assert_eq!(err.message, "expression too deeply nested");

        let negated = format!("x = {}1\n", "-".repeat(5000));
        assert!(parse_program(&negated).is_err());

        let nested = format!("x = {}1{}\n", "(".repeat(50), ")".repeat(50));
        assert!(parse_program(&nested).is_ok());
        let chain = format!("x = 1{}\n", " + 1".repeat(100));
        assert!(parse_program(&chain).is_ok());
    }
}
