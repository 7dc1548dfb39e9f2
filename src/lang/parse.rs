use super::ast::*;
use super::lex::lex;
use super::token::{Operator, Token, TokenKind, Word};
use super::{Error, LineNumber, MAX_LINE_NUMBER};
use std::collections::HashMap;

type Result<T> = std::result::Result<T, Error>;

/// Parses a whole program. Pass 1 collects `DEFtype` ranges so identifier
/// types resolve correctly everywhere; pass 2 builds the AST.
pub fn parse(source: &str) -> Result<Program> {
    let tokens = lex(source)?;
    let source_lines: Vec<String> = source.lines().map(|s| s.trim_end().to_string()).collect();
    Parse::new(tokens, source_lines).program()
}

/// Built-in function names; these lex as plain identifiers and are bound
/// here so `ABS(X)` never parses as an array reference.
pub fn is_builtin_function(name: &str) -> bool {
    matches!(
        name,
        "abs" | "atn"
            | "cos"
            | "exp"
            | "fix"
            | "int"
            | "log"
            | "rnd"
            | "sgn"
            | "sin"
            | "sqr"
            | "tan"
            | "cint"
            | "csng"
            | "cdbl"
            | "asc"
            | "chr$"
            | "hex$"
            | "oct$"
            | "left$"
            | "right$"
            | "mid$"
            | "str$"
            | "val"
            | "space$"
            | "string$"
            | "instr"
            | "inkey$"
            | "input$"
            | "eof"
            | "lof"
            | "loc"
            | "peek"
            | "pos"
            | "fre"
            | "tab"
            | "spc"
            | "usr"
            | "varptr"
            | "inp"
            | "lpos"
            | "cvi"
            | "cvs"
            | "cvd"
            | "mki$"
            | "mks$"
            | "mkd$"
            | "timer"
            | "date$"
            | "time$"
            | "environ$"
            | "error$"
    )
}

struct Parse {
    tokens: Vec<Token>,
    source_lines: Vec<String>,
    pos: usize,
    line: LineNumber,
    def_types: HashMap<char, VarType>,
}

impl Parse {
    fn new(tokens: Vec<Token>, source_lines: Vec<String>) -> Parse {
        Parse {
            tokens,
            source_lines,
            pos: 0,
            line: 0,
            def_types: HashMap::new(),
        }
    }

    fn kind(&self) -> &TokenKind {
        match self.tokens.get(self.pos) {
            Some(t) => &t.kind,
            None => &TokenKind::Eof,
        }
    }

    fn peek_kind(&self, offset: usize) -> &TokenKind {
        match self.tokens.get(self.pos + offset) {
            Some(t) => &t.kind,
            None => &TokenKind::Eof,
        }
    }

    fn column(&self) -> usize {
        match self.tokens.get(self.pos) {
            Some(t) => t.column,
            None => 0,
        }
    }

    fn source_line(&self) -> usize {
        match self.tokens.get(self.pos) {
            Some(t) => t.line,
            None => 0,
        }
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.kind().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn at_end(&self) -> bool {
        matches!(self.kind(), TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.kind() == kind
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check_word(&self, word: Word) -> bool {
        matches!(self.kind(), TokenKind::Word(w) if *w == word)
    }

    fn match_word(&mut self, word: Word) -> bool {
        if self.check_word(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_operator(&mut self, op: Operator) -> bool {
        if matches!(self.kind(), TokenKind::Operator(o) if *o == op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error<S: Into<String>>(&self, message: S) -> Error {
        error!(SyntaxError; message.into())
            .in_line_number(self.line)
            .at_column(self.column())
    }

    fn expect_kind(&mut self, kind: &TokenKind, message: &str) -> Result<()> {
        if self.match_kind(kind) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn expect_word(&mut self, word: Word, message: &str) -> Result<()> {
        if self.match_word(word) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn expect_equal(&mut self, message: &str) -> Result<()> {
        if self.match_operator(Operator::Equal) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    /// A `Number` token constrained to a valid line number.
    fn expect_line_number(&mut self) -> Result<LineNumber> {
        if let TokenKind::Number(n) = self.kind() {
            let n = *n;
            if n >= 0.0 && n <= f64::from(MAX_LINE_NUMBER) && n.fract() == 0.0 {
                self.advance();
                return Ok(n as LineNumber);
            }
        }
        Err(self.error("EXPECTED LINE NUMBER"))
    }

    // ========== Pass 1: DEFtype collection ==========

    fn collect_def_types(&mut self) {
        let saved = self.pos;
        while !self.at_end() {
            let def_type = match self.kind() {
                TokenKind::Word(Word::Defint) => Some(VarType::Integer),
                TokenKind::Word(Word::Defsng) => Some(VarType::Single),
                TokenKind::Word(Word::Defdbl) => Some(VarType::Double),
                TokenKind::Word(Word::Defstr) => Some(VarType::String),
                _ => None,
            };
            match def_type {
                Some(var_type) => {
                    self.advance();
                    if let Ok(ranges) = self.letter_ranges() {
                        for (from, to) in ranges {
                            for c in from..=to {
                                self.def_types.insert(c, var_type);
                            }
                        }
                    }
                }
                None => {
                    self.advance();
                }
            }
        }
        self.pos = saved;
    }

    fn letter_ranges(&mut self) -> Result<Vec<(char, char)>> {
        let mut ranges = vec![];
        loop {
            let from = match self.kind() {
                TokenKind::Ident(i) => match i.name.chars().next() {
                    Some(c) if c.is_ascii_lowercase() => c,
                    _ => return Err(self.error("EXPECTED LETTER")),
                },
                _ => return Err(self.error("EXPECTED LETTER")),
            };
            self.advance();
            let to = if self.match_operator(Operator::Minus) {
                let c = match self.kind() {
                    TokenKind::Ident(i) => i.name.chars().next(),
                    _ => None,
                };
                match c {
                    Some(c) if c.is_ascii_lowercase() => {
                        self.advance();
                        c
                    }
                    _ => return Err(self.error("EXPECTED LETTER")),
                }
            } else {
                from
            };
            ranges.push((from, to));
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(ranges)
    }

    fn resolve_type(&self, name: &str) -> VarType {
        if let Some(suffix) = name.chars().last() {
            if let Some(t) = VarType::from_suffix(suffix) {
                return t;
            }
        }
        if let Some(first) = name.chars().next() {
            if let Some(t) = self.def_types.get(&first.to_ascii_lowercase()) {
                return *t;
            }
        }
        VarType::Single
    }

    // ========== Pass 2: program structure ==========

    fn program(mut self) -> Result<Program> {
        self.collect_def_types();
        let mut program = Program {
            lines: vec![],
            def_types: self.def_types.clone(),
        };
        loop {
            while self.match_kind(&TokenKind::Newline) {}
            if self.at_end() {
                break;
            }
            let line = self.parse_line()?;
            program.lines.push(line);
        }
        Ok(program)
    }

    fn parse_line(&mut self) -> Result<Line> {
        let source_index = self.source_line();
        let number = match self.kind() {
            TokenKind::LineNumber(n) => *n,
            _ => return Err(error!(DirectStatementInFile).at_column(self.column())),
        };
        self.advance();
        self.line = number;
        let source = self
            .source_lines
            .get(source_index.wrapping_sub(1))
            .cloned()
            .unwrap_or_default();

        let mut statements = vec![];
        loop {
            while self.match_kind(&TokenKind::Colon) {}
            if self.check(&TokenKind::Newline) || self.at_end() {
                break;
            }
            statements.push(self.parse_statement()?);
            if !self.match_kind(&TokenKind::Colon) {
                break;
            }
        }
        if matches!(self.kind(), TokenKind::Remark(_)) {
            self.advance();
        }
        if !self.at_end() && !self.match_kind(&TokenKind::Newline) {
            return Err(self.error("EXPECTED END OF LINE"));
        }
        Ok(Line {
            number,
            statements,
            source,
        })
    }

    fn is_expression_start(&self) -> bool {
        match self.kind() {
            TokenKind::Number(_) | TokenKind::Str(_) | TokenKind::Ident(_) | TokenKind::LParen => {
                true
            }
            TokenKind::Operator(Operator::Minus)
            | TokenKind::Operator(Operator::Plus)
            | TokenKind::Operator(Operator::Not) => true,
            TokenKind::Word(Word::Len) => true,
            _ => false,
        }
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.kind().clone() {
            TokenKind::Word(word) => {
                self.advance();
                match word {
                    Word::Print => self.parse_print(false),
                    Word::Lprint => self.parse_print(true),
                    Word::Input => self.parse_input(),
                    Word::Line => {
                        self.expect_word(Word::Input, "EXPECTED INPUT AFTER LINE")?;
                        self.parse_line_input()
                    }
                    Word::Let => self.parse_let(),
                    Word::If => self.parse_if(),
                    Word::For => self.parse_for(),
                    Word::Next => self.parse_next(),
                    Word::While => {
                        let condition = self.parse_expression()?;
                        Ok(Statement::While { condition })
                    }
                    Word::Wend => Ok(Statement::Wend),
                    Word::Goto => {
                        let line = self.expect_line_number()?;
                        Ok(Statement::Goto { line })
                    }
                    Word::Gosub => {
                        let line = self.expect_line_number()?;
                        Ok(Statement::Gosub { line })
                    }
                    Word::Return => {
                        let line = if matches!(self.kind(), TokenKind::Number(_)) {
                            Some(self.expect_line_number()?)
                        } else {
                            None
                        };
                        Ok(Statement::Return { line })
                    }
                    Word::On => self.parse_on(),
                    Word::Data => self.parse_data(),
                    Word::Read => {
                        let targets = self.parse_lvalue_list()?;
                        Ok(Statement::Read { targets })
                    }
                    Word::Restore => {
                        let line = if matches!(self.kind(), TokenKind::Number(_)) {
                            Some(self.expect_line_number()?)
                        } else {
                            None
                        };
                        Ok(Statement::Restore { line })
                    }
                    Word::Dim => self.parse_dim(),
                    Word::Def => self.parse_def(),
                    Word::Defint => self.parse_deftype(VarType::Integer),
                    Word::Defsng => self.parse_deftype(VarType::Single),
                    Word::Defdbl => self.parse_deftype(VarType::Double),
                    Word::Defstr => self.parse_deftype(VarType::String),
                    Word::End | Word::System => Ok(Statement::End),
                    Word::Stop => Ok(Statement::Stop),
                    Word::Cls => Ok(Statement::Cls),
                    Word::Swap => {
                        let left = self.parse_lvalue()?;
                        self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA IN SWAP")?;
                        let right = self.parse_lvalue()?;
                        Ok(Statement::Swap { left, right })
                    }
                    Word::Erase => {
                        let mut arrays = vec![];
                        loop {
                            match self.kind().clone() {
                                TokenKind::Ident(i) => {
                                    arrays.push(i.name);
                                    self.advance();
                                }
                                _ => return Err(self.error("EXPECTED ARRAY NAME")),
                            }
                            if !self.match_kind(&TokenKind::Comma) {
                                break;
                            }
                        }
                        Ok(Statement::Erase { arrays })
                    }
                    Word::Clear => {
                        // String-space and stack-space arguments are accepted
                        // and ignored; memory is not modeled.
                        if self.is_expression_start() {
                            self.parse_expression()?;
                            if self.match_kind(&TokenKind::Comma) {
                                self.parse_expression()?;
                            }
                        }
                        Ok(Statement::Clear)
                    }
                    Word::Option => {
                        self.expect_word(Word::Base, "EXPECTED BASE AFTER OPTION")?;
                        let base = match self.kind() {
                            TokenKind::Number(n) if *n == 0.0 || *n == 1.0 => *n as u8,
                            _ => return Err(self.error("OPTION BASE MUST BE 0 OR 1")),
                        };
                        self.advance();
                        Ok(Statement::OptionBase { base })
                    }
                    Word::Randomize => {
                        let seed = if self.is_expression_start() {
                            Some(self.parse_expression()?)
                        } else {
                            None
                        };
                        Ok(Statement::Randomize { seed })
                    }
                    Word::Tron => Ok(Statement::Tron),
                    Word::Troff => Ok(Statement::Troff),
                    Word::Width => {
                        let file = if self.match_kind(&TokenKind::Hash) {
                            let f = self.parse_expression()?;
                            self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA AFTER FILE NUMBER")?;
                            Some(f)
                        } else {
                            None
                        };
                        let width = self.parse_expression()?;
                        Ok(Statement::Width { file, width })
                    }
                    Word::Poke => {
                        let address = self.parse_expression()?;
                        self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA IN POKE")?;
                        let value = self.parse_expression()?;
                        Ok(Statement::Poke { address, value })
                    }
                    Word::Error => {
                        let code = self.parse_expression()?;
                        Ok(Statement::Error { code })
                    }
                    Word::Resume => {
                        let kind = if self.match_word(Word::Next) {
                            ResumeKind::Next
                        } else if matches!(self.kind(), TokenKind::Number(_)) {
                            ResumeKind::Line(self.expect_line_number()?)
                        } else {
                            ResumeKind::Implicit
                        };
                        Ok(Statement::Resume { kind })
                    }
                    Word::Open => self.parse_open(),
                    Word::Close => self.parse_close(),
                    Word::Reset => Ok(Statement::Close { files: vec![] }),
                    Word::Field => self.parse_field(),
                    Word::Get => self.parse_get_put(true),
                    Word::Put => self.parse_get_put(false),
                    Word::Lset => {
                        let variable = self.parse_variable()?;
                        self.expect_equal("EXPECTED '=' IN LSET")?;
                        let value = self.parse_expression()?;
                        Ok(Statement::Lset { variable, value })
                    }
                    Word::Rset => {
                        let variable = self.parse_variable()?;
                        self.expect_equal("EXPECTED '=' IN RSET")?;
                        let value = self.parse_expression()?;
                        Ok(Statement::Rset { variable, value })
                    }
                    Word::Write => {
                        let file = if self.match_kind(&TokenKind::Hash) {
                            let f = self.parse_expression()?;
                            self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA AFTER FILE NUMBER")?;
                            Some(f)
                        } else {
                            None
                        };
                        let items = if self.is_expression_start() {
                            self.parse_expression_list()?
                        } else {
                            vec![]
                        };
                        Ok(Statement::Write { file, items })
                    }
                    Word::Chain => self.parse_chain(),
                    Word::Common => {
                        let mut variables = vec![];
                        loop {
                            match self.kind().clone() {
                                TokenKind::Ident(i) => {
                                    variables.push(i.name);
                                    self.advance();
                                }
                                _ => return Err(self.error("EXPECTED VARIABLE NAME")),
                            }
                            // COMMON A() declares an array; the parens carry
                            // no further information.
                            if self.match_kind(&TokenKind::LParen) {
                                self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
                            }
                            if !self.match_kind(&TokenKind::Comma) {
                                break;
                            }
                        }
                        Ok(Statement::Common { variables })
                    }
                    Word::Call => {
                        let address = self.parse_expression()?;
                        let mut args = vec![];
                        if self.match_kind(&TokenKind::LParen) {
                            if !self.check(&TokenKind::RParen) {
                                args = self.parse_expression_list()?;
                            }
                            self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
                        }
                        Ok(Statement::Call { address, args })
                    }
                    Word::Out => {
                        let port = self.parse_expression()?;
                        self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA IN OUT")?;
                        let value = self.parse_expression()?;
                        Ok(Statement::Out { port, value })
                    }
                    Word::Wait => {
                        let port = self.parse_expression()?;
                        self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA IN WAIT")?;
                        let and_mask = self.parse_expression()?;
                        let xor_mask = if self.match_kind(&TokenKind::Comma) {
                            Some(self.parse_expression()?)
                        } else {
                            None
                        };
                        Ok(Statement::Wait {
                            port,
                            and_mask,
                            xor_mask,
                        })
                    }
                    Word::Kill => {
                        let filename = self.parse_expression()?;
                        Ok(Statement::Kill { filename })
                    }
                    Word::Name => {
                        let old_name = self.parse_expression()?;
                        self.expect_word(Word::As, "EXPECTED AS IN NAME")?;
                        let new_name = self.parse_expression()?;
                        Ok(Statement::Name { old_name, new_name })
                    }
                    Word::Merge => {
                        let filename = self.parse_expression()?;
                        Ok(Statement::Merge { filename })
                    }
                    Word::Run => self.parse_run(),
                    _ => Err(self.error(format!("UNEXPECTED {}", word))),
                }
            }
            TokenKind::Remark(_) => {
                self.advance();
                Ok(Statement::Rem)
            }
            TokenKind::Ident(ident) => {
                if ident.name == "mid$" && matches!(self.peek_kind(1), TokenKind::LParen) {
                    self.parse_mid_assign()
                } else {
                    self.parse_let()
                }
            }
            kind => Err(self.error(format!("UNEXPECTED {}", kind))),
        }
    }

    fn parse_variable(&mut self) -> Result<Variable> {
        match self.kind().clone() {
            TokenKind::Ident(i) => {
                self.advance();
                let var_type = self.resolve_type(&i.name);
                Ok(Variable {
                    name: i.name,
                    original: i.original,
                    var_type,
                })
            }
            _ => Err(self.error("EXPECTED VARIABLE NAME")),
        }
    }

    fn parse_lvalue(&mut self) -> Result<Lvalue> {
        let variable = self.parse_variable()?;
        if self.match_kind(&TokenKind::LParen) {
            let mut indices = vec![];
            if !self.check(&TokenKind::RParen) {
                indices = self.parse_expression_list()?;
            }
            self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
            Ok(Lvalue::Array(ArrayRef {
                name: variable.name,
                original: variable.original,
                var_type: variable.var_type,
                indices,
            }))
        } else {
            Ok(Lvalue::Variable(variable))
        }
    }

    fn parse_lvalue_list(&mut self) -> Result<Vec<Lvalue>> {
        let mut targets = vec![];
        loop {
            targets.push(self.parse_lvalue()?);
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(targets)
    }

    fn parse_expression_list(&mut self) -> Result<Vec<Expression>> {
        let mut exprs = vec![];
        loop {
            exprs.push(self.parse_expression()?);
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(exprs)
    }

    // ========== Statement parsers ==========

    fn parse_print(&mut self, lprint: bool) -> Result<Statement> {
        let file = if !lprint && self.match_kind(&TokenKind::Hash) {
            let f = self.parse_expression()?;
            self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA AFTER FILE NUMBER")?;
            Some(f)
        } else {
            None
        };

        if self.match_word(Word::Using) {
            let format = self.parse_expression()?;
            self.expect_kind(&TokenKind::Semicolon, "EXPECTED ';' AFTER FORMAT")?;
            let mut items = vec![];
            while self.is_expression_start() {
                items.push(self.parse_expression()?);
                if !self.match_kind(&TokenKind::Semicolon) && !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
            return Ok(if lprint {
                Statement::LprintUsing { format, items }
            } else {
                Statement::PrintUsing {
                    file,
                    format,
                    items,
                }
            });
        }

        let mut items = vec![];
        let mut seps = vec![];
        // A leading separator prints an empty placeholder first, so
        // PRINT ,X tabs before X.
        loop {
            if self.match_kind(&TokenKind::Comma) {
                items.push(Expression::String(String::new()));
                seps.push(PrintSep::Comma);
            } else if self.match_kind(&TokenKind::Semicolon) {
                items.push(Expression::String(String::new()));
                seps.push(PrintSep::Semicolon);
            } else {
                break;
            }
        }
        while self.is_expression_start() {
            items.push(self.parse_expression()?);
            if self.match_kind(&TokenKind::Semicolon) {
                seps.push(PrintSep::Semicolon);
                while self.check(&TokenKind::Semicolon) {
                    items.push(Expression::String(String::new()));
                    self.advance();
                    seps.push(PrintSep::Semicolon);
                }
            } else if self.match_kind(&TokenKind::Comma) {
                seps.push(PrintSep::Comma);
                while self.check(&TokenKind::Comma) {
                    items.push(Expression::String(String::new()));
                    self.advance();
                    seps.push(PrintSep::Comma);
                }
            } else if self.is_expression_start() {
                seps.push(PrintSep::Adjacent);
            } else {
                break;
            }
        }
        if seps.len() < items.len() {
            seps.push(PrintSep::Newline);
        }
        Ok(if lprint {
            Statement::Lprint { items, seps }
        } else {
            Statement::Print { file, items, seps }
        })
    }

    fn parse_input(&mut self) -> Result<Statement> {
        let suppress_question = self.match_kind(&TokenKind::Semicolon);
        let file = if self.match_kind(&TokenKind::Hash) {
            let f = self.parse_expression()?;
            self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA AFTER FILE NUMBER")?;
            Some(f)
        } else {
            None
        };
        let prompt = if matches!(self.kind(), TokenKind::Str(_)) {
            let p = self.parse_expression()?;
            if !self.match_kind(&TokenKind::Semicolon) {
                self.match_kind(&TokenKind::Comma);
            }
            Some(p)
        } else {
            None
        };
        let targets = self.parse_lvalue_list()?;
        Ok(Statement::Input {
            file,
            prompt,
            targets,
            suppress_question,
        })
    }

    fn parse_line_input(&mut self) -> Result<Statement> {
        let file = if self.match_kind(&TokenKind::Hash) {
            let f = self.parse_expression()?;
            self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA AFTER FILE NUMBER")?;
            Some(f)
        } else {
            None
        };
        let prompt = if matches!(self.kind(), TokenKind::Str(_)) {
            let p = self.parse_expression()?;
            if !self.match_kind(&TokenKind::Semicolon) {
                self.match_kind(&TokenKind::Comma);
            }
            Some(p)
        } else {
            None
        };
        let target = self.parse_variable()?;
        Ok(Statement::LineInput {
            file,
            prompt,
            target,
        })
    }

    fn parse_let(&mut self) -> Result<Statement> {
        let target = self.parse_lvalue()?;
        self.expect_equal("EXPECTED '=' IN ASSIGNMENT")?;
        let value = self.parse_expression()?;
        Ok(Statement::Let { target, value })
    }

    fn parse_if(&mut self) -> Result<Statement> {
        let condition = self.parse_expression()?;
        let mut then_stmts = vec![];
        let mut then_line = None;
        let mut else_stmts = vec![];
        let mut else_line = None;

        if !self.match_word(Word::Then) {
            // IF c GOTO n is the archaic form of IF c THEN n.
            self.expect_word(Word::Goto, "EXPECTED THEN OR GOTO")?;
            then_line = Some(self.expect_line_number()?);
            if self.match_word(Word::Else) {
                if matches!(self.kind(), TokenKind::Number(_)) {
                    else_line = Some(self.expect_line_number()?);
                } else {
                    else_stmts = self.parse_branch_statements(false)?;
                }
            }
            return Ok(Statement::If {
                condition,
                then_stmts,
                then_line,
                else_stmts,
                else_line,
            });
        }

        if matches!(self.kind(), TokenKind::Number(_)) {
            then_line = Some(self.expect_line_number()?);
            // THEN 100 : ELSE 200 — swallow the colon before ELSE.
            if self.check(&TokenKind::Colon) && matches!(self.peek_kind(1), TokenKind::Word(Word::Else))
            {
                self.advance();
            }
        } else {
            then_stmts = self.parse_branch_statements(true)?;
        }

        if self.match_word(Word::Else) {
            if matches!(self.kind(), TokenKind::Number(_)) {
                else_line = Some(self.expect_line_number()?);
            } else {
                else_stmts = self.parse_branch_statements(false)?;
            }
        }

        Ok(Statement::If {
            condition,
            then_stmts,
            then_line,
            else_stmts,
            else_line,
        })
    }

    fn parse_branch_statements(&mut self, stop_at_else: bool) -> Result<Vec<Statement>> {
        let mut stmts = vec![];
        while !self.at_end()
            && !self.check(&TokenKind::Newline)
            && !matches!(self.kind(), TokenKind::Remark(_))
            && !(stop_at_else && self.check_word(Word::Else))
        {
            stmts.push(self.parse_statement()?);
            if !self.match_kind(&TokenKind::Colon) {
                break;
            }
        }
        Ok(stmts)
    }

    fn parse_for(&mut self) -> Result<Statement> {
        let variable = self.parse_variable()?;
        self.expect_equal("EXPECTED '=' IN FOR")?;
        let from = self.parse_expression()?;
        self.expect_word(Word::To, "EXPECTED TO IN FOR")?;
        let to = self.parse_expression()?;
        let step = if self.match_word(Word::Step) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Statement::For {
            variable,
            from,
            to,
            step,
        })
    }

    fn parse_next(&mut self) -> Result<Statement> {
        let mut variables = vec![];
        if matches!(self.kind(), TokenKind::Ident(_)) {
            loop {
                variables.push(self.parse_variable()?);
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(Statement::Next { variables })
    }

    fn parse_on(&mut self) -> Result<Statement> {
        if self.match_word(Word::Error) {
            let is_gosub = if self.match_word(Word::Goto) {
                false
            } else if self.match_word(Word::Gosub) {
                true
            } else {
                return Err(self.error("EXPECTED GOTO OR GOSUB AFTER ON ERROR"));
            };
            let target = self.expect_line_number()?;
            let line = if target == 0 { None } else { Some(target) };
            return Ok(Statement::OnError { line, is_gosub });
        }

        let selector = self.parse_expression()?;
        let is_gosub = if self.match_word(Word::Goto) {
            false
        } else if self.match_word(Word::Gosub) {
            true
        } else {
            return Err(self.error("EXPECTED GOTO OR GOSUB AFTER ON"));
        };
        let mut targets = vec![];
        loop {
            targets.push(self.expect_line_number()?);
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(if is_gosub {
            Statement::OnGosub { selector, targets }
        } else {
            Statement::OnGoto { selector, targets }
        })
    }

    fn parse_data(&mut self) -> Result<Statement> {
        let mut values = vec![];
        loop {
            match self.kind().clone() {
                TokenKind::Str(s) => {
                    values.push(DataItem::String(s));
                    self.advance();
                }
                TokenKind::Number(n) => {
                    values.push(DataItem::Number(n));
                    self.advance();
                }
                TokenKind::Operator(Operator::Minus) => {
                    self.advance();
                    match self.kind() {
                        TokenKind::Number(n) => {
                            values.push(DataItem::Number(-n));
                            self.advance();
                        }
                        _ => return Err(self.error("EXPECTED NUMBER IN DATA")),
                    }
                }
                TokenKind::Ident(i) => {
                    values.push(DataItem::String(i.original));
                    self.advance();
                }
                // A bare keyword in DATA is an unquoted string.
                TokenKind::Word(w) => {
                    values.push(DataItem::String(w.to_string()));
                    self.advance();
                }
                _ => break,
            }
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::Data { values })
    }

    fn parse_dim(&mut self) -> Result<Statement> {
        let mut arrays = vec![];
        loop {
            let variable = self.parse_variable()?;
            self.expect_kind(&TokenKind::LParen, "EXPECTED '(' IN DIM")?;
            let dimensions = self.parse_expression_list()?;
            self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
            arrays.push(DimDecl {
                name: variable.name,
                original: variable.original,
                var_type: variable.var_type,
                dimensions,
            });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::Dim { arrays })
    }

    fn parse_def(&mut self) -> Result<Statement> {
        let name = match self.kind().clone() {
            TokenKind::Ident(i) => {
                if i.name == "fn" {
                    // DEF FN A(X) — separate FN and name tokens.
                    self.advance();
                    match self.kind().clone() {
                        TokenKind::Ident(f) => {
                            self.advance();
                            format!("fn{}", f.name)
                        }
                        _ => return Err(self.error("EXPECTED FUNCTION NAME AFTER FN")),
                    }
                } else if i.name.starts_with("fn") && i.name.len() > 2 {
                    // DEF FNA(X) — one identifier.
                    self.advance();
                    i.name
                } else {
                    return Err(self.error("EXPECTED FN AFTER DEF"));
                }
            }
            _ => return Err(self.error("EXPECTED FN AFTER DEF")),
        };

        let mut params = vec![];
        if self.match_kind(&TokenKind::LParen) {
            if !self.check(&TokenKind::RParen) {
                loop {
                    match self.kind().clone() {
                        TokenKind::Ident(i) => {
                            params.push(i.name);
                            self.advance();
                        }
                        _ => return Err(self.error("EXPECTED PARAMETER NAME")),
                    }
                    if !self.match_kind(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
        }
        self.expect_equal("EXPECTED '=' IN DEF FN")?;
        let body = self.parse_expression()?;
        Ok(Statement::DefFn { name, params, body })
    }

    fn parse_deftype(&mut self, var_type: VarType) -> Result<Statement> {
        let ranges = self.letter_ranges()?;
        Ok(Statement::DefType { var_type, ranges })
    }

    fn parse_open(&mut self) -> Result<Statement> {
        let first = self.parse_expression()?;
        if self.match_kind(&TokenKind::Comma) {
            // Classic: OPEN "R", #1, "F.DAT" [,reclen]
            let mode = match &first {
                Expression::String(s) => match s.to_ascii_uppercase().as_str() {
                    "I" => FileMode::Input,
                    "O" => FileMode::Output,
                    "A" => FileMode::Append,
                    "R" => FileMode::Random,
                    _ => return Err(self.error("INVALID FILE MODE")),
                },
                _ => return Err(self.error("EXPECTED FILE MODE STRING")),
            };
            self.match_kind(&TokenKind::Hash);
            let file_number = self.parse_expression()?;
            self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA BEFORE FILENAME")?;
            let filename = self.parse_expression()?;
            let record_length = if self.match_kind(&TokenKind::Comma) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            Ok(Statement::Open {
                filename,
                mode,
                file_number,
                record_length,
            })
        } else if self.check_word(Word::For) {
            // Modern: OPEN "F.DAT" FOR RANDOM AS #1 [LEN=reclen]
            self.advance();
            let mode = if self.match_word(Word::Input) {
                FileMode::Input
            } else if self.match_word(Word::Output) {
                FileMode::Output
            } else if self.match_word(Word::Append) {
                FileMode::Append
            } else if matches!(self.kind(), TokenKind::Ident(i) if i.name == "random") {
                self.advance();
                FileMode::Random
            } else {
                return Err(self.error("EXPECTED INPUT, OUTPUT, APPEND OR RANDOM"));
            };
            self.expect_word(Word::As, "EXPECTED AS IN OPEN")?;
            self.match_kind(&TokenKind::Hash);
            let file_number = self.parse_expression()?;
            let record_length = if self.match_word(Word::Len) {
                self.expect_equal("EXPECTED '=' AFTER LEN")?;
                Some(self.parse_expression()?)
            } else {
                None
            };
            Ok(Statement::Open {
                filename: first,
                mode,
                file_number,
                record_length,
            })
        } else {
            Err(self.error("EXPECTED ',' OR FOR IN OPEN"))
        }
    }

    fn parse_close(&mut self) -> Result<Statement> {
        let mut files = vec![];
        loop {
            let had_hash = self.match_kind(&TokenKind::Hash);
            if !had_hash && !self.is_expression_start() {
                break;
            }
            files.push(self.parse_expression()?);
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::Close { files })
    }

    fn parse_field(&mut self) -> Result<Statement> {
        self.match_kind(&TokenKind::Hash);
        let file_number = self.parse_expression()?;
        self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA AFTER FILE NUMBER")?;
        let mut fields = vec![];
        loop {
            let width = self.parse_expression()?;
            self.expect_word(Word::As, "EXPECTED AS IN FIELD")?;
            let variable = self.parse_variable()?;
            fields.push(FieldDef { width, variable });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(Statement::Field {
            file_number,
            fields,
        })
    }

    fn parse_get_put(&mut self, is_get: bool) -> Result<Statement> {
        self.match_kind(&TokenKind::Hash);
        let file_number = self.parse_expression()?;
        let record = if self.match_kind(&TokenKind::Comma) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(if is_get {
            Statement::Get {
                file_number,
                record,
            }
        } else {
            Statement::Put {
                file_number,
                record,
            }
        })
    }

    fn parse_chain(&mut self) -> Result<Statement> {
        let merge = self.match_word(Word::Merge);
        let filename = self.parse_expression()?;
        let mut line = None;
        let mut all = false;
        let mut delete_lines = false;
        if self.match_kind(&TokenKind::Comma) {
            if self.is_expression_start() {
                line = Some(self.parse_expression()?);
            }
            if self.match_kind(&TokenKind::Comma) {
                if self.match_word(Word::All) {
                    all = true;
                } else if self.match_word(Word::Delete) {
                    delete_lines = true;
                }
            }
        }
        Ok(Statement::Chain {
            filename,
            line,
            all,
            merge,
            delete_lines,
        })
    }

    fn parse_mid_assign(&mut self) -> Result<Statement> {
        self.advance(); // MID$
        self.expect_kind(&TokenKind::LParen, "EXPECTED '(' AFTER MID$")?;
        let variable = self.parse_variable()?;
        self.expect_kind(&TokenKind::Comma, "EXPECTED COMMA IN MID$")?;
        let start = self.parse_expression()?;
        let length = if self.match_kind(&TokenKind::Comma) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
        self.expect_equal("EXPECTED '=' IN MID$ ASSIGNMENT")?;
        let value = self.parse_expression()?;
        Ok(Statement::MidAssign {
            variable,
            start,
            length,
            value,
        })
    }

    fn parse_run(&mut self) -> Result<Statement> {
        let mut filename = None;
        let mut start_line = None;
        let mut keep_variables = false;
        if matches!(self.kind(), TokenKind::Str(_)) {
            filename = Some(self.parse_expression()?);
            if self.match_kind(&TokenKind::Comma) {
                if matches!(self.kind(), TokenKind::Ident(i) if i.name == "r") {
                    self.advance();
                    keep_variables = true;
                } else if matches!(self.kind(), TokenKind::Number(_)) {
                    start_line = Some(self.expect_line_number()?);
                }
            }
        } else if matches!(self.kind(), TokenKind::Number(_)) {
            start_line = Some(self.expect_line_number()?);
        }
        Ok(Statement::Run {
            filename,
            start_line,
            keep_variables,
        })
    }

    // ========== Expressions ==========
    //
    // Precedence, low to high:
    //   IMP < EQV < XOR < OR < AND < NOT < comparison < + - < MOD < \
    //   < * / < unary - < ^ < primary
    // Unary minus binds looser than ^, so -2^2 = -4.

    fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_binary_chain(0)
    }

    fn parse_binary_chain(&mut self, level: usize) -> Result<Expression> {
        const LEVELS: [&[Operator]; 5] = [
            &[Operator::Imp],
            &[Operator::Eqv],
            &[Operator::Xor],
            &[Operator::Or],
            &[Operator::And],
        ];
        if level >= LEVELS.len() {
            return self.parse_not();
        }
        let mut left = self.parse_binary_chain(level + 1)?;
        loop {
            let op = match self.kind() {
                TokenKind::Operator(o) if LEVELS[level].contains(o) => *o,
                _ => break,
            };
            self.advance();
            let right = self.parse_binary_chain(level + 1)?;
            left = Expression::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expression> {
        if self.match_operator(Operator::Not) {
            let operand = self.parse_not()?;
            return Ok(Expression::Unary(Operator::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.kind() {
                TokenKind::Operator(o) if o.is_comparison() => *o,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expression::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expression> {
        let mut left = self.parse_mod()?;
        loop {
            let op = match self.kind() {
                TokenKind::Operator(o @ Operator::Plus) | TokenKind::Operator(o @ Operator::Minus) => {
                    *o
                }
                _ => break,
            };
            self.advance();
            let right = self.parse_mod()?;
            left = Expression::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_mod(&mut self) -> Result<Expression> {
        let mut left = self.parse_int_div()?;
        while self.match_operator(Operator::Modulus) {
            let right = self.parse_int_div()?;
            left = Expression::Binary(Operator::Modulus, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_int_div(&mut self) -> Result<Expression> {
        let mut left = self.parse_multiplicative()?;
        while self.match_operator(Operator::DivideInt) {
            let right = self.parse_multiplicative()?;
            left = Expression::Binary(Operator::DivideInt, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expression> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.kind() {
                TokenKind::Operator(o @ Operator::Multiply)
                | TokenKind::Operator(o @ Operator::Divide) => *o,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        if self.match_operator(Operator::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary(Operator::Minus, Box::new(operand)));
        }
        if self.match_operator(Operator::Plus) {
            return self.parse_unary();
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expression> {
        let left = self.parse_primary()?;
        if self.match_operator(Operator::Caret) {
            let right = self.parse_unary()?;
            return Ok(Expression::Binary(
                Operator::Caret,
                Box::new(left),
                Box::new(right),
            ));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match self.kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expression::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expression::String(s))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
                Ok(expr)
            }
            TokenKind::Word(Word::Len) => {
                self.advance();
                let args = self.parse_call_args()?;
                Ok(Expression::Function("len".to_string(), args))
            }
            TokenKind::Ident(ident) => {
                // ERR and ERL read the system error variables.
                if ident.name == "err" || ident.name == "erl" {
                    self.advance();
                    return Ok(Expression::Variable(Variable {
                        name: format!("{}%", ident.name),
                        original: format!("{}%", ident.original),
                        var_type: VarType::Integer,
                    }));
                }
                // FN A(X) — two-token user function reference.
                if ident.name == "fn" {
                    self.advance();
                    match self.kind().clone() {
                        TokenKind::Ident(f) => {
                            self.advance();
                            let args = self.parse_call_args()?;
                            return Ok(Expression::Function(format!("fn{}", f.name), args));
                        }
                        _ => return Err(self.error("EXPECTED FUNCTION NAME AFTER FN")),
                    }
                }
                // FNA(X) — fused user function reference.
                if ident.name.starts_with("fn")
                    && ident.name.len() > 2
                    && matches!(self.peek_kind(1), TokenKind::LParen)
                {
                    self.advance();
                    let args = self.parse_call_args()?;
                    return Ok(Expression::Function(ident.name, args));
                }
                if is_builtin_function(&ident.name) {
                    self.advance();
                    let args = self.parse_call_args()?;
                    return Ok(Expression::Function(ident.name, args));
                }
                self.advance();
                let var_type = self.resolve_type(&ident.name);
                if self.match_kind(&TokenKind::LParen) {
                    let mut indices = vec![];
                    if !self.check(&TokenKind::RParen) {
                        indices = self.parse_expression_list()?;
                    }
                    self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
                    return Ok(Expression::Array(ArrayRef {
                        name: ident.name,
                        original: ident.original,
                        var_type,
                        indices,
                    }));
                }
                Ok(Expression::Variable(Variable {
                    name: ident.name,
                    original: ident.original,
                    var_type,
                }))
            }
            _ => Err(error!(MissingOperand)
                .in_line_number(self.line)
                .at_column(self.column())),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expression>> {
        let mut args = vec![];
        if self.match_kind(&TokenKind::LParen) {
            if !self.check(&TokenKind::RParen) {
                loop {
                    // INPUT$(n, #f) and EOF(#f) spell file numbers with #.
                    self.match_kind(&TokenKind::Hash);
                    args.push(self.parse_expression()?);
                    if !self.match_kind(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect_kind(&TokenKind::RParen, "EXPECTED ')'")?;
        }
        Ok(args)
    }
}
