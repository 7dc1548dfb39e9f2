use super::file::{FileSystem, NativeFileSystem};
use super::format;
use super::function::Function;
use super::io::{Console, StdConsole, ZONE_WIDTH};
use super::operation::Operation;
use super::program::{Pc, StopReason};
use super::runtime::{FieldBuffer, FileEntry, ForState, Runtime, StackEntry};
use super::val::{self, Val};
use crate::lang::ast::*;
use crate::lang::{parse, Error, LineNumber};
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// Published when `CHAIN` halts the interpreter; the driver loads the
/// next program and decides which variables survive.
#[derive(Debug, Clone)]
pub struct ChainRequest {
    pub filename: String,
    pub line_number: Option<LineNumber>,
    pub all: bool,
    pub merge: bool,
}

/// Published when `RUN "file"` halts the interpreter.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub filename: String,
    pub start_line: Option<LineNumber>,
    pub keep_variables: bool,
}

#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub code: u16,
    pub pc: Pc,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct InterpreterState {
    pub error: Option<ErrorInfo>,
    pub statements_executed: usize,
    pub pause_requested: bool,
    skip_next_breakpoint: bool,
    pub chain_request: Option<ChainRequest>,
    pub run_request: Option<RunRequest>,
}

/// ## The tick interpreter
///
/// One statement per tick. The outer driver interleaves break polling,
/// breakpoints, and chain/run requests at tick boundaries.

pub struct Interpreter {
    runtime: Runtime,
    console: Box<dyn Console>,
    fs: Box<dyn FileSystem>,
    state: InterpreterState,
}

impl Interpreter {
    pub fn new(runtime: Runtime) -> Interpreter {
        Interpreter::with_ports(runtime, Box::new(StdConsole::new()), Box::new(NativeFileSystem))
    }

    pub fn with_ports(
        runtime: Runtime,
        console: Box<dyn Console>,
        fs: Box<dyn FileSystem>,
    ) -> Interpreter {
        Interpreter {
            runtime,
            console,
            fs,
            state: InterpreterState::default(),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    /// Hands the runtime back to the driver, e.g. to satisfy a chain
    /// request while preserving variables.
    pub fn into_runtime(self) -> Runtime {
        self.runtime
    }

    pub fn state(&self) -> &InterpreterState {
        &self.state
    }

    pub fn take_chain_request(&mut self) -> Option<ChainRequest> {
        self.state.chain_request.take()
    }

    pub fn take_run_request(&mut self) -> Option<RunRequest> {
        self.state.run_request.take()
    }

    pub fn pause(&mut self) {
        self.state.pause_requested = true;
    }

    pub fn unpause(&mut self) {
        self.state.pause_requested = false;
    }

    pub fn stop(&mut self) {
        self.runtime.pc = Pc::halted(StopReason::End);
    }

    /// Runs until the program halts.
    pub fn run(&mut self) {
        while self.tick() {}
    }

    /// Executes one statement. Returns true while still running.
    pub fn tick(&mut self) -> bool {
        if !self.runtime.pc.is_running() {
            return false;
        }
        if self.state.pause_requested {
            self.runtime.pc.reason = StopReason::Stop;
            return false;
        }
        if self.runtime.break_requested {
            self.runtime.break_requested = false;
            self.runtime.pc.reason = StopReason::Break;
            return false;
        }
        if self.runtime.breakpoints.contains(&self.runtime.pc) && !self.state.skip_next_breakpoint
        {
            self.runtime.pc.reason = StopReason::Breakpoint;
            self.state.skip_next_breakpoint = true;
            return false;
        }
        self.state.skip_next_breakpoint = false;

        let statement = match self.runtime.statements.get(&self.runtime.pc) {
            Some(statement) => statement,
            None => {
                // Falling off the end while handling an error is No RESUME.
                if self.runtime.error_pc.is_some() {
                    self.dispatch_error(error!(NoResume));
                } else {
                    self.runtime.pc = Pc::halted(StopReason::End);
                }
                return false;
            }
        };

        if self.runtime.trace_on {
            let trace = format!("[{}]\n", self.runtime.pc.line);
            self.console.print(&trace);
        }

        match self.execute(&statement) {
            Ok(()) => {
                self.state.statements_executed += 1;
            }
            Err(error) => {
                if !self.dispatch_error(error) {
                    return false;
                }
            }
        }

        self.advance_pc();
        self.runtime.pc.is_running()
    }

    /// Routes a runtime error to the installed handler, or halts.
    /// Returns false when the program halted.
    fn dispatch_error(&mut self, error: Error) -> bool {
        let error = error.in_line_number(self.runtime.pc.line);
        self.runtime.last_error_code = error.code();
        self.runtime.last_error_line = self.runtime.pc.line;

        // Errors raised inside the handler itself are fatal.
        let in_handler = self.runtime.error_pc.is_some();
        if let (Some(handler), false) = (self.runtime.error_handler_line, in_handler) {
            let target = self.runtime.statements.find_line(handler);
            if self.runtime.statements.valid(&target) {
                let _ = self
                    .runtime
                    .set_variable("err%", Val::Integer(error.code() as i16));
                let _ = self
                    .runtime
                    .set_variable("erl%", Val::Integer(self.runtime.pc.line as i16));
                self.runtime.error_pc = Some(self.runtime.pc);
                if self.runtime.error_handler_is_gosub {
                    let return_pc = self.runtime.statements.next(&self.runtime.pc);
                    self.runtime.exec_stack.push(StackEntry::Gosub { return_pc });
                }
                self.runtime.next_pc = Some(target);
                return true;
            }
        }

        self.state.error = Some(ErrorInfo {
            code: error.code(),
            pc: self.runtime.pc,
            message: error.to_string(),
        });
        self.runtime.pc.reason = StopReason::Error;
        false
    }

    fn advance_pc(&mut self) {
        if let Some(next) = self.runtime.next_pc.take() {
            self.runtime.pc = next;
        } else if self.runtime.pc.is_running() {
            self.runtime.pc = self.runtime.statements.next(&self.runtime.pc);
        }
    }

    fn jump_to(&mut self, line: LineNumber) -> Result<()> {
        let target = self.runtime.statements.find_line(line);
        if !self.runtime.statements.valid(&target) {
            return Err(error!(UndefinedLine; format!("{}", line)));
        }
        self.runtime.next_pc = Some(target);
        Ok(())
    }

    // ========== Statement execution ==========

    fn execute(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Print { file, items, seps } => self.exec_print(file, items, seps),
            Statement::PrintUsing {
                file,
                format,
                items,
            } => self.exec_print_using(file.as_ref(), format, items),
            Statement::Lprint { items, seps } => self.exec_print(&None, items, seps),
            Statement::LprintUsing { format, items } => {
                self.exec_print_using(None, format, items)
            }
            Statement::Input {
                file,
                prompt,
                targets,
                suppress_question,
            } => self.exec_input(file, prompt, targets, *suppress_question),
            Statement::LineInput {
                file,
                prompt,
                target,
            } => self.exec_line_input(file, prompt, target),
            Statement::Let { target, value } => {
                let value = self.eval(value)?;
                self.set_lvalue(target, value)
            }
            Statement::If {
                condition,
                then_stmts,
                then_line,
                else_stmts,
                else_line,
            } => self.exec_if(condition, then_stmts, *then_line, else_stmts, *else_line),
            Statement::For {
                variable,
                from,
                to,
                step,
            } => self.exec_for(variable, from, to, step),
            Statement::Next { variables } => self.exec_next(variables),
            Statement::While { condition } => self.exec_while(condition),
            Statement::Wend => self.exec_wend(),
            Statement::Goto { line } => self.jump_to(*line),
            Statement::Gosub { line } => {
                let return_pc = self.runtime.statements.next(&self.runtime.pc);
                self.runtime.exec_stack.push(StackEntry::Gosub { return_pc });
                self.jump_to(*line)
            }
            Statement::Return { line } => self.exec_return(*line),
            Statement::OnGoto { selector, targets } => {
                let k = self.eval(selector)?.to_number() as i64;
                if k >= 1 && (k as usize) <= targets.len() {
                    self.jump_to(targets[(k - 1) as usize])?;
                }
                Ok(())
            }
            Statement::OnGosub { selector, targets } => {
                let k = self.eval(selector)?.to_number() as i64;
                if k >= 1 && (k as usize) <= targets.len() {
                    let return_pc = self.runtime.statements.next(&self.runtime.pc);
                    self.runtime.exec_stack.push(StackEntry::Gosub { return_pc });
                    self.jump_to(targets[(k - 1) as usize])?;
                }
                Ok(())
            }
            Statement::OnError { line, is_gosub } => {
                self.runtime.error_handler_line = *line;
                self.runtime.error_handler_is_gosub = *is_gosub;
                Ok(())
            }
            Statement::Data { .. } => Ok(()),
            Statement::Read { targets } => {
                for target in targets {
                    let value = self.runtime.read_data()?;
                    self.set_lvalue(target, value)?;
                }
                Ok(())
            }
            Statement::Restore { line } => {
                self.runtime.restore_data(*line);
                Ok(())
            }
            Statement::Dim { arrays } => {
                for decl in arrays {
                    let dimensions = self.eval_indices(&decl.dimensions)?;
                    self.runtime
                        .dim_array(&decl.name, dimensions, decl.var_type)?;
                }
                Ok(())
            }
            Statement::DefFn { .. } => Ok(()),
            Statement::DefType { .. } => Ok(()),
            Statement::End => {
                if self.runtime.error_pc.is_some() {
                    return Err(error!(NoResume));
                }
                self.runtime.pc = Pc::halted(StopReason::End);
                Ok(())
            }
            Statement::Stop => {
                self.runtime.pc.reason = StopReason::Stop;
                Ok(())
            }
            Statement::Cls => {
                self.console.clear_screen();
                Ok(())
            }
            Statement::Rem => Ok(()),
            Statement::Swap { left, right } => {
                let a = self.get_lvalue(left)?;
                let b = self.get_lvalue(right)?;
                self.set_lvalue(left, b)?;
                self.set_lvalue(right, a)
            }
            Statement::Erase { arrays } => {
                for name in arrays {
                    self.runtime.erase_array(name);
                }
                Ok(())
            }
            Statement::Clear => {
                self.runtime.clear_state();
                Ok(())
            }
            Statement::OptionBase { base } => {
                self.runtime.array_base = i32::from(*base);
                Ok(())
            }
            Statement::Randomize { seed } => {
                let seed = match seed {
                    Some(e) => self.eval(e)?.to_number().abs() as u32,
                    None => Function::timer()?.to_number() as u32,
                };
                self.runtime.rnd.seed(seed);
                Ok(())
            }
            Statement::Tron => {
                self.runtime.trace_on = true;
                Ok(())
            }
            Statement::Troff => {
                self.runtime.trace_on = false;
                Ok(())
            }
            Statement::Width { file, width } => {
                if file.is_none() {
                    let width = self.eval(width)?.to_number() as usize;
                    self.console.set_width(width);
                }
                Ok(())
            }
            // Hardware-proximate statements are inert.
            Statement::Poke { .. } | Statement::Out { .. } | Statement::Wait { .. } => Ok(()),
            Statement::Call { .. } => Ok(()),
            Statement::Error { code } => {
                let code = self.eval(code)?.to_number() as i64;
                Err(Error::from_raw(code.max(0) as u16))
            }
            Statement::Resume { kind } => self.exec_resume(*kind),
            Statement::Open {
                filename,
                mode,
                file_number,
                record_length,
            } => self.exec_open(filename, *mode, file_number, record_length),
            Statement::Close { files } => self.exec_close(files),
            Statement::Field {
                file_number,
                fields,
            } => self.exec_field(file_number, fields),
            Statement::Get {
                file_number,
                record,
            } => self.exec_get_put(file_number, record, true),
            Statement::Put {
                file_number,
                record,
            } => self.exec_get_put(file_number, record, false),
            Statement::Lset { variable, value } => self.exec_set_field(variable, value, true),
            Statement::Rset { variable, value } => self.exec_set_field(variable, value, false),
            Statement::Write { file, items } => self.exec_write(file, items),
            Statement::Chain {
                filename,
                line,
                all,
                merge,
                delete_lines: _,
            } => {
                let filename = self.eval_string(filename)?;
                let line_number = match line {
                    Some(e) => Some(self.eval(e)?.to_number() as LineNumber),
                    None => None,
                };
                self.state.chain_request = Some(ChainRequest {
                    filename,
                    line_number,
                    all: *all,
                    merge: *merge,
                });
                self.runtime.pc.reason = StopReason::End;
                Ok(())
            }
            Statement::Common { variables } => {
                for name in variables {
                    if !self.runtime.common_vars.contains(name) {
                        self.runtime.common_vars.push(name.clone());
                    }
                }
                Ok(())
            }
            Statement::MidAssign {
                variable,
                start,
                length,
                value,
            } => self.exec_mid_assign(variable, start, length, value),
            Statement::Kill { filename } => {
                let path = self.eval_string(filename)?;
                if !self.fs.exists(&path) || !self.fs.remove(&path) {
                    return Err(error!(FileNotFound; path));
                }
                Ok(())
            }
            Statement::Name { old_name, new_name } => {
                let old_name = self.eval_string(old_name)?;
                let new_name = self.eval_string(new_name)?;
                if !self.fs.exists(&old_name) {
                    return Err(error!(FileNotFound; old_name));
                }
                if self.fs.exists(&new_name) {
                    return Err(error!(FileAlreadyExists; new_name));
                }
                if !self.fs.rename(&old_name, &new_name) {
                    return Err(error!(DiskIoError));
                }
                Ok(())
            }
            Statement::Merge { filename } => self.exec_merge(filename),
            Statement::Run {
                filename,
                start_line,
                keep_variables,
            } => self.exec_run(filename, *start_line, *keep_variables),
        }
    }

    // ========== PRINT ==========

    fn exec_print(
        &mut self,
        file: &Option<Expression>,
        items: &[Expression],
        seps: &[PrintSep],
    ) -> Result<()> {
        if let Some(file) = file {
            return self.exec_print_file(file, items, seps);
        }
        for (i, item) in items.iter().enumerate() {
            let value = self.eval(item)?;
            let text = value.to_string();
            self.console.print(&text);
            match seps.get(i) {
                Some(PrintSep::Semicolon) => {}
                Some(PrintSep::Comma) => {
                    let column = self.console.column();
                    let pad = (column / ZONE_WIDTH + 1) * ZONE_WIDTH - column;
                    let spaces = " ".repeat(pad);
                    self.console.print(&spaces);
                }
                Some(PrintSep::Adjacent) => self.console.print(" "),
                Some(PrintSep::Newline) | None => self.console.print("\n"),
            }
        }
        if items.is_empty() {
            self.console.print("\n");
        }
        Ok(())
    }

    fn exec_print_file(
        &mut self,
        file: &Expression,
        items: &[Expression],
        seps: &[PrintSep],
    ) -> Result<()> {
        let n = self.file_number(file)?;
        let mut output = String::new();
        let column = |output: &String| match output.rfind('\n') {
            Some(at) => output.chars().count() - output[..at + 1].chars().count(),
            None => output.chars().count(),
        };
        for (i, item) in items.iter().enumerate() {
            let value = self.eval(item)?;
            output.push_str(&value.to_string());
            match seps.get(i) {
                Some(PrintSep::Semicolon) => {}
                Some(PrintSep::Comma) => {
                    let col = column(&output);
                    let pad = (col / ZONE_WIDTH + 1) * ZONE_WIDTH - col;
                    output.push_str(&" ".repeat(pad));
                }
                Some(PrintSep::Adjacent) => output.push(' '),
                Some(PrintSep::Newline) | None => output.push('\n'),
            }
        }
        if items.is_empty() {
            output.push('\n');
        }
        self.write_file(n, &output)
    }

    fn exec_print_using(
        &mut self,
        file: Option<&Expression>,
        format_expr: &Expression,
        items: &[Expression],
    ) -> Result<()> {
        let format = self.eval_string(format_expr)?;
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            values.push(self.eval(item)?);
        }
        let mut output = format::print_using(&format, values)?;
        output.push('\n');
        match file {
            Some(file) => {
                let n = self.file_number(file)?;
                self.write_file(n, &output)
            }
            None => {
                self.console.print(&output);
                Ok(())
            }
        }
    }

    fn exec_write(&mut self, file: &Option<Expression>, items: &[Expression]) -> Result<()> {
        let mut output = String::new();
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                output.push(',');
            }
            match self.eval(item)? {
                Val::String(s) => {
                    output.push('"');
                    output.push_str(&s);
                    output.push('"');
                }
                value => output.push_str(&value.to_string()),
            }
        }
        output.push('\n');
        match file {
            Some(file) => {
                let n = self.file_number(file)?;
                self.write_file(n, &output)
            }
            None => {
                self.console.print(&output);
                Ok(())
            }
        }
    }

    // ========== INPUT ==========

    fn exec_input(
        &mut self,
        file: &Option<Expression>,
        prompt: &Option<Expression>,
        targets: &[Lvalue],
        suppress_question: bool,
    ) -> Result<()> {
        let line = match file {
            Some(file) => {
                let n = self.file_number(file)?;
                self.read_file_line(n)?
            }
            None => {
                let mut text = match prompt {
                    Some(p) => self.eval_string(p)?,
                    None => String::new(),
                };
                if !suppress_question {
                    text.push_str("? ");
                }
                self.console.input(&text)
            }
        };
        let values: Vec<String> = line.split(',').map(|s| s.trim().to_string()).collect();
        // Too few values: assign what we have.
        for (target, raw) in targets.iter().zip(values.iter()) {
            let value = if target.var_type() == VarType::String {
                Val::String(raw.clone())
            } else {
                Val::Double(super::function::parse_number_prefix(raw))
            };
            self.set_lvalue(target, value)?;
        }
        Ok(())
    }

    fn exec_line_input(
        &mut self,
        file: &Option<Expression>,
        prompt: &Option<Expression>,
        target: &Variable,
    ) -> Result<()> {
        let line = match file {
            Some(file) => {
                let n = self.file_number(file)?;
                self.read_file_line(n)?
            }
            None => {
                let text = match prompt {
                    Some(p) => self.eval_string(p)?,
                    None => String::new(),
                };
                self.console.input(&text)
            }
        };
        self.runtime.set_variable(&target.name, Val::String(line))
    }

    // ========== Control flow ==========

    fn exec_if(
        &mut self,
        condition: &Expression,
        then_stmts: &[Statement],
        then_line: Option<LineNumber>,
        else_stmts: &[Statement],
        else_line: Option<LineNumber>,
    ) -> Result<()> {
        if self.eval(condition)?.to_bool() {
            if let Some(line) = then_line {
                return self.jump_to(line);
            }
            self.exec_branch(then_stmts)
        } else {
            if let Some(line) = else_line {
                return self.jump_to(line);
            }
            self.exec_branch(else_stmts)
        }
    }

    fn exec_branch(&mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            self.execute(statement)?;
            if self.runtime.next_pc.is_some() || !self.runtime.pc.is_running() {
                break;
            }
        }
        Ok(())
    }

    fn exec_for(
        &mut self,
        variable: &Variable,
        from: &Expression,
        to: &Expression,
        step: &Option<Expression>,
    ) -> Result<()> {
        let from = self.eval(from)?.to_number();
        let to = self.eval(to)?.to_number();
        let step = match step {
            Some(e) => self.eval(e)?.to_number(),
            None => 1.0,
        };
        self.runtime.set_variable(&variable.name, Val::Double(from))?;
        self.runtime.for_states.retain(|(name, _)| name != &variable.name);

        if (step > 0.0 && from > to) || (step < 0.0 && from < to) {
            // Empty range: skip past the matching NEXT without looping.
            let after_next = self.scan_for_next(&variable.name)?;
            self.runtime.next_pc = Some(after_next);
            return Ok(());
        }

        let resume_pc = self.runtime.statements.next(&self.runtime.pc);
        self.runtime.for_states.push((
            variable.name.clone(),
            ForState {
                resume_pc,
                end: to,
                step,
            },
        ));
        Ok(())
    }

    fn scan_for_next(&self, var_name: &str) -> Result<Pc> {
        let mut scan = self.runtime.pc;
        let mut depth = 1;
        loop {
            scan = self.runtime.statements.next(&scan);
            let statement = match self.runtime.statements.get(&scan) {
                Some(statement) => statement,
                None => return Err(error!(ForWithoutNext)),
            };
            match statement.as_ref() {
                Statement::For { .. } => depth += 1,
                Statement::Next { variables } => {
                    if variables.is_empty() || variables.iter().any(|v| v.name == var_name) {
                        depth -= 1;
                    }
                }
                _ => {}
            }
            if depth == 0 {
                return Ok(self.runtime.statements.next(&scan));
            }
        }
    }

    fn exec_next(&mut self, variables: &[Variable]) -> Result<()> {
        let names: Vec<String> = if variables.is_empty() {
            match self.runtime.for_states.last() {
                Some((name, _)) => vec![name.clone()],
                None => return Err(error!(NextWithoutFor)),
            }
        } else {
            variables.iter().map(|v| v.name.clone()).collect()
        };

        for name in names {
            let at = match self.runtime.for_states.iter().rposition(|(n, _)| n == &name) {
                Some(at) => at,
                None => return Err(error!(NextWithoutFor; name.to_ascii_uppercase())),
            };
            let state = self.runtime.for_states[at].1.clone();
            let value = self.runtime.get_variable(&name).to_number() + state.step;
            self.runtime.set_variable(&name, Val::Double(value))?;
            let done = if state.step > 0.0 {
                value > state.end
            } else {
                value < state.end
            };
            if done {
                self.runtime.for_states.remove(at);
            } else {
                self.runtime.next_pc = Some(state.resume_pc);
                break;
            }
        }
        Ok(())
    }

    fn exec_while(&mut self, condition: &Expression) -> Result<()> {
        if self.eval(condition)?.to_bool() {
            let loop_pc = self.runtime.pc;
            self.runtime.exec_stack.push(StackEntry::While { loop_pc });
            return Ok(());
        }
        // False on entry: skip past the matching WEND.
        let mut scan = self.runtime.pc;
        let mut depth = 1;
        loop {
            scan = self.runtime.statements.next(&scan);
            let statement = match self.runtime.statements.get(&scan) {
                Some(statement) => statement,
                None => return Err(error!(WhileWithoutWend)),
            };
            match statement.as_ref() {
                Statement::While { .. } => depth += 1,
                Statement::Wend => depth -= 1,
                _ => {}
            }
            if depth == 0 {
                self.runtime.next_pc = Some(self.runtime.statements.next(&scan));
                return Ok(());
            }
        }
    }

    fn exec_wend(&mut self) -> Result<()> {
        for at in (0..self.runtime.exec_stack.len()).rev() {
            if let StackEntry::While { loop_pc } = self.runtime.exec_stack[at] {
                self.runtime.exec_stack.remove(at);
                self.runtime.next_pc = Some(loop_pc);
                return Ok(());
            }
        }
        Err(error!(WendWithoutWhile))
    }

    fn exec_return(&mut self, line: Option<LineNumber>) -> Result<()> {
        for at in (0..self.runtime.exec_stack.len()).rev() {
            if let StackEntry::Gosub { return_pc } = self.runtime.exec_stack[at] {
                // WHILE frames entered since the GOSUB are abandoned.
                self.runtime.exec_stack.truncate(at);
                match line {
                    Some(line) => self.jump_to(line)?,
                    None => self.runtime.next_pc = Some(return_pc),
                }
                return Ok(());
            }
        }
        Err(error!(ReturnWithoutGosub))
    }

    fn exec_resume(&mut self, kind: ResumeKind) -> Result<()> {
        self.runtime.set_variable("err%", Val::Integer(0))?;
        let error_pc = match self.runtime.error_pc {
            Some(pc) => pc,
            None => return Err(error!(ResumeWithoutError)),
        };
        match kind {
            ResumeKind::Implicit => self.runtime.next_pc = Some(error_pc),
            ResumeKind::Next => {
                self.runtime.next_pc = Some(self.runtime.statements.next(&error_pc))
            }
            ResumeKind::Line(line) => self.jump_to(line)?,
        }
        self.runtime.error_pc = None;
        Ok(())
    }

    fn exec_mid_assign(
        &mut self,
        variable: &Variable,
        start: &Expression,
        length: &Option<Expression>,
        value: &Expression,
    ) -> Result<()> {
        let current = match self.runtime.get_variable(&variable.name) {
            Val::String(s) => s,
            _ => return Err(error!(TypeMismatch)),
        };
        let replacement = self.eval_string(value)?;
        let start = self.eval(start)?.to_number() as i64 - 1;
        let mut chars: Vec<char> = current.chars().collect();
        let replacement: Vec<char> = replacement.chars().collect();
        let length = match length {
            Some(e) => self.eval(e)?.to_number().max(0.0) as usize,
            None => replacement.len(),
        };
        if start >= 0 && (start as usize) < chars.len() {
            let start = start as usize;
            // The string never grows.
            let length = length.min(chars.len() - start).min(replacement.len());
            chars[start..start + length].copy_from_slice(&replacement[..length]);
        }
        self.runtime
            .set_variable(&variable.name, Val::String(chars.into_iter().collect()))
    }

    // ========== Files ==========

    fn file_number(&mut self, expr: &Expression) -> Result<u16> {
        let n = self.eval(expr)?.to_number() as i64;
        if (1..=15).contains(&n) {
            Ok(n as u16)
        } else {
            Err(error!(BadFileNumber))
        }
    }

    fn write_file(&mut self, n: u16, text: &str) -> Result<()> {
        let entry = match self.runtime.files.get_mut(&n) {
            Some(entry) => entry,
            None => return Err(error!(BadFileNumber)),
        };
        let bytes = val::string_bytes(text);
        entry.handle.write(&bytes).map_err(|_| error!(DiskIoError))?;
        entry.handle.flush().map_err(|_| error!(DiskIoError))
    }

    fn read_file_line(&mut self, n: u16) -> Result<String> {
        let entry = match self.runtime.files.get_mut(&n) {
            Some(entry) => entry,
            None => return Err(error!(BadFileNumber)),
        };
        match entry.handle.read_line() {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(error!(InputPastEnd)),
            Err(_) => Err(error!(DiskIoError)),
        }
    }

    fn exec_open(
        &mut self,
        filename: &Expression,
        mode: FileMode,
        file_number: &Expression,
        record_length: &Option<Expression>,
    ) -> Result<()> {
        let path = self.eval_string(filename)?;
        if path.is_empty() {
            return Err(error!(BadFileName));
        }
        let n = self.file_number(file_number)?;
        if self.runtime.files.contains_key(&n) {
            return Err(error!(FileAlreadyOpen));
        }
        let record_length = match record_length {
            Some(e) => self.eval(e)?.to_number() as usize,
            None => 128,
        };
        match self.fs.open(&path, mode, record_length) {
            Some(handle) => {
                self.runtime.files.insert(
                    n,
                    FileEntry {
                        handle,
                        mode,
                        record_length,
                    },
                );
                Ok(())
            }
            None => Err(error!(FileNotFound; path)),
        }
    }

    fn exec_close(&mut self, files: &[Expression]) -> Result<()> {
        if files.is_empty() {
            self.runtime.files.clear();
            self.runtime.field_buffers.clear();
            return Ok(());
        }
        for expr in files {
            let n = self.eval(expr)?.to_number() as i64;
            if (1..=15).contains(&n) {
                self.runtime.files.remove(&(n as u16));
                self.runtime.field_buffers.remove(&(n as u16));
            }
        }
        Ok(())
    }

    fn exec_field(&mut self, file_number: &Expression, fields: &[FieldDef]) -> Result<()> {
        let n = self.file_number(file_number)?;
        let record_length = match self.runtime.files.get(&n) {
            Some(entry) => entry.record_length,
            None => return Err(error!(BadFileNumber)),
        };
        let mut mapped = vec![];
        let mut offset = 0;
        for field in fields {
            let width = self.eval(&field.width)?.to_number() as usize;
            mapped.push((field.variable.name.clone(), offset, width));
            offset += width;
        }
        if offset > record_length {
            return Err(error!(FieldOverflow));
        }
        for (name, _, width) in &mapped {
            self.runtime
                .set_variable(name, Val::String(" ".repeat(*width)))?;
        }
        self.runtime.field_buffers.insert(
            n,
            FieldBuffer {
                buffer: vec![b' '; offset],
                fields: mapped,
                current_record: 0,
            },
        );
        Ok(())
    }

    fn exec_get_put(
        &mut self,
        file_number: &Expression,
        record: &Option<Expression>,
        is_get: bool,
    ) -> Result<()> {
        let n = self.file_number(file_number)?;
        let record = match record {
            Some(e) => {
                let r = self.eval(e)?.to_number() as i64;
                if r < 1 {
                    return Err(error!(BadRecordNumber));
                }
                Some(r as usize)
            }
            None => None,
        };
        let (record_length, rec) = match self.runtime.field_buffers.get(&n) {
            Some(buffer) if !buffer.buffer.is_empty() => (
                buffer.buffer.len(),
                record.unwrap_or(buffer.current_record + 1),
            ),
            _ => return Err(error!(BadFileMode; "NO FIELD DEFINED")),
        };
        {
            let entry = match self.runtime.files.get_mut(&n) {
                Some(entry) => entry,
                None => return Err(error!(BadFileNumber)),
            };
            entry
                .handle
                .seek_record(rec, record_length)
                .map_err(|_| error!(DiskIoError))?;
        }

        if is_get {
            let mut data = vec![0u8; record_length];
            let read = {
                let entry = match self.runtime.files.get_mut(&n) {
                    Some(entry) => entry,
                    None => return Err(error!(BadFileNumber)),
                };
                entry
                    .handle
                    .read_raw(&mut data)
                    .map_err(|_| error!(DiskIoError))?
            };
            // Reads past EOF pad with spaces.
            for byte in data.iter_mut().skip(read) {
                *byte = b' ';
            }
            let published: Vec<(String, String)> = {
                let buffer = match self.runtime.field_buffers.get_mut(&n) {
                    Some(buffer) => buffer,
                    None => return Err(error!(InternalError; "MISSING FIELD BUFFER")),
                };
                buffer.buffer = data;
                buffer.current_record = rec;
                buffer
                    .fields
                    .iter()
                    .map(|(name, offset, width)| {
                        let slice = &buffer.buffer[*offset..*offset + *width];
                        (name.clone(), val::bytes_string(slice))
                    })
                    .collect()
            };
            for (name, text) in published {
                self.runtime.set_variable(&name, Val::String(text))?;
            }
        } else {
            let data = match self.runtime.field_buffers.get_mut(&n) {
                Some(buffer) => {
                    buffer.current_record = rec;
                    buffer.buffer.clone()
                }
                None => return Err(error!(InternalError; "MISSING FIELD BUFFER")),
            };
            let entry = match self.runtime.files.get_mut(&n) {
                Some(entry) => entry,
                None => return Err(error!(BadFileNumber)),
            };
            entry
                .handle
                .write_raw(&data)
                .map_err(|_| error!(DiskIoError))?;
            entry.handle.flush().map_err(|_| error!(DiskIoError))?;
        }
        Ok(())
    }

    /// LSET/RSET: justify into the owning field buffer, or fall back to a
    /// plain string assignment.
    fn exec_set_field(
        &mut self,
        variable: &Variable,
        value: &Expression,
        left_justify: bool,
    ) -> Result<()> {
        let text = self.eval_string(value)?;
        let mut found = None;
        for (n, buffer) in &self.runtime.field_buffers {
            if let Some((offset, width)) = buffer.find(&variable.name) {
                found = Some((*n, offset, width));
                break;
            }
        }
        let (n, offset, width) = match found {
            Some(f) => f,
            None => return self.runtime.set_variable(&variable.name, Val::String(text)),
        };
        let bytes = val::string_bytes(&text);
        let mut field = vec![b' '; width];
        let take = bytes.len().min(width);
        if left_justify {
            field[..take].copy_from_slice(&bytes[..take]);
        } else {
            field[width - take..].copy_from_slice(&bytes[bytes.len() - take..]);
        }
        match self.runtime.field_buffers.get_mut(&n) {
            Some(buffer) => buffer.buffer[offset..offset + width].copy_from_slice(&field),
            None => return Err(error!(InternalError; "MISSING FIELD BUFFER")),
        }
        self.runtime
            .set_variable(&variable.name, Val::String(val::bytes_string(&field)))
    }

    fn exec_merge(&mut self, filename: &Expression) -> Result<()> {
        let path = self.eval_string(filename)?;
        let mut handle = match self.fs.open(&path, FileMode::Input, 128) {
            Some(handle) => handle,
            None => return Err(error!(FileNotFound; path)),
        };
        let mut source = String::new();
        while let Some(line) = handle.read_line().map_err(|_| error!(DiskIoError))? {
            source.push_str(&line);
            source.push('\n');
        }
        let program = parse(&source)?;
        self.runtime.merge(program);
        Ok(())
    }

    fn exec_run(
        &mut self,
        filename: &Option<Expression>,
        start_line: Option<LineNumber>,
        keep_variables: bool,
    ) -> Result<()> {
        if let Some(filename) = filename {
            let filename = self.eval_string(filename)?;
            self.state.run_request = Some(RunRequest {
                filename,
                start_line,
                keep_variables,
            });
            self.runtime.pc.reason = StopReason::End;
            return Ok(());
        }
        if let Some(line) = start_line {
            let target = self.runtime.statements.find_line(line);
            if !self.runtime.statements.valid(&target) {
                return Err(error!(UndefinedLine; format!("{}", line)));
            }
            self.runtime.reset();
            self.runtime.next_pc = Some(target);
            return Ok(());
        }
        self.runtime.reset();
        let first = self.runtime.statements.first();
        if first.is_running() {
            self.runtime.next_pc = Some(first);
        } else {
            self.runtime.pc = first;
        }
        Ok(())
    }

    // ========== Expression evaluation ==========

    fn eval(&mut self, expr: &Expression) -> Result<Val> {
        match expr {
            Expression::Number(n) => Ok(Val::Double(*n)),
            Expression::String(s) => Ok(Val::String(s.clone())),
            Expression::Variable(v) => Ok(self.runtime.get_variable(&v.name)),
            Expression::Array(a) => {
                let indices = self.eval_indices(&a.indices)?;
                self.runtime.get_array(&a.name, &indices)
            }
            Expression::Unary(op, operand) => {
                let operand = self.eval(operand)?;
                Operation::unary(*op, operand)
            }
            Expression::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Operation::binary(*op, left, right)
            }
            Expression::Function(name, args) => self.eval_function(name, args),
        }
    }

    fn eval_string(&mut self, expr: &Expression) -> Result<String> {
        match self.eval(expr)? {
            Val::String(s) => Ok(s),
            _ => Err(error!(TypeMismatch)),
        }
    }

    fn eval_indices(&mut self, exprs: &[Expression]) -> Result<Vec<i32>> {
        let mut indices = Vec::with_capacity(exprs.len());
        for expr in exprs {
            indices.push(self.eval(expr)?.to_number() as i32);
        }
        Ok(indices)
    }

    fn get_lvalue(&mut self, lvalue: &Lvalue) -> Result<Val> {
        match lvalue {
            Lvalue::Variable(v) => Ok(self.runtime.get_variable(&v.name)),
            Lvalue::Array(a) => {
                let indices = self.eval_indices(&a.indices)?;
                self.runtime.get_array(&a.name, &indices)
            }
        }
    }

    fn set_lvalue(&mut self, lvalue: &Lvalue, value: Val) -> Result<()> {
        match lvalue {
            Lvalue::Variable(v) => self.runtime.set_variable(&v.name, value),
            Lvalue::Array(a) => {
                let indices = self.eval_indices(&a.indices)?;
                self.runtime.set_array(&a.name, &indices, value)
            }
        }
    }

    fn eval_function(&mut self, name: &str, arg_exprs: &[Expression]) -> Result<Val> {
        let mut args = Vec::with_capacity(arg_exprs.len());
        for expr in arg_exprs {
            args.push(self.eval(expr)?);
        }

        if name.starts_with("fn") && name.len() > 2 {
            return self.eval_user_function(name, args);
        }

        match name {
            "abs" => Function::abs(one(args)?),
            "atn" => Function::atn(one(args)?),
            "cos" => Function::cos(one(args)?),
            "exp" => Function::exp(one(args)?),
            "fix" => Function::fix(one(args)?),
            "int" => Function::int(one(args)?),
            "log" => Function::log(one(args)?),
            "sgn" => Function::sgn(one(args)?),
            "sin" => Function::sin(one(args)?),
            "sqr" => Function::sqr(one(args)?),
            "tan" => Function::tan(one(args)?),
            "rnd" => Function::rnd(&mut self.runtime.rnd, &args),
            "cint" => Function::cint(one(args)?),
            "csng" => Function::csng(one(args)?),
            "cdbl" => Function::cdbl(one(args)?),
            "asc" => Function::asc(one(args)?),
            "chr$" => Function::chr(one(args)?),
            "hex$" => Function::hex(one(args)?),
            "oct$" => Function::oct(one(args)?),
            "left$" => {
                let (s, n) = two(args)?;
                Function::left(s, n)
            }
            "right$" => {
                let (s, n) = two(args)?;
                Function::right(s, n)
            }
            "mid$" => Function::mid(args),
            "len" => Function::len(one(args)?),
            "str$" => Function::str(one(args)?),
            "val" => Function::val(one(args)?),
            "space$" => Function::space(one(args)?),
            "string$" => Function::string(args),
            "instr" => Function::instr(args),
            "cvi" => Function::cvi(one(args)?),
            "cvs" => Function::cvs(one(args)?),
            "cvd" => Function::cvd(one(args)?),
            "mki$" => Function::mki(one(args)?),
            "mks$" => Function::mks(one(args)?),
            "mkd$" => Function::mkd(one(args)?),
            "timer" => Function::timer(),
            "date$" => Function::date(),
            "time$" => Function::time(),
            "environ$" => Function::environ(one(args)?),
            "fre" => Function::fre(args.into_iter().next()),
            "tab" => Function::tab(self.console.column(), one(args)?),
            "spc" => Function::spc(one(args)?),
            "pos" => Ok(Val::Double((self.console.column() + 1) as f64)),
            "inkey$" => Ok(Val::String(match self.console.inkey() {
                Some(byte) => char::from(byte).to_string(),
                None => String::new(),
            })),
            "input$" => self.fn_input(args),
            "eof" => {
                let n = file_arg(one(args)?)?;
                let entry = match self.runtime.files.get_mut(&n) {
                    Some(entry) => entry,
                    None => return Err(error!(BadFileNumber)),
                };
                Ok(Val::Double(if entry.handle.eof() { -1.0 } else { 0.0 }))
            }
            "lof" => {
                let n = file_arg(one(args)?)?;
                let entry = match self.runtime.files.get_mut(&n) {
                    Some(entry) => entry,
                    None => return Err(error!(BadFileNumber)),
                };
                Ok(Val::Double(entry.handle.length() as f64))
            }
            "loc" => {
                let n = file_arg(one(args)?)?;
                let record_length = match self.runtime.field_buffers.get(&n) {
                    Some(buffer) if !buffer.buffer.is_empty() => Some(buffer.buffer.len()),
                    _ => None,
                };
                let entry = match self.runtime.files.get_mut(&n) {
                    Some(entry) => entry,
                    None => return Err(error!(BadFileNumber)),
                };
                let position = entry.handle.position();
                let block = match entry.mode {
                    FileMode::Random => record_length.unwrap_or(entry.record_length).max(1) as u64,
                    _ => 128,
                };
                Ok(Val::Double((position / block + 1) as f64))
            }
            "error$" => {
                let code = match args.first() {
                    Some(v) => v.to_number() as u16,
                    None => self.runtime.last_error_code,
                };
                Function::error_text(code)
            }
            // Hardware-proximate probes are inert.
            "peek" | "inp" | "lpos" | "usr" | "varptr" => Ok(Val::Double(0.0)),
            _ => Err(error!(UndefinedUserFunction; name.to_ascii_uppercase())),
        }
    }

    fn fn_input(&mut self, args: Vec<Val>) -> Result<Val> {
        let mut args = args.into_iter();
        let n = match args.next() {
            Some(v) => v.to_number() as i64,
            None => return Err(error!(IllegalFunctionCall)),
        };
        if n < 0 {
            return Err(error!(IllegalFunctionCall));
        }
        match args.next() {
            Some(file) => {
                let file = file_arg(file)?;
                let entry = match self.runtime.files.get_mut(&file) {
                    Some(entry) => entry,
                    None => return Err(error!(BadFileNumber)),
                };
                let bytes = entry
                    .handle
                    .read_chars(n as usize)
                    .map_err(|_| error!(DiskIoError))?;
                Ok(Val::String(val::bytes_string(&bytes)))
            }
            None => {
                let line = self.console.input("");
                Ok(Val::String(line.chars().take(n as usize).collect()))
            }
        }
    }

    fn eval_user_function(&mut self, name: &str, args: Vec<Val>) -> Result<Val> {
        let def = match self.runtime.user_functions.get(name) {
            Some(def) => Rc::clone(def),
            None => return Err(error!(UndefinedUserFunction; name.to_ascii_uppercase())),
        };
        let (params, body) = match def.as_ref() {
            Statement::DefFn { params, body, .. } => (params, body),
            _ => return Err(error!(InternalError; "NOT A FUNCTION")),
        };
        if args.len() != params.len() {
            return Err(error!(IllegalFunctionCall));
        }

        // Arguments shadow the caller's variables of the same names.
        let mut saved: Vec<(String, Option<Val>)> = Vec::with_capacity(params.len());
        for param in params {
            let old = if self.runtime.has_variable(param) {
                Some(self.runtime.get_variable(param))
            } else {
                None
            };
            saved.push((param.clone(), old));
        }
        let mut bind_result = Ok(());
        for (param, arg) in params.iter().zip(args) {
            bind_result = self.runtime.set_variable(param, arg);
            if bind_result.is_err() {
                break;
            }
        }
        let result = match bind_result {
            Ok(()) => self.eval(body),
            Err(e) => Err(e),
        };
        for (param, old) in saved {
            match old {
                Some(value) => {
                    let _ = self.runtime.set_variable(&param, value);
                }
                None => {
                    self.runtime.remove_variable(&param);
                }
            }
        }
        result
    }
}

fn one(args: Vec<Val>) -> Result<Val> {
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(error!(IllegalFunctionCall)),
    }
}

fn two(args: Vec<Val>) -> Result<(Val, Val)> {
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(error!(IllegalFunctionCall)),
    }
}

fn file_arg(val: Val) -> Result<u16> {
    let n = val.to_number() as i64;
    if (1..=15).contains(&n) {
        Ok(n as u16)
    } else {
        Err(error!(BadFileNumber))
    }
}
