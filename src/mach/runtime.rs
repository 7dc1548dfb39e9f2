use super::file::FileHandle;
use super::function::RndState;
use super::program::{Pc, StatementTable};
use super::val::Val;
use super::var::Var;
use crate::lang::ast::{DataItem, FileMode, Program, Statement, VarType};
use crate::lang::{Error, LineNumber};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// A FOR loop in flight. `resume_pc` is the statement after the FOR
/// header; NEXT jumps there to continue.
#[derive(Debug, Clone)]
pub struct ForState {
    pub resume_pc: Pc,
    pub end: f64,
    pub step: f64,
}

/// GOSUB/WHILE execution stack entry.
#[derive(Debug, Clone, Copy)]
pub enum StackEntry {
    Gosub { return_pc: Pc },
    While { loop_pc: Pc },
}

/// An open file: the port handle plus what OPEN said about it.
pub struct FileEntry {
    pub handle: Box<dyn FileHandle>,
    pub mode: FileMode,
    pub record_length: usize,
}

/// The byte workspace FIELD binds to a RANDOM file, exposed through
/// string variables.
#[derive(Debug, Default)]
pub struct FieldBuffer {
    pub buffer: Vec<u8>,
    /// name -> (offset, width), in declaration order.
    pub fields: Vec<(String, usize, usize)>,
    pub current_record: usize,
}

impl FieldBuffer {
    pub fn find(&self, name: &str) -> Option<(usize, usize)> {
        self.fields
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, offset, width)| (*offset, *width))
    }
}

/// ## Runtime state
///
/// Everything the interpreter mutates: stores, stacks, the DATA cursor,
/// open files, error trapping, and the PRNG. One Runtime per program run.

pub struct Runtime {
    pub pc: Pc,
    pub next_pc: Option<Pc>,
    pub statements: StatementTable,

    pub exec_stack: Vec<StackEntry>,
    /// FOR records in activation order; a bare NEXT closes the last one.
    pub for_states: Vec<(String, ForState)>,

    data_values: Vec<Val>,
    pub data_ptr: usize,
    data_line_map: BTreeMap<LineNumber, usize>,

    pub user_functions: HashMap<String, Rc<Statement>>,

    pub files: HashMap<u16, FileEntry>,
    pub field_buffers: HashMap<u16, FieldBuffer>,

    pub error_handler_line: Option<LineNumber>,
    pub error_handler_is_gosub: bool,
    pub error_pc: Option<Pc>,
    pub last_error_code: u16,
    pub last_error_line: LineNumber,

    pub array_base: i32,
    pub trace_on: bool,
    pub break_requested: bool,
    pub breakpoints: BTreeSet<Pc>,
    pub common_vars: Vec<String>,
    pub rnd: RndState,

    def_types: HashMap<char, VarType>,
    vars: Var,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime {
            pc: Pc::halted(super::program::StopReason::End),
            next_pc: None,
            statements: StatementTable::new(),
            exec_stack: vec![],
            for_states: vec![],
            data_values: vec![],
            data_ptr: 0,
            data_line_map: BTreeMap::new(),
            user_functions: HashMap::new(),
            files: HashMap::new(),
            field_buffers: HashMap::new(),
            error_handler_line: None,
            error_handler_is_gosub: false,
            error_pc: None,
            last_error_code: 0,
            last_error_line: 0,
            array_base: 0,
            trace_on: false,
            break_requested: false,
            breakpoints: BTreeSet::new(),
            common_vars: vec![],
            rnd: RndState::new(),
            def_types: HashMap::new(),
            vars: Var::new(),
        }
    }

    /// Populates the runtime from a parsed program: statement table, DATA
    /// pool, FN table, DEFtype map, PC at the first statement.
    pub fn load(&mut self, program: Program) {
        self.def_types = program.def_types.clone();
        self.statements.build(program);
        self.collect_data();
        self.collect_functions();
        self.pc = self.statements.first();
        self.next_pc = None;
    }

    /// Adds or replaces whole lines at runtime (the `MERGE` statement).
    /// The DATA pool and FN table are not re-collected.
    pub fn merge(&mut self, program: Program) {
        self.statements.merge(program);
    }

    fn collect_data(&mut self) {
        self.data_values.clear();
        self.data_line_map.clear();
        let mut collected: Vec<(LineNumber, Vec<Val>)> = vec![];
        for (line, _, statement) in self.statements.iter() {
            if let Statement::Data { values } = statement.as_ref() {
                let vals = values
                    .iter()
                    .map(|item| match item {
                        DataItem::Number(n) => Val::Double(*n),
                        DataItem::String(s) => Val::String(s.clone()),
                    })
                    .collect();
                collected.push((line, vals));
            }
        }
        for (line, mut vals) in collected {
            self.data_line_map.entry(line).or_insert(self.data_values.len());
            self.data_values.append(&mut vals);
        }
        self.data_ptr = 0;
    }

    fn collect_functions(&mut self) {
        self.user_functions.clear();
        let mut found: Vec<(String, Rc<Statement>)> = vec![];
        for (_, _, statement) in self.statements.iter() {
            if let Statement::DefFn { name, .. } = statement.as_ref() {
                found.push((name.clone(), Rc::clone(statement)));
            }
        }
        // Later definitions silently replace earlier ones.
        for (name, statement) in found {
            self.user_functions.insert(name, statement);
        }
    }

    /// Full reset for RUN: variables, stacks, files, DATA cursor, error
    /// state. The program itself stays loaded.
    pub fn reset(&mut self) {
        self.vars.clear();
        self.pc = self.statements.first();
        self.next_pc = None;
        self.exec_stack.clear();
        self.for_states.clear();
        self.data_ptr = 0;
        self.array_base = 0;
        self.trace_on = false;
        self.break_requested = false;
        self.error_handler_line = None;
        self.error_handler_is_gosub = false;
        self.error_pc = None;
        self.files.clear();
        self.field_buffers.clear();
    }

    /// The CLEAR statement: like `reset` but the PC stays put and user
    /// functions and breakpoints survive.
    pub fn clear_state(&mut self) {
        self.vars.clear();
        self.exec_stack.clear();
        self.for_states.clear();
        self.data_ptr = 0;
        self.error_handler_line = None;
        self.error_handler_is_gosub = false;
        self.error_pc = None;
        self.files.clear();
        self.field_buffers.clear();
    }

    // ========== Variables ==========

    pub fn resolve_type(&self, name: &str) -> VarType {
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

    pub fn get_variable(&self, name: &str) -> Val {
        self.vars.fetch(name, self.resolve_type(name))
    }

    pub fn set_variable(&mut self, name: &str, value: Val) -> Result<()> {
        self.vars.store(name, self.resolve_type(name), value)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.vars.has(name)
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Val> {
        self.vars.remove(name)
    }

    // ========== Arrays ==========

    pub fn get_array(&mut self, name: &str, indices: &[i32]) -> Result<Val> {
        let var_type = self.resolve_type(name);
        self.vars
            .fetch_element(name, indices, var_type, self.array_base)
    }

    pub fn set_array(&mut self, name: &str, indices: &[i32], value: Val) -> Result<()> {
        let var_type = self.resolve_type(name);
        self.vars
            .store_element(name, indices, value, var_type, self.array_base)
    }

    pub fn dim_array(&mut self, name: &str, dimensions: Vec<i32>, var_type: VarType) -> Result<()> {
        self.vars
            .dimension(name, dimensions, var_type, self.array_base)
    }

    pub fn erase_array(&mut self, name: &str) {
        self.vars.erase(name);
    }

    pub fn has_array(&self, name: &str) -> bool {
        self.vars.has_array(name)
    }

    // ========== DATA ==========

    pub fn read_data(&mut self) -> Result<Val> {
        match self.data_values.get(self.data_ptr) {
            Some(value) => {
                self.data_ptr += 1;
                Ok(value.clone())
            }
            None => Err(error!(OutOfData)),
        }
    }

    pub fn restore_data(&mut self, line: Option<LineNumber>) {
        match line {
            None => self.data_ptr = 0,
            Some(line) => {
                // RESTORE n lands on the first DATA at or after line n.
                match self.data_line_map.range(line..).next() {
                    Some((_, index)) => self.data_ptr = *index,
                    None => self.data_ptr = self.data_values.len(),
                }
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Runtime {
        Runtime::new()
    }
}
