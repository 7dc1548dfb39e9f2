use crate::lang::ast::{Program, Statement};
use crate::lang::LineNumber;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Why the program counter is not advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Running,
    End,
    Stop,
    Breakpoint,
    Error,
    Input,
    Break,
}

/// Program counter. Statements are addressed as (line, index-within-line);
/// only a `Running` PC advances.
#[derive(Debug, Clone, Copy)]
pub struct Pc {
    pub line: LineNumber,
    pub stmt: usize,
    pub reason: StopReason,
}

impl Pc {
    pub fn running_at(line: LineNumber, stmt: usize) -> Pc {
        Pc {
            line,
            stmt,
            reason: StopReason::Running,
        }
    }

    pub fn halted(reason: StopReason) -> Pc {
        Pc {
            line: 0,
            stmt: 0,
            reason,
        }
    }

    pub fn is_running(&self) -> bool {
        self.reason == StopReason::Running
    }

    pub fn is_halted(&self) -> bool {
        !self.is_running()
    }
}

// Ordering ignores the halt reason; breakpoints compare by address.
impl PartialEq for Pc {
    fn eq(&self, other: &Pc) -> bool {
        self.line == other.line && self.stmt == other.stmt
    }
}

impl Eq for Pc {}

impl PartialOrd for Pc {
    fn partial_cmp(&self, other: &Pc) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pc {
    fn cmp(&self, other: &Pc) -> std::cmp::Ordering {
        (self.line, self.stmt).cmp(&(other.line, other.stmt))
    }
}

/// ## The flattened, addressable program
///
/// Owns every statement for the life of a run; PCs are indices into this
/// table, so `MERGE` never leaves anything dangling.

#[derive(Debug, Default)]
pub struct StatementTable {
    table: BTreeMap<(LineNumber, usize), Rc<Statement>>,
    line_numbers: Vec<LineNumber>,
    line_first_stmt: HashMap<LineNumber, usize>,
    line_text: HashMap<LineNumber, String>,
}

impl StatementTable {
    pub fn new() -> StatementTable {
        StatementTable::default()
    }

    pub fn build(&mut self, program: Program) {
        self.table.clear();
        self.line_numbers.clear();
        self.line_first_stmt.clear();
        self.line_text.clear();
        for line in program.lines {
            self.insert_line(line.number, line.statements, line.source);
        }
    }

    /// Adds or replaces whole lines (the `MERGE` statement).
    pub fn merge(&mut self, program: Program) {
        for line in program.lines {
            let number = line.number;
            let old: Vec<(LineNumber, usize)> = self
                .table
                .range((number, 0)..(number, usize::max_value()))
                .map(|(key, _)| *key)
                .collect();
            for key in old {
                self.table.remove(&key);
            }
            self.line_numbers.retain(|n| *n != number);
            self.line_first_stmt.remove(&number);
            self.line_text.remove(&number);
            self.insert_line(number, line.statements, line.source);
        }
    }

    fn insert_line(&mut self, number: LineNumber, statements: Vec<Statement>, source: String) {
        if statements.is_empty() {
            return;
        }
        match self.line_numbers.binary_search(&number) {
            Ok(_) => {}
            Err(at) => self.line_numbers.insert(at, number),
        }
        self.line_first_stmt.insert(number, 0);
        self.line_text.insert(number, source);
        for (index, statement) in statements.into_iter().enumerate() {
            self.table.insert((number, index), Rc::new(statement));
        }
    }

    pub fn get(&self, pc: &Pc) -> Option<Rc<Statement>> {
        self.table.get(&(pc.line, pc.stmt)).cloned()
    }

    pub fn first(&self) -> Pc {
        match self.line_numbers.first() {
            Some(line) => Pc::running_at(*line, 0),
            None => Pc::halted(StopReason::End),
        }
    }

    pub fn next(&self, current: &Pc) -> Pc {
        if self.table.contains_key(&(current.line, current.stmt + 1)) {
            return Pc::running_at(current.line, current.stmt + 1);
        }
        match self.line_numbers.binary_search(&current.line) {
            Ok(at) | Err(at) => {
                let at = if self.line_numbers.get(at) == Some(&current.line) {
                    at + 1
                } else {
                    at
                };
                match self.line_numbers.get(at) {
                    Some(line) => Pc::running_at(*line, 0),
                    None => Pc::halted(StopReason::End),
                }
            }
        }
    }

    pub fn find_line(&self, line: LineNumber) -> Pc {
        match self.line_first_stmt.get(&line) {
            Some(stmt) => Pc::running_at(line, *stmt),
            None => Pc::halted(StopReason::Error),
        }
    }

    pub fn valid(&self, pc: &Pc) -> bool {
        self.table.contains_key(&(pc.line, pc.stmt))
    }

    pub fn line_text(&self, line: LineNumber) -> &str {
        match self.line_text.get(&line) {
            Some(text) => text,
            None => "",
        }
    }

    /// Statements in program order.
    pub fn iter(&self) -> impl Iterator<Item = (LineNumber, usize, &Rc<Statement>)> {
        self.table
            .iter()
            .map(|((line, stmt), statement)| (*line, *stmt, statement))
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse;

    fn table_of(source: &str) -> StatementTable {
        let mut table = StatementTable::new();
        table.build(parse(source).unwrap());
        table
    }

    #[test]
    fn test_first_and_next() {
        let table = table_of("10 A=1:B=2\n20 C=3\n");
        let pc = table.first();
        assert_eq!(pc, Pc::running_at(10, 0));
        let pc = table.next(&pc);
        assert_eq!(pc, Pc::running_at(10, 1));
        let pc = table.next(&pc);
        assert_eq!(pc, Pc::running_at(20, 0));
        assert!(table.next(&pc).is_halted());
    }

    #[test]
    fn test_find_line() {
        let table = table_of("10 A=1\n20 B=2\n");
        assert!(table.valid(&table.find_line(20)));
        assert!(table.find_line(15).is_halted());
    }

    #[test]
    fn test_merge_replaces_whole_lines() {
        let mut table = table_of("10 A=1:B=2\n20 C=3\n");
        table.merge(parse("10 D=4\n15 E=5\n").unwrap());
        assert!(table.valid(&Pc::running_at(10, 0)));
        assert!(!table.valid(&Pc::running_at(10, 1)));
        let pc = table.next(&Pc::running_at(10, 0));
        assert_eq!(pc, Pc::running_at(15, 0));
    }

    #[test]
    fn test_empty_program() {
        let table = StatementTable::new();
        assert!(table.first().is_halted());
        assert!(table.is_empty());
    }
}
