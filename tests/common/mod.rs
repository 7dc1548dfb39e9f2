#![allow(dead_code)]

use mbasic::lang::parse;
use mbasic::mach::file::NativeFileSystem;
use mbasic::mach::io::{advance_column, Console};
use mbasic::mach::{Interpreter, Runtime};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const MAX_TICKS: usize = 200_000;

/// Console port for tests: captures output, serves scripted input lines
/// and key presses.
pub struct TestConsole {
    output: Rc<RefCell<String>>,
    inputs: VecDeque<String>,
    keys: VecDeque<u8>,
    column: usize,
    width: usize,
}

impl TestConsole {
    pub fn new(output: Rc<RefCell<String>>, inputs: &[&str], keys: &[u8]) -> TestConsole {
        TestConsole {
            output,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            keys: keys.iter().copied().collect(),
            column: 0,
            width: 80,
        }
    }
}

impl Console for TestConsole {
    fn print(&mut self, text: &str) {
        self.output.borrow_mut().push_str(text);
        self.column = advance_column(self.column, text);
    }

    fn input(&mut self, prompt: &str) -> String {
        self.print(prompt);
        self.column = 0;
        self.inputs.pop_front().unwrap_or_default()
    }

    fn inkey(&mut self) -> Option<u8> {
        self.keys.pop_front()
    }

    fn column(&self) -> usize {
        self.column
    }

    fn set_column(&mut self, column: usize) {
        self.column = column;
    }

    fn width(&self) -> usize {
        self.width
    }

    fn set_width(&mut self, width: usize) {
        self.width = width;
    }
}

/// Runs a program to completion and returns everything it printed.
/// An unhandled error is appended the way the driver reports it.
pub fn run(source: &str) -> String {
    let (output, _) = run_with(source, &[], &[]);
    output
}

pub fn run_with_input(source: &str, inputs: &[&str]) -> String {
    let (output, _) = run_with(source, inputs, &[]);
    output
}

pub fn run_with_keys(source: &str, keys: &[u8]) -> String {
    let (output, _) = run_with(source, &[], keys);
    output
}

pub fn run_with(source: &str, inputs: &[&str], keys: &[u8]) -> (String, Interpreter) {
    let mut runtime = Runtime::new();
    match parse(source) {
        Ok(program) => runtime.load(program),
        Err(error) => {
            let runtime = Runtime::new();
            let interpreter = Interpreter::new(runtime);
            return (format!("?{}\n", error), interpreter);
        }
    }
    let output = Rc::new(RefCell::new(String::new()));
    let console = TestConsole::new(Rc::clone(&output), inputs, keys);
    let mut interpreter =
        Interpreter::with_ports(runtime, Box::new(console), Box::new(NativeFileSystem));
    for _ in 0..MAX_TICKS {
        if !interpreter.tick() {
            break;
        }
    }
    let mut text = output.borrow().clone();
    if let Some(info) = &interpreter.state().error {
        text.push_str(&format!("?{}\n", info.message));
    }
    (text, interpreter)
}

/// A scratch path unique to this test process.
pub fn temp_path(name: &str) -> String {
    let mut path = std::env::temp_dir();
    path.push(format!("mbasic-test-{}-{}", std::process::id(), name));
    path.to_string_lossy().into_owned()
}

pub fn remove_temp(path: &str) {
    let _ = std::fs::remove_file(path);
}
