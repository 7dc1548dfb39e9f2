//! Non-interactive driver: loads a program, runs the tick loop, honors
//! Ctrl-C and the chain/run requests the interpreter publishes.

extern crate ansi_term;
extern crate ctrlc;

use ansi_term::Style;
use mbasic::lang::{parse, Error, ErrorCode};
use mbasic::mach::{ChainRequest, Interpreter, Runtime, RunRequest, StopReason, Val};
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const TICKS_PER_POLL: usize = 5000;

fn main() {
    let mut args = std::env::args();
    let _executable = args.next();
    let filename = match (args.next(), args.next()) {
        (Some(filename), None) => filename,
        _ => {
            eprintln!("Usage: mbasic FILENAME");
            exit(1);
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).is_err() {
        eprintln!("unable to install break handler");
    }

    match run_file(&filename, &interrupted) {
        Ok(code) => exit(code),
        Err(error) => {
            report(&error);
            exit(1);
        }
    }
}

fn run_file(filename: &str, interrupted: &Arc<AtomicBool>) -> Result<i32, Error> {
    let mut runtime = Runtime::new();
    runtime.load(parse(&read_source(filename)?)?);
    let mut interpreter = Interpreter::new(runtime);

    loop {
        for _ in 0..TICKS_PER_POLL {
            if !interpreter.tick() {
                break;
            }
        }
        if interrupted.swap(false, Ordering::SeqCst) {
            interpreter.runtime_mut().break_requested = true;
            continue;
        }
        let pc = interpreter.runtime().pc;
        match pc.reason {
            StopReason::Running | StopReason::Input => continue,
            StopReason::End => {
                if let Some(request) = interpreter.take_run_request() {
                    interpreter = handle_run(interpreter, request)?;
                    continue;
                }
                if let Some(request) = interpreter.take_chain_request() {
                    interpreter = handle_chain(interpreter, request)?;
                    continue;
                }
                return Ok(0);
            }
            StopReason::Stop | StopReason::Breakpoint => {
                println!("Break in {}", pc.line);
                return Ok(0);
            }
            StopReason::Break => {
                println!("^C");
                return Ok(0);
            }
            StopReason::Error => {
                if let Some(info) = &interpreter.state().error {
                    eprintln!("?{}", Style::new().bold().paint(info.message.clone()));
                }
                return Ok(1);
            }
        }
    }
}

fn handle_run(interpreter: Interpreter, request: RunRequest) -> Result<Interpreter, Error> {
    let mut runtime = interpreter.into_runtime();
    let program = parse(&read_source(&request.filename)?)?;
    runtime.load(program);
    if !request.keep_variables {
        runtime.reset();
    }
    if let Some(line) = request.start_line {
        let target = runtime.statements.find_line(line);
        if runtime.statements.valid(&target) {
            runtime.pc = target;
        }
    }
    Ok(Interpreter::new(runtime))
}

fn handle_chain(interpreter: Interpreter, request: ChainRequest) -> Result<Interpreter, Error> {
    let mut runtime = interpreter.into_runtime();
    let program = parse(&read_source(&request.filename)?)?;
    if request.merge {
        runtime.merge(program);
        runtime.pc = runtime.statements.first();
    } else if request.all {
        runtime.load(program);
    } else {
        // Plain CHAIN carries only the COMMON variables across.
        let common: Vec<(String, Val)> = runtime
            .common_vars
            .iter()
            .map(|name| (name.clone(), runtime.get_variable(name)))
            .collect();
        runtime.load(program);
        runtime.reset();
        for (name, value) in common {
            let _ = runtime.set_variable(&name, value);
        }
    }
    if let Some(line) = request.line_number {
        let target = runtime.statements.find_line(line);
        if runtime.statements.valid(&target) {
            runtime.pc = target;
        }
    }
    Ok(Interpreter::new(runtime))
}

fn read_source(filename: &str) -> Result<String, Error> {
    std::fs::read_to_string(filename)
        .map_err(|_| Error::new(ErrorCode::FileNotFound).with_message(filename.to_string()))
}

fn report(error: &Error) {
    eprintln!("?{}", Style::new().bold().paint(error.to_string()));
}
