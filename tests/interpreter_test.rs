mod common;
use common::*;

#[test]
fn test_hello_for_loop() {
    let output = run(r#"10 PRINT "Hello, World!"
20 FOR I=1 TO 3
30 PRINT "Count:"; I
40 NEXT I
50 END
"#);
    assert_eq!(output, "Hello, World!\nCount: 1 \nCount: 2 \nCount: 3 \n");
}

#[test]
fn test_gosub_and_return() {
    let output = run(r#"10 A=10 : B=20
20 GOSUB 100
30 PRINT S
40 END
100 S = A + B : RETURN
"#);
    assert_eq!(output, " 30 \n");
}

#[test]
fn test_gosub_balance() {
    let (_, interpreter) = run_with(
        r#"10 GOSUB 100
20 GOSUB 100
30 END
100 RETURN
"#,
        &[],
        &[],
    );
    assert!(interpreter.runtime().exec_stack.is_empty());
}

#[test]
fn test_return_without_gosub() {
    let output = run("10 RETURN\n");
    assert_eq!(output, "?RETURN WITHOUT GOSUB IN 10\n");
}

#[test]
fn test_data_read_restore() {
    let output = run(r#"10 READ A,B,C : PRINT A+B+C
20 RESTORE : READ X : PRINT X
30 DATA 1,2,3
40 END
"#);
    assert_eq!(output, " 6 \n 1 \n");
}

#[test]
fn test_out_of_data() {
    let output = run("10 READ A\n20 READ B\n30 DATA 7\n");
    assert_eq!(output, "?OUT OF DATA IN 20\n");
}

#[test]
fn test_restore_to_line() {
    let output = run(r#"10 DATA 1
20 DATA 2
30 RESTORE 20 : READ A : PRINT A
40 END
"#);
    assert_eq!(output, " 2 \n");
}

#[test]
fn test_on_error_resume_next() {
    let output = run(r#"10 ON ERROR GOTO 100
20 A = 1/0
30 PRINT "no"
40 END
100 PRINT "err"; ERR; "at"; ERL : RESUME NEXT
"#);
    assert_eq!(output, "err 11 at 20 \nno\n");
}

#[test]
fn test_resume_retries_statement() {
    let output = run(r#"10 ON ERROR GOTO 100
20 A = 10 / D
30 PRINT A
40 END
100 D = 2 : RESUME
"#);
    assert_eq!(output, " 5 \n");
}

#[test]
fn test_resume_to_line() {
    let output = run(r#"10 ON ERROR GOTO 100
20 X = X + 1
30 A = 1 / 0
40 PRINT "after"; X
50 END
100 IF X < 3 THEN RESUME 20
110 RESUME NEXT
"#);
    assert_eq!(output, "after 3 \n");
}

#[test]
fn test_resume_without_error() {
    let output = run("10 RESUME\n");
    assert_eq!(output, "?RESUME WITHOUT ERROR IN 10\n");
}

#[test]
fn test_error_statement_is_trappable() {
    let output = run(r#"10 ON ERROR GOTO 100
20 ERROR 4
30 END
100 PRINT ERR : RESUME NEXT
"#);
    assert_eq!(output, " 4 \n");
}

#[test]
fn test_untrapped_error_halts() {
    let output = run("10 PRINT \"a\"\n20 A = 1/0\n30 PRINT \"b\"\n");
    assert_eq!(output, "a\n?DIVISION BY ZERO IN 20\n");
}

#[test]
fn test_on_error_goto_zero_disables() {
    let output = run(r#"10 ON ERROR GOTO 100
20 ON ERROR GOTO 0
30 A = 1/0
40 END
100 PRINT "handled" : RESUME NEXT
"#);
    assert_eq!(output, "?DIVISION BY ZERO IN 30\n");
}

#[test]
fn test_while_wend_string_building() {
    let output = run(r#"10 S$="" : I=0
20 WHILE I < 5
30 S$ = S$ + "*" : I = I + 1
40 WEND
50 PRINT S$; LEN(S$)
"#);
    assert_eq!(output, "***** 5 \n");
}

#[test]
fn test_while_false_skips_nested() {
    let output = run(r#"10 A=0
20 WHILE A > 0
30 WHILE 1
40 WEND
50 WEND
60 PRINT "out"
"#);
    assert_eq!(output, "out\n");
}

#[test]
fn test_wend_without_while() {
    let output = run("10 WEND\n");
    assert_eq!(output, "?WEND WITHOUT WHILE IN 10\n");
}

#[test]
fn test_for_empty_range_skips_body() {
    let output = run(r#"10 FOR I=5 TO 1
20 PRINT "body"
30 NEXT I
40 PRINT "done"
"#);
    assert_eq!(output, "done\n");
}

#[test]
fn test_for_negative_step() {
    let output = run(r#"10 FOR I=3 TO 1 STEP -1
20 PRINT I;
30 NEXT
40 END
"#);
    assert_eq!(output, " 3  2  1 ");
}

#[test]
fn test_for_loop_values() {
    let output = run(r#"10 FOR I=2 TO 8 STEP 3
20 PRINT I;
30 NEXT I
40 PRINT I
"#);
    // After the loop the variable has stepped past the bound.
    assert_eq!(output, " 2  5  8  11 \n");
}

#[test]
fn test_nested_for_with_shared_next() {
    let output = run(r#"10 FOR I=1 TO 2
20 FOR J=1 TO 2
30 PRINT I; J
40 NEXT J, I
50 END
"#);
    assert_eq!(output, " 1  1 \n 1  2 \n 2  1 \n 2  2 \n");
}

#[test]
fn test_next_without_for() {
    let output = run("10 NEXT I\n");
    assert_eq!(output, "?NEXT WITHOUT FOR IN 10\n");
}

#[test]
fn test_goto_and_undefined_line() {
    let output = run("10 GOTO 30\n20 PRINT \"skipped\"\n30 PRINT \"here\"\n");
    assert_eq!(output, "here\n");
    let output = run("10 GOTO 99\n");
    assert_eq!(output, "?UNDEFINED LINE NUMBER; 99 IN 10\n");
}

#[test]
fn test_if_then_else() {
    let output = run("10 IF 1 THEN PRINT \"one\" ELSE PRINT \"two\"\n");
    assert_eq!(output, "one\n");
    let output = run("10 IF 0 THEN PRINT \"one\" ELSE PRINT \"two\"\n");
    assert_eq!(output, "two\n");
}

#[test]
fn test_if_then_line_numbers() {
    let output = run(r#"10 IF 2 > 1 THEN 40
20 PRINT "fell"
30 END
40 PRINT "jumped"
"#);
    assert_eq!(output, "jumped\n");
}

#[test]
fn test_if_inline_statements_stop_after_jump() {
    let output = run(r#"10 IF 1 THEN GOTO 40 : PRINT "never"
20 END
40 PRINT "target"
"#);
    assert_eq!(output, "target\n");
}

#[test]
fn test_on_goto() {
    let source = |n: i32| {
        format!(
            "10 X={}\n20 ON X GOTO 100,200\n30 PRINT \"fell\"\n40 END\n100 PRINT \"one\"\n110 END\n200 PRINT \"two\"\n210 END\n",
            n
        )
    };
    assert_eq!(run(&source(1)), "one\n");
    assert_eq!(run(&source(2)), "two\n");
    assert_eq!(run(&source(3)), "fell\n");
    assert_eq!(run(&source(0)), "fell\n");
}

#[test]
fn test_on_gosub() {
    let output = run(r#"10 ON 2 GOSUB 100,200
20 PRINT "back"
30 END
100 PRINT "one" : RETURN
200 PRINT "two" : RETURN
"#);
    assert_eq!(output, "two\nback\n");
}

#[test]
fn test_def_fn_shadows_parameters() {
    let output = run(r#"10 X = 5
20 DEF FNA(X) = X * 2
30 PRINT FNA(3); X
"#);
    assert_eq!(output, " 6  5 \n");
}

#[test]
fn test_def_fn_two_token_form() {
    let output = run(r#"10 DEF FN D(A, B) = A - B
20 PRINT FN D(9, 4)
"#);
    assert_eq!(output, " 5 \n");
}

#[test]
fn test_undefined_user_function() {
    let output = run("10 PRINT FNZ(1)\n");
    assert_eq!(output, "?UNDEFINED USER FUNCTION; FNZ IN 10\n");
}

#[test]
fn test_deftype_integer_rounding() {
    let output = run("10 DEFINT N\n20 N = 2.5\n30 PRINT N\n");
    assert_eq!(output, " 2 \n");
}

#[test]
fn test_suffixed_variables_are_distinct() {
    let output = run(r#"10 A = 1.5
20 A% = 2
30 A$ = "x"
40 PRINT A; A%; A$
"#);
    assert_eq!(output, " 1.5  2 x\n");
}

#[test]
fn test_type_mismatch_on_assignment() {
    let output = run("10 A = \"text\"\n");
    assert_eq!(output, "?TYPE MISMATCH IN 10\n");
}

#[test]
fn test_swap() {
    let output = run("10 A=1 : B=2\n20 SWAP A, B\n30 PRINT A; B\n");
    assert_eq!(output, " 2  1 \n");
}

#[test]
fn test_mid_assignment_keeps_length() {
    let output = run(r#"10 A$="ABCDEF"
20 MID$(A$,2,3)="XYZQ"
30 PRINT A$; LEN(A$)
"#);
    assert_eq!(output, "AXYZEF 6 \n");
}

#[test]
fn test_string_relational_operators() {
    let output = run(r#"10 IF "ABC" < "ABD" THEN PRINT "lt"
20 IF "B" >= "A" THEN PRINT "ge"
30 IF "A" = "A" THEN PRINT "eq"
"#);
    assert_eq!(output, "lt\nge\neq\n");
}

#[test]
fn test_unary_minus_binds_looser_than_power() {
    let output = run("10 PRINT -2^2\n");
    assert_eq!(output, "-4 \n");
}

#[test]
fn test_integer_division_and_mod() {
    let output = run("10 PRINT 7\\2; 7 MOD 2\n");
    assert_eq!(output, " 3  1 \n");
}

#[test]
fn test_dim_and_subscript_checks() {
    let output = run(r#"10 DIM A(2,2)
20 A(2,2) = 9
30 PRINT A(2,2)
"#);
    assert_eq!(output, " 9 \n");
    let output = run("10 DIM A(2)\n20 A(3) = 1\n");
    assert_eq!(output, "?SUBSCRIPT OUT OF RANGE IN 20\n");
    let output = run("10 DIM A(2)\n20 DIM A(5)\n");
    assert_eq!(output, "?DUPLICATE DEFINITION IN 20\n");
}

#[test]
fn test_auto_dimension_to_ten() {
    let output = run("10 A(10) = 1\n20 PRINT A(10)\n");
    assert_eq!(output, " 1 \n");
    let output = run("10 A(11) = 1\n");
    assert_eq!(output, "?SUBSCRIPT OUT OF RANGE IN 10\n");
}

#[test]
fn test_option_base_one() {
    let output = run(r#"10 OPTION BASE 1
20 DIM A(3)
30 A(1)=1 : A(3)=3
40 PRINT A(1)+A(3)
"#);
    assert_eq!(output, " 4 \n");
    let output = run("10 OPTION BASE 1\n20 DIM A(3)\n30 A(0)=1\n");
    assert_eq!(output, "?SUBSCRIPT OUT OF RANGE IN 30\n");
}

#[test]
fn test_erase_allows_redim() {
    let output = run(r#"10 DIM A(2)
20 ERASE A
30 DIM A(5)
40 A(5) = 7 : PRINT A(5)
"#);
    assert_eq!(output, " 7 \n");
}

#[test]
fn test_clear_preserves_program_flow() {
    let output = run(r#"10 A=5 : B$(1)="x"
20 CLEAR
30 PRINT A; B$(1); "done"
"#);
    assert_eq!(output, " 0 done\n");
}

#[test]
fn test_stop_reason() {
    let (output, interpreter) = run_with("10 PRINT \"before\"\n20 STOP\n30 PRINT \"after\"\n", &[], &[]);
    assert_eq!(output, "before\n");
    assert_eq!(
        interpreter.runtime().pc.reason,
        mbasic::mach::StopReason::Stop
    );
    assert_eq!(interpreter.runtime().pc.line, 20);
}

#[test]
fn test_end_inside_handler_is_no_resume() {
    let output = run(r#"10 ON ERROR GOTO 100
20 A = 1/0
30 PRINT "no"
100 END
"#);
    assert_eq!(output, "?NO RESUME IN 100\n");
}

#[test]
fn test_tron_traces_lines() {
    let output = run("10 TRON\n20 PRINT \"X\"\n30 TROFF\n40 PRINT \"Y\"\n");
    assert_eq!(output, "[20]\nX\n[30]\nY\n");
}

#[test]
fn test_input_assigns_values() {
    let output = run_with_input("10 INPUT A, B$\n20 PRINT A; B$\n", &["7, hello"]);
    assert_eq!(output, "?  7 hello\n");
}

#[test]
fn test_input_prompt_and_suppression() {
    let output = run_with_input("10 INPUT \"NAME\"; N$\n20 PRINT \"HI \"; N$\n", &["joe"]);
    assert_eq!(output, "NAME? HI joe\n");
    let output = run_with_input("10 INPUT; A\n20 PRINT A\n", &["3"]);
    assert_eq!(output, " 3 \n");
}

#[test]
fn test_input_short_values_keep_rest() {
    let output = run_with_input("10 B=9\n20 INPUT A, B\n30 PRINT A; B\n", &["1"]);
    assert_eq!(output, "?  1  9 \n");
}

#[test]
fn test_input_unparsable_numeric_is_zero() {
    let output = run_with_input("10 INPUT A\n20 PRINT A\n", &["oops"]);
    assert_eq!(output, "?  0 \n");
}

#[test]
fn test_line_input_takes_whole_line() {
    let output = run_with_input("10 LINE INPUT L$\n20 PRINT L$\n", &["a, b, c"]);
    assert_eq!(output, "a, b, c\n");
}

#[test]
fn test_inkey_polls_console() {
    let output = run_with_keys(
        "10 K$ = INKEY$\n20 IF K$ = \"\" THEN PRINT \"none\" ELSE PRINT K$\n",
        &[b'A'],
    );
    assert_eq!(output, "A\n");
    let output = run_with_keys(
        "10 K$ = INKEY$\n20 IF K$ = \"\" THEN PRINT \"none\" ELSE PRINT K$\n",
        &[],
    );
    assert_eq!(output, "none\n");
}

#[test]
fn test_chain_publishes_request() {
    let (_, mut interpreter) = run_with("10 COMMON A\n20 A=7\n30 CHAIN \"NEXT.BAS\", 500\n", &[], &[]);
    let request = interpreter.take_chain_request().expect("chain request");
    assert_eq!(request.filename, "NEXT.BAS");
    assert_eq!(request.line_number, Some(500));
    assert!(!request.all);
    assert!(!request.merge);
    assert_eq!(interpreter.runtime().common_vars, vec!["a".to_string()]);
}

#[test]
fn test_run_file_publishes_request() {
    let (_, mut interpreter) = run_with("10 RUN \"OTHER.BAS\", R\n", &[], &[]);
    let request = interpreter.take_run_request().expect("run request");
    assert_eq!(request.filename, "OTHER.BAS");
    assert!(request.keep_variables);
}

#[test]
fn test_run_line_restarts_clean() {
    let output = run(r#"10 A = A + 1
20 IF A < 2 THEN RUN 40
30 END
40 PRINT "ran"; A
50 END
"#);
    // RUN resets variables, so A prints as zero.
    assert_eq!(output, "ran 0 \n");
}

#[test]
fn test_rem_and_inline_comment() {
    let output = run("10 REM nothing here\n20 PRINT \"ok\" ' trailing words\n30 END\n");
    assert_eq!(output, "ok\n");
}

#[test]
fn test_breakpoint_suspends_and_resumes() {
    use mbasic::lang::parse;
    use mbasic::mach::{Interpreter, Pc, Runtime, StopReason, Val};
    let mut runtime = Runtime::new();
    runtime.load(parse("10 A=1\n20 A=2\n30 A=3\n").unwrap());
    runtime.breakpoints.insert(Pc::running_at(20, 0));
    let mut interpreter = Interpreter::new(runtime);
    while interpreter.tick() {}
    assert_eq!(interpreter.runtime().pc.reason, StopReason::Breakpoint);
    assert_eq!(interpreter.runtime().pc.line, 20);
    assert_eq!(interpreter.runtime().get_variable("a"), Val::Single(1.0));
    // Resuming steps over the breakpoint once.
    interpreter.runtime_mut().pc.reason = StopReason::Running;
    while interpreter.tick() {}
    assert_eq!(interpreter.runtime().pc.reason, StopReason::End);
    assert_eq!(interpreter.runtime().get_variable("a"), Val::Single(3.0));
}

#[test]
fn test_break_request_suspends() {
    use mbasic::lang::parse;
    use mbasic::mach::{Interpreter, Runtime, StopReason};
    let mut runtime = Runtime::new();
    runtime.load(parse("10 GOTO 10\n").unwrap());
    let mut interpreter = Interpreter::new(runtime);
    for _ in 0..100 {
        interpreter.tick();
    }
    interpreter.runtime_mut().break_requested = true;
    assert!(!interpreter.tick());
    assert_eq!(interpreter.runtime().pc.reason, StopReason::Break);
}

#[test]
fn test_gosub_discards_inner_while() {
    let (output, interpreter) = run_with(
        r#"10 GOSUB 100
20 PRINT "back"
30 END
100 WHILE 1
110 RETURN
"#,
        &[],
        &[],
    );
    assert_eq!(output, "back\n");
    assert!(interpreter.runtime().exec_stack.is_empty());
}
