mod common;
use common::*;

#[test]
fn test_print_zones() {
    assert_eq!(run("10 PRINT \"A\",\"B\"\n"), "A             B\n");
}

#[test]
fn test_print_leading_comma_tabs() {
    assert_eq!(run("10 PRINT ,5\n"), "               5 \n");
}

#[test]
fn test_print_semicolon_no_gap() {
    assert_eq!(run("10 PRINT \"A\";\"B\"\n"), "AB\n");
}

#[test]
fn test_print_adjacent_items_get_one_space() {
    assert_eq!(run("10 PRINT \"A\" \"B\"\n"), "A B\n");
}

#[test]
fn test_print_trailing_semicolon_suppresses_newline() {
    assert_eq!(run("10 PRINT \"A\";\n20 PRINT \"B\"\n"), "AB\n");
}

#[test]
fn test_print_bare_emits_newline() {
    assert_eq!(run("10 PRINT \"A\"\n20 PRINT\n30 PRINT \"B\"\n"), "A\n\nB\n");
}

#[test]
fn test_print_numeric_spacing() {
    assert_eq!(run("10 PRINT 1; -2; 3\n"), " 1 -2  3 \n");
}

#[test]
fn test_print_question_shorthand() {
    assert_eq!(run("10 ? \"HI\"\n"), "HI\n");
}

#[test]
fn test_tab_advances_to_column() {
    assert_eq!(run("10 PRINT TAB(10); \"X\"\n"), "         X\n");
    assert_eq!(run("10 PRINT \"ABCDE\"; TAB(3); \"X\"\n"), "ABCDEX\n");
}

#[test]
fn test_spc_emits_spaces() {
    assert_eq!(run("10 PRINT \"A\"; SPC(3); \"B\"\n"), "A   B\n");
}

#[test]
fn test_pos_is_one_based() {
    assert_eq!(run("10 PRINT \"AB\"; POS(0)\n"), "AB 3 \n");
}

#[test]
fn test_print_using_numeric() {
    assert_eq!(run("10 PRINT USING \"##.##\"; 3.5\n"), " 3.50\n");
    assert_eq!(run("10 PRINT USING \"+###\"; 42\n"), "+ 42\n");
}

#[test]
fn test_print_using_multiple_fields() {
    assert_eq!(run("10 PRINT USING \"## ##\"; 1; 2\n"), " 1  2\n");
}

#[test]
fn test_print_using_literal_text() {
    assert_eq!(
        run("10 PRINT USING \"TOTAL: $###.##\"; 12.5\n"),
        "TOTAL: $ 12.50\n"
    );
}

#[test]
fn test_print_using_string_fields() {
    assert_eq!(run("10 PRINT USING \"!\"; \"WORD\"\n"), "W\n");
    assert_eq!(run("10 PRINT USING \"\\ \\\"; \"ABCDE\"\n"), "ABC\n");
    assert_eq!(run("10 PRINT USING \"&\"; \"ABCDE\"\n"), "ABCDE\n");
}

#[test]
fn test_lprint_goes_to_console() {
    assert_eq!(run("10 LPRINT \"HARDCOPY\"\n"), "HARDCOPY\n");
    assert_eq!(run("10 LPRINT USING \"##\"; 7\n"), " 7\n");
}

#[test]
fn test_write_quotes_strings() {
    assert_eq!(run("10 WRITE \"A\", 1\n"), "\"A\", 1 \n");
}

#[test]
fn test_cls_emits_clear_sequence() {
    assert_eq!(run("10 CLS\n"), "\x1b[2J\x1b[H");
}
