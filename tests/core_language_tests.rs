//! Core language semantics: values, operators, control flow, and builtins
//!
//! Everything here runs on the plain interpreter; tier behavior is covered
//! in hotpath_tests.rs.

mod common;

use common::{interpreted, run, run_err, run_with};
use levython::ErrorKind;

mod values_and_operators {
    use super::*;

    #[test]
    fn integer_arithmetic() {
        assert_eq!(run("say(7 + 3)"), "10\n");
        assert_eq!(run("say(7 - 3)"), "4\n");
        assert_eq!(run("say(7 * 3)"), "21\n");
        assert_eq!(run("say(7 % 3)"), "1\n");
        assert_eq!(run("say(-5 + 2)"), "-3\n");
    }

    #[test]
    fn division_always_produces_a_float() {
        assert_eq!(run("say(7 / 2)"), "3.500000\n");
        assert_eq!(run("say(6 / 3)"), "2.000000\n");
    }

    #[test]
    fn power_always_produces_a_float() {
        assert_eq!(run("say(2 ^ 10)"), "1024.000000\n");
    }

    #[test]
    fn floats_display_six_decimals() {
        assert_eq!(run("say(0.1 + 0.2)"), "0.300000\n");
        assert_eq!(run("say(1.0)"), "1.000000\n");
    }

    #[test]
    fn division_by_zero_is_catchable() {
        let err = run_err("say(1 / 0)");
        assert_eq!(err.kind(), Some(ErrorKind::ZeroDivisionError));
        assert!(err.to_string().contains("Division by zero."));
        assert_eq!(
            run("try { say(1 / 0) } catch { say(\"caught\") }"),
            "caught\n"
        );
    }

    #[test]
    fn modulo_is_integer_only() {
        let err = run_err("say(1.5 % 0.5)");
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
        let err = run_err("say(5 % 0)");
        assert_eq!(err.kind(), Some(ErrorKind::ZeroDivisionError));
        assert!(err.to_string().contains("Modulo by zero."));
    }

    #[test]
    fn string_concatenation_uses_display_forms() {
        assert_eq!(run("say(\"a\" + \"b\")"), "ab\n");
        assert_eq!(run("say(\"n = \" + 3)"), "n = 3\n");
        assert_eq!(run("say(1.5 + \"!\")"), "1.500000!\n");
        assert_eq!(run("say(yes + \"?\")"), "yes?\n");
    }

    #[test]
    fn booleans_display_yes_and_no() {
        assert_eq!(run("say(yes)"), "yes\n");
        assert_eq!(run("say(no)"), "no\n");
        assert_eq!(run("say(none)"), "none\n");
    }

    #[test]
    fn comparisons() {
        assert_eq!(run("say(1 < 2)"), "yes\n");
        assert_eq!(run("say(2 <= 1)"), "no\n");
        assert_eq!(run("say(\"apple\" < \"banana\")"), "yes\n");
        assert_eq!(run("say(1 == 1.0)"), "yes\n");
        assert_eq!(run("say(\"a\" != \"b\")"), "yes\n");
    }

    #[test]
    fn eager_logic_on_mixed_operands_selects_a_value() {
        assert_eq!(run("say(1 & \"x\")"), "x\n");
        assert_eq!(run("say(0 & \"x\")"), "0\n");
        assert_eq!(run("say(\"\" | \"fallback\")"), "fallback\n");
    }

    #[test]
    fn logic_on_uniform_scalars_produces_a_boolean() {
        assert_eq!(run("say(2 & 3)"), "yes\n");
        assert_eq!(run("say(2 | 0)"), "yes\n");
        assert_eq!(run("say(yes and no)"), "no\n");
        assert_eq!(run("say(not no)"), "yes\n");
    }

    #[test]
    fn mismatched_operands_report_both_types() {
        let err = run_err("say([1] - 2)");
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
        assert!(err.to_string().contains("Unsupported operand types for '-'"));
    }
}

mod control_flow {
    use super::*;

    #[test]
    fn if_else_branches() {
        let source = r#"
            x <- 10
            if x > 5 {
                say("big")
            } else {
                say("small")
            }
        "#;
        assert_eq!(run(source), "big\n");
    }

    #[test]
    fn while_loop_counts() {
        assert_eq!(
            run("i <- 0 while i < 3 { say(i) i <- i + 1 }"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn for_iterates_lists_and_strings() {
        assert_eq!(run("for x in [10, 20] { say(x) }"), "10\n20\n");
        assert_eq!(run("for c in \"hi\" { say(c) }"), "h\ni\n");
        assert_eq!(run("for x in [] { say(x) }"), "");
    }

    #[test]
    fn for_over_a_non_iterable_fails() {
        let err = run_err("for x in 5 { say(x) }");
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
    }

    #[test]
    fn repeat_runs_a_fixed_count() {
        assert_eq!(run("repeat 3 { say(\"tick\") }"), "tick\ntick\ntick\n");
        assert_eq!(run("repeat 0 { say(\"never\") }"), "");
    }

    #[test]
    fn repeat_rejects_non_integer_counts() {
        let err = run_err("repeat \"three\" { say(1) }");
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
        assert!(err.to_string().contains("Repeat requires an integer count."));
        let err = run_err("repeat 2.5 { say(1) }");
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
    }

    #[test]
    fn try_catch_resumes_after_the_handler() {
        let source = r#"
            try {
                say("before")
                missing(1)
                say("unreachable")
            } catch {
                say("handled")
            }
            say("after")
        "#;
        assert_eq!(run(source), "before\nhandled\nafter\n");
    }

    #[test]
    fn nested_try_unwinds_to_the_innermost_handler() {
        let source = r#"
            try {
                try {
                    say(1 / 0)
                } catch {
                    say("inner")
                }
                say([1][5])
            } catch {
                say("outer")
            }
        "#;
        assert_eq!(run(source), "inner\nouter\n");
    }

    #[test]
    fn errors_in_called_functions_unwind_to_the_caller() {
        let source = r#"
            act explode() {
                say(1 / 0)
            }
            try {
                explode()
            } catch {
                say("caught")
            }
        "#;
        assert_eq!(run(source), "caught\n");
    }
}

mod functions {
    use super::*;

    #[test]
    fn recursion() {
        let source = r#"
            act fib(n) {
                if n < 2 {
                    -> n
                }
                -> fib(n - 1) + fib(n - 2)
            }
            say(fib(12))
        "#;
        assert_eq!(run(source), "144\n");
    }

    #[test]
    fn falling_off_the_end_returns_none() {
        assert_eq!(run("act f() { x <- 1 } say(f())"), "none\n");
        assert_eq!(run("act g() { -> } say(g())"), "none\n");
    }

    #[test]
    fn arity_is_checked() {
        let err = run_err("act f(a, b) { -> a + b } f(1)");
        assert_eq!(err.kind(), Some(ErrorKind::ArityError));
        assert!(err.to_string().contains("Expected 2 args, got 1."));
    }

    #[test]
    fn undefined_variables_name_the_variable() {
        let err = run_err("say(ghost)");
        assert_eq!(err.kind(), Some(ErrorKind::NameError));
        assert!(err.to_string().contains("Undefined variable: ghost"));
    }

    #[test]
    fn runaway_recursion_is_catchable() {
        let source = r#"
            act dive(n) {
                -> dive(n + 1)
            }
            try {
                dive(0)
            } catch {
                say("too deep")
            }
        "#;
        assert_eq!(run(source), "too deep\n");
    }

    #[test]
    fn error_traces_name_the_call_chain() {
        let source = r#"
            act inner() {
                say(1 / 0)
            }
            act outer() {
                inner()
            }
            outer()
        "#;
        let err = run_with(interpreted(), source).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ZeroDivisionError"));
        assert!(text.contains("inner"));
        assert!(text.contains("outer"));
        assert!(text.contains("<script>"));
    }

    #[test]
    fn functions_are_first_class_values() {
        let source = r#"
            act double(n) {
                -> n * 2
            }
            f <- double
            say(f(21))
            say(type(f))
        "#;
        assert_eq!(run(source), "42\nfunction\n");
    }
}

mod collections {
    use super::*;

    #[test]
    fn list_literals_index_and_assignment() {
        assert_eq!(run("l <- [1, 2, 3] say(l[1])"), "2\n");
        assert_eq!(run("l <- [1, 2, 3] l[0] <- 9 say(l)"), "[9, 2, 3]\n");
        assert_eq!(run("say([1, \"two\", 3.0])"), "[1, two, 3.000000]\n");
    }

    #[test]
    fn list_index_out_of_range() {
        let err = run_err("say([1, 2][2])");
        assert_eq!(err.kind(), Some(ErrorKind::IndexError));
        assert!(err.to_string().contains("Index out of range."));
        let err = run_err("say([1, 2][-1])");
        assert_eq!(err.kind(), Some(ErrorKind::IndexError));
    }

    #[test]
    fn string_indexing_yields_one_character_strings() {
        assert_eq!(run("say(\"abc\"[1])"), "b\n");
        let err = run_err("say(\"abc\"[3])");
        assert_eq!(err.kind(), Some(ErrorKind::IndexError));
    }

    #[test]
    fn map_literals_and_key_access() {
        assert_eq!(run("m <- {\"a\": 1, \"b\": 2} say(m[\"b\"])"), "2\n");
        assert_eq!(run("m <- {\"a\": 1} say(m.a)"), "1\n");
        assert_eq!(run("m <- {\"a\": 1} m.b <- 2 say(m[\"b\"])"), "2\n");
        assert_eq!(run("say({\"b\": 2, \"a\": 1})"), "{\"a\": 1, \"b\": 2}\n");
    }

    #[test]
    fn missing_map_keys_name_the_key() {
        let err = run_err("say({\"a\": 1}[\"b\"])");
        assert_eq!(err.kind(), Some(ErrorKind::KeyError));
        assert!(err.to_string().contains("Key not found: b"));
    }

    #[test]
    fn append_mutates_and_returns_the_same_list() {
        assert_eq!(run("l <- [1] append(l, 2) say(l)"), "[1, 2]\n");
        assert_eq!(run("l <- [] say(append(l, 1))"), "[1]\n");
    }

    #[test]
    fn truthiness_of_containers() {
        assert_eq!(run("if [] { say(\"t\") } else { say(\"f\") }"), "f\n");
        assert_eq!(run("if [0] { say(\"t\") } else { say(\"f\") }"), "t\n");
        assert_eq!(run("if \"\" { say(\"t\") } else { say(\"f\") }"), "f\n");
    }
}

mod builtins {
    use super::*;

    #[test]
    fn len_counts_characters_and_elements() {
        assert_eq!(run("say(len(\"héllo\"))"), "5\n");
        assert_eq!(run("say(len([1, 2, 3]))"), "3\n");
        assert_eq!(run("say(len({\"a\": 1}))"), "1\n");
    }

    #[test]
    fn non_ascii_strings_survive_the_pipeline() {
        assert_eq!(run("say(\"héllo\")"), "héllo\n");
        assert_eq!(run("s <- \"héllo\"\nsay(s[1])"), "é\n");
        assert_eq!(run("say(\"日本\" + \"語\")"), "日本語\n");
    }

    #[test]
    fn range_forms() {
        assert_eq!(run("say(range(3))"), "[0, 1, 2]\n");
        assert_eq!(run("say(range(1, 4))"), "[1, 2, 3]\n");
        assert_eq!(run("say(range(10, 0, -3))"), "[10, 7, 4, 1]\n");
        assert_eq!(run("for i in range(2) { say(i) }"), "0\n1\n");
    }

    #[test]
    fn type_names() {
        assert_eq!(run("say(type(1))"), "integer\n");
        assert_eq!(run("say(type(1.0))"), "float\n");
        assert_eq!(run("say(type(\"s\"))"), "string\n");
        assert_eq!(run("say(type(yes))"), "boolean\n");
        assert_eq!(run("say(type(none))"), "none\n");
        assert_eq!(run("say(type([]))"), "list\n");
        assert_eq!(run("say(type({}))"), "map\n");
        assert_eq!(run("say(type(len))"), "function\n");
    }

    #[test]
    fn numeric_conversions() {
        assert_eq!(run("say(int(\"42\") + 1)"), "43\n");
        assert_eq!(run("say(int(3.9))"), "3\n");
        assert_eq!(run("say(float(2))"), "2.000000\n");
        assert_eq!(run("say(str(5) + \"!\")"), "5!\n");
        let err = run_err("say(int(\"abc\"))");
        assert!(err.to_string().contains("Cannot convert 'abc' to integer."));
    }

    #[test]
    fn math_constants_and_functions() {
        assert_eq!(run("say(math.pi)"), "3.141593\n");
        assert_eq!(run("say(math.sin(0))"), "0.000000\n");
        assert_eq!(run("say(math.cos(0))"), "1.000000\n");
    }

    #[test]
    fn function_values_display_opaquely() {
        assert_eq!(run("act f() { -> 1 } say(f)"), "<function>\n");
        assert_eq!(run("say(str(len))"), "<function len>\n");
    }
}
