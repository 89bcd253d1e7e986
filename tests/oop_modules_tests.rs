//! Classes, modules, and file objects
mod common;

use common::{interpreted, run, run_err, run_with};
use levython::{ErrorKind, Runtime, VmConfig};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

/// Run source with imports resolving against `dir`
fn run_in_dir(dir: &Path, source: &str) -> levython::Result<String> {
    let buffer: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let mut runtime = Runtime::with_output(VmConfig::default(), buffer.clone());
    runtime.set_module_dir(dir.to_path_buf());
    runtime.eval(source)?;
    let out = String::from_utf8(buffer.borrow().clone()).expect("say output is utf-8");
    Ok(out)
}

mod classes {
    use super::*;

    #[test]
    fn init_binds_fields_and_methods_read_them() {
        let out = run(r#"
            class Dog {
                init(name) { self.name <- name }
                act speak() { -> self.name + " says woof" }
            }
            d <- Dog("Rex")
            say(d.speak())
        "#);
        assert_eq!(out, "Rex says woof\n");
    }

    #[test]
    fn fields_are_readable_and_assignable_from_outside() {
        let out = run(r#"
            class Point {
                init(x, y) {
                    self.x <- x
                    self.y <- y
                }
            }
            p <- Point(3, 4)
            say(p.x + p.y)
            p.x <- 10
            say(p.x)
        "#);
        assert_eq!(out, "7\n10\n");
    }

    #[test]
    fn methods_can_mutate_state_across_calls() {
        let out = run(r#"
            class Counter {
                init() { self.count <- 0 }
                act bump() { self.count <- self.count + 1 }
            }
            c <- Counter()
            repeat 3 { c.bump() }
            say(c.count)
        "#);
        assert_eq!(out, "3\n");
    }

    #[test]
    fn classes_and_instances_display_by_name() {
        let out = run(r#"
            class Dog { }
            d <- Dog()
            say(Dog)
            say(d)
            say(type(Dog))
            say(type(d))
        "#);
        assert_eq!(out, "<class Dog>\n<instance of Dog>\nclass\ninstance\n");
    }

    #[test]
    fn a_class_without_init_rejects_constructor_args() {
        let err = run_err(
            r#"
            class Empty { }
            Empty(1)
        "#,
        );
        assert_eq!(err.kind(), Some(ErrorKind::ArityError));
        assert!(err.to_string().contains("Expected 0 args, got 1."));
    }

    #[test]
    fn reading_a_missing_property_is_a_name_error() {
        let err = run_err(
            r#"
            class Dog { }
            d <- Dog()
            say(d.age)
        "#,
        );
        assert_eq!(err.kind(), Some(ErrorKind::NameError));
        assert!(err.to_string().contains("Undefined property: age"));
    }
}

mod inheritance {
    use super::*;

    #[test]
    fn subclasses_inherit_init_and_override_methods() {
        let out = run(r#"
            class Animal {
                init(name) { self.name <- name }
                act speak() { -> "..." }
                act describe() { -> self.name + " says " + self.speak() }
            }
            class Dog is a Animal {
                act speak() { -> "woof" }
            }
            d <- Dog("Rex")
            say(d.describe())
        "#);
        assert_eq!(out, "Rex says woof\n");
    }

    #[test]
    fn super_reaches_the_parent_method() {
        let out = run(r#"
            class Base {
                act greet() { -> "hi" }
            }
            class Child is a Base {
                act greet() { -> super.greet() + " there" }
            }
            say(Child().greet())
        "#);
        assert_eq!(out, "hi there\n");
    }

    #[test]
    fn super_without_a_parent_fails() {
        let err = run_err(
            r#"
            class Lone {
                act go() { -> super.go() }
            }
            Lone().go()
        "#,
        );
        assert!(err.to_string().contains("has no parent"));
    }

    #[test]
    fn method_lookup_walks_the_parent_chain() {
        let out = run(r#"
            class A {
                act id() { -> "A" }
            }
            class B is a A { }
            class C is a B { }
            say(C().id())
        "#);
        assert_eq!(out, "A\n");
    }
}

mod modules {
    use super::*;

    #[test]
    fn imported_bindings_are_reachable_through_the_module_map() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("mathutils.levy"),
            "act triple(n) { -> n * 3 }\noffset <- 10\n",
        )
        .unwrap();
        let out = run_in_dir(
            dir.path(),
            r#"
            import mathutils
            say(mathutils.triple(4))
            say(mathutils.offset)
        "#,
        )
        .unwrap();
        assert_eq!(out, "12\n10\n");
    }

    #[test]
    fn a_module_runs_once_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("noisy.levy"),
            "say(\"loading\")\nvalue <- 1\n",
        )
        .unwrap();
        let out = run_in_dir(
            dir.path(),
            r#"
            import noisy
            import noisy
            say(noisy.value)
        "#,
        )
        .unwrap();
        assert_eq!(out, "loading\n1\n");
    }

    #[test]
    fn module_functions_resolve_names_in_their_own_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("conf.levy"),
            "offset <- 10\nact shifted(n) { -> n + offset }\n",
        )
        .unwrap();
        let out = run_in_dir(
            dir.path(),
            r#"
            import conf
            say(conf.shifted(5))
        "#,
        )
        .unwrap();
        assert_eq!(out, "15\n");
    }

    #[test]
    fn module_functions_keep_working_when_the_importer_shadows_a_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("conf.levy"),
            "offset <- 10\nact shifted(n) { -> n + offset }\n",
        )
        .unwrap();
        let out = run_in_dir(
            dir.path(),
            r#"
            import conf
            offset <- 1000
            say(conf.shifted(5))
        "#,
        )
        .unwrap();
        assert_eq!(out, "15\n");
    }

    #[test]
    fn module_globals_do_not_leak_into_the_importer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inner.levy"), "secret <- 99\n").unwrap();
        let err = run_in_dir(
            dir.path(),
            r#"
            import inner
            say(secret)
        "#,
        )
        .expect_err("module globals must stay namespaced");
        assert!(err.to_string().contains("Undefined variable: secret"));
    }

    #[test]
    fn a_missing_module_is_a_module_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_in_dir(dir.path(), "import nowhere").expect_err("import should fail");
        assert!(matches!(err, levython::Error::Module(_)));
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn a_failing_module_body_names_the_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.levy"), "say(missing)\n").unwrap();
        let err = run_in_dir(dir.path(), "import broken").expect_err("import should fail");
        assert!(err.to_string().contains("In module 'broken'"));
    }
}

mod files {
    use super::*;

    #[test]
    fn write_then_read_roundtrips_through_a_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt").display().to_string();
        let source = format!(
            r#"
            f <- open("{path}", "w")
            f.write("hello")
            f.close()
            g <- open("{path}", "r")
            say(g.read())
        "#
        );
        assert_eq!(run(&source), "hello\n");
    }

    #[test]
    fn file_objects_display_their_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.txt").display().to_string();
        let source = format!(
            r#"
            f <- open("{path}", "w")
            say(f.__handle__)
            f.close()
            say(f.__handle__)
        "#
        );
        assert_eq!(run(&source), "<file open>\n<file closed>\n");
    }

    #[test]
    fn io_on_a_closed_file_is_catchable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.txt").display().to_string();
        let source = format!(
            r#"
            f <- open("{path}", "w")
            f.close()
            try {{
                f.write("late")
            }} catch {{
                say("refused")
            }}
        "#
        );
        assert_eq!(run(&source), "refused\n");
    }

    #[test]
    fn opening_a_missing_file_for_reading_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.txt").display().to_string();
        let err = run_with(interpreted(), &format!(r#"open("{path}", "r")"#))
            .expect_err("open should fail");
        assert_eq!(err.kind(), Some(ErrorKind::IoError));
    }
}
