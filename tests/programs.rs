use loxbc::compiler::CompileErrors;
use loxbc::vm::RuntimeErrorKind;
use loxbc::{LoxError, Vm};
use pretty_assertions::assert_eq;

fn run(source: &str) -> (Result<(), LoxError>, String) {
    let mut vm = Vm::with_output(Vec::new());
    let result = vm.interpret(source);
    let output = String::from_utf8(vm.output().clone()).unwrap();
    (result, output)
}

fn output_of(source: &str) -> String {
    let (result, output) = run(source);
    if let Err(e) = result {
        panic!("{} failed: {}", source, e);
    }
    output
}

fn compile_messages(source: &str) -> Vec<String> {
    match run(source).0 {
        Err(LoxError::CompileError(CompileErrors(errors))) => {
            errors.into_iter().map(|e| e.message).collect()
        }
        other => panic!("expected a compile error, got {:?}", other),
    }
}

#[test]
fn arithmetic() {
    assert_eq!(output_of("print 1 + 2 * 3;"), "7\n");
    assert_eq!(output_of("print 3 - 1 / 2;"), "2.5\n");
    assert_eq!(output_of("print (1 + 2) * 3 == 9;"), "true\n");
    assert_eq!(
        output_of("print 1000000 * 1000000 * 1000000 * 1000;"),
        "1e+21\n"
    );
}

#[test]
fn block_scoping_shadows() {
    let source = "
var a = 1;
{
  var a = 2;
  print a;
}
print a;
";
    assert_eq!(output_of(source), "2\n1\n");
}

#[test]
fn initializer_cannot_see_its_own_local() {
    assert_eq!(
        compile_messages("var a = 1; { var a = a + 1; print a; } print a;"),
        vec!["Can't read local variable in its own initializer."]
    );
    // A differently named local reads the global just fine.
    assert_eq!(
        output_of("var a = 1; { var b = a + 1; print b; } print a;"),
        "2\n1\n"
    );
}

#[test]
fn fibonacci() {
    let source = "
fun fib(n) {
  if (n < 2) return n;
  return fib(n - 2) + fib(n - 1);
}
print fib(20);
print fib;
";
    assert_eq!(output_of(source), "6765\n<fn fib>\n");
}

#[test]
fn counter_closure() {
    let source = "
fun makeCounter() {
  var i = 0;
  fun count() {
    i = i + 1;
    print i;
  }
  return count;
}
var counter = makeCounter();
counter();
counter();
";
    assert_eq!(output_of(source), "1\n2\n");
}

#[test]
fn closures_share_captured_variable() {
    let source = "
var get;
var set;
fun pair() {
  var value = \"before\";
  fun g() { return value; }
  fun s(v) { value = v; }
  get = g;
  set = s;
}
pair();
set(\"after\");
print get();
";
    assert_eq!(output_of(source), "after\n");
}

#[test]
fn nested_upvalues() {
    let source = "
fun outer() {
  var x = \"outside\";
  fun middle() {
    fun inner() { print x; }
    return inner;
  }
  return middle;
}
outer()()();
";
    assert_eq!(output_of(source), "outside\n");
}

#[test]
fn loops() {
    let source = "
for (var i = 0; i < 3; i = i + 1) print i;
var j = 3;
while (j > 0) {
  print j;
  j = j - 1;
}
";
    assert_eq!(output_of(source), "0\n1\n2\n3\n2\n1\n");
}

#[test]
fn for_loop_without_clauses_can_return() {
    let source = "
fun firstOver(limit) {
  var n = 0;
  for (;;) {
    n = n + 1;
    if (n > limit) return n;
  }
}
print firstOver(4);
";
    assert_eq!(output_of(source), "5\n");
}

#[test]
fn logical_operators() {
    let source = "
print nil or \"fallback\";
print false and 1;
print 1 and 2;
print true or nil;
if (!nil and 0) print \"zero is truthy\"; else print \"zero is falsey\";
";
    assert_eq!(
        output_of(source),
        "fallback\nfalse\n2\ntrue\nzero is truthy\n"
    );
}

#[test]
fn returns() {
    let source = "
fun loopy() {
  while (true) {
    return \"left the loop\";
  }
}
fun bare() {
  return;
}
fun nothing() {}
print loopy();
print bare();
print nothing();
";
    assert_eq!(output_of(source), "left the loop\nnil\nnil\n");
}

#[test]
fn strings() {
    let source = "
var greeting = \"hello\" + \" \" + \"world\";
print greeting;
print greeting == \"hello world\";
print \"a\" + \"b\" == \"ab\";
print \"a\" != \"b\";
";
    assert_eq!(output_of(source), "hello world\ntrue\ntrue\ntrue\n");
}

#[test]
fn arity_mismatch() {
    let (result, output) = run("fun f(a, b) {}\nf(1);");
    match result {
        Err(LoxError::RuntimeError(e)) => {
            assert_eq!(
                e.kind,
                RuntimeErrorKind::ArityMismatch {
                    expected: 2,
                    actual: 1
                }
            );
            assert_eq!(
                e.to_string(),
                "Expected 2 arguments but got 1.\n[line 2] in script"
            );
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(output, "");
}

#[test]
fn undefined_globals() {
    let mut vm = Vm::with_output(Vec::new());
    for source in ["print missing;", "missing = 1;"] {
        match vm.interpret(source) {
            Err(LoxError::RuntimeError(e)) => assert_eq!(
                e.kind,
                RuntimeErrorKind::UndefinedVariable("missing".to_string())
            ),
            other => panic!("unexpected {:?}", other),
        }
    }
    // The failed assignment must not have defined it.
    assert!(vm.interpret("print missing;").is_err());
}

#[test]
fn type_errors_stop_execution() {
    let (result, output) = run("print \"before\";\nprint \"hi\" + 1;\nprint \"after\";");
    match result {
        Err(LoxError::RuntimeError(e)) => assert_eq!(
            e.to_string(),
            "Operands must be two numbers or two strings.\n[line 2] in script"
        ),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(output, "before\n");
}

#[test]
fn calling_a_non_function() {
    let (result, _) = run("var x = 3;\nx();");
    match result {
        Err(LoxError::RuntimeError(e)) => assert_eq!(e.kind, RuntimeErrorKind::NotCallable),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn compile_errors_run_nothing() {
    let (result, output) = run("print 1;\nprint ;");
    assert!(matches!(result, Err(LoxError::CompileError(_))));
    assert_eq!(output, "");
    assert_eq!(
        result.unwrap_err().to_string(),
        "[line 2] Error at ';': Expect expression."
    );
}

#[test]
fn jump_offsets_are_bounded() {
    // Each `a;` is three bytes of code.
    let fits = "a;".repeat(21000);
    assert_eq!(
        output_of(&format!("{{ var a; if (true) {{ {} }} print \"ok\"; }}", fits)),
        "ok\n"
    );

    let too_big = "a;".repeat(22000);
    assert_eq!(
        compile_messages(&format!("{{ var a; if (true) {{ {} }} }}", too_big)),
        vec!["Too much code to jump over."]
    );
    assert_eq!(
        compile_messages(&format!("{{ var a; while (false) {{ {} }} }}", too_big)),
        vec!["Loop body too large."]
    );
}

#[test]
fn globals_persist_between_runs() {
    let mut vm = Vm::with_output(Vec::new());
    vm.interpret("var total = 1;").unwrap();
    vm.interpret("fun bump() { total = total + 1; }").unwrap();
    vm.interpret("bump(); bump(); print total;").unwrap();
    assert_eq!(String::from_utf8(vm.output().clone()).unwrap(), "3\n");
    assert!(vm.heap().live_count() > 0);
}
