//! Type checker tests

use crate::ast::{Span, Type};
use crate::error::CompileError;
use crate::lexer::tokenize;
use crate::parser::parse;
use crate::types::{CheckedProgram, TypeChecker};

fn check(source: &str) -> Result<CheckedProgram, Vec<CompileError>> {
    let tokens = tokenize(source).expect("lex should succeed");
    let program = parse("test.bmb", source, tokens).expect("parse should succeed");
    TypeChecker::new()
        .check_program(&program)
        .map_err(|(errors, _)| errors)
}

fn check_ok(source: &str) -> CheckedProgram {
    match check(source) {
        Ok(c) => c,
        Err(errors) => panic!("expected clean check, got: {errors:?}"),
    }
}

fn check_fails(source: &str) -> Vec<CompileError> {
    match check(source) {
        Ok(_) => panic!("expected type errors"),
        Err(errors) => errors,
    }
}

/// Span of the first occurrence of `needle` in `source`.
fn span_of(source: &str, needle: &str) -> Span {
    let start = source.find(needle).expect("needle present");
    Span::new(start, start + needle.len())
}

// ============================================
// Basics
// ============================================

#[test]
fn test_simple_function() {
    check_ok("fn add(a: i64, b: i64) -> i64 = a + b;");
}

#[test]
fn test_body_type_mismatch() {
    let errors = check_fails("fn f() -> i64 = true;");
    assert!(errors[0].message().contains("returns i64"));
}

#[test]
fn test_unknown_variable_with_hint() {
    let errors = check_fails("fn f(count: i64) -> i64 = cuont;");
    assert!(errors[0].message().contains("unknown variable"));
    assert!(errors[0].message().contains("count"));
}

#[test]
fn test_unknown_function_with_hint() {
    let errors = check_fails("fn f() -> i64 = { vec_puhs(1, 2); 0 };");
    assert!(errors[0].message().contains("vec_push"));
}

#[test]
fn test_arity_mismatch() {
    let errors = check_fails("fn g(a: i64) -> i64 = a; fn f() -> i64 = g(1, 2);");
    assert!(errors[0].message().contains("argument"));
}

#[test]
fn test_assign_to_immutable_rejected() {
    let errors = check_fails("fn f() -> i64 = { let x = 1; x = 2; x };");
    assert!(errors[0].message().contains("immutable"));
}

#[test]
fn test_var_assignment_ok() {
    check_ok("fn f() -> i64 = { var x = 1; x = 2; x };");
}

#[test]
fn test_string_concat_via_plus() {
    let checked = check_ok(r#"fn f(a: String, b: String) -> String = a + b;"#);
    assert!(checked.fn_sigs.contains_key("f"));
}

#[test]
fn test_logical_ops_require_bool() {
    let errors = check_fails("fn f(a: i64) -> bool = a and true;");
    assert!(errors[0].message().contains("expected bool"));
}

#[test]
fn test_if_branch_join() {
    check_ok("fn f(c: bool) -> i64 = if c { 1 } else { 2 };");
    let errors = check_fails("fn f(c: bool) -> i64 = if c { 1 } else { true };");
    assert!(errors[0].message().contains("disagree"));
}

#[test]
fn test_integer_division_stays_integer() {
    // Integer-preserving division: i64 / i64 is i64, usable where i64 is
    // expected with no float sneaking in.
    let src = "fn f(a: i64, b: i64) -> i64 = a / b;";
    let checked = check_ok(src);
    let span = span_of(src, "a / b");
    assert_eq!(checked.type_of(span), Some(&Type::I64));
}

// ============================================
// Nullability
// ============================================

#[test]
fn test_null_unifies_with_nullable() {
    check_ok("fn f() -> i64? = null;");
}

#[test]
fn test_auto_wrap_into_nullable() {
    check_ok("fn f() -> i64? = 5;");
}

#[test]
fn test_if_join_with_null_is_nullable() {
    let src = "fn f(c: bool) -> i64? = if c { 42 } else { null };";
    let checked = check_ok(src);
    let span = span_of(src, "if c { 42 } else { null }");
    match checked.type_of(span) {
        Some(Type::Nullable(inner)) => assert_eq!(**inner, Type::I64),
        other => panic!("expected Nullable(i64), got {other:?}"),
    }
}

#[test]
fn test_nullable_mismatch_rejected() {
    let errors = check_fails("fn f() -> i64? = true;");
    assert!(!errors.is_empty());
}

// ============================================
// Generics and monomorphization
// ============================================

#[test]
fn test_generic_struct_field_access() {
    // The canonical generic-field-access scenario: fst must be A, snd
    // must be B, never field 0 for everything.
    let src = "struct Pair<A, B> { fst: A, snd: B } \
               fn fst(p: Pair<i64, i64>) -> i64 = p.fst; \
               fn snd(p: Pair<i64, i64>) -> i64 = p.snd; \
               fn main() -> i64 = { let p = new Pair { fst: 1, snd: 2 }; fst(p) + snd(p) };";
    let checked = check_ok(src);
    // var_struct_types is keyed by the base name, not the suffix.
    let fst_vars = &checked.var_struct_types["fst"];
    assert_eq!(fst_vars.get("p").map(String::as_str), Some("Pair"));
    let main_vars = &checked.var_struct_types["main"];
    assert_eq!(main_vars.get("p").map(String::as_str), Some("Pair"));
    // The monomorphized struct landed in the output.
    assert!(checked.struct_defs.contains_key("Pair_i64_i64"));
}

#[test]
fn test_generic_fn_monomorphized() {
    let src = "struct Pair<A, B> { fst: A, snd: B } \
               fn fst<A, B>(p: Pair<A, B>) -> A = p.fst; \
               fn main() -> i64 = { let p = new Pair { fst: 1, snd: 2 }; fst(p) };";
    let checked = check_ok(src);
    assert!(checked.fn_sigs.contains_key("fst_i64_i64"));
    // The call site is retargeted to the instance.
    assert!(checked
        .mono_calls
        .values()
        .any(|name| name == "fst_i64_i64"));
    // The instance's return type is the first type argument.
    assert_eq!(checked.fn_sigs["fst_i64_i64"].ret, Type::I64);
}

#[test]
fn test_monomorphization_memoized() {
    let src = "struct Box<T> { v: T } \
               fn get<T>(b: Box<T>) -> T = b.v; \
               fn main() -> i64 = { \
                   let a = new Box { v: 1 }; \
                   let b = new Box { v: 2 }; \
                   get(a) + get(b) \
               };";
    let checked = check_ok(src);
    // Exactly one instance for the repeated (template, args) pair; the
    // builtin get_arg is unrelated.
    let instances: Vec<&String> = checked
        .fn_sigs
        .keys()
        .filter(|k| k.starts_with("get_") && k.as_str() != "get_arg")
        .collect();
    assert_eq!(instances, vec![&"get_i64".to_string()]);
}

#[test]
fn test_distinct_instances_for_distinct_args() {
    let src = "struct Box<T> { v: T } \
               fn get<T>(b: Box<T>) -> T = b.v; \
               fn main() -> i64 = { \
                   let a = new Box { v: 1 }; \
                   let s = new Box { v: \"x\" }; \
                   get(a) + len(get(s)) \
               };";
    let checked = check_ok(src);
    assert!(checked.fn_sigs.contains_key("get_i64"));
    assert!(checked.fn_sigs.contains_key("get_String"));
}

// ============================================
// Index expressions
// ============================================

#[test]
fn test_index_array() {
    check_ok("fn f(a: [i64; 10], i: i64) -> i64 = a[i];");
}

#[test]
fn test_index_through_reference() {
    // Reference-to-array indexing produces the element type without
    // copying the array.
    let src = "fn g(a: &[i64; 10], i: i64) -> i64 = a[i];";
    let checked = check_ok(src);
    let span = span_of(src, "a[i]");
    assert_eq!(checked.type_of(span), Some(&Type::I64));
}

#[test]
fn test_index_slice_and_string() {
    check_ok("fn f(s: &[i64], i: i64) -> i64 = s[i];");
    check_ok(r#"fn f(s: String, i: i64) -> i64 = s[i];"#);
}

#[test]
fn test_index_non_indexable_rejected() {
    let errors = check_fails("fn f(x: i64) -> i64 = x[0];");
    assert!(errors[0].message().contains("cannot index"));
}

#[test]
fn test_index_requires_integer() {
    let errors = check_fails("fn f(a: [i64; 4]) -> i64 = a[true];");
    assert!(!errors.is_empty());
}

// ============================================
// Match
// ============================================

#[test]
fn test_match_enum_exhaustive() {
    check_ok(
        "enum E { A(i64), B } \
         fn f(e: E) -> i64 = match e { E::A(n) => n, E::B => 0 };",
    );
}

#[test]
fn test_match_enum_missing_variant() {
    let errors = check_fails(
        "enum E { A(i64), B } \
         fn f(e: E) -> i64 = match e { E::A(n) => n };",
    );
    assert!(errors[0].message().contains("non-exhaustive"));
    assert!(errors[0].message().contains("E::B"));
}

#[test]
fn test_match_int_needs_wildcard() {
    let errors = check_fails("fn f(n: i64) -> i64 = match n { 0 => 1 };");
    assert!(errors[0].message().contains("non-exhaustive"));
}

#[test]
fn test_match_guard_must_be_bool() {
    let errors = check_fails("fn f(n: i64) -> i64 = match n { x if x => 1, _ => 0 };");
    assert!(!errors.is_empty());
}

#[test]
fn test_match_arm_types_join() {
    let errors = check_fails("fn f(n: i64) -> i64 = match n { 0 => 1, _ => true };");
    assert!(errors[0].message().contains("disagree"));
}

// ============================================
// Contracts
// ============================================

#[test]
fn test_contract_clauses_check_as_bool() {
    check_ok("fn divide(a: i64, b: i64) -> i64 pre b != 0 post ret * b <= a = a / b;");
}

#[test]
fn test_non_bool_precondition_rejected() {
    let errors = check_fails("fn f(a: i64) -> i64 pre a + 1 = a;");
    assert!(errors[0].message().contains("precondition must be bool"));
}

#[test]
fn test_ret_outside_post_rejected() {
    let errors = check_fails("fn f(a: i64) -> i64 = ret;");
    assert!(errors[0].message().contains("postcondition"));
}

#[test]
fn test_refinement_param_predicates_check() {
    check_ok("fn divide(a: i64, b: i64{it != 0}) -> i64 = a / b;");
    let errors = check_fails("fn f(b: i64{it + 1}) -> i64 = b;");
    assert!(errors[0].message().contains("refinement must be bool"));
}

#[test]
fn test_old_in_postcondition() {
    check_ok("fn inc(x: i64) -> i64 post ret > old(x) = x + 1;");
}

#[test]
fn test_decreases_measure_is_i64() {
    check_ok("@decreases(n) fn f(n: i64) -> i64 = if n < 1 then 0 else f(n - 1);");
}

// ============================================
// spawn rejection, structs, misc
// ============================================

#[test]
fn test_spawn_rejected() {
    let errors = check_fails("fn main() -> i64 = { spawn { 1 }; 0 };");
    assert!(errors[0].message().contains("reserved"));
}

#[test]
fn test_struct_literal_missing_field() {
    let errors = check_fails("struct P { a: i64, b: i64 } fn f() -> P = new P { a: 1 };");
    assert!(errors[0].message().contains("missing field `b`"));
}

#[test]
fn test_struct_unknown_field_with_hint() {
    let errors = check_fails(
        "struct P { alpha: i64 } fn f(p: P) -> i64 = p.alpah;",
    );
    assert!(errors[0].message().contains("alpha"));
}

#[test]
fn test_field_access_through_pointer() {
    check_ok("struct Node { value: i64, next: *Node } fn f(n: *Node) -> i64 = n.value;");
}

#[test]
fn test_free_returns_i64() {
    // free() is i64-typed so it composes in conditional branches.
    check_ok("fn f(p: i64, c: bool) -> i64 = if c { free(p) } else { 0 };");
}

#[test]
fn test_impl_method_call() {
    let src = "struct Sq { s: i64 } \
               trait Area { fn area(self: Sq) -> i64; } \
               impl Area for Sq { fn area(self: Sq) -> i64 = self.s * self.s; } \
               fn f(x: Sq) -> i64 = x.area();";
    let checked = check_ok(src);
    assert!(checked.fn_sigs.contains_key("Sq_area"));
    assert!(checked.method_calls.values().any(|v| v == "Sq_area"));
}

#[test]
fn test_cast_rules() {
    check_ok("fn f(x: i64) -> f64 = x as f64;");
    let errors = check_fails(r#"fn f(s: String) -> i64 = s as i64;"#);
    assert!(errors[0].message().contains("invalid cast"));
}

#[test]
fn test_break_outside_loop() {
    let errors = check_fails("fn f() -> i64 = { break; 0 };");
    assert!(errors[0].message().contains("outside of a loop"));
}

#[test]
fn test_loop_break_value_type() {
    check_ok("fn f() -> i64 = loop { break 7 };");
}

#[test]
fn test_unused_binding_warning() {
    let checked = check_ok("fn f() -> i64 = { let unused = 1; 2 };");
    assert!(checked
        .warnings
        .iter()
        .any(|w| w.kind() == "unused_binding" && w.message().contains("unused")));
}

#[test]
fn test_unused_mut_warning() {
    let checked = check_ok("fn f() -> i64 = { var x = 1; x };");
    assert!(checked.warnings.iter().any(|w| w.kind() == "unused_mut"));
}

#[test]
fn test_shadow_warning() {
    let checked = check_ok("fn f() -> i64 = { let x = 1; let x = 2; x };");
    assert!(checked.warnings.iter().any(|w| w.kind() == "shadow_binding"));
}

#[test]
fn test_errors_accumulate() {
    let errors = check_fails(
        "fn f() -> i64 = { let a = true + 1; let b = zzz; 0 };",
    );
    assert!(errors.len() >= 2);
}
