//! Integration tests for the script language
//!
//! Each case runs a complete script through [`aster_script::execute`] and
//! compares the JSON output.

use aster_script::{execute, ToolSet};
use serde_json::{json, Value};
use test_case::test_case;

async fn eval(code: &str) -> Value {
    let result = execute(code, ToolSet::new(), Some(5_000)).await;
    assert!(result.error.is_none(), "{}: {:?}", code, result.error);
    result.output
}

async fn eval_error(code: &str) -> String {
    let result = execute(code, ToolSet::new(), Some(5_000)).await;
    result.error.unwrap_or_default()
}

// ============================================================================
// Arrays
// ============================================================================

#[test_case("[1, 2, 3].map((x) => x * 10)", json!([10, 20, 30]) ; "map")]
#[test_case("[1, 2, 3, 4].filter((x) => x % 2 === 0)", json!([2, 4]) ; "filter")]
#[test_case("[1, 2, 3, 4].reduce((sum, x) => sum + x, 0)", json!(10) ; "reduce")]
#[test_case("[10, 9, 1, 100].sort()", json!([1, 10, 100, 9]) ; "default sort compares strings")]
#[test_case("[10, 9, 1, 100].sort((a, b) => a - b)", json!([1, 9, 10, 100]) ; "comparator sort")]
#[test_case("[3, undefined, 1].sort()", json!([1, 3, null]) ; "undefined sorts last")]
#[test_case("[[1, [2]], [3]].flat()", json!([1, [2], 3]) ; "flat one level")]
#[test_case("[[1, [2, [3]]]].flat(Infinity)", json!([1, 2, 3]) ; "flat infinity")]
#[test_case("[1, 2].flatMap((x) => [x, x * 2])", json!([1, 2, 2, 4]) ; "flat map")]
#[test_case("['a', 'b', 'c'].join('-')", json!("a-b-c") ; "join")]
#[test_case("[1, 2, 3].includes(2) && [1, 2, 3].indexOf(3) === 2", json!(true) ; "search")]
#[test_case("[5, 12, 8].find((x) => x > 6)", json!(12) ; "find")]
#[test_case("[5, 12, 8].findIndex((x) => x > 100)", json!(-1) ; "find index missing")]
#[test_case("[1, 2, 3].some((x) => x > 2) && ![1, 2].every((x) => x > 1)", json!(true) ; "some and every")]
#[test_case("const a = [1, 2, 3, 4, 5]; const removed = a.splice(1, 2, 'x'); [a, removed]", json!([[1, "x", 4, 5], [2, 3]]) ; "splice")]
#[test_case("[1, 2, 3, 4].slice(-2)", json!([3, 4]) ; "negative slice")]
#[test_case("new Array(3).fill(0)", json!([0, 0, 0]) ; "fill")]
#[test_case("Array.from({ length: 4 }, (_, i) => i * i)", json!([0, 1, 4, 9]) ; "array from length")]
#[test_case("const a = [1]; a.push(2, 3); a.unshift(0); [a.length, a.pop(), a.shift()]", json!([4, 3, 0]) ; "push and pop")]
#[test_case("[1, 2, 3].reverse().concat([4], 5)", json!([3, 2, 1, 4, 5]) ; "reverse and concat")]
#[test_case("[...[1, 2], ...'ab']", json!([1, 2, "a", "b"]) ; "spread")]
#[tokio::test]
async fn test_array_methods(code: &str, expected: Value) {
    assert_eq!(eval(code).await, expected);
}

// ============================================================================
// Strings
// ============================================================================

#[test_case("'Hello'.toUpperCase() + ' ' + 'WORLD'.toLowerCase()", json!("HELLO world") ; "case")]
#[test_case("'  padded  '.trim()", json!("padded") ; "trim")]
#[test_case("'a,b,,c'.split(',')", json!(["a", "b", "", "c"]) ; "split")]
#[test_case("'abc'.split('')", json!(["a", "b", "c"]) ; "split chars")]
#[test_case("'hello world'.replace('o', '0')", json!("hell0 world") ; "replace first")]
#[test_case("'hello world'.replaceAll('o', '0')", json!("hell0 w0rld") ; "replace all")]
#[test_case("'5'.padStart(3, '0') + '|' + 'x'.padEnd(3, '.')", json!("005|x..") ; "padding")]
#[test_case("'abcdef'.slice(1, -1) + 'abcdef'.substring(4, 2)", json!("bcdecd") ; "slicing")]
#[test_case("'ab'.repeat(3)", json!("ababab") ; "repeat")]
#[test_case("['script'.startsWith('scr'), 'script'.endsWith('pt'), 'script'.includes('rip')]", json!([true, true, true]) ; "predicates")]
#[test_case("'abc'.charAt(1) + 'abc'.at(-1) + 'abc'.charCodeAt(0)", json!("bc97") ; "char access")]
#[test_case("'héllo'.length", json!(5) ; "length counts characters")]
#[test_case("['\u{1F600}'.length, [...'a\u{1F600}'].length, 'a\u{1F600}b'.at(1)]", json!([1, 2, "\u{1F600}"]) ; "characters are unicode scalars")]
#[test_case("`total: ${1 + 2} items`", json!("total: 3 items") ; "template")]
#[test_case("'a-b-c'.replace('-', (m) => '[' + m + ']')", json!("a[-]b-c") ; "function replacement")]
#[tokio::test]
async fn test_string_methods(code: &str, expected: Value) {
    assert_eq!(eval(code).await, expected);
}

// ============================================================================
// Numbers, Math and conversions
// ============================================================================

#[test_case("(3.14159).toFixed(2)", json!("3.14") ; "to fixed")]
#[test_case("(255).toString(16)", json!("ff") ; "radix")]
#[test_case("Math.max(1, 7, 3) + Math.min(4, 2)", json!(9) ; "min max")]
#[test_case("Math.round(2.5) + Math.floor(-1.5) + Math.abs(-3)", json!(4) ; "rounding")]
#[test_case("2 ** 10", json!(1024) ; "exponent")]
#[test_case("7 % 3", json!(1) ; "remainder")]
#[test_case("parseInt('42px') + parseFloat('0.5')", json!(42.5) ; "parsing")]
#[test_case("[Number('12'), Number(''), String(12), Boolean('')]", json!([12, 0, "12", false]) ; "conversions")]
#[test_case("[isNaN('x'), Number.isInteger(5.0), isFinite(1 / 0)]", json!([true, true, false]) ; "predicates")]
#[test_case("0.1 + 0.2 === 0.3", json!(false) ; "float arithmetic")]
#[test_case("'3' * '4'", json!(12) ; "string coercion")]
#[test_case("'1' + 2", json!("12") ; "string concatenation")]
#[tokio::test]
async fn test_numbers(code: &str, expected: Value) {
    assert_eq!(eval(code).await, expected);
}

// ============================================================================
// Objects and JSON
// ============================================================================

#[test_case("Object.keys({ b: 1, a: 2 })", json!(["b", "a"]) ; "keys keep insertion order")]
#[test_case("Object.entries({ x: 1, y: 'z' })", json!([["x", 1], ["y", "z"]]) ; "entries")]
#[test_case("Object.fromEntries([['a', 1], ['b', 2]])", json!({"a": 1, "b": 2}) ; "from entries")]
#[test_case("Object.assign({ a: 1 }, { b: 2 }, { a: 3 })", json!({"a": 3, "b": 2}) ; "assign")]
#[test_case("const base = { a: 1 }; ({ ...base, b: 2, ['c' + 1]: 3 })", json!({"a": 1, "b": 2, "c1": 3}) ; "spread and computed keys")]
#[test_case("const o = { a: 1 }; o.missing === undefined && 'a' in o", json!(true) ; "missing keys")]
#[test_case("JSON.parse('{\"a\": [1, 2]}').a[1]", json!(2) ; "json parse")]
#[test_case("JSON.stringify({ a: [1, 2], b: 'x' })", json!("{\"a\":[1,2],\"b\":\"x\"}") ; "json stringify")]
#[test_case("JSON.stringify({ a: [1] }, null, 2)", json!("{\n  \"a\": [\n    1\n  ]\n}") ; "json stringify indent")]
#[test_case("const a = { n: 1 }; const b = a; b.n = 2; a.n", json!(2) ; "reference aliasing")]
#[test_case("const { a, b: { c = 5 } = {}, ...rest } = { a: 1, d: 4, e: 5 }; [a, c, rest]", json!([1, 5, {"d": 4, "e": 5}]) ; "destructuring")]
#[tokio::test]
async fn test_objects(code: &str, expected: Value) {
    assert_eq!(eval(code).await, expected);
}

// ============================================================================
// Control flow and functions
// ============================================================================

#[tokio::test]
async fn test_loops_and_accumulators() {
    let code = r#"
        const totals = {};
        const orders = [
            { customer: "ann", amount: 10 },
            { customer: "bob", amount: 5 },
            { customer: "ann", amount: 7 },
        ];
        for (const order of orders) {
            totals[order.customer] = (totals[order.customer] ?? 0) + order.amount;
        }
        const lines = [];
        for (const name in totals) {
            lines.push(`${name}:${totals[name]}`);
        }
        lines.join(",")
    "#;
    assert_eq!(eval(code).await, json!("ann:17,bob:5"));
}

#[tokio::test]
async fn test_closures_and_higher_order_functions() {
    let code = r#"
        function counter() {
            let count = 0;
            return { next: () => ++count, peek: () => count };
        }
        const c = counter();
        c.next();
        c.next();
        const compose = (f, g) => (x) => f(g(x));
        [c.peek(), compose((x) => x + 1, (x) => x * 2)(5)]
    "#;
    assert_eq!(eval(code).await, json!([2, 11]));
}

#[tokio::test]
async fn test_conditional_returns() {
    let code = r#"
        function grade(score) {
            if (score >= 90) return "A";
            else if (score >= 80) return "B";
            return score > 0 ? "C" : "F";
        }
        [95, 85, 10, 0].map(grade)
    "#;
    assert_eq!(eval(code).await, json!(["A", "B", "C", "F"]));
}

#[tokio::test]
async fn test_error_instances() {
    let code = r#"
        const results = [];
        try {
            throw new TypeError("bad type");
        } catch (e) {
            results.push(e instanceof TypeError, e instanceof Error, e.name, e.message);
        }
        try {
            null.x;
        } catch (e) {
            results.push(e instanceof TypeError);
        }
        results
    "#;
    assert_eq!(
        eval(code).await,
        json!([true, true, "TypeError", "bad type", true])
    );
}

#[tokio::test]
async fn test_typed_error_reported() {
    assert_eq!(
        eval_error(r#"throw new RangeError("out of range")"#).await,
        "RangeError: out of range"
    );
    assert_eq!(
        eval_error("const x = 1; x = 2;").await,
        "TypeError: Assignment to constant variable."
    );
    assert_eq!(
        eval_error("const o = {}; o.run()").await,
        "TypeError: o.run is not a function"
    );
}

// ============================================================================
// Promises
// ============================================================================

#[tokio::test]
async fn test_promise_combinators() {
    let code = r#"
        const all = await Promise.all([1, Promise.resolve(2), (async () => 3)()]);
        const settled = await Promise.allSettled([Promise.resolve("ok"), Promise.reject("no")]);
        const first = await Promise.race([Promise.resolve("fast")]);
        ({ all, settled, first })
    "#;
    assert_eq!(
        eval(code).await,
        json!({
            "all": [1, 2, 3],
            "settled": [
                {"status": "fulfilled", "value": "ok"},
                {"status": "rejected", "reason": "no"}
            ],
            "first": "fast"
        })
    );
}

#[tokio::test]
async fn test_promise_all_rejects_on_first_failure() {
    let code = r#"
        let caught;
        try {
            await Promise.all([Promise.resolve(1), Promise.reject(new Error("second failed"))]);
        } catch (e) {
            caught = e.message;
        }
        caught
    "#;
    assert_eq!(eval(code).await, json!("second failed"));
}

#[tokio::test]
async fn test_promise_constructor_and_then() {
    let code = r#"
        const p = new Promise((resolve) => resolve(20));
        const doubled = await p.then((x) => x * 2);
        const recovered = await Promise.reject(new Error("x")).catch((e) => "recovered " + e.message);
        [doubled, recovered]
    "#;
    assert_eq!(eval(code).await, json!([40, "recovered x"]));
}

#[tokio::test]
async fn test_async_functions() {
    let code = r#"
        async function load(n) {
            const value = await Promise.resolve(n);
            return value + 1;
        }
        const results = [];
        for (const n of [1, 2, 3]) {
            results.push(await load(n));
        }
        results
    "#;
    assert_eq!(eval(code).await, json!([2, 3, 4]));
}

#[tokio::test]
async fn test_unhandled_rejection_fails_execution() {
    assert_eq!(
        eval_error(r#"await Promise.reject(new Error("rejected"))"#).await,
        "rejected"
    );
}
