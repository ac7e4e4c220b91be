
use curly::{CurlyEngine, CurlyError, CurlyInterface, Value};
use fixtures::get_engine;
use pretty_assertions::assert_eq;
use serde_json::json;

fn render(engine: &CurlyEngine, source: &str, data: serde_json::Value) -> String {
    engine.add_template("t", source).unwrap();
    engine.render_to_string("t", data).unwrap()
}

#[test]
#[ntest::timeout(100)]
fn test_select_renders_first_match_only() {
    let engine = get_engine();
    let source = "{@select key=kind}\
        {@eq value=\"a\"}A{/eq}\
        {@eq value=\"b\"}B{/eq}\
        {@eq value=\"b\"}again{/eq}\
        {@default}D{/default}\
        {/select}";

    assert_eq!(render(&engine, source, json!({ "kind": "b" })), "B");
    assert_eq!(render(&engine, source, json!({ "kind": "z" })), "D");
}

#[test]
#[ntest::timeout(100)]
fn test_comparisons_with_key() {
    let engine = get_engine();
    let data = json!({ "n": 3, "s": "3", "word": "pear" });

    assert_eq!(render(&engine, "{@eq key=n value=3}y{:else}n{/eq}", data.clone()), "y");
    assert_eq!(render(&engine, "{@eq key=n value=s}y{:else}n{/eq}", data.clone()), "n");
    assert_eq!(
        render(&engine, "{@eq key=n value=s type=\"number\"}y{:else}n{/eq}", data.clone()),
        "y"
    );
    assert_eq!(render(&engine, "{@ne key=n value=4}y{/ne}", data.clone()), "y");
    assert_eq!(render(&engine, "{@lt key=n value=4}y{/lt}", data.clone()), "y");
    assert_eq!(render(&engine, "{@lte key=n value=s}y{/lte}", data.clone()), "y");
    assert_eq!(render(&engine, "{@gt key=n value=2}y{/gt}", data.clone()), "y");
    assert_eq!(render(&engine, "{@gte key=n value=5}y{:else}n{/gte}", data.clone()), "n");
    assert_eq!(
        render(&engine, "{@gt key=word value=\"apple\"}later{/gt}", data.clone()),
        "later"
    );
    assert_eq!(
        render(&engine, "{@eq key=word value=\"{word}\"}same{/eq}", data),
        "same"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_comparison_without_key_renders_nothing() {
    let engine = get_engine();
    assert_eq!(render(&engine, "[{@eq value=1}y{:else}n{/eq}]", json!({})), "[]");
}

#[test]
#[ntest::timeout(100)]
fn test_sep_and_idx() {
    let engine = get_engine();
    assert_eq!(
        render(
            &engine,
            "{#items}{@idx}{.}{/idx}:{.}{@sep}, {/sep}{/items}",
            json!({ "items": ["a", "b", "c"] })
        ),
        "0:a, 1:b, 2:c"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_math() {
    let engine = get_engine();
    let data = json!({ "a": 7, "b": "2" });

    assert_eq!(render(&engine, "{@math key=a method=\"add\" operand=b/}", data.clone()), "9");
    assert_eq!(
        render(&engine, "{@math key=a method=\"subtract\" operand=10/}", data.clone()),
        "-3"
    );
    assert_eq!(render(&engine, "{@math key=a method=\"divide\" operand=b/}", data.clone()), "3.5");
    assert_eq!(
        render(&engine, "{@math key=a method=\"divide\" operand=b round=\"true\"/}", data.clone()),
        "4"
    );
    assert_eq!(render(&engine, "{@math key=a method=\"mod\" operand=b/}", data.clone()), "1");
    assert_eq!(render(&engine, "{@math key=\"-2.5\" method=\"abs\"/}", data.clone()), "2.5");
    assert_eq!(render(&engine, "[{@math key=a method=\"pow\" operand=b/}]", data.clone()), "[]");
    assert_eq!(
        render(
            &engine,
            "{@math key=a method=\"mod\" operand=2}{@eq value=0}even{:else}odd{/eq}{/math}",
            data
        ),
        "odd"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_size() {
    let engine = get_engine();
    let data = json!({
        "list": [1, 2, 3],
        "map": { "a": 1, "b": 2 },
        "word": "héllo",
        "num": 42,
        "empty": "",
    });
    assert_eq!(
        render(
            &engine,
            "{@size key=list/} {@size key=map/} {@size key=word/} {@size key=num/} {@size key=empty/} {@size key=missing/}",
            data
        ),
        "3 2 5 42 0 0"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_context_dump() {
    let engine = get_engine();
    assert_eq!(
        render(&engine, "{#user}{@contextDump/}{/user}", json!({ "user": { "name": "x" } })),
        "{\n  \"name\": \"x\"\n}"
    );
    assert_eq!(
        render(&engine, "[{@contextDump to=\"console\"/}]", json!({ "a": 1 })),
        "[]"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_custom_helper_overrides_builtin() {
    let engine = get_engine();
    engine.register_helper("sep", |chunk, _, _, _| Ok(chunk.write("|")));
    assert_eq!(
        render(&engine, "{#items}{.}{@sep/}{/items}", json!({ "items": [1, 2] })),
        "1|2|"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_helper_params_can_be_inline_bodies() {
    let engine = get_engine();
    engine.register_helper("echo", |chunk, context, _, params| {
        let value = params.get("text").cloned().unwrap_or(Value::Null);
        let text = curly::tap(&value, &chunk, context);
        Ok(chunk.write(&format!("<{text}>")))
    });
    assert_eq!(
        render(&engine, "{@echo text=\"hi {name}\"/}", json!({ "name": "Ann" })),
        "<hi Ann>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_failing_helper_does_not_stop_the_render() {
    let engine = get_engine();
    engine.register_helper("fail", |_, _, _, _| Err(CurlyError::helper("fail", "no luck")));
    assert_eq!(
        render(
            &engine,
            "a{@fail}x{:else}y{/fail}b{#items}[{@fail/}{.}]{/items}{name}",
            json!({ "items": [1, 2], "name": "Ann" })
        ),
        "ab[1][2]Ann"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_unknown_helper_is_skipped() {
    let engine = get_engine();
    assert_eq!(render(&engine, "a{@nothing}b{/nothing}c", json!({})), "ac");
}
