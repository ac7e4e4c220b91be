
use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use curly::{
    Context, CurlyError, CurlyInterface, EngineConfig, MemoryLoader, ParseErrorKind, Returned,
    Value, Whitespace,
};
use fixtures::{
    DeferredLoader, generate_random_whitespace, generate_random_whitespace_at_least_one,
    get_engine, get_engine_with_config, result_slot,
};
use pretty_assertions::assert_eq;
use rand::Rng;
use serde_json::json;

#[test]
#[ntest::timeout(100)]
fn test_literal_text_round_trips() {
    let engine = get_engine();
    let text = "Hello, world! 100% plain text; no tags <here> & \"there\".";
    engine.add_template("Template A", text).unwrap();
    assert_eq!(engine.render_to_string("Template A", json!({})).unwrap(), text);
}

#[test]
#[ntest::timeout(100)]
fn test_random_literal_text_round_trips() {
    let charset: Vec<char> = "abcXYZ019 .,;:!?()[]<>&'\"/\\-_=+*#@%$^~`|".chars().collect();
    let mut rng = rand::rng();
    let engine = get_engine();
    for _ in 0..20 {
        let length = rng.random_range(0..40);
        let text: String = (0..length)
            .map(|_| charset[rng.random_range(0..charset.len())])
            .collect();
        engine.add_template("random", &text).unwrap();
        assert_eq!(
            engine.render_to_string("random", json!({})).unwrap(),
            text,
            "literal text should render unchanged"
        );
    }
}

#[test]
#[ntest::timeout(100)]
fn test_line_breaks_are_kept_when_preserving_whitespace() {
    let engine = get_engine_with_config(EngineConfig::default().with_whitespace(Whitespace::Preserve));
    let text = "first line\n    indented\r\n\tlast";
    engine.add_template("t", text).unwrap();
    assert_eq!(engine.render_to_string("t", json!({})).unwrap(), text);
}

#[test]
#[ntest::timeout(100)]
fn test_line_breaks_are_stripped_by_default() {
    let engine = get_engine();
    engine
        .add_template("t", "<ul>\n    {#items}\n    <li>{.}</li>\n    {/items}\n</ul>")
        .unwrap();
    assert_eq!(
        engine.render_to_string("t", json!({ "items": [1, 2] })).unwrap(),
        "<ul><li>1</li><li>2</li></ul>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_mismatched_end_tag_reports_position() {
    let engine = get_engine();
    let error = engine
        .add_template("broken", "line one\n{#a}\n  x\n{/b}")
        .unwrap_err();
    let CurlyError::Parse(error) = error else {
        panic!("expected a parse error, got {error:?}");
    };
    assert_eq!(
        error.kind,
        ParseErrorKind::MissingEndTag {
            opened: "a".to_string(),
            found: Some("b".to_string()),
        }
    );
    assert_eq!((error.line, error.column), (4, 5));
    assert!(!engine.has_template("broken"));
}

#[test]
#[ntest::timeout(100)]
fn test_iteration_order() {
    let template = format!(
        "{{#{}items{}}}{{.}}{{/{}items{}}}",
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
    );
    dbg!(&template);

    let engine = get_engine();
    engine.add_template("Template A", template).unwrap();
    assert_eq!(
        engine
            .render_to_string("Template A", json!({ "items": ["a", "b", "c"] }))
            .unwrap(),
        "abc"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_section_params_with_random_whitespace() {
    let template = format!(
        "{{#user{}greeting=\"Hi\"{}punct=\"!\"{}}}{{greeting}} {{name}}{{punct}}{{/user}}",
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace(),
    );
    dbg!(&template);

    let engine = get_engine();
    engine.add_template("t", template).unwrap();
    assert_eq!(
        engine
            .render_to_string("t", json!({ "user": { "name": "Jessica" } }))
            .unwrap(),
        "Hi Jessica!"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_truthiness_boundaries() {
    let engine = get_engine();
    engine.add_template("t", "{#val}T{:else}F{/val}").unwrap();

    for (value, expected) in [
        (json!(0), "T"),
        (json!(""), "F"),
        (json!([]), "F"),
        (json!(false), "F"),
        (json!(null), "F"),
        (json!("0"), "T"),
        (json!({}), "T"),
    ] {
        assert_eq!(
            engine.render_to_string("t", json!({ "val": value })).unwrap(),
            expected,
            "val = {value}"
        );
    }
}

#[test]
#[ntest::timeout(100)]
fn test_auto_escape_and_raw() {
    let engine = get_engine();
    engine.add_template("escaped", "{ref}").unwrap();
    engine.add_template("raw", "{ref|s}").unwrap();

    let data = json!({ "ref": "<b>" });
    assert_eq!(engine.render_to_string("escaped", data.clone()).unwrap(), "&lt;b&gt;");
    assert_eq!(engine.render_to_string("raw", data).unwrap(), "<b>");
}

#[test]
#[ntest::timeout(100)]
fn test_filters() {
    let engine = get_engine();
    engine
        .add_template("t", "{q|j|s} {url|u} {url|uc} {obj|js|s} {obj|js}")
        .unwrap();
    let data = json!({
        "q": "it's \"quoted\"",
        "url": "a b/c",
        "obj": { "a": 1 },
    });
    assert_eq!(
        engine.render_to_string("t", data).unwrap(),
        "it\\'s \\\"quoted\\\" a%20b/c a%20b%2Fc {\"a\":1} {&quot;a&quot;:1}"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_block_override() {
    let engine = get_engine();
    engine
        .add_template("base", "<title>{+region}default{/region}</title>")
        .unwrap();
    engine
        .add_template("page", "{>base/}{<region}override for {name}{/region}")
        .unwrap();

    assert_eq!(
        engine.render_to_string("base", json!({})).unwrap(),
        "<title>default</title>"
    );
    assert_eq!(
        engine.render_to_string("page", json!({ "name": "me" })).unwrap(),
        "<title>override for me</title>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_missing_template_without_loader() {
    let engine = get_engine();
    let (slot, callback) = result_slot();
    engine.render("missing", json!({}), callback);

    assert_eq!(
        slot.borrow_mut().take(),
        Some(Err(CurlyError::MissingTemplate {
            template_name: "missing".to_string()
        }))
    );
}

#[test]
#[ntest::timeout(100)]
fn test_compiling_twice_is_idempotent() {
    let engine = get_engine();
    let source = "{#people}{name}{@sep}, {/sep}{/people}{>footer year=2024/}";
    let first = engine.compile(source, Some("a")).unwrap();
    let second = engine.compile(source, Some("a")).unwrap();
    assert_eq!(first, second);

    engine.register("a", first);
    engine.add_template("footer", " ({year})").unwrap();
    let data = json!({ "people": [{ "name": "A&B" }, { "name": "C" }] });
    let once = engine.render_to_string("a", data.clone()).unwrap();
    engine.register("a", second);
    let twice = engine.render_to_string("a", data).unwrap();
    assert_eq!(once, "A&amp;B, C (2024)");
    assert_eq!(once, twice);
}

#[test]
#[ntest::timeout(100)]
fn test_special_characters_comments_and_raw() {
    let engine = get_engine();
    engine
        .add_template("t", "a{~s}b{~n}c{~lb}d{~rb}{! hidden !}{`{raw} stays`}")
        .unwrap();
    assert_eq!(
        engine.render_to_string("t", json!({ "raw": "no" })).unwrap(),
        "a b\nc{d}{raw} stays"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_paths_and_parent_lookup() {
    let engine = get_engine();
    engine
        .add_template(
            "t",
            "{#people}{name}@{company}{.address.city}|{/people}{people[1].name}",
        )
        .unwrap();
    let data = json!({
        "company": "Acme",
        "people": [
            { "name": "Ann", "address": { "city": "Oslo" } },
            { "name": "Bob" },
        ],
    });
    assert_eq!(
        engine.render_to_string("t", data).unwrap(),
        "Ann@AcmeOslo|Bob@Acme|Bob"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_globals() {
    let engine = get_engine();
    engine.add_template("t", "{site}: {title}").unwrap();

    let (slot, callback) = result_slot();
    let context = Context::with_global(json!({ "site": "Docs", "title": "ignored" }))
        .push(json!({ "title": "Intro" }));
    engine.render_with_context("t", context, callback);
    assert_eq!(slot.borrow_mut().take(), Some(Ok("Docs: Intro".to_string())));
}

#[test]
#[ntest::timeout(100)]
fn test_partials_with_params_and_dynamic_names() {
    let engine = get_engine();
    engine.add_template("card", "[{title}:{kind}]").unwrap();
    engine.add_template("card-wide", "<{title}>").unwrap();
    engine
        .add_template(
            "page",
            "{>card kind=\"plain\"/}{>\"card-{size}\"/}{#item}{>card kind=\"item\"/}{/item}",
        )
        .unwrap();

    let data = json!({ "title": "T", "size": "wide", "item": { "title": "I" } });
    assert_eq!(
        engine.render_to_string("page", data).unwrap(),
        "[T:plain]<T>[I:item]"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_recursion_guard() {
    let engine = get_engine_with_config(EngineConfig::default().with_max_partial_depth(5));
    engine.add_template("self", "x{>self/}").unwrap();
    assert_eq!(
        engine.render_to_string("self", json!({})),
        Err(CurlyError::RecursivePartial {
            template_name: "self".to_string(),
            max_depth: 5
        })
    );
}

#[test]
#[ntest::timeout(100)]
fn test_self_referencing_block_is_an_error() {
    let engine = get_engine();
    engine.add_template("base", "<t>{+title/}</t>").unwrap();
    engine
        .add_template("page", "{>base/}{<title}X{+title/}{/title}")
        .unwrap();
    assert_eq!(
        engine.render_to_string("page", json!({})),
        Err(CurlyError::RecursiveBlock {
            block: "title".to_string(),
            max_depth: 64
        })
    );
}

#[test]
#[ntest::timeout(100)]
fn test_nested_block_prefers_the_partial_definition() {
    let engine = get_engine();
    engine
        .add_template("base", "{+outer/}{<inner}base-inner{/inner}")
        .unwrap();
    engine
        .add_template(
            "page",
            "{>base/}{<outer}[{+inner/}]{/outer}{<inner}page-inner{/inner}",
        )
        .unwrap();
    assert_eq!(
        engine.render_to_string("page", json!({})).unwrap(),
        "[base-inner]"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_context_functions() {
    let engine = get_engine();
    engine
        .add_template("t", "{greet}|{#twice}[{.}]{/twice}|{#wrap}inner{/wrap}")
        .unwrap();

    let mut data = BTreeMap::new();
    data.insert(
        "greet".to_string(),
        Value::function(|chunk, context, _, _| {
            let name = context.get("name").unwrap_or_default();
            Ok(Returned::Chunk(chunk.write(&format!("hi {name}"))))
        }),
    );
    data.insert(
        "twice".to_string(),
        Value::function(|_, _, _, _| Ok(Returned::Value(Value::from(vec![Value::from(1), Value::from(2)])))),
    );
    data.insert(
        "wrap".to_string(),
        Value::function(|chunk, context, bodies, _| {
            let chunk = chunk.write("(");
            let chunk = match bodies.block() {
                Some(body) => body.render(chunk, context)?,
                None => chunk,
            };
            Ok(Returned::Chunk(chunk.write(")")))
        }),
    );
    data.insert("name".to_string(), Value::from("Ann"));

    assert_eq!(
        engine.render_to_string("t", Value::from(data)).unwrap(),
        "hi Ann|[1][2]|(inner)"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_async_partials_keep_source_order() {
    let engine = get_engine();
    let loader = DeferredLoader::new();
    engine.set_loader(loader.clone());
    engine.add_template("page", "A{>one/}B{>two/}C").unwrap();

    let (slot, callback) = result_slot();
    engine.render("page", json!({ "n": 2 }), callback);
    assert_eq!(loader.pending(), vec!["one", "two"]);
    assert!(slot.borrow().is_none());

    assert!(loader.answer("two", Ok("{n}".to_string())));
    assert!(slot.borrow().is_none(), "the first partial is still loading");

    assert!(loader.answer("one", Ok("1".to_string())));
    assert_eq!(slot.borrow_mut().take(), Some(Ok("A1B2C".to_string())));
    assert!(engine.has_template("one"));
    assert!(engine.has_template("two"));
}

#[test]
#[ntest::timeout(100)]
fn test_stream_emits_in_order_as_branches_complete() {
    let engine = get_engine();
    let loader = DeferredLoader::new();
    engine.set_loader(loader.clone());
    engine.add_template("page", "A{>one/}B{>two/}C").unwrap();

    let data = Rc::new(RefCell::new(String::new()));
    let ended = Rc::new(RefCell::new(0));
    let (data_sink, end_sink) = (Rc::clone(&data), Rc::clone(&ended));
    engine
        .stream("page", json!({}))
        .on_data(move |chunk| data_sink.borrow_mut().push_str(chunk))
        .on_end(move || *end_sink.borrow_mut() += 1);

    assert_eq!(engine.run_pending(), 1);
    assert_eq!(*data.borrow(), "A");

    loader.answer("two", Ok("2".to_string()));
    assert_eq!(*data.borrow(), "A");
    assert_eq!(*ended.borrow(), 0);

    loader.answer("one", Ok("1".to_string()));
    assert_eq!(*data.borrow(), "A1B2C");
    assert_eq!(*ended.borrow(), 1);
}

#[test]
#[ntest::timeout(100)]
fn test_stream_error_stops_data_and_end() {
    let engine = get_engine();
    let loader = DeferredLoader::new();
    engine.set_loader(loader.clone());
    engine.add_template("page", "A{>one/}B").unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let (on_data, on_end, on_error) = (Rc::clone(&events), Rc::clone(&events), Rc::clone(&events));
    engine
        .stream("page", json!({}))
        .on_data(move |chunk| on_data.borrow_mut().push(format!("data:{chunk}")))
        .on_end(move || on_end.borrow_mut().push("end".to_string()))
        .on_error(move |error| on_error.borrow_mut().push(format!("error:{error}")));
    engine.run_pending();

    let failure = CurlyError::Loader {
        template_name: "one".to_string(),
        message: "offline".to_string(),
    };
    loader.answer("one", Err(failure.clone()));
    assert_eq!(
        *events.borrow(),
        vec!["data:A".to_string(), format!("error:{failure}")]
    );
}

#[test]
#[ntest::timeout(100)]
fn test_loader_errors_reach_the_callback() {
    let engine = get_engine();
    let loader = DeferredLoader::new();
    engine.set_loader(loader.clone());

    let (slot, callback) = result_slot();
    engine.render("page", json!({}), callback);
    assert_eq!(loader.pending(), vec!["page"]);
    loader.answer("page", Ok("{#a}".to_string()));

    assert!(matches!(
        slot.borrow_mut().take(),
        Some(Err(CurlyError::Parse(_)))
    ));
    assert!(!engine.has_template("page"));
}

#[test]
#[ntest::timeout(100)]
fn test_memory_loader() {
    let engine = get_engine();
    engine.set_loader(MemoryLoader::with_templates([
        ("layout", "<main>{>body/}</main>"),
        ("body", "{msg}"),
    ]));
    assert_eq!(
        engine.render_to_string("layout", json!({ "msg": "ok" })).unwrap(),
        "<main>ok</main>"
    );
    assert!(matches!(
        engine.render_to_string("nope", json!({})),
        Err(CurlyError::Loader { .. })
    ));
}

#[test]
#[ntest::timeout(100)]
fn test_pipe_to_writer() {
    #[derive(Clone, Default)]
    struct Buffer(Rc<RefCell<Vec<u8>>>);

    impl std::io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let engine = get_engine();
    engine.add_template("t", "{#items}{.};{/items}").unwrap();
    let buffer = Buffer::default();
    engine
        .stream("t", json!({ "items": ["x", "y"] }))
        .pipe(buffer.clone());
    engine.run_pending();
    assert_eq!(String::from_utf8(buffer.0.take()).unwrap(), "x;y;");
}
