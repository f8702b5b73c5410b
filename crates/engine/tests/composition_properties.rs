use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use composite_engine::{
    CacheMode, CompositeDescription, CompositeError, CompositeTemplate, Dependencies, DependencyRef, EngineConfig, ErrorContext,
    EvaluationMode, InputDescriptor, InputToken, Outcome, StepDescriptor, SubroutineCall, ValueType, dependencies,
};
use serde_json::{Value, json};

fn config() -> EngineConfig {
    EngineConfig {
        trace_steps: false,
        audit_dependencies: true,
        cache_steps: true,
    }
}

fn no_options() -> Vec<(String, InputToken)> {
    Vec::new()
}

fn double_template() -> CompositeTemplate {
    CompositeDescription::new("double")
        .input("n", InputDescriptor::dynamic().value_type(ValueType::Number))
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .dependencies([DependencyRef::input("n")])
                    .compute(|step, _| {
                        let n = step.input("n").and_then(Value::as_i64).unwrap_or_default();
                        Ok(Outcome::exit(n * 2))
                    })
                    .into(),
            ]
        })
        .build()
        .expect("double builds")
}

fn total_template(explicit_raise: bool) -> CompositeTemplate {
    CompositeDescription::new("withTotal")
        .outputs(["#total"])
        .steps(move || {
            vec![
                StepDescriptor::new()
                    .compute(|_, continuation| {
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("first step composes"))?;
                        Ok(continuation.proceed_with(dependencies([("#partial", json!(2))])))
                    })
                    .into(),
                StepDescriptor::new()
                    .dependencies(["#partial"])
                    .compute(move |step, continuation| {
                        let partial = step.get("#partial").and_then(Value::as_i64).unwrap_or_default();
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("base step composes"))?;
                        let produced = dependencies([("#total", json!(partial + 3))]);
                        if explicit_raise {
                            continuation.raise_output(produced)
                        } else {
                            Ok(continuation.proceed_with(produced))
                        }
                    })
                    .into(),
            ]
        })
        .build()
        .expect("withTotal builds")
}

#[test]
fn instantiating_with_exactly_the_declared_inputs_succeeds() {
    let template = CompositeDescription::new("withRange")
        .input("from", InputDescriptor::dynamic())
        .input("limit", InputDescriptor::dynamic().default_value(10))
        .steps(|| vec![StepDescriptor::new().compute(|_, _| Ok(Outcome::exit(0))).into()])
        .build()
        .expect("withRange builds");

    template
        .instantiate([("from", InputToken::dependency("tracks"))])
        .expect("defaults cover `limit`");
    template
        .instantiate([("from", InputToken::dependency("tracks")), ("limit", InputToken::value(2))])
        .expect("every input supplied");

    let error = template
        .instantiate([("from", InputToken::dependency("tracks")), ("offset", InputToken::value(2))])
        .expect_err("`offset` is not declared");
    assert_eq!(
        error.context(),
        Some(&ErrorContext::InputOptions {
            annotation: "withRange".into()
        })
    );
    assert!(
        error
            .leaves()
            .iter()
            .any(|leaf| matches!(leaf, CompositeError::UnexpectedInput { input } if input == "offset")),
        "{error}"
    );
}

#[test]
fn describe_then_resolve_is_idempotent() {
    let instance = double_template()
        .instantiate([("n", InputToken::dependency("amount"))])
        .expect("double instantiates");

    let first = instance
        .to_description()
        .instantiate()
        .and_then(|instance| instance.to_resolved_composition())
        .expect("first round resolves");
    let second = instance
        .to_description()
        .instantiate()
        .and_then(|instance| instance.to_description().instantiate())
        .and_then(|instance| instance.to_resolved_composition())
        .expect("second round resolves");

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.shape(), second.shape());
    assert_eq!(first.shape(), instance.to_resolved_composition().expect("resolves").shape());
}

#[test]
fn dependency_audit_names_unused_and_unavailable_dependencies() {
    let resolved = CompositeDescription::new("withAudit")
        .compose(false)
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .annotation("reads a and c")
                    .dependencies(["a", "b"])
                    .compute(|step, _| {
                        let a = step.get("a").cloned().unwrap_or_default();
                        let _ = step.get("c");
                        Ok(Outcome::Exit(a))
                    })
                    .into(),
            ]
        })
        .build()
        .expect("withAudit builds")
        .instantiate(no_options())
        .expect("withAudit instantiates")
        .to_resolved_composition()
        .expect("withAudit resolves");

    let ambient = dependencies([("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);
    let error = resolved
        .evaluate(EvaluationMode::Compute, None, &ambient, &config())
        .expect_err("audit fails on the first call");

    let rendered = format!("{error}: {}", std::error::Error::source(&error).map(ToString::to_string).unwrap_or_default());
    assert!(rendered.contains("errors in accessed dependencies"), "{rendered}");
    let leaves: Vec<String> = error.leaves().iter().map(ToString::to_string).collect();
    assert_eq!(
        leaves,
        vec![
            "dependency `b` was declared but never used".to_string(),
            "dependency `c` was used but is unavailable".to_string(),
        ]
    );

    let result = resolved
        .evaluate(EvaluationMode::Compute, None, &ambient, &config())
        .expect("the audit only runs on the first call");
    assert_eq!(result, json!(1));
}

#[test]
fn two_step_composition_returns_the_base_result() {
    let resolved = CompositeDescription::new("answer")
        .compose(false)
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .compute(|_, continuation| {
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("first step composes"))?;
                        Ok(continuation.proceed())
                    })
                    .into(),
                StepDescriptor::new().compute(|_, _| Ok(Outcome::exit(42))).into(),
            ]
        })
        .build()
        .expect("answer builds")
        .instantiate(no_options())
        .expect("answer instantiates")
        .to_resolved_composition()
        .expect("answer resolves");

    assert!(!resolved.composes());
    assert!(!resolved.updates());
    assert_eq!(resolved.compute(&Dependencies::new()).expect("computes"), json!(42));
}

#[test]
fn exit_short_circuits_later_steps() {
    let later_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&later_calls);
    let resolved = CompositeDescription::new("earlyExit")
        .compose(false)
        .steps(move || {
            let counter = Arc::clone(&counter);
            vec![
                StepDescriptor::new()
                    .compute(|_, continuation| {
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("first step composes"))?;
                        Ok(continuation.exit(7))
                    })
                    .into(),
                StepDescriptor::new()
                    .compute(move |_, continuation| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("middle step composes"))?;
                        Ok(continuation.proceed())
                    })
                    .into(),
                StepDescriptor::new().compute(|_, _| Ok(Outcome::exit(0))).into(),
            ]
        })
        .build()
        .expect("earlyExit builds")
        .instantiate(no_options())
        .expect("earlyExit instantiates")
        .to_resolved_composition()
        .expect("earlyExit resolves");

    assert_eq!(resolved.compute(&Dependencies::new()).expect("computes"), json!(7));
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn raised_outputs_are_renamed_whether_raised_or_fallen_through() {
    for explicit_raise in [true, false] {
        let resolved = total_template(explicit_raise)
            .instantiate(no_options())
            .and_then(|instance| instance.outputs([("#total", "sum")]))
            .and_then(|instance| instance.to_resolved_composition())
            .expect("withTotal resolves");

        let result = resolved
            .evaluate(EvaluationMode::Compute, None, &Dependencies::new(), &config())
            .expect("computes");
        assert_eq!(result, json!({"sum": 5}), "explicit_raise = {explicit_raise}");
    }
}

#[test]
fn aggressive_cache_invokes_the_step_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let resolved = CompositeDescription::new("withCachedLength")
        .input("items", InputDescriptor::dynamic().value_type(ValueType::Array).default_dependency("items"))
        .compose(false)
        .steps(move || {
            let counter = Arc::clone(&counter);
            vec![
                StepDescriptor::new()
                    .annotation("length")
                    .dependencies([DependencyRef::input("items")])
                    .cache(CacheMode::Aggressive)
                    .compute(move |step, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Outcome::exit(step.input("items").and_then(Value::as_array).map_or(0, Vec::len)))
                    })
                    .into(),
            ]
        })
        .build()
        .expect("withCachedLength builds")
        .instantiate(no_options())
        .expect("withCachedLength instantiates")
        .to_resolved_composition()
        .expect("withCachedLength resolves");

    let ambient = dependencies([("items", json!(["a", "b"]))]);
    for _ in 0..2 {
        let result = resolved
            .evaluate(EvaluationMode::Compute, None, &ambient, &config())
            .expect("computes");
        assert_eq!(result, json!(2));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let report = resolved.cache().report();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].annotation, "length");
    assert_eq!((report[0].hits, report[0].misses), (1, 1));

    let uncached = EngineConfig {
        cache_steps: false,
        ..config()
    };
    resolved
        .evaluate(EvaluationMode::Compute, None, &ambient, &uncached)
        .expect("computes without the cache");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn double_computes_from_an_ambient_dependency() {
    let resolved = double_template()
        .instantiate([("n", InputToken::dependency("amount"))])
        .expect("double instantiates")
        .to_resolved_composition()
        .expect("double resolves");

    assert_eq!(resolved.external_dependencies(), ["amount".to_string()]);
    assert_eq!(resolved.compute(&dependencies([("amount", json!(21))])).expect("computes"), json!(42));
}

#[test]
fn subroutine_inputs_run_as_steps_with_remapped_names() {
    let counter = CompositeDescription::new("withCount")
        .input("from", InputDescriptor::dynamic().value_type(ValueType::Array))
        .outputs(["#count"])
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .dependencies([DependencyRef::input("from")])
                    .compute(|step, continuation| {
                        let count = step.input("from").and_then(Value::as_array).map_or(0, Vec::len);
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("base step composes"))?;
                        continuation.raise_output(dependencies([("#count", json!(count))]))
                    })
                    .into(),
            ]
        })
        .build()
        .expect("withCount builds");

    let report = CompositeDescription::new("reportCount")
        .input("tracks", InputDescriptor::dynamic().default_dependency("tracks"))
        .input("counter", InputDescriptor::subroutine(["from"], ["#count"]))
        .compose(false)
        .steps(|| {
            vec![
                SubroutineCall::new("counter")
                    .with_input("from", InputToken::input("tracks"))
                    .with_output("#count", "#trackCount")
                    .into(),
                StepDescriptor::new()
                    .dependencies(["#trackCount"])
                    .compute(|step, _| Ok(Outcome::Exit(step.get("#trackCount").cloned().unwrap_or_default())))
                    .into(),
            ]
        })
        .build()
        .expect("reportCount builds");

    let resolved = report
        .instantiate([("counter", InputToken::subroutine(counter))])
        .expect("reportCount instantiates")
        .to_resolved_composition()
        .expect("reportCount resolves");

    let result = resolved
        .evaluate(EvaluationMode::Compute, None, &dependencies([("tracks", json!([1, 2, 3]))]), &config())
        .expect("computes");
    assert_eq!(result, json!(3));
}

#[test]
fn nested_failures_read_as_a_causal_chain() {
    let inner = CompositeDescription::new("withStrictCount")
        .input("from", InputDescriptor::dynamic().value_type(ValueType::Array))
        .outputs(["#count"])
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .dependencies([DependencyRef::input("from")])
                    .compute(|_, _| anyhow::bail!("unreachable"))
                    .into(),
            ]
        })
        .build()
        .expect("inner builds");

    let resolved = CompositeDescription::new("outer")
        .input("tracks", InputDescriptor::dynamic().default_dependency("tracks"))
        .compose(false)
        .steps(move || {
            vec![
                inner
                    .instantiate([("from", InputToken::input("tracks"))])
                    .expect("inner instantiates")
                    .into(),
                StepDescriptor::new().compute(|_, _| Ok(Outcome::exit(0))).into(),
            ]
        })
        .build()
        .expect("outer builds")
        .instantiate(no_options())
        .expect("outer instantiates")
        .to_resolved_composition()
        .expect("outer resolves");

    let error = resolved
        .evaluate(EvaluationMode::Compute, None, &dependencies([("tracks", json!("not a list"))]), &config())
        .expect_err("inner input is invalid");

    let mut chain = Vec::new();
    let mut current: Option<&dyn std::error::Error> = Some(&error);
    while let Some(cause) = current {
        chain.push(cause.to_string());
        current = cause.source();
    }
    assert_eq!(chain[0], "error computing composition `outer`");
    assert_eq!(chain[1], "error computing composition `withStrictCount`");
    assert!(chain[2].starts_with("errors in input values provided to `withStrictCount`"), "{chain:?}");
}

fn expose_dependency_template() -> CompositeTemplate {
    CompositeDescription::new("exposeDependency")
        .input("dependency", InputDescriptor::dynamic())
        .compose(false)
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .dependencies([DependencyRef::input("dependency")])
                    .compute(|step, _| Ok(Outcome::Exit(step.input("dependency").cloned().unwrap_or_default())))
                    .into(),
            ]
        })
        .build()
        .expect("exposeDependency builds")
}

#[test]
fn non_composing_nested_composition_can_end_a_composition() {
    let resolved = CompositeDescription::new("withExposedTotal")
        .compose(false)
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .compute(|_, continuation| {
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("first step composes"))?;
                        Ok(continuation.proceed_with(dependencies([("#total", json!(5))])))
                    })
                    .into(),
                expose_dependency_template()
                    .instantiate([("dependency", InputToken::dependency("#total"))])
                    .expect("exposeDependency instantiates")
                    .into(),
            ]
        })
        .build()
        .expect("withExposedTotal builds")
        .instantiate(no_options())
        .expect("withExposedTotal instantiates")
        .to_resolved_composition()
        .expect("a non-composing base step resolves");

    assert!(resolved.exposes());
    assert_eq!(
        resolved
            .evaluate(EvaluationMode::Compute, None, &Dependencies::new(), &config())
            .expect("computes"),
        json!(5)
    );
}

#[test]
fn non_composing_nested_composition_is_rejected_before_the_base_step() {
    let error = CompositeDescription::new("withMisplacedExpose")
        .compose(false)
        .steps(|| {
            vec![
                expose_dependency_template()
                    .instantiate([("dependency", InputToken::dependency("total"))])
                    .expect("exposeDependency instantiates")
                    .into(),
                StepDescriptor::new().compute(|_, _| Ok(Outcome::exit(0))).into(),
            ]
        })
        .build()
        .expect("withMisplacedExpose builds")
        .instantiate(no_options())
        .expect("withMisplacedExpose instantiates")
        .to_resolved_composition()
        .expect_err("only the base step may stop composing");

    let rendered = error.to_string();
    assert!(rendered.contains("errors in step #0 (`exposeDependency`)"), "{rendered}");
    assert!(rendered.contains("can only be the last step"), "{rendered}");
}

#[test]
fn myself_and_this_property_read_the_ambient_markers() {
    let resolved = CompositeDescription::new("describeSelf")
        .input("subject", InputDescriptor::dynamic())
        .compose(false)
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .dependencies([DependencyRef::input("subject"), DependencyRef::Myself, DependencyRef::ThisProperty])
                    .compute(|step, _| {
                        Ok(Outcome::exit(json!({
                            "subject": step.input("subject"),
                            "myself": step.myself(),
                            "property": step.this_property(),
                        })))
                    })
                    .into(),
            ]
        })
        .build()
        .expect("describeSelf builds")
        .instantiate([("subject", InputToken::myself())])
        .expect("describeSelf instantiates")
        .to_resolved_composition()
        .expect("describeSelf resolves");

    assert_eq!(resolved.external_dependencies(), ["this".to_string(), "thisProperty".to_string()]);

    let album = json!({"title": "Abbey Road"});
    let ambient = dependencies([("this", album.clone()), ("thisProperty", json!("title"))]);
    let result = resolved
        .evaluate(EvaluationMode::Compute, None, &ambient, &config())
        .expect("computes");
    assert_eq!(result, json!({"subject": album, "myself": album, "property": "title"}));
}

#[test]
fn raising_above_the_top_level_composition_fails() {
    let resolved = CompositeDescription::new("withLift")
        .outputs(["#lifted"])
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .compute(|_, continuation| {
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("base step composes"))?;
                        continuation.raise_output_above(dependencies([("#lifted", json!(1))]))
                    })
                    .into(),
            ]
        })
        .build()
        .expect("withLift builds")
        .instantiate(no_options())
        .expect("withLift instantiates")
        .to_resolved_composition()
        .expect("withLift resolves");

    let error = resolved
        .evaluate(EvaluationMode::Compute, None, &Dependencies::new(), &config())
        .expect_err("nothing encloses the top level");
    let leaves: Vec<String> = error.leaves().iter().map(ToString::to_string).collect();
    assert_eq!(leaves, vec!["composition `withLift` raised output above the top-level composition".to_string()]);
}

fn non_composing_raise(through_continuation: bool) -> CompositeError {
    CompositeDescription::new("withStrayRaise")
        .compose(false)
        .steps(move || {
            vec![
                StepDescriptor::new()
                    .compute(move |_, continuation| {
                        let produced = dependencies([("#total", json!(1))]);
                        match continuation {
                            Some(continuation) if through_continuation => continuation.raise_output(produced),
                            _ => Ok(Outcome::RaiseOutput(produced)),
                        }
                    })
                    .into(),
                StepDescriptor::new().compute(|_, _| Ok(Outcome::exit(0))).into(),
            ]
        })
        .build()
        .expect("withStrayRaise builds")
        .instantiate(no_options())
        .expect("withStrayRaise instantiates")
        .to_resolved_composition()
        .expect("withStrayRaise resolves")
        .evaluate(EvaluationMode::Compute, None, &Dependencies::new(), &config())
        .expect_err("a composition that does not compose cannot raise")
}

#[test]
fn raising_output_requires_a_composing_composition() {
    let error = non_composing_raise(true);
    let messages: Vec<String> = error
        .leaves()
        .iter()
        .map(|leaf| match leaf {
            CompositeError::Step(step_error) => format!("{step_error:#}"),
            other => other.to_string(),
        })
        .collect();
    assert!(
        messages
            .iter()
            .any(|message| message.contains("`raiseOutput` is unavailable because `withStrayRaise` does not compose")),
        "{messages:?}"
    );

    let error = non_composing_raise(false);
    let leaves: Vec<String> = error.leaves().iter().map(ToString::to_string).collect();
    assert_eq!(
        leaves,
        vec!["composition `withStrayRaise` cannot raise output because it does not compose".to_string()]
    );
}
