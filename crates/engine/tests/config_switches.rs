use composite_engine::{
    CompositeDescription, Dependencies, EngineConfig, InputToken, Outcome, StepDescriptor, set_trace_enabled, trace_enabled,
};
use serde_json::json;

// The process-wide configuration is shared by every test in this binary, so
// all assertions about it live in one test.
#[test]
fn process_wide_switches_apply_to_later_evaluations() {
    EngineConfig::default().install();
    assert!(!trace_enabled());

    set_trace_enabled(true);
    assert!(trace_enabled());
    assert!(EngineConfig::current().audit_dependencies);

    let resolved = CompositeDescription::new("withUnusedDependency")
        .compose(false)
        .steps(|| vec![StepDescriptor::new().dependencies(["unused"]).compute(|_, _| Ok(Outcome::exit(1))).into()])
        .build()
        .expect("template builds")
        .instantiate(Vec::<(String, InputToken)>::new())
        .expect("instantiates")
        .to_resolved_composition()
        .expect("resolves");

    EngineConfig {
        trace_steps: true,
        audit_dependencies: false,
        cache_steps: true,
    }
    .install();
    assert_eq!(
        resolved.compute(&Dependencies::new()).expect("audit disabled"),
        json!(1)
    );

    EngineConfig::default().install();
    let error = resolved.compute(&Dependencies::new()).expect_err("audit enabled again");
    assert!(
        error.leaves().iter().any(|leaf| leaf.to_string().contains("`unused` was declared but never used")),
        "{error}"
    );
}
