//! Built-in compositions the console can describe and run.

use composite_engine::{
    CacheMode, CompositeDescription, DependencyRef, InputDescriptor, InputToken, Outcome, Result, StepDescriptor, TemplateInstance,
    UpdateDescription, ValueType, dependencies,
};
use serde_json::{Value, json};

/// A named composition bundled with the console.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub name: &'static str,
    pub summary: &'static str,
    build: fn() -> Result<TemplateInstance>,
}

impl Sample {
    pub fn instance(&self) -> Result<TemplateInstance> {
        (self.build)()
    }
}

pub fn catalog() -> [Sample; 3] {
    [
        Sample {
            name: "double",
            summary: "doubles the `amount` dependency",
            build: double,
        },
        Sample {
            name: "album-duration",
            summary: "sums `tracks[].duration` through a cached nested composition and formats it as m:ss",
            build: album_duration,
        },
        Sample {
            name: "title-case",
            summary: "transforms a string value to title case (run with --value)",
            build: title_case,
        },
    ]
}

pub fn find(name: &str) -> Option<Sample> {
    catalog().into_iter().find(|sample| sample.name == name)
}

fn double() -> Result<TemplateInstance> {
    CompositeDescription::new("double")
        .input("n", InputDescriptor::dynamic().value_type(ValueType::Number))
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .annotation("double n")
                    .dependencies([DependencyRef::input("n")])
                    .compute(|step, _| {
                        let n = step.input("n").cloned().unwrap_or_default();
                        Ok(Outcome::exit(double_number(&n)))
                    })
                    .into(),
            ]
        })
        .build()?
        .instantiate([("n", InputToken::dependency("amount"))])
}

/// Integers stay integers unless doubling overflows.
fn double_number(n: &Value) -> Value {
    match n.as_i64().and_then(|integer| integer.checked_mul(2)) {
        Some(doubled) => json!(doubled),
        None => json!(n.as_f64().unwrap_or_default() * 2.0),
    }
}

fn with_total_duration() -> Result<TemplateInstance> {
    CompositeDescription::new("withTotalDuration")
        .input("from", InputDescriptor::dynamic().value_type(ValueType::Array))
        .outputs(["#totalDuration"])
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .annotation("collect durations")
                    .dependencies([DependencyRef::input("from")])
                    .cache(CacheMode::Aggressive)
                    .compute(|step, continuation| {
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("`collect durations` must compose"))?;
                        let durations: Vec<Value> = step
                            .input("from")
                            .and_then(Value::as_array)
                            .map(|tracks| tracks.iter().filter_map(|track| track.get("duration").cloned()).collect())
                            .unwrap_or_default();
                        if durations.is_empty() {
                            return Ok(continuation.exit(0));
                        }
                        Ok(continuation.proceed_with(dependencies([("#durations", Value::Array(durations))])))
                    })
                    .into(),
                StepDescriptor::new()
                    .annotation("sum durations")
                    .dependencies(["#durations"])
                    .compute(|step, continuation| {
                        let total: f64 = step
                            .get("#durations")
                            .and_then(Value::as_array)
                            .map(|durations| durations.iter().filter_map(Value::as_f64).sum())
                            .unwrap_or_default();
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("`sum durations` must compose"))?;
                        continuation.raise_output(dependencies([("#totalDuration", json!(total))]))
                    })
                    .into(),
            ]
        })
        .build()?
        .instantiate([("from", InputToken::input("tracks"))])
}

fn album_duration() -> Result<TemplateInstance> {
    CompositeDescription::new("albumDuration")
        .input("tracks", InputDescriptor::dynamic().value_type(ValueType::Array).default_dependency("tracks"))
        .compose(false)
        .steps(|| {
            let total = with_total_duration().and_then(|instance| instance.outputs([("#totalDuration", "#seconds")]));
            let total_step = match total {
                Ok(instance) => instance.into(),
                Err(error) => {
                    let message = error.to_string();
                    StepDescriptor::new()
                        .annotation("withTotalDuration")
                        .compute(move |_, _| anyhow::bail!("{message}"))
                        .into()
                }
            };
            vec![
                total_step,
                StepDescriptor::new()
                    .annotation("format duration")
                    .dependencies(["#seconds"])
                    .compute(|step, _| {
                        let seconds = step.get("#seconds").and_then(Value::as_f64).unwrap_or_default().round() as u64;
                        Ok(Outcome::exit(format!("{}:{:02}", seconds / 60, seconds % 60)))
                    })
                    .into(),
            ]
        })
        .build()?
        .instantiate(Vec::<(String, InputToken)>::new())
}

fn title_case() -> Result<TemplateInstance> {
    CompositeDescription::new("titleCase")
        .compose(false)
        .update(UpdateDescription::new().value_type(ValueType::String))
        .steps(|| {
            vec![
                StepDescriptor::new()
                    .annotation("capitalize words")
                    .transform(|value, _, continuation| {
                        let text = value.as_str().unwrap_or_default();
                        let words: Vec<String> = text.split_whitespace().map(capitalize).collect();
                        let continuation = continuation.ok_or_else(|| anyhow::anyhow!("`capitalize words` must compose"))?;
                        Ok(continuation.proceed_with_value(words.join(" "), dependencies([("#words", json!(words.len()))])))
                    })
                    .into(),
                StepDescriptor::new()
                    .annotation("report words")
                    .dependencies(["#words"])
                    .transform(|value, step, _| {
                        let words = step.get("#words").cloned().unwrap_or_default();
                        Ok(Outcome::exit(json!({ "title": value, "words": words })))
                    })
                    .into(),
            ]
        })
        .build()?
        .instantiate(Vec::<(String, InputToken)>::new())
}

fn capitalize(word: &str) -> String {
    let mut characters = word.chars();
    match characters.next() {
        Some(first) => first.to_uppercase().chain(characters.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
