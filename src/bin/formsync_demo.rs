//! Password-confirmation walkthrough.
//!
//! Mounts `password` and `confirmPassword`, wires them as mutual
//! dependencies, edits both and submits, printing the aggregated state
//! after each step.

use anyhow::Result;
use clap::Parser;
use form_sync::{
    suite_fn, AggregatedState, DependencyMap, EngineConfig, FormEngine, RootMode, SuiteResult,
    ROOT_KEY,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "formsync-demo")]
#[command(about = "Run the password confirmation scenario through the form engine")]
struct Args {
    /// Engine configuration (YAML or JSON); defaults are used when omitted
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[arg(long, default_value = "correct horse")]
    password: String,

    #[arg(long, default_value = "correct h0rse")]
    confirm: String,

    /// Run root validation on every change instead of only after submit
    #[arg(long)]
    live: bool,
}

fn text(snapshot: &Value, key: &str) -> String {
    snapshot
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn print_state(step: &str, state: &AggregatedState) -> Result<()> {
    println!("── {step} ──");
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    form_sync::telemetry::init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default().with_field_debounce(Duration::from_millis(50)),
    };
    if args.live {
        config = config.with_root_mode(RootMode::Live);
    }
    if config.dependencies.is_empty() {
        config = config.with_dependencies(
            DependencyMap::builder()
                .bidirectional("password", "confirmPassword")
                .build()?,
        );
    }

    let field_rules = suite_fn(|snapshot, field| {
        let value = snapshot.value();
        let mut result = SuiteResult::new();
        let password = text(value, "password");
        let confirm = text(value, "confirmPassword");
        let scoped = |name: &str| field.map_or(true, |f| f.as_str() == name);

        if scoped("password") {
            if password.is_empty() {
                result.add_error("password", "Password is required");
            } else if password.len() < 12 {
                result.add_warning("password", "Consider a longer password");
            }
        }
        if scoped("confirmPassword") && !confirm.is_empty() && confirm != password {
            result.add_error("confirmPassword", "Does not match password");
        }
        Ok(result)
    });

    let root_rules = suite_fn(|snapshot, _| {
        let value = snapshot.value();
        let mut result = SuiteResult::new();
        if text(value, "password") != text(value, "confirmPassword") {
            result.add_error(ROOT_KEY, "Passwords must match");
        }
        Ok(result)
    });

    let engine = FormEngine::builder()
        .config(config)
        .suite(field_rules)
        .root_suite(root_rules)
        .snapshot(json!({"password": "", "confirmPassword": ""}))
        .build();

    engine.register_field("password")?;
    engine.register_field("confirmPassword")?;

    let mut states = engine.subscribe();
    engine.set_value("confirmPassword", json!(args.confirm))?;
    engine.set_value("password", json!(args.password))?;

    // Let debounce and dependency revalidation play out
    let settle = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if states.changed().await.is_err() {
                break;
            }
            if !states.borrow().pending {
                tokio::time::sleep(Duration::from_millis(600)).await;
                if !engine.state().pending {
                    break;
                }
            }
        }
    })
    .await;
    if settle.is_err() {
        tracing::warn!("Form did not settle before the demo timeout");
    }
    print_state("after edits", &engine.state())?;

    let submitted = engine.submit().await?;
    print_state("after submit", &submitted)?;

    engine.shutdown();
    Ok(())
}
