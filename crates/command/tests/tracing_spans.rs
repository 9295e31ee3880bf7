//! Integration test verifying that `#[instrument]` annotations produce
//! the expected spans while commands run through the pipeline.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use process_engine_command::{
    Command, CommandContext, CommandExecutors, PipelineConfig, PipelineError, PipelineResult,
    RetryConfig,
    testutil::{ConstantCommand, FailingCommand},
};
use tracing::{
    Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: span names plus the `command` field
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

#[derive(Default)]
struct CommandField(Option<String>);

impl Visit for CommandField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "command" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "command" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut command = CommandField::default();
            attrs.record(&mut command);
            self.spans.lock().expect("lock poisoned").push((span.name().to_owned(), command.0));
        }
    }
}

impl SpanCollector {
    fn names(&self) -> Vec<String> {
        self.spans.lock().expect("lock poisoned").iter().map(|(name, _)| name.clone()).collect()
    }

    fn commands(&self) -> Vec<String> {
        self.spans
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(name, _)| name == "command")
            .filter_map(|(_, command)| command.clone())
            .collect()
    }
}

fn executors() -> CommandExecutors {
    let config = PipelineConfig::builder().build().expect("valid config");
    CommandExecutors::new(&config).expect("chains assemble")
}

struct Parent(CommandExecutors);

#[async_trait]
impl Command for Parent {
    type Output = u32;

    async fn execute(&self, context: &mut CommandContext) -> PipelineResult<u32> {
        self.0.tx_required().execute_within(context, ConstantCommand(3)).await
    }

    fn name(&self) -> &'static str {
        "parent"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_creates_command_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    executors().tx_required().execute(ConstantCommand(1)).await.expect("command should succeed");

    let commands = collector.commands();
    assert_eq!(commands.len(), 1, "expected one 'command' span, got: {commands:?}");
    assert!(commands[0].ends_with("ConstantCommand"), "unexpected command name: {commands:?}");
}

#[tokio::test]
async fn commit_creates_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    executors().tx_required().execute(ConstantCommand(1)).await.expect("command should succeed");

    let recorded = collector.names();
    assert!(recorded.iter().any(|s| s == "commit"), "expected a 'commit' span, got: {recorded:?}");
}

#[tokio::test]
async fn failure_creates_rollback_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let result: Result<(), PipelineError> =
        executors().tx_required().execute(FailingCommand("boom")).await;
    assert!(result.is_err());

    let recorded = collector.names();
    assert!(
        recorded.iter().any(|s| s == "rollback"),
        "expected a 'rollback' span, got: {recorded:?}"
    );
    assert!(!recorded.iter().any(|s| s == "commit"), "unexpected 'commit' span: {recorded:?}");
}

#[tokio::test]
async fn nested_command_creates_nested_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let executors = executors();
    executors.tx_required().execute(Parent(executors.clone())).await.expect("parent succeeds");

    let commands = collector.commands();
    assert_eq!(commands.len(), 2, "expected two 'command' spans, got: {commands:?}");
    assert_eq!(commands[0], "parent");
    assert!(commands[1].ends_with("ConstantCommand"));
}

#[tokio::test]
async fn retry_creates_span_only_when_configured() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    executors().tx_required().execute(ConstantCommand(1)).await.expect("command should succeed");
    assert!(!collector.names().iter().any(|s| s == "command_retry"));

    let config = PipelineConfig::builder()
        .retry(RetryConfig::default())
        .build()
        .expect("valid config");
    let executors = CommandExecutors::new(&config).expect("chains assemble");
    executors.tx_required().execute(ConstantCommand(1)).await.expect("command should succeed");

    let recorded = collector.names();
    assert!(
        recorded.iter().any(|s| s == "command_retry"),
        "expected a 'command_retry' span, got: {recorded:?}"
    );
}
