use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use dispatcher::{
    Dispatcher, DispatcherConfig, MemoryDocument, ProviderClient, SelectionOutcome, TextDocument,
};
use shared_types::{Position, TextRange};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: dispatcher <file> <start[:end]>...\n       dispatcher --list-models";

/// Parses a 1-based inclusive line selection such as `3` or `3:7`.
fn parse_selection(arg: &str, text: &str) -> anyhow::Result<TextRange> {
    let (start, end) = match arg.split_once(':') {
        Some((start, end)) => (start, end),
        None => (arg, arg),
    };
    let start: usize = start
        .trim()
        .parse()
        .with_context(|| format!("invalid start line in '{arg}'"))?;
    let end: usize = end
        .trim()
        .parse()
        .with_context(|| format!("invalid end line in '{arg}'"))?;

    let lines: Vec<&str> = text.split('\n').collect();
    if start == 0 || end < start || end > lines.len() {
        bail!(
            "selection '{arg}' is outside lines 1..={} or reversed",
            lines.len()
        );
    }
    let last_line = lines[end - 1].trim_end_matches('\r');
    Ok(TextRange::new(
        Position::new(start - 1, 0),
        Position::new(end - 1, last_line.chars().count()),
    ))
}

async fn list_models(config: &DispatcherConfig) -> anyhow::Result<()> {
    let client = ProviderClient::new(config.provider_config(), config.credential())?;
    for model in client.list_models().await? {
        println!("{model}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "dispatcher=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DispatcherConfig::from_env()?;
    if config.credential().is_none() {
        tracing::warn!(
            api_key_env = %config.api_key_env,
            "No credential found; requests will be sent without authorization"
        );
    }

    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        bail!(USAGE);
    };
    if first == "--list-models" {
        return list_models(&config).await;
    }

    let path = PathBuf::from(first);
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let selections = args
        .map(|arg| parse_selection(&arg, &text))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if selections.is_empty() {
        return Err(anyhow!(USAGE));
    }

    let document = Arc::new(MemoryDocument::new(path.display().to_string(), text));
    let dispatcher = Arc::new(Dispatcher::new(&config).await?);

    let interrupt = Arc::clone(&dispatcher);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; canceling outstanding requests");
            interrupt.cancel().await;
        }
    });

    tracing::info!(
        file = %path.display(),
        selections = selections.len(),
        "Dispatching selections"
    );
    let outcomes = dispatcher
        .run(document.clone() as Arc<dyn TextDocument>, &selections)
        .await;
    ctrl_c.abort();

    tokio::fs::write(&path, document.text().await)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;

    let completed = outcomes.iter().filter(|o| o.is_completed()).count();
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, SelectionOutcome::Failed(_)))
        .count();
    tracing::info!(
        completed,
        failed,
        total = outcomes.len(),
        "Dispatch finished"
    );

    dispatcher.shutdown().await;
    if failed > 0 {
        bail!("{failed} of {} selections failed", outcomes.len());
    }
    Ok(())
}
