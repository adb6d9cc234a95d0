//! # Webstrates CLI
//!
//! Watch and edit Webstrates documents from the command line.

use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use std::env;
use std::path::Path;
use std::rc::Rc;
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;
use webstrates_client::{
    ConnectionSession, DocumentSession, EventLoop, SessionError, TreeFilter, UpdateOutcome,
    WebSocketTransport,
};

mod config;
mod offline;

use config::CliConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "watch" => {
            if args.len() < 3 {
                eprintln!("Usage: webstrates watch <document> [--no-head]");
                std::process::exit(1);
            }
            let strip_head = args[3..].iter().any(|arg| arg == "--no-head");
            let config = CliConfig::from_env()?;
            LocalSet::new()
                .run_until(watch(&config, &args[2], strip_head))
                .await?;
        }
        "push" => {
            if args.len() < 4 {
                eprintln!("Usage: webstrates push <document> <file>");
                std::process::exit(1);
            }
            let config = CliConfig::from_env()?;
            LocalSet::new()
                .run_until(push(&config, &args[2], Path::new(&args[3])))
                .await?;
        }
        "normalize" => {
            if args.len() < 3 {
                eprintln!("Usage: webstrates normalize <file>");
                std::process::exit(1);
            }
            println!("{}", offline::normalize_file(Path::new(&args[2]))?);
        }
        "diff" => {
            if args.len() < 4 {
                eprintln!("Usage: webstrates diff <from> <to>");
                std::process::exit(1);
            }
            println!(
                "{}",
                offline::diff_files(Path::new(&args[2]), Path::new(&args[3]))?
            );
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn connect(config: &CliConfig) -> Result<(ConnectionSession, EventLoop)> {
    let (transport, event_loop) = WebSocketTransport::connect(&config.url)
        .await
        .context("Failed to connect to Webstrates server")?;
    let session = ConnectionSession::new(Rc::new(transport), config.connection_options());

    session.on_did_connect(|| tracing::info!("Client connected"))?;
    session.on_did_disconnect(|| tracing::info!("Client disconnected"))?;
    session.on_error(|report| tracing::warn!(error = %report.error, "{}", report.message))?;

    Ok((session, event_loop))
}

fn log_document_events(document: &DocumentSession) -> Result<()> {
    let doc_id = document.id().to_string();
    document.on_new_document(move |reason| tracing::info!(doc_id = %doc_id, "{reason}"))?;
    let doc_id = document.id().to_string();
    document.on_did_disconnect(move || tracing::info!(doc_id = %doc_id, "Document closed"))?;
    Ok(())
}

/// Print the document on load and after every operation until interrupted.
async fn watch(config: &CliConfig, doc_id: &str, strip_head: bool) -> Result<()> {
    let (session, mut event_loop) = connect(config).await?;
    let document = session.open_document(doc_id, false);
    log_document_events(&document)?;

    let filter = strip_head.then(|| Rc::new(offline::without_head) as TreeFilter);
    document.on_update(|html| println!("{html}"), filter.clone())?;
    document.on_update_op(|html| println!("{html}"), filter)?;
    document.on_error(|report| tracing::warn!(error = %report.error, "{}", report.message))?;
    document.connect();

    loop {
        tokio::select! {
            event = event_loop.poll() => match event {
                Some(event) => session.dispatch(&event),
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    document.close();
    session.close()?;
    drain(&session, &mut event_loop).await;
    Ok(())
}

/// Replace the document contents with an HTML file.
async fn push(config: &CliConfig, doc_id: &str, path: &Path) -> Result<()> {
    let html = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    offline::read_tree(path)?;

    let (session, mut event_loop) = connect(config).await?;
    let document = session.open_document(doc_id, false);
    log_document_events(&document)?;

    let outcome = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    let handle = document.clone();
    document.on_did_connect(move || {
        *slot.borrow_mut() = Some(handle.update(&html, true));
    })?;

    let failure = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&failure);
    document.on_error(move |report| {
        tracing::warn!(error = %report.error, "{}", report.message);
        if matches!(report.error, SessionError::Subscribe(_)) {
            *sink.borrow_mut() = Some(report.error.clone());
        }
    })?;
    document.connect();

    let mut result = None;
    while result.is_none() || document.has_pending() {
        let event = event_loop
            .poll()
            .await
            .context("Connection closed before the update was acknowledged")?;
        session.dispatch(&event);

        if let Some(error) = failure.borrow_mut().take() {
            return Err(error).context("Failed to open document");
        }
        if result.is_none() {
            result = outcome.borrow_mut().take();
        }
    }

    document.close();
    session.close()?;
    drain(&session, &mut event_loop).await;

    match result {
        Some(Ok(UpdateOutcome::Unchanged)) => println!("{doc_id}: unchanged"),
        Some(Ok(UpdateOutcome::Submitted(components))) => {
            println!("{doc_id}: submitted {components} components");
        }
        Some(Ok(UpdateOutcome::Reset)) => {
            bail!("{doc_id}: operation rejected, document was reset");
        }
        Some(Err(e)) => return Err(e).context("Failed to update document"),
        None => {}
    }
    Ok(())
}

async fn drain(session: &ConnectionSession, event_loop: &mut EventLoop) {
    while let Some(event) = event_loop.poll().await {
        session.dispatch(&event);
    }
}

fn print_help() {
    println!(
        r#"Webstrates CLI

USAGE:
    webstrates <COMMAND> [OPTIONS]

COMMANDS:
    watch <doc> [--no-head]  Print a document whenever it changes
    push <doc> <file>        Replace a document with the contents of an HTML file
    normalize <file>         Print the canonical rendering of an HTML file
    diff <from> <to>         Print the json0 operation turning one file into another
    help                     Show this help message

ENVIRONMENT:
    WEBSTRATES_URL             Server WebSocket URL (default ws://localhost:7007/ws/)
    WEBSTRATES_KEEP_ALIVE_MS   Keep-alive interval in milliseconds (default 10000)
    RUST_LOG                   Log filter (default info)

EXAMPLES:
    webstrates watch my-document --no-head
    webstrates push my-document index.html
"#
    );
}
