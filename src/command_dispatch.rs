//! Purpose: Hold top-level CLI command dispatch for `clouddb`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: One-shot commands print exactly one event or fail with one error.
//! Invariants: The client is shut down before the process exits.

use super::*;
use clouddb::api::{Client, ClientResult};
use tokio::sync::mpsc::UnboundedReceiver;

pub(super) fn dispatch_command(
    command: Command,
    config: ClientConfig,
    timeout: Duration,
) -> Result<RunOutcome, Error> {
    config.validate()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(run_command(command, config, timeout))
}

async fn run_command(
    command: Command,
    config: ClientConfig,
    timeout: Duration,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Store { tag, value } => {
            let value = parse_json_arg("value", &value)?;
            one_shot(config, timeout, |client| client.store_value(&tag, &value)).await
        }
        Command::Get { tag, default } => {
            let default = parse_json_arg("--default", &default)?;
            one_shot(config, timeout, |client| client.get_value(&tag, &default)).await
        }
        Command::Append { tag, value } => {
            let value = parse_json_arg("value", &value)?;
            one_shot(config, timeout, |client| {
                client.append_value_to_list(&tag, &value)
            })
            .await
        }
        Command::Pop { tag } => {
            one_shot(config, timeout, |client| client.remove_first_from_list(&tag)).await
        }
        Command::Clear { tag } => {
            one_shot(config, timeout, |client| client.clear_tag(&tag)).await
        }
        Command::Tags => one_shot(config, timeout, |client| client.get_tag_list()).await,
        Command::Watch { max } => watch(config, max).await,
    }
}

async fn one_shot(
    config: ClientConfig,
    timeout: Duration,
    issue: impl FnOnce(&Client) -> ClientResult<()>,
) -> Result<RunOutcome, Error> {
    let (client, mut events) = Client::builder(config).listen(false).build();
    let result = match issue(&client) {
        Ok(()) => wait_for_outcome(&mut events, timeout).await,
        Err(err) => Err(err),
    };
    client.shutdown().await;
    let event = result?;
    emit_event(&event);
    Ok(RunOutcome::ok())
}

async fn wait_for_outcome(
    events: &mut UnboundedReceiver<Event>,
    timeout: Duration,
) -> Result<Event, Error> {
    match tokio::time::timeout(timeout, events.recv()).await {
        Err(_) => Err(Error::new(ErrorKind::Io)
            .with_message(format!("no reply from server within {} ms", timeout.as_millis()))
            .with_hint("Check the server address, or raise --timeout-ms.")),
        Ok(None) => Err(Error::new(ErrorKind::Internal).with_message("event channel closed")),
        Ok(Some(Event::Error { kind, message })) => Err(Error::new(kind).with_message(message)),
        Ok(Some(event)) => Ok(event),
    }
}

async fn watch(config: ClientConfig, max: Option<u64>) -> Result<RunOutcome, Error> {
    let (client, mut events) = Client::builder(config).listen(false).build();
    client.start_listening()?;
    let mut seen: u64 = 0;
    let result = loop {
        if max.is_some_and(|max| seen >= max) {
            break Ok(());
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            event = events.recv() => match event {
                None => break Ok(()),
                Some(Event::Error { kind: ErrorKind::Auth, message }) => {
                    break Err(Error::new(ErrorKind::Auth)
                        .with_message(message)
                        .with_hint("Check the project token."));
                }
                Some(Event::Error { kind, message }) => {
                    emit_error(&Error::new(kind).with_message(message));
                }
                Some(event) => {
                    emit_event(&event);
                    seen += 1;
                }
            },
        }
    };
    client.shutdown().await;
    result.map(|()| RunOutcome::ok())
}
