use std::env;
use std::error::Error;

use bundler_core::worker::command::CommandWorker;
use bundler_core::{BundleConfig, BundleHandle, KeyChangeListenerRegistry, StreamElement, Watermark};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::input::{InputLine, format_watermark};

mod input;
mod setup_tracing;

const ENV_BUNDLER_COMMAND: &str = "BUNDLER_COMMAND";
const DEFAULT_COMMAND: &str = "cat";

type Handle = BundleHandle<String, Bytes>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = BundleConfig::load()?;
    let command = env::var(ENV_BUNDLER_COMMAND).unwrap_or_else(|_| DEFAULT_COMMAND.to_string());
    let worker = CommandWorker::from_command_line(&command)?;

    let (output_tx, output_rx) = mpsc::channel(config.mailbox_size);
    let cln_token = CancellationToken::new();
    let (handle, operator) = Handle::open(
        &config,
        worker,
        KeyChangeListenerRegistry::new(),
        output_tx,
        cln_token.clone(),
    )
    .await?;
    let printer = tokio::spawn(print_elements(output_rx));

    let result = async {
        forward_input(&handle, &cln_token).await?;
        // end of input
        handle.process_watermark(Watermark::MAX).await?;
        handle.finish().await?;
        Ok::<(), Box<dyn Error>>(())
    }
    .await;

    let closed = handle.close().await;
    drop(handle);
    let operator_result = operator.await?;
    printer.await??;

    result?;
    closed?;
    operator_result?;
    Ok(())
}

/// Reads the input lines from stdin and applies them to the operator until the input ends, the
/// process is interrupted or the operator fails.
async fn forward_input(handle: &Handle, cln_token: &CancellationToken) -> Result<(), Box<dyn Error>> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut current_key: Option<String> = None;
    loop {
        let line = tokio::select! {
            _ = cln_token.cancelled() => {
                warn!("Operator failed, no longer reading input");
                break;
            }
            _ = &mut ctrl_c => {
                info!("Received interrupt, stopping");
                break;
            }
            line = lines.next() => line,
        };
        let Some(line) = line else {
            break;
        };

        match InputLine::parse(&line?)? {
            InputLine::Record { key, value } => {
                if key.is_some() && key != current_key {
                    handle.set_current_key(key.clone()).await?;
                    current_key = key;
                }
                handle.process_element(value).await?;
            }
            InputLine::Watermark(watermark) => handle.process_watermark(watermark).await?,
            InputLine::Checkpoint(checkpoint_id) => {
                handle.prepare_snapshot_pre_barrier(checkpoint_id).await?;
                info!(checkpoint_id, "Bundle flushed for checkpoint");
            }
            InputLine::Blank => {}
        }
    }
    Ok(())
}

/// Writes the operator output to stdout, one element per line.
async fn print_elements(mut output_rx: mpsc::Receiver<StreamElement<Bytes>>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(element) = output_rx.recv().await {
        match element {
            StreamElement::Record(record) => {
                stdout.write_all(&record).await?;
            }
            StreamElement::Watermark(watermark) => {
                stdout.write_all(format_watermark(watermark).as_bytes()).await?;
            }
        }
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await
}
