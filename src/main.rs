//! Diagnostic binary for `respmux`.
//!
//! Sends one command (optionally repeated and pipelined) through a
//! multiplexer and prints the replies the way `redis-cli` does, or prints
//! messages published to channels with `--subscribe`.

mod cli;

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use futures::{FutureExt, future::join_all};
use respmux::{
    Channel,
    Command,
    EndpointConfig,
    Handler,
    Multiplexer,
    MultiplexerConfig,
    MuxError,
    PubSubMessage,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();
    #[cfg(feature = "metrics")]
    let exporter = if cli.metrics {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                eprintln!("metrics unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let outcome = run(&cli).await;

    #[cfg(feature = "metrics")]
    if let Some(handle) = exporter {
        handle.run_upkeep();
        print!("{}", handle.render());
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("(error) {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &cli::Cli) -> Result<(), MuxError> {
    let timeout = Duration::from_millis(cli.timeout);
    let endpoints = cli
        .endpoints
        .iter()
        .copied()
        .map(EndpointConfig::primary)
        .chain(cli.replicas.iter().copied().map(EndpointConfig::replica));
    let config = endpoints
        .fold(MultiplexerConfig::new(), MultiplexerConfig::endpoint)
        .operation_timeout(timeout)
        .pubsub(cli.subscribe);
    let mux = Multiplexer::connect(config).await?;

    let result = if cli.subscribe {
        listen(&mux, &cli.command).await
    } else {
        send(&mux, &cli.command, cli.repeat).await
    };
    mux.close().await;
    result
}

async fn send(mux: &Multiplexer, words: &[String], repeat: usize) -> Result<(), MuxError> {
    let command = words
        .iter()
        .fold(None::<Command>, |command, word| match command {
            None => Some(Command::new(word)),
            Some(command) => Some(command.arg(word)),
        })
        .ok_or_else(|| MuxError::Config("no command given".into()))?;

    // join_all polls in order, so the calls are submitted in order.
    let calls = (0..repeat.max(1)).map(|_| mux.call(command.clone()));
    for reply in join_all(calls).await {
        println!("{}", reply?);
    }
    Ok(())
}

async fn listen(mux: &Multiplexer, channels: &[String]) -> Result<(), MuxError> {
    let print: Handler = Arc::new(|message: PubSubMessage| {
        println!(
            "{}: {}",
            message.channel.escape_ascii(),
            message.payload.escape_ascii()
        );
        async {}.boxed()
    });
    for name in channels {
        let channel = if name.contains(['*', '?', '[']) {
            Channel::pattern(name)
        } else {
            Channel::literal(name)
        };
        mux.subscribe(channel, Arc::clone(&print)).await?;
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot wait for interrupt");
    }
    Ok(())
}
