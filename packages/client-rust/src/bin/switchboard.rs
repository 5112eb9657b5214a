//! `switchboard`: run a GraphQL query, mutation or subscription from the shell.
//!
//! Every result is printed as one JSON object per line.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use switchboard_client::{
    encode_args, Client, ClientConfig, ClientError, ExecutionArgs, OperationResult, RequestPolicy,
    WsTransport, WsTransportConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "GraphQL client over the Switchboard exchange pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a query and print its first result.
    Query {
        #[command(flatten)]
        request: RequestArgs,
        /// Request policy: cache-first, cache-only, network-only, cache-and-network.
        #[arg(long, default_value = "cache-first")]
        policy: RequestPolicy,
    },
    /// Run a mutation and print its result.
    Mutate {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Stream a subscription until it completes or Ctrl+C.
    Subscribe {
        #[command(flatten)]
        request: RequestArgs,
        /// graphql-transport-ws endpoint; derived from --url when omitted.
        #[arg(long, env = "SWITCHBOARD_WS_URL")]
        ws_url: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// GraphQL-over-HTTP endpoint.
    #[arg(long, env = "SWITCHBOARD_URL", default_value = "http://localhost:4000/graphql")]
    url: String,
    /// Extra request header as `name=value` (repeatable).
    #[arg(long = "header", value_name = "NAME=VALUE")]
    headers: Vec<String>,
    /// GraphQL document.
    #[arg(long)]
    query: String,
    /// Variables as a JSON object.
    #[arg(long)]
    variables: Option<String>,
}

impl RequestArgs {
    fn config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(self.url.clone());
        config.headers = parse_headers(&self.headers)?;
        Ok(config)
    }

    fn execution_args(&self) -> Result<ExecutionArgs> {
        let variables: Value = match &self.variables {
            Some(raw) => serde_json::from_str(raw).context("--variables is not valid JSON")?,
            None => return Ok(ExecutionArgs::new(self.query.clone())),
        };
        Ok(encode_args(&self.query, &variables)?)
    }
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("header {entry:?} is not NAME=VALUE");
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid header name in {entry:?}"))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid header value in {entry:?}"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// `http://host/graphql` → `ws://host/graphql`, `https` → `wss`.
fn derive_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

fn render(result: &OperationResult) -> Value {
    json!({
        "id": result.operation.id,
        "kind": result.operation.kind.as_str(),
        "data": result.data,
        "error": result.error.as_ref().map(ToString::to_string),
        "stale": result.stale,
        "hasNext": result.has_next,
        "extensions": result.extensions,
    })
}

fn print(result: &OperationResult) {
    println!("{}", render(result));
}

fn init_tracing(log_json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log_json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Command::Query { request, policy } => {
            let client = Client::builder(request.config()?).build()?;
            let result = client.query_async(request.execution_args()?, Some(policy)).await;
            finish(result)
        }
        Command::Mutate { request } => {
            let client = Client::builder(request.config()?).build()?;
            let result = client.mutation_async(request.execution_args()?).await;
            finish(result)
        }
        Command::Subscribe { request, ws_url } => {
            let config = request.config()?;
            let mut ws_config =
                WsTransportConfig::new(ws_url.unwrap_or_else(|| derive_ws_url(&config.url)));
            ws_config.headers = config.headers.clone();

            let client = Client::builder(config)
                .subscription_transport(Arc::new(WsTransport::new(ws_config)))
                .build()?;
            let mut results = client.subscription(request.execution_args()?).into_stream();

            loop {
                tokio::select! {
                    next = results.next() => match next {
                        Some(result) => print(&result),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted, closing subscription");
                        break;
                    }
                }
            }
            Ok(())
        }
    }
}

/// Prints a single-result outcome; an errored result fails the process.
fn finish(result: Result<OperationResult, ClientError>) -> Result<()> {
    match result {
        Ok(result) => {
            print(&result);
            Ok(())
        }
        Err(err) => {
            println!("{}", json!({ "error": err.to_string() }));
            Err(err.into())
        }
    }
}
