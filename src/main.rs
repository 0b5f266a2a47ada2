// Mailtrace: Reconstruction of Mail Flows Across SMTP Relays from Syslog Data
// Copyright (C) 2024-2025 The mailtrace developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{ArgAction, Parser, Subcommand};

use mailtrace::aggregator::{Aggregator, Backend};
use mailtrace::config::Config;
use mailtrace::pipeline::Pipeline;
use mailtrace::tracer::Tracer;
use mailtrace::util::{self, TimeWindow};

#[derive(Parser, Debug)]
#[command(about = "Reconstruct mail flows across SMTP relays from their logs", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Trace one mail and print the flow as human text.
    #[command(disable_help_flag = true)]
    Run(TraceArgs),
    /// Trace one mail and emit the flow as a Graphviz DOT graph.
    #[command(disable_help_flag = true)]
    Graph {
        #[command(flatten)]
        trace: TraceArgs,
        /// Output path; `-` or absent writes to stdout.
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Continuously reconstruct traces and ship them to an OTLP collector.
    Tracing {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// gRPC endpoint of the OTLP collector.
        #[arg(long)]
        otel_endpoint: String,
    },
}

#[derive(clap::Args, Debug)]
struct TraceArgs {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Host or cluster alias to start the trace at.
    #[arg(short = 'h', long)]
    host: String,
    /// Keyword to search for: sender, recipient or message id.
    #[arg(short, long)]
    keyword: String,
    /// Center of the query window, as `YYYY-MM-DD HH:MM:SS`.
    #[arg(long)]
    time: String,
    /// Half-width of the query window, e.g. `30m` or `2h`.
    #[arg(long)]
    time_range: String,
    #[arg(long, action = ArgAction::HelpLong)]
    help: Option<bool>,
}

/// `MAILTRACE_CONFIG` wins over `-c`.
fn load_config(arg: Option<PathBuf>) -> anyhow::Result<Arc<Config>> {
    let path = std::env::var_os("MAILTRACE_CONFIG")
        .map(PathBuf::from)
        .or(arg)
        .context("no configuration given, pass -c or set MAILTRACE_CONFIG")?;
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    util::init_logging(config.log_level()?);
    Ok(Arc::new(config))
}

/// Walk the trace, returning a partial graph when interrupted.
async fn trace_graph(args: &TraceArgs) -> anyhow::Result<mailtrace::graph::MailGraph> {
    let config = load_config(args.config.clone())?;
    let center = util::parse_time(&args.time)?;
    let range = util::parse_range(&args.time_range)?;
    let window = TimeWindow::around(center, range);

    let backend: Arc<dyn Aggregator> = Arc::new(Backend::from_config(&config)?);
    let tracer = Tracer::new(backend, Arc::clone(&config), window);

    let graph = tokio::select! {
        graph = tracer.trace(&args.host, &args.keyword) => graph,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("interrupted, returning the partial trace");
            tracer.snapshot()
        }
    };

    if let Some(reason) = tracer.auth_error() {
        anyhow::bail!("authentication failed: {reason}");
    }
    let (ok, failed) = tracer.query_stats();
    if ok == 0 && failed > 0 {
        anyhow::bail!("no queried host was reachable");
    }
    Ok(graph)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Run(trace) => {
            let graph = trace_graph(&trace).await?;
            print!("{graph}");
        }
        Command::Graph { trace, output } => {
            let graph = trace_graph(&trace).await?;
            let dot = graph.to_dot();
            match output.as_deref() {
                None | Some("-") => print!("{dot}"),
                Some(path) => std::fs::write(path, dot)
                    .with_context(|| format!("writing {path}"))?,
            }
        }
        Command::Tracing { config, otel_endpoint } => {
            let config = load_config(config)?;
            let backend: Arc<dyn Aggregator> = Arc::new(Backend::from_config(&config)?);
            let pipeline = Pipeline::new(backend, Arc::clone(&config), otel_endpoint);
            pipeline
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }
    }
    Ok(())
}
