use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use shardkv::{
    ClusterClient, ClusterConfig, Command, FailurePolicy, Node, Reply, Response, Topology,
};
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "shardkv-cli")]
#[command(about = "shardkv CLI - run commands against a sharded master/slave cluster", long_about = None)]
struct Args {
    /// Topology descriptor (YAML)
    #[arg(short = 't', long, default_value = "topology.yml")]
    topology: String,

    /// Database to select on every node (overrides the descriptor)
    #[arg(short = 'n', long)]
    db: Option<i64>,

    /// Return transport errors instead of nil replies
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print the master node owning a key
    NodeFor { key: String },
    /// Run one command and exit
    Exec {
        op: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let args = Args::parse();

    let mut config = ClusterConfig::from_file(&args.topology)
        .with_context(|| format!("failed to load topology from {}", args.topology))?;
    if let Some(db) = args.db {
        config.client = config.client.with_database(db);
    }
    if args.strict {
        config.client = config.client.with_failure_policy(FailurePolicy::Strict);
    }

    // placement only depends on the descriptor
    if let Some(Action::NodeFor { key }) = &args.action {
        let topology = Topology::from_config(&config.topology)?;
        info!("{}", describe_node(topology.node_for_key(key)));
        return Ok(());
    }

    let client = ClusterClient::connect(config).await?;

    match args.action {
        Some(Action::NodeFor { .. }) => Ok(()),
        Some(Action::Exec { op, args }) => match run(&client, &op, &args).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        },
        None => run_interactive(client, &args.topology).await,
    }
}

fn describe_node(node: &Node) -> String {
    format!("{} ({})", node.alias.bold(), node.endpoint())
}

async fn run(client: &ClusterClient, op: &str, args: &[String]) -> Result<String> {
    let start = Instant::now();
    let response = client.execute(Command::new(op).args(args)).await?;
    let elapsed = start.elapsed();
    Ok(format!(
        "{}\n{}",
        format_response(&response),
        format!("({:.2?})", elapsed).dimmed()
    ))
}

fn format_response(response: &Response) -> String {
    match response {
        Response::Single(reply) => format_reply(reply, 0),
        Response::PerNode(replies) => {
            if replies.is_empty() {
                return "(no node answered)".dimmed().to_string();
            }
            replies
                .iter()
                .map(|(alias, reply)| format!("{}: {}", alias.bold(), format_reply(reply, 0)))
                .collect::<Vec<_>>()
                .join("\n")
        }
        Response::Concatenated(items) => format_reply(&Reply::Array(items.clone()), 0),
    }
}

fn format_reply(reply: &Reply, depth: usize) -> String {
    match reply {
        Reply::Nil => "(nil)".dimmed().to_string(),
        Reply::Status(s) => s.green().to_string(),
        Reply::Int(n) => format!("(integer) {}", n),
        Reply::Bulk(data) => format!("\"{}\"", String::from_utf8_lossy(data)),
        Reply::Array(items) if items.is_empty() => "(empty array)".dimmed().to_string(),
        Reply::Array(items) => {
            let indent = "   ".repeat(depth);
            items
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}{}) {}", indent, i + 1, format_reply(item, depth + 1)))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

fn help_text() -> String {
    format!(
        r#"{}

{}
  <command> [arg ...]        Run any command; the key decides the node
  SELECT db                  Select a database on every node
  KEYS pattern               Keys from every node, concatenated
  MGET / MSET / SUNION ...   Multi-key commands run across shards

{}
  NODEFOR key                Show the master node owning a key
  NODES                      Show bring-up state of every node
  HELP                       Show this help message
  QUIT                       Exit the CLI

Keys sharing a {{tag}} suffix are stored on the same shard.
"#,
        "shardkv CLI - Available Commands".bold().cyan(),
        "Cluster Commands:".bold(),
        "Client Commands:".bold(),
    )
}

async fn run_interactive(client: ClusterClient, topology: &str) -> Result<()> {
    info!(
        "{}",
        format!("shardkv CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!(
        "Connected to {} shards from {}",
        client.topology().shard_count(),
        topology
    );
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{}> ", format!("shardkv db{}", client.database()).green());
        let readline = rl.readline(&prompt);

        match readline {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                match cmd.to_uppercase().as_str() {
                    "QUIT" | "EXIT" => {
                        info!("Goodbye!");
                        break;
                    }
                    "HELP" => info!("{}", help_text()),
                    "NODEFOR" => match args.first() {
                        Some(key) => info!("{}", describe_node(client.node_for_key(key))),
                        None => error!("{}", "Usage: NODEFOR key".red()),
                    },
                    "NODES" => {
                        for (alias, state) in client.node_states() {
                            info!("{}: {:?}", alias.bold(), state);
                        }
                    }
                    _ => match run(&client, cmd, args).await {
                        Ok(output) => info!("{}", output),
                        Err(e) => {
                            error!(error = %e, "{}", format!("Error: {}", e).red());
                        }
                    },
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_reply() {
        colored::control::set_override(false);
        assert_eq!(format_reply(&Reply::Nil, 0), "(nil)");
        assert_eq!(format_reply(&Reply::Int(3), 0), "(integer) 3");
        assert_eq!(format_reply(&Reply::bulk("v"), 0), "\"v\"");
        assert_eq!(
            format_reply(&Reply::Array(vec![Reply::bulk("a"), Reply::Nil]), 0),
            "1) \"a\"\n2) (nil)"
        );
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["shardkv-cli", "--strict", "exec", "set", "k", "v"]);
        assert!(args.strict);
        match args.action {
            Some(Action::Exec { op, args }) => {
                assert_eq!(op, "set");
                assert_eq!(args, vec!["k", "v"]);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }
}
