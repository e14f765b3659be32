use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "ingress-cli")]
#[command(about = "Inspect a running ingress proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080", env = "INGRESS_URL")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the full /healthz report
    Status,
    /// One line per upstream node
    Nodes,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/healthz", cli.url.trim_end_matches('/')))
        .send()
        .await?;
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: ingress returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }
    let report: Value = res.json().await?;

    match cli.command {
        Commands::Status => println!("{}", serde_json::to_string_pretty(&report)?),
        Commands::Nodes => {
            let nodes = report["nodes"].as_array().cloned().unwrap_or_default();
            for node in &nodes {
                println!("{}", node_line(node));
            }
        }
    }

    Ok(())
}

fn node_line(node: &Value) -> String {
    let circuit = if node["circuit_open"].as_bool().unwrap_or(false) {
        "OPEN"
    } else {
        "closed"
    };
    format!(
        "{:<12} {}:{:<6} inflight={:<5} circuit={:<6} requests={} failures={}",
        node["id"].as_str().unwrap_or("?"),
        node["host"].as_str().unwrap_or("?"),
        node["port"].as_u64().unwrap_or(0),
        node["inflight"].as_u64().unwrap_or(0),
        circuit,
        node["total_requests"].as_u64().unwrap_or(0),
        node["total_failures"].as_u64().unwrap_or(0),
    )
}
