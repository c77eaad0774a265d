use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

use waf_gateway::replication::NodeKey;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the WAF gateway primary", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:9527")]
    url: String,

    #[arg(short, long, default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Node status and applied watermarks
    Status,
    /// Replicas that have called the primary
    Nodes,
    /// List applications
    Applications,
    /// List domains
    Domains,
    /// List CC policies
    CcPolicies,
    /// List group policies
    GroupPolicies,
    /// Delete the CC policy of an application
    DeleteCcPolicy { app_id: i64 },
    /// Delete a group policy
    DeleteGroupPolicy { id: i64 },
    /// Show replication and retention settings
    Settings,
    /// Change the replica poll interval
    SetSyncSeconds { seconds: u64 },
    /// Change how long hit logs are kept
    SetLogExpireSeconds { seconds: i64 },
    /// Print a fresh node key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (method, path, body) = match cli.command {
        Commands::Keygen => {
            println!("{}", NodeKey::generate_hex()?);
            return Ok(());
        }
        Commands::Status => (Method::GET, "/admin/status".to_string(), None),
        Commands::Nodes => (Method::GET, "/admin/nodes".to_string(), None),
        Commands::Applications => (Method::GET, "/admin/applications".to_string(), None),
        Commands::Domains => (Method::GET, "/admin/domains".to_string(), None),
        Commands::CcPolicies => (Method::GET, "/admin/cc-policies".to_string(), None),
        Commands::GroupPolicies => (Method::GET, "/admin/group-policies".to_string(), None),
        Commands::DeleteCcPolicy { app_id } => (Method::DELETE, format!("/admin/cc-policies/{app_id}"), None),
        Commands::DeleteGroupPolicy { id } => (Method::DELETE, format!("/admin/group-policies/{id}"), None),
        Commands::Settings => (Method::GET, "/admin/settings".to_string(), None),
        Commands::SetSyncSeconds { seconds } => (
            Method::PUT,
            "/admin/settings".to_string(),
            Some(json!({ "Sync_Seconds": seconds })),
        ),
        Commands::SetLogExpireSeconds { seconds } => (
            Method::PUT,
            "/admin/settings".to_string(),
            Some(json!({ "Log_Expire_Seconds": seconds })),
        ),
    };

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let client = reqwest::Client::new();
    let mut request = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }
    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }
    if status == reqwest::StatusCode::NO_CONTENT {
        println!("OK");
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
