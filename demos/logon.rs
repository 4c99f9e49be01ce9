//! Logon demo - connect, run one service, disconnect.
//!
//! This example demonstrates:
//! - Loading a destination from a JSON file
//! - Logging on with user credentials
//! - Running a service and reading values from the result
//!
//! # Running
//!
//! ```text
//! cat > server.json <<'JSON'
//! { "host": "mflux.example.org", "port": 443, "transport": "https" }
//! JSON
//! RUST_LOG=mflux_client=debug MFLUX_DOMAIN=system MFLUX_USER=manager MFLUX_PASSWORD=... \
//!     cargo run --example logon -- server.json server.version
//! ```

use mflux_client::{Connection, Credentials, Destination, ServiceCall};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let config = args.next().ok_or("usage: logon <server.json> [service]")?;
    let service = args.next().unwrap_or_else(|| "server.version".to_string());

    let destination = Destination::from_json(&std::fs::read_to_string(config)?)?;
    let conn = Connection::builder(destination).app("logon-demo").build()?;

    let credentials = Credentials::user(
        std::env::var("MFLUX_DOMAIN")?,
        std::env::var("MFLUX_USER")?,
        std::env::var("MFLUX_PASSWORD")?,
    );
    conn.connect(Some(credentials)).await?;
    if let Some(session) = conn.session().await {
        println!("session {} (timeout {}s)", session.id(), session.timeout().as_secs());
    }

    let result = conn.execute(&mut ServiceCall::new(service)).await;
    conn.disconnect().await?;
    println!("{}", result?);

    Ok(())
}
