mod cli;

use anyhow::{bail, Context};
use discord_rest::{Body, CancellationToken, Client, Config, Request};
use log::debug;
use std::io::Write;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::build_cli();
    let matches = cmd.get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    let version_flag = matches.get_flag("version");

    cli::init_logging(log_level.as_deref());

    if version_flag {
        println!("discord-rest {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(path) = matches.get_one::<String>("path") else {
        bail!("--path is required");
    };
    let method = matches
        .get_one::<String>("method")
        .map(String::as_str)
        .unwrap_or("GET");
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method {}", method))?;

    let mut request = Request::new(method, path.as_str());
    if let Some(body) = matches.get_one::<String>("body") {
        let value: serde_json::Value =
            serde_json::from_str(body).context("--body must be valid JSON")?;
        request = request.with_body(Body::Json(value));
    }
    if let Some(reason) = matches.get_one::<String>("reason") {
        request = request.with_reason(reason.as_str());
    }

    let client = Client::new(Config::from_env()?)?;
    let response = client
        .dispatch(&mut request, &CancellationToken::new())
        .await?;
    debug!("bucket grouping: {:?}", client.bucket_grouping());

    let mut out = std::io::stdout();
    out.write_all(&response.body)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
