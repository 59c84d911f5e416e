use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("discord-rest")
        .about("Send one rate-limited request to the Discord REST API")
        .arg(
            Arg::new("method")
                .long("method")
                .short('X')
                .num_args(1)
                .default_value("GET")
                .help("HTTP method"),
        )
        .arg(
            Arg::new("path")
                .long("path")
                .num_args(1)
                .help("Endpoint below the versioned base URL, e.g. /users/@me"),
        )
        .arg(
            Arg::new("body")
                .long("body")
                .num_args(1)
                .help("JSON request body"),
        )
        .arg(
            Arg::new("reason")
                .long("reason")
                .num_args(1)
                .help("Audit log reason"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
}

pub fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    // an explicit level wins over RUST_LOG
    if let Some(lvl) = level {
        builder.parse_filters(lvl);
    }
    builder.init();
}
