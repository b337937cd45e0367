use tracing_subscriber::EnvFilter;

/// Our own messages at `info` (or `debug`), the HTTP/TLS stack only at `warn`.
fn default_directives(debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    format!("warn,{}={level}", env!("CARGO_CRATE_NAME"))
}

pub fn init_logging(debug: bool) {
    // RUST_LOG wins; otherwise the --debug flag picks the level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
