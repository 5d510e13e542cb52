//! Weave storage & token server for sync 1.5
#[macro_use]
extern crate slog_scope;

use std::error::Error;

use docopt::Docopt;
use serde::Deserialize;

use weaveserver::{logging, server};
use weaveserver_settings::Settings;

const USAGE: &str = "
Usage: weaveserver [options]

Options:
    -h, --help               Show this message.
    --config=CONFIGFILE      Weaveserver configuration file path.
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let settings = Settings::with_env_and_config_file(args.flag_config.as_deref())?;
    logging::init_logging(!settings.human_logs).expect("Logging failed to initialize");
    debug!("Starting up...");
    let _sentry = sentry::init(sentry::ClientOptions {
        release: sentry::release_name!(),
        ..sentry::ClientOptions::default()
    });

    // Setup and run the server
    let banner = settings.banner();
    let server = if !settings.storage.enabled {
        server::Server::tokenserver_only_with_settings(settings)
            .await
            .expect("Could not start the tokenserver-only server")
    } else {
        server::Server::with_settings(settings)
            .await
            .expect("Could not start the server")
    };
    info!("Server running on {}", banner);
    server.await?;
    info!("Server closing");
    logging::reset_logging();

    Ok(())
}
