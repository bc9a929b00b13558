#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod auth;
mod clock;
mod config;
mod db;
mod devices;
mod error;
mod events;
mod interest;
mod models;
mod notify;
mod schema;
mod status;

use crate::auth::{create_account, create_church, Role};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::notify::{ExpoGateway, Notifier};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    if let Err(err) = run(&matches) {
        match std::error::Error::source(&err) {
            Some(source) => error!(error = %err, source = %source, "church-events failed"),
            None => error!(error = %err, "church-events failed"),
        }
        std::process::exit(1);
    }
}

fn cli() -> App<'static, 'static> {
    App::new("church-events")
        .about("Church event lifecycle and interest service")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .value_name("SETTINGS")
                .help("Settings file to load (defaults to ./settings if present)"),
        )
        .subcommand(SubCommand::with_name("serve").about("Runs the HTTP API"))
        .subcommand(SubCommand::with_name("migrate").about("Applies pending database migrations"))
        .subcommand(
            SubCommand::with_name("add-church")
                .about("Creates a church and prints its id")
                .arg(Arg::with_name("name").required(true)),
        )
        .subcommand(
            SubCommand::with_name("add-account")
                .about("Creates an account and prints its API token")
                .arg(Arg::with_name("name").required(true))
                .arg(
                    Arg::with_name("role")
                        .long("role")
                        .takes_value(true)
                        .possible_values(&["pastor", "admin"])
                        .default_value("pastor"),
                )
                .arg(
                    Arg::with_name("church")
                        .long("church")
                        .takes_value(true)
                        .value_name("CHURCH_ID"),
                ),
        )
}

fn run(matches: &ArgMatches) -> Result<()> {
    let config = match matches.value_of("config") {
        Some(settings) => Config::load(settings, true)?,
        None => Config::load("settings", false)?,
    };
    let database = Database::new(config.db_path.clone(), config.busy_timeout_ms);

    match matches.subcommand() {
        ("serve", _) => serve(&config, database),
        ("migrate", _) => {
            database.migrate()?;
            info!(db_path = %config.db_path.display(), "migrations applied");
            Ok(())
        }
        ("add-church", Some(args)) => {
            database.migrate()?;
            let conn = database.connect()?;
            let church = create_church(&conn, args.value_of("name").unwrap_or_default())?;
            println!("{}", church.id);
            Ok(())
        }
        ("add-account", Some(args)) => {
            database.migrate()?;
            let conn = database.connect()?;
            let role: Role = args.value_of("role").unwrap_or("pastor").parse()?;
            let church = args
                .value_of("church")
                .map(|church| {
                    church
                        .parse::<i32>()
                        .map_err(|_| Error::Validation(format!("not a church id: {}", church)))
                })
                .transpose()?;
            let account = create_account(&conn, args.value_of("name").unwrap_or_default(), role, church)?;
            println!("{}", account.api_token);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn serve(config: &Config, database: Database) -> Result<()> {
    database.migrate()?;

    let gateway = ExpoGateway::new(
        config.push_gateway_url.clone(),
        config.push_access_token.clone(),
    );
    let notifier = Notifier::start(database.clone(), Box::new(gateway), config.push_batch_size)?;
    let app = api::AppState {
        database,
        clock: Arc::new(SystemClock),
        notifier,
    };

    let address = config.bind_address();
    info!(address = %address, "listening");
    gotham::start(address, api::router(app));
    Ok(())
}
