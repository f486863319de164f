// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use quictun::{TransportConfig, TransportSettings};
use std::path::{Path, PathBuf};

use validators::{validate_existing_file, validate_positive, validate_socketaddr};

mod certgen;
mod client;
mod server;
mod validators;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      transport_args(
        Command::new("client")
          .alias("-c")
          .about("Send a message over a QUIC session and print the echoed reply"),
      )
      .arg(
        Arg::new("server")
          .long("server")
          .short('s')
          .validator(validate_socketaddr)
          .takes_value(true)
          .required(true),
      )
      .arg(
        Arg::new("server-name")
          .long("server-name")
          .visible_alias("sni")
          .takes_value(true)
          .required(false),
      )
      .arg(
        Arg::new("count")
          .help("Number of connections to multiplex over the session")
          .long("count")
          .short('n')
          .validator(validate_positive)
          .default_value("1")
          .takes_value(true),
      )
      .arg(
        Arg::new("message")
          .help("Payload to send; read from stdin when omitted")
          .takes_value(true)
          .required(false),
      ),
    )
    .subcommand(
      transport_args(
        Command::new("server")
          .alias("-s")
          .about("Run an echo service accepting multiplexed connections"),
      )
      .arg(
        Arg::new("bind")
          .long("bind")
          .short('b')
          .validator(validate_socketaddr)
          .default_value("127.0.0.1:4433")
          .takes_value(true),
      )
      .arg(
        Arg::new("cert")
          .long("cert")
          .short('c')
          .validator(validate_existing_file)
          .requires("key")
          .takes_value(true),
      )
      .arg(
        Arg::new("key")
          .long("key")
          .validator(validate_existing_file)
          .requires("cert")
          .takes_value(true),
      ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate a self-signed certificate and key for the server")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

/// Options shared by both transport roles
fn transport_args(command: Command<'static>) -> Command<'static> {
  command
    .arg(
      Arg::new("config")
        .help("JSON transport settings")
        .long("config")
        .validator(validate_existing_file)
        .takes_value(true),
    )
    .arg(
      Arg::new("key-file")
        .help("Pre-shared key of 16, 24, or 32 raw bytes; seals every datagram")
        .long("key-file")
        .validator(validate_existing_file)
        .takes_value(true),
    )
}

/// Settings file first, then command-line overrides
fn transport_config(args: &ArgMatches) -> Result<TransportSettings> {
  let mut settings = match args.value_of("config") {
    Some(path) => TransportSettings::from_file(Path::new(path))
      .with_context(|| format!("Failed to load settings from {}", path))?,
    None => TransportSettings::default(),
  };
  if let Some(path) = args.value_of("key-file") {
    settings.key_file = Some(PathBuf::from(path));
  }
  Ok(settings)
}

fn into_config(settings: TransportSettings) -> Result<TransportConfig> {
  settings
    .into_config()
    .context("Invalid transport settings")
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let mut settings = transport_config(args)?;
  if let Some(name) = args.value_of("server-name") {
    settings.server_name = Some(name.to_string());
  }
  Ok(client::ClientArgs {
    server: args
      .value_of("server")
      .context("Server address is required")?
      .to_string(),
    count: args
      .value_of_t("count")
      .context("Count must be a positive integer")?,
    message: args.value_of("message").map(String::from),
    config: into_config(settings)?,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let mut settings = transport_config(args)?;
  if let (Some(cert), Some(key)) = (args.value_of("cert"), args.value_of("key")) {
    settings.cert = Some(PathBuf::from(cert));
    settings.private_key = Some(PathBuf::from(key));
  }
  Ok(server::ServerArgs {
    bind: args
      .value_of("bind")
      .context("Bind address is required")?
      .to_string(),
    config: into_config(settings)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let args = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:?}", args);
      server::server_main(args).await
    }
    Some(("client", opts)) => {
      let args = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:?}", args);
      client::client_main(args).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path = opts.value_of("path").context("Path argument is required")?;
      let san = opts.value_of("san").context("SAN argument must exist")?;
      certgen::certgen_main(path.into(), san.into()).await
    }
    _ => anyhow::bail!("Unknown subcommand"),
  }
}
