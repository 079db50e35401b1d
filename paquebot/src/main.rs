mod server;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use paq_user::config::read_config;
use paq_user::password::hash_password;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, env = "PAQUEBOT_CONFIG", default_value = "paquebot.toml")]
    /// Path to the main Paquebot configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the SMTP+IMAP server daemon
    Daemon,
    /// Hash a password for the user database
    PasswordHash {
        #[clap(env = "PAQUEBOT_PASSWORD")]
        password: String,
    },
}

fn main() -> ExitCode {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "paquebot=info,paq_proto=info,paq_transport=info,paq_mail=info,paq_user=info")
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Command::PasswordHash { password } => match hash_password(&password) {
            Ok(hash) => {
                println!("{}", hash);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("could not hash password: {}", e);
                ExitCode::from(1)
            }
        },
        Command::Daemon => {
            let config = match read_config(args.config_file) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {:#}", e);
                    return ExitCode::from(1);
                }
            };

            let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("initialization error: {:#}", e);
                    return ExitCode::from(1);
                }
            };

            let server = match runtime.block_on(server::Server::new(config)) {
                Ok(server) => server,
                Err(e) => {
                    eprintln!("initialization error: {:#}", e);
                    return ExitCode::from(1);
                }
            };
            match runtime.block_on(server.run()) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    let reason = format!("{:#}", e);
                    tracing::error!(err = %reason, "fatal runtime error");
                    ExitCode::from(2)
                }
            }
        }
    }
}
