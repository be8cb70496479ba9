use clap::{CommandFactory, Parser};
use std::process::ExitCode;
use torfrog::cli::{self, Args};
use torfrog::config::VERSION;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = cli::exit_code_for(&err);
            if let Err(e) = err.print() {
                log::warn!("Failed to print usage: {}", e);
            }
            return ExitCode::from(code);
        }
    };
    if args.version {
        println!("TorFrog {}", VERSION);
        return ExitCode::SUCCESS;
    }
    let settings = match args.into_settings() {
        Some(settings) => settings,
        None => {
            if let Err(e) = Args::command().print_help() {
                log::warn!("Failed to print usage: {}", e);
            }
            return ExitCode::from(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&settings.save_dir) {
        eprintln!(
            "[error] Failed to create {}: {}",
            settings.save_dir.display(),
            e
        );
    }

    match torfrog::app::run(settings).await {
        Ok(state) => {
            log::debug!("exiting: {:?}", state);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("[error] {}", err);
            ExitCode::from(err.exit_code())
        }
    }
}
