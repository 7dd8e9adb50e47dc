mod cli;
mod conf;
mod directory;
mod engine;
mod pipeline;
mod secret;
mod validate;

use colored::Colorize;
use human_panic::setup_panic;

#[tokio::main]
async fn main() {
    setup_panic!();

    let cli = match cli::Cli::new() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{} {:?}", "x".red(), e);
            std::process::exit(1)
        }
    };

    match cli.run().await {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{} {:?}", "x".red(), e);
            std::process::exit(1)
        }
    }
}
