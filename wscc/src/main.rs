use clap::{Parser, Subcommand};

mod client;

/// Interactive WebSocket client.
///
/// Every line typed is sent as a text message. Inline comments using // are stripped before
/// sending and kept in the history, where ctrl+r finds them.
///
/// Lines starting with a slash are commands:
///   /ping [payload]         send a ping
///   /close [code] [reason]  start the closing handshake
///
/// Examples:
///   {"type": "subscribe"} // Subscribe to updates
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Log protocol events to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Client(client::Cmd),
}

fn main() {
    let args = Cli::parse();
    if args.verbose {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();
    }

    let res = match args.command {
        Commands::Client(cmd) => client::run(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
    }
}
