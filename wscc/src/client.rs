use std::time::Duration;

use bytes::Bytes;
use clap::Args;
use rustyline::ExternalPrinter;
use tokio::{
    runtime,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use url::Url;
use wsclient::{
    CloseCode, CloseInfo, Handler, Immediate, Message, Options, WebSocket, WebSocketError,
};

/// Command to connect and interact with a WebSocket server.
///
/// This command establishes a WebSocket client connection to a server and allows sending
/// messages and receiving responses interactively. It supports both plaintext WebSocket (ws://)
/// and secure WebSocket (wss://) connections.
#[derive(Args)]
#[command(alias = "c")]
pub struct Cmd {
    /// Maximum duration to wait when establishing the connection.
    /// Accepts human-readable formats like "5s", "1m", "500ms".
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "5s")]
    timeout: Duration,

    /// When enabled, validates and pretty-prints received messages as JSON.
    /// Invalid JSON messages will result in an error.
    #[arg(long)]
    input_as_json: bool,

    /// Subprotocol to offer. May be repeated, in order of preference.
    #[arg(short, long = "protocol")]
    protocols: Vec<String>,

    /// The WebSocket URL to connect to (ws:// or wss://)
    url: Url,
}

/// Connection events, moved from the callback onto the main loop.
enum Update {
    Open,
    Message(Message),
    Pong(Bytes),
    Closed(CloseInfo),
    Failed(WebSocketError),
}

struct Forward(UnboundedSender<Update>);

impl Handler for Forward {
    fn on_message(&mut self, message: Message) {
        let _ = self.0.send(Update::Message(message));
    }

    fn on_open(&mut self) {
        let _ = self.0.send(Update::Open);
    }

    fn on_pong(&mut self, payload: Bytes) {
        let _ = self.0.send(Update::Pong(payload));
    }

    fn on_close(&mut self, info: CloseInfo) {
        let _ = self.0.send(Update::Closed(info));
    }

    fn on_failure(&mut self, error: WebSocketError) {
        let _ = self.0.send(Update::Failed(error));
    }
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let history_path = home::home_dir()
        .ok_or(anyhow::anyhow!("unable to determine home path"))?
        .join(".wscc_history");

    // Handle user input with history
    let mut rl = rustyline::DefaultEditor::with_config(
        rustyline::Config::builder()
            .auto_add_history(true)
            .completion_type(rustyline::CompletionType::List)
            .max_history_size(1000)?
            .build(),
    )?;
    // ignore the error
    let _ = rl.load_history(&history_path);
    // external printer
    let printer = rl.create_external_printer()?;

    let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
    let _guard = runtime.enter();

    let (updates_tx, mut updates) = unbounded_channel();
    let options = Options::default()
        .with_protocols(cmd.protocols)
        .with_handshake_timeout(cmd.timeout);
    let ws = WebSocket::with_options(cmd.url.clone(), options, Forward(updates_tx));
    // the main loop does the printing, the callbacks only forward
    ws.set_executor(Immediate)?;
    ws.open()?;

    match runtime.block_on(timeout(cmd.timeout, updates.recv()))? {
        Some(Update::Open) => match ws.protocol() {
            Some(protocol) => println!("> Connected to {} ({protocol})", cmd.url),
            None => println!("> Connected to {}", cmd.url),
        },
        Some(Update::Failed(err)) => return Err(err.into()),
        _ => anyhow::bail!("connection closed during the handshake"),
    }

    let (lines_tx, lines) = unbounded_channel();
    runtime.spawn_blocking(move || loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(mut line) => {
                let _ = rl.add_history_entry(line.as_str());
                // commented line
                if let Some(pos) = line.rfind("//") {
                    let _ = line.split_off(pos);
                }

                if lines_tx.send(line).is_err() {
                    break;
                }
            }
            Err(_) => {
                if let Err(err) = rl.save_history(&history_path) {
                    eprintln!("unable to save history: {err}");
                }
                break;
            }
        }
    });

    let opts = Opts {
        input_as_json: cmd.input_as_json,
    };
    runtime.block_on(handle_websocket(ws, lines, updates, printer, opts));

    runtime.shutdown_background();

    Ok(())
}

struct Opts {
    input_as_json: bool,
}

async fn handle_websocket(
    ws: WebSocket,
    mut lines: UnboundedReceiver<String>,
    mut updates: UnboundedReceiver<Update>,
    mut printer: impl ExternalPrinter,
    opts: Opts,
) {
    let mut lines_open = true;

    loop {
        tokio::select! {
            line = lines.recv(), if lines_open => {
                let Some(line) = line else {
                    // end of input, wait for the closing handshake
                    lines_open = false;
                    let _ = ws.close();
                    continue;
                };

                if let Err(err) = handle_line(&ws, line.trim_end()) {
                    let _ = printer.print(format!("unable to write: {}", err));
                }
            }
            update = updates.recv() => {
                let Some(update) = update else {
                    break;
                };

                match update {
                    Update::Open => {}
                    Update::Message(Message::Text(text)) => {
                        if opts.input_as_json {
                            match serde_json::from_str::<serde_json::Value>(&text) {
                                Ok(ok) => {
                                    let _ = printer.print(format!("{:#}", ok));
                                }
                                Err(err) => {
                                    let _ = printer.print(format!("parsing json: {}", err));
                                }
                            }
                        } else {
                            let _ = printer.print(text);
                        }
                    }
                    Update::Message(Message::Binary(data)) => {
                        let _ = printer.print(format!("<Binary {} bytes>", data.len()));
                    }
                    Update::Pong(payload) => {
                        let _ = printer.print(format!("<Pong {}>", String::from_utf8_lossy(&payload)));
                    }
                    Update::Closed(info) => {
                        let _ = printer.print(format!(
                            "<Disconnected: {} {}{}>",
                            u16::from(info.code),
                            info.reason,
                            if info.was_clean { "" } else { " (unclean)" }
                        ));
                        break;
                    }
                    Update::Failed(err) => {
                        let _ = printer.print(format!("<Failed: {}>", err));
                        break;
                    }
                }
            }
        }
    }
}

fn handle_line(ws: &WebSocket, line: &str) -> wsclient::Result<()> {
    if let Some(payload) = line.strip_prefix("/ping") {
        return ws.send_ping(payload.trim().as_bytes().to_vec());
    }

    if let Some(args) = line.strip_prefix("/close") {
        let mut args = args.trim().splitn(2, ' ');
        let code = args
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .map_or(CloseCode::Normal, CloseCode::from);
        let reason = args.next().unwrap_or_default();
        return ws.close_with(code, reason);
    }

    ws.send(line)
}
