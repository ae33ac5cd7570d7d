use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use futures::StreamExt;
use ms_backend::{ClientConfig, MessagesClient};
use ms_protocol::{Envelope, EnvelopeKind, Message, MessageRequest, StopReason, Tool, Usage};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn print_help() {
    println!("mstream - stream a reply from the messages API");
    println!();
    println!("Usage:");
    println!("  mstream \"prompt\"             Send a prompt and stream the reply");
    println!("  echo \"prompt\" | mstream      Prompt via stdin pipe");
    println!();
    println!("Options:");
    println!("  --tools           Offer a sample get_weather tool");
    println!("  --model <name>    Model to use instead of the configured default");
    println!("  --config <path>   Config file (default: $XDG_CONFIG_HOME/mstream/config.toml)");
    println!("  --version         Print version");
    println!("  --help            Print this help");
    println!();
    println!("Set RUST_LOG=ms_backend=debug to trace decoding.");
}

#[derive(Debug, Default, PartialEq)]
struct Args {
    prompt: Option<String>,
    tools: bool,
    model: Option<String>,
    config: Option<PathBuf>,
    help: bool,
    version: bool,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Args::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--help" | "-h" => parsed.help = true,
                "--version" | "-V" => parsed.version = true,
                "--tools" => parsed.tools = true,
                "--model" => {
                    parsed.model = Some(args.next().ok_or("--model needs a value")?);
                }
                "--config" => {
                    let path = args.next().ok_or("--config needs a value")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                flag if flag.starts_with('-') => return Err(format!("unknown option {flag}")),
                _ if parsed.prompt.is_none() => parsed.prompt = Some(arg),
                _ => return Err("only one prompt may be given".to_string()),
            }
        }
        Ok(parsed)
    }
}

fn weather_tool() -> Tool {
    Tool::new(
        "get_weather",
        "Get the current weather in a given location",
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The city and state, e.g. San Francisco, CA"
                }
            },
            "required": ["location"]
        }),
    )
}

/// Renders envelopes as they arrive: text to `out`, everything else to `err`.
struct Printer<O: Write, E: Write> {
    out: O,
    err: E,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
    failed: bool,
}

impl<O: Write, E: Write> Printer<O, E> {
    fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            stop_reason: None,
            usage: None,
            failed: false,
        }
    }

    fn envelope(&mut self, envelope: &Envelope) -> io::Result<()> {
        if let Some(reason) = envelope.stop_reason {
            self.stop_reason = Some(reason);
        }
        if let Some(usage) = envelope.usage {
            self.usage = Some(usage);
        }

        match envelope.kind {
            EnvelopeKind::Error => {
                self.failed = true;
                let (kind, message) = envelope
                    .error
                    .as_ref()
                    .map(|e| (e.error_type.as_str(), e.message.as_str()))
                    .unwrap_or(("error", ""));
                let status = envelope
                    .status
                    .map(|s| format!(" (HTTP {s})"))
                    .unwrap_or_default();
                writeln!(self.err, "error{status}: {kind}: {message}")?;
            }
            EnvelopeKind::Ping => {}
            EnvelopeKind::Content | EnvelopeKind::Lifecycle => {
                let text = envelope.text();
                if !text.is_empty() {
                    write!(self.out, "{text}")?;
                    self.out.flush()?;
                }
                for (id, name, input) in envelope.tool_uses() {
                    writeln!(self.out, "\n[tool_use {name} {id}] {}", input.as_str())?;
                }
            }
        }
        Ok(())
    }

    fn decode_error(&mut self, error: &ms_backend::StreamError) -> io::Result<()> {
        if !error.is_recoverable() {
            self.failed = true;
        }
        writeln!(self.err, "warning: {error}")
    }

    fn finish(&mut self, cancelled: bool) -> io::Result<()> {
        writeln!(self.out)?;
        if cancelled {
            writeln!(self.err, "cancelled")?;
        }
        if let Some(reason) = self.stop_reason {
            writeln!(self.err, "stop_reason: {reason:?}")?;
        }
        if let Some(usage) = self.usage {
            writeln!(
                self.err,
                "usage: {} input, {} output tokens",
                usage.input_tokens, usage.output_tokens
            )?;
        }
        Ok(())
    }
}

async fn run(config: ClientConfig, args: Args, prompt: String) -> i32 {
    let client = match MessagesClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let mut request = MessageRequest::new(vec![Message::user(prompt)], client.config().max_tokens);
    if let Some(model) = args.model {
        request = request.with_model(model);
    }
    if args.tools {
        request = request.with_tools(vec![weather_tool()]);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let mut printer = Printer::new(io::stdout(), io::stderr());
    let stream = client.create_stream(&request, cancel.clone());
    let mut stream = std::pin::pin!(stream);

    while let Some(item) = stream.next().await {
        let written = match item {
            Ok(envelope) => printer.envelope(&envelope),
            Err(e) => printer.decode_error(&e),
        };
        // Nobody is reading any more; stop the session.
        if let Err(e) = written {
            cancel.cancel();
            return output_closed(&e);
        }
    }

    if let Err(e) = printer.finish(cancel.is_cancelled()) {
        return output_closed(&e);
    }
    if printer.failed || cancel.is_cancelled() {
        1
    } else {
        0
    }
}

/// Exit code once output can no longer be written. A closed pipe is a normal
/// way for a reader to stop early.
fn output_closed(error: &io::Error) -> i32 {
    tracing::debug!(error = %error, "output closed, session cancelled");
    if error.kind() == io::ErrorKind::BrokenPipe {
        0
    } else {
        eprintln!("error: writing output: {error}");
        1
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("hint: mstream --help");
            std::process::exit(2);
        }
    };

    if args.help {
        print_help();
        return;
    }

    if args.version {
        println!("mstream {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let config = match &args.config {
        Some(path) => match ClientConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => ClientConfig::load_or_default(),
    };

    let prompt = if let Some(prompt) = args.prompt.clone() {
        Some(prompt)
    } else if !io::stdin().is_terminal() {
        let mut buf = String::new();
        if io::stdin().read_to_string(&mut buf).is_ok() && !buf.trim().is_empty() {
            Some(buf.trim().to_string())
        } else {
            None
        }
    } else {
        None
    };

    let Some(prompt) = prompt else {
        print_help();
        std::process::exit(2);
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(config, args, prompt));
    std::process::exit(code);
}
