use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::device::{discover_ports, list_available_ports};
use crate::serial::loopback::LOOPBACK_PORT_NAME;
use crate::serial::{
    ByteSize, LoopbackOpener, Parity, PortConfig, SerialSession, SessionError, SessionEvent, SessionStatus, StopBits,
};

const STDIN_CHUNK: usize = 1024;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List available serial ports
    Ports {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Open a port and run an interactive terminal
    Open(OpenArgs),
}

#[derive(Debug, Default, Args)]
pub struct OpenArgs {
    /// Port to open; defaults to the first enumerated port
    pub port: Option<String>,

    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Data bits per character (5-8)
    #[arg(long)]
    pub data_bits: Option<u8>,

    /// 1, 1.5 or 2
    #[arg(long)]
    pub stop_bits: Option<StopBits>,

    /// none, odd, even, mark or space
    #[arg(long)]
    pub parity: Option<Parity>,

    /// Enable XON/XOFF flow control
    #[arg(long)]
    pub flow_control: bool,

    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// JSON port configuration; flags override its fields
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Show received bytes as hex instead of text
    #[arg(long)]
    pub hex: bool,

    /// Seconds between status lines on stderr (0 disables)
    #[arg(long, default_value_t = 1)]
    pub status_interval_secs: u64,

    /// Use the built-in echo device instead of real hardware
    #[arg(long)]
    pub loopback: bool,
}

impl OpenArgs {
    /// Apply command-line overrides on top of `base`
    pub fn apply(&self, mut base: PortConfig) -> anyhow::Result<PortConfig> {
        if let Some(port) = &self.port {
            base.port_name = port.clone();
        }
        if let Some(baud) = self.baud {
            base.baud_rate = baud;
        }
        if let Some(bits) = self.data_bits {
            base.byte_size = ByteSize::try_from(bits).map_err(anyhow::Error::msg)?;
        }
        if let Some(stop_bits) = self.stop_bits {
            base.stop_bits = stop_bits;
        }
        if let Some(parity) = self.parity {
            base.parity = parity;
        }
        if self.flow_control {
            base.flow_control = true;
        }
        if let Some(ms) = self.read_timeout_ms {
            base.read_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.write_timeout_ms {
            base.write_timeout = Some(Duration::from_millis(ms));
        }
        Ok(base)
    }

    /// Config file, then flags, then a fallback port if none was named
    pub fn resolve_config(&self) -> anyhow::Result<PortConfig> {
        let base = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                PortConfig::from_json(&text)
                    .with_context(|| format!("Invalid port configuration in {}", path.display()))?
            }
            None => PortConfig::default(),
        };
        let mut config = self.apply(base)?;

        if config.port_name.is_empty() {
            config.port_name = if self.loopback {
                LOOPBACK_PORT_NAME.to_string()
            } else {
                match list_available_ports()?.into_iter().next() {
                    Some(port) => {
                        log::info!("No port given, using first available: {}", port);
                        port
                    }
                    None => bail!("No serial ports found"),
                }
            };
        }
        Ok(config)
    }
}

pub async fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ports { json } => list_ports(json),
        Command::Open(args) => open_terminal(args).await,
    }
}

fn list_ports(json: bool) -> anyhow::Result<()> {
    let ports = discover_ports()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
    } else if ports.is_empty() {
        println!("No serial ports found!");
    } else {
        println!("Available serial ports:");
        for port in &ports {
            println!("  {}", port.describe());
        }
    }
    Ok(())
}

/// Turns received chunks into terminal text.
///
/// A UTF-8 sequence split across two reads is held back until the rest
/// arrives; bytes that can never be valid print as U+FFFD.
#[derive(Debug, Default)]
pub struct ReceivedRenderer {
    hex: bool,
    pending: Vec<u8>,
}

impl ReceivedRenderer {
    pub fn new(hex: bool) -> Self {
        Self {
            hex,
            pending: Vec::new(),
        }
    }

    pub fn render(&mut self, data: &[u8]) -> String {
        if self.hex {
            return render_hex(data);
        }

        self.pending.extend_from_slice(data);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest = self.pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        // Incomplete sequence at the end; wait for the next chunk
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }
}

fn render_hex(data: &[u8]) -> String {
    let encoded = hex::encode_upper(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 2);
    for pair in encoded.as_bytes().chunks(2) {
        out.push_str(&String::from_utf8_lossy(pair));
        out.push(' ');
    }
    out
}

pub fn format_status(status: &SessionStatus) -> String {
    let mut line = format!(
        "[{}] {} bps {} | {:?} | Bytes Received: {}",
        status.port_name, status.baud_rate, status.line, status.state, status.bytes_received_total
    );
    if let Some(reason) = &status.device_gone {
        line.push_str(&format!(" | device gone: {}", reason));
    }
    line
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Forward stdin chunks as they arrive; the channel closes on EOF
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; STDIN_CHUNK];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

async fn write_flush(out: &mut tokio::io::Stdout, data: &[u8]) -> std::io::Result<()> {
    out.write_all(data).await?;
    out.flush().await
}

async fn open_terminal(args: OpenArgs) -> anyhow::Result<()> {
    let config = args.resolve_config()?;
    let session = Arc::new(if args.loopback {
        SerialSession::with_opener(config.clone(), Arc::new(LoopbackOpener::new(config.port_name.clone())))
    } else {
        SerialSession::new(config.clone())
    });
    let mut events = session.event_channel();

    {
        let opening = session.clone();
        let open_config = config.clone();
        tokio::task::spawn_blocking(move || opening.open(open_config))
            .await?
            .with_context(|| format!("Cannot open {}", config.port_name))?;
    }
    eprintln!(
        "Connected to {} at {} baud ({}). Type to send, Ctrl-C to exit.",
        config.port_name,
        config.baud_rate,
        config.line_summary()
    );

    let mut input = spawn_stdin_reader();
    let mut ticker = (args.status_interval_secs > 0).then(|| {
        let mut t = interval(Duration::from_secs(args.status_interval_secs));
        t.set_missed_tick_behavior(MissedTickBehavior::Skip);
        t
    });
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = tokio::io::stdout();
    let mut renderer = ReceivedRenderer::new(args.hex);

    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("Interrupted");
                break Ok(());
            }
            chunk = input.recv() => {
                let Some(chunk) = chunk else {
                    log::info!("Input closed");
                    break Ok(());
                };
                let s = session.clone();
                let sent = match tokio::task::spawn_blocking(move || s.send(&chunk)).await {
                    Ok(sent) => sent,
                    Err(e) => break Err(e.into()),
                };
                match sent {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => log::warn!("Send failed, input dropped: {}", e),
                    Err(e @ SessionError::DeviceGone(_)) => break Err(e.into()),
                    Err(e) => break Err(anyhow::Error::new(e).context("Send failed")),
                }
            }
            event = events.recv() => {
                match event {
                    Some(SessionEvent::Data(bytes)) => {
                        let text = renderer.render(&bytes);
                        if let Err(e) = write_flush(&mut stdout, text.as_bytes()).await {
                            break Err(anyhow::Error::new(e).context("stdout closed"));
                        }
                    }
                    Some(SessionEvent::Error(e)) => break Err(e.into()),
                    None => break Ok(()),
                }
            }
            _ = next_tick(&mut ticker) => {
                eprintln!("{}", format_status(&session.status()));
            }
        }
    };

    let closing = session.clone();
    tokio::task::spawn_blocking(move || closing.close()).await?;
    eprintln!("{}", format_status(&session.status()));
    outcome
}
