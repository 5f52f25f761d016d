//! CLI entry point for `papercut`.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use humansize::{format_size, BINARY};

use papercut::config::{self, Config, SmtpConfig};
use papercut::model::{MessageEntry, StructuredMessage};
use papercut::parser::{self, html};
use papercut::pipeline::{selection_after_delete, CancelToken, Preview, Publish};
use papercut::service::{MailService, ServiceChannels};
use papercut::store::{MessageStore, StoreEvent};

/// How long the console loop waits for a preview before polling the rest.
const TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(
    name = "papercut",
    version,
    about = "Local SMTP sink: captures every message sent to it for inspection"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Address to listen on (overrides the config file)
    #[arg(long, global = true, value_name = "HOST")]
    host: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Message directory (overrides the config file)
    #[arg(short, long, global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SMTP listener with an interactive console (default)
    Serve,
    /// List captured messages
    List {
        #[arg(long)]
        json: bool,
    },
    /// Decode and print one message file
    Show {
        file: PathBuf,
        /// Print the raw file instead of the decoded view
        #[arg(long)]
        raw: bool,
        /// Write the HTML body and inline parts into this directory
        #[arg(long, value_name = "DIR")]
        html_out: Option<PathBuf>,
    },
    /// Delete one message file
    Delete { file: PathBuf },
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config();
    if let Some(host) = cli.host.clone() {
        config.smtp.host = host;
    }
    if let Some(port) = cli.port {
        config.smtp.port = port;
    }
    if let Some(dir) = cli.dir.clone() {
        config.storage.message_dir = Some(dir);
    }

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(config),
        Commands::List { json } => cmd_list(&config, json),
        Commands::Show {
            file,
            raw,
            html_out,
        } => cmd_show(&file, raw, html_out.as_deref()),
        Commands::Delete { file } => cmd_delete(&config, &file),
        Commands::Config => cmd_config(&config),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "papercut.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "papercut", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    if let Some(path) = config::config_file_path() {
        println!("# {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<MessageStore> {
    let dir = config::message_dir(config);
    Ok(MessageStore::open(&dir, &config.storage.extension)?)
}

fn cmd_list(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let entries = store.list();

    if json {
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "path": e.path().to_string_lossy(),
                    "modified": e.modified().to_rfc3339(),
                    "size": e.size(),
                })
            })
            .collect();
        let output = serde_json::json!({
            "directory": store.dir().to_string_lossy(),
            "count": entries.len(),
            "messages": items,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_entries(&entries);
    }
    Ok(())
}

fn cmd_show(file: &Path, raw: bool, html_out: Option<&Path>) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let bytes = std::fs::read(file)?;
    if raw {
        print!("{}", String::from_utf8_lossy(&bytes));
        return Ok(());
    }

    let message = parser::decode(&bytes, &CancelToken::never())?;
    print_message(&message);

    if let Some(dir) = html_out {
        let path = papercut::render::write_html_preview(&message, dir)?;
        println!("  HTML preview written to {}", path.display());
    }
    Ok(())
}

fn cmd_delete(config: &Config, file: &Path) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let entry = match store.get(file) {
        Some(entry) => entry,
        None => MessageEntry::from_path(file)?,
    };
    store.remove(&entry)?;
    println!("  Deleted {}", file.display());
    Ok(())
}

// ── serve ───────────────────────────────────────────────────────

/// State owned by the console thread.
struct Console {
    service: MailService,
    channels: ServiceChannels,
    view: Vec<MessageEntry>,
    selected: Option<usize>,
    /// Print the next preview as the raw file instead of the decoded view.
    raw_view: bool,
}

enum Flow {
    Continue,
    Quit,
}

fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let (mut service, channels) = MailService::open(config)?;

    match service.start_listener() {
        Ok(addr) => println!("  Listening on {addr}"),
        Err(e) => {
            eprintln!("  {e}");
            eprintln!("  Use `rebind HOST:PORT` to pick another address.");
        }
    }
    println!(
        "  Messages in {} ({} captured)",
        service.store().dir().display(),
        service.store().len()
    );
    println!("  Commands: list, show N, raw N, delete N, rebind HOST:PORT, quit");

    let view = service.store().list().to_vec();
    let mut console = Console {
        service,
        channels,
        view,
        selected: None,
        raw_view: false,
    };
    let commands = spawn_stdin_reader();

    loop {
        console.drain_events();
        match commands.try_recv() {
            Ok(line) => {
                if let Flow::Quit = console.execute(line.trim()) {
                    break;
                }
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        if let Some(publish) = console.channels.previews.recv_timeout(TICK) {
            console.show(publish);
        }
    }

    console.service.shutdown();
    Ok(())
}

/// Forward stdin lines to the console loop.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

impl Console {
    fn drain_events(&mut self) {
        while let Ok(entry) = self.channels.arrivals.try_recv() {
            println!(
                "  New message: {} ({})",
                entry.file_name(),
                format_size(entry.size(), BINARY)
            );
        }
        let mut changed = false;
        while let Ok(event) = self.channels.store_events.try_recv() {
            if let StoreEvent::Removed(entry) = &event {
                tracing::debug!(path = %entry.path().display(), "View updated after removal");
            }
            changed = true;
        }
        if changed {
            self.view = self.service.store().list().to_vec();
        }
    }

    fn execute(&mut self, line: &str) -> Flow {
        let (cmd, arg) = match line.split_once(' ') {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (line, ""),
        };
        let result = match cmd {
            "" => Ok(()),
            "list" | "ls" => {
                print_entries(&self.view);
                Ok(())
            }
            "show" => self.index_arg(arg).map(|i| {
                self.raw_view = false;
                self.select(i);
            }),
            "raw" => self.index_arg(arg).map(|i| {
                self.raw_view = true;
                self.select(i);
            }),
            "delete" | "rm" => self.index_arg(arg).and_then(|i| self.delete(i)),
            "rebind" => self.rebind(arg),
            "quit" | "exit" | "q" => return Flow::Quit,
            other => Err(anyhow::anyhow!("Unknown command '{other}'")),
        };
        if let Err(e) = result {
            eprintln!("  {e}");
        }
        Flow::Continue
    }

    /// Parse a 1-based index shown by `list`.
    fn index_arg(&self, arg: &str) -> anyhow::Result<usize> {
        let n: usize = arg
            .parse()
            .map_err(|_| anyhow::anyhow!("Expected a message number, got '{arg}'"))?;
        if n == 0 || n > self.view.len() {
            anyhow::bail!("No message #{n} ({} listed)", self.view.len());
        }
        Ok(n - 1)
    }

    fn select(&mut self, index: usize) {
        self.selected = Some(index);
        self.service.select(self.view[index].clone());
    }

    fn delete(&mut self, index: usize) -> anyhow::Result<()> {
        let entry = self.view[index].clone();
        self.service.delete(&entry)?;
        self.view = self.service.store().list().to_vec();
        println!("  Deleted {}", entry.file_name());

        let next = selection_after_delete(self.selected, index, self.view.len());
        if self.selected == Some(index) {
            match next {
                Some(next) => self.select(next),
                None => {
                    self.selected = None;
                    self.service.clear_selection();
                }
            }
        } else {
            self.selected = next;
        }
        Ok(())
    }

    fn rebind(&mut self, arg: &str) -> anyhow::Result<()> {
        let (host, port) = arg
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("Expected HOST:PORT"))?;
        let port: u16 = port.parse()?;
        let smtp = SmtpConfig {
            host: host.trim_matches(['[', ']']).to_string(),
            port,
            ..self.service.config().smtp.clone()
        };
        match self.service.rebind(smtp) {
            Ok(addr) => {
                println!("  Listening on {addr}");
                Ok(())
            }
            Err(e) => {
                anyhow::bail!("{e}. The listener is stopped; try another address.")
            }
        }
    }

    fn show(&self, publish: Publish) {
        match publish {
            Publish::Message(preview) if self.raw_view => {
                println!();
                println!("  {}", preview.entry.path().display());
                println!();
                println!("{}", preview.raw);
            }
            Publish::Message(preview) => print_preview(&preview),
            Publish::Failed { entry, error } => {
                println!("  {}: preview unavailable ({error})", entry.file_name());
            }
            Publish::Cleared => println!("  (no message selected)"),
        }
    }
}

// ── output ──────────────────────────────────────────────────────

fn print_entries(entries: &[MessageEntry]) {
    println!();
    println!("  {} message(s)", entries.len());
    if entries.is_empty() {
        println!();
        return;
    }
    println!();
    println!("  {:<4} {:<17} {:<44} {:>10}", "#", "Received", "File", "Size");
    println!("  {}", "-".repeat(78));
    for (i, entry) in entries.iter().enumerate() {
        let name: String = entry.file_name().chars().take(43).collect();
        println!(
            "  {:<4} {:<17} {:<44} {:>10}",
            i + 1,
            entry.modified().format("%Y-%m-%d %H:%M"),
            name,
            format_size(entry.size(), BINARY)
        );
    }
    println!();
}

fn print_preview(preview: &Preview) {
    println!();
    println!("  {}", preview.entry.path().display());
    print_message(&preview.message);
}

fn print_message(message: &StructuredMessage) {
    println!();
    println!("  {:<10} {}", "From:", message.from);
    println!("  {:<10} {}", "To:", message.to);
    if !message.cc.is_empty() {
        println!("  {:<10} {}", "Cc:", message.cc);
    }
    println!("  {:<10} {}", "Date:", message.date);
    println!("  {:<10} {}", "Subject:", message.subject);
    println!();

    if message.html {
        println!("{}", html::html_to_text(&message.body));
    } else {
        println!("{}", message.body);
    }

    if !message.attachments.is_empty() {
        println!();
        println!("  Attachments:");
        for att in &message.attachments {
            let name = att
                .filename
                .as_deref()
                .or(att.content_id.as_deref())
                .unwrap_or("(unnamed)");
            println!(
                "    {:<40} {:<24} {:>10}",
                name,
                att.content_type,
                format_size(att.size(), BINARY)
            );
        }
    }
    println!();
}
