//! ptytask - run a command on a pty and relay it to this terminal
//!
//! Standard input is forwarded to the child (in raw mode when it is a
//! terminal) and the child's output is copied to standard output. Optionally
//! logs the session, routes it through a coprocess, and prints a JSON status
//! summary when the child is gone.

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ptytask::{
    ChannelDelegate, ChildBuilder, ConfigOverrides, Coprocess, PtySession, Scheduler,
    SessionConfig, SessionEvent, WindowSize,
};

/// Run a command on a pseudoterminal
#[derive(Parser, Debug, Clone)]
#[command(name = "ptytask")]
#[command(version)]
#[command(about = "Run a command on a pty, with optional logging and a coprocess", long_about = None)]
struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Terminal columns (defaults to the current terminal)
    #[arg(long, value_name = "COLS")]
    cols: Option<u16>,

    /// Terminal rows (defaults to the current terminal)
    #[arg(long, value_name = "ROWS")]
    rows: Option<u16>,

    /// Append everything the command prints to FILE
    #[arg(short, long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Shell command whose output is typed into the session
    #[arg(long, value_name = "CMD")]
    coprocess: Option<String>,

    /// Do not show the command's output while a coprocess is attached
    #[arg(long, requires = "coprocess")]
    mute: bool,

    /// Print the final session state as JSON on exit
    #[arg(long)]
    status_json: bool,

    /// Program and arguments (defaults to $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = CliArgs::parse();
    let overrides = ConfigOverrides {
        config_path: args.config.clone(),
        cols: args.cols,
        rows: args.rows,
        ..ConfigOverrides::default()
    };
    let config = match SessionConfig::load_with_overrides(&overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&args, config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ptytask: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &CliArgs, config: SessionConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let interactive = io::stdin().is_terminal();
    let follow_terminal = interactive && args.cols.is_none() && args.rows.is_none();
    let mut size = match get_terminal_size() {
        Some((cols, rows)) if follow_terminal => WindowSize::new(cols, rows),
        _ => WindowSize::new(config.default_cols, config.default_rows),
    };

    let term = config.term.clone();
    let scheduler = Scheduler::new(config)?;
    let session = PtySession::new(&scheduler);
    let (delegate, events) = ChannelDelegate::channel();
    session.set_delegate(delegate);

    if let Some(path) = &args.log {
        session.logging_start(path)?;
    }

    let builder = match args.command.split_first() {
        Some((program, rest)) => ChildBuilder::new(program).args(rest),
        None => ChildBuilder::default_shell(),
    };
    session.launch(builder.env("TERM", term).size(size), true)?;
    tracing::info!("{}", session.snapshot());

    if let Some(command) = &args.coprocess {
        session.set_coprocess(Coprocess::launch(command, args.mute)?)?;
    }

    let raw_guard = if interactive {
        Some(RawModeGuard::new()?)
    } else {
        None
    };
    spawn_stdin_relay(Arc::clone(&session), interactive);

    let mut stdout = io::stdout().lock();
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(SessionEvent::Output(data)) => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            Ok(SessionEvent::BrokenPipe) => tracing::debug!("session pipe closed"),
            Ok(SessionEvent::CoprocessStatusChanged) => {
                tracing::debug!(coprocess = ?session.coprocess_command(), "coprocess changed");
            }
            Ok(SessionEvent::Deregistered) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if follow_terminal {
                    if let Some((cols, rows)) = get_terminal_size() {
                        if (cols, rows) != (size.cols, size.rows) {
                            size = WindowSize::new(cols, rows);
                            session.set_size(cols, rows);
                        }
                    }
                }
            }
        }
    }
    drop(raw_guard);

    let snapshot = session.snapshot();
    if args.status_json {
        println!("{}", serde_json::to_string(&snapshot)?);
    }
    let code = session.status().map_or(1, |status| status.code());
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
}

/// Forward standard input to the session until it closes
fn spawn_stdin_relay(session: Arc<PtySession>, interactive: bool) {
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => {
                    // Let a line-mode child see end-of-file too.
                    if !interactive {
                        session.write(b"\x04");
                    }
                    break;
                }
                Ok(n) => session.write(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
}

/// Get terminal size using ioctl
fn get_terminal_size() -> Option<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ writes a winsize struct that outlives the call.
    let result = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };

    if result == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

/// RAII guard for raw terminal mode
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    fn new() -> io::Result<Self> {
        use nix::sys::termios::{self, SetArg};

        let original = termios::tcgetattr(io::stdin())?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw)?;

        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &self.original);
    }
}
