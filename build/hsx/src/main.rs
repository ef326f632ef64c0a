// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `hsx` operator CLI.
//!
//! `load` and `run` embed an executive directly; `serve` exposes the
//! JSON-RPC control plane over stdio or TCP; the remaining subcommands
//! are thin control-plane clients for a served instance.
//!
//! Exit codes: 0 success, 1 usage error, 2 runtime fault, 3 image
//! error, 4 session refused.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use hsx_abi::TaskState;
use hsx_kern::{Drivers, ExecConfig, Executive};

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_FAULT: u8 = 2;
const EXIT_IMAGE: u8 = 3;
const EXIT_SESSION: u8 = 4;

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "HSX executive host tool")]
struct Args {
    /// TOML configuration file for the executive budgets.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Control-plane address for the client subcommands.
    #[clap(long, global = true, default_value = "127.0.0.1:9178")]
    connect: String,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Subcommand)]
enum Cmd {
    /// Validates an image and prints its header summary.
    Load { image: PathBuf },

    /// Loads images and runs them until every task exits, faults, or
    /// the tick budget runs out.
    Run {
        #[clap(required = true)]
        images: Vec<PathBuf>,
        /// Maximum scheduler ticks.
        #[clap(long, default_value_t = 1_000_000)]
        ticks: u64,
    },

    /// Loads images and serves the JSON-RPC control plane.
    Serve {
        images: Vec<PathBuf>,
        /// Listen address for TCP; use --stdio for a pipe transport.
        #[clap(long, default_value = "127.0.0.1:9178")]
        listen: String,
        /// Serve a single session on stdin/stdout instead of TCP.
        #[clap(long)]
        stdio: bool,
    },

    /// Lists tasks on a served instance.
    Ps,

    /// Opens (and immediately closes) a debug session, to probe the
    /// session lock.
    Attach { pid: Option<u16> },

    /// Steps a stopped task.
    Step {
        pid: u16,
        #[clap(default_value_t = 1)]
        n: u32,
    },

    /// Breakpoint operations.
    Bp {
        #[clap(subcommand)]
        op: BpOp,
    },

    /// Mailbox listing.
    Mbox {
        #[clap(subcommand)]
        op: MboxOp,
    },

    /// Value registry access.
    Val {
        #[clap(subcommand)]
        op: ValOp,
    },

    /// Command registry access.
    Cmd {
        #[clap(subcommand)]
        op: CmdOp,
    },
}

#[derive(Debug, clap::Subcommand)]
enum BpOp {
    Set { pid: u16, addr: String },
    Clear { pid: u16, addr: String },
    List { pid: u16 },
}

#[derive(Debug, clap::Subcommand)]
enum MboxOp {
    Ls,
    Inspect { handle: u32 },
}

#[derive(Debug, clap::Subcommand)]
enum ValOp {
    Ls,
    Get { oid: String },
    Set { oid: String, value: f64 },
}

#[derive(Debug, clap::Subcommand)]
enum CmdOp {
    Ls,
    Call {
        oid: String,
        #[clap(long)]
        token: Option<u32>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("hsx: {e:#}");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn run(args: Args) -> Result<u8> {
    let config = load_config(args.config.as_deref())?;
    match args.cmd {
        Cmd::Load { image } => cmd_load(&image),
        Cmd::Run { images, ticks } => cmd_run(config, &images, ticks),
        Cmd::Serve { images, listen, stdio } => cmd_serve(config, &images, &listen, stdio),
        Cmd::Ps => client_call(&args.connect, "ps", serde_json::json!({})),
        Cmd::Attach { pid } => attach_probe(&args.connect, pid),
        Cmd::Step { pid, n } => client_call(
            &args.connect,
            "vm.step",
            serde_json::json!({ "pid": pid, "n": n }),
        ),
        Cmd::Bp { op } => match op {
            BpOp::Set { pid, addr } => client_call(
                &args.connect,
                "bp.set",
                serde_json::json!({ "pid": pid, "addr": parse_addr(&addr)? }),
            ),
            BpOp::Clear { pid, addr } => client_call(
                &args.connect,
                "bp.clear",
                serde_json::json!({ "pid": pid, "addr": parse_addr(&addr)? }),
            ),
            BpOp::List { pid } => {
                client_call(&args.connect, "bp.list", serde_json::json!({ "pid": pid }))
            }
        },
        Cmd::Mbox { op } => match op {
            MboxOp::Ls => client_call(&args.connect, "mbox.list", serde_json::json!({})),
            MboxOp::Inspect { handle } => client_call(
                &args.connect,
                "mbox.inspect",
                serde_json::json!({ "handle": handle }),
            ),
        },
        Cmd::Val { op } => match op {
            ValOp::Ls => client_call(&args.connect, "val.list", serde_json::json!({})),
            ValOp::Get { oid } => client_call(
                &args.connect,
                "val.get",
                serde_json::json!({ "oid": parse_addr(&oid)? }),
            ),
            ValOp::Set { oid, value } => client_call(
                &args.connect,
                "val.set",
                serde_json::json!({ "oid": parse_addr(&oid)?, "value": value }),
            ),
        },
        Cmd::Cmd { op } => match op {
            CmdOp::Ls => client_call(&args.connect, "cmd.list", serde_json::json!({})),
            CmdOp::Call { oid, token } => client_call(
                &args.connect,
                "cmd.call",
                serde_json::json!({ "oid": parse_addr(&oid)?, "token": token }),
            ),
        },
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<ExecConfig> {
    match path {
        None => Ok(ExecConfig::default()),
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", p.display()))
        }
    }
}

/// Accepts decimal or 0x-prefixed hex.
fn parse_addr(s: &str) -> Result<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse()?)
    }
}

fn cmd_load(path: &PathBuf) -> Result<u8> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    match hsx_hxe::Image::parse(&bytes) {
        Ok(image) => {
            println!(
                "{}: v{} entry={:#06x} code={}B data={}B bss={}B values={} commands={} mailboxes={}",
                image.app_name,
                image.version,
                image.entry_pc,
                image.code.len(),
                image.data.len(),
                image.bss_size,
                image.values.len(),
                image.commands.len(),
                image.mailboxes.len(),
            );
            Ok(EXIT_OK)
        }
        Err(e) => {
            eprintln!("hsx: image error: {e}");
            Ok(EXIT_IMAGE)
        }
    }
}

fn boot(config: ExecConfig, images: &[PathBuf]) -> Result<Result<Executive, u8>> {
    let mut exec = Executive::new(
        config,
        Drivers {
            console: Box::new(hsx_hal_stdout()),
            ..Drivers::default()
        },
    );
    for path in images {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let pid = match exec.load_image(&bytes) {
            Ok(pid) => pid,
            Err(e) => {
                eprintln!("hsx: {}: {e}", path.display());
                return Ok(Err(EXIT_IMAGE));
            }
        };
        exec.start(pid)?;
        tracing::info!(pid = pid.0, image = %path.display(), "loaded");
    }
    Ok(Ok(exec))
}

fn hsx_hal_stdout() -> impl hsx_hal::ConsoleDriver + Send {
    hsx_hal::StdoutConsole
}

fn cmd_run(config: ExecConfig, images: &[PathBuf], ticks: u64) -> Result<u8> {
    let mut exec = match boot(config, images)? {
        Ok(exec) => exec,
        Err(code) => return Ok(code),
    };
    exec.run(ticks);

    let mut code = EXIT_OK;
    for t in exec.ps() {
        if let TaskState::Faulted(kind) = t.state {
            eprintln!("hsx: fault: pid {} ({}) {:?} at pc {:#06x}", t.pid.0, t.name, kind, t.pc);
            code = EXIT_FAULT;
        }
    }
    Ok(code)
}

fn cmd_serve(config: ExecConfig, images: &[PathBuf], listen: &str, stdio: bool) -> Result<u8> {
    let mut exec = match boot(config, images)? {
        Ok(exec) => exec,
        Err(code) => return Ok(code),
    };

    if stdio {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        hsx_ctrl::serve(&mut exec, stdin.lock(), stdout.lock())?;
        return Ok(EXIT_OK);
    }

    let listener = std::net::TcpListener::bind(listen)
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "control plane listening");
    // One session at a time, matching the executive's session lock.
    for stream in listener.incoming() {
        let stream = stream?;
        let reader = BufReader::new(stream.try_clone()?);
        if let Err(e) = hsx_ctrl::serve(&mut exec, reader, stream) {
            tracing::warn!(error = %e, "session ended with error");
        }
    }
    Ok(EXIT_OK)
}

/// Opens a session, optionally pauses a task under it, and reports the
/// session info. Exit 4 when the lock is held by someone else.
fn attach_probe(addr: &str, pid: Option<u16>) -> Result<u8> {
    let stream = TcpStream::connect(addr).with_context(|| format!("connecting {addr}"))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let open = rpc(
        &mut reader,
        &mut writer,
        1,
        "session.open",
        serde_json::json!({ "client": format!("hsx-cli-{}", std::process::id()) }),
    )?;
    if open["ok"] != serde_json::json!(true) {
        eprintln!("hsx: session refused: {}", open["error"]["message"]);
        return Ok(EXIT_SESSION);
    }
    println!("{}", serde_json::to_string_pretty(&open["result"])?);
    if let Some(pid) = pid {
        let r = rpc(
            &mut reader,
            &mut writer,
            2,
            "vm.pause",
            serde_json::json!({ "pid": pid }),
        )?;
        if r["ok"] != serde_json::json!(true) {
            eprintln!("hsx: {}", r["error"]["message"]);
        }
    }
    Ok(EXIT_OK)
}

/// One-shot control-plane client: opens a session, issues the command,
/// prints the result, closes.
fn client_call(addr: &str, cmd: &str, cmd_args: serde_json::Value) -> Result<u8> {
    let stream = TcpStream::connect(addr).with_context(|| format!("connecting {addr}"))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let open = rpc(
        &mut reader,
        &mut writer,
        1,
        "session.open",
        serde_json::json!({ "client": format!("hsx-cli-{}", std::process::id()) }),
    )?;
    if open["ok"] != serde_json::json!(true) {
        eprintln!("hsx: session refused: {}", open["error"]["message"]);
        return Ok(EXIT_SESSION);
    }

    let response = rpc(&mut reader, &mut writer, 2, cmd, cmd_args)?;
    if response["ok"] == serde_json::json!(true) {
        println!("{}", serde_json::to_string_pretty(&response["result"])?);
        let _ = rpc(&mut reader, &mut writer, 3, "session.close", serde_json::json!({}));
        Ok(EXIT_OK)
    } else {
        eprintln!("hsx: {}", response["error"]["message"]);
        let _ = rpc(&mut reader, &mut writer, 3, "session.close", serde_json::json!({}));
        Ok(EXIT_FAULT)
    }
}

fn rpc<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    seq: u64,
    cmd: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value> {
    let frame = serde_json::json!({ "version": 1, "cmd": cmd, "args": args, "seq": seq });
    serde_json::to_writer(&mut *writer, &frame)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    // Skip interleaved event frames; responses carry "ok".
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            anyhow::bail!("server closed the connection");
        }
        let value: serde_json::Value = serde_json::from_str(&line)?;
        if value.get("ok").is_some() {
            return Ok(value);
        }
    }
}
