use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use foundry_protocol::{headers, EventKind, StreamEvent, TokenTicket, API_PREFIX};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::json;

mod client;
mod sse;

use client::SignedClient;

#[derive(Parser)]
#[command(name = "foundry", version, about = "Signed client for the Foundry agent")]
struct Cli {
    #[command(flatten)]
    conn: Conn,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Conn {
    /// Agent base URL; falls back to FOUNDRY_URL
    #[arg(long, global = true)]
    url: Option<String>,
    /// Shared secret (64 hex chars); falls back to FOUNDRY_SECRET
    #[arg(long, global = true)]
    secret: Option<String>,
    /// Operator name sent as x-foundry-actor; falls back to FOUNDRY_ACTOR
    #[arg(long, global = true)]
    actor: Option<String>,
    /// Request timeout in seconds for non-streaming calls
    #[arg(long, global = true, default_value_t = 60)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and print its event stream
    Run {
        /// Command words, e.g. `plugin list --format=json` or `foundry backup-db`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        /// Print each event as one JSON line
        #[arg(long)]
        json: bool,
    },
    /// Fetch a staged archive by token (single use)
    Download {
        token: String,
        /// Output file; defaults to the name the agent suggests
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a zip and print its token
    Upload {
        file: PathBuf,
        /// Display filename; defaults to the file's basename
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete an uploaded zip
    UploadDelete { token: String },
    /// Replace the shared secret; the current one stops working
    RotateSecret,
    /// Print signed headers for a request, for use with curl
    Sign {
        #[arg(long, default_value = "POST")]
        method: String,
        /// Route path, e.g. /foundry/v1/run
        path: String,
        #[arg(long, default_value = "")]
        query: String,
        #[arg(long, default_value = "")]
        body: String,
    },
}

fn env_fallback(opt: &Option<String>, key: &str) -> Option<String> {
    opt.clone()
        .or_else(|| std::env::var(key).ok())
        .filter(|s| !s.trim().is_empty())
}

impl Conn {
    fn base(&self) -> String {
        env_fallback(&self.url, "FOUNDRY_URL").unwrap_or_else(|| "http://127.0.0.1:8093".into())
    }

    fn secret(&self) -> Result<String> {
        env_fallback(&self.secret, "FOUNDRY_SECRET")
            .context("no shared secret: pass --secret or set FOUNDRY_SECRET")
    }

    fn client(&self, timeout: Option<Duration>) -> Result<SignedClient> {
        SignedClient::new(
            &self.base(),
            &self.secret()?,
            env_fallback(&self.actor, "FOUNDRY_ACTOR"),
            timeout,
        )
    }
}

fn route(tail: &str) -> String {
    format!("{API_PREFIX}/{tail}")
}

fn main() -> ExitCode {
    foundry_otel::init();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let timeout = Some(Duration::from_secs(cli.conn.timeout));
    match cli.command {
        Commands::Run { command, json } => cmd_run(&cli.conn, &command.join(" "), json),
        Commands::Download { token, output } => {
            cmd_download(&cli.conn.client(None)?, &token, output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Upload { file, name } => {
            cmd_upload(&cli.conn.client(timeout)?, &file, name)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::UploadDelete { token } => {
            let body = serde_json::to_vec(&json!({ "token": token }))?;
            let resp = cli.conn.client(timeout)?.send(
                Method::POST,
                &route("upload/delete"),
                "",
                body,
                &[],
            )?;
            println!("{}", resp.text()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::RotateSecret => {
            let resp =
                cli.conn
                    .client(timeout)?
                    .send(Method::POST, &route("secret/rotate"), "", Vec::new(), &[])?;
            let v: serde_json::Value = resp.json()?;
            println!(
                "secret rotated (fingerprint {}); read the new value from the agent state dir",
                v["fingerprint"].as_str().unwrap_or("?")
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sign {
            method,
            path,
            query,
            body,
        } => {
            let secret = client::decode_secret(&cli.conn.secret()?)?;
            let signed = client::sign_headers(
                &secret,
                &method,
                &path,
                &query,
                body.as_bytes(),
                chrono::Utc::now().timestamp(),
            )?;
            for (name, value) in signed {
                println!("-H '{name}: {value}'");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_run(conn: &Conn, command: &str, as_json: bool) -> Result<ExitCode> {
    // Streams have no overall deadline; backups can run for a long time.
    let client = conn.client(None)?;
    let body = serde_json::to_vec(&json!({ "command": command }))?;
    let resp = client.send(
        Method::POST,
        &route("run"),
        "",
        body,
        &[("accept", "text/event-stream".to_string())],
    )?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut status = ExitCode::from(1);
    for frame in sse::FrameReader::new(BufReader::new(resp)) {
        let event = frame?.decode()?;
        if as_json {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
        } else {
            render(&mut out, &event)?;
        }
        match event.kind {
            EventKind::CommandComplete => status = ExitCode::SUCCESS,
            EventKind::CommandError => status = ExitCode::from(1),
            _ => {}
        }
        if event.kind.is_terminal() {
            break;
        }
    }
    Ok(status)
}

fn render(out: &mut impl Write, event: &StreamEvent) -> Result<()> {
    let d = &event.data;
    match event.kind {
        EventKind::CommandStart => {
            eprintln!("> {}", d["command"].as_str().unwrap_or_default());
        }
        EventKind::CommandOutput => {
            writeln!(out, "{}", d["line"].as_str().unwrap_or_default())?;
        }
        EventKind::CommandData => {
            writeln!(out, "{}", serde_json::to_string(&d["data"])?)?;
        }
        EventKind::CommandProgress => {
            eprintln!("... {}", serde_json::to_string(d)?);
        }
        EventKind::CommandComplete => {
            eprintln!(
                "done: exit {} after {} lines in {} ms",
                d["exit_code"], d["lines"], d["duration_ms"]
            );
        }
        EventKind::CommandError => {
            eprintln!(
                "failed [{}]: {}",
                d["code"].as_str().unwrap_or("unknown"),
                d["message"].as_str().unwrap_or_default()
            );
        }
    }
    Ok(())
}

/// Filename from `attachment; filename="..."`, reduced to a basename.
fn attachment_name(value: &str) -> Option<String> {
    let raw = value.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("filename=")
            .map(|v| v.trim_matches('"').to_string())
    })?;
    Path::new(&raw)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

fn cmd_download(client: &SignedClient, token: &str, output: Option<&Path>) -> Result<()> {
    let query = format!("token={token}");
    let mut resp = client.send(Method::GET, &route("download"), &query, Vec::new(), &[])?;
    let is_zip = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/zip"));
    if !is_zip {
        bail!("agent did not return a zip archive");
    }
    let target = match output {
        Some(path) => path.to_path_buf(),
        None => resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(attachment_name)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{token}.zip"))),
    };
    let mut file =
        File::create(&target).with_context(|| format!("creating {}", target.display()))?;
    let written = resp.copy_to(&mut file).context("writing archive")?;
    eprintln!("saved {} ({written} bytes)", target.display());
    Ok(())
}

fn cmd_upload(client: &SignedClient, file: &Path, name: Option<String>) -> Result<()> {
    let body = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let name = name
        .or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "upload.zip".into());
    let resp = client.send(
        Method::POST,
        &route("upload"),
        "",
        body,
        &[
            (headers::FILENAME, name),
            ("content-type", "application/zip".into()),
        ],
    )?;
    let ticket: TokenTicket = resp.json()?;
    println!("{}", serde_json::to_string_pretty(&ticket)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_name_strips_directories() {
        assert_eq!(
            attachment_name("attachment; filename=\"content-20240101-000000.zip\""),
            Some("content-20240101-000000.zip".into())
        );
        assert_eq!(
            attachment_name("attachment; filename=\"../../etc/passwd\""),
            Some("passwd".into())
        );
        assert_eq!(attachment_name("inline"), None);
    }

    #[test]
    fn run_accepts_hyphenated_words() {
        let cli = Cli::try_parse_from(["foundry", "run", "plugin", "list", "--format=json"]).unwrap();
        match cli.command {
            Commands::Run { command, json } => {
                assert_eq!(command.join(" "), "plugin list --format=json");
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }
}
