// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::{Parser, Subcommand};
use tracing::error;

use thumbwatch::{ClientConfig, ProgressEvent, ProgressStatus, Session, SessionSignal, TrackOptions};

#[derive(Debug, Parser)]
#[command(name = "thumbwatch", version, about = "Track thumbnail generation jobs.")]
struct Cli {
    #[command(flatten)]
    client: ClientConfig,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, default_value = "info", env = "THUMBWATCH_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: text or json.
    #[arg(long, default_value = "text", env = "THUMBWATCH_LOG_FORMAT", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in and store the credential.
    Login {
        #[arg(long, env = "THUMBWATCH_EMAIL")]
        email: String,
        #[arg(long, env = "THUMBWATCH_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored credential.
    Logout,
    /// Start a job, then watch it unless `--detach` is given.
    Generate {
        #[arg(long)]
        prompt: String,
        /// Print the job id and exit.
        #[arg(long)]
        detach: bool,
        #[command(flatten)]
        channels: ChannelArgs,
    },
    /// Watch an existing job until it finishes.
    Watch {
        job_id: String,
        #[command(flatten)]
        channels: ChannelArgs,
    },
}

#[derive(Debug, Clone, Copy, clap::Args)]
struct ChannelArgs {
    /// Do not subscribe on the push channel.
    #[arg(long)]
    no_push: bool,
    /// Do not poll job status.
    #[arg(long)]
    no_poll: bool,
}

impl ChannelArgs {
    fn options(self) -> TrackOptions {
        TrackOptions { push: !self.no_push, poll: !self.no_poll }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, &cli.log_format);

    if let Err(e) = run(cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr; stdout carries the JSON event stream.
    match log_format {
        "json" => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let session = Session::start(cli.client.clone())?;

    match cli.command {
        Command::Login { email, password } => {
            if cli.client.credential_file.is_none() {
                tracing::warn!(
                    "no --credential-file set; the credential will not outlive this process"
                );
            }
            session.sign_in_with_password(&email, &password).await?;
            session.close();
        }
        Command::Logout => {
            session.sign_out();
        }
        Command::Generate { prompt, detach, channels } => {
            require_sign_in(&session)?;
            let job_id = session.create_job(&prompt).await?;
            println!("{}", serde_json::json!({ "jobId": job_id }));
            if !detach {
                watch(&session, &job_id, channels.options()).await?;
            }
            session.close();
        }
        Command::Watch { job_id, channels } => {
            require_sign_in(&session)?;
            watch(&session, &job_id, channels.options()).await?;
            session.close();
        }
    }
    Ok(())
}

fn require_sign_in(session: &Session) -> anyhow::Result<()> {
    if !session.is_signed_in() {
        anyhow::bail!("not signed in; run `thumbwatch login` first");
    }
    Ok(())
}

/// Print every accepted update for `job_id` as a JSON line until it finishes.
async fn watch(session: &Session, job_id: &str, options: TrackOptions) -> anyhow::Result<()> {
    if !options.push && !options.poll {
        anyhow::bail!("--no-push and --no-poll leave nothing to watch with");
    }

    let mut updates = session.observe();
    let mut signals = session.signals();
    let handle = session.track(job_id, options);

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break Outcome::Interrupted;
            }
            update = updates.recv() => {
                let Some(event) = update else { break Outcome::Interrupted };
                if event.job_id != job_id {
                    continue;
                }
                println!("{}", serde_json::to_string(&event)?);
                if event.is_terminal() {
                    break Outcome::Finished(event);
                }
            }
            signal = signals.recv() => {
                match signal {
                    Ok(SessionSignal::SignInRequired) => break Outcome::Expired,
                    Ok(signal) => println!("{}", serde_json::to_string(&signal)?),
                    Err(_) => continue,
                }
            }
        }
    };

    session.untrack(handle);
    match outcome {
        Outcome::Finished(ProgressEvent { status: ProgressStatus::Failed, message, .. }) => {
            let reason = message.unwrap_or_else(|| "no reason given".into());
            anyhow::bail!("job {job_id} failed: {reason}")
        }
        Outcome::Expired => anyhow::bail!("session expired; sign in again"),
        Outcome::Finished(_) | Outcome::Interrupted => Ok(()),
    }
}

enum Outcome {
    Finished(ProgressEvent),
    Interrupted,
    Expired,
}
