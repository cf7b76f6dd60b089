#![deny(clippy::all, clippy::pedantic, warnings)]

#[macro_use]
extern crate log;

use clap::Parser;
use env_logger::fmt::Color;
use log::{Level, LevelFilter};
use paxos_council::config::Addressbook;
use paxos_council::message::PeerId;
use paxos_council::peer::PeerNode;
use paxos_council::profile::StandardProfile;
use paxos_council::proposer::{self, ProposalOutcome};
use std::{env, path::PathBuf, process::exit, str::FromStr, sync::Arc, time::Duration};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;
const PROPOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);
const PROPOSE_TOKEN: &str = "propose";

/// A single-decree Paxos consensus service for a fixed council of peers.
#[derive(Debug, Parser)]
#[command(name = "paxos-council", version = VERSION)]
struct Cli {
    /// This process's member id within the addressbook.
    member_id: PeerId,

    /// The port this member listens on. Must match the addressbook entry
    /// configured for `member_id`.
    port: u16,

    /// Pass the literal word `propose` to have this member issue one
    /// proposal after a grace period for connections to form.
    propose: Option<String>,

    /// Path to a YAML addressbook overriding the default nine-member
    /// `localhost:8001..8009` book.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn set_up_logging() {
    env_logger::Builder::new()
        .filter_module(
            module_path!(),
            LevelFilter::from_str(&env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()))
                .unwrap_or(DEFAULT_LOG_LEVEL),
        )
        .format(|buf, record| {
            use std::io::Write;
            let mut style = buf.style();
            style.set_bold(true);
            match record.level() {
                Level::Error => {
                    style.set_color(Color::Red);
                }
                Level::Warn => {
                    style.set_color(Color::Yellow);
                }
                Level::Info => {
                    style.set_color(Color::Green);
                }
                Level::Debug | Level::Trace => {
                    style.set_color(Color::Blue);
                }
            }
            let indent_size = record.level().to_string().len() + 3;
            let indent = " ".repeat(indent_size);
            let options = textwrap::Options::with_termwidth()
                .initial_indent(&indent)
                .subsequent_indent(&indent);
            writeln!(
                buf,
                "{} {}",
                style.value(format!("[{}]", record.level())),
                &textwrap::fill(&record.args().to_string(), &options)[indent_size..],
            )
        })
        .init();
}

async fn load_addressbook(config: Option<&PathBuf>) -> Addressbook {
    let Some(path) = config else {
        return Addressbook::default_book();
    };
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(io_error) => {
            error!("failed to read addressbook `{}`: {io_error}", path.display());
            exit(1);
        }
    };
    match Addressbook::parse(&contents) {
        Ok(book) => book,
        Err(parse_error) => {
            error!("failed to parse addressbook `{}`: {parse_error}", path.display());
            exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    set_up_logging();

    let cli = Cli::parse();

    if let Some(token) = &cli.propose {
        if token != PROPOSE_TOKEN {
            error!("unrecognized argument `{token}`; expected `{PROPOSE_TOKEN}`");
            exit(1);
        }
    }

    let addressbook = load_addressbook(cli.config.as_ref()).await;

    let Some(configured_address) = addressbook.address_of(cli.member_id) else {
        error!("no addressbook entry for member {}", cli.member_id);
        exit(1);
    };
    if configured_address.port() != cli.port {
        error!(
            "member {}'s addressbook entry is configured for port {}, not {}",
            cli.member_id,
            configured_address.port(),
            cli.port,
        );
        exit(1);
    }

    let profile = Arc::new(StandardProfile::for_peer(cli.member_id));
    let node = PeerNode::new(cli.member_id, addressbook, profile);

    let run_handle = tokio::spawn(Arc::clone(&node).run());

    if cli.propose.is_some() {
        tokio::time::sleep(PROPOSE_GRACE_PERIOD).await;
        let value = format!("Value from Member {}", cli.member_id);
        match proposer::propose(Arc::clone(&node), &value).await {
            ProposalOutcome::Chosen(chosen) => info!("consensus reached on {chosen:?}"),
            ProposalOutcome::LostQuorum => warn!("proposal for {value:?} lost quorum"),
            ProposalOutcome::Aborted => warn!("proposal for {value:?} aborted: shutting down"),
        }
    }

    match run_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(run_error)) => {
            error!("member {} stopped with an error: {run_error}", cli.member_id);
            exit(1);
        }
        Err(join_error) => {
            error!("member {} task panicked: {join_error}", cli.member_id);
            exit(1);
        }
    }
}
