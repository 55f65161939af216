use std::{
    io::{BufRead, Write},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use release_signer::{
    config::Config,
    ledger::HttpLedger,
    manifest::PACKAGE_MANIFEST,
    report::{VerificationOutcome, VerificationReport},
    sign::{SignedRelease, SigningEngine},
    store::MANIFEST_FILE,
    trust::PassphrasePrompt,
    vcs::{CommitMessage, Git},
    verify::{VerificationEngine, LATEST},
};

/// signer
#[derive(Debug, Parser)]
#[clap(name = "signer", version)]
pub struct App {
    /// the package or project directory
    #[clap(long, default_value = ".")]
    root: PathBuf,
    /// directory holding keys, certificates and config.toml
    #[clap(long, env = "RELEASE_SIGNER_DIR")]
    trust_dir: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Prepares a package for signing by creating an empty signatures.json
    Init,
    /// Signs the tracked files of the package as a new release
    Sign {
        /// must match the tag the release will get
        version: Option<String>,
        /// passphrase of the signing key
        password: Option<String>,
    },
    /// Signs a new release, then commits, pushes and tags it
    #[clap(group(clap::ArgGroup::new("commit").required(true).args(["message", "file"])))]
    Release {
        version: Option<String>,
        password: Option<String>,
        /// commit message
        #[clap(short = 'm', long)]
        message: Option<String>,
        /// file holding the commit message
        #[clap(long)]
        file: Option<PathBuf>,
        /// remote to push to, if there is more than one
        #[clap(long)]
        remote: Option<String>,
    },
    /// Verifies the project and every installed dependency
    Verify {
        /// also list packages without signatures
        #[clap(long)]
        skipped: bool,
    },
    /// Lists the signing keys in the trust directory
    Keys,
}

/// Reads answers from standard input.
struct StdinPrompt;

fn read_line(question: &str) -> Result<Option<String>> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{question}")?;
    stderr.flush()?;

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    Ok((!line.is_empty()).then(|| line.to_string()))
}

impl PassphrasePrompt for StdinPrompt {
    fn passphrase(&self, alias: &str) -> Result<Option<String>> {
        read_line(&format!("Signing password for {alias}: "))
    }
}

fn ask_version(version: Option<String>) -> Result<String> {
    if let Some(version) = version {
        return Ok(version);
    }
    eprintln!("Enter the version of this release.  It must be exactly the tag the release gets.");
    read_line("Release version: ")?.context("No release version given")
}

fn print_signed(signed: &SignedRelease) {
    println!("Signed new release:");
    println!();
    println!("    Version: {} v{}", signed.package, signed.release.version);
    println!("    Merkle Root: {}", signed.root());
    println!("    Partial Signature: {}", signed.signature_prefix());
    println!();
}

fn choose_remote(git: &Git, config: &Config, remote: Option<String>) -> Result<String> {
    let remotes = git.remotes(&config.root)?;
    if let Some(remote) = remote {
        if !remotes.contains(&remote) {
            bail!("No git remote named {remote}");
        }
        return Ok(remote);
    }

    match remotes.as_slice() {
        [] => bail!("No git remotes are configured; add one with 'git remote add <ALIAS> <URL>'"),
        [only] => Ok(only.clone()),
        _ => {
            for (n, remote) in remotes.iter().enumerate() {
                eprintln!("    [{}] {remote}", n + 1);
            }
            let answer = read_line("Select remote to publish to: ")?.unwrap_or_default();
            answer
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|n| remotes.get(n.wrapping_sub(1)))
                .cloned()
                .with_context(|| format!("Invalid remote selection {answer:?}"))
        }
    }
}

fn print_report(report: &VerificationReport, show_skipped: bool) {
    let mut failures = String::new();

    println!("Verification Result");
    println!();
    for package in report.packages() {
        let status = match package.outcome {
            VerificationOutcome::Skipped => {
                if show_skipped {
                    println!("    {} was skipped.", package.name);
                }
                continue;
            }
            VerificationOutcome::Ok => "verified".to_string(),
            outcome => {
                failures.push_str(&format!(
                    "    {} - {}\n",
                    package.name,
                    outcome.description().unwrap_or_default()
                ));
                if outcome == VerificationOutcome::MerkleMismatch {
                    for file in report.file_mismatches(&package.name) {
                        failures.push_str(&format!("        {file}\n"));
                    }
                    failures.push('\n');
                }
                format!("failed ({outcome})")
            }
        };
        let version = if package.version == LATEST {
            LATEST.to_string()
        } else {
            format!("v{}", package.version)
        };
        let note = if package.inventory_current {
            ""
        } else {
            " [root chain only]"
        };
        println!(
            "    {} {version} ({} files)... {status}{note}",
            package.name, package.num_files
        );
    }
    println!();

    if report.total_failed() > 0 {
        println!("{} Failures", report.total_failed());
        println!();
        println!("{failures}");
    }

    if !show_skipped && report.total_skipped() > 0 {
        println!("NOTE: Use the '--skipped' option to list packages without signatures.");
        println!();
    }
    println!(
        "{} verified, {} skipped, {} failures.",
        report.total_ok(),
        report.total_skipped(),
        report.total_failed()
    );
}

fn run(args: App) -> Result<ExitCode> {
    let trust_dir = match args.trust_dir {
        Some(dir) => dir,
        None => Config::default_trust_dir().context("Unable to determine a configuration directory")?,
    };
    let config = Config::load(&args.root, &trust_dir)?;
    let ledger = HttpLedger::new(&config.ledger)?;
    let git = Git;

    match args.cmd {
        Command::Init => {
            if !config.root.join(PACKAGE_MANIFEST).is_file() {
                bail!("No {PACKAGE_MANIFEST} in {}; run from the package root", config.root.display());
            }
            if !config.root.join(".git").is_dir() {
                bail!("{} is not a git repository; run 'git init' first", config.root.display());
            }
            let store = SigningEngine::new(&config, &git, &ledger, &StdinPrompt).initialize()?;
            println!("Initialized {}", store.path().display());
            println!("Sign releases with: signer sign <VERSION>");
        }
        Command::Sign { version, password } => {
            let version = ask_version(version)?;
            let signed = SigningEngine::new(&config, &git, &ledger, &StdinPrompt)
                .sign(&version, password.as_deref())?;
            print_signed(&signed);
            println!("Add {MANIFEST_FILE} to your next commit and tag the release as {version}.");
        }
        Command::Release {
            version,
            password,
            message,
            file,
            remote,
        } => {
            let version = ask_version(version)?;
            let message = match (message, file) {
                (Some(message), _) => CommitMessage::Inline(message),
                (None, Some(file)) => CommitMessage::File(file),
                (None, None) => bail!("No commit message given; use -m or --file"),
            };
            let branch = git
                .current_branch(&config.root)?
                .context("Unable to determine the current git branch")?;
            let remote = choose_remote(&git, &config, remote)?;

            let signed = SigningEngine::new(&config, &git, &ledger, &StdinPrompt)
                .sign(&version, password.as_deref())?;
            git.publish(&config.root, &remote, &branch, &message, &version)?;
            print_signed(&signed);
        }
        Command::Verify { skipped } => {
            let report = VerificationEngine::new(&config, &ledger).verify()?;
            print_report(&report, skipped);
            if report.total_failed() > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Keys => {
            for alias in config.trust_store().list_keys()? {
                println!("{alias}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    run(App::parse())
}
