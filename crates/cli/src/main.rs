//! subsync command-line tool.
//!
//! Inspects and updates the subrepos of a git parent repository: showing
//! their declared and recorded state, reconciling them after a parent merge
//! or update, and committing, pushing or archiving all of them at once.

mod style;
mod terminal;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use subsync_core::archive::DirectorySink;
use subsync_core::exec::ProcessExecutor;
use subsync_core::native::{Git2Provider, Git2Repository, RepositoryAccess};
use subsync_core::propagate::{archive_all, commit_all, iter_subrepos, merge_and_record, push_all};
use subsync_core::snapshot::WorkingDir;
use subsync_core::source::ParentRef;
use subsync_core::state::resolve;
use subsync_core::ui::{Diagnostics, NonInteractive, Prompt};
use subsync_core::{Collaborators, RepoContext, SubrepoState, SubsyncConfig};

use terminal::{CliDiagnostics, DialoguerPrompt};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// subsync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "subsync",
    version,
    about = "Track and reconcile the subrepos of a parent repository"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: ~/.config/subsync/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root of the parent repository.
    #[arg(short = 'R', long, global = true, default_value = ".")]
    repository: PathBuf,

    /// Answer every prompt with its default.
    #[arg(short = 'y', long, global = true)]
    noninteractive: bool,

    /// Suppress status output.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show verbose notes.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the subrepo state of the working directory or a revision.
    State {
        /// Parent revision to read instead of the working directory.
        #[arg(short, long)]
        rev: Option<String>,
    },

    /// Show which subrepos have uncommitted changes.
    Status,

    /// Show the changes of one subrepo since its recorded revision.
    Diff {
        /// Subrepo path.
        path: String,
    },

    /// Commit every dirty subrepo and record the new revisions.
    Commit {
        /// Commit message.
        #[arg(short, long)]
        message: String,

        /// Author, `Name <email>` (defaults to `ui.username`).
        #[arg(short, long)]
        user: Option<String>,

        /// Commit date, RFC 3339.
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Reconcile subrepos after merging a parent revision.
    Merge {
        /// Parent revision being merged into the working directory.
        rev: String,
    },

    /// Bring subrepos in line with a parent revision.
    Update {
        /// Parent revision to update to.
        #[arg(default_value = "HEAD")]
        rev: String,

        /// Discard local subrepo changes.
        #[arg(short = 'C', long)]
        clean: bool,
    },

    /// Push every subrepo, depth first.
    Push {
        #[arg(short, long)]
        force: bool,
    },

    /// Write the content of every subrepo below a directory.
    Archive {
        /// Destination directory.
        dest: PathBuf,

        /// Path prefix inside the destination.
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./subsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: SubsyncConfig) -> Result<()> {
    match cli.command {
        Commands::Init { ref output } => return cmd_init(output),
        Commands::Validate => return cmd_validate(cli.config.as_deref()),
        _ => {}
    }

    let session = Session::open(&cli, config)?;
    match cli.command {
        Commands::State { rev } => session.cmd_state(rev.as_deref()),
        Commands::Status => session.cmd_status(),
        Commands::Diff { path } => session.cmd_diff(&path),
        Commands::Commit { message, user, date } => {
            session.cmd_commit(&message, user.as_deref(), date.as_deref())
        }
        Commands::Merge { rev } => session.cmd_merge(&rev),
        Commands::Update { rev, clean } => session.cmd_update(&rev, clean),
        Commands::Push { force } => session.cmd_push(force),
        Commands::Archive { dest, prefix } => session.cmd_archive(&dest, &prefix),
        Commands::Init { .. } | Commands::Validate => unreachable!(),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("subsync").join("config.toml"))
}

/// Load the configuration. An explicit path must exist; a missing file at
/// the default location means built-in defaults.
fn load_config(path: Option<&Path>) -> Result<SubsyncConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(SubsyncConfig::default()),
        },
    };
    SubsyncConfig::load_and_validate(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything a repository command needs: the parent repository, its
/// configuration and the terminal collaborators.
struct Session {
    config: SubsyncConfig,
    parent: ParentRef,
    repo: Git2Repository,
    prompt: Box<dyn Prompt>,
    diag: CliDiagnostics,
}

impl Session {
    fn open(cli: &Cli, config: SubsyncConfig) -> Result<Self> {
        let root = std::fs::canonicalize(&cli.repository)
            .with_context(|| format!("repository not found: {}", cli.repository.display()))?;
        let repo = Git2Repository::open(&root).context("failed to open parent repository")?;

        let default_path = config.paths.default.clone().or_else(|| repo.remote_url(false));
        let default_push_path = config
            .paths
            .default_push
            .clone()
            .or_else(|| repo.remote_url(true));
        debug!(root = %root.display(), ?default_path, ?default_push_path, "opened parent");

        let interactive = config.ui.interactive && !cli.noninteractive && console::user_attended();
        let prompt: Box<dyn Prompt> = if interactive {
            Box::new(DialoguerPrompt)
        } else {
            Box::new(NonInteractive)
        };
        let diag = CliDiagnostics::new(cli.quiet || config.ui.quiet, cli.verbose);

        Ok(Self {
            parent: ParentRef::top(root, default_path, default_push_path),
            config,
            repo,
            prompt,
            diag,
        })
    }

    fn collab(&self) -> Collaborators<'_> {
        Collaborators {
            exec: &ProcessExecutor,
            repos: &Git2Provider,
            prompt: self.prompt.as_ref(),
            diag: &self.diag,
            rules: &self.config.subpaths,
        }
    }

    /// Subrepo state of the working directory.
    fn working_state(&self) -> Result<SubrepoState> {
        resolve(
            &WorkingDir::new(&self.parent.root),
            &self.config.subpaths,
            &self.diag,
        )
        .context("failed to read subrepo state of the working directory")
    }

    /// Subrepo state committed in parent revision `rev`. The null revision
    /// (no common ancestor) has no subrepos.
    fn state_at(&self, rev: &str) -> Result<SubrepoState> {
        if rev.is_empty() {
            return Ok(SubrepoState::new());
        }
        let snapshot = self
            .repo
            .snapshot(rev)
            .with_context(|| format!("unknown parent revision '{}'", rev))?;
        resolve(snapshot.as_ref(), &self.config.subpaths, &self.diag)
            .with_context(|| format!("failed to read subrepo state of revision '{}'", rev))
    }

    fn local_context(&self) -> Result<RepoContext> {
        Ok(RepoContext::new(self.parent.clone(), self.working_state()?))
    }

    // -----------------------------------------------------------------------
    // Subcommand implementations
    // -----------------------------------------------------------------------

    fn cmd_state(&self, rev: Option<&str>) -> Result<()> {
        let state = match rev {
            Some(rev) => self.state_at(rev)?,
            None => self.working_state()?,
        };
        if state.is_empty() {
            println!("No subrepos declared.");
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Path", "Kind", "Source", "Revision"]);
        for (path, pointer) in &state {
            let revision = if pointer.is_null_revision() {
                "(none)".to_string()
            } else {
                pointer.revision.clone()
            };
            table.add_row(vec![
                Cell::new(path),
                Cell::new(style::kind(&pointer.kind)),
                Cell::new(&pointer.source),
                Cell::new(revision),
            ]);
        }
        println!("{}", table);
        Ok(())
    }

    fn cmd_status(&self) -> Result<()> {
        let ctx = self.local_context()?;
        if ctx.state.is_empty() {
            println!("No subrepos declared.");
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Path", "Kind", "State", "M", "A", "R"]);
        for item in iter_subrepos(&ctx, &ctx, self.collab()) {
            let (path, sub) = item?;
            let dirty = sub
                .dirty(false)
                .with_context(|| format!("failed to check subrepo {}", path))?;
            let status = sub
                .status(None)
                .with_context(|| format!("failed to read status of subrepo {}", path))?;
            table.add_row(vec![
                Cell::new(&path),
                Cell::new(style::kind(sub.kind().as_str())),
                Cell::new(style::dirty(dirty)),
                Cell::new(status.modified.len()),
                Cell::new(status.added.len()),
                Cell::new(status.removed.len()),
            ]);
        }
        println!("{}", table);
        Ok(())
    }

    fn cmd_diff(&self, path: &str) -> Result<()> {
        let ctx = self.local_context()?;
        if !ctx.state.contains_key(path) {
            anyhow::bail!("no subrepo at '{}'", path);
        }
        let sub = ctx.sub(path, self.collab())?;
        print!("{}", sub.diff(None).with_context(|| format!("failed to diff subrepo {}", path))?);
        Ok(())
    }

    fn cmd_commit(&self, message: &str, user: Option<&str>, date: Option<&str>) -> Result<()> {
        let date: Option<DateTime<FixedOffset>> = date
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .context("invalid commit date, expected RFC 3339")?;
        let user = user.or(self.config.ui.username.as_deref());

        let ctx = self.local_context()?;
        let before = ctx.state.clone();
        let recorded = commit_all(&ctx, message, user, date, self.collab())?;

        let changed: Vec<_> = recorded
            .iter()
            .filter(|(path, p)| before.get(*path).map(|b| &b.revision) != Some(&p.revision))
            .collect();
        if changed.is_empty() {
            println!("{}", style::dim("No subrepo changes to commit"));
        }
        for (path, pointer) in changed {
            println!(
                "{}",
                style::success(&format!("{} committed at {}", path, pointer.revision))
            );
        }
        Ok(())
    }

    fn cmd_merge(&self, rev: &str) -> Result<()> {
        let head = self.repo.working_parent()?;
        let ancestor = self
            .repo
            .ancestor(&head, rev)
            .with_context(|| format!("failed to find common ancestor with '{}'", rev))?;
        info!(head = %head, rev, ancestor = %ancestor, "merging subrepo state");
        self.reconcile_with(rev, &ancestor, false)
    }

    fn cmd_update(&self, rev: &str, clean: bool) -> Result<()> {
        let head = self.repo.working_parent()?;
        self.reconcile_with(rev, &head, clean)
    }

    fn reconcile_with(&self, rev: &str, ancestor_rev: &str, overwrite_local: bool) -> Result<()> {
        let local = self.local_context()?;
        let remote = self.state_at(rev)?;
        let ancestor = self.state_at(ancestor_rev)?;

        let merged = merge_and_record(&local, &remote, &ancestor, overwrite_local, self.collab())
            .context("subrepo reconciliation failed, state file left unchanged")?;
        println!(
            "{}",
            style::success(&format!("Recorded {} subrepo(s)", merged.len()))
        );
        Ok(())
    }

    fn cmd_push(&self, force: bool) -> Result<()> {
        let ctx = self.local_context()?;
        if push_all(&ctx, force, self.collab())? {
            println!("{}", style::success("All subrepos pushed"));
            Ok(())
        } else {
            anyhow::bail!("push stopped: a subrepo push failed")
        }
    }

    fn cmd_archive(&self, dest: &Path, prefix: &str) -> Result<()> {
        if dest.exists() && dest.read_dir()?.next().is_some() {
            anyhow::bail!("destination is not empty: {}", dest.display());
        }
        let ctx = self.local_context()?;
        let mut sink = DirectorySink::new(dest);
        let written = archive_all(&ctx, &mut sink, prefix, self.collab())?;
        self.diag.progress("archiving", None, None);
        println!(
            "{}",
            style::success(&format!("Archived {} file(s) to {}", written, dest.display()))
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration subcommands
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# subsync configuration

[paths]
# Pull / push locations of the parent repository. Relative subrepo sources
# are resolved against these; the parent's `origin` remote is used when unset.
# default = "https://example.com/parent"
# default_push = "ssh://example.com/parent"

# Remap rules applied to every declared subrepo source, in order.
# [[subpaths]]
# pattern = "^https://old.example.com/(.*)$"
# replacement = "https://new.example.com/\\1"

[ui]
interactive = true
quiet = false
# username = "Jane Doe <jane@example.com>"

[logging]
level = "warn"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your parent repository locations");
    println!("  2. Validate with: subsync validate --config {}", output.display());
    if let Some(default) = default_config_path() {
        println!("  3. Move it to {} to use it by default", default.display());
    }

    Ok(())
}

fn cmd_validate(path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()
            .ok_or_else(|| anyhow::anyhow!("no configuration directory on this platform"))?,
    };
    println!("Validating configuration: {}", path.display());
    println!();

    let config = SubsyncConfig::load_from_file(&path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!(
        "  Default path  : {}",
        config.paths.default.as_deref().unwrap_or("(origin remote)")
    );
    println!(
        "  Push path     : {}",
        config
            .paths
            .default_push
            .as_deref()
            .or(config.paths.default.as_deref())
            .unwrap_or("(origin remote)")
    );
    println!("  Remap rules   : {}", config.subpaths.len());
    println!("  Interactive   : {}", config.ui.interactive);
    println!(
        "  Username      : {}",
        config.ui.username.as_deref().unwrap_or("not set")
    );
    println!("  Log level     : {}", config.logging.level);
    println!();
    println!("Configuration is valid.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_merge_command() {
        let cli = Cli::try_parse_from(["subsync", "-R", "/tmp/top", "-y", "merge", "feature"]).unwrap();
        assert!(cli.noninteractive);
        assert_eq!(cli.repository, PathBuf::from("/tmp/top"));
        assert!(matches!(cli.command, Commands::Merge { ref rev } if rev == "feature"));
    }

    #[test]
    fn test_update_defaults_to_head() {
        let cli = Cli::try_parse_from(["subsync", "update"]).unwrap();
        assert!(matches!(cli.command, Commands::Update { ref rev, clean: false } if rev == "HEAD"));
    }

    #[test]
    fn test_commit_requires_message() {
        assert!(Cli::try_parse_from(["subsync", "commit"]).is_err());
    }

    #[test]
    fn test_init_writes_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subsync.toml");
        cmd_init(&path).unwrap();
        let config = SubsyncConfig::load_and_validate(&path).unwrap();
        assert_eq!(config, SubsyncConfig::default());
        assert!(cmd_init(&path).is_err());
    }

    #[test]
    fn test_null_revision_has_no_subrepos() {
        let dir = tempfile::tempdir().unwrap();
        Git2Repository::create(dir.path(), &subsync_core::native::DefaultPaths::default()).unwrap();
        std::fs::write(dir.path().join(".subrepos"), "lib = ../lib\n").unwrap();
        let repo = dir.path().display().to_string();
        let cli = Cli::try_parse_from(["subsync", "-R", repo.as_str(), "-y", "merge", "other"]).unwrap();

        let session = Session::open(&cli, SubsyncConfig::default()).unwrap();
        assert!(session.state_at("").unwrap().is_empty());
        assert_eq!(session.working_state().unwrap().len(), 1);
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/subsync.toml"))).is_err());
    }
}
