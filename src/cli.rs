use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// rewind: mark and roll back groups of tracked tables
#[derive(Parser, Debug)]
#[command(name = "rewind", version, about = "Set marks on table groups and roll them back to any mark.", long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Workspace directory (defaults to the nearest .rewind above the current directory)
    #[arg(short = 'w', long = "workspace", global = true)]
    pub workspace: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a .rewind workspace in the given (or current) directory
    Init {
        /// Directory to initialize
        target: Option<PathBuf>,
    },

    /// Set a mark on one or more groups
    SetMark {
        /// Groups to mark
        #[arg(required = true, num_args = 1..)]
        groups: Vec<String>,
        /// Mark name; '%' is replaced by the current time
        #[arg(short = 'n', long = "name")]
        name: Option<String>,
    },

    /// Rename a mark
    RenameMark {
        group: String,
        mark: String,
        new_name: String,
    },

    /// Delete a mark
    DeleteMark { group: String, mark: String },

    /// Delete every mark older than the given one
    DeleteMarksBefore { group: String, mark: String },

    /// Set or clear the comment of a mark
    CommentMark {
        group: String,
        mark: String,
        /// Comment text; omit to clear it
        comment: Option<String>,
    },

    /// Forbid rollbacks beyond a mark
    Protect { group: String, mark: String },

    /// Allow rollbacks beyond a mark again
    Unprotect { group: String, mark: String },

    /// Show the mark preceding a mark or a point in time
    PreviousMark {
        group: String,
        #[arg(required_unless_present = "at")]
        mark: Option<String>,
        /// Point in time, e.g. "2026-10-18 14:05:00"
        #[arg(long, conflicts_with = "mark")]
        at: Option<String>,
    },

    /// List the marks of a group
    Marks { group: String },

    /// Roll groups back to a mark
    Rollback {
        /// Groups to roll back
        #[arg(required = true, num_args = 1..)]
        groups: Vec<String>,
        /// Target mark (EMAJ_LAST_MARK for the latest)
        #[arg(short = 'm', long = "mark")]
        mark: String,
        /// Keep the undone changes in the log
        #[arg(long)]
        logged: bool,
        /// Number of parallel sessions
        #[arg(short = 's', long = "sessions")]
        sessions: Option<usize>,
        /// Write the statements to a file instead of applying them
        #[arg(long, value_name = "path", conflicts_with = "logged")]
        script: Option<PathBuf>,
    },

    /// Estimate the duration of a rollback
    Estimate {
        #[arg(required = true, num_args = 1..)]
        groups: Vec<String>,
        #[arg(short = 'm', long = "mark")]
        mark: String,
        #[arg(long)]
        logged: bool,
        #[arg(short = 's', long = "sessions")]
        sessions: Option<usize>,
    },

    /// Show rollbacks in progress or awaiting cleanup
    Activity,

    /// Clean up failed and abandoned rollbacks
    Cleanup,

    /// Collapse consecutive logged rollbacks to a mark
    Consolidate { group: String, mark: String },

    /// Check catalog and log consistency
    Verify,

    /// Count log rows per table between two marks
    LogStat {
        group: String,
        /// Start mark (defaults to the oldest mark)
        #[arg(long)]
        from: Option<String>,
        /// End mark (defaults to now)
        #[arg(long)]
        to: Option<String>,
    },

    /// Print CLI version
    Version,
}
