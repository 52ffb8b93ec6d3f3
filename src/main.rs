mod cli;
mod ops;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

fn main() {
    rewind::logging::init();
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let ws = &cli.workspace;

    match cli.command {
        Commands::Init { target } => {
            ops::do_init(target)?;
        }
        Commands::SetMark { groups, name } => {
            ops::do_set_mark(ws, &groups, name)?;
        }
        Commands::RenameMark {
            group,
            mark,
            new_name,
        } => {
            ops::do_rename_mark(ws, &group, &mark, &new_name)?;
        }
        Commands::DeleteMark { group, mark } => {
            ops::do_delete_mark(ws, &group, &mark)?;
        }
        Commands::DeleteMarksBefore { group, mark } => {
            ops::do_delete_marks_before(ws, &group, &mark)?;
        }
        Commands::CommentMark {
            group,
            mark,
            comment,
        } => {
            ops::do_comment_mark(ws, &group, &mark, comment)?;
        }
        Commands::Protect { group, mark } => {
            ops::do_protect(ws, &group, &mark, true)?;
        }
        Commands::Unprotect { group, mark } => {
            ops::do_protect(ws, &group, &mark, false)?;
        }
        Commands::PreviousMark { group, mark, at } => {
            ops::do_previous_mark(ws, &group, mark, at)?;
        }
        Commands::Marks { group } => {
            ops::do_marks(ws, &group)?;
        }
        Commands::Rollback {
            groups,
            mark,
            logged,
            sessions,
            script,
        } => {
            ops::do_rollback(ws, &groups, &mark, logged, sessions, script)?;
        }
        Commands::Estimate {
            groups,
            mark,
            logged,
            sessions,
        } => {
            ops::do_estimate(ws, &groups, &mark, logged, sessions)?;
        }
        Commands::Activity => {
            ops::do_activity(ws)?;
        }
        Commands::Cleanup => {
            ops::do_cleanup(ws)?;
        }
        Commands::Consolidate { group, mark } => {
            ops::do_consolidate(ws, &group, &mark)?;
        }
        Commands::Verify => {
            ops::do_verify(ws)?;
        }
        Commands::LogStat { group, from, to } => {
            ops::do_log_stat(ws, &group, from, to)?;
        }
        Commands::Version => {
            ops::do_version();
        }
    }

    Ok(())
}
