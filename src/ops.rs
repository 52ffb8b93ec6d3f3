use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDateTime, TimeZone};
use colored::*;
use comfy_table::{Attribute, Cell, ContentArrangement, Table, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressStyle};

use rewind::config::catalog::MarkRef;
use rewind::engine::Engine;
use rewind::marks::MarkPoint;
use rewind::rollback::{RollbackOptions, RollbackProgress};
use rewind::storage::{WORKSPACE_DIR, Workspace};

fn open_engine(workspace: &Option<PathBuf>) -> Result<Engine> {
    let ws = match workspace {
        Some(dir) => {
            if !dir.join(WORKSPACE_DIR).is_dir() {
                return Err(anyhow!("no {} in {}", WORKSPACE_DIR, dir.display()));
            }
            Workspace::at(dir)
        }
        None => Workspace::find_from(&std::env::current_dir()?)?,
    };
    Ok(Engine::open(ws)?)
}

fn success(message: String) {
    println!("{} {}", "✔".green().bold(), message.green());
}

fn info(message: &str) {
    println!("{} {}", "i".yellow().bold(), message.yellow());
}

fn warn(message: String) {
    eprintln!("{} {}: {}", "!".yellow().bold(), "Warning".yellow(), message);
}

fn as_strs(groups: &[String]) -> Vec<&str> {
    groups.iter().map(String::as_str).collect()
}

pub fn do_init(target: Option<PathBuf>) -> Result<()> {
    let root = match target {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    if root.join(WORKSPACE_DIR).exists() {
        info(&format!("Using existing {} at {}", WORKSPACE_DIR, root.display()));
        return Ok(());
    }
    std::fs::create_dir_all(&root)?;
    Workspace::init_at(&root)?;
    success(format!("Initialized {} at {}", WORKSPACE_DIR, root.display()));
    Ok(())
}

pub fn do_set_mark(workspace: &Option<PathBuf>, groups: &[String], name: Option<String>) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    let set = engine.set_mark(&as_strs(groups), name.as_deref())?;
    success(format!(
        "Mark '{}' set on {} group(s) at global sequence {}",
        set.name,
        set.ids.len(),
        set.global_seq
    ));
    Ok(())
}

pub fn do_rename_mark(workspace: &Option<PathBuf>, group: &str, mark: &str, new_name: &str) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    engine.rename_mark(group, &MarkRef::parse(mark), new_name)?;
    println!("{} {} -> {}", "✔".green().bold(), mark.green(), new_name.green());
    Ok(())
}

pub fn do_delete_mark(workspace: &Option<PathBuf>, group: &str, mark: &str) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    engine.delete_mark(group, &MarkRef::parse(mark))?;
    success(format!("Deleted mark '{}' of group '{}'", mark, group));
    Ok(())
}

pub fn do_delete_marks_before(workspace: &Option<PathBuf>, group: &str, mark: &str) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    let deleted = engine.delete_marks_before(group, &MarkRef::parse(mark))?;
    if deleted == 0 {
        info(&format!("No mark older than '{}'", mark));
    } else {
        success(format!("Deleted {} mark(s) older than '{}'", deleted, mark));
    }
    Ok(())
}

pub fn do_comment_mark(
    workspace: &Option<PathBuf>,
    group: &str,
    mark: &str,
    comment: Option<String>,
) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    engine.comment_mark(group, &MarkRef::parse(mark), comment.as_deref())?;
    match comment {
        Some(_) => success(format!("Comment set on mark '{}'", mark)),
        None => success(format!("Comment cleared on mark '{}'", mark)),
    }
    Ok(())
}

pub fn do_protect(workspace: &Option<PathBuf>, group: &str, mark: &str, protect: bool) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    let mark_ref = MarkRef::parse(mark);
    if protect {
        engine.protect_mark(group, &mark_ref)?;
        success(format!("Mark '{}' protected", mark));
    } else {
        engine.unprotect_mark(group, &mark_ref)?;
        success(format!("Mark '{}' unprotected", mark));
    }
    Ok(())
}

fn parse_time(text: &str) -> Result<chrono::DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("invalid time '{}', expected YYYY-MM-DD HH:MM:SS", text))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| anyhow!("time '{}' does not exist in the local time zone", text))
}

pub fn do_previous_mark(
    workspace: &Option<PathBuf>,
    group: &str,
    mark: Option<String>,
    at: Option<String>,
) -> Result<()> {
    let engine = open_engine(workspace)?;
    let point = match (mark, at) {
        (_, Some(at)) => MarkPoint::Time(parse_time(&at)?),
        (Some(mark), None) => MarkPoint::Mark(MarkRef::parse(&mark)),
        (None, None) => return Err(anyhow!("a mark or --at is required")),
    };
    match engine.previous_mark(group, &point)? {
        Some(mark) => println!(
            "{} {} ({})",
            "✔".green().bold(),
            mark.name.green(),
            mark.created_at.format("%Y-%m-%d %H:%M:%S%.3f")
        ),
        None => info("No previous mark"),
    }
    Ok(())
}

pub fn do_marks(workspace: &Option<PathBuf>, group: &str) -> Result<()> {
    let engine = open_engine(workspace)?;
    let marks = engine.list_marks(group)?;
    if marks.is_empty() {
        info("No marks found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").add_attribute(Attribute::Bold),
            Cell::new("Timestamp").add_attribute(Attribute::Bold),
            Cell::new("Global seq").add_attribute(Attribute::Bold),
            Cell::new("Protected").add_attribute(Attribute::Bold),
            Cell::new("Log rows").add_attribute(Attribute::Bold),
            Cell::new("Comment").add_attribute(Attribute::Bold),
        ]);
    for summary in &marks {
        let mark = &summary.mark;
        table.add_row(vec![
            Cell::new(&mark.name),
            Cell::new(mark.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
            Cell::new(mark.global_seq),
            Cell::new(if mark.protected { "yes" } else { "no" }),
            Cell::new(summary.log_rows_before_next),
            Cell::new(mark.comment.as_deref().unwrap_or("")),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub fn do_rollback(
    workspace: &Option<PathBuf>,
    groups: &[String],
    mark: &str,
    logged: bool,
    sessions: Option<usize>,
    script: Option<PathBuf>,
) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    let target = MarkRef::parse(mark);

    if let Some(path) = script {
        let written = engine.export_rollback_script(&as_strs(groups), &target, &path)?;
        success(format!("{} statement(s) written to {}", written, path.display()));
        return Ok(());
    }

    let bar = create_progress_bar("Planning rollback");
    let progress = bar.clone();
    let options = RollbackOptions {
        sessions,
        progress: Some(Box::new(move |p: &RollbackProgress| {
            let pct = if p.estimated_micros == 0 {
                0.0
            } else {
                (p.done_micros as f64 / p.estimated_micros as f64 * 100.0).min(100.0)
            };
            match &p.relation {
                Some(relation) => progress.set_message(format!("{} {:>5.1}% {}", p.status.label(), pct, relation)),
                None => progress.set_message(p.status.label().to_string()),
            }
        })),
        ..RollbackOptions::default()
    };

    match engine.rollback(&as_strs(groups), &target, logged, options) {
        Ok(outcome) => {
            bar.finish_with_message("Rollback complete");
            success(format!(
                "Request {}: {} table(s) and {} sequence(s) rolled back to '{}' ({} row(s), {} session(s), {:.2?})",
                outcome.request,
                outcome.tables,
                outcome.sequences,
                mark,
                outcome.unwound_rows,
                outcome.sessions,
                outcome.elapsed
            ));
            if let (Some(start), Some(done)) = (&outcome.start_mark, &outcome.done_mark) {
                info(&format!("Logged rollback delimited by marks '{}' and '{}'", start, done));
            }
            Ok(())
        }
        Err(err) => {
            bar.abandon_with_message("Rollback failed");
            Err(err.into())
        }
    }
}

pub fn do_estimate(
    workspace: &Option<PathBuf>,
    groups: &[String],
    mark: &str,
    logged: bool,
    sessions: Option<usize>,
) -> Result<()> {
    let engine = open_engine(workspace)?;
    let estimate = engine.estimate_rollback(&as_strs(groups), &MarkRef::parse(mark), logged, sessions)?;
    println!(
        "{} {} table(s), {} sequence(s), {} row(s) over {} session(s): about {:.2?}",
        "i".yellow().bold(),
        estimate.tables,
        estimate.sequences,
        estimate.rows,
        estimate.sessions,
        estimate.estimated
    );
    let basis = if estimate.calibrated {
        "calibrated from previous rollbacks"
    } else {
        "from configured cost constants"
    };
    info(&format!("Advisory only, {}; concurrent load is not accounted for", basis));
    Ok(())
}

pub fn do_activity(workspace: &Option<PathBuf>) -> Result<()> {
    let engine = open_engine(workspace)?;
    let activity = engine.get_rollback_activity();
    if activity.is_empty() {
        info("No rollback in progress");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Request").add_attribute(Attribute::Bold),
            Cell::new("Groups").add_attribute(Attribute::Bold),
            Cell::new("Mark").add_attribute(Attribute::Bold),
            Cell::new("Logged").add_attribute(Attribute::Bold),
            Cell::new("Sessions").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
            Cell::new("Started").add_attribute(Attribute::Bold),
            Cell::new("Elapsed").add_attribute(Attribute::Bold),
            Cell::new("Remaining").add_attribute(Attribute::Bold),
            Cell::new("Done").add_attribute(Attribute::Bold),
        ]);
    for a in &activity {
        table.add_row(vec![
            Cell::new(a.request),
            Cell::new(a.groups.join(", ")),
            Cell::new(&a.target_mark),
            Cell::new(if a.logged { "yes" } else { "no" }),
            Cell::new(a.sessions),
            Cell::new(a.status.label()),
            Cell::new(a.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format!("{:.1?}", a.elapsed)),
            Cell::new(a.remaining.map(|r| format!("{:.1?}", r)).unwrap_or_default()),
            Cell::new(format!("{:.1}%", a.completion_pct)),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub fn do_cleanup(workspace: &Option<PathBuf>) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    match engine.cleanup_rollback_state()? {
        0 => info("Nothing to clean up"),
        n => success(format!("Cleaned up {} rollback request(s)", n)),
    }
    Ok(())
}

pub fn do_consolidate(workspace: &Option<PathBuf>, group: &str, mark: &str) -> Result<()> {
    let mut engine = open_engine(workspace)?;
    let report = engine.consolidate_rollback(group, &MarkRef::parse(mark))?;
    success(format!(
        "Consolidated {} rollback(s) of '{}' between '{}' and '{}': {} row(s) reclaimed, {} log record(s) purged, {} mark(s) deleted",
        report.requests.len(),
        group,
        report.target_mark,
        report.end_mark,
        report.reclaimed_rows,
        report.purged_records,
        report.marks_deleted
    ));
    Ok(())
}

pub fn do_verify(workspace: &Option<PathBuf>) -> Result<()> {
    let engine = open_engine(workspace)?;
    let violations = engine.verify_all()?;
    if violations.is_empty() {
        success("No error detected".to_string());
        return Ok(());
    }
    for violation in &violations {
        warn(violation.to_string());
    }
    Err(anyhow!("{} consistency violation(s) found", violations.len()))
}

pub fn do_log_stat(
    workspace: &Option<PathBuf>,
    group: &str,
    from: Option<String>,
    to: Option<String>,
) -> Result<()> {
    let engine = open_engine(workspace)?;
    let from = from.as_deref().map(MarkRef::parse);
    let to = to.as_deref().map(MarkRef::parse);
    let stats = engine.log_stat(group, from.as_ref(), to.as_ref())?;
    if stats.is_empty() {
        info("No tracked table");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Table", "From", "To", "Rows"]);
    for stat in &stats {
        table.add_row(vec![
            stat.relation.clone(),
            stat.from_mark.clone().unwrap_or_else(|| "(start)".into()),
            stat.to_mark.clone().unwrap_or_else(|| "(now)".into()),
            stat.rows.to_string(),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub fn do_version() {
    println!("{} {}", "rewind".bold(), env!("CARGO_PKG_VERSION").cyan());
}

fn create_progress_bar(prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        bar.set_style(style.tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "));
    }
    bar.set_message(prefix.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

