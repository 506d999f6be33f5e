//! The `status` command: a read-only queue summary.
//!
//! Enumerates the handoff directories without taking any lock — the
//! layout is designed so uncoordinated readers see only complete files.

use std::path::Path;

use anyhow::Result;

use crucible::config::CrucibleConfig;
use crucible::locks::WORKER_LOCK_FILE;
use crucible::model::LockRecord;
use crucible::queue::HandoffDir;

pub fn run(repo: &Path) -> Result<()> {
    let config = CrucibleConfig::load(repo)?;
    let handoff = HandoffDir::new(repo.join(&config.queue.root));

    if !handoff.root().exists() {
        println!("no handoff directory at {}", handoff.root().display());
        return Ok(());
    }

    println!("handoff root: {}", handoff.root().display());

    match read_worker_lock(&handoff) {
        Some(holder) => println!(
            "worker: pid {} on {} (since {})",
            holder.pid, holder.host, holder.created_at
        ),
        None => println!("worker: none"),
    }

    for (label, dir, ext) in [
        ("queued", handoff.tasks_dir(), "json"),
        ("running", handoff.running_dir(), "json"),
        ("results", handoff.results_dir(), "json"),
        ("patches", handoff.patches_dir(), "patch"),
    ] {
        let ids = list_ids(&dir, ext);
        print!("{label:>8}: {}", ids.len());
        if !ids.is_empty() {
            print!("  [{}]", ids.join(", "));
        }
        println!();
    }

    // A file in running/ with no live worker means a crashed run; its
    // result (if any) decides whether it will be re-claimed.
    let orphans = list_ids(&handoff.running_dir(), "json");
    if !orphans.is_empty() && read_worker_lock(&handoff).is_none() {
        println!("warning: tasks in running/ with no live worker: {}", orphans.join(", "));
    }

    Ok(())
}

fn read_worker_lock(handoff: &HandoffDir) -> Option<LockRecord> {
    let bytes = std::fs::read(handoff.locks_dir().join(WORKER_LOCK_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn list_ids(dir: &Path, ext: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ids: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_owned))
        .collect();
    ids.sort();
    ids
}
