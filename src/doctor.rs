//! The `doctor` command: pre-flight checks, standalone.
//!
//! Runs the same checks the worker performs before accepting tasks, plus
//! a few environment sanity checks, and reports each as a pass/fail
//! line. Exits non-zero when a required check fails.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crucible::config::CrucibleConfig;
use crucible::git::Git;
use crucible::queue::HandoffDir;
use crucible::sandbox::{ContainerRunner, Sandbox};

struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
    required: bool,
}

pub fn run(repo: &Path) -> Result<()> {
    let config = CrucibleConfig::load(repo)?;
    let git = Git::new(Duration::from_secs(config.vcs.timeout_secs));
    let runner = ContainerRunner::new(&config.sandbox);
    let handoff = HandoffDir::new(repo.join(&config.queue.root));

    let mut checks = Vec::new();

    checks.push(Check {
        name: "git repository",
        ok: git.is_repo(repo),
        detail: repo.display().to_string(),
        required: true,
    });

    checks.push(Check {
        name: "container engine",
        ok: runner.is_engine_available(),
        detail: config.sandbox.engine.clone(),
        required: true,
    });

    checks.push(Check {
        name: "sandbox image",
        ok: runner.is_image_available(),
        detail: config.sandbox.image.clone(),
        required: true,
    });

    let layout_ok = handoff.ensure_layout().is_ok();
    checks.push(Check {
        name: "handoff root writable",
        ok: layout_ok,
        detail: handoff.root().display().to_string(),
        required: true,
    });

    checks.push(Check {
        name: "repository clean",
        ok: git.is_dirty(repo).map(|dirty| !dirty).unwrap_or(false),
        detail: "uncommitted changes block task processing".to_owned(),
        required: false,
    });

    let mut failed_required = false;
    for check in &checks {
        let mark = if check.ok {
            "ok  "
        } else if check.required {
            failed_required = true;
            "FAIL"
        } else {
            "warn"
        };
        println!("[{mark}] {:<24} {}", check.name, check.detail);
    }

    if failed_required {
        anyhow::bail!("required checks failed; fix the items marked FAIL above");
    }
    println!("\nall required checks passed");
    Ok(())
}
